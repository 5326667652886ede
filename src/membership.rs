//! The membership interface, consumed by the Node Registry. Ordering per
//! node is preserved by the source; ordering across nodes is not.

use crate::id::NodeId;
use crate::task::{NodeCapacity, ResourceMetrics};

#[derive(Debug, Clone)]
pub enum MembershipEvent {
    NodeUp { node_id: NodeId, address: String, capacity: NodeCapacity },
    NodeDown { node_id: NodeId },
    Heartbeat { node_id: NodeId, metrics: ResourceMetrics },
}

/// The peer-to-peer membership service's event stream, as consumed by the
/// scheduler's registry-feeding loop.
pub trait MembershipSource: Send + Sync {
    async fn next_event(&self) -> Option<MembershipEvent>;
}
