//! The worker (inference engine) interface, consumed by the Dispatcher.
//! The scheduler never interprets the task payload or the model weights —
//! it forwards opaque bytes and reads back latency/throughput/outcome.

use crate::id::{ModelId, NodeId};
use crate::task::Task;

/// Outcome of a single `run_task` RPC.
#[derive(Debug, Clone)]
pub struct RunTaskOutcome {
    pub latency_ms: f64,
    pub throughput: f64,
}

/// Error kinds a worker can return, per §6/§7.
#[derive(Debug, Clone)]
pub enum WorkerError {
    /// Retriable: send to the next-best candidate.
    Transient(String),
    /// Not retriable: propagate to the caller.
    Permanent(String),
    /// Apply stronger backpressure to this node.
    Overloaded,
    /// The node claims the model is not resident; invalidate locality cache.
    NotFound { model_id: ModelId },
}

/// The inference engine's "run a task" endpoint, one instance per worker.
/// Implemented by the transport layer; test doubles live alongside the
/// dispatcher's own tests.
pub trait WorkerClient: Send + Sync {
    async fn run_task(
        &self,
        node_id: NodeId,
        task: &Task,
    ) -> std::result::Result<RunTaskOutcome, WorkerError>;

    /// Best-effort cancellation of an in-flight call; the dispatcher always
    /// releases the node's queue slot regardless of whether this succeeds.
    async fn cancel(&self, node_id: NodeId, task: &Task);
}
