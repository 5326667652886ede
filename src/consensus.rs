//! The distributed consensus interface, consumed by the Rebalancer and the
//! Replicated Placement Log. Entries are opaque blobs defined by
//! [`crate::placement_log`].

/// An index committed by the consensus log.
pub type CommittedIndex = u64;

#[derive(Debug, Clone)]
pub struct ConsensusError(pub String);

impl std::fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consensus unavailable: {}", self.0)
    }
}

/// `propose`/`subscribe` against the replicated log. The scheduler treats
/// the underlying consensus protocol as a black box.
pub trait ConsensusClient: Send + Sync {
    async fn propose(&self, entry: Vec<u8>) -> Result<CommittedIndex, ConsensusError>;

    /// Whether this replica currently believes itself to be the leader.
    /// The Rebalancer only runs its cycle when this returns `true`.
    async fn is_leader(&self) -> bool;

    async fn next_committed(&self) -> Option<Vec<u8>>;
}
