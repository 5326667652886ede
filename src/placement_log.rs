//! §4.9 Replicated Placement Log — the subset of scheduling state that must
//! survive leader change. Writes are serialised through the external
//! consensus service; reads are served from local materialised state. All
//! other scheduler state is soft and rebuilt from heartbeats after failover.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::consensus::ConsensusClient;
use crate::error::{Result, SchedulerError};
use crate::id::{IdempotencyKey, ModelId, NodeId};
use crate::time::Timestamp;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// A versioned, checkpointable record of sticky state. Mismatched versions
/// cause the scheduler to refuse to start rather than silently misinterpret
/// a foreign layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementCheckpoint {
    pub version: u32,
    pub sticky_assignments: HashMap<IdempotencyKey, NodeId>,
    pub locality_snapshot: HashMap<ModelId, Vec<NodeId>>,
    pub taken_at: Timestamp,
}

impl PlacementCheckpoint {
    pub fn validate_schema(&self) -> Result<()> {
        if self.version != CURRENT_SCHEMA_VERSION {
            return Err(SchedulerError::SchemaMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// A replicated log entry. Kept small and serde-friendly since it is an
/// opaque blob as far as the consensus service is concerned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlacementEntry {
    StickyAssignment { key: IdempotencyKey, node_id: NodeId },
    RevokeSticky { key: IdempotencyKey },
    Migration { task_ids: Vec<crate::id::TaskId>, from: NodeId, to: NodeId },
    Checkpoint(PlacementCheckpoint),
}

/// Locally materialised replicated state, kept current by applying
/// committed entries and written through the consensus client.
pub struct PlacementLog<C: ConsensusClient> {
    consensus: C,
    sticky_assignments: RwLock<HashMap<IdempotencyKey, NodeId>>,
    locality_snapshot: RwLock<HashMap<ModelId, Vec<NodeId>>>,
}

impl<C: ConsensusClient> PlacementLog<C> {
    pub fn new(consensus: C) -> Self {
        Self {
            consensus,
            sticky_assignments: RwLock::new(HashMap::new()),
            locality_snapshot: RwLock::new(HashMap::new()),
        }
    }

    pub fn sticky_node(&self, key: &IdempotencyKey) -> Option<NodeId> {
        self.sticky_assignments.read().get(key).copied()
    }

    /// Whether this replica currently holds consensus leadership. The
    /// Rebalancer only runs its cycle when this returns `true`.
    pub async fn is_leader(&self) -> bool {
        self.consensus.is_leader().await
    }

    /// Propose a new sticky assignment. On `ConsensusUnavailable`, soft
    /// state is not updated here — callers continue using whatever sticky
    /// assignment (if any) is already materialised until the next commit.
    pub async fn propose_sticky(&self, key: IdempotencyKey, node_id: NodeId) -> Result<()> {
        let entry = PlacementEntry::StickyAssignment { key: key.clone(), node_id };
        let bytes = serde_json::to_vec(&entry)?;
        match self.consensus.propose(bytes).await {
            Ok(_) => {
                self.sticky_assignments.write().insert(key, node_id);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to propose sticky assignment");
                Err(SchedulerError::ConsensusUnavailable { message: e.0 })
            }
        }
    }

    pub async fn revoke_sticky(&self, key: IdempotencyKey) -> Result<()> {
        let entry = PlacementEntry::RevokeSticky { key: key.clone() };
        let bytes = serde_json::to_vec(&entry)?;
        self.consensus
            .propose(bytes)
            .await
            .map_err(|e| SchedulerError::ConsensusUnavailable { message: e.0 })?;
        self.sticky_assignments.write().remove(&key);
        Ok(())
    }

    pub async fn propose_migration(
        &self,
        task_ids: Vec<crate::id::TaskId>,
        from: NodeId,
        to: NodeId,
    ) -> Result<()> {
        let entry = PlacementEntry::Migration { task_ids, from, to };
        let bytes = serde_json::to_vec(&entry)?;
        self.consensus
            .propose(bytes)
            .await
            .map_err(|e| SchedulerError::ConsensusUnavailable { message: e.0 })?;
        Ok(())
    }

    /// Checkpoint the locality cache. Called on `cache_checkpoint_interval`.
    pub async fn checkpoint(&self) -> Result<()> {
        let checkpoint = PlacementCheckpoint {
            version: CURRENT_SCHEMA_VERSION,
            sticky_assignments: self.sticky_assignments.read().clone(),
            locality_snapshot: self.locality_snapshot.read().clone(),
            taken_at: Timestamp::now(),
        };
        let entry = PlacementEntry::Checkpoint(checkpoint);
        let bytes = serde_json::to_vec(&entry)?;
        self.consensus
            .propose(bytes)
            .await
            .map_err(|e| SchedulerError::ConsensusUnavailable { message: e.0 })?;
        Ok(())
    }

    pub fn update_locality_snapshot(&self, model_id: ModelId, nodes: Vec<NodeId>) {
        self.locality_snapshot.write().insert(model_id, nodes);
    }

    /// Load and validate a checkpoint recovered from disk or the consensus
    /// log's log-replay path; refuses a schema mismatch outright.
    pub fn restore(&self, checkpoint: PlacementCheckpoint) -> Result<()> {
        checkpoint.validate_schema()?;
        *self.sticky_assignments.write() = checkpoint.sticky_assignments;
        *self.locality_snapshot.write() = checkpoint.locality_snapshot;
        Ok(())
    }

    /// Apply a committed entry observed from `ConsensusClient::next_committed`.
    pub fn apply(&self, bytes: &[u8]) -> Result<()> {
        let entry: PlacementEntry = serde_json::from_slice(bytes)?;
        match entry {
            PlacementEntry::StickyAssignment { key, node_id } => {
                self.sticky_assignments.write().insert(key, node_id);
            }
            PlacementEntry::RevokeSticky { key } => {
                self.sticky_assignments.write().remove(&key);
            }
            PlacementEntry::Migration { .. } => {
                // Migrations are soft-state driven; non-leader replicas just
                // observe them for visibility, the registry is rebuilt from
                // heartbeats regardless.
            }
            PlacementEntry::Checkpoint(checkpoint) => {
                self.restore(checkpoint)?;
            }
        }
        Ok(())
    }
}
