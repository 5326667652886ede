//! §4.6 Admission & Queue — bounded per-node queues and global backpressure.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::arbiter::Arbiter;
use crate::config::AdmissionConfig;
use crate::consensus::ConsensusClient;
use crate::error::{Result, SchedulerError};
use crate::health::HealthMonitor;
use crate::id::{IdempotencyKey, NodeId, TaskId};
use crate::metrics::{names, MetricsCollector};
use crate::placement_log::PlacementLog;
use crate::registry::Registry;
use crate::strategies::Strategy;
use crate::task::{Task, TaskState};
use crate::time::Timestamp;

/// Outcome of a successful admission: the node the task was enqueued on,
/// any warm-fallback nodes the strategy also returned (used by the
/// Dispatcher's single retry), and the strategy that made the choice (so
/// the Dispatcher can feed its outcome back to the same strategy).
#[derive(Clone)]
pub struct Admitted {
    pub primary: NodeId,
    pub fallbacks: Vec<NodeId>,
    pub strategy: Arc<dyn Strategy>,
}

impl std::fmt::Debug for Admitted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admitted")
            .field("primary", &self.primary)
            .field("fallbacks", &self.fallbacks)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// Per-node FIFO queue plus a cheap atomic depth counter so admission
/// decisions don't need to acquire the queue lock just to check room.
struct NodeQueue {
    depth: AtomicUsize,
    tasks: tokio::sync::Mutex<VecDeque<Task>>,
}

impl NodeQueue {
    fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            tasks: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }
}

pub struct Admission<C: ConsensusClient> {
    config: AdmissionConfig,
    registry: Arc<Registry>,
    health: Arc<HealthMonitor>,
    arbiter: Arc<Arbiter>,
    metrics: Arc<MetricsCollector>,
    placement_log: Arc<PlacementLog<C>>,
    queues: RwLock<HashMap<NodeId, Arc<NodeQueue>>>,
    global_depth: AtomicUsize,
    /// Idempotency key -> the task id of the first submission seen for it,
    /// so repeated submissions correlate to the same client-visible task.
    idempotency_tasks: RwLock<HashMap<IdempotencyKey, TaskId>>,
}

impl<C: ConsensusClient> Admission<C> {
    pub fn new(
        config: AdmissionConfig,
        registry: Arc<Registry>,
        health: Arc<HealthMonitor>,
        arbiter: Arc<Arbiter>,
        metrics: Arc<MetricsCollector>,
        placement_log: Arc<PlacementLog<C>>,
    ) -> Self {
        Self {
            config,
            registry,
            health,
            arbiter,
            metrics,
            placement_log,
            queues: RwLock::new(HashMap::new()),
            global_depth: AtomicUsize::new(0),
            idempotency_tasks: RwLock::new(HashMap::new()),
        }
    }

    async fn queue_for(&self, node_id: NodeId) -> Arc<NodeQueue> {
        if let Some(q) = self.queues.read().await.get(&node_id) {
            return q.clone();
        }
        let mut queues = self.queues.write().await;
        queues.entry(node_id).or_insert_with(|| Arc::new(NodeQueue::new())).clone()
    }

    /// Run arbitration + selection against the current eligible candidate
    /// set, retrying on a different candidate set when the chosen node's
    /// queue is full, up to `reselect_attempts`. Rejects with `Busy` when
    /// the global cap is reached or attempts are exhausted.
    pub async fn admit(&self, mut task: Task) -> Result<(Task, Admitted)> {
        if task.is_past_deadline(Timestamp::now()) {
            task.state = TaskState::RejectedDeadlineExceeded;
            return Err(SchedulerError::DeadlineExceeded { task_id: task.task_id });
        }

        if let Some(key) = task.idempotency_key.clone() {
            task.task_id = *self
                .idempotency_tasks
                .write()
                .await
                .entry(key)
                .or_insert(task.task_id);
        }

        if self.global_depth.load(Ordering::Acquire) >= self.config.queue_max_global {
            self.metrics.increment_counter(names::ADMISSION_REJECTED, 1);
            return Err(SchedulerError::Busy {
                task_id: task.task_id,
                retry_after_ms: self.retry_after_hint().await,
            });
        }

        // A live sticky assignment routes directly to its node, bypassing
        // arbitration, as long as that node has not tripped its breaker.
        if let Some(key) = task.idempotency_key.clone() {
            if let Some(node_id) = self.placement_log.sticky_node(&key) {
                if self.health.is_eligible(node_id) && self.registry.get(node_id).await.is_some() {
                    return self.enqueue_sticky(task, node_id).await;
                }
                warn!(%node_id, "sticky assignment no longer eligible, reselecting");
            }
        }

        let mut excluded: Vec<NodeId> = Vec::new();
        let mut attempts_left = self.config.reselect_attempts + 1;

        while attempts_left > 0 {
            attempts_left -= 1;

            let mut candidates: Vec<_> = self
                .registry
                .list_available()
                .await
                .into_iter()
                .filter(|n| self.health.is_eligible(n.node_id))
                .filter(|n| !excluded.contains(&n.node_id))
                .collect();
            candidates.sort_by_key(|n| n.node_id);

            if candidates.is_empty() {
                return Err(SchedulerError::NoNodesAvailable { task_id: task.task_id });
            }

            let strategy = self.arbiter.choose(&task, &candidates)?;
            let chosen = strategy.select(&task, &candidates)?;
            let primary = chosen[0];

            let queue = self.queue_for(primary).await;
            let depth = queue.depth.load(Ordering::Acquire);
            if depth < self.config.queue_max_per_node {
                queue.depth.fetch_add(1, Ordering::AcqRel);
                queue.tasks.lock().await.push_back(task.clone());
                self.global_depth.fetch_add(1, Ordering::AcqRel);
                self.metrics.increment_counter(names::ADMISSION_ACCEPTED, 1);

                if let Some(key) = task.idempotency_key.clone() {
                    if let Err(err) = self.placement_log.propose_sticky(key, primary).await {
                        warn!(%err, "sticky assignment not committed, continuing on soft state");
                    }
                }

                task.state = TaskState::Dispatched;
                return Ok((
                    task,
                    Admitted {
                        primary,
                        fallbacks: chosen.into_iter().skip(1).collect(),
                        strategy,
                    },
                ));
            }

            warn!(node_id = %primary, depth, "node queue full, reselecting");
            excluded.push(primary);
        }

        self.metrics.increment_counter(names::ADMISSION_REJECTED, 1);
        Err(SchedulerError::Busy {
            task_id: task.task_id,
            retry_after_ms: self.retry_after_hint().await,
        })
    }

    /// Enqueue directly onto a sticky node, skipping arbitration. Unlike the
    /// general path, a full queue here is not retried against another node —
    /// that would defeat the stickiness the caller is relying on.
    async fn enqueue_sticky(&self, mut task: Task, node_id: NodeId) -> Result<(Task, Admitted)> {
        let queue = self.queue_for(node_id).await;
        let depth = queue.depth.load(Ordering::Acquire);
        if depth >= self.config.queue_max_per_node {
            self.metrics.increment_counter(names::ADMISSION_REJECTED, 1);
            return Err(SchedulerError::Busy {
                task_id: task.task_id,
                retry_after_ms: self.retry_after_hint().await,
            });
        }

        queue.depth.fetch_add(1, Ordering::AcqRel);
        queue.tasks.lock().await.push_back(task.clone());
        self.global_depth.fetch_add(1, Ordering::AcqRel);
        self.metrics.increment_counter(names::ADMISSION_ACCEPTED, 1);

        // Sticky routing bypasses arbitration, but the dispatcher still
        // needs a strategy instance to feed the outcome back into.
        let strategy = self.arbiter.default_strategy()?;

        task.state = TaskState::Dispatched;
        Ok((
            task,
            Admitted {
                primary: node_id,
                fallbacks: Vec::new(),
                strategy,
            },
        ))
    }

    /// Release a node's queue slot once the dispatcher has finished with
    /// the task, whether it succeeded, failed, or was cancelled.
    pub async fn release(&self, node_id: NodeId) {
        if let Some(queue) = self.queues.read().await.get(&node_id) {
            let mut tasks = queue.tasks.lock().await;
            if tasks.pop_front().is_some() {
                queue.depth.fetch_sub(1, Ordering::AcqRel);
                self.global_depth.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Queued (not yet dispatched) tasks for a node, used by the rebalancer
    /// to pick migration candidates.
    pub async fn queued_tasks(&self, node_id: NodeId) -> Vec<Task> {
        match self.queues.read().await.get(&node_id) {
            Some(q) => q.tasks.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn queue_depth(&self, node_id: NodeId) -> usize {
        // Best-effort synchronous peek is not available without the lock;
        // callers needing an exact value should use `queued_tasks().len()`.
        let _ = node_id;
        self.global_depth.load(Ordering::Acquire)
    }

    async fn retry_after_hint(&self) -> u64 {
        // Derived from queue depth: a fuller global queue implies a longer
        // expected wait before a slot frees up.
        let depth = self.global_depth.load(Ordering::Acquire) as u64;
        let cap = self.config.queue_max_global.max(1) as u64;
        (depth * 1000 / cap).clamp(10, 5000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::Arbiter;
    use crate::config::{ArbiterConfig, HealthConfig, RegistryConfig, StrategyConfig};
    use crate::consensus::ConsensusError;
    use crate::strategies::{StrategyRegistry, WeightedRoundRobinStrategy};
    use crate::task::{NodeCapacity, TaskRequirements};

    struct NoopConsensus;

    impl ConsensusClient for NoopConsensus {
        async fn propose(&self, _entry: Vec<u8>) -> std::result::Result<u64, ConsensusError> {
            Ok(0)
        }
        async fn is_leader(&self) -> bool {
            false
        }
        async fn next_committed(&self) -> Option<Vec<u8>> {
            None
        }
    }

    async fn harness(queue_max_per_node: usize) -> (Admission<NoopConsensus>, Arc<Registry>) {
        let registry = Arc::new(Registry::new(RegistryConfig::default()));
        let metrics = Arc::new(MetricsCollector::new());
        let health = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            RegistryConfig::default().stale_after,
            registry.clone(),
            metrics.clone(),
        ));

        let mut strategy_registry = StrategyRegistry::new();
        strategy_registry.register(Arc::new(WeightedRoundRobinStrategy::new(StrategyConfig::default())));
        let arbiter = Arc::new(Arbiter::new(
            ArbiterConfig { default_strategy: "weighted-round-robin".to_string(), ..Default::default() },
            strategy_registry,
        ));

        let node_id = NodeId::from("a");
        registry.register(node_id, "addr", NodeCapacity::default()).await;

        let mut config = AdmissionConfig::default();
        config.queue_max_per_node = queue_max_per_node;
        config.queue_max_global = 1000;
        let placement_log = Arc::new(PlacementLog::new(NoopConsensus));
        (
            Admission::new(config, registry.clone(), health, arbiter, metrics, placement_log),
            registry,
        )
    }

    #[tokio::test]
    async fn admits_when_room_available() {
        let (admission, _registry) = harness(64).await;
        let task = Task::new("inference", TaskRequirements::default());
        let (_, admitted) = admission.admit(task).await.unwrap();
        assert_eq!(admitted.primary, NodeId::from("a"));
    }

    #[tokio::test]
    async fn past_deadline_is_rejected_immediately() {
        let (admission, _registry) = harness(64).await;
        let task = Task::new("inference", TaskRequirements::default())
            .with_deadline(Timestamp::now());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let result = admission.admit(task).await;
        assert!(matches!(result, Err(SchedulerError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn busy_when_every_node_queue_is_full() {
        let (admission, _registry) = harness(1).await;
        let first = Task::new("inference", TaskRequirements::default());
        admission.admit(first).await.unwrap();

        let second = Task::new("inference", TaskRequirements::default());
        let result = admission.admit(second).await;
        assert!(matches!(result, Err(SchedulerError::Busy { retry_after_ms, .. }) if retry_after_ms > 0));
    }

    #[tokio::test]
    async fn release_frees_the_slot() {
        let (admission, _registry) = harness(1).await;
        let task = Task::new("inference", TaskRequirements::default());
        admission.admit(task).await.unwrap();
        admission.release(NodeId::from("a")).await;

        let second = Task::new("inference", TaskRequirements::default());
        assert!(admission.admit(second).await.is_ok());
    }

    #[tokio::test]
    async fn repeated_idempotency_key_reuses_task_id_and_sticks_to_the_same_node() {
        let (admission, registry) = harness(64).await;
        registry.register(NodeId::from("b"), "addr-b", NodeCapacity::default()).await;

        let first = Task::new("inference", TaskRequirements::default())
            .with_idempotency_key("client-key-1");
        let (first_task, first_admitted) = admission.admit(first).await.unwrap();

        let second = Task::new("inference", TaskRequirements::default())
            .with_idempotency_key("client-key-1");
        let (second_task, second_admitted) = admission.admit(second).await.unwrap();

        assert_eq!(first_task.task_id, second_task.task_id);
        assert_eq!(first_admitted.primary, second_admitted.primary);
    }
}
