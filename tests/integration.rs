//! End-to-end tests driving the public `Scheduler` (and, where the public
//! surface doesn't reach far enough, the individual components it wires
//! together) through the six seed scenarios. Test doubles for the three
//! external collaborators live inline here rather than in a mock crate,
//! matching the scheduler module's own test style.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use nexus_scheduler::admission::Admission;
use nexus_scheduler::arbiter::Arbiter;
use nexus_scheduler::config::{
    ArbiterConfig, HealthConfig, RebalancerConfig, RegistryConfig, SchedulerConfig, StrategyConfig,
};
use nexus_scheduler::consensus::{ConsensusClient, ConsensusError};
use nexus_scheduler::health::HealthMonitor;
use nexus_scheduler::id::{IdempotencyKey, NodeId};
use nexus_scheduler::membership::{MembershipEvent, MembershipSource};
use nexus_scheduler::placement_log::PlacementLog;
use nexus_scheduler::rebalancer::Rebalancer;
use nexus_scheduler::registry::Registry;
use nexus_scheduler::strategies::{LeastEffectiveLoadStrategy, StrategyRegistry, WeightedRoundRobinStrategy};
use nexus_scheduler::task::{NodeCapacity, ResourceMetrics, Task, TaskRequirements};
use nexus_scheduler::worker::{RunTaskOutcome, WorkerClient, WorkerError};
use nexus_scheduler::{Scheduler, SchedulerError, TerminalState};

/// A [`WorkerClient`] double: records which nodes were called, optionally
/// fails a configured set of nodes, and can simulate dispatch latency.
#[derive(Clone, Default)]
struct RecordingWorker {
    calls: Arc<DashMap<NodeId, u32>>,
    fail_nodes: Arc<DashMap<NodeId, ()>>,
    delay: Option<Duration>,
}

impl RecordingWorker {
    fn calls_for(&self, node_id: NodeId) -> u32 {
        self.calls.get(&node_id).map(|c| *c).unwrap_or(0)
    }
}

impl WorkerClient for RecordingWorker {
    async fn run_task(
        &self,
        node_id: NodeId,
        _task: &Task,
    ) -> std::result::Result<RunTaskOutcome, WorkerError> {
        *self.calls.entry(node_id).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_nodes.contains_key(&node_id) {
            return Err(WorkerError::Transient("simulated worker failure".to_string()));
        }
        Ok(RunTaskOutcome { latency_ms: 10.0, throughput: 50.0 })
    }

    async fn cancel(&self, _node_id: NodeId, _task: &Task) {}
}

/// A [`ConsensusClient`] double whose leadership and propose outcome are
/// fixed at construction.
struct FakeConsensus {
    leader: bool,
}

impl ConsensusClient for FakeConsensus {
    async fn propose(&self, _entry: Vec<u8>) -> std::result::Result<u64, ConsensusError> {
        Ok(1)
    }

    async fn is_leader(&self) -> bool {
        self.leader
    }

    async fn next_committed(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A [`MembershipSource`] double that replays a fixed list of events, then
/// blocks forever rather than signalling end-of-stream (mirroring a real
/// membership feed, which never naturally terminates).
struct FixedMembership {
    queue: AsyncMutex<VecDeque<MembershipEvent>>,
}

impl FixedMembership {
    fn new(events: Vec<MembershipEvent>) -> Self {
        Self { queue: AsyncMutex::new(events.into()) }
    }
}

impl MembershipSource for FixedMembership {
    async fn next_event(&self) -> Option<MembershipEvent> {
        let mut queue = self.queue.lock().await;
        if let Some(event) = queue.pop_front() {
            return Some(event);
        }
        drop(queue);
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

fn node_up(label: &str) -> MembershipEvent {
    MembershipEvent::NodeUp {
        node_id: NodeId::from(label),
        address: format!("addr-{label}"),
        capacity: NodeCapacity::default(),
    }
}

async fn scheduler_with_nodes(
    config: SchedulerConfig,
    worker: RecordingWorker,
    consensus: FakeConsensus,
    labels: &[&str],
) -> Scheduler<RecordingWorker, FakeConsensus> {
    let scheduler = Scheduler::new(config, worker, consensus);
    let events = labels.iter().map(|l| node_up(l)).collect();
    scheduler.spawn_membership_feed(FixedMembership::new(events));
    // Give the background membership-feed task a chance to register the
    // nodes before the first submission runs admission.
    tokio::time::sleep(Duration::from_millis(20)).await;
    scheduler
}

#[tokio::test]
async fn warm_fallback_recovers_from_a_transient_failure() {
    let node_a = NodeId::from("a");
    let node_b = NodeId::from("b");
    // resource-aware breaks ties on raw node id order; fail whichever of the
    // two would be chosen as primary so the dispatcher is forced onto the
    // warm fallback it also returned.
    let (primary, fallback) = if node_a < node_b { (node_a, node_b) } else { (node_b, node_a) };

    let worker = RecordingWorker::default();
    worker.fail_nodes.insert(primary, ());

    let scheduler =
        scheduler_with_nodes(SchedulerConfig::default(), worker.clone(), FakeConsensus { leader: false }, &["a", "b"])
            .await;

    let mut task = Task::new("inference", TaskRequirements::default());
    task.strategy_override = Some("resource-aware".to_string());

    let task_id = scheduler.submit(task).await.unwrap();
    let terminal = scheduler.await_result(task_id).await.unwrap();

    assert!(matches!(terminal, TerminalState::Succeeded(_)));
    assert!(worker.calls_for(primary) >= 1, "the failing primary should still have been tried first");
    assert!(worker.calls_for(fallback) >= 1, "the fallback should have been tried after the primary failed");
}

#[tokio::test]
async fn circuit_opens_after_repeated_failures_and_node_becomes_ineligible() {
    let worker = RecordingWorker::default();
    worker.fail_nodes.insert(NodeId::from("only"), ());

    let mut config = SchedulerConfig::default();
    config.health.failure_threshold = 2;

    let scheduler = scheduler_with_nodes(config, worker, FakeConsensus { leader: false }, &["only"]).await;

    for _ in 0..2 {
        let task = Task::new("inference", TaskRequirements::default());
        let task_id = scheduler.submit(task).await.unwrap();
        let terminal = scheduler.await_result(task_id).await.unwrap();
        assert!(matches!(terminal, TerminalState::Failed(_)));
    }

    let snapshot = scheduler.snapshot().await;
    assert_eq!(
        snapshot.circuit_states.get(&NodeId::from("only")).copied(),
        Some(nexus_scheduler::health::CircuitState::Open)
    );

    let task = Task::new("inference", TaskRequirements::default());
    let result = scheduler.submit(task).await;
    assert!(matches!(result, Err(SchedulerError::NoNodesAvailable { .. })));
}

#[tokio::test]
async fn locality_cache_sticks_to_the_first_node_chosen() {
    let worker = RecordingWorker::default();
    let scheduler =
        scheduler_with_nodes(SchedulerConfig::default(), worker.clone(), FakeConsensus { leader: false }, &["a", "b"])
            .await;

    for _ in 0..2 {
        let mut task = Task::new("inference", TaskRequirements::default()).with_model("model-1");
        task.strategy_override = Some("locality-aware".to_string());
        let task_id = scheduler.submit(task).await.unwrap();
        let terminal = scheduler.await_result(task_id).await.unwrap();
        assert!(matches!(terminal, TerminalState::Succeeded(_)));
    }

    let a_calls = worker.calls_for(NodeId::from("a"));
    let b_calls = worker.calls_for(NodeId::from("b"));
    assert_eq!(a_calls + b_calls, 2);
    assert!(a_calls == 2 || b_calls == 2, "both submissions for the same model should land on the same node");
}

#[tokio::test]
async fn adaptive_strategy_serves_traffic_and_tracks_predictor_accuracy() {
    let worker = RecordingWorker::default();
    let scheduler =
        scheduler_with_nodes(SchedulerConfig::default(), worker, FakeConsensus { leader: false }, &["a", "b"]).await;

    for _ in 0..10 {
        let mut task = Task::new("inference", TaskRequirements::default());
        task.strategy_override = Some("adaptive".to_string());
        let task_id = scheduler.submit(task).await.unwrap();
        let terminal = scheduler.await_result(task_id).await.unwrap();
        assert!(matches!(terminal, TerminalState::Succeeded(_)));
    }

    let snapshot = scheduler.snapshot().await;
    assert!(snapshot.recent_arbiter_decisions.iter().any(|d| d.strategy == "adaptive"));
    assert!((0.0..=1.0).contains(&snapshot.predictor_mean_accuracy));
}

#[tokio::test]
async fn backpressure_rejects_once_the_global_queue_is_saturated() {
    let worker = RecordingWorker { delay: Some(Duration::from_millis(200)), ..Default::default() };

    let mut config = SchedulerConfig::default();
    config.admission.queue_max_per_node = 1;
    config.admission.queue_max_global = 1;

    let scheduler = scheduler_with_nodes(config, worker, FakeConsensus { leader: false }, &["a"]).await;

    let first = Task::new("inference", TaskRequirements::default());
    let _first_id = scheduler.submit(first).await.unwrap();

    // The first task is still in flight (worker sleeps 200ms); the global
    // queue is already at its cap of 1.
    let second = Task::new("inference", TaskRequirements::default());
    let result = scheduler.submit(second).await;
    assert!(matches!(result, Err(SchedulerError::Busy { retry_after_ms, .. }) if retry_after_ms > 0));
}

struct NoopConsensus;

impl ConsensusClient for NoopConsensus {
    async fn propose(&self, _entry: Vec<u8>) -> std::result::Result<u64, ConsensusError> {
        Ok(0)
    }
    async fn is_leader(&self) -> bool {
        true
    }
    async fn next_committed(&self) -> Option<Vec<u8>> {
        None
    }
}

#[tokio::test]
async fn rebalance_migrates_queued_work_away_from_an_overloaded_node() {
    let registry = Arc::new(Registry::new(RegistryConfig::default()));
    let metrics = Arc::new(nexus_scheduler::metrics::MetricsCollector::new());
    let health = Arc::new(HealthMonitor::new(
        HealthConfig::default(),
        RegistryConfig::default().stale_after,
        registry.clone(),
        metrics.clone(),
    ));

    let mut strategy_registry = StrategyRegistry::new();
    strategy_registry.register(Arc::new(WeightedRoundRobinStrategy::new(StrategyConfig::default())));
    strategy_registry.register(Arc::new(LeastEffectiveLoadStrategy::new(StrategyConfig::default())));
    let arbiter = Arc::new(Arbiter::new(
        ArbiterConfig {
            default_strategy: "weighted-round-robin".to_string(),
            load_variance_threshold: 0.1,
            ..Default::default()
        },
        strategy_registry,
    ));

    let placement_log = Arc::new(PlacementLog::new(NoopConsensus));
    let admission = Arc::new(Admission::new(
        Default::default(),
        registry.clone(),
        health.clone(),
        arbiter.clone(),
        metrics.clone(),
        placement_log.clone(),
    ));

    let hot = NodeId::from("hot");
    let cold = NodeId::from("cold");
    registry.register(hot, "addr-hot", NodeCapacity::default()).await;
    registry.register(cold, "addr-cold", NodeCapacity::default()).await;
    registry
        .update_metrics(
            hot,
            ResourceMetrics {
                cpu_percent: 100.0,
                memory_percent: 100.0,
                gpu_percent: 100.0,
                network_percent: 100.0,
                ..Default::default()
            },
        )
        .await;
    registry.update_metrics(cold, ResourceMetrics::default()).await;

    // Admit work onto the hot node without dispatching it, simulating a
    // backlog the rebalancer should see as migration candidates. Sticky
    // assignment (normally used for idempotency-key affinity) is repurposed
    // here purely to pin each task to "hot" deterministically, since the
    // arbitration path alone wouldn't reliably route there for a loaded node.
    for i in 0..5 {
        let key = IdempotencyKey::new(format!("backlog-{i}"));
        placement_log.propose_sticky(key.clone(), hot).await.unwrap();
        let task = Task::new("inference", TaskRequirements::default()).with_idempotency_key(key);
        let (_, admitted) = admission.admit(task).await.unwrap();
        assert_eq!(admitted.primary, hot);
    }

    let rebalancer = Rebalancer::new(
        RebalancerConfig { imbalance_threshold: 0.1, ..Default::default() },
        registry.clone(),
        admission.clone(),
        arbiter,
        placement_log,
        metrics,
    );

    let plans = rebalancer.run_cycle().await;
    assert!(!plans.is_empty(), "a 95%/2% split should trigger at least one migration plan");
    assert!(plans.iter().all(|p| p.from == hot && p.to == cold));
}
