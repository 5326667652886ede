//! Composition root: wires the Node Registry, Health Monitor, Predictor,
//! History, Strategy Set, Arbiter, Admission, Dispatcher, Rebalancer, and
//! Replicated Placement Log into the client-facing submit/await interface
//! and a read-only admin/observability surface.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::admission::{Admission, Admitted};
use crate::arbiter::{Arbiter, ArbitrationDecision};
use crate::config::SchedulerConfig;
use crate::consensus::ConsensusClient;
use crate::error::{Result, SchedulerError};
use crate::health::{CircuitState, HealthMonitor};
use crate::history::History;
use crate::id::{NodeId, TaskId};
use crate::membership::{MembershipEvent, MembershipSource};
use crate::metrics::MetricsCollector;
use crate::placement_log::PlacementLog;
use crate::predictor::Predictor;
use crate::rebalancer::Rebalancer;
use crate::registry::Registry;
use crate::strategies::{
    AdaptiveStrategy, LeastEffectiveLoadStrategy, LocalityAwareStrategy, PredictiveStrategy,
    ResourceAwareStrategy, Strategy, StrategyRegistry, WeightedRoundRobinStrategy,
};
use crate::task::{NodeInfo, Task};
use crate::worker::{RunTaskOutcome, WorkerClient};

/// A point-in-time, read-only view of the scheduler, for the admin and
/// observability surface. Never mutated by its consumer.
pub struct SchedulerSnapshot {
    pub nodes: Vec<NodeInfo>,
    pub circuit_states: HashMap<NodeId, CircuitState>,
    pub recent_arbiter_decisions: Vec<ArbitrationDecision>,
    pub recent_load_snapshots: Vec<crate::task::LoadSnapshot>,
    pub predictor_mean_accuracy: f64,
    pub strategy_names: Vec<String>,
}

/// The terminal outcome of a submitted task, returned by [`Scheduler::await_result`].
#[derive(Debug, Clone)]
pub enum TerminalState {
    Succeeded(RunTaskOutcome),
    Failed(SchedulerError),
}

pub struct Scheduler<W: WorkerClient + 'static, C: ConsensusClient + 'static> {
    config: SchedulerConfig,
    registry: Arc<Registry>,
    health: Arc<HealthMonitor>,
    history: Arc<History>,
    arbiter: Arc<Arbiter>,
    admission: Arc<Admission<C>>,
    dispatcher: Arc<crate::dispatcher::Dispatcher<W>>,
    rebalancer: Arc<Rebalancer<C>>,
    placement_log: Arc<PlacementLog<C>>,
    locality: Arc<LocalityAwareStrategy>,
    predictor: Arc<Predictor>,
    metrics: Arc<MetricsCollector>,
    pending: Arc<DashMap<TaskId, oneshot::Receiver<TerminalState>>>,
}

impl<W: WorkerClient + 'static, C: ConsensusClient + 'static> Scheduler<W, C> {
    pub fn new(config: SchedulerConfig, worker: W, consensus: C) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(Registry::new(config.registry.clone()));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            config.registry.stale_after,
            registry.clone(),
            metrics.clone(),
        ));
        let history = Arc::new(History::new(
            config.predictor.window,
            config.history.preferred_nodes_per_class,
            config.history.snapshot_buffer_size,
        ));
        let predictor = Arc::new(Predictor::new(config.predictor.clone(), history.clone()));

        let locality = Arc::new(LocalityAwareStrategy::new(config.strategies.clone()));

        let mut strategy_registry = StrategyRegistry::new();
        strategy_registry.register(Arc::new(WeightedRoundRobinStrategy::new(config.strategies.clone())));
        strategy_registry.register(Arc::new(LeastEffectiveLoadStrategy::new(config.strategies.clone())));
        strategy_registry.register(locality.clone() as Arc<dyn Strategy>);
        strategy_registry.register(Arc::new(PredictiveStrategy::new(config.strategies.clone(), predictor.clone())));
        strategy_registry.register(Arc::new(AdaptiveStrategy::new(
            config.strategies.clone(),
            predictor.clone(),
            history.clone(),
        )));
        strategy_registry.register(Arc::new(ResourceAwareStrategy::new(config.strategies.clone())));

        let arbiter = Arc::new(Arbiter::new(config.arbiter.clone(), strategy_registry));

        let placement_log = Arc::new(PlacementLog::new(consensus));

        let admission = Arc::new(Admission::new(
            config.admission.clone(),
            registry.clone(),
            health.clone(),
            arbiter.clone(),
            metrics.clone(),
            placement_log.clone(),
        ));

        let dispatcher = Arc::new(crate::dispatcher::Dispatcher::new(
            config.dispatcher.clone(),
            worker,
            registry.clone(),
            predictor.clone(),
            history.clone(),
            metrics.clone(),
            locality.clone(),
        ));

        let rebalancer = Arc::new(Rebalancer::new(
            config.rebalancer.clone(),
            registry.clone(),
            admission.clone(),
            arbiter.clone(),
            placement_log.clone(),
            metrics.clone(),
        ));

        Self {
            config,
            registry,
            health,
            history,
            arbiter,
            admission,
            dispatcher,
            rebalancer,
            placement_log,
            locality,
            predictor,
            metrics,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Admit and dispatch a task, returning its id immediately. The result
    /// is retrieved later via [`Self::await_result`]. On admission failure
    /// (no nodes, busy, deadline exceeded) the error is returned directly
    /// and no background work is started.
    pub async fn submit(&self, task: Task) -> Result<TaskId> {
        let task_id = task.task_id;
        let (task, admitted) = self.admission.admit(task).await?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(task_id, rx);
        self.spawn_dispatch(task, admitted, tx);

        Ok(task_id)
    }

    fn spawn_dispatch(&self, task: Task, admitted: Admitted, tx: oneshot::Sender<TerminalState>) {
        let dispatcher = self.dispatcher.clone();
        let admission = self.admission.clone();
        let health = self.health.clone();
        let primary = admitted.primary;

        tokio::spawn(async move {
            let result = dispatcher.dispatch(task, admitted).await;
            match &result {
                Ok(_) => health.record_success(primary).await,
                Err(_) => health.record_failure(primary).await,
            }
            admission.release(primary).await;

            let terminal = match result {
                Ok(outcome) => TerminalState::Succeeded(outcome),
                Err(err) => TerminalState::Failed(err),
            };
            let _ = tx.send(terminal);
        });
    }

    /// Await the terminal outcome of a previously submitted task. Returns
    /// `None` if the task id is unknown (already awaited, or never submitted).
    pub async fn await_result(&self, task_id: TaskId) -> Option<TerminalState> {
        let (_, rx) = self.pending.remove(&task_id)?;
        rx.await.ok()
    }

    /// Best-effort cancellation: asks the worker to cancel and releases the
    /// queue slot. The admission slot release happens from the spawned
    /// dispatch task regardless, so this only affects in-flight RPCs.
    pub async fn cancel(&self, node_id: NodeId, task: &Task) {
        self.dispatcher.cancel(node_id, task).await;
    }

    /// Feed membership events into the registry until the source is exhausted.
    pub fn spawn_membership_feed(&self, source: impl MembershipSource + 'static) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(event) = source.next_event().await {
                match event {
                    MembershipEvent::NodeUp { node_id, address, capacity } => {
                        registry.register(node_id, address, capacity).await;
                    }
                    MembershipEvent::NodeDown { node_id } => {
                        registry.deregister(node_id).await;
                    }
                    MembershipEvent::Heartbeat { node_id, metrics } => {
                        registry.update_metrics(node_id, metrics).await;
                    }
                }
            }
            warn!("membership event source exhausted");
        })
    }

    /// Start the health-check and rebalancer background loops.
    pub fn spawn_background_loops(&self) -> Vec<tokio::task::JoinHandle<()>> {
        info!("starting scheduler background loops");
        vec![self.health.clone().spawn(), self.rebalancer.clone().spawn()]
    }

    /// Periodically checkpoint the placement log's sticky/locality state.
    pub fn spawn_checkpoint_loop(&self) -> tokio::task::JoinHandle<()> {
        let placement_log = self.placement_log.clone();
        let locality = self.locality.clone();
        let interval = self.config.placement_log.cache_checkpoint_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for (model_id, nodes) in locality.cache_snapshot() {
                    placement_log.update_locality_snapshot(model_id, nodes);
                }
                if let Err(err) = placement_log.checkpoint().await {
                    warn!(%err, "placement log checkpoint failed");
                }
            }
        })
    }

    /// A read-only snapshot of scheduler state for the admin interface.
    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let nodes = self.registry.snapshot().await;
        let circuit_states = nodes
            .iter()
            .map(|n| (n.node_id, self.health.circuit_state(n.node_id)))
            .collect();

        SchedulerSnapshot {
            nodes,
            circuit_states,
            recent_arbiter_decisions: self.arbiter.recent_decisions(),
            recent_load_snapshots: self.history.recent_snapshots(50),
            predictor_mean_accuracy: self.predictor.mean_accuracy(),
            strategy_names: self.arbiter.strategy_names(),
        }
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusError;
    use crate::task::{NodeCapacity, TaskRequirements};
    use crate::worker::{RunTaskOutcome as Outcome, WorkerError};

    struct AlwaysSucceedsWorker;

    impl WorkerClient for AlwaysSucceedsWorker {
        async fn run_task(&self, _node_id: NodeId, _task: &Task) -> std::result::Result<Outcome, WorkerError> {
            Ok(Outcome { latency_ms: 5.0, throughput: 100.0 })
        }

        async fn cancel(&self, _node_id: NodeId, _task: &Task) {}
    }

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

    async fn scheduler_with_one_node() -> Scheduler<AlwaysSucceedsWorker, NoopConsensus> {
        let scheduler = Scheduler::new(SchedulerConfig::default(), AlwaysSucceedsWorker, NoopConsensus);
        scheduler.registry.register(NodeId::from("a"), "addr", NodeCapacity::default()).await;
        scheduler
    }

    #[tokio::test]
    async fn submit_and_await_result_round_trips() {
        let scheduler = scheduler_with_one_node().await;
        let task = Task::new("inference", TaskRequirements::default());
        let task_id = scheduler.submit(task).await.unwrap();

        let terminal = scheduler.await_result(task_id).await.unwrap();
        assert!(matches!(terminal, TerminalState::Succeeded(_)));
    }

    #[tokio::test]
    async fn submit_with_no_nodes_fails_immediately() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), AlwaysSucceedsWorker, NoopConsensus);
        let task = Task::new("inference", TaskRequirements::default());
        let result = scheduler.submit(task).await;
        assert!(matches!(result, Err(SchedulerError::NoNodesAvailable { .. })));
    }

    #[tokio::test]
    async fn snapshot_reports_registered_nodes() {
        let scheduler = scheduler_with_one_node().await;
        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.nodes.len(), 1);
        assert!(snapshot.strategy_names.len() >= 6);
    }
}
