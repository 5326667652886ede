//! §4.8 Rebalancer — leader-only periodic load correction across the fleet.
//!
//! Only ever acts on queued (not yet dispatched) work; a task already handed
//! to a worker is never migrated mid-flight.

use std::sync::Arc;

use tracing::{debug, info};

use crate::admission::Admission;
use crate::arbiter::Arbiter;
use crate::config::RebalancerConfig;
use crate::consensus::ConsensusClient;
use crate::id::NodeId;
use crate::metrics::{names, MetricsCollector};
use crate::placement_log::PlacementLog;
use crate::registry::Registry;
use crate::strategies::Strategy;
use crate::task::Task;

/// One proposed move of queued work from an overloaded node to an
/// underloaded one, surfaced on the admin interface for observability.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub from: NodeId,
    pub to: NodeId,
    pub task_ids: Vec<crate::id::TaskId>,
}

pub struct Rebalancer<C: ConsensusClient> {
    config: RebalancerConfig,
    registry: Arc<Registry>,
    admission: Arc<Admission<C>>,
    arbiter: Arc<Arbiter>,
    placement_log: Arc<PlacementLog<C>>,
    metrics: Arc<MetricsCollector>,
}

impl<C: ConsensusClient + 'static> Rebalancer<C> {
    pub fn new(
        config: RebalancerConfig,
        registry: Arc<Registry>,
        admission: Arc<Admission<C>>,
        arbiter: Arc<Arbiter>,
        placement_log: Arc<PlacementLog<C>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            registry,
            admission,
            arbiter,
            placement_log,
            metrics,
        }
    }

    /// Run one rebalance cycle: no-op unless this replica is the consensus
    /// leader, the coefficient of variation across available node loads
    /// exceeds `imbalance_threshold`, and the active strategy agrees a
    /// rebalance is warranted.
    pub async fn run_cycle(&self) -> Vec<RebalancePlan> {
        if !self.placement_log.is_leader().await {
            return Vec::new();
        }

        let nodes = self.registry.list_available().await;
        if nodes.len() < 2 {
            return Vec::new();
        }

        let loads: Vec<f64> = nodes.iter().map(|n| n.load_score).collect();
        let cv = coefficient_of_variation(&loads);
        if cv < self.config.imbalance_threshold {
            debug!(cv, "cluster load balanced, skipping rebalance");
            return Vec::new();
        }

        let task = Task::new("rebalance-probe", Default::default());
        let active_strategy = match self.arbiter.choose(&task, &nodes) {
            Ok(strategy) => strategy,
            Err(_) => return Vec::new(),
        };
        if !active_strategy.should_rebalance(&nodes) {
            debug!("active strategy declined to rebalance despite imbalance");
            return Vec::new();
        }

        let mut overloaded: Vec<_> = nodes
            .iter()
            .filter(|n| n.load_score > self.config.high_load_threshold)
            .cloned()
            .collect();
        overloaded.sort_by(|a, b| b.load_score.partial_cmp(&a.load_score).unwrap());

        let mut underloaded: Vec<_> = nodes
            .iter()
            .filter(|n| n.load_score < self.config.low_load_threshold)
            .cloned()
            .collect();
        underloaded.sort_by(|a, b| a.load_score.partial_cmp(&b.load_score).unwrap());

        if overloaded.is_empty() || underloaded.is_empty() {
            return Vec::new();
        }

        let mut plans = Vec::new();
        let mut moved = 0usize;

        'outer: for from in &overloaded {
            let queued = self.admission.queued_tasks(from.node_id).await;
            for to in &underloaded {
                if moved >= self.config.rebalance_batch_size || queued.is_empty() {
                    break 'outer;
                }
                let remaining = self.config.rebalance_batch_size - moved;
                let batch: Vec<Task> = queued.iter().take(remaining).cloned().collect();
                if batch.is_empty() {
                    continue;
                }
                let task_ids: Vec<_> = batch.iter().map(|t| t.task_id).collect();

                if self
                    .placement_log
                    .propose_migration(task_ids.clone(), from.node_id, to.node_id)
                    .await
                    .is_ok()
                {
                    moved += task_ids.len();
                    plans.push(RebalancePlan {
                        from: from.node_id,
                        to: to.node_id,
                        task_ids,
                    });
                }
            }
        }

        if !plans.is_empty() {
            self.metrics.increment_counter(names::REBALANCE_CYCLES, 1);
            self.metrics
                .increment_counter(names::REBALANCE_MIGRATIONS, moved as u64);
            info!(migrations = moved, plans = plans.len(), "rebalance cycle proposed migrations");
        }

        plans
    }

    /// Spawn the periodic rebalance loop on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.rebalance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }
}

/// `stddev / mean`, the standard imbalance measure used by §4.8. Zero mean
/// (an idle cluster) reports zero imbalance rather than dividing by zero.
fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}
