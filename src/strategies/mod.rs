//! §4.4 Strategy Set — pluggable node-selection algorithms behind one
//! uniform contract, selected by the [`crate::arbiter::Arbiter`].

mod adaptive;
mod least_effective_load;
mod locality;
mod predictive;
mod resource_aware;
mod weighted_round_robin;

pub use adaptive::AdaptiveStrategy;
pub use least_effective_load::LeastEffectiveLoadStrategy;
pub use locality::LocalityAwareStrategy;
pub use predictive::PredictiveStrategy;
pub use resource_aware::ResourceAwareStrategy;
pub use weighted_round_robin::WeightedRoundRobinStrategy;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SchedulerError};
use crate::task::{AlgorithmMetrics, NodeInfo, SelectionResult, Task};

/// Uniform contract every selection algorithm implements. Candidates have
/// already been filtered by the Health Monitor and Node Registry; strategies
/// must not mutate nodes, only read the passed-in snapshot.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a non-empty ordered list of nodes: the first is the primary
    /// target, any remainder are warm fallbacks for the dispatcher's retry.
    fn select(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Vec<crate::id::NodeId>>;

    fn update_metrics(&self, result: &SelectionResult);

    fn should_rebalance(&self, candidates: &[NodeInfo]) -> bool;

    fn metrics(&self) -> AlgorithmMetrics;
}

fn no_nodes_available(task: &Task) -> SchedulerError {
    SchedulerError::NoNodesAvailable { task_id: task.task_id }
}

/// Variance across a set of sampled values, used by both the strategies
/// (`should_rebalance`) and the Arbiter.
pub(crate) fn variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

/// A registry of strategies keyed by name, so the Arbiter never hard-codes
/// strategy identifiers.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variance_of_uniform_values_is_zero() {
        assert_eq!(variance(vec![0.5, 0.5, 0.5].into_iter()), 0.0);
    }

    #[test]
    fn variance_of_empty_is_zero() {
        assert_eq!(variance(std::iter::empty()), 0.0);
    }
}
