//! §4.4.4 Predictive.
//!
//! Unifies the source's several "Predictive" variants into one contract:
//! score every candidate through the shared [`crate::predictor::Predictor`]
//! and return up to 3 nodes ranked by score, the first being the primary
//! target and the rest warm fallbacks for the dispatcher's retry.

use parking_lot::Mutex;

use crate::config::StrategyConfig;
use crate::error::Result;
use crate::id::NodeId;
use crate::predictor::SharedPredictor;
use crate::task::{AlgorithmMetrics, NodeInfo, SelectionResult, Task};

use super::{no_nodes_available, Strategy};

pub struct PredictiveStrategy {
    config: StrategyConfig,
    predictor: SharedPredictor,
    metrics: Mutex<AlgorithmMetrics>,
}

impl PredictiveStrategy {
    pub fn new(config: StrategyConfig, predictor: SharedPredictor) -> Self {
        Self {
            config,
            predictor,
            metrics: Mutex::new(AlgorithmMetrics::default()),
        }
    }

    fn score(&self, task: &Task, node: &NodeInfo) -> f64 {
        let prediction = self
            .predictor
            .predict(node.node_id, &task.task_class, node.performance_score, node.load_score);
        let latency_score = 1.0 / (1.0 + prediction.latency_ms / 1000.0);
        let throughput_score = (prediction.throughput / 100.0).min(1.0);
        0.6 * latency_score + 0.4 * throughput_score
    }
}

impl Strategy for PredictiveStrategy {
    fn name(&self) -> &str {
        "predictive"
    }

    fn select(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Vec<NodeId>> {
        if candidates.is_empty() {
            return Err(no_nodes_available(task));
        }

        let mut scored: Vec<(NodeId, f64)> = candidates
            .iter()
            .map(|n| (n.node_id, self.score(task, n)))
            .collect();
        scored.sort_by(|(a_id, a), (b_id, b)| {
            b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a_id.cmp(b_id))
        });

        let take = self.config.max_fallback_candidates.min(scored.len());
        Ok(scored.into_iter().take(take).map(|(id, _)| id).collect())
    }

    fn update_metrics(&self, result: &SelectionResult) {
        self.metrics.lock().record(result);
    }

    fn should_rebalance(&self, candidates: &[NodeInfo]) -> bool {
        if candidates.len() < 2 {
            return false;
        }
        let loads: Vec<f64> = candidates.iter().map(|n| n.load_score).collect();
        super::variance(loads.into_iter()) > self.config.load_spread_rebalance_threshold
    }

    fn metrics(&self) -> AlgorithmMetrics {
        self.metrics.lock().clone()
    }
}
