//! §4.4.2 Least-Effective-Load.

use parking_lot::Mutex;

use crate::config::StrategyConfig;
use crate::error::Result;
use crate::id::NodeId;
use crate::task::{AlgorithmMetrics, NodeInfo, SelectionResult, Task};

use super::{no_nodes_available, Strategy};

pub struct LeastEffectiveLoadStrategy {
    config: StrategyConfig,
    metrics: Mutex<AlgorithmMetrics>,
}

impl LeastEffectiveLoadStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(AlgorithmMetrics::default()),
        }
    }

    fn effective_load(&self, node: &NodeInfo) -> f64 {
        let cpu = node.usage.cpu_percent / 100.0;
        let mem = node.usage.memory_percent / 100.0;
        let gpu = node.usage.gpu_percent / 100.0;
        let net = node.usage.network_percent / 100.0;
        let queue = (node.usage.active_requests + node.usage.queued_requests) as f64 / 10.0;

        let raw = 0.3 * cpu + 0.3 * mem + 0.2 * gpu + 0.1 * net + 0.1 * queue;
        raw / node.health_score.max(0.1)
    }
}

impl Strategy for LeastEffectiveLoadStrategy {
    fn name(&self) -> &str {
        "least-effective-load"
    }

    fn select(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Vec<NodeId>> {
        if candidates.is_empty() {
            return Err(no_nodes_available(task));
        }

        let best = candidates
            .iter()
            .map(|n| (n, self.effective_load(n)))
            .min_by(|(a, a_load), (b, b_load)| {
                a_load
                    .partial_cmp(b_load)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|(n, _)| n.node_id)
            .expect("non-empty candidates");

        Ok(vec![best])
    }

    fn update_metrics(&self, result: &SelectionResult) {
        self.metrics.lock().record(result);
    }

    fn should_rebalance(&self, candidates: &[NodeInfo]) -> bool {
        if candidates.len() < 2 {
            return false;
        }
        let loads: Vec<f64> = candidates.iter().map(|n| self.effective_load(n)).collect();
        let max = loads.iter().cloned().fold(f64::MIN, f64::max);
        let min = loads.iter().cloned().fold(f64::MAX, f64::min);
        (max - min) > self.config.load_spread_rebalance_threshold
    }

    fn metrics(&self) -> AlgorithmMetrics {
        self.metrics.lock().clone()
    }
}
