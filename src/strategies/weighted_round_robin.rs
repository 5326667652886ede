//! §4.4.1 Weighted Round-Robin.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::config::StrategyConfig;
use crate::error::Result;
use crate::id::NodeId;
use crate::task::{AlgorithmMetrics, NodeInfo, SelectionResult, Task};

use super::{no_nodes_available, Strategy};

/// Weight-proportional random pick, falling back to plain round-robin when
/// every candidate's weight collapses to zero. `counter` only advances in
/// that fallback branch, where it drives the round-robin index; the normal
/// weighted pick is pure randomness and never touches it.
pub struct WeightedRoundRobinStrategy {
    config: StrategyConfig,
    counter: AtomicU64,
    metrics: Mutex<AlgorithmMetrics>,
}

impl WeightedRoundRobinStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
            metrics: Mutex::new(AlgorithmMetrics::default()),
        }
    }

    fn weight(&self, node: &NodeInfo) -> f64 {
        let usage = node.mean_cpu_mem_usage();
        (node.performance_score * node.health_score * (1.0 - usage)).max(self.config.min_weight)
    }
}

impl Strategy for WeightedRoundRobinStrategy {
    fn name(&self) -> &str {
        "weighted-round-robin"
    }

    fn select(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Vec<NodeId>> {
        if candidates.is_empty() {
            return Err(no_nodes_available(task));
        }

        let weights: Vec<f64> = candidates.iter().map(|n| self.weight(n)).collect();
        let total: f64 = weights.iter().sum();

        let index = if total <= 0.0 {
            let tick = self.counter.fetch_add(1, Ordering::Relaxed);
            (tick as usize) % candidates.len()
        } else {
            let pick = rand::thread_rng().gen_range(0.0..total);
            let mut cumulative = 0.0;
            let mut chosen = candidates.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                cumulative += w;
                if pick < cumulative {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        Ok(vec![candidates[index].node_id])
    }

    fn update_metrics(&self, result: &SelectionResult) {
        self.metrics.lock().record(result);
    }

    fn should_rebalance(&self, _candidates: &[NodeInfo]) -> bool {
        // Self-balancing by construction: weighting already favours
        // underloaded nodes on every pick.
        false
    }

    fn metrics(&self) -> AlgorithmMetrics {
        self.metrics.lock().clone()
    }
}
