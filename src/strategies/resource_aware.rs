//! §4.4.6 Resource-Aware.

use parking_lot::Mutex;

use crate::config::StrategyConfig;
use crate::error::Result;
use crate::id::NodeId;
use crate::task::{AlgorithmMetrics, NodeInfo, SelectionResult, Task, TaskRequirements};

use super::{no_nodes_available, Strategy};

pub struct ResourceAwareStrategy {
    config: StrategyConfig,
    metrics: Mutex<AlgorithmMetrics>,
}

impl ResourceAwareStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(AlgorithmMetrics::default()),
        }
    }

    fn meets_requirements(node: &NodeInfo, requirements: &TaskRequirements) -> bool {
        let free_cpu_cores = node.capacity.cpu_cores * (1.0 - node.usage.cpu_percent / 100.0);
        let free_memory = (node.capacity.memory_bytes as f64) * (1.0 - node.usage.memory_percent / 100.0);
        let free_gpu = node.capacity.gpu_count as f64 * (1.0 - node.usage.gpu_percent / 100.0);

        free_cpu_cores >= requirements.min_cpu_cores
            && free_memory >= requirements.min_memory_bytes as f64
            && free_gpu >= requirements.min_gpu
            && node.capacity.network_bandwidth_bps >= requirements.min_network_bps
    }

    fn score(&self, node: &NodeInfo) -> f64 {
        let cpu = node.usage.cpu_percent / 100.0;
        let mem = node.usage.memory_percent / 100.0;
        let gpu = node.usage.gpu_percent / 100.0;
        let net = node.usage.network_percent / 100.0;

        let mut score = 0.3 * (1.0 - cpu) + 0.3 * (1.0 - mem) + 0.2 * (1.0 - gpu) + 0.2 * (1.0 - net);

        let free_cpu_ratio = 1.0 - cpu;
        let free_mem_ratio = 1.0 - mem;
        if free_cpu_ratio > self.config.resource_headroom_floor
            && free_mem_ratio > self.config.resource_headroom_floor
        {
            score *= self.config.resource_headroom_bonus;
        }
        score
    }
}

impl Strategy for ResourceAwareStrategy {
    fn name(&self) -> &str {
        "resource-aware"
    }

    fn select(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Vec<NodeId>> {
        let mut scored: Vec<(NodeId, f64)> = candidates
            .iter()
            .filter(|n| Self::meets_requirements(n, &task.requirements))
            .map(|n| (n.node_id, self.score(n)))
            .collect();

        if scored.is_empty() {
            return Err(no_nodes_available(task));
        }

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
