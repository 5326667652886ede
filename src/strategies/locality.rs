//! §4.4.3 Locality-Aware.
//!
//! Maintains a per-model cache of up to 3 preferred nodes as an arena +
//! LRU index rather than a nested map, per the rearchitecture notes: a
//! fixed-capacity `Vec` per model, with the front being most-recently-used.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::config::StrategyConfig;
use crate::error::Result;
use crate::id::{ModelId, NodeId};
use crate::task::{AlgorithmMetrics, NodeInfo, SelectionResult, Task};

use super::least_effective_load::LeastEffectiveLoadStrategy;
use super::{no_nodes_available, Strategy};

struct Cache {
    preferred: HashMap<ModelId, Vec<NodeId>>,
    recently_evicted: HashMap<ModelId, HashSet<NodeId>>,
}

pub struct LocalityAwareStrategy {
    config: StrategyConfig,
    cache: Mutex<Cache>,
    metrics: Mutex<AlgorithmMetrics>,
    /// Delegate used when the task carries no `model_id`.
    fallback: LeastEffectiveLoadStrategy,
}

impl LocalityAwareStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            fallback: LeastEffectiveLoadStrategy::new(config.clone()),
            config,
            cache: Mutex::new(Cache {
                preferred: HashMap::new(),
                recently_evicted: HashMap::new(),
            }),
            metrics: Mutex::new(AlgorithmMetrics::default()),
        }
    }

    fn is_suitable(&self, node: &NodeInfo) -> bool {
        node.health_score > self.config.locality_health_floor
            && node.usage.cpu_percent < self.config.locality_cpu_ceiling
            && node.usage.memory_percent < self.config.locality_mem_ceiling
    }

    fn cache_hit(&self, cache: &Cache, model_id: &ModelId, node: &NodeInfo) -> f64 {
        if node.has_model(model_id) {
            1.0
        } else if cache
            .recently_evicted
            .get(model_id)
            .is_some_and(|set| set.contains(&node.node_id))
        {
            0.5
        } else {
            0.0
        }
    }

    fn score(&self, cache: &Cache, model_id: &ModelId, node: &NodeInfo) -> f64 {
        let cache_hit = self.cache_hit(cache, model_id, node);
        let latency_score = 1.0 / (1.0 + node.latency_ms.max(0.0));
        let data_locality = if node.has_model(model_id) { 1.0 } else { 0.0 };
        let session_affinity = cache
            .preferred
            .get(model_id)
            .is_some_and(|nodes| nodes.contains(&node.node_id)) as u8 as f64;

        0.4 * cache_hit + 0.3 * latency_score + 0.2 * data_locality + 0.1 * session_affinity
    }

    fn remember(&self, cache: &mut Cache, model_id: ModelId, node_id: NodeId) {
        let bound = self.config.locality_cache_bound;
        let entry = cache.preferred.entry(model_id).or_default();
        entry.retain(|n| *n != node_id);
        entry.insert(0, node_id);
        entry.truncate(bound);
    }

    /// Invalidate a locality cache entry, e.g. on a worker `NotFound` error.
    pub fn mark_evicted(&self, model_id: ModelId, node_id: NodeId) {
        let mut cache = self.cache.lock();
        if let Some(nodes) = cache.preferred.get_mut(&model_id) {
            nodes.retain(|n| *n != node_id);
        }
        cache.recently_evicted.entry(model_id).or_default().insert(node_id);
    }

    /// A copy of the current preferred-node cache, for the Placement Log's
    /// periodic locality checkpoint (§4.9).
    pub fn cache_snapshot(&self) -> HashMap<ModelId, Vec<NodeId>> {
        self.cache.lock().preferred.clone()
    }
}

impl Strategy for LocalityAwareStrategy {
    fn name(&self) -> &str {
        "locality-aware"
    }

    fn select(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Vec<NodeId>> {
        if candidates.is_empty() {
            return Err(no_nodes_available(task));
        }

        let Some(model_id) = task.model_id.clone() else {
            return self.fallback.select(task, candidates);
        };

        let mut cache = self.cache.lock();
        if let Some(preferred) = cache.preferred.get(&model_id).cloned() {
            if let Some(first) = preferred.first() {
                if let Some(node) = candidates.iter().find(|n| n.node_id == *first) {
                    if self.is_suitable(node) {
                        return Ok(vec![node.node_id]);
                    }
                }
            }
        }

        let best = candidates
            .iter()
            .map(|n| (n, self.score(&cache, &model_id, n)))
            .max_by(|(a, a_score), (b, b_score)| {
                a_score
                    .partial_cmp(b_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|(n, _)| n.node_id)
            .expect("non-empty candidates");

        self.remember(&mut cache, model_id, best);
        Ok(vec![best])
    }

    fn update_metrics(&self, result: &SelectionResult) {
        self.metrics.lock().record(result);
    }

    fn should_rebalance(&self, candidates: &[NodeInfo]) -> bool {
        self.fallback.should_rebalance(candidates)
    }

    fn metrics(&self) -> AlgorithmMetrics {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NodeCapacity, TaskRequirements};
    use crate::time::Timestamp;

    fn node(id: &str) -> NodeInfo {
        NodeInfo::new(NodeId::from(id), "addr", NodeCapacity::default())
    }

    #[test]
    fn falls_back_without_model_id() {
        let strategy = LocalityAwareStrategy::new(StrategyConfig::default());
        let task = Task::new("inference", TaskRequirements::default());
        let candidates = vec![node("a")];
        assert_eq!(strategy.select(&task, &candidates).unwrap(), vec![NodeId::from("a")]);
    }

    #[test]
    fn second_submission_hits_the_cached_node() {
        let strategy = LocalityAwareStrategy::new(StrategyConfig::default());
        let task = Task::new("inference", TaskRequirements::default()).with_model("m1");
        let mut low_load = node("low-load");
        low_load.usage.cpu_percent = 5.0;
        let mut resident = node("resident");
        resident.resident_models.insert(ModelId::new("m1"), Timestamp::now());
        resident.latency_ms = 10.0;

        let candidates = vec![low_load.clone(), resident.clone()];
        let first = strategy.select(&task, &candidates).unwrap();
        assert_eq!(first, vec![NodeId::from("resident")]);

        // Even though "low-load" is less loaded, the second submission
        // should stick to the cached, suitable node.
        let second = strategy.select(&task, &candidates).unwrap();
        assert_eq!(second, vec![NodeId::from("resident")]);
    }

    #[test]
    fn unsuitable_cached_node_is_skipped() {
        let strategy = LocalityAwareStrategy::new(StrategyConfig::default());
        let task = Task::new("inference", TaskRequirements::default()).with_model("m1");
        let mut resident = node("resident");
        resident.resident_models.insert(ModelId::new("m1"), Timestamp::now());
        let other = node("other");

        strategy.select(&task, &[resident.clone(), other.clone()]).unwrap();

        // Now make the cached node unsuitable and re-select.
        resident.usage.cpu_percent = 95.0;
        let selected = strategy.select(&task, &[resident, other]).unwrap();
        assert_eq!(selected, vec![NodeId::from("other")]);
    }
}
