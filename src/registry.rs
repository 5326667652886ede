//! §4.1 Node Registry — the authoritative, in-memory view of the worker fleet.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::id::{ModelId, NodeId};
use crate::task::{LoadTrend, NodeCapacity, NodeInfo, NodeState, ResourceMetrics};
use crate::time::Timestamp;

/// Canonical view of the worker fleet. All other components hold read-only
/// references acquired through [`Registry::snapshot`] or [`Registry::list_available`];
/// `NodeInfo` is owned exclusively here.
pub struct Registry {
    config: RegistryConfig,
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
    /// Timestamp of the previous `update_metrics` sample, used to compute
    /// load velocity/acceleration. Kept alongside the node rather than
    /// inside `NodeInfo` since it is registry-internal bookkeeping.
    last_sample: RwLock<HashMap<NodeId, (Timestamp, f64, f64)>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            last_sample: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent registration: resets health to 1.0 and state to `available`
    /// only if the node was previously unknown.
    pub async fn register(&self, node_id: NodeId, address: impl Into<String>, capacity: NodeCapacity) {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node_id) {
            debug!(%node_id, "register: already known, no-op");
            return;
        }
        nodes.insert(node_id, NodeInfo::new(node_id, address, capacity));
        info!(%node_id, "node registered");
    }

    pub async fn deregister(&self, node_id: NodeId) {
        self.nodes.write().await.remove(&node_id);
        self.last_sample.write().await.remove(&node_id);
        info!(%node_id, "node deregistered");
    }

    /// Recompute usage, load score/velocity/acceleration and trend for a
    /// known node. Updates for an unknown node are silently dropped — the
    /// membership service may be racing with registration.
    pub async fn update_metrics(&self, node_id: NodeId, usage: ResourceMetrics) {
        let now = Timestamp::now();
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(&node_id) else {
            warn!(%node_id, "update_metrics for unknown node, dropping");
            return;
        };

        node.usage = ResourceMetrics {
            cpu_percent: usage.cpu_percent.clamp(0.0, 100.0),
            memory_percent: usage.memory_percent.clamp(0.0, 100.0),
            gpu_percent: usage.gpu_percent.clamp(0.0, 100.0),
            network_percent: usage.network_percent.clamp(0.0, 100.0),
            active_requests: usage.active_requests,
            queued_requests: usage.queued_requests,
        };
        node.last_heartbeat = now;

        let cfg = &self.config;
        let new_load = cfg.load_weight_cpu * (node.usage.cpu_percent / 100.0)
            + cfg.load_weight_mem * (node.usage.memory_percent / 100.0)
            + cfg.load_weight_disk * (node.usage.gpu_percent / 100.0)
            + cfg.load_weight_net * (node.usage.network_percent / 100.0);

        let mut last_sample = self.last_sample.write().await;
        let (velocity, acceleration) = match last_sample.get(&node_id) {
            Some((prev_ts, prev_load, prev_velocity)) => {
                let dt = (now.as_nanos().saturating_sub(prev_ts.as_nanos())) as f64 / 1e9;
                if dt > 0.0 {
                    let velocity = (new_load - prev_load) / dt;
                    let acceleration = (velocity - prev_velocity) / dt;
                    (velocity, acceleration)
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        last_sample.insert(node_id, (now, new_load, velocity));

        node.load_trend = if (new_load - node.load_score).abs() < cfg.load_trend_stability {
            LoadTrend::Stable
        } else if new_load > node.load_score {
            LoadTrend::Increasing
        } else {
            LoadTrend::Decreasing
        };
        node.load_score = new_load;
        node.load_velocity = velocity;
        node.load_acceleration = acceleration;

        if node.state == NodeState::Degraded && node.health_score > 0.5 {
            node.state = NodeState::Available;
        }
    }

    pub async fn mark_model_resident(&self, node_id: NodeId, model_id: ModelId) {
        if let Some(node) = self.nodes.write().await.get_mut(&node_id) {
            node.resident_models.insert(model_id, Timestamp::now());
        }
    }

    pub async fn mark_model_evicted(&self, node_id: NodeId, model_id: &ModelId) {
        if let Some(node) = self.nodes.write().await.get_mut(&node_id) {
            node.resident_models.remove(model_id);
        }
    }

    pub async fn set_state(&self, node_id: NodeId, state: NodeState) {
        if let Some(node) = self.nodes.write().await.get_mut(&node_id) {
            if node.state != state {
                info!(%node_id, ?state, "node state transition");
            }
            node.state = state;
        }
    }

    pub async fn set_health(&self, node_id: NodeId, health: f64) {
        if let Some(node) = self.nodes.write().await.get_mut(&node_id) {
            node.health_score = health.clamp(0.0, 1.0);
        }
    }

    /// Overwrite the observed response-time EWMA. The Dispatcher computes the
    /// new value itself (`new = (old + observed) / 2`) and writes it here.
    pub async fn set_latency(&self, node_id: NodeId, latency_ms: f64) {
        if let Some(node) = self.nodes.write().await.get_mut(&node_id) {
            node.latency_ms = latency_ms;
        }
    }

    pub async fn increment_failures(&self, node_id: NodeId) -> Option<u32> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&node_id)?;
        node.failure_count += 1;
        Some(node.failure_count)
    }

    pub async fn reset_failures(&self, node_id: NodeId) {
        if let Some(node) = self.nodes.write().await.get_mut(&node_id) {
            node.failure_count = 0;
        }
    }

    /// Force nodes stale for longer than `stale_after` into `degraded`.
    pub async fn sweep_stale(&self) {
        let now = Timestamp::now();
        let stale_after = self.config.stale_after;
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            if node.state == NodeState::Available
                && now.elapsed_since(node.last_heartbeat) > stale_after
            {
                node.state = NodeState::Degraded;
                warn!(node_id = %node.node_id, "node marked degraded: stale heartbeat");
            }
        }
    }

    /// A consistent, immutable, copy-on-read view of the whole fleet.
    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn get(&self, node_id: NodeId) -> Option<NodeInfo> {
        self.nodes.read().await.get(&node_id).cloned()
    }

    /// Nodes whose state is `available`, health > 0.5, and whose last
    /// heartbeat age is below `stale_after`.
    pub async fn list_available(&self) -> Vec<NodeInfo> {
        let now = Timestamp::now();
        let stale_after = self.config.stale_after;
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| {
                n.state == NodeState::Available
                    && n.health_score > 0.5
                    && now.elapsed_since(n.last_heartbeat) < stale_after
            })
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }
}

pub type SharedRegistry = Arc<Registry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = Registry::new(RegistryConfig::default());
        let id = node_id("a");
        registry.register(id, "127.0.0.1:9000", NodeCapacity::default()).await;
        registry.set_health(id, 0.2).await;
        registry.register(id, "127.0.0.1:9000", NodeCapacity::default()).await;

        let node = registry.get(id).await.unwrap();
        assert_eq!(node.health_score, 0.2, "second register must be a no-op");
    }

    #[tokio::test]
    async fn update_metrics_clamps_usage_and_sets_load_score() {
        let registry = Registry::new(RegistryConfig::default());
        let id = node_id("a");
        registry.register(id, "addr", NodeCapacity::default()).await;

        registry
            .update_metrics(
                id,
                ResourceMetrics {
                    cpu_percent: 150.0,
                    memory_percent: -10.0,
                    gpu_percent: 50.0,
                    network_percent: 20.0,
                    active_requests: 1,
                    queued_requests: 0,
                },
            )
            .await;

        let node = registry.get(id).await.unwrap();
        assert_eq!(node.usage.cpu_percent, 100.0);
        assert_eq!(node.usage.memory_percent, 0.0);
        assert!(node.load_score > 0.0);
    }

    #[tokio::test]
    async fn update_metrics_for_unknown_node_is_dropped() {
        let registry = Registry::new(RegistryConfig::default());
        registry.update_metrics(node_id("ghost"), ResourceMetrics::default()).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn list_available_excludes_unhealthy_and_non_available_nodes() {
        let registry = Registry::new(RegistryConfig::default());
        let healthy = node_id("healthy");
        let sick = node_id("sick");
        registry.register(healthy, "a", NodeCapacity::default()).await;
        registry.register(sick, "b", NodeCapacity::default()).await;
        registry.set_health(sick, 0.1).await;

        let available = registry.list_available().await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].node_id, healthy);
    }

    #[tokio::test]
    async fn register_update_deregister_is_clean() {
        let registry = Registry::new(RegistryConfig::default());
        let id = node_id("a");
        registry.register(id, "addr", NodeCapacity::default()).await;
        registry.update_metrics(id, ResourceMetrics::default()).await;
        registry.deregister(id).await;
        assert_eq!(registry.len().await, 0);
    }
}
