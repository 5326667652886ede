//! §4.2 Health Monitor & Circuit Breaker — per-node availability gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::id::NodeId;
use crate::metrics::{names, MetricsCollector};
use crate::registry::Registry;
use crate::task::NodeState;
use crate::time::Timestamp;

/// Circuit breaker state, per §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A compact, wait-free-read breaker record for one node: state tag, the
/// consecutive counter relevant to the current state, and the timestamp of
/// the last transition. Kept as atomics rather than behind a general mutex
/// so reads on the hot selection path never block.
struct BreakerRecord {
    state: AtomicU32, // 0 closed, 1 open, 2 half-open
    counter: AtomicU32,
    transitioned_at_nanos: AtomicU64,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            counter: AtomicU32::new(0),
            transitioned_at_nanos: AtomicU64::new(Timestamp::now().as_nanos()),
        }
    }

    fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn transition(&self, state: CircuitState) {
        let tag = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.state.store(tag, Ordering::Release);
        self.counter.store(0, Ordering::Release);
        self.transitioned_at_nanos
            .store(Timestamp::now().as_nanos(), Ordering::Release);
    }

    fn transitioned_at(&self) -> Timestamp {
        Timestamp::from_nanos(self.transitioned_at_nanos.load(Ordering::Acquire))
    }
}

/// Per-node health tracking and circuit breaking. Owns no `NodeInfo` data;
/// it pushes health/state updates into the [`Registry`] and keeps its own
/// breaker bookkeeping.
pub struct HealthMonitor {
    config: HealthConfig,
    /// `stale_after` from the registry config, used for the passive health
    /// decay window (`stale_after / passive_decay_divisor`).
    stale_half_window: std::time::Duration,
    registry: Arc<Registry>,
    metrics: Arc<MetricsCollector>,
    breakers: RwLock<HashMap<NodeId, Arc<BreakerRecord>>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        stale_after: std::time::Duration,
        registry: Arc<Registry>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            stale_half_window: stale_after,
            registry,
            metrics,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn breaker_for(&self, node_id: NodeId) -> Arc<BreakerRecord> {
        if let Some(b) = self.breakers.read().get(&node_id) {
            return b.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(node_id)
            .or_insert_with(|| Arc::new(BreakerRecord::new()))
            .clone()
    }

    /// Whether a node is currently eligible to receive work. `half-open`
    /// nodes are eligible for probing up to `half_open_max_calls`, which is
    /// enforced by the caller observing the counter via [`Self::circuit_state`].
    pub fn is_eligible(&self, node_id: NodeId) -> bool {
        !matches!(self.breaker_for(node_id).state(), CircuitState::Open)
    }

    pub fn circuit_state(&self, node_id: NodeId) -> CircuitState {
        self.breaker_for(node_id).state()
    }

    /// Record a successful call against a node.
    pub async fn record_success(&self, node_id: NodeId) {
        let breaker = self.breaker_for(node_id);
        match breaker.state() {
            CircuitState::Closed => {
                self.registry.reset_failures(node_id).await;
                if let Some(node) = self.registry.get(node_id).await {
                    let health = (node.health_score + self.config.success_health_delta).min(1.0);
                    self.registry.set_health(node_id, health).await;
                }
            }
            CircuitState::HalfOpen => {
                let successes = breaker.counter.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_max_calls {
                    breaker.transition(CircuitState::Closed);
                    self.registry.reset_failures(node_id).await;
                    self.registry.set_state(node_id, NodeState::Available).await;
                    info!(%node_id, "circuit closed after successful probes");
                }
            }
            CircuitState::Open => {
                // A success against an open circuit cannot happen via normal
                // dispatch (open nodes are filtered out); ignore defensively.
            }
        }
    }

    /// Record a failed call against a node, possibly tripping the breaker.
    pub async fn record_failure(&self, node_id: NodeId) {
        let breaker = self.breaker_for(node_id);

        if let Some(node) = self.registry.get(node_id).await {
            let health = (node.health_score - self.config.failure_health_delta).max(0.0);
            self.registry.set_health(node_id, health).await;
        }

        match breaker.state() {
            CircuitState::Closed => {
                let failures = self.registry.increment_failures(node_id).await.unwrap_or(0);
                if failures >= self.config.failure_threshold {
                    breaker.transition(CircuitState::Open);
                    self.registry.set_state(node_id, NodeState::CircuitOpen).await;
                    self.metrics.increment_counter(names::CIRCUIT_OPENED, 1);
                    warn!(%node_id, failures, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                breaker.transition(CircuitState::Open);
                self.registry.set_state(node_id, NodeState::CircuitOpen).await;
                self.metrics.increment_counter(names::CIRCUIT_OPENED, 1);
                warn!(%node_id, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Periodic sweep: open breakers past `recovery_timeout` move to
    /// half-open; stale nodes get passive health decay.
    pub async fn run_check_cycle(&self) {
        self.registry.sweep_stale().await;

        let to_half_open: Vec<NodeId> = {
            let breakers = self.breakers.read();
            breakers
                .iter()
                .filter(|(_, b)| {
                    b.state() == CircuitState::Open
                        && Timestamp::now().elapsed_since(b.transitioned_at())
                            >= self.config.recovery_timeout
                })
                .map(|(id, _)| *id)
                .collect()
        };

        for node_id in to_half_open {
            let breaker = self.breaker_for(node_id);
            breaker.transition(CircuitState::HalfOpen);
            self.registry.set_state(node_id, NodeState::HalfOpen).await;
            self.metrics.increment_counter(names::CIRCUIT_HALF_OPENED, 1);
            info!(%node_id, "circuit half-open, probing for recovery");
        }

        let decay_threshold = self.stale_half_window / self.config.passive_decay_divisor.max(1);
        for node in self.registry.snapshot().await {
            if Timestamp::now().elapsed_since(node.last_heartbeat) > decay_threshold {
                let decayed = node.health_score * self.config.passive_decay_factor;
                self.registry.set_health(node.node_id, decayed).await;
            }
        }
    }

    /// Spawn the periodic health-check loop on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_check_cycle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NodeCapacity;

    async fn harness() -> (Arc<Registry>, Arc<HealthMonitor>) {
        let registry = Arc::new(Registry::new(crate::config::RegistryConfig::default()));
        let metrics = Arc::new(MetricsCollector::new());
        let mut config = HealthConfig::default();
        config.failure_threshold = 3;
        let health = Arc::new(HealthMonitor::new(
            config,
            std::time::Duration::from_secs(300),
            registry.clone(),
            metrics,
        ));
        (registry, health)
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let (registry, health) = harness().await;
        let node_id = NodeId::from("a");
        registry.register(node_id, "addr", NodeCapacity::default()).await;

        for _ in 0..3 {
            health.record_failure(node_id).await;
        }

        assert_eq!(health.circuit_state(node_id), CircuitState::Open);
        assert!(!health.is_eligible(node_id));
    }

    #[tokio::test]
    async fn half_open_closes_after_enough_successes() {
        let (registry, health) = harness().await;
        let node_id = NodeId::from("a");
        registry.register(node_id, "addr", NodeCapacity::default()).await;
        for _ in 0..3 {
            health.record_failure(node_id).await;
        }
        health.breaker_for(node_id).transition(CircuitState::HalfOpen);

        for _ in 0..health.config.half_open_max_calls {
            health.record_success(node_id).await;
        }

        assert_eq!(health.circuit_state(node_id), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_any_failure() {
        let (registry, health) = harness().await;
        let node_id = NodeId::from("a");
        registry.register(node_id, "addr", NodeCapacity::default()).await;
        health.breaker_for(node_id).transition(CircuitState::HalfOpen);

        health.record_failure(node_id).await;

        assert_eq!(health.circuit_state(node_id), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_on_closed_decrements_failure_and_raises_health() {
        let (registry, health) = harness().await;
        let node_id = NodeId::from("a");
        registry.register(node_id, "addr", NodeCapacity::default()).await;
        health.record_failure(node_id).await;
        health.record_success(node_id).await;

        let node = registry.get(node_id).await.unwrap();
        assert_eq!(node.failure_count, 0);
    }
}
