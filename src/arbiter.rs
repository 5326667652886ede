//! §4.5 Strategy Arbiter — chooses which strategy runs for a given request.

use std::sync::Arc;

use tracing::debug;

use crate::config::ArbiterConfig;
use crate::error::{Result, SchedulerError};
use crate::strategies::{variance, Strategy, StrategyRegistry};
use crate::task::{NodeInfo, Task};

/// Why the arbiter picked the strategy it did — surfaced on the
/// admin/observability interface.
#[derive(Debug, Clone)]
pub struct ArbitrationDecision {
    pub strategy: String,
    pub reason: &'static str,
    pub load_variance: f64,
    pub latency_variance: f64,
}

pub struct Arbiter {
    config: ArbiterConfig,
    registry: StrategyRegistry,
    recent_decisions: parking_lot::Mutex<std::collections::VecDeque<ArbitrationDecision>>,
}

const RECENT_DECISIONS_BOUND: usize = 256;

impl Arbiter {
    pub fn new(config: ArbiterConfig, registry: StrategyRegistry) -> Self {
        Self {
            config,
            registry,
            recent_decisions: parking_lot::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Pick a strategy for this request: an explicit per-request override
    /// bypasses arbitration entirely; otherwise load/latency variance across
    /// candidates routes to Least-Effective-Load or Locality-Aware, falling
    /// back to the configured default.
    pub fn choose(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Arc<dyn Strategy>> {
        if let Some(name) = &task.strategy_override {
            let strategy = self.registry.get(name).ok_or_else(|| SchedulerError::StrategyFailure {
                strategy: name.clone(),
                message: "override names an unregistered strategy".to_string(),
            })?;
            self.record(ArbitrationDecision {
                strategy: name.clone(),
                reason: "explicit override",
                load_variance: 0.0,
                latency_variance: 0.0,
            });
            return Ok(strategy);
        }

        let load_variance = variance(candidates.iter().map(|n| n.load_score));
        let latency_variance = variance(candidates.iter().map(|n| n.latency_ms));

        let (name, reason) = if load_variance > self.config.load_variance_threshold {
            ("least-effective-load", "high load variance")
        } else if latency_variance > self.config.latency_variance_threshold {
            ("locality-aware", "high latency variance")
        } else {
            (self.config.default_strategy.as_str(), "stable cluster, using default")
        };

        let strategy = self.registry.get(name).ok_or_else(|| SchedulerError::StrategyFailure {
            strategy: name.to_string(),
            message: "arbiter-selected strategy is not registered".to_string(),
        })?;

        self.record(ArbitrationDecision {
            strategy: name.to_string(),
            reason,
            load_variance,
            latency_variance,
        });
        debug!(strategy = name, reason, "arbiter chose strategy");

        Ok(strategy)
    }

    fn record(&self, decision: ArbitrationDecision) {
        let mut decisions = self.recent_decisions.lock();
        decisions.push_back(decision);
        while decisions.len() > RECENT_DECISIONS_BOUND {
            decisions.pop_front();
        }
    }

    /// The configured default strategy, for callers that bypass arbitration
    /// entirely (sticky-assignment admission) but still need a `Strategy`
    /// instance to attribute dispatch outcomes to.
    pub fn default_strategy(&self) -> Result<Arc<dyn Strategy>> {
        self.registry
            .get(&self.config.default_strategy)
            .ok_or_else(|| SchedulerError::StrategyFailure {
                strategy: self.config.default_strategy.clone(),
                message: "default strategy is not registered".to_string(),
            })
    }

    pub fn recent_decisions(&self) -> Vec<ArbitrationDecision> {
        self.recent_decisions.lock().iter().cloned().collect()
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.registry.names()
    }
}
