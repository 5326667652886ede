//! Scheduler configuration.
//!
//! Every tunable named in the component design is a field here with the
//! documented default, loadable from (and savable to) a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub registry: RegistryConfig,
    pub health: HealthConfig,
    pub predictor: PredictorConfig,
    pub history: HistoryConfig,
    pub strategies: StrategyConfig,
    pub arbiter: ArbiterConfig,
    pub admission: AdmissionConfig,
    pub dispatcher: DispatcherConfig,
    pub rebalancer: RebalancerConfig,
    pub placement_log: PlacementLogConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            health: HealthConfig::default(),
            predictor: PredictorConfig::default(),
            history: HistoryConfig::default(),
            strategies: StrategyConfig::default(),
            arbiter: ArbiterConfig::default(),
            admission: AdmissionConfig::default(),
            dispatcher: DispatcherConfig::default(),
            rebalancer: RebalancerConfig::default(),
            placement_log: PlacementLogConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| SchedulerError::Configuration { message: e.to_string() })
    }

    /// Persist configuration to a TOML file.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| SchedulerError::Configuration { message: e.to_string() })?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// §4.1 Node Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// A node not heard from within this window is forced to `degraded`.
    pub stale_after: Duration,
    /// Weights for the composite load score; must sum to 1.0.
    pub load_weight_cpu: f64,
    pub load_weight_mem: f64,
    pub load_weight_disk: f64,
    pub load_weight_net: f64,
    /// |Δload| below this fraction is considered a `stable` trend.
    pub load_trend_stability: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            load_weight_cpu: 0.4,
            load_weight_mem: 0.3,
            load_weight_disk: 0.2,
            load_weight_net: 0.1,
            load_trend_stability: 0.05,
        }
    }
}

/// §4.2 Health Monitor & Circuit Breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub success_health_delta: f64,
    pub failure_health_delta: f64,
    /// A node not heard from in `stale_after / passive_decay_divisor` has
    /// its health multiplied by `passive_decay_factor` per check interval.
    pub passive_decay_divisor: u32,
    pub passive_decay_factor: f64,
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            success_health_delta: 0.05,
            failure_health_delta: 0.1,
            passive_decay_divisor: 2,
            passive_decay_factor: 0.9,
            check_interval: Duration::from_secs(15),
        }
    }
}

/// §4.3 Performance Predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Rolling window of outcomes per (node, task class).
    pub window: usize,
    /// Below this many samples, fall back to the capacity-derived estimate.
    pub min_samples: usize,
    /// Baseline latency used in the capacity-derived fallback.
    pub baseline_latency_ms: f64,
    /// Baseline throughput used in the capacity-derived fallback.
    pub baseline_throughput: f64,
    /// Load mixing coefficient `k` in `1 + k*load_score`.
    pub load_mix_k: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            window: 128,
            min_samples: 8,
            baseline_latency_ms: 200.0,
            baseline_throughput: 20.0,
            load_mix_k: 0.5,
        }
    }
}

/// Request History / Pattern Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Bound on the LoadSnapshot ring buffer.
    pub snapshot_buffer_size: usize,
    /// Bound on preferred nodes kept per task class.
    pub preferred_nodes_per_class: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            snapshot_buffer_size: 1000,
            preferred_nodes_per_class: 3,
        }
    }
}

/// §4.4 Strategy Set tunables shared or strategy-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub min_weight: f64,
    /// Least-Effective-Load `should_rebalance` trigger: max - min > threshold.
    pub load_spread_rebalance_threshold: f64,
    /// Locality-Aware suitability thresholds.
    pub locality_cpu_ceiling: f64,
    pub locality_mem_ceiling: f64,
    pub locality_health_floor: f64,
    pub locality_cache_bound: usize,
    /// Adaptive learning rate and initial factor weights.
    pub adaptive_learning_rate: f64,
    pub adaptive_weight_latency: f64,
    pub adaptive_weight_throughput: f64,
    pub adaptive_weight_load: f64,
    pub adaptive_weight_health: f64,
    pub adaptive_weight_performance: f64,
    pub adaptive_latency_success_threshold_ms: f64,
    pub adaptive_throughput_success_threshold: f64,
    pub adaptive_preference_confidence_floor: f64,
    pub adaptive_preference_boost: f64,
    /// Resource-Aware bonus multiplier when both cpu and memory headroom
    /// exceed 0.5.
    pub resource_headroom_bonus: f64,
    pub resource_headroom_floor: f64,
    /// Max nodes returned by multi-result strategies (Predictive, Resource-Aware).
    pub max_fallback_candidates: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_weight: 0.1,
            load_spread_rebalance_threshold: 0.3,
            locality_cpu_ceiling: 90.0,
            locality_mem_ceiling: 90.0,
            locality_health_floor: 0.5,
            locality_cache_bound: 3,
            adaptive_learning_rate: 0.1,
            adaptive_weight_latency: 0.3,
            adaptive_weight_throughput: 0.25,
            adaptive_weight_load: 0.2,
            adaptive_weight_health: 0.15,
            adaptive_weight_performance: 0.1,
            adaptive_latency_success_threshold_ms: 100.0,
            adaptive_throughput_success_threshold: 50.0,
            adaptive_preference_confidence_floor: 0.5,
            adaptive_preference_boost: 0.2,
            resource_headroom_bonus: 1.2,
            resource_headroom_floor: 0.5,
            max_fallback_candidates: 3,
        }
    }
}

/// §4.5 Strategy Arbiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    pub load_variance_threshold: f64,
    pub latency_variance_threshold: f64,
    /// Strategy used when neither variance trigger fires.
    pub default_strategy: String,
    /// Hard deadline for a selection; if none returns a node in time the
    /// request is rejected as unavailable.
    pub selection_deadline: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            load_variance_threshold: 0.5,
            latency_variance_threshold: 0.3,
            default_strategy: "weighted-round-robin".to_string(),
            selection_deadline: Duration::from_millis(50),
        }
    }
}

/// §4.6 Admission & Queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub queue_max_per_node: usize,
    pub queue_max_global: usize,
    pub reselect_attempts: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            queue_max_per_node: 64,
            queue_max_global: 4096,
            reselect_attempts: 2,
        }
    }
}

/// §4.7 Dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub dispatch_timeout: Duration,
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(30),
            max_retries: 1,
        }
    }
}

/// §4.8 Rebalancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancerConfig {
    pub rebalance_interval: Duration,
    pub imbalance_threshold: f64,
    pub high_load_threshold: f64,
    pub low_load_threshold: f64,
    pub rebalance_batch_size: usize,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            rebalance_interval: Duration::from_secs(30),
            imbalance_threshold: 0.3,
            high_load_threshold: 0.8,
            low_load_threshold: 0.2,
            rebalance_batch_size: 10,
        }
    }
}

/// §4.9 Replicated Placement Log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementLogConfig {
    pub schema_version: u32,
    pub cache_checkpoint_interval: Duration,
}

impl Default for PlacementLogConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            cache_checkpoint_interval: Duration::from_secs(60),
        }
    }
}
