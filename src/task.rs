//! Task and node descriptor types that flow through the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::id::{IdempotencyKey, ModelId, NodeId, TaskClass, TaskId};
use crate::time::Timestamp;

/// A client-submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_class: TaskClass,
    pub model_id: Option<ModelId>,
    pub requirements: TaskRequirements,
    pub deadline: Option<Timestamp>,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Explicit per-request strategy override, bypassing the arbiter.
    pub strategy_override: Option<String>,
    pub state: TaskState,
}

impl Task {
    pub fn new(task_class: impl Into<TaskClass>, requirements: TaskRequirements) -> Self {
        Self {
            task_id: TaskId::random(),
            task_class: task_class.into(),
            model_id: None,
            requirements,
            deadline: None,
            idempotency_key: None,
            strategy_override: None,
            state: TaskState::Queued,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<ModelId>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn is_past_deadline(&self, now: Timestamp) -> bool {
        matches!(self.deadline, Some(d) if now > d)
    }
}

/// Task lifecycle, per §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Dispatched,
    Succeeded,
    Failed,
    RejectedBusy,
    RejectedDeadlineExceeded,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::RejectedBusy
                | TaskState::RejectedDeadlineExceeded
        )
    }
}

/// Resource requirements derived from a task, used by resource-aware scoring.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub min_cpu_cores: f64,
    pub min_memory_bytes: u64,
    pub min_gpu: f64,
    pub min_network_bps: u64,
}

impl TaskRequirements {
    /// Derive requirements from a coarse model-size hint and context length,
    /// per the size-tier rule in the data model: memory scales ~1.5x model
    /// size plus a per-context-token overhead.
    pub fn from_model_hint(model_size_bytes: u64, context_tokens: u64) -> Self {
        const PER_TOKEN_OVERHEAD_BYTES: u64 = 2_048;
        let memory = (model_size_bytes as f64 * 1.5) as u64
            + context_tokens * PER_TOKEN_OVERHEAD_BYTES;

        let min_cpu_cores = if model_size_bytes > 30_000_000_000 {
            8.0
        } else if model_size_bytes > 7_000_000_000 {
            4.0
        } else {
            1.0
        };

        Self {
            min_cpu_cores,
            min_memory_bytes: memory,
            min_gpu: if model_size_bytes > 1_000_000_000 { 1.0 } else { 0.0 },
            min_network_bps: 0,
        }
    }
}

/// Worker capacity, as advertised at registration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    pub network_bandwidth_bps: u64,
    pub storage_bytes: u64,
}

/// Observed resource usage, as reported by a heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_percent: f64,
    pub network_percent: f64,
    pub active_requests: u32,
    pub queued_requests: u32,
}

/// Direction a node's load has been trending, from the last two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadTrend {
    Stable,
    Increasing,
    Decreasing,
}

/// Node lifecycle state, per §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Available,
    Degraded,
    CircuitOpen,
    HalfOpen,
}

/// One worker in the fleet, owned exclusively by the Node Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: String,
    pub capacity: NodeCapacity,
    pub usage: ResourceMetrics,
    pub load_score: f64,
    pub load_velocity: f64,
    pub load_acceleration: f64,
    pub load_trend: LoadTrend,
    pub latency_ms: f64,
    pub throughput: f64,
    pub health_score: f64,
    pub performance_score: f64,
    /// Models resident on this node, with freshness timestamps.
    pub resident_models: HashMap<ModelId, Timestamp>,
    pub state: NodeState,
    pub last_heartbeat: Timestamp,
    pub failure_count: u32,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, address: impl Into<String>, capacity: NodeCapacity) -> Self {
        let now = Timestamp::now();
        Self {
            node_id,
            address: address.into(),
            capacity,
            usage: ResourceMetrics::default(),
            load_score: 0.0,
            load_velocity: 0.0,
            load_acceleration: 0.0,
            load_trend: LoadTrend::Stable,
            latency_ms: 0.0,
            throughput: 0.0,
            health_score: 1.0,
            performance_score: 1.0,
            resident_models: HashMap::new(),
            state: NodeState::Available,
            last_heartbeat: now,
            failure_count: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == NodeState::Available
    }

    pub fn has_model(&self, model_id: &ModelId) -> bool {
        self.resident_models.contains_key(model_id)
    }

    /// Mean fractional (0..1) usage across cpu/memory, used by several
    /// strategies' scoring formulas.
    pub fn mean_cpu_mem_usage(&self) -> f64 {
        (self.usage.cpu_percent / 100.0 + self.usage.memory_percent / 100.0) / 2.0
    }
}

/// Outcome of a single dispatch, fed back into strategies, the predictor,
/// and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub selected_nodes: Vec<NodeId>,
    pub task_class: TaskClass,
    pub success: bool,
    pub latency_ms: f64,
    pub throughput: f64,
    pub error_kind: Option<String>,
}

/// Per-strategy running metrics, owned for the lifetime of the strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlgorithmMetrics {
    pub selections: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub avg_throughput: f64,
    pub last_used: Option<Timestamp>,
}

impl AlgorithmMetrics {
    /// True running success ratio — the source recomputed this as
    /// `selections/selections` (always 1.0); this is the corrected version.
    pub fn success_rate(&self) -> f64 {
        if self.selections == 0 {
            1.0
        } else {
            self.successes as f64 / self.selections as f64
        }
    }

    pub fn record(&mut self, result: &SelectionResult) {
        self.selections += 1;
        if result.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        // Exponential moving average keeps this cheap to update per-outcome.
        let n = self.selections as f64;
        self.avg_latency_ms += (result.latency_ms - self.avg_latency_ms) / n;
        self.avg_throughput += (result.throughput - self.avg_throughput) / n;
        self.last_used = Some(Timestamp::now());
    }
}

/// Per task-class preferred-node pattern, bounded by LRU eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPattern {
    pub task_class: TaskClass,
    pub preferred_nodes: Vec<NodeId>,
    pub confidence: f64,
    pub last_updated: Timestamp,
}

/// Periodic cluster-wide load snapshot, kept in a bounded ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub timestamp: Timestamp,
    pub active_nodes: usize,
    pub per_node_load: HashMap<NodeId, f64>,
    pub mean: f64,
    pub variance: f64,
    pub imbalance: f64,
}

/// A single prediction-vs-actual sample, used to track predictor accuracy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub node_id: NodeId,
    pub task_class: TaskClass,
    pub predicted_latency_ms: f64,
    pub actual_latency_ms: f64,
    pub predicted_throughput: f64,
    pub actual_throughput: f64,
    pub accuracy: f64,
    pub timestamp: Timestamp,
}
