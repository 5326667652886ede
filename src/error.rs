//! Scheduler error types.

use crate::id::{ModelId, NodeId, TaskId};

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// The complete scheduler error taxonomy (see component design for where
/// each variant is raised and how it is handled).
#[derive(thiserror::Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("no nodes available for task {task_id}")]
    NoNodesAvailable { task_id: TaskId },

    #[error("admission rejected task {task_id}: busy, retry after {retry_after_ms}ms")]
    Busy {
        task_id: TaskId,
        retry_after_ms: u64,
    },

    #[error("deadline exceeded for task {task_id}")]
    DeadlineExceeded { task_id: TaskId },

    #[error("worker {node_id} returned a transient error: {message}")]
    WorkerTransient { node_id: NodeId, message: String },

    #[error("worker {node_id} returned a permanent error: {message}")]
    WorkerPermanent { node_id: NodeId, message: String },

    #[error("worker {node_id} is overloaded")]
    WorkerOverloaded { node_id: NodeId },

    #[error("worker {node_id} does not have model {model_id} resident")]
    WorkerNotFound { node_id: NodeId, model_id: ModelId },

    #[error("strategy {strategy} failed: {message}")]
    StrategyFailure { strategy: String, message: String },

    #[error("replicated placement log unavailable: {message}")]
    ConsensusUnavailable { message: String },

    #[error("node {node_id} is unknown to the registry")]
    UnknownNode { node_id: NodeId },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("placement log checkpoint schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("internal scheduler error: {message}")]
    Internal { message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("join error: {0}")]
    Join(String),

    #[error("time error: {0}")]
    Time(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(err: tokio::task::JoinError) -> Self {
        SchedulerError::Join(err.to_string())
    }
}

impl From<std::time::SystemTimeError> for SchedulerError {
    fn from(err: std::time::SystemTimeError) -> Self {
        SchedulerError::Time(err.to_string())
    }
}

impl SchedulerError {
    /// Whether the caller (or the dispatcher, for worker errors) should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Busy { .. }
                | SchedulerError::WorkerTransient { .. }
                | SchedulerError::WorkerOverloaded { .. }
                | SchedulerError::ConsensusUnavailable { .. }
        )
    }

    /// Whether this error should ever reach the client, vs. being handled
    /// and counted internally.
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            SchedulerError::NoNodesAvailable { .. }
                | SchedulerError::Busy { .. }
                | SchedulerError::DeadlineExceeded { .. }
                | SchedulerError::Internal { .. }
        )
    }

    pub fn category(&self) -> &'static str {
        match self {
            SchedulerError::NoNodesAvailable { .. } => "no_nodes_available",
            SchedulerError::Busy { .. } => "busy",
            SchedulerError::DeadlineExceeded { .. } => "deadline_exceeded",
            SchedulerError::WorkerTransient { .. } => "worker_transient",
            SchedulerError::WorkerPermanent { .. } => "worker_permanent",
            SchedulerError::WorkerOverloaded { .. } => "worker_overloaded",
            SchedulerError::WorkerNotFound { .. } => "worker_not_found",
            SchedulerError::StrategyFailure { .. } => "strategy_failure",
            SchedulerError::ConsensusUnavailable { .. } => "consensus_unavailable",
            SchedulerError::UnknownNode { .. } => "unknown_node",
            SchedulerError::Configuration { .. } => "configuration",
            SchedulerError::SchemaMismatch { .. } => "schema_mismatch",
            SchedulerError::Internal { .. } => "internal",
            SchedulerError::Serialization(_) => "serialization",
            SchedulerError::Io(_) => "io",
            SchedulerError::Join(_) => "join",
            SchedulerError::Time(_) => "time",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SchedulerError::SchemaMismatch { .. } | SchedulerError::Configuration { .. } => {
                ErrorSeverity::Critical
            }
            SchedulerError::WorkerPermanent { .. } | SchedulerError::UnknownNode { .. } => {
                ErrorSeverity::High
            }
            SchedulerError::NoNodesAvailable { .. }
            | SchedulerError::StrategyFailure { .. }
            | SchedulerError::ConsensusUnavailable { .. } => ErrorSeverity::Medium,
            _ => ErrorSeverity::Low,
        }
    }

    /// The reason code the client interface reports for a rejected submission.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SchedulerError::NoNodesAvailable { .. } => "NoNodesAvailable",
            SchedulerError::Busy { .. } => "Busy",
            SchedulerError::DeadlineExceeded { .. } => "DeadlineExceeded",
            _ => "InternalError",
        }
    }
}

/// Error severity levels used by the admin/observability surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}
