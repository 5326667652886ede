//! Scheduler and load-balancing subsystem for a cluster of inference
//! workers: node registry, health monitoring, a pluggable strategy set,
//! admission control, dispatch, and leader-gated rebalancing, with a small
//! replicated log for the state that must survive failover.

pub mod admission;
pub mod arbiter;
pub mod config;
pub mod consensus;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod history;
pub mod id;
pub mod membership;
pub mod metrics;
pub mod placement_log;
pub mod predictor;
pub mod rebalancer;
pub mod registry;
pub mod scheduler;
pub mod strategies;
pub mod task;
pub mod time;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use id::{IdempotencyKey, ModelId, NodeId, TaskClass, TaskId};
pub use scheduler::{Scheduler, SchedulerSnapshot, TerminalState};
pub use task::Task;

/// Current schema version of the replicated placement log.
pub const PLACEMENT_LOG_SCHEMA_VERSION: u32 = placement_log::CURRENT_SCHEMA_VERSION;

/// Initialize process-wide tracing. Safe to call more than once; a second
/// call is a no-op if a subscriber is already installed.
pub fn init() -> Result<()> {
    if tracing_subscriber::fmt()
        .with_env_filter("scheduler=info")
        .with_target(false)
        .try_init()
        .is_err()
    {
        // Subscriber already installed by the host process; that's fine.
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "scheduler initialized");
    Ok(())
}
