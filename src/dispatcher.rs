//! §4.7 Dispatcher — forwards accepted tasks to the chosen node and feeds
//! outcomes back into the Node Registry, Predictor, and History.

use std::sync::Arc;

use tracing::{info, warn};

use crate::admission::Admitted;
use crate::config::DispatcherConfig;
use crate::error::{Result, SchedulerError};
use crate::history::SharedHistory;
use crate::id::NodeId;
use crate::metrics::{names, MetricsCollector};
use crate::predictor::SharedPredictor;
use crate::registry::Registry;
use crate::strategies::{LocalityAwareStrategy, Strategy};
use crate::task::{SelectionResult, Task, TaskState};
use crate::worker::{RunTaskOutcome, WorkerClient, WorkerError};

pub struct Dispatcher<W: WorkerClient> {
    config: DispatcherConfig,
    worker: W,
    registry: Arc<Registry>,
    predictor: SharedPredictor,
    history: SharedHistory,
    metrics: Arc<MetricsCollector>,
    /// Outside the uniform `Strategy` contract: `NotFound` is the one worker
    /// error that must invalidate the locality cache specifically, per §6.
    locality: Arc<LocalityAwareStrategy>,
}

impl<W: WorkerClient> Dispatcher<W> {
    pub fn new(
        config: DispatcherConfig,
        worker: W,
        registry: Arc<Registry>,
        predictor: SharedPredictor,
        history: SharedHistory,
        metrics: Arc<MetricsCollector>,
        locality: Arc<LocalityAwareStrategy>,
    ) -> Self {
        Self {
            config,
            worker,
            registry,
            predictor,
            history,
            metrics,
            locality,
        }
    }

    /// Dispatch the task to `admitted.primary`; on a transient transport
    /// failure, retry exactly once against the next fallback node from the
    /// strategy's own ranked list. Application-level (`Permanent`) failures
    /// are never retried.
    pub async fn dispatch(&self, mut task: Task, admitted: Admitted) -> Result<RunTaskOutcome> {
        let _timer = crate::metrics::Timer::new(names::DISPATCH_DURATION, self.metrics.clone());

        let strategy = admitted.strategy.as_ref();
        let mut target = admitted.primary;
        let mut fallbacks = admitted.fallbacks.into_iter();
        let mut retries_used = 0;

        loop {
            let outcome = tokio::time::timeout(self.config.dispatch_timeout, self.worker.run_task(target, &task)).await;

            match outcome {
                Ok(Ok(result)) => {
                    self.on_success(target, &task, &result, strategy).await;
                    task.state = TaskState::Succeeded;
                    return Ok(result);
                }
                Ok(Err(WorkerError::Transient(message))) if retries_used < self.config.max_retries => {
                    warn!(node_id = %target, message, "transient worker error, retrying");
                    self.on_failure(target, &task, strategy, Some("transient")).await;
                    retries_used += 1;
                    self.metrics.increment_counter(names::DISPATCH_RETRIES, 1);
                    match fallbacks.next() {
                        Some(next) => target = next,
                        None => {
                            task.state = TaskState::Failed;
                            return Err(SchedulerError::WorkerTransient { node_id: target, message });
                        }
                    }
                }
                Ok(Err(WorkerError::Transient(message))) => {
                    self.on_failure(target, &task, strategy, Some("transient")).await;
                    task.state = TaskState::Failed;
                    return Err(SchedulerError::WorkerTransient { node_id: target, message });
                }
                Ok(Err(WorkerError::Permanent(message))) => {
                    self.on_failure(target, &task, strategy, Some("permanent")).await;
                    task.state = TaskState::Failed;
                    return Err(SchedulerError::WorkerPermanent { node_id: target, message });
                }
                Ok(Err(WorkerError::Overloaded)) => {
                    self.on_failure(target, &task, strategy, Some("overloaded")).await;
                    task.state = TaskState::Failed;
                    return Err(SchedulerError::WorkerOverloaded { node_id: target });
                }
                Ok(Err(WorkerError::NotFound { model_id })) => {
                    self.on_failure(target, &task, strategy, Some("not_found")).await;
                    self.locality.mark_evicted(model_id.clone(), target);
                    task.state = TaskState::Failed;
                    return Err(SchedulerError::WorkerNotFound { node_id: target, model_id });
                }
                Err(_elapsed) => {
                    self.on_failure(target, &task, strategy, Some("timeout")).await;
                    task.state = TaskState::Failed;
                    return Err(SchedulerError::WorkerTransient {
                        node_id: target,
                        message: "dispatch timed out".to_string(),
                    });
                }
            }
        }
    }

    /// Cooperative cancellation: best-effort remote cancel; the slot is
    /// released by the caller regardless, and this is not counted as a
    /// strategy failure since it was not the node's fault.
    pub async fn cancel(&self, node_id: NodeId, task: &Task) {
        self.worker.cancel(node_id, task).await;
        info!(%node_id, task_id = %task.task_id, "dispatch cancelled");
    }

    async fn on_success(&self, node_id: NodeId, task: &Task, result: &RunTaskOutcome, strategy: &dyn Strategy) {
        self.apply_ewma_latency(node_id, result.latency_ms).await;

        let selection = SelectionResult {
            selected_nodes: vec![node_id],
            task_class: task.task_class.clone(),
            success: true,
            latency_ms: result.latency_ms,
            throughput: result.throughput,
            error_kind: None,
        };
        strategy.update_metrics(&selection);
        self.history.record(node_id, &selection);
        self.history
            .touch_preference(&task.task_class, node_id, strategy.metrics().success_rate());

        let prediction = self
            .predictor
            .predict(node_id, &task.task_class, 1.0, 0.0);
        self.predictor
            .observe(node_id, task.task_class.clone(), prediction, result.latency_ms, result.throughput);
    }

    async fn on_failure(&self, node_id: NodeId, task: &Task, strategy: &dyn Strategy, error_kind: Option<&str>) {
        let selection = SelectionResult {
            selected_nodes: vec![node_id],
            task_class: task.task_class.clone(),
            success: false,
            latency_ms: 0.0,
            throughput: 0.0,
            error_kind: error_kind.map(str::to_string),
        };
        strategy.update_metrics(&selection);
        self.history.record(node_id, &selection);
    }

    /// Response-time EWMA: `new = (old + observed) / 2`, per §4.7.
    async fn apply_ewma_latency(&self, node_id: NodeId, observed_ms: f64) {
        if let Some(node) = self.registry.get(node_id).await {
            let new_latency = (node.latency_ms + observed_ms) / 2.0;
            self.registry.set_latency(node_id, new_latency).await;
        }
    }
}
