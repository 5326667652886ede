//! §4.3 Performance Predictor — explicit, lightweight scoring, not a
//! learned model. Pure function over the rolling history plus current load.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PredictorConfig;
use crate::history::SharedHistory;
use crate::id::{NodeId, TaskClass};
use crate::task::PredictionRecord;
use crate::time::Timestamp;

#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub latency_ms: f64,
    pub throughput: f64,
}

/// Predicts latency/throughput for a (node, task class) pair and tracks its
/// own accuracy against observed outcomes.
pub struct Predictor {
    config: PredictorConfig,
    history: SharedHistory,
    records: Mutex<Vec<PredictionRecord>>,
}

impl Predictor {
    pub fn new(config: PredictorConfig, history: SharedHistory) -> Self {
        Self {
            config,
            history,
            records: Mutex::new(Vec::new()),
        }
    }

    /// §4.3 algorithm: rolling mean if enough samples exist, else a
    /// capacity-derived estimate; then mix in current load.
    pub fn predict(
        &self,
        node_id: NodeId,
        task_class: &TaskClass,
        performance_score: f64,
        load_score: f64,
    ) -> Prediction {
        let (mut latency, mut throughput) = match self.history.rolling_stats(node_id, task_class) {
            Some((latency, throughput, n)) if n >= self.config.min_samples => (latency, throughput),
            _ => (
                self.config.baseline_latency_ms / performance_score.max(1.0),
                self.config.baseline_throughput * performance_score,
            ),
        };

        let load_factor = 1.0 + self.config.load_mix_k * load_score;
        latency *= load_factor;
        throughput /= load_factor;

        Prediction {
            latency_ms: latency,
            throughput,
        }
    }

    /// Record an observed outcome against a prior prediction, updating
    /// accuracy as `1 - |pred - actual| / max(pred, actual)`, clamped to [0,1].
    pub fn observe(
        &self,
        node_id: NodeId,
        task_class: TaskClass,
        prediction: Prediction,
        actual_latency_ms: f64,
        actual_throughput: f64,
    ) {
        let latency_accuracy = accuracy(prediction.latency_ms, actual_latency_ms);
        let throughput_accuracy = accuracy(prediction.throughput, actual_throughput);
        let accuracy = (latency_accuracy + throughput_accuracy) / 2.0;

        self.records.lock().push(PredictionRecord {
            node_id,
            task_class,
            predicted_latency_ms: prediction.latency_ms,
            actual_latency_ms,
            predicted_throughput: prediction.throughput,
            actual_throughput,
            accuracy,
            timestamp: Timestamp::now(),
        });
    }

    /// Mean accuracy across all recorded predictions, or 1.0 if none yet.
    pub fn mean_accuracy(&self) -> f64 {
        let records = self.records.lock();
        if records.is_empty() {
            return 1.0;
        }
        records.iter().map(|r| r.accuracy).sum::<f64>() / records.len() as f64
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

fn accuracy(predicted: f64, actual: f64) -> f64 {
    let denom = predicted.max(actual);
    if denom <= 0.0 {
        return 1.0;
    }
    (1.0 - (predicted - actual).abs() / denom).clamp(0.0, 1.0)
}

pub type SharedPredictor = Arc<Predictor>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;

    #[test]
    fn falls_back_to_capacity_estimate_below_min_samples() {
        let history = Arc::new(History::new(128, 3, 10));
        let predictor = Predictor::new(PredictorConfig::default(), history);

        let prediction = predictor.predict(NodeId::from("a"), &TaskClass::new("inference"), 2.0, 0.0);
        assert!((prediction.latency_ms - 100.0).abs() < 1e-9);
        assert!((prediction.throughput - 40.0).abs() < 1e-9);
    }

    #[test]
    fn load_increases_predicted_latency_and_decreases_throughput() {
        let history = Arc::new(History::new(128, 3, 10));
        let predictor = Predictor::new(PredictorConfig::default(), history);

        let idle = predictor.predict(NodeId::from("a"), &TaskClass::new("inference"), 1.0, 0.0);
        let busy = predictor.predict(NodeId::from("a"), &TaskClass::new("inference"), 1.0, 1.0);

        assert!(busy.latency_ms > idle.latency_ms);
        assert!(busy.throughput < idle.throughput);
    }

    #[test]
    fn observe_tracks_accuracy() {
        let history = Arc::new(History::new(128, 3, 10));
        let predictor = Predictor::new(PredictorConfig::default(), history);
        let prediction = Prediction { latency_ms: 100.0, throughput: 50.0 };

        predictor.observe(NodeId::from("a"), TaskClass::new("inference"), prediction, 100.0, 50.0);
        assert!((predictor.mean_accuracy() - 1.0).abs() < 1e-9);

        predictor.observe(NodeId::from("a"), TaskClass::new("inference"), prediction, 200.0, 50.0);
        assert!(predictor.mean_accuracy() < 1.0);
    }
}
