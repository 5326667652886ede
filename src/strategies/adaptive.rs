//! §4.4.5 Adaptive.
//!
//! Learns factor weights from observed outcomes. The source recomputed
//! `success_rate` as `selections/selections` (always 1.0); this strategy's
//! metrics use [`AlgorithmMetrics::success_rate`], the corrected ratio.

use parking_lot::Mutex;

use crate::config::StrategyConfig;
use crate::error::Result;
use crate::history::SharedHistory;
use crate::id::NodeId;
use crate::predictor::SharedPredictor;
use crate::task::{AlgorithmMetrics, NodeInfo, SelectionResult, Task};

use super::{no_nodes_available, Strategy};

#[derive(Debug, Clone, Copy)]
struct Weights {
    latency: f64,
    throughput: f64,
    load: f64,
    health: f64,
    performance: f64,
}

impl Weights {
    fn renormalize(&mut self) {
        self.latency = self.latency.max(0.0);
        self.throughput = self.throughput.max(0.0);
        self.load = self.load.max(0.0);
        self.health = self.health.max(0.0);
        self.performance = self.performance.max(0.0);
        let sum = self.latency + self.throughput + self.load + self.health + self.performance;
        if sum > 0.0 {
            self.latency /= sum;
            self.throughput /= sum;
            self.load /= sum;
            self.health /= sum;
            self.performance /= sum;
        }
    }

    fn sum(&self) -> f64 {
        self.latency + self.throughput + self.load + self.health + self.performance
    }
}

struct State {
    weights: Weights,
    metrics: AlgorithmMetrics,
    /// The selections made in this round, so `update_metrics` can look up
    /// which node the weight nudges should apply the preference boost for.
    last_selection: Option<(NodeId, f64)>,
}

pub struct AdaptiveStrategy {
    config: StrategyConfig,
    predictor: SharedPredictor,
    history: SharedHistory,
    state: Mutex<State>,
}

impl AdaptiveStrategy {
    pub fn new(config: StrategyConfig, predictor: SharedPredictor, history: SharedHistory) -> Self {
        let weights = Weights {
            latency: config.adaptive_weight_latency,
            throughput: config.adaptive_weight_throughput,
            load: config.adaptive_weight_load,
            health: config.adaptive_weight_health,
            performance: config.adaptive_weight_performance,
        };
        Self {
            config,
            predictor,
            history,
            state: Mutex::new(State {
                weights,
                metrics: AlgorithmMetrics::default(),
                last_selection: None,
            }),
        }
    }

    /// Current factor weights, exposed for the `weights sum to 1` invariant
    /// check and for the admin/observability surface.
    pub fn weight_sum(&self) -> f64 {
        self.state.lock().weights.sum()
    }

    fn score(&self, weights: &Weights, task: &Task, node: &NodeInfo, preferred_confidence: Option<f64>) -> f64 {
        let prediction = self
            .predictor
            .predict(node.node_id, &task.task_class, node.performance_score, node.load_score);
        let latency_norm = 1.0 / (1.0 + prediction.latency_ms / 100.0);
        let throughput_norm = (prediction.throughput / 100.0).min(1.0);
        let load_norm = (1.0 - node.load_score).max(0.0);

        let base = weights.latency * latency_norm
            + weights.throughput * throughput_norm
            + weights.load * load_norm
            + weights.health * node.health_score
            + weights.performance * node.performance_score;

        match preferred_confidence {
            Some(confidence) if confidence > self.config.adaptive_preference_confidence_floor => {
                base * (1.0 + confidence * self.config.adaptive_preference_boost)
            }
            _ => base,
        }
    }
}

impl Strategy for AdaptiveStrategy {
    fn name(&self) -> &str {
        "adaptive"
    }

    fn select(&self, task: &Task, candidates: &[NodeInfo]) -> Result<Vec<NodeId>> {
        if candidates.is_empty() {
            return Err(no_nodes_available(task));
        }

        let pattern = self.history.pattern(&task.task_class);
        let preferred: Vec<NodeId> = pattern.as_ref().map(|p| p.preferred_nodes.clone()).unwrap_or_default();
        let confidence = pattern.as_ref().map(|p| p.confidence);

        let mut state = self.state.lock();
        let weights = state.weights;

        let best = candidates
            .iter()
            .map(|n| {
                let pref_conf = if preferred.contains(&n.node_id) { confidence } else { None };
                (n.node_id, self.score(&weights, task, n, pref_conf))
            })
            .max_by(|(a_id, a), (b_id, b)| {
                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a_id.cmp(b_id))
            })
            .expect("non-empty candidates");

        state.last_selection = Some(best);
        Ok(vec![best.0])
    }

    fn update_metrics(&self, result: &SelectionResult) {
        let mut state = self.state.lock();
        state.metrics.record(result);

        let lr = self.config.adaptive_learning_rate;
        if result.success {
            if result.latency_ms < self.config.adaptive_latency_success_threshold_ms {
                state.weights.latency += lr * 0.3;
            }
            if result.throughput > self.config.adaptive_throughput_success_threshold {
                state.weights.throughput += lr * 0.2;
            }
        } else {
            state.weights.latency -= lr * 0.5;
            state.weights.load -= lr * 0.3;
        }
        state.weights.renormalize();
    }

    fn should_rebalance(&self, candidates: &[NodeInfo]) -> bool {
        if candidates.len() < 2 {
            return false;
        }
        let loads: Vec<f64> = candidates.iter().map(|n| n.load_score).collect();
        super::variance(loads.into_iter()) > self.config.load_spread_rebalance_threshold
    }

    fn metrics(&self) -> AlgorithmMetrics {
        self.state.lock().metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::task::{NodeCapacity, TaskRequirements};
    use std::sync::Arc;

    fn harness() -> AdaptiveStrategy {
        let history = Arc::new(History::new(128, 3, 10));
        let predictor = Arc::new(crate::predictor::Predictor::new(Default::default(), history.clone()));
        AdaptiveStrategy::new(StrategyConfig::default(), predictor, history)
    }

    fn node(id: &str) -> NodeInfo {
        NodeInfo::new(NodeId::from(id), "addr", NodeCapacity::default())
    }

    fn success(latency_ms: f64) -> SelectionResult {
        SelectionResult {
            selected_nodes: vec![],
            task_class: crate::id::TaskClass::new("inference"),
            success: true,
            latency_ms,
            throughput: 10.0,
            error_kind: None,
        }
    }

    #[test]
    fn weights_always_sum_to_one_after_update() {
        let strategy = harness();
        for _ in 0..20 {
            strategy.update_metrics(&success(50.0));
        }
        assert!((strategy.weight_sum() - 1.0).abs() < 1e-6);

        let failure = SelectionResult { success: false, ..success(500.0) };
        for _ in 0..20 {
            strategy.update_metrics(&failure);
        }
        assert!((strategy.weight_sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fast_node_wins_strictly_more_often_after_learning() {
        let strategy = harness();
        let task = Task::new("inference", TaskRequirements::default());
        let mut fast = node("fast");
        fast.performance_score = 2.0;
        let mut slow = node("slow");
        slow.performance_score = 0.5;
        let candidates = vec![fast, slow];

        for _ in 0..100 {
            strategy.update_metrics(&success(50.0));
        }

        let mut fast_wins = 0;
        for _ in 0..50 {
            let selected = strategy.select(&task, &candidates).unwrap();
            if selected[0] == NodeId::from("fast") {
                fast_wins += 1;
            }
        }
        assert!(fast_wins > 25, "fast node should win strictly more often, got {fast_wins}/50");
    }

    #[test]
    fn single_candidate_always_selected() {
        let strategy = harness();
        let task = Task::new("inference", TaskRequirements::default());
        let selected = strategy.select(&task, &[node("only")]).unwrap();
        assert_eq!(selected, vec![NodeId::from("only")]);
    }
}
