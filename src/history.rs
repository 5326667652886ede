//! Request History / Pattern Store — rolling outcome windows and the
//! per-task-class preferred-node pattern used by the locality and adaptive
//! strategies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::id::{NodeId, TaskClass};
use crate::task::{LoadSnapshot, RequestPattern, SelectionResult};
use crate::time::Timestamp;

/// A single recorded outcome for a (node, task class) pair.
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    pub latency_ms: f64,
    pub throughput: f64,
    pub success: bool,
}

#[derive(Default)]
struct ClassHistory {
    /// Bounded per the predictor's `window` config; oldest evicted first.
    outcomes: HashMap<NodeId, VecDeque<Outcome>>,
    pattern: Option<RequestPattern>,
}

/// Rolling window of (task-class -> preferred-nodes, observed latency)
/// tuples, shared read-only by the Locality-Aware and Adaptive strategies.
pub struct History {
    window: usize,
    preferred_bound: usize,
    by_class: RwLock<HashMap<TaskClass, ClassHistory>>,
    snapshots: RwLock<VecDeque<LoadSnapshot>>,
    snapshot_buffer_size: usize,
}

impl History {
    pub fn new(window: usize, preferred_bound: usize, snapshot_buffer_size: usize) -> Self {
        Self {
            window,
            preferred_bound,
            by_class: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(VecDeque::new()),
            snapshot_buffer_size,
        }
    }

    pub fn record(&self, node_id: NodeId, result: &SelectionResult) {
        let mut by_class = self.by_class.write();
        let class_history = by_class.entry(result.task_class.clone()).or_default();
        let outcomes = class_history.outcomes.entry(node_id).or_default();
        outcomes.push_back(Outcome {
            latency_ms: result.latency_ms,
            throughput: result.throughput,
            success: result.success,
        });
        while outcomes.len() > self.window {
            outcomes.pop_front();
        }
    }

    /// Rolling mean (latency, throughput) for a node/class pair over the
    /// window, plus the sample count backing it.
    pub fn rolling_stats(&self, node_id: NodeId, task_class: &TaskClass) -> Option<(f64, f64, usize)> {
        let by_class = self.by_class.read();
        let outcomes = by_class.get(task_class)?.outcomes.get(&node_id)?;
        if outcomes.is_empty() {
            return None;
        }
        let n = outcomes.len();
        let latency = outcomes.iter().map(|o| o.latency_ms).sum::<f64>() / n as f64;
        let throughput = outcomes.iter().map(|o| o.throughput).sum::<f64>() / n as f64;
        Some((latency, throughput, n))
    }

    /// Promote `node_id` into the preferred-node list for `task_class`,
    /// evicting the least-recently-used entry once `preferred_bound` is
    /// reached.
    pub fn touch_preference(&self, task_class: &TaskClass, node_id: NodeId, confidence: f64) {
        let mut by_class = self.by_class.write();
        let class_history = by_class.entry(task_class.clone()).or_default();
        let pattern = class_history.pattern.get_or_insert_with(|| RequestPattern {
            task_class: task_class.clone(),
            preferred_nodes: Vec::new(),
            confidence,
            last_updated: Timestamp::now(),
        });

        pattern.preferred_nodes.retain(|n| *n != node_id);
        pattern.preferred_nodes.insert(0, node_id);
        if pattern.preferred_nodes.len() > self.preferred_bound {
            pattern.preferred_nodes.truncate(self.preferred_bound);
        }
        pattern.confidence = confidence.clamp(0.0, 1.0);
        pattern.last_updated = Timestamp::now();
    }

    pub fn preferred_nodes(&self, task_class: &TaskClass) -> Vec<NodeId> {
        self.by_class
            .read()
            .get(task_class)
            .and_then(|c| c.pattern.as_ref())
            .map(|p| p.preferred_nodes.clone())
            .unwrap_or_default()
    }

    pub fn pattern(&self, task_class: &TaskClass) -> Option<RequestPattern> {
        self.by_class.read().get(task_class).and_then(|c| c.pattern.clone())
    }

    /// Append a snapshot to the bounded ring buffer, discarding the oldest
    /// entry once `snapshot_buffer_size` is exceeded.
    pub fn push_snapshot(&self, snapshot: LoadSnapshot) {
        let mut snapshots = self.snapshots.write();
        snapshots.push_back(snapshot);
        while snapshots.len() > self.snapshot_buffer_size {
            snapshots.pop_front();
        }
    }

    pub fn recent_snapshots(&self, n: usize) -> Vec<LoadSnapshot> {
        let snapshots = self.snapshots.read();
        snapshots.iter().rev().take(n).cloned().collect()
    }
}

pub type SharedHistory = Arc<History>;

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task_class: &str, latency_ms: f64, throughput: f64, success: bool) -> SelectionResult {
        SelectionResult {
            selected_nodes: vec![],
            task_class: TaskClass::new(task_class),
            success,
            latency_ms,
            throughput,
            error_kind: None,
        }
    }

    #[test]
    fn rolling_stats_window_is_bounded() {
        let history = History::new(3, 3, 10);
        let node = NodeId::from("a");
        for i in 0..10 {
            history.record(node, &result("inference", i as f64, 10.0, true));
        }
        let (latency, _, count) = history.rolling_stats(node, &TaskClass::new("inference")).unwrap();
        assert_eq!(count, 3);
        // last 3 latencies are 7, 8, 9
        assert!((latency - 8.0).abs() < 1e-9);
    }

    #[test]
    fn preferred_nodes_bounded_at_three() {
        let history = History::new(128, 3, 10);
        let class = TaskClass::new("inference");
        for i in 0..5 {
            history.touch_preference(&class, NodeId::from(format!("n{i}").as_str()), 0.9);
        }
        assert_eq!(history.preferred_nodes(&class).len(), 3);
    }

    #[test]
    fn touching_an_existing_preference_moves_it_to_front() {
        let history = History::new(128, 3, 10);
        let class = TaskClass::new("inference");
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        history.touch_preference(&class, a, 0.9);
        history.touch_preference(&class, b, 0.9);
        history.touch_preference(&class, a, 0.9);

        assert_eq!(history.preferred_nodes(&class)[0], a);
    }

    #[test]
    fn snapshot_ring_buffer_discards_oldest() {
        let history = History::new(128, 3, 2);
        for i in 0..5u64 {
            history.push_snapshot(LoadSnapshot {
                timestamp: Timestamp::from_secs(i),
                active_nodes: 1,
                per_node_load: HashMap::new(),
                mean: 0.0,
                variance: 0.0,
                imbalance: 0.0,
            });
        }
        assert_eq!(history.recent_snapshots(10).len(), 2);
    }
}
