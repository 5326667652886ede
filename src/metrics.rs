//! In-process metrics collection for the scheduler.
//!
//! No external exporter is wired up here — shipping metrics to Prometheus,
//! StatsD, or similar is an external collaborator's job. This module only
//! keeps the numbers the admin/observability interface and `AlgorithmMetrics`
//! need to read back.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thread-safe metrics collector. Counters and gauges are created lazily on
/// first use so callers never need to pre-register a metric name.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicU64>,
    histograms: DashMap<String, Arc<Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, value: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn record_histogram(&self, name: &str, value: Duration) {
        self.histogram(name).record(value);
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn get_gauge(&self, name: &str) -> u64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Fetch (creating if absent) the named histogram, for use with [`Timer`].
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new()))
            .clone()
    }
}

/// Simple histogram implementation for latency tracking, backed by a
/// bounded sample buffer so percentile queries stay cheap.
#[derive(Debug)]
pub struct Histogram {
    samples: parking_lot::Mutex<Vec<u64>>,
    count: AtomicU64,
    sum: AtomicU64,
}

const MAX_SAMPLES: usize = 1000;

impl Histogram {
    pub fn new() -> Self {
        Self {
            samples: parking_lot::Mutex::new(Vec::new()),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    pub fn record(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;

        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(micros, Ordering::Relaxed);

        let mut samples = self.samples.lock();
        samples.push(micros);
        if samples.len() > MAX_SAMPLES {
            samples.remove(0);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn average(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    pub fn percentile(&self, p: f64) -> u64 {
        let mut samples = self.samples.lock();
        if samples.is_empty() {
            return 0;
        }

        samples.sort_unstable();
        let index = ((samples.len() - 1) as f64 * p / 100.0) as usize;
        samples[index]
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer helper that records its elapsed duration into a named histogram
/// when dropped, so a function body can just hold the guard.
pub struct Timer {
    start: Instant,
    name: String,
    collector: Arc<MetricsCollector>,
}

impl Timer {
    pub fn new(name: impl Into<String>, collector: Arc<MetricsCollector>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
            collector,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.collector.record_histogram(&self.name, duration);
    }
}

/// Metric name constants used across the scheduler's components.
pub mod names {
    pub const SELECTIONS_TOTAL: &str = "scheduler.selections.total";
    pub const SELECTION_DURATION: &str = "scheduler.selection.duration";
    pub const DISPATCH_DURATION: &str = "scheduler.dispatch.duration";
    pub const DISPATCH_RETRIES: &str = "scheduler.dispatch.retries";
    pub const ADMISSION_REJECTED: &str = "scheduler.admission.rejected";
    pub const ADMISSION_ACCEPTED: &str = "scheduler.admission.accepted";
    pub const CIRCUIT_OPENED: &str = "scheduler.circuit.opened";
    pub const CIRCUIT_HALF_OPENED: &str = "scheduler.circuit.half_opened";
    pub const REBALANCE_CYCLES: &str = "scheduler.rebalance.cycles";
    pub const REBALANCE_MIGRATIONS: &str = "scheduler.rebalance.migrations";
    pub const STRATEGY_FAILURES: &str = "scheduler.strategy.failures";
    pub const PREDICTOR_ACCURACY: &str = "scheduler.predictor.accuracy_bp";
}
