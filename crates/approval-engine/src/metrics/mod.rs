//! Performance monitoring
//!
//! Records per-operation latency distributions, error rates, cache hit
//! rate and workflow lifecycle counters, and evaluates alert thresholds.
//! This component observes; it never blocks or mutates engine operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cache::CacheStats;

/// Histogram for latency measurements
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    /// Raw samples (for percentile calculation)
    samples: Mutex<Vec<Duration>>,
    /// Sum of all samples (for mean calculation)
    sum_micros: AtomicU64,
    /// Count of samples
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a latency sample
    pub fn record(&self, duration: Duration) {
        self.samples.lock().push(duration);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the count of samples
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the mean latency
    pub fn mean(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        let sum = self.sum_micros.load(Ordering::Relaxed);
        Duration::from_micros(sum / count)
    }

    /// Get a percentile (0.0-1.0) from the recorded samples
    pub fn percentile(&self, p: f64) -> Duration {
        let mut samples = self.samples.lock().clone();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.sort_unstable();
        let rank = ((samples.len() as f64 - 1.0) * p).round() as usize;
        samples[rank.min(samples.len() - 1)]
    }

    pub fn p50(&self) -> Duration {
        self.percentile(0.50)
    }

    pub fn p95(&self) -> Duration {
        self.percentile(0.95)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(0.99)
    }
}

/// Alert thresholds evaluated by [`PerformanceMonitor::check_thresholds`]
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// Alert when error rate exceeds this fraction
    pub max_error_rate: f64,

    /// Alert when any operation's p95 exceeds this
    pub max_p95_latency: Duration,

    /// Alert when cache hit rate falls below this fraction...
    pub min_cache_hit_rate: f64,

    /// ...but only once this many cache lookups happened
    pub material_cache_lookups: u64,

    /// Alert when the rejected share of finished workflows exceeds this
    pub max_rejection_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_p95_latency: Duration::from_millis(1000),
            min_cache_hit_rate: 0.50,
            material_cache_lookups: 100,
            max_rejection_rate: 0.30,
        }
    }
}

/// Kind of threshold breach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    ErrorRate,
    Latency,
    CacheHitRate,
    RejectionRate,
}

/// One threshold breach
#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

/// Workflow lifecycle counters
#[derive(Debug, Default)]
struct LifecycleCounters {
    created: AtomicU64,
    approved: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

/// Records operation latencies, outcomes and lifecycle counts
///
/// Cheap to share (`Arc`), safe to call from concurrent operations.
#[derive(Default)]
pub struct PerformanceMonitor {
    histograms: DashMap<&'static str, Arc<LatencyHistogram>>,
    operations: AtomicU64,
    errors: AtomicU64,
    lifecycle: LifecycleCounters,
    thresholds: AlertThresholds,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    /// Record one operation's latency and outcome
    pub fn record_operation(&self, operation: &'static str, elapsed: Duration, ok: bool) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.histogram(operation).record(elapsed);
    }

    /// Time a closure-free scope: call at entry, feed the guard back
    pub fn start(&self, operation: &'static str) -> OperationTimer<'_> {
        OperationTimer {
            monitor: self,
            operation,
            started: Instant::now(),
        }
    }

    fn histogram(&self, operation: &'static str) -> Arc<LatencyHistogram> {
        self.histograms
            .entry(operation)
            .or_insert_with(|| Arc::new(LatencyHistogram::new()))
            .clone()
    }

    /// Histogram for one operation, if it was ever recorded
    pub fn operation_histogram(&self, operation: &str) -> Option<Arc<LatencyHistogram>> {
        self.histograms.get(operation).map(|h| h.clone())
    }

    pub fn record_created(&self) {
        self.lifecycle.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approved(&self) {
        self.lifecycle.approved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.lifecycle.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.lifecycle.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Error rate in [0, 1]
    pub fn error_rate(&self) -> f64 {
        let ops = self.operations();
        if ops == 0 {
            0.0
        } else {
            self.errors() as f64 / ops as f64
        }
    }

    /// Rejected share of finished (approved + rejected) workflows
    pub fn rejection_rate(&self) -> f64 {
        let approved = self.lifecycle.approved.load(Ordering::Relaxed);
        let rejected = self.lifecycle.rejected.load(Ordering::Relaxed);
        let finished = approved + rejected;
        if finished == 0 {
            0.0
        } else {
            rejected as f64 / finished as f64
        }
    }

    pub fn created_count(&self) -> u64 {
        self.lifecycle.created.load(Ordering::Relaxed)
    }

    pub fn approved_count(&self) -> u64 {
        self.lifecycle.approved.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.lifecycle.rejected.load(Ordering::Relaxed)
    }

    pub fn cancelled_count(&self) -> u64 {
        self.lifecycle.cancelled.load(Ordering::Relaxed)
    }

    /// Evaluate all alert thresholds
    ///
    /// `cache_stats` is passed in because the cache is owned by whoever
    /// composed the engine; the monitor holds no reference to it.
    pub fn check_thresholds(&self, cache_stats: &CacheStats) -> Vec<Alert> {
        let mut alerts = vec![];
        let t = &self.thresholds;

        let error_rate = self.error_rate();
        if error_rate > t.max_error_rate {
            alerts.push(Alert {
                kind: AlertKind::ErrorRate,
                message: format!(
                    "error rate {:.1}% exceeds {:.1}%",
                    error_rate * 100.0,
                    t.max_error_rate * 100.0
                ),
            });
        }

        for entry in self.histograms.iter() {
            let p95 = entry.value().p95();
            if p95 > t.max_p95_latency {
                alerts.push(Alert {
                    kind: AlertKind::Latency,
                    message: format!(
                        "{} p95 latency {}ms exceeds {}ms",
                        entry.key(),
                        p95.as_millis(),
                        t.max_p95_latency.as_millis()
                    ),
                });
            }
        }

        if cache_stats.lookups() >= t.material_cache_lookups
            && cache_stats.hit_rate() < t.min_cache_hit_rate
        {
            alerts.push(Alert {
                kind: AlertKind::CacheHitRate,
                message: format!(
                    "cache hit rate {:.1}% below {:.1}% after {} lookups",
                    cache_stats.hit_rate() * 100.0,
                    t.min_cache_hit_rate * 100.0,
                    cache_stats.lookups()
                ),
            });
        }

        let rejection_rate = self.rejection_rate();
        if rejection_rate > t.max_rejection_rate {
            alerts.push(Alert {
                kind: AlertKind::RejectionRate,
                message: format!(
                    "rejection rate {:.1}% exceeds {:.1}%",
                    rejection_rate * 100.0,
                    t.max_rejection_rate * 100.0
                ),
            });
        }

        alerts
    }
}

/// Guard returned by [`PerformanceMonitor::start`]
///
/// Call [`finish`](OperationTimer::finish) with the operation outcome.
pub struct OperationTimer<'a> {
    monitor: &'a PerformanceMonitor,
    operation: &'static str,
    started: Instant,
}

impl OperationTimer<'_> {
    pub fn finish(self, ok: bool) {
        self.monitor
            .record_operation(self.operation, self.started.elapsed(), ok);
    }
}
