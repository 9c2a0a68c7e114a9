//! Metrics collection for load runs
//!
//! Four metric kinds cover every built-in measurement: trends (latency
//! distributions), rates (pass/fail fractions), counters and gauges. All
//! recorders are shared between virtual users behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const DATA_RECEIVED: &str = "data_received";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

/// Kind of a metric, which decides the aggregations available on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Trend,
    Rate,
    Counter,
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Trend => "trend",
            MetricKind::Rate => "rate",
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        };
        f.write_str(name)
    }
}

/// Look up the kind of a built-in metric by name
pub fn builtin_kind(name: &str) -> Option<MetricKind> {
    match name {
        HTTP_REQ_DURATION | ITERATION_DURATION => Some(MetricKind::Trend),
        HTTP_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
        HTTP_REQS | ITERATIONS | DATA_RECEIVED => Some(MetricKind::Counter),
        VUS | VUS_MAX => Some(MetricKind::Gauge),
        _ => None,
    }
}

/// Distribution of millisecond samples
#[derive(Debug)]
pub struct Trend {
    /// Raw samples (for percentile calculation)
    samples: Mutex<Vec<f64>>,
}

impl Default for Trend {
    fn default() -> Self {
        Self::new()
    }
}

impl Trend {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(1024)),
        }
    }

    /// Record a duration sample
    pub fn record(&self, duration: Duration) {
        self.record_ms(duration.as_secs_f64() * 1000.0);
    }

    /// Record a raw millisecond sample
    pub fn record_ms(&self, millis: f64) {
        self.samples.lock().push(millis);
    }

    pub fn count(&self) -> u64 {
        self.samples.lock().len() as u64
    }

    /// Compute summary statistics over all samples recorded so far
    pub fn summary(&self) -> TrendSummary {
        let mut samples = self.samples.lock().clone();
        TrendSummary::from_samples(&mut samples)
    }
}

/// Aggregates of a trend
///
/// Keeps the sorted samples so any percentile can be asked for later.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(skip)]
    sorted: Vec<f64>,
}

impl TrendSummary {
    fn from_samples(samples: &mut Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        samples.sort_by(|a, b| a.total_cmp(b));
        let count = samples.len();
        let sum: f64 = samples.iter().sum();

        let mut summary = Self {
            count: count as u64,
            avg: sum / count as f64,
            min: samples[0],
            max: samples[count - 1],
            sorted: std::mem::take(samples),
            ..Default::default()
        };
        summary.med = summary.percentile(50.0);
        summary.p90 = summary.percentile(90.0);
        summary.p95 = summary.percentile(95.0);
        summary.p99 = summary.percentile(99.0);
        summary
    }

    /// Percentile in `0..=100`, linearly interpolated between ranks
    pub fn percentile(&self, p: f64) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        let p = p.clamp(0.0, 100.0);
        let rank = p / 100.0 * (self.sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let weight = rank - lower as f64;
        self.sorted[lower] + (self.sorted[upper] - self.sorted[lower]) * weight
    }
}

/// Fraction of non-zero samples
#[derive(Debug, Default)]
pub struct Rate {
    passes: AtomicU64,
    fails: AtomicU64,
}

impl Rate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample; `true` counts towards the rate
    pub fn record(&self, hit: bool) {
        if hit {
            self.passes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fails.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn summary(&self) -> RateSummary {
        let passes = self.passes.load(Ordering::Relaxed);
        let fails = self.fails.load(Ordering::Relaxed);
        let total = passes + fails;
        RateSummary {
            rate: if total == 0 {
                0.0
            } else {
                passes as f64 / total as f64
            },
            passes,
            fails,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateSummary {
    pub rate: f64,
    pub passes: u64,
    pub fails: u64,
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_by(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Summary with a per-second rate over `elapsed`
    pub fn summary(&self, elapsed: Duration) -> CounterSummary {
        let count = self.total();
        let secs = elapsed.as_secs_f64();
        CounterSummary {
            count,
            rate: if secs == 0.0 { 0.0 } else { count as f64 / secs },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterSummary {
    pub count: u64,
    pub rate: f64,
}

/// Last-value gauge that also remembers its extremes
#[derive(Debug)]
pub struct Gauge {
    value: AtomicI64,
    min: AtomicI64,
    max: AtomicI64,
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
            min: AtomicI64::new(i64::MAX),
            max: AtomicI64::new(i64::MIN),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn summary(&self) -> GaugeSummary {
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);
        if min == i64::MAX {
            return GaugeSummary::default();
        }
        GaugeSummary {
            value: self.value.load(Ordering::Relaxed),
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GaugeSummary {
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

/// Per-check pass/fail tally
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

/// Aggregate of one metric at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Trend(TrendSummary),
    Rate(RateSummary),
    Counter(CounterSummary),
    Gauge(GaugeSummary),
}

impl MetricSummary {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSummary::Trend(_) => MetricKind::Trend,
            MetricSummary::Rate(_) => MetricKind::Rate,
            MetricSummary::Counter(_) => MetricKind::Counter,
            MetricSummary::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Whether anything was recorded yet. Gauges are sampled by the
    /// controller from the first tick on, so they always count as sampled.
    pub fn has_samples(&self) -> bool {
        match self {
            MetricSummary::Trend(t) => t.count > 0,
            MetricSummary::Rate(r) => r.passes + r.fails > 0,
            MetricSummary::Counter(c) => c.count > 0,
            MetricSummary::Gauge(_) => true,
        }
    }
}

/// All metrics of a run
pub struct RunMetrics {
    pub http_reqs: Arc<Counter>,
    pub http_req_duration: Arc<Trend>,
    pub http_req_failed: Arc<Rate>,
    pub checks: Arc<Rate>,
    pub iterations: Arc<Counter>,
    pub iteration_duration: Arc<Trend>,
    pub data_received: Arc<Counter>,
    pub vus: Arc<Gauge>,
    pub vus_max: Arc<Gauge>,
    /// Per-check tallies, keyed by check name
    check_tallies: Mutex<BTreeMap<String, CheckTally>>,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            http_reqs: Arc::new(Counter::new()),
            http_req_duration: Arc::new(Trend::new()),
            http_req_failed: Arc::new(Rate::new()),
            checks: Arc::new(Rate::new()),
            iterations: Arc::new(Counter::new()),
            iteration_duration: Arc::new(Trend::new()),
            data_received: Arc::new(Counter::new()),
            vus: Arc::new(Gauge::new()),
            vus_max: Arc::new(Gauge::new()),
            check_tallies: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record the outcome of one named check
    pub fn record_check(&self, name: &str, passed: bool) {
        self.checks.record(passed);
        let mut tallies = self.check_tallies.lock();
        let tally = tallies.entry(name.to_string()).or_default();
        if passed {
            tally.passes += 1;
        } else {
            tally.fails += 1;
        }
    }

    /// Snapshot of per-check tallies
    pub fn check_tallies(&self) -> BTreeMap<String, CheckTally> {
        self.check_tallies.lock().clone()
    }

    /// Summarize one metric by name; `elapsed` feeds counter rates
    pub fn summary(&self, name: &str, elapsed: Duration) -> Option<MetricSummary> {
        let summary = match name {
            HTTP_REQS => MetricSummary::Counter(self.http_reqs.summary(elapsed)),
            HTTP_REQ_DURATION => MetricSummary::Trend(self.http_req_duration.summary()),
            HTTP_REQ_FAILED => MetricSummary::Rate(self.http_req_failed.summary()),
            CHECKS => MetricSummary::Rate(self.checks.summary()),
            ITERATIONS => MetricSummary::Counter(self.iterations.summary(elapsed)),
            ITERATION_DURATION => MetricSummary::Trend(self.iteration_duration.summary()),
            DATA_RECEIVED => MetricSummary::Counter(self.data_received.summary(elapsed)),
            VUS => MetricSummary::Gauge(self.vus.summary()),
            VUS_MAX => MetricSummary::Gauge(self.vus_max.summary()),
            _ => return None,
        };
        Some(summary)
    }

    /// Summaries of every built-in metric, sorted by name
    pub fn summaries(&self, elapsed: Duration) -> BTreeMap<String, MetricSummary> {
        [
            CHECKS,
            DATA_RECEIVED,
            HTTP_REQ_DURATION,
            HTTP_REQ_FAILED,
            HTTP_REQS,
            ITERATION_DURATION,
            ITERATIONS,
            VUS,
            VUS_MAX,
        ]
        .into_iter()
        .filter_map(|name| {
            self.summary(name, elapsed)
                .map(|summary| (name.to_string(), summary))
        })
        .collect()
    }
}
