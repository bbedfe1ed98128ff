//! Fiber Metrics
//!
//! Each runtime owns one [`FiberMetrics`]. The interpreter records into it
//! when `RuntimeConfig::metrics_enabled` is set; recording never changes
//! scheduling or results.
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `fiber_started` | counter | |
//! | `fiber_successes` | counter | |
//! | `fiber_failures` | counter | `kind` = `fail` / `die` / `interrupt` |
//! | `fiber_fork_locations` | frequency table | `file:line` |
//! | `fiber_lifetimes` | histogram (seconds) | |

use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// A metric label (key-value pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Create a new label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: String,
    labels: Vec<Label>,
    value: AtomicU64,
}

impl Counter {
    fn new(name: impl Into<String>, labels: Vec<Label>) -> Self {
        Self {
            name: name.into(),
            labels,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the counter labels.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }
}

/// A histogram for measuring distributions.
#[derive(Debug)]
pub struct Histogram {
    name: String,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum: Mutex<f64>,
}

impl Histogram {
    /// Default bucket boundaries (in seconds).
    pub const DEFAULT_BUCKETS: [f64; 11] = [
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    fn new(name: impl Into<String>) -> Self {
        let buckets = Self::DEFAULT_BUCKETS.to_vec();
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name: name.into(),
            buckets,
            bucket_counts,
            count: AtomicU64::new(0),
            sum: Mutex::new(0.0),
        }
    }

    /// Get the histogram name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.sum.lock() += value;

        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Get the total count of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the sum of all observations.
    pub fn sum(&self) -> f64 {
        *self.sum.lock()
    }

    /// Get the bucket boundaries.
    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    /// Get the bucket counts. Observations above the last boundary are
    /// only reflected in [`Histogram::count`].
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.bucket_counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

/// Occurrence counts per distinct key.
#[derive(Debug)]
pub struct FrequencyTable {
    name: String,
    counts: Mutex<HashMap<String, u64>>,
}

impl FrequencyTable {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Get the table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Count one occurrence of `key`.
    pub fn observe(&self, key: &str) {
        *self.counts.lock().entry(key.to_string()).or_insert(0) += 1;
    }

    /// Occurrences of `key` so far.
    pub fn get(&self, key: &str) -> u64 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    /// All keys and counts, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self
            .counts
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }
}

/// Per-runtime fiber lifecycle metrics.
#[derive(Debug)]
pub struct FiberMetrics {
    started: Counter,
    successes: Counter,
    failures: [Counter; 3],
    fork_locations: FrequencyTable,
    lifetimes: Histogram,
}

const FAILURE_KINDS: [&str; 3] = ["fail", "die", "interrupt"];

impl Default for FiberMetrics {
    fn default() -> Self {
        Self {
            started: Counter::new("fiber_started", Vec::new()),
            successes: Counter::new("fiber_successes", Vec::new()),
            failures: FAILURE_KINDS.map(|kind| Counter::new("fiber_failures", vec![Label::new("kind", kind)])),
            fork_locations: FrequencyTable::new("fiber_fork_locations"),
            lifetimes: Histogram::new("fiber_lifetimes"),
        }
    }
}

impl FiberMetrics {
    /// Fibers started.
    pub fn started(&self) -> &Counter {
        &self.started
    }

    /// Fibers that completed successfully.
    pub fn successes(&self) -> &Counter {
        &self.successes
    }

    /// Fibers that failed with the given cause kind (`fail`, `die` or
    /// `interrupt`).
    pub fn failures(&self, kind: &str) -> Option<&Counter> {
        FAILURE_KINDS
            .iter()
            .position(|k| *k == kind)
            .map(|i| &self.failures[i])
    }

    /// Where fibers were forked from.
    pub fn fork_locations(&self) -> &FrequencyTable {
        &self.fork_locations
    }

    /// Fiber lifetimes in seconds.
    pub fn lifetimes(&self) -> &Histogram {
        &self.lifetimes
    }

    pub(crate) fn record_start(&self, location: &Location<'_>) {
        self.started.inc();
        self.fork_locations
            .observe(&format!("{}:{}", location.file(), location.line()));
    }

    /// `failure` is the cause kind of a failed exit, `None` on success.
    pub(crate) fn record_end(&self, failure: Option<&str>, lifetime: Duration) {
        match failure {
            None => self.successes.inc(),
            Some(kind) => {
                if let Some(counter) = self.failures(kind) {
                    counter.inc();
                }
            }
        }
        self.lifetimes.observe(lifetime.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let h = Histogram::new("h");
        h.observe(0.003);
        h.observe(0.3);
        h.observe(42.0);
        assert_eq!(h.count(), 3);
        let counts = h.bucket_counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[6], 1);
        assert_eq!(counts.iter().sum::<u64>(), 2);
        assert!((h.sum() - 42.303).abs() < 1e-9);
    }

    #[test]
    fn test_frequency_table() {
        let t = FrequencyTable::new("t");
        t.observe("a.rs:1");
        t.observe("a.rs:1");
        t.observe("b.rs:2");
        assert_eq!(t.get("a.rs:1"), 2);
        assert_eq!(t.get("c.rs:3"), 0);
        assert_eq!(t.snapshot()[1], ("b.rs:2".to_string(), 1));
    }

    #[test]
    fn test_fiber_metrics_record() {
        let m = FiberMetrics::default();
        m.record_start(Location::caller());
        m.record_end(None, Duration::from_millis(2));
        m.record_end(Some("interrupt"), Duration::from_millis(2));
        m.record_end(Some("empty"), Duration::from_millis(2));
        assert_eq!(m.started().get(), 1);
        assert_eq!(m.successes().get(), 1);
        assert_eq!(m.failures("interrupt").map(Counter::get), Some(1));
        assert_eq!(m.failures("die").map(Counter::get), Some(0));
        assert_eq!(m.lifetimes().count(), 3);
        assert_eq!(m.fork_locations().snapshot().len(), 1);
    }
}
