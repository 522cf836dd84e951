//! Metrics of the aggregator

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

/// Measure a potentially non contiguous duration of time, in nanoseconds
#[derive(Debug)]
pub struct Time(AtomicU64);

impl Time {
    /// Create a new [`Time`]
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Add duration to the time metric
    #[inline]
    pub fn add_duration(&self, duration: Duration) {
        self.0.fetch_add(duration.as_nanos() as _, Relaxed);
    }

    /// Get the number of nanoseconds
    #[inline]
    pub fn nanoseconds(&self) -> u64 {
        self.0.load(Relaxed)
    }

    /// Get the duration
    #[inline]
    pub fn value(&self) -> Duration {
        Duration::from_nanos(self.nanoseconds())
    }
}

impl Default for Time {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Count the number of events
#[derive(Debug)]
pub struct Count(AtomicU64);

impl Count {
    /// Create a new [`Count`]
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Add `n` to the count
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Relaxed);
    }

    /// Get the count
    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Relaxed)
    }
}

impl Default for Count {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a metric
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    Count(u64),
    Time(Duration),
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{}", count),
            Self::Time(time) => write!(f, "{:?}", time),
        }
    }
}

/// Snapshot of a set of metrics, created by the `MetricsSetBuilder` derive
#[derive(Debug, Clone)]
pub struct MetricsSet {
    /// Name of the metrics struct
    pub name: &'static str,
    /// Metrics ordered by the field name
    pub metrics: BTreeMap<&'static str, MetricValue>,
}

impl MetricsSet {
    /// Get the count metric with the name
    pub fn count(&self, name: &str) -> Option<u64> {
        match self.metrics.get(name)? {
            MetricValue::Count(count) => Some(*count),
            MetricValue::Time(_) => None,
        }
    }

    /// Get the time metric with the name
    pub fn time(&self, name: &str) -> Option<Duration> {
        match self.metrics.get(name)? {
            MetricValue::Time(time) => Some(*time),
            MetricValue::Count(_) => None,
        }
    }
}

impl Display for MetricsSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.name)?;
        let mut iter = self.metrics.iter();
        if let Some((name, value)) = iter.next() {
            write!(f, "{}={}", name, value)?;
        }
        iter.try_for_each(|(name, value)| write!(f, ", {}={}", name, value))
    }
}
