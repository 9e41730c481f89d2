use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of histogram buckets.
pub const NUM_BUCKETS: usize = 10;

/// Histogram bucket upper bounds, exponential base 10.
/// Sized for millisecond durations and byte counts alike:
/// <1, 1-10, 10-100, ..., 1e7-1e8, 1e8+.
const BOUNDARIES: [u64; 9] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
];

/// Direct handle to an exported counter. Cloning shares the underlying
/// cell, so cached resolved stats and the stat host observe one value.
#[derive(Debug, Clone, Default)]
pub struct CounterHandle {
    cell: Arc<AtomicU64>,
}

impl CounterHandle {
    pub fn add(&self, value: u64) {
        self.cell.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

/// Direct handle to an exported gauge.
#[derive(Debug, Clone, Default)]
pub struct GaugeHandle {
    cell: Arc<AtomicU64>,
}

impl GaugeHandle {
    pub fn set(&self, value: u64) {
        self.cell.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

/// Exponential histogram with 10 buckets plus running sum and count.
pub struct Histogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    sum: AtomicU64,
    count: AtomicU64,
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub buckets: [u64; NUM_BUCKETS],
    pub sum: u64,
    pub count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a sample into the matching bucket.
    pub fn record(&self, value: u64) {
        let idx = bucket_index(value);
        if let Some(bucket) = self.buckets.get(idx) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current bucket counts, sum and count.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = [0u64; NUM_BUCKETS];
        for (slot, bucket) in buckets.iter_mut().zip(self.buckets.iter()) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        HistogramSnapshot {
            buckets,
            sum: self.sum.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Histogram")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Returns the bucket index for a value.
fn bucket_index(value: u64) -> usize {
    // Linear scan is fine for 9 boundaries.
    for (i, &boundary) in BOUNDARIES.iter().enumerate() {
        if value < boundary {
            return i;
        }
    }
    9 // +inf bucket
}

/// A recording handle of any metric kind.
#[derive(Debug, Clone)]
pub enum StatHandle {
    Counter(CounterHandle),
    Gauge(GaugeHandle),
    Histogram(Arc<Histogram>),
}

/// Kind of an exported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// One exported stat instance owned by the host registry.
#[derive(Debug, Clone)]
pub struct ExportedStat {
    pub name: Arc<str>,
    pub kind: MetricKind,
    pub handle: StatHandle,
}

/// Per-worker registry of exported stat instances.
///
/// Stands at the export boundary: resolution creates handles here exactly
/// once per fully-qualified name, and the export collaborator snapshots
/// the registry on its own cadence. Discarded wholesale on reconfigure.
#[derive(Debug, Default)]
pub struct StatHost {
    stats: Vec<ExportedStat>,
}

impl StatHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a counter and returns its recording handle.
    pub fn counter(&mut self, name: Arc<str>) -> CounterHandle {
        let handle = CounterHandle::default();
        self.stats.push(ExportedStat {
            name,
            kind: MetricKind::Counter,
            handle: StatHandle::Counter(handle.clone()),
        });
        handle
    }

    /// Creates a gauge and returns its recording handle.
    pub fn gauge(&mut self, name: Arc<str>) -> GaugeHandle {
        let handle = GaugeHandle::default();
        self.stats.push(ExportedStat {
            name,
            kind: MetricKind::Gauge,
            handle: StatHandle::Gauge(handle.clone()),
        });
        handle
    }

    /// Creates a histogram and returns its recording handle.
    pub fn histogram(&mut self, name: Arc<str>) -> Arc<Histogram> {
        let handle = Arc::new(Histogram::new());
        self.stats.push(ExportedStat {
            name,
            kind: MetricKind::Histogram,
            handle: StatHandle::Histogram(Arc::clone(&handle)),
        });
        handle
    }

    /// Number of stat instances created under this configuration.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Iterates all exported stats.
    pub fn iter(&self) -> impl Iterator<Item = &ExportedStat> {
        self.stats.iter()
    }

    /// Finds a stat by its fully-qualified name.
    pub fn find(&self, name: &str) -> Option<&ExportedStat> {
        self.stats.iter().find(|s| s.name.as_ref() == name)
    }

    /// Drops every stat instance. Used on reconfigure.
    pub fn clear(&mut self) {
        self.stats.clear();
    }
}
