//! Lock-free latency tracking for the packet path

use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound (inclusive) of each bucket in nanoseconds; the last bucket is open.
const BUCKET_LIMITS_NS: [u64; 8] = [500, 1_000, 2_000, 5_000, 10_000, 50_000, 100_000, u64::MAX];

/// Lock-free histogram for latency tracking
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Buckets: <=0.5μs, <=1μs, <=2μs, <=5μs, <=10μs, <=50μs, <=100μs, >100μs
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl LatencyHistogram {
    /// Create new histogram
    pub const fn new() -> Self {
        Self {
            buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            count: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Record a latency value in nanoseconds
    #[inline(always)]
    pub fn record(&self, latency_ns: u64) {
        let bucket = BUCKET_LIMITS_NS
            .iter()
            .position(|limit| latency_ns <= *limit)
            .unwrap_or(BUCKET_LIMITS_NS.len() - 1);

        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.min_ns.fetch_min(latency_ns, Ordering::Relaxed);
        self.max_ns.fetch_max(latency_ns, Ordering::Relaxed);
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average latency in nanoseconds (integer, 0 when empty)
    pub fn average_ns(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.sum_ns.load(Ordering::Relaxed) / count
    }

    /// Approximate percentile, reported as the bucket's upper bound
    pub fn percentile(&self, p: f64) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        let target = ((count as f64) * p).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_LIMITS_NS[i];
            }
        }

        BUCKET_LIMITS_NS[BUCKET_LIMITS_NS.len() - 1]
    }

    /// Get snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            sum_ns: self.sum_ns.load(Ordering::Relaxed),
            min_ns: if count == 0 { 0 } else { self.min_ns.load(Ordering::Relaxed) },
            max_ns: self.max_ns.load(Ordering::Relaxed),
            p50_ns: self.percentile(0.50),
            p99_ns: self.percentile(0.99),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HistogramSnapshot {
    /// Samples recorded
    pub count: u64,
    /// Sum of all samples (ns)
    pub sum_ns: u64,
    /// Smallest sample, 0 when empty
    pub min_ns: u64,
    /// Largest sample
    pub max_ns: u64,
    /// Median, upper bound of its bucket
    pub p50_ns: u64,
    /// 99th percentile, upper bound of its bucket
    pub p99_ns: u64,
}
