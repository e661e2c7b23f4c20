//! Logarithmic latency histogram, grounded on the teacher's
//! `performance::latency::histogram::LatencyHistogram`. Used by venue
//! quality tracking (gate 10) and Truth Score's ack-latency-p50 input
//! (spec.md §4.H).

use parking_lot::Mutex;

/// Bucket upper bounds in microseconds, roughly logarithmic from 1us to 10s
/// plus an overflow bucket, mirroring the teacher's `BUCKET_BOUNDS`.
const BUCKET_BOUNDS_US: &[u64] = &[
    1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000,
    200_000, 500_000, 1_000_000, 2_000_000, 5_000_000, 10_000_000, u64::MAX,
];

struct Inner {
    buckets: Vec<u64>,
    count: u64,
    sum_us: u128,
    min_us: u64,
    max_us: u64,
}

pub struct LatencyHistogram {
    inner: Mutex<Inner>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: vec![0; BUCKET_BOUNDS_US.len()],
                count: 0,
                sum_us: 0,
                min_us: u64::MAX,
                max_us: 0,
            }),
        }
    }

    pub fn record_us(&self, value_us: u64) {
        let idx = BUCKET_BOUNDS_US.partition_point(|&bound| bound < value_us);
        let mut inner = self.inner.lock();
        inner.buckets[idx.min(inner.buckets.len() - 1)] += 1;
        inner.count += 1;
        inner.sum_us += value_us as u128;
        inner.min_us = inner.min_us.min(value_us);
        inner.max_us = inner.max_us.max(value_us);
    }

    pub fn record_duration(&self, d: std::time::Duration) {
        self.record_us(d.as_micros() as u64);
    }

    pub fn mean_us(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.count == 0 {
            0.0
        } else {
            inner.sum_us as f64 / inner.count as f64
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// Returns the upper bound (microseconds) of the bucket at `percentile`
    /// (0.0-1.0), via cumulative-count binary search.
    pub fn percentile_us(&self, percentile: f64) -> u64 {
        let inner = self.inner.lock();
        if inner.count == 0 {
            return 0;
        }
        let target = (inner.count as f64 * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in inner.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return BUCKET_BOUNDS_US[i];
            }
        }
        inner.max_us
    }

    pub fn p50_us(&self) -> u64 {
        self.percentile_us(0.50)
    }

    pub fn p95_us(&self) -> u64 {
        self.percentile_us(0.95)
    }

    pub fn p99_us(&self) -> u64 {
        self.percentile_us(0.99)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reports_mean() {
        let h = LatencyHistogram::new();
        h.record_us(10);
        h.record_us(20);
        assert_eq!(h.count(), 2);
        assert!((h.mean_us() - 15.0).abs() < 1.0);
    }

    #[test]
    fn percentiles_are_monotone() {
        let h = LatencyHistogram::new();
        for v in [10, 20, 30, 40, 100, 1_000, 50_000] {
            h.record_us(v);
        }
        assert!(h.p50_us() <= h.p95_us());
        assert!(h.p95_us() <= h.p99_us());
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let h = LatencyHistogram::new();
        assert_eq!(h.p50_us(), 0);
        assert_eq!(h.mean_us(), 0.0);
    }
}
