use std::sync::atomic::{AtomicU64, Ordering};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use crate::Result;
use crate::histogram::HistogramConfig;

const US_PER_MS: f64 = 1_000.0;

/// One named metric: an event counter, a hit/total rate and a latency histogram.
///
/// Counters are plain atomics. The histogram (and the exact sample sum next to it) sit behind a
/// short mutex; nothing else is held while recording.
#[derive(Debug)]
pub struct MetricSeries {
    count: AtomicU64,
    hits: AtomicU64,
    clamped: AtomicU64,
    max_value_us: u64,
    samples: Mutex<Samples>,
}

#[derive(Debug)]
struct Samples {
    histogram: Histogram<u64>,
    sum_us: u128,
}

impl MetricSeries {
    pub fn new(config: &HistogramConfig) -> Result<Self> {
        Ok(Self::from_template(&config.build()?, config.max_value_us))
    }

    /// An empty series shaped like `template`.
    pub(crate) fn from_template(template: &Histogram<u64>, max_value_us: u64) -> Self {
        Self {
            count: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            clamped: AtomicU64::new(0),
            max_value_us,
            samples: Mutex::new(Samples {
                histogram: Histogram::new_from(template),
                sum_us: 0,
            }),
        }
    }

    /// Records one timed event. `hit` feeds the rate accumulator.
    pub fn record(&self, value_us: u64, hit: bool) {
        let value = value_us.max(1);
        let over_range = value > self.max_value_us;

        {
            let mut samples = self.samples.lock();
            if over_range {
                samples.histogram.saturating_record(value);
            } else if samples.histogram.record(value).is_err() {
                samples.histogram.saturating_record(value);
            }
            samples.sum_us = samples.sum_us.saturating_add(u128::from(value));
        }

        if over_range {
            self.clamped.fetch_add(1, Ordering::Relaxed);
        }
        self.mark(hit);
    }

    /// Records an event without a timing sample.
    pub fn mark(&self, hit: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(count, hits)` without touching the histogram.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.count.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        let (distribution, samples, sum_us, min, max) = {
            let samples = self.samples.lock();
            let h = &samples.histogram;
            let n = h.len();
            (
                distribution(h),
                n,
                samples.sum_us,
                (n > 0).then(|| h.min() as f64 / US_PER_MS),
                (n > 0).then(|| h.max() as f64 / US_PER_MS),
            )
        };

        let count = self.count.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        let at = |p: usize| distribution.get(p - 1).copied();

        MetricSnapshot {
            count,
            hits,
            rate: (count > 0).then(|| hits as f64 / count as f64),
            mean: (samples > 0).then(|| sum_us as f64 / samples as f64 / US_PER_MS),
            min,
            max,
            p50: at(50),
            p90: at(90),
            p95: at(95),
            p99: at(99),
            clamped: self.clamped.load(Ordering::Relaxed),
            distribution,
        }
    }
}

/// Values at percentiles 1..=100 (milliseconds), computed in a single pass over the recorded
/// buckets.
fn distribution(h: &Histogram<u64>) -> Vec<f64> {
    let total = u128::from(h.len());
    if total == 0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(100);
    let mut seen: u128 = 0;
    let mut p: u128 = 1;

    for v in h.iter_recorded() {
        seen += u128::from(v.count_at_value());
        let value = h.highest_equivalent(v.value_iterated_to()) as f64 / US_PER_MS;
        while p <= 100 && seen * 100 >= p * total {
            out.push(value);
            p += 1;
        }
        if p > 100 {
            break;
        }
    }

    out
}

/// Point-in-time read of a [`MetricSeries`]. Latency figures are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub count: u64,
    pub hits: u64,
    pub rate: Option<f64>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    /// Samples that exceeded the histogram range and were recorded at its upper bound.
    pub clamped: u64,
    #[serde(skip)]
    distribution: Vec<f64>,
}

impl MetricSnapshot {
    /// Value at percentile `p` (1..=100), if the series has timing samples.
    pub fn percentile(&self, p: u8) -> Option<f64> {
        if p == 0 {
            return None;
        }
        self.distribution.get(usize::from(p) - 1).copied()
    }

    pub fn has_samples(&self) -> bool {
        !self.distribution.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn series() -> MetricSeries {
        MetricSeries::new(&HistogramConfig::default()).unwrap_or_else(|e| panic!("{e}"))
    }

    fn assert_close(actual: Option<f64>, expected: f64, tolerance: f64) {
        let actual = actual.unwrap_or_else(|| panic!("expected a value near {expected}"));
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected}±{tolerance}, got {actual}"
        );
    }

    #[test]
    fn impossible_bounds_are_an_error_not_a_panic() {
        let s = MetricSeries::new(&HistogramConfig {
            max_value_us: 0,
            ..HistogramConfig::default()
        });
        assert!(matches!(s, Err(crate::Error::HistogramBounds(_))));
    }

    #[test]
    fn empty_series_has_no_stats() {
        let s = series().snapshot();
        assert_eq!(s.count, 0);
        assert!(s.rate.is_none());
        assert!(s.mean.is_none());
        assert!(s.p50.is_none());
        assert!(s.percentile(42).is_none());
        assert!(!s.has_samples());
    }

    #[test]
    fn uniform_latencies_produce_expected_percentiles() {
        let s = series();
        for ms in 1..=1000u64 {
            s.record(ms * 1_000, true);
        }

        let snap = s.snapshot();
        assert_eq!(snap.count, 1000);
        assert_close(snap.p50, 500.0, 25.0);
        assert_close(snap.p95, 950.0, 48.0);
        assert_close(snap.p99, 990.0, 50.0);
        assert_close(snap.mean, 500.5, 0.01);
        assert_close(snap.min, 1.0, 0.01);
        assert_close(snap.max, 1000.0, 1.0);
        assert_close(snap.percentile(75), 750.0, 37.5);
        assert_eq!(snap.rate, Some(1.0));
    }

    #[test]
    fn rate_is_hits_over_count() {
        let s = series();
        for i in 0..100 {
            s.record(1_000, i < 3);
        }
        let snap = s.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.rate, Some(0.03));
    }

    #[test]
    fn mark_counts_without_samples() {
        let s = series();
        s.mark(true);
        s.mark(false);

        let snap = s.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.hits, 1);
        assert!(snap.p50.is_none());
        assert!(snap.mean.is_none());
    }

    #[test]
    fn values_above_range_are_clamped_and_counted() {
        let s = MetricSeries::new(&HistogramConfig {
            max_value_us: 10_000,
            ..HistogramConfig::default()
        })
        .unwrap_or_else(|e| panic!("{e}"));
        s.record(5_000, true);
        s.record(50_000, true);

        let snap = s.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.clamped, 1);
        let max = snap.max.unwrap_or_else(|| panic!("expected max"));
        assert!(max <= 10.1, "max should be clamped to the range, got {max}");
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let s = Arc::new(series());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for i in 0..5_000u64 {
                        s.record(1_000 + i + t, i % 2 == 0);
                    }
                })
            })
            .collect();
        for t in threads {
            if t.join().is_err() {
                panic!("recording thread panicked");
            }
        }

        let snap = s.snapshot();
        assert_eq!(snap.count, 40_000);
        assert_eq!(snap.hits, 20_000);
    }
}
