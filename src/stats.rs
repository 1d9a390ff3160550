use hdrhistogram::Histogram;
use log::warn;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run-wide counters mutated concurrently by every connection task.
#[derive(Debug, Default)]
pub struct GlobalCounters {
    total_attempted: AtomicU64,
    max_concurrent_achieved: AtomicU64,
    total_reconnections: AtomicU64,
    total_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total_attempted: u64,
    pub max_concurrent_achieved: u64,
    pub total_reconnections: u64,
    pub total_errors: u64,
}

impl GlobalCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attempted(&self, attempted: usize) {
        self.total_attempted
            .store(attempted as u64, Ordering::Relaxed);
    }

    pub fn observe_concurrency(&self, active: usize) {
        self.max_concurrent_achieved
            .fetch_max(active as u64, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.total_reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_attempted: self.total_attempted.load(Ordering::Relaxed),
            max_concurrent_achieved: self.max_concurrent_achieved.load(Ordering::Relaxed),
            total_reconnections: self.total_reconnections.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }
}

/// Merged inter-frame interval distribution across connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FrameIntervalStats {
    pub samples: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Merges per-connection histograms. The first one merged sets the bounds.
pub struct IntervalAggregator {
    histogram: Option<Histogram<u64>>,
}

impl IntervalAggregator {
    pub fn new() -> Self {
        Self { histogram: None }
    }

    pub fn merge(&mut self, other: &Histogram<u64>) {
        match self.histogram.as_mut() {
            None => self.histogram = Some(other.clone()),
            Some(histogram) => {
                if let Err(e) = histogram.add(other) {
                    warn!("Dropped {} frame intervals while merging: {:?}", other.len(), e);
                }
            }
        }
    }

    pub fn get_percentile(&self, percentile: f64) -> f64 {
        self.histogram
            .as_ref()
            .map_or(0.0, |h| h.value_at_percentile(percentile) as f64)
    }

    pub fn summary(&self) -> FrameIntervalStats {
        let Some(histogram) = self.histogram.as_ref().filter(|h| !h.is_empty()) else {
            return FrameIntervalStats::default();
        };
        FrameIntervalStats {
            samples: histogram.len(),
            mean_ms: round2(histogram.mean()),
            p50_ms: self.get_percentile(50.0),
            p95_ms: self.get_percentile(95.0),
            p99_ms: self.get_percentile(99.0),
            max_ms: histogram.max() as f64,
        }
    }
}

impl Default for IntervalAggregator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn peak(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().fold(0.0, f64::max)
}

pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{frame_interval_histogram, MAX_FRAME_INTERVAL_MS};

    #[test]
    fn counters_track_peak_concurrency() {
        let counters = GlobalCounters::new();
        counters.observe_concurrency(3);
        counters.observe_concurrency(7);
        counters.observe_concurrency(5);
        counters.record_error();
        counters.record_reconnection();
        counters.record_reconnection();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.max_concurrent_achieved, 7);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.total_reconnections, 2);
    }

    #[test]
    fn counters_are_safe_across_threads() {
        let counters = std::sync::Arc::new(GlobalCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.record_reconnection();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.snapshot().total_reconnections, 8000);
    }

    #[test]
    fn median_of_even_and_odd_sets() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
    }

    #[test]
    fn interval_percentiles_from_merged_histograms() {
        let mut a = frame_interval_histogram().unwrap();
        let mut b = frame_interval_histogram().unwrap();
        for _ in 0..90 {
            a.record(100).unwrap();
        }
        for _ in 0..10 {
            b.record(1000).unwrap();
        }

        let mut agg = IntervalAggregator::new();
        agg.merge(&a);
        agg.merge(&b);
        let summary = agg.summary();

        assert_eq!(summary.samples, 100);
        assert!((summary.p50_ms - 100.0).abs() < 1.0);
        assert!((summary.p99_ms - 1000.0).abs() < 1.0);
        assert!((summary.max_ms - 1000.0).abs() < 1.0);
    }

    #[test]
    fn empty_aggregator_reports_zeroes() {
        let agg = IntervalAggregator::new();
        assert_eq!(agg.get_percentile(99.0), 0.0);
        assert_eq!(agg.summary().samples, 0);
    }

    #[test]
    fn out_of_range_merge_keeps_existing_samples() {
        let mut bounded = frame_interval_histogram().unwrap();
        bounded.record(200).unwrap();
        let mut wide = Histogram::<u64>::new_with_bounds(1, 10 * MAX_FRAME_INTERVAL_MS, 3).unwrap();
        wide.record(5 * MAX_FRAME_INTERVAL_MS).unwrap();

        let mut agg = IntervalAggregator::new();
        agg.merge(&bounded);
        agg.merge(&wide);

        assert_eq!(agg.summary().samples, 1);
        assert!((agg.summary().max_ms - 200.0).abs() < 1.0);
    }
}
