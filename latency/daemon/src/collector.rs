//! Latency statistics collection
//!
//! Aggregates per-frame timing samples into running jitter statistics
//! (RMS mean and worst-case deviation over a sliding window) and a bounded
//! microsecond histogram.

use crate::types::StatisticsReport;
use txrx_common::{TimeDelta, Timestamp, HISTOGRAM_VALUES_MAX, STATS_WINDOW};

/// Fixed-capacity circular buffer
#[derive(Debug, Clone)]
struct Window<T> {
    values: [T; STATS_WINDOW],
    next: usize,
    len: usize,
}

impl<T: Copy + Default> Window<T> {
    fn new() -> Self {
        Self {
            values: [T::default(); STATS_WINDOW],
            next: 0,
            len: 0,
        }
    }

    fn push(&mut self, value: T) {
        self.values[self.next] = value;
        self.next = (self.next + 1) % STATS_WINDOW;
        if self.len < STATS_WINDOW {
            self.len += 1;
        }
    }

    /// Value written `back` pushes ago (1 = most recent)
    fn recent(&self, back: usize) -> T {
        self.values[(self.next + STATS_WINDOW - back) % STATS_WINDOW]
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.values[..self.len].iter()
    }
}

/// Sliding-window jitter statistics over a stream of timestamps
#[derive(Debug, Clone)]
pub struct RunningStats {
    samples: Window<Timestamp>,
    deviations: Window<TimeDelta>,
    /// Most recent deviation from the expected interval
    pub diff: TimeDelta,
    /// RMS of the deviations in the window
    pub mean: TimeDelta,
    /// Largest-magnitude deviation seen so far
    pub max: TimeDelta,
    /// Sample that produced `max`
    pub max_at: Timestamp,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            samples: Window::new(),
            deviations: Window::new(),
            diff: TimeDelta::ZERO,
            mean: TimeDelta::ZERO,
            max: TimeDelta::ZERO,
            max_at: Timestamp::UNSET,
        }
    }

    /// Add a sample taken at `ts` for a stream paced every `interval_ns`
    ///
    /// Returns the deviation of the spacing to the previous sample from
    /// `interval_ns`, once more than two samples are held.
    pub fn update(&mut self, ts: Timestamp, interval_ns: i64) -> Option<TimeDelta> {
        self.samples.push(ts);
        if self.samples.len <= 2 {
            return None;
        }

        let previous = self.samples.recent(2);
        let deviation = TimeDelta::from_nanos((ts - previous).as_nanos() - interval_ns);
        self.record(deviation, ts);
        Some(deviation)
    }

    /// Add a deviation computed elsewhere, attributed to sample `ts`
    pub fn record(&mut self, deviation: TimeDelta, ts: Timestamp) {
        self.diff = deviation;
        self.deviations.push(deviation);
        self.mean = self.rms();

        if deviation.abs_nanos() > self.max.abs_nanos() {
            self.max = deviation;
            self.max_at = ts;
        }
    }

    /// Number of deviations held in the window
    pub fn window_len(&self) -> usize {
        self.deviations.len
    }

    fn rms(&self) -> TimeDelta {
        if self.deviations.len == 0 {
            return TimeDelta::ZERO;
        }

        let sum: f64 = self
            .deviations
            .iter()
            .map(|d| {
                let ns = d.as_nanos() as f64;
                ns * ns
            })
            .sum();
        TimeDelta::from_nanos((sum / self.deviations.len as f64).sqrt() as i64)
    }
}

/// Microsecond histogram with an outlier counter
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<u32>,
    pub outliers: u32,
    pub min: i32,
    pub max: i32,
    pub count: u32,
}

impl Histogram {
    /// Create a histogram with one bucket per microsecond below `ceiling_usec`
    ///
    /// The ceiling is capped at `HISTOGRAM_VALUES_MAX`.
    pub fn new(ceiling_usec: usize) -> Self {
        Self {
            buckets: vec![0; ceiling_usec.min(HISTOGRAM_VALUES_MAX)],
            outliers: 0,
            min: 0,
            max: 0,
            count: 0,
        }
    }

    /// Record the magnitude of `deviation`
    pub fn add(&mut self, deviation: TimeDelta) {
        let usec = i32::try_from(deviation.abs_nanos() / 1000).unwrap_or(i32::MAX);

        if self.count == 0 || usec > self.max {
            self.max = usec;
        }
        if self.count == 0 || usec < self.min {
            self.min = usec;
        }

        match self.buckets.get_mut(usec as usize) {
            Some(bucket) => *bucket += 1,
            None => self.outliers += 1,
        }

        self.count += 1;
    }

    pub fn buckets(&self) -> &[u32] {
        &self.buckets
    }

    pub fn ceiling(&self) -> usize {
        self.buckets.len()
    }
}

/// Running statistics plus histogram for one direction
#[derive(Debug, Clone)]
pub struct LatencyStatistics {
    pub running: RunningStats,
    pub histogram: Histogram,
}

impl LatencyStatistics {
    /// Create a collector
    ///
    /// # Arguments
    ///
    /// * `histogram_usec` - Histogram ceiling in microseconds (0 disables buckets;
    ///   every sample is then an outlier)
    pub fn new(histogram_usec: usize) -> Self {
        Self {
            running: RunningStats::new(),
            histogram: Histogram::new(histogram_usec),
        }
    }

    /// Record a transmit: `sent` is the program send time, `target` the
    /// instant the pacer aimed for
    pub fn record_send(&mut self, sent: Timestamp, target: Timestamp, interval_ns: i64) -> TimeDelta {
        let deviation = sent - target;
        self.running.update(sent, interval_ns);
        self.histogram.add(deviation);
        deviation
    }

    /// Record an arrival; jitter is measured against the sender's interval
    ///
    /// `baseline` holds the previous arrivals of the same stream, so
    /// interleaved streams never measure against each other.
    pub fn record_arrival(
        &mut self,
        baseline: &mut RunningStats,
        received: Timestamp,
        interval_ns: i64,
    ) -> Option<TimeDelta> {
        let deviation = baseline.update(received, interval_ns)?;
        self.running.record(deviation, received);
        self.histogram.add(deviation);
        Some(deviation)
    }

    /// Snapshot for export
    pub fn report(&self) -> StatisticsReport {
        StatisticsReport {
            count: self.histogram.count,
            min: self.histogram.min,
            max: self.histogram.max,
            outliers: self.histogram.outliers,
            rms_nsec: self.running.mean.as_nanos(),
            max_nsec: self.running.max.as_nanos(),
            histogram: self.histogram.buckets().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSEC: i64 = 1_000_000;

    fn at_nanos(ns: i64) -> Timestamp {
        Timestamp::from_nanos(1_519_657_344_000_000_000i128 + ns as i128)
    }

    #[test]
    fn test_no_deviation_before_third_sample() {
        let mut stats = RunningStats::new();
        assert_eq!(stats.update(at_nanos(0), MSEC), None);
        assert_eq!(stats.update(at_nanos(MSEC), MSEC), None);
        assert_eq!(stats.update(at_nanos(2 * MSEC), MSEC), Some(TimeDelta::ZERO));
        assert_eq!(stats.window_len(), 1);
    }

    #[test]
    fn test_perfect_pacing_has_zero_jitter() {
        let mut stats = RunningStats::new();
        for i in 0..500 {
            stats.update(at_nanos(i * MSEC), MSEC);
        }
        assert_eq!(stats.mean, TimeDelta::ZERO);
        assert_eq!(stats.max, TimeDelta::ZERO);
        assert_eq!(stats.window_len(), STATS_WINDOW);
    }

    #[test]
    fn test_rms_and_max() {
        let mut stats = RunningStats::new();
        stats.update(at_nanos(0), MSEC);
        stats.update(at_nanos(MSEC), MSEC);
        // +3us late, then -4us early relative to the previous sample
        assert_eq!(stats.update(at_nanos(2 * MSEC + 3_000), MSEC), Some(TimeDelta::from_nanos(3_000)));
        assert_eq!(stats.update(at_nanos(3 * MSEC - 1_000), MSEC), Some(TimeDelta::from_nanos(-4_000)));

        // sqrt((3000^2 + 4000^2) / 2) = 3535.5
        assert_eq!(stats.mean, TimeDelta::from_nanos(3_535));
        assert_eq!(stats.max, TimeDelta::from_nanos(-4_000));
        assert_eq!(stats.max_at, at_nanos(3 * MSEC - 1_000));
    }

    #[test]
    fn test_deviation_across_second_boundary() {
        let mut stats = RunningStats::new();
        stats.update(Timestamp::new(9, 998_000_000), MSEC);
        stats.update(Timestamp::new(9, 999_000_000), MSEC);
        let d = stats.update(Timestamp::new(10, 500), MSEC);
        assert_eq!(d, Some(TimeDelta::from_nanos(500)));
    }

    #[test]
    fn test_histogram_buckets_and_outliers() {
        let mut hist = Histogram::new(10);
        for ns in [0, 999, 1_000, 9_999, -5_000, 10_000, 2_000_000] {
            hist.add(TimeDelta::from_nanos(ns));
        }

        assert_eq!(hist.buckets()[0], 2);
        assert_eq!(hist.buckets()[1], 1);
        assert_eq!(hist.buckets()[5], 1);
        assert_eq!(hist.buckets()[9], 1);
        assert_eq!(hist.outliers, 2);
        assert_eq!(hist.min, 0);
        assert_eq!(hist.max, 2_000);
        assert_eq!(hist.count, 7);
    }

    #[test]
    fn test_histogram_count_invariant() {
        let mut hist = Histogram::new(HISTOGRAM_VALUES_MAX);
        for i in 0..5_000i64 {
            hist.add(TimeDelta::from_nanos(i * 997));
        }
        let bucketed: u32 = hist.buckets().iter().sum();
        assert_eq!(hist.count, bucketed + hist.outliers);
        assert!(hist.outliers > 0);
    }

    #[test]
    fn test_histogram_ceiling_is_capped() {
        assert_eq!(Histogram::new(5_000).ceiling(), HISTOGRAM_VALUES_MAX);
        let mut hist = Histogram::new(0);
        hist.add(TimeDelta::ZERO);
        assert_eq!(hist.outliers, 1);
    }

    #[test]
    fn test_large_deviation_is_outlier() {
        let mut hist = Histogram::new(HISTOGRAM_VALUES_MAX);
        hist.add(TimeDelta { sec: 3, nsec: 0 });
        assert_eq!(hist.outliers, 1);
        assert_eq!(hist.max, 3_000_000);
    }

    #[test]
    fn test_record_send_report() {
        let mut stats = LatencyStatistics::new(100);
        let target = at_nanos(0);
        let deviation = stats.record_send(at_nanos(12_345), target, MSEC);
        assert_eq!(deviation, TimeDelta::from_nanos(12_345));

        let report = stats.report();
        assert_eq!(report.count, 1);
        assert_eq!(report.min, 12);
        assert_eq!(report.max, 12);
        assert_eq!(report.histogram[12], 1);
        assert_eq!(report.histogram.len(), 100);
    }

    #[test]
    fn test_interleaved_arrivals_use_their_own_baseline() {
        let mut stats = LatencyStatistics::new(HISTOGRAM_VALUES_MAX);
        let mut first = RunningStats::new();
        let mut second = RunningStats::new();

        for i in 0..50 {
            stats.record_arrival(&mut first, at_nanos(i * MSEC), MSEC);
            stats.record_arrival(&mut second, at_nanos(i * MSEC + MSEC / 2), MSEC);
        }

        let report = stats.report();
        assert_eq!(report.count, 2 * 48);
        assert_eq!(report.rms_nsec, 0);
        assert_eq!(report.max_nsec, 0);
        assert_eq!(report.min, 0);
        assert_eq!(report.max, 0);
        assert_eq!(report.histogram[0], 2 * 48);
    }

    #[test]
    fn test_arrival_jitter_reaches_aggregate() {
        let mut stats = LatencyStatistics::new(HISTOGRAM_VALUES_MAX);
        let mut stream = RunningStats::new();

        stats.record_arrival(&mut stream, at_nanos(0), MSEC);
        stats.record_arrival(&mut stream, at_nanos(MSEC), MSEC);
        let d = stats.record_arrival(&mut stream, at_nanos(2 * MSEC + 7_000), MSEC);

        assert_eq!(d, Some(TimeDelta::from_nanos(7_000)));
        let report = stats.report();
        assert_eq!(report.count, 1);
        assert_eq!(report.max_nsec, 7_000);
        assert_eq!(report.histogram[7], 1);
        assert_eq!(stats.running.max_at, at_nanos(2 * MSEC + 7_000));
    }
}
