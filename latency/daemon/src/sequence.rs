//! Per-stream sequence tracking
//!
//! Detects dropped and reordered/duplicated frames from the sequence
//! number alone. Sequence numbers are compared as plain `u32`; wraparound
//! at `u32::MAX` shows up as a reorder and is not corrected.

use crate::collector::RunningStats;
use crate::hwts::RxTimestamps;
use txrx_common::{TestFrame, MAX_STREAMS};

/// Outcome of observing one sequence number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceReport {
    /// Frames missing between the previous and this sequence number
    pub dropped: i64,
    /// Sequence number not greater than the previous one
    pub reordered: bool,
}

impl SequenceReport {
    pub fn is_anomaly(&self) -> bool {
        self.dropped != 0 || self.reordered
    }
}

/// Sequence state machine for a single stream
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the first frame has been seen
    pub fn is_tracking(&self) -> bool {
        self.last.is_some()
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.last
    }

    /// Record `seq` and report drops or reordering against the previous one
    pub fn observe(&mut self, seq: u32) -> SequenceReport {
        let report = match self.last {
            None => SequenceReport::default(),
            Some(prev) if seq <= prev => SequenceReport {
                dropped: 0,
                reordered: true,
            },
            Some(prev) => SequenceReport {
                dropped: (seq - prev - 1) as i64,
                reordered: false,
            },
        };

        self.last = Some(seq);
        report
    }
}

/// Everything the receiver remembers about one stream
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    pub tracker: SequenceTracker,
    /// Frame waiting for its successor to complete a measurement
    pub last_frame: Option<TestFrame>,
    /// Receive timestamps recorded when `last_frame` arrived
    pub last_rx: Option<RxTimestamps>,
    /// Arrival spacing of this stream alone
    pub arrivals: RunningStats,
}

impl StreamState {
    /// Forget the retained frame so it is never used as a baseline
    pub fn clear_previous(&mut self) {
        self.last_frame = None;
        self.last_rx = None;
    }
}

/// Fixed table of stream states indexed directly by stream id
pub struct StreamTable {
    streams: [StreamState; MAX_STREAMS],
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            streams: std::array::from_fn(|_| StreamState::default()),
        }
    }

    /// State for `stream_id`, or `None` when the id is out of range
    pub fn get_mut(&mut self, stream_id: u8) -> Option<&mut StreamState> {
        self.streams.get_mut(stream_id as usize)
    }

    /// Number of streams that have received at least one frame
    pub fn active_streams(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.tracker.is_tracking())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_reports_nothing() {
        let mut tracker = SequenceTracker::new();
        assert!(!tracker.is_tracking());

        let report = tracker.observe(42);
        assert_eq!(report, SequenceReport::default());
        assert!(tracker.is_tracking());
        assert_eq!(tracker.last_sequence(), Some(42));
    }

    #[test]
    fn test_first_frame_may_be_zero() {
        let mut tracker = SequenceTracker::new();
        assert!(!tracker.observe(0).is_anomaly());
        assert!(!tracker.observe(1).is_anomaly());
    }

    #[test]
    fn test_increasing_sequence_has_no_anomalies() {
        let mut tracker = SequenceTracker::new();
        for seq in 0..1000 {
            let report = tracker.observe(seq);
            assert_eq!(report.dropped, 0);
            assert!(!report.reordered);
        }
    }

    #[test]
    fn test_gap_reports_dropped() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(1);
        let report = tracker.observe(3);
        assert_eq!(report.dropped, 1);
        assert!(!report.reordered);

        tracker.observe(100);
        let report = tracker.observe(200);
        assert_eq!(report.dropped, 99);
    }

    #[test]
    fn test_lower_sequence_is_reorder_not_negative_drop() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(3);
        let report = tracker.observe(2);
        assert!(report.reordered);
        assert_eq!(report.dropped, 0);

        tracker.observe(200);
        let report = tracker.observe(100);
        assert!(report.reordered);
        assert_eq!(report.dropped, 0);
    }

    #[test]
    fn test_duplicate_is_reorder() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(7);
        assert!(tracker.observe(7).reordered);
    }

    #[test]
    fn test_wraparound_is_reported_as_reorder() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(u32::MAX);
        assert!(tracker.observe(0).reordered);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut table = StreamTable::new();

        assert!(!table.get_mut(0).unwrap().tracker.observe(0).is_anomaly());
        assert!(!table.get_mut(1).unwrap().tracker.observe(0).is_anomaly());
        for seq in 1..4 {
            assert!(!table.get_mut(1).unwrap().tracker.observe(seq).is_anomaly());
        }
        for seq in 1..4 {
            assert!(!table.get_mut(0).unwrap().tracker.observe(seq).is_anomaly());
        }
        assert_eq!(table.active_streams(), 2);
    }

    #[test]
    fn test_stream_id_bounds() {
        let mut table = StreamTable::new();
        assert!(table.get_mut((MAX_STREAMS - 1) as u8).is_some());
        assert!(table.get_mut(MAX_STREAMS as u8).is_none());
    }

    #[test]
    fn test_clear_previous() {
        let mut state = StreamState::default();
        state.last_frame = Some(TestFrame::default());
        state.last_rx = Some(RxTimestamps::default());
        state.clear_previous();
        assert!(state.last_frame.is_none());
        assert!(state.last_rx.is_none());
    }
}
