//! Result record definitions
//!
//! Every line the tool emits is one [`ResultRecord`], serialized as
//! `{"type": "<kind>", "object": {...}}` with kebab-case field names.
//!
//! ## Organization
//!
//! - **Measurements**: per-frame timestamp chains (`rx-packet`, `rx-final`)
//! - **Anomalies**: sequence errors (`rx-error`)
//! - **Sender detail**: per-frame pacing records (`tx-packet`)
//! - **Aggregates**: histogram and jitter statistics (`histogram`)

use crate::hwts::RxTimestamps;
use serde::{Deserialize, Serialize};
use txrx_common::{TestFrame, Timestamp, TimestampSlot};

/// One line of output
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "kebab-case")]
pub enum ResultRecord {
    /// Completed measurement for a frame whose successor has arrived
    RxPacket(Measurement),
    /// Measurement for the end-of-stream frame
    RxFinal(Measurement),
    /// Dropped or reordered frames
    RxError(SequenceError),
    /// Sender-side pacing detail
    TxPacket(TxReport),
    /// Aggregated statistics
    Histogram(StatisticsReport),
}

impl ResultRecord {
    /// Record kind as it appears in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            ResultRecord::RxPacket(_) => "rx-packet",
            ResultRecord::RxFinal(_) => "rx-final",
            ResultRecord::RxError(_) => "rx-error",
            ResultRecord::TxPacket(_) => "tx-packet",
            ResultRecord::Histogram(_) => "histogram",
        }
    }
}

/// Parallel lists of stage names and ISO-8601 values
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampList {
    pub names: Vec<String>,
    pub values: Vec<String>,
}

impl TimestampList {
    /// Build from (slot, timestamp) pairs, skipping unset timestamps
    pub fn from_slots<I>(stamps: I) -> Self
    where
        I: IntoIterator<Item = (TimestampSlot, Timestamp)>,
    {
        let mut list = TimestampList::default();
        for (slot, ts) in stamps {
            if ts.is_unset() {
                continue;
            }
            list.names.push(slot.name().to_string());
            list.values.push(iso_timestamp(ts));
        }
        list
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Timestamp chain of one frame through both hosts
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Measurement {
    pub stream_id: u8,
    pub sequence_number: u32,
    pub interval_usec: u16,
    pub offset_usec: u16,
    pub timestamps: TimestampList,
    /// Best receive stamp minus best transmit stamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_nsec: Option<i64>,
    /// Stages whose timestamp precedes the stage before them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_order_violations: Vec<String>,
}

impl Measurement {
    /// Assemble the measurement for `frame`
    ///
    /// # Arguments
    ///
    /// * `frame` - Frame being reported; provides the sender-side stamps
    /// * `successor` - Next frame of the stream; carries `frame`'s kernel
    ///   transmit stamps (absent for the final frame)
    /// * `rx` - Receive stamps recorded when `frame` arrived
    pub fn new(frame: &TestFrame, successor: Option<&TestFrame>, rx: &RxTimestamps) -> Self {
        let kernel_tx = |slot| successor.map_or(Timestamp::UNSET, |next| next.timestamp(slot));

        let stamps = [
            (TimestampSlot::IntervalStart, frame.timestamp(TimestampSlot::IntervalStart)),
            (TimestampSlot::Wakeup, frame.timestamp(TimestampSlot::Wakeup)),
            (TimestampSlot::ProgramSend, frame.timestamp(TimestampSlot::ProgramSend)),
            (TimestampSlot::KernelSchedulerTx, kernel_tx(TimestampSlot::KernelSchedulerTx)),
            (TimestampSlot::KernelSoftwareTx, kernel_tx(TimestampSlot::KernelSoftwareTx)),
            (TimestampSlot::KernelHardwareRx, rx.hardware),
            (TimestampSlot::KernelSoftwareRx, rx.software),
            (TimestampSlot::ProgramRecv, rx.program),
        ];

        let sent = [stamps[4].1, stamps[2].1, stamps[0].1]
            .into_iter()
            .find(|ts| !ts.is_unset());
        let received = Some(rx.best()).filter(|ts| !ts.is_unset());
        let latency_nsec = match (sent, received) {
            (Some(tx), Some(rx)) => Some((rx - tx).as_nanos()),
            _ => None,
        };

        Self {
            stream_id: frame.stream_id,
            sequence_number: frame.sequence,
            interval_usec: frame.interval_usec,
            offset_usec: frame.offset_usec,
            timestamps: TimestampList::from_slots(stamps),
            latency_nsec,
            stage_order_violations: stage_order_violations(&stamps),
        }
    }
}

/// Names of populated stages earlier than the last populated stage before them
fn stage_order_violations(stamps: &[(TimestampSlot, Timestamp)]) -> Vec<String> {
    let mut violations = Vec::new();
    let mut previous: Option<Timestamp> = None;

    for (slot, ts) in stamps.iter().filter(|(_, ts)| !ts.is_unset()) {
        if let Some(prev) = previous {
            if *ts < prev {
                violations.push(slot.name().to_string());
            }
        }
        previous = Some(*ts);
    }

    violations
}

/// Sequence anomaly on one stream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SequenceError {
    pub stream_id: u8,
    pub sequence_number: u32,
    pub dropped_packets: i64,
    /// True for a reordered or duplicated frame
    pub sequence_error: bool,
}

/// Sender-side record for one transmitted frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TxReport {
    pub stream_id: u8,
    pub sequence_number: u32,
    pub target: String,
    pub tx_program: String,
    /// `tx-program - target`
    pub deviation_nsec: i64,
}

/// Histogram plus running jitter statistics
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StatisticsReport {
    pub count: u32,
    /// Smallest sample (us)
    pub min: i32,
    /// Largest sample (us)
    pub max: i32,
    pub outliers: u32,
    pub rms_nsec: i64,
    pub max_nsec: i64,
    pub histogram: Vec<u32>,
}

/// Render `ts` as UTC ISO-8601 with nanoseconds, e.g. `2018-03-13T12:37:35.005000000Z`
pub fn iso_timestamp(ts: Timestamp) -> String {
    match chrono::DateTime::from_timestamp(ts.sec, ts.nsec) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string(),
        None => ts.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(seq: u32, stamps: &[(TimestampSlot, Timestamp)]) -> TestFrame {
        let mut frame = TestFrame::default();
        frame.sequence = seq;
        frame.interval_usec = 1000;
        for (slot, ts) in stamps {
            frame.set_timestamp(*slot, *ts);
        }
        frame
    }

    #[test]
    fn test_iso_timestamp() {
        assert_eq!(iso_timestamp(Timestamp::new(0, 0)), "1970-01-01T00:00:00.000000000Z");
        assert_eq!(iso_timestamp(Timestamp::new(0, 5_000_000)), "1970-01-01T00:00:00.005000000Z");
        assert_eq!(
            iso_timestamp(Timestamp::new(1_520_944_655, 5_000_000)),
            "2018-03-13T12:37:35.005000000Z"
        );
    }

    #[test]
    fn test_rx_error_json_shape() {
        let record = ResultRecord::RxError(SequenceError {
            stream_id: 2,
            sequence_number: 10,
            dropped_packets: 3,
            sequence_error: false,
        });

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"type":"rx-error","object":{"stream-id":2,"sequence-number":10,"dropped-packets":3,"sequence-error":false}}"#
        );
    }

    #[test]
    fn test_measurement_combines_successor_and_rx() {
        let t = |us: u32| Timestamp::new(1_520_944_655, us * 1000);
        let frame = frame_with(
            4,
            &[
                (TimestampSlot::IntervalStart, t(0)),
                (TimestampSlot::Wakeup, t(1)),
                (TimestampSlot::ProgramSend, t(2)),
            ],
        );
        let next = frame_with(
            5,
            &[
                (TimestampSlot::KernelSchedulerTx, t(3)),
                (TimestampSlot::KernelSoftwareTx, t(4)),
            ],
        );
        let rx = RxTimestamps {
            hardware: t(10),
            software: t(11),
            program: t(12),
        };

        let m = Measurement::new(&frame, Some(&next), &rx);
        assert_eq!(m.sequence_number, 4);
        assert_eq!(
            m.timestamps.names,
            vec![
                "interval-start",
                "tx-wakeup",
                "tx-program",
                "tx-kernel-netsched",
                "tx-kernel-hardware",
                "rx-hardware",
                "rx-kernel-driver",
                "rx-program"
            ]
        );
        assert_eq!(m.timestamps.values[0], "2018-03-13T12:37:35.000000000Z");
        assert_eq!(m.latency_nsec, Some(6_000));
        assert!(m.stage_order_violations.is_empty());
    }

    #[test]
    fn test_final_measurement_omits_kernel_tx() {
        let frame = frame_with(7, &[(TimestampSlot::ProgramSend, Timestamp::new(100, 0))]);
        let rx = RxTimestamps {
            program: Timestamp::new(100, 500),
            ..Default::default()
        };

        let m = Measurement::new(&frame, None, &rx);
        assert_eq!(m.timestamps.names, vec!["tx-program", "rx-program"]);
        assert_eq!(m.latency_nsec, Some(500));

        let json = serde_json::to_value(ResultRecord::RxFinal(m)).unwrap();
        assert_eq!(json["type"], "rx-final");
        assert!(json["object"].get("stage-order-violations").is_none());
    }

    #[test]
    fn test_stage_order_violation_reported() {
        let frame = frame_with(
            1,
            &[
                (TimestampSlot::IntervalStart, Timestamp::new(100, 0)),
                (TimestampSlot::ProgramSend, Timestamp::new(99, 0)),
            ],
        );

        let m = Measurement::new(&frame, None, &RxTimestamps::default());
        assert_eq!(m.stage_order_violations, vec!["tx-program"]);
        assert_eq!(m.latency_nsec, None);
    }

    #[test]
    fn test_histogram_record_round_trip() {
        let record = ResultRecord::Histogram(StatisticsReport {
            count: 3,
            min: 1,
            max: 7,
            outliers: 0,
            rms_nsec: 4_200,
            max_nsec: 7_000,
            histogram: vec![0, 1, 0, 0, 0, 0, 0, 2],
        });

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.starts_with(r#"{"type":"histogram","object":{"count":3"#));
        assert!(json.contains(r#""rms-nsec":4200"#));
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.kind(), "histogram");
    }
}
