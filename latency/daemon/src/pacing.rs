//! Transmit pacing loop
//!
//! Sends one test frame per time slice. Each frame carries the sender-side
//! timestamps of its own send plus the kernel completion stamps of the
//! previous send, which only become available after that frame left.

use crate::codec;
use crate::collector::LatencyStatistics;
use crate::control::SharedConfig;
use crate::exporter::RecordExporter;
use crate::timeslice::{self, TimeSlicer};
use crate::transport::FrameSink;
use crate::types::{iso_timestamp, ResultRecord, StatisticsReport, TxReport};
use anyhow::Result;
use bytes::BytesMut;
use log::{debug, info, warn};
use std::sync::Arc;
use txrx_common::{
    EtherHeader, MacAddr, TestFrame, TimestampSlot, BROADCAST_ADDR, FLAG_END_OF_STREAM,
    FLAG_SMALL_PACKET, MAX_FRAME_SIZE, TEST_PACKET_ETHER_TYPE,
};

/// Fixed per-run pacer settings
#[derive(Debug, Clone)]
pub struct PacerSettings {
    pub destination: MacAddr,
    pub stream_id: u8,
    /// Shift of the send instant past each slice boundary
    pub offset_usec: u16,
    /// Stop after this many frames; the last one is marked end-of-stream
    pub count: Option<u32>,
    /// Carry only the interval-start slot
    pub small: bool,
    /// Emit a `tx-packet` record per frame
    pub verbose: bool,
    /// Histogram ceiling in microseconds
    pub histogram_usec: usize,
}

impl Default for PacerSettings {
    fn default() -> Self {
        Self {
            destination: BROADCAST_ADDR,
            stream_id: 0,
            offset_usec: 0,
            count: None,
            small: false,
            verbose: false,
            histogram_usec: 0,
        }
    }
}

/// Sender driver; owns the scratch frame and buffer
pub struct PacingLoop<S> {
    sink: S,
    config: Arc<SharedConfig>,
    settings: PacerSettings,
    slicer: TimeSlicer,
    frame: TestFrame,
    buf: BytesMut,
    stats: LatencyStatistics,
    sent: u32,
    /// Last configured size that was reported as too small to matter
    undersized: Option<usize>,
}

impl<S: FrameSink> PacingLoop<S> {
    pub fn new(sink: S, config: Arc<SharedConfig>, settings: PacerSettings) -> Self {
        let mut frame = TestFrame::new(EtherHeader {
            destination: settings.destination,
            source: sink.source_address(),
            ether_type: TEST_PACKET_ETHER_TYPE,
        });
        frame.stream_id = settings.stream_id;
        frame.offset_usec = settings.offset_usec;
        frame.flags.set(FLAG_SMALL_PACKET, settings.small);

        Self {
            sink,
            config,
            stats: LatencyStatistics::new(settings.histogram_usec),
            settings,
            slicer: TimeSlicer::new(),
            frame,
            buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
            sent: 0,
            undersized: None,
        }
    }

    /// Frames transmitted so far
    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Run until shutdown or until the configured count has been sent
    ///
    /// # Returns
    ///
    /// Final statistics snapshot
    pub fn run(&mut self, exporter: &mut dyn RecordExporter) -> Result<StatisticsReport> {
        info!(
            "Pacing stream {} every {} us",
            self.settings.stream_id,
            self.config.interval_usec()
        );

        while !self.config.is_shutdown() {
            let last = self.iterate(exporter)?;

            if self.config.take_dump_request() {
                exporter.export(&ResultRecord::Histogram(self.stats.report()))?;
            }

            if last {
                info!("Sent {} frames, end of stream", self.sent);
                break;
            }
        }

        exporter.flush()?;
        Ok(self.stats.report())
    }

    /// One slice; returns true after the end-of-stream frame went out
    fn iterate(&mut self, exporter: &mut dyn RecordExporter) -> Result<bool> {
        let interval_usec = self.config.interval_usec().max(1);
        let packet_size = self.config.packet_size();
        let interval_ns = interval_usec as i64 * 1000;

        let completions = self.sink.drain_tx_timestamps();
        if completions.extra > 0 {
            debug!("{} surplus tx completions ignored", completions.extra);
        }

        let wait = self
            .slicer
            .wait_for_next_slice(interval_ns, self.settings.offset_usec as u32);

        if !self.config.is_running() {
            return Ok(false);
        }

        let frame = &mut self.frame;
        frame.clear_timestamps();
        frame.interval_usec = u16::try_from(interval_usec).unwrap_or(u16::MAX);
        frame.set_timestamp(TimestampSlot::IntervalStart, wait.interval_start);
        frame.set_timestamp(TimestampSlot::Wakeup, wait.wakeup);
        frame.set_timestamp(TimestampSlot::KernelSchedulerTx, completions.scheduler);
        frame.set_timestamp(TimestampSlot::KernelSoftwareTx, completions.sent);

        let last = self.settings.count.is_some_and(|count| self.sent + 1 >= count);
        frame.flags.set(FLAG_END_OF_STREAM, last);

        let program_send = timeslice::now();
        frame.set_timestamp(TimestampSlot::ProgramSend, program_send);

        let frame_len = frame.encoded_len();
        if packet_size < frame_len {
            if self.undersized != Some(packet_size) {
                info!(
                    "Frame size {} is below the {} bytes this frame needs; sending {} bytes",
                    packet_size, frame_len, frame_len
                );
                self.undersized = Some(packet_size);
            }
        } else {
            self.undersized = None;
        }

        self.buf.clear();
        codec::encode(frame, packet_size, &mut self.buf);

        if let Err(e) = self.sink.send(&self.buf) {
            warn!("Failed to send frame {}: {}", frame.sequence, e);
        }

        let deviation = self.stats.record_send(program_send, wait.target, interval_ns);
        if self.settings.verbose {
            exporter.export(&ResultRecord::TxPacket(TxReport {
                stream_id: frame.stream_id,
                sequence_number: frame.sequence,
                target: iso_timestamp(wait.target),
                tx_program: iso_timestamp(program_send),
                deviation_nsec: deviation.as_nanos(),
            }))?;
        }

        frame.sequence = frame.sequence.wrapping_add(1);
        self.sent += 1;
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use crate::transport::FrameSource;

    fn settings(count: u32) -> PacerSettings {
        PacerSettings {
            count: Some(count),
            verbose: true,
            histogram_usec: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_sends_count_frames_and_marks_last() {
        let (sink, mut source) = memory::link();
        let config = Arc::new(SharedConfig::new(1000, 64));
        let mut pacer = PacingLoop::new(sink, config, settings(3));

        let mut records: Vec<ResultRecord> = Vec::new();
        let report = pacer.run(&mut records).unwrap();
        assert_eq!(pacer.sent(), 3);
        assert_eq!(report.count, 3);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.kind() == "tx-packet"));

        let mut buf = [0u8; 2048];
        let mut frames = Vec::new();
        while let Ok(Some(received)) = source.recv(&mut buf) {
            let frame = codec::decode(&buf[..received.len]).unwrap();
            // Full mode needs more than the configured 64 bytes; no padding
            assert_eq!(received.len, frame.encoded_len().max(64));
            assert_eq!(received.len, 14 + 11 + 5 * 16);
            frames.push(frame);
            if frames.len() == 3 {
                break;
            }
        }

        let sequences: Vec<u32> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(!frames[0].is_end_of_stream());
        assert!(frames[2].is_end_of_stream());
        assert_eq!(frames[0].interval_usec, 1000);
        assert_eq!(frames[0].header.destination, BROADCAST_ADDR);
        assert_eq!(frames[0].header.source, memory::SENDER_MAC);
    }

    #[test]
    fn test_frames_carry_previous_completions() {
        let (sink, mut source) = memory::link();
        let config = Arc::new(SharedConfig::new(1000, 128));
        let mut pacer = PacingLoop::new(sink, config, settings(2));
        pacer.run(&mut Vec::<ResultRecord>::new()).unwrap();

        let mut buf = [0u8; 2048];
        let first = source.recv(&mut buf).unwrap().unwrap();
        assert_eq!(first.len, 128);
        let first = codec::decode(&buf[..first.len]).unwrap();
        let second = source.recv(&mut buf).unwrap().unwrap();
        let second = codec::decode(&buf[..second.len]).unwrap();

        assert!(first.timestamp(TimestampSlot::KernelSchedulerTx).is_unset());
        assert!(!second.timestamp(TimestampSlot::KernelSchedulerTx).is_unset());
        assert!(!second.timestamp(TimestampSlot::KernelSoftwareTx).is_unset());

        let t0 = first.timestamp(TimestampSlot::IntervalStart);
        let wakeup = first.timestamp(TimestampSlot::Wakeup);
        let send = first.timestamp(TimestampSlot::ProgramSend);
        assert!(t0 <= wakeup && wakeup <= send);
    }

    #[test]
    fn test_small_mode_carries_interval_start_only() {
        let (sink, mut source) = memory::link();
        let config = Arc::new(SharedConfig::new(1000, 64));
        let mut pacer = PacingLoop::new(
            sink,
            config,
            PacerSettings {
                small: true,
                ..settings(1)
            },
        );
        pacer.run(&mut Vec::<ResultRecord>::new()).unwrap();

        let mut buf = [0u8; 2048];
        let received = source.recv(&mut buf).unwrap().unwrap();
        let frame = codec::decode(&buf[..received.len]).unwrap();
        assert_eq!(frame.timestamps().len(), 1);
        assert!(!frame.timestamp(TimestampSlot::IntervalStart).is_unset());
        assert!(frame.timestamp(TimestampSlot::ProgramSend).is_unset());
    }

    #[test]
    fn test_undersized_frame_is_noted_once_per_size() {
        let (sink, mut source) = memory::link();
        let config = Arc::new(SharedConfig::new(1000, 64));
        let mut pacer = PacingLoop::new(sink, Arc::clone(&config), settings(3));
        let mut records: Vec<ResultRecord> = Vec::new();

        pacer.iterate(&mut records).unwrap();
        assert_eq!(pacer.undersized, Some(64));

        config.set_packet_size(256);
        pacer.iterate(&mut records).unwrap();
        assert_eq!(pacer.undersized, None);

        config.set_packet_size(80);
        pacer.iterate(&mut records).unwrap();
        assert_eq!(pacer.undersized, Some(80));

        let mut buf = [0u8; 2048];
        let lengths: Vec<usize> = (0..3)
            .map(|_| source.recv(&mut buf).unwrap().unwrap().len)
            .collect();
        assert_eq!(lengths, vec![105, 256, 105]);
    }

    #[test]
    fn test_small_frame_fits_minimum_size() {
        let (sink, _source) = memory::link();
        let config = Arc::new(SharedConfig::new(1000, 64));
        let mut pacer = PacingLoop::new(
            sink,
            config,
            PacerSettings {
                small: true,
                ..settings(1)
            },
        );
        pacer.run(&mut Vec::<ResultRecord>::new()).unwrap();
        assert_eq!(pacer.undersized, None);
    }

    #[test]
    fn test_shutdown_before_start() {
        let (sink, _source) = memory::link();
        let config = Arc::new(SharedConfig::new(1000, 64));
        config.request_shutdown();

        let mut pacer = PacingLoop::new(sink, config, PacerSettings::default());
        let report = pacer.run(&mut Vec::<ResultRecord>::new()).unwrap();
        assert_eq!(pacer.sent(), 0);
        assert_eq!(report.count, 0);
    }

    #[test]
    fn test_dump_request_emits_histogram() {
        let (sink, _source) = memory::link();
        let config = Arc::new(SharedConfig::new(1000, 64));
        config.request_dump();

        let mut pacer = PacingLoop::new(
            sink,
            config,
            PacerSettings {
                verbose: false,
                ..settings(1)
            },
        );
        let mut records: Vec<ResultRecord> = Vec::new();
        pacer.run(&mut records).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), "histogram");
    }
}
