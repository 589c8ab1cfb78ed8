//! Receive loop
//!
//! Reads test frames, checks sequence continuity per stream and reports one
//! measurement per frame. A frame's kernel transmit stamps travel in its
//! successor, so frame N is reported when N+1 arrives; the end-of-stream
//! frame is reported immediately without them.

use crate::codec::{self, DecodeError};
use crate::collector::LatencyStatistics;
use crate::control::SharedConfig;
use crate::exporter::RecordExporter;
use crate::hwts::RxTimestamps;
use crate::sequence::StreamTable;
use crate::timeslice;
use crate::transport::FrameSource;
use crate::types::{Measurement, ResultRecord, SequenceError, StatisticsReport};
use anyhow::Result;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use txrx_common::{BROADCAST_ADDR, ETHER_ADDR_LEN, MAX_FRAME_SIZE};

/// Fixed per-run receiver settings
#[derive(Debug, Clone, Default)]
pub struct ReceiverSettings {
    /// Stop after this many test frames
    pub count: Option<u32>,
    /// Accept only frames addressed to us or to broadcast
    pub filter_destination: bool,
    /// Histogram ceiling in microseconds
    pub histogram_usec: usize,
}

/// Counters reported when the loop ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub frames: u64,
    pub measurements: u64,
    pub sequence_errors: u64,
    pub dropped: i64,
    /// Frames that were not ours: other ethertype, other destination, other version
    pub ignored: u64,
    pub active_streams: usize,
    pub statistics: StatisticsReport,
}

/// Receiver driver; owns the stream table
pub struct ReceiveLoop<S> {
    source: S,
    config: Arc<SharedConfig>,
    settings: ReceiverSettings,
    streams: StreamTable,
    stats: LatencyStatistics,
    buf: Vec<u8>,
    summary: ReceiveSummary,
}

impl<S: FrameSource> ReceiveLoop<S> {
    pub fn new(source: S, config: Arc<SharedConfig>, settings: ReceiverSettings) -> Self {
        Self {
            source,
            config,
            stats: LatencyStatistics::new(settings.histogram_usec),
            settings,
            streams: StreamTable::new(),
            buf: vec![0; MAX_FRAME_SIZE + 64],
            summary: ReceiveSummary::default(),
        }
    }

    /// Run until shutdown, end of stream or the configured count
    pub fn run(&mut self, exporter: &mut dyn RecordExporter) -> Result<ReceiveSummary> {
        info!("Waiting for test frames...");

        while !self.config.is_shutdown() {
            let received = match self.source.recv(&mut self.buf) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("Link closed");
                    break;
                }
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    continue;
                }
            };

            let mut rx = received.rx;
            rx.program = timeslice::now();

            let done = self.handle_frame(received.len, rx, exporter)?;

            if self.config.take_dump_request() {
                exporter.export(&ResultRecord::Histogram(self.stats.report()))?;
            }

            if done {
                break;
            }
        }

        exporter.flush()?;
        self.summary.active_streams = self.streams.active_streams();
        self.summary.statistics = self.stats.report();
        Ok(self.summary.clone())
    }

    /// Process one read; returns true when the loop should stop
    fn handle_frame(
        &mut self,
        len: usize,
        rx: RxTimestamps,
        exporter: &mut dyn RecordExporter,
    ) -> Result<bool> {
        let data = &self.buf[..len];

        if self.settings.filter_destination && len >= ETHER_ADDR_LEN {
            let destination = &data[..ETHER_ADDR_LEN];
            if destination != self.source.local_address() && destination != BROADCAST_ADDR {
                self.summary.ignored += 1;
                return Ok(false);
            }
        }

        let frame = match codec::decode(data) {
            Ok(frame) => frame,
            Err(DecodeError::Truncated { needed, available }) => {
                warn!("Truncated test frame: {} of {} bytes", available, needed);
                self.summary.ignored += 1;
                return Ok(false);
            }
            Err(e) => {
                debug!("Ignoring frame: {}", e);
                self.summary.ignored += 1;
                return Ok(false);
            }
        };

        let Some(stream) = self.streams.get_mut(frame.stream_id) else {
            warn!("Ignoring frame of unsupported stream {}", frame.stream_id);
            self.summary.ignored += 1;
            return Ok(false);
        };

        self.summary.frames += 1;

        let report = stream.tracker.observe(frame.sequence);
        if report.is_anomaly() {
            debug!(
                "Stream {} sequence {}: dropped {} reordered {}",
                frame.stream_id, frame.sequence, report.dropped, report.reordered
            );
            self.summary.sequence_errors += 1;
            self.summary.dropped += report.dropped;
            stream.clear_previous();
            exporter.export(&ResultRecord::RxError(SequenceError {
                stream_id: frame.stream_id,
                sequence_number: frame.sequence,
                dropped_packets: report.dropped,
                sequence_error: report.reordered,
            }))?;
        } else if let (Some(previous), Some(previous_rx)) =
            (stream.last_frame.take(), stream.last_rx.take())
        {
            self.summary.measurements += 1;
            let measurement = Measurement::new(&previous, Some(&frame), &previous_rx);
            report_violations(&measurement);
            exporter.export(&ResultRecord::RxPacket(measurement))?;
        }

        let interval_ns = frame.interval_usec as i64 * 1000;
        if interval_ns > 0 {
            self.stats.record_arrival(&mut stream.arrivals, rx.best(), interval_ns);
        }

        if frame.is_end_of_stream() {
            self.summary.measurements += 1;
            let measurement = Measurement::new(&frame, None, &rx);
            report_violations(&measurement);
            exporter.export(&ResultRecord::RxFinal(measurement))?;
            info!("End of stream {} at sequence {}", frame.stream_id, frame.sequence);
            return Ok(true);
        }

        stream.last_frame = Some(frame);
        stream.last_rx = Some(rx);

        Ok(self
            .settings
            .count
            .is_some_and(|count| self.summary.frames >= count as u64))
    }
}

fn report_violations(measurement: &Measurement) {
    if !measurement.stage_order_violations.is_empty() {
        debug!(
            "Stream {} sequence {}: out-of-order stages {:?}",
            measurement.stream_id, measurement.sequence_number, measurement.stage_order_violations
        );
    }
}
