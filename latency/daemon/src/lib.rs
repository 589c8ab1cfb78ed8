//! Precision packet pacing and latency measurement
//!
//! Provides the sender pacing loop, the receiver measurement loop, and the
//! socket, timestamping, statistics and export pieces they are built from.

pub mod codec;
pub mod collector;
pub mod control;
pub mod exporter;
pub mod hwts;
pub mod pacing;
pub mod receiver;
pub mod rt;
pub mod sequence;
pub mod socket;
pub mod status;
pub mod timeslice;
pub mod transport;
pub mod types;

pub use collector::LatencyStatistics;
pub use control::SharedConfig;
pub use exporter::{ExporterType, JsonExporter, PrometheusExporter, RecordExporter, Tee};
pub use pacing::{PacerSettings, PacingLoop};
pub use receiver::{ReceiveLoop, ReceiveSummary, ReceiverSettings};
pub use socket::PacketSocket;
pub use status::StatusPublisher;
pub use types::*;
