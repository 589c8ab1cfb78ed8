//! Frame transport abstraction
//!
//! The pacing and receive loops talk to the network through these traits so
//! they can run over a raw packet socket in production and over an
//! in-memory link in tests.

use crate::hwts::{RxTimestamps, TxCompletions};
use std::io;
use txrx_common::MacAddr;

/// A frame read from the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes written into the caller's buffer
    pub len: usize,
    /// Kernel receive stamps; `program` is filled by the loop
    pub rx: RxTimestamps,
}

/// Transmit side of a link
pub trait FrameSink {
    /// Send one complete frame
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Collect transmit-completion stamps queued since the last call
    ///
    /// Never blocks; an empty queue yields empty completions.
    fn drain_tx_timestamps(&mut self) -> TxCompletions;

    /// Hardware address frames are sent from
    fn source_address(&self) -> MacAddr;
}

/// Receive side of a link
pub trait FrameSource {
    /// Read one frame into `buf`
    ///
    /// Returns `Ok(None)` when the read timed out or was interrupted, so the
    /// caller can poll for shutdown.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Received>>;

    /// Hardware address frames are expected at
    fn local_address(&self) -> MacAddr;
}
