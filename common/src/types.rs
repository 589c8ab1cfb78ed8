//! Frame and timestamp-slot definitions shared by sender and receiver
//!
//! These types describe a test frame in memory. The byte layout on the
//! wire is produced by the daemon's codec.

use crate::constants::{
    ETHER_ADDR_LEN, ETHER_HEADER_LEN, FLAG_END_OF_STREAM, FLAG_SMALL_PACKET, FULL_MODE_SLOTS,
    PAYLOAD_HEADER_LEN, PROTOCOL_VERSION, SMALL_MODE_SLOTS, TEST_PACKET_ETHER_TYPE,
    TIMESTAMP_SLOT_LEN,
};
use crate::time::Timestamp;

/// Ethernet hardware address
pub type MacAddr = [u8; ETHER_ADDR_LEN];

/// The all-ones broadcast address
pub const BROADCAST_ADDR: MacAddr = [0xff; ETHER_ADDR_LEN];

/// Pipeline stage at which a timestamp is recorded
///
/// Declaration order is pipeline order: for a healthy frame each stage's
/// timestamp is not earlier than the previous stage's.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimestampSlot {
    /// Slice boundary the frame was scheduled for (T0)
    IntervalStart = 0,
    /// Sender woke up from the busy-poll
    Wakeup = 1,
    /// Sender handed the frame to the kernel
    ProgramSend = 2,
    /// Kernel queued the frame to the packet scheduler
    KernelSchedulerTx = 3,
    /// Driver or NIC reported the frame as sent
    KernelSoftwareTx = 4,
    /// NIC received the frame
    KernelHardwareRx = 5,
    /// Kernel software receive path
    KernelSoftwareRx = 6,
    /// Receiver read the frame
    ProgramRecv = 7,
}

impl TimestampSlot {
    /// Every slot, in pipeline order
    pub const ALL: [TimestampSlot; 8] = [
        TimestampSlot::IntervalStart,
        TimestampSlot::Wakeup,
        TimestampSlot::ProgramSend,
        TimestampSlot::KernelSchedulerTx,
        TimestampSlot::KernelSoftwareTx,
        TimestampSlot::KernelHardwareRx,
        TimestampSlot::KernelSoftwareRx,
        TimestampSlot::ProgramRecv,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used in result records
    pub fn name(self) -> &'static str {
        match self {
            TimestampSlot::IntervalStart => "interval-start",
            TimestampSlot::Wakeup => "tx-wakeup",
            TimestampSlot::ProgramSend => "tx-program",
            TimestampSlot::KernelSchedulerTx => "tx-kernel-netsched",
            TimestampSlot::KernelSoftwareTx => "tx-kernel-hardware",
            TimestampSlot::KernelHardwareRx => "rx-hardware",
            TimestampSlot::KernelSoftwareRx => "rx-kernel-driver",
            TimestampSlot::ProgramRecv => "rx-program",
        }
    }

    /// True for the slots a frame carries on the wire
    pub fn is_carried(self) -> bool {
        self.index() < FULL_MODE_SLOTS
    }
}

/// Ethernet header of a test frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EtherHeader {
    pub destination: MacAddr,
    pub source: MacAddr,
    pub ether_type: u16,
}

impl Default for EtherHeader {
    fn default() -> Self {
        Self {
            destination: BROADCAST_ADDR,
            source: [0; ETHER_ADDR_LEN],
            ether_type: TEST_PACKET_ETHER_TYPE,
        }
    }
}

/// Bit set carried in the frame's flags byte
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub fn end_of_stream(&self) -> bool {
        self.0 & FLAG_END_OF_STREAM != 0
    }

    pub fn small_packet(&self) -> bool {
        self.0 & FLAG_SMALL_PACKET != 0
    }

    pub fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// A test frame as held by either loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestFrame {
    pub header: EtherHeader,
    pub version: u8,
    pub stream_id: u8,
    pub sequence: u32,
    pub interval_usec: u16,
    pub offset_usec: u16,
    pub flags: FrameFlags,
    timestamps: [Timestamp; FULL_MODE_SLOTS],
}

impl Default for TestFrame {
    fn default() -> Self {
        Self::new(EtherHeader::default())
    }
}

impl TestFrame {
    /// Create an empty frame of the current protocol version
    pub fn new(header: EtherHeader) -> Self {
        Self {
            header,
            version: PROTOCOL_VERSION,
            stream_id: 0,
            sequence: 0,
            interval_usec: 0,
            offset_usec: 0,
            flags: FrameFlags::default(),
            timestamps: [Timestamp::UNSET; FULL_MODE_SLOTS],
        }
    }

    /// Number of timestamp slots this frame carries on the wire
    pub fn slot_count(&self) -> usize {
        if self.flags.small_packet() {
            SMALL_MODE_SLOTS
        } else {
            FULL_MODE_SLOTS
        }
    }

    /// Carried timestamps in slot order
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps[..self.slot_count()]
    }

    /// Timestamp for `slot`, or unset when the frame does not carry it
    pub fn timestamp(&self, slot: TimestampSlot) -> Timestamp {
        if slot.index() < self.slot_count() {
            self.timestamps[slot.index()]
        } else {
            Timestamp::UNSET
        }
    }

    /// Store a timestamp; returns false when the slot is not carried
    pub fn set_timestamp(&mut self, slot: TimestampSlot, ts: Timestamp) -> bool {
        if slot.index() < self.slot_count() {
            self.timestamps[slot.index()] = ts;
            true
        } else {
            false
        }
    }

    /// Reset every carried slot to unset
    pub fn clear_timestamps(&mut self) {
        self.timestamps = [Timestamp::UNSET; FULL_MODE_SLOTS];
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.end_of_stream()
    }

    /// Bytes needed before padding
    pub fn encoded_len(&self) -> usize {
        ETHER_HEADER_LEN + PAYLOAD_HEADER_LEN + self.slot_count() * TIMESTAMP_SLOT_LEN
    }
}

/// Parse a colon-separated MAC address such as `ff:ff:ff:ff:ff:ff`
pub fn parse_mac(s: &str) -> Option<MacAddr> {
    let mut addr = [0u8; ETHER_ADDR_LEN];
    let mut parts = s.split(':');

    for byte in addr.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }

    if parts.next().is_some() {
        return None;
    }

    Some(addr)
}
