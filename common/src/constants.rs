//! Shared constants for the sender and receiver
//!
//! These constants are used by both the pacing and the receive side
//! so that both ends agree on the wire format and limits.

// ============================================================================
// Wire Format
// ============================================================================

/// Reserved, non-standard ethertype carried by every test frame
pub const TEST_PACKET_ETHER_TYPE: u16 = 0x0808;

/// Wire format version understood by this build
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the Ethernet header (dst MAC, src MAC, ethertype)
pub const ETHER_HEADER_LEN: usize = 14;

/// Length of an Ethernet MAC address
pub const ETHER_ADDR_LEN: usize = 6;

/// Length of the fixed payload fields following the Ethernet header
/// (version, stream id, sequence, interval, offset, flags)
pub const PAYLOAD_HEADER_LEN: usize = 11;

/// Encoded size of one timestamp slot (8 bytes seconds, 8 bytes nanoseconds)
pub const TIMESTAMP_SLOT_LEN: usize = 16;

/// Number of timestamp slots carried in full mode
pub const FULL_MODE_SLOTS: usize = 5;

/// Number of timestamp slots carried in small-packet mode
pub const SMALL_MODE_SLOTS: usize = 1;

/// Smallest frame put on the wire (padding is added up to this size)
pub const MIN_FRAME_SIZE: usize = 64;

/// Largest frame the sender will build
pub const MAX_FRAME_SIZE: usize = 1514;

// ============================================================================
// Frame Flags (for TestFrame.flags)
// ============================================================================

/// Last frame of a stream; the receiver stops after it
pub const FLAG_END_OF_STREAM: u8 = 1 << 0;

/// Frame carries only the interval-start slot
pub const FLAG_SMALL_PACKET: u8 = 1 << 1;

// ============================================================================
// Timing
// ============================================================================

/// Nanoseconds per second
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Safety margin before the target at which the coarse timer fires and
/// the busy-poll phase takes over (300 microseconds)
pub const TIME_BEFORE_NS: i64 = 300_000;

/// Default pacing interval in microseconds
pub const DEFAULT_INTERVAL_USEC: u32 = 1_000;

// ============================================================================
// Limits
// ============================================================================

/// Number of independently tracked streams on the receive side
pub const MAX_STREAMS: usize = 16;

/// Upper bound for the histogram ceiling in microseconds
pub const HISTOGRAM_VALUES_MAX: usize = 1_000;

/// Capacity of the running statistics circular buffers
pub const STATS_WINDOW: usize = 100;
