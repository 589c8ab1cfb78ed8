//! Wire codec for test frames
//!
//! Layout (multi-byte integers big-endian):
//!
//! ```text
//! | dst MAC (6) | src MAC (6) | ethertype (2) |
//! | version (1) | stream id (1) | sequence (4) | interval us (2) | offset us (2) | flags (1) |
//! | slot 0: sec (8) nsec (8) | ... | slot N-1 |
//! | zero padding up to the configured frame size |
//! ```

use bytes::{Buf, BufMut};
use std::fmt;
use txrx_common::{
    EtherHeader, FrameFlags, TestFrame, Timestamp, ETHER_ADDR_LEN, ETHER_HEADER_LEN,
    PAYLOAD_HEADER_LEN, PROTOCOL_VERSION, TEST_PACKET_ETHER_TYPE, TimestampSlot,
};

/// Why a buffer could not be decoded as a test frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ends before the frame does
    Truncated { needed: usize, available: usize },
    /// Not our ethertype
    ForeignEtherType(u16),
    /// Our ethertype, but a layout this build does not know
    UnknownVersion(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, available } => {
                write!(f, "truncated frame: need {} bytes, got {}", needed, available)
            }
            DecodeError::ForeignEtherType(t) => write!(f, "foreign ethertype 0x{:04x}", t),
            DecodeError::UnknownVersion(v) => write!(f, "unknown test frame version {}", v),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Serialize `frame`, zero-padding to at least `min_len` bytes
///
/// Returns the number of bytes written.
pub fn encode(frame: &TestFrame, min_len: usize, buf: &mut impl BufMut) -> usize {
    buf.put_slice(&frame.header.destination);
    buf.put_slice(&frame.header.source);
    buf.put_u16(frame.header.ether_type);

    buf.put_u8(frame.version);
    buf.put_u8(frame.stream_id);
    buf.put_u32(frame.sequence);
    buf.put_u16(frame.interval_usec);
    buf.put_u16(frame.offset_usec);
    buf.put_u8(frame.flags.0);

    for ts in frame.timestamps() {
        buf.put_i64(ts.sec);
        buf.put_u64(ts.nsec as u64);
    }

    let written = frame.encoded_len();
    if written < min_len {
        buf.put_bytes(0, min_len - written);
        min_len
    } else {
        written
    }
}

/// Parse a received buffer into a fresh frame
///
/// Trailing padding is ignored.
pub fn decode(mut buf: &[u8]) -> Result<TestFrame, DecodeError> {
    let fixed = ETHER_HEADER_LEN + PAYLOAD_HEADER_LEN;
    if buf.len() < fixed {
        return Err(DecodeError::Truncated {
            needed: fixed,
            available: buf.len(),
        });
    }
    let available = buf.len();

    let mut header = EtherHeader::default();
    buf.copy_to_slice(&mut header.destination[..ETHER_ADDR_LEN]);
    buf.copy_to_slice(&mut header.source[..ETHER_ADDR_LEN]);
    header.ether_type = buf.get_u16();
    if header.ether_type != TEST_PACKET_ETHER_TYPE {
        return Err(DecodeError::ForeignEtherType(header.ether_type));
    }

    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnknownVersion(version));
    }

    let mut frame = TestFrame::new(header);
    frame.stream_id = buf.get_u8();
    frame.sequence = buf.get_u32();
    frame.interval_usec = buf.get_u16();
    frame.offset_usec = buf.get_u16();
    frame.flags = FrameFlags(buf.get_u8());

    let needed = frame.encoded_len();
    if available < needed {
        return Err(DecodeError::Truncated { needed, available });
    }

    for slot in TimestampSlot::ALL.iter().take(frame.slot_count()) {
        let sec = buf.get_i64();
        let nsec = buf.get_u64();
        let ts = Timestamp::from_nanos(sec as i128 * 1_000_000_000 + nsec as i128);
        frame.set_timestamp(*slot, ts);
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use txrx_common::{FLAG_END_OF_STREAM, FLAG_SMALL_PACKET, MIN_FRAME_SIZE};

    fn sample_frame() -> TestFrame {
        let mut frame = TestFrame::new(EtherHeader {
            destination: [0x0c, 0x42, 0xa1, 0xdd, 0x57, 0x30],
            source: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            ether_type: TEST_PACKET_ETHER_TYPE,
        });
        frame.stream_id = 3;
        frame.sequence = 0x0102_0304;
        frame.interval_usec = 1000;
        frame.offset_usec = 250;
        frame.flags.set(FLAG_END_OF_STREAM, true);
        frame
    }

    #[test]
    fn test_full_mode_round_trip() {
        let mut frame = sample_frame();
        for (i, slot) in TimestampSlot::ALL.iter().take(5).enumerate() {
            frame.set_timestamp(*slot, Timestamp::new(1_520_944_655 + i as i64, 5_000_000 * i as u32));
        }

        let mut buf = Vec::new();
        let len = encode(&frame, MIN_FRAME_SIZE, &mut buf);
        assert_eq!(len, 105);
        assert_eq!(buf.len(), 105);

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.timestamps().len(), 5);
    }

    #[test]
    fn test_small_mode_round_trip_is_padded() {
        let mut frame = sample_frame();
        frame.flags.set(FLAG_SMALL_PACKET, true);
        frame.set_timestamp(TimestampSlot::IntervalStart, Timestamp::new(10, 999_999_999));

        let mut buf = Vec::new();
        let len = encode(&frame, MIN_FRAME_SIZE, &mut buf);
        assert_eq!(len, MIN_FRAME_SIZE);
        assert!(buf[41..].iter().all(|b| *b == 0));

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.timestamps().len(), 1);
    }

    #[test]
    fn test_header_byte_layout() {
        let frame = sample_frame();
        let mut buf = Vec::new();
        encode(&frame, 0, &mut buf);

        assert_eq!(&buf[12..14], &[0x08, 0x08]);
        assert_eq!(buf[14], PROTOCOL_VERSION);
        assert_eq!(buf[15], 3);
        assert_eq!(&buf[16..20], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[20..22], &1000u16.to_be_bytes());
        assert_eq!(&buf[22..24], &250u16.to_be_bytes());
        assert_eq!(buf[24], FLAG_END_OF_STREAM);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf = Vec::new();
        encode(&sample_frame(), MIN_FRAME_SIZE, &mut buf);
        buf[14] = PROTOCOL_VERSION + 1;

        assert_eq!(decode(&buf), Err(DecodeError::UnknownVersion(PROTOCOL_VERSION + 1)));
    }

    #[test]
    fn test_foreign_ethertype_rejected() {
        let mut buf = Vec::new();
        encode(&sample_frame(), MIN_FRAME_SIZE, &mut buf);
        buf[12] = 0x08;
        buf[13] = 0x00;

        assert_eq!(decode(&buf), Err(DecodeError::ForeignEtherType(0x0800)));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = Vec::new();
        encode(&sample_frame(), 0, &mut buf);

        assert!(matches!(decode(&buf[..20]), Err(DecodeError::Truncated { .. })));
        assert!(matches!(
            decode(&buf[..60]),
            Err(DecodeError::Truncated { needed: 105, available: 60 })
        ));
    }
}
