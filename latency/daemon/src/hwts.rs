//! Kernel timestamp extraction
//!
//! Parses the ancillary data the kernel attaches to received frames and to
//! transmit-completion records on the socket error queue. The kernel hands
//! out `struct scm_timestamping { struct timespec ts[3]; }` where index 0 is
//! the software stamp and index 2 the raw hardware stamp.
//!
//! Transmit completions on a raw packet socket carry no reliable tag saying
//! which stage they belong to, so completions are assigned by arrival order:
//! the first record after a send is the scheduler stamp and the second is the
//! driver/NIC stamp. This is best-effort; kernels differ in how many records
//! they deliver.

use crate::socket::IfReq;
use log::debug;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use txrx_common::Timestamp;

// Linux SO_TIMESTAMPING flags (from <linux/net_tstamp.h>)
pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
pub const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
pub const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
pub const SOF_TIMESTAMPING_OPT_ID: u32 = 1 << 7;
pub const SOF_TIMESTAMPING_TX_SCHED: u32 = 1 << 8;
pub const SOF_TIMESTAMPING_OPT_CMSG: u32 = 1 << 10;

/// Flags for a socket that both sends and receives test frames
pub const TIMESTAMPING_FLAGS: u32 = SOF_TIMESTAMPING_TX_HARDWARE
    | SOF_TIMESTAMPING_TX_SOFTWARE
    | SOF_TIMESTAMPING_TX_SCHED
    | SOF_TIMESTAMPING_RX_HARDWARE
    | SOF_TIMESTAMPING_RX_SOFTWARE
    | SOF_TIMESTAMPING_SOFTWARE
    | SOF_TIMESTAMPING_RAW_HARDWARE
    | SOF_TIMESTAMPING_OPT_CMSG
    | SOF_TIMESTAMPING_OPT_ID;

// Error-queue stage identifiers (ee_info of a PACKET_TX_TIMESTAMP record)
pub const SCM_TSTAMP_SND: u32 = 0;
pub const SCM_TSTAMP_SCHED: u32 = 1;
pub const SCM_TSTAMP_ACK: u32 = 2;

/// cmsg type of the extended error attached to packet-socket completions
pub const PACKET_TX_TIMESTAMP: i32 = 16;

const SCM_TIMESTAMPING: i32 = libc::SO_TIMESTAMPING;

// struct hwtstamp_config (from <linux/net_tstamp.h>)
const HWTSTAMP_TX_ON: i32 = 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct HwTstampConfig {
    flags: i32,
    tx_type: i32,
    rx_filter: i32,
}

/// Hardware receive filters accepted by `SIOCSHWTSTAMP`
pub const RX_FILTERS: &[(&str, i32)] = &[
    ("HWTSTAMP_FILTER_NONE", 0),
    ("HWTSTAMP_FILTER_ALL", 1),
    ("HWTSTAMP_FILTER_SOME", 2),
    ("HWTSTAMP_FILTER_PTP_V1_L4_EVENT", 3),
    ("HWTSTAMP_FILTER_PTP_V1_L4_SYNC", 4),
    ("HWTSTAMP_FILTER_PTP_V1_L4_DELAY_REQ", 5),
    ("HWTSTAMP_FILTER_PTP_V2_L4_EVENT", 6),
    ("HWTSTAMP_FILTER_PTP_V2_L4_SYNC", 7),
    ("HWTSTAMP_FILTER_PTP_V2_L4_DELAY_REQ", 8),
    ("HWTSTAMP_FILTER_PTP_V2_L2_EVENT", 9),
    ("HWTSTAMP_FILTER_PTP_V2_L2_SYNC", 10),
    ("HWTSTAMP_FILTER_PTP_V2_L2_DELAY_REQ", 11),
    ("HWTSTAMP_FILTER_PTP_V2_EVENT", 12),
    ("HWTSTAMP_FILTER_PTP_V2_SYNC", 13),
    ("HWTSTAMP_FILTER_PTP_V2_DELAY_REQ", 14),
];

/// Default receive filter: timestamp every frame
pub const HWTSTAMP_FILTER_ALL: i32 = 1;

/// Look up a receive filter by name
///
/// Accepts the full constant name or the part after `HWTSTAMP_FILTER_`,
/// case-insensitively.
pub fn rx_filter_by_name(name: &str) -> Option<i32> {
    let wanted = name.to_ascii_uppercase();
    RX_FILTERS
        .iter()
        .find(|(full, _)| {
            *full == wanted || full.strip_prefix("HWTSTAMP_FILTER_") == Some(wanted.as_str())
        })
        .map(|(_, value)| *value)
}

/// Configure the NIC to timestamp transmitted and received frames
///
/// Issues `SIOCSHWTSTAMP` on `interface`. Fails when the driver has no
/// hardware timestamping support.
pub fn configure_interface(fd: RawFd, interface: &str, rx_filter: i32) -> io::Result<()> {
    let mut config = HwTstampConfig {
        flags: 0,
        tx_type: HWTSTAMP_TX_ON,
        rx_filter,
    };

    let mut ifr = IfReq::new(interface)?;
    ifr.data.data = &mut config as *mut HwTstampConfig as *mut libc::c_void;

    let ret = unsafe { libc::ioctl(fd, libc::SIOCSHWTSTAMP as _, &mut ifr as *mut IfReq) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Enable `SO_TIMESTAMPING` with the given flags on a socket
pub fn enable_timestamping(fd: RawFd, flags: u32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            &flags as *const u32 as *const libc::c_void,
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// One ancillary record from a `recvmsg` control buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage<'a> {
    pub level: i32,
    pub kind: i32,
    pub data: &'a [u8],
}

fn cmsg_align(len: usize) -> usize {
    let align = mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

fn cmsg_header_len() -> usize {
    cmsg_align(mem::size_of::<libc::cmsghdr>())
}

/// Iterator over the records of a control buffer
///
/// Stops at the first record whose length does not fit the buffer.
pub struct ControlMessages<'a> {
    buf: &'a [u8],
    offset: usize,
}

/// Walk the control messages in `buf` (the filled part of `msg_control`)
pub fn control_messages(buf: &[u8]) -> ControlMessages<'_> {
    ControlMessages { buf, offset: 0 }
}

impl<'a> Iterator for ControlMessages<'a> {
    type Item = ControlMessage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buf.get(self.offset..)?;
        if rest.len() < mem::size_of::<libc::cmsghdr>() {
            return None;
        }

        // SAFETY: length checked above; the header may be unaligned inside `buf`.
        let hdr = unsafe { std::ptr::read_unaligned(rest.as_ptr() as *const libc::cmsghdr) };
        let len = hdr.cmsg_len as usize;
        let header_len = cmsg_header_len();
        if len < header_len || len > rest.len() {
            return None;
        }

        self.offset += cmsg_align(len);
        Some(ControlMessage {
            level: hdr.cmsg_level,
            kind: hdr.cmsg_type,
            data: &rest[header_len..len],
        })
    }
}

fn parse_timespec(data: &[u8]) -> Timestamp {
    // SAFETY: caller passes at least size_of::<timespec>() bytes.
    let ts = unsafe { std::ptr::read_unaligned(data.as_ptr() as *const libc::timespec) };
    if ts.tv_nsec < 0 || ts.tv_nsec >= 1_000_000_000 {
        return Timestamp::UNSET;
    }
    Timestamp::new(ts.tv_sec as i64, ts.tv_nsec as u32)
}

/// Decode the three stamps of an `scm_timestamping` payload
pub fn parse_scm_timestamping(data: &[u8]) -> Option<[Timestamp; 3]> {
    let size = mem::size_of::<libc::timespec>();
    if data.len() < size * 3 {
        return None;
    }

    Some([
        parse_timespec(&data[..size]),
        parse_timespec(&data[size..size * 2]),
        parse_timespec(&data[size * 2..size * 3]),
    ])
}

/// Timestamps collected for one received frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxTimestamps {
    /// NIC receive stamp (primary)
    pub hardware: Timestamp,
    /// Kernel software receive stamp
    pub software: Timestamp,
    /// Receiver read the frame
    pub program: Timestamp,
}

impl RxTimestamps {
    /// Best available receive stamp: hardware, then software, then program
    pub fn best(&self) -> Timestamp {
        [self.hardware, self.software, self.program]
            .into_iter()
            .find(|ts| !ts.is_unset())
            .unwrap_or(Timestamp::UNSET)
    }
}

/// Extract receive stamps from the control buffer of a received frame
///
/// Missing records leave the corresponding stamps unset.
pub fn extract_rx_timestamps(control: &[u8]) -> RxTimestamps {
    let mut rx = RxTimestamps::default();

    for cmsg in control_messages(control) {
        if cmsg.level != libc::SOL_SOCKET || cmsg.kind != SCM_TIMESTAMPING {
            continue;
        }
        if let Some(stamps) = parse_scm_timestamping(cmsg.data) {
            rx.software = stamps[0];
            rx.hardware = stamps[2];
        }
    }

    rx
}

/// `struct sock_extended_err` fields we use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedError {
    pub errno: u32,
    pub origin: u8,
    /// Stage (`SCM_TSTAMP_*`) for timestamp completions
    pub info: u32,
    /// Per-socket counter when `SOF_TIMESTAMPING_OPT_ID` is set
    pub data: u32,
}

fn parse_extended_error(data: &[u8]) -> Option<ExtendedError> {
    if data.len() < 16 {
        return None;
    }
    let u32_at = |at: usize| u32::from_ne_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

    Some(ExtendedError {
        errno: u32_at(0),
        origin: data[4],
        info: u32_at(8),
        data: u32_at(12),
    })
}

/// One drained error-queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    /// Extended error metadata, when the kernel attached it
    pub error: Option<ExtendedError>,
    /// Hardware stamp when set, otherwise software stamp
    pub timestamp: Timestamp,
}

/// Parse one error-queue message's control buffer
///
/// Returns `None` when the message carried no timestamp at all.
pub fn parse_tx_completion(control: &[u8]) -> Option<TxCompletion> {
    let mut error = None;
    let mut stamp = None;

    for cmsg in control_messages(control) {
        if cmsg.level == libc::SOL_PACKET && cmsg.kind == PACKET_TX_TIMESTAMP {
            error = parse_extended_error(cmsg.data);
        } else if cmsg.level == libc::SOL_SOCKET && cmsg.kind == SCM_TIMESTAMPING {
            if let Some(stamps) = parse_scm_timestamping(cmsg.data) {
                stamp = Some(if stamps[2].is_unset() { stamps[0] } else { stamps[2] });
            }
        } else {
            debug!("ignoring cmsg level={} type={}", cmsg.level, cmsg.kind);
        }
    }

    stamp.map(|timestamp| TxCompletion { error, timestamp })
}

/// Completion stamps gathered for the most recent send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCompletions {
    /// First completion: packet scheduler enqueue
    pub scheduler: Timestamp,
    /// Second completion: driver / NIC transmit
    pub sent: Timestamp,
    /// Completions beyond the second
    pub extra: u32,
    received: u8,
}

impl TxCompletions {
    /// Assign the next completion by arrival order
    pub fn push(&mut self, completion: TxCompletion) {
        if let Some(err) = completion.error {
            debug!(
                "tx completion stage={} key={} errno={}",
                stage_name(err.info),
                err.data,
                err.errno
            );
        }

        match self.received {
            0 => self.scheduler = completion.timestamp,
            1 => self.sent = completion.timestamp,
            _ => self.extra += 1,
        }
        self.received = self.received.saturating_add(1);
    }

    pub fn is_empty(&self) -> bool {
        self.received == 0
    }

    pub fn len(&self) -> usize {
        self.received as usize
    }
}

fn stage_name(info: u32) -> &'static str {
    match info {
        SCM_TSTAMP_SND => "SND",
        SCM_TSTAMP_SCHED => "ENQ",
        SCM_TSTAMP_ACK => "ACK",
        _ => "?",
    }
}
