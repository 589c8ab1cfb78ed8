//! Raw packet socket
//!
//! Opens an `AF_PACKET`/`SOCK_RAW` socket bound to one interface, configures
//! kernel and NIC timestamping, and implements the frame transport traits on
//! top of `send`/`recvmsg`.

use crate::hwts::{self, TxCompletions};
use crate::transport::{FrameSink, FrameSource, Received};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use txrx_common::{MacAddr, ETHER_ADDR_LEN};

/// Ancillary buffer size for one `recvmsg`
const CONTROL_LEN: usize = 512;

/// Upper bound on error-queue records read per drain
const MAX_COMPLETIONS_PER_DRAIN: usize = 8;

/// `struct ifreq` with the union members used here
#[repr(C)]
pub(crate) struct IfReq {
    pub name: [libc::c_char; libc::IFNAMSIZ],
    pub data: IfReqData,
}

#[repr(C)]
pub(crate) union IfReqData {
    pub hwaddr: libc::sockaddr,
    pub data: *mut libc::c_void,
    _pad: [u8; 24],
}

impl IfReq {
    /// Zeroed request naming `interface`
    pub fn new(interface: &str) -> io::Result<Self> {
        let bytes = interface.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {:?}", interface),
            ));
        }

        let mut ifr = IfReq {
            name: [0; libc::IFNAMSIZ],
            data: IfReqData { _pad: [0; 24] },
        };
        for (dst, src) in ifr.name.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(ifr)
    }
}

/// Raw Ethernet socket bound to one interface
pub struct PacketSocket {
    fd: OwnedFd,
    interface: String,
    mac: MacAddr,
}

impl PacketSocket {
    /// Open and bind a raw socket
    ///
    /// # Arguments
    ///
    /// * `interface` - Network device name
    /// * `protocol` - Ethertype to capture (host byte order)
    ///
    /// # Returns
    ///
    /// Socket bound to the interface, with its MAC resolved
    pub fn open(interface: &str, protocol: u16) -> Result<Self> {
        info!("Opening packet socket on {}...", interface);

        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol.to_be() as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error())
                .context("Failed to create AF_PACKET socket (needs CAP_NET_RAW)");
        }
        // SAFETY: raw is a freshly created socket owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let name = CString::new(interface).context("Interface name contains NUL")?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Unknown interface: {}", interface));
        }

        let mac = hardware_address(fd.as_raw_fd(), interface)
            .with_context(|| format!("Failed to read MAC address of {}", interface))?;

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = protocol.to_be();
        sll.sll_ifindex = ifindex as i32;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to bind to {}", interface));
        }

        info!(
            "   Bound to {} (index {}, MAC {})",
            interface,
            ifindex,
            format_mac(&mac)
        );

        Ok(Self {
            fd,
            interface: interface.to_string(),
            mac,
        })
    }

    /// Turn on NIC timestamping for this socket's interface
    ///
    /// # Arguments
    ///
    /// * `rx_filter` - `HWTSTAMP_FILTER_*` value for the NIC receive path
    pub fn configure_hardware_timestamping(&self, rx_filter: i32) -> Result<()> {
        hwts::configure_interface(self.fd.as_raw_fd(), &self.interface, rx_filter).with_context(
            || format!("Failed to configure hardware timestamping on {}", self.interface),
        )?;

        info!("   Hardware timestamping on (rx filter {})", rx_filter);
        Ok(())
    }

    /// Request kernel timestamps on sent and received frames
    pub fn enable_kernel_timestamping(&self) -> Result<()> {
        hwts::enable_timestamping(self.fd.as_raw_fd(), hwts::TIMESTAMPING_FLAGS)
            .context("Failed to enable SO_TIMESTAMPING")?;

        info!("   SO_TIMESTAMPING enabled");
        Ok(())
    }

    /// Set `SO_PRIORITY` for outgoing frames
    pub fn set_priority(&self, priority: i32) -> Result<()> {
        self.set_option(libc::SO_PRIORITY, &priority)
            .with_context(|| format!("Failed to set socket priority {}", priority))
    }

    /// Bound blocking reads so the receive loop can notice shutdown
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        self.set_option(libc::SO_RCVTIMEO, &tv)
            .context("Failed to set receive timeout")
    }

    fn set_option<T>(&self, name: libc::c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `recvmsg` with a control buffer; returns (data len, control len)
    fn recv_with_control(
        &self,
        buf: &mut [u8],
        control: &mut [u8],
        flags: libc::c_int,
    ) -> io::Result<Option<(usize, usize)>> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, flags) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            };
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            debug!("control data truncated");
        }

        Ok(Some((n as usize, (msg.msg_controllen as usize).min(control.len()))))
    }
}

impl AsRawFd for PacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FrameSink for PacketSocket {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {} of {} bytes", n, frame.len()),
            ));
        }
        Ok(())
    }

    fn drain_tx_timestamps(&mut self) -> TxCompletions {
        let mut completions = TxCompletions::default();
        let mut data = [0u8; 2048];
        let mut control = [0u8; CONTROL_LEN];

        for _ in 0..MAX_COMPLETIONS_PER_DRAIN {
            match self.recv_with_control(
                &mut data,
                &mut control,
                libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
            ) {
                Ok(Some((_, control_len))) => {
                    if let Some(completion) = hwts::parse_tx_completion(&control[..control_len]) {
                        completions.push(completion);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read error queue: {}", e);
                    break;
                }
            }
        }

        completions
    }

    fn source_address(&self) -> MacAddr {
        self.mac
    }
}

impl FrameSource for PacketSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Received>> {
        let mut control = [0u8; CONTROL_LEN];
        let Some((len, control_len)) = self.recv_with_control(buf, &mut control, 0)? else {
            return Ok(None);
        };

        Ok(Some(Received {
            len,
            rx: hwts::extract_rx_timestamps(&control[..control_len]),
        }))
    }

    fn local_address(&self) -> MacAddr {
        self.mac
    }
}

fn hardware_address(fd: RawFd, interface: &str) -> io::Result<MacAddr> {
    let mut ifr = IfReq::new(interface)?;

    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut ifr as *mut IfReq) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: SIOCGIFHWADDR fills the hwaddr member.
    let sa_data = unsafe { ifr.data.hwaddr.sa_data };
    let mut mac = [0u8; ETHER_ADDR_LEN];
    for (dst, src) in mac.iter_mut().zip(sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(mac)
}

/// Render a MAC as `aa:bb:cc:dd:ee:ff`
pub fn format_mac(mac: &MacAddr) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
