//! Time-slice scheduling
//!
//! The pacer wakes on interval boundaries aligned to the wall clock. Waiting
//! happens in two phases: a coarse sleep on an absolute `CLOCK_REALTIME`
//! timerfd up to `TIME_BEFORE_NS` before the deadline, then a busy-poll on
//! `clock_gettime` until the deadline has passed.

use log::warn;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use txrx_common::{Timestamp, NSEC_PER_SEC, TIME_BEFORE_NS};

/// Read `CLOCK_REALTIME`
///
/// Returns [`Timestamp::UNSET`] if the clock cannot be read.
pub fn now() -> Timestamp {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    if ret != 0 {
        warn!("clock_gettime failed: {}", io::Error::last_os_error());
        return Timestamp::UNSET;
    }
    Timestamp::new(ts.tv_sec as i64, ts.tv_nsec as u32)
}

/// Next slice boundary strictly after `now`
///
/// Boundaries never cross a second: an interval that would spill into the
/// next second lands on the start of that second instead. `interval_ns`
/// must be positive.
pub fn next_slice(now: Timestamp, interval_ns: i64) -> Timestamp {
    let nsec = now.nsec as i64;
    if nsec + interval_ns >= NSEC_PER_SEC {
        return Timestamp::new(now.sec + 1, 0);
    }

    let slot = nsec / interval_ns + 1;
    Timestamp::from_nanos(now.sec as i128 * NSEC_PER_SEC as i128 + (slot * interval_ns) as i128)
}

/// When to end the coarse sleep, if sleeping is worthwhile at all
///
/// Returns `adjusted - margin_ns` when more than `margin_ns` remains.
pub fn coarse_deadline(now: Timestamp, adjusted: Timestamp, margin_ns: i64) -> Option<Timestamp> {
    let remaining = (adjusted - now).as_nanos();
    if remaining > margin_ns {
        Some(adjusted.add_nanos(-margin_ns))
    } else {
        None
    }
}

/// Result of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceWait {
    /// Slice boundary (T0)
    pub interval_start: Timestamp,
    /// Boundary shifted by the configured offset
    pub target: Timestamp,
    /// Clock reading once the spin ended
    pub wakeup: Timestamp,
}

/// Hybrid sleeper owning the coarse-phase timer
pub struct TimeSlicer {
    timer: Option<OwnedFd>,
}

impl TimeSlicer {
    /// Create the slicer; without a timerfd it degrades to spin-only waiting
    pub fn new() -> Self {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_REALTIME, libc::TFD_CLOEXEC) };
        let timer = if fd < 0 {
            warn!(
                "timerfd_create failed, falling back to busy-poll: {}",
                io::Error::last_os_error()
            );
            None
        } else {
            // SAFETY: fd was just returned by timerfd_create and is owned here.
            Some(unsafe { OwnedFd::from_raw_fd(fd) })
        };

        Self { timer }
    }

    /// Block until the next boundary of `interval_ns` plus `offset_usec`
    pub fn wait_for_next_slice(&mut self, interval_ns: i64, offset_usec: u32) -> SliceWait {
        let start = now();
        let interval_start = next_slice(start, interval_ns);
        let target = interval_start.add_nanos(offset_usec as i64 * 1000);

        if let Some(deadline) = coarse_deadline(start, target, TIME_BEFORE_NS) {
            if let Err(e) = self.sleep_until(deadline) {
                warn!("coarse sleep failed, spinning instead: {}", e);
            }
        }

        let wakeup = spin_until(target);
        SliceWait {
            interval_start,
            target,
            wakeup,
        }
    }

    fn sleep_until(&mut self, deadline: Timestamp) -> io::Result<()> {
        let Some(timer) = &self.timer else {
            return Ok(());
        };
        let fd = timer.as_raw_fd();

        // One-shot: it_interval stays zero
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = deadline.sec as libc::time_t;
        spec.it_value.tv_nsec = deadline.nsec as _;

        let ret = unsafe {
            libc::timerfd_settime(fd, libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut())
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut expirations = [0u8; 8];
        let n = unsafe { libc::read(fd, expirations.as_mut_ptr() as *mut libc::c_void, 8) };
        if n != 8 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Default for TimeSlicer {
    fn default() -> Self {
        Self::new()
    }
}

fn spin_until(target: Timestamp) -> Timestamp {
    loop {
        let t = now();
        if t.is_unset() || t >= target {
            return t;
        }
        std::hint::spin_loop();
    }
}
