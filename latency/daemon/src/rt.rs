//! Real-time process setup
//!
//! Everything here is best effort: without the needed privileges the tool
//! still runs, only with worse timing. Failures are logged and ignored.

use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};

const CPU_DMA_LATENCY: &str = "/dev/cpu_dma_latency";

/// Switch the calling thread to `SCHED_FIFO` at `priority`
pub fn set_fifo_priority(priority: i32) -> bool {
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;

    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        warn!(
            "Failed to set SCHED_FIFO priority {}: {}",
            priority,
            io::Error::last_os_error()
        );
        return false;
    }

    info!("   Scheduler: SCHED_FIFO priority {}", priority);
    true
}

/// Locks all current and future pages while alive
pub struct MemoryLock {
    locked: bool,
}

impl MemoryLock {
    pub fn acquire() -> Self {
        let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if ret != 0 {
            warn!("mlockall failed: {}", io::Error::last_os_error());
            return Self { locked: false };
        }

        info!("   Memory locked");
        Self { locked: true }
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if self.locked {
            unsafe {
                libc::munlockall();
            }
        }
    }
}

/// Holds `/dev/cpu_dma_latency` open with a zero target
///
/// The kernel keeps CPUs out of deep idle states for as long as the file
/// stays open.
pub struct LatencyTarget {
    _file: Option<File>,
}

impl LatencyTarget {
    pub fn acquire() -> Self {
        match Self::open(0) {
            Ok(file) => {
                info!("   CPU DMA latency target set to 0 us");
                Self { _file: Some(file) }
            }
            Err(e) => {
                warn!("Could not set {}: {}", CPU_DMA_LATENCY, e);
                Self { _file: None }
            }
        }
    }

    fn open(target_usec: i32) -> io::Result<File> {
        let mut file = OpenOptions::new().read(true).write(true).open(CPU_DMA_LATENCY)?;
        file.write_all(&target_usec.to_ne_bytes())?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_priority_is_not_fatal() {
        assert!(!set_fifo_priority(1000));
    }
}
