//! Runtime control plane
//!
//! The pacing thread reads its tunables from a [`SharedConfig`] of atomics
//! once per iteration. A Unix-domain listener accepts text commands of the
//! form `key=value`, separated by NUL, newline or end of stream:
//!
//! - `size=<bytes>`: frame size, at least 64
//! - `interval_usec=<usec>`: pacing interval, non-zero
//! - `state=<0|1>`: pause or resume transmission
//!
//! Fields are updated independently; a reader may observe a new interval
//! together with an old size.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use txrx_common::{MAX_FRAME_SIZE, MIN_FRAME_SIZE};

/// Configuration shared between the control plane and the loops
#[derive(Debug)]
pub struct SharedConfig {
    interval_usec: AtomicU32,
    packet_size: AtomicUsize,
    running: AtomicBool,
    shutdown: AtomicBool,
    dump_requested: AtomicBool,
}

impl SharedConfig {
    pub fn new(interval_usec: u32, packet_size: usize) -> Self {
        Self {
            interval_usec: AtomicU32::new(interval_usec),
            packet_size: AtomicUsize::new(packet_size),
            running: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            dump_requested: AtomicBool::new(false),
        }
    }

    pub fn interval_usec(&self) -> u32 {
        self.interval_usec.load(Ordering::Relaxed)
    }

    pub fn set_interval_usec(&self, usec: u32) {
        self.interval_usec.store(usec, Ordering::Relaxed);
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size.load(Ordering::Relaxed)
    }

    pub fn set_packet_size(&self, size: usize) {
        self.packet_size.store(size, Ordering::Relaxed);
    }

    /// False while transmission is paused
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Ask the loop to emit its histogram at the end of the current iteration
    pub fn request_dump(&self) {
        self.dump_requested.store(true, Ordering::Relaxed);
    }

    /// Consume a pending dump request
    pub fn take_dump_request(&self) -> bool {
        self.dump_requested.swap(false, Ordering::Relaxed)
    }

    /// Apply a parsed command; returns true when the configuration changed
    pub fn apply(&self, command: &Command) -> bool {
        match command {
            Command::PacketSize(size) => {
                info!("Control: packet size -> {}", size);
                self.set_packet_size(*size);
                true
            }
            Command::IntervalUsec(usec) => {
                info!("Control: interval -> {} us", usec);
                self.set_interval_usec(*usec);
                true
            }
            Command::State(running) => {
                info!("Control: {}", if *running { "resumed" } else { "paused" });
                self.set_running(*running);
                true
            }
            Command::Rejected(reason) => {
                warn!("Control: {}", reason);
                false
            }
            Command::Unknown(key) => {
                warn!("Control: unknown command '{}'", key);
                false
            }
        }
    }
}

/// One parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PacketSize(usize),
    IntervalUsec(u32),
    State(bool),
    /// Known key with an unacceptable value
    Rejected(String),
    Unknown(String),
}

/// Parse a leading decimal integer; anything unparsable yields 0
fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| acc.saturating_mul(10).saturating_add((d - b'0') as i64));

    if negative {
        -value
    } else {
        value
    }
}

/// Parse one `key=value` command
pub fn parse_command(text: &str) -> Command {
    let text = text.trim();
    let (key, value) = text.split_once('=').unwrap_or((text, ""));
    let value = atoi(value);

    match key {
        "size" => {
            if value < MIN_FRAME_SIZE as i64 {
                Command::Rejected(format!("size must be at least {} ({})", MIN_FRAME_SIZE, value))
            } else if value > MAX_FRAME_SIZE as i64 {
                Command::Rejected(format!("size must be at most {} ({})", MAX_FRAME_SIZE, value))
            } else {
                Command::PacketSize(value as usize)
            }
        }
        "interval_usec" => match u32::try_from(value) {
            Ok(usec) if usec > 0 => Command::IntervalUsec(usec),
            _ => Command::Rejected(format!("interval_usec must be positive ({})", value)),
        },
        "state" => Command::State(value != 0),
        other => Command::Unknown(other.to_string()),
    }
}

/// Bind the control socket, replacing a stale one
pub fn bind(path: &Path) -> Result<UnixListener> {
    bind_listener(path, "control")
}

/// Bind a Unix-domain listener at `path`, removing a stale socket first
pub(crate) fn bind_listener(path: &Path, role: &str) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale {} socket: {:?}", role, path))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {} socket: {:?}", role, path))?;
    info!("Listening for {} clients on {:?}", role, path);
    Ok(listener)
}

/// Accept clients until the task is dropped
pub async fn serve(listener: UnixListener, config: Arc<SharedConfig>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, &config).await {
                        warn!("Control client error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Control socket accept failed: {}", e);
                return;
            }
        }
    }
}

async fn handle_client(stream: UnixStream, config: &SharedConfig) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut message = Vec::new();

    loop {
        message.clear();
        let n = reader.read_until(b'\0', &mut message).await?;
        if n == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&message);
        for line in text.split(['\0', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
            debug!("Control command: {}", line);
            config.apply(&parse_command(line));
        }
    }

    Ok(())
}
