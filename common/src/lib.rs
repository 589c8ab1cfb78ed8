//! Shared types and utilities for the latency pacer
//!
//! This crate provides the timestamp arithmetic, frame model and constants
//! shared between the pacing (transmit) side and the receive side.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod time;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use time::{diff, TimeDelta, Timestamp};
pub use types::{parse_mac, EtherHeader, FrameFlags, MacAddr, TestFrame, TimestampSlot, BROADCAST_ADDR};
