//! Rollover-correct arithmetic over (seconds, nanoseconds) timestamps
//!
//! [`Timestamp`] is always normalized (`0 <= nsec < 1e9`). Subtracting two
//! timestamps yields a [`TimeDelta`] whose two components share the sign of
//! the total, so `|nsec|` is the sub-second magnitude of the difference.

use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, Sub};

use crate::constants::NSEC_PER_SEC;

const NSEC: i128 = NSEC_PER_SEC as i128;

/// A point in time as seconds and nanoseconds since the Unix epoch
///
/// The all-zero value is reserved for "not recorded" and is reported by
/// [`Timestamp::is_unset`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Seconds since the Unix epoch
    pub sec: i64,
    /// Nanoseconds within the second
    pub nsec: u32,
}

impl Timestamp {
    /// Marker for a slot that was never populated
    pub const UNSET: Timestamp = Timestamp { sec: 0, nsec: 0 };

    /// Build a timestamp, carrying whole seconds out of `nsec`
    pub fn new(sec: i64, nsec: u32) -> Self {
        let carry = (nsec as i64) / NSEC_PER_SEC;
        Self {
            sec: sec + carry,
            nsec: (nsec as i64 % NSEC_PER_SEC) as u32,
        }
    }

    /// Build a timestamp from a total nanosecond count
    pub fn from_nanos(total: i128) -> Self {
        Self {
            sec: total.div_euclid(NSEC) as i64,
            nsec: total.rem_euclid(NSEC) as u32,
        }
    }

    /// True when the slot holding this value was never populated
    pub fn is_unset(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// Total nanoseconds since the epoch
    pub fn as_nanos(&self) -> i128 {
        self.sec as i128 * NSEC + self.nsec as i128
    }

    /// Return `later - self`
    pub fn diff(self, later: Timestamp) -> TimeDelta {
        diff(self, later)
    }

    /// Shift by a signed number of nanoseconds
    pub fn add_nanos(self, nanos: i64) -> Timestamp {
        Timestamp::from_nanos(self.as_nanos() + nanos as i128)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Signed difference between two timestamps
///
/// Both fields carry the sign of the total and `|nsec| < 1e9`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TimeDelta {
    /// Whole seconds
    pub sec: i64,
    /// Remaining nanoseconds, same sign as `sec` when both are non-zero
    pub nsec: i32,
}

impl TimeDelta {
    pub const ZERO: TimeDelta = TimeDelta { sec: 0, nsec: 0 };

    /// Build a delta from a signed nanosecond count
    pub fn from_nanos(total: i64) -> Self {
        Self {
            sec: total / NSEC_PER_SEC,
            nsec: (total % NSEC_PER_SEC) as i32,
        }
    }

    /// Total signed nanoseconds (saturating on overflow)
    pub fn as_nanos(&self) -> i64 {
        self.sec
            .saturating_mul(NSEC_PER_SEC)
            .saturating_add(self.nsec as i64)
    }

    /// Magnitude in nanoseconds
    pub fn abs_nanos(&self) -> u64 {
        self.as_nanos().unsigned_abs()
    }

    pub fn is_negative(&self) -> bool {
        self.sec < 0 || self.nsec < 0
    }
}

impl PartialOrd for TimeDelta {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeDelta {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_nanos().cmp(&other.as_nanos())
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        write!(
            f,
            "{}{}.{:09}",
            sign,
            self.sec.unsigned_abs(),
            self.nsec.unsigned_abs()
        )
    }
}

/// Compute `b - a`, exact across any number of second boundaries
pub fn diff(a: Timestamp, b: Timestamp) -> TimeDelta {
    let total = b.as_nanos() - a.as_nanos();
    TimeDelta {
        sec: (total / NSEC) as i64,
        nsec: (total % NSEC) as i32,
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;

    fn sub(self, rhs: Timestamp) -> TimeDelta {
        diff(rhs, self)
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: TimeDelta) -> Timestamp {
        Timestamp::from_nanos(self.as_nanos() + rhs.sec as i128 * NSEC + rhs.nsec as i128)
    }
}
