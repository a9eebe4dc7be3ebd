use std::sync::OnceLock;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::Duration;

/// A fixed point captured once per process via `quanta::Instant::now()`, which is
/// calibrated against the TSC frequency. Every `Instant::now()` reports nanoseconds
/// elapsed since this point, so `self.0` is genuinely nanosecond-scale and safe to
/// mix with a `Duration` built from wall-clock units (`from_secs`, `from_millis`,
/// ...). Reading `quanta::Clock::raw()` directly, as the source's rdtscp-based
/// clock does, would instead yield raw uncalibrated counter ticks.
fn epoch() -> &'static quanta::Instant {
    static EPOCH: OnceLock<quanta::Instant> = OnceLock::new();
    EPOCH.get_or_init(quanta::Instant::now)
}

/// A monotonic timestamp, unrelated to wall-clock time. Only comparable to other
/// `Instant`s taken from the same process.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[repr(C)]
pub struct Instant(pub u64);

impl Instant {
    pub const MAX: Self = Self(u64::MAX);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn now() -> Self {
        Instant(epoch().elapsed().as_nanos() as u64)
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        let curt = Instant::now();
        curt.saturating_sub(*self)
    }

    #[inline]
    pub fn elapsed_since(&self, since: Instant) -> Duration {
        self.saturating_sub(since)
    }

    #[inline]
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sub for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_nonnegative() {
        let t0 = Instant::now();
        assert!(t0.elapsed() >= Duration::ZERO);
    }

    #[test]
    fn saturating_sub_never_underflows() {
        let early = Instant(10);
        let late = Instant(5);
        assert_eq!(early.saturating_sub(late), Duration::from_nanos(5));
        assert_eq!(late.saturating_sub(early), Duration::ZERO);
    }
}
