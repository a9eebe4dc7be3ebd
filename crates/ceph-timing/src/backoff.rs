use crate::Duration;

/// Exponential backoff bounded to `[base, max]`, doubling on every failure and
/// resetting to `base` the moment a connection succeeds.
///
/// Defaults mirror the `BASE_DELAY_INTERVAL` / `MAX_DELAY_INTERVAL` constants used to
/// pace reconnects in the messenger: half a second at the floor, five minutes at the
/// ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX: Duration = Duration::from_secs(300);

    pub fn new(base: Duration, max: Duration) -> Self {
        debug_assert!(base <= max, "backoff base must not exceed max");
        Self { base, max, current: base }
    }

    /// Current delay to wait before the next attempt, without advancing state.
    #[inline]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the delay (saturating at `max`) and returns the delay that should have
    /// been waited for the attempt that just failed.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::from_nanos(self.current.0.saturating_mul(2)).min(self.max);
        delay
    }

    /// Resets to `base`; call this after a connection attempt succeeds.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps_at_max() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.current(), Backoff::DEFAULT_BASE);
    }
}
