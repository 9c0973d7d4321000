//! Monotonic timeouts built on the TSC.
//!
//! Every hardware handshake in the EHCI driver (controller reset, async
//! advance, port reset) and every step of the enumeration state machine is
//! bounded by a [`Timeout`]. There is no RTOS tick source on this target, so
//! we fall back to the time-stamp counter with a fixed, conservatively high
//! assumed frequency; see [`ASSUMED_TSC_KHZ`] for why no calibration against
//! a PIT/HPET reference is attempted.

use crate::arch::x86_64::rdtsc;

/// Assumed TSC frequency in ticks per millisecond.
///
/// Chosen as a conservatively *high* upper bound (5 GHz, above any shipping
/// x86_64 part) so that the tick count needed to reach a given millisecond
/// deadline is never undercounted: on real hardware, whose TSC always runs
/// at or below this assumption, the same tick count takes at least as long
/// to accumulate, so a timeout never fires before its requested duration has
/// actually elapsed. It may fire later than requested on slower hardware,
/// which is always safe for a timeout.
const ASSUMED_TSC_KHZ: u64 = 5_000_000;

/// A deadline expressed as an absolute TSC tick count.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    deadline: u64,
}

impl Timeout {
    /// Construct a timeout expiring `ms` milliseconds from now.
    pub fn from_ms(ms: u64) -> Self {
        let now = rdtsc();
        let ticks = ms.saturating_mul(ASSUMED_TSC_KHZ);
        Timeout {
            deadline: now.saturating_add(ticks),
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        rdtsc() >= self.deadline
    }
}

/// Busy-wait for approximately `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    let timeout = Timeout::from_ms(ms);
    while !timeout.is_expired() {
        core::hint::spin_loop();
    }
}

/// Poll `condition` until it returns `true` or `timeout` expires.
///
/// Returns `true` if the condition became true before the timeout.
pub fn wait_until(timeout: Timeout, mut condition: impl FnMut() -> bool) -> bool {
    loop {
        if condition() {
            return true;
        }
        if timeout.is_expired() {
            return condition();
        }
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ms_timeout_is_immediately_expired() {
        let timeout = Timeout::from_ms(0);
        assert!(timeout.is_expired());
    }

    #[test]
    fn nonzero_timeout_is_not_expired_right_away() {
        let timeout = Timeout::from_ms(1000);
        assert!(!timeout.is_expired());
    }

    #[test]
    fn from_ms_does_not_overflow_on_large_durations() {
        // Guards the saturating arithmetic in `Timeout::from_ms`/`deadline`:
        // a naive multiply would wrap and produce a deadline in the past.
        let timeout = Timeout::from_ms(u64::MAX);
        assert!(!timeout.is_expired());
    }

    #[test]
    fn wait_until_returns_true_as_soon_as_condition_holds() {
        let timeout = Timeout::from_ms(1000);
        let mut calls = 0;
        let result = wait_until(timeout, || {
            calls += 1;
            calls >= 3
        });
        assert!(result);
        assert_eq!(calls, 3);
    }

    #[test]
    fn wait_until_gives_up_after_the_timeout_expires() {
        let timeout = Timeout::from_ms(0);
        let result = wait_until(timeout, || false);
        assert!(!result);
    }
}
