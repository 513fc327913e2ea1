//! Low-resolution access clock.
//!
//! Access times are stored as 16-bit ticks that wrap around, so all
//! comparisons go through [`tick_delta`].

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

/// Source of access ticks.
pub trait TickClock: Send + Sync {
    fn now(&self) -> u16;
}

/// Elapsed ticks from `earlier` to `now`, modulo 2^16.
#[inline]
pub fn tick_delta(now: u16, earlier: u16) -> u16 {
    now.wrapping_sub(earlier)
}

/// Seconds since the clock was created, truncated to 16 bits.
#[derive(Debug, Clone)]
pub struct LruClock {
    origin: Instant,
}

impl LruClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for LruClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for LruClock {
    fn now(&self) -> u16 {
        (self.origin.elapsed().as_secs() & 0xFFFF) as u16
    }
}

/// Clock advanced explicitly, for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    tick: AtomicU16,
}

impl ManualClock {
    pub fn new(start: u16) -> Self {
        Self {
            tick: AtomicU16::new(start),
        }
    }

    /// Moves the clock forward by `ticks`, wrapping at 2^16.
    pub fn advance(&self, ticks: u16) {
        // fetch_add wraps on overflow
        self.tick.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn set(&self, tick: u16) {
        self.tick.store(tick, Ordering::Relaxed);
    }
}

impl TickClock for ManualClock {
    fn now(&self) -> u16 {
        self.tick.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_delta_wraps() {
        assert_eq!(tick_delta(10, 5), 5);
        assert_eq!(tick_delta(3, 65530), 9);
        assert_eq!(tick_delta(7, 7), 0);
    }

    #[test]
    fn test_manual_clock_wraps() {
        let clock = ManualClock::new(65535);
        clock.advance(2);
        assert_eq!(clock.now(), 1);
    }

    #[test]
    fn test_lru_clock_starts_near_zero() {
        assert!(LruClock::new().now() < 5);
    }
}
