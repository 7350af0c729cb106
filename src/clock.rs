//! Monotonic timestamp capture.
//!
//! Each side of the connection samples its own [`Clock`]; the two clock
//! domains are never compared directly. All latency math uses differences
//! within one domain plus the round-trip symmetry assumption.

use std::time::{Duration, Instant};

/// Microseconds elapsed since a [`Clock`]'s origin.
///
/// This is the unit carried in probe frames: sub-millisecond resolution,
/// non-decreasing within one process lifetime, meaningless across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Micros(pub u64);

impl Micros {
    /// Elapsed time since `earlier`, saturating to zero if `earlier` is
    /// actually later (same-domain timestamps never are).
    pub fn saturating_since(self, earlier: Micros) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

/// A monotonic clock anchored at its creation instant.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
        }
    }

    /// Current time in this clock's domain.
    pub fn now(&self) -> Micros {
        Micros(self.origin.elapsed().as_micros() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_decreasing() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn saturating_since_orders() {
        let a = Micros(1_000);
        let b = Micros(3_500);
        assert_eq!(b.saturating_since(a), Duration::from_micros(2_500));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn sub_millisecond_resolution() {
        let clock = Clock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_micros(300));
        let t2 = clock.now();
        // a 300us sleep must be visible, which a millisecond clock would miss
        assert!(t2.0 > t1.0);
    }
}
