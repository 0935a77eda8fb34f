//! Tick counting.
//!
//! The stack has no notion of wall-clock time: every timer is driven by a
//! coarse tick (~262 ms in the reference hardware) supplied by the caller
//! through [`crate::clock::Clock`]. `Ticks` wraps the 16-bit counter
//! arithmetic this implies so the rest of the crate never touches a raw
//! `u16` directly.

use core::ops::{Add, AddAssign};

/// A count of ticks, wrapping at 16 bits like the hardware counter it
/// mirrors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticks(pub u16);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    pub const fn new(ticks: u16) -> Ticks {
        Ticks(ticks)
    }

    /// `true` if this counter has advanced past `threshold`.
    pub const fn exceeds(self, threshold: Ticks) -> bool {
        self.0 > threshold.0
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Ticks {
    fn add_assign(&mut self, rhs: Ticks) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeds_is_strict() {
        assert!(!Ticks::new(5).exceeds(Ticks::new(5)));
        assert!(Ticks::new(6).exceeds(Ticks::new(5)));
    }

    #[test]
    fn add_wraps() {
        assert_eq!(Ticks::new(u16::MAX) + Ticks::new(1), Ticks::new(0));
    }
}
