//! Fail-location word layout
//!
//! The low 20 bits of `fail_loc` hold the fail ID. The high bits select
//! how the ID is evaluated and record whether it has already fired.

use std::fmt;

/// Bits of `fail_loc` that identify the failpoint.
pub const MASK_LOC: u64 = 0x000F_FFFF;

/// Subsystem bits within the fail ID.
pub const MASK_SYS: u64 = 0x0000_FF00;

/// Fail `fail_val` times, or once when combined with [`ONCE`].
pub const SOME: u64 = 0x1000_0000;

/// Skip the first `fail_val` hits, then fail.
pub const SKIP: u64 = 0x2000_0000;

/// Fail with probability `1 / fail_val`.
pub const RAND: u64 = 0x0800_0000;

/// Spare mode bit for ad-hoc user semantics.
pub const USR1: u64 = 0x0400_0000;

pub const FAILED_BIT: u32 = 30;
pub const ONCE_BIT: u32 = 31;

/// Set once a failpoint has fired.
pub const FAILED: u64 = 1 << FAILED_BIT;

/// Only one caller may ever take the failure branch.
pub const ONCE: u64 = 1 << ONCE_BIT;

/// `fail_val` wildcard accepted by [`SetMode::Value`].
pub const VAL_ANY: u32 = u32::MAX;

/// What a firing failpoint does to `fail_loc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Leave `fail_loc` untouched.
    NoSet,
    /// Or the mode bits of the value into `fail_loc`.
    OrSet,
    /// Replace `fail_loc` with the value and reset the counter.
    Reset,
    /// Only fire when `fail_val` equals the value (or is the wildcard).
    Value,
}

/// Snapshot of a `fail_loc` word, printed the way operators type it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailLoc(pub u64);

impl FailLoc {
    pub fn id(self) -> u32 {
        (self.0 & MASK_LOC) as u32
    }

    pub fn is_active(self) -> bool {
        self.0 != 0
    }

    pub fn has(self, bits: u64) -> bool {
        self.0 & bits == bits
    }

    /// True when this word arms the failpoint `id`.
    pub fn matches(self, id: u32) -> bool {
        self.is_active() && (self.0 & MASK_LOC) == (u64::from(id) & MASK_LOC)
    }
}

impl fmt::Display for FailLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits_do_not_overlap_id() {
        for bit in [SOME, SKIP, RAND, USR1, FAILED, ONCE] {
            assert_eq!(bit & MASK_LOC, 0);
        }
        assert_eq!(MASK_SYS & !MASK_LOC, 0);
    }

    #[test]
    fn test_fail_loc_matches_ignores_mode_bits() {
        let loc = FailLoc(0x0e01 | ONCE | FAILED);
        assert!(loc.matches(0x0e01));
        assert!(!loc.matches(0x0e02));
        assert!(loc.has(ONCE | FAILED));
        assert_eq!(loc.id(), 0x0e01);
        assert!(!FailLoc(0).matches(0));
        assert_eq!(loc.to_string(), "0xc0000e01");
    }
}
