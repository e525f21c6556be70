//! Readiness flags delivered with every event.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Small readiness bitset: readable, writable, error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const EMPTY: Flags = Flags(0);
    pub const READABLE: Flags = Flags(1);
    pub const WRITABLE: Flags = Flags(2);
    pub const INOUT: Flags = Flags(3);
    pub const ERROR: Flags = Flags(4);

    /// Containment test.
    ///
    /// Any flags value contains each of its bits, but `EMPTY` is only
    /// contained by `EMPTY` itself.
    pub fn contains(self, other: Flags) -> bool {
        if other.0 == 0 {
            return self.0 == 0;
        }
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("[empty]");
        }
        if self.contains(Flags::READABLE) {
            f.write_str("[in]")?;
        }
        if self.contains(Flags::WRITABLE) {
            f.write_str("[out]")?;
        }
        if self.contains(Flags::ERROR) {
            f.write_str("[error]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment() {
        let inout = Flags::READABLE | Flags::WRITABLE;
        assert_eq!(inout, Flags::INOUT);
        assert!(inout.contains(Flags::READABLE));
        assert!(inout.contains(Flags::WRITABLE));
        assert!(inout.contains(Flags::INOUT));
        assert!(!inout.contains(Flags::ERROR));
        assert!(!Flags::READABLE.contains(Flags::INOUT));
    }

    #[test]
    fn test_empty_only_matches_empty() {
        assert!(Flags::EMPTY.contains(Flags::EMPTY));
        assert!(!Flags::READABLE.contains(Flags::EMPTY));
        assert!(!Flags::EMPTY.contains(Flags::READABLE));
    }

    #[test]
    fn test_display() {
        assert_eq!(Flags::EMPTY.to_string(), "[empty]");
        assert_eq!(Flags::INOUT.to_string(), "[in][out]");
        let mut flags = Flags::ERROR;
        flags |= Flags::READABLE;
        assert_eq!(flags.to_string(), "[in][error]");
        assert_eq!((flags & Flags::ERROR).bits(), 4);
    }
}
