//! The capability general-purpose register file, unallocated.

use core::fmt;
use std::fmt::Formatter;

use crate::capability::Capability;

/// The number of `c` registers available (indices start at `0` for `c0`).
pub const LEN: u8 = 32;

/// A CHERIoT core's 32 capability general purpose registers, `c0` through `c31`.
///
/// Register `c0` (aka `cnull`) always reads as the null capability; writes to it are ignored.
/// The integer register file (`x0`..`x31`, see [`crate::registers::Registers`]) aliases the
/// same storage: reading `xN` reads `cN`'s address, writing `xN` replaces `cN` with an untagged
/// capability holding that address, clearing its tag, bounds and permissions.
///
/// It is not possible to get a mutable reference to a `c` register, since that would allow
/// unchecked writes to register `c0`.
#[derive(Debug, Clone)]
pub struct CapRegisters {
    c_registers: [Capability; LEN as usize],
}

impl Default for CapRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl CapRegisters {
    /// Returns a fresh register file with every register holding the null capability.
    pub fn new() -> Self {
        Self {
            c_registers: [Capability::null(); LEN as usize],
        }
    }

    /// Returns the value of a `c` register.
    pub fn c(&self, specifier: Specifier) -> Capability {
        self.c_registers[usize::from(specifier)]
    }

    /// Sets the value of a `c` register. Writes to register `c0` are ignored.
    pub fn set_c(&mut self, specifier: Specifier, value: Capability) {
        self.replace_c(specifier, value);
    }

    /// Replaces the value of a `c` register, returning its old value. Writes to register `c0`
    /// are ignored.
    pub fn replace_c(&mut self, specifier: Specifier, value: Capability) -> Capability {
        if specifier.0 == 0 {
            Capability::null()
        } else {
            std::mem::replace(&mut self.c_registers[specifier.0 as usize], value)
        }
    }

    /// Reads a `c` register's address component, as the plain-integer view (`xN`) of this file.
    pub fn x(&self, specifier: Specifier) -> u32 {
        self.c(specifier).address()
    }

    /// Writes a plain integer into the address component of a `c` register, clearing its tag,
    /// bounds, and permissions as CHERIoT's "integer write to capability register" rule
    /// requires.
    pub fn set_x(&mut self, specifier: Specifier, value: u32) {
        if specifier.0 == 0 {
            return;
        }
        let mut null = Capability::null();
        null.set_address(value);
        self.set_c(specifier, null);
    }
}

/// A `c` register specifier. Can take values in the range `0..LEN`. Identical in range and
/// encoding to [`crate::registers::Specifier`]; kept distinct so the two register files cannot
/// be confused at the type level.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Specifier(u8);

impl Specifier {
    /// Register `c0`, a.k.a. `cnull`, always reads as the null capability and ignores writes.
    pub const C0: Self = Specifier(0);
    /// Return-address / link register (`cra`).
    pub const CRA: Self = Specifier(1);
    /// Stack pointer (`csp`).
    pub const CSP: Self = Specifier(2);

    /// Create a register specifier from its index, returning `None` if `index > 31`.
    pub fn new<U: TryInto<u8>>(index: U) -> Option<Self> {
        let index = index.try_into().ok()?;
        (index < 32).then_some(Self(index))
    }

    /// Convert a 5-bit value into a register specifier.
    /// Panics if the value doesn't fit in 5 bits (`0..=31`).
    pub fn from_u5(value_u5: u8) -> Self {
        const_assert_eq!(LEN, 32);
        if value_u5 > 31 {
            panic!("out of range u5 used");
        }
        Self(value_u5)
    }

    /// Return an iterator over all register specifiers, starting at c0 up to c31.
    pub fn iter_all() -> impl Iterator<Item = Self> {
        (0..32).map(Self)
    }
}

impl From<Specifier> for u8 {
    fn from(value: Specifier) -> Self {
        value.0
    }
}

impl From<Specifier> for u32 {
    fn from(value: Specifier) -> Self {
        value.0 as u32
    }
}

impl From<Specifier> for usize {
    fn from(value: Specifier) -> Self {
        value.0 as usize
    }
}

impl From<crate::registers::Specifier> for Specifier {
    fn from(value: crate::registers::Specifier) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_to_zero_is_ignored() {
        let mut regs = CapRegisters::new();
        assert!(!regs.c(Specifier::C0).tag());
        regs.set_c(Specifier::C0, Capability::memory_root());
        assert!(!regs.c(Specifier::C0).tag());
    }

    #[test]
    fn set_and_get_roundtrip() {
        let mut regs = CapRegisters::new();
        let mut cap = Capability::memory_root();
        cap.set_address(0x1234);
        regs.set_c(Specifier::from_u5(5), cap);
        assert_eq!(0x1234, regs.c(Specifier::from_u5(5)).address());
        assert!(regs.c(Specifier::from_u5(5)).tag());
    }

    #[test]
    fn integer_write_clears_tag() {
        let mut regs = CapRegisters::new();
        regs.set_c(Specifier::from_u5(5), Capability::memory_root());
        regs.set_x(Specifier::from_u5(5), 0xDEAD);
        let cap = regs.c(Specifier::from_u5(5));
        assert!(!cap.tag());
        assert_eq!(0xDEAD, cap.address());
    }

    #[test]
    fn all_registers_start_null() {
        for s in Specifier::iter_all() {
            let c = CapRegisters::new().c(s);
            assert!(!c.tag());
            assert_eq!(0, c.address());
        }
    }
}
