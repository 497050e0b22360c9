//! Environment identities
//!
//! An [`EnvId`] names one generation of one slot in the environment table.
//!
//! # Encoding
//! ```text
//!  31  30                      12 11 10 9            0
//! ┌───┬──────────────────────────┬─────┬──────────────┐
//! │ 0 │        generation        │  0  │     slot     │
//! └───┴──────────────────────────┴─────┴──────────────┘
//! ```
//! The value is always positive when read as a signed syscall result, so a
//! returned identity can never be confused with an error code, and is never
//! zero, which syscalls reserve for "the calling environment".

use core::fmt;

/// log2 of the environment table capacity.
pub const LOG2NENV: u32 = 10;
/// Environment table capacity.
pub const NENV: usize = 1 << LOG2NENV;

const GENERATION_SHIFT: u32 = 12;
const GENERATION_STEP: u32 = 1 << GENERATION_SHIFT;
const SLOT_MASK: u32 = (NENV as u32) - 1;

/// Externally visible identity of an environment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Syscall argument meaning "the calling environment".
    pub const SELF: u32 = 0;

    /// Reinterpret a raw identity word.
    ///
    /// The result is not validated; only the resolver can tell whether it
    /// names a live environment.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into the environment table.
    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> GENERATION_SHIFT
    }

    /// Identity for the next occupant of `slot`, given the identity its
    /// previous occupant had (if any).
    pub(crate) const fn next_generation(previous: Option<EnvId>, slot: usize) -> Self {
        let base = match previous {
            Some(prev) => prev.0.wrapping_add(GENERATION_STEP) & !SLOT_MASK,
            None => GENERATION_STEP,
        };
        // Keep the value positive as an i32; restart at the first generation.
        let generation = if base == 0 || base > i32::MAX as u32 {
            GENERATION_STEP
        } else {
            base
        };
        Self(generation | (slot as u32 & SLOT_MASK))
    }
}

impl From<EnvId> for u32 {
    fn from(id: EnvId) -> u32 {
        id.0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_advance_per_slot() {
        let first = EnvId::next_generation(None, 5);
        assert_eq!(first.slot(), 5);
        assert_eq!(first.raw(), 0x1005);

        let second = EnvId::next_generation(Some(first), 5);
        assert_eq!(second.slot(), 5);
        assert_eq!(second.generation(), first.generation() + 1);
        assert_ne!(first, second);
    }

    #[test]
    fn test_generation_stays_positive() {
        let last = EnvId::from_raw(0x7FFF_F000 | 3);
        let wrapped = EnvId::next_generation(Some(last), 3);
        assert!((wrapped.raw() as i32) > 0);
        assert_eq!(wrapped.raw(), 0x1003);
    }
}
