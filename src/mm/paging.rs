//! Page Table Types
//!
//! Two-level page tables for 4 KiB pages in a 32-bit user address space.
//!
//! # Page Table Structure
//! - Directory: 1024 entries, each covers 4 MiB
//! - Table: 1024 entries, each covers 4 KiB
//!
//! # Security Properties
//! - Permission bits are strictly typed; raw bit positions never leave `mm`
//! - Only the syscall-settable subset can be requested by user code
//! - Copy-on-write and writable are kept mutually exclusive by the
//!   fork library, never by hand-editing entries

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{PhysAddr, ENTRIES_PER_TABLE, PAGE_MASK};

bitflags! {
    /// Page table entry permission bits.
    ///
    /// Every bit defined here is settable through a syscall; any other bit
    /// in a caller-supplied permission word is rejected.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct PteFlags: u32 {
        /// Entry maps a page.
        const PRESENT = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is reachable from user mode.
        const USER = 1 << 2;
        /// Available bit with no kernel meaning.
        const AVAIL = 1 << 9;
        /// Always-share marker: never copy-on-write this page.
        const SHARE = 1 << 10;
        /// Copy-on-write marker.
        const COW = 1 << 11;
    }
}

impl PteFlags {
    /// Bits a user mapping must always carry.
    pub const MANDATORY: Self = Self::PRESENT.union(Self::USER);

    /// Plain private read/write user page.
    pub const USER_RW: Self = Self::MANDATORY.union(Self::WRITABLE);

    /// Validate a raw permission word supplied by user code.
    ///
    /// Returns `None` when a mandatory bit is missing or a bit outside the
    /// syscall-settable subset is present.
    pub fn from_syscall(perm: u32) -> Option<Self> {
        let flags = Self::from_bits(perm)?;
        if flags.contains(Self::MANDATORY) {
            Some(flags)
        } else {
            None
        }
    }

    /// The same permission with write access removed and the copy-on-write
    /// marker added.
    #[inline]
    pub const fn as_cow(self) -> Self {
        self.difference(Self::WRITABLE).union(Self::COW)
    }
}

/// A single second-level page table entry.
///
/// Frame address in bits [31:12], permission bits below.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    const ADDR_MASK: u32 = !(PAGE_MASK as u32);

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Create a page entry mapping a physical frame.
    #[inline]
    pub const fn page(phys: PhysAddr, flags: PteFlags) -> Self {
        debug_assert!(phys.is_aligned());
        Self((phys.as_u32() & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & Self::ADDR_MASK)
    }

    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.flags().contains(PteFlags::USER)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    #[inline]
    pub const fn is_cow(self) -> bool {
        self.flags().contains(PteFlags::COW)
    }

    #[inline]
    pub const fn is_shared(self) -> bool {
        self.flags().contains(PteFlags::SHARE)
    }

    /// Whether user code may perform the access this entry is asked for.
    #[inline]
    pub const fn permits(self, required: PteFlags) -> bool {
        self.flags().contains(required.union(PteFlags::MANDATORY))
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE(frame={}, flags={:?})", self.frame(), self.flags())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// One second-level table: exactly one page of entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all present entries with their indices.
    pub fn iter_present(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is not mapped.
    NotMapped,
    /// No physical frames available for the page or its page table.
    OutOfMemory,
    /// The address is not properly aligned or outside user space.
    BadAddress,
    /// Permission word has the wrong shape or escalates access.
    InvalidPermissions,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::BadAddress => write!(f, "address misaligned or above user ceiling"),
            Self::InvalidPermissions => write!(f, "invalid permission combination"),
        }
    }
}
