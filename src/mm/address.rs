//! Physical and Virtual Address Types
//!
//! Type-safe wrappers for memory addresses that prevent mixing
//! physical and virtual addresses at compile time, plus the fixed
//! user address-space layout every environment shares.
//!
//! # User Layout
//! ```text
//!  ULIM       0xEF80_0000  ┬─ kernel-only above
//!  UVPT       0xEF40_0000  │  read-only page-table view
//!  UPAGES     0xEF00_0000  │  read-only page info
//!  UTOP/UENVS 0xEEC0_0000  ┴─ read-only environment records
//!  UXSTACKTOP 0xEEC0_0000  ── one page of user exception stack below
//!             0xEEBF_F000  ── empty guard page
//!  USTACKTOP  0xEEBF_E000  ── normal user stack grows down from here
//!  UTEXT      0x0080_0000  ── program text/data
//!  PFTEMP     0x007F_F000  ── fault-handler scratch page
//!  UTEMP      0x0040_0000  ── scratch region
//! ```

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table (two-level, 4 KiB pages, 32-bit space)
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Bytes mapped by one second-level table
pub const PT_SPAN: usize = ENTRIES_PER_TABLE * PAGE_SIZE;

/// Top of memory the kernel will ever treat as user-visible
pub const ULIM: u32 = 0xEF80_0000;
/// Read-only page-table view
pub const UVPT: u32 = ULIM - PT_SPAN as u32;
/// Read-only physical page info
pub const UPAGES: u32 = UVPT - PT_SPAN as u32;
/// Read-only environment records
pub const UENVS: u32 = UPAGES - PT_SPAN as u32;

/// User address ceiling: no user-installed mapping may reach this address.
pub const UTOP: u32 = UENVS;
/// Top of the one-page user exception stack
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack (one guard page below the exception stack)
pub const USTACKTOP: u32 = UTOP - 2 * PAGE_SIZE as u32;

/// Where program images start
pub const UTEXT: u32 = 0x0080_0000;
/// Scratch region for temporary mappings
pub const UTEMP: u32 = 0x0040_0000;
/// Scratch page used by the copy-on-write fault handler
pub const PFTEMP: u32 = UTEMP + PT_SPAN as u32 - PAGE_SIZE as u32;

/// A physical memory address.
///
/// Physical addresses cannot be dereferenced; frame contents are only
/// reachable through the frame allocator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 as usize & PAGE_MASK == 0
    }

    /// Get the page frame number.
    #[inline]
    pub const fn page_frame_number(self) -> usize {
        self.0 as usize >> PAGE_SHIFT
    }

    /// Create from a page frame number.
    #[inline]
    pub const fn from_page_frame_number(pfn: usize) -> Self {
        Self((pfn << PAGE_SHIFT) as u32)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A user virtual address as it arrives in a syscall argument word.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 as usize & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_MASK as u32))
    }

    /// Align the address up to the nearest page boundary, saturating at
    /// the last page of the address space.
    #[inline]
    pub const fn align_up(self) -> Self {
        match self.0.checked_add(PAGE_MASK as u32) {
            Some(v) => Self(v & !(PAGE_MASK as u32)),
            None => Self(u32::MAX & !(PAGE_MASK as u32)),
        }
    }

    /// Get the page table indices for this address.
    ///
    /// Returns (directory, table) indices for two-level paging.
    #[inline]
    pub const fn page_table_indices(self) -> (usize, usize) {
        let addr = self.0 as usize;
        ((addr >> 22) & 0x3FF, (addr >> PAGE_SHIFT) & 0x3FF)
    }

    /// Virtual page number.
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 as usize >> PAGE_SHIFT
    }

    /// Build the address of a virtual page number.
    #[inline]
    pub const fn from_page_number(vpn: usize) -> Self {
        Self((vpn << PAGE_SHIFT) as u32)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 as usize & PAGE_MASK
    }

    /// Below the user address ceiling.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }

    /// Below the ceiling and page-aligned: the shape every va handed to the
    /// page mapping service must have.
    #[inline]
    pub const fn is_user_page(self) -> bool {
        self.is_user() && self.is_aligned()
    }

    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
