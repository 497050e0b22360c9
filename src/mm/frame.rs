//! Physical Frame Allocator
//!
//! Manages physical memory pages (frames) using a bitmap allocator with a
//! reference count per frame.
//!
//! # Design
//! - Each bit in the bitmap represents one 4KB frame
//! - Bit = 0: frame is free
//! - Bit = 1: frame is allocated
//! - A frame is handed out with a reference count of zero; every mapping
//!   that installs it increments the count, every removal decrements it,
//!   and the frame returns to the pool when the count drops back to zero
//!
//! # Security Properties
//! - All allocated frames are zeroed before returning
//! - Double-free is detected and causes a panic
//! - Reference counts never wrap: a mapping past [`MAX_REFS`] is refused
//! - Frame contents are only reachable through this allocator

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use super::address::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};
use super::paging::MappingError;

/// Starting physical address for allocatable frames.
/// The first 4MB hold the kernel image and boot structures.
pub const FRAME_START: u32 = 0x0040_0000;

/// Most mappings a single frame can carry.
pub const MAX_REFS: u16 = u16::MAX;

/// Contents of one physical frame.
pub type Page = [u8; PAGE_SIZE];

/// Bitmap frame allocator with per-frame reference counts.
pub struct FrameAllocator {
    /// Bitmap tracking allocated frames (1 = allocated, 0 = free).
    bitmap: Vec<u8>,
    /// Mapping count per frame.
    refcounts: Vec<u16>,
    /// Backing storage; `Some` exactly while the frame is allocated.
    pages: Vec<Option<Box<Page>>>,
    /// Number of free frames remaining.
    free_count: usize,
    /// Total frames under management.
    total_frames: usize,
}

impl FrameAllocator {
    /// Create an allocator managing `total_frames` frames above
    /// [`FRAME_START`].
    pub fn new(total_frames: usize) -> Self {
        let max = ((u32::MAX - FRAME_START) as usize >> PAGE_SHIFT) + 1;
        let total_frames = total_frames.min(max);
        let mut pages = Vec::with_capacity(total_frames);
        pages.resize_with(total_frames, || None);
        Self {
            bitmap: vec![0; total_frames.div_ceil(8)],
            refcounts: vec![0; total_frames],
            pages,
            free_count: total_frames,
            total_frames,
        }
    }

    /// Set a bit in the bitmap.
    #[inline]
    fn set_bit(&mut self, frame: usize, allocated: bool) {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        if allocated {
            self.bitmap[byte_idx] |= 1 << bit_idx;
        } else {
            self.bitmap[byte_idx] &= !(1 << bit_idx);
        }
    }

    /// Check if a frame is allocated.
    #[inline]
    fn is_allocated(&self, frame: usize) -> bool {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        match self.bitmap.get(byte_idx) {
            Some(byte) => (byte >> bit_idx) & 1 == 1,
            // Out of range = allocated
            None => true,
        }
    }

    fn index_of(&self, addr: PhysAddr) -> usize {
        if !addr.is_aligned() || addr.as_u32() < FRAME_START {
            panic!("Frame address outside managed range: {:?}", addr);
        }
        let frame = (addr.as_u32() - FRAME_START) as usize >> PAGE_SHIFT;
        if frame >= self.total_frames {
            panic!("Frame address outside managed range: {:?}", addr);
        }
        frame
    }

    fn addr_of(frame: usize) -> PhysAddr {
        PhysAddr::new(FRAME_START + ((frame << PAGE_SHIFT) as u32))
    }

    /// Allocate a single zero-filled frame with a reference count of zero.
    ///
    /// Returns `None` if no frames are available.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        if self.free_count == 0 {
            return None;
        }

        for byte_idx in 0..self.bitmap.len() {
            if self.bitmap[byte_idx] == 0xFF {
                continue;
            }
            for bit_idx in 0..8 {
                let frame = byte_idx * 8 + bit_idx;
                if frame >= self.total_frames {
                    break;
                }
                if !self.is_allocated(frame) {
                    self.set_bit(frame, true);
                    self.free_count -= 1;
                    self.refcounts[frame] = 0;
                    self.pages[frame] = Some(Box::new([0; PAGE_SIZE]));
                    return Some(Self::addr_of(frame));
                }
            }
        }

        None
    }

    /// Return a frame to the pool.
    ///
    /// # Panics
    /// Panics if:
    /// - The address is not page-aligned
    /// - The frame was not allocated (double-free)
    /// - The frame is outside the managed range
    /// - The frame is still mapped somewhere
    pub fn free(&mut self, addr: PhysAddr) {
        let frame = self.index_of(addr);

        if !self.is_allocated(frame) {
            panic!("Double free detected for frame: {:?}", addr);
        }
        if self.refcounts[frame] != 0 {
            panic!("Freeing frame {:?} with {} live mappings", addr, self.refcounts[frame]);
        }

        self.set_bit(frame, false);
        self.pages[frame] = None;
        self.free_count += 1;
    }

    /// Record one more mapping of `addr`.
    ///
    /// Fails with [`MappingError::OutOfMemory`] once the frame already has
    /// [`MAX_REFS`] mappings; the count is unchanged then.
    pub fn incref(&mut self, addr: PhysAddr) -> Result<(), MappingError> {
        let frame = self.index_of(addr);
        let count = &mut self.refcounts[frame];
        if *count >= MAX_REFS {
            return Err(MappingError::OutOfMemory);
        }
        *count += 1;
        Ok(())
    }

    /// Drop one mapping of `addr`, freeing the frame when none remain.
    pub fn decref(&mut self, addr: PhysAddr) {
        let frame = self.index_of(addr);
        debug_assert!(self.refcounts[frame] > 0, "decref of unmapped frame {:?}", addr);
        self.refcounts[frame] = self.refcounts[frame].saturating_sub(1);
        if self.refcounts[frame] == 0 {
            self.free(addr);
        }
    }

    /// Number of mappings currently referencing `addr`.
    pub fn refcount(&self, addr: PhysAddr) -> u16 {
        self.refcounts[self.index_of(addr)]
    }

    /// Read access to an allocated frame.
    pub fn page(&self, addr: PhysAddr) -> &Page {
        let frame = self.index_of(addr);
        match self.pages[frame].as_deref() {
            Some(page) => page,
            None => panic!("Access to free frame: {:?}", addr),
        }
    }

    /// Write access to an allocated frame.
    pub fn page_mut(&mut self, addr: PhysAddr) -> &mut Page {
        let frame = self.index_of(addr);
        match self.pages[frame].as_deref_mut() {
            Some(page) => page,
            None => panic!("Access to free frame: {:?}", addr),
        }
    }

    /// Get the number of free frames remaining.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}
