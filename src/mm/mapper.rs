//! Address Space Mapper
//!
//! Per-environment page directory plus the insert/lookup/remove primitives
//! the page mapping service is built on.
//!
//! # Security Properties
//! - Every installed mapping holds one reference on its frame
//! - Second-level tables are charged against the same frame pool as data
//!   pages, so installing a mapping can run out of memory on its own
//! - A replaced mapping is released only after the new one holds its
//!   reference, so re-inserting the same frame never frees it

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::address::{PhysAddr, VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use super::frame::FrameAllocator;
use super::paging::{MappingError, PageTable, PageTableEntry, PteFlags};

/// A second-level table and the frame it is charged to.
struct TableSlot {
    frame: PhysAddr,
    table: Box<PageTable>,
}

/// A user address space: sparse page directory of second-level tables.
#[derive(Default)]
pub struct AddressSpace {
    directory: BTreeMap<usize, TableSlot>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the entry for `va`, if its table exists and it is present.
    pub fn lookup(&self, va: VirtAddr) -> Option<PageTableEntry> {
        let (dir, idx) = va.page_table_indices();
        let slot = self.directory.get(&dir)?;
        let pte = slot.table[idx];
        pte.is_present().then_some(pte)
    }

    /// Map `frame` at `va` with `flags`, replacing whatever was there.
    ///
    /// Allocates the second-level table on demand. On failure nothing has
    /// changed.
    pub fn insert(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
        frame: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), MappingError> {
        let (dir, idx) = va.page_table_indices();
        let fresh_table = !self.directory.contains_key(&dir);
        if fresh_table {
            let table_frame = frames.alloc().ok_or(MappingError::OutOfMemory)?;
            if let Err(err) = frames.incref(table_frame) {
                frames.free(table_frame);
                return Err(err);
            }
            self.directory.insert(
                dir,
                TableSlot {
                    frame: table_frame,
                    table: Box::new(PageTable::new()),
                },
            );
        }

        if let Err(err) = frames.incref(frame) {
            if fresh_table {
                if let Some(slot) = self.directory.remove(&dir) {
                    frames.decref(slot.frame);
                }
            }
            return Err(err);
        }
        let slot = self
            .directory
            .get_mut(&dir)
            .ok_or(MappingError::NotMapped)?;
        let old = core::mem::replace(&mut slot.table[idx], PageTableEntry::page(frame, flags));
        if old.is_present() {
            frames.decref(old.frame());
        }
        Ok(())
    }

    /// Remove the mapping at `va`. Removing nothing is not an error.
    pub fn remove(&mut self, frames: &mut FrameAllocator, va: VirtAddr) {
        let (dir, idx) = va.page_table_indices();
        if let Some(slot) = self.directory.get_mut(&dir) {
            let pte = &mut slot.table[idx];
            if pte.is_present() {
                let frame = pte.frame();
                pte.clear();
                frames.decref(frame);
            }
        }
    }

    /// Copy bytes out of the space starting at `va`, ignoring permissions.
    ///
    /// Fails with the first unmapped address; nothing is copied then.
    pub fn read(&self, frames: &FrameAllocator, va: VirtAddr, buf: &mut [u8]) -> Result<(), VirtAddr> {
        let chunks = self.chunks(va, buf.len())?;
        let mut done = 0;
        for (frame, offset, len) in chunks {
            buf[done..done + len].copy_from_slice(&frames.page(frame)[offset..offset + len]);
            done += len;
        }
        Ok(())
    }

    /// Copy bytes into the space starting at `va`, ignoring permissions.
    ///
    /// Fails with the first unmapped address; nothing is copied then.
    pub fn write(&self, frames: &mut FrameAllocator, va: VirtAddr, bytes: &[u8]) -> Result<(), VirtAddr> {
        let chunks = self.chunks(va, bytes.len())?;
        let mut done = 0;
        for (frame, offset, len) in chunks {
            frames.page_mut(frame)[offset..offset + len].copy_from_slice(&bytes[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Split `[va, va + len)` into per-frame pieces.
    fn chunks(&self, va: VirtAddr, len: usize) -> Result<Vec<(PhysAddr, usize, usize)>, VirtAddr> {
        let mut out = Vec::new();
        let mut addr = va.as_usize();
        let end = addr.checked_add(len).ok_or(va)?;
        while addr < end {
            let at = VirtAddr::new(u32::try_from(addr).map_err(|_| va)?);
            let pte = self.lookup(at).ok_or(at)?;
            let offset = at.page_offset();
            let n = (PAGE_SIZE - offset).min(end - addr);
            out.push((pte.frame(), offset, n));
            addr += n;
        }
        Ok(out)
    }

    /// Every present mapping below `limit`, lowest address first.
    pub fn mappings_below(&self, limit: VirtAddr) -> Vec<(VirtAddr, PageTableEntry)> {
        let mut out = Vec::new();
        for (&dir, slot) in self.directory.iter() {
            for (idx, pte) in slot.table.iter_present() {
                let va = VirtAddr::new(((dir * ENTRIES_PER_TABLE + idx) * PAGE_SIZE) as u32);
                if va >= limit {
                    return out;
                }
                out.push((va, *pte));
            }
        }
        out
    }

    /// Number of present user mappings.
    pub fn mapped_pages(&self) -> usize {
        self.directory
            .values()
            .map(|slot| slot.table.iter_present().count())
            .sum()
    }

    /// Release every mapping and every second-level table.
    pub fn clear(&mut self, frames: &mut FrameAllocator) {
        for (_, mut slot) in core::mem::take(&mut self.directory) {
            for idx in 0..ENTRIES_PER_TABLE {
                let pte = &mut slot.table[idx];
                if pte.is_present() {
                    let frame = pte.frame();
                    pte.clear();
                    frames.decref(frame);
                }
            }
            frames.decref(slot.frame);
        }
    }
}
