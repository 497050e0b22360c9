//! System Call Input Validation
//!
//! Checks user-supplied buffers against the caller's own address space.
//!
//! # Security Principles
//! - Validate ALL pages of a buffer before touching any of it
//! - Fail-secure: unmapped, kernel-only or under-privileged pages all fail
//! - Prevent TOCTOU: buffers the kernel consumes are copied in once

use alloc::vec;
use alloc::vec::Vec;

use crate::mm::address::ULIM;
use crate::mm::{AddressSpace, FrameAllocator, PteFlags, VirtAddr, PAGE_SIZE};

/// Check that `[va, va + len)` is accessible to user code with `perm`.
///
/// Every page must be mapped PRESENT|USER plus `perm`, and lie below
/// `ULIM`. On failure returns the first offending address: `va` itself if
/// the problem is in its page, otherwise the start of the offending page.
/// A range that wraps the address space fails at `va`.
pub fn user_mem_check(
    space: &AddressSpace,
    va: VirtAddr,
    len: usize,
    perm: PteFlags,
) -> Result<(), VirtAddr> {
    let start = va.as_usize();
    let end = start.checked_add(len).ok_or(va)?;
    let mut page = va.align_down().as_usize();

    while page < end {
        let bad = VirtAddr::new(page.max(start) as u32);
        if page >= ULIM as usize {
            return Err(bad);
        }
        match space.lookup(VirtAddr::new(page as u32)) {
            Some(pte) if pte.permits(perm) => {}
            _ => return Err(bad),
        }
        page += PAGE_SIZE;
    }

    Ok(())
}

/// A validated user buffer, copied into kernel memory.
///
/// This type guarantees that:
/// - Every byte was readable by the caller at the time of the check
/// - Later changes to user memory cannot affect the copy
#[derive(Debug)]
pub struct UserBuffer {
    bytes: Vec<u8>,
}

impl UserBuffer {
    /// Check `[va, va + len)` for user read access and copy it in.
    pub fn copy_in(
        space: &AddressSpace,
        frames: &FrameAllocator,
        va: VirtAddr,
        len: usize,
    ) -> Result<Self, VirtAddr> {
        user_mem_check(space, va, len, PteFlags::empty())?;
        let mut bytes = vec![0; len];
        space.read(frames, va, &mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_with(frames: &mut FrameAllocator, pages: &[(u32, PteFlags)]) -> AddressSpace {
        let mut space = AddressSpace::new();
        for &(va, flags) in pages {
            let frame = frames.alloc().unwrap();
            space.insert(frames, VirtAddr::new(va), frame, flags).unwrap();
        }
        space
    }

    #[test]
    fn test_zero_length() {
        let space = AddressSpace::new();
        assert!(user_mem_check(&space, VirtAddr::new(0x1000), 0, PteFlags::empty()).is_ok());
    }

    #[test]
    fn test_reports_first_bad_address() {
        let mut frames = FrameAllocator::new(8);
        let space = space_with(
            &mut frames,
            &[(0x0080_0000, PteFlags::USER_RW), (0x0080_1000, PteFlags::MANDATORY)],
        );

        let va = VirtAddr::new(0x0080_0010);
        assert!(user_mem_check(&space, va, 0x1000, PteFlags::empty()).is_ok());
        assert_eq!(
            user_mem_check(&space, va, 0x1000, PteFlags::WRITABLE),
            Err(VirtAddr::new(0x0080_1000))
        );
        assert_eq!(
            user_mem_check(&space, VirtAddr::new(0x0080_1010), 0x1000, PteFlags::empty()),
            Err(VirtAddr::new(0x0080_2000))
        );
        assert_eq!(
            user_mem_check(&space, VirtAddr::new(0x0070_0004), 4, PteFlags::empty()),
            Err(VirtAddr::new(0x0070_0004))
        );
    }

    #[test]
    fn test_kernel_addresses_rejected() {
        let space = AddressSpace::new();
        assert_eq!(
            user_mem_check(&space, VirtAddr::new(ULIM), 1, PteFlags::empty()),
            Err(VirtAddr::new(ULIM))
        );
        assert!(user_mem_check(&space, VirtAddr::new(0xFFFF_FFF0), 0x100, PteFlags::empty()).is_err());
    }

    #[test]
    fn test_wrapping_length_rejected() {
        let mut frames = FrameAllocator::new(4);
        let space = space_with(&mut frames, &[(0x0080_0000, PteFlags::USER_RW)]);
        let va = VirtAddr::new(0x0080_0000);
        assert_eq!(user_mem_check(&space, va, usize::MAX, PteFlags::empty()), Err(va));
        assert_eq!(
            user_mem_check(&space, VirtAddr::new(0xFFFF_F000), usize::MAX - 0xFFF, PteFlags::empty()),
            Err(VirtAddr::new(0xFFFF_F000))
        );
    }

    #[test]
    fn test_copy_in() {
        let mut frames = FrameAllocator::new(4);
        let space = space_with(&mut frames, &[(0x0080_0000, PteFlags::MANDATORY)]);
        space.write(&mut frames, VirtAddr::new(0x0080_0100), b"hello").unwrap();

        let buf = UserBuffer::copy_in(&space, &frames, VirtAddr::new(0x0080_0100), 5).unwrap();
        assert_eq!(buf.as_bytes(), b"hello");
        assert!(UserBuffer::copy_in(&space, &frames, VirtAddr::new(0x0080_0FFE), 4).is_err());
    }
}
