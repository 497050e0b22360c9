//! Page Mapping Service
//!
//! The three user-visible page operations plus the frame transfer shared
//! with IPC. Every failing path leaves both address spaces and every
//! reference count as they were.

use log::debug;

use super::Kernel;
use crate::env::EnvId;
use crate::mm::{PteFlags, VirtAddr};
use crate::syscall::SyscallError;

impl Kernel {
    /// Allocate a zeroed page and map it at `va` in `envid` with `perm`,
    /// replacing any existing mapping.
    pub fn page_alloc(&mut self, caller: EnvId, envid: u32, va: u32, perm: u32) -> Result<(), SyscallError> {
        let id = self.envs.resolve(Some(caller), envid, true)?;
        let va = VirtAddr::new(va);
        if !va.is_user_page() {
            debug!("[MM] page_alloc: bad va {}", va);
            return Err(SyscallError::Inval);
        }
        let perm = PteFlags::from_syscall(perm).ok_or(SyscallError::Inval)?;

        let frame = self.frames.alloc().ok_or_else(|| {
            debug!("[MM] page_alloc: out of frames");
            SyscallError::NoMem
        })?;
        let env = self.envs.get_mut(id).ok_or(SyscallError::BadEnv)?;
        if let Err(e) = env.space.insert(&mut self.frames, va, frame, perm) {
            self.frames.free(frame);
            debug!("[MM] page_alloc: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Map the page at `srcva` in `srcenv` into `dstenv` at `dstva`.
    pub fn page_map(
        &mut self,
        caller: EnvId,
        srcenv: u32,
        srcva: u32,
        dstenv: u32,
        dstva: u32,
        perm: u32,
    ) -> Result<(), SyscallError> {
        let src = self.envs.resolve(Some(caller), srcenv, true)?;
        let dst = self.envs.resolve(Some(caller), dstenv, true)?;
        self.transfer_page(src, VirtAddr::new(srcva), dst, VirtAddr::new(dstva), perm)
            .map(|_| ())
    }

    /// Remove the mapping at `va` in `envid`, if there is one.
    pub fn page_unmap(&mut self, caller: EnvId, envid: u32, va: u32) -> Result<(), SyscallError> {
        let id = self.envs.resolve(Some(caller), envid, true)?;
        let va = VirtAddr::new(va);
        if !va.is_user_page() {
            debug!("[MM] page_unmap: bad va {}", va);
            return Err(SyscallError::Inval);
        }
        let env = self.envs.get_mut(id).ok_or(SyscallError::BadEnv)?;
        env.space.remove(&mut self.frames, va);
        Ok(())
    }

    /// Share the frame at `srcva` in `src` with `dst` at `dstva`.
    ///
    /// Both identities must already be resolved. Rejects misaligned or
    /// out-of-range addresses, a missing source page, a malformed
    /// permission word, and write access to a read-only source.
    pub(crate) fn transfer_page(
        &mut self,
        src: EnvId,
        srcva: VirtAddr,
        dst: EnvId,
        dstva: VirtAddr,
        perm: u32,
    ) -> Result<PteFlags, SyscallError> {
        if !srcva.is_user_page() || !dstva.is_user_page() {
            debug!("[MM] page_map: bad va {} -> {}", srcva, dstva);
            return Err(SyscallError::Inval);
        }
        let pte = self
            .envs
            .get(src)
            .ok_or(SyscallError::BadEnv)?
            .space
            .lookup(srcva)
            .ok_or_else(|| {
                debug!("[MM] page_map: nothing mapped at {} in {}", srcva, src);
                SyscallError::Inval
            })?;
        let perm = PteFlags::from_syscall(perm).ok_or(SyscallError::Inval)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.is_writable() {
            debug!("[MM] page_map: write access to read-only {} in {}", srcva, src);
            return Err(SyscallError::Inval);
        }

        let env = self.envs.get_mut(dst).ok_or(SyscallError::BadEnv)?;
        env.space.insert(&mut self.frames, dstva, pte.frame(), perm)?;
        Ok(perm)
    }
}
