//! User Memory Access and Fault Reflection
//!
//! User-mode loads and stores go through the environment's page table the
//! way the MMU would: a missing page, a kernel page or a write to a page
//! without WRITABLE is a page fault. Faults are reflected to the user-level
//! upcall on the exception stack, or destroy the environment.

use core::fmt;

use log::{trace, warn};

use super::{Kernel, RunError};
use crate::env::EnvId;
use crate::mm::address::{ULIM, UXSTACKTOP};
use crate::mm::{AddressSpace, PteFlags, VirtAddr, PAGE_SIZE};
use crate::syscall::user_mem_check;
use crate::trap::{FaultCode, PageFault, UTrapframe, T_PGFLT};

/// A user access that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The environment cannot execute.
    Run(RunError),
    /// The MMU refused the access.
    Fault(PageFault),
}

impl From<RunError> for AccessError {
    fn from(err: RunError) -> Self {
        Self::Run(err)
    }
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(e) => write!(f, "{}", e),
            Self::Fault(pf) => write!(f, "page fault at {} ({:?})", pf.va, pf.code),
        }
    }
}

/// Result of reflecting a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The environment now executes `entry` with its stack pointer at the
    /// fault record `frame`.
    Upcall { entry: u32, frame: VirtAddr },
    /// The fault could not be reflected; the environment is gone.
    Destroyed,
}

/// MMU check of `[va, va + len)` for a user access.
fn translate(space: &AddressSpace, va: VirtAddr, len: usize, write: bool) -> Result<(), PageFault> {
    let required = if write { PteFlags::WRITABLE } else { PteFlags::empty() };
    let mut code = FaultCode::USER;
    if write {
        code |= FaultCode::WRITE;
    }

    user_mem_check(space, va, len, required).map_err(|bad| {
        let present = bad.as_u32() < ULIM && space.lookup(bad.align_down()).is_some();
        PageFault {
            va: bad,
            code: if present { code | FaultCode::PROTECTION } else { code },
        }
    })
}

impl Kernel {
    /// User-mode load of `buf.len()` bytes at `va` by `id`.
    pub fn load(&mut self, id: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), AccessError> {
        self.run(id)?;
        let env = self.envs.get(id).ok_or(RunError::Gone)?;
        translate(&env.space, va, buf.len(), false).map_err(AccessError::Fault)?;
        env.space
            .read(&self.frames, va, buf)
            .map_err(|bad| AccessError::Fault(PageFault { va: bad, code: FaultCode::USER }))
    }

    /// User-mode store of `bytes` at `va` by `id`. Nothing is written if
    /// any page of the range faults.
    pub fn store(&mut self, id: EnvId, va: VirtAddr, bytes: &[u8]) -> Result<(), AccessError> {
        self.run(id)?;
        let env = self.envs.get(id).ok_or(RunError::Gone)?;
        translate(&env.space, va, bytes.len(), true).map_err(AccessError::Fault)?;
        env.space.write(&mut self.frames, va, bytes).map_err(|bad| {
            AccessError::Fault(PageFault {
                va: bad,
                code: FaultCode::USER | FaultCode::WRITE,
            })
        })
    }

    /// Reflect `fault` taken by `id` to its page-fault upcall.
    ///
    /// The fault record goes on the exception stack: at its top, or just
    /// below the current stack pointer (leaving one empty word) when the
    /// fault happened on the exception stack itself. An environment with no
    /// upcall, or whose record would not land on writable user memory, is
    /// destroyed.
    pub fn page_fault(&mut self, id: EnvId, fault: PageFault) -> Result<FaultOutcome, RunError> {
        self.run(id)?;
        let env = self.envs.get_mut(id).ok_or(RunError::Gone)?;
        env.tf.trapno = T_PGFLT;
        env.tf.err = fault.code.bits();

        if env.pgfault_upcall == 0 {
            warn!(
                "[TRAP] [{}] user fault va {} ip {:#010x}, no upcall",
                id, fault.va, env.tf.eip
            );
            self.env_destroy(id);
            return Ok(FaultOutcome::Destroyed);
        }

        let esp = env.tf.esp;
        let xstack = UXSTACKTOP - PAGE_SIZE as u32..UXSTACKTOP;
        let top = if xstack.contains(&esp) { esp - 4 } else { UXSTACKTOP };
        let frame = top
            .checked_sub(UTrapframe::SIZE as u32)
            .map(VirtAddr::new)
            .filter(|&va| user_mem_check(&env.space, va, UTrapframe::SIZE, PteFlags::WRITABLE).is_ok());
        let Some(frame) = frame else {
            warn!(
                "[TRAP] [{}] no usable exception stack for fault at {}",
                id, fault.va
            );
            self.env_destroy(id);
            return Ok(FaultOutcome::Destroyed);
        };

        let record = UTrapframe::new(&fault, &env.tf);
        if env.space.write(&mut self.frames, frame, &record.to_bytes()).is_err() {
            self.env_destroy(id);
            return Ok(FaultOutcome::Destroyed);
        }
        env.tf.esp = frame.as_u32();
        env.tf.eip = env.pgfault_upcall;
        trace!("[TRAP] [{}] fault at {} -> upcall, record at {}", id, fault.va, frame);

        Ok(FaultOutcome::Upcall {
            entry: env.pgfault_upcall,
            frame,
        })
    }

    /// Resume at the trap-time state saved in `record`, as the upcall's
    /// return path does.
    pub fn upcall_return(&mut self, id: EnvId, record: &UTrapframe) -> Result<(), RunError> {
        self.run(id)?;
        let env = self.envs.get_mut(id).ok_or(RunError::Gone)?;
        env.tf.regs = record.regs;
        env.tf.eip = record.eip;
        env.tf.eflags = record.eflags;
        env.tf.esp = record.esp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::mm::address::{USTACKTOP, UTEXT};

    const P: u32 = PteFlags::PRESENT.bits();
    const U: u32 = PteFlags::USER.bits();
    const W: u32 = PteFlags::WRITABLE.bits();

    fn booted() -> (Kernel, EnvId) {
        let mut k = Kernel::new(KernelConfig { phys_frames: 32 });
        let id = k.env_create(UTEXT, &[]).unwrap();
        (k, id)
    }

    #[test]
    fn test_load_store_follow_permissions() {
        let (mut k, id) = booted();
        k.page_alloc(id, 0, UTEXT, P | U).unwrap();

        let va = VirtAddr::new(UTEXT + 8);
        let mut buf = [0u8; 4];
        k.load(id, va, &mut buf).unwrap();

        let err = k.store(id, va, &[1]).unwrap_err();
        assert_eq!(
            err,
            AccessError::Fault(PageFault {
                va,
                code: FaultCode::USER | FaultCode::WRITE | FaultCode::PROTECTION,
            })
        );

        let unmapped = VirtAddr::new(0x1000_0000);
        assert_eq!(
            k.load(id, unmapped, &mut buf),
            Err(AccessError::Fault(PageFault { va: unmapped, code: FaultCode::USER }))
        );
    }

    #[test]
    fn test_fault_without_upcall_destroys() {
        let (mut k, id) = booted();
        let fault = PageFault {
            va: VirtAddr::new(0),
            code: FaultCode::USER,
        };
        assert_eq!(k.page_fault(id, fault), Ok(FaultOutcome::Destroyed));
        assert!(k.env_info(id).is_none());
    }

    #[test]
    fn test_fault_without_exception_stack_destroys() {
        let (mut k, id) = booted();
        k.envs.get_mut(id).unwrap().pgfault_upcall = UTEXT;
        let fault = PageFault {
            va: VirtAddr::new(0),
            code: FaultCode::USER,
        };
        assert_eq!(k.page_fault(id, fault), Ok(FaultOutcome::Destroyed));
    }

    #[test]
    fn test_fault_record_placement() {
        let (mut k, id) = booted();
        k.page_alloc(id, 0, UXSTACKTOP - PAGE_SIZE as u32, P | U | W).unwrap();
        k.envs.get_mut(id).unwrap().pgfault_upcall = UTEXT + 0x10;
        let fault = PageFault {
            va: VirtAddr::new(0x1234),
            code: FaultCode::USER | FaultCode::WRITE,
        };

        let first = k.page_fault(id, fault).unwrap();
        let top = UXSTACKTOP - UTrapframe::SIZE as u32;
        assert_eq!(
            first,
            FaultOutcome::Upcall {
                entry: UTEXT + 0x10,
                frame: VirtAddr::new(top),
            }
        );
        let mut bytes = [0u8; UTrapframe::SIZE];
        k.load(id, VirtAddr::new(top), &mut bytes).unwrap();
        let record = UTrapframe::from_bytes(&bytes).unwrap();
        assert_eq!(record.fault_va, 0x1234);
        assert_eq!(record.esp, USTACKTOP);

        // recursive fault: below the current record with a one-word gap
        let second = k.page_fault(id, fault).unwrap();
        let nested = top - 4 - UTrapframe::SIZE as u32;
        assert!(matches!(second, FaultOutcome::Upcall { frame, .. } if frame.as_u32() == nested));

        k.upcall_return(id, &record).unwrap();
        let tf = k.trapframe(id).unwrap();
        assert_eq!(tf.esp, USTACKTOP);
    }
}
