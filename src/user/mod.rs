//! User Library
//!
//! The library OS linked into every environment: syscall stubs, user-mode
//! memory access through the MMU, the page-fault upcall trampoline, and on
//! top of those [`fork`] and [`ipc`].
//!
//! A [`Process`] stands for code executing inside one environment. It
//! enters the kernel only through the shared kernel lock.
//!
//! # Library Image
//! ```text
//!  UTEXT           read-only text; the upcall trampoline at +0x10
//!  UTEXT + PGSIZE  writable data: thisenv at +0, handler id at +4
//! ```

pub mod fork;
pub mod ipc;

use core::cell::Cell;
use core::fmt;

use alloc::vec::Vec;
use log::warn;
use spin::Mutex;

use crate::env::{EnvId, EnvInfo, EnvStatus};
use crate::kernel::{AccessError, FaultOutcome, Kernel, RunError, Segment};
use crate::mm::address::UTEXT;
use crate::mm::{PageTableEntry, PteFlags, VirtAddr, PAGE_SIZE};
use crate::syscall::{Outcome, Syscall, SyscallError};
use crate::trap::{PageFault, UTrapframe};

/// Entry point of the page-fault trampoline.
pub const PGFAULT_UPCALL: u32 = UTEXT + 0x10;
/// Start of the library's data page.
pub const LIB_DATA: u32 = UTEXT + PAGE_SIZE as u32;
/// `thisenv`: identity of the environment the library runs in.
pub const THISENV: u32 = LIB_DATA;
/// Id of the installed page-fault handler.
pub const PGFAULT_HANDLER: u32 = LIB_DATA + 4;

/// Faults taken and retried before the access is abandoned.
const MAX_FAULT_RETRIES: usize = 16;
/// Faults taken inside the fault handler itself.
const MAX_NESTED_FAULTS: usize = 4;

/// Page-fault handlers the trampoline can dispatch to.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgfaultHandler {
    CopyOnWrite = 1,
}

impl PgfaultHandler {
    const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::CopyOnWrite),
            _ => None,
        }
    }
}

/// Why a library call did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserError {
    /// The call parked the environment; [`Process::resume`] collects the
    /// result once it is runnable again.
    Blocked,
    /// The environment no longer exists.
    Killed,
    /// The kernel returned an error code.
    Sys(SyscallError),
}

impl From<SyscallError> for UserError {
    fn from(err: SyscallError) -> Self {
        Self::Sys(err)
    }
}

impl From<RunError> for UserError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Gone => Self::Killed,
            RunError::NotRunnable => Self::Blocked,
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked => write!(f, "blocked in the kernel"),
            Self::Killed => write!(f, "environment destroyed"),
            Self::Sys(e) => write!(f, "{}", e),
        }
    }
}

/// Turn a raw syscall result into a value or an error.
fn check(ret: i32) -> Result<i32, UserError> {
    if ret < 0 {
        Err(SyscallError::from_code(ret).unwrap_or(SyscallError::Unspecified).into())
    } else {
        Ok(ret)
    }
}

/// Code running in one environment.
pub struct Process<'k> {
    kernel: &'k Mutex<Kernel>,
    id: EnvId,
    /// Fault handlers currently running.
    depth: Cell<usize>,
}

impl<'k> Process<'k> {
    /// Load the library image into a fresh environment and start it.
    pub fn boot(kernel: &'k Mutex<Kernel>) -> Result<Self, UserError> {
        let image = [
            Segment {
                va: VirtAddr::new(UTEXT),
                data: &[],
                mem_size: PAGE_SIZE,
                perm: PteFlags::MANDATORY,
            },
            Segment {
                va: VirtAddr::new(LIB_DATA),
                data: &[],
                mem_size: PAGE_SIZE,
                perm: PteFlags::USER_RW,
            },
        ];
        let id = kernel.lock().env_create(UTEXT, &image)?;
        let process = Self::attach(kernel, id);
        process.write_u32(VirtAddr::new(THISENV), id.raw())?;
        Ok(process)
    }

    /// Code already running in `id`, such as a freshly forked child.
    pub fn attach(kernel: &'k Mutex<Kernel>, id: EnvId) -> Self {
        Self {
            kernel,
            id,
            depth: Cell::new(0),
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Trap into the kernel.
    pub fn syscall(&self, sys: Syscall, args: [u32; 5]) -> Result<i32, UserError> {
        let outcome = self.kernel.lock().syscall(self.id, sys as u32, args)?;
        match outcome {
            Outcome::Return(value) => Ok(value),
            Outcome::Suspended => Err(UserError::Blocked),
            Outcome::Destroyed => Err(UserError::Killed),
        }
    }

    /// Continue after a blocking call: the value the kernel left in the
    /// result register.
    pub fn resume(&self) -> Result<i32, UserError> {
        let mut kernel = self.kernel.lock();
        kernel.run(self.id)?;
        let tf = kernel.trapframe(self.id).ok_or(UserError::Killed)?;
        Ok(tf.regs.eax as i32)
    }

    pub fn sys_cputs(&self, s: VirtAddr, len: usize) -> Result<(), UserError> {
        self.syscall(Syscall::Cputs, [s.as_u32(), len as u32, 0, 0, 0])
            .map(|_| ())
    }

    pub fn sys_cgetc(&self) -> Result<Option<u8>, UserError> {
        let c = self.syscall(Syscall::Cgetc, [0; 5])?;
        Ok((c > 0).then_some(c as u8))
    }

    pub fn sys_getenvid(&self) -> Result<EnvId, UserError> {
        let id = self.syscall(Syscall::GetEnvId, [0; 5])?;
        Ok(EnvId::from_raw(id as u32))
    }

    pub fn sys_env_destroy(&self, envid: u32) -> Result<(), UserError> {
        check(self.syscall(Syscall::EnvDestroy, [envid, 0, 0, 0, 0])?).map(|_| ())
    }

    pub fn sys_page_alloc(&self, envid: u32, va: u32, perm: u32) -> Result<(), UserError> {
        check(self.syscall(Syscall::PageAlloc, [envid, va, perm, 0, 0])?).map(|_| ())
    }

    pub fn sys_page_map(
        &self,
        srcenv: u32,
        srcva: u32,
        dstenv: u32,
        dstva: u32,
        perm: u32,
    ) -> Result<(), UserError> {
        check(self.syscall(Syscall::PageMap, [srcenv, srcva, dstenv, dstva, perm])?).map(|_| ())
    }

    pub fn sys_page_unmap(&self, envid: u32, va: u32) -> Result<(), UserError> {
        check(self.syscall(Syscall::PageUnmap, [envid, va, 0, 0, 0])?).map(|_| ())
    }

    /// Create a blank child. The parent gets the child's identity; the
    /// child, once started, sees 0 from [`Process::resume`].
    pub fn sys_exofork(&self) -> Result<EnvId, UserError> {
        let id = check(self.syscall(Syscall::Exofork, [0; 5])?)?;
        Ok(EnvId::from_raw(id as u32))
    }

    pub fn sys_env_set_status(&self, envid: u32, status: EnvStatus) -> Result<(), UserError> {
        check(self.syscall(Syscall::EnvSetStatus, [envid, status as u32, 0, 0, 0])?).map(|_| ())
    }

    pub fn sys_env_set_trapframe(&self, envid: u32, tf: VirtAddr) -> Result<(), UserError> {
        check(self.syscall(Syscall::EnvSetTrapframe, [envid, tf.as_u32(), 0, 0, 0])?).map(|_| ())
    }

    pub fn sys_env_set_pgfault_upcall(&self, envid: u32, func: u32) -> Result<(), UserError> {
        check(self.syscall(Syscall::EnvSetPgfaultUpcall, [envid, func, 0, 0, 0])?).map(|_| ())
    }

    pub fn sys_yield(&self) -> Result<(), UserError> {
        self.syscall(Syscall::Yield, [0; 5]).map(|_| ())
    }

    pub fn sys_ipc_try_send(&self, envid: u32, value: u32, srcva: u32, perm: u32) -> Result<(), UserError> {
        check(self.syscall(Syscall::IpcTrySend, [envid, value, srcva, perm, 0])?).map(|_| ())
    }

    pub fn sys_ipc_recv(&self, dstva: u32) -> Result<(), UserError> {
        check(self.syscall(Syscall::IpcRecv, [dstva, 0, 0, 0, 0])?).map(|_| ())
    }

    /// Destroy this environment.
    pub fn exit(&self) -> UserError {
        let _ = self.sys_env_destroy(0);
        UserError::Killed
    }

    /// Report a fatal library error and exit.
    pub(crate) fn panic(&self, msg: &str) -> UserError {
        warn!("[FORK] [{}] user panic: {}", self.id, msg);
        self.exit()
    }

    /// Own page table entry for `va`, from the read-only `UVPT` view.
    pub fn uvpt(&self, va: VirtAddr) -> Option<PageTableEntry> {
        self.kernel.lock().lookup_pte(self.id, va)
    }

    /// Every own mapping below `limit`, lowest first.
    pub fn uvpt_mappings(&self, limit: VirtAddr) -> Vec<(VirtAddr, PageTableEntry)> {
        self.kernel.lock().mappings_below(self.id, limit)
    }

    /// Own environment record, from the read-only `UENVS` view.
    pub fn env_info(&self) -> Result<EnvInfo, UserError> {
        self.kernel.lock().env_info(self.id).ok_or(UserError::Killed)
    }

    /// The identity recorded in the library's data page.
    pub fn thisenv(&self) -> Result<EnvId, UserError> {
        self.read_u32(VirtAddr::new(THISENV)).map(EnvId::from_raw)
    }

    pub fn read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), UserError> {
        let id = self.id;
        self.access(|kernel| kernel.load(id, va, &mut *buf))
    }

    pub fn write(&self, va: VirtAddr, bytes: &[u8]) -> Result<(), UserError> {
        let id = self.id;
        self.access(|kernel| kernel.store(id, va, bytes))
    }

    pub fn read_u32(&self, va: VirtAddr) -> Result<u32, UserError> {
        let mut word = [0u8; 4];
        self.read(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&self, va: VirtAddr, value: u32) -> Result<(), UserError> {
        self.write(va, &value.to_le_bytes())
    }

    /// Run a user-mode memory access, taking page faults as the hardware
    /// would and retrying once the handler returns.
    fn access(
        &self,
        mut op: impl FnMut(&mut Kernel) -> Result<(), AccessError>,
    ) -> Result<(), UserError> {
        for _ in 0..MAX_FAULT_RETRIES {
            let result = op(&mut self.kernel.lock());
            match result {
                Ok(()) => return Ok(()),
                Err(AccessError::Run(e)) => return Err(e.into()),
                Err(AccessError::Fault(fault)) => self.take_fault(fault)?,
            }
        }
        Err(self.panic("page fault not resolved by handler"))
    }

    /// Trap on `fault` and, if the kernel reflects it, run the upcall.
    fn take_fault(&self, fault: PageFault) -> Result<(), UserError> {
        let depth = self.depth.get();
        if depth >= MAX_NESTED_FAULTS {
            return Err(self.panic("recursive page faults"));
        }

        let outcome = self.kernel.lock().page_fault(self.id, fault)?;
        let FaultOutcome::Upcall { entry, frame } = outcome else {
            return Err(UserError::Killed);
        };
        if entry != PGFAULT_UPCALL {
            warn!("[TRAP] [{}] upcall {:#010x} is not executable", self.id, entry);
            return Err(self.exit());
        }

        self.depth.set(depth + 1);
        let result = self.pgfault_trampoline(frame);
        self.depth.set(depth);
        result
    }

    /// The upcall entry: read the fault record, call the installed
    /// handler, then return to the trap-time state.
    fn pgfault_trampoline(&self, frame: VirtAddr) -> Result<(), UserError> {
        let mut bytes = [0u8; UTrapframe::SIZE];
        self.read(frame, &mut bytes)?;
        let record = UTrapframe::from_bytes(&bytes).ok_or(UserError::Sys(SyscallError::Fault))?;

        let handler = self.read_u32(VirtAddr::new(PGFAULT_HANDLER))?;
        match PgfaultHandler::from_raw(handler) {
            Some(PgfaultHandler::CopyOnWrite) => fork::pgfault(self, &record)?,
            None => return Err(self.panic("page fault with no handler installed")),
        }

        self.kernel.lock().upcall_return(self.id, &record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::mm::address::{USTACKTOP, UTOP};

    fn kernel() -> Mutex<Kernel> {
        Mutex::new(Kernel::new(KernelConfig { phys_frames: 64 }))
    }

    #[test]
    fn test_boot_sets_thisenv() {
        let k = kernel();
        let p = Process::boot(&k).unwrap();
        assert_eq!(p.thisenv().unwrap(), p.id());
        assert_eq!(p.sys_getenvid().unwrap(), p.id());

        let mapped: Vec<u32> = p
            .uvpt_mappings(VirtAddr::new(UTOP))
            .iter()
            .map(|(va, _)| va.as_u32())
            .collect();
        assert_eq!(mapped, [UTEXT, LIB_DATA, USTACKTOP - PAGE_SIZE as u32]);
    }

    #[test]
    fn test_text_is_read_only() {
        let k = kernel();
        let p = Process::boot(&k).unwrap();
        // no handler installed: the write fault is fatal
        assert_eq!(p.write_u32(VirtAddr::new(UTEXT), 1), Err(UserError::Killed));
        assert!(k.lock().env_info(p.id()).is_none());
    }

    #[test]
    fn test_stub_errors() {
        let k = kernel();
        let p = Process::boot(&k).unwrap();
        assert_eq!(
            p.sys_page_alloc(0, UTEXT + 1, PteFlags::USER_RW.bits()),
            Err(UserError::Sys(SyscallError::Inval))
        );
        assert_eq!(p.sys_cgetc(), Ok(None));
        assert_eq!(p.exit(), UserError::Killed);
        assert_eq!(p.sys_yield(), Err(UserError::Killed));
    }
}
