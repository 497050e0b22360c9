//! Copy-on-Write Fork
//!
//! Fork built entirely from user-level primitives: `exofork`, page mapping
//! syscalls, and a page-fault handler that makes private copies on demand.
//!
//! # Duplication Rule
//! - Writable or copy-on-write, and not marked SHARE: both sides end up
//!   read-only with COW set
//! - Anything else: mapped into the child with the same permission
//! - Exception stacks are never shared; the child gets a fresh one

use log::{debug, info};
use spin::Mutex;

use super::{PgfaultHandler, Process, UserError, PGFAULT_HANDLER, PGFAULT_UPCALL, THISENV};
use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::mm::address::{PFTEMP, USTACKTOP, UXSTACKTOP};
use crate::mm::{PageTableEntry, PteFlags, VirtAddr, PAGE_SIZE};
use crate::syscall::SyscallError;
use crate::trap::{FaultCode, UTrapframe};

const XSTACK: u32 = UXSTACKTOP - PAGE_SIZE as u32;

/// Install `handler` for page faults in the calling environment.
///
/// The first installation also allocates the exception stack and registers
/// the library trampoline as the upcall.
pub fn set_pgfault_handler(p: &Process<'_>, handler: PgfaultHandler) -> Result<(), UserError> {
    let slot = VirtAddr::new(PGFAULT_HANDLER);
    let current = p.read_u32(slot)?;
    if current == 0 {
        p.sys_page_alloc(0, XSTACK, PteFlags::USER_RW.bits())?;
        p.sys_env_set_pgfault_upcall(0, PGFAULT_UPCALL)?;
    }
    if current != handler as u32 {
        p.write_u32(slot, handler as u32)?;
    }
    Ok(())
}

/// Copy-on-write fault handler.
///
/// Anything but a write to a COW page is fatal.
pub(crate) fn pgfault(p: &Process<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let addr = VirtAddr::new(utf.fault_va).align_down();

    if !utf.code().contains(FaultCode::WRITE) {
        return Err(p.panic("pgfault: not write access"));
    }
    if !p.uvpt(addr).is_some_and(|pte| pte.is_cow()) {
        return Err(p.panic("pgfault: not access to copy-on-write page"));
    }

    let rw = PteFlags::USER_RW.bits();
    let tmp = VirtAddr::new(PFTEMP);
    let mut page = [0u8; PAGE_SIZE];

    p.sys_page_alloc(0, PFTEMP, rw)?;
    p.read(addr, &mut page)?;
    p.write(tmp, &page)?;
    p.sys_page_unmap(0, addr.as_u32())?;
    p.sys_page_map(0, tmp.as_u32(), 0, addr.as_u32(), rw)?;
    p.sys_page_unmap(0, tmp.as_u32())?;

    debug!("[FORK] [{}] private copy of {}", p.id(), addr);
    Ok(())
}

/// Map our page at `va` into `child` at the same address.
fn duppage(p: &Process<'_>, child: EnvId, va: VirtAddr, pte: PageTableEntry) -> Result<(), UserError> {
    let perm = pte.flags();
    let va = va.as_u32();

    if perm.intersects(PteFlags::WRITABLE | PteFlags::COW) && !perm.contains(PteFlags::SHARE) {
        let cow = perm.as_cow().bits();
        p.sys_page_map(0, va, child.raw(), va, cow)?;
        // ours must be COW again even if it already was
        p.sys_page_map(0, va, 0, va, cow)?;
    } else {
        p.sys_page_map(0, va, child.raw(), va, perm.bits())?;
    }
    Ok(())
}

/// Fork the calling environment.
///
/// Returns the child's identity. The child starts suspended in this call;
/// [`fork_child`] continues it.
pub fn fork(p: &Process<'_>) -> Result<EnvId, UserError> {
    set_pgfault_handler(p, PgfaultHandler::CopyOnWrite)?;

    let child = p.sys_exofork()?;

    for (va, pte) in p.uvpt_mappings(VirtAddr::new(USTACKTOP)) {
        duppage(p, child, va, pte)?;
    }

    p.sys_page_alloc(child.raw(), XSTACK, PteFlags::USER_RW.bits())?;
    p.sys_env_set_pgfault_upcall(child.raw(), PGFAULT_UPCALL)?;
    p.sys_env_set_status(child.raw(), EnvStatus::Runnable)?;

    info!("[FORK] [{}] forked {}", p.id(), child);
    Ok(child)
}

/// Continue `child` on its side of [`fork`]: the fork call returns 0 there
/// and the child fixes its `thisenv`.
pub fn fork_child<'k>(kernel: &'k Mutex<Kernel>, child: EnvId) -> Result<Process<'k>, UserError> {
    let p = Process::attach(kernel, child);
    let ret = p.resume()?;
    if ret != 0 {
        return Err(SyscallError::Unspecified.into());
    }
    let me = p.sys_getenvid()?;
    p.write_u32(VirtAddr::new(THISENV), me.raw())?;
    Ok(p)
}
