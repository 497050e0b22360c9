//! System Call Handler
//!
//! Dispatches system calls and implements individual syscall handlers.
//!
//! # Security Considerations
//! - All syscall numbers are validated against the whitelist
//! - Unknown syscalls return `Inval`
//! - Parameters are validated before use
//! - A bad user buffer destroys the caller instead of returning an error

use log::{debug, trace, warn};

use super::validate::UserBuffer;
use super::{Outcome, Syscall, SyscallError};
use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::mm::VirtAddr;
use crate::trap::Trapframe;

/// Dispatch a system call made by the current environment.
///
/// # Arguments
/// * `num` - System call number
/// * `args` - The five argument words, in order
///
/// # Returns
/// What happened to the caller; for [`Outcome::Return`] the value to place
/// in its result register.
pub fn dispatch(kernel: &mut Kernel, num: u32, args: [u32; 5]) -> Outcome {
    let Some(caller) = kernel.current() else {
        warn!("[SYSCALL] {} with no current environment", num);
        return Outcome::from(Err(SyscallError::BadEnv));
    };
    let [a1, a2, a3, a4, a5] = args;

    let Some(sys) = Syscall::from_number(num) else {
        debug!("[SYSCALL] [{}] unknown syscall {}", caller, num);
        return Outcome::from(Err(SyscallError::Inval));
    };
    trace!("[SYSCALL] [{}] {:?} {:x?}", caller, sys, args);

    match sys {
        Syscall::Cputs => sys_cputs(kernel, caller, a1, a2 as usize),
        Syscall::Cgetc => Outcome::Return(sys_cgetc(kernel)),
        Syscall::GetEnvId => Outcome::Return(caller.raw() as i32),
        Syscall::EnvDestroy => sys_env_destroy(kernel, caller, a1),
        Syscall::PageAlloc => kernel.page_alloc(caller, a1, a2, a3).map(|()| 0).into(),
        Syscall::PageMap => kernel.page_map(caller, a1, a2, a3, a4, a5).map(|()| 0).into(),
        Syscall::PageUnmap => kernel.page_unmap(caller, a1, a2).map(|()| 0).into(),
        Syscall::Exofork => sys_exofork(kernel, caller).into(),
        Syscall::EnvSetStatus => sys_env_set_status(kernel, caller, a1, a2).into(),
        Syscall::EnvSetTrapframe => sys_env_set_trapframe(kernel, caller, a1, a2),
        Syscall::EnvSetPgfaultUpcall => sys_env_set_pgfault_upcall(kernel, caller, a1, a2).into(),
        Syscall::Yield => {
            kernel.yield_cpu();
            Outcome::Return(0)
        }
        Syscall::IpcTrySend => kernel.ipc_try_send(caller, a1, a2, a3, a4),
        Syscall::IpcRecv => kernel.ipc_recv(caller, a1),
    }
}

/// Copy a user buffer in, or destroy the caller if it may not be read.
fn user_buffer(kernel: &mut Kernel, caller: EnvId, va: u32, len: usize) -> Option<UserBuffer> {
    let env = kernel.envs.get(caller)?;
    match UserBuffer::copy_in(&env.space, &kernel.frames, VirtAddr::new(va), len) {
        Ok(buf) => Some(buf),
        Err(bad) => {
            warn!(
                "[SYSCALL] [{}] user_mem_check assertion failure for va {}",
                caller, bad
            );
            kernel.env_destroy(caller);
            None
        }
    }
}

/// Print `len` bytes at `s` on the console.
fn sys_cputs(kernel: &mut Kernel, caller: EnvId, s: u32, len: usize) -> Outcome {
    match user_buffer(kernel, caller, s, len) {
        Some(buf) => {
            kernel.console.write_bytes(buf.as_bytes());
            Outcome::Return(0)
        }
        None => Outcome::Destroyed,
    }
}

/// Next console byte, 0 when nothing is waiting.
fn sys_cgetc(kernel: &mut Kernel) -> i32 {
    kernel.console.read_byte().map_or(0, i32::from)
}

fn sys_env_destroy(kernel: &mut Kernel, caller: EnvId, envid: u32) -> Outcome {
    let target = match kernel.envs.resolve(Some(caller), envid, true) {
        Ok(target) => target,
        Err(e) => return Outcome::from(Err(e)),
    };
    if target == caller {
        debug!("[ENV] [{}] exiting", caller);
    } else {
        debug!("[ENV] [{}] destroying {}", caller, target);
    }
    kernel.env_destroy(target);

    if target == caller {
        Outcome::Destroyed
    } else {
        Outcome::Return(0)
    }
}

/// Create a blank child that will return 0 from this call when started.
fn sys_exofork(kernel: &mut Kernel, caller: EnvId) -> Result<i32, SyscallError> {
    let tf = kernel.trapframe(caller).ok_or(SyscallError::BadEnv)?;
    let child = kernel.env_alloc(Some(caller))?;
    let env = kernel.envs.get_mut(child).ok_or(SyscallError::BadEnv)?;
    env.status = EnvStatus::NotRunnable;
    env.tf = tf;
    env.tf.regs.eax = 0;
    Ok(child.raw() as i32)
}

fn sys_env_set_status(kernel: &mut Kernel, caller: EnvId, envid: u32, status: u32) -> Result<i32, SyscallError> {
    let status = EnvStatus::from_syscall(status).ok_or(SyscallError::Inval)?;
    let target = kernel.envs.resolve(Some(caller), envid, true)?;
    if status == EnvStatus::Runnable {
        kernel.ipc_abort(target);
    }
    let env = kernel.envs.get_mut(target).ok_or(SyscallError::BadEnv)?;
    env.status = status;
    Ok(0)
}

/// Install a register file read from the caller's memory, forced back to
/// user mode.
fn sys_env_set_trapframe(kernel: &mut Kernel, caller: EnvId, envid: u32, tf: u32) -> Outcome {
    let target = match kernel.envs.resolve(Some(caller), envid, true) {
        Ok(target) => target,
        Err(e) => return Outcome::from(Err(e)),
    };
    let Some(buf) = user_buffer(kernel, caller, tf, Trapframe::SIZE) else {
        return Outcome::Destroyed;
    };
    let Some(mut frame) = Trapframe::from_bytes(buf.as_bytes()) else {
        return Outcome::from(Err(SyscallError::Inval));
    };
    frame.sanitize();
    kernel.ipc_abort(target);

    match kernel.envs.get_mut(target) {
        Some(env) => {
            env.tf = frame;
            Outcome::Return(0)
        }
        None => Outcome::from(Err(SyscallError::BadEnv)),
    }
}

fn sys_env_set_pgfault_upcall(kernel: &mut Kernel, caller: EnvId, envid: u32, func: u32) -> Result<i32, SyscallError> {
    let target = kernel.envs.resolve(Some(caller), envid, true)?;
    let env = kernel.envs.get_mut(target).ok_or(SyscallError::BadEnv)?;
    env.pgfault_upcall = func;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::console::BufferConsole;
    use crate::kernel::KernelConfig;
    use crate::mm::address::{UTEXT, UTOP};
    use crate::mm::PteFlags;
    use crate::sched::RoundRobin;
    use crate::trap::{FL_IF, FL_IOPL_MASK};

    const P: u32 = PteFlags::PRESENT.bits();
    const U: u32 = PteFlags::USER.bits();
    const W: u32 = PteFlags::WRITABLE.bits();

    fn call(k: &mut Kernel, id: EnvId, sys: Syscall, args: [u32; 5]) -> Outcome {
        k.syscall(id, sys as u32, args).unwrap()
    }

    #[test]
    fn test_unknown_syscall() {
        let mut k = Kernel::new(KernelConfig::default());
        let id = k.env_create(UTEXT, &[]).unwrap();
        assert_eq!(k.syscall(id, 99, [0; 5]), Ok(Outcome::Return(SyscallError::Inval.code())));
    }

    #[test]
    fn test_cputs_writes_or_destroys() {
        let console = BufferConsole::default();
        let mut k = Kernel::with_collaborators(
            KernelConfig { phys_frames: 32 },
            Box::new(RoundRobin),
            Box::new(console),
        );
        let id = k.env_create(UTEXT, &[]).unwrap();
        k.page_alloc(id, 0, UTEXT, P | U | W).unwrap();
        k.store(id, VirtAddr::new(UTEXT), b"hi").unwrap();

        assert_eq!(call(&mut k, id, Syscall::Cputs, [UTEXT, 2, 0, 0, 0]), Outcome::Return(0));
        assert_eq!(
            call(&mut k, id, Syscall::Cputs, [UTOP, 2, 0, 0, 0]),
            Outcome::Destroyed
        );
        assert!(k.env_info(id).is_none());
    }

    #[test]
    fn test_cgetc_polls_console() {
        let mut k = Kernel::with_collaborators(
            KernelConfig { phys_frames: 32 },
            Box::new(RoundRobin),
            Box::new(BufferConsole::with_input(b"q")),
        );
        let id = k.env_create(UTEXT, &[]).unwrap();
        assert_eq!(call(&mut k, id, Syscall::Cgetc, [0; 5]), Outcome::Return(i32::from(b'q')));
        assert_eq!(call(&mut k, id, Syscall::Cgetc, [0; 5]), Outcome::Return(0));
    }

    #[test]
    fn test_exofork_child_sees_zero() {
        let mut k = Kernel::new(KernelConfig { phys_frames: 32 });
        let parent = k.env_create(UTEXT, &[]).unwrap();
        let Outcome::Return(child) = call(&mut k, parent, Syscall::Exofork, [0; 5]) else {
            panic!("exofork failed");
        };
        let child = EnvId::from_raw(child as u32);

        let info = k.env_info(child).unwrap();
        assert_eq!(info.status, EnvStatus::NotRunnable);
        assert_eq!(info.parent_id, Some(parent));
        let tf = k.trapframe(child).unwrap();
        assert_eq!(tf.regs.eax, 0);
        assert_eq!(tf.eip, k.trapframe(parent).unwrap().eip);
        // no memory is copied
        assert!(k.mappings_below(child, VirtAddr::new(UTOP)).is_empty());
    }

    #[test]
    fn test_set_status_and_destroy_need_permission() {
        let mut k = Kernel::new(KernelConfig { phys_frames: 32 });
        let a = k.env_create(UTEXT, &[]).unwrap();
        let b = k.env_create(UTEXT, &[]).unwrap();

        assert_eq!(
            call(&mut k, a, Syscall::EnvSetStatus, [b.raw(), 3, 0, 0, 0]),
            Outcome::Return(SyscallError::BadEnv.code())
        );
        assert_eq!(
            call(&mut k, a, Syscall::EnvSetStatus, [0, 1, 0, 0, 0]),
            Outcome::Return(SyscallError::Inval.code())
        );
        assert_eq!(
            call(&mut k, a, Syscall::EnvDestroy, [b.raw(), 0, 0, 0, 0]),
            Outcome::Return(SyscallError::BadEnv.code())
        );
        assert_eq!(call(&mut k, a, Syscall::EnvDestroy, [0; 5]), Outcome::Destroyed);
        assert!(k.env_info(a).is_none());
    }

    #[test]
    fn test_set_trapframe_is_sanitized() {
        let mut k = Kernel::new(KernelConfig { phys_frames: 32 });
        let parent = k.env_create(UTEXT, &[]).unwrap();
        let Outcome::Return(child) = call(&mut k, parent, Syscall::Exofork, [0; 5]) else {
            panic!("exofork failed");
        };

        let mut tf = Trapframe::user(0x0080_0100, 0x1000);
        tf.cs = 0x08;
        tf.eflags = FL_IOPL_MASK;
        k.page_alloc(parent, 0, UTEXT, P | U | W).unwrap();
        k.store(parent, VirtAddr::new(UTEXT), &tf.to_bytes()).unwrap();

        let out = call(&mut k, parent, Syscall::EnvSetTrapframe, [child as u32, UTEXT, 0, 0, 0]);
        assert_eq!(out, Outcome::Return(0));
        let installed = k.trapframe(EnvId::from_raw(child as u32)).unwrap();
        assert_eq!(installed.eip, 0x0080_0100);
        assert_eq!(installed.cs & 3, 3);
        assert_eq!(installed.eflags & FL_IF, FL_IF);
        assert_eq!(installed.eflags & FL_IOPL_MASK, 0);
    }

    fn runnable_child(k: &mut Kernel, parent: EnvId) -> EnvId {
        let Outcome::Return(child) = call(k, parent, Syscall::Exofork, [0; 5]) else {
            panic!("exofork failed");
        };
        let child = EnvId::from_raw(child as u32);
        call(k, parent, Syscall::EnvSetStatus, [child.raw(), 2, 0, 0, 0]);
        child
    }

    #[test]
    fn test_woken_sender_leaves_the_list() {
        let mut k = Kernel::new(KernelConfig { phys_frames: 64 });
        let parent = k.env_create(UTEXT, &[]).unwrap();
        let r = runnable_child(&mut k, parent);
        let s1 = runnable_child(&mut k, parent);
        let s2 = runnable_child(&mut k, parent);
        let z = runnable_child(&mut k, parent);
        // the exofork return value survives being made runnable
        assert_eq!(k.trapframe(z).unwrap().regs.eax, 0);

        let send = |k: &mut Kernel, from, value| call(k, from, Syscall::IpcTrySend, [r.raw(), value, UTOP, 0, 0]);
        assert_eq!(send(&mut k, s1, 1), Outcome::Suspended);
        assert_eq!(send(&mut k, s2, 2), Outcome::Suspended);

        call(&mut k, parent, Syscall::EnvSetStatus, [s1.raw(), 2, 0, 0, 0]);
        assert_eq!(k.trapframe(s1).unwrap().regs.eax as i32, SyscallError::IpcNotRecv.code());

        assert_eq!(send(&mut k, s1, 3), Outcome::Suspended);
        assert_eq!(
            call(&mut k, parent, Syscall::EnvDestroy, [z.raw(), 0, 0, 0, 0]),
            Outcome::Return(0)
        );

        // s1 is served once, with its second offer
        assert_eq!(call(&mut k, r, Syscall::IpcRecv, [UTOP, 0, 0, 0, 0]), Outcome::Return(0));
        assert_eq!(k.env_info(r).unwrap().ipc_from, Some(s1));
        assert_eq!(k.env_info(r).unwrap().ipc_value, 3);
        assert_eq!(call(&mut k, r, Syscall::IpcRecv, [UTOP, 0, 0, 0, 0]), Outcome::Return(0));
        assert_eq!(k.env_info(r).unwrap().ipc_from, Some(s2));
        assert_eq!(call(&mut k, r, Syscall::IpcRecv, [UTOP, 0, 0, 0, 0]), Outcome::Suspended);
    }

    #[test]
    fn test_woken_receiver_stops_receiving() {
        let mut k = Kernel::new(KernelConfig { phys_frames: 64 });
        let parent = k.env_create(UTEXT, &[]).unwrap();
        let r = runnable_child(&mut k, parent);

        assert_eq!(call(&mut k, r, Syscall::IpcRecv, [UTOP, 0, 0, 0, 0]), Outcome::Suspended);
        call(&mut k, parent, Syscall::EnvSetStatus, [r.raw(), 2, 0, 0, 0]);
        let info = k.env_info(r).unwrap();
        assert_eq!(info.status, EnvStatus::Runnable);
        assert!(!info.ipc_recving);
        assert_eq!(k.trapframe(r).unwrap().regs.eax as i32, SyscallError::IpcNotRecv.code());

        // a later send waits instead of landing in the abandoned receive
        let Outcome::Suspended = call(&mut k, parent, Syscall::IpcTrySend, [r.raw(), 5, UTOP, 0, 0]) else {
            panic!("send was delivered");
        };
        assert_eq!(k.env_info(r).unwrap().ipc_from, None);
    }

    #[test]
    fn test_set_trapframe_abandons_parked_send() {
        let mut k = Kernel::new(KernelConfig { phys_frames: 64 });
        let parent = k.env_create(UTEXT, &[]).unwrap();
        let r = runnable_child(&mut k, parent);
        let s = runnable_child(&mut k, parent);
        assert_eq!(
            call(&mut k, s, Syscall::IpcTrySend, [r.raw(), 8, UTOP, 0, 0]),
            Outcome::Suspended
        );

        let tf = Trapframe::user(0x0080_0100, 0x1000);
        k.page_alloc(parent, 0, UTEXT, P | U | W).unwrap();
        k.store(parent, VirtAddr::new(UTEXT), &tf.to_bytes()).unwrap();
        assert_eq!(
            call(&mut k, parent, Syscall::EnvSetTrapframe, [s.raw(), UTEXT, 0, 0, 0]),
            Outcome::Return(0)
        );

        assert_eq!(call(&mut k, r, Syscall::IpcRecv, [UTOP, 0, 0, 0, 0]), Outcome::Suspended);
        assert_eq!(k.trapframe(s).unwrap().eip, 0x0080_0100);
    }

    #[test]
    fn test_yield_returns_zero() {
        let mut k = Kernel::new(KernelConfig { phys_frames: 32 });
        let a = k.env_create(UTEXT, &[]).unwrap();
        let b = k.env_create(UTEXT, &[]).unwrap();
        assert_eq!(call(&mut k, a, Syscall::Yield, [0; 5]), Outcome::Return(0));
        assert_eq!(k.current(), Some(b));
    }
}
