//! IPC Wrappers
//!
//! Library side of rendezvous IPC. A call that has to wait for its peer
//! returns [`UserError::Blocked`]; the matching `finish_*` function collects
//! the result once the environment runs again.

use super::{check, Process, UserError};
use crate::env::EnvId;
use crate::mm::address::UTOP;
use crate::mm::{PteFlags, VirtAddr};
use crate::syscall::SyscallError;

/// A delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub from: EnvId,
    pub value: u32,
    /// Permission of the page mapped at the receive address, empty if no
    /// page was transferred.
    pub perm: PteFlags,
}

/// Send `value`, and optionally the page at `page.0` with permission
/// `page.1`, to `to`.
pub fn ipc_send(
    p: &Process<'_>,
    to: EnvId,
    value: u32,
    page: Option<(VirtAddr, PteFlags)>,
) -> Result<(), UserError> {
    let (srcva, perm) = page.map_or((UTOP, 0), |(va, perm)| (va.as_u32(), perm.bits()));
    p.sys_ipc_try_send(to.raw(), value, srcva, perm)
}

/// Result of a send that blocked.
pub fn finish_send(p: &Process<'_>) -> Result<(), UserError> {
    check(p.resume()?).map(|_| ())
}

/// Receive a message, accepting a page at `page` if given.
pub fn ipc_recv(p: &Process<'_>, page: Option<VirtAddr>) -> Result<Received, UserError> {
    let dstva = page.map_or(UTOP, VirtAddr::as_u32);
    p.sys_ipc_recv(dstva)?;
    received(p)
}

/// Result of a receive that blocked.
pub fn finish_recv(p: &Process<'_>) -> Result<Received, UserError> {
    check(p.resume()?)?;
    received(p)
}

fn received(p: &Process<'_>) -> Result<Received, UserError> {
    let info = p.env_info()?;
    Ok(Received {
        from: info.ipc_from.ok_or(SyscallError::Unspecified)?,
        value: info.ipc_value,
        perm: info.ipc_perm,
    })
}

#[cfg(test)]
mod tests {
    use spin::Mutex;

    use super::*;
    use crate::kernel::{Kernel, KernelConfig};

    #[test]
    fn test_blocked_send_completes_on_recv() {
        let k = Mutex::new(Kernel::new(KernelConfig { phys_frames: 64 }));
        let a = Process::boot(&k).unwrap();
        let b = Process::boot(&k).unwrap();

        assert_eq!(ipc_send(&b, a.id(), 9, None), Err(UserError::Blocked));
        assert_eq!(finish_send(&b), Err(UserError::Blocked));

        let msg = ipc_recv(&a, None).unwrap();
        assert_eq!(msg.from, b.id());
        assert_eq!(msg.value, 9);
        assert_eq!(finish_send(&b), Ok(()));
    }

    #[test]
    fn test_send_to_destroyed_receiver() {
        let k = Mutex::new(Kernel::new(KernelConfig { phys_frames: 64 }));
        let a = Process::boot(&k).unwrap();
        let b = Process::boot(&k).unwrap();

        assert_eq!(ipc_send(&b, a.id(), 1, None), Err(UserError::Blocked));
        a.exit();
        assert_eq!(finish_send(&b), Err(UserError::Sys(SyscallError::IpcNotRecv)));
        assert_eq!(
            ipc_send(&b, a.id(), 1, None),
            Err(UserError::Sys(SyscallError::BadEnv))
        );
    }
}
