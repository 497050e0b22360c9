//! IPC Rendezvous Channel
//!
//! Synchronous message passing: one 32-bit value and optionally one page
//! mapping per message.
//!
//! # Design
//! - Senders queue themselves on the receiver; the list is singly linked
//!   through the senders' own records, and a sender is in at most one list
//! - New senders go to the head, so service order is LIFO
//! - A sender whose receiver is not waiting parks; it is never told to retry
//! - A delivery either completes fully or changes nothing but the list
//!
//! # Wake-up Rules
//! - Parked sender: woken with the delivery's result, success or failure
//! - Parked receiver: woken with 0, only on success
//! - Either side made runnable by its parent instead: leaves the list or
//!   stops receiving, and sees `IpcNotRecv`

use log::{debug, trace};

use crate::env::{EnvId, EnvStatus, IpcOffer, NENV};
use crate::kernel::Kernel;
use crate::mm::{PteFlags, VirtAddr};
use crate::syscall::{Outcome, SyscallError};

impl Kernel {
    /// Offer `value`, and the page at `srcva` if below `UTOP`, to `envid`.
    pub fn ipc_try_send(&mut self, caller: EnvId, envid: u32, value: u32, srcva: u32, perm: u32) -> Outcome {
        let dst = match self.envs.resolve(Some(caller), envid, false) {
            Ok(dst) => dst,
            Err(e) => return Outcome::from(Err(e)),
        };

        // a sender sits in at most one list
        self.unlink_sender(caller);

        let head = match self.envs.get(dst) {
            Some(env) => env.ipc.waiting,
            None => return Outcome::from(Err(SyscallError::BadEnv)),
        };
        if let Some(sender) = self.envs.get_mut(caller) {
            sender.ipc.sending = Some(dst);
            sender.ipc.next = head;
            sender.ipc.offer = IpcOffer {
                value,
                srcva: VirtAddr::new(srcva),
                perm,
            };
        }

        let recving = match self.envs.get_mut(dst) {
            Some(env) => {
                env.ipc.waiting = Some(caller);
                env.ipc.recving
            }
            None => false,
        };

        if !recving {
            trace!("[IPC] {} -> {}: receiver busy, parking", caller, dst);
            self.park(caller);
            return Outcome::Suspended;
        }

        Outcome::from(self.deliver(dst).map(|()| 0))
    }

    /// Wait for a message, accepting a page at `dstva` if below `UTOP`.
    pub fn ipc_recv(&mut self, caller: EnvId, dstva: u32) -> Outcome {
        let dstva = VirtAddr::new(dstva);
        if dstva.is_user() && !dstva.is_aligned() {
            debug!("[IPC] recv: misaligned dstva {}", dstva);
            return Outcome::from(Err(SyscallError::Inval));
        }

        let Some(env) = self.envs.get_mut(caller) else {
            return Outcome::from(Err(SyscallError::BadEnv));
        };
        env.ipc.recving = true;
        env.ipc.dstva = dstva;

        while self.envs.get(caller).is_some_and(|env| env.ipc.waiting.is_some()) {
            if self.deliver(caller).is_ok() {
                return Outcome::Return(0);
            }
        }

        trace!("[IPC] {} waiting", caller);
        self.park(caller);
        Outcome::Suspended
    }

    /// Serve the sender at the head of `dst`'s list.
    ///
    /// The sender is popped whatever the result; `dst` keeps receiving if
    /// the delivery fails.
    fn deliver(&mut self, dst: EnvId) -> Result<(), SyscallError> {
        let (src, dstva) = {
            let env = self.envs.get(dst).ok_or(SyscallError::BadEnv)?;
            (env.ipc.waiting.ok_or(SyscallError::Unspecified)?, env.ipc.dstva)
        };
        let offer = {
            let sender = self.envs.get_mut(src).ok_or(SyscallError::BadEnv)?;
            sender.ipc.sending = None;
            let next = sender.ipc.next.take();
            let offer = sender.ipc.offer;
            if let Some(env) = self.envs.get_mut(dst) {
                env.ipc.waiting = next;
            }
            offer
        };

        let result = if offer.srcva.is_user() && dstva.is_user() {
            self.transfer_page(src, offer.srcva, dst, dstva, offer.perm)
        } else {
            Ok(PteFlags::empty())
        };

        if let (Ok(perm), Some(env)) = (result, self.envs.get_mut(dst)) {
            env.ipc.recving = false;
            env.ipc.from = Some(src);
            env.ipc.value = offer.value;
            env.ipc.perm = perm;
            if env.status == EnvStatus::NotRunnable {
                env.status = EnvStatus::Runnable;
                env.tf.regs.eax = 0;
            }
        }

        let code = result.map_or_else(SyscallError::code, |_| 0);
        if let Some(sender) = self.envs.get_mut(src) {
            if sender.status == EnvStatus::NotRunnable {
                sender.status = EnvStatus::Runnable;
                sender.tf.regs.eax = code as u32;
            }
        }

        match result {
            Ok(_) => debug!("[IPC] {} -> {}: value {:#x}", src, dst, offer.value),
            Err(e) => debug!("[IPC] {} -> {}: failed: {}", src, dst, e),
        }
        result.map(|_| ())
    }

    /// Take `sender` out of the list it is parked in, if any.
    pub(crate) fn unlink_sender(&mut self, sender: EnvId) {
        let Some((receiver, next)) = self
            .envs
            .get_mut(sender)
            .and_then(|env| Some((env.ipc.sending.take()?, env.ipc.next.take())))
        else {
            return;
        };

        let mut prev: Option<EnvId> = None;
        let mut cur = self.envs.get(receiver).and_then(|env| env.ipc.waiting);
        for _ in 0..NENV {
            let Some(id) = cur else {
                break;
            };
            if id == sender {
                match prev.and_then(|p| self.envs.get_mut(p)) {
                    Some(p) => p.ipc.next = next,
                    None => {
                        if let Some(r) = self.envs.get_mut(receiver) {
                            r.ipc.waiting = next;
                        }
                    }
                }
                trace!("[IPC] {} left the list of {}", sender, receiver);
                return;
            }
            prev = cur;
            cur = self.envs.get(id).and_then(|env| env.ipc.next);
        }
    }

    /// Abandon whatever IPC call `id` is parked in, so it can be resumed
    /// by other means. A parked caller sees `IpcNotRecv`.
    pub(crate) fn ipc_abort(&mut self, id: EnvId) {
        let parked = self.envs.get(id).is_some_and(|env| {
            env.status == EnvStatus::NotRunnable && (env.ipc.recving || env.ipc.sending.is_some())
        });
        self.unlink_sender(id);
        if let Some(env) = self.envs.get_mut(id) {
            env.ipc.recving = false;
            if parked {
                env.tf.regs.eax = SyscallError::IpcNotRecv.code() as u32;
                debug!("[IPC] {}: call abandoned", id);
            }
        }
    }

    /// Wake every sender parked on `receiver` with `IpcNotRecv`.
    pub(crate) fn fail_waiters(&mut self, receiver: EnvId) {
        let mut cur = self
            .envs
            .get_mut(receiver)
            .and_then(|env| env.ipc.waiting.take());
        for _ in 0..NENV {
            let Some(id) = cur else {
                break;
            };
            let Some(sender) = self.envs.get_mut(id) else {
                break;
            };
            sender.ipc.sending = None;
            cur = sender.ipc.next.take();
            if sender.status == EnvStatus::NotRunnable {
                sender.status = EnvStatus::Runnable;
                sender.tf.regs.eax = SyscallError::IpcNotRecv.code() as u32;
                debug!("[IPC] {}: receiver {} destroyed", id, receiver);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::mm::address::UTOP;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig { phys_frames: 32 })
    }

    fn status(k: &Kernel, id: EnvId) -> EnvStatus {
        k.env_info(id).unwrap().status
    }

    #[test]
    fn test_send_then_recv() {
        let mut k = kernel();
        let a = k.env_alloc(None).unwrap();
        let b = k.env_alloc(None).unwrap();

        assert_eq!(k.ipc_try_send(b, a.raw(), 42, UTOP, 0), Outcome::Suspended);
        assert_eq!(status(&k, b), EnvStatus::NotRunnable);

        assert_eq!(k.ipc_recv(a, UTOP), Outcome::Return(0));
        let info = k.env_info(a).unwrap();
        assert_eq!(info.ipc_value, 42);
        assert_eq!(info.ipc_from, Some(b));
        assert!(info.ipc_perm.is_empty());
        assert!(!info.ipc_recving);

        assert_eq!(status(&k, b), EnvStatus::Runnable);
        assert_eq!(k.trapframe(b).unwrap().regs.eax, 0);
    }

    #[test]
    fn test_recv_then_send() {
        let mut k = kernel();
        let a = k.env_alloc(None).unwrap();
        let b = k.env_alloc(None).unwrap();

        assert_eq!(k.ipc_recv(a, UTOP), Outcome::Suspended);
        assert_eq!(status(&k, a), EnvStatus::NotRunnable);
        assert_eq!(k.ipc_try_send(b, a.raw(), 7, UTOP, 0), Outcome::Return(0));
        assert_eq!(status(&k, a), EnvStatus::Runnable);
        assert_eq!(k.trapframe(a).unwrap().regs.eax, 0);
        assert_eq!(k.env_info(a).unwrap().ipc_value, 7);
    }

    #[test]
    fn test_lifo_service_order() {
        let mut k = kernel();
        let r = k.env_alloc(None).unwrap();
        let first = k.env_alloc(None).unwrap();
        let second = k.env_alloc(None).unwrap();

        k.ipc_try_send(first, r.raw(), 1, UTOP, 0);
        k.ipc_try_send(second, r.raw(), 2, UTOP, 0);

        assert_eq!(k.ipc_recv(r, UTOP), Outcome::Return(0));
        assert_eq!(k.env_info(r).unwrap().ipc_from, Some(second));
        assert_eq!(k.ipc_recv(r, UTOP), Outcome::Return(0));
        assert_eq!(k.env_info(r).unwrap().ipc_from, Some(first));
    }

    #[test]
    fn test_failed_delivery_wakes_sender_with_error() {
        let mut k = kernel();
        let r = k.env_alloc(None).unwrap();
        let s = k.env_alloc(None).unwrap();

        // nothing mapped at the offered address
        k.ipc_try_send(s, r.raw(), 1, 0x0080_0000, PteFlags::MANDATORY.bits());
        assert_eq!(k.ipc_recv(r, 0x0080_0000), Outcome::Suspended);
        assert_eq!(k.trapframe(s).unwrap().regs.eax as i32, SyscallError::Inval.code());
        assert_eq!(status(&k, s), EnvStatus::Runnable);
        assert!(k.env_info(r).unwrap().ipc_recving);
    }

    #[test]
    fn test_recv_rejects_misaligned_dstva() {
        let mut k = kernel();
        let a = k.env_alloc(None).unwrap();
        assert_eq!(k.ipc_recv(a, 0x0080_0004), Outcome::Return(SyscallError::Inval.code()));
        assert!(!k.env_info(a).unwrap().ipc_recving);
        assert_eq!(k.ipc_try_send(a, 0xBAD, 0, UTOP, 0), Outcome::Return(SyscallError::BadEnv.code()));
    }

    #[test]
    fn test_destroy_unlinks_and_fails_waiters() {
        let mut k = kernel();
        let r = k.env_alloc(None).unwrap();
        let a = k.env_alloc(None).unwrap();
        let b = k.env_alloc(None).unwrap();
        let c = k.env_alloc(None).unwrap();

        k.ipc_try_send(a, r.raw(), 1, UTOP, 0);
        k.ipc_try_send(b, r.raw(), 2, UTOP, 0);
        k.ipc_try_send(c, r.raw(), 3, UTOP, 0);

        // list is c, b, a; drop the middle one
        k.env_destroy(b);
        assert_eq!(k.ipc_recv(r, UTOP), Outcome::Return(0));
        assert_eq!(k.env_info(r).unwrap().ipc_from, Some(c));

        k.env_destroy(r);
        assert_eq!(status(&k, a), EnvStatus::Runnable);
        assert_eq!(k.trapframe(a).unwrap().regs.eax as i32, SyscallError::IpcNotRecv.code());
    }
}
