//! Environments
//!
//! An environment is an isolated user-mode process: an address space, a
//! saved register file, a page-fault upcall, and its rendezvous IPC state.
//!
//! # Design
//! - All records live in one fixed-capacity [`EnvTable`]
//! - Identities carry a generation so stale ids are detected, never reused
//! - Parent links and IPC waiting-list links are identities, not references

mod id;
mod resolve;
mod table;

pub use id::{EnvId, LOG2NENV, NENV};
pub use table::EnvTable;

use crate::mm::address::UTOP;
use crate::mm::{AddressSpace, PteFlags, VirtAddr};
use crate::trap::Trapframe;

/// Scheduling state of an environment slot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    /// Slot unused.
    Free = 0,
    /// Being torn down.
    Dying = 1,
    /// Eligible to run.
    Runnable = 2,
    /// Parked: blocked in IPC or not yet started.
    NotRunnable = 3,
}

impl EnvStatus {
    /// Statuses user code may request through `env_set_status`.
    pub const fn from_syscall(raw: u32) -> Option<Self> {
        match raw {
            2 => Some(Self::Runnable),
            3 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// What a sender offers while it sits in a receiver's waiting list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcOffer {
    pub value: u32,
    pub srcva: VirtAddr,
    /// Raw permission word, validated at delivery time.
    pub perm: u32,
}

impl Default for IpcOffer {
    fn default() -> Self {
        Self {
            value: 0,
            srcva: VirtAddr::new(UTOP),
            perm: 0,
        }
    }
}

/// Rendezvous IPC fields of one environment.
#[derive(Debug, Clone, Copy)]
pub struct IpcState {
    /// Blocked in receive and not yet served.
    pub recving: bool,
    /// Where a received page should be mapped (at/above UTOP: no page).
    pub dstva: VirtAddr,
    /// Last delivered value.
    pub value: u32,
    /// Sender of the last delivered message.
    pub from: Option<EnvId>,
    /// Permission of the last delivered page, empty if none moved.
    pub perm: PteFlags,
    /// Head of the list of senders waiting on this environment.
    pub waiting: Option<EnvId>,
    /// Receiver whose list this environment is parked in.
    pub sending: Option<EnvId>,
    /// Next sender in that list.
    pub next: Option<EnvId>,
    /// This environment's pending send.
    pub offer: IpcOffer,
}

impl Default for IpcState {
    fn default() -> Self {
        Self {
            recving: false,
            dstva: VirtAddr::new(UTOP),
            value: 0,
            from: None,
            perm: PteFlags::empty(),
            waiting: None,
            sending: None,
            next: None,
            offer: IpcOffer::default(),
        }
    }
}

/// One environment record.
pub struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent_id: Option<EnvId>,
    pub(crate) status: EnvStatus,
    pub(crate) space: AddressSpace,
    pub(crate) tf: Trapframe,
    pub(crate) pgfault_upcall: u32,
    pub(crate) ipc: IpcState,
}

impl Env {
    pub(crate) fn vacant() -> Self {
        Self {
            id: EnvId::from_raw(0),
            parent_id: None,
            status: EnvStatus::Free,
            space: AddressSpace::new(),
            tf: Trapframe::default(),
            pgfault_upcall: 0,
            ipc: IpcState::default(),
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    /// Read-only snapshot, what user code sees of its own record.
    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status,
            pgfault_upcall: self.pgfault_upcall,
            ipc_recving: self.ipc.recving,
            ipc_from: self.ipc.from,
            ipc_value: self.ipc.value,
            ipc_perm: self.ipc.perm,
        }
    }
}

/// Read-only view of an environment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub id: EnvId,
    pub parent_id: Option<EnvId>,
    pub status: EnvStatus,
    pub pgfault_upcall: u32,
    pub ipc_recving: bool,
    pub ipc_from: Option<EnvId>,
    pub ipc_value: u32,
    pub ipc_perm: PteFlags,
}
