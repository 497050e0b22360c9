//! Kernel State
//!
//! The single privileged value: environment table, frame pool, the running
//! environment and the two collaborators. One CPU executes kernel code at a
//! time; embedders wrap the kernel in a `spin::Mutex` and every entry from
//! user mode goes through it.
//!
//! # Entry Points
//! - [`Kernel::syscall`]: trap with a system call number and five argument
//!   words
//! - [`Kernel::page_fault`]: reflect an MMU fault to the user upcall
//! - [`Kernel::env_create`]: load a program image into a fresh environment

mod memory;
mod pages;

pub use memory::{AccessError, FaultOutcome};

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, info, trace, warn};

use crate::console::{Console, NullConsole};
use crate::env::{EnvId, EnvInfo, EnvStatus, EnvTable};
use crate::mm::address::{USTACKTOP, UTOP};
use crate::mm::{FrameAllocator, PageTableEntry, PteFlags, VirtAddr, PAGE_SIZE};
use crate::sched::{RoundRobin, Scheduler};
use crate::syscall::{self, Outcome, SyscallError};
use crate::trap::{Trapframe, T_SYSCALL};

/// Runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical frames available to environments and their page tables.
    pub phys_frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        // 64 MiB
        Self { phys_frames: 16384 }
    }
}

/// Why an environment could not be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// No live environment has this identity.
    Gone,
    /// The environment exists but is parked.
    NotRunnable,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone => write!(f, "environment does not exist"),
            Self::NotRunnable => write!(f, "environment is not runnable"),
        }
    }
}

/// One loadable piece of a program image.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Start address; need not be page-aligned.
    pub va: VirtAddr,
    /// Initialised contents.
    pub data: &'a [u8],
    /// Size in memory; the tail past `data` is zero-filled.
    pub mem_size: usize,
    /// Mapping permission for every page the segment covers.
    pub perm: PteFlags,
}

pub struct Kernel {
    pub(crate) envs: EnvTable,
    pub(crate) frames: FrameAllocator,
    pub(crate) curenv: Option<EnvId>,
    sched: Box<dyn Scheduler>,
    pub(crate) console: Box<dyn Console>,
}

impl Kernel {
    /// Kernel with round-robin scheduling and no console device.
    pub fn new(config: KernelConfig) -> Self {
        Self::with_collaborators(config, Box::new(RoundRobin), Box::new(NullConsole))
    }

    pub fn with_collaborators(
        config: KernelConfig,
        sched: Box<dyn Scheduler>,
        console: Box<dyn Console>,
    ) -> Self {
        info!("[MM] {} frames available", config.phys_frames);
        Self {
            envs: EnvTable::new(),
            frames: FrameAllocator::new(config.phys_frames),
            curenv: None,
            sched,
            console,
        }
    }

    /// The environment currently holding the processor.
    pub fn current(&self) -> Option<EnvId> {
        self.curenv
    }

    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        self.envs.get(id).map(|env| env.info())
    }

    pub fn trapframe(&self, id: EnvId) -> Option<Trapframe> {
        self.envs.get(id).map(|env| env.tf)
    }

    /// Page table entry for `va` in `id`'s address space.
    pub fn lookup_pte(&self, id: EnvId, va: VirtAddr) -> Option<PageTableEntry> {
        self.envs.get(id)?.space.lookup(va.align_down())
    }

    /// Every user mapping of `id` below `limit`, as exposed read-only at
    /// `UVPT`.
    pub fn mappings_below(&self, id: EnvId, limit: VirtAddr) -> Vec<(VirtAddr, PageTableEntry)> {
        self.envs
            .get(id)
            .map(|env| env.space.mappings_below(limit))
            .unwrap_or_default()
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn live_envs(&self) -> usize {
        self.envs.live_count()
    }

    /// Give the processor to `id`.
    pub fn run(&mut self, id: EnvId) -> Result<(), RunError> {
        let env = self.envs.get(id).ok_or(RunError::Gone)?;
        if env.status != EnvStatus::Runnable {
            return Err(RunError::NotRunnable);
        }
        if self.curenv != Some(id) {
            trace!("[ENV] switch to {}", id);
            self.curenv = Some(id);
        }
        Ok(())
    }

    /// Ask the scheduler for the next environment.
    pub fn yield_cpu(&mut self) -> Option<EnvId> {
        let next = self.sched.pick_next(&self.envs, self.curenv);
        trace!("[ENV] yield {:?} -> {:?}", self.curenv, next);
        self.curenv = next;
        next
    }

    /// Mark `id` not runnable and give up the processor. Its saved trap
    /// frame is the continuation.
    pub(crate) fn park(&mut self, id: EnvId) {
        if let Some(env) = self.envs.get_mut(id) {
            env.status = EnvStatus::NotRunnable;
        }
        if self.curenv == Some(id) {
            self.yield_cpu();
        }
    }

    /// Allocate an environment with an empty address space.
    pub fn env_alloc(&mut self, parent: Option<EnvId>) -> Result<EnvId, SyscallError> {
        let id = self.envs.alloc(parent)?;
        info!("[ENV] new env {} (parent {:?})", id, parent);
        Ok(id)
    }

    /// Create a parentless environment from a program image.
    ///
    /// Maps every segment plus one stack page below `USTACKTOP`; execution
    /// starts at `entry`.
    pub fn env_create(&mut self, entry: u32, segments: &[Segment<'_>]) -> Result<EnvId, SyscallError> {
        let id = self.env_alloc(None)?;
        if let Err(e) = self.load_image(id, entry, segments) {
            warn!("[ENV] loading {} failed: {}", id, e);
            self.env_destroy(id);
            return Err(e);
        }
        Ok(id)
    }

    fn load_image(&mut self, id: EnvId, entry: u32, segments: &[Segment<'_>]) -> Result<(), SyscallError> {
        for seg in segments {
            if seg.data.len() > seg.mem_size {
                return Err(SyscallError::Inval);
            }
            let end = seg
                .va
                .as_usize()
                .checked_add(seg.mem_size)
                .filter(|&end| end <= UTOP as usize)
                .ok_or(SyscallError::Inval)?;
            let mut page = seg.va.align_down().as_usize();
            while page < end {
                self.map_fresh(id, VirtAddr::new(page as u32), seg.perm)?;
                page += PAGE_SIZE;
            }
            let env = self.envs.get(id).ok_or(SyscallError::BadEnv)?;
            env.space
                .write(&mut self.frames, seg.va, seg.data)
                .map_err(|_| SyscallError::Fault)?;
        }

        let stack = VirtAddr::new(USTACKTOP - PAGE_SIZE as u32);
        self.map_fresh(id, stack, PteFlags::USER_RW)?;

        let env = self.envs.get_mut(id).ok_or(SyscallError::BadEnv)?;
        env.tf = Trapframe::user(entry, USTACKTOP);
        debug!("[ENV] {} loaded, entry {:#x}", id, entry);
        Ok(())
    }

    /// Install a zeroed page at `va` unless one is already there.
    fn map_fresh(&mut self, id: EnvId, va: VirtAddr, perm: PteFlags) -> Result<(), SyscallError> {
        let env = self.envs.get_mut(id).ok_or(SyscallError::BadEnv)?;
        if env.space.lookup(va).is_some() {
            return Ok(());
        }
        let frame = self.frames.alloc().ok_or(SyscallError::NoMem)?;
        if let Err(e) = env.space.insert(&mut self.frames, va, frame, perm) {
            self.frames.free(frame);
            return Err(e.into());
        }
        Ok(())
    }

    /// Tear down `id`: leave every IPC waiting list, fail senders parked on
    /// it, release its memory and its slot.
    pub fn env_destroy(&mut self, id: EnvId) {
        let Some(env) = self.envs.get_mut(id) else {
            return;
        };
        env.status = EnvStatus::Dying;
        info!("[ENV] destroying {}", id);

        self.unlink_sender(id);
        self.fail_waiters(id);

        if let Some(env) = self.envs.get_mut(id) {
            env.space.clear(&mut self.frames);
        }
        self.envs.release(id);

        if self.curenv == Some(id) {
            self.yield_cpu();
        }
    }

    /// Enter the kernel from `id` with a system call.
    ///
    /// The result register of the caller is written here for calls that
    /// complete, and at wake-up for calls that suspend.
    pub fn syscall(&mut self, id: EnvId, num: u32, args: [u32; 5]) -> Result<Outcome, RunError> {
        self.run(id)?;
        if let Some(env) = self.envs.get_mut(id) {
            let regs = &mut env.tf.regs;
            regs.eax = num;
            regs.edx = args[0];
            regs.ecx = args[1];
            regs.ebx = args[2];
            regs.edi = args[3];
            regs.esi = args[4];
            env.tf.trapno = T_SYSCALL;
        }

        let outcome = syscall::dispatch(self, num, args);

        if let Outcome::Return(value) = outcome {
            if let Some(env) = self.envs.get_mut(id) {
                env.tf.regs.eax = value as u32;
            }
        }
        Ok(outcome)
    }
}
