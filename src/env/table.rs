//! Environment Table
//!
//! Fixed-capacity arena of environment records.
//!
//! # Design
//! - `NENV` slots allocated once; records are recycled, never dropped
//! - Free slots are handed out lowest index first, freed slots are reused
//!   before untouched ones
//! - Every lookup by identity checks the generation as well as the slot

use alloc::vec::Vec;

use super::{Env, EnvId, EnvStatus, IpcState, NENV};
use crate::syscall::SyscallError;
use crate::trap::Trapframe;

pub struct EnvTable {
    envs: Vec<Env>,
    /// Free slot indices; the next slot to hand out is at the end.
    free: Vec<usize>,
}

impl EnvTable {
    pub fn new() -> Self {
        let mut envs = Vec::with_capacity(NENV);
        envs.resize_with(NENV, Env::vacant);
        Self {
            envs,
            free: (0..NENV).rev().collect(),
        }
    }

    /// Take a free slot and give it a fresh identity.
    ///
    /// The new record is RUNNABLE with an empty address space and zeroed
    /// register and IPC state.
    pub fn alloc(&mut self, parent: Option<EnvId>) -> Result<EnvId, SyscallError> {
        let slot = self.free.pop().ok_or(SyscallError::NoFreeEnv)?;
        let env = &mut self.envs[slot];
        let previous = (env.id.raw() != 0).then_some(env.id);

        env.id = EnvId::next_generation(previous, slot);
        env.parent_id = parent;
        env.status = EnvStatus::Runnable;
        env.tf = Trapframe::default();
        env.pgfault_upcall = 0;
        env.ipc = IpcState::default();
        debug_assert_eq!(env.space.mapped_pages(), 0);

        Ok(env.id)
    }

    /// Return a slot to the pool. Its address space must already be empty.
    pub(crate) fn release(&mut self, id: EnvId) {
        let slot = id.slot();
        let env = &mut self.envs[slot];
        debug_assert_eq!(env.id, id);
        env.status = EnvStatus::Free;
        env.ipc = IpcState::default();
        self.free.push(slot);
    }

    /// Look up a live environment by exact identity.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        let env = self.envs.get(id.slot())?;
        (env.status != EnvStatus::Free && env.id == id).then_some(env)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let env = self.envs.get_mut(id.slot())?;
        (env.status != EnvStatus::Free && env.id == id).then_some(env)
    }

    /// Record in `slot`, whatever its state.
    pub fn slot(&self, slot: usize) -> &Env {
        &self.envs[slot]
    }

    /// All live environments in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter().filter(|e| e.status != EnvStatus::Free)
    }

    pub fn live_count(&self) -> usize {
        NENV - self.free.len()
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}
