//! Environment Resolver
//!
//! Turns an untrusted identity word from a syscall argument into a live
//! environment, optionally enforcing the self-or-direct-child rule.

use log::debug;

use super::{EnvId, EnvTable};
use crate::syscall::SyscallError;

impl EnvTable {
    /// Resolve `raw` on behalf of `caller`.
    ///
    /// `0` names the caller. Fails with `BadEnv` when the slot is free or
    /// holds a different generation, and, when `checkperm` is set, when the
    /// target is neither the caller nor one of its direct children.
    pub fn resolve(
        &self,
        caller: Option<EnvId>,
        raw: u32,
        checkperm: bool,
    ) -> Result<EnvId, SyscallError> {
        if raw == EnvId::SELF {
            return caller
                .filter(|&id| self.get(id).is_some())
                .ok_or(SyscallError::BadEnv);
        }

        let id = EnvId::from_raw(raw);
        let env = self.get(id).ok_or_else(|| {
            debug!("[ENV] resolve {:08x}: no such environment", raw);
            SyscallError::BadEnv
        })?;

        if checkperm && Some(id) != caller && (caller.is_none() || env.parent_id != caller) {
            debug!("[ENV] resolve {}: permission denied to {:?}", id, caller);
            return Err(SyscallError::BadEnv);
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStatus;

    #[test]
    fn test_zero_is_caller() {
        let mut table = EnvTable::new();
        let a = table.alloc(None).unwrap();
        assert_eq!(table.resolve(Some(a), 0, false), Ok(a));
        assert_eq!(table.resolve(Some(a), 0, true), Ok(a));
        assert_eq!(table.resolve(None, 0, false), Err(SyscallError::BadEnv));
    }

    #[test]
    fn test_permission_is_self_or_direct_child() {
        let mut table = EnvTable::new();
        let parent = table.alloc(None).unwrap();
        let child = table.alloc(Some(parent)).unwrap();
        let grandchild = table.alloc(Some(child)).unwrap();
        let stranger = table.alloc(None).unwrap();

        assert_eq!(table.resolve(Some(parent), parent.raw(), true), Ok(parent));
        assert_eq!(table.resolve(Some(parent), child.raw(), true), Ok(child));
        assert_eq!(
            table.resolve(Some(parent), grandchild.raw(), true),
            Err(SyscallError::BadEnv)
        );
        assert_eq!(
            table.resolve(Some(parent), stranger.raw(), true),
            Err(SyscallError::BadEnv)
        );
        // A child has no authority over its parent.
        assert_eq!(
            table.resolve(Some(child), parent.raw(), true),
            Err(SyscallError::BadEnv)
        );
        // Without the permission check anyone can be named.
        assert_eq!(table.resolve(Some(stranger), grandchild.raw(), false), Ok(grandchild));
    }

    #[test]
    fn test_stale_and_garbage_ids() {
        let mut table = EnvTable::new();
        let a = table.alloc(None).unwrap();
        let b = table.alloc(None).unwrap();
        table.get_mut(b).unwrap().status = EnvStatus::Dying;
        table.release(b);
        let reused = table.alloc(None).unwrap();
        assert_eq!(reused.slot(), b.slot());

        assert_eq!(table.resolve(Some(a), b.raw(), false), Err(SyscallError::BadEnv));
        assert_eq!(table.resolve(Some(a), 0xDEAD_0001, false), Err(SyscallError::BadEnv));
        assert_eq!(table.resolve(Some(a), reused.raw(), false), Ok(reused));
    }
}
