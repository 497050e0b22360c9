//! Scheduling collaborator
//!
//! The kernel never decides policy itself: whenever the running environment
//! gives up the processor it asks a [`Scheduler`] who is next. The only
//! input is the status field of each environment.

use crate::env::{EnvId, EnvStatus, EnvTable, NENV};

/// Picks the next environment to run.
pub trait Scheduler: Send {
    /// Choose among RUNNABLE environments. `current` is the environment
    /// giving up the processor, if it still exists.
    ///
    /// `None` means nothing is runnable and the processor idles.
    fn pick_next(&mut self, envs: &EnvTable, current: Option<EnvId>) -> Option<EnvId>;
}

/// Round-robin over table slots, starting just after the current one.
///
/// The current environment is chosen again only when nothing else is
/// runnable.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobin;

impl Scheduler for RoundRobin {
    fn pick_next(&mut self, envs: &EnvTable, current: Option<EnvId>) -> Option<EnvId> {
        let start = current.map_or(0, |id| id.slot() + 1);
        (0..NENV)
            .map(|i| envs.slot((start + i) % NENV))
            .find(|env| env.status() == EnvStatus::Runnable && Some(env.id()) != current)
            .map(|env| env.id())
            .or_else(|| {
                current.filter(|&id| {
                    envs.get(id)
                        .is_some_and(|env| env.status() == EnvStatus::Runnable)
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_rotates() {
        let mut table = EnvTable::new();
        let a = table.alloc(None).unwrap();
        let b = table.alloc(None).unwrap();
        let c = table.alloc(None).unwrap();
        table.get_mut(b).unwrap().status = EnvStatus::NotRunnable;

        let mut rr = RoundRobin;
        assert_eq!(rr.pick_next(&table, Some(a)), Some(c));
        assert_eq!(rr.pick_next(&table, Some(c)), Some(a));
        assert_eq!(rr.pick_next(&table, None), Some(a));
    }

    #[test]
    fn test_current_only_when_alone() {
        let mut table = EnvTable::new();
        let a = table.alloc(None).unwrap();
        let mut rr = RoundRobin;
        assert_eq!(rr.pick_next(&table, Some(a)), Some(a));

        table.get_mut(a).unwrap().status = EnvStatus::NotRunnable;
        assert_eq!(rr.pick_next(&table, Some(a)), None);
    }
}
