//! envkern - Exokernel Environment Trust Boundary
//!
//! The privileged core of a small exokernel: isolated user environments,
//! the page-mapping syscalls they build their own memory management on,
//! synchronous rendezvous IPC, and the user-level library that turns those
//! primitives into copy-on-write fork.
//!
//! # Security Features
//! - Every syscall argument is untrusted; identities, addresses and
//!   permission words are validated before use
//! - Environments may only manage themselves and their direct children
//! - Frames are reference counted across every address space mapping them
//! - Failing operations have no side effects
//!
//! # Architecture
//! - Target: 32-bit two-level paging, 4 KiB pages
//! - One big kernel lock around [`kernel::Kernel`]
//! - Scheduling and console I/O are collaborators behind traits
//! - [`user`] is the library OS linked into every environment

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod console;
pub mod env;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod user;

pub use env::{EnvId, EnvInfo, EnvStatus};
pub use kernel::{Kernel, KernelConfig};
pub use syscall::{Outcome, Syscall, SyscallError};

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
