//! System Call Interface
//!
//! The only way user environments reach the kernel.
//!
//! # Security Model
//! - Whitelist approach: only explicitly implemented syscalls are allowed
//! - All parameters are validated before use
//! - Invalid buffers destroy the caller; every other violation is an error
//!   code, never a panic
//!
//! # ABI
//! Syscall number plus five 32-bit argument words in, one signed 32-bit
//! result out. Negative results are [`SyscallError`] codes.

mod handler;
mod validate;

pub use handler::dispatch;
pub use validate::{user_mem_check, UserBuffer};

use core::fmt;

/// System call numbers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Cputs = 0,
    Cgetc = 1,
    GetEnvId = 2,
    EnvDestroy = 3,
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetTrapframe = 9,
    EnvSetPgfaultUpcall = 10,
    Yield = 11,
    IpcTrySend = 12,
    IpcRecv = 13,
}

impl Syscall {
    pub const fn from_number(num: u32) -> Option<Self> {
        Some(match num {
            0 => Self::Cputs,
            1 => Self::Cgetc,
            2 => Self::GetEnvId,
            3 => Self::EnvDestroy,
            4 => Self::PageAlloc,
            5 => Self::PageMap,
            6 => Self::PageUnmap,
            7 => Self::Exofork,
            8 => Self::EnvSetStatus,
            9 => Self::EnvSetTrapframe,
            10 => Self::EnvSetPgfaultUpcall,
            11 => Self::Yield,
            12 => Self::IpcTrySend,
            13 => Self::IpcRecv,
            _ => return None,
        })
    }
}

/// System call error codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Unspecified or unknown problem
    Unspecified = -1,
    /// Environment doesn't exist or otherwise cannot be used
    BadEnv = -2,
    /// Invalid parameter
    Inval = -3,
    /// Request failed due to memory shortage
    NoMem = -4,
    /// Attempt to create a new environment beyond the maximum allowed
    NoFreeEnv = -5,
    /// Memory fault
    Fault = -6,
    /// The receiver was not there to take the message
    IpcNotRecv = -7,
}

impl SyscallError {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Map a negative syscall result back to its error.
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::Unspecified,
            -2 => Self::BadEnv,
            -3 => Self::Inval,
            -4 => Self::NoMem,
            -5 => Self::NoFreeEnv,
            -6 => Self::Fault,
            -7 => Self::IpcNotRecv,
            _ => return None,
        })
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "unspecified error"),
            Self::BadEnv => write!(f, "bad environment"),
            Self::Inval => write!(f, "invalid parameter"),
            Self::NoMem => write!(f, "out of memory"),
            Self::NoFreeEnv => write!(f, "out of environments"),
            Self::Fault => write!(f, "segmentation fault"),
            Self::IpcNotRecv => write!(f, "env is not recving"),
        }
    }
}

impl From<crate::mm::MappingError> for SyscallError {
    fn from(err: crate::mm::MappingError) -> Self {
        use crate::mm::MappingError;
        match err {
            MappingError::OutOfMemory => Self::NoMem,
            MappingError::NotMapped | MappingError::BadAddress | MappingError::InvalidPermissions => {
                Self::Inval
            }
        }
    }
}

/// What a trap into the kernel did to the calling environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call completed; the value is in the caller's `eax`.
    Return(i32),
    /// The caller is parked. Its `eax` is written when it is woken.
    Suspended,
    /// The caller no longer exists.
    Destroyed,
}

impl From<Result<i32, SyscallError>> for Outcome {
    fn from(result: Result<i32, SyscallError>) -> Self {
        match result {
            Ok(v) => Self::Return(v),
            Err(e) => Self::Return(e.code()),
        }
    }
}
