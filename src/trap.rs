//! Trap State
//!
//! Saved register state of an environment and the records exchanged with
//! user code when it takes a page fault.
//!
//! # Trap Kinds
//! - System call: arguments in registers, result written back to `eax`
//! - Page fault: reflected to the environment's user-level upcall
//!
//! # Security Considerations
//! - Register state installed by user code is sanitised before it can be
//!   resumed: user privilege level, interrupts on, no I/O privilege
//! - A fault that cannot be reflected destroys the environment

use bitflags::bitflags;

use crate::mm::VirtAddr;

/// Page fault trap number.
pub const T_PGFLT: u32 = 14;
/// System call trap number.
pub const T_SYSCALL: u32 = 48;

/// User code segment selector (privilege level 3).
pub const GD_UT: u32 = 0x18 | 3;
/// User data segment selector (privilege level 3).
pub const GD_UD: u32 = 0x20 | 3;

/// Interrupt enable flag.
pub const FL_IF: u32 = 0x0000_0200;
/// I/O privilege level mask.
pub const FL_IOPL_MASK: u32 = 0x0000_3000;

bitflags! {
    /// Page fault error code.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FaultCode: u32 {
        /// The page was present: this is a protection violation.
        const PROTECTION = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

/// General purpose registers, in push order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushRegs {
    const WORDS: usize = 8;

    fn to_words(self) -> [u32; Self::WORDS] {
        [
            self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax,
        ]
    }

    fn from_words(w: &[u32]) -> Self {
        Self {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            oesp: w[3],
            ebx: w[4],
            edx: w[5],
            ecx: w[6],
            eax: w[7],
        }
    }
}

/// Saved register state of an environment.
///
/// While an environment is not running this is its complete resumption
/// state: a blocked syscall completes when someone writes `regs.eax` and
/// makes the environment runnable again.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl Trapframe {
    const WORDS: usize = PushRegs::WORDS + 7;
    /// Size of the in-memory representation user code hands to the kernel.
    pub const SIZE: usize = Self::WORDS * 4;

    /// Fresh user-mode state starting at `entry` with stack top `esp`.
    pub fn user(entry: u32, esp: u32) -> Self {
        Self {
            eip: entry,
            esp,
            cs: GD_UT,
            ss: GD_UD,
            eflags: FL_IF,
            ..Self::default()
        }
    }

    /// Force the frame to resume in user mode with interrupts enabled and
    /// no I/O privilege.
    pub fn sanitize(&mut self) {
        self.cs |= 3;
        self.ss |= 3;
        self.eflags |= FL_IF;
        self.eflags &= !FL_IOPL_MASK;
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u32; Self::WORDS];
        words[..PushRegs::WORDS].copy_from_slice(&self.regs.to_words());
        words[PushRegs::WORDS..].copy_from_slice(&[
            self.trapno,
            self.err,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.ss,
        ]);
        words_to_bytes(&words)
    }

    /// Decode a frame read from user memory. `bytes` must hold at least
    /// [`Trapframe::SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let w: [u32; Self::WORDS] = bytes_to_words(bytes)?;
        let r = PushRegs::WORDS;
        Some(Self {
            regs: PushRegs::from_words(&w[..r]),
            trapno: w[r],
            err: w[r + 1],
            eip: w[r + 2],
            cs: w[r + 3],
            eflags: w[r + 4],
            esp: w[r + 5],
            ss: w[r + 6],
        })
    }
}

/// Fault record pushed on the user exception stack for the upcall.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl UTrapframe {
    const WORDS: usize = PushRegs::WORDS + 5;
    pub const SIZE: usize = Self::WORDS * 4;

    /// Record for a fault at `fault` taken with trap-time state `tf`.
    pub fn new(fault: &PageFault, tf: &Trapframe) -> Self {
        Self {
            fault_va: fault.va.as_u32(),
            err: fault.code.bits(),
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        }
    }

    pub fn code(&self) -> FaultCode {
        FaultCode::from_bits_truncate(self.err)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u32; Self::WORDS];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..2 + PushRegs::WORDS].copy_from_slice(&self.regs.to_words());
        words[2 + PushRegs::WORDS..].copy_from_slice(&[self.eip, self.eflags, self.esp]);
        words_to_bytes(&words)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let w: [u32; Self::WORDS] = bytes_to_words(bytes)?;
        let r = 2 + PushRegs::WORDS;
        Some(Self {
            fault_va: w[0],
            err: w[1],
            regs: PushRegs::from_words(&w[2..r]),
            eip: w[r],
            eflags: w[r + 1],
            esp: w[r + 2],
        })
    }
}

/// A user-mode access the MMU refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub va: VirtAddr,
    pub code: FaultCode,
}

fn words_to_bytes<const W: usize, const B: usize>(words: &[u32; W]) -> [u8; B] {
    let mut out = [0u8; B];
    for (chunk, word) in out.chunks_exact_mut(4).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn bytes_to_words<const W: usize>(bytes: &[u8]) -> Option<[u32; W]> {
    if bytes.len() < W * 4 {
        return None;
    }
    let mut out = [0u32; W];
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(out)
}
