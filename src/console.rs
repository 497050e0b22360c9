//! Console collaborator
//!
//! `cputs` and `cgetc` are the only syscalls that touch a device; the kernel
//! reaches it through this trait so the board's UART driver stays outside
//! the trust boundary.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

pub trait Console: Send {
    /// Write raw bytes, already copied out of user memory.
    fn write_bytes(&mut self, bytes: &[u8]);

    /// Next input byte, if one is waiting. Never blocks.
    fn read_byte(&mut self) -> Option<u8>;
}

/// Console with no device behind it: output is dropped, input never comes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConsole;

impl Console for NullConsole {
    fn write_bytes(&mut self, _bytes: &[u8]) {}

    fn read_byte(&mut self) -> Option<u8> {
        None
    }
}

/// In-memory console: records output and serves queued input.
#[derive(Debug, Default, Clone)]
pub struct BufferConsole {
    pub output: Vec<u8>,
    pub input: VecDeque<u8>,
}

impl BufferConsole {
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            output: Vec::new(),
            input: input.iter().copied().collect(),
        }
    }
}

impl Console for BufferConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}
