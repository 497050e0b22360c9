//! Memory management
//!
//! Provides:
//! - Address types and the fixed user layout
//! - Typed page table entries and permission bits
//! - Physical frame allocation with reference counts
//! - Per-environment address spaces
//!
//! # Security Principles
//! - All frames are zeroed on allocation
//! - A frame is freed only when its last mapping goes away
//! - Permission bits are only ever handled through `PteFlags`

pub mod address;
pub mod frame;
pub mod mapper;
pub mod paging;

pub use address::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use frame::FrameAllocator;
pub use mapper::AddressSpace;
pub use paging::{MappingError, PageTableEntry, PteFlags};
