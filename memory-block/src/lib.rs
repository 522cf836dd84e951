//! # MemoryBlock
//!
//! Manually managed byte arenas used by the `spillway` aggregation engine. This crate
//! provides the three building blocks of its off-heap storage:
//!
//! - [`MemoryBlock`]: a fixed capacity, cache line aligned byte region with a bump
//!   allocator and offset based typed accessors
//!
//! - [`MemoryContext`]: a pool of blocks with a global capacity ceiling, shared by
//!   every consumer in the process
//!
//! - [`MemoryBlockChain`]: an ordered, growable sequence of blocks acquired on demand
//!   from a [`MemoryContext`]
//!
//! Addresses handed out by a block are plain offsets into **that** block. They are
//! never raw pointers, therefore resetting a block or returning it to the pool can not
//! leave dangling references behind: a stale address is at worst a wrong offset and
//! every access is bounds checked.
//!
//! [`MemoryBlock`]: crate::block::MemoryBlock
//! [`MemoryContext`]: crate::context::MemoryContext
//! [`MemoryBlockChain`]: crate::chain::MemoryBlockChain

pub mod block;
pub mod chain;
pub mod context;
pub mod error;
pub mod utils;

use std::fmt::Display;

/// Offset of a byte inside a single [`MemoryBlock`](crate::block::MemoryBlock)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// Create an address from the offset
    #[inline]
    pub const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// Offset of the address in its block
    #[inline]
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Returns the address `len` bytes after self
    #[inline]
    #[must_use]
    pub const fn add(self, len: usize) -> Self {
        Self(self.0 + len)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Kind of the pool a [`MemoryBlock`](crate::block::MemoryBlock) is accounted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Blocks accounted in the heap pool
    Heap,
    /// Blocks accounted in the native pool
    Native,
}

impl Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heap => write!(f, "Heap"),
            Self::Native => write!(f, "Native"),
        }
    }
}
