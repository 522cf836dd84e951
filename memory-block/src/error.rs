//! Errors raised by the memory blocks

use snafu::Snafu;

use crate::MemoryType;
use crate::block::BlockId;
use crate::context::ContextId;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MemoryError {
    #[snafu(display(
        "Memory block `{block}` can not allocate `{requested}` bytes, only `{available}` of `{capacity}` bytes left"
    ))]
    BlockExhausted {
        block: BlockId,
        requested: usize,
        available: usize,
        capacity: usize,
    },
    #[snafu(display(
        "`{memory_type}` memory pool is exhausted: `{used}` of `{capacity}` bytes are in use, can not acquire a block with `{block_size}` bytes"
    ))]
    PoolExhausted {
        memory_type: MemoryType,
        used: usize,
        capacity: usize,
        block_size: usize,
    },
    #[snafu(display("Memory block chain does not hold any block"))]
    EmptyChain,
    #[snafu(display("Memory block `{block}` does not belong to the memory context `{context}`"))]
    ForeignBlock { block: BlockId, context: ContextId },
    #[snafu(display("Invalid memory context config: {reason}"))]
    InvalidConfig { reason: String },
}

impl MemoryError {
    /// Returns true if the error means that there is no room left, either in a single
    /// block or in the pool. Caller can recover from it by switching to another block
    /// or releasing memory
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::BlockExhausted { .. } | Self::PoolExhausted { .. } | Self::EmptyChain
        )
    }
}

/// Result type of the memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;
