//! Pool of [`MemoryBlock`]s with a capacity ceiling

use std::alloc::Layout;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use snafu::ensure;

use crate::MemoryType;
use crate::block::{BlockId, MemoryBlock};
use crate::error::{ForeignBlockSnafu, InvalidConfigSnafu, PoolExhaustedSnafu, Result};
use crate::utils::{CACHE_LINE_SIZE, roundup_to_multiple_of_pow_of_two_base};

/// Identifier of the [`MemoryContext`], unique in the process
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u64);

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration of the [`MemoryContext`]
#[derive(Debug, Clone)]
pub struct MemoryContextConfig {
    /// Size of each block in bytes, rounded up to the cache line size
    pub block_size: usize,
    /// Maximal number of bytes the blocks of the heap pool can hold
    pub heap_capacity: usize,
    /// Maximal number of bytes the blocks of the native pool can hold
    pub native_capacity: usize,
}

impl Default for MemoryContextConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            heap_capacity: 256 * 1024 * 1024,
            native_capacity: 0,
        }
    }
}

#[derive(Debug)]
struct Pool {
    capacity: usize,
    /// Bytes held by the blocks that are handed out
    used: usize,
    /// Blocks that are returned to the pool and can be reused
    free: Vec<MemoryBlock>,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            free: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Pools {
    heap: Pool,
    native: Pool,
    next_block_id: u64,
}

impl Pools {
    fn pool_mut(&mut self, memory_type: MemoryType) -> &mut Pool {
        match memory_type {
            MemoryType::Heap => &mut self.heap,
            MemoryType::Native => &mut self.native,
        }
    }
}

/// [`MemoryContext`] is the process wide source of [`MemoryBlock`]s. It accounts the
/// blocks in two pools, heap and native, each of them has its own capacity. Blocks
/// returned to the context are reset and cached in the free list of their pool, they
/// are deallocated when the context is dropped.
///
/// The context is shared between consumers with [`Arc`], acquire and release are
/// guarded by a mutex.
#[derive(Debug)]
pub struct MemoryContext {
    id: ContextId,
    block_size: usize,
    pools: Mutex<Pools>,
}

impl MemoryContext {
    /// Create a new [`MemoryContext`]
    pub fn try_new(config: MemoryContextConfig) -> Result<Arc<Self>> {
        ensure!(
            config.block_size > 0,
            InvalidConfigSnafu {
                reason: "block size should be greater than 0"
            }
        );
        let block_size = roundup_to_multiple_of_pow_of_two_base(
            config.block_size.max(CACHE_LINE_SIZE),
            CACHE_LINE_SIZE,
        );
        ensure!(
            Layout::from_size_align(block_size, CACHE_LINE_SIZE).is_ok(),
            InvalidConfigSnafu {
                reason: format!("block size `{}` is too large", config.block_size)
            }
        );

        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            "Create memory context `{}` with block size `{}`, heap capacity `{}`, native capacity `{}`",
            id,
            block_size,
            config.heap_capacity,
            config.native_capacity
        );

        Ok(Arc::new(Self {
            id,
            block_size,
            pools: Mutex::new(Pools {
                heap: Pool::new(config.heap_capacity),
                native: Pool::new(config.native_capacity),
                next_block_id: 0,
            }),
        }))
    }

    /// Identifier of the context
    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Capacity of every block acquired from the context
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Acquire a block from the pool. It reuses a returned block if possible, the
    /// returned block is reset but its bytes are not zeroed
    pub fn acquire(&self, memory_type: MemoryType) -> Result<MemoryBlock> {
        let mut pools = self.pools.lock();
        let block_id = pools.next_block_id;
        let pool = pools.pool_mut(memory_type);
        ensure!(
            pool.used + self.block_size <= pool.capacity,
            PoolExhaustedSnafu {
                memory_type,
                used: pool.used,
                capacity: pool.capacity,
                block_size: self.block_size,
            }
        );

        pool.used += self.block_size;
        if let Some(block) = pool.free.pop() {
            return Ok(block);
        }

        pools.next_block_id += 1;
        let block = MemoryBlock::new(BlockId(block_id), self.id, memory_type, self.block_size);
        tracing::trace!(
            "Memory context `{}` allocates `{}` block `{}`",
            self.id,
            memory_type,
            block.id()
        );
        Ok(block)
    }

    /// Give the block back to the pool
    pub fn release(&self, mut block: MemoryBlock) -> Result<()> {
        ensure!(
            block.context() == self.id,
            ForeignBlockSnafu {
                block: block.id(),
                context: self.id
            }
        );

        block.reset();
        let mut pools = self.pools.lock();
        let pool = pools.pool_mut(block.memory_type());
        pool.used -= self.block_size;
        pool.free.push(block);
        Ok(())
    }

    /// Bytes held by the blocks handed out from the pool
    pub fn used(&self, memory_type: MemoryType) -> usize {
        self.pools.lock().pool_mut(memory_type).used
    }

    /// Capacity of the pool
    pub fn capacity(&self, memory_type: MemoryType) -> usize {
        self.pools.lock().pool_mut(memory_type).capacity
    }

    /// Number of blocks that can still be acquired from the pool
    pub fn available_blocks(&self, memory_type: MemoryType) -> usize {
        let mut pools = self.pools.lock();
        let pool = pools.pool_mut(memory_type);
        (pool.capacity - pool.used) / self.block_size
    }
}
