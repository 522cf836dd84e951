//! Ordered and growable sequence of [`MemoryBlock`]s

use std::fmt::Display;
use std::sync::Arc;

use snafu::OptionExt;

use crate::MemoryType;
use crate::block::MemoryBlock;
use crate::context::MemoryContext;
use crate::error::{EmptyChainSnafu, MemoryError, Result};

/// Pools a [`MemoryBlockChain`] acquires its blocks from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryChainingRule {
    /// Only acquire blocks from the heap pool
    #[default]
    Heap,
    /// Only acquire blocks from the native pool
    Native,
    /// Acquire blocks from the heap pool, fall back to the native pool when the heap
    /// pool is exhausted
    HeapNative,
}

impl MemoryChainingRule {
    /// Pools to try, in order
    pub fn order(self) -> &'static [MemoryType] {
        match self {
            Self::Heap => &[MemoryType::Heap],
            Self::Native => &[MemoryType::Native],
            Self::HeapNative => &[MemoryType::Heap, MemoryType::Native],
        }
    }
}

impl Display for MemoryChainingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heap => write!(f, "Heap"),
            Self::Native => write!(f, "Native"),
            Self::HeapNative => write!(f, "HeapNative"),
        }
    }
}

/// [`MemoryBlockChain`] holds the blocks acquired from a [`MemoryContext`] in the
/// acquisition order and tracks the current one. Blocks go back to the context in
/// [`Self::dispose`], the chain never releases a single block
#[derive(Debug)]
pub struct MemoryBlockChain {
    context: Arc<MemoryContext>,
    rule: MemoryChainingRule,
    blocks: Vec<MemoryBlock>,
    current: usize,
}

impl MemoryBlockChain {
    /// Create an empty chain
    pub fn new(context: Arc<MemoryContext>, rule: MemoryChainingRule) -> Self {
        Self {
            context,
            rule,
            blocks: Vec::new(),
            current: 0,
        }
    }

    /// Context the blocks come from
    #[inline]
    pub fn context(&self) -> &Arc<MemoryContext> {
        &self.context
    }

    /// Chaining rule of the chain
    #[inline]
    pub fn rule(&self) -> MemoryChainingRule {
        self.rule
    }

    /// Current block
    #[inline]
    pub fn current(&self) -> Result<&MemoryBlock> {
        self.blocks.get(self.current).context(EmptyChainSnafu)
    }

    /// Mutable current block
    #[inline]
    pub fn current_mut(&mut self) -> Result<&mut MemoryBlock> {
        self.blocks.get_mut(self.current).context(EmptyChainSnafu)
    }

    /// Index of the current block
    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Advance to the next block if it has been acquired already. Returns false if
    /// the current block is the last one
    pub fn goto_next(&mut self) -> bool {
        if self.current + 1 < self.blocks.len() {
            self.current += 1;
            true
        } else {
            false
        }
    }

    /// Acquire a new block from the context, append it to the chain and make it the
    /// current block. Pools are tried in the order of the chaining rule, the error of
    /// the last pool is returned if all of them are exhausted
    pub fn acquire_next(&mut self) -> Result<()> {
        let mut last_err = None;
        for &memory_type in self.rule.order() {
            match self.context.acquire(memory_type) {
                Ok(block) => {
                    self.blocks.push(block);
                    self.current = self.blocks.len() - 1;
                    return Ok(());
                }
                Err(err) if err.is_out_of_memory() => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }

        let err = last_err.unwrap_or(MemoryError::EmptyChain);
        tracing::debug!(
            "Memory block chain with `{}` blocks can not grow: {}",
            self.blocks.len(),
            err
        );
        Err(err)
    }

    /// Same as [`Self::acquire_next`] but running out of memory is not an error.
    /// Returns true if a block is acquired
    pub fn try_acquire_next(&mut self) -> Result<bool> {
        match self.acquire_next() {
            Ok(()) => Ok(true),
            Err(err) if err.is_out_of_memory() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Set the current block
    ///
    /// # Panics
    ///
    /// Panics if the index is out of the chain while the chain is not empty
    pub fn set_current(&mut self, index: usize) {
        assert!(
            index < self.blocks.len() || (index == 0 && self.blocks.is_empty()),
            "Set current to `{}` in a chain with `{}` blocks",
            index,
            self.blocks.len()
        );
        self.current = index;
    }

    /// Get the block with the index
    #[inline]
    pub fn get(&self, index: usize) -> Option<&MemoryBlock> {
        self.blocks.get(index)
    }

    /// Get the mutable block with the index
    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut MemoryBlock> {
        self.blocks.get_mut(index)
    }

    /// Number of blocks in the chain
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the chain does not hold any block
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate the blocks in acquisition order
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, MemoryBlock> {
        self.blocks.iter()
    }

    /// Iterate the mutable blocks in acquisition order
    #[inline]
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, MemoryBlock> {
        self.blocks.iter_mut()
    }

    /// Bytes allocated in all of the blocks, wasted bytes are included
    pub fn used_bytes(&self) -> usize {
        self.blocks.iter().map(MemoryBlock::used).sum()
    }

    /// Return all of the blocks to the context. Every block is released even if some of
    /// the releases fail, the first error is returned
    pub fn dispose(&mut self) -> Result<()> {
        let mut first_err = None;
        for block in self.blocks.drain(..) {
            if let Err(err) = self.context.release(block) {
                first_err.get_or_insert(err);
            }
        }
        self.current = 0;
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::context::MemoryContextConfig;

    fn mock_context(heap_blocks: usize, native_blocks: usize) -> Arc<MemoryContext> {
        MemoryContext::try_new(MemoryContextConfig {
            block_size: 128,
            heap_capacity: heap_blocks * 128,
            native_capacity: native_blocks * 128,
        })
        .unwrap()
    }

    #[test]
    fn test_empty_chain() {
        let mut chain = MemoryBlockChain::new(mock_context(1, 0), MemoryChainingRule::Heap);
        assert!(chain.is_empty());
        assert!(matches!(chain.current(), Err(MemoryError::EmptyChain)));
        assert!(chain.current_mut().unwrap_err().is_out_of_memory());
        assert!(!chain.goto_next());
        chain.dispose().unwrap();
    }

    #[test]
    fn test_dispose_with_foreign_block() {
        let ctx = mock_context(2, 0);
        let other = mock_context(1, 0);
        let mut chain = MemoryBlockChain::new(Arc::clone(&ctx), MemoryChainingRule::Heap);
        chain.acquire_next().unwrap();
        chain.blocks.insert(1, other.acquire(MemoryType::Heap).unwrap());
        chain.acquire_next().unwrap();
        assert_eq!(chain.len(), 3);

        let err = chain.dispose().unwrap_err();
        assert!(matches!(err, MemoryError::ForeignBlock { .. }));
        // Blocks after the foreign one are released as well
        assert!(chain.is_empty());
        assert_eq!(ctx.used(MemoryType::Heap), 0);
        assert_eq!(ctx.available_blocks(MemoryType::Heap), 2);
    }

    #[test]
    fn test_acquire_and_goto_next() -> Report<MemoryError> {
        Report::capture(|| {
            let ctx = mock_context(2, 0);
            let mut chain = MemoryBlockChain::new(Arc::clone(&ctx), MemoryChainingRule::Heap);
            chain.acquire_next()?;
            chain.acquire_next()?;
            assert_eq!(chain.len(), 2);
            assert_eq!(chain.current_index(), 1);
            assert!(!chain.try_acquire_next()?);
            assert_eq!(chain.len(), 2);

            chain.current_mut()?.allocate(16)?;
            chain.set_current(0);
            chain.current_mut()?.allocate(8)?;
            assert_eq!(chain.used_bytes(), 24);
            assert!(chain.goto_next());
            assert!(!chain.goto_next());
            assert_eq!(chain.current()?.used(), 16);

            assert_eq!(ctx.used(MemoryType::Heap), 256);
            chain.dispose()?;
            assert!(chain.is_empty());
            assert_eq!(ctx.used(MemoryType::Heap), 0);
            Ok(())
        })
    }

    #[test]
    fn test_chaining_rule() {
        let ctx = mock_context(1, 1);
        let mut chain = MemoryBlockChain::new(Arc::clone(&ctx), MemoryChainingRule::HeapNative);
        chain.acquire_next().unwrap();
        chain.acquire_next().unwrap();
        let types = chain.iter().map(|b| b.memory_type()).collect::<Vec<_>>();
        assert_eq!(types, [MemoryType::Heap, MemoryType::Native]);

        let err = chain.acquire_next().unwrap_err();
        let expect = expect_test::expect![
            "`Native` memory pool is exhausted: `128` of `128` bytes are in use, can not acquire a block with `128` bytes"
        ];
        expect.assert_eq(&err.to_string());

        let mut native_only = MemoryBlockChain::new(Arc::clone(&ctx), MemoryChainingRule::Native);
        assert!(!native_only.try_acquire_next().unwrap());
        chain.dispose().unwrap();
        assert!(native_only.try_acquire_next().unwrap());
        native_only.dispose().unwrap();
    }
}
