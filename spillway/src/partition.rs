//! Partition of the aggregator

use std::sync::Arc;

use memory_block::block::MemoryBlock;
use memory_block::chain::{MemoryBlockChain, MemoryChainingRule};
use memory_block::context::MemoryContext;
use memory_block::error::Result;

use crate::binary_storage::header::StorageHeader;
use crate::binary_storage::storage::{OccupiedSlots, PairChain, Storage};
use crate::common::types::{HashValue, PartitionId};
use crate::pair::{PairRef, read_pair};

/// [`Partition`] is the unit of hash isolation and spilling. It owns a chain of
/// blocks and the storage bound to the current block of the chain
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    storage: Storage,
    chain: MemoryBlockChain,
}

impl Partition {
    /// Create a partition with its first block activated
    pub fn try_new(
        id: PartitionId,
        context: Arc<MemoryContext>,
        rule: MemoryChainingRule,
    ) -> Result<Self> {
        let mut partition = Self {
            id,
            storage: Storage::new(),
            chain: MemoryBlockChain::new(context, rule),
        };
        let activated = match partition.chain.acquire_next() {
            Ok(()) => partition.activate_current(),
            Err(err) => Err(err),
        };
        match activated {
            Ok(()) => Ok(partition),
            Err(err) => {
                // The blocks should go back to the pool even if activation fails
                if let Err(dispose_err) = partition.chain.dispose() {
                    tracing::warn!(
                        "Failed to dispose the chain of partition `{}`: {}",
                        id,
                        dispose_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Identifier of the partition
    #[inline]
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Storage bound to the current block
    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Chain of the blocks
    #[inline]
    pub fn chain(&self) -> &MemoryBlockChain {
        &self.chain
    }

    /// Borrow the storage and the chain at the same time
    #[inline]
    pub fn parts_mut(&mut self) -> (&mut Storage, &mut MemoryBlockChain) {
        (&mut self.storage, &mut self.chain)
    }

    /// Activate the storage in the current block, the block must be empty
    pub fn activate_current(&mut self) -> Result<()> {
        let block = self.chain.current_mut()?;
        self.storage.activate(block)
    }

    /// Clear all of the blocks and activate the first one. Slots and pairs stored in
    /// the blocks are invisible afterward
    pub fn reset(&mut self) -> Result<()> {
        for block in self.chain.iter_mut() {
            block.reset();
            StorageHeader::clear(block);
        }
        self.chain.set_current(0);
        self.activate_current()
    }

    /// Number of occupied slots in all of the blocks
    pub fn slot_count(&self) -> usize {
        self.chain
            .iter()
            .map(|block| StorageHeader::load(block).len)
            .sum()
    }

    /// Number of pairs in all of the blocks
    pub fn pair_count(&self) -> usize {
        self.chain
            .iter()
            .map(|block| StorageHeader::load(block).pair_count)
            .sum()
    }

    /// Bytes occupied by the live data of the blocks, wasted bytes are excluded
    pub fn resident_bytes(&self) -> usize {
        self.chain
            .iter()
            .map(|block| block.used() - block.wasted())
            .sum()
    }

    /// Iterate the pairs resident in the blocks
    pub fn resident_pairs(&self) -> ResidentPairs<'_> {
        ResidentPairs {
            blocks: self.chain.iter(),
            slots: None,
            pairs: None,
        }
    }

    /// Give all of the blocks back to the pool
    pub fn dispose(&mut self) -> Result<()> {
        self.storage = Storage::new();
        self.chain.dispose()
    }
}

/// Pair resident in a partition
#[derive(Debug, Clone, Copy)]
pub struct ResidentPair<'a> {
    /// Hash code of the slot that holds the pair
    pub hash_code: HashValue,
    /// Key and value of the pair
    pub pair: PairRef<'a>,
}

/// Iterator of the resident pairs, see [`Partition::resident_pairs`]
#[derive(Debug)]
pub struct ResidentPairs<'a> {
    blocks: std::slice::Iter<'a, MemoryBlock>,
    slots: Option<(&'a MemoryBlock, OccupiedSlots<'a>)>,
    pairs: Option<(&'a MemoryBlock, HashValue, PairChain<'a>)>,
}

impl<'a> Iterator for ResidentPairs<'a> {
    type Item = ResidentPair<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((block, hash_code, pairs)) = &mut self.pairs {
                let (block, hash_code): (&'a MemoryBlock, _) = (*block, *hash_code);
                if let Some(address) = pairs.next() {
                    return Some(ResidentPair {
                        hash_code,
                        pair: read_pair(block, address),
                    });
                }
                self.pairs = None;
            }

            if let Some((block, slots)) = &mut self.slots {
                let block: &'a MemoryBlock = *block;
                if let Some((_, slot)) = slots.next() {
                    let slot = Storage::read_slot(block, slot);
                    self.pairs = Some((
                        block,
                        slot.hash_code,
                        Storage::pair_chain(block, slot.head),
                    ));
                    continue;
                }
                self.slots = None;
            }

            let block = self.blocks.next()?;
            self.slots = Some((block, Storage::occupied_slots(block, 0)));
        }
    }
}
