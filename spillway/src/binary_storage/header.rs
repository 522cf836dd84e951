//! Header of the storage

use std::mem::size_of;

use memory_block::Address;
use memory_block::block::MemoryBlock;
use memory_block::error::Result;

/// Size of the serialized [`StorageHeader`]
pub const HEADER_SIZE: usize = 4 * size_of::<u64>();

const BASE_OFFSET: usize = 0;
const CAPACITY_OFFSET: usize = 8;
const LEN_OFFSET: usize = 16;
const PAIR_COUNT_OFFSET: usize = 24;

/// Header of the storage, it is stored in the first [`HEADER_SIZE`] bytes of the
/// block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageHeader {
    /// Address of the slot array
    pub base: Address,
    /// Number of slots in the slot array, zero if the block is not activated
    pub capacity: usize,
    /// Number of occupied slots
    pub len: usize,
    /// Number of pairs stored in the block
    pub pair_count: usize,
}

impl StorageHeader {
    /// Address of the header in the block
    pub const ADDRESS: Address = Address::new(0);

    /// Allocate the header in an empty block
    pub fn allocate(block: &mut MemoryBlock) -> Result<Address> {
        let address = block.allocate(HEADER_SIZE)?;
        debug_assert_eq!(
            address,
            Self::ADDRESS,
            "Header should be the first allocation of the block"
        );
        Ok(address)
    }

    /// Load the header from the block
    #[inline]
    pub fn load(block: &MemoryBlock) -> Self {
        Self {
            base: Address::new(block.read_u64(Self::ADDRESS.add(BASE_OFFSET)) as usize),
            capacity: block.read_u64(Self::ADDRESS.add(CAPACITY_OFFSET)) as usize,
            len: block.read_u64(Self::ADDRESS.add(LEN_OFFSET)) as usize,
            pair_count: block.read_u64(Self::ADDRESS.add(PAIR_COUNT_OFFSET)) as usize,
        }
    }

    /// Store the header into the block
    #[inline]
    pub fn store(&self, block: &mut MemoryBlock) {
        block.write_u64(Self::ADDRESS.add(BASE_OFFSET), self.base.offset() as u64);
        block.write_u64(Self::ADDRESS.add(CAPACITY_OFFSET), self.capacity as u64);
        block.write_u64(Self::ADDRESS.add(LEN_OFFSET), self.len as u64);
        block.write_u64(
            Self::ADDRESS.add(PAIR_COUNT_OFFSET),
            self.pair_count as u64,
        );
    }

    /// Clear the header stored in the block, the block looks like an empty storage
    /// without slots afterward
    #[inline]
    pub fn clear(block: &mut MemoryBlock) {
        block.fill_zero(Self::ADDRESS, HEADER_SIZE);
    }
}
