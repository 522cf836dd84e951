//! Implementation of the [`Storage`]

use memory_block::Address;
use memory_block::block::{BlockId, MemoryBlock};
use memory_block::error::Result;

use super::comparator::Comparator;
use super::header::{HEADER_SIZE, StorageHeader};
use crate::common::types::HashValue;
use crate::pair::{self, NIL};

/// Size of a slot in bytes
pub const SLOT_SIZE: usize = 40;

/// Number of slots allocated when a block is activated
pub const INITIAL_SLOT_CAPACITY: usize = 8;

const HEAD_OFFSET: usize = 0;
const TAIL_OFFSET: usize = 8;
const HASH_CODE_OFFSET: usize = 16;
const PROBE_HASH_OFFSET: usize = 24;
const PAIR_COUNT_OFFSET: usize = 32;

const FIBONACCI_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

/// Result of [`Storage::get_or_create_slot_with_same_key`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLookup {
    /// A slot holding an equal key exists, the pair is not linked to it
    Existing(Address),
    /// A new slot headed by the pair is created
    New(Address),
}

impl SlotLookup {
    /// Address of the slot
    #[inline]
    pub fn slot(self) -> Address {
        match self {
            Self::Existing(slot) | Self::New(slot) => slot,
        }
    }
}

/// Content of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// First pair in the chain
    pub head: Address,
    /// Last pair in the chain
    pub tail: Address,
    /// Hash code set by [`Storage::set_slot_hash_code`]
    pub hash_code: HashValue,
    /// Hash computed by the comparator, used to probe and rehash
    pub probe_hash: HashValue,
    /// Number of pairs in the chain
    pub pair_count: usize,
}

/// [`Storage`] is an open addressing hash table whose slots and pairs live in the
/// block it is bound to. It only holds a snapshot of the [`StorageHeader`] stored in
/// that block, every operation takes the block explicitly.
///
/// The snapshot always describes the bound block: [`Self::activate`] and
/// [`Self::bind`] switch to another block, growing the slot array rebinds the header
/// before returning.
///
/// Pairs passed to the storage must be allocated with [`pair::FOOTER_SIZE`] extra
/// bytes, the storage writes the link to the next pair into the footer.
#[derive(Debug, Default)]
pub struct Storage {
    header: StorageHeader,
    block: Option<BlockId>,
}

impl Storage {
    /// Create a storage that is not bound to any block
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimal block size to activate a storage in it
    pub const fn min_block_size() -> usize {
        HEADER_SIZE + INITIAL_SLOT_CAPACITY * SLOT_SIZE
    }

    /// Header snapshot
    #[inline]
    pub fn header(&self) -> StorageHeader {
        self.header
    }

    /// Block the storage is bound to
    #[inline]
    pub fn bound_block(&self) -> Option<BlockId> {
        self.block
    }

    /// Number of occupied slots in the bound block
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len
    }

    /// Returns true if the bound block does not have any slot
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    /// Number of pairs in the bound block
    #[inline]
    pub fn pair_count(&self) -> usize {
        self.header.pair_count
    }

    /// Create an empty table in an empty block and bind the storage to it
    pub fn activate(&mut self, block: &mut MemoryBlock) -> Result<()> {
        debug_assert_eq!(block.used(), 0, "Activate storage in a non-empty block");
        StorageHeader::allocate(block)?;
        let slots_size = INITIAL_SLOT_CAPACITY * SLOT_SIZE;
        let base = block.allocate(slots_size)?;
        block.fill_zero(base, slots_size);
        self.rebind(
            block,
            StorageHeader {
                base,
                capacity: INITIAL_SLOT_CAPACITY,
                len: 0,
                pair_count: 0,
            },
        );
        Ok(())
    }

    /// Bind the storage to a block that is activated before
    #[inline]
    pub fn bind(&mut self, block: &MemoryBlock) {
        self.header = StorageHeader::load(block);
        self.block = Some(block.id());
    }

    /// Write the header into the block and take it as the snapshot
    #[inline]
    pub fn rebind(&mut self, block: &mut MemoryBlock, header: StorageHeader) {
        header.store(block);
        self.header = header;
        self.block = Some(block.id());
    }

    #[inline]
    fn check_bound(&self, block: &MemoryBlock) {
        debug_assert_eq!(
            self.block,
            Some(block.id()),
            "Storage is not bound to block `{}`",
            block.id()
        );
        debug_assert!(self.header.capacity > 0, "Storage is not activated");
    }

    /// Insert the pair stored at `pair_address` unconditionally. If a slot holding an
    /// equal key exists, the pair is appended to its chain. Otherwise, a new slot is
    /// created. Returns the address of the slot
    ///
    /// Running out of the block is reported as an out of memory error, the table is
    /// unchanged in this case
    pub fn insert_pair(
        &mut self,
        block: &mut MemoryBlock,
        pair_address: Address,
        comparator: &dyn Comparator,
    ) -> Result<Address> {
        let slot = match self.lookup_or_create(block, pair_address, comparator)? {
            SlotLookup::New(slot) => slot,
            SlotLookup::Existing(slot) => {
                let tail = read_address(block, slot.add(TAIL_OFFSET));
                let tail_footer = pair::footer_at(block, tail);
                block.write_u64(tail_footer, pair_address.offset() as u64);
                block.write_u64(pair::footer_at(block, pair_address), NIL.offset() as u64);
                block.write_u64(slot.add(TAIL_OFFSET), pair_address.offset() as u64);
                let count = block.read_u64(slot.add(PAIR_COUNT_OFFSET));
                block.write_u64(slot.add(PAIR_COUNT_OFFSET), count + 1);
                slot
            }
        };
        self.header.pair_count += 1;
        self.header.store(block);
        Ok(slot)
    }

    /// Find the slot holding a key equal to the key of the pair stored at
    /// `pair_address`. If it does not exist, create a new slot headed by the pair
    pub fn get_or_create_slot_with_same_key(
        &mut self,
        block: &mut MemoryBlock,
        pair_address: Address,
        comparator: &dyn Comparator,
    ) -> Result<SlotLookup> {
        let lookup = self.lookup_or_create(block, pair_address, comparator)?;
        if let SlotLookup::New(_) = lookup {
            self.header.pair_count += 1;
            self.header.store(block);
        }
        Ok(lookup)
    }

    /// Find the slot holding the key
    pub fn find(
        &self,
        block: &MemoryBlock,
        key: &[u8],
        comparator: &dyn Comparator,
    ) -> Option<Address> {
        self.check_bound(block);
        self.find_slot(block, comparator.hash(key), key, comparator)
    }

    /// Tag the slot with the hash code
    #[inline]
    pub fn set_slot_hash_code(&self, block: &mut MemoryBlock, slot: Address, hash: HashValue) {
        self.check_bound(block);
        block.write_u64(slot.add(HASH_CODE_OFFSET), hash);
    }

    /// Address of the first pair chained at the slot
    #[inline]
    pub fn addr_of_first_pair(&self, block: &MemoryBlock, slot: Address) -> Address {
        self.check_bound(block);
        read_address(block, slot.add(HEAD_OFFSET))
    }

    fn lookup_or_create(
        &mut self,
        block: &mut MemoryBlock,
        pair_address: Address,
        comparator: &dyn Comparator,
    ) -> Result<SlotLookup> {
        self.check_bound(block);
        let (key_address, key_size) = pair::key_block_at(block, pair_address);
        let key = block.bytes(key_address, key_size);
        let probe_hash = comparator.hash(key);
        if let Some(slot) = self.find_slot(block, probe_hash, key, comparator) {
            return Ok(SlotLookup::Existing(slot));
        }

        if (self.header.len + 1) * 2 > self.header.capacity {
            self.grow(block)?;
        }

        let slot = vacant_slot(block, &self.header, probe_hash);
        block.write_u64(slot.add(HEAD_OFFSET), pair_address.offset() as u64);
        block.write_u64(slot.add(TAIL_OFFSET), pair_address.offset() as u64);
        block.write_u64(slot.add(HASH_CODE_OFFSET), 0);
        block.write_u64(slot.add(PROBE_HASH_OFFSET), probe_hash);
        block.write_u64(slot.add(PAIR_COUNT_OFFSET), 1);
        block.write_u64(pair::footer_at(block, pair_address), NIL.offset() as u64);
        self.header.len += 1;
        self.header.store(block);
        Ok(SlotLookup::New(slot))
    }

    fn find_slot(
        &self,
        block: &MemoryBlock,
        probe_hash: HashValue,
        key: &[u8],
        comparator: &dyn Comparator,
    ) -> Option<Address> {
        let mask = self.header.capacity - 1;
        let mut index = home_index(&self.header, probe_hash);
        loop {
            let slot = slot_address(&self.header, index);
            let head = read_address(block, slot.add(HEAD_OFFSET));
            if head == NIL {
                return None;
            }
            if block.read_u64(slot.add(PROBE_HASH_OFFSET)) == probe_hash {
                let (key_address, key_size) = pair::key_block_at(block, head);
                if comparator.equals(block.bytes(key_address, key_size), key) {
                    return Some(slot);
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Relocate the slots into a new array with double capacity. The old array is
    /// freed, it is wasted until the block is reset
    fn grow(&mut self, block: &mut MemoryBlock) -> Result<()> {
        let old = self.header;
        let capacity = old.capacity * 2;
        let base = block.allocate(capacity * SLOT_SIZE)?;
        block.fill_zero(base, capacity * SLOT_SIZE);
        let header = StorageHeader {
            base,
            capacity,
            ..old
        };

        for index in 0..old.capacity {
            let slot = slot_address(&old, index);
            if read_address(block, slot.add(HEAD_OFFSET)) == NIL {
                continue;
            }
            let target = vacant_slot(block, &header, block.read_u64(slot.add(PROBE_HASH_OFFSET)));
            block.copy_within(slot, target, SLOT_SIZE);
        }
        block.free(old.base, old.capacity * SLOT_SIZE);

        tracing::trace!(
            "Storage in block `{}` grows from `{}` slots to `{}` slots",
            block.id(),
            old.capacity,
            capacity
        );
        self.rebind(block, header);
        Ok(())
    }

    /// Read the slot stored at `slot`
    #[inline]
    pub fn read_slot(block: &MemoryBlock, slot: Address) -> Slot {
        Slot {
            head: read_address(block, slot.add(HEAD_OFFSET)),
            tail: read_address(block, slot.add(TAIL_OFFSET)),
            hash_code: block.read_u64(slot.add(HASH_CODE_OFFSET)),
            probe_hash: block.read_u64(slot.add(PROBE_HASH_OFFSET)),
            pair_count: block.read_u64(slot.add(PAIR_COUNT_OFFSET)) as usize,
        }
    }

    /// Iterate the occupied slots of any block activated by a storage, starting from
    /// the slot with index `start`
    pub fn occupied_slots(block: &MemoryBlock, start: usize) -> OccupiedSlots<'_> {
        OccupiedSlots {
            block,
            header: StorageHeader::load(block),
            index: start,
        }
    }

    /// Iterate the addresses of the pairs chained from `head`
    pub fn pair_chain(block: &MemoryBlock, head: Address) -> PairChain<'_> {
        PairChain { block, next: head }
    }
}

#[inline]
fn read_address(block: &MemoryBlock, address: Address) -> Address {
    Address::new(block.read_u64(address) as usize)
}

#[inline]
fn slot_address(header: &StorageHeader, index: usize) -> Address {
    header.base.add(index * SLOT_SIZE)
}

/// Fibonacci hashing, the high bits of the product select the slot
#[inline]
fn home_index(header: &StorageHeader, probe_hash: HashValue) -> usize {
    debug_assert!(header.capacity.is_power_of_two());
    let bits = header.capacity.trailing_zeros();
    (probe_hash.wrapping_mul(FIBONACCI_MULTIPLIER) >> (u64::BITS - bits)) as usize
}

/// Find the first empty slot in the probe sequence, the table must have at least one
/// empty slot
#[inline]
fn vacant_slot(block: &MemoryBlock, header: &StorageHeader, probe_hash: HashValue) -> Address {
    let mask = header.capacity - 1;
    let mut index = home_index(header, probe_hash);
    loop {
        let slot = slot_address(header, index);
        if read_address(block, slot.add(HEAD_OFFSET)) == NIL {
            return slot;
        }
        index = (index + 1) & mask;
    }
}

/// Iterator over the occupied slots of a block, see [`Storage::occupied_slots`]
#[derive(Debug)]
pub struct OccupiedSlots<'a> {
    block: &'a MemoryBlock,
    header: StorageHeader,
    index: usize,
}

impl Iterator for OccupiedSlots<'_> {
    /// Index and address of the slot
    type Item = (usize, Address);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.header.capacity {
            let index = self.index;
            self.index += 1;
            let slot = slot_address(&self.header, index);
            if read_address(self.block, slot.add(HEAD_OFFSET)) != NIL {
                return Some((index, slot));
            }
        }
        None
    }
}

/// Iterator over the pairs chained at a slot, see [`Storage::pair_chain`]
#[derive(Debug)]
pub struct PairChain<'a> {
    block: &'a MemoryBlock,
    next: Address,
}

impl Iterator for PairChain<'_> {
    type Item = Address;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let current = self.next;
        self.next = pair::next_pair_at(self.block, current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use memory_block::MemoryType;
    use memory_block::context::{MemoryContext, MemoryContextConfig};

    use super::*;
    use crate::binary_storage::comparator::DefaultComparator;
    use crate::pair::{FOOTER_SIZE, Pair, read_pair};

    fn mock_block(block_size: usize) -> (Arc<MemoryContext>, MemoryBlock) {
        let ctx = MemoryContext::try_new(MemoryContextConfig {
            block_size,
            heap_capacity: block_size,
            native_capacity: 0,
        })
        .unwrap();
        let block = ctx.acquire(MemoryType::Heap).unwrap();
        (ctx, block)
    }

    fn store_pair(block: &mut MemoryBlock, key: u32, value: u32) -> Result<Address> {
        let pair = Pair::new(key, value);
        let address = block.allocate(pair.serialized_size() + FOOTER_SIZE)?;
        pair.write_at(block, address, false);
        Ok(address)
    }

    #[test]
    fn test_insert_and_grow() {
        let (_ctx, mut block) = mock_block(8192);
        let comparator = DefaultComparator::new();
        let mut storage = Storage::new();
        storage.activate(&mut block).unwrap();
        assert_eq!(storage.header().capacity, INITIAL_SLOT_CAPACITY);

        for key in 0..20 {
            let address = store_pair(&mut block, key, key * 10).unwrap();
            let lookup = storage
                .get_or_create_slot_with_same_key(&mut block, address, &comparator)
                .unwrap();
            assert!(matches!(lookup, SlotLookup::New(_)));
        }
        assert_eq!(storage.len(), 20);
        assert_eq!(storage.pair_count(), 20);
        assert_eq!(storage.header().capacity, 64);
        assert_eq!(StorageHeader::load(&block), storage.header());
        // Slot arrays with 8, 16 and 32 slots are wasted
        assert_eq!(block.wasted(), (8 + 16 + 32) * SLOT_SIZE);

        for key in 0..20_u32 {
            let slot = storage
                .find(&block, &key.to_le_bytes(), &comparator)
                .unwrap();
            let pair = read_pair(&block, storage.addr_of_first_pair(&block, slot));
            assert_eq!(pair.decode_value::<u32>(false).unwrap(), key * 10);
        }
        assert!(storage.find(&block, &100_u32.to_le_bytes(), &comparator).is_none());
        assert_eq!(Storage::occupied_slots(&block, 0).count(), 20);
    }

    #[test]
    fn test_chain_pairs_with_same_key() {
        let (_ctx, mut block) = mock_block(1024);
        let comparator = DefaultComparator::new();
        let mut storage = Storage::new();
        storage.activate(&mut block).unwrap();

        let mut addresses = Vec::new();
        for value in [1, 2, 3] {
            let address = store_pair(&mut block, 7, value).unwrap();
            addresses.push(address);
            storage.insert_pair(&mut block, address, &comparator).unwrap();
        }
        let other = store_pair(&mut block, 8, 4).unwrap();
        storage.insert_pair(&mut block, other, &comparator).unwrap();

        assert_eq!(storage.len(), 2);
        assert_eq!(storage.pair_count(), 4);

        let slot = storage.find(&block, &7_u32.to_le_bytes(), &comparator).unwrap();
        let content = Storage::read_slot(&block, slot);
        assert_eq!(content.pair_count, 3);
        assert_eq!(content.head, addresses[0]);
        assert_eq!(content.tail, addresses[2]);
        let chained = Storage::pair_chain(&block, content.head).collect::<Vec<_>>();
        assert_eq!(chained, addresses);
    }

    #[test]
    fn test_existing_slot_and_hash_code() {
        let (_ctx, mut block) = mock_block(1024);
        let comparator = DefaultComparator::new();
        let mut storage = Storage::new();
        storage.activate(&mut block).unwrap();

        let first = store_pair(&mut block, 1, 5).unwrap();
        let SlotLookup::New(slot) = storage
            .get_or_create_slot_with_same_key(&mut block, first, &comparator)
            .unwrap()
        else {
            panic!("First pair should create a new slot");
        };
        storage.set_slot_hash_code(&mut block, slot, 0xfeed);

        let second = store_pair(&mut block, 1, 7).unwrap();
        let lookup = storage
            .get_or_create_slot_with_same_key(&mut block, second, &comparator)
            .unwrap();
        assert_eq!(lookup, SlotLookup::Existing(slot));
        assert_eq!(storage.addr_of_first_pair(&block, slot), first);
        assert_eq!(Storage::read_slot(&block, slot).hash_code, 0xfeed);
        assert_eq!(storage.pair_count(), 1);
    }

    #[test]
    fn test_grow_out_of_memory() {
        // Header and initial slots take 352 bytes, each pair takes 24 bytes
        let (_ctx, mut block) = mock_block(512);
        let comparator = DefaultComparator::new();
        let mut storage = Storage::new();
        storage.activate(&mut block).unwrap();
        for key in 0..4 {
            let address = store_pair(&mut block, key, key).unwrap();
            storage.insert_pair(&mut block, address, &comparator).unwrap();
        }
        let header = storage.header();

        let address = store_pair(&mut block, 4, 4).unwrap();
        let err = storage
            .insert_pair(&mut block, address, &comparator)
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(storage.header(), header);
        assert_eq!(StorageHeader::load(&block), header);
        assert!(storage.find(&block, &4_u32.to_le_bytes(), &comparator).is_none());

        // Existing key does not require new slot
        let address = store_pair(&mut block, 3, 9).unwrap();
        storage.insert_pair(&mut block, address, &comparator).unwrap();
        assert_eq!(storage.pair_count(), 5);
    }
}
