//! Implementation of the [`MemoryBlock`], a fixed capacity byte region with a bump
//! allocator

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::fmt::{Debug, Display};
use std::mem::size_of;
use std::ptr::NonNull;

use snafu::ensure;

use crate::context::ContextId;
use crate::error::{BlockExhaustedSnafu, Result};
use crate::utils::{ALLOCATION_ALIGNMENT, CACHE_LINE_SIZE, roundup_to_multiple_of_pow_of_two_base};
use crate::{Address, MemoryType};

/// Identifier of the [`MemoryBlock`], unique in its [`MemoryContext`]
///
/// [`MemoryContext`]: crate::context::MemoryContext
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) u64);

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// [`MemoryBlock`] is a contiguous memory region allocated from the memory allocator.
/// The memory is **cache line aligned**, zero initialized and its capacity is multiple
/// of [`CACHE_LINE_SIZE`].
///
/// The block carries a monotonic bump allocator: [`allocate`](Self::allocate) moves the
/// cursor forward and [`free`](Self::free) can only move it backward when the freed
/// region is the most recent allocation. Regions freed in other positions are counted
/// as waste until the next [`reset`](Self::reset).
///
/// Blocks are created by the [`MemoryContext`] and should be given back to it, they are
/// never freed individually while the context is alive.
///
/// [`MemoryContext`]: crate::context::MemoryContext
pub struct MemoryBlock {
    id: BlockId,
    context: ContextId,
    memory_type: MemoryType,
    ptr: NonNull<u8>,
    capacity: usize,
    /// Bump pointer, all of the bytes before it are allocated
    cursor: usize,
    /// Bytes that are freed but can not be reclaimed by the bump allocator
    wasted: usize,
}

// SAFETY: The block exclusively owns its memory region, it behaves like a `Box<[u8]>`
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

macro_rules! impl_typed_accessors {
    ($($ty:ty),+) => {
        paste::paste! {
            $(
                #[doc = concat!("Read the little endian `", stringify!($ty), "` stored at the address")]
                #[inline]
                pub fn [<read_ $ty>](&self, address: Address) -> $ty {
                    let mut buf = [0_u8; size_of::<$ty>()];
                    buf.copy_from_slice(self.bytes(address, size_of::<$ty>()));
                    <$ty>::from_le_bytes(buf)
                }

                #[doc = concat!("Write the `", stringify!($ty), "` to the address in little endian")]
                #[inline]
                pub fn [<write_ $ty>](&mut self, address: Address, value: $ty) {
                    self.bytes_mut(address, size_of::<$ty>())
                        .copy_from_slice(&value.to_le_bytes());
                }
            )+
        }
    };
}

impl MemoryBlock {
    /// Allocate a zeroed block with at least `capacity` bytes
    ///
    /// The context guarantees that `capacity` rounded up to the cache line size forms a
    /// valid [`Layout`]
    pub(crate) fn new(
        id: BlockId,
        context: ContextId,
        memory_type: MemoryType,
        capacity: usize,
    ) -> Self {
        let capacity = roundup_to_multiple_of_pow_of_two_base(
            capacity.max(CACHE_LINE_SIZE),
            CACHE_LINE_SIZE,
        );
        // SAFETY: CACHE_LINE_SIZE is power of two and the size is checked by the context.
        // The size is non-zero
        let ptr = unsafe {
            let layout = Layout::from_size_align_unchecked(capacity, CACHE_LINE_SIZE);
            NonNull::new(alloc_zeroed(layout)).unwrap_or_else(|| handle_alloc_error(layout))
        };

        Self {
            id,
            context,
            memory_type,
            ptr,
            capacity,
            cursor: 0,
            wasted: 0,
        }
    }

    /// Identifier of the block
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Identifier of the context that owns the block
    #[inline]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Pool the block is accounted in
    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Capacity of the block in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes before the bump pointer, including the wasted bytes
    #[inline]
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Number of bytes freed in the middle of the block. They are reclaimed by
    /// [`Self::reset`]
    #[inline]
    pub fn wasted(&self) -> usize {
        self.wasted
    }

    /// Number of bytes the bump allocator can still hand out
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Allocate `size` bytes from the block. The size is rounded up to
    /// [`ALLOCATION_ALIGNMENT`], the content of the region is unspecified
    pub fn allocate(&mut self, size: usize) -> Result<Address> {
        let size = roundup_to_multiple_of_pow_of_two_base(size, ALLOCATION_ALIGNMENT);
        ensure!(
            size <= self.available(),
            BlockExhaustedSnafu {
                block: self.id,
                requested: size,
                available: self.available(),
                capacity: self.capacity,
            }
        );

        let address = Address::new(self.cursor);
        self.cursor += size;
        Ok(address)
    }

    /// Free the region allocated by [`Self::allocate`] with the same size. If the region
    /// is the most recent allocation, the bump pointer moves back and the bytes can be
    /// allocated again. Otherwise, the bytes are wasted until the block is reset
    pub fn free(&mut self, address: Address, size: usize) {
        let size = roundup_to_multiple_of_pow_of_two_base(size, ALLOCATION_ALIGNMENT);
        debug_assert!(
            address.offset() + size <= self.cursor,
            "Free the region [{}, {}) that is not allocated in block `{}`",
            address.offset(),
            address.offset() + size,
            self.id
        );

        if address.offset() + size == self.cursor {
            self.cursor = address.offset();
        } else {
            self.wasted += size;
        }
    }

    /// Reset the allocator, all of the allocated regions are released. The underlying
    /// bytes are kept as is
    #[inline]
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.wasted = 0;
    }

    /// View the entire block as a slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is allocated with `capacity` bytes and zero initialized
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    /// View the entire block as a mutable slice
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the region is allocated with `capacity` bytes and zero initialized
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Bytes in `[address, address + len)`
    ///
    /// # Panics
    ///
    /// Panics if the range is out of the block
    #[inline]
    pub fn bytes(&self, address: Address, len: usize) -> &[u8] {
        &self.as_slice()[address.offset()..address.offset() + len]
    }

    /// Mutable bytes in `[address, address + len)`
    ///
    /// # Panics
    ///
    /// Panics if the range is out of the block
    #[inline]
    pub fn bytes_mut(&mut self, address: Address, len: usize) -> &mut [u8] {
        &mut self.as_mut_slice()[address.offset()..address.offset() + len]
    }

    impl_typed_accessors!(u32, u64);

    /// Zero the bytes in `[address, address + len)`
    #[inline]
    pub fn fill_zero(&mut self, address: Address, len: usize) {
        self.bytes_mut(address, len).fill(0);
    }

    /// Copy `len` bytes starting at `src_address` in `src` to `dst_address` in self
    #[inline]
    pub fn copy_from(
        &mut self,
        src: &MemoryBlock,
        src_address: Address,
        dst_address: Address,
        len: usize,
    ) {
        self.bytes_mut(dst_address, len)
            .copy_from_slice(src.bytes(src_address, len));
    }

    /// Copy `len` bytes inside the block, the regions may overlap
    #[inline]
    pub fn copy_within(&mut self, src_address: Address, dst_address: Address, len: usize) {
        self.as_mut_slice().copy_within(
            src_address.offset()..src_address.offset() + len,
            dst_address.offset(),
        );
    }

    /// Split two disjoint regions of the block, the first one is mutable. It is used to
    /// merge a value into another value located in the same block
    ///
    /// # Panics
    ///
    /// Panics if the regions overlap or out of the block
    pub fn split_disjoint_mut(
        &mut self,
        target: Address,
        target_len: usize,
        source: Address,
        source_len: usize,
    ) -> (&mut [u8], &[u8]) {
        let target = target.offset()..target.offset() + target_len;
        let source = source.offset()..source.offset() + source_len;
        assert!(
            target.end <= source.start || source.end <= target.start,
            "Regions {:?} and {:?} overlap in block `{}`",
            target,
            source,
            self.id
        );

        let slice = self.as_mut_slice();
        if target.start < source.start {
            let (left, right) = slice.split_at_mut(source.start);
            (&mut left[target], &right[..source.len()])
        } else {
            let (left, right) = slice.split_at_mut(target.start);
            (&mut right[..target.len()], &left[source])
        }
    }
}

impl Drop for MemoryBlock {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the layout is the one used in `new`
        unsafe {
            dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, CACHE_LINE_SIZE),
            )
        };
    }
}

impl Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("id", &self.id)
            .field("memory_type", &self.memory_type)
            .field("capacity", &self.capacity)
            .field("used", &self.cursor)
            .field("wasted", &self.wasted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_block(capacity: usize) -> MemoryBlock {
        MemoryBlock::new(BlockId(7), ContextId(0), MemoryType::Native, capacity)
    }

    #[test]
    fn test_capacity_is_multiple_of_cache_line() {
        let block = mock_block(100);
        assert_eq!(block.capacity(), 128);
        assert!(block.as_slice().iter().all(|&byte| byte == 0));
        assert_eq!(block.as_slice().as_ptr() as usize % CACHE_LINE_SIZE, 0);
    }

    #[test]
    fn test_bump_allocate_and_free() {
        let mut block = mock_block(128);
        let first = block.allocate(10).unwrap();
        let second = block.allocate(16).unwrap();
        assert_eq!(first, Address::new(0));
        assert_eq!(second, Address::new(16));
        assert_eq!(block.used(), 32);

        // Free the most recent allocation, reclaimed
        block.free(second, 16);
        assert_eq!(block.used(), 16);
        assert_eq!(block.wasted(), 0);

        // Free in the middle, wasted
        let third = block.allocate(8).unwrap();
        block.free(first, 10);
        assert_eq!(block.used(), 24);
        assert_eq!(block.wasted(), 16);
        assert_eq!(third, Address::new(16));

        block.reset();
        assert_eq!(block.used(), 0);
        assert_eq!(block.wasted(), 0);
        assert_eq!(block.available(), 128);
    }

    #[test]
    fn test_block_exhausted() {
        let mut block = mock_block(64);
        block.allocate(60).unwrap();
        let err = block.allocate(1).unwrap_err();
        assert!(err.is_out_of_memory());
        let expect = expect_test::expect![
            "Memory block `7` can not allocate `8` bytes, only `0` of `64` bytes left"
        ];
        expect.assert_eq(&err.to_string());
    }

    #[test]
    fn test_typed_accessors() {
        let mut block = mock_block(64);
        block.write_u32(Address::new(4), 0xdead_beef);
        block.write_u64(Address::new(8), u64::MAX - 1);
        assert_eq!(block.read_u32(Address::new(4)), 0xdead_beef);
        assert_eq!(block.read_u64(Address::new(8)), u64::MAX - 1);
        assert_eq!(block.bytes(Address::new(4), 4), &0xdead_beef_u32.to_le_bytes());

        block.fill_zero(Address::new(8), 8);
        assert_eq!(block.read_u64(Address::new(8)), 0);
    }

    #[test]
    #[should_panic]
    fn test_read_out_of_block() {
        let block = mock_block(64);
        block.read_u64(Address::new(60));
    }

    #[test]
    fn test_copy() {
        let mut src = mock_block(64);
        let mut dst = mock_block(64);
        src.bytes_mut(Address::new(0), 5).copy_from_slice(b"hello");
        dst.copy_from(&src, Address::new(0), Address::new(8), 5);
        assert_eq!(dst.bytes(Address::new(8), 5), b"hello");

        dst.copy_within(Address::new(8), Address::new(10), 5);
        assert_eq!(dst.bytes(Address::new(8), 7), b"hehello");
    }

    #[test]
    fn test_split_disjoint_mut() {
        let mut block = mock_block(64);
        block.bytes_mut(Address::new(0), 4).copy_from_slice(b"abcd");
        block.bytes_mut(Address::new(16), 4).copy_from_slice(b"wxyz");

        let (target, source) = block.split_disjoint_mut(Address::new(16), 4, Address::new(0), 2);
        target[..2].copy_from_slice(source);
        assert_eq!(block.bytes(Address::new(16), 4), b"abyz");

        let (target, source) = block.split_disjoint_mut(Address::new(0), 4, Address::new(18), 2);
        target[2..].copy_from_slice(source);
        assert_eq!(block.bytes(Address::new(0), 4), b"abyz");
    }

    #[test]
    #[should_panic(expected = "overlap")]
    fn test_split_overlapped() {
        let mut block = mock_block(64);
        block.split_disjoint_mut(Address::new(0), 8, Address::new(4), 8);
    }
}
