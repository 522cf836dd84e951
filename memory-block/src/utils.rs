//! Utils for memory computation

/// Size of the cache line in bytes. Every block is aligned to it and its capacity is
/// a multiple of it
pub const CACHE_LINE_SIZE: usize = 64;

/// Every allocation returned by the bump allocator is a multiple of this value, such
/// that the slot arrays and footers built on top of it stay 8 bytes aligned
pub const ALLOCATION_ALIGNMENT: usize = 8;

/// Round the size up to multiple of base, base **must** be power of two
#[inline]
pub fn roundup_to_multiple_of_pow_of_two_base(size: usize, base: usize) -> usize {
    debug_assert!(base.is_power_of_two());
    let mask = base - 1;
    (size + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundup() {
        assert_eq!(roundup_to_multiple_of_pow_of_two_base(0, 8), 0);
        assert_eq!(roundup_to_multiple_of_pow_of_two_base(1, 8), 8);
        assert_eq!(roundup_to_multiple_of_pow_of_two_base(8, 8), 8);
        assert_eq!(roundup_to_multiple_of_pow_of_two_base(65, CACHE_LINE_SIZE), 128);
    }
}
