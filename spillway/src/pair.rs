//! Serialized key value pairs
//!
//! A pair is stored as a contiguous byte run in a [`MemoryBlock`]:
//!
//! ```text
//! ┌──────────────┬────────────────┬───────────┬─────────────┐
//! │ key_size u32 │ value_size u32 │ key bytes │ value bytes │
//! └──────────────┴────────────────┴───────────┴─────────────┘
//! ```
//!
//! Pairs stored in the binary storage are followed by a [`FOOTER_SIZE`] bytes footer
//! that holds the address of the next pair chained at the same slot. The header is
//! always little endian, the content of the key and value blocks is produced by the
//! [`Encode`] implementations and honours the byte order flag.

use std::mem::size_of;

use memory_block::Address;
use memory_block::block::MemoryBlock;
use memory_block::error::Result as MemoryResult;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// Size of the `[key_size][value_size]` header
pub const PAIR_HEADER_SIZE: usize = 2 * size_of::<u32>();

/// Size of the footer that follows a pair in the binary storage
pub const FOOTER_SIZE: usize = size_of::<u64>();

/// Address that represents the end of the pair chain
pub const NIL: Address = Address::new(0);

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display(
        "Failed to decode `{type_name}`: expect `{expected}` bytes, found `{actual}` bytes"
    ))]
    InvalidLength {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("Failed to decode `bool` from byte `{value}`"))]
    InvalidBool { value: u8 },
    #[snafu(display("Failed to decode the utf8 string"))]
    InvalidUtf8 { source: std::str::Utf8Error },
}

type Result<T> = std::result::Result<T, DecodeError>;

/// Types that can be written into the key block or value block of a pair
pub trait Encode {
    /// Number of bytes written by [`Self::encode_into`]
    fn encoded_len(&self) -> usize;

    /// Write self into `out`, its length is exactly [`Self::encoded_len`]
    fn encode_into(&self, out: &mut [u8], big_endian: bool);
}

/// Types that can be read from the key block or value block of a pair
pub trait Decode: Sized {
    /// Decode self from the bytes produced by [`Encode::encode_into`]
    fn decode(bytes: &[u8], big_endian: bool) -> Result<Self>;
}

impl<T: Encode + ?Sized> Encode for &T {
    #[inline]
    fn encoded_len(&self) -> usize {
        (**self).encoded_len()
    }

    #[inline]
    fn encode_into(&self, out: &mut [u8], big_endian: bool) {
        (**self).encode_into(out, big_endian)
    }
}

macro_rules! impl_numeric_codec {
    ($($ty:ty),+) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encoded_len(&self) -> usize {
                    size_of::<$ty>()
                }

                #[inline]
                fn encode_into(&self, out: &mut [u8], big_endian: bool) {
                    let bytes = if big_endian {
                        self.to_be_bytes()
                    } else {
                        self.to_le_bytes()
                    };
                    out.copy_from_slice(&bytes);
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode(bytes: &[u8], big_endian: bool) -> Result<Self> {
                    let array: [u8; size_of::<$ty>()] =
                        bytes.try_into().ok().context(InvalidLengthSnafu {
                            type_name: stringify!($ty),
                            expected: size_of::<$ty>(),
                            actual: bytes.len(),
                        })?;
                    Ok(if big_endian {
                        <$ty>::from_be_bytes(array)
                    } else {
                        <$ty>::from_le_bytes(array)
                    })
                }
            }
        )+
    };
}

impl_numeric_codec!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl Encode for bool {
    #[inline]
    fn encoded_len(&self) -> usize {
        1
    }

    #[inline]
    fn encode_into(&self, out: &mut [u8], _big_endian: bool) {
        out[0] = *self as u8;
    }
}

impl Decode for bool {
    fn decode(bytes: &[u8], _big_endian: bool) -> Result<Self> {
        match bytes {
            [0] => Ok(false),
            [1] => Ok(true),
            [value] => InvalidBoolSnafu { value: *value }.fail(),
            _ => InvalidLengthSnafu {
                type_name: "bool",
                expected: 1_usize,
                actual: bytes.len(),
            }
            .fail(),
        }
    }
}

impl Encode for [u8] {
    #[inline]
    fn encoded_len(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encode_into(&self, out: &mut [u8], _big_endian: bool) {
        out.copy_from_slice(self);
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encoded_len(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encode_into(&self, out: &mut [u8], big_endian: bool) {
        self.as_slice().encode_into(out, big_endian)
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode(bytes: &[u8], _big_endian: bool) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Encode for str {
    #[inline]
    fn encoded_len(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encode_into(&self, out: &mut [u8], big_endian: bool) {
        self.as_bytes().encode_into(out, big_endian)
    }
}

impl Encode for String {
    #[inline]
    fn encoded_len(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encode_into(&self, out: &mut [u8], big_endian: bool) {
        self.as_bytes().encode_into(out, big_endian)
    }
}

impl Decode for String {
    #[inline]
    fn decode(bytes: &[u8], _big_endian: bool) -> Result<Self> {
        std::str::from_utf8(bytes)
            .map(ToOwned::to_owned)
            .context(InvalidUtf8Snafu)
    }
}

/// Composite keys. The length of the first element is written as an u32 prefix
impl<A: Encode, B: Encode> Encode for (A, B) {
    #[inline]
    fn encoded_len(&self) -> usize {
        size_of::<u32>() + self.0.encoded_len() + self.1.encoded_len()
    }

    fn encode_into(&self, out: &mut [u8], big_endian: bool) {
        let first_len = self.0.encoded_len();
        (first_len as u32).encode_into(&mut out[..size_of::<u32>()], big_endian);
        let (first, second) = out[size_of::<u32>()..].split_at_mut(first_len);
        self.0.encode_into(first, big_endian);
        self.1.encode_into(second, big_endian);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(bytes: &[u8], big_endian: bool) -> Result<Self> {
        ensure!(
            bytes.len() >= size_of::<u32>(),
            InvalidLengthSnafu {
                type_name: "tuple",
                expected: size_of::<u32>(),
                actual: bytes.len(),
            }
        );
        let first_len = u32::decode(&bytes[..size_of::<u32>()], big_endian)? as usize;
        let rest = &bytes[size_of::<u32>()..];
        ensure!(
            first_len <= rest.len(),
            InvalidLengthSnafu {
                type_name: "tuple",
                expected: size_of::<u32>() + first_len,
                actual: bytes.len(),
            }
        );
        let (first, second) = rest.split_at(first_len);
        Ok((A::decode(first, big_endian)?, B::decode(second, big_endian)?))
    }
}

/// Logical key value record
#[derive(Debug, Clone, PartialEq)]
pub struct Pair<K, V> {
    /// Key of the pair
    pub key: K,
    /// Value of the pair
    pub value: V,
}

impl<K: Encode, V: Encode> Pair<K, V> {
    /// Create a new pair
    #[inline]
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    /// Size of the serialized pair, footer is excluded
    #[inline]
    pub fn serialized_size(&self) -> usize {
        PAIR_HEADER_SIZE + self.key.encoded_len() + self.value.encoded_len()
    }

    /// Allocate the bytes in the block and serialize the pair into it
    pub fn write_to(&self, block: &mut MemoryBlock, big_endian: bool) -> MemoryResult<Address> {
        let address = block.allocate(self.serialized_size())?;
        self.write_at(block, address, big_endian);
        Ok(address)
    }

    /// Serialize the pair into the region starting at `address`. The region should have
    /// at least [`Self::serialized_size`] bytes
    pub fn write_at(&self, block: &mut MemoryBlock, address: Address, big_endian: bool) {
        let key_len = self.key.encoded_len();
        let value_len = self.value.encoded_len();
        debug_assert!(key_len <= u32::MAX as usize && value_len <= u32::MAX as usize);

        block.write_u32(address, key_len as u32);
        block.write_u32(address.add(size_of::<u32>()), value_len as u32);
        let key_address = address.add(PAIR_HEADER_SIZE);
        self.key
            .encode_into(block.bytes_mut(key_address, key_len), big_endian);
        self.value.encode_into(
            block.bytes_mut(key_address.add(key_len), value_len),
            big_endian,
        );
    }
}

/// Borrowed view of a serialized pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairRef<'a> {
    /// Bytes in the key block
    pub key: &'a [u8],
    /// Bytes in the value block
    pub value: &'a [u8],
}

impl PairRef<'_> {
    /// Decode the key
    #[inline]
    pub fn decode_key<K: Decode>(&self, big_endian: bool) -> Result<K> {
        K::decode(self.key, big_endian)
    }

    /// Decode the value
    #[inline]
    pub fn decode_value<V: Decode>(&self, big_endian: bool) -> Result<V> {
        V::decode(self.value, big_endian)
    }
}

/// Address and size of the key block of the pair stored at `address`
#[inline]
pub fn key_block_at(block: &MemoryBlock, address: Address) -> (Address, usize) {
    (
        address.add(PAIR_HEADER_SIZE),
        block.read_u32(address) as usize,
    )
}

/// Address and size of the value block of the pair stored at `address`
#[inline]
pub fn value_block_at(block: &MemoryBlock, address: Address) -> (Address, usize) {
    let key_size = block.read_u32(address) as usize;
    let value_size = block.read_u32(address.add(size_of::<u32>())) as usize;
    (address.add(PAIR_HEADER_SIZE + key_size), value_size)
}

/// Size of the serialized pair stored at `address`, footer is excluded
#[inline]
pub fn pair_size_at(block: &MemoryBlock, address: Address) -> usize {
    PAIR_HEADER_SIZE
        + block.read_u32(address) as usize
        + block.read_u32(address.add(size_of::<u32>())) as usize
}

/// Address of the footer of the pair stored at `address`
#[inline]
pub fn footer_at(block: &MemoryBlock, address: Address) -> Address {
    address.add(pair_size_at(block, address))
}

/// Address of the next pair in the chain, [`NIL`] if the pair is the tail
#[inline]
pub fn next_pair_at(block: &MemoryBlock, address: Address) -> Address {
    Address::new(block.read_u64(footer_at(block, address)) as usize)
}

/// View the pair stored at `address`
#[inline]
pub fn read_pair(block: &MemoryBlock, address: Address) -> PairRef<'_> {
    let (key_address, key_size) = key_block_at(block, address);
    let (value_address, value_size) = value_block_at(block, address);
    PairRef {
        key: block.bytes(key_address, key_size),
        value: block.bytes(value_address, value_size),
    }
}

#[cfg(test)]
mod tests {
    use memory_block::MemoryType;
    use memory_block::context::{MemoryContext, MemoryContextConfig};

    use super::*;

    fn mock_block() -> MemoryBlock {
        let ctx = MemoryContext::try_new(MemoryContextConfig {
            block_size: 256,
            heap_capacity: 256,
            native_capacity: 0,
        })
        .unwrap();
        ctx.acquire(MemoryType::Heap).unwrap()
    }

    #[test]
    fn test_pair_layout() {
        let mut block = mock_block();
        block.allocate(8).unwrap();
        let pair = Pair::new("apple", 7_i64);
        assert_eq!(pair.serialized_size(), 8 + 5 + 8);

        let address = pair.write_to(&mut block, false).unwrap();
        assert_eq!(address, Address::new(8));
        assert_eq!(key_block_at(&block, address), (Address::new(16), 5));
        assert_eq!(value_block_at(&block, address), (Address::new(21), 8));
        assert_eq!(pair_size_at(&block, address), 21);
        assert_eq!(footer_at(&block, address), Address::new(29));

        let pair_ref = read_pair(&block, address);
        assert_eq!(pair_ref.key, b"apple");
        assert_eq!(pair_ref.decode_value::<i64>(false).unwrap(), 7);
        assert_eq!(pair_ref.decode_key::<String>(false).unwrap(), "apple");
    }

    #[test]
    fn test_byte_order() {
        let mut out = [0_u8; 4];
        0x0102_0304_u32.encode_into(&mut out, true);
        assert_eq!(out, [1, 2, 3, 4]);
        0x0102_0304_u32.encode_into(&mut out, false);
        assert_eq!(out, [4, 3, 2, 1]);
        assert_eq!(u32::decode(&[1, 2, 3, 4], true).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_composite_key() {
        let key = ("user", 42_u32);
        let mut out = vec![0_u8; key.encoded_len()];
        key.encode_into(&mut out, true);
        assert_eq!(out.len(), 4 + 4 + 4);
        let decoded = <(String, u32)>::decode(&out, true).unwrap();
        assert_eq!(decoded, ("user".to_string(), 42));
    }

    #[test]
    fn test_decode_errors() {
        let err = i64::decode(&[1, 2, 3], false).unwrap_err();
        let expect =
            expect_test::expect!["Failed to decode `i64`: expect `8` bytes, found `3` bytes"];
        expect.assert_eq(&err.to_string());

        assert!(matches!(
            bool::decode(&[2], false),
            Err(DecodeError::InvalidBool { value: 2 })
        ));
        assert!(String::decode(&[0xff, 0xfe], false).is_err());
        assert!(<(u8, u8)>::decode(&[9, 0, 0, 0, 1], false).is_err());
    }

    #[test]
    fn test_pair_too_large() {
        let mut block = mock_block();
        let pair = Pair::new(vec![0_u8; 300], 1_u8);
        assert!(pair.write_to(&mut block, false).unwrap_err().is_out_of_memory());
    }
}
