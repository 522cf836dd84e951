//! Combine the values of the same key in place

use std::fmt::Debug;
use std::marker::PhantomData;
use std::mem::size_of;

use num_traits::Num;
use snafu::{Snafu, ensure};

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AccumulateError {
    #[snafu(display(
        "`{accumulator}` accumulates `{expected}` bytes values, found values with `{head}` and `{new}` bytes"
    ))]
    ValueSize {
        accumulator: &'static str,
        expected: usize,
        head: usize,
        new: usize,
    },
}

type Result<T> = std::result::Result<T, AccumulateError>;

/// [`Accumulator`] merges the value of a new pair into the value of the first pair with
/// the same key
pub trait Accumulator: Debug + Send + Sync {
    /// Returns true if the accumulator can merge the values in place. Otherwise, all of
    /// the pairs are kept
    fn is_associative(&self) -> bool;

    /// Merge `new_value` into `head_value`
    fn accept(&self, head_value: &mut [u8], new_value: &[u8], big_endian: bool) -> Result<()>;
}

/// Fixed size numbers accumulated by the shipped accumulators
pub trait Numeric: Num + PartialOrd + Copy + Debug + Send + Sync + 'static {
    /// Read the number, `bytes` has exactly `size_of::<Self>()` bytes
    fn read(bytes: &[u8], big_endian: bool) -> Self;

    /// Write the number, `bytes` has exactly `size_of::<Self>()` bytes
    fn write(self, bytes: &mut [u8], big_endian: bool);

    /// Sum of the two numbers, integers wrap around on overflow
    fn sum(self, other: Self) -> Self;
}

macro_rules! impl_numeric {
    ($ty:ty, |$lhs:ident, $rhs:ident| $sum:expr) => {
        impl Numeric for $ty {
            #[inline]
            fn read(bytes: &[u8], big_endian: bool) -> Self {
                let mut array = [0_u8; size_of::<$ty>()];
                array.copy_from_slice(bytes);
                if big_endian {
                    <$ty>::from_be_bytes(array)
                } else {
                    <$ty>::from_le_bytes(array)
                }
            }

            #[inline]
            fn write(self, bytes: &mut [u8], big_endian: bool) {
                if big_endian {
                    bytes.copy_from_slice(&self.to_be_bytes())
                } else {
                    bytes.copy_from_slice(&self.to_le_bytes())
                }
            }

            #[inline]
            fn sum(self, $rhs: Self) -> Self {
                let $lhs = self;
                $sum
            }
        }
    };
}

impl_numeric!(i32, |lhs, rhs| lhs.wrapping_add(rhs));
impl_numeric!(i64, |lhs, rhs| lhs.wrapping_add(rhs));
impl_numeric!(u32, |lhs, rhs| lhs.wrapping_add(rhs));
impl_numeric!(u64, |lhs, rhs| lhs.wrapping_add(rhs));
impl_numeric!(f32, |lhs, rhs| lhs + rhs);
impl_numeric!(f64, |lhs, rhs| lhs + rhs);

#[inline]
fn merge_numeric<T: Numeric>(
    accumulator: &'static str,
    head_value: &mut [u8],
    new_value: &[u8],
    big_endian: bool,
    merge: impl FnOnce(T, T) -> T,
) -> Result<()> {
    ensure!(
        head_value.len() == size_of::<T>() && new_value.len() == size_of::<T>(),
        ValueSizeSnafu {
            accumulator,
            expected: size_of::<T>(),
            head: head_value.len(),
            new: new_value.len(),
        }
    );
    let head = T::read(head_value, big_endian);
    let new = T::read(new_value, big_endian);
    merge(head, new).write(head_value, big_endian);
    Ok(())
}

macro_rules! define_accumulator {
    ($name:ident, $doc:expr, |$head:ident, $new:ident| $merge:expr) => {
        #[doc = $doc]
        #[derive(Debug, Default)]
        pub struct $name<T>(PhantomData<fn() -> T>);

        impl<T> $name<T> {
            /// Create the accumulator
            #[inline]
            pub fn new() -> Self {
                Self(PhantomData)
            }
        }

        impl<T: Numeric> Accumulator for $name<T> {
            #[inline]
            fn is_associative(&self) -> bool {
                true
            }

            #[inline]
            fn accept(&self, head_value: &mut [u8], new_value: &[u8], big_endian: bool) -> Result<()> {
                merge_numeric::<T>(
                    stringify!($name),
                    head_value,
                    new_value,
                    big_endian,
                    |$head, $new| $merge,
                )
            }
        }
    };
}

define_accumulator!(Sum, "Sum of the values", |head, new| head.sum(new));
define_accumulator!(Min, "Minimal value", |head, new| if new < head { new } else { head });
define_accumulator!(Max, "Maximal value", |head, new| if new > head { new } else { head });

/// Count the pairs, each pair should carry `1_u64` as its value
pub type Count = Sum<u64>;
