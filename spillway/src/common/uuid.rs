//! uuids in the crate.

use std::fmt::Display;

use uuid::Uuid;

macro_rules! make_id {
    ($name:ident, $comment:expr) => {
        #[doc = $comment]
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            /// Construct Self from u128
            #[inline]
            pub const fn from_u128(val: u128) -> Self {
                Self(Uuid::from_u128(val))
            }

            /// Generate a random id
            #[inline]
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }
    };
}

make_id!(
    SpillId,
    "[`SpillId`] identifies the spill directory of an aggregator"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_spill_id() {
        let id = SpillId::from_u128(0xabc);
        let expect = expect_test::expect!["00000000000000000000000000000abc"];
        expect.assert_eq(&id.to_string());
        assert_ne!(SpillId::new_v4(), SpillId::new_v4());
    }
}
