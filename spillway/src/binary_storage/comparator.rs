//! Hash and equality of the serialized keys

use std::fmt::Debug;
use std::hash::BuildHasher;

use crate::common::types::HashValue;
use crate::common::utils::hash::{BuildHasherDefault, PARTITION_BUILD_HASHER, PROBE_BUILD_HASHER};

/// Hash the bytes in the key block
pub trait KeyHasher: Debug + Send + Sync {
    /// Hash the key
    fn hash(&self, key: &[u8]) -> HashValue;
}

/// [`Comparator`] interprets the bytes in the key block. Keys that are equal **must**
/// have the same hash values
pub trait Comparator: Debug + Send + Sync {
    /// Hasher used to route the key to a partition
    fn partition_hasher(&self) -> &dyn KeyHasher;

    /// Hash used to probe the slots of the storage
    fn hash(&self, key: &[u8]) -> HashValue;

    /// Returns true if the two keys are equal
    fn equals(&self, left: &[u8], right: &[u8]) -> bool;
}

/// [`KeyHasher`] backed by the `ahash` with fixed seeds. It is deterministic in the
/// process
#[derive(Debug, Clone)]
pub struct AHashKeyHasher(BuildHasherDefault);

impl AHashKeyHasher {
    /// Create a hasher with the build hasher
    pub fn new(build_hasher: BuildHasherDefault) -> Self {
        Self(build_hasher)
    }
}

impl KeyHasher for AHashKeyHasher {
    #[inline]
    fn hash(&self, key: &[u8]) -> HashValue {
        self.0.hash_one(key)
    }
}

/// [`Comparator`] that treats the keys as opaque bytes
#[derive(Debug, Clone)]
pub struct DefaultComparator {
    partition_hasher: AHashKeyHasher,
    probe_hasher: AHashKeyHasher,
}

impl DefaultComparator {
    /// Create a new [`DefaultComparator`]
    pub fn new() -> Self {
        Self {
            partition_hasher: AHashKeyHasher::new(PARTITION_BUILD_HASHER),
            probe_hasher: AHashKeyHasher::new(PROBE_BUILD_HASHER),
        }
    }
}

impl Default for DefaultComparator {
    fn default() -> Self {
        Self::new()
    }
}

impl Comparator for DefaultComparator {
    #[inline]
    fn partition_hasher(&self) -> &dyn KeyHasher {
        &self.partition_hasher
    }

    #[inline]
    fn hash(&self, key: &[u8]) -> HashValue {
        self.probe_hasher.hash(key)
    }

    #[inline]
    fn equals(&self, left: &[u8], right: &[u8]) -> bool {
        left == right
    }
}
