//! Utils for hash

/// Default hash builder
pub type BuildHasherDefault = ahash::RandomState;

/// Build hasher used to route the keys to partitions
pub const PARTITION_BUILD_HASHER: BuildHasherDefault = BuildHasherDefault::with_seeds(9, 7, 9, 8);

/// Build hasher used to probe the slots of the storage. Its seeds differ from the
/// [`PARTITION_BUILD_HASHER`], keys in the same partition share the low bits of the
/// partition hash
pub const PROBE_BUILD_HASHER: BuildHasherDefault = BuildHasherDefault::with_seeds(3, 1, 4, 1);
