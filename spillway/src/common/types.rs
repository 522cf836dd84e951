//! Common type alias

/// Result type of the hash function
pub type HashValue = u64;

/// Index of the partition in `[0, partition_count)`
pub type PartitionId = usize;
