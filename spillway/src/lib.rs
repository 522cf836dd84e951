#![warn(clippy::todo)]
#![deny(
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rustdoc::private_intra_doc_links,
    rust_2018_idioms,
    missing_docs,
    clippy::needless_borrow,
    clippy::redundant_clone,
    missing_debug_implementations
)]

//! # Spillway
//!
//! `Spillway` is an off-heap, spill capable, hash partitioned aggregation engine. Key
//! value pairs are serialized into memory blocks acquired from a
//! [`MemoryContext`](memory_block::context::MemoryContext), accumulated per key in the
//! open addressing hash tables stored in the blocks, and spilled to disk in bounded
//! chunks when the memory is exhausted.

pub mod aggregator;
pub mod binary_storage;
pub mod common;
pub mod metric;
pub mod pair;
pub mod partition;
pub mod spilling;

pub use aggregator::{
    AggregatorConfig, AggregatorError, AggregatorState, PairCursor, PartitionedAggregator,
    ResultCursor,
};
pub use pair::{Decode, Encode, Pair, PairRef};
