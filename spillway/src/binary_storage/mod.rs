//! Open addressing hash table built directly inside the bytes of a
//! [`MemoryBlock`](memory_block::block::MemoryBlock)
//!
//! Layout of a block owned by the storage:
//!
//! ```text
//! ┌──────────────────┬──────────────┬───────┬────────────┬─────┐
//! │ StorageHeader 32 │ old slots .. │ pairs │ slots 40*N │ ... │
//! └──────────────────┴──────────────┴───────┴────────────┴─────┘
//! ```
//!
//! The header always lives at the first address of the block. The slot array is
//! relocated to a bigger region of the same block when the table grows, the old
//! array becomes waste until the block is reset.

pub mod accumulator;
pub mod comparator;
pub mod header;
pub mod storage;

pub use accumulator::Accumulator;
pub use comparator::Comparator;
pub use header::StorageHeader;
pub use storage::{SlotLookup, Storage};
