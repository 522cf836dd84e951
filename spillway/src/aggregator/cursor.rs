//! Cursors over the aggregated pairs
//!
//! The [`ResultCursor`] visits the partitions in order. For each partition, the pairs
//! spilled to disk are visited before the resident ones. With an associative
//! accumulator, a key may be stored in several blocks and several spill episodes, the
//! cursor merges them so that every key is produced exactly once per partition

use std::ptr::NonNull;

use bumpalo::Bump;
use hashbrown::HashTable;
use snafu::ResultExt;

use super::{AccumulateSnafu, PartitionedAggregator, Result, SpillSnafu};
use crate::binary_storage::accumulator::{AccumulateError, Accumulator};
use crate::binary_storage::comparator::Comparator;
use crate::common::types::HashValue;
use crate::pair::PairRef;
use crate::partition::{Partition, ResidentPairs};
use crate::spilling::{SpillFileCursor, Spiller};

/// Forward only cursor over pairs
pub trait PairCursor {
    /// Move to the next pair. Returns false if the cursor is exhausted
    fn advance(&mut self) -> Result<bool>;

    /// Current pair, `None` before the first [`Self::advance`] or after the end
    fn pair(&self) -> Option<PairRef<'_>>;
}

impl PairCursor for SpillFileCursor {
    fn advance(&mut self) -> Result<bool> {
        SpillFileCursor::advance(self).context(SpillSnafu)
    }

    fn pair(&self) -> Option<PairRef<'_>> {
        SpillFileCursor::pair(self)
    }
}

#[derive(Debug)]
struct MergeEntry {
    hash: HashValue,
    key: NonNull<[u8]>,
    value: NonNull<[u8]>,
}

/// Pairs of a partition merged by key. Keys and values are copied into the arena, the
/// entries point into it
#[derive(Debug, Default)]
struct MergeTable {
    arena: Bump,
    table: HashTable<usize>,
    entries: Vec<MergeEntry>,
}

impl MergeTable {
    fn merge(
        &mut self,
        pair: PairRef<'_>,
        comparator: &dyn Comparator,
        accumulator: &dyn Accumulator,
        big_endian: bool,
    ) -> std::result::Result<(), AccumulateError> {
        let hash = comparator.hash(pair.key);
        let entries = &self.entries;
        let found = self
            .table
            .find(hash, |&index| {
                // SAFETY: the key is allocated in the arena owned by self
                comparator.equals(unsafe { entries[index].key.as_ref() }, pair.key)
            })
            .copied();

        match found {
            Some(index) => {
                // SAFETY: the value is allocated in the arena owned by self, no other
                // reference to it is alive because self is borrowed mutably
                let value = unsafe { self.entries[index].value.as_mut() };
                accumulator.accept(value, pair.value, big_endian)
            }
            None => {
                let key = NonNull::from(self.arena.alloc_slice_copy(pair.key));
                let value = NonNull::from(self.arena.alloc_slice_copy(pair.value));
                let index = self.entries.len();
                self.entries.push(MergeEntry { hash, key, value });
                let entries = &self.entries;
                self.table
                    .insert_unique(hash, index, |&index| entries[index].hash);
                Ok(())
            }
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> PairRef<'_> {
        let entry = &self.entries[index];
        // SAFETY: the key and value are allocated in the arena owned by self
        unsafe {
            PairRef {
                key: entry.key.as_ref(),
                value: entry.value.as_ref(),
            }
        }
    }
}

#[derive(Debug)]
enum Source<'a> {
    /// Between two partitions
    Idle,
    /// Streaming the spill file of the partition
    Spilled {
        cursor: SpillFileCursor,
        partition: &'a Partition,
    },
    /// Streaming the resident pairs of the partition
    Resident {
        pairs: ResidentPairs<'a>,
        current: Option<PairRef<'a>>,
    },
    /// Visiting the merged pairs of the partition, `position` is the index of the
    /// current pair plus one
    Merged { table: MergeTable, position: usize },
    Done,
}

/// [`ResultCursor`] produces the aggregated pairs of all partitions. It is created by
/// [`PartitionedAggregator::result_cursor`]
///
/// # Memory
///
/// With an associative accumulator, opening a partition copies every distinct key of
/// the partition, spilled and resident, with its merged value into a heap arena. The
/// arena is not accounted by the [`MemoryContext`](memory_block::context::MemoryContext),
/// so reading the result may exceed the budget of the context by the size of the
/// largest partition. The arena is freed when the cursor moves to the next partition,
/// [`Self::merged_bytes`] reports its size. Without an associative accumulator the
/// pairs are streamed and nothing is copied
#[derive(Debug)]
pub struct ResultCursor<'a, S: Spiller> {
    aggregator: &'a PartitionedAggregator<S>,
    next_partition: usize,
    source: Source<'a>,
}

impl<'a, S: Spiller> ResultCursor<'a, S> {
    pub(super) fn new(aggregator: &'a PartitionedAggregator<S>) -> Self {
        Self {
            aggregator,
            next_partition: 0,
            source: Source::Idle,
        }
    }

    /// Heap bytes held by the merge arena of the visited partition, 0 if its pairs
    /// are streamed
    pub fn merged_bytes(&self) -> usize {
        match &self.source {
            Source::Merged { table, .. } => table.arena.allocated_bytes(),
            _ => 0,
        }
    }

    fn open_partition(&self, index: usize) -> Result<Source<'a>> {
        let aggregator = self.aggregator;
        let partition = &aggregator.partitions()[index];
        let spilled = aggregator
            .spiller()
            .open_spill_file_cursor(partition.id())
            .context(SpillSnafu)?;

        let Some(accumulator) = aggregator.associative_accumulator() else {
            return Ok(match spilled {
                Some(cursor) => Source::Spilled { cursor, partition },
                None => Source::Resident {
                    pairs: partition.resident_pairs(),
                    current: None,
                },
            });
        };

        let comparator = aggregator.comparator();
        let big_endian = aggregator.config().use_big_endian;
        let mut table = MergeTable::default();
        if let Some(mut cursor) = spilled {
            while cursor.advance().context(SpillSnafu)? {
                if let Some(pair) = cursor.pair() {
                    table
                        .merge(pair, comparator, accumulator, big_endian)
                        .context(AccumulateSnafu)?;
                }
            }
        }
        for resident in partition.resident_pairs() {
            table
                .merge(resident.pair, comparator, accumulator, big_endian)
                .context(AccumulateSnafu)?;
        }
        tracing::trace!(
            "Partition `{}` is merged into `{}` pairs",
            partition.id(),
            table.len()
        );
        Ok(Source::Merged { table, position: 0 })
    }
}

impl<'a, S: Spiller> PairCursor for ResultCursor<'a, S> {
    fn advance(&mut self) -> Result<bool> {
        loop {
            match &mut self.source {
                Source::Idle => {
                    if self.next_partition == self.aggregator.partitions().len() {
                        self.source = Source::Done;
                        return Ok(false);
                    }
                    self.source = self.open_partition(self.next_partition)?;
                    self.next_partition += 1;
                }
                Source::Spilled { cursor, partition } => {
                    if cursor.advance().context(SpillSnafu)? {
                        return Ok(true);
                    }
                    let partition: &'a Partition = *partition;
                    self.source = Source::Resident {
                        pairs: partition.resident_pairs(),
                        current: None,
                    };
                }
                Source::Resident { pairs, current } => {
                    *current = pairs.next().map(|resident| resident.pair);
                    if current.is_some() {
                        return Ok(true);
                    }
                    self.source = Source::Idle;
                }
                Source::Merged { table, position } => {
                    if *position < table.len() {
                        *position += 1;
                        return Ok(true);
                    }
                    self.source = Source::Idle;
                }
                Source::Done => return Ok(false),
            }
        }
    }

    fn pair(&self) -> Option<PairRef<'_>> {
        match &self.source {
            Source::Spilled { cursor, .. } => cursor.pair(),
            Source::Resident { current, .. } => *current,
            Source::Merged { table, position } => {
                position.checked_sub(1).map(|index| table.get(index))
            }
            Source::Idle | Source::Done => None,
        }
    }
}
