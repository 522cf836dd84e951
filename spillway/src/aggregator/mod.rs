//! Hash partitioned aggregator that spills to disk
//!
//! The [`PartitionedAggregator`] routes every pair to one of the partitions with the
//! partition hash of its key, and writes it into the storage bound to the current
//! block of the partition. When the block is full, the partition moves to the next
//! block of its chain or acquires a new one from the memory context. If no block can
//! be obtained, the pair is rejected and the caller should spill:
//!
//! ```text
//!              accept() == false
//!  Aggregating ─────────────────► start_spilling() ──► Spilling
//!       ▲                                                 │
//!       │                                 spill_next_chunk() until drained
//!       │                                                 │
//!       └───────────────── finish_spilling() ◄────────────┘
//! ```
//!
//! `finish_spilling` resets all of the blocks, accumulation resumes on the cleared
//! blocks afterward. Spilled pairs are replayed by the [`ResultCursor`].

pub mod config;
pub mod cursor;

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use memory_block::Address;
use memory_block::block::MemoryBlock;
use memory_block::chain::MemoryBlockChain;
use memory_block::context::MemoryContext;
use memory_block::error::MemoryError;
use memory_block::utils::{ALLOCATION_ALIGNMENT, roundup_to_multiple_of_pow_of_two_base};
use snafu::{ResultExt, Snafu, ensure};
use spillway_procedural_macro::MetricsSetBuilder;

use crate::binary_storage::accumulator::{AccumulateError, Accumulator};
use crate::binary_storage::comparator::Comparator;
use crate::binary_storage::storage::{SlotLookup, Storage};
use crate::common::profiler::ScopedTimerGuard;
use crate::common::types::{HashValue, PartitionId};
use crate::metric::{Count, MetricsSet, Time};
use crate::pair::{self, Encode, FOOTER_SIZE, Pair};
use crate::partition::Partition;
use crate::spilling::{DefaultSpiller, SpillError, Spiller};

pub use config::AggregatorConfig;
pub use cursor::{PairCursor, ResultCursor};

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AggregatorError {
    #[snafu(display("Partition count `{partition_count}` is not a power of two"))]
    InvalidPartitionCount { partition_count: usize },
    #[snafu(display("Spill directory `{}` is invalid: {reason}", path.display()))]
    InvalidSpillDirectory { path: PathBuf, reason: &'static str },
    #[snafu(display(
        "Spilling buffer size `{buffer_size}` and chunk size `{chunk_size}` should be greater than 0"
    ))]
    InvalidSpillingSizes {
        buffer_size: usize,
        chunk_size: usize,
    },
    #[snafu(display(
        "Memory block with `{block_size}` bytes is too small, the storage requires at least `{required}` bytes"
    ))]
    BlockTooSmall { block_size: usize, required: usize },
    #[snafu(display("Failed to acquire the initial blocks of the aggregator"))]
    Initialize { source: MemoryError },
    #[snafu(display(
        "Partition `{partition}` runs out of memory and spilling to disk is disabled. The aggregator is disposed"
    ))]
    OutOfMemory { partition: PartitionId },
    #[snafu(display("Spilling to disk is disabled. The aggregator is disposed"))]
    SpillingDisabled,
    #[snafu(display(
        "Pair with `{size}` bytes can not fit into an empty memory block with `{block_size}` bytes"
    ))]
    PairTooLarge { size: usize, block_size: usize },
    #[snafu(display("`{operation}` is invalid in the `{state}` state"))]
    InvalidState {
        operation: &'static str,
        state: AggregatorState,
    },
    #[snafu(display("`{operation}` requires `finish_spilling` to be called after spilling"))]
    FinishSpillingRequired { operation: &'static str },
    #[snafu(display("Memory block operation failed"))]
    Memory { source: MemoryError },
    #[snafu(display("Failed to accumulate the values"))]
    Accumulate { source: AccumulateError },
    #[snafu(display("Spilling failed"))]
    Spill { source: SpillError },
}

/// Result type of the aggregator
pub type Result<T> = std::result::Result<T, AggregatorError>;

/// State of the [`PartitionedAggregator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// Pairs can be accepted
    Aggregating,
    /// A spill episode is in progress
    Spilling,
    /// All of the resources are released
    Disposed,
}

impl Display for AggregatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aggregating => write!(f, "Aggregating"),
            Self::Spilling => write!(f, "Spilling"),
            Self::Disposed => write!(f, "Disposed"),
        }
    }
}

#[derive(Debug, Default, MetricsSetBuilder)]
struct AggregatorMetrics {
    /// Number of pairs placed in the partitions
    accepted: Count,
    /// Number of pairs rejected because the memory is exhausted
    rejected: Count,
    /// Number of pairs merged into an existing slot
    accumulated: Count,
    /// Number of blocks acquired after the construction
    blocks_acquired: Count,
    /// Number of spill episodes
    spill_episodes: Count,
    /// Number of processed spill chunks
    spilled_chunks: Count,
    /// Number of pairs persisted to disk
    spilled_pairs: Count,
    /// Time spent in accept
    write_time: Time,
    /// Time spent in processing spill chunks
    spill_time: Time,
}

/// How the pair is placed in the partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Written {
    Inserted,
    Accumulated,
}

/// Pair serialized in the service block
#[derive(Debug)]
struct SerializedPair<'a> {
    block: &'a MemoryBlock,
    address: Address,
    size: usize,
    partition_hash: HashValue,
}

/// [`PartitionedAggregator`] accumulates key value pairs in hash partitions built on
/// blocks acquired from a [`MemoryContext`], and spills the partitions with the
/// [`Spiller`] when the memory is exhausted.
///
/// The aggregator is single threaded, every operation takes `&mut self`. Dropping
/// the aggregator disposes it.
///
/// # Generics
///
/// - `S`: Strategy that persists the partitions
#[derive(Debug)]
pub struct PartitionedAggregator<S: Spiller = DefaultSpiller> {
    config: AggregatorConfig,
    context: Arc<MemoryContext>,
    comparator: Arc<dyn Comparator>,
    accumulator: Option<Arc<dyn Accumulator>>,
    partitions: Vec<Partition>,
    /// Chain holding the scratch block used to serialize the pairs
    service: MemoryBlockChain,
    spiller: S,
    state: AggregatorState,
    /// A spill episode is drained or in progress, `finish_spilling` is not called yet
    awaiting_finish: bool,
    metrics: AggregatorMetrics,
}

impl PartitionedAggregator<DefaultSpiller> {
    /// Create an aggregator that spills with the [`DefaultSpiller`]
    pub fn try_new(
        config: AggregatorConfig,
        context: Arc<MemoryContext>,
        comparator: Arc<dyn Comparator>,
        accumulator: Option<Arc<dyn Accumulator>>,
    ) -> Result<Self> {
        config.validate()?;
        let spiller = DefaultSpiller::new(
            &config.spill_directory,
            config.spilling_buffer_size,
            config.spilling_chunk_size,
        );
        Self::with_spiller(config, context, comparator, accumulator, spiller)
    }
}

impl<S: Spiller> PartitionedAggregator<S> {
    /// Create an aggregator with the spiller. Every partition acquires its first
    /// block from the context, nothing is acquired if the config is invalid
    pub fn with_spiller(
        config: AggregatorConfig,
        context: Arc<MemoryContext>,
        comparator: Arc<dyn Comparator>,
        accumulator: Option<Arc<dyn Accumulator>>,
        spiller: S,
    ) -> Result<Self> {
        config.validate()?;
        let required = Storage::min_block_size();
        ensure!(
            context.block_size() >= required,
            BlockTooSmallSnafu {
                block_size: context.block_size(),
                required
            }
        );

        let rule = config.memory_chaining_rule;
        let mut service = MemoryBlockChain::new(Arc::clone(&context), rule);
        service.acquire_next().context(InitializeSnafu)?;

        let mut partitions = Vec::with_capacity(config.partition_count);
        for id in 0..config.partition_count {
            match Partition::try_new(id, Arc::clone(&context), rule) {
                Ok(partition) => partitions.push(partition),
                Err(err) => {
                    for mut partition in partitions {
                        if let Err(dispose_err) = partition.dispose() {
                            tracing::warn!(
                                "Failed to dispose partition `{}`: {}",
                                partition.id(),
                                dispose_err
                            );
                        }
                    }
                    if let Err(dispose_err) = service.dispose() {
                        tracing::warn!("Failed to dispose the service block: {}", dispose_err);
                    }
                    return Err(err).context(InitializeSnafu);
                }
            }
        }

        tracing::debug!(
            "Create aggregator with `{}` partitions, block size `{}`, spill to disk: `{}`",
            config.partition_count,
            context.block_size(),
            config.spill_to_disk
        );

        Ok(Self {
            config,
            context,
            comparator,
            accumulator,
            partitions,
            service,
            spiller,
            state: AggregatorState::Aggregating,
            awaiting_finish: false,
            metrics: AggregatorMetrics::default(),
        })
    }

    /// Configuration of the aggregator
    #[inline]
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// State of the aggregator
    #[inline]
    pub fn state(&self) -> AggregatorState {
        self.state
    }

    /// Returns true if a spill episode is started and `finish_spilling` is not called
    #[inline]
    pub fn is_awaiting_finish(&self) -> bool {
        self.awaiting_finish
    }

    /// Partitions of the aggregator
    #[inline]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Comparator used to hash and compare the keys
    #[inline]
    pub fn comparator(&self) -> &dyn Comparator {
        &*self.comparator
    }

    /// Accumulator that merges the values in place, `None` if the accumulator is
    /// absent or not associative
    #[inline]
    pub fn associative_accumulator(&self) -> Option<&dyn Accumulator> {
        self.accumulator
            .as_deref()
            .filter(|accumulator| accumulator.is_associative())
    }

    /// Spiller of the aggregator
    #[inline]
    pub fn spiller(&self) -> &S {
        &self.spiller
    }

    /// Snapshot of the metrics
    pub fn metrics(&self) -> MetricsSet {
        self.metrics.metrics_set()
    }

    /// Override the comparator. Keys accepted before keep the partitions computed by
    /// the previous comparator
    pub fn set_comparator(&mut self, comparator: Arc<dyn Comparator>) {
        self.comparator = comparator;
    }

    /// Partition the key is routed to
    pub fn partition_id_of<K: Encode + ?Sized>(&self, key: &K) -> PartitionId {
        let mut bytes = vec![0_u8; key.encoded_len()];
        key.encode_into(&mut bytes, self.config.use_big_endian);
        let hash = self.comparator.partition_hasher().hash(&bytes);
        partition_of_hash(hash, self.partitions.len())
    }

    fn ensure_aggregating(&self, operation: &'static str) -> Result<()> {
        ensure!(
            self.state == AggregatorState::Aggregating,
            InvalidStateSnafu {
                operation,
                state: self.state
            }
        );
        ensure!(
            !self.awaiting_finish,
            FinishSpillingRequiredSnafu { operation }
        );
        Ok(())
    }

    /// Accept the pair. Returns false if the memory is exhausted, the pair is not
    /// accepted and should be resubmitted after spilling.
    ///
    /// If spilling is disabled, running out of memory disposes the aggregator and
    /// returns [`AggregatorError::OutOfMemory`]
    pub fn accept<K: Encode, V: Encode>(&mut self, pair: &Pair<K, V>) -> Result<bool> {
        self.ensure_aggregating("accept")?;

        let mut elapsed = Duration::ZERO;
        let accepted = {
            let _guard = ScopedTimerGuard::new(&mut elapsed);
            self.write_pair(pair)
        };
        self.metrics.write_time.add_duration(elapsed);
        accepted
    }

    fn write_pair<K: Encode, V: Encode>(&mut self, pair: &Pair<K, V>) -> Result<bool> {
        let big_endian = self.config.use_big_endian;
        let block_size = self.context.block_size();
        let stored_size = roundup_to_multiple_of_pow_of_two_base(
            pair.serialized_size() + FOOTER_SIZE,
            ALLOCATION_ALIGNMENT,
        );
        ensure!(
            stored_size <= block_size - Storage::min_block_size(),
            PairTooLargeSnafu {
                size: pair.serialized_size(),
                block_size
            }
        );

        let service = self.service.current_mut().context(MemorySnafu)?;
        service.reset();
        let address = pair.write_to(service, big_endian).context(MemorySnafu)?;
        let service: &MemoryBlock = service;
        let (key_address, key_size) = pair::key_block_at(service, address);
        let partition_hash = self
            .comparator
            .partition_hasher()
            .hash(service.bytes(key_address, key_size));
        let partition_id = partition_of_hash(partition_hash, self.partitions.len());
        let serialized = SerializedPair {
            block: service,
            address,
            size: pair::pair_size_at(service, address),
            partition_hash,
        };

        let accumulator = self
            .accumulator
            .as_deref()
            .filter(|accumulator| accumulator.is_associative());
        let mut advanced = false;
        let written = loop {
            let partition = &mut self.partitions[partition_id];
            match write_into_partition(
                partition,
                &serialized,
                &*self.comparator,
                accumulator,
                big_endian,
            ) {
                Ok(written) => break Some(written),
                Err(AggregatorError::Memory { source }) if source.is_out_of_memory() => {
                    ensure!(
                        !advanced,
                        PairTooLargeSnafu {
                            size: serialized.size,
                            block_size
                        }
                    );
                    advanced = true;

                    let (storage, chain) = partition.parts_mut();
                    if !chain.goto_next() {
                        if !chain.try_acquire_next().context(MemorySnafu)? {
                            break None;
                        }
                        self.metrics.blocks_acquired.add(1);
                        tracing::trace!(
                            "Partition `{}` acquires block `{}`",
                            partition_id,
                            chain.len()
                        );
                    }
                    let block = chain.current_mut().context(MemorySnafu)?;
                    storage.activate(block).context(MemorySnafu)?;
                }
                Err(err) => return Err(err),
            }
        };

        match written {
            Some(Written::Inserted) => {
                self.metrics.accepted.add(1);
                Ok(true)
            }
            Some(Written::Accumulated) => {
                self.metrics.accepted.add(1);
                self.metrics.accumulated.add(1);
                Ok(true)
            }
            None if self.config.spill_to_disk => {
                self.metrics.rejected.add(1);
                tracing::debug!(
                    "Partition `{}` runs out of memory, the pair is rejected",
                    partition_id
                );
                Ok(false)
            }
            None => {
                tracing::warn!(
                    "Partition `{}` runs out of memory and spilling to disk is disabled, dispose the aggregator",
                    partition_id
                );
                if let Err(err) = self.dispose() {
                    tracing::warn!("Failed to dispose the aggregator: {}", err);
                }
                OutOfMemorySnafu {
                    partition: partition_id,
                }
                .fail()
            }
        }
    }

    /// Start a spill episode. If spilling is disabled, the aggregator is disposed and
    /// [`AggregatorError::SpillingDisabled`] is returned
    #[tracing::instrument(skip_all, name = "PartitionedAggregator::start_spilling")]
    pub fn start_spilling(&mut self) -> Result<()> {
        self.ensure_aggregating("start_spilling")?;
        if !self.config.spill_to_disk {
            if let Err(err) = self.dispose() {
                tracing::warn!("Failed to dispose the aggregator: {}", err);
            }
            return SpillingDisabledSnafu.fail();
        }

        self.spiller.start(&self.partitions).context(SpillSnafu)?;
        self.state = AggregatorState::Spilling;
        self.awaiting_finish = true;
        self.metrics.spill_episodes.add(1);
        tracing::info!(
            "Start spill episode `{}` of `{}` partitions",
            self.metrics.spill_episodes.value(),
            self.partitions.len()
        );
        Ok(())
    }

    /// Persist the next chunk. Returns true if spilling is drained, it is always true
    /// when no spill episode is in progress
    #[tracing::instrument(skip_all, name = "PartitionedAggregator::spill_next_chunk")]
    pub fn spill_next_chunk(&mut self) -> Result<bool> {
        match self.state {
            AggregatorState::Spilling => {}
            AggregatorState::Aggregating => return Ok(true),
            state => {
                return InvalidStateSnafu {
                    operation: "spill_next_chunk",
                    state,
                }
                .fail();
            }
        }

        let spilled_before = self.spiller.spilled_pairs();
        let mut elapsed = Duration::ZERO;
        let remaining = {
            let _guard = ScopedTimerGuard::new(&mut elapsed);
            self.spiller.process_next_chunk(&self.partitions)
        };
        self.metrics.spill_time.add_duration(elapsed);
        let remaining = remaining.context(SpillSnafu)?;

        self.metrics.spilled_chunks.add(1);
        self.metrics
            .spilled_pairs
            .add(self.spiller.spilled_pairs() - spilled_before);
        if !remaining {
            self.state = AggregatorState::Aggregating;
            tracing::debug!("Spilling is drained");
        }
        Ok(!remaining)
    }

    /// Finish the spill episode: stop the spiller, reset all of the blocks and
    /// activate the partitions on the cleared blocks. If the episode is not drained,
    /// the remaining chunks are spilled first. Calling it without a spill episode does
    /// nothing
    #[tracing::instrument(skip_all, name = "PartitionedAggregator::finish_spilling")]
    pub fn finish_spilling(&mut self) -> Result<()> {
        match self.state {
            AggregatorState::Disposed => {
                return InvalidStateSnafu {
                    operation: "finish_spilling",
                    state: self.state,
                }
                .fail();
            }
            AggregatorState::Spilling => while !self.spill_next_chunk()? {},
            AggregatorState::Aggregating => {}
        }

        if !self.awaiting_finish {
            return Ok(());
        }

        self.spiller.stop().context(SpillSnafu)?;
        for partition in &mut self.partitions {
            partition.reset().context(MemorySnafu)?;
        }
        self.awaiting_finish = false;
        tracing::info!(
            "Finish spill episode `{}`, `{}` pairs are spilled in total",
            self.metrics.spill_episodes.value(),
            self.metrics.spilled_pairs.value()
        );
        Ok(())
    }

    /// Open a cursor over the aggregated pairs, spilled and resident
    pub fn result_cursor(&self) -> Result<ResultCursor<'_, S>> {
        self.ensure_aggregating("result_cursor")?;
        Ok(ResultCursor::new(self))
    }

    /// Release all of the blocks and dispose the spiller. Both of them are attempted,
    /// the first error is returned. Calling it again does nothing
    pub fn dispose(&mut self) -> Result<()> {
        if self.state == AggregatorState::Disposed {
            return Ok(());
        }
        self.state = AggregatorState::Disposed;
        self.awaiting_finish = false;

        let mut first_err = None;
        for partition in &mut self.partitions {
            if let Err(source) = partition.dispose() {
                first_err.get_or_insert(AggregatorError::Memory { source });
            }
        }
        if let Err(source) = self.service.dispose() {
            first_err.get_or_insert(AggregatorError::Memory { source });
        }
        if let Err(source) = self.spiller.dispose() {
            first_err.get_or_insert(AggregatorError::Spill { source });
        }

        tracing::debug!("Aggregator is disposed");
        first_err.map_or(Ok(()), Err)
    }
}

impl<S: Spiller> Drop for PartitionedAggregator<S> {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            tracing::warn!(
                "Failed to dispose the aggregator: {}",
                snafu::Report::from_error(err)
            );
        }
    }
}

#[inline]
fn partition_of_hash(hash: HashValue, partition_count: usize) -> PartitionId {
    debug_assert!(partition_count.is_power_of_two());
    (hash as usize) & (partition_count - 1)
}

/// Copy the serialized pair into the current block of the partition, then insert it
/// or merge it into the slot with the same key. Bytes of the copied pair are freed if
/// it is merged or the insertion fails
fn write_into_partition(
    partition: &mut Partition,
    pair: &SerializedPair<'_>,
    comparator: &dyn Comparator,
    accumulator: Option<&dyn Accumulator>,
    big_endian: bool,
) -> Result<Written> {
    let (storage, chain) = partition.parts_mut();
    let block = chain.current_mut().context(MemorySnafu)?;
    let stored_size = pair.size + FOOTER_SIZE;
    let address = block.allocate(stored_size).context(MemorySnafu)?;
    block.copy_from(pair.block, pair.address, address, pair.size);

    let Some(accumulator) = accumulator else {
        return match storage.insert_pair(block, address, comparator) {
            Ok(slot) => {
                storage.set_slot_hash_code(block, slot, pair.partition_hash);
                Ok(Written::Inserted)
            }
            Err(err) => {
                block.free(address, stored_size);
                Err(err).context(MemorySnafu)
            }
        };
    };

    match storage.get_or_create_slot_with_same_key(block, address, comparator) {
        Ok(SlotLookup::New(slot)) => {
            storage.set_slot_hash_code(block, slot, pair.partition_hash);
            Ok(Written::Inserted)
        }
        Ok(SlotLookup::Existing(slot)) => {
            storage.set_slot_hash_code(block, slot, pair.partition_hash);
            let head = storage.addr_of_first_pair(block, slot);
            let (head_value, head_size) = pair::value_block_at(block, head);
            let (new_value, new_size) = pair::value_block_at(block, address);
            let (target, source) =
                block.split_disjoint_mut(head_value, head_size, new_value, new_size);
            let merged = accumulator.accept(target, source, big_endian);
            block.free(address, stored_size);
            merged.context(AccumulateSnafu)?;
            Ok(Written::Accumulated)
        }
        Err(err) => {
            block.free(address, stored_size);
            Err(err).context(MemorySnafu)
        }
    }
}
