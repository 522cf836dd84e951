//! Sum by key example
//!
//! Run with `RUST_LOG=spillway=debug cargo run --example sum_by_key` to watch the spill
//! episodes

use std::collections::BTreeMap;
use std::sync::Arc;

use memory_block::context::{MemoryContext, MemoryContextConfig};
use rand::{Rng, SeedableRng};
use spillway::binary_storage::accumulator::Sum;
use spillway::binary_storage::comparator::DefaultComparator;
use spillway::common::profiler::timed;
use spillway::{AggregatorConfig, Pair, PairCursor, PartitionedAggregator};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const BLOCK_SIZE: usize = 64 * 1024;
const PARTITION_COUNT: usize = 8;
const NUM_KEYS: u64 = 50_000;
const NUM_PAIRS: usize = 1_000_000;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let spill_directory = tempfile::TempDir::new().unwrap();
    // Two blocks per partition, far less than the distinct keys need
    let context = MemoryContext::try_new(MemoryContextConfig {
        block_size: BLOCK_SIZE,
        heap_capacity: BLOCK_SIZE * (1 + 2 * PARTITION_COUNT),
        native_capacity: 0,
    })
    .unwrap();
    let mut aggregator = PartitionedAggregator::try_new(
        AggregatorConfig {
            partition_count: PARTITION_COUNT,
            spill_directory: spill_directory.path().to_path_buf(),
            ..Default::default()
        },
        context,
        Arc::new(DefaultComparator::new()),
        Some(Arc::new(Sum::<u64>::new())),
    )
    .unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut expected = BTreeMap::new();
    let ((), elapsed) = timed(|| {
        for _ in 0..NUM_PAIRS {
            let pair = Pair::new(rng.gen_range(0..NUM_KEYS), 1_u64);
            *expected.entry(pair.key).or_insert(0_u64) += 1;
            if aggregator.accept(&pair).unwrap() {
                continue;
            }

            aggregator.start_spilling().unwrap();
            while !aggregator.spill_next_chunk().unwrap() {}
            aggregator.finish_spilling().unwrap();
            assert!(aggregator.accept(&pair).unwrap());
        }
    });
    println!("Accept {NUM_PAIRS} pairs in {elapsed:?}");
    println!("{}", aggregator.metrics());

    let mut cursor = aggregator.result_cursor().unwrap();
    let mut keys = 0;
    while cursor.advance().unwrap() {
        let pair = cursor.pair().unwrap();
        let key: u64 = pair.decode_key(false).unwrap();
        let count: u64 = pair.decode_value(false).unwrap();
        assert_eq!(expected.get(&key), Some(&count));
        keys += 1;
    }
    assert_eq!(keys, expected.len());
    println!("{keys} distinct keys are verified");
}
