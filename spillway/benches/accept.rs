use std::sync::Arc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use memory_block::context::{MemoryContext, MemoryContextConfig};
use rand::{Rng, SeedableRng};
use spillway::binary_storage::accumulator::{Accumulator, Sum};
use spillway::binary_storage::comparator::DefaultComparator;
use spillway::{AggregatorConfig, Pair, PartitionedAggregator};

const BLOCK_SIZE: usize = 1024 * 1024;
const NUM_PAIRS: usize = 100_000;

fn new_aggregator(associative: bool) -> PartitionedAggregator {
    let context = MemoryContext::try_new(MemoryContextConfig {
        block_size: BLOCK_SIZE,
        heap_capacity: 64 * BLOCK_SIZE,
        native_capacity: 0,
    })
    .unwrap();
    PartitionedAggregator::try_new(
        AggregatorConfig {
            partition_count: 8,
            spill_to_disk: false,
            ..Default::default()
        },
        context,
        Arc::new(DefaultComparator::new()),
        associative.then(|| Arc::new(Sum::<u64>::new()) as Arc<dyn Accumulator>),
    )
    .unwrap()
}

fn bench_accept(c: &mut Criterion) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let pairs = (0..NUM_PAIRS)
        .map(|_| Pair::new(rng.gen_range(0..4096_u64), rng.gen_range(0..100_u64)))
        .collect::<Vec<_>>();

    c.bench_function("accept_sum_u64", |b| {
        b.iter_batched(
            || new_aggregator(true),
            |mut aggregator| {
                for pair in &pairs {
                    black_box(aggregator.accept(pair).unwrap());
                }
                aggregator
            },
            BatchSize::LargeInput,
        )
    });

    c.bench_function("accept_without_accumulator", |b| {
        b.iter_batched(
            || new_aggregator(false),
            |mut aggregator| {
                for pair in &pairs[..NUM_PAIRS / 4] {
                    black_box(aggregator.accept(pair).unwrap());
                }
                aggregator
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_accept);
criterion_main!(benches);
