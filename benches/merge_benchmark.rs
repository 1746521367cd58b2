// ========================================================================================
//
//                 COALESCE MASTER-MERGE BENCHMARK
//
// ========================================================================================
//
// Measures how the cost of a one-shot aggregation splits between the local steps and
// the master merge as the same rows are cut into more and more partitions.
//
// ========================================================================================

use coalesce::kernels::covariance::{Covariance, CovarianceOutput};
use coalesce::kernels::moments::LowOrderMoments;
use coalesce::operation::Aggregation;
use coalesce::{Coordinator, Envelope, PartitionBlock, PartitionIndex, master};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array2, Axis};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Benchmark Tuning Parameters ---

/// Total rows shared by every partitioning.
const TOTAL_ROWS: usize = 40_000;
/// Features per row.
const NUM_FEATURES: usize = 32;
/// Partition counts to compare.
const PARTITION_COUNTS: [usize; 4] = [1, 8, 64, 256];

fn partitioned(parts: usize) -> Vec<(PartitionIndex, PartitionBlock)> {
    let mut rng = StdRng::seed_from_u64(0xC0A1_E5CE);
    let x = Array2::from_shape_fn((TOTAL_ROWS, NUM_FEATURES), |_| rng.sample::<f64, _>(Standard));
    x.axis_chunks_iter(Axis(0), TOTAL_ROWS.div_ceil(parts))
        .enumerate()
        .map(|(i, chunk)| (PartitionIndex(i as u32), PartitionBlock::Dense(chunk.to_owned())))
        .collect()
}

fn packed_partials<A: Aggregation<Input = PartitionBlock>>(
    op: &A,
    inputs: &[(PartitionIndex, PartitionBlock)],
) -> Vec<Envelope> {
    inputs
        .iter()
        .map(|(index, block)| Envelope::wrap(&op.local(*index, block).unwrap(), *index).unwrap())
        .collect()
}

fn benchmark_merge(c: &mut Criterion) {
    let coordinator = Coordinator::with_workers(num_cpus::get()).unwrap();
    let covariance = Covariance {
        output: CovarianceOutput::Covariance,
    };

    let mut group = c.benchmark_group("master_merge");
    for parts in PARTITION_COUNTS {
        let inputs = partitioned(parts);
        group.throughput(Throughput::Elements(parts as u64));

        let moments = packed_partials(&LowOrderMoments, &inputs);
        group.bench_with_input(BenchmarkId::new("moments", parts), &moments, |b, envelopes| {
            b.iter(|| black_box(master::merge(&LowOrderMoments, envelopes.clone()).unwrap()));
        });

        let crossproducts = packed_partials(&covariance, &inputs);
        group.bench_with_input(BenchmarkId::new("covariance", parts), &crossproducts, |b, envelopes| {
            b.iter(|| black_box(master::merge(&covariance, envelopes.clone()).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("covariance_end_to_end", parts), &inputs, |b, inputs| {
            b.iter(|| black_box(coordinator.aggregate(&covariance, inputs).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_merge);
criterion_main!(benches);
