use approx::assert_abs_diff_eq;
use coalesce::kernels::covariance::{Covariance, CovarianceOutput};
use coalesce::kernels::moments::LowOrderMoments;
use coalesce::loader::{DataFormat, DatasetLoader, PartitionScheme};
use coalesce::master;
use coalesce::operation::Aggregation;
use coalesce::{Coordinator, Envelope, PartitionBlock, PartitionIndex, PipelineError};
use ndarray::{Array2, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use tempfile::tempdir;

fn random_table(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-50.0..50.0))
}

fn write_csv(path: &std::path::Path, table: &Array2<f64>) {
    let text: String = table
        .rows()
        .into_iter()
        .map(|row| {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:?}")).collect();
            cells.join(",") + "\n"
        })
        .collect();
    fs::write(path, text).unwrap();
}

#[test]
fn four_files_give_the_global_mean() {
    let dir = tempdir().unwrap();
    let blocks: Vec<Array2<f64>> = (0..4).map(|k| random_table(100, 10, 40 + k)).collect();
    for (k, block) in blocks.iter().enumerate() {
        write_csv(&dir.path().join(format!("moments_{}.csv", k + 1)), block);
    }

    let dataset = DatasetLoader::new(DataFormat::Dense)
        .with_scheme(PartitionScheme::FileSuffix)
        .load(dir.path())
        .unwrap();
    assert_eq!(dataset.len(), 4);
    assert_eq!(dataset.total_rows(), 400);

    let coordinator = Coordinator::with_workers(3).unwrap();
    let result = coordinator
        .aggregate(&LowOrderMoments, &dataset.into_inputs())
        .unwrap();

    let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
    let whole = ndarray::concatenate(Axis(0), &views).unwrap();
    let expected = whole.mean_axis(Axis(0)).unwrap();
    assert_abs_diff_eq!(
        result.require("mean").unwrap().row(0),
        expected.view(),
        epsilon = 1e-9
    );
    assert_eq!(result.require("nObservations").unwrap()[[0, 0]], 400.0);
}

#[test]
fn repartitioning_does_not_change_the_result() {
    let x = random_table(90, 4, 7);
    let coordinator = Coordinator::with_workers(2).unwrap();
    let op = Covariance {
        output: CovarianceOutput::Covariance,
    };

    let one = vec![(PartitionIndex(0), PartitionBlock::Dense(x.clone()))];
    let many: Vec<_> = [0..13, 13..40, 40..41, 41..90]
        .into_iter()
        .enumerate()
        .map(|(i, rows)| {
            (
                PartitionIndex(i as u32),
                PartitionBlock::Dense(x.slice(s![rows, ..]).to_owned()),
            )
        })
        .collect();

    let a = coordinator.aggregate(&op, &one).unwrap();
    let b = coordinator.aggregate(&op, &many).unwrap();
    assert_abs_diff_eq!(
        a.require("covariance").unwrap(),
        b.require("covariance").unwrap(),
        epsilon = 1e-9
    );
    assert_abs_diff_eq!(a.require("mean").unwrap(), b.require("mean").unwrap(), epsilon = 1e-12);
}

#[test]
fn a_single_partial_is_finalized_directly() {
    let x = random_table(20, 3, 3);
    let block = PartitionBlock::Dense(x);
    let partial = LowOrderMoments.local(PartitionIndex(5), &block).unwrap();
    let direct = LowOrderMoments.finalize(partial.clone()).unwrap();

    let envelope = Envelope::wrap(&partial, PartitionIndex(5)).unwrap();
    let merged = master::merge(&LowOrderMoments, vec![envelope]).unwrap();
    assert_eq!(direct, merged);
}

#[test]
fn sparse_files_match_their_dense_form() {
    let dir = tempdir().unwrap();
    // [[1, 0, 2], [0, 0, 0], [0, 3, 0]] and [[0, 4, 0], [5, 0, 6]]
    fs::write(dir.path().join("part_1.csv"), "1,3,3,4\n1,3,2\n1.0,2.0,3.0\n").unwrap();
    fs::write(dir.path().join("part_2.csv"), "1,2,4\n2,1,3\n4.0,5.0,6.0\n").unwrap();
    let sparse = DatasetLoader::new(DataFormat::Csr)
        .with_scheme(PartitionScheme::FileSuffix)
        .load(dir.path())
        .unwrap();
    assert!(sparse.iter().all(|(_, b)| b.as_sparse().is_some()));

    let dense: Vec<_> = sparse
        .iter()
        .map(|(i, b)| (i, PartitionBlock::Dense(b.to_dense().into_owned())))
        .collect();
    let coordinator = Coordinator::with_workers(2).unwrap();
    let from_sparse = coordinator
        .aggregate(&LowOrderMoments, &sparse.into_inputs())
        .unwrap();
    let from_dense = coordinator.aggregate(&LowOrderMoments, &dense).unwrap();
    for name in ["minimum", "maximum", "sum", "variance"] {
        assert_abs_diff_eq!(
            from_sparse.require(name).unwrap(),
            from_dense.require(name).unwrap(),
            epsilon = 1e-12
        );
    }
}

#[test]
fn an_empty_round_is_rejected() {
    let coordinator = Coordinator::with_workers(1).unwrap();
    let err = coordinator.aggregate(&LowOrderMoments, &[]).unwrap_err();
    assert!(matches!(err, PipelineError::EmptyInput { .. }));
}

#[test]
fn a_repeated_partition_index_is_rejected() {
    let coordinator = Coordinator::with_workers(2).unwrap();
    let block = PartitionBlock::Dense(random_table(5, 2, 1));
    let inputs = vec![
        (PartitionIndex(1), block.clone()),
        (PartitionIndex(1), block),
    ];
    let err = coordinator.aggregate(&LowOrderMoments, &inputs).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::TaskRestartInconsistency {
            index: PartitionIndex(1),
            ..
        }
    ));
}

#[test]
fn a_failing_partition_is_named_in_the_error() {
    let coordinator = Coordinator::with_workers(2).unwrap();
    let inputs = vec![
        (PartitionIndex(0), PartitionBlock::Dense(random_table(5, 2, 1))),
        (PartitionIndex(3), PartitionBlock::Dense(Array2::zeros((0, 2)))),
    ];
    let err = coordinator.aggregate(&LowOrderMoments, &inputs).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Stage {
            partition: PartitionIndex(3),
            ..
        }
    ));
}
