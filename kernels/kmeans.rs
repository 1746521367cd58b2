//! K-means clustering: a seeded initialization round, then a fixed number of
//! Lloyd rounds. Each round is one aggregation whose broadcast input, the
//! current centroids, is an immutable snapshot owned by the round.

use crate::block::PartitionBlock;
use crate::envelope::Payload;
use crate::error::{KernelError, PipelineError};
use crate::kernels::{IterationObserver, IterativeAlgorithm};
use crate::operation::Aggregation;
use crate::pipeline::Coordinator;
use crate::types::{GlobalResult, PartitionIndex};
use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KmeansParams {
    pub n_clusters: usize,
    pub max_iterations: usize,
    pub seed: u64,
    /// Stop early once the objective improves by less than this. Zero runs
    /// every iteration.
    pub accuracy_threshold: f64,
}

impl Default for KmeansParams {
    fn default() -> Self {
        Self {
            n_clusters: 20,
            max_iterations: 5,
            seed: 777,
            accuracy_threshold: 0.0,
        }
    }
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index and squared distance of the centroid nearest to `point`. Ties go
/// to the lower index.
fn nearest(point: ArrayView1<'_, f64>, centroids: &Array2<f64>) -> (usize, f64) {
    centroids
        .rows()
        .into_iter()
        .enumerate()
        .map(|(k, c)| (k, squared_distance(point, c)))
        .fold((0, f64::INFINITY), |best, cand| if cand.1 < best.1 { cand } else { best })
}

fn check_width(centroids: &Array2<f64>, block: &PartitionBlock) -> Result<(), KernelError> {
    if centroids.ncols() != block.n_cols() {
        return Err(KernelError::DimensionMismatch {
            context: "k-means centroids",
            expected: centroids.ncols(),
            found: block.n_cols(),
        });
    }
    Ok(())
}

/// Rows sampled from one partition together with their origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitCandidates {
    pub rows: Array2<f64>,
    /// `(partition, row)` of every candidate, parallel to `rows`.
    pub origin: Vec<(u32, u64)>,
}

impl Payload for InitCandidates {
    const TAG: &'static str = "kmeans_init/partial";
}

/// Picks initial centroids from rows of the data. Each partition offers up to
/// `n_clusters` seeded candidates; the master orders them by origin and draws
/// `n_clusters` of them with the same seed, so the outcome depends only on the
/// data and the seed.
#[derive(Clone, Copy, Debug)]
pub struct KmeansInit {
    pub n_clusters: usize,
    pub seed: u64,
}

impl Aggregation for KmeansInit {
    type Input = PartitionBlock;
    type Partial = InitCandidates;

    const LOCAL_STAGE: &'static str = "kmeans_init/local";
    const MERGE_STAGE: &'static str = "kmeans_init/master";

    fn local(&self, index: PartitionIndex, input: &PartitionBlock) -> Result<InitCandidates, KernelError> {
        let x = input.to_dense();
        let mut rng = StdRng::seed_from_u64(self.seed ^ u64::from(index.get()).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let take = self.n_clusters.min(x.nrows());
        let mut picked = sample(&mut rng, x.nrows(), take).into_vec();
        picked.sort_unstable();
        Ok(InitCandidates {
            rows: x.select(Axis(0), &picked),
            origin: picked.iter().map(|&r| (index.get(), r as u64)).collect(),
        })
    }

    fn combine(&self, mut left: InitCandidates, right: InitCandidates) -> Result<InitCandidates, KernelError> {
        if left.rows.ncols() != right.rows.ncols() {
            return Err(KernelError::DimensionMismatch {
                context: "k-means candidates",
                expected: left.rows.ncols(),
                found: right.rows.ncols(),
            });
        }
        left.rows.append(Axis(0), right.rows.view())?;
        left.origin.extend(right.origin);
        Ok(left)
    }

    fn finalize(&self, total: InitCandidates) -> Result<GlobalResult, KernelError> {
        if total.origin.len() < self.n_clusters {
            return Err(KernelError::InsufficientObservations {
                required: self.n_clusters,
                found: total.origin.len(),
            });
        }
        let mut order: Vec<usize> = (0..total.origin.len()).collect();
        order.sort_by_key(|&i| total.origin[i]);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let chosen: Vec<usize> = sample(&mut rng, order.len(), self.n_clusters)
            .into_iter()
            .map(|k| order[k])
            .collect();
        Ok(GlobalResult::new().with("centroids", total.rows.select(Axis(0), &chosen)))
    }
}

/// Per-cluster counts, coordinate sums and the summed squared distance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSums {
    pub counts: Array1<f64>,
    pub sums: Array2<f64>,
    pub objective: f64,
}

impl Payload for ClusterSums {
    const TAG: &'static str = "kmeans/partial";
}

/// One Lloyd round against a fixed set of centroids. A cluster that receives
/// no points keeps its previous centroid.
#[derive(Clone, Debug)]
pub struct KmeansStep {
    centroids: Array2<f64>,
}

impl KmeansStep {
    pub fn new(centroids: Array2<f64>) -> Self {
        Self { centroids }
    }

    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }
}

impl Aggregation for KmeansStep {
    type Input = PartitionBlock;
    type Partial = ClusterSums;

    const LOCAL_STAGE: &'static str = "kmeans/local";
    const MERGE_STAGE: &'static str = "kmeans/master";

    fn local(&self, _index: PartitionIndex, input: &PartitionBlock) -> Result<ClusterSums, KernelError> {
        check_width(&self.centroids, input)?;
        let x = input.to_dense();
        let (k, p) = self.centroids.dim();
        let mut counts = Array1::zeros(k);
        let mut sums = Array2::zeros((k, p));
        let mut objective = 0.0;
        for point in x.rows() {
            let (cluster, distance) = nearest(point, &self.centroids);
            counts[cluster] += 1.0;
            sums.row_mut(cluster).scaled_add(1.0, &point);
            objective += distance;
        }
        Ok(ClusterSums {
            counts,
            sums,
            objective,
        })
    }

    fn combine(&self, mut left: ClusterSums, right: ClusterSums) -> Result<ClusterSums, KernelError> {
        if left.sums.dim() != right.sums.dim() {
            return Err(KernelError::DimensionMismatch {
                context: "k-means partial sums",
                expected: left.sums.len(),
                found: right.sums.len(),
            });
        }
        left.counts += &right.counts;
        left.sums += &right.sums;
        left.objective += right.objective;
        Ok(left)
    }

    fn finalize(&self, total: ClusterSums) -> Result<GlobalResult, KernelError> {
        let mut centroids = self.centroids.clone();
        let mut empty = 0usize;
        for (k, &count) in total.counts.iter().enumerate() {
            if count > 0.0 {
                let mean = &total.sums.row(k) / count;
                centroids.row_mut(k).assign(&mean);
            } else {
                empty += 1;
            }
        }
        if empty > 0 {
            warn!("{empty} cluster(s) received no observations and keep their previous centroid.");
        }
        Ok(GlobalResult::new()
            .with("centroids", centroids)
            .with("objectiveFunction", Array2::from_elem((1, 1), total.objective))
            .with("clusterSizes", total.counts.insert_axis(Axis(0))))
    }
}

/// Nearest-centroid label of every row, as an [n, 1] table.
pub fn assign(block: &PartitionBlock, centroids: &Array2<f64>) -> Result<Array2<f64>, KernelError> {
    check_width(centroids, block)?;
    let x = block.to_dense();
    let labels: Array1<f64> = x
        .rows()
        .into_iter()
        .map(|point| nearest(point, centroids).0 as f64)
        .collect();
    Ok(labels.insert_axis(Axis(1)))
}

#[derive(Clone, Debug)]
pub struct KmeansResult {
    pub centroids: Array2<f64>,
    pub objective: f64,
    pub iterations: usize,
    pub tables: GlobalResult,
}

/// Initialization followed by up to `max_iterations` Lloyd rounds. Each round
/// sees the fully merged centroids of the previous one.
pub fn run_kmeans(
    coordinator: &Coordinator,
    inputs: &[(PartitionIndex, PartitionBlock)],
    params: &KmeansParams,
    observer: &mut dyn IterationObserver,
) -> Result<KmeansResult, PipelineError> {
    let init = KmeansInit {
        n_clusters: params.n_clusters,
        seed: params.seed,
    };
    let seeded = coordinator.aggregate(&init, inputs)?;
    let mut centroids = seeded
        .require("centroids")
        .map_err(PipelineError::master(KmeansInit::MERGE_STAGE))?
        .clone();

    let mut tables = seeded;
    let mut objective = f64::INFINITY;
    let mut iterations = 0;
    observer.on_start(IterativeAlgorithm::Kmeans, params.max_iterations);
    for iteration in 0..params.max_iterations {
        let step = KmeansStep::new(centroids);
        tables = coordinator.aggregate(&step, inputs)?;
        centroids = tables
            .require("centroids")
            .map_err(PipelineError::master(KmeansStep::MERGE_STAGE))?
            .clone();
        let current = tables
            .require("objectiveFunction")
            .map_err(PipelineError::master(KmeansStep::MERGE_STAGE))?[[0, 0]];
        iterations = iteration + 1;
        observer.on_iteration(IterativeAlgorithm::Kmeans, iterations, Some(current));
        let improvement = objective - current;
        objective = current;
        if params.accuracy_threshold > 0.0 && improvement.abs() < params.accuracy_threshold {
            info!("K-means converged after {iterations} iterations.");
            break;
        }
    }
    observer.on_finish(IterativeAlgorithm::Kmeans);
    Ok(KmeansResult {
        centroids,
        objective,
        iterations,
        tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::NoopIterationObserver;
    use crate::kernels::progress::RecordingObserver;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_blobs() -> Vec<(PartitionIndex, PartitionBlock)> {
        let left = array![[0.0, 0.0], [0.2, -0.1], [-0.1, 0.1], [0.1, 0.2]];
        let right = array![[10.0, 10.0], [10.1, 9.9], [9.8, 10.2], [10.2, 10.1]];
        vec![
            (PartitionIndex(0), PartitionBlock::Dense(left)),
            (PartitionIndex(1), PartitionBlock::Dense(right)),
        ]
    }

    #[test]
    fn lloyd_round_moves_centroids_to_cluster_means() {
        let step = KmeansStep::new(array![[1.0, 1.0], [9.0, 9.0]]);
        let blocks = two_blobs();
        let a = step.local(PartitionIndex(0), &blocks[0].1).unwrap();
        let b = step.local(PartitionIndex(1), &blocks[1].1).unwrap();
        let result = step.finalize(step.combine(a, b).unwrap()).unwrap();
        let centroids = result.require("centroids").unwrap();
        assert_abs_diff_eq!(centroids[[0, 0]], 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(centroids[[1, 1]], 10.05, epsilon = 1e-12);
    }

    #[test]
    fn empty_clusters_keep_their_centroid() {
        let step = KmeansStep::new(array![[0.0, 0.0], [100.0, 100.0]]);
        let block = PartitionBlock::Dense(array![[1.0, 1.0], [3.0, 3.0]]);
        let partial = step.local(PartitionIndex(0), &block).unwrap();
        let result = step.finalize(partial).unwrap();
        let centroids = result.require("centroids").unwrap();
        assert_eq!(centroids.row(0).to_vec(), vec![2.0, 2.0]);
        assert_eq!(centroids.row(1).to_vec(), vec![100.0, 100.0]);
    }

    #[test]
    fn seeded_runs_repeat_exactly() {
        let coordinator = Coordinator::with_workers(2).unwrap();
        let params = KmeansParams {
            n_clusters: 2,
            max_iterations: 4,
            seed: 11,
            accuracy_threshold: 0.0,
        };
        let mut recorder = RecordingObserver::default();
        let first = run_kmeans(&coordinator, &two_blobs(), &params, &mut recorder).unwrap();
        let second = run_kmeans(&coordinator, &two_blobs(), &params, &mut NoopIterationObserver).unwrap();
        assert_eq!(first.centroids, second.centroids);
        assert_eq!(first.iterations, 4);
        assert_eq!(recorder.events.len(), 4);
        assert!(recorder.finished);
        let labels = assign(&two_blobs()[1].1, &first.centroids).unwrap();
        assert!(labels.iter().all(|&l| l == labels[[0, 0]]));
    }

    #[test]
    fn too_few_rows_for_the_requested_clusters() {
        let init = KmeansInit {
            n_clusters: 5,
            seed: 1,
        };
        let partial = init
            .local(PartitionIndex(0), &PartitionBlock::Dense(array![[1.0], [2.0]]))
            .unwrap();
        assert!(matches!(
            init.finalize(partial),
            Err(KernelError::InsufficientObservations { required: 5, found: 2 })
        ));
    }
}
