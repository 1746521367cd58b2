//! Implicit-feedback alternating least squares.
//!
//! Ratings are split by user into row blocks and, transposed, by item. Each
//! half-iteration holds one side's factors fixed and solves the other:
//!
//! 1. every fixed block reports its Gram matrix `Y^T Y`;
//! 2. the master sums the Gram matrices;
//! 3. every fixed block ships exactly the factor rows each solving partition
//!    needs (its "out-blocks");
//! 4. every solving partition solves its rows from the summed Gram matrix and
//!    the shipments it received.
//!
//! Training runs a fixed number of iterations with no convergence check.

use crate::block::{CsrBlock, PartitionBlock};
use crate::envelope::Payload;
use crate::error::{KernelError, PipelineError};
use crate::kernels::{IterationObserver, IterativeAlgorithm};
use crate::operation::AlternatingRound;
use crate::pipeline::Coordinator;
use crate::types::{KeyedPartialCollection, PartitionIndex, RowPartition};
use ahash::AHashMap;
use log::info;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::Solve;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlsParams {
    pub n_factors: usize,
    pub max_iterations: usize,
    /// Confidence scale: a rating `r` is trusted with weight `1 + alpha * r`.
    pub alpha: f64,
    pub lambda: f64,
    pub seed: u64,
}

impl Default for AlsParams {
    fn default() -> Self {
        Self {
            n_factors: 2,
            max_iterations: 5,
            alpha: 40.0,
            lambda: 0.01,
            seed: 777,
        }
    }
}

/// Ratings of a contiguous range of entities. Row `r` is entity `offset + r`;
/// columns are global ids on the other side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingsBlock {
    pub offset: usize,
    pub ratings: CsrBlock,
}

/// Factors of a contiguous range of entities, one row per entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialModel {
    pub offset: usize,
    pub factors: Array2<f64>,
}

impl Payload for PartialModel {
    const TAG: &'static str = "implicit_als/partial_model";
}

/// Local rows each partition on the other side needs from this block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutBlocks {
    pub rows: BTreeMap<PartitionIndex, Vec<usize>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialGram {
    pub gram: Array2<f64>,
}

impl Payload for PartialGram {
    const TAG: &'static str = "implicit_als/step1";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gram {
    pub gram: Array2<f64>,
}

impl Payload for Gram {
    const TAG: &'static str = "implicit_als/step2";
}

/// Factor rows addressed to one partition, tagged with their global ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorShipment {
    pub ids: Vec<usize>,
    pub factors: Array2<f64>,
}

impl Payload for FactorShipment {
    const TAG: &'static str = "implicit_als/step3";
}

/// Lays out loaded CSR blocks as consecutive ranges of entities in
/// partition order.
pub fn ratings_blocks(
    inputs: Vec<(PartitionIndex, PartitionBlock)>,
) -> Result<(RowPartition, Vec<(PartitionIndex, RatingsBlock)>), KernelError> {
    let layout = RowPartition::from_counts(inputs.iter().map(|(index, block)| (*index, block.n_rows())));
    let blocks = inputs
        .into_iter()
        .map(|(index, block)| {
            let PartitionBlock::Sparse(ratings) = block else {
                return Err(KernelError::InvalidParameter(
                    "implicit ALS expects ratings in CSR format".to_string(),
                ));
            };
            let offset = layout.offset(index).unwrap_or_default();
            Ok((index, RatingsBlock { offset, ratings }))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((layout, blocks))
}

/// Re-blocks ratings by the other side: partition `q` of the result holds the
/// rows `other.range(q)` of the transposed rating matrix.
pub fn transpose_partitioned(
    blocks: &[(PartitionIndex, RatingsBlock)],
    other: &RowPartition,
) -> Result<Vec<(PartitionIndex, RatingsBlock)>, KernelError> {
    let n_entities = blocks
        .iter()
        .map(|(_, b)| b.offset + b.ratings.n_rows())
        .max()
        .unwrap_or(0);
    let mut triplets: BTreeMap<PartitionIndex, Vec<(usize, usize, f64)>> =
        other.indices().iter().map(|index| (*index, Vec::new())).collect();
    for (_, block) in blocks {
        for row in 0..block.ratings.n_rows() {
            for (col, value) in block.ratings.row(row) {
                let owner = other.owner(col).ok_or(KernelError::DimensionMismatch {
                    context: "rating column outside the other side",
                    expected: other.total_rows(),
                    found: col + 1,
                })?;
                let start = other.offset(owner).unwrap_or_default();
                if let Some(cell) = triplets.get_mut(&owner) {
                    cell.push((col - start, block.offset + row, value));
                }
            }
        }
    }
    triplets
        .into_iter()
        .map(|(index, cells)| {
            let offset = other.offset(index).unwrap_or_default();
            let n_rows = other.range(index).map(|r| r.len()).unwrap_or(0);
            let ratings = CsrBlock::from_triplets(n_rows, n_entities, cells).map_err(KernelError::InvalidParameter)?;
            Ok((index, RatingsBlock { offset, ratings }))
        })
        .collect()
}

/// Which local rows of `block` each partition of the other side reads.
pub fn out_blocks(block: &RatingsBlock, other: &RowPartition) -> Result<OutBlocks, KernelError> {
    let mut needed: BTreeMap<PartitionIndex, BTreeSet<usize>> = BTreeMap::new();
    for row in 0..block.ratings.n_rows() {
        for (col, _) in block.ratings.row(row) {
            let owner = other.owner(col).ok_or(KernelError::DimensionMismatch {
                context: "rating column outside the other side",
                expected: other.total_rows(),
                found: col + 1,
            })?;
            needed.entry(owner).or_default().insert(row);
        }
    }
    Ok(OutBlocks {
        rows: needed
            .into_iter()
            .map(|(index, rows)| (index, rows.into_iter().collect()))
            .collect(),
    })
}

/// Initial factors: column 0 is the entity's mean rating, the rest uniform
/// in [0, 1). Each entity draws from its own seeded stream, so the result
/// does not depend on how entities are partitioned.
pub fn init_model(block: &RatingsBlock, params: &AlsParams) -> Result<PartialModel, KernelError> {
    if params.n_factors == 0 {
        return Err(KernelError::InvalidParameter("n_factors must be positive".to_string()));
    }
    let n = block.ratings.n_rows();
    let mut factors = Array2::zeros((n, params.n_factors));
    for (row, mut out) in factors.rows_mut().into_iter().enumerate() {
        let (count, total) = block
            .ratings
            .row(row)
            .fold((0usize, 0.0), |(c, t), (_, v)| (c + 1, t + v));
        out[0] = if count > 0 { total / count as f64 } else { 0.0 };
        let id = (block.offset + row) as u64;
        let mut rng = StdRng::seed_from_u64(params.seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        for slot in out.iter_mut().skip(1) {
            *slot = rng.gen_range(0.0..1.0);
        }
    }
    Ok(PartialModel {
        offset: block.offset,
        factors,
    })
}

/// The four steps of one implicit-ALS half-iteration.
#[derive(Clone, Debug, Default)]
pub struct ImplicitAlsRound {
    pub params: AlsParams,
}

impl ImplicitAlsRound {
    fn solve_row(
        &self,
        gram: &Array2<f64>,
        ratings: impl Iterator<Item = (usize, f64)>,
        lookup: &AHashMap<usize, ArrayView1<'_, f64>>,
    ) -> Result<Array1<f64>, KernelError> {
        let k = gram.nrows();
        let mut a = gram.clone();
        let mut b = Array1::zeros(k);
        let mut rated = false;
        for (id, r) in ratings {
            let y = lookup.get(&id).ok_or(KernelError::MissingFactor(id))?;
            let confidence = 1.0 + self.params.alpha * r;
            let column = y.view().insert_axis(Axis(1));
            a.scaled_add(confidence - 1.0, &column.dot(&column.t()));
            if r > 0.0 {
                b.scaled_add(confidence, y);
            }
            rated = true;
        }
        if !rated {
            return Ok(b);
        }
        for i in 0..k {
            a[[i, i]] += self.params.lambda;
        }
        Ok(a.solve(&b)?)
    }
}

impl AlternatingRound for ImplicitAlsRound {
    type Data = RatingsBlock;
    type Model = PartialModel;
    type Routing = OutBlocks;
    type Summary = PartialGram;
    type Merged = Gram;
    type Shipment = FactorShipment;

    const STEP1: &'static str = "implicit_als/step1";
    const STEP2: &'static str = "implicit_als/step2";
    const STEP3: &'static str = "implicit_als/step3";
    const STEP4: &'static str = "implicit_als/step4";

    fn step1(&self, model: &PartialModel) -> Result<PartialGram, KernelError> {
        Ok(PartialGram {
            gram: model.factors.t().dot(&model.factors),
        })
    }

    fn step2(&self, summaries: Vec<(PartitionIndex, PartialGram)>) -> Result<Gram, KernelError> {
        let k = self.params.n_factors;
        let mut gram = Array2::zeros((k, k));
        for (_, partial) in summaries {
            if partial.gram.dim() != (k, k) {
                return Err(KernelError::DimensionMismatch {
                    context: "implicit ALS Gram matrix",
                    expected: k,
                    found: partial.gram.nrows(),
                });
            }
            gram += &partial.gram;
        }
        Ok(Gram { gram })
    }

    fn step3(
        &self,
        model: &PartialModel,
        routing: &OutBlocks,
    ) -> Result<KeyedPartialCollection<FactorShipment>, KernelError> {
        routing
            .rows
            .iter()
            .map(|(destination, rows)| {
                if let Some(&bad) = rows.iter().find(|&&r| r >= model.factors.nrows()) {
                    return Err(KernelError::DimensionMismatch {
                        context: "implicit ALS out-block",
                        expected: model.factors.nrows(),
                        found: bad + 1,
                    });
                }
                let shipment = FactorShipment {
                    ids: rows.iter().map(|r| model.offset + r).collect(),
                    factors: model.factors.select(Axis(0), rows),
                };
                Ok((*destination, shipment))
            })
            .collect()
    }

    fn step4(
        &self,
        data: &RatingsBlock,
        merged: Gram,
        received: KeyedPartialCollection<FactorShipment>,
    ) -> Result<PartialModel, KernelError> {
        let mut lookup: AHashMap<usize, ArrayView1<'_, f64>> = AHashMap::new();
        for (_, shipment) in received.iter() {
            for (id, row) in shipment.ids.iter().zip(shipment.factors.rows()) {
                lookup.insert(*id, row);
            }
        }
        let mut factors = Array2::zeros((data.ratings.n_rows(), merged.gram.nrows()));
        for (row, mut out) in factors.rows_mut().into_iter().enumerate() {
            let solved = self.solve_row(&merged.gram, data.ratings.row(row), &lookup)?;
            out.assign(&solved);
        }
        Ok(PartialModel {
            offset: data.offset,
            factors,
        })
    }
}

/// Trained factors of both sides with their layouts.
#[derive(Clone, Debug)]
pub struct AlsModel {
    pub users: Vec<(PartitionIndex, PartialModel)>,
    pub items: Vec<(PartitionIndex, PartialModel)>,
    pub user_layout: RowPartition,
    pub item_layout: RowPartition,
}

/// Trains on user-major rating blocks. Items are split into as many
/// near-equal partitions as there are user partitions.
pub fn train(
    coordinator: &Coordinator,
    inputs: Vec<(PartitionIndex, PartitionBlock)>,
    params: &AlsParams,
    observer: &mut dyn IterationObserver,
) -> Result<AlsModel, PipelineError> {
    let executor = coordinator.executor();
    let n_items = inputs.iter().map(|(_, b)| b.n_cols()).max().unwrap_or(0);
    let n_parts = inputs.len();
    let (user_layout, users) =
        ratings_blocks(inputs).map_err(PipelineError::master("implicit_als/layout"))?;
    let item_layout = RowPartition::even(n_items, n_parts);
    let items =
        transpose_partitioned(&users, &item_layout).map_err(PipelineError::master("implicit_als/transpose"))?;
    info!(
        "Implicit ALS over {} users in {} partitions and {} items in {} partitions.",
        user_layout.total_rows(),
        users.len(),
        item_layout.total_rows(),
        items.len()
    );

    let user_routing = executor.execute("implicit_als/out_blocks", &users, |index, block| {
        out_blocks(block, &item_layout).map_err(PipelineError::stage("implicit_als/out_blocks", index))
    })?;
    let item_routing = executor.execute("implicit_als/out_blocks", &items, |index, block| {
        out_blocks(block, &user_layout).map_err(PipelineError::stage("implicit_als/out_blocks", index))
    })?;
    let mut item_models = executor.execute("implicit_als/init", &items, |index, block| {
        init_model(block, params).map_err(PipelineError::stage("implicit_als/init", index))
    })?;

    let round = ImplicitAlsRound { params: params.clone() };
    let mut user_models = Vec::new();
    observer.on_start(IterativeAlgorithm::ImplicitAls, params.max_iterations);
    for iteration in 0..params.max_iterations {
        user_models = coordinator.half_iteration(&round, &item_models, &item_routing, &users)?;
        item_models = coordinator.half_iteration(&round, &user_models, &user_routing, &items)?;
        observer.on_iteration(IterativeAlgorithm::ImplicitAls, iteration + 1, None);
    }
    observer.on_finish(IterativeAlgorithm::ImplicitAls);
    Ok(AlsModel {
        users: user_models,
        items: item_models,
        user_layout,
        item_layout,
    })
}

/// Predicted preference of every user for every item, one table per
/// (user partition, item partition) pair, keyed by user partition.
pub fn predict_ratings(
    coordinator: &Coordinator,
    model: &AlsModel,
) -> Result<Vec<(PartitionIndex, Vec<(PartitionIndex, Array2<f64>)>)>, PipelineError> {
    coordinator
        .executor()
        .execute("implicit_als/predict", &model.users, |_, users| {
            Ok(model
                .items
                .iter()
                .map(|(item_index, items)| (*item_index, users.factors.dot(&items.factors.t())))
                .collect())
        })
}
