//! Tall-skinny QR over row partitions.
//!
//! Step 1 factors each block `X_i = Q_i R_i`. Step 2 stacks the `R_i` in
//! partition order and factors the stack `[R_1; ...; R_k] = Q' R`; the rows of
//! `Q'` that belong to block `i` are routed back to it. Step 3 forms
//! `Q_i Q'_i`, partition `i`'s rows of the global `Q`.

use crate::block::PartitionBlock;
use crate::envelope::Payload;
use crate::error::KernelError;
use crate::kernels::linalg::{stack_rows, thin_qr};
use crate::operation::Decomposition;
use crate::types::{GlobalResult, KeyedPartialCollection, PartitionIndex};
use ndarray::{Array2, ArrayView2, s};
use serde::{Deserialize, Serialize};

/// Upper-triangular factor of one block, bound for the master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockR {
    pub r: Array2<f64>,
}

impl Payload for BlockR {
    const TAG: &'static str = "qr/step1ForStep2";
}

/// Orthonormal factor of one block, kept for step 3.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockQ {
    pub q: Array2<f64>,
}

impl Payload for BlockQ {
    const TAG: &'static str = "qr/step1ForStep3";
}

/// The partition's slice of the master's orthonormal factor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutedQ {
    pub q: Array2<f64>,
}

impl Payload for RoutedQ {
    const TAG: &'static str = "qr/step2ForStep3";
}

/// Local factorization shared by QR and SVD.
pub(crate) fn factor_block(input: &PartitionBlock) -> Result<(Array2<f64>, Array2<f64>), KernelError> {
    thin_qr(&input.to_dense())
}

/// Stacks the step-1 factors and splits the stacked QR back per partition.
pub(crate) fn merge_factors(
    partials: &[(PartitionIndex, Array2<f64>)],
) -> Result<(Array2<f64>, Vec<(PartitionIndex, Array2<f64>)>), KernelError> {
    let width = partials.first().map(|(_, r)| r.ncols()).unwrap_or(0);
    if let Some((_, bad)) = partials.iter().find(|(_, r)| r.ncols() != width) {
        return Err(KernelError::DimensionMismatch {
            context: "stacked triangular factors",
            expected: width,
            found: bad.ncols(),
        });
    }
    let views: Vec<ArrayView2<'_, f64>> = partials.iter().map(|(_, r)| r.view()).collect();
    let (stacked, spans) = stack_rows(&views)?;
    if stacked.nrows() < width {
        return Err(KernelError::InsufficientObservations {
            required: width,
            found: stacked.nrows(),
        });
    }
    let (q, r) = thin_qr(&stacked)?;
    let routed = partials
        .iter()
        .zip(spans)
        .map(|((index, _), span)| (*index, q.slice(s![span, ..]).to_owned()))
        .collect();
    Ok((r, routed))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Qr;

impl Decomposition for Qr {
    type Input = PartitionBlock;
    type ForMaster = BlockR;
    type Cached = BlockQ;
    type Routed = RoutedQ;

    const STEP1: &'static str = "qr/step1";
    const STEP2: &'static str = "qr/step2";
    const STEP3: &'static str = "qr/step3";
    const FACTOR: &'static str = "Q";

    fn step1(&self, input: &PartitionBlock) -> Result<(BlockR, BlockQ), KernelError> {
        let (q, r) = factor_block(input)?;
        Ok((BlockR { r }, BlockQ { q }))
    }

    fn step2(
        &self,
        partials: Vec<(PartitionIndex, BlockR)>,
    ) -> Result<(GlobalResult, KeyedPartialCollection<RoutedQ>), KernelError> {
        let factors: Vec<_> = partials.into_iter().map(|(i, p)| (i, p.r)).collect();
        let (r, routed) = merge_factors(&factors)?;
        let routed = routed
            .into_iter()
            .map(|(index, q)| (index, RoutedQ { q }))
            .collect();
        Ok((GlobalResult::new().with("matrixR", r), routed))
    }

    fn step3(&self, cached: BlockQ, routed: RoutedQ) -> Result<Array2<f64>, KernelError> {
        if cached.q.ncols() != routed.q.nrows() {
            return Err(KernelError::DimensionMismatch {
                context: "qr step 3",
                expected: cached.q.ncols(),
                found: routed.q.nrows(),
            });
        }
        Ok(cached.q.dot(&routed.q))
    }
}
