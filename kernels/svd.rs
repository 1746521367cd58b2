//! Thin SVD over row partitions, built on the same first two steps as TSQR.
//! The master additionally takes the SVD `R = U_r S V^T` and routes
//! `Q'_i U_r` back, so step 3 yields partition `i`'s rows of `U`.

use crate::block::PartitionBlock;
use crate::envelope::Payload;
use crate::error::KernelError;
use crate::kernels::linalg::thin_svd;
use crate::kernels::qr::{factor_block, merge_factors};
use crate::operation::Decomposition;
use crate::types::{GlobalResult, KeyedPartialCollection, PartitionIndex};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SvdBlockR {
    pub r: Array2<f64>,
}

impl Payload for SvdBlockR {
    const TAG: &'static str = "svd/step1ForStep2";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SvdBlockQ {
    pub q: Array2<f64>,
}

impl Payload for SvdBlockQ {
    const TAG: &'static str = "svd/step1ForStep3";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutedU {
    pub u: Array2<f64>,
}

impl Payload for RoutedU {
    const TAG: &'static str = "svd/step2ForStep3";
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Svd;

impl Decomposition for Svd {
    type Input = PartitionBlock;
    type ForMaster = SvdBlockR;
    type Cached = SvdBlockQ;
    type Routed = RoutedU;

    const STEP1: &'static str = "svd/step1";
    const STEP2: &'static str = "svd/step2";
    const STEP3: &'static str = "svd/step3";
    const FACTOR: &'static str = "U";

    fn step1(&self, input: &PartitionBlock) -> Result<(SvdBlockR, SvdBlockQ), KernelError> {
        let (q, r) = factor_block(input)?;
        Ok((SvdBlockR { r }, SvdBlockQ { q }))
    }

    fn step2(
        &self,
        partials: Vec<(PartitionIndex, SvdBlockR)>,
    ) -> Result<(GlobalResult, KeyedPartialCollection<RoutedU>), KernelError> {
        let factors: Vec<_> = partials.into_iter().map(|(i, p)| (i, p.r)).collect();
        let (r, routed) = merge_factors(&factors)?;
        let (u_r, sigma, vt) = thin_svd(&r)?;
        let routed = routed
            .into_iter()
            .map(|(index, q)| (index, RoutedU { u: q.dot(&u_r) }))
            .collect();
        let global = GlobalResult::new()
            .with("singularValues", sigma.insert_axis(Axis(0)))
            .with("rightSingularMatrix", vt);
        Ok((global, routed))
    }

    fn step3(&self, cached: SvdBlockQ, routed: RoutedU) -> Result<Array2<f64>, KernelError> {
        if cached.q.ncols() != routed.u.nrows() {
            return Err(KernelError::DimensionMismatch {
                context: "svd step 3",
                expected: cached.q.ncols(),
                found: routed.u.nrows(),
            });
        }
        Ok(cached.q.dot(&routed.u))
    }
}
