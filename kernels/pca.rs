//! Principal component analysis of the correlation structure.
//!
//! Two distributed methods produce the same answer:
//! * `Correlation` merges centered cross-products and eigen-decomposes the
//!   correlation matrix at the master;
//! * `Svd` keeps only each block's triangular QR factor plus its mean, merges
//!   those by stacking and re-factoring, and finishes with an SVD of the
//!   column-normalized factor.
//!
//! Eigenvectors are reported as rows, largest eigenvalue first.

use crate::block::PartitionBlock;
use crate::envelope::Payload;
use crate::error::KernelError;
use crate::kernels::covariance::CrossProductPartial;
use crate::kernels::linalg::{inverse_sqrt_diagonal, stack_rows, symmetric_eigen, thin_qr, thin_svd};
use crate::operation::Aggregation;
use crate::types::{GlobalResult, PartitionIndex};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcaMethod {
    #[default]
    Correlation,
    Svd,
}

fn eigen_tables(values: Array1<f64>, vectors_as_rows: Array2<f64>) -> GlobalResult {
    GlobalResult::new()
        .with("eigenvalues", values.insert_axis(Axis(0)))
        .with("eigenvectors", vectors_as_rows)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PcaCorrelation;

impl Aggregation for PcaCorrelation {
    type Input = PartitionBlock;
    type Partial = CrossProductPartial;

    const LOCAL_STAGE: &'static str = "pca_correlation/local";
    const MERGE_STAGE: &'static str = "pca_correlation/master";

    fn local(&self, _index: PartitionIndex, input: &PartitionBlock) -> Result<CrossProductPartial, KernelError> {
        CrossProductPartial::from_block(input)
    }

    fn combine(
        &self,
        left: CrossProductPartial,
        right: CrossProductPartial,
    ) -> Result<CrossProductPartial, KernelError> {
        left.merge(right)
    }

    fn finalize(&self, total: CrossProductPartial) -> Result<GlobalResult, KernelError> {
        let (values, vectors) = symmetric_eigen(&total.correlation())?;
        Ok(eigen_tables(values, vectors.reversed_axes())
            .with("mean", total.mean().insert_axis(Axis(0))))
    }
}

/// Count, mean and the triangular factor of the centered block.
/// `r^T r` equals the block's centered cross-product matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScatterFactor {
    pub n: u64,
    pub mean: Array1<f64>,
    pub r: Array2<f64>,
}

impl Payload for ScatterFactor {
    const TAG: &'static str = "pca_svd/partial";
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PcaSvd;

impl Aggregation for PcaSvd {
    type Input = PartitionBlock;
    type Partial = ScatterFactor;

    const LOCAL_STAGE: &'static str = "pca_svd/local";
    const MERGE_STAGE: &'static str = "pca_svd/master";

    fn local(&self, _index: PartitionIndex, input: &PartitionBlock) -> Result<ScatterFactor, KernelError> {
        let x = input.to_dense();
        let mean = x.mean_axis(Axis(0)).ok_or(KernelError::InsufficientObservations {
            required: 1,
            found: 0,
        })?;
        let centered = &*x - &mean;
        let (_, r) = thin_qr(&centered)?;
        Ok(ScatterFactor {
            n: x.nrows() as u64,
            mean,
            r,
        })
    }

    fn combine(&self, left: ScatterFactor, right: ScatterFactor) -> Result<ScatterFactor, KernelError> {
        if left.mean.len() != right.mean.len() {
            return Err(KernelError::DimensionMismatch {
                context: "scatter factor merge",
                expected: left.mean.len(),
                found: right.mean.len(),
            });
        }
        let (n1, n2) = (left.n as f64, right.n as f64);
        let n = n1 + n2;
        let shift = (&right.mean - &left.mean) * (n1 * n2 / n).sqrt();
        let shift = shift.insert_axis(Axis(0));
        let (stacked, _) = stack_rows(&[left.r.view(), right.r.view(), shift.view()])?;
        let (_, r) = thin_qr(&stacked)?;
        let mean = (&left.mean * n1 + &right.mean * n2) / n;
        Ok(ScatterFactor {
            n: left.n + right.n,
            mean,
            r,
        })
    }

    fn finalize(&self, total: ScatterFactor) -> Result<GlobalResult, KernelError> {
        let scatter = total.r.t().dot(&total.r);
        let scale = inverse_sqrt_diagonal(&scatter);
        let normalized = &total.r * &scale.view().insert_axis(Axis(0));
        let (_, sigma, vt) = thin_svd(&normalized)?;
        let p = total.mean.len();
        let mut values = Array1::zeros(p);
        for (i, s) in sigma.iter().enumerate().take(p) {
            values[i] = s * s;
        }
        let mut vectors = Array2::zeros((p, p));
        vectors
            .slice_mut(ndarray::s![..vt.nrows(), ..])
            .assign(&vt);
        Ok(eigen_tables(values, vectors).with("mean", total.mean.insert_axis(Axis(0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::s;

    fn data() -> Array2<f64> {
        Array2::from_shape_fn((24, 4), |(i, j)| {
            let t = i as f64;
            match j {
                0 => t.sin() * 3.0 + t * 0.1,
                1 => t.cos() + 0.5 * t.sin(),
                2 => (t * 0.7).sin() - t * 0.05,
                _ => ((i * 13) % 7) as f64,
            }
        })
    }

    fn run<A: Aggregation<Input = PartitionBlock>>(op: &A, x: &Array2<f64>, cuts: &[usize]) -> GlobalResult {
        let mut bounds = vec![0];
        bounds.extend_from_slice(cuts);
        bounds.push(x.nrows());
        let partials: Vec<_> = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let block = PartitionBlock::Dense(x.slice(s![w[0]..w[1], ..]).to_owned());
                op.local(PartitionIndex(i as u32), &block).unwrap()
            })
            .collect();
        let mut iter = partials.into_iter();
        let first = iter.next().unwrap();
        let total = iter.fold(first, |acc, p| op.combine(acc, p).unwrap());
        op.finalize(total).unwrap()
    }

    #[test]
    fn both_methods_find_the_same_components() {
        let x = data();
        let by_corr = run(&PcaCorrelation, &x, &[7, 15]);
        let by_svd = run(&PcaSvd, &x, &[5, 11, 19]);
        assert_abs_diff_eq!(
            by_corr.require("eigenvalues").unwrap(),
            by_svd.require("eigenvalues").unwrap(),
            epsilon = 1e-8
        );
        assert_abs_diff_eq!(
            by_corr.require("eigenvectors").unwrap(),
            by_svd.require("eigenvectors").unwrap(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn eigenvalues_sum_to_the_feature_count() {
        let result = run(&PcaSvd, &data(), &[12]);
        let total: f64 = result.require("eigenvalues").unwrap().sum();
        assert_abs_diff_eq!(total, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn partitioning_does_not_change_the_svd_merge() {
        let x = data();
        let one = run(&PcaSvd, &x, &[]);
        let many = run(&PcaSvd, &x, &[3, 4, 10, 17]);
        assert_abs_diff_eq!(
            one.require("eigenvalues").unwrap(),
            many.require("eigenvalues").unwrap(),
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            one.require("mean").unwrap(),
            many.require("mean").unwrap(),
            epsilon = 1e-12
        );
    }
}
