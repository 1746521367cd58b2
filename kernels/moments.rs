//! Low-order moments of every feature.

use crate::block::PartitionBlock;
use crate::envelope::Payload;
use crate::error::KernelError;
use crate::operation::Aggregation;
use crate::types::{GlobalResult, PartitionIndex};
use ndarray::{Array1, Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Sufficient statistics of one block. Implicit zeros of sparse blocks count
/// as observations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MomentsPartial {
    pub n: u64,
    pub minimum: Array1<f64>,
    pub maximum: Array1<f64>,
    pub sum: Array1<f64>,
    pub sum_squares: Array1<f64>,
    /// Sum of squared deviations from this block's own mean.
    pub sum_squares_centered: Array1<f64>,
}

impl Payload for MomentsPartial {
    const TAG: &'static str = "low_order_moments/partial";
}

impl MomentsPartial {
    pub fn from_block(block: &PartitionBlock) -> Result<Self, KernelError> {
        let n_rows = block.n_rows();
        if n_rows == 0 {
            return Err(KernelError::InsufficientObservations {
                required: 1,
                found: 0,
            });
        }
        let n = n_rows as f64;
        let (minimum, maximum, sum, sum_squares) = match block {
            PartitionBlock::Dense(x) => (
                x.fold_axis(Axis(0), f64::INFINITY, |a, &b| a.min(b)),
                x.fold_axis(Axis(0), f64::NEG_INFINITY, |a, &b| a.max(b)),
                x.sum_axis(Axis(0)),
                x.mapv(|v| v * v).sum_axis(Axis(0)),
            ),
            PartitionBlock::Sparse(csr) => {
                let p = csr.n_cols();
                let mut minimum = Array1::from_elem(p, f64::INFINITY);
                let mut maximum = Array1::from_elem(p, f64::NEG_INFINITY);
                let mut sum = Array1::zeros(p);
                let mut sum_squares = Array1::zeros(p);
                let mut stored = vec![0usize; p];
                for r in 0..csr.n_rows() {
                    for (c, v) in csr.row(r) {
                        minimum[c] = f64::min(minimum[c], v);
                        maximum[c] = f64::max(maximum[c], v);
                        sum[c] += v;
                        sum_squares[c] += v * v;
                        stored[c] += 1;
                    }
                }
                for (c, &count) in stored.iter().enumerate() {
                    if count < n_rows {
                        minimum[c] = minimum[c].min(0.0);
                        maximum[c] = maximum[c].max(0.0);
                    }
                }
                (minimum, maximum, sum, sum_squares)
            }
        };
        let sum_squares_centered = Zip::from(&sum_squares)
            .and(&sum)
            .map_collect(|&sq, &s| (sq - s * s / n).max(0.0));
        Ok(Self {
            n: n_rows as u64,
            minimum,
            maximum,
            sum,
            sum_squares,
            sum_squares_centered,
        })
    }

    /// Pairwise update of the centered sums (Chan et al.).
    pub fn merge(mut self, other: MomentsPartial) -> Result<Self, KernelError> {
        if self.sum.len() != other.sum.len() {
            return Err(KernelError::DimensionMismatch {
                context: "low-order moments merge",
                expected: self.sum.len(),
                found: other.sum.len(),
            });
        }
        let (n1, n2) = (self.n as f64, other.n as f64);
        let n = n1 + n2;
        let delta = &other.sum / n2 - &self.sum / n1;
        self.sum_squares_centered =
            &self.sum_squares_centered + &other.sum_squares_centered + delta.mapv(|d| d * d * n1 * n2 / n);
        Zip::from(&mut self.minimum)
            .and(&other.minimum)
            .for_each(|a, &b| *a = a.min(b));
        Zip::from(&mut self.maximum)
            .and(&other.maximum)
            .for_each(|a, &b| *a = a.max(b));
        self.sum += &other.sum;
        self.sum_squares += &other.sum_squares;
        self.n += other.n;
        Ok(self)
    }
}

fn row(v: Array1<f64>) -> Array2<f64> {
    v.insert_axis(Axis(0))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LowOrderMoments;

impl Aggregation for LowOrderMoments {
    type Input = PartitionBlock;
    type Partial = MomentsPartial;

    const LOCAL_STAGE: &'static str = "low_order_moments/local";
    const MERGE_STAGE: &'static str = "low_order_moments/master";

    fn local(&self, _index: PartitionIndex, input: &PartitionBlock) -> Result<MomentsPartial, KernelError> {
        MomentsPartial::from_block(input)
    }

    fn combine(&self, left: MomentsPartial, right: MomentsPartial) -> Result<MomentsPartial, KernelError> {
        left.merge(right)
    }

    fn finalize(&self, total: MomentsPartial) -> Result<GlobalResult, KernelError> {
        let n = total.n as f64;
        let mean = &total.sum / n;
        let raw_second = &total.sum_squares / n;
        let variance = if total.n > 1 {
            &total.sum_squares_centered / (n - 1.0)
        } else {
            Array1::zeros(total.sum.len())
        };
        let standard_deviation = variance.mapv(f64::sqrt);
        let variation = &standard_deviation / &mean;
        Ok(GlobalResult::new()
            .with("minimum", row(total.minimum))
            .with("maximum", row(total.maximum))
            .with("sum", row(total.sum))
            .with("sumSquares", row(total.sum_squares))
            .with("sumSquaresCentered", row(total.sum_squares_centered))
            .with("mean", row(mean))
            .with("secondOrderRawMoment", row(raw_second))
            .with("variance", row(variance))
            .with("standardDeviation", row(standard_deviation))
            .with("variation", row(variation))
            .with("nObservations", Array2::from_elem((1, 1), n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CsrBlock;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, s};

    #[test]
    fn moments_of_a_single_block() {
        let block = PartitionBlock::Dense(array![[1.0, -2.0], [3.0, 0.0], [5.0, 2.0]]);
        let partial = LowOrderMoments.local(PartitionIndex(0), &block).unwrap();
        let result = LowOrderMoments.finalize(partial).unwrap();
        assert_abs_diff_eq!(result.require("mean").unwrap()[[0, 0]], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.require("variance").unwrap()[[0, 0]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.require("variance").unwrap()[[0, 1]], 4.0, epsilon = 1e-12);
        assert_eq!(result.require("minimum").unwrap()[[0, 1]], -2.0);
        assert_eq!(result.require("maximum").unwrap()[[0, 0]], 5.0);
    }

    #[test]
    fn merging_halves_matches_the_whole() {
        let x = Array2::from_shape_fn((9, 3), |(i, j)| ((i * 7 + j * 3) % 11) as f64 - 4.5);
        let whole = LowOrderMoments
            .local(PartitionIndex(0), &PartitionBlock::Dense(x.clone()))
            .unwrap();
        let top = LowOrderMoments
            .local(PartitionIndex(0), &PartitionBlock::Dense(x.slice(s![..4, ..]).to_owned()))
            .unwrap();
        let bottom = LowOrderMoments
            .local(PartitionIndex(1), &PartitionBlock::Dense(x.slice(s![4.., ..]).to_owned()))
            .unwrap();
        let merged = LowOrderMoments.combine(bottom, top).unwrap();
        assert_eq!(merged.n, 9);
        assert_abs_diff_eq!(merged.sum_squares_centered, whole.sum_squares_centered, epsilon = 1e-9);
        assert_eq!(merged.minimum, whole.minimum);
    }

    #[test]
    fn sparse_blocks_count_implicit_zeros() {
        let csr = CsrBlock::new(2, vec![1, 2, 2, 3], vec![1, 1], vec![4.0, 2.0]).unwrap();
        let sparse = MomentsPartial::from_block(&PartitionBlock::Sparse(csr.clone())).unwrap();
        let dense = MomentsPartial::from_block(&PartitionBlock::Dense(csr.to_dense())).unwrap();
        assert_eq!(sparse.minimum, dense.minimum);
        assert_eq!(sparse.maximum, dense.maximum);
        assert_abs_diff_eq!(sparse.sum_squares_centered, dense.sum_squares_centered, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_widths_cannot_merge() {
        let a = MomentsPartial::from_block(&PartitionBlock::Dense(array![[1.0, 2.0]])).unwrap();
        let b = MomentsPartial::from_block(&PartitionBlock::Dense(array![[1.0]])).unwrap();
        assert!(matches!(
            a.merge(b),
            Err(KernelError::DimensionMismatch { .. })
        ));
    }
}
