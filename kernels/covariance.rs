//! Variance-covariance and correlation matrices.

use crate::block::PartitionBlock;
use crate::envelope::Payload;
use crate::error::KernelError;
use crate::kernels::linalg::inverse_sqrt_diagonal;
use crate::operation::Aggregation;
use crate::types::{GlobalResult, PartitionIndex};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Observation count, column sums and the centered cross-product matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossProductPartial {
    pub n: u64,
    pub sum: Array1<f64>,
    /// `sum_i (x_i - mean)(x_i - mean)^T` around this partial's own mean.
    pub crossproduct: Array2<f64>,
}

impl Payload for CrossProductPartial {
    const TAG: &'static str = "covariance/partial";
}

impl CrossProductPartial {
    pub fn from_block(block: &PartitionBlock) -> Result<Self, KernelError> {
        let n_rows = block.n_rows();
        if n_rows == 0 {
            return Err(KernelError::InsufficientObservations {
                required: 1,
                found: 0,
            });
        }
        let n = n_rows as f64;
        let (sum, crossproduct) = match block {
            PartitionBlock::Dense(x) => {
                let sum = x.sum_axis(Axis(0));
                let centered = x - &(&sum / n);
                (sum, centered.t().dot(&centered))
            }
            PartitionBlock::Sparse(csr) => {
                let p = csr.n_cols();
                let mut sum = Array1::zeros(p);
                let mut raw = Array2::zeros((p, p));
                for r in 0..csr.n_rows() {
                    let entries: Vec<(usize, f64)> = csr.row(r).collect();
                    for &(a, va) in &entries {
                        sum[a] += va;
                        for &(b, vb) in &entries {
                            raw[[a, b]] += va * vb;
                        }
                    }
                }
                let outer = outer(&sum, &sum) / n;
                (sum, raw - outer)
            }
        };
        Ok(Self {
            n: n_rows as u64,
            sum,
            crossproduct,
        })
    }

    pub fn merge(mut self, other: CrossProductPartial) -> Result<Self, KernelError> {
        if self.sum.len() != other.sum.len() {
            return Err(KernelError::DimensionMismatch {
                context: "cross-product merge",
                expected: self.sum.len(),
                found: other.sum.len(),
            });
        }
        let (n1, n2) = (self.n as f64, other.n as f64);
        let delta = &other.sum / n2 - &self.sum / n1;
        let correction = outer(&delta, &delta) * (n1 * n2 / (n1 + n2));
        self.crossproduct = self.crossproduct + &other.crossproduct + correction;
        self.sum += &other.sum;
        self.n += other.n;
        Ok(self)
    }

    pub fn mean(&self) -> Array1<f64> {
        &self.sum / self.n as f64
    }

    pub fn covariance(&self) -> Result<Array2<f64>, KernelError> {
        if self.n < 2 {
            return Err(KernelError::InsufficientObservations {
                required: 2,
                found: self.n as usize,
            });
        }
        Ok(&self.crossproduct / (self.n as f64 - 1.0))
    }

    /// Correlation matrix; constant features get a zero row and column.
    pub fn correlation(&self) -> Array2<f64> {
        let scale = inverse_sqrt_diagonal(&self.crossproduct);
        let mut corr = &self.crossproduct * &outer(&scale, &scale);
        for (i, s) in scale.iter().enumerate() {
            if *s > 0.0 {
                corr[[i, i]] = 1.0;
            }
        }
        corr
    }
}

pub(crate) fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    let col = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    col.dot(&row)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovarianceOutput {
    #[default]
    Covariance,
    Correlation,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Covariance {
    pub output: CovarianceOutput,
}

impl Aggregation for Covariance {
    type Input = PartitionBlock;
    type Partial = CrossProductPartial;

    const LOCAL_STAGE: &'static str = "covariance/local";
    const MERGE_STAGE: &'static str = "covariance/master";

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
        let mean = total.mean().insert_axis(Axis(0));
        let result = GlobalResult::new().with("mean", mean);
        Ok(match self.output {
            CovarianceOutput::Covariance => result.with("covariance", total.covariance()?),
            CovarianceOutput::Correlation => result.with("correlation", total.correlation()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CsrBlock;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, s};

    fn sample() -> Array2<f64> {
        array![
            [1.0, 2.0, 0.0],
            [2.0, 1.0, 0.0],
            [4.0, 5.0, 1.0],
            [0.0, 3.0, 0.0],
            [3.0, 0.0, 2.0]
        ]
    }

    #[test]
    fn covariance_matches_the_textbook_formula() {
        let x = sample();
        let partial = CrossProductPartial::from_block(&PartitionBlock::Dense(x.clone())).unwrap();
        let mean = x.mean_axis(Axis(0)).unwrap();
        let centered = &x - &mean;
        let expected = centered.t().dot(&centered) / 4.0;
        assert_abs_diff_eq!(partial.covariance().unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn merged_partials_equal_the_whole() {
        let x = sample();
        let whole = CrossProductPartial::from_block(&PartitionBlock::Dense(x.clone())).unwrap();
        let a = CrossProductPartial::from_block(&PartitionBlock::Dense(x.slice(s![..2, ..]).to_owned()))
            .unwrap();
        let b = CrossProductPartial::from_block(&PartitionBlock::Dense(x.slice(s![2.., ..]).to_owned()))
            .unwrap();
        let merged = a.merge(b).unwrap();
        assert_abs_diff_eq!(merged.crossproduct, whole.crossproduct, epsilon = 1e-12);
        assert_abs_diff_eq!(merged.correlation(), whole.correlation(), epsilon = 1e-12);
    }

    #[test]
    fn sparse_and_dense_blocks_agree() {
        let csr = CsrBlock::new(3, vec![1, 3, 3, 4], vec![1, 3, 2], vec![1.0, 2.0, 3.0]).unwrap();
        let sparse = CrossProductPartial::from_block(&PartitionBlock::Sparse(csr.clone())).unwrap();
        let dense = CrossProductPartial::from_block(&PartitionBlock::Dense(csr.to_dense())).unwrap();
        assert_abs_diff_eq!(sparse.crossproduct, dense.crossproduct, epsilon = 1e-12);
    }

    #[test]
    fn correlation_has_a_unit_diagonal() {
        let partial = CrossProductPartial::from_block(&PartitionBlock::Dense(sample())).unwrap();
        let result = Covariance {
            output: CovarianceOutput::Correlation,
        }
        .finalize(partial)
        .unwrap();
        let corr = result.require("correlation").unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(corr[[i, i]], 1.0, epsilon = 1e-12);
        }
        assert!(result.get("covariance").is_none());
    }

    #[test]
    fn a_single_observation_has_no_covariance() {
        let partial = CrossProductPartial::from_block(&PartitionBlock::Dense(array![[1.0, 2.0]])).unwrap();
        assert!(matches!(
            partial.covariance(),
            Err(KernelError::InsufficientObservations { required: 2, found: 1 })
        ));
    }
}
