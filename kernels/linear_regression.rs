//! Multiple linear regression with an intercept.
//!
//! Both methods are one-shot aggregations over labelled blocks. The model is
//! the table `beta` of shape [n_responses, n_features + 1]; column 0 holds the
//! intercepts.

use crate::block::{LabeledBlock, PartitionBlock};
use crate::envelope::Payload;
use crate::error::KernelError;
use crate::kernels::linalg::{solve_upper, stack_rows, thin_qr};
use crate::operation::Aggregation;
use crate::types::{GlobalResult, PartitionIndex};
use ndarray::{Array2, Axis, concatenate, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionMethod {
    #[default]
    NormalEquations,
    Qr,
}

/// `[1 | X]` for one labelled block, after checking it against its responses.
fn design_matrix(input: &LabeledBlock) -> Result<Array2<f64>, KernelError> {
    let n = input.data.n_rows();
    if input.labels.nrows() != n {
        return Err(KernelError::DimensionMismatch {
            context: "regression responses",
            expected: n,
            found: input.labels.nrows(),
        });
    }
    if input.labels.ncols() == 0 {
        return Err(KernelError::InvalidParameter(
            "at least one response column is required".to_string(),
        ));
    }
    let x = input.data.to_dense();
    let ones = Array2::ones((n, 1));
    Ok(concatenate(Axis(1), &[ones.view(), x.view()])?)
}

/// `Z^T Z` and `Z^T Y` of one block, `Z` being the design matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalEquationsPartial {
    pub n: u64,
    pub xtx: Array2<f64>,
    pub xty: Array2<f64>,
}

impl Payload for NormalEquationsPartial {
    const TAG: &'static str = "linear_regression_normeq/partial";
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NormalEquationsTraining;

impl Aggregation for NormalEquationsTraining {
    type Input = LabeledBlock;
    type Partial = NormalEquationsPartial;

    const LOCAL_STAGE: &'static str = "linear_regression_normeq/local";
    const MERGE_STAGE: &'static str = "linear_regression_normeq/master";

    fn local(&self, _index: PartitionIndex, input: &LabeledBlock) -> Result<NormalEquationsPartial, KernelError> {
        let z = design_matrix(input)?;
        Ok(NormalEquationsPartial {
            n: z.nrows() as u64,
            xtx: z.t().dot(&z),
            xty: z.t().dot(&input.labels),
        })
    }

    fn combine(
        &self,
        mut left: NormalEquationsPartial,
        right: NormalEquationsPartial,
    ) -> Result<NormalEquationsPartial, KernelError> {
        if left.xty.dim() != right.xty.dim() {
            return Err(KernelError::DimensionMismatch {
                context: "normal equations merge",
                expected: left.xtx.ncols(),
                found: right.xtx.ncols(),
            });
        }
        left.n += right.n;
        left.xtx += &right.xtx;
        left.xty += &right.xty;
        Ok(left)
    }

    fn finalize(&self, total: NormalEquationsPartial) -> Result<GlobalResult, KernelError> {
        let width = total.xtx.ncols();
        if (total.n as usize) < width {
            return Err(KernelError::InsufficientObservations {
                required: width,
                found: total.n as usize,
            });
        }
        let mut beta = Array2::zeros((total.xty.ncols(), width));
        for (j, rhs) in total.xty.columns().into_iter().enumerate() {
            let solution = total.xtx.solve(&rhs.to_owned())?;
            beta.row_mut(j).assign(&solution);
        }
        Ok(GlobalResult::new().with("beta", beta))
    }
}

/// Triangular factor of `[Z | Y]`. Its leading square block is the `R` of `Z`
/// and the columns to its right hold `Q^T Y`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QrPartial {
    pub n_features: usize,
    pub r: Array2<f64>,
}

impl Payload for QrPartial {
    const TAG: &'static str = "linear_regression_qr/partial";
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QrTraining;

impl Aggregation for QrTraining {
    type Input = LabeledBlock;
    type Partial = QrPartial;

    const LOCAL_STAGE: &'static str = "linear_regression_qr/local";
    const MERGE_STAGE: &'static str = "linear_regression_qr/master";

    fn local(&self, _index: PartitionIndex, input: &LabeledBlock) -> Result<QrPartial, KernelError> {
        let z = design_matrix(input)?;
        let augmented = concatenate(Axis(1), &[z.view(), input.labels.view()])?;
        let (_, r) = thin_qr(&augmented)?;
        Ok(QrPartial {
            n_features: z.ncols() - 1,
            r,
        })
    }

    fn combine(&self, left: QrPartial, right: QrPartial) -> Result<QrPartial, KernelError> {
        if left.r.ncols() != right.r.ncols() {
            return Err(KernelError::DimensionMismatch {
                context: "regression QR merge",
                expected: left.r.ncols(),
                found: right.r.ncols(),
            });
        }
        let (stacked, _) = stack_rows(&[left.r.view(), right.r.view()])?;
        let (_, r) = thin_qr(&stacked)?;
        Ok(QrPartial {
            n_features: left.n_features,
            r,
        })
    }

    fn finalize(&self, total: QrPartial) -> Result<GlobalResult, KernelError> {
        let width = total.n_features + 1;
        if total.r.nrows() < width {
            return Err(KernelError::InsufficientObservations {
                required: width,
                found: total.r.nrows(),
            });
        }
        let r = total.r.slice(s![..width, ..width]).to_owned();
        let qty = total.r.slice(s![..width, width..]).to_owned();
        let solution = solve_upper(&r, &qty)?;
        Ok(GlobalResult::new().with("beta", solution.reversed_axes()))
    }
}

/// Predicted responses for every row, shape [n_rows, n_responses].
pub fn predict(block: &PartitionBlock, beta: &Array2<f64>) -> Result<Array2<f64>, KernelError> {
    if beta.ncols() != block.n_cols() + 1 {
        return Err(KernelError::DimensionMismatch {
            context: "regression prediction",
            expected: beta.ncols().saturating_sub(1),
            found: block.n_cols(),
        });
    }
    let slopes = beta.slice(s![.., 1..]);
    let intercepts = beta.column(0);
    Ok(block.to_dense().dot(&slopes.t()) + &intercepts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// y0 = 1 + 2 x0 - x1, y1 = -3 + 0.5 x1 on a non-degenerate grid.
    fn exact_blocks() -> Vec<LabeledBlock> {
        let x = Array2::from_shape_fn((9, 2), |(i, j)| if j == 0 { (i % 3) as f64 } else { (i / 3) as f64 + 0.1 * i as f64 });
        let y = Array2::from_shape_fn((9, 2), |(i, j)| {
            let (a, b) = (x[[i, 0]], x[[i, 1]]);
            if j == 0 { 1.0 + 2.0 * a - b } else { -3.0 + 0.5 * b }
        });
        [0..4, 4..9]
            .into_iter()
            .map(|rows| LabeledBlock {
                data: PartitionBlock::Dense(x.slice(s![rows.clone(), ..]).to_owned()),
                labels: y.slice(s![rows, ..]).to_owned(),
            })
            .collect()
    }

    fn train<A: Aggregation<Input = LabeledBlock>>(op: &A) -> Array2<f64> {
        let partials: Vec<_> = exact_blocks()
            .iter()
            .enumerate()
            .map(|(i, b)| op.local(PartitionIndex(i as u32), b).unwrap())
            .collect();
        let mut iter = partials.into_iter();
        let first = iter.next().unwrap();
        let total = iter.fold(first, |acc, p| op.combine(acc, p).unwrap());
        op.finalize(total).unwrap().require("beta").unwrap().clone()
    }

    #[test]
    fn both_methods_recover_exact_coefficients() {
        let expected = array![[1.0, 2.0, -1.0], [-3.0, 0.0, 0.5]];
        assert_abs_diff_eq!(train(&NormalEquationsTraining), expected, epsilon = 1e-9);
        assert_abs_diff_eq!(train(&QrTraining), expected, epsilon = 1e-9);
    }

    #[test]
    fn prediction_applies_intercepts() {
        let beta = array![[1.0, 2.0, -1.0]];
        let block = PartitionBlock::Dense(array![[1.0, 1.0], [0.0, 3.0]]);
        assert_eq!(predict(&block, &beta).unwrap(), array![[2.0], [-2.0]]);
    }

    #[test]
    fn too_few_rows_cannot_be_solved() {
        let block = LabeledBlock {
            data: PartitionBlock::Dense(array![[1.0, 2.0]]),
            labels: array![[3.0]],
        };
        let partial = QrTraining.local(PartitionIndex(0), &block).unwrap();
        assert!(matches!(
            QrTraining.finalize(partial),
            Err(KernelError::InsufficientObservations { required: 3, .. })
        ));
    }
}
