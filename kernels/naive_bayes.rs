//! Multinomial naive Bayes.
//!
//! Training is a single aggregation: each partition counts its documents per
//! class and totals its feature values per class; the master adds those up
//! and smooths them into log-probabilities. Prediction is a local pass
//! against the finished model.

use crate::block::{LabeledBlock, PartitionBlock};
use crate::envelope::Payload;
use crate::error::KernelError;
use crate::operation::Aggregation;
use crate::types::{GlobalResult, PartitionIndex};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NaiveBayesParams {
    pub n_classes: usize,
    /// Additive (Laplace) smoothing applied to every feature count.
    pub alpha: f64,
}

impl Default for NaiveBayesParams {
    fn default() -> Self {
        Self {
            n_classes: 20,
            alpha: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassTotals {
    pub class_counts: Array1<f64>,
    /// Shape: [n_classes, n_features].
    pub feature_totals: Array2<f64>,
}

impl Payload for ClassTotals {
    const TAG: &'static str = "naive_bayes/partial";
}

fn class_of(label: f64, row: usize, n_classes: usize) -> Result<usize, KernelError> {
    if label < 0.0 || label.fract() != 0.0 || label >= n_classes as f64 {
        return Err(KernelError::InvalidLabel {
            row,
            value: label,
            n_classes,
        });
    }
    Ok(label as usize)
}

#[derive(Clone, Debug, Default)]
pub struct NaiveBayesTraining {
    pub params: NaiveBayesParams,
}

impl Aggregation for NaiveBayesTraining {
    type Input = LabeledBlock;
    type Partial = ClassTotals;

    const LOCAL_STAGE: &'static str = "naive_bayes/local";
    const MERGE_STAGE: &'static str = "naive_bayes/master";

    fn local(&self, _index: PartitionIndex, input: &LabeledBlock) -> Result<ClassTotals, KernelError> {
        let k = self.params.n_classes;
        let n = input.data.n_rows();
        if input.labels.nrows() != n || input.labels.ncols() != 1 {
            return Err(KernelError::DimensionMismatch {
                context: "naive Bayes labels",
                expected: n,
                found: input.labels.nrows(),
            });
        }
        let mut class_counts = Array1::zeros(k);
        let mut feature_totals = Array2::zeros((k, input.data.n_cols()));
        match &input.data {
            PartitionBlock::Dense(x) => {
                for (row, (features, label)) in x.rows().into_iter().zip(input.labels.column(0)).enumerate() {
                    let class = class_of(*label, row, k)?;
                    class_counts[class] += 1.0;
                    feature_totals.row_mut(class).scaled_add(1.0, &features);
                }
            }
            PartitionBlock::Sparse(csr) => {
                for (row, label) in input.labels.column(0).iter().enumerate() {
                    let class = class_of(*label, row, k)?;
                    class_counts[class] += 1.0;
                    for (col, value) in csr.row(row) {
                        feature_totals[[class, col]] += value;
                    }
                }
            }
        }
        Ok(ClassTotals {
            class_counts,
            feature_totals,
        })
    }

    fn combine(&self, mut left: ClassTotals, right: ClassTotals) -> Result<ClassTotals, KernelError> {
        if left.feature_totals.dim() != right.feature_totals.dim() {
            return Err(KernelError::DimensionMismatch {
                context: "naive Bayes class totals",
                expected: left.feature_totals.ncols(),
                found: right.feature_totals.ncols(),
            });
        }
        left.class_counts += &right.class_counts;
        left.feature_totals += &right.feature_totals;
        Ok(left)
    }

    fn finalize(&self, total: ClassTotals) -> Result<GlobalResult, KernelError> {
        let n: f64 = total.class_counts.sum();
        if n == 0.0 {
            return Err(KernelError::InsufficientObservations {
                required: 1,
                found: 0,
            });
        }
        let p = total.feature_totals.ncols() as f64;
        let alpha = self.params.alpha;
        let log_prior = total.class_counts.mapv(|c| (c / n).ln());
        let mut log_theta = total.feature_totals.clone();
        for mut row in log_theta.rows_mut() {
            let denominator = row.sum() + alpha * p;
            row.mapv_inplace(|v| ((v + alpha) / denominator).ln());
        }
        Ok(GlobalResult::new()
            .with("logPrior", log_prior.insert_axis(Axis(0)))
            .with("logTheta", log_theta))
    }
}

/// Trained log-probabilities, ready for prediction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    log_prior: Array1<f64>,
    log_theta: Array2<f64>,
}

impl Payload for NaiveBayesModel {
    const TAG: &'static str = "naive_bayes/model";
}

impl NaiveBayesModel {
    pub fn from_tables(tables: &GlobalResult) -> Result<Self, KernelError> {
        let log_prior = tables.require("logPrior")?.row(0).to_owned();
        let log_theta = tables.require("logTheta")?.clone();
        if log_theta.nrows() != log_prior.len() {
            return Err(KernelError::DimensionMismatch {
                context: "naive Bayes model",
                expected: log_prior.len(),
                found: log_theta.nrows(),
            });
        }
        Ok(Self {
            log_prior,
            log_theta,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.log_prior.len()
    }

    /// Most probable class of every row, as an [n, 1] table. Ties go to the
    /// lower class.
    pub fn predict(&self, block: &PartitionBlock) -> Result<Array2<f64>, KernelError> {
        if block.n_cols() != self.log_theta.ncols() {
            return Err(KernelError::DimensionMismatch {
                context: "naive Bayes prediction",
                expected: self.log_theta.ncols(),
                found: block.n_cols(),
            });
        }
        let scores = block.to_dense().dot(&self.log_theta.t()) + &self.log_prior;
        let labels: Array1<f64> = scores
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0usize, f64::NEG_INFINITY), |best, (k, &s)| if s > best.1 { (k, s) } else { best })
                    .0 as f64
            })
            .collect();
        Ok(labels.insert_axis(Axis(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CsrBlock;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn training(n_classes: usize) -> NaiveBayesTraining {
        NaiveBayesTraining {
            params: NaiveBayesParams {
                n_classes,
                alpha: 1.0,
            },
        }
    }

    fn documents() -> LabeledBlock {
        LabeledBlock {
            data: PartitionBlock::Dense(array![
                [3.0, 0.0, 1.0],
                [4.0, 1.0, 0.0],
                [0.0, 5.0, 1.0],
                [1.0, 3.0, 0.0]
            ]),
            labels: array![[0.0], [0.0], [1.0], [1.0]],
        }
    }

    #[test]
    fn smoothed_probabilities_sum_to_one() {
        let op = training(2);
        let result = op.finalize(op.local(PartitionIndex(0), &documents()).unwrap()).unwrap();
        let log_theta = result.require("logTheta").unwrap();
        for row in log_theta.rows() {
            assert_abs_diff_eq!(row.mapv(f64::exp).sum(), 1.0, epsilon = 1e-12);
        }
        // class 0: totals [7, 1, 1] + alpha over 9 + 3
        assert_abs_diff_eq!(log_theta[[0, 0]], (8.0f64 / 12.0).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(result.require("logPrior").unwrap()[[0, 1]], 0.5f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn training_documents_are_classified_back() {
        let op = training(2);
        let docs = documents();
        let result = op.finalize(op.local(PartitionIndex(0), &docs).unwrap()).unwrap();
        let model = NaiveBayesModel::from_tables(&result).unwrap();
        assert_eq!(model.predict(&docs.data).unwrap(), docs.labels);
    }

    #[test]
    fn sparse_documents_count_like_dense_ones() {
        let op = training(2);
        let dense = documents();
        let sparse = LabeledBlock {
            data: PartitionBlock::Sparse(CsrBlock::from_triplets(
                4,
                3,
                vec![
                    (0, 0, 3.0),
                    (0, 2, 1.0),
                    (1, 0, 4.0),
                    (1, 1, 1.0),
                    (2, 1, 5.0),
                    (2, 2, 1.0),
                    (3, 0, 1.0),
                    (3, 1, 3.0),
                ],
            )
            .unwrap()),
            labels: dense.labels.clone(),
        };
        assert_eq!(
            op.local(PartitionIndex(0), &dense).unwrap(),
            op.local(PartitionIndex(0), &sparse).unwrap()
        );
    }

    #[test]
    fn labels_outside_the_class_range_are_rejected() {
        let mut docs = documents();
        docs.labels[[2, 0]] = 2.0;
        assert!(matches!(
            training(2).local(PartitionIndex(0), &docs),
            Err(KernelError::InvalidLabel { row: 2, .. })
        ));
    }
}
