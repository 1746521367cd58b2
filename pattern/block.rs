//! In-memory forms of one partition's data.

use crate::loader::LoadError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A sparse block in compressed-sparse-row layout with one-based offsets
/// and column indices.
///
/// Invariants, checked on construction:
/// * `row_offsets` has `n_rows + 1` entries, starts at 1 and never decreases;
/// * `row_offsets[n_rows] - 1 == values.len() == col_indices.len()`;
/// * every column index lies in `1..=n_cols`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CsrBlock {
    n_rows: usize,
    n_cols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl CsrBlock {
    pub fn new(
        n_cols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self, String> {
        let Some(&last) = row_offsets.last() else {
            return Err("row offsets are empty".to_string());
        };
        if row_offsets[0] != 1 {
            return Err(format!(
                "row offsets must start at 1, found {}",
                row_offsets[0]
            ));
        }
        if let Some(w) = row_offsets.windows(2).find(|w| w[1] < w[0]) {
            return Err(format!("row offsets decrease from {} to {}", w[0], w[1]));
        }
        if col_indices.len() != values.len() {
            return Err(format!(
                "{} column indices for {} values",
                col_indices.len(),
                values.len()
            ));
        }
        if last - 1 != values.len() {
            return Err(format!(
                "last row offset {} implies {} values but {} are present",
                last,
                last - 1,
                values.len()
            ));
        }
        if let Some(&col) = col_indices.iter().find(|&&c| c == 0 || c > n_cols) {
            return Err(format!("column index {col} is outside 1..={n_cols}"));
        }
        Ok(Self {
            n_rows: row_offsets.len() - 1,
            n_cols,
            row_offsets,
            col_indices,
            values,
        })
    }

    /// Builds a block from zero-based `(row, col, value)` entries in any order.
    /// Entries sharing a cell are summed.
    pub fn from_triplets(
        n_rows: usize,
        n_cols: usize,
        mut triplets: Vec<(usize, usize, f64)>,
    ) -> Result<Self, String> {
        if let Some(&(r, c, _)) = triplets.iter().find(|(r, c, _)| *r >= n_rows || *c >= n_cols) {
            return Err(format!("entry ({r}, {c}) is outside {n_rows}x{n_cols}"));
        }
        triplets.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let mut row_offsets = vec![1usize; n_rows + 1];
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut values: Vec<f64> = Vec::with_capacity(triplets.len());
        let mut last_cell: Option<(usize, usize)> = None;
        for (r, c, v) in triplets {
            if last_cell == Some((r, c)) {
                if let Some(slot) = values.last_mut() {
                    *slot += v;
                }
                continue;
            }
            last_cell = Some((r, c));
            col_indices.push(c + 1);
            values.push(v);
            row_offsets[r + 1] += 1;
        }
        for i in 1..row_offsets.len() {
            row_offsets[i] += row_offsets[i - 1] - 1;
        }
        Self::new(n_cols, row_offsets, col_indices, values)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Stored entries of row `row` as zero-based `(column, value)` pairs.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let start = self.row_offsets[row] - 1;
        let end = self.row_offsets[row + 1] - 1;
        self.col_indices[start..end]
            .iter()
            .zip(&self.values[start..end])
            .map(|(&c, &v)| (c - 1, v))
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n_rows, self.n_cols));
        for r in 0..self.n_rows {
            for (c, v) in self.row(r) {
                dense[[r, c]] += v;
            }
        }
        dense
    }

    pub fn transpose(&self) -> CsrBlock {
        let mut counts = vec![0usize; self.n_cols];
        for &c in &self.col_indices {
            counts[c - 1] += 1;
        }
        let mut row_offsets = Vec::with_capacity(self.n_cols + 1);
        row_offsets.push(1usize);
        for count in &counts {
            let next = row_offsets[row_offsets.len() - 1] + count;
            row_offsets.push(next);
        }
        let mut cursor: Vec<usize> = row_offsets[..self.n_cols].iter().map(|o| o - 1).collect();
        let mut col_indices = vec![0usize; self.nnz()];
        let mut values = vec![0.0f64; self.nnz()];
        for r in 0..self.n_rows {
            for (c, v) in self.row(r) {
                let slot = cursor[c];
                col_indices[slot] = r + 1;
                values[slot] = v;
                cursor[c] += 1;
            }
        }
        CsrBlock {
            n_rows: self.n_cols,
            n_cols: self.n_rows,
            row_offsets,
            col_indices,
            values,
        }
    }
}

/// The data of one partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PartitionBlock {
    Dense(Array2<f64>),
    Sparse(CsrBlock),
}

impl PartitionBlock {
    pub fn n_rows(&self) -> usize {
        match self {
            Self::Dense(table) => table.nrows(),
            Self::Sparse(csr) => csr.n_rows(),
        }
    }

    pub fn n_cols(&self) -> usize {
        match self {
            Self::Dense(table) => table.ncols(),
            Self::Sparse(csr) => csr.n_cols(),
        }
    }

    /// Dense view of the block; only sparse blocks are materialized.
    pub fn to_dense(&self) -> Cow<'_, Array2<f64>> {
        match self {
            Self::Dense(table) => Cow::Borrowed(table),
            Self::Sparse(csr) => Cow::Owned(csr.to_dense()),
        }
    }

    pub fn as_sparse(&self) -> Option<&CsrBlock> {
        match self {
            Self::Sparse(csr) => Some(csr),
            Self::Dense(_) => None,
        }
    }

    /// Pads a sparse block with empty columns up to `n_cols`.
    /// Sparse files only reveal their width through the largest column index.
    pub fn widen(self, n_cols: usize) -> Result<Self, LoadError> {
        match self {
            Self::Sparse(csr) if csr.n_cols < n_cols => Ok(Self::Sparse(CsrBlock { n_cols, ..csr })),
            Self::Dense(table) if table.ncols() != n_cols => Err(LoadError::WidthMismatch {
                expected: n_cols,
                found: table.ncols(),
            }),
            other => Ok(other),
        }
    }
}

/// Observations paired row-for-row with their labels or responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabeledBlock {
    pub data: PartitionBlock,
    /// Shape: [n_rows, n_responses].
    pub labels: Array2<f64>,
}
