//! Dense linear-algebra helpers shared by the kernels. Every factorization
//! returned here is sign-normalized so that equal inputs give equal outputs
//! regardless of how LAPACK chose signs.

use crate::error::KernelError;
use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate, s};
use ndarray_linalg::{Diag, Eigh, QR, SVD, SolveTriangular, UPLO};

/// Thin QR: `a = q r` with `q` of shape [n, k], `r` of shape [k, p],
/// `k = min(n, p)` and a non-negative diagonal on `r`.
pub fn thin_qr(a: &Array2<f64>) -> Result<(Array2<f64>, Array2<f64>), KernelError> {
    if a.nrows() == 0 || a.ncols() == 0 {
        return Err(KernelError::InsufficientObservations {
            required: 1,
            found: a.nrows(),
        });
    }
    let (mut q, mut r) = a.qr()?;
    let k = r.nrows().min(r.ncols());
    for i in 0..k {
        if r[[i, i]] < 0.0 {
            r.row_mut(i).mapv_inplace(|v| -v);
            q.column_mut(i).mapv_inplace(|v| -v);
        }
    }
    Ok((q, r))
}

/// Stacks blocks vertically, recording the row span of each.
pub fn stack_rows(
    blocks: &[ArrayView2<'_, f64>],
) -> Result<(Array2<f64>, Vec<std::ops::Range<usize>>), KernelError> {
    let mut spans = Vec::with_capacity(blocks.len());
    let mut start = 0;
    for block in blocks {
        spans.push(start..start + block.nrows());
        start += block.nrows();
    }
    Ok((concatenate(Axis(0), blocks)?, spans))
}

/// Eigen-decomposition of a symmetric matrix, eigenvalues descending.
/// Column `j` of the returned matrix is the eigenvector of eigenvalue `j`.
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>), KernelError> {
    let (values, vectors) = a.eigh(UPLO::Lower)?;
    let n = values.len();
    let values = values.slice(s![..;-1]).to_owned();
    let mut vectors = vectors.slice(s![.., ..;-1]).to_owned();
    for j in 0..n {
        orient(vectors.column_mut(j));
    }
    Ok((values, vectors))
}

/// Thin SVD `a = u diag(s) vt` with `s` descending.
pub fn thin_svd(
    a: &Array2<f64>,
) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), KernelError> {
    let (u, sigma, vt) = a.svd(true, true)?;
    let (Some(u), Some(vt)) = (u, vt) else {
        return Err(KernelError::Numerical(
            "SVD returned no singular vectors".to_string(),
        ));
    };
    let k = sigma.len();
    let mut u = u.slice(s![.., ..k]).to_owned();
    let mut vt = vt.slice(s![..k, ..]).to_owned();
    for i in 0..k {
        if orient(vt.row_mut(i)) {
            u.column_mut(i).mapv_inplace(|v| -v);
        }
    }
    Ok((u, sigma, vt))
}

/// Solves `r x = b` for upper-triangular `r`.
pub fn solve_upper(r: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>, KernelError> {
    if r.diag().iter().any(|d| d.abs() <= f64::EPSILON * r.nrows() as f64) {
        return Err(KernelError::Numerical(
            "triangular factor is singular".to_string(),
        ));
    }
    Ok(r.solve_triangular(UPLO::Upper, Diag::NonUnit, b)?)
}

/// Flips `v` so its largest-magnitude entry is positive. Returns whether it flipped.
fn orient(mut v: ndarray::ArrayViewMut1<'_, f64>) -> bool {
    let pivot = v
        .iter()
        .copied()
        .fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
    if pivot < 0.0 {
        v.mapv_inplace(|x| -x);
        true
    } else {
        false
    }
}

/// `d^{-1/2}` on the diagonal, with zero for non-positive entries.
pub fn inverse_sqrt_diagonal(a: &Array2<f64>) -> Array1<f64> {
    a.diag()
        .mapv(|d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 })
}
