//! Dense rotation helpers for OPQ: applying a rotation to row vectors and solving the orthogonal
//! Procrustes problem.
//!
//! Matrices are row-major `dim x dim` slices and vectors are rotated as row vectors: `x' = x * R`.

use nalgebra::DMatrix;
use rayon::prelude::*;

/// Return the `dim x dim` identity matrix.
pub fn identity(dim: usize) -> Vec<f32> {
    let mut m = vec![0.0; dim * dim];
    for i in 0..dim {
        m[i * dim + i] = 1.0;
    }
    m
}

/// Return the transpose of the `dim x dim` matrix `m`.
pub fn transpose(m: &[f32], dim: usize) -> Vec<f32> {
    assert_eq!(m.len(), dim * dim);
    let mut t = vec![0.0; dim * dim];
    for i in 0..dim {
        for j in 0..dim {
            t[j * dim + i] = m[i * dim + j];
        }
    }
    t
}

/// Compute `out = x * rotation` for a single row vector.
#[inline]
pub fn rotate_into(x: &[f32], rotation: &[f32], out: &mut [f32]) {
    let dim = x.len();
    debug_assert_eq!(rotation.len(), dim * dim);
    out.fill(0.0);
    for (xk, row) in x.iter().zip(rotation.chunks_exact(dim)) {
        for (o, r) in out.iter_mut().zip(row) {
            *o += xk * r;
        }
    }
}

/// Rotate every `dim` wide row of `data` into the corresponding row of `out`.
pub fn rotate_rows(data: &[f32], rotation: &[f32], dim: usize, out: &mut [f32]) {
    assert_eq!(data.len(), out.len());
    out.par_chunks_mut(dim)
        .zip(data.par_chunks(dim))
        .for_each(|(o, x)| rotate_into(x, rotation, o));
}

/// Solve the orthogonal Procrustes problem: find the orthogonal `R` minimizing `||x * R - target||`
/// where `x` and `target` are `n x dim` row-major matrices.
///
/// With `x^T * target = U * S * V^T` the solution is `R = U * V^T`. Returns `None` if the SVD does
/// not converge.
pub fn procrustes(x: &[f32], target: &[f32], dim: usize) -> Option<Vec<f32>> {
    assert_eq!(x.len(), target.len());
    let correlation = x
        .par_chunks(dim)
        .zip(target.par_chunks(dim))
        .fold(
            || vec![0.0f64; dim * dim],
            |mut acc, (xr, tr)| {
                for (a, xa) in xr.iter().enumerate() {
                    let xa = *xa as f64;
                    for (c, tb) in acc[a * dim..(a + 1) * dim].iter_mut().zip(tr) {
                        *c += xa * *tb as f64;
                    }
                }
                acc
            },
        )
        .reduce(
            || vec![0.0f64; dim * dim],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
                a
            },
        );

    let svd = DMatrix::from_row_slice(dim, dim, &correlation).try_svd(true, true, f64::EPSILON, 0)?;
    let r = svd.u? * svd.v_t?;
    let r = &r;
    Some(
        (0..dim)
            .flat_map(|i| (0..dim).map(move |j| r[(i, j)] as f32))
            .collect(),
    )
}

/// Frobenius norm of `R^T * R - I`; zero for a perfectly orthogonal matrix.
pub fn orthogonality_error(r: &[f32], dim: usize) -> f64 {
    let mut err = 0.0f64;
    for i in 0..dim {
        for j in 0..dim {
            let dot = (0..dim)
                .map(|k| r[k * dim + i] as f64 * r[k * dim + j] as f64)
                .sum::<f64>();
            let expected = if i == j { 1.0 } else { 0.0 };
            err += (dot - expected) * (dot - expected);
        }
    }
    err.sqrt()
}
