//! Shared CPU matrix utilities. All matrices are flat row-major slices.

use rayon::prelude::*;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Matrix-vector multiply.
/// mat: [rows][cols], vec: [cols], returns [rows]
pub fn matvec(mat: &[f32], rows: usize, cols: usize, vec: &[f32]) -> Vec<f32> {
    if cols == 0 {
        return vec![0.0; rows];
    }
    mat.par_chunks(cols)
        .take(rows)
        .map(|row| dot(row, vec))
        .collect()
}

/// Transposed matrix-vector multiply.
/// mat: [rows][cols], vec: [rows], returns [cols]
pub fn matvec_transposed(mat: &[f32], rows: usize, cols: usize, vec: &[f32]) -> Vec<f32> {
    (0..cols)
        .into_par_iter()
        .map(|j| (0..rows).map(|i| mat[i * cols + j] * vec[i]).sum::<f32>())
        .collect()
}

/// Batched matmul.
/// a: [batch][m][n], b: [batch][n][k] (or [batch][k][n] when `transpose_b`), returns [batch][m][k]
pub fn batched_matmul(
    a: &[f32],
    b: &[f32],
    batch: usize,
    m: usize,
    n: usize,
    k: usize,
    transpose_b: bool,
) -> Vec<f32> {
    let mut out = vec![0.0; batch * m * k];
    if k == 0 {
        return out;
    }
    out.par_chunks_mut(k).enumerate().for_each(|(row, out_row)| {
        let sample = row / m.max(1);
        let a_row = &a[row * n..(row + 1) * n];
        let b_mat = &b[sample * n * k..(sample + 1) * n * k];
        for (j, out_val) in out_row.iter_mut().enumerate() {
            *out_val = if transpose_b {
                dot(a_row, &b_mat[j * n..(j + 1) * n])
            } else {
                a_row
                    .iter()
                    .enumerate()
                    .map(|(l, a_val)| a_val * b_mat[l * k + j])
                    .sum()
            };
        }
    });
    out
}

/// Numerically stable softmax applied independently to every row of length `cols`.
pub fn softmax_rows(data: &mut [f32], cols: usize) {
    if cols == 0 {
        return;
    }
    data.par_chunks_mut(cols).for_each(|row| {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for x in row.iter_mut() {
            *x = (*x - max).exp();
            sum += *x;
        }
        for x in row.iter_mut() {
            *x /= sum;
        }
    });
}
