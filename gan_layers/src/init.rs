//! Weight initializers and seeded random sources.

use crate::error::{LayerError, LayerResult};
use crate::tensor::Tensor;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};

/// Odd 64-bit golden-ratio constant used to spread stream indices.
const STREAM_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Seeded generator when a seed is given, entropy otherwise. `stream` separates
/// the sub-layers of a composite layer that share one configured seed.
///
/// The stream is multiplied out before it is mixed into the seed, so layers
/// built from nearby seeds never share a sub-layer generator.
pub fn layer_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value ^ stream.wrapping_mul(STREAM_MIX)),
        None => StdRng::from_entropy(),
    }
}

pub fn random_normal(len: usize, stddev: f32, rng: &mut StdRng) -> LayerResult<Vec<f32>> {
    let dist = Normal::new(0.0f32, stddev)
        .map_err(|e| LayerError::config(format!("invalid normal stddev {stddev}: {e}")))?;
    Ok((0..len).map(|_| dist.sample(rng)).collect())
}

/// Orthogonal initializer scaled by `gain`.
///
/// The shape is flattened to `[prod(shape[..-1]), shape[-1]]`; a standard-normal
/// matrix of that shape is orthonormalized so that rows or columns (whichever
/// are fewer) form an orthonormal set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Orthogonal {
    pub gain: f32,
}

impl Orthogonal {
    pub fn new(gain: f32) -> Self {
        Orthogonal { gain }
    }

    pub fn sample(&self, shape: &[usize], rng: &mut StdRng) -> LayerResult<Tensor> {
        let (last, leading) = shape
            .split_last()
            .ok_or_else(|| LayerError::config("orthogonal initializer needs at least one dim"))?;
        let rows: usize = leading.iter().product();
        let cols = *last;
        if rows == 0 || cols == 0 {
            return Err(LayerError::config(format!(
                "orthogonal initializer got an empty shape {shape:?}"
            )));
        }
        // q: [tall][short] with orthonormal columns
        let (tall, short) = (rows.max(cols), rows.min(cols));
        let gaussian: Vec<f32> = (0..tall * short)
            .map(|_| StandardNormal.sample(rng))
            .collect();
        let q = orthonormalize_columns(gaussian, tall, short);

        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                let value = if rows >= cols {
                    q[i * short + j]
                } else {
                    q[j * short + i]
                };
                data[i * cols + j] = self.gain * value;
            }
        }
        Tensor::new(shape.to_vec(), data)
    }
}

/// Modified Gram-Schmidt over the columns of a row-major `[rows][cols]` matrix.
/// Equivalent to the Q factor of a QR decomposition with a positive R diagonal.
fn orthonormalize_columns(mut mat: Vec<f32>, rows: usize, cols: usize) -> Vec<f32> {
    for j in 0..cols {
        for k in 0..j {
            let proj: f32 = (0..rows).map(|i| mat[i * cols + j] * mat[i * cols + k]).sum();
            for i in 0..rows {
                mat[i * cols + j] -= proj * mat[i * cols + k];
            }
        }
        let norm = (0..rows)
            .map(|i| mat[i * cols + j].powi(2))
            .sum::<f32>()
            .sqrt();
        if norm > 0.0 {
            for i in 0..rows {
                mat[i * cols + j] /= norm;
            }
        }
    }
    mat
}
