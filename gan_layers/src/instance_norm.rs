use crate::config::InstanceNormConfig;
use crate::error::{LayerError, LayerResult};
use crate::param::{Parameter, Parameterized, scoped};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Per-sample, per-channel normalization over the spatial axes, with an
/// optional learned per-channel scale and shift.
pub struct InstanceNorm {
    channels: usize,
    eps: f32,
    affine: Option<(Parameter, Parameter)>, // (gamma, beta)
}

impl InstanceNorm {
    pub fn new(name: &str, config: &InstanceNormConfig) -> LayerResult<Self> {
        if config.channels == 0 {
            return Err(LayerError::config(format!(
                "instance norm `{name}` has zero channels"
            )));
        }
        let affine = config.affine.then(|| {
            (
                Parameter::trainable(scoped(name, "gamma"), Tensor::ones(&[config.channels])),
                Parameter::trainable(scoped(name, "beta"), Tensor::zeros(&[config.channels])),
            )
        });
        Ok(InstanceNorm {
            channels: config.channels,
            eps: 1e-12,
            affine,
        })
    }

    pub fn is_affine(&self) -> bool {
        self.affine.is_some()
    }

    /// `(x - mean) / (std + eps)` per (sample, channel), then `* gamma + beta`.
    pub fn apply(&self, x: &Tensor) -> LayerResult<Tensor> {
        let (batch, height, width, channels) = x.dims4()?;
        if channels != self.channels {
            return Err(LayerError::shape_mismatch(
                &[batch, height, width, self.channels],
                x.shape(),
            ));
        }
        let positions = height * width;
        let mut out = x.data().to_vec();
        if out.is_empty() {
            return Tensor::new(x.shape().to_vec(), out);
        }
        let (gamma, beta) = match &self.affine {
            Some((gamma, beta)) => (Some(gamma.value().data()), Some(beta.value().data())),
            None => (None, None),
        };
        out.par_chunks_mut(positions * channels).for_each(|sample| {
            for c in 0..channels {
                let mean = (0..positions).map(|p| sample[p * channels + c]).sum::<f32>()
                    / positions as f32;
                let var = (0..positions)
                    .map(|p| (sample[p * channels + c] - mean).powi(2))
                    .sum::<f32>()
                    / positions as f32;
                let denom = var.sqrt() + self.eps;
                let (scale, shift) = match (gamma, beta) {
                    (Some(g), Some(b)) => (g[c], b[c]),
                    _ => (1.0, 0.0),
                };
                for p in 0..positions {
                    let v = &mut sample[p * channels + c];
                    *v = (*v - mean) / denom * scale + shift;
                }
            }
        });
        Tensor::new(x.shape().to_vec(), out)
    }
}

impl Parameterized for InstanceNorm {
    fn parameters(&self) -> Vec<&Parameter> {
        match &self.affine {
            Some((gamma, beta)) => vec![gamma, beta],
            None => Vec::new(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        match &mut self.affine {
            Some((gamma, beta)) => vec![gamma, beta],
            None => Vec::new(),
        }
    }
}
