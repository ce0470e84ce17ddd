//! Self-attention over spatial positions with a learned residual gate.

use crate::config::SelfAttentionConfig;
use crate::conv::Conv2d;
use crate::cpu_utils::{batched_matmul, softmax_rows};
use crate::error::{LayerError, LayerResult};
use crate::init::Orthogonal;
use crate::ops::max_pool_2x2;
use crate::param::{Parameter, Parameterized, scoped};
use crate::spectral_norm::SpectralNorm;
use crate::tensor::Tensor;
use tracing::debug;

pub struct SelfAttention {
    key_size: usize,
    output_channels: usize,
    gamma: Parameter,
    f: SpectralNorm<Conv2d>,
    g: SpectralNorm<Conv2d>,
    h: SpectralNorm<Conv2d>,
    out: SpectralNorm<Conv2d>,
}

impl SelfAttention {
    pub fn new(name: &str, config: &SelfAttentionConfig) -> LayerResult<Self> {
        let key_size = config.resolved_key_size();
        if key_size == 0 {
            return Err(LayerError::config(format!(
                "self-attention `{name}` has key size 0 (output_channels = {})",
                config.output_channels
            )));
        }
        let value_size = config.output_channels / 2;
        if value_size == 0 {
            return Err(LayerError::config(format!(
                "self-attention `{name}` needs at least 2 output channels, got {}",
                config.output_channels
            )));
        }
        let projection = |local: &str, filters: usize, stream: u64| {
            let conv = Conv2d::new(scoped(name, local), filters, (1, 1))
                .with_initializer(Orthogonal::new(config.init_gain))
                .with_seed(config.seed, 2 * stream);
            SpectralNorm::new(conv)
                .with_seed(config.seed, 2 * stream + 1)
                .with_power_iterations(config.spectral_norm.power_iterations)
        };
        debug!(
            layer = name,
            key_size,
            output_channels = config.output_channels,
            "self-attention constructed"
        );
        Ok(SelfAttention {
            key_size,
            output_channels: config.output_channels,
            gamma: Parameter::trainable(scoped(name, "gamma"), Tensor::zeros(&[1])),
            f: projection("f", key_size, 0)?,
            g: projection("g", key_size, 1)?,
            h: projection("h", value_size, 2)?,
            out: projection("out", config.output_channels, 3)?,
        })
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn gamma(&self) -> f32 {
        self.gamma.value().data()[0]
    }

    /// `gamma * attention(x) + x`.
    pub fn apply(&mut self, x: &Tensor, training: bool) -> LayerResult<Tensor> {
        let o = self.compute_attention(x, training)?;
        o.scale(self.gamma()).add(x)
    }

    /// Attention map with the same shape as `x`. Keys and values are 2x2
    /// max-pooled, so every query attends over `H*W/4` positions.
    pub fn compute_attention(&mut self, x: &Tensor, training: bool) -> LayerResult<Tensor> {
        let (batch, height, width, channels) = x.dims4()?;
        if channels != self.output_channels {
            return Err(LayerError::shape_mismatch(
                &[batch, height, width, self.output_channels],
                x.shape(),
            ));
        }
        if height == 0 || width == 0 || height % 2 != 0 || width % 2 != 0 {
            return Err(LayerError::OddSpatial { height, width });
        }
        let positions = height * width;
        let pooled = positions / 4;
        let value_size = channels / 2;

        // [batch, H*W, key_size]
        let fx = self.f.apply(x, training)?;
        // [batch, H*W/4, key_size]
        let gx = max_pool_2x2(&self.g.apply(x, training)?)?;

        let mut beta = batched_matmul(
            fx.data(),
            gx.data(),
            batch,
            positions,
            self.key_size,
            pooled,
            true,
        );
        softmax_rows(&mut beta, pooled);

        // [batch, H*W/4, C/2]
        let hx = max_pool_2x2(&self.h.apply(x, training)?)?;
        let interim = batched_matmul(&beta, hx.data(), batch, positions, pooled, value_size, false);
        let interim = Tensor::new(vec![batch, height, width, value_size], interim)?;

        self.out.apply(&interim, training)
    }
}

impl Parameterized for SelfAttention {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.gamma];
        for projection in [&self.f, &self.g, &self.h, &self.out] {
            params.extend(projection.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.gamma];
        for projection in [&mut self.f, &mut self.g, &mut self.h, &mut self.out] {
            params.extend(projection.parameters_mut());
        }
        params
    }
}
