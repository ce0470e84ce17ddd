//! Pre-activation residual block with optional 2x2 average-pool down-sampling.

use crate::config::ResidualBlockConfig;
use crate::conv::Conv2d;
use crate::error::{LayerError, LayerResult};
use crate::init::Orthogonal;
use crate::ops::{Padding, avg_pool_2x2, relu};
use crate::param::{Parameter, Parameterized, scoped};
use crate::spectral_norm::SpectralNorm;
use crate::tensor::Tensor;
use tracing::{debug, trace};

pub struct ResidualBlock {
    name: String,
    first_block: bool,
    last_block: bool,
    process_identity: SpectralNorm<Conv2d>,
    conv_1: SpectralNorm<Conv2d>,
    conv_2: SpectralNorm<Conv2d>,
}

impl ResidualBlock {
    pub fn new(name: &str, config: &ResidualBlockConfig) -> LayerResult<Self> {
        if config.output_channels == 0 {
            return Err(LayerError::config(format!(
                "residual block `{name}` has zero output channels"
            )));
        }
        let strides = config.stride.pair();
        if strides.0 == 0 || strides.1 == 0 {
            return Err(LayerError::config(format!(
                "residual block `{name}` has a zero stride {strides:?}"
            )));
        }
        let iterations = config.spectral_norm.power_iterations;
        let normalized = |conv: Conv2d, stream: u64| {
            SpectralNorm::new(conv)
                .with_seed(config.seed, 2 * stream + 1)
                .with_power_iterations(iterations)
        };
        let conv = |local: &str, kernel: (usize, usize), stream: u64| {
            Conv2d::new(scoped(name, local), config.output_channels, kernel)
                .with_initializer(Orthogonal::new(config.init_gain))
                .with_bias()
                .with_seed(config.seed, 2 * stream)
        };

        let process_identity = conv("process_identity", (1, 1), 0).with_strides(strides);
        let conv_1 = conv("conv_1", (3, 3), 1)
            .with_strides(strides)
            .with_padding(Padding::Same);
        let conv_2 = conv("conv_2", (3, 3), 2).with_padding(Padding::Same);
        debug!(
            layer = name,
            output_channels = config.output_channels,
            ?strides,
            first_block = config.first_block,
            last_block = config.last_block,
            "residual block constructed"
        );
        Ok(ResidualBlock {
            name: name.to_string(),
            first_block: config.first_block,
            last_block: config.last_block,
            process_identity: normalized(process_identity, 0)?,
            conv_1: normalized(conv_1, 1)?,
            conv_2: normalized(conv_2, 2)?,
        })
    }

    pub fn is_first_block(&self) -> bool {
        self.first_block
    }

    pub fn is_last_block(&self) -> bool {
        self.last_block
    }

    /// The residual pipeline alone: `[relu] -> conv_1 -> relu -> conv_2 -> [pool]`.
    pub fn residual(&mut self, x: &Tensor, training: bool) -> LayerResult<Tensor> {
        let h = if self.first_block {
            self.conv_1.apply(x, training)?
        } else {
            self.conv_1.apply(&relu(x), training)?
        };
        let h = self.conv_2.apply(&relu(&h), training)?;
        if self.last_block {
            Ok(h)
        } else {
            avg_pool_2x2(&h)
        }
    }

    /// Residual pipeline plus identity. The identity is pooled and projected
    /// only when the pipeline changed the shape.
    pub fn apply(&mut self, x: &Tensor, training: bool) -> LayerResult<Tensor> {
        let h = self.residual(x, training)?;
        if h.shape() == x.shape() {
            return h.add(x);
        }
        trace!(
            layer = self.name.as_str(),
            residual = ?h.shape(),
            input = ?x.shape(),
            "adjusting identity"
        );
        let identity = if self.last_block {
            self.process_identity.apply(x, training)?
        } else {
            self.process_identity.apply(&avg_pool_2x2(x)?, training)?
        };
        h.add(&identity)
    }
}

impl Parameterized for ResidualBlock {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = Vec::new();
        for conv in [&self.process_identity, &self.conv_1, &self.conv_2] {
            params.extend(conv.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = Vec::new();
        for conv in [
            &mut self.process_identity,
            &mut self.conv_1,
            &mut self.conv_2,
        ] {
            params.extend(conv.parameters_mut());
        }
        params
    }
}
