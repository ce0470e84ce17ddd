pub mod attention;
pub mod config;
pub mod conv;
mod cpu_utils;
pub mod error;
pub mod init;
pub mod instance_norm;
pub mod ops;
pub mod param;
pub mod residual;
pub mod spectral_norm;
pub mod tensor;

pub use attention::SelfAttention;
pub use config::{
    InstanceNormConfig, ResidualBlockConfig, SelfAttentionConfig, SpectralNormConfig, Stride,
};
pub use conv::{Conv2d, Convolution};
pub use error::{LayerError, LayerResult};
pub use instance_norm::InstanceNorm;
pub use param::{Parameter, Parameterized};
pub use residual::ResidualBlock;
pub use spectral_norm::{SpectralNorm, normalize_l2, power_iteration};
pub use tensor::Tensor;
