//! Configuration for the GAN layer components
use serde::{Deserialize, Serialize};

fn default_power_iterations() -> usize {
    1
}

fn default_gain() -> f32 {
    1.0
}

/// Convolution stride: one value for both axes or an explicit `[h, w]` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stride {
    Uniform(usize),
    Pair(usize, usize),
}

impl Stride {
    pub fn pair(self) -> (usize, usize) {
        match self {
            Stride::Uniform(s) => (s, s),
            Stride::Pair(h, w) => (h, w),
        }
    }
}

impl Default for Stride {
    fn default() -> Self {
        Stride::Uniform(1)
    }
}

impl From<usize> for Stride {
    fn from(value: usize) -> Self {
        Stride::Uniform(value)
    }
}

impl From<(usize, usize)> for Stride {
    fn from((h, w): (usize, usize)) -> Self {
        Stride::Pair(h, w)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectralNormConfig {
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,
}

impl Default for SpectralNormConfig {
    fn default() -> Self {
        SpectralNormConfig {
            power_iterations: default_power_iterations(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelfAttentionConfig {
    #[serde(default = "default_gain")]
    pub init_gain: f32,
    pub output_channels: usize,
    #[serde(default)]
    pub key_size: Option<usize>, // output_channels / 8 when absent
    #[serde(default)]
    pub spectral_norm: SpectralNormConfig,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SelfAttentionConfig {
    pub fn new(init_gain: f32, output_channels: usize) -> Self {
        SelfAttentionConfig {
            init_gain,
            output_channels,
            key_size: None,
            spectral_norm: SpectralNormConfig::default(),
            seed: None,
        }
    }

    pub fn resolved_key_size(&self) -> usize {
        self.key_size.unwrap_or(self.output_channels / 8)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResidualBlockConfig {
    #[serde(default = "default_gain")]
    pub init_gain: f32,
    #[serde(default)]
    pub stride: Stride,
    pub output_channels: usize,
    #[serde(default)]
    pub first_block: bool,
    #[serde(default)]
    pub last_block: bool,
    #[serde(default)]
    pub spectral_norm: SpectralNormConfig,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ResidualBlockConfig {
    pub fn new(init_gain: f32, stride: impl Into<Stride>, output_channels: usize) -> Self {
        ResidualBlockConfig {
            init_gain,
            stride: stride.into(),
            output_channels,
            first_block: false,
            last_block: false,
            spectral_norm: SpectralNormConfig::default(),
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceNormConfig {
    pub channels: usize,
    #[serde(default)]
    pub affine: bool,
}
