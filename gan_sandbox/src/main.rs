use gan_layers::{
    InstanceNorm, InstanceNormConfig, LayerResult, Parameterized, ResidualBlock,
    ResidualBlockConfig, SelfAttention, SelfAttentionConfig, Tensor,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Layer stack exercised by the sandbox: residual blocks, one self-attention
/// module after the first block, and a final instance norm.
#[derive(Debug, Serialize, Deserialize)]
struct SandboxConfig {
    batch_size: usize,
    height: usize,
    width: usize,
    in_channels: usize,
    passes: usize,
    blocks: Vec<ResidualBlockConfig>,
    attention: Option<SelfAttentionConfig>,
    instance_norm: Option<InstanceNormConfig>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let first = ResidualBlockConfig {
            first_block: true,
            ..ResidualBlockConfig::new(1.0, 1, 32)
        };
        let last = ResidualBlockConfig {
            last_block: true,
            ..ResidualBlockConfig::new(1.0, 1, 64)
        };
        SandboxConfig {
            batch_size: 4,
            height: 32,
            width: 32,
            in_channels: 3,
            passes: 3,
            blocks: vec![first, ResidualBlockConfig::new(1.0, 1, 64), last],
            attention: Some(SelfAttentionConfig::new(1.0, 32)),
            instance_norm: Some(InstanceNormConfig {
                channels: 64,
                affine: true,
            }),
        }
    }
}

impl SandboxConfig {
    fn load_json(path: &str) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(std::io::Error::other)
    }
}

struct Stack {
    blocks: Vec<ResidualBlock>,
    attention: Option<SelfAttention>,
    norm: Option<InstanceNorm>,
}

impl Stack {
    fn new(config: &SandboxConfig) -> LayerResult<Self> {
        let blocks = config
            .blocks
            .iter()
            .enumerate()
            .map(|(i, c)| ResidualBlock::new(&format!("block_{}", i + 1), c))
            .collect::<LayerResult<Vec<_>>>()?;
        let attention = config
            .attention
            .as_ref()
            .map(|c| SelfAttention::new("attention", c))
            .transpose()?;
        let norm = config
            .instance_norm
            .as_ref()
            .map(|c| InstanceNorm::new("instance_norm", c))
            .transpose()?;
        Ok(Stack {
            blocks,
            attention,
            norm,
        })
    }

    fn forward(&mut self, x: &Tensor, training: bool) -> LayerResult<Tensor> {
        let mut h = x.clone();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            h = block.apply(&h, training)?;
            if i == 0 {
                if let Some(attention) = self.attention.as_mut() {
                    h = attention.apply(&h, training)?;
                }
            }
        }
        match &self.norm {
            Some(norm) => norm.apply(&h),
            None => Ok(h),
        }
    }

    fn parameter_summary(&self) -> (usize, usize) {
        let mut params: Vec<&gan_layers::Parameter> = Vec::new();
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        if let Some(attention) = &self.attention {
            params.extend(attention.parameters());
        }
        if let Some(norm) = &self.norm {
            params.extend(norm.parameters());
        }
        let trainable = params
            .iter()
            .filter(|p| p.is_trainable())
            .map(|p| p.value().len())
            .sum();
        let total = params.iter().map(|p| p.value().len()).sum();
        (trainable, total)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SandboxConfig::load_json(&path)?,
        None => SandboxConfig::default(),
    };
    info!(?config, "sandbox configuration");

    let mut stack = Stack::new(&config)?;
    let mut rng = rand::thread_rng();
    let shape = [
        config.batch_size,
        config.height,
        config.width,
        config.in_channels,
    ];
    for pass in 0..config.passes {
        let data = (0..shape.iter().product::<usize>())
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let x = Tensor::new(shape.to_vec(), data)?;
        let y = stack.forward(&x, true)?;
        info!(
            pass,
            output_shape = ?y.shape(),
            finite = y.all_finite(),
            "training pass"
        );
    }

    let (trainable, total) = stack.parameter_summary();
    info!(trainable, total, "parameter inventory");
    Ok(())
}
