//! Error type shared by every layer and numerical kernel.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("expected a rank-{expected} tensor, got shape {actual:?}")]
    RankMismatch { expected: usize, actual: Vec<usize> },
    #[error("shape {shape:?} does not hold {len} elements")]
    InvalidShape { shape: Vec<usize>, len: usize },
    #[error("spatial dimensions {height}x{width} must be even and non-zero")]
    OddSpatial { height: usize, width: usize },
    #[error("layer `{0}` has not been initialised by a forward pass")]
    NotInitialized(String),
}

pub type LayerResult<T> = Result<T, LayerError>;

impl LayerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        LayerError::InvalidConfig(message.into())
    }

    pub(crate) fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        LayerError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
