//! Explicitly owned layer parameters.
//!
//! Layers do not register weights with any global store. Each one exposes its
//! parameters through [`Parameterized`] so the outer training loop can collect
//! them, read their values and write updated values back.

use crate::error::{LayerError, LayerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: Tensor,
    trainable: bool,
}

impl Parameter {
    pub fn trainable(name: impl Into<String>, value: Tensor) -> Self {
        Parameter {
            name: name.into(),
            value,
            trainable: true,
        }
    }

    /// State that is persisted with the layer but excluded from gradient updates.
    pub fn frozen(name: impl Into<String>, value: Tensor) -> Self {
        Parameter {
            name: name.into(),
            value,
            trainable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// Replaces the value; the new tensor must keep the parameter's shape.
    pub fn assign(&mut self, value: Tensor) -> LayerResult<()> {
        if value.shape() != self.value.shape() {
            return Err(LayerError::shape_mismatch(self.value.shape(), value.shape()));
        }
        self.value = value;
        Ok(())
    }

    pub(crate) fn assign_data(&mut self, data: Vec<f32>) -> LayerResult<()> {
        let value = Tensor::new(self.value.shape().to_vec(), data)?;
        self.value = value;
        Ok(())
    }
}

pub trait Parameterized {
    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn trainable_parameters(&self) -> Vec<&Parameter> {
        self.parameters()
            .into_iter()
            .filter(|p| p.is_trainable())
            .collect()
    }

    /// Total number of scalar values across all parameters.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.value().len()).sum()
    }
}

/// Joins a layer prefix and a local parameter name into `prefix/name`.
pub(crate) fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
