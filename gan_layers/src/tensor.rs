//! Dense row-major `f32` tensor. Activations use NHWC layout
//! (`[batch, height, width, channels]`), kernels use `[kh, kw, in, out]`.

use crate::error::{LayerError, LayerResult};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> LayerResult<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(LayerError::InvalidShape {
                shape,
                len: data.len(),
            });
        }
        Ok(Tensor { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Tensor {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Splits a rank-4 shape into its four extents.
    pub fn dims4(&self) -> LayerResult<(usize, usize, usize, usize)> {
        match self.shape.as_slice() {
            [a, b, c, d] => Ok((*a, *b, *c, *d)),
            _ => Err(LayerError::RankMismatch {
                expected: 4,
                actual: self.shape.clone(),
            }),
        }
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|x| f(*x)).collect(),
        }
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|x| x * factor)
    }

    /// Element-wise sum. Shapes must match exactly; there is no broadcasting.
    pub fn add(&self, other: &Tensor) -> LayerResult<Tensor> {
        if self.shape != other.shape {
            return Err(LayerError::shape_mismatch(&self.shape, &other.shape));
        }
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a + b)
                .collect(),
        })
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}
