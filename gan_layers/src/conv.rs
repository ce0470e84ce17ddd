//! Convolution operators that take their kernel as an explicit argument.

use crate::error::{LayerError, LayerResult};
use crate::init::{Orthogonal, layer_rng};
use crate::ops::{self, Padding};
use crate::param::{Parameter, scoped};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// A convolution whose kernel is owned by the caller.
///
/// The operator knows how to create an initial kernel for a given input channel
/// count, but never stores it; the forward pass always receives the kernel to
/// use. Bias, when present, stays with the operator.
pub trait Convolution {
    fn name(&self) -> &str;

    /// Number of output channels.
    fn filters(&self) -> usize;

    fn kernel_shape(&self, in_channels: usize) -> [usize; 4];

    fn initial_kernel(&mut self, in_channels: usize) -> LayerResult<Tensor>;

    fn convolve(&self, input: &Tensor, kernel: &Tensor) -> LayerResult<Tensor>;

    fn bias(&self) -> Option<&Parameter> {
        None
    }

    fn bias_mut(&mut self) -> Option<&mut Parameter> {
        None
    }
}

pub struct Conv2d {
    name: String,
    filters: usize,
    kernel_size: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    initializer: Orthogonal,
    bias: Option<Parameter>,
    rng: StdRng,
}

impl Conv2d {
    pub fn new(name: impl Into<String>, filters: usize, kernel_size: (usize, usize)) -> Self {
        let name = name.into();
        Conv2d {
            bias: None,
            name,
            filters,
            kernel_size,
            strides: (1, 1),
            padding: Padding::Valid,
            initializer: Orthogonal::new(1.0),
            rng: layer_rng(None, 0),
        }
    }

    pub fn with_strides(mut self, strides: (usize, usize)) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_initializer(mut self, initializer: Orthogonal) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>, stream: u64) -> Self {
        self.rng = layer_rng(seed, stream);
        self
    }

    /// Adds a zero-initialised bias of length `filters`.
    pub fn with_bias(mut self) -> Self {
        self.bias = Some(Parameter::trainable(
            scoped(&self.name, "bias"),
            Tensor::zeros(&[self.filters]),
        ));
        self
    }

    pub fn strides(&self) -> (usize, usize) {
        self.strides
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }
}

impl Convolution for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn filters(&self) -> usize {
        self.filters
    }

    fn kernel_shape(&self, in_channels: usize) -> [usize; 4] {
        [self.kernel_size.0, self.kernel_size.1, in_channels, self.filters]
    }

    fn initial_kernel(&mut self, in_channels: usize) -> LayerResult<Tensor> {
        if self.filters == 0 {
            return Err(LayerError::config(format!(
                "convolution `{}` has zero output channels",
                self.name
            )));
        }
        let shape = self.kernel_shape(in_channels);
        self.initializer.sample(&shape, &mut self.rng)
    }

    fn convolve(&self, input: &Tensor, kernel: &Tensor) -> LayerResult<Tensor> {
        let bias = self.bias.as_ref().map(|b| b.value().data());
        ops::conv2d(input, kernel, bias, self.strides, self.padding)
    }

    fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn bias_mut(&mut self) -> Option<&mut Parameter> {
        self.bias.as_mut()
    }
}
