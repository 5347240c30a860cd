//! 2D convolution layer with a fused nonlinearity.

use crate::errors::ModelError;
use crate::layers::Activation;
use burn::{
    module::{Module, Param},
    nn::{
        Initializer, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{Tensor, TensorData, backend::Backend},
};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Border handling of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Zero padding so the output keeps the input's spatial size.
    #[default]
    Same,
    /// No padding; each spatial axis shrinks by `kernel_size - 1`.
    Valid,
}

impl Padding {
    /// Spatial output size along one axis, or `None` if nothing is left.
    pub fn output_size(&self, input: usize, kernel_size: usize) -> Option<usize> {
        let size = match self {
            Padding::Same => input,
            Padding::Valid => input.checked_sub(kernel_size.saturating_sub(1))?,
        };
        (size > 0).then_some(size)
    }

    fn to_config(self) -> PaddingConfig2d {
        match self {
            Padding::Same => PaddingConfig2d::Same,
            Padding::Valid => PaddingConfig2d::Valid,
        }
    }
}

/// Configuration for a ConvLayer.
#[derive(Debug, Clone)]
pub struct ConvLayerConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of filters (output channels).
    pub filters: usize,
    /// Square kernel size.
    pub kernel_size: usize,
    /// Border handling.
    pub padding: Padding,
    /// Activation applied to the convolution output.
    pub activation: Activation,
}

impl ConvLayerConfig {
    /// Creates a new ConvLayerConfig with `same` padding and no activation.
    pub fn new(in_channels: usize, filters: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            filters,
            kernel_size,
            padding: Padding::Same,
            activation: Activation::None,
        }
    }

    /// Sets the padding mode.
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Sets the activation function.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Initializes the layer: Glorot-uniform weights drawn from `rng`, zero bias.
    pub fn init<B: Backend, R: Rng>(&self, rng: &mut R, device: &B::Device) -> ConvLayer<B> {
        let mut conv = Conv2dConfig::new(
            [self.in_channels, self.filters],
            [self.kernel_size, self.kernel_size],
        )
        .with_padding(self.padding.to_config())
        .with_initializer(Initializer::Zeros)
        .init(device);

        let shape = [
            self.filters,
            self.in_channels,
            self.kernel_size,
            self.kernel_size,
        ];
        conv.weight = param_from_vec(glorot_uniform(rng, shape), shape, device);

        ConvLayer {
            conv,
            in_channels: self.in_channels,
            filters: self.filters,
            kernel_size: self.kernel_size,
            activation_id: self.activation.to_id(),
        }
    }
}

/// A convolution followed by its nonlinearity.
///
/// Weights are laid out `[filters, in_channels, kernel, kernel]`, bias is
/// `[filters]`; both are exchanged with weight archives in that order.
#[derive(Module, Debug)]
pub struct ConvLayer<B: Backend> {
    conv: Conv2d<B>,
    in_channels: usize,
    filters: usize,
    kernel_size: usize,
    /// Activation function ID, see [`Activation::to_id`].
    activation_id: u8,
}

impl<B: Backend> ConvLayer<B> {
    /// Performs the forward pass on a `[batch, channels, height, width]` tensor.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        self.activation().apply(output)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn activation(&self) -> Activation {
        Activation::from_id(self.activation_id)
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        vec![
            self.filters,
            self.in_channels,
            self.kernel_size,
            self.kernel_size,
        ]
    }

    pub fn bias_shape(&self) -> Vec<usize> {
        vec![self.filters]
    }

    /// Extracts the weights as a flat row-major vector.
    pub fn weights_to_vec(&self) -> Result<Vec<f32>, ModelError> {
        tensor_to_vec(self.conv.weight.val())
    }

    /// Extracts the bias as a vector.
    pub fn bias_to_vec(&self) -> Result<Vec<f32>, ModelError> {
        match &self.conv.bias {
            Some(bias) => tensor_to_vec(bias.val()),
            None => Ok(vec![0.0; self.filters]),
        }
    }

    /// Replaces weights and bias. Lengths must already match the layer's shapes.
    pub(crate) fn with_parameters(mut self, weights: Vec<f32>, bias: Vec<f32>) -> Self {
        let device = self.conv.weight.val().device();
        let shape = [
            self.filters,
            self.in_channels,
            self.kernel_size,
            self.kernel_size,
        ];
        self.conv.weight = param_from_vec(weights, shape, &device);
        self.conv.bias = Some(param_from_vec(bias, [self.filters], &device));
        self
    }
}

/// Glorot (Xavier) uniform samples for a `[out, in, kh, kw]` kernel.
pub(crate) fn glorot_uniform<R: Rng>(rng: &mut R, shape: [usize; 4]) -> Vec<f32> {
    let receptive_field = shape[2] * shape[3];
    let fan_in = shape[1] * receptive_field;
    let fan_out = shape[0] * receptive_field;
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt() as f32;
    let count: usize = shape.iter().product();

    (0..count).map(|_| rng.gen_range(-bound..bound)).collect()
}

fn param_from_vec<B: Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Param<Tensor<B, D>> {
    let data = TensorData::new(values, shape).convert::<B::FloatElem>();
    Param::from_tensor(Tensor::from_data(data, device))
}

/// Reverses both spatial axes of every `[out, in, kh, kw]` kernel.
///
/// Weight archives store kernels for a true convolution while `Conv2d`
/// computes a cross-correlation. The flip is its own inverse.
pub(crate) fn flip_kernels(values: &[f32], shape: &[usize]) -> Vec<f32> {
    let [.., kh, kw] = shape else {
        return values.to_vec();
    };
    let (kh, kw) = (*kh, *kw);
    let window = kh * kw;
    if window == 0 {
        return values.to_vec();
    }

    let mut flipped = Vec::with_capacity(values.len());
    for kernel in values.chunks(window) {
        flipped.extend(kernel.iter().rev());
    }
    flipped
}

fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, ModelError> {
    data_to_vec(tensor.into_data().convert::<f32>())
}

fn data_to_vec(data: TensorData) -> Result<Vec<f32>, ModelError> {
    data.to_vec::<f32>()
        .map_err(|err| ModelError::ParameterRead(format!("{err:?}")))
}
