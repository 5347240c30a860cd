//! GraphNetwork - a compiled layer graph holding initialized layers.

use burn::module::{Ignored, Module};
use burn::nn::interpolate::{Interpolate2d, Interpolate2dConfig, InterpolateMode};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::tensor::{Tensor, backend::Backend};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::core::LayerGraph;
use super::node::NodeId;
use super::operation::Operation;
use crate::errors::ModelError;
use crate::layers::conv::flip_kernels;
use crate::layers::{Activation, ConvLayer, ConvLayerConfig, SeededDropout};
use crate::weights::NpyArray;

/// Execution step in the forward pass, one per graph node.
#[derive(Debug, Clone)]
enum Step {
    Input,
    Conv { layer: usize, input: NodeId },
    MaxPool { layer: usize, input: NodeId },
    Dropout { layer: usize, input: NodeId },
    Upscale { layer: usize, input: NodeId },
    Concat { inputs: Vec<NodeId> },
    Permute { input: NodeId, axes: Vec<usize> },
    Flatten { input: NodeId },
    Nonlinearity { input: NodeId, activation: Activation },
    Unflatten { input: NodeId, height: usize, width: usize },
}

/// Value produced by a node: spatial `(b, c, h, w)`-like rank-4 or a rank-2 matrix.
#[derive(Debug, Clone)]
pub enum NodeValue<B: Backend> {
    Spatial(Tensor<B, 4>),
    Flat(Tensor<B, 2>),
}

impl<B: Backend> NodeValue<B> {
    pub fn into_spatial(self) -> Option<Tensor<B, 4>> {
        match self {
            NodeValue::Spatial(tensor) => Some(tensor),
            NodeValue::Flat(_) => None,
        }
    }

    pub fn into_flat(self) -> Option<Tensor<B, 2>> {
        match self {
            NodeValue::Flat(tensor) => Some(tensor),
            NodeValue::Spatial(_) => None,
        }
    }
}

/// Compiled layer graph: the trainable layers plus the plan that wires them.
///
/// Convolution layers are kept in graph order, which is also the order in
/// which parameters are exchanged with weight archives.
#[derive(Module, Debug)]
pub struct GraphNetwork<B: Backend> {
    convs: Vec<ConvLayer<B>>,
    pools: Vec<MaxPool2d>,
    dropouts: Vec<SeededDropout>,
    upscales: Vec<Interpolate2d>,
    steps: Ignored<Vec<Step>>,
    graph: Ignored<LayerGraph>,
}

impl<B: Backend> GraphNetwork<B> {
    /// Builds the execution plan and initializes every layer.
    ///
    /// One `StdRng` seeded with `seed` is consumed in graph order: each
    /// convolution draws its weights, each dropout draws the seed of its
    /// mask stream.
    pub fn new(graph: LayerGraph, seed: u64, device: &B::Device) -> Result<Self, ModelError> {
        let input = graph.input()?.id();
        if input != 0 {
            return Err(ModelError::InvalidGraph(
                "the input node must be inserted first".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut convs = Vec::new();
        let mut pools = Vec::new();
        let mut dropouts = Vec::new();
        let mut upscales = Vec::new();
        let mut steps = Vec::with_capacity(graph.len());

        for node in graph.nodes() {
            let inputs = node.inputs();
            let step = match node.operation() {
                Operation::Input { .. } => Step::Input,
                Operation::Conv2d {
                    filters,
                    kernel_size,
                    padding,
                    activation,
                } => {
                    let in_channels = graph
                        .get(inputs[0])
                        .and_then(|producer| producer.shape().get(1).copied().flatten())
                        .ok_or_else(|| {
                            ModelError::InvalidGraph(format!(
                                "node '{}' has no known input channel count",
                                node.name()
                            ))
                        })?;
                    convs.push(
                        ConvLayerConfig::new(in_channels, *filters, *kernel_size)
                            .with_padding(*padding)
                            .with_activation(*activation)
                            .init(&mut rng, device),
                    );
                    Step::Conv {
                        layer: convs.len() - 1,
                        input: inputs[0],
                    }
                }
                Operation::MaxPool2d { pool_size } => {
                    pools.push(
                        MaxPool2dConfig::new([*pool_size, *pool_size])
                            .with_strides([*pool_size, *pool_size])
                            .init(),
                    );
                    Step::MaxPool {
                        layer: pools.len() - 1,
                        input: inputs[0],
                    }
                }
                Operation::Dropout { prob } => {
                    dropouts.push(SeededDropout::new(*prob, rng.r#gen()));
                    Step::Dropout {
                        layer: dropouts.len() - 1,
                        input: inputs[0],
                    }
                }
                Operation::Upscale2d { scale_factor } => {
                    let factor = *scale_factor as f32;
                    upscales.push(
                        Interpolate2dConfig::new()
                            .with_scale_factor(Some([factor, factor]))
                            .with_mode(InterpolateMode::Nearest)
                            .init(),
                    );
                    Step::Upscale {
                        layer: upscales.len() - 1,
                        input: inputs[0],
                    }
                }
                Operation::Concat => Step::Concat {
                    inputs: inputs.to_vec(),
                },
                Operation::Dimshuffle { pattern } => Step::Permute {
                    input: inputs[0],
                    axes: pattern.clone(),
                },
                Operation::Flatten => Step::Flatten { input: inputs[0] },
                Operation::Nonlinearity { activation } => Step::Nonlinearity {
                    input: inputs[0],
                    activation: *activation,
                },
                Operation::Unflatten { height, width } => Step::Unflatten {
                    input: inputs[0],
                    height: *height,
                    width: *width,
                },
            };
            steps.push(step);
        }

        Ok(Self {
            convs,
            pools,
            dropouts,
            upscales,
            steps: Ignored(steps),
            graph: Ignored(graph),
        })
    }

    /// The layer graph this network was compiled from.
    pub fn layer_graph(&self) -> &LayerGraph {
        &self.graph
    }

    /// Expected input shape, `None` for the unbound batch axis.
    pub fn input_shape(&self) -> &[Option<usize>] {
        self.graph.nodes()[0].shape()
    }

    /// Runs the whole graph and returns the values of the requested nodes.
    pub fn forward_nodes(&self, input: Tensor<B, 4>, outputs: &[NodeId]) -> Vec<NodeValue<B>> {
        let mut values: Vec<NodeValue<B>> = Vec::with_capacity(self.steps.len());

        for step in self.steps.iter() {
            let output = match step {
                Step::Input => NodeValue::Spatial(input.clone()),
                Step::Conv { layer, input } => {
                    NodeValue::Spatial(self.convs[*layer].forward(spatial(&values, *input)))
                }
                Step::MaxPool { layer, input } => {
                    NodeValue::Spatial(self.pools[*layer].forward(spatial(&values, *input)))
                }
                Step::Dropout { layer, input } => match value(&values, *input) {
                    NodeValue::Spatial(tensor) => {
                        NodeValue::Spatial(self.dropouts[*layer].forward(tensor))
                    }
                    NodeValue::Flat(tensor) => NodeValue::Flat(self.dropouts[*layer].forward(tensor)),
                },
                Step::Upscale { layer, input } => {
                    NodeValue::Spatial(self.upscales[*layer].forward(spatial(&values, *input)))
                }
                Step::Concat { inputs } => {
                    let tensors = inputs.iter().map(|id| spatial(&values, *id)).collect();
                    NodeValue::Spatial(concat_center_cropped(tensors))
                }
                Step::Permute { input, axes } => match value(&values, *input) {
                    NodeValue::Spatial(tensor) => {
                        NodeValue::Spatial(tensor.permute([
                            axes[0] as isize,
                            axes[1] as isize,
                            axes[2] as isize,
                            axes[3] as isize,
                        ]))
                    }
                    NodeValue::Flat(tensor) => NodeValue::Flat(tensor.permute([
                        axes[0] as isize,
                        axes[1] as isize,
                    ])),
                },
                Step::Flatten { input } => match value(&values, *input) {
                    NodeValue::Spatial(tensor) => {
                        let [first, a, b, c] = tensor.dims();
                        NodeValue::Flat(tensor.reshape([first, a * b * c]))
                    }
                    rows @ NodeValue::Flat(_) => rows,
                },
                Step::Nonlinearity { input, activation } => match value(&values, *input) {
                    NodeValue::Spatial(tensor) => NodeValue::Spatial(activation.apply(tensor)),
                    NodeValue::Flat(tensor) => NodeValue::Flat(activation.apply(tensor)),
                },
                Step::Unflatten {
                    input,
                    height,
                    width,
                } => {
                    let tensor = flat(&values, *input);
                    let [rows, classes] = tensor.dims();
                    let batch = rows / (height * width);
                    NodeValue::Spatial(tensor.reshape([batch, *height, *width, classes]))
                }
            };
            values.push(output);
        }

        outputs
            .iter()
            .map(|&id| value(&values, id))
            .collect()
    }

    /// Number of convolution layers.
    pub fn num_convs(&self) -> usize {
        self.convs.len()
    }

    /// Shapes of all parameters in archive order (per convolution: weight, bias).
    pub fn parameter_shapes(&self) -> Vec<Vec<usize>> {
        self.convs
            .iter()
            .flat_map(|conv| [conv.weight_shape(), conv.bias_shape()])
            .collect()
    }

    /// Exports all parameters in archive order.
    ///
    /// Kernels are written flipped on both spatial axes, the orientation of
    /// a true convolution that archives use.
    pub fn to_arrays(&self) -> Result<Vec<NpyArray>, ModelError> {
        let mut arrays = Vec::with_capacity(self.convs.len() * 2);
        for conv in &self.convs {
            let shape = conv.weight_shape();
            let weights = flip_kernels(&conv.weights_to_vec()?, &shape);
            arrays.push(NpyArray::new(shape, weights)?);
            arrays.push(NpyArray::new(conv.bias_shape(), conv.bias_to_vec()?)?);
        }
        Ok(arrays)
    }

    /// Replaces all parameters with `arrays`, given in archive order.
    ///
    /// Archive kernels are true-convolution kernels and are flipped on both
    /// spatial axes before being applied as cross-correlation weights.
    ///
    /// Every count and shape is checked before any layer is touched, so a
    /// mismatching archive never yields a partially loaded network.
    pub fn with_arrays(mut self, arrays: Vec<NpyArray>) -> Result<Self, ModelError> {
        let expected = self.parameter_shapes();
        if expected.len() != arrays.len() {
            return Err(ModelError::WeightCountMismatch {
                expected: expected.len(),
                actual: arrays.len(),
            });
        }
        for (index, (shape, array)) in expected.iter().zip(&arrays).enumerate() {
            if shape.as_slice() != array.shape() {
                return Err(ModelError::WeightShapeMismatch {
                    index,
                    expected: shape.clone(),
                    actual: array.shape().to_vec(),
                });
            }
        }

        let mut arrays = arrays.into_iter();
        let mut convs = Vec::with_capacity(self.convs.len());
        for conv in std::mem::take(&mut self.convs) {
            match (arrays.next(), arrays.next()) {
                (Some(weights), Some(bias)) => {
                    let flipped = flip_kernels(weights.data(), weights.shape());
                    convs.push(conv.with_parameters(flipped, bias.into_data()))
                }
                _ => unreachable!("array count was checked above"),
            }
        }
        self.convs = convs;
        Ok(self)
    }
}

fn value<B: Backend>(values: &[NodeValue<B>], id: NodeId) -> NodeValue<B> {
    match values.get(id) {
        Some(value) => value.clone(),
        None => unreachable!("node {id} is evaluated before its consumers"),
    }
}

fn spatial<B: Backend>(values: &[NodeValue<B>], id: NodeId) -> Tensor<B, 4> {
    match value(values, id) {
        NodeValue::Spatial(tensor) => tensor,
        NodeValue::Flat(_) => unreachable!("shape inference guarantees node {id} is rank 4"),
    }
}

fn flat<B: Backend>(values: &[NodeValue<B>], id: NodeId) -> Tensor<B, 2> {
    match value(values, id) {
        NodeValue::Flat(tensor) => tensor,
        NodeValue::Spatial(_) => unreachable!("shape inference guarantees node {id} is rank 2"),
    }
}

/// Concatenates along channels after center-cropping every input to the
/// smallest height and width among them.
pub(crate) fn concat_center_cropped<B: Backend>(tensors: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
    let height = tensors.iter().map(|t| t.dims()[2]).min().unwrap_or(0);
    let width = tensors.iter().map(|t| t.dims()[3]).min().unwrap_or(0);
    let cropped = tensors
        .into_iter()
        .map(|tensor| center_crop(tensor, height, width))
        .collect();
    Tensor::cat(cropped, 1)
}

fn center_crop<B: Backend>(tensor: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, channels, h, w] = tensor.dims();
    if h == height && w == width {
        return tensor;
    }
    let top = (h - height) / 2;
    let left = (w - width) / 2;
    tensor.slice([0..batch, 0..channels, top..top + height, left..left + width])
}
