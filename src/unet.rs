//! UNet - the multi-label segmentation topology.
//!
//! Four contracting stages, a bottleneck with dropout and four expanding
//! stages joined to their mirrored contracting stage by center-cropped
//! skip concatenations. The head projects to one logit per class, applies
//! a sigmoid on the flattened `(pixels, classes)` matrix and reshapes it to
//! `(batch, height, width, classes)`.

use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};
use log::{info, warn};

use crate::errors::ModelError;
use crate::graph::{GraphNetwork, LayerGraph, NodeId, Operation};
use crate::layers::{Activation, Padding};

/// Dropout rate of the bottleneck.
pub const BOTTLENECK_DROPOUT: f64 = 0.4;

/// Name of the flattened per-pixel probability node.
pub const FLAT_OUTPUT: &str = "output_flat";

/// Name of the `(batch, height, width, classes)` probability node.
pub const OUTPUT: &str = "output";

const DEPTH: usize = 4;

/// Configuration for building a UNet.
#[derive(Debug, Clone)]
pub struct UNetConfig {
    /// Channels of the input slices.
    pub input_channels: usize,
    /// Number of output classes (independent labels).
    pub num_classes: usize,
    /// Input `[height, width]`.
    pub input_dim: [usize; 2],
    /// Filters of the first stage; doubled at each contracting stage.
    pub base_filters: usize,
    /// Border handling of the 3x3 convolutions.
    pub padding: Padding,
    /// Nonlinearity after each 3x3 convolution.
    pub activation: Activation,
    /// Dropout flag. Kept for configuration compatibility; the bottleneck
    /// dropout is applied regardless of its value.
    pub dropout: bool,
    /// Fixed batch size, or `None` to accept any.
    pub batch_size: Option<usize>,
}

impl UNetConfig {
    /// Creates a config with 64 base filters, same padding and ReLU.
    pub fn new(input_channels: usize, num_classes: usize, input_dim: [usize; 2]) -> Self {
        Self {
            input_channels,
            num_classes,
            input_dim,
            base_filters: 64,
            padding: Padding::Same,
            activation: Activation::Relu,
            dropout: true,
            batch_size: None,
        }
    }

    pub fn with_base_filters(mut self, base_filters: usize) -> Self {
        self.base_filters = base_filters;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_dropout(mut self, dropout: bool) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builds the named layer graph without allocating any weights.
    pub fn layer_graph(&self) -> Result<LayerGraph, ModelError> {
        if self.input_channels == 0 || self.num_classes == 0 || self.base_filters == 0 {
            return Err(ModelError::InvalidLayerConfig {
                message: format!(
                    "input channels ({}), classes ({}) and base filters ({}) must be positive",
                    self.input_channels, self.num_classes, self.base_filters
                ),
            });
        }

        let mut graph = LayerGraph::new();
        let [height, width] = self.input_dim;
        graph.add(
            "input",
            Operation::Input {
                batch_size: self.batch_size,
                channels: self.input_channels,
                height,
                width,
            },
            &[],
        )?;

        let mut previous = "input".to_string();
        for stage in 1..=DEPTH {
            let filters = self.base_filters << (stage - 1);
            let first = format!("contr_{stage}_1");
            let second = format!("contr_{stage}_2");
            let pool = format!("pool{stage}");
            graph.add(first.as_str(), self.conv3(filters), &[previous.as_str()])?;
            graph.add(second.as_str(), self.conv3(filters), &[first.as_str()])?;
            graph.add(pool.as_str(), Operation::max_pool(2), &[second.as_str()])?;
            previous = pool;
        }

        graph.add(
            "dropout",
            Operation::Dropout {
                prob: BOTTLENECK_DROPOUT,
            },
            &[previous.as_str()],
        )?;
        let bottleneck = self.base_filters << DEPTH;
        graph.add("encode_1", self.conv3(bottleneck), &["dropout"])?;
        graph.add("encode_2", self.conv3(bottleneck), &["encode_1"])?;
        graph.add("deconv1", Operation::upscale(2), &["encode_2"])?;

        for stage in 1..=DEPTH {
            let filters = self.base_filters << (DEPTH - stage);
            let skip = format!("contr_{}_2", DEPTH + 1 - stage);
            let upscaled = format!("deconv{stage}");
            let concat = format!("concat{stage}");
            let first = format!("expand_{stage}_1");
            let second = format!("expand_{stage}_2");
            graph.add(concat.as_str(), Operation::Concat, &[upscaled.as_str(), skip.as_str()])?;
            graph.add(first.as_str(), self.conv3(filters), &[concat.as_str()])?;
            graph.add(second.as_str(), self.conv3(filters), &[first.as_str()])?;
            if stage < DEPTH {
                graph.add(format!("deconv{}", stage + 1), Operation::upscale(2), &[second.as_str()])?;
            }
        }

        graph.add(
            "conv_5",
            Operation::conv(self.num_classes, 1, Padding::Same, Activation::None),
            &[format!("expand_{DEPTH}_2").as_str()],
        )?;
        graph.add("dimshuffle", Operation::dimshuffle(vec![1, 0, 2, 3]), &["conv_5"])?;
        graph.add("reshapeSeg", Operation::Flatten, &["dimshuffle"])?;
        graph.add("dimshuffle2", Operation::dimshuffle(vec![1, 0]), &["reshapeSeg"])?;
        graph.add(
            FLAT_OUTPUT,
            Operation::Nonlinearity {
                activation: Activation::Sigmoid,
            },
            &["dimshuffle2"],
        )?;

        let (out_height, out_width) = match graph.shape("conv_5")? {
            [_, _, Some(h), Some(w)] => (*h, *w),
            other => {
                return Err(ModelError::InvalidGraph(format!(
                    "conv_5 has no spatial size: {other:?}"
                )));
            }
        };
        graph.add(
            OUTPUT,
            Operation::Unflatten {
                height: out_height,
                width: out_width,
            },
            &[FLAT_OUTPUT],
        )?;

        Ok(graph)
    }

    /// Builds the graph and initializes its weights from `seed`.
    pub fn init<B: Backend>(&self, seed: u64, device: &B::Device) -> Result<UNet<B>, ModelError> {
        let graph = self.layer_graph()?;
        info!(
            "Building UNet: {} input channels, {} classes, {}x{} input, {} base filters",
            self.input_channels,
            self.num_classes,
            self.input_dim[0],
            self.input_dim[1],
            self.base_filters
        );
        if !self.dropout {
            warn!("Dropout flag is off, bottleneck dropout is still applied during training");
        }

        let flat_output = graph.id_of(FLAT_OUTPUT)?;
        let output = graph.id_of(OUTPUT)?;
        let network = graph.compile(seed, device)?;
        info!(
            "UNet has {} nodes and {} convolutions",
            network.layer_graph().len(),
            network.num_convs()
        );

        Ok(UNet {
            network,
            flat_output,
            output,
        })
    }

    fn conv3(&self, filters: usize) -> Operation {
        Operation::conv(filters, 3, self.padding, self.activation)
    }
}

/// A compiled UNet.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    network: GraphNetwork<B>,
    flat_output: NodeId,
    output: NodeId,
}

impl<B: Backend> UNet<B> {
    /// Returns the probabilities as `(batch, height, width, classes)`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_outputs(input).1
    }

    /// Returns the flat `(batch * height * width, classes)` probabilities and
    /// their `(batch, height, width, classes)` reshape from one pass.
    pub fn forward_outputs(&self, input: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 4>) {
        let mut outputs = self
            .network
            .forward_nodes(input, &[self.flat_output, self.output])
            .into_iter();
        match (
            outputs.next().and_then(|v| v.into_flat()),
            outputs.next().and_then(|v| v.into_spatial()),
        ) {
            (Some(flat), Some(image)) => (flat, image),
            _ => unreachable!("output nodes have fixed ranks"),
        }
    }

    /// Fails unless `dims` is accepted by the input node.
    pub fn check_input(&self, dims: [usize; 4]) -> Result<(), ModelError> {
        let expected = self.network.input_shape();
        let matches = expected
            .iter()
            .zip(dims)
            .all(|(want, got)| want.is_none_or(|want| want == got));
        if matches && dims[0] > 0 {
            Ok(())
        } else {
            Err(ModelError::ShapeMismatch {
                name: "input".to_string(),
                expected: expected.to_vec(),
                actual: dims.to_vec(),
            })
        }
    }

    /// Shape of the `(batch, height, width, classes)` output; batch is `None`
    /// unless fixed at build time.
    pub fn output_shape(&self) -> &[Option<usize>] {
        self.network
            .layer_graph()
            .get(self.output)
            .map(|node| node.shape())
            .unwrap_or(&[])
    }

    pub fn network(&self) -> &GraphNetwork<B> {
        &self.network
    }

    pub(crate) fn into_network(self) -> GraphNetwork<B> {
        self.network
    }

    pub(crate) fn with_network(mut self, network: GraphNetwork<B>) -> Self {
        self.network = network;
        self
    }

    pub fn layer_graph(&self) -> &LayerGraph {
        self.network.layer_graph()
    }
}
