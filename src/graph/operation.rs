//! Operations a layer graph node can perform.
//!
//! Uses a simple enum instead of trait objects for clarity. Each operation
//! knows how to infer its output shape from its inputs' shapes; a `None`
//! dimension is an unbound batch axis.

use crate::errors::ModelError;
use crate::layers::{Activation, Padding};

/// Inferred tensor shape; `None` marks an axis whose size is only known at run time.
pub type Shape = Vec<Option<usize>>;

/// A computation performed by one node of the layer graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Graph input of shape `(batch, channels, height, width)`.
    Input {
        batch_size: Option<usize>,
        channels: usize,
        height: usize,
        width: usize,
    },
    /// Square 2D convolution with a fused activation.
    Conv2d {
        filters: usize,
        kernel_size: usize,
        padding: Padding,
        activation: Activation,
    },
    /// Max pooling with window and stride `pool_size`; trailing rows/columns are dropped.
    MaxPool2d { pool_size: usize },
    /// Dropout, active only in stochastic (training) mode.
    Dropout { prob: f64 },
    /// Nearest-neighbour upscaling by an integer factor.
    Upscale2d { scale_factor: usize },
    /// Channel concatenation; inputs are center-cropped to the smallest spatial size.
    Concat,
    /// Axis permutation: output axis `i` is input axis `pattern[i]`.
    Dimshuffle { pattern: Vec<usize> },
    /// Keeps the first axis and collapses all others into one.
    Flatten,
    /// Standalone elementwise nonlinearity.
    Nonlinearity { activation: Activation },
    /// Splits a `(batch * height * width, classes)` matrix into `(batch, height, width, classes)`.
    Unflatten { height: usize, width: usize },
}

impl Operation {
    /// Creates a new Conv2d operation.
    pub fn conv(filters: usize, kernel_size: usize, padding: Padding, activation: Activation) -> Self {
        Self::Conv2d {
            filters,
            kernel_size,
            padding,
            activation,
        }
    }

    /// Creates a new MaxPool2d operation.
    pub fn max_pool(pool_size: usize) -> Self {
        Self::MaxPool2d { pool_size }
    }

    /// Creates a new Upscale2d operation.
    pub fn upscale(scale_factor: usize) -> Self {
        Self::Upscale2d { scale_factor }
    }

    /// Creates a new Dimshuffle operation.
    pub fn dimshuffle(pattern: Vec<usize>) -> Self {
        Self::Dimshuffle { pattern }
    }

    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Conv2d { .. } => "conv2d",
            Self::MaxPool2d { .. } => "max_pool2d",
            Self::Dropout { .. } => "dropout",
            Self::Upscale2d { .. } => "upscale2d",
            Self::Concat => "concat",
            Self::Dimshuffle { .. } => "dimshuffle",
            Self::Flatten => "flatten",
            Self::Nonlinearity { .. } => "nonlinearity",
            Self::Unflatten { .. } => "unflatten",
        }
    }

    /// Infers the output shape for the given input shapes.
    pub fn output_shape(&self, inputs: &[&[Option<usize>]]) -> Result<Shape, ModelError> {
        self.check_arity(inputs.len())?;

        match self {
            Self::Input {
                batch_size,
                channels,
                height,
                width,
            } => Ok(vec![
                *batch_size,
                Some(*channels),
                Some(*height),
                Some(*width),
            ]),
            Self::Conv2d {
                filters,
                kernel_size,
                padding,
                ..
            } => {
                let (batch, _, height, width) = self.spatial(inputs[0])?;
                let shrink = |size: usize| {
                    padding.output_size(size, *kernel_size).ok_or_else(|| {
                        self.invalid(format!(
                            "kernel {kernel_size} leaves no output for spatial size {size}"
                        ))
                    })
                };
                Ok(vec![
                    batch,
                    Some(*filters),
                    Some(shrink(height)?),
                    Some(shrink(width)?),
                ])
            }
            Self::MaxPool2d { pool_size } => {
                let (batch, channels, height, width) = self.spatial(inputs[0])?;
                if *pool_size == 0 || height < *pool_size || width < *pool_size {
                    return Err(self.invalid(format!(
                        "pool size {pool_size} does not fit spatial size {height}x{width}"
                    )));
                }
                Ok(vec![
                    batch,
                    Some(channels),
                    Some(height / pool_size),
                    Some(width / pool_size),
                ])
            }
            Self::Dropout { prob } => {
                if !(0.0..1.0).contains(prob) {
                    return Err(self.invalid(format!("probability {prob} outside [0, 1)")));
                }
                Ok(inputs[0].to_vec())
            }
            Self::Upscale2d { scale_factor } => {
                let (batch, channels, height, width) = self.spatial(inputs[0])?;
                if *scale_factor == 0 {
                    return Err(self.invalid("scale factor must be positive".to_string()));
                }
                Ok(vec![
                    batch,
                    Some(channels),
                    Some(height * scale_factor),
                    Some(width * scale_factor),
                ])
            }
            Self::Concat => {
                let mut batch = None;
                let mut channels = 0;
                let mut height = usize::MAX;
                let mut width = usize::MAX;
                for shape in inputs {
                    let (b, c, h, w) = self.spatial(shape)?;
                    match (batch, b) {
                        (Some(x), Some(y)) if x != y => {
                            return Err(self.invalid(format!("batch sizes {x} and {y} differ")));
                        }
                        (None, Some(_)) => batch = b,
                        _ => {}
                    }
                    channels += c;
                    height = height.min(h);
                    width = width.min(w);
                }
                Ok(vec![batch, Some(channels), Some(height), Some(width)])
            }
            Self::Dimshuffle { pattern } => {
                let input = inputs[0];
                let mut seen = vec![false; input.len()];
                if pattern.len() != input.len() {
                    return Err(self.invalid(format!(
                        "pattern {pattern:?} does not match rank {}",
                        input.len()
                    )));
                }
                for &axis in pattern {
                    if axis >= input.len() || seen[axis] {
                        return Err(self.invalid(format!("{pattern:?} is not a permutation")));
                    }
                    seen[axis] = true;
                }
                Ok(pattern.iter().map(|&axis| input[axis]).collect())
            }
            Self::Flatten => {
                let input = inputs[0];
                if input.len() < 2 {
                    return Err(self.invalid(format!("needs rank >= 2, got {}", input.len())));
                }
                let rest = input[1..]
                    .iter()
                    .try_fold(1usize, |acc, dim| dim.map(|d| acc * d));
                Ok(vec![input[0], rest])
            }
            Self::Nonlinearity { .. } => Ok(inputs[0].to_vec()),
            Self::Unflatten { height, width } => {
                let input = inputs[0];
                if input.len() != 2 {
                    return Err(self.invalid(format!("needs rank 2, got {}", input.len())));
                }
                let pixels = height * width;
                if pixels == 0 {
                    return Err(self.invalid(format!("empty {height}x{width} images")));
                }
                let batch = match input[0] {
                    Some(rows) if rows % pixels != 0 => {
                        return Err(self.invalid(format!(
                            "{rows} rows do not split into {height}x{width} images"
                        )));
                    }
                    rows => rows.map(|r| r / pixels),
                };
                Ok(vec![batch, Some(*height), Some(*width), input[1]])
            }
        }
    }

    fn check_arity(&self, count: usize) -> Result<(), ModelError> {
        let valid = match self {
            Self::Input { .. } => count == 0,
            Self::Concat => count >= 2,
            _ => count == 1,
        };
        if valid {
            Ok(())
        } else {
            Err(self.invalid(format!("cannot take {count} inputs")))
        }
    }

    /// Splits a rank-4 `(batch, channels, height, width)` shape with known non-batch axes.
    fn spatial(
        &self,
        shape: &[Option<usize>],
    ) -> Result<(Option<usize>, usize, usize, usize), ModelError> {
        match shape {
            [batch, Some(channels), Some(height), Some(width)] => {
                Ok((*batch, *channels, *height, *width))
            }
            _ => Err(self.invalid(format!(
                "expects (batch, channels, height, width) with known sizes, got {shape:?}"
            ))),
        }
    }

    fn invalid(&self, message: String) -> ModelError {
        ModelError::InvalidLayerConfig {
            message: format!("{}: {message}", self.kind()),
        }
    }
}
