//! Named layer graphs and their compiled networks.
//!
//! A [`LayerGraph`] records the structure of a network as an ordered map
//! from stage name to [`Node`], inferring every stage's output shape as it
//! is added. Compiling it yields a [`GraphNetwork`] with initialized layers
//! on a device.
//!
//! # Example
//!
//! ```
//! use tractseg_unet::graph::{LayerGraph, Operation};
//! use tractseg_unet::layers::{Activation, Padding};
//! use burn::backend::NdArray;
//! use burn::tensor::{Tensor, backend::Backend};
//!
//! type TestBackend = NdArray;
//! let device = <TestBackend as Backend>::Device::default();
//!
//! let mut graph = LayerGraph::new();
//! graph
//!     .add(
//!         "input",
//!         Operation::Input { batch_size: None, channels: 1, height: 4, width: 4 },
//!         &[],
//!     )
//!     .unwrap();
//! let conv = graph
//!     .add("conv", Operation::conv(2, 3, Padding::Same, Activation::Relu), &["input"])
//!     .unwrap();
//!
//! let network = graph.compile::<TestBackend>(1, &device).unwrap();
//! let outputs = network.forward_nodes(Tensor::ones([1, 1, 4, 4], &device), &[conv]);
//! assert_eq!(outputs[0].clone().into_spatial().unwrap().dims(), [1, 2, 4, 4]);
//! ```

mod core;
mod network;
mod node;
mod operation;

pub use core::LayerGraph;
pub use network::{GraphNetwork, NodeValue};
pub use node::{Node, NodeId};
pub use operation::{Operation, Shape};
