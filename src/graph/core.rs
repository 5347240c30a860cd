//! LayerGraph - insertion-ordered mapping from stage name to node.
//!
//! The graph holds structure only. Weights are created when `compile()`
//! turns it into a [`GraphNetwork`] on a device.

use std::collections::HashMap;

use burn::tensor::backend::Backend;

use super::network::GraphNetwork;
use super::node::{Node, NodeId};
use super::operation::Operation;
use crate::errors::ModelError;

/// Ordered collection of named nodes.
///
/// Nodes are stored in an arena in insertion order and indexed by name.
/// A node may only reference names that were inserted before it, so the
/// insertion order is always a valid execution order.
///
/// # Example
///
/// ```
/// use tractseg_unet::graph::{LayerGraph, Operation};
/// use tractseg_unet::layers::{Activation, Padding};
///
/// let mut graph = LayerGraph::new();
/// graph
///     .add(
///         "input",
///         Operation::Input { batch_size: None, channels: 3, height: 16, width: 16 },
///         &[],
///     )
///     .unwrap();
/// graph
///     .add("conv", Operation::conv(8, 3, Padding::Same, Activation::Relu), &["input"])
///     .unwrap();
///
/// assert_eq!(graph.shape("conv").unwrap(), &[None, Some(8), Some(16), Some(16)]);
/// assert!(graph.add("bad", Operation::max_pool(2), &["missing"]).is_err());
/// ```
#[derive(Clone, Debug, Default)]
pub struct LayerGraph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node reading from the named, previously inserted nodes.
    ///
    /// Fails if the name is taken, an input name is unknown, or the
    /// operation cannot accept the inputs' shapes. The graph is unchanged
    /// on failure.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        operation: Operation,
        inputs: &[&str],
    ) -> Result<NodeId, ModelError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(ModelError::DuplicateNode(name));
        }

        let input_ids = inputs
            .iter()
            .map(|input| self.id_of(input))
            .collect::<Result<Vec<_>, _>>()?;
        let input_shapes: Vec<&[Option<usize>]> =
            input_ids.iter().map(|&id| self.nodes[id].shape()).collect();

        let shape = operation
            .output_shape(&input_shapes)
            .map_err(|err| match err {
                ModelError::InvalidLayerConfig { message } => ModelError::InvalidLayerConfig {
                    message: format!("node '{name}': {message}"),
                },
                other => other,
            })?;

        let id = self.nodes.len();
        self.index.insert(name.clone(), id);
        self.nodes.push(Node::new(id, name, operation, input_ids, shape));
        Ok(id)
    }

    /// Returns the id of the named node.
    pub fn id_of(&self, name: &str) -> Result<NodeId, ModelError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownNode(name.to_string()))
    }

    /// Returns the named node, if present.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&id| &self.nodes[id])
    }

    /// Returns the node with the given id, if present.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Returns the inferred output shape of the named node.
    pub fn shape(&self, name: &str) -> Result<&[Option<usize>], ModelError> {
        let id = self.id_of(name)?;
        Ok(self.nodes[id].shape())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Returns the node names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the single input node.
    pub fn input(&self) -> Result<&Node, ModelError> {
        let mut inputs = self.nodes.iter().filter(|node| node.is_input());
        match (inputs.next(), inputs.next()) {
            (Some(input), None) => Ok(input),
            (None, _) => Err(ModelError::InvalidGraph(
                "graph has no input node".to_string(),
            )),
            (Some(_), Some(_)) => Err(ModelError::InvalidGraph(
                "graph has more than one input node".to_string(),
            )),
        }
    }

    /// Compiles this graph into a network with initialized weights.
    ///
    /// All randomness of the network (weight initialization and dropout
    /// masks) is derived from `seed`.
    pub fn compile<B: Backend>(
        &self,
        seed: u64,
        device: &B::Device,
    ) -> Result<GraphNetwork<B>, ModelError> {
        GraphNetwork::new(self.clone(), seed, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Activation, Padding};

    fn input_graph() -> LayerGraph {
        let mut graph = LayerGraph::new();
        graph
            .add(
                "input",
                Operation::Input {
                    batch_size: None,
                    channels: 2,
                    height: 8,
                    width: 8,
                },
                &[],
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let mut graph = input_graph();
        graph
            .add("b", Operation::conv(4, 3, Padding::Same, Activation::Relu), &["input"])
            .unwrap();
        graph.add("a", Operation::max_pool(2), &["b"]).unwrap();

        assert_eq!(graph.names(), vec!["input", "b", "a"]);
        assert_eq!(graph.id_of("a").unwrap(), 2);
        assert_eq!(graph.get(2).unwrap().inputs(), &[1]);
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let mut graph = input_graph();

        let result = graph.add("pool", Operation::max_pool(2), &["conv"]);

        assert!(matches!(result, Err(ModelError::UnknownNode(name)) if name == "conv"));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut graph = input_graph();
        graph.add("pool", Operation::max_pool(2), &["input"]).unwrap();

        let result = graph.add("pool", Operation::max_pool(2), &["input"]);

        assert!(matches!(result, Err(ModelError::DuplicateNode(_))));
    }

    #[test]
    fn test_invalid_shape_names_the_node() {
        let mut graph = input_graph();

        let err = graph
            .add("pool", Operation::max_pool(16), &["input"])
            .unwrap_err();

        assert!(err.to_string().contains("pool"));
        assert!(!graph.contains("pool"));
    }

    #[test]
    fn test_skip_concat_shape() {
        let mut graph = input_graph();
        graph
            .add("left", Operation::conv(3, 3, Padding::Valid, Activation::Relu), &["input"])
            .unwrap();
        graph
            .add("right", Operation::conv(5, 1, Padding::Same, Activation::Relu), &["input"])
            .unwrap();
        graph
            .add("concat", Operation::Concat, &["left", "right"])
            .unwrap();

        assert_eq!(
            graph.shape("concat").unwrap(),
            &[None, Some(8), Some(6), Some(6)]
        );
    }

    #[test]
    fn test_input_lookup() {
        assert_eq!(input_graph().input().unwrap().name(), "input");
        assert!(LayerGraph::new().input().is_err());
    }
}
