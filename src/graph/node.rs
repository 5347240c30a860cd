//! Node - one named stage of a layer graph.

use super::operation::{Operation, Shape};

/// Position of a node in its graph's insertion order.
pub type NodeId = usize;

/// A named stage of the layer graph.
///
/// It tracks:
/// - The operation it performs
/// - The nodes it reads from (always inserted earlier)
/// - The shape of the tensor it produces
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    name: String,
    operation: Operation,
    inputs: Vec<NodeId>,
    shape: Shape,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        operation: Operation,
        inputs: Vec<NodeId>,
        shape: Shape,
    ) -> Self {
        Self {
            id,
            name,
            operation,
            inputs,
            shape,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Ids of the nodes this one consumes.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Inferred output shape; `None` for the unbound batch axis.
    pub fn shape(&self) -> &[Option<usize>] {
        &self.shape
    }

    /// Returns true if this is a graph input (no producer).
    pub fn is_input(&self) -> bool {
        matches!(self.operation, Operation::Input { .. })
    }
}
