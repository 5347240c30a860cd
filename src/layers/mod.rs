//! Neural network layer implementations.
//!
//! Convolutions with fused activations, the activation functions
//! themselves, and a dropout whose masks come from a seeded stream.

pub mod activation;
pub mod conv;
pub mod dropout;

pub use activation::Activation;
pub use conv::{ConvLayer, ConvLayerConfig, Padding};
pub use dropout::SeededDropout;
