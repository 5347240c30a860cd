//! # tractseg-unet
//!
//! A multi-label U-Net for segmenting white-matter tracts in 2D slices of
//! diffusion MRI derived volumes, built on the Burn framework.
//!
//! The network is described as a named layer graph, compiled into a Burn
//! module and wrapped by a [`SegmentationModel`] that trains it with a Dice
//! loss and the Adamax optimizer.
//!
//! ## Features
//!
//! - **Burn Backend**: Uses the Burn framework with WGPU backend for GPU acceleration;
//!   any other Burn backend works as well.
//! - **Named Layer Graph**: Every stage is addressable by name and its output shape is
//!   known before any weight is allocated.
//! - **Weight Archives**: Parameters are exchanged as numpy `.npz` archives.
//! - **Reproducible**: Weight initialization and dropout masks derive from one seed.
//!
//! ## Example
//!
//! ```
//! use tractseg_unet::prelude::*;
//! use burn::backend::NdArray;
//! use burn::tensor::Tensor;
//!
//! type Backend = NdArray;
//!
//! let device = <Backend as burn::tensor::backend::Backend>::Device::default();
//!
//! let unet: UNet<Backend> = UNetConfig::new(9, 2, [16, 16])
//!     .with_base_filters(2)
//!     .init(1, &device)
//!     .expect("Failed to build model");
//!
//! let probabilities = unet.forward(Tensor::zeros([1, 9, 16, 16], &device));
//! assert_eq!(probabilities.dims(), [1, 16, 16, 2]);
//! ```

pub mod errors;
pub mod graph;
pub mod layers;
pub mod segmentation;
pub mod training;
pub mod unet;
pub mod weights;

// Re-exports for convenience
pub use errors::ModelError;
pub use layers::activation::Activation;
pub use segmentation::{SegmentationModel, StepOutput};
pub use training::HyperParameters;
pub use unet::{UNet, UNetConfig};

/// Backend type alias for WGPU with autodiff support.
pub type Backend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// Backend type for inference (no autodiff).
pub type InferenceBackend = burn::backend::Wgpu;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::errors::ModelError;
    pub use crate::graph::{LayerGraph, Operation};
    pub use crate::layers::{Activation, Padding};
    pub use crate::segmentation::{SegmentationModel, StepOutput};
    pub use crate::training::{
        AdamaxConfig, Dice, DiceLoss, HyperParameters, ModelType, SegInput, SharedLearningRate,
    };
    pub use crate::unet::{UNet, UNetConfig};
    pub use crate::weights::{NpyArray, read_archive, write_archive};
    pub use crate::{Backend, InferenceBackend};
}
