//! Training components for the segmentation model.
//!
//! This module provides:
//! - Hyperparameters and their derived network geometry
//! - Hard and soft Dice scores, and the Dice loss
//! - The Adamax optimizer with a shared learning rate

mod config;
mod loss;
mod optimizer;

pub use config::{HyperParameters, ModelType, SegInput};
pub use loss::{Dice, DiceLoss, HARD_THRESHOLD};
pub use optimizer::{Adamax, AdamaxConfig, AdamaxState, SharedLearningRate};
