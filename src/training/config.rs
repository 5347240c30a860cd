//! Experiment hyperparameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ModelError;
use crate::unet::UNetConfig;

/// Representation of the input slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SegInput {
    /// Peak directions of the fiber orientation distribution.
    #[default]
    Peaks,
    /// Any other representation (e.g. raw diffusion signal), 33 channels.
    #[serde(other)]
    Other,
}

/// How bundles are split across output classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    SingleDirection,
    Combined,
}

/// Hyperparameters of one segmentation model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParameters {
    /// Input representation.
    pub seg_input: SegInput,
    /// Structural mode.
    #[serde(alias = "type")]
    pub model_type: ModelType,
    /// Number of output classes.
    pub num_classes: usize,
    /// Resolution tag: `1.25mm`, `2mm` or `2.5mm`.
    pub resolution: String,
    /// Filters of the first UNet stage.
    pub unet_nr_filt: usize,
    /// Dropout flag; the bottleneck dropout is applied regardless.
    pub use_dropout: bool,
    /// Initial Adamax learning rate.
    pub learning_rate: f64,
    /// Whether to load weights at construction.
    pub load_weights: bool,
    /// Experiment directory.
    pub exp_path: PathBuf,
    /// Weight archive, relative to `exp_path` unless absolute.
    pub weights_path: PathBuf,
    /// Seed for weight initialization and dropout masks.
    pub seed: u64,
}

impl Default for HyperParameters {
    fn default() -> Self {
        Self {
            seg_input: SegInput::Peaks,
            model_type: ModelType::SingleDirection,
            num_classes: 72,
            resolution: "1.25mm".to_string(),
            unet_nr_filt: 64,
            use_dropout: false,
            learning_rate: 0.002,
            load_weights: false,
            exp_path: PathBuf::new(),
            weights_path: PathBuf::new(),
            seed: 1,
        }
    }
}

impl HyperParameters {
    /// Creates a new HyperParameters with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses hyperparameters from a JSON object; absent fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Sets the input representation.
    pub fn seg_input(mut self, seg_input: SegInput) -> Self {
        self.seg_input = seg_input;
        self
    }

    /// Sets the structural mode.
    pub fn model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    /// Sets the number of classes.
    pub fn num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Sets the resolution tag.
    pub fn resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    /// Sets the base filter count.
    pub fn unet_nr_filt(mut self, filters: usize) -> Self {
        self.unet_nr_filt = filters;
        self
    }

    pub fn use_dropout(mut self, use_dropout: bool) -> Self {
        self.use_dropout = use_dropout;
        self
    }

    /// Sets the learning rate.
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Loads weights from `exp_path / weights_path` at construction.
    pub fn load_weights(mut self, exp_path: impl Into<PathBuf>, weights_path: impl Into<PathBuf>) -> Self {
        self.load_weights = true;
        self.exp_path = exp_path.into();
        self.weights_path = weights_path.into();
        self
    }

    /// Sets the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of input channels implied by the input representation.
    pub fn input_channels(&self) -> usize {
        match (self.seg_input, self.model_type) {
            (SegInput::Peaks, ModelType::SingleDirection) => 9,
            (SegInput::Peaks, ModelType::Combined) => 3 * self.num_classes,
            (SegInput::Other, _) => 33,
        }
    }

    /// Input `[height, width]` for the resolution tag.
    pub fn input_dim(&self) -> Result<[usize; 2], ModelError> {
        match self.resolution.as_str() {
            "1.25mm" => Ok([144, 144]),
            "2mm" | "2.5mm" => Ok([80, 80]),
            other => Err(ModelError::UnsupportedResolution(other.to_string())),
        }
    }

    /// Weight archive to load at construction, if any.
    pub fn weights_file(&self) -> Option<PathBuf> {
        self.load_weights
            .then(|| self.exp_path.join(&self.weights_path))
    }

    /// UNet configuration derived from these hyperparameters.
    pub fn unet_config(&self) -> Result<UNetConfig, ModelError> {
        Ok(
            UNetConfig::new(self.input_channels(), self.num_classes, self.input_dim()?)
                .with_base_filters(self.unet_nr_filt)
                .with_dropout(self.use_dropout),
        )
    }
}
