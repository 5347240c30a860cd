//! SegmentationModel - a UNet assembled for training and inference.
//!
//! Wraps the network with input/label validation, the Dice loss and
//! scores, and an Adamax optimizer driven by a shared learning rate.

use std::path::Path;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer, adaptor::OptimizerAdaptor},
    tensor::{ElementConversion, Int, Tensor, backend::AutodiffBackend, backend::Backend},
};
use log::{debug, info};

use crate::errors::ModelError;
use crate::graph::LayerGraph;
use crate::training::{Adamax, AdamaxConfig, Dice, DiceLoss, HyperParameters, SharedLearningRate};
use crate::unet::{UNet, UNetConfig};
use crate::weights::{read_archive, write_archive};

/// Result of a training or evaluation step.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// `1 - mean(soft dice)`.
    pub loss: f32,
    /// Flat probabilities, `(batch * height * width, classes)`.
    pub prediction: Tensor<B, 2>,
    /// Mean hard Dice over instances and classes.
    pub mean_dice: f32,
}

/// A UNet with its optimizer, ready to be driven by a training loop.
pub struct SegmentationModel<B: AutodiffBackend> {
    unet: UNet<B>,
    optimizer: OptimizerAdaptor<Adamax, UNet<B>, B>,
    learning_rate: SharedLearningRate,
}

impl<B: AutodiffBackend> SegmentationModel<B> {
    /// Builds the model described by `hyperparameters`, loading weights if configured.
    pub fn new(hyperparameters: &HyperParameters, device: &B::Device) -> Result<Self, ModelError> {
        let config = hyperparameters.unet_config()?;
        let mut model = Self::from_config(
            &config,
            hyperparameters.seed,
            hyperparameters.learning_rate,
            device,
        )?;

        if let Some(path) = hyperparameters.weights_file() {
            model.load_weights(path)?;
        }
        Ok(model)
    }

    /// Builds a freshly initialized model from a UNet configuration.
    pub fn from_config(
        config: &UNetConfig,
        seed: u64,
        learning_rate: f64,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            unet: config.init(seed, device)?,
            optimizer: AdamaxConfig::new().init(),
            learning_rate: SharedLearningRate::new(learning_rate),
        })
    }

    /// Runs one stochastic forward pass and applies an Adamax update.
    ///
    /// `input` is `(batch, channels, height, width)`, `labels` is
    /// `(batch, classes, height, width)` with values in `{0, 1}`. The
    /// returned loss, prediction and Dice are those of the pass before
    /// the update.
    pub fn train_step(
        &mut self,
        input: Tensor<B, 4>,
        labels: Tensor<B, 4, Int>,
    ) -> Result<StepOutput<B::InnerBackend>, ModelError> {
        self.check_shapes(input.dims(), labels.dims())?;

        let (loss, prediction, mean_dice) = evaluate(&self.unet, input, labels.float());
        let loss_value: f32 = loss.clone().into_scalar().elem();
        let mean_dice: f32 = mean_dice.into_scalar().elem();

        let grads = GradientsParams::from_grads(loss.backward(), &self.unet);
        let lr = self.learning_rate.get();
        self.unet = self.optimizer.step(lr, self.unet.clone(), grads);

        debug!("Train step: loss = {loss_value:.6}, dice = {mean_dice:.4}, lr = {lr}");
        Ok(StepOutput {
            loss: loss_value,
            prediction: prediction.inner(),
            mean_dice,
        })
    }

    /// Evaluates a batch deterministically, without updating the weights.
    pub fn predict(
        &self,
        input: Tensor<B, 4>,
        labels: Tensor<B, 4, Int>,
    ) -> Result<StepOutput<B::InnerBackend>, ModelError> {
        self.check_shapes(input.dims(), labels.dims())?;

        let unet = self.unet.valid();
        let (loss, prediction, mean_dice) =
            evaluate(&unet, input.inner(), labels.float().inner());
        let loss: f32 = loss.into_scalar().elem();
        let mean_dice: f32 = mean_dice.into_scalar().elem();

        debug!("Predict: loss = {loss:.6}, dice = {mean_dice:.4}");
        Ok(StepOutput {
            loss,
            prediction,
            mean_dice,
        })
    }

    /// Deterministic probabilities, `(batch, height, width, classes)`.
    pub fn probabilities(
        &self,
        input: Tensor<B, 4>,
    ) -> Result<Tensor<B::InnerBackend, 4>, ModelError> {
        self.unet.check_input(input.dims())?;
        Ok(self.unet.valid().forward(input.inner()))
    }

    /// Handle to the learning rate used by the next update.
    pub fn learning_rate(&self) -> SharedLearningRate {
        self.learning_rate.clone()
    }

    pub fn unet(&self) -> &UNet<B> {
        &self.unet
    }

    pub fn layer_graph(&self) -> &LayerGraph {
        self.unet.layer_graph()
    }

    /// Writes all parameters to a weight archive.
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        info!("Saving weights ... ({})", path.display());
        write_archive(path, &self.unet.network().to_arrays()?)
    }

    /// Replaces all parameters with those of a weight archive.
    ///
    /// The archive is fully validated first; on error the model is
    /// unchanged. Optimizer state is reset on success.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        info!("Loading weights ... ({})", path.display());

        let arrays = read_archive(path)?;
        let network = self.unet.clone().into_network().with_arrays(arrays)?;
        self.unet = self.unet.clone().with_network(network);
        self.optimizer = AdamaxConfig::new().init();
        Ok(())
    }

    fn check_shapes(&self, input: [usize; 4], labels: [usize; 4]) -> Result<(), ModelError> {
        self.unet.check_input(input)?;

        let output = self.unet.output_shape();
        let expected = vec![Some(input[0]), output[3], output[1], output[2]];
        if expected.iter().zip(labels).all(|(want, got)| *want == Some(got)) {
            Ok(())
        } else {
            Err(ModelError::ShapeMismatch {
                name: "labels".to_string(),
                expected,
                actual: labels.to_vec(),
            })
        }
    }
}

/// Returns the Dice loss, the flat probabilities and the mean hard Dice.
fn evaluate<B: Backend>(
    unet: &UNet<B>,
    input: Tensor<B, 4>,
    targets: Tensor<B, 4>,
) -> (Tensor<B, 1>, Tensor<B, 2>, Tensor<B, 1>) {
    let (flat, image) = unet.forward_outputs(input);
    let probabilities = image.permute([0, 3, 1, 2]);

    let loss = DiceLoss::new().forward(probabilities.clone(), targets.clone());
    let mean_dice = Dice::Hard.mean(probabilities, targets);
    (loss, flat, mean_dice)
}
