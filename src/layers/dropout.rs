//! Dropout driven by a model-owned random stream.

use std::sync::{Arc, Mutex, PoisonError};

use burn::{
    module::{Ignored, Module},
    tensor::{Tensor, TensorData, backend::Backend},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Shared random stream for dropout masks.
///
/// Clones share the stream, so a module cloned for an optimizer step keeps
/// drawing where the previous one stopped.
#[derive(Debug, Clone)]
pub struct DropoutRng(Arc<Mutex<StdRng>>);

impl DropoutRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))))
    }

    /// Draws `len` mask values, each 1.0 with probability `retain`, else 0.0.
    fn sample_mask(&self, len: usize, retain: f64) -> Vec<f32> {
        let mut rng = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        (0..len)
            .map(|_| if rng.gen_bool(retain) { 1.0 } else { 0.0 })
            .collect()
    }
}

/// Zeroes elements with probability `prob` during training and rescales the
/// rest by `1 / (1 - prob)`.
///
/// Inactive on backends without autodiff, which is how inference runs.
#[derive(Module, Clone, Debug)]
pub struct SeededDropout {
    prob: f64,
    rng: Ignored<DropoutRng>,
}

impl SeededDropout {
    /// `prob` must lie in `[0, 1)`.
    pub fn new(prob: f64, seed: u64) -> Self {
        Self {
            prob,
            rng: Ignored(DropoutRng::seed_from_u64(seed)),
        }
    }

    pub fn prob(&self) -> f64 {
        self.prob
    }

    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.prob == 0.0 {
            return input;
        }

        let retain = 1.0 - self.prob;
        let dims = input.dims();
        let mask = self.rng.sample_mask(dims.iter().product(), retain);
        let mask = Tensor::<B, D>::from_data(
            TensorData::new(mask, dims).convert::<B::FloatElem>(),
            &input.device(),
        );

        (input * mask).div_scalar(retain)
    }
}
