//! Dice scores and the Dice loss.

use burn::tensor::{Tensor, backend::Backend};

/// Keeps the score defined when both masks are empty (it is 0 then).
const DICE_EPSILON: f64 = 1e-6;

/// Threshold at which a probability counts as a positive prediction.
pub const HARD_THRESHOLD: f64 = 0.5;

/// Dice coefficient variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dice {
    /// Predictions are thresholded at [`HARD_THRESHOLD`]; not differentiable.
    Hard,
    /// Probabilities are used directly.
    Soft,
}

impl Dice {
    /// Dice per instance and per class, summed over the spatial axes.
    ///
    /// Both inputs are `(batch, classes, height, width)`; the result is
    /// `(batch, classes)`:
    ///
    /// `2 * sum(p * t) / (sum(p) + sum(t) + 1e-6)`
    pub fn per_instance_and_class<B: Backend>(
        &self,
        probabilities: Tensor<B, 4>,
        targets: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        let [batch, classes, _, _] = probabilities.dims();
        let predictions = match self {
            Dice::Hard => probabilities.greater_equal_elem(HARD_THRESHOLD).float(),
            Dice::Soft => probabilities,
        };

        let intersection = spatial_sum(predictions.clone() * targets.clone());
        let total = spatial_sum(predictions) + spatial_sum(targets);

        (intersection.mul_scalar(2.0) / total.add_scalar(DICE_EPSILON)).reshape([batch, classes])
    }

    /// Mean Dice over all instances and classes.
    pub fn mean<B: Backend>(&self, probabilities: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        self.per_instance_and_class(probabilities, targets).mean()
    }
}

/// Loss that maximizes the mean soft Dice: `1 - mean(soft dice)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiceLoss;

impl DiceLoss {
    pub fn new() -> Self {
        Self
    }

    /// Computes the loss on `(batch, classes, height, width)` inputs.
    pub fn forward<B: Backend>(&self, probabilities: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        Dice::Soft
            .mean(probabilities, targets)
            .neg()
            .add_scalar(1.0)
    }
}

fn spatial_sum<B: Backend>(tensor: Tensor<B, 4>) -> Tensor<B, 4> {
    tensor.sum_dim(3).sum_dim(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn mask(values: [[f32; 4]; 2]) -> Tensor<TestBackend, 4> {
        let device = <TestBackend as Backend>::Device::default();
        // one instance, two classes, 2x2 images
        Tensor::<TestBackend, 2>::from_floats(values, &device).reshape([1, 2, 2, 2])
    }

    fn scores(dice: Dice, p: [[f32; 4]; 2], t: [[f32; 4]; 2]) -> Vec<f32> {
        dice.per_instance_and_class(mask(p), mask(t))
            .into_data()
            .to_vec()
            .unwrap()
    }

    #[test]
    fn test_identical_masks_score_one() {
        let m = [[1.0, 0.0, 1.0, 1.0], [0.0, 0.0, 0.0, 1.0]];

        for dice in [Dice::Hard, Dice::Soft] {
            for score in scores(dice, m, m) {
                assert!((score - 1.0).abs() < 1e-5, "expected 1, got {score}");
            }
        }
    }

    #[test]
    fn test_disjoint_masks_score_zero() {
        let p = [[1.0, 1.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]];
        let t = [[0.0, 0.0, 1.0, 1.0], [0.0, 1.0, 1.0, 1.0]];

        assert_eq!(scores(Dice::Hard, p, t), vec![0.0, 0.0]);
        assert_eq!(scores(Dice::Soft, p, t), vec![0.0, 0.0]);
    }

    #[test]
    fn test_degenerate_masks_stay_in_range() {
        let empty = [[0.0; 4], [0.0; 4]];
        let full = [[1.0; 4], [1.0; 4]];

        for dice in [Dice::Hard, Dice::Soft] {
            for (p, t) in [(empty, empty), (empty, full), (full, empty)] {
                for score in scores(dice, p, t) {
                    assert!((0.0..=1.0).contains(&score), "{dice:?} gave {score}");
                }
            }
            assert_eq!(scores(dice, empty, empty), vec![0.0, 0.0]);
        }
    }

    #[test]
    fn test_hard_thresholds_soft_does_not() {
        let p = [[0.5, 0.5, 0.5, 0.5], [0.49, 0.49, 0.49, 0.49]];
        let t = [[1.0; 4], [1.0; 4]];

        let hard = scores(Dice::Hard, p, t);
        let soft = scores(Dice::Soft, p, t);

        assert!((hard[0] - 1.0).abs() < 1e-5);
        assert_eq!(hard[1], 0.0);
        // 2 * 0.5 * 4 / (0.5 * 4 + 4)
        assert!((soft[0] - 2.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_loss_is_one_minus_mean_soft_dice() {
        let p = [[0.9, 0.2, 0.6, 0.1], [0.3, 0.8, 0.4, 0.7]];
        let t = [[1.0, 0.0, 1.0, 0.0], [0.0, 1.0, 1.0, 0.0]];

        let soft = scores(Dice::Soft, p, t);
        let mean = soft.iter().sum::<f32>() / soft.len() as f32;
        let loss: f32 = DiceLoss::new().forward(mask(p), mask(t)).into_scalar();

        assert!((loss - (1.0 - mean)).abs() < 1e-6);
    }
}
