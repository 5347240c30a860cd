//! Adamax optimizer and the shared learning-rate handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use burn::{
    LearningRate,
    config::Config,
    module::AutodiffModule,
    optim::{SimpleOptimizer, adaptor::OptimizerAdaptor},
    record::Record,
    tensor::{
        Tensor,
        backend::{AutodiffBackend, Backend},
    },
};

/// Adamax configuration.
#[derive(Config, Debug)]
pub struct AdamaxConfig {
    /// Decay of the first moment.
    #[config(default = 0.9)]
    beta_1: f32,
    /// Decay of the infinity norm.
    #[config(default = 0.999)]
    beta_2: f32,
    /// Added to the norm before dividing.
    #[config(default = 1e-8)]
    epsilon: f32,
}

impl AdamaxConfig {
    /// Initializes an Adamax optimizer for module `M`.
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self) -> OptimizerAdaptor<Adamax, M, B> {
        OptimizerAdaptor::from(Adamax {
            beta_1: self.beta_1,
            beta_2: self.beta_2,
            epsilon: self.epsilon,
        })
    }
}

/// Adamax: Adam with the second moment replaced by an exponentially
/// weighted infinity norm of past gradients.
///
/// ```text
/// m_t = beta_1 * m_{t-1} + (1 - beta_1) * g
/// u_t = max(beta_2 * u_{t-1}, |g|)
/// x_t = x_{t-1} - lr / (1 - beta_1^t) * m_t / (u_t + epsilon)
/// ```
#[derive(Clone, Debug)]
pub struct Adamax {
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
}

/// Per-parameter Adamax state.
#[derive(Record, Clone)]
pub struct AdamaxState<B: Backend, const D: usize> {
    /// Number of updates applied so far.
    pub time: usize,
    /// First moment.
    pub moment: Tensor<B, D>,
    /// Exponentially weighted infinity norm.
    pub norm: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Adamax {
    type State<const D: usize> = AdamaxState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (time, moment, norm) = match state {
            Some(state) => (
                state.time + 1,
                scale(state.moment, self.beta_1 as f64)
                    + scale(grad.clone(), 1.0 - self.beta_1 as f64),
                scale(state.norm, self.beta_2 as f64).max_pair(grad.abs()),
            ),
            None => (1, scale(grad.clone(), 1.0 - self.beta_1 as f64), grad.abs()),
        };

        let step_size = lr / (1.0 - (self.beta_1 as f64).powi(time as i32));
        let epsilon = Tensor::full(norm.shape(), self.epsilon, &norm.device());
        let delta = scale(moment.clone() / (norm.clone() + epsilon), step_size);

        (tensor - delta, Some(AdamaxState { time, moment, norm }))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.moment = state.moment.to_device(device);
        state.norm = state.norm.to_device(device);
        state
    }
}

/// Multiplies by a constant through an elementwise product.
///
/// Gradients may arrive with non-contiguous strides, and scalar ops are not
/// layout-safe on every backend; tensor-tensor ops are.
fn scale<B: Backend, const D: usize>(tensor: Tensor<B, D>, factor: f64) -> Tensor<B, D> {
    let factor = Tensor::full(tensor.shape(), factor, &tensor.device());
    tensor * factor
}

/// Learning rate shared between a model and the code driving its training.
///
/// Clones refer to the same value, so a training driver can decay the rate
/// between steps while the model reads it on every update.
#[derive(Debug, Clone)]
pub struct SharedLearningRate(Arc<AtomicU64>);

impl SharedLearningRate {
    pub fn new(lr: LearningRate) -> Self {
        Self(Arc::new(AtomicU64::new(lr.to_bits())))
    }

    pub fn get(&self) -> LearningRate {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, lr: LearningRate) {
        self.0.store(lr.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn adamax() -> Adamax {
        Adamax {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
        }
    }

    fn values(tensor: Tensor<TestBackend, 1>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = AdamaxConfig::new();
        assert!((config.beta_1 - 0.9).abs() < 1e-7);
        assert!((config.beta_2 - 0.999).abs() < 1e-7);
        assert!((config.epsilon - 1e-8).abs() < 1e-12);
    }

    #[test]
    fn test_first_step_moves_by_lr_times_sign() {
        let device = <TestBackend as Backend>::Device::default();
        let params = Tensor::<TestBackend, 1>::from_floats([1.0, 1.0, 1.0], &device);
        let grad = Tensor::<TestBackend, 1>::from_floats([0.5, -2.0, 0.0], &device);

        let (updated, state) = SimpleOptimizer::<TestBackend>::step(&adamax(), 0.01, params, grad, None);

        let updated = values(updated);
        assert!((updated[0] - 0.99).abs() < 1e-6);
        assert!((updated[1] - 1.01).abs() < 1e-6);
        assert_eq!(updated[2], 1.0);
        assert_eq!(state.map(|s| s.time), Some(1));
    }

    #[test]
    fn test_second_step_uses_decayed_norm() {
        let device = <TestBackend as Backend>::Device::default();
        let optim = adamax();
        let params = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        let first = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        let second = Tensor::<TestBackend, 1>::from_floats([0.5], &device);

        let (params, state) = SimpleOptimizer::<TestBackend>::step(&optim, 0.01, params, first, None);
        let (params, state) = SimpleOptimizer::<TestBackend>::step(&optim, 0.01, params, second, state);

        // m = 0.14, u = max(0.999, 0.5), step = 0.01 / 0.19
        let expected = 0.99 - 0.01 / 0.19 * 0.14 / 0.999;
        assert!((values(params)[0] - expected as f32).abs() < 1e-5);
        let state = state.unwrap();
        assert_eq!(state.time, 2);
        assert!((values(state.norm)[0] - 0.999).abs() < 1e-6);
    }

    #[test]
    fn test_strided_gradient_matches_contiguous() {
        let device = <TestBackend as Backend>::Device::default();
        let optim = adamax();
        let lr = 0.01;
        let grads = [
            [[0.3, -1.5], [2.0, 0.01], [-0.2, 0.7]],
            [[-0.6, 0.4], [1.0, -3.0], [0.05, -0.9]],
        ];

        let mut strided = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let mut contiguous = strided.clone();
        let mut strided_state = None;
        let mut contiguous_state = None;

        for (t, grad) in grads.iter().enumerate() {
            // (3, 2) data viewed as (2, 3): non-contiguous strides
            let strided_grad = Tensor::<TestBackend, 2>::from_floats(*grad, &device).swap_dims(0, 1);
            let transposed: Vec<f32> = strided_grad.to_data().to_vec().unwrap();
            let contiguous_grad =
                Tensor::<TestBackend, 1>::from_floats(transposed.as_slice(), &device).reshape([2, 3]);

            let before = values(strided.clone().reshape([6]));
            let (next, state) =
                SimpleOptimizer::<TestBackend>::step(&optim, lr, strided, strided_grad, strided_state);
            strided = next;
            strided_state = state;
            let (next, state) = SimpleOptimizer::<TestBackend>::step(
                &optim,
                lr,
                contiguous,
                contiguous_grad,
                contiguous_state,
            );
            contiguous = next;
            contiguous_state = state;

            let after = values(strided.clone().reshape([6]));
            let bound = (lr / (1.0 - 0.9f64.powi(t as i32 + 1))) as f32 + 1e-6;
            for (b, a) in before.iter().zip(&after) {
                assert!((a - b).abs() <= bound, "step {t} moved {} > {bound}", (a - b).abs());
            }
            assert_eq!(after, values(contiguous.clone().reshape([6])));
        }
    }

    #[test]
    fn test_shared_learning_rate() {
        let lr = SharedLearningRate::new(0.002);
        let handle = lr.clone();

        handle.set(0.0005);

        assert_eq!(lr.get(), 0.0005);
    }
}
