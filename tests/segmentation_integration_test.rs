//! Integration tests driving a SegmentationModel the way a training loop
//! does: build from hyperparameters, train, evaluate, and exchange weights
//! through archives.

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Distribution, Int, Tensor, backend::Backend};
use tractseg_unet::training::ModelType;
use tractseg_unet::weights::{NpyArray, read_archive, write_archive};
use tractseg_unet::{HyperParameters, ModelError, SegmentationModel};

type TrainingBackend = Autodiff<NdArray>;

const TOLERANCE: f32 = 1e-6;

fn hyperparameters() -> HyperParameters {
    HyperParameters::new()
        .resolution("2mm")
        .num_classes(2)
        .unet_nr_filt(4)
        .seed(7)
}

fn input(batch: usize) -> Tensor<TrainingBackend, 4> {
    let device = <TrainingBackend as Backend>::Device::default();
    Tensor::random([batch, 9, 80, 80], Distribution::Uniform(0.0, 1.0), &device)
}

fn labels(batch: usize) -> Tensor<TrainingBackend, 4, Int> {
    let device = <TrainingBackend as Backend>::Device::default();
    // left half of every slice belongs to both classes
    let row: Vec<i64> = (0..80).map(|x| i64::from(x < 40)).collect();
    let values: Vec<i64> = (0..batch * 2 * 80).flat_map(|_| row.iter().copied()).collect();
    Tensor::<TrainingBackend, 1, Int>::from_ints(values.as_slice(), &device).reshape([batch, 2, 80, 80])
}

fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec().unwrap()
}

#[test]
fn test_probabilities_shape_and_range() {
    let device = <TrainingBackend as Backend>::Device::default();
    let model = SegmentationModel::<TrainingBackend>::new(&hyperparameters(), &device).unwrap();

    let probabilities = model.probabilities(input(2)).unwrap();

    assert_eq!(probabilities.dims(), [2, 80, 80, 2]);
    assert!(values(probabilities).iter().all(|p| (0.0..=1.0).contains(p)));
}

#[test]
fn test_same_seed_same_outputs() {
    let device = <TrainingBackend as Backend>::Device::default();
    let a = SegmentationModel::<TrainingBackend>::new(&hyperparameters(), &device).unwrap();
    let b = SegmentationModel::<TrainingBackend>::new(&hyperparameters(), &device).unwrap();
    let c = SegmentationModel::<TrainingBackend>::new(&hyperparameters().seed(8), &device).unwrap();
    let x = input(1);

    let pa = values(a.probabilities(x.clone()).unwrap());
    let pb = values(b.probabilities(x.clone()).unwrap());
    let pc = values(c.probabilities(x).unwrap());

    assert_eq!(pa, pb);
    assert_ne!(pa, pc);
}

#[test]
fn test_training_reduces_loss() {
    let device = <TrainingBackend as Backend>::Device::default();
    let mut model = SegmentationModel::<TrainingBackend>::new(
        &hyperparameters().learning_rate(0.01),
        &device,
    )
    .unwrap();
    let x = input(2);
    let y = labels(2);

    let initial = model.predict(x.clone(), y.clone()).unwrap().loss;
    for _ in 0..10 {
        let step = model.train_step(x.clone(), y.clone()).unwrap();
        assert_eq!(step.prediction.dims(), [2 * 80 * 80, 2]);
        assert!((0.0..=1.0).contains(&step.mean_dice));
    }
    let trained = model.predict(x, y).unwrap().loss;

    assert!(
        trained < initial,
        "Loss should decrease: initial={initial}, trained={trained}"
    );
}

#[test]
fn test_dropout_applies_in_training_even_when_flag_is_off() {
    let device = <TrainingBackend as Backend>::Device::default();
    let mut model = SegmentationModel::<TrainingBackend>::new(
        &hyperparameters().use_dropout(false),
        &device,
    )
    .unwrap();
    let x = input(1);
    let y = labels(1);

    let first = values(model.predict(x.clone(), y.clone()).unwrap().prediction);
    let second = values(model.predict(x.clone(), y.clone()).unwrap().prediction);
    // prediction of a train step comes from the weights before the update
    let trained = values(model.train_step(x, y).unwrap().prediction);

    assert_eq!(first, second);
    assert_ne!(first, trained);
}

#[test]
fn test_predict_loss_matches_probabilities() {
    let device = <TrainingBackend as Backend>::Device::default();
    let model = SegmentationModel::<TrainingBackend>::new(&hyperparameters(), &device).unwrap();
    let x = input(1);
    let y = labels(1);

    let step = model.predict(x.clone(), y.clone()).unwrap();
    let probabilities = values(model.probabilities(x).unwrap());
    let targets = values(y.float());

    // probabilities are (h, w, class), targets (class, h, w)
    let mut dice_sum = 0.0;
    for class in 0..2 {
        let (mut overlap, mut p_sum, mut t_sum) = (0.0f32, 0.0f32, 0.0f32);
        for pixel in 0..80 * 80 {
            let p = probabilities[pixel * 2 + class];
            let t = targets[class * 80 * 80 + pixel];
            overlap += p * t;
            p_sum += p;
            t_sum += t;
        }
        dice_sum += 2.0 * overlap / (p_sum + t_sum + 1e-6);
    }

    assert!((step.loss - (1.0 - dice_sum / 2.0)).abs() < 1e-4);
    assert_eq!(values(step.prediction), probabilities);
}

#[test]
fn test_save_then_load_reproduces_outputs() {
    let device = <TrainingBackend as Backend>::Device::default();
    let dir = tempfile::tempdir().unwrap();
    let mut trained =
        SegmentationModel::<TrainingBackend>::new(&hyperparameters(), &device).unwrap();
    trained.train_step(input(1), labels(1)).unwrap();
    trained
        .save_weights(dir.path().join("weights.npz"))
        .unwrap();

    let restored = SegmentationModel::<TrainingBackend>::new(
        &hyperparameters()
            .seed(99)
            .load_weights(dir.path(), "weights.npz"),
        &device,
    )
    .unwrap();

    let x = input(1);
    let expected = values(trained.probabilities(x.clone()).unwrap());
    let actual = values(restored.probabilities(x).unwrap());
    assert!(
        expected
            .iter()
            .zip(&actual)
            .all(|(a, b)| (a - b).abs() < TOLERANCE)
    );
}

#[test]
fn test_archive_with_wrong_count_is_rejected() {
    let device = <TrainingBackend as Backend>::Device::default();
    let dir = tempfile::tempdir().unwrap();
    let model = SegmentationModel::<TrainingBackend>::new(&hyperparameters(), &device).unwrap();
    let path = dir.path().join("weights.npz");
    model.save_weights(&path).unwrap();

    let mut arrays = read_archive(&path).unwrap();
    assert_eq!(arrays.len(), 38);
    arrays.pop();
    write_archive(&path, &arrays).unwrap();

    let result = SegmentationModel::<TrainingBackend>::new(
        &hyperparameters().load_weights(dir.path(), "weights.npz"),
        &device,
    );

    assert!(matches!(
        result,
        Err(ModelError::WeightCountMismatch {
            expected: 38,
            actual: 37
        })
    ));
}

#[test]
fn test_failed_load_leaves_model_unchanged() {
    let device = <TrainingBackend as Backend>::Device::default();
    let dir = tempfile::tempdir().unwrap();
    let mut model =
        SegmentationModel::<TrainingBackend>::new(&hyperparameters(), &device).unwrap();
    let path = dir.path().join("weights.npz");
    model.save_weights(&path).unwrap();

    let mut arrays = read_archive(&path).unwrap();
    for array in arrays.iter_mut().take(10) {
        *array = NpyArray::new(array.shape().to_vec(), vec![0.0; array.data().len()]).unwrap();
    }
    arrays[37] = NpyArray::new(vec![3], vec![0.0; 3]).unwrap();
    write_archive(&path, &arrays).unwrap();

    let x = input(1);
    let before = values(model.probabilities(x.clone()).unwrap());
    let result = model.load_weights(&path);
    let after = values(model.probabilities(x).unwrap());

    assert!(matches!(
        result,
        Err(ModelError::WeightShapeMismatch { index: 37, .. })
    ));
    assert_eq!(before, after);
}

#[test]
fn test_combined_peaks_input_channels() {
    let device = <TrainingBackend as Backend>::Device::default();
    let model = SegmentationModel::<TrainingBackend>::new(
        &hyperparameters().model_type(ModelType::Combined),
        &device,
    )
    .unwrap();

    assert_eq!(
        model.layer_graph().shape("input").unwrap(),
        &[None, Some(6), Some(80), Some(80)]
    );
    assert!(matches!(
        model.probabilities(input(1)),
        Err(ModelError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_unsupported_resolution() {
    let device = <TrainingBackend as Backend>::Device::default();

    let result = SegmentationModel::<TrainingBackend>::new(
        &hyperparameters().resolution("3mm"),
        &device,
    );

    assert!(matches!(result, Err(ModelError::UnsupportedResolution(_))));
}
