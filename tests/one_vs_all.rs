use digitfit::estimate::{TrainingConfig, train_one_vs_all};
use digitfit::evaluate::accuracy;
use digitfit::model::{TrainedModel, predict};
use digitfit::optimize::OptimizerKind;
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn config(num_classes: usize, optimizer: OptimizerKind) -> TrainingConfig {
    TrainingConfig {
        num_classes,
        optimizer,
        ..TrainingConfig::default()
    }
}

/// Isotropic Gaussian clusters around well separated centres in the unit square.
fn gaussian_blobs(per_class: usize, seed: u64) -> (Array2<f64>, Array1<usize>) {
    let centres = [[0.2, 0.2], [0.8, 0.2], [0.5, 0.85]];
    let noise = Normal::new(0.0, 0.06).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);

    let rows = centres.len() * per_class;
    let mut data = Array2::zeros((rows, 2));
    let mut labels = Array1::zeros(rows);
    for (class_id, centre) in centres.iter().enumerate() {
        for i in 0..per_class {
            let row = class_id * per_class + i;
            data[[row, 0]] = centre[0] + noise.sample(&mut rng);
            data[[row, 1]] = centre[1] + noise.sample(&mut rng);
            labels[row] = class_id;
        }
    }
    (data, labels)
}

#[test]
fn unit_square_corners_split_on_first_feature() {
    let data = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
    let labels = array![0, 0, 1, 1];

    let fit = train_one_vs_all(data.view(), labels.view(), &config(2, OptimizerKind::ConjugateGradient))
        .unwrap();
    assert_eq!(fit.weights.coefficients().dim(), (3, 2));

    let queries = array![[0.0, 0.2], [1.0, 0.8]];
    let predicted = predict(fit.weights.coefficients(), queries.view()).unwrap();
    assert_eq!(predicted, array![0, 1]);
}

#[test]
fn separable_classes_are_fit_perfectly() {
    let mut rng = StdRng::seed_from_u64(7);
    let rows = 60;
    let mut data = Array2::zeros((rows, 3));
    let mut labels = Array1::zeros(rows);
    for row in 0..rows {
        let class_id = row % 2;
        let offset = if class_id == 0 { -0.5 } else { 0.1 };
        for column in 0..3 {
            data[[row, column]] = offset + rng.gen_range(0.0..0.4);
        }
        labels[row] = class_id;
    }

    for optimizer in [OptimizerKind::ConjugateGradient, OptimizerKind::Bfgs] {
        let fit = train_one_vs_all(data.view(), labels.view(), &config(2, optimizer)).unwrap();
        let predicted = fit.weights.predict(data.view()).unwrap();
        let train_accuracy = accuracy(predicted.view(), labels.view()).unwrap();
        assert!(
            train_accuracy == 100.0,
            "{optimizer:?} reached only {train_accuracy}% on separable data"
        );
    }
}

#[test]
fn gaussian_blobs_generalize_to_held_out_points() {
    let (train_data, train_labels) = gaussian_blobs(80, 11);
    let (test_data, test_labels) = gaussian_blobs(40, 12);

    let fit = train_one_vs_all(
        train_data.view(),
        train_labels.view(),
        &config(3, OptimizerKind::ConjugateGradient),
    )
    .unwrap();
    assert_eq!(fit.fits.len(), 3);
    for (class_id, class_fit) in fit.fits.iter().enumerate() {
        assert_eq!(class_fit.class_id, class_id);
        assert_eq!(class_fit.positives, 80);
        assert!(class_fit.final_loss.is_finite());
        assert!(class_fit.iterations <= 50);
    }

    let predicted = fit.weights.predict(test_data.view()).unwrap();
    let test_accuracy = accuracy(predicted.view(), test_labels.view()).unwrap();
    assert!(test_accuracy >= 95.0, "held-out accuracy was {test_accuracy}%");
}

#[test]
fn saved_model_predicts_identically_after_reload() {
    let (data, labels) = gaussian_blobs(30, 3);
    let training_config = config(3, OptimizerKind::ConjugateGradient);
    let fit = train_one_vs_all(data.view(), labels.view(), &training_config).unwrap();
    let model = TrainedModel::new(training_config, fit, None);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.toml");
    model.save(&path).unwrap();
    let reloaded = TrainedModel::load(&path).unwrap();

    assert_eq!(reloaded, model);
    assert_eq!(
        reloaded.predict(data.view()).unwrap(),
        model.predict(data.view()).unwrap()
    );
}

#[test]
fn absent_class_never_wins() {
    let (data, labels) = gaussian_blobs(20, 9);
    // Declare a fourth class that has no training rows.
    let fit = train_one_vs_all(data.view(), labels.view(), &config(4, OptimizerKind::ConjugateGradient))
        .unwrap();
    assert!(fit.fits[3].is_degenerate());
    assert!(fit.weights.class_weights(3)[0] < 0.0);

    let predicted = fit.weights.predict(data.view()).unwrap();
    assert!(predicted.iter().all(|&c| c < 3));
}
