use crate::data::{DataError, DatasetConfig, Preprocessor};
use crate::design;
use crate::estimate::{ClassFit, OneVsAllFit, TrainingConfig};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the format of the trained model when serialized to a TOML file.

/// The `(D + 1) x K` matrix of one-vs-all weights. Row 0 holds the bias of every
/// class; column `c` is the full weight vector of class `c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Array2<f64>", into = "Array2<f64>")]
pub struct WeightMatrix {
    coefficients: Array2<f64>,
}

impl WeightMatrix {
    /// A zero-filled matrix for `num_features` inputs and `num_classes` classes.
    pub fn zeros(num_features: usize, num_classes: usize) -> Self {
        Self {
            coefficients: Array2::zeros((num_features + 1, num_classes)),
        }
    }

    /// Wraps an existing `(D + 1) x K` coefficient matrix.
    pub fn from_coefficients(coefficients: Array2<f64>) -> Result<Self, ModelError> {
        if coefficients.nrows() == 0 || coefficients.ncols() == 0 {
            return Err(ModelError::EmptyWeightMatrix {
                rows: coefficients.nrows(),
                columns: coefficients.ncols(),
            });
        }
        Ok(Self { coefficients })
    }

    pub fn coefficients(&self) -> ArrayView2<'_, f64> {
        self.coefficients.view()
    }

    /// Feature dimensionality `D` (excluding the bias).
    pub fn num_features(&self) -> usize {
        self.coefficients.nrows() - 1
    }

    pub fn num_classes(&self) -> usize {
        self.coefficients.ncols()
    }

    /// The weight vector of one class, bias first.
    pub fn class_weights(&self, class_id: usize) -> ArrayView1<'_, f64> {
        self.coefficients.column(class_id)
    }

    pub(crate) fn set_class_weights(&mut self, class_id: usize, weights: ArrayView1<f64>) {
        self.coefficients.column_mut(class_id).assign(&weights);
    }

    /// Computes the `N x K` matrix of logits `X_aug · W`.
    pub fn scores(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        if data.ncols() != self.num_features() {
            return Err(ModelError::MismatchedFeatureCount {
                found: data.ncols(),
                expected: self.num_features(),
            });
        }
        Ok(design::affine_scores(data, self.coefficients.view()))
    }

    /// Predicts a class id for every row of `data`.
    ///
    /// The sigmoid is monotonic, so the class with the largest logit is also the
    /// class with the largest probability and no sigmoid is applied. Exact ties go to
    /// the lowest class id.
    pub fn predict(&self, data: ArrayView2<f64>) -> Result<Array1<usize>, ModelError> {
        Ok(argmax_rows(self.scores(data)?.view()))
    }
}

impl TryFrom<Array2<f64>> for WeightMatrix {
    type Error = ModelError;

    fn try_from(coefficients: Array2<f64>) -> Result<Self, Self::Error> {
        Self::from_coefficients(coefficients)
    }
}

impl From<WeightMatrix> for Array2<f64> {
    fn from(weights: WeightMatrix) -> Self {
        weights.coefficients
    }
}

/// Index of the largest entry in each row; the first (lowest) index wins ties.
/// NaN scores never win against a number.
pub fn argmax_rows(scores: ArrayView2<f64>) -> Array1<usize> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (class_id, &score) in row.iter().enumerate().skip(1) {
                if score > row[best] || (row[best].is_nan() && !score.is_nan()) {
                    best = class_id;
                }
            }
            best
        })
        .collect()
}

/// Applies a `(D + 1) x K` weight matrix to an `N x D` feature matrix.
pub fn predict(
    weights: ArrayView2<f64>,
    data: ArrayView2<f64>,
) -> Result<Array1<usize>, ModelError> {
    if weights.nrows() != data.ncols() + 1 {
        return Err(ModelError::MismatchedFeatureCount {
            found: data.ncols(),
            expected: weights.nrows().saturating_sub(1),
        });
    }
    if weights.ncols() == 0 {
        return Err(ModelError::EmptyWeightMatrix {
            rows: weights.nrows(),
            columns: 0,
        });
    }
    Ok(argmax_rows(design::affine_scores(data, weights).view()))
}

/// The top-level, self-contained, trained model artifact.
/// This is the structure that gets saved to and loaded from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub config: TrainingConfig,
    /// Column selection and scaling that turns raw pixel rows into model features.
    /// Absent when the model was trained on already-prepared matrices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessor: Option<Preprocessor>,
    /// How the training directory was split, so evaluation can rebuild the same splits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetConfig>,
    pub weights: WeightMatrix,
    pub fits: Vec<ClassFit>,
}

/// Custom error type for model loading, saving, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("A weight matrix needs a bias row and at least one class column (got {rows} x {columns}).")]
    EmptyWeightMatrix { rows: usize, columns: usize },
    #[error("This model has no stored preprocessor, so it cannot be applied to raw pixel data.")]
    MissingPreprocessor,
    #[error("Raw input could not be preprocessed: {0}")]
    Preprocessing(#[from] DataError),
    #[error("Model file is internally inconsistent: {0}")]
    InconsistentModel(String),
}

impl TrainedModel {
    pub fn new(config: TrainingConfig, fit: OneVsAllFit, preprocessor: Option<Preprocessor>) -> Self {
        Self {
            config,
            preprocessor,
            dataset: None,
            weights: fit.weights,
            fits: fit.fits,
        }
    }

    /// Records the dataset settings the model was trained under.
    pub fn with_dataset_config(mut self, dataset: DatasetConfig) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Predicts classes for rows that are already in model feature space.
    pub fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<usize>, ModelError> {
        self.weights.predict(features)
    }

    /// Preprocesses raw pixel rows with the stored preprocessor, then predicts.
    pub fn predict_raw(&self, raw: ArrayView2<f64>) -> Result<Array1<usize>, ModelError> {
        let preprocessor = self
            .preprocessor
            .as_ref()
            .ok_or(ModelError::MissingPreprocessor)?;
        let features = preprocessor.transform(raw)?;
        self.predict(features.view())
    }

    /// Saves the trained model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained model from a TOML file and checks that its parts agree.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.weights.num_classes() != self.config.num_classes {
            return Err(ModelError::InconsistentModel(format!(
                "weight matrix has {} class columns but the configuration declares {} classes",
                self.weights.num_classes(),
                self.config.num_classes
            )));
        }
        if self.fits.len() != self.config.num_classes {
            return Err(ModelError::InconsistentModel(format!(
                "{} per-class fit records for {} classes",
                self.fits.len(),
                self.config.num_classes
            )));
        }
        if let Some(preprocessor) = &self.preprocessor {
            preprocessor.validate().map_err(|e| {
                ModelError::InconsistentModel(format!("stored preprocessor is invalid: {e}"))
            })?;
            if preprocessor.num_features() != self.weights.num_features() {
                return Err(ModelError::InconsistentModel(format!(
                    "preprocessor emits {} features but the weight matrix expects {}",
                    preprocessor.num_features(),
                    self.weights.num_features()
                )));
            }
        }
        if let Some(dataset) = &self.dataset {
            if dataset.num_classes != self.config.num_classes {
                return Err(ModelError::InconsistentModel(format!(
                    "dataset settings declare {} classes but the configuration declares {}",
                    dataset.num_classes, self.config.num_classes
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::{FitStatus, OptimizerKind};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn fit_record(class_id: usize) -> ClassFit {
        ClassFit {
            class_id,
            positives: 3,
            status: FitStatus::BudgetExhausted,
            iterations: 50,
            evaluations: 113,
            final_loss: 0.125,
            gradient_norm: 3.5e-3,
        }
    }

    fn small_model() -> TrainedModel {
        let coefficients = array![
            [0.1, -0.2, 0.30000000000000004],
            [1.5, -2.25, 1e-17],
            [-0.0, 4.0, -7.123456789012345]
        ];
        TrainedModel {
            config: TrainingConfig {
                num_classes: 3,
                optimizer: OptimizerKind::Bfgs,
                max_iterations: 50,
                gradient_tolerance: 1e-5,
                parallel: false,
            },
            preprocessor: Some(Preprocessor {
                raw_width: 4,
                kept_columns: vec![0, 3],
                intensity_scale: 255.0,
            }),
            dataset: Some(DatasetConfig {
                num_classes: 3,
                validation_per_class: 7,
                ..DatasetConfig::default()
            }),
            weights: WeightMatrix::from_coefficients(coefficients).unwrap(),
            fits: (0..3).map(fit_record).collect(),
        }
    }

    #[test]
    fn tie_goes_to_lowest_class() {
        // Classes 0 and 1 produce identical scores on every row.
        let weights = array![[0.5, 0.5, -1.0], [1.0, 1.0, 0.0], [2.0, 2.0, 0.0]];
        let data = array![[0.3, 0.7], [0.0, 0.0], [1.0, 1.0]];
        for _ in 0..3 {
            let predicted = predict(weights.view(), data.view()).unwrap();
            assert_eq!(predicted, array![0, 0, 0]);
        }

        // Same check with the tie sitting on higher class ids.
        let weights = array![[0.0, 1.0, 1.0], [0.0, 0.0, 0.0]];
        let data = array![[0.5]];
        assert_eq!(predict(weights.view(), data.view()).unwrap(), array![1]);
    }

    #[test]
    fn argmax_ignores_nan_scores() {
        let scores = array![
            [f64::NAN, -1.0, -2.0],
            [0.0, f64::NAN, 1.0],
            [f64::NAN, f64::NAN, f64::NAN]
        ];
        assert_eq!(argmax_rows(scores.view()), array![1, 2, 0]);
    }

    #[test]
    fn predictions_are_always_valid_class_ids() {
        let mut rng = StdRng::seed_from_u64(7);
        for num_classes in [1_usize, 2, 10] {
            let weights = Array2::from_shape_fn((6, num_classes), |_| rng.gen_range(-50.0..50.0));
            let data = Array2::from_shape_fn((40, 5), |_| rng.gen_range(-3.0..3.0));
            let predicted = predict(weights.view(), data.view()).unwrap();
            assert_eq!(predicted.len(), 40);
            assert!(predicted.iter().all(|&c| c < num_classes));
        }
    }

    #[test]
    fn prediction_is_idempotent() {
        let model = small_model();
        let data = array![[0.2, 0.9], [0.8, 0.1], [0.0, 0.0]];
        let first = model.predict(data.view()).unwrap();
        let second = model.predict(data.view()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn feature_count_mismatch_is_rejected() {
        let model = small_model();
        let wrong = array![[0.2, 0.9, 0.4]];
        assert!(matches!(
            model.predict(wrong.view()),
            Err(ModelError::MismatchedFeatureCount {
                found: 3,
                expected: 2
            })
        ));
        assert!(matches!(
            predict(model.weights.coefficients(), wrong.view()),
            Err(ModelError::MismatchedFeatureCount { .. })
        ));
    }

    #[test]
    fn empty_weight_matrix_is_rejected() {
        assert!(matches!(
            WeightMatrix::from_coefficients(Array2::zeros((3, 0))),
            Err(ModelError::EmptyWeightMatrix { rows: 3, columns: 0 })
        ));
        assert!(WeightMatrix::from_coefficients(Array2::zeros((0, 2))).is_err());
    }

    #[test]
    fn weight_matrix_accessors() {
        let mut weights = WeightMatrix::zeros(2, 3);
        assert_eq!(weights.num_features(), 2);
        assert_eq!(weights.num_classes(), 3);
        weights.set_class_weights(1, array![0.5, -1.0, 2.0].view());
        assert_eq!(weights.class_weights(1), array![0.5, -1.0, 2.0]);
        assert_eq!(weights.class_weights(0), array![0.0, 0.0, 0.0]);

        let scores = weights.scores(array![[1.0, 1.0]].view()).unwrap();
        assert_eq!(scores, array![[0.0, 1.5, 0.0]]);
    }

    #[test]
    fn raw_prediction_uses_stored_preprocessor() {
        let model = small_model();
        let raw = array![[51.0, 200.0, 7.0, 255.0]];
        let direct = model.predict(array![[0.2, 1.0]].view()).unwrap();
        assert_eq!(model.predict_raw(raw.view()).unwrap(), direct);

        let mut bare = model.clone();
        bare.preprocessor = None;
        assert!(matches!(
            bare.predict_raw(raw.view()),
            Err(ModelError::MissingPreprocessor)
        ));
    }

    #[test]
    fn save_and_load_round_trip_exactly() {
        let model = small_model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        model.save(&path).unwrap();
        let loaded = TrainedModel::load(&path).unwrap();
        assert_eq!(loaded, model);
        assert_eq!(loaded.weights.coefficients().dim(), (3, 3));
        for (a, b) in loaded
            .weights
            .coefficients()
            .iter()
            .zip(model.weights.coefficients().iter())
        {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn inconsistent_model_file_is_rejected() {
        let mut model = small_model();
        model.fits.pop();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        model.save(&path).unwrap();
        assert!(matches!(
            TrainedModel::load(&path),
            Err(ModelError::InconsistentModel(_))
        ));
    }

    fn saved_then_loaded(model: &TrainedModel) -> Result<TrainedModel, ModelError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        model.save(&path).unwrap();
        TrainedModel::load(&path)
    }

    #[test]
    fn stored_preprocessor_must_select_existing_columns() {
        let mut model = small_model();
        // Two kept columns still match the two feature rows of the weights.
        model.preprocessor = Some(Preprocessor {
            raw_width: 3,
            kept_columns: vec![0, 7],
            intensity_scale: 255.0,
        });
        assert!(matches!(
            saved_then_loaded(&model),
            Err(ModelError::InconsistentModel(_))
        ));

        let raw = array![[10.0, 20.0, 30.0]];
        assert!(matches!(
            model.predict_raw(raw.view()),
            Err(ModelError::Preprocessing(DataError::ColumnOutOfRange { column: 7, .. }))
        ));
    }

    #[test]
    fn stored_preprocessor_needs_ordered_columns_and_positive_scale() {
        let mut model = small_model();
        for (kept_columns, intensity_scale) in [
            (vec![3, 0], 255.0),
            (vec![1, 1], 255.0),
            (vec![0, 3], 0.0),
            (vec![0, 3], -1.0),
            (vec![0, 3], f64::NAN),
        ] {
            model.preprocessor = Some(Preprocessor {
                raw_width: 4,
                kept_columns: kept_columns.clone(),
                intensity_scale,
            });
            assert!(
                matches!(saved_then_loaded(&model), Err(ModelError::InconsistentModel(_))),
                "accepted columns {kept_columns:?} with scale {intensity_scale}"
            );
        }
    }

    #[test]
    fn dataset_settings_survive_a_round_trip() {
        let model = small_model();
        let loaded = saved_then_loaded(&model).unwrap();
        let dataset = loaded.dataset.unwrap();
        assert_eq!(dataset.validation_per_class, 7);
        assert_eq!(dataset.num_classes, 3);

        let mut mismatched = small_model();
        if let Some(dataset) = mismatched.dataset.as_mut() {
            dataset.num_classes = 5;
        }
        assert!(matches!(
            saved_then_loaded(&mismatched),
            Err(ModelError::InconsistentModel(_))
        ));
    }
}
