//! # Feature Store
//!
//! This module is the exclusive entry point for user-provided image data. It reads
//! class-partitioned blocks of raw pixel rows, splits them into training,
//! validation and test sets, and fits the [`Preprocessor`] that turns raw rows into
//! the `[0, 1]` feature matrices the trainer consumes.
//!
//! - Fixed layout: a dataset directory holds `train{c}.csv` and `test{c}.csv` for
//!   every class `c` in `[0, K)`. Each line is one sample, comma separated, no
//!   header, raw intensities in `0..=255`.
//! - Validation split: the first `validation_per_class` rows of every training
//!   block are held out for validation; the remainder is the training split.
//! - Pruning: columns whose training-set standard deviation does not exceed the
//!   variance threshold carry no signal and are dropped from all three splits.
//! - Scaling: surviving columns are divided by the intensity scale.
//! - User-centric errors: failures are assumed to be input errors, and the
//!   [`DataError`] messages name the offending file, row and column.

use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Settings for turning a dataset directory into model-ready splits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub num_classes: usize,
    /// Rows taken from the head of each training block for validation.
    pub validation_per_class: usize,
    /// Columns with a training standard deviation at or below this are dropped.
    pub variance_threshold: f64,
    /// Divisor mapping raw intensities onto `[0, 1]`.
    pub intensity_scale: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            validation_per_class: 1000,
            variance_threshold: 0.001,
            intensity_scale: 255.0,
        }
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error from the underlying CSV reader: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("The required data file '{}' was not found.", .0.display())]
    MissingBlock(PathBuf),
    #[error("The data file '{}' contains no rows.", .0.display())]
    EmptyBlock(PathBuf),
    #[error(
        "Value '{value}' at row {row}, column {column} of '{}' is not a number.",
        path.display()
    )]
    NonNumericValue {
        path: PathBuf,
        row: usize,
        column: usize,
        value: String,
    },
    #[error(
        "Non-finite value at row {row}, column {column} of '{}'. All pixel values must be finite.",
        path.display()
    )]
    NonFiniteValue {
        path: PathBuf,
        row: usize,
        column: usize,
    },
    #[error(
        "Row {row} of '{}' has {found} values, but {expected} were expected.",
        path.display()
    )]
    InconsistentWidth {
        path: PathBuf,
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error(
        "Class {class_id} has only {found} training rows, but {required} are needed to hold out a validation split and still train."
    )]
    InsufficientSamples {
        class_id: usize,
        found: usize,
        required: usize,
    },
    #[error("Expected {expected} class blocks but {found} were supplied.")]
    ClassCountMismatch { found: usize, expected: usize },
    #[error("Input rows have {found} raw values, but the preprocessor was fitted on {expected}.")]
    RawWidthMismatch { found: usize, expected: usize },
    #[error("The intensity scale must be a positive finite number (got {0}).")]
    InvalidScale(f64),
    #[error("Kept column {column} does not exist in rows of {raw_width} raw values.")]
    ColumnOutOfRange { column: usize, raw_width: usize },
    #[error("Kept columns must be strictly ascending, but entry {position} is not.")]
    UnorderedColumns { position: usize },
    #[error("Cannot fit a preprocessor on an empty training matrix.")]
    EmptyTrainingMatrix,
}

/// A feature matrix with its parallel label vector.
#[derive(Debug, Clone)]
pub struct LabeledSplit {
    /// Shape: `[n_samples, n_features]`.
    pub features: Array2<f64>,
    /// One class id per row of `features`.
    pub labels: Array1<usize>,
}

impl LabeledSplit {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }
}

/// The three disjoint splits plus the preprocessing fitted on the training split.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: LabeledSplit,
    pub validation: LabeledSplit,
    pub test: LabeledSplit,
    pub preprocessor: Preprocessor,
}

/// Column selection and scaling learned from raw training rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    /// Number of raw values per input row.
    pub raw_width: usize,
    /// Indices of the raw columns kept as features, in ascending order.
    pub kept_columns: Vec<usize>,
    pub intensity_scale: f64,
}

impl Preprocessor {
    /// Keeps the columns of `raw_train` whose population standard deviation exceeds
    /// `variance_threshold`.
    pub fn fit(
        raw_train: ArrayView2<f64>,
        variance_threshold: f64,
        intensity_scale: f64,
    ) -> Result<Self, DataError> {
        if !(intensity_scale.is_finite() && intensity_scale > 0.0) {
            return Err(DataError::InvalidScale(intensity_scale));
        }
        if raw_train.nrows() == 0 {
            return Err(DataError::EmptyTrainingMatrix);
        }
        let std_dev = raw_train.std_axis(Axis(0), 0.0);
        let kept_columns: Vec<usize> = std_dev
            .iter()
            .enumerate()
            .filter(|&(_, &sigma)| sigma > variance_threshold)
            .map(|(column, _)| column)
            .collect();

        log::info!(
            "Keeping {} of {} raw columns (std > {variance_threshold}).",
            kept_columns.len(),
            raw_train.ncols()
        );

        Ok(Self {
            raw_width: raw_train.ncols(),
            kept_columns,
            intensity_scale,
        })
    }

    /// Feature dimensionality `D` produced by [`transform`](Self::transform).
    pub fn num_features(&self) -> usize {
        self.kept_columns.len()
    }

    /// Checks a preprocessor that did not come from [`fit`](Self::fit), such as
    /// one read back from a model file.
    pub fn validate(&self) -> Result<(), DataError> {
        if !(self.intensity_scale.is_finite() && self.intensity_scale > 0.0) {
            return Err(DataError::InvalidScale(self.intensity_scale));
        }
        if let Some(&column) = self.kept_columns.iter().find(|&&c| c >= self.raw_width) {
            return Err(DataError::ColumnOutOfRange {
                column,
                raw_width: self.raw_width,
            });
        }
        if let Some(position) = self
            .kept_columns
            .windows(2)
            .position(|pair| pair[0] >= pair[1])
        {
            return Err(DataError::UnorderedColumns {
                position: position + 1,
            });
        }
        Ok(())
    }

    /// Selects the kept columns of `raw` and scales them.
    pub fn transform(&self, raw: ArrayView2<f64>) -> Result<Array2<f64>, DataError> {
        self.validate()?;
        if raw.ncols() != self.raw_width {
            return Err(DataError::RawWidthMismatch {
                found: raw.ncols(),
                expected: self.raw_width,
            });
        }
        let scale = self.intensity_scale;
        Ok(raw
            .select(Axis(1), &self.kept_columns)
            .mapv_into(|v| v / scale))
    }
}

/// Reads one block of raw pixel rows from a headerless CSV file.
pub fn load_block(path: &Path) -> Result<Array2<f64>, DataError> {
    if !path.exists() {
        return Err(DataError::MissingBlock(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut values = Vec::new();
    let mut width = None;
    let mut rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let expected = *width.get_or_insert(record.len());
        if record.len() != expected {
            return Err(DataError::InconsistentWidth {
                path: path.to_path_buf(),
                row,
                found: record.len(),
                expected,
            });
        }
        for (column, field) in record.iter().enumerate() {
            let value: f64 = field.parse().map_err(|_| DataError::NonNumericValue {
                path: path.to_path_buf(),
                row,
                column,
                value: field.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValue {
                    path: path.to_path_buf(),
                    row,
                    column,
                });
            }
            values.push(value);
        }
        rows += 1;
    }

    let Some(width) = width else {
        return Err(DataError::EmptyBlock(path.to_path_buf()));
    };
    log::debug!("Loaded {rows} rows of width {width} from '{}'.", path.display());
    Ok(Array2::from_shape_vec((rows, width), values)?)
}

/// Loads `train{c}.csv` / `test{c}.csv` blocks from `dir` and builds the splits,
/// fitting a fresh [`Preprocessor`] on the training rows.
pub fn load_dataset(dir: &Path, config: &DatasetConfig) -> Result<Dataset, DataError> {
    load_dataset_with(dir, config, None)
}

/// Like [`load_dataset`], but reuses `preprocessor` when one is given so the
/// splits line up with a previously trained model.
pub fn load_dataset_with(
    dir: &Path,
    config: &DatasetConfig,
    preprocessor: Option<Preprocessor>,
) -> Result<Dataset, DataError> {
    log::info!("Loading dataset from '{}'.", dir.display());
    let load_blocks = |prefix: &str| -> Result<Vec<Array2<f64>>, DataError> {
        (0..config.num_classes)
            .map(|class_id| load_block(&dir.join(format!("{prefix}{class_id}.csv"))))
            .collect()
    };
    let train_blocks = load_blocks("train")?;
    let test_blocks = load_blocks("test")?;
    build_dataset(&train_blocks, &test_blocks, config, preprocessor)
}

/// Builds the three splits from per-class raw blocks (block `c` holds class `c`).
/// Without a `preprocessor`, one is fitted on the training split.
pub fn build_dataset(
    train_blocks: &[Array2<f64>],
    test_blocks: &[Array2<f64>],
    config: &DatasetConfig,
    preprocessor: Option<Preprocessor>,
) -> Result<Dataset, DataError> {
    for blocks in [train_blocks, test_blocks] {
        if blocks.len() != config.num_classes {
            return Err(DataError::ClassCountMismatch {
                found: blocks.len(),
                expected: config.num_classes,
            });
        }
    }

    let held_out = config.validation_per_class;
    let mut validation_parts = Vec::with_capacity(train_blocks.len());
    let mut train_parts = Vec::with_capacity(train_blocks.len());
    for (class_id, block) in train_blocks.iter().enumerate() {
        if block.nrows() <= held_out {
            return Err(DataError::InsufficientSamples {
                class_id,
                found: block.nrows(),
                required: held_out + 1,
            });
        }
        let (validation, train) = block.view().split_at(Axis(0), held_out);
        validation_parts.push(validation);
        train_parts.push(train);
    }
    let test_parts: Vec<_> = test_blocks.iter().map(|b| b.view()).collect();

    let raw_train = stack_labeled(&train_parts)?;
    let raw_validation = stack_labeled(&validation_parts)?;
    let raw_test = stack_labeled(&test_parts)?;

    let preprocessor = match preprocessor {
        Some(preprocessor) => preprocessor,
        None => Preprocessor::fit(
            raw_train.features.view(),
            config.variance_threshold,
            config.intensity_scale,
        )?,
    };

    let finish = |raw: LabeledSplit| -> Result<LabeledSplit, DataError> {
        Ok(LabeledSplit {
            features: preprocessor.transform(raw.features.view())?,
            labels: raw.labels,
        })
    };
    let train = finish(raw_train)?;
    let validation = finish(raw_validation)?;
    let test = finish(raw_test)?;

    log::info!(
        "Dataset ready: {} training, {} validation, {} test samples with {} features.",
        train.len(),
        validation.len(),
        test.len(),
        preprocessor.num_features()
    );

    Ok(Dataset {
        train,
        validation,
        test,
        preprocessor,
    })
}

/// Concatenates per-class blocks row-wise, labelling block `c` with class `c`.
fn stack_labeled(parts: &[ArrayView2<f64>]) -> Result<LabeledSplit, DataError> {
    let features = concatenate(Axis(0), parts)?;
    let labels = parts
        .iter()
        .enumerate()
        .flat_map(|(class_id, part)| std::iter::repeat_n(class_id, part.nrows()))
        .collect();
    Ok(LabeledSplit { features, labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::fs;

    fn config(num_classes: usize, validation_per_class: usize) -> DatasetConfig {
        DatasetConfig {
            num_classes,
            validation_per_class,
            ..DatasetConfig::default()
        }
    }

    #[test]
    fn constant_columns_are_dropped() {
        let raw = array![
            [0.0, 10.0, 255.0, 3.0],
            [0.0, 20.0, 255.0, 3.0],
            [0.0, 30.0, 255.0, 4.0]
        ];
        let preprocessor = Preprocessor::fit(raw.view(), 0.001, 255.0).unwrap();
        assert_eq!(preprocessor.kept_columns, vec![1, 3]);
        assert_eq!(preprocessor.num_features(), 2);

        let features = preprocessor.transform(raw.view()).unwrap();
        assert_eq!(features.ncols(), 2);
        assert!(features.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn threshold_is_strict_and_population_based() {
        // Population std of [0, 2] is exactly 1.0.
        let raw = array![[0.0, 0.0], [2.0, 0.0]];
        assert!(Preprocessor::fit(raw.view(), 1.0, 1.0).unwrap().kept_columns.is_empty());
        assert_eq!(
            Preprocessor::fit(raw.view(), 0.999, 1.0).unwrap().kept_columns,
            vec![0]
        );
    }

    #[test]
    fn invalid_preprocessing_inputs_are_rejected() {
        let raw = array![[1.0, 2.0]];
        assert!(matches!(
            Preprocessor::fit(raw.view(), 0.001, 0.0),
            Err(DataError::InvalidScale(_))
        ));
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            Preprocessor::fit(empty.view(), 0.001, 255.0),
            Err(DataError::EmptyTrainingMatrix)
        ));

        let preprocessor = Preprocessor::fit(array![[0.0, 1.0], [1.0, 1.0]].view(), 0.001, 1.0).unwrap();
        assert!(matches!(
            preprocessor.transform(array![[1.0, 2.0, 3.0]].view()),
            Err(DataError::RawWidthMismatch {
                found: 3,
                expected: 2
            })
        ));
    }

    #[test]
    fn malformed_preprocessor_is_rejected_before_selecting() {
        let raw = array![[1.0, 2.0, 3.0]];
        let out_of_range = Preprocessor {
            raw_width: 3,
            kept_columns: vec![0, 7],
            intensity_scale: 255.0,
        };
        assert!(matches!(
            out_of_range.transform(raw.view()),
            Err(DataError::ColumnOutOfRange {
                column: 7,
                raw_width: 3
            })
        ));

        let unordered = Preprocessor {
            kept_columns: vec![2, 1],
            ..out_of_range.clone()
        };
        assert!(matches!(
            unordered.validate(),
            Err(DataError::UnorderedColumns { position: 1 })
        ));
        let repeated = Preprocessor {
            kept_columns: vec![1, 1],
            ..out_of_range.clone()
        };
        assert!(repeated.validate().is_err());

        let zero_scale = Preprocessor {
            kept_columns: vec![0, 2],
            intensity_scale: 0.0,
            ..out_of_range
        };
        assert!(matches!(
            zero_scale.transform(raw.view()),
            Err(DataError::InvalidScale(_))
        ));
    }

    #[test]
    fn validation_rows_come_from_the_head_of_each_block() {
        let train_blocks = vec![
            array![[0.0, 1.0], [0.0, 2.0], [0.0, 3.0]],
            array![[255.0, 4.0], [255.0, 5.0], [255.0, 6.0], [255.0, 7.0]],
        ];
        let test_blocks = vec![array![[0.0, 8.0]], array![[255.0, 9.0]]];
        let dataset = build_dataset(&train_blocks, &test_blocks, &config(2, 1), None).unwrap();

        assert_eq!(dataset.validation.labels, array![0, 1]);
        assert_eq!(dataset.validation.features.column(1), array![1.0 / 255.0, 4.0 / 255.0]);
        assert_eq!(dataset.train.labels, array![0, 0, 1, 1, 1]);
        assert_eq!(dataset.test.labels, array![0, 1]);
        assert_eq!(dataset.train.num_features(), 2);
        assert_eq!(dataset.validation.num_features(), 2);
        assert_eq!(dataset.test.num_features(), 2);
    }

    #[test]
    fn supplied_preprocessor_is_reused() {
        let train_blocks = vec![array![[0.0, 1.0], [0.0, 2.0]], array![[9.0, 3.0], [9.0, 4.0]]];
        let test_blocks = vec![array![[0.0, 8.0]], array![[9.0, 9.0]]];
        let stored = Preprocessor {
            raw_width: 2,
            kept_columns: vec![1],
            intensity_scale: 1.0,
        };
        let dataset =
            build_dataset(&train_blocks, &test_blocks, &config(2, 0), Some(stored.clone())).unwrap();
        assert_eq!(dataset.preprocessor, stored);
        assert_eq!(dataset.test.features, array![[8.0], [9.0]]);
    }

    #[test]
    fn every_class_must_keep_training_rows() {
        let train_blocks = vec![array![[1.0], [2.0]], array![[3.0]]];
        let test_blocks = vec![array![[1.0]], array![[2.0]]];
        assert!(matches!(
            build_dataset(&train_blocks, &test_blocks, &config(2, 1), None),
            Err(DataError::InsufficientSamples {
                class_id: 1,
                found: 1,
                required: 2
            })
        ));
        assert!(matches!(
            build_dataset(&train_blocks, &test_blocks[..1], &config(2, 0), None),
            Err(DataError::ClassCountMismatch {
                found: 1,
                expected: 2
            })
        ));
    }

    #[test]
    fn blocks_are_read_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train0.csv");
        fs::write(&path, "0, 12, 255\n3,4,5\n").unwrap();
        let block = load_block(&path).unwrap();
        assert_eq!(block, array![[0.0, 12.0, 255.0], [3.0, 4.0, 5.0]]);

        let missing = dir.path().join("train9.csv");
        assert!(matches!(load_block(&missing), Err(DataError::MissingBlock(_))));

        let ragged = dir.path().join("ragged.csv");
        fs::write(&ragged, "1,2,3\n4,5\n").unwrap();
        assert!(matches!(
            load_block(&ragged),
            Err(DataError::InconsistentWidth {
                row: 1,
                found: 2,
                expected: 3,
                ..
            })
        ));

        let text = dir.path().join("text.csv");
        fs::write(&text, "1,x,3\n").unwrap();
        assert!(matches!(
            load_block(&text),
            Err(DataError::NonNumericValue { row: 0, column: 1, .. })
        ));

        let empty = dir.path().join("empty.csv");
        fs::write(&empty, "").unwrap();
        assert!(matches!(load_block(&empty), Err(DataError::EmptyBlock(_))));
    }
}
