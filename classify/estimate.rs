//! # One-vs-All Model Estimation
//!
//! A `K`-class problem is reduced to `K` independent binary logistic regressions.
//! Class `c` is fitted against the indicator column `T[:, c]` of the one-vs-all label
//! matrix, starting from the zero vector, and its optimum becomes column `c` of the
//! weight matrix.
//!
//! The fits share nothing but the read-only training matrix, so they run as a
//! parallel map over class ids on the rayon pool. Each task owns its label column
//! view, its weight vector and its optimizer state. Columns are written into the
//! weight matrix only after every fit has returned.
//!
//! Input shapes and labels are validated once, up front. Nothing inside the fits
//! can fail on shape grounds afterwards.

use crate::design;
use crate::model::WeightMatrix;
use crate::objective::{BinaryObjective, ObjectiveError};
use crate::optimize::{FitStatus, MinimizeOptions, Minimizer, Minimum, OptimizeError, OptimizerKind};
use crate::progress::{FitProgressObserver, NoopFitProgress};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A comprehensive error type for the training process.
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("The number of classes must be at least 1.")]
    NoClasses,

    #[error("The training set contains no samples.")]
    EmptyTrainingSet,

    #[error("Training labels have {found} entries, but the feature matrix has {expected} rows.")]
    LabelCountMismatch { found: usize, expected: usize },

    #[error("Label {label} at row {row} is outside the class range [0, {num_classes}).")]
    LabelOutOfRange {
        row: usize,
        label: usize,
        num_classes: usize,
    },

    #[error("Non-finite feature value at row {row}, column {column}.")]
    NonFiniteFeature { row: usize, column: usize },

    #[error("Binary objective could not be constructed: {0}")]
    Objective(#[from] ObjectiveError),

    #[error("Optimization failed for class {class_id}: {source}")]
    Optimization {
        class_id: usize,
        #[source]
        source: OptimizeError,
    },
}

/// Hyperparameters of a one-vs-all training run. Saved alongside the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub num_classes: usize,
    pub optimizer: OptimizerKind,
    /// Iteration budget per class. Exhausting it is not an error.
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    /// Fit classes concurrently on the rayon pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let options = MinimizeOptions::default();
        Self {
            num_classes: 10,
            optimizer: OptimizerKind::ConjugateGradient,
            max_iterations: options.max_iterations,
            gradient_tolerance: options.gradient_tolerance,
            parallel: true,
        }
    }
}

impl TrainingConfig {
    pub fn minimize_options(&self) -> MinimizeOptions {
        MinimizeOptions {
            max_iterations: self.max_iterations,
            gradient_tolerance: self.gradient_tolerance,
        }
    }
}

/// Per-class record of how the binary fit went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFit {
    pub class_id: usize,
    /// Number of training samples labelled with this class.
    pub positives: usize,
    pub status: FitStatus,
    pub iterations: usize,
    pub evaluations: usize,
    pub final_loss: f64,
    pub gradient_norm: f64,
}

impl ClassFit {
    /// A class with no positive examples still gets a valid, uninformative classifier.
    pub fn is_degenerate(&self) -> bool {
        self.positives == 0
    }
}

/// The weight matrix produced by a training run, plus per-class diagnostics.
#[derive(Debug, Clone)]
pub struct OneVsAllFit {
    pub weights: WeightMatrix,
    pub fits: Vec<ClassFit>,
}

/// Builds the `N x K` indicator matrix with `T[n, c] = 1` iff `labels[n] == c`.
///
/// Labels outside `[0, K)` leave their row all zero; [`train_one_vs_all`] rejects
/// them before this is called.
pub fn one_vs_all_targets(labels: ArrayView1<usize>, num_classes: usize) -> Array2<f64> {
    let mut targets = Array2::zeros((labels.len(), num_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label < num_classes {
            targets[[row, label]] = 1.0;
        }
    }
    targets
}

/// Trains a one-vs-all logistic regression model.
pub fn train_one_vs_all(
    data: ArrayView2<f64>,
    labels: ArrayView1<usize>,
    config: &TrainingConfig,
) -> Result<OneVsAllFit, TrainingError> {
    train_one_vs_all_with_progress(data, labels, config, &NoopFitProgress)
}

/// Trains a one-vs-all logistic regression model, reporting each finished class
/// to `progress`.
pub fn train_one_vs_all_with_progress(
    data: ArrayView2<f64>,
    labels: ArrayView1<usize>,
    config: &TrainingConfig,
    progress: &dyn FitProgressObserver,
) -> Result<OneVsAllFit, TrainingError> {
    validate_training_inputs(data, labels, config.num_classes)?;

    let num_classes = config.num_classes;
    let targets = one_vs_all_targets(labels, num_classes);
    let minimizer = config.optimizer.minimizer();
    let options = config.minimize_options();

    log::info!(
        "Starting one-vs-all training: {} samples, {} features, {} classes, {} (budget {} iterations).",
        data.nrows(),
        data.ncols(),
        num_classes,
        minimizer.name(),
        options.max_iterations
    );

    progress.on_fit_start(num_classes);

    let fit_class = |class_id: usize| -> Result<(Array1<f64>, ClassFit), TrainingError> {
        let objective = BinaryObjective::new(data.view(), targets.column(class_id))?;
        let minimum = fit_binary_classifier(&objective, minimizer.as_ref(), &options)
            .map_err(|source| TrainingError::Optimization { class_id, source })?;

        let fit = ClassFit {
            class_id,
            positives: objective.num_positives(),
            status: minimum.status,
            iterations: minimum.iterations,
            evaluations: minimum.evaluations,
            final_loss: minimum.value,
            gradient_norm: minimum.gradient_norm,
        };
        log_class_fit(&fit);
        progress.on_class_finished(&fit);
        Ok((minimum.point, fit))
    };

    let results: Vec<(Array1<f64>, ClassFit)> = if config.parallel {
        (0..num_classes)
            .into_par_iter()
            .map(&fit_class)
            .collect::<Result<_, _>>()?
    } else {
        (0..num_classes)
            .map(&fit_class)
            .collect::<Result<_, _>>()?
    };

    let mut weights = WeightMatrix::zeros(data.ncols(), num_classes);
    let mut fits = Vec::with_capacity(num_classes);
    for (class_id, (column, fit)) in results.into_iter().enumerate() {
        weights.set_class_weights(class_id, column.view());
        fits.push(fit);
    }

    progress.on_fit_finish();

    let exhausted = fits
        .iter()
        .filter(|f| f.status == FitStatus::BudgetExhausted)
        .count();
    log::info!(
        "One-vs-all training finished: {} of {} classes converged, {} hit the iteration budget.",
        fits.iter().filter(|f| f.status == FitStatus::Converged).count(),
        num_classes,
        exhausted
    );

    Ok(OneVsAllFit { weights, fits })
}

/// Fits one binary logistic regression starting from the zero vector.
pub fn fit_binary_classifier(
    objective: &BinaryObjective<'_>,
    minimizer: &dyn Minimizer,
    options: &MinimizeOptions,
) -> Result<Minimum, OptimizeError> {
    let cost_and_grad = |w: &Array1<f64>| objective.loss_and_gradient(w.view());
    let initial_weights = Array1::zeros(objective.num_params());
    minimizer.minimize(&cost_and_grad, initial_weights, options)
}

fn validate_training_inputs(
    data: ArrayView2<f64>,
    labels: ArrayView1<usize>,
    num_classes: usize,
) -> Result<(), TrainingError> {
    if num_classes == 0 {
        return Err(TrainingError::NoClasses);
    }
    if data.nrows() == 0 {
        return Err(TrainingError::EmptyTrainingSet);
    }
    if labels.len() != data.nrows() {
        return Err(TrainingError::LabelCountMismatch {
            found: labels.len(),
            expected: data.nrows(),
        });
    }
    if let Some((row, &label)) = labels.iter().enumerate().find(|(_, l)| **l >= num_classes) {
        return Err(TrainingError::LabelOutOfRange {
            row,
            label,
            num_classes,
        });
    }
    if let Some((row, column)) = design::first_non_finite(data) {
        return Err(TrainingError::NonFiniteFeature { row, column });
    }
    Ok(())
}

fn log_class_fit(fit: &ClassFit) {
    if fit.is_degenerate() {
        log::warn!(
            "Class {} has no positive training examples; its classifier scores every sample as absent.",
            fit.class_id
        );
    }
    match fit.status {
        FitStatus::Converged => log::debug!(
            "Class {} converged after {} iterations (loss {:.6}, |g|_inf {:.3e}).",
            fit.class_id,
            fit.iterations,
            fit.final_loss,
            fit.gradient_norm
        ),
        FitStatus::BudgetExhausted => log::info!(
            "Class {} used its full budget of {} iterations (loss {:.6}, |g|_inf {:.3e}); keeping the best iterate.",
            fit.class_id,
            fit.iterations,
            fit.final_loss,
            fit.gradient_norm
        ),
        FitStatus::Stalled => log::warn!(
            "Class {} stalled after {} iterations (loss {:.6}, |g|_inf {:.3e}); keeping the best iterate.",
            fit.class_id,
            fit.iterations,
            fit.final_loss,
            fit.gradient_norm
        ),
    }
}
