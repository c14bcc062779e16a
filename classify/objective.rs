//! # Binary Logistic Objective
//!
//! The negative log-likelihood of a Bernoulli model with a logistic link, together
//! with its exact analytic gradient. One instance is bound to a feature matrix and a
//! single 0/1 label column, and the optimizer calls [`BinaryObjective::evaluate`]
//! repeatedly with trial weight vectors.
//!
//! For a weight vector `w` of length `D + 1` (index 0 is the bias) and the augmented
//! design `X_aug = [1 | X]`:
//!
//! - `z = X_aug · w`
//! - `loss = -Σ [ y ln σ(z) + (1 - y) ln(1 - σ(z)) ]`
//! - `gradient = X_aug^T (σ(z) - y)`
//!
//! The loss is never evaluated through `ln(σ(z))` directly. Using
//! `-ln σ(z) = softplus(-z)` and `-ln(1 - σ(z)) = softplus(z)`, each term becomes
//! `(1 - y) softplus(z) + y softplus(-z)`, a sum of non-negative finite numbers for any
//! finite `z`. Saturated logits therefore yield a large but finite loss instead of
//! `-inf` or NaN.

use crate::design;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use thiserror::Error;

/// Errors raised when the objective is bound to, or evaluated with, inconsistent shapes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectiveError {
    #[error("Label vector has {found} entries, but the feature matrix has {expected} rows.")]
    LabelLengthMismatch { found: usize, expected: usize },

    #[error(
        "Weight vector has {found} entries, but {expected} are required ({features} features plus the bias)."
    )]
    WeightLengthMismatch {
        found: usize,
        expected: usize,
        features: usize,
    },
}

/// The loss value and gradient returned by a single objective evaluation.
#[derive(Debug, Clone)]
pub struct LossAndGradient {
    pub loss: f64,
    pub gradient: Array1<f64>,
}

/// The logistic function, evaluated without overflow for any finite input.
#[inline]
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^z)`, evaluated without overflow for any finite input.
#[inline]
pub fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// A two-class logistic regression objective bound to one dataset.
#[derive(Debug, Clone, Copy)]
pub struct BinaryObjective<'a> {
    data: ArrayView2<'a, f64>,
    labels: ArrayView1<'a, f64>,
}

impl<'a> BinaryObjective<'a> {
    /// Binds the objective to `data` (`N x D`) and the binary `labels` (`N`).
    pub fn new(
        data: ArrayView2<'a, f64>,
        labels: ArrayView1<'a, f64>,
    ) -> Result<Self, ObjectiveError> {
        if labels.len() != data.nrows() {
            return Err(ObjectiveError::LabelLengthMismatch {
                found: labels.len(),
                expected: data.nrows(),
            });
        }
        Ok(Self { data, labels })
    }

    /// Length of the weight vector this objective expects: `D + 1`.
    pub fn num_params(&self) -> usize {
        self.data.ncols() + 1
    }

    pub fn num_samples(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples carrying the positive label.
    pub fn num_positives(&self) -> usize {
        self.labels.iter().filter(|&&y| y > 0.5).count()
    }

    /// Evaluates loss and gradient, validating the weight vector length first.
    pub fn evaluate(&self, weights: ArrayView1<f64>) -> Result<LossAndGradient, ObjectiveError> {
        if weights.len() != self.num_params() {
            return Err(ObjectiveError::WeightLengthMismatch {
                found: weights.len(),
                expected: self.num_params(),
                features: self.data.ncols(),
            });
        }
        let (loss, gradient) = self.loss_and_gradient(weights);
        Ok(LossAndGradient { loss, gradient })
    }

    /// Evaluates loss and gradient for a weight vector already known to have
    /// length [`num_params`](Self::num_params). This is the hot path handed to the
    /// optimizer.
    pub fn loss_and_gradient(&self, weights: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let eta = design::linear_predictor(self.data, weights);

        let mut loss = 0.0;
        let mut residual = Array1::zeros(eta.len());
        Zip::from(&mut residual)
            .and(&eta)
            .and(&self.labels)
            .for_each(|r, &z, &y| {
                loss += (1.0 - y) * softplus(z) + y * softplus(-z);
                *r = sigmoid(z) - y;
            });

        let gradient = design::augmented_transpose_dot(self.data, residual.view());
        (loss, gradient)
    }
}

/// Evaluates the binary logistic objective for `weights` on `(data, binary_labels)`.
pub fn evaluate(
    weights: ArrayView1<f64>,
    data: ArrayView2<f64>,
    binary_labels: ArrayView1<f64>,
) -> Result<LossAndGradient, ObjectiveError> {
    BinaryObjective::new(data.view(), binary_labels.view())?.evaluate(weights)
}
