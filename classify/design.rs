//! # Bias-augmented design helpers
//!
//! Every linear model in this crate works on the augmented feature matrix
//! `X_aug = [1 | X]`, where the leading column of ones carries the bias weight.
//! The augmented matrix is a derived quantity: the objective and the predictor
//! evaluate `X_aug · w` as `X · w[1..] + w[0]`, which produces the same numbers
//! without allocating an `N x (D+1)` copy of the training data on every call.
//! `with_bias_column` materialises it for callers that want the explicit form.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// Returns `[1 | data]`, the feature matrix with a constant bias column prepended.
pub fn with_bias_column(data: ArrayView2<f64>) -> Array2<f64> {
    let mut augmented = Array2::ones((data.nrows(), data.ncols() + 1));
    augmented.slice_mut(s![.., 1..]).assign(&data);
    augmented
}

/// Computes `X_aug · weights` for a single weight vector of length `D + 1`.
///
/// The caller guarantees `weights.len() == data.ncols() + 1`.
pub fn linear_predictor(data: ArrayView2<f64>, weights: ArrayView1<f64>) -> Array1<f64> {
    let mut eta = data.dot(&weights.slice(s![1..]));
    eta += weights[0];
    eta
}

/// Computes the `N x K` score matrix `X_aug · W` for a `(D + 1) x K` weight matrix.
///
/// The caller guarantees `weights.nrows() == data.ncols() + 1`.
pub fn affine_scores(data: ArrayView2<f64>, weights: ArrayView2<f64>) -> Array2<f64> {
    let mut scores = data.dot(&weights.slice(s![1.., ..]));
    scores += &weights.row(0);
    scores
}

/// Computes `X_aug^T · residual`, the gradient shape shared by every linear model
/// whose loss derivative with respect to the linear predictor is `residual`.
pub fn augmented_transpose_dot(data: ArrayView2<f64>, residual: ArrayView1<f64>) -> Array1<f64> {
    let mut gradient = Array1::zeros(data.ncols() + 1);
    gradient[0] = residual.sum();
    gradient.slice_mut(s![1..]).assign(&data.t().dot(&residual));
    gradient
}

/// Returns the first `(row, column)` holding a NaN or infinite value, if any.
pub fn first_non_finite(data: ArrayView2<f64>) -> Option<(usize, usize)> {
    data.indexed_iter()
        .find(|(_, value)| !value.is_finite())
        .map(|(index, _)| index)
}
