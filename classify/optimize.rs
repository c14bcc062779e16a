//! # Gradient-Based Unconstrained Minimization
//!
//! The trainer never talks to an optimizer library directly. It hands a
//! cost-and-gradient closure, a starting point and a [`MinimizeOptions`] to any
//! [`Minimizer`], and receives a [`Minimum`] that records both the best point found
//! and how the run ended.
//!
//! Two minimizers are provided:
//!
//! 1.  [`ConjugateGradient`]: nonlinear conjugate gradient with the Polak–Ribière+
//!     update and a strong-Wolfe line search. This is the reference method for the
//!     one-vs-all trainer.
//! 2.  [`BfgsMinimizer`]: quasi-Newton BFGS backed by the `wolfe_bfgs` crate.
//!
//! Running out of iterations is not an error for either of them. The run reports
//! [`FitStatus::BudgetExhausted`] and returns the best iterate it saw.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

/// A cost function returning the scalar value and its gradient at a point.
pub type Objective<'a> = dyn Fn(&Array1<f64>) -> (f64, Array1<f64>) + 'a;

/// Value substituted for a non-finite cost when handing it to the BFGS backend,
/// so its line search treats the point as a very poor step instead of aborting.
const NON_FINITE_PENALTY: f64 = 1e10;

/// How a minimization run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// The gradient norm fell below the requested tolerance.
    Converged,
    /// The iteration budget ran out first. The best iterate is still usable.
    BudgetExhausted,
    /// The line search could not make further progress. The best iterate is still usable.
    Stalled,
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Converged => "converged",
            Self::BudgetExhausted => "iteration budget exhausted",
            Self::Stalled => "stalled",
        })
    }
}

/// Stopping criteria shared by all minimizers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinimizeOptions {
    /// Maximum number of outer iterations (line searches).
    pub max_iterations: usize,
    /// Convergence threshold on the largest absolute gradient component.
    pub gradient_tolerance: f64,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            gradient_tolerance: 1e-5,
        }
    }
}

/// The outcome of a minimization run.
#[derive(Debug, Clone)]
pub struct Minimum {
    pub point: Array1<f64>,
    pub value: f64,
    /// Infinity norm of the gradient at `point`.
    pub gradient_norm: f64,
    pub iterations: usize,
    /// Number of cost-and-gradient evaluations, including the starting point.
    pub evaluations: usize,
    pub status: FitStatus,
}

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("The objective returned a gradient of length {found}, but the point has {expected} coordinates.")]
    GradientLengthMismatch { found: usize, expected: usize },

    #[error("The objective is not finite at the starting point (value: {0}). Cannot start minimization.")]
    NonFiniteStart(f64),
}

/// Capability interface for gradient-based unconstrained minimization.
pub trait Minimizer: Send + Sync {
    /// Short human-readable name used in log output.
    fn name(&self) -> &'static str;

    fn minimize(
        &self,
        objective: &Objective<'_>,
        x0: Array1<f64>,
        options: &MinimizeOptions,
    ) -> Result<Minimum, OptimizeError>;
}

/// Selects one of the built-in minimizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerKind {
    ConjugateGradient,
    Bfgs,
}

impl OptimizerKind {
    pub fn minimizer(self) -> Box<dyn Minimizer> {
        match self {
            Self::ConjugateGradient => Box::new(ConjugateGradient::default()),
            Self::Bfgs => Box::new(BfgsMinimizer),
        }
    }
}

fn inf_norm(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()))
}

/// Wraps an objective, counting evaluations and checking gradient shape.
struct CountedObjective<'o, 'a> {
    objective: &'o Objective<'a>,
    dimension: usize,
    evaluations: usize,
}

impl<'o, 'a> CountedObjective<'o, 'a> {
    fn new(objective: &'o Objective<'a>, dimension: usize) -> Self {
        Self {
            objective,
            dimension,
            evaluations: 0,
        }
    }

    fn call(&mut self, x: &Array1<f64>) -> Result<(f64, Array1<f64>), OptimizeError> {
        let (value, gradient) = (self.objective)(x);
        self.evaluations += 1;
        if gradient.len() != self.dimension {
            return Err(OptimizeError::GradientLengthMismatch {
                found: gradient.len(),
                expected: self.dimension,
            });
        }
        Ok((value, gradient))
    }
}

/// A trial point along the search direction.
#[derive(Debug, Clone)]
struct Probe {
    alpha: f64,
    point: Array1<f64>,
    value: f64,
    gradient: Array1<f64>,
    /// Directional derivative `gradient · direction`.
    slope: f64,
}

/// Nonlinear conjugate gradient (Polak–Ribière+) with a strong-Wolfe line search.
#[derive(Debug, Clone, Copy)]
pub struct ConjugateGradient {
    /// Armijo constant `c1` of the sufficient-decrease condition.
    pub sufficient_decrease: f64,
    /// Constant `c2` of the strong curvature condition.
    pub curvature: f64,
    /// Objective evaluations allowed within one line search.
    pub max_line_search_evaluations: usize,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self {
            sufficient_decrease: 1e-4,
            curvature: 0.4,
            max_line_search_evaluations: 40,
        }
    }
}

impl Minimizer for ConjugateGradient {
    fn name(&self) -> &'static str {
        "conjugate-gradient"
    }

    fn minimize(
        &self,
        objective: &Objective<'_>,
        x0: Array1<f64>,
        options: &MinimizeOptions,
    ) -> Result<Minimum, OptimizeError> {
        let mut counted = CountedObjective::new(objective, x0.len());
        let (mut value, mut gradient) = counted.call(&x0)?;
        if !value.is_finite() {
            return Err(OptimizeError::NonFiniteStart(value));
        }

        let mut point = x0;
        let mut direction = gradient.mapv(|g| -g);
        // Pretend the previous step decreased the cost by half the gradient norm.
        // This only seeds the first trial step length.
        let mut previous_value = value + gradient.dot(&gradient).sqrt() / 2.0;
        let mut iterations = 0;

        let status = loop {
            if inf_norm(&gradient) <= options.gradient_tolerance {
                break FitStatus::Converged;
            }
            if iterations >= options.max_iterations {
                break FitStatus::BudgetExhausted;
            }

            let mut slope = gradient.dot(&direction);
            if !(slope < 0.0) {
                log::debug!("Search direction lost descent at iteration {iterations}; restarting along -g");
                direction = gradient.mapv(|g| -g);
                slope = -gradient.dot(&gradient);
            }

            let initial_step = initial_step_length(value, previous_value, slope);
            let Some(step) = self.line_search(
                &mut counted,
                &point,
                value,
                &gradient,
                &direction,
                slope,
                initial_step,
            )?
            else {
                log::debug!("Line search made no progress at iteration {iterations}");
                break FitStatus::Stalled;
            };

            let beta = polak_ribiere_plus(&step.gradient, &gradient);
            direction.mapv_inplace(|d| d * beta);
            direction -= &step.gradient;

            previous_value = value;
            value = step.value;
            point = step.point;
            gradient = step.gradient;
            iterations += 1;

            log::trace!(
                "CG iteration {iterations}: cost {value:.6e}, step {:.3e}, |g|_inf {:.3e}",
                step.alpha,
                inf_norm(&gradient)
            );
        };

        Ok(Minimum {
            gradient_norm: inf_norm(&gradient),
            point,
            value,
            iterations,
            evaluations: counted.evaluations,
            status,
        })
    }
}

/// First trial step, extrapolated from the last cost decrease.
fn initial_step_length(value: f64, previous_value: f64, slope: f64) -> f64 {
    let guess = 1.01 * 2.0 * (value - previous_value) / slope;
    if guess.is_finite() && guess > 0.0 {
        guess.min(1.0)
    } else {
        1.0
    }
}

/// `max(0, g_new · (g_new - g_old) / (g_old · g_old))`.
fn polak_ribiere_plus(new_gradient: &Array1<f64>, old_gradient: &Array1<f64>) -> f64 {
    let denominator = old_gradient.dot(old_gradient);
    if denominator <= f64::MIN_POSITIVE {
        return 0.0;
    }
    let numerator = new_gradient.dot(new_gradient) - new_gradient.dot(old_gradient);
    (numerator / denominator).max(0.0)
}

impl ConjugateGradient {
    fn probe(
        counted: &mut CountedObjective<'_, '_>,
        origin: &Array1<f64>,
        direction: &Array1<f64>,
        alpha: f64,
    ) -> Result<Probe, OptimizeError> {
        let mut point = origin.clone();
        point.scaled_add(alpha, direction);
        let (mut value, gradient) = counted.call(&point)?;
        let slope = gradient.dot(direction);
        if !slope.is_finite() {
            value = f64::INFINITY;
        }
        Ok(Probe {
            alpha,
            point,
            value,
            gradient,
            slope,
        })
    }

    /// Returns a step satisfying the strong Wolfe conditions when one is found, a
    /// step satisfying only sufficient decrease when the budget runs out after
    /// finding one, and `None` when no decrease was found at all.
    #[allow(clippy::too_many_arguments)]
    fn line_search(
        &self,
        counted: &mut CountedObjective<'_, '_>,
        origin: &Array1<f64>,
        value: f64,
        gradient: &Array1<f64>,
        direction: &Array1<f64>,
        slope: f64,
        initial_step: f64,
    ) -> Result<Option<Probe>, OptimizeError> {
        let mut previous = Probe {
            alpha: 0.0,
            point: origin.clone(),
            value,
            gradient: gradient.clone(),
            slope,
        };
        let mut alpha = initial_step;

        for attempt in 0..self.max_line_search_evaluations {
            let current = Self::probe(counted, origin, direction, alpha)?;
            let remaining = self.max_line_search_evaluations - attempt - 1;

            if !current.value.is_finite()
                || current.value > value + self.sufficient_decrease * alpha * slope
                || (attempt > 0 && current.value >= previous.value)
            {
                return self.zoom(counted, origin, direction, value, slope, previous, current, remaining);
            }
            if current.slope.abs() <= -self.curvature * slope {
                return Ok(Some(current));
            }
            if current.slope >= 0.0 {
                return self.zoom(counted, origin, direction, value, slope, current, previous, remaining);
            }

            previous = current;
            alpha *= 2.0;
        }

        Ok((previous.alpha > 0.0).then_some(previous))
    }

    /// Narrows the bracket `[low, high]` until a strong-Wolfe step is found.
    /// `low` always satisfies sufficient decrease and has the lowest value seen.
    #[allow(clippy::too_many_arguments)]
    fn zoom(
        &self,
        counted: &mut CountedObjective<'_, '_>,
        origin: &Array1<f64>,
        direction: &Array1<f64>,
        value: f64,
        slope: f64,
        mut low: Probe,
        mut high: Probe,
        budget: usize,
    ) -> Result<Option<Probe>, OptimizeError> {
        for _ in 0..budget {
            let width = high.alpha - low.alpha;
            if width.abs() <= 1e-12 * low.alpha.abs().max(1.0) {
                break;
            }

            let trial = interpolate(&low, &high);
            let current = Self::probe(counted, origin, direction, trial)?;

            if !current.value.is_finite()
                || current.value > value + self.sufficient_decrease * trial * slope
                || current.value >= low.value
            {
                high = current;
                continue;
            }
            if current.slope.abs() <= -self.curvature * slope {
                return Ok(Some(current));
            }
            if current.slope * (high.alpha - low.alpha) >= 0.0 {
                high = std::mem::replace(&mut low, current);
            } else {
                low = current;
            }
        }

        Ok((low.alpha > 0.0).then_some(low))
    }
}

/// Minimizer of the quadratic through `low` (value and slope) and `high` (value),
/// safeguarded to the inner 80% of the bracket; bisection otherwise.
fn interpolate(low: &Probe, high: &Probe) -> f64 {
    let width = high.alpha - low.alpha;
    let (left, right) = if width > 0.0 {
        (low.alpha, high.alpha)
    } else {
        (high.alpha, low.alpha)
    };
    let margin = 0.1 * (right - left);
    let midpoint = 0.5 * (left + right);

    if !high.value.is_finite() {
        return midpoint;
    }
    let curvature = 2.0 * (high.value - low.value - low.slope * width);
    if curvature.abs() <= f64::EPSILON {
        return midpoint;
    }
    let candidate = low.alpha - low.slope * width * width / curvature;
    if candidate.is_finite() && candidate >= left + margin && candidate <= right - margin {
        candidate
    } else {
        midpoint
    }
}

/// BFGS through the `wolfe_bfgs` crate.
///
/// The backend owns its own line search and stopping rules. When it gives up, the
/// solution it carries is returned with the matching [`FitStatus`]. Errors that
/// carry no solution fall back to the lowest finite cost the adapter has been shown.
#[derive(Debug, Clone, Copy, Default)]
pub struct BfgsMinimizer;

/// Lowest-cost point observed through the cost closure.
struct BestIterate {
    point: Array1<f64>,
    value: f64,
    gradient_norm: f64,
    evaluations: usize,
    /// Strict decreases seen. Stands in for the iteration count when the backend
    /// stops without reporting one.
    improvements: usize,
}

impl BestIterate {
    fn observe(&mut self, point: &Array1<f64>, value: f64, gradient: &Array1<f64>) {
        self.evaluations += 1;
        if value.is_finite() && value < self.value {
            self.improvements += 1;
            self.point.assign(point);
            self.value = value;
            self.gradient_norm = inf_norm(gradient);
        }
    }
}

impl Minimizer for BfgsMinimizer {
    fn name(&self) -> &'static str {
        "bfgs"
    }

    fn minimize(
        &self,
        objective: &Objective<'_>,
        x0: Array1<f64>,
        options: &MinimizeOptions,
    ) -> Result<Minimum, OptimizeError> {
        let mut counted = CountedObjective::new(objective, x0.len());
        let (initial_value, initial_gradient) = counted.call(&x0)?;
        if !initial_value.is_finite() {
            return Err(OptimizeError::NonFiniteStart(initial_value));
        }

        let dimension = x0.len();
        let best = RefCell::new(BestIterate {
            point: x0.clone(),
            value: initial_value,
            gradient_norm: inf_norm(&initial_gradient),
            evaluations: counted.evaluations,
            improvements: 0,
        });

        let cost_and_grad = |x: &Array1<f64>| -> (f64, Array1<f64>) {
            let (value, mut gradient) = objective(x);
            if gradient.len() != dimension {
                log::error!(
                    "Objective returned {} gradient entries for a {dimension}-dimensional point",
                    gradient.len()
                );
                return (NON_FINITE_PENALTY, Array1::zeros(dimension));
            }
            best.borrow_mut().observe(x, value, &gradient);

            if !value.is_finite() {
                log::warn!("Non-finite cost encountered: {value}, returning large finite value");
                return (NON_FINITE_PENALTY, Array1::zeros(dimension));
            }
            gradient.mapv_inplace(|g| if g.is_finite() { g } else { 0.0 });
            (value, gradient)
        };

        let outcome = Bfgs::new(x0, cost_and_grad)
            .with_tolerance(options.gradient_tolerance)
            .with_max_iterations(options.max_iterations)
            .run();

        let best = best.into_inner();
        match outcome {
            Ok(solution) => settle_bfgs(&mut counted, solution, best, None, options),
            Err(BfgsError::MaxIterationsReached { last_solution }) => settle_bfgs(
                &mut counted,
                *last_solution,
                best,
                Some(FitStatus::BudgetExhausted),
                options,
            ),
            Err(BfgsError::LineSearchFailed {
                last_solution,
                max_attempts,
            }) => {
                log::debug!("BFGS line search gave up after {max_attempts} attempts");
                settle_bfgs(
                    &mut counted,
                    *last_solution,
                    best,
                    Some(FitStatus::Stalled),
                    options,
                )
            }
            Err(error @ (BfgsError::GradientIsNaN | BfgsError::StepSizeTooSmall)) => {
                log::debug!("BFGS stopped early ({error}); using best iterate with cost {:.6e}", best.value);
                Ok(Minimum {
                    evaluations: best.evaluations + counted.evaluations - 1,
                    point: best.point,
                    value: best.value,
                    gradient_norm: best.gradient_norm,
                    iterations: best.improvements,
                    status: FitStatus::Stalled,
                })
            }
        }
    }
}

/// Re-evaluates the backend's solution and turns it into a [`Minimum`]. A
/// solution worse than the best iterate seen (or non-finite) is replaced by it.
/// With no `stopped` status, the run converged unless the budget ran out first.
fn settle_bfgs(
    counted: &mut CountedObjective<'_, '_>,
    solution: BfgsSolution,
    best: BestIterate,
    stopped: Option<FitStatus>,
    options: &MinimizeOptions,
) -> Result<Minimum, OptimizeError> {
    let BfgsSolution {
        final_point,
        iterations,
        ..
    } = solution;
    let (value, gradient) = counted.call(&final_point)?;
    // The starting evaluation is counted by both trackers.
    let evaluations = best.evaluations + counted.evaluations - 1;

    let (point, value, gradient_norm) = if value.is_finite() && value <= best.value {
        (final_point, value, inf_norm(&gradient))
    } else {
        (best.point, best.value, best.gradient_norm)
    };
    let status = stopped.unwrap_or(
        if iterations >= options.max_iterations && gradient_norm > options.gradient_tolerance {
            FitStatus::BudgetExhausted
        } else {
            FitStatus::Converged
        },
    );

    Ok(Minimum {
        point,
        value,
        gradient_norm,
        iterations,
        evaluations,
        status,
    })
}
