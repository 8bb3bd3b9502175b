//! Straight-line least squares via SVD.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Result of fitting `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    /// RMS of the fit residuals, in units of `y`
    pub rms_error: f64,
    /// Number of points used
    pub num_points: usize,
}

impl LineFit {
    /// Evaluate the fitted line at `x`
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    /// The `x` at which the line crosses `y`, if the slope is nonzero
    pub fn solve_for_x(&self, y: f64) -> Option<f64> {
        if self.slope == 0.0 {
            None
        } else {
            Some((y - self.intercept) / self.slope)
        }
    }
}

/// Errors that can occur during line fitting
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("length mismatch: x has {x_len} points, y has {y_len}")]
    LengthMismatch { x_len: usize, y_len: usize },

    #[error("insufficient data: expected at least {expected}, got {got}")]
    InsufficientData { expected: usize, got: usize },

    #[error("all x values are identical; slope is undetermined")]
    DegenerateInput,

    #[error("SVD solve failed: {0}")]
    SolveFailed(String),
}

/// Fit a straight line to `(x, y)` samples.
///
/// Solves the overdetermined system `[x 1] * [slope intercept]^T = y` with an
/// SVD, which stays well behaved when the x values are tightly clustered.
pub fn fit_line(x: &[f64], y: &[f64]) -> Result<LineFit, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }

    let n = x.len();
    if n < 2 {
        return Err(FitError::InsufficientData {
            expected: 2,
            got: n,
        });
    }

    let x_min = x.iter().copied().fold(f64::INFINITY, f64::min);
    let x_max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if x_max - x_min <= f64::EPSILON * x_max.abs().max(1.0) {
        return Err(FitError::DegenerateInput);
    }

    let design = DMatrix::from_fn(n, 2, |r, c| if c == 0 { x[r] } else { 1.0 });
    let rhs = DVector::from_column_slice(y);

    let params = design
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|e| FitError::SolveFailed(e.to_string()))?;

    let mut fit = LineFit {
        slope: params[0],
        intercept: params[1],
        rms_error: 0.0,
        num_points: n,
    };

    let sum_sq: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| (fit.eval(xi) - yi).powi(2))
        .sum();
    fit.rms_error = (sum_sq / n as f64).sqrt();

    Ok(fit)
}
