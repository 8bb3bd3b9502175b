//! Sub-pixel shift search between two Hartmann exposures.
//!
//! The moving frame is resampled at every trial shift on a regular grid, the
//! masked sum of products with the reference frame forms a correlation curve,
//! and the grid maximum is refined with a three-point parabola.
//!
//! Sign convention: the returned shift is the translation that, applied to the
//! moving frame, best aligns it with the reference. Features sitting `d` rows
//! further along in the moving frame therefore give a shift of `-d`.

use ndarray::{s, ArrayView2, Zip};
use rayon::prelude::*;
use thiserror::Error;

use crate::interp::shift_rows;

/// Rise above the running minimum tolerated while walking down the main lobe
const LOBE_RIPPLE: f64 = 0.02;

/// Curves whose peak-to-floor range is below this fraction of the peak are flat
const FLAT_CURVE_RTOL: f64 = 1e-9;

/// Largest number of trial shifts a search may evaluate
pub const MAX_GRID_POINTS: usize = 4001;

/// Errors that can occur while measuring a shift
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShiftError {
    #[error("frame shapes differ: {first:?} vs {second:?}")]
    ShapeMismatch {
        first: (usize, usize),
        second: (usize, usize),
    },

    #[error("region of {rows}x{cols} pixels leaves nothing inside an edge mask of {edge_mask}")]
    TooSmall {
        rows: usize,
        cols: usize,
        edge_mask: usize,
    },

    #[error("invalid shift search: {0}")]
    InvalidSearch(String),
}

/// Parameters of the trial-shift grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftSearch {
    /// Largest trial shift in pixels; the grid spans `[-max_shift, max_shift]`
    pub max_shift: f64,
    /// Grid spacing in pixels
    pub step: f64,
    /// Rows and columns excluded at every border of the product image
    pub edge_mask: usize,
}

impl Default for ShiftSearch {
    fn default() -> Self {
        Self {
            max_shift: 2.0,
            step: 0.05,
            edge_mask: 10,
        }
    }
}

impl ShiftSearch {
    /// Reject grids that are empty, too dense to evaluate, or whose resampled
    /// rows could reach the zero fill inside the edge mask.
    pub fn validate(&self) -> Result<(), ShiftError> {
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(ShiftError::InvalidSearch(format!(
                "step must be positive, got {}",
                self.step
            )));
        }
        if !self.max_shift.is_finite() || self.max_shift < self.step {
            return Err(ShiftError::InvalidSearch(format!(
                "max_shift {} must be at least one step ({})",
                self.max_shift, self.step
            )));
        }
        let points = 2.0 * (self.max_shift / self.step).round() + 1.0;
        if points > MAX_GRID_POINTS as f64 {
            return Err(ShiftError::InvalidSearch(format!(
                "{points} trial shifts exceeds the limit of {MAX_GRID_POINTS}"
            )));
        }
        // Cubic resampling reads two rows beyond the integer part of the shift
        let reach = self.max_shift.ceil() as usize + 1;
        if self.edge_mask <= reach {
            return Err(ShiftError::InvalidSearch(format!(
                "edge_mask {} must exceed {reach} for max_shift {}",
                self.edge_mask, self.max_shift
            )));
        }
        Ok(())
    }

    /// Trial shifts, symmetric about zero and always containing it.
    pub fn grid(&self) -> Result<Vec<f64>, ShiftError> {
        self.validate()?;
        let n = (self.max_shift / self.step).round() as i64;
        Ok((-n..=n).map(|k| k as f64 * self.step).collect())
    }
}

/// Correlation coefficient at every trial shift.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationCurve {
    pub shifts: Vec<f64>,
    pub coeffs: Vec<f64>,
    /// Index of the grid maximum
    pub best: usize,
}

impl CorrelationCurve {
    /// Trial shift at the grid maximum
    pub fn peak_shift(&self) -> f64 {
        self.shifts[self.best]
    }

    /// Whether the maximum sits on the first or last grid point
    pub fn peak_on_edge(&self) -> bool {
        self.best == 0 || self.best + 1 == self.coeffs.len()
    }
}

/// A measured shift with its quality metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftEstimate {
    /// Refined shift in pixels
    pub shift: f64,
    /// Peak ambiguity in `[0, 1]`; 0 is an isolated peak, 1 is no usable peak
    pub residual: f64,
    pub curve: CorrelationCurve,
}

/// Evaluate the correlation between `reference` and `moving` over the search grid.
///
/// Trial shifts are evaluated in parallel; each one resamples the full moving
/// frame and sums products over the unmasked interior.
pub fn correlation_curve(
    reference: ArrayView2<f64>,
    moving: ArrayView2<f64>,
    search: &ShiftSearch,
) -> Result<CorrelationCurve, ShiftError> {
    if reference.dim() != moving.dim() {
        return Err(ShiftError::ShapeMismatch {
            first: reference.dim(),
            second: moving.dim(),
        });
    }

    let (rows, cols) = reference.dim();
    let m = search.edge_mask;
    if rows <= 2 * m || cols <= 2 * m {
        return Err(ShiftError::TooSmall {
            rows,
            cols,
            edge_mask: m,
        });
    }

    let shifts = search.grid()?;
    let reference_interior = reference.slice(s![m..rows - m, m..cols - m]);

    let coeffs: Vec<f64> = shifts
        .par_iter()
        .map(|&shift| {
            let shifted = shift_rows(moving, shift);
            Zip::from(&reference_interior)
                .and(&shifted.slice(s![m..rows - m, m..cols - m]))
                .fold(0.0, |acc, &a, &b| acc + a * b)
        })
        .collect();

    let best = coeffs
        .iter()
        .enumerate()
        .fold(0, |best, (i, &c)| if c > coeffs[best] { i } else { best });

    Ok(CorrelationCurve {
        shifts,
        coeffs,
        best,
    })
}

/// Vertex offset of the parabola through `(-1, left)`, `(0, center)`, `(1, right)`.
///
/// Returns 0 when the three points are not concave down, and never moves more
/// than half a grid step.
pub fn parabolic_vertex(left: f64, center: f64, right: f64) -> f64 {
    let denom = left - 2.0 * center + right;
    if !denom.is_finite() || denom >= 0.0 {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

/// Height of the strongest secondary maximum relative to the main peak.
///
/// The curve is normalised to `[0, 1]` and the main lobe is the region reached
/// by walking downhill from the peak in both directions. The result is the
/// largest normalised value outside that lobe. A peak on the grid edge or a
/// flat curve gives 1.
pub fn peak_ambiguity(coeffs: &[f64], best: usize) -> f64 {
    let n = coeffs.len();
    if n < 3 || best == 0 || best + 1 >= n {
        return 1.0;
    }

    let peak = coeffs[best];
    let floor = coeffs.iter().copied().fold(f64::INFINITY, f64::min);
    let range = peak - floor;
    if !range.is_finite() || range <= FLAT_CURVE_RTOL * peak.abs().max(1.0) {
        return 1.0;
    }
    let norm = |i: usize| (coeffs[i] - floor) / range;

    let mut lo = best;
    let mut low_water: f64 = 1.0;
    while lo > 0 && norm(lo - 1) < low_water + LOBE_RIPPLE {
        lo -= 1;
        low_water = low_water.min(norm(lo));
    }

    let mut hi = best;
    low_water = 1.0;
    while hi + 1 < n && norm(hi + 1) < low_water + LOBE_RIPPLE {
        hi += 1;
        low_water = low_water.min(norm(hi));
    }

    (0..lo).chain(hi + 1..n).map(norm).fold(0.0, f64::max)
}

/// Measure the row shift of `moving` relative to `reference`.
pub fn estimate_shift(
    reference: ArrayView2<f64>,
    moving: ArrayView2<f64>,
    search: &ShiftSearch,
) -> Result<ShiftEstimate, ShiftError> {
    let curve = correlation_curve(reference, moving, search)?;
    let residual = peak_ambiguity(&curve.coeffs, curve.best);

    let shift = if curve.peak_on_edge() {
        curve.peak_shift()
    } else {
        let c = &curve.coeffs;
        let b = curve.best;
        curve.peak_shift() + parabolic_vertex(c[b - 1], c[b], c[b + 1]) * search.step
    };

    Ok(ShiftEstimate {
        shift,
        residual,
        curve,
    })
}
