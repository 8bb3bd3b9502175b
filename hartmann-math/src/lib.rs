//! Numerical kernels for Hartmann-door focus measurement.
//!
//! Everything here is pure array math with no knowledge of cameras,
//! spectrographs or motors: sub-pixel resampling, the correlation shift
//! search, robust statistics and straight-line least squares.

pub mod interp;
pub mod linear_fit;
pub mod shift;
pub mod stats;

pub use linear_fit::{fit_line, FitError, LineFit};
pub use shift::{
    estimate_shift, CorrelationCurve, ShiftError, ShiftEstimate, ShiftSearch, MAX_GRID_POINTS,
};
pub use stats::{clipped_sample_variance, median};
