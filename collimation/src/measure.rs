//! Shift measurement with signal-quality gating.

use hartmann_math::{
    clipped_sample_variance, estimate_shift, CorrelationCurve, ShiftError, ShiftSearch,
};
use ndarray::ArrayView2;
use thiserror::Error;
use tracing::debug;

use crate::config::Tolerances;

/// Why a camera's measurement cannot be trusted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalQualityError {
    #[error("insufficient signal: clipped variance {variance:.1} below {threshold:.1}, no light in camera?")]
    InsufficientSignal { variance: f64, threshold: f64 },

    #[error("unreliable shift {shift:.3} px: correlation residual {residual:.2} above {threshold:.2}")]
    Unreliable {
        shift: f64,
        residual: f64,
        threshold: f64,
    },
}

#[derive(Error, Debug)]
pub enum MeasureError {
    #[error(transparent)]
    Signal(#[from] SignalQualityError),

    #[error("shift search failed: {0}")]
    Shift(#[from] ShiftError),
}

/// Raw shift between the two crops of one camera, before side normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftMeasurement {
    pub shift_px: f64,
    pub residual: f64,
    pub curve: CorrelationCurve,
}

/// Verify that a crop contains arc light.
pub fn check_signal(
    crop: ArrayView2<f64>,
    tolerances: &Tolerances,
) -> Result<f64, SignalQualityError> {
    let variance = clipped_sample_variance(crop, tolerances.variance_clip).unwrap_or(0.0);
    if variance < tolerances.min_variance {
        return Err(SignalQualityError::InsufficientSignal {
            variance,
            threshold: tolerances.min_variance,
        });
    }
    Ok(variance)
}

/// Measure how far `second` is shifted relative to `first` along the rows.
///
/// With `check_light` set, both crops must pass [`check_signal`] first.
pub fn measure_shift(
    first: ArrayView2<f64>,
    second: ArrayView2<f64>,
    search: &ShiftSearch,
    tolerances: &Tolerances,
    check_light: bool,
) -> Result<ShiftMeasurement, MeasureError> {
    if check_light {
        let v1 = check_signal(first, tolerances)?;
        let v2 = check_signal(second, tolerances)?;
        debug!("clipped variances {v1:.1} / {v2:.1}");
    }

    let estimate = estimate_shift(first, second, search)?;
    debug!(
        "shift {:.3} px, residual {:.3}",
        estimate.shift, estimate.residual
    );

    if estimate.residual > tolerances.bad_residual {
        return Err(SignalQualityError::Unreliable {
            shift: estimate.shift,
            residual: estimate.residual,
            threshold: tolerances.bad_residual,
        }
        .into());
    }

    Ok(ShiftMeasurement {
        shift_px: estimate.shift,
        residual: estimate.residual,
        curve: estimate.curve,
    })
}
