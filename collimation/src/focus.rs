//! Conversion from Hartmann shift to collimator focus error.

use serde::Serialize;

use crate::config::{CameraCalibration, RingCalibration};

/// `m * shift + b`, in collimator steps
pub fn focus_offset(calibration: &CameraCalibration, shift_px: f64) -> f64 {
    calibration.m * shift_px + calibration.b
}

/// Focus error of one camera and the moves that would cancel it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusEstimate {
    pub camera: String,
    pub shift_px: f64,
    /// Focus error in collimator steps
    pub focus_offset: f64,
    /// Focus error expressed as Hartmann shift, `focus_offset / m`
    pub pixel_offset: f64,
    /// Collimator move that cancels the error, truncated to whole steps
    pub piston_steps: i64,
    pub in_tolerance: bool,
    /// Ring rotation equivalent to `piston_steps`, for ring-calibrated cameras
    pub ring_degrees: Option<f64>,
}

impl FocusEstimate {
    pub fn from_shift(
        camera: &str,
        shift_px: f64,
        calibration: &CameraCalibration,
        focus_tolerance_px: f64,
    ) -> Self {
        let offset = focus_offset(calibration, shift_px);
        let pixel_offset = offset / calibration.m;
        let piston_steps = -(offset.trunc() as i64);

        let ring_degrees = match calibration.ring {
            RingCalibration::None => None,
            RingCalibration::Steps { steps_per_degree } => {
                Some(-(piston_steps as f64) / steps_per_degree)
            }
        };

        Self {
            camera: camera.to_string(),
            shift_px,
            focus_offset: offset,
            pixel_offset,
            piston_steps,
            in_tolerance: pixel_offset.abs() <= focus_tolerance_px,
            ring_degrees,
        }
    }
}
