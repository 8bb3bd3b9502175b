//! Fitting a camera's shift-to-collimator slope from a focus sweep.
//!
//! The collimator is stepped through a range of positions with a left and a
//! right Hartmann exposure at each. The measured offset at a position `p`
//! satisfies `p = m * offset + (b + best_focus_position)`, so a straight-line
//! fit of position against offset yields `m` as its slope.

use std::path::Path;

use hartmann_math::{fit_line, FitError, LineFit};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::{analyze_camera, CollimationOptions};
use crate::config::{CameraCalibration, CollimationConfig, ConfigError};
use crate::frame::{Frame, FramePair};

/// Samples with a larger offset than this are left out of the fit
pub const CALIBRATION_MAX_OFFSET_PX: f64 = 2.0;

/// Collimator positions closer than this count as the same position
const SAME_POSITION_STEPS: f64 = 0.5;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid calibration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("{camera}: only {usable} of {total} samples within {max_offset} px")]
    TooFewSamples {
        camera: String,
        usable: usize,
        total: usize,
        max_offset: f64,
    },
}

/// One measured offset at a known collimator position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub collimator_position: f64,
    pub offset_px: f64,
}

/// Fitted `collimator = slope * offset + intercept` for one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFit {
    pub camera: String,
    /// Collimator steps per pixel of offset; replaces the camera's `m`
    pub slope: f64,
    /// Collimator position at zero offset
    pub intercept: f64,
    /// RMS residual in collimator steps
    pub rms_error: f64,
    pub num_points: usize,
    /// Unix epoch seconds
    pub timestamp: u64,
}

impl CalibrationFit {
    pub fn new(camera: &str, fit: LineFit) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            camera: camera.to_string(),
            slope: fit.slope,
            intercept: fit.intercept,
            rms_error: fit.rms_error,
            num_points: fit.num_points,
            timestamp,
        }
    }

    /// Collimator position of best focus given the camera's offset term `b`
    pub fn best_focus_position(&self, b: f64) -> f64 {
        self.intercept - b
    }

    /// `base` with its slope replaced by the fitted one
    pub fn to_calibration(&self, base: &CameraCalibration) -> CameraCalibration {
        CameraCalibration {
            m: self.slope,
            ..base.clone()
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), CalibrationError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, CalibrationError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn same_position(a: &Frame, b: &Frame) -> bool {
    match (a.meta().collimator_position, b.meta().collimator_position) {
        (Some(pa), Some(pb)) => (pa - pb).abs() < SAME_POSITION_STEPS,
        _ => false,
    }
}

/// Pair consecutive exposures of a sweep.
///
/// Frames are ordered by exposure number. Two neighbours form a pair when
/// they were taken with opposite doors at the same collimator position;
/// anything else is skipped.
pub fn pair_sweep_frames(mut frames: Vec<Frame>) -> Vec<FramePair> {
    frames.sort_by_key(|f| f.meta().exposure_id);

    let mut pairs = Vec::new();
    let mut iter = frames.into_iter().peekable();
    while let Some(first) = iter.next() {
        let matches = iter.peek().is_some_and(|second| {
            let sides = (first.hartmann_side(), second.hartmann_side());
            matches!(sides, (Some(a), Some(b)) if a != b) && same_position(&first, second)
        });

        if matches {
            if let Some(second) = iter.next() {
                pairs.push(FramePair::new(first, second));
            }
        } else {
            debug!(
                "{}: exposure {} has no partner",
                first.camera(),
                first.meta().exposure_id
            );
        }
    }
    pairs
}

/// Measure the offset of every sweep pair. Pairs the pipeline rejects are
/// logged and skipped.
pub fn measure_sweep(
    camera: &str,
    pairs: &[FramePair],
    config: &CollimationConfig,
    options: &CollimationOptions,
) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let camera_config = config.camera(camera)?;

    let mut samples = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let Some(position) = pair.first.meta().collimator_position else {
            warn!(
                "{camera}: exposure {} has no collimator position",
                pair.first.meta().exposure_id
            );
            continue;
        };
        let outcome = analyze_camera(camera, camera_config, Some(pair), config, options)?;
        match outcome.result {
            Ok(analysis) => samples.push(CalibrationSample {
                collimator_position: position,
                offset_px: analysis.shift_px,
            }),
            Err(why) => warn!("{camera}: skipping sample at {position}: {why}"),
        }
    }
    Ok(samples)
}

/// Least-squares fit of position against offset over samples within
/// [`CALIBRATION_MAX_OFFSET_PX`].
pub fn fit_calibration(
    camera: &str,
    samples: &[CalibrationSample],
) -> Result<CalibrationFit, CalibrationError> {
    let (offsets, positions): (Vec<f64>, Vec<f64>) = samples
        .iter()
        .filter(|s| s.offset_px.abs() <= CALIBRATION_MAX_OFFSET_PX)
        .map(|s| (s.offset_px, s.collimator_position))
        .unzip();

    if offsets.len() < 2 {
        return Err(CalibrationError::TooFewSamples {
            camera: camera.to_string(),
            usable: offsets.len(),
            total: samples.len(),
            max_offset: CALIBRATION_MAX_OFFSET_PX,
        });
    }

    let fit = fit_line(&offsets, &positions)?;
    info!(
        "{camera}: slope {:.1} steps/px, intercept {:.1}, rms {:.1} over {} samples",
        fit.slope, fit.intercept, fit.rms_error, fit.num_points
    );
    Ok(CalibrationFit::new(camera, fit))
}
