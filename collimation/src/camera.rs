//! Per-camera analysis: header checks, region extraction, shift, focus.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CameraConfig, CollimationConfig, ConfigError, Rect};
use crate::focus::FocusEstimate;
use crate::frame::{FramePair, HartmannSide};
use crate::header::{validate_header, Bypass, HeaderVerdict};
use crate::measure::{measure_shift, MeasureError, SignalQualityError};
use crate::regions::extract_analysis_region;

/// Per-request switches that change how frames are judged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollimationOptions {
    /// Skip header checks and the light check
    pub no_check_image: bool,
    /// Move the collimator even when a ring adjustment is pending
    pub ignore_residuals: bool,
    /// Request only the ring move needed to reach tolerance
    pub min_ring_correction: bool,
    pub bypass: Vec<Bypass>,
    /// Replaces every camera's configured analysis region
    pub analysis_region: Option<Rect>,
}

/// Why a camera was left out of the decision.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Exclusion {
    #[error("no Hartmann frames received")]
    MissingFrames,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("bad Hartmann door sequence: {0}")]
    DoorSequence(String),

    #[error(transparent)]
    SignalQuality(#[from] SignalQualityError),
}

/// Measurement and focus estimate of a usable camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraAnalysis {
    /// Shift in the left-to-right sense, whatever order the doors were taken in
    pub shift_px: f64,
    pub residual: f64,
    pub focus: FocusEstimate,
}

/// Result of running one camera through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraOutcome {
    pub camera: String,
    pub warnings: Vec<String>,
    /// Checks that failed but were bypassed
    pub bypassed: Vec<String>,
    pub result: Result<CameraAnalysis, Exclusion>,
}

impl CameraOutcome {
    fn excluded(camera: &str, verdict: HeaderVerdict, why: Exclusion) -> Self {
        warn!("{camera}: excluded: {why}");
        Self {
            camera: camera.to_string(),
            warnings: verdict.warnings,
            bypassed: verdict.bypassed,
            result: Err(why),
        }
    }

    pub fn analysis(&self) -> Option<&CameraAnalysis> {
        self.result.as_ref().ok()
    }

    pub fn is_usable(&self) -> bool {
        self.result.is_ok()
    }
}

fn door_order(pair: &FramePair) -> Result<HartmannSide, Exclusion> {
    let first = pair.first.hartmann_side().ok_or_else(|| {
        Exclusion::DoorSequence(format!(
            "cannot determine Hartmann side of exposure {}",
            pair.first.meta().exposure_id
        ))
    })?;
    let second = pair.second.hartmann_side().ok_or_else(|| {
        Exclusion::DoorSequence(format!(
            "cannot determine Hartmann side of exposure {}",
            pair.second.meta().exposure_id
        ))
    })?;

    if first == second {
        return Err(Exclusion::DoorSequence(format!(
            "both exposures taken with the {first:?} door closed"
        )));
    }
    Ok(first)
}

/// Run one camera's frame pair through the full pipeline.
///
/// Signal-quality problems exclude the camera and are reported in the
/// outcome; configuration problems are returned as errors.
pub fn analyze_camera(
    camera: &str,
    camera_config: &CameraConfig,
    pair: Option<&FramePair>,
    config: &CollimationConfig,
    options: &CollimationOptions,
) -> Result<CameraOutcome, ConfigError> {
    let mut verdict = HeaderVerdict::default();

    let Some(pair) = pair else {
        return Ok(CameraOutcome::excluded(camera, verdict, Exclusion::MissingFrames));
    };

    if !options.no_check_image {
        for frame in [&pair.first, &pair.second] {
            verdict.merge(validate_header(
                camera,
                &frame.meta().header,
                config.observatory,
                &options.bypass,
            ));
        }
        if !verdict.is_usable() {
            let mut seen = BTreeSet::new();
            let mut failures = verdict.failures.clone();
            failures.retain(|f| seen.insert(f.clone()));
            let why = Exclusion::InvalidHeader(failures.join("; "));
            return Ok(CameraOutcome::excluded(camera, verdict, why));
        }
    }

    let first_side = match door_order(pair) {
        Ok(side) => side,
        Err(why) => return Ok(CameraOutcome::excluded(camera, verdict, why)),
    };

    let regions = &camera_config.regions;
    let calibration = &camera_config.calibration;
    let first = extract_analysis_region(
        camera,
        &pair.first,
        regions,
        calibration,
        options.analysis_region,
    )?;
    let second = extract_analysis_region(
        camera,
        &pair.second,
        regions,
        calibration,
        options.analysis_region,
    )?;

    let measurement = match measure_shift(
        first.view(),
        second.view(),
        &config.shift_search(),
        &config.tolerances,
        !options.no_check_image,
    ) {
        Ok(m) => m,
        Err(MeasureError::Signal(e)) => {
            return Ok(CameraOutcome::excluded(camera, verdict, e.into()));
        }
        Err(MeasureError::Shift(e)) => {
            return Err(ConfigError::Invalid(format!("{camera}: {e}")));
        }
    };

    let shift_px = match first_side {
        HartmannSide::Left => measurement.shift_px,
        HartmannSide::Right => -measurement.shift_px,
    };

    let focus = FocusEstimate::from_shift(
        camera,
        shift_px,
        calibration,
        config.tolerances.focus_tolerance_px,
    );
    debug!(
        "{camera}: shift {shift_px:.3} px, offset {:.1} steps ({:.3} px), piston {}",
        focus.focus_offset, focus.pixel_offset, focus.piston_steps
    );

    Ok(CameraOutcome {
        camera: camera.to_string(),
        warnings: verdict.warnings,
        bypassed: verdict.bypassed,
        result: Ok(CameraAnalysis {
            shift_px,
            residual: measurement.residual,
            focus,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{compact_config, SimulatedSpectrograph};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn setup(seed: u64) -> (Arc<CollimationConfig>, SimulatedSpectrograph) {
        let config = Arc::new(compact_config());
        let sim = SimulatedSpectrograph::new(config.clone(), seed);
        (config, sim)
    }

    fn run(
        config: &CollimationConfig,
        camera: &str,
        pair: Option<&FramePair>,
        options: &CollimationOptions,
    ) -> CameraOutcome {
        analyze_camera(camera, config.camera(camera).unwrap(), pair, config, options).unwrap()
    }

    #[test]
    fn test_focused_camera_is_in_tolerance() {
        let (config, sim) = setup(1);
        let pair = sim.hartmann_pair("r1").unwrap();
        let outcome = run(&config, "r1", Some(&pair), &CollimationOptions::default());

        let analysis = outcome.analysis().unwrap();
        assert_relative_eq!(analysis.shift_px, sim.true_shift("r1").unwrap(), epsilon = 0.05);
        assert!(analysis.focus.in_tolerance);
        assert!(outcome.warnings.is_empty());
        assert!(outcome.bypassed.is_empty());
    }

    #[test]
    fn test_defocus_recovers_collimator_error() {
        let (config, sim) = setup(2);
        sim.set_collimator("sp1", 5000.0);
        let pair = sim.hartmann_pair("r1").unwrap();
        let outcome = run(&config, "r1", Some(&pair), &CollimationOptions::default());

        let focus = &outcome.analysis().unwrap().focus;
        assert!(!focus.in_tolerance);
        // 0.05 px of shift is about 330 steps on r1
        assert!((focus.piston_steps + 5000).abs() < 330, "piston {}", focus.piston_steps);
    }

    #[test]
    fn test_right_first_is_reported_left_to_right() {
        let (config, sim) = setup(3);
        sim.set_collimator("sp1", -4000.0);
        let expected = sim.true_shift("r1").unwrap();

        sim.set_right_first(true);
        let pair = sim.hartmann_pair("r1").unwrap();
        assert_eq!(pair.first.hartmann_side(), Some(HartmannSide::Right));

        let outcome = run(&config, "r1", Some(&pair), &CollimationOptions::default());
        assert_relative_eq!(outcome.analysis().unwrap().shift_px, expected, epsilon = 0.05);
    }

    #[test]
    fn test_missing_frames() {
        let (config, _) = setup(4);
        let outcome = run(&config, "b1", None, &CollimationOptions::default());
        assert_eq!(outcome.result, Err(Exclusion::MissingFrames));
    }

    #[test]
    fn test_same_door_twice_is_excluded() {
        let (config, sim) = setup(5);
        let pair = sim.hartmann_pair("r1").unwrap();
        let twice = FramePair::new(pair.first.clone(), pair.first);
        let outcome = run(&config, "r1", Some(&twice), &CollimationOptions::default());
        assert!(matches!(outcome.result, Err(Exclusion::DoorSequence(_))));
    }

    #[test]
    fn test_missing_ffs_fails_unless_bypassed() {
        let (config, sim) = setup(6);
        sim.set_header_card("FFS", None);
        let pair = sim.hartmann_pair("r1").unwrap();

        let outcome = run(&config, "r1", Some(&pair), &CollimationOptions::default());
        match &outcome.result {
            Err(Exclusion::InvalidHeader(reason)) => {
                assert!(reason.contains("flat-field screen"), "{reason}");
                // Same failure on both frames is reported once
                assert_eq!(reason.matches("flat-field screen").count(), 1);
            }
            other => panic!("expected header failure, got {other:?}"),
        }

        let options = CollimationOptions {
            bypass: vec![Bypass::Ffs],
            ..CollimationOptions::default()
        };
        let outcome = run(&config, "r1", Some(&pair), &options);
        assert!(outcome.is_usable());
        assert!(!outcome.bypassed.is_empty());
    }

    #[test]
    fn test_lamp_failure_is_not_bypassable() {
        let (config, sim) = setup(7);
        sim.set_header_card("NE", Some("1 1 0 1"));
        let pair = sim.hartmann_pair("b1").unwrap();
        let options = CollimationOptions {
            bypass: vec![Bypass::Ffs],
            ..CollimationOptions::default()
        };
        let outcome = run(&config, "b1", Some(&pair), &options);
        assert!(matches!(outcome.result, Err(Exclusion::InvalidHeader(_))));
    }

    #[test]
    fn test_no_check_image_skips_header_checks() {
        let (config, sim) = setup(8);
        sim.set_header_card("FFS", Some("0 0 0 0 0 0 0 0"));
        let pair = sim.hartmann_pair("r1").unwrap();
        let options = CollimationOptions {
            no_check_image: true,
            ..CollimationOptions::default()
        };
        assert!(run(&config, "r1", Some(&pair), &options).is_usable());
    }

    #[test]
    fn test_dark_camera_has_insufficient_signal() {
        let (config, sim) = setup(9);
        sim.set_lamps_on("b1", false);
        let pair = sim.hartmann_pair("b1").unwrap();
        let outcome = run(&config, "b1", Some(&pair), &CollimationOptions::default());
        assert!(matches!(
            outcome.result,
            Err(Exclusion::SignalQuality(SignalQualityError::InsufficientSignal { .. }))
        ));
    }

    #[test]
    fn test_analysis_region_outside_image_is_config_error() {
        let (config, sim) = setup(10);
        let pair = sim.hartmann_pair("r1").unwrap();
        let options = CollimationOptions {
            analysis_region: Some(Rect::new(200, 260, 0, 100)),
            ..CollimationOptions::default()
        };
        let result = analyze_camera(
            "r1",
            config.camera("r1").unwrap(),
            Some(&pair),
            &config,
            &options,
        );
        assert!(matches!(result, Err(ConfigError::RegionOutOfBounds { .. })));
    }
}
