//! Collimation decision engine.
//!
//! Turns the per-camera measurements of one spectrograph into a single
//! [`CollimationPlan`]. The engine walks through
//!
//! ```text
//! COLLECTING -> ANALYZING -> { NO_MOVE_NEEDED | MOVE_REQUIRED | FAILED | BYPASSED }
//! ```
//!
//! for every request. Cameras are analysed concurrently and joined before the
//! decision. The primary camera (first usable camera in configuration order)
//! sets the piston move; other ring-calibrated cameras get a ring correction
//! relative to it.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::camera::{analyze_camera, CameraOutcome, CollimationOptions};
use crate::config::{CollimationConfig, ConfigError, RingCalibration};
use crate::frame::FramePair;

/// Terminal state of a collimation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    NoMoveNeeded,
    MoveRequired,
    Failed,
    /// A check was bypassed; moves are populated as for `MoveRequired`
    Bypassed,
}

/// Where the engine is in handling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Collecting,
    Analyzing,
    Done(PlanStatus),
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Done(_))
    }
}

/// Collimator piston move for a spectrograph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PistonMove {
    /// Move the primary camera asked for
    pub requested_steps: i64,
    /// Move to issue, clamped to the safety bound
    pub steps: i64,
}

/// Blue-ring rotation for one camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RingMove {
    pub camera: String,
    /// Residual focus error relative to the primary camera, in ring degrees
    pub residual_deg: f64,
    /// Rotation to apply
    pub move_deg: f64,
}

/// Per-camera section of the status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraReport {
    pub camera: String,
    pub usable: bool,
    pub shift_px: Option<f64>,
    pub residual: Option<f64>,
    pub focus_offset: Option<f64>,
    pub pixel_offset: Option<f64>,
    pub in_tolerance: Option<bool>,
    pub piston_steps: Option<i64>,
    pub ring_residual_deg: Option<f64>,
    /// `"OK"` or the ring move to make, for ring-calibrated secondary cameras
    pub ring_message: Option<String>,
    /// Why the camera was excluded
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

impl CameraReport {
    fn from_outcome(outcome: &CameraOutcome) -> Self {
        let analysis = outcome.analysis();
        Self {
            camera: outcome.camera.clone(),
            usable: analysis.is_some(),
            shift_px: analysis.map(|a| a.shift_px),
            residual: analysis.map(|a| a.residual),
            focus_offset: analysis.map(|a| a.focus.focus_offset),
            pixel_offset: analysis.map(|a| a.focus.pixel_offset),
            in_tolerance: analysis.map(|a| a.focus.in_tolerance),
            piston_steps: analysis.map(|a| a.focus.piston_steps),
            ring_residual_deg: None,
            ring_message: None,
            reason: outcome.result.as_ref().err().map(|e| e.to_string()),
            warnings: outcome.warnings.clone(),
        }
    }
}

/// The decision for one spectrograph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollimationPlan {
    pub spectrograph: String,
    pub status: PlanStatus,
    pub piston: Option<PistonMove>,
    pub ring_moves: Vec<RingMove>,
    /// The piston request exceeded the safety bound and was clamped
    pub partial_correction: bool,
    /// Set when the piston move must wait for a ring adjustment
    pub piston_hold: Option<String>,
    /// Failed checks that were let through
    pub bypassed: Vec<String>,
    pub reason: String,
    pub cameras: Vec<CameraReport>,
}

impl CollimationPlan {
    fn failed(spectrograph: &str, reason: String, cameras: Vec<CameraReport>) -> Self {
        Self {
            spectrograph: spectrograph.to_string(),
            status: PlanStatus::Failed,
            piston: None,
            ring_moves: Vec::new(),
            partial_correction: false,
            piston_hold: None,
            bypassed: Vec::new(),
            reason,
            cameras,
        }
    }

    pub fn requires_move(&self) -> bool {
        self.piston.is_some() || !self.ring_moves.is_empty()
    }

    /// Piston steps to command now, unless held for a ring adjustment
    pub fn piston_to_issue(&self) -> Option<i64> {
        match (&self.piston, &self.piston_hold) {
            (Some(p), None) => Some(p.steps),
            _ => None,
        }
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            spectrograph: self.spectrograph.clone(),
            state: EngineState::Done(self.status),
            reason: self.reason.clone(),
            cameras: self.cameras.clone(),
        }
    }
}

/// Serialisable summary for publishing to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub spectrograph: String,
    pub state: EngineState,
    pub reason: String,
    pub cameras: Vec<CameraReport>,
}

impl StatusReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Stateless decision engine over a shared configuration.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: Arc<CollimationConfig>,
}

impl DecisionEngine {
    pub fn new(config: Arc<CollimationConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<CollimationConfig> {
        &self.config
    }

    /// Analyse one spectrograph's frames and decide what to move.
    pub fn analyze(
        &self,
        spectrograph: &str,
        frames: &BTreeMap<String, FramePair>,
        options: &CollimationOptions,
    ) -> CollimationPlan {
        self.analyze_observed(spectrograph, frames, options, |_| {})
    }

    /// Like [`analyze`](Self::analyze), reporting every state transition to `observe`.
    pub fn analyze_observed(
        &self,
        spectrograph: &str,
        frames: &BTreeMap<String, FramePair>,
        options: &CollimationOptions,
        mut observe: impl FnMut(EngineState),
    ) -> CollimationPlan {
        observe(EngineState::Collecting);

        let plan = match self.run(spectrograph, frames, options, &mut observe) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("{spectrograph}: configuration error: {e}");
                CollimationPlan::failed(
                    spectrograph,
                    format!("configuration error: {e}"),
                    Vec::new(),
                )
            }
        };

        info!("{spectrograph}: {:?}: {}", plan.status, plan.reason);
        observe(EngineState::Done(plan.status));
        plan
    }

    fn run(
        &self,
        spectrograph: &str,
        frames: &BTreeMap<String, FramePair>,
        options: &CollimationOptions,
        observe: &mut impl FnMut(EngineState),
    ) -> Result<CollimationPlan, ConfigError> {
        let spec = self.config.spectrograph(spectrograph)?;

        for camera in frames.keys() {
            if !spec.cameras.contains(camera) {
                warn!("{spectrograph}: ignoring frames from camera {camera}");
            }
        }

        let jobs = spec
            .cameras
            .iter()
            .map(|camera| Ok((camera.as_str(), self.config.camera(camera)?, frames.get(camera))))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        observe(EngineState::Analyzing);

        let outcomes = jobs
            .into_par_iter()
            .map(|(camera, camera_config, pair)| {
                analyze_camera(camera, camera_config, pair, &self.config, options)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(self.decide(spectrograph, &outcomes, options))
    }

    /// Aggregate per-camera outcomes, given in configuration order, into a plan.
    pub fn decide(
        &self,
        spectrograph: &str,
        outcomes: &[CameraOutcome],
        options: &CollimationOptions,
    ) -> CollimationPlan {
        let tol = &self.config.tolerances;
        let mut reports: Vec<CameraReport> =
            outcomes.iter().map(CameraReport::from_outcome).collect();

        let usable: Vec<(usize, &CameraOutcome)> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_usable())
            .collect();

        let Some(&(_, primary_outcome)) = usable.first() else {
            let reasons: Vec<String> = reports
                .iter()
                .map(|r| format!("{}: {}", r.camera, r.reason.as_deref().unwrap_or("excluded")))
                .collect();
            return CollimationPlan::failed(
                spectrograph,
                format!("no usable cameras ({})", reasons.join("; ")),
                reports,
            );
        };

        let Some(primary) = primary_outcome.analysis() else {
            return CollimationPlan::failed(spectrograph, "primary camera lost".into(), reports);
        };

        if usable.len() < outcomes.len() {
            warn!(
                "{spectrograph}: calculating collimator move from {} only",
                usable
                    .iter()
                    .map(|(_, o)| o.camera.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let bypassed: Vec<String> = usable
            .iter()
            .flat_map(|(_, o)| o.bypassed.iter().cloned())
            .collect();

        let out_of_tolerance: Vec<&CameraOutcome> = usable
            .iter()
            .map(|(_, o)| *o)
            .filter(|o| o.analysis().is_some_and(|a| !a.focus.in_tolerance))
            .collect();

        let mut plan = CollimationPlan {
            spectrograph: spectrograph.to_string(),
            status: PlanStatus::NoMoveNeeded,
            piston: None,
            ring_moves: Vec::new(),
            partial_correction: false,
            piston_hold: None,
            bypassed: Vec::new(),
            reason: String::new(),
            cameras: Vec::new(),
        };

        let requested = primary.focus.piston_steps;

        // Ring residuals need a second camera to compare against
        if usable.len() >= 2 {
            for &(idx, outcome) in usable.iter().skip(1) {
                let (Some(analysis), RingCalibration::Steps { steps_per_degree }) =
                    (outcome.analysis(), self.ring_of(&outcome.camera))
                else {
                    continue;
                };

                let residual =
                    -((analysis.focus.piston_steps - requested) as f64) / steps_per_degree;
                reports[idx].ring_residual_deg = Some(residual);

                if residual.abs() < tol.ring_tolerance_deg {
                    reports[idx].ring_message = Some("OK".to_string());
                    continue;
                }

                let move_deg = if options.min_ring_correction {
                    2.0 * (residual - residual.signum() * tol.ring_tolerance_deg)
                } else {
                    2.0 * residual
                };
                reports[idx].ring_message = Some(format!(
                    "move {} ring {move_deg:.1} degrees{}",
                    outcome.camera,
                    if options.min_ring_correction {
                        " (minimum move to reach tolerance)"
                    } else {
                        ""
                    }
                ));
                plan.ring_moves.push(RingMove {
                    camera: outcome.camera.clone(),
                    residual_deg: residual,
                    move_deg,
                });
            }
        }

        if out_of_tolerance.is_empty() {
            plan.ring_moves.clear();
            plan.reason = format!(
                "all usable cameras within {:.2} px focus tolerance",
                tol.focus_tolerance_px
            );
        } else {
            plan.status = PlanStatus::MoveRequired;

            let max = tol.max_collimator_move;
            let steps = requested.clamp(-max, max);
            plan.partial_correction = requested.abs() > max;
            if steps != 0 {
                plan.piston = Some(PistonMove {
                    requested_steps: requested,
                    steps,
                });
            }

            let worst: Vec<String> = out_of_tolerance
                .iter()
                .filter_map(|o| {
                    o.analysis()
                        .map(|a| format!("{} offset {:.2} px", o.camera, a.focus.pixel_offset))
                })
                .collect();
            plan.reason = format!(
                "{} outside {:.2} px tolerance; piston {} steps from {}",
                worst.join(", "),
                tol.focus_tolerance_px,
                requested,
                primary_outcome.camera
            );
            if plan.partial_correction {
                plan.reason
                    .push_str(&format!(", clamped to {steps} (partial correction)"));
                warn!("{spectrograph}: piston {requested} exceeds safety bound, clamped to {steps}");
            }

            if !plan.ring_moves.is_empty() {
                let rings: Vec<String> = plan
                    .ring_moves
                    .iter()
                    .map(|r| format!("{} {:.1} deg", r.camera, r.move_deg))
                    .collect();
                plan.reason.push_str(&format!("; ring moves: {}", rings.join(", ")));

                if options.ignore_residuals {
                    warn!("{spectrograph}: adjusting collimator despite ring residuals");
                } else if plan.piston.is_some() {
                    plan.piston_hold = Some(format!(
                        "not moving the collimator until the ring has been adjusted ({})",
                        rings.join(", ")
                    ));
                }
            }
        }

        if !bypassed.is_empty() {
            plan.status = PlanStatus::Bypassed;
            plan.reason = format!("checks bypassed ({}); {}", bypassed.join("; "), plan.reason);
        }

        plan.bypassed = bypassed;
        plan.cameras = reports;
        plan
    }

    fn ring_of(&self, camera: &str) -> RingCalibration {
        self.config
            .cameras
            .get(camera)
            .map(|c| c.calibration.ring)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraAnalysis, Exclusion};
    use crate::focus::FocusEstimate;
    use crate::measure::SignalQualityError;
    use approx::assert_relative_eq;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(Arc::new(CollimationConfig::builtin_apo().unwrap()))
    }

    fn usable(engine: &DecisionEngine, camera: &str, shift_px: f64) -> CameraOutcome {
        let cal = &engine.config().camera(camera).unwrap().calibration;
        let tol = engine.config().tolerances.focus_tolerance_px;
        CameraOutcome {
            camera: camera.to_string(),
            warnings: vec![],
            bypassed: vec![],
            result: Ok(CameraAnalysis {
                shift_px,
                residual: 0.0,
                focus: FocusEstimate::from_shift(camera, shift_px, cal, tol),
            }),
        }
    }

    fn excluded(camera: &str) -> CameraOutcome {
        CameraOutcome {
            camera: camera.to_string(),
            warnings: vec![],
            bypassed: vec![],
            result: Err(Exclusion::SignalQuality(
                SignalQualityError::InsufficientSignal {
                    variance: 3.0,
                    threshold: 100.0,
                },
            )),
        }
    }

    /// Shift that puts `camera` exactly `steps` collimator steps from focus
    fn shift_for_offset(engine: &DecisionEngine, camera: &str, steps: f64) -> f64 {
        let cal = &engine.config().camera(camera).unwrap().calibration;
        (steps - cal.b) / cal.m
    }

    #[test]
    fn test_in_focus_needs_no_move() {
        let e = engine();
        let outcomes = vec![
            usable(&e, "r1", shift_for_offset(&e, "r1", 100.0)),
            usable(&e, "b1", shift_for_offset(&e, "b1", 150.0)),
        ];
        let plan = e.decide("sp1", &outcomes, &CollimationOptions::default());

        assert_eq!(plan.status, PlanStatus::NoMoveNeeded);
        assert!(!plan.requires_move());
        assert_eq!(plan.cameras[1].ring_message.as_deref(), Some("OK"));
    }

    #[test]
    fn test_large_shift_is_clamped() {
        let e = engine();
        let outcomes = vec![usable(&e, "r1", 2.0), usable(&e, "b1", 2.0)];
        let plan = e.decide(
            "sp1",
            &outcomes,
            &CollimationOptions {
                ignore_residuals: true,
                ..Default::default()
            },
        );

        assert_eq!(plan.status, PlanStatus::MoveRequired);
        let piston = plan.piston.unwrap();
        assert_eq!(piston.requested_steps, 11874);
        assert_eq!(piston.steps, 10000);
        assert!(plan.partial_correction);
        assert!(plan.reason.contains("partial correction"));
        assert_eq!(plan.piston_to_issue(), Some(10000));
    }

    #[test]
    fn test_primary_camera_is_authoritative() {
        let e = engine();
        let outcomes = vec![
            usable(&e, "r1", shift_for_offset(&e, "r1", -3000.5)),
            usable(&e, "b1", shift_for_offset(&e, "b1", -3200.5)),
        ];
        let plan = e.decide("sp1", &outcomes, &CollimationOptions::default());

        assert_eq!(plan.piston.unwrap().requested_steps, 3000);
        // b1 asks for 3200: residual -(3200 - 3000) / 292 is within 2 degrees
        assert!(plan.ring_moves.is_empty());
        assert_relative_eq!(
            plan.cameras[1].ring_residual_deg.unwrap(),
            -200.0 / 292.0,
            epsilon = 0.01
        );
        assert!(plan.piston_hold.is_none());
    }

    #[test]
    fn test_ring_move_holds_piston() {
        let e = engine();
        let outcomes = vec![
            usable(&e, "r1", shift_for_offset(&e, "r1", -3000.5)),
            usable(&e, "b1", shift_for_offset(&e, "b1", -4000.5)),
        ];
        let plan = e.decide("sp1", &outcomes, &CollimationOptions::default());

        assert_eq!(plan.status, PlanStatus::MoveRequired);
        assert_eq!(plan.ring_moves.len(), 1);
        let ring = &plan.ring_moves[0];
        assert_eq!(ring.camera, "b1");
        assert_relative_eq!(ring.residual_deg, -1000.0 / 292.0, epsilon = 0.01);
        assert_relative_eq!(ring.move_deg, 2.0 * ring.residual_deg, epsilon = 1e-12);
        assert!(plan.piston_hold.is_some());
        assert_eq!(plan.piston_to_issue(), None);
    }

    #[test]
    fn test_minimum_ring_correction() {
        let e = engine();
        let outcomes = vec![
            usable(&e, "r1", shift_for_offset(&e, "r1", -3000.5)),
            usable(&e, "b1", shift_for_offset(&e, "b1", -4000.5)),
        ];
        let plan = e.decide(
            "sp1",
            &outcomes,
            &CollimationOptions {
                min_ring_correction: true,
                ignore_residuals: true,
                ..Default::default()
            },
        );

        let ring = &plan.ring_moves[0];
        assert_relative_eq!(ring.move_deg, 2.0 * (ring.residual_deg + 2.0), epsilon = 1e-12);
        assert_eq!(plan.piston_to_issue(), Some(3000));
    }

    #[test]
    fn test_single_usable_camera_gets_no_ring_move() {
        let e = engine();
        let outcomes = vec![
            excluded("r1"),
            usable(&e, "b1", shift_for_offset(&e, "b1", -4000.5)),
        ];
        let plan = e.decide("sp1", &outcomes, &CollimationOptions::default());

        assert_eq!(plan.status, PlanStatus::MoveRequired);
        assert!(plan.ring_moves.is_empty());
        assert_eq!(plan.piston.unwrap().requested_steps, 4000);
        assert!(plan.cameras[0].reason.as_ref().unwrap().contains("insufficient signal"));
    }

    #[test]
    fn test_all_excluded_fails_with_reasons() {
        let e = engine();
        let plan = e.decide(
            "sp1",
            &[excluded("r1"), excluded("b1")],
            &CollimationOptions::default(),
        );

        assert_eq!(plan.status, PlanStatus::Failed);
        assert!(plan.reason.contains("r1: insufficient signal"));
        assert!(plan.reason.contains("b1: insufficient signal"));
        assert!(!plan.requires_move());
    }

    #[test]
    fn test_bypass_marks_plan() {
        let e = engine();
        let mut r1 = usable(&e, "r1", 1.0);
        r1.bypassed.push("r1: flat-field screen state (FFS) not in header".into());
        let plan = e.decide("sp1", &[r1, excluded("b1")], &CollimationOptions::default());

        assert_eq!(plan.status, PlanStatus::Bypassed);
        assert!(plan.piston.is_some());
        assert!(plan.reason.starts_with("checks bypassed"));
    }

    #[test]
    fn test_unknown_spectrograph_fails() {
        let e = engine();
        let plan = e.analyze("sp7", &BTreeMap::new(), &CollimationOptions::default());
        assert_eq!(plan.status, PlanStatus::Failed);
        assert!(plan.reason.contains("unknown spectrograph"));
    }

    #[test]
    fn test_missing_frames_fail_every_camera() {
        let e = engine();
        let mut states = Vec::new();
        let plan = e.analyze_observed(
            "sp2",
            &BTreeMap::new(),
            &CollimationOptions::default(),
            |s| states.push(s),
        );

        assert_eq!(plan.status, PlanStatus::Failed);
        assert!(plan.reason.contains("no Hartmann frames"));
        assert_eq!(
            states,
            vec![
                EngineState::Collecting,
                EngineState::Analyzing,
                EngineState::Done(PlanStatus::Failed)
            ]
        );
    }

    #[test]
    fn test_status_report_serializes() {
        let e = engine();
        let plan = e.decide(
            "sp1",
            &[usable(&e, "r1", 2.0), excluded("b1")],
            &CollimationOptions::default(),
        );
        let json = plan.status_report().to_json().unwrap();
        assert!(json.contains("MOVE_REQUIRED"));
        assert!(json.contains("\"camera\": \"b1\""));
    }
}
