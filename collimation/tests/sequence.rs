use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use collimation::engine::EngineState;
use collimation::simulation::{compact_config, MotorCommand, SimulatedSpectrograph};
use collimation::{
    AbortSignal, AcquisitionError, AcquisitionRequest, Bypass, CollimationOptions,
    CollimationSequence, CollimatorInterface, ConfigError, DecisionEngine, FramePair,
    FrameSource, MotorError, MoveGates, PlanStatus, SequenceError, SequenceOptions,
    SequenceOutcome, SequenceStatus,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

fn setup(seed: u64) -> (DecisionEngine, SimulatedSpectrograph) {
    let config = Arc::new(compact_config());
    let sim = SimulatedSpectrograph::new(config.clone(), seed);
    (DecisionEngine::new(config), sim)
}

fn take(sim: &mut SimulatedSpectrograph, cameras: &[&str]) -> BTreeMap<String, FramePair> {
    let request = AcquisitionRequest {
        spectrograph: "sp1".into(),
        cameras: cameras.iter().map(|c| c.to_string()).collect(),
        exposure_time: 4.0,
        lamps: vec!["Ne".into(), "HgCd".into()],
        sub_frame: None,
    };
    sim.take_hartmanns(&request).unwrap()
}

fn run_sequence(
    engine: DecisionEngine,
    sim: &SimulatedSpectrograph,
    options: SequenceOptions,
) -> (Result<SequenceOutcome, SequenceError>, Vec<collimation::CycleReport>) {
    let gates = MoveGates::new();
    let handle = CollimationSequence::new(engine, "sp1", sim.clone(), sim.clone(), options)
        .spawn(&gates)
        .unwrap();
    let reports: Vec<_> = handle.results().iter().collect();
    (handle.join(), reports)
}

#[test]
fn test_sequence_converges() {
    let (engine, sim) = setup(1);
    sim.set_collimator("sp1", 8000.0);
    sim.set_best_position("b1", 300.0);

    let (outcome, reports) = run_sequence(engine, &sim, SequenceOptions::default());
    let outcome = outcome.unwrap();

    match &outcome {
        SequenceOutcome::Converged { cycles, plan } => {
            assert_eq!(*cycles, 2);
            assert_eq!(plan.status, PlanStatus::NoMoveNeeded);
        }
        other => panic!("expected convergence, got {other:?}"),
    }

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].plan.status, PlanStatus::MoveRequired);
    assert!(reports[0].moved);
    assert!(!reports[1].moved);

    // One piston move, no ring move: the blue camera is within ring tolerance
    let commands = sim.commands();
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0], MotorCommand::Piston { .. }));
    assert!(sim.focus_error("r1").unwrap().abs() < 400.0);
}

#[test]
fn test_identical_frames_give_identical_plans() {
    let (engine, mut sim) = setup(2);
    sim.set_collimator("sp1", 4500.0);
    let frames = take(&mut sim, &["r1", "b1"]);

    let options = CollimationOptions::default();
    let first = engine.analyze("sp1", &frames, &options);
    let second = engine.analyze("sp1", &frames, &options);
    assert_eq!(first, second);
    assert_eq!(first.status, PlanStatus::MoveRequired);
}

#[test]
fn test_engine_reports_state_transitions() {
    let (engine, mut sim) = setup(3);
    let frames = take(&mut sim, &["r1", "b1"]);

    let mut states = Vec::new();
    let plan = engine.analyze_observed("sp1", &frames, &CollimationOptions::default(), |s| {
        states.push(s)
    });
    assert_eq!(plan.status, PlanStatus::NoMoveNeeded);
    assert_eq!(
        states,
        vec![
            EngineState::Collecting,
            EngineState::Analyzing,
            EngineState::Done(PlanStatus::NoMoveNeeded),
        ]
    );
    assert!(plan.status_report().to_json().unwrap().contains("NO_MOVE_NEEDED"));
}

#[test]
fn test_large_error_is_clamped() {
    let (engine, mut sim) = setup(4);
    sim.set_collimator("sp1", 10300.0);
    let frames = take(&mut sim, &["r1", "b1"]);

    let plan = engine.analyze("sp1", &frames, &CollimationOptions::default());
    assert_eq!(plan.status, PlanStatus::MoveRequired);
    assert!(plan.partial_correction);
    assert!(plan.reason.contains("partial correction"));

    let piston = plan.piston.unwrap();
    assert_eq!(piston.steps, -10000);
    assert!(piston.requested_steps < -10000);
    assert!(plan.ring_moves.is_empty());
}

#[test]
fn test_clamped_move_is_issued_as_clamped() {
    let (engine, sim) = setup(5);
    sim.set_collimator("sp1", 10300.0);
    let options = SequenceOptions {
        max_cycles: 1,
        ..SequenceOptions::default()
    };

    let (outcome, _) = run_sequence(engine, &sim, options);
    assert!(matches!(
        outcome.unwrap(),
        SequenceOutcome::CyclesExhausted { cycles: 1, .. }
    ));
    assert_eq!(
        sim.commands(),
        vec![MotorCommand::Piston {
            spectrograph: "sp1".into(),
            steps: -10000
        }]
    );
    assert_relative_eq!(sim.collimator("sp1").unwrap(), 300.0);
}

#[test]
fn test_single_usable_camera_never_moves_rings() {
    let (engine, mut sim) = setup(6);
    sim.set_collimator("sp1", 3000.0);
    // A blue camera this far off would need a ring move if it were usable
    sim.set_best_position("b1", 2500.0);
    sim.set_lamps_on("b1", false);
    let frames = take(&mut sim, &["r1", "b1"]);

    let plan = engine.analyze("sp1", &frames, &CollimationOptions::default());
    assert_eq!(plan.status, PlanStatus::MoveRequired);
    assert!(plan.ring_moves.is_empty());
    assert!(plan.piston_hold.is_none());

    let b1 = plan.cameras.iter().find(|c| c.camera == "b1").unwrap();
    assert!(!b1.usable);
    assert!(b1.reason.as_deref().unwrap().contains("insufficient signal"));
}

#[test]
fn test_missing_camera_leaves_other_in_charge() {
    let (engine, mut sim) = setup(7);
    sim.set_collimator("sp1", -3000.0);
    sim.set_camera_enabled("r1", false);
    let frames = take(&mut sim, &["r1", "b1"]);

    let plan = engine.analyze("sp1", &frames, &CollimationOptions::default());
    assert_eq!(plan.status, PlanStatus::MoveRequired);
    let piston = plan.piston.unwrap();
    assert!((piston.steps - 3000).abs() < 300, "piston {}", piston.steps);

    let r1 = plan.cameras.iter().find(|c| c.camera == "r1").unwrap();
    assert_eq!(r1.reason.as_deref(), Some("no Hartmann frames received"));
}

#[test]
fn test_all_cameras_dark_fails() {
    let (engine, mut sim) = setup(8);
    sim.set_lamps_on("r1", false);
    sim.set_lamps_on("b1", false);
    let frames = take(&mut sim, &["r1", "b1"]);

    let plan = engine.analyze("sp1", &frames, &CollimationOptions::default());
    assert_eq!(plan.status, PlanStatus::Failed);
    assert!(plan.reason.contains("no usable cameras"));
    assert!(plan.piston.is_none());
}

#[test]
fn test_ffs_bypass() {
    let (engine, mut sim) = setup(9);
    sim.set_collimator("sp1", 4000.0);
    sim.set_header_card("FFS", Some("garbage"));
    let frames = take(&mut sim, &["r1", "b1"]);

    let plan = engine.analyze("sp1", &frames, &CollimationOptions::default());
    assert_eq!(plan.status, PlanStatus::Failed);
    assert!(plan.reason.contains("flat-field screen"), "{}", plan.reason);

    let options = CollimationOptions {
        bypass: vec![Bypass::Ffs],
        ..CollimationOptions::default()
    };
    let plan = engine.analyze("sp1", &frames, &options);
    assert_eq!(plan.status, PlanStatus::Bypassed);
    assert!(plan.piston.is_some());
    assert!(!plan.bypassed.is_empty());
}

#[test]
fn test_ring_move_holds_piston_until_next_cycle() {
    let (engine, sim) = setup(10);
    sim.set_collimator("sp1", 3000.0);
    sim.set_best_position("b1", 1500.0);

    let (outcome, reports) = run_sequence(engine, &sim, SequenceOptions::default());
    assert!(matches!(
        outcome.unwrap(),
        SequenceOutcome::Converged { cycles: 3, .. }
    ));

    let first = &reports[0].plan;
    assert_eq!(first.ring_moves.len(), 1);
    assert!(first.piston_hold.is_some());
    assert_eq!(first.piston_to_issue(), None);

    let commands = sim.commands();
    assert!(matches!(&commands[0], MotorCommand::Ring { camera, .. } if camera == "b1"));
    assert!(matches!(&commands[1], MotorCommand::Piston { .. }));

    // 1500 steps of blue-camera error is about 10.3 degrees of ring
    assert_relative_eq!(sim.ring("b1").unwrap(), -1500.0 / 146.0, epsilon = 1.5);
    assert!(sim.focus_error("b1").unwrap().abs() < 800.0);
}

#[test]
fn test_ignore_residuals_moves_both() {
    let (engine, mut sim) = setup(11);
    sim.set_collimator("sp1", 3000.0);
    sim.set_best_position("b1", 1500.0);
    let frames = take(&mut sim, &["r1", "b1"]);

    let options = CollimationOptions {
        ignore_residuals: true,
        ..CollimationOptions::default()
    };
    let plan = engine.analyze("sp1", &frames, &options);
    assert_eq!(plan.ring_moves.len(), 1);
    assert!(plan.piston_hold.is_none());
    assert!(plan.piston_to_issue().is_some());
}

#[test]
fn test_analysis_only_moves_nothing() {
    let (engine, sim) = setup(12);
    sim.set_collimator("sp1", 6000.0);
    let options = SequenceOptions {
        move_motors: false,
        ..SequenceOptions::default()
    };

    let (outcome, reports) = run_sequence(engine, &sim, options);
    match outcome.unwrap() {
        SequenceOutcome::AnalysisOnly { plan } => assert!(plan.requires_move()),
        other => panic!("expected analysis only, got {other:?}"),
    }
    assert_eq!(reports.len(), 1);
    assert!(sim.commands().is_empty());
}

#[test]
fn test_failed_analysis_ends_sequence() {
    let (engine, sim) = setup(13);
    sim.set_header_card("NE", Some("0 0 0 0"));

    let (outcome, reports) = run_sequence(engine, &sim, SequenceOptions::default());
    match outcome.unwrap() {
        SequenceOutcome::Failed { cycles, plan } => {
            assert_eq!(cycles, 1);
            assert!(plan.reason.contains("Ne"), "{}", plan.reason);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(reports.len(), 1);
    assert!(sim.commands().is_empty());
}

#[test]
fn test_motor_fault_stops_sequence() {
    let (engine, sim) = setup(14);
    sim.set_collimator("sp1", 6000.0);
    sim.set_motor_fault(Some("limit switch"));

    let (outcome, reports) = run_sequence(engine, &sim, SequenceOptions::default());
    assert!(matches!(outcome, Err(SequenceError::Motor(_))));
    assert!(reports.is_empty());
}

/// Frame source that raises the abort signal on a chosen acquisition.
struct AbortingSource {
    inner: SimulatedSpectrograph,
    abort: AbortSignal,
    abort_on: usize,
    taken: usize,
}

impl FrameSource for AbortingSource {
    fn take_hartmanns(
        &mut self,
        request: &AcquisitionRequest,
    ) -> Result<BTreeMap<String, FramePair>, AcquisitionError> {
        self.taken += 1;
        let frames = self.inner.take_hartmanns(request)?;
        if self.taken == self.abort_on {
            self.abort.abort();
        }
        Ok(frames)
    }
}

#[test]
fn test_abort_discards_plan_and_issues_no_move() {
    let (engine, sim) = setup(15);
    sim.set_collimator("sp1", 6000.0);

    let gates = MoveGates::new();
    let abort = AbortSignal::new(gates.gate("sp1"));
    let source = AbortingSource {
        inner: sim.clone(),
        abort: abort.clone(),
        abort_on: 1,
        taken: 0,
    };
    let status = Mutex::new(SequenceStatus {
        cycle: 0,
        state: EngineState::Collecting,
    });
    let (tx, rx) = unbounded();

    let result =
        CollimationSequence::new(engine, "sp1", source, sim.clone(), SequenceOptions::default())
            .run(&abort, &status, &tx);

    assert!(matches!(result, Err(SequenceError::Aborted { cycles: 0 })));
    assert!(rx.try_recv().is_err());
    assert!(sim.commands().is_empty());
}

#[test]
fn test_abort_in_second_cycle_keeps_first_cycle_moves() {
    let (engine, sim) = setup(16);
    sim.set_collimator("sp1", 3000.0);
    sim.set_best_position("b1", 1500.0);

    let gates = MoveGates::new();
    let abort = AbortSignal::new(gates.gate("sp1"));
    let source = AbortingSource {
        inner: sim.clone(),
        abort: abort.clone(),
        abort_on: 2,
        taken: 0,
    };
    let status = Mutex::new(SequenceStatus {
        cycle: 0,
        state: EngineState::Collecting,
    });
    let (tx, rx) = unbounded();

    let result =
        CollimationSequence::new(engine, "sp1", source, sim.clone(), SequenceOptions::default())
            .run(&abort, &status, &tx);

    assert!(matches!(result, Err(SequenceError::Aborted { cycles: 1 })));
    assert_eq!(rx.try_iter().count(), 1);
    // Only the first cycle's ring move went out
    assert_eq!(sim.commands().len(), 1);
    assert_eq!(status.lock().unwrap().cycle, 2);
}

/// Motors that block inside a piston move until released.
struct BlockingMotors {
    inner: SimulatedSpectrograph,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl CollimatorInterface for BlockingMotors {
    fn move_piston(&mut self, spectrograph: &str, steps: i64) -> Result<(), MotorError> {
        self.entered.send(()).ok();
        self.release
            .recv()
            .map_err(|_| MotorError("released without a signal".into()))?;
        self.inner.move_piston(spectrograph, steps)
    }

    fn move_ring(&mut self, camera: &str, degrees: f64) -> Result<(), MotorError> {
        self.inner.move_ring(camera, degrees)
    }
}

#[test]
fn test_move_in_flight_blocks_other_moves_and_survives_abort() {
    let (engine, sim) = setup(17);
    sim.set_collimator("sp1", 6000.0);

    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let motors = BlockingMotors {
        inner: sim.clone(),
        entered: entered_tx,
        release: release_rx,
    };

    let gates = MoveGates::new();
    let handle =
        CollimationSequence::new(engine, "sp1", sim.clone(), motors, SequenceOptions::default())
            .spawn(&gates)
            .unwrap();

    entered_rx.recv().unwrap();
    let gate = gates.gate("sp1");
    assert!(gate.is_busy());
    assert_eq!(handle.status().cycle, 1);

    // A second controller of the same spectrograph is refused
    let other = AbortSignal::new(gate.clone());
    assert!(matches!(gate.begin(&other), Err(SequenceError::MoveInFlight(_))));

    // Abort while the move runs: the move completes, nothing further is issued
    handle.abort();
    release_tx.send(()).unwrap();

    let reports: Vec<_> = handle.results().iter().collect();
    let result = handle.join();
    assert!(matches!(result, Err(SequenceError::Aborted { cycles: 1 })));
    assert_eq!(reports.len(), 1);
    assert!(reports[0].moved);
    assert_eq!(sim.commands().len(), 1);
    assert!(sim.collimator("sp1").unwrap().abs() < 400.0);
    assert!(!gate.is_busy());
}

/// Frame source that records every acquisition request.
struct RecordingSource {
    inner: SimulatedSpectrograph,
    requests: Arc<Mutex<Vec<AcquisitionRequest>>>,
}

impl FrameSource for RecordingSource {
    fn take_hartmanns(
        &mut self,
        request: &AcquisitionRequest,
    ) -> Result<BTreeMap<String, FramePair>, AcquisitionError> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.take_hartmanns(request)
    }
}

#[test]
fn test_unknown_spectrograph_fails_before_acquiring() {
    let (engine, sim) = setup(18);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let source = RecordingSource {
        inner: sim.clone(),
        requests: requests.clone(),
    };

    let gates = MoveGates::new();
    let handle =
        CollimationSequence::new(engine, "sp9", source, sim.clone(), SequenceOptions::default())
            .spawn(&gates)
            .unwrap();
    let reports: Vec<_> = handle.results().iter().collect();

    match handle.join() {
        Err(SequenceError::Config(ConfigError::UnknownSpectrograph(id))) => assert_eq!(id, "sp9"),
        other => panic!("expected a configuration error, got {other:?}"),
    }
    assert!(reports.is_empty());
    assert!(requests.lock().unwrap().is_empty());
    assert!(sim.commands().is_empty());
}

#[test]
fn test_acquisition_uses_configured_exposure() {
    let (engine, sim) = setup(19);
    sim.set_collimator("sp1", 200.0);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let source = RecordingSource {
        inner: sim.clone(),
        requests: requests.clone(),
    };
    let expected = engine.config().spectrograph("sp1").unwrap().clone();

    let gates = MoveGates::new();
    let handle =
        CollimationSequence::new(engine, "sp1", source, sim.clone(), SequenceOptions::default())
            .spawn(&gates)
            .unwrap();
    handle.join().unwrap();

    let requests = requests.lock().unwrap();
    assert!(!requests.is_empty());
    assert_eq!(requests[0].cameras, expected.cameras);
    assert_eq!(requests[0].exposure_time, expected.exposure_time);
    assert_eq!(requests[0].sub_frame, None);
}

/// Motors that raise the abort signal once a ring move has gone out.
struct AbortAfterRing {
    inner: SimulatedSpectrograph,
    abort: AbortSignal,
}

impl CollimatorInterface for AbortAfterRing {
    fn move_piston(&mut self, spectrograph: &str, steps: i64) -> Result<(), MotorError> {
        self.inner.move_piston(spectrograph, steps)
    }

    fn move_ring(&mut self, camera: &str, degrees: f64) -> Result<(), MotorError> {
        self.inner.move_ring(camera, degrees)?;
        self.abort.abort();
        Ok(())
    }
}

#[test]
fn test_abort_mid_plan_reports_partial_cycle() {
    let (engine, sim) = setup(11);
    sim.set_collimator("sp1", 3000.0);
    sim.set_best_position("b1", 1500.0);

    let gates = MoveGates::new();
    let abort = AbortSignal::new(gates.gate("sp1"));
    let motors = AbortAfterRing {
        inner: sim.clone(),
        abort: abort.clone(),
    };
    let options = SequenceOptions {
        collimation: CollimationOptions {
            ignore_residuals: true,
            ..CollimationOptions::default()
        },
        ..SequenceOptions::default()
    };
    let status = Mutex::new(SequenceStatus {
        cycle: 0,
        state: EngineState::Collecting,
    });
    let (tx, rx) = unbounded();

    let result = CollimationSequence::new(engine, "sp1", sim.clone(), motors, options)
        .run(&abort, &status, &tx);

    // The ring move reached the hardware, so the cycle counts and is reported
    assert!(matches!(result, Err(SequenceError::Aborted { cycles: 1 })));
    let reports: Vec<_> = rx.try_iter().collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].cycle, 1);
    assert!(reports[0].moved);
    assert!(reports[0].interrupted);
    assert!(reports[0].plan.piston_to_issue().is_some());

    // The piston move was refused
    let commands = sim.commands();
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0], MotorCommand::Ring { .. }));
    assert_eq!(sim.collimator("sp1").unwrap(), 3000.0);
}
