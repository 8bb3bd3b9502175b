//! Cancellable multi-cycle collimation.
//!
//! A [`CollimationSequence`] repeatedly takes Hartmann frames, runs the
//! decision engine, and applies the resulting moves on a worker thread until
//! the spectrograph is in focus, analysis fails, the cycle budget runs out, or
//! the operator aborts. Each completed cycle is published on a channel, as is
//! a cycle whose moves were cut short after at least one had been issued.
//!
//! At most one motor move is in flight per spectrograph. The in-flight flag
//! and the abort flag are both changed under the spectrograph's gate lock, so
//! an abort either lands before a move starts (and the move is refused) or
//! after it (and the move runs to completion).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::camera::CollimationOptions;
use crate::config::ConfigError;
use crate::engine::{CollimationPlan, DecisionEngine, EngineState, PlanStatus};
use crate::frame::FramePair;

/// Failure reported by a frame source.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("acquisition failed: {0}")]
pub struct AcquisitionError(pub String);

/// Failure reported by a motor controller.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("motor command failed: {0}")]
pub struct MotorError(pub String);

/// What to expose for one Hartmann pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRequest {
    pub spectrograph: String,
    pub cameras: Vec<String>,
    /// Exposure time in seconds
    pub exposure_time: f64,
    pub lamps: Vec<String>,
    /// Row window to read out, if only part of the chip is needed
    pub sub_frame: Option<[usize; 2]>,
}

/// Source of Hartmann exposures.
pub trait FrameSource: Send {
    /// Take a left/right Hartmann pair with every requested camera.
    fn take_hartmanns(
        &mut self,
        request: &AcquisitionRequest,
    ) -> Result<BTreeMap<String, FramePair>, AcquisitionError>;
}

/// Motors the plan can move.
pub trait CollimatorInterface: Send {
    /// Move a spectrograph's collimator piston by `steps`
    fn move_piston(&mut self, spectrograph: &str, steps: i64) -> Result<(), MotorError>;

    /// Rotate a camera's blue ring by `degrees`
    fn move_ring(&mut self, camera: &str, degrees: f64) -> Result<(), MotorError>;
}

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("aborted after {cycles} completed cycle(s)")]
    Aborted { cycles: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Motor(#[from] MotorError),

    #[error("a move is already in flight for {0}")]
    MoveInFlight(String),

    #[error("failed to start sequence thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("sequence thread panicked")]
    WorkerPanicked,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serialises motor moves for one spectrograph.
#[derive(Debug)]
pub struct MoveGate {
    spectrograph: String,
    in_flight: Mutex<bool>,
}

impl MoveGate {
    pub fn new(spectrograph: &str) -> Self {
        Self {
            spectrograph: spectrograph.to_string(),
            in_flight: Mutex::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        *lock(&self.in_flight)
    }

    /// Claim the gate for one move, unless `abort` is set or another move runs.
    pub fn begin(&self, abort: &AbortSignal) -> Result<MoveTicket<'_>, SequenceError> {
        let mut in_flight = lock(&self.in_flight);
        if abort.is_aborted() {
            return Err(SequenceError::Aborted { cycles: 0 });
        }
        if *in_flight {
            return Err(SequenceError::MoveInFlight(self.spectrograph.clone()));
        }
        *in_flight = true;
        Ok(MoveTicket { gate: self })
    }
}

/// Proof that the holder may move motors. Releases the gate on drop.
#[derive(Debug)]
pub struct MoveTicket<'a> {
    gate: &'a MoveGate,
}

impl Drop for MoveTicket<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.in_flight) = false;
    }
}

/// One gate per spectrograph, shared by every sequence in the process.
#[derive(Debug, Default)]
pub struct MoveGates {
    gates: Mutex<HashMap<String, Arc<MoveGate>>>,
}

impl MoveGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self, spectrograph: &str) -> Arc<MoveGate> {
        lock(&self.gates)
            .entry(spectrograph.to_string())
            .or_insert_with(|| Arc::new(MoveGate::new(spectrograph)))
            .clone()
    }
}

/// Cooperative cancellation for one sequence.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
    gate: Arc<MoveGate>,
}

impl AbortSignal {
    pub fn new(gate: Arc<MoveGate>) -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            gate,
        }
    }

    /// Request cancellation. A move already in progress completes.
    pub fn abort(&self) {
        let _guard = lock(&self.gate.in_flight);
        self.aborted.store(true, Ordering::SeqCst);
        info!("{}: abort requested", self.gate.spectrograph);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Settings for a whole sequence.
#[derive(Debug, Clone)]
pub struct SequenceOptions {
    pub max_cycles: usize,
    /// Apply the planned moves; otherwise stop after the first analysis
    pub move_motors: bool,
    pub collimation: CollimationOptions,
    /// Overrides the spectrograph's default exposure time
    pub exposure_time: Option<f64>,
    /// Read out only the configured sub-frame
    pub sub_frame: bool,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            max_cycles: 3,
            move_motors: true,
            collimation: CollimationOptions::default(),
            exposure_time: None,
            sub_frame: false,
        }
    }
}

/// Published after every cycle that was not aborted before its first move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: usize,
    pub plan: CollimationPlan,
    /// Whether any motor was commanded this cycle
    pub moved: bool,
    /// The plan was only partly applied: an abort or motor fault stopped it
    /// after at least one move went out
    pub interrupted: bool,
}

/// How a sequence ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOutcome {
    /// Focus within tolerance
    Converged { cycles: usize, plan: CollimationPlan },
    /// Motors were not to be moved; this is the first cycle's plan
    AnalysisOnly { plan: CollimationPlan },
    /// Analysis failed; the plan carries the reason
    Failed { cycles: usize, plan: CollimationPlan },
    /// Out of cycles while still needing moves
    CyclesExhausted { cycles: usize, plan: CollimationPlan },
}

impl SequenceOutcome {
    pub fn plan(&self) -> &CollimationPlan {
        match self {
            SequenceOutcome::Converged { plan, .. }
            | SequenceOutcome::AnalysisOnly { plan }
            | SequenceOutcome::Failed { plan, .. }
            | SequenceOutcome::CyclesExhausted { plan, .. } => plan,
        }
    }
}

/// Live progress of a running sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceStatus {
    pub cycle: usize,
    pub state: EngineState,
}

/// Handle to a running sequence.
pub struct SequenceHandle {
    abort: AbortSignal,
    results: Receiver<CycleReport>,
    status: Arc<Mutex<SequenceStatus>>,
    join: JoinHandle<Result<SequenceOutcome, SequenceError>>,
}

impl SequenceHandle {
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Per-cycle reports, in order
    pub fn results(&self) -> &Receiver<CycleReport> {
        &self.results
    }

    pub fn status(&self) -> SequenceStatus {
        *lock(&self.status)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the sequence to end
    pub fn join(self) -> Result<SequenceOutcome, SequenceError> {
        self.join.join().map_err(|_| SequenceError::WorkerPanicked)?
    }
}

/// A collimation run for one spectrograph.
pub struct CollimationSequence<S, C> {
    engine: DecisionEngine,
    spectrograph: String,
    source: S,
    motors: C,
    options: SequenceOptions,
}

impl<S, C> CollimationSequence<S, C>
where
    S: FrameSource + 'static,
    C: CollimatorInterface + 'static,
{
    pub fn new(
        engine: DecisionEngine,
        spectrograph: &str,
        source: S,
        motors: C,
        options: SequenceOptions,
    ) -> Self {
        Self {
            engine,
            spectrograph: spectrograph.to_string(),
            source,
            motors,
            options,
        }
    }

    /// Start the sequence on its own thread.
    pub fn spawn(self, gates: &MoveGates) -> Result<SequenceHandle, SequenceError> {
        let abort = AbortSignal::new(gates.gate(&self.spectrograph));
        let status = Arc::new(Mutex::new(SequenceStatus {
            cycle: 0,
            state: EngineState::Collecting,
        }));
        let (tx, rx) = unbounded();

        let worker_abort = abort.clone();
        let worker_status = status.clone();
        let join = thread::Builder::new()
            .name(format!("collimate-{}", self.spectrograph))
            .spawn(move || self.run(&worker_abort, &worker_status, &tx))?;

        Ok(SequenceHandle {
            abort,
            results: rx,
            status,
            join,
        })
    }

    /// Run the sequence on the calling thread.
    pub fn run(
        mut self,
        abort: &AbortSignal,
        status: &Mutex<SequenceStatus>,
        results: &Sender<CycleReport>,
    ) -> Result<SequenceOutcome, SequenceError> {
        let spec = self.engine.config().spectrograph(&self.spectrograph)?.clone();
        let request = AcquisitionRequest {
            spectrograph: self.spectrograph.clone(),
            cameras: spec.cameras.clone(),
            exposure_time: self.options.exposure_time.unwrap_or(spec.exposure_time),
            lamps: spec.lamps.clone(),
            sub_frame: spec.sub_frame.filter(|_| self.options.sub_frame),
        };

        let max_cycles = self.options.max_cycles.max(1);
        let mut last_plan = None;

        for cycle in 1..=max_cycles {
            if abort.is_aborted() {
                return Err(SequenceError::Aborted { cycles: cycle - 1 });
            }
            *lock(status) = SequenceStatus {
                cycle,
                state: EngineState::Collecting,
            };
            info!("{}: cycle {cycle}/{max_cycles}", self.spectrograph);

            let frames = self.source.take_hartmanns(&request)?;
            let plan = self.engine.analyze_observed(
                &self.spectrograph,
                &frames,
                &self.options.collimation,
                |state| lock(status).state = state,
            );

            if abort.is_aborted() {
                warn!("{}: discarding cycle {cycle} plan after abort", self.spectrograph);
                return Err(SequenceError::Aborted { cycles: cycle - 1 });
            }

            let finished = match plan.status {
                PlanStatus::Failed => Some(SequenceOutcome::Failed {
                    cycles: cycle,
                    plan: plan.clone(),
                }),
                _ if !plan.requires_move() => Some(SequenceOutcome::Converged {
                    cycles: cycle,
                    plan: plan.clone(),
                }),
                _ if !self.options.move_motors => {
                    Some(SequenceOutcome::AnalysisOnly { plan: plan.clone() })
                }
                _ => None,
            };

            if let Some(outcome) = finished {
                results
                    .send(CycleReport {
                        cycle,
                        plan,
                        moved: false,
                        interrupted: false,
                    })
                    .ok();
                return Ok(outcome);
            }

            let mut moved = false;
            let applied = self.apply(&plan, abort, &mut moved);
            if moved || applied.is_ok() {
                results
                    .send(CycleReport {
                        cycle,
                        plan: plan.clone(),
                        moved,
                        interrupted: applied.is_err(),
                    })
                    .ok();
            }
            match applied {
                Ok(()) => {}
                // The cycle counts once any of its moves reached the motors
                Err(SequenceError::Aborted { .. }) if moved => {
                    warn!("{}: cycle {cycle} interrupted by abort", self.spectrograph);
                    return Err(SequenceError::Aborted { cycles: cycle });
                }
                Err(SequenceError::Aborted { .. }) => {
                    return Err(SequenceError::Aborted { cycles: cycle - 1 });
                }
                Err(e) => return Err(e),
            }
            last_plan = Some(plan);
        }

        match last_plan {
            Some(plan) => Ok(SequenceOutcome::CyclesExhausted {
                cycles: max_cycles,
                plan,
            }),
            None => Err(SequenceError::Aborted { cycles: 0 }),
        }
    }

    /// Issue the plan's ring moves, then its piston move unless held.
    ///
    /// `moved` is set as soon as the first motor command succeeds, so a caller
    /// can tell a refused plan from a partly applied one when this fails.
    fn apply(
        &mut self,
        plan: &CollimationPlan,
        abort: &AbortSignal,
        moved: &mut bool,
    ) -> Result<(), SequenceError> {
        let gate = abort.gate.clone();

        for ring in &plan.ring_moves {
            let _ticket = gate.begin(abort)?;
            info!("{}: moving ring {:.1} degrees", ring.camera, ring.move_deg);
            self.motors.move_ring(&ring.camera, ring.move_deg)?;
            *moved = true;
        }

        if let Some(hold) = &plan.piston_hold {
            warn!("{}: {hold}", self.spectrograph);
        }

        if let Some(steps) = plan.piston_to_issue() {
            let _ticket = gate.begin(abort)?;
            info!("{}: moving collimator {steps} steps", self.spectrograph);
            self.motors.move_piston(&self.spectrograph, steps)?;
            *moved = true;
        }

        Ok(())
    }
}
