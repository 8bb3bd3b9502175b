//! Hartmann-door collimation for fiber spectrographs.
//!
//! Each camera of a spectrograph takes two arc-lamp exposures, one with the
//! left Hartmann door closed and one with the right. A defocused collimator
//! displaces the spectrum between them. This crate measures that displacement,
//! converts it into collimator and blue-ring moves, and runs the
//! acquire-analyse-move loop until the spectrograph is in focus.
//!
//! The pipeline per camera is
//!
//! 1. [`header`]: lamp, flat-field screen and door checks
//! 2. [`regions`]: bias subtraction, gain correction and quadrant assembly
//! 3. [`measure`]: signal check and sub-pixel shift
//! 4. [`focus`]: shift to collimator steps
//!
//! and [`engine::DecisionEngine`] combines the cameras of one spectrograph
//! into a [`engine::CollimationPlan`].

pub mod calibration;
pub mod camera;
pub mod config;
pub mod config_storage;
pub mod engine;
pub mod focus;
pub mod frame;
pub mod header;
pub mod measure;
pub mod regions;
pub mod sequence;
pub mod simulation;

pub use calibration::{CalibrationError, CalibrationFit, CalibrationSample};
pub use camera::{CameraAnalysis, CameraOutcome, CollimationOptions, Exclusion};
pub use config::{
    CameraCalibration, CameraConfig, CameraRegions, CollimationConfig, ConfigError, Observatory,
    Rect, RingCalibration, SpectrographConfig, Tolerances,
};
pub use config_storage::ConfigStorage;
pub use engine::{
    CameraReport, CollimationPlan, DecisionEngine, EngineState, PistonMove, PlanStatus, RingMove,
    StatusReport,
};
pub use focus::{focus_offset, FocusEstimate};
pub use frame::{Frame, FrameHeader, FrameMetadata, FramePair, HartmannSide};
pub use header::{Bypass, HeaderVerdict};
pub use measure::{ShiftMeasurement, SignalQualityError};
pub use sequence::{
    AbortSignal, AcquisitionError, AcquisitionRequest, CollimationSequence, CollimatorInterface,
    CycleReport, FrameSource, MotorError, MoveGate, MoveGates, SequenceError, SequenceHandle,
    SequenceOptions, SequenceOutcome, SequenceStatus,
};
