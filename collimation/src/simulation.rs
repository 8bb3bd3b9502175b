//! Simulated spectrograph for tests and dry runs.
//!
//! Renders raw arc-lamp Hartmann frames whose line displacement follows the
//! current collimator and ring positions, and implements both
//! [`FrameSource`] and [`CollimatorInterface`] so a full
//! [`CollimationSequence`](crate::sequence::CollimationSequence) can run
//! against it.
//!
//! A camera is in focus when the collimator sits at its `best_position`. Its
//! focus error in steps is `position - best_position`, reduced by half a
//! ring-degree's worth of steps for every degree the ring is turned. The
//! Hartmann shift that error produces is `(error - b) / m`.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ndarray::{s, Array2, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::config::{
    CameraCalibration, CameraConfig, CameraRegions, CollimationConfig, Observatory, Rect,
    RingCalibration, SpectrographConfig, Tolerances,
};
use crate::frame::{Frame, FrameHeader, FrameMetadata, FramePair, HartmannSide};
use crate::sequence::{
    AcquisitionError, AcquisitionRequest, CollimatorInterface, FrameSource, MotorError,
};

const LINE_SIGMA_PX: f64 = 1.4;
const FIBER_PITCH_PX: f64 = 6.5;
const RAW_BIAS: f64 = 1000.0;

/// A small detector layout with the real quadrant structure.
///
/// Raw frames are 240x320 with 112x144 data quadrants and overscan strips on
/// both sides; the analysis window straddles all four quadrants.
pub fn compact_regions() -> CameraRegions {
    CameraRegions {
        bias: [
            Rect::new(8, 120, 2, 12),
            Rect::new(8, 120, 308, 318),
            Rect::new(120, 232, 2, 12),
            Rect::new(120, 232, 308, 318),
        ],
        data: [
            Rect::new(8, 120, 16, 160),
            Rect::new(8, 120, 160, 304),
            Rect::new(120, 232, 16, 160),
            Rect::new(120, 232, 160, 304),
        ],
        analysis: Rect::new(50, 170, 90, 200),
    }
}

/// Two two-camera spectrographs on the compact layout, with the APO
/// calibrations.
pub fn compact_config() -> CollimationConfig {
    let camera = |gain: [f64; 4], m: f64, b: f64, ring: RingCalibration| CameraConfig {
        calibration: CameraCalibration { gain, m, b, ring },
        regions: compact_regions(),
    };
    let blue_ring = RingCalibration::Steps {
        steps_per_degree: 292.0,
    };

    let cameras = BTreeMap::from([
        (
            "r1".to_string(),
            camera([1.966, 1.566, 1.542, 1.546], -6597.0, 1319.4, RingCalibration::None),
        ),
        (
            "b1".to_string(),
            camera([1.048, 1.048, 1.018, 1.006], -5400.0, 432.0, blue_ring),
        ),
        (
            "r2".to_string(),
            camera([1.598, 1.656, 1.582, 1.594], -6245.0, 624.5, RingCalibration::None),
        ),
        (
            "b2".to_string(),
            camera([1.040, 0.994, 1.002, 1.010], -5830.0, -291.5, blue_ring),
        ),
    ]);

    let spectrograph = |cameras: [&str; 2]| SpectrographConfig {
        cameras: cameras.iter().map(|c| c.to_string()).collect(),
        exposure_time: 4.0,
        lamps: vec!["Ne".to_string(), "HgCd".to_string()],
        sub_frame: None,
    };

    CollimationConfig {
        observatory: Observatory::Apo,
        tolerances: Tolerances::default(),
        spectrographs: BTreeMap::from([
            ("sp1".to_string(), spectrograph(["r1", "b1"])),
            ("sp2".to_string(), spectrograph(["r2", "b2"])),
        ]),
        cameras,
    }
}

/// A motor command received by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum MotorCommand {
    Piston { spectrograph: String, steps: i64 },
    Ring { camera: String, degrees: f64 },
}

#[derive(Debug)]
struct SimCamera {
    best_position: f64,
    ring_deg: f64,
    /// Line centres in assembled-image rows
    lines: Vec<f64>,
    enabled: bool,
    lamps_on: bool,
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    collimators: BTreeMap<String, f64>,
    cameras: BTreeMap<String, SimCamera>,
    header_overrides: BTreeMap<String, Option<String>>,
    right_first: bool,
    noise_sigma: f64,
    line_amplitude: f64,
    next_exposure: u64,
    commands: Vec<MotorCommand>,
    motor_fault: Option<String>,
}

/// Shared handle to a simulated spectrograph. Clones drive the same hardware.
#[derive(Debug, Clone)]
pub struct SimulatedSpectrograph {
    config: Arc<CollimationConfig>,
    state: Arc<Mutex<SimState>>,
}

fn random_lines(rng: &mut StdRng, rows: usize) -> Vec<f64> {
    let mut lines = Vec::new();
    let mut row = rng.random_range(2.0..8.0);
    while row < rows as f64 {
        lines.push(row);
        row += rng.random_range(9.0..18.0);
    }
    lines
}

impl SimulatedSpectrograph {
    pub fn new(config: Arc<CollimationConfig>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let cameras = config
            .cameras
            .iter()
            .map(|(id, cam)| {
                let (rows, _) = cam.regions.assembled_dim();
                let sim = SimCamera {
                    best_position: 0.0,
                    ring_deg: 0.0,
                    lines: random_lines(&mut rng, rows),
                    enabled: true,
                    lamps_on: true,
                };
                (id.clone(), sim)
            })
            .collect();

        let collimators = config
            .spectrographs
            .keys()
            .map(|id| (id.clone(), 0.0))
            .collect();

        Self {
            config,
            state: Arc::new(Mutex::new(SimState {
                rng,
                collimators,
                cameras,
                header_overrides: BTreeMap::new(),
                right_first: false,
                noise_sigma: 3.0,
                line_amplitude: 3000.0,
                next_exposure: 1,
                commands: Vec::new(),
                motor_fault: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Arc<CollimationConfig> {
        &self.config
    }

    pub fn set_collimator(&self, spectrograph: &str, position: f64) {
        self.lock()
            .collimators
            .insert(spectrograph.to_string(), position);
    }

    pub fn collimator(&self, spectrograph: &str) -> Option<f64> {
        self.lock().collimators.get(spectrograph).copied()
    }

    pub fn set_best_position(&self, camera: &str, position: f64) {
        if let Some(cam) = self.lock().cameras.get_mut(camera) {
            cam.best_position = position;
        }
    }

    pub fn ring(&self, camera: &str) -> Option<f64> {
        self.lock().cameras.get(camera).map(|c| c.ring_deg)
    }

    /// Stop a camera from returning frames
    pub fn set_camera_enabled(&self, camera: &str, enabled: bool) {
        if let Some(cam) = self.lock().cameras.get_mut(camera) {
            cam.enabled = enabled;
        }
    }

    /// Switch a camera's arc light off to produce dark frames
    pub fn set_lamps_on(&self, camera: &str, on: bool) {
        if let Some(cam) = self.lock().cameras.get_mut(camera) {
            cam.lamps_on = on;
        }
    }

    /// Override a header card on every subsequent frame; `None` removes it
    pub fn set_header_card(&self, card: &str, value: Option<&str>) {
        self.lock()
            .header_overrides
            .insert(card.to_ascii_uppercase(), value.map(str::to_string));
    }

    /// Take the right-door exposure before the left one
    pub fn set_right_first(&self, right_first: bool) {
        self.lock().right_first = right_first;
    }

    pub fn set_noise_sigma(&self, sigma: f64) {
        self.lock().noise_sigma = sigma;
    }

    /// Make every subsequent motor command fail with `fault`
    pub fn set_motor_fault(&self, fault: Option<&str>) {
        self.lock().motor_fault = fault.map(str::to_string);
    }

    /// Motor commands received so far, oldest first
    pub fn commands(&self) -> Vec<MotorCommand> {
        self.lock().commands.clone()
    }

    /// Focus error of `camera` in collimator steps
    pub fn focus_error(&self, camera: &str) -> Option<f64> {
        let state = self.lock();
        self.focus_error_locked(&state, camera)
    }

    fn focus_error_locked(&self, state: &SimState, camera: &str) -> Option<f64> {
        let cam = state.cameras.get(camera)?;
        let spec = self.config.spectrograph_of(camera)?;
        let position = *state.collimators.get(spec)?;
        let ring_steps = match self.config.camera(camera).ok()?.calibration.ring {
            RingCalibration::None => 0.0,
            RingCalibration::Steps { steps_per_degree } => cam.ring_deg * steps_per_degree / 2.0,
        };
        Some(position - cam.best_position - ring_steps)
    }

    /// Hartmann shift `camera` currently produces, in pixels
    pub fn true_shift(&self, camera: &str) -> Option<f64> {
        let cal = &self.config.camera(camera).ok()?.calibration;
        self.focus_error(camera).map(|e| (e - cal.b) / cal.m)
    }

    fn header(&self, state: &SimState, side: HartmannSide, position: f64) -> FrameHeader {
        let site_lamps = match self.config.observatory {
            Observatory::Apo => "HGCD",
            Observatory::Lco => "HEAR",
        };
        let mut header: FrameHeader = [
            ("HARTMANN", side.header_value().to_string()),
            ("FFS", "1 1 1 1 1 1 1 1".to_string()),
            ("NE", "1 1 1 1".to_string()),
            (site_lamps, "1 1 1 1".to_string()),
            ("COLLA", format!("{position:.0}")),
        ]
        .into_iter()
        .collect();

        for (card, value) in &state.header_overrides {
            match value {
                Some(v) => header.insert(card, v.clone()),
                None => {
                    header.remove(card);
                }
            }
        }
        header
    }

    fn render(
        &self,
        state: &mut SimState,
        camera: &str,
        spectrograph: &str,
        side: HartmannSide,
        exposure_time: f64,
        lamps: &[String],
    ) -> Result<Frame, AcquisitionError> {
        let cam_cfg = self
            .config
            .camera(camera)
            .map_err(|e| AcquisitionError(e.to_string()))?;
        let shift = self
            .true_shift_locked(state, camera)
            .ok_or_else(|| AcquisitionError(format!("{camera}: not simulated")))?;
        let position = state.collimators.get(spectrograph).copied().unwrap_or(0.0);

        // Left and right images straddle the true position
        let displacement = match side {
            HartmannSide::Left => shift / 2.0,
            HartmannSide::Right => -shift / 2.0,
        };

        let regions = &cam_cfg.regions;
        let rows = regions
            .data
            .iter()
            .chain(regions.bias.iter())
            .map(|r| r.y1)
            .max()
            .unwrap_or(0);
        let cols = regions
            .data
            .iter()
            .chain(regions.bias.iter())
            .map(|r| r.x1)
            .max()
            .unwrap_or(0);

        let noise = Normal::new(0.0, state.noise_sigma.max(f64::MIN_POSITIVE))
            .map_err(|e| AcquisitionError(e.to_string()))?;
        let (lines, lamps_on) = match state.cameras.get(camera) {
            Some(c) => (c.lines.clone(), c.lamps_on),
            None => (Vec::new(), false),
        };
        let amplitude = if lamps_on { state.line_amplitude } else { 0.0 };

        let row_profile = |row: f64| -> f64 {
            lines
                .iter()
                .map(|c| {
                    let d = row - c - displacement;
                    (-d * d / (2.0 * LINE_SIGMA_PX * LINE_SIGMA_PX)).exp()
                })
                .sum()
        };

        let mut data = Array2::<f64>::zeros((rows, cols));
        let placed = regions.assembled_quadrants();

        for q in 0..4 {
            let level = RAW_BIAS + 50.0 * q as f64;
            let gain = cam_cfg.calibration.gain[q];

            let b = regions.bias[q];
            data.slice_mut(s![b.y0..b.y1, b.x0..b.x1])
                .mapv_inplace(|_| level + noise.sample(&mut state.rng));

            let d = regions.data[q];
            let origin = placed[q];
            let profile: Vec<f64> = (0..d.height())
                .map(|i| amplitude * row_profile((origin.y0 + i) as f64))
                .collect();

            Zip::indexed(data.slice_mut(s![d.y0..d.y1, d.x0..d.x1])).for_each(|(i, j), v| {
                let col = (origin.x0 + j) as f64;
                let fiber = 0.55 + 0.45 * (2.0 * PI * col / FIBER_PITCH_PX).cos();
                *v = level + profile[i] * fiber / gain + noise.sample(&mut state.rng);
            });
        }

        let raw = data.mapv(|v| v.round().clamp(0.0, f64::from(u16::MAX)) as u16);

        let exposure_id = state.next_exposure;
        state.next_exposure += 1;
        let header = self.header(state, side, position);

        Ok(Frame::new(
            raw,
            FrameMetadata {
                camera: camera.to_string(),
                spectrograph: spectrograph.to_string(),
                observatory: self.config.observatory,
                exposure_id,
                exposure_time,
                lamps: lamps.to_vec(),
                collimator_position: Some(position),
                header,
            },
        ))
    }

    fn true_shift_locked(&self, state: &SimState, camera: &str) -> Option<f64> {
        let cal = &self.config.camera(camera).ok()?.calibration;
        self.focus_error_locked(state, camera)
            .map(|e| (e - cal.b) / cal.m)
    }

    /// Render a left/right pair for one camera at the current positions.
    pub fn hartmann_pair(&self, camera: &str) -> Result<FramePair, AcquisitionError> {
        let spectrograph = self
            .config
            .spectrograph_of(camera)
            .ok_or_else(|| AcquisitionError(format!("{camera}: not in any spectrograph")))?
            .to_string();
        let (exposure_time, lamps) = self
            .config
            .spectrograph(&spectrograph)
            .map(|s| (s.exposure_time, s.lamps.clone()))
            .map_err(|e| AcquisitionError(e.to_string()))?;

        let mut state = self.lock();
        let order = if state.right_first {
            [HartmannSide::Right, HartmannSide::Left]
        } else {
            [HartmannSide::Left, HartmannSide::Right]
        };
        let first = self.render(
            &mut state,
            camera,
            &spectrograph,
            order[0],
            exposure_time,
            &lamps,
        )?;
        let second = self.render(
            &mut state,
            camera,
            &spectrograph,
            order[1],
            exposure_time,
            &lamps,
        )?;
        Ok(FramePair::new(first, second))
    }
}

impl FrameSource for SimulatedSpectrograph {
    fn take_hartmanns(
        &mut self,
        request: &AcquisitionRequest,
    ) -> Result<BTreeMap<String, FramePair>, AcquisitionError> {
        let mut frames = BTreeMap::new();
        for camera in &request.cameras {
            let enabled = self
                .lock()
                .cameras
                .get(camera)
                .is_some_and(|c| c.enabled);
            if !enabled {
                debug!("{camera}: disabled, no frames");
                continue;
            }
            frames.insert(camera.clone(), self.hartmann_pair(camera)?);
        }
        Ok(frames)
    }
}

impl CollimatorInterface for SimulatedSpectrograph {
    fn move_piston(&mut self, spectrograph: &str, steps: i64) -> Result<(), MotorError> {
        let mut state = self.lock();
        if let Some(fault) = &state.motor_fault {
            return Err(MotorError(fault.clone()));
        }
        let position = state
            .collimators
            .get_mut(spectrograph)
            .ok_or_else(|| MotorError(format!("no collimator for {spectrograph}")))?;
        *position += steps as f64;
        state.commands.push(MotorCommand::Piston {
            spectrograph: spectrograph.to_string(),
            steps,
        });
        Ok(())
    }

    fn move_ring(&mut self, camera: &str, degrees: f64) -> Result<(), MotorError> {
        let mut state = self.lock();
        if let Some(fault) = &state.motor_fault {
            return Err(MotorError(fault.clone()));
        }
        let cam = state
            .cameras
            .get_mut(camera)
            .ok_or_else(|| MotorError(format!("no ring motor for {camera}")))?;
        cam.ring_deg += degrees;
        state.commands.push(MotorCommand::Ring {
            camera: camera.to_string(),
            degrees,
        });
        Ok(())
    }
}
