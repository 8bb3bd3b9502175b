//! Static collimation configuration.
//!
//! Loaded once from JSON, validated, and then shared read-only (usually behind
//! an `Arc`) by every analysis. Cameras and spectrographs are keyed by id.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use hartmann_math::ShiftSearch;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sample APO configuration shipped with the crate
const APO_CONFIG_JSON: &str = include_str!("../etc/hartmann_apo.json");

/// Errors raised while loading or applying the configuration.
///
/// These are fatal for the request that hits them and are never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown spectrograph {0:?}")]
    UnknownSpectrograph(String),

    #[error("unknown camera {0:?}")]
    UnknownCamera(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{camera}: {region} region {rect} exceeds the {rows}x{cols} image")]
    RegionOutOfBounds {
        camera: String,
        region: String,
        rect: Rect,
        rows: usize,
        cols: usize,
    },
}

/// Site the spectrographs are installed at. Selects the arc lamps that must be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Observatory {
    Apo,
    Lco,
}

impl fmt::Display for Observatory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observatory::Apo => write!(f, "APO"),
            Observatory::Lco => write!(f, "LCO"),
        }
    }
}

/// Half-open pixel rectangle `rows y0..y1, columns x0..x1`.
///
/// Serialized as `[y0, y1, x0, x1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[usize; 4]", into = "[usize; 4]")]
pub struct Rect {
    pub y0: usize,
    pub y1: usize,
    pub x0: usize,
    pub x1: usize,
}

impl Rect {
    pub const fn new(y0: usize, y1: usize, x0: usize, x1: usize) -> Self {
        Self { y0, y1, x0, x1 }
    }

    pub fn height(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }

    pub fn width(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    pub fn is_empty(&self) -> bool {
        self.height() == 0 || self.width() == 0
    }

    /// Whether the rectangle fits inside an image of `rows` x `cols`
    pub fn fits_within(&self, rows: usize, cols: usize) -> bool {
        self.y1 <= rows && self.x1 <= cols
    }

    /// Overlapping part of two rectangles, if any
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::new(
            self.y0.max(other.y0),
            self.y1.min(other.y1),
            self.x0.max(other.x0),
            self.x1.min(other.x1),
        );
        (r.y0 < r.y1 && r.x0 < r.x1).then_some(r)
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.intersect(other).is_some()
    }

    /// Move the rectangle so that `origin` becomes `(0, 0)`
    pub fn relative_to(&self, origin_y: usize, origin_x: usize) -> Rect {
        Rect::new(
            self.y0 - origin_y,
            self.y1 - origin_y,
            self.x0 - origin_x,
            self.x1 - origin_x,
        )
    }
}

impl From<[usize; 4]> for Rect {
    fn from(v: [usize; 4]) -> Self {
        Rect::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Rect> for [usize; 4] {
    fn from(r: Rect) -> Self {
        [r.y0, r.y1, r.x0, r.x1]
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}, {}:{}]", self.y0, self.y1, self.x0, self.x1)
    }
}

/// Global thresholds shared by every camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    /// Maximum in-focus offset, in pixels of Hartmann shift
    pub focus_tolerance_px: f64,
    /// Correlation peak ambiguity above which a shift is unreliable
    pub bad_residual: f64,
    /// Largest piston move ever requested, in motor steps
    pub max_collimator_move: i64,
    /// Blue-ring residual, in degrees, below which no ring move is needed
    pub ring_tolerance_deg: f64,
    pub max_shift_px: f64,
    pub shift_step_px: f64,
    /// Border excluded from the correlation, in pixels
    pub edge_mask: usize,
    /// Minimum clipped variance of the analysis region for a frame to count as lit
    pub min_variance: f64,
    pub variance_clip: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            focus_tolerance_px: 0.20,
            bad_residual: 0.5,
            max_collimator_move: 10_000,
            ring_tolerance_deg: 2.0,
            max_shift_px: 2.0,
            shift_step_px: 0.05,
            edge_mask: 10,
            min_variance: 100.0,
            variance_clip: 1000.0,
        }
    }
}

/// How the blue ring responds to a focus error, for cameras that have one.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RingCalibration {
    /// Camera has no adjustable ring
    #[default]
    None,
    /// Collimator steps equivalent to one degree of ring rotation
    Steps { steps_per_degree: f64 },
}

/// Per-camera conversion from Hartmann shift to collimator steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    /// Gain of each readout quadrant, in the order 1..4
    pub gain: [f64; 4],
    /// Collimator steps per pixel of shift
    pub m: f64,
    /// Collimator steps of focus error at zero shift
    pub b: f64,
    #[serde(default)]
    pub ring: RingCalibration,
}

/// Fixed detector regions of one camera.
///
/// `bias` and `data` are in raw-frame coordinates. `analysis` is in the
/// coordinates of the assembled, overscan-free image, where the quadrants are
/// laid out as
///
/// ```text
/// [ 3 4 ]
/// [ 1 2 ]
/// ```
///
/// with quadrant 1 at the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRegions {
    pub bias: [Rect; 4],
    pub data: [Rect; 4],
    pub analysis: Rect,
}

impl CameraRegions {
    /// Placement of each data quadrant inside the assembled image.
    pub fn assembled_quadrants(&self) -> [Rect; 4] {
        let [q1, _, q3, _] = &self.data;
        let (h1, w1) = (q1.height(), q1.width());
        let (h3, w3) = (q3.height(), q3.width());
        let w2 = self.data[1].width();
        let w4 = self.data[3].width();

        [
            Rect::new(0, h1, 0, w1),
            Rect::new(0, h1, w1, w1 + w2),
            Rect::new(h1, h1 + h3, 0, w3),
            Rect::new(h1, h1 + h3, w3, w3 + w4),
        ]
    }

    /// `(rows, cols)` of the assembled image
    pub fn assembled_dim(&self) -> (usize, usize) {
        let quads = self.assembled_quadrants();
        (quads[3].y1, quads[1].x1)
    }

    fn validate(&self, camera: &str) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(format!("{camera}: {msg}"));

        for (i, rect) in self.data.iter().chain(self.bias.iter()).enumerate() {
            if rect.is_empty() {
                return Err(invalid(format!("region {rect} (#{}) is empty", i % 4 + 1)));
            }
        }

        for i in 0..4 {
            for j in (i + 1)..4 {
                if self.data[i].overlaps(&self.data[j]) {
                    return Err(invalid(format!(
                        "data quadrants {} and {} overlap",
                        i + 1,
                        j + 1
                    )));
                }
            }
        }

        let [q1, q2, q3, q4] = &self.data;
        if q1.height() != q2.height() || q3.height() != q4.height() {
            return Err(invalid("quadrants in the same row differ in height".into()));
        }
        if q1.width() != q3.width() || q2.width() != q4.width() {
            return Err(invalid("quadrants in the same column differ in width".into()));
        }

        let (rows, cols) = self.assembled_dim();
        if self.analysis.is_empty() {
            return Err(invalid("analysis region is empty".into()));
        }
        if !self.analysis.fits_within(rows, cols) {
            return Err(ConfigError::RegionOutOfBounds {
                camera: camera.to_string(),
                region: "analysis".to_string(),
                rect: self.analysis,
                rows,
                cols,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub calibration: CameraCalibration,
    pub regions: CameraRegions,
}

/// A spectrograph and the cameras it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrographConfig {
    /// Camera ids, primary first
    pub cameras: Vec<String>,
    /// Default Hartmann exposure time in seconds
    pub exposure_time: f64,
    /// Arc lamps to switch on for the exposures
    #[serde(default)]
    pub lamps: Vec<String>,
    /// Row window `[start, end)` for sub-frame readout
    #[serde(default)]
    pub sub_frame: Option<[usize; 2]>,
}

impl SpectrographConfig {
    /// The camera whose piston request is authoritative
    pub fn primary_camera(&self) -> Option<&str> {
        self.cameras.first().map(String::as_str)
    }
}

/// Complete configuration for one observatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollimationConfig {
    pub observatory: Observatory,
    #[serde(default)]
    pub tolerances: Tolerances,
    pub spectrographs: BTreeMap<String, SpectrographConfig>,
    pub cameras: BTreeMap<String, CameraConfig>,
}

impl CollimationConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// The configuration shipped for the APO spectrographs
    pub fn builtin_apo() -> Result<Self, ConfigError> {
        Self::from_json_str(APO_CONFIG_JSON)
    }

    pub fn spectrograph(&self, id: &str) -> Result<&SpectrographConfig, ConfigError> {
        self.spectrographs
            .get(id)
            .ok_or_else(|| ConfigError::UnknownSpectrograph(id.to_string()))
    }

    pub fn camera(&self, id: &str) -> Result<&CameraConfig, ConfigError> {
        self.cameras
            .get(id)
            .ok_or_else(|| ConfigError::UnknownCamera(id.to_string()))
    }

    /// Spectrograph a camera belongs to, if any
    pub fn spectrograph_of(&self, camera: &str) -> Option<&str> {
        self.spectrographs
            .iter()
            .find(|(_, spec)| spec.cameras.iter().any(|c| c == camera))
            .map(|(id, _)| id.as_str())
    }

    /// Shift search grid derived from the tolerances
    pub fn shift_search(&self) -> ShiftSearch {
        ShiftSearch {
            max_shift: self.tolerances.max_shift_px,
            step: self.tolerances.shift_step_px,
            edge_mask: self.tolerances.edge_mask,
        }
    }

    /// Replace one camera's calibration, re-validating the result.
    pub fn with_calibration(
        mut self,
        camera: &str,
        calibration: CameraCalibration,
    ) -> Result<Self, ConfigError> {
        self.cameras
            .get_mut(camera)
            .ok_or_else(|| ConfigError::UnknownCamera(camera.to_string()))?
            .calibration = calibration;
        self.validate()?;
        Ok(self)
    }

    /// Check internal consistency. Frame-size checks happen at extraction time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tolerances;
        let positive = [
            ("focus_tolerance_px", t.focus_tolerance_px),
            ("bad_residual", t.bad_residual),
            ("ring_tolerance_deg", t.ring_tolerance_deg),
            ("max_shift_px", t.max_shift_px),
            ("shift_step_px", t.shift_step_px),
            ("min_variance", t.min_variance),
            ("variance_clip", t.variance_clip),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "tolerance {name} must be positive, got {value}"
                )));
            }
        }
        self.shift_search()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("tolerances: {e}")))?;
        if t.max_collimator_move <= 0 {
            return Err(ConfigError::Invalid(format!(
                "max_collimator_move must be positive, got {}",
                t.max_collimator_move
            )));
        }

        for (id, spec) in &self.spectrographs {
            if spec.cameras.is_empty() || spec.cameras.len() > 2 {
                return Err(ConfigError::Invalid(format!(
                    "{id}: expected one or two cameras, got {}",
                    spec.cameras.len()
                )));
            }
            if spec.cameras.len() == 2 && spec.cameras[0] == spec.cameras[1] {
                return Err(ConfigError::Invalid(format!(
                    "{id}: camera {} listed twice",
                    spec.cameras[0]
                )));
            }
            for camera in &spec.cameras {
                self.camera(camera)?;
            }
            if !(spec.exposure_time.is_finite() && spec.exposure_time > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{id}: exposure time must be positive"
                )));
            }
            if let Some([start, end]) = spec.sub_frame {
                if start >= end {
                    return Err(ConfigError::Invalid(format!(
                        "{id}: empty sub-frame [{start}, {end}]"
                    )));
                }
            }
        }

        for (id, camera) in &self.cameras {
            let cal = &camera.calibration;
            if cal.gain.iter().any(|g| !(g.is_finite() && *g > 0.0)) {
                return Err(ConfigError::Invalid(format!(
                    "{id}: gains must be positive, got {:?}",
                    cal.gain
                )));
            }
            if !(cal.m.is_finite() && cal.m != 0.0) || !cal.b.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "{id}: calibration needs finite m != 0 and b, got m={} b={}",
                    cal.m, cal.b
                )));
            }
            if let RingCalibration::Steps { steps_per_degree } = cal.ring {
                if !(steps_per_degree.is_finite() && steps_per_degree != 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "{id}: ring steps_per_degree must be finite and nonzero"
                    )));
                }
            }
            camera.regions.validate(id)?;
        }

        Ok(())
    }
}
