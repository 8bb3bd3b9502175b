//! On-disk storage for collimation configuration and calibration fits.
//!
//! Everything lives under ~/.hartmann/ by default:
//!
//! ```text
//! ~/.hartmann/
//!   collimation_apo.json
//!   collimation_lco.json
//!   calibrations/
//!     r1.json
//!     b1.json
//! ```

use std::path::{Path, PathBuf};

use crate::calibration::{CalibrationError, CalibrationFit};
use crate::config::{CollimationConfig, ConfigError, Observatory};

/// Configuration storage rooted at a single directory.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Storage at ~/.hartmann
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".hartmann"),
        })
    }

    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn collimation_path(&self, observatory: Observatory) -> PathBuf {
        let site = observatory.to_string().to_ascii_lowercase();
        self.root_path.join(format!("collimation_{site}.json"))
    }

    fn calibrations_dir(&self) -> PathBuf {
        self.root_path.join("calibrations")
    }

    fn calibration_path(&self, camera: &str) -> PathBuf {
        let safe = camera.replace(['/', '\\'], "_");
        self.calibrations_dir().join(format!("{safe}.json"))
    }

    /// Stored configuration for `observatory`.
    ///
    /// Returns None if nothing is stored, Some(Err) if the file is unreadable
    /// or fails validation.
    pub fn get_collimation_config(
        &self,
        observatory: Observatory,
    ) -> Option<Result<CollimationConfig, ConfigError>> {
        let path = self.collimation_path(observatory);
        if !path.exists() {
            return None;
        }
        Some(CollimationConfig::load_from_file(&path))
    }

    /// Stored configuration for `observatory`. APO falls back to the
    /// built-in configuration when none is stored.
    pub fn collimation_config_or_builtin(
        &self,
        observatory: Observatory,
    ) -> Result<CollimationConfig, ConfigError> {
        match (self.get_collimation_config(observatory), observatory) {
            (Some(config), _) => config,
            (None, Observatory::Apo) => CollimationConfig::builtin_apo(),
            (None, Observatory::Lco) => Err(ConfigError::Invalid(format!(
                "no stored configuration for {observatory} in {}",
                self.root_path.display()
            ))),
        }
    }

    pub fn save_collimation_config(
        &self,
        config: &CollimationConfig,
    ) -> Result<PathBuf, ConfigError> {
        config.validate()?;
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.collimation_path(config.observatory);
        config.save_to_file(&path)?;
        Ok(path)
    }

    /// Latest calibration fit for `camera`.
    ///
    /// Returns None if no fit exists, Some(Err) if the file cannot be loaded.
    pub fn get_calibration(
        &self,
        camera: &str,
    ) -> Option<Result<CalibrationFit, CalibrationError>> {
        let path = self.calibration_path(camera);
        if !path.exists() {
            return None;
        }
        Some(CalibrationFit::load_from_file(&path))
    }

    /// Save a calibration fit, replacing any previous fit for the camera.
    pub fn save_calibration(&self, fit: &CalibrationFit) -> Result<PathBuf, CalibrationError> {
        std::fs::create_dir_all(self.calibrations_dir())?;
        let path = self.calibration_path(&fit.camera);
        fit.save_to_file(&path)?;
        Ok(path)
    }

    /// Cameras with a stored calibration fit, sorted.
    pub fn list_calibrations(&self) -> std::io::Result<Vec<String>> {
        let dir = self.calibrations_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut cameras = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    cameras.push(stem.to_string());
                }
            }
        }
        cameras.sort();
        Ok(cameras)
    }

    /// Returns Ok(true) if the fit was deleted, Ok(false) if there was none.
    pub fn delete_calibration(&self, camera: &str) -> std::io::Result<bool> {
        let path = self.calibration_path(camera);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    /// `config` with every stored calibration fit applied to its camera.
    ///
    /// Fits for cameras the configuration does not know are skipped.
    pub fn apply_calibrations(
        &self,
        mut config: CollimationConfig,
    ) -> Result<CollimationConfig, CalibrationError> {
        for camera in self.list_calibrations()? {
            let Ok(base) = config.camera(&camera).map(|c| c.calibration.clone()) else {
                tracing::warn!("stored calibration for unknown camera {camera}, skipping");
                continue;
            };
            let Some(fit) = self.get_calibration(&camera) else {
                continue;
            };
            config = config.with_calibration(&camera, fit?.to_calibration(&base))?;
        }
        Ok(config)
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".hartmann")))
    }
}
