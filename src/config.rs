//! Application configuration.
//!
//! Settings are loaded with the `config` crate: built-in defaults, then an
//! optional TOML file, then `RIG_`-prefixed environment variables (e.g.
//! `RIG_ACQUISITION__NAVGS=4`). A validation pass catches values that parse
//! but are logically invalid, before any hardware is touched.
//!
//! ```toml
//! [acquisition]
//! exposure_us = 10000.0
//! navgs = 1
//! binning = 1
//! frame_period_ms = 50
//!
//! [exposure]
//! target_fraction = 0.98
//! max_iterations = 16
//!
//! [storage]
//! default_path = "./data"
//! file_prefix = "image"
//! format = "raster16"
//!
//! [projector]
//! fringes = 16
//! phases = 4
//!
//! [filter]
//! start_nm = 420.0
//! stop_nm = 730.0
//! step_nm = 10.0
//!
//! [stage]
//! angles = [0.0, 45.0, 90.0, 135.0]
//! ```

use crate::core::SaveFormat;
use crate::error::{AppResult, RigError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Top-level application settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Live acquisition parameters.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Auto-exposure parameters.
    #[serde(default)]
    pub exposure: ExposureSettings,
    /// Frame storage parameters.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Fringe projection parameters.
    #[serde(default)]
    pub projector: ProjectorSettings,
    /// Wavelength sweep parameters.
    #[serde(default)]
    pub filter: FilterSettings,
    /// Rotation sweep parameters.
    #[serde(default)]
    pub stage: StageSettings,
}

/// Live acquisition parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Initial exposure time in microseconds.
    pub exposure_us: f64,
    /// Initial sensor gain in dB.
    pub gain: f64,
    /// Pixel binning factor.
    pub binning: u32,
    /// Frames averaged per published frame.
    pub navgs: u32,
    /// Delay between scheduled captures in the live loop.
    pub frame_period_ms: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            exposure_us: 10_000.0,
            gain: 0.0,
            binning: 1,
            navgs: 1,
            frame_period_ms: 50,
        }
    }
}

/// Auto-exposure parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureSettings {
    /// Fraction of the saturation ceiling to aim the peak pixel at.
    pub target_fraction: f64,
    /// De-saturation halvings allowed before giving up.
    pub max_iterations: u32,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            target_fraction: 0.98,
            max_iterations: 16,
        }
    }
}

/// Frame storage parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory frames are written into.
    pub default_path: String,
    /// Filename prefix for saved frames.
    pub file_prefix: String,
    /// Output encoding.
    pub format: SaveFormat,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            default_path: "./data".to_string(),
            file_prefix: "image".to_string(),
            format: SaveFormat::Raster16,
        }
    }
}

/// Fringe projection parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorSettings {
    /// Number of fringes projected across the image height.
    pub fringes: u32,
    /// Number of phase steps per sweep.
    pub phases: u32,
}

impl Default for ProjectorSettings {
    fn default() -> Self {
        Self {
            fringes: 16,
            phases: 4,
        }
    }
}

/// Wavelength sweep parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// First wavelength of the sweep, in nanometers.
    pub start_nm: f64,
    /// Exclusive upper bound of the sweep, in nanometers.
    pub stop_nm: f64,
    /// Sweep increment in nanometers.
    pub step_nm: f64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            start_nm: 420.0,
            stop_nm: 730.0,
            step_nm: 10.0,
        }
    }
}

/// Rotation sweep parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Absolute angles to visit, in degrees.
    pub angles: Vec<f64>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            angles: vec![0.0, 45.0, 90.0, 135.0],
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and the
    /// environment, then validate.
    pub fn new(config_path: Option<&str>) -> AppResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        } else {
            builder = builder.add_source(File::with_name("rig").required(false));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("RIG")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that parse but are logically invalid.
    pub fn validate(&self) -> AppResult<()> {
        if self.acquisition.navgs < 1 {
            return Err(RigError::Configuration(
                "acquisition.navgs must be >= 1".to_string(),
            ));
        }
        if self.acquisition.binning < 1 {
            return Err(RigError::Configuration(
                "acquisition.binning must be >= 1".to_string(),
            ));
        }
        if self.acquisition.frame_period_ms == 0 {
            return Err(RigError::Configuration(
                "acquisition.frame_period_ms must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.exposure.target_fraction)
            || self.exposure.target_fraction == 0.0
        {
            return Err(RigError::Configuration(
                "exposure.target_fraction must be in (0, 1]".to_string(),
            ));
        }
        if self.exposure.max_iterations == 0 {
            return Err(RigError::Configuration(
                "exposure.max_iterations must be >= 1".to_string(),
            ));
        }
        if self.projector.phases == 0 || self.projector.fringes == 0 {
            return Err(RigError::Configuration(
                "projector.phases and projector.fringes must be >= 1".to_string(),
            ));
        }
        if self.filter.step_nm <= 0.0 || self.filter.stop_nm < self.filter.start_nm {
            return Err(RigError::Configuration(
                "filter sweep must have step_nm > 0 and stop_nm >= start_nm".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.acquisition.navgs, 1);
        assert_eq!(settings.acquisition.frame_period_ms, 50);
        assert!((settings.exposure.target_fraction - 0.98).abs() < f64::EPSILON);
        assert_eq!(settings.projector.phases, 4);
        assert_eq!(settings.projector.fringes, 16);
    }

    #[test]
    fn test_validation_rejects_zero_navgs() {
        let mut settings = Settings::default();
        settings.acquisition.navgs = 0;
        assert!(matches!(
            settings.validate(),
            Err(RigError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_inverted_sweep() {
        let mut settings = Settings::default();
        settings.filter.stop_nm = 400.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_roundtrip_toml() {
        let settings = Settings::default();
        let text = toml::to_string(&settings).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.acquisition.binning, settings.acquisition.binning);
        assert_eq!(back.storage.format, settings.storage.format);
    }
}
