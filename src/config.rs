//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the beam shower.
//! Configuration is layered from:
//! 1. Built-in defaults (the values used on the F200)
//! 2. `beam_shower.toml` (or the file given on the command line)
//! 3. Environment variables (prefixed with `BEAMSHOWER_`, nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! BEAMSHOWER_APPLICATION__LOG_LEVEL=debug
//! BEAMSHOWER_PROCEDURE__DURATION=15m
//! BEAMSHOWER_PROCEDURE__PROBE_SIZE=2
//! ```
//!
//! # Example file
//!
//! ```toml
//! [procedure]
//! duration = "10m"
//! probe_size = 1
//!
//! [procedure.defocus]
//! method = "free_lens_control"
//! cl1 = 20000
//! cl2 = 20000
//! cl3 = 20000
//!
//! [procedure.blanking]
//! method = "apertures"
//! kinds = [2, 4]
//! size = 0
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::microscope::{ApertureKind, DeflectorPair, IlDeflector};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "beam_shower.toml";

/// Longest beam shower the procedure accepts.
pub const MAX_DURATION: Duration = Duration::from_secs(90 * 60);

/// Largest value accepted by lens and deflector DACs.
pub const MAX_DAC_VALUE: u32 = 0xFFFF;

/// Largest energy shift (in eV, either sign) accepted for defocusing.
pub const MAX_ENERGY_SHIFT_EV: f64 = 5000.0;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Beam shower procedure settings
    #[serde(default)]
    pub procedure: ProcedureConfig,
    /// Backup record settings
    #[serde(default)]
    pub backup: BackupConfig,
    /// Countdown driver settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// How the beam is defocused while showering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DefocusMethod {
    /// Drive CL1/CL2/CL3 to absolute values through free lens control.
    FreeLensControl {
        /// CL1 DAC value
        cl1: u32,
        /// CL2 DAC value
        cl2: u32,
        /// CL3 DAC value
        cl3: u32,
    },
    /// Shift the energy filter by `ev`.
    EnergyShift {
        /// Shift in eV
        ev: f64,
    },
}

impl Default for DefocusMethod {
    fn default() -> Self {
        DefocusMethod::FreeLensControl {
            cl1: 20000,
            cl2: 20000,
            cl3: 20000,
        }
    }
}

/// How the beam is kept off the detectors below the specimen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SpecimenBlanking {
    /// Insert the SA and OL apertures.
    Apertures {
        /// Aperture slots to insert
        kinds: Vec<ApertureKind>,
        /// Size index selected in each slot
        size: u8,
    },
    /// Deflect the beam with an IL deflector.
    IlDeflector {
        /// Deflector driven off axis
        deflector: IlDeflector,
        /// Value written while blanking
        #[serde(default = "default_blank_value")]
        value: DeflectorPair,
    },
}

impl Default for SpecimenBlanking {
    fn default() -> Self {
        SpecimenBlanking::Apertures {
            kinds: vec![ApertureKind(2), ApertureKind(4)],
            size: 0,
        }
    }
}

/// Fixed waits after hardware moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleDelays {
    /// Wait after each aperture move
    #[serde(with = "humantime_serde", default = "default_aperture_settle")]
    pub aperture: Duration,
    /// Wait after each detector move
    #[serde(with = "humantime_serde", default = "default_detector_settle")]
    pub detector: Duration,
    /// Wait after moving the viewing screen
    #[serde(with = "humantime_serde", default = "default_screen_settle")]
    pub screen: Duration,
}

impl SettleDelays {
    /// No waiting at all; used with simulated hardware.
    pub fn none() -> Self {
        Self {
            aperture: Duration::ZERO,
            detector: Duration::ZERO,
            screen: Duration::ZERO,
        }
    }
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            aperture: default_aperture_settle(),
            detector: default_detector_settle(),
            screen: default_screen_settle(),
        }
    }
}

/// Procedure configuration, read-only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureConfig {
    /// How long the beam showers
    #[serde(with = "humantime_serde", default = "default_duration")]
    pub duration: Duration,
    /// Probe size selected for the shower
    #[serde(default = "default_probe_size")]
    pub probe_size: u8,
    /// Condenser aperture removed during the shower
    #[serde(default = "default_cl_aperture")]
    pub cl_aperture: ApertureKind,
    /// Defocus method
    #[serde(default)]
    pub defocus: DefocusMethod,
    /// Specimen blanking method
    #[serde(default)]
    pub blanking: SpecimenBlanking,
    /// Settle delays after hardware moves
    #[serde(default)]
    pub settle: SettleDelays,
    /// Check the imaging mode on every tick and abort if it changes
    #[serde(default)]
    pub monitor_mode: bool,
    /// Prompt shown at the safety gate
    #[serde(default = "default_safety_prompt")]
    pub safety_prompt: String,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            probe_size: default_probe_size(),
            cl_aperture: default_cl_aperture(),
            defocus: DefocusMethod::default(),
            blanking: SpecimenBlanking::default(),
            settle: SettleDelays::default(),
            monitor_mode: false,
            safety_prompt: default_safety_prompt(),
        }
    }
}

/// Backup record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Write a backup record of the original state at start
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Backup file location; defaults to the user data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl BackupConfig {
    /// Location the backup record is written to.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => dirs::data_local_dir()
                .map(|dir| dir.join("beam_shower"))
                .unwrap_or_default()
                .join("state_backup.toml"),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            path: None,
        }
    }
}

/// Countdown driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Interval between countdown ticks
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_duration() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_probe_size() -> u8 {
    1
}

fn default_cl_aperture() -> ApertureKind {
    ApertureKind(0)
}

fn default_blank_value() -> DeflectorPair {
    DeflectorPair::new(MAX_DAC_VALUE, MAX_DAC_VALUE)
}

fn default_aperture_settle() -> Duration {
    Duration::from_millis(1800)
}

fn default_detector_settle() -> Duration {
    Duration::from_millis(1800)
}

fn default_screen_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_safety_prompt() -> String {
    "Make sure EDX detector is retracted!".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `beam_shower.toml` (or `path`) and environment variables
    ///
    /// Configuration is loaded in this order of precedence (highest to lowest):
    /// 1. Environment variables (`BEAMSHOWER_` prefix)
    /// 2. The configuration file
    /// 3. Built-in defaults
    ///
    /// A missing configuration file is not an error. After loading, configuration
    /// is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file(path))
                .merge(Env::prefixed("BEAMSHOWER_").split("__")),
        )
    }

    /// Extract and validate settings from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.extract().map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.tick_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "session.tick_interval must be greater than zero".to_string(),
            ));
        }

        self.procedure.validate()
    }
}

impl ProcedureConfig {
    /// Returns a copy with a different shower duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Validate procedure values
    ///
    /// Checks:
    /// - Duration is non-zero and at most [`MAX_DURATION`]
    /// - Lens targets and deflector blank values fit the DAC range
    /// - Energy shift is finite and within [`MAX_ENERGY_SHIFT_EV`]
    /// - Blanking apertures are non-empty, unique and distinct from the CL aperture
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::ValidationError(
                "procedure.duration must be greater than zero".to_string(),
            ));
        }
        if self.duration > MAX_DURATION {
            return Err(ConfigError::ValidationError(format!(
                "procedure.duration {:?} exceeds the maximum of {:?}",
                self.duration, MAX_DURATION
            )));
        }

        match &self.defocus {
            DefocusMethod::FreeLensControl { cl1, cl2, cl3 } => {
                for (name, value) in [("cl1", cl1), ("cl2", cl2), ("cl3", cl3)] {
                    if *value > MAX_DAC_VALUE {
                        return Err(ConfigError::ValidationError(format!(
                            "procedure.defocus.{} = {} exceeds {:#x}",
                            name, value, MAX_DAC_VALUE
                        )));
                    }
                }
            }
            DefocusMethod::EnergyShift { ev } => {
                if !ev.is_finite() || ev.abs() > MAX_ENERGY_SHIFT_EV {
                    return Err(ConfigError::ValidationError(format!(
                        "procedure.defocus.ev = {} must be within ±{} eV",
                        ev, MAX_ENERGY_SHIFT_EV
                    )));
                }
            }
        }

        match &self.blanking {
            SpecimenBlanking::Apertures { kinds, .. } => {
                if kinds.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "procedure.blanking.kinds must list at least one aperture".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                for kind in kinds {
                    if !seen.insert(kind) {
                        return Err(ConfigError::ValidationError(format!(
                            "Duplicate blanking aperture: {}",
                            kind
                        )));
                    }
                    if *kind == self.cl_aperture {
                        return Err(ConfigError::ValidationError(format!(
                            "Blanking aperture {} is also the CL aperture",
                            kind
                        )));
                    }
                }
            }
            SpecimenBlanking::IlDeflector { value, .. } => {
                if value.x > MAX_DAC_VALUE || value.y > MAX_DAC_VALUE {
                    return Err(ConfigError::ValidationError(format!(
                        "procedure.blanking.value ({}, {}) exceeds {:#x}",
                        value.x, value.y, MAX_DAC_VALUE
                    )));
                }
            }
        }

        Ok(())
    }

    /// Apertures touched by a run: blanking apertures first, then the CL aperture.
    pub fn touched_apertures(&self) -> Vec<ApertureKind> {
        let mut kinds = match &self.blanking {
            SpecimenBlanking::Apertures { kinds, .. } => kinds.clone(),
            SpecimenBlanking::IlDeflector { .. } => Vec::new(),
        };
        kinds.push(self.cl_aperture);
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_console_procedure() {
        let config = ProcedureConfig::default();
        assert_eq!(config.duration, Duration::from_secs(600));
        assert_eq!(config.probe_size, 1);
        assert_eq!(
            config.defocus,
            DefocusMethod::FreeLensControl {
                cl1: 20000,
                cl2: 20000,
                cl3: 20000,
            }
        );
        assert_eq!(
            config.touched_apertures(),
            vec![ApertureKind(2), ApertureKind(4), ApertureKind(0)]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_duration() {
        let config = ProcedureConfig::default().with_duration(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_overlong_duration() {
        let config = ProcedureConfig::default().with_duration(MAX_DURATION + Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_lens_values() {
        let config = ProcedureConfig {
            defocus: DefocusMethod::FreeLensControl {
                cl1: 20000,
                cl2: 0x1_0000,
                cl3: 20000,
            },
            ..ProcedureConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cl2"));
    }

    #[test]
    fn rejects_non_finite_energy_shift() {
        let config = ProcedureConfig {
            defocus: DefocusMethod::EnergyShift { ev: f64::NAN },
            ..ProcedureConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_cl_aperture_as_blanking_aperture() {
        let config = ProcedureConfig {
            blanking: SpecimenBlanking::Apertures {
                kinds: vec![ApertureKind(0)],
                size: 0,
            },
            ..ProcedureConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_blanking_apertures() {
        let config = ProcedureConfig {
            blanking: SpecimenBlanking::Apertures {
                kinds: vec![ApertureKind(2), ApertureKind(2)],
                size: 0,
            },
            ..ProcedureConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn il_blanking_touches_only_cl_aperture() {
        let config = ProcedureConfig {
            blanking: SpecimenBlanking::IlDeflector {
                deflector: IlDeflector::ImageShift,
                value: default_blank_value(),
            },
            ..ProcedureConfig::default()
        };
        assert_eq!(config.touched_apertures(), vec![ApertureKind(0)]);
    }

    #[test]
    fn parses_tagged_methods_from_toml() {
        let settings = Settings::from_figment(Figment::from(Toml::string(
            r#"
            [procedure]
            duration = "15m"

            [procedure.defocus]
            method = "energy_shift"
            ev = 2000.0

            [procedure.blanking]
            method = "il_deflector"
            deflector = "fla"
            "#,
        )))
        .unwrap();

        assert_eq!(settings.procedure.duration, Duration::from_secs(900));
        assert_eq!(
            settings.procedure.defocus,
            DefocusMethod::EnergyShift { ev: 2000.0 }
        );
        assert_eq!(
            settings.procedure.blanking,
            SpecimenBlanking::IlDeflector {
                deflector: IlDeflector::Fla,
                value: DeflectorPair::new(0xFFFF, 0xFFFF),
            }
        );
    }
}
