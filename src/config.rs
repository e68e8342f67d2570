//! Layered configuration using Figment
//!
//! Settings are built from:
//! 1. Built-in defaults (the values the bench has always run with)
//! 2. A TOML file, `config/srsmicro.toml` unless overridden
//! 3. Environment variables prefixed with `SRSMICRO_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use srsmicro::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Laser port: {}", settings.laser.port);
//! # Ok::<(), srsmicro::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::instrument::delay_stage::BitOrder;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/srsmicro.toml";

static PORT_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(COM[0-9]+|/dev/[A-Za-z0-9._/-]+)$").ok());

/// Check that `port` looks like a serial port name on Windows (`COM7`) or Unix
/// (`/dev/ttyUSB0`).
pub fn validate_port_name(port: &str) -> AppResult<()> {
    let valid = PORT_NAME.as_ref().is_some_and(|re| re.is_match(port));
    if valid {
        Ok(())
    } else {
        Err(DaqError::InvalidSetting(format!(
            "'{port}' is not a serial port name (expected COM<n> or /dev/...)"
        )))
    }
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Status poller settings
    pub poller: PollerConfig,
    /// Insight laser serial line
    pub laser: SerialSettings,
    /// Delay stage serial line
    pub delay_stage: SerialSettings,
    /// Delay stage travel limits and decoding options
    pub stage: StageLimits,
    /// Lock-in amplifier session
    pub lockin: LockinSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

/// Poller timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Delay between status sweeps
    pub interval_ms: u64,
}

/// One serial instrument line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device name used for command routing and status events
    pub name: String,
    /// Serial port (e.g. "COM6", "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Default wait after a write before a response is valid
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

/// Delay stage travel range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLimits {
    /// Lower travel limit
    pub min_mm: f64,
    /// Upper travel limit
    pub max_mm: f64,
    /// How positioner-error bits are indexed
    pub bit_order: BitOrder,
}

/// Lock-in amplifier session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockinSettings {
    /// Device name used for command routing and status events
    pub name: String,
    /// Data server host
    pub host: String,
    /// YAML list of `[path, value]` pairs pushed at open
    pub parameter_file: PathBuf,
    /// Acquisition module poll period
    pub acquisition_period_ms: u64,
    /// Node (relative to the device) the acquisition module subscribes to
    pub data_node: String,
    /// Signal component appended to the subscribed node
    pub subscribe_suffix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "srsmicro".to_string(),
                log_level: "info".to_string(),
                log_format: "pretty".to_string(),
            },
            poller: PollerConfig { interval_ms: 1000 },
            laser: SerialSettings {
                name: "Insight".to_string(),
                port: "COM6".to_string(),
                baud_rate: 115_200,
                settle: Duration::from_millis(100),
            },
            delay_stage: SerialSettings {
                name: "Delay Stage".to_string(),
                port: "COM7".to_string(),
                baud_rate: 57_600,
                settle: Duration::from_millis(100),
            },
            stage: StageLimits {
                min_mm: -100.0,
                max_mm: 100.0,
                bit_order: BitOrder::MsbFirst,
            },
            lockin: LockinSettings {
                name: "Lockin".to_string(),
                host: "localhost".to_string(),
                parameter_file: PathBuf::from("config/zurich_params.yaml"),
                acquisition_period_ms: 1000,
                data_node: "demods/0/sample".to_string(),
                subscribe_suffix: "r".to_string(),
            },
        }
    }
}

impl Settings {
    /// Load settings from `config/srsmicro.toml` and the environment
    ///
    /// Environment variables override the file, e.g.
    /// `SRSMICRO_LASER__PORT=/dev/ttyUSB1`.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path. A missing file leaves the
    /// defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SRSMICRO_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.poller.interval_ms == 0 {
            return Err(DaqError::Configuration(
                "poller.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.lockin.acquisition_period_ms == 0 {
            return Err(DaqError::Configuration(
                "lockin.acquisition_period_ms must be greater than 0".to_string(),
            ));
        }

        for line in [&self.laser, &self.delay_stage] {
            validate_port_name(&line.port)
                .map_err(|e| DaqError::Configuration(format!("{}: {}", line.name, e)))?;
            if line.baud_rate == 0 {
                return Err(DaqError::Configuration(format!(
                    "{}: baud_rate must be greater than 0",
                    line.name
                )));
            }
        }

        if self.stage.min_mm >= self.stage.max_mm {
            return Err(DaqError::Configuration(format!(
                "stage.min_mm ({}) must be below stage.max_mm ({})",
                self.stage.min_mm, self.stage.max_mm
            )));
        }

        Ok(())
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poller.interval_ms)
    }
}
