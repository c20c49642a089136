//! Node Options using Figment
//!
//! Strongly-typed options for a [`crate::node::StreamingNode`] session.
//! Options are loaded from:
//! 1. `config/forceplate.toml` (base options)
//! 2. Environment variables (prefixed with `FORCEPLATE_`, nested keys split on `__`)
//!
//! Every field has a default, so an absent file yields a usable simulated
//! session.
//!
//! # Example
//! ```no_run
//! use forceplate_daq::config::NodeOptions;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = NodeOptions::load()?;
//! options.validate()?;
//! println!("Sampling at {} Hz", options.sample_rate);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::diagnostics::StatusPolicy;
use crate::error::SessionError;

/// Default location of the options file, relative to the working directory.
pub const DEFAULT_OPTIONS_FILE: &str = "config/forceplate.toml";

/// Options for one acquisition session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeOptions {
    /// Serial of the platform to open. `None` opens whatever answers at `device_index`.
    pub device_serial: Option<String>,
    /// Device index on the vendor bus (chained amplifiers).
    pub device_index: u32,
    /// Sampling rate in Hz. Also the cadence of the output stream.
    pub sample_rate: u32,
    /// Per-channel gains used when no configuration is persisted for the platform.
    /// Empty means unity gain on every channel.
    pub channel_gains: Vec<f64>,
    /// Bridge excitation voltage used when nothing is persisted.
    pub excitation_voltage: f64,
    /// Directory holding one persisted configuration per platform serial.
    pub config_path: PathBuf,
    /// Upper bound on a single device read.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Upper bound on a tare acknowledgment.
    #[serde(with = "humantime_serde")]
    pub tare_timeout: Duration,
    /// How long `stop()` waits for the sampling loop before forcing teardown.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Status poll period, in ticks.
    pub diagnostics_interval: u64,
    /// Upper bound on a single status poll.
    #[serde(with = "humantime_serde")]
    pub diagnostics_budget: Duration,
    /// Consecutive transient faults that exhaust the retry budget.
    pub retry_budget: u32,
    /// Capacity of the output channel.
    pub output_capacity: usize,
    /// Tare once right after the platform starts acquiring.
    pub auto_zero: bool,
    /// Status code classification.
    pub status_policy: StatusPolicy,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            device_serial: None,
            device_index: 0,
            sample_rate: 500,
            channel_gains: Vec::new(),
            excitation_voltage: 10.0,
            config_path: default_config_path(),
            read_timeout: Duration::from_millis(100),
            tare_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            diagnostics_interval: 500,
            diagnostics_budget: Duration::from_millis(50),
            retry_budget: 5,
            output_capacity: 4096,
            auto_zero: true,
            status_policy: StatusPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

/// `<platform config dir>/forceplate_daq/devices`, or `./devices` when the
/// platform has no config dir.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("forceplate_daq").join("devices"))
        .unwrap_or_else(|| PathBuf::from("devices"))
}

impl NodeOptions {
    /// Load options from `config/forceplate.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `FORCEPLATE_`.
    /// Example: `FORCEPLATE_SAMPLE_RATE=1000`, `FORCEPLATE_STATUS_POLICY__BENIGN_CODES=[0,1]`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_OPTIONS_FILE)
    }

    /// Load options from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack, exposed so callers can merge their own overrides.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(NodeOptions::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FORCEPLATE_").split("__"))
    }

    /// Validate options after loading
    pub fn validate(&self) -> Result<(), SessionError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.sample_rate == 0 {
            return Err(invalid("sample_rate must be greater than 0 Hz"));
        }

        if let Some(serial) = &self.device_serial {
            if serial.trim().is_empty() {
                return Err(invalid("device_serial must not be blank"));
            }
        }

        if let Some(gain) = self.channel_gains.iter().find(|g| !g.is_finite() || **g <= 0.0) {
            return Err(invalid(format!(
                "channel_gains must be positive and finite, got {}",
                gain
            )));
        }

        if !self.excitation_voltage.is_finite() || self.excitation_voltage < 0.0 {
            return Err(invalid(format!(
                "Invalid excitation_voltage {}. Must be a non-negative voltage",
                self.excitation_voltage
            )));
        }

        for (name, value) in [
            ("read_timeout", self.read_timeout),
            ("tare_timeout", self.tare_timeout),
            ("stop_grace", self.stop_grace),
            ("diagnostics_budget", self.diagnostics_budget),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{} must be greater than zero", name)));
            }
        }

        if self.diagnostics_interval == 0 {
            return Err(invalid("diagnostics_interval must be at least 1 tick"));
        }

        if self.retry_budget == 0 {
            return Err(invalid("retry_budget must be at least 1"));
        }

        if self.output_capacity == 0 {
            return Err(invalid("output_capacity must be at least 1"));
        }

        self.status_policy.validate().map_err(invalid)?;

        Ok(())
    }

    /// Period of one tick of the sampling loop.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.sample_rate.max(1)))
    }
}

fn invalid(message: impl Into<String>) -> SessionError {
    SessionError::InvalidOptions(message.into())
}
