//! Persisted per-platform configuration.
//!
//! One TOML file per platform serial lives under the store directory. Saves
//! go through a temporary file in the same directory that is fsynced and then
//! renamed over the target, so a crash mid-save leaves either the old or the
//! new record, never a torn one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NodeOptions;
use crate::error::PersistenceError;

/// Settings applied to one physical platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Platform serial number.
    pub serial: String,
    /// Gain per channel.
    pub channel_gains: Vec<f64>,
    /// Bridge excitation voltage.
    pub excitation_voltage: f64,
    /// `true` for every channel that is acquired and monitored.
    pub channel_mask: Vec<bool>,
}

impl DeviceConfig {
    /// Unity gains with every channel enabled.
    pub fn unity(serial: impl Into<String>, channel_count: usize, excitation_voltage: f64) -> Self {
        Self {
            serial: serial.into(),
            channel_gains: vec![1.0; channel_count],
            excitation_voltage,
            channel_mask: vec![true; channel_count],
        }
    }

    /// Built-in default for a platform that has nothing persisted.
    ///
    /// Gains come from the options when given, otherwise unity. The options'
    /// gains are taken as-is, so a count that disagrees with the platform is
    /// caught by [`DeviceConfig::validate_for`].
    pub fn from_options(options: &NodeOptions, serial: &str, channel_count: usize) -> Self {
        let mut config = Self::unity(serial, channel_count, options.excitation_voltage);
        if !options.channel_gains.is_empty() {
            config.channel_gains = options.channel_gains.clone();
        }
        config
    }

    /// Check this configuration against the connected platform.
    pub fn validate_for(&self, channel_count: usize) -> Result<(), String> {
        if self.channel_gains.len() != channel_count {
            return Err(format!(
                "{} channel gains configured but the platform has {} channels",
                self.channel_gains.len(),
                channel_count
            ));
        }
        if self.channel_mask.len() != channel_count {
            return Err(format!(
                "channel mask covers {} channels but the platform has {} channels",
                self.channel_mask.len(),
                channel_count
            ));
        }
        if let Some(gain) = self.channel_gains.iter().find(|g| !g.is_finite() || **g <= 0.0) {
            return Err(format!("gain {} is not a positive finite value", gain));
        }
        if !self.excitation_voltage.is_finite() || self.excitation_voltage < 0.0 {
            return Err(format!(
                "excitation voltage {} is not a valid voltage",
                self.excitation_voltage
            ));
        }
        Ok(())
    }

    /// Number of enabled channels.
    pub fn enabled_channels(&self) -> usize {
        self.channel_mask.iter().filter(|enabled| **enabled).count()
    }

    /// Channel mask as a bitmap (bit `n` set when channel `n` is enabled).
    pub fn mask_bits(&self) -> u64 {
        self.channel_mask
            .iter()
            .take(64)
            .enumerate()
            .filter(|(_, enabled)| **enabled)
            .fold(0u64, |bits, (index, _)| bits | (1 << index))
    }
}

/// Directory-backed store of [`DeviceConfig`] records keyed by serial.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    /// Store rooted at `root`. The directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the options' `config_path`.
    pub fn from_options(options: &NodeOptions) -> Self {
        Self::new(options.config_path.clone())
    }

    /// Store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the record for `serial`.
    pub fn path_for(&self, serial: &str) -> PathBuf {
        self.root.join(format!("{}.toml", sanitize_serial(serial)))
    }

    /// Persisted configuration for `serial`, if any.
    ///
    /// Never fails: a missing file is `None`, and an unreadable or corrupt
    /// file is logged as a persistence warning and also yields `None`, so the
    /// caller falls back to its built-in default.
    pub fn load(&self, serial: &str) -> Option<DeviceConfig> {
        match self.try_load(serial) {
            Ok(Some(config)) => {
                info!(serial, path = %self.path_for(serial).display(), "Loaded persisted device configuration");
                Some(config)
            }
            Ok(None) => {
                debug!(serial, "No persisted device configuration");
                None
            }
            Err(e) => {
                warn!(serial, error = %e, "Ignoring persisted device configuration");
                None
            }
        }
    }

    /// Persisted configuration for `serial`, or `default`.
    pub fn load_or(&self, serial: &str, default: DeviceConfig) -> DeviceConfig {
        self.load(serial).unwrap_or(default)
    }

    fn try_load(&self, serial: &str) -> Result<Option<DeviceConfig>, PersistenceError> {
        let path = self.path_for(serial);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };

        let config: DeviceConfig = toml::from_str(&contents).map_err(|e| PersistenceError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        if config.serial != serial {
            return Err(PersistenceError::Parse {
                path,
                message: format!("record belongs to serial '{}'", config.serial),
            });
        }

        Ok(Some(config))
    }

    /// Persist `config` as the record for `serial`.
    ///
    /// Writes `<serial>.toml.tmp`, fsyncs it, renames it over `<serial>.toml`
    /// and fsyncs the directory where the platform allows it.
    pub fn save(&self, serial: &str, config: &DeviceConfig) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.root).map_err(|e| PersistenceError::io(&self.root, e))?;

        let target = self.path_for(serial);
        let temp = target.with_extension("toml.tmp");
        let encoded = toml::to_string_pretty(config)?;

        let write_temp = || -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(encoded.as_bytes())?;
            file.sync_all()
        };
        if let Err(e) = write_temp() {
            let _ = fs::remove_file(&temp);
            return Err(PersistenceError::io(&temp, e));
        }

        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(PersistenceError::io(&target, e));
        }

        // Directory fsync is unsupported on some platforms
        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }

        info!(serial, path = %target.display(), "Saved device configuration");
        Ok(())
    }
}

/// Map a serial to a safe file stem.
fn sanitize_serial(serial: &str) -> String {
    let stem: String = serial
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "unnamed".to_string()
    } else {
        stem
    }
}
