//! Platform Capabilities
//!
//! This module defines the seam between the acquisition core and a concrete
//! force platform. A platform is reached in two steps:
//!
//! - [`PlatformDriver`] locates and claims a physical (or simulated) platform.
//!   It is shared (`Arc<dyn PlatformDriver>`) and may be asked to open many
//!   times over the life of a process.
//! - [`PlatformBackend`] is the claimed connection. It is owned by exactly one
//!   [`crate::device::DeviceHandle`]; every operation takes `&mut self`, so two
//!   native operations can never overlap on one connection.
//!
//! # Design Philosophy
//!
//! Each backend operation:
//! - Is async (uses #[async_trait]), except `close`, which must be callable from `Drop`
//! - Returns [`DeviceError`] so the caller can tell fatal from transient failures
//! - Does not bound its own latency; the handle applies timeouts
//!
//! # Example
//!
//! ```rust,ignore
//! let driver: Arc<dyn PlatformDriver> = Arc::new(SimulatedPlatform::new());
//! let mut backend = driver.open(&OpenRequest::new(100)).await?;
//! let frame = backend.read().await?;
//! assert_eq!(frame.readings.len(), backend.info().channel_count);
//! backend.close();
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::store::DeviceConfig;

/// What the caller asks a driver to open.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    /// Required platform serial; `None` accepts whichever platform is at `index`.
    pub serial: Option<String>,
    /// Device index on the vendor bus.
    pub index: u32,
    /// Acquisition rate in Hz.
    pub sample_rate: u32,
}

impl OpenRequest {
    /// Request the first platform at the given rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            serial: None,
            index: 0,
            sample_rate,
        }
    }

    /// Require a specific platform serial.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Select a device index.
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }
}

/// Static facts about an open platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Platform serial number; the key for persisted configuration.
    pub serial: String,
    /// Platform model, as reported by the device.
    pub model: String,
    /// Number of analog channels per sample.
    pub channel_count: usize,
    /// Acquisition rate in Hz.
    pub sample_rate: u32,
}

/// One undecorated frame as delivered by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Per-channel readings, length == channel count.
    pub readings: Vec<f64>,
    /// Hardware sample counter, when the platform provides one.
    pub counter: Option<u32>,
    /// Trigger input value, when the platform provides one.
    pub trigger: Option<f64>,
}

/// Result of one status check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticStatus {
    /// Vendor status code.
    pub code: i32,
    /// Bit `n` set means channel `n` reports a fault.
    pub channel_faults: u64,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl DiagnosticStatus {
    /// A status with no channel faults, checked now.
    pub fn new(code: i32) -> Self {
        Self {
            code,
            channel_faults: 0,
            checked_at: Utc::now(),
        }
    }

    /// Set the channel fault bitmap.
    pub fn with_channel_faults(mut self, bitmap: u64) -> Self {
        self.channel_faults = bitmap;
        self
    }

    /// Channels flagged in the bitmap.
    pub fn faulted_channels(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(move |bit| self.channel_faults & (1 << bit) != 0)
    }
}

/// One-shot description of the connected platform, captured after open.
///
/// Attached as metadata to the first record of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformReport {
    /// Driver library initialisation code.
    pub init_code: i32,
    /// Setup check code.
    pub setup_check: i32,
    /// Devices visible on the bus.
    pub device_count: i32,
    /// Active run mode.
    pub run_mode: i32,
    /// Active acquisition rate in Hz.
    pub acquisition_rate: i32,
    /// Gain setting per channel, as reported by the amplifier.
    pub gains: Vec<i64>,
    /// Excitation setting per channel, as reported by the amplifier.
    pub excitations: Vec<i64>,
    /// Channel zero offsets.
    pub channel_offsets: Vec<f64>,
    /// Amplifier identification.
    pub amplifier: AmplifierInfo,
    /// Platform identification and calibration.
    pub platform: PlatformCalibration,
}

/// Amplifier identification block of a [`PlatformReport`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmplifierInfo {
    pub product_type: i32,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub calibration_date: String,
}

/// Platform calibration block of a [`PlatformReport`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformCalibration {
    pub model_number: String,
    pub serial_number: String,
    pub calibration_date: String,
    /// Rated capacity per channel.
    pub capacity: Vec<f64>,
}

/// Locates and claims platforms.
#[async_trait]
pub trait PlatformDriver: Send + Sync {
    /// Short identifier used in logs ("simulated", "amti").
    fn name(&self) -> &str;

    /// Claim a platform.
    ///
    /// # Errors
    /// `NotFound` when nothing matches the request, `Busy` when the platform
    /// is already claimed, `DriverMismatch` when the vendor library is
    /// missing or fails to initialise, `Unsupported` for a rate the platform
    /// cannot run at.
    async fn open(&self, request: &OpenRequest) -> Result<Box<dyn PlatformBackend>, DeviceError>;
}

/// An open connection to one platform.
#[async_trait]
pub trait PlatformBackend: Send {
    /// Facts about the connected platform.
    fn info(&self) -> &PlatformInfo;

    /// Wait for the next frame.
    async fn read(&mut self) -> Result<RawFrame, DeviceError>;

    /// Discard every frame buffered so far; returns how many were dropped.
    async fn flush(&mut self) -> Result<usize, DeviceError>;

    /// Apply gains, excitation and channel mask.
    async fn write_config(&mut self, config: &DeviceConfig) -> Result<(), DeviceError>;

    /// Snapshot the platform's current settings.
    async fn read_config(&mut self) -> Result<DeviceConfig, DeviceError>;

    /// Zero the platform offsets and wait for acknowledgment.
    async fn tare(&mut self) -> Result<(), DeviceError>;

    /// Check device and channel health.
    async fn status(&mut self) -> Result<DiagnosticStatus, DeviceError>;

    /// Collect the one-shot platform report.
    async fn report(&mut self) -> Result<PlatformReport, DeviceError>;

    /// Release the native resource. Idempotent; never fails.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faulted_channels_from_bitmap() {
        let status = DiagnosticStatus::new(0).with_channel_faults(0b100101);
        let channels: Vec<usize> = status.faulted_channels().collect();
        assert_eq!(channels, vec![0, 2, 5]);
    }

    #[test]
    fn open_request_builder() {
        let request = OpenRequest::new(250).with_serial("PF001").with_index(1);
        assert_eq!(request.serial.as_deref(), Some("PF001"));
        assert_eq!(request.index, 1);
        assert_eq!(request.sample_rate, 250);
    }
}
