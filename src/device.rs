//! Device handle.
//!
//! [`DeviceHandle`] wraps an open [`PlatformBackend`] with RAII semantics:
//! the native resource is released by [`DeviceHandle::close`] or, failing
//! that, when the handle is dropped. Every operation after close fails with
//! [`DeviceError::Closed`] instead of touching the released resource.
//!
//! The handle also turns backend frames into [`Sample`]s:
//! - timestamps come from the sample index and the sampling rate, starting at
//!   the first read after [`DeviceHandle::flush`] (the device clock is trusted)
//! - counter discontinuities are logged and counted, except the 24-bit rollover
//! - drift between expected and delivered sample counts is logged at debug level

use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::hardware::capabilities::{
    DiagnosticStatus, OpenRequest, PlatformBackend, PlatformDriver, PlatformInfo, PlatformReport,
};
use crate::sample::Sample;
use crate::store::DeviceConfig;

/// Value after which hardware sample counters wrap to zero.
pub const COUNTER_ROLLOVER: u32 = (1 << 24) - 1;

/// Connection lifecycle of a [`DeviceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    /// Released; every operation fails with `Closed`.
    Closed,
    /// Claimed and configured, not yet streaming.
    Open,
    /// Delivering samples.
    Streaming,
    /// A fatal error was observed; only `close` is meaningful.
    Faulted,
}

/// Exclusive owner of one open platform connection.
pub struct DeviceHandle {
    backend: Option<Box<dyn PlatformBackend>>,
    info: PlatformInfo,
    state: ConnectionState,
    read_timeout: Duration,
    origin: Option<Instant>,
    sample_index: u64,
    last_counter: Option<u32>,
    discontinuities: u64,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("serial", &self.info.serial)
            .field("state", &self.state)
            .field("sample_index", &self.sample_index)
            .finish()
    }
}

impl DeviceHandle {
    /// Open a platform through `driver`.
    ///
    /// `read_timeout` bounds every [`read`](Self::read) and
    /// [`read_config`](Self::read_config).
    pub async fn open(
        driver: &dyn PlatformDriver,
        request: &OpenRequest,
        read_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        debug!(driver = driver.name(), ?request, "Opening platform");
        let backend = driver.open(request).await?;
        let info = backend.info().clone();
        info!(
            serial = %info.serial,
            model = %info.model,
            channels = info.channel_count,
            rate = info.sample_rate,
            "Platform opened"
        );
        Ok(Self::from_backend(backend, read_timeout))
    }

    /// Wrap an already-open backend.
    pub fn from_backend(backend: Box<dyn PlatformBackend>, read_timeout: Duration) -> Self {
        let info = backend.info().clone();
        Self {
            backend: Some(backend),
            info,
            state: ConnectionState::Open,
            read_timeout,
            origin: None,
            sample_index: 0,
            last_counter: None,
            discontinuities: 0,
        }
    }

    /// Platform facts captured at open.
    pub fn info(&self) -> &PlatformInfo {
        &self.info
    }

    /// Platform serial.
    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    /// Analog channels per sample.
    pub fn channel_count(&self) -> usize {
        self.info.channel_count
    }

    /// Sampling rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the native resource has been released.
    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    /// Counter discontinuities seen so far.
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Samples delivered (or dropped by a mid-stream flush) since the first read.
    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    fn backend(&mut self) -> Result<&mut (dyn PlatformBackend + 'static), DeviceError> {
        match self.backend.as_deref_mut() {
            Some(backend) => Ok(backend),
            None => Err(DeviceError::Closed {
                serial: self.info.serial.clone(),
            }),
        }
    }

    /// Mark the handle as delivering samples.
    pub fn mark_streaming(&mut self) {
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Streaming;
        }
    }

    /// Mark the handle as unusable after a fatal error.
    pub fn mark_faulted(&mut self) {
        if !self.is_closed() {
            self.state = ConnectionState::Faulted;
        }
    }

    /// Read one sample, bounded by the read timeout.
    ///
    /// # Errors
    /// `Timeout` if no frame arrives in time, `Disconnected` if the platform
    /// went away, `Closed` after close.
    pub async fn read(&mut self) -> Result<Sample, DeviceError> {
        let limit = self.read_timeout;
        let serial = self.info.serial.clone();
        let backend = self.backend()?;
        let frame = match timeout(limit, backend.read()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeviceError::Timeout {
                    operation: "read",
                    timeout: limit,
                })
            }
        };

        if frame.readings.len() != self.info.channel_count {
            return Err(DeviceError::Rejected {
                operation: "read",
                message: format!(
                    "frame from '{}' has {} readings, expected {}",
                    serial,
                    frame.readings.len(),
                    self.info.channel_count
                ),
            });
        }

        let origin = *self.origin.get_or_insert_with(Instant::now);
        let valid = self.check_counter(frame.counter);
        let timestamp = self.sample_index as f64 / f64::from(self.info.sample_rate);
        self.sample_index += 1;
        self.log_drift(origin);

        Ok(Sample {
            timestamp,
            readings: frame.readings,
            valid,
            counter: frame.counter,
            trigger: frame.trigger,
        })
    }

    /// Returns `false` when `counter` does not follow the previous one.
    fn check_counter(&mut self, counter: Option<u32>) -> bool {
        let Some(current) = counter else {
            return true;
        };
        let previous = self.last_counter.replace(current);
        match previous {
            Some(prev) if prev == COUNTER_ROLLOVER && current == 0 => true,
            Some(prev) if prev.wrapping_add(1) != current => {
                self.discontinuities += 1;
                warn!(
                    serial = %self.info.serial,
                    previous = prev,
                    current,
                    total = self.discontinuities,
                    "Discontinuity on sample count. Possible buffer overflow, check sampling rate"
                );
                false
            }
            _ => true,
        }
    }

    fn log_drift(&self, origin: Instant) {
        let rate = u64::from(self.info.sample_rate.max(1));
        if self.sample_index % rate != 0 {
            return;
        }
        let elapsed = origin.elapsed().as_secs_f64();
        let expected = (elapsed * rate as f64).round() as i64;
        let actual = self.sample_index as i64;
        debug!(
            serial = %self.info.serial,
            elapsed_seconds = elapsed,
            expected,
            actual,
            diff = expected - actual,
            diff_seconds = (expected - actual) as f64 / rate as f64,
            "Sample count drift"
        );
    }

    /// Drop buffered frames.
    ///
    /// Before the first read this discards what accumulated since
    /// initialisation. Mid-stream (after a tare) the dropped frames still
    /// advance the sample index so device timestamps stay on the device clock.
    pub async fn flush(&mut self) -> Result<usize, DeviceError> {
        let dropped = self.backend()?.flush().await?;
        if self.origin.is_some() {
            self.sample_index += dropped as u64;
            info!(serial = %self.info.serial, dropped, "Dropped buffered samples after tare");
        } else {
            info!(
                serial = %self.info.serial,
                dropped,
                "Dropped samples buffered between initialization and first read"
            );
        }
        self.last_counter = None;
        Ok(dropped)
    }

    /// Apply a configuration after checking it against the platform.
    pub async fn write_config(&mut self, config: &DeviceConfig) -> Result<(), DeviceError> {
        let channels = self.info.channel_count;
        let backend = self.backend()?;
        config
            .validate_for(channels)
            .map_err(|message| DeviceError::Rejected {
                operation: "write_config",
                message,
            })?;
        backend.write_config(config).await
    }

    /// Snapshot the platform's current settings, bounded by the read timeout.
    pub async fn read_config(&mut self) -> Result<DeviceConfig, DeviceError> {
        let limit = self.read_timeout;
        let backend = self.backend()?;
        match timeout(limit, backend.read_config()).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout {
                operation: "read_config",
                timeout: limit,
            }),
        }
    }

    /// Issue a tare and wait for the platform's acknowledgment.
    ///
    /// Unbounded; the caller applies the tare timeout.
    pub async fn tare(&mut self) -> Result<(), DeviceError> {
        self.backend()?.tare().await
    }

    /// Query device and channel health. Unbounded; the caller applies the
    /// diagnostics budget.
    pub async fn status(&mut self) -> Result<DiagnosticStatus, DeviceError> {
        self.backend()?.status().await
    }

    /// Collect the platform report.
    pub async fn report(&mut self) -> Result<PlatformReport, DeviceError> {
        self.backend()?.report().await
    }

    /// Release the native resource.
    ///
    /// Idempotent and infallible; safe after any failed operation.
    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            self.state = ConnectionState::Closed;
            info!(serial = %self.info.serial, "Device handle closed");
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.backend.is_some() {
            warn!(serial = %self.info.serial, "Device handle dropped without close; releasing");
            self.close();
        }
    }
}
