//! Simulated Force Platform
//!
//! Provides an in-process platform for tests and for running the node without
//! hardware (`forceplate stream --simulate`). All waits use `tokio::time`, so
//! tests on a paused clock see exact timing.
//!
//! The driver and every backend it opens share one state block. Tests keep a
//! clone of the [`SimulatedPlatform`] to script faults (tare latency or
//! rejection, status codes, hanging reads, disconnects) and to inspect what
//! the node did (open/close/tare counts, last written configuration).
//!
//! # Example
//!
//! ```rust,ignore
//! let platform = SimulatedPlatform::new();
//! platform.set_tare_latency(Duration::from_millis(200));
//! let driver: Arc<dyn PlatformDriver> = Arc::new(platform.clone());
//! // ... run a session ...
//! assert_eq!(platform.tare_count(), 1);
//! assert!(!platform.is_claimed());
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::error::DeviceError;
use crate::hardware::capabilities::{
    AmplifierInfo, DiagnosticStatus, OpenRequest, PlatformBackend, PlatformCalibration,
    PlatformDriver, PlatformInfo, PlatformReport, RawFrame,
};
use crate::store::DeviceConfig;

/// Highest rate the simulation accepts.
pub const MAX_SIMULATED_RATE: u32 = 10_000;

/// Static properties of the simulated platform.
#[derive(Debug, Clone)]
pub struct SimulatedSettings {
    /// Serial reported by the platform.
    pub serial: String,
    /// Model reported by the platform.
    pub model: String,
    /// Analog channels per sample.
    pub channel_count: usize,
    /// Frames already buffered when the platform is opened.
    pub prebuffered: usize,
    /// Peak amplitude of the uniform noise added to every reading.
    pub noise: f64,
    /// RNG seed for reproducible noise.
    pub seed: u64,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            serial: "SIM-0001".to_string(),
            model: "SIM-6".to_string(),
            channel_count: 6,
            prebuffered: 16,
            noise: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    present: bool,
    tare_latency: Duration,
    reject_tares: bool,
    status_latency: Duration,
    status_queue: VecDeque<(i32, u64)>,
    default_status: i32,
    hang_reads: bool,
    disconnected: bool,
    counter_skip: u32,
    reject_config: bool,
    fail_read_config: bool,
}

#[derive(Debug, Default)]
struct SharedState {
    claimed: AtomicBool,
    opens: AtomicU64,
    closes: AtomicU64,
    tares: AtomicU64,
    reads: AtomicU64,
    script: Mutex<Script>,
    applied: Mutex<Option<DeviceConfig>>,
}

/// Simulated platform driver.
///
/// Cloning yields another view of the same platform.
#[derive(Debug, Clone)]
pub struct SimulatedPlatform {
    settings: SimulatedSettings,
    state: Arc<SharedState>,
}

impl SimulatedPlatform {
    /// Six-channel platform "SIM-0001".
    pub fn new() -> Self {
        Self::with_settings(SimulatedSettings::default())
    }

    /// Platform with custom static properties.
    pub fn with_settings(settings: SimulatedSettings) -> Self {
        let state = SharedState::default();
        state.script.lock().present = true;
        Self {
            settings,
            state: Arc::new(state),
        }
    }

    /// Six-channel platform with the given serial.
    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self::with_settings(SimulatedSettings {
            serial: serial.into(),
            ..Default::default()
        })
    }

    /// Static properties.
    pub fn settings(&self) -> &SimulatedSettings {
        &self.settings
    }

    // ---- scripting -------------------------------------------------------

    /// Unplug (`false`) or replug (`true`) the platform for future opens.
    pub fn set_present(&self, present: bool) {
        self.state.script.lock().present = present;
    }

    /// How long a tare takes before it is acknowledged.
    pub fn set_tare_latency(&self, latency: Duration) {
        self.state.script.lock().tare_latency = latency;
    }

    /// Make tares fail with `Rejected` after their latency.
    pub fn reject_tares(&self, reject: bool) {
        self.state.script.lock().reject_tares = reject;
    }

    /// How long a status check takes.
    pub fn set_status_latency(&self, latency: Duration) {
        self.state.script.lock().status_latency = latency;
    }

    /// Queue a status result; queued results are returned before the default.
    pub fn push_status(&self, code: i32, channel_faults: u64) {
        self.state
            .script
            .lock()
            .status_queue
            .push_back((code, channel_faults));
    }

    /// Code returned once the status queue is empty.
    pub fn set_default_status(&self, code: i32) {
        self.state.script.lock().default_status = code;
    }

    /// Make reads never complete.
    pub fn hang_reads(&self, hang: bool) {
        self.state.script.lock().hang_reads = hang;
    }

    /// Make every operation on open backends fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.state.script.lock().disconnected = true;
    }

    /// Skip `count` counter values on the next read, as after a buffer overrun.
    pub fn skip_counter(&self, count: u32) {
        self.state.script.lock().counter_skip = count;
    }

    /// Make `write_config` fail with `Rejected`.
    pub fn reject_config(&self, reject: bool) {
        self.state.script.lock().reject_config = reject;
    }

    /// Make `read_config` fail with `Disconnected`.
    pub fn fail_read_config(&self, fail: bool) {
        self.state.script.lock().fail_read_config = fail;
    }

    // ---- inspection ------------------------------------------------------

    /// Whether a backend currently holds the platform.
    pub fn is_claimed(&self) -> bool {
        self.state.claimed.load(Ordering::SeqCst)
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Releases so far.
    pub fn close_count(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Tares issued so far (acknowledged or not).
    pub fn tare_count(&self) -> u64 {
        self.state.tares.load(Ordering::SeqCst)
    }

    /// Frames delivered so far.
    pub fn read_count(&self) -> u64 {
        self.state.reads.load(Ordering::SeqCst)
    }

    /// Configuration most recently applied with `write_config`.
    pub fn applied_config(&self) -> Option<DeviceConfig> {
        self.state.applied.lock().clone()
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformDriver for SimulatedPlatform {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn open(&self, request: &OpenRequest) -> Result<Box<dyn PlatformBackend>, DeviceError> {
        if !self.state.script.lock().present {
            return Err(DeviceError::NotFound {
                message: format!("no simulated platform at index {}", request.index),
            });
        }
        if request.index != 0 {
            return Err(DeviceError::NotFound {
                message: format!("index {} out of range (1 device)", request.index),
            });
        }
        if let Some(serial) = &request.serial {
            if serial != &self.settings.serial {
                return Err(DeviceError::NotFound {
                    message: format!(
                        "requested serial '{}' but platform is '{}'",
                        serial, self.settings.serial
                    ),
                });
            }
        }
        if request.sample_rate == 0 || request.sample_rate > MAX_SIMULATED_RATE {
            return Err(DeviceError::Unsupported {
                message: format!(
                    "sample rate {} Hz outside 1..={} Hz",
                    request.sample_rate, MAX_SIMULATED_RATE
                ),
            });
        }
        if self
            .state
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::Busy {
                serial: self.settings.serial.clone(),
            });
        }

        let opened = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            serial = %self.settings.serial,
            rate = request.sample_rate,
            "Simulated platform opened"
        );

        Ok(Box::new(SimulatedBackend::new(
            &self.settings,
            request.sample_rate,
            Arc::clone(&self.state),
            self.settings.seed.wrapping_add(opened),
        )))
    }
}

/// Open connection to a [`SimulatedPlatform`].
pub struct SimulatedBackend {
    info: PlatformInfo,
    state: Arc<SharedState>,
    rng: StdRng,
    noise: f64,
    baseline: Vec<f64>,
    offsets: Vec<f64>,
    config: DeviceConfig,
    counter: u32,
    buffered: usize,
    closed: bool,
}

impl SimulatedBackend {
    fn new(settings: &SimulatedSettings, sample_rate: u32, state: Arc<SharedState>, seed: u64) -> Self {
        let channels = settings.channel_count;
        // Someone standing still on a six-axis plate; generic ramps otherwise
        let baseline = if channels == 6 {
            vec![2.0, -1.5, 700.0, 0.3, -0.2, 0.05]
        } else {
            (0..channels).map(|i| 0.01 * (i as f64 + 1.0)).collect()
        };

        Self {
            info: PlatformInfo {
                serial: settings.serial.clone(),
                model: settings.model.clone(),
                channel_count: channels,
                sample_rate,
            },
            state,
            rng: StdRng::seed_from_u64(seed),
            noise: settings.noise,
            baseline,
            offsets: vec![0.0; channels],
            config: DeviceConfig::unity(settings.serial.clone(), channels, 10.0),
            counter: 0,
            buffered: settings.prebuffered,
            closed: false,
        }
    }

    fn check_connected(&self) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed {
                serial: self.info.serial.clone(),
            });
        }
        if self.state.script.lock().disconnected {
            return Err(DeviceError::Disconnected {
                message: format!("simulated platform '{}' unplugged", self.info.serial),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformBackend for SimulatedBackend {
    fn info(&self) -> &PlatformInfo {
        &self.info
    }

    async fn read(&mut self) -> Result<RawFrame, DeviceError> {
        self.check_connected()?;
        let (hang, skip) = {
            let mut script = self.state.script.lock();
            (script.hang_reads, std::mem::take(&mut script.counter_skip))
        };
        if hang {
            std::future::pending::<()>().await;
        }

        self.counter = self.counter.wrapping_add(1 + skip) & amti_counter_mask();
        let readings = self
            .baseline
            .iter()
            .zip(&self.config.channel_gains)
            .zip(&self.offsets)
            .map(|((base, gain), offset)| {
                let noise = if self.noise > 0.0 {
                    self.rng.gen_range(-self.noise..=self.noise)
                } else {
                    0.0
                };
                base * gain - offset + noise
            })
            .collect();

        self.state.reads.fetch_add(1, Ordering::SeqCst);
        Ok(RawFrame {
            readings,
            counter: Some(self.counter),
            trigger: Some(0.0),
        })
    }

    async fn flush(&mut self) -> Result<usize, DeviceError> {
        self.check_connected()?;
        let dropped = std::mem::take(&mut self.buffered);
        self.counter = self.counter.wrapping_add(dropped as u32) & amti_counter_mask();
        Ok(dropped)
    }

    async fn write_config(&mut self, config: &DeviceConfig) -> Result<(), DeviceError> {
        self.check_connected()?;
        if self.state.script.lock().reject_config {
            return Err(DeviceError::Rejected {
                operation: "write_config",
                message: "amplifier refused settings".to_string(),
            });
        }
        if config.channel_gains.len() != self.info.channel_count {
            return Err(DeviceError::Rejected {
                operation: "write_config",
                message: format!(
                    "{} gains for {} channels",
                    config.channel_gains.len(),
                    self.info.channel_count
                ),
            });
        }
        self.config = config.clone();
        *self.state.applied.lock() = Some(config.clone());
        debug!(serial = %self.info.serial, "Simulated platform configured");
        Ok(())
    }

    async fn read_config(&mut self) -> Result<DeviceConfig, DeviceError> {
        self.check_connected()?;
        if self.state.script.lock().fail_read_config {
            return Err(DeviceError::Disconnected {
                message: "configuration readback failed".to_string(),
            });
        }
        Ok(self.config.clone())
    }

    async fn tare(&mut self) -> Result<(), DeviceError> {
        self.check_connected()?;
        let (latency, reject) = {
            let script = self.state.script.lock();
            (script.tare_latency, script.reject_tares)
        };
        self.state.tares.fetch_add(1, Ordering::SeqCst);
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if reject {
            return Err(DeviceError::Rejected {
                operation: "tare",
                message: "platform loaded during zero".to_string(),
            });
        }
        self.offsets = self
            .baseline
            .iter()
            .zip(&self.config.channel_gains)
            .map(|(base, gain)| base * gain)
            .collect();
        Ok(())
    }

    async fn status(&mut self) -> Result<DiagnosticStatus, DeviceError> {
        self.check_connected()?;
        let (latency, next) = {
            let mut script = self.state.script.lock();
            let next = script
                .status_queue
                .pop_front()
                .unwrap_or((script.default_status, 0));
            (script.status_latency, next)
        };
        if !latency.is_zero() {
            sleep(latency).await;
        }
        Ok(DiagnosticStatus::new(next.0).with_channel_faults(next.1))
    }

    async fn report(&mut self) -> Result<PlatformReport, DeviceError> {
        self.check_connected()?;
        let channels = self.info.channel_count;
        Ok(PlatformReport {
            init_code: 1,
            setup_check: 1,
            device_count: 1,
            run_mode: 1,
            acquisition_rate: self.info.sample_rate as i32,
            gains: self.config.channel_gains.iter().map(|g| *g as i64).collect(),
            excitations: vec![self.config.excitation_voltage as i64; channels],
            channel_offsets: self.offsets.clone(),
            amplifier: AmplifierInfo {
                product_type: 0,
                model_number: "SIM-AMP".to_string(),
                serial_number: format!("{}-AMP", self.info.serial),
                firmware_version: env!("CARGO_PKG_VERSION").to_string(),
                calibration_date: "2024-01-01".to_string(),
            },
            platform: PlatformCalibration {
                model_number: self.info.model.clone(),
                serial_number: self.info.serial.clone(),
                calibration_date: "2024-01-01".to_string(),
                capacity: vec![2000.0; channels],
            },
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state.claimed.store(false, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        info!(serial = %self.info.serial, "Simulated platform released");
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// The simulated counter wraps like the AMTI 24-bit counter.
const fn amti_counter_mask() -> u32 {
    (1 << 24) - 1
}
