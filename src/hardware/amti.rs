//! AMTI force platform backend.
//!
//! Drives an AMTI signal conditioner through `AMTIUSBDevice.dll` (USB Device
//! SDK 1.3.00) in the one configuration this crate supports:
//!
//! - 6 analog channels plus sample counter and trigger (data format 1)
//! - metric, fully conditioned run mode (SDK section 21)
//! - no genlock
//!
//! The DLL holds process-global state, so at most one [`AmtiBackend`] exists
//! at a time. A second open while one is alive fails with `Busy`. After a
//! release the SDK requires 500 ms before it may be initialised again; the
//! next open waits out whatever remains of that window.

#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::ffi::CStr;
use std::os::raw::{c_char, c_float, c_int, c_long};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use amti_sys::*;

use crate::error::DeviceError;
use crate::hardware::capabilities::{
    AmplifierInfo, DiagnosticStatus, OpenRequest, PlatformBackend, PlatformCalibration,
    PlatformDriver, PlatformInfo, PlatformReport, RawFrame,
};
use crate::store::DeviceConfig;

/// Supported sampling rates in Hz.
pub const SAMPLING_RATES: [u32; 34] = [
    2000, 1800, 1500, 1200, 1000, 900, 800, 600, 500, 450, 400, 360, 300, 250, 240, 225, 200, 180,
    150, 125, 120, 100, 90, 80, 75, 60, 50, 45, 40, 30, 25, 20, 15, 10,
];

/// Rates above this drift noticeably without genlock.
pub const MAX_RECOMMENDED_RATE: u32 = 1000;

/// Gain steps selectable per channel; the index is the SDK gain code.
pub const GAIN_STEPS: [f64; 4] = [1.0, 2.0, 4.0, 8.0];

/// Bridge excitation voltages; the index is the SDK excitation code.
pub const EXCITATION_STEPS: [f64; 3] = [2.5, 5.0, 10.0];

const INIT_ATTEMPTS: u32 = 3;
const INIT_POLL: Duration = Duration::from_millis(250);
const RELEASE_SETTLE: Duration = Duration::from_millis(500);
const ZERO_SETTLE: Duration = Duration::from_millis(500);
const READ_POLL: Duration = Duration::from_millis(1);

static DLL_CLAIMED: AtomicBool = AtomicBool::new(false);
static LAST_RELEASE: Mutex<Option<Instant>> = parking_lot::const_mutex(None);

/// Check a requested rate against [`SAMPLING_RATES`].
pub fn validate_rate(rate: u32) -> Result<(), DeviceError> {
    if !SAMPLING_RATES.contains(&rate) {
        return Err(DeviceError::Unsupported {
            message: format!(
                "sampling rate {} Hz is not supported by AMTI amplifiers (supported: {:?})",
                rate, SAMPLING_RATES
            ),
        });
    }
    if rate > MAX_RECOMMENDED_RATE {
        warn!(
            rate,
            "Sampling rates over 1000 Hz are accepted but discouraged by the SDK; expect drift"
        );
    }
    Ok(())
}

fn gain_code(gain: f64) -> Option<c_long> {
    GAIN_STEPS
        .iter()
        .position(|step| (step - gain).abs() < 1e-9)
        .map(|code| code as c_long)
}

fn excitation_code(voltage: f64) -> Option<c_long> {
    EXCITATION_STEPS
        .iter()
        .position(|step| (step - voltage).abs() < 1e-9)
        .map(|code| code as c_long)
}

fn read_sdk_string(getter: unsafe extern "system" fn(*mut c_char)) -> String {
    let mut buffer = [0 as c_char; STRING_BUFFER_LEN];
    // SAFETY: the SDK writes a NUL-terminated string of at most 64 bytes;
    // the final byte is forced to NUL in case it does not.
    unsafe {
        getter(buffer.as_mut_ptr());
        buffer[STRING_BUFFER_LEN - 1] = 0;
        CStr::from_ptr(buffer.as_ptr()).to_string_lossy().trim().to_string()
    }
}

fn shutdown_dll() {
    // SAFETY: stop/shutdown are valid in any DLL state.
    unsafe {
        fmBroadcastStop();
        fmDLLShutDown();
    }
    *LAST_RELEASE.lock() = Some(Instant::now());
}

fn release_claim() {
    DLL_CLAIMED.store(false, Ordering::SeqCst);
}

/// Driver for AMTI amplifiers.
#[derive(Debug, Default, Clone)]
pub struct AmtiDriver;

impl AmtiDriver {
    /// Create the driver. Nothing is loaded until `open`.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlatformDriver for AmtiDriver {
    fn name(&self) -> &str {
        "amti"
    }

    async fn open(&self, request: &OpenRequest) -> Result<Box<dyn PlatformBackend>, DeviceError> {
        validate_rate(request.sample_rate)?;

        if DLL_CLAIMED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::Busy {
                serial: request
                    .serial
                    .clone()
                    .unwrap_or_else(|| format!("index {}", request.index)),
            });
        }

        let remaining = LAST_RELEASE
            .lock()
            .map(|at| RELEASE_SETTLE.saturating_sub(at.elapsed()))
            .unwrap_or_default();
        if !remaining.is_zero() {
            debug!(?remaining, "Waiting for previous DLL release to settle");
            tokio::time::sleep(remaining).await;
        }

        let request = request.clone();
        match tokio::task::spawn_blocking(move || AmtiBackend::initialise(&request)).await {
            Ok(Ok(backend)) => Ok(Box::new(backend)),
            Ok(Err(e)) => {
                release_claim();
                Err(e)
            }
            Err(join) => {
                release_claim();
                Err(DeviceError::DriverMismatch {
                    message: format!("DLL initialisation aborted: {}", join),
                })
            }
        }
    }
}

/// Open connection to an AMTI amplifier.
pub struct AmtiBackend {
    info: PlatformInfo,
    index: c_int,
    init_code: c_int,
    setup_code: c_int,
    buffer: Vec<c_float>,
    queue: VecDeque<RawFrame>,
    mask: Vec<bool>,
    closed: bool,
}

impl AmtiBackend {
    /// Blocking DLL bring-up: init, setup check, device selection, rate,
    /// run mode, data format, start.
    fn initialise(request: &OpenRequest) -> Result<Self, DeviceError> {
        info!("Initializing AMTIUSBDevice");
        // SAFETY: first call into the DLL for this claim; DLL_CLAIMED
        // guarantees no other backend is using it.
        unsafe { fmDLLInit() };

        let mut init_code = 0;
        let mut initialised = false;
        for attempt in 1..=INIT_ATTEMPTS {
            std::thread::sleep(INIT_POLL);
            // SAFETY: valid after fmDLLInit.
            init_code = unsafe { fmDLLIsDeviceInitComplete() };
            if INIT_COMPLETE_CODES.contains(&init_code) {
                initialised = true;
                break;
            }
            info!(attempt, code = init_code, "DLL still not initialized, retrying");
        }
        if !initialised {
            warn!("DLL initialization failed. Check the contents / existence of C:/AMTI/AMTIUsbSetup.cfg");
            shutdown_dll();
            return Err(DeviceError::DriverMismatch {
                message: format!("DLL did not initialise (last code {})", init_code),
            });
        }

        // SAFETY: DLL initialised above.
        let setup_code = unsafe { fmDLLSetupCheck() };
        if ![SETUP_NO_CONDITIONERS, SETUP_UNCHANGED, SETUP_CHANGED].contains(&setup_code) {
            shutdown_dll();
            return Err(DeviceError::DriverMismatch {
                message: format!("setup check failed with code {}", setup_code),
            });
        }

        // SAFETY: DLL initialised above.
        let device_count = unsafe { fmDLLGetDeviceCount() };
        if device_count <= 0 {
            shutdown_dll();
            return Err(DeviceError::NotFound {
                message: "no AMTI devices found".to_string(),
            });
        }
        let index = request.index as c_int;
        if index >= device_count {
            shutdown_dll();
            return Err(DeviceError::NotFound {
                message: format!("device index {} out of range ({} devices)", index, device_count),
            });
        }

        // SAFETY: index checked against the device count.
        unsafe { fmDLLSelectDeviceIndex(index) };
        let serial = read_sdk_string(fmGetPlatformSerialNumber);
        let model = read_sdk_string(fmGetPlatformModelNumber);

        if let Some(wanted) = &request.serial {
            if wanted != &serial {
                shutdown_dll();
                return Err(DeviceError::NotFound {
                    message: format!(
                        "device {} is platform '{}', not '{}'",
                        index, serial, wanted
                    ),
                });
            }
        }

        info!(serial = %serial, rate = request.sample_rate, "Selecting sampling rate");
        // SAFETY: device selected; rate validated against the SDK table.
        unsafe {
            fmBroadcastAcquisitionRate(request.sample_rate as c_int);
            fmBroadcastRunMode(RUN_MODE_METRIC_FULLY_CONDITIONED);
            fmDLLSetDataFormat(DATA_FORMAT_EIGHT_VALUES);
            fmBroadcastStart();
        }

        Ok(Self {
            info: PlatformInfo {
                serial,
                model,
                channel_count: ANALOG_CHANNELS,
                sample_rate: request.sample_rate,
            },
            index,
            init_code,
            setup_code,
            buffer: vec![0.0; VALUES_PER_SAMPLE * SAMPLES_PER_READ],
            queue: VecDeque::with_capacity(SAMPLES_PER_READ * 4),
            mask: vec![true; ANALOG_CHANNELS],
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed {
                serial: self.info.serial.clone(),
            });
        }
        Ok(())
    }

    /// Pull one block from the DLL into the queue; returns frames added.
    fn poll_dll(&mut self) -> usize {
        let size_bytes = (self.buffer.len() * std::mem::size_of::<c_float>()) as c_int;
        // SAFETY: buffer holds exactly `size_bytes` bytes of floats.
        let available = unsafe { fmDLLGetTheFloatDataLBVStyle(self.buffer.as_mut_ptr(), size_bytes) };
        if available == 0 {
            return 0;
        }
        for chunk in self.buffer.chunks_exact(VALUES_PER_SAMPLE) {
            self.queue.push_back(RawFrame {
                counter: Some(chunk[0] as u32),
                readings: chunk[1..=ANALOG_CHANNELS].iter().map(|v| f64::from(*v)).collect(),
                trigger: Some(f64::from(chunk[VALUES_PER_SAMPLE - 1])),
            });
        }
        SAMPLES_PER_READ
    }

    fn select(&self) {
        // SAFETY: index was validated at open.
        unsafe { fmDLLSelectDeviceIndex(self.index) };
    }
}

#[async_trait]
impl PlatformBackend for AmtiBackend {
    fn info(&self) -> &PlatformInfo {
        &self.info
    }

    async fn read(&mut self) -> Result<RawFrame, DeviceError> {
        self.ensure_open()?;
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(frame);
            }
            if self.poll_dll() == 0 {
                tokio::time::sleep(READ_POLL).await;
            }
        }
    }

    async fn flush(&mut self) -> Result<usize, DeviceError> {
        self.ensure_open()?;
        let mut dropped = self.queue.len();
        self.queue.clear();
        loop {
            let added = self.poll_dll();
            if added == 0 {
                break;
            }
            dropped += added;
            self.queue.clear();
        }
        Ok(dropped)
    }

    async fn write_config(&mut self, config: &DeviceConfig) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if config.channel_gains.len() != ANALOG_CHANNELS {
            return Err(DeviceError::Rejected {
                operation: "write_config",
                message: format!(
                    "{} gains for {} channels",
                    config.channel_gains.len(),
                    ANALOG_CHANNELS
                ),
            });
        }

        let mut gains = [0 as c_long; ANALOG_CHANNELS];
        for (slot, gain) in gains.iter_mut().zip(&config.channel_gains) {
            *slot = gain_code(*gain).ok_or_else(|| DeviceError::Rejected {
                operation: "write_config",
                message: format!("gain {} is not one of {:?}", gain, GAIN_STEPS),
            })?;
        }
        let code = excitation_code(config.excitation_voltage).ok_or_else(|| {
            DeviceError::Rejected {
                operation: "write_config",
                message: format!(
                    "excitation {} V is not one of {:?}",
                    config.excitation_voltage, EXCITATION_STEPS
                ),
            }
        })?;
        let mut excitations = [code; ANALOG_CHANNELS];

        self.select();
        // SAFETY: arrays hold one value per analog channel.
        unsafe {
            fmSetCurrentGains(gains.as_mut_ptr());
            fmSetCurrentExcitations(excitations.as_mut_ptr());
        }
        self.mask = config.channel_mask.clone();
        debug!(serial = %self.info.serial, "Amplifier configured");
        Ok(())
    }

    async fn read_config(&mut self) -> Result<DeviceConfig, DeviceError> {
        self.ensure_open()?;
        let mut gains = [0 as c_long; STRING_BUFFER_LEN];
        let mut excitations = [0 as c_long; STRING_BUFFER_LEN];
        self.select();
        // SAFETY: buffers are larger than the six values the SDK writes.
        unsafe {
            fmGetCurrentGains(gains.as_mut_ptr());
            fmGetCurrentExcitations(excitations.as_mut_ptr());
        }

        let channel_gains = gains[..ANALOG_CHANNELS]
            .iter()
            .map(|code| {
                GAIN_STEPS
                    .get(*code as usize)
                    .copied()
                    .ok_or_else(|| DeviceError::Rejected {
                        operation: "read_config",
                        message: format!("unknown gain code {}", code),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let excitation_voltage = EXCITATION_STEPS
            .get(excitations[0] as usize)
            .copied()
            .ok_or_else(|| DeviceError::Rejected {
                operation: "read_config",
                message: format!("unknown excitation code {}", excitations[0]),
            })?;

        Ok(DeviceConfig {
            serial: self.info.serial.clone(),
            channel_gains,
            excitation_voltage,
            channel_mask: self.mask.clone(),
        })
    }

    async fn tare(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        // SAFETY: DLL is running.
        unsafe { fmBroadcastZero() };
        tokio::time::sleep(ZERO_SETTLE).await;
        Ok(())
    }

    async fn status(&mut self) -> Result<DiagnosticStatus, DeviceError> {
        self.ensure_open()?;
        // SAFETY: DLL is running.
        let device_count = unsafe { fmDLLGetDeviceCount() };
        if device_count <= self.index {
            return Err(DeviceError::Disconnected {
                message: format!("amplifier {} no longer enumerated", self.index),
            });
        }
        // SAFETY: DLL is running.
        let code = unsafe { fmDLLSetupCheck() };
        Ok(DiagnosticStatus::new(code))
    }

    async fn report(&mut self) -> Result<PlatformReport, DeviceError> {
        self.ensure_open()?;
        info!("Performing AMTI diagnostics");
        let mut longs = [0 as c_long; STRING_BUFFER_LEN];
        let mut floats = [0 as c_float; STRING_BUFFER_LEN];

        self.select();
        // SAFETY: DLL running, device selected, buffers hold 64 values.
        let report = unsafe {
            let device_count = fmDLLGetDeviceCount();
            let run_mode = fmGetRunMode();
            let acquisition_rate = fmGetAcquisitionRate();

            fmGetCurrentGains(longs.as_mut_ptr());
            let gains = longs[..ANALOG_CHANNELS].iter().map(|v| i64::from(*v)).collect();
            fmGetCurrentExcitations(longs.as_mut_ptr());
            let excitations = longs[..ANALOG_CHANNELS].iter().map(|v| i64::from(*v)).collect();
            fmGetChannelOffsetsTable(floats.as_mut_ptr());
            let channel_offsets = floats[..ANALOG_CHANNELS].iter().map(|v| f64::from(*v)).collect();
            let product_type = fmGetProductType();
            fmGetPlatformCapacity(floats.as_mut_ptr());
            let capacity = floats[..ANALOG_CHANNELS].iter().map(|v| f64::from(*v)).collect();

            PlatformReport {
                init_code: self.init_code,
                setup_check: self.setup_code,
                device_count,
                run_mode,
                acquisition_rate,
                gains,
                excitations,
                channel_offsets,
                amplifier: AmplifierInfo {
                    product_type,
                    model_number: read_sdk_string(fmGetAmplifierModelNumber),
                    serial_number: read_sdk_string(fmGetAmplifierSerialNumber),
                    firmware_version: read_sdk_string(fmGetAmplifierFirmwareVersion),
                    calibration_date: read_sdk_string(fmGetAmplifierDate),
                },
                platform: PlatformCalibration {
                    model_number: read_sdk_string(fmGetPlatformModelNumber),
                    serial_number: read_sdk_string(fmGetPlatformSerialNumber),
                    calibration_date: read_sdk_string(fmGetPlatformDate),
                    capacity,
                },
            }
        };
        Ok(report)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(serial = %self.info.serial, "Releasing AMTIUSBDevice");
        shutdown_dll();
        self.queue.clear();
        release_claim();
        info!(serial = %self.info.serial, "Device released");
    }
}

impl Drop for AmtiBackend {
    fn drop(&mut self) {
        self.close();
    }
}
