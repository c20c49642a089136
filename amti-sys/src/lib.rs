//! Low-level FFI declarations for the AMTI USB Device SDK.
//!
//! These are raw, unsafe declarations of the `AMTIUSBDevice.dll` entry points
//! (SDK version 1.3.00) used to drive AMTI force platforms connected through
//! a signal conditioner. For a safe wrapper, use the `amti_hardware` feature
//! of `forceplate_daq`.
//!
//! # Features
//!
//! - `amti-sdk`: Declare and link the SDK functions. Without this feature the
//!   crate only exports constants, so dependents build on hosts without the
//!   vendor software.
//!
//! # Threading
//!
//! The DLL keeps process-global state (one device selection, one data
//! buffer). All calls must be serialized by the caller.

#![allow(non_snake_case)]
#![allow(clippy::all)]

use std::os::raw::c_int;

/// Run mode: metric units, fully conditioned (SDK section 21).
pub const RUN_MODE_METRIC_FULLY_CONDITIONED: c_int = 1;

/// Data format: 8 values per sample (counter, Fx, Fy, Fz, Mx, My, Mz, trigger).
pub const DATA_FORMAT_EIGHT_VALUES: c_int = 1;

/// Number of float values per sample in [`DATA_FORMAT_EIGHT_VALUES`].
pub const VALUES_PER_SAMPLE: usize = 8;

/// Number of samples the DLL hands out per `fmDLLGetTheFloatDataLBVStyle` call.
pub const SAMPLES_PER_READ: usize = 16;

/// Number of analog force/moment channels on a signal conditioner.
pub const ANALOG_CHANNELS: usize = 6;

/// The sample counter wraps after this value (see `fmDLLSetDataFormat`).
pub const COUNTER_ROLLOVER: u32 = (1 << 24) - 1;

/// `fmDLLIsDeviceInitComplete` codes meaning the DLL finished initialising.
pub const INIT_COMPLETE_CODES: [c_int; 2] = [1, 2];

/// `fmDLLSetupCheck`: no signal conditioners found.
pub const SETUP_NO_CONDITIONERS: c_int = 0;
/// `fmDLLSetupCheck`: current setup matches the last saved configuration.
pub const SETUP_UNCHANGED: c_int = 1;
/// `fmDLLSetupCheck`: configuration changed since the last save.
pub const SETUP_CHANGED: c_int = 214;

/// Size of the character buffers the SDK writes identification strings into.
pub const STRING_BUFFER_LEN: usize = 64;

#[cfg(feature = "amti-sdk")]
mod functions {
    use std::os::raw::{c_char, c_float, c_int, c_long};

    extern "system" {
        // DLL lifecycle (SDK section 7.0)
        pub fn fmDLLInit();
        pub fn fmDLLIsDeviceInitComplete() -> c_int;
        pub fn fmDLLSetupCheck() -> c_int;
        pub fn fmDLLShutDown();

        // Device selection
        pub fn fmDLLGetDeviceCount() -> c_int;
        pub fn fmDLLSelectDeviceIndex(index: c_int);
        pub fn fmDLLGetDeviceIndex() -> c_int;

        // Acquisition control
        pub fn fmBroadcastAcquisitionRate(rate: c_int);
        pub fn fmBroadcastRunMode(mode: c_int);
        pub fn fmDLLSetDataFormat(format: c_int);
        pub fn fmBroadcastStart();
        pub fn fmBroadcastStop();
        pub fn fmBroadcastZero();
        pub fn fmDLLGetTheFloatDataLBVStyle(buffer: *mut c_float, size_bytes: c_int) -> c_int;

        // DLL-level state
        pub fn fmDLLGetRunMode() -> c_int;
        pub fn fmDLLGetGenlock() -> c_int;
        pub fn fmDLLGetAcquisitionRate() -> c_int;

        // Signal conditioner configuration
        pub fn fmGetRunMode() -> c_int;
        pub fn fmGetAcquisitionRate() -> c_int;
        pub fn fmGetCurrentGains(gains: *mut c_long);
        pub fn fmSetCurrentGains(gains: *mut c_long);
        pub fn fmGetCurrentExcitations(excitations: *mut c_long);
        pub fn fmSetCurrentExcitations(excitations: *mut c_long);
        pub fn fmGetChannelOffsetsTable(offsets: *mut c_float);
        pub fn fmGetCableLength() -> c_float;
        pub fn fmGetMatrixMode() -> c_int;
        pub fn fmGetPlatformRotation() -> c_float;
        pub fn fmGetMechanicalMaxAndMin(values: *mut c_float) -> c_int;
        pub fn fmGetAnalogMaxAndMin(values: *mut c_float) -> c_int;

        // Amplifier identification
        pub fn fmGetProductType() -> c_int;
        pub fn fmGetAmplifierModelNumber(buffer: *mut c_char);
        pub fn fmGetAmplifierSerialNumber(buffer: *mut c_char);
        pub fn fmGetAmplifierFirmwareVersion(buffer: *mut c_char);
        pub fn fmGetAmplifierDate(buffer: *mut c_char);
        pub fn fmGetADRef() -> c_float;

        // Platform calibration
        pub fn fmGetPlatformDate(buffer: *mut c_char);
        pub fn fmGetPlatformModelNumber(buffer: *mut c_char);
        pub fn fmGetPlatformSerialNumber(buffer: *mut c_char);
        pub fn fmGetPlatformCapacity(values: *mut c_float);
    }
}

#[cfg(feature = "amti-sdk")]
pub use functions::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_rollover_is_24_bit() {
        assert_eq!(COUNTER_ROLLOVER, 16_777_215);
    }

    #[test]
    fn read_buffer_holds_whole_samples() {
        assert_eq!((VALUES_PER_SAMPLE * SAMPLES_PER_READ) % VALUES_PER_SAMPLE, 0);
        assert_eq!(VALUES_PER_SAMPLE - 2, ANALOG_CHANNELS);
    }
}
