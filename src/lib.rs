//! # Force Platform DAQ Library
//!
//! Real-time acquisition driver for AMTI-style six-axis force platforms. The
//! crate opens a platform through its vendor library (or a simulation),
//! applies a persisted per-device configuration, streams timestamped samples
//! at a fixed cadence, runs tare (zero) episodes on request and watches device
//! health while streaming.
//!
//! ## Crate Structure
//!
//! - **`config`**: `NodeOptions`, loaded from defaults, a TOML file and
//!   `FORCEPLATE_` environment variables via `figment`.
//! - **`device`**: `DeviceHandle`, the single owner of one open platform.
//!   Bounded reads, sample timestamps and counter continuity checks.
//! - **`diagnostics`**: status-code policy and the Idle/Polling/Degraded/Faulted
//!   monitor with its retry budget.
//! - **`error`**: `DeviceError`, `SessionError` and friends.
//! - **`hardware`**: the `PlatformDriver`/`PlatformBackend` seam, the simulated
//!   platform and (behind `amti_hardware`) the AMTI USB driver.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`node`**: `StreamingNode`, the start/stop lifecycle and the sampling loop.
//! - **`sample`**: the records a session emits.
//! - **`store`**: per-serial device configuration files.
//! - **`zero`**: the zero request mailbox and state machine.

pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod node;
pub mod sample;
pub mod store;
pub mod zero;

pub use config::NodeOptions;
pub use device::{ConnectionState, DeviceHandle};
pub use diagnostics::{DiagnosticsMonitor, DiagnosticsState, StatusPolicy};
pub use error::{DeviceError, ErrorKind, SessionError};
pub use node::{NodeEvent, SessionSummary, StreamingNode};
pub use sample::{ChannelLayout, GapReason, Sample, TaggedSample};
pub use store::{ConfigStore, DeviceConfig};
pub use zero::{PostOutcome, ZeroTrigger};
