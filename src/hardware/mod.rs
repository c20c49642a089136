//! Platform hardware.
//!
//! [`capabilities`] defines the driver/backend seam; [`mock`] is the simulated
//! platform; `amti` (feature `amti_hardware`) drives real AMTI amplifiers
//! through `AMTIUSBDevice.dll`.

pub mod capabilities;
pub mod mock;

#[cfg(feature = "amti_hardware")]
pub mod amti;

pub use capabilities::{
    DiagnosticStatus, OpenRequest, PlatformBackend, PlatformDriver, PlatformInfo, PlatformReport,
    RawFrame,
};
pub use mock::{SimulatedPlatform, SimulatedSettings};

#[cfg(feature = "amti_hardware")]
pub use amti::AmtiDriver;
