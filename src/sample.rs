//! Acquisition records.
//!
//! A [`Sample`] is what the device produced; a [`TaggedSample`] is what the
//! streaming node emits for every tick of its cadence, whether or not a
//! sample could be taken on that tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hardware::capabilities::{PlatformInfo, PlatformReport};
use crate::store::DeviceConfig;

/// Channel names of a six-axis force platform.
pub const SIX_AXIS_NAMES: [&str; 6] = ["Fx", "Fy", "Fz", "Mx", "My", "Mz"];

/// One acquisition frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Device time in seconds since the first sample of the session,
    /// derived from the sample index and the sampling rate.
    pub timestamp: f64,
    /// Per-channel readings in channel order.
    pub readings: Vec<f64>,
    /// `false` when the frame is known to follow lost samples.
    pub valid: bool,
    /// Hardware sample counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u32>,
    /// Trigger input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<f64>,
}

/// Static description of the channels carried by a session's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    /// Platform serial.
    pub serial: String,
    /// Sampling rate in Hz.
    pub sample_rate: u32,
    /// Channel names, in reading order.
    pub names: Vec<String>,
    /// Channel units, in reading order.
    pub units: Vec<String>,
    /// Channel enable mask, in reading order.
    pub enabled: Vec<bool>,
}

impl ChannelLayout {
    /// Layout for an open platform with the given configuration.
    ///
    /// Six-channel platforms get force/moment names; anything else gets
    /// `ch<n>` names in volts.
    pub fn new(info: &PlatformInfo, config: &DeviceConfig) -> Self {
        let (names, units) = if info.channel_count == SIX_AXIS_NAMES.len() {
            (
                SIX_AXIS_NAMES.iter().map(|n| n.to_string()).collect(),
                ["N", "N", "N", "N.m", "N.m", "N.m"]
                    .iter()
                    .map(|u| u.to_string())
                    .collect(),
            )
        } else {
            (
                (0..info.channel_count).map(|i| format!("ch{}", i)).collect(),
                vec!["V".to_string(); info.channel_count],
            )
        };

        Self {
            serial: info.serial.clone(),
            sample_rate: info.sample_rate,
            names,
            units,
            enabled: config.channel_mask.clone(),
        }
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.names.len()
    }
}

/// Why a tick carries no sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    /// A tare was in progress.
    Zeroing,
    /// The read for this tick failed or timed out.
    MissedRead,
}

/// One output record, emitted once per tick.
#[derive(Debug, Clone, Serialize)]
pub struct TaggedSample {
    /// Tick index since the stream started.
    pub tick: u64,
    /// Host wall-clock time of the tick.
    pub wall_clock: DateTime<Utc>,
    /// Shared channel metadata.
    pub layout: Arc<ChannelLayout>,
    /// `true` when the tick carries no sample.
    pub gap: bool,
    /// Why the tick is a gap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_reason: Option<GapReason>,
    /// The sample, absent on gap ticks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<Sample>,
    /// Platform report, attached to the first record of a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Arc<PlatformReport>>,
}

impl TaggedSample {
    /// Record carrying a sample.
    pub fn with_sample(tick: u64, layout: Arc<ChannelLayout>, sample: Sample) -> Self {
        Self {
            tick,
            wall_clock: Utc::now(),
            layout,
            gap: false,
            gap_reason: None,
            sample: Some(sample),
            report: None,
        }
    }

    /// Record marking a tick without a sample.
    pub fn gap(tick: u64, layout: Arc<ChannelLayout>, reason: GapReason) -> Self {
        Self {
            tick,
            wall_clock: Utc::now(),
            layout,
            gap: true,
            gap_reason: Some(reason),
            sample: None,
            report: None,
        }
    }

    /// `true` when the record carries a valid sample.
    pub fn is_valid(&self) -> bool {
        self.sample.as_ref().is_some_and(|s| s.valid)
    }
}
