//! Diagnostics monitor.
//!
//! Classifies status checks and read outcomes and tracks the health of a
//! streaming session:
//!
//! ```text
//! Idle --arm--> Polling --transient fault--> Degraded --budget exhausted--> Faulted
//!                  ^                             |
//!                  +---------- recovery ---------+
//! ```
//!
//! Faulted is terminal for the session. Codes the [`StatusPolicy`] considers
//! benign never leave Polling; codes it does not know are treated as benign
//! and logged once.
//!
//! Read faults and status faults are counted in separate streaks so that
//! healthy reads cannot mask a platform that keeps reporting a fault code
//! (and vice versa). Either streak reaching the retry budget faults the
//! session.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, SessionError};
use crate::hardware::capabilities::DiagnosticStatus;

/// Health of the streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticsState {
    /// Not armed.
    Idle,
    /// Streaming, no outstanding fault.
    Polling,
    /// At least one recent transient fault; retry budget not yet exhausted.
    Degraded,
    /// Retry budget exhausted or platform lost.
    Faulted,
}

/// A state change, `(from, to)`.
pub type Transition = (DiagnosticsState, DiagnosticsState);

/// Inclusive range of status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBand {
    /// Lowest code in the band.
    pub low: i32,
    /// Highest code in the band.
    pub high: i32,
}

impl CodeBand {
    /// Band covering `low..=high`.
    pub const fn new(low: i32, high: i32) -> Self {
        Self { low, high }
    }

    /// Whether `code` lies in the band.
    pub fn contains(&self, code: i32) -> bool {
        (self.low..=self.high).contains(&code)
    }

    fn overlaps(&self, other: &CodeBand) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

/// How a status code is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Success or informational.
    Benign,
    /// Genuine device fault.
    Fault,
    /// Not covered by the policy; treated as benign.
    Unknown,
}

/// Status code classification.
///
/// The default accepts the AMTI setup-check codes (0: no conditioners,
/// 1: unchanged, 214: changed since last save) and the 200–299
/// informational band, and treats 400–599 as faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPolicy {
    /// Individual codes that are never failures.
    pub benign_codes: Vec<i32>,
    /// Code bands that are never failures.
    pub benign_bands: Vec<CodeBand>,
    /// Code bands that are device faults.
    pub fault_bands: Vec<CodeBand>,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            benign_codes: vec![0, 1, 214],
            benign_bands: vec![CodeBand::new(200, 299)],
            fault_bands: vec![CodeBand::new(400, 599)],
        }
    }
}

impl StatusPolicy {
    /// Classify a status code.
    pub fn classify(&self, code: i32) -> StatusClass {
        if self.benign_codes.contains(&code) || self.benign_bands.iter().any(|b| b.contains(code)) {
            StatusClass::Benign
        } else if self.fault_bands.iter().any(|b| b.contains(code)) {
            StatusClass::Fault
        } else {
            StatusClass::Unknown
        }
    }

    /// Reject inverted bands and benign/fault overlaps.
    pub fn validate(&self) -> Result<(), String> {
        for band in self.benign_bands.iter().chain(&self.fault_bands) {
            if band.low > band.high {
                return Err(format!(
                    "status band {}..={} is inverted",
                    band.low, band.high
                ));
            }
        }
        for fault in &self.fault_bands {
            if let Some(code) = self.benign_codes.iter().find(|c| fault.contains(**c)) {
                return Err(format!(
                    "benign code {} lies in fault band {}..={}",
                    code, fault.low, fault.high
                ));
            }
            if let Some(benign) = self.benign_bands.iter().find(|b| b.overlaps(fault)) {
                return Err(format!(
                    "benign band {}..={} overlaps fault band {}..={}",
                    benign.low, benign.high, fault.low, fault.high
                ));
            }
        }
        Ok(())
    }
}

/// Session health state machine.
#[derive(Debug)]
pub struct DiagnosticsMonitor {
    policy: StatusPolicy,
    retry_budget: u32,
    enabled_channels: u64,
    state: DiagnosticsState,
    read_streak: u32,
    status_streak: u32,
    last_fault: Option<String>,
    unknown_logged: HashSet<i32>,
    transient_faults: u64,
    last_status: Option<DiagnosticStatus>,
}

impl DiagnosticsMonitor {
    /// Monitor with the given policy and retry budget.
    ///
    /// `enabled_channels` is a bitmap; channel faults outside it are ignored.
    pub fn new(policy: StatusPolicy, retry_budget: u32, enabled_channels: u64) -> Self {
        Self {
            policy,
            retry_budget: retry_budget.max(1),
            enabled_channels,
            state: DiagnosticsState::Idle,
            read_streak: 0,
            status_streak: 0,
            last_fault: None,
            unknown_logged: HashSet::new(),
            transient_faults: 0,
            last_status: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> DiagnosticsState {
        self.state
    }

    /// Transient faults seen over the session.
    pub fn transient_faults(&self) -> u64 {
        self.transient_faults
    }

    /// Most recent status check.
    pub fn last_status(&self) -> Option<&DiagnosticStatus> {
        self.last_status.as_ref()
    }

    /// Length of the current fault streak.
    pub fn consecutive_faults(&self) -> u32 {
        self.read_streak.max(self.status_streak)
    }

    fn transition(&mut self, to: DiagnosticsState) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        match to {
            DiagnosticsState::Faulted => error!(?from, ?to, "Diagnostics state changed"),
            DiagnosticsState::Degraded => warn!(?from, ?to, "Diagnostics state changed"),
            _ => info!(?from, ?to, "Diagnostics state changed"),
        }
        Some((from, to))
    }

    /// Idle → Polling when streaming starts.
    pub fn arm(&mut self) -> Option<Transition> {
        if self.state != DiagnosticsState::Idle {
            return None;
        }
        self.transition(DiagnosticsState::Polling)
    }

    /// Back to Idle when streaming stops. Faulted stays Faulted.
    pub fn disarm(&mut self) -> Option<Transition> {
        if self.state == DiagnosticsState::Faulted {
            return None;
        }
        self.read_streak = 0;
        self.status_streak = 0;
        self.transition(DiagnosticsState::Idle)
    }

    fn faulted_error(&self) -> SessionError {
        SessionError::DiagnosticsFaulted {
            consecutive_faults: self.consecutive_faults(),
            last_fault: self
                .last_fault
                .clone()
                .unwrap_or_else(|| "unknown fault".to_string()),
        }
    }

    /// Re-evaluate state from the streaks.
    fn settle(&mut self) -> Result<Option<Transition>, SessionError> {
        if self.state == DiagnosticsState::Idle {
            return Ok(None);
        }
        let streak = self.consecutive_faults();
        let target = if streak >= self.retry_budget {
            DiagnosticsState::Faulted
        } else if streak > 0 {
            DiagnosticsState::Degraded
        } else {
            DiagnosticsState::Polling
        };
        let change = self.transition(target);
        if target == DiagnosticsState::Faulted {
            return Err(self.faulted_error());
        }
        Ok(change)
    }

    fn note_fault(&mut self, reason: String) {
        self.transient_faults += 1;
        warn!(
            reason = %reason,
            streak = self.consecutive_faults(),
            budget = self.retry_budget,
            "Transient fault"
        );
        self.last_fault = Some(reason);
    }

    /// Classify a status check.
    ///
    /// # Errors
    /// `DiagnosticsFaulted` once the retry budget is exhausted.
    pub fn observe_status(
        &mut self,
        status: &DiagnosticStatus,
    ) -> Result<Option<Transition>, SessionError> {
        if self.state == DiagnosticsState::Faulted {
            return Err(self.faulted_error());
        }
        self.last_status = Some(status.clone());

        let class = self.policy.classify(status.code);
        if class == StatusClass::Unknown && self.unknown_logged.insert(status.code) {
            info!(code = status.code, "Unrecognised status code treated as benign");
        }

        let channel_faults = status.channel_faults & self.enabled_channels;
        if class == StatusClass::Fault {
            self.status_streak += 1;
            self.note_fault(format!("status code {}", status.code));
        } else if channel_faults != 0 {
            self.status_streak += 1;
            self.note_fault(format!("channel fault bitmap {:#b}", channel_faults));
        } else {
            debug!(code = status.code, "Status ok");
            self.status_streak = 0;
        }
        self.settle()
    }

    /// A status check overran its budget or timed out.
    pub fn record_poll_overrun(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<Option<Transition>, SessionError> {
        if self.state == DiagnosticsState::Faulted {
            return Err(self.faulted_error());
        }
        self.status_streak += 1;
        self.note_fault(reason.into());
        self.settle()
    }

    /// A read delivered a sample.
    pub fn record_read_ok(&mut self) -> Option<Transition> {
        if self.read_streak == 0 || self.state == DiagnosticsState::Faulted {
            return None;
        }
        self.read_streak = 0;
        self.settle().ok().flatten()
    }

    /// A read missed its deadline.
    pub fn record_read_fault(
        &mut self,
        err: &DeviceError,
    ) -> Result<Option<Transition>, SessionError> {
        if self.state == DiagnosticsState::Faulted {
            return Err(self.faulted_error());
        }
        self.read_streak += 1;
        self.note_fault(err.to_string());
        self.settle()
    }

    /// The platform is gone. Immediately Faulted.
    pub fn record_fatal(&mut self, err: &DeviceError) -> (Option<Transition>, SessionError) {
        self.last_fault = Some(err.to_string());
        let change = self.transition(DiagnosticsState::Faulted);
        (change, SessionError::Connection(err.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn armed(budget: u32) -> DiagnosticsMonitor {
        let mut monitor = DiagnosticsMonitor::new(StatusPolicy::default(), budget, 0b111111);
        assert_eq!(
            monitor.arm(),
            Some((DiagnosticsState::Idle, DiagnosticsState::Polling))
        );
        monitor
    }

    fn timeout() -> DeviceError {
        DeviceError::Timeout {
            operation: "read",
            timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn default_policy_classification() {
        let policy = StatusPolicy::default();
        assert_eq!(policy.classify(0), StatusClass::Benign);
        assert_eq!(policy.classify(214), StatusClass::Benign);
        assert_eq!(policy.classify(250), StatusClass::Benign);
        assert_eq!(policy.classify(404), StatusClass::Fault);
        assert_eq!(policy.classify(599), StatusClass::Fault);
        assert_eq!(policy.classify(42), StatusClass::Unknown);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn policy_validation() {
        let overlapping = StatusPolicy {
            benign_bands: vec![CodeBand::new(300, 450)],
            ..Default::default()
        };
        assert!(overlapping.validate().is_err());

        let inverted = StatusPolicy {
            fault_bands: vec![CodeBand::new(600, 400)],
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn informational_codes_never_leave_polling() {
        let mut monitor = armed(2);
        for code in 200..300 {
            let change = monitor.observe_status(&DiagnosticStatus::new(code)).unwrap();
            assert_eq!(change, None);
        }
        assert_eq!(monitor.state(), DiagnosticsState::Polling);
        assert_eq!(monitor.transient_faults(), 0);
    }

    #[test]
    fn unknown_codes_are_benign() {
        let mut monitor = armed(1);
        monitor.observe_status(&DiagnosticStatus::new(77)).unwrap();
        monitor.observe_status(&DiagnosticStatus::new(77)).unwrap();
        assert_eq!(monitor.state(), DiagnosticsState::Polling);
    }

    #[test]
    fn degraded_then_recovered() {
        let mut monitor = armed(3);
        let change = monitor.observe_status(&DiagnosticStatus::new(500)).unwrap();
        assert_eq!(
            change,
            Some((DiagnosticsState::Polling, DiagnosticsState::Degraded))
        );
        let change = monitor.observe_status(&DiagnosticStatus::new(1)).unwrap();
        assert_eq!(
            change,
            Some((DiagnosticsState::Degraded, DiagnosticsState::Polling))
        );
    }

    #[test]
    fn budget_exhaustion_faults() {
        let mut monitor = armed(3);
        assert!(monitor.record_read_fault(&timeout()).is_ok());
        assert!(monitor.record_read_fault(&timeout()).is_ok());
        assert_eq!(monitor.state(), DiagnosticsState::Degraded);

        let err = monitor.record_read_fault(&timeout()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(monitor.state(), DiagnosticsState::Faulted);

        // Terminal
        assert!(monitor.observe_status(&DiagnosticStatus::new(0)).is_err());
        assert_eq!(monitor.record_read_ok(), None);
        assert_eq!(monitor.disarm(), None);
    }

    #[test]
    fn good_reads_do_not_mask_status_faults() {
        let mut monitor = armed(2);
        monitor.observe_status(&DiagnosticStatus::new(450)).unwrap();
        assert_eq!(monitor.record_read_ok(), None);
        assert_eq!(monitor.state(), DiagnosticsState::Degraded);
        assert!(monitor.observe_status(&DiagnosticStatus::new(450)).is_err());
    }

    #[test]
    fn read_recovery_resets_read_streak() {
        let mut monitor = armed(2);
        monitor.record_read_fault(&timeout()).unwrap();
        assert_eq!(
            monitor.record_read_ok(),
            Some((DiagnosticsState::Degraded, DiagnosticsState::Polling))
        );
        monitor.record_read_fault(&timeout()).unwrap();
        assert_eq!(monitor.state(), DiagnosticsState::Degraded);
    }

    #[test]
    fn channel_faults_only_count_on_enabled_channels() {
        let mut monitor = DiagnosticsMonitor::new(StatusPolicy::default(), 2, 0b000111);
        monitor.arm();
        monitor
            .observe_status(&DiagnosticStatus::new(0).with_channel_faults(0b1000))
            .unwrap();
        assert_eq!(monitor.state(), DiagnosticsState::Polling);
        monitor
            .observe_status(&DiagnosticStatus::new(0).with_channel_faults(0b0010))
            .unwrap();
        assert_eq!(monitor.state(), DiagnosticsState::Degraded);
    }

    #[test]
    fn disconnect_is_immediately_fatal() {
        let mut monitor = armed(10);
        let (change, err) = monitor.record_fatal(&DeviceError::Disconnected {
            message: "gone".into(),
        });
        assert_eq!(
            change,
            Some((DiagnosticsState::Polling, DiagnosticsState::Faulted))
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn poll_overruns_count_as_transient() {
        let mut monitor = armed(2);
        monitor.record_poll_overrun("status exceeded 5ms").unwrap();
        assert_eq!(monitor.state(), DiagnosticsState::Degraded);
        assert!(monitor.record_poll_overrun("status exceeded 5ms").is_err());
    }
}
