//! Zero (tare) calibration control.
//!
//! Zero requests arrive from any task through a [`ZeroTrigger`] and land in a
//! single-slot mailbox. The sampling loop drains the mailbox between ticks
//! and drives the [`ZeroController`] state machine:
//!
//! ```text
//! Idle --request--> ZeroRequested --tare issued--> Zeroing --ack--> ZeroComplete --> Idle
//!                                                     |
//!                                                     +--timeout/reject--> ZeroFailed --> Idle
//! ```
//!
//! A request that arrives while another is pending or in progress is
//! coalesced into it; a request while the node is not streaming is refused.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ZeroError;

/// Zero calibration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZeroState {
    /// No zero pending.
    Idle,
    /// A request was taken from the mailbox; sample emission is paused.
    ZeroRequested,
    /// The tare has been issued and is awaiting acknowledgment.
    Zeroing,
    /// The last tare failed; sampling continues with the previous offset.
    ZeroFailed,
    /// The last tare was acknowledged.
    ZeroComplete,
}

/// One zero request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZeroRequest {
    /// Request identifier, for correlating outcomes.
    pub id: Uuid,
    /// Who asked ("operator", "auto", a pipeline node id, ...).
    pub actor: String,
    /// When the request was posted.
    pub requested_at: DateTime<Utc>,
}

impl ZeroRequest {
    /// New request from `actor`, timestamped now.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            requested_at: Utc::now(),
        }
    }
}

/// What happened to a posted request.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOutcome {
    /// Queued; the tare will run on a coming tick.
    Accepted(Uuid),
    /// Another zero is pending or in progress; this request was folded into it.
    Coalesced {
        /// The request that will actually run.
        pending: Uuid,
    },
    /// The node is not streaming.
    NotStreaming,
}

/// Result of a finished zero episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZeroOutcome {
    /// The request that ran.
    pub request: ZeroRequest,
    /// How long the tare took (or how long it was allowed to take).
    pub elapsed: Duration,
    /// `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Slot {
    streaming: bool,
    pending: Option<ZeroRequest>,
    /// Id of the request taken by the loop and not yet finished.
    in_progress: Option<Uuid>,
}

/// Cloneable control input for requesting a zero.
#[derive(Debug, Clone)]
pub struct ZeroTrigger {
    slot: Arc<Mutex<Slot>>,
}

impl ZeroTrigger {
    /// Post a zero request on behalf of `actor`.
    pub fn request(&self, actor: impl Into<String>) -> PostOutcome {
        self.post(ZeroRequest::new(actor))
    }

    /// Post a prepared request.
    pub fn post(&self, request: ZeroRequest) -> PostOutcome {
        let mut slot = self.slot.lock();
        if !slot.streaming {
            debug!(actor = %request.actor, "Zero request refused: not streaming");
            return PostOutcome::NotStreaming;
        }
        if let Some(pending) = slot.in_progress.or(slot.pending.as_ref().map(|r| r.id)) {
            info!(
                actor = %request.actor,
                pending = %pending,
                "Zero already pending; request coalesced"
            );
            return PostOutcome::Coalesced { pending };
        }
        let id = request.id;
        debug!(actor = %request.actor, id = %id, "Zero request accepted");
        slot.pending = Some(request);
        PostOutcome::Accepted(id)
    }

    /// Whether a zero is pending or in progress.
    pub fn is_busy(&self) -> bool {
        let slot = self.slot.lock();
        slot.pending.is_some() || slot.in_progress.is_some()
    }

    /// Refuse further requests and drop the pending one. For a session
    /// whose loop was torn down without draining the mailbox.
    pub(crate) fn close(&self) {
        let mut slot = self.slot.lock();
        slot.streaming = false;
        slot.in_progress = None;
        if let Some(dropped) = slot.pending.take() {
            info!(actor = %dropped.actor, "Pending zero request dropped: streaming stopped");
        }
    }
}

/// Zero state machine, driven by the sampling loop.
#[derive(Debug)]
pub struct ZeroController {
    slot: Arc<Mutex<Slot>>,
    state: ZeroState,
    current: Option<ZeroRequest>,
    episodes: u64,
    failures: u64,
}

impl Default for ZeroController {
    fn default() -> Self {
        Self::new()
    }
}

impl ZeroController {
    /// Controller with an empty mailbox; requests are refused until
    /// [`set_streaming`](Self::set_streaming) opens it.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            state: ZeroState::Idle,
            current: None,
            episodes: 0,
            failures: 0,
        }
    }

    /// Controller draining the mailbox behind an existing trigger.
    pub fn attach(trigger: &ZeroTrigger) -> Self {
        Self {
            slot: Arc::clone(&trigger.slot),
            state: ZeroState::Idle,
            current: None,
            episodes: 0,
            failures: 0,
        }
    }

    /// Control input sharing this controller's mailbox.
    pub fn trigger(&self) -> ZeroTrigger {
        ZeroTrigger {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Current state.
    pub fn state(&self) -> ZeroState {
        self.state
    }

    /// Finished zero episodes (acknowledged or failed).
    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    /// Failed zero episodes.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Open or close the mailbox. Either way, anything left in it by an
    /// earlier session is forgotten; a new session starts with an empty slot.
    pub fn set_streaming(&self, streaming: bool) {
        if !streaming {
            self.trigger().close();
            return;
        }
        let mut slot = self.slot.lock();
        slot.streaming = true;
        slot.in_progress = None;
        if let Some(stale) = slot.pending.take() {
            info!(actor = %stale.actor, "Discarding zero request left by a previous session");
        }
    }

    /// Idle → ZeroRequested if a request is waiting.
    pub fn take_request(&mut self) -> Option<&ZeroRequest> {
        if self.state != ZeroState::Idle {
            return None;
        }
        let request = {
            let mut slot = self.slot.lock();
            let request = slot.pending.take()?;
            slot.in_progress = Some(request.id);
            request
        };
        self.state = ZeroState::ZeroRequested;
        self.current = Some(request);
        self.current.as_ref()
    }

    /// Start a zero that did not come through the mailbox (the automatic
    /// zero at session start). Requests posted meanwhile are coalesced.
    pub fn begin_direct(&mut self, request: ZeroRequest) -> bool {
        if self.state != ZeroState::Idle {
            return false;
        }
        self.slot.lock().in_progress = Some(request.id);
        self.current = Some(request);
        self.state = ZeroState::ZeroRequested;
        self.begin();
        true
    }

    /// ZeroRequested → Zeroing, as the tare is issued.
    pub fn begin(&mut self) {
        if self.state == ZeroState::ZeroRequested {
            self.state = ZeroState::Zeroing;
            if let Some(request) = &self.current {
                info!(actor = %request.actor, id = %request.id, "Zeroing platform");
            }
        }
    }

    /// Zeroing → ZeroComplete/ZeroFailed → Idle.
    ///
    /// Returns the outcome of the episode, or `None` when no zero was running.
    pub fn finish(&mut self, result: Result<(), ZeroError>, elapsed: Duration) -> Option<ZeroOutcome> {
        let request = self.current.take()?;
        self.episodes += 1;
        self.state = match &result {
            Ok(()) => {
                info!(actor = %request.actor, ?elapsed, "Zero complete");
                ZeroState::ZeroComplete
            }
            Err(e) => {
                self.failures += 1;
                warn!(actor = %request.actor, error = %e, "Zero failed; keeping previous offset");
                ZeroState::ZeroFailed
            }
        };
        debug!(state = ?self.state, "Zero episode finished");
        self.state = ZeroState::Idle;
        self.slot.lock().in_progress = None;

        Some(ZeroOutcome {
            request,
            elapsed,
            error: result.err().map(|e| e.to_string()),
        })
    }
}
