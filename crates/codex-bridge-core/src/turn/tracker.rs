//! Per-run state machine.
//!
//! ```text
//!            approval request            task_complete
//!   Active ───────────────────▶ Paused      Active ──────────▶ Done
//!     ▲                           │         Active ── error ──▶ Failed
//!     └──── any other event ──────┘         Active ── idle ───▶ TimedOut
//! ```
//!
//! The tracker is pure: it never sleeps or reads a clock. The client owns the
//! inactivity timer and only arms it while [`PendingTurn::timer_armed`] is true,
//! which is never the case while a human decision is outstanding.

use std::time::Duration;

use crate::error::BridgeError;
use crate::protocol::types::EventMsg;

use super::approval::ApprovalRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Active,
    /// Waiting on a human approval decision. The inactivity timer is disarmed.
    Paused,
    Done,
    Failed,
    TimedOut,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnState::Done | TurnState::Failed | TurnState::TimedOut
        )
    }
}

/// What the caller should do after feeding an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStep {
    /// Keep waiting.
    Continue,
    /// `task_complete` arrived; carries the accumulated text.
    Completed(String),
    /// The agent reported an error for this run.
    Failed(String),
}

/// A turn in flight.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    run_id: String,
    session_id: String,
    messages: Vec<String>,
    state: TurnState,
    approval: Option<ApprovalRequest>,
    events_seen: usize,
}

impl PendingTurn {
    pub fn new(run_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            messages: Vec::new(),
            state: TurnState::Active,
            approval: None,
            events_seen: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn waiting_approval(&self) -> bool {
        self.state == TurnState::Paused
    }

    /// The outstanding approval request, while paused.
    pub fn pending_approval(&self) -> Option<&ApprovalRequest> {
        self.approval.as_ref()
    }

    /// Whether the inactivity timer should be running.
    pub fn timer_armed(&self) -> bool {
        self.state == TurnState::Active
    }

    pub fn events_seen(&self) -> usize {
        self.events_seen
    }

    /// Agent messages joined with newlines, in arrival order.
    pub fn accumulated_text(&self) -> String {
        self.messages.join("\n")
    }

    /// Advance on an event for this run. Events after a terminal state are ignored.
    pub fn observe(&mut self, msg: &EventMsg) -> TurnStep {
        if self.state.is_terminal() {
            return TurnStep::Continue;
        }
        self.events_seen += 1;

        if let Some(request) = ApprovalRequest::from_event(&self.run_id, msg) {
            log::info!(
                "Run {} paused for approval of {}",
                self.run_id,
                request.call_id
            );
            self.state = TurnState::Paused;
            self.approval = Some(request);
            return TurnStep::Continue;
        }

        if self.state == TurnState::Paused {
            log::debug!("Run {} resumed", self.run_id);
            self.state = TurnState::Active;
            self.approval = None;
        }

        match msg {
            EventMsg::AgentMessage { message } => {
                self.messages.push(message.clone());
                TurnStep::Continue
            }
            EventMsg::TaskComplete { .. } => {
                self.state = TurnState::Done;
                TurnStep::Completed(self.accumulated_text())
            }
            EventMsg::Error { message } => {
                self.state = TurnState::Failed;
                TurnStep::Failed(message.clone())
            }
            _ => TurnStep::Continue,
        }
    }

    /// The inactivity window elapsed. Returns the error to surface.
    pub fn time_out(&mut self, window: Duration) -> BridgeError {
        self.state = TurnState::TimedOut;
        BridgeError::Timeout {
            run_id: self.run_id.clone(),
            window_ms: window.as_millis(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
