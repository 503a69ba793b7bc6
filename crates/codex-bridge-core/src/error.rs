//! Error types surfaced by the bridge.
//!
//! Parse failures on the agent's output stream never show up here: the frame
//! reader drops lines it cannot decode. Everything else reaches the caller as
//! one of the variants below, and each variant is distinguishable by `match`.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// The agent's input stream is closed or the write failed.
    #[error("Failed to write to agent stdin: {0}")]
    Write(String),

    /// The agent answered a request with an `error` event.
    #[error("Agent reported an error for {correlation_id}: {message}")]
    Protocol {
        correlation_id: String,
        message: String,
    },

    /// No event arrived for a run within its inactivity window.
    #[error("Run {run_id} saw no activity for {window_ms}ms")]
    Timeout { run_id: String, window_ms: u128 },

    /// A turn is already in flight for the session.
    #[error("Session {0} already has a turn in flight")]
    Conflict(String),

    /// The agent process went away while a run was pending.
    #[error("Agent process exited while run {run_id} was pending")]
    ProcessExited { run_id: String },

    /// The session was torn down while a run was pending.
    #[error("Run {run_id} was cancelled")]
    Cancelled { run_id: String },

    /// Someone is already awaiting this run.
    #[error("Run {0} already has a waiter")]
    AlreadyAwaited(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True for outcomes caused by the agent going away rather than by the run itself.
    pub fn is_teardown(&self) -> bool {
        matches!(
            self,
            BridgeError::ProcessExited { .. } | BridgeError::Cancelled { .. }
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
