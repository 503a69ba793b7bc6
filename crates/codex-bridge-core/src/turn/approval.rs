//! Mid-turn approval requests and the decisions that answer them.

use std::collections::BTreeMap;

use crate::protocol::types::{ApprovalScope, EventMsg, FileChange, Op, ReviewDecision};

/// The agent is blocked until a human approves or denies a patch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    /// Run that raised the request.
    pub run_id: String,
    pub call_id: String,
    pub changes: BTreeMap<String, FileChange>,
    pub justification: Option<String>,
}

impl ApprovalRequest {
    /// Extract an approval request from an event, if it is one.
    pub fn from_event(run_id: &str, msg: &EventMsg) -> Option<Self> {
        match msg {
            EventMsg::ApplyPatchApprovalRequest {
                call_id,
                changes,
                justification,
            } => Some(Self {
                run_id: run_id.to_string(),
                call_id: call_id.clone(),
                changes: changes.clone(),
                justification: justification.clone(),
            }),
            _ => None,
        }
    }

    /// Paths the patch touches, sorted.
    pub fn paths(&self) -> Vec<&str> {
        self.changes.keys().map(String::as_str).collect()
    }

    /// One-line description for prompts and logs.
    pub fn summary(&self) -> String {
        let paths = self.paths().join(", ");
        match self.justification.as_deref() {
            Some(why) if !why.is_empty() => format!("{paths} ({why})"),
            _ => paths,
        }
    }
}

/// Answer to an [`ApprovalRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub call_id: String,
    pub decision: ReviewDecision,
    pub scope: ApprovalScope,
    /// Path prefix, for [`ApprovalScope::Path`].
    pub path: Option<String>,
}

impl ApprovalDecision {
    pub fn approve_once(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            decision: ReviewDecision::Approve,
            scope: ApprovalScope::Once,
            path: None,
        }
    }

    pub fn approve_for_session(call_id: impl Into<String>) -> Self {
        Self {
            scope: ApprovalScope::Session,
            ..Self::approve_once(call_id)
        }
    }

    pub fn approve_path(call_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scope: ApprovalScope::Path,
            path: Some(path.into()),
            ..Self::approve_once(call_id)
        }
    }

    pub fn deny(call_id: impl Into<String>) -> Self {
        Self {
            decision: ReviewDecision::Deny,
            ..Self::approve_once(call_id)
        }
    }

    pub fn to_op(&self) -> Op {
        Op::ExecApproval {
            call_id: self.call_id.clone(),
            decision: self.decision,
            scope: self.scope,
            path: self.path.clone(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
