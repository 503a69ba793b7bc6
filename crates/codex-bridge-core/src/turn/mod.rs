//! Turn tracking: one user input and everything the agent does until it
//! reports completion, failure, or goes quiet.

mod approval;
mod tracker;

pub use approval::{ApprovalDecision, ApprovalRequest};
pub use tracker::{PendingTurn, TurnState, TurnStep};
