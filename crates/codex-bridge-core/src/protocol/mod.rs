//! The Codex `proto` wire protocol: framing, message types, and the client
//! that drives one agent process.

mod client;
pub mod frame;
pub mod types;

pub use client::{ConfigureOutcome, ProtocolClient};
pub use frame::FrameReader;
pub use types::{
    ApprovalScope, EventMsg, InboundEvent, InputItem, Op, RawEvent, ReviewDecision, Submission,
};
