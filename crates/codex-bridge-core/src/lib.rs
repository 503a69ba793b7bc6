//! # codex-bridge-core
//!
//! Drives long-lived Codex agent processes over their line-delimited JSON
//! `proto` protocol.
//!
//! ## Key Concepts
//!
//! - **Frame reader**: turns arbitrary stdout chunks into whole JSON events
//! - **Protocol client**: one per agent process; configures the session,
//!   sends input, and awaits each run's completion
//! - **Turn / run**: one user input and everything the agent emits for it,
//!   identified by a correlation id
//! - **Concurrency gate**: at most one turn in flight per session
//! - **Session registry**: owns every live session and cleans up after
//!   process exit

pub mod config;
pub mod error;
pub mod event_bus;
pub mod gate;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod turn;

// Re-export commonly used types
pub use config::{BridgeConfig, SessionOptions};
pub use error::{BridgeError, Result};
pub use gate::{ConcurrencyGate, GatePermit};
pub use process::{AgentExit, AgentProcess, CodexConfig, ProcessHandle, SpawnConfig};
pub use protocol::{ConfigureOutcome, EventMsg, FrameReader, InboundEvent, ProtocolClient};
pub use registry::{SessionEntry, SessionRegistry};
pub use turn::{ApprovalDecision, ApprovalRequest, PendingTurn, TurnState};
