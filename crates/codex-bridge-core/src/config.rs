//! Bridge configuration.
//!
//! [`BridgeConfig`] tunes the client and registry (grace periods, inactivity
//! window, transcript directory). [`SessionOptions`] is what gets sent to the
//! agent in the `configure_session` request.
//!
//! Both deserialize with defaults for every missing field, so a config file
//! only needs to mention what it overrides:
//!
//! ```json
//! { "inactivity_timeout_ms": 0, "log_dir": "/tmp/codex-bridge" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

fn default_configure_grace_ms() -> u64 {
    2_000
}

fn default_inactivity_timeout_ms() -> i64 {
    5 * 60 * 1_000
}

fn default_stop_grace_ms() -> u64 {
    3_000
}

/// Runtime knobs for the protocol client and session registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How long `configure` waits for an acknowledgment before assuming success.
    #[serde(default = "default_configure_grace_ms")]
    pub configure_grace_ms: u64,

    /// Inactivity window for turns. Zero or negative disables the timeout.
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: i64,

    /// How long a stopped process gets to exit after SIGINT before it is killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Directory for per-session protocol transcripts. None disables them.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            configure_grace_ms: default_configure_grace_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            log_dir: None,
        }
    }
}

impl BridgeConfig {
    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn configure_grace(&self) -> Duration {
        Duration::from_millis(self.configure_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// The inactivity window, or `None` when the timeout is disabled.
    pub fn inactivity_window(&self) -> Option<Duration> {
        inactivity_window(self.inactivity_timeout_ms)
    }
}

/// Convert a millisecond inactivity setting into a window. `<= 0` means no timeout.
pub fn inactivity_window(timeout_ms: i64) -> Option<Duration> {
    u64::try_from(timeout_ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Model provider the agent should talk to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub base_url: String,
    pub env_key: String,
    pub wire_api: String,
}

impl Default for ProviderInfo {
    fn default() -> Self {
        Self {
            name: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            env_key: "OPENAI_API_KEY".to_string(),
            wire_api: "responses".to_string(),
        }
    }
}

/// Sandbox permissions granted to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub permissions: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            permissions: vec![
                "disk-full-read-access".to_string(),
                "disk-write-cwd".to_string(),
            ],
        }
    }
}

/// Everything `configure_session` carries besides the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub provider: ProviderInfo,
    pub model: String,
    pub model_reasoning_effort: String,
    pub model_reasoning_summary: String,
    pub approval_policy: String,
    pub sandbox_policy: SandboxPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provider: ProviderInfo::default(),
            model: "codex-mini-latest".to_string(),
            model_reasoning_effort: "medium".to_string(),
            model_reasoning_summary: "auto".to_string(),
            approval_policy: "on-request".to_string(),
            sandbox_policy: SandboxPolicy::default(),
        }
    }
}

impl SessionOptions {
    /// Override the model, keeping the rest.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
