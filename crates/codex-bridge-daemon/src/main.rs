//! codex-bridge - run one prompt through a Codex agent in protocol mode.
//!
//! Spawns the agent, configures the session, runs a single turn through the
//! session registry, answers patch approvals according to `--approval`, and
//! prints the agent's reply on stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use codex_bridge_core::event_bus::Subscription;
use codex_bridge_core::{
    AgentProcess, ApprovalDecision, ApprovalRequest, BridgeConfig, BridgeError, CodexConfig,
    ConfigureOutcome, InboundEvent, Result, SessionEntry, SessionOptions, SessionRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ApprovalMode {
    /// Prompt on the terminal for every patch
    Ask,
    /// Approve every patch once
    Approve,
    /// Deny every patch
    Deny,
}

#[derive(Debug, Parser)]
#[command(name = "codex-bridge")]
#[command(about = "Run a prompt through a Codex agent over its proto protocol")]
struct Cli {
    /// Path to the codex binary
    #[arg(long, default_value = "codex")]
    agent: String,

    /// Working directory for the agent (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Model to request
    #[arg(long)]
    model: Option<String>,

    /// JSON file with bridge settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell invocation to wrap the agent in, e.g. "/bin/zsh -l -c"
    #[arg(long)]
    shell_prefix: Option<String>,

    /// Inactivity timeout in milliseconds; zero or negative disables it
    #[arg(long, allow_hyphen_values = true)]
    timeout_ms: Option<i64>,

    /// How to answer patch approval requests
    #[arg(long, value_enum, default_value = "ask")]
    approval: ApprovalMode,

    /// Prompt to send
    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,
}

impl Cli {
    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };
        if let Some(timeout) = self.timeout_ms {
            config.inactivity_timeout_ms = timeout;
        }
        Ok(config)
    }

    fn session_options(&self) -> SessionOptions {
        match &self.model {
            Some(model) => SessionOptions::default().model(model),
            None => SessionOptions::default(),
        }
    }

    fn prompt(&self) -> String {
        self.prompt.join(" ")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("codex-bridge: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<String> {
    let config = cli.bridge_config()?;
    let cwd = match &cli.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let cwd = cwd.to_string_lossy().into_owned();

    let spawn = CodexConfig {
        binary_path: cli.agent.clone(),
        working_dir: Some(cwd.clone()),
        model: cli.model.clone(),
        shell_prefix: cli.shell_prefix.clone(),
    }
    .build();
    let process = AgentProcess::spawn(&spawn)?;

    let registry = SessionRegistry::new(config);
    let session_id = format!("cli-{}", std::process::id());
    let entry = registry.register(session_id.clone(), process)?;

    let outcome = drive(&registry, &entry, &cli, &cwd).await;
    registry.shutdown().await;
    outcome
}

async fn drive(
    registry: &SessionRegistry,
    entry: &Arc<SessionEntry>,
    cli: &Cli,
    cwd: &str,
) -> Result<String> {
    match entry.client().configure(cwd, cli.session_options()).await? {
        ConfigureOutcome::Acknowledged => log::info!("Session configured"),
        ConfigureOutcome::AssumedAfterGrace => {
            log::warn!("Agent never acknowledged configuration, continuing")
        }
    }

    let events = entry.client().subscribe();
    let approvals = tokio::spawn(answer_approvals(Arc::clone(entry), events, cli.approval));

    let timeout_ms = registry.config().inactivity_timeout_ms;
    let prompt = cli.prompt();
    let outcome = tokio::select! {
        outcome = registry.run_turn(entry.session_id(), &prompt, timeout_ms) => outcome,
        _ = tokio::signal::ctrl_c() => Err(BridgeError::Cancelled {
            run_id: entry.session_id().to_string(),
        }),
    };

    approvals.abort();
    outcome
}

async fn answer_approvals(
    entry: Arc<SessionEntry>,
    mut events: Subscription<InboundEvent>,
    mode: ApprovalMode,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Approval listener skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(request) = ApprovalRequest::from_event(event.correlation_id(), &event.msg) else {
            continue;
        };

        let decision = match mode {
            ApprovalMode::Approve => ApprovalDecision::approve_once(&request.call_id),
            ApprovalMode::Deny => ApprovalDecision::deny(&request.call_id),
            ApprovalMode::Ask => {
                eprint!(
                    "Agent wants to patch {}\nApprove? [y]es / [a]lways / [N]o: ",
                    request.summary()
                );
                match stdin.next_line().await {
                    Ok(Some(line)) => decision_from_answer(&request, &line),
                    _ => ApprovalDecision::deny(&request.call_id),
                }
            }
        };

        log::info!("Answering {} with {:?}", request.call_id, decision.decision);
        if let Err(e) = entry.client().send_approval_decision(&decision) {
            log::warn!("Could not send approval decision: {}", e);
            break;
        }
    }
}

/// Anything other than yes/always denies.
fn decision_from_answer(request: &ApprovalRequest, answer: &str) -> ApprovalDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::approve_once(&request.call_id),
        "a" | "always" => ApprovalDecision::approve_for_session(&request.call_id),
        _ => ApprovalDecision::deny(&request.call_id),
    }
}

// ============================================================================
// TESTS
// ============================================================================
