//! SessionRegistry - owns every live agent session.
//!
//! An entry ties together the protocol client for one agent, the handle of the
//! process behind it (if any), and that session's slot in the
//! [`ConcurrencyGate`]. Entries leave the registry in exactly three ways:
//!
//! - explicit [`SessionRegistry::unregister`] / [`SessionRegistry::terminate`]
//! - the agent's output stream closing (process exit), noticed by a watcher task
//! - [`SessionRegistry::shutdown`]
//!
//! Each of these releases the session's gate, so a dead session never leaves a
//! turn lock behind.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::gate::ConcurrencyGate;
use crate::logging::Transcript;
use crate::process::{forward_stderr, AgentExit, AgentProcess, ProcessHandle};
use crate::protocol::ProtocolClient;

/// One registered session.
pub struct SessionEntry {
    session_id: String,
    client: ProtocolClient,
    process: Option<ProcessHandle>,
}

impl SessionEntry {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// The process behind the client. None for sessions registered over a bare transport.
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    async fn stop_process(&self) -> Option<AgentExit> {
        match &self.process {
            Some(process) => Some(process.stop().await),
            None => None,
        }
    }
}

/// Process-wide map from session id to its live entry.
///
/// Construct one at startup with [`SessionRegistry::new`] and call
/// [`SessionRegistry::shutdown`] on the way out.
pub struct SessionRegistry {
    config: BridgeConfig,
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    gate: Arc<ConcurrencyGate>,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            gate: Arc::new(ConcurrencyGate::new()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Register a spawned agent process under `session_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        process: AgentProcess,
    ) -> Result<Arc<SessionEntry>> {
        let session_id = session_id.into();
        // Checked before taking the process apart; dropping an unsupervised
        // AgentProcess kills the child.
        if self.sessions().contains_key(&session_id) {
            return Err(BridgeError::AlreadyRegistered(session_id));
        }

        let transcript = Transcript::open(self.config.log_dir.as_deref(), &session_id);
        let parts = process.into_parts(self.config.stop_grace());
        if let Some(stderr) = parts.stderr {
            tokio::spawn(forward_stderr(
                stderr,
                session_id.clone(),
                transcript.clone(),
            ));
        }

        let client = ProtocolClient::new(
            session_id.clone(),
            parts.stdin,
            parts.stdout,
            self.config.clone(),
            transcript,
        );
        self.insert(SessionEntry {
            session_id,
            client,
            process: Some(parts.handle),
        })
    }

    /// Register a session over any writer/reader pair.
    pub fn register_transport<W, R>(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        writer: W,
        reader: R,
    ) -> Result<Arc<SessionEntry>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let session_id = session_id.into();
        if self.sessions().contains_key(&session_id) {
            return Err(BridgeError::AlreadyRegistered(session_id));
        }

        let transcript = Transcript::open(self.config.log_dir.as_deref(), &session_id);
        let client = ProtocolClient::new(
            session_id.clone(),
            writer,
            reader,
            self.config.clone(),
            transcript,
        );
        self.insert(SessionEntry {
            session_id,
            client,
            process: None,
        })
    }

    fn insert(self: &Arc<Self>, entry: SessionEntry) -> Result<Arc<SessionEntry>> {
        let entry = Arc::new(entry);
        {
            let mut sessions = self.sessions();
            if sessions.contains_key(&entry.session_id) {
                entry.client.cancel();
                let loser = Arc::clone(&entry);
                tokio::spawn(async move {
                    loser.stop_process().await;
                });
                return Err(BridgeError::AlreadyRegistered(entry.session_id.clone()));
            }
            sessions.insert(entry.session_id.clone(), Arc::clone(&entry));
        }
        log::info!("Registered session {}", entry.session_id);

        let registry = Arc::downgrade(self);
        let watched = Arc::clone(&entry);
        tokio::spawn(async move {
            watched.client.closed().await;
            if let Some(registry) = Weak::upgrade(&registry) {
                registry.remove_closed(&watched);
            }
        });

        Ok(entry)
    }

    /// The live entry for `session_id`.
    pub fn get(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        self.sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(session_id.to_string()))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions().contains_key(session_id)
    }

    /// Registered session ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Whether a turn is in flight for the session.
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.gate.is_held(session_id)
    }

    /// Remove the entry, release its gate, and cancel any pending runs.
    ///
    /// The process, if any, is left running; see [`SessionRegistry::terminate`].
    pub fn unregister(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        let entry = self
            .sessions()
            .remove(session_id)
            .ok_or_else(|| BridgeError::NotFound(session_id.to_string()))?;
        self.gate.release(session_id);
        entry.client.cancel();
        log::info!("Unregistered session {}", session_id);
        Ok(entry)
    }

    /// Unregister the session and stop its process.
    ///
    /// Pending runs are rejected with `Cancelled`. Returns how the process
    /// ended, or None for transport-only sessions.
    pub async fn terminate(&self, session_id: &str) -> Result<Option<AgentExit>> {
        let entry = self.unregister(session_id)?;
        let exit = entry.stop_process().await;
        if let Some(exit) = exit {
            log::info!("Session {} terminated: {:?}", session_id, exit);
        }
        Ok(exit)
    }

    /// Terminate every session.
    pub async fn shutdown(&self) {
        let ids = self.list();
        log::info!("Shutting down {} session(s)", ids.len());
        for id in ids {
            if let Err(e) = self.terminate(&id).await {
                log::debug!("Session {} already gone during shutdown: {}", id, e);
            }
        }
    }

    /// Run one turn: take the session's gate, send `text`, wait for the outcome.
    ///
    /// Fails with `Conflict`, without touching the session, if a turn is
    /// already in flight. The gate is released on every exit path, including
    /// the returned future being dropped.
    pub async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        inactivity_timeout_ms: i64,
    ) -> Result<String> {
        let entry = self.get(session_id)?;
        let _permit = self
            .gate
            .try_enter(session_id)
            .ok_or_else(|| BridgeError::Conflict(session_id.to_string()))?;

        let run_id = entry.client.send_input(text, None)?;
        log::info!("Session {} started run {}", session_id, run_id);

        let outcome = entry
            .client
            .await_completion(&run_id, inactivity_timeout_ms)
            .await;
        if let Err(e) = &outcome {
            log::warn!("Session {} run {} failed: {}", session_id, run_id, e);
        }
        outcome
    }

    /// Called by the watcher once the client has closed. Only removes the
    /// entry it was watching, not a newer session reusing the id.
    fn remove_closed(&self, entry: &Arc<SessionEntry>) {
        let removed = {
            let mut sessions = self.sessions();
            match sessions.get(&entry.session_id) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    sessions.remove(&entry.session_id)
                }
                _ => None,
            }
        };
        if removed.is_some() {
            self.gate.release(&entry.session_id);
            log::info!("Session {} closed, unregistered", entry.session_id);
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionEntry>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for entry in self.sessions().values() {
            entry.client.cancel();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
