//! At most one in-flight turn per session.
//!
//! The gate is a set of held session ids. It knows nothing about protocol
//! clients, so it can serialize oneshot executions (a process per turn) the
//! same way it serializes turns on a persistent session.
//!
//! Prefer [`ConcurrencyGate::try_enter`] over bare `acquire`/`release`: the
//! returned [`GatePermit`] releases on drop, which covers early returns,
//! errors, and callers dropping the future mid-turn.
//!
//! Every hold carries a token. A permit only releases the hold it acquired,
//! so a permit outliving a forced `release` cannot free a later holder.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

#[derive(Debug, Default)]
struct Holds {
    held: HashMap<String, u64>,
    next_token: u64,
}

#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    holds: Mutex<Holds>,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-set. Returns false, changing nothing, if the session is already held.
    pub fn acquire(&self, session_id: &str) -> bool {
        self.acquire_token(session_id).is_some()
    }

    /// Clear the hold, whoever owns it. Releasing a session that is not held is a no-op.
    pub fn release(&self, session_id: &str) {
        self.holds().held.remove(session_id);
    }

    pub fn is_held(&self, session_id: &str) -> bool {
        self.holds().held.contains_key(session_id)
    }

    /// Number of sessions currently holding the gate.
    pub fn held_count(&self) -> usize {
        self.holds().held.len()
    }

    /// Acquire and return a permit that releases on drop.
    pub fn try_enter(self: &Arc<Self>, session_id: &str) -> Option<GatePermit> {
        self.acquire_token(session_id).map(|token| GatePermit {
            gate: Arc::clone(self),
            session_id: session_id.to_string(),
            token,
        })
    }

    fn acquire_token(&self, session_id: &str) -> Option<u64> {
        let mut holds = self.holds();
        if holds.held.contains_key(session_id) {
            log::debug!("Gate for session {} already held", session_id);
            return None;
        }
        let token = holds.next_token;
        holds.next_token += 1;
        holds.held.insert(session_id.to_string(), token);
        Some(token)
    }

    /// Release only if `token` still owns the hold.
    fn release_token(&self, session_id: &str, token: u64) {
        let mut holds = self.holds();
        if holds.held.get(session_id) == Some(&token) {
            holds.held.remove(session_id);
        }
    }

    fn holds(&self) -> MutexGuard<'_, Holds> {
        self.holds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held gate. Dropping it releases the session.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    session_id: String,
    token: u64,
}

impl GatePermit {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release_token(&self.session_id, self.token);
    }
}

// ============================================================================
// TESTS
// ============================================================================
