//! The engine context and per-session busy locks.
//!
//! [`Engine`] is the explicit context value threaded through every
//! operation: the chain RPC, both stores, the wallet, the policy config,
//! and the lock table. Nothing here is process-global.
//!
//! Locks are reservations, not mutexes: holding a [`SessionGuard`] means
//! "a state-advancing operation is in flight for this session", and any
//! competing operation observes [`EngineError::SessionBusy`] instead of
//! blocking. Guards are plain ids, safe to hold across awaits.

use std::sync::Arc;

use dashmap::DashMap;

use kasmix_chain::ChainRpc;
use kasmix_session::{SessionId, SessionStore};
use kasmix_wallet::{UtxoManager, Wallet};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Reservation table keyed by session id.
#[derive(Default)]
pub struct SessionLocks {
    held: Arc<DashMap<String, ()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to reserve one session. `None` when already reserved.
    pub fn try_lock(&self, id: &SessionId) -> Option<SessionGuard> {
        match self.held.entry(id.as_str().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(SessionGuard {
                    held: Arc::clone(&self.held),
                    id: id.as_str().to_string(),
                })
            }
        }
    }

    /// Reserve a whole set or nothing.
    pub fn try_lock_all(&self, ids: &[SessionId]) -> Option<Vec<SessionGuard>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            match self.try_lock(id) {
                Some(guard) => guards.push(guard),
                // Dropping the partial set releases what we took.
                None => return None,
            }
        }
        Some(guards)
    }
}

/// RAII reservation for one session.
pub struct SessionGuard {
    held: Arc<DashMap<String, ()>>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}

/// The service engine: shared context for every operation.
pub struct Engine {
    rpc: Arc<dyn ChainRpc>,
    sessions: Arc<SessionStore>,
    wallet: Arc<Wallet>,
    locks: SessionLocks,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        sessions: Arc<SessionStore>,
        wallet: Arc<Wallet>,
        config: EngineConfig,
    ) -> Self {
        Self {
            rpc,
            sessions,
            wallet,
            locks: SessionLocks::new(),
            config,
        }
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn wallet(&self) -> &Arc<Wallet> {
        &self.wallet
    }

    /// The shared UTXO/DAA facilities (one cache for the whole process).
    pub fn utxos(&self) -> &UtxoManager {
        self.wallet.utxo_manager()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    /// Reserve one session for a state-advancing operation.
    pub fn lock_session(&self, id: &SessionId) -> Result<SessionGuard, EngineError> {
        self.locks.try_lock(id).ok_or(EngineError::SessionBusy)
    }

    /// Reserve a participating set for build/sign/submit.
    pub fn lock_session_set(&self, ids: &[SessionId]) -> Result<Vec<SessionGuard>, EngineError> {
        self.locks.try_lock_all(ids).ok_or(EngineError::SessionBusy)
    }

    /// Re-read a session and mark it failed with a scrubbed tagged error.
    ///
    /// Used by the monitors: never crash the loop, record the failure on
    /// the session itself and keep going.
    pub(crate) fn fail_session(&self, id: &SessionId, error: &EngineError) {
        let Some(mut session) = self.sessions.get(id) else {
            return;
        };
        session.fail(scrub(&error.tagged()));
        if let Err(store_err) = self.sessions.set(session) {
            tracing::error!(session = %id, error = %store_err, "failed to persist session error state");
        }
    }
}

/// Redact long hex runs (key and seed material) from error text before it
/// is logged or persisted.
pub fn scrub(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut run = String::new();
    for c in message.chars().chain(std::iter::once('\0')) {
        if c.is_ascii_hexdigit() {
            run.push(c);
            continue;
        }
        if run.len() >= 64 {
            out.push_str("[redacted]");
        } else {
            out.push_str(&run);
        }
        run.clear();
        if c != '\0' {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SessionId {
        SessionId::from_string(s)
    }

    #[test]
    fn lock_excludes_second_holder() {
        let locks = SessionLocks::new();
        let guard = locks.try_lock(&id("a")).unwrap();
        assert!(locks.try_lock(&id("a")).is_none());
        drop(guard);
        assert!(locks.try_lock(&id("a")).is_some());
    }

    #[test]
    fn lock_all_is_all_or_nothing() {
        let locks = SessionLocks::new();
        let _held = locks.try_lock(&id("b")).unwrap();

        // "a" must be released when "b" turns out busy.
        assert!(locks.try_lock_all(&[id("a"), id("b")]).is_none());
        assert!(locks.try_lock(&id("a")).is_some());
    }

    #[test]
    fn lock_all_holds_entire_set() {
        let locks = SessionLocks::new();
        let guards = locks.try_lock_all(&[id("x"), id("y")]).unwrap();
        assert!(locks.try_lock(&id("x")).is_none());
        assert!(locks.try_lock(&id("y")).is_none());
        drop(guards);
        assert!(locks.try_lock(&id("x")).is_some());
    }

    #[test]
    fn scrub_redacts_long_hex() {
        let key = "ab".repeat(32);
        let message = format!("failed to import {key} into wallet");
        let scrubbed = scrub(&message);
        assert!(!scrubbed.contains(&key));
        assert!(scrubbed.contains("[redacted]"));
        assert!(scrubbed.starts_with("failed to import"));
    }

    #[test]
    fn scrub_keeps_short_hex_and_plain_text() {
        assert_eq!(scrub("fee 10000 at deadbeef"), "fee 10000 at deadbeef");
        assert_eq!(scrub("no hex here"), "no hex here");
    }

    #[test]
    fn scrub_redacts_trailing_hex() {
        let key = "0f".repeat(40);
        let scrubbed = scrub(&format!("key: {key}"));
        assert_eq!(scrubbed, "key: [redacted]");
    }
}
