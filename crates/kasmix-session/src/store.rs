//! Atomic JSON session store.
//!
//! One file, `sessions.json`, holding the full `session id → record` map.
//! Every mutation rewrites the file through a temp-file-plus-rename so a
//! crash mid-write leaves either the old or the new file, never a torn
//! one. A file that exists but does not parse is surfaced as
//! [`StoreError::Corrupt`] rather than an empty map — losing track of
//! sessions that hold keys to user funds is the one failure this store
//! must never paper over.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::record::{Session, SessionId};

/// Durable map of session id → session record.
///
/// Reads are served from memory; the write lock serialises mutators so
/// `enumerate` snapshots are never torn by a concurrent `set`.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Open the store at `path`, loading any existing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let map = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<HashMap<String, Session>>(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        debug!(path = %path.display(), sessions = map.len(), "session store opened");
        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch one session by id.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.inner.read().get(id.as_str()).cloned()
    }

    /// Insert or replace a session, enforcing the write guards:
    /// the variant is immutable, status edges must be in the DAG, and a
    /// persisted intermediate key is write-once.
    pub fn set(&self, session: Session) -> Result<(), StoreError> {
        let mut map = self.inner.write();

        if let Some(existing) = map.get(session.id().as_str()) {
            check_replacement(existing, &session)?;
        }

        map.insert(session.id().as_str().to_string(), session);
        self.persist(&map)
    }

    /// Remove a session. Returns whether it existed.
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let mut map = self.inner.write();
        let existed = map.remove(id.as_str()).is_some();
        if existed {
            self.persist(&map)?;
        }
        Ok(existed)
    }

    /// A consistent snapshot of every session, oldest first.
    pub fn enumerate(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.inner.read().values().cloned().collect();
        sessions.sort_by_key(|s| (s.meta().created_at, s.id().as_str().to_string()));
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Write the whole map atomically: temp file in the same directory,
    /// then rename over the target.
    fn persist(&self, map: &HashMap<String, Session>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

/// Guards applied when a `set` replaces an existing record.
fn check_replacement(existing: &Session, incoming: &Session) -> Result<(), StoreError> {
    match (existing, incoming) {
        (Session::Mix(old), Session::Mix(new)) => {
            if old.status != new.status && !old.status.may_transition_to(new.status) {
                return Err(StoreError::InvalidTransition {
                    from: old.status.name().to_string(),
                    to: new.status.name().to_string(),
                });
            }
            if let Some(old_key) = &old.intermediate_private_key {
                if new.intermediate_private_key.as_ref() != Some(old_key) {
                    return Err(StoreError::IntermediateKeyOverwrite);
                }
            }
            Ok(())
        }
        (Session::CoinJoin(old), Session::CoinJoin(new)) => {
            if old.status != new.status && !old.status.may_transition_to(new.status) {
                return Err(StoreError::InvalidTransition {
                    from: old.status.name().to_string(),
                    to: new.status.name().to_string(),
                });
            }
            Ok(())
        }
        _ => Err(StoreError::TypeMismatch),
    }
}
