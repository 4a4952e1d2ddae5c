//! Session Store
//!
//! Keeps one `SplitSession` per payment hash. Each session sits behind its
//! own async mutex, so work on one payment hash never waits on another.
//!
//! # Concurrency
//!
//! The map lock is held only for lookup, insert and removal and is never
//! held while awaiting a session lock. Callers that lock a session must
//! check `is_terminal()` after acquiring it: a session can be terminated
//! and removed between lookup and lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::session::{Role, SplitSession};
use crate::proto::primitives::PaymentHash;

pub type SessionHandle = Arc<Mutex<SplitSession>>;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    /// A session for this payment hash already exists
    AlreadyExists { payment_hash: PaymentHash, role: Role },
}

impl std::fmt::Display for SessionStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists { payment_hash, role } => {
                write!(f, "{} session already exists for {}", role, payment_hash)
            }
        }
    }
}

impl std::error::Error for SessionStoreError {}

// ============================================================================
// Session Store
// ============================================================================

struct Entry {
    role: Role,
    handle: SessionHandle,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<PaymentHash, Entry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, payment_hash: &PaymentHash) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.get(payment_hash).map(|e| e.handle.clone())
    }

    /// Role of the session for `payment_hash`, without locking the session.
    pub async fn role(&self, payment_hash: &PaymentHash) -> Option<Role> {
        let sessions = self.sessions.lock().await;
        sessions.get(payment_hash).map(|e| e.role)
    }

    /// Inserts a new session. Fails if one exists for the same hash.
    pub async fn create(&self, session: SplitSession) -> Result<SessionHandle, SessionStoreError> {
        let payment_hash = session.payment_hash();
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&payment_hash) {
            return Err(SessionStoreError::AlreadyExists {
                payment_hash,
                role: existing.role,
            });
        }
        let role = session.role();
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(
            payment_hash,
            Entry {
                role,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// Returns the existing session or inserts the one built by `init`.
    /// The boolean is true if the session was created by this call.
    ///
    /// Lookup and insert happen under one lock, so two concurrent callers
    /// end up with the same session.
    pub async fn get_or_create<F>(&self, payment_hash: PaymentHash, init: F) -> (SessionHandle, bool)
    where
        F: FnOnce() -> SplitSession,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&payment_hash) {
            return (existing.handle.clone(), false);
        }
        let session = init();
        let role = session.role();
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(
            payment_hash,
            Entry {
                role,
                handle: handle.clone(),
            },
        );
        (handle, true)
    }

    /// Removes the session for `payment_hash` if it is still `handle`.
    ///
    /// A later session for the same hash is left alone.
    pub async fn remove(&self, payment_hash: &PaymentHash, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(payment_hash) {
            Some(entry) if Arc::ptr_eq(&entry.handle, handle) => {
                sessions.remove(payment_hash);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all sessions with the given role.
    pub async fn list(&self, role: Role) -> Vec<(PaymentHash, SessionHandle)> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|(_, e)| e.role == role)
            .map(|(hash, e)| (*hash, e.handle.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
