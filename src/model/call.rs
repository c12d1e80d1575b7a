//! Correlated call tracking.
//!
//! A [`Call`] groups the one or two sessions (caller leg + callee
//! leg) that share a correlation tag. The call owns its session list;
//! sessions carry only the call UUID back-reference, so there is no
//! retention cycle.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::identifiers::{CallUuid, SessionUuid};

use super::session::Session;

// ============================================================================
// Call
// ============================================================================

/// Mutable call state.
struct CallState {
    sessions: Vec<Arc<Session>>,
    vars: FxHashMap<String, String>,
}

/// A correlated group of sessions forming one user call.
pub struct Call {
    uuid: CallUuid,
    state: Mutex<CallState>,
}

impl Call {
    /// Creates a call around its first (originating) session.
    #[must_use]
    pub fn new(uuid: CallUuid, first: Arc<Session>) -> Self {
        Self {
            uuid,
            state: Mutex::new(CallState {
                sessions: vec![first],
                vars: FxHashMap::default(),
            }),
        }
    }

    /// Returns the shared call tag.
    #[inline]
    #[must_use]
    pub fn uuid(&self) -> CallUuid {
        self.uuid
    }

    /// Appends a correlated session.
    pub fn append(&self, session: Arc<Session>) {
        self.state.lock().sessions.push(session);
    }

    /// Removes a session; returns `true` when the call is now empty
    /// (all legs hung up) and should be torn down.
    pub fn remove(&self, uuid: SessionUuid) -> bool {
        let mut state = self.state.lock();
        state.sessions.retain(|s| s.uuid() != uuid);
        state.sessions.is_empty()
    }

    /// Returns the number of live legs.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Snapshot of the live legs in correlation order.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().sessions.clone()
    }

    /// The initial leg of this call.
    #[must_use]
    pub fn first(&self) -> Option<Arc<Session>> {
        self.state.lock().sessions.first().cloned()
    }

    /// The most recently correlated leg.
    #[must_use]
    pub fn last(&self) -> Option<Arc<Session>> {
        self.state.lock().sessions.last().cloned()
    }

    /// Given one leg, returns the other, if established.
    #[must_use]
    pub fn peer_of(&self, uuid: SessionUuid) -> Option<Arc<Session>> {
        let state = self.state.lock();
        if state.sessions.len() < 2 {
            return None;
        }
        state
            .sessions
            .iter()
            .find(|s| s.uuid() != uuid)
            .cloned()
    }

    /// Hangs the whole call up by killing the first leg; the engine
    /// tears the peer down.
    pub fn hangup(&self, cause: &str) -> Result<()> {
        match self.first() {
            Some(first) => first.hangup(cause),
            None => Ok(()),
        }
    }

    /// Sets a call-scoped variable.
    pub fn set_var(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.lock().vars.insert(name.into(), value.into());
    }

    /// Returns a call-scoped variable.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<String> {
        self.state.lock().vars.get(name).cloned()
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("uuid", &self.uuid)
            .field("sessions", &self.session_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
