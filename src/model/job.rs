//! Background job tracking.
//!
//! A [`Job`] is one outstanding `bgapi` call. It resolves exactly
//! once: with the result payload from the matching `BACKGROUND_JOB`
//! event, with the `-ERR` cause when the engine rejects it, or as
//! lost when the owning connection closes first.

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::identifiers::{JobUuid, SessionUuid};

// ============================================================================
// JobState
// ============================================================================

/// Single-assignment resolution state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    /// Awaiting the `BACKGROUND_JOB` event.
    Pending,
    /// Engine reported success; payload is the `+OK` remainder.
    Resolved(String),
    /// Engine reported failure; payload is the `-ERR` cause.
    Failed(String),
    /// The owning connection closed before resolution.
    Lost,
}

// ============================================================================
// Job
// ============================================================================

/// One outstanding background job.
///
/// For originates the session UUID is preset at launch so callers can
/// look the session up in the listener before any event arrives.
#[derive(Debug)]
pub struct Job {
    uuid: JobUuid,
    session_uuid: Option<SessionUuid>,
    launched_at: f64,
    state: Mutex<JobState>,
    done: Notify,
}

impl Job {
    /// Creates a pending job.
    #[must_use]
    pub fn new(uuid: JobUuid, session_uuid: Option<SessionUuid>) -> Self {
        Self {
            uuid,
            session_uuid,
            launched_at: epoch_now(),
            state: Mutex::new(JobState::Pending),
            done: Notify::new(),
        }
    }

    /// Returns the job UUID.
    #[inline]
    #[must_use]
    pub fn uuid(&self) -> JobUuid {
        self.uuid
    }

    /// Returns the pre-bound session UUID, if any.
    #[inline]
    #[must_use]
    pub fn session_uuid(&self) -> Option<SessionUuid> {
        self.session_uuid
    }

    /// Returns the launch timestamp in seconds since the epoch.
    #[inline]
    #[must_use]
    pub fn launched_at(&self) -> f64 {
        self.launched_at
    }

    /// Returns `true` once resolved, failed or lost.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.state.lock() != JobState::Pending
    }

    // ========================================================================
    // Resolution (listener side)
    // ========================================================================

    /// Resolves the job with a success payload.
    ///
    /// Returns `false` if the job was already settled; resolution is
    /// single-assignment.
    pub fn resolve(&self, result: impl Into<String>) -> bool {
        self.settle(JobState::Resolved(result.into()))
    }

    /// Fails the job with an `-ERR` cause.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        self.settle(JobState::Failed(cause.into()))
    }

    /// Fails the job because its connection closed.
    pub fn fail_lost(&self) -> bool {
        self.settle(JobState::Lost)
    }

    fn settle(&self, next: JobState) -> bool {
        let mut state = self.state.lock();
        if *state != JobState::Pending {
            return false;
        }
        *state = next;
        drop(state);
        self.done.notify_waiters();
        true
    }

    // ========================================================================
    // Observation (caller side)
    // ========================================================================

    /// Returns the outcome without waiting, or `None` while pending.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<String>> {
        match &*self.state.lock() {
            JobState::Pending => None,
            JobState::Resolved(result) => Some(Ok(result.clone())),
            JobState::Failed(cause) => Some(Err(Error::job_failed(self.uuid, cause.clone()))),
            JobState::Lost => Some(Err(Error::ConnectionClosed)),
        }
    }

    /// Waits for the job to settle.
    ///
    /// # Errors
    ///
    /// - [`Error::JobFailed`] when the engine returned `-ERR`
    /// - [`Error::ConnectionClosed`] when the connection dropped first
    pub async fn wait(&self) -> Result<String> {
        loop {
            // Register interest before checking so a settle between
            // the check and the await cannot be missed.
            let notified = self.done.notified();
            if let Some(outcome) = self.try_result() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// Wall-clock seconds since the Unix epoch.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
