//! Session state tracking and call control.
//!
//! One [`Session`] is one channel leg on an engine. The listener's
//! pump task creates it on the first `CHANNEL_CREATE` (or originate
//! allocation), feeds every subsequent channel event into its rolling
//! history, and destroys it after `CHANNEL_HANGUP_COMPLETE`.
//!
//! Control verbs (`hangup`, `park`, `playback`, ...) are issued
//! through the owning connection. Verbs callable from synchronous
//! callback contexts are fire-and-forget (the reply consumes a FIFO
//! slot and is discarded); pair them with [`Session::recv`] to await
//! the resulting event.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::{AppId, CallUuid, ClientId, JobUuid, SessionUuid};
use crate::protocol::{command, names, Event};
use crate::transport::{Connection, ReplyKind};

use super::history::EventHistory;

// ============================================================================
// Direction
// ============================================================================

/// Which side of the engine the leg entered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Leg arrived at the engine (terminating side).
    Inbound,
    /// Leg was placed by the engine (originating side).
    Outbound,
}

impl Direction {
    /// Parses the `Call-Direction` header value.
    #[must_use]
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

// ============================================================================
// SessionTimes
// ============================================================================

/// Lifecycle timestamps in seconds since the epoch.
///
/// Engine-side stamps come from `Event-Date-Timestamp`;
/// `req_originate` is the local wall clock when the originate was
/// issued.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionTimes {
    /// `CHANNEL_CREATE` engine time.
    pub create: Option<f64>,
    /// `CHANNEL_ANSWER` engine time.
    pub answer: Option<f64>,
    /// `CHANNEL_ORIGINATE` engine time.
    pub originate: Option<f64>,
    /// Local time the originate command was issued.
    pub req_originate: Option<f64>,
    /// `CHANNEL_HANGUP` engine time.
    pub hangup: Option<f64>,
}

// ============================================================================
// Session
// ============================================================================

/// Mutable session state, guarded by one mutex.
struct SessionState {
    history: EventHistory,
    direction: Direction,
    times: SessionTimes,
    answered: bool,
    hungup: bool,
    hangup_cause: Option<String>,
    call_uuid: Option<CallUuid>,
    app_id: Option<AppId>,
    client_id: Option<ClientId>,
    job_uuid: Option<JobUuid>,
    vars: FxHashMap<String, String>,
    last_event_time: Option<f64>,
}

/// One channel leg on an engine.
pub struct Session {
    uuid: SessionUuid,
    conn: Connection,
    state: Mutex<SessionState>,
    waiters: Mutex<FxHashMap<String, Vec<oneshot::Sender<Event>>>>,
}

impl Session {
    /// Creates a session from its first channel event.
    #[must_use]
    pub fn new(uuid: SessionUuid, event: &Event, conn: Connection) -> Self {
        let direction = event
            .call_direction()
            .and_then(Direction::from_header)
            .unwrap_or(Direction::Inbound);
        let timestamp = event.timestamp();

        Self {
            uuid,
            conn,
            state: Mutex::new(SessionState {
                history: EventHistory::new(event.clone()),
                direction,
                times: SessionTimes {
                    create: timestamp,
                    ..SessionTimes::default()
                },
                answered: false,
                hungup: false,
                hangup_cause: None,
                call_uuid: None,
                app_id: None,
                client_id: None,
                job_uuid: None,
                vars: FxHashMap::default(),
                last_event_time: timestamp,
            }),
            waiters: Mutex::new(FxHashMap::default()),
        }
    }

    // ========================================================================
    // Identity & state accessors
    // ========================================================================

    /// Returns the channel UUID.
    #[inline]
    #[must_use]
    pub fn uuid(&self) -> SessionUuid {
        self.uuid
    }

    /// Returns the engine host this session lives on.
    #[inline]
    #[must_use]
    pub fn host(&self) -> String {
        self.conn.host().to_string()
    }

    /// Returns the call direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.state.lock().direction
    }

    /// Returns `true` for inbound legs.
    #[must_use]
    pub fn is_inbound(&self) -> bool {
        self.direction() == Direction::Inbound
    }

    /// Returns `true` for outbound legs.
    #[must_use]
    pub fn is_outbound(&self) -> bool {
        self.direction() == Direction::Outbound
    }

    /// Returns `true` once answered.
    #[must_use]
    pub fn answered(&self) -> bool {
        self.state.lock().answered
    }

    /// Returns `true` once hung up.
    #[must_use]
    pub fn hungup(&self) -> bool {
        self.state.lock().hungup
    }

    /// Returns the recorded hangup cause, if hung up.
    #[must_use]
    pub fn hangup_cause(&self) -> Option<String> {
        self.state.lock().hangup_cause.clone()
    }

    /// Returns a snapshot of the lifecycle timestamps.
    #[must_use]
    pub fn times(&self) -> SessionTimes {
        self.state.lock().times
    }

    /// Returns the owning call tag, once correlated.
    #[must_use]
    pub fn call_uuid(&self) -> Option<CallUuid> {
        self.state.lock().call_uuid
    }

    /// Returns the attributed app id.
    #[must_use]
    pub fn app_id(&self) -> Option<AppId> {
        self.state.lock().app_id.clone()
    }

    /// Returns the attributed client id.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.state.lock().client_id
    }

    /// Returns the originating background job, if any.
    #[must_use]
    pub fn job_uuid(&self) -> Option<JobUuid> {
        self.state.lock().job_uuid
    }

    /// Seconds elapsed from creation to the most recent event.
    #[must_use]
    pub fn uptime(&self) -> f64 {
        let state = self.state.lock();
        match (state.times.create, state.last_event_time) {
            (Some(create), Some(last)) => (last - create).max(0.0),
            _ => 0.0,
        }
    }

    // ========================================================================
    // Header & variable lookup
    // ========================================================================

    /// Returns the freshest value of a header across the rolling
    /// event history.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().history.get(key).map(str::to_string)
    }

    /// Returns the freshest value of a channel variable
    /// (`variable_<name>` first, then the bare name).
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<String> {
        self.state.lock().history.variable(name).map(str::to_string)
    }

    // ========================================================================
    // App scratch vars
    // ========================================================================

    /// Sets an application-scoped variable on the local model.
    pub fn set_var(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.lock().vars.insert(name.into(), value.into());
    }

    /// Returns an application-scoped variable.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<String> {
        self.state.lock().vars.get(name).cloned()
    }

    /// Marks this session as owned by its application: the originator
    /// will not schedule an automatic hangup for it.
    pub fn take_teardown_ownership(&self) {
        self.set_var("noautohangup", "1");
    }

    /// Returns `true` if an application owns this session's teardown.
    #[must_use]
    pub fn app_owns_teardown(&self) -> bool {
        self.var("noautohangup").is_some()
    }

    // ========================================================================
    // Event intake (listener side)
    // ========================================================================

    /// Folds one channel event into the session state.
    pub(crate) fn update(&self, event: &Event) {
        let mut state = self.state.lock();
        if let Some(ts) = event.timestamp() {
            state.last_event_time = Some(ts);
        }
        match event.name() {
            names::CHANNEL_ORIGINATE => {
                state.direction = Direction::Outbound;
                state.times.originate = event.timestamp();
                if state.times.req_originate.is_none() {
                    state.times.req_originate = Some(super::job::epoch_now());
                }
            }
            names::CHANNEL_ANSWER => {
                state.answered = true;
                state.times.answer = event.timestamp();
            }
            names::CHANNEL_HANGUP => {
                state.times.hangup = event.timestamp();
                state.hangup_cause = event.hangup_cause().map(str::to_string);
            }
            _ => {}
        }
        state.history.update(event.clone());
    }

    /// Marks the session finalized and cancels pending waiters.
    pub(crate) fn finalize(&self, event: &Event) {
        {
            let mut state = self.state.lock();
            state.hungup = true;
            if state.hangup_cause.is_none() {
                state.hangup_cause = event.hangup_cause().map(str::to_string);
            }
            if state.times.hangup.is_none() {
                state.times.hangup = event.timestamp();
            }
            state.history.update(event.clone());
        }
        // Dropped senders resolve pending `recv` calls with an error.
        self.waiters.lock().clear();
    }

    /// Records bookkeeping planted by the originate path.
    pub(crate) fn attribute(
        &self,
        call_uuid: Option<CallUuid>,
        client_id: Option<ClientId>,
        app_id: Option<AppId>,
        job_uuid: Option<JobUuid>,
    ) {
        let mut state = self.state.lock();
        if call_uuid.is_some() {
            state.call_uuid = call_uuid;
        }
        if client_id.is_some() {
            state.client_id = client_id;
        }
        if app_id.is_some() {
            state.app_id = app_id;
        }
        if job_uuid.is_some() {
            state.job_uuid = job_uuid;
        }
    }

    /// Delivers an event to any waiters registered for its name.
    pub(crate) fn notify_waiters(&self, event: &Event) {
        let mut waiters = self.waiters.lock();
        if let Some(senders) = waiters.get_mut(event.name()) {
            for tx in senders.drain(..) {
                // A closed receiver just means the waiter was dropped.
                let _ = tx.send(event.clone());
            }
            waiters.remove(event.name());
        }
    }

    // ========================================================================
    // Awaiting events
    // ========================================================================

    /// Resumes once the named event type is next received for this
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] when the session is finalized
    /// before the event arrives.
    pub async fn recv(&self, event_name: &str) -> Result<Event> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .entry(event_name.to_string())
            .or_default()
            .push(tx);
        Ok(rx.await?)
    }

    // ========================================================================
    // Call control verbs
    // ========================================================================

    /// Hangs this session up.
    ///
    /// Fire-and-forget; await `recv(names::CHANNEL_HANGUP)` to observe
    /// completion.
    pub fn hangup(&self, cause: &str) -> Result<()> {
        debug!(uuid = %self.uuid, cause, "Hanging up session");
        self.api_nowait(&format!("uuid_kill {} {cause}", self.uuid))
    }

    /// Schedules an engine-side hangup `secs` seconds from now.
    pub fn sched_hangup(&self, secs: u64, cause: &str) -> Result<()> {
        self.api_nowait(&format!("sched_hangup +{secs} {} {cause}", self.uuid))
    }

    /// Cancels scheduled tasks for this session.
    pub fn clear_scheduled(&self) -> Result<()> {
        self.api_nowait(&format!("sched_del {}", self.uuid))
    }

    /// Answers the session.
    pub fn answer(&self) -> Result<()> {
        self.api_nowait(&format!("uuid_answer {}", self.uuid))
    }

    /// Parks the session.
    pub fn park(&self) -> Result<()> {
        self.api_nowait(&format!("uuid_park {}", self.uuid))
    }

    /// Stops media playback and resumes the dialplan.
    pub fn break_media(&self) -> Result<()> {
        self.api_nowait(&format!("uuid_break {}", self.uuid))
    }

    /// Sends a DTMF sequence.
    pub fn send_dtmf(&self, sequence: &str) -> Result<()> {
        self.api_nowait(&format!("uuid_send_dtmf {} {sequence}", self.uuid))
    }

    /// Executes a dialplan application on this session via `sendmsg`.
    pub fn execute(&self, app: &str, arg: &str) -> Result<()> {
        self.conn.send_nowait(
            &command::sendmsg(self.uuid, app, arg, 1),
            ReplyKind::CommandReply,
        )
    }

    /// Plays an audio file on this session.
    pub fn playback(&self, path: &str) -> Result<()> {
        self.execute("playback", path)
    }

    /// Bridges this session to a destination URI, defaulting profile
    /// and destination to the values carried in the SIP request.
    pub fn bridge(&self, dest_url: Option<&str>, profile: Option<&str>) -> Result<()> {
        let profile = profile
            .map(str::to_string)
            .or_else(|| self.variable("sofia_profile_name"))
            .unwrap_or_else(|| "external".to_string());
        let dest = dest_url
            .map(str::to_string)
            .or_else(|| self.variable("sip_req_uri"))
            .ok_or_else(|| Error::config("bridge destination unknown"))?;
        self.execute("bridge", &format!("sofia/{profile}/{dest}"))
    }

    /// Reads a channel variable from the engine.
    ///
    /// Returns `None` when the engine reports `_undef_`.
    pub async fn getvar(&self, name: &str) -> Result<Option<String>> {
        let reply = self
            .conn
            .api(&format!("uuid_getvar {} {name}", self.uuid))
            .await?;
        let value = reply.check_api_body()?.trim().to_string();
        Ok((value != "_undef_").then_some(value))
    }

    /// Sets a channel variable on the engine.
    pub fn setvar(&self, name: &str, value: &str) -> Result<()> {
        self.api_nowait(&format!("uuid_setvar {} {name} {value}", self.uuid))
    }

    /// Sets several channel variables with a single command.
    pub fn setvars<'a>(
        &self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        let joined = pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        self.api_nowait(&format!("uuid_setvar_multi {} {joined}", self.uuid))
    }

    /// Unsets a channel variable on the engine.
    pub fn unsetvar(&self, name: &str) -> Result<()> {
        self.execute("unset", name)
    }

    /// Fire-and-forget `api` command helper.
    fn api_nowait(&self, cmd: &str) -> Result<()> {
        self.conn
            .send_nowait(&command::api(cmd), ReplyKind::ApiResponse)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("direction", &state.direction)
            .field("answered", &state.answered)
            .field("hungup", &state.hungup)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EslMessage, Headers};

    fn test_event(pairs: &[(&str, &str)]) -> Event {
        let mut body = String::new();
        for (k, v) in pairs {
            body.push_str(&format!("{k}: {v}\n"));
        }
        let clen = body.len().to_string();
        let headers: Headers = [
            ("Content-Type", "text/event-plain"),
            ("Content-Length", clen.as_str()),
        ]
        .into_iter()
        .collect();
        Event::from_message(&EslMessage::new(headers, Some(body.into_bytes()))).expect("event")
    }

    fn create_event(uuid: SessionUuid, direction: &str, ts_micros: u64) -> Event {
        test_event(&[
            ("Event-Name", "CHANNEL_CREATE"),
            ("Unique-ID", &uuid.to_string()),
            ("Call-Direction", direction),
            ("Event-Date-Timestamp", &ts_micros.to_string()),
        ])
    }

    // A session without a live connection; control verbs aren't used.
    fn offline_session(direction: &str) -> Session {
        let uuid = SessionUuid::generate();
        let event = create_event(uuid, direction, 1_700_000_000_000_000);
        Session::new(uuid, &event, Connection::test_stub())
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!(Direction::from_header("inbound"), Some(Direction::Inbound));
        assert_eq!(
            Direction::from_header("outbound"),
            Some(Direction::Outbound)
        );
        assert_eq!(Direction::from_header("sideways"), None);
    }

    #[test]
    fn test_lifecycle_state_updates() {
        let sess = offline_session("outbound");
        assert!(sess.is_outbound());
        assert!(!sess.answered());

        sess.update(&test_event(&[
            ("Event-Name", "CHANNEL_ANSWER"),
            ("Event-Date-Timestamp", "1700000002000000"),
        ]));
        assert!(sess.answered());
        assert_eq!(sess.times().answer, Some(1_700_000_002.0));

        sess.update(&test_event(&[
            ("Event-Name", "CHANNEL_HANGUP"),
            ("Hangup-Cause", "NORMAL_CLEARING"),
            ("Event-Date-Timestamp", "1700000010000000"),
        ]));
        assert_eq!(sess.hangup_cause().as_deref(), Some("NORMAL_CLEARING"));
        assert!(!sess.hungup(), "hungup only after finalize");

        sess.finalize(&test_event(&[("Event-Name", "CHANNEL_HANGUP_COMPLETE")]));
        assert!(sess.hungup());
    }

    #[test]
    fn test_uptime_from_event_stamps() {
        let sess = offline_session("inbound");
        sess.update(&test_event(&[
            ("Event-Name", "CHANNEL_ANSWER"),
            ("Event-Date-Timestamp", "1700000007500000"),
        ]));
        assert!((sess.uptime() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_teardown_ownership_flag() {
        let sess = offline_session("outbound");
        assert!(!sess.app_owns_teardown());
        sess.take_teardown_ownership();
        assert!(sess.app_owns_teardown());
    }

    #[tokio::test]
    async fn test_recv_resolved_by_notify() {
        let sess = std::sync::Arc::new(offline_session("inbound"));
        let waiter = std::sync::Arc::clone(&sess);
        let handle =
            tokio::spawn(async move { waiter.recv(names::CHANNEL_ANSWER).await });

        tokio::task::yield_now().await;
        sess.notify_waiters(&test_event(&[("Event-Name", "CHANNEL_ANSWER")]));

        let event = handle.await.expect("join").expect("event");
        assert_eq!(event.name(), "CHANNEL_ANSWER");
    }

    #[tokio::test]
    async fn test_recv_fails_on_finalize() {
        let sess = std::sync::Arc::new(offline_session("inbound"));
        let waiter = std::sync::Arc::clone(&sess);
        let handle =
            tokio::spawn(async move { waiter.recv(names::CHANNEL_ANSWER).await });

        tokio::task::yield_now().await;
        sess.finalize(&test_event(&[("Event-Name", "CHANNEL_HANGUP_COMPLETE")]));

        assert!(handle.await.expect("join").is_err());
    }
}
