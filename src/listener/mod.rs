//! Per-engine observer: session/call/job model and event dispatch.
//!
//! One [`Listener`] owns the authoritative model of live sessions and
//! calls on one engine. Its pump task (the `pump` submodule) consumes
//! the connection's event channel, applies the built-in handler chain
//! and fans out to application callbacks.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► connect() ──► start() ──► stop()
//!            handshake     spawns      closes connection,
//!            + subscribe   the pump    fails pending jobs
//! ```
//!
//! `start()` on a running listener is a no-op; `stop()` leaves the
//! listener reusable after a fresh `connect()`.
//!
//! # Sharing
//!
//! The session/call tables are written only by the pump task; every
//! other reader takes snapshots through the accessors here.

// ============================================================================
// Submodules
// ============================================================================

/// Event pump and built-in handler chain.
mod pump;

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::EventCallback;
use crate::error::{Error, Result};
use crate::identifiers::{AppId, CallUuid, JobUuid, SessionUuid};
use crate::model::{Call, Job, Session};
use crate::protocol::{command, names, EslMessage};
use crate::transport::{ConnectConfig, Connection, ReplyKind};

// ============================================================================
// Constants
// ============================================================================

/// Default event subscription set.
pub const DEFAULT_EVENTS: &[&str] = &[
    names::CHANNEL_CREATE,
    names::CHANNEL_ORIGINATE,
    names::CHANNEL_ANSWER,
    names::CHANNEL_HANGUP,
    names::CHANNEL_HANGUP_COMPLETE,
    names::CHANNEL_PARK,
    names::CHANNEL_BRIDGE,
    names::BACKGROUND_JOB,
    names::SERVER_DISCONNECTED,
];

/// Failed sessions retained per hangup cause.
const FAILED_RING_CAPACITY: usize = 1000;

// ============================================================================
// Counters
// ============================================================================

/// Aggregated per-engine statistics.
pub(crate) struct Counters {
    pub(crate) total_originated: AtomicU64,
    pub(crate) total_answered: AtomicU64,
    hangup_causes: Mutex<FxHashMap<String, u64>>,
    failed_jobs: Mutex<FxHashMap<String, u64>>,
    failed_sessions: Mutex<FxHashMap<String, VecDeque<SessionUuid>>>,
    sessions_per_app: Mutex<FxHashMap<AppId, i64>>,
}

impl Counters {
    fn new() -> Self {
        Self {
            total_originated: AtomicU64::new(0),
            total_answered: AtomicU64::new(0),
            hangup_causes: Mutex::new(FxHashMap::default()),
            failed_jobs: Mutex::new(FxHashMap::default()),
            failed_sessions: Mutex::new(FxHashMap::default()),
            sessions_per_app: Mutex::new(FxHashMap::default()),
        }
    }

    /// Counts a hangup cause; unsuccessful sessions land in the
    /// bounded failed ring for later inspection.
    pub(crate) fn record_hangup(&self, cause: &str, uuid: SessionUuid, answered: bool) {
        *self.hangup_causes.lock().entry(cause.to_string()).or_insert(0) += 1;
        if !answered || cause != "NORMAL_CLEARING" {
            let mut failed = self.failed_sessions.lock();
            let ring = failed.entry(cause.to_string()).or_default();
            if ring.len() >= FAILED_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(uuid);
        }
    }

    /// Counts a failed background job by cause.
    pub(crate) fn record_failed_job(&self, cause: &str) {
        *self.failed_jobs.lock().entry(cause.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn incr_app_sessions(&self, app_id: &AppId) {
        *self.sessions_per_app.lock().entry(app_id.clone()).or_insert(0) += 1;
    }

    pub(crate) fn decr_app_sessions(&self, app_id: &AppId) {
        *self.sessions_per_app.lock().entry(app_id.clone()).or_insert(0) -= 1;
    }

    fn reset(&self) {
        self.hangup_causes.lock().clear();
        self.failed_jobs.lock().clear();
        self.failed_sessions.lock().clear();
        self.total_answered.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// AppEntry
// ============================================================================

/// One loaded application's callback registrations.
pub(crate) struct AppEntry {
    pub(crate) app_id: AppId,
    pub(crate) callbacks: Vec<(String, EventCallback)>,
    /// Names this app holds subscription references for; unref'd on
    /// unload.
    subscription_names: Vec<String>,
}

// ============================================================================
// Inner
// ============================================================================

/// Shared listener state; the pump task holds an `Arc` of this.
pub(crate) struct Inner {
    pub(crate) config: ConnectConfig,
    pub(crate) connection: RwLock<Option<Connection>>,
    pub(crate) sessions: RwLock<FxHashMap<SessionUuid, Arc<Session>>>,
    pub(crate) calls: RwLock<FxHashMap<CallUuid, Arc<Call>>>,
    pub(crate) jobs: Mutex<FxHashMap<JobUuid, Arc<Job>>>,
    pub(crate) apps: RwLock<Vec<AppEntry>>,
    pub(crate) counters: Counters,
    pub(crate) running: AtomicBool,
    /// Refcounted extra subscriptions beyond [`DEFAULT_EVENTS`].
    extra_subscriptions: Mutex<FxHashMap<String, usize>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<EslMessage>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    /// Fails every pending job with `ConnectionLost` semantics.
    pub(crate) fn fail_pending_jobs(&self) {
        let jobs: Vec<_> = self.jobs.lock().drain().collect();
        let count = jobs.len();
        for (_, job) in jobs {
            job.fail_lost();
        }
        if count > 0 {
            warn!(count, "Failed pending jobs on connection loss");
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Per-engine model owner and dispatcher.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl Listener {
    /// Creates a disconnected listener for one engine.
    #[must_use]
    pub fn new(config: ConnectConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connection: RwLock::new(None),
                sessions: RwLock::new(FxHashMap::default()),
                calls: RwLock::new(FxHashMap::default()),
                jobs: Mutex::new(FxHashMap::default()),
                apps: RwLock::new(Vec::new()),
                counters: Counters::new(),
                running: AtomicBool::new(false),
                extra_subscriptions: Mutex::new(FxHashMap::default()),
                event_rx: Mutex::new(None),
                pump_task: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connects and authenticates, then subscribes the current event
    /// set.
    ///
    /// # Errors
    ///
    /// Propagates handshake and subscription failures.
    pub async fn connect(&self) -> Result<()> {
        if self.connected() {
            debug!(host = %self.inner.config.host, "Already connected");
            return Ok(());
        }

        let (conn, event_rx) = Connection::connect(&self.inner.config).await?;
        conn.subscribe(self.subscription_set().iter().map(String::as_str))
            .await?;

        *self.inner.connection.write() = Some(conn);
        *self.inner.event_rx.lock() = Some(event_rx);
        info!(host = %self.inner.config.host, "Listener connected");
        Ok(())
    }

    /// Spawns the event pump. Idempotent: a second `start()` on a
    /// running listener is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when not connected.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!(host = %self.inner.config.host, "Pump already running");
            return Ok(());
        }

        let Some(event_rx) = self.inner.event_rx.lock().take() else {
            self.inner.running.store(false, Ordering::Release);
            return Err(Error::config("connect the listener before starting it"));
        };

        let task = tokio::spawn(pump::run(Arc::clone(&self.inner), event_rx));
        *self.inner.pump_task.lock() = Some(task);
        Ok(())
    }

    /// Closes the connection, awaits pump exit, and fails pending
    /// jobs. The listener can be connected and started again.
    pub async fn stop(&self) {
        if let Some(conn) = self.inner.connection.write().take() {
            conn.shutdown();
        }
        let task = self.inner.pump_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.running.store(false, Ordering::Release);
        self.inner.fail_pending_jobs();
        info!(host = %self.inner.config.host, "Listener stopped");
    }

    /// Returns `true` while the pump task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Returns `true` while the connection is up.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.inner
            .connection
            .read()
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// Returns the engine host this listener observes.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    /// Returns a connection handle for issuing commands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] when disconnected.
    pub fn connection(&self) -> Result<Connection> {
        self.inner
            .connection
            .read()
            .clone()
            .filter(|c| !c.is_closed())
            .ok_or(Error::ConnectionClosed)
    }

    /// Toggles `divert_events` so engine-side scripts can hand events
    /// to this socket.
    pub async fn divert_events(&self, enabled: bool) -> Result<()> {
        self.connection()?
            .send_recv(&command::divert_events(enabled), ReplyKind::CommandReply)
            .await?;
        Ok(())
    }

    /// Restricts event delivery to those whose `header` matches
    /// `value` (the engine-side `filter` command).
    pub async fn filter_events(&self, header: &str, value: &str) -> Result<()> {
        self.connection()?
            .send_recv(&command::filter(header, value), ReplyKind::CommandReply)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Model access
    // ========================================================================

    /// Looks a live session up by UUID.
    #[must_use]
    pub fn session(&self, uuid: SessionUuid) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(&uuid).cloned()
    }

    /// Snapshot of all live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    /// Looks a live call up by its correlation tag.
    #[must_use]
    pub fn call(&self, uuid: CallUuid) -> Option<Arc<Call>> {
        self.inner.calls.read().get(&uuid).cloned()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count_sessions(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Number of live calls.
    #[must_use]
    pub fn count_calls(&self) -> usize {
        self.inner.calls.read().len()
    }

    /// Number of unresolved background jobs.
    #[must_use]
    pub fn count_jobs(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// Number of sessions that ended unsuccessfully.
    #[must_use]
    pub fn count_failed(&self) -> u64 {
        let causes = self.inner.counters.hangup_causes.lock();
        let total: u64 = causes.values().sum();
        total - causes.get("NORMAL_CLEARING").copied().unwrap_or(0)
    }

    /// Total sessions originated through this engine.
    #[must_use]
    pub fn total_originated_sessions(&self) -> u64 {
        self.inner.counters.total_originated.load(Ordering::Relaxed)
    }

    /// Total sessions answered on this engine.
    #[must_use]
    pub fn total_answered_sessions(&self) -> u64 {
        self.inner.counters.total_answered.load(Ordering::Relaxed)
    }

    /// Snapshot of hangup causes seen so far.
    #[must_use]
    pub fn hangup_causes(&self) -> FxHashMap<String, u64> {
        self.inner.counters.hangup_causes.lock().clone()
    }

    /// Snapshot of failed background jobs by cause.
    #[must_use]
    pub fn failed_jobs(&self) -> FxHashMap<String, u64> {
        self.inner.counters.failed_jobs.lock().clone()
    }

    /// Recent unsuccessful session UUIDs for one hangup cause
    /// (bounded to the last 1000 per cause).
    #[must_use]
    pub fn failed_sessions(&self, cause: &str) -> Vec<SessionUuid> {
        self.inner
            .counters
            .failed_sessions
            .lock()
            .get(cause)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Live session count per attributed app.
    #[must_use]
    pub fn sessions_per_app(&self) -> FxHashMap<AppId, i64> {
        self.inner.counters.sessions_per_app.lock().clone()
    }

    /// Clears statistics counters (not the live model).
    pub fn reset_stats(&self) {
        debug!(host = %self.inner.config.host, "Resetting stats");
        self.inner.counters.reset();
    }

    /// Registers an outstanding background job for resolution.
    pub fn register_job(&self, job: Arc<Job>) {
        self.inner.jobs.lock().insert(job.uuid(), job);
    }

    // ========================================================================
    // App registry
    // ========================================================================

    /// Registers an application's callbacks atomically.
    ///
    /// Returns the subscription names newly referenced by this app
    /// (callback event names plus explicit extras) so the caller can
    /// subscribe them on a live connection.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateApp`] when the id is taken
    /// - [`Error::Config`] when the app registers nothing
    pub fn register_app(
        &self,
        app_id: AppId,
        callbacks: Vec<(String, EventCallback)>,
        extra_subscriptions: Vec<String>,
    ) -> Result<Vec<String>> {
        if callbacks.is_empty() && extra_subscriptions.is_empty() {
            return Err(Error::config(format!(
                "app '{app_id}' registers no callbacks or subscriptions"
            )));
        }

        let wanted: Vec<String> = callbacks
            .iter()
            .map(|(name, _)| name.clone())
            .chain(extra_subscriptions)
            .collect();

        {
            let mut apps = self.inner.apps.write();
            if apps.iter().any(|entry| entry.app_id == app_id) {
                return Err(Error::duplicate_app(app_id));
            }
            apps.push(AppEntry {
                app_id: app_id.clone(),
                callbacks,
                subscription_names: wanted.clone(),
            });
        }

        Ok(self.ref_subscriptions(&wanted))
    }

    /// Removes an application's callbacks and drops its subscription
    /// references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AppNotFound`] for unknown ids.
    pub fn unregister_app(&self, app_id: &AppId) -> Result<()> {
        let entry = {
            let mut apps = self.inner.apps.write();
            let index = apps
                .iter()
                .position(|entry| &entry.app_id == app_id)
                .ok_or_else(|| Error::app_not_found(app_id.clone()))?;
            apps.remove(index)
        };

        self.unref_subscriptions(&entry.subscription_names);
        Ok(())
    }

    /// Returns the ids of all loaded apps, in registration order.
    #[must_use]
    pub fn app_ids(&self) -> Vec<AppId> {
        self.inner
            .apps
            .read()
            .iter()
            .map(|entry| entry.app_id.clone())
            .collect()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// The full event set this listener subscribes with.
    #[must_use]
    pub fn subscription_set(&self) -> Vec<String> {
        let mut set: Vec<String> = DEFAULT_EVENTS.iter().map(|s| s.to_string()).collect();
        for name in self.inner.extra_subscriptions.lock().keys() {
            if !set.contains(name) {
                set.push(name.clone());
            }
        }
        set
    }

    /// Bumps refcounts; returns names that were not referenced before
    /// and are outside the default set.
    fn ref_subscriptions(&self, names: &[String]) -> Vec<String> {
        let mut extras = self.inner.extra_subscriptions.lock();
        let mut added = Vec::new();
        for name in names {
            if DEFAULT_EVENTS.contains(&name.as_str()) {
                continue;
            }
            let count = extras.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                added.push(name.clone());
            }
        }
        added
    }

    /// Drops refcounts added by [`Self::ref_subscriptions`].
    fn unref_subscriptions(&self, names: &[String]) {
        let mut extras = self.inner.extra_subscriptions.lock();
        for name in names {
            if let Some(count) = extras.get_mut(name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    extras.remove(name);
                }
            }
        }
    }

    /// Subscribes additional event names on the live connection.
    pub async fn subscribe_events<'a>(
        &self,
        events: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        self.connection()?.subscribe(events).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("host", &self.inner.config.host)
            .field("running", &self.is_running())
            .field("sessions", &self.count_sessions())
            .field("calls", &self.count_calls())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::pump::handle_event;
    use super::*;
    use crate::protocol::{Event, Headers};
    use std::sync::atomic::AtomicUsize;

    fn listener_with_stub_connection() -> Listener {
        let listener = Listener::new(ConnectConfig::new("test", "ClueCon"));
        *listener.inner.connection.write() = Some(Connection::test_stub());
        listener
    }

    fn event(pairs: &[(&str, &str)]) -> Event {
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
        Event::from_message(&crate::protocol::EslMessage::new(
            headers,
            Some(body.into_bytes()),
        ))
        .expect("event")
    }

    fn channel_event(name: &str, uuid: SessionUuid, extra: &[(&str, &str)]) -> Event {
        let uuid_str = uuid.to_string();
        let mut pairs = vec![
            ("Event-Name", name),
            ("Unique-ID", uuid_str.as_str()),
            ("Call-Direction", "outbound"),
            ("Event-Date-Timestamp", "1700000000000000"),
        ];
        pairs.extend_from_slice(extra);
        event(&pairs)
    }

    #[test]
    fn test_session_lifecycle_empties_table() {
        let listener = listener_with_stub_connection();
        let uuid = SessionUuid::generate();

        handle_event(
            &listener.inner,
            &channel_event(names::CHANNEL_CREATE, uuid, &[]),
        );
        assert_eq!(listener.count_sessions(), 1);
        assert_eq!(listener.count_calls(), 1);

        handle_event(
            &listener.inner,
            &channel_event(
                names::CHANNEL_HANGUP,
                uuid,
                &[("Hangup-Cause", "NORMAL_CLEARING")],
            ),
        );
        handle_event(
            &listener.inner,
            &channel_event(
                names::CHANNEL_HANGUP_COMPLETE,
                uuid,
                &[("Hangup-Cause", "NORMAL_CLEARING")],
            ),
        );

        assert_eq!(listener.count_sessions(), 0);
        assert_eq!(listener.count_calls(), 0);
        assert_eq!(listener.hangup_causes().get("NORMAL_CLEARING"), Some(&1));
    }

    #[test]
    fn test_create_originate_either_order() {
        let listener = listener_with_stub_connection();
        let uuid = SessionUuid::generate();

        handle_event(
            &listener.inner,
            &channel_event(names::CHANNEL_ORIGINATE, uuid, &[]),
        );
        handle_event(
            &listener.inner,
            &channel_event(names::CHANNEL_CREATE, uuid, &[]),
        );

        assert_eq!(listener.count_sessions(), 1);
        assert_eq!(listener.total_originated_sessions(), 1);
    }

    #[test]
    fn test_correlation_by_planted_tag() {
        let listener = listener_with_stub_connection();
        let caller = SessionUuid::generate();
        let callee = SessionUuid::generate();
        let tag = caller.to_string();

        handle_event(
            &listener.inner,
            &channel_event(
                names::CHANNEL_CREATE,
                caller,
                &[("variable_sip_h_X-originating_session_uuid", tag.as_str())],
            ),
        );
        handle_event(
            &listener.inner,
            &channel_event(
                names::CHANNEL_CREATE,
                callee,
                &[("variable_sip_h_X-originating_session_uuid", tag.as_str())],
            ),
        );

        assert_eq!(listener.count_sessions(), 2);
        assert_eq!(listener.count_calls(), 1);

        let call_uuid = listener.session(caller).unwrap().call_uuid().unwrap();
        let call = listener.call(call_uuid).unwrap();
        assert_eq!(call.session_count(), 2);
        assert_eq!(call.peer_of(caller).unwrap().uuid(), callee);
    }

    #[test]
    fn test_untracked_hangup_is_dropped() {
        let listener = listener_with_stub_connection();
        handle_event(
            &listener.inner,
            &channel_event(names::CHANNEL_HANGUP, SessionUuid::generate(), &[]),
        );
        assert_eq!(listener.count_sessions(), 0);
    }

    #[test]
    fn test_background_job_resolution() {
        let listener = listener_with_stub_connection();
        let job = Arc::new(Job::new(JobUuid::generate(), None));
        listener.register_job(Arc::clone(&job));

        let uuid_str = job.uuid().to_string();
        let result = SessionUuid::generate();
        let body = format!("+OK {result}\n");
        let nested = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: {uuid_str}\nContent-Length: {}\n\n{body}",
            body.len()
        );
        let clen = nested.len().to_string();
        let headers: Headers = [
            ("Content-Type", "text/event-plain"),
            ("Content-Length", clen.as_str()),
        ]
        .into_iter()
        .collect();
        let event = Event::from_message(&crate::protocol::EslMessage::new(
            headers,
            Some(nested.into_bytes()),
        ))
        .unwrap();

        handle_event(&listener.inner, &event);
        assert_eq!(job.try_result().unwrap().unwrap(), result.to_string());
    }

    #[test]
    fn test_failed_job_counted_and_popped() {
        let listener = listener_with_stub_connection();
        let job = Arc::new(Job::new(JobUuid::generate(), None));
        listener.register_job(Arc::clone(&job));

        let uuid_str = job.uuid().to_string();
        let body = "-ERR NORMAL_TEMPORARY_FAILURE\n";
        let nested = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: {uuid_str}\nContent-Length: {}\n\n{body}",
            body.len()
        );
        let clen = nested.len().to_string();
        let headers: Headers = [
            ("Content-Type", "text/event-plain"),
            ("Content-Length", clen.as_str()),
        ]
        .into_iter()
        .collect();
        let event = Event::from_message(&crate::protocol::EslMessage::new(
            headers,
            Some(nested.into_bytes()),
        ))
        .unwrap();

        handle_event(&listener.inner, &event);
        assert!(matches!(
            job.try_result().unwrap(),
            Err(Error::JobFailed { .. })
        ));
        assert_eq!(listener.count_jobs(), 0);
        assert_eq!(
            listener.failed_jobs().get("NORMAL_TEMPORARY_FAILURE"),
            Some(&1)
        );
    }

    #[test]
    fn test_register_app_atomic_duplicate() {
        let listener = listener_with_stub_connection();
        let cb: EventCallback = Arc::new(|_| {});
        listener
            .register_app(
                AppId::new("a"),
                vec![(names::CHANNEL_PARK.to_string(), Arc::clone(&cb))],
                vec![],
            )
            .unwrap();

        let err = listener
            .register_app(
                AppId::new("a"),
                vec![(names::CHANNEL_PARK.to_string(), cb)],
                vec!["mod_x::y".to_string()],
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateApp { .. }));

        // The failed load left no trace: only one app, no extras.
        assert_eq!(listener.app_ids().len(), 1);
        assert_eq!(
            listener.subscription_set().len(),
            DEFAULT_EVENTS.len(),
            "duplicate load must not leak subscriptions"
        );
    }

    #[test]
    fn test_subscription_refcounting() {
        let listener = listener_with_stub_connection();
        let cb: EventCallback = Arc::new(|_| {});

        let added = listener
            .register_app(
                AppId::new("bert"),
                vec![("mod_bert::timeout".to_string(), Arc::clone(&cb))],
                vec![],
            )
            .unwrap();
        assert_eq!(added, vec!["mod_bert::timeout".to_string()]);

        let added = listener
            .register_app(
                AppId::new("bert2"),
                vec![("mod_bert::timeout".to_string(), cb)],
                vec![],
            )
            .unwrap();
        assert!(added.is_empty(), "second reference adds nothing");

        listener.unregister_app(&AppId::new("bert")).unwrap();
        assert!(listener
            .subscription_set()
            .contains(&"mod_bert::timeout".to_string()));

        listener.unregister_app(&AppId::new("bert2")).unwrap();
        assert!(!listener
            .subscription_set()
            .contains(&"mod_bert::timeout".to_string()));
    }

    #[test]
    fn test_custom_event_dispatches_by_subclass() {
        let listener = listener_with_stub_connection();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        listener
            .register_app(
                AppId::new("bert"),
                vec![(
                    "mod_bert::timeout".to_string(),
                    Arc::new(move |_ctx: &crate::app::CallbackCtx<'_>| {
                        hits_cb.fetch_add(1, Ordering::SeqCst);
                    }) as EventCallback,
                )],
                vec![],
            )
            .unwrap();

        handle_event(
            &listener.inner,
            &event(&[
                ("Event-Name", "CUSTOM"),
                ("Event-Subclass", "mod_bert::timeout"),
            ]),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_panic_is_isolated() {
        let listener = listener_with_stub_connection();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        listener
            .register_app(
                AppId::new("panicky"),
                vec![
                    (
                        names::CHANNEL_CREATE.to_string(),
                        Arc::new(|_ctx: &crate::app::CallbackCtx<'_>| panic!("boom"))
                            as EventCallback,
                    ),
                    (
                        names::CHANNEL_CREATE.to_string(),
                        Arc::new(move |_ctx: &crate::app::CallbackCtx<'_>| {
                            hits_cb.fetch_add(1, Ordering::SeqCst);
                        }) as EventCallback,
                    ),
                ],
                vec![],
            )
            .unwrap();

        handle_event(
            &listener.inner,
            &channel_event(names::CHANNEL_CREATE, SessionUuid::generate(), &[]),
        );
        // The panic did not stop the chain or the pump.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(listener.count_sessions(), 1);
    }
}
