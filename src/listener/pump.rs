//! Event pump and built-in handler chain.
//!
//! One pump task per engine reads framed messages off the
//! connection's event channel, runs the built-in handler for the
//! event name (updating the session/call/job model), then fans out to
//! application callbacks.
//!
//! A built-in handler returns `(consumed, payload)`. When `consumed`
//! is false the event is dropped from further processing; waiters and
//! application callbacks never see it. This is how events for
//! untracked sessions are rejected.
//!
//! Handler and callback failures are isolated: they are logged with
//! the offending event's context and the pump keeps running.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::app::CallbackCtx;
use crate::identifiers::{AppId, CallUuid, SessionUuid};
use crate::model::{Call, Job, Session};
use crate::protocol::{command, names, ContentType, EslMessage, Event};

use super::Inner;

// ============================================================================
// Pump entry point
// ============================================================================

/// Runs the pump until the connection closes or is shut down.
pub(super) async fn run(inner: Arc<Inner>, mut event_rx: mpsc::UnboundedReceiver<EslMessage>) {
    debug!(host = %inner.config.host, "Event pump started");

    while let Some(msg) = event_rx.recv().await {
        let event = match msg.content_type() {
            Ok(ContentType::DisconnectNotice) => {
                warn!(host = %inner.config.host, "Engine sent disconnect notice");
                handle_event(&inner, &Event::server_disconnected());
                break;
            }
            Ok(_) => match Event::from_message(&msg) {
                Ok(event) => event,
                Err(e) => {
                    error!(host = %inner.config.host, error = %e, "Undecodable event");
                    continue;
                }
            },
            Err(e) => {
                error!(host = %inner.config.host, error = %e, "Unclassifiable message");
                continue;
            }
        };
        handle_event(&inner, &event);
    }

    inner.running.store(false, Ordering::Release);
    inner.fail_pending_jobs();
    debug!(host = %inner.config.host, "Event pump terminated");
}

// ============================================================================
// Classification
// ============================================================================

/// Outcome of a built-in handler.
struct Handled {
    consumed: bool,
    session: Option<Arc<Session>>,
    call: Option<Arc<Call>>,
    job: Option<Arc<Job>>,
}

impl Handled {
    fn consumed(session: Option<Arc<Session>>) -> Self {
        Self {
            consumed: true,
            session,
            call: None,
            job: None,
        }
    }

    fn dropped() -> Self {
        Self {
            consumed: false,
            session: None,
            call: None,
            job: None,
        }
    }
}

/// Runs one event through the handler chain and callback fan-out.
pub(super) fn handle_event(inner: &Arc<Inner>, event: &Event) {
    // CUSTOM events dispatch under their subclass name.
    let dispatch_name = match event.name() {
        names::CUSTOM => event.subclass().unwrap_or(names::CUSTOM).to_string(),
        name => name.to_string(),
    };
    trace!(host = %inner.config.host, event = %dispatch_name, "Event received");

    let mut handled = match catch_unwind(AssertUnwindSafe(|| builtin_handler(inner, event))) {
        Ok(handled) => handled,
        Err(_) => {
            error!(
                host = %inner.config.host,
                event = %dispatch_name,
                uuid = ?event.header("Unique-ID"),
                "Built-in handler panicked"
            );
            return;
        }
    };

    if !handled.consumed {
        trace!(event = %dispatch_name, "Event dropped by handler chain");
        return;
    }

    // Resolve the owning call unless the handler already did.
    if handled.call.is_none() {
        if let Some(call_uuid) = handled.session.as_ref().and_then(|s| s.call_uuid()) {
            handled.call = inner.calls.read().get(&call_uuid).cloned();
        }
    }

    // Wake any `Session::recv` futures before running callbacks so
    // awaiting coroutines observe the event no later than apps do.
    if let Some(session) = &handled.session {
        session.notify_waiters(event);
    }

    dispatch_callbacks(inner, &dispatch_name, event, &handled);
}

/// Consults the built-in handler table by event name.
fn builtin_handler(inner: &Arc<Inner>, event: &Event) -> Handled {
    match event.name() {
        names::CHANNEL_CREATE | names::CHANNEL_ORIGINATE => handle_initial(inner, event),
        names::CHANNEL_ANSWER => handle_answer(inner, event),
        names::CHANNEL_HANGUP_COMPLETE => handle_destroy(inner, event),
        names::BACKGROUND_JOB => handle_background_job(inner, event),
        names::SERVER_DISCONNECTED => {
            warn!(host = %inner.config.host, "Server disconnected");
            Handled::consumed(None)
        }
        // CHANNEL_HANGUP, CHANNEL_PARK, CHANNEL_BRIDGE, CUSTOM and
        // anything an app subscribed to: update the tracked session.
        _ => lookup_session(inner, event),
    }
}

// ============================================================================
// Built-in handlers
// ============================================================================

/// Baseline handler: look the session up and fold the event in.
/// Events for untracked channels are dropped.
fn lookup_session(inner: &Arc<Inner>, event: &Event) -> Handled {
    match event.session_uuid() {
        Some(uuid) => match inner.sessions.read().get(&uuid).cloned() {
            Some(session) => {
                session.update(event);
                Handled::consumed(Some(session))
            }
            None => Handled::dropped(),
        },
        // Events without a channel (CUSTOM module notifications).
        None => Handled::consumed(None),
    }
}

/// Allocates the session on `CHANNEL_CREATE`/`CHANNEL_ORIGINATE`.
///
/// The engine is indeterminate about which of the two arrives first,
/// so both allocate and the second only updates.
fn handle_initial(inner: &Arc<Inner>, event: &Event) -> Handled {
    let Some(uuid) = event.session_uuid() else {
        warn!("Channel event without Unique-ID");
        return Handled::dropped();
    };

    let existing = inner.sessions.read().get(&uuid).cloned();
    let session = match existing {
        Some(session) => {
            session.update(event);
            session
        }
        None => {
            let Some(conn) = inner.connection.read().clone() else {
                return Handled::dropped();
            };
            let session = Arc::new(Session::new(uuid, event, conn));

            // Attribute to owning client/app from the planted vars.
            let client_id = event
                .variable("sip_h_X-switchio_client")
                .and_then(crate::identifiers::ClientId::parse);
            let app_id = event.variable(command::APP_ID_VAR).map(AppId::from);
            session.attribute(None, client_id, app_id.clone(), None);

            correlate(inner, &session, event);
            inner.sessions.write().insert(uuid, Arc::clone(&session));
            if let Some(app_id) = app_id {
                inner.counters.incr_app_sessions(&app_id);
            }
            debug!(
                uuid = %uuid,
                direction = ?session.direction(),
                "Session created"
            );
            session
        }
    };

    if event.name() == names::CHANNEL_ORIGINATE {
        inner
            .counters
            .total_originated
            .fetch_add(1, Ordering::Relaxed);
    }

    Handled::consumed(Some(session))
}

/// Associates a session into a call via the correlation tag.
///
/// The tag is the `sip_h_X-originating_session_uuid` variable planted
/// by the originate command; a leg arriving without it becomes a
/// single-session call keyed by its own UUID.
fn correlate(inner: &Arc<Inner>, session: &Arc<Session>, event: &Event) {
    let call_uuid = event
        .variable("sip_h_X-originating_session_uuid")
        .and_then(CallUuid::parse)
        .unwrap_or_else(|| CallUuid::from(session.uuid()));

    let mut calls = inner.calls.write();
    match calls.get(&call_uuid) {
        Some(call) => {
            debug!(uuid = %session.uuid(), call = %call_uuid, "Session joined call");
            call.append(Arc::clone(session));
        }
        None => {
            calls.insert(call_uuid, Arc::new(Call::new(call_uuid, Arc::clone(session))));
        }
    }
    session.attribute(Some(call_uuid), None, None, None);
}

/// Records the answer and back-fills call correlation for legs whose
/// create event lacked the tag.
fn handle_answer(inner: &Arc<Inner>, event: &Event) -> Handled {
    let Some(uuid) = event.session_uuid() else {
        return Handled::dropped();
    };
    let Some(session) = inner.sessions.read().get(&uuid).cloned() else {
        debug!(uuid = %uuid, "Skipping answer of untracked session");
        return Handled::dropped();
    };

    session.update(event);
    inner
        .counters
        .total_answered
        .fetch_add(1, Ordering::Relaxed);

    if session.call_uuid().is_none() {
        correlate(inner, &session, event);
    }

    Handled::consumed(Some(session))
}

/// Finalizes the session and tears the call down when its last leg
/// hangs up.
fn handle_destroy(inner: &Arc<Inner>, event: &Event) -> Handled {
    let Some(uuid) = event.session_uuid() else {
        return Handled::dropped();
    };
    let Some(session) = inner.sessions.write().remove(&uuid) else {
        return Handled::dropped();
    };

    session.finalize(event);
    let cause = session
        .hangup_cause()
        .unwrap_or_else(|| "UNKNOWN".to_string());
    inner.counters.record_hangup(&cause, uuid, session.answered());
    if let Some(app_id) = session.app_id() {
        inner.counters.decr_app_sessions(&app_id);
    }

    // Tear the call down with its last session, keeping the handle
    // alive for the callback fan-out.
    let mut owning_call = None;
    if let Some(call_uuid) = session.call_uuid() {
        let mut calls = inner.calls.write();
        if let Some(call) = calls.get(&call_uuid).cloned() {
            if call.remove(uuid) {
                calls.remove(&call_uuid);
                debug!(call = %call_uuid, "All sessions hung up, call destroyed");
            }
            owning_call = Some(call);
        }
    }

    // Drop the job reference with the session.
    let job = session
        .job_uuid()
        .and_then(|job_uuid| inner.jobs.lock().remove(&job_uuid));

    debug!(uuid = %uuid, cause = %cause, "Session destroyed");
    Handled {
        consumed: true,
        session: Some(session),
        call: owning_call,
        job,
    }
}

/// Resolves the background job named by `Job-UUID`.
///
/// The body's first line is `+OK <uuid>` on originate success or
/// `-ERR <cause>` on failure. Failed jobs are popped immediately;
/// successful ones stay registered until their session is destroyed.
fn handle_background_job(inner: &Arc<Inner>, event: &Event) -> Handled {
    let Some(job_uuid) = event.job_uuid() else {
        warn!("BACKGROUND_JOB without Job-UUID");
        return Handled::dropped();
    };

    let body = event.body().unwrap_or_default().trim();
    let job = inner.jobs.lock().get(&job_uuid).cloned();
    let Some(job) = job else {
        debug!(job = %job_uuid, "Job reply for untracked job");
        return Handled::consumed(None);
    };

    if let Some(cause) = body.strip_prefix("-ERR") {
        let cause = cause.trim().to_string();
        error!(job = %job_uuid, session = ?job.session_uuid(), cause = %cause, "Job failed");
        job.fail(cause.clone());
        inner.jobs.lock().remove(&job_uuid);
        inner.counters.record_failed_job(&cause);
        return Handled {
            consumed: true,
            session: None,
            call: None,
            job: Some(job),
        };
    }

    let resp = body.strip_prefix("+OK").unwrap_or(body).trim().to_string();

    // For originates the payload is the session UUID; prefer the
    // pre-bound uuid, fall back to the payload.
    let sess_uuid = job.session_uuid().or_else(|| SessionUuid::parse(&resp));
    let session = sess_uuid.and_then(|u| inner.sessions.read().get(&u).cloned());
    if let Some(session) = &session {
        session.attribute(None, None, None, Some(job_uuid));
    } else if let Some(uuid) = sess_uuid {
        debug!(job = %job_uuid, session = %uuid, "No session tracked for job yet");
    }

    job.resolve(resp);
    Handled {
        consumed: true,
        session,
        call: None,
        job: Some(job),
    }
}

// ============================================================================
// Callback fan-out
// ============================================================================

/// Invokes application callbacks for the event, in app-registration
/// order.
///
/// When the event (or its session) is attributed to an app id, only
/// that app's callbacks run; unattributed events fan out to every
/// app.
fn dispatch_callbacks(inner: &Arc<Inner>, dispatch_name: &str, event: &Event, handled: &Handled) {
    let target: Option<AppId> = handled
        .session
        .as_ref()
        .and_then(|s| s.app_id())
        .or_else(|| event.variable(command::APP_ID_VAR).map(AppId::from));

    let ctx = CallbackCtx {
        event,
        session: handled.session.as_ref(),
        call: handled.call.as_ref(),
        job: handled.job.as_ref(),
    };

    let apps = inner.apps.read();
    for entry in apps.iter() {
        if let Some(target) = &target {
            if &entry.app_id != target {
                continue;
            }
        }
        for (name, callback) in &entry.callbacks {
            if name != dispatch_name {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(&ctx))).is_err() {
                error!(
                    app = %entry.app_id,
                    event = %dispatch_name,
                    uuid = ?event.header("Unique-ID"),
                    "Application callback panicked"
                );
            }
        }
    }
}
