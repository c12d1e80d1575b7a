//! Call detail record capture and derived latency metrics.
//!
//! The [`CdrRecorder`] is an application that appends one row per
//! originated call when its last leg reaches
//! `CHANNEL_HANGUP_COMPLETE`. Rows carry the raw timestamps of both
//! legs plus cluster load samples; latency metrics are derived on
//! read, not stored.

// ============================================================================
// Imports
// ============================================================================

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::app::{Application, CallbackCtx, Callbacks};
use crate::identifiers::CallUuid;
use crate::model::Session;
use crate::pool::Pool;
use crate::protocol::names;

// ============================================================================
// CdrRow
// ============================================================================

/// One appended record: the raw per-leg timestamps of a completed
/// call plus the load sampled when it was created.
///
/// All timestamps are seconds since the epoch; a missing leg (failed
/// call) leaves its fields `None`.
#[derive(Debug, Clone, Serialize)]
pub struct CdrRow {
    /// App the caller leg was attributed to.
    pub app_id: Option<String>,
    /// Final hangup cause of the caller leg.
    pub hangup_cause: String,
    /// Caller `CHANNEL_CREATE` engine time.
    pub caller_create: Option<f64>,
    /// Caller `CHANNEL_ANSWER` engine time.
    pub caller_answer: Option<f64>,
    /// Local time the originate was requested.
    pub caller_req_originate: Option<f64>,
    /// Caller `CHANNEL_ORIGINATE` engine time.
    pub caller_originate: Option<f64>,
    /// Caller `CHANNEL_HANGUP` engine time.
    pub caller_hangup: Option<f64>,
    /// Local time the background job was launched.
    pub job_launch: Option<f64>,
    /// Callee `CHANNEL_CREATE` engine time.
    pub callee_create: Option<f64>,
    /// Callee `CHANNEL_ANSWER` engine time.
    pub callee_answer: Option<f64>,
    /// Callee `CHANNEL_HANGUP` engine time.
    pub callee_hangup: Option<f64>,
    /// Cluster failed-call count at append time.
    pub failed_calls: u64,
    /// Cluster session count sampled at call creation.
    pub active_sessions: u64,
    /// Cluster call count (erlang estimate) sampled at creation.
    pub erlangs: u64,
}

impl CdrRow {
    /// Derives the per-call latency metrics.
    #[must_use]
    pub fn metrics(&self) -> CallMetrics {
        fn diff(a: Option<f64>, b: Option<f64>) -> Option<f64> {
            Some(a? - b?)
        }
        CallMetrics {
            invite_latency: diff(self.callee_create, self.caller_create),
            answer_latency: diff(self.caller_answer, self.callee_answer),
            call_setup_latency: diff(self.caller_answer, self.caller_create),
            originate_latency: diff(self.caller_req_originate, self.job_launch),
            call_duration: diff(self.caller_hangup, self.caller_create),
        }
    }
}

/// Latencies derived from one [`CdrRow`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallMetrics {
    /// Callee INVITE arrival relative to caller creation.
    pub invite_latency: Option<f64>,
    /// Caller answer relative to callee answer.
    pub answer_latency: Option<f64>,
    /// Caller answer relative to caller creation.
    pub call_setup_latency: Option<f64>,
    /// Originate turnaround relative to job launch.
    pub originate_latency: Option<f64>,
    /// Total caller leg duration.
    pub call_duration: Option<f64>,
}

/// Effective call rate over a set of rows: completed calls divided by
/// the caller-creation time span. `None` below two rows.
#[must_use]
pub fn effective_call_rate(rows: &[CdrRow]) -> Option<f64> {
    let mut creates: Vec<f64> = rows.iter().filter_map(|r| r.caller_create).collect();
    if creates.len() < 2 {
        return None;
    }
    creates.sort_by(|a, b| a.partial_cmp(b).expect("finite timestamps"));
    let span = creates.last()? - creates.first()?;
    (span > 0.0).then(|| (creates.len() - 1) as f64 / span)
}

// ============================================================================
// CdrRecorder
// ============================================================================

/// Legs collected for a call whose teardown is in progress.
struct PendingCall {
    legs: Vec<Arc<Session>>,
    job_launch: Option<f64>,
}

struct CdrInner {
    pool: Weak<Pool>,
    rows: Mutex<Vec<CdrRow>>,
    pending: Mutex<FxHashMap<CallUuid, PendingCall>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    call_counter: AtomicU64,
}

/// Application collecting one [`CdrRow`] per completed call.
///
/// Bundled automatically with every app the originator loads; usable
/// standalone on any client as well.
#[derive(Clone)]
pub struct CdrRecorder {
    inner: Arc<CdrInner>,
}

impl CdrRecorder {
    /// Creates a recorder sampling cluster load from `pool`.
    #[must_use]
    pub fn new(pool: &Arc<Pool>) -> Self {
        Self {
            inner: Arc::new(CdrInner {
                pool: Arc::downgrade(pool),
                rows: Mutex::new(Vec::new()),
                pending: Mutex::new(FxHashMap::default()),
                writer: Mutex::new(None),
                call_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Mirrors every appended row to an append-only JSON-lines
    /// writer.
    pub fn set_writer(&self, writer: Box<dyn Write + Send>) {
        *self.inner.writer.lock() = Some(writer);
    }

    /// Snapshot of the collected rows.
    #[must_use]
    pub fn rows(&self) -> Vec<CdrRow> {
        self.inner.rows.lock().clone()
    }

    /// Number of collected rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.rows.lock().len()
    }

    /// Returns `true` before the first call completes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.rows.lock().is_empty()
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    /// Samples cluster load into call vars at creation time.
    fn on_create(inner: &Arc<CdrInner>, ctx: &CallbackCtx<'_>) {
        let Some(call) = ctx.call else { return };
        if call.var("call_index").is_none() {
            let index = inner.call_counter.fetch_add(1, Ordering::Relaxed);
            call.set_var("call_index", index.to_string());
        }
        if let Some(pool) = inner.pool.upgrade() {
            call.set_var("session_count", pool.count_sessions().to_string());
            call.set_var("erlangs", pool.count_calls().to_string());
        }
    }

    /// Collects completed legs; appends the row with the last one.
    fn on_hangup_complete(inner: &Arc<CdrInner>, ctx: &CallbackCtx<'_>) {
        let (Some(session), Some(call)) = (ctx.session, ctx.call) else {
            return;
        };

        let mut pending = inner.pending.lock();
        let entry = pending.entry(call.uuid()).or_insert_with(|| PendingCall {
            legs: Vec::new(),
            job_launch: None,
        });
        entry.legs.push(Arc::clone(session));
        if let Some(job) = ctx.job {
            entry.job_launch = Some(job.launched_at());
        }

        if call.session_count() > 0 {
            return; // peer leg still up
        }
        let Some(done) = pending.remove(&call.uuid()) else {
            return;
        };
        drop(pending);

        // Caller is the originated leg; a failed call has only it.
        let caller = done
            .legs
            .iter()
            .find(|leg| leg.is_outbound())
            .or_else(|| done.legs.first())
            .cloned();
        let Some(caller) = caller else { return };
        let callee = done
            .legs
            .iter()
            .find(|leg| leg.uuid() != caller.uuid())
            .cloned();

        let pool = inner.pool.upgrade();
        let caller_times = caller.times();
        let callee_times = callee.as_ref().map(|c| c.times());
        let row = CdrRow {
            app_id: caller.app_id().map(|id| id.to_string()),
            hangup_cause: caller
                .hangup_cause()
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            caller_create: caller_times.create,
            caller_answer: caller_times.answer,
            caller_req_originate: caller_times.req_originate,
            caller_originate: caller_times.originate,
            caller_hangup: caller_times.hangup,
            job_launch: done.job_launch,
            callee_create: callee_times.and_then(|t| t.create),
            callee_answer: callee_times.and_then(|t| t.answer),
            callee_hangup: callee_times.and_then(|t| t.hangup),
            failed_calls: pool.as_ref().map_or(0, |p| p.count_failed()),
            active_sessions: call
                .var("session_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            erlangs: call
                .var("erlangs")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        };

        if let Some(w) = inner.writer.lock().as_mut() {
            if let Err(e) = serde_json::to_writer(&mut *w, &row)
                .map_err(std::io::Error::from)
                .and_then(|()| w.write_all(b"\n"))
            {
                warn!(error = %e, "CDR write failed");
            }
        }
        debug!(call = %call.uuid(), cause = %row.hangup_cause, "CDR row appended");
        inner.rows.lock().push(row);
    }
}

impl Application for CdrRecorder {
    fn name(&self) -> &str {
        "cdr"
    }

    fn callbacks(&self) -> Callbacks {
        let create_inner = Arc::clone(&self.inner);
        let hangup_inner = Arc::clone(&self.inner);
        Callbacks::new()
            .on(names::CHANNEL_CREATE, move |ctx| {
                CdrRecorder::on_create(&create_inner, ctx);
            })
            .on(names::CHANNEL_HANGUP_COMPLETE, move |ctx| {
                CdrRecorder::on_hangup_complete(&hangup_inner, ctx);
            })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn row(create: f64, answer: f64) -> CdrRow {
        CdrRow {
            app_id: Some("bert".into()),
            hangup_cause: "NORMAL_CLEARING".into(),
            caller_create: Some(create),
            caller_answer: Some(answer),
            caller_req_originate: Some(create - 0.05),
            caller_originate: Some(create),
            caller_hangup: Some(create + 10.0),
            job_launch: Some(create - 0.1),
            callee_create: Some(create + 0.02),
            callee_answer: Some(answer - 0.01),
            callee_hangup: Some(create + 10.0),
            failed_calls: 0,
            active_sessions: 4,
            erlangs: 2,
        }
    }

    #[test]
    fn test_derived_metrics() {
        let metrics = row(100.0, 100.5).metrics();
        assert!((metrics.invite_latency.unwrap() - 0.02).abs() < 1e-9);
        assert!((metrics.answer_latency.unwrap() - 0.01).abs() < 1e-9);
        assert!((metrics.call_setup_latency.unwrap() - 0.5).abs() < 1e-9);
        assert!((metrics.originate_latency.unwrap() - 0.05).abs() < 1e-9);
        assert!((metrics.call_duration.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_tolerate_missing_leg() {
        let mut r = row(100.0, 100.5);
        r.callee_create = None;
        r.callee_answer = None;
        let metrics = r.metrics();
        assert!(metrics.invite_latency.is_none());
        assert!(metrics.answer_latency.is_none());
        assert!(metrics.call_setup_latency.is_some());
    }

    #[test]
    fn test_effective_call_rate() {
        // 5 calls created one second apart: 1 cps.
        let rows: Vec<CdrRow> = (0..5).map(|i| row(100.0 + i as f64, 101.0)).collect();
        let rate = effective_call_rate(&rows).unwrap();
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_effective_call_rate_needs_two_rows() {
        assert!(effective_call_rate(&[]).is_none());
        assert!(effective_call_rate(&[row(1.0, 2.0)]).is_none());
    }

    #[test]
    fn test_row_serializes_to_json() {
        let json = serde_json::to_string(&row(1.0, 2.0)).unwrap();
        assert!(json.contains("\"hangup_cause\":\"NORMAL_CLEARING\""));
        assert!(json.contains("\"erlangs\":2"));
    }
}
