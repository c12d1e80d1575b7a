//! Closed-loop outbound call generator.
//!
//! The [`Originator`] drives a [`Pool`] at a configured offer rate
//! and concurrency. Each pacing period its burst task fires
//!
//! ```text
//! min(rate · period, limit − active_calls, max_offered − total_offered)
//! ```
//!
//! originates round-robin across the pool, with an inter-call pacing
//! sleep so the transmission rate stays smooth inside a burst. At
//! steady state `limit ≈ rate × duration` (the erlang identity);
//! unless a duration is pinned it is re-derived as `limit / rate` on
//! every rate or limit change.
//!
//! # State machine
//!
//! ```text
//! INITIAL ──start()──► ORIGINATING ──stop()/hupall()/max──► STOPPED
//!                          ▲                                   │
//!                          └──────────────start()──────────────┘
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Call detail record capture and derived latency metrics.
pub mod cdr;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Weak;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::app::{Application, CallbackCtx, Callbacks};
use crate::error::{Error, Result};
use crate::identifiers::AppId;
use crate::pool::Pool;
use crate::protocol::names;

pub use cdr::{effective_call_rate, CallMetrics, CdrRecorder, CdrRow};

// ============================================================================
// OriginatorState
// ============================================================================

/// Originator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OriginatorState {
    /// Configured but never started.
    Initial = 0,
    /// The burst loop is firing originates.
    Originating = 1,
    /// Not originating; in-flight calls drain naturally.
    Stopped = 2,
}

impl OriginatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Originating,
            2 => Self::Stopped,
            _ => Self::Initial,
        }
    }
}

// ============================================================================
// OriginatorConfig
// ============================================================================

/// Load settings for the burst engine.
#[derive(Debug, Clone)]
pub struct OriginatorConfig {
    /// Target new calls per second.
    pub rate: f64,
    /// Maximum concurrent calls (erlangs).
    pub limit: usize,
    /// Total offered-call count at which to stop originating.
    pub max_offered: u64,
    /// Per-call hold time in seconds; derived from `limit / rate`
    /// while `auto_duration` is on.
    pub duration: f64,
    /// Pacing interval in seconds.
    pub period: f64,
    /// Hang answered calls up after `duration` unless the app owns
    /// teardown.
    pub autohangup: bool,
    /// Recompute `duration` on every rate/limit change.
    pub auto_duration: bool,
    /// Hard ceiling on the effective transmission rate.
    pub max_rate: f64,
    /// Constant added to the derived duration.
    pub duration_offset: f64,
}

impl Default for OriginatorConfig {
    fn default() -> Self {
        Self {
            rate: 30.0,
            limit: 1,
            max_offered: u64::MAX,
            duration: 0.0,
            period: 1.0,
            autohangup: true,
            auto_duration: true,
            max_rate: 250.0,
            duration_offset: 0.0,
        }
    }
}

impl OriginatorConfig {
    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a non-positive rate, period or
    /// rate ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.rate <= 0.0 {
            return Err(Error::config("rate must be positive"));
        }
        if self.period <= 0.0 {
            return Err(Error::config("period must be positive"));
        }
        if self.max_rate <= 0.0 {
            return Err(Error::config("max_rate must be positive"));
        }
        Ok(())
    }

    /// The derived duration under the erlang identity.
    #[must_use]
    fn derived_duration(&self) -> f64 {
        self.limit as f64 / self.rate + self.duration_offset
    }

    /// Rate after the transmission ceiling.
    #[must_use]
    fn effective_rate(&self) -> f64 {
        self.rate.min(self.max_rate)
    }
}

// ============================================================================
// Originator
// ============================================================================

struct OrigInner {
    pool: Arc<Pool>,
    cdr: CdrRecorder,
    settings: RwLock<OriginatorConfig>,
    state: AtomicU8,
    bursting: AtomicBool,
    shutting_down: AtomicBool,
    total_offered: AtomicU64,
    app_ids: RwLock<Vec<AppId>>,
    app_cursor: AtomicUsize,
    burst_task: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
}

impl OrigInner {
    fn state(&self) -> OriginatorState {
        OriginatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn change_state(&self, next: OriginatorState) {
        let prev = self.state.swap(next as u8, Ordering::AcqRel);
        if prev != next as u8 {
            info!(
                from = ?OriginatorState::from_u8(prev),
                to = ?next,
                "Originator state change"
            );
        }
    }

    /// Next app id in rotation.
    fn next_app(&self) -> Option<AppId> {
        let apps = self.app_ids.read();
        if apps.is_empty() {
            return None;
        }
        let index = self.app_cursor.fetch_add(1, Ordering::Relaxed) % apps.len();
        Some(apps[index].clone())
    }

    /// Halts the burst loop and records the stopped state.
    fn halt(&self) {
        self.bursting.store(false, Ordering::Release);
        if self.state() == OriginatorState::Originating {
            self.change_state(OriginatorState::Stopped);
        }
    }
}

/// The closed-loop burst engine over a pool of engines.
pub struct Originator {
    inner: Arc<OrigInner>,
}

impl Originator {
    /// Creates an originator over a pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings.
    pub fn new(pool: Arc<Pool>, mut config: OriginatorConfig) -> Result<Self> {
        config.validate()?;
        if config.auto_duration && config.duration == 0.0 {
            config.duration = config.derived_duration();
        }
        Ok(Self {
            inner: Arc::new(OrigInner {
                cdr: CdrRecorder::new(&pool),
                pool,
                settings: RwLock::new(config),
                state: AtomicU8::new(OriginatorState::Initial as u8),
                bursting: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                total_offered: AtomicU64::new(0),
                app_ids: RwLock::new(Vec::new()),
                app_cursor: AtomicUsize::new(0),
                burst_task: Mutex::new(None),
                wake: Notify::new(),
            }),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OriginatorState {
        self.inner.state()
    }

    /// Calls offered so far (successful `bgapi` submissions,
    /// including ones that later resolve `-ERR`).
    #[must_use]
    pub fn total_offered(&self) -> u64 {
        self.inner.total_offered.load(Ordering::Relaxed)
    }

    /// Live calls across the pool right now.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.inner.pool.count_calls()
    }

    /// The CDR recorder bundled with every loaded app.
    #[must_use]
    pub fn cdr(&self) -> &CdrRecorder {
        &self.inner.cdr
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.inner.pool
    }

    /// Snapshot of the current load settings.
    #[must_use]
    pub fn config(&self) -> OriginatorConfig {
        self.inner.settings.read().clone()
    }

    // ========================================================================
    // Load settings
    // ========================================================================

    /// Sets the offer rate, re-deriving duration under
    /// auto-duration.
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        if rate <= 0.0 {
            return Err(Error::config("rate must be positive"));
        }
        let mut settings = self.inner.settings.write();
        settings.rate = rate;
        if settings.auto_duration {
            settings.duration = settings.derived_duration();
        }
        Ok(())
    }

    /// Sets the concurrency limit, re-deriving duration under
    /// auto-duration.
    pub fn set_limit(&self, limit: usize) {
        let mut settings = self.inner.settings.write();
        settings.limit = limit;
        if settings.auto_duration {
            settings.duration = settings.derived_duration();
        }
    }

    /// Pins the per-call duration.
    pub fn set_duration(&self, duration: f64) {
        self.inner.settings.write().duration = duration;
    }

    /// Sets the offered-call ceiling.
    pub fn set_max_offered(&self, max_offered: u64) {
        self.inner.settings.write().max_offered = max_offered;
    }

    // ========================================================================
    // Apps
    // ========================================================================

    /// Loads a call-control app cluster-wide, bundled with the CDR
    /// recorder and the originator's own lifecycle callbacks, all
    /// under one app id. Loaded apps join the originate rotation.
    pub async fn load_app(
        &self,
        app: Arc<dyn Application>,
        app_id: Option<AppId>,
    ) -> Result<AppId> {
        let bundle = Arc::new(BundledApp {
            name: app.name().to_string(),
            parts: vec![
                app,
                Arc::new(self.inner.cdr.clone()),
                Arc::new(InternalApp {
                    inner: Arc::downgrade(&self.inner),
                }),
            ],
        });
        let app_id = self.inner.pool.load_app_all(bundle, app_id).await?;
        self.inner.app_ids.write().push(app_id.clone());
        Ok(app_id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Prepares engines for load generation: raises session/sps
    /// ceilings and enables verbose channel events.
    ///
    /// Failures are logged per engine, not fatal.
    pub async fn setup_engines(&self) {
        for client in self.inner.pool.clients() {
            for cmd in [
                "fsctl sps 10000",
                "fsctl max_sessions 10000",
                "fsctl verbose_events true",
            ] {
                if let Err(e) = client.api(cmd).await {
                    warn!(host = %client.host(), cmd, error = %e, "Engine setup failed");
                }
            }
        }
    }

    /// Enters `ORIGINATING`: spawns (or wakes) the burst task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no app is loaded or a pool
    /// member is missing its originate template.
    pub fn start(&self) -> Result<()> {
        if self.inner.app_ids.read().is_empty() {
            return Err(Error::config("no apps have been loaded"));
        }
        for client in self.inner.pool.clients() {
            if client.originate_config().is_none() {
                return Err(Error::config(format!(
                    "client for '{}' has no originate template",
                    client.host()
                )));
            }
            client.start()?;
        }

        let mut task = self.inner.burst_task.lock();
        if task.as_ref().map_or(true, JoinHandle::is_finished) {
            debug!("Spawning burst task");
            *task = Some(tokio::spawn(run_burst(Arc::clone(&self.inner))));
        }
        drop(task);

        self.inner.bursting.store(true, Ordering::Release);
        self.inner.change_state(OriginatorState::Originating);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Stops issuing originates; in-flight calls drain naturally.
    pub fn stop(&self) {
        if self.state() != OriginatorState::Stopped {
            info!("Stopping origination");
        }
        self.inner.halt();
        self.inner.wake.notify_one();
    }

    /// Stops and force-terminates every call owned by the pool's
    /// clients.
    pub async fn hupall(&self) -> Result<()> {
        warn!("Stopping all calls with hupall");
        self.stop();
        self.inner.pool.hupall_all().await
    }

    /// Full teardown: hupall when sessions remain, then burst task
    /// exit.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.pool.count_sessions() > 0 {
            self.hupall().await?;
        } else {
            self.stop();
        }
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.wake.notify_one();
        let task = self.inner.burst_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Resolves once the originator is stopped and every pool call
    /// has drained.
    pub async fn drained(&self) {
        loop {
            if self.state() != OriginatorState::Originating
                && self.inner.pool.count_calls() == 0
                && self.inner.pool.count_jobs() == 0
            {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}

impl std::fmt::Debug for Originator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settings = self.inner.settings.read();
        f.debug_struct("Originator")
            .field("state", &self.state())
            .field("active_calls", &self.active_calls())
            .field("total_offered", &self.total_offered())
            .field("rate", &settings.rate)
            .field("limit", &settings.limit)
            .field("duration", &settings.duration)
            .finish()
    }
}

// ============================================================================
// Burst task
// ============================================================================

/// The pacing loop: one burst per period while bursting is enabled.
async fn run_burst(inner: Arc<OrigInner>) {
    debug!("Burst task started");
    loop {
        if inner.shutting_down.load(Ordering::Acquire) {
            break;
        }
        if !inner.bursting.load(Ordering::Acquire) {
            inner.halt();
            inner.wake.notified().await;
            continue;
        }

        let tick = Instant::now();
        let period = Duration::from_secs_f64(inner.settings.read().period);
        burst_once(&inner).await;

        let elapsed = tick.elapsed();
        if elapsed < period {
            sleep(period - elapsed).await;
        }
    }
    inner.halt();
    debug!("Burst task terminated");
}

/// Fires one period's worth of originates.
async fn burst_once(inner: &Arc<OrigInner>) {
    let (limit, max_offered, burst_size, pacing) = {
        let settings = inner.settings.read();
        let effective = settings.effective_rate();
        (
            settings.limit,
            settings.max_offered,
            (effective * settings.period).floor() as u64,
            // Leave headroom for per-call processing latency.
            Duration::from_secs_f64(0.9 / effective),
        )
    };

    let total = inner.total_offered.load(Ordering::Relaxed);
    if total >= max_offered {
        info!(total, max_offered, "Offered-call ceiling reached");
        inner.halt();
        return;
    }

    let active = inner.pool.count_calls() as u64;
    let num = burst_quota(burst_size, limit as u64, active, max_offered, total);
    debug!(num, active, total, "Bursting originates");
    if num == 0 && active >= limit as u64 {
        debug!(limit, "Concurrency limit reached");
    }

    for _ in 0..num {
        if !inner.bursting.load(Ordering::Acquire)
            || inner.shutting_down.load(Ordering::Acquire)
        {
            break;
        }
        if inner.pool.count_calls() >= limit {
            break;
        }
        let Some(app_id) = inner.next_app() else { break };
        let Some(client) = inner.pool.next_available() else {
            debug!("Every pool member is saturated");
            break;
        };

        match client.originate(&app_id).await {
            Ok(job) => {
                inner.total_offered.fetch_add(1, Ordering::Relaxed);
                debug!(job = %job.uuid(), host = %client.host(), "Originate requested");
            }
            Err(e) => {
                error!(host = %client.host(), error = %e, "Originate submission failed");
            }
        }
        sleep(pacing).await;
    }
}

/// The control law: how many originates one burst may fire.
///
/// `min(rate · period, limit − active, max_offered − total)`, never
/// negative on any term.
fn burst_quota(burst_size: u64, limit: u64, active: u64, max_offered: u64, total: u64) -> u64 {
    burst_size
        .min(limit.saturating_sub(active))
        .min(max_offered.saturating_sub(total))
}

// ============================================================================
// Internal lifecycle app
// ============================================================================

/// The originator's own callbacks, bundled under every loaded app id.
struct InternalApp {
    inner: Weak<OrigInner>,
}

impl Application for InternalApp {
    fn name(&self) -> &str {
        "originator"
    }

    fn callbacks(&self) -> Callbacks {
        let originate_inner = self.inner.clone();
        let job_inner = self.inner.clone();
        let hangup_inner = self.inner.clone();

        Callbacks::new()
            .on(names::CHANNEL_ORIGINATE, move |_ctx| {
                let Some(inner) = originate_inner.upgrade() else {
                    return;
                };
                let max = inner.settings.read().max_offered;
                if inner.total_offered.load(Ordering::Relaxed) >= max {
                    info!(max_offered = max, "Max offered sessions reached");
                    inner.halt();
                }
            })
            .on(names::BACKGROUND_JOB, move |ctx| {
                if let Some(inner) = job_inner.upgrade() {
                    handle_job_resolution(&inner, ctx);
                }
            })
            .on(names::CHANNEL_HANGUP, move |_ctx| {
                let Some(inner) = hangup_inner.upgrade() else {
                    return;
                };
                if inner.pool.count_jobs() == 0 && inner.pool.count_sessions() == 0 {
                    info!("All sessions have ended");
                }
            })
    }
}

/// Schedules the automatic hangup for an answered originate.
fn handle_job_resolution(inner: &Arc<OrigInner>, ctx: &CallbackCtx<'_>) {
    let Some(session) = ctx.session else { return };
    let resolved_ok = ctx
        .job
        .is_some_and(|job| matches!(job.try_result(), Some(Ok(_))));
    if !resolved_ok {
        return; // failed jobs are accounted by the listener
    }

    let (autohangup, duration) = {
        let settings = inner.settings.read();
        (settings.autohangup, settings.duration)
    };
    if !autohangup || duration <= 0.0 {
        return;
    }
    if session.app_owns_teardown()
        || ctx
            .call
            .is_some_and(|call| call.var("noautohangup").is_some())
    {
        return;
    }

    let remaining = duration - session.uptime();
    debug!(uuid = %session.uuid(), remaining, "Scheduling auto hangup");
    let result = if remaining > 0.0 {
        session.sched_hangup(remaining.ceil() as u64, "NORMAL_CLEARING")
    } else {
        session.hangup("NORMAL_CLEARING")
    };
    if let Err(e) = result {
        warn!(uuid = %session.uuid(), error = %e, "Auto hangup failed");
    }
}

// ============================================================================
// App bundling
// ============================================================================

/// Several applications registered as one, under one app id.
struct BundledApp {
    name: String,
    parts: Vec<Arc<dyn Application>>,
}

impl Application for BundledApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn callbacks(&self) -> Callbacks {
        let mut combined = Callbacks::new();
        for part in &self.parts {
            for (event_name, callback) in part.callbacks().into_entries() {
                combined = combined.on_arc(event_name, callback);
            }
        }
        combined
    }

    fn subscriptions(&self) -> Vec<String> {
        self.parts
            .iter()
            .flat_map(|part| part.subscriptions())
            .collect()
    }

    fn on_load(&self) -> Result<()> {
        for (index, part) in self.parts.iter().enumerate() {
            if let Err(e) = part.on_load() {
                for loaded in &self.parts[..index] {
                    let _ = loaded.on_unload();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_unload(&self) -> Result<()> {
        for part in &self.parts {
            part.on_unload()?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
