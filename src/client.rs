//! Control client facade.
//!
//! A [`Client`] layers the command surface over one engine's
//! [`Listener`]: synchronous `api`, background `bgapi` returning a
//! [`Job`] handle, the `originate` convenience, application loading
//! with rollback, and scoped `hupall`.
//!
//! # Example
//!
//! ```no_run
//! use switchcraft::client::Client;
//! use switchcraft::protocol::OriginateConfig;
//! use switchcraft::transport::ConnectConfig;
//!
//! # async fn example() -> switchcraft::Result<()> {
//! let client = Client::new(ConnectConfig::new("fs1.example.com", "ClueCon"));
//! client.connect().await?;
//! client.start()?;
//!
//! let uptime = client.cmd("status").await?;
//! println!("{uptime}");
//!
//! client.set_originate_config(
//!     OriginateConfig::builder("5550100@sut.example.com")
//!         .app("park")
//!         .build()?,
//! );
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::error::{Error, Result};
use crate::identifiers::{AppId, ClientId, JobUuid, SessionUuid};
use crate::listener::Listener;
use crate::model::Job;
use crate::protocol::{command, EslMessage, OriginateConfig};
use crate::transport::ConnectConfig;

// ============================================================================
// Client
// ============================================================================

/// Control interface for one engine.
pub struct Client {
    id: ClientId,
    listener: Listener,
    apps: Mutex<FxHashMap<AppId, Arc<dyn Application>>>,
    originate_config: RwLock<Option<OriginateConfig>>,
}

impl Client {
    /// Creates a client with its own listener for the given engine.
    #[must_use]
    pub fn new(config: ConnectConfig) -> Self {
        Self::with_listener(Listener::new(config))
    }

    /// Creates a client over an existing listener.
    #[must_use]
    pub fn with_listener(listener: Listener) -> Self {
        Self {
            id: ClientId::generate(),
            listener,
            apps: Mutex::new(FxHashMap::default()),
            originate_config: RwLock::new(None),
        }
    }

    /// Returns the client id planted on originated sessions.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Returns the engine host.
    #[must_use]
    pub fn host(&self) -> &str {
        self.listener.host()
    }

    /// Returns the underlying listener.
    #[inline]
    #[must_use]
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connects the listener (handshake + subscription).
    pub async fn connect(&self) -> Result<()> {
        self.listener.connect().await
    }

    /// Starts the listener's event pump.
    pub fn start(&self) -> Result<()> {
        self.listener.start()
    }

    /// Stops the listener; the client stays reusable after a new
    /// `connect()`.
    pub async fn stop(&self) {
        self.listener.stop().await;
    }

    /// Returns `true` while connected.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.listener.connected()
    }

    // ========================================================================
    // Synchronous commands
    // ========================================================================

    /// Invokes a synchronous `api` command.
    ///
    /// # Errors
    ///
    /// - [`Error::Api`] when the engine's body starts with `-ERR`
    /// - transport errors when disconnected
    pub async fn api(&self, cmd: &str) -> Result<EslMessage> {
        let reply = self.listener.connection()?.api(cmd).await?;
        reply.check_api_body()?;
        Ok(reply)
    }

    /// Invokes `api` and returns the body string with the trailing
    /// newline trimmed.
    pub async fn cmd(&self, cmd: &str) -> Result<String> {
        let reply = self.api(cmd).await?;
        Ok(reply
            .body_str()
            .unwrap_or_default()
            .trim_end_matches('\n')
            .to_string())
    }

    // ========================================================================
    // Background commands
    // ========================================================================

    /// Issues a non-blocking `bgapi` command.
    ///
    /// A `Job-UUID` is generated locally and planted in the request,
    /// and the job is registered with the listener *before* the
    /// command is sent; the resolving `BACKGROUND_JOB` event can never
    /// race the registration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when the listener is not running
    /// - [`Error::Api`] when the engine rejects the command
    pub async fn bgapi(&self, cmd: &str) -> Result<Arc<Job>> {
        self.bgapi_with_session(cmd, None).await
    }

    async fn bgapi_with_session(
        &self,
        cmd: &str,
        session_uuid: Option<SessionUuid>,
    ) -> Result<Arc<Job>> {
        if !self.listener.is_running() {
            return Err(Error::config(
                "start the listener before issuing bgapi commands",
            ));
        }
        let conn = self.listener.connection()?;

        let job_uuid = JobUuid::generate();
        let job = Arc::new(Job::new(job_uuid, session_uuid));
        self.listener.register_job(Arc::clone(&job));
        debug!(job = %job_uuid, session = ?session_uuid, cmd, "Launching background job");

        let reply = conn
            .send_recv(
                &command::bgapi_with_uuid(cmd, job_uuid),
                crate::transport::ReplyKind::CommandReply,
            )
            .await;

        match reply {
            Ok(reply) if reply.is_reply_ok() => Ok(job),
            Ok(reply) => {
                let text = reply.reply_text().unwrap_or("(no Reply-Text)").to_string();
                job.fail(text.clone());
                Err(Error::api(text))
            }
            Err(e) => {
                job.fail_lost();
                Err(e)
            }
        }
    }

    // ========================================================================
    // Originate
    // ========================================================================

    /// Caches the originate template used by [`Client::originate`].
    pub fn set_originate_config(&self, config: OriginateConfig) {
        *self.originate_config.write() = Some(config);
    }

    /// Returns the cached originate template.
    #[must_use]
    pub fn originate_config(&self) -> Option<OriginateConfig> {
        self.originate_config.read().clone()
    }

    /// Fires one originate from the cached template.
    ///
    /// The returned job's session UUID is preset to the freshly
    /// generated origination UUID, so the session can be looked up in
    /// the listener before its first event arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no template is configured.
    pub async fn originate(&self, app_id: &AppId) -> Result<Arc<Job>> {
        let config = self
            .originate_config
            .read()
            .clone()
            .ok_or_else(|| Error::config("no originate template configured"))?;
        self.originate_with(&config, app_id).await
    }

    /// Fires one originate from an explicit template.
    pub async fn originate_with(
        &self,
        config: &OriginateConfig,
        app_id: &AppId,
    ) -> Result<Arc<Job>> {
        let session_uuid = SessionUuid::generate();
        let cmd = config.render(session_uuid, self.id, app_id);
        self.bgapi_with_session(&cmd, Some(session_uuid)).await
    }

    // ========================================================================
    // Applications
    // ========================================================================

    /// Loads an application, registering all of its callbacks and
    /// hooks atomically.
    ///
    /// Either every registration lands, or the listener is left
    /// untouched: a duplicate id, a failed `on_load` hook, and a
    /// failed live subscription all roll back.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateApp`] when the id is taken
    /// - whatever `on_load` or the subscription command returned
    pub async fn load_app(
        &self,
        app: Arc<dyn Application>,
        app_id: Option<AppId>,
    ) -> Result<AppId> {
        let app_id = app_id.unwrap_or_else(|| AppId::new(app.name()));
        let callbacks = app.callbacks().into_entries();
        let new_subscriptions =
            self.listener
                .register_app(app_id.clone(), callbacks, app.subscriptions())?;

        if let Err(e) = app.on_load() {
            warn!(app = %app_id, error = %e, "on_load failed, rolling back");
            let _ = self.listener.unregister_app(&app_id);
            return Err(e);
        }

        if !new_subscriptions.is_empty() && self.connected() {
            if let Err(e) = self
                .listener
                .subscribe_events(new_subscriptions.iter().map(String::as_str))
                .await
            {
                warn!(app = %app_id, error = %e, "subscription failed, rolling back");
                let _ = app.on_unload();
                let _ = self.listener.unregister_app(&app_id);
                return Err(e);
            }
        }

        self.apps.lock().insert(app_id.clone(), app);
        info!(app = %app_id, host = %self.host(), "App loaded");
        Ok(app_id)
    }

    /// Unloads an application and drops its subscription references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AppNotFound`] for unknown ids.
    pub fn unload_app(&self, app_id: &AppId) -> Result<()> {
        let app = self
            .apps
            .lock()
            .remove(app_id)
            .ok_or_else(|| Error::app_not_found(app_id.clone()))?;
        if let Err(e) = app.on_unload() {
            warn!(app = %app_id, error = %e, "on_unload failed");
        }
        self.listener.unregister_app(app_id)?;
        info!(app = %app_id, "App unloaded");
        Ok(())
    }

    /// Returns the ids of apps loaded on this client.
    #[must_use]
    pub fn app_ids(&self) -> Vec<AppId> {
        self.apps.lock().keys().cloned().collect()
    }

    // ========================================================================
    // Hangup control
    // ========================================================================

    /// Terminates every session owned by this client
    /// (`hupall NORMAL_CLEARING switchio_client <id>`).
    pub async fn hupall(&self) -> Result<()> {
        self.api(&command::hupall(&self.id)).await?;
        Ok(())
    }

    /// Terminates every session on the engine, owned or not.
    pub async fn hupall_all(&self) -> Result<()> {
        self.api("hupall NORMAL_CLEARING").await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("host", &self.host())
            .field("apps", &self.apps.lock().len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Callbacks;
    use crate::protocol::names;

    struct NopApp {
        fail_load: bool,
    }

    impl Application for NopApp {
        fn name(&self) -> &str {
            "nop"
        }

        fn callbacks(&self) -> Callbacks {
            Callbacks::new().on(names::CHANNEL_PARK, |_| {})
        }

        fn on_load(&self) -> Result<()> {
            if self.fail_load {
                Err(Error::config("load refused"))
            } else {
                Ok(())
            }
        }
    }

    fn offline_client() -> Client {
        Client::new(ConnectConfig::new("test", "ClueCon"))
    }

    #[tokio::test]
    async fn test_load_app_default_id_from_name() {
        let client = offline_client();
        let id = client
            .load_app(Arc::new(NopApp { fail_load: false }), None)
            .await
            .unwrap();
        assert_eq!(id, AppId::new("nop"));
        assert_eq!(client.app_ids(), vec![AppId::new("nop")]);
    }

    #[tokio::test]
    async fn test_load_app_duplicate_rejected() {
        let client = offline_client();
        client
            .load_app(Arc::new(NopApp { fail_load: false }), None)
            .await
            .unwrap();
        let err = client
            .load_app(Arc::new(NopApp { fail_load: false }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateApp { .. }));
    }

    #[tokio::test]
    async fn test_load_app_rolls_back_on_hook_failure() {
        let client = offline_client();
        let err = client
            .load_app(Arc::new(NopApp { fail_load: true }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        // Nothing was left behind; the id is loadable again.
        assert!(client.app_ids().is_empty());
        client
            .load_app(Arc::new(NopApp { fail_load: false }), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unload_unknown_app() {
        let client = offline_client();
        let err = client.unload_app(&AppId::new("ghost")).unwrap_err();
        assert!(matches!(err, Error::AppNotFound { .. }));
    }

    #[tokio::test]
    async fn test_bgapi_requires_running_listener() {
        let client = offline_client();
        let err = client.bgapi("status").await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_originate_requires_template() {
        let client = offline_client();
        // Listener not running is checked later; template first.
        let err = client.originate(&AppId::new("a")).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
