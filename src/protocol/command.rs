//! Outbound command builders.
//!
//! Every request the control plane sends is a line-oriented command
//! terminated by a blank line (`sendmsg` additionally carries its own
//! header block). This module renders those strings; framing is done
//! by [`serialize_command`](super::frame::serialize_command) at the
//! transport layer.
//!
//! The originate template lives here too: [`OriginateConfig`] is the
//! parameterized form, rendered per fire with fresh UUIDs into
//!
//! ```text
//! originate {vars}sofia/<profile>/<dest>[;fs_path=sip:<proxy>] &<app>(<args>)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt::Write;

use crate::error::{Error, Result};
use crate::identifiers::{AppId, ClientId, SessionUuid};

// ============================================================================
// Constants
// ============================================================================

/// SIP X-header prefix used for correlation variables.
const XHEADER_PREFIX: &str = "sip_h_X-";

/// Variable carrying the correlation tag of the originating session.
pub const ORIGINATING_SESSION_VAR: &str = "sip_h_X-originating_session_uuid";

/// Variable attributing a session to its owning control client.
pub const CLIENT_ID_VAR: &str = "sip_h_X-switchio_client";

/// Variable attributing a session to a loaded application.
pub const APP_ID_VAR: &str = "switchio_app";

// ============================================================================
// Simple commands
// ============================================================================

/// Renders the authentication command.
#[must_use]
pub fn auth(password: &str) -> String {
    format!("auth {password}")
}

/// Renders a synchronous `api` command.
#[must_use]
pub fn api(cmd: &str) -> String {
    format!("api {cmd}")
}

/// Renders a background `bgapi` command.
#[must_use]
pub fn bgapi(cmd: &str) -> String {
    format!("bgapi {cmd}")
}

/// Renders a `bgapi` command with a locally-generated `Job-UUID`
/// planted, so the job can be registered before the reply arrives.
#[must_use]
pub fn bgapi_with_uuid(cmd: &str, job_uuid: crate::identifiers::JobUuid) -> String {
    format!("bgapi {cmd}\nJob-UUID: {job_uuid}")
}

/// Renders an `event plain` subscription for the given event names.
///
/// Subclassed names (containing `::`) are folded behind a single
/// `CUSTOM` token, as the engine expects:
/// `event plain CHANNEL_CREATE CUSTOM mod_bert::timeout`.
#[must_use]
pub fn subscribe<'a>(events: impl IntoIterator<Item = &'a str>) -> String {
    let mut std_names = Vec::new();
    let mut custom = Vec::new();
    for name in events {
        if name.contains("::") {
            custom.push(name);
        } else if name != "CUSTOM" {
            std_names.push(name);
        }
    }
    if !custom.is_empty() {
        std_names.push("CUSTOM");
        std_names.extend(custom);
    }
    format!("event plain {}", std_names.join(" "))
}

/// Renders a `filter` command restricting delivery to events whose
/// `header` matches `value`.
#[must_use]
pub fn filter(header: &str, value: &str) -> String {
    format!("filter {header} {value}")
}

/// Renders the `divert_events` toggle.
#[must_use]
pub fn divert_events(enabled: bool) -> String {
    format!("divert_events {}", if enabled { "on" } else { "off" })
}

/// Renders the clean-shutdown command.
#[must_use]
pub fn exit() -> String {
    "exit".to_string()
}

/// Channel-variable name `hupall` matches on; the bare form of
/// [`CLIENT_ID_VAR`] without the SIP X-header prefix.
pub const CLIENT_ID_CHANNEL_VAR: &str = "switchio_client";

/// Renders a `hupall` scoped to one control client's sessions.
#[must_use]
pub fn hupall(client_id: &ClientId) -> String {
    format!("hupall NORMAL_CLEARING {CLIENT_ID_CHANNEL_VAR} {client_id}")
}

// ============================================================================
// sendmsg
// ============================================================================

/// Renders a `sendmsg` block executing a dialplan application on a
/// session. Argument bytes are carried in an explicit
/// `content-length` body, making the command binary-safe.
#[must_use]
pub fn sendmsg(uuid: SessionUuid, app: &str, arg: &str, loops: u32) -> String {
    let mut out = String::with_capacity(128);
    let _ = write!(out, "sendmsg {uuid}\ncall-command: execute\nexecute-app-name: {app}\n");
    let _ = write!(out, "loops: {loops}\n");
    if !arg.is_empty() {
        let _ = write!(
            out,
            "content-type: text/plain\ncontent-length: {}\n\n{arg}",
            arg.len()
        );
    }
    out
}

// ============================================================================
// OriginateConfig
// ============================================================================

/// Parameterized originate template.
///
/// Built once per client configuration, rendered per fire with a
/// fresh origination UUID. Defaults follow common loopback test
/// setups: `external` profile, `park` post-connect extension, PCMU.
///
/// # Example
///
/// ```
/// use switchcraft::protocol::OriginateConfig;
///
/// let config = OriginateConfig::builder("5550100@sut.example.com:5060")
///     .profile("external")
///     .proxy("10.0.0.2:5060")
///     .app("park")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct OriginateConfig {
    dest_url: String,
    profile: String,
    gateway: Option<String>,
    proxy: Option<String>,
    app_name: Option<String>,
    app_args: String,
    dp_exten: String,
    dp_type: String,
    dp_context: String,
    timeout_secs: u32,
    caller_id: String,
    codec: String,
    absolute_codec: Option<String>,
    xheaders: Vec<(String, String)>,
    extra_vars: Vec<(String, String)>,
}

impl OriginateConfig {
    /// Starts a builder for the given destination URI
    /// (`<user>@<host>[:<port>]`).
    #[must_use]
    pub fn builder(dest_url: impl Into<String>) -> OriginateConfigBuilder {
        OriginateConfigBuilder::new(dest_url)
    }

    /// Renders the full `originate` command for one fire.
    ///
    /// Always plants the correlation variables: the fresh
    /// `origination_uuid`, the matching
    /// `sip_h_X-originating_session_uuid` tag, the owning client id,
    /// and the target app id.
    #[must_use]
    pub fn render(
        &self,
        uuid: SessionUuid,
        client_id: ClientId,
        app_id: &AppId,
    ) -> String {
        let mut vars: Vec<(String, String)> = vec![
            ("origination_uuid".into(), uuid.to_string()),
            (ORIGINATING_SESSION_VAR.into(), uuid.to_string()),
            (CLIENT_ID_VAR.into(), client_id.to_string()),
            (APP_ID_VAR.into(), app_id.to_string()),
            ("originate_timeout".into(), self.timeout_secs.to_string()),
            ("originate_caller_id_name".into(), self.caller_id.clone()),
            ("originator_codec".into(), self.codec.clone()),
        ];
        if let Some(codec) = &self.absolute_codec {
            vars.push(("absolute_codec_string".into(), codec.clone()));
        }
        for (name, value) in &self.xheaders {
            let key = if name.starts_with(XHEADER_PREFIX) {
                name.clone()
            } else {
                format!("{XHEADER_PREFIX}{name}")
            };
            vars.push((key, value.clone()));
        }
        vars.extend(self.extra_vars.iter().cloned());

        let var_block = vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        let endpoint = match &self.gateway {
            Some(gateway) => format!("gateway/{gateway}"),
            None => self.profile.clone(),
        };
        let path = self
            .proxy
            .as_ref()
            .map(|p| format!(";fs_path=sip:{p}"))
            .unwrap_or_default();

        let app_part = match &self.app_name {
            Some(app) => format!("&{app}({})", self.app_args),
            None => format!("{} {} {}", self.dp_exten, self.dp_type, self.dp_context),
        };

        format!(
            "originate {{{var_block}}}sofia/{endpoint}/{dest}{path} {app_part}",
            dest = self.dest_url
        )
    }

    /// Returns the destination URI.
    #[inline]
    #[must_use]
    pub fn dest_url(&self) -> &str {
        &self.dest_url
    }

    /// Returns the configured originate timeout in seconds.
    #[inline]
    #[must_use]
    pub fn timeout_secs(&self) -> u32 {
        self.timeout_secs
    }
}

// ============================================================================
// OriginateConfigBuilder
// ============================================================================

/// Builder for [`OriginateConfig`].
#[derive(Debug, Clone)]
pub struct OriginateConfigBuilder {
    dest_url: String,
    profile: String,
    gateway: Option<String>,
    proxy: Option<String>,
    app_name: Option<String>,
    app_args: String,
    dp_exten: String,
    dp_type: String,
    dp_context: String,
    timeout_secs: u32,
    caller_id: String,
    codec: String,
    absolute_codec: Option<String>,
    xheaders: Vec<(String, String)>,
    extra_vars: Vec<(String, String)>,
}

impl OriginateConfigBuilder {
    fn new(dest_url: impl Into<String>) -> Self {
        Self {
            dest_url: dest_url.into(),
            profile: "external".to_string(),
            gateway: None,
            proxy: None,
            app_name: None,
            app_args: String::new(),
            dp_exten: "park".to_string(),
            dp_type: "xml".to_string(),
            dp_context: "default".to_string(),
            timeout_secs: 60,
            caller_id: "switchcraft".to_string(),
            codec: "PCMU".to_string(),
            absolute_codec: None,
            xheaders: Vec::new(),
            extra_vars: Vec::new(),
        }
    }

    /// Sets the sofia profile used for the outbound leg.
    #[must_use]
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Routes the leg through a named gateway instead of a profile.
    #[must_use]
    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Sets a first-hop proxy (`fs_path`).
    #[must_use]
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets the post-connect application (rendered as `&app(args)`).
    ///
    /// Without an app the dialplan form
    /// `<exten> <dialplan> <context>` is rendered instead.
    #[must_use]
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app_name = Some(app.into());
        self
    }

    /// Sets arguments for the post-connect application.
    #[must_use]
    pub fn app_args(mut self, args: impl Into<String>) -> Self {
        self.app_args = args.into();
        self
    }

    /// Sets the dialplan extension/type/context triple.
    #[must_use]
    pub fn dialplan(
        mut self,
        exten: impl Into<String>,
        dp_type: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        self.dp_exten = exten.into();
        self.dp_type = dp_type.into();
        self.dp_context = context.into();
        self
    }

    /// Sets the originate timeout in seconds.
    #[must_use]
    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Sets the caller id name.
    #[must_use]
    pub fn caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    /// Sets the preferred codec.
    #[must_use]
    pub fn codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    /// Forces an absolute codec string.
    #[must_use]
    pub fn absolute_codec(mut self, codec: impl Into<String>) -> Self {
        self.absolute_codec = Some(codec.into());
        self
    }

    /// Adds a custom SIP X-header (prefix added if missing).
    #[must_use]
    pub fn xheader(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.xheaders.push((name.into(), value.into()));
        self
    }

    /// Adds an arbitrary originate variable.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_vars.push((name.into(), value.into()));
        self
    }

    /// Validates and builds the config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the destination is empty.
    pub fn build(self) -> Result<OriginateConfig> {
        if self.dest_url.trim().is_empty() {
            return Err(Error::config("originate destination is empty"));
        }
        Ok(OriginateConfig {
            dest_url: self.dest_url,
            profile: self.profile,
            gateway: self.gateway,
            proxy: self.proxy,
            app_name: self.app_name,
            app_args: self.app_args,
            dp_exten: self.dp_exten,
            dp_type: self.dp_type,
            dp_context: self.dp_context,
            timeout_secs: self.timeout_secs,
            caller_id: self.caller_id,
            codec: self.codec,
            absolute_codec: self.absolute_codec,
            xheaders: self.xheaders,
            extra_vars: self.extra_vars,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands() {
        assert_eq!(auth("secret"), "auth secret");
        assert_eq!(api("status"), "api status");
        assert_eq!(bgapi("originate x y"), "bgapi originate x y");
        assert_eq!(filter("Unique-ID", "abc"), "filter Unique-ID abc");
        assert_eq!(divert_events(true), "divert_events on");
        assert_eq!(exit(), "exit");
    }

    #[test]
    fn test_subscribe_plain() {
        let cmd = subscribe(["CHANNEL_CREATE", "BACKGROUND_JOB"]);
        assert_eq!(cmd, "event plain CHANNEL_CREATE BACKGROUND_JOB");
    }

    #[test]
    fn test_subscribe_folds_custom_subclasses() {
        let cmd = subscribe(["CHANNEL_CREATE", "mod_bert::timeout", "mod_bert::lost_sync"]);
        assert_eq!(
            cmd,
            "event plain CHANNEL_CREATE CUSTOM mod_bert::timeout mod_bert::lost_sync"
        );
    }

    #[test]
    fn test_hupall_scoped_to_client() {
        let client_id = ClientId::generate();
        let cmd = hupall(&client_id);
        assert_eq!(
            cmd,
            format!("hupall NORMAL_CLEARING switchio_client {client_id}")
        );
    }

    #[test]
    fn test_sendmsg_with_arg() {
        let uuid = SessionUuid::generate();
        let cmd = sendmsg(uuid, "playback", "/tones/ring.wav", 1);
        assert!(cmd.starts_with(&format!("sendmsg {uuid}\n")));
        assert!(cmd.contains("execute-app-name: playback"));
        assert!(cmd.contains("content-length: 15"));
        assert!(cmd.ends_with("/tones/ring.wav"));
    }

    #[test]
    fn test_originate_render_mandatory_vars() {
        let config = OriginateConfig::builder("5550100@sut:5060")
            .app("park")
            .build()
            .unwrap();
        let uuid = SessionUuid::generate();
        let client_id = ClientId::generate();
        let app_id = AppId::new("bert");

        let cmd = config.render(uuid, client_id, &app_id);
        assert!(cmd.starts_with("originate {"));
        assert!(cmd.contains(&format!("origination_uuid={uuid}")));
        assert!(cmd.contains(&format!("sip_h_X-originating_session_uuid={uuid}")));
        assert!(cmd.contains(&format!("sip_h_X-switchio_client={client_id}")));
        assert!(cmd.contains("switchio_app=bert"));
        assert!(cmd.contains("originate_timeout=60"));
        assert!(cmd.contains("sofia/external/5550100@sut:5060 &park()"));
    }

    #[test]
    fn test_originate_render_proxy_and_gateway() {
        let config = OriginateConfig::builder("100@sut")
            .gateway("sut-gw")
            .proxy("10.0.0.2:5060")
            .build()
            .unwrap();
        let cmd = config.render(
            SessionUuid::generate(),
            ClientId::generate(),
            &AppId::new("default"),
        );
        assert!(cmd.contains("sofia/gateway/sut-gw/100@sut;fs_path=sip:10.0.0.2:5060"));
        // No app configured: dialplan form.
        assert!(cmd.ends_with(" park xml default"));
    }

    #[test]
    fn test_originate_xheader_prefixing() {
        let config = OriginateConfig::builder("100@sut")
            .xheader("test_run", "42")
            .xheader("sip_h_X-explicit", "1")
            .build()
            .unwrap();
        let cmd = config.render(
            SessionUuid::generate(),
            ClientId::generate(),
            &AppId::new("a"),
        );
        assert!(cmd.contains("sip_h_X-test_run=42"));
        assert!(cmd.contains("sip_h_X-explicit=1"));
        assert!(!cmd.contains("sip_h_X-sip_h_X-explicit"));
    }

    #[test]
    fn test_originate_empty_dest_rejected() {
        assert!(OriginateConfig::builder("  ").build().is_err());
    }
}
