//! Error types for the control plane.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use switchcraft::{Result, Error};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     let status = client.cmd("status").await?;
//!     println!("{status}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::Protocol`], [`Error::Auth`] |
//! | Commands | [`Error::Api`], [`Error::JobFailed`], [`Error::Timeout`] |
//! | Model | [`Error::SessionNotFound`], [`Error::AppNotFound`], [`Error::DuplicateApp`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

use crate::identifiers::{AppId, JobUuid, SessionUuid};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a builder is incomplete or a state transition is
    /// attempted with invalid settings (e.g. starting an originator
    /// with no loaded apps).
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// TCP connection to the engine failed.
    #[error("Connection to {host}:{port} failed: {message}")]
    Connection {
        /// Engine hostname or address.
        host: String,
        /// Engine ESL port.
        port: u16,
        /// Description of the connection error.
        message: String,
    },

    /// Connect or handshake deadline expired.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection dropped or the engine sent a disconnect notice.
    ///
    /// Fails every pending waiter and job on the owning connection.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed wire data.
    ///
    /// Fatal for the connection; the listener is marked disconnected.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Authentication handshake was rejected by the engine.
    #[error("Authentication failed: {message}")]
    Auth {
        /// The engine's `Reply-Text`.
        message: String,
    },

    // ========================================================================
    // Command Errors
    // ========================================================================
    /// The engine returned `-ERR` for a synchronous command.
    ///
    /// Not fatal; surfaces to the caller of `api`/`cmd`.
    #[error("API command failed: {message}")]
    Api {
        /// The `-ERR` body returned by the engine.
        message: String,
    },

    /// A background job resolved with `-ERR`.
    #[error("Background job {job_uuid} failed: {cause}")]
    JobFailed {
        /// The failed job's UUID.
        job_uuid: JobUuid,
        /// The failure cause reported in the job body.
        cause: String,
    },

    /// A bounded wait expired.
    ///
    /// The abandoned waiter slot stays in the reply FIFO so late
    /// replies cannot misalign subsequent waiters.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Model Errors
    // ========================================================================
    /// Session lookup missed the live table.
    #[error("Session not found: {uuid}")]
    SessionNotFound {
        /// The missing session's UUID.
        uuid: SessionUuid,
    },

    /// Application lookup missed the registry.
    #[error("App not found: {app_id}")]
    AppNotFound {
        /// The missing app id.
        app_id: AppId,
    },

    /// An application with this id is already loaded.
    #[error("App already loaded: {app_id}")]
    DuplicateApp {
        /// The conflicting app id.
        app_id: AppId,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error (event-json bodies, CDR rows).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(host: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            port,
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    #[inline]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Creates an API error from an `-ERR` body.
    #[inline]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    /// Creates a failed-job error.
    #[inline]
    pub fn job_failed(job_uuid: JobUuid, cause: impl Into<String>) -> Self {
        Self::JobFailed {
            job_uuid,
            cause: cause.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a session-not-found error.
    #[inline]
    pub fn session_not_found(uuid: SessionUuid) -> Self {
        Self::SessionNotFound { uuid }
    }

    /// Creates an app-not-found error.
    #[inline]
    pub fn app_not_found(app_id: AppId) -> Self {
        Self::AppNotFound { app_id }
    }

    /// Creates a duplicate-app error.
    #[inline]
    pub fn duplicate_app(app_id: AppId) -> Self {
        Self::DuplicateApp { app_id }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry; protocol and auth
    /// failures will not.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::Timeout { .. }
                | Self::Api { .. }
                | Self::JobFailed { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
