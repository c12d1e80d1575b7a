//! Type-safe identifiers for control-plane entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time:
//! a [`JobUuid`] can never be passed where a [`SessionUuid`] is
//! expected, even though both are UUID strings on the wire.
//!
//! # ID Types
//!
//! | Type | Source | Purpose |
//! |------|--------|---------|
//! | [`SessionUuid`] | `Unique-ID` header / `origination_uuid` var | One channel leg |
//! | [`CallUuid`] | correlation tag shared by both legs | One user call |
//! | [`JobUuid`] | `Job-UUID` header | One outstanding `bgapi` |
//! | [`ClientId`] | `sip_h_X-switchio_client` var | Owning control client |
//! | [`AppId`] | `switchio_app` var | Loaded application |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Macro
// ============================================================================

/// Implements the shared surface for UUID-backed identifiers.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random (v4) identifier.
            #[inline]
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses an identifier from a wire header value.
            ///
            /// Returns `None` when the value is not a valid UUID.
            #[inline]
            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                Uuid::parse_str(value.trim()).ok().map(Self)
            }

            /// Returns the underlying UUID.
            #[inline]
            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id! {
    /// Identifier of one channel leg on an engine.
    ///
    /// Assigned by the engine (`Unique-ID`) for inbound legs, or
    /// generated locally and planted as `origination_uuid` for
    /// outbound legs so the session can be tracked before its first
    /// event arrives.
    SessionUuid
}

uuid_id! {
    /// Identifier shared by the sessions of one correlated call.
    ///
    /// Planted in the originate command as an X-header so the
    /// terminating leg carries the same tag back.
    CallUuid
}

uuid_id! {
    /// Identifier of one outstanding background job.
    JobUuid
}

uuid_id! {
    /// Identifier of the control client owning a set of sessions.
    ///
    /// Planted as `sip_h_X-switchio_client` on every originate so
    /// `hupall` can target only this client's traffic.
    ClientId
}

impl From<SessionUuid> for CallUuid {
    /// A lone session's call tag defaults to its own UUID.
    fn from(value: SessionUuid) -> Self {
        Self(value.0)
    }
}

// ============================================================================
// AppId
// ============================================================================

/// Identifier of a loaded application.
///
/// Unlike the UUID-backed IDs this is free-form: callers may supply a
/// human-readable id (`"router"`), otherwise a UUID string is
/// generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    /// Creates an app id from a caller-supplied name.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random app id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AppId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Tests
// ============================================================================
