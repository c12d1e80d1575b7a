//! Application plug-in contract.
//!
//! An application is a named bundle of event callbacks loaded onto a
//! client. At load time it presents its `(event name, callback)`
//! pairs; the listener fans matching events out to them in
//! registration order, after the built-in handler chain has updated
//! the session model.
//!
//! Callbacks registered under a subclassed name (`mod_bert::timeout`)
//! fire for `CUSTOM` events with that `Event-Subclass`, and the
//! subclass is added to the engine subscription automatically.
//!
//! # Example
//!
//! ```
//! use switchcraft::app::{Application, Callbacks};
//! use switchcraft::protocol::names;
//!
//! struct ParkLogger;
//!
//! impl Application for ParkLogger {
//!     fn name(&self) -> &str {
//!         "park-logger"
//!     }
//!
//!     fn callbacks(&self) -> Callbacks {
//!         Callbacks::new().on(names::CHANNEL_PARK, |ctx| {
//!             if let Some(sess) = ctx.session {
//!                 println!("parked {}", sess.uuid());
//!             }
//!         })
//!     }
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use crate::error::Result;
use crate::model::{Call, Job, Session};
use crate::protocol::Event;

// ============================================================================
// CallbackCtx
// ============================================================================

/// Arguments delivered to an event callback.
///
/// The session is present for channel events whose leg is tracked;
/// the call once the session is correlated; the job for
/// `BACKGROUND_JOB` deliveries.
pub struct CallbackCtx<'a> {
    /// The triggering event.
    pub event: &'a Event,
    /// The session the event belongs to, when tracked.
    pub session: Option<&'a Arc<Session>>,
    /// The call owning that session, when correlated.
    pub call: Option<&'a Arc<Call>>,
    /// The resolved background job, for `BACKGROUND_JOB`.
    pub job: Option<&'a Arc<Job>>,
}

/// A registered event callback.
///
/// Callbacks run on the listener's pump task and must not block;
/// issue session verbs (fire-and-forget) or hand work to another
/// task. Panics are caught, logged and isolated.
pub type EventCallback = Arc<dyn Fn(&CallbackCtx<'_>) + Send + Sync>;

// ============================================================================
// Callbacks
// ============================================================================

/// Ordered list of `(event name, callback)` registrations.
#[derive(Default)]
pub struct Callbacks {
    entries: Vec<(String, EventCallback)>,
}

impl Callbacks {
    /// Creates an empty registration list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for an event name (or `CUSTOM` subclass).
    #[must_use]
    pub fn on(
        mut self,
        event_name: impl Into<String>,
        callback: impl Fn(&CallbackCtx<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.entries.push((event_name.into(), Arc::new(callback)));
        self
    }

    /// Registers an already-shared callback.
    #[must_use]
    pub fn on_arc(mut self, event_name: impl Into<String>, callback: EventCallback) -> Self {
        self.entries.push((event_name.into(), callback));
        self
    }

    /// Returns the number of registrations.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the list into its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<(String, EventCallback)> {
        self.entries
    }
}

// ============================================================================
// Application
// ============================================================================

/// A loadable call-control application.
pub trait Application: Send + Sync {
    /// Human-readable application name (also the default app id).
    fn name(&self) -> &str;

    /// The callback registrations this app wants.
    ///
    /// Called once per load; the returned list is inserted
    /// atomically.
    fn callbacks(&self) -> Callbacks;

    /// Extra event subscriptions beyond the callback names.
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Hook run after the app's callbacks are registered.
    ///
    /// An error here rolls the whole load back.
    fn on_load(&self) -> Result<()> {
        Ok(())
    }

    /// Hook run before the app's callbacks are removed.
    fn on_unload(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callbacks_preserve_order() {
        let cbs = Callbacks::new()
            .on("CHANNEL_PARK", |_| {})
            .on("CHANNEL_ANSWER", |_| {})
            .on("CHANNEL_PARK", |_| {});
        let entries = cbs.into_entries();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["CHANNEL_PARK", "CHANNEL_ANSWER", "CHANNEL_PARK"]);
    }

    #[test]
    fn test_callback_invocation() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        let cbs = Callbacks::new().on("CHANNEL_PARK", move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });

        let event = Event::server_disconnected();
        let ctx = CallbackCtx {
            event: &event,
            session: None,
            call: None,
            job: None,
        };
        for (_, cb) in cbs.into_entries() {
            cb(&ctx);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
