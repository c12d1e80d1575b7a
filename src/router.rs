//! Pattern-based call routing.
//!
//! The [`Router`] is the public dispatcher for call-control
//! applications: ordered `(header field, regex)` routes behind a set
//! of guards that must all match before any route is tried. On the
//! first matching route the callback runs with the session and the
//! regex captures; returning [`RouteAction::Stop`] skips the
//! remaining routes for that event.
//!
//! # Example
//!
//! ```
//! use switchcraft::router::{RouteAction, Router};
//!
//! # fn example() -> switchcraft::Result<()> {
//! let router = Router::new(true);
//! router.add_guard("Caller-Context", "default")?;
//! router.add_route(r"^9(\d+)$", |sess, captures| {
//!     let digits = captures.get(1).map(|m| m.as_str().to_string());
//!     let _ = sess.bridge(digits.as_deref(), None);
//!     RouteAction::Stop
//! })?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::app::{Application, CallbackCtx, Callbacks};
use crate::error::{Error, Result};
use crate::model::Session;
use crate::protocol::names;

// ============================================================================
// Constants
// ============================================================================

/// Default header field routes match against.
const DEFAULT_ROUTE_FIELD: &str = "Caller-Destination-Number";

/// Cause used when a guarded router rejects a session.
const REJECT_CAUSE: &str = "NO_ROUTE_DESTINATION";

// ============================================================================
// Types
// ============================================================================

/// What a route callback wants done with the remaining routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Keep trying later routes.
    Continue,
    /// Skip all remaining routes for this event.
    Stop,
}

/// A route callback: `(session, captures) -> action`.
pub type RouteFn =
    Arc<dyn Fn(&Arc<Session>, &Captures<'_>) -> RouteAction + Send + Sync>;

/// One registered route.
struct Route {
    field: String,
    pattern: Regex,
    callback: RouteFn,
}

// ============================================================================
// Router
// ============================================================================

struct RouterInner {
    event_name: String,
    guards: RwLock<Vec<(String, Regex)>>,
    routes: RwLock<Vec<Route>>,
    reject_unmatched: bool,
}

/// Guarded, ordered pattern dispatcher, loadable as an application.
///
/// By default the router triggers on `CHANNEL_PARK` (the parked
/// inbound leg awaiting a routing decision).
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Creates a router triggering on `CHANNEL_PARK`.
    ///
    /// With `reject_unmatched`, sessions failing the guards or
    /// matching no route are hung up with `NO_ROUTE_DESTINATION`.
    #[must_use]
    pub fn new(reject_unmatched: bool) -> Self {
        Self::on_event(names::CHANNEL_PARK, reject_unmatched)
    }

    /// Creates a router triggering on an arbitrary event name.
    #[must_use]
    pub fn on_event(event_name: impl Into<String>, reject_unmatched: bool) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                event_name: event_name.into(),
                guards: RwLock::new(Vec::new()),
                routes: RwLock::new(Vec::new()),
                reject_unmatched,
            }),
        }
    }

    /// Adds a guard: `field` must match `pattern` for any route to be
    /// tried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on an invalid pattern.
    pub fn add_guard(&self, field: impl Into<String>, pattern: &str) -> Result<()> {
        let pattern = compile(pattern)?;
        self.inner.guards.write().push((field.into(), pattern));
        Ok(())
    }

    /// Adds a route on the default field
    /// (`Caller-Destination-Number`).
    pub fn add_route(
        &self,
        pattern: &str,
        callback: impl Fn(&Arc<Session>, &Captures<'_>) -> RouteAction + Send + Sync + 'static,
    ) -> Result<()> {
        self.add_route_on(DEFAULT_ROUTE_FIELD, pattern, callback)
    }

    /// Adds a route matching `pattern` against an arbitrary header
    /// field. Routes are tried in registration order.
    pub fn add_route_on(
        &self,
        field: impl Into<String>,
        pattern: &str,
        callback: impl Fn(&Arc<Session>, &Captures<'_>) -> RouteAction + Send + Sync + 'static,
    ) -> Result<()> {
        let pattern = compile(pattern)?;
        self.inner.routes.write().push(Route {
            field: field.into(),
            pattern,
            callback: Arc::new(callback),
        });
        Ok(())
    }

    /// Number of registered routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.inner.routes.read().len()
    }

    /// A reusable bridging route: bridge the session to the matched
    /// value (or the SIP request URI when the match is empty).
    #[must_use]
    pub fn bridge_route(profile: Option<String>) -> RouteFn {
        Arc::new(move |sess, captures| {
            let dest = captures.get(1).map(|m| m.as_str().to_string());
            if let Err(e) = sess.bridge(dest.as_deref(), profile.as_deref()) {
                warn!(uuid = %sess.uuid(), error = %e, "Bridge route failed");
            }
            RouteAction::Stop
        })
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Runs guards and routes for one session.
    fn dispatch(&self, session: &Arc<Session>) {
        let inner = &self.inner;

        for (field, pattern) in inner.guards.read().iter() {
            let value = session.get(field).unwrap_or_default();
            if !pattern.is_match(&value) {
                debug!(uuid = %session.uuid(), field = %field, "Session failed guard");
                self.reject(session);
                return;
            }
        }

        let mut handled = false;
        for route in inner.routes.read().iter() {
            let Some(value) = session.get(&route.field) else {
                continue;
            };
            let Some(captures) = route.pattern.captures(&value) else {
                continue;
            };
            handled = true;
            debug!(
                uuid = %session.uuid(),
                field = %route.field,
                value = %value,
                "Route matched"
            );
            if (route.callback)(session, &captures) == RouteAction::Stop {
                break;
            }
        }

        if !handled {
            debug!(uuid = %session.uuid(), "No route matched");
            self.reject(session);
        }
    }

    /// Hangs an unroutable session up when rejection is enabled.
    fn reject(&self, session: &Arc<Session>) {
        if self.inner.reject_unmatched {
            warn!(uuid = %session.uuid(), "Rejecting session");
            let _ = session.hangup(REJECT_CAUSE);
        }
    }
}

impl Application for Router {
    fn name(&self) -> &str {
        "router"
    }

    fn callbacks(&self) -> Callbacks {
        let router = self.clone();
        Callbacks::new().on(self.inner.event_name.clone(), move |ctx: &CallbackCtx<'_>| {
            if let Some(session) = ctx.session {
                router.dispatch(session);
            }
        })
    }
}

/// Compiles a pattern into a [`Regex`] with config-level errors.
fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::config(format!("invalid route pattern: {e}")))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::SessionUuid;
    use crate::protocol::{EslMessage, Event, Headers};
    use crate::transport::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_with(dest: &str) -> Arc<Session> {
        let uuid = SessionUuid::generate();
        let body = format!(
            "Event-Name: CHANNEL_PARK\nUnique-ID: {uuid}\nCall-Direction: inbound\n\
             Caller-Destination-Number: {dest}\nCaller-Context: default\n"
        );
        let clen = body.len().to_string();
        let headers: Headers = [
            ("Content-Type", "text/event-plain"),
            ("Content-Length", clen.as_str()),
        ]
        .into_iter()
        .collect();
        let event =
            Event::from_message(&EslMessage::new(headers, Some(body.into_bytes()))).unwrap();
        Arc::new(Session::new(uuid, &event, Connection::test_stub()))
    }

    #[test]
    fn test_first_match_stops_when_asked() {
        let router = Router::new(false);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&first);
        router
            .add_route(r"^555\d+$", move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                RouteAction::Stop
            })
            .unwrap();
        let hits = Arc::clone(&second);
        router
            .add_route(r"^\d+$", move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                RouteAction::Stop
            })
            .unwrap();

        router.dispatch(&session_with("5550100"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_continue_tries_later_routes() {
        let router = Router::new(false);
        let second = Arc::new(AtomicUsize::new(0));

        router
            .add_route(r"^555\d+$", |_, _| RouteAction::Continue)
            .unwrap();
        let hits = Arc::clone(&second);
        router
            .add_route(r"^\d+$", move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                RouteAction::Stop
            })
            .unwrap();

        router.dispatch(&session_with("5550100"));
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_blocks_routes() {
        let router = Router::new(false);
        router.add_guard("Caller-Context", "^public$").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = Arc::clone(&hits);
        router
            .add_route(r".*", move |_, _| {
                cb_hits.fetch_add(1, Ordering::SeqCst);
                RouteAction::Stop
            })
            .unwrap();

        // Session context is "default", guard wants "public".
        router.dispatch(&session_with("5550100"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_captures_delivered() {
        let router = Router::new(false);
        let seen = Arc::new(parking_lot::Mutex::new(String::new()));
        let seen_cb = Arc::clone(&seen);
        router
            .add_route(r"^9(\d+)$", move |_, captures| {
                *seen_cb.lock() = captures.get(1).unwrap().as_str().to_string();
                RouteAction::Stop
            })
            .unwrap();

        router.dispatch(&session_with("95550100"));
        assert_eq!(&*seen.lock(), "5550100");
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let router = Router::new(false);
        assert!(matches!(
            router.add_route("(unclosed", |_, _| RouteAction::Stop),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_registers_as_application() {
        let router = Router::new(false);
        router.add_route(r".*", |_, _| RouteAction::Stop).unwrap();
        let callbacks = Application::callbacks(&router);
        assert_eq!(callbacks.len(), 1);
    }
}
