//! switchcraft - control plane and call generator for FreeSWITCH
//! clusters.
//!
//! This library speaks the Event Socket Layer (ESL) protocol to a
//! cluster of FreeSWITCH engines: it consumes each engine's event
//! stream, correlates events into session and call state, dispatches
//! background-job results, runs user call-control applications, and
//! drives a calibrated outbound-call generator against a system under
//! test.
//!
//! # Architecture
//!
//! ```text
//! bytes ─► protocol ─► transport ─► listener ─► applications
//!                         ▲        (model +         │
//!                         │         dispatch)       │ session verbs
//!                         └─────────────────────────┘
//!
//!          originator ─► pool ─► clients (one per engine)
//! ```
//!
//! - Each [`transport::Connection`] owns one authenticated TCP
//!   session; replies resolve a FIFO of waiters while events flow to
//!   the listener.
//! - Each [`listener::Listener`] owns the authoritative session/call
//!   model for one engine and fans events out to applications.
//! - A [`client::Client`] is the command facade: `api`, `bgapi`,
//!   `originate`, app loading, `hupall`.
//! - The [`originator::Originator`] paces originate bursts across a
//!   [`pool::Pool`], holding offered load at a target rate and
//!   concurrency.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchcraft::originator::{Originator, OriginatorConfig};
//! use switchcraft::pool::Pool;
//! use switchcraft::protocol::OriginateConfig;
//! use switchcraft::router::{RouteAction, Router};
//! use switchcraft::transport::ConnectConfig;
//!
//! #[tokio::main]
//! async fn main() -> switchcraft::Result<()> {
//!     let pool = Arc::new(Pool::from_configs([
//!         ConnectConfig::new("fs1.example.com", "ClueCon"),
//!         ConnectConfig::new("fs2.example.com", "ClueCon"),
//!     ])?);
//!     pool.connect_all().await?;
//!     pool.set_originate_config_all(
//!         OriginateConfig::builder("5550100@sut.example.com")
//!             .app("park")
//!             .build()?,
//!     );
//!
//!     let router = Router::new(true);
//!     router.add_route(r"^\d+$", |sess, _| {
//!         let _ = sess.bridge(None, None);
//!         RouteAction::Stop
//!     })?;
//!
//!     let originator = Originator::new(
//!         Arc::clone(&pool),
//!         OriginatorConfig {
//!             rate: 30.0,
//!             limit: 2000,
//!             max_offered: 100_000,
//!             ..OriginatorConfig::default()
//!         },
//!     )?;
//!     originator.load_app(Arc::new(router), None).await?;
//!     originator.start()?;
//!     originator.drained().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | ESL framing, messages, events, command builders |
//! | [`transport`] | TCP connection, handshake, reply FIFO |
//! | [`listener`] | Per-engine model and event dispatch |
//! | [`model`] | Session, call and job entities |
//! | [`app`] | Application plug-in contract |
//! | [`client`] | Per-engine control facade |
//! | [`pool`] | Multi-engine aggregation |
//! | [`router`] | Pattern-based call routing |
//! | [`originator`] | Closed-loop burst engine + CDR capture |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Application plug-in contract.
pub mod app;

/// Per-engine control facade.
pub mod client;

/// Error types and result aliases.
pub mod error;

/// Type-safe identifiers for control-plane entities.
pub mod identifiers;

/// Per-engine observer: model and event dispatch.
pub mod listener;

/// Entities tracked by the control plane.
pub mod model;

/// Closed-loop outbound call generator.
pub mod originator;

/// Multi-engine client pool.
pub mod pool;

/// ESL wire protocol.
pub mod protocol;

/// Pattern-based call routing.
pub mod router;

/// Engine transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Core surface
pub use app::{Application, CallbackCtx, Callbacks, EventCallback};
pub use client::Client;
pub use error::{Error, Result};
pub use listener::Listener;
pub use originator::{Originator, OriginatorConfig, OriginatorState};
pub use pool::Pool;
pub use router::{RouteAction, Router};

// Entity types
pub use model::{Call, Direction, Job, Session, SessionTimes};

// Identifier types
pub use identifiers::{AppId, CallUuid, ClientId, JobUuid, SessionUuid};

// Protocol types
pub use protocol::{Event, OriginateConfig};
pub use transport::ConnectConfig;
