//! Engine transport layer.
//!
//! One [`Connection`] per engine: a single authenticated TCP session
//! whose replies resolve a FIFO of pending waiters while events flow
//! out through an unbounded channel to the listener's pump.
//!
//! ```text
//! ┌──────────┐  commands  ┌──────────┐   TCP    ┌────────────┐
//! │ Client / │ ─────────► │ I/O task │ ◄──────► │ FreeSWITCH │
//! │ Listener │ ◄───────── │  (tokio) │          │   engine   │
//! └──────────┘   events   └──────────┘          └────────────┘
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// TCP connection, handshake, waiter FIFO, I/O task.
pub mod connection;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{ConnectConfig, Connection, ReplyKind};
