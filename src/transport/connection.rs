//! TCP connection and I/O task.
//!
//! One [`Connection`] is one authenticated ESL session to one engine.
//! It owns the framer, a FIFO of pending synchronous reply waiters,
//! and the outbound write path; every received non-reply message is
//! forwarded into a typed event channel consumed by the listener.
//!
//! # I/O Task
//!
//! The connection spawns one tokio task that handles:
//!
//! - Incoming frames from the engine (replies, events, disconnect)
//! - Outgoing commands from the control API
//! - FIFO reply correlation (commands are answered in send order;
//!   events interleave freely)
//!
//! # Timeout Semantics
//!
//! A timed-out waiter is *abandoned in place*, not removed: its slot
//! stays in the FIFO and the next reply of that class discards it.
//! Removing the slot would bind that reply to the wrong waiter.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::frame::serialize_command;
use crate::protocol::{command, ContentType, EslFramer, EslMessage};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for synchronous command replies.
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall deadline for connect + authentication.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP connect attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 5;

/// Delay between TCP connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Socket read chunk size.
const READ_CHUNK: usize = 16 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Classes of synchronous replies, each with its own FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `command/reply` messages.
    CommandReply,
    /// `api/response` messages.
    ApiResponse,
}

/// One pending reply waiter.
///
/// `tx == None` means the slot is abandoned (timed out) or was never
/// interested in the reply (`send_nowait`); the matching reply is
/// discarded to keep the FIFO aligned.
struct Waiter {
    slot: u64,
    tx: Option<oneshot::Sender<Result<EslMessage>>>,
}

/// Internal commands for the I/O task.
enum IoCommand {
    /// Write a frame, optionally registering a reply waiter.
    Send {
        frame: Vec<u8>,
        kind: Option<ReplyKind>,
        waiter: Option<Waiter>,
    },
    /// Mark a timed-out waiter slot abandoned.
    Abandon { kind: ReplyKind, slot: u64 },
    /// Close the socket and stop the task.
    Shutdown,
}

// ============================================================================
// ConnectConfig
// ============================================================================

/// Engine endpoint and credentials.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Engine hostname or address.
    pub host: String,
    /// ESL port (default 8021).
    pub port: u16,
    /// Shared ESL password.
    pub password: String,
}

impl ConnectConfig {
    /// Creates a config with the default ESL port.
    #[must_use]
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 8021,
            password: password.into(),
        }
    }

    /// Overrides the ESL port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Shared connection state.
struct Shared {
    host: String,
    port: u16,
    command_tx: mpsc::UnboundedSender<IoCommand>,
    closed: AtomicBool,
    next_slot: AtomicU64,
}

/// Authenticated ESL session handle.
///
/// Cheap to clone; all clones feed the same I/O task. Outbound writes
/// are serialized through the task, so the handle is safe for
/// concurrent senders. The event stream has a single reader: the
/// listener's pump.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connects and authenticates against an engine.
    ///
    /// Performs the handshake inline (wait for `auth/request`, send
    /// `auth`, require `+OK`), then spawns the I/O task. Returns the
    /// handle plus the event channel receiver; every event and the
    /// final disconnect notice arrive there in receive order.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] when TCP connect fails after retries
    /// - [`Error::ConnectionTimeout`] when the handshake stalls
    /// - [`Error::Auth`] when the engine rejects the password
    pub async fn connect(
        config: &ConnectConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EslMessage>)> {
        let stream = timeout(CONNECT_TIMEOUT, Self::connect_tcp(config))
            .await
            .map_err(|_| Error::connection_timeout(CONNECT_TIMEOUT.as_millis() as u64))??;

        let (mut read_half, mut write_half) = stream.into_split();
        let mut framer = EslFramer::new();

        timeout(
            CONNECT_TIMEOUT,
            Self::handshake(config, &mut read_half, &mut write_half, &mut framer),
        )
        .await
        .map_err(|_| Error::connection_timeout(CONNECT_TIMEOUT.as_millis() as u64))??;

        debug!(host = %config.host, port = config.port, "Authenticated");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            host: config.host.clone(),
            port: config.port,
            command_tx,
            closed: AtomicBool::new(false),
            next_slot: AtomicU64::new(0),
        });

        tokio::spawn(run_io_task(
            Arc::clone(&shared),
            read_half,
            write_half,
            framer,
            command_rx,
            event_tx,
        ));

        Ok((Self { shared }, event_rx))
    }

    /// TCP connect with bounded retries.
    async fn connect_tcp(config: &ConnectConfig) -> Result<TcpStream> {
        let addr = format!("{}:{}", config.host, config.port);
        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match TcpStream::connect(&addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(
                        host = %config.host,
                        port = config.port,
                        attempt,
                        error = %e,
                        "Connect failed, retrying"
                    );
                    last_err = Some(e);
                    sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(Error::connection(
            &config.host,
            config.port,
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Runs the password handshake on the raw stream.
    async fn handshake(
        config: &ConnectConfig,
        read_half: &mut OwnedReadHalf,
        write_half: &mut OwnedWriteHalf,
        framer: &mut EslFramer,
    ) -> Result<()> {
        let request = read_message(read_half, framer).await?;
        if request.content_type()? != ContentType::AuthRequest {
            return Err(Error::protocol(format!(
                "expected auth/request, got {:?}",
                request.header("Content-Type")
            )));
        }

        write_half
            .write_all(&serialize_command(&command::auth(&config.password)))
            .await?;

        // Events cannot arrive before the subscription command, so
        // the next frame is the auth reply.
        let reply = read_message(read_half, framer).await?;
        if reply.content_type()? != ContentType::CommandReply {
            return Err(Error::protocol("expected command/reply to auth"));
        }
        if !reply.is_reply_ok() {
            return Err(Error::auth(
                reply.reply_text().unwrap_or("(no Reply-Text)").to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Returns the engine hostname.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// Returns the engine ESL port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Returns `true` once the I/O task has terminated.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Sends a raw command and awaits its reply with the default
    /// timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is down
    /// - [`Error::Timeout`] if no reply arrives in time
    pub async fn send_recv(&self, cmd: &str, kind: ReplyKind) -> Result<EslMessage> {
        self.send_recv_timeout(cmd, kind, DEFAULT_REPLY_TIMEOUT).await
    }

    /// Sends a raw command and awaits its reply with a caller-chosen
    /// deadline.
    ///
    /// On expiry the waiter slot is abandoned in place so the late
    /// reply cannot bind to the next waiter.
    pub async fn send_recv_timeout(
        &self,
        cmd: &str,
        kind: ReplyKind,
        reply_timeout: Duration,
    ) -> Result<EslMessage> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let slot = self.shared.next_slot.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.shared
            .command_tx
            .send(IoCommand::Send {
                frame: serialize_command(cmd),
                kind: Some(kind),
                waiter: Some(Waiter {
                    slot,
                    tx: Some(tx),
                }),
            })
            .map_err(|_| Error::ConnectionClosed)?;

        match timeout(reply_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let _ = self.shared.command_tx.send(IoCommand::Abandon { kind, slot });
                Err(Error::timeout(
                    first_word(cmd),
                    reply_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Sends a command whose reply is discarded (but still consumes a
    /// FIFO slot, keeping alignment).
    ///
    /// Used for session control verbs issued from synchronous
    /// callback contexts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is down.
    pub fn send_nowait(&self, cmd: &str, kind: ReplyKind) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let slot = self.shared.next_slot.fetch_add(1, Ordering::Relaxed);
        self.shared
            .command_tx
            .send(IoCommand::Send {
                frame: serialize_command(cmd),
                kind: Some(kind),
                waiter: Some(Waiter { slot, tx: None }),
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Invokes a synchronous `api` command.
    ///
    /// # Errors
    ///
    /// Transport errors only; `-ERR` bodies are surfaced by the
    /// caller via [`EslMessage::check_api_body`].
    pub async fn api(&self, cmd: &str) -> Result<EslMessage> {
        self.send_recv(&command::api(cmd), ReplyKind::ApiResponse)
            .await
    }

    /// Invokes a synchronous `api` command with a deadline.
    pub async fn api_timeout(&self, cmd: &str, deadline: Duration) -> Result<EslMessage> {
        self.send_recv_timeout(&command::api(cmd), ReplyKind::ApiResponse, deadline)
            .await
    }

    /// Issues a non-blocking `bgapi` command, returning the immediate
    /// `command/reply` (carrying `Job-UUID`).
    pub async fn bgapi(&self, cmd: &str) -> Result<EslMessage> {
        self.send_recv(&command::bgapi(cmd), ReplyKind::CommandReply)
            .await
    }

    /// Subscribes this connection to the given event names.
    pub async fn subscribe<'a>(
        &self,
        events: impl IntoIterator<Item = &'a str>,
    ) -> Result<EslMessage> {
        self.send_recv(&command::subscribe(events), ReplyKind::CommandReply)
            .await
    }

    /// Shuts the connection down.
    ///
    /// Pending waiters fail with [`Error::ConnectionClosed`]; the
    /// event channel closes after draining.
    pub fn shutdown(&self) {
        let _ = self.shared.command_tx.send(IoCommand::Shutdown);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Returns the leading token of a command for timeout labels.
fn first_word(cmd: &str) -> String {
    cmd.split_whitespace().next().unwrap_or("command").to_string()
}

// ============================================================================
// I/O task
// ============================================================================

/// Reads one complete message from the raw stream (handshake path).
async fn read_message(read_half: &mut OwnedReadHalf, framer: &mut EslFramer) -> Result<EslMessage> {
    loop {
        if let Some(msg) = framer.next_message()? {
            return Ok(msg);
        }
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        framer.extend(&chunk[..n]);
    }
}

/// The per-connection I/O loop.
async fn run_io_task(
    shared: Arc<Shared>,
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut framer: EslFramer,
    mut command_rx: mpsc::UnboundedReceiver<IoCommand>,
    event_tx: mpsc::UnboundedSender<EslMessage>,
) {
    let mut reply_fifo: VecDeque<Waiter> = VecDeque::new();
    let mut api_fifo: VecDeque<Waiter> = VecDeque::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    'outer: loop {
        tokio::select! {
            // Incoming bytes from the engine.
            read = read_half.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!(host = %shared.host, "Socket closed by engine");
                        break 'outer;
                    }
                    Ok(n) => {
                        framer.extend(&chunk[..n]);
                        loop {
                            match framer.next_message() {
                                Ok(Some(msg)) => {
                                    if !dispatch_message(
                                        &shared,
                                        msg,
                                        &mut reply_fifo,
                                        &mut api_fifo,
                                        &event_tx,
                                    ) {
                                        break 'outer;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    error!(host = %shared.host, error = %e, "Framing failed");
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(host = %shared.host, error = %e, "Socket read failed");
                        break 'outer;
                    }
                }
            }

            // Commands from the control API.
            cmd = command_rx.recv() => {
                match cmd {
                    Some(IoCommand::Send { frame, kind, waiter }) => {
                        if let (Some(kind), Some(waiter)) = (kind, waiter) {
                            fifo_for(kind, &mut reply_fifo, &mut api_fifo).push_back(waiter);
                        }
                        if let Err(e) = write_half.write_all(&frame).await {
                            error!(host = %shared.host, error = %e, "Socket write failed");
                            break 'outer;
                        }
                        trace!(host = %shared.host, bytes = frame.len(), "Frame sent");
                    }

                    Some(IoCommand::Abandon { kind, slot }) => {
                        let fifo = fifo_for(kind, &mut reply_fifo, &mut api_fifo);
                        if let Some(waiter) = fifo.iter_mut().find(|w| w.slot == slot) {
                            waiter.tx = None;
                            debug!(slot, "Waiter abandoned after timeout");
                        }
                    }

                    Some(IoCommand::Shutdown) => {
                        debug!(host = %shared.host, "Shutdown requested");
                        let _ = write_half.write_all(&serialize_command(&command::exit())).await;
                        let _ = write_half.shutdown().await;
                        break 'outer;
                    }

                    None => {
                        debug!(host = %shared.host, "All connection handles dropped");
                        break 'outer;
                    }
                }
            }
        }
    }

    // Fail every pending waiter; the listener observes the channel
    // close and fails its jobs.
    shared.closed.store(true, Ordering::Release);
    for waiter in reply_fifo.into_iter().chain(api_fifo) {
        if let Some(tx) = waiter.tx {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
    }
    debug!(host = %shared.host, "I/O task terminated");
}

/// Picks the FIFO matching a reply class.
fn fifo_for<'a>(
    kind: ReplyKind,
    reply_fifo: &'a mut VecDeque<Waiter>,
    api_fifo: &'a mut VecDeque<Waiter>,
) -> &'a mut VecDeque<Waiter> {
    match kind {
        ReplyKind::CommandReply => reply_fifo,
        ReplyKind::ApiResponse => api_fifo,
    }
}

/// Routes one framed message. Returns `false` when the loop must stop
/// (disconnect notice or fatal classification error).
fn dispatch_message(
    shared: &Shared,
    msg: EslMessage,
    reply_fifo: &mut VecDeque<Waiter>,
    api_fifo: &mut VecDeque<Waiter>,
    event_tx: &mpsc::UnboundedSender<EslMessage>,
) -> bool {
    let content_type = match msg.content_type() {
        Ok(ct) => ct,
        Err(e) => {
            error!(host = %shared.host, error = %e, "Unclassifiable message");
            return false;
        }
    };

    match content_type {
        ContentType::CommandReply | ContentType::ApiResponse => {
            let kind = if content_type == ContentType::CommandReply {
                ReplyKind::CommandReply
            } else {
                ReplyKind::ApiResponse
            };
            match fifo_for(kind, reply_fifo, api_fifo).pop_front() {
                Some(Waiter { tx: Some(tx), .. }) => {
                    let _ = tx.send(Ok(msg));
                }
                Some(Waiter { tx: None, slot }) => {
                    trace!(slot, "Discarding reply for abandoned waiter");
                }
                None => {
                    warn!(host = %shared.host, ?kind, "Reply with no pending waiter");
                }
            }
            true
        }

        ContentType::EventPlain | ContentType::EventJson | ContentType::EventXml => {
            // Single reader; an error means the listener is gone.
            event_tx.send(msg).is_ok()
        }

        ContentType::DisconnectNotice => {
            debug!(host = %shared.host, "Disconnect notice received");
            let _ = event_tx.send(msg);
            false
        }

        ContentType::AuthRequest => {
            warn!(host = %shared.host, "Unexpected auth/request after handshake");
            true
        }
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
impl Connection {
    /// Handle with no backing I/O task; model unit tests that never
    /// touch the wire use this. Sends fail with `ConnectionClosed`.
    pub(crate) fn test_stub() -> Self {
        let (command_tx, _dropped_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                host: "test".into(),
                port: 8021,
                command_tx,
                closed: AtomicBool::new(false),
                next_slot: AtomicU64::new(0),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
