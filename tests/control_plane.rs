//! End-to-end scenarios against an in-process mock engine.
//!
//! The mock speaks just enough ESL to exercise the handshake, the
//! reply FIFO, background jobs, session correlation and disconnect
//! handling over a real TCP socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use switchcraft::protocol::names;
use switchcraft::{
    AppId, Client, ConnectConfig, Error, JobUuid, OriginateConfig, SessionUuid,
};

// ============================================================================
// Mock engine
// ============================================================================

/// Handle to one accepted control connection.
#[derive(Clone)]
struct ConnHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnHandle {
    fn send_raw(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.tx.send(frame.into());
    }

    /// Sends a `text/event-plain` frame built from header pairs and
    /// an optional nested body.
    fn send_event(&self, pairs: &[(&str, &str)], body: Option<&str>) {
        let mut inner = String::new();
        for (k, v) in pairs {
            inner.push_str(&format!("{k}: {v}\n"));
        }
        if let Some(body) = body {
            inner.push_str(&format!("Content-Length: {}\n\n{body}", body.len()));
        }
        let frame = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{inner}",
            inner.len()
        );
        self.send_raw(frame.into_bytes());
    }

    fn send_disconnect(&self) {
        self.send_raw(&b"Content-Type: text/disconnect-notice\n\n"[..]);
    }
}

/// Minimal scriptable ESL server.
struct MockEngine {
    port: u16,
    password: String,
    api_responses: Arc<Mutex<HashMap<String, String>>>,
    connections: Arc<Mutex<Vec<ConnHandle>>>,
    bgapi_log: Arc<Mutex<Vec<(String, JobUuid)>>>,
}

impl MockEngine {
    async fn start(password: &str) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let engine = Arc::new(Self {
            port,
            password: password.to_string(),
            api_responses: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(Mutex::new(Vec::new())),
            bgapi_log: Arc::new(Mutex::new(Vec::new())),
        });

        let accept_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let engine = Arc::clone(&accept_engine);
                tokio::spawn(async move {
                    engine.serve(stream).await;
                });
            }
        });
        engine
    }

    fn config(&self) -> ConnectConfig {
        ConnectConfig::new("127.0.0.1", self.password.as_str()).port(self.port)
    }

    fn set_api_response(&self, cmd: &str, body: &str) {
        self.api_responses
            .lock()
            .insert(cmd.to_string(), body.to_string());
    }

    fn connection(&self) -> ConnHandle {
        self.connections.lock().last().expect("connected").clone()
    }

    fn last_bgapi(&self) -> Option<(String, JobUuid)> {
        self.bgapi_log.lock().last().cloned()
    }

    async fn serve(&self, stream: TcpStream) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handle = ConnHandle { tx };
        handle.send_raw(&b"Content-Type: auth/request\n\n"[..]);
        self.connections.lock().push(handle.clone());

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = Vec::new();
        let mut chunk = vec![0u8; 4096];
        loop {
            let Ok(n) = read_half.read(&mut chunk).await else {
                break;
            };
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            while let Some(pos) = find_blank(&buf) {
                let block = String::from_utf8_lossy(&buf[..pos]).to_string();
                buf.drain(..pos + 2);
                if !self.handle_command(&block, &handle) {
                    return;
                }
            }
        }
    }

    /// Handles one received command block. Returns `false` to close.
    fn handle_command(&self, block: &str, conn: &ConnHandle) -> bool {
        let mut lines = block.lines();
        let command = lines.next().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(": "))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if let Some(password) = command.strip_prefix("auth ") {
            if password == self.password {
                conn.send_raw(
                    &b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n"[..],
                );
            } else {
                conn.send_raw(
                    &b"Content-Type: command/reply\nReply-Text: -ERR invalid\n\n"[..],
                );
                return false;
            }
        } else if let Some(cmd) = command.strip_prefix("api ") {
            let body = self
                .api_responses
                .lock()
                .get(cmd)
                .cloned()
                .unwrap_or_else(|| "+OK\n".to_string());
            conn.send_raw(
                format!(
                    "Content-Type: api/response\nContent-Length: {}\n\n{body}",
                    body.len()
                )
                .into_bytes(),
            );
        } else if let Some(cmd) = command.strip_prefix("bgapi ") {
            let job_uuid = headers
                .iter()
                .find(|(k, _)| k == "Job-UUID")
                .and_then(|(_, v)| JobUuid::parse(v))
                .unwrap_or_else(JobUuid::generate);
            self.bgapi_log.lock().push((cmd.to_string(), job_uuid));
            conn.send_raw(
                format!(
                    "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {job_uuid}\nJob-UUID: {job_uuid}\n\n"
                )
                .into_bytes(),
            );
        } else {
            // event subscriptions, filters, exit, ...
            conn.send_raw(&b"Content-Type: command/reply\nReply-Text: +OK\n\n"[..]);
        }
        true
    }
}

fn find_blank(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Polls a condition until it holds or the deadline passes.
async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn channel_event(
    conn: &ConnHandle,
    name: &str,
    uuid: SessionUuid,
    direction: &str,
    extra: &[(&str, &str)],
) {
    let uuid_str = uuid.to_string();
    let mut pairs = vec![
        ("Event-Name", name),
        ("Unique-ID", uuid_str.as_str()),
        ("Call-Direction", direction),
        ("Event-Date-Timestamp", "1700000000000000"),
    ];
    pairs.extend_from_slice(extra);
    conn.send_event(&pairs, None);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn auth_success_reaches_ready() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());

    client.connect().await.expect("connect");
    assert!(client.connected());
    client.stop().await;
}

#[tokio::test]
async fn auth_failure_raises_and_closes() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(ConnectConfig::new("127.0.0.1", "wrong").port(engine.port));

    let err = client.connect().await.expect_err("must fail");
    assert!(matches!(err, Error::Auth { .. }), "got {err:?}");
    assert!(!client.connected());
}

#[tokio::test]
async fn synchronous_api_returns_body() {
    let engine = MockEngine::start("secret").await;
    engine.set_api_response("status", "UP 0 years,");

    let client = Client::new(engine.config());
    client.connect().await.expect("connect");

    assert_eq!(client.cmd("status").await.expect("status"), "UP 0 years,");
    client.stop().await;
}

#[tokio::test]
async fn api_error_body_surfaces_as_api_error() {
    let engine = MockEngine::start("secret").await;
    engine.set_api_response("uuid_kill nope", "-ERR No such channel!\n");

    let client = Client::new(engine.config());
    client.connect().await.expect("connect");

    let err = client.cmd("uuid_kill nope").await.expect_err("must fail");
    assert!(matches!(err, Error::Api { .. }));
    client.stop().await;
}

#[tokio::test]
async fn reply_ordering_is_fifo() {
    let engine = MockEngine::start("secret").await;
    engine.set_api_response("first", "one");
    engine.set_api_response("second", "two");

    let client = Arc::new(Client::new(engine.config()));
    client.connect().await.expect("connect");

    // Two commands racing on one connection resolve in send order.
    let c1 = Arc::clone(&client);
    let t1 = tokio::spawn(async move { c1.cmd("first").await });
    let c2 = Arc::clone(&client);
    let t2 = tokio::spawn(async move { c2.cmd("second").await });

    // Each caller must get the reply for its own command, whatever
    // the interleaving.
    assert_eq!(t1.await.unwrap().unwrap(), "one");
    assert_eq!(t2.await.unwrap().unwrap(), "two");
    client.stop().await;
}

#[tokio::test]
async fn bgapi_job_resolves_from_event() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());
    client.connect().await.expect("connect");
    client.start().expect("start");

    let job = client.bgapi("status").await.expect("bgapi");
    let (_, job_uuid) = engine.last_bgapi().expect("bgapi seen");
    assert_eq!(job.uuid(), job_uuid);

    let result_uuid = SessionUuid::generate();
    let uuid_str = job_uuid.to_string();
    engine.connection().send_event(
        &[
            ("Event-Name", names::BACKGROUND_JOB),
            ("Job-UUID", uuid_str.as_str()),
        ],
        Some(&format!("+OK {result_uuid}\n")),
    );

    let result = timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("resolved")
        .expect("ok");
    assert_eq!(result, result_uuid.to_string());
    client.stop().await;
}

#[tokio::test]
async fn failed_job_carries_cause() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());
    client.connect().await.expect("connect");
    client.start().expect("start");

    let job = client.bgapi("originate bad").await.expect("bgapi");
    let uuid_str = job.uuid().to_string();
    engine.connection().send_event(
        &[
            ("Event-Name", names::BACKGROUND_JOB),
            ("Job-UUID", uuid_str.as_str()),
        ],
        Some("-ERR NORMAL_TEMPORARY_FAILURE\n"),
    );

    let err = timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("resolved")
        .expect_err("failed");
    match err {
        Error::JobFailed { cause, .. } => assert_eq!(cause, "NORMAL_TEMPORARY_FAILURE"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(
        client.listener().failed_jobs().get("NORMAL_TEMPORARY_FAILURE"),
        Some(&1)
    );
    client.stop().await;
}

#[tokio::test]
async fn originate_presets_session_uuid_and_plants_vars() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());
    client.connect().await.expect("connect");
    client.start().expect("start");
    client.set_originate_config(
        OriginateConfig::builder("5550100@sut:5060")
            .app("park")
            .build()
            .unwrap(),
    );

    let job = client
        .originate(&AppId::new("load-test"))
        .await
        .expect("originate");
    let session_uuid = job.session_uuid().expect("preset");

    let (cmd, _) = engine.last_bgapi().expect("bgapi seen");
    assert!(cmd.starts_with("originate {"));
    assert!(cmd.contains(&format!("origination_uuid={session_uuid}")));
    assert!(cmd.contains(&format!(
        "sip_h_X-originating_session_uuid={session_uuid}"
    )));
    assert!(cmd.contains(&format!("sip_h_X-switchio_client={}", client.id())));
    assert!(cmd.contains("switchio_app=load-test"));
    client.stop().await;
}

#[tokio::test]
async fn sessions_correlate_into_one_call_and_drain() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());
    client.connect().await.expect("connect");
    client.start().expect("start");

    let caller = SessionUuid::generate();
    let callee = SessionUuid::generate();
    let tag = caller.to_string();
    let conn = engine.connection();

    channel_event(
        &conn,
        names::CHANNEL_CREATE,
        caller,
        "outbound",
        &[("variable_sip_h_X-originating_session_uuid", tag.as_str())],
    );
    channel_event(
        &conn,
        names::CHANNEL_CREATE,
        callee,
        "inbound",
        &[("variable_sip_h_X-originating_session_uuid", tag.as_str())],
    );
    channel_event(&conn, names::CHANNEL_ANSWER, caller, "outbound", &[]);
    channel_event(&conn, names::CHANNEL_ANSWER, callee, "inbound", &[]);

    let listener = client.listener();
    wait_until("both sessions tracked", || listener.count_sessions() == 2).await;
    assert_eq!(listener.count_calls(), 1, "one correlated call");

    let call_uuid = listener.session(caller).unwrap().call_uuid().unwrap();
    let call = listener.call(call_uuid).unwrap();
    assert_eq!(call.session_count(), 2);
    assert_eq!(call.peer_of(caller).unwrap().uuid(), callee);

    for uuid in [caller, callee] {
        channel_event(
            &conn,
            names::CHANNEL_HANGUP,
            uuid,
            "inbound",
            &[("Hangup-Cause", "NORMAL_CLEARING")],
        );
        channel_event(
            &conn,
            names::CHANNEL_HANGUP_COMPLETE,
            uuid,
            "inbound",
            &[("Hangup-Cause", "NORMAL_CLEARING")],
        );
    }

    wait_until("session table drained", || listener.count_sessions() == 0).await;
    assert_eq!(listener.count_calls(), 0);
    assert_eq!(listener.hangup_causes().get("NORMAL_CLEARING"), Some(&2));
    client.stop().await;
}

#[tokio::test]
async fn disconnect_fails_pending_jobs() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());
    client.connect().await.expect("connect");
    client.start().expect("start");

    let job = client.bgapi("status").await.expect("bgapi");
    engine.connection().send_disconnect();

    let err = timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("settled")
        .expect_err("lost");
    assert!(matches!(err, Error::ConnectionClosed), "got {err:?}");

    wait_until("pump stopped", || !client.listener().is_running()).await;
    assert_eq!(client.listener().count_jobs(), 0);
}

#[tokio::test]
async fn double_start_is_idempotent() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());
    client.connect().await.expect("connect");

    client.start().expect("first start");
    client.start().expect("second start is a no-op");
    assert!(client.listener().is_running());
    client.stop().await;
}

#[tokio::test]
async fn timed_out_waiter_does_not_misalign_fifo() {
    let engine = MockEngine::start("secret").await;
    let client = Client::new(engine.config());
    client.connect().await.expect("connect");
    let conn = client.listener().connection().expect("conn");

    // A zero deadline abandons the waiter before the mock's reply
    // can land; the late reply must then be discarded.
    engine.set_api_response("slow", "slow-body");
    engine.set_api_response("fast", "fast-body");

    let err = conn
        .api_timeout("slow", Duration::from_millis(0))
        .await
        .expect_err("abandoned");
    assert!(err.is_timeout());

    // The late "slow" reply must be discarded, not bound to "fast".
    let reply = conn.api("fast").await.expect("fast reply");
    assert_eq!(reply.body_str(), Some("fast-body"));
    client.stop().await;
}
