//! Integration tests against a scripted in-process peer playing FreeSWITCH.
//!
//! Each test spawns a `TcpListener` whose script speaks just enough of the
//! ESL wire protocol (auth challenge, command replies, event frames) to
//! exercise one behavior end to end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use fsock_tokio::{
    EslClient, EslClientConfig, EslError, EslPool, EslPoolConfig,
};

const PASSWORD: &str = "ClueCon";

struct MockPeer {
    stream: BufReader<TcpStream>,
}

impl MockPeer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Read one client command: lines up to the blank-line terminator.
    /// Returns the accumulated lines (trailing `\n` kept) or what was read
    /// so far if the client closed the connection.
    async fn read_command(&mut self) -> String {
        let mut cmd = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .stream
                .read_line(&mut line)
                .await
                .unwrap();
            if n == 0 || line.trim().is_empty() {
                return cmd;
            }
            cmd.push_str(&line);
        }
    }

    async fn write(&mut self, data: &str) {
        self.stream
            .get_mut()
            .write_all(data.as_bytes())
            .await
            .unwrap();
    }

    /// Play the server side of a full handshake: auth challenge, auth
    /// acceptance, then `+OK` to every command up to and including the
    /// `event plain` subscription.
    async fn handshake(&mut self) {
        self.write("Content-Type: auth/request\n\n")
            .await;
        let auth = self
            .read_command()
            .await;
        assert!(auth.starts_with("auth "), "expected auth, got: {auth:?}");
        self.write("Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
            .await;
        loop {
            let cmd = self
                .read_command()
                .await;
            self.write("Content-Type: command/reply\nReply-Text: +OK\n\n")
                .await;
            if cmd.starts_with("event plain") {
                return;
            }
        }
    }
}

fn event_frame(body: &str) -> String {
    format!(
        "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
        body.len(),
        body
    )
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener
        .local_addr()
        .unwrap();
    (listener, addr)
}

fn config(addr: SocketAddr) -> EslClientConfig {
    let mut config = EslClientConfig::new(addr.to_string(), PASSWORD);
    config.reconnects = 0;
    config
}

#[tokio::test]
async fn connect_handshake_and_api_command() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;

        let cmd = peer
            .read_command()
            .await;
        assert_eq!(cmd, "api status\n");
        let body = "UP 0 years, 0 days, 0 hours\n";
        peer.write(&format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}",
            body.len(),
            body
        ))
        .await;

        // Hold the connection open until the client goes away.
        let _ = peer
            .read_command()
            .await;
    });

    let client = EslClient::connect(config(addr))
        .await
        .unwrap();
    assert!(client
        .connected()
        .await);

    let reply = timeout(Duration::from_secs(5), client.send_api_cmd("status"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "UP 0 years, 0 days, 0 hours\n");
}

#[tokio::test]
async fn command_reply_publishes_reply_text() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;

        let _ = peer
            .read_command()
            .await;
        peer.write("Content-Type: command/reply\nReply-Text: +OK events nixed\n\n")
            .await;
        let _ = peer
            .read_command()
            .await;
    });

    let client = EslClient::connect(config(addr))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), client.send_cmd("noevents"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "+OK events nixed");
}

#[tokio::test]
async fn err_reply_becomes_command_failed() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;

        let _ = peer
            .read_command()
            .await;
        peer.write("Content-Type: command/reply\nReply-Text: -ERR no such channel\n\n")
            .await;
        let _ = peer
            .read_command()
            .await;
    });

    let client = EslClient::connect(config(addr))
        .await
        .unwrap();
    let err = timeout(Duration::from_secs(5), client.send_cmd("uuid_kill nope"))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        EslError::CommandFailed { reply_text } => {
            assert_eq!(reply_text, "-ERR no such channel");
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }
    // A command failure leaves the session healthy.
    assert!(client
        .connected()
        .await);
}

#[tokio::test]
async fn auth_rejection_surfaces_in_constructor() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.write("Content-Type: auth/request\n\n")
            .await;
        let _ = peer
            .read_command()
            .await;
        peer.write("Content-Type: command/reply\nReply-Text: -ERR bad\n\n")
            .await;
    });

    let err = EslClient::connect(config(addr))
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("unexpected auth reply received"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn missing_auth_challenge_surfaces_in_constructor() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.write("Content-Type: command/reply\n\n")
            .await;
    });

    let err = EslClient::connect(config(addr))
        .await
        .unwrap_err();
    assert!(matches!(err, EslError::NoAuthChallenge));
}

#[tokio::test]
async fn filters_install_before_subscription() {
    let (listener, addr) = bind().await;
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.write("Content-Type: auth/request\n\n")
            .await;
        let _ = peer
            .read_command()
            .await;
        peer.write("Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
            .await;
        loop {
            let cmd = peer
                .read_command()
                .await;
            let done = cmd.starts_with("event plain");
            cmd_tx
                .send(cmd)
                .unwrap();
            peer.write("Content-Type: command/reply\nReply-Text: +OK\n\n")
                .await;
            if done {
                break;
            }
        }
        let _ = peer
            .read_command()
            .await;
    });

    let mut config = config(addr);
    config.bgapi = true;
    config
        .event_filters
        .insert("Event-Name".to_string(), vec!["CHANNEL_ANSWER".to_string()]);
    let _client = EslClient::connect(config)
        .await
        .unwrap();

    // bgapi appends BACKGROUND_JOB to the Event-Name filter values and to
    // the subscription; filters precede the event plain command.
    assert_eq!(
        cmd_rx
            .recv()
            .await
            .unwrap(),
        "filter Event-Name CHANNEL_ANSWER\n"
    );
    assert_eq!(
        cmd_rx
            .recv()
            .await
            .unwrap(),
        "filter Event-Name BACKGROUND_JOB\n"
    );
    assert_eq!(
        cmd_rx
            .recv()
            .await
            .unwrap(),
        "event plain BACKGROUND_JOB\n"
    );
}

#[tokio::test]
async fn bgapi_job_result_is_correlated() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;

        let cmd = peer
            .read_command()
            .await;
        assert!(cmd.starts_with("bgapi status\n"), "got: {cmd:?}");
        let job_uuid = cmd
            .lines()
            .find_map(|line| line.strip_prefix("Job-UUID:"))
            .unwrap()
            .trim()
            .to_string();
        peer.write(&format!(
            "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {job_uuid}\n\n"
        ))
        .await;

        let body = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: {job_uuid}\nContent-Length: 19\n\nUP 0 years, 0 days\n"
        );
        peer.write(&event_frame(&body))
            .await;

        let _ = peer
            .read_command()
            .await;
    });

    let mut config = config(addr);
    config.bgapi = true;
    let client = EslClient::connect(config)
        .await
        .unwrap();

    let job = timeout(Duration::from_secs(5), client.send_bgapi_cmd("status"))
        .await
        .unwrap()
        .unwrap();
    let body = timeout(Duration::from_secs(5), job)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, "UP 0 years, 0 days\n");
}

#[tokio::test]
async fn events_dispatch_to_handlers_with_conn_idx() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;

        peer.write(&event_frame("Event-Name: HEARTBEAT\nUp-Time: 42\n"))
            .await;
        peer.write(&event_frame(
            "Event-Name: CUSTOM\nEvent-Subclass: sofia%3A%3Aregister\nUser: 1001\n",
        ))
        .await;

        let _ = peer
            .read_command()
            .await;
    });

    let (event_tx, mut event_rx) = mpsc::channel::<(String, String, usize)>(8);
    let mut config = config(addr);
    config.conn_idx = 7;
    let heartbeat_tx = event_tx.clone();
    config
        .event_handlers
        .entry("HEARTBEAT".to_string())
        .or_default()
        .push(Arc::new(move |event, idx| {
            let _ = heartbeat_tx.try_send(("HEARTBEAT".to_string(), event, idx));
        }));
    let custom_tx = event_tx;
    config
        .event_handlers
        .entry("CUSTOM sofia::register".to_string())
        .or_default()
        .push(Arc::new(move |event, idx| {
            let _ = custom_tx.try_send(("CUSTOM".to_string(), event, idx));
        }));

    let _client = EslClient::connect(config)
        .await
        .unwrap();

    let mut seen = HashMap::new();
    for _ in 0..2 {
        let (kind, event, idx) = timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(idx, 7);
        seen.insert(kind, event);
    }
    assert!(seen["HEARTBEAT"].contains("Up-Time: 42"));
    assert!(seen["CUSTOM"].contains("User: 1001"));
}

#[tokio::test]
async fn reply_timeout_disconnects_the_session() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;

        // Swallow the command and never reply.
        let _ = peer
            .read_command()
            .await;
        let _ = peer
            .read_command()
            .await;
    });

    let mut config = config(addr);
    config.reply_timeout = Duration::from_millis(100);
    let client = EslClient::connect(config)
        .await
        .unwrap();

    let err = timeout(Duration::from_secs(5), client.send_cmd("noop"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, EslError::ReplyTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn exhausted_reconnect_emits_one_stop_error() {
    let (listener, addr) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;
        // Drop the connection and the listener: the session dies with EOF
        // and every reconnect attempt is refused.
    });

    let (stop_tx, mut stop_rx) = mpsc::channel(4);
    let mut config = config(addr);
    config.reconnects = 2;
    config.delay_factory = Arc::new(|_unit, _max| -> fsock_tokio::DelayGenerator {
        Box::new(|| Duration::from_millis(1))
    });
    config.stop_error = Some(stop_tx);

    let client = EslClient::connect(config)
        .await
        .unwrap();
    server
        .await
        .unwrap();

    let err = timeout(Duration::from_secs(5), stop_rx.recv())
        .await
        .expect("expected a stop error")
        .unwrap();
    assert!(matches!(err, EslError::NotConnected), "got {err:?}");
    assert!(!client
        .connected()
        .await);

    // Exactly one emission per client lifetime.
    assert!(timeout(Duration::from_millis(200), stop_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn client_disconnect_reports_terminal_reason() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener
            .accept()
            .await
            .unwrap();
        let mut peer = MockPeer::new(stream);
        peer.handshake()
            .await;
        let _ = peer
            .read_command()
            .await;
    });

    let (stop_tx, mut stop_rx) = mpsc::channel(4);
    let mut config = config(addr);
    config.stop_error = Some(stop_tx);

    let client = EslClient::connect(config)
        .await
        .unwrap();
    client
        .disconnect()
        .await;
    // Idempotent.
    client
        .disconnect()
        .await;

    let err = timeout(Duration::from_secs(5), stop_rx.recv())
        .await
        .expect("expected a stop error")
        .unwrap();
    assert!(matches!(err, EslError::Disconnected(_)), "got {err:?}");
    assert!(!client
        .connected()
        .await);
}

async fn spawn_handshake_server(conns: usize) -> SocketAddr {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let mut held = Vec::new();
        for _ in 0..conns {
            let (stream, _) = listener
                .accept()
                .await
                .unwrap();
            let mut peer = MockPeer::new(stream);
            peer.handshake()
                .await;
            held.push(peer);
        }
        std::future::pending::<()>().await;
    });
    addr
}

#[tokio::test]
async fn pool_times_out_when_saturated() {
    let addr = spawn_handshake_server(2).await;
    let pool = EslPool::new(EslPoolConfig {
        client: config(addr),
        max_socks: 2,
        max_wait_conn: Duration::from_millis(20),
    });

    let _first = pool
        .acquire()
        .await
        .unwrap();
    let _second = pool
        .acquire()
        .await
        .unwrap();

    let started = Instant::now();
    let err = pool
        .acquire()
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, EslError::PoolTimeout), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(20), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn pool_reuses_released_clients_and_reclaims_permits() {
    let addr = spawn_handshake_server(2).await;
    let pool = EslPool::new(EslPoolConfig {
        client: config(addr),
        max_socks: 1,
        max_wait_conn: Duration::from_millis(500),
    });

    // First acquire constructs; release and re-acquire must reuse it
    // without a second connection (the server only handshakes on demand).
    let client = pool
        .acquire()
        .await
        .unwrap();
    pool.release(client)
        .await;
    let client = pool
        .acquire()
        .await
        .unwrap();
    assert!(client
        .connected()
        .await);

    // Releasing a dead client reclaims the slot as a permit, and the next
    // acquire constructs a fresh client.
    client
        .disconnect()
        .await;
    pool.release(client)
        .await;
    let replacement = pool
        .acquire()
        .await
        .unwrap();
    assert!(replacement
        .connected()
        .await);
}
