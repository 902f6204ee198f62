//! Single-connection ESL session.
//!
//! An [`EslSession`] owns one authenticated TCP connection to FreeSWITCH and
//! the background reader task that demultiplexes the byte stream into
//! synchronous command replies, events routed to handlers and background-job
//! results correlated by `Job-UUID`.
//!
//! Sessions do not reconnect; that is the job of
//! [`EslClient`](crate::client::EslClient), which also serializes
//! synchronous callers — an `EslSession` supports one in-flight command at a
//! time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::{
    ALL_EVENTS, BACKGROUND_JOB, CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST,
    CONTENT_TYPE_COMMAND_REPLY, CUSTOM_EVENT, EVENT_BODY_KEY, HEADER_EVENT_NAME,
    HEADER_EVENT_SUBCLASS, HEADER_JOB_UUID, HEADER_REPLY_TEXT, READ_BUF_SIZE,
};
use crate::error::{EslError, EslResult};
use crate::event::event_to_map;
use crate::protocol::{header_val, read_frame, read_headers, url_decode};

/// Callback invoked for a dispatched event, in its own task, with the raw
/// event body and the connection index of the receiving session.
pub type EventHandler = Arc<dyn Fn(String, usize) + Send + Sync>;

/// Event handler table: dispatch key (event name, `ALL`, or
/// `CUSTOM <subclass>`) to the handlers registered for it.
pub type EventHandlerMap = HashMap<String, Vec<EventHandler>>;

/// Session liveness, published on a watch channel. The reader task is the
/// sole writer and publishes `Down` exactly once, right before exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The session is connected and its reader is running.
    Up,
    /// The session ended; the reader has exited.
    Down(DisconnectReason),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Clean EOF on the TCP connection.
    ConnectionClosed,
    /// The read timed out at the transport level.
    ReadTimeout,
    /// Connection reset, aborted or broken pipe.
    ConnectionReset,
    /// The session was torn down after a synchronous reply timed out.
    ReplyTimeout,
    /// The client called disconnect.
    ClientRequested,
    /// The peer violated the framing protocol.
    Protocol(String),
    /// Any other I/O failure (io::Error is not Clone, so the message is kept).
    Io(String),
}

impl DisconnectReason {
    /// Whether the supervisor should attempt to reconnect after this reason.
    ///
    /// EOF, transport timeouts, resets and reply-timeout teardowns are
    /// transient; client-requested shutdown, protocol violations and other
    /// I/O failures are terminal.
    pub fn is_reconnectable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ConnectionClosed
                | DisconnectReason::ReadTimeout
                | DisconnectReason::ConnectionReset
                | DisconnectReason::ReplyTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ReadTimeout => write!(f, "read timed out"),
            DisconnectReason::ConnectionReset => write!(f, "connection reset by peer"),
            DisconnectReason::ReplyTimeout => write!(f, "reply timed out"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
            DisconnectReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

/// Map a transport read error onto a disconnect reason.
fn classify_read_error(err: &io::Error) -> DisconnectReason {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => DisconnectReason::ConnectionClosed,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DisconnectReason::ReadTimeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => DisconnectReason::ConnectionReset,
        _ => DisconnectReason::Io(err.to_string()),
    }
}

/// Parameters for establishing a single session.
pub struct EslSessionConfig {
    /// `host:port` of the FreeSWITCH event socket.
    pub addr: String,
    /// ESL password.
    pub password: String,
    /// Handler table; the keys drive the `event plain` subscription.
    pub event_handlers: Arc<EventHandlerMap>,
    /// `filter <Header> <Value>` pairs installed before subscribing.
    pub event_filters: HashMap<String, Vec<String>>,
    /// Enable background-job support.
    pub bgapi: bool,
    /// Opaque index stamped on handler invocations.
    pub conn_idx: usize,
    /// Bound on synchronous replies; zero waits indefinitely.
    pub reply_timeout: Duration,
}

/// State shared with the reader task.
struct ReaderShared {
    reply_tx: mpsc::Sender<String>,
    status_tx: watch::Sender<SessionStatus>,
    jobs: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
    handlers: Arc<EventHandlerMap>,
    conn_idx: usize,
    shutdown: Arc<Notify>,
    intent: Arc<Mutex<Option<DisconnectReason>>>,
}

/// One authenticated connection plus its reader task.
///
/// A session's lifetime begins when [`connect`](Self::connect) returns and
/// ends exactly once, when the reader exits and publishes
/// [`SessionStatus::Down`].
pub struct EslSession {
    conn_idx: usize,
    reply_timeout: Duration,
    writer: Mutex<OwnedWriteHalf>,
    reply_rx: Mutex<mpsc::Receiver<String>>,
    status_rx: watch::Receiver<SessionStatus>,
    jobs: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
    shutdown: Arc<Notify>,
    intent: Arc<Mutex<Option<DisconnectReason>>>,
}

impl fmt::Debug for EslSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EslSession")
            .field("conn_idx", &self.conn_idx)
            .field("up", &self.is_up())
            .finish()
    }
}

impl EslSession {
    /// Dial, authenticate, install filters, subscribe, and start the reader.
    ///
    /// Any failure during the handshake closes the connection and surfaces
    /// the error; the reader is only spawned once the full handshake
    /// succeeded.
    pub async fn connect(config: &EslSessionConfig) -> EslResult<Arc<Self>> {
        debug!(addr = %config.addr, "connecting to FreeSWITCH");
        let stream = TcpStream::connect(
            config
                .addr
                .as_str(),
        )
        .await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(READ_BUF_SIZE, read_half);

        let greeting = read_headers(&mut reader).await?;
        if !greeting.contains(CONTENT_TYPE_AUTH_REQUEST) {
            return Err(EslError::NoAuthChallenge);
        }

        write_half
            .write_all(format!("auth {}\n\n", config.password).as_bytes())
            .await?;
        debug!("sent command: auth [REDACTED]");
        let reply = read_headers(&mut reader).await?;
        if !reply.contains("Reply-Text: +OK accepted") {
            return Err(EslError::AuthRejected { reply });
        }

        let mut filters = config
            .event_filters
            .clone();
        if config.bgapi && !filters.is_empty() {
            // Keep job-completion events visible through the filter set.
            filters
                .entry(HEADER_EVENT_NAME.to_string())
                .or_default()
                .push(BACKGROUND_JOB.to_string());
        }
        for (header, values) in &filters {
            for value in values {
                write_half
                    .write_all(format!("filter {} {}\n\n", header, value).as_bytes())
                    .await?;
                let reply = read_headers(&mut reader).await?;
                if !reply.contains("Reply-Text: +OK") {
                    return Err(EslError::FilterRejected { reply });
                }
                debug!(header = %header, value = %value, "installed event filter");
            }
        }

        let subscribe = compose_event_command(
            config
                .event_handlers
                .keys()
                .map(String::as_str),
            config.bgapi,
        );
        write_half
            .write_all(format!("{}\n\n", subscribe).as_bytes())
            .await?;
        debug!(command = %subscribe, "subscribing to events");
        let reply = read_headers(&mut reader).await?;
        if !reply.contains("Reply-Text: +OK") {
            return Err(EslError::SubscribeRejected { reply });
        }

        info!(addr = %config.addr, conn_idx = config.conn_idx, "connected and authenticated to FreeSWITCH");

        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Up);
        let jobs = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());
        let intent = Arc::new(Mutex::new(None));

        tokio::spawn(reader_task(
            reader,
            ReaderShared {
                reply_tx,
                status_tx,
                jobs: Arc::clone(&jobs),
                handlers: Arc::clone(&config.event_handlers),
                conn_idx: config.conn_idx,
                shutdown: Arc::clone(&shutdown),
                intent: Arc::clone(&intent),
            },
        ));

        Ok(Arc::new(EslSession {
            conn_idx: config.conn_idx,
            reply_timeout: config.reply_timeout,
            writer: Mutex::new(write_half),
            reply_rx: Mutex::new(reply_rx),
            status_rx,
            jobs,
            shutdown,
            intent,
        }))
    }

    /// Write `payload` to the socket and await the matching reply.
    ///
    /// The payload must carry its own `\n\n` terminator. A reply containing
    /// `-ERR` is returned as [`EslError::CommandFailed`]; the session stays
    /// healthy. If the configured reply timeout elapses, the session is
    /// disconnected (so no stale reply can be misdelivered) and
    /// [`EslError::ReplyTimeout`] is returned.
    ///
    /// One command may be in flight at a time; concurrent callers are
    /// serialized by [`EslClient`](crate::client::EslClient).
    pub async fn send(&self, payload: &str) -> EslResult<String> {
        {
            let mut writer = self
                .writer
                .lock()
                .await;
            writer
                .write_all(payload.as_bytes())
                .await?;
        }

        let mut reply_rx = self
            .reply_rx
            .lock()
            .await;
        let mut status_rx = self
            .status_rx
            .clone();
        if let SessionStatus::Down(reason) = &*status_rx.borrow_and_update() {
            return Err(EslError::Disconnected(reason.clone()));
        }

        let reply_deadline: Pin<Box<dyn Future<Output = ()> + Send>> =
            if self.reply_timeout.is_zero() {
                Box::pin(std::future::pending())
            } else {
                Box::pin(tokio::time::sleep(self.reply_timeout))
            };

        tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(reply) if reply.contains("-ERR") => Err(EslError::CommandFailed {
                    reply_text: reply.trim().to_string(),
                }),
                Some(reply) => Ok(reply),
                None => Err(EslError::Disconnected(self.down_reason())),
            },
            _ = status_rx.changed() => Err(EslError::Disconnected(self.down_reason())),
            _ = reply_deadline => {
                warn!(timeout = ?self.reply_timeout, "no reply within timeout, disconnecting session");
                self.disconnect_with(DisconnectReason::ReplyTimeout).await;
                Err(EslError::ReplyTimeout { timeout: self.reply_timeout })
            }
        }
    }

    /// Submit a background API command.
    ///
    /// Registers a fresh `Job-UUID`, sends
    /// `bgapi <cmd>\nJob-UUID:<uuid>\n\n`, and returns the receiver that
    /// will yield the job's result body when FreeSWITCH emits the matching
    /// `BACKGROUND_JOB` event. A failed submission removes the registration.
    pub async fn send_bgapi(&self, cmd: &str) -> EslResult<oneshot::Receiver<String>> {
        let job_uuid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.jobs
            .lock()
            .await
            .insert(job_uuid.clone(), tx);

        let payload = format!("bgapi {}\nJob-UUID:{}\n\n", cmd, job_uuid);
        match self
            .send(&payload)
            .await
        {
            Ok(_) => Ok(rx),
            Err(err) => {
                self.jobs
                    .lock()
                    .await
                    .remove(&job_uuid);
                Err(err)
            }
        }
    }

    /// Tear the session down. Idempotent.
    ///
    /// The reader observes the shutdown, publishes the terminal status and
    /// exits; the write half is shut down so the peer sees the close.
    pub async fn disconnect(&self) {
        self.disconnect_with(DisconnectReason::ClientRequested)
            .await;
    }

    pub(crate) async fn disconnect_with(&self, reason: DisconnectReason) {
        {
            let mut intent = self
                .intent
                .lock()
                .await;
            if intent.is_none() {
                *intent = Some(reason);
            }
        }
        self.shutdown
            .notify_one();
        let mut writer = self
            .writer
            .lock()
            .await;
        let _ = writer
            .shutdown()
            .await;
    }

    /// Whether the reader is still running.
    pub fn is_up(&self) -> bool {
        matches!(
            &*self
                .status_rx
                .borrow(),
            SessionStatus::Up
        )
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Watch handle observing the session's terminal status.
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx
            .clone()
    }

    /// The index stamped on handler invocations.
    pub fn conn_idx(&self) -> usize {
        self.conn_idx
    }

    fn down_reason(&self) -> DisconnectReason {
        match &*self
            .status_rx
            .borrow()
        {
            SessionStatus::Down(reason) => reason.clone(),
            SessionStatus::Up => DisconnectReason::ConnectionClosed,
        }
    }
}

/// Compose the `event plain` subscription command from the handler keys.
///
/// `ALL` short-circuits to `event plain all`. `CUSTOM`-prefixed keys are
/// stripped of the prefix and their remainders (leading space included)
/// accumulate into a single trailing `CUSTOM` clause; `BACKGROUND_JOB` is
/// appended before it when bgapi is on.
pub(crate) fn compose_event_command<'a, I>(keys: I, bgapi: bool) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut cmd = String::from("event plain");
    let mut custom = String::new();

    for key in keys {
        if key == ALL_EVENTS {
            return String::from("event plain all");
        }
        if let Some(subclasses) = key.strip_prefix(CUSTOM_EVENT) {
            custom.push_str(subclasses);
            continue;
        }
        cmd.push(' ');
        cmd.push_str(key);
    }

    if bgapi {
        cmd.push(' ');
        cmd.push_str(BACKGROUND_JOB);
    }
    if !custom.is_empty() {
        cmd.push(' ');
        cmd.push_str(CUSTOM_EVENT);
        cmd.push_str(&custom);
    }

    cmd
}

/// Reader task entry point. Panics inside the loop still publish a terminal
/// status so the supervisor is not left waiting forever.
async fn reader_task(reader: BufReader<OwnedReadHalf>, shared: ReaderShared) {
    let status_tx = shared
        .status_tx
        .clone();
    let looped = std::panic::AssertUnwindSafe(reader_loop(reader, shared));
    if futures_util::FutureExt::catch_unwind(looped)
        .await
        .is_err()
    {
        error!("reader task panicked");
        let _ = status_tx.send(SessionStatus::Down(DisconnectReason::Protocol(
            "reader task panicked".to_string(),
        )));
    }
}

async fn reader_loop(mut reader: BufReader<OwnedReadHalf>, shared: ReaderShared) {
    let cause = read_until_down(&mut reader, &shared).await;
    // A stored disconnect intent names the real cause; the transport error
    // it provoked is incidental.
    let cause = shared
        .intent
        .lock()
        .await
        .take()
        .unwrap_or(cause);
    debug!(%cause, "reader exiting");
    let _ = shared
        .status_tx
        .send(SessionStatus::Down(cause));
}

async fn read_until_down(
    reader: &mut BufReader<OwnedReadHalf>,
    shared: &ReaderShared,
) -> DisconnectReason {
    loop {
        let frame = tokio::select! {
            frame = read_frame(reader) => frame,
            _ = shared.shutdown.notified() => return DisconnectReason::ClientRequested,
        };

        let (header, body) = match frame {
            Ok(frame) => frame,
            Err(EslError::Io(err)) => {
                warn!("read error: {}", err);
                return classify_read_error(&err);
            }
            Err(err) => {
                warn!("protocol error: {}", err);
                return DisconnectReason::Protocol(err.to_string());
            }
        };

        if header.contains(CONTENT_TYPE_API_RESPONSE) {
            let body = body.unwrap_or_default();
            if shared
                .reply_tx
                .send(body)
                .await
                .is_err()
            {
                return DisconnectReason::ClientRequested;
            }
        } else if header.contains(CONTENT_TYPE_COMMAND_REPLY) {
            let reply = header_val(&header, HEADER_REPLY_TEXT);
            if shared
                .reply_tx
                .send(reply)
                .await
                .is_err()
            {
                return DisconnectReason::ClientRequested;
            }
        } else if let Some(body) = body {
            if !body.is_empty() {
                dispatch_event(shared, body).await;
            }
        }
    }
}

/// Route one event body to the background-job completer or the handler
/// table. Handlers run in their own tasks and must not block the reader.
async fn dispatch_event(shared: &ReaderShared, event: String) {
    let event_name = header_val(&event, HEADER_EVENT_NAME);
    if event_name == BACKGROUND_JOB {
        complete_background_job(shared, &event).await;
        return;
    }

    let mut key = event_name;
    if key == CUSTOM_EVENT {
        let subclass = header_val(&event, HEADER_EVENT_SUBCLASS);
        if !subclass.is_empty() {
            key.push(' ');
            key.push_str(&url_decode(&subclass));
        }
    }

    for name in [key.as_str(), ALL_EVENTS] {
        if let Some(handlers) = shared
            .handlers
            .get(name)
        {
            for handler in handlers {
                let handler = Arc::clone(handler);
                let event = event.clone();
                let conn_idx = shared.conn_idx;
                tokio::spawn(async move { handler(event, conn_idx) });
            }
            return;
        }
    }
    warn!(event_name = %key, "no handler registered for event");
}

/// Complete the background job named by the event's `Job-UUID`.
///
/// The job-map entry is removed under the lock and the result is delivered
/// afterwards; only the first completer for a UUID wins.
async fn complete_background_job(shared: &ReaderShared, event: &str) {
    let mut ev = event_to_map(event);
    let Some(job_uuid) = ev.remove(HEADER_JOB_UUID) else {
        error!("BACKGROUND_JOB event with no Job-UUID");
        return;
    };

    let sender = shared
        .jobs
        .lock()
        .await
        .remove(&job_uuid);
    match sender {
        Some(tx) => {
            let body = ev
                .remove(EVENT_BODY_KEY)
                .unwrap_or_default();
            let _ = tx.send(body);
        }
        None => error!(job_uuid = %job_uuid, "BACKGROUND_JOB with unknown Job-UUID"),
    }
}
