//! Supervised ESL client: lifecycle wrapper over [`EslSession`] with
//! automatic reconnect and terminal-error reporting.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, warn};

use crate::backoff::{default_delay_factory, DelayFactory};
use crate::constants::HEADER_EVENT_SUBCLASS;
use crate::error::{EslError, EslResult};
use crate::session::{EslSession, EslSessionConfig, EventHandlerMap, SessionStatus};

/// Construction options for [`EslClient`] (and, through
/// [`EslPoolConfig`](crate::pool::EslPoolConfig), for every client a pool
/// creates).
#[derive(Clone)]
pub struct EslClientConfig {
    /// `host:port` of the FreeSWITCH event socket.
    pub addr: String,
    /// ESL password.
    pub password: String,
    /// Reconnect attempts after a lost session: `-1` is unbounded, `0`
    /// makes a single attempt with no retries.
    pub reconnects: i32,
    /// Cap on the backoff delay; zero leaves the schedule unclipped.
    pub max_reconnect_interval: Duration,
    /// Bound on synchronous replies; zero waits indefinitely.
    pub reply_timeout: Duration,
    /// Factory producing a fresh backoff generator per reconnect episode.
    pub delay_factory: DelayFactory,
    /// Handler table: event name (`ALL` and `CUSTOM <subclass>` included)
    /// to callbacks. Copied at construction, immutable afterwards.
    pub event_handlers: EventHandlerMap,
    /// `filter <Header> <Value>` pairs installed on every session.
    pub event_filters: HashMap<String, Vec<String>>,
    /// Enable background-job support (adjusts filters and subscription).
    pub bgapi: bool,
    /// Opaque index stamped on handler invocations.
    pub conn_idx: usize,
    /// Receives at most one terminal error per client lifetime, emitted
    /// when reconnect has been abandoned.
    pub stop_error: Option<mpsc::Sender<EslError>>,
}

impl EslClientConfig {
    /// Defaults: unbounded reconnects, 1 min backoff cap, 5 s reply
    /// timeout, Fibonacci backoff, no handlers or filters, bgapi off.
    pub fn new(addr: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            password: password.into(),
            reconnects: -1,
            max_reconnect_interval: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(5),
            delay_factory: default_delay_factory(),
            event_handlers: EventHandlerMap::new(),
            event_filters: HashMap::new(),
            bgapi: false,
            conn_idx: 0,
            stop_error: None,
        }
    }
}

impl fmt::Debug for EslClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EslClientConfig")
            .field("addr", &self.addr)
            .field("password", &"[REDACTED]")
            .field("reconnects", &self.reconnects)
            .field("max_reconnect_interval", &self.max_reconnect_interval)
            .field("reply_timeout", &self.reply_timeout)
            .field(
                "handled_events",
                &self
                    .event_handlers
                    .len(),
            )
            .field("bgapi", &self.bgapi)
            .field("conn_idx", &self.conn_idx)
            .finish()
    }
}

struct ClientInner {
    config: EslClientConfig,
    handlers: Arc<EventHandlerMap>,
    session: RwLock<Option<Arc<EslSession>>>,
    stop_sent: AtomicBool,
}

impl ClientInner {
    fn session_config(&self) -> EslSessionConfig {
        EslSessionConfig {
            addr: self
                .config
                .addr
                .clone(),
            password: self
                .config
                .password
                .clone(),
            event_handlers: Arc::clone(&self.handlers),
            event_filters: self
                .config
                .event_filters
                .clone(),
            bgapi: self.config.bgapi,
            conn_idx: self.config.conn_idx,
            reply_timeout: self.config.reply_timeout,
        }
    }

    /// Emit at most one terminal error per client lifetime.
    fn signal_stop(&self, err: EslError) {
        if self
            .stop_sent
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        if let Some(tx) = &self.config.stop_error {
            let _ = tx.try_send(err);
        }
    }
}

/// Replace the session under the held write lock and bind a watcher to the
/// new session's terminal status.
///
/// Returns a boxed future (rather than `async fn`) to break the recursive
/// opaque-type cycle between `connect_locked` and `watch_session`/
/// `reconnect_locked` (`connect_locked` spawns `watch_session`, which awaits
/// `reconnect_locked`, which awaits `connect_locked`).
fn connect_locked<'a>(
    inner: &'a Arc<ClientInner>,
    guard: &'a mut Option<Arc<EslSession>>,
) -> Pin<Box<dyn Future<Output = EslResult<()>> + Send + 'a>> {
    Box::pin(async move {
        if let Some(old) = guard.take() {
            old.disconnect()
                .await;
        }
        let session = EslSession::connect(&inner.session_config()).await?;
        let status_rx = session.status_watch();
        *guard = Some(Arc::clone(&session));
        tokio::spawn(watch_session(Arc::clone(inner), session, status_rx));
        Ok(())
    })
}

/// Reconnect loop: `reconnects = k ≥ 0` makes `k + 1` attempts separated by
/// `k` backoff delays; `-1` retries forever.
async fn reconnect_locked(
    inner: &Arc<ClientInner>,
    guard: &mut Option<Arc<EslSession>>,
) -> EslResult<()> {
    let mut delay = (inner.config.delay_factory)(
        Duration::from_secs(1),
        inner
            .config
            .max_reconnect_interval,
    );
    let mut attempt: i32 = 0;
    loop {
        match connect_locked(inner, guard).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if inner.config.reconnects >= 0 && attempt > inner.config.reconnects {
                    warn!(attempts = attempt, "reconnect attempts exhausted: {}", err);
                    return Err(err);
                }
                let wait = delay();
                debug!(attempt, wait = ?wait, "connect attempt failed: {}, retrying", err);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

async fn reconnect_if_needed(
    inner: &Arc<ClientInner>,
    guard: &mut Option<Arc<EslSession>>,
) -> EslResult<()> {
    if guard
        .as_ref()
        .is_some_and(|session| session.is_up())
    {
        return Ok(());
    }
    reconnect_locked(inner, guard).await
}

/// Watcher bound to one session: awaits its terminal status, then either
/// reconnects or reports the loss. A watcher that finds the session slot
/// already holding a different session exits silently — the replacement
/// spawned its own watcher.
async fn watch_session(
    inner: Arc<ClientInner>,
    session: Arc<EslSession>,
    mut status_rx: watch::Receiver<SessionStatus>,
) {
    let cause = {
        match status_rx
            .wait_for(|status| matches!(status, SessionStatus::Down(_)))
            .await
        {
            Ok(status) => match &*status {
                SessionStatus::Down(cause) => cause.clone(),
                SessionStatus::Up => return,
            },
            Err(_) => return,
        }
    };

    let mut guard = inner
        .session
        .write()
        .await;
    match guard.as_ref() {
        Some(current) if !Arc::ptr_eq(current, &session) => return,
        _ => {}
    }
    *guard = None;

    if cause.is_reconnectable() {
        info!(%cause, "session lost, reconnecting");
        if reconnect_locked(&inner, &mut guard)
            .await
            .is_err()
        {
            inner.signal_stop(EslError::NotConnected);
        }
    } else {
        debug!(%cause, "session ended");
        inner.signal_stop(EslError::Disconnected(cause));
    }
}

/// Supervised connection handle (cheap to clone).
///
/// The write lock on the session slot serializes all lifecycle transitions
/// and all synchronous sends; replies therefore arrive in caller-submission
/// order.
#[derive(Clone)]
pub struct EslClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for EslClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EslClient")
            .field("addr", &self.inner.config.addr)
            .field("conn_idx", &self.inner.config.conn_idx)
            .finish()
    }
}

impl EslClient {
    /// Connect and return the supervised client. The initial connection
    /// failure is returned directly; reconnect policy only applies to
    /// sessions lost after construction.
    pub async fn connect(config: EslClientConfig) -> EslResult<Self> {
        let handlers = Arc::new(
            config
                .event_handlers
                .clone(),
        );
        let inner = Arc::new(ClientInner {
            config,
            handlers,
            session: RwLock::new(None),
            stop_sent: AtomicBool::new(false),
        });

        {
            let mut guard = inner
                .session
                .write()
                .await;
            connect_locked(&inner, &mut guard).await?;
        }

        Ok(EslClient { inner })
    }

    /// Send a raw command and await its reply. The `\n\n` terminator is
    /// appended here. A dead session is reconnected first, within the
    /// configured reconnect bound.
    pub async fn send_cmd(&self, cmd: &str) -> EslResult<String> {
        let mut guard = self
            .inner
            .session
            .write()
            .await;
        reconnect_if_needed(&self.inner, &mut guard).await?;
        let session = guard
            .as_ref()
            .cloned()
            .ok_or(EslError::NotConnected)?;
        session
            .send(&format!("{}\n\n", cmd))
            .await
    }

    /// Run an `api` command; the reply is the response body.
    pub async fn send_api_cmd(&self, cmd: &str) -> EslResult<String> {
        self.send_cmd(&format!("api {}", cmd))
            .await
    }

    /// Submit a `bgapi` command; the receiver yields the job's result body
    /// when the matching `BACKGROUND_JOB` event arrives.
    pub async fn send_bgapi_cmd(&self, cmd: &str) -> EslResult<oneshot::Receiver<String>> {
        let mut guard = self
            .inner
            .session
            .write()
            .await;
        reconnect_if_needed(&self.inner, &mut guard).await?;
        let session = guard
            .as_ref()
            .cloned()
            .ok_or(EslError::NotConnected)?;
        session
            .send_bgapi(cmd)
            .await
    }

    /// Send a `sendmsg` command to a channel.
    pub async fn send_msg_cmd(&self, uuid: &str, args: &HashMap<String, String>) -> EslResult<()> {
        self.send_msg(uuid, args, None)
            .await
            .map(|_| ())
    }

    /// Send a `sendmsg` command carrying a body.
    pub async fn send_msg_cmd_with_body(
        &self,
        uuid: &str,
        args: &HashMap<String, String>,
        body: &str,
    ) -> EslResult<()> {
        self.send_msg(uuid, args, Some(body))
            .await
            .map(|_| ())
    }

    async fn send_msg(
        &self,
        uuid: &str,
        args: &HashMap<String, String>,
        body: Option<&str>,
    ) -> EslResult<String> {
        if args.is_empty() {
            return Err(EslError::MissingArguments);
        }
        let mut cmd = format!("sendmsg {}", uuid);
        for (name, value) in args {
            cmd.push_str(&format!("\n{}: {}", name, value));
        }
        if let Some(body) = body {
            cmd.push_str(&format!("\n\n{}", body));
        }
        self.send_cmd(&cmd)
            .await
    }

    /// Fire a `sendevent` into FreeSWITCH's event bus.
    ///
    /// `Event-Name` is overridden to `CUSTOM` by the server, so the event
    /// is identified by its `Event-Subclass`, which is forced to `subclass`
    /// here.
    pub async fn send_event(
        &self,
        subclass: &str,
        params: &HashMap<String, String>,
    ) -> EslResult<String> {
        let mut cmd = format!(
            "sendevent {}\n{}: {}",
            subclass, HEADER_EVENT_SUBCLASS, subclass
        );
        for (name, value) in params {
            if name == HEADER_EVENT_SUBCLASS {
                continue;
            }
            cmd.push_str(&format!("\n{}: {}", name, value));
        }
        self.send_cmd(&cmd)
            .await
    }

    /// Whether a live session is currently attached.
    pub async fn connected(&self) -> bool {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .is_some_and(|session| session.is_up())
    }

    /// Replace the current session with a freshly connected one.
    pub async fn reconnect(&self) -> EslResult<()> {
        let mut guard = self
            .inner
            .session
            .write()
            .await;
        connect_locked(&self.inner, &mut guard).await
    }

    /// Tear down the current session and stay disconnected. Idempotent.
    pub async fn disconnect(&self) {
        let session = self
            .inner
            .session
            .write()
            .await
            .take();
        if let Some(session) = session {
            info!("disconnecting from FreeSWITCH");
            session
                .disconnect()
                .await;
        }
    }

    /// The index stamped on handler invocations.
    pub fn conn_idx(&self) -> usize {
        self.inner
            .config
            .conn_idx
    }
}
