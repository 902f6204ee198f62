//! Error types for ESL operations

use std::time::Duration;
use thiserror::Error;

use crate::session::DisconnectReason;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors surfaced by sessions, clients and pools.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// TCP dial or transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server's greeting did not contain `auth/request`.
    #[error("no auth challenge received")]
    NoAuthChallenge,

    /// The reply to `auth` did not contain `Reply-Text: +OK accepted`.
    #[error("unexpected auth reply received: <{reply}>")]
    AuthRejected { reply: String },

    /// The reply to a `filter` command did not contain `Reply-Text: +OK`.
    #[error("unexpected filter reply received: <{reply}>")]
    FilterRejected { reply: String },

    /// The reply to the `event plain` subscription did not contain `Reply-Text: +OK`.
    #[error("unexpected event-subscription reply received: <{reply}>")]
    SubscribeRejected { reply: String },

    /// A frame advertised a non-numeric `Content-Length`.
    #[error("invalid Content-Length header: <{value}>")]
    InvalidContentLength { value: String },

    /// FreeSWITCH answered a command with `-ERR`.
    #[error("{reply_text}")]
    CommandFailed { reply_text: String },

    /// No reply arrived within the configured reply timeout. The session is
    /// disconnected so the late reply cannot be misdelivered.
    #[error("no reply received within {timeout:?}")]
    ReplyTimeout { timeout: Duration },

    /// The session went down while an operation was in flight, or was
    /// terminated for a non-recoverable reason.
    #[error("disconnected: {0}")]
    Disconnected(DisconnectReason),

    /// Reconnect attempts were exhausted without restoring the session.
    #[error("not connected to FreeSWITCH")]
    NotConnected,

    /// `sendmsg`/`sendevent` called without any arguments.
    #[error("need command arguments")]
    MissingArguments,

    /// Pool acquisition exceeded the configured maximum wait.
    #[error("connection pool timeout")]
    PoolTimeout,

    /// Operation on a pool constructed with zero capacity.
    #[error("unconfigured connection pool")]
    PoolUnconfigured,
}
