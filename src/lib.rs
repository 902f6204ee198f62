//! Supervised FreeSWITCH Event Socket (ESL) client for Tokio
//!
//! This crate connects to a running FreeSWITCH server over the Event Socket
//! Layer, authenticates, subscribes to events with optional filters, runs
//! synchronous API commands and asynchronous background jobs (`bgapi`), and
//! delivers incoming events to registered handlers — with automatic
//! reconnect and a bounded connection pool for concurrent callers.
//!
//! # Architecture
//!
//! Three layers, each usable on its own:
//! - [`EslSession`] — one authenticated TCP connection plus the background
//!   reader task that demultiplexes the byte stream into command replies,
//!   handler-dispatched events, and background-job results.
//! - [`EslClient`] (Clone + Send) — supervises a session: reconnects lost
//!   connections on a Fibonacci backoff schedule, serializes synchronous
//!   callers, and reports a terminal error on an optional channel once
//!   reconnecting is abandoned.
//! - [`EslPool`] — a bounded pool of clients with lazy construction, FIFO
//!   reuse and a timeout-bounded acquire.
//!
//! # Examples
//!
//! ## Commands and background jobs
//!
//! ```rust,no_run
//! use fsock_tokio::{EslClient, EslClientConfig, EslError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let mut config = EslClientConfig::new("127.0.0.1:8021", "ClueCon");
//!     config.bgapi = true;
//!
//!     let client = EslClient::connect(config).await?;
//!
//!     let status = client.send_api_cmd("status").await?;
//!     println!("status: {status}");
//!
//!     let job = client.send_bgapi_cmd("uptime").await?;
//!     println!("uptime: {}", job.await.unwrap_or_default());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Event handlers
//!
//! Handlers are registered per event name (`ALL` matches everything, CUSTOM
//! events use `CUSTOM <subclass>`) and receive the raw event body plus the
//! connection index:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fsock_tokio::{event_to_map, EslClient, EslClientConfig, EslError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let mut config = EslClientConfig::new("127.0.0.1:8021", "ClueCon");
//!     config
//!         .event_handlers
//!         .entry("HEARTBEAT".to_string())
//!         .or_default()
//!         .push(Arc::new(|event, conn_idx| {
//!             let headers = event_to_map(&event);
//!             println!("heartbeat on {conn_idx}: {:?}", headers.get("Up-Time"));
//!         }));
//!
//!     let _client = EslClient::connect(config).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Pooled connections
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use fsock_tokio::{EslClientConfig, EslError, EslPool, EslPoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let pool = EslPool::new(EslPoolConfig {
//!         client: EslClientConfig::new("127.0.0.1:8021", "ClueCon"),
//!         max_socks: 4,
//!         max_wait_conn: Duration::from_secs(2),
//!     });
//!
//!     let client = pool.acquire().await?;
//!     let hostname = client.send_api_cmd("hostname").await?;
//!     println!("hostname: {hostname}");
//!     pool.release(client).await;
//!
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod channel;
pub mod client;
pub mod constants;
pub mod error;
pub mod event;
pub mod pool;
pub mod session;

pub(crate) mod protocol;

pub use backoff::{fib_delays, DelayFactory, DelayGenerator};
pub use channel::{parse_channel_data, split_ignore_groups};
pub use client::{EslClient, EslClientConfig};
pub use constants::{DEFAULT_ESL_PORT, EVENT_BODY_KEY};
pub use error::{EslError, EslResult};
pub use event::{event_headers, event_to_map};
pub use pool::{EslPool, EslPoolConfig};
pub use session::{
    DisconnectReason, EslSession, EslSessionConfig, EventHandler, EventHandlerMap, SessionStatus,
};
