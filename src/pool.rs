//! Bounded pool of supervised clients.
//!
//! Capacity is tracked with two bounded channels: `permits` (each token
//! authorizes constructing one [`EslClient`]) and `idle` (FIFO of returned
//! live clients). At all times
//! `permits + idle + checked-out clients == capacity`.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::debug;

use crate::client::{EslClient, EslClientConfig};
use crate::error::{EslError, EslResult};

/// Construction options for [`EslPool`].
pub struct EslPoolConfig {
    /// Forwarded verbatim to every client the pool creates.
    pub client: EslClientConfig,
    /// Maximum number of concurrently live clients.
    pub max_socks: usize,
    /// Bound on [`EslPool::acquire`]; waiting longer yields
    /// [`EslError::PoolTimeout`].
    pub max_wait_conn: Duration,
}

enum Slot {
    Idle(EslClient),
    Permit,
}

struct PoolShared {
    config: EslClientConfig,
    max_wait_conn: Duration,
    permits_tx: mpsc::Sender<()>,
    permits_rx: Mutex<mpsc::Receiver<()>>,
    idle_tx: mpsc::Sender<EslClient>,
    idle_rx: Mutex<mpsc::Receiver<EslClient>>,
}

impl PoolShared {
    /// Race the idle FIFO against a construction permit. Waiting acquirers
    /// queue on the receiver locks, so hand-out order is fair.
    async fn wait_for_slot(&self) -> Option<Slot> {
        let mut idle = self
            .idle_rx
            .lock()
            .await;
        let mut permits = self
            .permits_rx
            .lock()
            .await;
        tokio::select! {
            biased;
            recv = idle.recv() => recv.map(Slot::Idle),
            recv = permits.recv() => recv.map(|_| Slot::Permit),
        }
    }
}

/// Bounded multiplexer over [`EslClient`]s.
///
/// Clients are created lazily, up to the configured capacity, and returned
/// to the pool in FIFO order. A default-constructed pool has zero capacity
/// and is "unconfigured": acquire fails and release is a no-op.
#[derive(Default)]
pub struct EslPool {
    shared: Option<PoolShared>,
}

impl fmt::Debug for EslPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EslPool")
            .field(
                "configured",
                &self
                    .shared
                    .is_some(),
            )
            .finish()
    }
}

impl EslPool {
    /// Build a pool. All permits start available so no acquirer waits for a
    /// construction slot while capacity remains.
    pub fn new(config: EslPoolConfig) -> Self {
        if config.max_socks == 0 {
            return Self { shared: None };
        }
        let (permits_tx, permits_rx) = mpsc::channel(config.max_socks);
        for _ in 0..config.max_socks {
            let _ = permits_tx.try_send(());
        }
        let (idle_tx, idle_rx) = mpsc::channel(config.max_socks);
        Self {
            shared: Some(PoolShared {
                config: config.client,
                max_wait_conn: config.max_wait_conn,
                permits_tx,
                permits_rx: Mutex::new(permits_rx),
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
            }),
        }
    }

    /// Take a client from the pool.
    ///
    /// An idle client is preferred when one is ready. Otherwise this races
    /// the first returned client against a construction permit, bounded by
    /// the configured maximum wait; winning a permit constructs a fresh
    /// client outside that bound. A failed construction returns its permit
    /// before surfacing the error, so capacity is never leaked.
    pub async fn acquire(&self) -> EslResult<EslClient> {
        let Some(shared) = &self.shared else {
            return Err(EslError::PoolUnconfigured);
        };

        // Fast path: hand out a ready client without racing the permits.
        if let Ok(mut idle) = shared
            .idle_rx
            .try_lock()
        {
            if let Ok(client) = idle.try_recv() {
                return Ok(client);
            }
        }

        let slot = timeout(shared.max_wait_conn, shared.wait_for_slot())
            .await
            .map_err(|_| EslError::PoolTimeout)?;

        match slot {
            Some(Slot::Idle(client)) => Ok(client),
            Some(Slot::Permit) => {
                match EslClient::connect(
                    shared
                        .config
                        .clone(),
                )
                .await
                {
                    Ok(client) => Ok(client),
                    Err(err) => {
                        let _ = shared
                            .permits_tx
                            .try_send(());
                        Err(err)
                    }
                }
            }
            None => Err(EslError::PoolUnconfigured),
        }
    }

    /// Return a client to the pool.
    ///
    /// A client that is no longer connected reclaims capacity as a permit
    /// so a fresh client can be constructed in its place; a live client is
    /// enqueued for the next acquirer.
    pub async fn release(&self, client: EslClient) {
        let Some(shared) = &self.shared else {
            return;
        };
        if !client
            .connected()
            .await
        {
            let _ = shared
                .permits_tx
                .try_send(());
            return;
        }
        if shared
            .idle_tx
            .try_send(client)
            .is_err()
        {
            // Cannot happen while the capacity invariant holds; reclaim the
            // slot as a permit rather than lose it.
            debug!("idle queue full on release, reclaiming slot as permit");
            let _ = shared
                .permits_tx
                .try_send(());
        }
    }
}
