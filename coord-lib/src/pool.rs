//! A bounded pool of authenticated connections to the store.

use crate::dial::Dialer;
use crate::health::{HealthRecorder, NoopHealth, HEALTH_SOURCE};
use crate::pubsub::{self, PubSubHandler, Publisher};
use crate::scan::ScanStream;
use crate::shutdown::Shutdown;
use crate::transport::Transport;
use crate::{latency, Connection, Error, PoolConfig, Result, Script};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{error, info, instrument};

/// Handle to the connection pool. Cloning is cheap; all clones share the same
/// connections.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

/// Pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle plus borrowed.
    pub active_count: usize,
    pub idle_count: usize,
    /// Borrows that had to wait for a connection to be returned.
    pub wait_count: u64,
    /// Total time spent in those waits.
    pub wait_duration: Duration,
}

/// State shared between the pool handles and every borrowed connection.
pub(crate) struct Shared {
    dialer: Dialer,

    /// Bounds the number of connections borrowed at the same time.
    limit: Arc<Semaphore>,

    state: Mutex<State>,
}

struct State {
    /// Most recently returned first.
    idle: VecDeque<Idle>,

    /// Idle plus borrowed.
    open: usize,

    closed: bool,

    wait_count: u64,
    wait_duration: Duration,
}

struct Idle {
    transport: Transport,
    since: Instant,
}

impl ConnectionPool {
    /// Build the pool, reporting health to nobody.
    pub async fn start(config: PoolConfig) -> Result<ConnectionPool> {
        ConnectionPool::start_with_health(config, Arc::new(NoopHealth)).await
    }

    /// Build the pool and dial the first connection.
    ///
    /// Dialing is retried every `dial_retry_pause` for up to
    /// `dial_retry_window`; after that the last dial error is returned.
    #[instrument(skip_all, fields(addr = %config.addr()))]
    pub async fn start_with_health(
        config: PoolConfig,
        health: Arc<dyn HealthRecorder>,
    ) -> Result<ConnectionPool> {
        config.validate()?;
        latency::describe();

        let permits = if config.max_active == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_active
        };
        let dialer = Dialer::new(Arc::new(config))?;

        let transport = match dialer.dial_with_retry().await {
            Ok(transport) => transport,
            Err(err) => {
                error!(cause = %err, "unable to reach the store");
                health.report_unhealthy(HEALTH_SOURCE, &err.to_string());
                return Err(err);
            }
        };

        let pool = ConnectionPool {
            shared: Arc::new(Shared {
                dialer,
                limit: Arc::new(Semaphore::new(permits)),
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    open: 1,
                    closed: false,
                    wait_count: 0,
                    wait_duration: Duration::ZERO,
                }),
            }),
        };
        pool.shared.put(transport);

        health.report_healthy(HEALTH_SOURCE);
        info!("connection pool started");
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        self.shared.dialer.config()
    }

    /// Borrow a connection, waiting while `max_active` connections are out.
    ///
    /// The connection goes back to the pool when dropped.
    pub async fn get(&self) -> Result<Connection> {
        let permit = self.acquire_permit().await?;

        if let Some(transport) = self.shared.take_idle() {
            return Ok(Connection::new(self.shared.clone(), transport, permit));
        }

        let transport = self.shared.dialer.dial_with_retry().await?;
        self.shared.lock_state().open += 1;
        Ok(Connection::new(self.shared.clone(), transport, permit))
    }

    /// Like [`ConnectionPool::get`], but gives up with `Error::Cancelled` as
    /// soon as `shutdown` fires.
    pub async fn get_cancellable(&self, shutdown: &mut Shutdown) -> Result<Connection> {
        if shutdown.is_shutdown() {
            return Err(Error::Cancelled);
        }

        tokio::select! {
            biased;
            () = shutdown.recv() => Err(Error::Cancelled),
            res = self.get() => res,
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        match self.shared.limit.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::Closed) => Err(Error::PoolClosed),
            Err(TryAcquireError::NoPermits) => {
                let started = Instant::now();
                let permit = self
                    .shared
                    .limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::PoolClosed)?;

                let mut state = self.shared.lock_state();
                state.wait_count += 1;
                state.wait_duration += started.elapsed();
                Ok(permit)
            }
        }
    }

    /// Close every idle connection and reject further borrows. Borrowed
    /// connections are closed as they come back.
    pub fn stop(&self) {
        self.shared.limit.close();

        let drained = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            state.open -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        drop(drained);

        info!("connection pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        PoolStats {
            active_count: state.open,
            idle_count: state.idle.len(),
            wait_count: state.wait_count,
            wait_duration: state.wait_duration,
        }
    }

    pub fn new_script(&self, key_count: usize, src: impl Into<String>) -> Script {
        Script::new(key_count, src)
    }

    /// Borrow a connection and start a cursor scan over keys matching
    /// `pattern`. See [`Connection::scan`].
    pub async fn scan(&self, pattern: &str, count: usize, shutdown: Shutdown) -> Result<ScanStream> {
        Ok(self.get().await?.scan(pattern, count, shutdown))
    }

    /// Borrow a connection dedicated to publishing.
    pub async fn publisher(&self) -> Result<Publisher> {
        Ok(Publisher::new(self.get().await?))
    }

    /// Subscribe to `channels` on a dedicated connection and dispatch events
    /// to `handler` until `shutdown` fires and every channel is confirmed
    /// unsubscribed, or until the subscription fails.
    ///
    /// The dedicated connection is not counted against `max_active`.
    #[instrument(skip(self, handler, shutdown))]
    pub async fn listen_pubsub_channels<H: PubSubHandler>(
        &self,
        handler: H,
        shutdown: Shutdown,
        channels: &[String],
    ) -> Result<()> {
        if self.shared.lock_state().closed {
            return Err(Error::PoolClosed);
        }

        let transport = self.shared.dialer.dial_with_retry().await?;
        pubsub::listen(transport, self.config().ping_period, handler, shutdown, channels).await
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the most recently returned idle transport, closing those that have
    /// been idle longer than `idle_timeout`.
    fn take_idle(&self) -> Option<Transport> {
        let idle_timeout = self.dialer.config().idle_timeout;
        let mut state = self.lock_state();

        if !idle_timeout.is_zero() {
            while state
                .idle
                .back()
                .is_some_and(|idle| idle.since.elapsed() > idle_timeout)
            {
                state.idle.pop_back();
                state.open -= 1;
            }
        }

        state.idle.pop_front().map(|idle| idle.transport)
    }

    /// Return a healthy transport. It is closed instead when the pool is
    /// stopped or already holds `max_idle` idle connections.
    pub(crate) fn put(&self, transport: Transport) {
        let max_idle = self.dialer.config().max_idle;
        let mut state = self.lock_state();

        if !state.closed && state.idle.len() < max_idle {
            state.idle.push_front(Idle {
                transport,
                since: Instant::now(),
            });
            return;
        }

        state.open -= 1;
    }

    /// Forget a transport that was closed instead of returned.
    pub(crate) fn discard(&self) {
        let mut state = self.lock_state();
        state.open = state.open.saturating_sub(1);
    }
}
