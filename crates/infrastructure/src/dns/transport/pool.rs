use super::connection::PooledConnection;
use super::dialer::Dialer;
use ferrous_upstream_domain::{DomainError, UpstreamConfig};
use hickory_proto::op::Message;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Counters for one connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections dialed since the pool was created.
    pub dialed: u64,
    /// Exchanges that reused an already open connection.
    pub reused: u64,
    /// Connections currently open.
    pub live: usize,
    /// Queries written and still awaiting a response.
    pub pending: usize,
}

/// Limits applied by a [`ConnectionPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_conns: usize,
    /// Zero disables reuse: every connection is closed after one exchange.
    pub idle_timeout: Duration,
    pub max_pipelined_queries: usize,
    pub timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_conns: config.max_conns.max(1),
            idle_timeout: config.idle_timeout(),
            max_pipelined_queries: config.max_pipelined_queries.max(1),
            timeout: config.timeout(),
        }
    }

    pub fn reuse_enabled(&self) -> bool {
        !self.idle_timeout.is_zero()
    }
}

struct PoolInner {
    server: Arc<str>,
    protocol: &'static str,
    dialer: Arc<dyn Dialer>,
    settings: PoolSettings,
    conns: Mutex<Vec<Arc<PooledConnection>>>,
    permits: Arc<Semaphore>,
    released: Notify,
    next_conn_id: AtomicU64,
    dialed: AtomicU64,
    reused: AtomicU64,
    sweeper_started: AtomicBool,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn lock_conns(&self) -> MutexGuard<'_, Vec<Arc<PooledConnection>>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops closed connections and closes those idle past the timeout.
    fn prune(&self, conns: &mut Vec<Arc<PooledConnection>>) -> usize {
        let idle_timeout = self.settings.idle_timeout;
        let before = conns.len();
        conns.retain(|conn| {
            if conn.is_closed() {
                return false;
            }
            if conn.in_flight() == 0 && conn.idle_for() > idle_timeout {
                trace!(conn_id = conn.id(), server = %self.server, "Closing idle upstream connection");
                conn.close();
                return false;
            }
            true
        });
        before - conns.len()
    }

    fn sweep_idle(&self) -> usize {
        let mut conns = self.lock_conns();
        self.prune(&mut conns)
    }

    /// Least-loaded live connection with pipelining headroom.
    fn try_reuse(&self) -> Option<Arc<PooledConnection>> {
        if !self.settings.reuse_enabled() {
            return None;
        }
        let mut conns = self.lock_conns();
        self.prune(&mut conns);
        let conn = conns
            .iter()
            .filter(|conn| conn.in_flight() < self.settings.max_pipelined_queries)
            .min_by_key(|conn| conn.in_flight())?;
        conn.reserve();
        Some(Arc::clone(conn))
    }

    /// Closes one unused connection so its permit can serve a fresh dial.
    fn evict_one_idle(&self) -> bool {
        let mut conns = self.lock_conns();
        match conns.iter().position(|conn| conn.in_flight() == 0) {
            Some(index) => {
                let conn = conns.swap_remove(index);
                conn.close();
                true
            }
            None => false,
        }
    }

    fn close_all(&self, conns: &mut Vec<Arc<PooledConnection>>) {
        for conn in conns.drain(..) {
            conn.close();
        }
    }

    fn timeout_error(&self) -> DomainError {
        DomainError::TransportTimeout {
            server: self.server.to_string(),
        }
    }

    fn closed_error(&self) -> DomainError {
        DomainError::TransportConnectionClosed {
            server: self.server.to_string(),
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let conns = self.conns.get_mut().unwrap_or_else(PoisonError::into_inner);
        for conn in conns.drain(..) {
            conn.close();
        }
    }
}

/// A reservation of one exchange slot on a pooled connection.
pub struct ConnectionLease {
    conn: Arc<PooledConnection>,
    pool: Arc<PoolInner>,
}

impl ConnectionLease {
    pub fn connection(&self) -> &Arc<PooledConnection> {
        &self.conn
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.conn.release();
        if !self.pool.settings.reuse_enabled() {
            self.conn.close();
        }
        self.pool.released.notify_waiters();
    }
}

/// Bounded pool of connections to one upstream.
///
/// Enforces `max_conns` live sockets, reuses connections while they are
/// within the idle timeout and have pipelining headroom, and evicts idle
/// connections on access and from a background sweeper.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(protocol: &'static str, dialer: Arc<dyn Dialer>, settings: PoolSettings) -> Self {
        let server: Arc<str> = Arc::from(dialer.server());
        Self {
            inner: Arc::new(PoolInner {
                server,
                protocol,
                dialer,
                settings,
                conns: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(settings.max_conns)),
                released: Notify::new(),
                next_conn_id: AtomicU64::new(1),
                dialed: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                sweeper_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn server(&self) -> &str {
        &self.inner.server
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Sends `query` and waits for its response within the configured timeout.
    ///
    /// A failure of the connection itself is retried once on a newly dialed
    /// connection. Timeouts and dial failures are returned as is.
    pub async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        let deadline = Instant::now() + self.inner.settings.timeout;

        match self.exchange_once(query, deadline, false).await {
            Err(e) if e.is_connection_error() && Instant::now() < deadline => {
                debug!(
                    server = %self.inner.server,
                    protocol = self.inner.protocol,
                    error = %e,
                    "Upstream connection failed, retrying on a new connection"
                );
                self.exchange_once(query, deadline, true).await
            }
            result => result,
        }
    }

    async fn exchange_once(
        &self,
        query: &Message,
        deadline: Instant,
        fresh: bool,
    ) -> Result<Message, DomainError> {
        let lease = self.acquire(deadline, fresh).await?;
        let pending = lease.connection().send(query, deadline).await?;
        pending.wait(deadline).await
    }

    /// Reserves a slot on a reusable connection or a newly dialed one.
    ///
    /// At capacity, waits until a slot is released or a connection closes,
    /// bounded by `deadline`.
    pub async fn acquire(&self, deadline: Instant, fresh: bool) -> Result<ConnectionLease, DomainError> {
        let inner = &self.inner;
        loop {
            if inner.shutdown.is_cancelled() {
                return Err(inner.closed_error());
            }

            let released = inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if !fresh {
                if let Some(conn) = inner.try_reuse() {
                    inner.reused.fetch_add(1, Ordering::Relaxed);
                    trace!(conn_id = conn.id(), server = %inner.server, "Reusing upstream connection");
                    return Ok(ConnectionLease {
                        conn,
                        pool: Arc::clone(inner),
                    });
                }
            }

            match Arc::clone(&inner.permits).try_acquire_owned() {
                Ok(permit) => return self.dial(permit, deadline).await,
                Err(TryAcquireError::Closed) => return Err(inner.closed_error()),
                Err(TryAcquireError::NoPermits) => {}
            }

            if fresh && inner.evict_one_idle() {
                trace!(server = %inner.server, "Evicted idle connection to make room for a fresh dial");
            }

            tokio::select! {
                _ = &mut released => {}
                permit = Arc::clone(&inner.permits).acquire_owned() => {
                    let permit = permit.map_err(|_| inner.closed_error())?;
                    return self.dial(permit, deadline).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(server = %inner.server, max_conns = inner.settings.max_conns, "Timed out waiting for a free upstream connection");
                    return Err(inner.timeout_error());
                }
                _ = inner.shutdown.cancelled() => return Err(inner.closed_error()),
            }
        }
    }

    async fn dial(
        &self,
        permit: tokio::sync::OwnedSemaphorePermit,
        deadline: Instant,
    ) -> Result<ConnectionLease, DomainError> {
        let inner = &self.inner;
        self.ensure_sweeper();

        let raw = tokio::time::timeout_at(deadline, inner.dialer.dial())
            .await
            .map_err(|_| inner.timeout_error())??;

        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = PooledConnection::spawn(conn_id, Arc::clone(&inner.server), raw, Some(permit));
        conn.reserve();
        inner.dialed.fetch_add(1, Ordering::Relaxed);

        inner.lock_conns().push(Arc::clone(&conn));
        inner.released.notify_waiters();

        debug!(
            conn_id = conn_id,
            server = %inner.server,
            protocol = inner.protocol,
            "Dialed upstream connection"
        );

        Ok(ConnectionLease {
            conn,
            pool: Arc::clone(inner),
        })
    }

    /// Starts the idle sweeper on first dial. It holds only a weak reference
    /// and stops when the pool is closed or dropped.
    fn ensure_sweeper(&self) {
        let inner = &self.inner;
        if !inner.settings.reuse_enabled() || inner.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak: Weak<PoolInner> = Arc::downgrade(inner);
        let shutdown = inner.shutdown.clone();
        let period = (inner.settings.idle_timeout / 2).max(MIN_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let evicted = inner.sweep_idle();
                        if evicted > 0 {
                            debug!(server = %inner.server, evicted = evicted, "Evicted idle upstream connections");
                        }
                    }
                }
            }
        });
    }

    pub fn stats(&self) -> PoolStats {
        let conns = self.inner.lock_conns();
        let live: Vec<_> = conns.iter().filter(|conn| !conn.is_closed()).collect();
        PoolStats {
            dialed: self.inner.dialed.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            live: live.len(),
            pending: live.iter().map(|conn| conn.pending_count()).sum(),
        }
    }

    /// Closes every connection and rejects further exchanges.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.permits.close();
        let mut conns = inner.lock_conns();
        inner.close_all(&mut conns);
        debug!(server = %inner.server, protocol = inner.protocol, "Upstream connection pool closed");
    }
}
