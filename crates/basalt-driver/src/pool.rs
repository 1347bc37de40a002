//! Per-host connection pool.
//!
//! Owns a bounded set of connections to one host: grows lazily from
//! `core_connections_per_host` toward `max_connections_per_host` under
//! saturation pressure, retires defunct connections, and runs the
//! reconnection backoff when the host has no live connections left.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::connection::{ConnId, Connection};
use crate::error::{DriverError, DriverResult};
use crate::host::{Host, HostEvent};
use crate::policy::LoadBalancingPolicy;

/// Why a borrow produced no connection. Distinguishes "host has nothing
/// live" from "everything live is full", so the scheduler can surface
/// `NoHostsAvailable` vs `PoolExhausted` accurately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BorrowError {
    HostDown,
    Saturated,
}

struct PoolInner {
    connections: Vec<Arc<Connection>>,
    /// Connections currently being established (reserved growth slots).
    opening: usize,
}

pub(crate) struct ConnectionPool {
    host: Arc<Host>,
    config: Arc<ClusterConfig>,
    handle: Handle,
    inner: Mutex<PoolInner>,
    /// Caps simultaneous connection establishment.
    creation_permits: Semaphore,
    policy: Arc<dyn LoadBalancingPolicy>,
    events: broadcast::Sender<HostEvent>,
    defunct_tx: mpsc::UnboundedSender<ConnId>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
    reconnecting: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(
        host: Arc<Host>,
        config: Arc<ClusterConfig>,
        handle: Handle,
        policy: Arc<dyn LoadBalancingPolicy>,
        events: broadcast::Sender<HostEvent>,
    ) -> Arc<Self> {
        let (defunct_tx, mut defunct_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            host,
            creation_permits: Semaphore::new(config.max_simultaneous_creation()),
            config,
            handle: handle.clone(),
            inner: Mutex::new(PoolInner {
                connections: Vec::new(),
                opening: 0,
            }),
            policy,
            events,
            defunct_tx,
            next_conn_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        });

        // Retirement listener: connections report their own death here.
        // Held weakly so a dropped pool tears the task down.
        let weak = Arc::downgrade(&pool);
        handle.spawn(async move {
            while let Some(id) = defunct_rx.recv().await {
                let Some(pool) = weak.upgrade() else { return };
                pool.on_connection_defunct(id);
            }
        });

        pool
    }

    /// Initial fill toward the core size. Returns how many connections
    /// came up; zero schedules reconnection immediately.
    pub(crate) async fn warm_up(self: &Arc<Self>) -> usize {
        let mut opened = 0;
        for _ in 0..self.config.core_connections_per_host() {
            match self.add_connection().await {
                Ok(()) => opened += 1,
                Err(err) => {
                    debug!(host = %self.host.address(), error = %err, "warm-up connect failed");
                    break;
                }
            }
        }
        if opened == 0 && !self.is_closed() {
            self.schedule_reconnect();
        }
        opened
    }

    /// Selects the least-busy ready connection, or reports why none is
    /// available. Never blocks; saturation pressure triggers lazy growth
    /// toward the max in the background.
    pub(crate) fn borrow(self: &Arc<Self>) -> Result<Arc<Connection>, BorrowError> {
        if self.is_closed() {
            return Err(BorrowError::HostDown);
        }

        let (result, live, opening, total_in_flight) = {
            let inner = self.inner.lock().expect("pool lock");
            let mut best: Option<&Arc<Connection>> = None;
            let mut any_live = false;
            let mut total_in_flight = 0;
            for conn in &inner.connections {
                if !conn.is_ready() {
                    continue;
                }
                any_live = true;
                let in_flight = conn.in_flight();
                total_in_flight += in_flight;
                if in_flight >= conn.stream_capacity() {
                    continue;
                }
                if best.is_none_or(|b| in_flight < b.in_flight()) {
                    best = Some(conn);
                }
            }
            let result = match best {
                Some(_) if total_in_flight >= self.config.max_pending_requests() => {
                    Err(BorrowError::Saturated)
                }
                Some(conn) => Ok(conn.clone()),
                None if any_live => Err(BorrowError::Saturated),
                None => Err(BorrowError::HostDown),
            };
            (
                result,
                inner.connections.len(),
                inner.opening,
                total_in_flight,
            )
        };

        let pressure = match &result {
            Ok(conn) => conn.in_flight() + 1 >= self.config.saturation_threshold(),
            Err(BorrowError::Saturated) => true,
            Err(BorrowError::HostDown) => false,
        };
        if pressure && live + opening < self.config.max_connections_per_host() {
            debug!(
                host = %self.host.address(),
                live, total_in_flight, "saturation pressure, growing pool"
            );
            let pool = self.clone();
            self.handle.spawn(async move {
                let _ = pool.add_connection().await;
            });
        }

        result
    }

    /// Opens one connection, bounded by `max_simultaneous_creation` and
    /// the pool ceiling. The live count never exceeds the max, even
    /// transiently: the growth slot is reserved before connecting.
    pub(crate) async fn add_connection(self: &Arc<Self>) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::SessionClosed);
        }
        {
            let mut inner = self.inner.lock().expect("pool lock");
            if inner.connections.len() + inner.opening >= self.config.max_connections_per_host() {
                return Err(DriverError::PoolExhausted);
            }
            inner.opening += 1;
        }

        let result = async {
            let _permit = self
                .creation_permits
                .acquire()
                .await
                .map_err(|_| DriverError::SessionClosed)?;
            let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            Connection::open(
                id,
                self.host.clone(),
                self.config.clone(),
                self.handle.clone(),
                self.defunct_tx.clone(),
            )
            .await
        }
        .await;

        let mut inner = self.inner.lock().expect("pool lock");
        inner.opening -= 1;
        match result {
            Ok(conn) => {
                inner.connections.push(conn);
                drop(inner);
                if self.host.set_up(true) {
                    info!(host = %self.host.address(), "host up");
                    self.policy.on_host_up(&self.host);
                    let _ = self.events.send(HostEvent::Up(self.host.address()));
                }
                Ok(())
            }
            Err(err) => {
                drop(inner);
                debug!(host = %self.host.address(), error = %err, "connect attempt failed");
                Err(err)
            }
        }
    }

    /// Retires a dead connection. When the pool drops to zero live
    /// connections the host is marked down and reconnection starts.
    fn on_connection_defunct(self: &Arc<Self>, id: ConnId) {
        let (removed, now_empty) = {
            let mut inner = self.inner.lock().expect("pool lock");
            let removed = inner
                .connections
                .iter()
                .position(|c| c.id() == id)
                .map(|pos| inner.connections.remove(pos));
            (removed, inner.connections.is_empty() && inner.opening == 0)
        };

        let Some(conn) = removed else { return };
        conn.shutdown();
        warn!(conn = id, host = %self.host.address(), "retired defunct connection");

        if now_empty && !self.is_closed() {
            if self.host.set_up(false) {
                warn!(host = %self.host.address(), "host down");
                self.policy.on_host_down(&self.host);
                let _ = self.events.send(HostEvent::Down(self.host.address()));
            }
            self.schedule_reconnect();
        }
    }

    /// Runs the reconnection policy's delay sequence until a connection
    /// succeeds or the pool closes. At most one episode at a time.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.clone();
        self.handle.spawn(async move {
            let mut delays = pool.config.reconnection_policy().delays();
            loop {
                if pool.is_closed() {
                    break;
                }
                let delay = delays.next().unwrap_or(pool.config.reconnect_wait());
                debug!(host = %pool.host.address(), ?delay, "reconnect backoff");
                tokio::time::sleep(delay).await;
                if pool.is_closed() {
                    break;
                }
                match pool.add_connection().await {
                    Ok(()) => {
                        info!(host = %pool.host.address(), "reconnected");
                        break;
                    }
                    Err(err) => {
                        debug!(host = %pool.host.address(), error = %err, "reconnect failed")
                    }
                }
            }
            pool.reconnecting.store(false, Ordering::Release);
        });
    }

    /// Drains every connection (in-flight requests finish, bounded by
    /// the request timeout) and stops all background work.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.creation_permits.close();
        let connections: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock().expect("pool lock");
            inner.connections.drain(..).collect()
        };
        let mut drains = Vec::new();
        for conn in connections {
            let limit = self.config.request_timeout();
            drains.push(self.handle.spawn(async move { conn.drain(limit).await }));
        }
        for drain in drains {
            let _ = drain.await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.inner.lock().expect("pool lock").connections.len()
    }
}
