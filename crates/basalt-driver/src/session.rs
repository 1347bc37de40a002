//! Session — the request scheduler and public entry point.
//!
//! A session owns the reactor runtime (a small fixed pool of worker
//! threads handling all socket and timer events), one connection pool
//! per host, and the configured policies. Callers hand it requests from
//! any thread; completions come back fulfilled from reactor threads.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use basalt_protocol::{Request, Response};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::completion::Completion;
use crate::config::ClusterConfig;
use crate::error::{DriverError, DriverResult};
use crate::host::{Host, HostEvent};
use crate::policy::LoadBalancingPolicy;
use crate::pool::{BorrowError, ConnectionPool};

/// Handle to an in-flight request.
pub type RequestCompletion = Arc<Completion<Response>>;

pub struct Session {
    runtime: Option<Runtime>,
    handle: Handle,
    pools: HashMap<SocketAddr, Arc<ConnectionPool>>,
    policy: Arc<dyn LoadBalancingPolicy>,
    config: Arc<ClusterConfig>,
    accepting: AtomicBool,
    events: broadcast::Sender<HostEvent>,
}

impl Session {
    /// Builds the reactor runtime, resolves contact points, and warms
    /// every pool toward its core size. Fails with `NoHostsAvailable`
    /// when not a single contact point yields a live connection.
    pub fn connect(config: ClusterConfig) -> DriverResult<Session> {
        let config = Arc::new(config);
        let addresses = resolve_contact_points(&config)?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads())
            .thread_name("basalt-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let hosts: Vec<Arc<Host>> = addresses.into_iter().map(|a| Arc::new(Host::new(a))).collect();
        let policy = config.load_balancing_policy().clone();
        policy.init(&hosts);

        let (events, _) = broadcast::channel(config.queue_size_event());
        let pools: HashMap<SocketAddr, Arc<ConnectionPool>> = hosts
            .iter()
            .map(|host| {
                (
                    host.address(),
                    ConnectionPool::new(
                        host.clone(),
                        config.clone(),
                        handle.clone(),
                        policy.clone(),
                        events.clone(),
                    ),
                )
            })
            .collect();

        let live = handle.block_on(async {
            let mut live = 0;
            for pool in pools.values() {
                live += pool.warm_up().await;
            }
            live
        });
        if live == 0 {
            warn!("no contact point produced a live connection");
            runtime.shutdown_background();
            return Err(DriverError::NoHostsAvailable);
        }
        info!(connections = live, hosts = pools.len(), "session connected");

        Ok(Session {
            runtime: Some(runtime),
            handle,
            pools,
            policy,
            config,
            accepting: AtomicBool::new(true),
            events,
        })
    }

    /// Executes a query. Sugar over [`Session::request`].
    pub fn execute(&self, query: impl Into<String>) -> RequestCompletion {
        self.request(Request::Query { text: query.into() })
    }

    /// Dispatches a request along a fresh query plan.
    ///
    /// Walks the plan host by host and dispatches on the first pool
    /// that accepts; hosts that are down or saturated advance the walk.
    /// An exhausted plan fails the completion immediately — exhaustion
    /// is never retried silently, since that could mask cluster-wide
    /// unavailability. The returned completion always reaches a
    /// terminal state.
    pub fn request(&self, request: Request) -> RequestCompletion {
        let completion: RequestCompletion = Arc::new(Completion::new());
        if !self.accepting.load(Ordering::Acquire) {
            completion.try_complete(Err(DriverError::SessionClosed));
            return completion;
        }

        let plan = self.policy.new_query_plan();
        let mut saw_saturated = false;
        let mut dispatched = false;
        for host in &plan {
            let Some(pool) = self.pools.get(&host.address()) else {
                continue;
            };
            match pool.borrow() {
                Ok(conn) => match conn.send(&request, completion.clone()) {
                    Ok(()) => {
                        dispatched = true;
                        break;
                    }
                    Err(DriverError::PoolExhausted | DriverError::PoolSaturated) => {
                        saw_saturated = true;
                    }
                    Err(err) => {
                        debug!(host = %host.address(), error = %err, "dispatch failed, trying next host");
                    }
                },
                Err(BorrowError::Saturated) => saw_saturated = true,
                Err(BorrowError::HostDown) => {}
            }
        }

        if !dispatched {
            let error = if saw_saturated {
                DriverError::PoolExhausted
            } else {
                DriverError::NoHostsAvailable
            };
            completion.try_complete(Err(error));
            return completion;
        }

        // Scheduler-owned deadline, independent of the per-slot timer.
        // Firing detaches the caller's interest; the connection's own
        // bookkeeping still releases the slot on its side.
        let deadline = self.config.request_timeout();
        let watched = completion.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(deadline).await;
            if watched.try_complete(Err(DriverError::RequestTimedOut)) {
                debug!("request deadline elapsed, caller detached");
            }
        });

        completion
    }

    /// Host state transitions, for observability layers.
    pub fn subscribe_host_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Live connection count per host.
    pub fn host_connection_counts(&self) -> Vec<(SocketAddr, usize)> {
        self.pools
            .iter()
            .map(|(addr, pool)| (*addr, pool.connection_count()))
            .collect()
    }

    /// Stops accepting requests, drains every pool (in-flight requests
    /// finish, bounded by the request timeout), then tears down the
    /// connections and the reactor runtime.
    pub fn close(mut self) {
        self.accepting.store(false, Ordering::Release);
        let pools = std::mem::take(&mut self.pools);
        self.handle.block_on(async {
            for pool in pools.values() {
                pool.close().await;
            }
        });
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        info!("session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::Release);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn resolve_contact_points(config: &ClusterConfig) -> DriverResult<Vec<SocketAddr>> {
    if config.contact_points().is_empty() {
        return Err(DriverError::NoHostsAvailable);
    }
    let mut addresses = Vec::new();
    for point in config.contact_points() {
        let resolved = if point.contains(':') {
            point.to_socket_addrs()
        } else {
            (point.as_str(), config.port()).to_socket_addrs()
        };
        match resolved {
            Ok(mut iter) => match iter.next() {
                Some(addr) => {
                    if !addresses.contains(&addr) {
                        addresses.push(addr);
                    }
                }
                None => warn!(contact_point = %point, "resolved to no addresses"),
            },
            Err(err) => warn!(contact_point = %point, error = %err, "failed to resolve"),
        }
    }
    if addresses.is_empty() {
        return Err(DriverError::NoHostsAvailable);
    }
    Ok(addresses)
}
