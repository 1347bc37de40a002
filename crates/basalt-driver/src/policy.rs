//! Pluggable load-balancing and reconnection policies.
//!
//! Policies are configuration-time singletons shared behind `Arc`:
//! logically immutable after construction apart from host-state
//! notifications. Per-request iteration state lives in the returned
//! query plan, never in the policy itself.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::host::Host;

/// Produces an ordered, single-use sequence of candidate hosts per
/// request and reacts to host up/down transitions.
pub trait LoadBalancingPolicy: Send + Sync {
    /// Installs the initial host set. Called once during session build.
    fn init(&self, hosts: &[Arc<Host>]);

    /// A fresh, finite, one-pass plan. Hosts currently marked down are
    /// excluded.
    fn new_query_plan(&self) -> Vec<Arc<Host>>;

    fn on_host_up(&self, host: &Arc<Host>);

    fn on_host_down(&self, host: &Arc<Host>);
}

/// Rotates over up hosts so ties break by rotation position rather than
/// insertion order, spreading load evenly over time.
pub struct RoundRobinPolicy {
    hosts: RwLock<Vec<Arc<Host>>>,
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn init(&self, hosts: &[Arc<Host>]) {
        *self.hosts.write().expect("hosts lock") = hosts.to_vec();
    }

    fn new_query_plan(&self) -> Vec<Arc<Host>> {
        let hosts = self.hosts.read().expect("hosts lock");
        let up: Vec<Arc<Host>> = hosts.iter().filter(|h| h.is_up()).cloned().collect();
        if up.is_empty() {
            return up;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % up.len();
        let mut plan = Vec::with_capacity(up.len());
        plan.extend_from_slice(&up[start..]);
        plan.extend_from_slice(&up[..start]);
        plan
    }

    fn on_host_up(&self, host: &Arc<Host>) {
        debug!(host = %host.address(), "host up");
    }

    fn on_host_down(&self, host: &Arc<Host>) {
        debug!(host = %host.address(), "host down");
    }
}

/// Restricts an inner policy's plans to an allowed address set.
pub struct WhitelistPolicy {
    inner: Arc<dyn LoadBalancingPolicy>,
    allowed: HashSet<SocketAddr>,
}

impl WhitelistPolicy {
    pub fn new(
        inner: Arc<dyn LoadBalancingPolicy>,
        allowed: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        Self {
            inner,
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl LoadBalancingPolicy for WhitelistPolicy {
    fn init(&self, hosts: &[Arc<Host>]) {
        self.inner.init(hosts);
    }

    fn new_query_plan(&self) -> Vec<Arc<Host>> {
        self.inner
            .new_query_plan()
            .into_iter()
            .filter(|h| self.allowed.contains(&h.address()))
            .collect()
    }

    fn on_host_up(&self, host: &Arc<Host>) {
        self.inner.on_host_up(host);
    }

    fn on_host_down(&self, host: &Arc<Host>) {
        self.inner.on_host_down(host);
    }
}

/// Backoff delay sequence for a host whose pool has no live connections.
pub trait ReconnectionPolicy: Send + Sync {
    /// A fresh, unbounded delay sequence for one reconnection episode.
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

/// Constant delay between attempts. The driver default waits 2000ms,
/// matching the cluster-side recommended reconnect wait.
pub struct FixedDelayPolicy {
    delay: Duration,
}

impl FixedDelayPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for FixedDelayPolicy {
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let delay = self.delay;
        Box::new(std::iter::repeat(delay))
    }
}

/// Doubles the delay each attempt, capped at `max`.
pub struct ExponentialBackoffPolicy {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl ReconnectionPolicy for ExponentialBackoffPolicy {
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let base = self.base;
        let max = self.max;
        Box::new((0u32..).map(move |attempt| {
            let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            base.checked_mul(factor).map_or(max, |d| d.min(max))
        }))
    }
}
