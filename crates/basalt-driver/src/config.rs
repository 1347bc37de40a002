//! Cluster configuration.
//!
//! Plain value holder consumed by the core; built programmatically with
//! `with_*` setters. Defaults follow the protocol's recommended client
//! tuning.

use std::sync::Arc;
use std::time::Duration;

use basalt_protocol::MAX_STREAMS;

use crate::auth::{AuthProvider, PlainTextAuthProvider};
use crate::policy::{FixedDelayPolicy, LoadBalancingPolicy, ReconnectionPolicy, RoundRobinPolicy};

const DEFAULT_PORT: u16 = 9042;

/// Tunables for a [`Session`](crate::Session).
#[derive(Clone)]
pub struct ClusterConfig {
    contact_points: Vec<String>,
    port: u16,
    io_threads: usize,
    queue_size_io: usize,
    queue_size_event: usize,
    core_connections_per_host: usize,
    max_connections_per_host: usize,
    max_simultaneous_creation: usize,
    max_pending_requests: usize,
    saturation_threshold: usize,
    streams_per_connection: usize,
    reconnect_wait: Duration,
    connect_timeout: Duration,
    request_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Duration,
    auth_provider: Option<Arc<dyn AuthProvider>>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    reconnection: Arc<dyn ReconnectionPolicy>,
}

impl ClusterConfig {
    pub fn new() -> Self {
        let max_connections_per_host = 4;
        Self {
            contact_points: Vec::new(),
            port: DEFAULT_PORT,
            io_threads: 1,
            queue_size_io: 4096,
            queue_size_event: 4096,
            core_connections_per_host: 2,
            max_connections_per_host,
            max_simultaneous_creation: 1,
            max_pending_requests: 128 * max_connections_per_host,
            saturation_threshold: 100,
            streams_per_connection: MAX_STREAMS,
            reconnect_wait: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(12000),
            heartbeat_interval: None,
            heartbeat_timeout: Duration::from_secs(5),
            auth_provider: None,
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            reconnection: Arc::new(FixedDelayPolicy::new(Duration::from_millis(2000))),
        }
    }

    /// Adds a contact point, either `host` (default port applied later)
    /// or `host:port`.
    pub fn with_contact_point(mut self, address: impl Into<String>) -> Self {
        self.contact_points.push(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Number of reactor worker threads for socket and timer events.
    pub fn with_io_threads(mut self, count: usize) -> Self {
        self.io_threads = count.max(1);
        self
    }

    /// Per-connection write backlog; a full backlog load-sheds.
    pub fn with_queue_size_io(mut self, size: usize) -> Self {
        self.queue_size_io = size.max(1);
        self
    }

    /// Host-event channel capacity.
    pub fn with_queue_size_event(mut self, size: usize) -> Self {
        self.queue_size_event = size.max(1);
        self
    }

    pub fn with_core_connections_per_host(mut self, count: usize) -> Self {
        self.core_connections_per_host = count.max(1);
        self
    }

    /// Raising the ceiling also raises the derived pending-request cap
    /// (`128 * max`) when the new value is larger. The cap never
    /// shrinks; lowering it back requires `with_max_pending_requests`.
    pub fn with_max_connections_per_host(mut self, count: usize) -> Self {
        self.max_connections_per_host = count.max(1);
        let derived = 128 * self.max_connections_per_host;
        if derived > self.max_pending_requests {
            self.max_pending_requests = derived;
        }
        self
    }

    pub fn with_max_simultaneous_creation(mut self, count: usize) -> Self {
        self.max_simultaneous_creation = count.max(1);
        self
    }

    pub fn with_max_pending_requests(mut self, count: usize) -> Self {
        self.max_pending_requests = count;
        self
    }

    /// In-flight count at which a connection is considered saturated
    /// enough to trigger pool growth.
    pub fn with_saturation_threshold(mut self, count: usize) -> Self {
        self.saturation_threshold = count.max(1);
        self
    }

    /// Concurrently outstanding requests allowed per connection. Capped
    /// at the protocol stream-id space.
    pub fn with_streams_per_connection(mut self, count: usize) -> Self {
        self.streams_per_connection = count.clamp(1, MAX_STREAMS);
        self
    }

    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self.reconnection = Arc::new(FixedDelayPolicy::new(wait));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables idle heartbeats at the given interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Installs a plain-text credentials provider.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth_provider = Some(Arc::new(PlainTextAuthProvider::new(username, password)));
        self
    }

    /// Replaces the authentication provider. Keeping the current one is
    /// expressed by not calling this; there is no silent no-op path.
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    pub fn with_load_balancing_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.load_balancing = policy;
        self
    }

    pub fn with_reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.reconnection = policy;
        self
    }

    pub fn contact_points(&self) -> &[String] {
        &self.contact_points
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn io_threads(&self) -> usize {
        self.io_threads
    }

    pub fn queue_size_io(&self) -> usize {
        self.queue_size_io
    }

    pub fn queue_size_event(&self) -> usize {
        self.queue_size_event
    }

    pub fn core_connections_per_host(&self) -> usize {
        self.core_connections_per_host
    }

    pub fn max_connections_per_host(&self) -> usize {
        self.max_connections_per_host
    }

    pub fn max_simultaneous_creation(&self) -> usize {
        self.max_simultaneous_creation
    }

    pub fn max_pending_requests(&self) -> usize {
        self.max_pending_requests
    }

    pub fn saturation_threshold(&self) -> usize {
        self.saturation_threshold
    }

    pub fn streams_per_connection(&self) -> usize {
        self.streams_per_connection
    }

    pub fn reconnect_wait(&self) -> Duration {
        self.reconnect_wait
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn auth_provider(&self) -> Option<&Arc<dyn AuthProvider>> {
        self.auth_provider.as_ref()
    }

    pub fn load_balancing_policy(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.load_balancing
    }

    pub fn reconnection_policy(&self) -> &Arc<dyn ReconnectionPolicy> {
        &self.reconnection
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new()
    }
}
