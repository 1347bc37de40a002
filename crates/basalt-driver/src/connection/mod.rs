//! A single multiplexed connection to one host.
//!
//! Each connection owns a TCP transport split across a reader task and
//! a writer task on the reactor runtime, plus an optional keepalive
//! task. Many requests share the socket concurrently over disjoint
//! stream ids; the [`PendingRequests`] table matches responses back to
//! their completions, in whatever order the server answers.
//!
//! State machine: `Connecting → Ready → Draining → Closed`, with an
//! orthogonal defunct flag settable from any state once a transport or
//! protocol error is observed.

pub(crate) mod pending;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use basalt_protocol::{decode_header, Request, Response, HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::auth::{AuthProvider, NoAuthConfigured};
use crate::completion::Completion;
use crate::config::ClusterConfig;
use crate::error::{DriverError, DriverResult};
use crate::host::Host;
use pending::{PendingRequests, RequestCompletion};

const STATE_CONNECTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_CLOSED: u8 = 3;

pub(crate) type ConnId = u64;

pub(crate) struct Connection {
    id: ConnId,
    host: Arc<Host>,
    pending: Arc<PendingRequests>,
    write_tx: mpsc::Sender<Vec<u8>>,
    state: AtomicU8,
    defunct: AtomicBool,
    request_timeout: Duration,
    handle: Handle,
    /// Tells the owning pool to retire this connection.
    defunct_tx: mpsc::UnboundedSender<ConnId>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Opens a transport, spawns the reader/writer tasks, and performs
    /// the startup handshake (including authentication when the server
    /// demands it). The whole sequence runs under `connect_timeout`.
    pub(crate) async fn open(
        id: ConnId,
        host: Arc<Host>,
        config: Arc<ClusterConfig>,
        handle: Handle,
        defunct_tx: mpsc::UnboundedSender<ConnId>,
    ) -> DriverResult<Arc<Connection>> {
        let stream = timeout(
            config.connect_timeout(),
            TcpStream::connect(host.address()),
        )
        .await
        .map_err(|_| DriverError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel(config.queue_size_io());
        let conn = Arc::new(Connection {
            id,
            host,
            pending: Arc::new(PendingRequests::new(config.streams_per_connection())),
            write_tx,
            state: AtomicU8::new(STATE_CONNECTING),
            defunct: AtomicBool::new(false),
            request_timeout: config.request_timeout(),
            handle: handle.clone(),
            defunct_tx,
            tasks: Mutex::new(Vec::new()),
        });

        {
            let mut tasks = conn.tasks.lock().expect("tasks lock");
            tasks.push(handle.spawn(run_reader(conn.clone(), read_half)));
            tasks.push(handle.spawn(run_writer(conn.clone(), write_half, write_rx)));
        }

        let handshake = timeout(config.connect_timeout(), conn.handshake(&config))
            .await
            .map_err(|_| DriverError::ConnectTimeout)
            .and_then(|result| result);
        if let Err(err) = handshake {
            // Tear the tasks down before the error propagates; nobody
            // else holds this connection yet.
            conn.shutdown();
            return Err(err);
        }
        conn.state.store(STATE_READY, Ordering::Release);

        if let Some(interval) = config.heartbeat_interval() {
            let task = handle.spawn(run_keepalive(
                conn.clone(),
                interval,
                config.heartbeat_timeout(),
            ));
            conn.tasks.lock().expect("tasks lock").push(task);
        }

        debug!(conn = id, host = %conn.host.address(), "connection ready");
        Ok(conn)
    }

    async fn handshake(self: &Arc<Self>, config: &ClusterConfig) -> DriverResult<()> {
        let mut options = HashMap::new();
        options.insert("PROTOCOL_VERSION".to_string(), "2".to_string());
        match self.roundtrip(Request::Startup { options }).await? {
            Response::Ready => Ok(()),
            Response::Authenticate { authenticator } => {
                let token = match config.auth_provider() {
                    Some(provider) => provider.initial_token(&authenticator)?,
                    None => NoAuthConfigured.initial_token(&authenticator)?,
                };
                match self.roundtrip(Request::AuthResponse { token }).await? {
                    Response::AuthSuccess => Ok(()),
                    Response::Error { message, .. } => {
                        Err(DriverError::AuthenticationFailed(message))
                    }
                    other => Err(DriverError::ProtocolViolation(format!(
                        "unexpected auth response {:?}",
                        other.opcode()
                    ))),
                }
            }
            Response::Error { code, message } => Err(DriverError::Server { code, message }),
            other => Err(DriverError::ProtocolViolation(format!(
                "unexpected startup response {:?}",
                other.opcode()
            ))),
        }
    }

    /// Reserves a stream slot, enqueues the encoded frame, and arms the
    /// per-slot timeout. Backpressure is immediate: a full slot table
    /// fails with `PoolExhausted`, a full write backlog with
    /// `PoolSaturated`; neither blocks.
    pub(crate) fn send(
        &self,
        request: &Request,
        completion: RequestCompletion,
    ) -> DriverResult<()> {
        if self.is_defunct() || self.state.load(Ordering::Acquire) >= STATE_DRAINING {
            return Err(DriverError::ConnectionClosed);
        }

        let stream = self.pending.reserve(completion)?;
        let frame = request.encode(stream);
        match self.write_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.pending.complete(stream);
                return Err(DriverError::PoolSaturated);
            }
            Err(TrySendError::Closed(_)) => {
                self.pending.complete(stream);
                return Err(DriverError::ConnectionClosed);
            }
        }

        // Per-slot timer: releases the slot and fails the completion,
        // but leaves the connection open. The server may still answer;
        // a late reply for the released slot is dropped as stale.
        let pending = self.pending.clone();
        let slot_timeout = self.request_timeout;
        self.handle.spawn(async move {
            tokio::time::sleep(slot_timeout).await;
            if let Some(completion) = pending.complete(stream) {
                debug!(stream, "per-slot timeout fired, releasing slot");
                completion.try_complete(Err(DriverError::RequestTimedOut));
            }
        });
        Ok(())
    }

    /// One request/response exchange, bridged to async via the
    /// completion's callback. Used by the handshake and keepalive.
    pub(crate) async fn roundtrip(&self, request: Request) -> DriverResult<Response> {
        let completion = Arc::new(Completion::new());
        self.send(&request, completion.clone())?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        completion.on_complete(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.await.map_err(|_| DriverError::ConnectionClosed)?
    }

    fn dispatch_response(&self, stream: i16, response: Response) {
        match self.pending.complete(stream) {
            Some(completion) => {
                let outcome = match response {
                    Response::Error { code, message } => {
                        Err(DriverError::Server { code, message })
                    }
                    other => Ok(other),
                };
                completion.try_complete(outcome);
            }
            None => debug!(stream, "response for released stream, dropped as stale"),
        }
    }

    /// Fatal transport/protocol failure: fails every pending request
    /// with `ConnectionClosed` and tells the pool to retire us. Idempotent.
    pub(crate) fn mark_defunct(&self, reason: &str) {
        if self.defunct.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(conn = self.id, host = %self.host.address(), reason, "connection defunct");
        self.pending.fail_all(DriverError::ConnectionClosed);
        let _ = self.defunct_tx.send(self.id);
    }

    /// Stops accepting new requests, waits (bounded) for in-flight ones
    /// to finish, then tears the tasks down.
    pub(crate) async fn drain(&self, limit: Duration) {
        self.state.store(STATE_DRAINING, Ordering::Release);
        let deadline = Instant::now() + limit;
        while self.pending.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.shutdown();
    }

    /// Immediate teardown; pending requests fail with `ConnectionClosed`.
    pub(crate) fn shutdown(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        self.pending.fail_all(DriverError::ConnectionClosed);
    }

    pub(crate) fn id(&self) -> ConnId {
        self.id
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    pub(crate) fn is_ready(&self) -> bool {
        !self.is_defunct() && self.state.load(Ordering::Acquire) == STATE_READY
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.in_flight()
    }

    pub(crate) fn stream_capacity(&self) -> usize {
        self.pending.capacity()
    }
}

async fn run_reader(conn: Arc<Connection>, mut read_half: OwnedReadHalf) {
    match read_loop(&conn, &mut read_half).await {
        Ok(()) => conn.mark_defunct("peer closed the connection"),
        Err(err) => conn.mark_defunct(&err.to_string()),
    }
}

async fn read_loop(conn: &Connection, read_half: &mut OwnedReadHalf) -> DriverResult<()> {
    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        read_half.read_exact(&mut header_buf).await?;
        let header = decode_header(&header_buf)?;
        let mut body = vec![0u8; header.length as usize];
        read_half.read_exact(&mut body).await?;

        match Response::decode(&header, &body) {
            Ok(response) => conn.dispatch_response(header.stream, response),
            Err(err) if err.is_malformed() => {
                // Fatal to the single frame, not the connection. The
                // framing itself was intact, so keep reading.
                warn!(stream = header.stream, error = %err, "malformed frame body");
                if let Some(completion) = conn.pending.complete(header.stream) {
                    completion.try_complete(Err(err.into()));
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn run_writer(
    conn: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(frame) = write_rx.recv().await {
        if let Err(err) = write_half.write_all(&frame).await {
            conn.mark_defunct(&format!("write failed: {err}"));
            return;
        }
    }
}

async fn run_keepalive(conn: Arc<Connection>, interval: Duration, reply_timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick
    loop {
        ticker.tick().await;
        if conn.is_defunct() {
            return;
        }
        if conn.in_flight() > 0 {
            // Not idle; regular traffic already proves liveness and the
            // per-slot timers cover a stuck peer.
            continue;
        }
        match timeout(reply_timeout, conn.roundtrip(Request::Options)).await {
            Ok(Ok(_)) => trace!(conn = conn.id, "heartbeat ok"),
            Ok(Err(err)) => {
                conn.mark_defunct(&format!("heartbeat failed: {err}"));
                return;
            }
            Err(_) => {
                conn.mark_defunct("heartbeat reply timed out");
                return;
            }
        }
    }
}
