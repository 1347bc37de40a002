//! In-process mock server speaking the basalt wire protocol.
//!
//! Runs on plain std threads with blocking sockets so the driver's own
//! runtime is the only reactor in the test process. Behavior is
//! configured per server; responses can be delayed, withheld, or the
//! whole connection dropped with requests still pending.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basalt_protocol::{decode_header, FrameHeader, Request, Response, HEADER_LEN};

/// How the server treats Query requests.
#[derive(Clone)]
pub enum QueryBehavior {
    /// Reply with a Rows payload carrying the given tag (or the query
    /// text when the tag is empty).
    Echo(String),
    /// Reply after a delay, without blocking other streams.
    Delay(Duration),
    /// Never reply.
    Silent,
    /// Reply with a server error.
    Fail { code: u32, message: String },
    /// Reply with a raw header declaring an absurd body length.
    OversizedReply,
}

#[derive(Clone)]
pub struct ServerBehavior {
    pub query: QueryBehavior,
    pub require_auth: bool,
    /// Withhold Supported replies so heartbeats starve.
    pub silent_options: bool,
    /// Hold the Ready reply back this long, slowing establishment.
    pub startup_delay: Option<Duration>,
    /// Drop the connection once this many queries have piled up
    /// unanswered.
    pub drop_after_queries: Option<usize>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            query: QueryBehavior::Echo(String::new()),
            require_auth: false,
            silent_options: false,
            startup_delay: None,
            drop_after_queries: None,
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    accept_times: Arc<Mutex<Vec<std::time::Instant>>>,
    accept_thread: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start(behavior: ServerBehavior) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        listener.set_nonblocking(true).expect("nonblocking accept");

        let shutdown = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));
        let accept_times: Arc<Mutex<Vec<std::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_shutdown = shutdown.clone();
        let accept_counter = accepted.clone();
        let accept_clock = accept_times.clone();
        let accept_thread = thread::spawn(move || {
            while !accept_shutdown.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        accept_counter.fetch_add(1, Ordering::SeqCst);
                        accept_clock
                            .lock()
                            .expect("accept times lock")
                            .push(std::time::Instant::now());
                        stream.set_nonblocking(false).expect("blocking conn");
                        let behavior = behavior.clone();
                        thread::spawn(move || serve_connection(stream, behavior));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        MockServer {
            addr,
            shutdown,
            accepted,
            accept_times,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn contact_point(&self) -> String {
        self.addr.to_string()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Timestamps of each accept, in order.
    pub fn accept_times(&self) -> Vec<std::time::Instant> {
        self.accept_times.lock().expect("accept times lock").clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection(stream: TcpStream, behavior: ServerBehavior) {
    let reader = stream.try_clone().expect("clone stream");
    // Delayed responders share the writer, so replies never interleave
    // mid-frame.
    let writer = Arc::new(Mutex::new(stream));
    let mut unanswered_queries = 0usize;

    let mut reader = reader;
    loop {
        let Some((header, body)) = read_frame(&mut reader) else {
            return;
        };
        let Ok(request) = Request::decode(&header, &body) else {
            return;
        };
        let stream_id = header.stream;

        match request {
            Request::Startup { .. } => {
                if let Some(delay) = behavior.startup_delay {
                    thread::sleep(delay);
                }
                let reply = if behavior.require_auth {
                    Response::Authenticate {
                        authenticator: "PasswordAuthenticator".to_string(),
                    }
                } else {
                    Response::Ready
                };
                write_frame(&writer, &reply, stream_id);
            }
            Request::AuthResponse { token } => {
                let reply = if token == b"\0user\0pass" {
                    Response::AuthSuccess
                } else {
                    Response::Error {
                        code: 0x0100,
                        message: "bad credentials".to_string(),
                    }
                };
                write_frame(&writer, &reply, stream_id);
            }
            Request::Options => {
                if !behavior.silent_options {
                    write_frame(
                        &writer,
                        &Response::Supported {
                            options: Default::default(),
                        },
                        stream_id,
                    );
                }
            }
            Request::Query { text } => {
                if let Some(limit) = behavior.drop_after_queries {
                    unanswered_queries += 1;
                    if unanswered_queries >= limit {
                        let guard = writer.lock().expect("writer lock");
                        let _ = guard.shutdown(std::net::Shutdown::Both);
                        return;
                    }
                    continue;
                }
                match &behavior.query {
                    QueryBehavior::Echo(tag) => {
                        let payload = if tag.is_empty() { text.into_bytes() } else { tag.clone().into_bytes() };
                        write_frame(
                            &writer,
                            &Response::Rows {
                                payload: payload.into(),
                            },
                            stream_id,
                        );
                    }
                    QueryBehavior::Delay(delay) => {
                        let writer = writer.clone();
                        let delay = *delay;
                        thread::spawn(move || {
                            thread::sleep(delay);
                            write_frame(
                                &writer,
                                &Response::Rows {
                                    payload: text.into_bytes().into(),
                                },
                                stream_id,
                            );
                        });
                    }
                    QueryBehavior::Silent => {}
                    QueryBehavior::OversizedReply => {
                        let mut raw = vec![0x82u8, 0x00];
                        raw.extend_from_slice(&stream_id.to_be_bytes());
                        raw.push(0x08); // Result opcode
                        raw.extend_from_slice(&u32::MAX.to_be_bytes());
                        write_raw(&writer, &raw);
                    }
                    QueryBehavior::Fail { code, message } => {
                        write_frame(
                            &writer,
                            &Response::Error {
                                code: *code,
                                message: message.clone(),
                            },
                            stream_id,
                        );
                    }
                }
            }
        }
    }
}

fn read_frame(stream: &mut TcpStream) -> Option<(FrameHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).ok()?;
    let header = decode_header(&header_buf).ok()?;
    let mut body = vec![0u8; header.length as usize];
    stream.read_exact(&mut body).ok()?;
    Some((header, body))
}

fn write_frame(writer: &Arc<Mutex<TcpStream>>, response: &Response, stream_id: i16) {
    write_raw(writer, &response.encode(stream_id));
}

fn write_raw(writer: &Arc<Mutex<TcpStream>>, frame: &[u8]) {
    let mut guard = writer.lock().expect("writer lock");
    let _ = guard.write_all(frame);
}

/// Polls a host-event subscription until an event matching `want`
/// arrives or the deadline passes.
pub fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<basalt_driver::HostEvent>,
    want: basalt_driver::HostEvent,
    deadline: Duration,
) -> bool {
    use tokio::sync::broadcast::error::TryRecvError;
    let until = std::time::Instant::now() + deadline;
    while std::time::Instant::now() < until {
        match rx.try_recv() {
            Ok(event) if event == want => return true,
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            Err(TryRecvError::Closed) => return false,
        }
    }
    false
}

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
