mod common;

use std::sync::mpsc;
use std::time::Duration;

use basalt_driver::{ClusterConfig, DriverError, Response, Session};
use common::{MockServer, QueryBehavior, ServerBehavior};

fn quick_config(server: &MockServer) -> ClusterConfig {
    ClusterConfig::new()
        .with_contact_point(server.contact_point())
        .with_core_connections_per_host(1)
        .with_connect_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(2))
}

#[test]
fn query_round_trip_returns_rows() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior::default());
    let session = Session::connect(quick_config(&server)).unwrap();

    let result = session.execute("SELECT now()").wait().unwrap();
    match result {
        Response::Rows { payload } => assert_eq!(&payload[..], b"SELECT now()"),
        other => panic!("expected rows, got {other:?}"),
    }
    session.close();
}

#[test]
fn responses_match_their_requests_out_of_order() {
    common::init_tracing();
    // A slow server answers all streams 100ms later; five concurrent
    // requests on one connection must each get their own reply.
    let server = MockServer::start(ServerBehavior {
        query: QueryBehavior::Delay(Duration::from_millis(100)),
        ..Default::default()
    });
    let session = Session::connect(quick_config(&server)).unwrap();

    let completions: Vec<_> = (0..5).map(|i| session.execute(format!("q{i}"))).collect();
    for (i, completion) in completions.into_iter().enumerate() {
        match completion.wait().unwrap() {
            Response::Rows { payload } => assert_eq!(&payload[..], format!("q{i}").as_bytes()),
            other => panic!("expected rows, got {other:?}"),
        }
    }
    session.close();
}

#[test]
fn completion_callback_fires_from_reactor_thread() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior::default());
    let session = Session::connect(quick_config(&server)).unwrap();

    let (tx, rx) = mpsc::channel();
    session.execute("SELECT 1").on_complete(move |result| {
        let _ = tx.send(result.is_ok());
    });
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    session.close();
}

#[test]
fn server_errors_surface_with_code_and_message() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior {
        query: QueryBehavior::Fail {
            code: 0x1001,
            message: "overloaded".to_string(),
        },
        ..Default::default()
    });
    let session = Session::connect(quick_config(&server)).unwrap();

    match session.execute("SELECT 1").wait() {
        Err(DriverError::Server { code, message }) => {
            assert_eq!(code, 0x1001);
            assert_eq!(message, "overloaded");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    session.close();
}

#[test]
fn round_robin_spreads_queries_across_hosts() {
    common::init_tracing();
    let server_a = MockServer::start(ServerBehavior {
        query: QueryBehavior::Echo("a".to_string()),
        ..Default::default()
    });
    let server_b = MockServer::start(ServerBehavior {
        query: QueryBehavior::Echo("b".to_string()),
        ..Default::default()
    });
    let config = ClusterConfig::new()
        .with_contact_point(server_a.contact_point())
        .with_contact_point(server_b.contact_point())
        .with_core_connections_per_host(1)
        .with_connect_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(2));
    let session = Session::connect(config).unwrap();

    let mut tags = Vec::new();
    for _ in 0..8 {
        match session.execute("SELECT 1").wait().unwrap() {
            Response::Rows { payload } => tags.push(payload.to_vec()),
            other => panic!("expected rows, got {other:?}"),
        }
    }
    assert!(tags.contains(&b"a".to_vec()), "host a never served a query");
    assert!(tags.contains(&b"b".to_vec()), "host b never served a query");
    session.close();
}

#[test]
fn connect_fails_fast_when_no_host_listens() {
    common::init_tracing();
    // Bind-then-drop reserves a port that nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ClusterConfig::new()
        .with_contact_point(format!("127.0.0.1:{port}"))
        .with_connect_timeout(Duration::from_millis(500));
    match Session::connect(config) {
        Err(DriverError::NoHostsAvailable) => {}
        other => panic!("expected NoHostsAvailable, got {:?}", other.err()),
    }
}

#[test]
fn authentication_handshake_succeeds_with_credentials() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior {
        require_auth: true,
        ..Default::default()
    });
    let config = quick_config(&server).with_credentials("user", "pass");
    let session = Session::connect(config).unwrap();
    assert!(session.execute("SELECT 1").wait().is_ok());
    session.close();
}

#[test]
fn bad_credentials_leave_no_live_hosts() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior {
        require_auth: true,
        ..Default::default()
    });
    let config = quick_config(&server).with_credentials("user", "wrong");
    match Session::connect(config) {
        Err(DriverError::NoHostsAvailable) => {}
        other => panic!("expected NoHostsAvailable, got {:?}", other.err()),
    }
}
