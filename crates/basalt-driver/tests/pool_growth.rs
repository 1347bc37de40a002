mod common;

use std::time::{Duration, Instant};

use basalt_driver::{ClusterConfig, DriverError, Session};
use common::{MockServer, QueryBehavior, ServerBehavior};

/// Saturating one host's core connections grows the pool toward the
/// maximum, and the grown connections actually carry traffic.
#[test]
fn saturation_grows_the_pool_to_its_ceiling() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior {
        query: QueryBehavior::Delay(Duration::from_millis(200)),
        ..Default::default()
    });
    let config = ClusterConfig::new()
        .with_contact_point(server.contact_point())
        .with_core_connections_per_host(2)
        .with_max_connections_per_host(4)
        .with_streams_per_connection(10)
        .with_saturation_threshold(1)
        .with_connect_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(5));
    let session = Session::connect(config).unwrap();
    assert_eq!(session.host_connection_counts()[0].1, 2);

    let mut completions = Vec::new();
    let mut shed = 0;
    for wave in 0..5 {
        for i in 0..25 {
            completions.push(session.execute(format!("w{wave}q{i}")));
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let mut served = 0;
    for completion in completions {
        match completion.wait() {
            Ok(_) => served += 1,
            Err(DriverError::PoolExhausted) => shed += 1,
            Err(other) => panic!("unexpected failure: {other:?}"),
        }
    }
    assert!(served >= 20, "only {served} of 125 requests served");
    // Load-shedding is immediate; nothing ever queued behind a full pool.
    assert!(served + shed == 125);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let count = session.host_connection_counts()[0].1;
        if count == 4 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "pool stopped growing at {count} connections"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    session.close();
}

/// With a creation cap of one, growth connections are established
/// strictly one after another, and the pool never exceeds its ceiling
/// while growing.
#[test]
fn connection_creation_is_serialized_by_the_cap() {
    common::init_tracing();
    let startup_delay = Duration::from_millis(150);
    let server = MockServer::start(ServerBehavior {
        query: QueryBehavior::Delay(Duration::from_millis(500)),
        startup_delay: Some(startup_delay),
        ..Default::default()
    });
    let config = ClusterConfig::new()
        .with_contact_point(server.contact_point())
        .with_core_connections_per_host(1)
        .with_max_connections_per_host(4)
        .with_max_simultaneous_creation(1)
        .with_streams_per_connection(2)
        .with_saturation_threshold(1)
        .with_connect_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(5));
    let session = Session::connect(config).unwrap();

    // Eight instant requests: two dispatch, the rest shed, and the
    // saturation pressure schedules growth toward the ceiling.
    let completions: Vec<_> = (0..8).map(|i| session.execute(format!("q{i}"))).collect();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let count = session.host_connection_counts()[0].1;
        assert!(count <= 4, "pool exceeded its ceiling: {count}");
        if count == 4 {
            break;
        }
        assert!(Instant::now() < deadline, "pool stopped growing at {count}");
        std::thread::sleep(Duration::from_millis(10));
    }

    // One establishment at a time: each growth connection's accept can
    // only happen after the previous handshake finished.
    let times = server.accept_times();
    assert_eq!(times.len(), 4);
    for pair in times[1..].windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(100),
            "establishments overlapped: accepts {gap:?} apart"
        );
    }

    for completion in completions {
        match completion.wait() {
            Ok(_) | Err(DriverError::PoolExhausted) => {}
            Err(other) => panic!("unexpected failure: {other:?}"),
        }
    }
    session.close();
}

/// A pool at its connection ceiling with every stream busy refuses new
/// work rather than queueing it.
#[test]
fn requests_beyond_total_capacity_are_rejected() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior {
        query: QueryBehavior::Delay(Duration::from_millis(300)),
        ..Default::default()
    });
    let config = ClusterConfig::new()
        .with_contact_point(server.contact_point())
        .with_core_connections_per_host(1)
        .with_max_connections_per_host(1)
        .with_streams_per_connection(4)
        .with_connect_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(5));
    let session = Session::connect(config).unwrap();

    let busy: Vec<_> = (0..4).map(|i| session.execute(format!("q{i}"))).collect();
    match session.execute("one too many").wait() {
        Err(DriverError::PoolExhausted) => {}
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    for completion in busy {
        assert!(completion.wait().is_ok(), "busy request should still finish");
    }
    session.close();
}

/// The pool-wide pending cap rejects work even when individual
/// connections still have free streams.
#[test]
fn pool_wide_pending_cap_is_enforced() {
    common::init_tracing();
    let server = MockServer::start(ServerBehavior {
        query: QueryBehavior::Silent,
        ..Default::default()
    });
    let config = ClusterConfig::new()
        .with_contact_point(server.contact_point())
        .with_core_connections_per_host(1)
        .with_max_connections_per_host(1)
        .with_streams_per_connection(16)
        .with_max_pending_requests(3)
        .with_connect_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(2));
    let session = Session::connect(config).unwrap();

    let held: Vec<_> = (0..3).map(|i| session.execute(format!("q{i}"))).collect();
    match session.execute("over the cap").wait() {
        Err(DriverError::PoolExhausted) => {}
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    drop(held);
    session.close();
}
