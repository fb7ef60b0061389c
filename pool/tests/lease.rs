//! Pool behavior against a live loopback reactor: capacity caps, FIFO
//! queueing, reuse, and lease deadlines.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use whirl_pool::{PoolConfig, SessionPool};
use whirl_reactor::{
    ConnectingReactor, EventMask, FailFastPolicy, IoHandler, ListeningReactor, ReactorConfig,
    ReactorError, Session,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn config() -> ReactorConfig {
    ReactorConfig {
        worker_count: 2,
        select_interval: Duration::from_millis(50),
        ..ReactorConfig::default()
    }
}

struct Quiet;

impl IoHandler for Quiet {
    fn connected(&self, session: &Session) -> io::Result<()> {
        session.set_event(EventMask::READ);
        Ok(())
    }
    fn disconnected(&self, _session: &Session) -> io::Result<()> {
        Ok(())
    }
    fn input_ready(&self, session: &Session) -> io::Result<()> {
        session.close();
        Ok(())
    }
    fn output_ready(&self, _session: &Session) -> io::Result<()> {
        Ok(())
    }
    fn timeout(&self, session: &Session) -> io::Result<()> {
        session.close();
        Ok(())
    }
}

struct Rig {
    server: ListeningReactor,
    client: Arc<ConnectingReactor>,
    addr: SocketAddr,
}

impl Rig {
    fn new() -> Rig {
        let server =
            ListeningReactor::start(config(), Arc::new(Quiet), Arc::new(FailFastPolicy)).unwrap();
        let addr = server
            .listen("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .wait_ready()
            .unwrap();
        let client = Arc::new(
            ConnectingReactor::start(config(), Arc::new(Quiet), Arc::new(FailFastPolicy))
                .unwrap(),
        );
        Rig {
            server,
            client,
            addr,
        }
    }

    fn pool(&self, max_per_route: usize, max_total: usize) -> SessionPool<&'static str, &'static str> {
        let addr = self.addr;
        SessionPool::new(
            self.client.clone(),
            move |_route: &&'static str| Ok::<_, ReactorError>(addr),
            PoolConfig {
                max_per_route,
                max_total,
            },
        )
    }

    fn teardown(self) {
        self.client.shutdown(Duration::from_secs(5));
        self.server.shutdown(Duration::from_secs(5));
    }
}

#[test]
fn over_cap_leases_queue_and_reuse_the_released_session() {
    init_tracing();
    let rig = Rig::new();
    let pool = rig.pool(1, 1);

    let first = pool.lease("db", None, None, None);
    let m1 = first.wait_timeout(Duration::from_secs(5)).unwrap();
    let leased_addr = m1.session().local_addr();

    let second = pool.lease("db", None, None, None);
    std::thread::sleep(Duration::from_millis(200));
    assert!(!second.is_done());
    let stats = pool.route_stats(&"db");
    assert_eq!(stats.leased, 1);
    assert_eq!(stats.waiting, 1);

    m1.release();
    let m2 = second.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(m2.session().local_addr(), leased_addr);
    let stats = pool.route_stats(&"db");
    assert_eq!(stats.leased, 1);
    assert_eq!(stats.waiting, 0);

    m2.release();
    pool.shutdown();
    rig.teardown();
}

#[test]
fn queued_leases_are_granted_in_fifo_order() {
    init_tracing();
    let rig = Rig::new();
    let pool = rig.pool(1, 1);

    let m1 = pool
        .lease("db", None, None, None)
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    let second = pool.lease("db", None, None, None);
    let third = pool.lease("db", None, None, None);

    m1.release();
    let m2 = second.wait_timeout(Duration::from_secs(5)).unwrap();
    assert!(!third.is_done());

    m2.release();
    let m3 = third.wait_timeout(Duration::from_secs(5)).unwrap();

    m3.release();
    pool.shutdown();
    rig.teardown();
}

#[test]
fn non_reusable_release_frees_capacity_for_a_fresh_session() {
    init_tracing();
    let rig = Rig::new();
    let pool = rig.pool(1, 1);

    let m1 = pool
        .lease("db", None, None, None)
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    let first_addr = m1.session().local_addr();
    let second = pool.lease("db", None, None, None);

    m1.abort();
    let m2 = second.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(m2.session().local_addr(), first_addr);
    assert!(!m2.session().is_closed());

    m2.release();
    pool.shutdown();
    rig.teardown();
}

#[test]
fn caps_hold_per_route_and_in_total() {
    init_tracing();
    let rig = Rig::new();
    let pool = rig.pool(2, 2);

    let leases: Vec<_> = (0..4).map(|_| pool.lease("db", None, None, None)).collect();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if leases.iter().filter(|f| f.is_done()).count() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(leases.iter().filter(|f| f.is_done()).count(), 2);
    let stats = pool.total_stats();
    assert_eq!(stats.leased, 2);
    assert_eq!(stats.waiting, 2);
    assert!(stats.leased + stats.pending <= 2);

    pool.shutdown();
    rig.teardown();
}

#[test]
fn queued_lease_past_its_deadline_times_out() {
    init_tracing();
    let rig = Rig::new();
    let pool = rig.pool(1, 1);

    let m1 = pool
        .lease("db", None, None, None)
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    let second = pool.lease("db", None, Some(Duration::from_millis(100)), None);

    std::thread::sleep(Duration::from_millis(250));
    // Expiry runs on the next pool operation.
    m1.release();
    assert!(matches!(
        second.wait_timeout(Duration::from_secs(5)),
        Err(ReactorError::Timeout)
    ));
    // The released session went idle, not to the expired waiter.
    let stats = pool.route_stats(&"db");
    assert_eq!(stats.available, 1);
    assert_eq!(stats.leased, 0);

    pool.shutdown();
    rig.teardown();
}

#[test]
fn state_matching_keeps_stateful_sessions_for_their_owners() {
    init_tracing();
    let rig = Rig::new();
    let pool = rig.pool(2, 2);

    let m1 = pool
        .lease("db", None, None, None)
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    m1.set_state(Some("alice"));
    let tagged_addr = m1.session().local_addr();
    m1.release();

    // A lease for a different principal must not receive alice's session.
    let m2 = pool
        .lease("db", Some("bob"), None, None)
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    assert_ne!(m2.session().local_addr(), tagged_addr);

    // Alice gets her session back.
    let m3 = pool
        .lease("db", Some("alice"), None, None)
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(m3.session().local_addr(), tagged_addr);
    assert_eq!(m3.state(), Some("alice"));

    m2.release();
    m3.release();
    pool.shutdown();
    rig.teardown();
}

#[test]
fn shutdown_cancels_queued_leases() {
    init_tracing();
    let rig = Rig::new();
    let pool = rig.pool(1, 1);

    let m1 = pool
        .lease("db", None, None, None)
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    let queued = pool.lease("db", None, None, None);

    pool.shutdown();
    assert!(matches!(
        queued.wait_timeout(Duration::from_secs(5)),
        Err(ReactorError::Cancelled)
    ));
    assert!(matches!(
        pool.lease("db", None, None, None)
            .wait_timeout(Duration::from_secs(1)),
        Err(ReactorError::IllegalState)
    ));

    drop(m1);
    rig.teardown();
}
