//! End-to-end loopback coverage: accept, connect, echo, close, and the
//! callback-parity guarantees around shutdown.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
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

fn queued_config() -> ReactorConfig {
    ReactorConfig {
        interest_ops_queueing: true,
        ..config()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Bytes queued for write-back while the channel is saturated.
struct Outbox(Mutex<VecDeque<u8>>);

#[derive(Default)]
struct Counters {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

struct EchoServer {
    counters: Arc<Counters>,
}

impl IoHandler for EchoServer {
    fn connected(&self, session: &Session) -> io::Result<()> {
        self.counters.connected.fetch_add(1, Ordering::SeqCst);
        session.ext().set(Outbox(Mutex::new(VecDeque::new())));
        session.set_event(EventMask::READ);
        Ok(())
    }

    fn disconnected(&self, _session: &Session) -> io::Result<()> {
        self.counters.disconnected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn input_ready(&self, session: &Session) -> io::Result<()> {
        let outbox = session.ext().get::<Outbox>().unwrap();
        let mut chunk = [0u8; 4096];
        loop {
            let read = session.channel().read(&mut chunk);
            match read {
                Ok(0) => {
                    session.close();
                    return Ok(());
                }
                Ok(n) => outbox.0.lock().extend(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        flush_outbox(session, &outbox)
    }

    fn output_ready(&self, session: &Session) -> io::Result<()> {
        let outbox = session.ext().get::<Outbox>().unwrap();
        flush_outbox(session, &outbox)
    }

    fn timeout(&self, session: &Session) -> io::Result<()> {
        session.close();
        Ok(())
    }
}

fn flush_outbox(session: &Session, outbox: &Outbox) -> io::Result<()> {
    let mut pending = outbox.0.lock();
    while !pending.is_empty() {
        let (head, _) = pending.as_slices();
        let written = session.channel().write(head);
        match written {
            Ok(n) => {
                pending.drain(..n);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    if pending.is_empty() {
        session.clear_event(EventMask::WRITE);
    } else {
        session.set_event(EventMask::WRITE);
    }
    Ok(())
}

struct EchoClient {
    counters: Arc<Counters>,
    replies: Arc<AtomicUsize>,
    timed_out: Arc<AtomicUsize>,
    payload: &'static [u8],
    idle_timeout: Option<Duration>,
}

impl IoHandler for EchoClient {
    fn connected(&self, session: &Session) -> io::Result<()> {
        self.counters.connected.fetch_add(1, Ordering::SeqCst);
        if let Some(timeout) = self.idle_timeout {
            session.set_socket_timeout(Some(timeout));
        }
        session.channel().write_all(self.payload)?;
        session.set_event(EventMask::READ);
        Ok(())
    }

    fn disconnected(&self, _session: &Session) -> io::Result<()> {
        self.counters.disconnected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn input_ready(&self, session: &Session) -> io::Result<()> {
        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = session.channel().read(&mut chunk);
            match read {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        if received.ends_with(b"\n") {
            self.replies.fetch_add(1, Ordering::SeqCst);
            session.close();
        }
        Ok(())
    }

    fn output_ready(&self, _session: &Session) -> io::Result<()> {
        Ok(())
    }

    fn timeout(&self, session: &Session) -> io::Result<()> {
        self.timed_out.fetch_add(1, Ordering::SeqCst);
        session.close();
        Ok(())
    }
}

#[test]
fn echo_round_trip_balances_callbacks() {
    init_tracing();
    const SESSIONS: usize = 4;

    let server_counters = Arc::new(Counters::default());
    let server = ListeningReactor::start(
        config(),
        Arc::new(EchoServer {
            counters: server_counters.clone(),
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();
    let endpoint = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.wait_ready().unwrap();

    let client_counters = Arc::new(Counters::default());
    let replies = Arc::new(AtomicUsize::new(0));
    let client = ConnectingReactor::start(
        config(),
        Arc::new(EchoClient {
            counters: client_counters.clone(),
            replies: replies.clone(),
            timed_out: Arc::new(AtomicUsize::new(0)),
            payload: b"ping\n",
            idle_timeout: None,
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();

    for _ in 0..SESSIONS {
        let request = client.connect::<()>(addr, None, None, None).unwrap();
        request.wait_timeout(Duration::from_secs(5)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        replies.load(Ordering::SeqCst) == SESSIONS
            && client_counters.disconnected.load(Ordering::SeqCst) == SESSIONS
            && server_counters.disconnected.load(Ordering::SeqCst) == SESSIONS
    }));

    client.shutdown(Duration::from_secs(5));
    server.shutdown(Duration::from_secs(5));

    assert_eq!(client_counters.connected.load(Ordering::SeqCst), SESSIONS);
    assert_eq!(client_counters.disconnected.load(Ordering::SeqCst), SESSIONS);
    assert_eq!(server_counters.connected.load(Ordering::SeqCst), SESSIONS);
    assert_eq!(server_counters.disconnected.load(Ordering::SeqCst), SESSIONS);
}

#[test]
fn echo_round_trip_with_queued_interest_ops() {
    init_tracing();
    const SESSIONS: usize = 2;

    let server_counters = Arc::new(Counters::default());
    let server = ListeningReactor::start(
        queued_config(),
        Arc::new(EchoServer {
            counters: server_counters.clone(),
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();
    let addr = server
        .listen("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .wait_ready()
        .unwrap();

    let client_counters = Arc::new(Counters::default());
    let replies = Arc::new(AtomicUsize::new(0));
    let client = ConnectingReactor::start(
        queued_config(),
        Arc::new(EchoClient {
            counters: client_counters.clone(),
            replies: replies.clone(),
            timed_out: Arc::new(AtomicUsize::new(0)),
            payload: b"ping\n",
            idle_timeout: None,
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();

    for _ in 0..SESSIONS {
        let request = client.connect::<()>(addr, None, None, None).unwrap();
        request.wait_timeout(Duration::from_secs(5)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        replies.load(Ordering::SeqCst) == SESSIONS
            && client_counters.disconnected.load(Ordering::SeqCst) == SESSIONS
            && server_counters.disconnected.load(Ordering::SeqCst) == SESSIONS
    }));

    client.shutdown(Duration::from_secs(5));
    server.shutdown(Duration::from_secs(5));
    assert_eq!(server_counters.connected.load(Ordering::SeqCst), SESSIONS);
}

#[test]
fn connect_deadline_fails_the_pending_request() {
    init_tracing();
    // A backlog of one that nothing ever accepts from; once saturated,
    // further connects stay in progress until their deadline.
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    socket
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    socket.listen(1).unwrap();
    let addr = socket.local_addr().unwrap().as_socket().unwrap();

    let mut parked = Vec::new();
    for _ in 0..16 {
        match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(100)) {
            Ok(stream) => parked.push(stream),
            Err(_) => break,
        }
    }

    let client = ConnectingReactor::start(
        config(),
        Arc::new(EchoClient {
            counters: Arc::new(Counters::default()),
            replies: Arc::new(AtomicUsize::new(0)),
            timed_out: Arc::new(AtomicUsize::new(0)),
            payload: b"late",
            idle_timeout: None,
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();

    let request = client.connect::<()>(addr, None, None, None).unwrap();
    request.set_connect_timeout(Some(Duration::from_millis(200)));

    assert!(wait_until(Duration::from_secs(10), || request.is_done()));
    assert!(matches!(request.error(), Some(ReactorError::Timeout)));

    client.shutdown(Duration::from_secs(5));
    drop(parked);
}

/// Closes its own session while still holding the channel guard.
struct GuardedCloser {
    counters: Arc<Counters>,
}

impl IoHandler for GuardedCloser {
    fn connected(&self, session: &Session) -> io::Result<()> {
        self.counters.connected.fetch_add(1, Ordering::SeqCst);
        let mut channel = session.channel();
        channel.write_all(b"bye")?;
        session.set_event(EventMask::READ);
        session.close();
        drop(channel);
        Ok(())
    }

    fn disconnected(&self, _session: &Session) -> io::Result<()> {
        self.counters.disconnected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn input_ready(&self, _session: &Session) -> io::Result<()> {
        Ok(())
    }

    fn output_ready(&self, _session: &Session) -> io::Result<()> {
        Ok(())
    }

    fn timeout(&self, _session: &Session) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn close_while_holding_the_channel_guard_does_not_hang() {
    init_tracing();
    let server_counters = Arc::new(Counters::default());
    let server = ListeningReactor::start(
        config(),
        Arc::new(EchoServer {
            counters: server_counters.clone(),
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();
    let addr = server
        .listen("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .wait_ready()
        .unwrap();

    let client_counters = Arc::new(Counters::default());
    let client = ConnectingReactor::start(
        config(),
        Arc::new(GuardedCloser {
            counters: client_counters.clone(),
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();

    let request = client.connect::<()>(addr, None, None, None).unwrap();
    let session = request.wait_timeout(Duration::from_secs(5)).unwrap();
    assert!(session.is_closed());

    assert!(wait_until(Duration::from_secs(10), || {
        client_counters.disconnected.load(Ordering::SeqCst) == 1
    }));

    client.shutdown(Duration::from_secs(5));
    server.shutdown(Duration::from_secs(5));
}

#[test]
fn shutdown_with_open_sessions_still_balances_callbacks() {
    init_tracing();
    let server_counters = Arc::new(Counters::default());
    let server = ListeningReactor::start(
        config(),
        Arc::new(EchoServer {
            counters: server_counters.clone(),
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();
    let addr = server
        .listen("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .wait_ready()
        .unwrap();

    let client_counters = Arc::new(Counters::default());
    let client = ConnectingReactor::start(
        config(),
        Arc::new(EchoClient {
            counters: client_counters.clone(),
            replies: Arc::new(AtomicUsize::new(0)),
            timed_out: Arc::new(AtomicUsize::new(0)),
            // No newline: sessions stay open until shutdown closes them.
            payload: b"hold",
            idle_timeout: None,
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();

    for _ in 0..3 {
        client
            .connect::<()>(addr, None, None, None)
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .unwrap();
    }
    assert_eq!(client_counters.connected.load(Ordering::SeqCst), 3);

    client.shutdown(Duration::from_secs(5));
    assert_eq!(client_counters.disconnected.load(Ordering::SeqCst), 3);

    assert!(wait_until(Duration::from_secs(10), || {
        server_counters.disconnected.load(Ordering::SeqCst)
            == server_counters.connected.load(Ordering::SeqCst)
    }));
    server.shutdown(Duration::from_secs(5));
    assert_eq!(
        server_counters.connected.load(Ordering::SeqCst),
        server_counters.disconnected.load(Ordering::SeqCst)
    );
}

#[test]
fn idle_sessions_hit_the_inactivity_timeout() {
    init_tracing();
    let server_counters = Arc::new(Counters::default());
    let server = ListeningReactor::start(
        config(),
        Arc::new(EchoServer {
            counters: server_counters.clone(),
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();
    let addr = server
        .listen("127.0.0.1:0".parse().unwrap())
        .unwrap()
        .wait_ready()
        .unwrap();

    let client_counters = Arc::new(Counters::default());
    let timed_out = Arc::new(AtomicUsize::new(0));
    let client = ConnectingReactor::start(
        config(),
        Arc::new(EchoClient {
            counters: client_counters.clone(),
            replies: Arc::new(AtomicUsize::new(0)),
            timed_out: timed_out.clone(),
            payload: b"quiet",
            idle_timeout: Some(Duration::from_millis(150)),
        }),
        Arc::new(FailFastPolicy),
    )
    .unwrap();

    client
        .connect::<()>(addr, None, None, None)
        .unwrap()
        .wait_timeout(Duration::from_secs(5))
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        timed_out.load(Ordering::SeqCst) >= 1
            && client_counters.disconnected.load(Ordering::SeqCst) == 1
    }));

    client.shutdown(Duration::from_secs(5));
    server.shutdown(Duration::from_secs(5));
}
