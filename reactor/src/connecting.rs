//! The connecting reactor: outbound channel acquisition.
//!
//! `connect` submissions travel over a queue to the driver thread, which
//! opens a non-blocking socket, optionally binds it to a local address,
//! and initiates the connect. Sockets that connect immediately are handed
//! straight to a worker; the rest are registered for write readiness and
//! tracked until the connect completes, fails, or exceeds its deadline.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpStream;
use mio::{Interest, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::config::ReactorConfig;
use crate::engine::{ChannelDriver, DriverCtx, ReactorEngine, ReactorStatus};
use crate::error::{AuditEvent, ReactorError};
use crate::future::{CompletionCallback, IoFuture};
use crate::handler::{ExceptionPolicy, IoHandler};
use crate::session::Session;

/// Resolves a `host:port` string to a socket address, preferring the
/// first address the resolver yields.
pub fn resolve_addr(addr: &str) -> Result<SocketAddr, ReactorError> {
    addr.to_socket_addrs()
        .map_err(|_| ReactorError::Unresolved(addr.to_string()))?
        .next()
        .ok_or_else(|| ReactorError::Unresolved(addr.to_string()))
}

struct RequestInner {
    remote: SocketAddr,
    local: Option<SocketAddr>,
    future: IoFuture<Session>,
    connect_timeout: Mutex<Option<Duration>>,
    attachment: Mutex<Option<(TypeId, Arc<dyn Any + Send + Sync>)>>,
}

/// Tracks one outbound connect from submission to session or failure.
///
/// Cheap to clone; all clones observe the same outcome. The deadline is
/// read live on every expiry sweep, so setting it after submission still
/// takes effect while the connect is in flight.
#[derive(Clone)]
pub struct SessionRequest {
    inner: Arc<RequestInner>,
}

impl SessionRequest {
    fn new(
        remote: SocketAddr,
        local: Option<SocketAddr>,
        attachment: Option<(TypeId, Arc<dyn Any + Send + Sync>)>,
        callback: Option<Box<dyn CompletionCallback<Session>>>,
    ) -> SessionRequest {
        SessionRequest {
            inner: Arc::new(RequestInner {
                remote,
                local,
                future: IoFuture::new(callback),
                connect_timeout: Mutex::new(None),
                attachment: Mutex::new(attachment),
            }),
        }
    }

    /// The remote address this request connects to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// The local address the socket is bound to, if one was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    /// Sets the connect deadline. May be called before or after
    /// submission; a connect already in flight picks it up on the next
    /// expiry sweep.
    pub fn set_connect_timeout(&self, timeout: Option<Duration>) {
        *self.inner.connect_timeout.lock() = timeout;
    }

    /// The currently configured connect deadline.
    pub fn connect_timeout(&self) -> Option<Duration> {
        *self.inner.connect_timeout.lock()
    }

    /// Whether the request has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.inner.future.is_done()
    }

    /// The session, if the connect has completed.
    pub fn session(&self) -> Option<Session> {
        match self.inner.future.try_result() {
            Some(Ok(session)) => Some(session),
            _ => None,
        }
    }

    /// The failure, if the connect has failed or been cancelled.
    pub fn error(&self) -> Option<ReactorError> {
        self.inner.future.error()
    }

    /// Blocks until the connect terminates.
    pub fn wait(&self) -> Result<Session, ReactorError> {
        self.inner.future.wait()
    }

    /// Blocks until the connect terminates or `timeout` elapses. A timed
    /// out wait leaves the request pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Session, ReactorError> {
        self.inner.future.wait_timeout(timeout)
    }

    /// Cancels the request if it has not terminated yet.
    pub fn cancel(&self) -> bool {
        self.inner.future.cancel()
    }

    pub(crate) fn complete(&self, session: Session) {
        self.inner.future.complete(session);
    }

    pub(crate) fn fail(&self, err: ReactorError) {
        self.inner.future.fail(err);
    }

    pub(crate) fn take_attachment(&self) -> Option<(TypeId, Arc<dyn Any + Send + Sync>)> {
        self.inner.attachment.lock().take()
    }
}

/// A reactor that acquires channels by connecting to remote endpoints.
pub struct ConnectingReactor {
    engine: Arc<ReactorEngine>,
    tx: Sender<SessionRequest>,
    waker: Arc<Waker>,
}

impl ConnectingReactor {
    /// Starts the reactor threads with the given configuration, session
    /// handler, and exception policy.
    pub fn start(
        config: ReactorConfig,
        handler: Arc<dyn IoHandler>,
        policy: Arc<dyn ExceptionPolicy>,
    ) -> Result<ConnectingReactor, ReactorError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (engine, waker) = ReactorEngine::start(config, handler, policy, move || {
            Ok(ConnectingDriver {
                intents: rx,
                pending: HashMap::new(),
                next_token: 1,
            })
        })?;
        Ok(ConnectingReactor { engine, tx, waker })
    }

    /// Submits an outbound connect and returns the request tracking it.
    ///
    /// The optional attachment is transferred into the session's typed
    /// extension store before the `connected` callback fires.
    pub fn connect<T: Any + Send + Sync>(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        attachment: Option<T>,
        callback: Option<Box<dyn CompletionCallback<Session>>>,
    ) -> Result<SessionRequest, ReactorError> {
        if self.engine.status() != ReactorStatus::Active {
            return Err(ReactorError::IllegalState);
        }
        let raw = attachment.map(|value| {
            (
                TypeId::of::<T>(),
                Arc::new(value) as Arc<dyn Any + Send + Sync>,
            )
        });
        let request = SessionRequest::new(remote, local, raw, callback);
        self.tx
            .send(request.clone())
            .map_err(|_| ReactorError::IllegalState)?;
        let _ = self.waker.wake();
        Ok(request)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ReactorStatus {
        self.engine.status()
    }

    /// Snapshot of recorded fatal defects.
    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.engine.audit_log()
    }

    /// Shuts the reactor down, waiting up to `grace` for its threads.
    pub fn shutdown(&self, grace: Duration) {
        self.engine.shutdown(grace);
    }
}

struct PendingConnect {
    stream: TcpStream,
    request: SessionRequest,
    submitted: Instant,
}

struct ConnectingDriver {
    intents: Receiver<SessionRequest>,
    pending: HashMap<Token, PendingConnect>,
    next_token: usize,
}

impl ConnectingDriver {
    /// Opens a non-blocking socket and starts the connect. The flag is
    /// true when the connect completed synchronously.
    fn open_socket(request: &SessionRequest) -> io::Result<(TcpStream, bool)> {
        let remote = request.remote_addr();
        let socket = Socket::new(
            Domain::for_address(remote),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        if let Some(local) = request.local_addr() {
            socket.set_reuse_address(true)?;
            socket.bind(&local.into())?;
        }
        let connected = match socket.connect(&remote.into()) {
            Ok(()) => true,
            Err(err) if in_progress(&err) => false,
            Err(err) => return Err(err),
        };
        let stream = TcpStream::from_std(socket.into());
        Ok((stream, connected))
    }
}

#[cfg(unix)]
fn in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

impl ChannelDriver for ConnectingDriver {
    fn process_intents(&mut self, ctx: &mut DriverCtx) -> Result<(), ReactorError> {
        while let Ok(request) = self.intents.try_recv() {
            if request.is_done() {
                continue;
            }
            match Self::open_socket(&request) {
                Ok((stream, true)) => {
                    trace!(remote = %request.remote_addr(), "connected synchronously");
                    ctx.distribute(stream, Some(request))?;
                }
                Ok((mut stream, false)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    ctx.registry
                        .register(&mut stream, token, Interest::WRITABLE)
                        .map_err(ReactorError::from)?;
                    self.pending.insert(
                        token,
                        PendingConnect {
                            stream,
                            request,
                            submitted: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    debug!(remote = %request.remote_addr(), %err, "connect failed to start");
                    request.fail(ReactorError::from(err));
                }
            }
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        event: &mio::event::Event,
        ctx: &mut DriverCtx,
    ) -> Result<(), ReactorError> {
        let Some(mut pending) = self.pending.remove(&event.token()) else {
            return Ok(());
        };
        match pending.stream.take_error() {
            Ok(Some(err)) | Err(err) => {
                debug!(remote = %pending.request.remote_addr(), %err, "connect failed");
                pending.request.fail(ReactorError::from(err));
                return Ok(());
            }
            Ok(None) => {}
        }
        // A writable socket with no pending error may still be mid
        // handshake; peer_addr distinguishes the two.
        match pending.stream.peer_addr() {
            Ok(_) => {
                ctx.registry
                    .deregister(&mut pending.stream)
                    .map_err(ReactorError::from)?;
                ctx.distribute(pending.stream, Some(pending.request))?;
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::NotConnected
                    || err.raw_os_error() == Some(libc_einprogress()) =>
            {
                self.pending.insert(event.token(), pending);
            }
            Err(err) => {
                pending.request.fail(ReactorError::from(err));
            }
        }
        Ok(())
    }

    fn sweep(&mut self, _ctx: &mut DriverCtx) {
        self.pending.retain(|_, pending| {
            if pending.request.is_done() {
                return false;
            }
            match pending.request.connect_timeout() {
                Some(timeout) if pending.submitted.elapsed() >= timeout => {
                    debug!(remote = %pending.request.remote_addr(), "connect timed out");
                    pending.request.fail(ReactorError::Timeout);
                    false
                }
                _ => true,
            }
        });
    }

    fn shutdown(&mut self, _ctx: &mut DriverCtx) {
        while let Ok(request) = self.intents.try_recv() {
            request.cancel();
        }
        for (_, pending) in self.pending.drain() {
            pending.request.cancel();
        }
    }
}

#[cfg(unix)]
fn libc_einprogress() -> i32 {
    libc::EINPROGRESS
}

#[cfg(not(unix))]
fn libc_einprogress() -> i32 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_addr_accepts_literal_and_rejects_garbage() {
        let addr = resolve_addr("127.0.0.1:8080").unwrap();
        assert_eq!(addr.port(), 8080);
        let err = resolve_addr("definitely-not-a-host!:0").unwrap_err();
        assert!(matches!(err, ReactorError::Unresolved(_)));
    }

    #[test]
    fn request_deadline_is_readable_after_submission() {
        let request = SessionRequest::new("127.0.0.1:1".parse().unwrap(), None, None, None);
        assert!(request.connect_timeout().is_none());
        request.set_connect_timeout(Some(Duration::from_millis(250)));
        assert_eq!(request.connect_timeout(), Some(Duration::from_millis(250)));
        assert!(!request.is_done());
        assert!(request.cancel());
        assert!(matches!(request.error(), Some(ReactorError::Cancelled)));
    }
}
