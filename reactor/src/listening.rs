//! The listening reactor: inbound channel acquisition.
//!
//! Listen requests travel over a queue to the driver thread, which binds
//! the socket, registers it for accept readiness, and reports the outcome
//! through the endpoint handle. Accepted channels are dealt to the workers
//! like any other. Accepting can be paused and resumed as a whole; while
//! paused, new listen requests queue up until resume.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpListener;
use mio::{Interest, Token, Waker};
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::config::ReactorConfig;
use crate::engine::{ChannelDriver, DriverCtx, ReactorEngine, ReactorStatus};
use crate::error::{AuditEvent, ReactorError};
use crate::handler::{ExceptionPolicy, IoHandler};

const BACKLOG: i32 = 1024;

#[derive(Debug, Clone)]
enum EndpointState {
    Pending,
    Open { addr: SocketAddr, token: Token },
    Failed(ReactorError),
    Closed,
}

struct EndpointInner {
    requested: SocketAddr,
    state: Mutex<EndpointState>,
    cond: Condvar,
    cmd_tx: Sender<ListenCmd>,
    waker: Arc<Waker>,
}

/// Tracks one listening socket from request to open or failure.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct ListenerEndpoint {
    inner: Arc<EndpointInner>,
}

impl ListenerEndpoint {
    fn new(
        requested: SocketAddr,
        cmd_tx: Sender<ListenCmd>,
        waker: Arc<Waker>,
    ) -> ListenerEndpoint {
        ListenerEndpoint {
            inner: Arc::new(EndpointInner {
                requested,
                state: Mutex::new(EndpointState::Pending),
                cond: Condvar::new(),
                cmd_tx,
                waker,
            }),
        }
    }

    /// The address the listen was requested for (port may be zero).
    pub fn requested_addr(&self) -> SocketAddr {
        self.inner.requested
    }

    /// The actual bound address, once open.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        match *self.inner.state.lock() {
            EndpointState::Open { addr, .. } => Some(addr),
            _ => None,
        }
    }

    /// Whether the endpoint has been closed or failed.
    pub fn is_closed(&self) -> bool {
        matches!(
            *self.inner.state.lock(),
            EndpointState::Closed | EndpointState::Failed(_)
        )
    }

    /// Blocks until the bind outcome is known and returns the bound
    /// address on success.
    pub fn wait_ready(&self) -> Result<SocketAddr, ReactorError> {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                EndpointState::Pending => self.inner.cond.wait(&mut state),
                EndpointState::Open { addr, .. } => return Ok(*addr),
                EndpointState::Failed(err) => return Err(err.clone()),
                EndpointState::Closed => return Err(ReactorError::IllegalState),
            }
        }
    }

    /// Closes the endpoint. The listening socket is released on the
    /// driver thread; sessions already accepted are unaffected.
    pub fn close(&self) {
        let token = {
            let mut state = self.inner.state.lock();
            let token = match *state {
                EndpointState::Open { token, .. } => Some(token),
                EndpointState::Closed | EndpointState::Failed(_) => return,
                EndpointState::Pending => None,
            };
            *state = EndpointState::Closed;
            self.inner.cond.notify_all();
            token
        };
        if let Some(token) = token {
            let _ = self.inner.cmd_tx.send(ListenCmd::Close(token));
            let _ = self.inner.waker.wake();
        }
    }

    fn complete(&self, addr: SocketAddr, token: Token) {
        let mut state = self.inner.state.lock();
        if matches!(*state, EndpointState::Pending) {
            *state = EndpointState::Open { addr, token };
            self.inner.cond.notify_all();
        }
    }

    fn fail(&self, err: ReactorError) {
        let mut state = self.inner.state.lock();
        if matches!(*state, EndpointState::Pending) {
            *state = EndpointState::Failed(err);
            self.inner.cond.notify_all();
        }
    }

    fn mark_closed(&self) {
        let mut state = self.inner.state.lock();
        *state = EndpointState::Closed;
        self.inner.cond.notify_all();
    }
}

enum ListenCmd {
    Listen(ListenerEndpoint),
    Close(Token),
    Pause,
    Resume,
}

/// A reactor that acquires channels by accepting inbound connections.
pub struct ListeningReactor {
    engine: Arc<ReactorEngine>,
    tx: Sender<ListenCmd>,
    waker: Arc<Waker>,
    endpoints: Arc<Mutex<HashMap<Token, ListenerEndpoint>>>,
}

impl ListeningReactor {
    /// Starts the reactor threads with the given configuration, session
    /// handler, and exception policy.
    pub fn start(
        config: ReactorConfig,
        handler: Arc<dyn IoHandler>,
        policy: Arc<dyn ExceptionPolicy>,
    ) -> Result<ListeningReactor, ReactorError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let endpoints = Arc::new(Mutex::new(HashMap::new()));
        let driver_endpoints = endpoints.clone();
        let (engine, waker) = ReactorEngine::start(config, handler, policy, move || {
            Ok(ListeningDriver {
                intents: rx,
                listeners: HashMap::new(),
                endpoints: driver_endpoints,
                paused: false,
                pending_binds: Vec::new(),
                next_token: 1,
            })
        })?;
        Ok(ListeningReactor {
            engine,
            tx,
            waker,
            endpoints,
        })
    }

    /// Requests a listening socket on `addr` and returns the endpoint
    /// tracking it. Bind on a port already in use fails the endpoint.
    pub fn listen(&self, addr: SocketAddr) -> Result<ListenerEndpoint, ReactorError> {
        if self.engine.status() != ReactorStatus::Active {
            return Err(ReactorError::IllegalState);
        }
        let endpoint = ListenerEndpoint::new(addr, self.tx.clone(), self.waker.clone());
        self.tx
            .send(ListenCmd::Listen(endpoint.clone()))
            .map_err(|_| ReactorError::IllegalState)?;
        let _ = self.waker.wake();
        Ok(endpoint)
    }

    /// Snapshot of the currently open endpoints.
    pub fn endpoints(&self) -> Vec<ListenerEndpoint> {
        self.endpoints.lock().values().cloned().collect()
    }

    /// Suspends accepting: all listening sockets are released and their
    /// bound addresses remembered for [`resume`](Self::resume).
    pub fn pause(&self) -> Result<(), ReactorError> {
        self.signal(ListenCmd::Pause)
    }

    /// Rebinds the addresses released by the last pause and resumes
    /// processing queued listen requests.
    pub fn resume(&self) -> Result<(), ReactorError> {
        self.signal(ListenCmd::Resume)
    }

    fn signal(&self, cmd: ListenCmd) -> Result<(), ReactorError> {
        if self.engine.status() != ReactorStatus::Active {
            return Err(ReactorError::IllegalState);
        }
        self.tx.send(cmd).map_err(|_| ReactorError::IllegalState)?;
        let _ = self.waker.wake();
        Ok(())
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

struct ListeningDriver {
    intents: Receiver<ListenCmd>,
    listeners: HashMap<Token, (TcpListener, ListenerEndpoint)>,
    endpoints: Arc<Mutex<HashMap<Token, ListenerEndpoint>>>,
    paused: bool,
    pending_binds: Vec<ListenerEndpoint>,
    next_token: usize,
}

impl ListeningDriver {
    /// Binds a listening socket without address reuse, so a second bind
    /// of a busy port reports failure instead of silently sharing it.
    fn open_listener(addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;
        Ok(TcpListener::from_std(socket.into()))
    }

    fn bind_endpoint(
        &mut self,
        endpoint: ListenerEndpoint,
        ctx: &mut DriverCtx,
    ) -> Result<(), ReactorError> {
        if endpoint.is_closed() {
            return Ok(());
        }
        let addr = endpoint.requested_addr();
        match Self::open_listener(addr) {
            Ok(mut listener) => {
                let bound = listener.local_addr().map_err(ReactorError::from)?;
                let token = Token(self.next_token);
                self.next_token += 1;
                ctx.registry
                    .register(&mut listener, token, Interest::READABLE)
                    .map_err(ReactorError::from)?;
                endpoint.complete(bound, token);
                self.endpoints.lock().insert(token, endpoint.clone());
                self.listeners.insert(token, (listener, endpoint));
                debug!(%bound, "listener opened");
                Ok(())
            }
            Err(err) => {
                debug!(%addr, %err, "bind failed");
                let recoverable = ctx.recoverable_io(&err);
                let err = ReactorError::from(err);
                endpoint.fail(err.clone());
                if recoverable {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn pause_all(&mut self, ctx: &mut DriverCtx) {
        self.paused = true;
        let drained: Vec<(Token, (TcpListener, ListenerEndpoint))> =
            self.listeners.drain().collect();
        for (token, (mut listener, endpoint)) in drained {
            if let Some(addr) = endpoint.bound_addr() {
                self.pending_binds
                    .push(ListenerEndpoint::new(addr, endpoint.inner.cmd_tx.clone(), endpoint.inner.waker.clone()));
            }
            let _ = ctx.registry.deregister(&mut listener);
            endpoint.mark_closed();
            self.endpoints.lock().remove(&token);
        }
        debug!("accepting paused");
    }

    fn accept_loop(&mut self, token: Token, ctx: &mut DriverCtx) -> Result<(), ReactorError> {
        loop {
            let accepted = match self.listeners.get(&token) {
                Some((listener, _)) => listener.accept(),
                None => return Ok(()),
            };
            match accepted {
                Ok((stream, _)) => ctx.distribute(stream, None)?,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if ctx.recoverable_io(&err) {
                        warn!(%err, "accept failed");
                        return Ok(());
                    }
                    return Err(ReactorError::from(err));
                }
            }
        }
    }
}

impl ChannelDriver for ListeningDriver {
    fn process_intents(&mut self, ctx: &mut DriverCtx) -> Result<(), ReactorError> {
        while let Ok(cmd) = self.intents.try_recv() {
            match cmd {
                ListenCmd::Listen(endpoint) => {
                    if self.paused {
                        self.pending_binds.push(endpoint);
                    } else {
                        self.bind_endpoint(endpoint, ctx)?;
                    }
                }
                ListenCmd::Close(token) => {
                    if let Some((mut listener, endpoint)) = self.listeners.remove(&token) {
                        let _ = ctx.registry.deregister(&mut listener);
                        endpoint.mark_closed();
                        self.endpoints.lock().remove(&token);
                    }
                }
                ListenCmd::Pause => {
                    if !self.paused {
                        self.pause_all(ctx);
                    }
                }
                ListenCmd::Resume => {
                    if self.paused {
                        self.paused = false;
                        let queued: Vec<ListenerEndpoint> =
                            self.pending_binds.drain(..).collect();
                        for endpoint in queued {
                            self.bind_endpoint(endpoint, ctx)?;
                        }
                        debug!("accepting resumed");
                    }
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
        self.accept_loop(event.token(), ctx)
    }

    fn sweep(&mut self, _ctx: &mut DriverCtx) {}

    fn shutdown(&mut self, ctx: &mut DriverCtx) {
        while let Ok(cmd) = self.intents.try_recv() {
            if let ListenCmd::Listen(endpoint) = cmd {
                endpoint.mark_closed();
            }
        }
        for endpoint in self.pending_binds.drain(..) {
            endpoint.mark_closed();
        }
        let drained: Vec<(Token, (TcpListener, ListenerEndpoint))> =
            self.listeners.drain().collect();
        for (token, (mut listener, endpoint)) in drained {
            let _ = ctx.registry.deregister(&mut listener);
            endpoint.mark_closed();
            self.endpoints.lock().remove(&token);
        }
    }
}
