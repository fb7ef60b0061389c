//! Worker threads: each owns one multiplexer and a disjoint set of
//! sessions, and turns readiness notifications into handler callbacks.
//!
//! Workers never share sessions. Channels arrive over a command queue from
//! the driver thread, interest changes and closes arrive over the same
//! queue (or act on the registry directly when queueing is disabled), and
//! a waker breaks the multiplexer wait whenever the queue gains work.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, trace, warn};

use crate::config::ReactorConfig;
use crate::connecting::SessionRequest;
use crate::engine::{EngineShared, ReactorStatus};
use crate::error::ReactorError;
use crate::handler::{ExceptionPolicy, IoHandler};
use crate::interest::EventMask;
use crate::session::Session;

pub(crate) const WAKER: Token = Token(0);

/// A channel handed to a worker, with the connect intent that produced it
/// (absent for accepted channels).
pub(crate) struct ChannelEntry {
    pub stream: TcpStream,
    pub request: Option<SessionRequest>,
    pub attachment: Option<(TypeId, Arc<dyn Any + Send + Sync>)>,
}

pub(crate) enum WorkerCmd {
    NewChannel(ChannelEntry),
    InterestOps { token: Token },
    Closed { token: Token },
}

/// Handle the driver uses to feed a worker.
#[derive(Clone)]
pub(crate) struct WorkerLink {
    pub tx: Sender<WorkerCmd>,
    pub waker: Arc<Waker>,
}

enum Outcome {
    Continue,
    Fatal(ReactorError),
}

pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    registry: Arc<Registry>,
    cmd_tx: Sender<WorkerCmd>,
    cmd_rx: Receiver<WorkerCmd>,
    waker: Arc<Waker>,
    config: ReactorConfig,
    handler: Arc<dyn IoHandler>,
    policy: Arc<dyn ExceptionPolicy>,
    shared: Arc<EngineShared>,
    sessions: HashMap<Token, Session>,
    next_token: usize,
    last_sweep: Instant,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        config: ReactorConfig,
        handler: Arc<dyn IoHandler>,
        policy: Arc<dyn ExceptionPolicy>,
        shared: Arc<EngineShared>,
    ) -> Result<(Worker, WorkerLink), ReactorError> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        shared.register_waker(waker.clone());
        let link = WorkerLink {
            tx: cmd_tx.clone(),
            waker: waker.clone(),
        };
        Ok((
            Worker {
                id,
                poll,
                registry,
                cmd_tx,
                cmd_rx,
                waker,
                config,
                handler,
                policy,
                shared,
                sessions: HashMap::new(),
                next_token: 1,
                last_sweep: Instant::now(),
            },
            link,
        ))
    }

    pub(crate) fn run(mut self) {
        debug!(worker = self.id, "i/o worker started");
        let mut events = Events::with_capacity(256);
        loop {
            if self.shared.status() >= ReactorStatus::ShuttingDown {
                break;
            }
            match self.poll.poll(&mut events, Some(self.config.select_interval)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.shared.fault(ReactorError::from(err));
                    break;
                }
            }
            if let Outcome::Fatal(err) = self.drain_commands() {
                self.shared.fault(err);
                break;
            }
            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                if let Outcome::Fatal(err) = self.dispatch(event) {
                    self.shared.fault(err);
                    self.teardown();
                    return;
                }
            }
            if self.last_sweep.elapsed() >= self.config.select_interval {
                self.last_sweep = Instant::now();
                if let Outcome::Fatal(err) = self.sweep_timeouts() {
                    self.shared.fault(err);
                    break;
                }
            }
        }
        self.teardown();
        debug!(worker = self.id, "i/o worker stopped");
    }

    fn drain_commands(&mut self) -> Outcome {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                WorkerCmd::NewChannel(entry) => {
                    if let Outcome::Fatal(err) = self.open_session(entry) {
                        return Outcome::Fatal(err);
                    }
                }
                WorkerCmd::InterestOps { token } => {
                    if let Some(session) = self.sessions.get(&token) {
                        if let Err(err) = session.apply_interest_now() {
                            trace!(worker = self.id, token = token.0, %err,
                                "deferred interest update failed");
                        }
                    }
                }
                WorkerCmd::Closed { token } => {
                    if let Some(session) = self.sessions.remove(&token) {
                        session.detach();
                        if let Outcome::Fatal(err) =
                            self.guard(&session, |h, s| h.disconnected(s))
                        {
                            return Outcome::Fatal(err);
                        }
                    }
                }
            }
        }
        Outcome::Continue
    }

    fn open_session(&mut self, entry: ChannelEntry) -> Outcome {
        let ChannelEntry {
            stream,
            request,
            attachment,
        } = entry;
        let (local, peer) = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => (local, peer),
            (Err(err), _) | (_, Err(err)) => {
                if let Some(request) = request {
                    request.fail(ReactorError::from(err));
                }
                return Outcome::Continue;
            }
        };
        let token = Token(self.next_token);
        self.next_token += 1;
        let session = Session::new(
            token,
            stream,
            local,
            peer,
            self.registry.clone(),
            self.cmd_tx.clone(),
            self.waker.clone(),
            self.config.interest_ops_queueing,
        );
        session.transfer_attachment(attachment);
        self.sessions.insert(token, session.clone());
        debug!(worker = self.id, %session, "session opened");
        if let Outcome::Fatal(err) = self.guard(&session, |h, s| h.connected(s)) {
            return Outcome::Fatal(err);
        }
        if let Some(request) = request {
            request.complete(session);
        }
        Outcome::Continue
    }

    fn dispatch(&mut self, event: &mio::event::Event) -> Outcome {
        let session = match self.sessions.get(&event.token()) {
            Some(session) => session.clone(),
            None => return Outcome::Continue,
        };
        if session.is_closed() {
            return Outcome::Continue;
        }
        let mask = session.event_mask();
        if (event.is_readable() || event.is_read_closed()) && mask.contains(EventMask::READ) {
            session.touch();
            if let Outcome::Fatal(err) = self.guard(&session, |h, s| h.input_ready(s)) {
                return Outcome::Fatal(err);
            }
        }
        if session.is_closed() {
            return Outcome::Continue;
        }
        if (event.is_writable() || event.is_write_closed())
            && session.event_mask().contains(EventMask::WRITE)
        {
            session.touch();
            if let Outcome::Fatal(err) = self.guard(&session, |h, s| h.output_ready(s)) {
                return Outcome::Fatal(err);
            }
        }
        Outcome::Continue
    }

    fn sweep_timeouts(&mut self) -> Outcome {
        let overdue: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| {
                !s.is_closed()
                    && s.socket_timeout()
                        .map(|t| s.idle_for() >= t)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        for session in overdue {
            if let Outcome::Fatal(err) = self.guard(&session, |h, s| h.timeout(s)) {
                return Outcome::Fatal(err);
            }
        }
        Outcome::Continue
    }

    /// Runs a handler callback, containing panics and consulting the
    /// exception policy on failure. A recoverable verdict closes the
    /// offending session only; anything else takes the whole reactor down.
    fn guard<F>(&self, session: &Session, f: F) -> Outcome
    where
        F: FnOnce(&dyn IoHandler, &Session) -> io::Result<()>,
    {
        let handler = self.handler.as_ref();
        match panic::catch_unwind(AssertUnwindSafe(|| f(handler, session))) {
            Ok(Ok(())) => Outcome::Continue,
            Ok(Err(err)) => {
                if self.policy.handle_io(&err) {
                    warn!(worker = self.id, %session, %err, "handler i/o error, closing session");
                    session.close();
                    Outcome::Continue
                } else {
                    Outcome::Fatal(ReactorError::from(err))
                }
            }
            Err(payload) => {
                let msg = panic_message(payload);
                if self.policy.handle_fault(&msg) {
                    warn!(worker = self.id, %session, fault = %msg,
                        "handler fault, closing session");
                    session.close();
                    Outcome::Continue
                } else {
                    Outcome::Fatal(ReactorError::HandlerFault(msg))
                }
            }
        }
    }

    /// Closes every remaining session and flushes the command queue so
    /// each `connected` notification is balanced by a `disconnected` one
    /// and pending connect intents terminate.
    fn teardown(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                WorkerCmd::NewChannel(entry) => {
                    if let Some(request) = entry.request {
                        request.cancel();
                    }
                }
                WorkerCmd::Closed { token } => {
                    if let Some(session) = self.sessions.remove(&token) {
                        session.detach();
                        self.notify_disconnected(&session);
                    }
                }
                WorkerCmd::InterestOps { .. } => {}
            }
        }
        let remaining: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in remaining {
            session.close();
            self.notify_disconnected(&session);
        }
    }

    fn notify_disconnected(&self, session: &Session) {
        let handler = self.handler.as_ref();
        if panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = handler.disconnected(session);
        }))
        .is_err()
        {
            warn!(worker = self.id, %session, "handler fault during teardown");
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unidentified handler fault".to_string()
    }
}
