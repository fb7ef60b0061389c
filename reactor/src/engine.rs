//! The reactor engine: thread lifecycle, shared status, and the driver
//! loop that channel acquisition strategies plug into.
//!
//! An engine runs one driver thread and a fixed set of worker threads.
//! The driver acquires channels (by connecting out or accepting in,
//! depending on the installed [`ChannelDriver`]) and deals them out to the
//! workers round-robin. Status moves monotonically from `Active` through
//! `ShuttingDown` to `ShutDown`; any worker or driver fault records an
//! audit entry and takes the whole engine down.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::ReactorConfig;
use crate::connecting::SessionRequest;
use crate::error::{AuditEvent, ReactorError};
use crate::handler::{ExceptionPolicy, IoHandler};
use crate::worker::{ChannelEntry, Worker, WorkerCmd, WorkerLink, WAKER};

/// Lifecycle status of a reactor engine. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReactorStatus {
    /// Accepting work and dispatching events
    Active = 0,
    /// Shutdown initiated, threads winding down
    ShuttingDown = 1,
    /// All threads stopped or abandoned
    ShutDown = 2,
}

impl ReactorStatus {
    fn from_u8(v: u8) -> ReactorStatus {
        match v {
            0 => ReactorStatus::Active,
            1 => ReactorStatus::ShuttingDown,
            _ => ReactorStatus::ShutDown,
        }
    }
}

/// State shared by every thread of one engine.
pub(crate) struct EngineShared {
    status: AtomicU8,
    audit: Mutex<Vec<AuditEvent>>,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl EngineShared {
    pub(crate) fn new() -> EngineShared {
        EngineShared {
            status: AtomicU8::new(ReactorStatus::Active as u8),
            audit: Mutex::new(Vec::new()),
            wakers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn status(&self) -> ReactorStatus {
        ReactorStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Advances the status if `target` is further along than the current
    /// value. Returns true if this call performed the transition.
    pub(crate) fn advance(&self, target: ReactorStatus) -> bool {
        let mut cur = self.status.load(Ordering::Acquire);
        while cur < target as u8 {
            match self.status.compare_exchange(
                cur,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
        false
    }

    pub(crate) fn register_waker(&self, waker: Arc<Waker>) {
        self.wakers.lock().push(waker);
    }

    pub(crate) fn wake_all(&self) {
        for waker in self.wakers.lock().iter() {
            let _ = waker.wake();
        }
    }

    /// Records a fatal defect and initiates shutdown.
    pub(crate) fn fault(&self, err: ReactorError) {
        error!(%err, "fatal reactor defect");
        self.audit.lock().push(AuditEvent::now(err));
        self.advance(ReactorStatus::ShuttingDown);
        self.wake_all();
    }

    pub(crate) fn audit_log(&self) -> Vec<AuditEvent> {
        self.audit.lock().clone()
    }
}

/// Context the engine hands to its channel driver on every loop turn.
pub(crate) struct DriverCtx {
    pub(crate) registry: Arc<Registry>,
    workers: Vec<WorkerLink>,
    policy: Arc<dyn ExceptionPolicy>,
    config: ReactorConfig,
    round_robin: usize,
}

impl DriverCtx {
    /// Applies socket options to a freshly acquired channel and hands it
    /// to the next worker in rotation.
    pub(crate) fn distribute(
        &mut self,
        stream: TcpStream,
        request: Option<SessionRequest>,
    ) -> Result<(), ReactorError> {
        if let Err(err) = self.prepare_socket(&stream) {
            if self.policy.handle_io(&err) {
                warn!(%err, "socket preparation failed, dropping channel");
                if let Some(request) = request {
                    request.fail(ReactorError::from(err));
                }
                return Ok(());
            }
            return Err(ReactorError::from(err));
        }
        let attachment = request.as_ref().and_then(|r| r.take_attachment());
        let link = &self.workers[self.round_robin % self.workers.len()];
        self.round_robin = self.round_robin.wrapping_add(1);
        let _ = link.tx.send(WorkerCmd::NewChannel(ChannelEntry {
            stream,
            request,
            attachment,
        }));
        let _ = link.waker.wake();
        Ok(())
    }

    /// Consults the exception policy about an i/o failure on a
    /// driver-owned socket. True means carry on.
    pub(crate) fn recoverable_io(&self, err: &io::Error) -> bool {
        self.policy.handle_io(err)
    }

    fn prepare_socket(&self, stream: &TcpStream) -> io::Result<()> {
        if self.config.tcp_no_delay {
            stream.set_nodelay(true)?;
        }
        if let Some(linger) = self.config.so_linger {
            let sock = socket2::SockRef::from(stream);
            sock.set_linger(Some(linger))?;
        }
        Ok(())
    }
}

/// Strategy for acquiring channels on the driver thread.
///
/// Implementations own the sockets registered with the driver's
/// multiplexer and translate external intents (connect submissions,
/// listen requests) into channels handed off through
/// [`DriverCtx::distribute`].
pub(crate) trait ChannelDriver: Send + 'static {
    /// Drains queued external intents. Called after every multiplexer wait.
    fn process_intents(&mut self, ctx: &mut DriverCtx) -> Result<(), ReactorError>;

    /// Reacts to one readiness event on a driver-owned socket.
    fn handle_event(&mut self, event: &mio::event::Event, ctx: &mut DriverCtx)
        -> Result<(), ReactorError>;

    /// Periodic housekeeping (deadline expiry and the like).
    fn sweep(&mut self, ctx: &mut DriverCtx);

    /// Terminates everything still pending. Called exactly once, last.
    fn shutdown(&mut self, ctx: &mut DriverCtx);
}

struct ThreadSlot {
    name: String,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// A running reactor: one driver thread plus the worker threads.
pub(crate) struct ReactorEngine {
    shared: Arc<EngineShared>,
    threads: Mutex<Vec<ThreadSlot>>,
}

impl ReactorEngine {
    /// Validates the configuration, spawns the workers, builds the driver
    /// through `build`, and starts the driver thread.
    pub(crate) fn start<D, F>(
        config: ReactorConfig,
        handler: Arc<dyn IoHandler>,
        policy: Arc<dyn ExceptionPolicy>,
        build: F,
    ) -> Result<(Arc<ReactorEngine>, Arc<Waker>), ReactorError>
    where
        D: ChannelDriver,
        F: FnOnce() -> Result<D, ReactorError>,
    {
        config.validate()?;
        let shared = Arc::new(EngineShared::new());

        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        shared.register_waker(waker.clone());
        let driver = build()?;

        let mut threads = Vec::with_capacity(config.worker_count + 1);
        let mut links = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let (worker, link) = Worker::new(
                id,
                config.clone(),
                handler.clone(),
                policy.clone(),
                shared.clone(),
            )?;
            links.push(link);
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let handle = thread::Builder::new()
                .name(format!("io-worker-{id}"))
                .spawn(move || {
                    worker.run();
                    let _ = done_tx.send(());
                })
                .map_err(ReactorError::from)?;
            threads.push(ThreadSlot {
                name: format!("io-worker-{id}"),
                done: done_rx,
                handle,
            });
        }

        let ctx = DriverCtx {
            registry,
            workers: links,
            policy,
            config: config.clone(),
            round_robin: 0,
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let driver_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("io-driver".to_string())
            .spawn(move || {
                run_driver(driver, ctx, poll, config, driver_shared);
                let _ = done_tx.send(());
            })
            .map_err(ReactorError::from)?;
        threads.push(ThreadSlot {
            name: "io-driver".to_string(),
            done: done_rx,
            handle,
        });

        let engine = Arc::new(ReactorEngine {
            shared: shared.clone(),
            threads: Mutex::new(threads),
        });
        Ok((engine, waker))
    }

    /// Current lifecycle status.
    pub(crate) fn status(&self) -> ReactorStatus {
        self.shared.status()
    }

    /// Snapshot of the recorded fatal defects.
    pub(crate) fn audit_log(&self) -> Vec<AuditEvent> {
        self.shared.audit_log()
    }

    /// Initiates shutdown and waits up to `grace` for the threads to stop.
    /// Threads still running past the deadline are abandoned, not killed.
    pub(crate) fn shutdown(&self, grace: Duration) {
        self.shared.advance(ReactorStatus::ShuttingDown);
        self.shared.wake_all();
        let slots: Vec<ThreadSlot> = self.threads.lock().drain(..).collect();
        let deadline = Instant::now() + grace;
        for slot in slots {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match slot.done.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = slot.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(thread = %slot.name, "thread did not stop within grace period");
                }
            }
        }
        self.shared.advance(ReactorStatus::ShutDown);
    }
}

fn run_driver<D: ChannelDriver>(
    mut driver: D,
    mut ctx: DriverCtx,
    mut poll: Poll,
    config: ReactorConfig,
    shared: Arc<EngineShared>,
) {
    debug!("i/o driver started");
    let mut events = Events::with_capacity(128);
    let mut last_sweep = Instant::now();
    'outer: loop {
        if shared.status() >= ReactorStatus::ShuttingDown {
            break;
        }
        match poll.poll(&mut events, Some(config.select_interval)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                shared.fault(ReactorError::from(err));
                break;
            }
        }
        if let Err(err) = driver.process_intents(&mut ctx) {
            shared.fault(err);
            break;
        }
        for event in events.iter() {
            if event.token() == WAKER {
                continue;
            }
            if let Err(err) = driver.handle_event(event, &mut ctx) {
                shared.fault(err);
                break 'outer;
            }
        }
        if last_sweep.elapsed() >= config.select_interval {
            last_sweep = Instant::now();
            driver.sweep(&mut ctx);
        }
    }
    driver.shutdown(&mut ctx);
    debug!("i/o driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_advances_monotonically() {
        let shared = EngineShared::new();
        assert_eq!(shared.status(), ReactorStatus::Active);
        assert!(shared.advance(ReactorStatus::ShuttingDown));
        assert!(!shared.advance(ReactorStatus::ShuttingDown));
        assert!(shared.advance(ReactorStatus::ShutDown));
        assert!(!shared.advance(ReactorStatus::ShuttingDown));
        assert_eq!(shared.status(), ReactorStatus::ShutDown);
    }

    #[test]
    fn fault_records_audit_entry_and_shuts_down() {
        let shared = EngineShared::new();
        shared.fault(ReactorError::HandlerFault("broken".to_string()));
        assert_eq!(shared.status(), ReactorStatus::ShuttingDown);
        let log = shared.audit_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].error.to_string().contains("broken"));
    }
}
