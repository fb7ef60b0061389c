//! The session abstraction: one non-blocking duplex channel plus its
//! interest mask, typed extension store, and lifecycle status.
//!
//! Sessions are created and destroyed by the worker thread that owns their
//! registration, but every accessor and mutator here is safe to call from
//! any thread. Interest-mask mutation either re-registers the channel
//! directly (the multiplexer registry is thread-safe) or defers through the
//! owning worker's command queue, depending on configuration; both paths
//! wake the worker so the new mask takes effect by its next wait cycle.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use mio::net::TcpStream;
use mio::{Registry, Token, Waker};
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::handler::BufferStatus;
use crate::interest::EventMask;
use crate::worker::WorkerCmd;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// The session is open and dispatching events
    Active = 0,
    /// An orderly close has been initiated but not yet finished
    Closing = 1,
    /// The session is closed; the channel has been shut down
    Closed = 2,
}

impl SessionStatus {
    fn from_u8(v: u8) -> SessionStatus {
        match v {
            0 => SessionStatus::Active,
            1 => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }
}

/// Typed per-session extension store keyed by type.
///
/// Replaces a stringly-keyed attribute map: each stored value occupies the
/// slot of its concrete type and comes back without unchecked downcasts.
#[derive(Default)]
pub struct ExtMap {
    slots: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ExtMap {
    /// Stores a value in the slot of its type, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, value: T) {
        self.slots
            .lock()
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Fetches the value stored in the slot of `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.slots.lock().get(&TypeId::of::<T>()).cloned()?;
        slot.downcast::<T>().ok()
    }

    /// Removes and returns the value stored in the slot of `T`.
    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.slots.lock().remove(&TypeId::of::<T>())?;
        slot.downcast::<T>().ok()
    }

    /// Inserts an already type-erased value under an explicit type id.
    ///
    /// Used to transfer a connect intent's attachment into the session it
    /// produced.
    pub(crate) fn insert_raw(&self, id: TypeId, value: Arc<dyn Any + Send + Sync>) {
        self.slots.lock().insert(id, value);
    }
}

pub(crate) struct SessionInner {
    token: Token,
    stream: Mutex<TcpStream>,
    registered: AtomicBool,
    local: SocketAddr,
    peer: SocketAddr,
    status: AtomicU8,
    mask: Mutex<EventMask>,
    socket_timeout: Mutex<Option<Duration>>,
    last_activity: Mutex<Instant>,
    exts: ExtMap,
    buffer_status: Mutex<Option<Arc<dyn BufferStatus>>>,
    registry: Arc<Registry>,
    ops_queued: bool,
    cmd_tx: Sender<WorkerCmd>,
    waker: Arc<Waker>,
}

/// Handle to one reactor-owned duplex channel.
///
/// Cheap to clone; all clones refer to the same underlying channel.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Exclusive guard over a session's raw channel, usable wherever a
/// `Read + Write` non-blocking stream is expected (e.g. codec fill/flush).
pub struct ChannelGuard<'a> {
    guard: MutexGuard<'a, TcpStream>,
}

impl Read for ChannelGuard<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.guard.read(buf)
    }
}

impl Write for ChannelGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        token: Token,
        stream: TcpStream,
        local: SocketAddr,
        peer: SocketAddr,
        registry: Arc<Registry>,
        cmd_tx: Sender<WorkerCmd>,
        waker: Arc<Waker>,
        ops_queued: bool,
    ) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                token,
                stream: Mutex::new(stream),
                registered: AtomicBool::new(false),
                local,
                peer,
                status: AtomicU8::new(SessionStatus::Active as u8),
                mask: Mutex::new(EventMask::empty()),
                socket_timeout: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                exts: ExtMap::default(),
                buffer_status: Mutex::new(None),
                registry,
                ops_queued,
                cmd_tx,
                waker,
            }),
        }
    }

    /// The local address of the channel.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// The remote address of the channel.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    /// Locks and returns the raw channel for byte transfer.
    ///
    /// The guard holds the channel lock. `close` and interest-mask
    /// mutation stay safe to call while it is held; they hand the
    /// channel work to the owning worker instead of re-locking.
    pub fn channel(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            guard: self.inner.stream.lock(),
        }
    }

    /// Typed extension store scoped to this session's lifetime.
    pub fn ext(&self) -> &ExtMap {
        &self.inner.exts
    }

    /// Current interest mask.
    pub fn event_mask(&self) -> EventMask {
        *self.inner.mask.lock()
    }

    /// Replaces the interest mask. Silent no-op once closed.
    pub fn set_event_mask(&self, mask: EventMask) {
        if self.is_closed() {
            return;
        }
        {
            let mut cur = self.inner.mask.lock();
            *cur = mask;
        }
        self.push_interest();
    }

    /// Adds event kinds to the interest mask. Silent no-op once closed.
    pub fn set_event(&self, events: EventMask) {
        if self.is_closed() {
            return;
        }
        {
            let mut cur = self.inner.mask.lock();
            *cur |= events;
        }
        self.push_interest();
    }

    /// Removes event kinds from the interest mask. Silent no-op once closed.
    pub fn clear_event(&self, events: EventMask) {
        if self.is_closed() {
            return;
        }
        {
            let mut cur = self.inner.mask.lock();
            *cur &= !events;
        }
        self.push_interest();
    }

    fn push_interest(&self) {
        if self.inner.ops_queued || !self.apply_interest_direct() {
            let _ = self.inner.cmd_tx.send(WorkerCmd::InterestOps {
                token: self.inner.token,
            });
        }
        let _ = self.inner.waker.wake();
    }

    /// Applies the mask on the calling thread. Backs off when the channel
    /// guard is held, so that a handler mutating interest mid-transfer
    /// never blocks on its own lock; the owning worker applies it instead.
    fn apply_interest_direct(&self) -> bool {
        if self.is_closed() {
            return true;
        }
        let mask = *self.inner.mask.lock();
        let Some(mut stream) = self.inner.stream.try_lock() else {
            return false;
        };
        if let Err(err) = self.apply_mask(&mut stream, mask) {
            trace!(token = self.inner.token.0, %err, "interest update failed");
        }
        true
    }

    /// Worker-side interest application, always with the channel lock.
    pub(crate) fn apply_interest_now(&self) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mask = *self.inner.mask.lock();
        let mut stream = self.inner.stream.lock();
        self.apply_mask(&mut stream, mask)
    }

    /// Registers on first demand, re-registers on changes, and deregisters
    /// when the mask requests no events.
    fn apply_mask(&self, stream: &mut TcpStream, mask: EventMask) -> io::Result<()> {
        match mask.to_mio() {
            Some(interest) => {
                if self.inner.registered.load(Ordering::Acquire) {
                    self.inner
                        .registry
                        .reregister(&mut *stream, self.inner.token, interest)?;
                } else {
                    self.inner
                        .registry
                        .register(&mut *stream, self.inner.token, interest)?;
                    self.inner.registered.store(true, Ordering::Release);
                }
            }
            None => {
                if self.inner.registered.swap(false, Ordering::AcqRel) {
                    self.inner.registry.deregister(&mut *stream)?;
                }
            }
        }
        Ok(())
    }

    /// Optional inactivity timeout swept by the owning worker.
    pub fn socket_timeout(&self) -> Option<Duration> {
        *self.inner.socket_timeout.lock()
    }

    /// Sets or clears the inactivity timeout.
    pub fn set_socket_timeout(&self, timeout: Option<Duration>) {
        *self.inner.socket_timeout.lock() = timeout;
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    /// Installs the buffer-status query object.
    pub fn set_buffer_status(&self, status: Arc<dyn BufferStatus>) {
        *self.inner.buffer_status.lock() = Some(status);
    }

    /// Whether the protocol layer reports undrained input.
    pub fn has_buffered_input(&self) -> bool {
        self.inner
            .buffer_status
            .lock()
            .as_ref()
            .map(|s| s.has_buffered_input())
            .unwrap_or(false)
    }

    /// Whether the protocol layer reports unflushed output.
    pub fn has_buffered_output(&self) -> bool {
        self.inner
            .buffer_status
            .lock()
            .as_ref()
            .map(|s| s.has_buffered_output())
            .unwrap_or(false)
    }

    /// Marks the session as closing without tearing the channel down yet.
    ///
    /// Used by layered sessions (TLS) that need to flush a close exchange.
    pub fn set_closing(&self) {
        let _ = self.inner.status.compare_exchange(
            SessionStatus::Active as u8,
            SessionStatus::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Closes the session idempotently, from any thread.
    ///
    /// The channel is deregistered and shut down exactly once; the owning
    /// worker is notified so it fires the `disconnected` callback.
    pub fn close(&self) {
        let prev = self
            .inner
            .status
            .swap(SessionStatus::Closed as u8, Ordering::AcqRel);
        if prev == SessionStatus::Closed as u8 {
            return;
        }
        // The caller may still hold the channel guard; the owning worker
        // detaches the channel when the lock is unavailable here.
        if let Some(mut stream) = self.inner.stream.try_lock() {
            if self.inner.registered.swap(false, Ordering::AcqRel) {
                let _ = self.inner.registry.deregister(&mut *stream);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        let _ = self.inner.cmd_tx.send(WorkerCmd::Closed {
            token: self.inner.token,
        });
        let _ = self.inner.waker.wake();
    }

    /// Deregisters and shuts the channel down. Runs on the owning worker,
    /// where the channel guard is never held across a dispatch.
    pub(crate) fn detach(&self) {
        let mut stream = self.inner.stream.lock();
        if self.inner.registered.swap(false, Ordering::AcqRel) {
            let _ = self.inner.registry.deregister(&mut *stream);
        }
        let _ = stream.shutdown(Shutdown::Both);
    }

    pub(crate) fn transfer_attachment(&self, raw: Option<(TypeId, Arc<dyn Any + Send + Sync>)>) {
        if let Some((id, value)) = raw {
            self.inner.exts.insert_raw(id, value);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.local)
            .field("status", &self.status())
            .field("interest", &self.event_mask().render())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{} {}",
            self.inner.local,
            self.inner.peer,
            self.event_mask().render()
        )
    }
}
