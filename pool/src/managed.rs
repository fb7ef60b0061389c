//! The lease handle applications hold while using a pooled session.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use whirl_reactor::Session;

use crate::pool::{Entry, PoolCore};

struct ManagedInner<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    core: Arc<PoolCore<R, S>>,
    session: Session,
    route: R,
    lease: Mutex<Option<Entry<R, S>>>,
}

/// A leased pool session.
///
/// Exactly one release reaches the pool, whether through
/// [`release`](ManagedSession::release), [`abort`](ManagedSession::abort),
/// or the drop of the last clone. Dropping without an explicit release
/// counts as an abort: the session is closed rather than reused.
pub struct ManagedSession<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<ManagedInner<R, S>>,
}

impl<R, S> Clone for ManagedSession<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        ManagedSession {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, S> ManagedSession<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<PoolCore<R, S>>, entry: Entry<R, S>) -> ManagedSession<R, S> {
        ManagedSession {
            inner: Arc::new(ManagedInner {
                core,
                session: entry.session.clone(),
                route: entry.route.clone(),
                lease: Mutex::new(Some(entry)),
            }),
        }
    }

    /// The underlying reactor session.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// The route this session was leased for.
    pub fn route(&self) -> &R {
        &self.inner.route
    }

    /// The state token currently recorded on the lease.
    pub fn state(&self) -> Option<S> {
        self.inner
            .lease
            .lock()
            .as_ref()
            .and_then(|entry| entry.state.clone())
    }

    /// Records a state token on the lease so future idle matching sees
    /// it once the session is released as reusable.
    pub fn set_state(&self, state: Option<S>) {
        let mut lease = self.inner.lease.lock();
        if let Some(entry) = lease.as_mut() {
            entry.state = state.clone();
            self.inner.core.update_state(entry.id, state);
        }
    }

    /// Returns the session to the pool for reuse.
    pub fn release(&self) {
        if let Some(entry) = self.inner.lease.lock().take() {
            self.inner.core.release(entry, true);
        }
    }

    /// Returns the session to the pool and closes it.
    pub fn abort(&self) {
        if let Some(entry) = self.inner.lease.lock().take() {
            self.inner.core.release(entry, false);
        }
    }
}

impl<R, S> Drop for ManagedInner<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(entry) = self.lease.lock().take() {
            self.core.release(entry, false);
        }
    }
}
