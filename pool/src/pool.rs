//! The pool itself: capacity accounting, idle matching, FIFO waiters.
//!
//! One coarse mutex guards all pool state. Every mutation collects its
//! follow-up work (future resolutions, connect submissions, session
//! closes) while holding the lock and performs it after release, so
//! completion callbacks can re-enter the pool freely.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};
use whirl_reactor::{
    CompletionCallback, ConnectingReactor, IoFuture, ReactorError, Session,
};

use crate::managed::ManagedSession;

/// Maps a route key to the socket address its sessions connect to.
pub trait RouteResolver<R>: Send + Sync {
    /// Resolves `route`. An error fails the lease that triggered the
    /// connect.
    fn resolve(&self, route: &R) -> Result<SocketAddr, ReactorError>;
}

impl<R, F> RouteResolver<R> for F
where
    F: Fn(&R) -> Result<SocketAddr, ReactorError> + Send + Sync,
{
    fn resolve(&self, route: &R) -> Result<SocketAddr, ReactorError> {
        self(route)
    }
}

/// Capacity limits for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum sessions (idle, leased, or connecting) per route
    pub max_per_route: usize,
    /// Maximum sessions across all routes
    pub max_total: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_per_route: 2,
            max_total: 20,
        }
    }
}

/// Occupancy counters, per route or pool-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle sessions ready to lease
    pub available: usize,
    /// Sessions currently leased out
    pub leased: usize,
    /// Connects in flight
    pub pending: usize,
    /// Lease requests queued for capacity
    pub waiting: usize,
}

/// Identifies a pool entry from its session's extension store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolToken(u64);

pub(crate) struct Entry<R, S> {
    pub(crate) id: u64,
    pub(crate) route: R,
    pub(crate) state: Option<S>,
    pub(crate) session: Session,
}

struct Waiter<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    state: Option<S>,
    future: IoFuture<ManagedSession<R, S>>,
    deadline: Option<Instant>,
}

struct PoolState<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    idle: HashMap<R, VecDeque<Entry<R, S>>>,
    leased: HashMap<u64, (R, Option<S>)>,
    leased_per_route: HashMap<R, usize>,
    pending: HashMap<R, usize>,
    pending_total: usize,
    waiting: HashMap<R, VecDeque<Waiter<R, S>>>,
    shut_down: bool,
}

impl<R, S> PoolState<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    fn new() -> Self {
        PoolState {
            idle: HashMap::new(),
            leased: HashMap::new(),
            leased_per_route: HashMap::new(),
            pending: HashMap::new(),
            pending_total: 0,
            waiting: HashMap::new(),
            shut_down: false,
        }
    }

    fn route_count(&self, route: &R) -> usize {
        self.idle.get(route).map(VecDeque::len).unwrap_or(0)
            + self.leased_per_route.get(route).copied().unwrap_or(0)
            + self.pending.get(route).copied().unwrap_or(0)
    }

    fn total_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum::<usize>()
            + self.leased.len()
            + self.pending_total
    }
}

enum Deferred<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    Grant(IoFuture<ManagedSession<R, S>>, ManagedSession<R, S>),
    Fail(IoFuture<ManagedSession<R, S>>, ReactorError),
    Connect(R),
    Close(Session),
}

pub(crate) struct PoolCore<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    reactor: Arc<ConnectingReactor>,
    resolver: Box<dyn RouteResolver<R>>,
    config: PoolConfig,
    ids: AtomicU64,
    state: Mutex<PoolState<R, S>>,
}

/// A pool of reactor sessions keyed by route.
///
/// Cheap to clone; all clones share the same pool.
pub struct SessionPool<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    core: Arc<PoolCore<R, S>>,
}

impl<R, S> Clone for SessionPool<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        SessionPool {
            core: Arc::clone(&self.core),
        }
    }
}

impl<R, S> SessionPool<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a pool that opens sessions through `reactor` at the
    /// addresses `resolver` yields.
    pub fn new(
        reactor: Arc<ConnectingReactor>,
        resolver: impl RouteResolver<R> + 'static,
        config: PoolConfig,
    ) -> SessionPool<R, S> {
        SessionPool {
            core: Arc::new(PoolCore {
                reactor,
                resolver: Box::new(resolver),
                config,
                ids: AtomicU64::new(1),
                state: Mutex::new(PoolState::new()),
            }),
        }
    }

    /// Requests a session for `route`, preferring idle sessions whose
    /// state equals `state` (or is unset). Over-cap requests queue FIFO;
    /// a queued request past `deadline` fails with a timeout.
    pub fn lease(
        &self,
        route: R,
        state: Option<S>,
        deadline: Option<Duration>,
        callback: Option<Box<dyn CompletionCallback<ManagedSession<R, S>>>>,
    ) -> IoFuture<ManagedSession<R, S>> {
        let future = IoFuture::new(callback);
        let deadline = deadline.map(|d| Instant::now() + d);
        let deferred = {
            let mut st = self.core.state.lock();
            if st.shut_down {
                vec![Deferred::Fail(future.clone(), ReactorError::IllegalState)]
            } else {
                st.waiting.entry(route.clone()).or_default().push_back(Waiter {
                    state,
                    future: future.clone(),
                    deadline,
                });
                self.core.fulfill(&mut st, &route)
            }
        };
        self.core.run_deferred(deferred);
        future
    }

    /// Looks up the route and state of the pool entry backing `session`,
    /// if the session is currently leased from this pool.
    pub fn entry_of(&self, session: &Session) -> Option<(R, Option<S>)> {
        let token = session.ext().get::<PoolToken>()?;
        self.core.state.lock().leased.get(&token.0).cloned()
    }

    /// Releases the leased entry backing `session` back to the pool.
    pub fn release_session(&self, session: &Session, reusable: bool) {
        if let Some(token) = session.ext().get::<PoolToken>() {
            let (route, state) = match self.core.state.lock().leased.get(&token.0) {
                Some(found) => found.clone(),
                None => return,
            };
            let entry = Entry {
                id: token.0,
                route,
                state,
                session: session.clone(),
            };
            self.core.release(entry, reusable);
        }
    }

    /// Pool-wide occupancy counters.
    pub fn total_stats(&self) -> PoolStats {
        let st = self.core.state.lock();
        PoolStats {
            available: st.idle.values().map(VecDeque::len).sum(),
            leased: st.leased.len(),
            pending: st.pending_total,
            waiting: st.waiting.values().map(VecDeque::len).sum(),
        }
    }

    /// Occupancy counters for one route.
    pub fn route_stats(&self, route: &R) -> PoolStats {
        let st = self.core.state.lock();
        PoolStats {
            available: st.idle.get(route).map(VecDeque::len).unwrap_or(0),
            leased: st.leased_per_route.get(route).copied().unwrap_or(0),
            pending: st.pending.get(route).copied().unwrap_or(0),
            waiting: st.waiting.get(route).map(VecDeque::len).unwrap_or(0),
        }
    }

    /// Shuts the pool down: queued leases are cancelled and every pooled
    /// session, idle or leased, is closed. The reactor is left running.
    pub fn shutdown(&self) {
        let mut to_cancel = Vec::new();
        let mut to_close = Vec::new();
        {
            let mut st = self.core.state.lock();
            if st.shut_down {
                return;
            }
            st.shut_down = true;
            for (_, mut queue) in st.waiting.drain() {
                while let Some(waiter) = queue.pop_front() {
                    to_cancel.push(waiter.future);
                }
            }
            for (_, mut entries) in st.idle.drain() {
                while let Some(entry) = entries.pop_front() {
                    to_close.push(entry.session);
                }
            }
            st.leased.clear();
            st.leased_per_route.clear();
        }
        for future in to_cancel {
            future.cancel();
        }
        for session in to_close {
            session.close();
        }
        debug!("session pool shut down");
    }
}

impl<R, S> PoolCore<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    /// Expires overdue waiters and matches the remaining ones against
    /// idle sessions and free capacity. Lock must be held; returns the
    /// work to perform after release.
    fn fulfill(self: &Arc<Self>, st: &mut PoolState<R, S>, route: &R) -> Vec<Deferred<R, S>> {
        let mut deferred = Vec::new();
        self.expire_waiters(st, &mut deferred);

        loop {
            let Some(queue) = st.waiting.get_mut(route) else { break };
            let Some(waiter) = queue.front() else { break };

            let wanted = waiter.state.clone();
            if let Some(entry) = take_idle_match(st.idle.get_mut(route), &wanted) {
                let Some(waiter) = st.waiting.get_mut(route).and_then(VecDeque::pop_front) else {
                    st.idle.entry(route.clone()).or_default().push_front(entry);
                    break;
                };
                let managed = self.grant(st, entry);
                deferred.push(Deferred::Grant(waiter.future, managed));
                continue;
            }

            let pending_route = st.pending.get(route).copied().unwrap_or(0);
            let queued = st.waiting.get(route).map(VecDeque::len).unwrap_or(0);
            if pending_route >= queued {
                // Enough connects already in flight for everyone queued.
                break;
            }
            if st.route_count(route) >= self.config.max_per_route
                || st.total_count() >= self.config.max_total
            {
                break;
            }
            *st.pending.entry(route.clone()).or_insert(0) += 1;
            st.pending_total += 1;
            deferred.push(Deferred::Connect(route.clone()));
        }
        deferred
    }

    fn expire_waiters(&self, st: &mut PoolState<R, S>, deferred: &mut Vec<Deferred<R, S>>) {
        let now = Instant::now();
        for queue in st.waiting.values_mut() {
            queue.retain(|waiter| {
                if waiter.future.is_done() {
                    return false;
                }
                match waiter.deadline {
                    Some(deadline) if now >= deadline => {
                        deferred.push(Deferred::Fail(
                            waiter.future.clone(),
                            ReactorError::Timeout,
                        ));
                        false
                    }
                    _ => true,
                }
            });
        }
        st.waiting.retain(|_, queue| !queue.is_empty());
    }

    /// Moves an entry to the leased set and wraps it for the waiter.
    fn grant(self: &Arc<Self>, st: &mut PoolState<R, S>, entry: Entry<R, S>) -> ManagedSession<R, S> {
        st.leased
            .insert(entry.id, (entry.route.clone(), entry.state.clone()));
        *st.leased_per_route.entry(entry.route.clone()).or_insert(0) += 1;
        ManagedSession::new(self.clone(), entry)
    }

    fn run_deferred(self: &Arc<Self>, deferred: Vec<Deferred<R, S>>) {
        for item in deferred {
            match item {
                Deferred::Grant(future, managed) => {
                    // A waiter that timed out between selection and
                    // delivery returns its entry to the pool.
                    if !future.complete(managed.clone()) {
                        managed.release();
                    }
                }
                Deferred::Fail(future, err) => {
                    future.fail(err);
                }
                Deferred::Close(session) => {
                    session.close();
                }
                Deferred::Connect(route) => self.start_connect(route),
            }
        }
    }

    fn start_connect(self: &Arc<Self>, route: R) {
        let addr = match self.resolver.resolve(&route) {
            Ok(addr) => addr,
            Err(err) => {
                self.connect_failed(&route, err);
                return;
            }
        };
        trace!(%addr, "pool opening session");
        let bridge = ConnectBridge {
            pool: Arc::downgrade(self),
            route: route.clone(),
        };
        if let Err(err) = self
            .reactor
            .connect::<()>(addr, None, None, Some(Box::new(bridge)))
        {
            self.connect_failed(&route, err);
        }
    }

    fn connect_failed(self: &Arc<Self>, route: &R, err: ReactorError) {
        let deferred = {
            let mut st = self.state.lock();
            if let Some(count) = st.pending.get_mut(route) {
                *count = count.saturating_sub(1);
                st.pending_total = st.pending_total.saturating_sub(1);
            }
            let mut deferred = Vec::new();
            if let Some(queue) = st.waiting.get_mut(route) {
                if let Some(waiter) = queue.pop_front() {
                    deferred.push(Deferred::Fail(waiter.future, err));
                }
            }
            deferred.extend(self.fulfill(&mut st, route));
            deferred
        };
        self.run_deferred(deferred);
    }

    fn connected(self: &Arc<Self>, route: &R, session: Session) {
        let deferred = {
            let mut st = self.state.lock();
            if let Some(count) = st.pending.get_mut(route) {
                *count = count.saturating_sub(1);
                st.pending_total = st.pending_total.saturating_sub(1);
            }
            if st.shut_down {
                vec![Deferred::Close(session)]
            } else {
                let id = self.ids.fetch_add(1, Ordering::Relaxed);
                session.ext().set(PoolToken(id));
                st.idle.entry(route.clone()).or_default().push_back(Entry {
                    id,
                    route: route.clone(),
                    state: None,
                    session,
                });
                self.fulfill(&mut st, route)
            }
        };
        self.run_deferred(deferred);
    }

    /// Returns a leased entry to the pool.
    pub(crate) fn release(self: &Arc<Self>, entry: Entry<R, S>, reusable: bool) {
        let route = entry.route.clone();
        let deferred = {
            let mut st = self.state.lock();
            if st.leased.remove(&entry.id).is_none() {
                return;
            }
            if let Some(count) = st.leased_per_route.get_mut(&route) {
                *count = count.saturating_sub(1);
            }
            if reusable && !entry.session.is_closed() && !st.shut_down {
                st.idle.entry(route.clone()).or_default().push_back(entry);
                self.fulfill(&mut st, &route)
            } else {
                let mut deferred = vec![Deferred::Close(entry.session)];
                deferred.extend(self.fulfill(&mut st, &route));
                deferred
            }
        };
        self.run_deferred(deferred);
    }

    /// Records a state change on a leased entry so later idle matching
    /// sees it.
    pub(crate) fn update_state(&self, id: u64, state: Option<S>) {
        if let Some(slot) = self.state.lock().leased.get_mut(&id) {
            slot.1 = state;
        }
    }
}

/// An idle entry matches a lease wanting `wanted` when its state equals
/// it or has never been set.
fn state_matches<S: PartialEq>(entry_state: &Option<S>, wanted: &Option<S>) -> bool {
    entry_state.is_none() || entry_state == wanted
}

fn take_idle_match<R, S: PartialEq>(
    idle: Option<&mut VecDeque<Entry<R, S>>>,
    wanted: &Option<S>,
) -> Option<Entry<R, S>> {
    let idle = idle?;
    let pos = idle.iter().position(|entry| {
        !entry.session.is_closed() && state_matches(&entry.state, wanted)
    })?;
    idle.remove(pos)
}

struct ConnectBridge<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    pool: Weak<PoolCore<R, S>>,
    route: R,
}

impl<R, S> CompletionCallback<Session> for ConnectBridge<R, S>
where
    R: Clone + Eq + Hash + Send + Sync + 'static,
    S: Clone + PartialEq + Send + Sync + 'static,
{
    fn completed(&self, session: &Session) {
        if let Some(pool) = self.pool.upgrade() {
            pool.connected(&self.route, session.clone());
        }
    }

    fn failed(&self, err: &ReactorError) {
        if let Some(pool) = self.pool.upgrade() {
            pool.connect_failed(&self.route, err.clone());
        }
    }

    fn cancelled(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.connect_failed(&self.route, ReactorError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_matching_accepts_equal_or_unset() {
        assert!(state_matches::<&str>(&None, &None));
        assert!(state_matches(&None, &Some("auth")));
        assert!(state_matches(&Some("auth"), &Some("auth")));
        assert!(!state_matches(&Some("auth"), &Some("anon")));
        assert!(!state_matches(&Some("auth"), &None));
    }

    #[test]
    fn empty_idle_set_never_matches() {
        let mut empty: VecDeque<Entry<&'static str, &'static str>> = VecDeque::new();
        assert!(take_idle_match(Some(&mut empty), &None).is_none());
        assert!(take_idle_match::<&str, &str>(None, &Some("auth")).is_none());
    }

    #[test]
    fn default_caps_are_modest() {
        let config = PoolConfig::default();
        assert_eq!(config.max_per_route, 2);
        assert_eq!(config.max_total, 20);
    }
}
