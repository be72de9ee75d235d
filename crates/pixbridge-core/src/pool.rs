//! Bounded leasing of engine session slots.
//!
//! An engine can only service a fixed number of concurrent sessions, each
//! addressed by a small integer. The `SessionPool` hands those integers out
//! to requesting threads one at a time: [`acquire`](SessionPool::acquire)
//! blocks until a slot is free, [`release`](SessionPool::release) returns it
//! and wakes one waiter.
//!
//! The in-use table is the only state shared between concurrent requests.
//! It lives behind a single `parking_lot::Mutex` paired with a `Condvar`, so
//! waiting threads sleep instead of spinning.
//!
//! Pools are ordinary values. Build one per engine at startup and share it
//! through an `Arc`.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Identifier of one engine session slot, in `[0, capacity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(usize);

impl SessionId {
    /// Wrap a raw slot index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The raw slot index.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Misuse of [`SessionPool::release`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The id lies outside the pool.
    #[error("Invalid session id {id}: pool holds {capacity} sessions")]
    InvalidSession { id: usize, capacity: usize },

    /// The id was not leased.
    #[error("Session id {0} released while not in use")]
    DoubleRelease(usize),
}

/// Snapshot of pool occupancy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions currently leased.
    pub in_use: usize,
    /// Sessions free for leasing.
    pub available: usize,
    /// Total pool size.
    pub capacity: usize,
    /// Threads blocked in `acquire`.
    pub waiting: usize,
    /// Leases granted since creation.
    pub total_acquired: u64,
}

#[derive(Debug)]
struct PoolState {
    in_use: Vec<bool>,
    waiting: usize,
    total_acquired: u64,
}

impl PoolState {
    fn claim_free(&mut self) -> Option<SessionId> {
        let index = self.in_use.iter().position(|used| !used)?;
        self.in_use[index] = true;
        self.total_acquired += 1;
        Some(SessionId(index))
    }
}

/// A fixed-size pool of engine session ids.
pub struct SessionPool {
    name: &'static str,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl SessionPool {
    /// Create a pool of `capacity` free sessions. `name` tags log events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            name,
            state: Mutex::new(PoolState {
                in_use: vec![false; capacity],
                waiting: 0,
                total_acquired: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Label used in log events.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Total number of sessions.
    pub fn capacity(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Number of sessions currently leased.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.iter().filter(|used| **used).count()
    }

    /// Returns true if no session is leased.
    pub fn is_idle(&self) -> bool {
        self.in_use() == 0
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let in_use = state.in_use.iter().filter(|used| **used).count();
        PoolStats {
            in_use,
            available: state.in_use.len() - in_use,
            capacity: state.in_use.len(),
            waiting: state.waiting,
            total_acquired: state.total_acquired,
        }
    }

    /// Lease a session, blocking until one is free.
    pub fn acquire(&self) -> SessionId {
        let mut state = self.state.lock();
        loop {
            if let Some(id) = state.claim_free() {
                debug!(pool = self.name, session = %id, "Session acquired");
                return id;
            }
            state.waiting += 1;
            trace!(pool = self.name, waiting = state.waiting, "Waiting for a free session");
            self.released.wait(&mut state);
            state.waiting -= 1;
        }
    }

    /// Lease a session if one is free right now.
    pub fn try_acquire(&self) -> Option<SessionId> {
        let id = self.state.lock().claim_free()?;
        debug!(pool = self.name, session = %id, "Session acquired");
        Some(id)
    }

    /// Lease a session, giving up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<SessionId> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(id) = state.claim_free() {
                debug!(pool = self.name, session = %id, "Session acquired");
                return Some(id);
            }
            state.waiting += 1;
            let timed_out = self.released.wait_until(&mut state, deadline).timed_out();
            state.waiting -= 1;
            if timed_out {
                // A release may have landed together with the timeout.
                let id = state.claim_free();
                if id.is_none() {
                    debug!(pool = self.name, "Timed out waiting for a session");
                }
                return id;
            }
        }
    }

    /// Return a leased session and wake one waiter.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidSession` if `id` is out of range
    /// - `PoolError::DoubleRelease` if `id` was not leased
    pub fn release(&self, id: SessionId) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let capacity = state.in_use.len();
        let slot = state
            .in_use
            .get_mut(id.0)
            .ok_or(PoolError::InvalidSession { id: id.0, capacity })?;
        if !*slot {
            return Err(PoolError::DoubleRelease(id.0));
        }
        *slot = false;
        drop(state);

        self.released.notify_one();
        debug!(pool = self.name, session = %id, "Session released");
        Ok(())
    }

    /// Lease a session wrapped in a guard that releases it on drop.
    pub fn lease(&self) -> SessionLease<'_> {
        SessionLease {
            pool: self,
            id: self.acquire(),
            released: false,
        }
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("SessionPool")
            .field("name", &self.name)
            .field("in_use", &stats.in_use)
            .field("capacity", &stats.capacity)
            .finish()
    }
}

/// A leased session that goes back to its pool when dropped.
#[derive(Debug)]
pub struct SessionLease<'a> {
    pool: &'a SessionPool,
    id: SessionId,
    released: bool,
}

impl SessionLease<'_> {
    /// The leased id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Release now and report misuse instead of logging it.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.released = true;
        self.pool.release(self.id)
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.pool.release(self.id) {
                error!(pool = self.pool.name, session = %self.id, "Lease release failed: {e}");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
