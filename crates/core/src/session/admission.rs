//! Bounded connection admission shared by the RTSP and HTTP listeners.
//!
//! Up to `max_active` connections are served at once and up to
//! `max_queued` more wait for a slot. Anything beyond that is turned away
//! immediately instead of being accepted and left to stall.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StreamError};

#[derive(Debug, Default)]
struct PoolState {
    active: usize,
    queued: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct AdmissionPool {
    max_active: usize,
    max_queued: usize,
    state: Mutex<PoolState>,
    slot_freed: Condvar,
    rejected: AtomicU64,
}

/// Result of [`AdmissionPool::admit`].
#[derive(Debug)]
pub enum Admission {
    /// A slot was free.
    Active(Permit),
    /// Waiting for a slot; call [`QueueTicket::wait`] off the accept thread.
    Queued(QueueTicket),
}

impl AdmissionPool {
    pub fn new(max_active: usize, max_queued: usize) -> Arc<Self> {
        Arc::new(Self {
            max_active: max_active.max(1),
            max_queued,
            state: Mutex::new(PoolState::default()),
            slot_freed: Condvar::new(),
            rejected: AtomicU64::new(0),
        })
    }

    /// Decide on a new connection without blocking.
    pub fn admit(self: &Arc<Self>) -> Result<Admission> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamError::Rejected);
        }
        if state.active < self.max_active {
            state.active += 1;
            return Ok(Admission::Active(Permit { pool: self.clone() }));
        }
        if state.queued < self.max_queued {
            state.queued += 1;
            return Ok(Admission::Queued(QueueTicket {
                pool: Some(self.clone()),
            }));
        }
        drop(state);
        let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            max_active = self.max_active,
            max_queued = self.max_queued,
            rejected,
            "admission pool full, rejecting connection"
        );
        Err(StreamError::Rejected)
    }

    /// Wake all queued waiters and refuse new admissions.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.slot_freed.notify_all();
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.slot_freed.notify_one();
    }
}

/// An occupied slot. Released on drop.
#[derive(Debug)]
pub struct Permit {
    pool: Arc<AdmissionPool>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// A place in the wait queue.
#[derive(Debug)]
pub struct QueueTicket {
    pool: Option<Arc<AdmissionPool>>,
}

impl QueueTicket {
    /// Block until a slot frees up. `None` if the pool was closed first.
    pub fn wait(mut self) -> Option<Permit> {
        let pool = self.pool.take()?;
        let mut state = pool.state.lock();
        while state.active >= pool.max_active && !state.closed {
            pool.slot_freed.wait(&mut state);
        }
        state.queued -= 1;
        if state.closed {
            return None;
        }
        state.active += 1;
        drop(state);
        Some(Permit { pool })
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.state.lock().queued -= 1;
        }
    }
}

impl Admission {
    /// Turn the admission into a permit, waiting if queued.
    pub fn into_permit(self) -> Option<Permit> {
        match self {
            Self::Active(permit) => Some(permit),
            Self::Queued(ticket) => ticket.wait(),
        }
    }
}
