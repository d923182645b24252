//! Mutual exclusion for logical concurrency inside one run.
//!
//! The lock is expressed purely in terms of the deterministic step function:
//! a held flag plus a FIFO queue of waiter slots. `unlock` hands the lock
//! directly to the head waiter, so acquisition order is exactly enqueue
//! order. There is no timeout; compose with `await_with_timeout` for a
//! bounded wait.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use ::futures::future::FusedFuture;

use crate::futures::{is_settled, new_slot, settle, Slot};
use crate::Payload;

struct MutexState {
    locked: bool,
    waiters: VecDeque<Slot>,
}

/// Non-reentrant FIFO lock guarding overlapping sections of a single
/// workflow's coroutine tree (for example the main body against an update
/// handler). Not a cross-process primitive.
#[derive(Clone)]
pub struct WorkflowMutex {
    inner: Arc<Mutex<MutexState>>,
}

impl Default for WorkflowMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowMutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MutexState> {
        self.inner.lock().expect("workflow mutex lock poisoned")
    }

    /// Suspend until the lock is held by the caller.
    pub fn lock(&self) -> LockFuture {
        LockFuture {
            mutex: self.clone(),
            waiting: None,
            acquired: false,
        }
    }

    /// Acquire without waiting. Returns `false` (and enqueues nothing) if
    /// the lock is already held.
    pub fn try_lock(&self) -> bool {
        let mut state = self.state();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    /// Release the lock, handing it to the head waiter if one exists.
    /// Releasing an unheld lock is a programming error.
    pub fn unlock(&self) {
        let mut state = self.state();
        if !state.locked {
            panic!("unlock of an unlocked workflow mutex");
        }
        if let Some(waiter) = state.waiters.pop_front() {
            // Direct handoff: the lock stays held, now by the waiter.
            settle(&waiter, Ok(Payload::Null));
        } else {
            state.locked = false;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn waiter_count(&self) -> usize {
        self.state().waiters.len()
    }
}

/// Pending acquisition. First poll either takes the lock immediately or
/// enqueues the waiter; later polls observe the handoff.
#[must_use = "futures do nothing unless awaited"]
pub struct LockFuture {
    mutex: WorkflowMutex,
    waiting: Option<Slot>,
    acquired: bool,
}

impl Future for LockFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.acquired {
            return Poll::Pending;
        }
        if let Some(slot) = &this.waiting {
            if is_settled(slot) {
                this.acquired = true;
                return Poll::Ready(());
            }
            return Poll::Pending;
        }
        let mut state = this.mutex.state();
        if state.locked {
            let slot = new_slot();
            state.waiters.push_back(slot.clone());
            this.waiting = Some(slot);
            Poll::Pending
        } else {
            state.locked = true;
            this.acquired = true;
            Poll::Ready(())
        }
    }
}

impl FusedFuture for LockFuture {
    fn is_terminated(&self) -> bool {
        self.acquired
    }
}

impl Drop for LockFuture {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let Some(slot) = self.waiting.take() else {
            return;
        };
        let mut state = self.mutex.state();
        if is_settled(&slot) {
            // The lock was handed to a waiter that never consumed it; pass
            // it straight on so the queue cannot stall.
            if let Some(next) = state.waiters.pop_front() {
                settle(&next, Ok(Payload::Null));
            } else {
                state.locked = false;
            }
        } else {
            state.waiters.retain(|w| !Arc::ptr_eq(w, &slot));
        }
    }
}
