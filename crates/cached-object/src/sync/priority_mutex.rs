use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// The class of a waiter on a [`PriorityMutex`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Refreshes. Always handed the lock before any [`Low`](Self::Low) waiter.
    High,
    /// Updates.
    Low,
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    locked: bool,
    next_id: u64,
    high: VecDeque<Waiter>,
    low: VecDeque<Waiter>,
}

impl State {
    /// Hands the lock to the next live waiter, high priority first, or unlocks it.
    fn release(&mut self) {
        while let Some(waiter) = self.high.pop_front().or_else(|| self.low.pop_front()) {
            // a failed send means the waiter went away, try the next one
            if waiter.sender.send(()).is_ok() {
                return;
            }
        }
        self.locked = false;
    }

    /// Removes a queued waiter, returning `false` if it was already granted the lock.
    fn remove(&mut self, id: u64) -> bool {
        for queue in [&mut self.high, &mut self.low] {
            if let Some(idx) = queue.iter().position(|w| w.id == id) {
                queue.remove(idx);
                return true;
            }
        }
        false
    }
}

/// An async mutual-exclusion lock with two FIFO waiter classes.
///
/// On release, the lock is handed directly to the oldest [`Priority::High`] waiter, and only if
/// there is none, to the oldest [`Priority::Low`] waiter, regardless of arrival order between the
/// two classes. The lock protects no data by itself, it only serializes refreshes and updates.
#[derive(Clone, Default)]
pub struct PriorityMutex {
    state: Arc<Mutex<State>>,
}

impl PriorityMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> PriorityMutexGuard {
        PriorityMutexGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Acquires the lock if it is currently free, without waiting.
    pub fn try_acquire(&self) -> Option<PriorityMutexGuard> {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(self.guard())
    }

    /// Waits for the lock in the given waiter class.
    ///
    /// Returns `None` if `cancel` fires before the lock was handed over. A waiter that is
    /// cancelled (or dropped) is removed from its queue and never blocks anybody else.
    pub async fn acquire(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Option<PriorityMutexGuard> {
        if cancel.is_cancelled() {
            return None;
        }

        let mut pending = {
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                return Some(self.guard());
            }

            let (sender, receiver) = oneshot::channel();
            let id = state.next_id;
            state.next_id += 1;
            let waiter = Waiter { id, sender };
            match priority {
                Priority::High => state.high.push_back(waiter),
                Priority::Low => state.low.push_back(waiter),
            }

            PendingAcquire {
                state: Arc::clone(&self.state),
                id,
                receiver: Some(receiver),
            }
        };

        tokio::select! {
            biased;
            granted = pending.granted() => granted.then(|| self.guard()),
            _ = cancel.cancelled() => None,
        }
    }

    /// Returns `true` if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }
}

impl fmt::Debug for PriorityMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("PriorityMutex")
            .field("locked", &state.locked)
            .field("high_waiters", &state.high.len())
            .field("low_waiters", &state.low.len())
            .finish()
    }
}

/// A queued, not yet granted, acquisition.
///
/// Dropping it before the grant was observed either removes it from the queue, or, if the lock was
/// already handed over, passes the lock on.
struct PendingAcquire {
    state: Arc<Mutex<State>>,
    id: u64,
    receiver: Option<oneshot::Receiver<()>>,
}

impl PendingAcquire {
    async fn granted(&mut self) -> bool {
        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };
        let granted = receiver.await.is_ok();
        if granted {
            // ownership moves into the guard
            self.receiver = None;
        }
        granted
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.receiver.is_none() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if !state.remove(self.id) {
            // the grant raced with our cancellation
            state.release();
        }
    }
}

/// Releases the [`PriorityMutex`] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct PriorityMutexGuard {
    state: Arc<Mutex<State>>,
}

impl Drop for PriorityMutexGuard {
    fn drop(&mut self) {
        self.state.lock().unwrap().release();
    }
}

impl fmt::Debug for PriorityMutexGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityMutexGuard").finish_non_exhaustive()
    }
}
