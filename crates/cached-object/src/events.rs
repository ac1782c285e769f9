//! Typed notifications fired by a [`CachedObject`](crate::CachedObject).
//!
//! Subscribers are plain closures, invoked synchronously and in registration order on whichever
//! task produced the outcome. Panics raised by a subscriber are **not** caught: they unwind into
//! the coordinating task, exactly like any other panic. The callers waiting on that task get
//! [`Cancelled`](crate::CachedObjectError::Cancelled), and work queued behind it still runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::CachedObjectError;

/// Identifies a subscription, see [`Subscribers::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(0);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An ordered list of subscriber callbacks for one kind of event.
pub struct Subscribers<E> {
    callbacks: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns `false` if it was not registered here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap();
        let len = callbacks.len();
        callbacks.retain(|(sub, _)| *sub != id);
        callbacks.len() != len
    }

    pub fn clear(&self) {
        self.callbacks.lock().unwrap().clear();
    }

    /// Invokes every subscriber with `event`.
    ///
    /// The list is snapshotted first, so callbacks are free to (un)subscribe.
    pub(crate) fn emit(&self, event: &E) {
        let callbacks: Vec<_> = self
            .callbacks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.callbacks.try_lock().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("Subscribers").field("len", &len).finish()
    }
}

/// Fired once the first value has been computed.
#[derive(Debug, Clone)]
pub struct InitializedEvent<T> {
    pub value: Arc<T>,
    pub duration: Duration,
}

/// Fired once, when the object is disposed.
#[derive(Debug, Clone)]
pub struct DisposedEvent {
    /// The version the object had when it was disposed.
    pub version: u64,
}

/// Fired after a successful refresh.
#[derive(Debug, Clone)]
pub struct ValueRefreshedEvent<T> {
    pub previous: Arc<T>,
    pub new: Arc<T>,
    pub duration: Duration,
    pub version: u64,
}

/// Fired after a failed refresh. The value and version did not change.
#[derive(Debug, Clone)]
pub struct ValueRefreshErrorEvent<T> {
    pub error: CachedObjectError,
    pub current: Arc<T>,
    pub duration: Duration,
    pub version: u64,
}

/// Fired after a successful update.
#[derive(Debug, Clone)]
pub struct ValueUpdatedEvent<T, D> {
    pub previous: Arc<T>,
    pub new: Arc<T>,
    pub updates: Arc<D>,
    pub duration: Duration,
    pub version: u64,
}

/// Fired after a failed update. The value and version did not change.
///
/// `updates` is `None` when fetching the updates failed before there was a delta to apply.
#[derive(Debug, Clone)]
pub struct ValueUpdateErrorEvent<T, D> {
    pub error: CachedObjectError,
    pub current: Arc<T>,
    pub updates: Option<Arc<D>>,
    pub duration: Duration,
    pub version: u64,
}

/// All the subscriber lists of one object.
pub(crate) struct Events<T, D> {
    pub initialized: Subscribers<InitializedEvent<T>>,
    pub disposed: Subscribers<DisposedEvent>,
    pub refreshed: Subscribers<ValueRefreshedEvent<T>>,
    pub refresh_error: Subscribers<ValueRefreshErrorEvent<T>>,
    pub updated: Subscribers<ValueUpdatedEvent<T, D>>,
    pub update_error: Subscribers<ValueUpdateErrorEvent<T, D>>,
}

impl<T, D> Events<T, D> {
    pub fn new() -> Self {
        Self {
            initialized: Subscribers::new(),
            disposed: Subscribers::new(),
            refreshed: Subscribers::new(),
            refresh_error: Subscribers::new(),
            updated: Subscribers::new(),
            update_error: Subscribers::new(),
        }
    }

    /// Drops every subscriber, releasing whatever their closures captured.
    pub fn clear(&self) {
        self.initialized.clear();
        self.disposed.clear();
        self.refreshed.clear();
        self.refresh_error.clear();
        self.updated.clear();
        self.update_error.clear();
    }
}
