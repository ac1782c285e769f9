use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::sync::BroadcastOnce;
use crate::{CachedObjectError, CachedObjectResult};

static NEXT_HANDLER: AtomicU64 = AtomicU64::new(1);

/// One coalesced execution of a refresh or an update, shared by all of its waiters.
///
/// A handler starts out queued and accepting waiters. Once it is running (or cancelled, or done)
/// late callers have to go elsewhere. The handler owns a cancellation token linked to the
/// object's disposal, which is cancelled when its last waiter gives up.
pub(crate) struct Handler<P = ()> {
    pub id: u64,
    pub token: CancellationToken,
    waiters: AtomicUsize,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    outcome: BroadcastOnce<CachedObjectResult>,
    pub payload: P,
}

impl<P> Handler<P> {
    /// Creates a new handler, with the caller already attached as its first waiter.
    pub fn new(parent: &CancellationToken, payload: P) -> (Arc<Self>, Waiter<P>) {
        let handler = Arc::new(Self {
            id: NEXT_HANDLER.fetch_add(1, Ordering::Relaxed),
            token: parent.child_token(),
            waiters: AtomicUsize::new(1),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            outcome: BroadcastOnce::new(),
            payload,
        });
        let waiter = Waiter {
            handler: Arc::clone(&handler),
        };
        (handler, waiter)
    }

    /// Attaches another waiter, unless every previous waiter already gave up.
    pub fn try_attach(self: &Arc<Self>) -> Option<Waiter<P>> {
        self.waiters
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .ok()?;
        Some(Waiter {
            handler: Arc::clone(self),
        })
    }

    /// Whether a new caller may still join this handler before it runs.
    pub fn is_accepting(&self) -> bool {
        !self.is_running() && !self.token.is_cancelled() && !self.outcome.is_completed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn mark_running(&self) {
        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.running.store(true, Ordering::Release);
    }

    /// Whether this handler started running within the last `window`.
    pub fn started_within(&self, window: Duration) -> bool {
        self.started_at
            .lock()
            .unwrap()
            .is_some_and(|started| started.elapsed() < window)
    }

    pub fn complete(&self, outcome: CachedObjectResult) {
        self.outcome.complete(outcome);
    }
}

impl<P> fmt::Debug for Handler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .field("running", &self.is_running())
            .field("completed", &self.outcome.is_completed())
            .finish()
    }
}

/// A caller's interest in a [`Handler`].
///
/// Dropping the last waiter of a handler that has not completed yet cancels it.
pub(crate) struct Waiter<P = ()> {
    handler: Arc<Handler<P>>,
}

impl<P> Waiter<P> {
    pub fn handler(&self) -> &Arc<Handler<P>> {
        &self.handler
    }

    /// Waits for the shared outcome, or for this caller's own cancellation.
    pub async fn wait(
        self,
        cancel: Option<&CancellationToken>,
        disposed: &CancellationToken,
    ) -> CachedObjectResult
    where
        P: Send + Sync + 'static,
    {
        let outcome = self.handler.outcome.wait();
        tokio::select! {
            biased;
            outcome = outcome => outcome.unwrap_or(Err(CachedObjectError::Cancelled)),
            _ = cancelled(cancel) => Err(CachedObjectError::Cancelled),
            _ = disposed.cancelled() => Err(CachedObjectError::Disposed),
        }
    }
}

impl<P> Drop for Waiter<P> {
    fn drop(&mut self) {
        let previous = self.handler.waiters.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && !self.handler.outcome.is_completed() {
            tracing::trace!(handler = self.handler.id, "Last waiter gone, cancelling");
            self.handler.token.cancel();
        }
    }
}

/// Resolves once `cancel` fires, or never if there is no token.
pub(crate) async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => futures::future::pending().await,
    }
}
