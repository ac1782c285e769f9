use std::sync::{Arc, PoisonError};

use tokio::time::{Duration, Instant};

use crate::handler::cancelled;
use crate::object::{CachedObjectState, Core, emit_initialized};
use crate::schedule::spawn_periodic;
use crate::sync::BroadcastOnce;
use crate::utils::CallOnDrop;
use crate::{CachedObjectError, CachedObjectResult};

type InitOutcome<T> = CachedObjectResult<Arc<T>>;

/// The initialization attempt in progress, if any.
///
/// This is `Some` exactly while the object is in
/// [`InitializationInProgress`](CachedObjectState::InitializationInProgress).
pub(crate) struct InitSlot<T> {
    attempt: Option<Arc<BroadcastOnce<InitOutcome<T>>>>,
}

impl<T> Default for InitSlot<T> {
    fn default() -> Self {
        Self { attempt: None }
    }
}

impl<T, D> Core<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Returns the current value, computing the first one if necessary.
    ///
    /// Concurrent callers share a single attempt. `cancel` only ends this caller's wait, the
    /// attempt itself is only ever cut short by its timeout or by disposal.
    pub async fn initialize(
        self: &Arc<Self>,
        cancel: Option<&tokio_util::sync::CancellationToken>,
    ) -> InitOutcome<T> {
        if let Some(snapshot) = self.snapshot() {
            return Ok(Arc::clone(&snapshot.value));
        }

        let attempt = {
            let mut slot = self.init.lock().unwrap();
            match self.state.load() {
                CachedObjectState::Disposed => return Err(CachedObjectError::Disposed),
                CachedObjectState::Ready => {
                    return self
                        .snapshot()
                        .map(|snapshot| Arc::clone(&snapshot.value))
                        .ok_or(CachedObjectError::Disposed);
                }
                CachedObjectState::InitializationInProgress => match &slot.attempt {
                    Some(attempt) => {
                        tracing::trace!(name = %self.name, "Joining initialization in progress");
                        Arc::clone(attempt)
                    }
                    None => return Err(CachedObjectError::Disposed),
                },
                CachedObjectState::PendingInitialization => {
                    if !self.state.transition(
                        CachedObjectState::PendingInitialization,
                        CachedObjectState::InitializationInProgress,
                    ) {
                        // only disposal can change the state under our feet
                        return Err(CachedObjectError::Disposed);
                    }
                    tracing::debug!(name = %self.name, "Initializing cached object");
                    let attempt = Arc::new(BroadcastOnce::new());
                    slot.attempt = Some(Arc::clone(&attempt));
                    self.runtime
                        .spawn(Arc::clone(self).run_initialization(Arc::clone(&attempt)));
                    attempt
                }
            }
        };

        tokio::select! {
            biased;
            outcome = attempt.wait() => outcome.unwrap_or_else(|| Err(self.cancellation_error())),
            _ = cancelled(cancel) => Err(CachedObjectError::Cancelled),
            _ = self.dispose_token.cancelled() => Err(CachedObjectError::Disposed),
        }
    }

    /// Makes sure there is a value before a refresh or update is attempted.
    pub async fn ensure_ready(
        self: &Arc<Self>,
        cancel: Option<&tokio_util::sync::CancellationToken>,
    ) -> CachedObjectResult {
        match self.state.load() {
            CachedObjectState::Ready => Ok(()),
            CachedObjectState::Disposed => Err(CachedObjectError::Disposed),
            _ => self.initialize(cancel).await.map(|_| ()),
        }
    }

    async fn run_initialization(self: Arc<Self>, attempt: Arc<BroadcastOnce<InitOutcome<T>>>) {
        let _abandon = {
            let core = Arc::clone(&self);
            let attempt = Arc::clone(&attempt);
            CallOnDrop::new(move || core.abandon_initialization(&attempt))
        };
        let started = Instant::now();
        let factory = Arc::clone(&self.factory);
        let result = self
            .run_guarded(&self.dispose_token, self.timeouts.initialize, |token| {
                async move { factory(token).await.map_err(CachedObjectError::factory) }
            })
            .await;
        let duration = started.elapsed();

        let outcome = {
            let mut slot = self.init.lock().unwrap();
            let outcome = match result {
                Ok(value) => {
                    let value = Arc::new(value);
                    self.publish(Arc::clone(&value), true).map(|_| {
                        let mut times = self.refresh_times.lock().unwrap();
                        times.started = Some(started);
                        times.finished = Some(Instant::now());
                        value
                    })
                }
                Err(err) => {
                    // back to square one, the next caller starts a fresh attempt
                    self.state.transition(
                        CachedObjectState::InitializationInProgress,
                        CachedObjectState::PendingInitialization,
                    );
                    Err(err)
                }
            };
            slot.attempt = None;
            outcome
        };

        let status = match &outcome {
            Ok(_) => "success",
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("cached_object.init") += 1, "name" => &self.name, "status" => status);
        metric!(timer("cached_object.init.duration") = duration, "name" => &self.name);

        match &outcome {
            Ok(value) => {
                tracing::debug!(name = %self.name, ?duration, "Cached object initialized");
                emit_initialized(&self, Arc::clone(value), duration);
                self.start_schedules();
            }
            Err(CachedObjectError::Disposed) => {}
            Err(err) => {
                tracing::warn!(name = %self.name, error = %err, "Failed to initialize cached object");
            }
        }
        attempt.complete(outcome);
    }

    /// Releases the waiters of an attempt that unwound before it completed.
    ///
    /// Does nothing once the attempt completed regularly.
    fn abandon_initialization(&self, attempt: &Arc<BroadcastOnce<InitOutcome<T>>>) {
        {
            let mut slot = self.init.lock().unwrap_or_else(PoisonError::into_inner);
            if slot
                .attempt
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, attempt))
            {
                slot.attempt = None;
                self.state.transition(
                    CachedObjectState::InitializationInProgress,
                    CachedObjectState::PendingInitialization,
                );
            }
        }
        if attempt.complete(Err(CachedObjectError::Cancelled)) {
            tracing::warn!(name = %self.name, "Initialization aborted");
        }
    }

    /// Starts the automatic refresh and update timers, if configured.
    fn start_schedules(self: &Arc<Self>) {
        if let Some(intervals) = self.refresh_intervals.clone() {
            let core = Arc::downgrade(self);
            let handle = spawn_periodic(
                &self.runtime,
                intervals,
                self.dispose_token.clone(),
                move || {
                    let core = core.upgrade()?;
                    Some(async move {
                        match core.refresh_value(Duration::ZERO, None).await {
                            Ok(()) | Err(CachedObjectError::Disposed) => {}
                            Err(err) => {
                                tracing::warn!(name = %core.name, error = %err, "Scheduled refresh failed");
                            }
                        }
                    })
                },
            );
            self.add_disposable(CallOnDrop::new(move || handle.abort()));
        }

        let pull_intervals = self
            .updaters
            .as_ref()
            .filter(|updaters| updaters.fetch.is_some())
            .and_then(|updaters| updaters.intervals.clone());
        if let Some(intervals) = pull_intervals {
            let core = Arc::downgrade(self);
            let handle = spawn_periodic(
                &self.runtime,
                intervals,
                self.dispose_token.clone(),
                move || {
                    let core = core.upgrade()?;
                    Some(async move {
                        match core.pull_updates(None).await {
                            Ok(()) | Err(CachedObjectError::Disposed) => {}
                            Err(err) => {
                                tracing::warn!(name = %core.name, error = %err, "Scheduled update failed");
                            }
                        }
                    })
                },
            );
            self.add_disposable(CallOnDrop::new(move || handle.abort()));
        }
    }
}
