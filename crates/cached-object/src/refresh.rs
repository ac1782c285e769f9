use std::sync::{Arc, PoisonError};

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::events::{ValueRefreshErrorEvent, ValueRefreshedEvent};
use crate::handler::{Handler, Waiter};
use crate::object::{CachedObjectState, Core, emit_refreshed};
use crate::sync::Priority;
use crate::{CachedObjectError, CachedObjectResult};

/// The refresh that is running (or about to run) and the one queued behind it.
#[derive(Default)]
pub(crate) struct RefreshSlots {
    active: Option<Arc<Handler>>,
    queued: Option<Arc<Handler>>,
}

/// The handler a refresh chain is currently working on.
///
/// Should the chain unwind (a panicking subscriber, say), its waiters are released with
/// [`Cancelled`](CachedObjectError::Cancelled) and the queued refresh gets a chain of its own.
struct RefreshChain<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    core: Arc<Core<T, D>>,
    handler: Arc<Handler>,
}

impl<T, D> Drop for RefreshChain<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // no-op when the chain finished regularly
        self.handler.complete(Err(CachedObjectError::Cancelled));

        let next = {
            let mut slots = self
                .core
                .refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match &slots.active {
                Some(active) if Arc::ptr_eq(active, &self.handler) => {
                    slots.active = slots.queued.take();
                    slots.active.clone()
                }
                _ => None,
            }
        };
        if let Some(next) = next {
            tracing::warn!(name = %self.core.name, handler = self.handler.id, "Refresh aborted, restarting queued refresh");
            self.core
                .runtime
                .spawn(Arc::clone(&self.core).run_refresh_chain(next));
        }
    }
}

impl<T, D> Core<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub async fn refresh_value(
        self: &Arc<Self>,
        skip_if_started_within: Duration,
        cancel: Option<&CancellationToken>,
    ) -> CachedObjectResult {
        match self.state.load() {
            CachedObjectState::Ready => {}
            CachedObjectState::Disposed => return Err(CachedObjectError::Disposed),
            // the first value is as fresh as it gets
            _ => return self.initialize(cancel).await.map(|_| ()),
        }

        if !skip_if_started_within.is_zero() {
            let started = self.refresh_times.lock().unwrap().started;
            if started.is_some_and(|started| started.elapsed() < skip_if_started_within) {
                tracing::trace!(name = %self.name, "Skipping refresh, previous one is recent enough");
                metric!(counter("cached_object.refresh.skipped") += 1, "name" => &self.name);
                return Ok(());
            }
        }

        let waiter = {
            let mut slots = self.refresh.lock().unwrap();
            self.attach_refresh(&mut slots, skip_if_started_within)
        };
        waiter.wait(cancel, &self.dispose_token).await
    }

    /// Finds (or creates) the refresh handler a new caller waits for.
    fn attach_refresh(self: &Arc<Self>, slots: &mut RefreshSlots, skip: Duration) -> Waiter {
        let Some(active) = &slots.active else {
            let (handler, waiter) = Handler::new(&self.dispose_token, ());
            tracing::trace!(name = %self.name, handler = handler.id, "Starting refresh");
            slots.active = Some(Arc::clone(&handler));
            self.runtime
                .spawn(Arc::clone(self).run_refresh_chain(handler));
            return waiter;
        };

        // a refresh that started within the caller's window is fresh enough
        if !skip.is_zero() && active.is_running() && active.started_within(skip) {
            if let Some(waiter) = active.try_attach() {
                tracing::trace!(name = %self.name, handler = active.id, "Joining running refresh");
                return waiter;
            }
        }
        if active.is_accepting() {
            if let Some(waiter) = active.try_attach() {
                tracing::trace!(name = %self.name, handler = active.id, "Joining pending refresh");
                return waiter;
            }
        }
        if let Some(queued) = slots.queued.as_ref().filter(|queued| queued.is_accepting()) {
            if let Some(waiter) = queued.try_attach() {
                tracing::trace!(name = %self.name, handler = queued.id, "Joining queued refresh");
                return waiter;
            }
        }

        // nobody is waiting for the queued handler anymore (if there is one), replace it
        let (handler, waiter) = Handler::new(&self.dispose_token, ());
        tracing::trace!(name = %self.name, handler = handler.id, "Queueing refresh");
        slots.queued = Some(handler);
        waiter
    }

    /// Runs `first` and every refresh queued behind it, holding the lock for all of them.
    async fn run_refresh_chain(self: Arc<Self>, first: Arc<Handler>) {
        let mut chain = RefreshChain {
            core: Arc::clone(&self),
            handler: first,
        };
        let mut guard = None;
        loop {
            let handler = Arc::clone(&chain.handler);
            if guard.is_none() {
                guard = self.lock.acquire(Priority::High, &handler.token).await;
            }
            let outcome = if guard.is_some() {
                handler.mark_running();
                self.execute_refresh(&handler.token).await
            } else {
                Err(self.cancellation_error())
            };
            handler.complete(outcome);

            let next = {
                let mut slots = self.refresh.lock().unwrap();
                slots.active = slots.queued.take();
                slots.active.clone()
            };
            match next {
                Some(next) => {
                    tracing::trace!(name = %self.name, from = handler.id, to = next.id, "Handing off refresh");
                    chain.handler = next;
                }
                None => break,
            }
        }
        // lets a pending update in, if there is one
        drop(guard);
    }

    /// Recomputes the value with the value factory and publishes it.
    async fn execute_refresh(&self, token: &CancellationToken) -> CachedObjectResult {
        let Some(previous) = self.snapshot() else {
            return Err(CachedObjectError::Disposed);
        };
        let started = Instant::now();
        let factory = Arc::clone(&self.factory);
        let result = self
            .run_guarded(token, self.timeouts.refresh, |token| async move {
                factory(token).await.map_err(CachedObjectError::factory)
            })
            .await
            .and_then(|value| {
                let value = Arc::new(value);
                let version = self.publish(Arc::clone(&value), false)?;
                Ok((value, version))
            });
        let duration = started.elapsed();

        let status = match &result {
            Ok(_) => "success",
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("cached_object.refresh") += 1, "name" => &self.name, "status" => status);
        metric!(timer("cached_object.refresh.duration") = duration, "name" => &self.name);

        match result {
            Ok((new, version)) => {
                {
                    let mut times = self.refresh_times.lock().unwrap();
                    times.started = Some(started);
                    times.finished = Some(Instant::now());
                }
                tracing::debug!(name = %self.name, version, ?duration, "Refreshed cached object");
                emit_refreshed(
                    self,
                    ValueRefreshedEvent {
                        previous: Arc::clone(&previous.value),
                        new,
                        duration,
                        version,
                    },
                );
                Ok(())
            }
            // every waiter gave up, or the object is gone: nothing failed
            Err(error @ (CachedObjectError::Disposed | CachedObjectError::Cancelled)) => Err(error),
            Err(error) => {
                tracing::debug!(name = %self.name, %error, "Failed to refresh cached object");
                self.events.refresh_error.emit(&ValueRefreshErrorEvent {
                    error: error.clone(),
                    current: Arc::clone(&previous.value),
                    duration,
                    version: previous.version,
                });
                Err(error)
            }
        }
    }
}
