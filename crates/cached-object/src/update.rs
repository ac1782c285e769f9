use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::UpdateMode;
use crate::events::{ValueUpdateErrorEvent, ValueUpdatedEvent};
use crate::handler::{Handler, cancelled};
use crate::object::Core;
use crate::sync::Priority;
use crate::utils::CallOnDrop;
use crate::{CachedObjectError, CachedObjectResult};

/// What a coalesced update handler is going to do once it gets the lock.
pub(crate) enum UpdateWork<D> {
    /// Apply a caller supplied delta.
    Apply(Arc<D>),
    /// Fetch a delta for the current value first, then apply it.
    Pull,
}

/// A delta waiting in the sequential update queue.
pub(crate) struct QueuedUpdate<D> {
    updates: Arc<D>,
    /// Cancelled once the submitter stopped waiting.
    token: CancellationToken,
    reply: oneshot::Sender<CachedObjectResult>,
}

/// Applies the deltas of the sequential update queue one by one.
///
/// Each delta acquires the lock on its own, so refreshes can run in between.
struct UpdateConsumer<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    core: Weak<Core<T, D>>,
    receiver: Option<mpsc::UnboundedReceiver<QueuedUpdate<D>>>,
    stop: CancellationToken,
}

impl<T, D> UpdateConsumer<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn run(mut self) {
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        loop {
            let request = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let Some(core) = self.core.upgrade() else {
                break;
            };

            let outcome = match core.lock.acquire(Priority::Low, &request.token).await {
                Some(_guard) => {
                    core.execute_update(UpdateWork::Apply(request.updates), &request.token)
                        .await
                }
                None => Err(core.cancellation_error()),
            };
            // the submitter may be gone already
            let _ = request.reply.send(outcome);
        }
        self.receiver = None;
    }
}

impl<T, D> Drop for UpdateConsumer<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // the receiver is only left behind when applying a delta unwound
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        if self.stop.is_cancelled() {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            tracing::warn!(name = %core.name, "Update aborted, restarting update queue");
            let consumer = UpdateConsumer {
                core: Arc::downgrade(&core),
                receiver: Some(receiver),
                stop: self.stop.clone(),
            };
            core.runtime.spawn(consumer.run());
        }
    }
}

type CoalescedHandler<D> = Arc<Handler<Mutex<Option<UpdateWork<D>>>>>;

impl<T, D> Core<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub async fn update_value(
        self: &Arc<Self>,
        updates: Arc<D>,
        cancel: Option<&CancellationToken>,
    ) -> CachedObjectResult {
        let Some(updaters) = &self.updaters else {
            return Err(CachedObjectError::UpdatesNotSupported);
        };
        self.ensure_ready(cancel).await?;

        match updaters.mode {
            UpdateMode::Coalesced => {
                self.coalesced_update(UpdateWork::Apply(updates), cancel)
                    .await
            }
            UpdateMode::Sequential => self.enqueue_update(updates, cancel).await,
        }
    }

    pub async fn pull_updates(
        self: &Arc<Self>,
        cancel: Option<&CancellationToken>,
    ) -> CachedObjectResult {
        if !self
            .updaters
            .as_ref()
            .is_some_and(|updaters| updaters.fetch.is_some())
        {
            return Err(CachedObjectError::UpdatesNotSupported);
        }
        self.ensure_ready(cancel).await?;
        self.coalesced_update(UpdateWork::Pull, cancel).await
    }

    /// Runs the update inline if nothing else holds the lock, or joins the single queued update.
    ///
    /// A caller that joins an already queued update shares its outcome; the caller's own work is
    /// discarded.
    async fn coalesced_update(
        self: &Arc<Self>,
        work: UpdateWork<D>,
        cancel: Option<&CancellationToken>,
    ) -> CachedObjectResult {
        if let Some(_guard) = self.lock.try_acquire() {
            let token = self.dispose_token.child_token();
            let _token_guard = token.clone().drop_guard();
            return tokio::select! {
                biased;
                outcome = self.execute_update(work, &token) => outcome,
                _ = cancelled(cancel) => Err(CachedObjectError::Cancelled),
            };
        }

        let waiter = {
            let mut slot = self.coalesced_update.lock().unwrap();
            let existing = slot
                .as_ref()
                .filter(|handler| handler.is_accepting())
                .and_then(|handler| handler.try_attach());
            match existing {
                Some(waiter) => {
                    tracing::trace!(name = %self.name, handler = waiter.handler().id, "Joining queued update");
                    waiter
                }
                None => {
                    let (handler, waiter) =
                        Handler::new(&self.dispose_token, Mutex::new(Some(work)));
                    tracing::trace!(name = %self.name, handler = handler.id, "Queueing update");
                    *slot = Some(Arc::clone(&handler));
                    self.runtime
                        .spawn(Arc::clone(self).run_coalesced_update(handler));
                    waiter
                }
            }
        };
        waiter.wait(cancel, &self.dispose_token).await
    }

    async fn run_coalesced_update(self: Arc<Self>, handler: CoalescedHandler<D>) {
        // releases the waiters should the update unwind, a no-op once it completed
        let _release = {
            let handler = Arc::clone(&handler);
            CallOnDrop::new(move || {
                handler.complete(Err(CachedObjectError::Cancelled));
            })
        };
        let guard = self.lock.acquire(Priority::Low, &handler.token).await;
        {
            let mut slot = self.coalesced_update.lock().unwrap();
            if slot
                .as_ref()
                .is_some_and(|queued| Arc::ptr_eq(queued, &handler))
            {
                *slot = None;
            }
        }
        handler.mark_running();

        let work = handler.payload.lock().unwrap().take();
        let outcome = match (guard, work) {
            (Some(guard), Some(work)) => {
                let outcome = self.execute_update(work, &handler.token).await;
                drop(guard);
                outcome
            }
            _ => Err(self.cancellation_error()),
        };
        handler.complete(outcome);
    }

    /// Submits a delta to the sequential queue and waits until it was applied.
    ///
    /// Giving up on the wait withdraws the delta, unless it is already being applied.
    async fn enqueue_update(
        self: &Arc<Self>,
        updates: Arc<D>,
        cancel: Option<&CancellationToken>,
    ) -> CachedObjectResult {
        let token = self.dispose_token.child_token();
        let _token_guard = token.clone().drop_guard();
        let (reply, outcome) = oneshot::channel();

        let queue = self
            .update_queue
            .get_or_init(|| self.spawn_update_consumer());
        queue
            .send(QueuedUpdate {
                updates,
                token,
                reply,
            })
            .map_err(|_| CachedObjectError::Disposed)?;

        tokio::select! {
            biased;
            outcome = outcome => outcome.unwrap_or_else(|_| Err(self.cancellation_error())),
            _ = cancelled(cancel) => Err(CachedObjectError::Cancelled),
            _ = self.dispose_token.cancelled() => Err(CachedObjectError::Disposed),
        }
    }

    /// Spawns the single consumer of the sequential update queue.
    fn spawn_update_consumer(self: &Arc<Self>) -> mpsc::UnboundedSender<QueuedUpdate<D>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = UpdateConsumer {
            core: Arc::downgrade(self),
            receiver: Some(receiver),
            stop: self.dispose_token.clone(),
        };
        self.runtime.spawn(consumer.run());
        sender
    }

    /// Applies one delta (fetching it first for [`UpdateWork::Pull`]) and publishes the result.
    async fn execute_update(
        &self,
        work: UpdateWork<D>,
        token: &CancellationToken,
    ) -> CachedObjectResult {
        let Some(updaters) = &self.updaters else {
            return Err(CachedObjectError::UpdatesNotSupported);
        };
        let Some(previous) = self.snapshot() else {
            return Err(CachedObjectError::Disposed);
        };
        let started = Instant::now();

        let delta = OnceLock::new();
        if let UpdateWork::Apply(updates) = &work {
            let _ = delta.set(Arc::clone(updates));
        }
        let apply = Arc::clone(&updaters.apply);
        let fetch = updaters.fetch.clone();
        let current = Arc::clone(&previous.value);
        let delta_ref = &delta;

        let result = self
            .run_guarded(token, self.timeouts.update, |token| async move {
                let updates = match delta_ref.get() {
                    Some(updates) => Arc::clone(updates),
                    None => {
                        let fetch = fetch.ok_or(CachedObjectError::UpdatesNotSupported)?;
                        let updates = fetch(Arc::clone(&current), token.clone())
                            .await
                            .map_err(CachedObjectError::update)?;
                        Arc::clone(delta_ref.get_or_init(|| Arc::new(updates)))
                    }
                };
                let value = apply(current, Arc::clone(&updates), token)
                    .await
                    .map_err(CachedObjectError::update)?;
                Ok::<_, CachedObjectError>((value, updates))
            })
            .await
            .and_then(|(value, updates)| {
                let value = Arc::new(value);
                let version = self.publish(Arc::clone(&value), false)?;
                Ok((value, updates, version))
            });
        let duration = started.elapsed();

        let status = match &result {
            Ok(_) => "success",
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("cached_object.update") += 1, "name" => &self.name, "status" => status);
        metric!(timer("cached_object.update.duration") = duration, "name" => &self.name);

        match result {
            Ok((new, updates, version)) => {
                tracing::debug!(name = %self.name, version, ?duration, "Updated cached object");
                self.events.updated.emit(&ValueUpdatedEvent {
                    previous: Arc::clone(&previous.value),
                    new,
                    updates,
                    duration,
                    version,
                });
                Ok(())
            }
            Err(error @ (CachedObjectError::Disposed | CachedObjectError::Cancelled)) => Err(error),
            Err(error) => {
                tracing::debug!(name = %self.name, %error, "Failed to update cached object");
                self.events.update_error.emit(&ValueUpdateErrorEvent {
                    error: error.clone(),
                    current: Arc::clone(&previous.value),
                    updates: delta.get().cloned(),
                    duration,
                    version: previous.version,
                });
                Err(error)
            }
        }
    }
}
