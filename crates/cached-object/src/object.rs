use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::UpdateMode;
use crate::events::{
    DisposedEvent, Events, InitializedEvent, SubscriptionId, ValueRefreshErrorEvent,
    ValueRefreshedEvent, ValueUpdateErrorEvent, ValueUpdatedEvent,
};
use crate::handler::Handler;
use crate::init::InitSlot;
use crate::refresh::RefreshSlots;
use crate::schedule::IntervalFactory;
use crate::sync::PriorityMutex;
use crate::update::{QueuedUpdate, UpdateWork};
use crate::utils::{CallOnDrop, block_on};
use crate::{CachedObjectError, CachedObjectResult};

pub(crate) type ValueFactory<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

pub(crate) type ApplyUpdatesFn<T, D> = Arc<
    dyn Fn(Arc<T>, Arc<D>, CancellationToken) -> BoxFuture<'static, anyhow::Result<T>>
        + Send
        + Sync,
>;

pub(crate) type FetchUpdatesFn<T, D> =
    Arc<dyn Fn(Arc<T>, CancellationToken) -> BoxFuture<'static, anyhow::Result<D>> + Send + Sync>;

/// The delta type of objects that do not support updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoUpdates {}

/// The lifecycle of a [`CachedObject`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CachedObjectState {
    /// No value has been computed yet, or the last attempt failed.
    PendingInitialization = 0,
    /// The first value is being computed.
    InitializationInProgress = 1,
    /// A value is available.
    Ready = 2,
    /// The object was disposed. This is final.
    Disposed = 3,
}

impl CachedObjectState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::PendingInitialization,
            1 => Self::InitializationInProgress,
            2 => Self::Ready,
            _ => Self::Disposed,
        }
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(CachedObjectState::PendingInitialization as u8))
    }

    pub fn load(&self) -> CachedObjectState {
        CachedObjectState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Transitions `from -> to`, failing if the state is no longer `from`.
    pub fn transition(&self, from: CachedObjectState, to: CachedObjectState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn swap(&self, to: CachedObjectState) -> CachedObjectState {
        CachedObjectState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
    }
}

/// The published value together with the version it was published as.
#[derive(Debug)]
pub(crate) struct Snapshot<T> {
    pub value: Arc<T>,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Timeouts {
    pub initialize: Option<Duration>,
    pub refresh: Option<Duration>,
    pub update: Option<Duration>,
}

pub(crate) struct Updaters<T, D> {
    pub apply: ApplyUpdatesFn<T, D>,
    pub fetch: Option<FetchUpdatesFn<T, D>>,
    pub mode: UpdateMode,
    pub intervals: Option<IntervalFactory>,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RefreshTimes {
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
}

/// Everything a [`CachedObject`] is made of, shared by all its handles and background tasks.
pub(crate) struct Core<T, D> {
    pub name: Arc<str>,
    pub runtime: Handle,
    pub state: StateCell,
    current: ArcSwapOption<Snapshot<T>>,
    version: AtomicU64,
    /// Serializes publishing a value against disposal.
    publish: Mutex<()>,
    pub factory: ValueFactory<T>,
    pub refresh_intervals: Option<IntervalFactory>,
    pub timeouts: Timeouts,
    pub updaters: Option<Updaters<T, D>>,
    /// Refreshes and updates take turns on this lock, refreshes first.
    pub lock: PriorityMutex,
    pub init: Mutex<InitSlot<T>>,
    pub refresh: Mutex<RefreshSlots>,
    pub coalesced_update: Mutex<Option<Arc<Handler<Mutex<Option<UpdateWork<D>>>>>>>,
    pub update_queue: OnceLock<mpsc::UnboundedSender<QueuedUpdate<D>>>,
    pub refresh_times: Mutex<RefreshTimes>,
    pub events: Events<T, D>,
    disposables: Mutex<Vec<CallOnDrop>>,
    pub dispose_token: CancellationToken,
}

impl<T, D> Core<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(
        name: Arc<str>,
        runtime: Handle,
        factory: ValueFactory<T>,
        refresh_intervals: Option<IntervalFactory>,
        timeouts: Timeouts,
        updaters: Option<Updaters<T, D>>,
    ) -> Self {
        Self {
            name,
            runtime,
            state: StateCell::new(),
            current: ArcSwapOption::empty(),
            version: AtomicU64::new(0),
            publish: Mutex::new(()),
            factory,
            refresh_intervals,
            timeouts,
            updaters,
            lock: PriorityMutex::new(),
            init: Mutex::new(InitSlot::default()),
            refresh: Mutex::new(RefreshSlots::default()),
            coalesced_update: Mutex::new(None),
            update_queue: OnceLock::new(),
            refresh_times: Mutex::new(RefreshTimes::default()),
            events: Events::new(),
            disposables: Mutex::new(Vec::new()),
            dispose_token: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot<T>>> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.state.load() == CachedObjectState::Disposed
    }

    /// The error for an operation that was cut short: disposal always wins over cancellation.
    pub fn cancellation_error(&self) -> CachedObjectError {
        if self.dispose_token.is_cancelled() {
            CachedObjectError::Disposed
        } else {
            CachedObjectError::Cancelled
        }
    }

    /// Publishes a freshly computed value as the next version.
    ///
    /// With `initial`, this also completes the transition to [`CachedObjectState::Ready`].
    /// Fails if the object was disposed in the meantime, in which case nothing is published.
    pub fn publish(&self, value: Arc<T>, initial: bool) -> CachedObjectResult<u64> {
        let _publish = self.publish.lock().unwrap();
        let ready = if initial {
            self.state.transition(
                CachedObjectState::InitializationInProgress,
                CachedObjectState::Ready,
            )
        } else {
            self.state.load() == CachedObjectState::Ready
        };
        if !ready {
            return Err(CachedObjectError::Disposed);
        }

        let version = self.version.load(Ordering::Acquire) + 1;
        self.current.store(Some(Arc::new(Snapshot { value, version })));
        self.version.store(version, Ordering::Release);
        Ok(version)
    }

    /// Runs `f` when the object is disposed, or right away if it already is.
    pub fn add_disposable(&self, f: CallOnDrop) {
        let mut disposables = self.disposables.lock().unwrap();
        if self.is_disposed() {
            drop(disposables);
            f.call();
        } else {
            disposables.push(f);
        }
    }

    pub fn dispose(&self) {
        if self.state.swap(CachedObjectState::Disposed) == CachedObjectState::Disposed {
            return;
        }
        self.dispose_token.cancel();

        let version = {
            let _publish = self.publish.lock().unwrap();
            self.current.store(None);
            self.version()
        };

        let disposables = std::mem::take(&mut *self.disposables.lock().unwrap());
        for disposable in disposables {
            disposable.call();
        }

        tracing::debug!(name = %self.name, version, "Disposed cached object");
        metric!(counter("cached_object.disposed") += 1, "name" => &self.name);

        self.events.disposed.emit(&DisposedEvent { version });
        self.events.clear();
    }

    /// Runs a user provided function with cancellation and an optional timeout.
    ///
    /// The function gets its own child token of `token`, which is cancelled when the timeout
    /// elapses. Cancellation of `token` abandons the function right away.
    pub async fn run_guarded<R, F, Fut>(
        &self,
        token: &CancellationToken,
        timeout: Option<Duration>,
        f: F,
    ) -> CachedObjectResult<R>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = CachedObjectResult<R>>,
    {
        let attempt = token.child_token();
        let _attempt_guard = attempt.clone().drop_guard();
        let work = f(attempt);

        let work = async {
            match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, work).await {
                    Ok(res) => res,
                    Err(_) => Err(CachedObjectError::Timeout(timeout)),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(self.cancellation_error()),
            res = work => res,
        }
    }
}

impl<T, D> Drop for Core<T, D> {
    fn drop(&mut self) {
        // stops all background tasks still referring to us weakly
        self.dispose_token.cancel();
    }
}

/// A single, automatically refreshed, in-process value.
///
/// The value is computed lazily by a value factory on first access, refreshed periodically
/// and on demand, and optionally updated incrementally with deltas of type `D`. All of these run
/// one at a time, with refreshes taking priority over updates, and concurrent requests for the
/// same thing are coalesced into a single execution.
///
/// Reading the current value never blocks once the object is [`Ready`](CachedObjectState::Ready).
///
/// This is a cheap handle, cloning it yields another handle to the same object. Background
/// tasks only hold weak references, dropping the last handle stops them. Call
/// [`dispose`](Self::dispose) to release everything deterministically and notify subscribers.
pub struct CachedObject<T, D = NoUpdates> {
    pub(crate) core: Arc<Core<T, D>>,
}

impl<T, D> Clone for CachedObject<T, D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T, D> fmt::Debug for CachedObject<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedObject")
            .field("name", &self.core.name)
            .field("state", &self.core.state.load())
            .field("version", &self.core.version.load(Ordering::Relaxed))
            .field("lock", &self.core.lock)
            .finish()
    }
}

impl<T, D> CachedObject<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub(crate) fn from_core(core: Core<T, D>) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> CachedObjectState {
        self.core.state.load()
    }

    /// `0` before the first value, then incremented by one on every successful refresh or update.
    pub fn version(&self) -> u64 {
        self.core.version()
    }

    /// Returns the current value, initializing the object first if necessary.
    ///
    /// This blocks the current thread while the first value is being computed, see
    /// [`block_on`](crate::utils::block_on) for the restrictions that apply.
    pub fn value(&self) -> CachedObjectResult<Arc<T>> {
        if let Some(snapshot) = self.core.snapshot() {
            return Ok(Arc::clone(&snapshot.value));
        }
        if self.core.is_disposed() {
            return Err(CachedObjectError::Disposed);
        }
        block_on(&self.core.runtime, self.initialize(None))
    }

    /// Returns the current value if there is one, without ever blocking or initializing.
    pub fn try_value(&self) -> Option<Arc<T>> {
        self.core.snapshot().map(|snapshot| Arc::clone(&snapshot.value))
    }

    /// The current value together with its version.
    pub fn versioned_value(&self) -> Option<(Arc<T>, u64)> {
        self.core
            .snapshot()
            .map(|snapshot| (Arc::clone(&snapshot.value), snapshot.version))
    }

    /// Computes the first value, or waits for the computation already in progress.
    ///
    /// Returns the current value right away if the object is ready. Cancelling only stops this
    /// caller from waiting, the initialization itself carries on for everybody else.
    pub async fn initialize(
        &self,
        cancel: Option<CancellationToken>,
    ) -> CachedObjectResult<Arc<T>> {
        self.core.initialize(cancel.as_ref()).await
    }

    /// Blocking version of [`initialize`](Self::initialize).
    pub fn initialize_blocking(
        &self,
        cancel: Option<CancellationToken>,
    ) -> CachedObjectResult<Arc<T>> {
        block_on(&self.core.runtime, self.initialize(cancel))
    }

    /// Recomputes the value with the value factory.
    ///
    /// If a refresh that last succeeded started less than `skip_if_started_within` ago, this
    /// returns right away. Concurrent calls are coalesced: a call either joins the refresh that
    /// is waiting to run, or queues exactly one more behind the one that is running. Cancelling
    /// aborts the underlying refresh only once all of its callers cancelled.
    pub async fn refresh_value(
        &self,
        skip_if_started_within: Duration,
        cancel: Option<CancellationToken>,
    ) -> CachedObjectResult {
        self.core
            .refresh_value(skip_if_started_within, cancel.as_ref())
            .await
    }

    /// Blocking version of [`refresh_value`](Self::refresh_value).
    pub fn refresh_value_blocking(
        &self,
        skip_if_started_within: Duration,
        cancel: Option<CancellationToken>,
    ) -> CachedObjectResult {
        block_on(&self.core.runtime, self.refresh_value(skip_if_started_within, cancel))
    }

    /// Applies `updates` to the current value with the configured update function.
    ///
    /// Depending on the [`UpdateMode`], updates are either applied one by one in submission
    /// order, or coalesced with other concurrent updates.
    pub async fn update_value(
        &self,
        updates: D,
        cancel: Option<CancellationToken>,
    ) -> CachedObjectResult {
        self.core
            .update_value(Arc::new(updates), cancel.as_ref())
            .await
    }

    /// Blocking version of [`update_value`](Self::update_value).
    pub fn update_value_blocking(
        &self,
        updates: D,
        cancel: Option<CancellationToken>,
    ) -> CachedObjectResult {
        block_on(&self.core.runtime, self.update_value(updates, cancel))
    }

    /// Fetches updates for the current value and applies them, in a single coalesced pass.
    ///
    /// Requires an updates fetcher, see [`CachedObjectBuilder::fetch_updates`](crate::CachedObjectBuilder::fetch_updates).
    pub async fn pull_updates(&self, cancel: Option<CancellationToken>) -> CachedObjectResult {
        self.core.pull_updates(cancel.as_ref()).await
    }

    /// When the last successful refresh (or the initialization) started.
    pub fn last_refresh_started(&self) -> Option<Instant> {
        self.core.refresh_times.lock().unwrap().started
    }

    /// When the last successful refresh (or the initialization) finished.
    pub fn last_refresh_finished(&self) -> Option<Instant> {
        self.core.refresh_times.lock().unwrap().finished
    }

    /// Disposes the object.
    ///
    /// Cancels everything in flight, releases the value, stops the schedules and notifies the
    /// subscribers. Only the first call has any effect.
    pub fn dispose(&self) {
        self.core.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    pub fn on_initialized<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&InitializedEvent<T>) + Send + Sync + 'static,
    {
        self.core.events.initialized.subscribe(f)
    }

    pub fn on_disposed<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&DisposedEvent) + Send + Sync + 'static,
    {
        self.core.events.disposed.subscribe(f)
    }

    pub fn on_value_refreshed<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ValueRefreshedEvent<T>) + Send + Sync + 'static,
    {
        self.core.events.refreshed.subscribe(f)
    }

    pub fn on_value_refresh_error<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ValueRefreshErrorEvent<T>) + Send + Sync + 'static,
    {
        self.core.events.refresh_error.subscribe(f)
    }

    pub fn on_value_updated<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ValueUpdatedEvent<T, D>) + Send + Sync + 'static,
    {
        self.core.events.updated.subscribe(f)
    }

    pub fn on_value_update_error<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ValueUpdateErrorEvent<T, D>) + Send + Sync + 'static,
    {
        self.core.events.update_error.subscribe(f)
    }

    /// Removes a subscription made with any of the `on_*` methods.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let events = &self.core.events;
        events.initialized.unsubscribe(id)
            || events.disposed.unsubscribe(id)
            || events.refreshed.unsubscribe(id)
            || events.refresh_error.unsubscribe(id)
            || events.updated.unsubscribe(id)
            || events.update_error.unsubscribe(id)
    }
}

pub(crate) fn emit_initialized<T, D>(core: &Core<T, D>, value: Arc<T>, duration: Duration) {
    core.events
        .initialized
        .emit(&InitializedEvent { value, duration });
}

pub(crate) fn emit_refreshed<T, D>(core: &Core<T, D>, event: ValueRefreshedEvent<T>) {
    core.events.refreshed.emit(&event);
}
