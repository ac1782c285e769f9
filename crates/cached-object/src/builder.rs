use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::{CachedObjectConfig, UpdateMode};
use crate::object::{
    ApplyUpdatesFn, Core, FetchUpdatesFn, NoUpdates, Timeouts, Updaters, ValueFactory,
};
use crate::schedule::IntervalFactory;
use crate::CachedObject;

/// Wires a value factory and its optional collaborators into a [`CachedObject`].
///
/// ```no_run
/// # async fn load_settings() -> anyhow::Result<String> { Ok(String::new()) }
/// # #[tokio::main] async fn main() {
/// use std::time::Duration;
/// use cached_object::CachedObjectBuilder;
///
/// let settings = CachedObjectBuilder::new(|_cancel| load_settings())
///     .name("settings")
///     .refresh_interval(Duration::from_secs(60))
///     .build();
/// let current = settings.initialize(None).await;
/// # }
/// ```
pub struct CachedObjectBuilder<T, D = NoUpdates> {
    name: String,
    factory: ValueFactory<T>,
    refresh_intervals: Option<IntervalFactory>,
    update_intervals: Option<IntervalFactory>,
    timeouts: Timeouts,
    apply: Option<ApplyUpdatesFn<T, D>>,
    fetch: Option<FetchUpdatesFn<T, D>>,
    update_mode: UpdateMode,
    runtime: Option<Handle>,
}

impl<T> CachedObjectBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Starts a builder for an object computed by `factory`.
    ///
    /// The factory gets a cancellation token that fires on timeout or disposal.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let defaults = CachedObjectConfig::default();
        Self {
            name: defaults.name,
            factory: Arc::new(move |token| factory(token).boxed()),
            refresh_intervals: None,
            update_intervals: None,
            timeouts: Timeouts::default(),
            apply: None,
            fetch: None,
            update_mode: defaults.update_mode,
            runtime: None,
        }
    }

    /// Makes the object accept deltas of type `D`, applied to the current value with `apply`.
    pub fn with_updates<D, F, Fut>(self, apply: F) -> CachedObjectBuilder<T, D>
    where
        D: Send + Sync + 'static,
        F: Fn(Arc<T>, Arc<D>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        CachedObjectBuilder {
            name: self.name,
            factory: self.factory,
            refresh_intervals: self.refresh_intervals,
            update_intervals: self.update_intervals,
            timeouts: self.timeouts,
            apply: Some(Arc::new(move |value, updates, token| {
                apply(value, updates, token).boxed()
            })),
            fetch: None,
            update_mode: self.update_mode,
            runtime: self.runtime,
        }
    }
}

impl<T, D> CachedObjectBuilder<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Sets a function that fetches a delta for the current value.
    ///
    /// This enables [`CachedObject::pull_updates`] and, with an update interval, periodic pulls.
    pub fn fetch_updates<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<D>> + Send + 'static,
    {
        self.fetch = Some(Arc::new(move |value, token| fetch(value, token).boxed()));
        self
    }

    /// Applies everything set in `config`.
    pub fn with_config(mut self, config: &CachedObjectConfig) -> Self {
        self.name = config.name.clone();
        self.refresh_intervals = config
            .refresh_interval
            .map(|interval| IntervalFactory::jittered(interval, config.refresh_jitter));
        self.update_intervals = config.update_interval.map(IntervalFactory::fixed);
        self.timeouts = Timeouts {
            initialize: config.initialize_timeout,
            refresh: config.refresh_timeout,
            update: config.update_timeout,
        };
        self.update_mode = config.update_mode;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn refresh_interval(self, interval: Duration) -> Self {
        self.refresh_interval_factory(IntervalFactory::fixed(interval))
    }

    /// Sets the factory consulted for the delay before every automatic refresh.
    pub fn refresh_interval_factory(mut self, intervals: IntervalFactory) -> Self {
        self.refresh_intervals = Some(intervals);
        self
    }

    pub fn update_interval(self, interval: Duration) -> Self {
        self.update_interval_factory(IntervalFactory::fixed(interval))
    }

    /// Sets the factory consulted for the delay before every automatic update pull.
    ///
    /// Only has an effect together with [`fetch_updates`](Self::fetch_updates).
    pub fn update_interval_factory(mut self, intervals: IntervalFactory) -> Self {
        self.update_intervals = Some(intervals);
        self
    }

    pub fn initialize_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.initialize = Some(timeout);
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.refresh = Some(timeout);
        self
    }

    pub fn update_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.update = Some(timeout);
        self
    }

    pub fn update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    /// Sets the runtime that background work is spawned on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the object. Nothing is computed until the value is first requested.
    ///
    /// # Panics
    ///
    /// Without an explicit [`runtime`](Self::runtime), this must be called from within a tokio
    /// runtime.
    pub fn build(self) -> CachedObject<T, D> {
        let runtime = self.runtime.unwrap_or_else(Handle::current);
        let updaters = self.apply.map(|apply| Updaters {
            apply,
            fetch: self.fetch,
            mode: self.update_mode,
            intervals: self.update_intervals,
        });
        CachedObject::from_core(Core::new(
            self.name.into(),
            runtime,
            self.factory,
            self.refresh_intervals,
            self.timeouts,
            updaters,
        ))
    }
}
