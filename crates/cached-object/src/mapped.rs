//! Values derived from other cached objects.
//!
//! A derived object is a regular [`CachedObject`] whose value factory reads its source. It follows
//! its source around: a successful refresh (or update) of the source triggers a refresh of the
//! derived object, unless it already saw that source version, and disposing the source disposes
//! the derived object. Derived objects may be mapped again, forming a chain.
//!
//! The derived object holds a strong reference to its source. The source only knows about its
//! derivations through its subscriber lists, which hold weak references.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::UpdateMode;
use crate::object::{
    ApplyUpdatesFn, CachedObjectState, Core, NoUpdates, Timeouts, Updaters, ValueFactory,
};
use crate::utils::CallOnDrop;
use crate::{CachedObject, CachedObjectError};

impl<T, D> CachedObject<T, D>
where
    T: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Derives a new object by applying `f` to this object's value.
    ///
    /// The derived value is computed lazily, on first access.
    pub fn map<U, F>(&self, f: F) -> CachedObject<U>
    where
        U: Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.map_async(move |value, _| futures::future::ready(Ok(f(&value))))
    }

    /// Derives a new object by applying the fallible, asynchronous `f` to this object's value.
    ///
    /// Updates of this object are followed by a full refresh of the derived one.
    pub fn map_async<U, F, Fut>(&self, f: F) -> CachedObject<U>
    where
        U: Send + Sync + 'static,
        F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        let applied = Arc::new(AtomicU64::new(0));
        let factory = self.derived_factory(f, Arc::clone(&applied));
        let derived = CachedObject::from_core(Core::<U, NoUpdates>::new(
            self.derived_name(),
            self.core.runtime.clone(),
            factory,
            None,
            Timeouts::default(),
            None,
        ));
        self.follow(&derived, applied, |derived, _| {
            spawn_derived_refresh(derived);
        });
        derived
    }

    /// Like [`map_async`](Self::map_async), but translates this object's updates into updates of
    /// the derived object with `map_updates`, instead of refreshing it.
    ///
    /// Translated updates are applied to the derived object in order.
    pub fn map_with_updates<U, F, Fut, G, GFut>(&self, f: F, map_updates: G) -> CachedObject<U, D>
    where
        U: Send + Sync + 'static,
        F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
        G: Fn(Arc<U>, Arc<D>, CancellationToken) -> GFut + Send + Sync + 'static,
        GFut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        let applied = Arc::new(AtomicU64::new(0));
        let factory = self.derived_factory(f, Arc::clone(&applied));
        let apply: ApplyUpdatesFn<U, D> =
            Arc::new(move |value, updates, token| map_updates(value, updates, token).boxed());
        let updaters = Updaters {
            apply,
            fetch: None,
            mode: UpdateMode::Sequential,
            intervals: None,
        };
        let derived = CachedObject::from_core(Core::new(
            self.derived_name(),
            self.core.runtime.clone(),
            factory,
            None,
            Timeouts::default(),
            Some(updaters),
        ));

        // forwards the source's updates one by one, in the order they were applied
        let (forward, mut updates) = mpsc::unbounded_channel::<(Arc<D>, u64)>();
        let weak = Arc::downgrade(&derived.core);
        let stop = derived.core.dispose_token.clone();
        let forwarded = Arc::clone(&applied);
        derived.core.runtime.spawn(async move {
            loop {
                let (delta, version) = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    next = updates.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                let Some(derived) = weak.upgrade() else {
                    break;
                };
                match derived.update_value(delta, None).await {
                    Ok(()) => {
                        forwarded.fetch_max(version, Ordering::AcqRel);
                    }
                    Err(CachedObjectError::Disposed) => break,
                    Err(error) => {
                        // also reported through the derived object's own update error event
                        tracing::warn!(name = %derived.name, %error, "Failed to update derived object");
                    }
                }
            }
        });

        self.follow(&derived, applied, move |_, event| {
            let _ = forward.send((Arc::clone(&event.updates), event.version));
        });
        derived
    }

    fn derived_name(&self) -> Arc<str> {
        format!("{}.mapped", self.core.name).into()
    }

    /// The value factory of a derived object: initialize the source, then map its value.
    fn derived_factory<U, F, Fut>(&self, f: F, applied: Arc<AtomicU64>) -> ValueFactory<U>
    where
        U: Send + Sync + 'static,
        F: Fn(Arc<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Arc::new(move |token| {
            let source = source.clone();
            let f = Arc::clone(&f);
            let applied = Arc::clone(&applied);
            async move {
                source.core.initialize(Some(&token)).await?;
                let snapshot = source.core.snapshot().ok_or(CachedObjectError::Disposed)?;
                let value = f(Arc::clone(&snapshot.value), token).await?;
                applied.fetch_max(snapshot.version, Ordering::AcqRel);
                Ok::<_, anyhow::Error>(value)
            }
            .boxed()
        })
    }

    /// Subscribes `derived` to this object's events, and unsubscribes once it goes away.
    fn follow<U, DU, F>(&self, derived: &CachedObject<U, DU>, applied: Arc<AtomicU64>, on_update: F)
    where
        U: Send + Sync + 'static,
        DU: Send + Sync + 'static,
        F: Fn(Arc<Core<U, DU>>, &crate::events::ValueUpdatedEvent<T, D>) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&derived.core);
        let refreshed = {
            let weak = Weak::clone(&weak);
            let applied = Arc::clone(&applied);
            self.on_value_refreshed(move |event| {
                if let Some(derived) = stale_derived(&weak, &applied, event.version) {
                    spawn_derived_refresh(derived);
                }
            })
        };
        let updated = {
            let weak = Weak::clone(&weak);
            self.on_value_updated(move |event| {
                if let Some(derived) = stale_derived(&weak, &applied, event.version) {
                    on_update(derived, event);
                }
            })
        };
        let disposed = self.on_disposed(move |_| {
            if let Some(derived) = weak.upgrade() {
                derived.dispose();
            }
        });

        let source = self.clone();
        derived.core.add_disposable(CallOnDrop::new(move || {
            source.unsubscribe(refreshed);
            source.unsubscribe(updated);
            source.unsubscribe(disposed);
        }));
    }
}

/// Returns the derived object if it is ready and has not seen `version` of its source yet.
///
/// Objects that were never initialized pick up the latest source value lazily.
fn stale_derived<U, DU>(
    derived: &Weak<Core<U, DU>>,
    applied: &AtomicU64,
    version: u64,
) -> Option<Arc<Core<U, DU>>> {
    let derived = derived.upgrade()?;
    let stale = derived.state.load() == CachedObjectState::Ready
        && version > applied.load(Ordering::Acquire);
    stale.then_some(derived)
}

fn spawn_derived_refresh<U, DU>(derived: Arc<Core<U, DU>>)
where
    U: Send + Sync + 'static,
    DU: Send + Sync + 'static,
{
    let runtime = derived.runtime.clone();
    runtime.spawn(async move {
        match derived.refresh_value(Duration::ZERO, None).await {
            Ok(()) | Err(CachedObjectError::Disposed) => {}
            Err(error) => {
                // also reported through the derived object's own refresh error event
                tracing::warn!(name = %derived.name, %error, "Failed to refresh derived object");
            }
        }
    });
}
