//! Helpers for testing cached objects.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Background work (refreshes triggered by a source, scheduled refreshes) completes
//!    asynchronously. Use [`wait_for`] instead of fixed sleeps to observe its effects.
//!
//!  - Tests using `start_paused = true` advance time automatically whenever the runtime is idle.
//!    Instrumented factories should sleep on `tokio::time` so that this works as expected.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `cached_object` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cached_object=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts invocations of an instrumented function.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call, returning how many calls there were including this one.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CallCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallCounter").field(&self.get()).finish()
    }
}

/// Tracks how many instrumented sections run at the same time.
///
/// ```
/// let probe = cached_object_test::ConcurrencyProbe::new();
/// {
///     let _section = probe.enter();
///     assert_eq!(probe.current(), 1);
/// }
/// assert_eq!(probe.max_concurrency(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a section, which is left again when the returned guard is dropped.
    pub fn enter(&self) -> ProbeGuard {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(current, Ordering::SeqCst);
        ProbeGuard {
            current: Arc::clone(&self.current),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// The highest number of sections that were ever entered at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// A section entered with [`ConcurrencyProbe::enter`].
#[derive(Debug)]
pub struct ProbeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collects values in the order they were recorded, e.g. from event subscribers.
#[derive(Debug)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of everything recorded so far.
    pub fn values(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within `timeout`.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    if tokio::time::timeout(timeout, poll).await.is_err() {
        panic!("condition not met within {timeout:?}");
    }
}

/// Lets every other task on a current-thread runtime run until it blocks.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
