use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The largest jitter fraction, keeping every interval at least a tenth of the base one.
const MAX_JITTER: f64 = 0.9;

/// Produces the delay until the next automatic refresh or update.
///
/// The factory is consulted again before every single cycle, which allows for jitter or
/// adaptive schedules. Returning `None` stops the schedule.
#[derive(Clone)]
pub struct IntervalFactory(Arc<dyn Fn() -> Option<Duration> + Send + Sync>);

impl IntervalFactory {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Option<Duration> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Always the same interval.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(move || Some(interval))
    }

    /// `interval`, randomly varied by up to `fraction` of it in either direction.
    ///
    /// `fraction` is clamped to `0.0..=MAX_JITTER`, so the interval never collapses to zero.
    pub fn jittered(interval: Duration, fraction: f64) -> Self {
        let fraction = fraction.clamp(0.0, MAX_JITTER);
        if fraction == 0.0 {
            return Self::fixed(interval);
        }
        Self::new(move || {
            let factor = 1.0 + rand::rng().random_range(-fraction..=fraction);
            Some(interval.mul_f64(factor))
        })
    }

    pub fn next_interval(&self) -> Option<Duration> {
        (self.0)()
    }
}

impl fmt::Debug for IntervalFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IntervalFactory").finish_non_exhaustive()
    }
}

/// Spawns a re-armed one-shot timer.
///
/// Before every cycle the next interval is taken from `intervals`. Once it elapsed, `tick` is
/// asked for the work to run and that work is awaited before the timer is re-armed, so cycles
/// never overlap. The schedule ends when `intervals` or `tick` return `None`, or `stop` fires.
pub(crate) fn spawn_periodic<F, Fut>(
    runtime: &Handle,
    intervals: IntervalFactory,
    stop: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Option<Fut> + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    runtime.spawn(async move {
        while let Some(interval) = intervals.next_interval() {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match tick() {
                Some(work) => work.await,
                None => break,
            }
        }
    })
}
