use std::future::Future;

use tokio::runtime::{Handle, RuntimeFlavor};

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Runs the callback right away instead of on drop.
    pub fn call(mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Drives `future` to completion on the calling thread, while `runtime` runs its background tasks.
///
/// On a worker thread of a multi-threaded runtime, the thread is handed over to the runtime via
/// [`tokio::task::block_in_place`] first, so that the remaining workers can make progress on
/// whatever this thread is waiting for. Threads that do not drive any runtime, like the ones of
/// [`spawn_blocking`](tokio::task::spawn_blocking), simply block.
///
/// # Panics
///
/// Panics on the thread that drives a current-thread runtime, unless `runtime` is a
/// multi-threaded one that can make progress on its own.
pub fn block_on<F: Future>(runtime: &Handle, future: F) -> F::Output {
    let on_current_thread = Handle::try_current()
        .is_ok_and(|current| current.runtime_flavor() == RuntimeFlavor::CurrentThread);
    if on_current_thread && runtime.runtime_flavor() != RuntimeFlavor::CurrentThread {
        return futures::executor::block_on(future);
    }
    // a no-op outside of runtime workers, and a panic on a current-thread runtime's own thread
    tokio::task::block_in_place(|| futures::executor::block_on(future))
}
