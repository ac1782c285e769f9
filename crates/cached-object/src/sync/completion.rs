use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

/// A completion signal that is resolved at most once and observed by any number of waiters.
///
/// Every waiter gets its own future via [`wait`](Self::wait), which can be dropped independently
/// of all the others, while all of them observe the very same outcome.
pub struct BroadcastOnce<T: Clone> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
    receiver: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> BroadcastOnce<T> {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: receiver.shared(),
        }
    }

    /// Resolves the signal for all current and future waiters.
    ///
    /// Returns `false` if the signal was already resolved, in which case `value` is discarded.
    pub fn complete(&self, value: T) -> bool {
        match self.sender.lock().unwrap().take() {
            Some(sender) => {
                // no receiver left is fine, the value is kept in the `Shared` future anyway
                let _ = sender.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    /// Waits for the outcome.
    ///
    /// Resolves to `None` if the signal was dropped without ever being completed.
    pub fn wait(&self) -> impl Future<Output = Option<T>> + Send + 'static
    where
        T: Send + Sync + 'static,
    {
        self.receiver.clone().map(Result::ok)
    }
}

impl<T: Clone> Default for BroadcastOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> fmt::Debug for BroadcastOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastOnce")
            .field("completed", &self.is_completed())
            .finish()
    }
}
