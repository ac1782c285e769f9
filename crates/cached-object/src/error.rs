use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The outcome of a failed operation on a [`CachedObject`](crate::CachedObject).
///
/// A single underlying computation is usually shared by many waiting callers, so this error is
/// cheaply [`Clone`]able and the very same error is replayed to every one of them.
#[derive(Debug, Clone, Error)]
pub enum CachedObjectError {
    /// The value factory failed, either during initialization or during a refresh.
    ///
    /// Initialization failures reset the object so that it can be initialized again, refresh
    /// failures leave the current value and version untouched.
    #[error("value factory failed: {0:#}")]
    Factory(Arc<anyhow::Error>),
    /// The update function failed. The current value is unchanged.
    #[error("update failed: {0:#}")]
    Update(Arc<anyhow::Error>),
    /// The operation was cancelled by the caller, or every caller interested in a shared
    /// operation gave up on it.
    #[error("operation cancelled")]
    Cancelled,
    /// The operation did not finish within its configured timeout and was cancelled.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The object has been disposed.
    #[error("cached object has been disposed")]
    Disposed,
    /// An update was requested on an object that was built without update functions.
    #[error("cached object does not support updates")]
    UpdatesNotSupported,
}

impl CachedObjectError {
    pub(crate) fn factory(err: anyhow::Error) -> Self {
        Self::Factory(Arc::new(err))
    }

    pub(crate) fn update(err: anyhow::Error) -> Self {
        Self::Update(Arc::new(err))
    }

    /// Returns `true` for outcomes that represent a cancellation rather than a failure.
    ///
    /// Timeouts are cancellations as well, they are just initiated by the object itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }

    /// A short, static tag for metrics and structured logs.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Factory(_) => "factory_error",
            Self::Update(_) => "update_error",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::Disposed => "disposed",
            Self::UpdatesNotSupported => "unsupported",
        }
    }
}

/// The result type of all fallible [`CachedObject`](crate::CachedObject) operations.
pub type CachedObjectResult<T = ()> = Result<T, CachedObjectError>;
