//! Coordination primitives the refresh and update paths are built from.

mod completion;
mod priority_mutex;

pub use completion::BroadcastOnce;
pub use priority_mutex::{Priority, PriorityMutex, PriorityMutexGuard};
