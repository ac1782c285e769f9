//! A single, automatically refreshed, in-process value.
//!
//! A [`CachedObject`] holds a value that is expensive to compute. It is computed lazily, exactly
//! once no matter how many callers ask for it concurrently, and then kept fresh by refreshes
//! (full recomputations, periodic or on demand) and optionally by updates (deltas applied to the
//! current value). At most one refresh or update runs at any time, refreshes always go before
//! updates, and redundant concurrent requests are coalesced into a single execution.
//!
//! Objects can be [mapped](CachedObject::map) into derived objects, which follow their source.
//!
//! Objects are created with a [`CachedObjectBuilder`].

#[macro_use]
pub mod metrics;

mod builder;
pub mod config;
mod error;
pub mod events;
mod handler;
mod init;
pub mod logging;
mod mapped;
mod object;
mod refresh;
pub mod schedule;
pub mod sync;
mod update;
pub mod utils;

pub use builder::CachedObjectBuilder;
pub use config::{CachedObjectConfig, UpdateMode};
pub use error::{CachedObjectError, CachedObjectResult};
pub use events::SubscriptionId;
pub use object::{CachedObject, CachedObjectState, NoUpdates};
pub use schedule::IntervalFactory;
