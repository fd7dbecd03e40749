//! Container attribution: maps a process id to the name of the container it
//! belongs to.
//!
//! The [`AttributionCache`] holds two independent expiring stores. The
//! container store is filled in bulk by the [`ContainerLoader`], driven
//! periodically by a [`RefreshScheduler`]: every record is indexed under its
//! init process, its parent and all the descendants of the parent. The name
//! store is filled lazily by the [`AttributionResolver`], which falls back to
//! walking `/proc` ancestry on a miss.
//!
//! ```text
//! RefreshScheduler -> ContainerLoader -> container store <---+
//!                                                            |
//! event pid -> AttributionResolver -> name store ------------+
//! ```

mod cache;
mod loader;
mod resolver;
mod scheduler;

pub use cache::{AttributionCache, ExpiringStore, spawn_sweeper};
pub use loader::ContainerLoader;
pub use resolver::{Attribution, AttributionResolver, ResolveMode, UNKNOWN_CONTAINER};
pub use scheduler::{RefreshScheduler, MAX_REFRESH_FAILURES};

use std::time::Duration;

/// Default lifetime of container store entries.
pub const DEFAULT_CONTAINER_TTL: Duration = Duration::from_secs(5 * 60);
/// Default lifetime of positive name store entries.
pub const DEFAULT_NAME_TTL: Duration = Duration::from_secs(5 * 60);
/// Default period of the physical eviction of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Default period of the container metadata refresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
