//! Asynchronous memoization for the data a debugger client fetches from its replay backend.
//!
//! All caches share the same contract: at most one load runs per key until the key is evicted,
//! every concurrent reader waits for that same load, and failures are remembered and re-delivered
//! just like values. Loads are spawned onto the Tokio runtime and keep running when their readers
//! go away.
//!
//! # Cache Flavors
//!
//! - [`Cache`]: one value per key, loaded through a [`Loader`].
//! - [`IntervalCache`]: values ordered by a point (like an execution point), loaded in ranges. A
//!   read only loads the gaps between the ranges that were loaded before.
//! - [`StreamingCache`]: values that arrive incrementally, with late subscribers replayed the
//!   latest state.
//!
//! Every cache has an `async` read returning [`CacheContents`], and a synchronous `read` that never
//! blocks but returns [`ReadError::Suspended`] while the value is loading. See [`resolve`] for how
//! to drive those.
//!
//! # Composition
//!
//! Loaders may read other caches. A load that ends up requesting its own key again is refused with
//! [`CacheError::Reentrant`] instead of deadlocking.
//!
//! # Metrics
//!
//! Once [`metrics::configure_statsd`] has been called, every cache reports the following metrics,
//! tagged with the `cache` name:
//!
//! - `caches.access`: All accesses to the cache.
//! - `caches.memory.hit`: Accesses served by a resolved, rejected or pending entry.
//! - `caches.computation`: Loads started. These are the misses.
//! - `caches.computation.duration`: How long each load took.
//! - `caches.computation.error`: Failed loads, tagged with a `reason`.
//! - `caches.evict` and `caches.abort`: Entries evicted and loads aborted.
//! - `caches.reentrant`: Refused re-entrant reads.
//! - `caches.interval.gaps`: The number of gaps loaded by an interval read.
//! - `caches.interval.partial_coverage`: Interval loads that returned values out of bounds.
//! - `caches.interval.ranges`: The number of disjoint intervals after a gap was loaded.
//! - `caches.stream.update`: Updates pushed into streams.
//!
//! # Configuration
//!
//! [`CacheConfig`] controls eviction. An immutable cache refuses to evict resolved values, which
//! suits data that can never change for the lifetime of a recording.

#[macro_use]
pub mod metrics;

mod cache_error;
mod cache_key;
mod config;
mod entry;
mod interval;
pub mod intervals;
mod load_scope;
mod point;
mod streaming;
mod subscription;
mod suspense;
pub mod utils;


pub use cache_error::{CacheContents, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder, KeyParts};
pub use config::CacheConfig;
pub use entry::{InFlight, Status};
pub use interval::{IntervalCache, IntervalLoader};
pub use intervals::{Interval, IntervalSet};
pub use point::{Cache, FnLoader, Loader, loader_fn, loader_fn_with_key};
pub use streaming::{
    Availability, StreamSink, StreamSnapshot, StreamingCache, StreamingLoader, StreamingValue,
};
pub use subscription::Subscription;
pub use suspense::{ReadError, ReadResult, Suspend, resolve};
