//! Tracks which loads the current task is computing.
//!
//! Every load runs inside a task-local scope containing the `(cache, key)` frames of all the loads
//! that transitively caused it. A read for a frame that is already on that stack would wait on
//! itself, so the caches refuse it with [`CacheError::Reentrant`] instead.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{CacheError, CacheKey};

tokio::task_local! {
    static LOAD_STACK: Arc<[LoadFrame]>;
}

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(1);

/// Hands out a process-unique id for a new cache instance.
pub(crate) fn next_cache_id() -> usize {
    NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed)
}

/// One load on the stack: a cache instance and the key it is loading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LoadFrame {
    pub cache: usize,
    pub key: CacheKey,
}

/// Returns the stack of loads the current task is running inside of.
fn current_stack() -> Option<Arc<[LoadFrame]>> {
    LOAD_STACK.try_with(Arc::clone).ok()
}

/// Checks whether `key` of cache `cache` is being loaded by the current task or one of the loads
/// that started it.
pub(crate) fn is_loading(cache: usize, key: &CacheKey) -> bool {
    LOAD_STACK
        .try_with(|stack| {
            stack
                .iter()
                .any(|frame| frame.cache == cache && &frame.key == key)
        })
        .unwrap_or(false)
}

/// Creates the error for a refused re-entrant read and logs it.
pub(crate) fn reentrant(cache: &str, key: &CacheKey) -> CacheError {
    tracing::warn!(cache, %key, "cache re-entered while loading the same key");
    metric!(counter("caches.reentrant") += 1, "cache" => cache);
    CacheError::Reentrant {
        cache: cache.to_owned(),
        key: key.to_string(),
    }
}

/// Runs `future` with `frame` pushed onto the load stack of the calling context.
///
/// The stack is captured when this is called, not when the future is first polled, so it is
/// inherited by loads spawned onto other tasks.
pub(crate) fn scoped<F: Future>(frame: LoadFrame, future: F) -> impl Future<Output = F::Output> {
    let stack: Arc<[LoadFrame]> = match current_stack() {
        Some(parent) => parent.iter().cloned().chain([frame]).collect(),
        None => Arc::new([frame]),
    };
    LOAD_STACK.scope(stack, future)
}
