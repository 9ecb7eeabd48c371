//! The entry and in-flight machinery shared by all cache flavors.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::load_scope::{self, LoadFrame};
use crate::{CacheContents, CacheError};

/// The state of a single cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Nothing was requested for this key yet, or the entry has been evicted.
    NotRequested,
    /// A load is currently running.
    Pending,
    /// The value has been loaded successfully.
    Resolved,
    /// The load failed, the error is re-delivered until the entry is evicted.
    Rejected,
}

/// A point cache entry. [`Status::NotRequested`] is represented by the absence of an entry.
pub(crate) enum CacheEntry<V> {
    Pending(Pending<V>),
    Resolved(V),
    Rejected(CacheError),
}

impl<V> CacheEntry<V> {
    pub fn status(&self) -> Status {
        match self {
            Self::Pending(_) => Status::Pending,
            Self::Resolved(_) => Status::Resolved,
            Self::Rejected(_) => Status::Rejected,
        }
    }
}

pub(crate) struct Pending<V> {
    /// Identifies the load this entry is waiting for.
    pub epoch: u64,
    pub in_flight: InFlight<V>,
    pub abort: AbortHandle,
}

/// A handle to a running load.
///
/// All clones resolve to the same outcome. Dropping a handle does not cancel the load.
pub struct InFlight<T> {
    inner: Shared<BoxFuture<'static, CacheContents<T>>>,
}

impl<T> Clone for InFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for InFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight").finish_non_exhaustive()
    }
}

impl<T: Clone> Future for InFlight<T> {
    type Output = CacheContents<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Spawns a load onto the runtime and returns a handle to its outcome.
///
/// The load runs inside the load scope of `frame` and bound to a fresh Sentry hub. Its duration
/// is reported as `caches.computation.duration` of cache `name`. Once it finishes, `settle` is
/// called with the outcome *before* any waiter is woken up, so it can store the outcome in the
/// owning cache first. What `settle` returns is handed to the waiters.
///
/// The load keeps running when every handle is dropped. It only stops early when aborted through
/// the returned [`AbortHandle`], in which case all waiters receive [`CacheError::Aborted`].
///
/// # Panics
///
/// Must be called from within a Tokio runtime.
pub(crate) fn spawn_load<R, T, F, S>(
    name: Arc<str>,
    frame: LoadFrame,
    load: F,
    settle: S,
) -> (InFlight<T>, AbortHandle)
where
    F: Future<Output = CacheContents<R>> + Send + 'static,
    R: Send + 'static,
    S: FnOnce(CacheContents<R>) -> CacheContents<T> + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    let (sender, receiver) = oneshot::channel();

    let key = frame.key.clone();
    let load = load_scope::scoped(frame, AssertUnwindSafe(load).catch_unwind());
    let task = async move {
        let started = Instant::now();
        let result = load.await;
        metric!(timer("caches.computation.duration") = started.elapsed(), "cache" => &name);

        let result = match result {
            Ok(result) => result,
            Err(_panic) => {
                tracing::error!(%key, "load panicked");
                Err(CacheError::InternalError)
            }
        };
        // the receiver might be gone if every waiter was dropped
        sender.send(settle(result)).ok();
    };

    let handle = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    let abort = handle.abort_handle();

    let inner = receiver
        .map(|result| result.unwrap_or(Err(CacheError::Aborted)))
        .boxed()
        .shared();

    (InFlight { inner }, abort)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(key: &str) -> LoadFrame {
        LoadFrame {
            cache: 0,
            key: key.into(),
        }
    }

    #[tokio::test]
    async fn test_settle_runs_before_waiters() {
        let settled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let (in_flight, _abort) = {
            let settled = settled.clone();
            let load = async { Ok::<_, CacheError>(21) };
            spawn_load("a".into(), frame("a"), load, move |result| {
                settled.store(true, std::sync::atomic::Ordering::SeqCst);
                result.map(|value: u32| value * 2)
            })
        };

        let (first, second) = futures::join!(in_flight.clone(), in_flight);
        assert!(settled.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(first, Ok(42));
        assert_eq!(second, Ok(42));
    }

    #[tokio::test]
    async fn test_abort_and_panic() {
        let (in_flight, abort) = spawn_load(
            "b".into(),
            frame("b"),
            futures::future::pending::<CacheContents<()>>(),
            |result| result,
        );
        abort.abort();
        assert_eq!(in_flight.await, Err(CacheError::Aborted));

        async fn explode() -> CacheContents<()> {
            panic!("boom")
        }
        let (in_flight, _abort) = spawn_load("c".into(), frame("c"), explode(), |result| result);
        assert_eq!(in_flight.await, Err(CacheError::InternalError));
    }
}
