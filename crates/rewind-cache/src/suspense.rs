//! Adapters for synchronous, render-style reads.
//!
//! The synchronous `read` methods of the caches never block. When a value is not available yet
//! they start loading it and return [`ReadError::Suspended`], carrying a [`Suspend`] future that
//! resolves once the awaited load has settled. A cooperative scheduler awaits that future and then
//! runs the suspended computation again, which by then finds the value in the cache.
//!
//! [`resolve`] is such a scheduler for a single computation:
//!
//! ```
//! use rewind_cache::{Cache, CacheConfig, loader_fn, resolve};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let doubled = Cache::new(
//!     "doubled",
//!     loader_fn(|id: u32| async move { Ok(id * 2) }),
//!     CacheConfig::default(),
//! );
//!
//! let sum = resolve(|| Ok(doubled.read(1)? + doubled.read(2)?)).await;
//! assert_eq!(sum, Ok(6));
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;

use crate::{CacheContents, CacheError, CacheKey};

/// A suspend signal: the value is not available yet.
///
/// This is a future that resolves once the load it refers to has made progress. It does not
/// resolve to the value itself, the suspended computation has to read it again afterwards.
#[derive(Clone)]
pub struct Suspend {
    cache: Arc<str>,
    key: CacheKey,
    wakeup: Shared<BoxFuture<'static, ()>>,
}

impl Suspend {
    pub(crate) fn new<F>(cache: &Arc<str>, key: CacheKey, wakeup: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            cache: Arc::clone(cache),
            key,
            wakeup: wakeup.boxed().shared(),
        }
    }

    /// The name of the cache that is being waited on.
    pub fn cache(&self) -> &str {
        &self.cache
    }

    /// The key that is being waited on.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.wakeup.poll_unpin(cx)
    }
}

impl fmt::Debug for Suspend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspend")
            .field("cache", &self.cache)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Suspend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiting for `{}` in cache `{}`", self.key, self.cache)
    }
}

/// The error of a synchronous read.
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// The value is being loaded, await the [`Suspend`] and read again.
    #[error("suspended: {0}")]
    Suspended(Suspend),
    /// The value could not be loaded.
    #[error(transparent)]
    Failed(#[from] CacheError),
}

impl ReadError {
    /// Returns the suspend signal, if this is one.
    pub fn as_suspend(&self) -> Option<&Suspend> {
        match self {
            Self::Suspended(suspend) => Some(suspend),
            Self::Failed(_) => None,
        }
    }
}

/// The result of a synchronous read.
pub type ReadResult<T> = Result<T, ReadError>;

/// Runs a synchronous computation until it no longer suspends.
///
/// `render` is called again every time the [`Suspend`] it returned resolves. It should be free of
/// side effects other than reading caches, as it runs once per suspension.
pub async fn resolve<T, F>(mut render: F) -> CacheContents<T>
where
    F: FnMut() -> ReadResult<T>,
{
    loop {
        match render() {
            Ok(value) => return Ok(value),
            Err(ReadError::Failed(error)) => return Err(error),
            Err(ReadError::Suspended(suspend)) => {
                tracing::trace!(%suspend, "render suspended");
                suspend.await;
            }
        }
    }
}
