use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while loading a value into one of the caches.
///
/// Errors are stored in the cache entry they belong to and handed out to every current and
/// future reader of that entry, which is why this type is [`Clone`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The requested value does not exist on the remote end.
    #[error("not found")]
    NotFound,
    /// The loader gave up waiting for the remote end.
    ///
    /// The engine itself never times out a load, this is produced by loaders.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// The loader failed for a reason reported by the remote end or its transport.
    ///
    /// The attached string contains the collaborator's error message.
    #[error("load failed: {0}")]
    LoadFailed(String),
    /// The value was fetched successfully, but could not be understood.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An interval loader returned values outside of the range it was asked for, or reported
    /// that it could not cover that range.
    ///
    /// The range in question is not considered loaded.
    #[error("partial coverage of [{begin}, {end}] in cache `{cache}`: {details}")]
    PartialCoverage {
        /// Name of the interval cache.
        cache: String,
        /// Requested lower bound, formatted.
        begin: String,
        /// Requested upper bound, formatted.
        end: String,
        /// What exactly went wrong.
        details: String,
    },
    /// A loader tried to read the entry it is currently computing, directly or through other
    /// caches. Waiting on it would never finish.
    #[error("cache `{cache}` was re-entered for key `{key}` while loading it")]
    Reentrant {
        /// Name of the re-entered cache.
        cache: String,
        /// The key being loaded.
        key: String,
    },
    /// The load was explicitly aborted before it settled.
    #[error("load aborted")]
    Aborted,
    /// An unexpected error inside the engine itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Wraps a failure reported by a loader's collaborator.
    pub fn load_failed(details: impl fmt::Display) -> Self {
        Self::LoadFailed(details.to_string())
    }

    /// Creates a [`PartialCoverage`](Self::PartialCoverage) error for the given range.
    pub fn partial_coverage<P: fmt::Debug>(
        cache: &str,
        begin: P,
        end: P,
        details: impl fmt::Display,
    ) -> Self {
        Self::PartialCoverage {
            cache: cache.to_owned(),
            begin: format!("{begin:?}"),
            end: format!("{end:?}"),
            details: details.to_string(),
        }
    }

    /// Logs an unexpected error and converts it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, stable name of the error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Timeout(_) => "timeout",
            Self::LoadFailed(_) => "loadfailed",
            Self::Malformed(_) => "malformed",
            Self::PartialCoverage { .. } => "partialcoverage",
            Self::Reentrant { .. } => "reentrant",
            Self::Aborted => "aborted",
            Self::InternalError => "internal",
        }
    }
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// The outcome of a load: either the loaded value, or the reason why it could not be loaded.
pub type CacheContents<T = ()> = Result<T, CacheError>;
