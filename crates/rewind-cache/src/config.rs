use serde::Deserialize;

/// Retention policy of a single cache instance.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Values never change once loaded for a key.
    ///
    /// Resolved entries of an immutable cache are never evicted, replaced or loaded again. Only
    /// use this for caches keyed by something that denotes a frozen snapshot of program state,
    /// like a pause point.
    pub immutable: bool,
}

impl CacheConfig {
    /// The configuration of an immutable cache.
    pub fn immutable() -> Self {
        Self { immutable: true }
    }
}
