//! The point cache: one value per key.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::entry::{CacheEntry, InFlight, Pending, Status, spawn_load};
use crate::load_scope::{self, LoadFrame};
use crate::subscription::{Dispatcher, Listener, Subscribers, Subscription};
use crate::suspense::{ReadError, ReadResult, Suspend};
use crate::utils::lock;
use crate::{CacheConfig, CacheContents, CacheError, CacheKey, KeyParts};

/// Loads the values of a [`Cache`].
pub trait Loader: Send + Sync + 'static {
    /// The arguments a value is requested with.
    type Args: Send + 'static;
    /// The loaded value.
    ///
    /// Values are cloned out of the cache on every read, so this should be cheap to clone.
    type Value: Clone + Send + Sync + 'static;

    /// Derives the key identifying the value for `args`.
    ///
    /// Arguments that do not contribute to the identity of the value, like a client handle that
    /// is only needed to perform the load, must be left out.
    fn cache_key(&self, args: &Self::Args) -> CacheKey;

    /// Loads the value for `args`.
    ///
    /// This is called at most once per key until the entry is evicted, and the returned future is
    /// driven to completion even when nobody is waiting for it anymore.
    fn load(&self, args: Self::Args) -> BoxFuture<'static, CacheContents<Self::Value>>;
}

/// A [`Loader`] created from a closure, see [`loader_fn`].
pub struct FnLoader<A, V, F> {
    load: F,
    key: fn(&A) -> CacheKey,
    _value: PhantomData<fn(A) -> V>,
}

/// Creates a [`Loader`] from an async closure, keyed by the structure of its arguments.
pub fn loader_fn<A, V, F, Fut>(load: F) -> FnLoader<A, V, F>
where
    A: KeyParts + Send + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheContents<V>> + Send + 'static,
{
    loader_fn_with_key(CacheKey::from_parts::<A>, load)
}

/// Creates a [`Loader`] from an async closure with a custom key function.
pub fn loader_fn_with_key<A, V, F, Fut>(key: fn(&A) -> CacheKey, load: F) -> FnLoader<A, V, F>
where
    A: Send + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheContents<V>> + Send + 'static,
{
    FnLoader {
        load,
        key,
        _value: PhantomData,
    }
}

impl<A, V, F, Fut> Loader for FnLoader<A, V, F>
where
    A: Send + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheContents<V>> + Send + 'static,
{
    type Args = A;
    type Value = V;

    fn cache_key(&self, args: &A) -> CacheKey {
        (self.key)(args)
    }

    fn load(&self, args: A) -> BoxFuture<'static, CacheContents<V>> {
        (self.load)(args).boxed()
    }
}

/// A cache holding a single value per key, loaded on first access.
///
/// Concurrent requests for a key that is still loading share the same load. Once loaded, the
/// value (or error) is handed out to every subsequent request until the entry is evicted. There is
/// no automatic eviction.
///
/// This is a cheap handle, clones refer to the same cache.
pub struct Cache<L: Loader> {
    inner: Arc<CacheInner<L>>,
}

impl<L: Loader> Clone for Cache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Loader> fmt::Debug for Cache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

struct CacheInner<L: Loader> {
    id: usize,
    name: Arc<str>,
    config: CacheConfig,
    loader: Arc<L>,
    state: Mutex<CacheState<L::Value>>,
    dispatcher: Dispatcher<Status>,
}

struct CacheState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    subscribers: HashMap<CacheKey, Subscribers<Status>>,
    next_epoch: u64,
}

/// What a read found in the cache, after starting a load if necessary.
enum Lookup<V> {
    Resolved(V),
    Rejected(CacheError),
    Pending(InFlight<V>),
}

impl<L: Loader> Cache<L> {
    /// Creates a new cache.
    ///
    /// The `name` is used in logs and to tag metrics.
    pub fn new(name: impl Into<Arc<str>>, loader: L, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                id: load_scope::next_cache_id(),
                name: name.into(),
                config,
                loader: Arc::new(loader),
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    subscribers: HashMap::new(),
                    next_epoch: 0,
                }),
                dispatcher: Dispatcher::default(),
            }),
        }
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The loader of this cache.
    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    /// The configuration of this cache.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Reads the value for `args`, suspending if it is not loaded yet.
    ///
    /// This starts a load if nothing was requested for the key yet. While the load is running,
    /// [`ReadError::Suspended`] is returned. A stored error is returned as [`ReadError::Failed`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn read(&self, args: L::Args) -> ReadResult<L::Value> {
        let key = self.inner.loader.cache_key(&args);
        if load_scope::is_loading(self.inner.id, &key) {
            return Err(load_scope::reentrant(&self.inner.name, &key).into());
        }

        match self.lookup(key.clone(), args) {
            Lookup::Resolved(value) => Ok(value),
            Lookup::Rejected(error) => Err(ReadError::Failed(error)),
            Lookup::Pending(in_flight) => {
                let wakeup = in_flight.map(|_| ());
                Err(ReadError::Suspended(Suspend::new(
                    &self.inner.name,
                    key,
                    wakeup,
                )))
            }
        }
    }

    /// Reads the value for `args`, loading it if necessary.
    ///
    /// The load is started right away, not when the returned future is first polled. Dropping
    /// the future does not cancel the load.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn read_async(&self, args: L::Args) -> BoxFuture<'static, CacheContents<L::Value>> {
        let key = self.inner.loader.cache_key(&args);
        if load_scope::is_loading(self.inner.id, &key) {
            let error = load_scope::reentrant(&self.inner.name, &key);
            return future::ready(Err(error)).boxed();
        }

        match self.lookup(key, args) {
            Lookup::Resolved(value) => future::ready(Ok(value)).boxed(),
            Lookup::Rejected(error) => future::ready(Err(error)).boxed(),
            Lookup::Pending(in_flight) => in_flight.boxed(),
        }
    }

    /// Returns the value for `args` if it has been loaded, without starting a load.
    pub fn get_value_if_cached(&self, args: &L::Args) -> Option<L::Value> {
        let key = self.inner.loader.cache_key(args);
        match lock(&self.inner.state).entries.get(&key) {
            Some(CacheEntry::Resolved(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the status of the entry for `args`.
    pub fn status(&self, args: &L::Args) -> Status {
        let key = self.inner.loader.cache_key(args);
        lock(&self.inner.state)
            .entries
            .get(&key)
            .map_or(Status::NotRequested, CacheEntry::status)
    }

    /// Stores `value` for `args` without going through the loader.
    ///
    /// A load that is still running for the key is superseded, its outcome is discarded. In an
    /// immutable cache a value that is already loaded is never replaced, in which case this
    /// returns `false`.
    pub fn cache_value(&self, value: L::Value, args: &L::Args) -> bool {
        let key = self.inner.loader.cache_key(args);
        let mut state = lock(&self.inner.state);

        if self.inner.config.immutable
            && matches!(state.entries.get(&key), Some(CacheEntry::Resolved(_)))
        {
            tracing::debug!(cache = %self.inner.name, %key, "not replacing immutable value");
            return false;
        }

        tracing::trace!(cache = %self.inner.name, %key, "seeding value");
        state.entries.insert(key.clone(), CacheEntry::Resolved(value));
        self.notify(&state, &key, Status::Resolved);
        drop(state);
        self.inner.dispatcher.drain();
        true
    }

    /// Removes the entry for `args`, so that the next read loads it again.
    ///
    /// A load that is still running is not cancelled, but its outcome is discarded. Loaded values
    /// of an immutable cache are never evicted, errors are.
    pub fn evict(&self, args: &L::Args) -> bool {
        let key = self.inner.loader.cache_key(args);
        let mut state = lock(&self.inner.state);

        let evictable = match state.entries.get(&key) {
            None => false,
            Some(entry) => self.is_evictable(entry),
        };
        if evictable {
            state.entries.remove(&key);
            metric!(counter("caches.evict") += 1, "cache" => &self.inner.name);
            self.notify(&state, &key, Status::NotRequested);
        }
        drop(state);
        self.inner.dispatcher.drain();
        evictable
    }

    /// Removes all evictable entries, returning how many were removed.
    pub fn evict_all(&self) -> usize {
        let mut state = lock(&self.inner.state);

        let mut evicted = vec![];
        state.entries.retain(|key, entry| {
            let evict = self.is_evictable(entry);
            if evict {
                evicted.push(key.clone());
            }
            !evict
        });
        for key in &evicted {
            self.notify(&state, key, Status::NotRequested);
        }
        drop(state);
        self.inner.dispatcher.drain();

        metric!(counter("caches.evict") += evicted.len() as i64, "cache" => &self.inner.name);
        tracing::debug!(cache = %self.inner.name, evicted = evicted.len(), "evicted all entries");
        evicted.len()
    }

    /// Cancels a running load for `args`.
    ///
    /// Everybody waiting on it receives [`CacheError::Aborted`] and the entry is removed. Returns
    /// `false` if no load was running.
    pub fn abort(&self, args: &L::Args) -> bool {
        let key = self.inner.loader.cache_key(args);
        let mut state = lock(&self.inner.state);

        let Some(CacheEntry::Pending(_)) = state.entries.get(&key) else {
            return false;
        };
        if let Some(CacheEntry::Pending(pending)) = state.entries.remove(&key) {
            pending.abort.abort();
        }
        metric!(counter("caches.abort") += 1, "cache" => &self.inner.name);
        tracing::debug!(cache = %self.inner.name, %key, "aborted load");

        self.notify(&state, &key, Status::NotRequested);
        drop(state);
        self.inner.dispatcher.drain();
        true
    }

    /// Calls `listener` with the status of the entry for `args`, and again whenever it changes.
    ///
    /// The listener is called with the current status right away. It is removed when the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe_to_status<F>(&self, args: &L::Args, listener: F) -> Subscription
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        let key = self.inner.loader.cache_key(args);
        let listener: Listener<Status> = Arc::new(move |status: &Status| listener(*status));

        let mut state = lock(&self.inner.state);
        let status = state
            .entries
            .get(&key)
            .map_or(Status::NotRequested, CacheEntry::status);
        let id = state
            .subscribers
            .entry(key.clone())
            .or_default()
            .insert(Arc::clone(&listener));
        self.inner.dispatcher.enqueue(&listener, status);
        drop(state);
        self.inner.dispatcher.drain();

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = lock(&inner.state);
            if let Some(subscribers) = state.subscribers.get_mut(&key) {
                subscribers.remove(id);
                if subscribers.is_empty() {
                    state.subscribers.remove(&key);
                }
            }
        })
    }

    fn is_evictable(&self, entry: &CacheEntry<L::Value>) -> bool {
        !(self.inner.config.immutable && matches!(entry, CacheEntry::Resolved(_)))
    }

    /// Queues a status notification for the subscribers of `key`.
    fn notify(&self, state: &CacheState<L::Value>, key: &CacheKey, status: Status) {
        if let Some(subscribers) = state.subscribers.get(key) {
            self.inner.dispatcher.enqueue_all(subscribers, &status);
        }
    }

    /// Looks up the entry for `key`, starting a load for it if there is none.
    fn lookup(&self, key: CacheKey, args: L::Args) -> Lookup<L::Value> {
        let name = &self.inner.name;
        let mut state = lock(&self.inner.state);
        metric!(counter("caches.access") += 1, "cache" => name);

        match state.entries.get(&key) {
            Some(CacheEntry::Resolved(value)) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                return Lookup::Resolved(value.clone());
            }
            Some(CacheEntry::Rejected(error)) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                return Lookup::Rejected(error.clone());
            }
            Some(CacheEntry::Pending(pending)) => {
                return Lookup::Pending(pending.in_flight.clone());
            }
            None => {}
        }

        let epoch = state.next_epoch;
        state.next_epoch += 1;

        tracing::trace!(cache = %name, %key, epoch, "starting load");
        metric!(counter("caches.computation") += 1, "cache" => name);

        let loader = Arc::clone(&self.inner.loader);
        let load = async move { loader.load(args).await };

        let settle = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            move |result: CacheContents<L::Value>| {
                settle(&inner, &key, epoch, &result);
                result
            }
        };

        let frame = LoadFrame {
            cache: self.inner.id,
            key: key.clone(),
        };
        let (in_flight, abort) = spawn_load(Arc::clone(name), frame, load, settle);

        state.entries.insert(
            key.clone(),
            CacheEntry::Pending(Pending {
                epoch,
                in_flight: in_flight.clone(),
                abort,
            }),
        );
        self.notify(&state, &key, Status::Pending);
        drop(state);
        self.inner.dispatcher.drain();

        Lookup::Pending(in_flight)
    }
}

/// Stores the outcome of the load of `epoch` in the cache, unless it has been superseded.
fn settle<L: Loader>(
    inner: &Weak<CacheInner<L>>,
    key: &CacheKey,
    epoch: u64,
    result: &CacheContents<L::Value>,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = lock(&inner.state);

    match state.entries.get(key) {
        Some(CacheEntry::Pending(pending)) if pending.epoch == epoch => {}
        _ => {
            tracing::debug!(cache = %inner.name, %key, epoch, "discarding stale load");
            return;
        }
    }

    let (entry, status) = match result {
        Ok(value) => (CacheEntry::Resolved(value.clone()), Status::Resolved),
        Err(error) => {
            tracing::trace!(cache = %inner.name, %key, %error, "load failed");
            metric!(
                counter("caches.computation.error") += 1,
                "cache" => &inner.name,
                "reason" => error.metrics_tag(),
            );
            (CacheEntry::Rejected(error.clone()), Status::Rejected)
        }
    };
    state.entries.insert(key.clone(), entry);

    if let Some(subscribers) = state.subscribers.get(key) {
        inner.dispatcher.enqueue_all(subscribers, &status);
    }
    drop(state);
    inner.dispatcher.drain();
}
