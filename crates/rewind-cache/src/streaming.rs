//! The streaming cache: values that arrive incrementally.
//!
//! A streaming load does not return its value. It is handed a [`StreamSink`] instead, and pushes
//! partial values and metadata into it as they arrive. Every push produces a new
//! [`StreamSnapshot`], which is delivered to all subscribers of the stream. A subscriber that joins
//! late is replayed the latest snapshot first, so no update is ever missed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::entry::{Status, spawn_load};
use crate::load_scope::{self, LoadFrame};
use crate::subscription::{Dispatcher, Listener, Subscribers, Subscription};
use crate::suspense::{ReadError, ReadResult, Suspend};
use crate::utils::lock;
use crate::{CacheContents, CacheError, CacheKey};

/// Loads the streams of a [`StreamingCache`].
pub trait StreamingLoader: Send + Sync + 'static {
    /// The arguments a stream is requested with.
    type Args: Send + 'static;
    /// The partial values accumulated by the stream.
    type Value: Clone + Send + Sync + 'static;
    /// Metadata describing the stream as a whole, like a total count.
    type Data: Clone + Send + Sync + 'static;

    /// Derives the key identifying the stream for `args`.
    fn cache_key(&self, args: &Self::Args) -> CacheKey;

    /// Loads the stream for `args`, pushing everything that arrives into `sink`.
    ///
    /// The stream completes when the returned future resolves successfully. When it fails, the
    /// stream fails as a whole, but keeps what was accumulated so far.
    fn load(
        &self,
        args: Self::Args,
        sink: StreamSink<Self::Value, Self::Data>,
    ) -> BoxFuture<'static, CacheContents<()>>;
}

/// The state of a stream at one point in time.
#[derive(Debug)]
pub struct StreamSnapshot<V, D> {
    /// Incremented on every update, starting at `0` before anything arrived.
    pub version: u64,
    /// All values accumulated so far, in the order they arrived.
    pub values: Arc<Vec<V>>,
    /// The latest metadata.
    pub data: Option<D>,
    /// The latest progress reported by the loader, between `0.0` and `1.0`.
    pub progress: Option<f64>,
    /// Whether the stream has finished, successfully or not.
    pub complete: bool,
    /// The reason the stream failed.
    pub error: Option<CacheError>,
}

impl<V, D: Clone> Clone for StreamSnapshot<V, D> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            values: Arc::clone(&self.values),
            data: self.data.clone(),
            progress: self.progress,
            complete: self.complete,
            error: self.error.clone(),
        }
    }
}

impl<V, D> StreamSnapshot<V, D> {
    fn empty() -> Self {
        Self {
            version: 0,
            values: Arc::new(Vec::new()),
            data: None,
            progress: None,
            complete: false,
            error: None,
        }
    }

    /// The status of the stream: pending until complete, then resolved or rejected.
    pub fn status(&self) -> Status {
        match (self.complete, &self.error) {
            (false, _) => Status::Pending,
            (true, None) => Status::Resolved,
            (true, Some(_)) => Status::Rejected,
        }
    }
}

/// How much of a stream a read waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    /// Return as soon as anything has arrived.
    FirstUpdate,
    /// Wait for the stream to complete.
    Complete,
}

impl<V: Clone, D: Clone> StreamSnapshot<V, D> {
    /// Returns the outcome of a read waiting for `availability`, or `None` if it has to wait.
    fn check(&self, availability: Availability) -> Option<CacheContents<Self>> {
        if let Some(error) = &self.error {
            return Some(Err(error.clone()));
        }
        let ready = match availability {
            Availability::FirstUpdate => self.version > 0,
            Availability::Complete => self.complete,
        };
        ready.then(|| Ok(self.clone()))
    }
}

struct StreamShared<V, D> {
    cache: Arc<str>,
    key: CacheKey,
    state: Mutex<StreamState<V, D>>,
    dispatcher: Dispatcher<StreamSnapshot<V, D>>,
    updates: watch::Sender<u64>,
    abort: Mutex<Option<AbortHandle>>,
}

struct StreamState<V, D> {
    snapshot: StreamSnapshot<V, D>,
    subscribers: Subscribers<StreamSnapshot<V, D>>,
}

impl<V: Clone, D: Clone> StreamShared<V, D> {
    fn new(cache: Arc<str>, key: CacheKey) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            cache,
            key,
            state: Mutex::new(StreamState {
                snapshot: StreamSnapshot::empty(),
                subscribers: Subscribers::default(),
            }),
            dispatcher: Dispatcher::default(),
            updates,
            abort: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> StreamSnapshot<V, D> {
        lock(&self.state).snapshot.clone()
    }

    /// Applies an update and notifies everyone. Updates of a completed stream are ignored.
    fn update<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut StreamSnapshot<V, D>),
    {
        let mut state = lock(&self.state);
        if state.snapshot.complete {
            tracing::debug!(cache = %self.cache, key = %self.key, "ignoring update of completed stream");
            return false;
        }

        apply(&mut state.snapshot);
        state.snapshot.version += 1;
        let version = state.snapshot.version;
        self.dispatcher.enqueue_all(&state.subscribers, &state.snapshot);
        self.updates.send_replace(version);
        drop(state);

        metric!(counter("caches.stream.update") += 1, "cache" => &self.cache);
        self.dispatcher.drain();
        true
    }

    fn finish(&self, result: &CacheContents<()>) {
        let completed = self.update(|snapshot| {
            snapshot.complete = true;
            match result {
                Ok(()) => snapshot.progress = Some(1.0),
                Err(error) => snapshot.error = Some(error.clone()),
            }
        });
        if !completed {
            return;
        }
        match result {
            Ok(()) => tracing::trace!(cache = %self.cache, key = %self.key, "stream complete"),
            Err(error) => {
                tracing::trace!(cache = %self.cache, key = %self.key, %error, "stream failed");
                metric!(
                    counter("caches.computation.error") += 1,
                    "cache" => &self.cache,
                    "reason" => error.metrics_tag(),
                );
            }
        }
    }
}

/// Receives the data of a streaming load.
///
/// Everything pushed after the stream completed is ignored.
pub struct StreamSink<V, D> {
    shared: Arc<StreamShared<V, D>>,
}

impl<V, D> Clone for StreamSink<V, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V, D> fmt::Debug for StreamSink<V, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("cache", &self.shared.cache)
            .field("key", &self.shared.key)
            .finish_non_exhaustive()
    }
}

impl<V: Clone, D: Clone> StreamSink<V, D> {
    /// Appends partial values to the stream.
    pub fn append(&self, values: impl IntoIterator<Item = V>) {
        self.shared
            .update(|snapshot| Arc::make_mut(&mut snapshot.values).extend(values));
    }

    /// Replaces the metadata of the stream.
    pub fn set_data(&self, data: D) {
        self.shared.update(|snapshot| snapshot.data = Some(data));
    }

    /// Reports the progress of the load, clamped to `0.0..=1.0`.
    pub fn set_progress(&self, progress: f64) {
        self.shared
            .update(|snapshot| snapshot.progress = Some(progress.clamp(0.0, 1.0)));
    }

    /// Whether the stream has completed, in which case nothing more will be accepted.
    pub fn is_complete(&self) -> bool {
        lock(&self.shared.state).snapshot.complete
    }
}

/// A handle to a stream in a [`StreamingCache`].
pub struct StreamingValue<V, D> {
    shared: Arc<StreamShared<V, D>>,
}

impl<V, D> Clone for StreamingValue<V, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V, D> fmt::Debug for StreamingValue<V, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingValue")
            .field("cache", &self.shared.cache)
            .field("key", &self.shared.key)
            .finish_non_exhaustive()
    }
}

impl<V, D> StreamingValue<V, D>
where
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Creates a stream that is fed through the returned sink.
    fn new(cache: Arc<str>, key: CacheKey) -> (Self, StreamSink<V, D>) {
        let shared = Arc::new(StreamShared::new(cache, key));
        let sink = StreamSink {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, sink)
    }

    pub fn status(&self) -> Status {
        lock(&self.shared.state).snapshot.status()
    }

    /// All values accumulated so far.
    pub fn value(&self) -> Arc<Vec<V>> {
        Arc::clone(&lock(&self.shared.state).snapshot.values)
    }

    pub fn data(&self) -> Option<D> {
        lock(&self.shared.state).snapshot.data.clone()
    }

    pub fn progress(&self) -> Option<f64> {
        lock(&self.shared.state).snapshot.progress
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.shared.state).snapshot.complete
    }

    pub fn error(&self) -> Option<CacheError> {
        lock(&self.shared.state).snapshot.error.clone()
    }

    /// The current state of the stream.
    pub fn snapshot(&self) -> StreamSnapshot<V, D> {
        self.shared.snapshot()
    }

    /// Calls `listener` with a snapshot on every update of the stream.
    ///
    /// If anything has arrived already, the listener is called right away with the latest
    /// snapshot. It is removed when the returned [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StreamSnapshot<V, D>) + Send + Sync + 'static,
    {
        let listener: Listener<StreamSnapshot<V, D>> = Arc::new(listener);

        let mut state = lock(&self.shared.state);
        let id = state.subscribers.insert(Arc::clone(&listener));
        if state.snapshot.version > 0 {
            self.shared
                .dispatcher
                .enqueue(&listener, state.snapshot.clone());
        }
        drop(state);
        self.shared.dispatcher.drain();

        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || unsubscribe(&shared, id))
    }

    /// Returns a snapshot once `availability` is reached, suspending until then.
    ///
    /// A failed stream returns its error.
    pub fn read(&self, availability: Availability) -> ReadResult<StreamSnapshot<V, D>> {
        // subscribe before looking at the state, so no update can slip in between
        let mut updates = self.shared.updates.subscribe();
        match self.shared.snapshot().check(availability) {
            Some(result) => result.map_err(ReadError::from),
            None => {
                let wakeup = async move {
                    updates.changed().await.ok();
                };
                Err(ReadError::Suspended(Suspend::new(
                    &self.shared.cache,
                    self.shared.key.clone(),
                    wakeup,
                )))
            }
        }
    }

    /// Waits until `availability` is reached and returns the snapshot at that point.
    pub fn wait(
        &self,
        availability: Availability,
    ) -> BoxFuture<'static, CacheContents<StreamSnapshot<V, D>>> {
        let shared = Arc::clone(&self.shared);
        let mut updates = shared.updates.subscribe();
        async move {
            loop {
                if let Some(result) = shared.snapshot().check(availability) {
                    return result;
                }
                if updates.changed().await.is_err() {
                    return Err(CacheError::Aborted);
                }
            }
        }
        .boxed()
    }
}

fn unsubscribe<V, D>(shared: &Weak<StreamShared<V, D>>, id: u64) {
    if let Some(shared) = shared.upgrade() {
        lock(&shared.state).subscribers.remove(id);
    }
}

type Stream<L> = StreamingValue<<L as StreamingLoader>::Value, <L as StreamingLoader>::Data>;
type Snapshot<L> = StreamSnapshot<<L as StreamingLoader>::Value, <L as StreamingLoader>::Data>;

/// A cache of incrementally loaded streams.
///
/// Like the other caches, there is at most one load per key until it is evicted, and a stream is
/// loaded to completion even when nobody is subscribed to it anymore.
///
/// This is a cheap handle, clones refer to the same cache.
pub struct StreamingCache<L: StreamingLoader> {
    inner: Arc<StreamingInner<L>>,
}

impl<L: StreamingLoader> Clone for StreamingCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: StreamingLoader> fmt::Debug for StreamingCache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingCache")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

struct StreamingInner<L: StreamingLoader> {
    id: usize,
    name: Arc<str>,
    loader: Arc<L>,
    streams: Mutex<HashMap<CacheKey, Stream<L>>>,
}

impl<L: StreamingLoader> StreamingCache<L> {
    pub fn new(name: impl Into<Arc<str>>, loader: L) -> Self {
        Self {
            inner: Arc::new(StreamingInner {
                id: load_scope::next_cache_id(),
                name: name.into(),
                loader: Arc::new(loader),
                streams: Mutex::new(HashMap::new()),
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

    /// Returns the stream for `args`, starting to load it if necessary.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream(&self, args: L::Args) -> CacheContents<Stream<L>> {
        let key = self.inner.loader.cache_key(&args);
        if load_scope::is_loading(self.inner.id, &key) {
            return Err(load_scope::reentrant(&self.inner.name, &key));
        }

        let name = &self.inner.name;
        let mut streams = lock(&self.inner.streams);
        metric!(counter("caches.access") += 1, "cache" => name);
        if let Some(stream) = streams.get(&key) {
            metric!(counter("caches.memory.hit") += 1, "cache" => name);
            return Ok(stream.clone());
        }

        tracing::trace!(cache = %name, %key, "starting stream");
        metric!(counter("caches.computation") += 1, "cache" => name);

        let (stream, sink) = StreamingValue::new(Arc::clone(name), key.clone());

        let loader = Arc::clone(&self.inner.loader);
        let load = async move { loader.load(args, sink).await };
        let settle = {
            let shared = Arc::clone(&stream.shared);
            move |result: CacheContents<()>| {
                shared.finish(&result);
                result
            }
        };
        let frame = LoadFrame {
            cache: self.inner.id,
            key: key.clone(),
        };
        let (_in_flight, abort) = spawn_load(Arc::clone(name), frame, load, settle);
        *lock(&stream.shared.abort) = Some(abort);

        streams.insert(key, stream.clone());
        Ok(stream)
    }

    /// Reads the stream for `args`, suspending until `availability` is reached.
    pub fn read(&self, args: L::Args, availability: Availability) -> ReadResult<Snapshot<L>> {
        self.stream(args)?.read(availability)
    }

    /// Waits until the stream for `args` reaches `availability`.
    ///
    /// The stream starts loading right away, not when the returned future is first polled.
    pub fn read_async(
        &self,
        args: L::Args,
        availability: Availability,
    ) -> BoxFuture<'static, CacheContents<Snapshot<L>>> {
        match self.stream(args) {
            Ok(stream) => stream.wait(availability),
            Err(error) => future::ready(Err(error)).boxed(),
        }
    }

    /// Returns the stream for `args` if it has been requested before, without starting a load.
    pub fn get_if_cached(&self, args: &L::Args) -> Option<Stream<L>> {
        let key = self.inner.loader.cache_key(args);
        lock(&self.inner.streams).get(&key).cloned()
    }

    /// Removes the stream for `args`, so that the next request loads it again.
    ///
    /// A load that is still running is not cancelled, it keeps feeding the handles that were
    /// handed out before.
    pub fn evict(&self, args: &L::Args) -> bool {
        let key = self.inner.loader.cache_key(args);
        let evicted = lock(&self.inner.streams).remove(&key).is_some();
        if evicted {
            metric!(counter("caches.evict") += 1, "cache" => &self.inner.name);
        }
        evicted
    }

    /// Removes all streams, returning how many were removed.
    pub fn evict_all(&self) -> usize {
        let evicted = {
            let mut streams = lock(&self.inner.streams);
            let evicted = streams.len();
            streams.clear();
            evicted
        };
        metric!(counter("caches.evict") += evicted as i64, "cache" => &self.inner.name);
        evicted
    }

    /// Cancels the running load of the stream for `args`.
    ///
    /// The stream fails with [`CacheError::Aborted`] and is removed from the cache. Returns
    /// `false` if the stream is not loading.
    pub fn abort(&self, args: &L::Args) -> bool {
        let key = self.inner.loader.cache_key(args);
        let mut streams = lock(&self.inner.streams);

        let Some(stream) = streams.get(&key) else {
            return false;
        };
        if stream.is_complete() {
            return false;
        }
        let stream = streams.remove(&key);
        drop(streams);

        if let Some(stream) = stream {
            if let Some(abort) = lock(&stream.shared.abort).take() {
                abort.abort();
            }
            stream.shared.finish(&Err(CacheError::Aborted));
        }
        metric!(counter("caches.abort") += 1, "cache" => &self.inner.name);
        tracing::debug!(cache = %self.inner.name, %key, "aborted stream");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{resolve, test};

    enum Step {
        Values(Vec<u32>),
        Data(&'static str),
        Progress(f64),
        Fail(CacheError),
    }

    /// Streams whatever the test sends through its channel, completing when it is closed.
    #[derive(Default)]
    struct Scripted {
        scripts: Mutex<HashMap<u32, mpsc::UnboundedReceiver<Step>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn script(&self, id: u32) -> mpsc::UnboundedSender<Step> {
            let (sender, receiver) = mpsc::unbounded_channel();
            self.scripts.lock().unwrap().insert(id, receiver);
            sender
        }
    }

    impl StreamingLoader for Scripted {
        type Args = u32;
        type Value = u32;
        type Data = &'static str;

        fn cache_key(&self, id: &u32) -> CacheKey {
            CacheKey::from_parts(id)
        }

        fn load(
            &self,
            id: u32,
            sink: StreamSink<u32, &'static str>,
        ) -> BoxFuture<'static, CacheContents<()>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let script = self.scripts.lock().unwrap().remove(&id);
            async move {
                let mut script = script.ok_or(CacheError::NotFound)?;
                while let Some(step) = script.recv().await {
                    match step {
                        Step::Values(values) => sink.append(values),
                        Step::Data(data) => sink.set_data(data),
                        Step::Progress(progress) => sink.set_progress(progress),
                        Step::Fail(error) => return Err(error),
                    }
                }
                Ok(())
            }
            .boxed()
        }
    }

    type Seen = Arc<Mutex<Vec<(Vec<u32>, bool)>>>;

    fn recorder(
        seen: &Seen,
    ) -> impl Fn(&StreamSnapshot<u32, &'static str>) + Send + Sync + use<> {
        let seen = Arc::clone(seen);
        move |snapshot: &StreamSnapshot<u32, &'static str>| {
            seen.lock()
                .unwrap()
                .push((snapshot.values.to_vec(), snapshot.complete))
        }
    }

    async fn until_version(stream: &StreamingValue<u32, &'static str>, version: u64) {
        while stream.snapshot().version < version {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_late_subscribers_are_replayed() {
        test::setup();
        let cache = StreamingCache::new("scripted", Scripted::default());
        let script = cache.loader().script(1);

        let stream = cache.stream(1).unwrap();
        assert_eq!(stream.status(), Status::Pending);

        let early: Seen = Default::default();
        let _early = stream.subscribe(recorder(&early));

        for value in 1..=3 {
            script.send(Step::Values(vec![value])).ok();
        }
        until_version(&stream, 3).await;

        let late: Seen = Default::default();
        let _late = stream.subscribe(recorder(&late));
        assert_eq!(*late.lock().unwrap(), [(vec![1, 2, 3], false)]);

        script.send(Step::Values(vec![4, 5])).ok();
        drop(script);
        let snapshot = stream.wait(Availability::Complete).await.unwrap();
        assert_eq!(*snapshot.values, [1, 2, 3, 4, 5]);
        assert_eq!(snapshot.progress, Some(1.0));
        assert_eq!(stream.status(), Status::Resolved);

        assert_eq!(
            *late.lock().unwrap(),
            [
                (vec![1, 2, 3], false),
                (vec![1, 2, 3, 4, 5], false),
                (vec![1, 2, 3, 4, 5], true),
            ]
        );
        assert_eq!(
            *early.lock().unwrap(),
            [
                (vec![1], false),
                (vec![1, 2], false),
                (vec![1, 2, 3], false),
                (vec![1, 2, 3, 4, 5], false),
                (vec![1, 2, 3, 4, 5], true),
            ]
        );

        let after: Seen = Default::default();
        let _after = stream.subscribe(recorder(&after));
        assert_eq!(*after.lock().unwrap(), [(vec![1, 2, 3, 4, 5], true)]);
    }

    #[tokio::test]
    async fn test_read_until_first_update_or_completion() {
        test::setup();
        let cache = StreamingCache::new("scripted", Scripted::default());
        let script = cache.loader().script(7);

        let suspend = match cache.read(7, Availability::FirstUpdate) {
            Err(ReadError::Suspended(suspend)) => suspend,
            other => panic!("expected suspension, got {other:?}"),
        };
        script.send(Step::Data("7 messages")).ok();
        suspend.await;

        let snapshot = cache.read(7, Availability::FirstUpdate).unwrap();
        assert_eq!(snapshot.data, Some("7 messages"));
        assert!(!snapshot.complete);
        assert!(cache.read(7, Availability::Complete).is_err());

        script.send(Step::Progress(0.5)).ok();
        script.send(Step::Values(vec![1, 2])).ok();
        drop(script);

        let total = resolve(|| {
            let snapshot = cache.read(7, Availability::Complete)?;
            Ok(snapshot.values.len())
        })
        .await;
        assert_eq!(total, Ok(2));
        assert_eq!(cache.loader().calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_stream_keeps_values() {
        test::setup();
        let cache = StreamingCache::new("scripted", Scripted::default());
        let script = cache.loader().script(2);

        let stream = cache.stream(2).unwrap();
        let seen: Seen = Default::default();
        let _subscription = stream.subscribe(recorder(&seen));

        script.send(Step::Values(vec![1])).ok();
        script.send(Step::Fail(CacheError::Timeout(Duration::from_secs(5)))).ok();

        let error = cache
            .read_async(2, Availability::Complete)
            .await
            .unwrap_err();
        assert_eq!(error, CacheError::Timeout(Duration::from_secs(5)));
        assert_eq!(stream.status(), Status::Rejected);
        assert_eq!(*stream.value(), [1]);
        assert!(stream.is_complete());
        assert_eq!(*seen.lock().unwrap(), [(vec![1], false), (vec![1], true)]);

        // the failure is delivered to every later reader as well
        assert!(matches!(
            cache.read(2, Availability::FirstUpdate),
            Err(ReadError::Failed(CacheError::Timeout(_)))
        ));
        assert_eq!(cache.loader().calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_updates_after_completion_are_ignored() {
        test::setup();
        let (stream, sink) = StreamingValue::<u32, ()>::new("direct".into(), "k".into());

        sink.append([1, 2]);
        stream.shared.finish(&Ok(()));
        assert!(sink.is_complete());

        sink.append([3]);
        sink.set_data(());
        assert_eq!(*stream.value(), [1, 2]);
        assert_eq!(stream.data(), None);
        assert_eq!(stream.snapshot().version, 2);
    }

    #[tokio::test]
    async fn test_single_flight_and_eviction() {
        test::setup();
        let cache = StreamingCache::new("scripted", Scripted::default());
        drop(cache.loader().script(3));

        let first = cache.stream(3).unwrap();
        let second = cache.stream(3).unwrap();
        let (first, second) = futures::join!(
            first.wait(Availability::Complete),
            second.wait(Availability::Complete)
        );
        assert_eq!(first.unwrap().version, 1);
        assert_eq!(second.unwrap().version, 1);
        assert_eq!(cache.loader().calls.load(Ordering::Relaxed), 1);

        assert!(cache.get_if_cached(&3).is_some());
        assert!(cache.evict(&3));
        assert!(cache.get_if_cached(&3).is_none());

        // the script is gone, so the second load fails
        let result = cache.read_async(3, Availability::Complete).await;
        assert_eq!(result.unwrap_err(), CacheError::NotFound);
        assert_eq!(cache.loader().calls.load(Ordering::Relaxed), 2);
        assert_eq!(cache.evict_all(), 1);
    }

    #[tokio::test]
    async fn test_abort() {
        test::setup();
        let cache = StreamingCache::new("scripted", Scripted::default());
        let _script = cache.loader().script(4);

        let stream = cache.stream(4).unwrap();
        let waiting = stream.wait(Availability::Complete);
        assert!(cache.abort(&4));
        assert!(!cache.abort(&4));

        assert_eq!(waiting.await.unwrap_err(), CacheError::Aborted);
        assert_eq!(stream.status(), Status::Rejected);
        assert!(cache.get_if_cached(&4).is_none());
    }

    /// Streams its own id once it made sure it can't subscribe to itself.
    struct Echo(Arc<OnceLock<StreamingCache<Echo>>>);

    impl StreamingLoader for Echo {
        type Args = u32;
        type Value = u32;
        type Data = ();

        fn cache_key(&self, id: &u32) -> CacheKey {
            CacheKey::from_parts(id)
        }

        fn load(
            &self,
            id: u32,
            sink: StreamSink<u32, ()>,
        ) -> BoxFuture<'static, CacheContents<()>> {
            let cache = self.0.get().cloned();
            async move {
                let cache = cache.ok_or(CacheError::InternalError)?;
                let stream = cache.stream(id);
                let read = cache.read_async(id, Availability::FirstUpdate).await;
                match (stream, read) {
                    (Err(CacheError::Reentrant { .. }), Err(CacheError::Reentrant { .. })) => {
                        sink.append([id]);
                        Ok(())
                    }
                    _ => Err(CacheError::InternalError),
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_reentrant_stream_is_refused() {
        test::setup();
        let slot = Arc::new(OnceLock::new());
        let cache = StreamingCache::new("echo", Echo(Arc::clone(&slot)));
        slot.set(cache.clone()).unwrap();

        let snapshot = cache.read_async(5, Availability::Complete).await.unwrap();
        assert_eq!(*snapshot.values, [5]);
        assert_eq!(snapshot.status(), Status::Resolved);
    }
}
