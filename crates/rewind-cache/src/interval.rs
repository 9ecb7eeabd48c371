//! The interval cache: range queries over a scalar axis, loading only what is missing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::entry::{InFlight, spawn_load};
use crate::intervals::{IntervalSet, gaps};
use crate::load_scope::{self, LoadFrame};
use crate::suspense::{ReadError, ReadResult, Suspend};
use crate::utils::lock;
use crate::{CacheConfig, CacheContents, CacheError, CacheKey};

/// Loads the values of an [`IntervalCache`].
pub trait IntervalLoader: Send + Sync + 'static {
    /// Additional arguments of a query. Every distinct key of these has its own intervals.
    type Args: Clone + Send + Sync + 'static;
    /// A position on the axis, like a point in time.
    type Point: Ord + Copy + fmt::Debug + Send + Sync + 'static;
    /// The loaded value.
    type Value: Clone + Send + Sync + 'static;

    /// Derives the key identifying the intervals for `args`.
    fn cache_key(&self, args: &Self::Args) -> CacheKey;

    /// Projects a value onto the axis.
    fn point_for_value(&self, value: &Self::Value) -> Self::Point;

    /// Loads all values whose point lies within `[begin, end]`.
    ///
    /// Returning a value outside of these bounds is an error, the whole load is rejected with
    /// [`CacheError::PartialCoverage`] in that case.
    fn load(
        &self,
        begin: Self::Point,
        end: Self::Point,
        args: Self::Args,
    ) -> BoxFuture<'static, CacheContents<Vec<Self::Value>>>;
}

type Point<L> = <L as IntervalLoader>::Point;
type Value<L> = <L as IntervalLoader>::Value;

/// A cache answering range queries.
///
/// Loaded ranges are kept as a sorted list of coalesced intervals. A query only loads the gaps in
/// its range that are neither loaded nor being loaded, and returns once all of them have settled.
/// A failed gap load is remembered, and every query whose unloaded parts overlap it fails with the
/// same error until the cache is evicted.
///
/// This is a cheap handle, clones refer to the same cache.
pub struct IntervalCache<L: IntervalLoader> {
    inner: Arc<IntervalInner<L>>,
}

impl<L: IntervalLoader> Clone for IntervalCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: IntervalLoader> fmt::Debug for IntervalCache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalCache")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

struct IntervalInner<L: IntervalLoader> {
    id: usize,
    name: Arc<str>,
    config: CacheConfig,
    loader: Arc<L>,
    state: Mutex<IntervalState<Point<L>, Value<L>>>,
}

struct IntervalState<P, V> {
    ranges: HashMap<CacheKey, RangeState<P, V>>,
    next_epoch: u64,
    next_load: u64,
}

/// Everything known about the intervals of one key.
struct RangeState<P, V> {
    epoch: u64,
    loaded: IntervalSet<P, V>,
    pending: Vec<PendingRange<P>>,
    failed: Vec<FailedRange<P>>,
}

struct PendingRange<P> {
    id: u64,
    begin: P,
    end: P,
    in_flight: InFlight<()>,
}

struct FailedRange<P> {
    begin: P,
    end: P,
    error: CacheError,
}

/// What needs to happen to answer a query.
enum Plan<V> {
    Ready(Vec<V>),
    Failed(CacheError),
    Wait(Vec<InFlight<()>>),
}

impl<L: IntervalLoader> IntervalCache<L> {
    /// Creates a new interval cache.
    pub fn new(name: impl Into<Arc<str>>, loader: L, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(IntervalInner {
                id: load_scope::next_cache_id(),
                name: name.into(),
                config,
                loader: Arc::new(loader),
                state: Mutex::new(IntervalState {
                    ranges: HashMap::new(),
                    next_epoch: 0,
                    next_load: 0,
                }),
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

    /// Reads all values in `[begin, end]`, suspending until the whole range is loaded.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn read(
        &self,
        begin: Point<L>,
        end: Point<L>,
        args: L::Args,
    ) -> ReadResult<Vec<Value<L>>> {
        let key = self.inner.loader.cache_key(&args);
        if load_scope::is_loading(self.inner.id, &key) {
            return Err(load_scope::reentrant(&self.inner.name, &key).into());
        }
        metric!(counter("caches.access") += 1, "cache" => &self.inner.name);

        match self.plan(begin, end, &key, &args) {
            Plan::Ready(values) => Ok(values),
            Plan::Failed(error) => Err(ReadError::Failed(error)),
            Plan::Wait(in_flight) => {
                let wakeup = future::join_all(in_flight).map(|_| ());
                Err(ReadError::Suspended(Suspend::new(
                    &self.inner.name,
                    key,
                    wakeup,
                )))
            }
        }
    }

    /// Reads all values in `[begin, end]`, loading the parts of the range that are missing.
    ///
    /// The missing parts start loading right away, not when the returned future is first polled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn read_async(
        &self,
        begin: Point<L>,
        end: Point<L>,
        args: L::Args,
    ) -> BoxFuture<'static, CacheContents<Vec<Value<L>>>> {
        let key = self.inner.loader.cache_key(&args);
        if load_scope::is_loading(self.inner.id, &key) {
            let error = load_scope::reentrant(&self.inner.name, &key);
            return future::ready(Err(error)).boxed();
        }
        metric!(counter("caches.access") += 1, "cache" => &self.inner.name);

        let mut plan = self.plan(begin, end, &key, &args);
        let this = self.clone();
        async move {
            loop {
                match plan {
                    Plan::Ready(values) => return Ok(values),
                    Plan::Failed(error) => return Err(error),
                    Plan::Wait(in_flight) => {
                        for result in future::join_all(in_flight).await {
                            // an aborted load never settles its range
                            if let Err(CacheError::Aborted) = result {
                                return Err(CacheError::Aborted);
                            }
                        }
                        plan = this.plan(begin, end, &key, &args);
                    }
                }
            }
        }
        .boxed()
    }

    /// Returns the values in `[begin, end]` if the whole range is loaded, without loading
    /// anything.
    pub fn get_values_if_cached(
        &self,
        begin: Point<L>,
        end: Point<L>,
        args: &L::Args,
    ) -> Option<Vec<Value<L>>> {
        if begin > end {
            return Some(vec![]);
        }
        let key = self.inner.loader.cache_key(args);
        let state = lock(&self.inner.state);
        let range = state.ranges.get(&key)?;

        if !range.loaded.covers(begin, end) {
            return None;
        }
        Some(
            range
                .loaded
                .values_in(begin, end, |value| self.inner.loader.point_for_value(value)),
        )
    }

    /// Returns the bounds of the coalesced intervals loaded for `args`.
    pub fn loaded_ranges(&self, args: &L::Args) -> Vec<(Point<L>, Point<L>)> {
        let key = self.inner.loader.cache_key(args);
        let state = lock(&self.inner.state);
        state
            .ranges
            .get(&key)
            .map(|range| {
                range
                    .loaded
                    .intervals()
                    .iter()
                    .map(|interval| (interval.begin, interval.end))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forgets everything loaded for `args`.
    ///
    /// Loads that are still running are not cancelled, but their outcome is discarded. An
    /// immutable cache only forgets failed ranges, so that they are loaded again.
    pub fn evict(&self, args: &L::Args) -> bool {
        let key = self.inner.loader.cache_key(args);
        let mut state = lock(&self.inner.state);
        let evicted = self.evict_key(&mut state, &key);
        if evicted {
            metric!(counter("caches.evict") += 1, "cache" => &self.inner.name);
        }
        evicted
    }

    /// Evicts the intervals of every key, returning how many keys were affected.
    pub fn evict_all(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let keys: Vec<_> = state.ranges.keys().cloned().collect();
        let evicted = keys
            .iter()
            .filter(|key| self.evict_key(&mut state, key))
            .count();
        drop(state);

        metric!(counter("caches.evict") += evicted as i64, "cache" => &self.inner.name);
        tracing::debug!(cache = %self.inner.name, evicted, "evicted all intervals");
        evicted
    }

    fn evict_key(
        &self,
        state: &mut IntervalState<Point<L>, Value<L>>,
        key: &CacheKey,
    ) -> bool {
        if self.inner.config.immutable {
            let Some(range) = state.ranges.get_mut(key) else {
                return false;
            };
            let had_failures = !range.failed.is_empty();
            range.failed.clear();
            had_failures
        } else {
            state.ranges.remove(key).is_some()
        }
    }

    /// Decides how to answer a query for `[begin, end]`, starting loads for all missing gaps.
    fn plan(
        &self,
        begin: Point<L>,
        end: Point<L>,
        key: &CacheKey,
        args: &L::Args,
    ) -> Plan<Value<L>> {
        if begin > end {
            return Plan::Ready(vec![]);
        }

        let mut state = lock(&self.inner.state);
        let IntervalState {
            ranges,
            next_epoch,
            next_load,
        } = &mut *state;

        let range = ranges.entry(key.clone()).or_insert_with(|| {
            let epoch = *next_epoch;
            *next_epoch += 1;
            RangeState {
                epoch,
                loaded: IntervalSet::new(),
                pending: vec![],
                failed: vec![],
            }
        });

        if range.loaded.covers(begin, end) {
            return Plan::Ready(
                range
                    .loaded
                    .values_in(begin, end, |value| self.inner.loader.point_for_value(value)),
            );
        }
        if let Some(failed) = range.failed_in_gaps(begin, end) {
            return Plan::Failed(failed.error.clone());
        }

        let mut covered: Vec<_> = range
            .loaded
            .intervals()
            .iter()
            .map(|interval| (interval.begin, interval.end))
            .chain(range.pending.iter().map(|pending| (pending.begin, pending.end)))
            .collect();
        covered.sort_unstable_by_key(|(begin, _)| *begin);

        let missing = gaps(covered, begin, end);
        if !missing.is_empty() {
            metric!(
                histogram("caches.interval.gaps") = missing.len() as u64,
                "cache" => &self.inner.name,
            );
        }
        for (gap_begin, gap_end) in missing {
            let id = *next_load;
            *next_load += 1;
            let in_flight = self.spawn_gap_load(key, range.epoch, id, gap_begin, gap_end, args);
            range.pending.push(PendingRange {
                id,
                begin: gap_begin,
                end: gap_end,
                in_flight,
            });
        }

        let waiting: Vec<_> = range
            .pending
            .iter()
            .filter(|pending| pending.begin <= end && begin <= pending.end)
            .map(|pending| pending.in_flight.clone())
            .collect();

        if waiting.is_empty() {
            Plan::Ready(
                range
                    .loaded
                    .values_in(begin, end, |value| self.inner.loader.point_for_value(value)),
            )
        } else {
            Plan::Wait(waiting)
        }
    }

    fn spawn_gap_load(
        &self,
        key: &CacheKey,
        epoch: u64,
        id: u64,
        begin: Point<L>,
        end: Point<L>,
        args: &L::Args,
    ) -> InFlight<()> {
        tracing::trace!(cache = %self.inner.name, %key, ?begin, ?end, "loading gap");
        metric!(counter("caches.computation") += 1, "cache" => &self.inner.name);

        let loader = Arc::clone(&self.inner.loader);
        let args = args.clone();
        let load = async move { loader.load(begin, end, args).await };

        let settle = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            move |result| settle(&inner, &key, epoch, id, begin, end, result)
        };

        let frame = LoadFrame {
            cache: self.inner.id,
            key: key.clone(),
        };
        let (in_flight, _abort) = spawn_load(Arc::clone(&self.inner.name), frame, load, settle);
        in_flight
    }
}

impl<P: Ord + Copy, V> RangeState<P, V> {
    /// Finds a failed range overlapping the parts of `[begin, end]` that are not loaded.
    ///
    /// Failed gaps share their bounds with the loaded neighbors, so only the unloaded parts of a
    /// query can fail.
    fn failed_in_gaps(&self, begin: P, end: P) -> Option<&FailedRange<P>> {
        let loaded = self
            .loaded
            .intervals()
            .iter()
            .map(|interval| (interval.begin, interval.end));
        let missing = gaps(loaded, begin, end);
        self.failed.iter().find(|failed| {
            missing
                .iter()
                .any(|&(gap_begin, gap_end)| failed.begin <= gap_end && gap_begin <= failed.end)
        })
    }
}

/// Merges the outcome of the gap load `id` into the intervals, unless they have been evicted.
fn settle<L: IntervalLoader>(
    inner: &Weak<IntervalInner<L>>,
    key: &CacheKey,
    epoch: u64,
    id: u64,
    begin: Point<L>,
    end: Point<L>,
    result: CacheContents<Vec<Value<L>>>,
) -> CacheContents<()> {
    let Some(inner) = inner.upgrade() else {
        return result.map(|_| ());
    };
    let result = result.and_then(|values| inner.check_coverage(begin, end, values));

    let mut state = lock(&inner.state);
    let Some(range) = state
        .ranges
        .get_mut(key)
        .filter(|range| range.epoch == epoch)
    else {
        tracing::debug!(cache = %inner.name, %key, ?begin, ?end, "discarding stale gap load");
        return result.map(|_| ());
    };
    range.pending.retain(|pending| pending.id != id);

    match result {
        Ok(values) => {
            range.loaded.insert(begin, end, values, |value| {
                inner.loader.point_for_value(value)
            });
            metric!(
                gauge("caches.interval.ranges") = range.loaded.intervals().len() as u64,
                "cache" => &inner.name,
            );
            Ok(())
        }
        Err(error) => {
            tracing::trace!(cache = %inner.name, %key, ?begin, ?end, %error, "gap load failed");
            if let CacheError::PartialCoverage { .. } = error {
                metric!(counter("caches.interval.partial_coverage") += 1, "cache" => &inner.name);
            }
            metric!(
                counter("caches.computation.error") += 1,
                "cache" => &inner.name,
                "reason" => error.metrics_tag(),
            );
            range.failed.push(FailedRange {
                begin,
                end,
                error: error.clone(),
            });
            Err(error)
        }
    }
}

impl<L: IntervalLoader> IntervalInner<L> {
    /// Rejects loads that returned values outside of the requested bounds.
    fn check_coverage(
        &self,
        begin: Point<L>,
        end: Point<L>,
        values: Vec<Value<L>>,
    ) -> CacheContents<Vec<Value<L>>> {
        let outside = values
            .iter()
            .map(|value| self.loader.point_for_value(value))
            .find(|point| *point < begin || *point > end);

        match outside {
            None => Ok(values),
            Some(point) => {
                tracing::error!(
                    cache = %self.name,
                    ?begin,
                    ?end,
                    ?point,
                    "interval loader returned a value outside of the requested range"
                );
                Err(CacheError::partial_coverage(
                    &self.name,
                    begin,
                    end,
                    format_args!("value at {point:?} is out of bounds"),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::resolve;
    use crate::test;

    /// Loads all multiples of `step` in a range.
    #[derive(Default)]
    struct Multiples {
        loads: Arc<Mutex<Vec<(u64, u64)>>>,
        /// Fails every load covering this point.
        fail_at: Option<u64>,
        /// Returns one value past the requested range.
        overfetch: bool,
    }

    impl IntervalLoader for Multiples {
        type Args = u64;
        type Point = u64;
        type Value = u64;

        fn cache_key(&self, step: &u64) -> CacheKey {
            CacheKey::from_parts(step)
        }

        fn point_for_value(&self, value: &u64) -> u64 {
            *value
        }

        fn load(
            &self,
            begin: u64,
            end: u64,
            step: u64,
        ) -> BoxFuture<'static, CacheContents<Vec<u64>>> {
            self.loads.lock().unwrap().push((begin, end));
            let fail = self.fail_at.is_some_and(|p| begin <= p && p <= end);
            let overfetch = self.overfetch;
            async move {
                tokio::task::yield_now().await;
                if fail {
                    return Err(CacheError::load_failed("backend unavailable"));
                }
                let mut values: Vec<_> = (begin..=end).filter(|p| p % step == 0).collect();
                if overfetch {
                    values.push(end + 1);
                }
                Ok(values)
            }
            .boxed()
        }
    }

    fn multiples(loader: Multiples) -> (IntervalCache<Multiples>, Arc<Mutex<Vec<(u64, u64)>>>) {
        let loads = Arc::clone(&loader.loads);
        (
            IntervalCache::new("multiples", loader, CacheConfig::default()),
            loads,
        )
    }

    #[tokio::test]
    async fn test_covered_ranges_are_not_loaded_again() {
        test::setup();
        let (cache, loads) = multiples(Multiples::default());

        let values = cache.read_async(0, 100, 10).await.unwrap();
        assert_eq!(values, [0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);

        assert_eq!(cache.read_async(20, 40, 10).await.unwrap(), [20, 30, 40]);
        assert_eq!(loads.lock().unwrap().len(), 1);

        let values = cache.read_async(50, 150, 10).await.unwrap();
        assert_eq!(values, (50..=150).step_by(10).collect::<Vec<_>>());
        assert_eq!(*loads.lock().unwrap(), [(0, 100), (100, 150)]);
        assert_eq!(cache.loaded_ranges(&10), [(0, 150)]);
    }

    #[tokio::test]
    async fn test_islands_are_merged() {
        test::setup();
        let (cache, loads) = multiples(Multiples::default());

        cache.read_async(0, 10, 5).await.unwrap();
        cache.read_async(20, 30, 5).await.unwrap();
        assert_eq!(cache.loaded_ranges(&5), [(0, 10), (20, 30)]);

        cache.read_async(10, 20, 5).await.unwrap();
        assert_eq!(cache.loaded_ranges(&5), [(0, 30)]);
        assert_eq!(
            cache.get_values_if_cached(0, 30, &5),
            Some(vec![0, 5, 10, 15, 20, 25, 30])
        );

        // a query straddling several islands loads every gap in between
        cache.read_async(40, 50, 5).await.unwrap();
        cache.read_async(60, 70, 5).await.unwrap();
        loads.lock().unwrap().clear();
        let values = cache.read_async(25, 80, 5).await.unwrap();
        assert_eq!(values, (25..=80).step_by(5).collect::<Vec<_>>());
        assert_eq!(*loads.lock().unwrap(), [(30, 40), (50, 60), (70, 80)]);
        assert_eq!(cache.loaded_ranges(&5), [(0, 80)]);
    }

    #[tokio::test]
    async fn test_values_outside_query_are_excluded() {
        test::setup();
        let (cache, _loads) = multiples(Multiples::default());

        cache.read_async(0, 100, 10).await.unwrap();
        assert_eq!(cache.read_async(11, 29, 10).await.unwrap(), [20]);
        assert_eq!(cache.read_async(21, 29, 10).await.unwrap(), Vec::<u64>::new());
        assert_eq!(cache.read_async(30, 30, 10).await.unwrap(), [30]);
    }

    #[tokio::test]
    async fn test_degenerate_ranges() {
        test::setup();
        let (cache, loads) = multiples(Multiples::default());

        assert_eq!(cache.read_async(7, 7, 7).await.unwrap(), [7]);
        assert_eq!(cache.read_async(7, 7, 7).await.unwrap(), [7]);
        assert_eq!(cache.read(7, 7, 7).unwrap(), [7]);
        assert_eq!(*loads.lock().unwrap(), [(7, 7)]);

        assert_eq!(cache.read_async(9, 8, 7).await.unwrap(), Vec::<u64>::new());
        assert_eq!(loads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_gap_loads() {
        test::setup();
        let (cache, loads) = multiples(Multiples::default());

        let wide = cache.read_async(0, 100, 1);
        let narrow = cache.read_async(50, 60, 1);
        let overlapping = cache.read_async(90, 120, 1);

        let (wide, narrow, overlapping) = futures::join!(wide, narrow, overlapping);
        assert_eq!(wide.unwrap().len(), 101);
        assert_eq!(narrow.unwrap().len(), 11);
        assert_eq!(overlapping.unwrap(), (90..=120).collect::<Vec<_>>());
        assert_eq!(*loads.lock().unwrap(), [(0, 100), (100, 120)]);
    }

    #[tokio::test]
    async fn test_suspending_read() {
        test::setup();
        let (cache, loads) = multiples(Multiples::default());

        assert!(cache.read(0, 10, 2).unwrap_err().as_suspend().is_some());
        assert_eq!(cache.get_values_if_cached(0, 10, &2), None);

        let renders = AtomicUsize::new(0);
        let total = resolve(|| {
            renders.fetch_add(1, Ordering::Relaxed);
            let low = cache.read(0, 10, 2)?;
            let high = cache.read(10, 20, 2)?;
            Ok(low.len() + high.len())
        })
        .await;

        assert_eq!(total, Ok(12));
        assert_eq!(renders.load(Ordering::Relaxed), 3);
        assert_eq!(*loads.lock().unwrap(), [(0, 10), (10, 20)]);
    }

    #[tokio::test]
    async fn test_failed_ranges_are_redelivered() {
        test::setup();
        let (cache, loads) = multiples(Multiples {
            fail_at: Some(13),
            ..Default::default()
        });

        let error = cache.read_async(0, 20, 1).await.unwrap_err();
        assert_eq!(error, CacheError::load_failed("backend unavailable"));

        // any query overlapping the failed range gets the same error without loading
        assert_eq!(cache.read_async(10, 15, 1).await, Err(error.clone()));
        assert!(matches!(cache.read(20, 30, 1), Err(ReadError::Failed(_))));
        assert_eq!(loads.lock().unwrap().len(), 1);

        // disjoint ranges are unaffected
        assert_eq!(cache.read_async(30, 32, 1).await.unwrap(), [30, 31, 32]);

        assert!(cache.evict(&1));
        assert_eq!(cache.read_async(0, 20, 1).await, Err(error));
        assert_eq!(loads.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_neighbor_keeps_loaded_range() {
        test::setup();
        let (cache, loads) = multiples(Multiples {
            fail_at: Some(20),
            ..Default::default()
        });

        assert_eq!(cache.read_async(0, 10, 5).await.unwrap(), [0, 5, 10]);
        // the failed gap `[10, 30]` shares its lower bound with the loaded range
        assert!(cache.read_async(0, 30, 5).await.is_err());
        assert_eq!(*loads.lock().unwrap(), [(0, 10), (10, 30)]);
        assert_eq!(cache.loaded_ranges(&5), [(0, 10)]);

        assert_eq!(cache.read_async(0, 10, 5).await.unwrap(), [0, 5, 10]);
        assert_eq!(cache.read(10, 10, 5).unwrap(), [10]);
        assert_eq!(cache.get_values_if_cached(0, 10, &5), Some(vec![0, 5, 10]));

        // anything reaching into the failed gap still fails without loading
        assert!(matches!(cache.read(5, 15, 5), Err(ReadError::Failed(_))));
        assert_eq!(loads.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_overfetching_is_rejected() {
        test::setup();
        let (cache, _loads) = multiples(Multiples {
            overfetch: true,
            ..Default::default()
        });

        let error = cache.read_async(0, 10, 1).await.unwrap_err();
        assert!(matches!(error, CacheError::PartialCoverage { .. }));
        assert_eq!(
            error.to_string(),
            "partial coverage of [0, 10] in cache `multiples`: value at 11 is out of bounds"
        );
        assert!(cache.loaded_ranges(&1).is_empty());
        assert_eq!(cache.get_values_if_cached(0, 10, &1), None);
    }

    #[tokio::test]
    async fn test_args_are_isolated() {
        test::setup();
        let (cache, loads) = multiples(Multiples::default());

        assert_eq!(cache.read_async(0, 10, 5).await.unwrap(), [0, 5, 10]);
        assert_eq!(cache.read_async(0, 10, 2).await.unwrap(), [0, 2, 4, 6, 8, 10]);
        assert_eq!(loads.lock().unwrap().len(), 2);

        assert!(cache.evict(&5));
        assert!(!cache.evict(&5));
        assert_eq!(cache.get_values_if_cached(0, 10, &5), None);
        assert!(cache.get_values_if_cached(0, 10, &2).is_some());
        assert_eq!(cache.evict_all(), 1);
    }

    #[tokio::test]
    async fn test_immutable_eviction_keeps_loaded_values() {
        test::setup();
        let loader = Multiples {
            fail_at: Some(50),
            ..Default::default()
        };
        let loads = Arc::clone(&loader.loads);
        let cache = IntervalCache::new("immutable", loader, CacheConfig::immutable());

        cache.read_async(0, 10, 1).await.unwrap();
        cache.read_async(45, 55, 1).await.unwrap_err();

        assert_eq!(cache.evict_all(), 1);
        assert!(!cache.evict(&1));
        assert_eq!(cache.loaded_ranges(&1), [(0, 10)]);
        assert!(cache.read_async(0, 10, 1).await.is_ok());
        assert_eq!(loads.lock().unwrap().len(), 2);
    }

    /// Loads depth `n` by reading depth `n - 1`, and checks at depth `0` that its own key is
    /// refused.
    struct Nested(Arc<OnceLock<IntervalCache<Nested>>>);

    impl IntervalLoader for Nested {
        type Args = u32;
        type Point = u64;
        type Value = u64;

        fn cache_key(&self, depth: &u32) -> CacheKey {
            CacheKey::from_parts(depth)
        }

        fn point_for_value(&self, value: &u64) -> u64 {
            *value
        }

        fn load(
            &self,
            begin: u64,
            end: u64,
            depth: u32,
        ) -> BoxFuture<'static, CacheContents<Vec<u64>>> {
            let cache = self.0.get().cloned();
            async move {
                let cache = cache.ok_or(CacheError::InternalError)?;
                if depth > 0 {
                    return cache.read_async(begin, end, depth - 1).await;
                }
                let sync = cache.read(begin, end, 0);
                let not_sync = cache.read_async(begin, end, 0).await;
                match (sync, not_sync) {
                    (
                        Err(ReadError::Failed(CacheError::Reentrant { .. })),
                        Err(CacheError::Reentrant { .. }),
                    ) => Ok(vec![begin]),
                    _ => Err(CacheError::InternalError),
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_reentrant_read_is_refused() {
        test::setup();
        let slot = Arc::new(OnceLock::new());
        let cache = IntervalCache::new("nested", Nested(Arc::clone(&slot)), CacheConfig::default());
        slot.set(cache.clone()).unwrap();

        assert_eq!(cache.read_async(0, 10, 2).await.unwrap(), [0]);
        assert_eq!(cache.loaded_ranges(&2), [(0, 10)]);
        assert_eq!(cache.loaded_ranges(&0), [(0, 10)]);
        assert_eq!(cache.read(0, 10, 0).unwrap(), [0]);
    }
}
