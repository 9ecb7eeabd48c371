//! Sorted, coalesced lists of closed intervals and the gap computation on top of them.

/// A loaded range `[begin, end]` and the values whose points lie within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval<P, V> {
    pub begin: P,
    pub end: P,
    /// Sorted by point.
    pub values: Vec<V>,
}

impl<P: Ord + Copy, V> Interval<P, V> {
    /// Whether this interval touches or overlaps `[begin, end]`.
    fn touches(&self, begin: P, end: P) -> bool {
        self.begin <= end && begin <= self.end
    }
}

/// A sorted list of pairwise disjoint closed intervals.
///
/// Inserting an interval merges it with every interval it touches or overlaps.
#[derive(Debug, Clone)]
pub struct IntervalSet<P, V> {
    intervals: Vec<Interval<P, V>>,
}

impl<P, V> Default for IntervalSet<P, V> {
    fn default() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }
}

impl<P: Ord + Copy, V> IntervalSet<P, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intervals(&self) -> &[Interval<P, V>] {
        &self.intervals
    }

    /// Adds the values loaded for `[begin, end]`.
    ///
    /// `values` must lie within `[begin, end]`, they don't need to be sorted. Values whose point
    /// falls inside an interval that was already loaded are dropped, as that interval already
    /// contains everything at that point.
    pub fn insert<F>(&mut self, begin: P, end: P, values: Vec<V>, point: F)
    where
        F: Fn(&V) -> P,
    {
        // all intervals in `first..last` touch the new one
        let first = self.intervals.partition_point(|i| i.end < begin);
        let last = first
            + self.intervals[first..].partition_point(|i| i.begin <= end);
        let merged: Vec<_> = self.intervals.drain(first..last).collect();

        let mut new_begin = begin;
        let mut new_end = end;
        for interval in &merged {
            new_begin = new_begin.min(interval.begin);
            new_end = new_end.max(interval.end);
        }

        let mut combined: Vec<V> = Vec::with_capacity(
            values.len() + merged.iter().map(|i| i.values.len()).sum::<usize>(),
        );
        combined.extend(values.into_iter().filter(|value| {
            let p = point(value);
            !merged.iter().any(|i| i.begin <= p && p <= i.end)
        }));
        for interval in merged {
            combined.extend(interval.values);
        }
        combined.sort_by_key(|value| point(value));

        self.intervals.insert(
            first,
            Interval {
                begin: new_begin,
                end: new_end,
                values: combined,
            },
        );
    }

    /// Whether `[begin, end]` is entirely covered.
    pub fn covers(&self, begin: P, end: P) -> bool {
        let idx = self.intervals.partition_point(|i| i.end < begin);
        self.intervals
            .get(idx)
            .is_some_and(|i| i.begin <= begin && end <= i.end)
    }

    /// Returns all values whose point lies in `[begin, end]`, sorted by point.
    pub fn values_in<F>(&self, begin: P, end: P, point: F) -> Vec<V>
    where
        F: Fn(&V) -> P,
        V: Clone,
    {
        let first = self.intervals.partition_point(|i| i.end < begin);
        self.intervals[first..]
            .iter()
            .take_while(|i| i.touches(begin, end))
            .flat_map(|i| &i.values)
            .filter(|value| {
                let p = point(*value);
                begin <= p && p <= end
            })
            .cloned()
            .collect()
    }
}

/// Computes the parts of `[begin, end]` not covered by `covered`.
///
/// `covered` has to be sorted by its lower bounds, but may overlap. Gaps are returned as closed
/// ranges that include the bounds of their neighbors, so that loading them leaves no point
/// uncovered. An empty `[begin, begin]` query produces a single gap if that point is not covered.
pub fn gaps<P, I>(covered: I, begin: P, end: P) -> Vec<(P, P)>
where
    P: Ord + Copy,
    I: IntoIterator<Item = (P, P)>,
{
    if begin > end {
        return vec![];
    }

    let mut gaps = vec![];
    // everything before `cursor` is covered, and `cursor` itself too if `cursor_covered`
    let mut cursor = begin;
    let mut cursor_covered = false;

    for (range_begin, range_end) in covered {
        if range_end < cursor {
            continue;
        }
        if range_begin > end {
            break;
        }
        if range_begin > cursor {
            gaps.push((cursor, range_begin));
        }
        cursor = cursor.max(range_end);
        cursor_covered = true;
        if cursor >= end {
            break;
        }
    }

    if cursor < end || !cursor_covered {
        gaps.push((cursor, end));
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(value: &u32) -> u32 {
        *value
    }

    fn bounds(set: &IntervalSet<u32, u32>) -> Vec<(u32, u32)> {
        set.intervals().iter().map(|i| (i.begin, i.end)).collect()
    }

    #[test]
    fn test_merge_fills_hole() {
        let mut set = IntervalSet::new();
        set.insert(0, 10, vec![5, 0, 10], point);
        set.insert(20, 30, vec![25, 20], point);
        assert_eq!(bounds(&set), [(0, 10), (20, 30)]);

        set.insert(10, 20, vec![15, 10, 20], point);
        assert_eq!(bounds(&set), [(0, 30)]);
        assert_eq!(set.intervals()[0].values, [0, 5, 10, 15, 20, 25]);
    }

    #[test]
    fn test_merge_overlapping() {
        let mut set = IntervalSet::new();
        set.insert(40, 50, vec![45], point);
        set.insert(10, 20, vec![12], point);
        // 15 and 41 are already covered by the loaded intervals
        set.insert(15, 42, vec![15, 25, 30, 35, 41], point);
        assert_eq!(bounds(&set), [(10, 50)]);
        assert_eq!(set.intervals()[0].values, [12, 25, 30, 35, 45]);

        set.insert(60, 70, vec![], point);
        set.insert(0, 5, vec![1], point);
        assert_eq!(bounds(&set), [(0, 5), (10, 50), (60, 70)]);
    }

    #[test]
    fn test_values_in_filters_by_point() {
        let mut set = IntervalSet::new();
        set.insert(0, 100, (0..=100).step_by(10).collect(), point);

        assert!(set.covers(20, 40));
        assert!(!set.covers(90, 110));
        assert_eq!(set.values_in(15, 45, point), [20, 30, 40]);
        assert_eq!(set.values_in(20, 20, point), [20]);
        assert_eq!(set.values_in(21, 29, point), Vec::<u32>::new());
    }

    #[test]
    fn test_gaps() {
        assert_eq!(gaps([], 0, 100), [(0, 100)]);
        assert!(gaps([(0, 100)], 20, 40).is_empty());
        assert_eq!(gaps([(0, 100)], 50, 150), [(100, 150)]);
        assert_eq!(gaps([(50, 150)], 0, 100), [(0, 50)]);
        assert_eq!(
            gaps([(10, 20), (30, 40), (60, 70)], 0, 100),
            [(0, 10), (20, 30), (40, 60), (70, 100)]
        );
        assert!(gaps([(10, 20), (15, 40)], 12, 35).is_empty());
        assert!(gaps([(0, 10), (20, 30)], 20, 25).is_empty());
    }

    #[test]
    fn test_gaps_of_single_point() {
        assert_eq!(gaps([], 5, 5), [(5, 5)]);
        assert!(gaps([(0, 5)], 5, 5).is_empty());
        assert!(gaps([(5, 9)], 5, 5).is_empty());
        assert_eq!(gaps([(6, 9)], 5, 5), [(5, 5)]);
        assert!(gaps([(0, 1)], 5, 4).is_empty());
    }
}
