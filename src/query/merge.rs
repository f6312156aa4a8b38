//! Merging of label-sorted series streams
//!
//! Each shard returns its series in ascending label order. The merge
//! set interleaves any number of such streams back into one ordered
//! stream, folding series with identical label sets into a single
//! series whose points are the time-ordered interleave of the
//! constituents. Heap ordering ties break on child index, so the output
//! is deterministic; points carrying equal timestamps from different
//! shards are all emitted, in child order.

use crate::schema::{Labels, Point, Series};
use crate::Error;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Iterator over the points of one series, in time order
pub trait SeriesIterator: Send {
    /// Advance to the first point with timestamp `>= t`; `false` when
    /// the iterator is exhausted
    fn seek(&mut self, t: i64) -> bool;

    /// The current point. Only valid after `next` or `seek` returned
    /// `true`.
    fn at(&self) -> (i64, f64);

    /// Advance one point; `false` when exhausted
    fn next(&mut self) -> bool;
}

/// A stream of series in ascending label order.
///
/// The cursor starts before the first series: callers step with `next`
/// and read the current element through `labels` and `iterator`.
pub trait SeriesSet: Send + std::fmt::Debug {
    /// Advance to the next series; `false` when exhausted
    fn next(&mut self) -> bool;

    /// Label set of the current series
    fn labels(&self) -> &Labels;

    /// Point iterator of the current series
    fn iterator(&self) -> Box<dyn SeriesIterator>;

    /// First error encountered producing this set, if any
    fn err(&self) -> Option<&Error>;
}

/// Materialized series data shared between a set and its iterators
#[derive(Debug, Clone)]
struct SeriesData {
    labels: Labels,
    points: Arc<[Point]>,
}

/// A [`SeriesSet`] over materialized series, e.g. one shard's response
#[derive(Debug)]
pub struct ListSeriesSet {
    series: Vec<SeriesData>,
    cursor: Option<usize>,
    err: Option<Error>,
}

impl ListSeriesSet {
    pub fn new(mut series: Vec<Series>) -> Self {
        series.sort_by(|a, b| a.labels.cmp(&b.labels));
        Self {
            series: series
                .into_iter()
                .map(|s| SeriesData {
                    labels: s.labels,
                    points: s.points.into(),
                })
                .collect(),
            cursor: None,
            err: None,
        }
    }

    /// An empty set carrying an error, for tests of error propagation
    pub fn with_err(err: Error) -> Self {
        Self {
            series: Vec::new(),
            cursor: None,
            err: Some(err),
        }
    }

    fn current(&self) -> &SeriesData {
        let i = self.cursor.expect("series set read before next()");
        &self.series[i]
    }
}

impl SeriesSet for ListSeriesSet {
    fn next(&mut self) -> bool {
        let next = self.cursor.map_or(0, |i| i + 1);
        if next < self.series.len() {
            self.cursor = Some(next);
            true
        } else {
            self.cursor = Some(self.series.len());
            false
        }
    }

    fn labels(&self) -> &Labels {
        &self.current().labels
    }

    fn iterator(&self) -> Box<dyn SeriesIterator> {
        Box::new(PointsIterator::new(Arc::clone(&self.current().points)))
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

/// Iterator over a materialized point slice
pub struct PointsIterator {
    points: Arc<[Point]>,
    cursor: Option<usize>,
}

impl PointsIterator {
    pub fn new(points: Arc<[Point]>) -> Self {
        Self {
            points,
            cursor: None,
        }
    }
}

impl SeriesIterator for PointsIterator {
    fn seek(&mut self, t: i64) -> bool {
        let start = self.cursor.unwrap_or(0);
        for i in start..self.points.len() {
            if self.points[i].t >= t {
                self.cursor = Some(i);
                return true;
            }
        }
        self.cursor = Some(self.points.len());
        false
    }

    fn at(&self) -> (i64, f64) {
        let i = self.cursor.expect("iterator read before next()");
        let p = self.points[i];
        (p.t, p.v)
    }

    fn next(&mut self) -> bool {
        let next = self.cursor.map_or(0, |i| i + 1);
        if next < self.points.len() {
            self.cursor = Some(next);
            true
        } else {
            self.cursor = Some(self.points.len());
            false
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    labels: Labels,
    child: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.labels
            .cmp(&other.labels)
            .then(self.child.cmp(&other.child))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merging [`SeriesSet`] over pre-sorted children.
///
/// Children are pre-advanced at construction so the heap can order them
/// by the series under their cursors.
#[derive(Debug)]
pub struct MergeSeriesSet {
    sets: Vec<Box<dyn SeriesSet>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    current: Vec<usize>,
    current_labels: Labels,
}

impl MergeSeriesSet {
    pub fn new(mut sets: Vec<Box<dyn SeriesSet>>) -> Box<dyn SeriesSet> {
        if sets.len() == 1 {
            return sets.pop().expect("one set");
        }

        let mut heap = BinaryHeap::with_capacity(sets.len());
        for (child, set) in sets.iter_mut().enumerate() {
            if set.next() {
                heap.push(Reverse(HeapEntry {
                    labels: set.labels().clone(),
                    child,
                }));
            }
        }

        Box::new(Self {
            sets,
            heap,
            current: Vec::new(),
            current_labels: Labels::default(),
        })
    }
}

impl SeriesSet for MergeSeriesSet {
    fn next(&mut self) -> bool {
        // Re-advance the children that produced the last series; those
        // still holding data go back into the heap.
        for &child in &self.current {
            if self.sets[child].next() {
                self.heap.push(Reverse(HeapEntry {
                    labels: self.sets[child].labels().clone(),
                    child,
                }));
            }
        }
        self.current.clear();

        let Some(Reverse(top)) = self.heap.pop() else {
            return false;
        };
        self.current_labels = top.labels;
        self.current.push(top.child);

        // Absorb every other child currently positioned on the same
        // label set, so duplicates collapse into one output series.
        loop {
            match self.heap.peek() {
                Some(Reverse(peeked)) if peeked.labels == self.current_labels => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                self.current.push(entry.child);
            }
        }

        true
    }

    fn labels(&self) -> &Labels {
        &self.current_labels
    }

    fn iterator(&self) -> Box<dyn SeriesIterator> {
        if self.current.len() == 1 {
            return self.sets[self.current[0]].iterator();
        }
        Box::new(MergeIterator::new(
            self.current.iter().map(|&i| self.sets[i].iterator()).collect(),
        ))
    }

    fn err(&self) -> Option<&Error> {
        self.sets.iter().find_map(|s| s.err())
    }
}

#[derive(PartialEq, Eq)]
struct IterEntry {
    t: i64,
    child: usize,
}

impl Ord for IterEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.t.cmp(&other.t).then(self.child.cmp(&other.child))
    }
}

impl PartialOrd for IterEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered k-way merge over per-shard iterators of one series
pub struct MergeIterator {
    iterators: Vec<Box<dyn SeriesIterator>>,
    heap: Option<BinaryHeap<Reverse<IterEntry>>>,
}

impl MergeIterator {
    pub fn new(iterators: Vec<Box<dyn SeriesIterator>>) -> Self {
        Self {
            iterators,
            heap: None,
        }
    }
}

impl SeriesIterator for MergeIterator {
    fn seek(&mut self, t: i64) -> bool {
        let mut heap = BinaryHeap::with_capacity(self.iterators.len());
        for (child, iter) in self.iterators.iter_mut().enumerate() {
            if iter.seek(t) {
                heap.push(Reverse(IterEntry {
                    t: iter.at().0,
                    child,
                }));
            }
        }
        let non_empty = !heap.is_empty();
        self.heap = Some(heap);
        non_empty
    }

    fn at(&self) -> (i64, f64) {
        let heap = self.heap.as_ref().expect("iterator read before next()");
        let Reverse(top) = heap.peek().expect("iterator read after exhaustion");
        self.iterators[top.child].at()
    }

    fn next(&mut self) -> bool {
        let Some(heap) = self.heap.as_mut() else {
            // First call positions every child and fills the heap.
            let mut heap = BinaryHeap::with_capacity(self.iterators.len());
            for (child, iter) in self.iterators.iter_mut().enumerate() {
                if iter.next() {
                    heap.push(Reverse(IterEntry {
                        t: iter.at().0,
                        child,
                    }));
                }
            }
            let non_empty = !heap.is_empty();
            self.heap = Some(heap);
            return non_empty;
        };

        let Some(Reverse(entry)) = heap.pop() else {
            return false;
        };
        if self.iterators[entry.child].next() {
            let t = self.iterators[entry.child].at().0;
            heap.push(Reverse(IterEntry {
                t,
                child: entry.child,
            }));
        }
        !heap.is_empty()
    }
}

/// Merge already-sorted string slices, deduplicating equal entries, by
/// pairwise divide and conquer
pub fn merge_string_slices(mut slices: Vec<Vec<String>>) -> Vec<String> {
    match slices.len() {
        0 => Vec::new(),
        1 => slices.pop().expect("one slice"),
        2 => {
            let b = slices.pop().expect("two slices");
            let a = slices.pop().expect("two slices");
            merge_two_string_slices(a, b)
        }
        _ => {
            let tail = slices.split_off(slices.len() / 2);
            merge_two_string_slices(merge_string_slices(slices), merge_string_slices(tail))
        }
    }
}

fn merge_two_string_slices(a: Vec<String>, b: Vec<String>) -> Vec<String> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();

    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => match x.cmp(y) {
                std::cmp::Ordering::Equal => {
                    result.push(a.next().expect("peeked"));
                    b.next();
                }
                std::cmp::Ordering::Less => result.push(a.next().expect("peeked")),
                std::cmp::Ordering::Greater => result.push(b.next().expect("peeked")),
            },
            (Some(_), None) => result.push(a.next().expect("peeked")),
            (None, Some(_)) => result.push(b.next().expect("peeked")),
            (None, None) => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Labels;

    fn series(name: &str, points: &[(i64, f64)]) -> Series {
        Series {
            labels: Labels::from_pairs(vec![("__name__", name)]),
            points: points.iter().map(|&(t, v)| Point::new(t, v)).collect(),
        }
    }

    fn list_set(series_list: Vec<Series>) -> Box<dyn SeriesSet> {
        Box::new(ListSeriesSet::new(series_list))
    }

    fn collect_labels(set: &mut dyn SeriesSet) -> Vec<String> {
        let mut names = Vec::new();
        while set.next() {
            names.push(set.labels().metric_name().unwrap_or("").to_string());
        }
        names
    }

    fn collect_points(iter: &mut dyn SeriesIterator) -> Vec<(i64, f64)> {
        let mut points = Vec::new();
        while iter.next() {
            points.push(iter.at());
        }
        points
    }

    #[test]
    fn test_merge_preserves_label_order_and_dedups() {
        let mut merged = MergeSeriesSet::new(vec![
            list_set(vec![
                series("a", &[(1, 1.0)]),
                series("b", &[(1, 1.0)]),
                series("d", &[(1, 1.0)]),
            ]),
            list_set(vec![series("a", &[(2, 2.0)]), series("c", &[(1, 1.0)])]),
            list_set(vec![
                series("b", &[(2, 2.0)]),
                series("c", &[(2, 2.0)]),
                series("d", &[(2, 2.0)]),
            ]),
        ]);

        assert_eq!(collect_labels(merged.as_mut()), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_equal_label_series_time_merge() {
        let mut merged = MergeSeriesSet::new(vec![
            list_set(vec![series("a", &[(1, 1.0), (3, 3.0)])]),
            list_set(vec![series("a", &[(2, 2.0), (4, 4.0)])]),
        ]);

        assert!(merged.next());
        let mut iter = merged.iterator();
        assert_eq!(
            collect_points(iter.as_mut()),
            vec![(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0)]
        );
        assert!(!merged.next());
    }

    #[test]
    fn test_labels_strictly_increase_across_output() {
        let mut merged = MergeSeriesSet::new(vec![
            list_set(vec![series("a", &[(1, 1.0)]), series("c", &[(1, 1.0)])]),
            list_set(vec![series("a", &[(1, 5.0)]), series("b", &[(1, 1.0)])]),
            list_set(vec![series("c", &[(2, 2.0)])]),
        ]);

        let mut previous: Option<Labels> = None;
        while merged.next() {
            let current = merged.labels().clone();
            if let Some(prev) = &previous {
                assert!(current > *prev, "labels must strictly increase");
            }
            previous = Some(current);
        }
    }

    #[test]
    fn test_equal_timestamps_all_emitted_in_child_order() {
        let mut merged = MergeSeriesSet::new(vec![
            list_set(vec![series("a", &[(1, 10.0)])]),
            list_set(vec![series("a", &[(1, 20.0)])]),
        ]);

        assert!(merged.next());
        let mut iter = merged.iterator();
        assert_eq!(collect_points(iter.as_mut()), vec![(1, 10.0), (1, 20.0)]);
    }

    #[test]
    fn test_merged_timestamps_non_decreasing() {
        let mut merged = MergeSeriesSet::new(vec![
            list_set(vec![series("a", &[(1, 1.0), (5, 5.0), (9, 9.0)])]),
            list_set(vec![series("a", &[(2, 2.0), (5, 5.5)])]),
            list_set(vec![series("a", &[(0, 0.0), (9, 9.9)])]),
        ]);

        assert!(merged.next());
        let mut iter = merged.iterator();
        let points = collect_points(iter.as_mut());
        assert_eq!(points.len(), 7);
        assert!(points.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_empty_and_exhausted_children() {
        let mut merged = MergeSeriesSet::new(vec![
            list_set(Vec::new()),
            list_set(vec![series("a", &[(1, 1.0)])]),
            list_set(Vec::new()),
        ]);

        assert_eq!(collect_labels(merged.as_mut()), vec!["a"]);
    }

    #[test]
    fn test_err_returns_first_child_error() {
        let mut merged = MergeSeriesSet::new(vec![
            list_set(vec![series("a", &[(1, 1.0)])]),
            Box::new(ListSeriesSet::with_err(Error::Timeout)),
        ]);

        assert!(matches!(merged.err(), Some(Error::Timeout)));
        // The healthy child still streams.
        assert_eq!(collect_labels(merged.as_mut()), vec!["a"]);
    }

    #[test]
    fn test_single_child_passes_through() {
        let mut merged = MergeSeriesSet::new(vec![list_set(vec![
            series("x", &[(1, 1.0)]),
            series("y", &[(2, 2.0)]),
        ])]);

        assert_eq!(collect_labels(merged.as_mut()), vec!["x", "y"]);
    }

    #[test]
    fn test_merge_iterator_seek() {
        let mut iter = MergeIterator::new(vec![
            Box::new(PointsIterator::new(
                vec![Point::new(1, 1.0), Point::new(5, 5.0)].into(),
            )),
            Box::new(PointsIterator::new(
                vec![Point::new(3, 3.0), Point::new(7, 7.0)].into(),
            )),
        ]);

        assert!(iter.seek(4));
        assert_eq!(iter.at(), (5, 5.0));
        assert!(iter.next());
        assert_eq!(iter.at(), (7, 7.0));
        assert!(!iter.next());
    }

    #[test]
    fn test_merge_string_slices() {
        let merged = merge_string_slices(vec![
            vec!["a".into(), "c".into(), "e".into()],
            vec!["b".into(), "c".into()],
            vec!["a".into(), "f".into()],
        ]);
        assert_eq!(merged, vec!["a", "b", "c", "e", "f"]);

        assert!(merge_string_slices(Vec::new()).is_empty());
        assert_eq!(
            merge_string_slices(vec![vec!["x".into()]]),
            vec!["x".to_string()]
        );
    }
}
