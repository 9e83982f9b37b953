//! In-memory time-series storage.
//!
//! Samples append per series (metric name + label set) and stay sorted by
//! timestamp, so range and instant queries are simple ordered scans.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::labels::{Labels, SeriesId};

/// One stored sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Selects series by metric name and equality label matchers. A matcher on a
/// label the series does not carry never matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub metric: String,
    pub matchers: Labels,
}

impl Selector {
    pub fn new(metric: impl Into<String>, matchers: Labels) -> Self {
        Self {
            metric: metric.into(),
            matchers,
        }
    }

    pub fn matches(&self, id: &SeriesId) -> bool {
        id.metric == self.metric
            && self
                .matchers
                .iter()
                .all(|(name, value)| id.labels.get(name) == Some(value))
    }
}

#[derive(Default)]
struct Inner {
    series: HashMap<SeriesId, Vec<Point>>,
    out_of_order_dropped: u64,
}

/// Shared handle to the store. Clones refer to the same data.
#[derive(Clone, Default)]
pub struct MetricStore {
    inner: Arc<RwLock<Inner>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample. Returns false (and drops the sample) if its
    /// timestamp is older than the newest point already in the series.
    pub fn append(&self, id: SeriesId, timestamp: DateTime<Utc>, value: f64) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;
        if let Some(last) = inner.series.get(&id).and_then(|points| points.last()) {
            if timestamp < last.timestamp {
                inner.out_of_order_dropped += 1;
                return false;
            }
        }
        inner
            .series
            .entry(id)
            .or_default()
            .push(Point { timestamp, value });
        true
    }

    /// All points in `[start, end]` for every series matching the selector.
    /// Series with no points in the window are omitted.
    pub fn range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(SeriesId, Vec<Point>)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .series
            .iter()
            .filter(|(id, _)| selector.matches(id))
            .filter_map(|(id, points)| {
                let window: Vec<Point> = points
                    .iter()
                    .filter(|p| p.timestamp >= start && p.timestamp <= end)
                    .copied()
                    .collect();
                if window.is_empty() {
                    None
                } else {
                    Some((id.clone(), window))
                }
            })
            .collect()
    }

    /// The newest point per matching series within `lookback` of `at`.
    /// A series whose latest sample is older than the lookback is stale and
    /// omitted.
    pub fn latest(
        &self,
        selector: &Selector,
        at: DateTime<Utc>,
        lookback: Duration,
    ) -> Vec<(SeriesId, Point)> {
        let horizon = at - lookback;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .series
            .iter()
            .filter(|(id, _)| selector.matches(id))
            .filter_map(|(id, points)| {
                let newest = points
                    .iter()
                    .rev()
                    .find(|p| p.timestamp <= at)
                    .copied()?;
                if newest.timestamp < horizon {
                    None
                } else {
                    Some((id.clone(), newest))
                }
            })
            .collect()
    }

    /// Drop points older than `now - retention`; series left empty are
    /// removed entirely. Returns the number of points dropped.
    pub fn prune(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let horizon = now - retention;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = 0;
        inner.series.retain(|_, points| {
            let keep_from = points.partition_point(|p| p.timestamp < horizon);
            dropped += keep_from;
            points.drain(..keep_from);
            !points.is_empty()
        });
        if dropped > 0 {
            debug!(dropped, "pruned stale samples");
        }
        dropped
    }

    pub fn series_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.series.len()
    }

    pub fn out_of_order_dropped(&self) -> u64 {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.out_of_order_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn id(metric: &str, pairs: &[(&str, &str)]) -> SeriesId {
        SeriesId::new(metric, pairs.iter().copied().collect())
    }

    #[test]
    fn append_and_range() {
        let store = MetricStore::new();
        let cpu = id("cpu_usage_percent", &[("mode", "user")]);
        for i in 0..5 {
            assert!(store.append(cpu.clone(), ts(i * 10), i as f64));
        }

        let sel = Selector::new("cpu_usage_percent", Labels::new());
        let got = store.range(&sel, ts(10), ts(30));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.len(), 3);
        assert_eq!(got[0].1[0].value, 1.0);
        assert_eq!(got[0].1[2].value, 3.0);
    }

    #[test]
    fn out_of_order_append_rejected() {
        let store = MetricStore::new();
        let s = id("requests_total", &[]);
        assert!(store.append(s.clone(), ts(20), 1.0));
        assert!(!store.append(s.clone(), ts(10), 2.0));
        assert_eq!(store.out_of_order_dropped(), 1);

        // equal timestamps are allowed
        assert!(store.append(s, ts(20), 3.0));
    }

    #[test]
    fn selector_label_matching() {
        let store = MetricStore::new();
        store.append(id("up", &[("instance", "a")]), ts(0), 1.0);
        store.append(id("up", &[("instance", "b")]), ts(0), 0.0);

        let sel = Selector::new("up", [("instance", "b")].into_iter().collect());
        let got = store.latest(&sel, ts(60), Duration::minutes(5));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.value, 0.0);

        // matcher on a label the series lacks matches nothing
        let sel = Selector::new("up", [("job", "node")].into_iter().collect());
        assert!(store.latest(&sel, ts(60), Duration::minutes(5)).is_empty());
    }

    #[test]
    fn latest_respects_staleness_lookback() {
        let store = MetricStore::new();
        let s = id("queue_depth", &[]);
        store.append(s, ts(0), 7.0);

        let sel = Selector::new("queue_depth", Labels::new());
        assert_eq!(store.latest(&sel, ts(60), Duration::minutes(5)).len(), 1);
        assert!(store
            .latest(&sel, ts(600), Duration::minutes(5))
            .is_empty());
    }

    #[test]
    fn latest_ignores_future_points() {
        let store = MetricStore::new();
        let s = id("queue_depth", &[]);
        store.append(s.clone(), ts(0), 1.0);
        store.append(s, ts(120), 9.0);

        let sel = Selector::new("queue_depth", Labels::new());
        let got = store.latest(&sel, ts(60), Duration::minutes(5));
        assert_eq!(got[0].1.value, 1.0);
    }

    #[test]
    fn store_survives_poisoned_lock() {
        let store = MetricStore::new();
        let s = id("up", &[]);
        store.append(s.clone(), ts(0), 1.0);

        // panic while holding the write lock to poison it
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.write().unwrap();
            panic!("poisoning the store lock");
        })
        .join();

        assert!(store.append(s, ts(10), 2.0));
        let sel = Selector::new("up", Labels::new());
        assert_eq!(store.latest(&sel, ts(10), Duration::minutes(5)).len(), 1);
    }

    #[test]
    fn prune_drops_old_points_and_empty_series() {
        let store = MetricStore::new();
        let old = id("old_metric", &[]);
        let live = id("live_metric", &[]);
        store.append(old, ts(0), 1.0);
        store.append(live.clone(), ts(0), 1.0);
        store.append(live, ts(3600), 2.0);

        let dropped = store.prune(ts(3600), Duration::minutes(30));
        assert_eq!(dropped, 2);
        assert_eq!(store.series_count(), 1);
    }
}
