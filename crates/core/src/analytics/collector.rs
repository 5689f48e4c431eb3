//! Metrics Collector - Minute-Bucket Time Series
//!
//! Aggregates raw samples into per-minute buckets keyed by metric name.
//! When a bucket's minute passes, it rolls into a capped ring of
//! [`TimeSeriesPoint`]s. Timestamps are injected by callers so tests can
//! drive the clock.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One rolled-up minute of a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    /// Minute-aligned timestamp
    pub timestamp: DateTime<Utc>,
    /// Mean sample value
    pub avg: f64,
    /// Smallest sample value
    pub min: f64,
    /// Largest sample value
    pub max: f64,
    /// Sample count
    pub count: u64,
    /// Sample sum
    pub sum: f64,
}

#[derive(Debug, Clone)]
struct MinuteBucket {
    minute: i64,
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl MinuteBucket {
    fn new(minute: i64, value: f64) -> Self {
        Self {
            minute,
            sum: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    fn absorb(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    fn into_point(self) -> TimeSeriesPoint {
        let count = u32::try_from(self.count).unwrap_or(u32::MAX);
        TimeSeriesPoint {
            timestamp: Utc
                .timestamp_opt(self.minute * 60, 0)
                .single()
                .unwrap_or_else(Utc::now),
            avg: self.sum / f64::from(count),
            min: self.min,
            max: self.max,
            count: self.count,
            sum: self.sum,
        }
    }
}

#[derive(Debug, Default)]
struct CollectorInner {
    buckets: HashMap<String, MinuteBucket>,
    series: HashMap<String, Vec<TimeSeriesPoint>>,
}

/// Minute-resolution metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    capacity: usize,
    inner: Mutex<CollectorInner>,
}

impl MetricsCollector {
    /// Create collector retaining `capacity` points per metric
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CollectorInner::default()),
        }
    }

    /// Record a sample at the current time
    pub fn record(&self, metric: &str, value: f64) {
        self.record_at(metric, value, Utc::now());
    }

    /// Record a sample at an explicit time
    pub fn record_at(&self, metric: &str, value: f64, at: DateTime<Utc>) {
        let minute = at.timestamp() / 60;
        let mut inner = self.inner.lock();

        match inner.buckets.get_mut(metric) {
            Some(bucket) if bucket.minute == minute => bucket.absorb(value),
            Some(bucket) => {
                let rolled = std::mem::replace(bucket, MinuteBucket::new(minute, value));
                Self::push_point(&mut inner.series, metric, rolled.into_point(), self.capacity);
            }
            None => {
                inner
                    .buckets
                    .insert(metric.to_string(), MinuteBucket::new(minute, value));
            }
        }
    }

    /// Roll any bucket whose minute has passed relative to `at`. Queries
    /// call this so a quiet metric still exposes its last bucket.
    pub fn flush_at(&self, at: DateTime<Utc>) {
        let minute = at.timestamp() / 60;
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.minute < minute)
            .map(|(metric, _)| metric.clone())
            .collect();

        for metric in expired {
            if let Some(bucket) = inner.buckets.remove(&metric) {
                Self::push_point(&mut inner.series, &metric, bucket.into_point(), self.capacity);
            }
        }
    }

    /// Points for `metric` within the last `minutes`, oldest first
    pub fn time_series(&self, metric: &str, minutes: i64) -> Vec<TimeSeriesPoint> {
        self.time_series_at(metric, minutes, Utc::now())
    }

    /// Points for `metric` within the `minutes` before `at`, oldest first
    pub fn time_series_at(&self, metric: &str, minutes: i64, at: DateTime<Utc>) -> Vec<TimeSeriesPoint> {
        self.flush_at(at);
        let cutoff = at - chrono::Duration::minutes(minutes);
        let inner = self.inner.lock();
        inner
            .series
            .get(metric)
            .map(|points| {
                points
                    .iter()
                    .filter(|point| point.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of all metrics with rolled points
    pub fn metric_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .series
            .keys()
            .chain(inner.buckets.keys())
            .cloned()
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn push_point(
        series: &mut HashMap<String, Vec<TimeSeriesPoint>>,
        metric: &str,
        point: TimeSeriesPoint,
        capacity: usize,
    ) {
        let points = series.entry(metric.to_string()).or_default();
        points.push(point);
        let overflow = points.len().saturating_sub(capacity);
        if overflow > 0 {
            points.drain(..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(minute * 60, 0).single().unwrap_or_else(Utc::now)
    }

    #[test]
    fn test_bucket_aggregation() {
        let collector = MetricsCollector::new(10);
        collector.record_at("latency", 10.0, at(100));
        collector.record_at("latency", 30.0, at(100));
        collector.record_at("latency", 20.0, at(100));

        let points = collector.time_series_at("latency", 60, at(101));
        assert_eq!(points.len(), 1);
        assert!((points[0].avg - 20.0).abs() < f64::EPSILON);
        assert!((points[0].min - 10.0).abs() < f64::EPSILON);
        assert!((points[0].max - 30.0).abs() < f64::EPSILON);
        assert_eq!(points[0].count, 3);
        assert!((points[0].sum - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_minute_rollover() {
        let collector = MetricsCollector::new(10);
        collector.record_at("latency", 5.0, at(100));
        collector.record_at("latency", 15.0, at(101));
        collector.record_at("latency", 25.0, at(102));

        let points = collector.time_series_at("latency", 60, at(102));
        // Minute 102 is still open; 100 and 101 have rolled
        assert_eq!(points.len(), 2);
        assert!((points[0].avg - 5.0).abs() < f64::EPSILON);
        assert!((points[1].avg - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_filter() {
        let collector = MetricsCollector::new(100);
        for minute in 0_i64..30_i64 {
            collector.record_at("requests", 1.0, at(minute));
        }

        let points = collector.time_series_at("requests", 10, at(30));
        assert_eq!(points.len(), 10);
        assert_eq!(points[0].timestamp, at(20));
    }

    #[test]
    fn test_capacity_cap() {
        let collector = MetricsCollector::new(5);
        for minute in 0_i64..20_i64 {
            collector.record_at("requests", 1.0, at(minute));
        }
        collector.flush_at(at(21));

        let points = collector.time_series_at("requests", 10_000, at(21));
        assert_eq!(points.len(), 5);
        assert_eq!(points[4].timestamp, at(19));
    }

    #[test]
    fn test_unknown_metric_empty() {
        let collector = MetricsCollector::new(5);
        assert!(collector.time_series("nope", 60).is_empty());
    }
}
