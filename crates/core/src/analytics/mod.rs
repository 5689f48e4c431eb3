//! Analytics Engine
//!
//! Request samples arrive on a bounded in-memory queue and are folded in
//! batches into three consumers: the minute-bucket metrics collector, the
//! hourly load forecaster and the EMA anomaly detector. Reporting methods
//! never fail; missing data shows up as empty sections.

pub mod anomaly;
pub mod collector;
pub mod forecast;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AnalyticsConfig;
use crate::error::{CoreError, CoreResult};
use crate::pool::{sleep_with_shutdown, ShutdownSignal};
use crate::types::EndpointId;

pub use anomaly::{AnomalyAlert, AnomalyDetector, AnomalyKind, Observation, Severity};
pub use collector::{MetricsCollector, TimeSeriesPoint};
pub use forecast::{LoadPrediction, PredictiveLoadAnalyzer};

/// Anomalies shown on the dashboard
const DASHBOARD_ANOMALY_LIMIT: usize = 20;
/// Endpoints ranked in the traffic leaderboard
const TOP_ENDPOINT_LIMIT: usize = 5;
/// Relative latency change below this is reported as stable
const TREND_STABLE_BAND: f64 = 0.1_f64;

/// One request sample awaiting batch processing
#[derive(Debug, Clone)]
pub struct AnalyticsEvent {
    /// When the request finished
    pub at: DateTime<Utc>,
    /// Endpoint that served it
    pub endpoint_id: EndpointId,
    /// Wall-clock service time
    pub response_time_ms: f64,
    /// Whether the request succeeded
    pub success: bool,
}

/// Aggregate traffic over a reporting window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStats {
    /// Requests in the window
    pub requests: u64,
    /// Mean response time
    pub avg_latency_ms: f64,
    /// Error percentage
    pub error_rate_pct: f64,
}

/// Platform-wide dashboard header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemOverview {
    /// Traffic over the last five minutes
    pub last_5m: WindowStats,
    /// Endpoints with recorded traffic
    pub active_endpoints: usize,
}

/// Per-endpoint dashboard row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPerformance {
    /// Endpoint identifier
    pub endpoint_id: String,
    /// Traffic over the last ten minutes
    pub last_10m: WindowStats,
}

/// Direction of a latency trend comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    /// Latency dropped more than the stable band
    Improving,
    /// Latency rose more than the stable band
    Degrading,
    /// Latency moved within the stable band
    Stable,
}

/// Hour-over-hour latency comparison for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyTrend {
    /// Endpoint identifier
    pub endpoint_id: String,
    /// Mean latency over the last hour
    pub last_hour_ms: f64,
    /// Mean latency over the hour before that
    pub previous_hour_ms: f64,
    /// Direction of the change
    pub direction: TrendDirection,
}

/// Full dashboard snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardReport {
    /// Snapshot time
    pub generated_at: DateTime<Utc>,
    /// Platform-wide header
    pub system: SystemOverview,
    /// Per-endpoint rows
    pub endpoints: Vec<EndpointPerformance>,
    /// Busiest endpoints over the last hour with request counts
    pub top_endpoints: Vec<(String, u64)>,
    /// Best-effort next-hour forecasts
    pub predictions: Vec<LoadPrediction>,
    /// Hour-over-hour latency comparisons
    pub latency_trends: Vec<LatencyTrend>,
    /// Most recent anomaly alerts
    pub recent_anomalies: Vec<AnomalyAlert>,
}

/// Engine health counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    /// Events waiting in the queue
    pub queued_events: usize,
    /// Events discarded because the queue was full
    pub dropped_events: u64,
    /// Events folded into the consumers
    pub processed_events: u64,
    /// Endpoints with recorded traffic
    pub tracked_endpoints: usize,
    /// Anomaly alerts retained
    pub anomaly_count: usize,
    /// Whether the batch thread is running
    pub is_running: bool,
}

/// Request analytics pipeline
pub struct AnalyticsEngine {
    config: AnalyticsConfig,
    queue: Mutex<VecDeque<AnalyticsEvent>>,
    dropped_events: AtomicU64,
    processed_events: AtomicU64,
    collector: MetricsCollector,
    forecaster: PredictiveLoadAnalyzer,
    detector: AnomalyDetector,
    seen_endpoints: Mutex<HashSet<EndpointId>>,
    shutdown: ShutdownSignal,
    batch_handle: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl std::fmt::Debug for AnalyticsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsEngine")
            .field("queued_events", &self.queue.lock().len())
            .field("is_running", &self.is_running.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl AnalyticsEngine {
    /// Create an engine from configuration. Call [`Self::start`] to spawn
    /// the batch thread.
    #[must_use]
    pub fn new(config: AnalyticsConfig) -> Self {
        let collector = MetricsCollector::new(config.time_series_capacity);
        let forecaster = PredictiveLoadAnalyzer::new(
            config.hourly_history_capacity,
            config.min_prediction_samples,
            Duration::from_secs(config.prediction_cache_ttl_s),
        );
        let detector = AnomalyDetector::new(config.anomaly_history_capacity);
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            dropped_events: AtomicU64::new(0),
            processed_events: AtomicU64::new(0),
            collector,
            forecaster,
            detector,
            seen_endpoints: Mutex::new(HashSet::new()),
            shutdown: ShutdownSignal::new(),
            batch_handle: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    /// Queue one request sample. When the queue is full the oldest sample
    /// is discarded so recording never blocks request handling.
    pub fn record_request_metrics(
        &self,
        endpoint_id: &EndpointId,
        response_time_ms: f64,
        success: bool,
    ) {
        self.record_event(AnalyticsEvent {
            at: Utc::now(),
            endpoint_id: endpoint_id.clone(),
            response_time_ms,
            success,
        });
    }

    /// Queue a pre-built event
    pub fn record_event(&self, event: AnalyticsEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.event_buffer_capacity {
            queue.pop_front();
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    /// Spawn the batch thread
    ///
    /// # Errors
    ///
    /// Returns an error when the thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let engine = Arc::clone(self);
        let interval = Duration::from_millis(self.config.batch_interval_ms);
        let handle = thread::Builder::new()
            .name("turnstile-analytics".to_string())
            .spawn(move || {
                debug!("Analytics batch thread started");
                while !engine.shutdown.is_shutdown() {
                    sleep_with_shutdown(&engine.shutdown, interval);
                    if engine.shutdown.is_shutdown() {
                        break;
                    }
                    engine.process_batch_once(Utc::now());
                }
                debug!("Analytics batch thread stopped");
            })
            .map_err(|e| CoreError::internal(format!("failed to spawn analytics thread: {e}")))?;

        *self.batch_handle.lock() = Some(handle);
        info!(
            buffer_capacity = self.config.event_buffer_capacity,
            batch_interval_ms = self.config.batch_interval_ms,
            "Analytics engine started"
        );
        Ok(())
    }

    /// Signal the batch thread and join it, flushing remaining events
    pub fn stop(&self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.signal();
        if let Some(handle) = self.batch_handle.lock().take() {
            let _ = handle.join();
        }
        while self.process_batch_once(Utc::now()) > 0 {}
        info!("Analytics engine stopped");
    }

    /// Whether the batch thread is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Drain one batch from the queue into the consumers. Returns the
    /// number of events processed.
    pub fn process_batch_once(&self, at: DateTime<Utc>) -> usize {
        let batch: Vec<AnalyticsEvent> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(self.config.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let mut groups: HashMap<EndpointId, Vec<&AnalyticsEvent>> = HashMap::new();
        for event in &batch {
            let latency_metric = format!("ep.{}.latency_ms", event.endpoint_id);
            let requests_metric = format!("ep.{}.requests", event.endpoint_id);
            self.collector.record_at(&latency_metric, event.response_time_ms, event.at);
            self.collector.record_at(&requests_metric, 1.0_f64, event.at);
            self.collector
                .record_at("system.latency_ms", event.response_time_ms, event.at);
            self.collector.record_at("system.requests", 1.0_f64, event.at);
            if !event.success {
                let errors_metric = format!("ep.{}.errors", event.endpoint_id);
                self.collector.record_at(&errors_metric, 1.0_f64, event.at);
                self.collector.record_at("system.errors", 1.0_f64, event.at);
            }
            groups.entry(event.endpoint_id.clone()).or_default().push(event);
        }

        {
            let mut seen = self.seen_endpoints.lock();
            for endpoint_id in groups.keys() {
                seen.insert(endpoint_id.clone());
            }
        }

        for (endpoint_id, events) in &groups {
            let count = u32::try_from(events.len()).unwrap_or(u32::MAX);
            let count_f = f64::from(count);
            let avg_latency =
                events.iter().map(|e| e.response_time_ms).sum::<f64>() / count_f;
            let failures = events.iter().filter(|e| !e.success).count();
            let failures_f = f64::from(u32::try_from(failures).unwrap_or(u32::MAX));
            let error_rate = failures_f / count_f * 100.0_f64;
            // Scale the batch window up to a per-minute rate
            let window_factor =
                60_000.0_f64 / f64::from(u32::try_from(self.config.batch_interval_ms).unwrap_or(u32::MAX)).max(1.0_f64);
            let requests_per_min = count_f * window_factor;

            self.forecaster.record_activity(endpoint_id, count_f, avg_latency, at);
            self.detector.observe(
                endpoint_id,
                Observation {
                    avg_latency_ms: avg_latency,
                    requests_per_min,
                    error_rate_pct: error_rate,
                },
            );
        }

        let processed = batch.len();
        self.processed_events
            .fetch_add(u64::try_from(processed).unwrap_or(u64::MAX), Ordering::Relaxed);
        processed
    }

    /// Minute points for one endpoint latency metric
    pub fn endpoint_latency_series(
        &self,
        endpoint_id: &EndpointId,
        minutes: i64,
    ) -> Vec<TimeSeriesPoint> {
        self.collector
            .time_series(&format!("ep.{endpoint_id}.latency_ms"), minutes)
    }

    /// Forecast the coming hour for an endpoint
    ///
    /// # Errors
    ///
    /// Returns an error when too little history exists.
    pub fn predict_load(&self, endpoint_id: &EndpointId) -> CoreResult<LoadPrediction> {
        Ok(self.forecaster.predict_load(endpoint_id, Utc::now())?)
    }

    /// Build the full dashboard snapshot. Never fails; sections without
    /// data come back empty.
    pub fn real_time_dashboard(&self) -> DashboardReport {
        self.real_time_dashboard_at(Utc::now())
    }

    /// Dashboard snapshot at an explicit time
    pub fn real_time_dashboard_at(&self, at: DateTime<Utc>) -> DashboardReport {
        let endpoints: Vec<EndpointId> = {
            let seen = self.seen_endpoints.lock();
            let mut ids: Vec<EndpointId> = seen.iter().cloned().collect();
            ids.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
            ids
        };

        let system = SystemOverview {
            last_5m: self.window_stats("system", 5, at),
            active_endpoints: endpoints.len(),
        };

        let endpoint_rows: Vec<EndpointPerformance> = endpoints
            .iter()
            .map(|id| EndpointPerformance {
                endpoint_id: id.to_string(),
                last_10m: self.window_stats(&format!("ep.{id}"), 10, at),
            })
            .collect();

        let mut traffic: Vec<(String, u64)> = endpoints
            .iter()
            .map(|id| {
                let stats = self.window_stats(&format!("ep.{id}"), 60, at);
                (id.to_string(), stats.requests)
            })
            .collect();
        traffic.sort_by(|a, b| b.1.cmp(&a.1));
        traffic.truncate(TOP_ENDPOINT_LIMIT);

        let predictions: Vec<LoadPrediction> = traffic
            .iter()
            .filter_map(|(id, _)| {
                self.forecaster
                    .predict_load(&EndpointId::new(id.clone()), at)
                    .ok()
            })
            .collect();

        let latency_trends: Vec<LatencyTrend> = endpoints
            .iter()
            .filter_map(|id| self.latency_trend(id, at))
            .collect();

        DashboardReport {
            generated_at: at,
            system,
            endpoints: endpoint_rows,
            top_endpoints: traffic,
            predictions,
            latency_trends,
            recent_anomalies: self.detector.recent_alerts(DASHBOARD_ANOMALY_LIMIT),
        }
    }

    /// Engine health counters
    pub fn analytics_summary(&self) -> AnalyticsSummary {
        AnalyticsSummary {
            queued_events: self.queue.lock().len(),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            processed_events: self.processed_events.load(Ordering::Relaxed),
            tracked_endpoints: self.seen_endpoints.lock().len(),
            anomaly_count: self.detector.alert_count(),
            is_running: self.is_running(),
        }
    }

    fn window_stats(&self, prefix: &str, minutes: i64, at: DateTime<Utc>) -> WindowStats {
        let latency_points =
            self.collector
                .time_series_at(&format!("{prefix}.latency_ms"), minutes, at);
        let request_points =
            self.collector
                .time_series_at(&format!("{prefix}.requests"), minutes, at);
        let error_points = self
            .collector
            .time_series_at(&format!("{prefix}.errors"), minutes, at);

        let requests: u64 = request_points.iter().map(|p| p.count).sum();
        let errors: u64 = error_points.iter().map(|p| p.count).sum();
        let latency_count: u64 = latency_points.iter().map(|p| p.count).sum();
        let latency_sum: f64 = latency_points.iter().map(|p| p.sum).sum();

        let avg_latency_ms = if latency_count > 0 {
            latency_sum / f64::from(u32::try_from(latency_count).unwrap_or(u32::MAX))
        } else {
            0.0_f64
        };
        let error_rate_pct = if requests > 0 {
            f64::from(u32::try_from(errors).unwrap_or(u32::MAX))
                / f64::from(u32::try_from(requests).unwrap_or(u32::MAX))
                * 100.0_f64
        } else {
            0.0_f64
        };

        WindowStats {
            requests,
            avg_latency_ms,
            error_rate_pct,
        }
    }

    fn latency_trend(&self, endpoint_id: &EndpointId, at: DateTime<Utc>) -> Option<LatencyTrend> {
        let metric = format!("ep.{endpoint_id}.latency_ms");
        let two_hours = self.collector.time_series_at(&metric, 120, at);
        if two_hours.is_empty() {
            return None;
        }
        let hour_ago = at - chrono::Duration::minutes(60);

        let (mut last_sum, mut last_count) = (0.0_f64, 0_u64);
        let (mut prev_sum, mut prev_count) = (0.0_f64, 0_u64);
        for point in &two_hours {
            if point.timestamp >= hour_ago {
                last_sum += point.sum;
                last_count += point.count;
            } else {
                prev_sum += point.sum;
                prev_count += point.count;
            }
        }
        if last_count == 0 || prev_count == 0 {
            return None;
        }

        let last_hour_ms = last_sum / f64::from(u32::try_from(last_count).unwrap_or(u32::MAX));
        let previous_hour_ms = prev_sum / f64::from(u32::try_from(prev_count).unwrap_or(u32::MAX));
        let relative_change = if previous_hour_ms > 0.0_f64 {
            (last_hour_ms - previous_hour_ms) / previous_hour_ms
        } else {
            0.0_f64
        };
        let direction = if relative_change > TREND_STABLE_BAND {
            TrendDirection::Degrading
        } else if relative_change < -TREND_STABLE_BAND {
            TrendDirection::Improving
        } else {
            TrendDirection::Stable
        };

        Some(LatencyTrend {
            endpoint_id: endpoint_id.to_string(),
            last_hour_ms,
            previous_hour_ms,
            direction,
        })
    }
}

impl Drop for AnalyticsEngine {
    fn drop(&mut self) {
        self.shutdown.signal();
    }
}
