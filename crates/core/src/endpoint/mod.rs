//! Endpoint Manager - Registry, Admission Gates and Health
//!
//! Central registry of endpoint configurations with per-endpoint circuit
//! breakers, sliding-window rate limiters and request metrics. The request
//! path gates on the breaker first, then the rate limit, then dispatches
//! through the resource pool manager when one is attached (inline
//! otherwise). A health loop reclassifies endpoints from their error rates
//! and latencies.

pub mod circuit_breaker;
pub mod metrics;
pub mod rate_limit;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use metrics::{EndpointMetrics, MetricsSnapshot};
pub use rate_limit::RateLimiter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::analytics::AnalyticsEngine;
use crate::config::{EndpointDefaults, EndpointManagerConfig};
use crate::error::{CoreError, CoreResult, EndpointError};
use crate::pool::{ResourcePoolManager, ShutdownSignal};
use crate::types::{
    EndpointId, Job, Priority, ResourceType, ScalingAction, ScalingRecommendation,
};

/// Immutable endpoint configuration, fixed at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Registry key
    pub id: EndpointId,
    /// Route path the endpoint serves
    pub path: String,
    /// HTTP method
    pub method: String,
    /// Priority tier
    pub priority: Priority,
    /// Resource class requests need, if any
    pub resource: Option<ResourceType>,
    /// Concurrency ceiling, advisory for capacity planning
    pub max_concurrent_requests: u32,
    /// Request timeout (seconds)
    pub timeout_s: u64,
    /// Consecutive failures before the breaker opens
    pub circuit_breaker_threshold: u32,
    /// Breaker recovery timeout (seconds)
    pub circuit_breaker_timeout_s: u64,
    /// Sliding-window rate limit (requests per minute)
    pub rate_limit_rpm: u32,
    /// Response cache TTL (seconds)
    pub cache_ttl_s: u64,
    /// Whether this endpoint participates in scaling recommendations
    pub auto_scale_enabled: bool,
    /// Whether this endpoint is business critical
    pub critical: bool,
}

impl EndpointConfig {
    /// Build a config for a route using the given defaults. Identifier and
    /// priority are derived from the path; critical endpoints are those in
    /// the critical tier.
    #[must_use]
    pub fn from_route(path: &str, method: &str, defaults: &EndpointDefaults) -> Self {
        let priority = Priority::from_path(path);
        Self {
            id: EndpointId::from_path(path),
            path: path.to_string(),
            method: method.to_string(),
            priority,
            resource: None,
            max_concurrent_requests: defaults.max_concurrent_requests,
            timeout_s: defaults.timeout_s,
            circuit_breaker_threshold: defaults.circuit_breaker_threshold,
            circuit_breaker_timeout_s: defaults.circuit_breaker_timeout_s,
            rate_limit_rpm: defaults.rate_limit_rpm,
            cache_ttl_s: defaults.cache_ttl_s,
            auto_scale_enabled: true,
            critical: priority == Priority::Critical,
        }
    }

    /// Request timeout as a [`Duration`]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

/// Outcome of one request execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Job ran and returned a value
    Success,
    /// Job ran (or dispatch failed) after admission
    Failed,
}

/// Report returned by [`EndpointManager::execute_request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Endpoint the request ran against
    pub endpoint_id: EndpointId,
    /// Success or failure
    pub status: ExecutionStatus,
    /// Job output on success
    pub result: Option<serde_json::Value>,
    /// Error description on failure
    pub error: Option<String>,
    /// Wall-clock execution time (ms)
    pub execution_time_ms: f64,
}

/// Health view of one endpoint within a [`HealthReport`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    /// Endpoint identifier
    pub id: EndpointId,
    /// Route path
    pub path: String,
    /// Priority tier
    pub priority: Priority,
    /// Current breaker / health state
    pub state: CircuitState,
    /// Consecutive breaker failures
    pub breaker_failures: u32,
    /// Requests in the current rate window
    pub requests_per_minute: u32,
    /// Metrics snapshot
    pub metrics: MetricsSnapshot,
}

/// Aggregate health summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    /// Registered endpoints
    pub total_endpoints: usize,
    /// Endpoints currently healthy
    pub healthy_endpoints: usize,
    /// Healthy percentage
    pub health_pct: f64,
    /// Requests across all endpoints
    pub total_requests: u64,
}

/// Full health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Aggregate summary
    pub summary: HealthSummary,
    /// Per-endpoint detail, sorted by id
    pub endpoints: Vec<EndpointHealth>,
}

struct EndpointEntry {
    config: EndpointConfig,
    metrics: EndpointMetrics,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

impl EndpointEntry {
    fn new(config: EndpointConfig) -> Self {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            recovery_timeout: Duration::from_secs(config.circuit_breaker_timeout_s),
        });
        let limiter = RateLimiter::new(config.rate_limit_rpm);
        Self {
            config,
            metrics: EndpointMetrics::new(),
            breaker,
            limiter,
        }
    }
}

/// Endpoint manager
pub struct EndpointManager {
    config: EndpointManagerConfig,
    defaults: EndpointDefaults,
    registry: DashMap<EndpointId, Arc<EndpointEntry>>,
    pool_manager: Option<Arc<ResourcePoolManager>>,
    analytics: Option<Arc<AnalyticsEngine>>,
    shutdown: ShutdownSignal,
    health_handle: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl EndpointManager {
    /// Create manager with no attached services
    #[must_use]
    pub fn new(config: EndpointManagerConfig, defaults: EndpointDefaults) -> Self {
        Self {
            config,
            defaults,
            registry: DashMap::new(),
            pool_manager: None,
            analytics: None,
            shutdown: ShutdownSignal::new(),
            health_handle: parking_lot::Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    /// Attach the resource pool manager; requests will be dispatched
    /// through it instead of running inline.
    #[must_use]
    pub fn with_pool_manager(mut self, pool_manager: Arc<ResourcePoolManager>) -> Self {
        self.pool_manager = Some(pool_manager);
        self
    }

    /// Attach the analytics engine; request samples will be forwarded to it.
    #[must_use]
    pub fn with_analytics(mut self, analytics: Arc<AnalyticsEngine>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    /// Register an endpoint. The configuration is immutable afterwards.
    ///
    /// # Errors
    ///
    /// Returns error when the id is already registered.
    pub fn register_endpoint(&self, config: EndpointConfig) -> CoreResult<()> {
        let id = config.id.clone();
        if self.registry.contains_key(&id) {
            return Err(EndpointError::AlreadyRegistered {
                endpoint_id: id.to_string(),
            }
            .into());
        }

        tracing::info!(endpoint = %id, priority = %config.priority, "endpoint registered");
        self.registry.insert(id, Arc::new(EndpointEntry::new(config)));
        Ok(())
    }

    /// Register any routes not yet known, deriving priority from path
    /// keywords. Returns the ids that were newly registered.
    pub fn auto_discover_endpoints(&self, routes: &[(&str, &str)]) -> Vec<EndpointId> {
        let mut discovered = Vec::new();
        for (path, method) in routes {
            let config = EndpointConfig::from_route(path, method, &self.defaults);
            if self.registry.contains_key(&config.id) {
                continue;
            }
            let id = config.id.clone();
            if self.register_endpoint(config).is_ok() {
                discovered.push(id);
            }
        }
        if !discovered.is_empty() {
            tracing::info!(count = discovered.len(), "auto-discovered endpoints");
        }
        discovered
    }

    /// Execute a job against an endpoint through the admission gates.
    ///
    /// # Errors
    ///
    /// Returns an error for admission rejections: unknown endpoint, open
    /// circuit, exceeded rate limit or a full admission queue. Job failures
    /// after admission come back as a report with `Failed` status.
    pub fn execute_request(
        &self,
        endpoint_id: &EndpointId,
        job: Box<dyn Job>,
    ) -> CoreResult<ExecutionReport> {
        let entry = self.entry(endpoint_id)?;

        if !entry.breaker.can_execute() {
            return Err(CoreError::circuit_open(endpoint_id.as_str()));
        }
        if !entry.limiter.try_admit() {
            return Err(CoreError::rate_limited(
                endpoint_id.as_str(),
                entry.config.rate_limit_rpm,
            ));
        }

        let started = Instant::now();
        let result = self.dispatch(&entry, endpoint_id, job);
        let elapsed_ms = duration_ms(started.elapsed());

        match result {
            Ok(value) => {
                entry.metrics.record_request(elapsed_ms, true, None);
                entry.breaker.record_success();
                self.forward_sample(endpoint_id, elapsed_ms, true);
                Ok(ExecutionReport {
                    endpoint_id: endpoint_id.clone(),
                    status: ExecutionStatus::Success,
                    result: Some(value),
                    error: None,
                    execution_time_ms: elapsed_ms,
                })
            }
            Err(e) if e.is_rejection() => {
                // Downstream admission rejections are not endpoint failures
                Err(e)
            }
            Err(e) => {
                let message = e.to_string();
                entry.metrics.record_request(elapsed_ms, false, Some(&message));
                entry.breaker.record_failure();
                self.forward_sample(endpoint_id, elapsed_ms, false);
                Ok(ExecutionReport {
                    endpoint_id: endpoint_id.clone(),
                    status: ExecutionStatus::Failed,
                    result: None,
                    error: Some(message),
                    execution_time_ms: elapsed_ms,
                })
            }
        }
    }

    fn dispatch(
        &self,
        entry: &EndpointEntry,
        endpoint_id: &EndpointId,
        mut job: Box<dyn Job>,
    ) -> CoreResult<serde_json::Value> {
        if let Some(pool_manager) = &self.pool_manager {
            let outcome = pool_manager.execute(
                endpoint_id.clone(),
                entry.config.priority,
                entry.config.resource,
                job,
                entry.config.timeout(),
            )?;
            Ok(outcome.value)
        } else {
            job.run(None)
                .map_err(|e| CoreError::task_failed(endpoint_id.as_str(), e.to_string()))
        }
    }

    fn forward_sample(&self, endpoint_id: &EndpointId, latency_ms: f64, success: bool) {
        if let Some(analytics) = &self.analytics {
            analytics.record_request_metrics(endpoint_id, latency_ms, success);
        }
    }

    /// Reclassify every endpoint from its metrics. Called by the health
    /// loop; safe to call directly in tests.
    pub fn health_check_all(&self) {
        for entry in &self.registry {
            let error_rate = entry.metrics.error_rate_pct();
            let avg_latency = entry.metrics.avg_latency_ms();

            let state = if error_rate > self.config.unhealthy_error_rate_pct {
                CircuitState::Unhealthy
            } else if error_rate > self.config.degraded_error_rate_pct
                || avg_latency > self.config.degraded_latency_ms
            {
                CircuitState::Degraded
            } else {
                CircuitState::Healthy
            };

            if state != CircuitState::Healthy {
                tracing::warn!(
                    endpoint = %entry.key(),
                    state = state.as_str(),
                    error_rate_pct = error_rate,
                    avg_latency_ms = avg_latency,
                    "endpoint health degraded"
                );
            }
            entry.breaker.set_health(state);
        }
    }

    /// Start the background health loop.
    ///
    /// # Errors
    ///
    /// Returns error if already running or the thread fails to spawn.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(CoreError::endpoint("start", "already running"));
        }

        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.health_interval_s);
        let handle = thread::Builder::new()
            .name("turnstile-endpoint-health".to_string())
            .spawn(move || {
                while !manager.shutdown.is_shutdown() {
                    crate::pool::sleep_with_shutdown(&manager.shutdown, interval);
                    if manager.shutdown.is_shutdown() {
                        break;
                    }
                    manager.health_check_all();
                }
            })
            .map_err(|e| CoreError::endpoint("start", e.to_string()))?;

        *self.health_handle.lock() = Some(handle);
        tracing::info!("endpoint manager started");
        Ok(())
    }

    /// Stop the health loop.
    pub fn stop(&self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.signal();
        if let Some(handle) = self.health_handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("health loop thread panicked during shutdown");
            }
        }
        tracing::info!("endpoint manager stopped");
    }

    /// Whether the health loop is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Administrative breaker reset for one endpoint.
    ///
    /// # Errors
    ///
    /// Returns error when the endpoint is unknown.
    pub fn reset_circuit_breaker(&self, endpoint_id: &EndpointId) -> CoreResult<()> {
        let entry = self.entry(endpoint_id)?;
        entry.breaker.reset();
        tracing::info!(endpoint = %endpoint_id, "circuit breaker reset");
        Ok(())
    }

    /// Registered endpoint configuration.
    ///
    /// # Errors
    ///
    /// Returns error when the endpoint is unknown.
    pub fn endpoint_config(&self, endpoint_id: &EndpointId) -> CoreResult<EndpointConfig> {
        Ok(self.entry(endpoint_id)?.config.clone())
    }

    /// Current breaker state for one endpoint.
    ///
    /// # Errors
    ///
    /// Returns error when the endpoint is unknown.
    pub fn endpoint_state(&self, endpoint_id: &EndpointId) -> CoreResult<CircuitState> {
        Ok(self.entry(endpoint_id)?.breaker.state())
    }

    /// Number of registered endpoints
    pub fn endpoint_count(&self) -> usize {
        self.registry.len()
    }

    /// Full health report. Partial data is better than none, so this never
    /// fails; endpoints are reported as they are at snapshot time.
    pub fn health_report(&self) -> HealthReport {
        let mut endpoints: Vec<EndpointHealth> = self
            .registry
            .iter()
            .map(|entry| EndpointHealth {
                id: entry.key().clone(),
                path: entry.config.path.clone(),
                priority: entry.config.priority,
                state: entry.breaker.state(),
                breaker_failures: entry.breaker.failure_count(),
                requests_per_minute: entry.limiter.current_rpm(),
                metrics: entry.metrics.snapshot(),
            })
            .collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));

        let total_endpoints = endpoints.len();
        let healthy_endpoints = endpoints
            .iter()
            .filter(|e| e.state == CircuitState::Healthy)
            .count();
        let health_pct = if total_endpoints == 0 {
            100.0_f64
        } else {
            f64::from(u32::try_from(healthy_endpoints).unwrap_or(u32::MAX))
                / f64::from(u32::try_from(total_endpoints).unwrap_or(u32::MAX))
                * 100.0_f64
        };
        let total_requests = endpoints.iter().map(|e| e.metrics.total_requests).sum();

        HealthReport {
            summary: HealthSummary {
                total_endpoints,
                healthy_endpoints,
                health_pct,
                total_requests,
            },
            endpoints,
        }
    }

    /// Advisory scaling recommendations for auto-scale endpoints
    pub fn scaling_recommendations(&self) -> Vec<ScalingRecommendation> {
        let mut recommendations: Vec<ScalingRecommendation> = self
            .registry
            .iter()
            .filter(|entry| entry.config.auto_scale_enabled)
            .map(|entry| {
                let rpm = entry.limiter.current_rpm();
                let limit = entry.config.rate_limit_rpm.max(1);
                let utilization_pct = f64::from(rpm) / f64::from(limit) * 100.0_f64;

                let action = if utilization_pct > self.config.scale_up_utilization_pct {
                    ScalingAction::ScaleUp
                } else if utilization_pct < self.config.scale_down_utilization_pct {
                    ScalingAction::ScaleDown
                } else {
                    ScalingAction::Maintain
                };

                ScalingRecommendation {
                    endpoint_id: entry.key().clone(),
                    action,
                    utilization_pct,
                    requests_per_second: f64::from(rpm) / 60.0_f64,
                    avg_latency_ms: entry.metrics.avg_latency_ms(),
                    error_rate_pct: entry.metrics.error_rate_pct(),
                }
            })
            .collect();
        recommendations.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        recommendations
    }

    fn entry(&self, endpoint_id: &EndpointId) -> CoreResult<Arc<EndpointEntry>> {
        self.registry
            .get(endpoint_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                EndpointError::Unknown {
                    endpoint_id: endpoint_id.to_string(),
                }
                .into()
            })
    }
}

fn duration_ms(duration: Duration) -> f64 {
    f64::from(u32::try_from(duration.as_micros()).unwrap_or(u32::MAX)) / 1000.0_f64
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;
    use crate::types::JobFn;

    fn manager() -> EndpointManager {
        EndpointManager::new(EndpointManagerConfig::default(), EndpointDefaults::default())
    }

    fn register(manager: &EndpointManager, path: &str) -> EndpointId {
        let config = EndpointConfig::from_route(path, "GET", &EndpointDefaults::default());
        let id = config.id.clone();
        assert!(manager.register_endpoint(config).is_ok());
        id
    }

    fn ok_job() -> Box<dyn Job> {
        Box::new(JobFn::new(|_| Ok(serde_json::json!({"ok": true}))))
    }

    fn failing_job() -> Box<dyn Job> {
        Box::new(JobFn::new(|_| Err(crate::types::JobError::new("backend down"))))
    }

    #[test]
    fn test_register_and_duplicate() {
        let m = manager();
        let id = register(&m, "/api/market-data");
        assert_eq!(m.endpoint_count(), 1);

        let config = EndpointConfig::from_route("/api/market-data", "GET", &m.defaults);
        let result = m.register_endpoint(config);
        assert!(matches!(result, Err(CoreError::Endpoint { .. })));
        assert_eq!(id.as_str(), "api_market_data");
    }

    #[test]
    fn test_auto_discovery_classification() {
        let m = manager();
        let discovered = m.auto_discover_endpoints(&[
            ("/api/trade-signals", "POST"),
            ("/ml/ensemble", "GET"),
            ("/market/overview", "GET"),
            ("/healthz", "GET"),
        ]);
        assert_eq!(discovered.len(), 4);

        let check = |path: &str, priority: Priority| {
            let config = m.endpoint_config(&EndpointId::from_path(path));
            match config {
                Ok(config) => assert_eq!(config.priority, priority),
                Err(e) => panic!("missing endpoint for {path}: {e}"),
            }
        };
        check("/api/trade-signals", Priority::Critical);
        check("/ml/ensemble", Priority::High);
        check("/market/overview", Priority::Medium);
        check("/healthz", Priority::Low);

        // Second discovery registers nothing new
        assert!(m.auto_discover_endpoints(&[("/healthz", "GET")]).is_empty());
    }

    #[test]
    fn test_execute_success_records_metrics() {
        let m = manager();
        let id = register(&m, "/api/data");

        let report = m.execute_request(&id, ok_job());
        match report {
            Ok(report) => {
                assert_eq!(report.status, ExecutionStatus::Success);
                assert_eq!(report.result, Some(serde_json::json!({"ok": true})));
            }
            Err(e) => panic!("execute failed: {e}"),
        }

        let health = m.health_report();
        assert_eq!(health.summary.total_requests, 1);
        assert_eq!(health.endpoints[0].metrics.successful_requests, 1);
        assert_eq!(health.endpoints[0].requests_per_minute, 1);
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let m = manager();
        let result = m.execute_request(&EndpointId::new("nope"), ok_job());
        assert!(matches!(result, Err(CoreError::Endpoint { .. })));
    }

    #[test]
    fn test_breaker_opens_and_rejects() {
        let m = manager();
        let mut config = EndpointConfig::from_route("/api/data", "GET", &m.defaults);
        config.circuit_breaker_threshold = 3;
        let id = config.id.clone();
        assert!(m.register_endpoint(config).is_ok());

        for _ in 0_i32..3_i32 {
            let report = m.execute_request(&id, failing_job());
            assert!(matches!(
                report,
                Ok(ExecutionReport {
                    status: ExecutionStatus::Failed,
                    ..
                })
            ));
        }

        let rejected = m.execute_request(&id, ok_job());
        assert!(matches!(rejected, Err(CoreError::CircuitOpen { .. })));

        // Operator reset clears the breaker
        assert!(m.reset_circuit_breaker(&id).is_ok());
        assert!(m.execute_request(&id, ok_job()).is_ok());
    }

    #[test]
    fn test_rate_limit_gate() {
        let m = manager();
        let mut config = EndpointConfig::from_route("/api/data", "GET", &m.defaults);
        config.rate_limit_rpm = 2;
        let id = config.id.clone();
        assert!(m.register_endpoint(config).is_ok());

        assert!(m.execute_request(&id, ok_job()).is_ok());
        assert!(m.execute_request(&id, ok_job()).is_ok());
        let third = m.execute_request(&id, ok_job());
        assert!(matches!(
            third,
            Err(CoreError::RateLimitExceeded { limit_rpm: 2, .. })
        ));
    }

    #[test]
    fn test_health_classification_thresholds() {
        let m = manager();
        let id = register(&m, "/api/data");

        // 60% errors: unhealthy
        for _ in 0_i32..4_i32 {
            let _ = m.execute_request(&id, ok_job());
        }
        for _ in 0_i32..6_i32 {
            let _ = m.execute_request(&id, failing_job());
        }
        m.health_check_all();
        assert!(matches!(
            m.endpoint_state(&id),
            Ok(CircuitState::Unhealthy)
        ));

        // Flood of successes brings the error rate back down
        for _ in 0_i32..90_i32 {
            let _ = m.execute_request(&id, ok_job());
        }
        m.health_check_all();
        assert!(matches!(m.endpoint_state(&id), Ok(CircuitState::Healthy)));
    }

    #[test]
    fn test_scaling_recommendations() {
        let m = manager();
        let mut config = EndpointConfig::from_route("/api/data", "GET", &m.defaults);
        config.rate_limit_rpm = 10;
        let id = config.id.clone();
        assert!(m.register_endpoint(config).is_ok());
        register(&m, "/idle/endpoint");

        for _ in 0_i32..9_i32 {
            let _ = m.execute_request(&id, ok_job());
        }

        let recs = m.scaling_recommendations();
        assert_eq!(recs.len(), 2);
        let busy = recs.iter().find(|r| r.endpoint_id == id);
        match busy {
            Some(rec) => {
                assert_eq!(rec.action, ScalingAction::ScaleUp);
                assert!((rec.utilization_pct - 90.0).abs() < f64::EPSILON);
            }
            None => panic!("missing recommendation"),
        }
        let idle = recs.iter().find(|r| r.endpoint_id.as_str() == "idle_endpoint");
        assert!(idle.is_some_and(|r| r.action == ScalingAction::ScaleDown));
    }

    #[test]
    fn test_empty_health_report() {
        let m = manager();
        let report = m.health_report();
        assert_eq!(report.summary.total_endpoints, 0);
        assert!((report.summary.health_pct - 100.0).abs() < f64::EPSILON);
    }
}
