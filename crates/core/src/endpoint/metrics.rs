//! Per-Endpoint Request Metrics
//!
//! Cumulative counters plus capped rings of recent latencies and error
//! descriptions. Derived statistics (average, p95, error rate) are computed
//! over the rings, so they reflect recent behavior rather than all time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const LATENCY_RING_CAPACITY: usize = 100;
const ERROR_RING_CAPACITY: usize = 20;

/// Point-in-time snapshot of one endpoint's metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total requests observed
    pub total_requests: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Average latency over the recent ring (ms)
    pub avg_latency_ms: f64,
    /// 95th percentile latency over the recent ring (ms)
    pub p95_latency_ms: f64,
    /// Failure percentage over all requests
    pub error_rate_pct: f64,
    /// Most recent error descriptions, oldest first
    pub recent_errors: Vec<String>,
}

#[derive(Debug, Default)]
struct MetricsRings {
    latencies_ms: VecDeque<f64>,
    errors: VecDeque<String>,
    last_access: Option<Instant>,
}

/// Request metrics for one endpoint
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rings: Mutex<MetricsRings>,
}

impl EndpointMetrics {
    /// Create empty metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request
    pub fn record_request(&self, latency_ms: f64, success: bool, error: Option<&str>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        let mut rings = self.rings.lock();
        if rings.latencies_ms.len() == LATENCY_RING_CAPACITY {
            rings.latencies_ms.pop_front();
        }
        rings.latencies_ms.push_back(latency_ms);

        if let Some(message) = error {
            if rings.errors.len() == ERROR_RING_CAPACITY {
                rings.errors.pop_front();
            }
            rings.errors.push_back(message.to_string());
        }

        rings.last_access = Some(Instant::now());
    }

    /// Mark the endpoint as touched without a completed request
    pub fn touch(&self) {
        self.rings.lock().last_access = Some(Instant::now());
    }

    /// Total requests observed
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Successful requests observed
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    /// Failed requests observed
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Average latency over the recent ring (ms)
    pub fn avg_latency_ms(&self) -> f64 {
        let rings = self.rings.lock();
        if rings.latencies_ms.is_empty() {
            return 0.0_f64;
        }
        let count = u32::try_from(rings.latencies_ms.len()).unwrap_or(u32::MAX);
        rings.latencies_ms.iter().sum::<f64>() / f64::from(count)
    }

    /// 95th percentile latency over the recent ring (ms)
    pub fn p95_latency_ms(&self) -> f64 {
        let rings = self.rings.lock();
        if rings.latencies_ms.is_empty() {
            return 0.0_f64;
        }

        let mut sorted: Vec<f64> = rings.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = (sorted.len() * 95).div_ceil(100);
        let index = rank.saturating_sub(1).min(sorted.len() - 1);
        sorted[index]
    }

    /// Failure percentage over all requests
    pub fn error_rate_pct(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0_f64;
        }
        let failed = self.failed_requests.load(Ordering::Relaxed);
        f64::from(u32::try_from(failed).unwrap_or(u32::MAX))
            / f64::from(u32::try_from(total).unwrap_or(u32::MAX))
            * 100.0_f64
    }

    /// Seconds since the endpoint was last touched, if ever
    pub fn idle_seconds(&self) -> Option<u64> {
        self.rings
            .lock()
            .last_access
            .map(|at| at.elapsed().as_secs())
    }

    /// Snapshot for reports
    pub fn snapshot(&self) -> MetricsSnapshot {
        let recent_errors = {
            let rings = self.rings.lock();
            rings.errors.iter().cloned().collect()
        };
        MetricsSnapshot {
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            avg_latency_ms: self.avg_latency_ms(),
            p95_latency_ms: self.p95_latency_ms(),
            error_rate_pct: self.error_rate_pct(),
            recent_errors,
        }
    }
}
