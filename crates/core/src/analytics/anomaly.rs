//! Anomaly Detector
//!
//! Maintains exponential-moving-average baselines per endpoint for
//! latency, traffic and error rate, and flags observations that deviate
//! sharply from them.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::EndpointId;

/// EMA smoothing factor
const BASELINE_ALPHA: f64 = 0.1_f64;
/// Latency above this multiple of baseline is anomalous
const LATENCY_SPIKE_FACTOR: f64 = 3.0_f64;
/// Error rate above twice baseline plus this margin is anomalous
const ERROR_RATE_MARGIN_PCT: f64 = 5.0_f64;
const ERROR_RATE_SPIKE_FACTOR: f64 = 2.0_f64;
/// Traffic above this multiple of baseline is anomalous
const TRAFFIC_SPIKE_FACTOR: f64 = 5.0_f64;

/// Kind of deviation detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Response time far above baseline
    LatencySpike,
    /// Error rate far above baseline
    ErrorRateSpike,
    /// Request volume far above baseline
    TrafficSpike,
}

impl AnomalyKind {
    /// Stable string form for logs and reports
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LatencySpike => "latency_spike",
            Self::ErrorRateSpike => "error_rate_spike",
            Self::TrafficSpike => "traffic_spike",
        }
    }
}

/// Alert severity, ordered from least to most serious
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Low,
    /// Worth watching
    Medium,
    /// Needs attention
    High,
    /// Needs immediate attention
    Critical,
}

/// One detected anomaly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    /// Endpoint the observation came from
    pub endpoint_id: String,
    /// What deviated
    pub kind: AnomalyKind,
    /// How serious the deviation is
    pub severity: Severity,
    /// Observed value
    pub current_value: f64,
    /// Baseline it was compared against
    pub baseline_value: f64,
    /// Detection time
    pub detected_at: DateTime<Utc>,
}

/// One batch-window observation for an endpoint
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// Mean response time in the window
    pub avg_latency_ms: f64,
    /// Requests per minute in the window
    pub requests_per_min: f64,
    /// Error percentage in the window
    pub error_rate_pct: f64,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    avg_latency_ms: f64,
    requests_per_min: f64,
    error_rate_pct: f64,
}

impl Baseline {
    const fn seed(observation: Observation) -> Self {
        Self {
            avg_latency_ms: observation.avg_latency_ms,
            requests_per_min: observation.requests_per_min,
            error_rate_pct: observation.error_rate_pct,
        }
    }

    fn absorb(&mut self, observation: Observation) {
        self.avg_latency_ms = ema(self.avg_latency_ms, observation.avg_latency_ms);
        self.requests_per_min = ema(self.requests_per_min, observation.requests_per_min);
        self.error_rate_pct = ema(self.error_rate_pct, observation.error_rate_pct);
    }
}

fn ema(previous: f64, current: f64) -> f64 {
    BASELINE_ALPHA * current + (1.0_f64 - BASELINE_ALPHA) * previous
}

/// EMA-baseline anomaly detector
#[derive(Debug)]
pub struct AnomalyDetector {
    history_capacity: usize,
    baselines: Mutex<HashMap<EndpointId, Baseline>>,
    history: Mutex<VecDeque<AnomalyAlert>>,
}

impl AnomalyDetector {
    /// Create detector retaining `history_capacity` alerts
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history_capacity,
            baselines: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Compare an observation against the endpoint's baseline, then fold
    /// it in. The first observation only seeds the baseline.
    pub fn observe(&self, endpoint_id: &EndpointId, observation: Observation) -> Vec<AnomalyAlert> {
        let mut baselines = self.baselines.lock();
        let Some(baseline) = baselines.get_mut(endpoint_id) else {
            baselines.insert(endpoint_id.clone(), Baseline::seed(observation));
            return Vec::new();
        };

        let alerts = Self::detect(endpoint_id, observation, *baseline);
        baseline.absorb(observation);
        drop(baselines);

        if !alerts.is_empty() {
            let mut history = self.history.lock();
            for alert in &alerts {
                warn!(
                    endpoint = %alert.endpoint_id,
                    kind = alert.kind.as_str(),
                    current = alert.current_value,
                    baseline = alert.baseline_value,
                    "Anomaly detected"
                );
                history.push_back(alert.clone());
                if history.len() > self.history_capacity {
                    history.pop_front();
                }
            }
        }
        alerts
    }

    /// Most recent alerts, newest last, at most `limit`
    pub fn recent_alerts(&self, limit: usize) -> Vec<AnomalyAlert> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Total alerts retained
    pub fn alert_count(&self) -> usize {
        self.history.lock().len()
    }

    fn detect(
        endpoint_id: &EndpointId,
        observation: Observation,
        baseline: Baseline,
    ) -> Vec<AnomalyAlert> {
        let now = Utc::now();
        let mut alerts = Vec::new();

        if baseline.avg_latency_ms > 0.0_f64
            && observation.avg_latency_ms > baseline.avg_latency_ms * LATENCY_SPIKE_FACTOR
        {
            alerts.push(AnomalyAlert {
                endpoint_id: endpoint_id.to_string(),
                kind: AnomalyKind::LatencySpike,
                severity: Severity::High,
                current_value: observation.avg_latency_ms,
                baseline_value: baseline.avg_latency_ms,
                detected_at: now,
            });
        }

        let error_threshold =
            baseline.error_rate_pct * ERROR_RATE_SPIKE_FACTOR + ERROR_RATE_MARGIN_PCT;
        if observation.error_rate_pct > error_threshold {
            alerts.push(AnomalyAlert {
                endpoint_id: endpoint_id.to_string(),
                kind: AnomalyKind::ErrorRateSpike,
                severity: Severity::Critical,
                current_value: observation.error_rate_pct,
                baseline_value: baseline.error_rate_pct,
                detected_at: now,
            });
        }

        if baseline.requests_per_min > 0.0_f64
            && observation.requests_per_min > baseline.requests_per_min * TRAFFIC_SPIKE_FACTOR
        {
            alerts.push(AnomalyAlert {
                endpoint_id: endpoint_id.to_string(),
                kind: AnomalyKind::TrafficSpike,
                severity: Severity::Medium,
                current_value: observation.requests_per_min,
                baseline_value: baseline.requests_per_min,
                detected_at: now,
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;

    fn normal() -> Observation {
        Observation {
            avg_latency_ms: 100.0,
            requests_per_min: 60.0,
            error_rate_pct: 1.0,
        }
    }

    fn warm(detector: &AnomalyDetector, id: &EndpointId, rounds: usize) {
        for _ in 0..rounds {
            let alerts = detector.observe(id, normal());
            assert!(alerts.is_empty());
        }
    }

    #[test]
    fn test_first_observation_seeds_quietly() {
        let detector = AnomalyDetector::new(100);
        let id = EndpointId::from("api_signal");
        let alerts = detector.observe(
            &id,
            Observation {
                avg_latency_ms: 9999.0,
                requests_per_min: 9999.0,
                error_rate_pct: 99.0,
            },
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_latency_spike_threshold() {
        let detector = AnomalyDetector::new(100);
        let id = EndpointId::from("api_signal");
        warm(&detector, &id, 5);

        // Baseline latency is 100ms; threshold is 3x = 300ms
        let mut below = normal();
        below.avg_latency_ms = 299.0;
        assert!(detector.observe(&id, below).is_empty());

        let detector = AnomalyDetector::new(100);
        warm(&detector, &id, 5);
        let mut spiked = normal();
        spiked.avg_latency_ms = 350.0;
        let alerts = detector.observe(&id, spiked);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AnomalyKind::LatencySpike);
        assert_eq!(alerts[0].severity, Severity::High);
    }

    #[test]
    fn test_error_rate_spike_threshold() {
        let detector = AnomalyDetector::new(100);
        let id = EndpointId::from("api_data");
        warm(&detector, &id, 5);

        // Baseline error rate is 1%; threshold is 2 * 1 + 5 = 7%
        let mut below = normal();
        below.error_rate_pct = 6.9;
        assert!(detector.observe(&id, below).is_empty());

        let detector = AnomalyDetector::new(100);
        warm(&detector, &id, 5);
        let mut above = normal();
        above.error_rate_pct = 7.5;
        let alerts = detector.observe(&id, above);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AnomalyKind::ErrorRateSpike);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_traffic_spike() {
        let detector = AnomalyDetector::new(100);
        let id = EndpointId::from("api_market");
        warm(&detector, &id, 5);

        let mut spiked = normal();
        spiked.requests_per_min = 400.0;
        let alerts = detector.observe(&id, spiked);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AnomalyKind::TrafficSpike);
        assert_eq!(alerts[0].severity, Severity::Medium);
    }

    #[test]
    fn test_history_capped() {
        let detector = AnomalyDetector::new(3);
        let id = EndpointId::from("api_signal");
        warm(&detector, &id, 2);

        for _ in 0..6 {
            let mut spiked = normal();
            spiked.requests_per_min = 100_000.0;
            detector.observe(&id, spiked);
            // Settle the baseline back down with normal traffic
            detector.observe(&id, normal());
        }
        assert!(detector.alert_count() <= 3);
        assert!(detector.recent_alerts(10).len() <= 3);
    }
}
