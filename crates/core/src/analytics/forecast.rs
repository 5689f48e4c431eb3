//! Predictive Load Analyzer
//!
//! Keeps a week of hourly activity samples per endpoint and predicts the
//! load for a target hour from historically matching hours, adjusted by a
//! short-term linear regression trend. Predictions are cached briefly to
//! keep dashboard queries cheap.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::AnalyticsError;
use crate::types::EndpointId;

/// Matching hour-and-weekday samples are searched this far back
const STRICT_MATCH_LOOKBACK: usize = 48;
/// Hour-only fallback search depth
const RELAXED_MATCH_LOOKBACK: usize = 72;
/// Samples feeding the regression trend
const TREND_WINDOW: usize = 24;
/// Trend factor bounds
const TREND_FACTOR_MIN: f64 = 0.5_f64;
const TREND_FACTOR_MAX: f64 = 2.0_f64;

/// One hour of observed endpoint activity
#[derive(Debug, Clone)]
pub struct HourlySample {
    /// Epoch hour the sample covers
    pub epoch_hour: i64,
    /// Hour of day, 0-23
    pub hour_of_day: u32,
    /// Weekday, Monday = 0
    pub day_of_week: u32,
    /// Requests observed in the hour
    pub requests: f64,
    /// Mean response time in the hour
    pub avg_response_ms: f64,
}

/// Forecast for a single endpoint at a target hour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadPrediction {
    /// Endpoint the forecast covers
    pub endpoint_id: String,
    /// Expected requests in the target hour
    pub predicted_requests: f64,
    /// Expected mean response time
    pub predicted_response_ms: f64,
    /// Confidence percentage, 0-100
    pub confidence_pct: f64,
    /// Historical samples the forecast drew on
    pub samples_used: usize,
    /// Multiplicative short-term trend applied
    pub trend_factor: f64,
}

#[derive(Debug, Default)]
struct EndpointHistory {
    samples: VecDeque<HourlySample>,
    open_hour: Option<OpenHour>,
}

#[derive(Debug)]
struct OpenHour {
    epoch_hour: i64,
    requests: f64,
    response_sum_ms: f64,
    response_count: f64,
}

#[derive(Debug, Clone)]
struct CachedPrediction {
    prediction: LoadPrediction,
    cached_at: std::time::Instant,
}

/// Hour-of-week load forecaster
#[derive(Debug)]
pub struct PredictiveLoadAnalyzer {
    history_capacity: usize,
    min_samples: usize,
    cache_ttl: Duration,
    histories: Mutex<HashMap<EndpointId, EndpointHistory>>,
    cache: Mutex<HashMap<(EndpointId, i64), CachedPrediction>>,
}

impl PredictiveLoadAnalyzer {
    /// Create analyzer keeping `history_capacity` hourly samples per endpoint
    #[must_use]
    pub fn new(history_capacity: usize, min_samples: usize, cache_ttl: Duration) -> Self {
        Self {
            history_capacity,
            min_samples,
            cache_ttl,
            histories: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fold activity into the endpoint's current hour bucket. A new hour
    /// rolls the previous bucket into history.
    pub fn record_activity(
        &self,
        endpoint_id: &EndpointId,
        requests: f64,
        avg_response_ms: f64,
        at: DateTime<Utc>,
    ) {
        let epoch_hour = at.timestamp() / 3600;
        let mut histories = self.histories.lock();
        let history = histories.entry(endpoint_id.clone()).or_default();

        match history.open_hour.as_mut() {
            Some(open) if open.epoch_hour == epoch_hour => {
                open.requests += requests;
                open.response_sum_ms += avg_response_ms * requests;
                open.response_count += requests;
            }
            _ => {
                let replaced = history.open_hour.replace(OpenHour {
                    epoch_hour,
                    requests,
                    response_sum_ms: avg_response_ms * requests,
                    response_count: requests,
                });
                if let Some(open) = replaced {
                    Self::roll_hour(history, &open, self.history_capacity);
                }
            }
        }
    }

    /// Record a complete hourly sample directly. Used by tests and by
    /// backfill paths that already have per-hour aggregates.
    pub fn record_hourly(
        &self,
        endpoint_id: &EndpointId,
        requests: f64,
        avg_response_ms: f64,
        at: DateTime<Utc>,
    ) {
        let sample = HourlySample {
            epoch_hour: at.timestamp() / 3600,
            hour_of_day: at.hour(),
            day_of_week: at.weekday().num_days_from_monday(),
            requests,
            avg_response_ms,
        };
        let mut histories = self.histories.lock();
        let history = histories.entry(endpoint_id.clone()).or_default();
        history.samples.push_back(sample);
        while history.samples.len() > self.history_capacity {
            history.samples.pop_front();
        }
        drop(histories);
        self.invalidate(endpoint_id);
    }

    /// Predict load for `endpoint_id` at the hour containing `at`
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::InsufficientData`] when fewer than the
    /// configured minimum samples exist or no comparable hour is found.
    pub fn predict_load(
        &self,
        endpoint_id: &EndpointId,
        at: DateTime<Utc>,
    ) -> Result<LoadPrediction, AnalyticsError> {
        let epoch_hour = at.timestamp() / 3600;
        let cache_key = (endpoint_id.clone(), epoch_hour);

        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(&cache_key) {
                if cached.cached_at.elapsed() < self.cache_ttl {
                    return Ok(cached.prediction.clone());
                }
            }
        }

        let prediction = self.compute_prediction(endpoint_id, at)?;

        let mut cache = self.cache.lock();
        cache.insert(
            cache_key,
            CachedPrediction {
                prediction: prediction.clone(),
                cached_at: std::time::Instant::now(),
            },
        );
        Ok(prediction)
    }

    /// Endpoints with at least one recorded sample
    pub fn tracked_endpoints(&self) -> Vec<EndpointId> {
        let histories = self.histories.lock();
        histories
            .iter()
            .filter(|(_, history)| !history.samples.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of hourly samples held for `endpoint_id`
    pub fn sample_count(&self, endpoint_id: &EndpointId) -> usize {
        let histories = self.histories.lock();
        histories
            .get(endpoint_id)
            .map_or(0, |history| history.samples.len())
    }

    fn compute_prediction(
        &self,
        endpoint_id: &EndpointId,
        at: DateTime<Utc>,
    ) -> Result<LoadPrediction, AnalyticsError> {
        let target_hour = at.hour();
        let target_weekday = at.weekday().num_days_from_monday();

        let histories = self.histories.lock();
        let Some(history) = histories.get(endpoint_id) else {
            return Err(AnalyticsError::InsufficientData {
                endpoint_id: endpoint_id.to_string(),
                samples: 0,
                required: self.min_samples,
            });
        };
        let samples = &history.samples;

        if samples.len() < self.min_samples {
            return Err(AnalyticsError::InsufficientData {
                endpoint_id: endpoint_id.to_string(),
                samples: samples.len(),
                required: self.min_samples,
            });
        }

        let strict: Vec<&HourlySample> = samples
            .iter()
            .rev()
            .take(STRICT_MATCH_LOOKBACK)
            .filter(|s| s.hour_of_day == target_hour && s.day_of_week == target_weekday)
            .collect();

        let matches = if strict.is_empty() {
            samples
                .iter()
                .rev()
                .take(RELAXED_MATCH_LOOKBACK)
                .filter(|s| s.hour_of_day == target_hour)
                .collect()
        } else {
            strict
        };

        if matches.is_empty() {
            return Err(AnalyticsError::InsufficientData {
                endpoint_id: endpoint_id.to_string(),
                samples: 0,
                required: 1,
            });
        }

        let match_count = u32::try_from(matches.len()).unwrap_or(u32::MAX);
        let base_requests =
            matches.iter().map(|s| s.requests).sum::<f64>() / f64::from(match_count);
        let base_response =
            matches.iter().map(|s| s.avg_response_ms).sum::<f64>() / f64::from(match_count);

        let trend_factor = Self::trend_factor(samples);
        let confidence = (f64::from(match_count) * 10.0_f64).min(100.0_f64);

        Ok(LoadPrediction {
            endpoint_id: endpoint_id.to_string(),
            predicted_requests: (base_requests * trend_factor).max(0.0_f64),
            predicted_response_ms: base_response,
            confidence_pct: confidence,
            samples_used: matches.len(),
            trend_factor,
        })
    }

    /// Least-squares slope over the most recent samples, expressed as a
    /// multiplicative factor around the window mean.
    fn trend_factor(samples: &VecDeque<HourlySample>) -> f64 {
        let recent: Vec<f64> = samples
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .map(|s| s.requests)
            .collect();
        if recent.len() < 2 {
            return 1.0_f64;
        }

        let n = u32::try_from(recent.len()).unwrap_or(u32::MAX);
        let n_f = f64::from(n);
        // recent is newest-first; regress oldest-to-newest
        let values: Vec<f64> = recent.into_iter().rev().collect();
        let mean_x = (n_f - 1.0_f64) / 2.0_f64;
        let mean_y = values.iter().sum::<f64>() / n_f;

        let mut numerator = 0.0_f64;
        let mut denominator = 0.0_f64;
        for (i, value) in values.iter().enumerate() {
            let x = f64::from(u32::try_from(i).unwrap_or(u32::MAX));
            numerator += (x - mean_x) * (value - mean_y);
            denominator += (x - mean_x) * (x - mean_x);
        }
        if denominator <= f64::EPSILON || mean_y <= f64::EPSILON {
            return 1.0_f64;
        }

        let slope = numerator / denominator;
        (1.0_f64 + slope / mean_y).clamp(TREND_FACTOR_MIN, TREND_FACTOR_MAX)
    }

    fn invalidate(&self, endpoint_id: &EndpointId) {
        let mut cache = self.cache.lock();
        cache.retain(|(id, _), _| id != endpoint_id);
    }

    fn roll_hour(history: &mut EndpointHistory, open: &OpenHour, capacity: usize) {
        let avg_response = if open.response_count > 0.0_f64 {
            open.response_sum_ms / open.response_count
        } else {
            0.0_f64
        };
        let hour_start = open.epoch_hour * 3600;
        let at = Utc.timestamp_opt(hour_start, 0).single().unwrap_or_else(Utc::now);
        history.samples.push_back(HourlySample {
            epoch_hour: open.epoch_hour,
            hour_of_day: at.hour(),
            day_of_week: at.weekday().num_days_from_monday(),
            requests: open.requests,
            avg_response_ms: avg_response,
        });
        while history.samples.len() > capacity {
            history.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;
    use chrono::TimeZone;

    fn analyzer() -> PredictiveLoadAnalyzer {
        PredictiveLoadAnalyzer::new(168, 3, Duration::from_secs(300))
    }

    fn hour(day: u32, hour: u32) -> DateTime<Utc> {
        // 2026-06-01 is a Monday
        Utc.with_ymd_and_hms(2026, 6, day, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn test_insufficient_data() {
        let analyzer = analyzer();
        let id = EndpointId::from("api_signal");
        analyzer.record_hourly(&id, 100.0, 20.0, hour(1, 9));

        let err = analyzer.predict_load(&id, hour(8, 9)).unwrap_err();
        assert!(matches!(
            err,
            AnalyticsError::InsufficientData { samples: 1, required: 3, .. }
        ));
    }

    #[test]
    fn test_prediction_from_matching_hours() {
        let analyzer = analyzer();
        let id = EndpointId::from("api_signal");
        // Three Mondays at 09:00 with steady load
        analyzer.record_hourly(&id, 100.0, 20.0, hour(1, 9));
        analyzer.record_hourly(&id, 110.0, 22.0, hour(8, 9));
        analyzer.record_hourly(&id, 120.0, 24.0, hour(15, 9));

        let prediction = analyzer.predict_load(&id, hour(22, 9)).unwrap();
        assert_eq!(prediction.samples_used, 3);
        assert!(prediction.predicted_requests > 0.0);
        assert!((prediction.confidence_pct - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hour_only_fallback() {
        let analyzer = analyzer();
        let id = EndpointId::from("api_data");
        // Samples at 14:00 on Mon/Tue/Wed, prediction for Thursday 14:00
        analyzer.record_hourly(&id, 50.0, 10.0, hour(1, 14));
        analyzer.record_hourly(&id, 60.0, 10.0, hour(2, 14));
        analyzer.record_hourly(&id, 70.0, 10.0, hour(3, 14));

        let prediction = analyzer.predict_load(&id, hour(4, 14)).unwrap();
        assert_eq!(prediction.samples_used, 3);
    }

    #[test]
    fn test_prediction_cached() {
        let analyzer = analyzer();
        let id = EndpointId::from("api_signal");
        for day in [1_u32, 8, 15] {
            analyzer.record_hourly(&id, 100.0, 20.0, hour(day, 9));
        }

        let first = analyzer.predict_load(&id, hour(22, 9)).unwrap();
        let second = analyzer.predict_load(&id, hour(22, 9)).unwrap();
        assert!((first.predicted_requests - second.predicted_requests).abs() < f64::EPSILON);
    }

    #[test]
    fn test_activity_rolls_into_hours() {
        let analyzer = analyzer();
        let id = EndpointId::from("api_data");
        analyzer.record_activity(&id, 10.0, 5.0, hour(1, 9));
        analyzer.record_activity(&id, 20.0, 5.0, hour(1, 9));
        assert_eq!(analyzer.sample_count(&id), 0);

        // New hour rolls the 09:00 bucket
        analyzer.record_activity(&id, 5.0, 5.0, hour(1, 10));
        assert_eq!(analyzer.sample_count(&id), 1);
    }

    #[test]
    fn test_trend_factor_flat() {
        let mut samples = VecDeque::new();
        for i in 0_i64..10_i64 {
            samples.push_back(HourlySample {
                epoch_hour: i,
                hour_of_day: 0,
                day_of_week: 0,
                requests: 50.0,
                avg_response_ms: 10.0,
            });
        }
        let factor = PredictiveLoadAnalyzer::trend_factor(&samples);
        assert!((factor - 1.0).abs() < 1e-9);
    }
}
