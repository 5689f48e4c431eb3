//! `Turnstile` Core Configuration System
//!
//! Production-ready configuration with validation. Defaults mirror the
//! deployed sizing: four resource pools, four worker tiers, a 1000-slot
//! admission queue and a 10,000-event analytics buffer.

use crate::error::{CoreError, CoreResult};
use crate::types::{Priority, ResourceType};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Core configuration for the `Turnstile` runtime
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CoreConfig {
    /// Endpoint manager configuration
    #[garde(dive)]
    pub endpoints: EndpointManagerConfig,

    /// Resource pool manager configuration
    #[garde(dive)]
    pub pools: PoolManagerConfig,

    /// Analytics engine configuration
    #[garde(dive)]
    pub analytics: AnalyticsConfig,
}

/// Endpoint manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EndpointManagerConfig {
    /// Health evaluation interval (seconds)
    #[garde(range(min = 1, max = 3600))]
    pub health_interval_s: u64,

    /// Error rate above which an endpoint is marked unhealthy (percent)
    #[garde(range(min = 1.0_f64, max = 100.0_f64))]
    pub unhealthy_error_rate_pct: f64,

    /// Error rate above which an endpoint is marked degraded (percent)
    #[garde(range(min = 0.1_f64, max = 100.0_f64))]
    pub degraded_error_rate_pct: f64,

    /// Average latency above which an endpoint is marked degraded (ms)
    #[garde(range(min = 1.0_f64, max = 600_000.0_f64))]
    pub degraded_latency_ms: f64,

    /// Rate-limit utilization above which scale-up is recommended (percent)
    #[garde(range(min = 1.0_f64, max = 100.0_f64))]
    pub scale_up_utilization_pct: f64,

    /// Rate-limit utilization below which scale-down is recommended (percent)
    #[garde(range(min = 0.0_f64, max = 100.0_f64))]
    pub scale_down_utilization_pct: f64,
}

/// Per-endpoint defaults applied at registration when not overridden
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EndpointDefaults {
    /// Maximum concurrent requests
    #[garde(range(min = 1, max = 10_000))]
    pub max_concurrent_requests: u32,

    /// Request timeout (seconds)
    #[garde(range(min = 1, max = 600))]
    pub timeout_s: u64,

    /// Circuit breaker failure threshold
    #[garde(range(min = 1, max = 1000))]
    pub circuit_breaker_threshold: u32,

    /// Circuit breaker recovery timeout (seconds)
    #[garde(range(min = 1, max = 3600))]
    pub circuit_breaker_timeout_s: u64,

    /// Rate limit (requests per minute)
    #[garde(range(min = 1, max = 1_000_000))]
    pub rate_limit_rpm: u32,

    /// Cache TTL (seconds)
    #[garde(range(min = 0, max = 86_400))]
    pub cache_ttl_s: u64,
}

/// Resource pool manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolManagerConfig {
    /// Admission queue capacity; requests beyond this are rejected
    #[garde(range(min = 1, max = 1_000_000))]
    pub queue_capacity: usize,

    /// Connection pool sizing per resource class
    #[garde(length(min = 1))]
    pub pools: Vec<PoolSizing>,

    /// Worker threads per priority tier
    #[garde(dive)]
    pub workers: WorkerTierConfig,

    /// Idle timeout after which pooled connections are recycled (seconds)
    #[garde(range(min = 1, max = 86_400))]
    pub idle_timeout_s: u64,

    /// Pool maintenance interval (seconds)
    #[garde(range(min = 1, max = 3600))]
    pub maintenance_interval_s: u64,

    /// System sampling interval (seconds)
    #[garde(range(min = 1, max = 3600))]
    pub monitor_interval_s: u64,

    /// Enable automatic pool scaling. Off by default; the monitor only
    /// reports until this is switched on.
    #[garde(skip)]
    pub auto_scaling_enabled: bool,
}

/// Sizing for one connection pool
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolSizing {
    /// Resource class
    #[garde(skip)]
    pub resource: ResourceType,

    /// Minimum pooled connections, kept warm by maintenance
    #[garde(range(min = 0, max = 1000))]
    pub min_connections: usize,

    /// Maximum pooled connections
    #[garde(range(min = 1, max = 1000))]
    pub max_connections: usize,
}

/// Worker thread counts per priority tier
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WorkerTierConfig {
    /// Workers dedicated to critical requests
    #[garde(range(min = 1, max = 256))]
    pub critical: usize,

    /// Workers dedicated to high-priority requests
    #[garde(range(min = 1, max = 256))]
    pub high: usize,

    /// Workers dedicated to medium-priority requests
    #[garde(range(min = 1, max = 256))]
    pub medium: usize,

    /// Workers dedicated to low-priority requests
    #[garde(range(min = 1, max = 256))]
    pub low: usize,
}

impl WorkerTierConfig {
    /// Worker count for a tier
    #[must_use]
    pub const fn for_priority(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    /// Total workers across tiers
    #[must_use]
    pub const fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }
}

/// Analytics engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnalyticsConfig {
    /// Event buffer capacity; oldest events are dropped beyond this
    #[garde(range(min = 100, max = 10_000_000))]
    pub event_buffer_capacity: usize,

    /// Batch processor interval (milliseconds)
    #[garde(range(min = 100, max = 60_000))]
    pub batch_interval_ms: u64,

    /// Maximum events drained per batch
    #[garde(range(min = 1, max = 100_000))]
    pub batch_size: usize,

    /// Minute-resolution points retained per metric (1440 = 24h)
    #[garde(range(min = 60, max = 100_000))]
    pub time_series_capacity: usize,

    /// Hourly load samples retained per endpoint (168 = 7 days)
    #[garde(range(min = 24, max = 10_000))]
    pub hourly_history_capacity: usize,

    /// Minimum hourly samples before predictions are produced
    #[garde(range(min = 1, max = 1000))]
    pub min_prediction_samples: usize,

    /// Prediction cache TTL (seconds)
    #[garde(range(min = 1, max = 3600))]
    pub prediction_cache_ttl_s: u64,

    /// Anomaly alert history capacity
    #[garde(range(min = 10, max = 100_000))]
    pub anomaly_history_capacity: usize,
}

impl EndpointDefaults {
    /// Request timeout as a [`Duration`]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

impl Default for EndpointManagerConfig {
    fn default() -> Self {
        Self {
            health_interval_s: 30,
            unhealthy_error_rate_pct: 50.0,
            degraded_error_rate_pct: 20.0,
            degraded_latency_ms: 5000.0,
            scale_up_utilization_pct: 80.0,
            scale_down_utilization_pct: 30.0,
        }
    }
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 50,
            timeout_s: 30,
            circuit_breaker_threshold: 10,
            circuit_breaker_timeout_s: 60,
            rate_limit_rpm: 120,
            cache_ttl_s: 300,
        }
    }
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            pools: vec![
                PoolSizing {
                    resource: ResourceType::Database,
                    min_connections: 10,
                    max_connections: 50,
                },
                PoolSizing {
                    resource: ResourceType::ExternalApi,
                    min_connections: 5,
                    max_connections: 30,
                },
                PoolSizing {
                    resource: ResourceType::Cache,
                    min_connections: 3,
                    max_connections: 20,
                },
                PoolSizing {
                    resource: ResourceType::InternalApi,
                    min_connections: 5,
                    max_connections: 40,
                },
            ],
            workers: WorkerTierConfig {
                critical: 10,
                high: 15,
                medium: 20,
                low: 10,
            },
            idle_timeout_s: 300,
            maintenance_interval_s: 60,
            monitor_interval_s: 10,
            auto_scaling_enabled: false,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            event_buffer_capacity: 10_000,
            batch_interval_ms: 1000,
            batch_size: 100,
            time_series_capacity: 1440,
            hourly_history_capacity: 168,
            min_prediction_samples: 24,
            prediction_cache_ttl_s: 300,
            anomaly_history_capacity: 100,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointManagerConfig::default(),
            pools: PoolManagerConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Configuration for tests: tiny pools, short intervals, one worker per
    /// tier so scheduling is deterministic.
    ///
    /// # Errors
    ///
    /// Returns error if the assembled configuration fails validation.
    pub fn test() -> CoreResult<Self> {
        let config = Self {
            endpoints: EndpointManagerConfig {
                health_interval_s: 1,
                ..EndpointManagerConfig::default()
            },
            pools: PoolManagerConfig {
                queue_capacity: 100,
                pools: vec![
                    PoolSizing {
                        resource: ResourceType::Database,
                        min_connections: 1,
                        max_connections: 3,
                    },
                    PoolSizing {
                        resource: ResourceType::Cache,
                        min_connections: 1,
                        max_connections: 2,
                    },
                ],
                workers: WorkerTierConfig {
                    critical: 1,
                    high: 1,
                    medium: 1,
                    low: 1,
                },
                idle_timeout_s: 5,
                maintenance_interval_s: 1,
                monitor_interval_s: 1,
                auto_scaling_enabled: false,
            },
            analytics: AnalyticsConfig {
                event_buffer_capacity: 100,
                batch_interval_ms: 100,
                batch_size: 10,
                hourly_history_capacity: 48,
                min_prediction_samples: 3,
                prediction_cache_ttl_s: 1,
                anomaly_history_capacity: 20,
                ..AnalyticsConfig::default()
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, with `TURNSTILE_*` environment
    /// variables layered on top (e.g. `TURNSTILE_POOLS__QUEUE_CAPACITY`).
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &str) -> CoreResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CoreError::config(format!("failed to load {path}: {e}")))?;

        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| CoreError::config(format!("invalid configuration in {path}: {e}")))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Render the default configuration as TOML, for scaffolding a config
    /// file on first deployment.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn default_toml() -> CoreResult<String> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| CoreError::config(format!("failed to render defaults: {e}")))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration validation fails.
    pub fn validate(&self) -> CoreResult<()> {
        garde::Validate::validate(self, &())
            .map_err(|e| CoreError::validation("config", format!("Validation failed: {e}")))?;

        for sizing in &self.pools.pools {
            if sizing.min_connections > sizing.max_connections {
                return Err(CoreError::validation(
                    "pools",
                    format!(
                        "{}: min_connections {} exceeds max_connections {}",
                        sizing.resource, sizing.min_connections, sizing.max_connections
                    ),
                ));
            }
        }

        if self.endpoints.degraded_error_rate_pct >= self.endpoints.unhealthy_error_rate_pct {
            return Err(CoreError::validation(
                "endpoints",
                "degraded_error_rate_pct must be below unhealthy_error_rate_pct",
            ));
        }

        if self.endpoints.scale_down_utilization_pct >= self.endpoints.scale_up_utilization_pct {
            return Err(CoreError::validation(
                "endpoints",
                "scale_down_utilization_pct must be below scale_up_utilization_pct",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_test_config_is_valid() {
        let config = CoreConfig::test();
        assert!(config.is_ok());
    }

    #[test]
    fn test_default_pool_sizing() {
        let config = PoolManagerConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.pools.len(), 4);
        let db = config
            .pools
            .iter()
            .find(|p| p.resource == ResourceType::Database);
        assert!(db.is_some_and(|p| p.min_connections == 10 && p.max_connections == 50));
        assert!(!config.auto_scaling_enabled);
    }

    #[test]
    fn test_worker_tier_lookup() {
        let workers = PoolManagerConfig::default().workers;
        assert_eq!(workers.for_priority(Priority::Critical), 10);
        assert_eq!(workers.for_priority(Priority::High), 15);
        assert_eq!(workers.for_priority(Priority::Medium), 20);
        assert_eq!(workers.for_priority(Priority::Low), 10);
        assert_eq!(workers.total(), 55);
    }

    #[test]
    fn test_invalid_pool_sizing_rejected() {
        let mut config = CoreConfig::default();
        config.pools.pools[0].min_connections = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_health_thresholds_rejected() {
        let mut config = CoreConfig::default();
        config.endpoints.degraded_error_rate_pct = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_round_trip() {
        let rendered = CoreConfig::default_toml().unwrap();
        assert!(rendered.contains("queue_capacity"));

        let parsed: CoreConfig = toml::from_str(&rendered).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.pools.queue_capacity, 1000);
    }
}
