//! Turnstile Core - Resource Governance and Request Admission Runtime
//!
//! This crate provides endpoint-level admission control for request-serving
//! platforms: circuit breakers and sliding-window rate limits per endpoint,
//! priority-tiered worker pools over reusable connections, and a request
//! analytics pipeline with load forecasting and anomaly detection.
//!
//! # Architecture
//!
//! The runtime is organized into three subsystems:
//!
//! - [`endpoint`] - Endpoint registry, circuit breakers, rate limits, health
//! - [`pool`] - Connection pools, priority worker tiers, auto-scaling
//! - [`analytics`] - Metrics time series, load prediction, anomaly alerts
//!
//! # Example
//!
//! ```rust
//! use turnstile_core::{init_with_config, CoreConfig, CoreResult};
//!
//! fn main() -> CoreResult<()> {
//!     let config = CoreConfig::test()?;
//!     let runtime = init_with_config(config)?;
//!     let discovered = runtime
//!         .endpoints()
//!         .auto_discover_endpoints(&[("/api/signal", "GET")]);
//!     assert_eq!(discovered.len(), 1);
//!     // In production, call runtime.start() and runtime.stop()
//!     Ok(())
//! }
//! ```

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::large_stack_arrays,
    clippy::indexing_slicing,
    missing_docs
)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::correctness,
    clippy::suspicious,
    clippy::perf,
    clippy::style,
    clippy::complexity,
    clippy::unreachable,
    clippy::default_numeric_fallback,
    clippy::redundant_pattern_matching,
    clippy::manual_let_else,
    clippy::unnecessary_wraps,
    clippy::needless_pass_by_ref_mut,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::float_cmp,
    clippy::disallowed_methods
)]
#![allow(clippy::multiple_crate_versions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod analytics;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod types;

use std::sync::Arc;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use types::{EndpointId, Job, JobFn, Priority, RequestId, ResourceType};

pub use analytics::AnalyticsEngine;
pub use endpoint::{EndpointConfig, EndpointManager, ExecutionReport};
pub use pool::ResourcePoolManager;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the runtime with default configuration
///
/// # Errors
///
/// Returns error if the default configuration fails validation.
///
/// # Example
///
/// ```rust
/// use turnstile_core::init;
///
/// fn main() -> turnstile_core::CoreResult<()> {
///     let runtime = init()?;
///     assert!(!runtime.is_running());
///     Ok(())
/// }
/// ```
pub fn init() -> CoreResult<RuntimeInstance> {
    RuntimeInstance::new(CoreConfig::default())
}

/// Initialize the runtime with custom configuration
///
/// # Errors
///
/// Returns error if the configuration is invalid.
pub fn init_with_config(config: CoreConfig) -> CoreResult<RuntimeInstance> {
    RuntimeInstance::new(config)
}

/// Composed runtime: endpoint manager, resource pools and analytics wired
/// together.
///
/// Subsystems are created unstarted; [`Self::start`] spawns their background
/// threads and [`Self::stop`] joins them in reverse order.
pub struct RuntimeInstance {
    config: CoreConfig,
    pools: Arc<ResourcePoolManager>,
    analytics: Arc<AnalyticsEngine>,
    endpoints: Arc<EndpointManager>,
}

impl RuntimeInstance {
    /// Create a runtime from configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration validation fails.
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;

        let pools = Arc::new(ResourcePoolManager::new(config.pools.clone()));
        let analytics = Arc::new(AnalyticsEngine::new(config.analytics.clone()));
        let endpoints = Arc::new(
            EndpointManager::new(
                config.endpoints.clone(),
                config::EndpointDefaults::default(),
            )
            .with_pool_manager(Arc::clone(&pools))
            .with_analytics(Arc::clone(&analytics)),
        );

        Ok(Self {
            config,
            pools,
            analytics,
            endpoints,
        })
    }

    /// Get configuration
    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Endpoint manager handle
    #[must_use]
    pub fn endpoints(&self) -> Arc<EndpointManager> {
        Arc::clone(&self.endpoints)
    }

    /// Resource pool manager handle
    #[must_use]
    pub fn pools(&self) -> Arc<ResourcePoolManager> {
        Arc::clone(&self.pools)
    }

    /// Analytics engine handle
    #[must_use]
    pub fn analytics(&self) -> Arc<AnalyticsEngine> {
        Arc::clone(&self.analytics)
    }

    /// Start all subsystem background threads
    ///
    /// # Errors
    ///
    /// Returns error if any subsystem fails to start.
    pub fn start(&self) -> CoreResult<()> {
        tracing::info!("Starting Turnstile Core v{VERSION}");

        self.pools.start()?;
        self.analytics.start()?;
        self.endpoints.start()?;

        tracing::info!("Turnstile Core started");
        Ok(())
    }

    /// Stop all subsystems in reverse order
    pub fn stop(&self) {
        tracing::info!("Stopping Turnstile Core");

        self.endpoints.stop();
        self.analytics.stop();
        self.pools.stop();

        tracing::info!("Turnstile Core stopped");
    }

    /// Whether all subsystems are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.endpoints.is_running() && self.pools.is_running() && self.analytics.is_running()
    }
}
