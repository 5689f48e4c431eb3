//! Turnstile Core Prelude
//!
//! Common imports for the runtime. Import this module to get access to the
//! most commonly used types and traits.

// Re-export core types
pub use crate::config::{
    AnalyticsConfig, CoreConfig, EndpointDefaults, EndpointManagerConfig, PoolManagerConfig,
};
pub use crate::error::{AnalyticsError, CoreError, CoreResult, EndpointError, PoolError};
pub use crate::types::{
    ConnectionHandle, EndpointId, Job, JobFn, Priority, RequestId, ResourceType,
    ScalingRecommendation,
};

// Re-export subsystem entry points
pub use crate::analytics::{AnalyticsEngine, DashboardReport, LoadPrediction};
pub use crate::endpoint::{
    CircuitState, EndpointConfig, EndpointManager, ExecutionReport, ExecutionStatus,
};
pub use crate::pool::{RequestTicket, ResourcePoolManager, ResourceStatusReport};
pub use crate::{init, init_with_config, RuntimeInstance};

// Re-export commonly used external types
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};
pub use tracing::{debug, error, info, warn};

// Re-export performance types
pub use dashmap::DashMap;
pub use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// Re-export validation
pub use garde::Validate;

/// Common result type alias
pub type Result<T> = CoreResult<T>;
