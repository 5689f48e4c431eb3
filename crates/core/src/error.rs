//! `Turnstile` Core Error System
//!
//! Production-ready error handling with specific error types for each domain.
//! Admission decisions (circuit open, rate limit, queue full) are modeled as
//! errors so callers can branch on them without string matching.

use std::time::Duration;
use thiserror::Error;

/// Core result type for all operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    Validation {
        /// Field that failed validation
        field: String,
        /// Reason for validation failure
        reason: String,
    },

    /// Circuit breaker rejected the request
    #[error("Circuit open for endpoint: {endpoint_id}")]
    CircuitOpen {
        /// Endpoint whose breaker is open
        endpoint_id: String,
    },

    /// Sliding-window rate limit exceeded
    #[error("Rate limit exceeded for endpoint {endpoint_id}: {limit_rpm} requests/min")]
    RateLimitExceeded {
        /// Endpoint that hit the limit
        endpoint_id: String,
        /// Configured per-minute limit
        limit_rpm: u32,
    },

    /// Admission queue at capacity
    #[error("Admission queue full: {capacity} requests")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// Connection pool exhausted within the deadline
    #[error("Pool acquisition timed out after {waited:?}: {resource}")]
    PoolTimeout {
        /// Resource type of the pool
        resource: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// Job execution failed
    #[error("Job failed on endpoint {endpoint_id}: {reason}")]
    TaskFailed {
        /// Endpoint the job ran for
        endpoint_id: String,
        /// Failure reason
        reason: String,
    },

    /// Endpoint registry errors
    #[error("Endpoint error: {operation} - {reason}")]
    Endpoint {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Resource pool errors
    #[error("Pool error: {resource} - {message}")]
    Pool {
        /// Resource that failed
        resource: String,
        /// Error message
        message: String,
    },

    /// Analytics pipeline errors
    #[error("Analytics error: {stage} - {message}")]
    Analytics {
        /// Pipeline stage that failed
        stage: String,
        /// Error message
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration before timeout
        duration: Duration,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal error (use sparingly)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

/// Endpoint-manager-specific errors
#[derive(Error, Debug)]
pub enum EndpointError {
    /// Endpoint id already registered
    #[error("Endpoint already registered: {endpoint_id}")]
    AlreadyRegistered {
        /// Conflicting endpoint id
        endpoint_id: String,
    },

    /// Endpoint id unknown
    #[error("Unknown endpoint: {endpoint_id}")]
    Unknown {
        /// Requested endpoint id
        endpoint_id: String,
    },

    /// Health evaluation failed
    #[error("Health evaluation failed: {reason}")]
    HealthCheckFailed {
        /// Failure reason
        reason: String,
    },
}

/// Resource-pool-specific errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// Pool for the resource type was never configured
    #[error("No pool configured for resource: {resource}")]
    UnknownResource {
        /// Resource type name
        resource: String,
    },

    /// Worker thread failed
    #[error("Worker thread failed: {worker_id} - {reason}")]
    WorkerFailed {
        /// Worker ID
        worker_id: u32,
        /// Failure reason
        reason: String,
    },

    /// Manager is shut down
    #[error("Pool manager not running")]
    NotRunning,

    /// Result channel closed before delivery
    #[error("Result channel disconnected for request {request_id}")]
    ResultChannelClosed {
        /// Request id whose result was lost
        request_id: u64,
    },
}

/// Analytics-specific errors
#[derive(Error, Debug)]
pub enum AnalyticsError {
    /// Not enough history to predict
    #[error("Insufficient data for endpoint {endpoint_id}: {samples} samples, need {required}")]
    InsufficientData {
        /// Endpoint id
        endpoint_id: String,
        /// Samples available
        samples: usize,
        /// Samples required
        required: usize,
    },

    /// Batch processor is not running
    #[error("Batch processor not running")]
    ProcessorNotRunning,
}

// Convenience constructors for common errors
impl CoreError {
    /// Create configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create circuit-open error
    pub fn circuit_open(endpoint_id: impl Into<String>) -> Self {
        Self::CircuitOpen {
            endpoint_id: endpoint_id.into(),
        }
    }

    /// Create rate-limit error
    pub fn rate_limited(endpoint_id: impl Into<String>, limit_rpm: u32) -> Self {
        Self::RateLimitExceeded {
            endpoint_id: endpoint_id.into(),
            limit_rpm,
        }
    }

    /// Create queue-full error
    #[must_use]
    pub const fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    /// Create pool-timeout error
    pub fn pool_timeout(resource: impl Into<String>, waited: Duration) -> Self {
        Self::PoolTimeout {
            resource: resource.into(),
            waited,
        }
    }

    /// Create job-failure error
    pub fn task_failed(endpoint_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            endpoint_id: endpoint_id.into(),
            reason: reason.into(),
        }
    }

    /// Create endpoint error
    pub fn endpoint(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Endpoint {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create pool error
    pub fn pool(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pool {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create analytics error
    pub fn analytics(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Analytics {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create internal error (use sparingly)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the error is an admission rejection rather than a failure
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimitExceeded { .. } | Self::QueueFull { .. }
        )
    }
}

// Convert from domain-specific errors
impl From<EndpointError> for CoreError {
    fn from(err: EndpointError) -> Self {
        Self::endpoint("endpoint_operation", err.to_string())
    }
}

impl From<PoolError> for CoreError {
    fn from(err: PoolError) -> Self {
        Self::pool("pool_operation", err.to_string())
    }
}

impl From<AnalyticsError> for CoreError {
    fn from(err: AnalyticsError) -> Self {
        Self::analytics("analytics_operation", err.to_string())
    }
}
