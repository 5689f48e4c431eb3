//! `Turnstile` Core Types
//!
//! Shared type definitions for endpoint governance, pooled dispatch and
//! analytics. Identifiers are cheap newtypes; jobs are a single explicit
//! trait with a closure adapter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Global ID counter for generating unique identifiers
static GLOBAL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate next unique ID
#[inline]
fn next_id() -> u64 {
    GLOBAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Endpoint identifier (registry key, unique per manager)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    /// Create endpoint ID from a name
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an endpoint ID from a route path, e.g. `/api/market-data`
    /// becomes `api_market_data`.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let id = path
            .trim_matches('/')
            .replace(['/', '-', '.'], "_")
            .to_lowercase();
        Self(id)
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Request identifier assigned at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Create new request ID
    #[must_use]
    pub fn new() -> Self {
        Self(next_id())
    }

    /// Create request ID from raw value
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get raw ID value
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Connection identifier within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create new connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(next_id())
    }

    /// Get raw ID value
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Request priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Highest tier, dedicated workers, never starved
    Critical = 1,
    /// Important work
    High = 2,
    /// Default tier
    Medium = 3,
    /// Best effort
    Low = 4,
}

impl Priority {
    /// Numeric rank, lower is more urgent
    #[must_use]
    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// Classify a route path by keyword. First matching tier wins, scanning
    /// from most to least urgent.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        const CRITICAL: [&str; 4] = ["signal", "ai", "reasoning", "trade"];
        const HIGH: [&str; 5] = ["smc", "ml", "predict", "ensemble", "analysis"];
        const MEDIUM: [&str; 4] = ["market", "data", "api", "fetch"];

        let lower = path.to_lowercase();
        if CRITICAL.iter().any(|kw| lower.contains(kw)) {
            Self::Critical
        } else if HIGH.iter().any(|kw| lower.contains(kw)) {
            Self::High
        } else if MEDIUM.iter().any(|kw| lower.contains(kw)) {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// All tiers, most urgent first
    #[must_use]
    pub const fn all() -> [Self; 4] {
        [Self::Critical, Self::High, Self::Medium, Self::Low]
    }

    /// Tier name as used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backend resource class a request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Database connections
    Database,
    /// Outbound third-party API connections
    ExternalApi,
    /// Cache connections
    Cache,
    /// Internal service connections
    InternalApi,
}

impl ResourceType {
    /// All resource classes
    #[must_use]
    pub const fn all() -> [Self; 4] {
        [
            Self::Database,
            Self::ExternalApi,
            Self::Cache,
            Self::InternalApi,
        ]
    }

    /// Resource name as used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::ExternalApi => "external_api",
            Self::Cache => "cache",
            Self::InternalApi => "internal_api",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error produced by a failing job
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct JobError {
    /// Failure description
    pub message: String,
}

impl JobError {
    /// Create job error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Unit of work submitted for execution.
///
/// A job receives an exclusively held connection when its request was routed
/// through a pool, or `None` when executed inline. Jobs must not retain the
/// connection beyond the call.
pub trait Job: Send {
    /// Run the job to completion
    fn run(&mut self, conn: Option<&mut ConnectionHandle>) -> Result<serde_json::Value, JobError>;
}

/// Closure adapter implementing [`Job`]
pub struct JobFn<F>(F);

impl<F> JobFn<F>
where
    F: FnMut(Option<&mut ConnectionHandle>) -> Result<serde_json::Value, JobError> + Send,
{
    /// Wrap a closure as a job
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Job for JobFn<F>
where
    F: FnMut(Option<&mut ConnectionHandle>) -> Result<serde_json::Value, JobError> + Send,
{
    fn run(&mut self, conn: Option<&mut ConnectionHandle>) -> Result<serde_json::Value, JobError> {
        (self.0)(conn)
    }
}

/// Pooled connection handed to jobs.
///
/// Exclusively owned while checked out; validity is age-based and enforced
/// by the owning pool.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Connection identifier
    pub id: ConnectionId,
    /// Resource class this connection belongs to
    pub resource: ResourceType,
    /// Creation instant
    pub created_at: std::time::Instant,
    /// Last checkout instant
    pub last_used: std::time::Instant,
    /// Checkout count
    pub use_count: u64,
}

impl ConnectionHandle {
    /// Create a fresh connection handle
    #[must_use]
    pub fn new(resource: ResourceType) -> Self {
        let now = std::time::Instant::now();
        Self {
            id: ConnectionId::new(),
            resource,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    /// Age since creation
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Idle time since last checkout
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    /// Mark a checkout
    pub fn touch(&mut self) {
        self.last_used = std::time::Instant::now();
        self.use_count += 1;
    }
}

/// Advisory scaling action for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    /// Utilization above the upper threshold
    ScaleUp,
    /// Utilization below the lower threshold
    ScaleDown,
    /// Within the target band
    Maintain,
}

impl ScalingAction {
    /// Action name as used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::Maintain => "maintain",
        }
    }
}

/// Advisory scaling recommendation produced by the endpoint manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingRecommendation {
    /// Endpoint the recommendation applies to
    pub endpoint_id: EndpointId,
    /// Recommended action
    pub action: ScalingAction,
    /// Rate-limit utilization percentage that triggered the action
    pub utilization_pct: f64,
    /// Observed requests per second
    pub requests_per_second: f64,
    /// Average latency in milliseconds
    pub avg_latency_ms: f64,
    /// Error rate percentage
    pub error_rate_pct: f64,
}
