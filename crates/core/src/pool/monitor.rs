//! Resource Monitor - System Sampling, Efficiency Scoring, Auto-Scaling
//!
//! Samples host CPU and memory through `sysinfo`, folds them together with
//! dispatch statistics into a 0-100 efficiency score, and (when enabled)
//! resizes connection pool maxima under sustained pressure or slack.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuExt, System, SystemExt};

use crate::types::ResourceType;

use super::connection::ConnectionPool;

/// Pool growth step applied under pressure
const GROW_STEP: usize = 10;
/// Hard ceiling for any pool maximum
const GROW_CEILING: usize = 100;
/// Pool shrink step applied under slack
const SHRINK_STEP: usize = 5;
/// Shrink floor margin above `min_connections`
const SHRINK_FLOOR_MARGIN: usize = 10;

/// One host sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    /// Global CPU utilization percentage
    pub cpu_pct: f64,
    /// Memory utilization percentage
    pub memory_pct: f64,
}

impl SystemSample {
    /// A zeroed sample, used before the first refresh
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            cpu_pct: 0.0,
            memory_pct: 0.0,
        }
    }
}

/// Host sampler backed by `sysinfo`
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    /// Create sampler
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Refresh and read CPU and memory utilization
    pub fn sample(&self) -> SystemSample {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_pct = f64::from(system.global_cpu_info().cpu_usage());
        let total = system.total_memory();
        let memory_pct = if total == 0 {
            0.0_f64
        } else {
            let used = system.used_memory();
            f64::from(u32::try_from(used / 1024 / 1024).unwrap_or(u32::MAX))
                / f64::from(u32::try_from(total / 1024 / 1024).unwrap_or(u32::MAX))
                * 100.0_f64
        };

        SystemSample {
            cpu_pct,
            memory_pct,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs to the efficiency score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyInputs {
    /// Average queue wait across tiers (ms)
    pub avg_queue_wait_ms: f64,
    /// Average job processing time across tiers (ms)
    pub avg_processing_ms: f64,
    /// Memory utilization percentage
    pub memory_pct: f64,
    /// CPU utilization percentage
    pub cpu_pct: f64,
    /// Admission queue occupancy percentage
    pub queue_occupancy_pct: f64,
}

/// Composite 0-100 efficiency score.
///
/// Starts from 100 and subtracts graduated penalties for queue wait,
/// processing time, memory, CPU and queue occupancy.
#[must_use]
pub fn efficiency_score(inputs: &EfficiencyInputs) -> f64 {
    let mut score = 100.0_f64;

    if inputs.avg_queue_wait_ms > 1000.0_f64 {
        score -= 20.0_f64;
    } else if inputs.avg_queue_wait_ms > 500.0_f64 {
        score -= 10.0_f64;
    }

    if inputs.avg_processing_ms > 5000.0_f64 {
        score -= 15.0_f64;
    } else if inputs.avg_processing_ms > 2000.0_f64 {
        score -= 8.0_f64;
    }

    if inputs.memory_pct > 85.0_f64 {
        score -= 15.0_f64;
    }

    if inputs.cpu_pct > 80.0_f64 {
        score -= 10.0_f64;
    }

    if inputs.queue_occupancy_pct > 80.0_f64 {
        score -= 20.0_f64;
    }

    score.clamp(0.0_f64, 100.0_f64)
}

/// One auto-scaling adjustment, for reports and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    /// Pool that was resized
    pub resource: ResourceType,
    /// Previous maximum
    pub old_max: usize,
    /// New maximum
    pub new_max: usize,
    /// Whether this was a grow or shrink
    pub grew: bool,
}

/// Evaluate auto-scaling thresholds against one sample.
///
/// Pools grow under pressure (CPU above 80%, memory above 85% or queue
/// occupancy above 70%) and shrink only when every signal shows slack.
/// Returns the adjustments made.
pub fn evaluate_scaling(
    sample: SystemSample,
    queue_occupancy_pct: f64,
    pools: &[Arc<ConnectionPool>],
) -> Vec<ScalingEvent> {
    let pressure =
        sample.cpu_pct > 80.0_f64 || sample.memory_pct > 85.0_f64 || queue_occupancy_pct > 70.0_f64;
    let slack =
        sample.cpu_pct < 30.0_f64 && sample.memory_pct < 50.0_f64 && queue_occupancy_pct < 10.0_f64;

    let mut events = Vec::new();
    for pool in pools {
        let old_max = pool.max_connections();
        if pressure {
            if let Some(new_max) = pool.grow_max(GROW_STEP, GROW_CEILING) {
                tracing::info!(
                    resource = %pool.resource(),
                    old_max,
                    new_max,
                    "auto-scaler grew pool"
                );
                events.push(ScalingEvent {
                    resource: pool.resource(),
                    old_max,
                    new_max,
                    grew: true,
                });
            }
        } else if slack {
            if let Some(new_max) = pool.shrink_max(SHRINK_STEP, SHRINK_FLOOR_MARGIN) {
                tracing::info!(
                    resource = %pool.resource(),
                    old_max,
                    new_max,
                    "auto-scaler shrank pool"
                );
                events.push(ScalingEvent {
                    resource: pool.resource(),
                    old_max,
                    new_max,
                    grew: false,
                });
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;
    use crate::pool::connection::ConnectionPoolConfig;
    use std::time::Duration;

    fn inputs() -> EfficiencyInputs {
        EfficiencyInputs {
            avg_queue_wait_ms: 0.0,
            avg_processing_ms: 0.0,
            memory_pct: 0.0,
            cpu_pct: 0.0,
            queue_occupancy_pct: 0.0,
        }
    }

    fn db_pool(min: usize, max: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(ConnectionPoolConfig {
            resource: ResourceType::Database,
            min_connections: min,
            max_connections: max,
            idle_timeout: Duration::from_secs(60),
        }))
    }

    #[test]
    fn test_perfect_score() {
        assert!((efficiency_score(&inputs()) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_queue_wait_penalties() {
        let mut i = inputs();
        i.avg_queue_wait_ms = 600.0;
        assert!((efficiency_score(&i) - 90.0).abs() < f64::EPSILON);
        i.avg_queue_wait_ms = 1500.0;
        assert!((efficiency_score(&i) - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_processing_penalties() {
        let mut i = inputs();
        i.avg_processing_ms = 3000.0;
        assert!((efficiency_score(&i) - 92.0).abs() < f64::EPSILON);
        i.avg_processing_ms = 6000.0;
        assert!((efficiency_score(&i) - 85.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_worst_case_clamps_at_zero() {
        let i = EfficiencyInputs {
            avg_queue_wait_ms: 10_000.0,
            avg_processing_ms: 10_000.0,
            memory_pct: 99.0,
            cpu_pct: 99.0,
            queue_occupancy_pct: 99.0,
        };
        // Penalties total 80; stays within [0, 100] even so
        let score = efficiency_score(&i);
        assert!((score - 20.0).abs() < f64::EPSILON);
        assert!((0.0..=100.0).contains(&score));
    }

    proptest::proptest! {
        #[test]
        fn test_score_always_in_range(
            wait in 0.0_f64..1.0e7,
            proc in 0.0_f64..1.0e7,
            memory in 0.0_f64..200.0,
            cpu in 0.0_f64..200.0,
            occupancy in 0.0_f64..200.0,
        ) {
            let score = efficiency_score(&EfficiencyInputs {
                avg_queue_wait_ms: wait,
                avg_processing_ms: proc,
                memory_pct: memory,
                cpu_pct: cpu,
                queue_occupancy_pct: occupancy,
            });
            proptest::prop_assert!((0.0..=100.0).contains(&score));
        }
    }

    #[test]
    fn test_scaling_grows_under_pressure() {
        let pool = db_pool(10, 50);
        let sample = SystemSample {
            cpu_pct: 90.0,
            memory_pct: 40.0,
        };

        let events = evaluate_scaling(sample, 0.0, &[Arc::clone(&pool)]);
        assert_eq!(events.len(), 1);
        assert!(events[0].grew);
        assert_eq!(pool.max_connections(), 60);
    }

    #[test]
    fn test_scaling_shrinks_only_under_full_slack() {
        let pool = db_pool(10, 50);

        // CPU is idle but occupancy is not low enough
        let sample = SystemSample {
            cpu_pct: 10.0,
            memory_pct: 20.0,
        };
        let events = evaluate_scaling(sample, 50.0, &[Arc::clone(&pool)]);
        assert!(events.is_empty());
        assert_eq!(pool.max_connections(), 50);

        let events = evaluate_scaling(sample, 5.0, &[Arc::clone(&pool)]);
        assert_eq!(events.len(), 1);
        assert!(!events[0].grew);
        assert_eq!(pool.max_connections(), 45);
    }

    #[test]
    fn test_scaling_respects_bounds() {
        let pool = db_pool(10, 95);
        let pressure = SystemSample {
            cpu_pct: 95.0,
            memory_pct: 95.0,
        };
        let _ = evaluate_scaling(pressure, 99.0, &[Arc::clone(&pool)]);
        assert_eq!(pool.max_connections(), 100);
        assert!(evaluate_scaling(pressure, 99.0, &[Arc::clone(&pool)]).is_empty());

        let slack = SystemSample {
            cpu_pct: 1.0,
            memory_pct: 1.0,
        };
        for _ in 0_i32..30_i32 {
            let _ = evaluate_scaling(slack, 0.0, &[Arc::clone(&pool)]);
        }
        assert_eq!(pool.max_connections(), 20);
    }

    #[test]
    fn test_sampler_produces_percentages() {
        let sampler = SystemSampler::new();
        let sample = sampler.sample();
        assert!(sample.memory_pct >= 0.0 && sample.memory_pct <= 100.0);
        assert!(sample.cpu_pct >= 0.0);
    }
}
