//! Resource Pool Manager - Admission, Tiered Dispatch and Scaling
//!
//! Owns the connection pools, the four priority worker tiers and the
//! admission queue. Requests past the queue capacity are rejected on the
//! spot; admitted ones run FIFO within their tier on dedicated workers.
//! A monitor loop samples the host, keeps the efficiency score current and
//! drives optional pool auto-scaling.

pub mod connection;
pub mod monitor;
pub mod worker;

pub use connection::{ConnectionPool, ConnectionPoolConfig, ConnectionPoolStats};
pub use monitor::{
    efficiency_score, evaluate_scaling, EfficiencyInputs, ScalingEvent, SystemSample,
    SystemSampler,
};
pub use worker::{JobOutcome, QueuedRequest, RequestTicket, ShutdownSignal, TierPool, TierStats};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::PoolManagerConfig;
use crate::error::{CoreError, CoreResult, PoolError};
use crate::types::{EndpointId, Job, Priority, RequestId, ResourceType};

/// Scaling events retained for reports
const SCALING_HISTORY_CAPACITY: usize = 20;

/// Admission queue statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Requests currently admitted and waiting
    pub admitted: usize,
    /// Queue capacity
    pub capacity: usize,
    /// Occupancy percentage
    pub occupancy_pct: f64,
}

/// Full resource status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatusReport {
    /// Per-pool statistics
    pub pools: Vec<ConnectionPoolStats>,
    /// Per-tier statistics
    pub tiers: Vec<TierStats>,
    /// Admission queue state
    pub queue: QueueStats,
    /// Most recent host sample
    pub system: SystemSample,
    /// Current efficiency score
    pub efficiency_score: f64,
    /// Whether auto-scaling is active
    pub auto_scaling_enabled: bool,
    /// Recent auto-scaling adjustments
    pub recent_scaling: Vec<ScalingEvent>,
}

struct MonitorState {
    last_sample: SystemSample,
    scaling_history: Vec<ScalingEvent>,
}

/// Resource pool manager
pub struct ResourcePoolManager {
    config: PoolManagerConfig,
    pools: HashMap<ResourceType, Arc<ConnectionPool>>,
    tiers: HashMap<Priority, Mutex<TierPool>>,
    admitted: Arc<AtomicUsize>,
    sampler: SystemSampler,
    monitor_state: Mutex<MonitorState>,
    shutdown: ShutdownSignal,
    loop_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl ResourcePoolManager {
    /// Create manager with all pools and (unstarted) worker tiers.
    ///
    /// Nothing runs until [`start`](Self::start); this keeps construction
    /// cheap and lets tests drive maintenance and monitoring by hand.
    #[must_use]
    pub fn new(config: PoolManagerConfig) -> Self {
        let idle_timeout = Duration::from_secs(config.idle_timeout_s);
        let pools = config
            .pools
            .iter()
            .map(|sizing| {
                let pool = Arc::new(ConnectionPool::new(ConnectionPoolConfig {
                    resource: sizing.resource,
                    min_connections: sizing.min_connections,
                    max_connections: sizing.max_connections,
                    idle_timeout,
                }));
                (sizing.resource, pool)
            })
            .collect();

        let tiers = Priority::all()
            .into_iter()
            .map(|tier| {
                let workers = config.workers.for_priority(tier);
                (tier, Mutex::new(TierPool::new(tier, workers)))
            })
            .collect();

        Self {
            config,
            pools,
            tiers,
            admitted: Arc::new(AtomicUsize::new(0)),
            sampler: SystemSampler::new(),
            monitor_state: Mutex::new(MonitorState {
                last_sample: SystemSample::zero(),
                scaling_history: Vec::new(),
            }),
            shutdown: ShutdownSignal::new(),
            loop_handles: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Start worker tiers, the maintenance loop and the monitor loop.
    ///
    /// # Errors
    ///
    /// Returns error if already running or a thread fails to spawn.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(CoreError::pool("manager", "already running"));
        }

        let pool_lookup: Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync> = {
            let pools = self.pools.clone();
            Arc::new(move |resource| pools.get(&resource).cloned())
        };

        for tier in self.tiers.values() {
            tier.lock()
                .start(Arc::clone(&self.admitted), Arc::clone(&pool_lookup))?;
        }

        let mut handles = self.loop_handles.lock();

        let maintenance = {
            let manager = Arc::clone(self);
            let interval = Duration::from_secs(self.config.maintenance_interval_s);
            thread::Builder::new()
                .name("turnstile-pool-maintenance".to_string())
                .spawn(move || {
                    while !manager.shutdown.is_shutdown() {
                        sleep_with_shutdown(&manager.shutdown, interval);
                        if manager.shutdown.is_shutdown() {
                            break;
                        }
                        manager.maintain_once();
                    }
                })
                .map_err(|e| CoreError::pool("maintenance", e.to_string()))?
        };
        handles.push(maintenance);

        let monitor = {
            let manager = Arc::clone(self);
            let interval = Duration::from_secs(self.config.monitor_interval_s);
            thread::Builder::new()
                .name("turnstile-pool-monitor".to_string())
                .spawn(move || {
                    while !manager.shutdown.is_shutdown() {
                        sleep_with_shutdown(&manager.shutdown, interval);
                        if manager.shutdown.is_shutdown() {
                            break;
                        }
                        manager.run_monitor_once();
                    }
                })
                .map_err(|e| CoreError::pool("monitor", e.to_string()))?
        };
        handles.push(monitor);

        tracing::info!(
            workers = self.config.workers.total(),
            pools = self.pools.len(),
            queue_capacity = self.config.queue_capacity,
            "resource pool manager started"
        );
        Ok(())
    }

    /// Stop loops and worker tiers, joining their threads.
    pub fn stop(&self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.signal();

        for handle in self.loop_handles.lock().drain(..) {
            if handle.join().is_err() {
                tracing::warn!("pool loop thread panicked during shutdown");
            }
        }
        for tier in self.tiers.values() {
            tier.lock().stop();
        }
        tracing::info!("resource pool manager stopped");
    }

    /// Whether the manager is started
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Submit a job for tiered execution.
    ///
    /// Rejects immediately with [`CoreError::QueueFull`] when the admission
    /// queue is at capacity; there is no blocking on admission.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` at capacity, or a pool error if the manager is
    /// not running.
    pub fn submit_request(
        &self,
        endpoint_id: EndpointId,
        priority: Priority,
        resource: Option<ResourceType>,
        job: Box<dyn Job>,
        timeout: Duration,
    ) -> CoreResult<RequestTicket> {
        if !self.is_running() {
            return Err(PoolError::NotRunning.into());
        }

        let capacity = self.config.queue_capacity;
        if self
            .admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < capacity).then_some(count + 1)
            })
            .is_err()
        {
            return Err(CoreError::queue_full(capacity));
        }

        let id = RequestId::new();
        let (result_tx, result_rx) = channel::bounded(1);
        let request = QueuedRequest {
            id,
            endpoint_id,
            resource,
            job,
            timeout,
            enqueued_at: Instant::now(),
            result_tx,
        };

        let tier = self
            .tiers
            .get(&priority)
            .ok_or_else(|| CoreError::pool("tier", format!("no tier for {priority}")))?;
        if let Err(e) = tier.lock().enqueue(request) {
            self.admitted.fetch_sub(1, Ordering::AcqRel);
            return Err(e.into());
        }

        Ok(RequestTicket::new(id, result_rx))
    }

    /// Submit and wait for the outcome in one call.
    ///
    /// # Errors
    ///
    /// Propagates admission rejections, job failures and the timeout.
    pub fn execute(
        &self,
        endpoint_id: EndpointId,
        priority: Priority,
        resource: Option<ResourceType>,
        job: Box<dyn Job>,
        timeout: Duration,
    ) -> CoreResult<JobOutcome> {
        let ticket = self.submit_request(endpoint_id, priority, resource, job, timeout)?;
        // Budget covers queueing, acquisition and the job itself
        ticket.wait_timeout(timeout + Duration::from_secs(1))
    }

    /// Run one round of pool maintenance
    pub fn maintain_once(&self) {
        for pool in self.pools.values() {
            pool.maintain();
        }
    }

    /// Take one monitor sample, refresh the efficiency inputs and apply
    /// auto-scaling when enabled.
    pub fn run_monitor_once(&self) {
        let sample = self.sampler.sample();
        let occupancy = self.queue_occupancy_pct();

        let events = if self.config.auto_scaling_enabled {
            let pools: Vec<Arc<ConnectionPool>> = self.pools.values().cloned().collect();
            evaluate_scaling(sample, occupancy, &pools)
        } else {
            Vec::new()
        };

        let mut state = self.monitor_state.lock();
        state.last_sample = sample;
        state.scaling_history.extend(events);
        let overflow = state
            .scaling_history
            .len()
            .saturating_sub(SCALING_HISTORY_CAPACITY);
        if overflow > 0 {
            state.scaling_history.drain(..overflow);
        }
    }

    /// Current admission queue occupancy percentage
    pub fn queue_occupancy_pct(&self) -> f64 {
        let admitted = self.admitted.load(Ordering::Acquire);
        let capacity = self.config.queue_capacity;
        if capacity == 0 {
            return 0.0_f64;
        }
        f64::from(u32::try_from(admitted).unwrap_or(u32::MAX))
            / f64::from(u32::try_from(capacity).unwrap_or(u32::MAX))
            * 100.0_f64
    }

    /// Current composite efficiency score
    pub fn efficiency_score(&self) -> f64 {
        let (wait_sum, proc_sum, tiers) = self.tiers.values().fold(
            (0.0_f64, 0.0_f64, 0.0_f64),
            |(wait, proc, count), tier| {
                let tier = tier.lock();
                (
                    wait + tier.counters().avg_queue_wait_ms(),
                    proc + tier.counters().avg_processing_ms(),
                    count + 1.0_f64,
                )
            },
        );
        let sample = self.monitor_state.lock().last_sample;

        efficiency_score(&EfficiencyInputs {
            avg_queue_wait_ms: wait_sum / tiers,
            avg_processing_ms: proc_sum / tiers,
            memory_pct: sample.memory_pct,
            cpu_pct: sample.cpu_pct,
            queue_occupancy_pct: self.queue_occupancy_pct(),
        })
    }

    /// Connection pool for a resource class
    #[must_use]
    pub fn pool(&self, resource: ResourceType) -> Option<&Arc<ConnectionPool>> {
        self.pools.get(&resource)
    }

    /// Full status report
    pub fn resource_status(&self) -> ResourceStatusReport {
        let score = self.efficiency_score();
        let (sample, recent_scaling) = {
            let state = self.monitor_state.lock();
            (state.last_sample, state.scaling_history.clone())
        };
        let admitted = self.admitted.load(Ordering::Acquire);

        let mut pools: Vec<ConnectionPoolStats> =
            self.pools.values().map(|pool| pool.stats()).collect();
        pools.sort_by_key(|stats| stats.resource.as_str());

        let mut tiers: Vec<TierStats> = self
            .tiers
            .values()
            .map(|tier| tier.lock().stats())
            .collect();
        tiers.sort_by_key(|stats| stats.tier);

        ResourceStatusReport {
            pools,
            tiers,
            queue: QueueStats {
                admitted,
                capacity: self.config.queue_capacity,
                occupancy_pct: self.queue_occupancy_pct(),
            },
            system: sample,
            efficiency_score: score,
            auto_scaling_enabled: self.config.auto_scaling_enabled,
            recent_scaling,
        }
    }
}

impl Drop for ResourcePoolManager {
    fn drop(&mut self) {
        self.shutdown.signal();
    }
}

pub(crate) fn sleep_with_shutdown(shutdown: &ShutdownSignal, interval: Duration) {
    let deadline = Instant::now() + interval;
    while !shutdown.is_shutdown() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;
    use crate::config::{PoolManagerConfig, PoolSizing, WorkerTierConfig};
    use crate::types::JobFn;

    fn test_config() -> PoolManagerConfig {
        PoolManagerConfig {
            queue_capacity: 100,
            pools: vec![PoolSizing {
                resource: ResourceType::Database,
                min_connections: 1,
                max_connections: 3,
            }],
            workers: WorkerTierConfig {
                critical: 1,
                high: 1,
                medium: 1,
                low: 1,
            },
            idle_timeout_s: 60,
            maintenance_interval_s: 3600,
            monitor_interval_s: 3600,
            auto_scaling_enabled: false,
        }
    }

    fn ok_job() -> Box<dyn Job> {
        Box::new(JobFn::new(|_| Ok(serde_json::json!("done"))))
    }

    #[test]
    fn test_execute_round_trip() {
        let manager = Arc::new(ResourcePoolManager::new(test_config()));
        assert!(manager.start().is_ok());

        let outcome = manager.execute(
            EndpointId::new("api_data"),
            Priority::Medium,
            Some(ResourceType::Database),
            ok_job(),
            Duration::from_secs(1),
        );
        match outcome {
            Ok(out) => assert_eq!(out.value, serde_json::json!("done")),
            Err(e) => panic!("execute failed: {e}"),
        }

        manager.stop();
    }

    #[test]
    fn test_queue_full_rejected_immediately() {
        let mut config = test_config();
        config.queue_capacity = 5;
        // Workers never started, so nothing drains the queue
        let manager = Arc::new(ResourcePoolManager::new(config));
        manager.is_running.store(true, Ordering::Release);

        for _ in 0_i32..5_i32 {
            let ticket = manager.submit_request(
                EndpointId::new("api_data"),
                Priority::Low,
                None,
                ok_job(),
                Duration::from_secs(1),
            );
            assert!(ticket.is_ok());
        }

        let start = Instant::now();
        let rejected = manager.submit_request(
            EndpointId::new("api_data"),
            Priority::Low,
            None,
            ok_job(),
            Duration::from_secs(1),
        );
        assert!(matches!(rejected, Err(CoreError::QueueFull { capacity: 5 })));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_admission_count_drains() {
        let manager = Arc::new(ResourcePoolManager::new(test_config()));
        assert!(manager.start().is_ok());

        let mut tickets = Vec::new();
        for _ in 0_i32..10_i32 {
            match manager.submit_request(
                EndpointId::new("api_data"),
                Priority::High,
                None,
                ok_job(),
                Duration::from_secs(1),
            ) {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => panic!("submit failed: {e}"),
            }
        }
        for ticket in tickets {
            assert!(ticket.wait_timeout(Duration::from_secs(2)).is_ok());
        }

        assert_eq!(manager.admitted.load(Ordering::Acquire), 0);
        assert!(manager.queue_occupancy_pct().abs() < f64::EPSILON);
        manager.stop();
    }

    #[test]
    fn test_resource_status_shape() {
        let manager = Arc::new(ResourcePoolManager::new(test_config()));
        let report = manager.resource_status();

        assert_eq!(report.pools.len(), 1);
        assert_eq!(report.tiers.len(), 4);
        assert_eq!(report.queue.capacity, 100);
        assert!(!report.auto_scaling_enabled);
        assert!((report.efficiency_score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_monitor_round_updates_sample() {
        let manager = Arc::new(ResourcePoolManager::new(test_config()));
        manager.run_monitor_once();
        let report = manager.resource_status();
        assert!(report.system.memory_pct > 0.0);
        assert!(report.recent_scaling.is_empty());
    }
}
