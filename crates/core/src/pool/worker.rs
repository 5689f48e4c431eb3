//! Tiered Worker Pools - Priority-Isolated Dispatch
//!
//! One FIFO channel and a fixed set of named worker threads per priority
//! tier. Tiers never share workers, so a flood of low-priority requests
//! cannot starve critical ones. Within a tier, requests run in enqueue
//! order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, PoolError};
use crate::types::{ConnectionHandle, EndpointId, Job, Priority, RequestId, ResourceType};

use super::connection::ConnectionPool;

/// Poll interval for shutdown checks in the worker loop
const RECV_POLL: Duration = Duration::from_millis(50);

/// Shutdown signal for graceful worker termination
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    shutdown: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create new shutdown signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown
    pub fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Check if shutdown was signaled
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Completed job outcome delivered through a [`RequestTicket`]
#[derive(Debug)]
pub struct JobOutcome {
    /// Job output value
    pub value: serde_json::Value,
    /// Time spent queued before a worker picked the request up
    pub queue_wait: Duration,
    /// Time spent executing the job
    pub processing: Duration,
}

/// Admitted request waiting for a worker
pub struct QueuedRequest {
    /// Request identifier
    pub id: RequestId,
    /// Endpoint the request belongs to
    pub endpoint_id: EndpointId,
    /// Resource class the job needs, if any
    pub resource: Option<ResourceType>,
    /// The work itself
    pub job: Box<dyn Job>,
    /// Budget for connection acquisition
    pub timeout: Duration,
    /// Admission instant, for queue-wait accounting
    pub enqueued_at: Instant,
    /// Result delivery channel
    pub result_tx: Sender<CoreResult<JobOutcome>>,
}

/// Handle to a submitted request
#[derive(Debug)]
pub struct RequestTicket {
    id: RequestId,
    result_rx: Receiver<CoreResult<JobOutcome>>,
}

impl RequestTicket {
    pub(crate) const fn new(id: RequestId, result_rx: Receiver<CoreResult<JobOutcome>>) -> Self {
        Self { id, result_rx }
    }

    /// Request identifier
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Block until the result arrives.
    ///
    /// # Errors
    ///
    /// Returns the job's error, or [`PoolError::ResultChannelClosed`] if the
    /// manager shut down before delivery.
    pub fn wait(self) -> CoreResult<JobOutcome> {
        self.result_rx.recv().map_err(|_| {
            CoreError::from(PoolError::ResultChannelClosed {
                request_id: self.id.raw(),
            })
        })?
    }

    /// Block until the result arrives or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when the deadline passes first.
    pub fn wait_timeout(self, timeout: Duration) -> CoreResult<JobOutcome> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(channel::RecvTimeoutError::Timeout) => {
                Err(CoreError::timeout(self.id.to_string(), timeout))
            }
            Err(channel::RecvTimeoutError::Disconnected) => {
                Err(CoreError::from(PoolError::ResultChannelClosed {
                    request_id: self.id.raw(),
                }))
            }
        }
    }
}

/// Shared counters for one tier
#[derive(Debug, Default)]
pub struct TierCounters {
    /// Requests completed by this tier
    pub completed: AtomicU64,
    /// Requests that ended in a job or pool error
    pub failed: AtomicU64,
    /// Cumulative queue wait (ms)
    pub total_queue_wait_ms: AtomicU64,
    /// Cumulative processing time (ms)
    pub total_processing_ms: AtomicU64,
    /// Workers currently executing a job
    pub busy_workers: AtomicUsize,
}

impl TierCounters {
    /// Average queue wait in milliseconds
    pub fn avg_queue_wait_ms(&self) -> f64 {
        Self::avg(
            self.total_queue_wait_ms.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed),
        )
    }

    /// Average processing time in milliseconds
    pub fn avg_processing_ms(&self) -> f64 {
        Self::avg(
            self.total_processing_ms.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed),
        )
    }

    fn avg(total_ms: u64, count: u64) -> f64 {
        if count == 0 {
            return 0.0_f64;
        }
        f64::from(u32::try_from(total_ms / count).unwrap_or(u32::MAX))
    }
}

/// Tier statistics snapshot for reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierStats {
    /// Tier name
    pub tier: Priority,
    /// Configured worker count
    pub workers: usize,
    /// Workers currently busy
    pub busy_workers: usize,
    /// Requests waiting in this tier's channel
    pub queued: usize,
    /// Completed requests
    pub completed: u64,
    /// Failed requests
    pub failed: u64,
    /// Average queue wait (ms)
    pub avg_queue_wait_ms: f64,
    /// Average processing time (ms)
    pub avg_processing_ms: f64,
}

/// Fixed-size worker pool for one priority tier
pub struct TierPool {
    tier: Priority,
    worker_count: usize,
    sender: Sender<QueuedRequest>,
    receiver: Receiver<QueuedRequest>,
    counters: Arc<TierCounters>,
    shutdown: ShutdownSignal,
    handles: Vec<thread::JoinHandle<()>>,
}

impl TierPool {
    /// Create an unstarted tier pool
    #[must_use]
    pub fn new(tier: Priority, worker_count: usize) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            tier,
            worker_count,
            sender,
            receiver,
            counters: Arc::new(TierCounters::default()),
            shutdown: ShutdownSignal::new(),
            handles: Vec::with_capacity(worker_count),
        }
    }

    /// Spawn the tier's worker threads.
    ///
    /// `admitted` is the shared admission counter, decremented when a worker
    /// dequeues a request. `pool_for` resolves the connection pool for a
    /// resource class.
    ///
    /// # Errors
    ///
    /// Returns error if a worker thread cannot be spawned.
    pub fn start(
        &mut self,
        admitted: Arc<AtomicUsize>,
        pool_for: Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync>,
    ) -> Result<(), PoolError> {
        for index in 0..self.worker_count {
            let receiver = self.receiver.clone();
            let counters = Arc::clone(&self.counters);
            let shutdown = self.shutdown.clone();
            let admitted = Arc::clone(&admitted);
            let pool_for = Arc::clone(&pool_for);
            let tier = self.tier;

            let handle = thread::Builder::new()
                .name(format!("turnstile-{tier}-{index}"))
                .spawn(move || {
                    Self::worker_loop(&receiver, &counters, &shutdown, &admitted, &pool_for);
                })
                .map_err(|e| PoolError::WorkerFailed {
                    worker_id: u32::try_from(index).unwrap_or(u32::MAX),
                    reason: format!("Failed to start worker thread: {e}"),
                })?;
            self.handles.push(handle);
        }
        Ok(())
    }

    fn worker_loop(
        receiver: &Receiver<QueuedRequest>,
        counters: &Arc<TierCounters>,
        shutdown: &ShutdownSignal,
        admitted: &Arc<AtomicUsize>,
        pool_for: &Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync>,
    ) {
        loop {
            if shutdown.is_shutdown() {
                break;
            }

            match receiver.recv_timeout(RECV_POLL) {
                Ok(request) => {
                    admitted.fetch_sub(1, Ordering::AcqRel);
                    counters.busy_workers.fetch_add(1, Ordering::Relaxed);
                    Self::process(request, counters, pool_for);
                    counters.busy_workers.fetch_sub(1, Ordering::Relaxed);
                }
                Err(channel::RecvTimeoutError::Timeout) => {}
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process(
        mut request: QueuedRequest,
        counters: &Arc<TierCounters>,
        pool_for: &Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync>,
    ) {
        let queue_wait = request.enqueued_at.elapsed();
        counters.total_queue_wait_ms.fetch_add(
            u64::try_from(queue_wait.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        let outcome = Self::run_job(&mut request, pool_for, queue_wait);

        match &outcome {
            Ok(out) => {
                counters.total_processing_ms.fetch_add(
                    u64::try_from(out.processing.as_millis()).unwrap_or(u64::MAX),
                    Ordering::Relaxed,
                );
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        // The submitter may have stopped waiting; a closed channel is fine
        let _ = request.result_tx.send(outcome);
    }

    fn run_job(
        request: &mut QueuedRequest,
        pool_for: &Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync>,
        queue_wait: Duration,
    ) -> CoreResult<JobOutcome> {
        let pool = match request.resource {
            Some(resource) => match pool_for(resource) {
                Some(pool) => Some(pool),
                None => {
                    return Err(CoreError::from(PoolError::UnknownResource {
                        resource: resource.as_str().to_string(),
                    }))
                }
            },
            None => None,
        };

        let mut guard = match &pool {
            Some(pool) => {
                let conn = pool.acquire(request.timeout)?;
                Some(ConnectionGuard::new(Arc::clone(pool), conn))
            }
            None => None,
        };

        // Jobs are untrusted code; a panic must not unwind through the
        // worker thread, and the guard returns the connection regardless.
        let job = &mut request.job;
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            job.run(guard.as_mut().and_then(ConnectionGuard::handle_mut))
        }));
        let processing = started.elapsed();
        drop(guard);

        match result {
            Ok(Ok(value)) => Ok(JobOutcome {
                value,
                queue_wait,
                processing,
            }),
            Ok(Err(e)) => Err(CoreError::task_failed(
                request.endpoint_id.as_str(),
                e.to_string(),
            )),
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                tracing::error!(
                    endpoint = %request.endpoint_id,
                    request_id = request.id.raw(),
                    reason = %reason,
                    "job panicked"
                );
                Err(CoreError::task_failed(
                    request.endpoint_id.as_str(),
                    format!("job panicked: {reason}"),
                ))
            }
        }
    }

    /// Enqueue a request. FIFO within the tier.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotRunning`] if the channel is closed.
    pub fn enqueue(&self, request: QueuedRequest) -> Result<(), PoolError> {
        self.sender.send(request).map_err(|_| PoolError::NotRunning)
    }

    /// Requests currently waiting in this tier
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Configured worker count
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Tier this pool serves
    #[must_use]
    pub const fn tier(&self) -> Priority {
        self.tier
    }

    /// Shared counters
    #[must_use]
    pub fn counters(&self) -> &TierCounters {
        &self.counters
    }

    /// Statistics snapshot
    pub fn stats(&self) -> TierStats {
        TierStats {
            tier: self.tier,
            workers: self.worker_count,
            busy_workers: self.counters.busy_workers.load(Ordering::Relaxed),
            queued: self.queued(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            avg_queue_wait_ms: self.counters.avg_queue_wait_ms(),
            avg_processing_ms: self.counters.avg_processing_ms(),
        }
    }

    /// Signal workers to stop without joining
    pub fn signal_shutdown(&self) {
        self.shutdown.signal();
    }

    /// Signal shutdown and join all workers
    pub fn stop(&mut self) {
        self.shutdown.signal();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(tier = %self.tier, "worker thread panicked during shutdown");
            }
        }
    }
}

/// Checked-out connection that goes back to its pool on every exit path,
/// including a job unwind.
struct ConnectionGuard {
    pool: Arc<ConnectionPool>,
    conn: Option<ConnectionHandle>,
}

impl ConnectionGuard {
    fn new(pool: Arc<ConnectionPool>, conn: ConnectionHandle) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn handle_mut(&mut self) -> Option<&mut ConnectionHandle> {
        self.conn.as_mut()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic, clippy::float_cmp)]

    use super::*;
    use crate::pool::connection::ConnectionPoolConfig;
    use crate::types::JobFn;
    use parking_lot::Mutex;

    fn no_pools() -> Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync> {
        Arc::new(|_| None)
    }

    fn submit(
        tier: &TierPool,
        admitted: &Arc<AtomicUsize>,
        job: Box<dyn Job>,
        resource: Option<ResourceType>,
    ) -> RequestTicket {
        let (result_tx, result_rx) = channel::bounded(1);
        let id = RequestId::new();
        admitted.fetch_add(1, Ordering::AcqRel);
        let request = QueuedRequest {
            id,
            endpoint_id: EndpointId::new("test_endpoint"),
            resource,
            job,
            timeout: Duration::from_millis(200),
            enqueued_at: Instant::now(),
            result_tx,
        };
        assert!(tier.enqueue(request).is_ok());
        RequestTicket::new(id, result_rx)
    }

    #[test]
    fn test_tier_executes_job() {
        let mut tier = TierPool::new(Priority::Medium, 1);
        let admitted = Arc::new(AtomicUsize::new(0));
        assert!(tier.start(Arc::clone(&admitted), no_pools()).is_ok());

        let ticket = submit(
            &tier,
            &admitted,
            Box::new(JobFn::new(|_| Ok(serde_json::json!(7)))),
            None,
        );

        let outcome = ticket.wait_timeout(Duration::from_secs(2));
        match outcome {
            Ok(out) => assert_eq!(out.value, serde_json::json!(7)),
            Err(e) => panic!("job failed: {e}"),
        }
        assert_eq!(admitted.load(Ordering::Acquire), 0);
        assert_eq!(tier.counters().completed.load(Ordering::Relaxed), 1);

        tier.stop();
    }

    #[test]
    fn test_fifo_order_within_tier() {
        let mut tier = TierPool::new(Priority::High, 1);
        let admitted = Arc::new(AtomicUsize::new(0));
        assert!(tier.start(Arc::clone(&admitted), no_pools()).is_ok());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tickets = Vec::new();
        for i in 0_i32..5_i32 {
            let order = Arc::clone(&order);
            tickets.push(submit(
                &tier,
                &admitted,
                Box::new(JobFn::new(move |_| {
                    order.lock().push(i);
                    Ok(serde_json::Value::Null)
                })),
                None,
            ));
        }
        for ticket in tickets {
            assert!(ticket.wait_timeout(Duration::from_secs(2)).is_ok());
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        tier.stop();
    }

    #[test]
    fn test_job_failure_reported_not_fatal() {
        let mut tier = TierPool::new(Priority::Low, 1);
        let admitted = Arc::new(AtomicUsize::new(0));
        assert!(tier.start(Arc::clone(&admitted), no_pools()).is_ok());

        let failing = submit(
            &tier,
            &admitted,
            Box::new(JobFn::new(|_| Err(crate::types::JobError::new("boom")))),
            None,
        );
        let result = failing.wait_timeout(Duration::from_secs(2));
        assert!(matches!(result, Err(CoreError::TaskFailed { .. })));

        // Worker survives the failure and keeps serving
        let next = submit(
            &tier,
            &admitted,
            Box::new(JobFn::new(|_| Ok(serde_json::json!("ok")))),
            None,
        );
        assert!(next.wait_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(tier.counters().failed.load(Ordering::Relaxed), 1);

        tier.stop();
    }

    #[test]
    fn test_panicking_job_frees_worker_and_connection() {
        let pool = Arc::new(ConnectionPool::new(ConnectionPoolConfig {
            resource: ResourceType::Database,
            min_connections: 1,
            max_connections: 1,
            idle_timeout: Duration::from_secs(60),
        }));
        let lookup: Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync> = {
            let pool = Arc::clone(&pool);
            Arc::new(move |resource| {
                (resource == ResourceType::Database).then(|| Arc::clone(&pool))
            })
        };

        let mut tier = TierPool::new(Priority::Medium, 1);
        let admitted = Arc::new(AtomicUsize::new(0));
        assert!(tier.start(Arc::clone(&admitted), lookup).is_ok());

        let panicking = submit(
            &tier,
            &admitted,
            Box::new(JobFn::new(
                |_| -> Result<serde_json::Value, crate::types::JobError> { panic!("job blew up") },
            )),
            Some(ResourceType::Database),
        );
        let result = panicking.wait_timeout(Duration::from_secs(2));
        assert!(matches!(result, Err(CoreError::TaskFailed { .. })));

        // Connection went back to the pool instead of leaking
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.available_count(), 1);
        assert_eq!(tier.counters().busy_workers.load(Ordering::Relaxed), 0);

        // The single worker is still alive and serves the next request
        let next = submit(
            &tier,
            &admitted,
            Box::new(JobFn::new(|conn| {
                Ok(serde_json::json!(conn.is_some()))
            })),
            Some(ResourceType::Database),
        );
        match next.wait_timeout(Duration::from_secs(2)) {
            Ok(out) => assert_eq!(out.value, serde_json::json!(true)),
            Err(e) => panic!("worker did not survive the panic: {e}"),
        }
        assert_eq!(tier.counters().failed.load(Ordering::Relaxed), 1);

        tier.stop();
    }

    #[test]
    fn test_job_receives_pooled_connection() {
        let pool = Arc::new(ConnectionPool::new(ConnectionPoolConfig {
            resource: ResourceType::Cache,
            min_connections: 1,
            max_connections: 2,
            idle_timeout: Duration::from_secs(60),
        }));
        let lookup: Arc<dyn Fn(ResourceType) -> Option<Arc<ConnectionPool>> + Send + Sync> = {
            let pool = Arc::clone(&pool);
            Arc::new(move |resource| (resource == ResourceType::Cache).then(|| Arc::clone(&pool)))
        };

        let mut tier = TierPool::new(Priority::Critical, 1);
        let admitted = Arc::new(AtomicUsize::new(0));
        assert!(tier.start(Arc::clone(&admitted), lookup).is_ok());

        let ticket = submit(
            &tier,
            &admitted,
            Box::new(JobFn::new(|conn| {
                let conn = conn.ok_or_else(|| crate::types::JobError::new("no connection"))?;
                Ok(serde_json::json!(conn.use_count))
            })),
            Some(ResourceType::Cache),
        );

        assert!(ticket.wait_timeout(Duration::from_secs(2)).is_ok());
        // Connection was returned to the pool after the job
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.available_count(), 1);

        tier.stop();
    }
}
