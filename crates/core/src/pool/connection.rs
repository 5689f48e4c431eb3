//! Connection Pool - Bounded Reuse With Age-Based Recycling
//!
//! Poll-and-retry acquisition against a bounded pool. Connections are valid
//! while younger than the idle timeout; stale ones are destroyed on the spot
//! and replaced lazily. `max_connections` is atomic so the auto-scaler can
//! resize a live pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{ConnectionHandle, ResourceType};

/// Backoff between acquisition attempts when the pool is saturated
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(100);

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    /// Resource class this pool serves
    pub resource: ResourceType,
    /// Connections kept warm by maintenance
    pub min_connections: usize,
    /// Upper bound on live connections
    pub max_connections: usize,
    /// Age after which a pooled connection is recycled
    pub idle_timeout: Duration,
}

/// Pool counters
#[derive(Debug, Default)]
pub struct ConnectionPoolCounters {
    /// Connections created
    pub created: AtomicU64,
    /// Connections destroyed
    pub destroyed: AtomicU64,
    /// Acquisitions served from the pool
    pub hits: AtomicU64,
    /// Acquisitions that had to create a connection
    pub misses: AtomicU64,
    /// Acquisitions that timed out
    pub timeouts: AtomicU64,
}

/// Point-in-time pool statistics for reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolStats {
    /// Resource class
    pub resource: ResourceType,
    /// Idle connections ready for checkout
    pub available: usize,
    /// Connections currently checked out
    pub active: usize,
    /// Minimum pool size
    pub min_connections: usize,
    /// Current maximum pool size
    pub max_connections: usize,
    /// Connections created over the pool lifetime
    pub created: u64,
    /// Connections destroyed over the pool lifetime
    pub destroyed: u64,
    /// Checkout hit rate percentage
    pub hit_rate_pct: f64,
    /// Acquisitions that timed out
    pub timeouts: u64,
}

/// Bounded connection pool for one resource class
#[derive(Debug)]
pub struct ConnectionPool {
    resource: ResourceType,
    min_connections: usize,
    max_connections: AtomicUsize,
    initial_max: usize,
    idle_timeout: Duration,
    available: Mutex<VecDeque<ConnectionHandle>>,
    active: AtomicUsize,
    counters: ConnectionPoolCounters,
}

impl ConnectionPool {
    /// Create pool pre-warmed to `min_connections`
    #[must_use]
    pub fn new(config: ConnectionPoolConfig) -> Self {
        let pool = Self {
            resource: config.resource,
            min_connections: config.min_connections,
            max_connections: AtomicUsize::new(config.max_connections),
            initial_max: config.max_connections,
            idle_timeout: config.idle_timeout,
            available: Mutex::new(VecDeque::with_capacity(config.max_connections)),
            active: AtomicUsize::new(0),
            counters: ConnectionPoolCounters::default(),
        };

        {
            let mut available = pool.available.lock();
            for _ in 0..config.min_connections {
                available.push_back(ConnectionHandle::new(config.resource));
                pool.counters.created.fetch_add(1, Ordering::Relaxed);
            }
        }

        pool
    }

    /// Acquire a connection, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PoolTimeout`] when no connection frees up or can
    /// be created within the deadline.
    pub fn acquire(&self, timeout: Duration) -> CoreResult<ConnectionHandle> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(conn) = self.try_checkout() {
                return Ok(conn);
            }

            let now = Instant::now();
            if now >= deadline {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::pool_timeout(self.resource.as_str(), timeout));
            }
            std::thread::sleep(ACQUIRE_BACKOFF.min(deadline - now));
        }
    }

    /// Take an idle connection or claim a fresh slot, all under the queue
    /// lock so two acquirers cannot both observe room below the maximum.
    fn try_checkout(&self) -> Option<ConnectionHandle> {
        let mut available = self.available.lock();

        while let Some(mut conn) = available.pop_front() {
            if self.is_valid(&conn) {
                conn.touch();
                self.active.fetch_add(1, Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(conn);
            }
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        }

        let live = available.len() + self.active.load(Ordering::Relaxed);
        if live < self.max_connections.load(Ordering::Relaxed) {
            let mut conn = ConnectionHandle::new(self.resource);
            conn.touch();
            self.active.fetch_add(1, Ordering::Relaxed);
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Some(conn);
        }

        None
    }

    /// Return a connection. Stale connections and overflow beyond the
    /// current maximum are destroyed instead of re-queued.
    pub fn release(&self, conn: ConnectionHandle) {
        self.active.fetch_sub(1, Ordering::Relaxed);

        if !self.is_valid(&conn) {
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let max = self.max_connections.load(Ordering::Relaxed);
        let mut available = self.available.lock();
        if available.len() + self.active.load(Ordering::Relaxed) < max {
            available.push_back(conn);
        } else {
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict stale connections and top the pool back up to the minimum.
    /// Called by the maintenance loop.
    pub fn maintain(&self) {
        let mut available = self.available.lock();

        let before = available.len();
        available.retain(|conn| conn.age() < self.idle_timeout);
        let evicted = before - available.len();
        if evicted > 0 {
            self.counters
                .destroyed
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }

        while available.len() + self.active.load(Ordering::Relaxed) < self.min_connections {
            available.push_back(ConnectionHandle::new(self.resource));
            self.counters.created.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Grow the maximum by `step`, never past `ceiling`. Returns the new
    /// maximum when a change was made.
    pub fn grow_max(&self, step: usize, ceiling: usize) -> Option<usize> {
        let current = self.max_connections.load(Ordering::Relaxed);
        let new_max = (current + step).min(ceiling);
        if new_max > current {
            self.max_connections.store(new_max, Ordering::Relaxed);
            Some(new_max)
        } else {
            None
        }
    }

    /// Shrink the maximum by `step`, never below `min_connections + floor_margin`.
    /// Returns the new maximum when a change was made.
    pub fn shrink_max(&self, step: usize, floor_margin: usize) -> Option<usize> {
        let floor = self.min_connections + floor_margin;
        let current = self.max_connections.load(Ordering::Relaxed);
        let new_max = current.saturating_sub(step).max(floor);
        if new_max < current {
            self.max_connections.store(new_max, Ordering::Relaxed);
            Some(new_max)
        } else {
            None
        }
    }

    /// Resource class this pool serves
    #[must_use]
    pub const fn resource(&self) -> ResourceType {
        self.resource
    }

    /// Current maximum pool size
    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    /// Maximum pool size as configured at construction
    #[must_use]
    pub const fn initial_max_connections(&self) -> usize {
        self.initial_max
    }

    /// Connections currently checked out
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Idle connections ready for checkout
    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ConnectionPoolStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let attempts = hits + misses;
        let hit_rate_pct = if attempts == 0 {
            0.0_f64
        } else {
            f64::from(u32::try_from(hits).unwrap_or(u32::MAX))
                / f64::from(u32::try_from(attempts).unwrap_or(u32::MAX))
                * 100.0_f64
        };

        ConnectionPoolStats {
            resource: self.resource,
            available: self.available_count(),
            active: self.active_count(),
            min_connections: self.min_connections,
            max_connections: self.max_connections(),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            hit_rate_pct,
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    fn is_valid(&self, conn: &ConnectionHandle) -> bool {
        conn.age() < self.idle_timeout
    }
}
