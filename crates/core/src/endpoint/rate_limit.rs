//! Sliding-Window Rate Limiter
//!
//! True 60-second window over request admission timestamps. Old entries are
//! pruned on every check so the count never overshoots the configured
//! per-minute limit.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter for one endpoint
#[derive(Debug)]
pub struct RateLimiter {
    limit_rpm: u32,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create limiter with a requests-per-minute budget
    #[must_use]
    pub fn new(limit_rpm: u32) -> Self {
        Self {
            limit_rpm,
            admitted: Mutex::new(VecDeque::with_capacity(limit_rpm as usize)),
        }
    }

    /// Try to admit a request at `now`. Admission stamps the window.
    pub fn try_admit_at(&self, now: Instant) -> bool {
        let mut admitted = self.admitted.lock();
        Self::prune(&mut admitted, now);

        if admitted.len() < self.limit_rpm as usize {
            admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Try to admit a request now
    pub fn try_admit(&self) -> bool {
        self.try_admit_at(Instant::now())
    }

    /// Requests admitted within the current window
    pub fn current_rpm(&self) -> u32 {
        self.current_rpm_at(Instant::now())
    }

    /// Requests admitted within the window ending at `now`
    pub fn current_rpm_at(&self, now: Instant) -> u32 {
        let mut admitted = self.admitted.lock();
        Self::prune(&mut admitted, now);
        u32::try_from(admitted.len()).unwrap_or(u32::MAX)
    }

    /// Configured per-minute budget
    #[must_use]
    pub const fn limit_rpm(&self) -> u32 {
        self.limit_rpm
    }

    fn prune(admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = admitted.front() {
            if now.duration_since(front) >= WINDOW {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}
