//! Process-wide request counters and response-time samples
//!
//! Counters are plain atomics; the response-time window is a bounded FIFO
//! behind a mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::MetricsSnapshot;

/// Number of response-time samples kept for the rolling average
pub const RESPONSE_SAMPLE_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct Metrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_connections: AtomicI64,
    response_times: Mutex<VecDeque<Duration>>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            response_times: Mutex::new(VecDeque::with_capacity(RESPONSE_SAMPLE_CAPACITY)),
            started_at: Instant::now(),
        }
    }

    pub fn increment_total(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_successful(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Count an in-flight request until the returned guard is dropped
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        ConnectionGuard::new(self.clone())
    }

    /// Record a response time, evicting the oldest sample when full
    pub fn record_response_time(&self, duration: Duration) {
        let mut samples = self.response_times.lock();
        if samples.len() == RESPONSE_SAMPLE_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(duration);
    }

    /// Mean of the retained samples in milliseconds, 0 when empty
    pub fn average_response_ms(&self) -> f64 {
        let samples = self.response_times.lock();
        if samples.is_empty() {
            return 0.0;
        }

        let total: Duration = samples.iter().sum();
        total.as_secs_f64() * 1000.0 / samples.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.response_times.lock().len()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self, total_proxies: usize, endpoints: Vec<String>) -> MetricsSnapshot {
        let uptime = self.uptime();
        let total_requests = self.total_requests();
        let requests_per_second = if uptime.as_secs_f64() > 0.0 {
            total_requests as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        MetricsSnapshot {
            total_requests,
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            active_connections: self.active_connections(),
            total_proxies,
            uptime_seconds: uptime.as_secs(),
            uptime_human: format_uptime(uptime),
            requests_per_second,
            average_response_ms: self.average_response_ms(),
            endpoints,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for tracking active connections
pub struct ConnectionGuard {
    metrics: Arc<Metrics>,
}

impl ConnectionGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Render an uptime as `1d 2h 3m 4s`, omitting leading zero units
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let days = secs / 86_400;
    let hours = (secs / 3_600) % 24;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
