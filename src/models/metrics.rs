use serde::{Deserialize, Serialize};

/// Liveness payload served on the gateway listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: String,
    pub active_proxies: usize,
    pub total_proxies: usize,
    pub workers: usize,
    pub queue_size: usize,
}

/// Counters and derived figures served on the metrics listener
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_connections: i64,
    pub total_proxies: usize,
    pub uptime_seconds: u64,
    pub uptime_human: String,
    pub requests_per_second: f64,
    pub average_response_ms: f64,
    pub endpoints: Vec<String>,
}
