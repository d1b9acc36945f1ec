use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{GatewayError, Result};

const DEFAULT_LISTEN_ADDR: &str = ":8082";
const DEFAULT_PROXIES_FILE: &str = "proxies.json";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_WORKER_COUNT: usize = 2000;
const MAX_WORKER_COUNT: usize = 1_000_000;
const DEFAULT_METRICS_ADDR: &str = ":9090";
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_IDLE_CONNS: usize = 10_000;
const DEFAULT_RELAY_BUFFER_SIZE: usize = 256 * 1024;
const MIN_RELAY_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;

/// Built-in logical endpoints used when the config file does not name any
pub const DEFAULT_ENDPOINTS: &[(&str, &str)] = &[
    ("jitoNY", "https://ny.mainnet.block-engine.jito.wtf"),
    ("jitoTOKIO", "https://tokyo.mainnet.block-engine.jito.wtf"),
    ("jitoSLC", "https://slc.mainnet.block-engine.jito.wtf"),
    ("jitoAMSTERDAM", "https://amsterdam.mainnet.block-engine.jito.wtf"),
    ("jitoFRANKFURT", "https://frankfurt.mainnet.block-engine.jito.wtf"),
    ("jitoLONDON", "https://london.mainnet.block-engine.jito.wtf"),
];

/// Gateway configuration loaded from a JSON file, with environment overrides.
///
/// Zero or empty values are treated as "not set" and replaced by defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the gateway listens on (default: ":8082")
    pub listen_addr: String,
    /// JSON file holding the egress proxy list
    pub proxies_file: String,
    /// Per-request timeout in seconds
    pub timeout: u64,
    /// Number of workers draining the admission queue
    pub worker_count: usize,
    /// Address of the metrics endpoint (default: ":9090")
    pub metrics_addr: String,
    /// Proxy check interval in seconds. Carried for compatibility; the
    /// gateway never deactivates proxies.
    pub check_interval: u64,
    /// Idle connection budget. Carried for compatibility; egress paths
    /// keep no idle connections.
    pub max_idle_conns: usize,
    /// Buffer used for body streaming and tunnel relays, in bytes
    pub relay_buffer_size: usize,
    /// Interval between idle transport sweeps, in seconds
    pub transport_sweep_interval: u64,
    /// Logical endpoint name -> upstream base URL
    pub endpoints: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl LogConfig {
    /// Load logging configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            level: get_env_or("LOG_LEVEL", "info"),
            format: get_env_or("LOG_FORMAT", "pretty"),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides
    /// and defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_json(&raw)
    }

    /// Parse configuration from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(raw)
            .map_err(|e| GatewayError::InvalidConfig(format!("malformed config: {}", e)))?;

        config.apply_env_overrides()?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = env::var("GATEWAY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(addr) = env::var("GATEWAY_METRICS_ADDR") {
            self.metrics_addr = addr;
        }
        if let Ok(file) = env::var("GATEWAY_PROXIES_FILE") {
            self.proxies_file = file;
        }
        if let Ok(timeout) = env::var("GATEWAY_TIMEOUT") {
            self.timeout = timeout.parse().map_err(|_| {
                GatewayError::InvalidConfig("GATEWAY_TIMEOUT must be a number of seconds".into())
            })?;
        }
        if let Ok(workers) = env::var("GATEWAY_WORKER_COUNT") {
            self.worker_count = workers.parse().map_err(|_| {
                GatewayError::InvalidConfig("GATEWAY_WORKER_COUNT must be a valid number".into())
            })?;
        }
        Ok(())
    }

    fn apply_defaults(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if self.proxies_file.is_empty() {
            self.proxies_file = DEFAULT_PROXIES_FILE.to_string();
        }
        if self.timeout == 0 {
            self.timeout = DEFAULT_TIMEOUT_SECS;
        }
        if self.worker_count == 0 {
            self.worker_count = DEFAULT_WORKER_COUNT;
        }
        if self.metrics_addr.is_empty() {
            self.metrics_addr = DEFAULT_METRICS_ADDR.to_string();
        }
        if self.check_interval == 0 {
            self.check_interval = DEFAULT_CHECK_INTERVAL_SECS;
        }
        if self.max_idle_conns == 0 {
            self.max_idle_conns = DEFAULT_MAX_IDLE_CONNS;
        }
        if self.relay_buffer_size == 0 {
            self.relay_buffer_size = DEFAULT_RELAY_BUFFER_SIZE;
        }
        self.relay_buffer_size = self.relay_buffer_size.max(MIN_RELAY_BUFFER_SIZE);
        if self.transport_sweep_interval == 0 {
            self.transport_sweep_interval = DEFAULT_SWEEP_INTERVAL_SECS;
        }
        if self.endpoints.is_empty() {
            self.endpoints = DEFAULT_ENDPOINTS
                .iter()
                .map(|(name, url)| (name.to_string(), url.to_string()))
                .collect();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_count > MAX_WORKER_COUNT {
            return Err(GatewayError::InvalidConfig(format!(
                "worker_count {} exceeds the limit of {}",
                self.worker_count, MAX_WORKER_COUNT
            )));
        }

        for (name, base) in &self.endpoints {
            if name.is_empty() || name.contains('/') {
                return Err(GatewayError::InvalidConfig(format!(
                    "endpoint name '{}' must be a single non-empty path segment",
                    name
                )));
            }

            let url = Url::parse(base).map_err(|e| {
                GatewayError::InvalidConfig(format!(
                    "endpoint '{}' has an invalid base URL: {}",
                    name, e
                ))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(GatewayError::InvalidConfig(format!(
                    "endpoint '{}' must use http or https",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Get the proxy listener bind address
    pub fn proxy_addr(&self) -> String {
        bind_addr(&self.listen_addr)
    }

    /// Get the metrics listener bind address
    pub fn metrics_bind_addr(&self) -> String {
        bind_addr(&self.metrics_addr)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.transport_sweep_interval)
    }

    /// Admission queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.worker_count.saturating_mul(2)
    }
}

/// Resolve the config file path from `--config <path>`, `GATEWAY_CONFIG`, or
/// the default `config.json`
pub fn config_path() -> String {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-config" {
            if let Some(path) = args.next() {
                return path;
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return path.to_string();
        }
    }

    get_env_or("GATEWAY_CONFIG", "config.json")
}

/// Expand a `:port` shorthand into an all-interfaces address
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
