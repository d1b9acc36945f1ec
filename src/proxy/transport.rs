//! Per-egress-proxy outbound transports
//!
//! Each egress proxy gets its own HTTP client that never reuses connections,
//! so separate client requests are never bundled onto one egress socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::ProxyEndpoint;

/// Settings shared by every transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Whole-request deadline
    pub request_timeout: Duration,
    /// Deadline for dialing the egress proxy
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Outbound client configuration bound to one egress proxy identity
pub struct TransportHandle {
    proxy_url: String,
    config: TransportConfig,
    client: ArcSwap<reqwest::Client>,
    generation: AtomicU64,
}

impl TransportHandle {
    pub fn new(proxy_url: &str, config: TransportConfig) -> Result<Self> {
        let client = build_client(proxy_url, &config)?;
        Ok(Self {
            proxy_url: proxy_url.to_string(),
            config,
            client: ArcSwap::from_pointee(client),
            generation: AtomicU64::new(0),
        })
    }

    /// Current client; cheap to clone
    pub fn client(&self) -> reqwest::Client {
        self.client.load().as_ref().clone()
    }

    /// Drop idle sockets by swapping in a client rebuilt from the stored
    /// configuration. Requests already in flight keep the old pool alive until
    /// they finish.
    pub fn release_idle(&self) -> Result<()> {
        let client = build_client(&self.proxy_url, &self.config)?;
        self.client.store(Arc::new(client));
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of times idle sockets were released
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

fn build_client(proxy_url: &str, config: &TransportConfig) -> Result<reqwest::Client> {
    // Credentials embedded in the URL become Proxy-Authorization.
    let proxy = reqwest::Proxy::all(proxy_url)?;

    let client = reqwest::Client::builder()
        .proxy(proxy)
        .http1_only()
        .pool_max_idle_per_host(0)
        .tcp_keepalive(None::<Duration>)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    Ok(client)
}

/// Concurrent get-or-create cache of transports keyed by proxy identity
pub struct TransportCache {
    handles: DashMap<String, Arc<TransportHandle>>,
    config: TransportConfig,
}

impl TransportCache {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            handles: DashMap::new(),
            config,
        }
    }

    /// Get the transport for a proxy, creating it on first use.
    ///
    /// Creation happens under the entry lock, so one identity never ends up
    /// with two handles.
    pub fn get(&self, proxy: &ProxyEndpoint) -> Result<Arc<TransportHandle>> {
        if let Some(handle) = self.handles.get(&proxy.identity) {
            return Ok(handle.clone());
        }

        let handle = self
            .handles
            .entry(proxy.identity.clone())
            .or_try_insert_with(|| {
                debug!(proxy = %proxy.address(), "Creating transport");
                TransportHandle::new(&proxy.identity, self.config.clone()).map(Arc::new)
            })?;

        Ok(handle.clone())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Release idle sockets on every cached transport. Handles are kept.
    pub fn sweep(&self) -> usize {
        let handles: Vec<Arc<TransportHandle>> = self
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut swept = 0;
        for handle in handles {
            match handle.release_idle() {
                Ok(()) => swept += 1,
                Err(e) => warn!("Failed to rebuild transport: {}", e),
            }
        }
        swept
    }
}

/// Background task that periodically sweeps the transport cache
pub struct TransportSweeper {
    cache: Arc<TransportCache>,
    interval: Duration,
}

impl TransportSweeper {
    pub fn new(cache: Arc<TransportCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// Run the sweeper (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting transport sweeper with {}s interval",
            self.interval.as_secs()
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.cache.sweep();
                    info!(transports = swept, "Transport pool swept");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Transport sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
