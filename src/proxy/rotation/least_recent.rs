//! Least-recently-used egress proxy selection

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;

use super::ProxySelector;
use crate::error::{GatewayError, Result};
use crate::models::{EgressProxy, ProxyEndpoint, ProxyStats};

/// Selects the proxy that has gone unused the longest
///
/// A never-used proxy wins immediately; ties fall to pool order. Selection and
/// error recording are the only mutations, both under the write lock.
pub struct LeastRecentlyUsedSelector {
    proxies: RwLock<Vec<EgressProxy>>,
}

impl LeastRecentlyUsedSelector {
    /// Build the pool. An empty list is a configuration error.
    pub fn new(proxies: Vec<EgressProxy>) -> Result<Self> {
        if proxies.is_empty() {
            return Err(GatewayError::NoEgressAvailable);
        }

        Ok(Self {
            proxies: RwLock::new(proxies),
        })
    }

    fn select_at(&self, now: DateTime<Utc>) -> Result<Arc<ProxyEndpoint>> {
        let mut proxies = self.proxies.write();

        if proxies.is_empty() {
            return Err(GatewayError::NoEgressAvailable);
        }

        let mut oldest = now;
        let mut selected: Option<usize> = None;
        for (idx, proxy) in proxies.iter().enumerate() {
            match proxy.last_used_at {
                None => {
                    selected = Some(idx);
                    break;
                }
                Some(last_used) if last_used < oldest => {
                    oldest = last_used;
                    selected = Some(idx);
                }
                Some(_) => {}
            }
        }

        // Every proxy was stamped at or after `now`
        let idx = selected.unwrap_or_else(|| rand::thread_rng().gen_range(0..proxies.len()));

        let proxy = &mut proxies[idx];
        proxy.last_used_at = Some(now);
        proxy.usage_count += 1;

        Ok(proxy.endpoint.clone())
    }
}

impl ProxySelector for LeastRecentlyUsedSelector {
    fn select(&self) -> Result<Arc<ProxyEndpoint>> {
        self.select_at(Utc::now())
    }

    fn record_error(&self, identity: &str) -> bool {
        let mut proxies = self.proxies.write();
        match proxies.iter_mut().find(|p| p.identity() == identity) {
            Some(proxy) => {
                proxy.error_count += 1;
                true
            }
            None => false,
        }
    }

    fn total_count(&self) -> usize {
        self.proxies.read().len()
    }

    fn stats(&self) -> Vec<ProxyStats> {
        self.proxies.read().iter().map(EgressProxy::stats).collect()
    }

    fn strategy_name(&self) -> &'static str {
        "least_recently_used"
    }
}
