//! Egress proxy rotation
//!
//! The pool owns every egress proxy record; selection and error recording are
//! its only mutation entry points.

mod least_recent;

pub use least_recent::LeastRecentlyUsedSelector;

use std::sync::Arc;

use crate::error::Result;
use crate::models::{ProxyEndpoint, ProxyStats};

/// Trait for egress proxy selection policies
pub trait ProxySelector: Send + Sync {
    /// Select a proxy and stamp its usage bookkeeping
    ///
    /// Returns an error only if the pool is empty
    fn select(&self) -> Result<Arc<ProxyEndpoint>>;

    /// Count a failed use against the proxy with this identity
    ///
    /// Failing proxies stay in rotation. Returns false for an unknown identity.
    fn record_error(&self, identity: &str) -> bool;

    /// Number of proxies in the pool
    fn total_count(&self) -> usize;

    /// Per-proxy usage snapshot in pool order
    fn stats(&self) -> Vec<ProxyStats>;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}
