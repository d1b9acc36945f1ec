use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::models::{EgressProxy, ProxyEndpoint, ProxyRecord};

/// Repository for the egress proxy list file
#[derive(Debug, Clone)]
pub struct ProxyRepository {
    path: PathBuf,
}

impl ProxyRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load every proxy in file order
    pub async fn get_all(&self) -> Result<Vec<EgressProxy>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GatewayError::InvalidConfig(format!(
                "cannot read proxy list {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let proxies = parse_proxy_list(&raw).map_err(|e| {
            GatewayError::InvalidConfig(format!(
                "invalid proxy list {}: {}",
                self.path.display(),
                e
            ))
        })?;

        if proxies.is_empty() {
            warn!(file = %self.path.display(), "Proxy list is empty");
        } else {
            info!(
                count = proxies.len(),
                file = %self.path.display(),
                "Loaded egress proxies"
            );
        }

        Ok(proxies)
    }
}

/// Parse a JSON array of `{host, port, user?, pass?}` records
pub fn parse_proxy_list(raw: &str) -> Result<Vec<EgressProxy>> {
    let records: Vec<ProxyRecord> = serde_json::from_str(raw)?;

    records
        .iter()
        .map(|record| ProxyEndpoint::from_record(record).map(EgressProxy::new))
        .collect()
}
