use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatewayError, Result};

/// One entry of the proxy list file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub host: String,
    pub port: u16,
    #[serde(default, alias = "username")]
    pub user: Option<String>,
    #[serde(default, alias = "password")]
    pub pass: Option<String>,
}

/// Immutable identity of an egress proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Normalized connection URL, the lookup key everywhere
    pub identity: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// Derive the endpoint and its identity URL from a list record.
    ///
    /// Credentials are embedded only when both user and password are present.
    pub fn from_record(record: &ProxyRecord) -> Result<Self> {
        let host = record.host.trim();
        if host.is_empty() {
            return Err(GatewayError::InvalidProxyAddress(
                "proxy host must not be empty".to_string(),
            ));
        }

        let credentials = match (non_empty(&record.user), non_empty(&record.pass)) {
            (Some(user), Some(pass)) => Some((user.to_string(), pass.to_string())),
            _ => None,
        };

        let address = format_tcp_addr(host, record.port);
        let mut url = Url::parse(&format!("http://{}", address)).map_err(|e| {
            GatewayError::InvalidProxyAddress(format!("Invalid address '{}': {}", address, e))
        })?;

        if let Some((user, pass)) = &credentials {
            url.set_username(user)
                .and_then(|_| url.set_password(Some(pass)))
                .map_err(|_| {
                    GatewayError::InvalidProxyAddress(format!(
                        "cannot embed credentials for '{}'",
                        address
                    ))
                })?;
        }

        let (username, password) = match credentials {
            Some((user, pass)) => (Some(user), Some(pass)),
            None => (None, None),
        };

        Ok(Self {
            identity: url.as_str().trim_end_matches('/').to_string(),
            host: host.to_string(),
            port: record.port,
            username,
            password,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        format_tcp_addr(&self.host, self.port)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// An egress proxy together with its usage bookkeeping
#[derive(Debug)]
pub struct EgressProxy {
    pub endpoint: Arc<ProxyEndpoint>,
    pub usage_count: u64,
    pub error_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl EgressProxy {
    pub fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            usage_count: 0,
            error_count: 0,
            last_used_at: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.endpoint.identity
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            usage_count: self.usage_count,
            error_count: self.error_count,
            last_used: self.last_used_at,
        }
    }
}

/// Per-proxy statistics exposed on the metrics endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyStats {
    pub host: String,
    pub port: u16,
    pub usage_count: u64,
    pub error_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

pub(crate) fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
