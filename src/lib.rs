//! Egress Gateway - endpoint-routing HTTP gateway over rotating egress proxies
//!
//! ## Features
//!
//! - Logical endpoint table mapping `/<name>/<path>` onto upstream base URLs
//! - Least-recently-used rotation over a fixed pool of HTTP egress proxies
//! - One non-pooling outbound transport per egress proxy, swept periodically
//! - CONNECT tunneling through the selected egress proxy
//! - Bounded admission queue with immediate overload rejection
//! - JSON metrics endpoint

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod repository;

pub use config::Config;
pub use error::{GatewayError, Result};
