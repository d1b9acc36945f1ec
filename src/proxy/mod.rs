//! Gateway core
//!
//! This module provides:
//! - Endpoint resolution and request dispatch
//! - Egress proxy rotation
//! - Per-proxy outbound transports
//! - CONNECT tunnels
//! - The admission queue and worker pool

pub mod egress;
pub mod endpoints;
pub mod handler;
pub mod rotation;
pub mod server;
pub mod transport;
pub mod tunnel;
pub mod worker;

pub use endpoints::EndpointTable;
pub use handler::{GatewayHandler, GatewayHandlerConfig, ProxyBody};
pub use rotation::{LeastRecentlyUsedSelector, ProxySelector};
pub use server::ProxyServer;
pub use transport::{TransportCache, TransportConfig, TransportSweeper};
pub use tunnel::TunnelHandler;
pub use worker::{RequestProcessor, Responder, WorkerPool};
