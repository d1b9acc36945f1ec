//! Metrics API server
//!
//! Read-only JSON views of the gateway counters and the egress proxy pool.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
