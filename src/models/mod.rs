pub mod metrics;
pub mod proxy;

pub use metrics::*;
pub use proxy::*;
