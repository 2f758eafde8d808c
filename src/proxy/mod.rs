//! The IO engine.
//!
//! Plugs the synchronous multiplexer core into tokio sockets and timers.
//! The client end listens for upstream connections and braids each one
//! across the configured downstream links; the server end listens on the
//! downstream links, demuxes blocks back into circuits, and dials the
//! upstream target for each circuit it learns about.

mod client;
mod metrics;
mod pump;
mod server;

pub use metrics::ProxyMetrics;

use std::sync::Arc;

use crate::config::{Config, Role};
use crate::error::Result;
use pump::Shared;

/// One running proxy instance: a circuit table, its connections, and the
/// tasks that pump them.
pub struct Proxy {
    shared: Arc<Shared>,
}

impl Proxy {
    /// Create a proxy instance from a validated configuration.
    pub fn new(config: Config) -> Self {
        Self {
            shared: Shared::new(config),
        }
    }

    /// Run until the listener fails. Circuits come and go underneath.
    pub async fn run(&self) -> Result<()> {
        match self.shared.config.role {
            Role::Client => client::run(Arc::clone(&self.shared)).await,
            Role::Server => server::run(Arc::clone(&self.shared)).await,
        }
    }

    /// Operational counters for this instance.
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Number of live circuits.
    pub fn circuit_count(&self) -> usize {
        self.shared.mux.lock().circuit_count()
    }
}
