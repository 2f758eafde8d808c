//! Server role: listen on the downstream links, demux incoming blocks to
//! circuits, dial the upstream target per circuit.

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::DownstreamAddr;
use crate::error::Result;
use crate::proxy::pump::{self, Shared};
use crate::steg;

/// Listen on every configured downstream address.
pub(crate) async fn run(shared: Arc<Shared>) -> Result<()> {
    let mut listeners = Vec::new();
    for down in shared.config.downstreams.clone() {
        let shared = Arc::clone(&shared);
        listeners.push(tokio::spawn(async move {
            if let Err(error) = listen(shared, down).await {
                tracing::error!(%error, "downstream listener failed");
            }
        }));
    }
    for listener in listeners {
        let _ = listener.await;
    }
    Ok(())
}

async fn listen(shared: Arc<Shared>, down: DownstreamAddr) -> Result<()> {
    let listener = TcpListener::bind(&down.addr).await?;
    tracing::info!("braid server listening on {} ({})", down.addr, down.steg);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!("downstream connection from {}", peer);
                // The connection stays loose until its first block names a
                // circuit.
                let adapter = steg::by_name(&down.steg)?;
                let conn = shared.mux.lock().register_conn(peer.to_string(), adapter);
                pump::start_conn(&shared, conn, stream);
            }
            Err(error) => {
                tracing::warn!(%error, "accept error");
            }
        }
    }
}
