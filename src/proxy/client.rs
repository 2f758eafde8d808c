//! Client role: accept upstream connections, braid each across the
//! configured downstream links.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::proxy::pump::{self, Shared};
use crate::steg;

/// Listen for upstream connections and tunnel each one.
pub(crate) async fn run(shared: Arc<Shared>) -> Result<()> {
    let listener = TcpListener::bind(&shared.config.upstream_addr).await?;
    tracing::info!("braid client listening on {}", shared.config.upstream_addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!("upstream connection from {}", peer);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(error) = open_tunnel(&shared, stream).await {
                        tracing::warn!(%error, "tunnel setup failed");
                    }
                });
            }
            Err(error) => {
                tracing::warn!(%error, "accept error");
            }
        }
    }
}

/// Open a circuit for one upstream connection: dial every configured
/// downstream link, attach them all, and start the pumps.
async fn open_tunnel(shared: &Arc<Shared>, upstream: TcpStream) -> Result<()> {
    let mut dialed = Vec::new();
    for down in &shared.config.downstreams {
        match TcpStream::connect(&down.addr).await {
            Ok(stream) => dialed.push((stream, down.clone())),
            Err(error) => {
                tracing::warn!(addr = %down.addr, %error, "downstream dial failed");
            }
        }
    }
    if dialed.is_empty() {
        return Err(Error::Network(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "no downstream link could be established",
        )));
    }

    let mut conns = Vec::with_capacity(dialed.len());
    let circuit = {
        let mut mux = shared.mux.lock();
        let circuit = mux.open_circuit();
        for (stream, down) in dialed {
            let adapter = steg::by_name(&down.steg)?;
            let conn = mux.register_conn(down.addr, adapter);
            mux.attach(conn, circuit)?;
            conns.push((conn, stream));
        }
        circuit
    };
    shared.metrics.increment_circuits();
    tracing::debug!(
        circuit = format_args!("{circuit:#018x}"),
        downstreams = conns.len(),
        "tunnel opened"
    );

    for (conn, stream) in conns {
        pump::start_conn(shared, conn, stream);
    }
    pump::start_upstream(shared, circuit, upstream);
    Ok(())
}
