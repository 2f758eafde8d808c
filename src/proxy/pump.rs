//! Shared IO plumbing: connection tasks, flushing, and the axe timer.
//!
//! Each socket gets one reader task and one writer task; writers are fed
//! through an mpsc channel so any task that produces bytes for a connection
//! can hand them off without owning the socket. All protocol state lives in
//! the [`CircuitManager`] behind one mutex, which is only ever held across
//! synchronous calls, never across an await.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, Role};
use crate::error::Error;
use crate::mux::{
    CircuitId, CircuitManager, ConnId, DropOutcome, PumpOutcome, RecvEvent, Teardown,
};
use crate::proxy::metrics::ProxyMetrics;

/// Read-buffer size for socket reader tasks.
const READ_BUF: usize = 16 * 1024;

/// Commands fed to a writer task.
#[derive(Debug)]
pub(crate) enum WriteCmd {
    /// Write these bytes.
    Data(Bytes),
    /// Shut down the write half.
    Eof,
}

/// State shared by every task of one proxy instance.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) mux: Mutex<CircuitManager>,
    pub(crate) metrics: Arc<ProxyMetrics>,
    conn_writers: Mutex<HashMap<ConnId, mpsc::Sender<WriteCmd>>>,
    upstream_writers: Mutex<HashMap<CircuitId, mpsc::Sender<WriteCmd>>>,
    axes: Mutex<HashMap<CircuitId, JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            mux: Mutex::new(CircuitManager::new()),
            metrics: Arc::new(ProxyMetrics::new()),
            conn_writers: Mutex::new(HashMap::new()),
            upstream_writers: Mutex::new(HashMap::new()),
            axes: Mutex::new(HashMap::new()),
        })
    }
}

/// Hand the wire bytes and EOF signals of a pump to the affected
/// downstream writer tasks.
pub(crate) async fn flush_pump(shared: &Arc<Shared>, outcome: PumpOutcome) {
    for conn in outcome.written {
        let bytes = shared.mux.lock().take_outbound(conn);
        let Some(bytes) = bytes else { continue };
        shared.metrics.add_bytes_sent(bytes.len() as u64);
        let writer = shared.conn_writers.lock().get(&conn).cloned();
        if let Some(writer) = writer {
            let _ = writer.send(WriteCmd::Data(bytes)).await;
        }
    }
    for conn in outcome.eof_conns {
        let writer = shared.conn_writers.lock().get(&conn).cloned();
        if let Some(writer) = writer {
            let _ = writer.send(WriteCmd::Eof).await;
        }
    }
}

/// Carry out the events a receive call produced.
pub(crate) async fn handle_recv_events(shared: &Arc<Shared>, events: Vec<RecvEvent>) {
    for event in events {
        match event {
            RecvEvent::CircuitOpened(circuit) => {
                shared.metrics.increment_circuits();
                // Only the server learns of circuits from the wire; it
                // answers by dialing the upstream target. The channel is
                // registered before the dial so data events arriving in the
                // same batch are buffered, not lost.
                debug_assert_eq!(shared.config.role, Role::Server);
                let (writer, commands) = mpsc::channel(64);
                shared.upstream_writers.lock().insert(circuit, writer);
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    dial_upstream(shared, circuit, commands).await;
                });
            }
            RecvEvent::ConnBound(circuit) => disarm_axe(shared, circuit),
            RecvEvent::UpstreamData { circuit, data } => {
                let writer = shared.upstream_writers.lock().get(&circuit).cloned();
                match writer {
                    Some(writer) => {
                        if writer.send(WriteCmd::Data(data)).await.is_err() {
                            destroy_circuit(shared, circuit);
                        }
                    }
                    None => destroy_circuit(shared, circuit),
                }
            }
            RecvEvent::UpstreamEof { circuit } => {
                let writer = shared.upstream_writers.lock().get(&circuit).cloned();
                if let Some(writer) = writer {
                    let _ = writer.send(WriteCmd::Eof).await;
                }
            }
        }
    }
}

/// Server side: connect to the upstream target for a freshly demuxed
/// circuit, then run its writer loop.
async fn dial_upstream(
    shared: Arc<Shared>,
    circuit: CircuitId,
    commands: mpsc::Receiver<WriteCmd>,
) {
    match TcpStream::connect(&shared.config.upstream_addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            tracing::debug!(
                circuit = format_args!("{circuit:#018x}"),
                target = %shared.config.upstream_addr,
                "upstream connected"
            );
            let (read_half, write_half) = stream.into_split();
            {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    upstream_reader(shared, circuit, read_half).await;
                });
            }
            upstream_writer(shared, circuit, write_half, commands).await;
        }
        Err(error) => {
            tracing::warn!(
                circuit = format_args!("{circuit:#018x}"),
                %error,
                "upstream connect failed, destroying circuit"
            );
            destroy_circuit(&shared, circuit);
        }
    }
}

/// Start the reader and writer tasks for an upstream socket whose circuit
/// already exists (client side).
pub(crate) fn start_upstream(shared: &Arc<Shared>, circuit: CircuitId, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (writer, commands) = mpsc::channel(64);
    shared.upstream_writers.lock().insert(circuit, writer);

    {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            upstream_reader(shared, circuit, read_half).await;
        });
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        upstream_writer(shared, circuit, write_half, commands).await;
    });
}

/// Pull bytes off the upstream socket and dispatch them as blocks.
async fn upstream_reader(shared: Arc<Shared>, circuit: CircuitId, mut read_half: OwnedReadHalf) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                let outcome = shared.mux.lock().circuit_send_eof(circuit);
                match outcome {
                    Ok(outcome) => flush_pump(&shared, outcome).await,
                    Err(_) => destroy_circuit(&shared, circuit),
                }
                break;
            }
            Ok(n) => {
                let outcome = shared.mux.lock().circuit_send(circuit, &buf[..n]);
                match outcome {
                    Ok(outcome) => flush_pump(&shared, outcome).await,
                    Err(_) => {
                        destroy_circuit(&shared, circuit);
                        break;
                    }
                }
            }
            Err(error) => {
                tracing::debug!(
                    circuit = format_args!("{circuit:#018x}"),
                    %error,
                    "upstream read failed"
                );
                destroy_circuit(&shared, circuit);
                break;
            }
        }
    }
}

/// Write reassembled bytes to the upstream socket.
async fn upstream_writer(
    shared: Arc<Shared>,
    circuit: CircuitId,
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::Receiver<WriteCmd>,
) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            WriteCmd::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    // An upstream write failure is fatal to the circuit.
                    destroy_circuit(&shared, circuit);
                    break;
                }
            }
            WriteCmd::Eof => {
                let _ = write_half.shutdown().await;
            }
        }
    }
}

/// Start the reader and writer tasks for a registered downstream
/// connection.
pub(crate) fn start_conn(shared: &Arc<Shared>, conn: ConnId, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    shared.metrics.increment_connections();
    let (read_half, write_half) = stream.into_split();
    let (writer, commands) = mpsc::channel(64);
    shared.conn_writers.lock().insert(conn, writer);

    {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            conn_writer(shared, conn, write_half, commands).await;
        });
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        conn_reader(&shared, conn, read_half).await;
        shared.metrics.decrement_connections();
    });
}

/// Pull wire bytes off a downstream socket into the multiplexer.
async fn conn_reader(shared: &Arc<Shared>, conn: ConnId, mut read_half: OwnedReadHalf) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                let result = shared.mux.lock().conn_recv_eof(conn);
                match result {
                    Ok((events, outcome)) => {
                        handle_recv_events(shared, events).await;
                        handle_drop(shared, outcome);
                    }
                    Err(error) => fail_conn(shared, conn, error),
                }
                break;
            }
            Ok(n) => {
                shared.metrics.add_bytes_received(n as u64);
                let mut wire = BytesMut::from(&buf[..n]);
                let result = shared.mux.lock().conn_recv(conn, &mut wire);
                match result {
                    Ok(events) => handle_recv_events(shared, events).await,
                    Err(error) => {
                        fail_conn(shared, conn, error);
                        break;
                    }
                }
            }
            Err(error) => {
                tracing::debug!(conn, %error, "downstream read failed");
                let outcome = shared.mux.lock().conn_closed(conn);
                handle_drop(shared, outcome);
                break;
            }
        }
    }
    // If the connection is no longer registered, release its writer so the
    // socket closes once the queue drains.
    if !shared.mux.lock().conn_exists(conn) {
        shared.conn_writers.lock().remove(&conn);
    }
}

/// Write wire bytes to a downstream socket, re-pumping the circuit after
/// each write in case emission was deferred for cover-channel room.
async fn conn_writer(
    shared: Arc<Shared>,
    conn: ConnId,
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::Receiver<WriteCmd>,
) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            WriteCmd::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    let outcome = shared.mux.lock().conn_closed(conn);
                    shared.conn_writers.lock().remove(&conn);
                    handle_drop(&shared, outcome);
                    break;
                }
                let blocked = shared.mux.lock().conn_blocked_circuit(conn);
                if let Some(circuit) = blocked {
                    // Detached so a full own-queue cannot deadlock us.
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let outcome = shared.mux.lock().circuit_pump(circuit);
                        if let Ok(outcome) = outcome {
                            flush_pump(&shared, outcome).await;
                        }
                    });
                }
            }
            WriteCmd::Eof => {
                let _ = write_half.shutdown().await;
            }
        }
    }
}

/// React to a connection leaving its circuit.
pub(crate) fn handle_drop(shared: &Arc<Shared>, outcome: DropOutcome) {
    match outcome {
        DropOutcome::Kept => {}
        DropOutcome::Destroyed(teardown) => apply_teardown(shared, teardown),
        DropOutcome::ArmAxe(circuit) => arm_axe(shared, circuit),
    }
}

/// Give an unfinished circuit that lost its last connection a grace period
/// before destroying it.
fn arm_axe(shared: &Arc<Shared>, circuit: CircuitId) {
    let task_shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(task_shared.config.axe_timeout).await;
        task_shared.axes.lock().remove(&circuit);
        let teardown = task_shared.mux.lock().axe_expired(circuit);
        if let Some(teardown) = teardown {
            tracing::debug!(circuit = format_args!("{circuit:#018x}"), "axe timer fired");
            apply_teardown(&task_shared, teardown);
        }
    });
    if let Some(old) = shared.axes.lock().insert(circuit, handle) {
        old.abort();
    }
}

pub(crate) fn disarm_axe(shared: &Arc<Shared>, circuit: CircuitId) {
    if let Some(handle) = shared.axes.lock().remove(&circuit) {
        handle.abort();
        tracing::debug!(
            circuit = format_args!("{circuit:#018x}"),
            "axe timer disarmed"
        );
    }
}

/// Terminate the circuit owning `conn` after a fatal receive error.
fn fail_conn(shared: &Arc<Shared>, conn: ConnId, error: Error) {
    tracing::warn!(conn, %error, "downstream connection failed");
    if error.is_circuit_fatal() {
        shared.metrics.increment_protocol_errors();
    }
    let teardown = shared.mux.lock().fail_conn(conn);
    shared.conn_writers.lock().remove(&conn);
    if let Some(teardown) = teardown {
        apply_teardown(shared, teardown);
    }
}

/// Tear down a circuit by id.
pub(crate) fn destroy_circuit(shared: &Arc<Shared>, circuit: CircuitId) {
    let teardown = shared.mux.lock().destroy_circuit(circuit);
    if let Some(teardown) = teardown {
        apply_teardown(shared, teardown);
    }
}

/// Release every resource a destroyed circuit still holds. Dropping the
/// writer senders closes the sockets once their queues drain.
fn apply_teardown(shared: &Arc<Shared>, teardown: Teardown) {
    shared.metrics.increment_circuits_closed();
    disarm_axe(shared, teardown.circuit);
    shared.upstream_writers.lock().remove(&teardown.circuit);
    let mut writers = shared.conn_writers.lock();
    for conn in &teardown.conns {
        writers.remove(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownstreamAddr;
    use crate::steg::NoSteg;
    use std::time::Duration;

    fn test_config(axe_ms: u64) -> Config {
        Config {
            role: Role::Client,
            upstream_addr: "127.0.0.1:0".into(),
            downstreams: vec![DownstreamAddr {
                addr: "127.0.0.1:0".into(),
                steg: "nosteg".into(),
            }],
            secret: None,
            trace: false,
            ram_only: true,
            disable_retransmit: false,
            axe_timeout: Duration::from_millis(axe_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_axe_destroys_abandoned_circuit() {
        let shared = Shared::new(test_config(100));

        let conn = {
            let mut mux = shared.mux.lock();
            let conn = mux.register_conn("peer", Box::new(NoSteg::new()));
            let circuit = mux.open_circuit();
            mux.attach(conn, circuit).unwrap();
            conn
        };

        let outcome = shared.mux.lock().conn_closed(conn);
        handle_drop(&shared, outcome);
        assert_eq!(shared.mux.lock().circuit_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(shared.mux.lock().circuit_count(), 0);
        assert_eq!(shared.metrics.circuits_closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_before_axe_saves_circuit() {
        let shared = Shared::new(test_config(100));

        let (circuit, conn) = {
            let mut mux = shared.mux.lock();
            let conn = mux.register_conn("peer", Box::new(NoSteg::new()));
            let circuit = mux.open_circuit();
            mux.attach(conn, circuit).unwrap();
            (circuit, conn)
        };

        let outcome = shared.mux.lock().conn_closed(conn);
        handle_drop(&shared, outcome);

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut mux = shared.mux.lock();
            let replacement = mux.register_conn("replacement", Box::new(NoSteg::new()));
            mux.attach(replacement, circuit).unwrap();
        }
        disarm_axe(&shared, circuit);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(shared.mux.lock().circuit_count(), 1);
    }
}
