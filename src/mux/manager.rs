//! Circuit table and block demultiplexing.
//!
//! The manager owns every circuit and downstream connection of one proxy
//! instance. Arriving wire bytes are framed into blocks here, demuxed to
//! their circuit by the 64-bit id in the header, and queued for reassembly;
//! transmit entry points forward to the owning circuit's dispatcher. All
//! methods are synchronous: the IO driver calls in from its event
//! callbacks and carries out the returned events and outcomes.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mux::circuit::{Circuit, CircuitState, PumpOutcome};
use crate::mux::downstream::Downstream;
use crate::mux::header::BlockHeader;
use crate::mux::{CircuitId, ConnId, MIN_BLOCK};
use crate::rng::SecureRandom;
use crate::steg::StegAdapter;

/// Things the IO driver must act on after feeding received bytes.
#[derive(Debug)]
pub enum RecvEvent {
    /// The first block of an unknown circuit arrived; the driver should
    /// open the corresponding upstream connection.
    CircuitOpened(CircuitId),
    /// A loose connection bound itself to an already-existing circuit; the
    /// driver should disarm any axe timer armed for it.
    ConnBound(CircuitId),
    /// Reassembled bytes are ready for the upstream peer.
    UpstreamData {
        /// Owning circuit
        circuit: CircuitId,
        /// Bytes in strict stream order
        data: Bytes,
    },
    /// The peer's FIN was delivered; signal EOF upstream.
    UpstreamEof {
        /// Owning circuit
        circuit: CircuitId,
    },
}

/// What became of a circuit when a downstream connection left it.
#[derive(Debug)]
pub enum DropOutcome {
    /// The connection was not bound to any circuit (or stays attached).
    Kept,
    /// Both FINs were already exchanged; the circuit is gone.
    Destroyed(Teardown),
    /// The circuit lost its last connection before finishing. The driver
    /// should arm the axe timer and call [`CircuitManager::axe_expired`]
    /// if nothing reattaches in time.
    ArmAxe(CircuitId),
}

/// Everything the IO driver must close when a circuit is destroyed.
#[derive(Debug)]
pub struct Teardown {
    /// The destroyed circuit
    pub circuit: CircuitId,
    /// Downstream connections that were still attached to it
    pub conns: Vec<ConnId>,
}

/// Owns the circuit table and the downstream connections of one instance.
#[derive(Default)]
pub struct CircuitManager {
    circuits: HashMap<CircuitId, Circuit>,
    conns: HashMap<ConnId, Downstream>,
    next_conn_id: ConnId,
}

impl CircuitManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a downstream transport with its cover module. The
    /// connection starts loose; attach it explicitly (initiator side) or
    /// let its first received block bind it (listener side).
    pub fn register_conn(
        &mut self,
        peer: impl Into<String>,
        adapter: Box<dyn StegAdapter>,
    ) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let peer = peer.into();
        tracing::debug!(conn = id, %peer, "registered downstream connection");
        self.conns.insert(id, Downstream::new(id, peer, adapter));
        id
    }

    /// Open a locally-initiated circuit under a fresh random id.
    pub fn open_circuit(&mut self) -> CircuitId {
        loop {
            let id = SecureRandom::u64();
            if id != 0 && !self.circuits.contains_key(&id) {
                self.circuits.insert(id, Circuit::new(id));
                tracing::debug!(circuit = format_args!("{id:#018x}"), "opened circuit");
                return id;
            }
        }
    }

    /// Attach a registered connection to a circuit.
    ///
    /// The driver must also disarm any axe timer it armed for the circuit.
    pub fn attach(&mut self, conn: ConnId, circuit: CircuitId) -> Result<()> {
        let downstream = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn))?;
        if let Some(bound) = downstream.circuit() {
            return Err(Error::protocol(format!(
                "connection already bound to circuit {bound:#018x}"
            )));
        }
        let target = self
            .circuits
            .get_mut(&circuit)
            .ok_or(Error::UnknownCircuit(circuit))?;
        downstream.bind(circuit);
        target.attach(conn);
        Ok(())
    }

    /// Feed wire bytes received on a downstream connection.
    ///
    /// Consumes `wire`, runs it through the connection's cover module,
    /// frames complete blocks, and reassembles. Any error is fatal to the
    /// owning circuit; the driver should follow up with
    /// [`CircuitManager::fail_conn`].
    pub fn conn_recv(&mut self, conn: ConnId, wire: &mut BytesMut) -> Result<Vec<RecvEvent>> {
        let downstream = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn))?;
        downstream.push_wire(wire)?;
        self.process_inbound(conn)
    }

    /// The peer half-closed a downstream connection.
    ///
    /// EOF on a connection is not EOF on the circuit; that only comes from
    /// a delivered FIN. Remaining buffered blocks are drained, and the
    /// connection is detached only once our own FIN is out — until then
    /// the write side is still in use.
    pub fn conn_recv_eof(&mut self, conn: ConnId) -> Result<(Vec<RecvEvent>, DropOutcome)> {
        let events = if self.conns.get(&conn).is_some_and(|d| d.circuit().is_some()) {
            self.process_inbound(conn)?
        } else {
            Vec::new()
        };

        let sent_fin = self
            .conns
            .get(&conn)
            .and_then(|d| d.circuit())
            .and_then(|id| self.circuits.get(&id))
            .map(|c| c.sent_fin());

        let outcome = match sent_fin {
            Some(true) | None => self.drop_conn(conn),
            Some(false) => DropOutcome::Kept,
        };
        Ok((events, outcome))
    }

    /// A downstream connection is gone (error or full close).
    pub fn conn_closed(&mut self, conn: ConnId) -> DropOutcome {
        self.drop_conn(conn)
    }

    /// Append upstream bytes to a circuit and emit whatever full blocks
    /// they complete.
    pub fn circuit_send(&mut self, circuit: CircuitId, data: &[u8]) -> Result<PumpOutcome> {
        let target = self
            .circuits
            .get_mut(&circuit)
            .ok_or(Error::UnknownCircuit(circuit))?;
        target.queue_upstream(data);
        target.pump(&mut self.conns)
    }

    /// The upstream half-closed: flush remaining data and carry the FIN
    /// out, on the final data block or on chaff.
    pub fn circuit_send_eof(&mut self, circuit: CircuitId) -> Result<PumpOutcome> {
        let target = self
            .circuits
            .get_mut(&circuit)
            .ok_or(Error::UnknownCircuit(circuit))?;
        target.request_eof();
        target.pump(&mut self.conns)
    }

    /// Resume deferred block emission, e.g. after a cover channel drained.
    pub fn circuit_pump(&mut self, circuit: CircuitId) -> Result<PumpOutcome> {
        let target = self
            .circuits
            .get_mut(&circuit)
            .ok_or(Error::UnknownCircuit(circuit))?;
        target.pump(&mut self.conns)
    }

    /// Take wire bytes queued on a connection's outbound buffer.
    pub fn take_outbound(&mut self, conn: ConnId) -> Option<Bytes> {
        self.conns.get_mut(&conn).and_then(|d| d.take_outbound())
    }

    /// Tear down a circuit, detaching and removing all its connections.
    pub fn destroy_circuit(&mut self, circuit: CircuitId) -> Option<Teardown> {
        let target = self.circuits.remove(&circuit)?;
        let conns = target.downstreams().to_vec();
        for id in &conns {
            self.conns.remove(id);
        }
        tracing::debug!(
            circuit = format_args!("{circuit:#018x}"),
            conns = conns.len(),
            "destroyed circuit"
        );
        Some(Teardown { circuit, conns })
    }

    /// The axe timer fired. Destroys the circuit unless a connection
    /// reattached since the timer was armed.
    pub fn axe_expired(&mut self, circuit: CircuitId) -> Option<Teardown> {
        match self.circuits.get(&circuit) {
            Some(target) if target.downstream_count() == 0 => self.destroy_circuit(circuit),
            _ => None,
        }
    }

    /// Terminate the circuit owning `conn` after a fatal error. A loose
    /// connection is simply discarded.
    pub fn fail_conn(&mut self, conn: ConnId) -> Option<Teardown> {
        match self.conns.get(&conn).and_then(|d| d.circuit()) {
            Some(circuit) => self.destroy_circuit(circuit),
            None => {
                self.conns.remove(&conn);
                None
            }
        }
    }

    /// Observable state of a circuit.
    pub fn circuit_state(&self, circuit: CircuitId) -> Option<CircuitState> {
        self.circuits.get(&circuit).map(|c| c.state())
    }

    /// The circuit a connection is bound to, if any.
    pub fn conn_circuit(&self, conn: ConnId) -> Option<CircuitId> {
        self.conns.get(&conn).and_then(|d| d.circuit())
    }

    /// True while the connection is registered.
    pub fn conn_exists(&self, conn: ConnId) -> bool {
        self.conns.contains_key(&conn)
    }

    /// The connection's circuit, if its dispatcher is waiting for cover
    /// channel room. Checked after a downstream write completes.
    pub fn conn_blocked_circuit(&self, conn: ConnId) -> Option<CircuitId> {
        let circuit = self.conn_circuit(conn)?;
        self.circuits
            .get(&circuit)
            .filter(|c| c.is_blocked())
            .map(|c| c.id())
    }

    /// Number of live circuits.
    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }

    /// Number of registered downstream connections.
    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    fn drop_conn(&mut self, conn: ConnId) -> DropOutcome {
        let Some(downstream) = self.conns.remove(&conn) else {
            return DropOutcome::Kept;
        };
        let Some(circuit_id) = downstream.circuit() else {
            return DropOutcome::Kept;
        };
        let Some(target) = self.circuits.get_mut(&circuit_id) else {
            return DropOutcome::Kept;
        };

        target.detach(conn);
        if target.downstream_count() > 0 {
            return DropOutcome::Kept;
        }

        // Last connection gone. A finished circuit dies now; an unfinished
        // one gets a short grace period for a replacement connection.
        if target.is_finished() {
            let teardown = self
                .destroy_circuit(circuit_id)
                .expect("circuit exists, checked above");
            DropOutcome::Destroyed(teardown)
        } else {
            tracing::debug!(
                circuit = format_args!("{circuit_id:#018x}"),
                "lost last downstream, arming axe"
            );
            DropOutcome::ArmAxe(circuit_id)
        }
    }

    /// Frame and reassemble whatever complete blocks a connection has
    /// buffered, then push deliverable bytes toward the upstream.
    fn process_inbound(&mut self, conn: ConnId) -> Result<Vec<RecvEvent>> {
        let mut events = Vec::new();

        // A loose connection binds to the circuit named by its first block.
        // Framing does not commit until a full minimum block could be
        // present.
        let circuit_id = {
            let downstream = self
                .conns
                .get(&conn)
                .ok_or(Error::UnknownConnection(conn))?;
            match downstream.circuit() {
                Some(id) => id,
                None => {
                    if downstream.inbound().len() < MIN_BLOCK as usize {
                        return Ok(events);
                    }
                    let header =
                        BlockHeader::peek(downstream.inbound())?.expect("gated above header size");
                    let id = header.circuit_id;
                    if self.circuits.contains_key(&id) {
                        events.push(RecvEvent::ConnBound(id));
                    } else {
                        self.circuits.insert(id, Circuit::new(id));
                        tracing::debug!(
                            circuit = format_args!("{id:#018x}"),
                            conn,
                            "new circuit from incoming block"
                        );
                        events.push(RecvEvent::CircuitOpened(id));
                    }
                    self.attach(conn, id)?;
                    id
                }
            }
        };

        loop {
            let downstream = self
                .conns
                .get_mut(&conn)
                .ok_or(Error::UnknownConnection(conn))?;
            let Some(header) = BlockHeader::peek(downstream.inbound())? else {
                break;
            };
            if downstream.inbound().len() < header.wire_size() {
                break;
            }
            if header.circuit_id != circuit_id {
                return Err(Error::protocol(format!(
                    "circuit id {:#018x} on connection bound to {:#018x}",
                    header.circuit_id, circuit_id
                )));
            }

            let payload = downstream.extract_block(header.length as usize);
            let target = self
                .circuits
                .get_mut(&circuit_id)
                .ok_or(Error::UnknownCircuit(circuit_id))?;
            target.receive_block(&header, payload)?;
        }

        let target = self
            .circuits
            .get_mut(&circuit_id)
            .ok_or(Error::UnknownCircuit(circuit_id))?;
        if let Some((data, eof)) = target.deliver_upstream() {
            if !data.is_empty() {
                events.push(RecvEvent::UpstreamData {
                    circuit: circuit_id,
                    data,
                });
            }
            if eof {
                tracing::debug!(
                    circuit = format_args!("{circuit_id:#018x}"),
                    "delivered FIN, circuit EOF upstream"
                );
                events.push(RecvEvent::UpstreamEof {
                    circuit: circuit_id,
                });
            }
        }
        Ok(events)
    }

    #[cfg(test)]
    pub(crate) fn circuit_mut(&mut self, circuit: CircuitId) -> &mut Circuit {
        self.circuits.get_mut(&circuit).expect("circuit exists")
    }
}
