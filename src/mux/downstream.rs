//! One downstream transport connection.
//!
//! To the multiplexer a downstream is a pair of byte buffers with a cover
//! module between them and the socket: wire bytes come in, block bytes come
//! out, and vice versa. A connection carries blocks for at most one circuit
//! at a time; on the listening side it stays loose until its first received
//! block names one.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Result;
use crate::mux::header::HEADER_LEN;
use crate::mux::{CircuitId, ConnId};
use crate::steg::StegAdapter;

/// A downstream connection's protocol-side state.
pub struct Downstream {
    id: ConnId,
    peer: String,
    adapter: Box<dyn StegAdapter>,
    /// Decoded block bytes awaiting framing
    inbound: BytesMut,
    /// Encoded wire bytes awaiting a socket flush
    outbound: BytesMut,
    circuit: Option<CircuitId>,
}

impl Downstream {
    pub(crate) fn new(id: ConnId, peer: String, adapter: Box<dyn StegAdapter>) -> Self {
        Self {
            id,
            peer,
            adapter,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            circuit: None,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Peer label used in log output.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The circuit this connection carries blocks for, if bound.
    pub fn circuit(&self) -> Option<CircuitId> {
        self.circuit
    }

    pub(crate) fn bind(&mut self, circuit: CircuitId) {
        self.circuit = Some(circuit);
    }

    /// Run received wire bytes through the cover module, consuming `wire`
    /// and appending the recovered block bytes to the inbound buffer.
    pub(crate) fn push_wire(&mut self, wire: &mut BytesMut) -> Result<()> {
        self.adapter.receive(wire, &mut self.inbound)
    }

    /// Block bytes recovered so far and not yet framed.
    pub(crate) fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    /// Consume one complete block from the inbound buffer, returning its
    /// payload. The caller has already verified that header and payload are
    /// fully buffered.
    pub(crate) fn extract_block(&mut self, payload_len: usize) -> BytesMut {
        self.inbound.advance(HEADER_LEN);
        self.inbound.split_to(payload_len)
    }

    /// How many block bytes the cover channel will accept right now.
    pub(crate) fn transmit_room(&self, preferred: usize, lo: usize, hi: usize) -> usize {
        self.adapter.transmit_room(preferred, lo, hi)
    }

    /// Encode one block into the outbound wire buffer.
    pub(crate) fn send_block(&mut self, block: &[u8]) -> Result<()> {
        self.adapter.transmit(block, &mut self.outbound)
    }

    /// Take whatever wire bytes are ready to flush to the socket.
    pub(crate) fn take_outbound(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steg::NoSteg;

    #[test]
    fn test_wire_passthrough() {
        let mut conn = Downstream::new(1, "test".into(), Box::new(NoSteg::new()));

        let mut wire = BytesMut::from(&b"block bytes"[..]);
        conn.push_wire(&mut wire).unwrap();
        assert!(wire.is_empty());
        assert_eq!(conn.inbound(), b"block bytes");
    }

    #[test]
    fn test_outbound_drain() {
        let mut conn = Downstream::new(1, "test".into(), Box::new(NoSteg::new()));
        assert!(conn.take_outbound().is_none());

        conn.send_block(b"abc").unwrap();
        conn.send_block(b"def").unwrap();
        assert_eq!(conn.take_outbound().unwrap().as_ref(), b"abcdef");
        assert!(conn.take_outbound().is_none());
    }

    #[test]
    fn test_binding() {
        let mut conn = Downstream::new(7, "test".into(), Box::new(NoSteg::new()));
        assert!(conn.circuit().is_none());
        conn.bind(0x42);
        assert_eq!(conn.circuit(), Some(0x42));
    }
}
