//! The identity cover module.
//!
//! Blocks go on the wire as-is. Useful for testing, for deployments where
//! the downstream links are already innocuous, and as the reference for
//! what an adapter must do.

use bytes::BytesMut;

use crate::error::Result;
use crate::steg::StegAdapter;

/// Identity adapter: wire bytes are block bytes.
#[derive(Debug, Default)]
pub struct NoSteg;

impl NoSteg {
    /// Create a new identity adapter.
    pub fn new() -> Self {
        Self
    }
}

impl StegAdapter for NoSteg {
    fn transmit_room(&self, preferred: usize, _lo: usize, _hi: usize) -> usize {
        // A bare TCP stream takes anything.
        preferred
    }

    fn transmit(&mut self, block: &[u8], wire_out: &mut BytesMut) -> Result<()> {
        wire_out.extend_from_slice(block);
        Ok(())
    }

    fn receive(&mut self, wire_in: &mut BytesMut, block_out: &mut BytesMut) -> Result<()> {
        block_out.extend_from_slice(wire_in);
        wire_in.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transmit() {
        let mut adapter = NoSteg::new();
        let mut wire = BytesMut::new();
        adapter.transmit(b"block", &mut wire).unwrap();
        adapter.transmit(b" bytes", &mut wire).unwrap();
        assert_eq!(wire.as_ref(), b"block bytes");
    }

    #[test]
    fn test_identity_receive() {
        let mut adapter = NoSteg::new();
        let mut wire = BytesMut::from(&b"block bytes"[..]);
        let mut blocks = BytesMut::new();
        adapter.receive(&mut wire, &mut blocks).unwrap();
        assert!(wire.is_empty());
        assert_eq!(blocks.as_ref(), b"block bytes");
    }

    #[test]
    fn test_room_is_unbounded() {
        let adapter = NoSteg::new();
        assert_eq!(adapter.transmit_room(100, 32, 32767), 100);
        assert_eq!(adapter.transmit_room(usize::MAX, 32, 32767), usize::MAX);
    }
}
