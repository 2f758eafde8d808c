//! Block header framing and serialization.
//!
//! Every block starts with a fixed 16-byte header carrying the circuit id,
//! the payload's position in the sender's stream, the payload length, and
//! the control flags. The header is what lets the receiver put blocks that
//! arrived on different downstream connections back into one ordered
//! bytestream.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::mux::MAX_BLOCK;

/// Wire size of a block header in bytes.
pub const HEADER_LEN: usize = 16;

/// Block header flags.
pub mod flags {
    /// First block of a direction; offset must be zero.
    pub const SYN: u16 = 0x0001;
    /// Last block of a direction.
    pub const FIN: u16 = 0x0002;
    /// Payload is filler and is discarded by the receiver.
    pub const CHAFF: u16 = 0x0004;
    /// All defined flag bits; anything else is reserved and must be zero.
    pub const MASK: u16 = SYN | FIN | CHAFF;
}

/// A block header.
///
/// Wire format (all fields big-endian):
/// ```text
/// ┌──────────────────────────────────────────────┐
/// │ Circuit ID (8)                               │
/// ├──────────────────────────────────────────────┤
/// │ Offset (4)        │ Length (2) │ Flags (2)   │
/// ├──────────────────────────────────────────────┤
/// │ Payload (Length bytes)                       │
/// └──────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Names the circuit this block belongs to; chosen by the connecting peer
    pub circuit_id: u64,
    /// Position of the payload in the sender's stream, modulo 2^32
    pub offset: u32,
    /// Payload byte count following the header
    pub length: u16,
    /// SYN / FIN / CHAFF control bits
    pub flags: u16,
}

impl BlockHeader {
    /// Check if a flag is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Serialize the header, appending 16 bytes to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u64(self.circuit_id);
        buf.put_u32(self.offset);
        buf.put_u16(self.length);
        buf.put_u16(self.flags);
    }

    /// Parse a header from the front of `buf` without consuming it.
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_LEN`] bytes are buffered.
    /// A header with reserved flag bits set or a length above [`MAX_BLOCK`]
    /// is a protocol error, which terminates the owning circuit.
    pub fn peek(buf: &[u8]) -> Result<Option<BlockHeader>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut b = buf;
        let header = BlockHeader {
            circuit_id: b.get_u64(),
            offset: b.get_u32(),
            length: b.get_u16(),
            flags: b.get_u16(),
        };

        if header.flags & !flags::MASK != 0 {
            return Err(Error::protocol(format!(
                "reserved flag bits set: {:#06x}",
                header.flags
            )));
        }
        if header.length > MAX_BLOCK {
            return Err(Error::protocol(format!(
                "block length {} exceeds maximum {}",
                header.length, MAX_BLOCK
            )));
        }

        Ok(Some(header))
    }

    /// Total wire size of the block this header describes.
    pub fn wire_size(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: BlockHeader) -> BlockHeader {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        BlockHeader::peek(&buf).unwrap().unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BlockHeader {
            circuit_id: 0x0123_4567_89AB_CDEF,
            offset: 0xDEAD_BEEF,
            length: 1234,
            flags: flags::SYN | flags::CHAFF,
        };
        assert_eq!(roundtrip(header), header);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = BlockHeader {
            circuit_id: 0x0102_0304_0506_0708,
            offset: 0x0A0B_0C0D,
            length: 0x0E0F,
            flags: flags::FIN,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        // Network byte order, fixed field positions.
        assert_eq!(
            buf.as_ref(),
            &[
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // circuit id
                0x0A, 0x0B, 0x0C, 0x0D, // offset
                0x0E, 0x0F, // length
                0x00, 0x02, // flags
            ]
        );
    }

    #[test]
    fn test_peek_needs_more() {
        assert!(BlockHeader::peek(&[]).unwrap().is_none());
        assert!(BlockHeader::peek(&[0u8; HEADER_LEN - 1]).unwrap().is_none());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let header = BlockHeader {
            circuit_id: 7,
            offset: 0,
            length: 64,
            flags: flags::SYN,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(&[0xAA; 64]);

        let before = buf.len();
        let _ = BlockHeader::peek(&buf).unwrap().unwrap();
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn test_max_length_accepted() {
        let header = BlockHeader {
            circuit_id: 1,
            offset: 0,
            length: MAX_BLOCK,
            flags: 0,
        };
        assert_eq!(roundtrip(header).length, MAX_BLOCK);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u32(0);
        buf.put_u16(MAX_BLOCK + 1);
        buf.put_u16(0);

        let err = BlockHeader::peek(&buf).unwrap_err();
        assert!(err.is_circuit_fatal());
    }

    #[test]
    fn test_reserved_flags_rejected() {
        for bad in [0x0008u16, 0x8000, flags::SYN | 0x0010] {
            let mut buf = BytesMut::new();
            buf.put_u64(1);
            buf.put_u32(0);
            buf.put_u16(0);
            buf.put_u16(bad);

            let err = BlockHeader::peek(&buf).unwrap_err();
            assert!(err.is_circuit_fatal(), "flags {bad:#06x} must be fatal");
        }
    }

    #[test]
    fn test_wire_size() {
        let header = BlockHeader {
            circuit_id: 1,
            offset: 0,
            length: 100,
            flags: 0,
        };
        assert_eq!(header.wire_size(), HEADER_LEN + 100);
    }
}
