//! Pluggable cover modules.
//!
//! A steg adapter sits between the block protocol and a downstream socket,
//! turning block bytes into whatever the wire should look like and back.
//! The multiplexer treats every adapter identically: it asks how much room
//! the cover channel has, hands over block bytes to disguise, and gets
//! block bytes back out of received cover traffic. Concrete cover formats
//! (HTTP mimicry and friends) live entirely behind this trait.

mod nosteg;

pub use nosteg::NoSteg;

use std::fmt;

use bytes::BytesMut;

use crate::error::{Error, Result};

/// The capability set the multiplexer requires of a cover module.
pub trait StegAdapter: Send {
    /// How many block bytes the cover channel can accept right now.
    ///
    /// `preferred` is what the dispatcher would like to write; `lo` and
    /// `hi` bound the block sizes it is able to produce. Returning less
    /// than `lo` defers emission until the next write-ready pump.
    fn transmit_room(&self, preferred: usize, lo: usize, hi: usize) -> usize;

    /// Disguise `block` and append the resulting wire bytes to `wire_out`.
    fn transmit(&mut self, block: &[u8], wire_out: &mut BytesMut) -> Result<()>;

    /// Consume received wire bytes from `wire_in`, appending any recovered
    /// block bytes to `block_out`. Bytes the cover format has not finished
    /// with may be left in `wire_in` for the next call.
    fn receive(&mut self, wire_in: &mut BytesMut, block_out: &mut BytesMut) -> Result<()>;

    /// Drive any out-of-band control traffic the cover format needs (for
    /// example a dictionary handshake). The multiplexer passes `control`
    /// through opaquely and never interprets it.
    fn advance_protocol(&mut self, control: &mut BytesMut) -> Result<()> {
        let _ = control;
        Ok(())
    }
}

impl fmt::Debug for dyn StegAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn StegAdapter")
    }
}

/// Look up a cover module by its configuration tag.
pub fn by_name(tag: &str) -> Result<Box<dyn StegAdapter>> {
    match tag {
        "nosteg" => Ok(Box::new(NoSteg::new())),
        other => Err(Error::UnknownSteg(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_known_tag() {
        assert!(by_name("nosteg").is_ok());
    }

    #[test]
    fn test_registry_unknown_tag() {
        let err = by_name("http_apache").unwrap_err();
        assert_eq!(err.to_string(), "unknown steg module: http_apache");
    }

    #[test]
    fn test_advance_protocol_default_is_noop() {
        let mut adapter = by_name("nosteg").unwrap();
        let mut control = BytesMut::from(&b"opaque"[..]);
        adapter.advance_protocol(&mut control).unwrap();
        assert_eq!(control.as_ref(), b"opaque");
    }
}
