//! # braid
//!
//! A traffic-obfuscation proxy core that braids one logical bytestream
//! across several simultaneous downstream connections. Data is chopped
//! into framed blocks of randomly drawn sizes, dealt round-robin over the
//! downstream links, and reassembled in order at the peer; chaff blocks
//! carry control flags when there is no data to ride on.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Upstream (application bytestream, e.g. SOCKS-brokered) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Circuit mux (framing, reassembly, SYN/FIN, chaff)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Steg adapters (pluggable cover modules per link)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Downstream links (N parallel transport connections)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The protocol core ([`mux`]) is synchronous and IO-free; the engine
//! ([`proxy`]) wires it to tokio sockets and timers. Neither encrypts nor
//! authenticates: that belongs to the layers around this crate.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod mux;
pub mod proxy;
pub mod rng;
pub mod steg;

pub use config::{Config, ConfigFile, Role};
pub use error::{Error, Result};
pub use mux::{CircuitId, MAX_BLOCK, MIN_BLOCK};
pub use proxy::Proxy;
