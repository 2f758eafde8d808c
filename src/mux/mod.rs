//! Circuit multiplexing: the block protocol.
//!
//! One logical bytestream (the upstream) is chopped into blocks and dealt
//! round-robin across several downstream connections, then reassembled in
//! order on the far side. Each block carries a 16-byte header naming its
//! circuit, its position in the stream, its length, and SYN/FIN/CHAFF
//! control bits; the offset field is the only ordering signal between
//! blocks that travel on different connections.
//!
//! ```text
//!                      ┌──────────────┐
//!  upstream bytes ───▶ │  dispatcher  │──▶ conn 0 ──┐
//!                      │ (round robin)│──▶ conn 1 ──┼──▶ network
//!                      └──────────────┘──▶ conn 2 ──┘
//!                      ┌──────────────┐
//!  upstream bytes ◀─── │  reassembly  │◀── demux by circuit id
//!                      └──────────────┘
//! ```
//!
//! Everything in this module is synchronous and IO-free; the driver in
//! [`crate::proxy`] wires it to sockets and timers.

mod circuit;
mod downstream;
mod header;
mod manager;
mod reassembly;
mod seq;

pub use circuit::{CircuitState, PumpOutcome};
pub use downstream::Downstream;
pub use header::{flags, BlockHeader, HEADER_LEN};
pub use manager::{CircuitManager, DropOutcome, RecvEvent, Teardown};
pub use reassembly::{ReassemblyQueue, Segment};
pub use seq::{mod32_le, mod32_lt};

/// Identifies a circuit; chosen by the connecting peer, carried in every
/// block header.
pub type CircuitId = u64;

/// Identifies a registered downstream connection within one instance.
pub type ConnId = u64;

/// Smallest block payload the dispatcher will draw, and the minimum number
/// of buffered bytes before a loose connection commits to a framing
/// decision.
pub const MIN_BLOCK: u16 = 32;

/// Largest payload a single block can carry.
pub const MAX_BLOCK: u16 = 32767;
