//! Error types for braid.

use thiserror::Error;

/// Result type alias for braid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while multiplexing circuits.
#[derive(Error, Debug)]
pub enum Error {
    /// The peer violated the block protocol. Fatal to the owning circuit.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A buffer was shorter than an operation required
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer {
        /// Bytes the operation required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No circuit with this id exists
    #[error("unknown circuit {0:#018x}")]
    UnknownCircuit(u64),

    /// No downstream connection with this id exists
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// No cover module is registered under this tag
    #[error("unknown steg module: {0}")]
    UnknownSteg(String),
}

impl Error {
    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error must terminate the owning circuit.
    pub fn is_circuit_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::UnknownCircuit(_))
    }
}
