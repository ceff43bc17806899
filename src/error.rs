//! Error types for the onion-routing client core
//!
//! One crate-wide error enum covering framing, crypto, circuit, and stream
//! failures. Only `NotEnoughBytes` is recoverable: the framer buffers and
//! retries when more data arrives. Everything else is fatal to the cell,
//! circuit, or connection it was raised for.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the client core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ===== Framing =====
    #[error("not enough bytes: needed {needed}, found {found}")]
    NotEnoughBytes { needed: usize, found: usize },

    #[error("unknown cell command: {0}")]
    UnknownCellCommand(u8),

    #[error("unknown relay command: {0}")]
    UnknownRelayCommand(u8),

    #[error("bad cell header: {0}")]
    BadCellHeader(String),

    #[error("bad payload data: {0}")]
    BadPayloadData(String),

    // ===== Relay crypto =====
    /// No hop recognized an inbound RELAY cell. The caller drops the cell
    /// silently; the failure must never be logged with payload bytes.
    #[error("relay cell not recognized by any hop")]
    UnrecognizedCell,

    #[error("crypto error: {0}")]
    Crypto(String),

    // ===== Handshakes =====
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Circuits =====
    #[error("circuit destroyed: reason={0}")]
    CircuitDestroyed(u8),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("exit policy rejected request")]
    PolicyRejected,

    // ===== Streams =====
    #[error("stream error: {0}")]
    Stream(String),

    // ===== Link =====
    #[error("peer closed connection")]
    PeerClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl Error {
    /// True for errors the framer recovers from by waiting for more bytes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotEnoughBytes { .. })
    }

    /// True for errors that must tear down the owning circuit.
    pub fn is_circuit_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownCellCommand(_)
                | Error::UnknownRelayCommand(_)
                | Error::BadCellHeader(_)
                | Error::BadPayloadData(_)
                | Error::HandshakeFailed(_)
                | Error::CircuitDestroyed(_)
                | Error::Timeout
                | Error::PeerClosed
        )
    }
}
