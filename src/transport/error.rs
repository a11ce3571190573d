//! Transport layer error types.
//!
//! Malformed or spoofed datagrams are dropped without a reply. Socket
//! failures end the connection.

use std::io;

use thiserror::Error;

use super::bundle::BundleError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Bundle parsing error.
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Not enough free segments to unpack a datagram.
    #[error("segment pool exhausted: {needed} segments needed")]
    PoolExhausted {
        /// Segments the datagram carries.
        needed: usize,
    },

    /// Bundle carried a zero salt.
    #[error("bundle carries no salt")]
    SaltMissing,

    /// Bundle salt differs from the one the peer established.
    #[error("salt mismatch: expected {expected:#018x}, got {actual:#018x}")]
    SaltMismatch {
        /// Salt adopted from the peer's first bundle.
        expected: u64,
        /// Salt in this bundle.
        actual: u64,
    },

    /// Bundle sequence was already received.
    #[error("duplicate bundle {sequence}")]
    DuplicateBundle {
        /// Repeated sequence.
        sequence: u32,
    },

    /// Datagram was discarded by simulated packet loss.
    #[error("datagram dropped by simulated loss")]
    SimulatedLoss,

    /// The socket was closed.
    #[error("socket closed")]
    Closed,
}

impl TransportError {
    /// Check if this error should result in silent drop (no response sent).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Bundle(_)
                | TransportError::SaltMissing
                | TransportError::SaltMismatch { .. }
                | TransportError::DuplicateBundle { .. }
                | TransportError::SimulatedLoss
                | TransportError::PoolExhausted { .. }
        )
    }

    /// Check if this error is fatal to the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::Closed)
    }

    /// Check if this error indicates a possible spoofing attempt.
    pub fn is_spoof_suspect(&self) -> bool {
        matches!(
            self,
            TransportError::SaltMissing | TransportError::SaltMismatch { .. }
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
