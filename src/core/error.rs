//! Error types shared across layers.

use thiserror::Error;

/// Errors returned by the segment pool.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The segment was borrowed from a different pool.
    #[error("segment belongs to a different pool")]
    ForeignSegment,

    /// Not enough free segments to satisfy the request.
    #[error("segment pool exhausted: requested {requested}, {available} free")]
    Exhausted {
        /// Segments requested.
        requested: usize,
        /// Segments available.
        available: usize,
    },
}

/// Errors that can occur when decoding a segment payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Read past the written payload.
    #[error("read past end of segment: needed {needed} bytes, {remaining} remaining")]
    EndOfSegment {
        /// Bytes the read needed.
        needed: usize,
        /// Bytes left after the cursor.
        remaining: usize,
    },

    /// String payload is not valid UTF-8.
    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
}

/// Top-level Tether errors.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Pool error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport error.
    #[cfg(feature = "transport")]
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Client error.
    #[cfg(feature = "client")]
    #[error("client error: {0}")]
    Client(#[from] crate::client::ClientError),

    /// Server error.
    #[cfg(feature = "server")]
    #[error("server error: {0}")]
    Server(#[from] crate::server::ServerError),

    /// Discovery error.
    #[cfg(feature = "discovery")]
    #[error("discovery error: {0}")]
    Discovery(#[from] crate::discovery::DiscoveryError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
