//! # Error Taxonomy
//!
//! Every failure the transport can surface, classified by blast radius:
//! per-packet errors are absorbed where they occur, per-product errors
//! terminate that product, per-connection errors terminate that worker,
//! and only construction and `stop()` report fatally.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport-level error taxonomy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Header bytes failed validation; the packet is discarded.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// Recoverable socket error; the operation should be retried.
    #[error("transient i/o error: {0}")]
    TransientIo(#[source] io::Error),

    /// The peer closed the connection or the socket failed fatally.
    #[error("peer gone: {0}")]
    PeerGone(#[source] io::Error),

    /// A control message referred to a product that is not (or is no
    /// longer) in the metadata store.
    #[error("unknown product {0}")]
    ProductUnknown(u32),

    /// Writing to a product's backing storage failed; the product is
    /// marked failed and a missed notification is issued.
    #[error("backing store i/o error: {0}")]
    BackingIoFatal(#[source] io::Error),

    /// A product exceeds the 32-bit byte-offset sequence space.
    #[error("product of {0} bytes exceeds the u32 offset space")]
    ProductTooLarge(u64),

    /// The request queue was cancelled.
    #[error("request queue cancelled")]
    Cancelled,

    /// Rejected configuration; raised at construction only.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl TransportError {
    /// Classify a socket error: interrupted/would-block reads are
    /// transient, everything that means the peer went away is `PeerGone`.
    pub fn from_socket(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                TransportError::TransientIo(err)
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => TransportError::PeerGone(err),
            _ => TransportError::PeerGone(err),
        }
    }

    /// True if the operation may simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::TransientIo(_))
    }
}
