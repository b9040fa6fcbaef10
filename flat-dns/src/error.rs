//! Error types for DNS operations

use thiserror::Error;

/// Result type alias for DNS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during DNS operations
#[derive(Debug, Error)]
pub enum Error {
    /// DNS query/response error
    #[error("DNS error: {0}")]
    Dns(String),

    /// DNS configuration error
    #[error("DNS configuration error: {0}")]
    Config(String),

    /// Upstream query deadline expired
    #[error("upstream query timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// No upstream server could be selected
    #[error("no upstream DNS servers available")]
    NoUpstreams,

    /// Wire-format encode/decode error
    #[error("protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
