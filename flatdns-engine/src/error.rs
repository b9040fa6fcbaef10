//! Error types for the server engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the proxy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to bind a listener; fatal at startup
    #[error("failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),

    /// Core DNS error
    #[error("DNS error: {0}")]
    Dns(#[from] flat_dns::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Configuration and bind problems are fatal at startup; everything
    /// else is transient
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::Bind(_, _)
        )
    }
}
