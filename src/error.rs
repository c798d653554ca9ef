//! Error types for citm

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("keysync failed: {0}")]
    Keysync(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error should tear down every session attached to a
    /// user, not just the one it occurred on.
    #[must_use]
    pub const fn is_fatal_upstream(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Tls(_) | Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
