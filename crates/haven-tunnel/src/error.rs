//! Error types for the HAVEN tunnel layer.

use thiserror::Error;

/// Errors that can occur while establishing or using a secure channel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Passphrase rejected by the responder, or proof verification failed.
    /// Terminal - callers must never retry with the same credentials.
    #[error("authentication failed: passphrase rejected")]
    Authentication,

    /// TCP connect or handshake could not complete
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake message exchange broke down (key derivation, unexpected
    /// message order)
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An encrypted frame failed its integrity check
    #[error("frame integrity check failed")]
    Integrity,

    /// A wire message could not be parsed
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The session nonce counter is exhausted; the session must be re-keyed
    /// by reconnecting
    #[error("session counter exhausted")]
    CounterExhausted,

    /// The peer closed the connection
    #[error("connection closed by peer")]
    Closed,

    /// Underlying socket error
    #[error("i/o error: {0}")]
    Io(String),
}

impl TunnelError {
    /// Returns true if this failure is terminal and must not be retried
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelError::Authentication)
    }

    /// Returns true if the session ended (cleanly or not) rather than a
    /// single operation failing
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TunnelError::Closed | TunnelError::Io(_) | TunnelError::CounterExhausted
        )
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TunnelError::Closed
        } else {
            TunnelError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Malformed(err.to_string())
    }
}
