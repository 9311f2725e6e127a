//! Error types for the peer lifecycle engine.

use crate::interface::InterfaceError;
use crate::peer::ConnectionStatus;
use thiserror::Error;

/// Errors that can occur in lifecycle operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Secure channel failure (authentication is terminal)
    #[error("tunnel error: {0}")]
    Tunnel(#[from] haven_tunnel::TunnelError),

    /// Discovery or NAT traversal failure
    #[error("discovery error: {0}")]
    Discovery(#[from] haven_discovery::DiscoveryError),

    /// Virtual adapter failure - fatal to the operation that needed it
    #[error("interface error: {0}")]
    Interface(#[from] InterfaceError),

    /// Connect attempt failed with a human-readable cause
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation referenced a peer with no connection entry
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Connect request for a peer that is already active
    #[error("peer already connected: {0}")]
    AlreadyConnected(String),

    /// A state-machine edge that does not exist was requested
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Status before the attempted transition
        from: ConnectionStatus,
        /// Requested target status
        to: ConnectionStatus,
    },

    /// No free address left in the virtual pool
    #[error("virtual address pool exhausted")]
    PoolExhausted,

    /// Recovery gave up after the retry bound; terminal for the connection
    #[error("recovery exhausted after {attempts} attempts for {peer}")]
    RecoveryExhausted {
        /// The peer whose connection could not be repaired
        peer: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Hosting operation requested while not hosting
    #[error("not hosting")]
    NotHosting,

    /// Hosting requested while already hosting
    #[error("already hosting")]
    AlreadyHosting,

    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl CoreError {
    /// Returns true when retrying the same operation cannot succeed
    /// (bad passphrase, exhausted recovery, impossible transition)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            CoreError::Tunnel(e) => e.is_terminal(),
            CoreError::RecoveryExhausted { .. } | CoreError::InvalidTransition { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_are_terminal() {
        let err = CoreError::Tunnel(haven_tunnel::TunnelError::Authentication);
        assert!(err.is_terminal());

        let err = CoreError::ConnectionFailed("refused".to_string());
        assert!(!err.is_terminal());
    }

    #[test]
    fn recovery_exhaustion_is_terminal() {
        let err = CoreError::RecoveryExhausted {
            peer: "host-10.0.0.5".to_string(),
            attempts: 3,
        };
        assert!(err.is_terminal());
        assert!(err.to_string().contains("3 attempts"));
    }
}
