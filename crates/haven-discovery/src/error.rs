//! Error types for discovery and NAT traversal.

use thiserror::Error;

/// One failed traversal method with its diagnostic
#[derive(Debug, Clone)]
pub struct MethodAttempt {
    /// Method name ("direct", "hole-punch")
    pub method: &'static str,
    /// Human-readable cause
    pub cause: String,
}

fn format_attempts(attempts: &[MethodAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.method, a.cause))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the discovery layer
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket setup or send/receive failure
    #[error("discovery socket error: {0}")]
    Socket(String),

    /// Every traversal method failed; carries per-method diagnostics
    #[error("all connection methods failed: {}", format_attempts(attempts))]
    TraversalFailed {
        /// One entry per method tried, in order
        attempts: Vec<MethodAttempt>,
    },
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Socket(err.to_string())
    }
}
