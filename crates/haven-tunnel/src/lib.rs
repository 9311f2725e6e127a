//! # HAVEN Tunnel
//!
//! Secure channel establishment for the HAVEN virtual LAN.
//!
//! This crate provides:
//! - Passphrase-based challenge/response authentication
//! - Session key derivation (Argon2id stretch + BLAKE3 KDF)
//! - Length-prefixed framing (4-byte big-endian)
//! - `ChaCha20-Poly1305` session encryption with counter-derived nonces
//!
//! ## Protocol
//!
//! ```text
//! Initiator                          Responder
//!     |------------ TCP connect --------->|
//!     |<-- {type:auth_request,challenge} -|
//!     |--- {type:auth_response,proof} --->|
//!     |<-- {type:auth_result,status,ip} --|
//!     |                                   |
//!     |===== encrypted payload frames ====|
//! ```
//!
//! Every message on the wire is a 4-byte big-endian length followed by the
//! body. Handshake bodies are JSON; post-handshake bodies are AEAD
//! ciphertext. Tampered frames fail decryption and surface as
//! [`TunnelError::Integrity`] - never silently accepted.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod framing;
pub mod handshake;
pub mod session;

pub use error::TunnelError;
pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use handshake::{HandshakeMessage, PendingSession, initiate, respond};
pub use session::{Role, SecureReader, SecureWriter, SessionKey, split_secure};

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Default connect + handshake timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication challenge size in bytes
pub const CHALLENGE_SIZE: usize = 32;

/// Connect to a host and establish an authenticated, encrypted duplex stream.
///
/// Runs the TCP connect and the full initiator-side handshake under a single
/// `timeout`. On success returns the encrypted stream halves and the virtual
/// IP the host allocated to us.
///
/// # Errors
///
/// Returns [`TunnelError::Authentication`] on passphrase rejection (terminal,
/// callers must not retry), [`TunnelError::ConnectionFailed`] on connect or
/// handshake timeout.
pub async fn connect(
    addr: SocketAddr,
    passphrase: &str,
    timeout: Duration,
) -> Result<(SecureReader, SecureWriter, Ipv4Addr), TunnelError> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::ConnectionFailed(format!("connect {addr}: {e}")))?;
        let (key, virtual_ip) = initiate(&mut stream, passphrase).await?;
        let (reader, writer) = split_secure(stream, &key, Role::Initiator);
        Ok((reader, writer, virtual_ip))
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::ConnectionFailed(format!(
            "handshake with {addr} timed out after {timeout:?}"
        ))),
    }
}
