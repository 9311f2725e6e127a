//! Passphrase authentication handshake.
//!
//! The responder issues a random challenge; the initiator proves knowledge
//! of the shared passphrase by returning a keyed hash of that challenge
//! under an Argon2id-stretched key. The passphrase itself never crosses the
//! wire. Both sides then derive the same session key from the stretched key
//! and the challenge, so every session encrypts under fresh material.

use crate::CHALLENGE_SIZE;
use crate::error::TunnelError;
use crate::framing::{read_frame, write_frame};
use crate::session::SessionKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroize;

/// KDF context string for session key derivation
const SESSION_KDF_CONTEXT: &str = "haven tunnel session v1";

/// Handshake control messages, JSON on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Responder opens with a random challenge (hex)
    AuthRequest {
        /// 32-byte challenge, hex encoded
        challenge: String,
    },

    /// Initiator answers with a keyed hash of the challenge (hex)
    AuthResponse {
        /// 32-byte proof, hex encoded
        proof: String,
    },

    /// Responder's verdict; `ip` is present on success only
    AuthResult {
        /// "ok" or "denied"
        status: AuthStatus,
        /// Virtual IP allocated to the initiator
        #[serde(skip_serializing_if = "Option::is_none")]
        ip: Option<Ipv4Addr>,
    },
}

/// Authentication verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    /// Proof accepted
    Ok,
    /// Proof rejected
    Denied,
}

/// Stretch the passphrase into a 32-byte key, salted by the challenge
fn stretch_passphrase(
    passphrase: &str,
    challenge: &[u8; CHALLENGE_SIZE],
) -> Result<[u8; 32], TunnelError> {
    let mut key = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), challenge, &mut key)
        .map_err(|e| TunnelError::Handshake(format!("passphrase stretch: {e}")))?;
    Ok(key)
}

/// Proof of passphrase knowledge: keyed hash of the challenge.
///
/// `blake3::Hash` compares in constant time, so proof verification does not
/// leak via timing.
fn challenge_proof(stretched: &[u8; 32], challenge: &[u8; CHALLENGE_SIZE]) -> blake3::Hash {
    blake3::keyed_hash(stretched, challenge)
}

/// Derive the session key both sides will encrypt under
fn derive_session_key(stretched: &[u8; 32], challenge: &[u8; CHALLENGE_SIZE]) -> SessionKey {
    let mut material = [0u8; 64];
    material[..32].copy_from_slice(stretched);
    material[32..].copy_from_slice(challenge);
    let key = SessionKey::new(blake3::derive_key(SESSION_KDF_CONTEXT, &material));
    material.zeroize();
    key
}

fn decode_hex32(field: &str, value: &str) -> Result<[u8; 32], TunnelError> {
    let bytes = hex::decode(value)
        .map_err(|e| TunnelError::Malformed(format!("{field} is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| TunnelError::Malformed(format!("{field} has wrong length")))
}

async fn send_message<S>(stream: &mut S, message: &HandshakeMessage) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    write_frame(stream, &body).await
}

async fn recv_message<S>(stream: &mut S) -> Result<HandshakeMessage, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let body = read_frame(stream).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Run the initiator side of the handshake.
///
/// Returns the derived session key and the virtual IP the responder
/// allocated to us.
///
/// # Errors
///
/// [`TunnelError::Authentication`] if the responder denies the proof -
/// terminal, never retried. [`TunnelError::Malformed`] /
/// [`TunnelError::Handshake`] on protocol violations.
pub async fn initiate<S>(
    stream: &mut S,
    passphrase: &str,
) -> Result<(SessionKey, Ipv4Addr), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = match recv_message(stream).await? {
        HandshakeMessage::AuthRequest { challenge } => decode_hex32("challenge", &challenge)?,
        other => {
            return Err(TunnelError::Handshake(format!(
                "expected auth_request, got {other:?}"
            )));
        }
    };

    let mut stretched = stretch_passphrase(passphrase, &challenge)?;
    let proof = challenge_proof(&stretched, &challenge);
    send_message(
        stream,
        &HandshakeMessage::AuthResponse {
            proof: hex::encode(proof.as_bytes()),
        },
    )
    .await?;

    let result = recv_message(stream).await;
    match result {
        Ok(HandshakeMessage::AuthResult {
            status: AuthStatus::Ok,
            ip: Some(ip),
        }) => {
            let key = derive_session_key(&stretched, &challenge);
            stretched.zeroize();
            Ok((key, ip))
        }
        Ok(HandshakeMessage::AuthResult {
            status: AuthStatus::Ok,
            ip: None,
        }) => {
            stretched.zeroize();
            Err(TunnelError::Handshake(
                "auth_result ok without allocated ip".to_string(),
            ))
        }
        Ok(HandshakeMessage::AuthResult {
            status: AuthStatus::Denied,
            ..
        }) => {
            stretched.zeroize();
            Err(TunnelError::Authentication)
        }
        Ok(other) => {
            stretched.zeroize();
            Err(TunnelError::Handshake(format!(
                "expected auth_result, got {other:?}"
            )))
        }
        Err(e) => {
            stretched.zeroize();
            Err(e)
        }
    }
}

/// Run the responder side of the handshake up to proof verification.
///
/// On success the caller allocates a virtual IP and completes with
/// [`PendingSession::accept`]; if allocation fails, [`PendingSession::reject`]
/// tells the peer before closing. A bad proof is answered with a denial on
/// the wire and surfaces as [`TunnelError::Authentication`].
pub async fn respond<S>(stream: &mut S, passphrase: &str) -> Result<PendingSession, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut challenge);

    send_message(
        stream,
        &HandshakeMessage::AuthRequest {
            challenge: hex::encode(challenge),
        },
    )
    .await?;

    let proof = match recv_message(stream).await? {
        HandshakeMessage::AuthResponse { proof } => decode_hex32("proof", &proof)?,
        other => {
            return Err(TunnelError::Handshake(format!(
                "expected auth_response, got {other:?}"
            )));
        }
    };

    let mut stretched = stretch_passphrase(passphrase, &challenge)?;
    let expected = challenge_proof(&stretched, &challenge);

    if blake3::Hash::from(proof) != expected {
        stretched.zeroize();
        tracing::warn!("passphrase proof rejected");
        send_message(
            stream,
            &HandshakeMessage::AuthResult {
                status: AuthStatus::Denied,
                ip: None,
            },
        )
        .await?;
        return Err(TunnelError::Authentication);
    }

    tracing::debug!("passphrase proof verified");
    let key = derive_session_key(&stretched, &challenge);
    stretched.zeroize();
    Ok(PendingSession { key })
}

/// A responder-side handshake that passed proof verification and awaits the
/// final accept/reject verdict
pub struct PendingSession {
    key: SessionKey,
}

impl PendingSession {
    /// Send the success verdict carrying the allocated virtual IP and yield
    /// the session key.
    ///
    /// # Errors
    ///
    /// Returns an I/O variant if the verdict cannot be written.
    pub async fn accept<S>(self, stream: &mut S, ip: Ipv4Addr) -> Result<SessionKey, TunnelError>
    where
        S: AsyncWrite + Unpin,
    {
        send_message(
            stream,
            &HandshakeMessage::AuthResult {
                status: AuthStatus::Ok,
                ip: Some(ip),
            },
        )
        .await?;
        Ok(self.key)
    }

    /// Send a denial verdict (used when the host cannot admit the peer, e.g.
    /// the address pool is exhausted).
    ///
    /// # Errors
    ///
    /// Returns an I/O variant if the verdict cannot be written.
    pub async fn reject<S>(self, stream: &mut S) -> Result<(), TunnelError>
    where
        S: AsyncWrite + Unpin,
    {
        send_message(
            stream,
            &HandshakeMessage::AuthResult {
                status: AuthStatus::Denied,
                ip: None,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_handshake(
        initiator_pass: &str,
        responder_pass: &str,
    ) -> (
        Result<(SessionKey, Ipv4Addr), TunnelError>,
        Result<SessionKey, TunnelError>,
    ) {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let responder = tokio::spawn({
            let pass = responder_pass.to_string();
            async move {
                let pending = respond(&mut server, &pass).await?;
                pending
                    .accept(&mut server, Ipv4Addr::new(10, 0, 0, 2))
                    .await
            }
        });

        let initiated = initiate(&mut client, initiator_pass).await;
        let responded = responder.await.unwrap();
        (initiated, responded)
    }

    #[tokio::test]
    async fn matching_passphrases_agree_on_key() {
        let (initiated, responded) = run_handshake("lan-party", "lan-party").await;

        let (client_key, ip) = initiated.unwrap();
        let server_key = responded.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(client_key.as_bytes(), server_key.as_bytes());
    }

    #[tokio::test]
    async fn wrong_passphrase_is_denied() {
        let (initiated, responded) = run_handshake("lan-party", "other-pass").await;

        assert!(matches!(initiated, Err(TunnelError::Authentication)));
        assert!(matches!(responded, Err(TunnelError::Authentication)));
    }

    #[tokio::test]
    async fn sessions_use_fresh_keys() {
        let (first, _) = run_handshake("same-pass", "same-pass").await;
        let (second, _) = run_handshake("same-pass", "same-pass").await;

        // Same passphrase, different challenge, different session key.
        let (a, _) = first.unwrap();
        let (b, _) = second.unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[tokio::test]
    async fn reject_reports_denied() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            let pending = respond(&mut server, "pass").await?;
            pending.reject(&mut server).await
        });

        let initiated = initiate(&mut client, "pass").await;
        assert!(matches!(initiated, Err(TunnelError::Authentication)));
        responder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn garbage_challenge_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        send_message(
            &mut server,
            &HandshakeMessage::AuthRequest {
                challenge: "not-hex".to_string(),
            },
        )
        .await
        .unwrap();

        let err = initiate(&mut client, "pass").await.unwrap_err();
        assert!(matches!(err, TunnelError::Malformed(_)));
    }
}
