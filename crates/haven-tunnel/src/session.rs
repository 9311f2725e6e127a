//! Session encryption for post-handshake traffic.
//!
//! Both directions encrypt under the same session key but in disjoint nonce
//! domains: the nonce is a 4-byte role tag plus a 64-bit send counter. TCP
//! delivers frames in order, so the receiver tracks the peer's counter
//! implicitly and any reordering, truncation, or tampering fails the AEAD
//! check.

use crate::error::TunnelError;
use crate::framing::{read_frame, write_frame};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Frames allowed per direction before the session must re-key by
/// reconnecting. Far beyond any realistic session length; the bound exists
/// so the counter can never wrap into nonce reuse.
const MAX_FRAMES_PER_DIRECTION: u64 = 1 << 48;

/// A derived session key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"<redacted>").finish()
    }
}

impl SessionKey {
    /// Wrap raw key material
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Which side of the handshake this endpoint played.
///
/// Determines the nonce domain each direction encrypts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that dialed and proved the passphrase
    Initiator,
    /// The side that issued the challenge
    Responder,
}

impl Role {
    /// Nonce domain tag for frames *sent* by this role
    fn tag(self) -> [u8; 4] {
        match self {
            Role::Initiator => [0, 0, 0, 1],
            Role::Responder => [0, 0, 0, 2],
        }
    }

    /// The opposite role
    #[must_use]
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

fn nonce_for(role: Role, counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&role.tag());
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

/// Split an authenticated TCP stream into encrypted reader/writer halves
#[must_use]
pub fn split_secure(
    stream: TcpStream,
    key: &SessionKey,
    role: Role,
) -> (SecureReader, SecureWriter) {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let (read_half, write_half) = stream.into_split();

    let reader = SecureReader {
        inner: read_half,
        cipher: cipher.clone(),
        peer_role: role.peer(),
        counter: 0,
    };
    let writer = SecureWriter {
        inner: write_half,
        cipher,
        role,
        counter: 0,
    };
    (reader, writer)
}

/// Decrypting half of a secure stream
pub struct SecureReader {
    inner: OwnedReadHalf,
    cipher: ChaCha20Poly1305,
    peer_role: Role,
    counter: u64,
}

impl std::fmt::Debug for SecureReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureReader")
            .field("peer_role", &self.peer_role)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl SecureReader {
    /// Read and decrypt the next frame.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Integrity`] if decryption fails - the frame was
    /// tampered with, replayed, or reordered. [`TunnelError::Closed`] on
    /// peer shutdown.
    pub async fn recv(&mut self) -> Result<Vec<u8>, TunnelError> {
        if self.counter >= MAX_FRAMES_PER_DIRECTION {
            return Err(TunnelError::CounterExhausted);
        }

        let ciphertext = read_frame(&mut self.inner).await?;
        let nonce = nonce_for(self.peer_role, self.counter);
        let plaintext = self
            .cipher
            .decrypt(&nonce, ciphertext.as_ref())
            .map_err(|_| TunnelError::Integrity)?;
        self.counter += 1;
        Ok(plaintext)
    }
}

/// Encrypting half of a secure stream
pub struct SecureWriter {
    inner: OwnedWriteHalf,
    cipher: ChaCha20Poly1305,
    role: Role,
    counter: u64,
}

impl std::fmt::Debug for SecureWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureWriter")
            .field("role", &self.role)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl SecureWriter {
    /// Encrypt and write one frame.
    ///
    /// # Errors
    ///
    /// [`TunnelError::CounterExhausted`] when the send counter hits the
    /// re-key bound, or an I/O variant on socket failure.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), TunnelError> {
        if self.counter >= MAX_FRAMES_PER_DIRECTION {
            return Err(TunnelError::CounterExhausted);
        }

        let nonce = nonce_for(self.role, self.counter);
        let mut ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| TunnelError::Io("encryption failure".to_string()))?;
        self.counter += 1;

        let result = write_frame(&mut self.inner, &ciphertext).await;
        ciphertext.zeroize();
        result
    }

    /// Shut down the write direction, signalling EOF to the peer.
    ///
    /// # Errors
    ///
    /// Returns an I/O variant if the shutdown cannot be delivered.
    pub async fn shutdown(&mut self) -> Result<(), TunnelError> {
        use tokio::io::AsyncWriteExt;
        self.inner.shutdown().await?;
        Ok(())
    }
}
