//! Error surface for the encryption core.
//!
//! Recoverable variants (`HandshakeRequired`, `RateLimitExceeded`,
//! `MessageTooLarge`) tell the caller to change behavior and retry.
//! `HandshakeFailure` and `DecryptionFailure` are terminal for the
//! affected session; the session manager evicts it.

use thiserror::Error;

/// Errors surfaced across the core boundary.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// Peer identifier is empty, too long, or not hex.
    #[error("invalid peer id")]
    InvalidPeerId,

    /// Frame exceeds the protocol limit for its class.
    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// The per-peer admission bucket is exhausted; back off.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Encryption was requested without an established session.
    #[error("handshake required")]
    HandshakeRequired,

    /// Operation requires an established session and none exists.
    #[error("session not established")]
    SessionNotEstablished,

    /// A healthy established session already exists for this peer.
    #[error("session already established")]
    AlreadyEstablished,

    /// A responder handshake with this peer is already running.
    #[error("handshake already in progress")]
    HandshakeInProgress,

    /// Handshake processing failed; the session is unusable.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// AEAD verification failed on an inbound frame.
    #[error("decryption failed")]
    DecryptionFailure,

    /// Announce signing bytes did not match the canonical layout.
    #[error("malformed announce")]
    MalformedAnnounce,

    /// The identity vault was wiped; signing is unavailable.
    #[error("identity wiped")]
    IdentityWiped,

    /// The secure store rejected a read or write.
    #[error("persistence failed: {0}")]
    PersistenceFailure(String),
}

impl From<snow::Error> for EncryptionError {
    fn from(err: snow::Error) -> Self {
        EncryptionError::HandshakeFailure(err.to_string())
    }
}
