//! Canonical announce signing format.
//!
//! An announce binds a peer's routing ID, Noise static key, Ed25519
//! signing key, nickname, and timestamp under one Ed25519 signature.
//! Signing and verification both serialize the exact layout below (all
//! multibyte integers big-endian); no delimiters, no double length
//! prefixes:
//!
//! ```text
//!   1 byte   context_len
//!   N bytes  context       = "bitchat-announce-v1"
//!   8 bytes  peer_id       (routing form, zero-padded)
//!  32 bytes  noise_static_public
//!  32 bytes  ed25519_public
//!   1 byte   nickname_len
//!   N bytes  nickname_utf8 (truncated to 255 bytes)
//!   8 bytes  timestamp_ms
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::EncryptionError;
use crate::identity::{verify_signature, IdentityVault, PeerId, ROUTING_ID_SIZE};

/// Domain-separation context baked into every announce signature.
pub const ANNOUNCE_CONTEXT: &str = "bitchat-announce-v1";

const KEY_SIZE: usize = 32;
const MAX_NICKNAME_BYTES: usize = 255;

/// The identity binding a peer broadcasts to the mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announce {
    pub peer_id: PeerId,
    pub noise_public: [u8; 32],
    pub signing_public: [u8; 32],
    pub nickname: String,
    pub timestamp_ms: u64,
}

impl Announce {
    /// The canonical byte layout covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let context = ANNOUNCE_CONTEXT.as_bytes();
        let context_len = context.len().min(u8::MAX as usize);
        let nickname = self.nickname.as_bytes();
        let nickname_len = nickname.len().min(MAX_NICKNAME_BYTES);

        let mut buf = BytesMut::with_capacity(
            1 + context_len + ROUTING_ID_SIZE + 2 * KEY_SIZE + 1 + nickname_len + 8,
        );
        buf.put_u8(context_len as u8);
        buf.put_slice(&context[..context_len]);
        buf.put_slice(&self.peer_id.routing_bytes());
        buf.put_slice(&self.noise_public);
        buf.put_slice(&self.signing_public);
        buf.put_u8(nickname_len as u8);
        buf.put_slice(&nickname[..nickname_len]);
        buf.put_u64(self.timestamp_ms);
        buf.to_vec()
    }

    /// Sign the canonical bytes with the device identity.
    pub fn sign(&self, vault: &IdentityVault) -> Result<[u8; 64], EncryptionError> {
        vault.sign(&self.signing_bytes())
    }

    /// Verify a detached signature over the canonical bytes.
    pub fn verify(&self, signature: &[u8; 64], signing_public: &[u8; 32]) -> bool {
        verify_signature(signing_public, &self.signing_bytes(), signature)
    }

    /// Decode a canonical signing buffer back into its fields.
    ///
    /// The peer ID comes back in its normalized routing form (16
    /// lowercase hex chars); the original in-memory string is not
    /// recoverable and does not participate in the signature anyway.
    pub fn parse_signing_bytes(buf: &[u8]) -> Result<Self, EncryptionError> {
        let mut buf = buf;

        if buf.remaining() < 1 {
            return Err(EncryptionError::MalformedAnnounce);
        }
        let context_len = buf.get_u8() as usize;
        if buf.remaining() < context_len {
            return Err(EncryptionError::MalformedAnnounce);
        }
        let context = buf.copy_to_bytes(context_len);
        if context.as_ref() != ANNOUNCE_CONTEXT.as_bytes() {
            return Err(EncryptionError::MalformedAnnounce);
        }

        if buf.remaining() < ROUTING_ID_SIZE + 2 * KEY_SIZE + 1 {
            return Err(EncryptionError::MalformedAnnounce);
        }
        let mut routing_id = [0u8; ROUTING_ID_SIZE];
        buf.copy_to_slice(&mut routing_id);
        let mut noise_public = [0u8; KEY_SIZE];
        buf.copy_to_slice(&mut noise_public);
        let mut signing_public = [0u8; KEY_SIZE];
        buf.copy_to_slice(&mut signing_public);

        let nickname_len = buf.get_u8() as usize;
        if buf.remaining() < nickname_len + 8 {
            return Err(EncryptionError::MalformedAnnounce);
        }
        let nickname_bytes = buf.copy_to_bytes(nickname_len);
        let nickname = String::from_utf8_lossy(&nickname_bytes).into_owned();
        let timestamp_ms = buf.get_u64();

        if buf.has_remaining() {
            return Err(EncryptionError::MalformedAnnounce);
        }

        Ok(Self {
            peer_id: PeerId::new(hex::encode(routing_id)),
            noise_public,
            signing_public,
            nickname,
            timestamp_ms,
        })
    }
}
