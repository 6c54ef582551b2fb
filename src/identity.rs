//! Device identity: peer IDs, long-term keypairs, and fingerprints.
//!
//! A device carries two persistent keypairs with the same lifecycle but
//! distinct store tags: a Curve25519 static key for Noise key agreement
//! and an Ed25519 key for announce/packet signatures. The **fingerprint**
//! is lowercase hex of SHA-256 over the static public key and is the
//! stable, user-visible identity; peer IDs are ephemeral routing handles
//! assigned by the transport.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::EncryptionError;
use crate::keystore::{KeyStore, SIGNING_KEY_TAG, STATIC_KEY_TAG};

/// Number of bytes a peer ID occupies in canonical signing layouts.
pub const ROUTING_ID_SIZE: usize = 8;

/// Short routing handle assigned by the transport layer.
///
/// In memory this is a short hex string; canonical signing layouts use
/// its 8-byte routing form (see [`PeerId::routing_bytes`]). Ordering is
/// lexicographic, which the session manager relies on to break
/// simultaneous-handshake ties.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 8-byte routing form used in canonical signing.
    ///
    /// The hex string is decoded to raw bytes (IDs that are not valid
    /// hex fall back to their UTF-8 bytes), truncated to 8 bytes, and
    /// zero-padded on the right. Deterministic on both ends, which is
    /// all a signing layout needs.
    pub fn routing_bytes(&self) -> [u8; ROUTING_ID_SIZE] {
        let decoded = hex::decode(&self.0).unwrap_or_else(|_| self.0.as_bytes().to_vec());
        let mut id = [0u8; ROUTING_ID_SIZE];
        for (dst, src) in id.iter_mut().zip(decoded.iter()) {
            *dst = *src;
        }
        id
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Lowercase hex of SHA-256 over a public key's raw 32 bytes.
pub fn fingerprint_of(public_key: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hex::encode(hasher.finalize())
}

/// Verify an Ed25519 detached signature against a raw public key.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig).is_ok()
}

/// Long-term device identity loaded from (or persisted to) a [`KeyStore`].
///
/// Holds the Curve25519 static keypair and the Ed25519 signing keypair.
/// Private material zeroizes on drop (dalek types handle this). When the
/// store rejects writes, the vault keeps working with ephemeral keys and
/// reports `is_persisted() == false`.
pub struct IdentityVault {
    static_secret: StaticSecret,
    static_public: [u8; 32],
    signing_key: SigningKey,
    persisted: AtomicBool,
    wiped: AtomicBool,
    store: Arc<dyn KeyStore>,
}

impl IdentityVault {
    /// Load both keypairs from the store, generating and persisting
    /// fresh keys on miss or parse failure.
    pub fn load_or_create(store: Arc<dyn KeyStore>) -> Self {
        let mut persisted = true;

        let (static_secret, static_fresh) = match load_key(store.as_ref(), STATIC_KEY_TAG) {
            Some(bytes) => (StaticSecret::from(bytes), false),
            None => {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                let secret = StaticSecret::from(bytes);
                bytes.zeroize();
                (secret, true)
            }
        };

        let (signing_key, signing_fresh) = match load_key(store.as_ref(), SIGNING_KEY_TAG) {
            Some(bytes) => (SigningKey::from_bytes(&bytes), false),
            None => (SigningKey::generate(&mut OsRng), true),
        };

        if static_fresh && !store.put(STATIC_KEY_TAG, &static_secret.to_bytes()) {
            warn!("failed to persist static key; continuing with ephemeral identity");
            persisted = false;
        }
        if signing_fresh && !store.put(SIGNING_KEY_TAG, &signing_key.to_bytes()) {
            warn!("failed to persist signing key; continuing with ephemeral identity");
            persisted = false;
        }

        let static_public = *PublicKey::from(&static_secret).as_bytes();
        let vault = Self {
            static_secret,
            static_public,
            signing_key,
            persisted: AtomicBool::new(persisted),
            wiped: AtomicBool::new(false),
            store,
        };

        if static_fresh || signing_fresh {
            info!(fingerprint = %vault.fingerprint(), "generated new identity keys");
        } else {
            info!(fingerprint = %vault.fingerprint(), "loaded identity keys");
        }
        vault
    }

    /// Raw Curve25519 static public key.
    pub fn static_public(&self) -> [u8; 32] {
        self.static_public
    }

    /// Raw Ed25519 signing public key.
    pub fn signing_public(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// This device's fingerprint: SHA-256 of the static public key.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.static_public)
    }

    /// Whether both keys made it into the backing store.
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::SeqCst)
    }

    pub(crate) fn static_private_bytes(&self) -> [u8; 32] {
        self.static_secret.to_bytes()
    }

    /// Ed25519 detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], EncryptionError> {
        if self.wiped.load(Ordering::SeqCst) {
            return Err(EncryptionError::IdentityWiped);
        }
        Ok(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a detached signature against an arbitrary signing key.
    pub fn verify(&self, signature: &[u8; 64], message: &[u8], public_key: &[u8; 32]) -> bool {
        verify_signature(public_key, message, signature)
    }

    /// Re-attempt persisting both keys into the store.
    pub fn persist(&self) -> Result<(), EncryptionError> {
        if self.wiped.load(Ordering::SeqCst) {
            return Err(EncryptionError::IdentityWiped);
        }
        let static_ok = self.store.put(STATIC_KEY_TAG, &self.static_secret.to_bytes());
        let signing_ok = self.store.put(SIGNING_KEY_TAG, &self.signing_key.to_bytes());
        if static_ok && signing_ok {
            self.persisted.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(EncryptionError::PersistenceFailure(
                "key store rejected write".to_string(),
            ))
        }
    }

    /// Delete both keys from the store and disable signing.
    ///
    /// In-memory key material is released (and zeroized) when the vault
    /// drops; until then only the public halves remain observable.
    pub fn wipe(&self) {
        let static_deleted = self.store.delete(STATIC_KEY_TAG);
        let signing_deleted = self.store.delete(SIGNING_KEY_TAG);
        self.wiped.store(true, Ordering::SeqCst);
        if static_deleted && signing_deleted {
            info!("identity keys wiped from store");
        } else {
            warn!(static_deleted, signing_deleted, "identity wipe incomplete");
        }
    }
}

fn load_key(store: &dyn KeyStore, tag: &str) -> Option<[u8; 32]> {
    let mut bytes = store.get(tag)?;
    if bytes.len() != 32 {
        warn!(tag, len = bytes.len(), "stored key has wrong length; regenerating");
        bytes.zeroize();
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    #[test]
    fn test_create_then_load_is_stable() {
        let store = Arc::new(MemoryKeyStore::new());

        let first = IdentityVault::load_or_create(Arc::clone(&store) as Arc<dyn KeyStore>);
        let second = IdentityVault::load_or_create(store as Arc<dyn KeyStore>);

        assert_eq!(first.static_public(), second.static_public());
        assert_eq!(first.signing_public(), second.signing_public());
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert!(first.is_persisted());
    }

    #[test]
    fn test_fingerprint_shape() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = IdentityVault::load_or_create(store as Arc<dyn KeyStore>);

        let fp = vault.fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sign_verify() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = IdentityVault::load_or_create(store as Arc<dyn KeyStore>);

        let message = b"announce body";
        let signature = vault.sign(message).unwrap();
        assert!(vault.verify(&signature, message, &vault.signing_public()));
        assert!(!vault.verify(&signature, b"different body", &vault.signing_public()));
    }

    #[test]
    fn test_wipe_disables_signing_and_clears_store() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = IdentityVault::load_or_create(Arc::clone(&store) as Arc<dyn KeyStore>);

        vault.wipe();
        assert!(matches!(vault.sign(b"x"), Err(EncryptionError::IdentityWiped)));

        // A reload after wipe gets a brand-new identity.
        let fresh = IdentityVault::load_or_create(store as Arc<dyn KeyStore>);
        assert_ne!(vault.static_public(), fresh.static_public());
    }

    #[test]
    fn test_corrupt_stored_key_regenerates() {
        let store = Arc::new(MemoryKeyStore::new());
        store.put(STATIC_KEY_TAG, &[0xAB; 7]);

        let vault = IdentityVault::load_or_create(store as Arc<dyn KeyStore>);
        assert_eq!(vault.fingerprint().len(), 64);
    }

    #[test]
    fn test_routing_bytes() {
        // Hex IDs decode; short ones pad with zeros on the right.
        let peer = PeerId::new("aaaa1111");
        assert_eq!(peer.routing_bytes(), [0xaa, 0xaa, 0x11, 0x11, 0, 0, 0, 0]);

        // Full 16-hex-char IDs fill all 8 bytes.
        let peer = PeerId::new("0011223344556677");
        assert_eq!(peer.routing_bytes(), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);

        // Oversized IDs truncate to the leftmost 8 bytes.
        let peer = PeerId::new("00112233445566778899");
        assert_eq!(peer.routing_bytes(), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
    }

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        assert!(PeerId::new("aaaa1111") < PeerId::new("bbbb2222"));
    }
}
