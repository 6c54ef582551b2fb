//! Routed packet canonicalization and signing.
//!
//! Signatures cover every header field without self-reference: the
//! canonical form serializes the packet with the signature region
//! written as zero bytes of its declared length. Verification rebuilds
//! the same zero-signature form, so signing is idempotent regardless of
//! whatever signature the packet currently carries.
//!
//! Canonical layout (big-endian):
//!
//! ```text
//!   1 byte   version
//!   1 byte   packet_type
//!   1 byte   ttl
//!   1 byte   flags          (bit 0: has recipient)
//!   8 bytes  timestamp_ms
//!   8 bytes  sender_id
//!   8 bytes  recipient_id   (present iff flagged)
//!   4 bytes  payload length
//!   N bytes  payload
//!  64 bytes  signature      (always zero in the canonical form)
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::EncryptionError;
use crate::identity::{verify_signature, IdentityVault, ROUTING_ID_SIZE};

/// Current routed packet version.
pub const PACKET_VERSION: u8 = 1;

/// Declared signature length in the canonical form.
pub const SIGNATURE_SIZE: usize = 64;

const FLAG_HAS_RECIPIENT: u8 = 0x01;

/// A packet as routed across the mesh, with its provenance signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedPacket {
    pub version: u8,
    pub packet_type: u8,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_id: [u8; ROUTING_ID_SIZE],
    pub recipient_id: Option<[u8; ROUTING_ID_SIZE]>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl RoutedPacket {
    pub fn new(
        packet_type: u8,
        ttl: u8,
        timestamp_ms: u64,
        sender_id: [u8; ROUTING_ID_SIZE],
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PACKET_VERSION,
            packet_type,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Canonical binary form with the signature field zeroed.
    pub fn canonical_bytes_for_signing(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            4 + 8 + 2 * ROUTING_ID_SIZE + 4 + self.payload.len() + SIGNATURE_SIZE,
        );

        let mut flags = 0u8;
        if self.recipient_id.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }

        buf.put_u8(self.version);
        buf.put_u8(self.packet_type);
        buf.put_u8(self.ttl);
        buf.put_u8(flags);
        buf.put_u64(self.timestamp_ms);
        buf.put_slice(&self.sender_id);
        if let Some(recipient) = &self.recipient_id {
            buf.put_slice(recipient);
        }
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, SIGNATURE_SIZE);
        buf.to_vec()
    }
}

/// Sign a packet's canonical form with the device identity, storing the
/// signature on the packet.
pub fn sign_packet(
    vault: &IdentityVault,
    packet: &mut RoutedPacket,
) -> Result<(), EncryptionError> {
    let signature = vault.sign(&packet.canonical_bytes_for_signing())?;
    packet.signature = Some(signature);
    Ok(())
}

/// Verify a packet's signature against the sender's Ed25519 signing key.
///
/// The Curve25519 static key is never a valid verification key here.
pub fn verify_packet(packet: &RoutedPacket, signing_public: &[u8; 32]) -> bool {
    match &packet.signature {
        Some(signature) => {
            verify_signature(signing_public, &packet.canonical_bytes_for_signing(), signature)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyStore, MemoryKeyStore};
    use std::sync::Arc;

    fn vault() -> IdentityVault {
        IdentityVault::load_or_create(Arc::new(MemoryKeyStore::new()) as Arc<dyn KeyStore>)
    }

    fn sample() -> RoutedPacket {
        let mut packet = RoutedPacket::new(
            0x04,
            7,
            1_722_500_000_000,
            [0xaa, 0xaa, 0x11, 0x11, 0, 0, 0, 0],
            b"payload bytes".to_vec(),
        );
        packet.recipient_id = Some([0xbb, 0xbb, 0x22, 0x22, 0, 0, 0, 0]);
        packet
    }

    #[test]
    fn test_sign_and_verify() {
        let vault = vault();
        let mut packet = sample();

        sign_packet(&vault, &mut packet).unwrap();
        assert!(packet.signature.is_some());
        assert!(verify_packet(&packet, &vault.signing_public()));
    }

    #[test]
    fn test_signing_is_idempotent_over_existing_signature() {
        let vault = vault();
        let mut packet = sample();

        // Canonical bytes ignore whatever signature is present.
        let unsigned_form = packet.canonical_bytes_for_signing();
        packet.signature = Some([0xFF; SIGNATURE_SIZE]);
        assert_eq!(packet.canonical_bytes_for_signing(), unsigned_form);

        sign_packet(&vault, &mut packet).unwrap();
        let first = packet.signature;
        sign_packet(&vault, &mut packet).unwrap();
        assert_eq!(packet.signature, first);
    }

    #[test]
    fn test_header_mutation_breaks_verification() {
        let vault = vault();
        let mut packet = sample();
        sign_packet(&vault, &mut packet).unwrap();
        let key = vault.signing_public();

        let mut tampered = packet.clone();
        tampered.ttl -= 1;
        assert!(!verify_packet(&tampered, &key));

        let mut tampered = packet.clone();
        tampered.timestamp_ms += 1;
        assert!(!verify_packet(&tampered, &key));

        let mut tampered = packet.clone();
        tampered.payload[0] ^= 0x01;
        assert!(!verify_packet(&tampered, &key));

        let mut tampered = packet.clone();
        tampered.recipient_id = None;
        assert!(!verify_packet(&tampered, &key));
    }

    #[test]
    fn test_noise_static_key_is_not_a_verification_key() {
        let vault = vault();
        let mut packet = sample();
        sign_packet(&vault, &mut packet).unwrap();

        assert!(verify_packet(&packet, &vault.signing_public()));
        assert!(!verify_packet(&packet, &vault.static_public()));
    }

    #[test]
    fn test_unsigned_packet_never_verifies() {
        let vault = vault();
        let packet = sample();
        assert!(!verify_packet(&packet, &vault.signing_public()));
    }
}
