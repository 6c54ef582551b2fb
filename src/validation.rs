//! Stateless validation of peer identifiers and frame sizes.
//!
//! Size limits are chosen for a BLE transport: the MTU times the
//! fragmentation ceiling bounds handshake frames, and transport frames
//! are capped at the Noise message limit.

use crate::identity::PeerId;

/// Longest accepted peer ID string.
pub const MAX_PEER_ID_LENGTH: usize = 64;

/// Largest accepted handshake frame.
pub const MAX_HANDSHAKE_MESSAGE_SIZE: usize = 4096;

/// Largest accepted transport frame (Noise message bound).
pub const MAX_TRANSPORT_MESSAGE_SIZE: usize = 65_535;

/// Peer IDs are non-empty, bounded, ASCII hex.
pub fn validate_peer_id(peer: &PeerId) -> bool {
    let id = peer.as_str();
    !id.is_empty()
        && id.len() <= MAX_PEER_ID_LENGTH
        && id.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn validate_handshake_message_size(message: &[u8]) -> bool {
    !message.is_empty() && message.len() <= MAX_HANDSHAKE_MESSAGE_SIZE
}

pub fn validate_transport_message_size(message: &[u8]) -> bool {
    message.len() <= MAX_TRANSPORT_MESSAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_bounds() {
        assert!(validate_peer_id(&PeerId::new("aaaa1111")));
        assert!(validate_peer_id(&PeerId::new("0011223344556677")));

        assert!(!validate_peer_id(&PeerId::new("")));
        assert!(!validate_peer_id(&PeerId::new("not-hex!")));
        assert!(!validate_peer_id(&PeerId::new("a".repeat(MAX_PEER_ID_LENGTH + 1))));
    }

    #[test]
    fn test_handshake_size_boundary() {
        assert!(validate_handshake_message_size(&vec![0u8; MAX_HANDSHAKE_MESSAGE_SIZE]));
        assert!(!validate_handshake_message_size(&vec![0u8; MAX_HANDSHAKE_MESSAGE_SIZE + 1]));
        assert!(!validate_handshake_message_size(&[]));
    }

    #[test]
    fn test_transport_size_boundary() {
        assert!(validate_transport_message_size(&vec![0u8; MAX_TRANSPORT_MESSAGE_SIZE]));
        assert!(!validate_transport_message_size(&vec![0u8; MAX_TRANSPORT_MESSAGE_SIZE + 1]));
    }
}
