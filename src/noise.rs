//! Noise XX handshake wrapper.
//!
//! Pattern: `Noise_XX_25519_ChaChaPoly_SHA256`
//!
//! XX gives mutual authentication (both static keys are proven), identity
//! hiding (statics are encrypted in flight), and forward secrecy
//! (ephemerals per handshake). Peers on the mesh meet with no prior
//! knowledge of each other, which is exactly the case XX is built for.
//!
//! ```text
//! Initiator                         Responder
//!     |  -> e                           |
//!     |-------------------------------->|   32 bytes
//!     |  <- e, ee, s, es                |
//!     |<--------------------------------|   96 bytes
//!     |  -> s, se                       |
//!     |-------------------------------->|   64 bytes
//!     [      transport keys split       ]
//! ```
//!
//! Handshake payloads are empty, so the three message sizes are fixed
//! and double as the frame classifier.

use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};

use crate::error::EncryptionError;

/// Noise protocol pattern (XX with X25519, ChaCha20-Poly1305, SHA-256).
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Size of handshake message 1 (`-> e`).
pub const HANDSHAKE_MSG1_SIZE: usize = 32;

/// Size of handshake message 2 (`<- e, ee, s, es` + empty payload tag).
pub const HANDSHAKE_MSG2_SIZE: usize = 96;

/// Size of handshake message 3 (`-> s, se` + empty payload tag).
pub const HANDSHAKE_MSG3_SIZE: usize = 64;

/// AEAD tag appended to every transport ciphertext.
pub const AEAD_TAG_SIZE: usize = 16;

/// Scratch buffer bound for Noise messages.
const MAX_NOISE_MESSAGE_SIZE: usize = 65_535;

/// Which side of the handshake this session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// In-flight Noise XX handshake for one peer.
///
/// Thin role-generic wrapper over snow's handshake state; the session
/// layer owns message ordering and phase bookkeeping.
pub struct NoiseHandshake {
    role: HandshakeRole,
    state: Box<HandshakeState>,
}

impl NoiseHandshake {
    /// Build a handshake using the device's static private key.
    pub fn new(role: HandshakeRole, local_private_key: &[u8; 32]) -> Result<Self, EncryptionError> {
        let params: NoiseParams = NOISE_PATTERN.parse()?;
        let builder = Builder::new(params).local_private_key(local_private_key);
        let state = match role {
            HandshakeRole::Initiator => builder.build_initiator()?,
            HandshakeRole::Responder => builder.build_responder()?,
        };

        Ok(Self {
            role,
            state: Box::new(state),
        })
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Produce the next outbound handshake message (empty payload).
    pub fn write_message(&mut self) -> Result<Vec<u8>, EncryptionError> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        let len = self.state.write_message(&[], &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume the next inbound handshake message.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(), EncryptionError> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        self.state.read_message(message, &mut buf)?;
        Ok(())
    }

    /// True once all three messages have been processed on this side.
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// The peer's static public key, once learned.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().map(|s| {
            let mut key = [0u8; 32];
            key.copy_from_slice(s);
            key
        })
    }

    /// Split into transport cipher states, yielding the learned remote
    /// static key alongside.
    pub fn into_transport(self) -> Result<(TransportState, [u8; 32]), EncryptionError> {
        let remote_static = self.remote_static().ok_or_else(|| {
            EncryptionError::HandshakeFailure("remote static key missing at completion".to_string())
        })?;
        let transport = self.state.into_transport_mode()?;
        Ok((transport, remote_static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rand::RngCore;

    fn keypair() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn run_handshake() -> (NoiseHandshake, NoiseHandshake) {
        let mut initiator = NoiseHandshake::new(HandshakeRole::Initiator, &keypair()).unwrap();
        let mut responder = NoiseHandshake::new(HandshakeRole::Responder, &keypair()).unwrap();

        let msg1 = initiator.write_message().unwrap();
        assert_eq!(msg1.len(), HANDSHAKE_MSG1_SIZE);
        responder.read_message(&msg1).unwrap();

        let msg2 = responder.write_message().unwrap();
        assert_eq!(msg2.len(), HANDSHAKE_MSG2_SIZE);
        initiator.read_message(&msg2).unwrap();

        let msg3 = initiator.write_message().unwrap();
        assert_eq!(msg3.len(), HANDSHAKE_MSG3_SIZE);
        responder.read_message(&msg3).unwrap();

        (initiator, responder)
    }

    #[test]
    fn test_full_handshake() {
        let (initiator, responder) = run_handshake();

        assert!(initiator.is_finished());
        assert!(responder.is_finished());
        assert!(initiator.remote_static().is_some());
        assert!(responder.remote_static().is_some());
    }

    #[test]
    fn test_transport_round_trip() {
        let (initiator, responder) = run_handshake();

        let (mut send, _) = initiator.into_transport().unwrap();
        let (mut recv, _) = responder.into_transport().unwrap();

        let mut buf = vec![0u8; 1024];
        let len = send.write_message(b"over the mesh", &mut buf).unwrap();
        let ciphertext = buf[..len].to_vec();
        assert_eq!(ciphertext.len(), 13 + AEAD_TAG_SIZE);

        let mut out = vec![0u8; 1024];
        let len = recv.read_message(&ciphertext, &mut out).unwrap();
        assert_eq!(&out[..len], b"over the mesh");
    }

    #[test]
    fn test_tampered_message_rejected() {
        let mut initiator = NoiseHandshake::new(HandshakeRole::Initiator, &keypair()).unwrap();
        let mut responder = NoiseHandshake::new(HandshakeRole::Responder, &keypair()).unwrap();

        let msg1 = initiator.write_message().unwrap();
        responder.read_message(&msg1).unwrap();

        let mut msg2 = responder.write_message().unwrap();
        msg2[40] ^= 0xFF;
        assert!(initiator.read_message(&msg2).is_err());
    }
}
