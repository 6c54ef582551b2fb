//! Per-peer session state machine.
//!
//! A session is either mid-handshake (holding Noise handshake state) or
//! established (holding transport cipher states); never both. Transport
//! nonces live inside the cipher states and advance only on successful
//! AEAD operations, so a replayed frame fails its tag without desyncing
//! the stream.

use std::time::{Duration, Instant};

use snow::TransportState;
use tracing::{debug, warn};

use crate::error::EncryptionError;
use crate::identity::PeerId;
use crate::noise::{HandshakeRole, NoiseHandshake, AEAD_TAG_SIZE};

/// Consecutive AEAD failures tolerated before the session is failed.
///
/// A lossy mesh delivers the odd replayed or stale frame; one bad tag is
/// not evidence of a broken stream, a run of them is.
pub const MAX_DECRYPT_FAILURES: u32 = 10;

/// Session lifecycle phase. `Handshaking(n)` counts handshake messages
/// processed on this side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Handshaking(u8),
    Established,
    Failed,
}

/// Forward-secrecy budget. A session asks for a rekey when any bound is
/// hit; the defaults are conservative fractions of AEAD safe-use limits.
#[derive(Clone, Copy, Debug)]
pub struct RekeyPolicy {
    pub max_messages: u64,
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_messages: 100_000,
            max_bytes: 1024 * 1024 * 1024,
            max_age: Duration::from_secs(3600),
        }
    }
}

/// One peer's Noise session: handshake driving, transport encryption,
/// traffic counters, and the rekey predicate.
pub struct NoiseSession {
    peer: PeerId,
    role: HandshakeRole,
    phase: SessionPhase,
    handshake: Option<NoiseHandshake>,
    transport: Option<TransportState>,
    remote_static: Option<[u8; 32]>,
    created_at: Instant,
    last_activity: Instant,
    bytes_sent: u64,
    messages_sent: u64,
    decrypt_failures: u32,
    policy: RekeyPolicy,
}

impl NoiseSession {
    pub fn new(
        peer: PeerId,
        role: HandshakeRole,
        local_private_key: &[u8; 32],
        policy: RekeyPolicy,
    ) -> Result<Self, EncryptionError> {
        let handshake = NoiseHandshake::new(role, local_private_key)?;
        let now = Instant::now();
        Ok(Self {
            peer,
            role,
            phase: SessionPhase::Handshaking(0),
            handshake: Some(handshake),
            transport: None,
            remote_static: None,
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            messages_sent: 0,
            decrypt_failures: 0,
            policy,
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == SessionPhase::Established
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.phase, SessionPhase::Handshaking(_))
    }

    /// The peer's static key, learned during the handshake.
    pub fn remote_static_key(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Produce handshake message 1. Only valid for a fresh initiator.
    pub fn start_handshake(&mut self) -> Result<Vec<u8>, EncryptionError> {
        if self.role != HandshakeRole::Initiator || self.phase != SessionPhase::Handshaking(0) {
            return Err(self.fail("not in a state to start a handshake"));
        }
        let handshake = match self.handshake.as_mut() {
            Some(h) => h,
            None => return Err(self.fail("handshake state missing")),
        };
        let msg1 = match handshake.write_message() {
            Ok(m) => m,
            Err(e) => return Err(self.fail_with(e)),
        };
        self.phase = SessionPhase::Handshaking(1);
        Ok(msg1)
    }

    /// Advance the handshake with an inbound message.
    ///
    /// Returns the reply to transmit (msg2 or msg3), or `None` when the
    /// handshake completed on this side with nothing further to send.
    pub fn process_handshake_message(
        &mut self,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, EncryptionError> {
        match (self.role, self.phase) {
            // Responder consuming msg1, answering with msg2.
            (HandshakeRole::Responder, SessionPhase::Handshaking(0)) => {
                let handshake = match self.handshake.as_mut() {
                    Some(h) => h,
                    None => return Err(self.fail("handshake state missing")),
                };
                if let Err(e) = handshake.read_message(message) {
                    return Err(self.fail_with(e));
                }
                let msg2 = match handshake.write_message() {
                    Ok(m) => m,
                    Err(e) => return Err(self.fail_with(e)),
                };
                self.phase = SessionPhase::Handshaking(2);
                Ok(Some(msg2))
            }
            // Initiator consuming msg2, answering with msg3 and completing.
            (HandshakeRole::Initiator, SessionPhase::Handshaking(1)) => {
                let handshake = match self.handshake.as_mut() {
                    Some(h) => h,
                    None => return Err(self.fail("handshake state missing")),
                };
                if let Err(e) = handshake.read_message(message) {
                    return Err(self.fail_with(e));
                }
                let msg3 = match handshake.write_message() {
                    Ok(m) => m,
                    Err(e) => return Err(self.fail_with(e)),
                };
                self.promote()?;
                Ok(Some(msg3))
            }
            // Responder consuming msg3 and completing.
            (HandshakeRole::Responder, SessionPhase::Handshaking(2)) => {
                let handshake = match self.handshake.as_mut() {
                    Some(h) => h,
                    None => return Err(self.fail("handshake state missing")),
                };
                if let Err(e) = handshake.read_message(message) {
                    return Err(self.fail_with(e));
                }
                self.promote()?;
                Ok(None)
            }
            _ => Err(self.fail("unexpected handshake message for current phase")),
        }
    }

    fn promote(&mut self) -> Result<(), EncryptionError> {
        let handshake = match self.handshake.take() {
            Some(h) => h,
            None => return Err(self.fail("handshake state missing at completion")),
        };
        let (transport, remote_static) = match handshake.into_transport() {
            Ok(split) => split,
            Err(e) => return Err(self.fail_with(e)),
        };
        self.transport = Some(transport);
        self.remote_static = Some(remote_static);
        self.phase = SessionPhase::Established;
        self.decrypt_failures = 0;
        self.last_activity = Instant::now();
        debug!(peer = %self.peer, role = ?self.role, "session established");
        Ok(())
    }

    /// Encrypt one transport message, bumping the send nonce and counters.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let transport = match (self.phase, self.transport.as_mut()) {
            (SessionPhase::Established, Some(t)) => t,
            _ => return Err(EncryptionError::HandshakeRequired),
        };

        let mut buf = vec![0u8; plaintext.len() + AEAD_TAG_SIZE];
        let len = match transport.write_message(plaintext, &mut buf) {
            Ok(len) => len,
            // Nonce exhaustion or cipher failure is fatal for this session.
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "transport encrypt failed; failing session");
                self.phase = SessionPhase::Failed;
                self.transport = None;
                return Err(EncryptionError::from(e));
            }
        };
        buf.truncate(len);

        self.messages_sent += 1;
        self.bytes_sent += plaintext.len() as u64;
        self.last_activity = Instant::now();
        Ok(buf)
    }

    /// Decrypt one transport message, bumping the receive nonce.
    ///
    /// A failed tag rejects the frame but keeps the session alive; only a
    /// run of [`MAX_DECRYPT_FAILURES`] consecutive failures fails it.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let transport = match (self.phase, self.transport.as_mut()) {
            (SessionPhase::Established, Some(t)) => t,
            _ => return Err(EncryptionError::SessionNotEstablished),
        };

        if ciphertext.len() < AEAD_TAG_SIZE {
            return self.note_decrypt_failure();
        }

        let mut buf = vec![0u8; ciphertext.len()];
        match transport.read_message(ciphertext, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                self.decrypt_failures = 0;
                self.last_activity = Instant::now();
                Ok(buf)
            }
            Err(_) => self.note_decrypt_failure(),
        }
    }

    fn note_decrypt_failure(&mut self) -> Result<Vec<u8>, EncryptionError> {
        self.decrypt_failures += 1;
        if self.decrypt_failures >= MAX_DECRYPT_FAILURES {
            warn!(
                peer = %self.peer,
                failures = self.decrypt_failures,
                "too many consecutive decrypt failures; failing session"
            );
            self.phase = SessionPhase::Failed;
            self.transport = None;
        }
        Err(EncryptionError::DecryptionFailure)
    }

    /// Whether the forward-secrecy budget demands a fresh handshake.
    pub fn needs_rekey(&self) -> bool {
        self.is_established()
            && (self.messages_sent >= self.policy.max_messages
                || self.bytes_sent >= self.policy.max_bytes
                || self.created_at.elapsed() >= self.policy.max_age)
    }

    fn fail(&mut self, reason: &str) -> EncryptionError {
        self.fail_with(EncryptionError::HandshakeFailure(reason.to_string()))
    }

    fn fail_with(&mut self, err: EncryptionError) -> EncryptionError {
        self.phase = SessionPhase::Failed;
        self.handshake = None;
        self.transport = None;
        err
    }
}
