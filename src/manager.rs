//! Session manager: the peer → session map and its rules.
//!
//! All session mutation for a peer happens under one writer lock; status
//! queries take shared access. The manager never invokes caller
//! callbacks itself — establishment is reported through
//! [`HandshakeOutcome`] so the façade can notify outside the lock.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::EncryptionError;
use crate::identity::{fingerprint_of, PeerId};
use crate::noise::{
    HandshakeRole, HANDSHAKE_MSG1_SIZE, HANDSHAKE_MSG2_SIZE, HANDSHAKE_MSG3_SIZE,
};
use crate::session::{NoiseSession, RekeyPolicy, SessionPhase};

/// A session reached `Established`; the façade fires callbacks from this.
#[derive(Clone, Debug)]
pub struct SessionEstablished {
    pub peer: PeerId,
    pub remote_static: [u8; 32],
    pub fingerprint: String,
}

/// Result of feeding one inbound handshake frame.
#[derive(Default)]
pub struct HandshakeOutcome {
    /// Bytes to transmit back (msg2 or msg3), if any.
    pub reply: Option<Vec<u8>>,
    /// Set exactly once per establishment.
    pub established: Option<SessionEstablished>,
}

impl HandshakeOutcome {
    fn none() -> Self {
        Self::default()
    }
}

struct ManagerState {
    sessions: HashMap<PeerId, NoiseSession>,
    peer_fingerprints: HashMap<PeerId, String>,
    fingerprint_peers: HashMap<String, PeerId>,
}

/// Owns every per-peer session plus the fingerprint ⇄ peer index.
pub struct SessionManager {
    local_peer: PeerId,
    local_static: Zeroizing<[u8; 32]>,
    policy: RekeyPolicy,
    state: RwLock<ManagerState>,
}

impl SessionManager {
    pub fn new(local_peer: PeerId, local_static_key: [u8; 32], policy: RekeyPolicy) -> Self {
        Self {
            local_peer,
            local_static: Zeroizing::new(local_static_key),
            policy,
            state: RwLock::new(ManagerState {
                sessions: HashMap::new(),
                peer_fingerprints: HashMap::new(),
                fingerprint_peers: HashMap::new(),
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Start (or restart) an outbound handshake, producing msg1.
    ///
    /// An established session is only replaced when its rekey budget is
    /// spent; use [`SessionManager::initiate_rekey`] to force one. A
    /// responder handshake already running with this peer is left alone.
    pub fn initiate_handshake(&self, peer: &PeerId) -> Result<Vec<u8>, EncryptionError> {
        let mut state = self.write_state()?;

        match state.sessions.get_mut(peer) {
            Some(session) if session.is_established() => {
                if !session.needs_rekey() {
                    return Err(EncryptionError::AlreadyEstablished);
                }
                debug!(%peer, "rekey budget spent; replacing established session");
            }
            Some(session)
                if session.role() == HandshakeRole::Initiator
                    && session.phase() == SessionPhase::Handshaking(0) =>
            {
                // A rekey left this session armed; emit its msg1 now.
                return session.start_handshake();
            }
            Some(session)
                if session.role() == HandshakeRole::Responder && session.is_handshaking() =>
            {
                return Err(EncryptionError::HandshakeInProgress);
            }
            // Failed or stale initiator sessions are replaced below.
            _ => {}
        }

        let mut session = NoiseSession::new(
            peer.clone(),
            HandshakeRole::Initiator,
            &self.local_static,
            self.policy,
        )?;
        let msg1 = session.start_handshake()?;
        state.sessions.insert(peer.clone(), session);
        info!(%peer, "handshake initiated");
        Ok(msg1)
    }

    /// Feed one inbound handshake frame, classified by its length.
    pub fn handle_incoming_handshake(
        &self,
        peer: &PeerId,
        message: &[u8],
    ) -> Result<HandshakeOutcome, EncryptionError> {
        match message.len() {
            HANDSHAKE_MSG1_SIZE => self.handle_msg1(peer, message),
            HANDSHAKE_MSG2_SIZE | HANDSHAKE_MSG3_SIZE => self.advance_handshake(peer, message),
            len => Err(EncryptionError::HandshakeFailure(format!(
                "unrecognized handshake message length {len}"
            ))),
        }
    }

    fn handle_msg1(
        &self,
        peer: &PeerId,
        message: &[u8],
    ) -> Result<HandshakeOutcome, EncryptionError> {
        let mut state = self.write_state()?;

        if let Some(existing) = state.sessions.get(peer) {
            if existing.is_handshaking() && existing.role() == HandshakeRole::Initiator {
                // Simultaneous handshake: the lexicographically smaller
                // peer ID keeps the initiator role. Both sides apply the
                // same rule, so exactly one yields.
                if self.local_peer < *peer {
                    debug!(%peer, "simultaneous handshake: keeping initiator role, ignoring msg1");
                    return Ok(HandshakeOutcome::none());
                }
                debug!(%peer, "simultaneous handshake: yielding initiator role");
            }
            // Any other existing session (established peer restarting or
            // rekeying toward us, stale responder, failed) is replaced by
            // a fresh responder below.
        }

        let mut session = NoiseSession::new(
            peer.clone(),
            HandshakeRole::Responder,
            &self.local_static,
            self.policy,
        )?;
        let reply = match session.process_handshake_message(message) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                return Err(EncryptionError::HandshakeFailure(
                    "responder produced no reply to msg1".to_string(),
                ))
            }
            Err(e) => {
                warn!(%peer, error = %e, "failed to process handshake message 1");
                return Err(e);
            }
        };
        state.sessions.insert(peer.clone(), session);
        info!(%peer, "responding to inbound handshake");
        Ok(HandshakeOutcome {
            reply: Some(reply),
            established: None,
        })
    }

    fn advance_handshake(
        &self,
        peer: &PeerId,
        message: &[u8],
    ) -> Result<HandshakeOutcome, EncryptionError> {
        let mut state = self.write_state()?;

        let session = match state.sessions.get_mut(peer) {
            Some(s) => s,
            None => {
                return Err(EncryptionError::HandshakeFailure(
                    "no handshake in progress".to_string(),
                ))
            }
        };

        if session.is_established() {
            // Stale retransmission on a lossy mesh; the live session wins.
            debug!(%peer, "ignoring handshake frame for established session");
            return Ok(HandshakeOutcome::none());
        }

        match session.process_handshake_message(message) {
            Ok(reply) => {
                let established = if session.is_established() {
                    match session.remote_static_key() {
                        Some(remote_static) => {
                            Some(record_established(&mut state, peer, remote_static))
                        }
                        None => {
                            evict(&mut state, peer);
                            return Err(EncryptionError::HandshakeFailure(
                                "established session without remote static key".to_string(),
                            ));
                        }
                    }
                } else {
                    None
                };
                if let Some(event) = &established {
                    info!(%peer, fingerprint = %event.fingerprint, "handshake completed");
                }
                Ok(HandshakeOutcome { reply, established })
            }
            Err(e) => {
                warn!(%peer, error = %e, "handshake failed; evicting session");
                evict(&mut state, peer);
                Err(e)
            }
        }
    }

    /// Encrypt for an established peer.
    pub fn encrypt(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut state = self.write_state()?;

        let result = match state.sessions.get_mut(peer) {
            Some(session) if session.is_established() => session.encrypt(plaintext),
            _ => return Err(EncryptionError::HandshakeRequired),
        };
        if result.is_err() {
            self.evict_if_failed(&mut state, peer);
        }
        result
    }

    /// Decrypt from an established peer.
    pub fn decrypt(&self, peer: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut state = self.write_state()?;

        let result = match state.sessions.get_mut(peer) {
            Some(session) if session.is_established() => session.decrypt(ciphertext),
            _ => return Err(EncryptionError::SessionNotEstablished),
        };
        if result.is_err() {
            self.evict_if_failed(&mut state, peer);
        }
        result
    }

    /// Replace the peer's session with a fresh initiator at step 0.
    ///
    /// The peer mapping (and its fingerprint) is retained; the caller is
    /// responsible for transmitting the new msg1, which
    /// [`SessionManager::initiate_handshake`] will emit.
    pub fn initiate_rekey(&self, peer: &PeerId) -> Result<(), EncryptionError> {
        let mut state = self.write_state()?;

        if !state.sessions.contains_key(peer) {
            return Err(EncryptionError::SessionNotEstablished);
        }
        let session = NoiseSession::new(
            peer.clone(),
            HandshakeRole::Initiator,
            &self.local_static,
            self.policy,
        )?;
        state.sessions.insert(peer.clone(), session);
        info!(%peer, "rekey initiated; awaiting fresh handshake");
        Ok(())
    }

    /// Peers whose forward-secrecy budget is spent.
    pub fn sessions_needing_rekey(&self) -> Vec<PeerId> {
        match self.read_state() {
            Ok(state) => state
                .sessions
                .values()
                .filter(|s| s.needs_rekey())
                .map(|s| s.peer().clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn remove_session(&self, peer: &PeerId) {
        if let Ok(mut state) = self.state.write() {
            evict(&mut state, peer);
        }
    }

    pub fn remove_all_sessions(&self) {
        if let Ok(mut state) = self.state.write() {
            let count = state.sessions.len();
            state.sessions.clear();
            state.peer_fingerprints.clear();
            state.fingerprint_peers.clear();
            info!(count, "all sessions removed");
        }
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        match self.read_state() {
            Ok(state) => state.sessions.contains_key(peer),
            Err(_) => false,
        }
    }

    pub fn has_established_session(&self, peer: &PeerId) -> bool {
        match self.read_state() {
            Ok(state) => state
                .sessions
                .get(peer)
                .map(|s| s.is_established())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn remote_static_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        let state = self.read_state().ok()?;
        state.sessions.get(peer).and_then(|s| s.remote_static_key())
    }

    pub fn fingerprint_for(&self, peer: &PeerId) -> Option<String> {
        let state = self.read_state().ok()?;
        state.peer_fingerprints.get(peer).cloned()
    }

    pub fn peer_for_fingerprint(&self, fingerprint: &str) -> Option<PeerId> {
        let state = self.read_state().ok()?;
        state.fingerprint_peers.get(fingerprint).cloned()
    }

    fn evict_if_failed(&self, state: &mut ManagerState, peer: &PeerId) {
        let failed = state
            .sessions
            .get(peer)
            .map(|s| s.phase() == SessionPhase::Failed)
            .unwrap_or(false);
        if failed {
            warn!(%peer, "evicting failed session");
            evict(state, peer);
        }
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, ManagerState>, EncryptionError> {
        self.state
            .read()
            .map_err(|_| EncryptionError::HandshakeFailure("session state poisoned".to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, ManagerState>, EncryptionError> {
        self.state
            .write()
            .map_err(|_| EncryptionError::HandshakeFailure("session state poisoned".to_string()))
    }
}

/// Update the bidirectional fingerprint index for a fresh establishment.
fn record_established(
    state: &mut ManagerState,
    peer: &PeerId,
    remote_static: [u8; 32],
) -> SessionEstablished {
    let fingerprint = fingerprint_of(&remote_static);

    if let Some(old) = state
        .peer_fingerprints
        .insert(peer.clone(), fingerprint.clone())
    {
        if old != fingerprint {
            state.fingerprint_peers.remove(&old);
        }
    }
    if let Some(old_peer) = state
        .fingerprint_peers
        .insert(fingerprint.clone(), peer.clone())
    {
        if old_peer != *peer {
            state.peer_fingerprints.remove(&old_peer);
        }
    }

    SessionEstablished {
        peer: peer.clone(),
        remote_static,
        fingerprint,
    }
}

fn evict(state: &mut ManagerState, peer: &PeerId) {
    state.sessions.remove(peer);
    if let Some(fingerprint) = state.peer_fingerprints.remove(peer) {
        state.fingerprint_peers.remove(&fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rand::RngCore;

    fn manager(local: &str) -> SessionManager {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        SessionManager::new(PeerId::new(local), key, RekeyPolicy::default())
    }

    fn complete_handshake(
        a: &SessionManager,
        b: &SessionManager,
    ) -> (SessionEstablished, SessionEstablished) {
        let a_peer = a.local_peer().clone();
        let b_peer = b.local_peer().clone();

        let msg1 = a.initiate_handshake(&b_peer).unwrap();
        let out1 = b.handle_incoming_handshake(&a_peer, &msg1).unwrap();
        let msg2 = out1.reply.unwrap();

        let out2 = a.handle_incoming_handshake(&b_peer, &msg2).unwrap();
        let a_event = out2.established.unwrap();
        let msg3 = out2.reply.unwrap();

        let out3 = b.handle_incoming_handshake(&a_peer, &msg3).unwrap();
        assert!(out3.reply.is_none());
        let b_event = out3.established.unwrap();

        (a_event, b_event)
    }

    #[test]
    fn test_full_handshake_between_managers() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");

        let (a_event, b_event) = complete_handshake(&a, &b);

        assert!(a.has_established_session(&PeerId::new("bbbb2222")));
        assert!(b.has_established_session(&PeerId::new("aaaa1111")));
        assert_eq!(a_event.fingerprint.len(), 64);
        assert_eq!(b_event.fingerprint.len(), 64);

        // The fingerprint index is bijective over established peers.
        assert_eq!(
            a.peer_for_fingerprint(&a_event.fingerprint),
            Some(PeerId::new("bbbb2222"))
        );
        assert_eq!(
            a.fingerprint_for(&PeerId::new("bbbb2222")),
            Some(a_event.fingerprint)
        );
    }

    #[test]
    fn test_encrypt_decrypt_through_managers() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        complete_handshake(&a, &b);

        let ciphertext = a.encrypt(&PeerId::new("bbbb2222"), b"hello").unwrap();
        assert!(ciphertext.len() >= 5 + 16);
        let plaintext = b.decrypt(&PeerId::new("aaaa1111"), &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_encrypt_without_session_requires_handshake() {
        let a = manager("aaaa1111");
        assert!(matches!(
            a.encrypt(&PeerId::new("bbbb2222"), b"x"),
            Err(EncryptionError::HandshakeRequired)
        ));
    }

    #[test]
    fn test_simultaneous_handshake_tie_break() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let a_peer = PeerId::new("aaaa1111");
        let b_peer = PeerId::new("bbbb2222");

        // Both sides initiate before seeing each other's msg1.
        let msg1_from_a = a.initiate_handshake(&b_peer).unwrap();
        let msg1_from_b = b.initiate_handshake(&a_peer).unwrap();

        // A's local ID is smaller, so A ignores B's msg1 and stays initiator.
        let out = a.handle_incoming_handshake(&b_peer, &msg1_from_b).unwrap();
        assert!(out.reply.is_none());
        assert!(out.established.is_none());

        // B yields to A's msg1 and becomes responder.
        let out = b.handle_incoming_handshake(&a_peer, &msg1_from_a).unwrap();
        let msg2 = out.reply.unwrap();

        let out = a.handle_incoming_handshake(&b_peer, &msg2).unwrap();
        let msg3 = out.reply.unwrap();
        assert!(out.established.is_some());

        let out = b.handle_incoming_handshake(&a_peer, &msg3).unwrap();
        assert!(out.established.is_some());

        assert!(a.has_established_session(&b_peer));
        assert!(b.has_established_session(&a_peer));
    }

    #[test]
    fn test_initiate_on_established_session_is_rejected() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        complete_handshake(&a, &b);

        assert!(matches!(
            a.initiate_handshake(&PeerId::new("bbbb2222")),
            Err(EncryptionError::AlreadyEstablished)
        ));
    }

    #[test]
    fn test_rekey_arms_fresh_initiator() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let a_peer = PeerId::new("aaaa1111");
        let b_peer = PeerId::new("bbbb2222");
        complete_handshake(&a, &b);

        a.initiate_rekey(&b_peer).unwrap();
        assert!(!a.has_established_session(&b_peer));
        // The fingerprint expectation survives the rekey.
        assert!(a.fingerprint_for(&b_peer).is_some());

        // initiate_handshake now emits msg1 from the armed session.
        let msg1 = a.initiate_handshake(&b_peer).unwrap();
        let out = b.handle_incoming_handshake(&a_peer, &msg1).unwrap();
        let msg2 = out.reply.unwrap();
        let out = a.handle_incoming_handshake(&b_peer, &msg2).unwrap();
        let msg3 = out.reply.unwrap();
        b.handle_incoming_handshake(&a_peer, &msg3).unwrap();

        assert!(a.has_established_session(&b_peer));
        assert!(b.has_established_session(&a_peer));
    }

    #[test]
    fn test_remove_session_clears_index() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let b_peer = PeerId::new("bbbb2222");
        let (a_event, _) = complete_handshake(&a, &b);

        a.remove_session(&b_peer);
        assert!(!a.has_session(&b_peer));
        assert!(a.fingerprint_for(&b_peer).is_none());
        assert!(a.peer_for_fingerprint(&a_event.fingerprint).is_none());
    }

    #[test]
    fn test_at_most_one_session_per_peer() {
        let a = manager("aaaa1111");
        let b_peer = PeerId::new("bbbb2222");

        // Re-initiating replaces the stale handshake; it never duplicates.
        a.initiate_handshake(&b_peer).unwrap();
        a.initiate_handshake(&b_peer).unwrap();
        assert!(a.has_session(&b_peer));

        let state = a.state.read().unwrap();
        assert_eq!(state.sessions.len(), 1);
    }

    #[test]
    fn test_garbage_handshake_frame_rejected() {
        let a = manager("aaaa1111");
        let out = a.handle_incoming_handshake(&PeerId::new("bbbb2222"), &[0u8; 40]);
        assert!(matches!(out, Err(EncryptionError::HandshakeFailure(_))));
    }
}
