//! Encryption service façade.
//!
//! Orchestration only: validation and rate limiting in front of the
//! session manager, the callback registry, and the periodic rekey
//! check. Callbacks are always invoked after the session-map lock is
//! released, so handlers may call back into the service.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::EncryptionError;
use crate::identity::{IdentityVault, PeerId};
use crate::keystore::KeyStore;
use crate::manager::SessionManager;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::session::RekeyPolicy;
use crate::validation::{
    validate_handshake_message_size, validate_peer_id, validate_transport_message_size,
    MAX_HANDSHAKE_MESSAGE_SIZE, MAX_TRANSPORT_MESSAGE_SIZE,
};

/// Handler invoked on every successful session establishment.
pub type PeerAuthenticatedHandler = Arc<dyn Fn(&PeerId, &str) + Send + Sync>;

/// Handler invoked when a peer needs a (re)handshake.
pub type HandshakeRequiredHandler = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Service-wide tunables.
#[derive(Clone, Copy, Debug)]
pub struct ServiceConfig {
    pub rate_limits: RateLimitConfig,
    pub rekey_policy: RekeyPolicy,
    /// How often the background check walks sessions for spent budgets.
    pub rekey_check_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitConfig::default(),
            rekey_policy: RekeyPolicy::default(),
            rekey_check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Observers {
    peer_authenticated: Vec<PeerAuthenticatedHandler>,
    handshake_required: Option<HandshakeRequiredHandler>,
}

/// Public surface of the encryption core.
///
/// One instance per device, alive for the application's lifetime. Safe
/// to share across the transport, UI, and timer threads.
pub struct EncryptionService {
    vault: Arc<IdentityVault>,
    manager: Arc<SessionManager>,
    rate_limiter: Arc<RateLimiter>,
    observers: Arc<Mutex<Observers>>,
    rekey_timer: RekeyTimer,
}

impl EncryptionService {
    /// Build the service around a secure store and this device's peer ID.
    pub fn new(
        store: Arc<dyn KeyStore>,
        local_peer: PeerId,
        config: ServiceConfig,
    ) -> Result<Self, EncryptionError> {
        if !validate_peer_id(&local_peer) {
            return Err(EncryptionError::InvalidPeerId);
        }

        let vault = Arc::new(IdentityVault::load_or_create(store));
        let manager = Arc::new(SessionManager::new(
            local_peer,
            vault.static_private_bytes(),
            config.rekey_policy,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits));
        let observers = Arc::new(Mutex::new(Observers::default()));
        let rekey_timer = RekeyTimer::spawn(
            config.rekey_check_interval,
            Arc::clone(&manager),
            Arc::clone(&observers),
        );

        Ok(Self {
            vault,
            manager,
            rate_limiter,
            observers,
            rekey_timer,
        })
    }

    /// The device identity vault (announce/packet signing lives there).
    pub fn vault(&self) -> &IdentityVault {
        &self.vault
    }

    /// This device's own fingerprint.
    pub fn fingerprint(&self) -> String {
        self.vault.fingerprint()
    }

    /// Register an `on_peer_authenticated` handler. All registered
    /// handlers fire on every establishment.
    pub fn on_peer_authenticated(&self, handler: impl Fn(&PeerId, &str) + Send + Sync + 'static) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.peer_authenticated.push(Arc::new(handler));
        }
    }

    /// Set the single `on_handshake_required` handler, replacing any
    /// previous one.
    pub fn set_on_handshake_required(&self, handler: impl Fn(&PeerId) + Send + Sync + 'static) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.handshake_required = Some(Arc::new(handler));
        }
    }

    /// Encrypt `plaintext` for `peer`.
    ///
    /// Without an established session this fires `on_handshake_required`
    /// and returns [`EncryptionError::HandshakeRequired`] with no other
    /// side effects.
    pub fn encrypt(&self, plaintext: &[u8], peer: &PeerId) -> Result<Vec<u8>, EncryptionError> {
        if !validate_peer_id(peer) {
            return Err(EncryptionError::InvalidPeerId);
        }
        if !validate_transport_message_size(plaintext) {
            return Err(EncryptionError::MessageTooLarge {
                size: plaintext.len(),
                limit: MAX_TRANSPORT_MESSAGE_SIZE,
            });
        }
        if !self.rate_limiter.allow_message(peer) {
            debug!(%peer, "outbound message rate limited");
            return Err(EncryptionError::RateLimitExceeded);
        }
        if !self.manager.has_established_session(peer) {
            debug!(%peer, "encrypt without established session");
            notify_handshake_required(&self.observers, peer);
            return Err(EncryptionError::HandshakeRequired);
        }
        self.manager.encrypt(peer, plaintext)
    }

    /// Decrypt `ciphertext` from `peer`.
    pub fn decrypt(&self, ciphertext: &[u8], peer: &PeerId) -> Result<Vec<u8>, EncryptionError> {
        if !validate_peer_id(peer) {
            return Err(EncryptionError::InvalidPeerId);
        }
        if !validate_transport_message_size(ciphertext) {
            return Err(EncryptionError::MessageTooLarge {
                size: ciphertext.len(),
                limit: MAX_TRANSPORT_MESSAGE_SIZE,
            });
        }
        if !self.rate_limiter.allow_message(peer) {
            debug!(%peer, "inbound message rate limited");
            return Err(EncryptionError::RateLimitExceeded);
        }
        self.manager.decrypt(peer, ciphertext)
    }

    /// Start an outbound handshake with `peer`, returning msg1.
    pub fn initiate_handshake(&self, peer: &PeerId) -> Result<Vec<u8>, EncryptionError> {
        if !validate_peer_id(peer) {
            return Err(EncryptionError::InvalidPeerId);
        }
        if !self.rate_limiter.allow_handshake(peer) {
            warn!(%peer, "handshake attempt rate limited");
            return Err(EncryptionError::RateLimitExceeded);
        }
        self.manager.initiate_handshake(peer)
    }

    /// Feed an inbound handshake frame from `peer`, returning the reply
    /// to transmit (if any).
    pub fn process_handshake_message(
        &self,
        peer: &PeerId,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, EncryptionError> {
        if !validate_peer_id(peer) {
            return Err(EncryptionError::InvalidPeerId);
        }
        if !validate_handshake_message_size(message) {
            return Err(EncryptionError::MessageTooLarge {
                size: message.len(),
                limit: MAX_HANDSHAKE_MESSAGE_SIZE,
            });
        }
        if !self.rate_limiter.allow_handshake(peer) {
            warn!(%peer, "inbound handshake rate limited");
            return Err(EncryptionError::RateLimitExceeded);
        }

        let outcome = self.manager.handle_incoming_handshake(peer, message)?;
        if let Some(event) = outcome.established {
            let handlers: Vec<PeerAuthenticatedHandler> = match self.observers.lock() {
                Ok(observers) => observers.peer_authenticated.clone(),
                Err(_) => Vec::new(),
            };
            for handler in handlers {
                handler(&event.peer, &event.fingerprint);
            }
        }
        Ok(outcome.reply)
    }

    pub fn has_established_session(&self, peer: &PeerId) -> bool {
        self.manager.has_established_session(peer)
    }

    /// Fingerprint of an established (or previously established) peer.
    pub fn fingerprint_for(&self, peer: &PeerId) -> Option<String> {
        self.manager.fingerprint_for(peer)
    }

    /// Reverse lookup: which peer currently carries this fingerprint.
    pub fn peer_for_fingerprint(&self, fingerprint: &str) -> Option<PeerId> {
        self.manager.peer_for_fingerprint(fingerprint)
    }

    /// The peer's static key as learned in the handshake.
    pub fn remote_static_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.manager.remote_static_key(peer)
    }

    /// Evict the peer's session and fingerprint mapping.
    pub fn remove_peer(&self, peer: &PeerId) {
        info!(%peer, "removing peer session");
        self.manager.remove_session(peer);
    }

    /// Panic path: drop every session, clear the fingerprint maps, and
    /// reset the rate limiter. The identity vault is untouched; wiping
    /// it is a separate, deliberate operation.
    pub fn clear_ephemeral_for_panic(&self) {
        warn!("clearing all ephemeral session state");
        self.manager.remove_all_sessions();
        self.rate_limiter.reset_all();
    }

    /// Identity wipe: stop the rekey check and delete both long-term
    /// keys from the store. Composes with
    /// [`EncryptionService::clear_ephemeral_for_panic`] for a full
    /// emergency wipe.
    pub fn clear_persistent_identity(&self) {
        warn!("wiping persistent identity");
        self.rekey_timer.stop();
        self.vault.wipe();
    }
}

fn notify_handshake_required(observers: &Mutex<Observers>, peer: &PeerId) {
    let handler = match observers.lock() {
        Ok(observers) => observers.handshake_required.clone(),
        Err(_) => None,
    };
    if let Some(handler) = handler {
        handler(peer);
    }
}

struct TimerShared {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread that walks sessions for spent rekey budgets.
///
/// Each due peer gets a fresh armed initiator session via
/// `initiate_rekey`, then `on_handshake_required` fires so the transport
/// schedules the new msg1.
struct RekeyTimer {
    shared: Arc<TimerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RekeyTimer {
    fn spawn(
        interval: Duration,
        manager: Arc<SessionManager>,
        observers: Arc<Mutex<Observers>>,
    ) -> Self {
        let shared = Arc::new(TimerShared {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("mesh-crypto-rekey".to_string())
            .spawn(move || loop {
                {
                    let guard = match thread_shared.stopped.lock() {
                        Ok(g) => g,
                        Err(_) => return,
                    };
                    let (guard, _timeout) = match thread_shared.wake.wait_timeout(guard, interval)
                    {
                        Ok(r) => r,
                        Err(_) => return,
                    };
                    if *guard {
                        return;
                    }
                }

                for peer in manager.sessions_needing_rekey() {
                    match manager.initiate_rekey(&peer) {
                        Ok(()) => {
                            info!(%peer, "rekey due; requesting fresh handshake");
                            notify_handshake_required(&observers, &peer);
                        }
                        Err(e) => warn!(%peer, error = %e, "failed to initiate rekey"),
                    }
                }
            })
            .ok();

        if handle.is_none() {
            warn!("failed to spawn rekey timer thread; rekey checks disabled");
        }
        Self { shared, handle }
    }

    fn stop(&self) {
        if let Ok(mut stopped) = self.shared.stopped.lock() {
            *stopped = true;
        }
        self.shared.wake.notify_all();
    }
}

impl Drop for RekeyTimer {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    fn service(local: &str) -> EncryptionService {
        EncryptionService::new(
            Arc::new(MemoryKeyStore::new()),
            PeerId::new(local),
            ServiceConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_local_peer_id() {
        let result = EncryptionService::new(
            Arc::new(MemoryKeyStore::new()),
            PeerId::new(""),
            ServiceConfig::default(),
        );
        assert!(matches!(result, Err(EncryptionError::InvalidPeerId)));
    }

    #[test]
    fn test_encrypt_validates_before_touching_sessions() {
        let svc = service("aaaa1111");

        assert!(matches!(
            svc.encrypt(b"x", &PeerId::new("not hex")),
            Err(EncryptionError::InvalidPeerId)
        ));
        assert!(matches!(
            svc.encrypt(&vec![0u8; MAX_TRANSPORT_MESSAGE_SIZE + 1], &PeerId::new("bbbb2222")),
            Err(EncryptionError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_handshake_frame_rejected() {
        let svc = service("aaaa1111");
        let oversized = vec![0u8; MAX_HANDSHAKE_MESSAGE_SIZE + 1];
        assert!(matches!(
            svc.process_handshake_message(&PeerId::new("bbbb2222"), &oversized),
            Err(EncryptionError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_encrypt_without_session_signals_handshake_required() {
        let svc = service("aaaa1111");
        let peer = PeerId::new("bbbb2222");

        let signaled = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&signaled);
        svc.set_on_handshake_required(move |p| {
            sink.lock().unwrap().push(p.clone());
        });

        assert!(matches!(
            svc.encrypt(b"hello", &peer),
            Err(EncryptionError::HandshakeRequired)
        ));
        assert_eq!(signaled.lock().unwrap().as_slice(), &[peer]);
    }

    #[test]
    fn test_handshake_rate_limit_enforced() {
        let config = ServiceConfig {
            rate_limits: RateLimitConfig {
                max_handshakes: 2,
                ..RateLimitConfig::default()
            },
            ..ServiceConfig::default()
        };
        let svc = EncryptionService::new(
            Arc::new(MemoryKeyStore::new()),
            PeerId::new("aaaa1111"),
            config,
        )
        .unwrap();
        let peer = PeerId::new("bbbb2222");

        svc.initiate_handshake(&peer).unwrap();
        svc.initiate_handshake(&peer).unwrap();
        assert!(matches!(
            svc.initiate_handshake(&peer),
            Err(EncryptionError::RateLimitExceeded)
        ));
    }
}
