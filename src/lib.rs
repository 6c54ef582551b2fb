//! End-to-end encryption core for a BLE mesh chat.
//!
//! This crate owns device identity, per-peer Noise XX sessions, and the
//! canonical signing formats the mesh depends on:
//! - Persistent Curve25519 + Ed25519 identity with fingerprints
//! - Noise XX handshakes (`Noise_XX_25519_ChaChaPoly_SHA256`) with
//!   deterministic resolution of simultaneous handshakes
//! - Per-peer session lifecycle with periodic rekey under
//!   forward-secrecy budgets
//! - Announce and routed-packet signing over exact canonical layouts
//! - A façade that gates everything through validation and per-peer
//!   rate limits
//!
//! The transport, UI, and persistence layers sit outside: the transport
//! delivers raw frames per peer ID, a pluggable [`keystore::KeyStore`]
//! backs the identity, and callers observe establishment through
//! callbacks.

#![forbid(unsafe_code)]

pub mod announce;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod manager;
pub mod noise;
pub mod packet;
pub mod ratelimit;
pub mod service;
pub mod session;
pub mod validation;

pub use announce::{Announce, ANNOUNCE_CONTEXT};
pub use error::EncryptionError;
pub use identity::{fingerprint_of, verify_signature, IdentityVault, PeerId};
pub use keystore::{KeyStore, MemoryKeyStore, SIGNING_KEY_TAG, STATIC_KEY_TAG};
pub use manager::{HandshakeOutcome, SessionEstablished, SessionManager};
pub use noise::HandshakeRole;
pub use packet::{sign_packet, verify_packet, RoutedPacket};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use service::{EncryptionService, ServiceConfig};
pub use session::{NoiseSession, RekeyPolicy, SessionPhase};
