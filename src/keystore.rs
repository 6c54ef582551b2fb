//! Pluggable secure key store.
//!
//! The core never talks to a platform keychain directly; it goes through
//! the [`KeyStore`] trait so the host application can plug in whatever
//! secure backing store the platform offers. [`MemoryKeyStore`] covers
//! tests and fully ephemeral operation.

use std::collections::HashMap;
use std::sync::Mutex;

/// Store tag for the Curve25519 static key-agreement private key.
pub const STATIC_KEY_TAG: &str = "noiseStaticKey";

/// Store tag for the Ed25519 signing private key.
pub const SIGNING_KEY_TAG: &str = "ed25519SigningKey";

/// Backing store for long-term private keys.
///
/// Implementations must be safe to call from multiple threads. A `get`
/// miss returns `None`; `put` and `delete` report success as `bool`
/// because persistence failures are non-fatal to the core.
pub trait KeyStore: Send + Sync {
    fn get(&self, tag: &str) -> Option<Vec<u8>>;
    fn put(&self, tag: &str, value: &[u8]) -> bool;
    fn delete(&self, tag: &str) -> bool;
}

/// In-memory key store.
///
/// Keys live only for the lifetime of the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, tag: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().ok()?;
        entries.get(tag).cloned()
    }

    fn put(&self, tag: &str, value: &[u8]) -> bool {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(tag.to_string(), value.to_vec());
                true
            }
            Err(_) => false,
        }
    }

    fn delete(&self, tag: &str) -> bool {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.remove(tag);
                true
            }
            Err(_) => false,
        }
    }
}
