//! Per-peer admission control.
//!
//! Two independent fixed-window buckets per peer: one for handshake
//! attempts (Noise handshakes cost Curve25519 operations and a flood is
//! a DoS vector) and one for transport messages. Each bucket admits
//! exactly its configured burst per window and rejects the next request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Limits for both admission buckets.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub max_handshakes: u32,
    pub handshake_window: Duration,
    pub max_messages: u32,
    pub message_window: Duration,
    /// Cap on tracked peers per bucket; stale entries are swept when
    /// the table overflows.
    pub max_peers: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_handshakes: 10,
            handshake_window: Duration::from_secs(60),
            max_messages: 1200,
            message_window: Duration::from_secs(60),
            max_peers: 10_000,
        }
    }
}

#[derive(Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

struct FixedWindow {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    entries: HashMap<PeerId, WindowEntry>,
}

impl FixedWindow {
    fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys,
            entries: HashMap::new(),
        }
    }

    fn allow(&mut self, peer: &PeerId) -> bool {
        let now = Instant::now();

        if self.entries.len() > self.max_keys {
            let window = self.window;
            self.entries
                .retain(|_, entry| now.duration_since(entry.window_start) < window);
            if self.entries.len() > self.max_keys {
                return false;
            }
        }

        let entry = self.entries.entry(peer.clone()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_requests
    }

    fn reset(&mut self) {
        self.entries.clear();
    }
}

/// Token-bucket style limiter with separate handshake and message buckets.
pub struct RateLimiter {
    handshakes: Mutex<FixedWindow>,
    messages: Mutex<FixedWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            handshakes: Mutex::new(FixedWindow::new(
                config.max_handshakes,
                config.handshake_window,
                config.max_peers,
            )),
            messages: Mutex::new(FixedWindow::new(
                config.max_messages,
                config.message_window,
                config.max_peers,
            )),
        }
    }

    pub fn allow_handshake(&self, peer: &PeerId) -> bool {
        match self.handshakes.lock() {
            Ok(mut bucket) => bucket.allow(peer),
            Err(_) => false,
        }
    }

    pub fn allow_message(&self, peer: &PeerId) -> bool {
        match self.messages.lock() {
            Ok(mut bucket) => bucket.allow(peer),
            Err(_) => false,
        }
    }

    /// Clear every bucket. Used by the panic path.
    pub fn reset_all(&self) {
        if let Ok(mut bucket) = self.handshakes.lock() {
            bucket.reset();
        }
        if let Ok(mut bucket) = self.messages.lock() {
            bucket.reset();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
