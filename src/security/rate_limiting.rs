//! Rate limiting for handshake and message admission
//!
//! Noise handshakes are cryptographically expensive and a flood of them is a
//! DoS vector. Each peer gets two independent token buckets: one for
//! handshake attempts, one for transport messages, so abuse is contained to
//! the offending peer without punishing the rest of the mesh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::protocol::PeerId;

/// Rate limiting configuration, per peer
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Handshake attempts refilled per minute
    pub handshakes_per_minute: u32,
    /// Handshake burst capacity
    pub handshake_burst: u32,
    /// Transport messages refilled per minute
    pub messages_per_minute: u32,
    /// Message burst capacity
    pub message_burst: u32,
    /// Idle time after which a peer's buckets are dropped
    pub bucket_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            handshakes_per_minute: 12, // one every ~5 seconds
            handshake_burst: 3,
            messages_per_minute: 600, // 10 per second sustained
            message_burst: 100,
            bucket_ttl: Duration::from_secs(3600),
        }
    }
}

/// Token bucket with continuous refill
#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    tokens: f64,
    /// Tokens replenished per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, per_minute: u32) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn check_and_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
            self.last_refill = now;
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_refill.elapsed() > ttl
    }
}

#[derive(Debug)]
struct PeerBuckets {
    handshake: TokenBucket,
    message: TokenBucket,
}

/// Per-peer admission control for handshakes and messages
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<PeerId, PeerBuckets>>,
    violation_count: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
            violation_count: AtomicU64::new(0),
        }
    }

    /// Check and consume one handshake token for `peer`
    pub fn allow_handshake(&self, peer: &PeerId) -> bool {
        self.check(peer, |b| &mut b.handshake)
    }

    /// Check and consume one message token for `peer`
    pub fn allow_message(&self, peer: &PeerId) -> bool {
        self.check(peer, |b| &mut b.message)
    }

    fn check(&self, peer: &PeerId, select: impl Fn(&mut PeerBuckets) -> &mut TokenBucket) -> bool {
        let allowed = {
            let mut buckets = self.buckets.write();
            let entry = buckets.entry(peer.clone()).or_insert_with(|| PeerBuckets {
                handshake: TokenBucket::new(
                    self.config.handshake_burst,
                    self.config.handshakes_per_minute,
                ),
                message: TokenBucket::new(
                    self.config.message_burst,
                    self.config.messages_per_minute,
                ),
            });
            select(entry).check_and_consume()
        };

        if !allowed {
            self.violation_count.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Drop every bucket, re-admitting all peers at full burst
    pub fn reset_all(&self) {
        self.buckets.write().clear();
    }

    /// Drop the buckets of a single peer
    pub fn remove_peer(&self, peer: &PeerId) {
        self.buckets.write().remove(peer);
    }

    /// Total number of rejected admissions since creation
    pub fn violation_count(&self) -> u64 {
        self.violation_count.load(Ordering::Relaxed)
    }

    /// Evict buckets idle longer than the configured TTL
    pub fn cleanup_expired(&self) {
        let ttl = self.config.bucket_ttl;
        self.buckets
            .write()
            .retain(|_, b| !b.handshake.is_expired(ttl) || !b.message.is_expired(ttl));
    }

    /// Number of peers currently tracked
    pub fn tracked_peers(&self) -> usize {
        self.buckets.read().len()
    }
}
