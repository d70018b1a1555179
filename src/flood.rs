//! Flood protection (`spec.md` §4.9): message-id deduplication plus
//! per-peer token-bucket rate limiting, applied to every inbound message
//! after signature verification but before handler dispatch.
//!
//! The rotating-dual-filter dedup shape is re-grounded from
//! `freeq-server/src/s2s.rs::DedupSet` (there a ring-buffer + high-water
//! mark; here a bloom filter pair, since `spec.md` names a bloom filter
//! explicitly) onto the `bloom` crate referenced by the
//! `ChainSafe-Delorean-Protocol` manifest. The rate limiter's keyed
//! token-bucket role matches the per-peer gossip throttling described in
//! `examples/other_examples/manifests/MystenLabs-sui`.

use std::num::NonZeroU32;
use std::sync::Mutex;

use bloom::{ASMS, BloomFilter};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::config::FloodProtectionConfig;

/// A message is considered for rotation once the active filter holds this
/// fraction of its configured capacity.
const ROTATE_AT_FRACTION: f64 = 0.9;

/// Two-generation rotating bloom filter: `markSeen`/`isDuplicate` read
/// through both the active and the previous filter so a rotation never
/// loses recent entries (`spec.md` §4.9).
pub struct Deduplicator {
    capacity: u32,
    false_positive_rate: f32,
    inner: Mutex<DedupInner>,
}

struct DedupInner {
    active: BloomFilter,
    previous: Option<BloomFilter>,
    active_count: u32,
}

impl Deduplicator {
    pub fn new(capacity: u32, false_positive_rate: f32) -> Self {
        Self {
            capacity,
            false_positive_rate,
            inner: Mutex::new(DedupInner {
                active: BloomFilter::with_rate(false_positive_rate, capacity),
                previous: None,
                active_count: 0,
            }),
        }
    }

    pub fn from_config(config: &FloodProtectionConfig) -> Self {
        Self::new(config.dedup_max_messages as u32, config.dedup_false_positive_rate)
    }

    /// `isDuplicate(id)`: true if `id` was seen in the active or previous
    /// generation filter.
    pub fn is_duplicate(&self, id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.active.contains(&id) {
            return true;
        }
        inner.previous.as_ref().is_some_and(|p| p.contains(&id))
    }

    /// `markSeen(id)`: insert into the active filter, rotating first if
    /// `shouldRotate()` would return true.
    pub fn mark_seen(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if Self::should_rotate_locked(&inner, self.capacity) {
            Self::rotate_locked(&mut inner, self.capacity, self.false_positive_rate);
        }
        inner.active.insert(&id);
        inner.active_count += 1;
    }

    /// `checkAndMark`: the combined dedup operation the bridge actually
    /// calls — returns `true` if the message is new (and marks it seen),
    /// `false` if it's a duplicate (and nothing is mutated).
    pub fn check_and_mark(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.contains(&id) || inner.previous.as_ref().is_some_and(|p| p.contains(&id)) {
            return false;
        }
        if Self::should_rotate_locked(&inner, self.capacity) {
            Self::rotate_locked(&mut inner, self.capacity, self.false_positive_rate);
        }
        inner.active.insert(&id);
        inner.active_count += 1;
        true
    }

    pub fn should_rotate(&self) -> bool {
        Self::should_rotate_locked(&self.inner.lock().unwrap(), self.capacity)
    }

    fn should_rotate_locked(inner: &DedupInner, capacity: u32) -> bool {
        (inner.active_count as f64) >= (capacity as f64) * ROTATE_AT_FRACTION
    }

    /// `rotate()`: the active filter becomes `previous` (still queried for
    /// a transition window), and a fresh filter takes over as active.
    pub fn rotate(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::rotate_locked(&mut inner, self.capacity, self.false_positive_rate);
    }

    fn rotate_locked(inner: &mut DedupInner, capacity: u32, false_positive_rate: f32) {
        let fresh = BloomFilter::with_rate(false_positive_rate, capacity);
        let retiring = std::mem::replace(&mut inner.active, fresh);
        inner.previous = Some(retiring);
        inner.active_count = 0;
    }
}

/// Per-peer token-bucket rate limiter (`spec.md` §4.9). `governor`'s keyed
/// limiter already implements the refill-by-elapsed-time bucket the spec
/// describes; this wraps it with the spec's default parameters and
/// `checkAndConsume` naming.
pub struct RateLimiterSet {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
}

impl RateLimiterSet {
    pub fn new(max_tokens: u32, refill_rate: u32, refill_interval_ms: u64) -> Self {
        let per_interval = NonZeroU32::new(refill_rate.max(1)).unwrap();
        let burst = NonZeroU32::new(max_tokens.max(1)).unwrap();
        let interval = std::time::Duration::from_millis(refill_interval_ms.max(1));
        let quota = Quota::with_period(interval / per_interval.get()).unwrap().allow_burst(burst);
        Self { limiter: RateLimiter::keyed(quota) }
    }

    pub fn from_config(config: &FloodProtectionConfig) -> Self {
        Self::new(config.rate_limit_max_tokens, config.rate_limit_refill_rate, config.rate_limit_refill_interval_ms)
    }

    /// `checkAndConsume(peerId)`: true if a token was available and
    /// consumed, false if the peer is over its rate.
    pub fn check_and_consume(&self, peer_id: &str) -> bool {
        self.limiter.check_key(&peer_id.to_string()).is_ok()
    }
}

impl Default for RateLimiterSet {
    fn default() -> Self {
        Self::new(100, 10, 1_000)
    }
}

/// Flood protection facade combining the deduplicator and rate limiter,
/// applied together on the inbound path (`spec.md` §4.9: "applied on every
/// inbound pubsub and transport message after signature verification but
/// before handler dispatch").
pub struct FloodProtection {
    pub dedup: Deduplicator,
    pub rate_limiter: RateLimiterSet,
}

impl FloodProtection {
    pub fn new(config: &FloodProtectionConfig) -> Self {
        Self { dedup: Deduplicator::from_config(config), rate_limiter: RateLimiterSet::from_config(config) }
    }

    /// Returns `true` iff the message should proceed to dispatch: it is
    /// not a duplicate AND the sending peer still has rate budget.
    pub fn admit(&self, peer_id: &str, message_id: &str) -> bool {
        if !self.rate_limiter.check_and_consume(peer_id) {
            tracing::warn!(peer = peer_id, "rate limit exceeded");
            return false;
        }
        if !self.dedup.check_and_mark(message_id) {
            tracing::debug!(peer = peer_id, message_id, "duplicate message dropped");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_rejected_on_second_occurrence() {
        let dedup = Deduplicator::new(1_000, 0.01);
        assert!(dedup.check_and_mark("msg-1"));
        assert!(!dedup.check_and_mark("msg-1"));
        assert!(dedup.check_and_mark("msg-2"));
    }

    #[test]
    fn rotation_keeps_previous_generation_queryable() {
        let dedup = Deduplicator::new(10, 0.01);
        dedup.mark_seen("early");
        dedup.rotate();
        assert!(dedup.is_duplicate("early"));
        dedup.mark_seen("late");
        assert!(dedup.is_duplicate("late"));
    }

    #[test]
    fn rate_limiter_enforces_default_burst_of_100() {
        let limiter = RateLimiterSet::default();
        let mut allowed = 0;
        for _ in 0..200 {
            if limiter.check_and_consume("peer-x") {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 100);
    }
}
