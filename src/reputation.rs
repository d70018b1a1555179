//! Reputation tracker (`spec.md` §4.12): per-peer local success/failure
//! counters, lazy wallet-binding cache, and a batched commit of scores to
//! durable storage.
//!
//! Persisted the same way settlement ledger rows are — through
//! `persistence::Store`, grounded on `freeq-server/src/db.rs`'s persisted-row
//! idiom — while the richer per-peer counters that have no wire/storage
//! counterpart in `spec.md` (`successfulJobs`, `pendingRatings`, …) live only
//! in the in-process map, the same split `NodeState` already draws between
//! `reputation` (the persisted score) and handler/callback bookkeeping that
//! stays local to a subsystem.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::ReputationError;
use crate::model::now_millis;
use crate::persistence::Store;
use crate::state::StateRef;

pub const COMMIT_THRESHOLD: usize = 10;
pub const COMMIT_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

const TIER_ELITE: f64 = 90.0;
const TIER_GOOD: f64 = 70.0;
const TIER_ACCEPTABLE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Elite,
    Good,
    Acceptable,
    Unranked,
}

impl Tier {
    /// Thresholds from `spec.md` §4.12: `{elite:90, good:70, acceptable:50}`.
    pub fn classify(score: f64) -> Self {
        if score >= TIER_ELITE {
            Tier::Elite
        } else if score >= TIER_GOOD {
            Tier::Good
        } else if score >= TIER_ACCEPTABLE {
            Tier::Acceptable
        } else {
            Tier::Unranked
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRating {
    success: bool,
    recorded_at: i64,
}

#[derive(Debug, Clone)]
struct PeerReputation {
    local_score: f64,
    successful_jobs: u64,
    failed_jobs: u64,
    total_jobs: u64,
    last_interaction_at: i64,
    pending_ratings: Vec<PendingRating>,
    last_commit_at: i64,
}

impl PeerReputation {
    fn new(now: i64) -> Self {
        Self {
            local_score: TIER_ACCEPTABLE,
            successful_jobs: 0,
            failed_jobs: 0,
            total_jobs: 0,
            last_interaction_at: now,
            pending_ratings: Vec::new(),
            last_commit_at: now,
        }
    }

    fn record(&mut self, success: bool, now: i64) {
        self.total_jobs += 1;
        if success {
            self.successful_jobs += 1;
        } else {
            self.failed_jobs += 1;
        }
        self.last_interaction_at = now;
        self.local_score = (self.successful_jobs as f64 / self.total_jobs as f64) * 100.0;
        self.pending_ratings.push(PendingRating { success, recorded_at: now });
    }

    fn due_for_commit(&self, now: i64) -> bool {
        self.pending_ratings.len() >= COMMIT_THRESHOLD || now - self.last_commit_at >= COMMIT_INTERVAL_MS
    }
}

/// Tracks local reputation for every peer this node has directly
/// interacted with. `peer_id_to_wallet` is a lazily-populated cache of
/// on-chain identity bindings, resolved and inserted by callers as they
/// learn them (`spec.md` §4.12) — the tracker itself never resolves one.
pub struct ReputationTracker {
    state: StateRef,
    peers: Mutex<HashMap<String, PeerReputation>>,
    peer_id_to_wallet: Mutex<HashMap<String, String>>,
}

impl ReputationTracker {
    pub fn new(state: StateRef) -> Self {
        Self { state, peers: Mutex::new(HashMap::new()), peer_id_to_wallet: Mutex::new(HashMap::new()) }
    }

    /// Rehydrates persisted local scores into `NodeState.reputation` and
    /// seeds per-peer counters so `local_score_of` is consistent for peers
    /// tracked in a prior run, without fabricating job counts it can't know.
    pub async fn load_from(&self, store: &Store) -> Result<(), ReputationError> {
        let rows = store.load_all_reputation().map_err(|e| ReputationError::Persistence(e.to_string()))?;
        let now = now_millis();
        {
            let mut peers = self.peers.lock().unwrap();
            for (peer_id, score) in &rows {
                let entry = peers.entry(peer_id.clone()).or_insert_with(|| PeerReputation::new(now));
                entry.local_score = *score;
            }
        }
        self.state
            .modify_state(move |mut s| {
                for (peer_id, score) in &rows {
                    s.reputation.insert(peer_id.clone(), *score);
                }
                (s, ())
            })
            .await
            .map_err(|e| ReputationError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub async fn record_local_success(&self, peer_id: &str, store: &Store) -> Result<(), ReputationError> {
        self.record(peer_id, true, store).await
    }

    pub async fn record_local_failure(&self, peer_id: &str, store: &Store) -> Result<(), ReputationError> {
        self.record(peer_id, false, store).await
    }

    async fn record(&self, peer_id: &str, success: bool, store: &Store) -> Result<(), ReputationError> {
        let now = now_millis();
        let (score, should_commit) = {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers.entry(peer_id.to_string()).or_insert_with(|| PeerReputation::new(now));
            entry.record(success, now);
            (entry.local_score, entry.due_for_commit(now))
        };

        let peer_id_owned = peer_id.to_string();
        self.state
            .modify_state(move |mut s| {
                s.reputation.insert(peer_id_owned.clone(), score);
                (s, ())
            })
            .await
            .map_err(|e| ReputationError::Persistence(e.to_string()))?;

        if should_commit {
            self.commit_one(peer_id, store, now)?;
        }
        Ok(())
    }

    /// Flush one peer's score to durable storage and clear its pending
    /// ratings (`spec.md` §4.12: "flushes pending ratings once their count
    /// reaches `commitThreshold` or `commitInterval` elapses").
    fn commit_one(&self, peer_id: &str, store: &Store, now: i64) -> Result<(), ReputationError> {
        let score = {
            let mut peers = self.peers.lock().unwrap();
            let Some(entry) = peers.get_mut(peer_id) else { return Ok(()) };
            entry.pending_ratings.clear();
            entry.last_commit_at = now;
            entry.local_score
        };
        store
            .upsert_reputation(peer_id, score, now)
            .map_err(|e| ReputationError::Persistence(e.to_string()))
    }

    /// Sweeps every tracked peer and force-flushes any whose
    /// `commitInterval` has elapsed, regardless of pending-rating count.
    /// Intended to be driven by a periodic tick alongside the settlement
    /// worker's loop.
    pub fn flush_due(&self, store: &Store) -> Result<(), ReputationError> {
        let now = now_millis();
        let due: Vec<String> = {
            let peers = self.peers.lock().unwrap();
            peers.iter().filter(|(_, r)| r.due_for_commit(now)).map(|(id, _)| id.clone()).collect()
        };
        for peer_id in due {
            self.commit_one(&peer_id, store, now)?;
        }
        Ok(())
    }

    pub fn local_score_of(&self, peer_id: &str) -> Option<f64> {
        self.peers.lock().unwrap().get(peer_id).map(|r| r.local_score)
    }

    pub fn tier_of(&self, peer_id: &str) -> Option<Tier> {
        self.local_score_of(peer_id).map(Tier::classify)
    }

    pub fn bind_wallet(&self, peer_id: &str, wallet: impl Into<String>) {
        self.peer_id_to_wallet.lock().unwrap().insert(peer_id.to_string(), wallet.into());
    }

    pub fn wallet_of(&self, peer_id: &str) -> Option<String> {
        self.peer_id_to_wallet.lock().unwrap().get(peer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeState;

    #[test]
    fn tier_classification_matches_spec_thresholds() {
        assert_eq!(Tier::classify(95.0), Tier::Elite);
        assert_eq!(Tier::classify(90.0), Tier::Elite);
        assert_eq!(Tier::classify(80.0), Tier::Good);
        assert_eq!(Tier::classify(55.0), Tier::Acceptable);
        assert_eq!(Tier::classify(10.0), Tier::Unranked);
    }

    #[tokio::test]
    async fn success_and_failure_update_local_score() {
        let tracker = ReputationTracker::new(StateRef::new(NodeState::default()));
        let store = Store::open_memory().unwrap();
        tracker.record_local_success("ecco:a", &store).await.unwrap();
        tracker.record_local_success("ecco:a", &store).await.unwrap();
        tracker.record_local_failure("ecco:a", &store).await.unwrap();
        assert!((tracker.local_score_of("ecco:a").unwrap() - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn commit_threshold_flushes_to_store() {
        let tracker = ReputationTracker::new(StateRef::new(NodeState::default()));
        let store = Store::open_memory().unwrap();
        for _ in 0..COMMIT_THRESHOLD {
            tracker.record_local_success("ecco:b", &store).await.unwrap();
        }
        assert_eq!(store.get_reputation("ecco:b").unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn wallet_binding_cache_round_trips() {
        let tracker = ReputationTracker::new(StateRef::new(NodeState::default()));
        assert!(tracker.wallet_of("ecco:a").is_none());
        tracker.bind_wallet("ecco:a", "0xabc");
        assert_eq!(tracker.wallet_of("ecco:a").as_deref(), Some("0xabc"));
    }
}
