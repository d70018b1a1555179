//! The single CAS-updated state snapshot every subsystem mutates through
//! (`spec.md` §4.2). Represented as `Arc<ArcSwap<NodeState>>`: readers take
//! a fast lock-free `load()`, writers `compare_and_swap` a freshly cloned
//! and mutated snapshot, spin-backing-off on collision.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;

use crate::error::StateError;
use crate::model::{Message, PeerInfo, SettlementIntent};

/// A handshake initiated but not yet resolved (`spec.md` §4.4).
#[derive(Clone)]
pub struct PendingHandshake {
    pub initiated_at: i64,
    pub timer: tokio::task::AbortHandle,
}

/// Bookkeeping for a peer seen during hybrid discovery (`spec.md` §4.5).
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub peer: PeerInfo,
    pub phase: crate::discovery::Phase,
    pub transport: crate::transport::TransportKind,
}

type CleanupHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The node's single in-memory value. `Clone` is cheap enough for the CAS
/// pattern (a handful of maps, no deep trees) but not free — callers should
/// avoid gratuitous `modify_state` calls in hot loops.
#[derive(Clone)]
pub struct NodeState {
    pub version: u64,
    pub peers: HashMap<String, PeerInfo>,
    pub validated_peers: HashSet<String>,
    pub pending_handshakes: HashMap<String, PendingHandshake>,
    pub queued_messages: HashMap<String, VecDeque<Message>>,
    pub discovered_peers: HashMap<String, DiscoveredPeer>,
    pub pending_settlements: Vec<SettlementIntent>,
    pub reputation: HashMap<String, f64>,
    pub cleanup_handlers: Vec<CleanupHandler>,
    pub shutting_down: bool,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            version: 0,
            peers: HashMap::new(),
            validated_peers: HashSet::new(),
            pending_handshakes: HashMap::new(),
            queued_messages: HashMap::new(),
            discovered_peers: HashMap::new(),
            pending_settlements: Vec::new(),
            reputation: HashMap::new(),
            cleanup_handlers: Vec::new(),
            shutting_down: false,
        }
    }
}

const MAX_CAS_ATTEMPTS: u32 = 100;
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Shared handle to the node's state, cheap to clone (an `Arc` around the
/// swap cell) and safe to hand to every subsystem (`Bridge`, `Discovery`,
/// …) without the back-reference cycle a shared owning struct would need.
#[derive(Clone)]
pub struct StateRef(pub Arc<ArcSwap<NodeState>>);

impl StateRef {
    pub fn new(initial: NodeState) -> Self {
        Self(Arc::new(ArcSwap::new(Arc::new(initial))))
    }

    pub fn load(&self) -> Arc<NodeState> {
        self.0.load_full()
    }

    /// Compare-and-swap updater: `updater` receives a clone of the current
    /// state and returns the new state plus an arbitrary result. Retries
    /// with doubling backoff (1ms→10ms, capped) up to 100 attempts.
    pub async fn modify_state<F, R>(&self, mut updater: F) -> Result<R, StateError>
    where
        F: FnMut(NodeState) -> (NodeState, R),
    {
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self.0.load_full();
            let candidate = (*current).clone();
            let (mut mutated, result) = updater(candidate);
            mutated.version = current.version + 1;
            let next_arc = Arc::new(mutated);
            let prev = self.0.compare_and_swap(&current, next_arc);
            if Arc::ptr_eq(&prev, &current) {
                return Ok(result);
            }
            if attempt + 1 == MAX_CAS_ATTEMPTS {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        Err(StateError::CasExhausted(MAX_CAS_ATTEMPTS))
    }

    /// Append a cleanup handler under the same CAS path used for everything
    /// else (`spec.md` §4.2).
    pub async fn register_cleanup<F>(&self, handler: F) -> Result<(), StateError>
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let handler: CleanupHandler = Arc::new(handler);
        self.modify_state(move |mut state| {
            state.cleanup_handlers.push(handler.clone());
            (state, ())
        })
        .await
        .map(|_| ())
    }

    /// Run cleanup handlers in registration order; a handler's own errors
    /// (it can't actually fail, since it returns `()` — logging happens
    /// inside the handler) never abort the remaining handlers.
    pub async fn run_cleanup_handlers(&self) {
        let state = self.load();
        for handler in &state.cleanup_handlers {
            handler().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_commits_and_bumps_version() {
        let state_ref = StateRef::new(NodeState::default());
        state_ref
            .modify_state(|mut s| {
                s.peers.insert("ecco:a".into(), PeerInfo::new("ecco:a"));
                (s, ())
            })
            .await
            .unwrap();
        let loaded = state_ref.load();
        assert_eq!(loaded.version, 1);
        assert!(loaded.peers.contains_key("ecco:a"));
    }

    #[tokio::test]
    async fn concurrent_updates_all_land() {
        let state_ref = StateRef::new(NodeState::default());
        let mut handles = Vec::new();
        for i in 0..20 {
            let state_ref = state_ref.clone();
            handles.push(tokio::spawn(async move {
                state_ref
                    .modify_state(move |mut s| {
                        s.peers.insert(format!("ecco:{i}"), PeerInfo::new(format!("ecco:{i}")));
                        (s, ())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let loaded = state_ref.load();
        assert_eq!(loaded.peers.len(), 20);
        assert_eq!(loaded.version, 20);
    }
}
