//! Settlement worker (`spec.md` §4.10): a single loop drains
//! `pendingSettlements` on a 5 s period, paying each intent through the
//! external `Pay(invoice)` interface with retry-with-backoff, then
//! durably resolves the ledger entry before dropping the intent from
//! memory.
//!
//! The ordered single-consumer loop is grounded on
//! `freeq-server/src/s2s.rs`'s `broadcast_tx`/`broadcast_rx` task (an
//! `mpsc` channel feeding one `tokio::spawn`ed consumer, chosen there
//! specifically to avoid the reordering that parallel `tokio::spawn`
//! tasks would cause) — here the same shape serializes settlement
//! mutations through a per-ref FIFO queue instead of fanning work out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio::sync::{mpsc, oneshot};

use crate::error::SettlementError;
use crate::model::{Invoice, SettlementIntent};
use crate::persistence::{LedgerEntry, LedgerStatus, Store};
use crate::state::StateRef;

pub const LOOP_PERIOD: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// External collaborator the worker calls to actually move funds. Left
/// abstract per `spec.md`'s explicit Non-goal ("the node only enqueues
/// settlement intents and calls a `Pay(invoice)` interface").
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn pay(&self, invoice: &Invoice) -> Result<String, SettlementError>;
}

enum Command {
    Enqueue(SettlementIntent),
    Shutdown(oneshot::Sender<()>),
}

/// Handle callers use to enqueue settlement intents. Cloning shares the
/// same worker task; all sends funnel through the one `mpsc` queue so
/// durability order is preserved (`spec.md` §4.10: "serialized through a
/// per-ref FIFO queue").
#[derive(Clone)]
pub struct SettlementWorker {
    tx: mpsc::Sender<Command>,
}

impl SettlementWorker {
    /// Spawns the worker loop and returns a handle plus the loop's
    /// `JoinHandle` (callers await it during shutdown).
    pub fn spawn(
        state: StateRef,
        store: Arc<Store>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let handle = tokio::spawn(run(state, store, gateway, rx));
        (Self { tx }, handle)
    }

    pub async fn enqueue(&self, intent: SettlementIntent) -> Result<(), SettlementError> {
        self.tx
            .send(Command::Enqueue(intent))
            .await
            .map_err(|_| SettlementError::Persistence("settlement worker is gone".into()))
    }

    /// Requests a clean stop and waits for the worker to drain its queue
    /// and exit its loop.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run(state: StateRef, store: Arc<Store>, gateway: Arc<dyn PaymentGateway>, mut rx: mpsc::Receiver<Command>) {
    let mut ticker = tokio::time::interval(LOOP_PERIOD);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if state.load().shutting_down {
                    break;
                }
                if let Some(intent) = pop_head(&state).await {
                    process_intent(&state, &store, gateway.as_ref(), intent).await;
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Enqueue(intent)) => {
                        if let Err(err) = enqueue_and_persist(&state, &store, intent).await {
                            tracing::error!(%err, "failed to persist settlement intent");
                        }
                    }
                    Some(Command::Shutdown(done)) => {
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

async fn enqueue_and_persist(state: &StateRef, store: &Store, intent: SettlementIntent) -> Result<(), SettlementError> {
    store.save_intent(&intent).map_err(|e| SettlementError::Persistence(e.to_string()))?;
    state
        .modify_state(move |mut s| {
            s.pending_settlements.push(intent.clone());
            (s, ())
        })
        .await
        .map_err(|e| SettlementError::Persistence(e.to_string()))
}

/// Pops the highest-priority, oldest-first intent out of `pendingSettlements`
/// under a single CAS (`spec.md` §4.10's `(priority desc, createdAt asc)`
/// ordering, via `model::settlement_order_key`).
async fn pop_head(state: &StateRef) -> Option<SettlementIntent> {
    state
        .modify_state(|mut s| {
            if s.pending_settlements.is_empty() {
                return (s, None);
            }
            s.pending_settlements.sort_by_key(crate::model::settlement_order_key);
            let head = s.pending_settlements.remove(0);
            (s, Some(head))
        })
        .await
        .ok()
        .flatten()
}

async fn process_intent(state: &StateRef, store: &Store, gateway: &dyn PaymentGateway, intent: SettlementIntent) {
    let attempts = intent.max_retries.saturating_sub(intent.retry_count).max(1);
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(INITIAL_BACKOFF)
        .with_max_interval(MAX_BACKOFF)
        .with_max_elapsed_time(None)
        .build();

    let mut last_error = String::new();
    let mut tx_hash = None;
    for attempt in 0..attempts {
        match gateway.pay(&intent.invoice).await {
            Ok(hash) => {
                tx_hash = Some(hash);
                break;
            }
            Err(err) => {
                last_error = err.to_string();
                tracing::warn!(intent = %intent.id, attempt, %last_error, "settlement attempt failed");
                if attempt + 1 < attempts {
                    if let Some(delay) = backoff.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    let now = crate::model::now_millis();
    let entry = match tx_hash {
        Some(hash) => LedgerEntry {
            id: intent.ledger_entry_id.clone(),
            intent_id: intent.id.clone(),
            status: LedgerStatus::Settled,
            tx_hash: Some(hash),
            error: None,
            updated_at: now,
        },
        None => LedgerEntry {
            id: intent.ledger_entry_id.clone(),
            intent_id: intent.id.clone(),
            status: LedgerStatus::Cancelled,
            tx_hash: None,
            error: Some(last_error),
            updated_at: now,
        },
    };

    if let Err(err) = store.upsert_ledger_entry(&entry) {
        tracing::error!(%err, intent = %intent.id, "failed to persist ledger entry");
    }
    if let Err(err) = store.remove_intent(&intent.id) {
        tracing::error!(%err, intent = %intent.id, "failed to remove settled intent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SettlementKind;
    use crate::state::NodeState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysSucceeds;
    #[async_trait]
    impl PaymentGateway for AlwaysSucceeds {
        async fn pay(&self, invoice: &Invoice) -> Result<String, SettlementError> {
            Ok(format!("tx-{}", invoice.id))
        }
    }

    struct CountingGateway(AtomicUsize);
    #[async_trait]
    impl PaymentGateway for CountingGateway {
        async fn pay(&self, _invoice: &Invoice) -> Result<String, SettlementError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SettlementError::PaymentFailed("still down".into()))
        }
    }

    fn sample_intent(id: &str, priority: i32, created_at: i64) -> SettlementIntent {
        SettlementIntent {
            id: id.into(),
            kind: SettlementKind::Standard,
            invoice: Invoice { id: format!("inv-{id}"), amount: "5".into(), currency: "USD".into(), memo: None },
            ledger_entry_id: format!("ledger-{id}"),
            priority,
            created_at,
            retry_count: 0,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn successful_payment_settles_and_removes_intent() {
        let store = Arc::new(Store::open_memory().unwrap());
        let state = StateRef::new(NodeState::default());
        process_intent(&state, &store, &AlwaysSucceeds, sample_intent("a", 0, 1)).await;
        let entry = store.get_ledger_entry("ledger-a").unwrap().unwrap();
        assert!(matches!(entry.status, LedgerStatus::Settled));
        assert!(entry.tx_hash.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_cancel_the_ledger_entry() {
        let store = Arc::new(Store::open_memory().unwrap());
        let state = StateRef::new(NodeState::default());
        let gateway = Arc::new(CountingGateway(AtomicUsize::new(0)));
        let intent = sample_intent("b", 0, 1);
        process_intent(&state, &store, gateway.as_ref(), intent).await;
        let entry = store.get_ledger_entry("ledger-b").unwrap().unwrap();
        assert!(matches!(entry.status, LedgerStatus::Cancelled));
        assert!(entry.error.is_some());
        assert_eq!(gateway.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pop_head_orders_by_priority_then_age() {
        let state = StateRef::new(NodeState::default());
        state
            .modify_state(|mut s| {
                s.pending_settlements.push(sample_intent("low", 0, 100));
                s.pending_settlements.push(sample_intent("high", 5, 200));
                s.pending_settlements.push(sample_intent("older-low", 0, 50));
                (s, ())
            })
            .await
            .unwrap();

        assert_eq!(pop_head(&state).await.unwrap().id, "high");
        assert_eq!(pop_head(&state).await.unwrap().id, "older-low");
        assert_eq!(pop_head(&state).await.unwrap().id, "low");
        assert!(pop_head(&state).await.is_none());
    }

    #[tokio::test]
    async fn enqueue_persists_and_appends_to_state() {
        let store = Arc::new(Store::open_memory().unwrap());
        let state = StateRef::new(NodeState::default());
        enqueue_and_persist(&state, &store, sample_intent("c", 0, 1)).await.unwrap();
        assert_eq!(state.load().pending_settlements.len(), 1);
        assert_eq!(store.load_pending_intents().unwrap().len(), 1);
    }
}
