//! SQLite-backed persisted state: payment ledger entries, pending
//! settlement intents, and reputation scores (`spec.md` §6 "Persisted
//! state layout"). WAL mode, `Connection::open`/`init` idiom lifted from
//! `freeq-server/src/db.rs::Db`.

use std::path::Path;

use rusqlite::{params, Connection, Result as SqlResult};
use serde::{Deserialize, Serialize};

use crate::model::{Invoice, SettlementIntent, SettlementKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Settled,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: String,
    pub intent_id: String,
    pub status: LedgerStatus,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub updated_at: i64,
}

/// Persistence handle. A thin wrapper over `rusqlite::Connection`; callers
/// serialize access themselves (the settlement worker does this through
/// its per-ref FIFO queue, see `settlement.rs`).
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settlement_intents (
                id              TEXT PRIMARY KEY,
                kind            TEXT NOT NULL,
                invoice_json    TEXT NOT NULL,
                ledger_entry_id TEXT NOT NULL,
                priority        INTEGER NOT NULL,
                created_at      INTEGER NOT NULL,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                max_retries     INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id         TEXT PRIMARY KEY,
                intent_id  TEXT NOT NULL,
                status     TEXT NOT NULL,
                tx_hash    TEXT,
                error      TEXT,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reputation_scores (
                peer_id    TEXT PRIMARY KEY,
                score      REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )
    }

    // ── Settlement intents ──────────────────────────────────────────

    pub fn save_intent(&self, intent: &SettlementIntent) -> SqlResult<()> {
        let invoice_json = serde_json::to_string(&intent.invoice).unwrap_or_default();
        let kind = kind_to_str(intent.kind);
        self.conn.execute(
            "INSERT INTO settlement_intents
                (id, kind, invoice_json, ledger_entry_id, priority, created_at, retry_count, max_retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                retry_count = excluded.retry_count",
            params![
                intent.id,
                kind,
                invoice_json,
                intent.ledger_entry_id,
                intent.priority,
                intent.created_at,
                intent.retry_count,
                intent.max_retries,
            ],
        )?;
        Ok(())
    }

    pub fn remove_intent(&self, id: &str) -> SqlResult<()> {
        self.conn
            .execute("DELETE FROM settlement_intents WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn load_pending_intents(&self) -> SqlResult<Vec<SettlementIntent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, invoice_json, ledger_entry_id, priority, created_at, retry_count, max_retries
             FROM settlement_intents",
        )?;
        let rows = stmt.query_map([], |row| {
            let kind_str: String = row.get(1)?;
            let invoice_json: String = row.get(2)?;
            let invoice: Invoice = serde_json::from_str(&invoice_json).unwrap_or(Invoice {
                id: String::new(),
                amount: String::new(),
                currency: String::new(),
                memo: None,
            });
            Ok(SettlementIntent {
                id: row.get(0)?,
                kind: str_to_kind(&kind_str),
                invoice,
                ledger_entry_id: row.get(3)?,
                priority: row.get(4)?,
                created_at: row.get(5)?,
                retry_count: row.get::<_, i64>(6)? as u32,
                max_retries: row.get::<_, i64>(7)? as u32,
            })
        })?;
        rows.collect()
    }

    // ── Ledger ───────────────────────────────────────────────────────

    pub fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> SqlResult<()> {
        let status = match entry.status {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Settled => "settled",
            LedgerStatus::Cancelled => "cancelled",
        };
        self.conn.execute(
            "INSERT INTO ledger_entries (id, intent_id, status, tx_hash, error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status=excluded.status, tx_hash=excluded.tx_hash,
                error=excluded.error, updated_at=excluded.updated_at",
            params![entry.id, entry.intent_id, status, entry.tx_hash, entry.error, entry.updated_at],
        )?;
        Ok(())
    }

    pub fn get_ledger_entry(&self, id: &str) -> SqlResult<Option<LedgerEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, intent_id, status, tx_hash, error, updated_at FROM ledger_entries WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], map_ledger_row)?;
        rows.next().transpose()
    }

    // ── Reputation ───────────────────────────────────────────────────

    pub fn upsert_reputation(&self, peer_id: &str, score: f64, updated_at: i64) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO reputation_scores (peer_id, score, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(peer_id) DO UPDATE SET score=excluded.score, updated_at=excluded.updated_at",
            params![peer_id, score, updated_at],
        )?;
        Ok(())
    }

    pub fn get_reputation(&self, peer_id: &str) -> SqlResult<Option<f64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT score FROM reputation_scores WHERE peer_id = ?1")?;
        let mut rows = stmt.query_map(params![peer_id], |row| row.get::<_, f64>(0))?;
        rows.next().transpose()
    }

    pub fn load_all_reputation(&self) -> SqlResult<Vec<(String, f64)>> {
        let mut stmt = self.conn.prepare("SELECT peer_id, score FROM reputation_scores")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }
}

fn map_ledger_row(row: &rusqlite::Row) -> SqlResult<LedgerEntry> {
    let status_str: String = row.get(2)?;
    let status = match status_str.as_str() {
        "settled" => LedgerStatus::Settled,
        "cancelled" => LedgerStatus::Cancelled,
        _ => LedgerStatus::Pending,
    };
    Ok(LedgerEntry {
        id: row.get(0)?,
        intent_id: row.get(1)?,
        status,
        tx_hash: row.get(3)?,
        error: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn kind_to_str(kind: SettlementKind) -> &'static str {
    match kind {
        SettlementKind::Standard => "standard",
        SettlementKind::Streaming => "streaming",
        SettlementKind::Escrow => "escrow",
        SettlementKind::Swarm => "swarm",
    }
}

fn str_to_kind(s: &str) -> SettlementKind {
    match s {
        "streaming" => SettlementKind::Streaming,
        "escrow" => SettlementKind::Escrow,
        "swarm" => SettlementKind::Swarm,
        _ => SettlementKind::Standard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_intent(id: &str) -> SettlementIntent {
        SettlementIntent {
            id: id.to_string(),
            kind: SettlementKind::Standard,
            invoice: Invoice {
                id: "inv-1".into(),
                amount: "10".into(),
                currency: "USD".into(),
                memo: None,
            },
            ledger_entry_id: format!("ledger-{id}"),
            priority: 0,
            created_at: 1000,
            retry_count: 0,
            max_retries: 3,
        }
    }

    #[test]
    fn save_and_load_pending_intents() {
        let store = Store::open_memory().unwrap();
        store.save_intent(&sample_intent("a")).unwrap();
        store.save_intent(&sample_intent("b")).unwrap();
        let loaded = store.load_pending_intents().unwrap();
        assert_eq!(loaded.len(), 2);
        store.remove_intent("a").unwrap();
        let loaded = store.load_pending_intents().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "b");
    }

    #[test]
    fn ledger_round_trip() {
        let store = Store::open_memory().unwrap();
        let entry = LedgerEntry {
            id: "ledger-a".into(),
            intent_id: "a".into(),
            status: LedgerStatus::Pending,
            tx_hash: None,
            error: None,
            updated_at: 1000,
        };
        store.upsert_ledger_entry(&entry).unwrap();
        let settled = LedgerEntry {
            status: LedgerStatus::Settled,
            tx_hash: Some("0xabc".into()),
            updated_at: 2000,
            ..entry
        };
        store.upsert_ledger_entry(&settled).unwrap();
        let loaded = store.get_ledger_entry("ledger-a").unwrap().unwrap();
        assert!(matches!(loaded.status, LedgerStatus::Settled));
        assert_eq!(loaded.tx_hash.as_deref(), Some("0xabc"));
    }

    #[test]
    fn reputation_round_trip() {
        let store = Store::open_memory().unwrap();
        store.upsert_reputation("ecco:a", 42.0, 1000).unwrap();
        store.upsert_reputation("ecco:a", 55.0, 2000).unwrap();
        assert_eq!(store.get_reputation("ecco:a").unwrap(), Some(55.0));
        assert_eq!(store.get_reputation("ecco:missing").unwrap(), None);
    }
}
