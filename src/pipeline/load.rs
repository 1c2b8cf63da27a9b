use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::domain::{CategorizedRecord, LoadOutcome};
use crate::error::{EtlError, Result};

/// Phone placeholder for a counterpart the source didn't identify.
const UNKNOWN_PHONE: &str = "unknown";

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;
CREATE TABLE IF NOT EXISTS users (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    phone       TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS transaction_categories (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS tags (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS transactions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    dedupe_key     TEXT NOT NULL UNIQUE,
    external_ref   TEXT,
    occurred_at    TEXT NOT NULL,
    date_fallback  INTEGER NOT NULL DEFAULT 0,
    amount         TEXT NOT NULL,
    currency       TEXT NOT NULL,
    sender_id      INTEGER NOT NULL REFERENCES users(id),
    receiver_id    INTEGER NOT NULL REFERENCES users(id),
    category_id    INTEGER NOT NULL REFERENCES transaction_categories(id),
    risk_tier      TEXT NOT NULL,
    status         TEXT NOT NULL,
    message        TEXT,
    created_at     TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_transactions_occurred_at ON transactions(occurred_at);
CREATE INDEX IF NOT EXISTS idx_transactions_category ON transactions(category_id);
CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);
CREATE TABLE IF NOT EXISTS transaction_tags (
    transaction_id  INTEGER NOT NULL REFERENCES transactions(id),
    tag_id          INTEGER NOT NULL REFERENCES tags(id),
    PRIMARY KEY (transaction_id, tag_id)
);
CREATE TABLE IF NOT EXISTS system_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    level       TEXT NOT NULL,
    stage       TEXT NOT NULL,
    message     TEXT NOT NULL,
    record_id   INTEGER,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS dead_letter (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    stage       TEXT NOT NULL,
    reason      TEXT NOT NULL,
    payload     TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed store for transactions, the audit trail, and the
/// dead-letter table. One store instance serves one run.
pub struct TransactionStore {
    conn: Connection,
}

impl TransactionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(db = %path.display(), "opened transaction store");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Loads one categorized record under a single transaction: dedup check,
    /// user and category lookups, the transaction row, tag links, and the
    /// audit entry all commit or roll back together. Storage faults other
    /// than the dedup hit surface as `LoadFailure` so the caller can
    /// dead-letter the record and keep the run going.
    pub fn insert(&mut self, record: &CategorizedRecord) -> Result<LoadOutcome> {
        let key = dedupe_key(record);
        self.insert_with_key(record, &key)
            .map_err(|e| EtlError::LoadFailure(e.to_string()))
    }

    fn insert_with_key(
        &mut self,
        record: &CategorizedRecord,
        key: &str,
    ) -> rusqlite::Result<LoadOutcome> {
        let tx = self.conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM transactions WHERE dedupe_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            debug!(key, id, "duplicate skipped");
            Self::audit(&tx, "info", "load", "duplicate skipped", Some(id))?;
            tx.commit()?;
            return Ok(LoadOutcome::DuplicateSkipped);
        }

        let sender_id = Self::user_id(&tx, record.record.sender.as_deref())?;
        let receiver_id = Self::user_id(&tx, record.record.receiver.as_deref())?;
        let category_id = Self::category_id(&tx, record.category.as_str())?;

        tx.execute(
            "INSERT INTO transactions (
                dedupe_key, external_ref, occurred_at, date_fallback, amount,
                currency, sender_id, receiver_id, category_id, risk_tier,
                status, message
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                key,
                record.record.external_ref,
                record.record.occurred_at.to_rfc3339(),
                record.record.date_fallback as i64,
                record.record.amount.to_string(),
                record.record.currency,
                sender_id,
                receiver_id,
                category_id,
                record.risk_tier.as_str(),
                record.record.status.as_str(),
                record.record.message,
            ],
        )?;
        let id = tx.last_insert_rowid();

        for tag in &record.tags {
            let tag_id = Self::tag_id(&tx, tag)?;
            tx.execute(
                "INSERT OR IGNORE INTO transaction_tags (transaction_id, tag_id) VALUES (?1, ?2)",
                params![id, tag_id],
            )?;
        }

        Self::audit(&tx, "info", "load", "inserted", Some(id))?;
        tx.commit()?;
        debug!(id, key, "inserted transaction");
        Ok(LoadOutcome::Inserted { id })
    }

    /// Appends one audit trail entry outside any record transaction.
    pub fn append_audit(
        &self,
        level: &str,
        stage: &str,
        message: &str,
        record_id: Option<i64>,
    ) -> Result<()> {
        Self::audit(&self.conn, level, stage, message, record_id)?;
        Ok(())
    }

    /// Stores an unrecoverable record with its failing stage and reason.
    /// Dead-letter rows are never mutated and never retried within a run.
    pub fn dead_letter(&self, stage: &str, reason: &str, payload: &serde_json::Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO dead_letter (stage, reason, payload) VALUES (?1, ?2, ?3)",
            params![stage, reason, payload.to_string()],
        )?;
        Ok(())
    }

    fn audit(
        conn: &Connection,
        level: &str,
        stage: &str,
        message: &str,
        record_id: Option<i64>,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO system_logs (level, stage, message, record_id) VALUES (?1, ?2, ?3, ?4)",
            params![level, stage, message, record_id],
        )?;
        Ok(())
    }

    /// Create-if-absent lookup by phone uniqueness. A null counterpart maps
    /// to the shared synthetic "unknown" user.
    fn user_id(tx: &Transaction<'_>, phone: Option<&str>) -> rusqlite::Result<i64> {
        let phone = phone.unwrap_or(UNKNOWN_PHONE);
        tx.execute(
            "INSERT OR IGNORE INTO users (phone) VALUES (?1)",
            params![phone],
        )?;
        tx.query_row(
            "SELECT id FROM users WHERE phone = ?1",
            params![phone],
            |row| row.get(0),
        )
    }

    fn category_id(tx: &Transaction<'_>, name: &str) -> rusqlite::Result<i64> {
        tx.execute(
            "INSERT OR IGNORE INTO transaction_categories (name) VALUES (?1)",
            params![name],
        )?;
        tx.query_row(
            "SELECT id FROM transaction_categories WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
    }

    fn tag_id(tx: &Transaction<'_>, name: &str) -> rusqlite::Result<i64> {
        tx.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
        tx.query_row("SELECT id FROM tags WHERE name = ?1", params![name], |row| {
            row.get(0)
        })
    }

    pub fn transaction_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Deduplication key for a record: the source's external reference when
/// present, otherwise a deterministic digest over the identifying fields so
/// re-runs of the same file still collide. A date-fallback timestamp is the
/// run's ingest time and changes every run, so those records key on the
/// message text instead.
pub fn dedupe_key(record: &CategorizedRecord) -> String {
    if let Some(external_ref) = &record.record.external_ref {
        return external_ref.clone();
    }
    let mut canonical = String::new();
    if record.record.date_fallback {
        canonical.push_str(record.record.message.as_deref().unwrap_or(""));
    } else {
        canonical.push_str(&record.record.occurred_at.to_rfc3339());
    }
    canonical.push('|');
    canonical.push_str(&record.record.amount.to_string());
    canonical.push('|');
    canonical.push_str(record.record.sender.as_deref().unwrap_or(""));
    canonical.push('|');
    canonical.push_str(record.record.receiver.as_deref().unwrap_or(""));

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("syn-{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Category, NormalizedRecord, RiskTier, TransactionStatus};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::collections::BTreeSet;

    fn record(external_ref: Option<&str>) -> CategorizedRecord {
        CategorizedRecord {
            record: NormalizedRecord {
                external_ref: external_ref.map(str::to_string),
                occurred_at: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
                date_fallback: false,
                amount: Decimal::from(1500),
                currency: "RWF".to_string(),
                sender: Some("+250781234567".to_string()),
                receiver: Some("+250788765432".to_string()),
                message: Some("Payment received".to_string()),
                status: TransactionStatus::Success,
                kind: None,
            },
            category: Category::Payment,
            risk_tier: RiskTier::Low,
            tags: BTreeSet::from(["fee".to_string()]),
        }
    }

    #[test]
    fn insert_then_duplicate_skip() {
        let mut store = TransactionStore::open_in_memory().unwrap();
        let rec = record(Some("TXN001"));

        let first = store.insert(&rec).unwrap();
        assert!(matches!(first, LoadOutcome::Inserted { .. }));
        let second = store.insert(&rec).unwrap();
        assert_eq!(second, LoadOutcome::DuplicateSkipped);
        assert_eq!(store.transaction_count().unwrap(), 1);
    }

    #[test]
    fn synthetic_key_dedups_records_without_external_ref() {
        let mut store = TransactionStore::open_in_memory().unwrap();
        let rec = record(None);
        assert!(matches!(
            store.insert(&rec).unwrap(),
            LoadOutcome::Inserted { .. }
        ));
        assert_eq!(store.insert(&rec).unwrap(), LoadOutcome::DuplicateSkipped);

        // A different amount is a different record.
        let mut other = record(None);
        other.record.amount = Decimal::from(1501);
        assert!(matches!(
            store.insert(&other).unwrap(),
            LoadOutcome::Inserted { .. }
        ));
        assert_eq!(store.transaction_count().unwrap(), 2);
    }

    #[test]
    fn date_fallback_records_dedup_across_differing_ingest_times() {
        let mut store = TransactionStore::open_in_memory().unwrap();
        let mut first = record(None);
        first.record.date_fallback = true;
        let mut second = first.clone();
        // A later run sees the same source record under a new ingest instant.
        second.record.occurred_at = Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap();

        assert!(matches!(
            store.insert(&first).unwrap(),
            LoadOutcome::Inserted { .. }
        ));
        assert_eq!(store.insert(&second).unwrap(), LoadOutcome::DuplicateSkipped);
        assert_eq!(store.transaction_count().unwrap(), 1);
    }

    #[test]
    fn users_are_created_once_per_phone() {
        let mut store = TransactionStore::open_in_memory().unwrap();
        store.insert(&record(Some("a"))).unwrap();
        store.insert(&record(Some("b"))).unwrap();
        let users: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(users, 2);
    }

    #[test]
    fn missing_counterpart_maps_to_unknown_user() {
        let mut store = TransactionStore::open_in_memory().unwrap();
        let mut rec = record(Some("a"));
        rec.record.sender = None;
        store.insert(&rec).unwrap();
        let unknown: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM users WHERE phone = 'unknown'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(unknown, 1);
    }

    #[test]
    fn every_outcome_writes_one_load_audit_entry() {
        let mut store = TransactionStore::open_in_memory().unwrap();
        let rec = record(Some("TXN001"));
        store.insert(&rec).unwrap();
        store.insert(&rec).unwrap();
        let entries: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM system_logs WHERE stage = 'load'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(entries, 2);
    }

    #[test]
    fn tag_links_are_stored() {
        let mut store = TransactionStore::open_in_memory().unwrap();
        store.insert(&record(Some("a"))).unwrap();
        let links: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM transaction_tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(links, 1);
    }

    #[test]
    fn dead_letter_rows_carry_stage_and_reason() {
        let store = TransactionStore::open_in_memory().unwrap();
        store
            .dead_letter(
                "normalize",
                "InvalidAmountError: negative amount",
                &serde_json::json!({"amount": "-50.00"}),
            )
            .unwrap();
        let (stage, reason): (String, String) = store
            .connection()
            .query_row("SELECT stage, reason FROM dead_letter", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(stage, "normalize");
        assert!(reason.contains("InvalidAmountError"));
    }
}
