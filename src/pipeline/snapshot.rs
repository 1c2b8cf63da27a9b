use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::pipeline::load::TransactionStore;

/// Aggregate view of the store, written as JSON for the dashboard after a
/// successful run. The dashboard only reads this artifact, never the
/// database.
#[derive(Debug, Serialize)]
pub struct DashboardSnapshot {
    pub summary: SnapshotSummary,
    pub category_distribution: Vec<CategorySlice>,
    pub risk_distribution: Vec<CountSlice>,
    pub time_of_day_distribution: Vec<CountSlice>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotSummary {
    pub total_transactions: i64,
    pub total_amount: f64,
    pub success_rate: f64,
    pub active_users: i64,
}

#[derive(Debug, Serialize)]
pub struct CategorySlice {
    pub category: String,
    pub count: i64,
    pub total_amount: f64,
}

#[derive(Debug, Serialize)]
pub struct CountSlice {
    pub label: String,
    pub count: i64,
}

pub fn build(store: &TransactionStore) -> Result<DashboardSnapshot> {
    let conn = store.connection();

    let total_transactions: i64 =
        conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    // Amounts are stored as exact decimal text; CAST is fine for a summary.
    let total_amount: f64 = conn.query_row(
        "SELECT COALESCE(SUM(CAST(amount AS REAL)), 0) FROM transactions",
        [],
        |row| row.get(0),
    )?;
    let success_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE status = 'success'",
        [],
        |row| row.get(0),
    )?;
    let active_users: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE phone <> 'unknown'",
        [],
        |row| row.get(0),
    )?;
    let success_rate = if total_transactions > 0 {
        success_count as f64 / total_transactions as f64 * 100.0
    } else {
        0.0
    };

    let mut stmt = conn.prepare(
        "SELECT c.name, COUNT(*), COALESCE(SUM(CAST(t.amount AS REAL)), 0)
         FROM transactions t JOIN transaction_categories c ON c.id = t.category_id
         GROUP BY c.name ORDER BY c.name",
    )?;
    let category_distribution = stmt
        .query_map([], |row| {
            Ok(CategorySlice {
                category: row.get(0)?,
                count: row.get(1)?,
                total_amount: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT risk_tier, COUNT(*) FROM transactions GROUP BY risk_tier ORDER BY risk_tier",
    )?;
    let risk_distribution = stmt
        .query_map([], |row| {
            Ok(CountSlice {
                label: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT CASE
            WHEN CAST(strftime('%H', occurred_at) AS INTEGER) BETWEEN 6 AND 11 THEN 'morning'
            WHEN CAST(strftime('%H', occurred_at) AS INTEGER) BETWEEN 12 AND 16 THEN 'afternoon'
            WHEN CAST(strftime('%H', occurred_at) AS INTEGER) BETWEEN 17 AND 20 THEN 'evening'
            ELSE 'night'
         END AS bucket, COUNT(*)
         FROM transactions GROUP BY bucket ORDER BY bucket",
    )?;
    let time_of_day_distribution = stmt
        .query_map([], |row| {
            Ok(CountSlice {
                label: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(DashboardSnapshot {
        summary: SnapshotSummary {
            total_transactions,
            total_amount,
            success_rate,
            active_users,
        },
        category_distribution,
        risk_distribution,
        time_of_day_distribution,
        exported_at: Utc::now(),
    })
}

pub fn export<P: AsRef<Path>>(store: &TransactionStore, path: P) -> Result<DashboardSnapshot> {
    let path = path.as_ref();
    let snapshot = build(store)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
    info!(path = %path.display(), "exported dashboard snapshot");
    Ok(snapshot)
}
