use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A transaction exactly as extracted from the XML export.
///
/// Every field is optional on purpose: a missing child element in the source
/// document becomes `None` here, and the downstream stages decide what that
/// means for the record. Instances only live for the duration of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    /// Ordinal of this record within the source document.
    pub index: usize,
    pub id: Option<String>,
    pub date: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub phone: Option<String>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub message: Option<String>,
    pub status: Option<String>,
    /// The export's `type` element; `type` is a keyword, so `kind` here.
    pub kind: Option<String>,
    pub fee: Option<String>,
    pub balance: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Success,
    Pending,
    Failed,
}

impl TransactionStatus {
    /// Maps the free-form status strings seen in SMS exports onto the three
    /// statuses the store knows about. Absent or unrecognized values are
    /// treated as pending rather than inventing a success.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("success") | Some("completed") | Some("done") | Some("ok") => {
                TransactionStatus::Success
            }
            Some("failed") | Some("error") | Some("declined") | Some("rejected") => {
                TransactionStatus::Failed
            }
            _ => TransactionStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "success",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Payment,
    Transfer,
    Withdrawal,
    Deposit,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Payment => "payment",
            Category::Transfer => "transfer",
            Category::Withdrawal => "withdrawal",
            Category::Deposit => "deposit",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

/// A validated and typed record, ready for categorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Source-unique reference when the export carried one.
    pub external_ref: Option<String>,
    /// Always resolvable; set to the run's ingest time when the source date
    /// could not be parsed, in which case `date_fallback` is true.
    pub occurred_at: DateTime<Utc>,
    pub date_fallback: bool,
    /// Non-negative by construction; negative amounts are rejected upstream.
    pub amount: Decimal,
    pub currency: String,
    /// Canonical dial-code format, or None when the source value was not a
    /// recognizable phone number.
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub message: Option<String>,
    pub status: TransactionStatus,
    /// Normalized transaction type hint from the source, if any.
    pub kind: Option<String>,
}

/// A normalized record plus the derived classification. Category and risk are
/// never user-supplied; they are recomputed on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizedRecord {
    pub record: NormalizedRecord,
    pub category: Category,
    pub risk_tier: RiskTier,
    pub tags: BTreeSet<String>,
}

/// Outcome of attempting to load one categorized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted { id: i64 },
    /// The dedup key already exists; the stored record is left untouched.
    DuplicateSkipped,
}
