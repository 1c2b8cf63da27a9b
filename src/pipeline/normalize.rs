use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::domain::{NormalizedRecord, RawRecord, TransactionStatus};
use crate::error::EtlError;

/// Per-record result of normalization. Rejections travel as values so the
/// orchestrator can route them to dead-letter without unwinding the run.
#[derive(Debug)]
pub enum NormalizeOutcome {
    Normalized(NormalizedRecord),
    /// Expected noise (OTP/verification notices); excluded from the load and
    /// counted separately from rejections.
    Filtered { reason: String },
    Rejected { error: EtlError },
}

pub struct Normalizer<'a> {
    config: &'a PipelineConfig,
}

static NON_AMOUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.\-]").unwrap());
static NON_PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9+]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static LENIENT_YMD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})-(\d{1,2})-(\d{1,2})").unwrap());
static LENIENT_DMY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})[/-](\d{1,2})[/-](\d{4})").unwrap());

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Cleans one raw record into typed form. `ingested_at` is the run's
    /// ingest instant, used as the documented fallback for unparsable dates.
    pub fn normalize(&self, raw: &RawRecord, ingested_at: DateTime<Utc>) -> NormalizeOutcome {
        let message = raw.message.as_deref().map(clean_message).unwrap_or(None);

        if let Some(text) = &message {
            if self.is_otp_message(text) {
                debug!(index = raw.index, "filtered OTP message");
                return NormalizeOutcome::Filtered {
                    reason: "otp-message".to_string(),
                };
            }
        }

        let amount = match raw.amount.as_deref() {
            None => {
                return NormalizeOutcome::Rejected {
                    error: EtlError::InvalidAmount("amount field is missing".to_string()),
                }
            }
            Some(text) => match parse_amount(text) {
                Some(value) => value,
                None => {
                    return NormalizeOutcome::Rejected {
                        error: EtlError::InvalidAmount(format!("not a number: '{}'", text)),
                    }
                }
            },
        };
        if amount.is_sign_negative() {
            return NormalizeOutcome::Rejected {
                error: EtlError::InvalidAmount(format!("negative amount: {}", amount)),
            };
        }

        let (occurred_at, date_fallback) = match raw.date.as_deref().and_then(|d| self.parse_date(d))
        {
            Some(instant) => (instant, false),
            None => {
                debug!(index = raw.index, date = ?raw.date, "date fallback to ingest time");
                (ingested_at, true)
            }
        };

        let sender = raw.sender.as_deref().and_then(|p| self.normalize_phone(p));
        let receiver = raw
            .receiver
            .as_deref()
            .or(raw.phone.as_deref())
            .and_then(|p| self.normalize_phone(p));

        let external_ref = raw
            .id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let currency = raw
            .currency
            .as_deref()
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.config.default_currency.clone());

        let kind = raw
            .kind
            .as_deref()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty());

        NormalizeOutcome::Normalized(NormalizedRecord {
            external_ref,
            occurred_at,
            date_fallback,
            amount,
            currency,
            sender,
            receiver,
            message,
            status: TransactionStatus::from_raw(raw.status.as_deref()),
            kind,
        })
    }

    fn is_otp_message(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.config.otp_keywords.iter().any(|kw| lower.contains(kw))
    }

    /// Tries the configured format list first, then RFC 3339, then lenient
    /// pattern extraction, then a unix-timestamp reading for all-digit
    /// values. Naive datetimes are taken as UTC.
    fn parse_date(&self, text: &str) -> Option<DateTime<Utc>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        for format in &self.config.date_formats {
            if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
                return Some(Utc.from_utc_datetime(&dt));
            }
            if let Ok(d) = NaiveDate::parse_from_str(text, format) {
                return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
            }
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }

        if text.chars().all(|c| c.is_ascii_digit()) {
            let value: i64 = text.parse().ok()?;
            // Values past ~2286 in seconds are really milliseconds.
            let seconds = if value > 10_000_000_000 { value / 1000 } else { value };
            return Utc.timestamp_opt(seconds, 0).single();
        }

        if let Some(caps) = LENIENT_YMD.captures(text) {
            return naive_date(&caps[1], &caps[2], &caps[3]);
        }
        if let Some(caps) = LENIENT_DMY.captures(text) {
            return naive_date(&caps[3], &caps[2], &caps[1]);
        }

        None
    }

    /// Canonicalizes to `<dial code><9 digits>`. Anything unrecognizable
    /// yields None; a missing counterpart phone is not a rejection.
    fn normalize_phone(&self, text: &str) -> Option<String> {
        let cleaned = NON_PHONE.replace_all(text.trim(), "");
        let dial = self.config.country_dial_code.as_str();
        let bare_dial = dial.trim_start_matches('+');

        let national = if let Some(rest) = cleaned.strip_prefix(dial) {
            rest.to_string()
        } else if let Some(rest) = cleaned.strip_prefix(bare_dial) {
            rest.to_string()
        } else if let Some(rest) = cleaned.strip_prefix('0') {
            rest.to_string()
        } else if cleaned.len() == 9 && cleaned.chars().all(|c| c.is_ascii_digit()) {
            cleaned.to_string()
        } else {
            return None;
        };

        if national.len() == 9 && national.chars().all(|c| c.is_ascii_digit()) {
            Some(format!("{dial}{national}"))
        } else {
            None
        }
    }
}

fn parse_amount(text: &str) -> Option<Decimal> {
    let cleaned = NON_AMOUNT.replace_all(text.trim(), "");
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(cleaned.as_ref()).ok()
}

/// Trims, collapses runs of whitespace, and strips control characters.
/// Tabs and newlines are whitespace first, so they collapse to a single
/// space instead of vanishing and gluing words together.
fn clean_message(text: &str) -> Option<String> {
    let without_controls: String = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect();
    let collapsed = WHITESPACE.replace_all(without_controls.trim(), " ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.into_owned())
    }
}

fn naive_date(year: &str, month: &str, day: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
