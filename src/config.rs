use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::Category;
use crate::error::{EtlError, Result};

/// Rule tables and constants for one pipeline run.
///
/// Constructed once per run and passed by reference into the stages; nothing
/// mutates it mid-run. The categorizer is re-runnable with a different config
/// without code changes, so all keyword lists and thresholds live here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub default_currency: String,
    /// Dial code applied when canonicalizing national phone numbers.
    pub country_dial_code: String,
    /// Fixed-priority date formats tried before the lenient fallbacks.
    pub date_formats: Vec<String>,
    /// Substrings (lowercase) that mark a message as an OTP/verification
    /// notice. Matching records are filtered, not loaded.
    pub otp_keywords: Vec<String>,
    /// Recognized values of the export's explicit type field, checked before
    /// any message keyword scoring.
    pub kind_aliases: Vec<KindAliasRule>,
    pub categories: Vec<CategoryRule>,
    pub tags: Vec<TagRule>,
    pub risk: RiskThresholds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KindAliasRule {
    pub category: Category,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRule {
    pub category: Category,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRule {
    pub name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Amounts above this are at least medium risk.
    pub elevated_value: Decimal,
    /// Amounts above this are high risk regardless of status.
    pub high_value: Decimal,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            elevated_value: Decimal::from(10_000),
            high_value: Decimal::from(50_000),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            default_currency: "RWF".to_string(),
            country_dial_code: "+250".to_string(),
            date_formats: owned(&[
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%dT%H:%M:%S",
                "%d/%m/%Y %H:%M",
                "%d-%m-%Y %H:%M",
                "%Y-%m-%d",
            ]),
            otp_keywords: owned(&[
                "one-time password",
                "otp",
                "verification code",
                "do not share",
                "does not recommend that you share",
                "be vigilant",
            ]),
            kind_aliases: vec![
                KindAliasRule {
                    category: Category::Payment,
                    aliases: owned(&["payment", "pay", "bill", "utility"]),
                },
                KindAliasRule {
                    category: Category::Transfer,
                    aliases: owned(&["transfer", "send", "money", "p2p"]),
                },
                KindAliasRule {
                    category: Category::Withdrawal,
                    aliases: owned(&["withdrawal", "withdraw", "cashout", "cash-out"]),
                },
                KindAliasRule {
                    category: Category::Deposit,
                    aliases: owned(&["deposit", "topup", "top-up", "recharge"]),
                },
            ],
            categories: vec![
                CategoryRule {
                    category: Category::Payment,
                    keywords: owned(&[
                        "payment",
                        "paid",
                        "bill",
                        "utility",
                        "cash power",
                        "token",
                        "merchant",
                        "has been completed",
                        "direct payment",
                    ]),
                },
                CategoryRule {
                    category: Category::Transfer,
                    keywords: owned(&[
                        "transfer",
                        "transferred",
                        "sent to",
                        "you have received",
                        "received from",
                        "p2p",
                    ]),
                },
                CategoryRule {
                    category: Category::Withdrawal,
                    keywords: owned(&[
                        "withdraw",
                        "withdrawn",
                        "withdrawal",
                        "cash out",
                        "cash-out",
                        "atm",
                        "collect your money in cash",
                    ]),
                },
                CategoryRule {
                    category: Category::Deposit,
                    keywords: owned(&[
                        "deposit",
                        "topup",
                        "top-up",
                        "recharge",
                        "added to your mobile money account",
                        "has been added",
                        "bank deposit",
                    ]),
                },
            ],
            tags: vec![
                TagRule {
                    name: "utility".to_string(),
                    keywords: owned(&["cash power", "electricity", "utility", "water"]),
                },
                TagRule {
                    name: "fee".to_string(),
                    keywords: owned(&["fee", "charge", "commission"]),
                },
                TagRule {
                    name: "salary".to_string(),
                    keywords: owned(&["salary", "payroll", "wages"]),
                },
                TagRule {
                    name: "reversal".to_string(),
                    keywords: owned(&["reversal", "reversed", "refund"]),
                },
                TagRule {
                    name: "airtime".to_string(),
                    keywords: owned(&["airtime", "bundle", "data pack"]),
                },
            ],
            risk: RiskThresholds::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EtlError::Config(format!("failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_rules_for_every_concrete_category() {
        let config = PipelineConfig::default();
        for category in [
            Category::Payment,
            Category::Transfer,
            Category::Withdrawal,
            Category::Deposit,
        ] {
            assert!(
                config.categories.iter().any(|r| r.category == category),
                "missing keyword rule for {:?}",
                category
            );
        }
        assert!(config.risk.high_value > config.risk.elevated_value);
    }

    #[test]
    fn partial_toml_overrides_fall_back_to_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            default_currency = "GHS"
            country_dial_code = "+233"

            [risk]
            high_value = 100000
            "#,
        )
        .unwrap();

        assert_eq!(config.default_currency, "GHS");
        assert_eq!(config.country_dial_code, "+233");
        assert_eq!(config.risk.high_value, Decimal::from(100_000));
        // Untouched sections keep the stock rule tables.
        assert!(!config.categories.is_empty());
        assert!(!config.otp_keywords.is_empty());
    }
}
