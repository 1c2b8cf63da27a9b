use std::collections::BTreeSet;

use tracing::debug;

use crate::config::PipelineConfig;
use crate::domain::{Category, CategorizedRecord, NormalizedRecord, RiskTier, TransactionStatus};

/// Derives category, risk tier, and tags for a normalized record.
///
/// This is a total function over its input: every record gets a category
/// (falling back to `Other`), and identical (kind, message, amount, status)
/// inputs always produce identical output. All rule tables come from the
/// run's config, so the same code re-runs under different rules.
pub struct Categorizer<'a> {
    config: &'a PipelineConfig,
}

impl<'a> Categorizer<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    pub fn categorize(&self, record: NormalizedRecord) -> CategorizedRecord {
        let category = self.category_for(&record);
        let risk_tier = self.risk_for(&record);
        let tags = self.tags_for(&record);
        debug!(
            category = category.as_str(),
            risk = risk_tier.as_str(),
            tags = tags.len(),
            "categorized record"
        );
        CategorizedRecord {
            record,
            category,
            risk_tier,
            tags,
        }
    }

    /// Precedence: explicit recognized type field, then message keywords,
    /// then `Other`.
    fn category_for(&self, record: &NormalizedRecord) -> Category {
        if let Some(kind) = record.kind.as_deref() {
            if let Some(category) = self.category_from_kind(kind) {
                return category;
            }
        }

        if let Some(message) = record.message.as_deref() {
            let lower = message.to_lowercase();
            let mut best: Option<(Category, usize)> = None;
            for rule in &self.config.categories {
                let score = rule
                    .keywords
                    .iter()
                    .filter(|kw| lower.contains(kw.as_str()))
                    .count();
                // Strictly-greater keeps ties resolved by config order.
                if score > 0 && best.map_or(true, |(_, s)| score > s) {
                    best = Some((rule.category, score));
                }
            }
            if let Some((category, _)) = best {
                return category;
            }
        }

        Category::Other
    }

    /// Amount thresholds decide the base tier; a failed status escalates to
    /// at least medium, and a high-value amount is high regardless of status.
    fn risk_for(&self, record: &NormalizedRecord) -> RiskTier {
        let thresholds = &self.config.risk;
        let mut tier = if record.amount > thresholds.high_value {
            RiskTier::High
        } else if record.amount > thresholds.elevated_value {
            RiskTier::Medium
        } else {
            RiskTier::Low
        };
        if record.status == TransactionStatus::Failed && tier < RiskTier::Medium {
            tier = RiskTier::Medium;
        }
        tier
    }

    /// Tags accumulate from independent keyword predicates; a record may
    /// carry zero or many.
    fn tags_for(&self, record: &NormalizedRecord) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        let Some(message) = record.message.as_deref() else {
            return tags;
        };
        let lower = message.to_lowercase();
        for rule in &self.config.tags {
            if rule.keywords.iter().any(|kw| lower.contains(kw.as_str())) {
                tags.insert(rule.name.clone());
            }
        }
        tags
    }

    /// Exact match against the configured aliases for the export's explicit
    /// type field.
    fn category_from_kind(&self, kind: &str) -> Option<Category> {
        self.config
            .kind_aliases
            .iter()
            .find(|rule| rule.aliases.iter().any(|alias| alias == kind))
            .map(|rule| rule.category)
    }
}
