//! Trigger-rule evaluation: turns an order into a tree count.

use std::collections::HashMap;

use serde::Serialize;

use super::budget::SPEND_TOLERANCE;
use super::domain::{LineItem, OrderPayload, ShopSettings, TriggerKind, TriggerRule};

/// Product id to tag list, as resolved from the catalog.
pub type ProductTags = HashMap<u64, Vec<String>>;

/// Trees contributed by a single enabled rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleContribution {
    pub kind: TriggerKind,
    pub trees: u32,
    pub notes: String,
}

/// Evaluation output with a per-rule trail for the ledger metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeCalculation {
    pub trees: u32,
    pub below_minimum: bool,
    pub contributions: Vec<RuleContribution>,
}

/// Stateless evaluator over a shop's rule set.
///
/// Each rule is gated by its own minimum order value. A legacy single trigger
/// carries the shop-wide minimum on its rule, see `SettingsUpdate`.
pub struct TreeCalculator<'a> {
    rules: &'a [TriggerRule],
    cost_per_tree: f64,
}

impl<'a> TreeCalculator<'a> {
    pub fn new(rules: &'a [TriggerRule], cost_per_tree: f64) -> Self {
        Self {
            rules,
            cost_per_tree,
        }
    }

    pub fn from_settings(settings: &'a ShopSettings) -> Self {
        Self::new(&settings.rules, settings.cost_per_tree)
    }

    pub fn calculate(&self, order: &OrderPayload, tags: &ProductTags) -> TreeCalculation {
        let total = sanitize_total(order.total_price);

        let mut gated = 0usize;
        let mut contributions = Vec::new();
        for rule in self.rules.iter().filter(|rule| rule.enabled) {
            let contribution = match rule.minimum_order_value {
                Some(minimum) if total < minimum => {
                    gated += 1;
                    RuleContribution {
                        kind: rule.kind,
                        trees: 0,
                        notes: format!("total {total:.2} below rule minimum {minimum:.2}"),
                    }
                }
                _ => self.contribution(rule, total, &order.line_items, tags),
            };
            contributions.push(contribution);
        }

        let trees = contributions
            .iter()
            .fold(0u32, |sum, contribution| sum.saturating_add(contribution.trees));

        TreeCalculation {
            trees,
            below_minimum: gated > 0 && gated == contributions.len(),
            contributions,
        }
    }

    fn contribution(
        &self,
        rule: &TriggerRule,
        total: f64,
        line_items: &[LineItem],
        tags: &ProductTags,
    ) -> RuleContribution {
        let (trees, notes) = match rule.kind {
            TriggerKind::Fixed => {
                let trees = whole_trees(rule.value);
                (trees, format!("{trees} tree(s) per order"))
            }
            TriggerKind::PerProduct => {
                let units = total_units(line_items);
                let trees = whole_trees(rule.value).saturating_mul(units);
                (trees, format!("{units} unit(s) ordered"))
            }
            TriggerKind::PerTag => match rule.tag.as_deref().map(str::trim) {
                Some(tag) if !tag.is_empty() => {
                    let units = tagged_units(line_items, tags, tag);
                    let trees = whole_trees(rule.value).saturating_mul(units);
                    (trees, format!("{units} unit(s) tagged '{tag}'"))
                }
                _ => (0, "no tag configured".to_string()),
            },
            TriggerKind::Threshold => {
                if rule.value <= 0.0 {
                    (0, "threshold must be positive".to_string())
                } else {
                    let trees = whole_trees(total / rule.value);
                    (trees, format!("one tree per {:.2} spent", rule.value))
                }
            }
            TriggerKind::Percentage => {
                if self.cost_per_tree <= 0.0 {
                    (0, "cost per tree must be positive".to_string())
                } else {
                    let donation = total * (rule.value / 100.0);
                    // Exact donations must not lose a tree to f64 rounding.
                    let trees = whole_trees(donation / self.cost_per_tree + SPEND_TOLERANCE);
                    (trees, format!("{:.2}% donation of {donation:.2}", rule.value))
                }
            }
        };

        RuleContribution {
            kind: rule.kind,
            trees,
            notes,
        }
    }
}

fn sanitize_total(total: f64) -> f64 {
    if total.is_finite() {
        total
    } else {
        0.0
    }
}

/// Floors a computed amount into a tree count; negatives and NaN become zero.
pub(crate) fn whole_trees(amount: f64) -> u32 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    amount.floor().min(f64::from(u32::MAX)) as u32
}

fn total_units(line_items: &[LineItem]) -> u32 {
    line_items
        .iter()
        .fold(0u32, |sum, item| sum.saturating_add(item.quantity))
}

fn tagged_units(line_items: &[LineItem], tags: &ProductTags, tag: &str) -> u32 {
    let wanted = tag.to_lowercase();
    line_items
        .iter()
        .filter(|item| {
            item.product_id
                .and_then(|id| tags.get(&id))
                .map(|product_tags| {
                    product_tags
                        .iter()
                        .any(|candidate| candidate.trim().to_lowercase() == wanted)
                })
                .unwrap_or(false)
        })
        .fold(0u32, |sum, item| sum.saturating_add(item.quantity))
}

/// Product ids on the order that a tag lookup needs to resolve.
pub fn product_ids(order: &OrderPayload) -> Vec<u64> {
    let mut ids: Vec<u64> = order
        .line_items
        .iter()
        .filter_map(|item| item.product_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}
