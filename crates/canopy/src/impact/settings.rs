//! Merchant-facing settings payloads and their validation.
//!
//! Older admin forms send a single `trigger_type`/`trigger_value` pair instead
//! of a rule list. Both shapes are accepted here and collapsed into the rule
//! list before anything is persisted.

use serde::{Deserialize, Deserializer, Serialize};

use super::domain::{
    OrderEvent, ShopSettings, TriggerKind, TriggerRule, WidgetPlacement, WidgetSettings,
};

const MAX_HEADLINE_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("send either `rules` or `trigger_type`/`trigger_value`, not both")]
    MixedRuleFormats,
    #[error("`trigger_type` and `trigger_value` must be sent together")]
    IncompleteLegacyTrigger,
    #[error("rule {index} ({kind}): {reason}")]
    InvalidRule {
        index: usize,
        kind: &'static str,
        reason: &'static str,
    },
    #[error("`{field}` {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Distinguishes an absent field from an explicit `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update of a shop's settings; omitted fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub is_enabled: Option<bool>,
    pub is_paused: Option<bool>,
    pub order_event: Option<OrderEvent>,
    /// Minimum for the legacy single trigger; `null` clears it.
    #[serde(deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub minimum_order_value: Option<Option<f64>>,
    pub rules: Option<Vec<TriggerRule>>,
    #[serde(alias = "triggerType")]
    pub trigger_type: Option<TriggerKind>,
    #[serde(alias = "triggerValue")]
    pub trigger_value: Option<f64>,
    pub cost_per_tree: Option<f64>,
    pub cost_per_kg_co2: Option<f64>,
    /// `null` removes the monthly limit.
    #[serde(deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub monthly_budget: Option<Option<f64>>,
    pub notify_on_limit: Option<bool>,
    pub auto_resume_monthly: Option<bool>,
    pub loyalty_enabled: Option<bool>,
    pub points_per_tree: Option<u32>,
}

impl SettingsUpdate {
    /// Validates the update and applies it; `settings` is untouched on error.
    pub fn apply_to(self, settings: &mut ShopSettings) -> Result<(), SettingsError> {
        let mut next = settings.clone();
        let legacy_trigger = self.rules.is_none()
            && (self.trigger_type.is_some() || self.minimum_order_value.is_some());

        if let Some(rules) = self.normalized_rules()? {
            next.rules = rules;
        }
        if let Some(value) = self.is_enabled {
            next.is_enabled = value;
        }
        if let Some(value) = self.is_paused {
            next.is_paused = value;
        }
        if let Some(value) = self.order_event {
            next.order_event = value;
        }
        if let Some(value) = self.minimum_order_value {
            next.minimum_order_value = value;
        }
        if let Some(value) = self.cost_per_tree {
            next.cost_per_tree = value;
        }
        if let Some(value) = self.cost_per_kg_co2 {
            next.cost_per_kg_co2 = value;
        }
        if let Some(value) = self.monthly_budget {
            next.monthly_budget = value;
        }
        if let Some(value) = self.notify_on_limit {
            next.notify_on_limit = value;
        }
        if let Some(value) = self.auto_resume_monthly {
            next.auto_resume_monthly = value;
        }
        if let Some(value) = self.loyalty_enabled {
            next.loyalty_enabled = value;
        }
        if let Some(value) = self.points_per_tree {
            next.points_per_tree = value;
        }
        if legacy_trigger {
            if let [rule] = next.rules.as_mut_slice() {
                rule.minimum_order_value = next.minimum_order_value;
            }
        }

        validate(&next)?;
        *settings = next;
        Ok(())
    }

    fn normalized_rules(&self) -> Result<Option<Vec<TriggerRule>>, SettingsError> {
        match (&self.rules, self.trigger_type, self.trigger_value) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(SettingsError::MixedRuleFormats),
            (Some(rules), None, None) => Ok(Some(rules.clone())),
            (None, Some(kind), Some(value)) => Ok(Some(vec![TriggerRule::new(kind, value)])),
            (None, Some(_), None) | (None, None, Some(_)) => {
                Err(SettingsError::IncompleteLegacyTrigger)
            }
            (None, None, None) => Ok(None),
        }
    }
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn validate(settings: &ShopSettings) -> Result<(), SettingsError> {
    if !positive(settings.cost_per_tree) {
        return Err(SettingsError::InvalidField {
            field: "cost_per_tree",
            reason: "must be greater than zero",
        });
    }
    if !positive(settings.cost_per_kg_co2) {
        return Err(SettingsError::InvalidField {
            field: "cost_per_kg_co2",
            reason: "must be greater than zero",
        });
    }
    if settings.monthly_budget.is_some_and(|budget| !non_negative(budget)) {
        return Err(SettingsError::InvalidField {
            field: "monthly_budget",
            reason: "must be zero or more",
        });
    }
    if settings
        .minimum_order_value
        .is_some_and(|minimum| !non_negative(minimum))
    {
        return Err(SettingsError::InvalidField {
            field: "minimum_order_value",
            reason: "must be zero or more",
        });
    }
    if settings.points_per_tree == 0 {
        return Err(SettingsError::InvalidField {
            field: "points_per_tree",
            reason: "must be at least 1",
        });
    }

    for (index, rule) in settings.rules.iter().enumerate() {
        validate_rule(index, rule)?;
    }
    Ok(())
}

fn validate_rule(index: usize, rule: &TriggerRule) -> Result<(), SettingsError> {
    let invalid = |reason| SettingsError::InvalidRule {
        index,
        kind: rule.kind.label(),
        reason,
    };

    if !non_negative(rule.value) {
        return Err(invalid("value must be zero or more"));
    }
    if rule
        .minimum_order_value
        .is_some_and(|minimum| !non_negative(minimum))
    {
        return Err(invalid("minimum order value must be zero or more"));
    }
    if !rule.enabled {
        return Ok(());
    }

    match rule.kind {
        TriggerKind::PerTag
            if rule
                .tag
                .as_deref()
                .map(str::trim)
                .map_or(true, str::is_empty) =>
        {
            Err(invalid("a tag is required"))
        }
        TriggerKind::Threshold if rule.value <= 0.0 => {
            Err(invalid("threshold amount must be greater than zero"))
        }
        TriggerKind::Percentage if rule.value > 100.0 => {
            Err(invalid("percentage cannot exceed 100"))
        }
        _ => Ok(()),
    }
}

/// Partial update of the storefront widget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetUpdate {
    pub show_trees: Option<bool>,
    pub show_co2: Option<bool>,
    pub headline: Option<String>,
    pub accent_color: Option<String>,
    pub placement: Option<WidgetPlacement>,
}

impl WidgetUpdate {
    pub fn apply_to(self, widget: &mut WidgetSettings) -> Result<(), SettingsError> {
        let mut next = widget.clone();

        if let Some(value) = self.show_trees {
            next.show_trees = value;
        }
        if let Some(value) = self.show_co2 {
            next.show_co2 = value;
        }
        if let Some(headline) = self.headline {
            let headline = headline.trim();
            if headline.is_empty() || headline.chars().count() > MAX_HEADLINE_CHARS {
                return Err(SettingsError::InvalidField {
                    field: "headline",
                    reason: "must be between 1 and 120 characters",
                });
            }
            next.headline = headline.to_string();
        }
        if let Some(color) = self.accent_color {
            let color = color.trim();
            if !is_hex_color(color) {
                return Err(SettingsError::InvalidField {
                    field: "accent_color",
                    reason: "must be a #rgb or #rrggbb hex colour",
                });
            }
            next.accent_color = color.to_ascii_lowercase();
        }
        if let Some(placement) = self.placement {
            next.placement = placement;
        }

        *widget = next;
        Ok(())
    }
}

fn is_hex_color(value: &str) -> bool {
    match value.strip_prefix('#') {
        Some(digits) if digits.len() == 3 || digits.len() == 6 => {
            digits.chars().all(|c| c.is_ascii_hexdigit())
        }
        _ => false,
    }
}
