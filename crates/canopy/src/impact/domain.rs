use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::defaults::{
    DEFAULT_COST_PER_KG_CO2, DEFAULT_COST_PER_TREE, DEFAULT_POINTS_PER_TREE,
    DEFAULT_TREES_PER_ORDER, DEFAULT_WIDGET_ACCENT, DEFAULT_WIDGET_HEADLINE,
};

/// Internal identifier for an installed shop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShopId(pub String);

impl ShopId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ShopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity record for a merchant store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub id: ShopId,
    pub domain: String,
    pub name: String,
    pub company_id: Option<String>,
    #[serde(skip)]
    pub access_token: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub uninstalled_at: Option<DateTime<Utc>>,
}

impl Shop {
    pub fn is_installed(&self) -> bool {
        self.uninstalled_at.is_none()
    }
}

/// Install or reinstall payload for a shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopRegistration {
    pub domain: String,
    pub name: String,
    #[serde(default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Rule formulas available to merchants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Fixed,
    PerProduct,
    PerTag,
    Threshold,
    Percentage,
}

impl TriggerKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::PerProduct => "per_product",
            Self::PerTag => "per_tag",
            Self::Threshold => "threshold",
            Self::Percentage => "percentage",
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

/// A merchant-configured condition and formula mapping an order to trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub kind: TriggerKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_order_value: Option<f64>,
}

impl TriggerRule {
    pub fn new(kind: TriggerKind, value: f64) -> Self {
        Self {
            kind,
            enabled: true,
            value,
            tag: None,
            minimum_order_value: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_minimum(mut self, minimum_order_value: f64) -> Self {
        self.minimum_order_value = Some(minimum_order_value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Order topic that plants trees for a shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEvent {
    Paid,
    Created,
}

impl OrderEvent {
    pub const fn topic(self) -> &'static str {
        match self {
            Self::Paid => "orders/paid",
            Self::Created => "orders/create",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "paid" => Some(Self::Paid),
            "created" => Some(Self::Created),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Created => "created",
        }
    }
}

/// Per-shop configuration read by the rule evaluator and spend guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopSettings {
    pub is_enabled: bool,
    pub is_paused: bool,
    pub order_event: OrderEvent,
    pub minimum_order_value: Option<f64>,
    pub rules: Vec<TriggerRule>,
    pub cost_per_tree: f64,
    pub cost_per_kg_co2: f64,
    pub monthly_budget: Option<f64>,
    pub monthly_spent: f64,
    /// `YYYY-MM` period that `monthly_spent` belongs to.
    pub spend_period: Option<String>,
    pub notify_on_limit: bool,
    pub auto_resume_monthly: bool,
    pub loyalty_enabled: bool,
    pub points_per_tree: u32,
    #[serde(skip_serializing)]
    pub loyalty_api_key: Option<String>,
}

impl Default for ShopSettings {
    fn default() -> Self {
        Self {
            is_enabled: true,
            is_paused: false,
            order_event: OrderEvent::Paid,
            minimum_order_value: None,
            rules: vec![TriggerRule::new(TriggerKind::Fixed, DEFAULT_TREES_PER_ORDER)],
            cost_per_tree: DEFAULT_COST_PER_TREE,
            cost_per_kg_co2: DEFAULT_COST_PER_KG_CO2,
            monthly_budget: None,
            monthly_spent: 0.0,
            spend_period: None,
            notify_on_limit: true,
            auto_resume_monthly: true,
            loyalty_enabled: false,
            points_per_tree: DEFAULT_POINTS_PER_TREE,
            loyalty_api_key: None,
        }
    }
}

impl ShopSettings {
    pub fn active_rules(&self) -> impl Iterator<Item = &TriggerRule> {
        self.rules.iter().filter(|rule| rule.enabled)
    }

    pub fn needs_product_tags(&self) -> bool {
        self.active_rules()
            .any(|rule| rule.kind == TriggerKind::PerTag)
    }

    /// Spend attributed to `period`; a stale counter belongs to an earlier month.
    pub fn spent_in(&self, period: &str) -> f64 {
        match &self.spend_period {
            Some(current) if current == period => self.monthly_spent,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetPlacement {
    ProductPage,
    Cart,
    Footer,
}

impl WidgetPlacement {
    pub const fn label(self) -> &'static str {
        match self {
            Self::ProductPage => "product_page",
            Self::Cart => "cart",
            Self::Footer => "footer",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "product_page" => Some(Self::ProductPage),
            "cart" => Some(Self::Cart),
            "footer" => Some(Self::Footer),
            _ => None,
        }
    }
}

/// Storefront widget presentation for a shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSettings {
    pub show_trees: bool,
    pub show_co2: bool,
    pub headline: String,
    pub accent_color: String,
    pub placement: WidgetPlacement,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            show_trees: true,
            show_co2: true,
            headline: DEFAULT_WIDGET_HEADLINE.to_string(),
            accent_color: DEFAULT_WIDGET_ACCENT.to_string(),
            placement: WidgetPlacement::Footer,
        }
    }
}

/// Subset of the Shopify order webhook payload the evaluator needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_price: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub product_id: Option<u64>,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub title: Option<String>,
}

/// Shopify sends money as strings; anything unparseable counts as zero.
pub(crate) fn lenient_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let amount = match raw {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    Ok(if amount.is_finite() { amount } else { 0.0 })
}

/// Accepts identifiers sent either as JSON strings or integers.
pub(crate) fn lenient_identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text.trim().to_string()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or integer identifier, found {other}"
        ))),
    }
}

/// Entry point that produced a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSource {
    Order,
    Flow,
    Loyalty,
}

impl ImpactSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Flow => "flow",
            Self::Loyalty => "loyalty",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "order" => Some(Self::Order),
            "flow" => Some(Self::Flow),
            "loyalty" => Some(Self::Loyalty),
            _ => None,
        }
    }
}

/// Ledger row awaiting insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewLedgerEntry {
    pub source: ImpactSource,
    pub shop_id: ShopId,
    pub reference_id: String,
    pub trees_planted: u32,
    pub co2_offset_kg: f64,
    pub metadata: Value,
}

/// Append-only fact in the shared impact ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactLedgerEntry {
    pub id: i64,
    pub source_system: String,
    pub source: ImpactSource,
    pub shop_id: ShopId,
    pub reference_id: String,
    pub trees_planted: u32,
    pub co2_offset_kg: f64,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Cost to add to a shop's monthly spend alongside a ledger write.
#[derive(Debug, Clone, PartialEq)]
pub struct SpendCharge {
    pub amount: f64,
    pub period: String,
}

/// Result of a guarded ledger write.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded { entry_id: i64, monthly_spent: f64 },
    Duplicate,
    BudgetExceeded,
}

/// One loyalty-points-to-trees conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoyaltyRedemption {
    pub shop_id: ShopId,
    pub customer_id: String,
    pub email: Option<String>,
    pub points_spent: u64,
    pub trees_planted: u32,
    pub loyalty_app: String,
    pub reference_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    PlantTrees,
    OffsetCarbon,
}

impl FlowAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlantTrees => "plant_trees",
            Self::OffsetCarbon => "offset_carbon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowActionStatus {
    Completed,
    Duplicate,
    Rejected,
}

impl FlowActionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
            Self::Rejected => "rejected",
        }
    }
}

/// Audit row for an automation-platform action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowActionLog {
    pub shop_id: ShopId,
    pub action: FlowAction,
    pub action_run_id: String,
    pub requested: f64,
    pub trees_planted: u32,
    pub co2_offset_kg: f64,
    pub cost: f64,
    pub status: FlowActionStatus,
    pub message: String,
}

/// Aggregate impact for one shop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImpactTotals {
    pub trees_planted: u64,
    pub co2_offset_kg: f64,
    pub entries: u64,
}

/// Loyalty redemption totals for one customer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CustomerImpact {
    pub customer_id: String,
    pub trees_planted: u64,
    pub points_spent: u64,
    pub redemptions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_total_accepts_strings_numbers_and_garbage() {
        let from_string: OrderPayload =
            serde_json::from_value(json!({ "id": 1, "total_price": "42.50" })).expect("parses");
        assert_eq!(from_string.total_price, 42.5);

        let from_number: OrderPayload =
            serde_json::from_value(json!({ "id": 2, "total_price": 12 })).expect("parses");
        assert_eq!(from_number.total_price, 12.0);

        let garbage: OrderPayload =
            serde_json::from_value(json!({ "id": 3, "total_price": "n/a" })).expect("parses");
        assert_eq!(garbage.total_price, 0.0);

        let missing: OrderPayload = serde_json::from_value(json!({ "id": 4 })).expect("parses");
        assert_eq!(missing.total_price, 0.0);
        assert!(missing.line_items.is_empty());
    }

    #[test]
    fn settings_spend_rolls_over_between_periods() {
        let settings = ShopSettings {
            monthly_spent: 12.5,
            spend_period: Some("2025-09".to_string()),
            ..ShopSettings::default()
        };
        assert_eq!(settings.spent_in("2025-09"), 12.5);
        assert_eq!(settings.spent_in("2025-10"), 0.0);
    }

    #[test]
    fn needs_tags_only_for_enabled_tag_rules() {
        let mut settings = ShopSettings {
            rules: vec![TriggerRule::new(TriggerKind::PerTag, 1.0)
                .with_tag("eco")
                .disabled()],
            ..ShopSettings::default()
        };
        assert!(!settings.needs_product_tags());

        settings.rules[0].enabled = true;
        assert!(settings.needs_product_tags());
    }

    #[test]
    fn rule_enabled_flag_defaults_to_true() {
        let rule: TriggerRule =
            serde_json::from_value(json!({ "kind": "threshold", "value": 25 })).expect("parses");
        assert!(rule.enabled);
        assert_eq!(rule.kind, TriggerKind::Threshold);
    }
}
