//! Read models returned by the admin, storefront, loyalty and Flow endpoints.

use serde::Serialize;

use super::budget::MonthlyProgress;
use super::domain::{
    FlowAction, FlowActionStatus, ImpactLedgerEntry, ImpactTotals, Shop, ShopSettings,
    WidgetSettings,
};

/// Admin dashboard summary for one shop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub shop: Shop,
    pub period: String,
    pub totals: ImpactTotals,
    pub monthly: MonthlyProgress,
    /// Trees the remaining budget still covers; `None` without a budget.
    pub remaining_trees: Option<u32>,
    pub recent_entries: Vec<ImpactLedgerEntry>,
    pub settings: ShopSettings,
}

/// Public impact numbers for the storefront widget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorefrontImpact {
    pub shop_domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trees_planted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2_offset_kg: Option<f64>,
    pub widget: WidgetSettings,
}

impl StorefrontImpact {
    pub fn new(shop_domain: String, totals: &ImpactTotals, widget: WidgetSettings) -> Self {
        Self {
            shop_domain,
            trees_planted: widget.show_trees.then_some(totals.trees_planted),
            co2_offset_kg: widget.show_co2.then_some(totals.co2_offset_kg),
            widget,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyRates {
    pub points_per_tree: u32,
    pub cost_per_tree: f64,
    pub co2_per_tree_kg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionReceipt {
    pub success: bool,
    pub reference_id: String,
    pub points_spent: u64,
    pub trees_planted: u32,
    pub co2_offset_kg: f64,
    pub cost: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowActionReceipt {
    pub success: bool,
    pub action: FlowAction,
    pub action_run_id: String,
    pub status: FlowActionStatus,
    pub trees_planted: u32,
    pub co2_offset_kg: f64,
    pub cost: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoyaltyKey {
    pub api_key: String,
}
