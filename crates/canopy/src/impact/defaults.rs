//! Default values shared by every entry point.

/// Kilograms of CO2 a planted tree is credited with.
pub const CO2_PER_TREE_KG: f64 = 20.0;

pub const DEFAULT_COST_PER_TREE: f64 = 0.50;
pub const DEFAULT_COST_PER_KG_CO2: f64 = 0.02;
pub const DEFAULT_TREES_PER_ORDER: f64 = 1.0;
pub const DEFAULT_POINTS_PER_TREE: u32 = 100;

/// Ledger discriminator for rows written by this integration.
pub const SOURCE_SYSTEM: &str = "shopify";

pub const DEFAULT_WIDGET_HEADLINE: &str = "We plant trees with every order";
pub const DEFAULT_WIDGET_ACCENT: &str = "#2e7d32";

/// Ledger rows shown on the dashboard.
pub const RECENT_ENTRY_LIMIT: u32 = 10;
