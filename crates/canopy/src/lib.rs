//! Tree-planting and carbon-offset impact tracking for Shopify merchants.
//!
//! Order webhooks, loyalty redemptions and Flow actions are turned into tree
//! counts by merchant-configured trigger rules, guarded by a monthly budget and
//! appended to a shared impact ledger.

pub mod config;
pub mod error;
pub mod impact;
pub mod telemetry;
