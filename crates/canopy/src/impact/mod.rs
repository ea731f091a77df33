//! Order-driven tree planting: rule evaluation, the monthly spend guard and
//! the shared impact ledger, plus the HTTP surface Shopify, loyalty apps and
//! Flow talk to.

pub mod budget;
pub mod catalog;
pub mod defaults;
pub mod domain;
pub mod export;
pub mod repository;
pub mod router;
pub mod rules;
pub mod service;
pub mod settings;
pub mod sqlite;
pub mod views;
pub mod webhook;

#[cfg(test)]
mod tests;

pub use budget::{spend_period, MonthlyProgress, SpendGuard};
pub use catalog::{CatalogError, ProductTagResolver, ShopifyCatalogClient};
pub use domain::{
    CustomerImpact, FlowAction, FlowActionLog, FlowActionStatus, ImpactLedgerEntry,
    ImpactSource, ImpactTotals, LineItem, LoyaltyRedemption, NewLedgerEntry, OrderEvent,
    OrderPayload, RecordOutcome, Shop, ShopId, ShopRegistration, ShopSettings, SpendCharge,
    TriggerKind, TriggerRule, WidgetPlacement, WidgetSettings,
};
pub use export::{ledger_csv, write_ledger_csv, ExportError};
pub use repository::{
    ImpactLedger, ImpactStore, LimitNotice, LimitNotifier, NotifyError, RepositoryError,
    ShopStore,
};
pub use router::{impact_router, ImpactApi};
pub use rules::{ProductTags, RuleContribution, TreeCalculation, TreeCalculator};
pub use service::{
    FlowActionRequest, ImpactService, ImpactServiceError, LoyaltyCredentials, OrderOutcome,
    RedemptionRequest, SkipReason, WebhookOutcome,
};
pub use settings::{SettingsError, SettingsUpdate, WidgetUpdate};
pub use sqlite::SqliteImpactStore;
pub use views::{
    DashboardView, FlowActionReceipt, LoyaltyKey, LoyaltyRates, RedemptionReceipt,
    StorefrontImpact,
};
pub use webhook::{WebhookTopic, WebhookVerifier};
