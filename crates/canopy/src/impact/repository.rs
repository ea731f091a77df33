use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{
    CustomerImpact, FlowActionLog, ImpactLedgerEntry, ImpactTotals, LoyaltyRedemption,
    NewLedgerEntry, RecordOutcome, Shop, ShopId, ShopRegistration, ShopSettings, SpendCharge,
    WidgetSettings,
};

/// Shop identity and per-shop configuration.
#[async_trait]
pub trait ShopStore: Send + Sync {
    /// Creates the shop with default settings, or reinstalls an existing one.
    async fn register_shop(&self, registration: ShopRegistration) -> Result<Shop, RepositoryError>;
    async fn find_shop(&self, domain: &str) -> Result<Option<Shop>, RepositoryError>;
    async fn mark_uninstalled(
        &self,
        shop_id: &ShopId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
    async fn settings(&self, shop_id: &ShopId) -> Result<ShopSettings, RepositoryError>;
    /// Persists configuration only; the spend counter is owned by the ledger.
    async fn save_settings(
        &self,
        shop_id: &ShopId,
        settings: &ShopSettings,
    ) -> Result<(), RepositoryError>;
    async fn set_paused(&self, shop_id: &ShopId, paused: bool) -> Result<(), RepositoryError>;
    async fn reset_monthly_spend(
        &self,
        shop_id: &ShopId,
        period: &str,
    ) -> Result<(), RepositoryError>;
    async fn widget_settings(&self, shop_id: &ShopId) -> Result<WidgetSettings, RepositoryError>;
    async fn save_widget_settings(
        &self,
        shop_id: &ShopId,
        widget: &WidgetSettings,
    ) -> Result<(), RepositoryError>;
    /// Drops everything but the shop's ledger rows, which stay for aggregate reporting.
    async fn redact_shop(&self, shop_id: &ShopId) -> Result<(), RepositoryError>;
}

/// The shared, append-only impact ledger and its spend bookkeeping.
#[async_trait]
pub trait ImpactLedger: Send + Sync {
    /// Inserts the entry and adds the charge to monthly spend atomically.
    ///
    /// A duplicate (source, shop, reference) is ignored without charging, and a
    /// charge that would exceed the shop's budget writes nothing.
    async fn record_impact(
        &self,
        entry: NewLedgerEntry,
        charge: SpendCharge,
    ) -> Result<RecordOutcome, RepositoryError>;
    /// Same as `record_impact`, also storing the redemption in the transaction.
    async fn record_redemption(
        &self,
        redemption: LoyaltyRedemption,
        entry: NewLedgerEntry,
        charge: SpendCharge,
    ) -> Result<RecordOutcome, RepositoryError>;
    async fn log_flow_action(&self, log: FlowActionLog) -> Result<(), RepositoryError>;
    async fn totals(&self, shop_id: &ShopId) -> Result<ImpactTotals, RepositoryError>;
    /// Newest first; all rows when `limit` is `None`.
    async fn entries(
        &self,
        shop_id: &ShopId,
        limit: Option<u32>,
    ) -> Result<Vec<ImpactLedgerEntry>, RepositoryError>;
    async fn customer_impact(
        &self,
        shop_id: &ShopId,
        customer_id: &str,
    ) -> Result<CustomerImpact, RepositoryError>;
    /// Anonymises a customer's redemptions, returning the rows touched.
    async fn redact_customer(
        &self,
        shop_id: &ShopId,
        customer_id: &str,
    ) -> Result<u64, RepositoryError>;
}

/// Everything the impact service needs from storage.
pub trait ImpactStore: ShopStore + ImpactLedger {}

impl<T> ImpactStore for T where T: ShopStore + ImpactLedger {}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("stored record is malformed: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outbound hook for merchants who asked to hear about exhausted budgets.
pub trait LimitNotifier: Send + Sync {
    fn limit_reached(&self, notice: LimitNotice) -> Result<(), NotifyError>;
}

/// Payload describing an order that hit the monthly budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitNotice {
    pub shop_domain: String,
    pub order_reference: String,
    pub monthly_budget: Option<f64>,
    pub monthly_spent: f64,
    pub requested: f64,
    pub paused: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}
