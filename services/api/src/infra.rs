use canopy::config::AppConfig;
use canopy::error::AppError;
use canopy::impact::{
    ImpactService, LimitNotice, LimitNotifier, NotifyError, ShopifyCatalogClient,
    SqliteImpactStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Surfaces exhausted budgets in the service logs, where the merchant
/// alerting pipeline picks them up.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TracingLimitNotifier;

impl LimitNotifier for TracingLimitNotifier {
    fn limit_reached(&self, notice: LimitNotice) -> Result<(), NotifyError> {
        warn!(
            target: "canopy::budget",
            shop = %notice.shop_domain,
            order = %notice.order_reference,
            monthly_budget = ?notice.monthly_budget,
            monthly_spent = notice.monthly_spent,
            requested = notice.requested,
            paused = notice.paused,
            "monthly planting budget reached"
        );
        Ok(())
    }
}

pub(crate) type CanopyService =
    ImpactService<SqliteImpactStore, ShopifyCatalogClient, TracingLimitNotifier>;

/// Opens the configured database and wires the impact service over it.
pub(crate) async fn build_service(config: &AppConfig) -> Result<CanopyService, AppError> {
    let store = SqliteImpactStore::connect(&config.database.url).await?;
    let catalog = ShopifyCatalogClient::new(
        config.shopify.api_version.clone(),
        config.shopify.catalog_timeout,
    )?;
    Ok(ImpactService::new(
        Arc::new(store),
        Arc::new(catalog),
        Arc::new(TracingLimitNotifier),
    ))
}
