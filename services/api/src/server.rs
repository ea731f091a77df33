use crate::cli::ServeArgs;
use crate::infra::{build_service, AppState};
use crate::routes::with_operational_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use canopy::config::AppConfig;
use canopy::error::AppError;
use canopy::impact::{ImpactApi, WebhookVerifier};
use canopy::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    if config.shopify.api_secret.is_none() {
        warn!("SHOPIFY_API_SECRET is not set; webhooks and Flow actions will be rejected");
    }
    if config.admin_token.is_none() {
        warn!("APP_ADMIN_TOKEN is not set; admin routes are unauthenticated");
    }

    let service = build_service(&config).await?;
    let api = Arc::new(ImpactApi::new(
        service,
        WebhookVerifier::new(config.shopify.api_secret.clone()),
        config.admin_token.clone(),
    ));

    let app = with_operational_routes(api)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, database = %config.database.url, "canopy impact service ready");

    axum::serve(listener, app).await?;
    Ok(())
}
