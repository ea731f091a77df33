use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use super::catalog::ProductTagResolver;
use super::domain::{FlowAction, ShopRegistration};
use super::export::ledger_csv;
use super::repository::{ImpactStore, LimitNotifier, RepositoryError};
use super::service::{
    FlowActionRequest, ImpactService, ImpactServiceError, LoyaltyCredentials, RedemptionRequest,
};
use super::settings::{SettingsUpdate, WidgetUpdate};
use super::webhook::{
    WebhookTopic, WebhookVerifier, HMAC_HEADER, SHOP_DOMAIN_HEADER, TOPIC_HEADER,
};

pub const LOYALTY_SHOP_HEADER: &str = "x-shop-domain";
pub const LOYALTY_KEY_HEADER: &str = "x-api-key";

/// Service plus the request-authentication material the HTTP layer needs.
pub struct ImpactApi<S, C, N> {
    service: ImpactService<S, C, N>,
    verifier: WebhookVerifier,
    admin_token: Option<String>,
}

impl<S, C, N> ImpactApi<S, C, N> {
    pub fn new(
        service: ImpactService<S, C, N>,
        verifier: WebhookVerifier,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            service,
            verifier,
            admin_token,
        }
    }

    pub fn service(&self) -> &ImpactService<S, C, N> {
        &self.service
    }
}

/// Router builder exposing webhook, loyalty, Flow, storefront and admin endpoints.
pub fn impact_router<S, C, N>(api: Arc<ImpactApi<S, C, N>>) -> Router
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let admin = Router::new()
        .route("/api/shops", post(register_handler::<S, C, N>))
        .route(
            "/api/shops/:shop/settings",
            get(settings_handler::<S, C, N>).put(update_settings_handler::<S, C, N>),
        )
        .route(
            "/api/shops/:shop/widget",
            get(widget_handler::<S, C, N>).put(update_widget_handler::<S, C, N>),
        )
        .route(
            "/api/shops/:shop/dashboard",
            get(dashboard_handler::<S, C, N>),
        )
        .route(
            "/api/shops/:shop/ledger.csv",
            get(ledger_export_handler::<S, C, N>),
        )
        .route(
            "/api/shops/:shop/spend/reset",
            post(reset_spend_handler::<S, C, N>),
        )
        .route(
            "/api/shops/:shop/loyalty/api-key",
            post(rotate_key_handler::<S, C, N>),
        )
        .route_layer(middleware::from_fn_with_state(
            api.clone(),
            require_admin::<S, C, N>,
        ));

    let storefront = Router::new()
        .route(
            "/api/storefront/impact",
            get(storefront_handler::<S, C, N>),
        )
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/webhooks", post(webhook_handler::<S, C, N>))
        .route("/api/loyalty/redeem", post(redeem_handler::<S, C, N>))
        .route("/api/loyalty/rates", get(rates_handler::<S, C, N>))
        .route(
            "/api/loyalty/impact/:customer_id",
            get(customer_impact_handler::<S, C, N>),
        )
        .route(
            "/api/flow/plant-trees",
            post(plant_trees_handler::<S, C, N>),
        )
        .route(
            "/api/flow/offset-carbon",
            post(offset_carbon_handler::<S, C, N>),
        )
        .merge(storefront)
        .merge(admin)
        .with_state(api)
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    let payload = json!({
        "error": message.into(),
    });
    (status, Json(payload)).into_response()
}

fn service_error_response(error: ImpactServiceError) -> Response {
    let status = match &error {
        ImpactServiceError::UnknownShop(_)
        | ImpactServiceError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        ImpactServiceError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        ImpactServiceError::ShopInactive(_) | ImpactServiceError::FeatureDisabled(_) => {
            StatusCode::FORBIDDEN
        }
        ImpactServiceError::InvalidRequest(_) | ImpactServiceError::Settings(_) => {
            StatusCode::BAD_REQUEST
        }
        ImpactServiceError::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        ImpactServiceError::Duplicate(_) => StatusCode::CONFLICT,
        ImpactServiceError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(error = %error, "request failed");
    }
    json_error(status, error.to_string())
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn loyalty_credentials(headers: &HeaderMap) -> Option<LoyaltyCredentials> {
    Some(LoyaltyCredentials {
        shop_domain: header_text(headers, LOYALTY_SHOP_HEADER)?.to_string(),
        api_key: header_text(headers, LOYALTY_KEY_HEADER)?.to_string(),
    })
}

fn missing_loyalty_headers() -> Response {
    json_error(
        StatusCode::UNAUTHORIZED,
        "X-Shop-Domain and X-Api-Key headers are required",
    )
}

async fn require_admin<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    request: Request,
    next: Next,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    if let Some(expected) = api.admin_token.as_deref() {
        let provided = header_text(request.headers(), header::AUTHORIZATION.as_str())
            .and_then(|value| value.strip_prefix("Bearer "));
        if provided.map(str::trim) != Some(expected) {
            return json_error(StatusCode::UNAUTHORIZED, "admin token required");
        }
    }
    next.run(request).await
}

pub(crate) async fn webhook_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    if !api.verifier.verify(&body, header_text(&headers, HMAC_HEADER)) {
        warn!("rejected webhook with invalid signature");
        return json_error(StatusCode::UNAUTHORIZED, "invalid webhook signature");
    }

    let (Some(topic), Some(shop_domain)) = (
        header_text(&headers, TOPIC_HEADER),
        header_text(&headers, SHOP_DOMAIN_HEADER),
    ) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "X-Shopify-Topic and X-Shopify-Shop-Domain headers are required",
        );
    };

    let topic = WebhookTopic::parse(topic);
    match api.service.handle_webhook(&topic, shop_domain, &body).await {
        Ok(outcome) => {
            let payload = json!({
                "status": outcome.label(),
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(error) => service_error_response(error),
    }
}

pub(crate) async fn redeem_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    headers: HeaderMap,
    payload: Result<Json<RedemptionRequest>, JsonRejection>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let Some(credentials) = loyalty_credentials(&headers) else {
        return missing_loyalty_headers();
    };
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match api.service.redeem_points(&credentials, request).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn rates_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    headers: HeaderMap,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let Some(credentials) = loyalty_credentials(&headers) else {
        return missing_loyalty_headers();
    };
    match api.service.loyalty_rates(&credentials).await {
        Ok(rates) => (StatusCode::OK, Json(rates)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn customer_impact_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(customer_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let Some(credentials) = loyalty_credentials(&headers) else {
        return missing_loyalty_headers();
    };
    match api.service.customer_impact(&credentials, &customer_id).await {
        Ok(impact) => (StatusCode::OK, Json(impact)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn flow_action<S, C, N>(
    api: &ImpactApi<S, C, N>,
    action: FlowAction,
    headers: &HeaderMap,
    body: &[u8],
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    if !api.verifier.verify(body, header_text(headers, HMAC_HEADER)) {
        warn!(action = action.as_str(), "rejected flow action with invalid signature");
        return json_error(StatusCode::UNAUTHORIZED, "invalid flow signature");
    }

    let request: FlowActionRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                format!("malformed flow action payload: {err}"),
            )
        }
    };

    match api.service.run_flow_action(action, request).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn plant_trees_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    flow_action(&api, FlowAction::PlantTrees, &headers, &body).await
}

async fn offset_carbon_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    flow_action(&api, FlowAction::OffsetCarbon, &headers, &body).await
}

#[derive(Debug, Deserialize)]
struct StorefrontQuery {
    shop: String,
}

async fn storefront_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Query(query): Query<StorefrontQuery>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    match api.service.storefront(&query.shop).await {
        Ok(impact) => (StatusCode::OK, Json(impact)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn register_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    payload: Result<Json<ShopRegistration>, JsonRejection>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let registration = match payload {
        Ok(Json(registration)) => registration,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match api.service.register_shop(registration).await {
        Ok(shop) => (StatusCode::CREATED, Json(shop)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn settings_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    match api.service.settings(&shop).await {
        Ok(settings) => (StatusCode::OK, Json(settings)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn update_settings_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
    payload: Result<Json<SettingsUpdate>, JsonRejection>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let update = match payload {
        Ok(Json(update)) => update,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match api.service.update_settings(&shop, update).await {
        Ok(settings) => (StatusCode::OK, Json(settings)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn widget_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    match api.service.widget(&shop).await {
        Ok(widget) => (StatusCode::OK, Json(widget)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn update_widget_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
    payload: Result<Json<WidgetUpdate>, JsonRejection>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let update = match payload {
        Ok(Json(update)) => update,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match api.service.update_widget(&shop, update).await {
        Ok(widget) => (StatusCode::OK, Json(widget)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn dashboard_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    match api.service.dashboard(&shop).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn ledger_export_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    let entries = match api.service.ledger_entries(&shop).await {
        Ok(entries) => entries,
        Err(error) => return service_error_response(error),
    };
    match ledger_csv(&entries) {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"ledger.csv\"",
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "ledger export failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn reset_spend_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    match api.service.reset_spend(&shop).await {
        Ok(settings) => (StatusCode::OK, Json(settings)).into_response(),
        Err(error) => service_error_response(error),
    }
}

async fn rotate_key_handler<S, C, N>(
    State(api): State<Arc<ImpactApi<S, C, N>>>,
    Path(shop): Path<String>,
) -> Response
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    match api.service.rotate_loyalty_key(&shop).await {
        Ok(key) => (StatusCode::OK, Json(key)).into_response(),
        Err(error) => service_error_response(error),
    }
}
