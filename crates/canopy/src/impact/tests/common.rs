use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use serde_json::Value;

use crate::impact::catalog::{CatalogError, ProductTagResolver};
use crate::impact::domain::{
    ImpactLedgerEntry, LineItem, OrderPayload, Shop, ShopRegistration, ShopSettings,
};
use crate::impact::repository::{
    ImpactLedger, LimitNotice, LimitNotifier, NotifyError, ShopStore,
};
use crate::impact::rules::ProductTags;
use crate::impact::sqlite::SqliteImpactStore;
use crate::impact::webhook::{WebhookVerifier, HMAC_HEADER, SHOP_DOMAIN_HEADER, TOPIC_HEADER};
use crate::impact::{impact_router, ImpactApi, ImpactService};

pub(super) const SECRET: &str = "shpss_canopy_test";
pub(super) const SHOP: &str = "maple-and-moss.myshopify.com";
pub(super) const LOYALTY_KEY: &str = "loyalty-key-123";

pub(super) async fn memory_store() -> Arc<SqliteImpactStore> {
    Arc::new(
        SqliteImpactStore::in_memory()
            .await
            .expect("in-memory store opens"),
    )
}

pub(super) fn registration(domain: &str) -> ShopRegistration {
    ShopRegistration {
        domain: domain.to_string(),
        name: "Maple & Moss".to_string(),
        company_id: Some("company-42".to_string()),
        access_token: Some("shpat_test".to_string()),
    }
}

pub(super) async fn register(store: &SqliteImpactStore, domain: &str) -> Shop {
    store
        .register_shop(registration(domain))
        .await
        .expect("shop registers")
}

pub(super) async fn configure(
    store: &SqliteImpactStore,
    shop: &Shop,
    change: impl FnOnce(&mut ShopSettings),
) {
    let mut settings = store.settings(&shop.id).await.expect("settings load");
    change(&mut settings);
    store
        .save_settings(&shop.id, &settings)
        .await
        .expect("settings save");
}

pub(super) async fn enable_loyalty(store: &SqliteImpactStore, shop: &Shop) {
    configure(store, shop, |settings| {
        settings.loyalty_enabled = true;
        settings.loyalty_api_key = Some(LOYALTY_KEY.to_string());
    })
    .await;
}

pub(super) async fn ledger_rows(store: &SqliteImpactStore, shop: &Shop) -> Vec<ImpactLedgerEntry> {
    store.entries(&shop.id, None).await.expect("entries load")
}

pub(super) async fn flow_log_count(store: &SqliteImpactStore) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM flow_action_logs")
        .fetch_one(store.pool())
        .await
        .expect("count flow logs")
}

pub(super) fn order(id: i64, total: &str, items: &[(u64, u32)]) -> OrderPayload {
    OrderPayload {
        id,
        name: Some(format!("#{id}")),
        total_price: total.parse().expect("numeric total"),
        currency: Some("USD".to_string()),
        line_items: items
            .iter()
            .map(|(product_id, quantity)| LineItem {
                product_id: Some(*product_id),
                quantity: *quantity,
                title: None,
            })
            .collect(),
    }
}

#[derive(Default)]
pub(super) struct StaticCatalog {
    tags: ProductTags,
    lookups: Mutex<Vec<Vec<u64>>>,
}

impl StaticCatalog {
    pub(super) fn with_tags(entries: &[(u64, &[&str])]) -> Self {
        let tags = entries
            .iter()
            .map(|(id, tags)| (*id, tags.iter().map(|tag| tag.to_string()).collect()))
            .collect();
        Self {
            tags,
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn lookups(&self) -> Vec<Vec<u64>> {
        self.lookups.lock().expect("catalog mutex poisoned").clone()
    }
}

#[async_trait]
impl ProductTagResolver for StaticCatalog {
    async fn product_tags(
        &self,
        _shop: &Shop,
        product_ids: &[u64],
    ) -> Result<ProductTags, CatalogError> {
        self.lookups
            .lock()
            .expect("catalog mutex poisoned")
            .push(product_ids.to_vec());
        Ok(product_ids
            .iter()
            .filter_map(|id| self.tags.get(id).map(|tags| (*id, tags.clone())))
            .collect())
    }
}

pub(super) struct FailingCatalog;

#[async_trait]
impl ProductTagResolver for FailingCatalog {
    async fn product_tags(
        &self,
        _shop: &Shop,
        _product_ids: &[u64],
    ) -> Result<ProductTags, CatalogError> {
        Err(CatalogError::Status(503))
    }
}

#[derive(Default)]
pub(super) struct RecordingNotifier {
    notices: Mutex<Vec<LimitNotice>>,
}

impl RecordingNotifier {
    pub(super) fn notices(&self) -> Vec<LimitNotice> {
        self.notices.lock().expect("notifier mutex poisoned").clone()
    }
}

impl LimitNotifier for RecordingNotifier {
    fn limit_reached(&self, notice: LimitNotice) -> Result<(), NotifyError> {
        self.notices
            .lock()
            .expect("notifier mutex poisoned")
            .push(notice);
        Ok(())
    }
}

pub(super) struct Fixture<C = StaticCatalog> {
    pub(super) store: Arc<SqliteImpactStore>,
    pub(super) catalog: Arc<C>,
    pub(super) notifier: Arc<RecordingNotifier>,
    pub(super) service: ImpactService<SqliteImpactStore, C, RecordingNotifier>,
    pub(super) shop: Shop,
}

pub(super) async fn fixture() -> Fixture {
    fixture_with_catalog(StaticCatalog::default()).await
}

pub(super) async fn fixture_with_catalog<C>(catalog: C) -> Fixture<C>
where
    C: ProductTagResolver + 'static,
{
    let store = memory_store().await;
    let shop = register(&store, SHOP).await;
    let catalog = Arc::new(catalog);
    let notifier = Arc::new(RecordingNotifier::default());
    let service = ImpactService::new(store.clone(), catalog.clone(), notifier.clone());
    Fixture {
        store,
        catalog,
        notifier,
        service,
        shop,
    }
}

/// Router over a fresh store with one registered shop.
pub(super) async fn router_fixture(
    admin_token: Option<&str>,
) -> (Router, Arc<SqliteImpactStore>, Shop) {
    let store = memory_store().await;
    let shop = register(&store, SHOP).await;
    let service = ImpactService::new(
        store.clone(),
        Arc::new(StaticCatalog::default()),
        Arc::new(RecordingNotifier::default()),
    );
    let api = ImpactApi::new(
        service,
        WebhookVerifier::new(Some(SECRET.to_string())),
        admin_token.map(str::to_string),
    );
    (impact_router(Arc::new(api)), store, shop)
}

pub(super) fn sign(body: &[u8]) -> String {
    WebhookVerifier::new(Some(SECRET.to_string()))
        .sign(body)
        .expect("secret configured")
}

pub(super) fn webhook_request(topic: &str, shop_domain: &str, payload: &Value) -> Request<Body> {
    let body = serde_json::to_vec(payload).expect("serialize payload");
    Request::post("/webhooks")
        .header(header::CONTENT_TYPE, "application/json")
        .header(TOPIC_HEADER, topic)
        .header(SHOP_DOMAIN_HEADER, shop_domain)
        .header(HMAC_HEADER, sign(&body))
        .body(Body::from(body))
        .expect("request builds")
}

pub(super) fn signed_post(uri: &str, payload: &Value) -> Request<Body> {
    let body = serde_json::to_vec(payload).expect("serialize payload");
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(HMAC_HEADER, sign(&body))
        .body(Body::from(body))
        .expect("request builds")
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

pub(super) async fn read_text_body(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    String::from_utf8(body.to_vec()).expect("utf8 body")
}
