use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::budget::{spend_period, SpendGuard};
use super::catalog::ProductTagResolver;
use super::defaults::{CO2_PER_TREE_KG, RECENT_ENTRY_LIMIT};
use super::domain::{
    lenient_identifier, CustomerImpact, FlowAction, FlowActionLog, FlowActionStatus,
    ImpactLedgerEntry, ImpactSource, LoyaltyRedemption, NewLedgerEntry, OrderEvent, OrderPayload,
    RecordOutcome, Shop, ShopRegistration, ShopSettings, SpendCharge, WidgetSettings,
};
use super::repository::{ImpactStore, LimitNotice, LimitNotifier, RepositoryError};
use super::rules::{product_ids, ProductTags, TreeCalculator};
use super::settings::{SettingsError, SettingsUpdate, WidgetUpdate};
use super::views::{
    DashboardView, FlowActionReceipt, LoyaltyKey, LoyaltyRates, RedemptionReceipt,
    StorefrontImpact,
};
use super::webhook::{CustomerPrivacyPayload, WebhookTopic};

/// Why an order webhook was acknowledged without planting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownShop,
    Uninstalled,
    Disabled,
    Paused,
    IgnoredEvent,
    BelowMinimum,
    NoTrees,
    Duplicate,
    BudgetExceeded,
}

impl SkipReason {
    pub const fn label(self) -> &'static str {
        match self {
            Self::UnknownShop => "unknown_shop",
            Self::Uninstalled => "uninstalled",
            Self::Disabled => "disabled",
            Self::Paused => "paused",
            Self::IgnoredEvent => "ignored_event",
            Self::BelowMinimum => "below_minimum",
            Self::NoTrees => "no_trees",
            Self::Duplicate => "duplicate",
            Self::BudgetExceeded => "budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Recorded {
        trees: u32,
        co2_offset_kg: f64,
        cost: f64,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Order(OrderOutcome),
    Uninstalled,
    ShopRedacted,
    CustomerRedacted { records: u64 },
    DataRequested { impact: Option<CustomerImpact> },
    Ignored,
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Order(OrderOutcome::Recorded { .. }) => "recorded",
            Self::Order(OrderOutcome::Skipped(reason)) => reason.label(),
            Self::Uninstalled => "uninstalled",
            Self::ShopRedacted => "shop_redacted",
            Self::CustomerRedacted { .. } => "customer_redacted",
            Self::DataRequested { .. } => "data_request_acknowledged",
            Self::Ignored => "ignored",
        }
    }
}

/// Per-shop credentials sent by the loyalty platform.
#[derive(Debug, Clone)]
pub struct LoyaltyCredentials {
    pub shop_domain: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRequest {
    #[serde(deserialize_with = "lenient_identifier")]
    pub customer_id: String,
    pub points_spent: u64,
    pub loyalty_app: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Body Shopify Flow posts to an action endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowActionRequest {
    pub shopify_domain: String,
    #[serde(default)]
    pub action_run_id: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
struct FlowPlan {
    requested: f64,
    trees: u32,
    co2_offset_kg: f64,
    cost: f64,
}

/// Orchestrates rule evaluation, the spend guard and ledger writes for every entry point.
pub struct ImpactService<S, C, N> {
    store: Arc<S>,
    catalog: Arc<C>,
    notifier: Arc<N>,
}

impl<S, C, N> ImpactService<S, C, N>
where
    S: ImpactStore + 'static,
    C: ProductTagResolver + 'static,
    N: LimitNotifier + 'static,
{
    pub fn new(store: Arc<S>, catalog: Arc<C>, notifier: Arc<N>) -> Self {
        Self {
            store,
            catalog,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Installs a shop, or reinstalls it keeping its settings.
    pub async fn register_shop(
        &self,
        mut registration: ShopRegistration,
    ) -> Result<Shop, ImpactServiceError> {
        registration.domain = normalize_domain(&registration.domain);
        if registration.domain.is_empty()
            || registration
                .domain
                .chars()
                .any(|c| c.is_whitespace() || c == '/')
        {
            return Err(ImpactServiceError::InvalidRequest(
                "shop domain must be a bare hostname".to_string(),
            ));
        }
        registration.name = registration.name.trim().to_string();
        if registration.name.is_empty() {
            registration.name = registration.domain.clone();
        }

        let shop = self.store.register_shop(registration).await?;
        info!(shop = %shop.domain, shop_id = %shop.id, "shop registered");
        Ok(shop)
    }

    async fn shop(&self, domain: &str) -> Result<Shop, ImpactServiceError> {
        let domain = normalize_domain(domain);
        self.store
            .find_shop(&domain)
            .await?
            .ok_or(ImpactServiceError::UnknownShop(domain))
    }

    async fn installed_shop(&self, domain: &str) -> Result<Shop, ImpactServiceError> {
        let shop = self.shop(domain).await?;
        if shop.is_installed() {
            Ok(shop)
        } else {
            Err(ImpactServiceError::UnknownShop(shop.domain))
        }
    }

    /// Routes a verified webhook to its handler.
    pub async fn handle_webhook(
        &self,
        topic: &WebhookTopic,
        shop_domain: &str,
        body: &[u8],
    ) -> Result<WebhookOutcome, ImpactServiceError> {
        match topic {
            WebhookTopic::OrdersPaid | WebhookTopic::OrdersCreate => {
                let event = topic.order_event().unwrap_or(OrderEvent::Paid);
                let order: OrderPayload = serde_json::from_slice(body).map_err(|err| {
                    ImpactServiceError::InvalidRequest(format!("malformed order payload: {err}"))
                })?;
                self.handle_order(shop_domain, event, order)
                    .await
                    .map(WebhookOutcome::Order)
            }
            WebhookTopic::AppUninstalled => Ok(if self.handle_uninstall(shop_domain).await? {
                WebhookOutcome::Uninstalled
            } else {
                WebhookOutcome::Ignored
            }),
            WebhookTopic::ShopRedact => Ok(if self.redact_shop(shop_domain).await? {
                WebhookOutcome::ShopRedacted
            } else {
                WebhookOutcome::Ignored
            }),
            WebhookTopic::CustomersRedact => {
                let payload = privacy_payload(body)?;
                let records = self
                    .redact_customer(shop_domain, &payload.customer.id)
                    .await?;
                Ok(WebhookOutcome::CustomerRedacted { records })
            }
            WebhookTopic::CustomersDataRequest => {
                let payload = privacy_payload(body)?;
                let impact = self
                    .customer_data_request(shop_domain, &payload.customer.id)
                    .await?;
                Ok(WebhookOutcome::DataRequested { impact })
            }
            WebhookTopic::Other(topic) => {
                debug!(%topic, shop = shop_domain, "ignoring unsubscribed webhook topic");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Order webhook state machine. Business stops are `Skipped`, never errors.
    pub async fn handle_order(
        &self,
        shop_domain: &str,
        event: OrderEvent,
        order: OrderPayload,
    ) -> Result<OrderOutcome, ImpactServiceError> {
        let domain = normalize_domain(shop_domain);
        let Some(shop) = self.store.find_shop(&domain).await? else {
            debug!(shop = %domain, order_id = order.id, "order for unknown shop");
            return Ok(skipped(SkipReason::UnknownShop));
        };
        if !shop.is_installed() {
            debug!(shop = %shop.domain, order_id = order.id, "order for uninstalled shop");
            return Ok(skipped(SkipReason::Uninstalled));
        }

        let settings = self.store.settings(&shop.id).await?;
        if !settings.is_enabled {
            debug!(shop = %shop.domain, order_id = order.id, "planting disabled");
            return Ok(skipped(SkipReason::Disabled));
        }
        if settings.is_paused {
            debug!(shop = %shop.domain, order_id = order.id, "planting paused");
            return Ok(skipped(SkipReason::Paused));
        }
        if settings.order_event != event {
            debug!(
                shop = %shop.domain,
                order_id = order.id,
                configured = settings.order_event.topic(),
                received = event.topic(),
                "order event not configured for planting"
            );
            return Ok(skipped(SkipReason::IgnoredEvent));
        }

        let tags = if settings.needs_product_tags() {
            self.resolve_tags(&shop, &order).await
        } else {
            ProductTags::new()
        };

        let calculation = TreeCalculator::from_settings(&settings).calculate(&order, &tags);
        if calculation.below_minimum {
            debug!(shop = %shop.domain, order_id = order.id, "order below minimum value");
            return Ok(skipped(SkipReason::BelowMinimum));
        }
        if calculation.trees == 0 {
            debug!(shop = %shop.domain, order_id = order.id, "rules produced no trees");
            return Ok(skipped(SkipReason::NoTrees));
        }

        let trees = calculation.trees;
        let cost = f64::from(trees) * settings.cost_per_tree;
        let co2_offset_kg = f64::from(trees) * CO2_PER_TREE_KG;
        let period = spend_period(Utc::now());
        let order_reference = order.id.to_string();

        let entry = NewLedgerEntry {
            source: ImpactSource::Order,
            shop_id: shop.id.clone(),
            reference_id: order_reference.clone(),
            trees_planted: trees,
            co2_offset_kg,
            metadata: json!({
                "shop_domain": shop.domain,
                "order_name": order.name,
                "order_total": order.total_price,
                "currency": order.currency,
                "order_event": event.topic(),
                "cost": cost,
                "rules": calculation.contributions,
            }),
        };
        let charge = SpendCharge {
            amount: cost,
            period: period.clone(),
        };

        match self.store.record_impact(entry, charge).await? {
            RecordOutcome::Recorded { monthly_spent, .. } => {
                info!(
                    shop = %shop.domain,
                    order_id = order.id,
                    trees,
                    cost,
                    monthly_spent,
                    "order impact recorded"
                );
                Ok(OrderOutcome::Recorded {
                    trees,
                    co2_offset_kg,
                    cost,
                })
            }
            RecordOutcome::Duplicate => {
                debug!(shop = %shop.domain, order_id = order.id, "order already recorded");
                Ok(skipped(SkipReason::Duplicate))
            }
            RecordOutcome::BudgetExceeded => {
                self.budget_exhausted(&shop, &settings, &order_reference, cost, &period)
                    .await?;
                Ok(skipped(SkipReason::BudgetExceeded))
            }
        }
    }

    async fn resolve_tags(&self, shop: &Shop, order: &OrderPayload) -> ProductTags {
        let ids = product_ids(order);
        if ids.is_empty() {
            return ProductTags::new();
        }
        match self.catalog.product_tags(shop, &ids).await {
            Ok(tags) => tags,
            Err(err) => {
                warn!(
                    shop = %shop.domain,
                    order_id = order.id,
                    error = %err,
                    "product tag lookup failed; tag rules contribute nothing"
                );
                ProductTags::new()
            }
        }
    }

    async fn budget_exhausted(
        &self,
        shop: &Shop,
        settings: &ShopSettings,
        order_reference: &str,
        requested: f64,
        period: &str,
    ) -> Result<(), ImpactServiceError> {
        let paused = !settings.auto_resume_monthly;
        let spent = SpendGuard::from_settings(settings, period).spent();
        warn!(
            shop = %shop.domain,
            order_id = order_reference,
            requested,
            monthly_spent = spent,
            monthly_budget = ?settings.monthly_budget,
            paused,
            "monthly budget exhausted; order not planted"
        );

        if paused {
            self.store.set_paused(&shop.id, true).await?;
        }

        if settings.notify_on_limit {
            let notice = LimitNotice {
                shop_domain: shop.domain.clone(),
                order_reference: order_reference.to_string(),
                monthly_budget: settings.monthly_budget,
                monthly_spent: spent,
                requested,
                paused,
            };
            if let Err(err) = self.notifier.limit_reached(notice) {
                warn!(shop = %shop.domain, error = %err, "budget limit notification failed");
            }
        }
        Ok(())
    }

    async fn loyalty_shop(
        &self,
        credentials: &LoyaltyCredentials,
    ) -> Result<(Shop, ShopSettings), ImpactServiceError> {
        let shop = self.installed_shop(&credentials.shop_domain).await?;
        let settings = self.store.settings(&shop.id).await?;

        let authorized = settings
            .loyalty_api_key
            .as_deref()
            .is_some_and(|expected| keys_match(expected, credentials.api_key.trim()));
        if !authorized {
            return Err(ImpactServiceError::InvalidCredentials);
        }
        if !settings.loyalty_enabled {
            return Err(ImpactServiceError::FeatureDisabled("loyalty redemptions"));
        }
        Ok((shop, settings))
    }

    /// Converts loyalty points into trees at the shop's points-per-tree rate.
    pub async fn redeem_points(
        &self,
        credentials: &LoyaltyCredentials,
        request: RedemptionRequest,
    ) -> Result<RedemptionReceipt, ImpactServiceError> {
        let (shop, settings) = self.loyalty_shop(credentials).await?;
        if !settings.is_enabled || settings.is_paused {
            return Err(ImpactServiceError::ShopInactive(shop.domain));
        }

        let customer_id = request.customer_id.trim().to_string();
        let loyalty_app = request.loyalty_app.trim().to_string();
        if customer_id.is_empty() || loyalty_app.is_empty() {
            return Err(ImpactServiceError::InvalidRequest(
                "customerId and loyaltyApp are required".to_string(),
            ));
        }

        let points_per_tree = u64::from(settings.points_per_tree.max(1));
        let trees = u32::try_from(request.points_spent / points_per_tree).map_err(|_| {
            ImpactServiceError::InvalidRequest("pointsSpent is too large".to_string())
        })?;
        if trees < 1 {
            return Err(ImpactServiceError::InvalidRequest(format!(
                "at least {points_per_tree} points are needed to plant one tree"
            )));
        }

        let cost = f64::from(trees) * settings.cost_per_tree;
        let co2_offset_kg = f64::from(trees) * CO2_PER_TREE_KG;
        let reference_id = request
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("loyalty-{}", Uuid::new_v4()));

        let redemption = LoyaltyRedemption {
            shop_id: shop.id.clone(),
            customer_id,
            email: request.email.clone(),
            points_spent: request.points_spent,
            trees_planted: trees,
            loyalty_app: loyalty_app.clone(),
            reference_id: reference_id.clone(),
            created_at: Utc::now(),
        };
        let entry = NewLedgerEntry {
            source: ImpactSource::Loyalty,
            shop_id: shop.id.clone(),
            reference_id: reference_id.clone(),
            trees_planted: trees,
            co2_offset_kg,
            // No customer identifiers here; redaction only rewrites redemptions.
            metadata: json!({
                "shop_domain": shop.domain,
                "loyalty_app": loyalty_app,
                "points_spent": request.points_spent,
                "cost": cost,
            }),
        };
        let charge = SpendCharge {
            amount: cost,
            period: spend_period(Utc::now()),
        };

        match self
            .store
            .record_redemption(redemption, entry, charge)
            .await?
        {
            RecordOutcome::Recorded { .. } => {
                info!(
                    shop = %shop.domain,
                    loyalty_app = %loyalty_app,
                    trees,
                    cost,
                    "loyalty redemption recorded"
                );
                Ok(RedemptionReceipt {
                    success: true,
                    reference_id,
                    points_spent: request.points_spent,
                    trees_planted: trees,
                    co2_offset_kg,
                    cost,
                    message: format!("{trees} tree(s) will be planted"),
                })
            }
            RecordOutcome::Duplicate => Err(ImpactServiceError::Duplicate(reference_id)),
            RecordOutcome::BudgetExceeded => {
                warn!(shop = %shop.domain, cost, "loyalty redemption exceeds monthly budget");
                Err(ImpactServiceError::BudgetExceeded { requested: cost })
            }
        }
    }

    pub async fn loyalty_rates(
        &self,
        credentials: &LoyaltyCredentials,
    ) -> Result<LoyaltyRates, ImpactServiceError> {
        let (_, settings) = self.loyalty_shop(credentials).await?;
        Ok(LoyaltyRates {
            points_per_tree: settings.points_per_tree,
            cost_per_tree: settings.cost_per_tree,
            co2_per_tree_kg: CO2_PER_TREE_KG,
        })
    }

    pub async fn customer_impact(
        &self,
        credentials: &LoyaltyCredentials,
        customer_id: &str,
    ) -> Result<CustomerImpact, ImpactServiceError> {
        let (shop, _) = self.loyalty_shop(credentials).await?;
        Ok(self
            .store
            .customer_impact(&shop.id, customer_id.trim())
            .await?)
    }

    /// Runs a Flow action and appends its audit row, whatever the outcome.
    pub async fn run_flow_action(
        &self,
        action: FlowAction,
        request: FlowActionRequest,
    ) -> Result<FlowActionReceipt, ImpactServiceError> {
        let shop = self.installed_shop(&request.shopify_domain).await?;
        let settings = self.store.settings(&shop.id).await?;
        let action_run_id = request
            .action_run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("flow-{}", Uuid::new_v4()));

        let plan = if !settings.is_enabled || settings.is_paused {
            Err(ImpactServiceError::ShopInactive(shop.domain.clone()))
        } else {
            flow_plan(action, &settings, &request.properties)
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(error) => {
                return Err(self
                    .reject_flow(&shop, action, &action_run_id, FlowPlan::default(), error)
                    .await);
            }
        };

        let entry = NewLedgerEntry {
            source: ImpactSource::Flow,
            shop_id: shop.id.clone(),
            reference_id: action_run_id.clone(),
            trees_planted: plan.trees,
            co2_offset_kg: plan.co2_offset_kg,
            metadata: json!({
                "shop_domain": shop.domain,
                "action": action.as_str(),
                "requested": plan.requested,
                "cost": plan.cost,
            }),
        };
        let charge = SpendCharge {
            amount: plan.cost,
            period: spend_period(Utc::now()),
        };

        let (status, message) = match self.store.record_impact(entry, charge).await? {
            RecordOutcome::Recorded { .. } => {
                info!(
                    shop = %shop.domain,
                    action = action.as_str(),
                    trees = plan.trees,
                    co2_offset_kg = plan.co2_offset_kg,
                    cost = plan.cost,
                    "flow action recorded"
                );
                let message = match action {
                    FlowAction::PlantTrees => format!("{} tree(s) will be planted", plan.trees),
                    FlowAction::OffsetCarbon => {
                        format!("{:.2} kg of CO2 will be offset", plan.co2_offset_kg)
                    }
                };
                (FlowActionStatus::Completed, message)
            }
            RecordOutcome::Duplicate => (
                FlowActionStatus::Duplicate,
                "action run already processed".to_string(),
            ),
            RecordOutcome::BudgetExceeded => {
                warn!(
                    shop = %shop.domain,
                    action = action.as_str(),
                    cost = plan.cost,
                    "flow action exceeds monthly budget"
                );
                let error = ImpactServiceError::BudgetExceeded {
                    requested: plan.cost,
                };
                return Err(self
                    .reject_flow(&shop, action, &action_run_id, plan, error)
                    .await);
            }
        };

        self.log_flow(&shop, action, &action_run_id, plan, status, message.clone())
            .await?;

        Ok(FlowActionReceipt {
            success: true,
            action,
            action_run_id,
            status,
            trees_planted: plan.trees,
            co2_offset_kg: plan.co2_offset_kg,
            cost: plan.cost,
            message,
        })
    }

    /// Audits a rejected run; the caller's error wins over an audit failure.
    async fn reject_flow(
        &self,
        shop: &Shop,
        action: FlowAction,
        action_run_id: &str,
        plan: FlowPlan,
        error: ImpactServiceError,
    ) -> ImpactServiceError {
        let logged = self
            .log_flow(
                shop,
                action,
                action_run_id,
                plan,
                FlowActionStatus::Rejected,
                error.to_string(),
            )
            .await;
        if let Err(log_error) = logged {
            warn!(
                shop = %shop.domain,
                action = action.as_str(),
                action_run_id,
                error = %log_error,
                "failed to audit rejected flow action"
            );
        }
        error
    }

    async fn log_flow(
        &self,
        shop: &Shop,
        action: FlowAction,
        action_run_id: &str,
        plan: FlowPlan,
        status: FlowActionStatus,
        message: String,
    ) -> Result<(), ImpactServiceError> {
        self.store
            .log_flow_action(FlowActionLog {
                shop_id: shop.id.clone(),
                action,
                action_run_id: action_run_id.to_string(),
                requested: plan.requested,
                trees_planted: plan.trees,
                co2_offset_kg: plan.co2_offset_kg,
                cost: plan.cost,
                status,
                message,
            })
            .await?;
        Ok(())
    }

    pub async fn settings(&self, shop_domain: &str) -> Result<ShopSettings, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        Ok(self.store.settings(&shop.id).await?)
    }

    pub async fn update_settings(
        &self,
        shop_domain: &str,
        update: SettingsUpdate,
    ) -> Result<ShopSettings, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        let mut settings = self.store.settings(&shop.id).await?;
        update.apply_to(&mut settings)?;
        self.store.save_settings(&shop.id, &settings).await?;
        info!(shop = %shop.domain, rules = settings.rules.len(), "settings updated");
        Ok(self.store.settings(&shop.id).await?)
    }

    pub async fn widget(&self, shop_domain: &str) -> Result<WidgetSettings, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        Ok(self.store.widget_settings(&shop.id).await?)
    }

    pub async fn update_widget(
        &self,
        shop_domain: &str,
        update: WidgetUpdate,
    ) -> Result<WidgetSettings, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        let mut widget = self.store.widget_settings(&shop.id).await?;
        update.apply_to(&mut widget)?;
        self.store.save_widget_settings(&shop.id, &widget).await?;
        Ok(widget)
    }

    pub async fn dashboard(&self, shop_domain: &str) -> Result<DashboardView, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        let settings = self.store.settings(&shop.id).await?;
        let period = spend_period(Utc::now());
        let guard = SpendGuard::from_settings(&settings, &period);
        let totals = self.store.totals(&shop.id).await?;
        let recent_entries = self
            .store
            .entries(&shop.id, Some(RECENT_ENTRY_LIMIT))
            .await?;

        Ok(DashboardView {
            shop,
            period,
            totals,
            monthly: guard.progress(),
            remaining_trees: guard.remaining_trees(settings.cost_per_tree),
            recent_entries,
            settings,
        })
    }

    pub async fn storefront(
        &self,
        shop_domain: &str,
    ) -> Result<StorefrontImpact, ImpactServiceError> {
        let shop = self.installed_shop(shop_domain).await?;
        let totals = self.store.totals(&shop.id).await?;
        let widget = self.store.widget_settings(&shop.id).await?;
        Ok(StorefrontImpact::new(shop.domain, &totals, widget))
    }

    pub async fn ledger_entries(
        &self,
        shop_domain: &str,
    ) -> Result<Vec<ImpactLedgerEntry>, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        Ok(self.store.entries(&shop.id, None).await?)
    }

    /// Zeroes month-to-date spend for the current period.
    pub async fn reset_spend(
        &self,
        shop_domain: &str,
    ) -> Result<ShopSettings, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        let period = spend_period(Utc::now());
        self.store.reset_monthly_spend(&shop.id, &period).await?;
        info!(shop = %shop.domain, %period, "monthly spend reset");
        Ok(self.store.settings(&shop.id).await?)
    }

    pub async fn rotate_loyalty_key(
        &self,
        shop_domain: &str,
    ) -> Result<LoyaltyKey, ImpactServiceError> {
        let shop = self.shop(shop_domain).await?;
        let mut settings = self.store.settings(&shop.id).await?;
        let api_key = Uuid::new_v4().simple().to_string();
        settings.loyalty_api_key = Some(api_key.clone());
        self.store.save_settings(&shop.id, &settings).await?;
        info!(shop = %shop.domain, "loyalty api key rotated");
        Ok(LoyaltyKey { api_key })
    }

    /// Returns `false` when the shop is unknown.
    pub async fn handle_uninstall(&self, shop_domain: &str) -> Result<bool, ImpactServiceError> {
        let domain = normalize_domain(shop_domain);
        let Some(shop) = self.store.find_shop(&domain).await? else {
            return Ok(false);
        };
        self.store.mark_uninstalled(&shop.id, Utc::now()).await?;
        info!(shop = %shop.domain, "shop uninstalled");
        Ok(true)
    }

    /// Removes shop data; ledger rows are kept for aggregate reporting.
    pub async fn redact_shop(&self, shop_domain: &str) -> Result<bool, ImpactServiceError> {
        let domain = normalize_domain(shop_domain);
        let Some(shop) = self.store.find_shop(&domain).await? else {
            return Ok(false);
        };
        self.store.redact_shop(&shop.id).await?;
        info!(shop = %shop.domain, "shop data redacted");
        Ok(true)
    }

    pub async fn redact_customer(
        &self,
        shop_domain: &str,
        customer_id: &str,
    ) -> Result<u64, ImpactServiceError> {
        let domain = normalize_domain(shop_domain);
        let Some(shop) = self.store.find_shop(&domain).await? else {
            return Ok(0);
        };
        let records = self.store.redact_customer(&shop.id, customer_id).await?;
        info!(shop = %shop.domain, records, "customer redemptions redacted");
        Ok(records)
    }

    pub async fn customer_data_request(
        &self,
        shop_domain: &str,
        customer_id: &str,
    ) -> Result<Option<CustomerImpact>, ImpactServiceError> {
        let domain = normalize_domain(shop_domain);
        let Some(shop) = self.store.find_shop(&domain).await? else {
            return Ok(None);
        };
        let impact = self.store.customer_impact(&shop.id, customer_id).await?;
        info!(
            shop = %shop.domain,
            redemptions = impact.redemptions,
            "customer data request acknowledged"
        );
        Ok(Some(impact))
    }
}

fn skipped(reason: SkipReason) -> OrderOutcome {
    OrderOutcome::Skipped(reason)
}

pub(crate) fn normalize_domain(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn keys_match(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    expected.len() == provided.len()
        && expected
            .iter()
            .zip(provided)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

fn privacy_payload(body: &[u8]) -> Result<CustomerPrivacyPayload, ImpactServiceError> {
    serde_json::from_slice(body).map_err(|err| {
        ImpactServiceError::InvalidRequest(format!("malformed privacy payload: {err}"))
    })
}

fn numeric_property(
    properties: &Map<String, Value>,
    key: &str,
) -> Result<f64, ImpactServiceError> {
    let value = properties.get(key).ok_or_else(|| {
        ImpactServiceError::InvalidRequest(format!("properties.{key} is required"))
    })?;
    let amount = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    amount.filter(|amount| amount.is_finite()).ok_or_else(|| {
        ImpactServiceError::InvalidRequest(format!("properties.{key} must be a number"))
    })
}

fn flow_plan(
    action: FlowAction,
    settings: &ShopSettings,
    properties: &Map<String, Value>,
) -> Result<FlowPlan, ImpactServiceError> {
    match action {
        FlowAction::PlantTrees => {
            let requested = numeric_property(properties, "tree_count")?;
            if requested < 1.0 || requested.fract() != 0.0 || requested > f64::from(u32::MAX) {
                return Err(ImpactServiceError::InvalidRequest(
                    "properties.tree_count must be a whole number of at least 1".to_string(),
                ));
            }
            let trees = requested as u32;
            Ok(FlowPlan {
                requested,
                trees,
                co2_offset_kg: f64::from(trees) * CO2_PER_TREE_KG,
                cost: f64::from(trees) * settings.cost_per_tree,
            })
        }
        FlowAction::OffsetCarbon => {
            let requested = numeric_property(properties, "kg_co2")?;
            if requested <= 0.0 {
                return Err(ImpactServiceError::InvalidRequest(
                    "properties.kg_co2 must be greater than zero".to_string(),
                ));
            }
            Ok(FlowPlan {
                requested,
                trees: 0,
                co2_offset_kg: requested,
                cost: requested * settings.cost_per_kg_co2,
            })
        }
    }
}

/// Error raised by the impact service.
#[derive(Debug, thiserror::Error)]
pub enum ImpactServiceError {
    #[error("shop {0} is not installed")]
    UnknownShop(String),
    #[error("shop {0} has planting disabled or paused")]
    ShopInactive(String),
    #[error("invalid shop credentials")]
    InvalidCredentials,
    #[error("{0} are not enabled for this shop")]
    FeatureDisabled(&'static str),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("monthly budget exhausted (requested {requested:.2})")]
    BudgetExceeded { requested: f64 },
    #[error("reference {0} was already redeemed")]
    Duplicate(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
