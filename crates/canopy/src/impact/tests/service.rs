use serde_json::{json, Map, Value};

use super::common::*;
use crate::impact::domain::{
    FlowAction, FlowActionStatus, ImpactSource, OrderEvent, ShopRegistration, TriggerKind,
    TriggerRule,
};
use crate::impact::repository::{ImpactLedger, ShopStore};
use crate::impact::service::{
    FlowActionRequest, ImpactServiceError, LoyaltyCredentials, OrderOutcome, RedemptionRequest,
    SkipReason, WebhookOutcome,
};
use crate::impact::settings::SettingsUpdate;
use crate::impact::webhook::WebhookTopic;

fn credentials(api_key: &str) -> LoyaltyCredentials {
    LoyaltyCredentials {
        shop_domain: SHOP.to_string(),
        api_key: api_key.to_string(),
    }
}

fn redemption(points: u64, external_id: Option<&str>) -> RedemptionRequest {
    RedemptionRequest {
        customer_id: "cust-1".to_string(),
        points_spent: points,
        loyalty_app: "smile".to_string(),
        external_id: external_id.map(str::to_string),
        email: Some("ivy@example.com".to_string()),
    }
}

fn flow_request(run_id: Option<&str>, properties: Value) -> FlowActionRequest {
    let properties: Map<String, Value> = match properties {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    FlowActionRequest {
        shopify_domain: SHOP.to_string(),
        action_run_id: run_id.map(str::to_string),
        properties,
    }
}

#[tokio::test]
async fn default_settings_plant_one_tree_per_paid_order() {
    let fx = fixture().await;

    let outcome = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(1001, "42.00", &[(11, 2)]))
        .await
        .expect("order handled");

    assert_eq!(
        outcome,
        OrderOutcome::Recorded {
            trees: 1,
            co2_offset_kg: 20.0,
            cost: 0.5
        }
    );
    let rows = ledger_rows(&fx.store, &fx.shop).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source, ImpactSource::Order);
    assert_eq!(rows[0].reference_id, "1001");
    assert_eq!(rows[0].metadata["order_name"], "#1001");

    let settings = fx.store.settings(&fx.shop.id).await.expect("settings");
    assert_eq!(settings.monthly_spent, 0.5);
}

#[tokio::test]
async fn shop_domain_is_matched_case_insensitively() {
    let fx = fixture().await;
    let outcome = fx
        .service
        .handle_order(
            "  Maple-And-Moss.myshopify.com ",
            OrderEvent::Paid,
            order(5, "10.00", &[]),
        )
        .await
        .expect("order handled");
    assert!(matches!(outcome, OrderOutcome::Recorded { .. }));
}

#[tokio::test]
async fn disabled_and_paused_shops_write_nothing() {
    let fx = fixture().await;

    configure(&fx.store, &fx.shop, |settings| settings.is_enabled = false).await;
    let disabled = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(1, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(disabled, OrderOutcome::Skipped(SkipReason::Disabled));

    configure(&fx.store, &fx.shop, |settings| {
        settings.is_enabled = true;
        settings.is_paused = true;
    })
    .await;
    let paused = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(2, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(paused, OrderOutcome::Skipped(SkipReason::Paused));

    assert!(ledger_rows(&fx.store, &fx.shop).await.is_empty());
}

#[tokio::test]
async fn redelivered_order_is_recorded_once() {
    let fx = fixture().await;

    for _ in 0..3 {
        fx.service
            .handle_order(SHOP, OrderEvent::Paid, order(77, "30.00", &[]))
            .await
            .expect("order handled");
    }

    let last = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(77, "30.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(last, OrderOutcome::Skipped(SkipReason::Duplicate));
    assert_eq!(ledger_rows(&fx.store, &fx.shop).await.len(), 1);
    assert_eq!(
        fx.store.settings(&fx.shop.id).await.expect("settings").monthly_spent,
        0.5
    );
}

#[tokio::test]
async fn event_not_configured_for_planting_is_ignored() {
    let fx = fixture().await;

    let outcome = fx
        .service
        .handle_order(SHOP, OrderEvent::Created, order(3, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(outcome, OrderOutcome::Skipped(SkipReason::IgnoredEvent));
}

#[tokio::test]
async fn legacy_minimum_order_value_gates_the_single_trigger() {
    let fx = fixture().await;
    let update: SettingsUpdate = serde_json::from_value(json!({
        "trigger_type": "fixed",
        "trigger_value": 1,
        "minimum_order_value": 50
    }))
    .expect("update parses");
    fx.service
        .update_settings(SHOP, update)
        .await
        .expect("settings saved");

    let outcome = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(4, "49.99", &[]))
        .await
        .expect("order handled");
    assert_eq!(outcome, OrderOutcome::Skipped(SkipReason::BelowMinimum));
}

#[tokio::test]
async fn shop_minimum_does_not_gate_a_rule_list() {
    let fx = fixture().await;
    configure(&fx.store, &fx.shop, |settings| {
        settings.minimum_order_value = Some(50.0);
        settings.rules = vec![
            TriggerRule::new(TriggerKind::Fixed, 1.0),
            TriggerRule::new(TriggerKind::Threshold, 10.0).with_minimum(100.0),
        ];
    })
    .await;

    let outcome = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(4, "49.99", &[]))
        .await
        .expect("order handled");
    assert!(matches!(outcome, OrderOutcome::Recorded { trees: 1, .. }));
}

#[tokio::test]
async fn unknown_and_uninstalled_shops_are_skipped() {
    let fx = fixture().await;

    let unknown = fx
        .service
        .handle_order("nobody.myshopify.com", OrderEvent::Paid, order(1, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(unknown, OrderOutcome::Skipped(SkipReason::UnknownShop));

    assert!(fx.service.handle_uninstall(SHOP).await.expect("uninstall"));
    let uninstalled = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(2, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(uninstalled, OrderOutcome::Skipped(SkipReason::Uninstalled));
}

#[tokio::test]
async fn tag_rules_resolve_tags_from_the_catalog() {
    let fx = fixture_with_catalog(StaticCatalog::with_tags(&[
        (11, &["Eco", "summer"]),
        (12, &["winter"]),
    ]))
    .await;
    configure(&fx.store, &fx.shop, |settings| {
        settings.rules = vec![TriggerRule::new(TriggerKind::PerTag, 2.0).with_tag("eco")];
    })
    .await;

    let outcome = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(9, "80.00", &[(11, 3), (12, 1), (11, 1)]))
        .await
        .expect("order handled");

    assert_eq!(
        outcome,
        OrderOutcome::Recorded {
            trees: 8,
            co2_offset_kg: 160.0,
            cost: 4.0
        }
    );
    assert_eq!(fx.catalog.lookups(), vec![vec![11, 12]]);
}

#[tokio::test]
async fn catalog_is_not_consulted_without_tag_rules() {
    let fx = fixture().await;
    fx.service
        .handle_order(SHOP, OrderEvent::Paid, order(9, "80.00", &[(11, 3)]))
        .await
        .expect("order handled");
    assert!(fx.catalog.lookups().is_empty());
}

#[tokio::test]
async fn catalog_failure_leaves_tag_rules_empty() {
    let fx = fixture_with_catalog(FailingCatalog).await;
    configure(&fx.store, &fx.shop, |settings| {
        settings.rules = vec![TriggerRule::new(TriggerKind::PerTag, 1.0).with_tag("eco")];
    })
    .await;

    let outcome = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(9, "80.00", &[(11, 3)]))
        .await
        .expect("catalog errors are not fatal");
    assert_eq!(outcome, OrderOutcome::Skipped(SkipReason::NoTrees));
}

#[tokio::test]
async fn exhausted_budget_pauses_and_notifies() {
    let fx = fixture().await;
    configure(&fx.store, &fx.shop, |settings| {
        settings.monthly_budget = Some(1.0);
        settings.auto_resume_monthly = false;
    })
    .await;

    for id in [1, 2] {
        let outcome = fx
            .service
            .handle_order(SHOP, OrderEvent::Paid, order(id, "10.00", &[]))
            .await
            .expect("order handled");
        assert!(matches!(outcome, OrderOutcome::Recorded { .. }));
    }
    let rejected = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(3, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(rejected, OrderOutcome::Skipped(SkipReason::BudgetExceeded));

    assert_eq!(ledger_rows(&fx.store, &fx.shop).await.len(), 2);
    let settings = fx.store.settings(&fx.shop.id).await.expect("settings");
    assert!(settings.is_paused);
    assert_eq!(settings.monthly_spent, 1.0);

    let notices = fx.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].order_reference, "3");
    assert_eq!(notices[0].requested, 0.5);
    assert!(notices[0].paused);

    let after_pause = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(4, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(after_pause, OrderOutcome::Skipped(SkipReason::Paused));
}

#[tokio::test]
async fn auto_resuming_shop_stays_active_and_can_stay_quiet() {
    let fx = fixture().await;
    configure(&fx.store, &fx.shop, |settings| {
        settings.monthly_budget = Some(0.25);
        settings.notify_on_limit = false;
    })
    .await;

    let rejected = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(1, "10.00", &[]))
        .await
        .expect("order handled");
    assert_eq!(rejected, OrderOutcome::Skipped(SkipReason::BudgetExceeded));

    let settings = fx.store.settings(&fx.shop.id).await.expect("settings");
    assert!(!settings.is_paused);
    assert!(fx.notifier.notices().is_empty());
}

#[tokio::test]
async fn webhook_dispatch_covers_lifecycle_topics() {
    let fx = fixture().await;

    let unsubscribed = fx
        .service
        .handle_webhook(&WebhookTopic::parse("products/update"), SHOP, b"{}")
        .await
        .expect("handled");
    assert_eq!(unsubscribed, WebhookOutcome::Ignored);

    let malformed = fx
        .service
        .handle_webhook(&WebhookTopic::OrdersPaid, SHOP, b"{not json")
        .await;
    assert!(matches!(malformed, Err(ImpactServiceError::InvalidRequest(_))));

    let body = serde_json::to_vec(&json!({ "customer": { "id": 42 } })).expect("json");
    let data = fx
        .service
        .handle_webhook(&WebhookTopic::CustomersDataRequest, SHOP, &body)
        .await
        .expect("handled");
    assert_eq!(data.label(), "data_request_acknowledged");

    let uninstalled = fx
        .service
        .handle_webhook(&WebhookTopic::AppUninstalled, SHOP, b"{}")
        .await
        .expect("handled");
    assert_eq!(uninstalled, WebhookOutcome::Uninstalled);
}

#[tokio::test]
async fn customer_redaction_leaves_no_customer_data_in_the_ledger() {
    let fx = fixture().await;
    enable_loyalty(&fx.store, &fx.shop).await;
    fx.service
        .redeem_points(&credentials(LOYALTY_KEY), redemption(200, Some("smile-90")))
        .await
        .expect("redemption succeeds");

    let body = serde_json::to_vec(&json!({ "customer": { "id": "cust-1" } })).expect("json");
    let outcome = fx
        .service
        .handle_webhook(&WebhookTopic::CustomersRedact, SHOP, &body)
        .await
        .expect("handled");
    assert_eq!(outcome, WebhookOutcome::CustomerRedacted { records: 1 });

    let rows = ledger_rows(&fx.store, &fx.shop).await;
    assert_eq!(rows.len(), 1);
    let metadata = rows[0].metadata.to_string();
    assert!(!metadata.contains("cust-1"), "metadata: {metadata}");
    assert!(!metadata.contains("ivy@example.com"), "metadata: {metadata}");

    let impact = fx
        .service
        .customer_impact(&credentials(LOYALTY_KEY), "cust-1")
        .await
        .expect("customer impact");
    assert_eq!(impact.trees_planted, 0);
}

#[tokio::test]
async fn loyalty_points_convert_to_whole_trees() {
    let fx = fixture().await;
    enable_loyalty(&fx.store, &fx.shop).await;

    let receipt = fx
        .service
        .redeem_points(&credentials(LOYALTY_KEY), redemption(250, Some("smile-77")))
        .await
        .expect("redemption succeeds");

    assert!(receipt.success);
    assert_eq!(receipt.trees_planted, 2);
    assert_eq!(receipt.co2_offset_kg, 40.0);
    assert_eq!(receipt.cost, 1.0);
    assert_eq!(receipt.reference_id, "smile-77");

    let impact = fx
        .service
        .customer_impact(&credentials(LOYALTY_KEY), "cust-1")
        .await
        .expect("customer impact");
    assert_eq!(impact.trees_planted, 2);
    assert_eq!(impact.points_spent, 250);

    let duplicate = fx
        .service
        .redeem_points(&credentials(LOYALTY_KEY), redemption(250, Some("smile-77")))
        .await;
    assert!(matches!(duplicate, Err(ImpactServiceError::Duplicate(id)) if id == "smile-77"));
    assert_eq!(ledger_rows(&fx.store, &fx.shop).await.len(), 1);
}

#[tokio::test]
async fn loyalty_rejects_small_redemptions_and_bad_keys() {
    let fx = fixture().await;
    enable_loyalty(&fx.store, &fx.shop).await;

    let too_few = fx
        .service
        .redeem_points(&credentials(LOYALTY_KEY), redemption(99, None))
        .await;
    assert!(matches!(too_few, Err(ImpactServiceError::InvalidRequest(_))));

    let wrong_key = fx
        .service
        .redeem_points(&credentials("not-the-key"), redemption(500, None))
        .await;
    assert!(matches!(wrong_key, Err(ImpactServiceError::InvalidCredentials)));

    configure(&fx.store, &fx.shop, |settings| settings.loyalty_enabled = false).await;
    let disabled = fx
        .service
        .loyalty_rates(&credentials(LOYALTY_KEY))
        .await;
    assert!(matches!(disabled, Err(ImpactServiceError::FeatureDisabled(_))));

    assert!(ledger_rows(&fx.store, &fx.shop).await.is_empty());
}

#[tokio::test]
async fn loyalty_redemption_respects_the_budget() {
    let fx = fixture().await;
    enable_loyalty(&fx.store, &fx.shop).await;
    configure(&fx.store, &fx.shop, |settings| settings.monthly_budget = Some(1.0)).await;

    let over = fx
        .service
        .redeem_points(&credentials(LOYALTY_KEY), redemption(300, None))
        .await;
    assert!(matches!(
        over,
        Err(ImpactServiceError::BudgetExceeded { requested }) if requested == 1.5
    ));

    let impact = fx
        .store
        .customer_impact(&fx.shop.id, "cust-1")
        .await
        .expect("customer impact");
    assert_eq!(impact.redemptions, 0);
}

#[tokio::test]
async fn flow_plants_trees_and_logs_each_run() {
    let fx = fixture().await;

    let receipt = fx
        .service
        .run_flow_action(
            FlowAction::PlantTrees,
            flow_request(Some("run-1"), json!({ "tree_count": 3 })),
        )
        .await
        .expect("flow action runs");
    assert_eq!(receipt.status, FlowActionStatus::Completed);
    assert_eq!(receipt.trees_planted, 3);
    assert_eq!(receipt.cost, 1.5);

    let repeat = fx
        .service
        .run_flow_action(
            FlowAction::PlantTrees,
            flow_request(Some("run-1"), json!({ "tree_count": 3 })),
        )
        .await
        .expect("repeat is acknowledged");
    assert_eq!(repeat.status, FlowActionStatus::Duplicate);

    let rows = ledger_rows(&fx.store, &fx.shop).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source, ImpactSource::Flow);
    assert_eq!(flow_log_count(&fx.store).await, 2);
}

#[tokio::test]
async fn flow_offsets_carbon_without_trees() {
    let fx = fixture().await;

    let receipt = fx
        .service
        .run_flow_action(
            FlowAction::OffsetCarbon,
            flow_request(None, json!({ "kg_co2": "50" })),
        )
        .await
        .expect("flow action runs");

    assert_eq!(receipt.trees_planted, 0);
    assert_eq!(receipt.co2_offset_kg, 50.0);
    assert_eq!(receipt.cost, 1.0);
    assert!(receipt.action_run_id.starts_with("flow-"));
}

#[tokio::test]
async fn invalid_flow_input_is_rejected_and_logged() {
    let fx = fixture().await;

    for properties in [
        json!({ "tree_count": 0 }),
        json!({ "tree_count": 2.5 }),
        json!({ "tree_count": "many" }),
        json!({}),
    ] {
        let result = fx
            .service
            .run_flow_action(FlowAction::PlantTrees, flow_request(None, properties))
            .await;
        assert!(matches!(result, Err(ImpactServiceError::InvalidRequest(_))));
    }

    configure(&fx.store, &fx.shop, |settings| settings.is_paused = true).await;
    let paused = fx
        .service
        .run_flow_action(
            FlowAction::PlantTrees,
            flow_request(None, json!({ "tree_count": 1 })),
        )
        .await;
    assert!(matches!(paused, Err(ImpactServiceError::ShopInactive(_))));

    assert!(ledger_rows(&fx.store, &fx.shop).await.is_empty());
    assert_eq!(flow_log_count(&fx.store).await, 5);
}

#[tokio::test]
async fn rejected_flow_keeps_its_status_when_the_audit_write_fails() {
    let fx = fixture().await;
    configure(&fx.store, &fx.shop, |settings| settings.monthly_budget = Some(0.0)).await;
    sqlx::query("DROP TABLE flow_action_logs")
        .execute(fx.store.pool())
        .await
        .expect("drop audit table");

    let over_budget = fx
        .service
        .run_flow_action(
            FlowAction::PlantTrees,
            flow_request(Some("run-9"), json!({ "tree_count": 2 })),
        )
        .await;
    assert!(matches!(
        over_budget,
        Err(ImpactServiceError::BudgetExceeded { .. })
    ));

    let invalid = fx
        .service
        .run_flow_action(
            FlowAction::PlantTrees,
            flow_request(None, json!({ "tree_count": 0 })),
        )
        .await;
    assert!(matches!(invalid, Err(ImpactServiceError::InvalidRequest(_))));
}

#[tokio::test]
async fn legacy_trigger_fields_become_a_single_rule() {
    let fx = fixture().await;
    let update: SettingsUpdate =
        serde_json::from_value(json!({ "triggerType": "threshold", "triggerValue": 25 }))
            .expect("update parses");

    let settings = fx
        .service
        .update_settings(SHOP, update)
        .await
        .expect("settings saved");
    assert_eq!(settings.rules, vec![TriggerRule::new(TriggerKind::Threshold, 25.0)]);

    let outcome = fx
        .service
        .handle_order(SHOP, OrderEvent::Paid, order(8, "110.00", &[]))
        .await
        .expect("order handled");
    assert!(matches!(outcome, OrderOutcome::Recorded { trees: 4, .. }));
}

#[tokio::test]
async fn invalid_settings_leave_stored_values_alone() {
    let fx = fixture().await;
    let update: SettingsUpdate = serde_json::from_value(json!({
        "cost_per_tree": 2.0,
        "rules": [{ "kind": "percentage", "value": 150 }]
    }))
    .expect("update parses");

    let result = fx.service.update_settings(SHOP, update).await;
    assert!(matches!(result, Err(ImpactServiceError::Settings(_))));
    assert_eq!(
        fx.store.settings(&fx.shop.id).await.expect("settings").cost_per_tree,
        0.5
    );
}

#[tokio::test]
async fn dashboard_reports_budget_progress() {
    let fx = fixture().await;
    configure(&fx.store, &fx.shop, |settings| settings.monthly_budget = Some(5.0)).await;
    fx.service
        .handle_order(SHOP, OrderEvent::Paid, order(1, "10.00", &[]))
        .await
        .expect("order handled");

    let dashboard = fx.service.dashboard(SHOP).await.expect("dashboard");
    assert_eq!(dashboard.totals.trees_planted, 1);
    assert_eq!(dashboard.monthly.monthly_spent, 0.5);
    assert_eq!(dashboard.monthly.progress_percent, 10.0);
    assert_eq!(dashboard.remaining_trees, Some(9));
    assert_eq!(dashboard.recent_entries.len(), 1);

    let reset = fx.service.reset_spend(SHOP).await.expect("reset");
    assert_eq!(reset.monthly_spent, 0.0);
}

#[tokio::test]
async fn rotated_key_replaces_the_old_one() {
    let fx = fixture().await;
    enable_loyalty(&fx.store, &fx.shop).await;

    let rotated = fx
        .service
        .rotate_loyalty_key(SHOP)
        .await
        .expect("rotation succeeds");
    assert_ne!(rotated.api_key, LOYALTY_KEY);

    let stale = fx.service.loyalty_rates(&credentials(LOYALTY_KEY)).await;
    assert!(matches!(stale, Err(ImpactServiceError::InvalidCredentials)));

    let rates = fx
        .service
        .loyalty_rates(&credentials(&rotated.api_key))
        .await
        .expect("new key works");
    assert_eq!(rates.points_per_tree, 100);
}

#[tokio::test]
async fn registration_rejects_paths_and_normalises_case() {
    let fx = fixture().await;

    let invalid = fx
        .service
        .register_shop(ShopRegistration {
            domain: "https://example.com/admin".to_string(),
            name: String::new(),
            company_id: None,
            access_token: None,
        })
        .await;
    assert!(matches!(invalid, Err(ImpactServiceError::InvalidRequest(_))));

    let shop = fx
        .service
        .register_shop(ShopRegistration {
            domain: "Fern-Hollow.myshopify.com".to_string(),
            name: "  ".to_string(),
            company_id: None,
            access_token: None,
        })
        .await
        .expect("registers");
    assert_eq!(shop.domain, "fern-hollow.myshopify.com");
    assert_eq!(shop.name, "fern-hollow.myshopify.com");
}
