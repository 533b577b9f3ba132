mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::{TestApp, ACTOR};
use deposit_api::{
    entities::{
        alert::{AlertPriority, AlertType},
        deposit::{self, DepositState},
        movement::MovementType,
    },
    errors::ServiceError,
    services::{
        alerts::CreateAlertInput,
        deposits::{CreateDepositInput, DepositPatch},
    },
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn create_computes_total_and_state() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;

    let deposit = app
        .create_deposit(&fixture, 10, Some(dec!(50)), Some(Duration::days(25)))
        .await;

    assert_eq!(deposit.total_value, dec!(500));
    assert_eq!(deposit.state, DepositState::NearExpiration);
    assert_eq!(deposit.version, 1);
    assert!(deposit.is_active());

    let history = app.state.services.deposits.history(deposit.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].movement_type, MovementType::Entry);
    assert_eq!(history[0].actor, ACTOR);
}

#[tokio::test]
async fn unit_value_defaults_to_catalog_price() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(12.5)).await;

    let deposit = app.create_deposit(&fixture, 4, None, None).await;

    assert_eq!(deposit.unit_value, dec!(12.5));
    assert_eq!(deposit.total_value, dec!(50));
    assert_eq!(deposit.state, DepositState::Active);
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(10)).await;
    let deposits = app.state.services.deposits.clone();
    let now = Utc::now();

    let base = CreateDepositInput {
        product_id: fixture.product.id,
        site_id: fixture.site.id,
        quantity: 0,
        unit_value: None,
        deposit_date: Some(now),
        expiration_date: None,
        invoice_ref: None,
        notes: None,
    };

    let zero_quantity = deposits.create(base.clone(), ACTOR).await;
    assert_matches!(zero_quantity, Err(ServiceError::ValidationError(_)));

    let expires_before = deposits
        .create(
            CreateDepositInput {
                quantity: 1,
                expiration_date: Some(now - Duration::days(1)),
                ..base.clone()
            },
            ACTOR,
        )
        .await;
    assert_matches!(expires_before, Err(ServiceError::ValidationError(_)));

    let unknown_product = deposits
        .create(
            CreateDepositInput {
                quantity: 1,
                product_id: Uuid::new_v4(),
                ..base.clone()
            },
            ACTOR,
        )
        .await;
    assert_matches!(unknown_product, Err(ServiceError::NotFound(_)));

    let unknown_site = deposits
        .create(
            CreateDepositInput {
                quantity: 1,
                site_id: Uuid::new_v4(),
                ..base
            },
            ACTOR,
        )
        .await;
    assert_matches!(unknown_site, Err(ServiceError::NotFound(_)));
}

#[tokio::test]
async fn failed_create_does_not_consume_an_identifier() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(10)).await;

    let missing_site = app
        .state
        .services
        .deposits
        .create(
            CreateDepositInput {
                product_id: fixture.product.id,
                site_id: Uuid::new_v4(),
                quantity: 1,
                unit_value: None,
                deposit_date: None,
                expiration_date: None,
                invoice_ref: None,
                notes: None,
            },
            ACTOR,
        )
        .await;
    assert!(missing_site.is_err());

    let deposit = app.create_deposit(&fixture, 1, None, None).await;
    assert!(deposit.code.ends_with("-0000001"));
}

#[tokio::test]
async fn update_recomputes_total_and_records_diff() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposit = app
        .create_deposit(&fixture, 10, Some(dec!(50)), Some(Duration::days(60)))
        .await;

    let updated = app
        .state
        .services
        .deposits
        .update_fields(
            deposit.id,
            DepositPatch {
                quantity: Some(12),
                expiration_date: Some(Utc::now() + Duration::days(10)),
                ..Default::default()
            },
            ACTOR,
        )
        .await
        .unwrap();

    assert_eq!(updated.total_value, dec!(600));
    assert_eq!(updated.state, DepositState::NearExpiration);
    assert_eq!(updated.version, 2);

    let history = app.state.services.deposits.history(deposit.id).await.unwrap();
    assert_eq!(history.len(), 2);
    let modification = history
        .iter()
        .find(|m| m.movement_type == MovementType::Modification)
        .expect("modification movement");
    assert!(modification.description.contains("quantity: 10 -> 12"));
    assert!(modification.description.contains("expiration_date"));
}

#[tokio::test]
async fn empty_patch_writes_nothing() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposit = app.create_deposit(&fixture, 10, None, None).await;

    let unchanged = app
        .state
        .services
        .deposits
        .update_fields(deposit.id, DepositPatch::default(), ACTOR)
        .await
        .unwrap();

    assert_eq!(unchanged.version, deposit.version);
    let history = app.state.services.deposits.history(deposit.id).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn terminal_deposits_reject_mutation() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposits = app.state.services.deposits.clone();

    let invoiced = app.create_deposit(&fixture, 1, None, Some(Duration::days(90))).await;
    let invoiced = deposits
        .mark_invoiced(invoiced.id, "INV-001", None, Some("billed".into()), ACTOR)
        .await
        .unwrap();
    assert_eq!(invoiced.state, DepositState::Invoiced);
    assert_eq!(invoiced.invoice_ref.as_deref(), Some("INV-001"));
    assert!(invoiced.is_active());

    assert_matches!(
        deposits
            .update_fields(invoiced.id, DepositPatch { quantity: Some(2), ..Default::default() }, ACTOR)
            .await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        deposits
            .extend_expiration(invoiced.id, Utc::now() + Duration::days(200), "renewed", ACTOR)
            .await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        deposits.mark_invoiced(invoiced.id, "INV-002", None, None, ACTOR).await,
        Err(ServiceError::Conflict(_))
    );

    // Invoiced deposits can still be retired; retired is final.
    let retired = deposits.mark_retired(invoiced.id, None, None, ACTOR).await.unwrap();
    assert_eq!(retired.state, DepositState::Retired);
    assert!(!retired.is_active());
    assert_matches!(
        deposits.mark_retired(invoiced.id, None, None, ACTOR).await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        deposits.mark_invoiced(invoiced.id, "INV-003", None, None, ACTOR).await,
        Err(ServiceError::Conflict(_))
    );
}

#[tokio::test]
async fn invoicing_requires_a_reference() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposit = app.create_deposit(&fixture, 1, None, None).await;

    assert_matches!(
        app.state
            .services
            .deposits
            .mark_invoiced(deposit.id, "   ", None, None, ACTOR)
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn stale_version_is_rejected() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposits = app.state.services.deposits.clone();
    let stale = app.create_deposit(&fixture, 10, None, Some(Duration::days(90))).await;

    deposits
        .update_fields(
            stale.id,
            DepositPatch {
                quantity: Some(11),
                ..Default::default()
            },
            ACTOR,
        )
        .await
        .unwrap();

    // The copy read before the update still says version 1.
    let mut outdated = stale.clone();
    outdated.expiration_date = Some(Utc::now() + Duration::days(5));
    let result = deposits.refresh_state(&outdated, Utc::now()).await;
    assert_matches!(result, Err(ServiceError::ConcurrentModification(id)) if id == stale.id);
}

#[tokio::test]
async fn extend_requires_a_later_date() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposit = app
        .create_deposit(&fixture, 1, None, Some(Duration::days(20)))
        .await;

    let result = app
        .state
        .services
        .deposits
        .extend_expiration(deposit.id, Utc::now() + Duration::days(10), "too short", ACTOR)
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn extend_resolves_only_the_near_alert() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposit = app
        .create_deposit(&fixture, 10, Some(dec!(50)), Some(Duration::days(25)))
        .await;

    // Creation already raised the near-expiration alert.
    let open = app.open_alerts_for(deposit.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].alert_type, AlertType::ExpirationNear);

    let custom = app
        .state
        .services
        .alerts
        .create_alert(CreateAlertInput {
            alert_type: AlertType::Custom,
            priority: AlertPriority::Low,
            deposit_id: Some(deposit.id),
            site_id: None,
            product_id: None,
            title: "Check packaging".into(),
            description: "Customer reported damaged pallets".into(),
            metadata: None,
        })
        .await
        .unwrap();

    let extended = app
        .state
        .services
        .deposits
        .extend_expiration(deposit.id, Utc::now() + Duration::days(60), "renewed", ACTOR)
        .await
        .unwrap();
    assert_eq!(extended.state, DepositState::Active);

    let open = app.open_alerts_for(deposit.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, custom.id);

    let history = app.state.services.deposits.history(deposit.id).await.unwrap();
    assert!(history
        .iter()
        .any(|m| m.movement_type == MovementType::Modification && m.description.contains("renewed")));
}

#[tokio::test]
async fn extend_within_window_keeps_near_alert() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposit = app
        .create_deposit(&fixture, 10, None, Some(Duration::days(5)))
        .await;

    app.state
        .services
        .deposits
        .extend_expiration(deposit.id, Utc::now() + Duration::days(20), "short renewal", ACTOR)
        .await
        .unwrap();

    let open = app.open_alerts_for(deposit.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].alert_type, AlertType::ExpirationNear);
}

#[tokio::test]
async fn retiring_resolves_every_open_alert() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(5000)).await;
    let deposit = app
        .create_deposit(&fixture, 5, None, Some(Duration::days(3)))
        .await;

    app.state
        .services
        .alerts
        .raise_high_value_alert(&deposit, dec!(10000))
        .await
        .unwrap();
    assert_eq!(app.open_alerts_for(deposit.id).await.len(), 2);

    let retired = app
        .state
        .services
        .deposits
        .mark_retired(deposit.id, None, Some("returned to client".into()), ACTOR)
        .await
        .unwrap();

    assert_eq!(retired.state, DepositState::Retired);
    assert!(retired.retired_at.is_some());
    assert_eq!(retired.notes.as_deref(), Some("returned to client"));
    assert!(app.open_alerts_for(deposit.id).await.is_empty());

    let history = app.state.services.deposits.history(deposit.id).await.unwrap();
    assert_eq!(history[0].movement_type, MovementType::Retirement);
}

#[tokio::test]
async fn view_composes_client_through_site() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let deposit = app
        .create_deposit(&fixture, 2, None, Some(Duration::days(40)))
        .await;

    let view = app.state.services.deposits.view(deposit.id).await.unwrap();
    assert_eq!(view.days_to_expiry, Some(40));
    assert!(view.active);
    let client = view.client.as_ref().expect("client composed at read time");
    assert_eq!(client.id, fixture.client.id);

    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["state"], "active");
    assert_eq!(json["days_to_expiry"], 40);
}

#[tokio::test]
async fn listings_filter_by_dates() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(50)).await;
    let soon = app.create_deposit(&fixture, 1, None, Some(Duration::days(5))).await;
    let later = app.create_deposit(&fixture, 1, None, Some(Duration::days(90))).await;
    let expired = app
        .insert_raw_deposit(
            &fixture,
            "DEP-1999-0000001",
            1,
            dec!(50),
            Some(Utc::now() - Duration::days(2)),
            DepositState::Expired,
        )
        .await;

    let deposits = app.state.services.deposits.clone();
    let expiring: Vec<_> = deposits
        .expiring_within(30)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(expiring, vec![soon.id]);

    let past: Vec<_> = deposits.expired().await.unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(past, vec![expired.id]);

    let (page, total) = deposits
        .list(&deposit_api::services::deposits::DepositQuery {
            state: Some(DepositState::Active),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(page[0].id, later.id);
}

#[tokio::test]
async fn oversized_amounts_are_validation_errors() {
    let app = TestApp::new().await;
    let fixture = app.seed_fixture(dec!(10)).await;
    let deposits = app.state.services.deposits.clone();

    let huge_unit_value = deposits
        .create(
            CreateDepositInput {
                product_id: fixture.product.id,
                site_id: fixture.site.id,
                quantity: 10,
                unit_value: Some(Decimal::MAX / dec!(2)),
                deposit_date: None,
                expiration_date: None,
                invoice_ref: None,
                notes: None,
            },
            ACTOR,
        )
        .await;
    assert_matches!(huge_unit_value, Err(ServiceError::ValidationError(_)));

    let patch_unit_value = DepositPatch {
        unit_value: Some(deposit::MAX_AMOUNT + dec!(1)),
        ..Default::default()
    };
    let deposit = app
        .create_deposit(&fixture, 1, Some(dec!(100000000000)), None)
        .await;
    assert_matches!(
        deposits.update_fields(deposit.id, patch_unit_value, ACTOR).await,
        Err(ServiceError::ValidationError(_))
    );

    let grown = deposits
        .update_fields(
            deposit.id,
            DepositPatch {
                quantity: Some(1_000_000_000),
                ..Default::default()
            },
            ACTOR,
        )
        .await;
    assert_matches!(grown, Err(ServiceError::ValidationError(msg)) if msg.contains("out of range"));

    let stored = deposits.get(deposit.id).await.unwrap();
    assert_eq!(stored.quantity, 1);
    assert_eq!(stored.version, 1);
}
