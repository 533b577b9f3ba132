#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use deposit_api::{
    config::AppConfig,
    db,
    entities::{alert, client, deposit, product, site},
    events::{self, EventSender},
    services::{
        deposits::CreateDepositInput,
        directory::{CreateClientInput, CreateProductInput, CreateSiteInput},
    },
    AppState,
};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const ACTOR: &str = "tester";

/// Helper harness for spinning up an application state backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection keeps every query on the same in-memory database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.sweep_enabled = false;
        tweak(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = Arc::new(AppState::new(Arc::new(pool), cfg, event_sender));
        let router = deposit_api::handlers::router(state.clone());

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    /// Send a request against the admin router.
    pub async fn request(&self, method: Method, uri: &str) -> axum::response::Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_product(&self, unit_price: Decimal) -> product::Model {
        self.state
            .services
            .directory
            .create_product(CreateProductInput {
                code: format!("PRD-{}", &Uuid::new_v4().simple().to_string()[..8]),
                name: "Pallet rack".to_string(),
                unit_price,
            })
            .await
            .expect("seed product for tests")
    }

    pub async fn seed_client(&self) -> client::Model {
        self.state
            .services
            .directory
            .create_client(CreateClientInput {
                name: "Acme Logistics".to_string(),
                tax_id: Some("b12345678".to_string()),
            })
            .await
            .expect("seed client for tests")
    }

    pub async fn seed_site(&self, client_id: Uuid) -> site::Model {
        self.state
            .services
            .directory
            .create_site(CreateSiteInput {
                name: "North warehouse".to_string(),
                client_id,
                sub_client_id: None,
                address: Some("1 Dock Road".to_string()),
            })
            .await
            .expect("seed site for tests")
    }

    /// Product, client and site ready to receive deposits.
    pub async fn seed_fixture(&self, unit_price: Decimal) -> Fixture {
        let product = self.seed_product(unit_price).await;
        let client = self.seed_client().await;
        let site = self.seed_site(client.id).await;
        Fixture {
            product,
            client,
            site,
        }
    }

    pub async fn create_deposit(
        &self,
        fixture: &Fixture,
        quantity: i32,
        unit_value: Option<Decimal>,
        expires_in: Option<Duration>,
    ) -> deposit::Model {
        let now = Utc::now();
        self.state
            .services
            .deposits
            .create(
                CreateDepositInput {
                    product_id: fixture.product.id,
                    site_id: fixture.site.id,
                    quantity,
                    unit_value,
                    deposit_date: Some(now - Duration::days(1)),
                    expiration_date: expires_in.map(|d| now + d),
                    invoice_ref: None,
                    notes: None,
                },
                ACTOR,
            )
            .await
            .expect("create deposit for tests")
    }

    /// Inserts a deposit row directly, bypassing the lifecycle service.
    pub async fn insert_raw_deposit(
        &self,
        fixture: &Fixture,
        code: &str,
        quantity: i32,
        unit_value: Decimal,
        expiration_date: Option<DateTime<Utc>>,
        state: deposit::DepositState,
    ) -> deposit::Model {
        let now = Utc::now();
        deposit::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            product_id: Set(fixture.product.id),
            site_id: Set(fixture.site.id),
            quantity: Set(quantity),
            deposit_date: Set(now - Duration::days(90)),
            expiration_date: Set(expiration_date),
            unit_value: Set(unit_value),
            total_value: Set(deposit::compute_total(unit_value, quantity).expect("total fits")),
            state: Set(state),
            invoice_ref: Set(None),
            invoiced_at: Set(None),
            retired_at: Set(None),
            notes: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.state.db.as_ref())
        .await
        .expect("insert raw deposit")
    }

    pub async fn alerts_for(&self, deposit_id: Uuid) -> Vec<alert::Model> {
        use sea_orm::{ColumnTrait, QueryFilter};
        alert::Entity::find()
            .filter(alert::Column::DepositId.eq(deposit_id))
            .all(self.state.db.as_ref())
            .await
            .expect("load alerts")
    }

    pub async fn open_alerts_for(&self, deposit_id: Uuid) -> Vec<alert::Model> {
        self.alerts_for(deposit_id)
            .await
            .into_iter()
            .filter(|a| !a.resolved)
            .collect()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub struct Fixture {
    pub product: product::Model,
    pub client: client::Model,
    pub site: site::Model,
}

pub async fn read_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("response body is json")
}
