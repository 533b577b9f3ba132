use crate::{
    db::{self, DbPool},
    entities::{
        alert::{self, AlertPriority, AlertType},
        deposit,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const BATCH_RESOLUTION_NOTE: &str = "Resolved in batch";
const MANUAL_RESOLUTION_NOTE: &str = "Resolved manually";
const SUPERSEDED_NOTE: &str = "Superseded: deposit has expired";
const INSERT_ATTEMPTS: usize = 2;

/// Result of an attempt to raise a deduplicated alert.
#[derive(Debug, Clone, PartialEq)]
pub enum RaiseOutcome {
    Created(alert::Model),
    /// An unresolved alert of the same type already exists for the deposit.
    AlreadyOpen(Uuid),
    /// The deposit does not meet the alert's condition.
    NotApplicable,
}

impl RaiseOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, RaiseOutcome::Created(_))
    }
}

/// Selects unresolved alerts for bulk resolution.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub deposit_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    /// Empty means every type.
    pub alert_types: Vec<AlertType>,
}

impl AlertFilter {
    pub fn for_deposit(deposit_id: Uuid) -> Self {
        Self {
            deposit_id: Some(deposit_id),
            ..Default::default()
        }
    }

    pub fn with_types(mut self, types: &[AlertType]) -> Self {
        self.alert_types = types.to_vec();
        self
    }

    fn condition(&self) -> Condition {
        let mut cond = Condition::all().add(alert::Column::Resolved.eq(false));
        if let Some(deposit_id) = self.deposit_id {
            cond = cond.add(alert::Column::DepositId.eq(deposit_id));
        }
        if let Some(product_id) = self.product_id {
            cond = cond.add(alert::Column::ProductId.eq(product_id));
        }
        if !self.alert_types.is_empty() {
            cond = cond.add(alert::Column::AlertType.is_in(self.alert_types.clone()));
        }
        cond
    }
}

/// Listing filters for the operator view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertQuery {
    pub alert_type: Option<AlertType>,
    pub priority: Option<AlertPriority>,
    pub resolved: Option<bool>,
    pub deposit_id: Option<Uuid>,
    pub page: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateAlertInput {
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub deposit_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    #[validate(length(min = 1, max = 4000))]
    pub description: String,
    pub metadata: Option<serde_json::Value>,
}

/// Type and priority for an expiration alert `days` out.
pub fn classify_expiration(days: i64) -> (AlertType, AlertPriority) {
    if days < 0 {
        (AlertType::ExpirationPassed, AlertPriority::Critical)
    } else if days <= 7 {
        (AlertType::ExpirationNear, AlertPriority::Critical)
    } else if days <= 15 {
        (AlertType::ExpirationNear, AlertPriority::High)
    } else {
        (AlertType::ExpirationNear, AlertPriority::Medium)
    }
}

/// Priority for a high-value alert, or `None` when `total` is within the threshold.
pub fn high_value_priority(total: Decimal, threshold: Decimal) -> Option<AlertPriority> {
    if total <= threshold {
        None
    } else if total > threshold * Decimal::from(2) {
        Some(AlertPriority::High)
    } else {
        Some(AlertPriority::Medium)
    }
}

fn expiration_title(code: &str, days: i64) -> String {
    match days {
        d if d < 0 => format!("Deposit {} has expired", code),
        0 => format!("Deposit {} expires today", code),
        1 => format!("Deposit {} expires in 1 day", code),
        d => format!("Deposit {} expires in {} days", code, d),
    }
}

/// Creates, deduplicates and resolves alerts.
#[derive(Clone)]
pub struct AlertEngine {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    expiry_window_days: i64,
}

impl AlertEngine {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        expiry_window_days: i64,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            expiry_window_days,
        }
    }

    pub fn expiry_window_days(&self) -> i64 {
        self.expiry_window_days
    }

    /// Raises an expiration-near or expiration-passed alert for `deposit`.
    #[instrument(skip(self, deposit), fields(deposit_id = %deposit.id, code = %deposit.code))]
    pub async fn raise_expiration_alert(
        &self,
        deposit: &deposit::Model,
    ) -> Result<RaiseOutcome, ServiceError> {
        let (expiration, days) = match deposit.expiration_date {
            Some(expiration) => (expiration, deposit::days_to_expiry(expiration, Utc::now())),
            None => return Ok(RaiseOutcome::NotApplicable),
        };
        if days > self.expiry_window_days {
            return Ok(RaiseOutcome::NotApplicable);
        }

        let (alert_type, priority) = classify_expiration(days);
        let date = expiration.format("%Y-%m-%d");
        let description = if days < 0 {
            format!(
                "Deposit {} expired on {} ({} days ago). Quantity {}, total value {}.",
                deposit.code, date, -days, deposit.quantity, deposit.total_value
            )
        } else {
            format!(
                "Deposit {} expires on {} ({} days left). Quantity {}, total value {}.",
                deposit.code, date, days, deposit.quantity, deposit.total_value
            )
        };

        let new_alert = self.deposit_alert(
            deposit,
            alert_type,
            priority,
            expiration_title(&deposit.code, days),
            description,
            json!({
                "days_to_expiry": days,
                "expiration_date": expiration,
                "quantity": deposit.quantity,
                "total_value": deposit.total_value,
            }),
        );

        let outcome = self.raise_deduplicated(new_alert).await?;
        if alert_type == AlertType::ExpirationPassed {
            let superseded =
                AlertFilter::for_deposit(deposit.id).with_types(&[AlertType::ExpirationNear]);
            self.resolve_by_condition(&superseded, SUPERSEDED_NOTE).await?;
        }
        Ok(outcome)
    }

    /// Raises a high-value alert when the deposit's total exceeds `threshold`.
    #[instrument(skip(self, deposit), fields(deposit_id = %deposit.id, code = %deposit.code))]
    pub async fn raise_high_value_alert(
        &self,
        deposit: &deposit::Model,
        threshold: Decimal,
    ) -> Result<RaiseOutcome, ServiceError> {
        let priority = match high_value_priority(deposit.total_value, threshold) {
            Some(priority) => priority,
            None => return Ok(RaiseOutcome::NotApplicable),
        };

        let new_alert = self.deposit_alert(
            deposit,
            AlertType::HighValue,
            priority,
            format!("High-value deposit {}", deposit.code),
            format!(
                "Deposit {} is valued at {}, above the {} threshold.",
                deposit.code, deposit.total_value, threshold
            ),
            json!({
                "total_value": deposit.total_value,
                "threshold": threshold,
                "quantity": deposit.quantity,
            }),
        );

        self.raise_deduplicated(new_alert).await
    }

    /// Creates an operator alert. Subject to the same dedup rule as raised alerts.
    #[instrument(skip(self))]
    pub async fn create_alert(
        &self,
        input: CreateAlertInput,
    ) -> Result<alert::Model, ServiceError> {
        input.validate()?;
        let now = Utc::now();
        let new_alert = alert::ActiveModel {
            id: Set(Uuid::new_v4()),
            alert_type: Set(input.alert_type),
            priority: Set(input.priority),
            deposit_id: Set(input.deposit_id),
            site_id: Set(input.site_id),
            product_id: Set(input.product_id),
            title: Set(input.title),
            description: Set(input.description),
            resolved: Set(false),
            resolved_at: Set(None),
            resolution_note: Set(None),
            metadata: Set(input.metadata.unwrap_or_else(|| json!({}))),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match self.raise_deduplicated(new_alert).await? {
            RaiseOutcome::Created(model) => Ok(model),
            RaiseOutcome::AlreadyOpen(existing) => Err(ServiceError::Conflict(format!(
                "an unresolved {} alert already exists ({})",
                input.alert_type.as_str(),
                existing
            ))),
            RaiseOutcome::NotApplicable => Err(ServiceError::InternalError(
                "operator alert was not created".to_string(),
            )),
        }
    }

    fn deposit_alert(
        &self,
        deposit: &deposit::Model,
        alert_type: AlertType,
        priority: AlertPriority,
        title: String,
        description: String,
        metadata: serde_json::Value,
    ) -> alert::ActiveModel {
        let now = Utc::now();
        alert::ActiveModel {
            id: Set(Uuid::new_v4()),
            alert_type: Set(alert_type),
            priority: Set(priority),
            deposit_id: Set(Some(deposit.id)),
            site_id: Set(Some(deposit.site_id)),
            product_id: Set(Some(deposit.product_id)),
            title: Set(title),
            description: Set(description),
            resolved: Set(false),
            resolved_at: Set(None),
            resolution_note: Set(None),
            metadata: Set(metadata),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }

    /// Check-then-insert, with the partial unique index closing the race:
    /// a unique violation means another writer got there first.
    async fn raise_deduplicated(
        &self,
        new_alert: alert::ActiveModel,
    ) -> Result<RaiseOutcome, ServiceError> {
        let db = self.db_pool.as_ref();
        let alert_type = match &new_alert.alert_type {
            sea_orm::ActiveValue::Set(t) | sea_orm::ActiveValue::Unchanged(t) => *t,
            sea_orm::ActiveValue::NotSet => {
                return Err(ServiceError::InternalError("alert type not set".to_string()))
            }
        };
        let deposit_id = match &new_alert.deposit_id {
            sea_orm::ActiveValue::Set(id) | sea_orm::ActiveValue::Unchanged(id) => *id,
            sea_orm::ActiveValue::NotSet => None,
        };

        for _ in 0..INSERT_ATTEMPTS {
            if let Some(deposit_id) = deposit_id {
                if let Some(existing) = self.open_alert(deposit_id, alert_type).await? {
                    debug!(alert_id = %existing.id, "unresolved alert already open");
                    return Ok(RaiseOutcome::AlreadyOpen(existing.id));
                }
            }

            match new_alert.clone().insert(db).await {
                Ok(model) => {
                    counter!("alerts.created", 1, "type" => alert_type.as_str());
                    info!(
                        alert_id = %model.id,
                        alert_type = alert_type.as_str(),
                        priority = ?model.priority,
                        "alert created"
                    );
                    self.event_sender
                        .publish(Event::AlertRaised {
                            alert_id: model.id,
                            alert_type,
                            priority: model.priority,
                            deposit_id: model.deposit_id,
                        })
                        .await;
                    return Ok(RaiseOutcome::Created(model));
                }
                Err(e) if db::is_unique_violation(&e) => {
                    debug!("concurrent raise detected, re-checking open alert");
                    continue;
                }
                Err(e) => return Err(ServiceError::db_error(e)),
            }
        }

        warn!(alert_type = alert_type.as_str(), ?deposit_id, "alert kept colliding");
        Err(ServiceError::Conflict(format!(
            "could not raise {} alert, it keeps colliding with a concurrent writer",
            alert_type.as_str()
        )))
    }

    /// The unresolved alert of `alert_type` for a deposit, if one exists.
    pub async fn open_alert(
        &self,
        deposit_id: Uuid,
        alert_type: AlertType,
    ) -> Result<Option<alert::Model>, ServiceError> {
        alert::Entity::find()
            .filter(alert::Column::DepositId.eq(deposit_id))
            .filter(alert::Column::AlertType.eq(alert_type))
            .filter(alert::Column::Resolved.eq(false))
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Resolves one alert. Resolution is one-way.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        alert_id: Uuid,
        note: Option<String>,
    ) -> Result<alert::Model, ServiceError> {
        let db = self.db_pool.as_ref();
        let existing = self.get(alert_id).await?;
        if existing.resolved {
            return Err(ServiceError::Conflict(format!(
                "alert {} is already resolved",
                alert_id
            )));
        }

        let note = note.unwrap_or_else(|| MANUAL_RESOLUTION_NOTE.to_string());
        let filter = Condition::all()
            .add(alert::Column::Id.eq(alert_id))
            .add(alert::Column::Resolved.eq(false));
        let resolved = Self::mark_resolved(db, filter, &note).await?;
        if resolved == 0 {
            return Err(ServiceError::Conflict(format!(
                "alert {} is already resolved",
                alert_id
            )));
        }

        counter!("alerts.resolved", 1);
        info!(%alert_id, "alert resolved");
        self.get(alert_id).await
    }

    /// Batch resolution. Ids that are unknown or already resolved are skipped.
    #[instrument(skip(self, alert_ids), fields(requested = alert_ids.len()))]
    pub async fn resolve_many(
        &self,
        alert_ids: &[Uuid],
        note: Option<String>,
    ) -> Result<u64, ServiceError> {
        if alert_ids.is_empty() {
            return Err(ServiceError::ValidationError(
                "at least one alert id is required".to_string(),
            ));
        }

        let note = note.unwrap_or_else(|| BATCH_RESOLUTION_NOTE.to_string());
        let filter = Condition::all()
            .add(alert::Column::Id.is_in(alert_ids.to_vec()))
            .add(alert::Column::Resolved.eq(false));
        let resolved = Self::mark_resolved(self.db_pool.as_ref(), filter, &note).await?;

        self.after_bulk_resolution(resolved, note).await;
        Ok(resolved)
    }

    /// Resolves every unresolved alert matching `filter`.
    #[instrument(skip(self))]
    pub async fn resolve_by_condition(
        &self,
        filter: &AlertFilter,
        note: &str,
    ) -> Result<u64, ServiceError> {
        let resolved = Self::resolve_by_condition_in(self.db_pool.as_ref(), filter, note).await?;
        self.after_bulk_resolution(resolved, note.to_string()).await;
        Ok(resolved)
    }

    /// Same as [`AlertEngine::resolve_by_condition`] on the caller's transaction.
    pub async fn resolve_by_condition_in<C: ConnectionTrait>(
        conn: &C,
        filter: &AlertFilter,
        note: &str,
    ) -> Result<u64, ServiceError> {
        Self::mark_resolved(conn, filter.condition(), note).await
    }

    async fn mark_resolved<C: ConnectionTrait>(
        conn: &C,
        filter: Condition,
        note: &str,
    ) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let result = alert::Entity::update_many()
            .col_expr(alert::Column::Resolved, Expr::value(true))
            .col_expr(alert::Column::ResolvedAt, Expr::value(now))
            .col_expr(alert::Column::ResolutionNote, Expr::value(note.to_string()))
            .col_expr(alert::Column::UpdatedAt, Expr::value(now))
            .filter(filter)
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(result.rows_affected)
    }

    async fn after_bulk_resolution(&self, count: u64, note: String) {
        if count == 0 {
            return;
        }
        counter!("alerts.resolved", count);
        info!(count, %note, "alerts resolved");
        self.event_sender
            .publish(Event::AlertsResolved { count, note })
            .await;
    }

    pub async fn get(&self, alert_id: Uuid) -> Result<alert::Model, ServiceError> {
        alert::Entity::find_by_id(alert_id)
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Alert", alert_id))
    }

    /// Paginated listing, newest first. Returns the page and the total count.
    pub async fn list(&self, query: &AlertQuery) -> Result<(Vec<alert::Model>, u64), ServiceError> {
        let db = self.db_pool.as_ref();
        let mut select = alert::Entity::find();
        if let Some(alert_type) = query.alert_type {
            select = select.filter(alert::Column::AlertType.eq(alert_type));
        }
        if let Some(priority) = query.priority {
            select = select.filter(alert::Column::Priority.eq(priority));
        }
        if let Some(resolved) = query.resolved {
            select = select.filter(alert::Column::Resolved.eq(resolved));
        }
        if let Some(deposit_id) = query.deposit_id {
            select = select.filter(alert::Column::DepositId.eq(deposit_id));
        }

        let total = select
            .clone()
            .count(db)
            .await
            .map_err(ServiceError::db_error)?;

        let limit = if query.limit == 0 { 50 } else { query.limit.min(500) };
        let offset = query.page.saturating_sub(1) * limit;

        let alerts = select
            .order_by_desc(alert::Column::CreatedAt)
            .offset(offset)
            .limit(limit)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok((alerts, total))
    }

    /// Unresolved alerts, most urgent first.
    pub async fn active(&self, limit: u64) -> Result<Vec<alert::Model>, ServiceError> {
        alert::Entity::find()
            .filter(alert::Column::Resolved.eq(false))
            .order_by_desc(alert::Column::Priority)
            .order_by_desc(alert::Column::CreatedAt)
            .limit(limit)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}
