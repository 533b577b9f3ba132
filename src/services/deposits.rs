use crate::{
    db::{self, DbPool},
    entities::{
        alert::AlertType,
        client,
        deposit::{self, DepositState},
        movement::{self, MovementType},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        alerts::{AlertEngine, AlertFilter},
        directory::DirectoryService,
        movements::{MovementLedger, NewMovement},
        sequence::{SequenceAllocator, SequenceKind},
    },
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDepositInput {
    pub product_id: Uuid,
    pub site_id: Uuid,
    #[validate(range(min = 1, message = "quantity must be greater than zero"))]
    pub quantity: i32,
    /// Defaults to the product's catalog price.
    pub unit_value: Option<Decimal>,
    /// Defaults to now.
    pub deposit_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    #[validate(length(max = 64))]
    pub invoice_ref: Option<String>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

/// Field edits accepted by [`DepositService::update_fields`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DepositPatch {
    #[validate(range(min = 0, message = "quantity cannot be negative"))]
    pub quantity: Option<i32>,
    pub unit_value: Option<Decimal>,
    pub expiration_date: Option<DateTime<Utc>>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepositQuery {
    pub state: Option<DepositState>,
    pub site_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub page: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRef {
    pub id: Uuid,
    pub code: String,
    pub name: String,
}

impl From<client::Model> for ClientRef {
    fn from(client: client::Model) -> Self {
        Self {
            id: client.id,
            code: client.code,
            name: client.name,
        }
    }
}

/// Public JSON view of a deposit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositView {
    pub id: Uuid,
    pub code: String,
    pub product_id: Uuid,
    pub site_id: Uuid,
    pub client: Option<ClientRef>,
    pub quantity: i32,
    pub deposit_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub days_to_expiry: Option<i64>,
    pub unit_value: Decimal,
    pub total_value: Decimal,
    pub state: DepositState,
    pub active: bool,
    pub invoice_ref: Option<String>,
    pub invoiced_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DepositView {
    pub fn new(deposit: deposit::Model, client: Option<client::Model>, now: DateTime<Utc>) -> Self {
        Self {
            days_to_expiry: deposit.days_to_expiry(now),
            active: deposit.is_active(),
            client: client.map(ClientRef::from),
            id: deposit.id,
            code: deposit.code,
            product_id: deposit.product_id,
            site_id: deposit.site_id,
            quantity: deposit.quantity,
            deposit_date: deposit.deposit_date,
            expiration_date: deposit.expiration_date,
            unit_value: deposit.unit_value,
            total_value: deposit.total_value,
            state: deposit.state,
            invoice_ref: deposit.invoice_ref,
            invoiced_at: deposit.invoiced_at,
            retired_at: deposit.retired_at,
            notes: deposit.notes,
            version: deposit.version,
            created_at: deposit.created_at,
            updated_at: deposit.updated_at,
        }
    }
}

/// Field-level diff between two versions of a deposit, one entry per change.
pub fn describe_changes(before: &deposit::Model, after: &deposit::Model) -> Vec<String> {
    let mut changes = Vec::new();
    if before.quantity != after.quantity {
        changes.push(format!("quantity: {} -> {}", before.quantity, after.quantity));
    }
    if before.unit_value != after.unit_value {
        changes.push(format!(
            "unit_value: {} -> {}",
            before.unit_value, after.unit_value
        ));
    }
    if before.expiration_date != after.expiration_date {
        changes.push(format!(
            "expiration_date: {} -> {}",
            format_date(before.expiration_date),
            format_date(after.expiration_date)
        ));
    }
    if before.notes != after.notes {
        changes.push("notes updated".to_string());
    }
    changes
}

fn format_date(date: Option<DateTime<Utc>>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn append_note(existing: Option<String>, note: Option<String>) -> Option<String> {
    match (existing, note.filter(|n| !n.trim().is_empty())) {
        (Some(existing), Some(note)) if !existing.is_empty() => {
            Some(format!("{}\n{}", existing, note))
        }
        (_, Some(note)) => Some(note),
        (existing, None) => existing,
    }
}

fn check_unit_value(unit_value: Option<Decimal>) -> Result<(), ServiceError> {
    match unit_value {
        Some(v) if v.is_sign_negative() => Err(ServiceError::ValidationError(
            "unit value cannot be negative".to_string(),
        )),
        Some(v) if v > deposit::MAX_AMOUNT => Err(ServiceError::ValidationError(format!(
            "unit value cannot exceed {}",
            deposit::MAX_AMOUNT
        ))),
        _ => Ok(()),
    }
}

fn ensure_mutable(deposit: &deposit::Model) -> Result<(), ServiceError> {
    if deposit.is_terminal() {
        return Err(ServiceError::Conflict(format!(
            "deposit {} is {} and can no longer be modified",
            deposit.code,
            deposit.state.as_str()
        )));
    }
    Ok(())
}

/// Deposit state machine: creation, edits, extension, invoicing and retirement.
///
/// Every write is version-checked against the row it read, records one
/// movement in the same transaction and publishes its event after commit.
#[derive(Clone)]
pub struct DepositService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    alerts: Arc<AlertEngine>,
    directory: DirectoryService,
    movements: MovementLedger,
}

impl DepositService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        alerts: Arc<AlertEngine>,
    ) -> Self {
        Self {
            directory: DirectoryService::new(db_pool.clone()),
            movements: MovementLedger::new(db_pool.clone()),
            db_pool,
            event_sender,
            alerts,
        }
    }

    fn window(&self) -> i64 {
        self.alerts.expiry_window_days()
    }

    #[instrument(skip(self, input), fields(product_id = %input.product_id, site_id = %input.site_id))]
    pub async fn create(
        &self,
        input: CreateDepositInput,
        actor: &str,
    ) -> Result<deposit::Model, ServiceError> {
        input.validate()?;
        let now = Utc::now();
        let deposit_date = input.deposit_date.unwrap_or(now);
        if let Some(expiration) = input.expiration_date {
            if expiration <= deposit_date {
                return Err(ServiceError::ValidationError(
                    "expiration date must be after the deposit date".to_string(),
                ));
            }
        }
        check_unit_value(input.unit_value)?;

        let window = self.window();
        let actor = actor.to_string();
        let created = db::transaction(&self.db_pool, "deposit.create", move |txn| {
            Box::pin(async move {
                let product = DirectoryService::product_in(txn, input.product_id).await?;
                if !product.active {
                    return Err(ServiceError::ValidationError(format!(
                        "product {} is not active",
                        product.code
                    )));
                }
                let site = DirectoryService::site_in(txn, input.site_id).await?;
                if !site.active {
                    return Err(ServiceError::ValidationError(format!(
                        "site {} is not active",
                        site.code
                    )));
                }

                let prefix = SequenceKind::deposit_for_current_year().prefix();
                let code = SequenceAllocator::next_in(txn, &prefix).await?;

                let mut model = deposit::Model {
                    id: Uuid::new_v4(),
                    code,
                    product_id: product.id,
                    site_id: site.id,
                    quantity: input.quantity,
                    deposit_date,
                    expiration_date: input.expiration_date,
                    unit_value: input.unit_value.unwrap_or(product.unit_price),
                    total_value: Decimal::ZERO,
                    state: DepositState::Active,
                    invoice_ref: input.invoice_ref.filter(|r| !r.trim().is_empty()),
                    invoiced_at: None,
                    retired_at: None,
                    notes: input.notes,
                    version: 1,
                    created_at: now,
                    updated_at: now,
                };
                model.refresh_derived(now, window)?;

                let model = deposit::ActiveModel::from(model)
                    .reset_all()
                    .insert(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                MovementLedger::record(
                    txn,
                    NewMovement {
                        deposit_id: model.id,
                        movement_type: MovementType::Entry,
                        quantity: model.quantity,
                        occurred_at: model.deposit_date,
                        actor,
                        description: format!(
                            "Deposit {} registered at site {}",
                            model.code, site.code
                        ),
                    },
                )
                .await?;

                Ok(model)
            })
        })
        .await?;

        counter!("deposits.created", 1);
        info!(deposit_id = %created.id, code = %created.code, state = created.state.as_str(), "deposit created");
        self.event_sender
            .publish(Event::DepositCreated {
                deposit_id: created.id,
                code: created.code.clone(),
                state: created.state,
            })
            .await;

        if matches!(
            created.state,
            DepositState::NearExpiration | DepositState::Expired
        ) {
            if let Err(e) = self.alerts.raise_expiration_alert(&created).await {
                warn!(deposit_id = %created.id, error = %e, "could not raise expiration alert for new deposit");
            }
        }

        Ok(created)
    }

    #[instrument(skip(self, patch))]
    pub async fn update_fields(
        &self,
        id: Uuid,
        patch: DepositPatch,
        actor: &str,
    ) -> Result<deposit::Model, ServiceError> {
        patch.validate()?;
        check_unit_value(patch.unit_value)?;

        let window = self.window();
        let actor = actor.to_string();
        let (updated, changes) = db::transaction(&self.db_pool, "deposit.update", move |txn| {
            Box::pin(async move {
                let current = Self::find_in(txn, id).await?;
                ensure_mutable(&current)?;

                let mut next = current.clone();
                if let Some(quantity) = patch.quantity {
                    next.quantity = quantity;
                }
                if let Some(unit_value) = patch.unit_value {
                    next.unit_value = unit_value;
                }
                if let Some(expiration) = patch.expiration_date {
                    if expiration <= next.deposit_date {
                        return Err(ServiceError::ValidationError(
                            "expiration date must be after the deposit date".to_string(),
                        ));
                    }
                    next.expiration_date = Some(expiration);
                }
                if let Some(notes) = patch.notes {
                    next.notes = Some(notes);
                }

                let changes = describe_changes(&current, &next);
                if changes.is_empty() {
                    return Ok((current, changes));
                }

                next.refresh_derived(Utc::now(), window)?;
                let saved = Self::save_versioned(txn, current.version, next).await?;

                MovementLedger::record(
                    txn,
                    NewMovement {
                        deposit_id: saved.id,
                        movement_type: MovementType::Modification,
                        quantity: saved.quantity,
                        occurred_at: saved.updated_at,
                        actor,
                        description: changes.join("; "),
                    },
                )
                .await?;

                Ok((saved, changes))
            })
        })
        .await?;

        if !changes.is_empty() {
            info!(deposit_id = %id, changes = ?changes, "deposit updated");
            self.event_sender
                .publish(Event::DepositUpdated {
                    deposit_id: id,
                    changes,
                })
                .await;
        }

        Ok(updated)
    }

    /// Moves the expiration date forward. Once the deposit is back outside the
    /// risk window its open expiration-near alert is resolved.
    #[instrument(skip(self))]
    pub async fn extend_expiration(
        &self,
        id: Uuid,
        new_date: DateTime<Utc>,
        reason: &str,
        actor: &str,
    ) -> Result<deposit::Model, ServiceError> {
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "a reason is required to extend the expiration".to_string(),
            ));
        }

        let window = self.window();
        let actor = actor.to_string();
        let (extended, previous, resolved) =
            db::transaction(&self.db_pool, "deposit.extend", move |txn| {
                Box::pin(async move {
                    let current = Self::find_in(txn, id).await?;
                    ensure_mutable(&current)?;

                    let baseline = current.expiration_date.unwrap_or(current.deposit_date);
                    if new_date <= baseline {
                        return Err(ServiceError::ValidationError(format!(
                            "new expiration date must be after {}",
                            baseline.format("%Y-%m-%d")
                        )));
                    }

                    let now = Utc::now();
                    let previous = current.expiration_date;
                    let mut next = current.clone();
                    next.expiration_date = Some(new_date);
                    next.refresh_derived(now, window)?;
                    let saved = Self::save_versioned(txn, current.version, next).await?;

                    MovementLedger::record(
                        txn,
                        NewMovement {
                            deposit_id: saved.id,
                            movement_type: MovementType::Modification,
                            quantity: saved.quantity,
                            occurred_at: now,
                            actor,
                            description: format!(
                                "expiration extended from {} to {}: {}",
                                format_date(previous),
                                format_date(Some(new_date)),
                                reason
                            ),
                        },
                    )
                    .await?;

                    let mut resolved = 0;
                    if deposit::days_to_expiry(new_date, now) > window {
                        let filter =
                            AlertFilter::for_deposit(saved.id).with_types(&[AlertType::ExpirationNear]);
                        let note = format!("Expiration extended to {}", format_date(Some(new_date)));
                        resolved = AlertEngine::resolve_by_condition_in(txn, &filter, &note).await?;
                    }

                    Ok((saved, previous, resolved))
                })
            })
            .await?;

        info!(deposit_id = %id, alerts_resolved = resolved, "expiration extended");
        if resolved > 0 {
            counter!("alerts.resolved", resolved);
            self.event_sender
                .publish(Event::AlertsResolved {
                    count: resolved,
                    note: "expiration extended".to_string(),
                })
                .await;
        }
        self.event_sender
            .publish(Event::DepositExpirationExtended {
                deposit_id: id,
                previous,
                extended_to: new_date,
            })
            .await;

        Ok(extended)
    }

    #[instrument(skip(self, notes))]
    pub async fn mark_invoiced(
        &self,
        id: Uuid,
        invoice_ref: &str,
        invoiced_at: Option<DateTime<Utc>>,
        notes: Option<String>,
        actor: &str,
    ) -> Result<deposit::Model, ServiceError> {
        let invoice_ref = invoice_ref.trim().to_string();
        if invoice_ref.is_empty() {
            return Err(ServiceError::ValidationError(
                "invoice reference is required".to_string(),
            ));
        }

        let actor = actor.to_string();
        let reference = invoice_ref.clone();
        let invoiced = db::transaction(&self.db_pool, "deposit.invoice", move |txn| {
            Box::pin(async move {
                let current = Self::find_in(txn, id).await?;
                ensure_mutable(&current)?;

                let now = Utc::now();
                let mut next = current.clone();
                next.state = DepositState::Invoiced;
                next.invoice_ref = Some(reference.clone());
                next.invoiced_at = Some(invoiced_at.unwrap_or(now));
                next.notes = append_note(next.notes, notes);
                let saved = Self::save_versioned(txn, current.version, next).await?;

                MovementLedger::record(
                    txn,
                    NewMovement {
                        deposit_id: saved.id,
                        movement_type: MovementType::Invoicing,
                        quantity: saved.quantity,
                        occurred_at: saved.invoiced_at.unwrap_or(now),
                        actor,
                        description: format!("Deposit invoiced under {}", reference),
                    },
                )
                .await?;

                Ok(saved)
            })
        })
        .await?;

        info!(deposit_id = %id, %invoice_ref, "deposit invoiced");
        self.event_sender
            .publish(Event::DepositInvoiced {
                deposit_id: id,
                invoice_ref,
            })
            .await;

        Ok(invoiced)
    }

    /// Retires the deposit and resolves every open alert about it.
    #[instrument(skip(self, notes))]
    pub async fn mark_retired(
        &self,
        id: Uuid,
        retired_at: Option<DateTime<Utc>>,
        notes: Option<String>,
        actor: &str,
    ) -> Result<deposit::Model, ServiceError> {
        let actor = actor.to_string();
        let (retired, resolved) = db::transaction(&self.db_pool, "deposit.retire", move |txn| {
            Box::pin(async move {
                let current = Self::find_in(txn, id).await?;
                if current.state == DepositState::Retired {
                    return Err(ServiceError::Conflict(format!(
                        "deposit {} is already retired",
                        current.code
                    )));
                }

                let now = Utc::now();
                let mut next = current.clone();
                next.state = DepositState::Retired;
                next.retired_at = Some(retired_at.unwrap_or(now));
                next.notes = append_note(next.notes, notes);
                let saved = Self::save_versioned(txn, current.version, next).await?;

                MovementLedger::record(
                    txn,
                    NewMovement {
                        deposit_id: saved.id,
                        movement_type: MovementType::Retirement,
                        quantity: saved.quantity,
                        occurred_at: saved.retired_at.unwrap_or(now),
                        actor,
                        description: format!("Deposit {} retired", saved.code),
                    },
                )
                .await?;

                let resolved = AlertEngine::resolve_by_condition_in(
                    txn,
                    &AlertFilter::for_deposit(saved.id),
                    "Deposit retired",
                )
                .await?;

                Ok((saved, resolved))
            })
        })
        .await?;

        if resolved > 0 {
            counter!("alerts.resolved", resolved);
        }
        info!(deposit_id = %id, alerts_resolved = resolved, "deposit retired");
        self.event_sender
            .publish(Event::DepositRetired {
                deposit_id: id,
                alerts_resolved: resolved,
            })
            .await;

        Ok(retired)
    }

    /// Persists the date-derived state when it differs from the stored one.
    /// Returns `None` when nothing changed or the deposit is terminal.
    pub async fn refresh_state(
        &self,
        deposit: &deposit::Model,
        now: DateTime<Utc>,
    ) -> Result<Option<deposit::Model>, ServiceError> {
        let state = deposit.rederive_state(now, self.window());
        if state == deposit.state {
            return Ok(None);
        }

        let mut next = deposit.clone();
        next.state = state;
        let saved = Self::save_versioned(self.db_pool.as_ref(), deposit.version, next).await?;
        info!(
            deposit_id = %saved.id,
            from = deposit.state.as_str(),
            to = saved.state.as_str(),
            "deposit state re-derived"
        );
        Ok(Some(saved))
    }

    pub fn days_to_expiry(deposit: &deposit::Model) -> Option<i64> {
        deposit.days_to_expiry(Utc::now())
    }

    pub async fn get(&self, id: Uuid) -> Result<deposit::Model, ServiceError> {
        Self::find_in(self.db_pool.as_ref(), id).await
    }

    pub async fn get_by_code(&self, code: &str) -> Result<deposit::Model, ServiceError> {
        deposit::Entity::find()
            .filter(deposit::Column::Code.eq(code))
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Deposit", code))
    }

    /// Deposit with its derived fields and the client that owns its site.
    pub async fn view(&self, id: Uuid) -> Result<DepositView, ServiceError> {
        let deposit = self.get(id).await?;
        let client = match self.directory.client_for_site(deposit.site_id).await {
            Ok(joined) => Some(joined.client),
            Err(ServiceError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(DepositView::new(deposit, client, Utc::now()))
    }

    pub async fn list(
        &self,
        query: &DepositQuery,
    ) -> Result<(Vec<deposit::Model>, u64), ServiceError> {
        let db = self.db_pool.as_ref();
        let mut select = deposit::Entity::find();
        if let Some(state) = query.state {
            select = select.filter(deposit::Column::State.eq(state));
        }
        if let Some(site_id) = query.site_id {
            select = select.filter(deposit::Column::SiteId.eq(site_id));
        }
        if let Some(product_id) = query.product_id {
            select = select.filter(deposit::Column::ProductId.eq(product_id));
        }

        let total = select
            .clone()
            .count(db)
            .await
            .map_err(ServiceError::db_error)?;

        let limit = if query.limit == 0 { 50 } else { query.limit.min(500) };
        let offset = query.page.saturating_sub(1) * limit;
        let deposits = select
            .order_by_desc(deposit::Column::CreatedAt)
            .offset(offset)
            .limit(limit)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok((deposits, total))
    }

    /// Non-terminal deposits expiring within `days`, soonest first.
    pub async fn expiring_within(&self, days: i64) -> Result<Vec<deposit::Model>, ServiceError> {
        let now = Utc::now();
        deposit::Entity::find()
            .filter(deposit::Column::State.is_in([DepositState::Active, DepositState::NearExpiration]))
            .filter(deposit::Column::ExpirationDate.gte(now))
            .filter(deposit::Column::ExpirationDate.lte(now + Duration::days(days)))
            .order_by_asc(deposit::Column::ExpirationDate)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Non-terminal deposits whose expiration date has passed.
    pub async fn expired(&self) -> Result<Vec<deposit::Model>, ServiceError> {
        deposit::Entity::find()
            .filter(deposit::Column::State.is_not_in([DepositState::Retired, DepositState::Invoiced]))
            .filter(deposit::Column::ExpirationDate.lt(Utc::now()))
            .order_by_asc(deposit::Column::ExpirationDate)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Id and code of every non-retired deposit, oldest first. Reads only the
    /// two columns so callers can load each deposit on its own.
    pub async fn active_deposit_keys(&self) -> Result<Vec<(Uuid, String)>, ServiceError> {
        deposit::Entity::find()
            .select_only()
            .column(deposit::Column::Id)
            .column(deposit::Column::Code)
            .filter(deposit::Column::State.ne(DepositState::Retired))
            .order_by_asc(deposit::Column::CreatedAt)
            .into_tuple()
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }

    /// Movement ledger of a deposit, newest first.
    pub async fn history(&self, id: Uuid) -> Result<Vec<movement::Model>, ServiceError> {
        self.get(id).await?;
        self.movements.history(id).await
    }

    async fn find_in<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<deposit::Model, ServiceError> {
        deposit::Entity::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::not_found("Deposit", id))
    }

    /// Writes `updated` only if the stored row still carries `expected_version`.
    async fn save_versioned<C: ConnectionTrait>(
        conn: &C,
        expected_version: i32,
        mut updated: deposit::Model,
    ) -> Result<deposit::Model, ServiceError> {
        let id = updated.id;
        updated.version = expected_version + 1;
        updated.updated_at = Utc::now();

        let result = deposit::Entity::update_many()
            .set(deposit::ActiveModel::from(updated.clone()).reset_all())
            .filter(deposit::Column::Id.eq(id))
            .filter(deposit::Column::Version.eq(expected_version))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            warn!(deposit_id = %id, expected_version, "stale deposit write rejected");
            return Err(ServiceError::ConcurrentModification(id));
        }
        Ok(updated)
    }
}
