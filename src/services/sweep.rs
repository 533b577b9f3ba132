use crate::{
    config::AppConfig,
    db::DbPool,
    entities::{
        alert::{self, AlertType},
        deposit::{self, DepositState},
        job_lease,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        alerts::{AlertEngine, AlertFilter},
        deposits::DepositService,
    },
};
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, Condition, EntityTrait, QueryFilter, QuerySelect, RelationTrait, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const SWEEP_JOB_NAME: &str = "reconciliation_sweep";

/// One deposit the sweep could not process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepError {
    /// `None` for failures outside the per-deposit loop.
    pub deposit_id: Option<Uuid>,
    pub deposit_code: Option<String>,
    pub code: String,
    pub message: String,
}

impl SweepError {
    fn for_deposit(deposit_id: Uuid, deposit_code: &str, error: &ServiceError) -> Self {
        Self {
            deposit_id: Some(deposit_id),
            deposit_code: Some(deposit_code.to_string()),
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }

    fn general(error: &ServiceError) -> Self {
        Self {
            deposit_id: None,
            deposit_code: None,
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deposits_scanned: u64,
    pub states_updated: u64,
    pub expiration_alerts_created: u64,
    pub high_value_alerts_created: u64,
    pub alerts_resolved: u64,
    pub cancelled: bool,
    pub errors: Vec<SweepError>,
}

impl SweepSummary {
    fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            deposits_scanned: 0,
            states_updated: 0,
            expiration_alerts_created: 0,
            high_value_alerts_created: 0,
            alerts_resolved: 0,
            cancelled: false,
            errors: Vec::new(),
        }
    }

    pub fn alerts_created(&self) -> u64 {
        self.expiration_alerts_created + self.high_value_alerts_created
    }
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub high_value_threshold: Decimal,
    pub lease_ttl: Duration,
    /// Identifies this instance in the lease row.
    pub holder: String,
}

impl SweepSettings {
    pub fn new(high_value_threshold: Decimal, lease_ttl: Duration) -> Self {
        Self {
            high_value_threshold,
            lease_ttl,
            holder: format!("sweep-{}", Uuid::new_v4()),
        }
    }
}

impl From<&AppConfig> for SweepSettings {
    fn from(config: &AppConfig) -> Self {
        Self::new(
            config.high_value_threshold,
            Duration::seconds(config.sweep_lease_ttl_secs as i64),
        )
    }
}

/// Full reconciliation pass over every deposit whose active flag is set.
///
/// Per deposit: persist the re-derived state, raise expiration and
/// high-value alerts, then resolve alerts whose condition has cleared.
/// Failures are collected in the summary and never abort the pass. Only one
/// sweep runs at a time: an in-process lock guards this instance and a lease
/// row in `job_leases` guards the others.
pub struct ReconciliationSweep {
    db_pool: Arc<DbPool>,
    deposits: Arc<DepositService>,
    alerts: Arc<AlertEngine>,
    event_sender: Arc<EventSender>,
    settings: SweepSettings,
    running: Mutex<()>,
}

impl ReconciliationSweep {
    pub fn new(
        db_pool: Arc<DbPool>,
        deposits: Arc<DepositService>,
        alerts: Arc<AlertEngine>,
        event_sender: Arc<EventSender>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            db_pool,
            deposits,
            alerts,
            event_sender,
            settings,
            running: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<SweepSummary, ServiceError> {
        let (_never_cancel, cancel) = watch::channel(false);
        self.run_with_cancel(cancel).await
    }

    /// Runs a sweep that stops between deposits once `cancel` reads `true`.
    /// A busy sweep yields `ServiceError::Conflict`.
    #[instrument(skip(self, cancel))]
    pub async fn run_with_cancel(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<SweepSummary, ServiceError> {
        let _guard = self.running.try_lock().map_err(|_| {
            ServiceError::Conflict("a reconciliation sweep is already running".to_string())
        })?;

        self.acquire_lease().await?;
        let summary = self.sweep(&cancel).await;
        if let Err(e) = self.release_lease().await {
            warn!(error = %e, "failed to release sweep lease");
        }
        summary
    }

    async fn sweep(&self, cancel: &watch::Receiver<bool>) -> Result<SweepSummary, ServiceError> {
        let timer = std::time::Instant::now();
        let now = Utc::now();
        let mut summary = SweepSummary::started(now);
        counter!("sweep.runs", 1);
        info!("reconciliation sweep started");

        // Rows are decoded one at a time so a malformed deposit only fails itself.
        let candidates = self.deposits.active_deposit_keys().await?;
        for (deposit_id, code) in candidates {
            if *cancel.borrow() {
                info!(
                    scanned = summary.deposits_scanned,
                    "sweep cancelled, returning partial summary"
                );
                summary.cancelled = true;
                break;
            }

            summary.deposits_scanned += 1;
            let outcome = match self.deposits.get(deposit_id).await {
                Ok(deposit) => self.reconcile(&deposit, now, &mut summary).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(%deposit_id, %code, error = %e, "sweep item failed");
                summary.errors.push(SweepError::for_deposit(deposit_id, &code, &e));
            }
        }

        if !summary.cancelled {
            match self.resolve_retired_alerts().await {
                Ok(resolved) => summary.alerts_resolved += resolved,
                Err(e) => {
                    warn!(error = %e, "could not resolve alerts of retired deposits");
                    summary.errors.push(SweepError::general(&e));
                }
            }
        }

        summary.finished_at = Utc::now();
        histogram!("sweep.duration", timer.elapsed().as_secs_f64());
        counter!("sweep.errors", summary.errors.len() as u64);
        info!(
            scanned = summary.deposits_scanned,
            states_updated = summary.states_updated,
            expiration_alerts = summary.expiration_alerts_created,
            high_value_alerts = summary.high_value_alerts_created,
            resolved = summary.alerts_resolved,
            errors = summary.errors.len(),
            cancelled = summary.cancelled,
            "reconciliation sweep finished"
        );

        self.event_sender
            .publish(Event::SweepCompleted {
                expiration_alerts_created: summary.expiration_alerts_created,
                high_value_alerts_created: summary.high_value_alerts_created,
                errors: summary.errors.len(),
                cancelled: summary.cancelled,
            })
            .await;

        Ok(summary)
    }

    async fn reconcile(
        &self,
        deposit: &deposit::Model,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), ServiceError> {
        let mut current = deposit.clone();
        if !current.is_terminal() {
            if let Some(saved) = self.deposits.refresh_state(&current, now).await? {
                summary.states_updated += 1;
                current = saved;
            }
        }

        let window = self.alerts.expiry_window_days();
        let days = current.days_to_expiry(now);
        // Cleared alerts go first so superseded ones are counted here.
        summary.alerts_resolved += self.resolve_cleared(&current, days).await?;

        if matches!(days, Some(d) if d <= window)
            && self.alerts.raise_expiration_alert(&current).await?.is_created()
        {
            summary.expiration_alerts_created += 1;
        }

        let threshold = self.settings.high_value_threshold;
        if current.total_value > threshold
            && self
                .alerts
                .raise_high_value_alert(&current, threshold)
                .await?
                .is_created()
        {
            summary.high_value_alerts_created += 1;
        }
        Ok(())
    }

    /// Resolves open alerts whose condition no longer holds for `deposit`.
    async fn resolve_cleared(
        &self,
        deposit: &deposit::Model,
        days: Option<i64>,
    ) -> Result<u64, ServiceError> {
        let window = self.alerts.expiry_window_days();
        let mut cleared: Vec<(AlertType, &str)> = Vec::new();

        match days {
            None => {
                cleared.push((AlertType::ExpirationNear, "Deposit no longer has an expiration date"));
                cleared.push((AlertType::ExpirationPassed, "Deposit no longer has an expiration date"));
            }
            Some(d) if d > window => {
                cleared.push((AlertType::ExpirationNear, "Deposit is outside the expiration window"));
                cleared.push((AlertType::ExpirationPassed, "Deposit is no longer expired"));
            }
            Some(d) if d >= 0 => {
                cleared.push((AlertType::ExpirationPassed, "Deposit is no longer expired"));
            }
            Some(_) => {
                cleared.push((AlertType::ExpirationNear, "Superseded: deposit has expired"));
            }
        }
        if deposit.total_value <= self.settings.high_value_threshold {
            cleared.push((AlertType::HighValue, "Deposit value is within the threshold"));
        }

        let mut resolved = 0;
        for (alert_type, note) in cleared {
            let filter = AlertFilter::for_deposit(deposit.id).with_types(&[alert_type]);
            resolved += self.alerts.resolve_by_condition(&filter, note).await?;
        }
        if resolved > 0 {
            debug!(deposit_id = %deposit.id, resolved, "cleared stale alerts");
        }
        Ok(resolved)
    }

    async fn resolve_retired_alerts(&self) -> Result<u64, ServiceError> {
        let ids: Vec<Uuid> = alert::Entity::find()
            .select_only()
            .column(alert::Column::Id)
            .join(sea_orm::JoinType::InnerJoin, alert::Relation::Deposit.def())
            .filter(alert::Column::Resolved.eq(false))
            .filter(deposit::Column::State.eq(DepositState::Retired))
            .into_tuple()
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?;

        if ids.is_empty() {
            return Ok(0);
        }
        self.alerts
            .resolve_many(&ids, Some("Deposit retired".to_string()))
            .await
    }

    async fn acquire_lease(&self) -> Result<(), ServiceError> {
        let db = self.db_pool.as_ref();
        let now = Utc::now();
        let expires_at = now + self.settings.lease_ttl;
        let holder = self.settings.holder.clone();

        let inserted = job_lease::Entity::insert(job_lease::ActiveModel {
            name: Set(SWEEP_JOB_NAME.to_string()),
            holder: Set(holder.clone()),
            acquired_at: Set(now),
            expires_at: Set(expires_at),
        })
        .on_conflict(
            OnConflict::column(job_lease::Column::Name)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await
        .map_err(ServiceError::db_error)?;

        if inserted == 1 {
            debug!(%holder, "sweep lease acquired");
            return Ok(());
        }

        // Take over a lease that expired or that we already hold.
        let taken = job_lease::Entity::update_many()
            .col_expr(job_lease::Column::Holder, Expr::value(holder.clone()))
            .col_expr(job_lease::Column::AcquiredAt, Expr::value(now))
            .col_expr(job_lease::Column::ExpiresAt, Expr::value(expires_at))
            .filter(job_lease::Column::Name.eq(SWEEP_JOB_NAME))
            .filter(
                Condition::any()
                    .add(job_lease::Column::ExpiresAt.lt(now))
                    .add(job_lease::Column::Holder.eq(holder.clone())),
            )
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;

        if taken.rows_affected == 1 {
            debug!(%holder, "sweep lease taken over");
            Ok(())
        } else {
            Err(ServiceError::Conflict(
                "a reconciliation sweep is already running on another instance".to_string(),
            ))
        }
    }

    async fn release_lease(&self) -> Result<(), ServiceError> {
        job_lease::Entity::delete_many()
            .filter(job_lease::Column::Name.eq(SWEEP_JOB_NAME))
            .filter(job_lease::Column::Holder.eq(self.settings.holder.clone()))
            .exec(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }
}

/// Runs the sweep every `interval` until `shutdown` flips to `true`.
/// The same receiver cancels an in-flight sweep.
pub fn spawn_scheduler(
    sweep: Arc<ReconciliationSweep>,
    interval: std::time::Duration,
    run_on_start: bool,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), run_on_start, "sweep scheduler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !run_on_start {
            // the first tick completes immediately
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep.run_with_cancel(shutdown.clone()).await {
                        Ok(summary) => debug!(created = summary.alerts_created(), "scheduled sweep done"),
                        Err(ServiceError::Conflict(reason)) => info!(%reason, "scheduled sweep skipped"),
                        Err(e) => error!(error = %e, "scheduled sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("sweep scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn summary_starts_empty() {
        let now = Utc::now();
        let summary = SweepSummary::started(now);
        assert_eq!(summary.alerts_created(), 0);
        assert!(summary.errors.is_empty());
        assert!(!summary.cancelled);
        assert_eq!(summary.started_at, summary.finished_at);
    }

    #[test]
    fn summary_serializes_errors_even_when_empty() {
        let summary = SweepSummary::started(Utc::now());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["errors"], serde_json::json!([]));
        assert_eq!(json["expiration_alerts_created"], 0);
    }

    #[test]
    fn settings_get_unique_holders() {
        let a = SweepSettings::new(dec!(10000), Duration::minutes(15));
        let b = SweepSettings::new(dec!(10000), Duration::minutes(15));
        assert_ne!(a.holder, b.holder);
    }
}
