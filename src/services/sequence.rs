use crate::{
    db::{self, DbPool},
    entities::{client, deposit, sequence_counter, site},
    errors::ServiceError,
};
use chrono::{Datelike, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const DEPOSIT_WIDTH: usize = 7;
const CLIENT_WIDTH: usize = 5;
const SITE_WIDTH: usize = 7;

/// Identifier families handed out by [`SequenceAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// `DEP-{year}-0000001`
    Deposit { year: i32 },
    /// `CLI-00001`
    Client,
    /// `SUB-CLI-00001`
    SubClient,
    /// `EMP-OMN-0000001`
    Site,
}

impl SequenceKind {
    pub fn deposit_for_current_year() -> Self {
        SequenceKind::Deposit {
            year: Utc::now().year(),
        }
    }

    pub fn prefix(&self) -> String {
        match self {
            SequenceKind::Deposit { year } => format!("DEP-{}-", year),
            SequenceKind::Client => "CLI-".to_string(),
            SequenceKind::SubClient => "SUB-CLI-".to_string(),
            SequenceKind::Site => "EMP-OMN-".to_string(),
        }
    }

    pub fn width(&self) -> usize {
        match self {
            SequenceKind::Deposit { .. } => DEPOSIT_WIDTH,
            SequenceKind::Client | SequenceKind::SubClient => CLIENT_WIDTH,
            SequenceKind::Site => SITE_WIDTH,
        }
    }

    /// Recognizes a prefix produced by [`SequenceKind::prefix`].
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "CLI-" => Some(SequenceKind::Client),
            "SUB-CLI-" => Some(SequenceKind::SubClient),
            "EMP-OMN-" => Some(SequenceKind::Site),
            _ => {
                let year = prefix.strip_prefix("DEP-")?.strip_suffix('-')?;
                if year.len() != 4 {
                    return None;
                }
                year.parse().ok().map(|year| SequenceKind::Deposit { year })
            }
        }
    }
}

pub fn format_identifier(prefix: &str, value: i64, width: usize) -> String {
    format!("{}{:0width$}", prefix, value, width = width)
}

/// Numeric suffix of an identifier issued under `prefix`.
pub fn parse_suffix(prefix: &str, identifier: &str) -> Option<i64> {
    let digits = identifier.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Hands out unique, strictly increasing identifiers per prefix.
///
/// Each prefix owns a row in `sequence_counters`; allocation increments it
/// in place, so concurrent callers serialize on that row. The first call for
/// a prefix seeds the counter from the highest identifier already stored.
#[derive(Clone)]
pub struct SequenceAllocator {
    db_pool: Arc<DbPool>,
}

impl SequenceAllocator {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Allocates the next identifier for `prefix` in its own transaction.
    #[instrument(skip(self))]
    pub async fn next(&self, prefix: &str) -> Result<String, ServiceError> {
        let prefix = prefix.to_string();
        db::transaction(&self.db_pool, "sequence.next", move |txn| {
            Box::pin(async move { Self::next_in(txn, &prefix).await })
        })
        .await
    }

    pub async fn next_for(&self, kind: SequenceKind) -> Result<String, ServiceError> {
        self.next(&kind.prefix()).await
    }

    /// Allocates inside the caller's transaction so the identifier and the
    /// row that carries it commit or roll back together.
    pub async fn next_in<C: ConnectionTrait>(conn: &C, prefix: &str) -> Result<String, ServiceError> {
        if prefix.is_empty() {
            return Err(ServiceError::ValidationError(
                "sequence prefix cannot be empty".to_string(),
            ));
        }
        let width = SequenceKind::from_prefix(prefix)
            .map(|kind| kind.width())
            .unwrap_or(DEPOSIT_WIDTH);

        let value = Self::increment(conn, prefix).await.map_err(|e| {
            warn!(prefix, error = %e, "sequence allocation failed");
            ServiceError::SequenceError(format!("prefix {}: {}", prefix, e))
        })?;

        if value >= 10_i64.pow(width as u32) {
            return Err(ServiceError::SequenceError(format!(
                "prefix {} exhausted its {}-digit range",
                prefix, width
            )));
        }

        counter!("sequence.allocated", 1);
        let identifier = format_identifier(prefix, value, width);
        debug!(%identifier, "allocated identifier");
        Ok(identifier)
    }

    /// Last value issued for `prefix`, if any.
    pub async fn current(&self, prefix: &str) -> Result<Option<i64>, ServiceError> {
        let row = sequence_counter::Entity::find_by_id(prefix.to_string())
            .one(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        Ok(row.map(|r| r.last_value))
    }

    async fn increment<C: ConnectionTrait>(conn: &C, prefix: &str) -> Result<i64, DbErr> {
        let existing = sequence_counter::Entity::find_by_id(prefix.to_string())
            .one(conn)
            .await?;

        if existing.is_none() {
            let seed = Self::highest_issued(conn, prefix).await?;
            // A concurrent first caller may win this insert; its seed is the same.
            sequence_counter::Entity::insert(sequence_counter::ActiveModel {
                prefix: Set(prefix.to_string()),
                last_value: Set(seed),
                updated_at: Set(Utc::now()),
            })
            .on_conflict(
                OnConflict::column(sequence_counter::Column::Prefix)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        }

        let updated = sequence_counter::Entity::update_many()
            .col_expr(
                sequence_counter::Column::LastValue,
                Expr::col(sequence_counter::Column::LastValue).add(1),
            )
            .col_expr(sequence_counter::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sequence_counter::Column::Prefix.eq(prefix))
            .exec(conn)
            .await?;

        if updated.rows_affected != 1 {
            return Err(DbErr::RecordNotUpdated);
        }

        sequence_counter::Entity::find_by_id(prefix.to_string())
            .one(conn)
            .await?
            .map(|row| row.last_value)
            .ok_or_else(|| DbErr::RecordNotFound(format!("sequence counter {}", prefix)))
    }

    /// Highest suffix already present in the table that owns `prefix`.
    async fn highest_issued<C: ConnectionTrait>(conn: &C, prefix: &str) -> Result<i64, DbErr> {
        let code: Option<String> = match SequenceKind::from_prefix(prefix) {
            Some(SequenceKind::Deposit { .. }) => {
                deposit::Entity::find()
                    .select_only()
                    .column(deposit::Column::Code)
                    .filter(deposit::Column::Code.starts_with(prefix))
                    .order_by_desc(deposit::Column::Code)
                    .into_tuple()
                    .one(conn)
                    .await?
            }
            Some(SequenceKind::Client) | Some(SequenceKind::SubClient) => {
                client::Entity::find()
                    .select_only()
                    .column(client::Column::Code)
                    .filter(client::Column::Code.starts_with(prefix))
                    .order_by_desc(client::Column::Code)
                    .into_tuple()
                    .one(conn)
                    .await?
            }
            Some(SequenceKind::Site) => {
                site::Entity::find()
                    .select_only()
                    .column(site::Column::Code)
                    .filter(site::Column::Code.starts_with(prefix))
                    .order_by_desc(site::Column::Code)
                    .into_tuple()
                    .one(conn)
                    .await?
            }
            None => None,
        };

        Ok(match code {
            Some(code) => parse_suffix(prefix, &code).unwrap_or_else(|| {
                warn!(prefix, %code, "ignoring malformed identifier while seeding sequence");
                0
            }),
            None => 0,
        })
    }
}
