use crate::{
    db::DbPool,
    entities::movement::{self, MovementType},
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A movement to append to a deposit's ledger.
#[derive(Debug, Clone)]
pub struct NewMovement {
    pub deposit_id: Uuid,
    pub movement_type: MovementType,
    pub quantity: i32,
    pub occurred_at: DateTime<Utc>,
    pub actor: String,
    pub description: String,
}

/// Append-only history of every state-changing deposit operation.
#[derive(Clone)]
pub struct MovementLedger {
    db_pool: Arc<DbPool>,
}

impl MovementLedger {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Appends a movement using the caller's connection or transaction.
    pub async fn record<C: ConnectionTrait>(
        conn: &C,
        movement: NewMovement,
    ) -> Result<movement::Model, ServiceError> {
        debug!(
            deposit_id = %movement.deposit_id,
            movement_type = ?movement.movement_type,
            "recording movement"
        );
        movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            deposit_id: Set(movement.deposit_id),
            movement_type: Set(movement.movement_type),
            quantity: Set(movement.quantity),
            occurred_at: Set(movement.occurred_at),
            actor: Set(movement.actor),
            description: Set(movement.description),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    /// Ledger of a deposit, newest first.
    pub async fn history(&self, deposit_id: Uuid) -> Result<Vec<movement::Model>, ServiceError> {
        movement::Entity::find()
            .filter(movement::Column::DepositId.eq(deposit_id))
            .order_by_desc(movement::Column::OccurredAt)
            .order_by_desc(movement::Column::CreatedAt)
            .all(self.db_pool.as_ref())
            .await
            .map_err(ServiceError::db_error)
    }
}
