use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    #[sea_orm(string_value = "expiration_near")]
    ExpirationNear,
    #[sea_orm(string_value = "expiration_passed")]
    ExpirationPassed,
    #[sea_orm(string_value = "high_value")]
    HighValue,
    #[sea_orm(string_value = "low_stock")]
    LowStock,
    #[sea_orm(string_value = "no_activity")]
    NoActivity,
    #[sea_orm(string_value = "custom")]
    Custom,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::ExpirationNear => "expiration_near",
            AlertType::ExpirationPassed => "expiration_passed",
            AlertType::HighValue => "high_value",
            AlertType::LowStock => "low_stock",
            AlertType::NoActivity => "no_activity",
            AlertType::Custom => "custom",
        }
    }

    pub fn is_expiration(self) -> bool {
        matches!(self, AlertType::ExpirationNear | AlertType::ExpirationPassed)
    }
}

/// Stored as its rank so the store can order by urgency.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    #[sea_orm(num_value = 1)]
    Low,
    #[sea_orm(num_value = 2)]
    Medium,
    #[sea_orm(num_value = 3)]
    High,
    #[sea_orm(num_value = 4)]
    Critical,
}

/// One actionable condition, optionally tied to a deposit, site or product.
///
/// At most one unresolved alert may exist per (alert_type, deposit_id); the
/// migration backs this with a partial unique index.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "alerts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub alert_type: AlertType,

    pub priority: AlertPriority,

    pub deposit_id: Option<Uuid>,

    pub site_id: Option<Uuid>,

    pub product_id: Option<Uuid>,

    pub title: String,

    #[sea_orm(column_type = "Text")]
    pub description: String,

    pub resolved: bool,

    pub resolved_at: Option<DateTime<Utc>>,

    #[sea_orm(column_type = "Text", nullable)]
    pub resolution_note: Option<String>,

    #[sea_orm(column_type = "Json")]
    pub metadata: Json,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::deposit::Entity",
        from = "Column::DepositId",
        to = "super::deposit::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Deposit,
}

impl Related<super::deposit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Deposit.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_open(&self) -> bool {
        !self.resolved
    }
}
