use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Days before expiration at which a deposit is considered near expiration.
pub const DEFAULT_EXPIRY_WINDOW_DAYS: i64 = 30;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Largest amount a `NUMERIC(19, 4)` money column holds.
pub const MAX_AMOUNT: Decimal = dec!(999999999999999.9999);

/// A unit value and quantity whose product does not fit a money column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("total value out of range")]
pub struct TotalOutOfRange;

/// Operational state of a deposit.
///
/// `Retired` and `Invoiced` are terminal: date-driven re-derivation never
/// overrides them. The external "active" flag is derived from this enum.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum DepositState {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "near_expiration")]
    NearExpiration,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "retired")]
    Retired,
    #[sea_orm(string_value = "invoiced")]
    Invoiced,
}

impl DepositState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DepositState::Retired | DepositState::Invoiced)
    }

    /// Soft-delete flag as seen by collaborators.
    pub fn is_active(self) -> bool {
        self != DepositState::Retired
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DepositState::Active => "active",
            DepositState::NearExpiration => "near_expiration",
            DepositState::Expired => "expired",
            DepositState::Retired => "retired",
            DepositState::Invoiced => "invoiced",
        }
    }
}

/// Whole days until `expiration`, rounded up. Negative once expired.
pub fn days_to_expiry(expiration: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (expiration - now).num_milliseconds();
    // integer division truncates toward zero, which is already the ceiling for negatives
    let days = millis / MILLIS_PER_DAY;
    if millis % MILLIS_PER_DAY > 0 {
        days + 1
    } else {
        days
    }
}

/// Pure date-derivation rule.
pub fn derive_state(
    active: bool,
    expiration: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_days: i64,
) -> DepositState {
    if !active {
        return DepositState::Retired;
    }
    match expiration {
        None => DepositState::Active,
        Some(expiration) => state_for_days(days_to_expiry(expiration, now), window_days),
    }
}

pub fn state_for_days(days: i64, window_days: i64) -> DepositState {
    if days < 0 {
        DepositState::Expired
    } else if days <= window_days {
        DepositState::NearExpiration
    } else {
        DepositState::Active
    }
}

pub fn compute_total(unit_value: Decimal, quantity: i32) -> Result<Decimal, TotalOutOfRange> {
    unit_value
        .checked_mul(Decimal::from(quantity))
        .filter(|total| total.abs() <= MAX_AMOUNT)
        .ok_or(TotalOutOfRange)
}

/// A quantity of one product held at one client site.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "deposits")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Sequence-allocated identifier, e.g. `DEP-2025-0000001`
    #[sea_orm(unique)]
    pub code: String,

    pub product_id: Uuid,

    pub site_id: Uuid,

    pub quantity: i32,

    pub deposit_date: DateTime<Utc>,

    pub expiration_date: Option<DateTime<Utc>>,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub unit_value: Decimal,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_value: Decimal,

    pub state: DepositState,

    pub invoice_ref: Option<String>,

    pub invoiced_at: Option<DateTime<Utc>>,

    pub retired_at: Option<DateTime<Utc>>,

    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,

    /// Optimistic concurrency token
    pub version: i32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    Product,
    #[sea_orm(
        belongs_to = "super::site::Entity",
        from = "Column::SiteId",
        to = "super::site::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    Site,
    #[sea_orm(has_many = "super::alert::Entity")]
    Alerts,
    #[sea_orm(has_many = "super::movement::Entity")]
    Movements,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::site::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Site.def()
    }
}

impl Related<super::alert::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Alerts.def()
    }
}

impl Related<super::movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Movements.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn days_to_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiration_date.map(|exp| days_to_expiry(exp, now))
    }

    /// State the dates call for, or the current state when it is terminal.
    pub fn rederive_state(&self, now: DateTime<Utc>, window_days: i64) -> DepositState {
        if self.is_terminal() {
            return self.state;
        }
        derive_state(self.is_active(), self.expiration_date, now, window_days)
    }

    /// Recomputes the derived total and state in place. Leaves the model
    /// untouched when the total does not fit.
    pub fn refresh_derived(
        &mut self,
        now: DateTime<Utc>,
        window_days: i64,
    ) -> Result<(), TotalOutOfRange> {
        self.total_value = compute_total(self.unit_value, self.quantity)?;
        self.state = self.rederive_state(now, window_days);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn deposit(state: DepositState, expiration: Option<DateTime<Utc>>) -> Model {
        Model {
            id: Uuid::new_v4(),
            code: "DEP-2025-0000001".into(),
            product_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            quantity: 10,
            deposit_date: now() - Duration::days(10),
            expiration_date: expiration,
            unit_value: dec!(50),
            total_value: dec!(500),
            state,
            invoice_ref: None,
            invoiced_at: None,
            retired_at: None,
            notes: None,
            version: 1,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[rstest]
    #[case(Duration::days(25), 25)]
    #[case(Duration::days(25) - Duration::seconds(1), 25)]
    #[case(Duration::days(24) + Duration::seconds(1), 25)]
    #[case(Duration::zero(), 0)]
    #[case(Duration::hours(-12), 0)]
    #[case(Duration::days(-1), -1)]
    #[case(Duration::days(-1) - Duration::seconds(1), -1)]
    #[case(Duration::days(-2), -2)]
    fn days_to_expiry_rounds_up(#[case] offset: Duration, #[case] expected: i64) {
        assert_eq!(days_to_expiry(now() + offset, now()), expected);
    }

    #[rstest]
    #[case(-1, DepositState::Expired)]
    #[case(0, DepositState::NearExpiration)]
    #[case(7, DepositState::NearExpiration)]
    #[case(30, DepositState::NearExpiration)]
    #[case(31, DepositState::Active)]
    #[case(365, DepositState::Active)]
    fn state_boundaries(#[case] days: i64, #[case] expected: DepositState) {
        assert_eq!(state_for_days(days, DEFAULT_EXPIRY_WINDOW_DAYS), expected);
        let expiration = now() + Duration::days(days);
        assert_eq!(
            derive_state(true, Some(expiration), now(), DEFAULT_EXPIRY_WINDOW_DAYS),
            expected
        );
    }

    #[test]
    fn inactive_derives_retired_and_no_expiration_is_active() {
        assert_eq!(
            derive_state(false, None, now(), DEFAULT_EXPIRY_WINDOW_DAYS),
            DepositState::Retired
        );
        assert_eq!(
            derive_state(true, None, now(), DEFAULT_EXPIRY_WINDOW_DAYS),
            DepositState::Active
        );
    }

    #[rstest]
    #[case(DepositState::Invoiced)]
    #[case(DepositState::Retired)]
    fn terminal_states_survive_rederivation(#[case] state: DepositState) {
        let mut d = deposit(state, Some(now() - Duration::days(3)));
        d.quantity = 4;
        d.refresh_derived(now(), DEFAULT_EXPIRY_WINDOW_DAYS).unwrap();
        assert_eq!(d.state, state);
        assert_eq!(d.total_value, dec!(200));
    }

    #[test]
    fn refresh_derived_follows_dates() {
        let mut d = deposit(DepositState::Active, Some(now() + Duration::days(25)));
        d.refresh_derived(now(), DEFAULT_EXPIRY_WINDOW_DAYS).unwrap();
        assert_eq!(d.state, DepositState::NearExpiration);
        assert_eq!(d.days_to_expiry(now()), Some(25));

        d.expiration_date = Some(now() + Duration::days(40));
        d.refresh_derived(now(), DEFAULT_EXPIRY_WINDOW_DAYS).unwrap();
        assert_eq!(d.state, DepositState::Active);
    }

    #[test]
    fn only_retired_clears_active_flag() {
        assert!(DepositState::Invoiced.is_active());
        assert!(DepositState::Expired.is_active());
        assert!(!DepositState::Retired.is_active());
        assert!(DepositState::Invoiced.is_terminal());
        assert!(!DepositState::Expired.is_terminal());
    }

    #[test]
    fn oversized_totals_are_rejected() {
        assert_eq!(compute_total(dec!(2.5), 4), Ok(dec!(10)));
        assert_eq!(compute_total(MAX_AMOUNT, 1), Ok(MAX_AMOUNT));
        assert_eq!(compute_total(MAX_AMOUNT, 2), Err(TotalOutOfRange));
        assert_eq!(compute_total(Decimal::MAX / dec!(2), 10), Err(TotalOutOfRange));

        let mut d = deposit(DepositState::Active, None);
        d.unit_value = Decimal::MAX / dec!(3);
        d.quantity = 5;
        assert_eq!(
            d.refresh_derived(now(), DEFAULT_EXPIRY_WINDOW_DAYS),
            Err(TotalOutOfRange)
        );
        assert_eq!(d.total_value, dec!(500));
    }
}
