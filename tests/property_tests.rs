//! Property-based tests for the deposit lifecycle rules.
//!
//! Everything here is pure: state derivation, totals, alert classification
//! and identifier formatting.

use chrono::{DateTime, Duration, TimeZone, Utc};
use deposit_api::{
    entities::{
        alert::{AlertPriority, AlertType},
        deposit::{self, DepositState, DEFAULT_EXPIRY_WINDOW_DAYS},
    },
    services::{
        alerts::{classify_expiration, high_value_priority},
        sequence::{format_identifier, parse_suffix},
    },
};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap()
}

// Strategies for generating test data
fn unit_value_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000, 0u32..5).prop_map(|(mantissa, scale)| Decimal::new(mantissa, scale))
}

fn quantity_strategy() -> impl Strategy<Value = i32> {
    0i32..1_000_000
}

fn offset_strategy() -> impl Strategy<Value = i64> {
    // seconds, roughly two years either side
    -63_072_000i64..63_072_000
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn total_is_unit_value_times_quantity(unit in unit_value_strategy(), qty in quantity_strategy()) {
        let total = deposit::compute_total(unit, qty).unwrap();
        prop_assert_eq!(total, unit * Decimal::from(qty));
        prop_assert!(!total.is_sign_negative());
    }

    #[test]
    fn derivation_matches_day_count(offset in offset_strategy()) {
        let expiration = now() + Duration::seconds(offset);
        let days = deposit::days_to_expiry(expiration, now());
        let state = deposit::derive_state(true, Some(expiration), now(), DEFAULT_EXPIRY_WINDOW_DAYS);

        let expected = if days < 0 {
            DepositState::Expired
        } else if days <= DEFAULT_EXPIRY_WINDOW_DAYS {
            DepositState::NearExpiration
        } else {
            DepositState::Active
        };
        prop_assert_eq!(state, expected);
    }

    #[test]
    fn days_to_expiry_is_a_ceiling(offset in offset_strategy()) {
        let days = deposit::days_to_expiry(now() + Duration::seconds(offset), now());
        let exact = offset as f64 / 86_400.0;
        prop_assert!((days as f64) >= exact);
        prop_assert!((days as f64) - exact < 1.0);
    }

    #[test]
    fn inactive_is_always_retired(offset in proptest::option::of(offset_strategy())) {
        let expiration = offset.map(|o| now() + Duration::seconds(o));
        prop_assert_eq!(
            deposit::derive_state(false, expiration, now(), DEFAULT_EXPIRY_WINDOW_DAYS),
            DepositState::Retired
        );
    }

    #[test]
    fn expiration_alerts_escalate_as_days_shrink(days in -400i64..=30) {
        let (alert_type, priority) = classify_expiration(days);
        if days < 0 {
            prop_assert_eq!(alert_type, AlertType::ExpirationPassed);
        } else {
            prop_assert_eq!(alert_type, AlertType::ExpirationNear);
        }
        if days > 0 {
            let (_, sooner) = classify_expiration(days - 1);
            prop_assert!(sooner >= priority);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn high_value_only_above_threshold(total in unit_value_strategy(), threshold in 1i64..1_000_000) {
        let threshold = Decimal::from(threshold);
        match high_value_priority(total, threshold) {
            None => prop_assert!(total <= threshold),
            Some(AlertPriority::High) => prop_assert!(total > threshold * Decimal::from(2)),
            Some(AlertPriority::Medium) => {
                prop_assert!(total > threshold);
                prop_assert!(total <= threshold * Decimal::from(2));
            }
            Some(other) => prop_assert!(false, "unexpected priority {:?}", other),
        }
    }

    #[test]
    fn identifiers_sort_like_their_values(a in 1i64..9_999_999, b in 1i64..9_999_999) {
        let left = format_identifier("DEP-2025-", a, 7);
        let right = format_identifier("DEP-2025-", b, 7);
        prop_assert_eq!(left.cmp(&right), a.cmp(&b));
        prop_assert_eq!(parse_suffix("DEP-2025-", &left), Some(a));
    }
}
