//! Tests for the tracker abstraction helpers.

use super::*;
use std::time::Duration;

#[test]
fn budget_starts_unsaturated() {
    let budget = RateLimitBudget::default();
    assert!(!budget.is_saturated(Timestamp::now()));
}

#[test]
fn budget_trips_below_floor_until_reset() {
    let now = Timestamp::now();
    let budget = RateLimitBudget::with_floor(10);

    budget.record(3, Some(now.add_seconds(120)));
    assert!(budget.is_saturated(now));

    // Past the reset the budget opens again.
    assert!(!budget.is_saturated(now.add_duration(Duration::from_secs(121))));
}

#[test]
fn budget_recovers_on_fresh_observation() {
    let now = Timestamp::now();
    let budget = RateLimitBudget::with_floor(10);

    budget.record(2, Some(now.add_seconds(60)));
    assert!(budget.is_saturated(now));

    budget.record(500, Some(now.add_seconds(60)));
    assert!(!budget.is_saturated(now));
}

#[test]
fn rate_limited_error_is_detectable() {
    let err = TrackerError::RateLimited {
        reset_at: Timestamp::now(),
    };
    assert!(err.is_rate_limited());

    let err = TrackerError::Http {
        status: Some(500),
        message: "boom".to_string(),
    };
    assert!(!err.is_rate_limited());
}
