//! Rate schedules and fee computation
//!
//! The fee engine is a pure function of (entry, exit, schedule) with no
//! hardware or clock dependencies. All amounts are integer minor currency
//! units (whole rupiah). Partial hours bill as full hours; stays beyond a day
//! pro-rate against the weekly and monthly rates.

use crate::domain::types::VehicleClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SECS_PER_HOUR: i64 = 3600;
const SECS_PER_DAY: i64 = 86_400;

/// Errors surfaced by fee computation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateError {
    #[error("no active rate schedule for {class} at {at}")]
    NoActiveRateSchedule { class: VehicleClass, at: DateTime<Utc> },
    #[error("exit time precedes entry time")]
    InvalidInterval,
}

/// One versioned rate table for a vehicle class.
///
/// A schedule referenced by a completed session's fee is never edited in
/// place; repricing introduces a new version with a fresh effective window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSchedule {
    pub class: VehicleClass,
    pub version: u32,
    /// Flat amount charged on entry
    pub base_rate: i64,
    /// Per-hour rate for billed hours up to the additional-hour threshold
    pub hourly_rate: i64,
    /// Per-hour rate applied to billed hours beyond the threshold
    pub additional_hour_rate: i64,
    /// Billed-hour count after which the additional rate applies
    pub additional_hour_threshold: u32,
    /// Whether the base rate covers the first billed hour
    pub base_covers_first_hour: bool,
    /// Ceiling for any single-day charge (0 disables the cap)
    pub daily_cap: i64,
    pub weekly_rate: i64,
    pub monthly_rate: i64,
    /// One-time surcharge once the stay exceeds `max_stay_hours`
    pub penalty_rate: i64,
    pub max_stay_hours: u32,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl RateSchedule {
    /// Whether this schedule is in effect at `at`
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        if at < self.effective_from {
            return false;
        }
        match self.effective_to {
            Some(until) => at < until,
            None => true,
        }
    }

    /// Sanity-check tier ordering. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.base_rate < 0
            || self.hourly_rate < 0
            || self.additional_hour_rate < 0
            || self.daily_cap < 0
            || self.weekly_rate < 0
            || self.monthly_rate < 0
            || self.penalty_rate < 0
        {
            problems.push("rates must be non-negative".to_string());
        }
        if self.daily_cap > 0 && self.daily_cap >= self.hourly_rate * 24 {
            problems.push("daily cap must undercut 24 hours at the hourly rate".to_string());
        }
        if self.daily_cap > 0 && self.weekly_rate >= self.daily_cap * 7 {
            problems.push("weekly rate must undercut 7 days at the daily cap".to_string());
        }
        if self.daily_cap > 0 && self.monthly_rate >= self.daily_cap * 30 {
            problems.push("monthly rate must undercut 30 days at the daily cap".to_string());
        }
        if let Some(until) = self.effective_to {
            if until <= self.effective_from {
                problems.push("effective window must end after it starts".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Integer division rounding half away from zero (operands non-negative)
#[inline]
fn div_round_half_up(num: i64, den: i64) -> i64 {
    debug_assert!(den > 0);
    (num * 2 + den) / (den * 2)
}

/// Billed hours for an elapsed duration: partial hours round up, minimum one
#[inline]
pub fn billed_hours(elapsed_secs: i64) -> i64 {
    let hours = (elapsed_secs + SECS_PER_HOUR - 1) / SECS_PER_HOUR;
    hours.max(1)
}

/// Compute the fee for a stay against one schedule.
///
/// Deterministic: identical (entry, exit, schedule) always yields the same
/// amount. Fails with `InvalidInterval` if exit precedes entry.
pub fn compute_fee(
    schedule: &RateSchedule,
    entry: DateTime<Utc>,
    exit: DateTime<Utc>,
) -> Result<i64, RateError> {
    if exit < entry {
        return Err(RateError::InvalidInterval);
    }
    let elapsed_secs = (exit - entry).num_seconds().max(0);

    let mut fee = if elapsed_secs <= SECS_PER_DAY {
        hourly_fee(schedule, billed_hours(elapsed_secs))
    } else if elapsed_secs <= 7 * SECS_PER_DAY {
        let days = (elapsed_secs + SECS_PER_DAY - 1) / SECS_PER_DAY;
        let weeks = (days + 6) / 7;
        div_round_half_up(schedule.weekly_rate * days, 7).min(schedule.weekly_rate * weeks)
    } else {
        let days = (elapsed_secs + SECS_PER_DAY - 1) / SECS_PER_DAY;
        let months = (days + 29) / 30;
        div_round_half_up(schedule.monthly_rate * days, 30).min(schedule.monthly_rate * months)
    };

    if schedule.max_stay_hours > 0 && elapsed_secs > i64::from(schedule.max_stay_hours) * SECS_PER_HOUR
    {
        fee += schedule.penalty_rate;
    }

    Ok(fee.max(0))
}

/// Fee for a sub-24h stay: base, then hourly to the threshold, then the
/// additional-hour rate, capped at the daily cap.
fn hourly_fee(schedule: &RateSchedule, billed: i64) -> i64 {
    let covered = i64::from(schedule.base_covers_first_hour);
    let chargeable = (billed - covered).max(0);
    let std_window = (i64::from(schedule.additional_hour_threshold) - covered).max(0);
    let std_hours = chargeable.min(std_window);
    let extra_hours = chargeable - std_hours;

    let fee = schedule.base_rate
        + schedule.hourly_rate * std_hours
        + schedule.additional_hour_rate * extra_hours;

    if schedule.daily_cap > 0 {
        fee.min(schedule.daily_cap)
    } else {
        fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule() -> RateSchedule {
        RateSchedule {
            class: VehicleClass::Car,
            version: 1,
            base_rate: 5000,
            hourly_rate: 5000,
            additional_hour_rate: 5000,
            additional_hour_threshold: 24,
            base_covers_first_hour: true,
            daily_cap: 100_000,
            weekly_rate: 500_000,
            monthly_rate: 1_500_000,
            penalty_rate: 50_000,
            max_stay_hours: 24 * 30,
            effective_from: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            effective_to: None,
        }
    }

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, h, m, 0).unwrap()
    }

    #[test]
    fn test_one_minute_bills_one_hour() {
        // entry 10:00, exit 10:05 -> 1 billed hour -> base covers it
        let fee = compute_fee(&schedule(), at(1, 10, 0), at(1, 10, 5)).unwrap();
        assert_eq!(fee, 5000);
    }

    #[test]
    fn test_partial_hours_round_up() {
        // entry 10:00, exit 13:01 -> 4 billed hours -> base + 3 * hourly
        let fee = compute_fee(&schedule(), at(1, 10, 0), at(1, 13, 1)).unwrap();
        assert_eq!(fee, 5000 + 3 * 5000);
    }

    #[test]
    fn test_base_not_covering_first_hour() {
        let mut s = schedule();
        s.base_covers_first_hour = false;
        s.base_rate = 2000;
        // 2 billed hours -> base + 2 * hourly
        let fee = compute_fee(&s, at(1, 10, 0), at(1, 11, 30)).unwrap();
        assert_eq!(fee, 2000 + 2 * 5000);
    }

    #[test]
    fn test_additional_hour_rate_beyond_threshold() {
        let mut s = schedule();
        s.additional_hour_threshold = 3;
        s.additional_hour_rate = 2000;
        s.daily_cap = 0;
        // 5 billed hours, first covered, hours 2-3 at hourly, hours 4-5 additional
        let fee = compute_fee(&s, at(1, 8, 0), at(1, 12, 30)).unwrap();
        assert_eq!(fee, 5000 + 2 * 5000 + 2 * 2000);
    }

    #[test]
    fn test_daily_cap_applies() {
        let mut s = schedule();
        s.daily_cap = 20_000;
        // 23 billed hours would be base + 22 * hourly without the cap
        let fee = compute_fee(&s, at(1, 0, 0), at(1, 22, 30)).unwrap();
        assert_eq!(fee, 20_000);
    }

    #[test]
    fn test_weekly_prorated_by_days() {
        // 3 days -> weekly * 3 / 7, rounded half up
        let fee = compute_fee(&schedule(), at(1, 10, 0), at(4, 9, 0)).unwrap();
        assert_eq!(fee, div_round_half_up(500_000 * 3, 7));

        // exactly 7 days hits the weekly rate cap
        let fee = compute_fee(&schedule(), at(1, 10, 0), at(8, 10, 0)).unwrap();
        assert_eq!(fee, 500_000);
    }

    #[test]
    fn test_monthly_prorated_beyond_a_week() {
        // 10 days -> monthly * 10 / 30
        let fee = compute_fee(&schedule(), at(1, 10, 0), at(11, 10, 0)).unwrap();
        assert_eq!(fee, div_round_half_up(1_500_000 * 10, 30));
    }

    #[test]
    fn test_penalty_after_max_stay() {
        let mut s = schedule();
        s.max_stay_hours = 2;
        // 3 billed hours exceeds the 2h max stay -> penalty added once
        let fee = compute_fee(&s, at(1, 10, 0), at(1, 12, 30)).unwrap();
        assert_eq!(fee, 5000 + 2 * 5000 + 50_000);
    }

    #[test]
    fn test_invalid_interval() {
        let err = compute_fee(&schedule(), at(2, 10, 0), at(1, 10, 0)).unwrap_err();
        assert_eq!(err, RateError::InvalidInterval);
    }

    #[test]
    fn test_deterministic() {
        let s = schedule();
        let a = compute_fee(&s, at(1, 10, 0), at(2, 4, 17)).unwrap();
        let b = compute_fee(&s, at(1, 10, 0), at(2, 4, 17)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_effective_window() {
        let s = schedule();
        assert!(s.is_active_at(at(1, 0, 0)));
        assert!(!s.is_active_at(Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap()));

        let mut bounded = s;
        bounded.effective_to = Some(at(10, 0, 0));
        assert!(bounded.is_active_at(at(9, 23, 0)));
        assert!(!bounded.is_active_at(at(10, 0, 0)));
    }

    #[test]
    fn test_validate_tier_ordering() {
        assert!(schedule().validate().is_ok());

        let mut bad = schedule();
        bad.daily_cap = 5000 * 24; // not cheaper than 24 hourly hours
        let problems = bad.validate().unwrap_err();
        assert_eq!(problems.len(), 1);

        let mut bad = schedule();
        bad.effective_to = Some(bad.effective_from);
        assert!(bad.validate().is_err());
    }
}
