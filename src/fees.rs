//! Fee calculation utilities
//!
//! Pure functions over [`rust_decimal::Decimal`]. Monetary outputs are
//! rounded to 2 decimal places; callers compute each figure once, persist
//! it on the request, and reuse the stored value.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Default flat component of the upfront fee
pub const DEFAULT_BASE_FEE: u32 = 5;

/// Default per-hour component of the upfront fee
pub const DEFAULT_PER_HOUR_RATE: u32 = 2;

/// Default platform cut of the final cost, in percent
pub const DEFAULT_PLATFORM_FEE_PERCENT: u32 = 10;

/// Tip percentage applied to chat-initiated direct driver payments
pub const DIRECT_PAYMENT_TIP_PERCENT: u32 = 10;

const MONEY_DP: u32 = 2;

/// Final-cost breakdown computed at ride completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub final_cost: Decimal,
    pub platform_fee: Decimal,
    pub driver_earnings: Decimal,
}

/// Chat-initiated direct driver payment: base plus a 10% tip, the full
/// amount credited to the driver. No platform fee on this path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectPayment {
    pub base_amount: Decimal,
    pub tip: Decimal,
    pub total_amount: Decimal,
}

/// Upfront fee charged at request creation: `base + duration * per_hour`.
///
/// Total for all durations in [1, 24]; range validation happens at the
/// engine boundary.
pub fn upfront_fee(duration_hours: u32, base_fee: Decimal, per_hour_rate: Decimal) -> Decimal {
    (base_fee + per_hour_rate * Decimal::from(duration_hours)).round_dp(MONEY_DP)
}

/// Standard settlement split at ride completion.
///
/// `actual_duration_hours` is already ceiled (see [`actual_hours`]).
/// `platform_fee = final_cost * fee_percent / 100`; the driver keeps the
/// remainder, so the three figures always sum exactly.
pub fn settlement(
    hourly_rate: Decimal,
    actual_duration_hours: u32,
    platform_fee_percent: Decimal,
) -> Settlement {
    let final_cost = (hourly_rate * Decimal::from(actual_duration_hours)).round_dp(MONEY_DP);
    let platform_fee = (final_cost * platform_fee_percent / Decimal::ONE_HUNDRED).round_dp(MONEY_DP);
    let driver_earnings = final_cost - platform_fee;

    Settlement {
        final_cost,
        platform_fee,
        driver_earnings,
    }
}

/// Direct driver payment variant: 10% tip on top, no platform fee.
pub fn direct_driver_payment(base_amount: Decimal) -> DirectPayment {
    let tip = (base_amount * Decimal::from(DIRECT_PAYMENT_TIP_PERCENT) / Decimal::ONE_HUNDRED)
        .round_dp(MONEY_DP);
    DirectPayment {
        base_amount,
        tip,
        total_amount: base_amount + tip,
    }
}

/// Billable hours for a completed ride: wall-clock duration ceiled to whole
/// hours. A started ride always bills at least one hour.
pub fn actual_hours(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> u32 {
    let secs = (ended_at - started_at).num_seconds().max(0) as u64;
    let hours = secs.div_ceil(3600);
    hours.max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;

    #[test]
    fn test_upfront_fee_defaults() {
        // base 5 + 3h * 2 = 11
        let fee = upfront_fee(3, dec!(5), dec!(2));
        assert_eq!(fee, dec!(11));

        // Boundary durations
        assert_eq!(upfront_fee(1, dec!(5), dec!(2)), dec!(7));
        assert_eq!(upfront_fee(24, dec!(5), dec!(2)), dec!(53));
    }

    #[test]
    fn test_settlement_split() {
        // rate 15, 3 billable hours, 10% platform cut
        let s = settlement(dec!(15), 3, dec!(10));
        assert_eq!(s.final_cost, dec!(45));
        assert_eq!(s.platform_fee, dec!(4.5));
        assert_eq!(s.driver_earnings, dec!(40.5));
    }

    #[test]
    fn test_settlement_sums_exactly() {
        // Awkward rate that forces rounding in the fee
        let s = settlement(dec!(13.33), 2, dec!(10));
        assert_eq!(s.final_cost, dec!(26.66));
        assert_eq!(s.platform_fee, dec!(2.67));
        assert_eq!(s.platform_fee + s.driver_earnings, s.final_cost);
    }

    #[test]
    fn test_direct_payment_tip() {
        let p = direct_driver_payment(dec!(50));
        assert_eq!(p.tip, dec!(5));
        assert_eq!(p.total_amount, dec!(55));
    }

    #[test]
    fn test_actual_hours_ceiling() {
        let start = Utc::now();

        // 2h15m ceils to 3
        let end = start + TimeDelta::minutes(135);
        assert_eq!(actual_hours(start, end), 3);

        // Exactly 2h stays 2
        let end = start + TimeDelta::hours(2);
        assert_eq!(actual_hours(start, end), 2);

        // Sub-hour rides bill one hour
        let end = start + TimeDelta::minutes(10);
        assert_eq!(actual_hours(start, end), 1);

        // Instant end still bills the minimum
        assert_eq!(actual_hours(start, start), 1);
    }
}
