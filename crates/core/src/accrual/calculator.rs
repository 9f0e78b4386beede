//! Time-proportional yield accrual and platform fee split.
//!
//! All amounts are unsigned integers in the token's smallest unit. The accrual
//! formula is
//!
//! ```text
//! yield = principal * rate_bps * elapsed_secs / (10_000 * 31_536_000)
//! ```
//!
//! evaluated exactly and rounded half-up once, at the final division. The year
//! is a fixed 365 days; there is no leap-year adjustment.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{invalid_input, AccrualError, AccrualResult};

/// Monetary amount in token base units.
pub type Amount = u128;

pub const SECONDS_PER_YEAR: u64 = 365 * 24 * 3600;

/// 10_000 bps = 100%.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// `BPS_DENOMINATOR * SECONDS_PER_YEAR`, the divisor of the accrual formula.
const ACCRUAL_DIVISOR: u128 = BPS_DENOMINATOR as u128 * SECONDS_PER_YEAR as u128;

// =============================================================================
// Basis points
// =============================================================================

/// An annual rate or a fee expressed in basis points (1 bps = 0.0001).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BasisPoints(u32);

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);

    pub const fn new(bps: u32) -> Self {
        Self(bps)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts a decimal fraction (0.055 = 5.5%) to the nearest basis point.
    ///
    /// Returns `None` for negative, non-finite or absurdly large values.
    pub fn from_fraction(fraction: f64) -> Option<Self> {
        if !fraction.is_finite() || fraction < 0.0 {
            return None;
        }
        let bps = (fraction * f64::from(BPS_DENOMINATOR)).round();
        if bps > f64::from(u32::MAX) {
            return None;
        }
        Some(Self(bps as u32))
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// A fee rate, guaranteed to lie in `[0, 10_000]` bps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FeeRate(BasisPoints);

impl FeeRate {
    /// 20% of yield, the marketplace default.
    pub const DEFAULT: FeeRate = FeeRate(BasisPoints::new(2_000));

    pub fn new(bps: u32) -> AccrualResult<Self> {
        if bps > BPS_DENOMINATOR {
            return Err(invalid_input(format!(
                "fee of {bps} bps is outside [0, {BPS_DENOMINATOR}]"
            )));
        }
        Ok(Self(BasisPoints::new(bps)))
    }

    pub fn bps(self) -> BasisPoints {
        self.0
    }

    /// Splits `yield_amount` between the platform and the payee.
    ///
    /// The platform share is floored, the payee receives the remainder, so the two
    /// always add back up to `yield_amount`.
    pub fn split(self, yield_amount: Amount) -> FeeSplit {
        let bps = u128::from(self.0.get());
        let denominator = u128::from(BPS_DENOMINATOR);
        // bps <= denominator, so neither product can exceed yield_amount.
        let platform_fee = (yield_amount / denominator) * bps
            + (yield_amount % denominator) * bps / denominator;
        FeeSplit {
            platform_fee,
            payee_amount: yield_amount - platform_fee,
        }
    }
}

impl<'de> Deserialize<'de> for FeeRate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bps = u32::deserialize(deserializer)?;
        FeeRate::new(bps).map_err(serde::de::Error::custom)
    }
}

/// Result of splitting a yield amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub platform_fee: Amount,
    pub payee_amount: Amount,
}

// =============================================================================
// Accrual
// =============================================================================

/// Yield earned by `principal` at `annual_rate` over `elapsed_secs`.
///
/// Exact round-half-up of `principal * rate * elapsed / (10_000 * SECONDS_PER_YEAR)`.
/// Both the principal and `rate * elapsed` are split into quotient and
/// remainder of the divisor, so [`AccrualError::Overflow`] is returned only
/// when the result itself does not fit in 128 bits.
pub fn compute_yield(
    principal: Amount,
    annual_rate: BasisPoints,
    elapsed_secs: u64,
) -> AccrualResult<Amount> {
    if principal == 0 || elapsed_secs == 0 || annual_rate.is_zero() {
        return Ok(0);
    }

    // u32 * u64 always fits in u128.
    let factor = u128::from(annual_rate.get()) * u128::from(elapsed_secs);

    let whole = principal / ACCRUAL_DIVISOR;
    let rem = principal % ACCRUAL_DIVISOR;

    let whole_part = whole.checked_mul(factor).ok_or(AccrualError::Overflow)?;

    // rem < 2^39 and factor / DIVISOR < 2^58, so neither product can overflow.
    let rem_part = rem * (factor / ACCRUAL_DIVISOR)
        + (rem * (factor % ACCRUAL_DIVISOR) + ACCRUAL_DIVISOR / 2) / ACCRUAL_DIVISOR;

    whole_part
        .checked_add(rem_part)
        .ok_or(AccrualError::Overflow)
}

/// `split_fee(yield, fee_bps)`, validating the fee rate.
pub fn split_fee(yield_amount: Amount, fee_bps: u32) -> AccrualResult<FeeSplit> {
    Ok(FeeRate::new(fee_bps)?.split(yield_amount))
}

/// Whole seconds from `start` to `now`; zero if `now` precedes `start`.
pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - start).num_seconds()).unwrap_or(0)
}

/// Projected outcome of holding `principal` for a number of days.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub days: u32,
    pub yield_amount: Amount,
    pub platform_fee: Amount,
    pub payee_amount: Amount,
    /// Principal plus the payee's share of yield.
    pub payout: Amount,
}

pub fn project(
    principal: Amount,
    annual_rate: BasisPoints,
    fee: FeeRate,
    days: u32,
) -> AccrualResult<Projection> {
    let yield_amount = compute_yield(principal, annual_rate, u64::from(days) * 86_400)?;
    let split = fee.split(yield_amount);
    Ok(Projection {
        days,
        yield_amount,
        platform_fee: split.platform_fee,
        payee_amount: split.payee_amount,
        payout: principal
            .checked_add(split.payee_amount)
            .ok_or(AccrualError::Overflow)?,
    })
}

// =============================================================================
// Unit conversion
// =============================================================================

/// Renders base units as a decimal string, e.g. `27397` with 6 decimals → `"0.027397"`.
pub fn format_units(amount: Amount, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = 10u128.pow(u32::from(decimals));
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = usize::from(decimals)
    )
}

/// Parses a non-negative decimal string in whole token units into base units.
///
/// More fractional digits than `decimals` is an error rather than a silent truncation.
pub fn parse_units(text: &str, decimals: u8) -> AccrualResult<Amount> {
    let text = text.trim();
    if text.is_empty() {
        return Err(invalid_input("amount is empty"));
    }
    if text.starts_with('-') {
        return Err(invalid_input(format!("amount {text} is negative")));
    }

    let (int_part, frac_part) = match text.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (text, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid_input(format!("amount {text} is not a number")));
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(invalid_input(format!("amount {text} is not a number")));
    }
    if frac_part.len() > usize::from(decimals) {
        return Err(invalid_input(format!(
            "amount {text} has more than {decimals} decimal places"
        )));
    }

    let scale = 10u128.pow(u32::from(decimals));
    let overflow = || invalid_input(format!("amount {text} is too large"));

    let whole: u128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| overflow())?
    };
    let frac: u128 = if frac_part.is_empty() {
        0
    } else {
        let padding = 10u128.pow((usize::from(decimals) - frac_part.len()) as u32);
        frac_part.parse::<u128>().map_err(|_| overflow())? * padding
    };

    whole
        .checked_mul(scale)
        .and_then(|n| n.checked_add(frac))
        .ok_or_else(overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const USDC: u8 = 6;
    const DAY: u64 = 86_400;

    fn usdc(whole: u128) -> Amount {
        whole * 1_000_000
    }

    #[test]
    fn test_seconds_per_year() {
        assert_eq!(SECONDS_PER_YEAR, 31_536_000);
    }

    #[test]
    fn test_one_day_on_hundred_usdc() {
        // 100 * 0.10 * 86400 / 31536000 = 0.0273972...
        let y = compute_yield(usdc(100), BasisPoints::new(1_000), DAY).unwrap();
        assert_eq!(y, 27_397);
        assert_eq!(format_units(y, USDC), "0.027397");
    }

    #[test]
    fn test_thirty_days_with_fee() {
        let y = compute_yield(usdc(1_000), BasisPoints::new(1_000), 30 * DAY).unwrap();
        assert_eq!(y, 8_219_178);

        let split = split_fee(y, 2_000).unwrap();
        assert_eq!(split.platform_fee, 1_643_835);
        assert_eq!(split.payee_amount, 6_575_343);
        assert_eq!(split.platform_fee + split.payee_amount, y);
    }

    #[rstest]
    #[case::one_day(1, 273_973)]
    #[case::one_week(7, 1_917_808)]
    #[case::one_month(30, 8_219_178)]
    #[case::three_months(90, 24_657_534)]
    #[case::one_year(365, 100_000_000)]
    fn test_yield_table_for_thousand_usdc(#[case] days: u64, #[case] expected: Amount) {
        let y = compute_yield(usdc(1_000), BasisPoints::new(1_000), days * DAY).unwrap();
        assert_eq!(y, expected);
    }

    #[test]
    fn test_zero_principal_time_or_rate() {
        assert_eq!(compute_yield(0, BasisPoints::new(1_000), 10 * DAY).unwrap(), 0);
        assert_eq!(compute_yield(usdc(1_000), BasisPoints::new(1_000), 0).unwrap(), 0);
        assert_eq!(compute_yield(usdc(1_000), BasisPoints::ZERO, DAY).unwrap(), 0);
    }

    #[test]
    fn test_rounds_half_up() {
        // At 1 bps over half a year, yield = principal / 20_000.
        let y = compute_yield(10_000, BasisPoints::new(1), SECONDS_PER_YEAR / 2).unwrap();
        assert_eq!(y, 1); // 0.5 rounds up
        let y = compute_yield(9_999, BasisPoints::new(1), SECONDS_PER_YEAR / 2).unwrap();
        assert_eq!(y, 0); // 0.49995 rounds down
    }

    #[test]
    fn test_large_principal_multi_year() {
        // 10^30 base units (a 10^12 token holding at 18 decimals) over ten years.
        let principal: Amount = 10u128.pow(30);
        let y = compute_yield(principal, BasisPoints::new(1_000), 10 * SECONDS_PER_YEAR).unwrap();
        assert_eq!(y, principal);
    }

    #[test]
    fn test_overflow_is_reported() {
        let err = compute_yield(u128::MAX, BasisPoints::new(u32::MAX), u64::MAX).unwrap_err();
        assert_eq!(err, AccrualError::Overflow);
    }

    #[test]
    fn test_extreme_rate_and_duration_still_fit() {
        // 1e11 * (2^32 - 1) * (2^64 - 1) / 315_360_000_000, rounded.
        let amount = compute_yield(100_000_000_000, BasisPoints::new(u32::MAX), u64::MAX).unwrap();
        assert_eq!(amount, 25_123_085_519_982_747_816_951_874_501);
    }

    #[test]
    fn test_projection_over_thirty_days() {
        let p = project(usdc(1_000), BasisPoints::new(1_000), FeeRate::DEFAULT, 30).unwrap();
        assert_eq!(p.yield_amount, 8_219_178);
        assert_eq!(p.platform_fee, 1_643_835);
        assert_eq!(p.payee_amount, 6_575_343);
        assert_eq!(p.payout, 1_006_575_343);
    }

    #[test]
    fn test_fee_out_of_range_rejected() {
        assert!(matches!(
            split_fee(100, 10_001),
            Err(AccrualError::InvalidInput(_))
        ));
        assert!(FeeRate::new(10_000).is_ok());
    }

    #[rstest]
    #[case(100_000_000, 2_000, 20_000_000)]
    #[case(50_000_000, 1_500, 7_500_000)]
    #[case(200_000_000, 2_500, 50_000_000)]
    #[case(7, 2_000, 1)]
    #[case(4, 2_000, 0)]
    fn test_fee_split_cases(#[case] y: Amount, #[case] fee_bps: u32, #[case] platform: Amount) {
        let split = split_fee(y, fee_bps).unwrap();
        assert_eq!(split.platform_fee, platform);
        assert_eq!(split.payee_amount, y - platform);
    }

    #[test]
    fn test_fee_rate_deserialize_validates() {
        let ok: FeeRate = serde_json::from_str("2000").unwrap();
        assert_eq!(ok, FeeRate::DEFAULT);
        assert!(serde_json::from_str::<FeeRate>("12000").is_err());
    }

    #[test]
    fn test_elapsed_seconds_clamps_negative() {
        let start = DateTime::from_timestamp(1_000, 0).unwrap();
        let before = DateTime::from_timestamp(500, 0).unwrap();
        let after = DateTime::from_timestamp(1_500, 999_000_000).unwrap();
        assert_eq!(elapsed_seconds(start, before), 0);
        assert_eq!(elapsed_seconds(start, after), 500);
    }

    #[test]
    fn test_basis_points_from_fraction() {
        assert_eq!(BasisPoints::from_fraction(0.055), Some(BasisPoints::new(550)));
        assert_eq!(BasisPoints::from_fraction(0.0123), Some(BasisPoints::new(123)));
        assert_eq!(BasisPoints::from_fraction(-0.01), None);
        assert_eq!(BasisPoints::from_fraction(f64::NAN), None);
        assert_eq!(BasisPoints::new(550).to_string(), "5.50%");
    }

    #[rstest]
    #[case("100", 100_000_000)]
    #[case("0.027397", 27_397)]
    #[case("1.5", 1_500_000)]
    #[case(".5", 500_000)]
    #[case("0", 0)]
    fn test_parse_units(#[case] text: &str, #[case] expected: Amount) {
        assert_eq!(parse_units(text, USDC).unwrap(), expected);
    }

    #[rstest]
    #[case("-1")]
    #[case("")]
    #[case("abc")]
    #[case("1.0000001")]
    #[case(".")]
    #[case("1e6")]
    fn test_parse_units_rejects(#[case] text: &str) {
        assert!(matches!(
            parse_units(text, USDC),
            Err(AccrualError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(8_219_178, USDC), "8.219178");
        assert_eq!(format_units(5, USDC), "0.000005");
        assert_eq!(format_units(42, 0), "42");
    }

    proptest! {
        #[test]
        fn prop_yield_zero_at_boundaries(principal in 0u128..=10u128.pow(24), bps in 0u32..=100_000, t in 0u64..=50 * SECONDS_PER_YEAR) {
            prop_assert_eq!(compute_yield(principal, BasisPoints::new(bps), 0).unwrap(), 0);
            prop_assert_eq!(compute_yield(0, BasisPoints::new(bps), t).unwrap(), 0);
        }

        #[test]
        fn prop_yield_is_linear_in_time(principal in 0u128..=10u128.pow(24), bps in 0u32..=100_000, t in 0u64..=50 * SECONDS_PER_YEAR) {
            let once = compute_yield(principal, BasisPoints::new(bps), t).unwrap();
            let twice = compute_yield(principal, BasisPoints::new(bps), 2 * t).unwrap();
            // Each side is rounded once, so they can differ by at most one unit.
            prop_assert!(twice.abs_diff(2 * once) <= 1);
        }

        #[test]
        fn prop_yield_is_deterministic(principal in 0u128..=10u128.pow(24), bps in 0u32..=100_000, t in 0u64..=50 * SECONDS_PER_YEAR) {
            let a = compute_yield(principal, BasisPoints::new(bps), t).unwrap();
            let b = compute_yield(principal, BasisPoints::new(bps), t).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_yield_monotone_in_time(principal in 0u128..=10u128.pow(24), bps in 0u32..=100_000, t in 0u64..=50 * SECONDS_PER_YEAR, dt in 0u64..=SECONDS_PER_YEAR) {
            let earlier = compute_yield(principal, BasisPoints::new(bps), t).unwrap();
            let later = compute_yield(principal, BasisPoints::new(bps), t + dt).unwrap();
            prop_assert!(later >= earlier);
        }

        #[test]
        fn prop_fee_split_conserves(y in any::<u128>(), fee_bps in 0u32..=BPS_DENOMINATOR) {
            let split = split_fee(y, fee_bps).unwrap();
            prop_assert_eq!(split.platform_fee + split.payee_amount, y);
            prop_assert!(split.platform_fee <= y);
        }
    }
}
