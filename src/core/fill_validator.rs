//! Post-fill validation with soft/hard-stop economics.
//!
//! A fill deviating more than the threshold does not immediately unwind the
//! position: profitability is re-evaluated at the actual fills, and only an
//! APY below zero forces the hard stop. Better-than-expected fills never
//! inflate the APY.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, instrument, warn};

use crate::model::Opportunity;

/// Maximum acceptable fill deviation (0.5%, inclusive).
pub const MAX_FILL_DEVIATION: Decimal = dec!(0.005);

/// A fractional deviation expressed in basis points, for log lines.
fn bps(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Which leg a fill belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSide {
    Long,
    Short,
}

/// Information about a single leg fill.
#[derive(Debug, Clone)]
pub struct FillInfo {
    pub side: FillSide,
    pub size_usd: Decimal,
    pub filled_price: Decimal,
    pub expected_price: Decimal,
}

impl FillInfo {
    pub fn deviation(&self) -> Decimal {
        if self.expected_price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.filled_price - self.expected_price).abs() / self.expected_price
    }
}

/// Validation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Fills within threshold.
    Proceed,
    /// Deviated but still profitable; keep the position, flagged.
    SoftStop,
    /// Deviated and unprofitable; unwind both legs.
    HardStop,
}

/// Result of fill validation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub verdict: Verdict,
    pub long_deviation: Decimal,
    pub short_deviation: Decimal,
    pub max_deviation: Decimal,
    /// Expected APY re-evaluated at the actual fills.
    pub apy_at_fills: Decimal,
    pub reasons: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.verdict != Verdict::HardStop
    }
}

/// Validator for execution fills.
#[derive(Debug, Clone)]
pub struct FillValidator {
    max_deviation: Decimal,
}

impl Default for FillValidator {
    fn default() -> Self {
        Self {
            max_deviation: MAX_FILL_DEVIATION,
        }
    }
}

impl FillValidator {
    pub fn new(max_deviation: Decimal) -> Self {
        Self { max_deviation }
    }

    /// Validate both fills against the originating opportunity.
    #[instrument(skip(self, long_fill, short_fill, opportunity))]
    pub fn validate(
        &self,
        long_fill: &FillInfo,
        short_fill: &FillInfo,
        opportunity: &Opportunity,
    ) -> ValidationResult {
        let long_dev = long_fill.deviation();
        let short_dev = short_fill.deviation();
        let max_dev = long_dev.max(short_dev);

        let mut reasons = Vec::new();

        if max_dev <= self.max_deviation {
            info!(
                max_deviation_bps = %bps(max_dev),
                "fill validation passed"
            );
            return ValidationResult {
                verdict: Verdict::Proceed,
                long_deviation: long_dev,
                short_deviation: short_dev,
                max_deviation: max_dev,
                apy_at_fills: opportunity.total_expected_apy(),
                reasons,
            };
        }

        if long_dev > self.max_deviation {
            reasons.push(format!(
                "long fill deviated {:.2} bps from expected",
                bps(long_dev)
            ));
        }
        if short_dev > self.max_deviation {
            reasons.push(format!(
                "short fill deviated {:.2} bps from expected",
                bps(short_dev)
            ));
        }

        let apy_at_fills = self.apy_at_fills(long_fill, short_fill, opportunity);

        if apy_at_fills < Decimal::ZERO {
            error!(
                apy_at_fills = %apy_at_fills,
                max_deviation_bps = %bps(max_dev),
                "hard stop: position unprofitable at actual fills"
            );
            reasons.push(format!("APY at fills {} is negative", apy_at_fills));
            return ValidationResult {
                verdict: Verdict::HardStop,
                long_deviation: long_dev,
                short_deviation: short_dev,
                max_deviation: max_dev,
                apy_at_fills,
                reasons,
            };
        }

        warn!(
            apy_at_fills = %apy_at_fills,
            max_deviation_bps = %bps(max_dev),
            "soft stop: fills deviated but position remains profitable"
        );
        reasons.push(format!("APY at fills {} remains positive", apy_at_fills));
        ValidationResult {
            verdict: Verdict::SoftStop,
            long_deviation: long_dev,
            short_deviation: short_dev,
            max_deviation: max_dev,
            apy_at_fills,
            reasons,
        }
    }

    /// Re-evaluate APY at the actual fills. Only adverse fills reduce the
    /// APY; each impact is leveraged because the notional is levered against
    /// deployed capital.
    fn apy_at_fills(
        &self,
        long_fill: &FillInfo,
        short_fill: &FillInfo,
        opportunity: &Opportunity,
    ) -> Decimal {
        let long_impact = Self::adverse_impact(long_fill);
        let short_impact = Self::adverse_impact(short_fill);
        let total_impact = (long_impact + short_impact) * opportunity.leverage;
        opportunity.total_expected_apy() - total_impact
    }

    /// Adverse price impact of a fill: longs suffer when filled higher,
    /// shorts when filled lower. Favorable fills contribute zero.
    fn adverse_impact(fill: &FillInfo) -> Decimal {
        if fill.expected_price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let diff = fill.filled_price - fill.expected_price;
        match fill.side {
            FillSide::Long if diff > Decimal::ZERO => diff / fill.expected_price,
            FillSide::Short if diff < Decimal::ZERO => diff.abs() / fill.expected_price,
            _ => Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Asset, FundingRate, Opportunity, OpportunityScore, Protocol, VenueRates, USDC_MINT,
    };
    use chrono::Utc;

    fn opportunity(total_apy: Decimal) -> Opportunity {
        let now = Utc::now();
        Opportunity::new(
            Asset::Sol,
            Protocol::Marginfi,
            VenueRates {
                protocol: Protocol::Marginfi,
                long_asset_mint: Asset::Sol.mint().to_string(),
                quote_mint: USDC_MINT.to_string(),
                lending_apy: dec!(0.05),
                borrowing_apy: dec!(0.03),
                max_borrow_capacity_usd: dec!(1000000),
            },
            FundingRate::new("SOL", dec!(-0.0001), now),
            FundingRate::new("SOL", dec!(-0.00008), now),
            dec!(0.2),
            dec!(3),
            dec!(2500),
            OpportunityScore {
                funding_apy: total_apy,
                net_carry_apy: Decimal::ZERO,
                lst_staking_apy: Decimal::ZERO,
            },
        )
        .unwrap()
    }

    fn fill(side: FillSide, filled: Decimal, expected: Decimal) -> FillInfo {
        FillInfo {
            side,
            size_usd: dec!(7500),
            filled_price: filled,
            expected_price: expected,
        }
    }

    #[test]
    fn test_proceed_within_threshold() {
        // Scenario 1: long at $100, short at $100.5 vs $100 expected on both
        // venues: the short deviated exactly 0.5%, which is within bounds.
        let opp = opportunity(dec!(0.15));
        let result = FillValidator::default().validate(
            &fill(FillSide::Long, dec!(100), dec!(100)),
            &fill(FillSide::Short, dec!(100.5), dec!(100)),
            &opp,
        );

        assert_eq!(result.verdict, Verdict::Proceed);
        assert_eq!(result.max_deviation, dec!(0.005));
        assert_eq!(result.apy_at_fills, dec!(0.15));
    }

    #[test]
    fn test_hard_stop_when_apy_goes_negative() {
        // Scenario 2: tiny APY, both legs filled 1%+ adverse. The combined
        // leveraged impact wipes out the yield.
        let opp = opportunity(dec!(0.005));
        let result = FillValidator::default().validate(
            &fill(FillSide::Long, dec!(101), dec!(100)),
            &fill(FillSide::Short, dec!(99.5), dec!(100)),
            &opp,
        );

        assert_eq!(result.verdict, Verdict::HardStop);
        assert!(result.apy_at_fills < Decimal::ZERO);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_soft_stop_when_still_profitable() {
        // Large APY absorbs a 0.6% adverse long fill (leveraged 3x = 1.8%).
        let opp = opportunity(dec!(0.30));
        let result = FillValidator::default().validate(
            &fill(FillSide::Long, dec!(100.6), dec!(100)),
            &fill(FillSide::Short, dec!(100), dec!(100)),
            &opp,
        );

        assert_eq!(result.verdict, Verdict::SoftStop);
        assert!(result.apy_at_fills > Decimal::ZERO);
        assert!(result.is_valid());
        assert!(!result.reasons.is_empty());
    }

    #[test]
    fn test_favorable_fills_never_inflate_apy() {
        // Long filled lower and short filled higher than expected: both
        // favorable. Deviation still breaches, but no impact applies.
        let opp = opportunity(dec!(0.10));
        let result = FillValidator::default().validate(
            &fill(FillSide::Long, dec!(99), dec!(100)),
            &fill(FillSide::Short, dec!(101), dec!(100)),
            &opp,
        );

        assert_eq!(result.verdict, Verdict::SoftStop);
        assert_eq!(result.apy_at_fills, dec!(0.10));
    }

    #[test]
    fn test_adverse_impact_is_leveraged() {
        let opp = opportunity(dec!(0.02));
        // 1% adverse on the long at 3x leverage = 3% impact > 2% APY.
        let result = FillValidator::default().validate(
            &fill(FillSide::Long, dec!(101), dec!(100)),
            &fill(FillSide::Short, dec!(100), dec!(100)),
            &opp,
        );
        assert_eq!(result.verdict, Verdict::HardStop);
        assert_eq!(result.apy_at_fills, dec!(0.02) - dec!(0.03));
    }
}
