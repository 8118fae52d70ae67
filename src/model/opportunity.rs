//! Arbitrage opportunity model.

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::asset::{Asset, Protocol};
use super::funding::{FundingRate, OpportunityScore, VenueRates};

/// Leverage bounds an opportunity may carry. Entries outside this range are
/// rejected at construction time.
pub const MIN_OPPORTUNITY_LEVERAGE: Decimal = dec!(1.1);
pub const MAX_OPPORTUNITY_LEVERAGE: Decimal = dec!(4);

/// A fully-populated arbitrage opportunity, produced once per scan and
/// discarded afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub asset: Asset,
    pub selected_protocol: Protocol,
    pub venue_rates: VenueRates,
    pub current_funding: FundingRate,
    pub predicted_funding: FundingRate,
    /// Coefficient of variation of funding over the lookback window.
    pub funding_volatility: Decimal,
    pub leverage: Decimal,
    pub deployed_capital_usd: Decimal,
    pub position_size_usd: Decimal,
    pub score: OpportunityScore,
    /// Deviation between venue prices, filled in by preflight.
    pub price_deviation: Decimal,
    /// Set true only after all six preflight checks pass.
    pub preflight_passed: bool,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    /// Build an opportunity, validating the leverage range.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        asset: Asset,
        selected_protocol: Protocol,
        venue_rates: VenueRates,
        current_funding: FundingRate,
        predicted_funding: FundingRate,
        funding_volatility: Decimal,
        leverage: Decimal,
        deployed_capital_usd: Decimal,
        score: OpportunityScore,
    ) -> Result<Self> {
        ensure!(
            leverage >= MIN_OPPORTUNITY_LEVERAGE && leverage <= MAX_OPPORTUNITY_LEVERAGE,
            "leverage {} outside [{}, {}]",
            leverage,
            MIN_OPPORTUNITY_LEVERAGE,
            MAX_OPPORTUNITY_LEVERAGE
        );
        ensure!(
            deployed_capital_usd > Decimal::ZERO,
            "deployed capital must be positive"
        );

        Ok(Self {
            id: Uuid::new_v4(),
            asset,
            selected_protocol,
            venue_rates,
            current_funding,
            predicted_funding,
            funding_volatility,
            leverage,
            deployed_capital_usd,
            position_size_usd: deployed_capital_usd * leverage,
            score,
            price_deviation: Decimal::ZERO,
            preflight_passed: false,
            detected_at: Utc::now(),
        })
    }

    pub fn total_expected_apy(&self) -> Decimal {
        self.score.total_apy()
    }
}
