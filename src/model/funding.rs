//! Funding rate and lending rate models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::asset::Protocol;

/// Hours per funding period on the perp venue, normalized.
const FUNDING_PERIOD_HOURS: Decimal = dec!(8);
/// Funding periods per year at hourly settlement: 24 × 365.
const HOURS_PER_YEAR: Decimal = dec!(8760);

/// Capacity safety buffer: the protocol must be able to absorb 20% more
/// borrow than the position actually needs.
pub const CAPACITY_SAFETY_BUFFER: Decimal = dec!(1.2);

/// A perp funding rate observation, normalized to an 8-hour rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    /// Perp coin (e.g. "SOL").
    pub coin: String,
    /// Funding rate per 8-hour period. Negative means shorts are paid.
    pub rate_8h: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl FundingRate {
    pub fn new(coin: impl Into<String>, rate_8h: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            coin: coin.into(),
            rate_8h,
            observed_at,
        }
    }

    /// Hourly-equivalent rate.
    pub fn rate_hourly(&self) -> Decimal {
        self.rate_8h / FUNDING_PERIOD_HOURS
    }

    /// Annualized rate (hourly × 24 × 365).
    pub fn rate_annual(&self) -> Decimal {
        self.rate_hourly() * HOURS_PER_YEAR
    }

    /// Shorts are paid when funding is negative.
    pub fn is_negative(&self) -> bool {
        self.rate_8h < Decimal::ZERO
    }
}

/// Lending and borrowing rates for one protocol on the long venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRates {
    pub protocol: Protocol,
    pub long_asset_mint: String,
    pub quote_mint: String,
    /// Annualized lending yield on the collateral asset.
    pub lending_apy: Decimal,
    /// Annualized borrow cost on the quote asset.
    pub borrowing_apy: Decimal,
    /// Remaining quote borrow capacity in USD.
    pub max_borrow_capacity_usd: Decimal,
}

impl VenueRates {
    /// Net carry on deployed capital at the given leverage:
    /// `L × lending − (L−1) × borrowing`.
    pub fn net_carry_apy(&self, leverage: Decimal) -> Decimal {
        leverage * self.lending_apy - (leverage - Decimal::ONE) * self.borrowing_apy
    }

    /// Whether the protocol can absorb the borrow required for a position of
    /// `position_size_usd` at `leverage`, with the safety buffer applied.
    pub fn has_capacity(&self, position_size_usd: Decimal, leverage: Decimal) -> bool {
        if leverage <= Decimal::ONE {
            return true;
        }
        let required =
            position_size_usd * (leverage - Decimal::ONE) / leverage * CAPACITY_SAFETY_BUFFER;
        self.max_borrow_capacity_usd >= required
    }
}

/// APY decomposition for a detected opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpportunityScore {
    /// Leveraged funding yield earned by the short leg.
    pub funding_apy: Decimal,
    /// Net carry on the levered long leg.
    pub net_carry_apy: Decimal,
    /// Staking yield when the long asset is an LST, zero otherwise.
    pub lst_staking_apy: Decimal,
}

impl OpportunityScore {
    pub fn total_apy(&self) -> Decimal {
        self.funding_apy + self.net_carry_apy + self.lst_staking_apy
    }

    pub fn is_profitable(&self) -> bool {
        self.total_apy() > Decimal::ZERO
    }
}
