//! Price consensus between the two venues.
//!
//! Primary comparison is the perp venue's own mark vs oracle price, which is
//! always available. When the lending venue exposes an oracle price, that
//! price vs the perp mark is used instead. Consensus reports deviation; it
//! never fails a trade on its own; callers decide.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::model::Asset;
use crate::utils::decimal::midpoint_deviation;
use crate::venues::{LongVenue, PerpVenue, VenueResult};

/// Deviation at or below this is consensus (50 bps, inclusive).
pub const CONSENSUS_THRESHOLD: Decimal = dec!(0.005);

/// Which side is priced higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceDirection {
    LongVenueHigher,
    PerpVenueHigher,
    None,
}

/// Result of one consensus check.
#[derive(Debug, Clone)]
pub struct ConsensusResult {
    /// Long-venue side of the comparison (venue oracle, or perp oracle as
    /// fallback).
    pub long_price: Decimal,
    /// Perp-venue mark price.
    pub perp_price: Decimal,
    pub deviation: Decimal,
    pub within_threshold: bool,
    pub threshold: Decimal,
    pub divergence: DivergenceDirection,
    /// True when the long venue supplied its own price.
    pub used_long_venue_oracle: bool,
}

impl ConsensusResult {
    /// Midpoint of the two compared prices.
    pub fn consensus_price(&self) -> Decimal {
        (self.long_price + self.perp_price) / dec!(2)
    }
}

/// Two-venue price comparison.
pub struct PriceConsensus {
    long_venue: Arc<dyn LongVenue>,
    perp: Arc<dyn PerpVenue>,
    threshold: Decimal,
}

impl PriceConsensus {
    pub fn new(long_venue: Arc<dyn LongVenue>, perp: Arc<dyn PerpVenue>) -> Self {
        Self {
            long_venue,
            perp,
            threshold: CONSENSUS_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: Decimal) -> Self {
        self.threshold = threshold;
        self
    }

    /// Compare prices for an asset against its perp hedge coin.
    #[instrument(skip(self))]
    pub async fn check(&self, asset: Asset) -> VenueResult<ConsensusResult> {
        let snapshot = self.perp.snapshot(asset.perp_coin()).await?;

        // Fallback to the perp venue's own oracle when the lending venue has
        // no price for the asset, or the call fails: consensus must stay
        // available to the close path.
        let (long_price, used_long_venue_oracle) =
            match self.long_venue.oracle_price(asset).await {
                Ok(Some(price)) if price > Decimal::ZERO => (price, true),
                _ => (snapshot.oracle_price, false),
            };

        Ok(self.compare(long_price, snapshot.mark_price, used_long_venue_oracle))
    }

    fn compare(
        &self,
        long_price: Decimal,
        perp_price: Decimal,
        used_long_venue_oracle: bool,
    ) -> ConsensusResult {
        let deviation = midpoint_deviation(long_price, perp_price);
        let divergence = if long_price > perp_price {
            DivergenceDirection::LongVenueHigher
        } else if perp_price > long_price {
            DivergenceDirection::PerpVenueHigher
        } else {
            DivergenceDirection::None
        };

        let result = ConsensusResult {
            long_price,
            perp_price,
            deviation,
            within_threshold: deviation <= self.threshold,
            threshold: self.threshold,
            divergence,
            used_long_venue_oracle,
        };

        debug!(
            long_price = %result.long_price,
            perp_price = %result.perp_price,
            deviation = %result.deviation,
            within = result.within_threshold,
            "price consensus checked"
        );
        result
    }
}
