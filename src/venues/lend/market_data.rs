//! Lending market data: rate aggregation and best-protocol selection.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::LongVenue;
use crate::model::{Asset, VenueRates};
use crate::venues::error::VenueResult;

/// How long a fetched rate sheet stays fresh.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Cached view over the venue's per-protocol rates.
pub struct LendMarketData {
    venue: Arc<dyn LongVenue>,
    cache: RwLock<Option<(Instant, Vec<VenueRates>)>>,
    ttl: Duration,
}

impl LendMarketData {
    pub fn new(venue: Arc<dyn LongVenue>) -> Self {
        Self {
            venue,
            cache: RwLock::new(None),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// All market rates, served from cache while fresh.
    pub async fn markets(&self) -> VenueResult<Vec<VenueRates>> {
        {
            let cache = self.cache.read().await;
            if let Some((at, rates)) = cache.as_ref() {
                if at.elapsed() < self.ttl {
                    return Ok(rates.clone());
                }
            }
        }

        let rates = self.venue.get_markets().await?;
        *self.cache.write().await = Some((Instant::now(), rates.clone()));
        debug!(markets = rates.len(), "refreshed lending markets");
        Ok(rates)
    }

    /// Rates for one asset across protocols.
    pub async fn rates_for(&self, asset: Asset) -> VenueResult<Vec<VenueRates>> {
        let mint = asset.mint();
        Ok(self
            .markets()
            .await?
            .into_iter()
            .filter(|r| r.long_asset_mint == mint)
            .collect())
    }

    /// The protocol with the best net carry that can absorb the position,
    /// tie-broken by protocol order.
    #[instrument(skip(self))]
    pub async fn select_best_protocol(
        &self,
        asset: Asset,
        position_size_usd: Decimal,
        leverage: Decimal,
    ) -> VenueResult<Option<VenueRates>> {
        let rates = self.rates_for(asset).await?;
        Ok(best_by_net_carry(&rates, position_size_usd, leverage))
    }

    pub async fn clear_cache(&self) {
        *self.cache.write().await = None;
    }
}

/// Pick the protocol with the highest net carry among those with capacity.
/// Ties resolve to the lower `Protocol` ordinal.
pub fn best_by_net_carry(
    rates: &[VenueRates],
    position_size_usd: Decimal,
    leverage: Decimal,
) -> Option<VenueRates> {
    rates
        .iter()
        .filter(|r| r.has_capacity(position_size_usd, leverage))
        .max_by(|a, b| {
            a.net_carry_apy(leverage)
                .cmp(&b.net_carry_apy(leverage))
                // max_by keeps the later of equal elements; invert the
                // protocol order so the lower ordinal wins ties.
                .then_with(|| b.protocol.cmp(&a.protocol))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, USDC_MINT};
    use rust_decimal_macros::dec;

    fn rates(protocol: Protocol, lending: Decimal, borrowing: Decimal, cap: Decimal) -> VenueRates {
        VenueRates {
            protocol,
            long_asset_mint: Asset::Sol.mint().to_string(),
            quote_mint: USDC_MINT.to_string(),
            lending_apy: lending,
            borrowing_apy: borrowing,
            max_borrow_capacity_usd: cap,
        }
    }

    #[test]
    fn test_best_net_carry_wins() {
        let sheet = vec![
            rates(Protocol::Marginfi, dec!(0.04), dec!(0.03), dec!(1000000)),
            rates(Protocol::Kamino, dec!(0.06), dec!(0.03), dec!(1000000)),
        ];
        let best = best_by_net_carry(&sheet, dec!(7500), dec!(3)).unwrap();
        assert_eq!(best.protocol, Protocol::Kamino);
    }

    #[test]
    fn test_capacity_filters_out_winner() {
        let sheet = vec![
            rates(Protocol::Marginfi, dec!(0.04), dec!(0.03), dec!(1000000)),
            // Better carry but no capacity for a $5000 borrow (+buffer).
            rates(Protocol::Kamino, dec!(0.08), dec!(0.03), dec!(100)),
        ];
        let best = best_by_net_carry(&sheet, dec!(7500), dec!(3)).unwrap();
        assert_eq!(best.protocol, Protocol::Marginfi);
    }

    #[test]
    fn test_tie_breaks_by_protocol_order() {
        let sheet = vec![
            rates(Protocol::Drift, dec!(0.05), dec!(0.03), dec!(1000000)),
            rates(Protocol::Solend, dec!(0.05), dec!(0.03), dec!(1000000)),
            rates(Protocol::Kamino, dec!(0.05), dec!(0.03), dec!(1000000)),
        ];
        let best = best_by_net_carry(&sheet, dec!(7500), dec!(3)).unwrap();
        assert_eq!(best.protocol, Protocol::Kamino);
    }

    #[test]
    fn test_no_capacity_anywhere() {
        let sheet = vec![rates(Protocol::Marginfi, dec!(0.05), dec!(0.03), dec!(10))];
        assert!(best_by_net_carry(&sheet, dec!(7500), dec!(3)).is_none());
    }
}
