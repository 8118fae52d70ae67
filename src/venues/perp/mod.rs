//! Hyperliquid perp venue: info client, funding oracle, and trader.

mod client;
mod oracle;
mod trader;
mod types;

pub use client::HyperliquidClient;
pub use oracle::{coefficient_of_variation, FundingOracle, FundingPrediction};
pub use trader::HyperliquidTrader;
pub use types::{
    AssetCtx, AssetMeta, ClearinghouseState, FundingHistoryRecord, Meta, PerpAsset,
};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::model::FundingRate;
use crate::venues::error::VenueResult;

/// One coin's market snapshot on the perp venue.
#[derive(Debug, Clone)]
pub struct PerpMarketSnapshot {
    pub coin: String,
    pub mark_price: Decimal,
    pub oracle_price: Decimal,
    pub mid_price: Decimal,
    /// Current hourly funding rate.
    pub funding_hourly: Decimal,
    pub premium: Decimal,
    /// Size precision for order quantities.
    pub sz_decimals: u8,
}

/// An order request against the perp venue.
#[derive(Debug, Clone)]
pub struct PerpOrder {
    pub coin: String,
    pub is_buy: bool,
    pub size: Decimal,
    pub limit_price: Decimal,
    /// Immediate-or-cancel; resting orders are never used by the engine.
    pub ioc: bool,
    pub reduce_only: bool,
}

/// Result of a submitted order. An unfilled IOC reports zero size.
#[derive(Debug, Clone)]
pub struct PerpFill {
    pub filled_size: Decimal,
    pub avg_price: Decimal,
}

impl PerpFill {
    pub fn empty() -> Self {
        Self {
            filled_size: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        }
    }
}

/// One open position in the account snapshot.
#[derive(Debug, Clone)]
pub struct PerpPositionInfo {
    pub coin: String,
    /// Signed size; negative for shorts.
    pub size_base: Decimal,
    pub entry_price: Decimal,
    pub position_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub margin_used: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub leverage: Decimal,
    pub cum_funding_since_open: Decimal,
}

/// Account state on the perp venue.
#[derive(Debug, Clone)]
pub struct PerpAccountSnapshot {
    pub account_value: Decimal,
    pub total_notional: Decimal,
    pub total_margin_used: Decimal,
    pub withdrawable: Decimal,
    pub positions: Vec<PerpPositionInfo>,
}

impl PerpAccountSnapshot {
    /// Equity over total notional. `None` with no open notional.
    pub fn margin_fraction(&self) -> Option<Decimal> {
        if self.total_notional == Decimal::ZERO {
            return None;
        }
        Some(self.account_value / self.total_notional)
    }

    pub fn position(&self, coin: &str) -> Option<&PerpPositionInfo> {
        self.positions.iter().find(|p| p.coin == coin)
    }
}

/// The perp venue surface the core consumes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PerpVenue: Send + Sync {
    async fn snapshot(&self, coin: &str) -> VenueResult<PerpMarketSnapshot>;
    /// Current funding, normalized to an 8h rate.
    async fn current_funding(&self, coin: &str) -> VenueResult<FundingRate>;
    /// Predicted next funding, normalized to an 8h rate.
    async fn predict_next_funding(&self, coin: &str) -> VenueResult<FundingRate>;
    /// Coefficient of variation of funding over the lookback.
    async fn funding_volatility(&self, coin: &str, lookback_hours: u32) -> VenueResult<Decimal>;
    async fn account_snapshot(&self) -> VenueResult<PerpAccountSnapshot>;
    /// Best-effort leverage update for a coin.
    async fn update_leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> VenueResult<()>;
    async fn submit_order(&self, order: &PerpOrder) -> VenueResult<PerpFill>;
    /// Move spot-wallet collateral into the perp clearinghouse.
    async fn spot_to_perp_transfer(&self, amount_usd: Decimal) -> VenueResult<String>;
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_margin_fraction() {
        let snapshot = PerpAccountSnapshot {
            account_value: dec!(750),
            total_notional: dec!(7500),
            total_margin_used: dec!(750),
            withdrawable: Decimal::ZERO,
            positions: vec![],
        };
        assert_eq!(snapshot.margin_fraction(), Some(dec!(0.1)));

        let empty = PerpAccountSnapshot {
            account_value: dec!(100),
            total_notional: Decimal::ZERO,
            total_margin_used: Decimal::ZERO,
            withdrawable: dec!(100),
            positions: vec![],
        };
        assert_eq!(empty.margin_fraction(), None);
    }
}
