//! Solana margin-lending venue: market data and the trading surface.

mod market_data;
mod trader;

pub use market_data::{best_by_net_carry, LendMarketData};
pub use trader::LendClient;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::model::{Asset, Protocol, VenueRates};
use crate::venues::error::VenueResult;

/// Parameters for opening a levered long.
#[derive(Debug, Clone)]
pub struct LongOpenRequest {
    pub asset: Asset,
    pub protocol: Protocol,
    pub collateral_usd: Decimal,
    pub leverage: Decimal,
}

/// An unsigned transaction built by the venue, ready for the key service.
#[derive(Debug, Clone)]
pub struct UnsignedLongTx {
    /// Venue-side identifier of the build intent.
    pub intent_id: String,
    pub tx_bytes: Vec<u8>,
}

/// Fill details of a confirmed long open.
#[derive(Debug, Clone)]
pub struct LongOpenReceipt {
    pub position_handle: String,
    pub intent_id: String,
    pub collateral_usd: Decimal,
    pub borrowed_usd: Decimal,
    pub base_token_qty: Decimal,
    pub entry_price: Decimal,
}

/// Live state of an open long.
#[derive(Debug, Clone)]
pub struct LongPositionState {
    pub position_handle: String,
    pub health_factor: Decimal,
    pub base_token_qty: Decimal,
    pub quote_borrowed: Decimal,
    pub price_base: Decimal,
    pub is_active: bool,
}

/// The lending venue surface the core consumes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LongVenue: Send + Sync {
    /// Current rates across all supported protocols.
    async fn get_markets(&self) -> VenueResult<Vec<VenueRates>>;
    /// The venue's oracle price for an asset, when it exposes one.
    async fn oracle_price(&self, asset: Asset) -> VenueResult<Option<Decimal>>;
    /// Build an unsigned open transaction.
    async fn build_open(&self, request: &LongOpenRequest) -> VenueResult<UnsignedLongTx>;
    /// Build an unsigned close transaction for an open position.
    async fn build_close(&self, position_handle: &str) -> VenueResult<UnsignedLongTx>;
    /// Dry-run an open without committing anything.
    async fn simulate_open(&self, request: &LongOpenRequest) -> VenueResult<()>;
    /// Resolve the fill details once the open transaction confirmed.
    async fn confirm_open(&self, intent_id: &str, txid: &str) -> VenueResult<LongOpenReceipt>;
    async fn position_state(&self, handle: &str) -> VenueResult<LongPositionState>;
    /// Cheap health-factor read for the monitor loop.
    async fn monitor_health(&self, handle: &str) -> VenueResult<Decimal>;
    async fn health_check(&self) -> bool;
}
