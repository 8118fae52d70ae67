//! Venue and chain adapters.
//!
//! The core trades through four narrow surfaces: `LongChain` / `ShortChain`
//! (raw chain access), `KeyService` (the signing oracle), `LongVenue` (the
//! Solana lending venue), and `PerpVenue` (the Hyperliquid perp exchange).

pub mod chain;
pub mod error;
pub mod lend;
pub mod perp;

pub use chain::{ArbitrumRpc, KeyService, LongChain, RemoteKeyService, ShortChain, SolanaRpc};
pub use error::{VenueError, VenueResult};
pub use lend::{
    LendClient, LendMarketData, LongOpenReceipt, LongOpenRequest, LongPositionState, LongVenue,
    UnsignedLongTx,
};
pub use perp::{
    FundingOracle, HyperliquidClient, HyperliquidTrader, PerpAccountSnapshot, PerpFill,
    PerpMarketSnapshot, PerpOrder, PerpPositionInfo, PerpVenue,
};
