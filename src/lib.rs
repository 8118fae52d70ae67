//! # Basis Harvester
//!
//! A delta-neutral funding-rate arbitrage engine: a leveraged long on a
//! Solana margin-lending venue hedged by a perpetual short on Hyperliquid.
//! Profit comes from negative perp funding (shorts paid) plus positive net
//! carry on the levered long, plus LST staking yield when the long asset is
//! a liquid staking token.
//!
//! ## Architecture
//!
//! - `config`: layered settings, risk limits, secret resolution
//! - `model`: typed entities (assets, rates, opportunities, positions)
//! - `venues`: chain and venue adapters behind narrow traits
//! - `core`: the trading control plane (detector, preflight, sizer,
//!   consensus, manager, validator, risk engine, monitor, pause, kill
//!   switch, bot)
//! - `store`: durable SQLite state with transactional history moves
//! - `utils`: decimal helpers and the retry policy

pub mod config;
pub mod core;
pub mod model;
pub mod store;
pub mod utils;
pub mod venues;

pub use config::Config;
