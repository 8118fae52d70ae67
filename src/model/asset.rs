//! Supported assets and lending protocols.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// USDC mint on Solana mainnet (the quote asset for every long leg).
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// Assets supported for the long leg. All of them hedge against SOL-PERP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Sol,
    JitoSol,
    JupSol,
    Inf,
}

impl Asset {
    /// All supported assets, in scan order.
    pub const ALL: [Asset; 4] = [Asset::Sol, Asset::JitoSol, Asset::JupSol, Asset::Inf];

    /// Ticker symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Sol => "SOL",
            Asset::JitoSol => "JITOSOL",
            Asset::JupSol => "JUPSOL",
            Asset::Inf => "INF",
        }
    }

    /// On-chain mint address.
    pub fn mint(&self) -> &'static str {
        match self {
            Asset::Sol => "So11111111111111111111111111111111111111112",
            Asset::JitoSol => "J1toso1uCk3RLmjorhTtrVwY9HJ7X8V9yYac6Y7kGCPn",
            Asset::JupSol => "jupSoLaHXQiZZTSfEWMTRRgpnyFm8f6sZdosWBjx93v",
            Asset::Inf => "5oVNBeEEQvYi1cX3ir8Dx5n1P7pdxydbGF2X4TxVusJm",
        }
    }

    /// Token decimal precision.
    pub fn decimals(&self) -> u8 {
        9
    }

    /// True for liquid staking tokens.
    pub fn is_lst(&self) -> bool {
        !matches!(self, Asset::Sol)
    }

    /// Approximate annual staking yield. Zero for native SOL.
    pub fn staking_apy(&self) -> Decimal {
        match self {
            Asset::Sol => Decimal::ZERO,
            Asset::JitoSol => dec!(0.077),
            Asset::JupSol => dec!(0.081),
            Asset::Inf => dec!(0.075),
        }
    }

    /// The perp coin every long leg hedges against.
    pub fn perp_coin(&self) -> &'static str {
        "SOL"
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Lending sub-venues on the long side.
///
/// Declaration order is the tie-breaker when two protocols offer the same
/// net carry, so the derived `Ord` is load-bearing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Marginfi = 0,
    Kamino = 1,
    Solend = 2,
    Drift = 3,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::Marginfi,
        Protocol::Kamino,
        Protocol::Solend,
        Protocol::Drift,
    ];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Marginfi => "marginfi",
            Protocol::Kamino => "kamino",
            Protocol::Solend => "solend",
            Protocol::Drift => "drift",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lst_flags_and_yields() {
        assert!(!Asset::Sol.is_lst());
        assert_eq!(Asset::Sol.staking_apy(), Decimal::ZERO);

        for asset in [Asset::JitoSol, Asset::JupSol, Asset::Inf] {
            assert!(asset.is_lst());
            assert!(asset.staking_apy() > Decimal::ZERO);
        }
    }

    #[test]
    fn test_protocol_tiebreak_order() {
        assert!(Protocol::Marginfi < Protocol::Kamino);
        assert!(Protocol::Kamino < Protocol::Solend);
        assert!(Protocol::Solend < Protocol::Drift);
    }

    #[test]
    fn test_all_assets_hedge_sol_perp() {
        for asset in Asset::ALL {
            assert_eq!(asset.perp_coin(), "SOL");
        }
    }
}
