//! Position sizing: a deterministic function of balances and caps.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, instrument};

use crate::config::SizingConfig;
use crate::utils::decimal::clamp;

/// Per-leg split of the total deployment.
const LEGS: Decimal = dec!(2);

/// Calculated size for both legs of a trade.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSize {
    /// Collateral per leg (Solana collateral / perp margin).
    pub per_leg_deployment_usd: Decimal,
    /// Notional after leverage.
    pub position_size_usd: Decimal,
    /// Quote borrowed on the long side.
    pub borrowed_usd: Decimal,
    pub leverage: Decimal,
    pub deployment_pct_used: Decimal,
    pub was_capped_by_min: bool,
    pub was_capped_by_max: bool,
    pub was_capped_by_balance: bool,
}

/// Result of a sizing calculation.
#[derive(Debug, Clone)]
pub struct SizingResult {
    pub size: Option<PositionSize>,
    pub error: Option<String>,
    pub limiting_balance_usd: Decimal,
}

impl SizingResult {
    pub fn is_ok(&self) -> bool {
        self.size.is_some()
    }
}

/// Deterministic position sizer.
///
/// Takes the minimum of the two chain balances, applies the deployment
/// percentage, splits 50/50 across legs, and levers the long side. Positions
/// below the minimum scale up to it; if even the minimum cannot be funded
/// within the deployment cap the sizing fails.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
    default_leverage: Decimal,
    max_leverage: Decimal,
}

impl PositionSizer {
    pub fn new(config: SizingConfig, default_leverage: Decimal, max_leverage: Decimal) -> Self {
        Self {
            config,
            default_leverage,
            max_leverage,
        }
    }

    /// Compute per-leg capital. Pure: identical inputs give identical
    /// outputs.
    #[instrument(skip(self))]
    pub fn calculate(
        &self,
        long_chain_balance_usd: Decimal,
        short_chain_balance_usd: Decimal,
        deployment_pct: Option<Decimal>,
        leverage: Option<Decimal>,
    ) -> SizingResult {
        if long_chain_balance_usd < Decimal::ZERO || short_chain_balance_usd < Decimal::ZERO {
            return SizingResult {
                size: None,
                error: Some("balances cannot be negative".into()),
                limiting_balance_usd: Decimal::ZERO,
            };
        }

        let requested_pct = deployment_pct.unwrap_or(self.config.default_deployment_pct);
        let pct = clamp(requested_pct, Decimal::ZERO, self.config.max_deployment_pct);

        let requested_leverage = leverage.unwrap_or(self.default_leverage);
        let leverage = clamp(requested_leverage, Decimal::ONE, self.max_leverage);

        let limiting = long_chain_balance_usd.min(short_chain_balance_usd);
        let total_deployment = limiting * pct;
        let mut per_leg = total_deployment / LEGS;
        let mut position_size = per_leg * leverage;
        let mut was_capped_by_min = false;

        if position_size < self.config.min_position_usd {
            // Scale up to the minimum and re-derive the deployment.
            position_size = self.config.min_position_usd;
            per_leg = position_size / leverage;
            let required_deployment = per_leg * LEGS;

            let max_affordable = limiting * self.config.max_deployment_pct;
            if required_deployment > max_affordable {
                return SizingResult {
                    size: None,
                    error: Some(format!(
                        "insufficient balance for minimum position: need ${:.2} deployed, cap is ${:.2}",
                        required_deployment, max_affordable
                    )),
                    limiting_balance_usd: limiting,
                };
            }
            was_capped_by_min = true;
        }

        let borrowed = position_size - per_leg;
        let deployment_pct_used = if limiting == Decimal::ZERO {
            Decimal::ZERO
        } else {
            per_leg * LEGS / limiting
        };

        let size = PositionSize {
            per_leg_deployment_usd: per_leg,
            position_size_usd: position_size,
            borrowed_usd: borrowed,
            leverage,
            deployment_pct_used,
            was_capped_by_min,
            was_capped_by_max: requested_pct > self.config.max_deployment_pct,
            was_capped_by_balance: long_chain_balance_usd != short_chain_balance_usd,
        };

        debug!(
            position_size = %size.position_size_usd,
            per_leg = %size.per_leg_deployment_usd,
            leverage = %size.leverage,
            "position sized"
        );

        SizingResult {
            size: Some(size),
            error: None,
            limiting_balance_usd: limiting,
        }
    }
}
