//! Preflight gating: six checks that must all pass before capital moves.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::consensus::PriceConsensus;
use super::sizer::PositionSize;
use crate::model::{Opportunity, USDC_MINT};
use crate::venues::{
    LendMarketData, LongChain, LongOpenRequest, LongVenue, PerpVenue, ShortChain,
};

/// Gas reserve required on Solana, in native units.
const SOL_GAS_RESERVE: Decimal = dec!(0.1);
/// Gas reserve required on Arbitrum, in native units.
const ETH_GAS_RESERVE: Decimal = dec!(0.002);
/// Fraction of the per-leg deployment that must already be in place.
const BALANCE_COVERAGE: Decimal = dec!(0.95);

pub const CHECK_WALLET_BALANCE: &str = "wallet_balance";
pub const CHECK_PRICE_CONSENSUS: &str = "price_consensus";
pub const CHECK_FUNDING: &str = "funding_validation";
pub const CHECK_CAPACITY: &str = "protocol_capacity";
pub const CHECK_FEE_MARKET: &str = "fee_market";
pub const CHECK_SIMULATION: &str = "opportunity_simulation";

/// Outcome of the preflight run.
#[derive(Debug, Clone)]
pub struct PreflightResult {
    pub passed: bool,
    pub checks: BTreeMap<&'static str, bool>,
    pub errors: Vec<String>,
    /// Deviation measured by the consensus check.
    pub price_deviation: Decimal,
    /// Shortfall to bridge into the perp clearinghouse before the short
    /// opens, when the deposited margin is insufficient but coverable.
    pub needs_bridge_deposit: Option<Decimal>,
}

/// Runs the six gating checks.
pub struct PreflightChecker {
    long_chain: Arc<dyn LongChain>,
    short_chain: Arc<dyn ShortChain>,
    perp: Arc<dyn PerpVenue>,
    long_venue: Arc<dyn LongVenue>,
    market_data: Arc<LendMarketData>,
    consensus: Arc<PriceConsensus>,
    usdc_contract: String,
}

impl PreflightChecker {
    pub fn new(
        long_chain: Arc<dyn LongChain>,
        short_chain: Arc<dyn ShortChain>,
        perp: Arc<dyn PerpVenue>,
        long_venue: Arc<dyn LongVenue>,
        market_data: Arc<LendMarketData>,
        consensus: Arc<PriceConsensus>,
        usdc_contract: impl Into<String>,
    ) -> Self {
        Self {
            long_chain,
            short_chain,
            perp,
            long_venue,
            market_data,
            consensus,
            usdc_contract: usdc_contract.into(),
        }
    }

    /// Run all checks. Short-circuits nothing: every check is recorded so
    /// the caller sees the full picture.
    #[instrument(skip(self, opportunity, sizing), fields(asset = %opportunity.asset))]
    pub async fn run(&self, opportunity: &Opportunity, sizing: &PositionSize) -> PreflightResult {
        let mut checks = BTreeMap::new();
        let mut errors = Vec::new();
        let mut needs_bridge_deposit = None;

        // 1. Wallet balances on both chains plus the perp clearinghouse.
        match self.check_wallet_balance(sizing).await {
            Ok(bridge) => {
                checks.insert(CHECK_WALLET_BALANCE, true);
                needs_bridge_deposit = bridge;
            }
            Err(e) => {
                checks.insert(CHECK_WALLET_BALANCE, false);
                errors.push(e);
            }
        }

        // 2. Price consensus across venues.
        let price_deviation = match self.consensus.check(opportunity.asset).await {
            Ok(result) => {
                checks.insert(CHECK_PRICE_CONSENSUS, result.within_threshold);
                if !result.within_threshold {
                    errors.push(format!(
                        "price deviation {} exceeds threshold {}",
                        result.deviation, result.threshold
                    ));
                }
                result.deviation
            }
            Err(e) => {
                checks.insert(CHECK_PRICE_CONSENSUS, false);
                errors.push(format!("price consensus unavailable: {}", e));
                Decimal::ZERO
            }
        };

        // 3. Funding must be negative now and at the next settlement.
        let funding_ok =
            opportunity.current_funding.is_negative() && opportunity.predicted_funding.is_negative();
        checks.insert(CHECK_FUNDING, funding_ok);
        if !funding_ok {
            errors.push("funding no longer negative on both horizons".into());
        }

        // 4. Selected protocol still has capacity and is still the best.
        match self
            .market_data
            .select_best_protocol(
                opportunity.asset,
                sizing.position_size_usd,
                sizing.leverage,
            )
            .await
        {
            Ok(Some(best)) if best.protocol == opportunity.selected_protocol => {
                checks.insert(CHECK_CAPACITY, true);
            }
            Ok(Some(best)) => {
                checks.insert(CHECK_CAPACITY, false);
                errors.push(format!(
                    "protocol {} now beats selected {}",
                    best.protocol, opportunity.selected_protocol
                ));
            }
            Ok(None) => {
                checks.insert(CHECK_CAPACITY, false);
                errors.push("selected protocol capacity disappeared".into());
            }
            Err(e) => {
                checks.insert(CHECK_CAPACITY, false);
                errors.push(format!("capacity re-query failed: {}", e));
            }
        }

        // 5. Fee market. Held permanently true until priority-fee gating is
        // re-enabled; kept as a named check so the wiring survives.
        checks.insert(CHECK_FEE_MARKET, true);

        // 6. Dry-run both legs.
        match self.simulate_legs(opportunity, sizing).await {
            Ok(()) => {
                checks.insert(CHECK_SIMULATION, true);
            }
            Err(e) => {
                checks.insert(CHECK_SIMULATION, false);
                errors.push(e);
            }
        }

        let passed = checks.values().all(|&ok| ok);
        if passed {
            info!(asset = %opportunity.asset, "preflight passed");
        } else {
            warn!(asset = %opportunity.asset, ?checks, "preflight failed");
        }

        PreflightResult {
            passed,
            checks,
            errors,
            price_deviation,
            needs_bridge_deposit,
        }
    }

    /// Returns the bridge-deposit amount when the perp margin needs topping
    /// up from the Arbitrum wallet.
    async fn check_wallet_balance(&self, sizing: &PositionSize) -> Result<Option<Decimal>, String> {
        let per_leg = sizing.per_leg_deployment_usd;
        let required = per_leg * BALANCE_COVERAGE;

        // Solana: gas + quote balance for the long leg.
        let sol_native = self
            .long_chain
            .get_native_balance()
            .await
            .map_err(|e| format!("solana balance unavailable: {}", e))?;
        if sol_native < SOL_GAS_RESERVE {
            return Err(format!(
                "solana gas reserve {} below required {}",
                sol_native, SOL_GAS_RESERVE
            ));
        }

        let sol_quote = self
            .long_chain
            .get_token_balance(USDC_MINT)
            .await
            .map_err(|e| format!("solana quote balance unavailable: {}", e))?;
        if sol_quote < required {
            return Err(format!(
                "solana quote balance {} below required {}",
                sol_quote, required
            ));
        }

        // Arbitrum: gas reserve.
        let arb_native = self
            .short_chain
            .get_native_balance()
            .await
            .map_err(|e| format!("arbitrum balance unavailable: {}", e))?;
        if arb_native < ETH_GAS_RESERVE {
            return Err(format!(
                "arbitrum gas reserve {} below required {}",
                arb_native, ETH_GAS_RESERVE
            ));
        }

        // Perp clearinghouse margin; shortfalls may bridge from the wallet.
        let account = self
            .perp
            .account_snapshot()
            .await
            .map_err(|e| format!("perp account unavailable: {}", e))?;
        if account.withdrawable >= required {
            return Ok(None);
        }

        let shortfall = per_leg - account.withdrawable;
        let arb_usdc = self
            .short_chain
            .get_token_balance(&self.usdc_contract)
            .await
            .map_err(|e| format!("arbitrum quote balance unavailable: {}", e))?;
        if arb_usdc >= shortfall {
            info!(%shortfall, "perp margin short; will bridge from wallet");
            Ok(Some(shortfall))
        } else {
            Err(format!(
                "perp margin {} and wallet {} cannot cover per-leg {}",
                account.withdrawable, arb_usdc, per_leg
            ))
        }
    }

    async fn simulate_legs(
        &self,
        opportunity: &Opportunity,
        sizing: &PositionSize,
    ) -> Result<(), String> {
        self.long_venue
            .simulate_open(&LongOpenRequest {
                asset: opportunity.asset,
                protocol: opportunity.selected_protocol,
                collateral_usd: sizing.per_leg_deployment_usd,
                leverage: sizing.leverage,
            })
            .await
            .map_err(|e| format!("long leg simulation failed: {}", e))?;

        // The perp leg has no builder; an order book snapshot with a live
        // mid stands in for the dry run.
        let snapshot = self
            .perp
            .snapshot(opportunity.asset.perp_coin())
            .await
            .map_err(|e| format!("perp snapshot failed: {}", e))?;
        if snapshot.mid_price <= Decimal::ZERO {
            return Err("perp book has no mid price".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sizer::{PositionSizer, SizingResult};
    use crate::model::{Asset, FundingRate, OpportunityScore, Protocol, VenueRates};
    use crate::venues::chain::{MockLongChain, MockShortChain};
    use crate::venues::lend::MockLongVenue;
    use crate::venues::perp::{
        MockPerpVenue, PerpAccountSnapshot, PerpMarketSnapshot,
    };
    use chrono::Utc;

    fn opportunity() -> Opportunity {
        let now = Utc::now();
        Opportunity::new(
            Asset::Sol,
            Protocol::Marginfi,
            rates(Protocol::Marginfi, dec!(0.05)),
            FundingRate::new("SOL", dec!(-0.0001), now),
            FundingRate::new("SOL", dec!(-0.00008), now),
            dec!(0.2),
            dec!(3),
            dec!(2500),
            OpportunityScore {
                funding_apy: dec!(0.10),
                net_carry_apy: dec!(0.09),
                lst_staking_apy: Decimal::ZERO,
            },
        )
        .unwrap()
    }

    fn rates(protocol: Protocol, lending: Decimal) -> VenueRates {
        VenueRates {
            protocol,
            long_asset_mint: Asset::Sol.mint().to_string(),
            quote_mint: USDC_MINT.to_string(),
            lending_apy: lending,
            borrowing_apy: dec!(0.03),
            max_borrow_capacity_usd: dec!(10000000),
        }
    }

    fn sizing() -> PositionSize {
        let sizer = PositionSizer::new(Default::default(), dec!(3), dec!(4));
        let SizingResult { size, .. } = sizer.calculate(dec!(50000), dec!(50000), None, None);
        size.unwrap()
    }

    struct Fixture {
        sol_native: Decimal,
        sol_quote: Decimal,
        arb_native: Decimal,
        arb_usdc: Decimal,
        perp_withdrawable: Decimal,
        mark: Decimal,
        oracle: Decimal,
        markets: Vec<VenueRates>,
        simulate_fails: bool,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                sol_native: dec!(1),
                sol_quote: dec!(5000),
                arb_native: dec!(0.05),
                arb_usdc: dec!(5000),
                perp_withdrawable: dec!(5000),
                mark: dec!(150.1),
                oracle: dec!(150.0),
                markets: vec![rates(Protocol::Marginfi, dec!(0.05))],
                simulate_fails: false,
            }
        }
    }

    impl Fixture {
        fn checker(self) -> PreflightChecker {
            let mut long_chain = MockLongChain::new();
            let sol_native = self.sol_native;
            long_chain
                .expect_get_native_balance()
                .returning(move || Ok(sol_native));
            let sol_quote = self.sol_quote;
            long_chain
                .expect_get_token_balance()
                .returning(move |_| Ok(sol_quote));

            let mut short_chain = MockShortChain::new();
            let arb_native = self.arb_native;
            short_chain
                .expect_get_native_balance()
                .returning(move || Ok(arb_native));
            let arb_usdc = self.arb_usdc;
            short_chain
                .expect_get_token_balance()
                .returning(move |_| Ok(arb_usdc));

            let mut perp = MockPerpVenue::new();
            let withdrawable = self.perp_withdrawable;
            perp.expect_account_snapshot().returning(move || {
                Ok(PerpAccountSnapshot {
                    account_value: withdrawable,
                    total_notional: Decimal::ZERO,
                    total_margin_used: Decimal::ZERO,
                    withdrawable,
                    positions: vec![],
                })
            });
            let (mark, oracle) = (self.mark, self.oracle);
            perp.expect_snapshot().returning(move |coin| {
                Ok(PerpMarketSnapshot {
                    coin: coin.to_string(),
                    mark_price: mark,
                    oracle_price: oracle,
                    mid_price: mark,
                    funding_hourly: dec!(-0.0000125),
                    premium: Decimal::ZERO,
                    sz_decimals: 2,
                })
            });

            let mut long_venue = MockLongVenue::new();
            let markets = self.markets.clone();
            long_venue
                .expect_get_markets()
                .returning(move || Ok(markets.clone()));
            long_venue.expect_oracle_price().returning(|_| Ok(None));
            if self.simulate_fails {
                long_venue.expect_simulate_open().returning(|_| {
                    Err(crate::venues::VenueError::Rejected("builder error".into()))
                });
            } else {
                long_venue.expect_simulate_open().returning(|_| Ok(()));
            }

            let long_venue: Arc<dyn LongVenue> = Arc::new(long_venue);
            let perp: Arc<dyn PerpVenue> = Arc::new(perp);

            let mut consensus_long = MockLongVenue::new();
            consensus_long.expect_oracle_price().returning(|_| Ok(None));

            // Market data for the capacity check wraps a separate mock so the
            // simulate expectations above stay scoped to the trading surface.
            let mut md_venue = MockLongVenue::new();
            let markets = self.markets;
            md_venue
                .expect_get_markets()
                .returning(move || Ok(markets.clone()));

            PreflightChecker::new(
                Arc::new(long_chain),
                Arc::new(short_chain),
                perp.clone(),
                long_venue,
                Arc::new(LendMarketData::new(Arc::new(md_venue))),
                Arc::new(PriceConsensus::new(Arc::new(consensus_long), perp)),
                "0xusdc",
            )
        }
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let checker = Fixture::default().checker();
        let result = checker.run(&opportunity(), &sizing()).await;

        assert!(result.passed, "errors: {:?}", result.errors);
        assert_eq!(result.checks.len(), 6);
        assert!(result.needs_bridge_deposit.is_none());
        assert!(result.price_deviation > Decimal::ZERO);
        assert_eq!(result.checks[CHECK_FEE_MARKET], true);
    }

    #[tokio::test]
    async fn test_bridge_deposit_flagged() {
        let checker = Fixture {
            // Margin short by $1500 against the $2500 per-leg target, wallet
            // can cover it.
            perp_withdrawable: dec!(1000),
            ..Default::default()
        }
        .checker();

        let result = checker.run(&opportunity(), &sizing()).await;
        assert!(result.passed, "errors: {:?}", result.errors);
        assert_eq!(result.needs_bridge_deposit, Some(dec!(1500)));
    }

    #[tokio::test]
    async fn test_uncoverable_shortfall_fails() {
        let checker = Fixture {
            perp_withdrawable: dec!(100),
            arb_usdc: dec!(50),
            ..Default::default()
        }
        .checker();

        let result = checker.run(&opportunity(), &sizing()).await;
        assert!(!result.passed);
        assert_eq!(result.checks[CHECK_WALLET_BALANCE], false);
    }

    #[tokio::test]
    async fn test_gas_reserve_enforced() {
        let checker = Fixture {
            sol_native: dec!(0.05),
            ..Default::default()
        }
        .checker();

        let result = checker.run(&opportunity(), &sizing()).await;
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("gas reserve")));
    }

    #[tokio::test]
    async fn test_capacity_disappeared_fails() {
        let checker = Fixture {
            markets: vec![VenueRates {
                max_borrow_capacity_usd: dec!(10),
                ..rates(Protocol::Marginfi, dec!(0.05))
            }],
            ..Default::default()
        }
        .checker();

        let result = checker.run(&opportunity(), &sizing()).await;
        assert!(!result.passed);
        assert_eq!(result.checks[CHECK_CAPACITY], false);
    }

    #[tokio::test]
    async fn test_better_protocol_now_fails_capacity_check() {
        let checker = Fixture {
            markets: vec![
                rates(Protocol::Marginfi, dec!(0.05)),
                rates(Protocol::Kamino, dec!(0.12)),
            ],
            ..Default::default()
        }
        .checker();

        let result = checker.run(&opportunity(), &sizing()).await;
        assert!(!result.passed);
        assert_eq!(result.checks[CHECK_CAPACITY], false);
        assert!(result.errors.iter().any(|e| e.contains("now beats")));
    }

    #[tokio::test]
    async fn test_simulation_failure_fails() {
        let checker = Fixture {
            simulate_fails: true,
            ..Default::default()
        }
        .checker();

        let result = checker.run(&opportunity(), &sizing()).await;
        assert!(!result.passed);
        assert_eq!(result.checks[CHECK_SIMULATION], false);
    }

    #[tokio::test]
    async fn test_wide_price_deviation_fails_consensus_check() {
        let checker = Fixture {
            mark: dec!(160),
            oracle: dec!(150),
            ..Default::default()
        }
        .checker();

        let result = checker.run(&opportunity(), &sizing()).await;
        assert!(!result.passed);
        assert_eq!(result.checks[CHECK_PRICE_CONSENSUS], false);
        assert!(result.price_deviation > dec!(0.06));
    }
}
