//! Opportunity detection and ranking.

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::RiskLimits;
use crate::model::{Asset, FundingRate, Opportunity, OpportunityScore};
use crate::venues::{LendMarketData, PerpVenue};

/// Capital assumed per opportunity while scanning; actual sizing happens at
/// entry from live balances.
const DEFAULT_SCAN_CAPITAL_USD: Decimal = dec!(50000);

/// Scans supported assets and ranks actionable opportunities.
pub struct OpportunityDetector {
    perp: Arc<dyn PerpVenue>,
    market_data: Arc<LendMarketData>,
    leverage: Decimal,
    lookback_hours: u32,
    max_volatility: Decimal,
    scan_capital_usd: Decimal,
}

impl OpportunityDetector {
    pub fn new(
        perp: Arc<dyn PerpVenue>,
        market_data: Arc<LendMarketData>,
        limits: &RiskLimits,
    ) -> Self {
        Self {
            perp,
            market_data,
            leverage: limits.default_leverage,
            lookback_hours: limits.funding.lookback_hours,
            max_volatility: limits.funding.max_volatility,
            scan_capital_usd: DEFAULT_SCAN_CAPITAL_USD,
        }
    }

    pub fn with_scan_capital(mut self, capital_usd: Decimal) -> Self {
        self.scan_capital_usd = capital_usd;
        self
    }

    /// Scan the candidate assets and return opportunities sorted by total
    /// APY, tie-broken by lower volatility, then native SOL over LSTs.
    /// Per-asset failures are logged and skipped.
    #[instrument(skip(self, assets))]
    pub async fn scan(&self, assets: Option<&[Asset]>) -> Vec<Opportunity> {
        let assets = assets.unwrap_or(&Asset::ALL);

        // Every long hedges the same perp coin, so funding is fetched once.
        let current_funding = match self.perp.current_funding("SOL").await {
            Ok(rate) => rate,
            Err(e) => {
                warn!(error = %e, "failed to fetch current funding; skipping scan");
                return Vec::new();
            }
        };

        let mut opportunities = Vec::new();
        for asset in assets {
            match self.analyze_asset(*asset, &current_funding).await {
                Ok(Some(opp)) => opportunities.push(opp),
                Ok(None) => {}
                Err(e) => {
                    warn!(asset = %asset, error = %e, "failed to analyze asset");
                }
            }
        }

        opportunities.sort_by(Self::rank);
        info!(
            found = opportunities.len(),
            scanned = assets.len(),
            "opportunity scan complete"
        );
        opportunities
    }

    /// Ranking: total APY descending, then lower volatility, then native SOL
    /// ahead of LSTs.
    fn rank(a: &Opportunity, b: &Opportunity) -> Ordering {
        b.total_expected_apy()
            .cmp(&a.total_expected_apy())
            .then_with(|| a.funding_volatility.cmp(&b.funding_volatility))
            .then_with(|| a.asset.is_lst().cmp(&b.asset.is_lst()))
    }

    async fn analyze_asset(
        &self,
        asset: Asset,
        current_funding: &FundingRate,
    ) -> Result<Option<Opportunity>> {
        // 1. Shorts must currently be paid.
        if !current_funding.is_negative() {
            debug!(asset = %asset, rate_8h = %current_funding.rate_8h, "funding not negative");
            return Ok(None);
        }

        // 2. Best protocol with capacity for the scan-sized position.
        let position_size = self.scan_capital_usd * self.leverage;
        let best = self
            .market_data
            .select_best_protocol(asset, position_size, self.leverage)
            .await?;
        let Some(rates) = best else {
            debug!(asset = %asset, "no protocol with capacity");
            return Ok(None);
        };

        // 3. Predicted funding must stay negative.
        let predicted = self.perp.predict_next_funding(asset.perp_coin()).await?;
        if !predicted.is_negative() {
            debug!(asset = %asset, predicted_8h = %predicted.rate_8h, "predicted funding not negative");
            return Ok(None);
        }

        // 4. Funding must be stable enough over the lookback.
        let volatility = self
            .perp
            .funding_volatility(asset.perp_coin(), self.lookback_hours)
            .await?;
        if volatility > self.max_volatility {
            debug!(asset = %asset, %volatility, "funding volatility too high");
            return Ok(None);
        }

        // 5. Assemble. The short notional is levered against deployed
        // capital, so the funding yield is leveraged too.
        let score = OpportunityScore {
            funding_apy: current_funding.rate_annual().abs() * self.leverage,
            net_carry_apy: rates.net_carry_apy(self.leverage),
            lst_staking_apy: if asset.is_lst() {
                asset.staking_apy()
            } else {
                Decimal::ZERO
            },
        };

        let opportunity = Opportunity::new(
            asset,
            rates.protocol,
            rates,
            current_funding.clone(),
            predicted,
            volatility,
            self.leverage,
            self.scan_capital_usd,
            score,
        )?;

        debug!(
            asset = %asset,
            protocol = %opportunity.selected_protocol,
            total_apy = %opportunity.total_expected_apy(),
            "opportunity assembled"
        );
        Ok(Some(opportunity))
    }
}
