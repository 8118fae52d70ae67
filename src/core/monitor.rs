//! Multi-tenant position monitor.
//!
//! Every cycle reconciles all open positions against live venue data,
//! persists the merged rows, and feeds the risk engine. Per-user failures
//! are isolated; five consecutive error cycles trigger a backoff sleep.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::manager::PositionManager;
use super::pause::{BreakerKind, Operation, PauseController};
use super::risk_engine::{RiskEngine, RiskObservations};
use crate::config::UserRiskParams;
use crate::model::{Asset, CombinedPosition, ExitDecision, ExitReason, PositionStatus, RiskLevel};
use crate::store::StateStore;
use crate::utils::decimal::midpoint_deviation;
use crate::venues::{LendMarketData, LongChain, LongVenue, PerpVenue, ShortChain};

/// Consecutive error cycles before the service backs off.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Backoff sleep after repeated error cycles.
const ERROR_BACKOFF: Duration = Duration::from_secs(120);
/// Estimated flat cost of closing both legs, before slippage.
const ESTIMATED_CLOSE_GAS_USD: Decimal = dec!(0.35);
/// Close slippage assumption, 10 bps.
const CLOSE_SLIPPAGE: Decimal = dec!(0.001);

/// Externally-set LST depeg flags, one per asset.
#[derive(Default)]
pub struct DepegFlags {
    flagged: RwLock<HashSet<Asset>>,
}

impl DepegFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, asset: Asset) {
        self.flagged.write().expect("depeg lock poisoned").insert(asset);
    }

    pub fn clear(&self, asset: Asset) {
        self.flagged
            .write()
            .expect("depeg lock poisoned")
            .remove(&asset);
    }

    pub fn is_depegged(&self, asset: Asset) -> bool {
        self.flagged
            .read()
            .expect("depeg lock poisoned")
            .contains(&asset)
    }
}

/// Everything needed to observe one tenant's positions.
#[derive(Clone)]
pub struct ObservationSources {
    pub perp: Arc<dyn PerpVenue>,
    pub long_venue: Arc<dyn LongVenue>,
    pub long_chain: Arc<dyn LongChain>,
    pub short_chain: Arc<dyn ShortChain>,
    pub market_data: Arc<LendMarketData>,
    pub depeg_flags: Arc<DepegFlags>,
}

/// Refresh a position's live fields and build the risk observations in one
/// pass. The position is mutated with the merged live data.
#[instrument(skip_all, fields(position_id = %position.position_id))]
pub async fn observe_position(
    position: &mut CombinedPosition,
    sources: &ObservationSources,
) -> Result<RiskObservations> {
    let now = Utc::now();
    let coin = position.short_leg.coin.clone();

    // Chain health feeds the outage trigger; an unreachable chain is an
    // observation, not an error.
    let chain_outage = if !sources.long_chain.health_check().await {
        Some("solana".to_string())
    } else if !sources.short_chain.health_check().await {
        Some("arbitrum".to_string())
    } else {
        None
    };

    // Long-leg live state.
    let long_state = sources
        .long_venue
        .position_state(&position.long_leg.position_handle)
        .await
        .context("long position state unavailable")?;
    position.long_leg.current_health_factor = long_state.health_factor;
    position.long_leg.current_price_base = long_state.price_base;
    position.long_leg.base_token_qty = long_state.base_token_qty;
    position.long_leg.quote_token_borrowed = long_state.quote_borrowed;
    position.long_leg.last_update = now;

    // Short-leg snapshot.
    let snapshot = sources
        .perp
        .snapshot(&coin)
        .await
        .context("perp snapshot unavailable")?;
    let account = sources
        .perp
        .account_snapshot()
        .await
        .context("perp account unavailable")?;

    position.short_leg.mark_price = snapshot.mark_price;
    position.short_leg.last_update = now;
    if let Some(mf) = account.margin_fraction() {
        position.short_leg.margin_fraction = mf;
    }
    position.short_leg.account_value = account.account_value;

    let mut short_unrealized = Decimal::ZERO;
    if let Some(live) = account.position(&coin) {
        position.short_leg.liquidation_price = live.liquidation_price;
        short_unrealized = live.unrealized_pnl;

        // Funding accrues into the running counters by delta.
        let funding_delta = live.cum_funding_since_open - position.short_leg.cum_funding;
        if funding_delta > Decimal::ZERO {
            position.cum_funding_received += funding_delta;
        } else if funding_delta < Decimal::ZERO {
            position.cum_funding_paid += -funding_delta;
        }
        position.short_leg.cum_funding = live.cum_funding_since_open;
    }
    position.updated_at = now;

    // Cross-venue deviation, long-venue oracle preferred.
    let long_price = match sources.long_venue.oracle_price(position.long_leg.asset).await {
        Ok(Some(price)) if price > Decimal::ZERO => price,
        _ => snapshot.oracle_price,
    };
    let price_deviation = Some(midpoint_deviation(long_price, snapshot.mark_price));

    // Funding horizons.
    let current_funding = sources.perp.current_funding(&coin).await.ok();
    let predicted_funding = sources.perp.predict_next_funding(&coin).await.ok();
    let current_funding_annual = current_funding.as_ref().map(|f| f.rate_annual());
    let predicted_funding_annual = predicted_funding.as_ref().map(|f| f.rate_annual());

    // Live APY, recomputed from scratch each cycle.
    let leverage = position.long_leg.leverage;
    let net_carry = sources
        .market_data
        .rates_for(position.long_leg.asset)
        .await
        .ok()
        .and_then(|rates| {
            rates
                .into_iter()
                .find(|r| r.protocol == position.long_leg.protocol)
                .map(|r| r.net_carry_apy(leverage))
        })
        .unwrap_or(Decimal::ZERO);
    let staking = if position.long_leg.asset.is_lst() {
        position.long_leg.asset.staking_apy()
    } else {
        Decimal::ZERO
    };
    let current_apy = current_funding_annual
        .map(|annual| annual.abs() * leverage + net_carry + staking);

    let estimated_close_cost = Some(
        ESTIMATED_CLOSE_GAS_USD + position.long_leg.position_size_usd * CLOSE_SLIPPAGE,
    );

    let long_appreciation =
        position.long_leg.current_value_usd() - position.long_leg.entry_value_usd();
    let pnl_usd = Some(position.net_funding_usd() + short_unrealized + long_appreciation);

    Ok(RiskObservations {
        chain_outage,
        health_factor: position.long_leg.current_health_factor,
        margin_fraction: position.short_leg.margin_fraction,
        lst_depegged: sources.depeg_flags.is_depegged(position.long_leg.asset),
        price_deviation,
        current_apy,
        estimated_close_cost,
        current_funding_annual,
        predicted_funding_annual,
        pnl_usd,
    })
}

/// Which breaker a critical exit decision trips, if any.
pub fn breaker_for(decision: &ExitDecision) -> Option<BreakerKind> {
    if decision.level != RiskLevel::Critical {
        return None;
    }
    match decision.reason? {
        ExitReason::HealthFactor => Some(BreakerKind::LongHealth),
        ExitReason::MarginFraction => Some(BreakerKind::ShortMargin),
        ExitReason::LstDepeg => Some(BreakerKind::LstDepeg),
        ExitReason::PriceDeviation => Some(BreakerKind::PriceDeviation),
        _ => None,
    }
}

/// One tenant's trading context for a monitor cycle.
pub struct UserContext {
    pub manager: Arc<PositionManager>,
    pub sources: ObservationSources,
    pub params: UserRiskParams,
}

/// Builds short-lived per-tenant contexts bound to that user's credentials.
pub trait UserContextProvider: Send + Sync {
    fn context_for(&self, user_id: &str) -> Result<UserContext>;
}

/// The long-running multi-tenant monitor.
pub struct PositionMonitorService {
    store: Arc<StateStore>,
    contexts: Arc<dyn UserContextProvider>,
    risk: StdMutex<RiskEngine>,
    pause: Arc<PauseController>,
    poll_interval: Duration,
    enable_auto_exit: bool,
    error_backoff: Duration,
}

impl PositionMonitorService {
    pub fn new(
        store: Arc<StateStore>,
        contexts: Arc<dyn UserContextProvider>,
        risk: RiskEngine,
        pause: Arc<PauseController>,
        poll_interval: Duration,
        enable_auto_exit: bool,
    ) -> Self {
        Self {
            store,
            contexts,
            risk: StdMutex::new(risk),
            pause,
            poll_interval,
            enable_auto_exit,
            error_backoff: ERROR_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Run until the shutdown flag is set. In-flight cycles complete.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            auto_exit = self.enable_auto_exit,
            "position monitor service started"
        );
        let mut consecutive_errors = 0u32;

        while !shutdown.load(Ordering::SeqCst) {
            let errors = self.run_cycle().await;
            if errors > 0 {
                consecutive_errors += 1;
                warn!(errors, consecutive_errors, "monitor cycle had errors");
            } else {
                consecutive_errors = 0;
            }

            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                error!(
                    consecutive_errors,
                    backoff_secs = self.error_backoff.as_secs(),
                    "too many consecutive error cycles; backing off"
                );
                tokio::time::sleep(self.error_backoff).await;
                consecutive_errors = 0;
                continue;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
        info!("position monitor service stopped");
    }

    /// Run one reconcile cycle. Returns the number of users whose
    /// processing failed.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> usize {
        // Breaker cooldowns recover on the monitor cadence.
        self.pause.check_and_recover();

        let positions = match self.store.load_positions(None) {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "failed to load open positions");
                return 1;
            }
        };

        let mut by_user: HashMap<String, Vec<CombinedPosition>> = HashMap::new();
        for position in positions {
            if position.status == PositionStatus::Open {
                by_user
                    .entry(position.user_id.clone())
                    .or_default()
                    .push(position);
            }
        }

        let mut user_errors = 0usize;
        for (user_id, positions) in by_user {
            if let Err(e) = self.process_user(&user_id, positions).await {
                error!(user = %user_id, error = %e, "user cycle failed");
                user_errors += 1;
            }
        }
        user_errors
    }

    async fn process_user(
        &self,
        user_id: &str,
        positions: Vec<CombinedPosition>,
    ) -> Result<()> {
        let ctx = self.contexts.context_for(user_id)?;
        let mut had_error = false;

        for mut position in positions {
            match self.process_position(&ctx, &mut position).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        position_id = %position.position_id,
                        error = %e,
                        "position cycle failed"
                    );
                    had_error = true;
                }
            }
        }

        if had_error {
            anyhow::bail!("one or more positions failed for {}", user_id);
        }
        Ok(())
    }

    async fn process_position(
        &self,
        ctx: &UserContext,
        position: &mut CombinedPosition,
    ) -> Result<()> {
        let observations = observe_position(position, &ctx.sources).await?;

        // Merge the refreshed row before deciding anything.
        self.store
            .save_position(position)
            .context("failed to persist refreshed position")?;

        let decision = {
            let mut risk = self.risk.lock().expect("risk lock poisoned");
            risk.evaluate(position, &observations, &ctx.params)
        };

        if !decision.should_exit {
            debug!(
                position_id = %position.position_id,
                level = ?decision.level,
                "position healthy"
            );
            return Ok(());
        }

        let reason = decision.reason.unwrap_or(ExitReason::Manual);
        info!(
            position_id = %position.position_id,
            reason = %reason,
            level = ?decision.level,
            "exit triggered"
        );

        if let Some(kind) = breaker_for(&decision) {
            self.pause
                .trigger_breaker(kind, &format!("{}: {}", reason, decision.details));
        }

        if !self.enable_auto_exit {
            warn!("auto-exit disabled; exit decision logged only");
            return Ok(());
        }
        if !self.pause.can_execute(Operation::Exit) {
            warn!("exit paused; decision logged only");
            return Ok(());
        }

        let result = ctx.manager.close_position(position, reason).await;
        if result.success {
            let mut risk = self.risk.lock().expect("risk lock poisoned");
            risk.clear_proximity(&position.user_id, &position.long_leg.position_handle);
            risk.clear_proximity(&position.user_id, &position.short_leg.coin);
        } else {
            warn!(
                position_id = %position.position_id,
                stage = ?result.stage,
                error = ?result.error,
                "auto-exit close failed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskLimits;
    use crate::core::consensus::PriceConsensus;
    use crate::core::events::CallbackRegistry;
    use crate::core::manager::ManagerConfig;
    use crate::model::test_fixtures::position;
    use crate::venues::chain::{MockKeyService, MockLongChain, MockShortChain};
    use crate::venues::lend::{LongPositionState, MockLongVenue};
    use crate::venues::perp::{
        MockPerpVenue, PerpAccountSnapshot, PerpFill, PerpMarketSnapshot, PerpPositionInfo,
    };
    use crate::model::FundingRate;

    fn snapshot(mark: Decimal) -> PerpMarketSnapshot {
        PerpMarketSnapshot {
            coin: "SOL".into(),
            mark_price: mark,
            oracle_price: mark,
            mid_price: mark,
            funding_hourly: dec!(-0.0000125),
            premium: Decimal::ZERO,
            sz_decimals: 2,
        }
    }

    /// A tenant context whose venues report the given health factor and
    /// close successfully.
    fn healthy_context(
        store: Arc<StateStore>,
        health_factor: Decimal,
        long_state_fails: bool,
    ) -> UserContext {
        let mut long_venue = MockLongVenue::new();
        long_venue.expect_oracle_price().returning(|_| Ok(None));
        if long_state_fails {
            long_venue
                .expect_position_state()
                .returning(|_| Err(crate::venues::VenueError::Network("rpc down".into())));
        } else {
            long_venue.expect_position_state().returning(move |handle| {
                Ok(LongPositionState {
                    position_handle: handle.to_string(),
                    health_factor,
                    base_token_qty: dec!(75),
                    quote_borrowed: dec!(5000),
                    price_base: dec!(100),
                    is_active: true,
                })
            });
        }
        long_venue.expect_build_close().returning(|_| {
            Ok(crate::venues::UnsignedLongTx {
                intent_id: "intent-close".into(),
                tx_bytes: b"close".to_vec(),
            })
        });
        long_venue.expect_get_markets().returning(|| Ok(vec![]));

        let mut perp = MockPerpVenue::new();
        perp.expect_snapshot().returning(|_| Ok(snapshot(dec!(100))));
        perp.expect_account_snapshot().returning(|| {
            Ok(PerpAccountSnapshot {
                account_value: dec!(2500),
                total_notional: dec!(7500),
                total_margin_used: dec!(2500),
                withdrawable: dec!(100),
                positions: vec![PerpPositionInfo {
                    coin: "SOL".into(),
                    size_base: dec!(-75),
                    entry_price: dec!(100),
                    position_value: dec!(7500),
                    unrealized_pnl: dec!(5),
                    margin_used: dec!(2500),
                    liquidation_price: Some(dec!(135)),
                    leverage: dec!(3),
                    cum_funding_since_open: dec!(12),
                }],
            })
        });
        perp.expect_current_funding()
            .returning(|coin| Ok(FundingRate::new(coin, dec!(-0.0001), Utc::now())));
        perp.expect_predict_next_funding()
            .returning(|coin| Ok(FundingRate::new(coin, dec!(-0.00008), Utc::now())));
        perp.expect_submit_order().returning(|order| {
            Ok(PerpFill {
                filled_size: order.size,
                avg_price: dec!(100),
            })
        });

        let mut long_chain = MockLongChain::new();
        long_chain.expect_health_check().returning(|| true);
        long_chain
            .expect_send_raw_transaction()
            .returning(|_| Ok("sig-close".into()));
        long_chain
            .expect_confirm_signature()
            .returning(|_, _| Ok(true));

        let mut short_chain = MockShortChain::new();
        short_chain.expect_health_check().returning(|| true);

        let mut key = MockKeyService::new();
        key.expect_sign_transaction().returning(|tx| Ok(tx.to_vec()));

        let mut md_venue = MockLongVenue::new();
        md_venue.expect_get_markets().returning(|| Ok(vec![]));

        let long_venue: Arc<dyn LongVenue> = Arc::new(long_venue);
        let perp: Arc<dyn PerpVenue> = Arc::new(perp);
        let long_chain: Arc<dyn LongChain> = Arc::new(long_chain);
        let sources = ObservationSources {
            perp: perp.clone(),
            long_venue: long_venue.clone(),
            long_chain: long_chain.clone(),
            short_chain: Arc::new(short_chain),
            market_data: Arc::new(LendMarketData::new(Arc::new(md_venue))),
            depeg_flags: Arc::new(DepegFlags::new()),
        };

        let consensus = Arc::new(PriceConsensus::new(long_venue.clone(), perp.clone()));
        let manager = Arc::new(PositionManager::new(
            "ignored",
            long_venue,
            perp,
            long_chain,
            Arc::new(key),
            consensus,
            store,
            Arc::new(CallbackRegistry::new()),
            ManagerConfig {
                short_open_attempts: 2,
                short_retry_interval: Duration::from_millis(1),
                ..Default::default()
            },
        ));

        UserContext {
            manager,
            sources,
            params: UserRiskParams::default(),
        }
    }

    struct TestProvider {
        store: Arc<StateStore>,
        /// user id -> (health factor, long state fails)
        users: HashMap<String, (Decimal, bool)>,
    }

    impl UserContextProvider for TestProvider {
        fn context_for(&self, user_id: &str) -> Result<UserContext> {
            let (hf, fails) = self
                .users
                .get(user_id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown user {}", user_id))?;
            Ok(healthy_context(self.store.clone(), hf, fails))
        }
    }

    fn service(
        store: Arc<StateStore>,
        users: HashMap<String, (Decimal, bool)>,
        pause: Arc<PauseController>,
    ) -> PositionMonitorService {
        let provider = TestProvider {
            store: store.clone(),
            users,
        };
        PositionMonitorService::new(
            store,
            Arc::new(provider),
            RiskEngine::new(RiskLimits::default()),
            pause,
            Duration::from_millis(10),
            true,
        )
        .with_error_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_healthy_cycle_refreshes_positions() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let mut pos = position(Asset::Sol);
        pos.user_id = "user_a".into();
        store.save_position(&pos).unwrap();

        let users = HashMap::from([("user_a".to_string(), (dec!(0.5), false))]);
        let svc = service(
            store.clone(),
            users,
            Arc::new(PauseController::new("k", true)),
        );

        assert_eq!(svc.run_cycle().await, 0);

        let refreshed = store.load_positions(None).unwrap();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].long_leg.current_health_factor, dec!(0.5));
        assert_eq!(refreshed[0].short_leg.liquidation_price, Some(dec!(135)));
        // Funding flowed into the received counter.
        assert_eq!(refreshed[0].cum_funding_received, dec!(12));
    }

    #[tokio::test]
    async fn test_critical_health_closes_and_trips_breaker() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let mut pos = position(Asset::Sol);
        pos.user_id = "user_a".into();
        store.save_position(&pos).unwrap();

        let pause = Arc::new(PauseController::new("k", true));
        let users = HashMap::from([("user_a".to_string(), (dec!(0.05), false))]);
        let svc = service(store.clone(), users, pause.clone());

        assert_eq!(svc.run_cycle().await, 0);

        // Closed and archived.
        assert_eq!(store.load_positions(None).unwrap().len(), 0);
        let history = store.history(5).unwrap();
        assert_eq!(history.len(), 1);
        // Breaker LONG_HEALTH tripped; entries blocked, exits not.
        let breakers = pause.active_breakers();
        assert_eq!(breakers.len(), 1);
        assert_eq!(breakers[0].kind, BreakerKind::LongHealth);
        assert!(!pause.can_execute(Operation::Entry));
        assert!(pause.can_execute(Operation::Exit));
    }

    #[tokio::test]
    async fn test_multi_tenant_error_isolation() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let mut a = position(Asset::Sol);
        a.user_id = "user_a".into();
        let mut b = position(Asset::JitoSol);
        b.user_id = "user_b".into();
        store.save_position(&a).unwrap();
        store.save_position(&b).unwrap();

        // user_a's chain call raises; user_b is healthy.
        let users = HashMap::from([
            ("user_a".to_string(), (dec!(0.5), true)),
            ("user_b".to_string(), (dec!(0.5), false)),
        ]);
        let svc = service(
            store.clone(),
            users,
            Arc::new(PauseController::new("k", true)),
        );

        // Exactly one user errored; the cycle completed.
        assert_eq!(svc.run_cycle().await, 1);

        // user_b was refreshed despite user_a failing.
        let positions = store.load_positions(Some("user_b")).unwrap();
        assert_eq!(positions[0].long_leg.current_health_factor, dec!(0.5));
    }

    #[tokio::test]
    async fn test_exit_respected_by_pause_scope() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let mut pos = position(Asset::Sol);
        pos.user_id = "user_a".into();
        store.save_position(&pos).unwrap();

        let pause = Arc::new(PauseController::new("k", true));
        pause
            .pause("k", "maintenance", super::super::pause::PauseScope::Exit)
            .unwrap();

        let users = HashMap::from([("user_a".to_string(), (dec!(0.05), false))]);
        let svc = service(store.clone(), users, pause);

        svc.run_cycle().await;
        // Exit blocked: the position stays open.
        assert_eq!(store.load_positions(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_funding_flip_closes_without_breaker() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let mut pos = position(Asset::Sol);
        pos.user_id = "user_a".into();
        store.save_position(&pos).unwrap();

        // Healthy legs but flipped funding prediction.
        let pause = Arc::new(PauseController::new("k", true));
        let provider = FlippedProvider {
            store: store.clone(),
        };
        let svc = PositionMonitorService::new(
            store.clone(),
            Arc::new(provider),
            RiskEngine::new(RiskLimits::default()),
            pause.clone(),
            Duration::from_millis(10),
            true,
        );

        svc.run_cycle().await;

        assert_eq!(store.load_positions(None).unwrap().len(), 0);
        // Warning-level exits trip no breaker.
        assert!(pause.active_breakers().is_empty());
        assert!(pause.can_execute(Operation::Entry));
    }

    struct FlippedProvider {
        store: Arc<StateStore>,
    }

    impl UserContextProvider for FlippedProvider {
        fn context_for(&self, _user_id: &str) -> Result<UserContext> {
            let mut ctx = healthy_context(self.store.clone(), dec!(0.5), false);
            // Swap the perp for one predicting positive funding.
            let mut perp = MockPerpVenue::new();
            perp.expect_snapshot().returning(|_| Ok(snapshot(dec!(100))));
            perp.expect_account_snapshot().returning(|| {
                Ok(PerpAccountSnapshot {
                    account_value: dec!(2500),
                    total_notional: dec!(7500),
                    total_margin_used: dec!(2500),
                    withdrawable: dec!(100),
                    positions: vec![],
                })
            });
            perp.expect_current_funding()
                .returning(|coin| Ok(FundingRate::new(coin, dec!(-0.001), Utc::now())));
            perp.expect_predict_next_funding()
                .returning(|coin| Ok(FundingRate::new(coin, dec!(0.0005), Utc::now())));
            perp.expect_submit_order().returning(|order| {
                Ok(PerpFill {
                    filled_size: order.size,
                    avg_price: dec!(100),
                })
            });
            ctx.sources.perp = Arc::new(perp);

            // The manager also needs the flipped perp for its close path.
            let mut close_perp = MockPerpVenue::new();
            close_perp
                .expect_snapshot()
                .returning(|_| Ok(snapshot(dec!(100))));
            close_perp.expect_submit_order().returning(|order| {
                Ok(PerpFill {
                    filled_size: order.size,
                    avg_price: dec!(100),
                })
            });
            let mut long_venue = MockLongVenue::new();
            long_venue.expect_oracle_price().returning(|_| Ok(None));
            long_venue.expect_build_close().returning(|_| {
                Ok(crate::venues::UnsignedLongTx {
                    intent_id: "intent-close".into(),
                    tx_bytes: b"close".to_vec(),
                })
            });
            let mut long_chain = MockLongChain::new();
            long_chain
                .expect_send_raw_transaction()
                .returning(|_| Ok("sig".into()));
            long_chain
                .expect_confirm_signature()
                .returning(|_, _| Ok(true));
            let mut key = MockKeyService::new();
            key.expect_sign_transaction().returning(|tx| Ok(tx.to_vec()));

            let long_venue: Arc<dyn LongVenue> = Arc::new(long_venue);
            let close_perp: Arc<dyn PerpVenue> = Arc::new(close_perp);
            let consensus = Arc::new(PriceConsensus::new(long_venue.clone(), close_perp.clone()));
            ctx.manager = Arc::new(PositionManager::new(
                "ignored",
                long_venue,
                close_perp,
                Arc::new(long_chain),
                Arc::new(key),
                consensus,
                self.store.clone(),
                Arc::new(CallbackRegistry::new()),
                ManagerConfig {
                    short_open_attempts: 2,
                    short_retry_interval: Duration::from_millis(1),
                    ..Default::default()
                },
            ));
            Ok(ctx)
        }
    }
}
