//! Top-level bot: scheduling, gating, signal handling, and callback fan-out
//! for the single-tenant path.
//!
//! Two periodic loops run concurrently: a scan loop (entries) and a monitor
//! loop (auto-exits). Cycles are serialized within each loop by the
//! sleep-then-run pattern; in-flight cycles finish before shutdown.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::detector::OpportunityDetector;
use super::events::CallbackRegistry;
use super::kill_switch::KillSwitch;
use super::manager::PositionManager;
use super::monitor::{breaker_for, observe_position, ObservationSources};
use super::pause::{Operation, PauseController, PauseScope};
use super::preflight::PreflightChecker;
use super::risk_engine::RiskEngine;
use super::sizer::PositionSizer;
use crate::config::Config;
use crate::model::{CombinedPosition, ExitReason, Opportunity, USDC_MINT};
use crate::store::StateStore;

/// Runtime counters, reported by the status surface.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub started_at: DateTime<Utc>,
    pub scan_cycles: u64,
    pub monitor_cycles: u64,
    pub opportunities_found: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub errors: u64,
}

impl Default for BotStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            scan_cycles: 0,
            monitor_cycles: 0,
            opportunities_found: 0,
            positions_opened: 0,
            positions_closed: 0,
            errors: 0,
        }
    }
}

/// Everything the bot owns, injected at construction.
pub struct BotDeps {
    pub config: Config,
    pub user_id: String,
    pub store: Arc<StateStore>,
    pub detector: OpportunityDetector,
    pub preflight: PreflightChecker,
    pub sizer: PositionSizer,
    pub manager: Arc<PositionManager>,
    pub sources: ObservationSources,
    pub pause: Arc<PauseController>,
    pub events: Arc<CallbackRegistry>,
    pub risk: RiskEngine,
}

/// The delta-neutral trading bot.
pub struct Bot {
    config: Config,
    user_id: String,
    store: Arc<StateStore>,
    detector: OpportunityDetector,
    preflight: PreflightChecker,
    sizer: PositionSizer,
    manager: Arc<PositionManager>,
    sources: ObservationSources,
    pause: Arc<PauseController>,
    events: Arc<CallbackRegistry>,
    risk: StdMutex<RiskEngine>,
    /// In-memory cache of this tenant's open positions; the store is the
    /// source of truth across restarts.
    positions: RwLock<HashMap<Uuid, CombinedPosition>>,
    kill_switch: StdMutex<Option<KillSwitch>>,
    shutdown: Arc<AtomicBool>,
    stats: StdMutex<BotStats>,
}

impl Bot {
    pub fn new(deps: BotDeps) -> Self {
        Self {
            config: deps.config,
            user_id: deps.user_id,
            store: deps.store,
            detector: deps.detector,
            preflight: deps.preflight,
            sizer: deps.sizer,
            manager: deps.manager,
            sources: deps.sources,
            pause: deps.pause,
            events: deps.events,
            risk: StdMutex::new(deps.risk),
            positions: RwLock::new(HashMap::new()),
            kill_switch: StdMutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: StdMutex::new(BotStats::default()),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> BotStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    pub fn open_positions(&self) -> Vec<CombinedPosition> {
        self.positions
            .read()
            .expect("position lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Manual pause with the admin key.
    pub fn pause(&self, api_key: &str, reason: &str, scope: PauseScope) -> Result<()> {
        self.pause.pause(api_key, reason, scope)
    }

    pub fn resume(&self, api_key: &str) -> Result<()> {
        self.pause.resume(api_key)
    }

    /// Rebuild the in-memory map from the store. Returns how many open
    /// positions were recovered.
    pub fn recover_state(&self) -> Result<usize> {
        let recovered = self
            .store
            .load_positions(Some(&self.user_id))
            .context("state recovery failed")?;
        let count = recovered.len();

        let mut positions = self.positions.write().expect("position lock poisoned");
        positions.clear();
        for position in recovered {
            positions.insert(position.position_id, position);
        }

        info!(count, "recovered open positions from store");
        Ok(count)
    }

    /// Kill-switch handler: pause everything, close nothing. Positions keep
    /// accruing funding until an operator closes them deliberately.
    pub fn handle_kill(&self, reason: &str) {
        self.pause
            .force_pause(&format!("Kill switch: {}", reason), PauseScope::All);
    }

    fn start_kill_switch(self: &Arc<Self>) {
        let mut switch = KillSwitch::new(&self.config.app.kill_switch_path);
        let bot = Arc::downgrade(self);
        switch.on_triggered(Arc::new(move |reason| {
            if let Some(bot) = bot.upgrade() {
                bot.handle_kill(&reason);
            }
        }));
        switch.start();
        *self.kill_switch.lock().expect("kill lock poisoned") = Some(switch);
    }

    /// Run until SIGINT/SIGTERM. Scan and monitor loops run concurrently;
    /// each finishes its in-flight cycle before exiting.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.recover_state()?;
        self.start_kill_switch();

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        info!(
            scan_interval = self.config.app.scan_interval_seconds,
            poll_interval = self.config.app.poll_interval_seconds,
            "bot started"
        );

        let scan = self.scan_loop();
        let monitor = self.monitor_loop();
        tokio::join!(scan, monitor);

        if let Some(mut switch) = self.kill_switch.lock().expect("kill lock poisoned").take() {
            switch.stop();
        }
        info!("bot stopped cleanly");
        Ok(())
    }

    async fn scan_loop(&self) {
        let interval = Duration::from_secs(self.config.app.scan_interval_seconds);
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.scan_cycle().await {
                error!(error = %e, "scan cycle failed");
                self.stats.lock().expect("stats lock poisoned").errors += 1;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn monitor_loop(&self) {
        let interval = Duration::from_secs(self.config.app.poll_interval_seconds);
        while !self.shutdown.load(Ordering::SeqCst) {
            self.pause.check_and_recover();
            if let Err(e) = self.monitor_cycle().await {
                error!(error = %e, "monitor cycle failed");
                self.stats.lock().expect("stats lock poisoned").errors += 1;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One scan cycle: detect, gate, size, preflight, open.
    #[instrument(skip(self))]
    pub async fn scan_cycle(&self) -> Result<()> {
        self.stats.lock().expect("stats lock poisoned").scan_cycles += 1;

        if !self.pause.can_execute(Operation::Entry) {
            debug!("entry paused; skipping scan");
            return Ok(());
        }

        // The concurrency cap counts positions across all tenants.
        let open_count = self.store.count_open_positions()?;
        if open_count >= self.config.app.max_concurrent_positions {
            debug!(open_count, "at max concurrent positions; skipping scan");
            return Ok(());
        }

        let opportunities = self.detector.scan(None).await;
        self.stats.lock().expect("stats lock poisoned").opportunities_found +=
            opportunities.len() as u64;

        let Some(best) = opportunities
            .into_iter()
            .find(|o| o.total_expected_apy() >= self.config.app.min_opportunity_apy)
        else {
            debug!("no opportunity above the APY floor");
            return Ok(());
        };
        self.events.emit_opportunity(&best);

        self.execute_entry(best).await
    }

    async fn execute_entry(&self, mut opportunity: Opportunity) -> Result<()> {
        // Size from live balances on both sides.
        let long_balance = self
            .sources
            .long_chain
            .get_token_balance(USDC_MINT)
            .await
            .map_err(|e| anyhow::anyhow!("long balance unavailable: {}", e))?;
        let short_balance = self.short_side_balance().await?;

        let sized = self.sizer.calculate(long_balance, short_balance, None, None);
        let Some(sizing) = sized.size else {
            info!(error = ?sized.error, "sizing declined the entry");
            return Ok(());
        };

        let preflight = self.preflight.run(&opportunity, &sizing).await;
        opportunity.price_deviation = preflight.price_deviation;
        opportunity.preflight_passed = preflight.passed;
        if !preflight.passed {
            info!(errors = ?preflight.errors, "preflight failed; skipping entry");
            return Ok(());
        }

        let result = self
            .manager
            .open_position(
                &opportunity,
                &sizing,
                preflight.needs_bridge_deposit,
                Uuid::new_v4(),
            )
            .await;

        if result.success {
            if let Some(position) = result.position {
                self.positions
                    .write()
                    .expect("position lock poisoned")
                    .insert(position.position_id, position);
                self.stats.lock().expect("stats lock poisoned").positions_opened += 1;
            }
        } else {
            warn!(
                stage = ?result.stage,
                error = ?result.error,
                "entry failed"
            );
            self.stats.lock().expect("stats lock poisoned").errors += 1;
        }
        Ok(())
    }

    async fn short_side_balance(&self) -> Result<Decimal> {
        let account = self
            .sources
            .perp
            .account_snapshot()
            .await
            .map_err(|e| anyhow::anyhow!("perp account unavailable: {}", e))?;
        let wallet = self
            .sources
            .short_chain
            .get_token_balance(&self.config.arbitrum.usdc_contract)
            .await
            .map_err(|e| anyhow::anyhow!("arbitrum balance unavailable: {}", e))?;
        Ok(account.withdrawable + wallet)
    }

    /// One monitor cycle over the snapshot of positions taken at cycle
    /// start. Writes inside the cycle do not affect the iteration set.
    #[instrument(skip(self))]
    pub async fn monitor_cycle(&self) -> Result<()> {
        self.stats.lock().expect("stats lock poisoned").monitor_cycles += 1;

        let snapshot: Vec<CombinedPosition> = self
            .positions
            .read()
            .expect("position lock poisoned")
            .values()
            .cloned()
            .collect();

        for mut position in snapshot {
            if let Err(e) = self.monitor_position(&mut position).await {
                warn!(
                    position_id = %position.position_id,
                    error = %e,
                    "monitoring failed for position"
                );
                self.stats.lock().expect("stats lock poisoned").errors += 1;
            }
        }
        Ok(())
    }

    async fn monitor_position(&self, position: &mut CombinedPosition) -> Result<()> {
        let observations = observe_position(position, &self.sources).await?;
        self.store.save_position(position)?;
        self.positions
            .write()
            .expect("position lock poisoned")
            .insert(position.position_id, position.clone());

        let decision = {
            let mut risk = self.risk.lock().expect("risk lock poisoned");
            let params = self.config.user_params(&self.user_id);
            risk.evaluate(position, &observations, &params)
        };

        if !decision.should_exit {
            return Ok(());
        }

        let reason = decision.reason.unwrap_or(ExitReason::Manual);
        info!(
            position_id = %position.position_id,
            reason = %reason,
            level = ?decision.level,
            "exit triggered"
        );

        if self.config.app.enable_circuit_breakers {
            if let Some(kind) = breaker_for(&decision) {
                self.pause
                    .trigger_breaker(kind, &format!("{}: {}", reason, decision.details));
            }
        }

        if !self.config.app.enable_auto_exit {
            warn!("auto-exit disabled; decision logged only");
            return Ok(());
        }
        if !self.pause.can_execute(Operation::Exit) {
            warn!("exit paused; decision logged only");
            return Ok(());
        }

        let result = self.manager.close_position(position, reason).await;
        if result.success {
            self.positions
                .write()
                .expect("position lock poisoned")
                .remove(&position.position_id);
            let mut risk = self.risk.lock().expect("risk lock poisoned");
            risk.clear_proximity(&position.user_id, &position.long_leg.position_handle);
            risk.clear_proximity(&position.user_id, &position.short_leg.coin);
            self.stats.lock().expect("stats lock poisoned").positions_closed += 1;
        } else {
            // Keep the (possibly stuck) position visible in the map.
            self.positions
                .write()
                .expect("position lock poisoned")
                .insert(position.position_id, position.clone());
            warn!(stage = ?result.stage, error = ?result.error, "auto-exit close failed");
        }
        Ok(())
    }
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::core::consensus::PriceConsensus;
    use crate::core::manager::ManagerConfig;
    use crate::core::monitor::DepegFlags;
    use crate::model::test_fixtures::position;
    use crate::model::{Asset, FundingRate, PositionStatus, Protocol, VenueRates};
    use crate::venues::chain::{MockKeyService, MockLongChain, MockShortChain};
    use crate::venues::lend::{LendMarketData, LongPositionState, MockLongVenue};
    use crate::venues::perp::{
        MockPerpVenue, PerpAccountSnapshot, PerpFill, PerpMarketSnapshot,
    };
    use crate::venues::{LongChain, LongVenue, PerpVenue};
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        Config {
            app: AppConfig {
                poll_interval_seconds: 30,
                scan_interval_seconds: 60,
                max_concurrent_positions: 5,
                min_opportunity_apy: dec!(0.01),
                enable_auto_exit: true,
                enable_circuit_breakers: true,
                admin_api_key: "test-key".into(),
                kill_switch_path: std::env::temp_dir()
                    .join(format!("bh-bot-kill-{}", Uuid::new_v4()))
                    .to_string_lossy()
                    .into_owned(),
                db_path: ":memory:".into(),
            },
            solana: SolanaConfig {
                rpc_url: "http://localhost:8899".into(),
                wallet: "wallet".into(),
            },
            arbitrum: ArbitrumConfig {
                rpc_url: "http://localhost:8545".into(),
                wallet: "0xwallet".into(),
                usdc_contract: "0xusdc".into(),
            },
            hyperliquid: HyperliquidConfig {
                api_url: "http://localhost:1".into(),
                wallet: "0xwallet".into(),
            },
            lend: LendConfig {
                api_url: "http://localhost:2".into(),
            },
            signer: SignerConfig {
                url: "http://localhost:3".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
            },
            sizing: SizingConfig::default(),
            risk: RiskLimits::default(),
            users: HashMap::new(),
        }
    }

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

    fn markets() -> Vec<VenueRates> {
        Asset::ALL
            .iter()
            .map(|asset| VenueRates {
                protocol: Protocol::Marginfi,
                long_asset_mint: asset.mint().to_string(),
                quote_mint: USDC_MINT.to_string(),
                lending_apy: dec!(0.05),
                borrowing_apy: dec!(0.03),
                max_borrow_capacity_usd: dec!(10000000),
            })
            .collect()
    }

    /// A bot whose mocks let a full entry succeed end to end.
    fn trading_bot(store: Arc<StateStore>) -> Bot {
        let mut perp = MockPerpVenue::new();
        perp.expect_current_funding()
            .returning(|coin| Ok(FundingRate::new(coin, dec!(-0.0001), Utc::now())));
        perp.expect_predict_next_funding()
            .returning(|coin| Ok(FundingRate::new(coin, dec!(-0.00008), Utc::now())));
        perp.expect_funding_volatility().returning(|_, _| Ok(dec!(0.2)));
        perp.expect_snapshot().returning(|_| Ok(snapshot(dec!(100))));
        perp.expect_account_snapshot().returning(|| {
            Ok(PerpAccountSnapshot {
                account_value: dec!(50000),
                total_notional: Decimal::ZERO,
                total_margin_used: Decimal::ZERO,
                withdrawable: dec!(50000),
                positions: vec![],
            })
        });
        perp.expect_update_leverage().returning(|_, _, _| Ok(()));
        perp.expect_submit_order().returning(|order| {
            Ok(PerpFill {
                filled_size: order.size,
                avg_price: dec!(100),
            })
        });

        let mut long_venue = MockLongVenue::new();
        long_venue.expect_get_markets().returning(|| Ok(markets()));
        long_venue.expect_oracle_price().returning(|_| Ok(None));
        long_venue.expect_simulate_open().returning(|_| Ok(()));
        long_venue.expect_build_open().returning(|_| {
            Ok(crate::venues::UnsignedLongTx {
                intent_id: "intent-1".into(),
                tx_bytes: b"tx".to_vec(),
            })
        });
        long_venue.expect_confirm_open().returning(|intent, _| {
            Ok(crate::venues::LongOpenReceipt {
                position_handle: "pda-1".into(),
                intent_id: intent.to_string(),
                collateral_usd: dec!(2500),
                borrowed_usd: dec!(5000),
                base_token_qty: dec!(75),
                entry_price: dec!(100),
            })
        });
        long_venue.expect_position_state().returning(|handle| {
            Ok(LongPositionState {
                position_handle: handle.to_string(),
                health_factor: dec!(0.5),
                base_token_qty: dec!(75),
                quote_borrowed: dec!(5000),
                price_base: dec!(100),
                is_active: true,
            })
        });
        long_venue.expect_build_close().returning(|_| {
            Ok(crate::venues::UnsignedLongTx {
                intent_id: "intent-close".into(),
                tx_bytes: b"close".to_vec(),
            })
        });

        let mut long_chain = MockLongChain::new();
        long_chain.expect_health_check().returning(|| true);
        long_chain
            .expect_get_token_balance()
            .returning(|_| Ok(dec!(50000)));
        long_chain.expect_get_native_balance().returning(|| Ok(dec!(1)));
        long_chain
            .expect_send_raw_transaction()
            .returning(|_| Ok("sig".into()));
        long_chain
            .expect_confirm_signature()
            .returning(|_, _| Ok(true));

        let mut short_chain = MockShortChain::new();
        short_chain.expect_health_check().returning(|| true);
        short_chain
            .expect_get_native_balance()
            .returning(|| Ok(dec!(0.05)));
        short_chain
            .expect_get_token_balance()
            .returning(|_| Ok(dec!(1000)));

        let mut key = MockKeyService::new();
        key.expect_sign_transaction().returning(|tx| Ok(tx.to_vec()));

        let long_venue: Arc<dyn LongVenue> = Arc::new(long_venue);
        let perp: Arc<dyn PerpVenue> = Arc::new(perp);
        let long_chain: Arc<dyn LongChain> = Arc::new(long_chain);
        let short_chain = Arc::new(short_chain);
        let market_data = Arc::new(LendMarketData::new(long_venue.clone()));
        let consensus = Arc::new(PriceConsensus::new(long_venue.clone(), perp.clone()));
        let events = Arc::new(CallbackRegistry::new());
        let pause = Arc::new(PauseController::new("test-key", true));
        let config = test_config();

        let manager = Arc::new(PositionManager::new(
            "default",
            long_venue.clone(),
            perp.clone(),
            long_chain.clone(),
            Arc::new(key),
            consensus.clone(),
            store.clone(),
            events.clone(),
            ManagerConfig {
                short_open_attempts: 2,
                short_retry_interval: Duration::from_millis(1),
                ..Default::default()
            },
        ));

        let sources = ObservationSources {
            perp: perp.clone(),
            long_venue: long_venue.clone(),
            long_chain: long_chain.clone(),
            short_chain: short_chain.clone(),
            market_data: market_data.clone(),
            depeg_flags: Arc::new(DepegFlags::new()),
        };

        Bot::new(BotDeps {
            detector: OpportunityDetector::new(perp.clone(), market_data.clone(), &config.risk),
            preflight: PreflightChecker::new(
                long_chain,
                short_chain,
                perp,
                long_venue,
                market_data,
                consensus,
                "0xusdc",
            ),
            sizer: PositionSizer::new(
                config.sizing.clone(),
                config.risk.default_leverage,
                config.risk.max_leverage,
            ),
            manager,
            sources,
            pause,
            events,
            risk: RiskEngine::new(config.risk.clone()),
            store,
            user_id: "default".into(),
            config,
        })
    }

    #[tokio::test]
    async fn test_recover_state_loads_open_only() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let mut open = position(Asset::Sol);
        open.user_id = "default".into();
        let mut closed = position(Asset::JitoSol);
        closed.user_id = "default".into();
        store.save_position(&open).unwrap();
        store.save_position(&closed).unwrap();
        closed.mark_closed(ExitReason::Manual);
        store.archive_position(&closed, Decimal::ZERO).unwrap();

        let bot = trading_bot(store);
        let count = bot.recover_state().unwrap();

        assert_eq!(count, 1);
        let positions = bot.open_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].position_id, open.position_id);
        assert_eq!(positions[0].status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_scan_cycle_opens_position() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let bot = trading_bot(store.clone());

        bot.scan_cycle().await.unwrap();

        let stats = bot.stats();
        assert_eq!(stats.positions_opened, 1);
        assert_eq!(bot.open_positions().len(), 1);
        assert_eq!(store.count_open_positions().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_cycle_skips_when_paused() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let bot = trading_bot(store.clone());
        bot.pause("test-key", "maintenance", PauseScope::Entry).unwrap();

        bot.scan_cycle().await.unwrap();

        assert_eq!(bot.stats().positions_opened, 0);
        assert_eq!(store.count_open_positions().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scan_cycle_respects_concurrency_cap() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        // Five open positions across tenants already.
        for i in 0..5 {
            let mut pos = position(Asset::Sol);
            pos.user_id = format!("tenant-{}", i);
            store.save_position(&pos).unwrap();
        }

        let bot = trading_bot(store.clone());
        bot.scan_cycle().await.unwrap();

        assert_eq!(bot.stats().positions_opened, 0);
        assert_eq!(store.count_open_positions().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_monitor_cycle_keeps_healthy_position() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let bot = trading_bot(store.clone());

        bot.scan_cycle().await.unwrap();
        assert_eq!(bot.open_positions().len(), 1);

        bot.monitor_cycle().await.unwrap();
        assert_eq!(bot.open_positions().len(), 1);
        assert_eq!(bot.stats().positions_closed, 0);
    }

    #[tokio::test]
    async fn test_monitor_cycle_closes_on_depeg() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let bot = trading_bot(store.clone());

        // LSTs outrank native SOL on staking yield, so the scan opens an
        // LST position; flagging its asset as depegged forces the exit.
        bot.scan_cycle().await.unwrap();
        let opened = bot.open_positions();
        let asset = opened[0].long_leg.asset;
        assert!(asset.is_lst());

        bot.sources.depeg_flags.set(asset);
        bot.monitor_cycle().await.unwrap();

        assert_eq!(bot.open_positions().len(), 0);
        assert_eq!(bot.stats().positions_closed, 1);
        assert_eq!(store.count_open_positions().unwrap(), 0);
        // Critical depeg tripped its breaker.
        let breakers = bot.pause.active_breakers();
        assert_eq!(breakers.len(), 1);
        assert_eq!(breakers[0].kind, crate::core::pause::BreakerKind::LstDepeg);
    }

    #[tokio::test]
    async fn test_kill_switch_pauses_without_closing() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let bot = trading_bot(store.clone());
        bot.scan_cycle().await.unwrap();
        assert_eq!(bot.open_positions().len(), 1);

        bot.handle_kill("ops drill");

        // Entries and exits are both paused, positions untouched.
        assert!(!bot.pause.can_execute(Operation::Entry));
        assert!(!bot.pause.can_execute(Operation::Exit));
        assert_eq!(bot.open_positions().len(), 1);
        assert_eq!(store.count_open_positions().unwrap(), 1);
        assert!(bot
            .pause
            .pause_reason()
            .unwrap()
            .starts_with("Kill switch:"));
    }

    #[tokio::test]
    async fn test_opportunity_callback_fires() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        let bot = trading_bot(store);
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        bot.events.add_opportunity(Arc::new(move |_| {
            seen_clone.store(true, Ordering::SeqCst);
        }));

        bot.scan_cycle().await.unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }
}
