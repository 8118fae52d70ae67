//! Two-leg position lifecycle: open, close, delta, rebalance decision,
//! and emergency unwind.
//!
//! Ordering is strict: the long leg confirms before the short submits, and
//! the short closes before the long closes. Partial failures unwind once
//! and never thrash; a failed unwind marks the leg for operator attention.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::consensus::PriceConsensus;
use super::events::CallbackRegistry;
use super::fill_validator::{FillInfo, FillSide, FillValidator, Verdict};
use crate::model::{
    CombinedPosition, ExitReason, LongLeg, Opportunity, PositionReference, PositionStatus,
    ShortLeg, StateTransition, TxState,
};
use crate::store::StateStore;
use rust_decimal::RoundingStrategy;
use crate::venues::{
    KeyService, LongChain, LongOpenReceipt, LongOpenRequest, LongVenue, PerpOrder, PerpVenue,
    VenueError, VenueResult,
};

use super::sizer::PositionSize;

/// Aggressive IOC limit above mid for buys.
const AGGRESSIVE_BUY_MULTIPLIER: Decimal = dec!(1.02);
/// Aggressive IOC limit below mid for sells.
const AGGRESSIVE_SELL_MULTIPLIER: Decimal = dec!(0.98);
/// Estimated per-transaction gas on the long chain, in USD.
const ESTIMATED_GAS_LONG_USD: Decimal = dec!(0.05);
/// Estimated per-transaction gas on the short chain, in USD.
const ESTIMATED_GAS_SHORT_USD: Decimal = dec!(0.30);
/// Slippage assumed on a rebalance, 10 bps.
const REBALANCE_SLIPPAGE: Decimal = dec!(0.001);
/// Daily cost rate of carrying unhedged exposure.
const DAILY_DRIFT_RATE: Decimal = dec!(0.001);
/// Delta ratio beyond which a rebalance is worth considering.
const REBALANCE_DELTA_RATIO: Decimal = dec!(0.005);
/// Delta ratio that is outright critical.
const CRITICAL_DELTA_RATIO: Decimal = dec!(0.02);

/// Retry and timing knobs for the lifecycle.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub short_open_attempts: u32,
    pub short_retry_interval: Duration,
    /// Cumulative fill at or above this fraction of target counts as full.
    pub fill_tolerance: Decimal,
    /// Adverse mark move that aborts the short-open retry window.
    pub short_stop_loss_pct: Decimal,
    pub single_leg_exposure_timeout: Duration,
    pub confirm_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            short_open_attempts: 15,
            short_retry_interval: Duration::from_secs(2),
            fill_tolerance: dec!(0.999),
            short_stop_loss_pct: dec!(0.01),
            single_leg_exposure_timeout: Duration::from_secs(120),
            confirm_timeout: Duration::from_secs(60),
        }
    }
}

/// Which stage of the open sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStage {
    Pricing,
    LongOpen,
    Bridge,
    ShortOpen,
    Validation,
    Persist,
}

/// Result of an open attempt.
#[derive(Debug)]
pub struct OpenResult {
    pub success: bool,
    pub position: Option<CombinedPosition>,
    pub error: Option<String>,
    pub stage: Option<OpenStage>,
}

impl OpenResult {
    fn failed(stage: OpenStage, error: impl Into<String>) -> Self {
        Self {
            success: false,
            position: None,
            error: Some(error.into()),
            stage: Some(stage),
        }
    }
}

/// Which stage of the close sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStage {
    ShortClose,
    LongClose,
    Persist,
}

/// Result of a close attempt.
#[derive(Debug)]
pub struct CloseResult {
    pub success: bool,
    pub status: PositionStatus,
    pub error: Option<String>,
    pub stage: Option<CloseStage>,
}

/// Live delta between the two legs.
#[derive(Debug, Clone)]
pub struct DeltaInfo {
    pub long_value_usd: Decimal,
    pub short_value_usd: Decimal,
    pub delta_usd: Decimal,
    pub delta_ratio: Decimal,
    pub needs_rebalance: bool,
    pub critical: bool,
}

/// Rebalance decision. Execution is deliberately not wired up yet; only the
/// economics are reported.
#[derive(Debug, Clone)]
pub struct RebalanceResult {
    pub delta: DeltaInfo,
    pub drift_cost_daily_usd: Decimal,
    pub rebalance_cost_usd: Decimal,
    pub should_rebalance: bool,
    pub executed: bool,
}

/// Tracks one transaction's lifecycle for the state history.
struct TxTracker {
    state: TxState,
    history: Vec<StateTransition>,
}

impl TxTracker {
    fn new() -> Self {
        Self {
            state: TxState::Idle,
            history: Vec::new(),
        }
    }

    fn step(&mut self, to: TxState) {
        debug_assert!(self.state.can_transition_to(to));
        self.history.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }
}

struct ShortOpenOutcome {
    filled: Decimal,
    avg_price: Decimal,
    stop_loss_triggered: bool,
}

/// Orchestrates the two-leg lifecycle for one tenant.
pub struct PositionManager {
    user_id: String,
    long_venue: Arc<dyn LongVenue>,
    perp: Arc<dyn PerpVenue>,
    long_chain: Arc<dyn LongChain>,
    key: Arc<dyn KeyService>,
    consensus: Arc<PriceConsensus>,
    validator: FillValidator,
    store: Arc<StateStore>,
    events: Arc<CallbackRegistry>,
    config: ManagerConfig,
    /// One logical lock per position id: no concurrent open+close.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PositionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        long_venue: Arc<dyn LongVenue>,
        perp: Arc<dyn PerpVenue>,
        long_chain: Arc<dyn LongChain>,
        key: Arc<dyn KeyService>,
        consensus: Arc<PriceConsensus>,
        store: Arc<StateStore>,
        events: Arc<CallbackRegistry>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            long_venue,
            perp,
            long_chain,
            key,
            consensus,
            validator: FillValidator::default(),
            store,
            events,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ==================== Open ====================

    /// Open both legs in strict order: long confirmed first, then short.
    #[instrument(skip(self, opportunity, sizing), fields(user = %self.user_id, asset = %opportunity.asset))]
    pub async fn open_position(
        &self,
        opportunity: &Opportunity,
        sizing: &PositionSize,
        bridge_deposit: Option<Decimal>,
        position_id: Uuid,
    ) -> OpenResult {
        let lock = self.lock_for(position_id).await;
        let _guard = lock.lock().await;

        // 1. Reference prices before any capital moves.
        let reference = match self.consensus.check(opportunity.asset).await {
            Ok(result) => PositionReference::new(result.long_price, result.perp_price),
            Err(e) => return OpenResult::failed(OpenStage::Pricing, e.to_string()),
        };

        // 2. Long leg: build, sign, submit, confirm.
        let mut tracker = TxTracker::new();
        let (receipt, open_txid) =
            match self.open_long_leg(opportunity, sizing, &mut tracker).await {
                Ok(out) => out,
                Err(e) => {
                    warn!(error = %e, "long open failed; nothing to unwind");
                    return OpenResult::failed(OpenStage::LongOpen, e);
                }
            };

        // 3. Bridge deposit when preflight flagged a margin shortfall.
        if let Some(amount) = bridge_deposit {
            if let Err(e) = self.perp.spot_to_perp_transfer(amount).await {
                error!(error = %e, "bridge deposit failed; unwinding long leg");
                self.unwind_long(&receipt.position_handle).await;
                return OpenResult::failed(OpenStage::Bridge, e.to_string());
            }
        }

        // 4. Perp leverage, best-effort. A pre-existing setting may be fine.
        let coin = opportunity.asset.perp_coin();
        let leverage_u32 = sizing.leverage.round().to_u32().unwrap_or(1).max(1);
        if let Err(e) = self.perp.update_leverage(coin, leverage_u32, true).await {
            warn!(error = %e, "leverage update failed; continuing with existing setting");
        }

        // 5. Short leg with the retry window.
        let target_size = match self.perp.snapshot(coin).await {
            Ok(snapshot) => truncate_size(
                sizing.position_size_usd / snapshot.mid_price,
                snapshot.sz_decimals,
            ),
            Err(e) => {
                self.unwind_long(&receipt.position_handle).await;
                return OpenResult::failed(OpenStage::ShortOpen, e.to_string());
            }
        };

        let outcome = match self.open_short_with_retry(coin, target_size).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "short open errored; unwinding long leg");
                self.unwind_long(&receipt.position_handle).await;
                return OpenResult::failed(OpenStage::ShortOpen, e.to_string());
            }
        };

        if outcome.filled == Decimal::ZERO {
            let note = if outcome.stop_loss_triggered {
                "short open aborted by stop-loss during retry window"
            } else {
                "short open filled nothing in the retry window"
            };
            error!(note, "unwinding long leg");
            self.unwind_long(&receipt.position_handle).await;
            return OpenResult::failed(OpenStage::ShortOpen, note);
        }

        let fully_filled = outcome.filled >= target_size * self.config.fill_tolerance;

        // Assemble the combined position.
        let mut position = self.assemble_position(
            position_id,
            opportunity,
            sizing,
            &reference,
            &receipt,
            open_txid,
            &outcome,
        );
        position.partial_fill_warning = !fully_filled;
        position.transaction_state = tracker.state;
        position.state_history = tracker.history;
        if position.partial_fill_warning {
            warn!(
                filled = %outcome.filled,
                target = %target_size,
                "short leg filled partially; keeping position flagged"
            );
        }

        // 6. Validate fills; hard stop unwinds both legs.
        let validation = self.validator.validate(
            &FillInfo {
                side: FillSide::Long,
                size_usd: sizing.position_size_usd,
                filled_price: receipt.entry_price,
                expected_price: reference.long_entry_price,
            },
            &FillInfo {
                side: FillSide::Short,
                size_usd: sizing.position_size_usd,
                filled_price: outcome.avg_price,
                expected_price: reference.short_entry_price,
            },
            opportunity,
        );

        if validation.verdict == Verdict::HardStop {
            self.emergency_close_position(&position).await;
            let _ = self.store.log_action(
                "hard_stop_unwind",
                &json!({
                    "position_id": position.position_id.to_string(),
                    "user_id": self.user_id,
                    "apy_at_fills": validation.apy_at_fills.to_string(),
                    "max_deviation": validation.max_deviation.to_string(),
                }),
            );
            return OpenResult::failed(
                OpenStage::Validation,
                format!("hard stop: {}", validation.reasons.join("; ")),
            );
        }

        // 7. Persist and publish.
        let persisted = self.store.with_transaction(|tx| {
            StateStore::save_position_tx(tx, &position)?;
            StateStore::log_action_tx(
                tx,
                "position_opened",
                &json!({
                    "position_id": position.position_id.to_string(),
                    "user_id": position.user_id,
                    "asset": position.long_leg.asset.symbol(),
                    "protocol": position.long_leg.protocol.to_string(),
                    "size_usd": position.long_leg.position_size_usd.to_string(),
                    "partial_fill": position.partial_fill_warning,
                }),
            )
        });
        if let Err(e) = persisted {
            error!(error = %e, "failed to persist opened position");
            return OpenResult::failed(OpenStage::Persist, e.to_string());
        }

        self.events.emit_position_opened(&position);
        info!(
            position_id = %position.position_id,
            asset = %position.long_leg.asset,
            size = %position.long_leg.position_size_usd,
            "position opened"
        );

        OpenResult {
            success: true,
            position: Some(position),
            error: None,
            stage: None,
        }
    }

    async fn open_long_leg(
        &self,
        opportunity: &Opportunity,
        sizing: &PositionSize,
        tracker: &mut TxTracker,
    ) -> Result<(LongOpenReceipt, String), String> {
        let request = LongOpenRequest {
            asset: opportunity.asset,
            protocol: opportunity.selected_protocol,
            collateral_usd: sizing.per_leg_deployment_usd,
            leverage: sizing.leverage,
        };

        tracker.step(TxState::Building);
        let unsigned = self
            .long_venue
            .build_open(&request)
            .await
            .map_err(|e| fail(tracker, format!("build failed: {}", e)))?;
        tracker.step(TxState::Built);

        tracker.step(TxState::Signing);
        let signed = self
            .key
            .sign_transaction(&unsigned.tx_bytes)
            .await
            .map_err(|e| fail(tracker, format!("signing failed: {}", e)))?;
        tracker.step(TxState::Signed);

        tracker.step(TxState::Submitting);
        let txid = self
            .long_chain
            .send_raw_transaction(&signed)
            .await
            .map_err(|e| fail(tracker, format!("submit failed: {}", e)))?;
        tracker.step(TxState::Submitted);

        match self
            .long_chain
            .confirm_signature(&txid, self.config.confirm_timeout)
            .await
        {
            Ok(true) => tracker.step(TxState::Confirmed),
            Ok(false) => return Err(fail(tracker, format!("confirmation timed out: {}", txid))),
            Err(e) => return Err(fail(tracker, format!("confirmation failed: {}", e))),
        }

        let receipt = self
            .long_venue
            .confirm_open(&unsigned.intent_id, &txid)
            .await
            .map_err(|e| format!("confirmed on chain but receipt unavailable: {}", e))?;

        info!(
            handle = %receipt.position_handle,
            entry_price = %receipt.entry_price,
            %txid,
            "long leg confirmed"
        );
        Ok((receipt, txid))
    }

    /// IOC at an aggressive limit, retried over the window. Accepts partial
    /// fills; aborts and reduces if the mark runs away against the short.
    async fn open_short_with_retry(
        &self,
        coin: &str,
        target_size: Decimal,
    ) -> VenueResult<ShortOpenOutcome> {
        let start_snapshot = self.perp.snapshot(coin).await?;
        let mark_start = start_snapshot.mark_price;
        let sz_decimals = start_snapshot.sz_decimals;

        let mut filled = Decimal::ZERO;
        let mut notional = Decimal::ZERO;

        for attempt in 1..=self.config.short_open_attempts {
            let snapshot = self.perp.snapshot(coin).await?;

            // Stop-loss: the mark moved against the short since retries
            // began. Cancel the remainder and flatten whatever filled.
            if snapshot.mark_price >= mark_start * (Decimal::ONE + self.config.short_stop_loss_pct)
            {
                warn!(
                    mark_start = %mark_start,
                    mark_now = %snapshot.mark_price,
                    %filled,
                    "stop-loss during short open; abandoning remainder"
                );
                if filled > Decimal::ZERO {
                    self.reduce_short_once(coin, filled, &snapshot).await;
                }
                return Ok(ShortOpenOutcome {
                    filled: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                    stop_loss_triggered: true,
                });
            }

            let remaining = truncate_size(target_size - filled, sz_decimals);
            if remaining <= Decimal::ZERO {
                break;
            }

            let order = PerpOrder {
                coin: coin.to_string(),
                is_buy: false,
                size: remaining,
                limit_price: snapshot.mid_price * AGGRESSIVE_SELL_MULTIPLIER,
                ioc: true,
                reduce_only: false,
            };

            match self.perp.submit_order(&order).await {
                Ok(fill) if fill.filled_size > Decimal::ZERO => {
                    filled += fill.filled_size;
                    notional += fill.filled_size * fill.avg_price;
                    debug!(attempt, %filled, target = %target_size, "short partial fill");
                    if filled >= target_size * self.config.fill_tolerance {
                        break;
                    }
                }
                Ok(_) => {
                    debug!(attempt, "short IOC matched nothing");
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "short order transient failure");
                }
                Err(e) => return Err(e),
            }

            if attempt < self.config.short_open_attempts {
                tokio::time::sleep(self.config.short_retry_interval).await;
            }
        }

        Ok(ShortOpenOutcome {
            filled,
            avg_price: ratio_or_zero(notional, filled),
            stop_loss_triggered: false,
        })
    }

    /// Single best-effort reduce-only order; used by stop-loss and
    /// emergency paths.
    async fn reduce_short_once(
        &self,
        coin: &str,
        size: Decimal,
        snapshot: &crate::venues::PerpMarketSnapshot,
    ) {
        let order = PerpOrder {
            coin: coin.to_string(),
            is_buy: true,
            size,
            limit_price: snapshot.mid_price * AGGRESSIVE_BUY_MULTIPLIER,
            ioc: true,
            reduce_only: true,
        };
        if let Err(e) = self.perp.submit_order(&order).await {
            error!(error = %e, %size, "reduce-only close failed; short exposure remains");
        }
    }

    /// Close the long once; a failure marks the leg for the operator.
    async fn unwind_long(&self, position_handle: &str) {
        match self.close_long_leg(position_handle).await {
            Ok(txid) => info!(%txid, "long leg unwound"),
            Err(e) => {
                error!(
                    handle = position_handle,
                    error = %e,
                    "long unwind failed; leg needs operator attention"
                );
                let _ = self.store.log_action(
                    "long_unwind_failed",
                    &json!({
                        "user_id": self.user_id,
                        "position_handle": position_handle,
                        "error": e,
                    }),
                );
            }
        }
    }

    async fn close_long_leg(&self, position_handle: &str) -> Result<String, String> {
        let unsigned = self
            .long_venue
            .build_close(position_handle)
            .await
            .map_err(|e| format!("close build failed: {}", e))?;
        let signed = self
            .key
            .sign_transaction(&unsigned.tx_bytes)
            .await
            .map_err(|e| format!("close signing failed: {}", e))?;
        let txid = self
            .long_chain
            .send_raw_transaction(&signed)
            .await
            .map_err(|e| format!("close submit failed: {}", e))?;
        match self
            .long_chain
            .confirm_signature(&txid, self.config.confirm_timeout)
            .await
        {
            Ok(true) => Ok(txid),
            Ok(false) => Err(format!("close confirmation timed out: {}", txid)),
            Err(e) => Err(format!("close confirmation failed: {}", e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_position(
        &self,
        position_id: Uuid,
        opportunity: &Opportunity,
        sizing: &PositionSize,
        reference: &PositionReference,
        receipt: &LongOpenReceipt,
        open_txid: String,
        outcome: &ShortOpenOutcome,
    ) -> CombinedPosition {
        let now = Utc::now();
        let long_leg = LongLeg {
            position_handle: receipt.position_handle.clone(),
            intent_id: receipt.intent_id.clone(),
            asset: opportunity.asset,
            protocol: opportunity.selected_protocol,
            collateral_usd: receipt.collateral_usd,
            position_size_usd: sizing.position_size_usd,
            leverage: sizing.leverage,
            base_token_qty: receipt.base_token_qty,
            quote_token_borrowed: receipt.borrowed_usd,
            entry_price_base: receipt.entry_price,
            entry_price_quote: Decimal::ONE,
            current_health_factor: Decimal::ONE,
            current_price_base: receipt.entry_price,
            opened_at: now,
            last_update: now,
            open_txid: Some(open_txid),
            close_txid: None,
        };

        let short_leg = ShortLeg {
            coin: opportunity.asset.perp_coin().to_string(),
            size_base: -outcome.filled,
            entry_price: outcome.avg_price,
            leverage: sizing.leverage,
            margin_used: sizing.per_leg_deployment_usd,
            margin_fraction: ratio_or_zero(
                sizing.per_leg_deployment_usd,
                outcome.filled * outcome.avg_price,
            ),
            account_value: sizing.per_leg_deployment_usd,
            cum_funding: Decimal::ZERO,
            mark_price: outcome.avg_price,
            liquidation_price: None,
            opened_at: now,
            last_update: now,
        };

        CombinedPosition::new(
            position_id,
            self.user_id.clone(),
            long_leg,
            short_leg,
            reference.clone(),
            opportunity.id,
        )
    }

    // ==================== Close ====================

    /// Close both legs in reverse order: short first, then long.
    #[instrument(skip(self, position), fields(position_id = %position.position_id, user = %self.user_id))]
    pub async fn close_position(
        &self,
        position: &mut CombinedPosition,
        reason: ExitReason,
    ) -> CloseResult {
        let lock = self.lock_for(position.position_id).await;
        let _guard = lock.lock().await;

        position.status = PositionStatus::Closing;
        position.exit_reason = Some(reason);
        position.updated_at = Utc::now();
        if let Err(e) = self.store.save_position(position) {
            warn!(error = %e, "failed to persist closing status; continuing");
        }

        let exposure_timer = tokio::time::Instant::now();

        // Short first: reduces perp liquidation risk while the long unwinds.
        let short_result = self.close_short_with_retry(position).await;
        let short_ok = match &short_result {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "short close failed; proceeding to long close regardless");
                false
            }
        };

        let long_result = self.close_long_leg(&position.long_leg.position_handle).await;
        let long_ok = match &long_result {
            Ok(txid) => {
                position.long_leg.close_txid = Some(txid.clone());
                true
            }
            Err(e) => {
                error!(error = %e, "long close failed");
                false
            }
        };

        match (short_ok, long_ok) {
            (true, true) => {
                position.mark_closed(reason);
                let pnl = position.net_funding_usd() + position.short_leg.cum_funding;
                let persisted = self.store.with_transaction(|tx| {
                    StateStore::archive_position_tx(tx, position, pnl)?;
                    StateStore::log_action_tx(
                        tx,
                        "position_closed",
                        &json!({
                            "position_id": position.position_id.to_string(),
                            "user_id": position.user_id,
                            "reason": reason.to_string(),
                            "pnl_usd": pnl.to_string(),
                        }),
                    )
                });
                if let Err(e) = persisted {
                    error!(error = %e, "failed to archive closed position");
                    return CloseResult {
                        success: false,
                        status: position.status,
                        error: Some(e.to_string()),
                        stage: Some(CloseStage::Persist),
                    };
                }

                self.events.emit_position_closed(position, reason);
                info!(reason = %reason, "position closed");
                CloseResult {
                    success: true,
                    status: PositionStatus::Closed,
                    error: None,
                    stage: None,
                }
            }
            (false, false) => {
                position.status = PositionStatus::Stuck;
                position.updated_at = Utc::now();
                let _ = self.store.save_position(position);
                error!("both legs failed to close; position marked stuck");
                CloseResult {
                    success: false,
                    status: PositionStatus::Stuck,
                    error: Some("both legs failed to close".into()),
                    stage: Some(CloseStage::ShortClose),
                }
            }
            (short_ok, _) => {
                // One leg closed: record it and surface the other.
                position.updated_at = Utc::now();
                let _ = self.store.save_position(position);

                if exposure_timer.elapsed() > self.config.single_leg_exposure_timeout {
                    error!(
                        elapsed_secs = exposure_timer.elapsed().as_secs(),
                        "unhedged leg exposed past the single-leg deadline"
                    );
                }
                let (stage, err) = if short_ok {
                    (CloseStage::LongClose, long_result.err())
                } else {
                    (CloseStage::ShortClose, short_result.err().map(|e| e.to_string()))
                };
                CloseResult {
                    success: false,
                    status: PositionStatus::Closing,
                    error: err,
                    stage: Some(stage),
                }
            }
        }
    }

    async fn close_short_with_retry(&self, position: &CombinedPosition) -> VenueResult<()> {
        let coin = &position.short_leg.coin;
        let mut remaining = position.short_leg.size_base.abs();
        if remaining == Decimal::ZERO {
            return Ok(());
        }

        for attempt in 1..=self.config.short_open_attempts {
            let snapshot = self.perp.snapshot(coin).await?;
            let min_lot = Decimal::new(1, snapshot.sz_decimals as u32);
            let size = truncate_size(remaining, snapshot.sz_decimals).max(min_lot);

            let order = PerpOrder {
                coin: coin.clone(),
                is_buy: true,
                size,
                limit_price: snapshot.mid_price * AGGRESSIVE_BUY_MULTIPLIER,
                ioc: true,
                reduce_only: true,
            };

            match self.perp.submit_order(&order).await {
                Ok(fill) => {
                    remaining -= fill.filled_size;
                    if remaining <= position.short_leg.size_base.abs()
                        * (Decimal::ONE - self.config.fill_tolerance)
                    {
                        return Ok(());
                    }
                    debug!(attempt, %remaining, "short close partial");
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "short close transient failure");
                }
                Err(e) => return Err(e),
            }

            if attempt < self.config.short_open_attempts {
                tokio::time::sleep(self.config.short_retry_interval).await;
            }
        }

        Err(VenueError::Rejected(format!(
            "short close incomplete: {} remaining",
            remaining
        )))
    }

    // ==================== Emergency close ====================

    /// Best-effort parallel close of both legs. Failures are logged, never
    /// retried; used when validation demands leaving nothing half-open.
    pub async fn emergency_close_position(&self, position: &CombinedPosition) {
        warn!(
            position_id = %position.position_id,
            "emergency close: attempting both legs in parallel"
        );

        let short = async {
            match self.perp.snapshot(&position.short_leg.coin).await {
                Ok(snapshot) => {
                    let size = position.short_leg.size_base.abs();
                    if size > Decimal::ZERO {
                        self.reduce_short_once(&position.short_leg.coin, size, &snapshot)
                            .await;
                    }
                }
                Err(e) => error!(error = %e, "emergency short close: no snapshot"),
            }
        };

        let long = async {
            if let Err(e) = self.close_long_leg(&position.long_leg.position_handle).await {
                error!(error = %e, "emergency long close failed");
            }
        };

        tokio::join!(short, long);
    }

    // ==================== Delta & rebalance ====================

    /// Live delta between the legs, with LST appreciation excluded.
    pub async fn position_delta(&self, position: &CombinedPosition) -> VenueResult<DeltaInfo> {
        let state = self
            .long_venue
            .position_state(&position.long_leg.position_handle)
            .await?;
        let snapshot = self.perp.snapshot(&position.short_leg.coin).await?;

        let long_value = state.base_token_qty * state.price_base;
        let short_value = position.short_leg.size_base.abs() * snapshot.mark_price;

        let mut delta = long_value - short_value;
        if position.long_leg.asset.is_lst() {
            let entry_value =
                position.long_leg.base_token_qty * position.long_leg.entry_price_base;
            delta -= long_value - entry_value;
        }

        let ratio = ratio_or_zero(delta, position.long_leg.position_size_usd);
        Ok(DeltaInfo {
            long_value_usd: long_value,
            short_value_usd: short_value,
            delta_usd: delta,
            delta_ratio: ratio,
            needs_rebalance: ratio.abs() > REBALANCE_DELTA_RATIO,
            critical: ratio.abs() > CRITICAL_DELTA_RATIO,
        })
    }

    /// Decide whether rebalancing pays for itself. Execution primitives are
    /// intentionally stubbed.
    pub async fn rebalance_if_needed(
        &self,
        position: &CombinedPosition,
    ) -> VenueResult<RebalanceResult> {
        let delta = self.position_delta(position).await?;

        let drift_cost_daily = delta.delta_usd.abs() * DAILY_DRIFT_RATE;
        let rebalance_cost = ESTIMATED_GAS_LONG_USD
            + ESTIMATED_GAS_SHORT_USD
            + delta.delta_usd.abs() * REBALANCE_SLIPPAGE;
        let should = delta.needs_rebalance && drift_cost_daily > rebalance_cost;

        if should {
            info!(
                delta_usd = %delta.delta_usd,
                drift_cost = %drift_cost_daily,
                rebalance_cost = %rebalance_cost,
                "rebalance economical; execution not yet wired"
            );
        }

        Ok(RebalanceResult {
            delta,
            drift_cost_daily_usd: drift_cost_daily,
            rebalance_cost_usd: rebalance_cost,
            should_rebalance: should,
            executed: false,
        })
    }
}

/// Truncate an order size to the venue's size precision; fractional lots
/// are rejected by the book.
fn truncate_size(size: Decimal, sz_decimals: u8) -> Decimal {
    size.round_dp_with_strategy(sz_decimals as u32, RoundingStrategy::ToZero)
}

/// Ratio of two quantities; an empty denominator yields zero.
fn ratio_or_zero(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        return Decimal::ZERO;
    }
    numerator / denominator
}

fn fail(tracker: &mut TxTracker, message: String) -> String {
    tracker.step(TxState::Failed);
    message
}
