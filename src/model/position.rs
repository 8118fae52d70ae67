//! Position state: the two legs, the combined position, and the
//! transaction state machine persisted with it.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::asset::{Asset, Protocol};
use super::decision::ExitReason;

/// Delta-neutrality band: |delta_ratio| at or below this is neutral.
pub const NEUTRAL_DELTA_RATIO: Decimal = dec!(0.005);

/// Default maximum acceptable fill deviation captured in the reference.
pub const MAX_FILL_DEVIATION: Decimal = dec!(0.005);

/// Transaction lifecycle states. Transitions only move forward; `Failed` is
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Idle,
    Building,
    Built,
    Signing,
    Signed,
    Submitting,
    Submitted,
    Confirmed,
    Failed,
}

impl TxState {
    fn order(&self) -> u8 {
        match self {
            TxState::Idle => 0,
            TxState::Building => 1,
            TxState::Built => 2,
            TxState::Signing => 3,
            TxState::Signed => 4,
            TxState::Submitting => 5,
            TxState::Submitted => 6,
            TxState::Confirmed => 7,
            TxState::Failed => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Confirmed | TxState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TxState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TxState::Failed => true,
            TxState::Confirmed => *self == TxState::Submitted,
            _ => next.order() == self.order() + 1,
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TxState,
    pub to: TxState,
    pub at: DateTime<Utc>,
}

/// The levered long on the Solana lending venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongLeg {
    /// Venue-assigned position handle (PDA-style address).
    pub position_handle: String,
    /// Intent id returned by the venue's transaction builder.
    pub intent_id: String,
    pub asset: Asset,
    pub protocol: Protocol,
    pub collateral_usd: Decimal,
    pub position_size_usd: Decimal,
    pub leverage: Decimal,
    pub base_token_qty: Decimal,
    pub quote_token_borrowed: Decimal,
    pub entry_price_base: Decimal,
    /// Quote is USDC; its entry price is 1 by construction.
    pub entry_price_quote: Decimal,
    pub current_health_factor: Decimal,
    pub current_price_base: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub open_txid: Option<String>,
    pub close_txid: Option<String>,
}

impl LongLeg {
    /// Current USD value of the base holding.
    pub fn current_value_usd(&self) -> Decimal {
        self.base_token_qty * self.current_price_base
    }

    /// Value at entry prices.
    pub fn entry_value_usd(&self) -> Decimal {
        self.base_token_qty * self.entry_price_base
    }
}

/// The perp short on the short venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortLeg {
    pub coin: String,
    /// Signed size in base units; negative for a short.
    pub size_base: Decimal,
    pub entry_price: Decimal,
    pub leverage: Decimal,
    pub margin_used: Decimal,
    pub margin_fraction: Decimal,
    pub account_value: Decimal,
    /// Cumulative funding since entry (positive = received).
    pub cum_funding: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl ShortLeg {
    /// Current absolute notional value.
    pub fn current_value_usd(&self) -> Decimal {
        self.size_base.abs() * self.mark_price
    }

    pub fn is_short(&self) -> bool {
        self.size_base < Decimal::ZERO
    }
}

/// Combined position status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Stuck,
}

/// Entry prices on both venues, captured before the first leg opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReference {
    pub long_entry_price: Decimal,
    pub short_entry_price: Decimal,
    pub max_fill_deviation: Decimal,
    pub captured_at: DateTime<Utc>,
}

impl PositionReference {
    pub fn new(long_entry_price: Decimal, short_entry_price: Decimal) -> Self {
        Self {
            long_entry_price,
            short_entry_price,
            max_fill_deviation: MAX_FILL_DEVIATION,
            captured_at: Utc::now(),
        }
    }
}

/// A two-leg delta-neutral position. Owned by the per-tenant position map in
/// memory and by the store on disk; the store is the source of truth across
/// restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedPosition {
    pub position_id: Uuid,
    pub user_id: String,
    pub long_leg: LongLeg,
    pub short_leg: ShortLeg,
    pub reference: PositionReference,
    pub opportunity_id: Uuid,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub exit_time: Option<DateTime<Utc>>,
    pub cum_funding_received: Decimal,
    pub cum_funding_paid: Decimal,
    /// Set when the short leg filled partially at open.
    pub partial_fill_warning: bool,
    pub transaction_state: TxState,
    /// Append-only transition history.
    pub state_history: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CombinedPosition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position_id: Uuid,
        user_id: impl Into<String>,
        long_leg: LongLeg,
        short_leg: ShortLeg,
        reference: PositionReference,
        opportunity_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            position_id,
            user_id: user_id.into(),
            long_leg,
            short_leg,
            reference,
            opportunity_id,
            status: PositionStatus::Open,
            exit_reason: None,
            exit_time: None,
            cum_funding_received: Decimal::ZERO,
            cum_funding_paid: Decimal::ZERO,
            partial_fill_warning: false,
            transaction_state: TxState::Idle,
            state_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a transaction-state transition, enforcing the forward-only
    /// machine. The history is append-only.
    pub fn transition(&mut self, to: TxState) -> Result<()> {
        if !self.transaction_state.can_transition_to(to) {
            bail!(
                "invalid transaction state transition {:?} -> {:?}",
                self.transaction_state,
                to
            );
        }
        self.state_history.push(StateTransition {
            from: self.transaction_state,
            to,
            at: Utc::now(),
        });
        self.transaction_state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Signed delta in USD between the two legs. When the long asset is an
    /// LST, the staking appreciation since entry is expected drift and is
    /// excluded from the hedge error.
    pub fn delta_usd(&self) -> Decimal {
        let long_value = self.long_leg.current_value_usd();
        let short_value = self.short_leg.current_value_usd();
        let mut delta = long_value - short_value;
        if self.long_leg.asset.is_lst() {
            delta -= long_value - self.long_leg.entry_value_usd();
        }
        delta
    }

    /// Delta as a fraction of the long position size.
    pub fn delta_ratio(&self) -> Decimal {
        if self.long_leg.position_size_usd == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.delta_usd() / self.long_leg.position_size_usd
    }

    pub fn is_neutral(&self) -> bool {
        self.delta_ratio().abs() <= NEUTRAL_DELTA_RATIO
    }

    /// Mark closed with the exit reason and timestamp.
    pub fn mark_closed(&mut self, reason: ExitReason) {
        self.status = PositionStatus::Closed;
        self.exit_reason = Some(reason);
        self.exit_time = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Net funding PnL so far.
    pub fn net_funding_usd(&self) -> Decimal {
        self.cum_funding_received - self.cum_funding_paid
    }
}
