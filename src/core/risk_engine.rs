//! Exit-trigger evaluation with priority ordering and proximity debouncing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::{RiskLimits, UserRiskParams};
use crate::model::{CombinedPosition, ExitDecision, ExitReason, RiskLevel};

/// A leg is "in proximity" when its metric is within 20% of its threshold.
pub const LIQUIDATION_PROXIMITY_PCT: Decimal = dec!(0.20);
/// Proximity must persist this long before it fires.
pub const LIQUIDATION_PROXIMITY_SECS: i64 = 20;
/// Cross-venue price deviation that forces an exit.
pub const MAX_PRICE_DEVIATION: Decimal = dec!(0.02);
/// Minutes per year, for the five-minute expected-loss test.
const MINUTES_PER_YEAR: Decimal = dec!(525600);

/// Result of the long-leg health check.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub level: RiskLevel,
    pub health_factor: Decimal,
    pub threshold: Decimal,
    pub in_proximity: bool,
    pub proximity_triggered: bool,
}

impl HealthCheck {
    pub fn should_close(&self) -> bool {
        self.level == RiskLevel::Critical || self.proximity_triggered
    }
}

/// Result of the short-leg margin check.
#[derive(Debug, Clone)]
pub struct MarginCheck {
    pub level: RiskLevel,
    pub margin_fraction: Decimal,
    pub threshold: Decimal,
    pub in_proximity: bool,
    pub proximity_triggered: bool,
}

impl MarginCheck {
    pub fn should_close(&self) -> bool {
        self.margin_fraction <= self.threshold || self.proximity_triggered
    }
}

/// Live observations fed into one evaluation.
#[derive(Debug, Clone, Default)]
pub struct RiskObservations {
    /// Name of the unreachable chain, when one is down.
    pub chain_outage: Option<String>,
    pub health_factor: Decimal,
    pub margin_fraction: Decimal,
    /// External LST monitor flag; critical depegs only.
    pub lst_depegged: bool,
    pub price_deviation: Option<Decimal>,
    /// Live total APY, recomputed by the caller each cycle.
    pub current_apy: Option<Decimal>,
    pub estimated_close_cost: Option<Decimal>,
    pub current_funding_annual: Option<Decimal>,
    pub predicted_funding_annual: Option<Decimal>,
    pub pnl_usd: Option<Decimal>,
}

/// Evaluates exit triggers for positions. The proximity table is keyed by
/// `(user_id, leg)` so tenants never interfere.
pub struct RiskEngine {
    limits: RiskLimits,
    proximity: HashMap<String, DateTime<Utc>>,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        info!(
            min_hf = %limits.min_health_factor,
            emergency_hf = %limits.emergency_health_factor,
            critical_hf = %limits.critical_health_factor,
            mf_threshold = %limits.margin_fraction_threshold,
            "risk engine initialized"
        );
        Self {
            limits,
            proximity: HashMap::new(),
        }
    }

    /// Long-leg health check against the configured thresholds.
    pub fn check_long_health(
        &mut self,
        user_id: &str,
        leg_id: &str,
        health_factor: Decimal,
    ) -> HealthCheck {
        self.check_long_health_at(user_id, leg_id, health_factor, Utc::now())
    }

    pub(crate) fn check_long_health_at(
        &mut self,
        user_id: &str,
        leg_id: &str,
        health_factor: Decimal,
        now: DateTime<Utc>,
    ) -> HealthCheck {
        let level = if health_factor <= self.limits.emergency_health_factor {
            RiskLevel::Critical
        } else if health_factor <= self.limits.min_health_factor {
            RiskLevel::Warning
        } else {
            RiskLevel::Normal
        };

        let proximity_band =
            self.limits.min_health_factor * (Decimal::ONE + LIQUIDATION_PROXIMITY_PCT);
        let in_proximity = health_factor <= proximity_band;
        let key = format!("{}:long:{}", user_id, leg_id);
        let proximity_triggered = self.track_proximity(&key, in_proximity, now);

        HealthCheck {
            level,
            health_factor,
            threshold: self.limits.min_health_factor,
            in_proximity,
            proximity_triggered,
        }
    }

    /// Short-leg margin check.
    pub fn check_short_margin(
        &mut self,
        user_id: &str,
        leg_id: &str,
        margin_fraction: Decimal,
    ) -> MarginCheck {
        self.check_short_margin_at(user_id, leg_id, margin_fraction, Utc::now())
    }

    pub(crate) fn check_short_margin_at(
        &mut self,
        user_id: &str,
        leg_id: &str,
        margin_fraction: Decimal,
        now: DateTime<Utc>,
    ) -> MarginCheck {
        let threshold = self.limits.margin_fraction_threshold;
        let level = if margin_fraction <= threshold * dec!(0.5) {
            RiskLevel::Critical
        } else if margin_fraction <= threshold {
            RiskLevel::Warning
        } else {
            RiskLevel::Normal
        };

        let proximity_band = threshold * (Decimal::ONE + LIQUIDATION_PROXIMITY_PCT);
        let in_proximity = margin_fraction <= proximity_band;
        let key = format!("{}:short:{}", user_id, leg_id);
        let proximity_triggered = self.track_proximity(&key, in_proximity, now);

        MarginCheck {
            level,
            margin_fraction,
            threshold,
            in_proximity,
            proximity_triggered,
        }
    }

    /// Drop proximity entries for a position (after close or rebalance).
    pub fn clear_proximity(&mut self, user_id: &str, leg_id: &str) {
        let long_key = format!("{}:long:{}", user_id, leg_id);
        let short_key = format!("{}:short:{}", user_id, leg_id);
        self.proximity.remove(&long_key);
        self.proximity.remove(&short_key);
    }

    fn track_proximity(&mut self, key: &str, in_proximity: bool, now: DateTime<Utc>) -> bool {
        if !in_proximity {
            self.proximity.remove(key);
            return false;
        }
        let start = *self.proximity.entry(key.to_string()).or_insert(now);
        (now - start).num_seconds() >= LIQUIDATION_PROXIMITY_SECS
    }

    /// Evaluate all exit triggers in priority order; the first match wins.
    pub fn evaluate(
        &mut self,
        position: &CombinedPosition,
        observations: &RiskObservations,
        user_params: &UserRiskParams,
    ) -> ExitDecision {
        self.evaluate_at(position, observations, user_params, Utc::now())
    }

    pub(crate) fn evaluate_at(
        &mut self,
        position: &CombinedPosition,
        obs: &RiskObservations,
        user_params: &UserRiskParams,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        let user_id = &position.user_id;

        // 1. Chain outage.
        if let Some(chain) = &obs.chain_outage {
            warn!(%chain, position = %position.position_id, "chain outage exit");
            return ExitDecision::exit(
                ExitReason::ChainOutage,
                RiskLevel::Critical,
                json!({"affected_chain": chain}),
            );
        }

        // 2. Long-leg health.
        let health = self.check_long_health_at(
            user_id,
            &position.long_leg.position_handle,
            obs.health_factor,
            now,
        );
        if health.should_close() {
            return ExitDecision::exit(
                ExitReason::HealthFactor,
                health.level.max(RiskLevel::Warning),
                json!({
                    "health_factor": health.health_factor.to_string(),
                    "threshold": health.threshold.to_string(),
                    "proximity_triggered": health.proximity_triggered,
                }),
            );
        }

        // 3. Short-leg margin.
        let margin = self.check_short_margin_at(
            user_id,
            &position.short_leg.coin,
            obs.margin_fraction,
            now,
        );
        if margin.should_close() {
            return ExitDecision::exit(
                ExitReason::MarginFraction,
                margin.level.max(RiskLevel::Warning),
                json!({
                    "margin_fraction": margin.margin_fraction.to_string(),
                    "threshold": margin.threshold.to_string(),
                    "proximity_triggered": margin.proximity_triggered,
                }),
            );
        }

        // 4. LST depeg.
        if obs.lst_depegged {
            return ExitDecision::exit(
                ExitReason::LstDepeg,
                RiskLevel::Critical,
                json!({"asset": position.long_leg.asset.symbol()}),
            );
        }

        // 5. Cross-venue price deviation.
        if let Some(deviation) = obs.price_deviation {
            if deviation > MAX_PRICE_DEVIATION {
                return ExitDecision::exit(
                    ExitReason::PriceDeviation,
                    RiskLevel::Critical,
                    json!({
                        "price_deviation": deviation.to_string(),
                        "threshold": MAX_PRICE_DEVIATION.to_string(),
                    }),
                );
            }
        }

        // 6. Negative APY, only when closing beats holding for five minutes.
        if let Some(apy) = obs.current_apy {
            if apy < Decimal::ZERO {
                let size = position.long_leg.position_size_usd;
                let five_min_loss = size * apy.abs() * dec!(5) / MINUTES_PER_YEAR;
                let close_cost = obs.estimated_close_cost.unwrap_or(Decimal::ZERO);
                if close_cost < five_min_loss {
                    return ExitDecision::exit(
                        ExitReason::NegativeApy,
                        RiskLevel::Warning,
                        json!({
                            "current_apy": apy.to_string(),
                            "estimated_close_cost": close_cost.to_string(),
                            "five_min_expected_loss": five_min_loss.to_string(),
                        }),
                    )
                    .with_costs(close_cost, five_min_loss);
                }
                debug!(
                    position = %position.position_id,
                    %close_cost, %five_min_loss,
                    "negative APY but closing costs more than holding"
                );
            }
        }

        // 7. Funding flip: shorts paid now, longs paid next period.
        if let (Some(current), Some(predicted)) =
            (obs.current_funding_annual, obs.predicted_funding_annual)
        {
            if current < Decimal::ZERO && predicted >= Decimal::ZERO {
                return ExitDecision::exit(
                    ExitReason::FundingFlip,
                    RiskLevel::Warning,
                    json!({
                        "current_funding": current.to_string(),
                        "predicted_funding": predicted.to_string(),
                    }),
                );
            }
        }

        // 8. Per-user stop-loss / take-profit; stop-loss dominates.
        if let Some(pnl) = obs.pnl_usd {
            let size = position.long_leg.position_size_usd;
            if size > Decimal::ZERO {
                let pnl_pct = pnl / size;
                if let Some(stop_loss) = user_params.stop_loss_pct {
                    if pnl_pct <= -stop_loss {
                        return ExitDecision::exit(
                            ExitReason::StopLoss,
                            RiskLevel::Warning,
                            json!({
                                "pnl_pct": pnl_pct.to_string(),
                                "stop_loss_pct": stop_loss.to_string(),
                            }),
                        );
                    }
                }
                if let Some(take_profit) = user_params.take_profit_pct {
                    if pnl_pct >= take_profit {
                        return ExitDecision::exit(
                            ExitReason::TargetProfit,
                            RiskLevel::Normal,
                            json!({
                                "pnl_pct": pnl_pct.to_string(),
                                "take_profit_pct": take_profit.to_string(),
                            }),
                        );
                    }
                }
            }
        }

        // 9. Per-user carry floor on the live funding yield.
        if let (Some(floor), Some(current)) =
            (user_params.min_exit_carry_apy, obs.current_funding_annual)
        {
            let carry = current.abs() * position.short_leg.leverage;
            if carry < floor {
                return ExitDecision::exit(
                    ExitReason::NegativeApy,
                    RiskLevel::Warning,
                    json!({
                        "carry_apy": carry.to_string(),
                        "min_exit_carry_apy": floor.to_string(),
                    }),
                );
            }
        }

        // Nothing fired: report the worse leg level as information.
        ExitDecision::hold(health.level.max(margin.level))
    }
}
