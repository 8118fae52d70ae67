//! Exit decisions produced by the risk engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a position is being exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    ChainOutage,
    HealthFactor,
    MarginFraction,
    LstDepeg,
    PriceDeviation,
    NegativeApy,
    FundingFlip,
    StopLoss,
    TargetProfit,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::ChainOutage => "CHAIN_OUTAGE",
            ExitReason::HealthFactor => "HEALTH_FACTOR",
            ExitReason::MarginFraction => "MARGIN_FRACTION",
            ExitReason::LstDepeg => "LST_DEPEG",
            ExitReason::PriceDeviation => "PRICE_DEVIATION",
            ExitReason::NegativeApy => "NEGATIVE_APY",
            ExitReason::FundingFlip => "FUNDING_FLIP",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TargetProfit => "TARGET_PROFIT",
            ExitReason::Manual => "MANUAL",
        };
        f.write_str(s)
    }
}

/// Risk severity. Ordered so the worse of two levels can be taken directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Normal,
    Warning,
    Critical,
}

/// The risk engine's verdict on a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDecision {
    pub should_exit: bool,
    pub reason: Option<ExitReason>,
    pub level: RiskLevel,
    pub details: serde_json::Value,
    pub decided_at: DateTime<Utc>,
    pub estimated_close_cost: Option<Decimal>,
    pub expected_loss_if_held: Option<Decimal>,
}

impl ExitDecision {
    pub fn exit(reason: ExitReason, level: RiskLevel, details: serde_json::Value) -> Self {
        Self {
            should_exit: true,
            reason: Some(reason),
            level,
            details,
            decided_at: Utc::now(),
            estimated_close_cost: None,
            expected_loss_if_held: None,
        }
    }

    pub fn hold(level: RiskLevel) -> Self {
        Self {
            should_exit: false,
            reason: None,
            level,
            details: serde_json::Value::Null,
            decided_at: Utc::now(),
            estimated_close_cost: None,
            expected_loss_if_held: None,
        }
    }

    pub fn with_costs(mut self, close_cost: Decimal, loss_if_held: Decimal) -> Self {
        self.estimated_close_cost = Some(close_cost);
        self.expected_loss_if_held = Some(loss_if_held);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Normal < RiskLevel::Warning);
        assert!(RiskLevel::Warning < RiskLevel::Critical);
        assert_eq!(
            RiskLevel::Warning.max(RiskLevel::Critical),
            RiskLevel::Critical
        );
    }

    #[test]
    fn test_exit_decision_constructors() {
        let d = ExitDecision::exit(
            ExitReason::HealthFactor,
            RiskLevel::Critical,
            serde_json::json!({"health_factor": "0.05"}),
        );
        assert!(d.should_exit);
        assert_eq!(d.reason, Some(ExitReason::HealthFactor));

        let h = ExitDecision::hold(RiskLevel::Warning);
        assert!(!h.should_exit);
        assert!(h.reason.is_none());
    }

    #[test]
    fn test_reason_display_matches_wire_format() {
        assert_eq!(ExitReason::ChainOutage.to_string(), "CHAIN_OUTAGE");
        assert_eq!(ExitReason::NegativeApy.to_string(), "NEGATIVE_APY");
    }
}
