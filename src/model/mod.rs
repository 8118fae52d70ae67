//! Shared data model: assets, rates, opportunities, positions, decisions.

mod asset;
mod decision;
mod funding;
mod opportunity;
mod position;

pub use asset::{Asset, Protocol, USDC_MINT};
pub use decision::{ExitDecision, ExitReason, RiskLevel};
pub use funding::{FundingRate, OpportunityScore, VenueRates, CAPACITY_SAFETY_BUFFER};
pub use opportunity::{Opportunity, MAX_OPPORTUNITY_LEVERAGE, MIN_OPPORTUNITY_LEVERAGE};
pub use position::{
    CombinedPosition, LongLeg, PositionReference, PositionStatus, ShortLeg, StateTransition,
    TxState, MAX_FILL_DEVIATION, NEUTRAL_DELTA_RATIO,
};

#[cfg(test)]
pub(crate) use position::test_fixtures;
