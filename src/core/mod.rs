//! The trading control plane.

pub mod bot;
pub mod consensus;
pub mod detector;
pub mod events;
pub mod fill_validator;
pub mod kill_switch;
pub mod manager;
pub mod monitor;
pub mod pause;
pub mod preflight;
pub mod risk_engine;
pub mod sizer;

pub use bot::{Bot, BotDeps, BotStats};
pub use consensus::{ConsensusResult, DivergenceDirection, PriceConsensus};
pub use detector::OpportunityDetector;
pub use events::CallbackRegistry;
pub use fill_validator::{FillInfo, FillSide, FillValidator, ValidationResult, Verdict};
pub use kill_switch::KillSwitch;
pub use manager::{
    CloseResult, CloseStage, DeltaInfo, ManagerConfig, OpenResult, OpenStage, PositionManager,
    RebalanceResult,
};
pub use monitor::{
    breaker_for, observe_position, DepegFlags, ObservationSources, PositionMonitorService,
    UserContext, UserContextProvider,
};
pub use pause::{ActiveBreaker, BreakerKind, Operation, PauseController, PauseScope};
pub use preflight::{PreflightChecker, PreflightResult};
pub use risk_engine::{HealthCheck, MarginCheck, RiskEngine, RiskObservations};
pub use sizer::{PositionSize, PositionSizer, SizingResult};
