//! Configuration management.
//!
//! Settings layer from `config.{toml,yaml}` and `BASIS__`-prefixed
//! environment variables; risk limits come from a separate `risk.yaml`.
//! Secrets resolve from the environment first, then from a per-secret file.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub solana: SolanaConfig,
    pub arbitrum: ArbitrumConfig,
    pub hyperliquid: HyperliquidConfig,
    pub lend: LendConfig,
    pub signer: SignerConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    /// Per-user exit overrides, keyed by user id.
    #[serde(default)]
    pub users: HashMap<String, UserRiskParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Monitor cadence in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Scan cadence in seconds.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    /// Entry gate across all tenants.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    /// Entry APY floor.
    #[serde(default = "default_min_opportunity_apy")]
    pub min_opportunity_apy: Decimal,
    #[serde(default = "default_true")]
    pub enable_auto_exit: bool,
    #[serde(default = "default_true")]
    pub enable_circuit_breakers: bool,
    /// Authorizes pause/resume/breaker operations.
    #[serde(default)]
    pub admin_api_key: String,
    #[serde(default = "default_kill_switch_path")]
    pub kill_switch_path: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub wallet: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArbitrumConfig {
    pub rpc_url: String,
    pub wallet: String,
    /// USDC contract used for bridge-shortfall checks.
    #[serde(default = "default_usdc_contract")]
    pub usdc_contract: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HyperliquidConfig {
    #[serde(default = "default_hyperliquid_url")]
    pub api_url: String,
    pub wallet: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LendConfig {
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    /// Minimum position size in USD.
    #[serde(default = "default_min_position_usd")]
    pub min_position_usd: Decimal,
    /// Fraction of the limiting balance deployed per entry.
    #[serde(default = "default_deployment_pct")]
    pub default_deployment_pct: Decimal,
    #[serde(default = "default_max_deployment_pct")]
    pub max_deployment_pct: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            min_position_usd: default_min_position_usd(),
            default_deployment_pct: default_deployment_pct(),
            max_deployment_pct: default_max_deployment_pct(),
        }
    }
}

/// Risk thresholds, overridable from `risk.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_min_health_factor")]
    pub min_health_factor: Decimal,
    #[serde(default = "default_emergency_health_factor")]
    pub emergency_health_factor: Decimal,
    #[serde(default = "default_critical_health_factor")]
    pub critical_health_factor: Decimal,
    #[serde(default = "default_margin_fraction_threshold")]
    pub margin_fraction_threshold: Decimal,
    #[serde(default = "default_leverage")]
    pub default_leverage: Decimal,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    #[serde(default)]
    pub funding: FundingLimits,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            min_health_factor: default_min_health_factor(),
            emergency_health_factor: default_emergency_health_factor(),
            critical_health_factor: default_critical_health_factor(),
            margin_fraction_threshold: default_margin_fraction_threshold(),
            default_leverage: default_leverage(),
            max_leverage: default_max_leverage(),
            funding: FundingLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundingLimits {
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    #[serde(default = "default_max_volatility")]
    pub max_volatility: Decimal,
}

impl Default for FundingLimits {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            max_volatility: default_max_volatility(),
        }
    }
}

/// Per-user exit configuration. All fractions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRiskParams {
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
    /// Exit when live carry APY drops below this floor.
    pub min_exit_carry_apy: Option<Decimal>,
}

// Default value functions

fn default_poll_interval() -> u64 {
    30
}

fn default_scan_interval() -> u64 {
    60
}

fn default_max_concurrent_positions() -> usize {
    5
}

fn default_min_opportunity_apy() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_true() -> bool {
    true
}

fn default_kill_switch_path() -> String {
    "/data/emergency.stop".to_string()
}

fn default_db_path() -> String {
    "data/state.db".to_string()
}

fn default_usdc_contract() -> String {
    "0xaf88d065e77c8cC2239327C5EDb3A432268e5831".to_string()
}

fn default_hyperliquid_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}

fn default_min_position_usd() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_deployment_pct() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_max_deployment_pct() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_min_health_factor() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_emergency_health_factor() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_critical_health_factor() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_margin_fraction_threshold() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_leverage() -> Decimal {
    Decimal::new(3, 0)
}

fn default_max_leverage() -> Decimal {
    Decimal::new(4, 0)
}

fn default_lookback_hours() -> u32 {
    168
}

fn default_max_volatility() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("BASIS"),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut cfg: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Risk limits live in their own file so operators can tune them
        // without touching venue settings.
        if let Ok(risk_file) = config::Config::builder()
            .add_source(config::File::with_name("risk"))
            .build()
        {
            cfg.risk = risk_file
                .try_deserialize()
                .context("Failed to deserialize risk.yaml")?;
        }

        // Secrets resolve from env / per-secret files last.
        if cfg.app.admin_api_key.is_empty() {
            cfg.app.admin_api_key = load_secret("ADMIN_API_KEY").unwrap_or_default();
        }
        if cfg.signer.api_key.is_empty() {
            cfg.signer.api_key = load_secret("SIGNER_API_KEY").unwrap_or_default();
        }
        if cfg.signer.api_secret.is_empty() {
            cfg.signer.api_secret = load_secret("SIGNER_API_SECRET").unwrap_or_default();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.sizing.default_deployment_pct > Decimal::ZERO
                && self.sizing.default_deployment_pct <= self.sizing.max_deployment_pct,
            "default_deployment_pct must be in (0, max_deployment_pct]"
        );

        anyhow::ensure!(
            self.sizing.max_deployment_pct <= Decimal::ONE,
            "max_deployment_pct must be at most 1"
        );

        anyhow::ensure!(
            self.risk.default_leverage >= Decimal::ONE
                && self.risk.default_leverage <= self.risk.max_leverage,
            "default_leverage must be >= 1 and <= max_leverage"
        );

        anyhow::ensure!(
            self.risk.critical_health_factor < self.risk.emergency_health_factor
                && self.risk.emergency_health_factor < self.risk.min_health_factor,
            "health factor thresholds must be strictly ordered"
        );

        anyhow::ensure!(
            self.risk.funding.max_volatility > Decimal::ZERO,
            "funding.max_volatility must be positive"
        );

        Ok(())
    }

    /// Exit parameters for a user, falling back to defaults.
    pub fn user_params(&self, user_id: &str) -> UserRiskParams {
        self.users.get(user_id).cloned().unwrap_or_default()
    }
}

/// Resolve a secret: `NAME` from the environment wins; otherwise the file
/// named by `NAME_FILE` is read and trimmed.
pub fn load_secret(name: &str) -> Option<String> {
    if let Ok(value) = std::env::var(name) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    let file_var = format!("{}_FILE", name);
    let path = std::env::var(file_var).ok()?;
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
