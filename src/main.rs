//! Basis Harvester - main entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use basis_harvester::config::Config;
use basis_harvester::core::{
    kill_switch, Bot, BotDeps, CallbackRegistry, ObservationSources, OpportunityDetector,
    PauseController, PositionManager, PositionSizer, PreflightChecker, PriceConsensus, RiskEngine,
};
use basis_harvester::core::{DepegFlags, ManagerConfig};
use basis_harvester::store::StateStore;
use basis_harvester::venues::{
    ArbitrumRpc, HyperliquidClient, HyperliquidTrader, KeyService, LendClient, LendMarketData,
    LongChain, LongVenue, PerpVenue, RemoteKeyService, ShortChain, SolanaRpc,
};

/// Basis Harvester CLI
#[derive(Parser)]
#[command(name = "basis-harvester")]
#[command(version, about = "Delta-neutral SOL basis harvesting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show persisted engine state
    Status {
        /// Path to the SQLite database
        #[arg(short, long, default_value = "data/state.db")]
        db: String,

        /// Show per-position detail
        #[arg(short, long)]
        verbose: bool,
    },

    /// Manage the kill-switch sentinel
    Kill {
        #[command(subcommand)]
        action: KillAction,

        /// Sentinel path (defaults to the configured location)
        #[arg(short, long, default_value = "/data/emergency.stop")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum KillAction {
    /// Write the sentinel; the running engine pauses on its next poll
    Trigger {
        /// Reason recorded in the sentinel
        reason: String,
    },
    /// Show whether the sentinel is present
    Status,
    /// Remove the sentinel without triggering
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging()?;

    match cli.command {
        Some(Commands::Status { db, verbose }) => return show_status(&db, verbose),
        Some(Commands::Kill { action, path }) => return run_kill(action, &path),
        None => {}
    }

    info!(
        "basis-harvester v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load()?;
    let bot = build_bot(config)?;
    Arc::new(bot).run().await
}

/// Stdout logging with env-filter plus daily-rotated file logs.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily("logs", "basis-harvester.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

/// Wire every component from configuration.
fn build_bot(config: Config) -> Result<Bot> {
    let store = Arc::new(StateStore::new(&config.app.db_path)?);

    let key: Arc<dyn KeyService> = Arc::new(
        RemoteKeyService::new(
            &config.signer.url,
            &config.signer.api_key,
            &config.signer.api_secret,
        )
        .context("signer client")?,
    );

    let long_chain: Arc<dyn LongChain> = Arc::new(
        SolanaRpc::new(&config.solana.rpc_url, &config.solana.wallet).context("solana rpc")?,
    );
    let short_chain: Arc<dyn ShortChain> = Arc::new(
        ArbitrumRpc::new(&config.arbitrum.rpc_url, &config.arbitrum.wallet)
            .context("arbitrum rpc")?,
    );

    let hl_client = Arc::new(
        HyperliquidClient::with_base_url(&config.hyperliquid.api_url).context("perp client")?,
    );
    let perp: Arc<dyn PerpVenue> = Arc::new(
        HyperliquidTrader::new(hl_client, key.clone(), &config.hyperliquid.wallet)
            .context("perp trader")?,
    );

    let long_venue: Arc<dyn LongVenue> = Arc::new(
        LendClient::new(&config.lend.api_url, &config.solana.wallet).context("lend client")?,
    );
    let market_data = Arc::new(LendMarketData::new(long_venue.clone()));
    let consensus = Arc::new(PriceConsensus::new(long_venue.clone(), perp.clone()));

    let events = Arc::new(CallbackRegistry::new());
    let pause = Arc::new(PauseController::new(
        &config.app.admin_api_key,
        config.app.enable_circuit_breakers,
    ));

    let user_id = "default".to_string();
    let manager = Arc::new(PositionManager::new(
        user_id.clone(),
        long_venue.clone(),
        perp.clone(),
        long_chain.clone(),
        key,
        consensus.clone(),
        store.clone(),
        events.clone(),
        ManagerConfig::default(),
    ));

    let sources = ObservationSources {
        perp: perp.clone(),
        long_venue: long_venue.clone(),
        long_chain: long_chain.clone(),
        short_chain: short_chain.clone(),
        market_data: market_data.clone(),
        depeg_flags: Arc::new(DepegFlags::new()),
    };

    let detector = OpportunityDetector::new(perp.clone(), market_data.clone(), &config.risk);
    let preflight = PreflightChecker::new(
        long_chain,
        short_chain,
        perp,
        long_venue,
        market_data,
        consensus,
        &config.arbitrum.usdc_contract,
    );
    let sizer = PositionSizer::new(
        config.sizing.clone(),
        config.risk.default_leverage,
        config.risk.max_leverage,
    );
    let risk = RiskEngine::new(config.risk.clone());

    Ok(Bot::new(BotDeps {
        config,
        user_id,
        store,
        detector,
        preflight,
        sizer,
        manager,
        sources,
        pause,
        events,
        risk,
    }))
}

fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    let store = StateStore::new(db_path)?;

    let open = store.load_positions(None)?;
    println!("Open positions: {}", open.len());
    for position in &open {
        println!(
            "  {}  {}  {}  {:?}  hf={}  mf={}",
            position.position_id,
            position.user_id,
            position.long_leg.asset,
            position.status,
            position.long_leg.current_health_factor,
            position.short_leg.margin_fraction,
        );
        if verbose {
            println!(
                "    long: {} {} @ {} on {} (borrowed {})",
                position.long_leg.base_token_qty,
                position.long_leg.asset,
                position.long_leg.entry_price_base,
                position.long_leg.protocol,
                position.long_leg.quote_token_borrowed,
            );
            println!(
                "    short: {} {} @ {} (funding net {})",
                position.short_leg.size_base,
                position.short_leg.coin,
                position.short_leg.entry_price,
                position.net_funding_usd(),
            );
        }
    }

    let history = store.history(10)?;
    println!("\nRecent history ({} rows):", history.len());
    for row in history {
        println!(
            "  {}  {}  {}  {}  pnl={}  funding={}",
            row.id,
            row.user_id,
            row.asset,
            row.status,
            row.pnl_usd.unwrap_or_default(),
            row.funding_earned_usd.unwrap_or_default(),
        );
    }

    if verbose {
        let actions = store.recent_actions(20)?;
        println!("\nRecent actions:");
        for (timestamp, action_type, payload) in actions {
            println!("  {}  {}  {}", timestamp, action_type, payload);
        }
    }
    Ok(())
}

fn run_kill(action: KillAction, path: &std::path::Path) -> Result<()> {
    match action {
        KillAction::Trigger { reason } => {
            kill_switch::trigger(path, &reason)?;
            warn!(path = %path.display(), reason, "kill switch armed");
            println!("Kill switch armed at {}", path.display());
        }
        KillAction::Status => match kill_switch::status(path) {
            Some(body) => println!("ARMED: {}", body),
            None => println!("clear"),
        },
        KillAction::Clear => {
            if kill_switch::clear(path) {
                println!("Sentinel removed without triggering");
            } else {
                println!("No sentinel present");
            }
        }
    }
    Ok(())
}
