//! Polymarket Mirror
//!
//! Follows one trader's fills and mirrors them with conviction-aware sizing,
//! hedge balancing and slippage guards. Paper trading by default.

mod api;
mod cache;
mod db;
mod events;
mod models;
mod session;
mod trading;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{ClobClient, DataClient, ExchangeClient};
use crate::db::Database;
use crate::events::{BotEvent, EventBus};
use crate::session::{SessionController, SessionState};
use crate::trading::{CopyEngine, Credentials, Executor, MirrorConfig, PaperTrader, PositionLedger};

/// Polygon mainnet
const CHAIN_ID: u64 = 137;

/// Polymarket single-trader mirroring bot.
#[derive(Parser)]
#[command(name = "polymarket-mirror")]
#[command(about = "Mirror a Polymarket trader's fills", long_about = None)]
struct Cli {
    /// Trade journal database URL
    #[arg(short, long, env = "MIRROR_DATABASE_URL", default_value = "sqlite:./mirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a mirroring session (paper unless --live)
    Run(RunArgs),

    /// Show the effective configuration
    Config(RunArgs),

    /// Show recent copy decisions and sessions from the journal
    History {
        /// Number of copy trades to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Wallet address of the trader to mirror
    #[arg(short, long, env = "TARGET_TRADER_ADDRESS", default_value = "")]
    target: String,

    /// Activity polling interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    poll_ms: u64,

    /// Starting paper balance in USDC
    #[arg(long, env = "PAPER_BALANCE", default_value = "1000")]
    paper_balance: Decimal,

    /// Copy 100% of the target's notional (paper realism)
    #[arg(long)]
    full_mirror: bool,

    /// Simulate latency, partial fills and rejections in paper mode
    #[arg(long)]
    simulate_market: bool,

    /// Place real orders
    #[arg(long)]
    live: bool,

    /// Copy ratio for markets without a specific asset ratio
    #[arg(long, env = "COPY_RATIO")]
    copy_ratio: Option<Decimal>,

    /// Maximum order notional in USDC
    #[arg(long, env = "MAX_TRADE_AMOUNT")]
    max_trade: Option<Decimal>,

    #[command(flatten)]
    credentials: CredentialArgs,
}

#[derive(Args, Clone)]
struct CredentialArgs {
    #[arg(long, env = "POLYMARKET_PRIVATE_KEY", hide_env_values = true, default_value = "")]
    private_key: String,

    #[arg(long, env = "POLYMARKET_API_KEY", hide_env_values = true, default_value = "")]
    api_key: String,

    #[arg(long, env = "POLYMARKET_API_SECRET", hide_env_values = true, default_value = "")]
    api_secret: String,

    #[arg(long, env = "POLYMARKET_API_PASSPHRASE", hide_env_values = true, default_value = "")]
    api_passphrase: String,
}

impl RunArgs {
    fn to_config(&self) -> MirrorConfig {
        let mut config = MirrorConfig {
            target_wallet: self.target.trim().to_string(),
            dry_run: !self.live,
            credentials: Credentials {
                private_key: self.credentials.private_key.clone(),
                api_key: self.credentials.api_key.clone(),
                api_secret: self.credentials.api_secret.clone(),
                api_passphrase: self.credentials.api_passphrase.clone(),
            },
            ..MirrorConfig::default()
        };

        config.session.poll_interval = Duration::from_millis(self.poll_ms.max(100));
        config.paper.initial_balance = self.paper_balance;
        config.paper.simulate_market = self.simulate_market;
        config.sizing.full_mirror = self.full_mirror && !self.live;
        if let Some(ratio) = self.copy_ratio {
            config.sizing.default_ratio = ratio;
        }
        if let Some(max) = self.max_trade {
            config.sizing.max_trade_amount = max;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run(&cli.database, args.to_config()).await?,

        Commands::Config(args) => print_config(&args.to_config()),

        Commands::History { limit } => {
            let db = Database::new(&cli.database).await?;
            let trades = db.recent_copy_trades(limit).await?;

            if trades.is_empty() {
                println!("No copy decisions recorded yet. Use 'polymarket-mirror run' to start.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<32} {:<5} {:<14} {:>5} {:>8} {:>8} {:<10} {}",
                "DETECTED", "MARKET", "SIDE", "CLASS", "CONV", "SIZE", "PRICE", "STATUS", "REASON"
            );
            println!("{}", "-".repeat(130));
            for t in &trades {
                println!(
                    "{:<20} {:<32} {:<5} {:<14} {:>5} {:>8.2} {:>8} {:<10} {}",
                    truncate(&t.detected_at, 19),
                    truncate(&t.market_title, 30),
                    t.side,
                    t.classification,
                    t.conviction,
                    t.size,
                    t.fill_price.map(|p| format!("{:.3}", p)).unwrap_or_else(|| "-".to_string()),
                    t.status,
                    truncate(&t.reason, 40)
                );
            }

            println!("\n=== Totals ===");
            for (status, count) in db.copy_trade_counts().await? {
                println!("  {:<12} {}", status, count);
            }

            let sessions = db.recent_sessions(5).await?;
            if !sessions.is_empty() {
                println!("\n=== Recent Sessions ===");
                for s in &sessions {
                    println!(
                        "  #{:<4} {} {} -> {} | detected {} copied {} skipped {} failed {}{}",
                        s.id,
                        if s.paper { "PAPER" } else { "LIVE " },
                        truncate(&s.started_at, 19),
                        s.stopped_at.as_deref().map(|t| truncate(t, 19)).unwrap_or_else(|| "running".to_string()),
                        s.detected,
                        s.copied,
                        s.skipped,
                        s.failed,
                        s.error_message
                            .as_deref()
                            .map(|e| format!(" ({})", e))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Wire the pipeline together and run until Ctrl+C.
/// Resolves once the session reports Stopped on its own.
async fn wait_for_stop(events: &mut broadcast::Receiver<BotEvent>) {
    loop {
        match events.recv().await {
            Ok(BotEvent::BotStateChanged {
                state: SessionState::Stopped,
                ..
            }) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn run(database_url: &str, config: MirrorConfig) -> Result<()> {
    config.validate()?;

    let journal = Arc::new(Database::new(database_url).await?);
    let data = Arc::new(DataClient::new()?);

    let executor = if config.dry_run {
        let exchange: Arc<dyn ExchangeClient> = Arc::new(ClobClient::read_only()?);
        Executor::paper(
            exchange,
            config.execution.clone(),
            config.slippage.limit_buffer,
            PaperTrader::new(config.paper.clone()),
        )
    } else {
        let client = ClobClient::new(config.credentials.clone(), CHAIN_ID)
            .context("Failed to initialize CLOB client")?;
        info!(address = ?client.address(), "CLOB client initialized");
        Executor::live(Arc::new(client), config.execution.clone(), config.slippage.limit_buffer)
    };

    let events = EventBus::default();
    let ledger = Arc::new(RwLock::new(PositionLedger::new()));
    let engine = Arc::new(
        CopyEngine::new(config.clone(), ledger, executor, events.clone())
            .with_positions(data.clone())
            .with_journal(journal.clone()),
    );
    let session = SessionController::new(engine.clone(), data, config.clone(), events.clone())
        .with_journal(journal);

    // Structured event feed for log consumers
    let mut feed = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = feed.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                debug!(kind = event.kind(), "{}", json);
            }
        }
    });

    println!("\n=== Polymarket Mirror ===");
    println!("Target:        {}", config.target_wallet);
    println!("Mode:          {}", if config.dry_run { "PAPER (no real trades)" } else { "LIVE TRADING" });
    if config.dry_run {
        println!("Paper balance: ${}", config.paper.initial_balance);
    }
    println!("Poll interval: {}ms", config.session.poll_interval.as_millis());
    println!("\nPress Ctrl+C to stop (twice to force).\n");

    let mut lifecycle = events.subscribe();
    session.start().await?;

    let crashed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            false
        }
        _ = wait_for_stop(&mut lifecycle) => true,
    };

    let stats = if crashed {
        error!("Session ended unexpectedly");
        session.stats().await
    } else {
        tokio::select! {
            stopped = session.stop() => stopped?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Second interrupt, killing session");
                session.kill().await
            }
        }
    };

    println!("{}", stats);
    if let Some(paper) = engine.paper_stats().await {
        println!("{}", paper);
    }
    println!("{}", engine.slippage_stats().await);

    Ok(())
}

fn print_config(config: &MirrorConfig) {
    let pct = |d: Decimal| d * dec!(100);

    println!("\n=== Mirror Configuration ===\n");
    println!("Target:               {}", if config.target_wallet.is_empty() { "(not set)" } else { config.target_wallet.as_str() });
    println!("Mode:                 {}", if config.dry_run { "paper" } else { "live" });
    println!("Credentials:          {:?}", config.credentials);

    let s = &config.sizing;
    println!("\nSizing:");
    println!("  BTC / ETH / SOL:      {}% / {}% / {}%", pct(s.btc_ratio), pct(s.eth_ratio), pct(s.sol_ratio));
    println!("  Default Ratio:        {}%", pct(s.default_ratio));
    println!("  Trade Size:           ${} - ${}", s.min_trade_amount, s.max_trade_amount);
    println!("  Conviction Sizing:    {}", s.conviction_sizing);
    println!("  Max Time Multiplier:  {}x", s.max_time_multiplier);
    println!("  Full Mirror:          {}", s.full_mirror);

    let f = &config.filters;
    println!("\nFilters:");
    println!("  Price Range:          {} - {}", f.min_price, f.max_price);
    println!("  Min Target Notional:  ${}", f.min_target_notional);

    let h = &config.hedge;
    println!("\nHedging:");
    println!("  Target Hedge Ratio:   {}%", pct(h.target_hedge_ratio));
    println!("  Min Dominance:        {}%", pct(h.min_dominance));
    println!("  Major Scale:          {}x first entry", h.major_scale_threshold);
    println!("  Position Cache TTL:   {}s", h.position_ttl.as_secs());

    let sl = &config.slippage;
    println!("\nSlippage:");
    if sl.use_absolute {
        println!("  Max Slippage:         {}c", pct(sl.max_absolute));
    } else {
        println!("  Max Slippage:         {}%", pct(sl.max_percent));
    }
    println!("  Resolution Threshold: {}", sl.resolution_threshold);
    println!("  Limit Buffer:         {}%", pct(sl.limit_buffer));

    let e = &config.execution;
    println!("\nExecution:");
    println!("  Stale Order Timeout:  {}s", e.stale_order_timeout.as_secs());
    println!("  Block Cooldown:       {}m", e.block_cooldown.as_secs() / 60);
    println!("  Min Order:            {} shares / ${}", e.min_shares, e.min_order_notional);
    println!("  Hedge Reserve:        {}x order size", e.hedge_reserve_multiplier);

    println!("\nSession:");
    println!("  Poll Interval:        {}ms", config.session.poll_interval.as_millis());
    println!("  Status Interval:      {}s", config.session.status_interval.as_secs());

    match config.validate() {
        Ok(()) => println!("\nConfiguration is valid."),
        Err(e) => println!("\nConfiguration problem: {}", e),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}
