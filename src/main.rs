//! splitleg: bar-driven signal engine and split-order position manager.
//!
//! Detects entries from technical indicators, sizes them from account
//! risk, opens each entry as several broker orders with laddered
//! take-profits, then manages stops (trailing, breakeven, time exit)
//! until every leg is closed.

mod api;
mod backtest;
mod bot;
mod db;
mod error;
mod indicators;
mod metrics;
mod models;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{BrokerGateway, HttpGateway};
use crate::backtest::Backtester;
use crate::bot::Bot;
use crate::db::Database;
use crate::metrics::MetricsCalculator;
use crate::trading::TradingConfig;

/// Split-order trading engine CLI.
#[derive(Parser)]
#[command(name = "splitleg")]
#[command(about = "Signal engine and split-order position manager", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "splitleg.toml")]
    config: PathBuf,

    /// Database file path
    #[arg(short, long, default_value = "sqlite:./splitleg.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop against the terminal bridge
    Run {
        /// Bridge URL, overrides the configuration file
        #[arg(long, env = "SPLITLEG_BRIDGE_URL")]
        bridge_url: Option<String>,

        /// Bearer token for the bridge
        #[arg(long, env = "SPLITLEG_BRIDGE_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Validate the configuration and print the effective settings
    Check,

    /// Show guard state, open positions and trade statistics
    Status,

    /// Clear a drawdown halt; the running bot picks it up on its next tick
    ResetDrawdown,

    /// Replay CSV bars through the trading loop
    Backtest {
        /// Directory containing one <SYMBOL>.csv per configured symbol
        #[arg(short = 'D', long, default_value = "data")]
        data_dir: PathBuf,

        /// Starting balance
        #[arg(short, long, default_value = "10000")]
        balance: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { bridge_url, token } => {
            let mut config = load_config(&cli.config)?;
            if let Some(url) = bridge_url {
                config.gateway.base_url = url;
            }
            let config = Arc::new(config);

            let db = Database::new(&cli.database).await?;
            let gateway: Arc<dyn BrokerGateway> =
                Arc::new(HttpGateway::new(&config.gateway, token)?);

            info!(
                bridge = %config.gateway.base_url,
                symbols = ?config.symbols,
                timeframe = %config.timeframe,
                "Starting splitleg"
            );

            let mut bot = Bot::new(config.clone(), gateway, db);
            bot.initialize().await?;

            println!("\n=== splitleg ===");
            println!("Bridge:           {}", config.gateway.base_url);
            println!("Symbols:          {}", config.symbols.join(", "));
            println!("Timeframe:        {}", config.timeframe);
            println!("Polling interval: {}s", config.poll_interval_secs);
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }
        }

        Commands::Check => {
            let config = load_config(&cli.config)?;
            print_config(&config)?;
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            print_status(&db).await?;
        }

        Commands::ResetDrawdown => {
            let db = Database::new(&cli.database).await?;
            db.request_drawdown_reset().await?;
            println!("Drawdown reset requested; it applies on the bot's next tick.");
        }

        Commands::Backtest { data_dir, balance } => {
            let config = Arc::new(load_config(&cli.config)?);
            let balance = Decimal::try_from(balance).context("Invalid starting balance")?;

            println!("\n=== Backtest ===");
            println!("Symbols:  {}", config.symbols.join(", "));
            println!("Data:     {}", data_dir.display());
            println!("Balance:  {}", balance);

            let report = Backtester::new(config, balance).run_from_dir(&data_dir).await?;
            println!("{}", report);

            if !report.trades.is_empty() {
                println!("\n--- Legs by Close Reason ---");
                let mut by_reason: std::collections::BTreeMap<String, (usize, Decimal)> =
                    std::collections::BTreeMap::new();
                for trade in &report.trades {
                    let entry = by_reason
                        .entry(trade.reason.to_string())
                        .or_insert((0, Decimal::ZERO));
                    entry.0 += 1;
                    entry.1 += trade.pnl;
                }
                for (reason, (count, pnl)) in by_reason {
                    println!("  {:<16} {:>4} legs  {:.2}", reason, count, pnl);
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<TradingConfig> {
    TradingConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn print_config(config: &TradingConfig) -> Result<()> {
    println!("\n=== Configuration OK ===\n");
    println!("Symbols:              {}", config.symbols.join(", "));
    println!("Timeframe:            {}", config.timeframe);
    println!("History bars:         {}", config.history_bars);
    println!("Warm-up bars:         {}", config.indicators.warmup_bars());

    println!("\nRisk:");
    println!("  Risk per trade:     {}%", config.risk.risk_percent);
    println!("  Max risk per trade: {}%", config.risk.max_risk_percent);
    println!("  Max daily trades:   {}", config.risk.max_daily_trades);
    println!("  Max drawdown:       {}%", config.risk.max_drawdown_percent);
    println!("  Positions/symbol:   {}", config.risk.max_positions_per_symbol);

    println!("\nTake profit:");
    println!("  Mode:               {:?}", config.take_profit.mode);
    let levels: Vec<String> = config.active_levels().iter().map(|l| l.to_string()).collect();
    println!("  Levels:             {}", levels.join(" / "));
    let fractions: Vec<String> = config
        .leg_fractions()
        .iter()
        .map(|f| format!("{:.0}%", f * Decimal::ONE_HUNDRED))
        .collect();
    println!("  Leg split:          {}", fractions.join(" / "));

    println!("\nExits:");
    println!("  Max hold:           {}h", config.exits.max_hold_hours);

    println!("\nInstruments:");
    for symbol in &config.symbols {
        let spec = config.instrument(symbol)?;
        let stop = if spec.stops.atr_enabled {
            format!("{} x ATR", spec.stops.atr_multiplier)
        } else {
            format!("{} pips", spec.stops.stop_loss_pips)
        };
        println!(
            "  {:<10} digits {}  lots {}..{} step {}  stop {}",
            symbol,
            spec.instrument.digits,
            spec.instrument.min_lot,
            spec.instrument.max_lot,
            spec.instrument.lot_step,
            stop
        );
    }

    println!("\nGateway:");
    println!("  Bridge:             {}", config.gateway.base_url);
    println!("  Timeout:            {}s", config.gateway.timeout_secs);
    Ok(())
}

async fn print_status(db: &Database) -> Result<()> {
    let bot_state = match db.get_bot_state().await {
        Ok(state) => state,
        Err(_) => {
            println!("No bot session found. Run 'splitleg run' to start the bot.");
            return Ok(());
        }
    };

    let guard = db.load_guard_state().await?;
    let positions = db.load_positions().await?;
    let trades = db.get_trades().await?;
    let curve = db.get_equity_curve(1).await?;
    let max_dd = db.calculate_max_drawdown().await.unwrap_or(0.0);

    println!("\n=== Bot Status ===");
    println!("Running:          {}", if bot_state.is_running { "Yes" } else { "No" });
    println!("Started:          {}", bot_state.started_at);
    println!(
        "Last Tick:        {}",
        bot_state.last_tick_at.unwrap_or_else(|| "Never".to_string())
    );

    if let Some(guard) = &guard {
        println!("\n=== Drawdown Guard ===");
        println!("Status:           {}", guard.state.status);
        println!("Peak Equity:      {:.2}", guard.state.peak_equity);
        println!("Drawdown:         {:.2}%", guard.state.current_drawdown_pct);
        println!("Trading Day:      {}", guard.state.trading_day);
        println!("Trades Today:     {}", guard.daily_trades);
        if let Some(at) = guard.state.halted_at {
            println!("Halted At:        {}", at);
        }
        if bot_state.reset_requested {
            println!("Reset:            pending");
        }
    }

    if let Some(point) = curve.first() {
        println!("\n=== Account ===");
        println!("Balance:          {:.2}", point.balance);
        println!("Equity:           {:.2}", point.equity);
        println!("Max Drawdown:     {:.2}%", max_dd * 100.0);

        let realized: Decimal = trades.iter().map(|t| t.pnl).sum();
        let start = Decimal::try_from(point.balance).unwrap_or_default() - realized;
        let m = MetricsCalculator::calculate(&trades, start);
        println!("\n=== Trades (closed legs) ===");
        println!("Total:            {}", m.total_trades);
        println!("Win Rate:         {:.1}%", m.win_rate * 100.0);
        println!("Total P&L:        {:.2}", m.total_pnl);
        println!("Profit Factor:    {:.2}", m.profit_factor);
        println!("Sharpe Ratio:     {:.2}", m.sharpe_ratio);
    }

    if !positions.is_empty() {
        println!("\n=== Open Positions ({}) ===", positions.len());
        for pos in &positions {
            let open: Vec<String> = pos
                .open_legs()
                .map(|l| format!("#{} {} sl {} tp {}", l.ticket, l.quantity, l.stop_price, l.take_profit))
                .collect();
            println!(
                "  {} {} @ {} [{}] {}",
                pos.symbol,
                pos.direction,
                pos.entry_price,
                pos.state,
                open.join(", ")
            );
        }
    }
    Ok(())
}
