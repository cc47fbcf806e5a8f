//! Bar-replay backtester.
//!
//! Historical bars are loaded from CSV files and replayed one timestamp at a
//! time through a [`PaperGateway`]. Every step runs the same [`Bot::tick`]
//! the live loop runs, so signals, sizing, split entries, stop management
//! and the drawdown guard behave exactly as they would against a terminal.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::{BrokerGateway, PaperGateway};
use crate::bot::Bot;
use crate::db::Database;
use crate::metrics::MetricsCalculator;
use crate::models::{ClosedTrade, PerformanceMetrics, PriceBar};
use crate::trading::{GuardStatus, SignalGenerator, TradingConfig};

/// One CSV row: `timestamp,open,high,low,close[,volume]`.
#[derive(Debug, Deserialize)]
struct CsvBar {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]` (UTC) or unix seconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Load a bar series from a CSV file with a header row.
///
/// Rows with unparseable timestamps or inconsistent prices are dropped.
/// The result is sorted by time with duplicate timestamps removed.
pub fn load_bars(path: impl AsRef<Path>) -> Result<Vec<PriceBar>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut bars = Vec::new();
    let mut dropped = 0usize;
    for row in reader.deserialize::<CsvBar>() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        let Some(timestamp) = parse_timestamp(&row.timestamp) else {
            dropped += 1;
            continue;
        };
        let bar = PriceBar::new(
            timestamp,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume.unwrap_or(0.0),
        );
        if bar.is_valid() {
            bars.push(bar);
        } else {
            dropped += 1;
        }
    }

    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);

    if dropped > 0 {
        warn!(file = %path.display(), dropped = dropped, "Dropped invalid CSV rows");
    }
    Ok(bars)
}

/// Backtest results summary.
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Replay steps after the indicator warm-up
    pub steps: usize,

    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub final_equity: Decimal,

    /// Positions still open when the data ran out
    pub open_positions: usize,

    pub tick_errors: usize,
    pub guard_status: Option<GuardStatus>,
    pub metrics: PerformanceMetrics,

    /// P&L booked by the paper broker itself
    pub broker_pnl: Decimal,

    /// Journaled legs whose exit differs from the broker's fill (gaps)
    pub exit_mismatches: usize,

    /// Closed legs in journal order
    pub trades: Vec<ClosedTrade>,
}

impl BacktestReport {
    pub fn total_return_pct(&self) -> Decimal {
        if self.initial_balance.is_zero() {
            return Decimal::ZERO;
        }
        (self.final_equity - self.initial_balance) / self.initial_balance * dec!(100)
    }
}

impl fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.metrics;
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(
            f,
            "Period: {} to {} ({} steps)",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"),
            self.steps
        )?;
        writeln!(f)?;
        writeln!(f, "--- Account ---")?;
        writeln!(f, "Initial:     {:.2}", self.initial_balance)?;
        writeln!(f, "Balance:     {:.2}", self.final_balance)?;
        writeln!(f, "Equity:      {:.2}", self.final_equity)?;
        writeln!(f, "Return:      {:.2}%", self.total_return_pct())?;
        writeln!(f, "Still open:  {}", self.open_positions)?;
        writeln!(f, "Broker P&L:  {:.2}", self.broker_pnl)?;
        if self.exit_mismatches > 0 {
            writeln!(f, "Gap fills:   {}", self.exit_mismatches)?;
        }
        writeln!(f)?;
        writeln!(f, "--- Trades (closed legs) ---")?;
        writeln!(f, "Total:       {}", m.total_trades)?;
        writeln!(f, "Winners:     {} ({:.1}%)", m.winning_trades, m.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", m.losing_trades)?;
        writeln!(f, "Avg Win:     {:.2}", m.avg_win)?;
        writeln!(f, "Avg Loss:    {:.2}", m.avg_loss)?;
        writeln!(f, "Expectancy:  {:.2}", m.expectancy)?;
        writeln!(f, "Profit Factor: {:.2}", m.profit_factor)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}% ({:.2})", m.max_drawdown * 100.0, m.max_drawdown_abs)?;
        writeln!(f, "Sharpe Ratio: {:.2}", m.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", m.sortino_ratio)?;
        if let Some(status) = self.guard_status {
            writeln!(f, "Guard:        {status}")?;
        }
        writeln!(f)?;
        writeln!(f, "--- Timing ---")?;
        writeln!(f, "Avg Hold:    {:.1} hours", m.avg_holding_hours)?;
        writeln!(f, "Trades/Day:  {:.2}", m.trades_per_day)?;
        if self.tick_errors > 0 {
            writeln!(f, "Tick errors: {}", self.tick_errors)?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Backtesting engine.
pub struct Backtester {
    config: Arc<TradingConfig>,
    initial_balance: Decimal,
}

impl Backtester {
    pub fn new(config: Arc<TradingConfig>, initial_balance: Decimal) -> Self {
        Self {
            config,
            initial_balance,
        }
    }

    /// Load `<SYMBOL>.csv` for every configured symbol from `dir` and run.
    pub async fn run_from_dir(&self, dir: impl AsRef<Path>) -> Result<BacktestReport> {
        let dir = dir.as_ref();
        let mut series = HashMap::new();
        for symbol in &self.config.symbols {
            let path = dir.join(format!("{symbol}.csv"));
            let bars = load_bars(&path)?;
            info!(symbol = %symbol, bars = bars.len(), file = %path.display(), "Loaded history");
            series.insert(symbol.clone(), bars);
        }
        self.run(series).await
    }

    /// Replay the given series through the live tick path.
    pub async fn run(&self, series: HashMap<String, Vec<PriceBar>>) -> Result<BacktestReport> {
        let warmup = SignalGenerator::new(self.config.clone()).min_history();

        let paper = Arc::new(PaperGateway::new(self.initial_balance));
        let mut start_time: Option<DateTime<Utc>> = None;
        for symbol in &self.config.symbols {
            let bars = series
                .get(symbol)
                .with_context(|| format!("No history for {symbol}"))?;
            if bars.len() <= warmup {
                bail!(
                    "{symbol}: {} bars is not enough history, need more than {warmup}",
                    bars.len()
                );
            }
            let spec = self.config.instrument(symbol)?;
            paper.add_instrument(spec.instrument.clone());
            paper.load_series(symbol, bars.clone());

            let first = bars[warmup - 1].timestamp;
            start_time = Some(start_time.map_or(first, |s| s.max(first)));
        }
        paper.reveal_until(warmup);

        let db = Database::new("sqlite::memory:").await?;
        let gateway: Arc<dyn BrokerGateway> = paper.clone();
        let mut bot = Bot::new(self.config.clone(), gateway, db);
        bot.initialize().await.context("Failed to initialize backtest bot")?;

        info!(
            symbols = ?self.config.symbols,
            warmup = warmup,
            balance = %self.initial_balance,
            "Starting backtest"
        );

        let mut steps = 0usize;
        let mut tick_errors = 0usize;
        while paper.advance() {
            steps += 1;
            match bot.tick().await {
                Ok(summary) => tick_errors += summary.errors,
                Err(e) => {
                    tick_errors += 1;
                    debug!(step = steps, error = %e, "Backtest tick failed");
                }
            }
        }

        let account = paper
            .get_account_snapshot()
            .await
            .context("Failed to read final account")?;
        let trades = bot.database().get_trades().await?;
        let metrics = MetricsCalculator::calculate(&trades, self.initial_balance);
        let open_positions = bot.open_positions().await.len();

        let fills = paper.history();
        let journal: HashMap<u64, &ClosedTrade> = trades.iter().map(|t| (t.ticket, t)).collect();
        let mut exit_mismatches = 0;
        for fill in &fills {
            match journal.get(&fill.ticket) {
                Some(trade) if trade.exit_price != fill.exit_price => {
                    exit_mismatches += 1;
                    debug!(
                        ticket = fill.ticket,
                        symbol = %fill.symbol,
                        reason = %fill.reason,
                        journal_exit = %trade.exit_price,
                        broker_exit = %fill.exit_price,
                        at = %fill.at,
                        "Broker filled away from the journaled level"
                    );
                }
                Some(_) => {}
                None => debug!(ticket = fill.ticket, symbol = %fill.symbol, "Broker fill not journaled"),
            }
        }
        let broker_pnl: Decimal = fills.iter().map(|f| f.pnl).sum();

        info!(
            steps = steps,
            trades = trades.len(),
            balance = %account.balance,
            "Backtest complete"
        );

        Ok(BacktestReport {
            start_time: start_time.unwrap_or(account.timestamp),
            end_time: paper.clock().unwrap_or(account.timestamp),
            steps,
            initial_balance: self.initial_balance,
            final_balance: paper.balance(),
            final_equity: account.equity,
            open_positions,
            tick_errors,
            guard_status: bot.guard_status(),
            metrics,
            broker_pnl,
            exit_mismatches,
            trades,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::RawConfig;
    use chrono::{Duration, TimeZone};
    use std::io::Write;

    fn t(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    /// Trending legs with pullbacks so several methods get a chance to fire.
    fn wave(count: i64) -> Vec<PriceBar> {
        (0..count)
            .map(|i| {
                let x = i as f64;
                let close = 1.1 + 0.004 * (x / 25.0).sin() + 0.00002 * x;
                let open = close - 0.0002 * (x / 3.0).cos();
                let high = open.max(close) + 0.0006;
                let low = open.min(close) - 0.0006;
                PriceBar::new(t(i), open, high, low, close, 1000.0)
            })
            .collect()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 4, 13, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-04T13:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-04 13:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024.03.04 13:00"), Some(expected));
        assert_eq!(parse_timestamp(&expected.timestamp().to_string()), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_load_bars_sorts_and_drops_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-03-04 02:00,1.1010,1.1030,1.1000,1.1020,10").unwrap();
        writeln!(file, "2024-03-04 01:00,1.1000,1.1020,1.0990,1.1010,12").unwrap();
        writeln!(file, "not-a-time,1.1,1.1,1.1,1.1,1").unwrap();
        // high below low
        writeln!(file, "2024-03-04 03:00,1.1020,1.1000,1.1030,1.1010,9").unwrap();
        writeln!(file, "2024-03-04 01:00,1.1000,1.1020,1.0990,1.1010,12").unwrap();
        file.flush().unwrap();

        let bars = load_bars(file.path()).unwrap();
        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert_eq!(bars[1].close, 1.1020);
    }

    #[test]
    fn test_load_bars_missing_file() {
        assert!(load_bars("/nonexistent/EURUSD.csv").is_err());
    }

    #[tokio::test]
    async fn test_short_history_is_an_error() {
        let config = Arc::new(TradingConfig::from_raw(RawConfig::default()).unwrap());
        let backtester = Backtester::new(config, dec!(10000));
        let mut series = HashMap::new();
        series.insert("EURUSD".to_string(), wave(10));
        assert!(backtester.run(series).await.is_err());
    }

    #[tokio::test]
    async fn test_replay_report_is_consistent() {
        let config = Arc::new(TradingConfig::from_raw(RawConfig::default()).unwrap());
        let warmup = SignalGenerator::new(config.clone()).min_history();
        let backtester = Backtester::new(config, dec!(10000));

        let bars = wave(600);
        let mut series = HashMap::new();
        series.insert("EURUSD".to_string(), bars);
        let report = backtester.run(series).await.unwrap();

        assert_eq!(report.steps, 600 - warmup);
        assert_eq!(report.metrics.total_trades as usize, report.trades.len());
        assert!(report.metrics.winning_trades + report.metrics.losing_trades <= report.metrics.total_trades);
        assert!((0.0..=1.0).contains(&report.metrics.max_drawdown));
        assert_eq!(report.end_time, t(599));
        assert!(report.final_balance > Decimal::ZERO);

        let journal_pnl: Decimal = report.trades.iter().map(|t| t.pnl).sum();
        assert_eq!(report.metrics.total_pnl, journal_pnl);
        assert_eq!(report.final_balance, report.initial_balance + report.broker_pnl);
        assert!(report.to_string().contains("BACKTEST RESULTS"));
    }

    #[tokio::test]
    async fn test_run_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("EURUSD.csv")).unwrap();
        writeln!(file, "timestamp,open,high,low,close,volume").unwrap();
        for bar in wave(300) {
            writeln!(
                file,
                "{},{},{},{},{},{}",
                bar.timestamp.to_rfc3339(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume
            )
            .unwrap();
        }
        drop(file);

        let config = Arc::new(TradingConfig::from_raw(RawConfig::default()).unwrap());
        let report = Backtester::new(config, dec!(10000))
            .run_from_dir(dir.path())
            .await
            .unwrap();
        assert_eq!(report.end_time, t(299));
    }
}
