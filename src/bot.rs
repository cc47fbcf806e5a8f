//! Bot runner: the monitoring loop tying signals, sizing, the lifecycle
//! manager and the drawdown guard together.
//!
//! Each tick:
//! - Reconnect (with backoff) and reconcile if the last tick lost the terminal
//! - Refresh the account and update the drawdown guard
//! - Process every symbol concurrently: signal, entry, lifecycle step
//! - Persist positions, the trade journal, guard state and equity

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{BrokerGateway, PositionFilter, TimedGateway};
use crate::db::{Database, GuardSnapshot};
use crate::error::EngineError;
use crate::indicators::{self, IndicatorSet};
use crate::models::{AccountSnapshot, ClosedTrade, Position, PriceBar, Signal};
use crate::trading::{
    DrawdownGuard, GuardStatus, MarketRegime, MarketState, PositionManager, ResetReason,
    RiskSizer, SignalGenerator, TradingConfig,
};
use crate::trading::stops::to_decimal;

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub signals: usize,
    pub opened: usize,
    pub closed: Vec<ClosedTrade>,
    pub stop_moves: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct SymbolOutcome {
    signal: bool,
    opened: bool,
    closed: Vec<ClosedTrade>,
    stop_moves: usize,
    entry_failed: bool,
}

/// Main bot runner.
pub struct Bot {
    config: Arc<TradingConfig>,
    gateway: Arc<dyn BrokerGateway>,
    db: Database,
    generator: SignalGenerator,
    sizer: RiskSizer,
    manager: PositionManager,
    guard: Option<DrawdownGuard>,

    /// Entries taken on the guard's current trading day
    daily_trades: Mutex<u32>,

    /// Consecutive ticks with gateway failures
    failures: AtomicU32,

    connected: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    /// Every gateway call made by the bot is bounded by the configured
    /// timeout.
    pub fn new(config: Arc<TradingConfig>, gateway: Arc<dyn BrokerGateway>, db: Database) -> Self {
        let gateway: Arc<dyn BrokerGateway> = Arc::new(TimedGateway::new(
            gateway,
            Duration::from_secs(config.gateway.timeout_secs),
        ));
        Self {
            generator: SignalGenerator::new(config.clone()),
            sizer: RiskSizer::new(config.clone()),
            manager: PositionManager::new(gateway.clone(), config.clone()),
            config,
            gateway,
            db,
            guard: None,
            daily_trades: Mutex::new(0),
            failures: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn guard_status(&self) -> Option<GuardStatus> {
        self.guard.as_ref().map(|g| g.status())
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.manager.open_positions().await
    }

    /// Connect, restore persisted state and reconcile it with the broker.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing bot...");
        self.db.init_bot_state().await?;
        self.reconnect().await?;

        let account = self
            .gateway
            .get_account_snapshot()
            .await
            .context("Failed to fetch account snapshot")?;

        let max_dd = self.config.risk.max_drawdown_percent;
        let guard = match self.db.load_guard_state().await? {
            Some(saved) => {
                info!(
                    peak = %saved.state.peak_equity,
                    status = %saved.state.status,
                    trading_day = %saved.state.trading_day,
                    daily_trades = saved.daily_trades,
                    "Resuming drawdown guard"
                );
                *self.daily_trades.lock().await = saved.daily_trades;
                DrawdownGuard::restore(max_dd, saved.state)
            }
            None => DrawdownGuard::new(max_dd, &account),
        };
        self.guard = Some(guard);

        let positions = self.db.load_positions().await?;
        self.manager.restore(positions).await;
        self.reconcile(account.timestamp).await?;

        info!(
            balance = %account.balance,
            equity = %account.equity,
            symbols = ?self.config.symbols,
            "Bot initialized"
        );
        Ok(())
    }

    /// Re-establish the terminal session with exponential backoff.
    async fn reconnect(&self) -> Result<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(60))
            .with_max_elapsed_time(Some(Duration::from_secs(self.config.gateway.reconnect_max_secs)))
            .build();

        let handle = backoff::future::retry(policy, || async {
            self.gateway.connect().await.map_err(|e| {
                warn!(error = %e, "Terminal connect failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
        .context("Failed to connect to terminal")?;

        info!(session = %handle.session_id, server = %handle.server, "Connected to terminal");
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reconcile(&self, now: DateTime<Utc>) -> Result<()> {
        let live = self
            .gateway
            .get_open_positions(&PositionFilter::all())
            .await
            .context("Failed to list broker positions")?;
        let report = self.manager.reconcile(&live, now).await?;
        self.db.record_trades(&report.closed_legs).await?;
        if !report.closed_legs.is_empty() {
            info!(closed = report.closed_legs.len(), "Reconciled legs closed while offline");
        }
        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            poll_interval = self.config.poll_interval_secs,
            timeframe = %self.config.timeframe,
            "Starting bot run loop"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_secs));

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            poll_interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "Error in bot tick");
            }
        }

        self.stop().await
    }

    async fn stop(&self) -> Result<()> {
        info!("Shutting down bot...");
        self.journal_positions().await?;
        self.db.mark_bot_stopped().await?;
        info!("Bot shutdown complete");
        Ok(())
    }

    /// Single iteration of the main loop.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        if !self.connected.load(Ordering::SeqCst) {
            self.reconnect().await?;
            let now = self.gateway.get_account_snapshot().await?.timestamp;
            self.reconcile(now).await?;
        }

        let account = match self.gateway.get_account_snapshot().await {
            Ok(account) => account,
            Err(e) => {
                if e.is_connectivity() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(anyhow::Error::new(e).context("Failed to refresh account"));
            }
        };

        let can_open = self.update_guard(&account).await?;

        let this = &*self;
        let outcomes = join_all(
            this.config
                .symbols
                .iter()
                .map(|symbol| this.process_symbol(symbol, &account, can_open)),
        )
        .await;

        let mut summary = TickSummary::default();
        let mut gateway_failure = false;
        for (symbol, outcome) in self.config.symbols.iter().zip(outcomes) {
            match outcome {
                Ok(o) => {
                    summary.signals += o.signal as usize;
                    summary.opened += o.opened as usize;
                    summary.stop_moves += o.stop_moves;
                    summary.errors += o.entry_failed as usize;
                    summary.closed.extend(o.closed);
                }
                Err(EngineError::DataUnavailable { reason, .. }) => {
                    debug!(symbol = %symbol, reason = %reason, "Skipping symbol, not enough data");
                }
                Err(e) => {
                    summary.errors += 1;
                    if e.is_disconnect() {
                        self.connected.store(false, Ordering::SeqCst);
                    }
                    if matches!(e, EngineError::Gateway(_) | EngineError::GatewayDisconnected(_)) {
                        gateway_failure = true;
                    }
                    warn!(symbol = %symbol, error = %e, "Symbol processing failed");
                }
            }
        }

        if gateway_failure {
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures == self.config.gateway.failure_threshold {
                warn!(failures = failures, "Gateway failure threshold reached, new orders halted");
            }
        } else {
            self.failures.store(0, Ordering::SeqCst);
        }

        self.persist(&account).await?;

        if summary.signals > 0 || summary.opened > 0 || !summary.closed.is_empty() {
            info!(
                signals = summary.signals,
                opened = summary.opened,
                closed_legs = summary.closed.len(),
                stop_moves = summary.stop_moves,
                equity = %account.equity,
                floating = %account.unrealized_pnl(),
                "Tick complete"
            );
        }
        Ok(summary)
    }

    /// Day roll, operator reset and the drawdown check. Returns whether new
    /// entries are allowed this tick.
    async fn update_guard(&mut self, account: &AccountSnapshot) -> Result<bool> {
        let reset_requested = self.db.take_reset_request().await?;
        let max_dd = self.config.risk.max_drawdown_percent;
        let guard = self
            .guard
            .get_or_insert_with(|| DrawdownGuard::new(max_dd, account));

        if guard.roll_day(account) {
            *self.daily_trades.lock().await = 0;
            info!(trading_day = %guard.state().trading_day, "New trading day");
        }
        if reset_requested {
            guard.reset(account, ResetReason::Operator);
        }
        guard.update(account);

        let failures = self.failures.load(Ordering::SeqCst);
        if failures >= self.config.gateway.failure_threshold {
            debug!(failures = failures, "Entries halted after repeated gateway failures");
            return Ok(false);
        }
        Ok(guard.can_open())
    }

    async fn process_symbol(
        &self,
        symbol: &str,
        account: &AccountSnapshot,
        can_open: bool,
    ) -> Result<SymbolOutcome, EngineError> {
        let mut outcome = SymbolOutcome::default();
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(outcome);
        }

        let bars = self
            .gateway
            .get_price_bars(symbol, self.config.timeframe, self.config.history_bars)
            .await?;
        let Some(last) = bars.last() else {
            return Err(EngineError::data_unavailable(symbol, "no bars"));
        };
        let price = to_decimal(last.close)
            .ok_or_else(|| EngineError::data_unavailable(symbol, "latest close is not a number"))?;
        let now = account.timestamp;

        let indicators = indicators::compute(&bars, &self.config.indicators);

        let signal = match self.generator.evaluate(symbol, &bars, &indicators) {
            Ok(signal) => signal,
            Err(EngineError::DataUnavailable { reason, .. }) => {
                debug!(symbol = %symbol, reason = %reason, "Signal evaluation skipped");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(signal) = signal {
            outcome.signal = true;
            if can_open {
                match self.enter(signal, &bars, &indicators, account, price, now).await {
                    Ok(opened) => outcome.opened = opened.is_some(),
                    Err(e) if e.is_disconnect() => return Err(e),
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Entry failed");
                        outcome.entry_failed = true;
                    }
                }
            } else {
                info!(
                    symbol = %symbol,
                    direction = %signal.direction,
                    method = ?signal.primary_method(),
                    "Signal ignored, new entries halted"
                );
            }
        }

        let market = MarketState {
            price,
            atr: indicators.last_atr(),
            now,
        };
        let report = self.manager.advance(symbol, &market).await?;
        outcome.closed = report.closed_legs;
        outcome.stop_moves = report.stop_moves;
        Ok(outcome)
    }

    /// Apply the entry guards, size the signal and open it.
    pub async fn enter(
        &self,
        signal: Signal,
        bars: &[PriceBar],
        indicators: &IndicatorSet,
        account: &AccountSnapshot,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<Position>, EngineError> {
        let symbol = signal.symbol.clone();

        if !self.manager.accept_signal(&symbol, signal.bar_time).await? {
            debug!(symbol = %symbol, bar = %signal.bar_time, "Signal already handled for this bar");
            return Ok(None);
        }

        let live = self.manager.live_count(&symbol).await?;
        if live >= self.config.risk.max_positions_per_symbol {
            info!(symbol = %symbol, live = live, "Position limit reached, signal skipped");
            return Ok(None);
        }

        {
            let mut taken = self.daily_trades.lock().await;
            let limit = self.config.risk.max_daily_trades;
            if limit > 0 && *taken >= limit {
                info!(symbol = %symbol, taken = *taken, "Daily trade limit reached, signal skipped");
                return Ok(None);
            }
            *taken += 1;
        }

        let result = self.size_and_open(signal, bars, indicators, account, price, now).await;

        if self.manager.live_count(&symbol).await? <= live {
            let mut taken = self.daily_trades.lock().await;
            *taken = taken.saturating_sub(1);
        }
        result.map(Some)
    }

    async fn size_and_open(
        &self,
        signal: Signal,
        bars: &[PriceBar],
        indicators: &IndicatorSet,
        account: &AccountSnapshot,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let spec = self.config.instrument(&signal.symbol)?;
        let regime = MarketRegime::from_indicators(
            bars,
            indicators,
            self.config.risk.adaptive.trend_lookback,
        );
        let stop_distance = self.sizer.stop_distance(spec, regime.atr)?;
        let plan = self.sizer.size(signal, account, price, stop_distance, &regime)?;

        debug!(
            symbol = %plan.symbol,
            method = ?plan.signal.primary_method(),
            quantity = %plan.total_quantity,
            stop_pips = %spec.instrument.price_to_pips(plan.stop_distance).round_dp(1),
            risk_pct = %plan.risk_percent,
            risk = %plan.risk_amount,
            legs = plan.legs.len(),
            "Sized entry"
        );
        self.manager.open(plan, now).await
    }

    /// Journal every closed leg of open and archived positions and save the
    /// open ones. Covers legs closed by a lifecycle step that later failed;
    /// tickets already in the journal are skipped.
    async fn journal_positions(&self) -> Result<Vec<Position>> {
        let open = self.manager.open_positions().await;
        let archived = self.manager.take_archive().await;
        let closed: Vec<ClosedTrade> = open
            .iter()
            .chain(archived.iter())
            .flat_map(ClosedTrade::from_position)
            .collect();
        self.db.record_trades(&closed).await?;
        self.db.save_positions(&open).await?;
        Ok(open)
    }

    async fn persist(&self, account: &AccountSnapshot) -> Result<()> {
        let open = self.journal_positions().await?;

        if let Some(guard) = &self.guard {
            let snapshot = GuardSnapshot {
                state: guard.state().clone(),
                daily_trades: *self.daily_trades.lock().await,
            };
            self.db.save_guard_state(&snapshot).await?;
            self.db
                .record_equity_point(account, guard.state().current_drawdown_pct, open.len())
                .await?;
        }
        Ok(())
    }
}
