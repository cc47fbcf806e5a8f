//! Position lifecycle: opening split legs and managing them until closed.
//!
//! Positions live in one [`SymbolBook`] per symbol behind a `tokio` mutex,
//! so opening and advancing the same symbol never interleave while
//! different symbols proceed concurrently. Finished positions move to an
//! archive the caller drains for the journal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::{InstrumentSpec, TradingConfig};
use super::risk_sizer::{LegPlan, RiskPlan};
use super::stops::{
    breakeven_stop, classify_broker_close, force_breakeven, ratchet, time_exit_due, to_decimal,
    trailing_stop, BreakevenDecision,
};
use crate::api::{BrokerGateway, OrderKind, PositionFilter, PositionRef};
use crate::error::{EngineError, GatewayError};
use crate::models::{CloseReason, ClosedTrade, Position, PositionLeg, PositionState};

/// Market inputs for one lifecycle step.
#[derive(Debug, Clone, Copy)]
pub struct MarketState {
    /// Latest close
    pub price: Decimal,

    /// Current ATR, used when a position has none recorded at entry
    pub atr: Option<f64>,

    pub now: DateTime<Utc>,
}

/// What one `advance` or `reconcile` pass changed.
#[derive(Debug, Default)]
pub struct TickReport {
    pub closed_legs: Vec<ClosedTrade>,
    pub stop_moves: usize,
    pub time_exits: usize,

    /// Positions that reached a terminal state during the pass
    pub finished: Vec<Position>,
}

/// Per-symbol position book.
#[derive(Debug, Default)]
pub struct SymbolBook {
    pub positions: Vec<Position>,

    /// Bar that last produced an accepted signal
    pub last_signal_bar: Option<DateTime<Utc>>,
}

impl SymbolBook {
    /// Pending, active and partially closed positions.
    pub fn live_count(&self) -> usize {
        self.positions
            .iter()
            .filter(|p| !p.state.is_terminal())
            .count()
    }

    fn drain_finished(&mut self) -> Vec<Position> {
        let (finished, open): (Vec<_>, Vec<_>) = self
            .positions
            .drain(..)
            .partition(|p| p.state.is_terminal());
        self.positions = open;
        finished
    }
}

/// Owns every position and drives it through the state machine.
pub struct PositionManager {
    gateway: Arc<dyn BrokerGateway>,
    config: Arc<TradingConfig>,
    books: HashMap<String, Mutex<SymbolBook>>,
    archive: Mutex<Vec<Position>>,
}

impl PositionManager {
    pub fn new(gateway: Arc<dyn BrokerGateway>, config: Arc<TradingConfig>) -> Self {
        let books = config
            .symbols
            .iter()
            .map(|s| (s.clone(), Mutex::new(SymbolBook::default())))
            .collect();
        Self {
            gateway,
            config,
            books,
            archive: Mutex::new(Vec::new()),
        }
    }

    fn book(&self, symbol: &str) -> Result<&Mutex<SymbolBook>, EngineError> {
        self.books
            .get(symbol)
            .ok_or_else(|| EngineError::invalid_config(format!("symbol {symbol} is not configured")))
    }

    /// Put previously persisted positions back under management.
    pub async fn restore(&self, positions: Vec<Position>) -> usize {
        let mut restored = 0;
        for position in positions {
            if position.state.is_terminal() {
                continue;
            }
            let Ok(book) = self.book(&position.symbol) else {
                warn!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    "Dropping restored position for unconfigured symbol"
                );
                continue;
            };
            book.lock().await.positions.push(position);
            restored += 1;
        }
        info!(count = restored, "Restored open positions");
        restored
    }

    /// Duplicate-bar guard: true at most once per symbol and bar.
    pub async fn accept_signal(&self, symbol: &str, bar_time: DateTime<Utc>) -> Result<bool, EngineError> {
        let mut book = self.book(symbol)?.lock().await;
        if book.last_signal_bar.is_some_and(|last| last >= bar_time) {
            return Ok(false);
        }
        book.last_signal_bar = Some(bar_time);
        Ok(true)
    }

    pub async fn live_count(&self, symbol: &str) -> Result<usize, EngineError> {
        Ok(self.book(symbol)?.lock().await.live_count())
    }

    /// Snapshot of every position not yet archived.
    pub async fn open_positions(&self) -> Vec<Position> {
        let mut out = Vec::new();
        for book in self.books.values() {
            out.extend(book.lock().await.positions.iter().cloned());
        }
        out
    }

    /// Drain archived positions.
    pub async fn take_archive(&self) -> Vec<Position> {
        std::mem::take(&mut *self.archive.lock().await)
    }

    /// Place one broker order per planned leg.
    ///
    /// Rejected orders are retried against a fresh quote; legs that still
    /// fail are dropped. A connectivity failure stops placement but keeps
    /// whatever already filled, then returns the error.
    pub async fn open(&self, plan: RiskPlan, now: DateTime<Utc>) -> Result<Position, EngineError> {
        let spec = self.config.instrument(&plan.symbol)?;
        let mut book = self.book(&plan.symbol)?.lock().await;

        let mut position = Position {
            atr_at_entry: plan.atr,
            signal_id: plan.signal.id,
            ..Position::pending(
                plan.symbol.clone(),
                plan.direction,
                plan.entry_price,
                plan.stop_price,
                spec.instrument.contract_size,
                now,
            )
        };

        let mut interrupted = None;
        for leg in &plan.legs {
            match self.place_leg(&plan, leg, spec).await {
                Ok(Some(filled)) => position.legs.push(filled),
                Ok(None) => {}
                Err(e) => {
                    interrupted = Some(e);
                    break;
                }
            }
        }

        position.settle_fills(now)?;

        if position.state == PositionState::CancelledBeforeFill {
            warn!(
                position_id = %position.id,
                symbol = %plan.symbol,
                legs = plan.legs.len(),
                "No leg filled, position cancelled"
            );
            self.archive.lock().await.push(position.clone());
            return Err(match interrupted {
                Some(e) => e.into(),
                None => EngineError::OrderRejected {
                    symbol: plan.symbol.clone(),
                    reason: "every leg rejected".to_string(),
                },
            });
        }

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            direction = %position.direction,
            legs = position.legs.len(),
            planned_legs = plan.legs.len(),
            quantity = %position.open_quantity(),
            avg_fill = %position.average_fill(),
            stop = %position.initial_stop,
            methods = ?plan.signal.methods,
            confidence = %format!("{:.2}", plan.signal.confidence),
            "Position opened"
        );
        book.positions.push(position.clone());

        match interrupted {
            Some(e) => Err(e.into()),
            None => Ok(position),
        }
    }

    /// Place a single leg. `Ok(None)` when the leg was abandoned.
    async fn place_leg(
        &self,
        plan: &RiskPlan,
        leg: &LegPlan,
        spec: &InstrumentSpec,
    ) -> Result<Option<PositionLeg>, GatewayError> {
        let instrument = &spec.instrument;
        let mut stop = plan.stop_price;
        let mut take_profit = leg.take_profit;
        let attempts = self.config.gateway.order_retries + 1;

        for attempt in 1..=attempts {
            let result = self
                .gateway
                .place_order(
                    &plan.symbol,
                    plan.direction,
                    leg.quantity,
                    OrderKind::Market,
                    stop,
                    take_profit,
                )
                .await;

            match result {
                Ok(order) => {
                    debug!(
                        symbol = %plan.symbol,
                        leg = leg.index,
                        ticket = order.ticket,
                        fill = %order.fill_price,
                        "Leg filled"
                    );
                    return Ok(Some(PositionLeg::new(
                        leg.index,
                        order.ticket,
                        order.filled_quantity,
                        order.fill_price,
                        stop,
                        take_profit,
                    )));
                }
                Err(GatewayError::OrderRejected(reason)) if attempt < attempts => {
                    warn!(
                        symbol = %plan.symbol,
                        leg = leg.index,
                        attempt = attempt,
                        reason = %reason,
                        "Order rejected, retrying with a fresh quote"
                    );
                    if let Some(quote) = self.fresh_quote(&plan.symbol).await? {
                        let shift = quote - plan.entry_price;
                        stop = instrument.normalize_price(plan.stop_price + shift);
                        take_profit = instrument.normalize_price(leg.take_profit + shift);
                    }
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    warn!(
                        symbol = %plan.symbol,
                        leg = leg.index,
                        quantity = %leg.quantity,
                        error = %e,
                        "Abandoning leg"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    async fn fresh_quote(&self, symbol: &str) -> Result<Option<Decimal>, GatewayError> {
        match self
            .gateway
            .get_price_bars(symbol, self.config.timeframe, 1)
            .await
        {
            Ok(bars) => Ok(bars.last().and_then(|b| to_decimal(b.close))),
            Err(e) if e.is_connectivity() => Err(e),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Quote refresh failed, keeping levels");
                Ok(None)
            }
        }
    }

    /// Move the broker stop. `Ok(false)` leaves the leg unchanged after a
    /// non-connectivity failure.
    async fn move_stop(&self, leg: &mut PositionLeg, stop: Decimal) -> Result<bool, EngineError> {
        match self
            .gateway
            .modify_position(leg.ticket, stop, leg.take_profit)
            .await
        {
            Ok(()) => {
                debug!(ticket = leg.ticket, from = %leg.stop_price, to = %stop, "Stop moved");
                leg.stop_price = stop;
                Ok(true)
            }
            Err(e) if e.is_connectivity() => Err(e.into()),
            Err(e) => {
                warn!(ticket = leg.ticket, stop = %stop, error = %e, "Stop modify failed");
                Ok(false)
            }
        }
    }

    /// One lifecycle step for every live position of `symbol`.
    pub async fn advance(&self, symbol: &str, market: &MarketState) -> Result<TickReport, EngineError> {
        let spec = self.config.instrument(symbol)?;
        let instrument = &spec.instrument;
        let exits = &self.config.exits;
        let mut book = self.book(symbol)?.lock().await;
        let mut report = TickReport::default();

        if !book.positions.iter().any(|p| p.state.is_live()) {
            return Ok(report);
        }

        let live: HashSet<u64> = self
            .gateway
            .get_open_positions(&PositionFilter::symbol(symbol))
            .await?
            .into_iter()
            .map(|p| p.ticket)
            .collect();

        for position in book.positions.iter_mut().filter(|p| p.state.is_live()) {
            let direction = position.direction;

            let gone: Vec<PositionLeg> = position
                .open_legs()
                .filter(|l| !live.contains(&l.ticket))
                .cloned()
                .collect();
            for leg in gone {
                let reason = classify_broker_close(&leg, direction, market.price);
                let exit = match reason {
                    CloseReason::TakeProfit => leg.take_profit,
                    _ => leg.stop_price,
                };
                record_close(position, leg.ticket, reason, exit, market.now, &mut report)?;
            }
            if !position.state.is_live() {
                continue;
            }

            if time_exit_due(position.opened_at, market.now, exits) {
                let open: Vec<(u64, Decimal)> = position
                    .open_legs()
                    .map(|l| (l.ticket, l.quantity))
                    .collect();
                for (ticket, quantity) in open {
                    match self.gateway.close_position(ticket, quantity).await {
                        Ok(()) => record_close(
                            position,
                            ticket,
                            CloseReason::TimeExit,
                            market.price,
                            market.now,
                            &mut report,
                        )?,
                        Err(e) if e.is_connectivity() => return Err(e.into()),
                        Err(e) => warn!(ticket = ticket, error = %e, "Time exit close failed"),
                    }
                }
                report.time_exits += 1;
                info!(
                    position_id = %position.id,
                    symbol = %symbol,
                    age_hours = position.age(market.now).num_hours(),
                    "Time exit"
                );
                continue;
            }

            debug!(
                position_id = %position.id,
                symbol = %symbol,
                price = %market.price,
                floating = %position.unrealized_pnl(market.price),
                "Managing position"
            );

            let after_first_tp = exits.breakeven_after_first_tp && position.has_taken_profit();
            let atr = position.atr_at_entry.or(market.atr);

            for leg in position.legs.iter_mut().filter(|l| !l.closed) {
                if after_first_tp && !leg.breakeven_applied {
                    match force_breakeven(direction, leg.entry_price, leg.stop_price, exits, instrument) {
                        BreakevenDecision::Move(stop) => {
                            if self.move_stop(leg, stop).await? {
                                leg.breakeven_applied = true;
                                report.stop_moves += 1;
                            }
                        }
                        BreakevenDecision::AlreadyProtected => leg.breakeven_applied = true,
                        BreakevenDecision::Wait => {}
                    }
                }

                let Some(atr) = atr else {
                    continue;
                };

                if let Some(stop) = trailing_stop(
                    direction,
                    leg.entry_price,
                    leg.stop_price,
                    market.price,
                    atr,
                    exits,
                    instrument,
                ) {
                    if self.move_stop(leg, stop).await? {
                        leg.trailing_active = true;
                        report.stop_moves += 1;
                    }
                }

                if !leg.breakeven_applied {
                    match breakeven_stop(
                        direction,
                        leg.entry_price,
                        leg.stop_price,
                        market.price,
                        atr,
                        exits,
                        instrument,
                    ) {
                        BreakevenDecision::Move(stop) => {
                            if self.move_stop(leg, stop).await? {
                                leg.breakeven_applied = true;
                                report.stop_moves += 1;
                            }
                        }
                        BreakevenDecision::AlreadyProtected => leg.breakeven_applied = true,
                        BreakevenDecision::Wait => {}
                    }
                }
            }
        }

        self.archive_finished(&mut book, &mut report).await;
        Ok(report)
    }

    /// Align tracked legs with the broker's position list: legs the broker
    /// no longer holds are closed as reconciled at their stop, tighter
    /// broker stops are adopted, and untracked broker positions are logged.
    pub async fn reconcile(&self, live: &[PositionRef], now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let by_ticket: HashMap<u64, &PositionRef> = live.iter().map(|p| (p.ticket, p)).collect();
        let mut tracked = HashSet::new();
        let mut report = TickReport::default();

        for book in self.books.values() {
            let mut book = book.lock().await;
            for position in book.positions.iter_mut().filter(|p| p.state.is_live()) {
                let direction = position.direction;
                let mut missing = Vec::new();

                for leg in position.legs.iter_mut().filter(|l| !l.closed) {
                    tracked.insert(leg.ticket);
                    match by_ticket.get(&leg.ticket) {
                        None => missing.push((leg.ticket, leg.stop_price)),
                        Some(broker) => {
                            if let Some(stop) = broker.stop_price {
                                let adopted = ratchet(direction, leg.stop_price, stop);
                                if adopted != leg.stop_price {
                                    info!(ticket = leg.ticket, from = %leg.stop_price, to = %adopted, "Adopting broker stop");
                                    leg.stop_price = adopted;
                                }
                            }
                        }
                    }
                }

                for (ticket, stop) in missing {
                    warn!(
                        position_id = %position.id,
                        symbol = %position.symbol,
                        ticket = ticket,
                        "Leg missing at broker, closing as reconciled"
                    );
                    record_close(position, ticket, CloseReason::Reconciled, stop, now, &mut report)?;
                }
            }
            self.archive_finished(&mut book, &mut report).await;
        }

        for orphan in live.iter().filter(|p| !tracked.contains(&p.ticket)) {
            warn!(
                ticket = orphan.ticket,
                symbol = %orphan.symbol,
                direction = %orphan.direction,
                quantity = %orphan.quantity,
                "Broker position not tracked by the engine"
            );
        }
        Ok(report)
    }

    async fn archive_finished(&self, book: &mut SymbolBook, report: &mut TickReport) {
        let finished = book.drain_finished();
        if finished.is_empty() {
            return;
        }
        for position in &finished {
            info!(
                position_id = %position.id,
                symbol = %position.symbol,
                state = %position.state,
                realized_pnl = %position.realized_pnl(),
                "Position finished"
            );
        }
        report.finished.extend(finished.iter().cloned());
        self.archive.lock().await.extend(finished);
    }
}

fn record_close(
    position: &mut Position,
    ticket: u64,
    reason: CloseReason,
    exit: Decimal,
    now: DateTime<Utc>,
    report: &mut TickReport,
) -> Result<(), EngineError> {
    if !position.close_leg(ticket, reason, exit, now)? {
        return Ok(());
    }
    if let Some(trade) = position
        .legs
        .iter()
        .find(|l| l.ticket == ticket)
        .and_then(|leg| ClosedTrade::from_leg(position, leg))
    {
        info!(
            symbol = %trade.symbol,
            ticket = ticket,
            leg = trade.leg_index,
            reason = %reason,
            exit = %exit,
            pnl = %trade.pnl,
            "Leg closed"
        );
        report.closed_legs.push(trade);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperGateway;
    use crate::models::{AccountSnapshot, Direction, PriceBar, Signal, SignalMethod};
    use crate::trading::config::RawConfig;
    use crate::trading::risk_sizer::{MarketRegime, RiskSizer};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn bar(h: i64, open: f64, high: f64, low: f64, close: f64) -> PriceBar {
        PriceBar::new(t0() + Duration::hours(h), open, high, low, close, 100.0)
    }

    struct Harness {
        paper: Arc<PaperGateway>,
        manager: PositionManager,
        config: Arc<TradingConfig>,
    }

    fn harness(raw: RawConfig) -> Harness {
        let config = Arc::new(TradingConfig::from_raw(raw).unwrap());
        let paper = Arc::new(PaperGateway::new(dec!(100000)));
        paper.add_instrument(config.instrument("EURUSD").unwrap().instrument.clone());
        paper.push_bar("EURUSD", bar(0, 1.1, 1.1005, 1.0995, 1.1));
        let gateway: Arc<dyn BrokerGateway> = paper.clone();
        Harness {
            manager: PositionManager::new(gateway, config.clone()),
            paper,
            config,
        }
    }

    /// Long EURUSD, 2 lots over a 50 pip stop, legs 0.8 / 0.6 / 0.6.
    fn long_plan(config: &Arc<TradingConfig>) -> RiskPlan {
        let signal = Signal {
            id: Uuid::new_v4(),
            symbol: "EURUSD".to_string(),
            direction: Direction::Long,
            confidence: 0.8,
            methods: vec![SignalMethod::Crossover],
            reasons: vec![],
            bar_time: t0(),
            generated_at: t0(),
        };
        let account = AccountSnapshot {
            balance: dec!(100000),
            equity: dec!(100000),
            free_margin: dec!(100000),
            timestamp: t0(),
        };
        let regime = MarketRegime {
            atr: Some(0.0025),
            ..MarketRegime::default()
        };
        RiskSizer::new(config.clone())
            .size(signal, &account, dec!(1.10000), dec!(0.00500), &regime)
            .unwrap()
    }

    fn market(price: Decimal, hours: i64) -> MarketState {
        MarketState {
            price,
            atr: None,
            now: t0() + Duration::hours(hours),
        }
    }

    #[tokio::test]
    async fn test_open_places_one_order_per_leg() {
        let h = harness(RawConfig::default());
        let position = h.manager.open(long_plan(&h.config), t0()).await.unwrap();

        assert_eq!(position.state, PositionState::Active);
        assert_eq!(position.legs.len(), 3);
        assert_eq!(position.open_quantity(), dec!(2.00));
        assert_eq!(position.atr_at_entry, Some(0.0025));

        let broker = h.paper.get_open_positions(&PositionFilter::all()).await.unwrap();
        let tps: Vec<Decimal> = broker.iter().filter_map(|p| p.take_profit).collect();
        assert_eq!(tps, vec![dec!(1.10750), dec!(1.11250), dec!(1.12000)]);
        assert_eq!(h.manager.live_count("EURUSD").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_leg_retried_then_dropped() {
        let h = harness(RawConfig::default());
        // first leg: 1 + 2 retries all rejected; the others fill
        h.paper.reject_next_orders(3);
        let position = h.manager.open(long_plan(&h.config), t0()).await.unwrap();
        assert_eq!(position.legs.len(), 2);
        assert_eq!(position.legs[0].index, 1);

        h.paper.reject_next_orders(2);
        let position = h.manager.open(long_plan(&h.config), t0()).await.unwrap();
        assert_eq!(position.legs.len(), 3);
    }

    #[tokio::test]
    async fn test_all_legs_rejected_cancels_position() {
        let h = harness(RawConfig::default());
        h.paper.reject_next_orders(100);
        let err = h.manager.open(long_plan(&h.config), t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected { .. }));

        assert_eq!(h.manager.live_count("EURUSD").await.unwrap(), 0);
        let archive = h.manager.take_archive().await;
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].state, PositionState::CancelledBeforeFill);
    }

    #[tokio::test]
    async fn test_disconnect_during_open() {
        let h = harness(RawConfig::default());
        h.paper.disconnect();
        let err = h.manager.open(long_plan(&h.config), t0()).await.unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(h.manager.live_count("EURUSD").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_split_lifecycle_take_profit_breakeven_trailing() {
        let h = harness(RawConfig::default());
        h.manager.open(long_plan(&h.config), t0()).await.unwrap();

        // first target at 1.10750 is hit
        h.paper.push_bar("EURUSD", bar(1, 1.1, 1.108, 1.099, 1.106));
        let report = h.manager.advance("EURUSD", &market(dec!(1.10600), 1)).await.unwrap();

        assert_eq!(report.closed_legs.len(), 1);
        assert_eq!(report.closed_legs[0].reason, CloseReason::TakeProfit);
        assert_eq!(report.closed_legs[0].pnl, dec!(600));
        // breakeven after the first TP, then trailing: 2 moves per remaining leg
        assert_eq!(report.stop_moves, 4);

        let position = &h.manager.open_positions().await[0];
        assert_eq!(position.state, PositionState::PartiallyClosed);
        for leg in position.open_legs() {
            // 1.10600 - 1.5 * 0.0025
            assert_eq!(leg.stop_price, dec!(1.10225));
            assert!(leg.breakeven_applied);
            assert!(leg.trailing_active);
        }

        // unchanged price: nothing to do
        let again = h.manager.advance("EURUSD", &market(dec!(1.10600), 1)).await.unwrap();
        assert_eq!(again.stop_moves, 0);

        // remaining legs stopped by the trailed stop
        h.paper.push_bar("EURUSD", bar(2, 1.106, 1.106, 1.102, 1.1022));
        let report = h.manager.advance("EURUSD", &market(dec!(1.10220), 2)).await.unwrap();
        assert_eq!(report.closed_legs.len(), 2);
        assert!(report
            .closed_legs
            .iter()
            .all(|t| t.reason == CloseReason::TrailingStop && t.exit_price == dec!(1.10225)));
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].state, PositionState::Closed);
        // 600 + 2 * 0.6 * 0.00225 * 100000
        assert_eq!(report.finished[0].realized_pnl(), dec!(870));
        assert_eq!(h.manager.live_count("EURUSD").await.unwrap(), 0);
        assert_eq!(h.manager.take_archive().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_modify_keeps_stop() {
        let h = harness(RawConfig::default());
        h.manager.open(long_plan(&h.config), t0()).await.unwrap();
        h.paper.set_fail_modify(true);

        h.paper.push_bar("EURUSD", bar(1, 1.1, 1.1061, 1.0999, 1.106));
        let report = h.manager.advance("EURUSD", &market(dec!(1.10600), 1)).await.unwrap();
        assert_eq!(report.stop_moves, 0);

        let position = &h.manager.open_positions().await[0];
        assert!(position.legs.iter().all(|l| l.stop_price == dec!(1.09500) && !l.trailing_active));
    }

    #[tokio::test]
    async fn test_time_exit_closes_every_leg() {
        let mut raw = RawConfig::default();
        raw.exits.time_exit_enabled = true;
        raw.exits.max_hold_hours = 24;
        let h = harness(raw);
        h.manager.open(long_plan(&h.config), t0()).await.unwrap();

        let quiet = h.manager.advance("EURUSD", &market(dec!(1.10000), 23)).await.unwrap();
        assert_eq!(quiet.time_exits, 0);

        let report = h.manager.advance("EURUSD", &market(dec!(1.10000), 25)).await.unwrap();
        assert_eq!(report.time_exits, 1);
        assert_eq!(report.closed_legs.len(), 3);
        assert!(report.closed_legs.iter().all(|t| t.reason == CloseReason::TimeExit));
        assert!(h.paper.get_open_positions(&PositionFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advance_propagates_disconnect() {
        let h = harness(RawConfig::default());
        h.manager.open(long_plan(&h.config), t0()).await.unwrap();
        h.paper.disconnect();
        let err = assert_err!(h.manager.advance("EURUSD", &market(dec!(1.1), 1)).await);
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_reconcile_closes_missing_and_adopts_stops() {
        let h = harness(RawConfig::default());
        let position = h.manager.open(long_plan(&h.config), t0()).await.unwrap();
        let tickets: Vec<u64> = position.legs.iter().map(|l| l.ticket).collect();

        // one leg closed by hand at the terminal, one stop tightened there
        assert_ok!(h.paper.close_position(tickets[0], dec!(0.8)).await);
        assert_ok!(h.paper.modify_position(tickets[1], dec!(1.09700), dec!(1.11250)).await);
        // and a position the engine never opened
        h.paper
            .place_order("EURUSD", Direction::Short, dec!(0.1), OrderKind::Market, dec!(1.11), dec!(1.09))
            .await
            .unwrap();

        let live = h.paper.get_open_positions(&PositionFilter::all()).await.unwrap();
        let report = h.manager.reconcile(&live, t0()).await.unwrap();

        assert_eq!(report.closed_legs.len(), 1);
        assert_eq!(report.closed_legs[0].reason, CloseReason::Reconciled);
        assert_eq!(report.closed_legs[0].exit_price, dec!(1.09500));

        let position = &h.manager.open_positions().await[0];
        assert_eq!(position.state, PositionState::PartiallyClosed);
        assert_eq!(position.legs[1].stop_price, dec!(1.09700));
        assert_eq!(position.legs[2].stop_price, dec!(1.09500));
    }

    #[tokio::test]
    async fn test_duplicate_bar_guard() {
        let h = harness(RawConfig::default());
        assert!(h.manager.accept_signal("EURUSD", t0()).await.unwrap());
        assert!(!h.manager.accept_signal("EURUSD", t0()).await.unwrap());
        assert!(h.manager.accept_signal("EURUSD", t0() + Duration::hours(1)).await.unwrap());
        assert!(h.manager.accept_signal("GBPUSD", t0()).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_skips_terminal_and_unknown() {
        let h = harness(RawConfig::default());
        let position = h.manager.open(long_plan(&h.config), t0()).await.unwrap();

        let other = harness(RawConfig::default());
        let mut closed = position.clone();
        closed.state = PositionState::Closed;
        let mut foreign = position.clone();
        foreign.symbol = "GBPUSD".to_string();

        let restored = other.manager.restore(vec![position, closed, foreign]).await;
        assert_eq!(restored, 1);
        assert_eq!(other.manager.live_count("EURUSD").await.unwrap(), 1);
    }
}
