//! In-memory paper broker driven by bar series.
//!
//! Bars are revealed one timestamp at a time with [`PaperGateway::advance`].
//! Market orders fill at the latest visible close. Stops and take-profits
//! are checked against each newly revealed bar's range; when a bar touches
//! both, the stop wins. Tests can inject order rejections, failing modifies
//! and disconnections.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use super::gateway::BrokerGateway;
use super::types::{ConnectionHandle, OrderKind, OrderRef, PositionFilter, PositionRef};
use crate::error::GatewayError;
use crate::models::{AccountSnapshot, CloseReason, Direction, Instrument, PriceBar, Timeframe};
use crate::trading::stops::to_decimal;

/// A position closed by the paper broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub ticket: u64,
    pub symbol: String,
    pub exit_price: Decimal,
    pub reason: CloseReason,
    pub pnl: Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PaperState {
    instruments: HashMap<String, Instrument>,
    series: HashMap<String, Vec<PriceBar>>,

    /// Number of visible bars per symbol
    visible: HashMap<String, usize>,

    timeline: Vec<DateTime<Utc>>,
    step: usize,
    clock: Option<DateTime<Utc>>,

    balance: Decimal,
    positions: BTreeMap<u64, PositionRef>,
    next_ticket: u64,
    history: Vec<PaperFill>,

    connected: bool,
    reject_orders: u32,
    fail_modify: bool,
}

impl PaperState {
    fn last_bar(&self, symbol: &str) -> Option<&PriceBar> {
        let visible = *self.visible.get(symbol)?;
        self.series.get(symbol)?.get(visible.checked_sub(1)?)
    }

    fn quote(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let bar = self
            .last_bar(symbol)
            .ok_or_else(|| GatewayError::NotFound(format!("no price for {symbol}")))?;
        let price = to_decimal(bar.close)
            .ok_or_else(|| GatewayError::Protocol(format!("{symbol}: non-finite close")))?;
        Ok(self.normalize(symbol, price))
    }

    fn normalize(&self, symbol: &str, price: Decimal) -> Decimal {
        match self.instruments.get(symbol) {
            Some(inst) => inst.normalize_price(price),
            None => price,
        }
    }

    fn contract_size(&self, symbol: &str) -> Decimal {
        self.instruments
            .get(symbol)
            .map(|i| i.contract_size)
            .unwrap_or(Decimal::ONE)
    }

    fn floating_pnl(&self) -> Decimal {
        self.positions
            .values()
            .filter_map(|p| {
                let price = self.quote(&p.symbol).ok()?;
                Some(
                    p.direction.favorable_move(p.open_price, price)
                        * p.quantity
                        * self.contract_size(&p.symbol),
                )
            })
            .sum()
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.connected {
            Ok(())
        } else {
            Err(GatewayError::Disconnected("paper terminal offline".to_string()))
        }
    }

    /// Close (part of) a position at `price` and book the P&L.
    fn realize(&mut self, ticket: u64, quantity: Decimal, price: Decimal, reason: CloseReason, at: DateTime<Utc>) {
        let Some(pos) = self.positions.get_mut(&ticket) else {
            return;
        };
        let quantity = quantity.min(pos.quantity);
        let pnl = pos.direction.favorable_move(pos.open_price, price) * quantity
            * self
                .instruments
                .get(&pos.symbol)
                .map(|i| i.contract_size)
                .unwrap_or(Decimal::ONE);
        pos.quantity -= quantity;
        let symbol = pos.symbol.clone();
        if pos.quantity <= Decimal::ZERO {
            self.positions.remove(&ticket);
        }
        self.balance += pnl;
        self.history.push(PaperFill {
            ticket,
            symbol,
            exit_price: price,
            reason,
            pnl,
            at,
        });
    }

    /// Trigger stops and targets against the newest bar of `symbol`.
    fn check_levels(&mut self, symbol: &str) {
        let Some(bar) = self.last_bar(symbol).cloned() else {
            return;
        };
        let (Some(open), Some(high), Some(low)) =
            (to_decimal(bar.open), to_decimal(bar.high), to_decimal(bar.low))
        else {
            return;
        };

        let mut hits = Vec::new();
        for pos in self.positions.values().filter(|p| p.symbol == symbol) {
            let (adverse, favorable) = match pos.direction {
                Direction::Long => (low, high),
                Direction::Short => (high, low),
            };
            if let Some(stop) = pos.stop_price {
                if !pos.direction.is_better(adverse, stop) {
                    // gap through the stop fills at the open
                    let fill = if pos.direction.is_better(stop, open) { open } else { stop };
                    hits.push((pos.ticket, pos.quantity, fill, CloseReason::StopLoss));
                    continue;
                }
            }
            if let Some(tp) = pos.take_profit {
                if !pos.direction.is_better(tp, favorable) {
                    hits.push((pos.ticket, pos.quantity, tp, CloseReason::TakeProfit));
                }
            }
        }

        for (ticket, quantity, price, reason) in hits {
            let price = self.normalize(symbol, price);
            debug!(ticket = ticket, symbol = %symbol, price = %price, reason = %reason, "Paper level hit");
            self.realize(ticket, quantity, price, reason, bar.timestamp);
        }
    }
}

/// Paper broker implementing [`BrokerGateway`].
pub struct PaperGateway {
    state: RwLock<PaperState>,
}

impl PaperGateway {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: RwLock::new(PaperState {
                balance,
                next_ticket: 1,
                connected: true,
                ..PaperState::default()
            }),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PaperState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PaperState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_instrument(&self, instrument: Instrument) {
        self.write()
            .instruments
            .insert(instrument.symbol.clone(), instrument);
    }

    /// Load a bar series for replay. Nothing is visible until `advance` (or
    /// `reveal_until`) moves the clock.
    pub fn load_series(&self, symbol: &str, bars: Vec<PriceBar>) {
        let mut state = self.write();
        let mut times: BTreeSet<DateTime<Utc>> = state.timeline.iter().copied().collect();
        times.extend(bars.iter().map(|b| b.timestamp));
        state.timeline = times.into_iter().collect();
        state.visible.insert(symbol.to_string(), 0);
        state.series.insert(symbol.to_string(), bars);
    }

    /// Reveal the next timestamp. Returns false once the replay is over.
    pub fn advance(&self) -> bool {
        let mut state = self.write();
        let Some(next) = state.timeline.get(state.step).copied() else {
            return false;
        };
        state.step += 1;
        state.clock = Some(next);

        let symbols: Vec<String> = state.series.keys().cloned().collect();
        for symbol in symbols {
            let count = state
                .series
                .get(&symbol)
                .map(|bars| bars.partition_point(|b| b.timestamp <= next))
                .unwrap_or(0);
            let before = state.visible.insert(symbol.clone(), count).unwrap_or(0);
            if count > before {
                state.check_levels(&symbol);
            }
        }
        true
    }

    /// Advance until at least `bars` bars of every series are visible.
    pub fn reveal_until(&self, bars: usize) {
        loop {
            let done = {
                let state = self.read();
                state.visible.values().all(|v| *v >= bars)
            };
            if done || !self.advance() {
                break;
            }
        }
    }

    pub fn balance(&self) -> Decimal {
        self.read().balance
    }

    /// Every close booked so far, in order.
    pub fn history(&self) -> Vec<PaperFill> {
        self.read().history.clone()
    }

    pub fn clock(&self) -> Option<DateTime<Utc>> {
        self.read().clock
    }
}

#[cfg(test)]
impl PaperGateway {
    /// Append a bar to a symbol and check levels against it.
    pub fn push_bar(&self, symbol: &str, bar: PriceBar) {
        let mut state = self.write();
        state.clock = Some(bar.timestamp);
        let series = state.series.entry(symbol.to_string()).or_default();
        series.push(bar);
        let len = series.len();
        state.visible.insert(symbol.to_string(), len);
        state.check_levels(symbol);
    }

    pub fn disconnect(&self) {
        self.write().connected = false;
    }

    /// Reject the next `count` order placements.
    pub fn reject_next_orders(&self, count: u32) {
        self.write().reject_orders = count;
    }

    pub fn set_fail_modify(&self, fail: bool) {
        self.write().fail_modify = fail;
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn connect(&self) -> Result<ConnectionHandle, GatewayError> {
        let mut state = self.write();
        state.connected = true;
        Ok(ConnectionHandle {
            session_id: Uuid::new_v4().to_string(),
            server: "paper".to_string(),
            connected_at: state.clock.unwrap_or_else(Utc::now),
        })
    }

    async fn get_price_bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<PriceBar>, GatewayError> {
        let state = self.read();
        state.ensure_connected()?;
        let bars = state
            .series
            .get(symbol)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown symbol {symbol}")))?;
        let visible = state.visible.get(symbol).copied().unwrap_or(0);
        let start = visible.saturating_sub(count);
        Ok(bars[start..visible].to_vec())
    }

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        let state = self.read();
        state.ensure_connected()?;
        let equity = state.balance + state.floating_pnl();
        Ok(AccountSnapshot {
            balance: state.balance,
            equity,
            free_margin: equity,
            timestamp: state.clock.unwrap_or_else(Utc::now),
        })
    }

    async fn place_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Decimal,
        _kind: OrderKind,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<OrderRef, GatewayError> {
        let mut state = self.write();
        state.ensure_connected()?;
        if state.reject_orders > 0 {
            state.reject_orders -= 1;
            return Err(GatewayError::OrderRejected("requote".to_string()));
        }
        if quantity <= Decimal::ZERO {
            return Err(GatewayError::OrderRejected(format!("invalid volume {quantity}")));
        }

        let price = state.quote(symbol)?;
        if !direction.is_better(price, stop) || !direction.is_better(take_profit, price) {
            return Err(GatewayError::OrderRejected(format!(
                "invalid stops: price {price}, stop {stop}, take profit {take_profit}"
            )));
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.insert(
            ticket,
            PositionRef {
                ticket,
                symbol: symbol.to_string(),
                direction,
                quantity,
                open_price: price,
                stop_price: Some(stop),
                take_profit: Some(take_profit),
                profit: Decimal::ZERO,
            },
        );
        Ok(OrderRef {
            ticket,
            fill_price: price,
            filled_quantity: quantity,
        })
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop: Decimal,
        take_profit: Decimal,
    ) -> Result<(), GatewayError> {
        let mut state = self.write();
        state.ensure_connected()?;
        if state.fail_modify {
            return Err(GatewayError::Protocol("modify refused".to_string()));
        }
        let pos = state
            .positions
            .get_mut(&ticket)
            .ok_or_else(|| GatewayError::NotFound(format!("ticket {ticket}")))?;
        pos.stop_price = Some(stop);
        pos.take_profit = Some(take_profit);
        Ok(())
    }

    async fn close_position(&self, ticket: u64, quantity: Decimal) -> Result<(), GatewayError> {
        let mut state = self.write();
        state.ensure_connected()?;
        let symbol = state
            .positions
            .get(&ticket)
            .map(|p| p.symbol.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("ticket {ticket}")))?;
        let price = state.quote(&symbol)?;
        let at = state.clock.unwrap_or_else(Utc::now);
        state.realize(ticket, quantity, price, CloseReason::TimeExit, at);
        Ok(())
    }

    async fn get_open_positions(
        &self,
        filter: &PositionFilter,
    ) -> Result<Vec<PositionRef>, GatewayError> {
        let state = self.read();
        state.ensure_connected()?;
        Ok(state
            .positions
            .values()
            .filter(|p| filter.symbol.as_deref().map_or(true, |s| s == p.symbol))
            .map(|p| {
                let mut p = p.clone();
                if let Ok(price) = state.quote(&p.symbol) {
                    p.profit = p.direction.favorable_move(p.open_price, price)
                        * p.quantity
                        * state.contract_size(&p.symbol);
                }
                p
            })
            .collect())
    }
}
