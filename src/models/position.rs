//! Position model: one logical trade made of one or more broker legs.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::signal::Direction;
use crate::error::EngineError;

/// Aggregate lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Pending,
    Active,
    PartiallyClosed,
    Closed,
    CancelledBeforeFill,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Pending => "pending",
            PositionState::Active => "active",
            PositionState::PartiallyClosed => "partially_closed",
            PositionState::Closed => "closed",
            PositionState::CancelledBeforeFill => "cancelled_before_fill",
        }
    }

    /// Closed and CancelledBeforeFill never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::CancelledBeforeFill)
    }

    /// States the monitoring tick advances.
    pub fn is_live(&self) -> bool {
        matches!(self, PositionState::Active | PositionState::PartiallyClosed)
    }

    fn can_transition_to(&self, next: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, CancelledBeforeFill)
                | (Active, PartiallyClosed)
                | (Active, Closed)
                | (PartiallyClosed, Closed)
        )
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a leg was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    BreakevenStop,
    TimeExit,
    /// Gone from the broker while we were disconnected; reason unknown
    Reconciled,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::BreakevenStop => "breakeven_stop",
            CloseReason::TimeExit => "time_exit",
            CloseReason::Reconciled => "reconciled",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broker order belonging to a position, with its own take-profit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLeg {
    /// Position in the take-profit ladder (0 = nearest target)
    pub index: usize,

    /// Broker ticket of the filled order
    pub ticket: u64,

    pub quantity: Decimal,

    /// Actual fill price
    pub entry_price: Decimal,

    /// Current stop; moved by trailing and breakeven
    pub stop_price: Decimal,

    /// Fixed at creation
    pub take_profit: Decimal,

    pub closed: bool,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<Decimal>,
    pub closed_at: Option<DateTime<Utc>>,

    /// Breakeven shift already applied
    #[serde(default)]
    pub breakeven_applied: bool,

    /// Trailing stop has moved the stop at least once
    #[serde(default)]
    pub trailing_active: bool,
}

impl PositionLeg {
    pub fn new(
        index: usize,
        ticket: u64,
        quantity: Decimal,
        entry_price: Decimal,
        stop_price: Decimal,
        take_profit: Decimal,
    ) -> Self {
        Self {
            index,
            ticket,
            quantity,
            entry_price,
            stop_price,
            take_profit,
            closed: false,
            close_reason: None,
            exit_price: None,
            closed_at: None,
            breakeven_applied: false,
            trailing_active: false,
        }
    }

    /// Realized P&L of a closed leg in account currency.
    pub fn realized_pnl(&self, direction: Direction, contract_size: Decimal) -> Option<Decimal> {
        self.exit_price.map(|exit| {
            direction.favorable_move(self.entry_price, exit) * self.quantity * contract_size
        })
    }

    /// Floating P&L of an open leg at `price`.
    pub fn unrealized_pnl(
        &self,
        direction: Direction,
        price: Decimal,
        contract_size: Decimal,
    ) -> Decimal {
        if self.closed {
            return Decimal::ZERO;
        }
        direction.favorable_move(self.entry_price, price) * self.quantity * contract_size
    }
}

/// A logical position owned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,

    /// Planned entry price (legs record their own fills)
    pub entry_price: Decimal,

    /// Stop price at creation, before any trailing or breakeven
    pub initial_stop: Decimal,

    /// P&L multiplier per lot per unit of price
    pub contract_size: Decimal,

    /// ATR at signal time, the unit for trailing and breakeven thresholds
    pub atr_at_entry: Option<f64>,

    pub legs: Vec<PositionLeg>,
    pub state: PositionState,

    pub signal_id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a pending position with no legs, no ATR reference and no
    /// originating signal.
    pub fn pending(
        symbol: String,
        direction: Direction,
        entry_price: Decimal,
        initial_stop: Decimal,
        contract_size: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            direction,
            entry_price,
            initial_stop,
            contract_size,
            atr_at_entry: None,
            legs: Vec::new(),
            state: PositionState::Pending,
            signal_id: Uuid::nil(),
            opened_at,
            closed_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: PositionState) -> Result<(), EngineError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Resolve the pending state once every leg has been attempted.
    pub fn settle_fills(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.legs.is_empty() {
            self.transition(PositionState::CancelledBeforeFill)?;
            self.closed_at = Some(now);
        } else {
            self.transition(PositionState::Active)?;
        }
        Ok(())
    }

    /// Mark a leg closed and recompute the aggregate state.
    /// Closing an already closed leg is a no-op.
    pub fn close_leg(
        &mut self,
        ticket: u64,
        reason: CloseReason,
        exit_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let Some(leg) = self.legs.iter_mut().find(|l| l.ticket == ticket) else {
            return Ok(false);
        };
        if leg.closed {
            return Ok(false);
        }
        leg.closed = true;
        leg.close_reason = Some(reason);
        leg.exit_price = Some(exit_price);
        leg.closed_at = Some(now);

        if self.open_legs().next().is_none() {
            self.transition(PositionState::Closed)?;
            self.closed_at = Some(now);
        } else if self.legs.len() > 1 {
            self.transition(PositionState::PartiallyClosed)?;
        }
        Ok(true)
    }

    pub fn open_legs(&self) -> impl Iterator<Item = &PositionLeg> {
        self.legs.iter().filter(|l| !l.closed)
    }

    pub fn open_quantity(&self) -> Decimal {
        self.open_legs().map(|l| l.quantity).sum()
    }

    /// Quantity-weighted average fill price across all legs.
    pub fn average_fill(&self) -> Decimal {
        let total: Decimal = self.legs.iter().map(|l| l.quantity).sum();
        if total.is_zero() {
            return self.entry_price;
        }
        self.legs.iter().map(|l| l.entry_price * l.quantity).sum::<Decimal>() / total
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.legs
            .iter()
            .map(|l| l.unrealized_pnl(self.direction, price, self.contract_size))
            .sum()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.legs
            .iter()
            .filter_map(|l| l.realized_pnl(self.direction, self.contract_size))
            .sum()
    }

    /// Time since the position was opened.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// True once a take-profit leg has filled.
    pub fn has_taken_profit(&self) -> bool {
        self.legs
            .iter()
            .any(|l| l.close_reason == Some(CloseReason::TakeProfit))
    }
}
