//! Closed-leg trade record used for the journal and performance metrics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::{CloseReason, Position, PositionLeg};
use super::signal::Direction;

/// Realized result of one closed position leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub leg_index: usize,
    pub ticket: u64,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,

    /// Realized P&L in account currency
    pub pnl: Decimal,

    pub reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    /// Record for one closed leg. `None` while the leg is still open.
    pub fn from_leg(position: &Position, leg: &PositionLeg) -> Option<ClosedTrade> {
        if !leg.closed {
            return None;
        }
        let exit_price = leg.exit_price?;
        let pnl = leg.realized_pnl(position.direction, position.contract_size)?;
        Some(ClosedTrade {
            position_id: position.id,
            symbol: position.symbol.clone(),
            direction: position.direction,
            leg_index: leg.index,
            ticket: leg.ticket,
            quantity: leg.quantity,
            entry_price: leg.entry_price,
            exit_price,
            pnl,
            reason: leg.close_reason.unwrap_or(CloseReason::Reconciled),
            opened_at: position.opened_at,
            closed_at: leg.closed_at.unwrap_or(position.opened_at),
        })
    }

    /// One record per closed leg of a position.
    pub fn from_position(position: &Position) -> Vec<ClosedTrade> {
        position
            .legs
            .iter()
            .filter_map(|leg| Self::from_leg(position, leg))
            .collect()
    }

    /// Holding time in hours.
    pub fn holding_hours(&self) -> f64 {
        (self.closed_at - self.opened_at).num_minutes() as f64 / 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_records_only_closed_legs() {
        let now = Utc::now();
        let mut pos = Position::pending(
            "USDJPY".to_string(),
            Direction::Short,
            dec!(150.000),
            dec!(150.500),
            dec!(1000),
            now,
        );
        pos.legs.push(PositionLeg::new(0, 1, dec!(1), dec!(150.000), dec!(150.500), dec!(149.250)));
        pos.legs.push(PositionLeg::new(1, 2, dec!(1), dec!(150.000), dec!(150.500), dec!(148.750)));
        pos.settle_fills(now).unwrap();
        pos.close_leg(1, CloseReason::TakeProfit, dec!(149.250), now).unwrap();

        let trades = ClosedTrade::from_position(&pos);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pnl, dec!(750));
        assert_eq!(trades[0].reason, CloseReason::TakeProfit);
    }
}
