//! Account snapshot as reported by the broker terminal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Point-in-time view of the trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Realized balance (closed trades only)
    pub balance: Decimal,

    /// Balance plus floating P&L of open positions
    pub equity: Decimal,

    /// Margin still available for new orders
    pub free_margin: Decimal,

    /// Terminal time of the snapshot
    pub timestamp: DateTime<Utc>,
}

impl AccountSnapshot {
    /// Floating P&L of open positions.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.equity - self.balance
    }
}
