//! Performance metrics for a series of closed trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Summary statistics over closed trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// When these metrics were calculated
    pub calculated_at: DateTime<Utc>,

    // === Basic Statistics ===
    /// Closed legs counted as trades
    pub total_trades: u32,

    /// Total realized P&L
    pub total_pnl: Decimal,

    // === Win/Loss Metrics ===
    pub winning_trades: u32,
    pub losing_trades: u32,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Average profit on winning trades
    pub avg_win: Decimal,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: Decimal,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    /// Expected P&L per trade
    pub expectancy: Decimal,

    // === Risk Metrics ===
    /// Maximum drawdown of the realized equity curve (0.0 to 1.0)
    pub max_drawdown: f64,

    /// Maximum drawdown in account currency
    pub max_drawdown_abs: Decimal,

    /// Annualized Sharpe ratio of per-trade returns
    pub sharpe_ratio: f64,

    /// Annualized Sortino ratio of per-trade returns
    pub sortino_ratio: f64,

    // === Time-Based Metrics ===
    pub avg_holding_hours: f64,
    pub trades_per_day: f64,
}

impl PerformanceMetrics {
    pub fn empty() -> Self {
        Self {
            calculated_at: Utc::now(),
            total_trades: 0,
            total_pnl: Decimal::ZERO,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            profit_factor: 0.0,
            expectancy: Decimal::ZERO,
            max_drawdown: 0.0,
            max_drawdown_abs: Decimal::ZERO,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            avg_holding_hours: 0.0,
            trades_per_day: 0.0,
        }
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::empty()
    }
}
