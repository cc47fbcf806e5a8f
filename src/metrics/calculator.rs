//! Calculator for strategy performance: win rate, profit factor, drawdown,
//! Sharpe and Sortino.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{ClosedTrade, PerformanceMetrics};

/// Trading days per year used to annualize daily ratios.
const TRADING_DAYS: f64 = 252.0;

/// Computes [`PerformanceMetrics`] from closed legs.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Metrics for `trades` on an account that started at `starting_balance`.
    /// Trades are ordered by close time before anything is computed.
    pub fn calculate(trades: &[ClosedTrade], starting_balance: Decimal) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::empty();
        if trades.is_empty() {
            return metrics;
        }

        let mut sorted: Vec<&ClosedTrade> = trades.iter().collect();
        sorted.sort_by_key(|t| (t.closed_at, t.ticket));
        let pnls: Vec<Decimal> = sorted.iter().map(|t| t.pnl).collect();

        metrics.total_trades = sorted.len() as u32;
        Self::calculate_pnl_metrics(&mut metrics, &pnls);
        Self::calculate_drawdown(&mut metrics, &pnls, starting_balance);
        Self::calculate_sharpe_sortino(&mut metrics, &sorted, starting_balance);
        Self::calculate_time_metrics(&mut metrics, &sorted);

        metrics.calculated_at = Utc::now();
        metrics
    }

    fn calculate_pnl_metrics(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|p| **p > Decimal::ZERO);
        // break-even legs count as neither
        let losses: Vec<Decimal> = losses.into_iter().filter(|p| *p < Decimal::ZERO).collect();

        metrics.winning_trades = wins.len() as u32;
        metrics.losing_trades = losses.len() as u32;
        metrics.total_pnl = pnls.iter().copied().sum();
        metrics.win_rate = wins.len() as f64 / pnls.len() as f64;

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            metrics.avg_win = gross_profit / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            metrics.avg_loss = gross_loss / Decimal::from(losses.len() as u32);
        }

        if gross_loss > Decimal::ZERO {
            metrics.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        } else if gross_profit > Decimal::ZERO {
            metrics.profit_factor = f64::INFINITY;
        }

        metrics.expectancy = metrics.total_pnl / Decimal::from(pnls.len() as u32);
    }

    /// Peak-to-trough decline of the realized equity curve.
    fn calculate_drawdown(metrics: &mut PerformanceMetrics, pnls: &[Decimal], start: Decimal) {
        let mut equity = start;
        let mut peak = start;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for pnl in pnls {
            equity += pnl;
            peak = peak.max(equity);

            let dd = peak - equity;
            max_dd = max_dd.max(dd);
            if peak > Decimal::ZERO {
                let dd_pct = dd.to_f64().unwrap_or(0.0) / peak.to_f64().unwrap_or(1.0);
                max_dd_pct = max_dd_pct.max(dd_pct);
            }
        }

        metrics.max_drawdown = max_dd_pct;
        metrics.max_drawdown_abs = max_dd;
    }

    /// Ratios over daily returns, with days bucketed by close date.
    fn calculate_sharpe_sortino(
        metrics: &mut PerformanceMetrics,
        trades: &[&ClosedTrade],
        start: Decimal,
    ) {
        let mut daily: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        for trade in trades {
            *daily.entry(trade.closed_at.date_naive()).or_default() += trade.pnl;
        }
        if daily.len() < 2 {
            return;
        }

        let mut equity = start;
        let mut returns = Vec::with_capacity(daily.len());
        for pnl in daily.values() {
            if equity > Decimal::ZERO {
                returns.push((*pnl / equity).to_f64().unwrap_or(0.0));
            }
            equity += *pnl;
        }
        if returns.len() < 2 {
            return;
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if std_dev > 0.0 {
            metrics.sharpe_ratio = mean / std_dev * TRADING_DAYS.sqrt();
        }

        let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>()
            / returns.len() as f64)
            .sqrt();
        if downside > 0.0 {
            metrics.sortino_ratio = mean / downside * TRADING_DAYS.sqrt();
        }
    }

    fn calculate_time_metrics(metrics: &mut PerformanceMetrics, trades: &[&ClosedTrade]) {
        let hours: Vec<f64> = trades.iter().map(|t| t.holding_hours()).collect();
        metrics.avg_holding_hours = hours.iter().mean();

        let first_open = trades.iter().map(|t| t.opened_at).min();
        let last_close = trades.iter().map(|t| t.closed_at).max();
        if let (Some(first), Some(last)) = (first_open, last_close) {
            let days = (last - first).num_days().max(1) as f64;
            metrics.trades_per_day = trades.len() as f64 / days;
        }
    }
}
