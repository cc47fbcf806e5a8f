//! SQLite persistence for resuming after a restart.
//!
//! Stores:
//! - Bot state: drawdown guard, daily trade count, operator reset flag
//! - Open positions, one JSON document per position
//! - Journal of closed legs
//! - Equity curve
//!
//! Prices and money are stored as decimal strings so nothing is lost to
//! floating point; the equity curve is REAL since it is only charted.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::models::{AccountSnapshot, ClosedTrade, Direction, Position};
use crate::trading::{DrawdownState, GuardStatus};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Bot state row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotState {
    pub id: i64,
    pub peak_equity: Option<String>,
    pub drawdown_pct: Option<String>,
    pub guard_status: String,
    pub trading_day: Option<String>,
    pub halted_at: Option<String>,
    pub daily_trades: i64,
    pub reset_requested: bool,
    pub is_running: bool,
    pub last_tick_at: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

/// Guard state plus the day's trade count, saved together every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardSnapshot {
    pub state: DrawdownState,
    pub daily_trades: u32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    position_id: String,
    ticket: i64,
    symbol: String,
    direction: String,
    leg_index: i64,
    quantity: String,
    entry_price: String,
    exit_price: String,
    pnl: String,
    reason: String,
    opened_at: String,
    closed_at: String,
}

impl TradeRow {
    fn into_trade(self) -> Result<ClosedTrade> {
        Ok(ClosedTrade {
            position_id: self.position_id.parse().context("Invalid position id")?,
            ticket: self.ticket as u64,
            direction: match self.direction.as_str() {
                "LONG" => Direction::Long,
                "SHORT" => Direction::Short,
                other => anyhow::bail!("Invalid direction '{}'", other),
            },
            leg_index: self.leg_index as usize,
            quantity: parse_decimal(&self.quantity)?,
            entry_price: parse_decimal(&self.entry_price)?,
            exit_price: parse_decimal(&self.exit_price)?,
            pnl: parse_decimal(&self.pnl)?,
            reason: serde_json::from_value(serde_json::Value::String(self.reason))
                .context("Invalid close reason")?,
            opened_at: parse_time(&self.opened_at)?,
            closed_at: parse_time(&self.closed_at)?,
            symbol: self.symbol,
        })
    }
}

/// Equity curve point.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub id: i64,
    pub timestamp: String,
    pub balance: f64,
    pub equity: f64,
    pub drawdown_pct: f64,
    pub open_positions: i64,
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal '{}'", s))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

impl Database {
    /// Open (creating if needed) the database at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL '{}'", database_url))?
            .create_if_missing(true);

        // every in-memory connection is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                peak_equity TEXT,
                drawdown_pct TEXT,
                guard_status TEXT NOT NULL DEFAULT 'normal',
                trading_day TEXT,
                halted_at TEXT,
                daily_trades INTEGER NOT NULL DEFAULT 0,
                reset_requested INTEGER NOT NULL DEFAULT 0,
                is_running INTEGER NOT NULL DEFAULT 0,
                last_tick_at TEXT,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                ticket INTEGER PRIMARY KEY,
                position_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                leg_index INTEGER NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                pnl TEXT NOT NULL,
                reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                balance REAL NOT NULL,
                equity REAL NOT NULL,
                drawdown_pct REAL NOT NULL DEFAULT 0,
                open_positions INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_closed ON trades(closed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_equity_curve_time ON equity_curve(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Bot State ====================

    /// Ensure the state row exists and mark the bot running.
    pub async fn init_bot_state(&self) -> Result<BotState> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, is_running, started_at, updated_at)
            VALUES (1, 1, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                is_running = 1,
                started_at = datetime('now'),
                updated_at = datetime('now')
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.get_bot_state().await
    }

    pub async fn get_bot_state(&self) -> Result<BotState> {
        sqlx::query_as::<_, BotState>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("Bot state not initialized")
    }

    /// Persisted guard state, if a run has saved one.
    pub async fn load_guard_state(&self) -> Result<Option<GuardSnapshot>> {
        let Some(row) = sqlx::query_as::<_, BotState>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let (Some(peak), Some(day)) = (row.peak_equity, row.trading_day) else {
            return Ok(None);
        };

        let state = DrawdownState {
            peak_equity: parse_decimal(&peak)?,
            current_drawdown_pct: row
                .drawdown_pct
                .as_deref()
                .map(parse_decimal)
                .transpose()?
                .unwrap_or(Decimal::ZERO),
            status: row
                .guard_status
                .parse::<GuardStatus>()
                .map_err(anyhow::Error::msg)?,
            trading_day: NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .with_context(|| format!("Invalid trading day '{}'", day))?,
            halted_at: row.halted_at.as_deref().map(parse_time).transpose()?,
        };
        Ok(Some(GuardSnapshot {
            state,
            daily_trades: row.daily_trades.max(0) as u32,
        }))
    }

    pub async fn save_guard_state(&self, snapshot: &GuardSnapshot) -> Result<()> {
        let state = &snapshot.state;
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, peak_equity, drawdown_pct, guard_status, trading_day,
                                   halted_at, daily_trades, last_tick_at, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                peak_equity = excluded.peak_equity,
                drawdown_pct = excluded.drawdown_pct,
                guard_status = excluded.guard_status,
                trading_day = excluded.trading_day,
                halted_at = excluded.halted_at,
                daily_trades = excluded.daily_trades,
                last_tick_at = datetime('now'),
                updated_at = datetime('now')
            "#,
        )
        .bind(state.peak_equity.to_string())
        .bind(state.current_drawdown_pct.to_string())
        .bind(state.status.as_str())
        .bind(state.trading_day.format("%Y-%m-%d").to_string())
        .bind(state.halted_at.map(|t| t.to_rfc3339()))
        .bind(snapshot.daily_trades as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Ask a running bot to reset its drawdown guard on the next tick.
    pub async fn request_drawdown_reset(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, reset_requested) VALUES (1, 1)
            ON CONFLICT(id) DO UPDATE SET reset_requested = 1, updated_at = datetime('now')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Consume a pending reset request.
    pub async fn take_reset_request(&self) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE bot_state SET reset_requested = 0, updated_at = datetime('now') WHERE id = 1 AND reset_requested = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_bot_stopped(&self) -> Result<()> {
        sqlx::query("UPDATE bot_state SET is_running = 0, updated_at = datetime('now') WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Positions ====================

    /// Replace the stored set of open positions.
    pub async fn save_positions(&self, positions: &[Position]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM positions").execute(&mut *tx).await?;

        for position in positions {
            let body = serde_json::to_string(position).context("Failed to serialize position")?;
            sqlx::query(
                "INSERT INTO positions (id, symbol, state, body, updated_at) VALUES (?, ?, ?, ?, datetime('now'))",
            )
            .bind(position.id.to_string())
            .bind(&position.symbol)
            .bind(position.state.as_str())
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to save positions")?;
        Ok(())
    }

    pub async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT body FROM positions ORDER BY updated_at")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch positions")?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).context("Failed to parse stored position"))
            .collect()
    }

    // ==================== Trade Journal ====================

    /// Append closed legs. A ticket already journaled is ignored.
    pub async fn record_trades(&self, trades: &[ClosedTrade]) -> Result<()> {
        for trade in trades {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO trades (
                    ticket, position_id, symbol, direction, leg_index, quantity,
                    entry_price, exit_price, pnl, reason, opened_at, closed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(trade.ticket as i64)
            .bind(trade.position_id.to_string())
            .bind(&trade.symbol)
            .bind(trade.direction.as_str())
            .bind(trade.leg_index as i64)
            .bind(trade.quantity.to_string())
            .bind(trade.entry_price.to_string())
            .bind(trade.exit_price.to_string())
            .bind(trade.pnl.to_string())
            .bind(trade.reason.as_str())
            .bind(trade.opened_at.to_rfc3339())
            .bind(trade.closed_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Journal in close order.
    pub async fn get_trades(&self) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades ORDER BY closed_at, ticket")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch trades")?;

        rows.into_iter().map(TradeRow::into_trade).collect()
    }

    // ==================== Equity Curve ====================

    pub async fn record_equity_point(
        &self,
        account: &AccountSnapshot,
        drawdown_pct: Decimal,
        open_positions: usize,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_curve (timestamp, balance, equity, drawdown_pct, open_positions)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(account.timestamp.to_rfc3339())
        .bind(account.balance.to_f64().unwrap_or_default())
        .bind(account.equity.to_f64().unwrap_or_default())
        .bind(drawdown_pct.to_f64().unwrap_or_default())
        .bind(open_positions as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent points, newest first.
    pub async fn get_equity_curve(&self, limit: i64) -> Result<Vec<EquityPoint>> {
        sqlx::query_as::<_, EquityPoint>(
            "SELECT * FROM equity_curve ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch equity curve")
    }

    /// Largest peak-to-trough equity decline over the stored curve, as a
    /// fraction.
    pub async fn calculate_max_drawdown(&self) -> Result<f64> {
        let points = self.get_equity_curve(10_000).await?;

        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;
        for point in points.into_iter().rev() {
            peak = peak.max(point.equity);
            if peak > 0.0 {
                max_dd = max_dd.max((peak - point.equity) / peak);
            }
        }
        Ok(max_dd)
    }
}
