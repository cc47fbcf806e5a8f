//! Account-wide drawdown circuit breaker.
//!
//! The peak is the high-water mark of balance net of open losses: open
//! profit cannot inflate it, and a floating loss carried through a reset is
//! not counted again. Drawdown is measured on equity. Once halted, the guard
//! stays halted until an explicit reset, even if equity recovers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::AccountSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
    Normal,
    Halted,
}

impl GuardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardStatus::Normal => "normal",
            GuardStatus::Halted => "halted",
        }
    }
}

impl fmt::Display for GuardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(GuardStatus::Normal),
            "halted" => Ok(GuardStatus::Halted),
            other => Err(format!("unknown guard status '{}'", other)),
        }
    }
}

/// Why the guard was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    NewTradingDay,
    Operator,
}

/// Persistable guard state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownState {
    /// Highest watermark (lower of balance and equity) since the last reset
    pub peak_equity: Decimal,

    /// (peak - equity) / peak in percent, never negative
    pub current_drawdown_pct: Decimal,

    pub status: GuardStatus,

    /// UTC date of the account snapshot the guard last saw
    pub trading_day: NaiveDate,

    pub halted_at: Option<DateTime<Utc>>,
}

pub struct DrawdownGuard {
    max_drawdown_percent: Decimal,
    state: DrawdownState,
}

impl DrawdownGuard {
    /// Start a fresh guard seeded from the account's watermark.
    pub fn new(max_drawdown_percent: Decimal, account: &AccountSnapshot) -> Self {
        Self {
            max_drawdown_percent,
            state: DrawdownState {
                peak_equity: watermark(account),
                current_drawdown_pct: Decimal::ZERO,
                status: GuardStatus::Normal,
                trading_day: account.timestamp.date_naive(),
                halted_at: None,
            },
        }
    }

    /// Resume from persisted state.
    pub fn restore(max_drawdown_percent: Decimal, state: DrawdownState) -> Self {
        Self {
            max_drawdown_percent,
            state,
        }
    }

    pub fn state(&self) -> &DrawdownState {
        &self.state
    }

    pub fn status(&self) -> GuardStatus {
        self.state.status
    }

    /// New positions may be opened.
    pub fn can_open(&self) -> bool {
        self.state.status == GuardStatus::Normal
    }

    /// Fold in a fresh account snapshot.
    pub fn update(&mut self, account: &AccountSnapshot) -> GuardStatus {
        let mark = watermark(account);
        if mark > self.state.peak_equity {
            self.state.peak_equity = mark;
        }
        self.state.current_drawdown_pct = drawdown_pct(self.state.peak_equity, account.equity);

        if self.state.status == GuardStatus::Normal
            && self.state.current_drawdown_pct >= self.max_drawdown_percent
        {
            self.state.status = GuardStatus::Halted;
            self.state.halted_at = Some(account.timestamp);
            warn!(
                peak = %self.state.peak_equity,
                equity = %account.equity,
                drawdown_pct = %self.state.current_drawdown_pct.round_dp(2),
                limit_pct = %self.max_drawdown_percent,
                "Drawdown limit reached, new entries halted"
            );
        }
        self.state.status
    }

    /// The snapshot falls on a later UTC date than the guard's trading day.
    pub fn is_new_trading_day(&self, account: &AccountSnapshot) -> bool {
        account.timestamp.date_naive() > self.state.trading_day
    }

    /// Roll to the snapshot's trading day. A halted guard is reset; a normal
    /// one keeps its peak. Returns true if the day changed.
    pub fn roll_day(&mut self, account: &AccountSnapshot) -> bool {
        if !self.is_new_trading_day(account) {
            return false;
        }
        if self.state.status == GuardStatus::Halted {
            self.reset(account, ResetReason::NewTradingDay);
        } else {
            self.state.trading_day = account.timestamp.date_naive();
        }
        true
    }

    /// Return to normal with the peak re-seeded from the current watermark,
    /// so the floating loss at reset time starts at zero drawdown.
    pub fn reset(&mut self, account: &AccountSnapshot, reason: ResetReason) {
        let was = self.state.status;
        let peak = watermark(account);
        self.state = DrawdownState {
            peak_equity: peak,
            current_drawdown_pct: drawdown_pct(peak, account.equity),
            status: GuardStatus::Normal,
            trading_day: account.timestamp.date_naive(),
            halted_at: None,
        };
        info!(
            reason = ?reason,
            previous = %was,
            peak = %peak,
            "Drawdown guard reset"
        );
    }
}

/// Balance, lowered by any open loss.
fn watermark(account: &AccountSnapshot) -> Decimal {
    account.balance.min(account.equity)
}

fn drawdown_pct(peak: Decimal, equity: Decimal) -> Decimal {
    if peak <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((peak - equity) / peak * dec!(100)).max(Decimal::ZERO)
}
