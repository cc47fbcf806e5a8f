//! Trading logic: signal generation, risk sizing, position lifecycle and
//! the drawdown guard.

mod config;
mod drawdown;
mod lifecycle;
mod risk_sizer;
mod signal_generator;
pub(crate) mod stops;

pub use config::{GatewaySettings, TradingConfig};
#[cfg(test)]
pub use config::RawConfig;
pub use drawdown::{DrawdownGuard, DrawdownState, GuardStatus, ResetReason};
pub use lifecycle::{MarketState, PositionManager};
pub use risk_sizer::{MarketRegime, RiskSizer};
pub use signal_generator::SignalGenerator;
