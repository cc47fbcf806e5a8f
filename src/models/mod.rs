//! Data models for bars, signals, positions, accounts and trade results.

mod account;
mod bar;
mod instrument;
mod metrics;
mod position;
mod signal;
mod trade;

pub use account::AccountSnapshot;
pub use bar::{PriceBar, Timeframe};
pub use instrument::Instrument;
pub use metrics::PerformanceMetrics;
pub use position::{CloseReason, Position, PositionLeg, PositionState};
pub use signal::{Direction, Signal, SignalMethod};
pub use trade::ClosedTrade;
