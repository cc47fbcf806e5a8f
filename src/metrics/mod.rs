//! Performance metrics over the closed-trade journal.

mod calculator;

pub use calculator::MetricsCalculator;
