//! Trade signal emitted by the signal generator.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Price distance moved in this direction's favour (negative when adverse).
    pub fn favorable_move(&self, from: Decimal, to: Decimal) -> Decimal {
        (to - from) * self.sign()
    }

    /// True if `candidate` is strictly better for the position than `current`,
    /// i.e. higher for longs and lower for shorts.
    pub fn is_better(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Direction::Long => candidate > current,
            Direction::Short => candidate < current,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection method that produced a signal, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMethod {
    Crossover,
    TrendConfirmation,
    Momentum,
    Pullback,
    Breakout,
}

impl SignalMethod {
    /// All methods in evaluation order.
    pub const PRIORITY: [SignalMethod; 5] = [
        SignalMethod::Crossover,
        SignalMethod::TrendConfirmation,
        SignalMethod::Momentum,
        SignalMethod::Pullback,
        SignalMethod::Breakout,
    ];

    /// Weight used in the confidence score.
    pub fn weight(&self) -> f64 {
        match self {
            SignalMethod::Crossover => 1.0,
            SignalMethod::TrendConfirmation => 0.85,
            SignalMethod::Momentum => 0.75,
            SignalMethod::Pullback => 0.6,
            SignalMethod::Breakout => 0.7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalMethod::Crossover => "crossover",
            SignalMethod::TrendConfirmation => "trend_confirmation",
            SignalMethod::Momentum => "momentum",
            SignalMethod::Pullback => "pullback",
            SignalMethod::Breakout => "breakout",
        }
    }
}

impl fmt::Display for SignalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directional trade signal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,

    /// Confidence in [0, 1]
    pub confidence: f64,

    /// Winning method first, then other methods that agreed
    pub methods: Vec<SignalMethod>,

    /// Human-readable explanation per contributing condition
    pub reasons: Vec<String>,

    /// Open time of the bar the signal was computed on
    pub bar_time: DateTime<Utc>,

    pub generated_at: DateTime<Utc>,
}

impl Signal {
    /// The method that won the priority ordering.
    pub fn primary_method(&self) -> Option<SignalMethod> {
        self.methods.first().copied()
    }
}
