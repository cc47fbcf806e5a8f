//! Trading configuration.
//!
//! The TOML file is parsed into [`RawConfig`] and validated once into an
//! immutable [`TradingConfig`], which the engine shares as
//! `Arc<TradingConfig>`. Reloading means building a new value.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::indicators::IndicatorConfig;
use crate::models::{Instrument, Timeframe};

/// Account risk limits and adaptive sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// Equity percentage risked per position before the adaptive multiplier
    pub risk_percent: Decimal,

    /// Hard cap on the effective risk percentage
    pub max_risk_percent: Decimal,

    /// New positions allowed per trading day (0 = unlimited)
    pub max_daily_trades: u32,

    /// Drawdown from peak balance that halts new entries
    pub max_drawdown_percent: Decimal,

    /// Live positions allowed per symbol at once
    pub max_positions_per_symbol: usize,

    /// Signals below this confidence are discarded
    pub min_confidence: f64,

    pub adaptive: AdaptiveRiskSettings,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            risk_percent: dec!(1.0),
            max_risk_percent: dec!(2.0),
            max_daily_trades: 10,
            max_drawdown_percent: dec!(10.0),
            max_positions_per_symbol: 1,
            min_confidence: 0.0,
            adaptive: AdaptiveRiskSettings::default(),
        }
    }
}

/// Scales the base risk by market regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRiskSettings {
    pub enabled: bool,
    pub min_multiplier: Decimal,
    pub max_multiplier: Decimal,

    /// ADX at or below which the minimum multiplier applies
    pub weak_adx: f64,

    /// ADX at or above which the maximum multiplier applies
    pub strong_adx: f64,

    /// Bars used to measure trend consistency
    pub trend_lookback: usize,
}

impl Default for AdaptiveRiskSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_multiplier: dec!(0.5),
            max_multiplier: dec!(1.5),
            weak_adx: 20.0,
            strong_adx: 40.0,
            trend_lookback: 20,
        }
    }
}

/// Stop-loss placement. Exactly one mode must be enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSettings {
    pub atr_enabled: bool,
    pub atr_multiplier: Decimal,
    pub fixed_pips_enabled: bool,
    pub stop_loss_pips: Decimal,
}

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            atr_enabled: true,
            atr_multiplier: dec!(2.0),
            fixed_pips_enabled: false,
            stop_loss_pips: dec!(30),
        }
    }
}

impl StopSettings {
    fn validate(&self, scope: &str) -> Result<(), EngineError> {
        match (self.atr_enabled, self.fixed_pips_enabled) {
            (true, true) => Err(EngineError::invalid_config(format!(
                "{scope}: ATR and fixed-pip stops are both enabled"
            ))),
            (false, false) => Err(EngineError::invalid_config(format!(
                "{scope}: no stop-loss mode enabled"
            ))),
            (true, false) if self.atr_multiplier <= Decimal::ZERO => Err(
                EngineError::invalid_config(format!("{scope}: atr_multiplier must be positive")),
            ),
            (false, true) if self.stop_loss_pips <= Decimal::ZERO => Err(
                EngineError::invalid_config(format!("{scope}: stop_loss_pips must be positive")),
            ),
            _ => Ok(()),
        }
    }
}

/// How take-profit levels are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeProfitMode {
    /// Multiples of the stop distance
    RiskReward,
    /// Fixed pip distances from entry
    Pips,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitSettings {
    pub mode: TakeProfitMode,
    pub reward_ratios: Vec<Decimal>,
    pub tp_pips: Vec<Decimal>,
}

impl Default for TakeProfitSettings {
    fn default() -> Self {
        Self {
            mode: TakeProfitMode::RiskReward,
            reward_ratios: vec![dec!(1.5), dec!(2.5), dec!(4.0)],
            tp_pips: vec![dec!(30), dec!(60), dec!(100)],
        }
    }
}

impl TakeProfitSettings {
    /// The ladder in use for the configured mode.
    pub fn levels(&self) -> &[Decimal] {
        match self.mode {
            TakeProfitMode::RiskReward => &self.reward_ratios,
            TakeProfitMode::Pips => &self.tp_pips,
        }
    }
}

/// Split-order entry: one broker order per take-profit level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitSettings {
    pub enabled: bool,
    pub legs: usize,

    /// Percentage of the total quantity per leg; must sum to 100
    pub weights: Vec<Decimal>,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            legs: 3,
            weights: vec![dec!(40), dec!(30), dec!(30)],
        }
    }
}

/// Signal detection methods and their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    pub crossover: bool,
    pub trend_confirmation: bool,
    pub momentum: bool,
    pub pullback: bool,
    pub breakout: bool,

    /// Bars over which the slow MA slope is measured
    pub trend_slope_lookback: usize,

    /// RSI at or below which a rising RSI counts as recovering (long)
    pub momentum_oversold: f64,

    /// RSI at or above which a falling RSI counts as retreating (short)
    pub momentum_overbought: f64,

    /// Distance from the fast MA (percent of price) that counts as a touch
    pub pullback_tolerance_pct: f64,

    /// Bars in the breakout range, excluding the current bar
    pub breakout_lookback: usize,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            crossover: true,
            trend_confirmation: true,
            momentum: true,
            pullback: true,
            breakout: true,
            trend_slope_lookback: 5,
            momentum_oversold: 35.0,
            momentum_overbought: 65.0,
            pullback_tolerance_pct: 0.1,
            breakout_lookback: 20,
        }
    }
}

/// Filters every fired method must pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub rsi_enabled: bool,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,

    pub macd_enabled: bool,
    pub macd_min_histogram: f64,

    pub adx_enabled: bool,
    pub adx_min: f64,

    pub volume_enabled: bool,

    /// Current volume divided by its moving average
    pub volume_min_ratio: f64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            rsi_enabled: true,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            macd_enabled: false,
            macd_min_histogram: 0.0,
            adx_enabled: true,
            adx_min: 20.0,
            volume_enabled: false,
            volume_min_ratio: 1.0,
        }
    }
}

/// Trailing stop, breakeven and time exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSettings {
    pub trailing_enabled: bool,

    /// Favourable move (in ATR) before trailing starts
    pub trailing_activation_atr: f64,

    /// Distance (in ATR) the stop trails behind price
    pub trailing_distance_atr: f64,

    /// Minimum stop improvement in pips before a modify is sent
    pub trailing_step_pips: Decimal,

    pub breakeven_enabled: bool,

    /// Favourable move (in ATR) that triggers the breakeven shift
    pub breakeven_trigger_atr: f64,

    /// Pips beyond entry the stop is moved to
    pub breakeven_offset_pips: Decimal,

    /// Move remaining legs to breakeven once the first take-profit fills
    pub breakeven_after_first_tp: bool,

    pub time_exit_enabled: bool,
    pub max_hold_hours: i64,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            trailing_enabled: true,
            trailing_activation_atr: 1.0,
            trailing_distance_atr: 1.5,
            trailing_step_pips: dec!(1),
            breakeven_enabled: true,
            breakeven_trigger_atr: 1.0,
            breakeven_offset_pips: dec!(1),
            breakeven_after_first_tp: true,
            time_exit_enabled: false,
            max_hold_hours: 72,
        }
    }
}

/// Terminal bridge connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub base_url: String,
    pub timeout_secs: u64,

    /// Extra attempts after a rejected order
    pub order_retries: u32,

    /// Upper bound on the reconnect backoff
    pub reconnect_max_secs: u64,

    /// Consecutive gateway failures that halt new orders
    pub failure_threshold: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8228".to_string(),
            timeout_secs: 10,
            order_retries: 2,
            reconnect_max_secs: 300,
            failure_threshold: 5,
        }
    }
}

/// Instrument block in the TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    pub digits: u32,
    pub point: Decimal,
    pub contract_size: Decimal,
    pub min_lot: Decimal,
    pub max_lot: Decimal,
    pub lot_step: Decimal,

    /// Replaces the global stop settings for this symbol
    #[serde(default)]
    pub stops: Option<StopSettings>,
}

/// Configuration as written in the TOML file, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub poll_interval_secs: u64,
    pub history_bars: usize,
    pub risk: RiskSettings,
    pub stops: StopSettings,
    pub take_profit: TakeProfitSettings,
    pub split: SplitSettings,
    pub indicators: IndicatorConfig,
    pub signals: SignalSettings,
    pub filters: FilterSettings,
    pub exits: ExitSettings,
    pub gateway: GatewaySettings,
    pub instruments: HashMap<String, InstrumentSettings>,
}

impl Default for RawConfig {
    fn default() -> Self {
        let mut instruments = HashMap::new();
        instruments.insert(
            "EURUSD".to_string(),
            InstrumentSettings {
                digits: 5,
                point: dec!(0.00001),
                contract_size: dec!(100000),
                min_lot: dec!(0.01),
                max_lot: dec!(50),
                lot_step: dec!(0.01),
                stops: None,
            },
        );
        Self {
            symbols: vec!["EURUSD".to_string()],
            timeframe: Timeframe::H1,
            poll_interval_secs: 60,
            history_bars: 200,
            risk: RiskSettings::default(),
            stops: StopSettings::default(),
            take_profit: TakeProfitSettings::default(),
            split: SplitSettings::default(),
            indicators: IndicatorConfig::default(),
            signals: SignalSettings::default(),
            filters: FilterSettings::default(),
            exits: ExitSettings::default(),
            gateway: GatewaySettings::default(),
            instruments,
        }
    }
}

/// Instrument with its resolved stop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSpec {
    pub instrument: Instrument,
    pub stops: StopSettings,
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub poll_interval_secs: u64,
    pub history_bars: usize,
    pub risk: RiskSettings,
    pub take_profit: TakeProfitSettings,
    pub split: SplitSettings,
    pub indicators: IndicatorConfig,
    pub signals: SignalSettings,
    pub filters: FilterSettings,
    pub exits: ExitSettings,
    pub gateway: GatewaySettings,
    instruments: HashMap<String, InstrumentSpec>,
}

impl TradingConfig {
    /// Read and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| EngineError::invalid_config(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Validate a raw configuration. Contradictions are rejected here so
    /// nothing downstream has to re-check them.
    pub fn from_raw(raw: RawConfig) -> Result<Self, EngineError> {
        if raw.symbols.is_empty() {
            return Err(EngineError::invalid_config("no symbols configured"));
        }
        if raw.poll_interval_secs == 0 {
            return Err(EngineError::invalid_config("poll_interval_secs must be positive"));
        }

        let ind = &raw.indicators;
        if ind.fast_ma_period == 0 || ind.fast_ma_period >= ind.slow_ma_period {
            return Err(EngineError::invalid_config(format!(
                "fast_ma_period ({}) must be positive and below slow_ma_period ({})",
                ind.fast_ma_period, ind.slow_ma_period
            )));
        }
        if ind.macd_fast == 0 || ind.macd_fast >= ind.macd_slow || ind.macd_signal == 0 {
            return Err(EngineError::invalid_config(
                "macd_fast must be positive and below macd_slow, macd_signal positive",
            ));
        }
        if [ind.rsi_period, ind.adx_period, ind.atr_period, ind.bollinger_period, ind.volume_ma_period]
            .contains(&0)
        {
            return Err(EngineError::invalid_config("indicator periods must be positive"));
        }
        if raw.history_bars < ind.warmup_bars() + 1 {
            return Err(EngineError::invalid_config(format!(
                "history_bars ({}) must exceed the indicator warm-up ({})",
                raw.history_bars,
                ind.warmup_bars()
            )));
        }

        let risk = &raw.risk;
        if risk.risk_percent <= Decimal::ZERO || risk.risk_percent > risk.max_risk_percent {
            return Err(EngineError::invalid_config(
                "risk_percent must be positive and not above max_risk_percent",
            ));
        }
        if risk.max_drawdown_percent <= Decimal::ZERO || risk.max_drawdown_percent >= dec!(100) {
            return Err(EngineError::invalid_config(
                "max_drawdown_percent must be between 0 and 100",
            ));
        }
        if risk.max_positions_per_symbol == 0 {
            return Err(EngineError::invalid_config("max_positions_per_symbol must be at least 1"));
        }
        if !(0.0..=1.0).contains(&risk.min_confidence) {
            return Err(EngineError::invalid_config("min_confidence must be within [0, 1]"));
        }
        let adaptive = &risk.adaptive;
        if adaptive.enabled
            && (adaptive.min_multiplier <= Decimal::ZERO
                || adaptive.min_multiplier > adaptive.max_multiplier
                || adaptive.weak_adx >= adaptive.strong_adx
                || adaptive.trend_lookback < 2)
        {
            return Err(EngineError::invalid_config(
                "adaptive risk needs 0 < min_multiplier <= max_multiplier, weak_adx < strong_adx and trend_lookback >= 2",
            ));
        }

        raw.stops.validate("stops")?;

        let levels = raw.take_profit.levels();
        if levels.is_empty() {
            return Err(EngineError::invalid_config("take-profit ladder is empty"));
        }
        if levels[0] <= Decimal::ZERO || levels.windows(2).any(|w| w[1] <= w[0]) {
            return Err(EngineError::invalid_config(
                "take-profit levels must be positive and strictly increasing",
            ));
        }

        if raw.split.enabled {
            let split = &raw.split;
            if split.legs < 2 || split.weights.len() != split.legs {
                return Err(EngineError::invalid_config(format!(
                    "split needs at least 2 legs and one weight per leg (legs = {}, weights = {})",
                    split.legs,
                    split.weights.len()
                )));
            }
            if levels.len() < split.legs {
                return Err(EngineError::invalid_config(format!(
                    "split uses {} legs but only {} take-profit levels are configured",
                    split.legs,
                    levels.len()
                )));
            }
            if split.weights.iter().any(|w| *w <= Decimal::ZERO) {
                return Err(EngineError::invalid_config("split weights must be positive"));
            }
            let sum: Decimal = split.weights.iter().copied().sum();
            if (sum - dec!(100)).abs() > dec!(0.01) {
                return Err(EngineError::invalid_config(format!(
                    "split weights sum to {sum}, expected 100"
                )));
            }
        }

        let filters = &raw.filters;
        if filters.rsi_oversold >= filters.rsi_overbought {
            return Err(EngineError::invalid_config("rsi_oversold must be below rsi_overbought"));
        }
        let signals = &raw.signals;
        if signals.momentum_oversold >= signals.momentum_overbought {
            return Err(EngineError::invalid_config(
                "momentum_oversold must be below momentum_overbought",
            ));
        }
        if signals.trend_slope_lookback == 0 || signals.breakout_lookback == 0 {
            return Err(EngineError::invalid_config(
                "trend_slope_lookback and breakout_lookback must be positive",
            ));
        }

        let exits = &raw.exits;
        if exits.trailing_enabled && exits.trailing_distance_atr <= 0.0 {
            return Err(EngineError::invalid_config("trailing_distance_atr must be positive"));
        }
        if exits.time_exit_enabled && exits.max_hold_hours <= 0 {
            return Err(EngineError::invalid_config("max_hold_hours must be positive"));
        }

        let mut instruments = HashMap::new();
        for symbol in &raw.symbols {
            let Some(settings) = raw.instruments.get(symbol) else {
                return Err(EngineError::invalid_config(format!(
                    "symbol {symbol} has no instrument specification"
                )));
            };
            if settings.point <= Decimal::ZERO
                || settings.contract_size <= Decimal::ZERO
                || settings.lot_step <= Decimal::ZERO
                || settings.min_lot <= Decimal::ZERO
                || settings.min_lot > settings.max_lot
            {
                return Err(EngineError::invalid_config(format!(
                    "instrument {symbol}: point, contract size and lot limits must be positive with min_lot <= max_lot"
                )));
            }
            let stops = settings.stops.clone().unwrap_or_else(|| raw.stops.clone());
            stops.validate(&format!("instruments.{symbol}.stops"))?;

            instruments.insert(
                symbol.clone(),
                InstrumentSpec {
                    instrument: Instrument {
                        symbol: symbol.clone(),
                        digits: settings.digits,
                        point: settings.point,
                        contract_size: settings.contract_size,
                        min_lot: settings.min_lot,
                        max_lot: settings.max_lot,
                        lot_step: settings.lot_step,
                    },
                    stops,
                },
            );
        }

        Ok(Self {
            symbols: raw.symbols,
            timeframe: raw.timeframe,
            poll_interval_secs: raw.poll_interval_secs,
            history_bars: raw.history_bars,
            risk: raw.risk,
            take_profit: raw.take_profit,
            split: raw.split,
            indicators: raw.indicators,
            signals: raw.signals,
            filters: raw.filters,
            exits: raw.exits,
            gateway: raw.gateway,
            instruments,
        })
    }

    /// Instrument and stop settings for a configured symbol.
    pub fn instrument(&self, symbol: &str) -> Result<&InstrumentSpec, EngineError> {
        self.instruments.get(symbol).ok_or_else(|| {
            EngineError::invalid_config(format!("symbol {symbol} is not configured"))
        })
    }

    /// Take-profit levels actually used, one per leg.
    pub fn active_levels(&self) -> &[Decimal] {
        let levels = self.take_profit.levels();
        if self.split.enabled {
            &levels[..self.split.legs.min(levels.len())]
        } else {
            &levels[..1]
        }
    }

    /// Leg weights as fractions of 1. A single leg of 1 when split is off.
    pub fn leg_fractions(&self) -> Vec<Decimal> {
        if self.split.enabled {
            self.split.weights.iter().map(|w| *w / dec!(100)).collect()
        } else {
            vec![Decimal::ONE]
        }
    }
}
