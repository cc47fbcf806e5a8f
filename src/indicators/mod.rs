//! Pure indicator engine.
//!
//! `compute` turns a bar history into an [`IndicatorSet`] whose series are
//! aligned index-for-index with the bars. Warm-up entries, gaps in the
//! input and zero denominators all show up as `None`; nothing here panics
//! or returns an error.

pub mod momentum;
pub mod moving_average;
pub mod trend;
pub mod volatility;

use serde::{Deserialize, Serialize};

use crate::models::PriceBar;

/// Moving average flavour for the fast/slow pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaKind {
    Sma,
    Ema,
}

/// Indicator periods and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub ma_kind: MaKind,
    pub fast_ma_period: usize,
    pub slow_ma_period: usize,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub adx_period: usize,
    pub atr_period: usize,
    pub bollinger_period: usize,
    pub bollinger_k: f64,
    pub volume_ma_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ma_kind: MaKind::Ema,
            fast_ma_period: 20,
            slow_ma_period: 50,
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            adx_period: 14,
            atr_period: 14,
            bollinger_period: 20,
            bollinger_k: 2.0,
            volume_ma_period: 20,
        }
    }
}

impl IndicatorConfig {
    /// Bars needed before every series can produce a value.
    pub fn warmup_bars(&self) -> usize {
        [
            self.slow_ma_period,
            self.fast_ma_period,
            self.rsi_period + 1,
            self.macd_slow + self.macd_signal,
            2 * self.adx_period,
            self.atr_period,
            self.bollinger_period,
            self.volume_ma_period,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Every indicator series for one symbol, aligned with its bars.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSet {
    pub fast_ma: Vec<Option<f64>>,
    pub slow_ma: Vec<Option<f64>>,
    pub rsi: Vec<Option<f64>>,
    pub macd: Vec<Option<f64>>,
    pub macd_signal: Vec<Option<f64>>,
    pub macd_histogram: Vec<Option<f64>>,
    pub adx: Vec<Option<f64>>,
    pub plus_di: Vec<Option<f64>>,
    pub minus_di: Vec<Option<f64>>,
    pub atr: Vec<Option<f64>>,
    pub bb_upper: Vec<Option<f64>>,
    pub bb_middle: Vec<Option<f64>>,
    pub bb_lower: Vec<Option<f64>>,
    pub volume_ma: Vec<Option<f64>>,
}

impl IndicatorSet {
    /// Number of bars the set was computed over.
    pub fn bar_count(&self) -> usize {
        self.fast_ma.len()
    }

    /// Latest ATR, if available.
    pub fn last_atr(&self) -> Option<f64> {
        last(&self.atr)
    }
}

/// Value at `index`, flattening out-of-range and unavailable entries.
pub fn at(series: &[Option<f64>], index: usize) -> Option<f64> {
    series.get(index).copied().flatten()
}

/// Most recent value of a series.
pub fn last(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}

/// Compute every indicator for `bars`.
pub fn compute(bars: &[PriceBar], config: &IndicatorConfig) -> IndicatorSet {
    let closes = moving_average::to_series(&bars.iter().map(|b| b.close).collect::<Vec<_>>());
    let volumes = moving_average::to_series(&bars.iter().map(|b| b.volume).collect::<Vec<_>>());

    let ma = |period| match config.ma_kind {
        MaKind::Sma => moving_average::sma(&closes, period),
        MaKind::Ema => moving_average::ema(&closes, period),
    };

    let macd = momentum::macd(&closes, config.macd_fast, config.macd_slow, config.macd_signal);
    let adx = trend::adx(bars, config.adx_period);
    let bands = volatility::bollinger(&closes, config.bollinger_period, config.bollinger_k);

    IndicatorSet {
        fast_ma: ma(config.fast_ma_period),
        slow_ma: ma(config.slow_ma_period),
        rsi: momentum::rsi(&closes, config.rsi_period),
        macd: macd.macd,
        macd_signal: macd.signal,
        macd_histogram: macd.histogram,
        adx: adx.adx,
        plus_di: adx.plus_di,
        minus_di: adx.minus_di,
        atr: volatility::atr(bars, config.atr_period),
        bb_upper: bands.upper,
        bb_middle: bands.middle,
        bb_lower: bands.lower,
        volume_ma: moving_average::sma(&volumes, config.volume_ma_period),
    }
}
