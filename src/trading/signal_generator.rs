//! Signal generation from bars and their indicator set.
//!
//! Five detection methods run in a fixed priority order. The first method
//! that fires *and* passes the enabled filters becomes the signal; there
//! is no blending across methods. Other methods that fired in the same
//! direction are recorded as confirmations only.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::config::TradingConfig;
use crate::error::EngineError;
use crate::indicators::{at, IndicatorSet};
use crate::models::{Direction, PriceBar, Signal, SignalMethod};

/// Confidence weights: method priority, trend strength, filter agreement.
const METHOD_WEIGHT: f64 = 0.5;
const STRENGTH_WEIGHT: f64 = 0.3;
const AGREEMENT_WEIGHT: f64 = 0.2;

/// Neutral score used when an input cannot be evaluated.
const NEUTRAL: f64 = 0.5;

/// A method that fired on the latest bar.
#[derive(Debug, Clone)]
struct Candidate {
    method: SignalMethod,
    direction: Direction,
    reason: String,
}

/// Outcome of running the secondary filters for one direction.
#[derive(Debug, Clone, Default)]
struct FilterOutcome {
    enabled: usize,
    passed: usize,
    rejected_by: Option<String>,
    notes: Vec<String>,
}

impl FilterOutcome {
    fn accepted(&self) -> bool {
        self.rejected_by.is_none()
    }

    /// Share of enabled filters that evaluated and agreed. Filters that
    /// could not evaluate do not reject but do not count as agreement.
    fn agreement(&self) -> f64 {
        if self.enabled == 0 {
            NEUTRAL
        } else {
            self.passed as f64 / self.enabled as f64
        }
    }

    fn check(&mut self, name: &str, value: Option<f64>, ok: impl Fn(f64) -> bool) {
        self.enabled += 1;
        match value {
            None => self.notes.push(format!("{name} filter skipped (unavailable)")),
            Some(v) if ok(v) => {
                self.passed += 1;
                self.notes.push(format!("{name} filter passed ({v:.2})"));
            }
            Some(v) => {
                if self.rejected_by.is_none() {
                    self.rejected_by = Some(format!("{name} ({v:.2})"));
                }
            }
        }
    }
}

/// Evaluates the detection methods for one symbol at a time.
pub struct SignalGenerator {
    config: Arc<TradingConfig>,
}

impl SignalGenerator {
    pub fn new(config: Arc<TradingConfig>) -> Self {
        Self { config }
    }

    /// Bars required before any evaluation is attempted.
    pub fn min_history(&self) -> usize {
        self.config.indicators.warmup_bars() + 1
    }

    /// Evaluate the latest bar of `bars`.
    ///
    /// `Ok(None)` means no method fired, every fired method was filtered
    /// out, or confidence fell below the configured minimum.
    pub fn evaluate(
        &self,
        symbol: &str,
        bars: &[PriceBar],
        indicators: &IndicatorSet,
    ) -> Result<Option<Signal>, EngineError> {
        if bars.len() < self.min_history() {
            return Err(EngineError::data_unavailable(
                symbol,
                format!("{} bars, need {}", bars.len(), self.min_history()),
            ));
        }
        if indicators.bar_count() != bars.len() {
            return Err(EngineError::IndicatorComputation(format!(
                "{symbol}: indicator set has {} entries for {} bars",
                indicators.bar_count(),
                bars.len()
            )));
        }
        let i = bars.len() - 1;
        if !bars[i].is_valid() {
            return Err(EngineError::data_unavailable(symbol, "latest bar is not a valid price"));
        }

        let fired: Vec<Candidate> = SignalMethod::PRIORITY
            .iter()
            .filter(|m| self.method_enabled(**m))
            .filter_map(|m| self.detect(*m, bars, indicators, i))
            .collect();

        let mut winner = None;
        for candidate in &fired {
            let outcome = self.apply_filters(candidate.direction, bars, indicators, i);
            if outcome.accepted() {
                winner = Some((candidate, outcome));
                break;
            }
            debug!(
                symbol = %symbol,
                method = %candidate.method,
                direction = %candidate.direction,
                rejected_by = outcome.rejected_by.as_deref().unwrap_or(""),
                "Signal method filtered out"
            );
        }

        let Some((primary, filters)) = winner else {
            return Ok(None);
        };

        let mut methods = vec![primary.method];
        let mut reasons = vec![primary.reason.clone()];
        for other in fired
            .iter()
            .filter(|c| c.method != primary.method && c.direction == primary.direction)
        {
            methods.push(other.method);
            reasons.push(format!("confirmed by {}: {}", other.method, other.reason));
        }
        reasons.extend(filters.notes.iter().cloned());

        let adx = at(&indicators.adx, i);
        let confidence = confidence(primary.method, adx, filters.agreement());

        if confidence < self.config.risk.min_confidence {
            debug!(
                symbol = %symbol,
                method = %primary.method,
                confidence = confidence,
                "Signal below minimum confidence"
            );
            return Ok(None);
        }

        Ok(Some(Signal {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction: primary.direction,
            confidence,
            methods,
            reasons,
            bar_time: bars[i].timestamp,
            generated_at: Utc::now(),
        }))
    }

    fn method_enabled(&self, method: SignalMethod) -> bool {
        let s = &self.config.signals;
        match method {
            SignalMethod::Crossover => s.crossover,
            SignalMethod::TrendConfirmation => s.trend_confirmation,
            SignalMethod::Momentum => s.momentum,
            SignalMethod::Pullback => s.pullback,
            SignalMethod::Breakout => s.breakout,
        }
    }

    fn detect(
        &self,
        method: SignalMethod,
        bars: &[PriceBar],
        ind: &IndicatorSet,
        i: usize,
    ) -> Option<Candidate> {
        let (direction, reason) = match method {
            SignalMethod::Crossover => crossover(ind, i)?,
            SignalMethod::TrendConfirmation => trend_confirmation(bars, ind, i)?,
            SignalMethod::Momentum => self.momentum(ind, i)?,
            SignalMethod::Pullback => self.pullback(bars, ind, i)?,
            SignalMethod::Breakout => self.breakout(bars, i)?,
        };
        Some(Candidate {
            method,
            direction,
            reason,
        })
    }

    /// RSI recovering from oversold with a rising MACD histogram, or the
    /// mirror image for shorts.
    fn momentum(&self, ind: &IndicatorSet, i: usize) -> Option<(Direction, String)> {
        let s = &self.config.signals;
        let (rsi_prev, rsi_now) = (at(&ind.rsi, i - 1)?, at(&ind.rsi, i)?);
        let (hist_prev, hist_now) = (at(&ind.macd_histogram, i - 1)?, at(&ind.macd_histogram, i)?);

        if rsi_prev <= s.momentum_oversold && rsi_now > rsi_prev && hist_now > hist_prev {
            return Some((
                Direction::Long,
                format!("RSI recovering from {rsi_prev:.1} to {rsi_now:.1} with rising MACD histogram"),
            ));
        }
        if rsi_prev >= s.momentum_overbought && rsi_now < rsi_prev && hist_now < hist_prev {
            return Some((
                Direction::Short,
                format!("RSI retreating from {rsi_prev:.1} to {rsi_now:.1} with falling MACD histogram"),
            ));
        }
        None
    }

    /// Close within the tolerance band of the fast MA while the slow MA
    /// trend is established.
    fn pullback(&self, bars: &[PriceBar], ind: &IndicatorSet, i: usize) -> Option<(Direction, String)> {
        let s = &self.config.signals;
        let close = bars[i].close;
        let fast = at(&ind.fast_ma, i)?;
        let slow = at(&ind.slow_ma, i)?;
        let slow_past = at(&ind.slow_ma, i.checked_sub(s.trend_slope_lookback)?)?;
        if close <= 0.0 {
            return None;
        }

        let distance_pct = (close - fast).abs() / close * 100.0;
        if distance_pct > s.pullback_tolerance_pct {
            return None;
        }

        if slow > slow_past && fast > slow {
            Some((
                Direction::Long,
                format!("pullback to fast MA ({distance_pct:.3}% away) in rising trend"),
            ))
        } else if slow < slow_past && fast < slow {
            Some((
                Direction::Short,
                format!("pullback to fast MA ({distance_pct:.3}% away) in falling trend"),
            ))
        } else {
            None
        }
    }

    /// Close beyond the high or low of the preceding lookback window.
    fn breakout(&self, bars: &[PriceBar], i: usize) -> Option<(Direction, String)> {
        let lookback = self.config.signals.breakout_lookback;
        let start = i.checked_sub(lookback)?;
        let window = &bars[start..i];
        if window.iter().any(|b| !b.is_valid()) {
            return None;
        }

        let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let close = bars[i].close;

        if close > high {
            Some((Direction::Long, format!("close {close} above {lookback}-bar high {high}")))
        } else if close < low {
            Some((Direction::Short, format!("close {close} below {lookback}-bar low {low}")))
        } else {
            None
        }
    }

    fn apply_filters(
        &self,
        direction: Direction,
        bars: &[PriceBar],
        ind: &IndicatorSet,
        i: usize,
    ) -> FilterOutcome {
        let f = &self.config.filters;
        let mut outcome = FilterOutcome::default();

        if f.rsi_enabled {
            outcome.check("RSI", at(&ind.rsi, i), |rsi| match direction {
                Direction::Long => rsi < f.rsi_overbought,
                Direction::Short => rsi > f.rsi_oversold,
            });
        }
        if f.macd_enabled {
            outcome.check("MACD", at(&ind.macd_histogram, i), |h| {
                h.abs() >= f.macd_min_histogram
            });
        }
        if f.adx_enabled {
            outcome.check("ADX", at(&ind.adx, i), |adx| adx >= f.adx_min);
        }
        if f.volume_enabled {
            let ratio = at(&ind.volume_ma, i)
                .filter(|avg| *avg > 0.0)
                .map(|avg| bars[i].volume / avg)
                .filter(|r| r.is_finite());
            outcome.check("volume", ratio, |r| r >= f.volume_min_ratio);
        }
        outcome
    }
}

/// Fast MA crossing the slow MA between the last two bars.
fn crossover(ind: &IndicatorSet, i: usize) -> Option<(Direction, String)> {
    let (fast_prev, fast_now) = (at(&ind.fast_ma, i - 1)?, at(&ind.fast_ma, i)?);
    let (slow_prev, slow_now) = (at(&ind.slow_ma, i - 1)?, at(&ind.slow_ma, i)?);

    if fast_prev <= slow_prev && fast_now > slow_now {
        Some((Direction::Long, "fast MA crossed above slow MA".to_string()))
    } else if fast_prev >= slow_prev && fast_now < slow_now {
        Some((Direction::Short, "fast MA crossed below slow MA".to_string()))
    } else {
        None
    }
}

/// Close moves beyond both MAs on this bar (it was not beyond both on the
/// previous bar) with the MAs already stacked in the same direction.
fn trend_confirmation(bars: &[PriceBar], ind: &IndicatorSet, i: usize) -> Option<(Direction, String)> {
    let (fast_prev, fast_now) = (at(&ind.fast_ma, i - 1)?, at(&ind.fast_ma, i)?);
    let (slow_prev, slow_now) = (at(&ind.slow_ma, i - 1)?, at(&ind.slow_ma, i)?);
    let (close_prev, close_now) = (bars[i - 1].close, bars[i].close);

    let above_now = close_now > fast_now.max(slow_now);
    let above_prev = close_prev > fast_prev.max(slow_prev);
    let below_now = close_now < fast_now.min(slow_now);
    let below_prev = close_prev < fast_prev.min(slow_prev);

    if above_now && !above_prev && fast_now > slow_now {
        Some((Direction::Long, "close moved above both MAs in an uptrend".to_string()))
    } else if below_now && !below_prev && fast_now < slow_now {
        Some((Direction::Short, "close moved below both MAs in a downtrend".to_string()))
    } else {
        None
    }
}

/// Weighted confidence, clamped to [0, 1].
fn confidence(method: SignalMethod, adx: Option<f64>, agreement: f64) -> f64 {
    let strength = adx
        .filter(|v| v.is_finite())
        .map(|v| (v / 100.0).clamp(0.0, 1.0))
        .unwrap_or(NEUTRAL);

    let score = METHOD_WEIGHT * method.weight()
        + STRENGTH_WEIGHT * strength
        + AGREEMENT_WEIGHT * agreement.clamp(0.0, 1.0);
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{compute, IndicatorConfig};
    use crate::trading::config::RawConfig;
    use chrono::{Duration, TimeZone};

    fn generator(raw: RawConfig) -> SignalGenerator {
        SignalGenerator::new(Arc::new(TradingConfig::from_raw(raw).unwrap()))
    }

    fn flat_bars(n: usize) -> Vec<PriceBar> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| PriceBar::new(start + Duration::hours(i as i64), 1.1, 1.101, 1.099, 1.1, 100.0))
            .collect()
    }

    fn blank(n: usize) -> IndicatorSet {
        let none = vec![None; n];
        IndicatorSet {
            fast_ma: none.clone(),
            slow_ma: none.clone(),
            rsi: none.clone(),
            macd: none.clone(),
            macd_signal: none.clone(),
            macd_histogram: none.clone(),
            adx: none.clone(),
            plus_di: none.clone(),
            minus_di: none.clone(),
            atr: none.clone(),
            bb_upper: none.clone(),
            bb_middle: none.clone(),
            bb_lower: none.clone(),
            volume_ma: none,
        }
    }

    fn set_last_two(series: &mut [Option<f64>], prev: f64, now: f64) {
        let n = series.len();
        series[n - 2] = Some(prev);
        series[n - 1] = Some(now);
    }

    #[test]
    fn test_insufficient_history_is_data_unavailable() {
        let gen = generator(RawConfig::default());
        let bars = flat_bars(10);
        let err = gen.evaluate("EURUSD", &bars, &blank(10)).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
    }

    #[test]
    fn test_quiet_market_yields_none() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let bars = flat_bars(n);
        assert!(gen.evaluate("EURUSD", &bars, &blank(n)).unwrap().is_none());
    }

    #[test]
    fn test_crossover_long_with_confidence() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        set_last_two(&mut ind.fast_ma, 1.0, 1.2);
        set_last_two(&mut ind.slow_ma, 1.1, 1.1);
        ind.adx[n - 1] = Some(30.0);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.primary_method(), Some(SignalMethod::Crossover));
        // 0.5 * 1.0 + 0.3 * 0.30 + 0.2 * (ADX passed, RSI unavailable => 1/2)
        assert!((signal.confidence - 0.69).abs() < 1e-9);
        assert_eq!(signal.bar_time, bars[n - 1].timestamp);
    }

    #[test]
    fn test_filtered_method_falls_through_to_next() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        // long crossover, but RSI is overbought so longs are rejected
        set_last_two(&mut ind.fast_ma, 1.0, 1.2);
        set_last_two(&mut ind.slow_ma, 1.1, 1.1);
        set_last_two(&mut ind.rsi, 80.0, 75.0);
        set_last_two(&mut ind.macd_histogram, 0.002, 0.001);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.primary_method(), Some(SignalMethod::Momentum));
    }

    #[test]
    fn test_unavailable_filter_does_not_reject() {
        let mut raw = RawConfig::default();
        raw.filters.volume_enabled = true;
        raw.filters.macd_enabled = true;
        let gen = generator(raw);
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        set_last_two(&mut ind.fast_ma, 1.2, 1.0);
        set_last_two(&mut ind.slow_ma, 1.1, 1.1);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Short);
        // no filter could evaluate: 0.5 + 0.3 * 0.5 + 0.2 * 0
        assert!((signal.confidence - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_adx_filter_rejects_weak_trend() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        set_last_two(&mut ind.fast_ma, 1.0, 1.2);
        set_last_two(&mut ind.slow_ma, 1.1, 1.1);
        ind.adx[n - 1] = Some(12.0);
        assert!(gen.evaluate("EURUSD", &bars, &ind).unwrap().is_none());
    }

    #[test]
    fn test_breakout_short() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let mut bars = flat_bars(n);
        bars[n - 1].close = 1.095;
        bars[n - 1].low = 1.094;

        let signal = gen.evaluate("EURUSD", &bars, &blank(n)).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.primary_method(), Some(SignalMethod::Breakout));
    }

    #[test]
    fn test_disabled_method_does_not_fire() {
        let mut raw = RawConfig::default();
        raw.signals.breakout = false;
        let gen = generator(raw);
        let n = gen.min_history();
        let mut bars = flat_bars(n);
        bars[n - 1].close = 1.105;
        bars[n - 1].high = 1.106;
        assert!(gen.evaluate("EURUSD", &bars, &blank(n)).unwrap().is_none());
    }

    #[test]
    fn test_pullback_in_uptrend_with_confirmation() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let mut bars = flat_bars(n);
        bars[n - 2].close = 1.1004;
        bars[n - 1].close = 1.1015;
        bars[n - 1].high = 1.102;
        let mut ind = blank(n);
        ind.fast_ma[n - 1] = Some(1.101);
        ind.fast_ma[n - 2] = Some(1.1);
        ind.slow_ma[n - 1] = Some(1.09);
        ind.slow_ma[n - 2] = Some(1.089);
        ind.slow_ma[n - 1 - 5] = Some(1.08);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Long);
        // close above both MAs now but also on the previous bar: no trend
        // confirmation, so pullback wins and breakout confirms
        assert_eq!(
            signal.methods,
            vec![SignalMethod::Pullback, SignalMethod::Breakout]
        );
    }

    #[test]
    fn test_trend_confirmation_long() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let mut bars = flat_bars(n);
        // previous close sat below the fast MA
        bars[n - 2].close = 1.094;
        bars[n - 2].low = 1.093;
        let mut ind = blank(n);
        set_last_two(&mut ind.fast_ma, 1.095, 1.096);
        set_last_two(&mut ind.slow_ma, 1.090, 1.091);
        ind.adx[n - 1] = Some(30.0);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.methods, vec![SignalMethod::TrendConfirmation]);
        // 0.5 * 0.85 + 0.3 * 0.30 + 0.2 * (ADX passed, RSI unavailable => 1/2)
        assert!((signal.confidence - 0.615).abs() < 1e-9);
    }

    #[test]
    fn test_momentum_long_from_oversold() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        set_last_two(&mut ind.rsi, 30.0, 38.0);
        set_last_two(&mut ind.macd_histogram, -0.0010, -0.0005);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.methods, vec![SignalMethod::Momentum]);
        // 0.5 * 0.75 + 0.3 * 0.5 + 0.2 * (RSI passed, ADX unavailable => 1/2)
        assert!((signal.confidence - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_momentum_needs_rising_histogram() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        set_last_two(&mut ind.rsi, 30.0, 38.0);
        set_last_two(&mut ind.macd_histogram, -0.0005, -0.0010);
        assert!(gen.evaluate("EURUSD", &bars, &ind).unwrap().is_none());
    }

    #[test]
    fn test_breakout_long() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let mut bars = flat_bars(n);
        bars[n - 1].close = 1.105;
        bars[n - 1].high = 1.106;

        let signal = gen.evaluate("EURUSD", &bars, &blank(n)).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.methods, vec![SignalMethod::Breakout]);
        assert!(signal.reasons[0].contains("20-bar high"));
    }

    #[test]
    fn test_pullback_in_downtrend() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        // close 1.1 is 0.045% below the fast MA, slow MA falling
        ind.fast_ma[n - 1] = Some(1.1005);
        ind.slow_ma[n - 1] = Some(1.11);
        ind.slow_ma[n - 1 - 5] = Some(1.12);
        ind.adx[n - 1] = Some(25.0);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.methods, vec![SignalMethod::Pullback]);
        assert!((signal.confidence - 0.475).abs() < 1e-9);
    }

    #[test]
    fn test_trend_confirmation_outranks_pullback() {
        let gen = generator(RawConfig::default());
        let n = gen.min_history();
        let mut bars = flat_bars(n);
        bars[n - 2].close = 1.099;
        let mut ind = blank(n);
        // close crosses above both MAs and sits 0.045% from the fast MA
        set_last_two(&mut ind.fast_ma, 1.0995, 1.0995);
        set_last_two(&mut ind.slow_ma, 1.0899, 1.09);
        ind.slow_ma[n - 1 - 5] = Some(1.08);

        let signal = gen.evaluate("EURUSD", &bars, &ind).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(
            signal.methods,
            vec![SignalMethod::TrendConfirmation, SignalMethod::Pullback]
        );
        assert!(signal.reasons[1].starts_with("confirmed by"));
    }

    #[test]
    fn test_min_confidence_suppresses_signal() {
        let mut raw = RawConfig::default();
        raw.risk.min_confidence = 0.9;
        let gen = generator(raw);
        let n = gen.min_history();
        let bars = flat_bars(n);
        let mut ind = blank(n);
        set_last_two(&mut ind.fast_ma, 1.0, 1.2);
        set_last_two(&mut ind.slow_ma, 1.1, 1.1);
        assert!(gen.evaluate("EURUSD", &bars, &ind).unwrap().is_none());
    }

    #[test]
    fn test_confidence_always_in_unit_interval() {
        let mut raw = RawConfig::default();
        raw.filters.adx_enabled = false;
        let gen = generator(raw);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<PriceBar> = (0..400)
            .map(|i| {
                let t = i as f64;
                let c = 1.1 + (t * 0.11).sin() * 0.01 + (t * 0.023).cos() * 0.02;
                PriceBar::new(start + Duration::hours(i), c, c + 0.0015, c - 0.0015, c, 100.0 + t)
            })
            .collect();

        let mut seen = 0;
        for end in gen.min_history()..=bars.len() {
            let window = &bars[..end];
            let ind = compute(window, &IndicatorConfig::default());
            if let Some(signal) = gen.evaluate("EURUSD", window, &ind).unwrap() {
                assert!((0.0..=1.0).contains(&signal.confidence));
                seen += 1;
            }
        }
        assert!(seen > 0);
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(confidence(SignalMethod::Crossover, Some(250.0), 3.0), 1.0);
        assert!(confidence(SignalMethod::Pullback, Some(-10.0), -1.0) >= 0.0);
    }
}
