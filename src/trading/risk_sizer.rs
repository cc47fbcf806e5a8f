//! Risk-based position sizing and the take-profit ladder.
//!
//! Quantity = equity * risk% / (stop distance * contract size), floored to
//! the lot step and clamped to the instrument's lot limits. In split mode
//! the quantity is divided across legs by fixed weights, each leg with its
//! own take-profit from the ladder.

use std::sync::Arc;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use super::config::{InstrumentSpec, TakeProfitMode, TradingConfig};
use super::stops::to_decimal;
use crate::error::EngineError;
use crate::indicators::{at, IndicatorSet};
use crate::models::{AccountSnapshot, Direction, Instrument, PriceBar, Signal};

/// One leg of a sized plan.
#[derive(Debug, Clone, PartialEq)]
pub struct LegPlan {
    pub index: usize,

    /// Share of the total quantity this leg was weighted for
    pub fraction: Decimal,

    pub quantity: Decimal,
    pub take_profit: Decimal,
}

/// A sized, validated entry plan. Consumes the signal that produced it.
#[derive(Debug, Clone)]
pub struct RiskPlan {
    pub signal: Signal,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub stop_distance: Decimal,
    pub total_quantity: Decimal,

    /// Effective risk percentage after the adaptive multiplier and cap
    pub risk_percent: Decimal,

    /// Account currency at risk if every leg stops out
    pub risk_amount: Decimal,

    /// ATR when the plan was made; the lifecycle manager's trailing unit
    pub atr: Option<f64>,

    pub legs: Vec<LegPlan>,
}

/// Market conditions that drive the adaptive risk multiplier.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketRegime {
    pub adx: Option<f64>,

    /// Share of recent bars that closed in the direction of the net move,
    /// in [0, 1]
    pub trend_consistency: Option<f64>,

    pub atr: Option<f64>,
}

impl MarketRegime {
    /// Read the regime at the latest bar.
    pub fn from_indicators(bars: &[PriceBar], indicators: &IndicatorSet, lookback: usize) -> Self {
        let Some(last) = bars.len().checked_sub(1) else {
            return Self::default();
        };
        Self {
            adx: at(&indicators.adx, last),
            trend_consistency: trend_consistency(bars, lookback),
            atr: at(&indicators.atr, last),
        }
    }
}

/// Fraction of the last `lookback` bar-to-bar moves that agree with the net
/// move over the window. `None` when the history is too short.
pub fn trend_consistency(bars: &[PriceBar], lookback: usize) -> Option<f64> {
    if lookback == 0 || bars.len() <= lookback {
        return None;
    }
    let window = &bars[bars.len() - lookback - 1..];
    let net = window[lookback].close - window[0].close;
    if !net.is_finite() {
        return None;
    }
    if net == 0.0 {
        return Some(0.0);
    }
    let agreeing = window
        .windows(2)
        .filter(|w| (w[1].close - w[0].close) * net > 0.0)
        .count();
    Some(agreeing as f64 / lookback as f64)
}

/// Reject stops on the wrong side of entry or at zero distance.
pub fn validate_stop(direction: Direction, entry: Decimal, stop: Decimal) -> Result<(), EngineError> {
    if direction.is_better(entry, stop) {
        Ok(())
    } else {
        Err(EngineError::InvalidStop(format!(
            "{direction} entry {entry} with stop {stop}"
        )))
    }
}

/// Ratio ladder: entry ± ratio * |entry - stop|.
pub fn take_profit_ladder(
    direction: Direction,
    entry: Decimal,
    stop: Decimal,
    ratios: &[Decimal],
) -> Vec<Decimal> {
    let risk = (entry - stop).abs();
    ratios
        .iter()
        .map(|r| entry + direction.sign() * risk * *r)
        .collect()
}

/// Pip ladder: entry ± pips converted with the instrument's pip size.
pub fn pip_ladder(
    direction: Direction,
    entry: Decimal,
    pips: &[Decimal],
    instrument: &Instrument,
) -> Vec<Decimal> {
    pips.iter()
        .map(|p| entry + direction.sign() * instrument.pips_to_price(*p))
        .collect()
}

/// Split `total` by `fractions`. Every leg but the last is floored to the
/// lot step; the last takes the remainder, so legs sum to `total` exactly.
/// `None` when any leg would fall below the minimum lot.
pub fn split_quantity(
    total: Decimal,
    fractions: &[Decimal],
    instrument: &Instrument,
) -> Option<Vec<Decimal>> {
    let (_, head) = fractions.split_last()?;

    let mut legs: Vec<Decimal> = head
        .iter()
        .map(|f| instrument.floor_lots(total * *f))
        .collect();
    let allocated: Decimal = legs.iter().copied().sum();
    legs.push(total - allocated);

    if legs.iter().any(|q| *q < instrument.min_lot) {
        None
    } else {
        Some(legs)
    }
}

/// Sizes signals against the account and instrument limits.
pub struct RiskSizer {
    config: Arc<TradingConfig>,
}

impl RiskSizer {
    pub fn new(config: Arc<TradingConfig>) -> Self {
        Self { config }
    }

    /// Stop distance in price units for the instrument's stop mode.
    pub fn stop_distance(&self, spec: &InstrumentSpec, atr: Option<f64>) -> Result<Decimal, EngineError> {
        let distance = if spec.stops.atr_enabled {
            let atr = atr.and_then(to_decimal).filter(|a| *a > Decimal::ZERO).ok_or_else(|| {
                EngineError::data_unavailable(&spec.instrument.symbol, "ATR unavailable for stop distance")
            })?;
            atr * spec.stops.atr_multiplier
        } else {
            spec.instrument.pips_to_price(spec.stops.stop_loss_pips)
        };
        Ok(spec.instrument.normalize_price(distance))
    }

    /// Adaptive multiplier in `[min_multiplier, max_multiplier]`; 1 when
    /// adaptive risk is off.
    pub fn risk_multiplier(&self, regime: &MarketRegime) -> Decimal {
        let adaptive = &self.config.risk.adaptive;
        if !adaptive.enabled {
            return Decimal::ONE;
        }
        let Some(adx) = regime.adx.filter(|v| v.is_finite()) else {
            return Decimal::ONE.clamp(adaptive.min_multiplier, adaptive.max_multiplier);
        };

        let strength = ((adx - adaptive.weak_adx) / (adaptive.strong_adx - adaptive.weak_adx)).clamp(0.0, 1.0);
        let consistency = regime.trend_consistency.unwrap_or(1.0).clamp(0.0, 1.0);
        let scale = Decimal::from_f64(strength * consistency).unwrap_or(Decimal::ZERO);

        let multiplier =
            adaptive.min_multiplier + (adaptive.max_multiplier - adaptive.min_multiplier) * scale;
        multiplier.clamp(adaptive.min_multiplier, adaptive.max_multiplier)
    }

    /// Base risk times the multiplier, never above the configured ceiling.
    pub fn effective_risk_percent(&self, regime: &MarketRegime) -> Decimal {
        let risk = &self.config.risk;
        (risk.risk_percent * self.risk_multiplier(regime)).min(risk.max_risk_percent)
    }

    /// Size `signal` into a plan. The signal is consumed.
    pub fn size(
        &self,
        signal: Signal,
        account: &AccountSnapshot,
        entry: Decimal,
        stop_distance: Decimal,
        regime: &MarketRegime,
    ) -> Result<RiskPlan, EngineError> {
        let spec = self.config.instrument(&signal.symbol)?;
        let instrument = &spec.instrument;
        let direction = signal.direction;

        if stop_distance <= Decimal::ZERO {
            return Err(EngineError::InvalidStop(format!(
                "{}: stop distance {stop_distance} is not positive",
                signal.symbol
            )));
        }
        let entry = instrument.normalize_price(entry);
        let stop_price = instrument.normalize_price(entry - direction.sign() * stop_distance);
        validate_stop(direction, entry, stop_price)?;
        let stop_distance = (entry - stop_price).abs();

        if account.equity <= Decimal::ZERO {
            return Err(EngineError::Sizing(format!("account equity is {}", account.equity)));
        }

        let risk_percent = self.effective_risk_percent(regime);
        let risk_budget = account.equity * risk_percent / dec!(100);
        let raw_quantity = risk_budget / (stop_distance * instrument.contract_size);

        let mut total = instrument.floor_lots(raw_quantity);
        if total < instrument.min_lot {
            let ceiling = account.equity * self.config.risk.max_risk_percent / dec!(100);
            let min_risk = instrument.min_lot * stop_distance * instrument.contract_size;
            if min_risk > ceiling {
                return Err(EngineError::Sizing(format!(
                    "{}: minimum lot {} risks {} over a {} stop, above the {} ceiling",
                    signal.symbol,
                    instrument.min_lot,
                    min_risk.round_dp(2),
                    stop_distance,
                    ceiling.round_dp(2)
                )));
            }
            warn!(
                symbol = %signal.symbol,
                computed = %raw_quantity,
                min_lot = %instrument.min_lot,
                "Risk budget below minimum lot, clamping up"
            );
            total = instrument.min_lot;
        }
        total = total.min(instrument.max_lot);

        let levels = self.config.active_levels();
        let targets: Vec<Decimal> = match self.config.take_profit.mode {
            TakeProfitMode::RiskReward => take_profit_ladder(direction, entry, stop_price, levels),
            TakeProfitMode::Pips => pip_ladder(direction, entry, levels, instrument),
        }
        .into_iter()
        .map(|p| instrument.normalize_price(p))
        .collect();

        let strictly_away = std::iter::once(entry)
            .chain(targets.iter().copied())
            .collect::<Vec<_>>()
            .windows(2)
            .all(|w| direction.is_better(w[1], w[0]));
        if !strictly_away {
            return Err(EngineError::Sizing(format!(
                "{}: take-profit ladder {:?} is not strictly beyond entry {entry}",
                signal.symbol, targets
            )));
        }

        let fractions = self.config.leg_fractions();
        let legs = match split_quantity(total, &fractions, instrument) {
            Some(quantities) if quantities.len() > 1 => quantities
                .into_iter()
                .zip(fractions.iter().zip(targets.iter()))
                .enumerate()
                .map(|(index, (quantity, (fraction, tp)))| LegPlan {
                    index,
                    fraction: *fraction,
                    quantity,
                    take_profit: *tp,
                })
                .collect(),
            _ => {
                if fractions.len() > 1 {
                    debug!(
                        symbol = %signal.symbol,
                        total = %total,
                        "Split legs below minimum lot, using a single leg"
                    );
                }
                vec![LegPlan {
                    index: 0,
                    fraction: Decimal::ONE,
                    quantity: total,
                    take_profit: targets[0],
                }]
            }
        };

        let risk_amount = stop_distance * total * instrument.contract_size;

        Ok(RiskPlan {
            symbol: signal.symbol.clone(),
            direction,
            entry_price: entry,
            stop_price,
            stop_distance,
            total_quantity: total,
            risk_percent,
            risk_amount,
            atr: regime.atr,
            legs,
            signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalMethod;
    use crate::trading::config::RawConfig;
    use chrono::Utc;
    use uuid::Uuid;

    fn sizer(raw: RawConfig) -> RiskSizer {
        RiskSizer::new(Arc::new(TradingConfig::from_raw(raw).unwrap()))
    }

    fn signal(direction: Direction) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "EURUSD".to_string(),
            direction,
            confidence: 0.8,
            methods: vec![SignalMethod::Crossover],
            reasons: vec![],
            bar_time: Utc::now(),
            generated_at: Utc::now(),
        }
    }

    fn account(equity: Decimal) -> AccountSnapshot {
        AccountSnapshot {
            balance: equity,
            equity,
            free_margin: equity,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ratio_ladder_long_and_short() {
        let ratios = [dec!(1.5), dec!(2.5), dec!(4.0)];
        assert_eq!(
            take_profit_ladder(Direction::Long, dec!(100), dec!(90), &ratios),
            vec![dec!(115), dec!(125), dec!(140)]
        );
        assert_eq!(
            take_profit_ladder(Direction::Short, dec!(100), dec!(110), &ratios),
            vec![dec!(85), dec!(75), dec!(60)]
        );
    }

    #[test]
    fn test_pip_ladder_is_instrument_aware() {
        let inst = TradingConfig::from_raw(RawConfig::default())
            .unwrap()
            .instrument("EURUSD")
            .unwrap()
            .instrument
            .clone();
        let ladder = pip_ladder(Direction::Long, dec!(1.10000), &[dec!(100)], &inst);
        assert_eq!(ladder, vec![dec!(1.11000)]);
    }

    #[test]
    fn test_validate_stop_direction() {
        assert!(validate_stop(Direction::Long, dec!(100), dec!(90)).is_ok());
        assert!(validate_stop(Direction::Short, dec!(100), dec!(110)).is_ok());
        assert!(matches!(
            validate_stop(Direction::Short, dec!(100), dec!(90)),
            Err(EngineError::InvalidStop(_))
        ));
        assert!(validate_stop(Direction::Long, dec!(100), dec!(100)).is_err());
    }

    #[test]
    fn test_size_split_legs_sum_to_total() {
        let sizer = sizer(RawConfig::default());
        // 1% of 100k over 50 pips on a 100k contract = 2 lots
        let plan = sizer
            .size(signal(Direction::Long), &account(dec!(100000)), dec!(1.10000), dec!(0.00500), &MarketRegime::default())
            .unwrap();

        assert_eq!(plan.stop_price, dec!(1.09500));
        assert_eq!(plan.total_quantity, dec!(2.00));
        assert_eq!(plan.risk_amount, dec!(1000));
        let quantities: Vec<Decimal> = plan.legs.iter().map(|l| l.quantity).collect();
        assert_eq!(quantities, vec![dec!(0.80), dec!(0.60), dec!(0.60)]);
        assert_eq!(quantities.iter().copied().sum::<Decimal>(), plan.total_quantity);

        let tps: Vec<Decimal> = plan.legs.iter().map(|l| l.take_profit).collect();
        assert_eq!(tps, vec![dec!(1.10750), dec!(1.11250), dec!(1.12000)]);
    }

    #[test]
    fn test_uneven_split_remainder_goes_to_last_leg() {
        let sizer = sizer(RawConfig::default());
        // 0.37 lots: 0.14 + 0.11 + remainder 0.12
        let plan = sizer
            .size(signal(Direction::Short), &account(dec!(18500)), dec!(1.10000), dec!(0.00500), &MarketRegime::default())
            .unwrap();
        assert_eq!(plan.total_quantity, dec!(0.37));
        let quantities: Vec<Decimal> = plan.legs.iter().map(|l| l.quantity).collect();
        assert_eq!(quantities, vec![dec!(0.14), dec!(0.11), dec!(0.12)]);

        // short ladder strictly decreasing
        assert!(plan.legs.windows(2).all(|w| w[1].take_profit < w[0].take_profit));
        assert!(plan.legs[0].take_profit < plan.entry_price);
    }

    #[test]
    fn test_small_account_collapses_to_single_leg() {
        let sizer = sizer(RawConfig::default());
        let plan = sizer
            .size(signal(Direction::Long), &account(dec!(1000)), dec!(1.10000), dec!(0.00500), &MarketRegime::default())
            .unwrap();
        // 10 / 500 = 0.02 lots cannot be split three ways
        assert_eq!(plan.total_quantity, dec!(0.02));
        assert_eq!(plan.legs.len(), 1);
        assert_eq!(plan.legs[0].quantity, dec!(0.02));
        assert_eq!(plan.legs[0].take_profit, dec!(1.10750));
    }

    #[test]
    fn test_quantity_clamped_to_lot_limits() {
        let sizer = sizer(RawConfig::default());
        // 0.008 lots rounds up to 0.01: $5 at risk is 1.25% of $400
        let tiny = sizer
            .size(signal(Direction::Long), &account(dec!(400)), dec!(1.10000), dec!(0.00500), &MarketRegime::default())
            .unwrap();
        assert_eq!(tiny.total_quantity, dec!(0.01));
        assert_eq!(tiny.risk_amount, dec!(5));

        let huge = sizer
            .size(signal(Direction::Long), &account(dec!(100000000)), dec!(1.10000), dec!(0.00500), &MarketRegime::default())
            .unwrap();
        assert_eq!(huge.total_quantity, dec!(50));
    }

    #[test]
    fn test_min_lot_above_max_risk_is_rejected() {
        let sizer = sizer(RawConfig::default());
        // 0.01 lots over 50 pips risks $5, 5% of $100 against a 2% ceiling
        let err = sizer
            .size(signal(Direction::Long), &account(dec!(100)), dec!(1.10000), dec!(0.00500), &MarketRegime::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Sizing(_)));

        // over 15 pips the rounded-up minimum lot stays under the ceiling
        let plan = sizer
            .size(signal(Direction::Long), &account(dec!(100)), dec!(1.10000), dec!(0.00150), &MarketRegime::default())
            .unwrap();
        assert_eq!(plan.total_quantity, dec!(0.01));
        assert_eq!(plan.risk_amount, dec!(1.5));
    }

    #[test]
    fn test_zero_distance_is_invalid_stop() {
        let sizer = sizer(RawConfig::default());
        let err = sizer
            .size(signal(Direction::Long), &account(dec!(100000)), dec!(1.10000), Decimal::ZERO, &MarketRegime::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStop(_)));
    }

    #[test]
    fn test_adaptive_multiplier_bounded_by_max_risk() {
        let mut raw = RawConfig::default();
        raw.risk.adaptive.enabled = true;
        raw.risk.risk_percent = dec!(1.5);
        raw.risk.max_risk_percent = dec!(2.0);
        let sizer = sizer(raw);

        let strong = MarketRegime {
            adx: Some(55.0),
            trend_consistency: Some(1.0),
            atr: None,
        };
        assert_eq!(sizer.risk_multiplier(&strong), dec!(1.5));
        // 1.5 * 1.5 = 2.25 capped at 2.0
        assert_eq!(sizer.effective_risk_percent(&strong), dec!(2.0));

        let choppy = MarketRegime {
            adx: Some(12.0),
            trend_consistency: Some(0.4),
            atr: None,
        };
        assert_eq!(sizer.risk_multiplier(&choppy), dec!(0.5));
        assert_eq!(sizer.effective_risk_percent(&choppy), dec!(0.75));
    }

    #[test]
    fn test_stop_distance_modes() {
        let config = TradingConfig::from_raw(RawConfig::default()).unwrap();
        let sizer = RiskSizer::new(Arc::new(config.clone()));
        let spec = config.instrument("EURUSD").unwrap();
        assert_eq!(sizer.stop_distance(spec, Some(0.0025)).unwrap(), dec!(0.00500));
        assert!(matches!(
            sizer.stop_distance(spec, None),
            Err(EngineError::DataUnavailable { .. })
        ));

        let mut pips = spec.clone();
        pips.stops.atr_enabled = false;
        pips.stops.fixed_pips_enabled = true;
        pips.stops.stop_loss_pips = dec!(25);
        assert_eq!(sizer.stop_distance(&pips, None).unwrap(), dec!(0.00250));
    }

    #[test]
    fn test_trend_consistency() {
        use chrono::{Duration, TimeZone};
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let closes = [1.0, 1.1, 1.2, 1.15, 1.3];
        let bars: Vec<PriceBar> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceBar::new(start + Duration::hours(i as i64), *c, *c, *c, *c, 1.0))
            .collect();
        assert_eq!(trend_consistency(&bars, 4), Some(0.75));
        assert_eq!(trend_consistency(&bars, 5), None);
    }
}
