//! Volatility indicators: true range, ATR and Bollinger Bands.

use statrs::statistics::Statistics;

use super::moving_average::{sma, wilder};
use crate::models::PriceBar;

/// True range per bar. The first bar has no previous close and uses
/// high - low.
pub fn true_range(bars: &[PriceBar]) -> Vec<Option<f64>> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            if !bar.is_valid() {
                return None;
            }
            if i == 0 {
                return Some(bar.range());
            }
            let prev_close = bars[i - 1].close;
            if !prev_close.is_finite() {
                return None;
            }
            Some(
                bar.range()
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs()),
            )
        })
        .collect()
}

/// Average true range with Wilder smoothing.
pub fn atr(bars: &[PriceBar], period: usize) -> Vec<Option<f64>> {
    wilder(&true_range(bars), period)
}

/// Upper, middle and lower Bollinger bands.
#[derive(Debug, Clone, Default)]
pub struct BollingerSeries {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

/// Middle = SMA(period); bands at middle ± k · population std dev.
pub fn bollinger(closes: &[Option<f64>], period: usize, k: f64) -> BollingerSeries {
    let n = closes.len();
    let middle = sma(closes, period);
    let mut upper = vec![None; n];
    let mut lower = vec![None; n];

    for i in 0..n {
        let Some(mid) = middle[i] else {
            continue;
        };
        let window: Vec<f64> = closes[i + 1 - period..=i].iter().flatten().copied().collect();
        let sd = window.population_std_dev();
        if sd.is_finite() {
            upper[i] = Some(mid + k * sd);
            lower[i] = Some(mid - k * sd);
        }
    }

    BollingerSeries {
        upper,
        middle,
        lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::moving_average::to_series;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, high: f64, low: f64, close: f64) -> PriceBar {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(i);
        PriceBar::new(ts, close, high, low, close, 100.0)
    }

    #[test]
    fn test_true_range_uses_gap() {
        let bars = vec![bar(0, 10.0, 9.0, 9.5), bar(1, 12.0, 11.0, 11.5)];
        let tr = true_range(&bars);
        assert_eq!(tr[0], Some(1.0));
        // gap up: high - previous close
        assert_eq!(tr[1], Some(2.5));
    }

    #[test]
    fn test_atr_constant_range() {
        let bars: Vec<PriceBar> = (0..20).map(|i| bar(i, 101.0, 99.0, 100.0)).collect();
        let out = atr(&bars, 14);
        assert!(out[12].is_none());
        assert_eq!(out[13], Some(2.0));
        assert_eq!(out[19], Some(2.0));
    }

    #[test]
    fn test_bollinger_population_std() {
        let out = bollinger(&to_series(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 8, 2.0);
        // mean 5, population std 2
        assert_eq!(out.middle[7], Some(5.0));
        assert!((out.upper[7].unwrap() - 9.0).abs() < 1e-9);
        assert!((out.lower[7].unwrap() - 1.0).abs() < 1e-9);
        assert!(out.upper[6].is_none());
    }
}
