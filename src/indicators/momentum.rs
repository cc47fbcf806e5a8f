//! Momentum oscillators: RSI and MACD.

use super::moving_average::{ema, wilder};

/// Relative Strength Index with Wilder smoothing of gains and losses.
///
/// RSI = 100 - 100 / (1 + avg_gain / avg_loss). A flat window (no gains,
/// no losses) reads 50; a window with no losses reads 100.
pub fn rsi(closes: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let n = closes.len();
    let mut gains = vec![None; n];
    let mut losses = vec![None; n];

    for i in 1..n {
        if let (Some(curr), Some(prev)) = (closes[i], closes[i - 1]) {
            let change = curr - prev;
            if change.is_finite() {
                gains[i] = Some(change.max(0.0));
                losses[i] = Some((-change).max(0.0));
            }
        }
    }

    let avg_gain = wilder(&gains, period);
    let avg_loss = wilder(&losses, period);

    avg_gain
        .iter()
        .zip(avg_loss.iter())
        .map(|(g, l)| match (g, l) {
            (Some(g), Some(l)) => Some(rsi_value(*g, *l)),
            _ => None,
        })
        .collect()
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// MACD line, signal line and histogram.
#[derive(Debug, Clone, Default)]
pub struct MacdSeries {
    pub macd: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

/// MACD = EMA(fast) - EMA(slow); signal = EMA(signal_period) of MACD;
/// histogram = MACD - signal.
pub fn macd(
    closes: &[Option<f64>],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> MacdSeries {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let macd_line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let signal = ema(&macd_line, signal_period);

    let histogram = macd_line
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| Some((*m)? - (*s)?))
        .collect();

    MacdSeries {
        macd: macd_line,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::moving_average::to_series;

    #[test]
    fn test_rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&to_series(&closes), 14);
        assert!(out[13].is_none());
        assert_eq!(out[14], Some(100.0));
        assert_eq!(out[19], Some(100.0));
    }

    #[test]
    fn test_rsi_flat_is_50() {
        let out = rsi(&to_series(&[10.0; 20]), 14);
        assert_eq!(out[19], Some(50.0));
    }

    #[test]
    fn test_rsi_in_range() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        for v in rsi(&to_series(&closes), 14).into_iter().flatten() {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn test_macd_warmup_and_sign() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let out = macd(&to_series(&closes), 12, 26, 9);
        assert!(out.macd[24].is_none());
        assert!(out.macd[25].is_some());
        // signal needs 9 MACD values
        assert!(out.signal[32].is_none());
        assert!(out.signal[33].is_some());
        // rising prices keep the fast EMA above the slow one
        assert!(out.macd[59].unwrap() > 0.0);
        assert_eq!(out.histogram.len(), 60);
    }
}
