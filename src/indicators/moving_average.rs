//! Simple and exponential moving averages over optional series.
//!
//! Every function returns a series aligned with its input. A `None` (or a
//! non-finite value) in the input breaks the average: SMA windows touching
//! it are unavailable and the EMA re-seeds after it.

/// Lift a raw `f64` slice into an optional series, turning non-finite
/// values into gaps.
pub fn to_series(values: &[f64]) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|v| if v.is_finite() { Some(*v) } else { None })
        .collect()
}

/// Simple moving average. First value at index `period - 1`.
pub fn sma(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let mut out = vec![None; n];
    if period == 0 || n < period {
        return out;
    }

    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        let mut sum = 0.0;
        let mut complete = true;
        for v in window {
            match v {
                Some(v) if v.is_finite() => sum += v,
                _ => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            out[i] = Some(sum / period as f64);
        }
    }
    out
}

/// Exponential moving average with alpha = 2 / (period + 1), seeded with
/// the SMA of the first `period` consecutive values.
pub fn ema(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; values.len()];
    }
    smooth(values, period, 2.0 / (period as f64 + 1.0))
}

/// Wilder smoothing (alpha = 1 / period), used by RSI, ATR and ADX.
pub fn wilder(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; values.len()];
    }
    smooth(values, period, 1.0 / period as f64)
}

/// Recursive smoothing shared by EMA and Wilder. The seed is the mean of
/// `period` consecutive available values; a gap resets the seed.
fn smooth(values: &[Option<f64>], period: usize, alpha: f64) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let mut prev: Option<f64> = None;
    let mut seed_sum = 0.0;
    let mut seed_count = 0usize;

    for (i, v) in values.iter().enumerate() {
        let Some(v) = v.filter(|v| v.is_finite()) else {
            prev = None;
            seed_sum = 0.0;
            seed_count = 0;
            continue;
        };

        match prev {
            Some(p) => {
                let next = p + alpha * (v - p);
                out[i] = Some(next);
                prev = Some(next);
            }
            None => {
                seed_sum += v;
                seed_count += 1;
                if seed_count == period {
                    let seed = seed_sum / period as f64;
                    out[i] = Some(seed);
                    prev = Some(seed);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<Option<f64>> {
        to_series(values)
    }

    #[test]
    fn test_sma_warmup_and_values() {
        let out = sma(&series(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3);
        assert_eq!(out, vec![None, None, Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[test]
    fn test_sma_gap_blocks_window() {
        let out = sma(&series(&[1.0, f64::NAN, 3.0, 4.0, 5.0]), 2);
        assert_eq!(out, vec![None, None, None, Some(3.5), Some(4.5)]);
    }

    #[test]
    fn test_ema_seeded_with_sma() {
        let out = ema(&series(&[2.0, 4.0, 6.0, 8.0]), 3);
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some(4.0));
        // alpha = 0.5: 4 + 0.5 * (8 - 4)
        assert_eq!(out[3], Some(6.0));
    }

    #[test]
    fn test_wilder_constant_series() {
        let out = wilder(&series(&[5.0; 10]), 4);
        assert!(out[..3].iter().all(|v| v.is_none()));
        assert!(out[3..].iter().all(|v| *v == Some(5.0)));
    }

    #[test]
    fn test_short_input_is_unavailable() {
        assert_eq!(sma(&series(&[1.0, 2.0]), 5), vec![None, None]);
        assert_eq!(ema(&series(&[1.0, 2.0]), 5), vec![None, None]);
    }
}
