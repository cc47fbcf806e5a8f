//! Trend strength: ADX with directional indicators.

use super::moving_average::wilder;
use super::volatility::true_range;
use crate::models::PriceBar;

/// ADX, +DI and -DI aligned with the input bars.
#[derive(Debug, Clone, Default)]
pub struct AdxSeries {
    pub adx: Vec<Option<f64>>,
    pub plus_di: Vec<Option<f64>>,
    pub minus_di: Vec<Option<f64>>,
}

/// Wilder's ADX. TR and directional movement are smoothed over `period`,
/// DX is derived from the DI pair and smoothed again over the same period.
/// The first bar has no directional movement, so +DI/-DI start at index
/// `period` and ADX at `2 * period - 1`.
pub fn adx(bars: &[PriceBar], period: usize) -> AdxSeries {
    let n = bars.len();
    let tr = true_range(bars);

    let mut tr_dm = vec![None; n];
    let mut plus_dm = vec![None; n];
    let mut minus_dm = vec![None; n];

    for i in 1..n {
        let (curr, prev) = (&bars[i], &bars[i - 1]);
        if !curr.is_valid() || !prev.is_valid() {
            continue;
        }
        let up = curr.high - prev.high;
        let down = prev.low - curr.low;

        plus_dm[i] = Some(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm[i] = Some(if down > up && down > 0.0 { down } else { 0.0 });
        tr_dm[i] = tr[i];
    }

    let smoothed_tr = wilder(&tr_dm, period);
    let smoothed_plus = wilder(&plus_dm, period);
    let smoothed_minus = wilder(&minus_dm, period);

    let mut plus_di = vec![None; n];
    let mut minus_di = vec![None; n];
    let mut dx = vec![None; n];

    for i in 0..n {
        let (Some(tr), Some(p), Some(m)) = (smoothed_tr[i], smoothed_plus[i], smoothed_minus[i])
        else {
            continue;
        };
        if tr <= 0.0 {
            continue;
        }
        let pdi = 100.0 * p / tr;
        let mdi = 100.0 * m / tr;
        plus_di[i] = Some(pdi);
        minus_di[i] = Some(mdi);

        let sum = pdi + mdi;
        if sum > 0.0 {
            dx[i] = Some(100.0 * (pdi - mdi).abs() / sum);
        }
    }

    AdxSeries {
        adx: wilder(&dx, period),
        plus_di,
        minus_di,
    }
}
