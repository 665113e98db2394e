// =============================================================================
// Indicator core — ATR, average ATR, average volume, doji detection
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR here is the simple moving average of TR over the last `period` bars.
// All functions take bars oldest-first and return `None` on insufficient or
// non-finite input; the fetcher maps that to the zero "uncomputed" sentinel.
// =============================================================================

use crate::types::Bar;

/// Most recent ATR over `period` bars. Needs `period + 1` bars (each TR
/// requires a previous close).
pub fn compute_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_sum = 0.0;
    let start = bars.len() - period;
    for i in start..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        tr_sum += hl.max(hc).max(lc);
    }

    let atr = tr_sum / period as f64;
    atr.is_finite().then_some(atr)
}

/// ATR over a stretched window (`period * multiplier`), the longer-horizon
/// baseline the entry filter compares against.
pub fn compute_average_atr(bars: &[Bar], period: usize, multiplier: usize) -> Option<f64> {
    compute_atr(bars, period.checked_mul(multiplier)?)
}

/// Mean volume of the last `period` bars, floored at `min_threshold`.
pub fn compute_average_volume(bars: &[Bar], period: usize, min_threshold: f64) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let sum: f64 = bars[bars.len() - period..].iter().map(|b| b.volume).sum();
    let mean = sum / period as f64;
    if !mean.is_finite() {
        return None;
    }
    Some(mean.max(min_threshold))
}

/// A doji closes within `doji_ratio` of its full range from the open.
pub fn is_doji(bar: &Bar, doji_ratio: f64) -> bool {
    (bar.close - bar.open).abs() <= doji_ratio * (bar.high - bar.low)
}
