//! Rolling indicators over candle windows.
//!
//! All window sizes are small and bounded, so everything works on plain
//! slices of the gateway's in-memory series.

use crate::exchange::Candle;
use crate::utils::decimal::safe_div;
use rust_decimal::Decimal;

/// Exponential moving average with smoothing factor `2/(n+1)`, seeded with
/// the SMA of the first `period` values. Returns one value per input index
/// from `period - 1` onward.
pub fn ema(values: &[Decimal], period: usize) -> Vec<Decimal> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = Decimal::TWO / Decimal::from(period as u64 + 1);
    let seed: Decimal = values[..period].iter().copied().sum::<Decimal>() / Decimal::from(period as u64);

    let mut out = Vec::with_capacity(values.len() - period + 1);
    let mut current = seed;
    out.push(current);
    for value in &values[period..] {
        current = (*value - current) * multiplier + current;
        out.push(current);
    }
    out
}

/// Average True Range over the last `period` candles: the mean of
/// `max(high - low, |high - prev_close|, |low - prev_close|)`. Needs one
/// extra candle for the first previous close.
pub fn atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let window = &candles[candles.len() - period - 1..];
    let mut sum = Decimal::ZERO;
    for pair in window.windows(2) {
        let prev_close = pair[0].close;
        let c = &pair[1];
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        sum += tr;
    }
    Some(sum / Decimal::from(period as u64))
}

/// Arithmetic mean, zero for an empty slice.
pub fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = values.iter().copied().sum();
    safe_div(sum, Decimal::from(values.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::flat_candles;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ema_flat_series_stays_flat() {
        let values = vec![dec!(100); 20];
        let out = ema(&values, 5);
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|v| *v == dec!(100)));
    }

    #[test]
    fn test_ema_reacts_to_jump() {
        let mut values = vec![dec!(100); 19];
        values.push(dec!(106));
        let out = ema(&values, 5);
        // multiplier 2/6: 100 + (106-100)/3 = 102
        assert_eq!(*out.last().unwrap(), dec!(102));
    }

    #[test]
    fn test_ema_short_series_empty() {
        assert!(ema(&[dec!(1), dec!(2)], 5).is_empty());
        assert!(ema(&[dec!(1)], 0).is_empty());
    }

    #[test]
    fn test_atr_flat_range() {
        // Constant close with a 0.4 high-low range: every TR is 0.4.
        let candles = flat_candles(20, dec!(100), dec!(0.4));
        assert_eq!(atr(&candles, 10), Some(dec!(0.4)));
        assert_eq!(atr(&candles, 14), Some(dec!(0.4)));
    }

    #[test]
    fn test_atr_includes_gap() {
        let mut candles = flat_candles(15, dec!(100), dec!(0.4));
        // Gap up: the last candle's TR is dominated by |high - prev_close|.
        let last = candles.last_mut().unwrap();
        last.close = dec!(101.2);
        last.high = dec!(101.2);
        last.low = dec!(100.8);
        // 13 * 0.4 + 1.2 over 14
        let expected = (dec!(0.4) * dec!(13) + dec!(1.2)) / dec!(14);
        assert_eq!(atr(&candles, 14), Some(expected));
    }

    #[test]
    fn test_atr_insufficient_data() {
        let candles = flat_candles(10, dec!(100), dec!(0.4));
        assert_eq!(atr(&candles, 10), None);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[dec!(1), dec!(2), dec!(3)]), dec!(2));
        assert_eq!(mean(&[]), Decimal::ZERO);
    }
}
