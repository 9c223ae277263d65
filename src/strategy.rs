//! Strategy collaborators
//!
//! The trading loop consumes indicator numbers and trailing proposals but
//! does not own the math. [`StrategyMath`] carries default implementations
//! (Wilder RSI, simple ATR, EMA trend, R-multiple trailing) that any
//! strategy can override; [`SignalSource`] is where pattern extraction plugs in.

use tracing::debug;

use crate::signals::Trend;
use crate::types::{Candle, Position, Side, Signal};

pub const DEFAULT_TREND_EMA: usize = 20;

/// Result of one trailing computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingUpdate {
    /// The bar touched the stop in force before this tick
    pub sl_hit: bool,
    /// Best price reached, including this bar
    pub new_extreme: f64,
    /// Proposed stop, only when strictly more favorable than the current one
    pub new_sl: Option<f64>,
}

/// Indicator and trailing math consumed by the position manager
pub trait StrategyMath: Send + Sync {
    fn rsi(&self, candles: &[Candle], period: usize) -> Option<f64> {
        wilder_rsi(candles, period)
    }

    fn atr(&self, candles: &[Candle], period: usize) -> Option<f64> {
        average_true_range(candles, period)
    }

    /// Trend of the pattern-interval series; `None` when there is too little data.
    fn trend(&self, candles: &[Candle]) -> Option<Trend> {
        ema_trend(candles, DEFAULT_TREND_EMA)
    }

    fn compute_trailing(&self, position: &Position, high: f64, low: f64, rsi: f64) -> TrailingUpdate {
        trailing_update(position, high, low, rsi)
    }
}

/// The built-in math with no overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategyMath;

impl StrategyMath for DefaultStrategyMath {}

/// Pattern extraction hook
pub trait SignalSource: Send + Sync {
    /// Signals found in the closed bars of `candles`.
    fn extract_signals(&self, candles: &[Candle], validity_hours: f64) -> Vec<Signal>;
}

/// Source that never signals; the bot then only manages existing positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignals;

impl SignalSource for NoSignals {
    fn extract_signals(&self, _candles: &[Candle], _validity_hours: f64) -> Vec<Signal> {
        Vec::new()
    }
}

/// RSI with Wilder smoothing, seeded by the simple average of the first
/// `period` changes.
pub fn wilder_rsi(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        debug!(candles = candles.len(), required = period + 1, "RSI: not enough candles");
        return None;
    }

    let changes: Vec<f64> = candles.windows(2).map(|w| w[1].close - w[0].close).collect();
    let p = period as f64;

    let (mut avg_gain, mut avg_loss) = changes[..period].iter().fold((0.0, 0.0), |(g, l), c| {
        if *c > 0.0 {
            (g + c, l)
        } else {
            (g, l - c)
        }
    });
    avg_gain /= p;
    avg_loss /= p;

    for change in &changes[period..] {
        avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
    }

    if avg_loss < 1e-12 && avg_gain < 1e-12 {
        return Some(50.0);
    }
    if avg_loss < 1e-12 {
        return Some(99.0);
    }
    if avg_gain < 1e-12 {
        return Some(1.0);
    }
    let rs = avg_gain / avg_loss;
    Some((100.0 - 100.0 / (1.0 + rs)).clamp(1.0, 99.0))
}

/// Mean true range over the last `period` bars
pub fn average_true_range(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let tail = &candles[candles.len() - period - 1..];
    let sum: f64 = tail
        .windows(2)
        .map(|w| {
            let (prev, curr) = (&w[0], &w[1]);
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .sum();
    Some(sum / period as f64)
}

/// Up when the last close is above its EMA, down otherwise.
pub fn ema_trend(candles: &[Candle], period: usize) -> Option<Trend> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = candles[0].close;
    for c in &candles[1..] {
        ema = (c.close - ema) * k + ema;
    }
    let last = candles[candles.len() - 1].close;
    Some(if last > ema { Trend::Up } else { Trend::Down })
}

/// Track the extreme, then trail the stop once the extreme passes the
/// activation price. The trail widens in strong momentum and tightens
/// against it.
pub fn trailing_update(position: &Position, high: f64, low: f64, rsi: f64) -> TrailingUpdate {
    let side = position.side;
    let sl_hit = match side {
        Side::Long => low <= position.stop_loss,
        Side::Short => high >= position.stop_loss,
    };

    let new_extreme = match side {
        Side::Long => position.extreme_price.max(high),
        Side::Short => position.extreme_price.min(low),
    };

    let activated = match side {
        Side::Long => new_extreme >= position.trail_start_price,
        Side::Short => new_extreme <= position.trail_start_price,
    };
    if !activated || position.trail_distance <= 0.0 {
        return TrailingUpdate { sl_hit, new_extreme, new_sl: None };
    }

    let mult = match side {
        Side::Long if rsi > 70.0 => 2.0,
        Side::Long if rsi < 50.0 => 0.8,
        Side::Short if rsi < 30.0 => 2.0,
        Side::Short if rsi > 50.0 => 0.8,
        _ => 1.0,
    };
    let candidate = new_extreme - side.sign() * position.trail_distance * mult;
    let new_sl = side
        .is_favorable_stop(candidate, position.stop_loss)
        .then_some(candidate);

    TrailingUpdate { sl_hit, new_extreme, new_sl }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle {
                timestamp: start + Duration::minutes(15 * i as i64),
                open: *c,
                high: c + 1.0,
                low: c - 1.0,
                close: *c,
                volume: 1.0,
                confirmed: Some(true),
            })
            .collect()
    }

    #[test]
    fn rsi_needs_period_plus_one() {
        assert!(wilder_rsi(&series(&[1.0; 14]), 14).is_none());
        assert_eq!(wilder_rsi(&series(&[100.0; 15]), 14), Some(50.0));
    }

    #[test]
    fn rsi_reflects_direction() {
        let up: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let down: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert_eq!(wilder_rsi(&series(&up), 14), Some(99.0));
        assert_eq!(wilder_rsi(&series(&down), 14), Some(1.0));

        let mixed = [100.0, 102.0, 101.0, 103.0, 102.0, 104.0, 103.0, 105.0, 104.0, 106.0, 105.0, 107.0, 106.0, 108.0, 107.0];
        let rsi = wilder_rsi(&series(&mixed), 14).unwrap();
        assert!(rsi > 50.0 && rsi < 99.0);
    }

    #[test]
    fn atr_of_constant_range() {
        let candles = series(&[100.0; 20]);
        assert_eq!(average_true_range(&candles, 14), Some(2.0));
    }

    #[test]
    fn trend_follows_last_close() {
        let up: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(ema_trend(&series(&up), 20), Some(Trend::Up));
        assert_eq!(ema_trend(&series(&up[..10]), 20), None);
    }

    #[test]
    fn trailing_activates_past_start() {
        // entry 100, SL 98 -> risk 2, trail start 101.6, distance 1.0
        let p = Position::open("BTCUSDT", Side::Long, 100.0, 1.0, 98.0, 0.8, 0.5);

        let quiet = trailing_update(&p, 101.0, 99.5, 60.0);
        assert!(!quiet.sl_hit);
        assert_eq!(quiet.new_extreme, 101.0);
        assert!(quiet.new_sl.is_none());

        let run = trailing_update(&p, 104.0, 101.0, 60.0);
        assert_eq!(run.new_extreme, 104.0);
        assert_eq!(run.new_sl, Some(103.0));
    }

    #[test]
    fn short_trailing_and_hit() {
        let p = Position::open("BTCUSDT", Side::Short, 100.0, 1.0, 102.0, 0.8, 0.5);
        let run = trailing_update(&p, 99.0, 96.0, 40.0);
        assert_eq!(run.new_extreme, 96.0);
        assert_eq!(run.new_sl, Some(97.0));

        let hit = trailing_update(&p, 102.5, 99.0, 40.0);
        assert!(hit.sl_hit);
    }

    #[test]
    fn no_signals_source_is_empty() {
        assert!(NoSignals.extract_signals(&series(&[1.0; 60]), 12.0).is_empty());
    }
}
