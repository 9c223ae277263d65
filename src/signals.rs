//! Pending signal queue and entry-readiness gates
//!
//! Signals produced at pattern-interval closes wait here until they expire
//! or an entry consumes them. Readiness combines three gates: a pending
//! signal of the side, the RSI pullback gate, and the higher-timeframe trend.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info};

use crate::types::{hours, Side, Signal};

pub const DEFAULT_QUEUE_LEN: usize = 100;
pub const DEFAULT_VALIDITY_HOURS: f64 = 12.0;

/// Which sides the bot may enter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionFilter {
    #[default]
    Both,
    Long,
    Short,
}

impl DirectionFilter {
    pub fn allows(&self, side: Side) -> bool {
        match self {
            DirectionFilter::Both => true,
            DirectionFilter::Long => side == Side::Long,
            DirectionFilter::Short => side == Side::Short,
        }
    }
}

/// Higher-timeframe trend classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Up => write!(f, "up"),
            Trend::Down => write!(f, "down"),
            Trend::Neutral => write!(f, "neutral"),
        }
    }
}

/// RSI thresholds for the pullback gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RsiGate {
    pub pullback_long: f64,
    pub pullback_short: f64,
}

impl Default for RsiGate {
    fn default() -> Self {
        Self {
            pullback_long: 45.0,
            pullback_short: 55.0,
        }
    }
}

/// Outcome of [`SignalQueue::trading_conditions`]
#[derive(Debug, Clone, PartialEq)]
pub struct TradingConditions {
    pub ready: bool,
    pub direction: Option<Side>,
    pub pending_long: bool,
    pub pending_short: bool,
    pub rsi: f64,
    pub rsi_long_met: bool,
    pub rsi_short_met: bool,
    /// `None` when there was not enough data to classify
    pub trend: Option<Trend>,
    pub trend_long_met: bool,
    pub trend_short_met: bool,
    pub valid_pending: usize,
}

/// Bounded FIFO of pending signals, deduplicated by time + type
#[derive(Debug, Clone)]
pub struct SignalQueue {
    pending: VecDeque<Signal>,
    max_len: usize,
    validity_hours: f64,
    direction: DirectionFilter,
    gate: RsiGate,
    last_check_time: Option<DateTime<Utc>>,
    /// Signals an entry already used; never queued again before they expire
    consumed: Vec<Signal>,
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_LEN, DEFAULT_VALIDITY_HOURS)
    }
}

impl SignalQueue {
    pub fn new(max_len: usize, validity_hours: f64) -> Self {
        let max_len = max_len.max(1);
        Self {
            pending: VecDeque::with_capacity(max_len),
            max_len,
            validity_hours,
            direction: DirectionFilter::Both,
            gate: RsiGate::default(),
            last_check_time: None,
            consumed: Vec::new(),
        }
    }

    pub fn with_direction(mut self, direction: DirectionFilter) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_rsi_gate(mut self, gate: RsiGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn validity(&self) -> Duration {
        hours(self.validity_hours)
    }

    // ========== Filtering ==========

    /// Signals whose bar time lies in `[now - validity, now + 1h]`.
    pub fn filter_valid(&self, signals: &[Signal], now: DateTime<Utc>) -> Vec<Signal> {
        let earliest = now - self.validity();
        let latest = now + Duration::hours(1);
        signals
            .iter()
            .filter(|s| s.entry_time >= earliest && s.entry_time <= latest)
            .cloned()
            .collect()
    }

    // ========== Queue ==========

    fn contains_key(&self, key: &str) -> bool {
        self.pending.iter().any(|p| p.key() == key)
    }

    pub fn is_consumed(&self, key: &str) -> bool {
        self.consumed.iter().any(|c| c.key() == key)
    }

    fn push(&mut self, signal: Signal) {
        if self.pending.len() >= self.max_len {
            if let Some(evicted) = self.pending.pop_front() {
                debug!(key = %evicted.key(), "Signal queue full, evicted oldest");
            }
        }
        self.pending.push_back(signal);
    }

    /// Validate, dedup and enqueue one signal. Returns whether it was added.
    pub fn add_signal(&mut self, signal: Signal, now: DateTime<Utc>) -> bool {
        let Some(signal) = self.filter_valid(std::slice::from_ref(&signal), now).pop() else {
            debug!(key = %signal.key(), "Signal outside validity window, dropped");
            return false;
        };
        if self.contains_key(&signal.key()) {
            return false;
        }
        if self.is_consumed(&signal.key()) {
            debug!(key = %signal.key(), "Signal already consumed by an entry, dropped");
            return false;
        }
        info!(side = %signal.signal_type, pattern = %signal.pattern, time = %signal.entry_time, "✨ Signal queued");
        self.push(signal);
        true
    }

    /// Take the fresh signals of one pattern scan.
    ///
    /// Only signals at or after the previous check time are considered, and
    /// only those whose expiry is still after `last_bar_time`. The check time
    /// then advances to `last_bar_time`. Returns the number of new signals.
    pub fn ingest(&mut self, signals: Vec<Signal>, last_bar_time: DateTime<Utc>) -> usize {
        let since = self
            .last_check_time
            .unwrap_or_else(|| last_bar_time - self.validity());

        let mut added = 0;
        for mut signal in signals {
            if signal.entry_time < since {
                continue;
            }
            let expire_time = signal.entry_time + self.validity();
            if expire_time <= last_bar_time {
                continue;
            }
            signal.expire_time = expire_time;
            let key = signal.key();
            if !self.contains_key(&key) && !self.is_consumed(&key) {
                self.push(signal);
                added += 1;
            }
        }
        self.last_check_time = Some(last_bar_time);

        if added > 0 {
            info!(added, total = self.pending.len(), "Pattern scan queued new signals");
        }
        added
    }

    /// Pending signals that have not yet expired.
    pub fn valid_pending(&self, now: DateTime<Utc>) -> Vec<Signal> {
        self.pending.iter().filter(|s| s.expire_time > now).cloned().collect()
    }

    /// Drop expired signals. Returns how many remain pending.
    pub fn clear_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.pending.retain(|s| s.expire_time > now);
        self.consumed.retain(|s| s.expire_time > now);
        self.pending.len()
    }

    /// Consume every pending signal after an entry.
    ///
    /// The queue empties but the check time stays put, and the consumed
    /// signals are remembered until they expire so no later scan (or a
    /// restart that re-reads the same bars) can queue them again.
    pub fn clear(&mut self) {
        let used: Vec<Signal> = self.pending.drain(..).collect();
        for signal in used {
            if !self.is_consumed(&signal.key()) {
                self.consumed.push(signal);
            }
        }
    }

    /// Replace the queue with a persisted snapshot, keeping only live signals.
    ///
    /// `consumed` is the list saved by [`SignalQueue::consumed`]; pending
    /// entries that appear in it are dropped.
    pub fn restore(&mut self, signals: Vec<Signal>, consumed: Vec<Signal>, now: DateTime<Utc>) -> usize {
        self.consumed = consumed.into_iter().filter(|s| s.expire_time > now).collect();
        let mut seen = HashSet::new();
        self.pending.clear();
        for signal in signals {
            if signal.expire_time > now && !self.is_consumed(&signal.key()) && seen.insert(signal.key()) {
                self.push(signal);
            }
        }
        self.pending.len()
    }

    pub fn snapshot(&self) -> Vec<Signal> {
        self.pending.iter().cloned().collect()
    }

    pub fn consumed(&self) -> Vec<Signal> {
        self.consumed.clone()
    }

    /// One-line summary for status logs
    pub fn summary(&self, now: DateTime<Utc>) -> String {
        let live = self.valid_pending(now);
        let longs = live.iter().filter(|s| s.signal_type == Side::Long).count();
        let shorts = live.len() - longs;
        format!("{} pending ({} live: {longs}L/{shorts}S)", self.pending.len(), live.len())
    }

    // ========== Entry gates ==========

    /// Combine pending signals, RSI and trend into an entry decision.
    ///
    /// Long needs a pending Long, `rsi < pullback_long` and a trend that is
    /// up, neutral or unknown. Short mirrors it. A direction filter masks the
    /// excluded side entirely. Long wins when both sides qualify.
    pub fn trading_conditions(&self, rsi: f64, trend: Option<Trend>, now: DateTime<Utc>) -> TradingConditions {
        let live = self.valid_pending(now);
        let mut pending_long = live.iter().any(|s| s.signal_type == Side::Long);
        let mut pending_short = live.iter().any(|s| s.signal_type == Side::Short);

        let rsi_long_met = rsi < self.gate.pullback_long;
        let rsi_short_met = rsi > self.gate.pullback_short;

        let mut trend_long_met = matches!(trend, None | Some(Trend::Up) | Some(Trend::Neutral));
        let mut trend_short_met = matches!(trend, None | Some(Trend::Down) | Some(Trend::Neutral));

        if !self.direction.allows(Side::Long) {
            pending_long = false;
            trend_long_met = false;
        }
        if !self.direction.allows(Side::Short) {
            pending_short = false;
            trend_short_met = false;
        }

        let long = pending_long && rsi_long_met && trend_long_met;
        let short = pending_short && rsi_short_met && trend_short_met;
        let direction = if long {
            Some(Side::Long)
        } else if short {
            Some(Side::Short)
        } else {
            None
        };

        TradingConditions {
            ready: direction.is_some(),
            direction,
            pending_long,
            pending_short,
            rsi,
            rsi_long_met,
            rsi_short_met,
            trend,
            trend_long_met,
            trend_short_met,
            valid_pending: live.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    fn signal(side: Side, hours_ago: i64) -> Signal {
        Signal::new(side, "W", now() - Duration::hours(hours_ago), 12.0)
    }

    #[test]
    fn filter_valid_window() {
        let q = SignalQueue::default();
        let signals = vec![
            signal(Side::Long, 1),
            signal(Side::Long, 13),
            Signal::new(Side::Short, "M", now() + Duration::minutes(30), 12.0),
            Signal::new(Side::Short, "M", now() + Duration::hours(2), 12.0),
        ];
        let valid = q.filter_valid(&signals, now());
        assert_eq!(valid.len(), 2);
    }

    #[test]
    fn add_signal_dedups_by_time_and_type() {
        let mut q = SignalQueue::default();
        assert!(q.add_signal(signal(Side::Long, 1), now()));
        assert!(!q.add_signal(signal(Side::Long, 1), now()));
        assert!(q.add_signal(signal(Side::Short, 1), now()));
        assert!(!q.add_signal(signal(Side::Long, 20), now()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn queue_evicts_oldest_when_full() {
        let mut q = SignalQueue::new(2, 12.0);
        q.add_signal(signal(Side::Long, 3), now());
        q.add_signal(signal(Side::Long, 2), now());
        q.add_signal(signal(Side::Long, 1), now());
        let times: Vec<_> = q.snapshot().iter().map(|s| s.entry_time).collect();
        assert_eq!(times, vec![now() - Duration::hours(2), now() - Duration::hours(1)]);
    }

    #[test]
    fn ingest_skips_signals_before_last_check() {
        let mut q = SignalQueue::default();
        let first = q.ingest(vec![signal(Side::Long, 2), signal(Side::Short, 20)], now());
        assert_eq!(first, 1);

        let later = now() + Duration::hours(1);
        let second = q.ingest(
            vec![signal(Side::Long, 2), Signal::new(Side::Short, "M", later, 12.0)],
            later,
        );
        assert_eq!(second, 1);
        assert_eq!(q.len(), 2);
        assert!(q.snapshot().iter().all(|s| s.expire_time == s.entry_time + Duration::hours(12)));
    }

    #[test]
    fn clear_expired_keeps_live() {
        let mut q = SignalQueue::default();
        q.add_signal(signal(Side::Long, 11), now());
        q.add_signal(signal(Side::Short, 1), now());
        assert_eq!(q.clear_expired(now() + Duration::hours(2)), 1);
        assert!(q.summary(now()).starts_with("1 pending"));
    }

    #[test]
    fn long_ready_when_all_gates_pass() {
        let mut q = SignalQueue::default();
        q.add_signal(signal(Side::Long, 1), now());

        let c = q.trading_conditions(40.0, Some(Trend::Up), now());
        assert!(c.ready);
        assert_eq!(c.direction, Some(Side::Long));

        assert!(!q.trading_conditions(50.0, Some(Trend::Up), now()).ready);
        assert!(!q.trading_conditions(40.0, Some(Trend::Down), now()).ready);
        assert!(q.trading_conditions(40.0, None, now()).ready);
    }

    #[test]
    fn direction_filter_masks_side() {
        let mut q = SignalQueue::default().with_direction(DirectionFilter::Long);
        q.add_signal(signal(Side::Short, 1), now());
        let c = q.trading_conditions(70.0, Some(Trend::Down), now());
        assert!(!c.ready);
        assert!(!c.pending_short);
    }

    #[test]
    fn restore_drops_expired_and_duplicates() {
        let mut q = SignalQueue::default();
        let live = signal(Side::Long, 1);
        let dead = signal(Side::Short, 13);
        assert_eq!(q.restore(vec![live.clone(), live, dead], Vec::new(), now()), 1);
    }

    #[test]
    fn consumed_signal_is_not_queued_again() {
        let mut q = SignalQueue::default();
        let w = signal(Side::Long, 4);
        assert_eq!(q.ingest(vec![w.clone()], now() - Duration::hours(3)), 1);

        q.clear();
        assert!(q.is_empty());
        assert!(q.is_consumed(&w.key()));

        // the next pattern scan still sees the same W inside its window
        assert_eq!(q.ingest(vec![w.clone()], now() - Duration::hours(2)), 0);
        assert!(!q.add_signal(w.clone(), now()));
        assert!(q.is_empty());

        // a fresh queue restored from cache keeps the memory
        let mut restarted = SignalQueue::default();
        assert_eq!(restarted.restore(Vec::new(), q.consumed(), now()), 0);
        assert_eq!(restarted.ingest(vec![w.clone()], now() - Duration::hours(2)), 0);

        // once expired the key is forgotten
        q.clear_expired(now() + Duration::hours(9));
        assert!(!q.is_consumed(&w.key()));
    }
}
