//! Candle close detection
//!
//! Decides whether a bar just closed, in priority order:
//! 1. the venue's explicit confirm flag,
//! 2. a boundary-aligned bar timestamp (deduplicated through a bounded cache),
//! 3. the synchronized server clock, within a +/-2s window around :00.

use chrono::{DateTime, Timelike, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::time_sync::ServerClock;
use crate::types::{Candle, Interval};

pub const DEFAULT_CLOSE_CACHE_SIZE: usize = 100;

/// Per-(venue, symbol, interval) close detector
pub struct CandleCloseDetector {
    interval: Interval,
    boundary_minutes: &'static [u32],
    last_close_time: Option<DateTime<Utc>>,
    close_cache: VecDeque<DateTime<Utc>>,
    cache_size: usize,
    clock: Option<Arc<dyn ServerClock>>,
}

impl CandleCloseDetector {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            boundary_minutes: interval.boundary_minutes(),
            last_close_time: None,
            close_cache: VecDeque::with_capacity(DEFAULT_CLOSE_CACHE_SIZE),
            cache_size: DEFAULT_CLOSE_CACHE_SIZE,
            clock: None,
        }
    }

    /// Attach the clock used when a frame carries no bar timestamp.
    pub fn with_clock(mut self, clock: Arc<dyn ServerClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size.max(1);
        self
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn last_close_time(&self) -> Option<DateTime<Utc>> {
        self.last_close_time
    }

    /// Convenience wrapper for a decoded candle.
    pub fn detect_candle_close(&mut self, candle: &Candle) -> bool {
        self.detect_close(Some(candle.timestamp), candle.confirmed)
    }

    pub fn detect_close(&mut self, timestamp: Option<DateTime<Utc>>, ws_confirm: Option<bool>) -> bool {
        if let Some(confirmed) = ws_confirm {
            return confirmed;
        }

        if let Some(ts) = timestamp {
            return self.detect_by_timestamp(ts);
        }

        let Some(clock) = self.clock.as_ref() else {
            return false;
        };
        let now = clock.server_now();
        self.detect_by_clock(now)
    }

    fn is_boundary_minute(&self, minute: u32) -> bool {
        self.boundary_minutes.contains(&minute)
    }

    fn detect_by_timestamp(&mut self, ts: DateTime<Utc>) -> bool {
        if !self.is_boundary_minute(ts.minute()) || ts.second() != 0 {
            return false;
        }
        if self.close_cache.contains(&ts) {
            return false;
        }

        self.last_close_time = Some(ts);
        self.close_cache.push_back(ts);
        while self.close_cache.len() > self.cache_size {
            self.close_cache.pop_front();
        }
        debug!(
            interval = %self.interval,
            boundary = %ts,
            cached = self.close_cache.len(),
            "Bar close detected from timestamp boundary"
        );
        true
    }

    fn detect_by_clock(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_boundary_minute(now.minute()) {
            return false;
        }
        let second = now.second();
        if !(second <= 2 || second >= 58) {
            return false;
        }
        if let Some(last) = self.last_close_time {
            if last.minute() == now.minute() {
                return false;
            }
        }

        self.last_close_time = Some(now);
        debug!(interval = %self.interval, at = %now, "Bar close detected from server clock");
        true
    }

    /// Round down to the latest boundary minute at or before `timestamp`.
    pub fn align_to_boundary(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        align_to_boundary(self.interval, timestamp)
    }

    pub fn reset(&mut self) {
        self.last_close_time = None;
        self.close_cache.clear();
    }
}

/// Stateless form of [`CandleCloseDetector::align_to_boundary`].
pub fn align_to_boundary(interval: Interval, timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let minute = timestamp.minute();
    let aligned_minute = interval
        .boundary_minutes()
        .iter()
        .copied()
        .filter(|m| *m <= minute)
        .max()
        .unwrap_or(0);

    timestamp
        .with_minute(aligned_minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl ServerClock for FixedClock {
        fn server_now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn confirm_flag_wins_outright() {
        let mut detector = CandleCloseDetector::new(Interval::Min15);
        // off-boundary timestamp, but the venue says closed
        assert!(detector.detect_close(Some(at(14, 7, 31)), Some(true)));
        assert!(!detector.detect_close(Some(at(14, 15, 0)), Some(false)));
        // confirm path never touches the dedup cache
        assert!(detector.detect_close(Some(at(14, 15, 0)), None));
    }

    #[test]
    fn timestamp_boundary_reports_once() {
        let mut detector = CandleCloseDetector::new(Interval::Min15);
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 14, 15, 0).unwrap();
        assert!(detector.detect_close(Some(ts), None));
        assert!(!detector.detect_close(Some(ts), None));

        detector.reset();
        assert!(detector.detect_close(Some(ts), None));
    }

    #[test]
    fn non_boundary_timestamps_never_close() {
        let mut detector = CandleCloseDetector::new(Interval::Min15);
        assert!(!detector.detect_close(Some(at(14, 16, 0)), None));
        assert!(!detector.detect_close(Some(at(14, 15, 1)), None));

        let mut hourly = CandleCloseDetector::new(Interval::Hour1);
        assert!(!hourly.detect_close(Some(at(14, 15, 0)), None));
        assert!(hourly.detect_close(Some(at(15, 0, 0)), None));
    }

    #[test]
    fn cache_eviction_is_fifo() {
        let mut detector = CandleCloseDetector::new(Interval::Min15).with_cache_size(2);
        assert!(detector.detect_close(Some(at(10, 0, 0)), None));
        assert!(detector.detect_close(Some(at(10, 15, 0)), None));
        assert!(detector.detect_close(Some(at(10, 30, 0)), None));
        // 10:00 was evicted, so it is reported again
        assert!(detector.detect_close(Some(at(10, 0, 0)), None));
        assert!(!detector.detect_close(Some(at(10, 30, 0)), None));
    }

    #[test]
    fn clock_path_uses_tolerance_window() {
        let mut detector =
            CandleCloseDetector::new(Interval::Min15).with_clock(Arc::new(FixedClock(at(14, 30, 1))));
        assert!(detector.detect_close(None, None));
        // same minute again is suppressed
        assert!(!detector.detect_close(None, None));

        let mut late =
            CandleCloseDetector::new(Interval::Min15).with_clock(Arc::new(FixedClock(at(14, 30, 5))));
        assert!(!late.detect_close(None, None));

        let mut off =
            CandleCloseDetector::new(Interval::Min15).with_clock(Arc::new(FixedClock(at(14, 31, 0))));
        assert!(!off.detect_close(None, None));
    }

    #[test]
    fn without_clock_or_timestamp_nothing_closes() {
        let mut detector = CandleCloseDetector::new(Interval::Min15);
        assert!(!detector.detect_close(None, None));
    }

    #[test]
    fn align_rounds_down_to_boundary() {
        let detector = CandleCloseDetector::new(Interval::Min15);
        assert_eq!(detector.align_to_boundary(at(14, 29, 59)), at(14, 15, 0));
        assert_eq!(detector.align_to_boundary(at(14, 15, 3)), at(14, 15, 0));
        assert_eq!(detector.align_to_boundary(at(14, 16, 0)), at(14, 15, 0));
        assert_eq!(align_to_boundary(Interval::Hour1, at(14, 59, 59)), at(14, 0, 0));
    }

    #[test]
    fn align_is_idempotent() {
        let base = at(0, 0, 0);
        for offset_secs in (0..86_400).step_by(397) {
            let t = base + chrono::Duration::seconds(offset_secs)
                + chrono::Duration::milliseconds(123);
            for interval in [Interval::Min15, Interval::Hour1, Interval::Min5] {
                let once = align_to_boundary(interval, t);
                assert_eq!(align_to_boundary(interval, once), once);
            }
        }
    }
}
