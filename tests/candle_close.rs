//! Close detection and boundary alignment

mod common;

use chrono::Duration;
use common::{at, candle};
use venuebot::candle_close::{align_to_boundary, CandleCloseDetector};
use venuebot::types::Interval;

#[test]
fn fifteen_minute_close_reported_once() {
    let mut detector = CandleCloseDetector::new(Interval::Min15);
    let mut bar = candle(at(14, 15, 0), 100.0, 101.0, 99.0, 100.5);
    bar.confirmed = None;

    assert!(detector.detect_candle_close(&bar));
    assert!(!detector.detect_candle_close(&bar));
}

#[test]
fn repeated_close_suppressed_until_reset() {
    let mut detector = CandleCloseDetector::new(Interval::Min15).with_cache_size(4);
    let ts = at(9, 30, 0);
    assert!(detector.detect_close(Some(ts), None));
    for _ in 0..5 {
        assert!(!detector.detect_close(Some(ts), None));
    }
    detector.reset();
    assert!(detector.detect_close(Some(ts), None));
}

#[test]
fn evicted_close_can_report_again() {
    let mut detector = CandleCloseDetector::new(Interval::Min15).with_cache_size(2);
    let first = at(10, 0, 0);
    assert!(detector.detect_close(Some(first), None));
    assert!(detector.detect_close(Some(at(10, 15, 0)), None));
    assert!(detector.detect_close(Some(at(10, 30, 0)), None));
    assert!(detector.detect_close(Some(first), None));
}

#[test]
fn align_rounds_down_to_quarter_hour() {
    assert_eq!(align_to_boundary(Interval::Min15, at(14, 29, 59)), at(14, 15, 0));
}

#[test]
fn alignment_is_idempotent() {
    let intervals = [
        Interval::Min1,
        Interval::Min5,
        Interval::Min15,
        Interval::Min30,
        Interval::Hour1,
        Interval::Hour4,
        Interval::Day1,
    ];
    let start = at(0, 0, 0);
    for interval in intervals {
        for step in (0..2 * 24 * 60 * 60).step_by(997) {
            let t = start + Duration::seconds(step);
            let once = align_to_boundary(interval, t);
            assert_eq!(align_to_boundary(interval, once), once, "{interval} at {t}");
            assert!(once <= t);
        }
    }
}
