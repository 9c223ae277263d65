//! Hand-written fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use venuebot::error::ExchangeError;
use venuebot::exchange::ExchangeAdapter;
use venuebot::notify::{Notifier, NotifyLevel};
use venuebot::persistence::StateStore;
use venuebot::strategy::SignalSource;
use venuebot::types::{
    Candle, ExchangePosition, Fill, Interval, OrderRequest, OrderResult, Side, Signal, TrackedPosition, Venue,
};

pub fn temp_store(name: &str) -> Arc<StateStore> {
    let dir = std::env::temp_dir().join(format!("venuebot_{name}_{}", uuid::Uuid::new_v4()));
    Arc::new(StateStore::new(dir, Venue::Bybit, "BTCUSDT").unwrap())
}

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
}

pub fn candle(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        timestamp: ts,
        open,
        high,
        low,
        close,
        volume: 1.0,
        confirmed: Some(true),
    }
}

/// Flat closed bars ending one interval before now
pub fn recent_bars(interval: Interval, count: usize, price: f64) -> Vec<Candle> {
    let step = interval.duration();
    let now = Utc::now();
    let last_open = venuebot::candle_close::align_to_boundary(interval, now) - step;
    (0..count)
        .rev()
        .map(|i| candle(last_open - step * i as i32, price, price + 1.0, price - 1.0, price))
        .collect()
}

/// Scripted venue with call counters
pub struct FakeAdapter {
    pub venue: Venue,
    pub symbol: String,
    pub price: Mutex<f64>,
    /// Returned by `get_current_price` while set
    pub price_error: Mutex<Option<ExchangeError>>,
    pub balance: Mutex<f64>,
    pub klines: Mutex<Vec<Candle>>,
    pub positions: Mutex<Result<Vec<ExchangePosition>, ExchangeError>>,
    pub history: Mutex<Vec<Fill>>,
    /// Failures returned by `close_position` before it succeeds
    pub close_failures: Mutex<VecDeque<ExchangeError>>,
    pub place_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub sl_calls: AtomicUsize,
    pub add_calls: AtomicUsize,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            venue: Venue::Bybit,
            symbol: "BTCUSDT".to_string(),
            price: Mutex::new(50_000.0),
            price_error: Mutex::new(None),
            balance: Mutex::new(1_000.0),
            klines: Mutex::new(Vec::new()),
            positions: Mutex::new(Ok(Vec::new())),
            history: Mutex::new(Vec::new()),
            close_failures: Mutex::new(VecDeque::new()),
            place_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            sl_calls: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_positions(self, rows: Vec<ExchangePosition>) -> Self {
        *self.positions.lock().unwrap() = Ok(rows);
        self
    }

    pub fn fail_closes(self, errors: Vec<ExchangeError>) -> Self {
        *self.close_failures.lock().unwrap() = errors.into();
        self
    }

    pub fn places(&self) -> usize {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn sl_updates(&self) -> usize {
        self.sl_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeAdapter for FakeAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn get_klines(&self, _interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let bars = self.klines.lock().unwrap().clone();
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.into_iter().skip(skip).collect())
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        if let Some(e) = self.price_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(*self.price.lock().unwrap())
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        let price = *self.price.lock().unwrap();
        Ok(OrderResult::filled(Some("fake-1".into()), price, request.size))
    }

    async fn update_stop_loss(&self, _new_sl: f64) -> Result<OrderResult, ExchangeError> {
        self.sl_calls.fetch_add(1, Ordering::SeqCst);
        Ok(OrderResult::ok(None))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.close_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(OrderResult::ok(Some("fake-close".into())))
    }

    async fn add_position(&self, _side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let price = *self.price.lock().unwrap();
        Ok(OrderResult::filled(Some("fake-add".into()), price, size))
    }

    async fn set_leverage(&self, _leverage: u32) -> Result<bool, ExchangeError> {
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        self.positions.lock().unwrap().clone()
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        Ok(self.history.lock().unwrap().iter().take(limit).cloned().collect())
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        None
    }
}

/// Notifier that keeps every call
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(NotifyLevel, String)>>,
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn count(&self, level: NotifyLevel) -> usize {
        self.sent.lock().unwrap().iter().filter(|(l, _)| *l == level).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, level: NotifyLevel, title: &str, _message: &str, _venue: Venue) {
        self.sent.lock().unwrap().push((level, title.to_string()));
    }
}

/// Emits one fresh signal of `side` on every extraction
pub struct FixedSignal(pub Side);

impl SignalSource for FixedSignal {
    fn extract_signals(&self, candles: &[Candle], validity_hours: f64) -> Vec<Signal> {
        candles
            .last()
            .map(|c| vec![Signal::new(self.0, "fixed", c.timestamp, validity_hours)])
            .unwrap_or_default()
    }
}

pub fn exchange_row(symbol: &str, side: Side, size: f64, entry: f64) -> ExchangePosition {
    ExchangePosition {
        symbol: symbol.to_string(),
        side,
        size,
        entry_price: entry,
        unrealized_pnl: 0.0,
        leverage: None,
        stop_loss: None,
    }
}
