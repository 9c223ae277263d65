//! Market-data streams
//!
//! One persistent WebSocket per (venue, symbol, interval), run as its own
//! tokio task. Frames are decoded by the venue's [`StreamCodec`], bar closes
//! are resolved through the [`CandleCloseDetector`], and everything is
//! forwarded in arrival order as [`StreamEvent`]s over an mpsc channel.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> (Disconnected | Stopped)`.
//! Running out of reconnect attempts and an explicit [`StreamHandle::stop`]
//! both end in `Stopped`, which is terminal.

pub mod codec;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::candle_close::CandleCloseDetector;
use crate::error::ExchangeError;
use crate::time_sync::ServerClock;
use crate::types::{Candle, Interval, Venue};

pub use codec::{codec_for, Frame, StreamCodec};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Reconnect and liveness tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub max_reconnect_attempts: u32,
    pub base_delay_secs: f64,
    pub backoff_factor: f64,
    pub max_delay_secs: f64,
    pub health_timeout_secs: u64,
    pub stop_join_timeout_secs: u64,
    pub ping_interval_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 20,
            base_delay_secs: 3.0,
            backoff_factor: 1.5,
            max_delay_secs: 60.0,
            health_timeout_secs: 30,
            stop_join_timeout_secs: 5,
            ping_interval_secs: 20,
        }
    }
}

impl StreamSettings {
    /// `min(base * factor^attempts, max)`
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exp = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = (self.base_delay_secs * self.backoff_factor.powi(exp)).min(self.max_delay_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleEvent {
    pub candle: Candle,
    pub is_close: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Ticker push. `boundary_close` is set when the synchronized clock says
    /// a bar boundary just passed.
    Price {
        price: f64,
        at: Option<DateTime<Utc>>,
        boundary_close: bool,
    },
    Candle(CandleEvent),
    Connected,
    Disconnected(String),
    /// Terminal. No reconnect follows.
    Stopped(String),
}

/// State shared between the stream task and its handle
struct Shared {
    state: watch::Sender<StreamState>,
    sink: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    last_message: Mutex<Option<Instant>>,
    ever_connected: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    fn touch(&self) {
        *self.last_message.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    fn detach(&self) {
        *self.sink.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    async fn emit(&self, event: StreamEvent) {
        let sink = self.sink.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(tx) = sink {
            // a dropped receiver only means nobody is listening any more
            let _ = tx.send(event).await;
        }
    }
}

/// Control handle of a running stream
pub struct StreamHandle {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<StreamState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl StreamHandle {
    pub fn state(&self) -> StreamState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state_rx.clone()
    }

    /// False if never connected, not connected now, or silent for `timeout`.
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        if !self.shared.ever_connected.load(Ordering::Relaxed) || self.state() != StreamState::Connected {
            return false;
        }
        self.shared
            .last_message
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some_and(|t| t.elapsed() < timeout)
    }

    /// Detach the event sink, signal shutdown and join the task within the
    /// configured timeout. A task that does not exit in time is aborted.
    pub async fn stop(&self) {
        self.shared.detach();
        let _ = self.shutdown.send(true);

        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.join_timeout, &mut task).await.is_err() {
                warn!(timeout = ?self.join_timeout, "Stream task did not exit in time, aborting");
                task.abort();
            }
        }
        self.shared.set_state(StreamState::Stopped);
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Builder and run loop for one market stream
pub struct StreamHandler {
    venue: Venue,
    symbol: String,
    interval: Interval,
    codec: Arc<dyn StreamCodec>,
    url: String,
    settings: StreamSettings,
    clock: Option<Arc<dyn ServerClock>>,
}

impl StreamHandler {
    pub fn new(venue: Venue, symbol: &str, interval: Interval, settings: StreamSettings) -> Result<Self, ExchangeError> {
        let codec: Arc<dyn StreamCodec> = Arc::from(codec_for(venue)?);
        Ok(Self::with_codec(codec, symbol, interval, settings))
    }

    pub fn with_codec(codec: Arc<dyn StreamCodec>, symbol: &str, interval: Interval, settings: StreamSettings) -> Self {
        Self {
            venue: codec.venue(),
            symbol: symbol.to_string(),
            interval,
            url: codec.url().to_string(),
            codec,
            settings,
            clock: None,
        }
    }

    /// Point the stream at another endpoint (testnet, local relay).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Clock used to infer closes for price-only venues.
    pub fn with_clock(mut self, clock: Arc<dyn ServerClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn spawn(self, events: mpsc::Sender<StreamEvent>) -> StreamHandle {
        let (state_tx, state_rx) = watch::channel(StreamState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: state_tx,
            sink: Mutex::new(Some(events)),
            last_message: Mutex::new(None),
            ever_connected: AtomicBool::new(false),
        });
        let join_timeout = Duration::from_secs(self.settings.stop_join_timeout_secs);

        let task = tokio::spawn(self.run(Arc::clone(&shared), shutdown_rx));

        StreamHandle {
            shared,
            state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            join_timeout,
        }
    }

    async fn run(self, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
        let mut detector = CandleCloseDetector::new(self.interval);
        if let Some(clock) = &self.clock {
            detector = detector.with_clock(Arc::clone(clock));
        }
        let mut pending_bar: Option<Candle> = None;
        let mut attempts = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if attempts >= self.settings.max_reconnect_attempts {
                let reason = format!("gave up after {attempts} reconnect attempts");
                error!(venue = %self.venue, symbol = %self.symbol, attempts, "🛑 Stream stopped: {reason}");
                shared.set_state(StreamState::Stopped);
                shared.emit(StreamEvent::Stopped(reason)).await;
                return;
            }

            shared.set_state(StreamState::Connecting);
            let end = self
                .session(&shared, &mut shutdown, &mut detector, &mut pending_bar, &mut attempts)
                .await;

            let reason = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => reason,
            };
            shared.set_state(StreamState::Disconnected);
            attempts += 1;
            let delay = self.settings.backoff_delay(attempts - 1);
            warn!(
                venue = %self.venue,
                symbol = %self.symbol,
                attempt = attempts,
                delay_secs = delay.as_secs_f64(),
                reason = %reason,
                "🔄 Stream disconnected, reconnecting"
            );
            shared.emit(StreamEvent::Disconnected(reason)).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        shared.set_state(StreamState::Stopped);
        info!(venue = %self.venue, symbol = %self.symbol, "Stream stopped");
    }

    async fn session(
        &self,
        shared: &Shared,
        shutdown: &mut watch::Receiver<bool>,
        detector: &mut CandleCloseDetector,
        pending_bar: &mut Option<Candle>,
        attempts: &mut u32,
    ) -> SessionEnd {
        debug!(venue = %self.venue, url = %self.url, "Connecting stream");
        let connect = tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect_async(self.url.as_str()));
        let ws = tokio::select! {
            result = connect => match result {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => return SessionEnd::Lost(format!("connect failed: {e}")),
                Err(_) => return SessionEnd::Lost("connect timed out".to_string()),
            },
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        };
        let (mut write, mut read) = ws.split();

        let payload = self
            .codec
            .subscribe_payload(&self.symbol, self.interval, Utc::now().timestamp_millis());
        if let Err(e) = write.send(Message::Text(payload)).await {
            return SessionEnd::Lost(format!("subscribe failed: {e}"));
        }

        *attempts = 0;
        shared.ever_connected.store(true, Ordering::Relaxed);
        shared.touch();
        shared.set_state(StreamState::Connected);
        info!(venue = %self.venue, symbol = %self.symbol, interval = %self.interval, "✅ Stream connected");
        shared.emit(StreamEvent::Connected).await;

        let mut ping = tokio::time::interval(Duration::from_secs(self.settings.ping_interval_secs.max(1)));
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Lost(format!("ping failed: {e}"));
                    }
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Some(Ok(Message::Ping(data))) => {
                            shared.touch();
                            let _ = write.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => return SessionEnd::Lost("closed by server".to_string()),
                        Some(Ok(_)) => {
                            shared.touch();
                            continue;
                        }
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        None => return SessionEnd::Lost("stream ended".to_string()),
                    };
                    shared.touch();
                    if let Some(reason) = self.handle_text(shared, &text, detector, pending_bar).await {
                        return SessionEnd::Lost(reason);
                    }
                }
            }
        }
    }

    /// Forward the frames of one message. Returns a reason when the venue
    /// rejected the session.
    async fn handle_text(
        &self,
        shared: &Shared,
        text: &str,
        detector: &mut CandleCloseDetector,
        pending_bar: &mut Option<Candle>,
    ) -> Option<String> {
        if text == "pong" || text == "ping" {
            return None;
        }
        let frames = match self.codec.parse(text) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(venue = %self.venue, error = %e, "Undecodable stream frame skipped");
                return None;
            }
        };

        for frame in frames {
            match frame {
                Frame::AuthFailure(reason) => {
                    error!(venue = %self.venue, reason = %reason, "🚨 Stream authentication rejected");
                    return Some(reason);
                }
                Frame::Price { price, at } => {
                    let boundary_close = detector.detect_close(None, None);
                    shared.emit(StreamEvent::Price { price, at, boundary_close }).await;
                }
                Frame::Candle(candle) => {
                    for event in resolve_candle(detector, pending_bar, candle) {
                        shared.emit(StreamEvent::Candle(event)).await;
                    }
                }
            }
        }
        None
    }
}

/// Turn one decoded bar into candle events.
///
/// Bars with a venue confirm flag are classified directly. Bars without one
/// carry only their open time; the first bar seen at a new boundary means the
/// previous bar closed, so the previous bar is emitted as closed.
pub fn resolve_candle(
    detector: &mut CandleCloseDetector,
    pending_bar: &mut Option<Candle>,
    candle: Candle,
) -> Vec<CandleEvent> {
    if candle.confirmed.is_some() {
        let is_close = detector.detect_candle_close(&candle);
        return vec![CandleEvent { candle, is_close }];
    }

    let mut events = Vec::with_capacity(2);
    let new_bar = detector.detect_candle_close(&candle);
    if new_bar {
        if let Some(prev) = pending_bar.take().filter(|p| p.timestamp < candle.timestamp) {
            events.push(CandleEvent { candle: prev, is_close: true });
        }
    }
    *pending_bar = Some(candle.clone());
    events.push(CandleEvent { candle, is_close: false });
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(h: u32, m: u32, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 1.0,
            confirmed: None,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let s = StreamSettings::default();
        assert_eq!(s.backoff_delay(0), Duration::from_secs(3));
        assert_eq!(s.backoff_delay(1), Duration::from_secs_f64(4.5));
        assert_eq!(s.backoff_delay(19), Duration::from_secs(60));
    }

    #[test]
    fn confirmed_bars_are_classified_directly() {
        let mut detector = CandleCloseDetector::new(Interval::Min15);
        let mut pending = None;
        let events = resolve_candle(&mut detector, &mut pending, bar(14, 15, 1.0).with_confirmed(true));
        assert_eq!(events.len(), 1);
        assert!(events[0].is_close);
        assert!(pending.is_none());
    }

    #[test]
    fn new_boundary_closes_previous_bar() {
        let mut detector = CandleCloseDetector::new(Interval::Min15);
        let mut pending = None;

        let first = resolve_candle(&mut detector, &mut pending, bar(14, 0, 1.0));
        assert_eq!(first.len(), 1);
        assert!(!first[0].is_close);

        let update = resolve_candle(&mut detector, &mut pending, bar(14, 0, 1.3));
        assert_eq!(update.len(), 1);

        let next = resolve_candle(&mut detector, &mut pending, bar(14, 15, 1.4));
        assert_eq!(next.len(), 2);
        assert!(next[0].is_close);
        assert_eq!(next[0].candle.close, 1.3);
        assert!(!next[1].is_close);
    }

    #[tokio::test]
    async fn unreachable_venue_stops_after_budget() {
        let settings = StreamSettings {
            max_reconnect_attempts: 2,
            base_delay_secs: 0.01,
            max_delay_secs: 0.02,
            ..StreamSettings::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let handle = StreamHandler::new(Venue::Bybit, "BTCUSDT", Interval::Min15, settings)
            .unwrap()
            .with_url("ws://127.0.0.1:1")
            .spawn(tx);

        let mut disconnects = 0;
        let stopped = loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(StreamEvent::Disconnected(_))) => disconnects += 1,
                Ok(Some(StreamEvent::Stopped(reason))) => break reason,
                Ok(Some(_)) => {}
                other => panic!("stream did not stop: {other:?}"),
            }
        };
        assert_eq!(disconnects, 2);
        assert!(stopped.contains("2 reconnect attempts"));
        assert_eq!(handle.state(), StreamState::Stopped);
        assert!(!handle.is_healthy(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn stop_is_terminal_and_silent() {
        let settings = StreamSettings {
            base_delay_secs: 30.0,
            ..StreamSettings::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let handle = StreamHandler::new(Venue::Okx, "BTCUSDT", Interval::Min15, settings)
            .unwrap()
            .with_url("ws://127.0.0.1:1")
            .spawn(tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;
        assert_eq!(handle.state(), StreamState::Stopped);

        // drain whatever arrived before the sink was detached; nothing follows
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            assert!(!matches!(event, StreamEvent::Connected));
        }
    }
}
