//! Venue server-clock estimation
//!
//! Each venue gets a [`TimeSync`] that measures the local/server clock offset
//! from one HTTP round-trip and compensates reads with half the mean RTT.
//! Every read opportunistically resyncs once the sync interval has passed.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ExchangeError;
use crate::types::Venue;

pub const DEFAULT_SYNC_INTERVAL_SECS: f64 = 5.0;
pub const DEFAULT_LATENCY_WINDOW: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 3;

/// Read-only access to a (possibly corrected) wall clock.
pub trait ServerClock: Send + Sync {
    fn server_now(&self) -> DateTime<Utc>;
}

/// Plain local UTC clock, for venues without a time endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl ServerClock for LocalClock {
    fn server_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One server-time probe. Returns server time in Unix seconds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServerTimeFetcher: Send + Sync {
    async fn fetch_server_time(&self) -> Result<f64, ExchangeError>;
}

/// Time endpoint per venue; `None` for venues that only have the local clock.
pub fn time_endpoint(venue: Venue) -> Option<&'static str> {
    match venue {
        Venue::Bybit => Some("https://api.bybit.com/v5/market/time"),
        Venue::Binance => Some("https://api.binance.com/api/v3/time"),
        Venue::Okx => Some("https://www.okx.com/api/v5/public/time"),
        Venue::Bitget => Some("https://api.bitget.com/api/v2/public/time"),
        Venue::Bingx => Some("https://open-api.bingx.com/openApi/swap/v2/server/time"),
        _ => None,
    }
}

fn json_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Pull server time (Unix seconds) out of a venue time response.
pub fn extract_server_time(venue: Venue, body: &Value) -> Result<f64, ExchangeError> {
    let (raw, scale) = match venue {
        Venue::Bybit => (body.pointer("/result/timeSecond"), 1.0),
        Venue::Binance => (body.get("serverTime"), 1000.0),
        Venue::Okx => (body.pointer("/data/0/ts"), 1000.0),
        Venue::Bitget | Venue::Bingx => (body.pointer("/data/serverTime"), 1000.0),
        other => {
            return Err(ExchangeError::NotSupported(format!(
                "{} has no server time endpoint",
                other
            )))
        }
    };

    let value = raw.and_then(json_number).ok_or_else(|| {
        ExchangeError::data(format!("{} time response has unexpected shape: {}", venue, body))
    })?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ExchangeError::data(format!(
            "{} returned non-positive server time {}",
            venue, value
        )));
    }
    Ok(value / scale)
}

/// HTTP fetcher for the venue time endpoint
pub struct HttpTimeFetcher {
    client: Client,
    venue: Venue,
    url: String,
}

impl HttpTimeFetcher {
    pub fn new(venue: Venue, timeout_secs: u64) -> Result<Self, ExchangeError> {
        let url = time_endpoint(venue).ok_or_else(|| {
            ExchangeError::NotSupported(format!("{} has no server time endpoint", venue))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ExchangeError::transient(format!("time sync client: {e}")))?;
        Ok(Self {
            client,
            venue,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ServerTimeFetcher for HttpTimeFetcher {
    async fn fetch_server_time(&self) -> Result<f64, ExchangeError> {
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        extract_server_time(self.venue, &body)
    }
}

#[derive(Debug, Clone, Default)]
struct TimeOffsetState {
    /// local - server, seconds
    offset: f64,
    /// RTT samples in milliseconds
    latency_history: VecDeque<f64>,
    last_sync: Option<Instant>,
    /// Unix seconds of the last successful sync
    last_sync_time: f64,
}

/// Snapshot of sync quality
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSyncStats {
    pub offset: f64,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub last_sync_time: f64,
}

pub struct TimeSync {
    venue: Venue,
    fetcher: Arc<dyn ServerTimeFetcher>,
    state: Mutex<TimeOffsetState>,
    sync_interval: Duration,
    latency_window: usize,
}

fn unix_now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl TimeSync {
    pub fn new(venue: Venue, fetcher: Arc<dyn ServerTimeFetcher>) -> Self {
        Self {
            venue,
            fetcher,
            state: Mutex::new(TimeOffsetState::default()),
            sync_interval: Duration::from_secs_f64(DEFAULT_SYNC_INTERVAL_SECS),
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }

    pub fn with_sync_interval(mut self, secs: f64) -> Self {
        self.sync_interval = Duration::from_secs_f64(secs.max(0.0));
        self
    }

    pub fn with_latency_window(mut self, window: usize) -> Self {
        self.latency_window = window.max(1);
        self
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimeOffsetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_fresh(&self) -> bool {
        self.lock()
            .last_sync
            .map(|t| t.elapsed() < self.sync_interval)
            .unwrap_or(false)
    }

    /// Resync with the venue unless the last sync is still fresh.
    pub async fn sync(&self, force: bool) -> Result<(), ExchangeError> {
        if !force && self.is_fresh() {
            return Ok(());
        }

        let t_start = unix_now_secs();
        let server_time = self.fetcher.fetch_server_time().await?;
        let t_end = unix_now_secs();

        let local_midpoint = (t_start + t_end) / 2.0;
        let rtt_ms = (t_end - t_start) * 1000.0;

        let mut state = self.lock();
        state.offset = local_midpoint - server_time;
        state.latency_history.push_back(rtt_ms);
        while state.latency_history.len() > self.latency_window {
            state.latency_history.pop_front();
        }
        state.last_sync = Some(Instant::now());
        state.last_sync_time = t_end;

        debug!(
            venue = %self.venue,
            offset_secs = state.offset,
            rtt_ms,
            "Server time synced"
        );
        Ok(())
    }

    /// Server time in Unix seconds, resyncing first when stale.
    pub async fn server_time(&self) -> f64 {
        if let Err(e) = self.sync(false).await {
            warn!(venue = %self.venue, error = %e, "Time sync failed; using last known offset");
        }
        self.corrected_now_secs()
    }

    fn corrected_now_secs(&self) -> f64 {
        let state = self.lock();
        let avg = average(&state.latency_history);
        unix_now_secs() - state.offset - avg / 2000.0
    }

    pub fn offset(&self) -> f64 {
        self.lock().offset
    }

    /// Mean RTT in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        average(&self.lock().latency_history)
    }

    pub fn stats(&self) -> TimeSyncStats {
        let state = self.lock();
        let min = state.latency_history.iter().copied().fold(f64::INFINITY, f64::min);
        let max = state.latency_history.iter().copied().fold(0.0_f64, f64::max);
        TimeSyncStats {
            offset: state.offset,
            avg_latency: average(&state.latency_history),
            min_latency: if min.is_finite() { min } else { 0.0 },
            max_latency: max,
            last_sync_time: state.last_sync_time,
        }
    }
}

impl ServerClock for TimeSync {
    fn server_now(&self) -> DateTime<Utc> {
        let secs = self.corrected_now_secs();
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9) as u32;
        Utc.timestamp_opt(whole as i64, nanos)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

fn average(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}
