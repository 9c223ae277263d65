//! Core types used throughout VenueBot
//!
//! Venues, intervals, candles, signals, positions and the uniform order result.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExchangeError;

/// Supported venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Bybit,
    Binance,
    Okx,
    Bitget,
    Bingx,
    Upbit,
    Bithumb,
    Lighter,
    Generic,
}

impl Default for Venue {
    fn default() -> Self {
        Venue::Bybit
    }
}

impl Venue {
    pub const ALL: [Venue; 9] = [
        Venue::Bybit,
        Venue::Binance,
        Venue::Okx,
        Venue::Bitget,
        Venue::Bingx,
        Venue::Upbit,
        Venue::Bithumb,
        Venue::Lighter,
        Venue::Generic,
    ];

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bybit" => Some(Venue::Bybit),
            "binance" => Some(Venue::Binance),
            "okx" => Some(Venue::Okx),
            "bitget" => Some(Venue::Bitget),
            "bingx" => Some(Venue::Bingx),
            "upbit" => Some(Venue::Upbit),
            "bithumb" => Some(Venue::Bithumb),
            "lighter" => Some(Venue::Lighter),
            "generic" | "ccxt" => Some(Venue::Generic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Bybit => "bybit",
            Venue::Binance => "binance",
            Venue::Okx => "okx",
            Venue::Bitget => "bitget",
            Venue::Bingx => "bingx",
            Venue::Upbit => "upbit",
            Venue::Bithumb => "bithumb",
            Venue::Lighter => "lighter",
            Venue::Generic => "generic",
        }
    }

    /// KRW spot venues: no leverage, no exchange-side stop orders.
    pub fn is_spot(&self) -> bool {
        matches!(self, Venue::Upbit | Venue::Bithumb)
    }

    /// Quote currency of the account balance
    pub fn quote_currency(&self) -> &'static str {
        if self.is_spot() {
            "KRW"
        } else {
            "USDT"
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Candle intervals understood by every venue mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Default for Interval {
    fn default() -> Self {
        Interval::Min15
    }
}

impl Interval {
    /// Parse from string ("15m", "15", "minute15", "1h", "60", "1d", "D")
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1m" | "1" | "minute1" | "1min" => Some(Interval::Min1),
            "3m" | "3" | "minute3" | "3min" => Some(Interval::Min3),
            "5m" | "5" | "minute5" | "5min" => Some(Interval::Min5),
            "15m" | "15" | "minute15" | "15min" => Some(Interval::Min15),
            "30m" | "30" | "minute30" | "30min" => Some(Interval::Min30),
            "1h" | "60" | "minute60" | "1hour" => Some(Interval::Hour1),
            "4h" | "240" | "minute240" | "4hour" => Some(Interval::Hour4),
            "1d" | "d" | "day" | "1day" | "24h" => Some(Interval::Day1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min3 => "3m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Interval::Min1 => 1,
            Interval::Min3 => 3,
            Interval::Min5 => 5,
            Interval::Min15 => 15,
            Interval::Min30 => 30,
            Interval::Hour1 => 60,
            Interval::Hour4 => 240,
            Interval::Day1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Minutes-of-hour on which a bar of this interval closes.
    ///
    /// Only 15m and hour-or-longer bars have boundaries; shorter bars rely on
    /// the venue's own confirm flag.
    pub fn boundary_minutes(&self) -> &'static [u32] {
        match self {
            Interval::Min15 => &[0, 15, 30, 45],
            Interval::Hour1 | Interval::Hour4 | Interval::Day1 => &[0],
            _ => &[],
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Default for Side {
    fn default() -> Self {
        Side::Long
    }
}

impl Side {
    /// Parse venue and pattern spellings ("Long", "LONG", "buy", "W", ...)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" | "bid" | "w" => Some(Side::Long),
            "short" | "sell" | "ask" | "m" => Some(Side::Short),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for Long, -1 for Short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// Order side that opens this position ("Buy"/"Sell")
    pub fn open_order_side(&self) -> &'static str {
        match self {
            Side::Long => "Buy",
            Side::Short => "Sell",
        }
    }

    /// Order side that closes this position
    pub fn close_order_side(&self) -> &'static str {
        self.opposite().open_order_side()
    }

    /// True if `candidate` is a better stop than `current` for this side.
    pub fn is_favorable_stop(&self, candidate: f64, current: f64) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "Long"),
            Side::Short => write!(f, "Short"),
        }
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time (UTC)
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Venue-supplied "bar closed" flag, when the venue has one
    #[serde(default)]
    pub confirmed: Option<bool>,
}

impl Candle {
    pub fn from_millis(ts_ms: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Option<Self> {
        let timestamp = Utc.timestamp_millis_opt(ts_ms).single()?;
        Some(Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            confirmed: None,
        })
    }

    pub fn with_confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = Some(confirmed);
        self
    }

    /// Rejects bars with non-finite or non-positive prices.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(ExchangeError::data(format!(
                "invalid candle prices at {}: o={} h={} l={} c={}",
                self.timestamp, self.open, self.high, self.low, self.close
            )));
        }
        Ok(())
    }
}

/// Candidate trade setup handed over by pattern extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: Side,
    pub pattern: String,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub atr: f64,
    /// Bar time the pattern completed on
    pub entry_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
}

impl Signal {
    pub fn new(signal_type: Side, pattern: &str, entry_time: DateTime<Utc>, validity_hours: f64) -> Self {
        Self {
            signal_type,
            pattern: pattern.to_string(),
            stop_loss: 0.0,
            take_profit: 0.0,
            atr: 0.0,
            entry_time,
            expire_time: entry_time + hours(validity_hours),
        }
    }

    /// Dedup key: time + type
    pub fn key(&self) -> String {
        format!("{}_{}", self.entry_time.timestamp_millis(), self.signal_type)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.entry_time <= now && now <= self.expire_time
    }
}

pub(crate) fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.0) as i64)
}

/// Lifecycle status of a bot-owned position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl Default for PositionStatus {
    fn default() -> Self {
        PositionStatus::Open
    }
}

/// Open exchange position owned by this bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub initial_stop_loss: f64,
    /// |entry - initial SL|, fixed at entry
    pub risk_distance: f64,
    /// Best price reached since entry
    pub extreme_price: f64,
    pub trail_start_price: f64,
    pub trail_distance: f64,
    #[serde(default)]
    pub break_even_triggered: bool,
    pub entry_time: DateTime<Utc>,
    pub order_id: Option<String>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub add_count: u32,
    #[serde(default)]
    pub status: PositionStatus,
}

impl Position {
    /// Build a fresh position from an entry fill.
    ///
    /// `trail_start_r`/`trail_dist_r` are R-multiples of the initial risk.
    pub fn open(
        symbol: &str,
        side: Side,
        entry_price: f64,
        size: f64,
        stop_loss: f64,
        trail_start_r: f64,
        trail_dist_r: f64,
    ) -> Self {
        let mut risk = (entry_price - stop_loss).abs();
        if risk <= 0.0 {
            risk = entry_price * 0.01;
        }
        Self {
            symbol: symbol.to_string(),
            side,
            entry_price,
            size,
            stop_loss,
            initial_stop_loss: stop_loss,
            risk_distance: risk,
            extreme_price: entry_price,
            trail_start_price: entry_price + side.sign() * risk * trail_start_r,
            trail_distance: risk * trail_dist_r,
            break_even_triggered: false,
            entry_time: Utc::now(),
            order_id: None,
            client_order_id: None,
            add_count: 0,
            status: PositionStatus::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open && self.size > 0.0
    }

    /// Unleveraged move in percent from entry, signed by side
    pub fn move_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Durable marker that the bot itself opened the position on a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedPositionRecord {
    #[serde(default)]
    pub symbol: String,
    pub order_id: Option<String>,
    pub client_order_id: String,
    pub entry_price: f64,
    pub side: Side,
    pub size: f64,
    pub created_at: DateTime<Utc>,
}

/// Entry order request
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub side: Side,
    pub size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn market(side: Side, size: f64, client_order_id: impl Into<String>) -> Self {
        Self {
            side,
            size,
            stop_loss: None,
            take_profit: None,
            client_order_id: client_order_id.into(),
        }
    }

    pub fn with_stop_loss(mut self, sl: f64) -> Self {
        if sl > 0.0 {
            self.stop_loss = Some(sl);
        }
        self
    }

    pub fn with_take_profit(mut self, tp: f64) -> Self {
        if tp > 0.0 {
            self.take_profit = Some(tp);
        }
        self
    }
}

/// Uniform result of every order-mutating call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub filled_price: Option<f64>,
    pub filled_qty: Option<f64>,
    pub error: Option<ExchangeError>,
}

impl OrderResult {
    pub fn ok(order_id: Option<String>) -> Self {
        Self {
            success: true,
            order_id,
            ..Default::default()
        }
    }

    pub fn filled(order_id: Option<String>, price: f64, qty: f64) -> Self {
        Self {
            success: true,
            order_id,
            filled_price: Some(price),
            filled_qty: Some(qty),
            ..Default::default()
        }
    }

    pub fn failed(error: ExchangeError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_client_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_order_id.into());
        self
    }

    /// Converts a failed result into its error, defaulting to a rejection.
    pub fn into_result(self) -> Result<OrderResult, ExchangeError> {
        if self.success {
            Ok(self)
        } else {
            Err(self
                .error
                .clone()
                .unwrap_or_else(|| ExchangeError::rejected("unknown", "order failed without cause")))
        }
    }
}

/// Raw open position reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

/// Closed-trade fill as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Option<String>,
    pub symbol: String,
    /// Position side the fill closed, when the venue reports it
    pub position_side: Option<Side>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    #[serde(default)]
    pub fee: f64,
    pub time: DateTime<Utc>,
}

/// Adapter-side view of the position it opened
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackedPosition {
    pub side: Side,
    pub size: f64,
    /// Size-weighted average entry across adds
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub add_count: u32,
}

impl TrackedPosition {
    pub fn new(side: Side, size: f64, entry_price: f64, stop_loss: Option<f64>) -> Self {
        Self {
            side,
            size,
            entry_price,
            stop_loss,
            add_count: 0,
        }
    }

    /// Merge an add fill into the position, re-averaging entry by size.
    pub fn apply_add(&mut self, size: f64, price: f64) {
        let total = self.size + size;
        if total > 0.0 {
            self.entry_price = (self.entry_price * self.size + price * size) / total;
        }
        self.size = total;
        self.add_count += 1;
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Stop level crossed; closed by the bot
    SlHit,
    /// Found closed on the venue during reconciliation
    Reconciled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::SlHit => write!(f, "SL_HIT"),
            ExitReason::Reconciled => write!(f, "RECONCILED"),
        }
    }
}

/// Normalize symbol to the bare BTCUSDT form used for keys and file names.
pub fn canonical_symbol(raw: &str) -> String {
    raw.split(':')
        .next()
        .unwrap_or(raw)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_parses_venue_spellings() {
        assert_eq!(Interval::from_str("15"), Some(Interval::Min15));
        assert_eq!(Interval::from_str("minute15"), Some(Interval::Min15));
        assert_eq!(Interval::from_str("60"), Some(Interval::Hour1));
        assert_eq!(Interval::from_str("D"), Some(Interval::Day1));
        assert_eq!(Interval::from_str("7m"), None);
    }

    #[test]
    fn boundary_minutes_by_interval() {
        assert_eq!(Interval::Min15.boundary_minutes(), &[0, 15, 30, 45]);
        assert_eq!(Interval::Hour4.boundary_minutes(), &[0]);
        assert!(Interval::Min5.boundary_minutes().is_empty());
    }

    #[test]
    fn canonical_symbol_strips_separators() {
        assert_eq!(canonical_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(canonical_symbol("btc-usdt"), "BTCUSDT");
        assert_eq!(canonical_symbol("KRW-BTC"), "KRWBTC");
    }

    #[test]
    fn tracked_position_add_reaverages_entry() {
        let mut p = TrackedPosition::new(Side::Long, 1.0, 100.0, Some(95.0));
        p.apply_add(1.0, 110.0);
        assert!((p.entry_price - 105.0).abs() < 1e-9);
        assert!((p.size - 2.0).abs() < 1e-9);
        assert_eq!(p.add_count, 1);
    }

    #[test]
    fn position_open_derives_trailing_levels() {
        let p = Position::open("BTCUSDT", Side::Short, 100.0, 1.0, 102.0, 0.8, 0.5);
        assert!((p.risk_distance - 2.0).abs() < 1e-9);
        assert!((p.trail_start_price - 98.4).abs() < 1e-9);
        assert!((p.trail_distance - 1.0).abs() < 1e-9);
        assert!(p.is_open());
    }

    #[test]
    fn failed_order_result_converts_to_error() {
        let r = OrderResult::failed(ExchangeError::transient("timeout"));
        assert!(matches!(r.into_result(), Err(ExchangeError::Transient(_))));
    }
}
