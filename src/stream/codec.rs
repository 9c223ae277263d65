//! Per-venue WebSocket wire codecs
//!
//! Subscribe payloads are fixed external protocol and are emitted exactly as
//! the venues have always received them (`", "` and `": "` separators, field
//! order as listed). Frames decode into [`Frame`]s; anything that is not
//! market data decodes to nothing.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ExchangeError;
use crate::exchange::http::{as_f64, as_i64, millis_to_utc};
use crate::exchange::symbols::{interval_code, venue_symbol};
use crate::types::{Candle, Interval, Venue};

/// Decoded market-data frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// OHLCV bar. `confirmed` is set only when the venue says so.
    Candle(Candle),
    /// Last trade / ticker price
    Price { price: f64, at: Option<DateTime<Utc>> },
    /// The venue rejected the session
    AuthFailure(String),
}

/// Wire contract of one venue's public market stream
pub trait StreamCodec: Send + Sync {
    fn venue(&self) -> Venue;

    fn url(&self) -> &'static str;

    fn subscribe_payload(&self, symbol: &str, interval: Interval, now_ms: i64) -> String;

    /// Frames carried by one text message, in order.
    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError>;

    /// False for ticker-only feeds, whose bar closes have to come from REST.
    fn carries_candles(&self) -> bool {
        true
    }
}

/// Codec for `venue`. Lighter and the generic adapter have no public stream.
pub fn codec_for(venue: Venue) -> Result<Box<dyn StreamCodec>, ExchangeError> {
    Ok(match venue {
        Venue::Bybit => Box::new(BybitCodec),
        Venue::Binance => Box::new(BinanceCodec),
        Venue::Upbit => Box::new(UpbitCodec),
        Venue::Bithumb => Box::new(BithumbCodec),
        Venue::Okx => Box::new(OkxCodec),
        Venue::Bitget => Box::new(BitgetCodec),
        Venue::Bingx => Box::new(BingxCodec),
        Venue::Lighter | Venue::Generic => {
            return Err(ExchangeError::NotSupported(format!("no market stream for {venue}")))
        }
    })
}

fn decode(venue: Venue, text: &str) -> Result<Value, ExchangeError> {
    serde_json::from_str(text)
        .map_err(|e| ExchangeError::data(format!("{venue} stream frame is not JSON: {e}")))
}

/// `code` containing 401 or `msg` containing "Unauthorized".
pub fn auth_failure(frame: &Value) -> Option<String> {
    let code = match frame.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let msg = frame.get("msg").and_then(Value::as_str).unwrap_or_default();
    if code.contains("401") || msg.contains("Unauthorized") {
        Some(format!("401 Unauthorized: {msg}"))
    } else {
        None
    }
}

fn with_auth_check(venue: Venue, text: &str, parse: impl FnOnce(&Value) -> Vec<Frame>) -> Result<Vec<Frame>, ExchangeError> {
    let value = decode(venue, text)?;
    if let Some(reason) = auth_failure(&value) {
        return Ok(vec![Frame::AuthFailure(reason)]);
    }
    Ok(parse(&value))
}

fn num(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(as_f64)
}

fn candle_from_keys(k: &Value, keys: [&str; 6]) -> Option<Candle> {
    let [ts, o, h, l, c, v] = keys;
    let ts = k.get(ts).and_then(as_i64)?;
    Candle::from_millis(ts, num(k, o)?, num(k, h)?, num(k, l)?, num(k, c)?, num(k, v).unwrap_or(0.0))
}

fn candle_from_row(row: &[Value]) -> Option<Candle> {
    let col = |i: usize| row.get(i).and_then(as_f64);
    let ts = row.first().and_then(as_i64)?;
    Candle::from_millis(ts, col(1)?, col(2)?, col(3)?, col(4)?, col(5).unwrap_or(0.0))
}

fn price_frame(price: Option<f64>, at: Option<DateTime<Utc>>) -> Vec<Frame> {
    match price.filter(|p| *p > 0.0) {
        Some(price) => vec![Frame::Price { price, at }],
        None => Vec::new(),
    }
}

pub struct BybitCodec;

impl StreamCodec for BybitCodec {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    fn url(&self) -> &'static str {
        "wss://stream.bybit.com/v5/public/linear"
    }

    fn subscribe_payload(&self, symbol: &str, interval: Interval, _now_ms: i64) -> String {
        format!(
            r#"{{"op": "subscribe", "args": ["kline.{}.{}"]}}"#,
            interval_code(Venue::Bybit, interval),
            venue_symbol(Venue::Bybit, symbol)
        )
    }

    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError> {
        with_auth_check(Venue::Bybit, text, |v| {
            let is_kline = v
                .get("topic")
                .and_then(Value::as_str)
                .is_some_and(|t| t.contains("kline"));
            if !is_kline {
                return Vec::new();
            }
            v.get("data")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(|k| {
                    let confirm = k.get("confirm").and_then(Value::as_bool).unwrap_or(false);
                    candle_from_keys(k, ["start", "open", "high", "low", "close", "volume"])
                        .map(|c| c.with_confirmed(confirm))
                })
                .map(Frame::Candle)
                .into_iter()
                .collect()
        })
    }
}

pub struct BinanceCodec;

impl StreamCodec for BinanceCodec {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn url(&self) -> &'static str {
        "wss://fstream.binance.com/ws"
    }

    fn subscribe_payload(&self, symbol: &str, interval: Interval, now_ms: i64) -> String {
        format!(
            r#"{{"method": "SUBSCRIBE", "params": ["{}@kline_{}"], "id": {}}}"#,
            venue_symbol(Venue::Binance, symbol).to_lowercase(),
            interval.as_str(),
            now_ms / 1000
        )
    }

    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError> {
        with_auth_check(Venue::Binance, text, |v| {
            if v.get("e").and_then(Value::as_str) != Some("kline") {
                return Vec::new();
            }
            v.get("k")
                .and_then(|k| {
                    let closed = k.get("x").and_then(Value::as_bool).unwrap_or(false);
                    candle_from_keys(k, ["t", "o", "h", "l", "c", "v"]).map(|c| c.with_confirmed(closed))
                })
                .map(Frame::Candle)
                .into_iter()
                .collect()
        })
    }
}

pub struct UpbitCodec;

impl StreamCodec for UpbitCodec {
    fn venue(&self) -> Venue {
        Venue::Upbit
    }

    fn carries_candles(&self) -> bool {
        false
    }

    fn url(&self) -> &'static str {
        "wss://api.upbit.com/websocket/v1"
    }

    fn subscribe_payload(&self, symbol: &str, _interval: Interval, now_ms: i64) -> String {
        format!(
            r#"[{{"ticket": "twin_{}"}}, {{"type": "ticker", "codes": ["{}"]}}]"#,
            now_ms / 1000,
            venue_symbol(Venue::Upbit, symbol)
        )
    }

    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError> {
        with_auth_check(Venue::Upbit, text, |v| {
            if v.get("type").and_then(Value::as_str) != Some("ticker") {
                return Vec::new();
            }
            let at = v
                .get("trade_timestamp")
                .or_else(|| v.get("timestamp"))
                .and_then(millis_to_utc);
            price_frame(num(v, "trade_price"), at)
        })
    }
}

pub struct BithumbCodec;

impl StreamCodec for BithumbCodec {
    fn venue(&self) -> Venue {
        Venue::Bithumb
    }

    fn carries_candles(&self) -> bool {
        false
    }

    fn url(&self) -> &'static str {
        "wss://pubwss.bithumb.com/pub/ws"
    }

    fn subscribe_payload(&self, symbol: &str, interval: Interval, _now_ms: i64) -> String {
        format!(
            r#"{{"type": "ticker", "symbols": ["{}"], "tickTypes": ["{}"]}}"#,
            venue_symbol(Venue::Bithumb, symbol),
            interval.as_str().to_uppercase()
        )
    }

    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError> {
        with_auth_check(Venue::Bithumb, text, |v| {
            if v.get("type").and_then(Value::as_str) != Some("ticker") {
                return Vec::new();
            }
            let content = v.get("content").cloned().unwrap_or(Value::Null);
            price_frame(num(&content, "closePrice"), None)
        })
    }
}

pub struct OkxCodec;

impl StreamCodec for OkxCodec {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    fn url(&self) -> &'static str {
        "wss://ws.okx.com:8443/ws/v5/public"
    }

    fn subscribe_payload(&self, symbol: &str, interval: Interval, _now_ms: i64) -> String {
        format!(
            r#"{{"op": "subscribe", "args": [{{"channel": "candle{}", "instId": "{}"}}]}}"#,
            interval_code(Venue::Okx, interval),
            venue_symbol(Venue::Okx, symbol)
        )
    }

    /// Rows arrive either as `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`
    /// or as keyed objects.
    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError> {
        with_auth_check(Venue::Okx, text, |v| {
            let Some(rows) = v.get("data").and_then(Value::as_array) else {
                return Vec::new();
            };
            rows.iter()
                .filter_map(|row| match row {
                    Value::Array(cols) => {
                        let confirm = cols.get(8).and_then(Value::as_str) == Some("1");
                        candle_from_row(cols).map(|c| c.with_confirmed(confirm))
                    }
                    Value::Object(_) => {
                        let confirm = row.get("confirm").and_then(Value::as_str) == Some("1");
                        candle_from_keys(row, ["ts", "o", "h", "l", "c", "vol"]).map(|c| c.with_confirmed(confirm))
                    }
                    _ => None,
                })
                .map(Frame::Candle)
                .collect()
        })
    }
}

pub struct BitgetCodec;

impl StreamCodec for BitgetCodec {
    fn venue(&self) -> Venue {
        Venue::Bitget
    }

    fn url(&self) -> &'static str {
        "wss://ws.bitget.com/mix/v1/stream"
    }

    fn subscribe_payload(&self, symbol: &str, interval: Interval, _now_ms: i64) -> String {
        format!(
            r#"{{"op": "subscribe", "args": [{{"instType": "MC", "channel": "candle{}", "instId": "{}"}}]}}"#,
            interval_code(Venue::Bitget, interval),
            venue_symbol(Venue::Bitget, symbol)
        )
    }

    /// No confirm flag: bars carry only their open time, so closes are left to
    /// the boundary detector.
    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError> {
        with_auth_check(Venue::Bitget, text, |v| {
            let Some(rows) = v.get("data").and_then(Value::as_array) else {
                return Vec::new();
            };
            rows.iter()
                .flat_map(|row| match row {
                    Value::Array(cols) => candle_from_row(cols).map(Frame::Candle).into_iter().collect::<Vec<_>>(),
                    Value::Object(_) => match candle_from_keys(row, ["ts", "open", "high", "low", "close", "volume"]) {
                        Some(c) => vec![Frame::Candle(c)],
                        None => price_frame(num(row, "close"), None),
                    },
                    _ => Vec::new(),
                })
                .collect()
        })
    }
}

pub struct BingxCodec;

impl StreamCodec for BingxCodec {
    fn venue(&self) -> Venue {
        Venue::Bingx
    }

    fn url(&self) -> &'static str {
        "wss://open-api-swap.bingx.com/swap-market"
    }

    fn subscribe_payload(&self, symbol: &str, interval: Interval, now_ms: i64) -> String {
        format!(
            r#"{{"id": "{}", "reqType": "sub", "dataType": "{}@kline_{}"}}"#,
            now_ms / 1000,
            venue_symbol(Venue::Bingx, symbol),
            interval.as_str()
        )
    }

    fn parse(&self, text: &str) -> Result<Vec<Frame>, ExchangeError> {
        with_auth_check(Venue::Bingx, text, |v| {
            let rows: Vec<&Value> = match v.get("data") {
                Some(Value::Object(_)) => v.get("data").into_iter().collect(),
                Some(Value::Array(items)) => items.iter().collect(),
                _ => return Vec::new(),
            };
            rows.into_iter()
                .flat_map(|k| match candle_from_keys(k, ["T", "o", "h", "l", "c", "v"]) {
                    Some(c) => vec![Frame::Candle(c)],
                    None => price_frame(num(k, "c"), k.get("T").and_then(millis_to_utc)),
                })
                .collect()
        })
    }
}
