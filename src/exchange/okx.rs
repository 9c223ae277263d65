//! OKX v5 perpetual swap adapter
//!
//! Requests are signed with base64 HMAC-SHA256 over
//! `{iso_timestamp}{METHOD}{request_path}{body}`. Swap sizes are expressed in
//! contracts, so base quantities are divided by the instrument `ctVal`.

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::http::{as_f64, as_i64, millis_to_utc, positive_price, str_field, VenueHttp};
use super::signing::{hmac_sha256_base64, query_string};
use super::symbols::{interval_code, venue_symbol, Precision};
use super::{
    add_client_id, place_protected, tracked_for_add, venue_timestamp_ms, Credentials, ExchangeAdapter,
    PositionTracker, ProtectedOrderFlow,
};
use crate::error::ExchangeError;
use crate::time_sync::TimeSync;
use crate::types::{
    canonical_symbol, Candle, ExchangePosition, Fill, Interval, OrderRequest, OrderResult, Side,
    TrackedPosition, Venue,
};

const BASE_URL: &str = "https://www.okx.com";
const TD_MODE: &str = "cross";

const AUTH_CODES: [&str; 6] = ["50100", "50101", "50105", "50111", "50113", "50114"];
const TRANSIENT_CODES: [&str; 4] = ["50001", "50004", "50011", "50102"];

pub struct OkxAdapter {
    symbol: String,
    inst_id: String,
    creds: Credentials,
    http: VenueHttp,
    precision: Precision,
    hedge_mode: AtomicBool,
    contract_value: RwLock<f64>,
    time: Option<Arc<TimeSync>>,
    tracker: PositionTracker,
}

impl OkxAdapter {
    pub fn new(symbol: &str, creds: Credentials) -> anyhow::Result<Self> {
        Ok(Self {
            symbol: canonical_symbol(symbol),
            inst_id: venue_symbol(Venue::Okx, symbol),
            creds,
            http: VenueHttp::new(Venue::Okx, BASE_URL)?,
            precision: Precision::for_venue(Venue::Okx),
            hedge_mode: AtomicBool::new(false),
            contract_value: RwLock::new(1.0),
            time: None,
            tracker: PositionTracker::default(),
        })
    }

    pub fn with_time_sync(mut self, time: Option<Arc<TimeSync>>) -> Self {
        self.time = time;
        self
    }

    pub fn is_hedge_mode(&self) -> bool {
        self.hedge_mode.load(Ordering::Relaxed)
    }

    fn ct_val(&self) -> f64 {
        self.contract_value.read().map(|v| *v).unwrap_or(1.0)
    }

    fn to_contracts(&self, qty: f64) -> String {
        self.precision.format_qty(qty / self.ct_val())
    }

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let body = self
            .http
            .send(self.http.get(&format!("{path}?{}", query_string(params))))
            .await?;
        check_response(body)
    }

    async fn signed(&self, method: Method, path: &str, params: &[(&str, String)], payload: Option<Value>) -> Result<Value, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing OKX credentials".into()));
        }
        let passphrase = self
            .creds
            .passphrase
            .as_deref()
            .ok_or_else(|| ExchangeError::Auth("missing OKX passphrase".into()))?;

        let request_path = if params.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", query_string(params))
        };
        let body_text = payload.map(|p| p.to_string()).unwrap_or_default();
        let ts = iso_timestamp(venue_timestamp_ms(self.time.as_ref()).await);
        let sign = sign_request(&self.creds.api_secret, &ts, method.as_str(), &request_path, &body_text)?;

        let mut request = self
            .http
            .request(method, &request_path)
            .header("OK-ACCESS-KEY", &self.creds.api_key)
            .header("OK-ACCESS-SIGN", sign)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", passphrase);
        if !body_text.is_empty() {
            request = request.body(body_text);
        }

        let body = self.http.send(request).await?;
        if body.get("code").and_then(Value::as_str) == Some("50102") {
            if let Some(time) = &self.time {
                if let Err(e) = time.sync(true).await {
                    warn!(venue = "okx", error = %e, "Forced time resync failed");
                }
            }
        }
        check_response(body)
    }

    fn pos_side(&self, side: Side) -> Option<&'static str> {
        self.is_hedge_mode().then_some(match side {
            Side::Long => "long",
            Side::Short => "short",
        })
    }

    async fn market_order(
        &self,
        order_side: &str,
        position: Side,
        qty: f64,
        reduce_only: bool,
        client_order_id: Option<&str>,
    ) -> Result<Option<String>, ExchangeError> {
        let mut payload = json!({
            "instId": self.inst_id,
            "tdMode": TD_MODE,
            "side": order_side.to_lowercase(),
            "ordType": "market",
            "sz": self.to_contracts(qty),
        });
        if let Some(ps) = self.pos_side(position) {
            payload["posSide"] = json!(ps);
        } else if reduce_only {
            payload["reduceOnly"] = json!(true);
        }
        if let Some(cid) = client_order_id {
            payload["clOrdId"] = json!(okx_client_id(cid));
        }

        let data = self.signed(Method::POST, "/api/v5/trade/order", &[], Some(payload)).await?;
        Ok(data.get(0).and_then(|d| str_field(d, "ordId")))
    }

    async fn place_stop(&self, position: Side, qty: f64, stop_loss: f64, take_profit: Option<f64>) -> Result<Option<String>, ExchangeError> {
        let mut payload = json!({
            "instId": self.inst_id,
            "tdMode": TD_MODE,
            "side": position.close_order_side().to_lowercase(),
            "ordType": "conditional",
            "sz": self.to_contracts(qty),
            "slTriggerPx": self.precision.format_price(stop_loss),
            "slOrdPx": "-1",
            "slTriggerPxType": "mark",
        });
        match self.pos_side(position) {
            Some(ps) => payload["posSide"] = json!(ps),
            None => payload["reduceOnly"] = json!(true),
        }
        if let Some(tp) = take_profit {
            payload["tpTriggerPx"] = json!(self.precision.format_price(tp));
            payload["tpOrdPx"] = json!("-1");
        }

        let data = self
            .signed(Method::POST, "/api/v5/trade/order-algo", &[], Some(payload))
            .await?;
        Ok(data.get(0).and_then(|d| str_field(d, "algoId")))
    }

    async fn cancel_stops(&self) -> Result<(), ExchangeError> {
        let data = self
            .signed(
                Method::GET,
                "/api/v5/trade/orders-algo-pending",
                &[("ordType", "conditional".to_string()), ("instId", self.inst_id.clone())],
                None,
            )
            .await?;
        let cancels: Vec<Value> = data
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| str_field(r, "algoId"))
                    .map(|id| json!({"algoId": id, "instId": self.inst_id}))
                    .collect()
            })
            .unwrap_or_default();
        if cancels.is_empty() {
            return Ok(());
        }
        self.signed(Method::POST, "/api/v5/trade/cancel-algos", &[], Some(Value::Array(cancels)))
            .await?;
        Ok(())
    }

    async fn fill_price(&self) -> Option<f64> {
        match self.get_current_price().await {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(venue = "okx", error = %e, "No ticker after fill, entry price unknown");
                None
            }
        }
    }
}

/// OKX timestamps are ISO 8601 with milliseconds, e.g. `2024-01-15T14:15:00.000Z`.
pub fn iso_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn sign_request(secret: &str, ts: &str, method: &str, request_path: &str, body: &str) -> Result<String, ExchangeError> {
    hmac_sha256_base64(secret, &format!("{ts}{method}{request_path}{body}"))
}

/// `clOrdId` accepts alphanumerics only, up to 32 characters.
pub fn okx_client_id(cid: &str) -> String {
    cid.chars().filter(|c| c.is_ascii_alphanumeric()).take(32).collect()
}

/// Check top-level `code` and per-order `sCode`, returning `data`.
pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    let code = str_field(&body, "code")
        .ok_or_else(|| ExchangeError::data(format!("okx response without code: {body}")))?;
    let msg = str_field(&body, "msg").unwrap_or_default();

    if code == "0" {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }

    // batch/order failures carry the real reason in data[0].sCode
    let (code, msg) = match body.pointer("/data/0") {
        Some(d) if str_field(d, "sCode").is_some_and(|c| c != "0") => (
            str_field(d, "sCode").unwrap_or(code),
            str_field(d, "sMsg").unwrap_or(msg),
        ),
        _ => (code, msg),
    };

    if AUTH_CODES.contains(&code.as_str()) {
        Err(ExchangeError::Auth(format!("okx {code}: {msg}")))
    } else if TRANSIENT_CODES.contains(&code.as_str()) {
        Err(ExchangeError::transient(format!("okx {code}: {msg}")))
    } else {
        Err(ExchangeError::rejected(code, msg))
    }
}

/// Rows are newest first: `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`.
pub fn parse_klines(data: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = data
        .as_array()
        .ok_or_else(|| ExchangeError::data("okx candles data is not an array"))?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows.iter().rev() {
        let cell = |i: usize| row.get(i).and_then(as_f64);
        let mut candle = match (row.get(0).and_then(as_i64), cell(1), cell(2), cell(3), cell(4), cell(5)) {
            (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v)) => Candle::from_millis(ts, o, h, l, c, v),
            _ => None,
        }
        .ok_or_else(|| ExchangeError::data(format!("malformed okx candle row: {row}")))?;
        if let Some(confirm) = row.get(8).and_then(Value::as_str) {
            candle = candle.with_confirmed(confirm == "1");
        }
        candle.validate()?;
        candles.push(candle);
    }
    Ok(candles)
}

pub fn parse_position_row(symbol: &str, ct_val: f64, row: &Value) -> Option<ExchangePosition> {
    let pos = row.get("pos").and_then(as_f64)?;
    if pos == 0.0 {
        return None;
    }
    let side = match row.get("posSide").and_then(Value::as_str) {
        Some("long") => Side::Long,
        Some("short") => Side::Short,
        _ if pos > 0.0 => Side::Long,
        _ => Side::Short,
    };
    Some(ExchangePosition {
        symbol: symbol.to_string(),
        side,
        size: pos.abs() * ct_val,
        entry_price: row.get("avgPx").and_then(as_f64).unwrap_or(0.0),
        unrealized_pnl: row.get("upl").and_then(as_f64).unwrap_or(0.0),
        leverage: row.get("lever").and_then(as_f64),
        stop_loss: None,
    })
}

/// `positions-history` rows; `direction` is the closed position side.
pub fn parse_positions_history(symbol: &str, ct_val: f64, data: &Value) -> Vec<Fill> {
    data.as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|r| {
                    Some(Fill {
                        order_id: str_field(r, "posId"),
                        symbol: symbol.to_string(),
                        position_side: r.get("direction").and_then(Value::as_str).and_then(Side::from_str),
                        entry_price: r.get("openAvgPx").and_then(as_f64).unwrap_or(0.0),
                        exit_price: r.get("closeAvgPx").and_then(as_f64).unwrap_or(0.0),
                        qty: r.get("closeTotalPos").and_then(as_f64).unwrap_or(0.0) * ct_val,
                        realized_pnl: r.get("realizedPnl").and_then(as_f64).unwrap_or(0.0),
                        fee: r.get("fee").and_then(as_f64).map(f64::abs).unwrap_or(0.0),
                        time: r.get("uTime").and_then(millis_to_utc)?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ProtectedOrderFlow for OkxAdapter {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let qty = request.size;
        if qty / self.ct_val() <= 0.0 {
            return Err(ExchangeError::rejected("min_qty", format!("size {qty} is below one contract step")));
        }
        let order_id = self
            .market_order(
                request.side.open_order_side(),
                request.side,
                qty,
                false,
                Some(&request.client_order_id),
            )
            .await?;

        let mut result = OrderResult::ok(order_id).with_client_id(request.client_order_id.clone());
        result.filled_qty = Some(qty);
        result.filled_price = self.fill_price().await;
        Ok(result)
    }

    async fn attach_stop_loss(
        &self,
        request: &OrderRequest,
        entry: &OrderResult,
        stop_loss: f64,
    ) -> Result<(), ExchangeError> {
        let qty = entry.filled_qty.unwrap_or(request.size);
        self.place_stop(request.side, qty, stop_loss, request.take_profit).await?;
        Ok(())
    }

    async fn emergency_close(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        let order_id = self
            .market_order(side.close_order_side(), side, size, true, None)
            .await?;
        Ok(OrderResult::ok(order_id))
    }
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if let Some(time) = &self.time {
            if let Err(e) = time.sync(true).await {
                warn!(venue = "okx", error = %e, "Initial time sync failed, using local clock");
            }
        }

        let instruments = self
            .public_get(
                "/api/v5/public/instruments",
                &[("instType", "SWAP".to_string()), ("instId", self.inst_id.clone())],
            )
            .await?;
        if let Some(ct) = instruments.pointer("/0/ctVal").and_then(as_f64).filter(|v| *v > 0.0) {
            if let Ok(mut guard) = self.contract_value.write() {
                *guard = ct;
            }
        }

        if !self.creds.is_empty() {
            let config = self.signed(Method::GET, "/api/v5/account/config", &[], None).await?;
            let hedge = config.pointer("/0/posMode").and_then(Value::as_str) == Some("long_short_mode");
            self.hedge_mode.store(hedge, Ordering::Relaxed);
        }

        info!(
            venue = "okx",
            inst_id = %self.inst_id,
            ct_val = self.ct_val(),
            hedge_mode = self.is_hedge_mode(),
            "✅ Connected"
        );
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let data = self
            .signed(Method::GET, "/api/v5/account/balance", &[("ccy", "USDT".to_string())], None)
            .await?;
        data.pointer("/0/details")
            .and_then(Value::as_array)
            .and_then(|details| {
                details
                    .iter()
                    .find(|d| d.get("ccy").and_then(Value::as_str) == Some("USDT"))
            })
            .and_then(|d| d.get("cashBal").and_then(as_f64))
            .ok_or_else(|| ExchangeError::data("okx balance has no USDT cashBal"))
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let data = self
            .public_get(
                "/api/v5/market/candles",
                &[
                    ("instId", self.inst_id.clone()),
                    ("bar", interval_code(Venue::Okx, interval).to_string()),
                    ("limit", limit.min(300).to_string()),
                ],
            )
            .await?;
        parse_klines(&data)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let data = self
            .public_get("/api/v5/market/ticker", &[("instId", self.inst_id.clone())])
            .await?;
        let ticker = data.get(0).ok_or_else(|| ExchangeError::data("okx ticker data empty"))?;
        positive_price(ticker, "last")
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let result = place_protected(self, &request).await?;
        let qty = result.filled_qty.unwrap_or(request.size);
        if let Some(price) = result.filled_price {
            self.tracker.open(request.side, qty, price, request.stop_loss);
        }
        info!(venue = "okx", side = %request.side, qty, price = ?result.filled_price, "📈 Entry filled");
        Ok(result)
    }

    async fn update_stop_loss(&self, new_sl: f64) -> Result<OrderResult, ExchangeError> {
        let (side, size) = match self.tracker.get() {
            Some(p) => (p.side, p.size),
            None => self
                .get_positions()
                .await?
                .first()
                .map(|p| (p.side, p.size))
                .ok_or_else(|| ExchangeError::rejected("no_position", "no open position for stop update"))?,
        };
        self.cancel_stops().await?;
        let algo_id = self.place_stop(side, size, new_sl, None).await?;
        self.tracker.set_stop(new_sl);
        Ok(OrderResult::ok(algo_id))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let positions = self.get_positions().await?;
        if positions.is_empty() {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }

        let mut closed_qty = 0.0;
        for p in &positions {
            let mut payload = json!({"instId": self.inst_id, "mgnMode": TD_MODE, "autoCxl": true});
            if let Some(ps) = self.pos_side(p.side) {
                payload["posSide"] = json!(ps);
            }
            self.signed(Method::POST, "/api/v5/trade/close-position", &[], Some(payload))
                .await?;
            closed_qty += p.size;
        }
        self.tracker.clear();

        let mut result = OrderResult::ok(None);
        result.filled_qty = Some(closed_qty);
        result.filled_price = self.fill_price().await;
        Ok(result)
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        tracked_for_add(self, &self.tracker, side).await?;
        let cid = add_client_id(&self.symbol, side);
        let order_id = self
            .market_order(side.open_order_side(), side, size, false, Some(&cid))
            .await?;
        let price = self.get_current_price().await?;
        let merged = self.tracker.apply_add(size, price);
        info!(
            venue = "okx",
            side = %side,
            size,
            price,
            avg_entry = ?merged.as_ref().map(|p| p.entry_price),
            "➕ Position added"
        );
        Ok(OrderResult::filled(order_id, price, size).with_client_id(cid))
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        let payload = json!({"instId": self.inst_id, "lever": leverage.to_string(), "mgnMode": TD_MODE});
        self.signed(Method::POST, "/api/v5/account/set-leverage", &[], Some(payload))
            .await?;
        debug!(venue = "okx", leverage, "Leverage set");
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let data = self
            .signed(
                Method::GET,
                "/api/v5/account/positions",
                &[("instType", "SWAP".to_string()), ("instId", self.inst_id.clone())],
                None,
            )
            .await?;
        let ct_val = self.ct_val();
        Ok(data
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| parse_position_row(&self.symbol, ct_val, r))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        let data = self
            .signed(
                Method::GET,
                "/api/v5/account/positions-history",
                &[
                    ("instType", "SWAP".to_string()),
                    ("instId", self.inst_id.clone()),
                    ("limit", limit.clamp(1, 100).to_string()),
                ],
                None,
            )
            .await?;
        Ok(parse_positions_history(&self.symbol, self.ct_val(), &data))
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}
