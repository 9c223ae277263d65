//! Bybit v5 USDT-perpetual adapter
//!
//! Category `linear`, HMAC-SHA256 header signing over
//! `{timestamp}{api_key}{recv_window}{query|body}`. Stops are attached with
//! `position/trading-stop` after the market entry fills.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::http::{as_f64, as_i64, field_f64, millis_to_utc, positive_price, str_field, VenueHttp};
use super::signing::{hmac_sha256_hex, query_string};
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

const BASE_URL: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "60000";
const CATEGORY: &str = "linear";

const RET_OK: i64 = 0;
const RET_TIMESTAMP: i64 = 10002;
const RET_INVALID_KEY: i64 = 10003;
const RET_BAD_SIGN: i64 = 10004;
const RET_PERMISSION: i64 = 10005;
const RET_RATE_LIMIT: i64 = 10006;
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;

pub struct BybitAdapter {
    symbol: String,
    venue_symbol: String,
    creds: Credentials,
    http: VenueHttp,
    precision: Precision,
    hedge_mode: AtomicBool,
    time: Option<Arc<TimeSync>>,
    tracker: PositionTracker,
}

impl BybitAdapter {
    pub fn new(symbol: &str, creds: Credentials) -> anyhow::Result<Self> {
        Ok(Self {
            symbol: canonical_symbol(symbol),
            venue_symbol: venue_symbol(Venue::Bybit, symbol),
            creds,
            http: VenueHttp::new(Venue::Bybit, BASE_URL)?,
            precision: Precision::for_venue(Venue::Bybit),
            hedge_mode: AtomicBool::new(false),
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

    fn position_idx(&self, side: Side) -> u8 {
        position_idx(self.is_hedge_mode(), side)
    }

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let qs = query_string(params);
        let body = self.http.send(self.http.get(&format!("{path}?{qs}"))).await?;
        self.finish(body).await
    }

    async fn signed_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing Bybit credentials".into()));
        }
        let qs = query_string(params);
        let ts = venue_timestamp_ms(self.time.as_ref()).await;
        let sign = sign_payload(&self.creds, ts, &qs)?;

        let request = self
            .http
            .get(&format!("{path}?{qs}"))
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-SIGN", sign)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW);
        let body = self.http.send(request).await?;
        self.finish(body).await
    }

    async fn signed_post(&self, path: &str, payload: Value) -> Result<Value, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing Bybit credentials".into()));
        }
        let body_text = payload.to_string();
        let ts = venue_timestamp_ms(self.time.as_ref()).await;
        let sign = sign_payload(&self.creds, ts, &body_text)?;

        let request = self
            .http
            .post(path)
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-SIGN", sign)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .body(body_text);
        let body = self.http.send(request).await?;
        self.finish(body).await
    }

    /// Classify `retCode`; a timestamp rejection forces a clock resync first.
    async fn finish(&self, body: Value) -> Result<Value, ExchangeError> {
        if body.get("retCode").and_then(as_i64) == Some(RET_TIMESTAMP) {
            if let Some(time) = &self.time {
                if let Err(e) = time.sync(true).await {
                    warn!(venue = "bybit", error = %e, "Forced time resync failed");
                }
            }
        }
        check_response(body)
    }

    async fn create_order(
        &self,
        side_str: &str,
        qty: f64,
        position_idx: u8,
        reduce_only: bool,
        client_order_id: Option<&str>,
    ) -> Result<Option<String>, ExchangeError> {
        let mut payload = json!({
            "category": CATEGORY,
            "symbol": self.venue_symbol,
            "side": side_str,
            "orderType": "Market",
            "qty": self.precision.format_qty(qty),
            "positionIdx": position_idx,
        });
        if reduce_only {
            payload["reduceOnly"] = json!(true);
        }
        if let Some(cid) = client_order_id {
            payload["orderLinkId"] = json!(cid);
        }

        let result = self.signed_post("/v5/order/create", payload).await?;
        Ok(str_field(&result, "orderId"))
    }

    async fn set_trading_stop(
        &self,
        side: Side,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), ExchangeError> {
        let mut payload = json!({
            "category": CATEGORY,
            "symbol": self.venue_symbol,
            "stopLoss": self.precision.format_price(stop_loss),
            "slTriggerBy": "MarkPrice",
            "tpslMode": "Full",
            "positionIdx": self.position_idx(side),
        });
        if let Some(tp) = take_profit {
            payload["takeProfit"] = json!(self.precision.format_price(tp));
        }
        self.signed_post("/v5/position/trading-stop", payload).await?;
        Ok(())
    }

    async fn fetch_position_rows(&self) -> Result<Vec<Value>, ExchangeError> {
        let result = self
            .signed_get(
                "/v5/position/list",
                &[("category", CATEGORY.to_string()), ("symbol", self.venue_symbol.clone())],
            )
            .await?;
        Ok(result
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn wallet_balance(&self, account_type: &str) -> Result<f64, ExchangeError> {
        let result = self
            .signed_get(
                "/v5/account/wallet-balance",
                &[("accountType", account_type.to_string()), ("coin", "USDT".to_string())],
            )
            .await?;
        parse_wallet_balance(&result)
    }

    async fn fill_price(&self) -> Option<f64> {
        match self.get_current_price().await {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(venue = "bybit", error = %e, "No ticker after fill, entry price unknown");
                None
            }
        }
    }
}

/// Hedge mode addresses each side through its own index; one-way uses 0.
pub fn position_idx(hedge_mode: bool, side: Side) -> u8 {
    match (hedge_mode, side) {
        (false, _) => 0,
        (true, Side::Long) => 1,
        (true, Side::Short) => 2,
    }
}

fn sign_payload(creds: &Credentials, ts: i64, payload: &str) -> Result<String, ExchangeError> {
    hmac_sha256_hex(
        &creds.api_secret,
        &format!("{ts}{}{RECV_WINDOW}{payload}", creds.api_key),
    )
}

/// Map `retCode` onto the error taxonomy and return `result` on success.
pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    let code = body
        .get("retCode")
        .and_then(as_i64)
        .ok_or_else(|| ExchangeError::data(format!("bybit response without retCode: {body}")))?;
    let msg = str_field(&body, "retMsg").unwrap_or_default();

    match code {
        RET_OK => Ok(body.get("result").cloned().unwrap_or(Value::Null)),
        RET_INVALID_KEY | RET_BAD_SIGN | RET_PERMISSION => Err(ExchangeError::Auth(format!("bybit {code}: {msg}"))),
        RET_TIMESTAMP | RET_RATE_LIMIT => Err(ExchangeError::transient(format!("bybit {code}: {msg}"))),
        _ => Err(ExchangeError::rejected(code, msg)),
    }
}

/// `result.list` rows are newest first: `[start, open, high, low, close, volume, turnover]`.
pub fn parse_klines(result: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = result
        .get("list")
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::data("bybit kline response without list"))?;

    let mut candles = rows
        .iter()
        .map(|row| {
            let cell = |i: usize| row.get(i).and_then(as_f64);
            let ts = row.get(0).and_then(as_i64);
            match (ts, cell(1), cell(2), cell(3), cell(4), cell(5)) {
                (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v)) => Candle::from_millis(ts, o, h, l, c, v)
                    .ok_or_else(|| ExchangeError::data(format!("bybit kline timestamp out of range: {ts}"))),
                _ => Err(ExchangeError::data(format!("malformed bybit kline row: {row}"))),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    candles.reverse();
    for c in &candles {
        c.validate()?;
    }
    Ok(candles)
}

pub fn parse_wallet_balance(result: &Value) -> Result<f64, ExchangeError> {
    let coins = result
        .pointer("/list/0/coin")
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::data("bybit wallet response without coin list"))?;

    coins
        .iter()
        .find(|c| c.get("coin").and_then(Value::as_str) == Some("USDT"))
        .ok_or_else(|| ExchangeError::data("bybit wallet has no USDT entry"))
        .and_then(|c| field_f64(c, "walletBalance"))
}

pub fn parse_position_row(symbol: &str, row: &Value) -> Option<ExchangePosition> {
    let size = row.get("size").and_then(as_f64)?;
    if size <= 0.0 {
        return None;
    }
    let side = row.get("side").and_then(Value::as_str).and_then(Side::from_str)?;
    Some(ExchangePosition {
        symbol: symbol.to_string(),
        side,
        size,
        entry_price: row.get("avgPrice").and_then(as_f64).unwrap_or(0.0),
        unrealized_pnl: row.get("unrealisedPnl").and_then(as_f64).unwrap_or(0.0),
        leverage: row.get("leverage").and_then(as_f64),
        stop_loss: row.get("stopLoss").and_then(as_f64).filter(|sl| *sl > 0.0),
    })
}

/// `closed-pnl` rows; `side` there is the closing order side.
pub fn parse_closed_pnl(symbol: &str, result: &Value) -> Vec<Fill> {
    let rows = result.get("list").and_then(Value::as_array).cloned().unwrap_or_default();
    rows.iter()
        .filter_map(|row| {
            let time = row
                .get("updatedTime")
                .or_else(|| row.get("createdTime"))
                .and_then(millis_to_utc)?;
            let fee = row.get("openFee").and_then(as_f64).unwrap_or(0.0)
                + row.get("closeFee").and_then(as_f64).unwrap_or(0.0);
            Some(Fill {
                order_id: str_field(row, "orderId"),
                symbol: str_field(row, "symbol").unwrap_or_else(|| symbol.to_string()),
                position_side: row
                    .get("side")
                    .and_then(Value::as_str)
                    .and_then(Side::from_str)
                    .map(|s| s.opposite()),
                entry_price: row.get("avgEntryPrice").and_then(as_f64).unwrap_or(0.0),
                exit_price: row.get("avgExitPrice").and_then(as_f64).unwrap_or(0.0),
                qty: row.get("qty").and_then(as_f64).unwrap_or(0.0),
                realized_pnl: row.get("closedPnl").and_then(as_f64).unwrap_or(0.0),
                fee,
                time,
            })
        })
        .collect()
}

#[async_trait]
impl ProtectedOrderFlow for BybitAdapter {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let qty = self.precision.round_qty(request.size);
        if qty <= 0.0 {
            return Err(ExchangeError::rejected("min_qty", format!("size {} rounds to zero", request.size)));
        }
        let order_id = self
            .create_order(
                request.side.open_order_side(),
                qty,
                self.position_idx(request.side),
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
        _entry: &OrderResult,
        stop_loss: f64,
    ) -> Result<(), ExchangeError> {
        self.set_trading_stop(request.side, stop_loss, request.take_profit).await
    }

    async fn emergency_close(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        let order_id = self
            .create_order(side.close_order_side(), size, self.position_idx(side), true, None)
            .await?;
        Ok(OrderResult::ok(order_id))
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if let Some(time) = &self.time {
            if let Err(e) = time.sync(true).await {
                warn!(venue = "bybit", error = %e, "Initial time sync failed, using local clock");
            }
        }

        if !self.creds.is_empty() {
            let rows = self.fetch_position_rows().await?;
            let hedge = rows
                .iter()
                .any(|r| r.get("positionIdx").and_then(as_i64).unwrap_or(0) > 0);
            self.hedge_mode.store(hedge, Ordering::Relaxed);
        }

        info!(
            venue = "bybit",
            symbol = %self.venue_symbol,
            hedge_mode = self.is_hedge_mode(),
            "✅ Connected"
        );
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let mut last_err = ExchangeError::data("bybit wallet balance unavailable");
        for account_type in ["UNIFIED", "CONTRACT"] {
            match self.wallet_balance(account_type).await {
                Ok(balance) => return Ok(balance),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(venue = "bybit", account_type, error = %e, "Wallet lookup failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let result = self
            .public_get(
                "/v5/market/kline",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", self.venue_symbol.clone()),
                    ("interval", interval_code(Venue::Bybit, interval).to_string()),
                    ("limit", limit.min(1000).to_string()),
                ],
            )
            .await?;
        parse_klines(&result)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let result = self
            .public_get(
                "/v5/market/tickers",
                &[("category", CATEGORY.to_string()), ("symbol", self.venue_symbol.clone())],
            )
            .await?;
        let ticker = result
            .pointer("/list/0")
            .ok_or_else(|| ExchangeError::data("bybit ticker list empty"))?;
        positive_price(ticker, "lastPrice")
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let result = place_protected(self, &request).await?;
        let qty = result.filled_qty.unwrap_or(request.size);
        if let Some(price) = result.filled_price {
            self.tracker.open(request.side, qty, price, request.stop_loss);
        }
        info!(
            venue = "bybit",
            side = %request.side,
            qty,
            price = ?result.filled_price,
            stop_loss = ?request.stop_loss,
            "📈 Entry filled"
        );
        Ok(result)
    }

    async fn update_stop_loss(&self, new_sl: f64) -> Result<OrderResult, ExchangeError> {
        let side = match self.tracker.get() {
            Some(p) => p.side,
            None => self
                .get_positions()
                .await?
                .first()
                .map(|p| p.side)
                .ok_or_else(|| ExchangeError::rejected("no_position", "no open position for stop update"))?,
        };
        self.set_trading_stop(side, new_sl, None).await?;
        self.tracker.set_stop(new_sl);
        Ok(OrderResult::ok(None))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let positions = self.get_positions().await?;
        if positions.is_empty() {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }

        let mut last_order = None;
        let mut closed_qty = 0.0;
        for p in &positions {
            last_order = self
                .create_order(p.side.close_order_side(), p.size, self.position_idx(p.side), true, None)
                .await?;
            closed_qty += p.size;
        }
        self.tracker.clear();

        let mut result = OrderResult::ok(last_order);
        result.filled_qty = Some(closed_qty);
        result.filled_price = self.fill_price().await;
        Ok(result)
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        tracked_for_add(self, &self.tracker, side).await?;
        let qty = self.precision.round_qty(size);
        let cid = add_client_id(&self.symbol, side);
        let order_id = self
            .create_order(side.open_order_side(), qty, self.position_idx(side), false, Some(&cid))
            .await?;

        let price = self.get_current_price().await?;
        let merged = self.tracker.apply_add(qty, price);
        info!(
            venue = "bybit",
            side = %side,
            qty,
            price,
            avg_entry = ?merged.as_ref().map(|p| p.entry_price),
            "➕ Position added"
        );
        Ok(OrderResult::filled(order_id, price, qty).with_client_id(cid))
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        let payload = json!({
            "category": CATEGORY,
            "symbol": self.venue_symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.signed_post("/v5/position/set-leverage", payload).await {
            Ok(_) => Ok(true),
            Err(ExchangeError::Rejected { code, .. }) if code == RET_LEVERAGE_NOT_MODIFIED.to_string() => {
                debug!(venue = "bybit", leverage, "Leverage already set");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let rows = self.fetch_position_rows().await?;
        Ok(rows
            .iter()
            .filter_map(|r| parse_position_row(&self.symbol, r))
            .collect())
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        let result = self
            .signed_get(
                "/v5/position/closed-pnl",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", self.venue_symbol.clone()),
                    ("limit", limit.clamp(1, 100).to_string()),
                ],
            )
            .await?;
        Ok(parse_closed_pnl(&self.symbol, &result))
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_codes_map_to_error_kinds() {
        assert!(check_response(json!({"retCode": 0, "result": {"a": 1}})).is_ok());
        assert!(matches!(
            check_response(json!({"retCode": 10003, "retMsg": "invalid api key"})),
            Err(ExchangeError::Auth(_))
        ));
        assert!(matches!(
            check_response(json!({"retCode": 10002, "retMsg": "timestamp"})),
            Err(ExchangeError::Transient(_))
        ));
        assert!(matches!(
            check_response(json!({"retCode": 110043, "retMsg": "leverage not modified"})),
            Err(ExchangeError::Rejected { code, .. }) if code == "110043"
        ));
        assert!(matches!(check_response(json!({})), Err(ExchangeError::DataIntegrity(_))));
    }

    #[test]
    fn klines_come_back_ascending() {
        let result = json!({"list": [
            ["1705327200000", "50100", "50200", "50000", "50150", "12.5", "0"],
            ["1705326300000", "50000", "50120", "49900", "50100", "10.0", "0"],
        ]});
        let candles = parse_klines(&result).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[1].close, 50150.0);
    }

    #[test]
    fn malformed_kline_is_data_error() {
        let result = json!({"list": [["1705327200000", "NaN", "1", "1", "1", "1"]]});
        assert!(matches!(parse_klines(&result), Err(ExchangeError::DataIntegrity(_))));
    }

    #[test]
    fn wallet_balance_reads_usdt_entry() {
        let result = json!({"list": [{"coin": [
            {"coin": "BTC", "walletBalance": "0.1"},
            {"coin": "USDT", "walletBalance": "1234.5"}
        ]}]});
        assert_eq!(parse_wallet_balance(&result).unwrap(), 1234.5);
        assert!(parse_wallet_balance(&json!({"list": []})).is_err());
    }

    #[test]
    fn position_rows_skip_flat_entries() {
        let open = json!({"side": "Buy", "size": "0.01", "avgPrice": "50000", "stopLoss": "0",
                          "unrealisedPnl": "1.2", "leverage": "10", "positionIdx": 1});
        let flat = json!({"side": "", "size": "0", "avgPrice": "0"});
        let p = parse_position_row("BTCUSDT", &open).unwrap();
        assert_eq!(p.side, Side::Long);
        assert_eq!(p.stop_loss, None);
        assert_eq!(p.leverage, Some(10.0));
        assert!(parse_position_row("BTCUSDT", &flat).is_none());
    }

    #[test]
    fn closed_pnl_side_is_inverted() {
        let result = json!({"list": [{
            "orderId": "o1", "symbol": "BTCUSDT", "side": "Sell", "qty": "0.01",
            "avgEntryPrice": "50000", "avgExitPrice": "51000", "closedPnl": "9.9",
            "createdTime": "1705327200000", "updatedTime": "1705327201000"
        }]});
        let fills = parse_closed_pnl("BTCUSDT", &result);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].position_side, Some(Side::Long));
        assert_eq!(fills[0].exit_price, 51000.0);
    }

    #[test]
    fn hedge_mode_selects_position_index() {
        assert_eq!(position_idx(false, Side::Short), 0);
        assert_eq!(position_idx(true, Side::Long), 1);
        assert_eq!(position_idx(true, Side::Short), 2);
    }

    #[test]
    fn signature_covers_timestamp_key_window_and_payload() {
        let creds = Credentials::new("key", "secret");
        let sig = sign_payload(&creds, 1_700_000_000_000, "category=linear").unwrap();
        let expected = hmac_sha256_hex("secret", "1700000000000key60000category=linear").unwrap();
        assert_eq!(sig, expected);
    }
}
