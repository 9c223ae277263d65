//! Binance USDT-M futures adapter
//!
//! Signed calls put every parameter in the query string with `timestamp`,
//! `recvWindow` and a trailing HMAC-SHA256 `signature`. Stops are separate
//! `STOP_MARKET closePosition=true` orders.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
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

const BASE_URL: &str = "https://fapi.binance.com";
const RECV_WINDOW: &str = "5000";

const CODE_TIMESTAMP: i64 = -1021;
const CODE_RATE_LIMIT: i64 = -1003;
const CODE_BAD_SIGNATURE: i64 = -1022;
const CODE_BAD_KEY_FORMAT: i64 = -2014;
const CODE_INVALID_KEY: i64 = -2015;
const CODE_LEVERAGE_NOT_MODIFIED: i64 = -4028;
const CODE_NO_NEED_TO_CHANGE: i64 = -4046;

pub struct BinanceAdapter {
    symbol: String,
    venue_symbol: String,
    creds: Credentials,
    http: VenueHttp,
    precision: Precision,
    hedge_mode: AtomicBool,
    time: Option<Arc<TimeSync>>,
    tracker: PositionTracker,
}

impl BinanceAdapter {
    pub fn new(symbol: &str, creds: Credentials) -> anyhow::Result<Self> {
        Ok(Self {
            symbol: canonical_symbol(symbol),
            venue_symbol: venue_symbol(Venue::Binance, symbol),
            creds,
            http: VenueHttp::new(Venue::Binance, BASE_URL)?,
            precision: Precision::for_venue(Venue::Binance),
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

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let body = self
            .http
            .send(self.http.get(&format!("{path}?{}", query_string(params))))
            .await?;
        check_response(body)
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<Value, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing Binance credentials".into()));
        }
        let mut params = params;
        params.push(("recvWindow", RECV_WINDOW.to_string()));
        params.push(("timestamp", venue_timestamp_ms(self.time.as_ref()).await.to_string()));

        let qs = query_string(&params);
        let signature = hmac_sha256_hex(&self.creds.api_secret, &qs)?;
        let request = self
            .http
            .request(method, &format!("{path}?{qs}&signature={signature}"))
            .header("X-MBX-APIKEY", &self.creds.api_key);

        let body = self.http.send(request).await?;
        if error_code(&body) == Some(CODE_TIMESTAMP) {
            if let Some(time) = &self.time {
                if let Err(e) = time.sync(true).await {
                    warn!(venue = "binance", error = %e, "Forced time resync failed");
                }
            }
        }
        check_response(body)
    }

    /// `positionSide` only exists in hedge mode; one-way orders omit it.
    fn position_side_param(&self, side: Side) -> Option<(&'static str, String)> {
        self.is_hedge_mode().then(|| ("positionSide", position_side(side).to_string()))
    }

    async fn market_order(
        &self,
        order_side: &str,
        position: Side,
        qty: f64,
        reduce_only: bool,
        client_order_id: Option<&str>,
    ) -> Result<Value, ExchangeError> {
        let mut params = vec![
            ("symbol", self.venue_symbol.clone()),
            ("side", order_side.to_uppercase()),
            ("type", "MARKET".to_string()),
            ("quantity", self.precision.format_qty(qty)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        params.extend(self.position_side_param(position));
        // hedge mode rejects reduceOnly; positionSide already scopes the close
        if reduce_only && !self.is_hedge_mode() {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(cid) = client_order_id {
            params.push(("newClientOrderId", cid.to_string()));
        }
        self.signed(Method::POST, "/fapi/v1/order", params).await
    }

    async fn place_trigger(&self, kind: &str, position: Side, trigger: f64) -> Result<Value, ExchangeError> {
        let mut params = vec![
            ("symbol", self.venue_symbol.clone()),
            ("side", position.close_order_side().to_uppercase()),
            ("type", kind.to_string()),
            ("stopPrice", self.precision.format_price(trigger)),
            ("closePosition", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        params.extend(self.position_side_param(position));
        self.signed(Method::POST, "/fapi/v1/order", params).await
    }

    async fn cancel_all_orders(&self) -> Result<(), ExchangeError> {
        self.signed(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            vec![("symbol", self.venue_symbol.clone())],
        )
        .await?;
        Ok(())
    }

    async fn order_result(&self, body: &Value, fallback_qty: f64) -> OrderResult {
        let mut result = OrderResult::ok(str_field(body, "orderId"));
        result.filled_qty = body
            .get("executedQty")
            .and_then(as_f64)
            .filter(|q| *q > 0.0)
            .or(Some(fallback_qty));
        result.filled_price = match body.get("avgPrice").and_then(as_f64).filter(|p| *p > 0.0) {
            Some(p) => Some(p),
            None => self.get_current_price().await.ok(),
        };
        result
    }
}

fn position_side(side: Side) -> &'static str {
    match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}

/// Negative `code` of a Binance error body.
fn error_code(body: &Value) -> Option<i64> {
    body.as_object()?.get("code").and_then(as_i64).filter(|c| *c < 0)
}

pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    let Some(code) = error_code(&body) else {
        return Ok(body);
    };
    let msg = str_field(&body, "msg").unwrap_or_default();
    match code {
        CODE_BAD_SIGNATURE | CODE_BAD_KEY_FORMAT | CODE_INVALID_KEY => {
            Err(ExchangeError::Auth(format!("binance {code}: {msg}")))
        }
        CODE_TIMESTAMP | CODE_RATE_LIMIT => Err(ExchangeError::transient(format!("binance {code}: {msg}"))),
        _ => Err(ExchangeError::rejected(code, msg)),
    }
}

/// Rows are ascending: `[openTime, open, high, low, close, volume, closeTime, ...]`.
pub fn parse_klines(body: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = body
        .as_array()
        .ok_or_else(|| ExchangeError::data("binance klines response is not an array"))?;
    rows.iter()
        .map(|row| {
            let cell = |i: usize| row.get(i).and_then(as_f64);
            let candle = match (row.get(0).and_then(as_i64), cell(1), cell(2), cell(3), cell(4), cell(5)) {
                (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v)) => Candle::from_millis(ts, o, h, l, c, v),
                _ => None,
            }
            .ok_or_else(|| ExchangeError::data(format!("malformed binance kline row: {row}")))?;
            candle.validate()?;
            Ok(candle)
        })
        .collect()
}

/// `positionRisk` row; `positionAmt` is signed in one-way mode.
pub fn parse_position_row(symbol: &str, row: &Value) -> Option<ExchangePosition> {
    let amt = row.get("positionAmt").and_then(as_f64)?;
    if amt == 0.0 {
        return None;
    }
    let side = match row.get("positionSide").and_then(Value::as_str) {
        Some("LONG") => Side::Long,
        Some("SHORT") => Side::Short,
        _ if amt > 0.0 => Side::Long,
        _ => Side::Short,
    };
    Some(ExchangePosition {
        symbol: symbol.to_string(),
        side,
        size: amt.abs(),
        entry_price: row.get("entryPrice").and_then(as_f64).unwrap_or(0.0),
        unrealized_pnl: row.get("unRealizedProfit").and_then(as_f64).unwrap_or(0.0),
        leverage: row.get("leverage").and_then(as_f64),
        stop_loss: None,
    })
}

/// `userTrades` rows with a realized PnL are closing fills.
pub fn parse_user_trades(symbol: &str, body: &Value) -> Vec<Fill> {
    let rows = body.as_array().cloned().unwrap_or_default();
    let mut fills: Vec<Fill> = rows
        .iter()
        .filter(|r| r.get("realizedPnl").and_then(as_f64).unwrap_or(0.0) != 0.0)
        .filter_map(|r| {
            let position_side = match r.get("positionSide").and_then(Value::as_str) {
                Some("LONG") => Some(Side::Long),
                Some("SHORT") => Some(Side::Short),
                _ => r
                    .get("side")
                    .and_then(Value::as_str)
                    .and_then(Side::from_str)
                    .map(|s| s.opposite()),
            };
            Some(Fill {
                order_id: str_field(r, "orderId"),
                symbol: symbol.to_string(),
                position_side,
                entry_price: 0.0,
                exit_price: r.get("price").and_then(as_f64).unwrap_or(0.0),
                qty: r.get("qty").and_then(as_f64).unwrap_or(0.0),
                realized_pnl: r.get("realizedPnl").and_then(as_f64).unwrap_or(0.0),
                fee: r.get("commission").and_then(as_f64).unwrap_or(0.0),
                time: r.get("time").and_then(millis_to_utc)?,
            })
        })
        .collect();
    fills.sort_by(|a, b| b.time.cmp(&a.time));
    fills
}

#[async_trait]
impl ProtectedOrderFlow for BinanceAdapter {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let qty = self.precision.round_qty(request.size);
        if qty <= 0.0 {
            return Err(ExchangeError::rejected("min_qty", format!("size {} rounds to zero", request.size)));
        }
        let body = self
            .market_order(
                request.side.open_order_side(),
                request.side,
                qty,
                false,
                Some(&request.client_order_id),
            )
            .await?;
        Ok(self
            .order_result(&body, qty)
            .await
            .with_client_id(request.client_order_id.clone()))
    }

    async fn attach_stop_loss(
        &self,
        request: &OrderRequest,
        _entry: &OrderResult,
        stop_loss: f64,
    ) -> Result<(), ExchangeError> {
        self.place_trigger("STOP_MARKET", request.side, stop_loss).await?;

        if let Some(tp) = request.take_profit {
            if let Err(e) = self.place_trigger("TAKE_PROFIT_MARKET", request.side, tp).await {
                warn!(venue = "binance", take_profit = tp, error = %e, "Take-profit order failed, stop is in place");
            }
        }
        Ok(())
    }

    async fn emergency_close(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        let body = self
            .market_order(side.close_order_side(), side, size, true, None)
            .await?;
        Ok(OrderResult::ok(str_field(&body, "orderId")))
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if let Some(time) = &self.time {
            if let Err(e) = time.sync(true).await {
                warn!(venue = "binance", error = %e, "Initial time sync failed, using local clock");
            }
        }

        if !self.creds.is_empty() {
            let body = self.signed(Method::GET, "/fapi/v1/positionSide/dual", Vec::new()).await?;
            let dual = body.get("dualSidePosition").and_then(Value::as_bool).unwrap_or(false);
            self.hedge_mode.store(dual, Ordering::Relaxed);
        }

        info!(
            venue = "binance",
            symbol = %self.venue_symbol,
            hedge_mode = self.is_hedge_mode(),
            "✅ Connected"
        );
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let body = self.signed(Method::GET, "/fapi/v2/account", Vec::new()).await?;
        field_f64(&body, "totalWalletBalance")
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let body = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", self.venue_symbol.clone()),
                    ("interval", interval_code(Venue::Binance, interval).to_string()),
                    ("limit", limit.min(1500).to_string()),
                ],
            )
            .await?;
        parse_klines(&body)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let body = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", self.venue_symbol.clone())])
            .await?;
        positive_price(&body, "price")
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let result = place_protected(self, &request).await?;
        let qty = result.filled_qty.unwrap_or(request.size);
        if let Some(price) = result.filled_price {
            self.tracker.open(request.side, qty, price, request.stop_loss);
        }
        info!(
            venue = "binance",
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
        self.cancel_all_orders().await?;
        let body = self.place_trigger("STOP_MARKET", side, new_sl).await?;
        self.tracker.set_stop(new_sl);
        Ok(OrderResult::ok(str_field(&body, "orderId")))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let positions = self.get_positions().await?;
        if positions.is_empty() {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }

        let mut last = None;
        let mut closed_qty = 0.0;
        for p in &positions {
            let body = self
                .market_order(p.side.close_order_side(), p.side, p.size, true, None)
                .await?;
            closed_qty += p.size;
            last = Some(body);
        }
        if let Err(e) = self.cancel_all_orders().await {
            warn!(venue = "binance", error = %e, "Leftover stop orders not cancelled");
        }
        self.tracker.clear();

        let body = last.unwrap_or(Value::Null);
        Ok(self.order_result(&body, closed_qty).await)
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        tracked_for_add(self, &self.tracker, side).await?;
        let qty = self.precision.round_qty(size);
        let cid = add_client_id(&self.symbol, side);
        let body = self
            .market_order(side.open_order_side(), side, qty, false, Some(&cid))
            .await?;
        let result = self.order_result(&body, qty).await.with_client_id(cid);

        let price = match result.filled_price {
            Some(p) => p,
            None => self.get_current_price().await?,
        };
        let merged = self.tracker.apply_add(result.filled_qty.unwrap_or(qty), price);
        info!(
            venue = "binance",
            side = %side,
            qty,
            price,
            avg_entry = ?merged.as_ref().map(|p| p.entry_price),
            "➕ Position added"
        );
        Ok(result)
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        let params = vec![
            ("symbol", self.venue_symbol.clone()),
            ("leverage", leverage.to_string()),
        ];
        match self.signed(Method::POST, "/fapi/v1/leverage", params).await {
            Ok(_) => Ok(true),
            Err(ExchangeError::Rejected { code, .. })
                if code == CODE_LEVERAGE_NOT_MODIFIED.to_string() || code == CODE_NO_NEED_TO_CHANGE.to_string() =>
            {
                debug!(venue = "binance", leverage, "Leverage already set");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let body = self
            .signed(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", self.venue_symbol.clone())],
            )
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::data("binance positionRisk is not an array"))?;
        Ok(rows
            .iter()
            .filter_map(|r| parse_position_row(&self.symbol, r))
            .collect())
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        let body = self
            .signed(
                Method::GET,
                "/fapi/v1/userTrades",
                vec![
                    ("symbol", self.venue_symbol.clone()),
                    ("limit", limit.clamp(1, 1000).to_string()),
                ],
            )
            .await?;
        Ok(parse_user_trades(&self.symbol, &body))
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_codes_map_to_kinds() {
        assert!(check_response(json!({"orderId": 1})).is_ok());
        assert!(check_response(json!([1, 2])).is_ok());
        assert!(matches!(
            check_response(json!({"code": -2015, "msg": "Invalid API-key"})),
            Err(ExchangeError::Auth(_))
        ));
        assert!(matches!(
            check_response(json!({"code": -1021, "msg": "Timestamp outside recvWindow"})),
            Err(ExchangeError::Transient(_))
        ));
        assert!(matches!(
            check_response(json!({"code": -4028, "msg": "Leverage not modified"})),
            Err(ExchangeError::Rejected { code, .. }) if code == "-4028"
        ));
        // code 200 on success-style bodies is not an error
        assert!(check_response(json!({"code": 200, "msg": "success"})).is_ok());
    }

    #[test]
    fn klines_parse_in_order() {
        let body = json!([
            [1705326300000i64, "50000", "50120", "49900", "50100", "10.0", 1705327199999i64],
            [1705327200000i64, "50100", "50200", "50000", "50150", "12.5", 1705328099999i64]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 50000.0);
        assert!(parse_klines(&json!({"code": -1})).is_err());
    }

    #[test]
    fn position_side_from_signed_amount() {
        let short = json!({"positionAmt": "-0.5", "entryPrice": "50000", "positionSide": "BOTH",
                           "unRealizedProfit": "3", "leverage": "10"});
        let p = parse_position_row("BTCUSDT", &short).unwrap();
        assert_eq!(p.side, Side::Short);
        assert_eq!(p.size, 0.5);
        assert!(parse_position_row("BTCUSDT", &json!({"positionAmt": "0"})).is_none());
    }

    #[test]
    fn user_trades_keep_only_closing_fills() {
        let body = json!([
            {"orderId": 1, "side": "BUY", "price": "50000", "qty": "0.01", "realizedPnl": "0",
             "commission": "0.2", "time": 1705327200000i64, "positionSide": "BOTH"},
            {"orderId": 2, "side": "SELL", "price": "51000", "qty": "0.01", "realizedPnl": "10",
             "commission": "0.2", "time": 1705330800000i64, "positionSide": "BOTH"}
        ]);
        let fills = parse_user_trades("BTCUSDT", &body);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id.as_deref(), Some("2"));
        assert_eq!(fills[0].position_side, Some(Side::Long));
    }
}
