//! BingX perpetual swap v2 adapter
//!
//! Signed like Binance: HMAC-SHA256 hex over the query string, key in
//! `X-BX-APIKEY`. The stop-loss is a standalone `STOP_MARKET` order on the
//! opposite side for the filled size.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::http::{as_f64, as_i64, millis_to_utc, positive_price, str_field, VenueHttp};
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

const BASE_URL: &str = "https://open-api.bingx.com";

const AUTH_CODES: [i64; 3] = [100001, 100413, 100419];
const TRANSIENT_CODES: [i64; 3] = [100410, 100421, 100500];

pub struct BingxAdapter {
    symbol: String,
    venue_symbol: String,
    creds: Credentials,
    http: VenueHttp,
    precision: Precision,
    hedge_mode: AtomicBool,
    time: Option<Arc<TimeSync>>,
    tracker: PositionTracker,
}

impl BingxAdapter {
    pub fn new(symbol: &str, creds: Credentials) -> anyhow::Result<Self> {
        Ok(Self {
            symbol: canonical_symbol(symbol),
            venue_symbol: venue_symbol(Venue::Bingx, symbol),
            creds,
            http: VenueHttp::new(Venue::Bingx, BASE_URL)?,
            precision: Precision::for_venue(Venue::Bingx),
            // BingX accounts default to dual-side positions
            hedge_mode: AtomicBool::new(true),
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

    fn position_side(&self, side: Side) -> &'static str {
        match (self.is_hedge_mode(), side) {
            (false, _) => "BOTH",
            (true, Side::Long) => "LONG",
            (true, Side::Short) => "SHORT",
        }
    }

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let body = self
            .http
            .send(self.http.get(&format!("{path}?{}", query_string(params))))
            .await?;
        check_response(body)
    }

    async fn signed(&self, method: Method, path: &str, params: Vec<(&str, String)>) -> Result<Value, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing BingX credentials".into()));
        }
        let mut params = params;
        params.push(("timestamp", venue_timestamp_ms(self.time.as_ref()).await.to_string()));
        let qs = query_string(&params);
        let signature = hmac_sha256_hex(&self.creds.api_secret, &qs)?;

        let request = self
            .http
            .request(method, &format!("{path}?{qs}&signature={signature}"))
            .header("X-BX-APIKEY", &self.creds.api_key);
        check_response(self.http.send(request).await?)
    }

    async fn order(&self, params: Vec<(&str, String)>) -> Result<Option<String>, ExchangeError> {
        let data = self.signed(Method::POST, "/openApi/swap/v2/trade/order", params).await?;
        Ok(data.get("order").and_then(|o| str_field(o, "orderId")))
    }

    async fn market_order(
        &self,
        order_side: &str,
        position: Side,
        qty: f64,
        reduce_only: bool,
        client_order_id: Option<&str>,
    ) -> Result<Option<String>, ExchangeError> {
        let mut params = vec![
            ("symbol", self.venue_symbol.clone()),
            ("side", order_side.to_uppercase()),
            ("positionSide", self.position_side(position).to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", self.precision.format_qty(qty)),
        ];
        if reduce_only && !self.is_hedge_mode() {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(cid) = client_order_id {
            params.push(("clientOrderID", cid.to_string()));
        }
        self.order(params).await
    }

    async fn place_stop_market(&self, position: Side, qty: f64, stop_loss: f64) -> Result<Option<String>, ExchangeError> {
        let params = vec![
            ("symbol", self.venue_symbol.clone()),
            ("side", position.close_order_side().to_uppercase()),
            ("positionSide", self.position_side(position).to_string()),
            ("type", "STOP_MARKET".to_string()),
            ("quantity", self.precision.format_qty(qty)),
            ("stopPrice", self.precision.format_price(stop_loss)),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        self.order(params).await
    }

    async fn cancel_stop_orders(&self) -> Result<usize, ExchangeError> {
        let data = self
            .signed(
                Method::GET,
                "/openApi/swap/v2/trade/openOrders",
                vec![("symbol", self.venue_symbol.clone())],
            )
            .await?;
        let ids = stop_order_ids(&data);
        for id in &ids {
            self.signed(
                Method::DELETE,
                "/openApi/swap/v2/trade/order",
                vec![("symbol", self.venue_symbol.clone()), ("orderId", id.clone())],
            )
            .await?;
        }
        Ok(ids.len())
    }

    async fn fill_price(&self) -> Option<f64> {
        match self.get_current_price().await {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(venue = "bingx", error = %e, "No ticker after fill, entry price unknown");
                None
            }
        }
    }
}

pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    let code = body
        .get("code")
        .and_then(as_i64)
        .ok_or_else(|| ExchangeError::data(format!("bingx response without code: {body}")))?;
    if code == 0 {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }
    let msg = str_field(&body, "msg").unwrap_or_default();
    if AUTH_CODES.contains(&code) {
        Err(ExchangeError::Auth(format!("bingx {code}: {msg}")))
    } else if TRANSIENT_CODES.contains(&code) {
        Err(ExchangeError::transient(format!("bingx {code}: {msg}")))
    } else {
        Err(ExchangeError::rejected(code, msg))
    }
}

/// Ids of open `STOP_MARKET` orders in an `openOrders` response.
pub fn stop_order_ids(data: &Value) -> Vec<String> {
    data.get("orders")
        .and_then(Value::as_array)
        .map(|orders| {
            orders
                .iter()
                .filter(|o| o.get("type").and_then(Value::as_str) == Some("STOP_MARKET"))
                .filter_map(|o| str_field(o, "orderId"))
                .collect()
        })
        .unwrap_or_default()
}

/// v3 klines are objects `{open, close, high, low, volume, time}`.
pub fn parse_klines(data: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = data
        .as_array()
        .ok_or_else(|| ExchangeError::data("bingx klines data is not an array"))?;
    let mut candles = rows
        .iter()
        .map(|r| {
            let f = |k: &str| r.get(k).and_then(as_f64);
            let candle = match (r.get("time").and_then(as_i64), f("open"), f("high"), f("low"), f("close"), f("volume")) {
                (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v)) => Candle::from_millis(ts, o, h, l, c, v),
                _ => None,
            }
            .ok_or_else(|| ExchangeError::data(format!("malformed bingx kline: {r}")))?;
            candle.validate()?;
            Ok(candle)
        })
        .collect::<Result<Vec<_>, ExchangeError>>()?;
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

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
        entry_price: row.get("avgPrice").and_then(as_f64).unwrap_or(0.0),
        unrealized_pnl: row.get("unrealizedProfit").and_then(as_f64).unwrap_or(0.0),
        leverage: row.get("leverage").and_then(as_f64),
        stop_loss: None,
    })
}

/// Filled orders carrying a realized `profit` are closes.
pub fn parse_filled_orders(symbol: &str, data: &Value) -> Vec<Fill> {
    let orders = data.get("orders").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut fills: Vec<Fill> = orders
        .iter()
        .filter(|o| o.get("status").and_then(Value::as_str) == Some("FILLED"))
        .filter(|o| o.get("profit").and_then(as_f64).unwrap_or(0.0) != 0.0)
        .filter_map(|o| {
            Some(Fill {
                order_id: str_field(o, "orderId"),
                symbol: symbol.to_string(),
                position_side: o.get("positionSide").and_then(Value::as_str).and_then(Side::from_str),
                entry_price: 0.0,
                exit_price: o.get("avgPrice").and_then(as_f64).unwrap_or(0.0),
                qty: o.get("executedQty").and_then(as_f64).unwrap_or(0.0),
                realized_pnl: o.get("profit").and_then(as_f64).unwrap_or(0.0),
                fee: o.get("commission").and_then(as_f64).map(f64::abs).unwrap_or(0.0),
                time: o.get("updateTime").or_else(|| o.get("time")).and_then(millis_to_utc)?,
            })
        })
        .collect();
    fills.sort_by(|a, b| b.time.cmp(&a.time));
    fills
}

#[async_trait]
impl ProtectedOrderFlow for BingxAdapter {
    fn venue(&self) -> Venue {
        Venue::Bingx
    }

    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let qty = self.precision.round_qty(request.size);
        if qty <= 0.0 {
            return Err(ExchangeError::rejected("min_qty", format!("size {} rounds to zero", request.size)));
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
        self.place_stop_market(request.side, qty, stop_loss).await?;
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
impl ExchangeAdapter for BingxAdapter {
    fn venue(&self) -> Venue {
        Venue::Bingx
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if let Some(time) = &self.time {
            if let Err(e) = time.sync(true).await {
                warn!(venue = "bingx", error = %e, "Initial time sync failed, using local clock");
            }
        }

        if !self.creds.is_empty() {
            let data = self
                .signed(Method::GET, "/openApi/swap/v1/positionSide/dual", Vec::new())
                .await?;
            let dual = match data.get("dualSidePosition") {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => s == "true",
                _ => true,
            };
            self.hedge_mode.store(dual, Ordering::Relaxed);
        }

        info!(
            venue = "bingx",
            symbol = %self.venue_symbol,
            hedge_mode = self.is_hedge_mode(),
            "✅ Connected"
        );
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let data = self.signed(Method::GET, "/openApi/swap/v2/user/balance", Vec::new()).await?;
        data.pointer("/balance/balance")
            .and_then(as_f64)
            .ok_or_else(|| ExchangeError::data("bingx balance response missing balance.balance"))
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let data = self
            .public_get(
                "/openApi/swap/v3/quote/klines",
                &[
                    ("symbol", self.venue_symbol.clone()),
                    ("interval", interval_code(Venue::Bingx, interval).to_string()),
                    ("limit", limit.min(1440).to_string()),
                ],
            )
            .await?;
        parse_klines(&data)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let data = self
            .public_get("/openApi/swap/v2/quote/price", &[("symbol", self.venue_symbol.clone())])
            .await?;
        positive_price(&data, "price")
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let result = place_protected(self, &request).await?;
        let qty = result.filled_qty.unwrap_or(request.size);
        if let Some(price) = result.filled_price {
            self.tracker.open(request.side, qty, price, request.stop_loss);
        }
        info!(venue = "bingx", side = %request.side, qty, price = ?result.filled_price, "📈 Entry filled");
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
        let cancelled = self.cancel_stop_orders().await?;
        debug!(venue = "bingx", cancelled, "Old stop orders cancelled");
        let order_id = self.place_stop_market(side, size, new_sl).await?;
        self.tracker.set_stop(new_sl);
        Ok(OrderResult::ok(order_id))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let positions = self.get_positions().await?;
        if positions.is_empty() {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }

        self.signed(
            Method::POST,
            "/openApi/swap/v2/trade/closeAllPositions",
            vec![("symbol", self.venue_symbol.clone())],
        )
        .await?;
        if let Err(e) = self.cancel_stop_orders().await {
            warn!(venue = "bingx", error = %e, "Leftover stop orders not cancelled");
        }
        self.tracker.clear();

        let mut result = OrderResult::ok(None);
        result.filled_qty = Some(positions.iter().map(|p| p.size).sum());
        result.filled_price = self.fill_price().await;
        Ok(result)
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        tracked_for_add(self, &self.tracker, side).await?;
        let qty = self.precision.round_qty(size);
        let cid = add_client_id(&self.symbol, side);
        let order_id = self
            .market_order(side.open_order_side(), side, qty, false, Some(&cid))
            .await?;
        let price = self.get_current_price().await?;
        let merged = self.tracker.apply_add(qty, price);
        info!(
            venue = "bingx",
            side = %side,
            qty,
            price,
            avg_entry = ?merged.as_ref().map(|p| p.entry_price),
            "➕ Position added"
        );
        Ok(OrderResult::filled(order_id, price, qty).with_client_id(cid))
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        let sides: &[&str] = if self.is_hedge_mode() { &["LONG", "SHORT"] } else { &["BOTH"] };
        for side in sides {
            let params = vec![
                ("symbol", self.venue_symbol.clone()),
                ("side", side.to_string()),
                ("leverage", leverage.to_string()),
            ];
            match self.signed(Method::POST, "/openApi/swap/v2/trade/leverage", params).await {
                Ok(_) => {}
                Err(ExchangeError::Rejected { message, .. }) if message.to_lowercase().contains("not modified") => {
                    debug!(venue = "bingx", leverage, side, "Leverage already set");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let data = self
            .signed(
                Method::GET,
                "/openApi/swap/v2/user/positions",
                vec![("symbol", self.venue_symbol.clone())],
            )
            .await?;
        Ok(data
            .as_array()
            .map(|rows| rows.iter().filter_map(|r| parse_position_row(&self.symbol, r)).collect())
            .unwrap_or_default())
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        let data = self
            .signed(
                Method::GET,
                "/openApi/swap/v2/trade/allOrders",
                vec![
                    ("symbol", self.venue_symbol.clone()),
                    ("limit", limit.clamp(1, 500).to_string()),
                ],
            )
            .await?;
        Ok(parse_filled_orders(&self.symbol, &data))
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}
