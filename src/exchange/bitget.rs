//! Bitget v2 mix (USDT-FUTURES) adapter

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

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

const BASE_URL: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";
const MARGIN_MODE: &str = "crossed";
const SUCCESS: &str = "00000";

const AUTH_CODES: [&str; 5] = ["40006", "40009", "40012", "40037", "40014"];
const TRANSIENT_CODES: [&str; 3] = ["40008", "40010", "429"];

pub struct BitgetAdapter {
    symbol: String,
    venue_symbol: String,
    creds: Credentials,
    http: VenueHttp,
    precision: Precision,
    hedge_mode: AtomicBool,
    time: Option<Arc<TimeSync>>,
    tracker: PositionTracker,
}

impl BitgetAdapter {
    pub fn new(symbol: &str, creds: Credentials) -> anyhow::Result<Self> {
        Ok(Self {
            symbol: canonical_symbol(symbol),
            venue_symbol: venue_symbol(Venue::Bitget, symbol),
            creds,
            http: VenueHttp::new(Venue::Bitget, BASE_URL)?,
            precision: Precision::for_venue(Venue::Bitget),
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

    fn base_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("symbol", self.venue_symbol.clone()),
            ("productType", PRODUCT_TYPE.to_string()),
        ]
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
        params: &[(&str, String)],
        payload: Option<Value>,
    ) -> Result<Value, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing Bitget credentials".into()));
        }
        let passphrase = self
            .creds
            .passphrase
            .as_deref()
            .ok_or_else(|| ExchangeError::Auth("missing Bitget passphrase".into()))?;

        let request_path = if params.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", query_string(params))
        };
        let body_text = payload.map(|p| p.to_string()).unwrap_or_default();
        let ts = venue_timestamp_ms(self.time.as_ref()).await.to_string();
        let sign = hmac_sha256_base64(
            &self.creds.api_secret,
            &format!("{ts}{}{request_path}{body_text}", method.as_str()),
        )?;

        let mut request = self
            .http
            .request(method, &request_path)
            .header("ACCESS-KEY", &self.creds.api_key)
            .header("ACCESS-SIGN", sign)
            .header("ACCESS-TIMESTAMP", ts)
            .header("ACCESS-PASSPHRASE", passphrase)
            .header("locale", "en-US");
        if !body_text.is_empty() {
            request = request.body(body_text);
        }
        check_response(self.http.send(request).await?)
    }

    async fn market_order(
        &self,
        position: Side,
        closing: bool,
        qty: f64,
        client_order_id: Option<&str>,
    ) -> Result<Option<String>, ExchangeError> {
        let (side, trade_side, reduce_only) = order_sides(self.is_hedge_mode(), position, closing);
        let mut payload = json!({
            "symbol": self.venue_symbol,
            "productType": PRODUCT_TYPE,
            "marginMode": MARGIN_MODE,
            "marginCoin": MARGIN_COIN,
            "size": self.precision.format_qty(qty),
            "side": side,
            "orderType": "market",
        });
        if let Some(ts) = trade_side {
            payload["tradeSide"] = json!(ts);
        }
        if reduce_only {
            payload["reduceOnly"] = json!("YES");
        }
        if let Some(cid) = client_order_id {
            payload["clientOid"] = json!(cid);
        }

        let data = self
            .signed(Method::POST, "/api/v2/mix/order/place-order", &[], Some(payload))
            .await?;
        Ok(str_field(&data, "orderId"))
    }

    async fn place_plan(&self, plan_type: &str, position: Side, qty: f64, trigger: f64) -> Result<Option<String>, ExchangeError> {
        let payload = json!({
            "symbol": self.venue_symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "planType": plan_type,
            "triggerPrice": self.precision.format_price(trigger),
            "triggerType": "mark_price",
            "executePrice": "0",
            "holdSide": hold_side(self.is_hedge_mode(), position),
            "size": self.precision.format_qty(qty),
        });
        let data = self
            .signed(Method::POST, "/api/v2/mix/order/place-tpsl-order", &[], Some(payload))
            .await?;
        Ok(str_field(&data, "orderId"))
    }

    async fn cancel_loss_plans(&self) -> Result<(), ExchangeError> {
        let payload = json!({
            "symbol": self.venue_symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "planType": "loss_plan",
        });
        match self
            .signed(Method::POST, "/api/v2/mix/order/cancel-plan-order", &[], Some(payload))
            .await
        {
            Ok(_) => Ok(()),
            // nothing to cancel
            Err(ExchangeError::Rejected { code, .. }) if code == "40768" || code == "43025" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fill_price(&self) -> Option<f64> {
        match self.get_current_price().await {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(venue = "bitget", error = %e, "No ticker after fill, entry price unknown");
                None
            }
        }
    }
}

/// `(side, tradeSide, reduceOnly)` for an order.
///
/// Hedge mode names the position side and sets `tradeSide`; one-way mode uses
/// the order direction and `reduceOnly` for closes.
pub fn order_sides(hedge_mode: bool, position: Side, closing: bool) -> (&'static str, Option<&'static str>, bool) {
    let open_side = match position {
        Side::Long => "buy",
        Side::Short => "sell",
    };
    if hedge_mode {
        (open_side, Some(if closing { "close" } else { "open" }), false)
    } else if closing {
        let close_side = if open_side == "buy" { "sell" } else { "buy" };
        (close_side, None, true)
    } else {
        (open_side, None, false)
    }
}

fn hold_side(hedge_mode: bool, position: Side) -> &'static str {
    match (hedge_mode, position) {
        (true, Side::Long) => "long",
        (true, Side::Short) => "short",
        (false, Side::Long) => "buy",
        (false, Side::Short) => "sell",
    }
}

pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    let code = str_field(&body, "code")
        .ok_or_else(|| ExchangeError::data(format!("bitget response without code: {body}")))?;
    if code == SUCCESS {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }
    let msg = str_field(&body, "msg").unwrap_or_default();
    if AUTH_CODES.contains(&code.as_str()) {
        Err(ExchangeError::Auth(format!("bitget {code}: {msg}")))
    } else if TRANSIENT_CODES.contains(&code.as_str()) {
        Err(ExchangeError::transient(format!("bitget {code}: {msg}")))
    } else {
        Err(ExchangeError::rejected(code, msg))
    }
}

/// Rows are ascending: `[ts, open, high, low, close, baseVol, quoteVol]`.
pub fn parse_klines(data: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = data
        .as_array()
        .ok_or_else(|| ExchangeError::data("bitget candles data is not an array"))?;
    let mut candles = rows
        .iter()
        .map(|row| {
            let cell = |i: usize| row.get(i).and_then(as_f64);
            let candle = match (row.get(0).and_then(as_i64), cell(1), cell(2), cell(3), cell(4), cell(5)) {
                (Some(ts), Some(o), Some(h), Some(l), Some(c), Some(v)) => Candle::from_millis(ts, o, h, l, c, v),
                _ => None,
            }
            .ok_or_else(|| ExchangeError::data(format!("malformed bitget candle row: {row}")))?;
            candle.validate()?;
            Ok(candle)
        })
        .collect::<Result<Vec<_>, ExchangeError>>()?;
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

pub fn parse_position_row(symbol: &str, row: &Value) -> Option<ExchangePosition> {
    let size = row.get("total").and_then(as_f64)?;
    if size <= 0.0 {
        return None;
    }
    let side = row.get("holdSide").and_then(Value::as_str).and_then(Side::from_str)?;
    Some(ExchangePosition {
        symbol: symbol.to_string(),
        side,
        size,
        entry_price: row.get("openPriceAvg").and_then(as_f64).unwrap_or(0.0),
        unrealized_pnl: row.get("unrealizedPL").and_then(as_f64).unwrap_or(0.0),
        leverage: row.get("leverage").and_then(as_f64),
        stop_loss: row.get("stopLoss").and_then(as_f64).filter(|v| *v > 0.0),
    })
}

pub fn parse_history(symbol: &str, data: &Value) -> Vec<Fill> {
    let rows = data.get("list").and_then(Value::as_array).cloned().unwrap_or_default();
    rows.iter()
        .filter_map(|r| {
            let fee = r.get("openFee").and_then(as_f64).unwrap_or(0.0).abs()
                + r.get("closeFee").and_then(as_f64).unwrap_or(0.0).abs();
            Some(Fill {
                order_id: str_field(r, "positionId"),
                symbol: symbol.to_string(),
                position_side: r.get("holdSide").and_then(Value::as_str).and_then(Side::from_str),
                entry_price: r.get("openAvgPrice").and_then(as_f64).unwrap_or(0.0),
                exit_price: r.get("closeAvgPrice").and_then(as_f64).unwrap_or(0.0),
                qty: r.get("closeTotalPos").and_then(as_f64).unwrap_or(0.0),
                realized_pnl: r.get("pnl").and_then(as_f64).unwrap_or(0.0),
                fee,
                time: r.get("utime").or_else(|| r.get("ctime")).and_then(millis_to_utc)?,
            })
        })
        .collect()
}

#[async_trait]
impl ProtectedOrderFlow for BitgetAdapter {
    fn venue(&self) -> Venue {
        Venue::Bitget
    }

    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let qty = self.precision.round_qty(request.size);
        if qty <= 0.0 {
            return Err(ExchangeError::rejected("min_qty", format!("size {} rounds to zero", request.size)));
        }
        let order_id = self
            .market_order(request.side, false, qty, Some(&request.client_order_id))
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
        self.place_plan("loss_plan", request.side, qty, stop_loss).await?;

        if let Some(tp) = request.take_profit {
            if let Err(e) = self.place_plan("profit_plan", request.side, qty, tp).await {
                warn!(venue = "bitget", take_profit = tp, error = %e, "Take-profit plan failed, stop is in place");
            }
        }
        Ok(())
    }

    async fn emergency_close(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        let order_id = self.market_order(side, true, size, None).await?;
        Ok(OrderResult::ok(order_id))
    }
}

#[async_trait]
impl ExchangeAdapter for BitgetAdapter {
    fn venue(&self) -> Venue {
        Venue::Bitget
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if let Some(time) = &self.time {
            if let Err(e) = time.sync(true).await {
                warn!(venue = "bitget", error = %e, "Initial time sync failed, using local clock");
            }
        }

        if !self.creds.is_empty() {
            let mut params = self.base_params();
            params.push(("marginCoin", MARGIN_COIN.to_string()));
            let account = self
                .signed(Method::GET, "/api/v2/mix/account/account", &params, None)
                .await?;
            let hedge = account.get("posMode").and_then(Value::as_str) == Some("hedge_mode");
            self.hedge_mode.store(hedge, Ordering::Relaxed);
        }

        info!(
            venue = "bitget",
            symbol = %self.venue_symbol,
            hedge_mode = self.is_hedge_mode(),
            "✅ Connected"
        );
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let data = self
            .signed(
                Method::GET,
                "/api/v2/mix/account/accounts",
                &[("productType", PRODUCT_TYPE.to_string())],
                None,
            )
            .await?;
        data.as_array()
            .and_then(|rows| {
                rows.iter()
                    .find(|r| r.get("marginCoin").and_then(Value::as_str) == Some(MARGIN_COIN))
            })
            .and_then(|r| r.get("available").and_then(as_f64))
            .ok_or_else(|| ExchangeError::data("bitget accounts has no USDT entry"))
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let mut params = self.base_params();
        params.push(("granularity", interval_code(Venue::Bitget, interval).to_string()));
        params.push(("limit", limit.min(1000).to_string()));
        let data = self.public_get("/api/v2/mix/market/candles", &params).await?;
        parse_klines(&data)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let data = self
            .public_get("/api/v2/mix/market/ticker", &self.base_params())
            .await?;
        let ticker = data.get(0).ok_or_else(|| ExchangeError::data("bitget ticker data empty"))?;
        positive_price(ticker, "lastPr")
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let result = place_protected(self, &request).await?;
        let qty = result.filled_qty.unwrap_or(request.size);
        if let Some(price) = result.filled_price {
            self.tracker.open(request.side, qty, price, request.stop_loss);
        }
        info!(venue = "bitget", side = %request.side, qty, price = ?result.filled_price, "📈 Entry filled");
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
        self.cancel_loss_plans().await?;
        let order_id = self.place_plan("loss_plan", side, size, new_sl).await?;
        self.tracker.set_stop(new_sl);
        Ok(OrderResult::ok(order_id))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let positions = self.get_positions().await?;
        if positions.is_empty() {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }

        let mut closed_qty = 0.0;
        for p in &positions {
            let mut payload = json!({"symbol": self.venue_symbol, "productType": PRODUCT_TYPE});
            if self.is_hedge_mode() {
                payload["holdSide"] = json!(hold_side(true, p.side));
            }
            self.signed(Method::POST, "/api/v2/mix/order/close-positions", &[], Some(payload))
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
        let qty = self.precision.round_qty(size);
        let cid = add_client_id(&self.symbol, side);
        let order_id = self.market_order(side, false, qty, Some(&cid)).await?;
        let price = self.get_current_price().await?;
        let merged = self.tracker.apply_add(qty, price);
        info!(
            venue = "bitget",
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
            "symbol": self.venue_symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "leverage": leverage.to_string(),
        });
        self.signed(Method::POST, "/api/v2/mix/account/set-leverage", &[], Some(payload))
            .await?;
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let mut params = self.base_params();
        params.push(("marginCoin", MARGIN_COIN.to_string()));
        let data = self
            .signed(Method::GET, "/api/v2/mix/position/single-position", &params, None)
            .await?;
        Ok(data
            .as_array()
            .map(|rows| rows.iter().filter_map(|r| parse_position_row(&self.symbol, r)).collect())
            .unwrap_or_default())
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        let mut params = self.base_params();
        params.push(("limit", limit.clamp(1, 100).to_string()));
        let data = self
            .signed(Method::GET, "/api/v2/mix/position/history-position", &params, None)
            .await?;
        Ok(parse_history(&self.symbol, &data))
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}
