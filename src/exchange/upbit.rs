//! Upbit KRW spot adapter
//!
//! Long-only. Stops are tracked locally and never sent; leverage is not
//! applicable. Auth is an HS256 JWT carrying a SHA512 `query_hash` of the
//! request parameters.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::http::{as_f64, positive_price, str_field, VenueHttp};
use super::signing::{jwt_hs256, query_string, sha512_hex};
use super::symbols::{interval_code, split_base_quote, venue_symbol, Precision};
use super::{add_client_id, tracked_for_add, Credentials, ExchangeAdapter, PositionTracker};
use crate::error::ExchangeError;
use crate::types::{
    canonical_symbol, Candle, ExchangePosition, Fill, Interval, OrderRequest, OrderResult, Side,
    TrackedPosition, Venue,
};

const BASE_URL: &str = "https://api.upbit.com";
/// Smallest order Upbit accepts, in KRW
pub const MIN_ORDER_KRW: f64 = 5000.0;

const AUTH_ERRORS: [&str; 6] = [
    "invalid_query_payload",
    "jwt_verification",
    "expired_access_key",
    "invalid_access_key",
    "no_authorization_i_p",
    "out_of_scope",
];

pub struct UpbitAdapter {
    symbol: String,
    market: String,
    coin: String,
    creds: Credentials,
    http: VenueHttp,
    precision: Precision,
    tracker: PositionTracker,
}

impl UpbitAdapter {
    pub fn new(symbol: &str, creds: Credentials) -> anyhow::Result<Self> {
        let (coin, _) = split_base_quote(Venue::Upbit, symbol);
        Ok(Self {
            symbol: canonical_symbol(symbol),
            market: venue_symbol(Venue::Upbit, symbol),
            coin,
            creds,
            http: VenueHttp::new(Venue::Upbit, BASE_URL)?,
            precision: Precision::for_venue(Venue::Upbit),
            tracker: PositionTracker::default(),
        })
    }

    fn auth_header(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing Upbit credentials".into()));
        }
        let mut claims = json!({
            "access_key": self.creds.api_key,
            "nonce": uuid::Uuid::new_v4().to_string(),
        });
        if !params.is_empty() {
            claims["query_hash"] = json!(sha512_hex(&query_string(params)));
            claims["query_hash_alg"] = json!("SHA512");
        }
        Ok(format!("Bearer {}", jwt_hs256(&claims, &self.creds.api_secret)?))
    }

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let body = self
            .http
            .send(self.http.get(&format!("{path}?{}", query_string(params))))
            .await?;
        check_response(body)
    }

    async fn signed_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let auth = self.auth_header(params)?;
        let url = if params.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", query_string(params))
        };
        let body = self.http.send(self.http.get(&url).header("Authorization", auth)).await?;
        check_response(body)
    }

    async fn signed_post(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let auth = self.auth_header(params)?;
        let payload: serde_json::Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
            .collect();
        let request = self
            .http
            .post(path)
            .header("Authorization", auth)
            .body(Value::Object(payload).to_string());
        check_response(self.http.send(request).await?)
    }

    async fn accounts(&self) -> Result<Vec<Value>, ExchangeError> {
        let body = self.signed_get("/v1/accounts", &[]).await?;
        body.as_array()
            .cloned()
            .ok_or_else(|| ExchangeError::data("upbit accounts response is not an array"))
    }

    async fn coin_balance(&self) -> Result<(f64, f64), ExchangeError> {
        let accounts = self.accounts().await?;
        Ok(currency_balance(&accounts, &self.coin)
            .map(|(free, _, avg)| (free, avg))
            .unwrap_or((0.0, 0.0)))
    }

    /// Average fill of an order from its trades, when Upbit has settled it.
    async fn order_fill(&self, uuid: &str) -> Option<(f64, f64)> {
        match self.signed_get("/v1/order", &[("uuid", uuid.to_string())]).await {
            Ok(order) => parse_order_fill(&order),
            Err(e) => {
                warn!(venue = "upbit", order = uuid, error = %e, "Order lookup failed, using estimate");
                None
            }
        }
    }

    async fn market_buy(&self, krw: f64, identifier: &str) -> Result<Option<String>, ExchangeError> {
        let params = [
            ("market", self.market.clone()),
            ("side", "bid".to_string()),
            ("ord_type", "price".to_string()),
            ("price", format!("{:.0}", krw.floor())),
            ("identifier", identifier.to_string()),
        ];
        let body = self.signed_post("/v1/orders", &params).await?;
        Ok(str_field(&body, "uuid"))
    }

    async fn market_sell(&self, volume: f64) -> Result<Option<String>, ExchangeError> {
        let params = [
            ("market", self.market.clone()),
            ("side", "ask".to_string()),
            ("ord_type", "market".to_string()),
            ("volume", self.precision.format_qty(volume)),
        ];
        let body = self.signed_post("/v1/orders", &params).await?;
        Ok(str_field(&body, "uuid"))
    }

    async fn buy(&self, size: f64, identifier: &str) -> Result<OrderResult, ExchangeError> {
        let price = self.get_current_price().await?;
        let krw = size * price;
        if krw < MIN_ORDER_KRW {
            return Err(ExchangeError::rejected(
                "under_min_total_bid",
                format!("order value {krw:.0} KRW below {MIN_ORDER_KRW} KRW"),
            ));
        }
        let order_id = self.market_buy(krw, identifier).await?;
        let (filled_price, filled_qty) = match &order_id {
            Some(uuid) => self.order_fill(uuid).await.unwrap_or((price, size)),
            None => (price, size),
        };
        Ok(OrderResult::filled(order_id, filled_price, filled_qty).with_client_id(identifier))
    }
}

pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    let Some(err) = body.get("error") else {
        return Ok(body);
    };
    let name = str_field(err, "name").unwrap_or_else(|| "unknown".to_string());
    let message = str_field(err, "message").unwrap_or_default();
    if AUTH_ERRORS.contains(&name.as_str()) {
        Err(ExchangeError::Auth(format!("upbit {name}: {message}")))
    } else if name == "too_many_requests" || name == "nonce_used" {
        Err(ExchangeError::transient(format!("upbit {name}: {message}")))
    } else {
        Err(ExchangeError::rejected(name, message))
    }
}

/// `(free, locked, avg_buy_price)` of one currency in `/v1/accounts`.
pub fn currency_balance(accounts: &[Value], currency: &str) -> Option<(f64, f64, f64)> {
    let row = accounts
        .iter()
        .find(|a| a.get("currency").and_then(Value::as_str) == Some(currency))?;
    Some((
        row.get("balance").and_then(as_f64).unwrap_or(0.0),
        row.get("locked").and_then(as_f64).unwrap_or(0.0),
        row.get("avg_buy_price").and_then(as_f64).unwrap_or(0.0),
    ))
}

/// Volume-weighted price and total volume over an order's trades.
pub fn parse_order_fill(order: &Value) -> Option<(f64, f64)> {
    let trades = order.get("trades").and_then(Value::as_array)?;
    let (funds, volume) = trades.iter().fold((0.0, 0.0), |(f, v), t| {
        (
            f + t.get("funds").and_then(as_f64).unwrap_or(0.0),
            v + t.get("volume").and_then(as_f64).unwrap_or(0.0),
        )
    });
    (volume > 0.0).then(|| (funds / volume, volume))
}

/// Candles are newest first and stamped with `candle_date_time_utc`.
pub fn parse_candles(body: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = body
        .as_array()
        .ok_or_else(|| ExchangeError::data("upbit candles response is not an array"))?;
    let mut candles = Vec::with_capacity(rows.len());
    for r in rows.iter().rev() {
        let ts = r
            .get("candle_date_time_utc")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok())
            .map(|naive| Utc.from_utc_datetime(&naive))
            .ok_or_else(|| ExchangeError::data(format!("upbit candle without utc time: {r}")))?;
        let f = |k: &str| {
            r.get(k)
                .and_then(as_f64)
                .ok_or_else(|| ExchangeError::data(format!("upbit candle missing {k}")))
        };
        let candle = Candle {
            timestamp: ts,
            open: f("opening_price")?,
            high: f("high_price")?,
            low: f("low_price")?,
            close: f("trade_price")?,
            volume: f("candle_acc_trade_volume")?,
            confirmed: None,
        };
        candle.validate()?;
        candles.push(candle);
    }
    Ok(candles)
}

#[async_trait]
impl ExchangeAdapter for UpbitAdapter {
    fn venue(&self) -> Venue {
        Venue::Upbit
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if !self.creds.is_empty() {
            self.accounts().await?;
        }
        info!(venue = "upbit", market = %self.market, "✅ Connected (spot, local clock)");
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let accounts = self.accounts().await?;
        Ok(currency_balance(&accounts, "KRW").map(|(free, _, _)| free).unwrap_or(0.0))
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let path = format!("/v1/candles/{}", interval_code(Venue::Upbit, interval));
        let body = self
            .public_get(
                &path,
                &[("market", self.market.clone()), ("count", limit.clamp(1, 200).to_string())],
            )
            .await?;
        parse_candles(&body)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let body = self
            .public_get("/v1/ticker", &[("markets", self.market.clone())])
            .await?;
        let ticker = body.get(0).ok_or_else(|| ExchangeError::data("upbit ticker empty"))?;
        positive_price(ticker, "trade_price")
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        if request.side == Side::Short {
            return Err(ExchangeError::NotSupported("upbit spot cannot open short positions".into()));
        }
        let result = self.buy(request.size, &request.client_order_id).await?;
        let price = result.filled_price.unwrap_or(0.0);
        let qty = result.filled_qty.unwrap_or(request.size);
        self.tracker.open(Side::Long, qty, price, request.stop_loss);
        info!(
            venue = "upbit",
            qty,
            price,
            local_stop = ?request.stop_loss,
            "📈 Spot buy filled, stop tracked locally"
        );
        Ok(result)
    }

    async fn update_stop_loss(&self, new_sl: f64) -> Result<OrderResult, ExchangeError> {
        self.tracker.set_stop(new_sl);
        info!(venue = "upbit", stop_loss = new_sl, "Local stop updated");
        Ok(OrderResult::ok(None))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let (free, _) = self.coin_balance().await?;
        let price = self.get_current_price().await?;
        if free * price < MIN_ORDER_KRW {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }
        let order_id = self.market_sell(free).await?;
        let (filled_price, filled_qty) = match &order_id {
            Some(uuid) => self.order_fill(uuid).await.unwrap_or((price, free)),
            None => (price, free),
        };
        self.tracker.clear();
        info!(venue = "upbit", qty = filled_qty, price = filled_price, "📉 Sold entire coin balance");
        Ok(OrderResult::filled(order_id, filled_price, filled_qty))
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        if side == Side::Short {
            return Err(ExchangeError::NotSupported("upbit spot cannot add to shorts".into()));
        }
        tracked_for_add(self, &self.tracker, side).await?;
        let cid = add_client_id(&self.symbol, side);
        let result = self.buy(size, &cid).await?;
        let merged = self.tracker.apply_add(
            result.filled_qty.unwrap_or(size),
            result.filled_price.unwrap_or(0.0),
        );
        info!(venue = "upbit", size, avg_entry = ?merged.map(|p| p.entry_price), "➕ Spot position added");
        Ok(result)
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        info!(venue = "upbit", leverage, "Leverage not applicable on spot");
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let accounts = self.accounts().await?;
        let Some((free, locked, avg)) = currency_balance(&accounts, &self.coin) else {
            return Ok(Vec::new());
        };
        let size = free + locked;
        // dust below the minimum order value cannot be sold and is not a position
        if size <= 0.0 || size * avg < MIN_ORDER_KRW {
            return Ok(Vec::new());
        }
        Ok(vec![ExchangePosition {
            symbol: self.symbol.clone(),
            side: Side::Long,
            size,
            entry_price: avg,
            unrealized_pnl: 0.0,
            leverage: None,
            stop_loss: self.tracker.get().and_then(|p| p.stop_loss),
        }])
    }

    async fn get_trade_history(&self, _limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        Err(ExchangeError::NotSupported("upbit reports no realized PnL".into()))
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}
