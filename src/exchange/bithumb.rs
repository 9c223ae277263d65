//! Bithumb KRW spot adapter
//!
//! Long-only like Upbit. Private calls are form-encoded POSTs signed with
//! HMAC-SHA512 over `endpoint \0 params \0 nonce`.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::http::{as_f64, positive_price, str_field, VenueHttp};
use super::signing::{hmac_sha512_hex_base64, query_string};
use super::symbols::{interval_code, split_base_quote, venue_symbol, Precision};
use super::{add_client_id, tracked_for_add, Credentials, ExchangeAdapter, PositionTracker};
use crate::error::ExchangeError;
use crate::types::{
    canonical_symbol, Candle, ExchangePosition, Fill, Interval, OrderRequest, OrderResult, Side,
    TrackedPosition, Venue,
};

const BASE_URL: &str = "https://api.bithumb.com";
const STATUS_OK: &str = "0000";
pub const MIN_ORDER_KRW: f64 = 5000.0;

const AUTH_STATUSES: [&str; 4] = ["5100", "5200", "5300", "5302"];
const TRANSIENT_STATUSES: [&str; 2] = ["5400", "5900"];

pub struct BithumbAdapter {
    symbol: String,
    pair: String,
    coin: String,
    creds: Credentials,
    http: VenueHttp,
    precision: Precision,
    tracker: PositionTracker,
}

impl BithumbAdapter {
    pub fn new(symbol: &str, creds: Credentials) -> anyhow::Result<Self> {
        let (coin, _) = split_base_quote(Venue::Bithumb, symbol);
        Ok(Self {
            symbol: canonical_symbol(symbol),
            pair: venue_symbol(Venue::Bithumb, symbol),
            coin,
            creds,
            http: VenueHttp::new(Venue::Bithumb, BASE_URL)?,
            precision: Precision::for_venue(Venue::Bithumb),
            tracker: PositionTracker::default(),
        })
    }

    async fn public_get(&self, path: &str) -> Result<Value, ExchangeError> {
        check_response(self.http.send(self.http.get(path)).await?)
    }

    async fn private_post(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        if self.creds.is_empty() {
            return Err(ExchangeError::Auth("missing Bithumb credentials".into()));
        }
        let mut all: Vec<(&str, String)> = vec![("endpoint", endpoint.to_string())];
        all.extend(params.iter().cloned());
        let encoded = query_string(&all);
        let nonce = chrono::Utc::now().timestamp_millis().to_string();
        let sign = sign_request(&self.creds.api_secret, endpoint, &encoded, &nonce)?;

        let request = self
            .http
            .post(endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Api-Key", &self.creds.api_key)
            .header("Api-Sign", sign)
            .header("Api-Nonce", nonce)
            .body(encoded);
        check_response(self.http.send(request).await?)
    }

    async fn balances(&self) -> Result<Value, ExchangeError> {
        let body = self
            .private_post("/info/balance", &[("currency", "ALL".to_string())])
            .await?;
        body.get("data")
            .cloned()
            .ok_or_else(|| ExchangeError::data("bithumb balance without data"))
    }

    async fn market_order(&self, buy: bool, units: f64) -> Result<Option<String>, ExchangeError> {
        let endpoint = if buy { "/trade/market_buy" } else { "/trade/market_sell" };
        let params = [
            ("units", self.precision.format_qty(units)),
            ("order_currency", self.coin.clone()),
            ("payment_currency", "KRW".to_string()),
        ];
        let body = self.private_post(endpoint, &params).await?;
        Ok(str_field(&body, "order_id"))
    }

    async fn buy(&self, size: f64) -> Result<(Option<String>, f64, f64), ExchangeError> {
        let price = self.get_current_price().await?;
        let units = self.precision.round_qty(size);
        if units * price < MIN_ORDER_KRW {
            return Err(ExchangeError::rejected(
                "min_order",
                format!("order value {:.0} KRW below {MIN_ORDER_KRW} KRW", units * price),
            ));
        }
        let order_id = self.market_order(true, units).await?;
        Ok((order_id, price, units))
    }
}

/// Api-Sign: base64 of the hex HMAC-SHA512 over `endpoint\0params\0nonce`.
pub fn sign_request(secret: &str, endpoint: &str, encoded: &str, nonce: &str) -> Result<String, ExchangeError> {
    hmac_sha512_hex_base64(secret, &format!("{endpoint}\0{encoded}\0{nonce}"))
}

pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    let status = str_field(&body, "status").unwrap_or_default();
    if status == STATUS_OK {
        return Ok(body);
    }
    let message = str_field(&body, "message").unwrap_or_default();
    if AUTH_STATUSES.contains(&status.as_str()) {
        Err(ExchangeError::Auth(format!("bithumb {status}: {message}")))
    } else if TRANSIENT_STATUSES.contains(&status.as_str()) {
        Err(ExchangeError::transient(format!("bithumb {status}: {message}")))
    } else {
        Err(ExchangeError::rejected(status, message))
    }
}

/// Candlestick rows are `[ts, open, close, high, low, volume]`.
pub fn parse_candlesticks(body: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::data("bithumb candlestick without data array"))?;
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let col = |i: usize| row.get(i).and_then(as_f64);
        let candle = match (col(0), col(1), col(2), col(3), col(4), col(5)) {
            (Some(ts), Some(o), Some(c), Some(h), Some(l), Some(v)) => {
                Candle::from_millis(ts as i64, o, h, l, c, v)
            }
            _ => None,
        }
        .ok_or_else(|| ExchangeError::data(format!("malformed bithumb candle row: {row}")))?;
        candle.validate()?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

/// `available_{currency}` from `/info/balance`.
pub fn available(data: &Value, currency: &str) -> f64 {
    data.get(format!("available_{}", currency.to_lowercase()))
        .and_then(as_f64)
        .unwrap_or(0.0)
}

/// `(total, avg_buy_price)` of a coin, when Bithumb reports one.
pub fn coin_holding(data: &Value, coin: &str) -> (f64, f64) {
    let coin = coin.to_lowercase();
    let total = data
        .get(format!("total_{coin}"))
        .and_then(as_f64)
        .unwrap_or_else(|| available(data, &coin));
    let avg = data
        .get(format!("average_buy_price_{coin}"))
        .and_then(as_f64)
        .unwrap_or(0.0);
    (total, avg)
}

#[async_trait]
impl ExchangeAdapter for BithumbAdapter {
    fn venue(&self) -> Venue {
        Venue::Bithumb
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if !self.creds.is_empty() {
            self.balances().await?;
        }
        info!(venue = "bithumb", pair = %self.pair, "✅ Connected (spot, local clock)");
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        Ok(available(&self.balances().await?, "KRW"))
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let path = format!(
            "/public/candlestick/{}/{}",
            self.pair,
            interval_code(Venue::Bithumb, interval)
        );
        let mut candles = parse_candlesticks(&self.public_get(&path).await?)?;
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let body = self.public_get(&format!("/public/ticker/{}", self.pair)).await?;
        let data = body
            .get("data")
            .ok_or_else(|| ExchangeError::data("bithumb ticker without data"))?;
        positive_price(data, "closing_price")
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        if request.side == Side::Short {
            return Err(ExchangeError::NotSupported("bithumb spot cannot open short positions".into()));
        }
        let (order_id, price, units) = self.buy(request.size).await?;
        self.tracker.open(Side::Long, units, price, request.stop_loss);
        info!(
            venue = "bithumb",
            qty = units,
            price,
            local_stop = ?request.stop_loss,
            "📈 Spot buy filled, stop tracked locally"
        );
        Ok(OrderResult::filled(order_id, price, units).with_client_id(request.client_order_id))
    }

    async fn update_stop_loss(&self, new_sl: f64) -> Result<OrderResult, ExchangeError> {
        self.tracker.set_stop(new_sl);
        info!(venue = "bithumb", stop_loss = new_sl, "Local stop updated");
        Ok(OrderResult::ok(None))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let free = available(&self.balances().await?, &self.coin);
        let price = match self.get_current_price().await {
            Ok(p) => p,
            Err(e) => {
                warn!(venue = "bithumb", error = %e, "Ticker failed before close");
                return Err(e);
            }
        };
        if free * price < MIN_ORDER_KRW {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }
        let units = self.precision.round_qty(free);
        let order_id = self.market_order(false, units).await?;
        self.tracker.clear();
        info!(venue = "bithumb", qty = units, price, "📉 Sold entire coin balance");
        Ok(OrderResult::filled(order_id, price, units))
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        if side == Side::Short {
            return Err(ExchangeError::NotSupported("bithumb spot cannot add to shorts".into()));
        }
        tracked_for_add(self, &self.tracker, side).await?;
        let cid = add_client_id(&self.symbol, side);
        let (order_id, price, units) = self.buy(size).await?;
        let merged = self.tracker.apply_add(units, price);
        info!(venue = "bithumb", size = units, avg_entry = ?merged.map(|p| p.entry_price), "➕ Spot position added");
        Ok(OrderResult::filled(order_id, price, units).with_client_id(cid))
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        info!(venue = "bithumb", leverage, "Leverage not applicable on spot");
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let data = self.balances().await?;
        let (size, mut avg) = coin_holding(&data, &self.coin);
        if size <= 0.0 {
            return Ok(Vec::new());
        }
        if avg <= 0.0 {
            avg = match self.tracker.get() {
                Some(p) => p.entry_price,
                None => self.get_current_price().await?,
            };
        }
        if size * avg < MIN_ORDER_KRW {
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
        Err(ExchangeError::NotSupported("bithumb reports no realized PnL".into()))
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
    fn status_codes_classify() {
        assert!(check_response(json!({"status": "0000", "data": {}})).is_ok());
        assert!(matches!(
            check_response(json!({"status": "5300", "message": "Invalid Apikey"})),
            Err(ExchangeError::Auth(_))
        ));
        assert!(matches!(
            check_response(json!({"status": "5600", "message": "min"})),
            Err(ExchangeError::Rejected { code, .. }) if code == "5600"
        ));
    }

    #[test]
    fn candlestick_columns_are_open_close_high_low() {
        let body = json!({"status": "0000", "data": [
            [1700000900000i64, "101", "103", "104", "100", "2.5"],
            [1700000000000i64, "100", "101", "102", "99", "1.0"]
        ]});
        let candles = parse_candlesticks(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[1].close, 103.0);
        assert_eq!(candles[1].high, 104.0);
        assert_eq!(candles[1].low, 100.0);
    }

    #[test]
    fn balances_read_available_and_average() {
        let data = json!({
            "available_krw": "150000",
            "total_btc": "0.002",
            "available_btc": "0.0015",
            "average_buy_price_btc": "90000000"
        });
        assert_eq!(available(&data, "KRW"), 150000.0);
        assert_eq!(coin_holding(&data, "BTC"), (0.002, 90_000_000.0));
        assert_eq!(coin_holding(&data, "ETH"), (0.0, 0.0));
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign_request("secret", "/info/balance", "endpoint=%2Finfo%2Fbalance", "1").unwrap();
        let b = sign_request("secret", "/info/balance", "endpoint=%2Finfo%2Fbalance", "1").unwrap();
        let c = sign_request("secret", "/info/balance", "endpoint=%2Finfo%2Fbalance", "2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
