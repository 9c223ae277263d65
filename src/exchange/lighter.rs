//! Lighter perp DEX adapter
//!
//! Market data and account reads are plain REST. Orders are signed
//! transactions; the signing itself lives behind [`LighterSigner`] so the
//! adapter stays usable for data and dry-run without a key.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tracing::{info, warn};

use super::http::{as_f64, as_i64, VenueHttp};
use super::symbols::{interval_code, lighter_market_id, split_base_quote};
use super::{add_client_id, tracked_for_add, Credentials, ExchangeAdapter, PositionTracker};
use crate::error::ExchangeError;
use crate::types::{
    canonical_symbol, Candle, ExchangePosition, Fill, Interval, OrderRequest, OrderResult, Side,
    TrackedPosition, Venue,
};

const BASE_URL: &str = "https://mainnet.zklighter.elliot.ai";

const BASE_SCALE: Decimal = dec!(10000);
const PRICE_SCALE: Decimal = dec!(100);
const SLIPPAGE: Decimal = dec!(0.01);

/// Market order in Lighter's integer units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LighterMarketOrder {
    pub market_index: u32,
    pub client_order_index: i64,
    /// Base amount ×10000
    pub base_amount: i64,
    /// Worst acceptable average price ×100
    pub avg_execution_price: i64,
    pub is_ask: bool,
    pub reduce_only: bool,
}

/// Signs and submits Lighter transactions. Returns the transaction hash.
#[async_trait]
pub trait LighterSigner: Send + Sync {
    async fn check_client(&self) -> Result<(), ExchangeError>;

    async fn create_market_order(&self, order: LighterMarketOrder) -> Result<String, ExchangeError>;
}

pub struct LighterAdapter {
    symbol: String,
    market_index: u32,
    account_index: Option<i64>,
    http: VenueHttp,
    signer: Option<Arc<dyn LighterSigner>>,
    tracker: PositionTracker,
}

impl LighterAdapter {
    /// `creds.api_key` carries the account index; the API key index is only
    /// used by the signer.
    pub fn from_credentials(
        symbol: &str,
        creds: &Credentials,
        signer: Option<Arc<dyn LighterSigner>>,
    ) -> anyhow::Result<Self> {
        let (base, _) = split_base_quote(Venue::Lighter, symbol);
        let market_index = lighter_market_id(&base)
            .ok_or_else(|| anyhow::anyhow!("Lighter has no market for {base}"))?;
        let account_index = creds.api_key.trim().parse::<i64>().ok();
        Ok(Self {
            symbol: canonical_symbol(symbol),
            market_index,
            account_index,
            http: VenueHttp::new(Venue::Lighter, BASE_URL)?,
            signer,
            tracker: PositionTracker::default(),
        })
    }

    fn signer(&self) -> Result<&Arc<dyn LighterSigner>, ExchangeError> {
        self.signer
            .as_ref()
            .ok_or_else(|| ExchangeError::Auth("no Lighter signer configured".into()))
    }

    async fn account(&self) -> Result<Value, ExchangeError> {
        let index = self
            .account_index
            .ok_or_else(|| ExchangeError::Auth("missing Lighter account index".into()))?;
        let body = self
            .http
            .send(self.http.get(&format!("/api/v1/account?by=index&value={index}")))
            .await?;
        let body = check_response(body)?;
        body.get("accounts")
            .and_then(|a| a.get(0))
            .cloned()
            .ok_or_else(|| ExchangeError::data("lighter account response without accounts"))
    }

    async fn send_market(&self, side: Side, size: f64, reduce_only: bool) -> Result<(String, f64), ExchangeError> {
        let signer = self.signer()?;
        let price = self.get_current_price().await?;
        let is_ask = side == Side::Short;
        let order = LighterMarketOrder {
            market_index: self.market_index,
            client_order_index: chrono::Utc::now().timestamp(),
            base_amount: scale_base(size)?,
            avg_execution_price: scale_price(price, is_ask)?,
            is_ask,
            reduce_only,
        };
        let tx_hash = signer.create_market_order(order).await?;
        Ok((tx_hash, price))
    }
}

/// Base amount in integer units, truncated.
pub fn scale_base(size: f64) -> Result<i64, ExchangeError> {
    Decimal::from_f64(size)
        .map(|d| (d * BASE_SCALE).trunc())
        .and_then(|d| d.to_i64())
        .filter(|v| *v > 0)
        .ok_or_else(|| ExchangeError::data(format!("unscalable lighter size {size}")))
}

/// Slippage-bounded execution price in integer units. Asks accept 1% less,
/// bids pay at most 1% more.
pub fn scale_price(price: f64, is_ask: bool) -> Result<i64, ExchangeError> {
    let factor = if is_ask { Decimal::ONE - SLIPPAGE } else { Decimal::ONE + SLIPPAGE };
    Decimal::from_f64(price)
        .map(|d| (d * factor * PRICE_SCALE).trunc())
        .and_then(|d| d.to_i64())
        .filter(|v| *v > 0)
        .ok_or_else(|| ExchangeError::data(format!("unscalable lighter price {price}")))
}

pub fn check_response(body: Value) -> Result<Value, ExchangeError> {
    match body.get("code").and_then(as_i64) {
        None | Some(200) => Ok(body),
        Some(code) => {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if code == 429 {
                Err(ExchangeError::transient(format!("lighter {code}: {message}")))
            } else {
                Err(ExchangeError::rejected(code, message))
            }
        }
    }
}

/// Candlesticks carry a second or millisecond timestamp depending on endpoint
/// version.
pub fn parse_candlesticks(body: &Value) -> Result<Vec<Candle>, ExchangeError> {
    let rows = body
        .get("candlesticks")
        .or_else(|| body.get("candles"))
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::data("lighter candlesticks missing"))?;
    let mut candles = Vec::with_capacity(rows.len());
    for r in rows {
        let f = |long: &str, short: &str| r.get(long).or_else(|| r.get(short)).and_then(as_f64);
        let ts = r
            .get("timestamp")
            .or_else(|| r.get("t"))
            .and_then(as_i64)
            .map(|t| if t < 100_000_000_000 { t * 1000 } else { t });
        let candle = match (ts, f("open", "o"), f("high", "h"), f("low", "l"), f("close", "c")) {
            (Some(ts), Some(o), Some(h), Some(l), Some(c)) => {
                Candle::from_millis(ts, o, h, l, c, f("volume", "v").unwrap_or(0.0))
            }
            _ => None,
        }
        .ok_or_else(|| ExchangeError::data(format!("malformed lighter candle: {r}")))?;
        candle.validate()?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

/// Open position for one market from an account payload. `sign` is 1 for long
/// and -1 for short.
pub fn parse_position(account: &Value, market_index: u32, symbol: &str) -> Option<ExchangePosition> {
    let row = account
        .get("positions")?
        .as_array()?
        .iter()
        .find(|p| p.get("market_id").and_then(as_i64) == Some(i64::from(market_index)))?;
    let size = row.get("position").and_then(as_f64)?.abs();
    if size <= 0.0 {
        return None;
    }
    let side = if row.get("sign").and_then(as_i64) == Some(-1) { Side::Short } else { Side::Long };
    Some(ExchangePosition {
        symbol: symbol.to_string(),
        side,
        size,
        entry_price: row.get("avg_entry_price").and_then(as_f64).unwrap_or(0.0),
        unrealized_pnl: row.get("unrealized_pnl").and_then(as_f64).unwrap_or(0.0),
        leverage: None,
        stop_loss: None,
    })
}

#[async_trait]
impl ExchangeAdapter for LighterAdapter {
    fn venue(&self) -> Venue {
        Venue::Lighter
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        match &self.signer {
            Some(signer) => signer.check_client().await?,
            None => warn!(venue = "lighter", "No signer configured, order operations will fail"),
        }
        info!(venue = "lighter", symbol = %self.symbol, market = self.market_index, "✅ Connected");
        Ok(())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let account = self.account().await?;
        account
            .get("collateral")
            .or_else(|| account.get("available_balance"))
            .and_then(as_f64)
            .ok_or_else(|| ExchangeError::data("lighter account without collateral"))
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let end = chrono::Utc::now().timestamp();
        let start = end - interval.minutes() * 60 * limit as i64;
        let path = format!(
            "/api/v1/candlesticks?market_id={}&resolution={}&start_timestamp={start}&end_timestamp={end}&count_back={limit}&set_timestamp_to_end=true",
            self.market_index,
            interval_code(Venue::Lighter, interval),
        );
        let body = check_response(self.http.send(self.http.get(&path)).await?)?;
        parse_candlesticks(&body)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let candles = self.get_klines(Interval::Min1, 1).await?;
        let close = candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| ExchangeError::data("lighter returned no 1m candle"))?;
        if !close.is_finite() || close <= 0.0 {
            return Err(ExchangeError::data(format!("lighter price {close}")));
        }
        Ok(close)
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let (tx_hash, price) = self.send_market(request.side, request.size, false).await?;
        self.tracker.open(request.side, request.size, price, request.stop_loss);
        info!(
            venue = "lighter",
            side = %request.side,
            size = request.size,
            price,
            tx = %tx_hash,
            "📈 Entry submitted, stop tracked locally"
        );
        Ok(OrderResult::filled(Some(tx_hash), price, request.size).with_client_id(request.client_order_id))
    }

    async fn update_stop_loss(&self, new_sl: f64) -> Result<OrderResult, ExchangeError> {
        if self.tracker.get().is_none() {
            return Err(ExchangeError::rejected("no_position", "no tracked lighter position"));
        }
        self.tracker.set_stop(new_sl);
        info!(venue = "lighter", stop_loss = new_sl, "Local stop updated");
        Ok(OrderResult::ok(None))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let position = match self.tracker.get() {
            Some(p) => Some((p.side, p.size)),
            None => self
                .get_positions()
                .await?
                .into_iter()
                .next()
                .map(|p| (p.side, p.size)),
        };
        let Some((side, size)) = position else {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        };
        let (tx_hash, price) = self.send_market(side.opposite(), size, true).await?;
        self.tracker.clear();
        info!(venue = "lighter", side = %side, size, price, tx = %tx_hash, "📉 Position closed");
        Ok(OrderResult::filled(Some(tx_hash), price, size))
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        tracked_for_add(self, &self.tracker, side).await?;
        let cid = add_client_id(&self.symbol, side);
        let (tx_hash, price) = self.send_market(side, size, false).await?;
        let merged = self.tracker.apply_add(size, price);
        info!(venue = "lighter", size, avg_entry = ?merged.map(|p| p.entry_price), "➕ Position added");
        Ok(OrderResult::filled(Some(tx_hash), price, size).with_client_id(cid))
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        info!(venue = "lighter", leverage, "Leverage follows account margin settings");
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let account = self.account().await?;
        let stop = self.tracker.get().and_then(|p| p.stop_loss);
        Ok(parse_position(&account, self.market_index, &self.symbol)
            .map(|mut p| {
                p.stop_loss = stop;
                p
            })
            .into_iter()
            .collect())
    }

    async fn get_trade_history(&self, _limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        Err(ExchangeError::NotSupported("lighter trade history is read from the local file".into()))
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSigner {
        orders: Mutex<Vec<LighterMarketOrder>>,
    }

    #[async_trait]
    impl LighterSigner for RecordingSigner {
        async fn check_client(&self) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn create_market_order(&self, order: LighterMarketOrder) -> Result<String, ExchangeError> {
            self.orders.lock().unwrap().push(order);
            Ok("0xabc".into())
        }
    }

    #[test]
    fn integer_scaling_with_slippage() {
        assert_eq!(scale_base(0.1234).unwrap(), 1234);
        assert_eq!(scale_base(0.00019).unwrap(), 1);
        assert!(scale_base(0.00001).is_err());
        assert_eq!(scale_price(2000.0, false).unwrap(), 202000);
        assert_eq!(scale_price(2000.0, true).unwrap(), 198000);
    }

    #[test]
    fn candles_accept_seconds_or_millis() {
        let body = json!({"candlesticks": [
            {"timestamp": 1700000060, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 3.0},
            {"timestamp": 1700000000000i64, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.2, "volume": 3.0}
        ]});
        let candles = parse_candlesticks(&body).unwrap();
        assert_eq!(candles[0].close, 1.2);
        assert_eq!(candles[1].timestamp.timestamp(), 1700000060);
    }

    #[test]
    fn position_sign_sets_side() {
        let account = json!({"positions": [
            {"market_id": 1, "sign": -1, "position": "0.5", "avg_entry_price": "60000", "unrealized_pnl": "-3"},
            {"market_id": 0, "sign": 1, "position": "0", "avg_entry_price": "0"}
        ]});
        let p = parse_position(&account, 1, "BTCUSDT").unwrap();
        assert_eq!(p.side, Side::Short);
        assert_eq!(p.size, 0.5);
        assert!(parse_position(&account, 0, "ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn orders_without_signer_are_auth_errors() {
        let adapter = LighterAdapter::from_credentials("ETHUSDT", &Credentials::default(), None).unwrap();
        let err = adapter
            .place_market_order(OrderRequest::market(Side::Long, 0.1, "cid"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[test]
    fn unknown_market_is_a_construction_error() {
        let signer: Arc<dyn LighterSigner> = Arc::new(RecordingSigner::default());
        assert!(LighterAdapter::from_credentials("DOGEUSDT", &Credentials::default(), Some(signer)).is_err());
    }

    #[tokio::test]
    async fn local_stop_requires_tracked_position() {
        let adapter = LighterAdapter::from_credentials("BTCUSDT", &Credentials::default(), None).unwrap();
        assert!(adapter.update_stop_loss(100.0).await.is_err());
        adapter.tracker.open(Side::Long, 0.1, 60000.0, Some(59000.0));
        adapter.update_stop_loss(59500.0).await.unwrap();
        assert_eq!(adapter.tracked_position().unwrap().stop_loss, Some(59500.0));
    }
}
