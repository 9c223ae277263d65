//! CCXT-style fallback adapter
//!
//! Any venue reachable through a unified client (ccxt bridge, REST gateway)
//! can be traded via [`GenericAdapter`]. The client speaks unified symbols
//! (`BTC/USDT:USDT`, `BTC/KRW`) and lower-case order sides.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::symbols::{split_base_quote, unified_symbol};
use super::{
    add_client_id, place_protected, tracked_for_add, ExchangeAdapter, PositionTracker, ProtectedOrderFlow,
};
use crate::error::ExchangeError;
use crate::types::{
    canonical_symbol, Candle, ExchangePosition, Fill, Interval, OrderRequest, OrderResult, Side,
    TrackedPosition, Venue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Swap,
    Spot,
}

/// Venue reachable through the unified client
#[derive(Debug, Clone, PartialEq)]
pub struct SupportedExchange {
    pub id: &'static str,
    pub market: MarketType,
    pub symbols: &'static [&'static str],
}

pub const SUPPORTED_EXCHANGES: [SupportedExchange; 8] = [
    SupportedExchange {
        id: "bybit",
        market: MarketType::Swap,
        symbols: &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT", "LINKUSDT", "DOTUSDT", "MATICUSDT"],
    },
    SupportedExchange {
        id: "binance",
        market: MarketType::Swap,
        symbols: &["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT", "LINKUSDT", "DOTUSDT"],
    },
    SupportedExchange {
        id: "okx",
        market: MarketType::Swap,
        symbols: &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT", "LINKUSDT", "DOTUSDT", "LTCUSDT"],
    },
    SupportedExchange {
        id: "bitget",
        market: MarketType::Swap,
        symbols: &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT", "LINKUSDT", "DOTUSDT", "ARBUSDT"],
    },
    SupportedExchange {
        id: "bingx",
        market: MarketType::Swap,
        symbols: &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT", "LINKUSDT", "ARBUSDT", "OPUSDT"],
    },
    SupportedExchange {
        id: "gate",
        market: MarketType::Swap,
        symbols: &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT", "LINKUSDT", "DOTUSDT", "ATOMUSDT"],
    },
    SupportedExchange {
        id: "upbit",
        market: MarketType::Spot,
        symbols: &["KRW-BTC", "KRW-ETH", "KRW-XRP", "KRW-SOL", "KRW-DOGE", "KRW-ADA", "KRW-AVAX", "KRW-LINK", "KRW-DOT", "KRW-MATIC"],
    },
    SupportedExchange {
        id: "bithumb",
        market: MarketType::Spot,
        symbols: &["BTC-KRW", "ETH-KRW", "XRP-KRW", "SOL-KRW", "DOGE-KRW", "ADA-KRW", "AVAX-KRW", "LINK-KRW", "DOT-KRW", "MATIC-KRW"],
    },
];

pub fn supported_exchange(id: &str) -> Option<&'static SupportedExchange> {
    let id = id.trim().to_lowercase();
    SUPPORTED_EXCHANGES.iter().find(|e| e.id == id)
}

/// Symbols offered for an exchange id; unknown ids fall back to BTC and ETH.
pub fn symbols_for_exchange(id: &str) -> Vec<&'static str> {
    supported_exchange(id)
        .map(|e| e.symbols.to_vec())
        .unwrap_or_else(|| vec!["BTCUSDT", "ETHUSDT"])
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedOrder {
    pub id: Option<String>,
    pub average: Option<f64>,
    pub filled: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedPosition {
    pub symbol: String,
    /// "long" or "short"
    pub side: String,
    pub contracts: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub leverage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTrade {
    pub order: Option<String>,
    pub symbol: String,
    /// "buy" or "sell"
    pub side: String,
    pub amount: f64,
    pub price: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

/// Free balance per currency
pub type UnifiedBalance = HashMap<String, f64>;

/// Minimal ccxt-shaped client surface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UnifiedClient: Send + Sync {
    /// Rows are `[ts_ms, open, high, low, close, volume]`, oldest first.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<[f64; 6]>, ExchangeError>;

    /// Last traded price
    async fn fetch_ticker(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn create_order(
        &self,
        symbol: &str,
        order_type: &str,
        side: &str,
        amount: f64,
        params: Value,
    ) -> Result<UnifiedOrder, ExchangeError>;

    async fn fetch_balance(&self) -> Result<UnifiedBalance, ExchangeError>;

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<UnifiedPosition>, ExchangeError>;

    async fn set_leverage(&self, leverage: u32, symbol: &str) -> Result<(), ExchangeError>;

    async fn fetch_my_trades(&self, symbol: &str, limit: usize) -> Result<Vec<UnifiedTrade>, ExchangeError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;
}

pub struct GenericAdapter {
    exchange_id: String,
    symbol: String,
    unified: String,
    market: MarketType,
    client: Arc<dyn UnifiedClient>,
    tracker: PositionTracker,
}

impl GenericAdapter {
    /// Unknown exchange ids are treated as swap markets.
    pub fn new(exchange_id: &str, symbol: &str, client: Arc<dyn UnifiedClient>) -> Self {
        let market = supported_exchange(exchange_id)
            .map(|e| e.market)
            .unwrap_or(MarketType::Swap);
        Self {
            exchange_id: exchange_id.trim().to_lowercase(),
            symbol: canonical_symbol(symbol),
            unified: to_unified_symbol(symbol, market),
            market,
            client,
            tracker: PositionTracker::default(),
        }
    }

    pub fn unified_symbol(&self) -> &str {
        &self.unified
    }

    async fn market_order(&self, side: &str, amount: f64, reduce_only: bool) -> Result<UnifiedOrder, ExchangeError> {
        let params = if reduce_only && self.market == MarketType::Swap {
            json!({"reduceOnly": true})
        } else {
            json!({})
        };
        self.client
            .create_order(&self.unified, "market", side, amount, params)
            .await
    }

    async fn stop_market(&self, side: Side, amount: f64, stop_price: f64) -> Result<UnifiedOrder, ExchangeError> {
        self.client
            .create_order(
                &self.unified,
                "stop_market",
                &side.close_order_side().to_lowercase(),
                amount,
                json!({"stopPrice": stop_price, "reduceOnly": true}),
            )
            .await
    }

    async fn last_price(&self) -> Option<f64> {
        match self.get_current_price().await {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(exchange = %self.exchange_id, error = %e, "Ticker failed after fill");
                None
            }
        }
    }
}

/// `BTCUSDT` to `BTC/USDT:USDT` (swap) or `BTC/USDT` (spot).
pub fn to_unified_symbol(symbol: &str, market: MarketType) -> String {
    let (base, quote) = split_base_quote(Venue::Generic, symbol);
    unified_symbol(&base, &quote, market == MarketType::Spot)
}

pub fn parse_ohlcv(rows: &[[f64; 6]]) -> Result<Vec<Candle>, ExchangeError> {
    let mut candles = Vec::with_capacity(rows.len());
    for [ts, o, h, l, c, v] in rows.iter().copied() {
        let candle = Candle::from_millis(ts as i64, o, h, l, c, v)
            .ok_or_else(|| ExchangeError::data(format!("bad ohlcv timestamp {ts}")))?;
        candle.validate()?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

/// Trades that realized PnL, as fills. The closing trade side is opposite to
/// the position side.
pub fn trades_to_fills(trades: Vec<UnifiedTrade>, symbol: &str) -> Vec<Fill> {
    trades
        .into_iter()
        .filter(|t| t.realized_pnl != 0.0)
        .map(|t| Fill {
            order_id: t.order,
            symbol: symbol.to_string(),
            position_side: Side::from_str(&t.side).map(|s| s.opposite()),
            entry_price: 0.0,
            exit_price: t.price,
            qty: t.amount,
            realized_pnl: t.realized_pnl,
            fee: t.fee,
            time: t.timestamp,
        })
        .collect()
}

#[async_trait]
impl ProtectedOrderFlow for GenericAdapter {
    fn venue(&self) -> Venue {
        Venue::Generic
    }

    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        if self.market == MarketType::Spot && request.side == Side::Short {
            return Err(ExchangeError::NotSupported(format!("{} spot cannot short", self.exchange_id)));
        }
        let order = self
            .market_order(&request.side.open_order_side().to_lowercase(), request.size, false)
            .await?;
        let mut result = OrderResult::ok(order.id).with_client_id(request.client_order_id.clone());
        result.filled_qty = Some(order.filled.filter(|f| *f > 0.0).unwrap_or(request.size));
        result.filled_price = match order.average.filter(|p| *p > 0.0) {
            Some(p) => Some(p),
            None => self.last_price().await,
        };
        Ok(result)
    }

    async fn attach_stop_loss(
        &self,
        request: &OrderRequest,
        entry: &OrderResult,
        stop_loss: f64,
    ) -> Result<(), ExchangeError> {
        // spot venues hold the stop locally
        if self.market == MarketType::Spot {
            return Ok(());
        }
        let qty = entry.filled_qty.unwrap_or(request.size);
        self.stop_market(request.side, qty, stop_loss).await?;
        Ok(())
    }

    async fn emergency_close(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        let order = self
            .market_order(&side.close_order_side().to_lowercase(), size, true)
            .await?;
        Ok(OrderResult::ok(order.id))
    }
}

#[async_trait]
impl ExchangeAdapter for GenericAdapter {
    fn venue(&self) -> Venue {
        Venue::Generic
    }

    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        self.client.fetch_ticker(&self.unified).await?;
        info!(exchange = %self.exchange_id, symbol = %self.unified, market = ?self.market, "✅ Connected");
        Ok(())
    }

    /// USDT free balance, KRW when the account holds no USDT.
    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let balance = self.client.fetch_balance().await?;
        let usdt = balance.get("USDT").copied().unwrap_or(0.0);
        if usdt > 0.0 {
            return Ok(usdt);
        }
        Ok(balance.get("KRW").copied().unwrap_or(0.0))
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let rows = self
            .client
            .fetch_ohlcv(&self.unified, interval.as_str(), limit)
            .await?;
        parse_ohlcv(&rows)
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        let price = self.client.fetch_ticker(&self.unified).await?;
        if !price.is_finite() || price <= 0.0 {
            return Err(ExchangeError::data(format!("{} ticker returned {price}", self.exchange_id)));
        }
        Ok(price)
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        let result = place_protected(self, &request).await?;
        let qty = result.filled_qty.unwrap_or(request.size);
        if let Some(price) = result.filled_price {
            self.tracker.open(request.side, qty, price, request.stop_loss);
        }
        info!(
            exchange = %self.exchange_id,
            side = %request.side,
            qty,
            price = ?result.filled_price,
            "📈 Entry filled"
        );
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
        if self.market == MarketType::Spot {
            self.tracker.set_stop(new_sl);
            return Ok(OrderResult::ok(None));
        }
        self.client.cancel_all_orders(&self.unified).await?;
        let order = self.stop_market(side, size, new_sl).await?;
        self.tracker.set_stop(new_sl);
        debug!(exchange = %self.exchange_id, stop_loss = new_sl, "Stop order replaced");
        Ok(OrderResult::ok(order.id))
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        let positions = self.get_positions().await?;
        if positions.is_empty() {
            self.tracker.clear();
            return Ok(OrderResult::ok(None));
        }
        let mut last_id = None;
        for p in &positions {
            let order = self
                .market_order(&p.side.close_order_side().to_lowercase(), p.size, true)
                .await?;
            last_id = order.id;
        }
        if let Err(e) = self.client.cancel_all_orders(&self.unified).await {
            warn!(exchange = %self.exchange_id, error = %e, "Leftover orders not cancelled");
        }
        self.tracker.clear();

        let mut result = OrderResult::ok(last_id);
        result.filled_qty = Some(positions.iter().map(|p| p.size).sum());
        result.filled_price = self.last_price().await;
        Ok(result)
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        tracked_for_add(self, &self.tracker, side).await?;
        let cid = add_client_id(&self.symbol, side);
        let order = self
            .market_order(&side.open_order_side().to_lowercase(), size, false)
            .await?;
        let price = match order.average.filter(|p| *p > 0.0) {
            Some(p) => p,
            None => self.get_current_price().await?,
        };
        let qty = order.filled.filter(|f| *f > 0.0).unwrap_or(size);
        let merged = self.tracker.apply_add(qty, price);
        info!(
            exchange = %self.exchange_id,
            side = %side,
            qty,
            price,
            avg_entry = ?merged.map(|p| p.entry_price),
            "➕ Position added"
        );
        Ok(OrderResult::filled(order.id, price, qty).with_client_id(cid))
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        if self.market == MarketType::Spot {
            info!(exchange = %self.exchange_id, leverage, "Leverage not applicable on spot");
            return Ok(true);
        }
        match self.client.set_leverage(leverage, &self.unified).await {
            Ok(()) => Ok(true),
            Err(ExchangeError::Rejected { message, .. })
                if message.to_lowercase().contains("leverage not modified") =>
            {
                Ok(true)
            }
            Err(ExchangeError::NotSupported(msg)) => {
                warn!(exchange = %self.exchange_id, reason = %msg, "set_leverage unsupported, keeping venue default");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let stop = self.tracker.get().and_then(|p| p.stop_loss);
        Ok(self
            .client
            .fetch_positions(&self.unified)
            .await?
            .into_iter()
            .filter(|p| p.contracts > 0.0)
            .filter_map(|p| {
                Some(ExchangePosition {
                    symbol: self.symbol.clone(),
                    side: Side::from_str(&p.side)?,
                    size: p.contracts,
                    entry_price: p.entry_price,
                    unrealized_pnl: p.unrealized_pnl,
                    leverage: p.leverage,
                    stop_loss: stop,
                })
            })
            .collect())
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        let trades = self.client.fetch_my_trades(&self.unified, limit).await?;
        let fills = trades_to_fills(trades, &self.symbol);
        info!(exchange = %self.exchange_id, count = fills.len(), "Trade history loaded");
        Ok(fills)
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.tracker.get()
    }
}
