//! Exchange adapters
//!
//! One [`ExchangeAdapter`] implementation per venue behind a single
//! capability interface. Every order-mutating call returns [`OrderResult`];
//! every failure is a typed [`ExchangeError`].

pub mod binance;
pub mod bingx;
pub mod bitget;
pub mod bithumb;
pub mod bybit;
pub mod generic;
pub mod http;
pub mod lighter;
pub mod okx;
pub mod retry;
pub mod signing;
pub mod symbols;
pub mod upbit;

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::error::ExchangeError;
use crate::persistence::TradeStorage;
use crate::time_sync::TimeSync;
use crate::types::{
    Candle, ExchangePosition, Fill, Interval, OrderRequest, OrderResult, Side, TrackedPosition, Venue,
};

pub use binance::BinanceAdapter;
pub use bingx::BingxAdapter;
pub use bitget::BitgetAdapter;
pub use bithumb::BithumbAdapter;
pub use bybit::BybitAdapter;
pub use generic::{GenericAdapter, UnifiedClient};
pub use lighter::{LighterAdapter, LighterSigner};
pub use okx::OkxAdapter;
pub use upbit::UpbitAdapter;

/// Normalized venue capability set.
///
/// Spot venues implement leverage as a logged no-op and keep stop-losses
/// locally; they never send protective orders.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Canonical symbol (BTCUSDT form)
    fn symbol(&self) -> String;

    /// Establish the session, sync time, detect hedge/one-way mode.
    async fn connect(&self) -> Result<(), ExchangeError>;

    /// Free quote balance: USDT margin wallet for futures, KRW for spot.
    async fn get_balance(&self) -> Result<f64, ExchangeError>;

    /// Ascending-time OHLCV bars.
    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError>;

    /// Last traded price. Zero or NaN is a data-integrity error.
    async fn get_current_price(&self) -> Result<f64, ExchangeError>;

    /// Market entry. When a stop-loss is requested and cannot be attached the
    /// position is closed again and `ProtectionFailed` is returned.
    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn update_stop_loss(&self, new_sl: f64) -> Result<OrderResult, ExchangeError>;

    async fn close_position(&self) -> Result<OrderResult, ExchangeError>;

    /// Pyramiding add; the tracked entry is re-averaged by size.
    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError>;

    /// "Already at this leverage" venue codes count as success.
    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError>;

    /// Raw open positions. A failed call is an error, never an empty list.
    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError>;

    fn tracked_position(&self) -> Option<TrackedPosition>;
}

/// The three venue calls that make up a protected entry
#[async_trait]
pub trait ProtectedOrderFlow: Send + Sync {
    fn venue(&self) -> Venue;

    /// Send the market entry without protection.
    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    /// Attach a stop for the freshly filled entry.
    async fn attach_stop_loss(
        &self,
        request: &OrderRequest,
        entry: &OrderResult,
        stop_loss: f64,
    ) -> Result<(), ExchangeError>;

    /// Reduce-only market close of `size` on `side`.
    async fn emergency_close(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError>;
}

/// Entry followed by stop attachment, with exactly one emergency close when
/// the stop cannot be set. An entry without its requested stop is never left
/// open silently.
pub async fn place_protected<F>(flow: &F, request: &OrderRequest) -> Result<OrderResult, ExchangeError>
where
    F: ProtectedOrderFlow + ?Sized,
{
    let entry = flow.submit_entry(request).await?.into_result()?;

    let Some(stop_loss) = request.stop_loss else {
        return Ok(entry);
    };

    let sl_error = match flow.attach_stop_loss(request, &entry, stop_loss).await {
        Ok(()) => return Ok(entry),
        Err(e) => e,
    };

    let size = entry.filled_qty.filter(|q| *q > 0.0).unwrap_or(request.size);
    error!(
        venue = %flow.venue(),
        side = %request.side,
        size,
        stop_loss,
        error = %sl_error,
        "🚨 Stop-loss attach failed, emergency closing entry"
    );

    let closed = match flow.emergency_close(request.side, size).await {
        Ok(result) => result.success,
        Err(e) => {
            error!(venue = %flow.venue(), error = %e, "🚨 Emergency close failed, position is UNPROTECTED");
            false
        }
    };

    Err(ExchangeError::ProtectionFailed {
        reason: sl_error.to_string(),
        closed,
    })
}

/// Request timestamp in ms, corrected by the venue clock when one is attached.
pub(crate) async fn venue_timestamp_ms(time: Option<&Arc<TimeSync>>) -> i64 {
    match time {
        Some(sync) => (sync.server_time().await * 1000.0) as i64,
        None => chrono::Utc::now().timestamp_millis(),
    }
}

/// Tracked position for a pyramiding add, seeded from the venue when the
/// adapter has no record (restored after a restart).
pub(crate) async fn tracked_for_add<A>(
    adapter: &A,
    tracker: &PositionTracker,
    side: Side,
) -> Result<TrackedPosition, ExchangeError>
where
    A: ExchangeAdapter + ?Sized,
{
    if tracker.get().is_none() {
        let venue_side = adapter
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.side == side && p.size > 0.0);
        if let Some(p) = venue_side {
            tracker.open(p.side, p.size, p.entry_price, p.stop_loss);
        }
    }
    tracker.require_side(side)
}

/// Client id for a pyramiding add order.
pub(crate) fn add_client_id(symbol: &str, side: Side) -> String {
    format!("{symbol}_{side}_ADD_{}", chrono::Utc::now().timestamp_millis())
}

/// Adapter-side record of the position it opened
#[derive(Debug, Default)]
pub struct PositionTracker {
    inner: Mutex<Option<TrackedPosition>>,
}

impl PositionTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TrackedPosition>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self) -> Option<TrackedPosition> {
        self.lock().clone()
    }

    pub fn open(&self, side: Side, size: f64, entry_price: f64, stop_loss: Option<f64>) {
        *self.lock() = Some(TrackedPosition::new(side, size, entry_price, stop_loss));
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn set_stop(&self, stop_loss: f64) {
        if let Some(p) = self.lock().as_mut() {
            p.stop_loss = Some(stop_loss);
        }
    }

    /// Merge an add fill. Returns the updated position.
    pub fn apply_add(&self, size: f64, price: f64) -> Option<TrackedPosition> {
        let mut guard = self.lock();
        let p = guard.as_mut()?;
        p.apply_add(size, price);
        Some(p.clone())
    }

    /// Add requires a tracked position on the same side.
    pub fn require_side(&self, side: Side) -> Result<TrackedPosition, ExchangeError> {
        match self.get() {
            Some(p) if p.side == side => Ok(p),
            Some(p) => Err(ExchangeError::rejected(
                "side_mismatch",
                format!("add {side} against tracked {}", p.side),
            )),
            None => Err(ExchangeError::rejected("no_position", "no tracked position to add to")),
        }
    }
}

/// API credentials for one venue
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

fn mask(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}...")
}

fn resolve_env(var_names: &[&str]) -> Option<String> {
    for var in var_names {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() || self.api_secret.is_empty()
    }

    /// Read credentials from the venue's environment variables.
    pub fn from_env(venue: Venue) -> anyhow::Result<Self> {
        let (key_vars, secret_vars, pass_vars): (&[&str], &[&str], &[&str]) = match venue {
            Venue::Bybit => (&["BYBIT_API_KEY"], &["BYBIT_API_SECRET"], &[]),
            Venue::Binance => (&["BINANCE_API_KEY"], &["BINANCE_API_SECRET"], &[]),
            Venue::Okx => (&["OKX_API_KEY"], &["OKX_API_SECRET"], &["OKX_PASSPHRASE"]),
            Venue::Bitget => (&["BITGET_API_KEY"], &["BITGET_API_SECRET"], &["BITGET_PASSPHRASE"]),
            Venue::Bingx => (&["BINGX_API_KEY"], &["BINGX_API_SECRET"], &[]),
            Venue::Upbit => (&["UPBIT_ACCESS_KEY", "UPBIT_API_KEY"], &["UPBIT_SECRET_KEY", "UPBIT_API_SECRET"], &[]),
            Venue::Bithumb => (&["BITHUMB_API_KEY"], &["BITHUMB_API_SECRET"], &[]),
            Venue::Lighter => (&["LIGHTER_ACCOUNT_INDEX"], &["LIGHTER_API_KEY_INDEX"], &[]),
            Venue::Generic => (&["GENERIC_API_KEY"], &["GENERIC_API_SECRET"], &["GENERIC_PASSPHRASE"]),
        };

        let api_key = resolve_env(key_vars)
            .with_context(|| format!("{} not configured", key_vars.join("/")))?;
        let api_secret = resolve_env(secret_vars)
            .with_context(|| format!("{} not configured", secret_vars.join("/")))?;

        let mut creds = Self::new(api_key, api_secret);
        if !pass_vars.is_empty() {
            let passphrase = resolve_env(pass_vars)
                .with_context(|| format!("{} not configured", pass_vars.join("/")))?;
            creds = creds.with_passphrase(passphrase);
        }
        Ok(creds)
    }
}

/// Build the REST adapter for `venue`.
///
/// `Generic` needs an injected [`UnifiedClient`] and `Lighter` orders need a
/// [`LighterSigner`]; use their constructors directly for those.
pub fn build_adapter(
    venue: Venue,
    symbol: &str,
    creds: Credentials,
    time: Option<Arc<TimeSync>>,
) -> anyhow::Result<Arc<dyn ExchangeAdapter>> {
    let adapter: Arc<dyn ExchangeAdapter> = match venue {
        Venue::Bybit => Arc::new(BybitAdapter::new(symbol, creds)?.with_time_sync(time)),
        Venue::Binance => Arc::new(BinanceAdapter::new(symbol, creds)?.with_time_sync(time)),
        Venue::Okx => Arc::new(OkxAdapter::new(symbol, creds)?.with_time_sync(time)),
        Venue::Bitget => Arc::new(BitgetAdapter::new(symbol, creds)?.with_time_sync(time)),
        Venue::Bingx => Arc::new(BingxAdapter::new(symbol, creds)?.with_time_sync(time)),
        Venue::Upbit => Arc::new(UpbitAdapter::new(symbol, creds)?),
        Venue::Bithumb => Arc::new(BithumbAdapter::new(symbol, creds)?),
        Venue::Lighter => Arc::new(LighterAdapter::from_credentials(symbol, &creds, None)?),
        Venue::Generic => bail!("generic adapter requires an injected UnifiedClient"),
    };
    Ok(adapter)
}

/// Decorator: venue trade history with the local history file as fallback.
pub struct WithLocalHistory {
    inner: Arc<dyn ExchangeAdapter>,
    local: Arc<dyn TradeStorage>,
}

impl WithLocalHistory {
    pub fn new(inner: Arc<dyn ExchangeAdapter>, local: Arc<dyn TradeStorage>) -> Self {
        Self { inner, local }
    }
}

#[async_trait]
impl ExchangeAdapter for WithLocalHistory {
    fn venue(&self) -> Venue {
        self.inner.venue()
    }

    fn symbol(&self) -> String {
        self.inner.symbol()
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        self.inner.connect().await
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        self.inner.get_balance().await
    }

    async fn get_klines(&self, interval: Interval, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        self.inner.get_klines(interval, limit).await
    }

    async fn get_current_price(&self) -> Result<f64, ExchangeError> {
        self.inner.get_current_price().await
    }

    async fn place_market_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        self.inner.place_market_order(request).await
    }

    async fn update_stop_loss(&self, new_sl: f64) -> Result<OrderResult, ExchangeError> {
        self.inner.update_stop_loss(new_sl).await
    }

    async fn close_position(&self) -> Result<OrderResult, ExchangeError> {
        self.inner.close_position().await
    }

    async fn add_position(&self, side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        self.inner.add_position(side, size).await
    }

    async fn set_leverage(&self, leverage: u32) -> Result<bool, ExchangeError> {
        self.inner.set_leverage(leverage).await
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        self.inner.get_positions().await
    }

    async fn get_trade_history(&self, limit: usize) -> Result<Vec<Fill>, ExchangeError> {
        match self.inner.get_trade_history(limit).await {
            Ok(fills) => Ok(fills),
            Err(e) => {
                warn!(venue = %self.venue(), error = %e, "Venue trade history failed, using local file");
                match self.local.get_trades(limit) {
                    Ok(trades) => Ok(trades.iter().rev().map(|t| t.to_fill()).collect()),
                    Err(local_err) => {
                        warn!(error = %local_err, "Local trade history unavailable");
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn tracked_position(&self) -> Option<TrackedPosition> {
        self.inner.tracked_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeFlow {
        sl_fails: bool,
        close_ok: bool,
        entries: AtomicU32,
        closes: AtomicU32,
        last_close_size: Mutex<f64>,
    }

    impl FakeFlow {
        fn new(sl_fails: bool, close_ok: bool) -> Self {
            Self {
                sl_fails,
                close_ok,
                entries: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                last_close_size: Mutex::new(0.0),
            }
        }
    }

    #[async_trait]
    impl ProtectedOrderFlow for FakeFlow {
        fn venue(&self) -> Venue {
            Venue::Bybit
        }

        async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
            self.entries.fetch_add(1, Ordering::SeqCst);
            Ok(OrderResult::filled(Some("o1".into()), 50_000.0, request.size * 0.5))
        }

        async fn attach_stop_loss(&self, _: &OrderRequest, _: &OrderResult, _: f64) -> Result<(), ExchangeError> {
            if self.sl_fails {
                Err(ExchangeError::rejected("10001", "bad trigger"))
            } else {
                Ok(())
            }
        }

        async fn emergency_close(&self, _side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *self.last_close_size.lock().unwrap() = size;
            if self.close_ok {
                Ok(OrderResult::ok(None))
            } else {
                Err(ExchangeError::transient("down"))
            }
        }
    }

    #[tokio::test]
    async fn sl_failure_triggers_exactly_one_emergency_close() {
        let flow = FakeFlow::new(true, true);
        let req = OrderRequest::market(Side::Long, 0.02, "BTCUSDT_Long_1").with_stop_loss(49_000.0);
        let result = place_protected(&flow, &req).await;

        assert!(matches!(result, Err(ExchangeError::ProtectionFailed { closed: true, .. })));
        assert_eq!(flow.closes.load(Ordering::SeqCst), 1);
        // closes the filled quantity, not the requested one
        assert!((*flow.last_close_size.lock().unwrap() - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn failed_emergency_close_is_reported() {
        let flow = FakeFlow::new(true, false);
        let req = OrderRequest::market(Side::Short, 1.0, "x").with_stop_loss(51_000.0);
        let result = place_protected(&flow, &req).await;
        assert!(matches!(result, Err(ExchangeError::ProtectionFailed { closed: false, .. })));
        assert_eq!(flow.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_stop_requested_means_no_attach_and_no_close() {
        let flow = FakeFlow::new(true, true);
        let req = OrderRequest::market(Side::Long, 1.0, "x");
        let result = place_protected(&flow, &req).await.unwrap();
        assert!(result.success);
        assert_eq!(flow.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_history_backs_up_failing_venue() {
        use crate::persistence::{StateStore, TradeRecord};
        use chrono::Utc;

        let dir = std::env::temp_dir().join(format!("venuebot_history_fallback_{}", uuid::Uuid::new_v4()));
        let store = StateStore::new(&dir, Venue::Bybit, "BTCUSDT").unwrap();
        store
            .add_trade(TradeRecord {
                symbol: "BTCUSDT".into(),
                entry_time: Utc::now(),
                exit_time: Utc::now(),
                direction: Side::Long,
                entry_price: 100.0,
                exit_price: 110.0,
                size: 1.0,
                pnl_pct: 10.0,
                pnl_usd: 10.0,
                reason: "SL_HIT".into(),
                client_order_id: None,
                exchange_order_id: Some("abc".into()),
                fee: 0.1,
                real_history: false,
                saved_at: None,
            })
            .unwrap();

        let mut inner = MockExchangeAdapter::new();
        inner.expect_venue().return_const(Venue::Bybit);
        inner
            .expect_get_trade_history()
            .times(1)
            .returning(|_| Err(ExchangeError::transient("503")));

        let adapter = WithLocalHistory::new(Arc::new(inner), store.trade_storage());
        let fills = adapter.get_trade_history(5).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id.as_deref(), Some("abc"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn tracker_rejects_add_on_wrong_side() {
        let tracker = PositionTracker::default();
        assert!(tracker.require_side(Side::Long).is_err());
        tracker.open(Side::Long, 1.0, 100.0, Some(95.0));
        assert!(tracker.require_side(Side::Short).is_err());
        let p = tracker.apply_add(1.0, 120.0).unwrap();
        assert!((p.entry_price - 110.0).abs() < 1e-9);
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let creds = Credentials::new("ABCDEFG", "topsecret").with_passphrase("pp");
        let text = format!("{creds:?}");
        assert!(!text.contains("topsecret"));
        assert!(!text.contains("EFG"));
    }
}
