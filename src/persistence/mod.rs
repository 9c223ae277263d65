//! Bot state persistence
//!
//! Per (venue, symbol) JSON files under the data directory:
//! - `{venue}_{symbol}_state.json`: position, managed-position registry, capital
//! - `{venue}_{symbol}_cache.json`: short-lived snapshots (pending signals), mtime TTL
//! - `{venue}_{symbol}_history.json`: append-only trade history, capped
//!
//! plus a shared `bot_state.json` mirror kept for external tooling. Every
//! write goes through a temp file in the same directory, fsync, then rename.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::types::{canonical_symbol, Fill, ManagedPositionRecord, Position, Side, Signal, Venue};

pub const LEGACY_STATE_FILE: &str = "bot_state.json";
pub const DEFAULT_HISTORY_CAP: usize = 1000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Persisted per-instance bot state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub managed_positions: BTreeMap<String, ManagedPositionRecord>,
    #[serde(default)]
    pub capital: f64,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One closed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    #[serde(default)]
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub direction: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl_pct: f64,
    pub pnl_usd: f64,
    pub reason: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    #[serde(default)]
    pub fee: f64,
    /// PnL came from venue fill data rather than the local fee model
    #[serde(default)]
    pub real_history: bool,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl TradeRecord {
    pub fn to_fill(&self) -> Fill {
        Fill {
            order_id: self.exchange_order_id.clone(),
            symbol: self.symbol.clone(),
            position_side: Some(self.direction),
            entry_price: self.entry_price,
            exit_price: self.exit_price,
            qty: self.size,
            realized_pnl: self.pnl_usd,
            fee: self.fee,
            time: self.exit_time,
        }
    }
}

/// Aggregate statistics over trade history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Percent of trades with positive pnl
    pub win_rate: f64,
    pub total_pnl_pct: f64,
    pub total_pnl_usd: f64,
    pub avg_pnl_pct: f64,
    pub max_win_pct: f64,
    pub max_loss_pct: f64,
}

impl TradeStats {
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let total_trades = trades.len();
        let wins = trades.iter().filter(|t| t.pnl_pct > 0.0).count();
        let total_pnl_pct: f64 = trades.iter().map(|t| t.pnl_pct).sum();
        let total_pnl_usd: f64 = trades.iter().map(|t| t.pnl_usd).sum();

        Self {
            total_trades,
            wins,
            losses: total_trades - wins,
            win_rate: wins as f64 / total_trades as f64 * 100.0,
            total_pnl_pct,
            total_pnl_usd,
            avg_pnl_pct: total_pnl_pct / total_trades as f64,
            max_win_pct: trades.iter().map(|t| t.pnl_pct).fold(0.0, f64::max),
            max_loss_pct: trades.iter().map(|t| t.pnl_pct).fold(0.0, f64::min),
        }
    }
}

/// Pluggable state backend
pub trait StateStorage: Send + Sync {
    fn load_state(&self) -> Result<Option<BotState>>;
    fn save_state(&self, state: &BotState) -> Result<()>;
}

/// Pluggable trade-history backend
pub trait TradeStorage: Send + Sync {
    fn add_trade(&self, trade: TradeRecord) -> Result<()>;
    /// Most recent `limit` trades, oldest first.
    fn get_trades(&self, limit: usize) -> Result<Vec<TradeRecord>>;
}

/// Signal queue snapshot kept in the cache file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalCache {
    #[serde(default)]
    pub pending: Vec<Signal>,
    /// Signals already used by an entry, kept until they expire
    #[serde(default)]
    pub consumed: Vec<Signal>,
}

/// Write `contents` to `path` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temp state file")?;
    tmp.write_all(contents).context("Failed to write temp state file")?;
    tmp.as_file().sync_all().context("Failed to fsync temp state file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to rename temp file onto {}", path.display()))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&raw).with_context(|| format!("Corrupt JSON in {}", path.display()))?;
    Ok(Some(value))
}

/// Default file backend: the instance state/history files plus the legacy mirror
pub struct JsonFileStorage {
    exchange: String,
    symbol: String,
    state_file: PathBuf,
    history_file: PathBuf,
    legacy_file: PathBuf,
    history_cap: usize,
    // serializes read-modify-write of the history file
    history_lock: Mutex<()>,
}

impl JsonFileStorage {
    pub fn new(data_dir: &Path, venue: Venue, symbol: &str) -> Self {
        let symbol = canonical_symbol(symbol);
        let instance_id = format!("{}_{}", venue.as_str(), symbol.to_lowercase());
        Self {
            exchange: venue.as_str().to_string(),
            state_file: data_dir.join(format!("{instance_id}_state.json")),
            history_file: data_dir.join(format!("{instance_id}_history.json")),
            legacy_file: data_dir.join(LEGACY_STATE_FILE),
            symbol,
            history_cap: DEFAULT_HISTORY_CAP,
            history_lock: Mutex::new(()),
        }
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    pub fn legacy_file(&self) -> &Path {
        &self.legacy_file
    }

    fn load_history(&self) -> Vec<TradeRecord> {
        match read_json::<Vec<TradeRecord>>(&self.history_file) {
            Ok(history) => history.unwrap_or_default(),
            Err(e) => {
                warn!(file = %self.history_file.display(), error = %e, "Trade history unreadable, starting fresh");
                Vec::new()
            }
        }
    }
}

impl StateStorage for JsonFileStorage {
    fn load_state(&self) -> Result<Option<BotState>> {
        if let Some(state) = read_json::<BotState>(&self.state_file)? {
            debug!(file = %self.state_file.display(), "Loaded instance state");
            return Ok(Some(state));
        }

        // legacy mirror is shared; only accept it when it belongs to this pair
        if let Some(state) = read_json::<BotState>(&self.legacy_file)? {
            let owner_matches = (state.exchange.is_empty() || state.exchange == self.exchange)
                && (state.symbol.is_empty() || canonical_symbol(&state.symbol) == self.symbol);
            if owner_matches {
                info!(exchange = %self.exchange, symbol = %self.symbol, "Loaded state from legacy file");
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    fn save_state(&self, state: &BotState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).context("Failed to serialize bot state")?;
        write_atomic(&self.state_file, &json)?;
        if let Err(e) = write_atomic(&self.legacy_file, &json) {
            debug!(error = %e, "Legacy state mirror write failed");
        }
        Ok(())
    }
}

impl TradeStorage for JsonFileStorage {
    fn add_trade(&self, trade: TradeRecord) -> Result<()> {
        let _guard = self.history_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut history = self.load_history();
        history.push(trade);
        if history.len() > self.history_cap {
            let excess = history.len() - self.history_cap;
            history.drain(..excess);
        }
        let json = serde_json::to_vec_pretty(&history).context("Failed to serialize trade history")?;
        write_atomic(&self.history_file, &json)
    }

    fn get_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let history = self.load_history();
        let skip = history.len().saturating_sub(limit);
        Ok(history.into_iter().skip(skip).collect())
    }
}

/// Per-instance store: state, managed-position registry, trade history, cache
pub struct StateStore {
    venue: Venue,
    symbol: String,
    files: Arc<JsonFileStorage>,
    state_backend: Option<Arc<dyn StateStorage>>,
    trade_backend: Option<Arc<dyn TradeStorage>>,
    cache_file: PathBuf,
    trades_csv_file: PathBuf,
    cache_ttl: Duration,
    managed: Mutex<BTreeMap<String, ManagedPositionRecord>>,
}

impl StateStore {
    pub fn new(data_dir: impl AsRef<Path>, venue: Venue, symbol: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).context("Failed to create data directory")?;

        let symbol = canonical_symbol(symbol);
        let files = Arc::new(JsonFileStorage::new(data_dir, venue, &symbol));
        let cache_file = data_dir.join(format!("{}_{}_cache.json", venue.as_str(), symbol.to_lowercase()));
        let trades_csv_file = data_dir.join(format!("{}_{}_trades.csv", venue.as_str(), symbol.to_lowercase()));

        let store = Self {
            venue,
            symbol,
            files,
            state_backend: None,
            trade_backend: None,
            cache_file,
            trades_csv_file,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            managed: Mutex::new(BTreeMap::new()),
        };
        store.reload_managed_positions();
        Ok(store)
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        if let Some(files) = Arc::get_mut(&mut self.files) {
            files.history_cap = cap.max(1);
        }
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Inject external backends; file I/O is used for whichever is absent.
    pub fn with_backends(
        mut self,
        state: Option<Arc<dyn StateStorage>>,
        trades: Option<Arc<dyn TradeStorage>>,
    ) -> Self {
        self.state_backend = state;
        self.trade_backend = trades;
        self.reload_managed_positions();
        self
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn files(&self) -> &JsonFileStorage {
        &self.files
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    /// Default target of [`StateStore::export_trades_csv`]
    pub fn trades_csv_file(&self) -> &Path {
        &self.trades_csv_file
    }

    /// The trade storage in effect, for callers that read history directly.
    pub fn trade_storage(&self) -> Arc<dyn TradeStorage> {
        match &self.trade_backend {
            Some(backend) => backend.clone(),
            None => self.files.clone() as Arc<dyn TradeStorage>,
        }
    }

    fn reload_managed_positions(&self) {
        match self.load_state() {
            Ok(Some(state)) => {
                let mut managed = self.lock_managed();
                *managed = state.managed_positions;
                debug!(count = managed.len(), symbol = %self.symbol, "Loaded managed positions");
            }
            Ok(None) => {}
            Err(e) => warn!(symbol = %self.symbol, error = %e, "Could not load managed positions"),
        }
    }

    fn lock_managed(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ManagedPositionRecord>> {
        self.managed.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ========== State ==========

    /// Injected backend first, then the instance file, then the legacy mirror.
    pub fn load_state(&self) -> Result<Option<BotState>> {
        if let Some(backend) = &self.state_backend {
            if let Some(state) = backend.load_state()? {
                return Ok(Some(state));
            }
        }
        self.files.load_state()
    }

    /// Stamp and persist `state`. The managed registry held by this store
    /// always wins over whatever the caller passed in.
    pub fn save_state(&self, mut state: BotState) -> Result<BotState> {
        state.timestamp = Some(Utc::now());
        state.exchange = self.venue.as_str().to_string();
        state.symbol = self.symbol.clone();
        state.managed_positions = self.lock_managed().clone();

        if let Some(backend) = &self.state_backend {
            backend.save_state(&state)?;
        }
        self.files.save_state(&state)?;
        debug!(file = %self.files.state_file.display(), "State saved");
        Ok(state)
    }

    fn persist_managed(&self) -> Result<()> {
        let state = self.load_state()?.unwrap_or_default();
        self.save_state(state)?;
        Ok(())
    }

    // ========== Managed positions ==========

    pub fn add_managed_position(&self, record: ManagedPositionRecord) -> Result<()> {
        let key = canonical_symbol(&record.symbol);
        info!(
            symbol = %key,
            side = %record.side,
            entry = record.entry_price,
            client_order_id = %record.client_order_id,
            "📌 Registered managed position"
        );
        self.lock_managed().insert(key, record);
        self.persist_managed()
    }

    pub fn remove_managed_position(&self, symbol: &str) -> Result<bool> {
        let key = canonical_symbol(symbol);
        let removed = self.lock_managed().remove(&key).is_some();
        if removed {
            info!(symbol = %key, "Managed position removed");
            self.persist_managed()?;
        }
        Ok(removed)
    }

    pub fn is_managed_position(&self, symbol: &str) -> bool {
        self.lock_managed().contains_key(&canonical_symbol(symbol))
    }

    pub fn get_managed_position(&self, symbol: &str) -> Option<ManagedPositionRecord> {
        self.lock_managed().get(&canonical_symbol(symbol)).cloned()
    }

    pub fn managed_positions(&self) -> Vec<ManagedPositionRecord> {
        self.lock_managed().values().cloned().collect()
    }

    // ========== Trade history ==========

    pub fn add_trade(&self, mut trade: TradeRecord) -> Result<()> {
        trade.saved_at = Some(Utc::now());
        if trade.symbol.is_empty() {
            trade.symbol = self.symbol.clone();
        }
        let pnl_pct = trade.pnl_pct;
        self.trade_storage().add_trade(trade)?;
        info!(symbol = %self.symbol, pnl_pct = format!("{:.2}", pnl_pct), "Trade saved");
        Ok(())
    }

    pub fn trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        self.trade_storage().get_trades(limit)
    }

    pub fn trade_stats(&self) -> Result<TradeStats> {
        Ok(TradeStats::from_trades(&self.trades(usize::MAX)?))
    }

    /// Export the full trade history as CSV.
    pub fn export_trades_csv(&self, output_path: impl AsRef<Path>) -> Result<usize> {
        let trades = self.trades(usize::MAX)?;
        let output_path = output_path.as_ref();

        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_path(output_path)
            .context("Failed to create export file")?;
        for trade in &trades {
            writer.serialize(trade)?;
        }
        writer.flush()?;

        info!("Exported {} trades to {}", trades.len(), output_path.display());
        Ok(trades.len())
    }

    // ========== Cache ==========

    pub fn save_cache(&self, mut data: Value) -> Result<()> {
        if let Value::Object(map) = &mut data {
            map.insert("last_update".into(), Value::String(Utc::now().to_rfc3339()));
        }
        let json = serde_json::to_vec_pretty(&data).context("Failed to serialize cache")?;
        write_atomic(&self.cache_file, &json)
    }

    /// Cached data, or `None` when absent or older than the TTL by mtime.
    pub fn load_cache(&self) -> Result<Option<Value>> {
        if !self.cache_file.exists() {
            return Ok(None);
        }
        let modified = fs::metadata(&self.cache_file)
            .and_then(|m| m.modified())
            .context("Failed to stat cache file")?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > self.cache_ttl {
            info!(age_secs = age.as_secs(), "Cache expired");
            return Ok(None);
        }
        read_json(&self.cache_file)
    }

    pub fn clear_cache(&self) -> Result<()> {
        if self.cache_file.exists() {
            fs::remove_file(&self.cache_file).context("Failed to remove cache file")?;
            info!(file = %self.cache_file.display(), "Cache cleared");
        }
        Ok(())
    }

    /// Cache the signal queue. An empty queue with nothing consumed removes
    /// the cache file instead.
    pub fn save_signal_cache(&self, cache: &SignalCache) -> Result<()> {
        if cache.pending.is_empty() && cache.consumed.is_empty() {
            return self.clear_cache();
        }
        self.save_cache(serde_json::to_value(cache).context("Failed to serialize signals")?)
    }

    pub fn load_signal_cache(&self) -> Result<SignalCache> {
        match self.load_cache()? {
            Some(cache) => Ok(serde_json::from_value(cache).context("Corrupt signal cache")?),
            None => Ok(SignalCache::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "venuebot_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn trade(pnl_pct: f64) -> TradeRecord {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap();
        TradeRecord {
            symbol: "BTCUSDT".into(),
            entry_time: t,
            exit_time: t + chrono::Duration::hours(1),
            direction: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl_pct,
            size: 1.0,
            pnl_pct,
            pnl_usd: pnl_pct,
            reason: "SL_HIT".into(),
            client_order_id: None,
            exchange_order_id: None,
            fee: 0.0,
            real_history: false,
            saved_at: None,
        }
    }

    fn managed(symbol: &str) -> ManagedPositionRecord {
        ManagedPositionRecord {
            symbol: symbol.into(),
            order_id: Some("1".into()),
            client_order_id: format!("{symbol}_Long_1"),
            entry_price: 100.0,
            side: Side::Long,
            size: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_writes_instance_and_legacy_files() {
        let dir = temp_data_dir("save");
        let store = StateStore::new(&dir, Venue::Bybit, "BTC/USDT").unwrap();
        let saved = store.save_state(BotState { capital: 1000.0, ..Default::default() }).unwrap();

        assert_eq!(saved.exchange, "bybit");
        assert_eq!(saved.symbol, "BTCUSDT");
        assert!(saved.timestamp.is_some());
        assert!(dir.join("bybit_btcusdt_state.json").exists());
        assert!(dir.join(LEGACY_STATE_FILE).exists());

        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded.capital, 1000.0);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn legacy_file_is_only_a_fallback_for_the_same_pair() {
        let dir = temp_data_dir("legacy");
        fs::create_dir_all(&dir).unwrap();
        let other = BotState {
            capital: 5.0,
            exchange: "binance".into(),
            symbol: "ETHUSDT".into(),
            ..Default::default()
        };
        fs::write(dir.join(LEGACY_STATE_FILE), serde_json::to_vec(&other).unwrap()).unwrap();

        let store = StateStore::new(&dir, Venue::Bybit, "BTCUSDT").unwrap();
        assert!(store.load_state().unwrap().is_none());

        let mine = BotState { capital: 7.0, ..Default::default() };
        fs::write(dir.join(LEGACY_STATE_FILE), serde_json::to_vec(&mine).unwrap()).unwrap();
        assert_eq!(store.load_state().unwrap().unwrap().capital, 7.0);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn managed_registry_survives_restart() {
        let dir = temp_data_dir("managed");
        {
            let store = StateStore::new(&dir, Venue::Okx, "BTCUSDT").unwrap();
            store.add_managed_position(managed("BTCUSDT")).unwrap();
            assert!(store.is_managed_position("BTC-USDT"));
        }
        let reopened = StateStore::new(&dir, Venue::Okx, "BTCUSDT").unwrap();
        assert!(reopened.is_managed_position("BTCUSDT"));
        assert!(reopened.remove_managed_position("BTCUSDT").unwrap());
        assert!(!reopened.is_managed_position("BTCUSDT"));
        assert!(!reopened.remove_managed_position("BTCUSDT").unwrap());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn saving_position_keeps_registry() {
        let dir = temp_data_dir("keep_registry");
        let store = StateStore::new(&dir, Venue::Bybit, "BTCUSDT").unwrap();
        store.add_managed_position(managed("BTCUSDT")).unwrap();
        let saved = store.save_state(BotState::default()).unwrap();
        assert_eq!(saved.managed_positions.len(), 1);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn history_is_capped_and_stamped() {
        let dir = temp_data_dir("history");
        let store = StateStore::new(&dir, Venue::Bybit, "BTCUSDT").unwrap().with_history_cap(3);
        for i in 0..5 {
            store.add_trade(trade(i as f64)).unwrap();
        }
        let trades = store.trades(100).unwrap();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].pnl_pct, 2.0);
        assert_eq!(trades[2].pnl_pct, 4.0);
        assert!(trades.iter().all(|t| t.saved_at.is_some()));

        assert_eq!(store.trades(1).unwrap()[0].pnl_pct, 4.0);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn trade_stats_summarize_history() {
        let stats = TradeStats::from_trades(&[trade(10.0), trade(-5.0), trade(3.0), trade(-2.0)]);
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.wins, 2);
        assert!((stats.win_rate - 50.0).abs() < 1e-9);
        assert!((stats.total_pnl_pct - 6.0).abs() < 1e-9);
        assert!((stats.avg_pnl_pct - 1.5).abs() < 1e-9);
        assert_eq!(stats.max_win_pct, 10.0);
        assert_eq!(stats.max_loss_pct, -5.0);
        assert_eq!(TradeStats::from_trades(&[]), TradeStats::default());
    }

    #[test]
    fn cache_honours_ttl_and_clear() {
        let dir = temp_data_dir("cache");
        let store = StateStore::new(&dir, Venue::Bybit, "BTCUSDT").unwrap();
        let signal = Signal::new(Side::Long, "W", Utc::now(), 12.0);
        store
            .save_signal_cache(&SignalCache {
                pending: vec![signal.clone()],
                consumed: Vec::new(),
            })
            .unwrap();

        let cache = store.load_cache().unwrap().unwrap();
        assert!(cache.get("last_update").is_some());
        assert_eq!(store.load_signal_cache().unwrap().pending, vec![signal]);

        let expired = StateStore::new(&dir, Venue::Bybit, "BTCUSDT")
            .unwrap()
            .with_cache_ttl(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(20));
        assert!(expired.load_cache().unwrap().is_none());

        store.clear_cache().unwrap();
        assert!(!store.cache_file().exists());
        assert_eq!(store.load_signal_cache().unwrap(), SignalCache::default());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn consumed_signals_survive_the_cache_and_empty_queue_removes_it() {
        let dir = temp_data_dir("consumed");
        let store = StateStore::new(&dir, Venue::Bybit, "BTCUSDT").unwrap();
        let used = Signal::new(Side::Short, "M", Utc::now(), 12.0);
        store
            .save_signal_cache(&SignalCache {
                pending: Vec::new(),
                consumed: vec![used.clone()],
            })
            .unwrap();
        assert!(store.cache_file().exists());
        assert_eq!(store.load_signal_cache().unwrap().consumed, vec![used]);

        store.save_signal_cache(&SignalCache::default()).unwrap();
        assert!(!store.cache_file().exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn trades_export_to_csv() {
        let dir = temp_data_dir("export");
        let store = StateStore::new(&dir, Venue::Bybit, "BTCUSDT").unwrap();
        store.add_trade(trade(1.0)).unwrap();
        store.add_trade(trade(-1.0)).unwrap();

        let out = dir.join("trades.csv");
        assert_eq!(store.export_trades_csv(&out).unwrap(), 2);
        let text = fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("symbol,entry_time"));
        assert_eq!(text.lines().count(), 3);
        fs::remove_dir_all(&dir).ok();
    }
}
