//! Per-pair trading orchestration
//!
//! Each (venue, symbol) runs three tasks that share one position lock and
//! one candle-buffer lock:
//! - stream consumer: applies stream events in arrival order and forwards closes
//! - scan loop: signal ingestion, entry checks, live management
//! - housekeeping: stream health, REST backfill, reconciliation, persistence

mod registry;

pub use registry::InstanceRegistry;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::candle_close::align_to_boundary;
use crate::config::AppConfig;
use crate::error::ExchangeError;
use crate::exchange::ExchangeAdapter;
use crate::executor::{ExecutionError, OrderExecutor};
use crate::notify::{DedupNotifier, Notifier, NotifyLevel};
use crate::persistence::{BotState, SignalCache, StateStore};
use crate::position::{ManageAction, PositionManager, SyncAction};
use crate::signals::{DirectionFilter, RsiGate, SignalQueue};
use crate::strategy::{SignalSource, StrategyMath};
use crate::stream::codec::codec_for;
use crate::stream::{CandleEvent, StreamEvent, StreamHandle, StreamHandler, StreamSettings};
use crate::time_sync::{LocalClock, ServerClock, TimeSync};
use crate::types::{Candle, ExitReason, Interval, Position};

/// Bars kept per interval in memory
pub const DEFAULT_BUFFER_LEN: usize = 500;

const EVENT_CHANNEL_LEN: usize = 256;

/// Bars pulled by a close check on ticker-only feeds
const CLOSE_CHECK_BARS: usize = 3;

/// Loop tuning for one pair
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub entry_interval: Interval,
    pub pattern_interval: Interval,
    pub direction: DirectionFilter,
    pub rsi_gate: RsiGate,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub entry_validity_hours: f64,
    pub signal_queue_len: usize,
    pub add_ratio: f64,
    pub scan_interval: Duration,
    pub error_backoff: Duration,
    pub housekeeping_interval: Duration,
    pub backfill_limit: usize,
    pub buffer_len: usize,
    /// Starting capital when no venue balance is used
    pub paper_balance: f64,
    pub dry_run: bool,
    pub stream: StreamSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            entry_interval: Interval::Min15,
            pattern_interval: Interval::Hour1,
            direction: DirectionFilter::Both,
            rsi_gate: RsiGate::default(),
            rsi_period: 14,
            atr_period: 14,
            entry_validity_hours: 12.0,
            signal_queue_len: 100,
            add_ratio: 0.5,
            scan_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            housekeeping_interval: Duration::from_secs(30),
            backfill_limit: 200,
            buffer_len: DEFAULT_BUFFER_LEN,
            paper_balance: 1000.0,
            dry_run: false,
            stream: StreamSettings::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            entry_interval: cfg.strategy.entry_interval,
            pattern_interval: cfg.strategy.pattern_interval,
            direction: cfg.bot.direction,
            rsi_gate: cfg.rsi_gate(),
            rsi_period: cfg.strategy.rsi_period,
            atr_period: cfg.strategy.atr_period,
            entry_validity_hours: cfg.strategy.entry_validity_hours,
            signal_queue_len: cfg.strategy.signal_queue_len,
            add_ratio: cfg.trading.add_ratio,
            scan_interval: Duration::from_secs(cfg.bot.scan_interval_secs.max(1)),
            error_backoff: Duration::from_secs(cfg.bot.error_backoff_secs),
            housekeeping_interval: Duration::from_secs(cfg.housekeeping.interval_secs.max(1)),
            backfill_limit: cfg.housekeeping.backfill_limit as usize,
            buffer_len: DEFAULT_BUFFER_LEN,
            paper_balance: cfg.trading.paper_balance,
            dry_run: cfg.bot.dry_run,
            stream: cfg.stream.clone(),
        }
    }
}

/// Collaborators injected into one pair
pub struct PairDeps {
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub store: Arc<StateStore>,
    pub notifier: Arc<dyn Notifier>,
    /// Connectivity alerts go through this one
    pub alerts: Arc<DedupNotifier>,
    pub math: Arc<dyn StrategyMath>,
    pub source: Arc<dyn SignalSource>,
    pub executor: OrderExecutor,
    pub manager: PositionManager,
    pub time_sync: Option<Arc<TimeSync>>,
}

/// Composition root for one (venue, symbol)
pub struct TradingOrchestrator {
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<StateStore>,
    notifier: Arc<dyn Notifier>,
    alerts: Arc<DedupNotifier>,
    math: Arc<dyn StrategyMath>,
    source: Arc<dyn SignalSource>,
    executor: OrderExecutor,
    manager: PositionManager,
    time_sync: Option<Arc<TimeSync>>,
    settings: OrchestratorSettings,
    /// The venue stream carries no candles, so closes are polled over REST
    rest_closes: bool,

    position: Mutex<Option<Position>>,
    capital: Mutex<f64>,
    entry_candles: Mutex<Vec<Candle>>,
    pattern_candles: Mutex<Vec<Candle>>,
    signals: Mutex<SignalQueue>,
    last_close: Mutex<Option<DateTime<Utc>>>,
    last_price: Mutex<Option<f64>>,

    halted: AtomicBool,
    stop: watch::Sender<bool>,
}

impl TradingOrchestrator {
    pub fn new(deps: PairDeps, settings: OrchestratorSettings) -> Self {
        let signals = SignalQueue::new(settings.signal_queue_len, settings.entry_validity_hours)
            .with_direction(settings.direction)
            .with_rsi_gate(settings.rsi_gate);
        let (stop, _) = watch::channel(false);
        let rest_closes = codec_for(deps.adapter.venue()).map_or(false, |codec| !codec.carries_candles());
        Self {
            adapter: deps.adapter,
            store: deps.store,
            notifier: deps.notifier,
            alerts: deps.alerts,
            math: deps.math,
            source: deps.source,
            executor: deps.executor,
            manager: deps.manager,
            time_sync: deps.time_sync,
            capital: Mutex::new(settings.paper_balance),
            settings,
            rest_closes,
            position: Mutex::new(None),
            entry_candles: Mutex::new(Vec::new()),
            pattern_candles: Mutex::new(Vec::new()),
            signals: Mutex::new(signals),
            last_close: Mutex::new(None),
            last_price: Mutex::new(None),
            halted: AtomicBool::new(false),
            stop,
        }
    }

    pub fn symbol(&self) -> String {
        self.adapter.symbol()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub async fn position(&self) -> Option<Position> {
        self.position.lock().await.clone()
    }

    pub async fn capital(&self) -> f64 {
        *self.capital.lock().await
    }

    pub async fn pending_signals(&self) -> usize {
        self.signals.lock().await.valid_pending(Utc::now()).len()
    }

    pub async fn entry_candles(&self) -> Vec<Candle> {
        self.entry_candles.lock().await.clone()
    }

    // ========== Startup ==========

    /// Connect, restore persisted state and pending signals, backfill the
    /// candle buffers over REST, then reconcile once.
    pub async fn bootstrap(&self) -> Result<()> {
        let venue = self.adapter.venue();
        let symbol = self.symbol();

        if !self.settings.dry_run {
            self.adapter
                .connect()
                .await
                .with_context(|| format!("{venue} {symbol}: connect failed"))?;
        }

        if let Some(state) = self.store.load_state()? {
            if state.capital > 0.0 {
                *self.capital.lock().await = state.capital;
            }
            if let Some(position) = state.position.filter(|p| p.is_open()) {
                info!(
                    venue = %venue,
                    symbol = %symbol,
                    side = %position.side,
                    entry = position.entry_price,
                    stop_loss = position.stop_loss,
                    "📂 Position restored from state"
                );
                *self.position.lock().await = Some(position);
            }
        }

        match self.store.load_signal_cache() {
            Ok(cache) if !cache.pending.is_empty() || !cache.consumed.is_empty() => {
                let consumed = cache.consumed.len();
                let kept = self
                    .signals
                    .lock()
                    .await
                    .restore(cache.pending, cache.consumed, Utc::now());
                info!(venue = %venue, symbol = %symbol, kept, consumed, "Pending signals restored from cache");
            }
            Ok(_) => {}
            Err(e) => warn!(venue = %venue, symbol = %symbol, error = %e, "Ignoring unreadable signal cache"),
        }

        if let Err(e) = self.backfill(self.settings.backfill_limit).await {
            warn!(venue = %venue, symbol = %symbol, error = %e, "Initial entry-interval backfill failed");
        }
        let interval = self.settings.entry_interval;
        let now = Utc::now();
        let last_closed = self
            .entry_candles
            .lock()
            .await
            .iter()
            .rev()
            .find(|c| c.timestamp + interval.duration() <= now)
            .map(|c| c.timestamp);
        *self.last_close.lock().await = last_closed;
        if let Err(e) = self.refresh_pattern_candles().await {
            warn!(venue = %venue, symbol = %symbol, error = %e, "Initial pattern-interval backfill failed");
        }

        self.reconcile().await;
        self.persist().await;
        info!(venue = %venue, symbol = %symbol, "🚀 Pair ready");
        Ok(())
    }

    // ========== Candle buffer ==========

    /// Apply one stream candle. Returns the bar when it just closed.
    pub async fn ingest_candle(&self, event: CandleEvent) -> Option<Candle> {
        if let Err(e) = event.candle.validate() {
            warn!(symbol = %self.symbol(), error = %e, "Dropping invalid candle");
            return None;
        }
        *self.last_price.lock().await = Some(event.candle.close);
        let mut buffer = self.entry_candles.lock().await;
        upsert_candle(&mut buffer, event.candle.clone(), self.settings.buffer_len);
        event.is_close.then_some(event.candle)
    }

    /// Pull recent bars over REST into the buffer. Returns bars that closed
    /// since the last processed close.
    pub async fn backfill(&self, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let interval = self.settings.entry_interval;
        let bars = self.adapter.get_klines(interval, limit).await?;
        let now = Utc::now();
        let last_close = *self.last_close.lock().await;

        let mut closed = Vec::new();
        let mut buffer = self.entry_candles.lock().await;
        for bar in bars {
            if bar.validate().is_err() {
                continue;
            }
            let is_closed = bar.timestamp + interval.duration() <= now;
            if is_closed && last_close.map_or(false, |t| bar.timestamp > t) {
                closed.push(bar.clone());
            }
            upsert_candle(&mut buffer, bar, self.settings.buffer_len);
        }
        debug!(symbol = %self.symbol(), bars = buffer.len(), new_closes = closed.len(), "Backfill applied");
        Ok(closed)
    }

    async fn refresh_pattern_candles(&self) -> Result<(), ExchangeError> {
        let interval = self.settings.pattern_interval;
        let now = Utc::now();
        let bars: Vec<Candle> = self
            .adapter
            .get_klines(interval, self.settings.backfill_limit)
            .await?
            .into_iter()
            .filter(|c| c.validate().is_ok() && c.timestamp + interval.duration() <= now)
            .collect();
        *self.pattern_candles.lock().await = bars;
        Ok(())
    }

    // ========== Scan ==========

    /// Handle a closed entry-interval bar: pattern ingestion on pattern
    /// boundaries, then entry or live management. A bar at or before the
    /// last processed close is ignored.
    pub async fn on_entry_close(&self, candle: &Candle) -> Result<()> {
        {
            let mut last = self.last_close.lock().await;
            if last.map_or(false, |t| candle.timestamp <= t) {
                debug!(symbol = %self.symbol(), at = %candle.timestamp, "Close already processed");
                return Ok(());
            }
            *last = Some(candle.timestamp);
        }
        if self.is_halted() {
            return Ok(());
        }

        let bar_end = candle.timestamp + self.settings.entry_interval.duration();
        if align_to_boundary(self.settings.pattern_interval, bar_end) == bar_end {
            self.ingest_patterns().await?;
        }

        let mut position = self.position.lock().await;
        if position.is_some() {
            self.manage(&mut position, candle).await
        } else {
            self.try_entry(&mut position, candle).await
        }
    }

    /// Per-tick stop/trailing check against the forming bar.
    pub async fn on_tick(&self) -> Result<()> {
        if self.is_halted() {
            return Ok(());
        }
        let Some(forming) = self.entry_candles.lock().await.last().cloned() else {
            return Ok(());
        };
        let mut position = self.position.lock().await;
        if position.is_none() {
            return Ok(());
        }
        self.manage(&mut position, &forming).await
    }

    async fn ingest_patterns(&self) -> Result<()> {
        self.refresh_pattern_candles().await?;
        let bars = self.pattern_candles.lock().await.clone();
        let Some(last_bar) = bars.last() else {
            return Ok(());
        };
        let found = self.source.extract_signals(&bars, self.settings.entry_validity_hours);
        let mut signals = self.signals.lock().await;
        let added = signals.ingest(found, last_bar.timestamp);
        if added > 0 {
            info!(symbol = %self.symbol(), added, summary = %signals.summary(Utc::now()), "🔍 New pattern signals");
            self.cache_signals(&signals);
        }
        Ok(())
    }

    async fn try_entry(&self, slot: &mut Option<Position>, candle: &Candle) -> Result<()> {
        let history = self.closed_history(candle).await;
        let rsi = self.math.rsi(&history, self.settings.rsi_period).unwrap_or(50.0);
        let trend = {
            let pattern = self.pattern_candles.lock().await;
            self.math.trend(&pattern)
        };
        let conditions = self.signals.lock().await.trading_conditions(rsi, trend, Utc::now());
        if !conditions.ready {
            debug!(
                symbol = %self.symbol(),
                rsi,
                pending_long = conditions.pending_long,
                pending_short = conditions.pending_short,
                "No entry"
            );
            return Ok(());
        }

        let atr = self.math.atr(&history, self.settings.atr_period);
        let Some(plan) = self.manager.check_entry_live(&conditions, candle, atr) else {
            return Ok(());
        };

        let price = if self.settings.dry_run {
            candle.close
        } else {
            match self.adapter.get_current_price().await {
                Ok(price) => price,
                Err(e) => {
                    let fallback = self.last_price.lock().await.unwrap_or(candle.close);
                    warn!(symbol = %self.symbol(), error = %e, fallback, "Price fetch failed, using last seen price");
                    fallback
                }
            }
        };
        let balance = if self.settings.dry_run {
            *self.capital.lock().await
        } else {
            self.adapter.get_balance().await?
        };

        match self.executor.execute_entry(&plan, slot.as_ref(), price, balance).await {
            Ok(position) => {
                *slot = Some(position);
                {
                    let mut signals = self.signals.lock().await;
                    signals.clear();
                    self.cache_signals(&signals);
                }
                self.persist_locked(slot.as_ref()).await;
                Ok(())
            }
            Err(ExecutionError::BelowMinimum { notional, minimum }) => {
                warn!(symbol = %self.symbol(), notional, minimum, "Entry skipped, order too small");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn manage(&self, slot: &mut Option<Position>, candle: &Candle) -> Result<()> {
        let Some(position) = slot.as_mut() else {
            return Ok(());
        };
        let history = self.closed_history(candle).await;
        let Some(action) = self.manager.manage_live(position, candle, &history) else {
            return Ok(());
        };

        match action {
            ManageAction::Close { reason, price } => self.close(slot, price, reason).await,
            ManageAction::UpdateSl { new_sl } => {
                if let Err(e) = self.manager.update_trailing_sl(position, new_sl).await {
                    error!(symbol = %position.symbol, new_sl, error = %e, "Trailing stop not moved, keeping current stop");
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                } else {
                    self.persist_locked(slot.as_ref()).await;
                }
                Ok(())
            }
            ManageAction::Add { price, .. } => {
                let outcome = self.executor.execute_add(position, price, self.settings.add_ratio).await?;
                self.manager.apply_add(position, &outcome);
                self.persist_locked(slot.as_ref()).await;
                Ok(())
            }
        }
    }

    async fn close(&self, slot: &mut Option<Position>, price: f64, reason: ExitReason) -> Result<()> {
        let Some(position) = slot.as_ref() else {
            return Ok(());
        };
        let trade = self.executor.execute_close(position, price, reason).await?;
        *slot = None;
        {
            let mut capital = self.capital.lock().await;
            *capital += trade.pnl_usd;
        }
        self.persist_locked(None).await;
        Ok(())
    }

    async fn closed_history(&self, through: &Candle) -> Vec<Candle> {
        let buffer = self.entry_candles.lock().await;
        buffer
            .iter()
            .filter(|c| c.timestamp <= through.timestamp)
            .cloned()
            .collect()
    }

    // ========== Housekeeping ==========

    /// One housekeeping pass. `stream_healthy` is `None` when no stream runs.
    ///
    /// Without a healthy stream the buffer is backfilled over REST. Ticker-only
    /// feeds get a short REST close check on every pass even when healthy,
    /// since their boundary detection depends on a tick landing in the window.
    pub async fn housekeeping(&self, stream_healthy: Option<bool>) -> Result<Vec<Candle>> {
        let venue = self.adapter.venue();
        let symbol = self.symbol();

        if let Some(time) = &self.time_sync {
            if let Err(e) = time.sync(false).await {
                debug!(venue = %venue, error = %e, "Time sync skipped");
            }
        }

        let mut closes = Vec::new();
        if stream_healthy != Some(true) {
            if stream_healthy == Some(false) {
                self.alerts
                    .notify(
                        NotifyLevel::Warning,
                        "Stream unhealthy",
                        &format!("{symbol}: no stream data, falling back to REST"),
                        venue,
                    )
                    .await;
            }
            closes = self.backfill(self.settings.backfill_limit).await?;
        } else if self.rest_closes {
            closes = self.backfill(CLOSE_CHECK_BARS).await?;
        }

        {
            let mut signals = self.signals.lock().await;
            let before = signals.snapshot().len();
            let remaining = signals.clear_expired(Utc::now());
            if remaining < before {
                debug!(symbol = %symbol, expired = before - remaining, remaining, "Expired signals dropped");
            }
        }

        self.reconcile().await;
        self.persist().await;
        Ok(closes)
    }

    /// Align local position state with the venue.
    pub async fn reconcile(&self) {
        let mut slot = self.position.lock().await;
        let outcome = self.manager.sync_with_exchange(slot.as_ref()).await;
        match outcome.action {
            SyncAction::Restore(row) => {
                *slot = Some(self.manager.restore_position(&row));
                self.persist_locked(slot.as_ref()).await;
            }
            SyncAction::Clear => {
                let symbol = self.symbol();
                if let Some(gone) = slot.take().filter(|_| !self.settings.dry_run) {
                    // most likely the resting stop filled between checks
                    let trade = self.executor.record_external_close(&gone, gone.stop_loss).await;
                    *self.capital.lock().await += trade.pnl_usd;
                }
                if let Err(e) = self.store.remove_managed_position(&symbol) {
                    warn!(symbol = %symbol, error = %e, "Failed to drop managed record");
                }
                self.persist_locked(None).await;
            }
            SyncAction::None => {}
        }
    }

    /// Persist position, capital and pending signals.
    pub async fn persist(&self) {
        let slot = self.position.lock().await;
        self.persist_locked(slot.as_ref()).await;
        let signals = self.signals.lock().await;
        self.cache_signals(&signals);
    }

    fn cache_signals(&self, signals: &SignalQueue) {
        let cache = SignalCache {
            pending: signals.snapshot(),
            consumed: signals.consumed(),
        };
        if let Err(e) = self.store.save_signal_cache(&cache) {
            warn!(symbol = %self.symbol(), error = %e, "Failed to cache pending signals");
        }
    }

    /// Log the trade summary and refresh the CSV export of the history.
    pub fn report_history(&self) {
        let symbol = self.symbol();
        let stats = match self.store.trade_stats() {
            Ok(stats) => stats,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Trade history unreadable, no summary");
                return;
            }
        };
        if stats.total_trades == 0 {
            return;
        }
        info!(
            symbol = %symbol,
            trades = stats.total_trades,
            win_rate = format!("{:.1}", stats.win_rate),
            total_pnl_pct = format!("{:.2}", stats.total_pnl_pct),
            total_pnl_usd = format!("{:.2}", stats.total_pnl_usd),
            max_loss_pct = format!("{:.2}", stats.max_loss_pct),
            "📊 Trade summary"
        );
        let path = self.store.trades_csv_file();
        match self.store.export_trades_csv(path) {
            Ok(rows) => debug!(symbol = %symbol, rows, file = %path.display(), "Trade history exported"),
            Err(e) => warn!(symbol = %symbol, error = %e, "Trade CSV export failed"),
        }
    }

    async fn persist_locked(&self, position: Option<&Position>) {
        let state = BotState {
            position: position.cloned(),
            capital: *self.capital.lock().await,
            ..BotState::default()
        };
        if let Err(e) = self.store.save_state(state) {
            error!(symbol = %self.symbol(), error = %e, "Failed to save state");
        }
    }

    // ========== Errors ==========

    /// Log an iteration failure. Fatal errors halt the pair; everything else
    /// waits `error_backoff` before the loop continues.
    pub async fn handle_error(&self, task: &str, e: anyhow::Error) {
        let venue = self.adapter.venue();
        let symbol = self.symbol();
        if is_fatal(&e) {
            error!(venue = %venue, symbol = %symbol, task, error = %e, "⛔ Fatal error, halting pair");
            self.halt();
            self.notifier
                .notify(
                    NotifyLevel::Critical,
                    "Trading halted",
                    &format!("{symbol}: {e:#}"),
                    venue,
                )
                .await;
            return;
        }
        error!(venue = %venue, symbol = %symbol, task, error = %format!("{e:#}"), "Loop iteration failed");
        tokio::time::sleep(self.settings.error_backoff).await;
    }

    /// Stop all loops of this pair.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);
    }

    // ========== Tasks ==========

    /// Run until `shutdown` fires or the pair halts.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.bootstrap().await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_LEN);
        let (close_tx, close_rx) = mpsc::channel(EVENT_CHANNEL_LEN);

        let stream = self.start_stream(events_tx);
        let tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(Arc::clone(&self).consume_stream(events_rx, close_tx.clone())),
            tokio::spawn(Arc::clone(&self).scan_loop(close_rx)),
            tokio::spawn(Arc::clone(&self).housekeeping_loop(stream.clone(), close_tx)),
        ];

        let mut stop_rx = self.stop.subscribe();
        if !*stop_rx.borrow() {
            tokio::select! {
                _ = shutdown.changed() => info!(symbol = %self.symbol(), "Shutdown requested"),
                _ = stop_rx.changed() => warn!(symbol = %self.symbol(), "Pair stopped"),
            }
        }
        self.stop.send_replace(true);

        if let Some(stream) = stream {
            stream.stop().await;
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(symbol = %self.symbol(), error = %e, "Task ended abnormally");
            }
        }
        self.persist().await;
        self.report_history();
        info!(symbol = %self.symbol(), "👋 Pair shut down");
        Ok(())
    }

    fn start_stream(&self, events: mpsc::Sender<StreamEvent>) -> Option<Arc<StreamHandle>> {
        let venue = self.adapter.venue();
        let clock: Arc<dyn ServerClock> = match &self.time_sync {
            Some(time) => Arc::clone(time) as Arc<dyn ServerClock>,
            None => Arc::new(LocalClock),
        };
        match StreamHandler::new(venue, &self.symbol(), self.settings.entry_interval, self.settings.stream.clone()) {
            Ok(handler) => Some(Arc::new(handler.with_clock(clock).spawn(events))),
            Err(e) => {
                warn!(venue = %venue, error = %e, "No stream for venue, polling over REST");
                None
            }
        }
    }

    async fn consume_stream(self: Arc<Self>, mut events: mpsc::Receiver<StreamEvent>, closes: mpsc::Sender<Candle>) {
        let mut stop = self.stop.subscribe();
        let venue = self.adapter.venue();
        loop {
            if *stop.borrow() {
                break;
            }
            let event = tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                StreamEvent::Candle(candle) => {
                    if let Some(closed) = self.ingest_candle(candle).await {
                        let _ = closes.send(closed).await;
                    }
                }
                StreamEvent::Price { price, boundary_close, .. } => {
                    *self.last_price.lock().await = Some(price);
                    if boundary_close {
                        // ticker-only feeds: the closed bar comes from REST, off this loop
                        tokio::spawn(Arc::clone(&self).fetch_boundary_close(closes.clone()));
                    }
                }
                StreamEvent::Connected => info!(venue = %venue, symbol = %self.symbol(), "🔌 Stream connected"),
                StreamEvent::Disconnected(reason) => {
                    self.alerts
                        .notify(NotifyLevel::Warning, "Stream disconnected", &reason, venue)
                        .await;
                }
                StreamEvent::Stopped(reason) => {
                    self.alerts
                        .notify(
                            NotifyLevel::Error,
                            "Stream stopped",
                            &format!("{reason}; continuing on REST polling"),
                            venue,
                        )
                        .await;
                }
            }
        }
        debug!(symbol = %self.symbol(), "Stream consumer finished");
    }

    async fn fetch_boundary_close(self: Arc<Self>, closes: mpsc::Sender<Candle>) {
        match self.backfill(CLOSE_CHECK_BARS).await {
            Ok(bars) => {
                for bar in bars {
                    let _ = closes.send(bar).await;
                }
            }
            Err(e) => warn!(venue = %self.adapter.venue(), symbol = %self.symbol(), error = %e, "Close backfill failed"),
        }
    }

    async fn scan_loop(self: Arc<Self>, mut closes: mpsc::Receiver<Candle>) {
        let mut stop = self.stop.subscribe();
        let mut tick = tokio::time::interval(self.settings.scan_interval);
        loop {
            if *stop.borrow() {
                break;
            }
            let result = tokio::select! {
                _ = stop.changed() => break,
                closed = closes.recv() => match closed {
                    Some(candle) => self.on_entry_close(&candle).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            };
            if let Err(e) = result {
                self.handle_error("scan", e).await;
            }
        }
        debug!(symbol = %self.symbol(), "Scan loop finished");
    }

    async fn housekeeping_loop(self: Arc<Self>, stream: Option<Arc<StreamHandle>>, closes: mpsc::Sender<Candle>) {
        let mut stop = self.stop.subscribe();
        let mut tick = tokio::time::interval(self.settings.housekeeping_interval);
        tick.tick().await;
        let health_timeout = Duration::from_secs(self.settings.stream.health_timeout_secs);
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = tick.tick() => {}
            }
            let healthy = stream.as_ref().map(|s| s.is_healthy(health_timeout));
            match self.housekeeping(healthy).await {
                Ok(bars) => {
                    for bar in bars {
                        let _ = closes.send(bar).await;
                    }
                }
                Err(e) => self.handle_error("housekeeping", e).await,
            }
        }
        debug!(symbol = %self.symbol(), "Housekeeping finished");
    }
}

/// Insert or replace `candle` keeping the buffer time-ordered and at most
/// `cap` long.
pub fn upsert_candle(buffer: &mut Vec<Candle>, candle: Candle, cap: usize) {
    match buffer.binary_search_by(|c| c.timestamp.cmp(&candle.timestamp)) {
        Ok(i) => buffer[i] = candle,
        Err(i) => buffer.insert(i, candle),
    }
    if buffer.len() > cap {
        let excess = buffer.len() - cap;
        buffer.drain(..excess);
    }
}

/// Auth failures anywhere in the chain stop the pair.
pub fn is_fatal(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<ExchangeError>()
            .map(ExchangeError::is_fatal)
            .or_else(|| cause.downcast_ref::<ExecutionError>().map(ExecutionError::is_fatal))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(minute: u32, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, minute, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
            confirmed: None,
        }
    }

    #[test]
    fn upsert_keeps_order_and_cap() {
        let mut buf = Vec::new();
        upsert_candle(&mut buf, bar(30, 3.0), 3);
        upsert_candle(&mut buf, bar(0, 1.0), 3);
        upsert_candle(&mut buf, bar(15, 2.0), 3);
        assert_eq!(buf.iter().map(|c| c.close).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);

        upsert_candle(&mut buf, bar(30, 3.5), 3);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf[2].close, 3.5);

        upsert_candle(&mut buf, bar(45, 4.0), 3);
        assert_eq!(buf.first().map(|c| c.close), Some(2.0));
    }

    #[test]
    fn auth_errors_are_fatal_through_context() {
        let e = anyhow::Error::new(ExchangeError::Auth("invalid key".into())).context("get_balance");
        assert!(is_fatal(&e));

        let e = anyhow::Error::new(ExecutionError::Exchange(ExchangeError::Auth("x".into())));
        assert!(is_fatal(&e));

        let e = anyhow::Error::new(ExchangeError::transient("timeout"));
        assert!(!is_fatal(&e));
    }
}
