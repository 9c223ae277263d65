//! Order execution: entry, close and pyramiding add
//!
//! The executor is the only component that sends order-mutating calls. It
//! never reports a close as done unless the venue confirmed it; the caller's
//! position is left untouched on every failure path.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::ExchangeError;
use crate::exchange::retry::{retry_order, Backoff, DEFAULT_MAX_RETRIES};
use crate::exchange::ExchangeAdapter;
use crate::notify::{NotifyLevel, Notifier};
use crate::persistence::{StateStore, TradeRecord};
use crate::types::{canonical_symbol, ExitReason, Fill, ManagedPositionRecord, OrderRequest, OrderResult, Position, Side};

/// Fills older than this before entry are never matched to a close.
const FILL_MATCH_SLACK_MS: i64 = 5_000;
const FILL_LOOKUP_LIMIT: usize = 5;

/// Sizing, fee and retry parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub leverage: u32,
    pub invest_ratio: f64,
    /// Minimum notional in quote currency
    pub min_order_value: f64,
    pub min_qty: f64,
    pub fee_rate: f64,
    pub slippage: f64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub close_fill_grace: Duration,
    pub dry_run: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            leverage: 10,
            invest_ratio: 1.0,
            min_order_value: 10.0,
            min_qty: 0.001,
            fee_rate: 0.00055,
            slippage: 0.0006,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(1),
            close_fill_grace: Duration::from_secs(1),
            dry_run: false,
        }
    }
}

impl ExecutorSettings {
    /// Per-side cost rate used when the venue does not report fees
    pub fn cost_per_side(&self) -> f64 {
        self.fee_rate + self.slippage
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("position already open on {0}")]
    PositionExists(String),

    #[error("cannot size order: {0}")]
    InvalidInput(String),

    #[error("order value {notional:.2} below minimum {minimum:.2}")]
    BelowMinimum { notional: f64, minimum: f64 },

    #[error("quantity {qty} below minimum {minimum}")]
    QtyTooSmall { qty: f64, minimum: f64 },

    #[error("leverage {0}x was not applied")]
    LeverageNotSet(u32),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exchange(e) if e.is_fatal())
    }
}

/// Entry decided by the position manager
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub atr: f64,
    pub trail_start_r: f64,
    pub trail_dist_r: f64,
    pub trail_start_price: f64,
    pub trail_distance: f64,
}

/// Executed pyramiding add
#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub order_id: Option<String>,
}

/// `(pnl_pct, pnl_quote)` of a round trip.
///
/// `pnl_pct` is the leveraged return on margin; `pnl_quote` deducts `fee`
/// on both the entry and the exit notional.
pub fn compute_pnl(side: Side, entry: f64, exit: f64, size: f64, leverage: f64, fee: f64) -> (f64, f64) {
    if entry <= 0.0 {
        return (0.0, 0.0);
    }
    let lev = if leverage > 0.0 { leverage } else { 1.0 };
    let pnl_pct = side.sign() * (exit - entry) / entry * lev * 100.0;
    let gross = side.sign() * size * (exit - entry);
    let fees = size * entry * fee + size * exit * fee;
    (pnl_pct, gross - fees)
}

/// `{SYMBOL}_{SIDE}_{epochMillis}`
pub fn client_order_id(symbol: &str, side: Side, at: DateTime<Utc>) -> String {
    format!("{symbol}_{side}_{}", at.timestamp_millis())
}

pub struct OrderExecutor {
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<StateStore>,
    notifier: Arc<dyn Notifier>,
    settings: ExecutorSettings,
}

impl OrderExecutor {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<StateStore>,
        notifier: Arc<dyn Notifier>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            adapter,
            store,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn is_dry_run(&self) -> bool {
        self.settings.dry_run
    }

    fn backoff(&self) -> Backoff {
        Backoff::Fixed(self.settings.retry_delay)
    }

    /// Order quantity for `balance` at `price`, after the minimum checks.
    pub fn size_order(&self, price: f64, balance: f64) -> Result<f64, ExecutionError> {
        if !(balance > 0.0) {
            return Err(ExecutionError::InvalidInput(format!("balance {balance}")));
        }
        if !(price > 0.0) || !price.is_finite() {
            return Err(ExecutionError::InvalidInput(format!("price {price}")));
        }
        let s = &self.settings;
        let qty = balance * s.invest_ratio * f64::from(s.leverage.max(1)) / price;
        let notional = qty * price;
        if notional < s.min_order_value {
            return Err(ExecutionError::BelowMinimum {
                notional,
                minimum: s.min_order_value,
            });
        }
        if qty < s.min_qty {
            return Err(ExecutionError::QtyTooSmall { qty, minimum: s.min_qty });
        }
        Ok(qty)
    }

    // ========== Entry ==========

    /// Open a position for `plan`.
    ///
    /// Refuses when a position is already held, without touching the venue.
    /// Leverage must be confirmed before the order goes out. On success the
    /// position is registered as managed.
    pub async fn execute_entry(
        &self,
        plan: &EntryPlan,
        current: Option<&Position>,
        price: f64,
        balance: f64,
    ) -> Result<Position, ExecutionError> {
        let symbol = self.adapter.symbol();
        if current.is_some() {
            warn!(symbol = %symbol, side = %plan.side, "Entry refused, position already open");
            return Err(ExecutionError::PositionExists(symbol));
        }
        let qty = self.size_order(price, balance)?;

        if !self.settings.dry_run {
            let leverage = self.settings.leverage;
            match self.adapter.set_leverage(leverage).await {
                Ok(true) => {}
                Ok(false) => return Err(ExecutionError::LeverageNotSet(leverage)),
                Err(e) => {
                    error!(symbol = %symbol, leverage, error = %e, "Leverage setup failed, entry aborted");
                    return Err(e.into());
                }
            }
        }

        let now = Utc::now();
        let cid = client_order_id(&symbol, plan.side, now);
        let mut request = OrderRequest::market(plan.side, qty, cid.clone()).with_stop_loss(plan.stop_loss);
        if let Some(tp) = plan.take_profit {
            request = request.with_take_profit(tp);
        }

        let result = if self.settings.dry_run {
            info!(symbol = %symbol, side = %plan.side, qty, price, "[DRY-RUN] Synthesized entry fill");
            OrderResult::filled(None, price, qty).with_client_id(cid.clone())
        } else {
            self.place_entry(&request, &symbol).await?
        };

        let fill_price = result.filled_price.filter(|p| *p > 0.0).unwrap_or(price);
        let fill_qty = result.filled_qty.filter(|q| *q > 0.0).unwrap_or(qty);
        let mut position = Position::open(
            &symbol,
            plan.side,
            fill_price,
            fill_qty,
            plan.stop_loss,
            plan.trail_start_r,
            plan.trail_dist_r,
        );
        position.entry_time = now;
        position.order_id = result.order_id.clone();
        position.client_order_id = Some(cid.clone());

        let record = ManagedPositionRecord {
            symbol: symbol.clone(),
            order_id: result.order_id.clone(),
            client_order_id: cid,
            entry_price: fill_price,
            side: plan.side,
            size: fill_qty,
            created_at: now,
        };
        if let Err(e) = self.store.add_managed_position(record) {
            error!(symbol = %symbol, error = %e, "Failed to persist managed position record");
        }

        let arrow = if plan.side == Side::Long { "📈" } else { "📉" };
        info!(
            symbol = %symbol,
            side = %plan.side,
            entry = fill_price,
            size = fill_qty,
            stop_loss = plan.stop_loss,
            "{arrow} Position opened"
        );
        self.notifier
            .notify(
                NotifyLevel::Info,
                "Entry",
                &format!(
                    "{} {} @ {fill_price:.4} size {fill_qty:.6} SL {:.4}",
                    symbol, plan.side, plan.stop_loss
                ),
                self.adapter.venue(),
            )
            .await;
        Ok(position)
    }

    /// Send the entry order, resending only while the venue shows nothing.
    ///
    /// A timed-out send may still have filled, so before each resend the
    /// venue position for this side is looked up and, when open, taken as
    /// the fill. A duplicate client-id refusal after a timed-out send counts
    /// as a fill too. Failures are reported here; an entry whose outcome is
    /// unknown escalates as critical.
    async fn place_entry(&self, request: &OrderRequest, symbol: &str) -> Result<OrderResult, ExchangeError> {
        let side = request.side;
        let max_attempts = self.settings.max_retries.max(1);
        let mut unconfirmed = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let e = match self
                .adapter
                .place_market_order(request.clone())
                .await
                .and_then(OrderResult::into_result)
            {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if unconfirmed && e.is_duplicate_order() {
                warn!(symbol, client_order_id = %request.client_order_id, error = %e, "Resend refused as duplicate, earlier send was accepted");
                let result = match self.venue_entry(side).await {
                    Ok(Some(result)) => result,
                    _ => OrderResult::ok(None),
                };
                self.protect_adopted(request, symbol).await;
                return Ok(result.with_client_id(request.client_order_id.clone()));
            }
            if !e.is_retryable() {
                if unconfirmed && !matches!(e, ExchangeError::ProtectionFailed { .. }) {
                    self.report_entry_unknown(symbol, side, &e).await;
                } else {
                    self.report_entry_failure(symbol, side, &e).await;
                }
                return Err(e);
            }

            unconfirmed = true;
            match self.venue_entry(side).await {
                Ok(Some(result)) => {
                    warn!(symbol, side = %side, attempt, error = %e, "Entry send timed out but the venue shows the position, treating as filled");
                    self.protect_adopted(request, symbol).await;
                    return Ok(result.with_client_id(request.client_order_id.clone()));
                }
                Ok(None) if attempt < max_attempts => {
                    warn!(symbol, side = %side, attempt, max_attempts, error = %e, "Entry send failed and no position on venue, resending");
                    tokio::time::sleep(self.backoff().delay(attempt)).await;
                }
                Ok(None) => {
                    self.report_entry_failure(symbol, side, &e).await;
                    return Err(e);
                }
                Err(lookup) => {
                    error!(symbol, side = %side, error = %e, lookup_error = %lookup, "Entry send failed and position lookup failed, not resending");
                    self.report_entry_unknown(symbol, side, &e).await;
                    return Err(e);
                }
            }
        }
    }

    /// A lost send may never have reached its stop-loss step.
    async fn protect_adopted(&self, request: &OrderRequest, symbol: &str) {
        let Some(stop_loss) = request.stop_loss else {
            return;
        };
        if let Err(e) = self
            .adapter
            .update_stop_loss(stop_loss)
            .await
            .and_then(OrderResult::into_result)
        {
            error!(symbol, stop_loss, error = %e, "Stop not confirmed on adopted entry, local stop checks still apply");
        }
    }

    /// Open venue position on `side` for this symbol, as a fill.
    async fn venue_entry(&self, side: Side) -> Result<Option<OrderResult>, ExchangeError> {
        let symbol = canonical_symbol(&self.adapter.symbol());
        let rows = self.adapter.get_positions().await?;
        Ok(rows
            .into_iter()
            .find(|p| p.side == side && p.size > 0.0 && canonical_symbol(&p.symbol) == symbol)
            .map(|p| OrderResult::filled(None, p.entry_price, p.size)))
    }

    async fn report_entry_unknown(&self, symbol: &str, side: Side, e: &ExchangeError) {
        error!(symbol = %symbol, side = %side, error = %e, "🚨 Entry outcome unknown, check the venue");
        self.notifier
            .notify(
                NotifyLevel::Critical,
                "Entry state unknown",
                &format!("{symbol} {side}: entry send timed out and could not be confirmed ({e}); position may be open"),
                self.adapter.venue(),
            )
            .await;
    }

    async fn report_entry_failure(&self, symbol: &str, side: Side, e: &ExchangeError) {
        let venue = self.adapter.venue();
        match e {
            ExchangeError::ProtectionFailed { closed: true, reason } => {
                self.notifier
                    .notify(
                        NotifyLevel::Critical,
                        "SL protection failed",
                        &format!("{symbol} {side}: stop-loss rejected ({reason}); entry was emergency closed"),
                        venue,
                    )
                    .await;
            }
            ExchangeError::ProtectionFailed { closed: false, reason } => {
                self.notifier
                    .notify(
                        NotifyLevel::Critical,
                        "SL protection failed",
                        &format!("{symbol} {side}: stop-loss rejected ({reason}); EMERGENCY CLOSE FAILED, position may be open"),
                        venue,
                    )
                    .await;
            }
            other => {
                error!(symbol = %symbol, side = %side, error = %other, "Entry failed");
                self.notifier
                    .notify(NotifyLevel::Error, "Entry failed", &format!("{symbol} {side}: {other}"), venue)
                    .await;
            }
        }
    }

    // ========== Close ==========

    /// Close `position` and record the trade.
    ///
    /// On failure nothing is mutated or persisted; the caller keeps its
    /// position and must not clear it.
    pub async fn execute_close(
        &self,
        position: &Position,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<TradeRecord, ExecutionError> {
        let symbol = self.adapter.symbol();
        info!(symbol = %symbol, side = %position.side, exit_price, reason = %reason, "🔴 Closing position");

        let mut exit = exit_price;
        let mut venue_fill = None;
        let mut exchange_order_id = None;

        if self.settings.dry_run {
            info!(symbol = %symbol, "[DRY-RUN] Synthesized close");
        } else {
            let closed = retry_order("close_position", self.settings.max_retries, self.backoff(), || {
                self.adapter.close_position()
            })
            .await;
            let result = match closed {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        symbol = %symbol,
                        side = %position.side,
                        size = position.size,
                        error = %e,
                        "🚨 Close failed, position is still open"
                    );
                    self.notifier
                        .notify(
                            NotifyLevel::Critical,
                            "Close failed",
                            &format!("{symbol} {} size {} still open: {e}", position.side, position.size),
                            self.adapter.venue(),
                        )
                        .await;
                    return Err(e.into());
                }
            };
            if let Some(p) = result.filled_price.filter(|p| *p > 0.0) {
                exit = p;
            }
            exchange_order_id = result.order_id.clone();
            venue_fill = self.find_close_fill(position).await;
        }

        let record = self.trade_record(position, exit, venue_fill, exchange_order_id, reason);
        Ok(self.finish_close(position, record, reason).await)
    }

    /// Book a position the venue closed on its own, normally its resting
    /// stop. The venue fill is used when one shows up; otherwise the trade is
    /// priced at `fallback_exit`. No order is sent.
    pub async fn record_external_close(&self, position: &Position, fallback_exit: f64) -> TradeRecord {
        let reason = ExitReason::Reconciled;
        let venue_fill = self.find_close_fill(position).await;
        warn!(
            symbol = %position.symbol,
            side = %position.side,
            venue_fill = venue_fill.is_some(),
            "Position closed on the venue, recording it"
        );
        let record = self.trade_record(position, fallback_exit, venue_fill, None, reason);
        self.finish_close(position, record, reason).await
    }

    fn trade_record(
        &self,
        position: &Position,
        exit: f64,
        venue_fill: Option<Fill>,
        exchange_order_id: Option<String>,
        reason: ExitReason,
    ) -> TradeRecord {
        let symbol = self.adapter.symbol();
        let leverage = f64::from(self.settings.leverage.max(1));
        let (computed_pct, computed_usd) =
            compute_pnl(position.side, position.entry_price, exit, position.size, leverage, self.settings.cost_per_side());

        match venue_fill {
            Some(fill) => {
                let fill_exit = if fill.exit_price > 0.0 { fill.exit_price } else { exit };
                let (pnl_pct, pnl_usd) = if fill.realized_pnl != 0.0 {
                    let margin = position.entry_price * position.size / leverage;
                    let pct = if margin > 0.0 { fill.realized_pnl / margin * 100.0 } else { computed_pct };
                    (pct, fill.realized_pnl)
                } else {
                    compute_pnl(
                        position.side,
                        position.entry_price,
                        fill_exit,
                        position.size,
                        leverage,
                        self.settings.cost_per_side(),
                    )
                };
                info!(symbol = %symbol, pnl_usd, pnl_pct, "Using venue-reported PnL");
                TradeRecord {
                    symbol,
                    entry_time: position.entry_time,
                    exit_time: Utc::now(),
                    direction: position.side,
                    entry_price: position.entry_price,
                    exit_price: fill_exit,
                    size: position.size,
                    pnl_pct,
                    pnl_usd,
                    reason: reason.to_string(),
                    client_order_id: position.client_order_id.clone(),
                    exchange_order_id: fill.order_id.clone().or(exchange_order_id),
                    fee: fill.fee,
                    real_history: true,
                    saved_at: None,
                }
            }
            None => TradeRecord {
                symbol,
                entry_time: position.entry_time,
                exit_time: Utc::now(),
                direction: position.side,
                entry_price: position.entry_price,
                exit_price: exit,
                size: position.size,
                pnl_pct: computed_pct,
                pnl_usd: computed_usd,
                reason: reason.to_string(),
                client_order_id: position.client_order_id.clone(),
                exchange_order_id,
                fee: 0.0,
                real_history: false,
                saved_at: None,
            },
        }
    }

    async fn finish_close(&self, position: &Position, record: TradeRecord, reason: ExitReason) -> TradeRecord {
        let symbol = self.adapter.symbol();
        if let Err(e) = self.store.add_trade(record.clone()) {
            error!(symbol = %symbol, error = %e, "Failed to persist trade record");
        }
        if let Err(e) = self.store.remove_managed_position(&symbol) {
            error!(symbol = %symbol, error = %e, "Failed to remove managed position record");
        }

        let emoji = if record.pnl_pct > 0.0 { "🟢" } else { "🔴" };
        info!(
            symbol = %symbol,
            reason = %reason,
            pnl_pct = format!("{:.2}", record.pnl_pct),
            pnl_usd = format!("{:.2}", record.pnl_usd),
            real_history = record.real_history,
            "✅ Position closed"
        );
        self.notifier
            .notify(
                NotifyLevel::Info,
                "Position closed",
                &format!(
                    "{emoji} {symbol} {} ({reason}) PnL {:.2}% ({:.2})",
                    position.side, record.pnl_pct, record.pnl_usd
                ),
                self.adapter.venue(),
            )
            .await;
        record
    }

    /// Venue fill for the close just sent, if one shows up within the grace window.
    async fn find_close_fill(&self, position: &Position) -> Option<Fill> {
        tokio::time::sleep(self.settings.close_fill_grace).await;
        let fills = match self.adapter.get_trade_history(FILL_LOOKUP_LIMIT).await {
            Ok(fills) => fills,
            Err(e) => {
                warn!(error = %e, "Trade history unavailable, using computed PnL");
                return None;
            }
        };
        let since = position.entry_time - ChronoDuration::milliseconds(FILL_MATCH_SLACK_MS);
        fills.into_iter().find(|f| {
            f.position_side.map_or(true, |s| s == position.side)
                && f.time >= since
                && (f.exit_price > 0.0 || f.realized_pnl != 0.0)
        })
    }

    // ========== Add ==========

    /// Pyramiding add of `position.size * add_ratio`. Re-averaging the entry
    /// is the adapter's job; the outcome only describes the fill.
    pub async fn execute_add(
        &self,
        position: &Position,
        price: f64,
        add_ratio: f64,
    ) -> Result<AddOutcome, ExecutionError> {
        let size = position.size * add_ratio;
        if !(size > 0.0) {
            return Err(ExecutionError::InvalidInput(format!("add size {size}")));
        }
        info!(symbol = %position.symbol, side = %position.side, size, price, "➕ Adding to position");

        if self.settings.dry_run {
            return Ok(AddOutcome {
                side: position.side,
                size,
                price,
                order_id: None,
            });
        }

        let side = position.side;
        let result = retry_order("add_position", self.settings.max_retries, self.backoff(), || {
            self.adapter.add_position(side, size)
        })
        .await?;

        Ok(AddOutcome {
            side,
            size: result.filled_qty.filter(|q| *q > 0.0).unwrap_or(size),
            price: result.filled_price.filter(|p| *p > 0.0).unwrap_or(price),
            order_id: result.order_id,
        })
    }
}
