//! Live position management
//!
//! Per tick the manager decides at most one action, in priority order:
//! close on stop hit, trailing-stop update, pyramiding add. It also
//! reconciles local state with the positions the venue reports.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ExchangeError;
use crate::exchange::retry::{retry_order, Backoff};
use crate::exchange::ExchangeAdapter;
use crate::executor::{AddOutcome, EntryPlan};
use crate::persistence::StateStore;
use crate::signals::TradingConditions;
use crate::strategy::StrategyMath;
use crate::types::{canonical_symbol, Candle, ExchangePosition, ExitReason, Position, Side};

/// Trailing, pyramiding and reconciliation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub enable_pullback: bool,
    pub max_adds: u32,
    pub pullback_rsi_long: f64,
    pub pullback_rsi_short: f64,
    pub rsi_period: usize,
    pub atr_mult: f64,
    pub trail_start_r: f64,
    pub trail_dist_r: f64,
    /// Stop distance, as a fraction of entry, for positions restored from the venue
    pub restore_sl_pct: f64,
    pub max_retries: u32,
    /// Linear backoff base for stop updates
    pub sl_retry_base: Duration,
    pub dry_run: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            enable_pullback: false,
            max_adds: 1,
            pullback_rsi_long: 45.0,
            pullback_rsi_short: 55.0,
            rsi_period: 14,
            atr_mult: 2.0,
            trail_start_r: 0.8,
            trail_dist_r: 0.5,
            restore_sl_pct: 0.05,
            max_retries: 3,
            sl_retry_base: Duration::from_secs(1),
            dry_run: false,
        }
    }
}

/// The single action decided for a tick
#[derive(Debug, Clone, PartialEq)]
pub enum ManageAction {
    Close { reason: ExitReason, price: f64 },
    UpdateSl { new_sl: f64 },
    Add { side: Side, price: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    None,
    /// The venue holds a position we own but have no local state for.
    Restore(ExchangePosition),
    /// Local state has no counterpart on the venue any more.
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub action: SyncAction,
    /// Rows considered ours after filtering
    pub owned_rows: usize,
}

/// Which venue rows reconciliation may treat as bot-owned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Only rows whose symbol has a managed-position record
    ManagedOnly,
    /// Every row for the symbol
    AllRows,
}

/// Long hits when `low <= stop`, short when `high >= stop`.
pub fn check_sl_hit(position: &Position, high: f64, low: f64) -> bool {
    match position.side {
        Side::Long => low <= position.stop_loss,
        Side::Short => high >= position.stop_loss,
    }
}

/// Reconciliation truth table over already-fetched venue rows.
pub fn classify_sync<F>(
    rows: &[ExchangePosition],
    symbol: &str,
    local_has_position: bool,
    ownership: Ownership,
    is_managed: F,
) -> SyncOutcome
where
    F: Fn(&str) -> bool,
{
    let symbol = canonical_symbol(symbol);
    let owned: Vec<&ExchangePosition> = rows
        .iter()
        .filter(|p| p.size > 0.0 && canonical_symbol(&p.symbol) == symbol)
        .filter(|p| match ownership {
            Ownership::AllRows => true,
            Ownership::ManagedOnly => {
                let managed = is_managed(&symbol);
                if !managed {
                    debug!(symbol = %symbol, side = %p.side, size = p.size, "Ignoring external position");
                }
                managed
            }
        })
        .collect();

    let action = match (owned.first(), local_has_position) {
        (Some(row), false) => SyncAction::Restore((*row).clone()),
        (None, true) => SyncAction::Clear,
        _ => SyncAction::None,
    };
    SyncOutcome {
        action,
        owned_rows: owned.len(),
    }
}

pub struct PositionManager {
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<StateStore>,
    math: Arc<dyn StrategyMath>,
    settings: ManagerSettings,
}

impl PositionManager {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<StateStore>,
        math: Arc<dyn StrategyMath>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            adapter,
            store,
            math,
            settings,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn check_sl_hit(&self, position: &Position, high: f64, low: f64) -> bool {
        check_sl_hit(position, high, low)
    }

    /// Move the stop to `new_sl` on the venue, then locally.
    ///
    /// A proposal that is not strictly more favorable than the current stop
    /// is refused without a venue call. Returns `Ok(false)` for a refusal.
    pub async fn update_trailing_sl(&self, position: &mut Position, new_sl: f64) -> Result<bool, ExchangeError> {
        if !new_sl.is_finite() || !position.side.is_favorable_stop(new_sl, position.stop_loss) {
            warn!(
                symbol = %position.symbol,
                side = %position.side,
                current = position.stop_loss,
                proposed = new_sl,
                "Trailing stop proposal refused, not more favorable"
            );
            return Ok(false);
        }

        if !self.settings.dry_run {
            let backoff = Backoff::Linear(self.settings.sl_retry_base);
            if let Err(e) = retry_order("update_stop_loss", self.settings.max_retries, backoff, || {
                self.adapter.update_stop_loss(new_sl)
            })
            .await
            {
                error!(symbol = %position.symbol, new_sl, error = %e, "All stop-loss update attempts failed");
                return Err(e);
            }
        }

        info!(symbol = %position.symbol, from = position.stop_loss, to = new_sl, "✅ Trailing stop updated");
        position.stop_loss = new_sl;
        Ok(true)
    }

    /// Pyramiding gate: enabled, adds left, and RSI pulled back.
    pub fn should_add_position(&self, position: &Position, rsi: f64) -> bool {
        if !self.settings.enable_pullback || position.add_count >= self.settings.max_adds {
            return false;
        }
        match position.side {
            Side::Long => rsi < self.settings.pullback_rsi_long,
            Side::Short => rsi > self.settings.pullback_rsi_short,
        }
    }

    /// Decide this tick's action for `position` given the latest bar.
    ///
    /// The extreme price is tracked in place. The stop itself is only moved
    /// through [`Self::update_trailing_sl`] once the caller acts on
    /// `ManageAction::UpdateSl`.
    pub fn manage_live(&self, position: &mut Position, candle: &Candle, history: &[Candle]) -> Option<ManageAction> {
        if !position.is_open() {
            return None;
        }

        if check_sl_hit(position, candle.high, candle.low) {
            info!(symbol = %position.symbol, side = %position.side, stop = position.stop_loss, "🛑 Stop-loss hit");
            return Some(ManageAction::Close {
                reason: ExitReason::SlHit,
                price: position.stop_loss,
            });
        }

        let rsi = self.math.rsi(history, self.settings.rsi_period).unwrap_or(50.0);
        let trailing = self.math.compute_trailing(position, candle.high, candle.low, rsi);
        if trailing.sl_hit {
            return Some(ManageAction::Close {
                reason: ExitReason::SlHit,
                price: position.stop_loss,
            });
        }

        if position.side.is_favorable_stop(trailing.new_extreme, position.extreme_price) {
            position.extreme_price = trailing.new_extreme;
        }

        if let Some(new_sl) = trailing
            .new_sl
            .filter(|sl| position.side.is_favorable_stop(*sl, position.stop_loss))
        {
            return Some(ManageAction::UpdateSl { new_sl });
        }

        if self.should_add_position(position, rsi) {
            return Some(ManageAction::Add {
                side: position.side,
                price: candle.close,
            });
        }
        None
    }

    /// Merge an executed add into the local position. The adapter's tracked
    /// average entry wins when it has one.
    pub fn apply_add(&self, position: &mut Position, add: &AddOutcome) {
        let total = position.size + add.size;
        match self.adapter.tracked_position().filter(|t| t.side == position.side && t.size > 0.0) {
            Some(tracked) => position.entry_price = tracked.entry_price,
            None if total > 0.0 => {
                position.entry_price = (position.entry_price * position.size + add.price * add.size) / total;
            }
            None => {}
        }
        position.size = total;
        position.add_count += 1;
        info!(
            symbol = %position.symbol,
            size = position.size,
            avg_entry = position.entry_price,
            adds = position.add_count,
            "➕ Position increased"
        );
    }

    /// Build an entry plan when the gates are open.
    ///
    /// Stop is `entry -/+ atr * atr_mult`; without a usable ATR, 1% of price
    /// stands in.
    pub fn check_entry_live(
        &self,
        conditions: &TradingConditions,
        candle: &Candle,
        atr: Option<f64>,
    ) -> Option<EntryPlan> {
        if !conditions.ready {
            return None;
        }
        let side = conditions.direction?;
        let entry = candle.close;
        if !(entry > 0.0) {
            return None;
        }
        let atr = atr.filter(|a| a.is_finite() && *a > 0.0).unwrap_or(entry * 0.01);
        let stop_loss = entry - side.sign() * atr * self.settings.atr_mult;
        let risk = (entry - stop_loss).abs();

        let plan = EntryPlan {
            side,
            entry_price: entry,
            stop_loss,
            take_profit: None,
            atr,
            trail_start_r: self.settings.trail_start_r,
            trail_dist_r: self.settings.trail_dist_r,
            trail_start_price: entry + side.sign() * risk * self.settings.trail_start_r,
            trail_distance: risk * self.settings.trail_dist_r,
        };
        info!(side = %side, entry, stop_loss, atr, "🟢 Entry conditions met");
        Some(plan)
    }

    // ========== Reconciliation ==========

    /// Compare local state with the venue.
    ///
    /// Live: venue rows are fetched and only managed symbols count. A failed
    /// fetch yields `None`, never `Clear`. Dry-run: rows are synthesized from
    /// the managed registry, since dry-run positions exist only locally.
    pub async fn sync_with_exchange(&self, local: Option<&Position>) -> SyncOutcome {
        let symbol = self.adapter.symbol();
        let (rows, ownership) = if self.settings.dry_run {
            let rows = self
                .store
                .managed_positions()
                .into_iter()
                .map(|r| ExchangePosition {
                    symbol: r.symbol,
                    side: r.side,
                    size: r.size,
                    entry_price: r.entry_price,
                    unrealized_pnl: 0.0,
                    leverage: None,
                    stop_loss: None,
                })
                .collect::<Vec<_>>();
            (rows, Ownership::AllRows)
        } else {
            match self.adapter.get_positions().await {
                Ok(rows) => (rows, Ownership::ManagedOnly),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Position fetch failed, skipping reconciliation");
                    return SyncOutcome {
                        action: SyncAction::None,
                        owned_rows: 0,
                    };
                }
            }
        };

        let outcome = classify_sync(&rows, &symbol, local.is_some(), ownership, |s| {
            self.store.is_managed_position(s)
        });
        match &outcome.action {
            SyncAction::Restore(row) => info!(
                symbol = %symbol,
                side = %row.side,
                size = row.size,
                entry = row.entry_price,
                "🔄 Reconcile: RESTORE"
            ),
            SyncAction::Clear => info!(symbol = %symbol, "🔄 Reconcile: CLEAR, position closed outside the bot"),
            SyncAction::None => debug!(symbol = %symbol, "Reconcile: in sync"),
        }
        outcome
    }

    /// Local position rebuilt from a venue row. Without a venue stop the
    /// stop defaults to `restore_sl_pct` away from entry.
    pub fn restore_position(&self, row: &ExchangePosition) -> Position {
        let stop_loss = row.stop_loss.filter(|s| *s > 0.0).unwrap_or_else(|| {
            let sl = row.entry_price * (1.0 - row.side.sign() * self.settings.restore_sl_pct);
            warn!(
                symbol = %row.symbol,
                entry = row.entry_price,
                stop_loss = sl,
                pct = self.settings.restore_sl_pct,
                "Restored position has no known stop, using default distance"
            );
            sl
        });
        Position::open(
            &canonical_symbol(&row.symbol),
            row.side,
            row.entry_price,
            row.size,
            stop_loss,
            self.settings.trail_start_r,
            self.settings.trail_dist_r,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeAdapter;
    use crate::strategy::DefaultStrategyMath;
    use crate::types::{OrderResult, Venue};
    use chrono::{TimeZone, Utc};

    fn store(name: &str) -> Arc<StateStore> {
        let dir = std::env::temp_dir().join(format!("venuebot_pos_{name}_{}", uuid::Uuid::new_v4()));
        Arc::new(StateStore::new(dir, Venue::Bybit, "BTCUSDT").unwrap())
    }

    fn manager(adapter: MockExchangeAdapter, settings: ManagerSettings) -> PositionManager {
        PositionManager::new(Arc::new(adapter), store("m"), Arc::new(DefaultStrategyMath), settings)
    }

    fn fast() -> ManagerSettings {
        ManagerSettings {
            sl_retry_base: Duration::from_millis(1),
            ..ManagerSettings::default()
        }
    }

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 14, 15, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            confirmed: Some(true),
        }
    }

    #[test]
    fn sl_hit_by_side() {
        let long = Position::open("BTCUSDT", Side::Long, 100_000.0, 1.0, 99_000.0, 0.8, 0.5);
        assert!(check_sl_hit(&long, 100_500.0, 98_500.0));
        assert!(!check_sl_hit(&long, 100_500.0, 99_500.0));

        let short = Position::open("BTCUSDT", Side::Short, 100_000.0, 1.0, 101_000.0, 0.8, 0.5);
        assert!(check_sl_hit(&short, 101_000.0, 99_000.0));
    }

    #[tokio::test]
    async fn stop_update_retries_with_linear_backoff() {
        let mut adapter = MockExchangeAdapter::new();
        let mut seq = mockall::Sequence::new();
        adapter
            .expect_update_stop_loss()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ExchangeError::transient("timeout")));
        adapter
            .expect_update_stop_loss()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(OrderResult::ok(None)));

        let pm = manager(adapter, fast());
        let mut p = Position::open("BTCUSDT", Side::Long, 50_000.0, 1.0, 49_000.0, 0.8, 0.5);
        assert!(pm.update_trailing_sl(&mut p, 49_500.0).await.unwrap());
        assert_eq!(p.stop_loss, 49_500.0);
    }

    #[tokio::test]
    async fn failed_stop_update_keeps_old_stop() {
        let mut adapter = MockExchangeAdapter::new();
        adapter
            .expect_update_stop_loss()
            .times(3)
            .returning(|_| Err(ExchangeError::transient("timeout")));

        let pm = manager(adapter, fast());
        let mut p = Position::open("BTCUSDT", Side::Short, 50_000.0, 1.0, 51_000.0, 0.8, 0.5);
        assert!(pm.update_trailing_sl(&mut p, 50_500.0).await.is_err());
        assert_eq!(p.stop_loss, 51_000.0);
    }

    #[test]
    fn pyramiding_gate() {
        let settings = ManagerSettings {
            enable_pullback: true,
            ..fast()
        };
        let pm = manager(MockExchangeAdapter::new(), settings);
        let mut p = Position::open("BTCUSDT", Side::Long, 100.0, 1.0, 95.0, 0.8, 0.5);
        assert!(pm.should_add_position(&p, 40.0));
        assert!(!pm.should_add_position(&p, 50.0));
        p.add_count = 1;
        assert!(!pm.should_add_position(&p, 40.0));

        let disabled = manager(MockExchangeAdapter::new(), fast());
        let fresh = Position::open("BTCUSDT", Side::Long, 100.0, 1.0, 95.0, 0.8, 0.5);
        assert!(!disabled.should_add_position(&fresh, 10.0));
    }

    #[test]
    fn manage_live_prefers_close_over_trailing() {
        let pm = manager(MockExchangeAdapter::new(), fast());
        let mut p = Position::open("BTCUSDT", Side::Long, 100.0, 1.0, 98.0, 0.8, 0.5);
        // wide bar: new extreme would trail, but the low touches the stop first
        let action = pm.manage_live(&mut p, &bar(110.0, 97.0, 105.0), &[]);
        assert_eq!(
            action,
            Some(ManageAction::Close {
                reason: ExitReason::SlHit,
                price: 98.0
            })
        );
    }

    #[test]
    fn manage_live_proposes_trailing_and_tracks_extreme() {
        let pm = manager(MockExchangeAdapter::new(), fast());
        let mut p = Position::open("BTCUSDT", Side::Long, 100.0, 1.0, 98.0, 0.8, 0.5);
        let action = pm.manage_live(&mut p, &bar(104.0, 101.0, 103.0), &[]);
        assert_eq!(action, Some(ManageAction::UpdateSl { new_sl: 103.0 }));
        assert_eq!(p.extreme_price, 104.0);
        assert_eq!(p.stop_loss, 98.0);
    }

    #[test]
    fn manage_live_signals_add_on_pullback() {
        let settings = ManagerSettings {
            enable_pullback: true,
            pullback_rsi_long: 60.0,
            ..fast()
        };
        let pm = manager(MockExchangeAdapter::new(), settings);
        let mut p = Position::open("BTCUSDT", Side::Long, 100.0, 1.0, 98.0, 0.8, 0.5);
        // no history: RSI defaults to 50, below the 60 threshold
        let action = pm.manage_live(&mut p, &bar(100.5, 99.5, 100.0), &[]);
        assert_eq!(action, Some(ManageAction::Add { side: Side::Long, price: 100.0 }));
    }

    #[test]
    fn entry_plan_uses_atr_or_one_percent() {
        let pm = manager(MockExchangeAdapter::new(), fast());
        let conditions = TradingConditions {
            ready: true,
            direction: Some(Side::Short),
            pending_long: false,
            pending_short: true,
            rsi: 60.0,
            rsi_long_met: false,
            rsi_short_met: true,
            trend: None,
            trend_long_met: true,
            trend_short_met: true,
            valid_pending: 1,
        };
        let plan = pm.check_entry_live(&conditions, &bar(101.0, 99.0, 100.0), None).unwrap();
        assert_eq!(plan.side, Side::Short);
        assert!((plan.stop_loss - 102.0).abs() < 1e-9);
        assert!((plan.trail_start_price - 98.4).abs() < 1e-9);
        assert!((plan.trail_distance - 1.0).abs() < 1e-9);

        let with_atr = pm.check_entry_live(&conditions, &bar(101.0, 99.0, 100.0), Some(0.5)).unwrap();
        assert!((with_atr.stop_loss - 101.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sync_fetch_error_is_none() {
        let mut adapter = MockExchangeAdapter::new();
        adapter.expect_symbol().return_const("BTCUSDT".to_string());
        adapter
            .expect_get_positions()
            .returning(|| Err(ExchangeError::transient("down")));
        let pm = manager(adapter, fast());
        let local = Position::open("BTCUSDT", Side::Long, 100.0, 1.0, 95.0, 0.8, 0.5);
        assert_eq!(pm.sync_with_exchange(Some(&local)).await.action, SyncAction::None);
    }

    #[test]
    fn restore_defaults_stop_by_side() {
        let pm = manager(MockExchangeAdapter::new(), fast());
        let row = ExchangePosition {
            symbol: "BTC/USDT:USDT".into(),
            side: Side::Short,
            size: 1.0,
            entry_price: 100.0,
            unrealized_pnl: 0.0,
            leverage: Some(10.0),
            stop_loss: None,
        };
        let p = pm.restore_position(&row);
        assert_eq!(p.symbol, "BTCUSDT");
        assert!((p.stop_loss - 105.0).abs() < 1e-9);
    }
}
