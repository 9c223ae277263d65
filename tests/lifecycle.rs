//! Order and position lifecycle against a scripted venue

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{exchange_row, temp_store, FakeAdapter, RecordingNotifier};
use venuebot::error::ExchangeError;
use venuebot::exchange::{place_protected, ExchangeAdapter, ProtectedOrderFlow};
use venuebot::executor::{compute_pnl, EntryPlan, ExecutionError, ExecutorSettings, OrderExecutor};
use venuebot::notify::NotifyLevel;
use venuebot::persistence::BotState;
use venuebot::position::{classify_sync, ManagerSettings, Ownership, PositionManager, SyncAction};
use venuebot::strategy::DefaultStrategyMath;
use venuebot::types::{ExitReason, ManagedPositionRecord, OrderRequest, OrderResult, Position, Side, Venue};

fn executor_settings() -> ExecutorSettings {
    ExecutorSettings {
        retry_delay: Duration::from_millis(1),
        close_fill_grace: Duration::from_millis(1),
        ..ExecutorSettings::default()
    }
}

fn manager_settings() -> ManagerSettings {
    ManagerSettings {
        sl_retry_base: Duration::from_millis(1),
        ..ManagerSettings::default()
    }
}

fn long_plan() -> EntryPlan {
    EntryPlan {
        side: Side::Long,
        entry_price: 50_000.0,
        stop_loss: 49_000.0,
        take_profit: None,
        atr: 500.0,
        trail_start_r: 0.8,
        trail_dist_r: 0.5,
        trail_start_price: 50_800.0,
        trail_distance: 500.0,
    }
}

#[test]
fn long_round_trip_pnl() {
    let (pct, usd) = compute_pnl(Side::Long, 50_000.0, 51_000.0, 0.01, 10.0, 0.00115);
    assert!((pct - 20.0).abs() < 0.1);
    // 10.0 gross less 0.00115 on 500 and 510 of notional
    assert!((usd - (10.0 - 0.5750 - 0.5865)).abs() < 1e-6);

    let (_, usd_low_fee) = compute_pnl(Side::Long, 50_000.0, 51_000.0, 0.01, 10.0, 0.00006);
    assert!((usd_low_fee - 9.94).abs() < 0.01);

    let (short_pct, short_usd) = compute_pnl(Side::Short, 50_000.0, 51_000.0, 0.01, 10.0, 0.00115);
    assert!((short_pct + 20.0).abs() < 0.1);
    assert!(short_usd < -10.0);
}

#[tokio::test]
async fn entry_with_open_position_never_reaches_venue() {
    let fake = Arc::new(FakeAdapter::new());
    let executor = OrderExecutor::new(
        fake.clone(),
        temp_store("double_entry"),
        Arc::new(RecordingNotifier::default()),
        executor_settings(),
    );
    let current = Position::open("BTCUSDT", Side::Long, 50_000.0, 0.2, 49_000.0, 0.8, 0.5);

    let result = executor.execute_entry(&long_plan(), Some(&current), 50_000.0, 1_000.0).await;

    assert!(matches!(result, Err(ExecutionError::PositionExists(_))));
    assert_eq!(fake.places(), 0);
}

#[tokio::test]
async fn live_entry_records_managed_position() {
    let fake = Arc::new(FakeAdapter::new());
    let store = temp_store("live_entry");
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = OrderExecutor::new(fake.clone(), store.clone(), notifier.clone(), executor_settings());

    let position = executor.execute_entry(&long_plan(), None, 50_000.0, 1_000.0).await.unwrap();

    assert_eq!(fake.places(), 1);
    assert_eq!(position.side, Side::Long);
    assert!((position.size - 0.2).abs() < 1e-9);
    assert!(position.client_order_id.as_deref().unwrap().starts_with("BTCUSDT_Long_"));
    assert!(store.is_managed_position("BTCUSDT"));
    assert_eq!(notifier.titles(), vec!["Entry".to_string()]);
}

#[tokio::test]
async fn failed_close_leaves_position_and_state_untouched() {
    let fake = Arc::new(FakeAdapter::new().fail_closes(vec![
        ExchangeError::transient("timeout"),
        ExchangeError::transient("timeout"),
        ExchangeError::transient("502"),
    ]));
    let store = temp_store("close_fail");
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = OrderExecutor::new(fake.clone(), store.clone(), notifier.clone(), executor_settings());

    let position = Position::open("BTCUSDT", Side::Long, 50_000.0, 0.2, 49_000.0, 0.8, 0.5);
    store
        .save_state(BotState {
            position: Some(position.clone()),
            capital: 1_000.0,
            ..BotState::default()
        })
        .unwrap();
    let before = position.clone();

    let result = executor.execute_close(&position, 49_000.0, ExitReason::SlHit).await;

    assert!(result.is_err());
    assert_eq!(fake.closes(), 3);
    assert_eq!(position, before);
    let after = store.load_state().unwrap().unwrap().position.unwrap();
    assert_eq!(after.stop_loss, 49_000.0);
    assert_eq!(after.size, 0.2);
    assert!(store.trades(10).unwrap().is_empty());
    assert_eq!(notifier.count(NotifyLevel::Critical), 1);
}

#[tokio::test]
async fn close_after_transient_failures_records_trade() {
    let fake = Arc::new(FakeAdapter::new().fail_closes(vec![ExchangeError::transient("timeout")]));
    let store = temp_store("close_retry");
    store
        .add_managed_position(ManagedPositionRecord {
            symbol: "BTCUSDT".into(),
            order_id: None,
            client_order_id: "BTCUSDT_Long_1".into(),
            entry_price: 50_000.0,
            side: Side::Long,
            size: 0.01,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
    let executor = OrderExecutor::new(
        fake.clone(),
        store.clone(),
        Arc::new(RecordingNotifier::default()),
        executor_settings(),
    );
    let position = Position::open("BTCUSDT", Side::Long, 50_000.0, 0.01, 49_000.0, 0.8, 0.5);

    let trade = executor.execute_close(&position, 51_000.0, ExitReason::SlHit).await.unwrap();

    assert_eq!(fake.closes(), 2);
    assert!((trade.pnl_pct - 20.0).abs() < 0.1);
    assert!(!trade.real_history);
    assert_eq!(trade.reason, "SL_HIT");
    assert!(!store.is_managed_position("BTCUSDT"));
    assert_eq!(store.trades(10).unwrap().len(), 1);
}

#[tokio::test]
async fn less_favorable_stop_is_refused_without_venue_call() {
    let fake = Arc::new(FakeAdapter::new());
    let manager = PositionManager::new(
        fake.clone(),
        temp_store("sl_refuse"),
        Arc::new(DefaultStrategyMath),
        manager_settings(),
    );
    let mut position = Position::open("BTCUSDT", Side::Long, 50_000.0, 0.2, 49_000.0, 0.8, 0.5);

    let moved = manager.update_trailing_sl(&mut position, 48_500.0).await.unwrap();

    assert!(!moved);
    assert_eq!(fake.sl_updates(), 0);
    assert_eq!(position.stop_loss, 49_000.0);
}

#[tokio::test]
async fn accepted_stops_only_ratchet() {
    let fake = Arc::new(FakeAdapter::new());
    let manager = PositionManager::new(
        fake.clone(),
        temp_store("sl_ratchet"),
        Arc::new(DefaultStrategyMath),
        manager_settings(),
    );

    let mut long = Position::open("BTCUSDT", Side::Long, 50_000.0, 0.2, 49_000.0, 0.8, 0.5);
    let proposals = [49_200.0, 49_100.0, 49_500.0, 49_500.0, 48_000.0, 49_900.0];
    let mut accepted = vec![long.stop_loss];
    for sl in proposals {
        if manager.update_trailing_sl(&mut long, sl).await.unwrap() {
            accepted.push(long.stop_loss);
        }
    }
    assert_eq!(accepted, vec![49_000.0, 49_200.0, 49_500.0, 49_900.0]);
    assert!(accepted.windows(2).all(|w| w[1] > w[0]));

    let mut short = Position::open("BTCUSDT", Side::Short, 50_000.0, 0.2, 51_000.0, 0.8, 0.5);
    for sl in [50_800.0, 50_900.0, 50_500.0, 52_000.0] {
        manager.update_trailing_sl(&mut short, sl).await.unwrap();
    }
    assert_eq!(short.stop_loss, 50_500.0);
    assert_eq!(fake.sl_updates(), 5);
}

#[tokio::test]
async fn unmanaged_venue_position_is_ignored_live() {
    let fake = Arc::new(FakeAdapter::new().with_positions(vec![exchange_row("BTCUSDT", Side::Long, 1.0, 50_000.0)]));
    let manager = PositionManager::new(
        fake,
        temp_store("sync_unmanaged"),
        Arc::new(DefaultStrategyMath),
        manager_settings(),
    );

    let outcome = manager.sync_with_exchange(None).await;
    assert_eq!(outcome.action, SyncAction::None);
}

#[test]
fn all_rows_ownership_restores_the_same_position() {
    let rows = vec![exchange_row("BTCUSDT", Side::Long, 1.0, 50_000.0)];
    let outcome = classify_sync(&rows, "BTCUSDT", false, Ownership::AllRows, |_| false);
    assert_eq!(outcome.action, SyncAction::Restore(rows[0].clone()));
}

#[test]
fn reconciliation_truth_table() {
    let rows = vec![exchange_row("BTCUSDT", Side::Short, 0.5, 42_000.0)];
    let none: Vec<venuebot::types::ExchangePosition> = Vec::new();
    let managed = |s: &str| s == "BTCUSDT";

    let cases = [
        (&rows, false, "restore"),
        (&rows, true, "none"),
        (&none, true, "clear"),
        (&none, false, "none"),
    ];
    for (venue_rows, local_has, expected) in cases {
        let outcome = classify_sync(venue_rows, "BTCUSDT", local_has, Ownership::ManagedOnly, managed);
        let got = match outcome.action {
            SyncAction::Restore(_) => "restore",
            SyncAction::Clear => "clear",
            SyncAction::None => "none",
        };
        assert_eq!(got, expected, "venue={} local={local_has}", !venue_rows.is_empty());
    }

    let zero = vec![exchange_row("BTCUSDT", Side::Long, 0.0, 42_000.0)];
    let outcome = classify_sync(&zero, "BTCUSDT", true, Ownership::ManagedOnly, managed);
    assert_eq!(outcome.action, SyncAction::Clear);
}

#[tokio::test]
async fn managed_venue_position_is_restored_with_default_stop() {
    let store = temp_store("sync_restore");
    store
        .add_managed_position(ManagedPositionRecord {
            symbol: "BTCUSDT".into(),
            order_id: Some("1".into()),
            client_order_id: "BTCUSDT_Long_1".into(),
            entry_price: 50_000.0,
            side: Side::Long,
            size: 1.0,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
    let fake = Arc::new(FakeAdapter::new().with_positions(vec![exchange_row("BTC/USDT:USDT", Side::Long, 1.0, 50_000.0)]));
    let manager = PositionManager::new(fake, store, Arc::new(DefaultStrategyMath), manager_settings());

    let outcome = manager.sync_with_exchange(None).await;
    let SyncAction::Restore(row) = outcome.action else {
        panic!("expected restore, got {:?}", outcome.action);
    };
    let restored = manager.restore_position(&row);
    assert_eq!(restored.symbol, "BTCUSDT");
    assert!((restored.stop_loss - 47_500.0).abs() < 1e-6);
}

#[tokio::test]
async fn failed_position_fetch_never_clears() {
    let fake = FakeAdapter::new();
    *fake.positions.lock().unwrap() = Err(ExchangeError::transient("timeout"));
    let manager = PositionManager::new(
        Arc::new(fake),
        temp_store("sync_error"),
        Arc::new(DefaultStrategyMath),
        manager_settings(),
    );
    let local = Position::open("BTCUSDT", Side::Long, 50_000.0, 0.2, 49_000.0, 0.8, 0.5);

    let outcome = manager.sync_with_exchange(Some(&local)).await;
    assert_eq!(outcome.action, SyncAction::None);
}

// ========== Protected entry ==========

struct StopRejectingVenue {
    closes: AtomicUsize,
    close_size: std::sync::Mutex<Option<f64>>,
}

#[async_trait]
impl ProtectedOrderFlow for StopRejectingVenue {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    async fn submit_entry(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        Ok(OrderResult::filled(Some("42".into()), 50_000.0, request.size))
    }

    async fn attach_stop_loss(&self, _: &OrderRequest, _: &OrderResult, _: f64) -> Result<(), ExchangeError> {
        Err(ExchangeError::rejected(-2021, "Order would immediately trigger"))
    }

    async fn emergency_close(&self, _side: Side, size: f64) -> Result<OrderResult, ExchangeError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.close_size.lock().unwrap() = Some(size);
        Ok(OrderResult::ok(Some("43".into())))
    }
}

#[tokio::test]
async fn stop_attach_failure_closes_entry_once() {
    let venue = StopRejectingVenue {
        closes: AtomicUsize::new(0),
        close_size: std::sync::Mutex::new(None),
    };
    let request = OrderRequest::market(Side::Long, 0.25, "BTCUSDT_Long_1").with_stop_loss(49_000.0);

    let result = place_protected(&venue, &request).await;

    assert!(matches!(result, Err(ExchangeError::ProtectionFailed { closed: true, .. })));
    assert_eq!(venue.closes.load(Ordering::SeqCst), 1);
    assert_eq!(*venue.close_size.lock().unwrap(), Some(0.25));
}

#[tokio::test]
async fn fake_adapter_is_object_safe() {
    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(FakeAdapter::new());
    assert_eq!(adapter.symbol(), "BTCUSDT");
}
