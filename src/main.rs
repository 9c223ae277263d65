//! venuebot binary: load config, wire one orchestrator per pair, run until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use venuebot::config::{AppConfig, InstanceConfig};
use venuebot::exchange::{build_adapter, Credentials, ExchangeAdapter, WithLocalHistory};
use venuebot::executor::OrderExecutor;
use venuebot::notify::{DedupNotifier, Notifier, TracingNotifier, WebhookNotifier};
use venuebot::orchestrator::{InstanceRegistry, OrchestratorSettings, PairDeps, TradingOrchestrator};
use venuebot::position::PositionManager;
use venuebot::strategy::{DefaultStrategyMath, NoSignals};
use venuebot::time_sync::{time_endpoint, HttpTimeFetcher, TimeSync};

const DEFAULT_LOG_FILTER: &str = "info,venuebot=debug";

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()?;
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(config.logging.json)?;

    info!("🤖 venuebot v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config);
    if config.bot.dry_run {
        warn!("⚠️ DRY RUN: orders are simulated");
    } else {
        config.validate_env()?;
    }

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(TracingNotifier),
    };
    let alerts = Arc::new(DedupNotifier::new(
        Arc::clone(&notifier),
        Duration::from_secs(config.notify.dedup_window_secs),
    ));
    let registry = InstanceRegistry::from_config(&config.persistence);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pairs = Vec::new();
    for instance in &config.bot.instances {
        let pair = match build_pair(&config, instance, &registry, &notifier, &alerts) {
            Ok(pair) => pair,
            Err(e) => {
                error!(venue = %instance.venue, symbol = %instance.symbol, error = %format!("{e:#}"), "Pair not started");
                continue;
            }
        };
        let shutdown = shutdown_rx.clone();
        let label = format!("{}:{}", instance.venue, instance.symbol);
        pairs.push(tokio::spawn(async move {
            if let Err(e) = pair.run(shutdown).await {
                error!(pair = %label, error = %format!("{e:#}"), "Pair exited with error");
            }
        }));
    }
    if pairs.is_empty() {
        anyhow::bail!("no trading pair could be started");
    }
    info!(pairs = pairs.len(), "All pairs running");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("🛑 Shutting down");
    shutdown_tx.send_replace(true);
    for pair in pairs {
        if let Err(e) = pair.await {
            warn!(error = %e, "Pair task panicked");
        }
    }
    info!("Goodbye");
    Ok(())
}

fn build_pair(
    config: &AppConfig,
    instance: &InstanceConfig,
    registry: &InstanceRegistry,
    notifier: &Arc<dyn Notifier>,
    alerts: &Arc<DedupNotifier>,
) -> Result<Arc<TradingOrchestrator>> {
    let venue = instance.venue;
    let store = registry.store(venue, &instance.symbol)?;

    let time_sync = match time_endpoint(venue) {
        Some(_) => {
            let fetcher = HttpTimeFetcher::new(venue, config.time_sync.request_timeout_secs)?;
            Some(Arc::new(
                TimeSync::new(venue, Arc::new(fetcher))
                    .with_sync_interval(config.time_sync.sync_interval_secs)
                    .with_latency_window(config.time_sync.latency_window),
            ))
        }
        None => None,
    };

    let creds = match Credentials::from_env(venue) {
        Ok(creds) => creds,
        Err(_) if config.bot.dry_run => Credentials::new("", ""),
        Err(e) => return Err(e),
    };
    let raw = build_adapter(venue, &instance.symbol, creds, time_sync.clone())?;
    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(WithLocalHistory::new(raw, store.trade_storage()));

    let executor = OrderExecutor::new(
        Arc::clone(&adapter),
        Arc::clone(&store),
        Arc::clone(notifier),
        config.executor_settings(),
    );
    let manager = PositionManager::new(
        Arc::clone(&adapter),
        Arc::clone(&store),
        Arc::new(DefaultStrategyMath),
        config.manager_settings(),
    );

    let deps = PairDeps {
        adapter,
        store,
        notifier: Arc::clone(notifier),
        alerts: Arc::clone(alerts),
        math: Arc::new(DefaultStrategyMath),
        source: Arc::new(NoSignals),
        executor,
        manager,
        time_sync,
    };
    Ok(Arc::new(TradingOrchestrator::new(deps, OrchestratorSettings::from_config(config))))
}
