//! Configuration management for venuebot
//!
//! Defaults, then optional `config/default` and `config/local` files, then
//! `VENUEBOT__SECTION__KEY` environment overrides. Credentials never live
//! here; adapters read them from the venue's own environment variables.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::executor::ExecutorSettings;
use crate::exchange::Credentials;
use crate::position::ManagerSettings;
use crate::signals::{DirectionFilter, RsiGate};
use crate::stream::StreamSettings;
use crate::types::{Interval, Venue};

/// Comma separated `venue:SYMBOL` list that replaces `bot.instances`
pub const INSTANCES_ENV: &str = "VENUEBOT_INSTANCES";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub trading: TradingConfig,
    pub strategy: StrategyConfig,
    pub stream: StreamSettings,
    pub time_sync: TimeSyncConfig,
    pub housekeeping: HousekeepingConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub notify: NotifyConfig,
}

/// One (venue, symbol) trading pair
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceConfig {
    pub venue: Venue,
    pub symbol: String,
}

impl InstanceConfig {
    /// Parse `bybit:BTCUSDT`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (venue, symbol) = raw
            .split_once(':')
            .with_context(|| format!("instance '{raw}' must look like venue:SYMBOL"))?;
        let venue = Venue::from_str(venue.trim()).with_context(|| format!("unknown venue '{venue}'"))?;
        let symbol = symbol.trim();
        if symbol.is_empty() {
            bail!("instance '{raw}' has an empty symbol");
        }
        Ok(Self {
            venue,
            symbol: symbol.to_uppercase(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Trading pairs, one orchestrator each
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    /// Dry run mode (no real orders)
    pub dry_run: bool,
    /// Sides the bot may enter
    pub direction: DirectionFilter,
    /// Scan loop tick when no candle close arrives
    pub scan_interval_secs: u64,
    /// Sleep after a failed loop iteration
    pub error_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    pub leverage: u32,
    /// Fraction of free balance committed per entry
    pub invest_ratio: f64,
    /// Minimum notional in quote currency
    pub min_order_value: f64,
    pub min_qty: f64,
    pub fee_rate: f64,
    pub slippage: f64,
    /// Size of an add relative to the open position
    pub add_ratio: f64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Wait before reading the close fill from trade history
    pub close_fill_grace_ms: u64,
    /// Stop distance for positions restored from the venue
    pub restore_sl_pct: f64,
    /// Dry-run capital used for sizing
    pub paper_balance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub enable_pullback: bool,
    pub max_adds: u32,
    pub pullback_rsi_long: f64,
    pub pullback_rsi_short: f64,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub atr_mult: f64,
    /// Trailing activates at entry ± risk·trail_start_r
    pub trail_start_r: f64,
    /// Trailing distance as a multiple of risk
    pub trail_dist_r: f64,
    pub entry_validity_hours: f64,
    pub entry_interval: Interval,
    pub pattern_interval: Interval,
    pub signal_queue_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeSyncConfig {
    pub sync_interval_secs: f64,
    pub latency_window: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HousekeepingConfig {
    pub interval_secs: u64,
    /// Candles fetched over REST when the stream is unhealthy
    pub backfill_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
    pub history_cap: usize,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// JSON log lines instead of the human format
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// POST target for notifications; log-only when absent
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Repeats of the same connectivity alert are dropped inside this window
    pub dedup_window_secs: u64,
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Bot defaults
            .set_default("bot.dry_run", true)?
            .set_default("bot.direction", "Both")?
            .set_default("bot.scan_interval_secs", 1)?
            .set_default("bot.error_backoff_secs", 5)?
            // Trading defaults
            .set_default("trading.leverage", 10)?
            .set_default("trading.invest_ratio", 1.0)?
            .set_default("trading.min_order_value", 10.0)?
            .set_default("trading.min_qty", 0.001)?
            .set_default("trading.fee_rate", 0.00055)?
            .set_default("trading.slippage", 0.0006)?
            .set_default("trading.add_ratio", 0.5)?
            .set_default("trading.max_retries", 3)?
            .set_default("trading.retry_delay_ms", 1000)?
            .set_default("trading.close_fill_grace_ms", 1000)?
            .set_default("trading.restore_sl_pct", 0.05)?
            .set_default("trading.paper_balance", 1000.0)?
            // Strategy defaults
            .set_default("strategy.enable_pullback", false)?
            .set_default("strategy.max_adds", 1)?
            .set_default("strategy.pullback_rsi_long", 45.0)?
            .set_default("strategy.pullback_rsi_short", 55.0)?
            .set_default("strategy.rsi_period", 14)?
            .set_default("strategy.atr_period", 14)?
            .set_default("strategy.atr_mult", 2.0)?
            .set_default("strategy.trail_start_r", 0.8)?
            .set_default("strategy.trail_dist_r", 0.5)?
            .set_default("strategy.entry_validity_hours", 12.0)?
            .set_default("strategy.entry_interval", "15m")?
            .set_default("strategy.pattern_interval", "1h")?
            .set_default("strategy.signal_queue_len", 100)?
            // Stream defaults
            .set_default("stream.max_reconnect_attempts", 20)?
            .set_default("stream.base_delay_secs", 3.0)?
            .set_default("stream.backoff_factor", 1.5)?
            .set_default("stream.max_delay_secs", 60.0)?
            .set_default("stream.health_timeout_secs", 30)?
            .set_default("stream.stop_join_timeout_secs", 5)?
            .set_default("stream.ping_interval_secs", 20)?
            // Time sync defaults
            .set_default("time_sync.sync_interval_secs", 5.0)?
            .set_default("time_sync.latency_window", 100)?
            .set_default("time_sync.request_timeout_secs", 3)?
            // Housekeeping defaults
            .set_default("housekeeping.interval_secs", 30)?
            .set_default("housekeeping.backfill_limit", 200)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data/storage")?
            .set_default("persistence.history_cap", 1000)?
            .set_default("persistence.cache_ttl_secs", 3600)?
            .set_default("logging.json", false)?
            .set_default("notify.dedup_window_secs", 300)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (VENUEBOT__*)
            .add_source(Environment::with_prefix("VENUEBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if let Ok(raw) = std::env::var(INSTANCES_ENV) {
            app_config.bot.instances = parse_instances(&raw)?;
        }
        if app_config.bot.instances.is_empty() {
            app_config.bot.instances.push(InstanceConfig {
                venue: Venue::Bybit,
                symbol: "BTCUSDT".to_string(),
            });
        }

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject values the trading loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.trading.leverage == 0 {
            bail!("trading.leverage must be at least 1");
        }
        if !(self.trading.invest_ratio > 0.0 && self.trading.invest_ratio <= 1.0) {
            bail!("trading.invest_ratio must be in (0, 1], got {}", self.trading.invest_ratio);
        }
        if self.strategy.signal_queue_len == 0 {
            bail!("strategy.signal_queue_len must be positive");
        }
        if self.strategy.trail_dist_r < 0.0 || self.strategy.atr_mult <= 0.0 {
            bail!("strategy.atr_mult must be positive and trail_dist_r non-negative");
        }
        for (i, instance) in self.bot.instances.iter().enumerate() {
            if self.bot.instances[..i].contains(instance) {
                bail!("duplicate instance {}:{}", instance.venue, instance.symbol);
            }
        }
        Ok(())
    }

    /// Live trading needs credentials for every configured venue
    pub fn validate_env(&self) -> Result<()> {
        if self.bot.dry_run {
            return Ok(());
        }
        for instance in &self.bot.instances {
            let creds = Credentials::from_env(instance.venue)?;
            if creds.is_empty() {
                bail!("credentials for {} are not set", instance.venue);
            }
        }
        Ok(())
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            leverage: self.trading.leverage,
            invest_ratio: self.trading.invest_ratio,
            min_order_value: self.trading.min_order_value,
            min_qty: self.trading.min_qty,
            fee_rate: self.trading.fee_rate,
            slippage: self.trading.slippage,
            max_retries: self.trading.max_retries,
            retry_delay: Duration::from_millis(self.trading.retry_delay_ms),
            close_fill_grace: Duration::from_millis(self.trading.close_fill_grace_ms),
            dry_run: self.bot.dry_run,
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            enable_pullback: self.strategy.enable_pullback,
            max_adds: self.strategy.max_adds,
            pullback_rsi_long: self.strategy.pullback_rsi_long,
            pullback_rsi_short: self.strategy.pullback_rsi_short,
            rsi_period: self.strategy.rsi_period,
            atr_mult: self.strategy.atr_mult,
            trail_start_r: self.strategy.trail_start_r,
            trail_dist_r: self.strategy.trail_dist_r,
            restore_sl_pct: self.trading.restore_sl_pct,
            max_retries: self.trading.max_retries,
            sl_retry_base: Duration::from_millis(self.trading.retry_delay_ms),
            dry_run: self.bot.dry_run,
        }
    }

    pub fn rsi_gate(&self) -> RsiGate {
        RsiGate {
            pullback_long: self.strategy.pullback_rsi_long,
            pullback_short: self.strategy.pullback_rsi_short,
        }
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        let instances: Vec<String> = self
            .bot
            .instances
            .iter()
            .map(|i| format!("{}:{}", i.venue, i.symbol))
            .collect();
        format!(
            "instances={:?} dry_run={} direction={:?} entry={} pattern={} leverage={}x invest={:.2} pullback={} webhook={}",
            instances,
            self.bot.dry_run,
            self.bot.direction,
            self.strategy.entry_interval,
            self.strategy.pattern_interval,
            self.trading.leverage,
            self.trading.invest_ratio,
            self.strategy.enable_pullback,
            self.notify.webhook_url.is_some()
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

/// Parse `bybit:BTCUSDT, okx:ETHUSDT`.
pub fn parse_instances(raw: &str) -> Result<Vec<InstanceConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(InstanceConfig::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            bot: BotConfig {
                instances: vec![InstanceConfig {
                    venue: Venue::Okx,
                    symbol: "ETHUSDT".into(),
                }],
                dry_run: false,
                direction: DirectionFilter::Long,
                scan_interval_secs: 1,
                error_backoff_secs: 5,
            },
            trading: TradingConfig {
                leverage: 5,
                invest_ratio: 0.5,
                min_order_value: 10.0,
                min_qty: 0.001,
                fee_rate: 0.00055,
                slippage: 0.0006,
                add_ratio: 0.5,
                max_retries: 3,
                retry_delay_ms: 250,
                close_fill_grace_ms: 0,
                restore_sl_pct: 0.05,
                paper_balance: 1000.0,
            },
            strategy: StrategyConfig {
                enable_pullback: true,
                max_adds: 2,
                pullback_rsi_long: 40.0,
                pullback_rsi_short: 60.0,
                rsi_period: 14,
                atr_period: 14,
                atr_mult: 2.0,
                trail_start_r: 0.8,
                trail_dist_r: 0.5,
                entry_validity_hours: 12.0,
                entry_interval: Interval::Min15,
                pattern_interval: Interval::Hour1,
                signal_queue_len: 100,
            },
            stream: StreamSettings::default(),
            time_sync: TimeSyncConfig {
                sync_interval_secs: 5.0,
                latency_window: 100,
                request_timeout_secs: 3,
            },
            housekeeping: HousekeepingConfig {
                interval_secs: 30,
                backfill_limit: 200,
            },
            persistence: PersistenceConfig {
                data_dir: "./data/storage".into(),
                history_cap: 1000,
                cache_ttl_secs: 3600,
            },
            logging: LoggingConfig { json: false },
            notify: NotifyConfig {
                webhook_url: Some("https://hooks.example.invalid/x".into()),
                dedup_window_secs: 300,
            },
        }
    }

    #[test]
    fn parses_instance_list() {
        let parsed = parse_instances("bybit:btcusdt, okx:ETHUSDT,").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].venue, Venue::Bybit);
        assert_eq!(parsed[0].symbol, "BTCUSDT");
        assert_eq!(parsed[1].venue, Venue::Okx);

        assert!(InstanceConfig::parse("BTCUSDT").is_err());
        assert!(InstanceConfig::parse("kraken:BTCUSD").is_err());
        assert!(InstanceConfig::parse("bybit:").is_err());
    }

    #[test]
    fn settings_follow_sections() {
        let cfg = sample();
        let exec = cfg.executor_settings();
        assert_eq!(exec.leverage, 5);
        assert_eq!(exec.retry_delay, Duration::from_millis(250));
        assert!(!exec.dry_run);

        let mgr = cfg.manager_settings();
        assert!(mgr.enable_pullback);
        assert_eq!(mgr.max_adds, 2);
        assert_eq!(mgr.sl_retry_base, Duration::from_millis(250));

        assert_eq!(cfg.rsi_gate().pullback_long, 40.0);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = sample();
        assert!(cfg.validate().is_ok());

        cfg.trading.invest_ratio = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.bot.instances.push(cfg.bot.instances[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn digest_hides_webhook_url() {
        let digest = sample().to_string();
        assert!(digest.contains("okx:ETHUSDT"));
        assert!(digest.contains("webhook=true"));
        assert!(!digest.contains("hooks.example"));
    }
}
