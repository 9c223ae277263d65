//! User-facing notifications
//!
//! Best effort: a sink that fails logs and moves on, it never surfaces an
//! error into the trading path.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::types::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
    /// Money at risk: unprotected or unclosable position
    Critical,
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotifyLevel::Info => "INFO",
            NotifyLevel::Warning => "WARNING",
            NotifyLevel::Error => "ERROR",
            NotifyLevel::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, level: NotifyLevel, title: &str, message: &str, venue: Venue);
}

/// Writes notifications to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, level: NotifyLevel, title: &str, message: &str, venue: Venue) {
        match level {
            NotifyLevel::Info => info!(venue = %venue, %title, %message, "🔔 Notification"),
            NotifyLevel::Warning => warn!(venue = %venue, %title, %message, "🔔 Notification"),
            NotifyLevel::Error | NotifyLevel::Critical => {
                error!(venue = %venue, level = %level, %title, %message, "🚨 Notification")
            }
        }
    }
}

/// Posts `{level, title, message, exchange}` JSON to a webhook, and logs.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, level: NotifyLevel, title: &str, message: &str, venue: Venue) {
        TracingNotifier.notify(level, title, message, venue).await;
        let payload = json!({
            "level": level.to_string(),
            "title": title,
            "message": message,
            "exchange": venue.as_str(),
        });
        if let Err(e) = self.client.post(&self.url).json(&payload).send().await {
            error!(error = %e, "Failed to deliver webhook notification");
        }
    }
}

/// Suppresses repeats of the same (level, title, venue) within `window`.
pub struct DedupNotifier {
    inner: Arc<dyn Notifier>,
    window: Duration,
    last_sent: Mutex<HashMap<(NotifyLevel, String, Venue), Instant>>,
}

impl DedupNotifier {
    pub fn new(inner: Arc<dyn Notifier>, window: Duration) -> Self {
        Self {
            inner,
            window,
            last_sent: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Notifier for DedupNotifier {
    async fn notify(&self, level: NotifyLevel, title: &str, message: &str, venue: Venue) {
        let key = (level, title.to_string(), venue);
        let now = Instant::now();
        {
            let mut last_sent = self.last_sent.lock().await;
            if let Some(last) = last_sent.get(&key) {
                if now.duration_since(*last) < self.window {
                    return;
                }
            }
            last_sent.insert(key, now);
        }
        self.inner.notify(level, title, message, venue).await;
    }
}
