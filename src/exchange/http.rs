//! Rate-limited REST transport shared by the venue adapters
//!
//! Every request waits on a per-venue governor quota, then maps the HTTP
//! outcome into [`ExchangeError`]. Venue-level `code` fields inside a JSON body
//! are left for the adapter to classify.

use chrono::{DateTime, TimeZone, Utc};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Method, RequestBuilder,
};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::ExchangeError;
use crate::types::Venue;

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Requests per second each venue tolerates before throttling us.
pub fn venue_quota_per_second(venue: Venue) -> u32 {
    match venue {
        Venue::Bybit => 2,
        Venue::Binance => 20,
        Venue::Okx | Venue::Bitget | Venue::Bingx => 10,
        Venue::Upbit | Venue::Bithumb | Venue::Lighter => 5,
        Venue::Generic => 10,
    }
}

/// HTTP client bound to one venue's base URL and request quota
#[derive(Clone)]
pub struct VenueHttp {
    venue: Venue,
    client: Client,
    base_url: String,
    limiter: Arc<GovernorLimiter>,
}

impl VenueHttp {
    pub fn new(venue: Venue, base_url: &str) -> anyhow::Result<Self> {
        Self::with_timeout(venue, base_url, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(venue: Venue, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        let per_second = NonZeroU32::new(venue_quota_per_second(venue)).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            venue,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        })
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request against `base_url + path`.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Wait for quota, send, and decode the JSON body.
    pub async fn send(&self, request: RequestBuilder) -> Result<Value, ExchangeError> {
        self.limiter.until_ready().await;

        let response = request.send().await.map_err(ExchangeError::from)?;
        let status = response.status();
        let text = response.text().await.map_err(ExchangeError::from)?;

        classify_response(self.venue, status.as_u16(), &text)
    }
}

/// Map a raw HTTP status and body onto the error taxonomy.
///
/// 4xx bodies that parse as JSON are returned so the adapter can read the
/// venue's own error code (Binance `-2015`, Upbit `error.name`, ...).
pub fn classify_response(venue: Venue, status: u16, body: &str) -> Result<Value, ExchangeError> {
    if status == 429 || status >= 500 {
        return Err(ExchangeError::transient(format!(
            "{venue} HTTP {status}: {}",
            truncate(body)
        )));
    }
    if status == 401 || status == 403 {
        return Err(ExchangeError::Auth(format!("{venue} HTTP {status}: {}", truncate(body))));
    }

    match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            if status >= 400 {
                debug!(venue = %venue, status, "Venue returned error body");
            }
            Ok(value)
        }
        Err(_) if status >= 400 => Err(ExchangeError::rejected(status, truncate(body))),
        Err(e) => Err(ExchangeError::data(format!("{venue} non-JSON response: {e}"))),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Venue payloads mix JSON numbers and numeric strings.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Required numeric field, surfacing a data-integrity error when missing.
pub fn field_f64(value: &Value, key: &str) -> Result<f64, ExchangeError> {
    value
        .get(key)
        .and_then(as_f64)
        .ok_or_else(|| ExchangeError::data(format!("missing or non-numeric field '{key}'")))
}

/// Required strictly-positive price field.
pub fn positive_price(value: &Value, key: &str) -> Result<f64, ExchangeError> {
    let price = field_f64(value, key)?;
    if price <= 0.0 {
        return Err(ExchangeError::data(format!("non-positive price in '{key}': {price}")));
    }
    Ok(price)
}

/// Epoch milliseconds (number or string) as UTC.
pub fn millis_to_utc(value: &Value) -> Option<DateTime<Utc>> {
    as_i64(value).and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

pub fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(matches!(
            classify_response(Venue::Bybit, 503, "down"),
            Err(ExchangeError::Transient(_))
        ));
        assert!(matches!(
            classify_response(Venue::Binance, 429, "{}"),
            Err(ExchangeError::Transient(_))
        ));
    }

    #[test]
    fn unauthorized_status_is_auth() {
        assert!(matches!(
            classify_response(Venue::Okx, 401, "{\"code\":\"50113\"}"),
            Err(ExchangeError::Auth(_))
        ));
    }

    #[test]
    fn client_error_json_is_passed_through() {
        let body = classify_response(Venue::Binance, 400, "{\"code\":-4028,\"msg\":\"x\"}").unwrap();
        assert_eq!(body["code"], json!(-4028));

        assert!(matches!(
            classify_response(Venue::Binance, 400, "<html>"),
            Err(ExchangeError::Rejected { .. })
        ));
        assert!(matches!(
            classify_response(Venue::Binance, 200, "<html>"),
            Err(ExchangeError::DataIntegrity(_))
        ));
    }

    #[test]
    fn numeric_fields_accept_strings_and_reject_garbage() {
        let v = json!({"a": "1.5", "b": 2, "c": "NaN", "d": null, "p": "0"});
        assert_eq!(field_f64(&v, "a").unwrap(), 1.5);
        assert_eq!(field_f64(&v, "b").unwrap(), 2.0);
        assert!(field_f64(&v, "c").is_err());
        assert!(field_f64(&v, "d").is_err());
        assert!(positive_price(&v, "p").is_err());
    }

    #[test]
    fn quotas_match_venue_limits() {
        assert_eq!(venue_quota_per_second(Venue::Bybit), 2);
        assert_eq!(venue_quota_per_second(Venue::Binance), 20);
        assert_eq!(venue_quota_per_second(Venue::Upbit), 5);
    }
}
