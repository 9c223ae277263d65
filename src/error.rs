//! Typed error taxonomy for venue calls
//!
//! Adapter, stream and time-sync seams return [`ExchangeError`] so callers can
//! tell "retry" from "abort" from "treat as success" without string matching.

use thiserror::Error;

/// Duplicate client order id: Bybit, Binance futures, OKX
const DUPLICATE_ORDER_CODES: &[&str] = &["110072", "-4116", "51016"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// Network failure, timeout, 5xx or rate limit. Safe to retry.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Invalid key, bad signature, revoked permission. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Payload did not have the expected shape or carried a NaN/zero price.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// The venue processed the request and refused it.
    #[error("rejected by venue (code {code}): {message}")]
    Rejected { code: String, message: String },

    /// The venue has no such capability.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Entry filled but its stop-loss could not be attached; an emergency
    /// close was attempted. `closed` reports whether that close succeeded.
    #[error("stop-loss protection failed ({reason}); emergency close succeeded={closed}")]
    ProtectionFailed { reason: String, closed: bool },
}

impl ExchangeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    pub fn rejected(code: impl ToString, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Whether another attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Errors that must halt trading for the pair instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// The venue refused an order because its client id was already used.
    /// After a timed-out send this means the first attempt went through.
    pub fn is_duplicate_order(&self) -> bool {
        match self {
            Self::Rejected { code, message } => {
                DUPLICATE_ORDER_CODES.contains(&code.as_str()) || message.to_lowercase().contains("duplicate")
            }
            _ => false,
        }
    }

    /// Short machine-friendly tag for logs and trade records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Auth(_) => "auth",
            Self::DataIntegrity(_) => "data_integrity",
            Self::Rejected { .. } => "rejected",
            Self::NotSupported(_) => "not_supported",
            Self::ProtectionFailed { .. } => "protection_failed",
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::DataIntegrity(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                Self::Auth(e.to_string())
            }
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                Self::rejected(status.as_u16(), e.to_string())
            }
            _ => Self::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataIntegrity(e.to_string())
    }
}
