//! Unified error types for the sniper.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use time::OffsetDateTime;

/// Unified error type for the sniper.
#[derive(Error, Debug)]
pub enum BotError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Market discovery error.
    #[error("market error: {0}")]
    Market(#[from] MarketError),

    /// Live feed error.
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    /// Trigger scheduling error.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Order build/submission error.
    #[error("order error: {0}")]
    Order(#[from] OrderError),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Credential or signing failure. Fatal: stops the supervisor.
    #[error("signature error: {0}")]
    Signature(String),

    /// HTTP request error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Market discovery errors.
#[derive(Error, Debug)]
pub enum MarketError {
    /// Search request failed.
    #[error("market search for '{query}' failed: {reason}")]
    SearchFailed {
        /// The search query.
        query: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to parse market data.
    #[error("failed to parse market data: {0}")]
    ParseError(String),

    /// HTTP request failed.
    #[error("http request failed: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Live order-book feed errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// No first snapshot arrived within the connect timeout.
    #[error("feed connect timed out after {timeout:?}")]
    ConnectTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Reconnect budget exhausted.
    #[error("feed lost after {attempts} reconnect attempts")]
    Lost {
        /// Reconnect attempts made before giving up.
        attempts: u32,
    },

    /// The feed task ended without reporting a reason.
    #[error("feed task stopped")]
    Closed,
}

/// Trigger scheduling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The resolution deadline passed before the wait completed.
    #[error("missed window: deadline {deadline} passed (now {now})")]
    MissedWindow {
        /// Resolution deadline.
        deadline: OffsetDateTime,
        /// Wall-clock time when the miss was observed.
        now: OffsetDateTime,
    },

    /// Wall clock disagrees with the feed's server time by more than the fault bound.
    #[error("clock drift fault: {drift_ms}ms exceeds bound {bound_ms}ms")]
    DriftFault {
        /// Observed drift (server minus local), milliseconds.
        drift_ms: i64,
        /// Configured fault bound, milliseconds.
        bound_ms: i64,
    },
}

/// Why the exchange definitively refused an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Collateral allowance not approved or too low.
    InsufficientAllowance,
    /// Not enough collateral.
    InsufficientBalance,
    /// Price outside the tick grid or range.
    InvalidPrice,
    /// Market no longer accepts orders.
    MarketClosed,
    /// Fill-or-Kill could not be filled in full.
    NotFilled,
    /// Anything else the exchange reported.
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InsufficientAllowance => f.write_str("insufficient allowance"),
            RejectReason::InsufficientBalance => f.write_str("insufficient balance"),
            RejectReason::InvalidPrice => f.write_str("invalid price"),
            RejectReason::MarketClosed => f.write_str("market closed"),
            RejectReason::NotFilled => f.write_str("not filled"),
            RejectReason::Other(msg) => f.write_str(msg),
        }
    }
}

/// Order build and submission errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    /// Order parameters failed validation.
    #[error("invalid order parameters: {0}")]
    InvalidParams(String),

    /// Price outside (0, 1).
    #[error("price {0} outside (0, 1)")]
    PriceOutOfRange(Decimal),

    /// Definitive rejection; never retried.
    #[error("order rejected: {0}")]
    Rejected(RejectReason),

    /// Network error, timeout, or server-side hiccup; retryable.
    #[error("transient submission error: {0}")]
    Transient(String),

    /// Rate limited by the API; retryable.
    #[error("rate limited")]
    RateLimited,

    /// Signing or API credential failure; fatal.
    #[error("signing error: {0}")]
    Signature(String),
}

impl OrderError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrderError::Transient(_) | OrderError::RateLimited)
    }
}

/// WebSocket connection and message errors.
#[derive(Error, Debug)]
pub enum WsError {
    /// Connection failed.
    #[error("websocket connection failed: {0}")]
    ConnectionFailed(String),

    /// Message parsing failed.
    #[error("failed to parse websocket message: {0}")]
    ParseError(String),

    /// Send failed.
    #[error("failed to send websocket message: {0}")]
    SendFailed(String),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, BotError>;
