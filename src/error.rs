//! Crate-wide error types.
//!
//! Typed `thiserror` enums for each layer (exchange, order, domain,
//! repository), converging into one `Error` facade so public APIs have a
//! single return type. `anyhow` is reserved for the binary/composition-root
//! edge (see `main.rs`, `cli.rs`).

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by an `ExchangeConnector` implementation.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network/timeout/rate-limit failures that are safe to retry.
    #[error("exchange connection error: {0}")]
    Connection(String),

    /// The exchange does not recognize the referenced order.
    #[error("order not found: {order_id} ({symbol})")]
    OrderNotFound { order_id: String, symbol: String },

    /// Generic exchange-reported error, carrying the raw message and an
    /// optional HTTP/exchange status code.
    #[error("exchange API error: {message}{}", status_code.map(|c| format!(" (status {c})")).unwrap_or_default())]
    Api {
        message: String,
        status_code: Option<u16>,
    },

    /// A market order's realized slippage (or pre-check estimate) exceeded
    /// the configured threshold.
    #[error("slippage exceeded: expected {expected}, got {actual} (max {max_percent}%)")]
    SlippageExceeded {
        expected: Decimal,
        actual: Decimal,
        max_percent: Decimal,
    },
}

impl ExchangeError {
    /// Errors transient enough to retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Connection(_))
    }

    /// Whether the error message indicates a precision-cache invalidation is
    /// warranted (tick/step/notional mismatch reported by the exchange).
    pub fn mentions_precision(&self) -> bool {
        let msg = match self {
            ExchangeError::Api { message, .. } => message.to_lowercase(),
            ExchangeError::Connection(message) => message.to_lowercase(),
            _ => return false,
        };
        ["precision", "lot size", "step size", "tick size", "quantity", "notional", "min_qty"]
            .iter()
            .any(|kw| msg.contains(kw))
    }

    /// Whether the exchange's message indicates the account lacks the funds
    /// to cover the requested order (spec §4.2/§7 exit-signal retry).
    pub fn mentions_insufficient_balance(&self) -> bool {
        let msg = match self {
            ExchangeError::Api { message, .. } => message.to_lowercase(),
            _ => return false,
        };
        ["insufficient", "balance", "not enough funds"].iter().any(|kw| msg.contains(kw))
    }
}

/// Errors raised while performing a single order operation.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("order submission failed after exhausting retries: {0}")]
    SubmissionExhausted(String),

    #[error("cancel verification failed for order {0}")]
    VerificationFailed(String),

    #[error("precision rules unavailable for {0}")]
    PrecisionUnavailable(String),

    #[error("resulting notional {notional} below minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
}

/// Domain-level invariant violations.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("duplicate position for this (user, exchange, symbol, timeframe, side)")]
    DuplicatePosition,

    #[error("position group {0} not found")]
    PositionGroupNotFound(String),

    #[error("position group {0} is already closed")]
    AlreadyClosed(String),

    #[error("caller {caller} is not the owner of position group {group_id}")]
    NotOwner { caller: String, group_id: String },
}

/// Errors surfaced by a `Repositories` implementation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("task join error: {0}")]
    Join(String),
}

/// Crate-wide error facade returned by public, fallible APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
