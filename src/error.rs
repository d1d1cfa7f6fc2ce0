use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ExchangeId, LegRole};

/// Main error type for the hedge engine
#[derive(Error, Debug)]
pub enum HedgeError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Clock errors
    #[error("Clock failure on {exchange}: {reason}")]
    ClockFailure { exchange: ExchangeId, reason: String },

    // Scheduling errors
    #[error("Scheduling rejected on {exchange}: lead time {lead_ms}ms below minimum {min_lead_ms}ms")]
    Scheduling {
        exchange: ExchangeId,
        lead_ms: i64,
        min_lead_ms: i64,
    },

    // Leg execution errors
    #[error("{leg} leg on {exchange} failed: {reason}")]
    LegExecution {
        exchange: ExchangeId,
        leg: LegRole,
        reason: String,
    },

    // Reconciliation errors
    #[error("Unhedged drift on position {position_id}: {missing} leg is not open")]
    UnhedgedDrift { position_id: Uuid, missing: LegRole },

    #[error("Reconciliation query failed on {exchange}: {reason}")]
    ReconciliationQuery { exchange: ExchangeId, reason: String },

    // Connector transport errors
    #[error("Rate limited by {exchange}: {reason}")]
    RateLimited { exchange: ExchangeId, reason: String },

    /// The request never reached the exchange matching engine.
    #[error("Transient failure on {exchange}: {reason}")]
    Transient { exchange: ExchangeId, reason: String },

    #[error("Order rejected by {exchange}: {reason}")]
    OrderRejected { exchange: ExchangeId, reason: String },

    #[error("Exchange error on {exchange}: {reason}")]
    Exchange { exchange: ExchangeId, reason: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State errors
    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl HedgeError {
    /// Whether the failed request is known not to have been submitted, so it
    /// may be retried without risking a double fill.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HedgeError::RateLimited { .. } | HedgeError::Transient { .. }
        )
    }

    /// Exchange implicated by this error, when there is one.
    pub fn exchange(&self) -> Option<ExchangeId> {
        match self {
            HedgeError::ClockFailure { exchange, .. }
            | HedgeError::Scheduling { exchange, .. }
            | HedgeError::LegExecution { exchange, .. }
            | HedgeError::ReconciliationQuery { exchange, .. }
            | HedgeError::RateLimited { exchange, .. }
            | HedgeError::Transient { exchange, .. }
            | HedgeError::OrderRejected { exchange, .. }
            | HedgeError::Exchange { exchange, .. } => Some(*exchange),
            _ => None,
        }
    }
}

/// Result type alias for HedgeError
pub type Result<T> = std::result::Result<T, HedgeError>;
