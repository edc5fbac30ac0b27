//! Typed error definitions for the engine.
//!
//! [`HxError`] is the error taxonomy every component boundary returns. All
//! variants implement `std::error::Error` via `thiserror`, so they convert
//! into `anyhow::Error` at the process edges (runner, config, persistence).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{StopScope, StrategyId};

/// Why the risk manager refused an intent. The first failing check wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DenyReason {
    /// Symbol notional after the hypothetical fill exceeds the limit.
    PositionNotional { projected: f64, limit: f64 },
    /// Total notional / equity after the hypothetical fill exceeds the limit.
    Leverage { projected: f64, limit: f64 },
    /// Today's realized + unrealized loss already exceeds the limit.
    DailyLoss { loss: f64, limit: f64 },
    /// The owner has no positive equity to back a new exposure.
    NoEquity,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionNotional { projected, limit } => {
                write!(f, "position notional {projected:.2} exceeds limit {limit:.2}")
            }
            Self::Leverage { projected, limit } => {
                write!(f, "leverage {projected:.3}x exceeds limit {limit:.3}x")
            }
            Self::DailyLoss { loss, limit } => {
                write!(f, "daily loss {loss:.2} exceeds limit {limit:.2}")
            }
            Self::NoEquity => write!(f, "no equity"),
        }
    }
}

/// Domain-specific errors for the engine.
#[derive(Debug, Clone, Error)]
pub enum HxError {
    /// Malformed intent or request; rejected synchronously, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A risk limit would be breached; no order was placed.
    #[error("risk denied: {0}")]
    RiskDenied(DenyReason),

    /// Network failure that survived the gateway's bounded retries.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Retries exhausted without a definite answer. The order may exist on
    /// the exchange; reconcile by key before acting.
    #[error("submission outcome unknown for key {key}")]
    SubmissionUnknown { key: String },

    /// The exchange refused the request (terminal).
    #[error("exchange rejected: {0}")]
    ExchangeRejected(String),

    /// A strategy instance failed unrecoverably.
    #[error("strategy {id} fault: {reason}")]
    StrategyFault { id: StrategyId, reason: String },

    /// Trading is halted for this scope by an emergency stop.
    #[error("trading halted ({0})")]
    Halted(StopScope),

    /// An instance with the same (owner, kind, symbol) is already active.
    #[error("already running: {0}")]
    AlreadyRunning(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Vault accounting rule violated (e.g. withdrawal above entitlement).
    #[error("vault error: {0}")]
    Vault(String),

    /// Agent wallet missing, mis-scoped or unable to sign.
    #[error("agent error: {0}")]
    Agent(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl HxError {
    /// Whether a failed submission certainly left no order behind. Only
    /// `SubmissionUnknown` is ambiguous: a `TransientNetwork` from submit
    /// means every attempt failed before reaching the matching engine.
    pub fn definitely_not_placed(&self) -> bool {
        !matches!(self, Self::SubmissionUnknown { .. })
    }
}

pub type HxResult<T> = Result<T, HxError>;
