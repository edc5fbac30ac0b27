//! Enumerations used throughout the engine.
//!
//! Everything here is a closed set: order/strategy lifecycles, tick kinds and
//! the network selector. All enums are `Copy` and serde-serializable so they
//! can be persisted in state snapshots and rendered by the command layer.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Exchange network the engine trades against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Testnet,
    Mainnet,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Testnet => write!(f, "testnet"),
            Self::Mainnet => write!(f, "mainnet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order side / status
// ---------------------------------------------------------------------------

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// `+1.0` for buys, `-1.0` for sells.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// The side that reduces a position of the given signed size.
    pub fn closing(net_size: f64) -> Self {
        if net_size > 0.0 { Self::Sell } else { Self::Buy }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order lifecycle status.
///
/// `Filled`, `Cancelled` and `Rejected` are terminal. `Pending` is used for
/// orders whose exchange state has not been confirmed yet (e.g. rehydrated
/// after a restart and awaiting reconciliation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Whether the order may still rest on the exchange book.
    #[inline]
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Kind of a normalized market tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickType {
    Trade,
    BookUpdate,
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// The closed set of strategy kinds the scheduler can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Grid,
    MakerRebate,
    Staking,
    Arbitrage,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grid => write!(f, "grid"),
            Self::MakerRebate => write!(f, "maker_rebate"),
            Self::Staking => write!(f, "staking"),
            Self::Arbitrage => write!(f, "arbitrage"),
        }
    }
}

/// Lifecycle status of a strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyStatus {
    Stopped,
    Running,
    Paused,
    Faulted,
}

impl StrategyStatus {
    /// Running and paused instances both occupy their (owner, kind, symbol) slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}
