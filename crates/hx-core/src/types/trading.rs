//! Trading structures: intents, orders, fills, positions and risk limits.
//!
//! These types flow between strategies, the risk manager and the gateway.
//! Sizes are in base units, prices in quote units, notionals in quote units.

use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, Side};
use super::owner::{OrderId, Owner, StrategyId};

/// Sizes closer to zero than this are treated as flat.
pub const SIZE_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Order intent (strategy -> risk manager -> gateway)
// ---------------------------------------------------------------------------

/// Limit price or "take whatever the book offers".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderPrice {
    Limit(f64),
    Market,
}

impl OrderPrice {
    pub fn limit(&self) -> Option<f64> {
        match self {
            Self::Limit(p) => Some(*p),
            Self::Market => None,
        }
    }
}

/// A request to trade, produced by a strategy tick or by the risk manager.
///
/// The idempotency key is generated once when the intent is created and is
/// reused verbatim on every retry, so the exchange never sees two distinct
/// orders for the same intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Producing strategy; `None` for risk-generated closes.
    pub strategy_id: Option<StrategyId>,
    pub owner: Owner,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: OrderPrice,
    pub idempotency_key: String,
    /// Rest on the book only (maker); rejected by the exchange if it would cross.
    #[serde(default)]
    pub post_only: bool,
    /// May only shrink an existing position.
    #[serde(default)]
    pub reduce_only: bool,
}

impl OrderIntent {
    /// Signed size: positive for buys, negative for sells.
    pub fn signed_size(&self) -> f64 {
        self.side.sign() * self.size
    }
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let px = match self.price {
            OrderPrice::Limit(p) => format!("{p:.8}"),
            OrderPrice::Market => "MKT".to_string(),
        };
        write!(
            f,
            "Intent({} {} {} {:.8}@{} key={})",
            self.owner, self.side, self.symbol, self.size, px, self.idempotency_key
        )
    }
}

// ---------------------------------------------------------------------------
// Order (gateway-acknowledged)
// ---------------------------------------------------------------------------

/// An order the exchange has acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub intent: OrderIntent,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_price: f64,
    pub created_us: u64,
    pub updated_us: u64,
}

impl Order {
    pub fn owner(&self) -> &Owner {
        &self.intent.owner
    }

    pub fn key(&self) -> &str {
        &self.intent.idempotency_key
    }

    /// Size still resting (zero once terminal).
    pub fn remaining(&self) -> f64 {
        if self.status.is_terminal() {
            0.0
        } else {
            (self.intent.size - self.filled_size).max(0.0)
        }
    }

    /// Fold one execution into the order's fill totals and status.
    pub fn apply_fill(&mut self, size: f64, price: f64, now_us: u64) {
        let total = self.filled_size + size;
        if total > SIZE_EPS {
            self.avg_price = (self.avg_price * self.filled_size + price * size) / total;
        }
        self.filled_size = total;
        if !self.status.is_terminal() {
            self.status = if self.filled_size + SIZE_EPS >= self.intent.size {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        }
        self.updated_us = now_us;
    }
}

// ---------------------------------------------------------------------------
// Fill (exchange -> gateway -> scheduler)
// ---------------------------------------------------------------------------

/// One execution against an order. `fill_id` is unique per execution and is
/// the deduplication key for at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: OrderId,
    pub idempotency_key: String,
    pub owner: Owner,
    pub strategy_id: Option<StrategyId>,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    /// Fee paid in quote units; negative means a maker rebate was received.
    pub fee: f64,
    pub timestamp_us: u64,
}

impl Fill {
    pub fn notional(&self) -> f64 {
        self.size * self.price
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Net position of one owner in one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub owner: Owner,
    pub symbol: String,
    /// Positive = long, negative = short.
    pub net_size: f64,
    /// Average entry price of the open size (0 when flat).
    pub entry_price: f64,
    /// Last known mark price.
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    /// Realized P&L accumulated over the position's lifetime (net of fees).
    pub realized_pnl: f64,
}

impl Position {
    pub fn new(owner: Owner, symbol: impl Into<String>) -> Self {
        Self {
            owner,
            symbol: symbol.into(),
            net_size: 0.0,
            entry_price: 0.0,
            mark_price: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.net_size.abs() <= SIZE_EPS
    }

    /// Mark price if known, otherwise the entry price.
    pub fn reference_price(&self) -> f64 {
        if self.mark_price > 0.0 { self.mark_price } else { self.entry_price }
    }

    /// Absolute notional at the reference price.
    pub fn notional(&self) -> f64 {
        self.net_size.abs() * self.reference_price()
    }

    /// Apply one execution. Returns the P&L realized by this fill (before fees).
    ///
    /// Increasing fills move the entry price to the size-weighted average;
    /// reducing fills realize P&L against the entry; a fill that flips the
    /// position opens the remainder at the fill price.
    pub fn apply_fill(&mut self, side: Side, size: f64, price: f64) -> f64 {
        let signed = side.sign() * size;
        let mut realized = 0.0;

        if self.is_flat() || self.net_size.signum() == signed.signum() {
            let new_net = self.net_size + signed;
            self.entry_price =
                (self.net_size.abs() * self.entry_price + size * price) / new_net.abs();
            self.net_size = new_net;
        } else {
            let closing = size.min(self.net_size.abs());
            realized = closing * (price - self.entry_price) * self.net_size.signum();
            let flips = size > self.net_size.abs() + SIZE_EPS;
            self.net_size += signed;
            if self.is_flat() {
                self.net_size = 0.0;
                self.entry_price = 0.0;
            } else if flips {
                self.entry_price = price;
            }
        }

        if self.mark_price <= 0.0 {
            self.mark_price = price;
        }
        self.realized_pnl += realized;
        self.refresh_unrealized();
        realized
    }

    /// Update the mark price and unrealized P&L.
    pub fn mark(&mut self, price: f64) {
        self.mark_price = price;
        self.refresh_unrealized();
    }

    fn refresh_unrealized(&mut self) {
        self.unrealized_pnl = if self.is_flat() {
            0.0
        } else {
            self.net_size * (self.reference_price() - self.entry_price)
        };
    }
}

// ---------------------------------------------------------------------------
// Risk limits
// ---------------------------------------------------------------------------

/// Per-owner risk limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimit {
    pub owner: Owner,
    /// Maximum total notional / equity.
    pub max_leverage: f64,
    /// Maximum absolute notional in any single symbol.
    pub max_position_notional: f64,
    /// Unrealized loss, as a fraction of entry notional, that closes a position.
    pub stop_loss_threshold: f64,
    /// Maximum realized + unrealized loss per trading day (positive number).
    pub max_daily_loss: f64,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Account snapshot as reported by the exchange for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub owner: Owner,
    /// Account value including unrealized P&L.
    pub equity: f64,
    /// Margin currently locked by positions and resting orders.
    pub margin_used: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> Position {
        Position::new(Owner::user("u"), "BTC")
    }

    #[test]
    fn increase_averages_entry() {
        let mut p = pos();
        p.apply_fill(Side::Buy, 1.0, 100.0);
        p.apply_fill(Side::Buy, 1.0, 110.0);
        assert!((p.net_size - 2.0).abs() < 1e-12);
        assert!((p.entry_price - 105.0).abs() < 1e-12);
    }

    #[test]
    fn reduce_realizes_pnl() {
        let mut p = pos();
        p.apply_fill(Side::Buy, 2.0, 100.0);
        let r = p.apply_fill(Side::Sell, 1.0, 120.0);
        assert!((r - 20.0).abs() < 1e-12);
        assert!((p.net_size - 1.0).abs() < 1e-12);
        assert!((p.entry_price - 100.0).abs() < 1e-12);
    }

    #[test]
    fn flip_opens_remainder_at_fill_price() {
        let mut p = pos();
        p.apply_fill(Side::Sell, 1.0, 50.0);
        let r = p.apply_fill(Side::Buy, 3.0, 40.0);
        assert!((r - 10.0).abs() < 1e-12);
        assert!((p.net_size - 2.0).abs() < 1e-12);
        assert!((p.entry_price - 40.0).abs() < 1e-12);
    }

    #[test]
    fn close_to_flat_resets_entry() {
        let mut p = pos();
        p.apply_fill(Side::Buy, 1.5, 10.0);
        p.apply_fill(Side::Sell, 1.5, 9.0);
        assert!(p.is_flat());
        assert_eq!(p.entry_price, 0.0);
        assert_eq!(p.unrealized_pnl, 0.0);
        assert!((p.realized_pnl + 1.5).abs() < 1e-12);
    }

    #[test]
    fn mark_updates_unrealized() {
        let mut p = pos();
        p.apply_fill(Side::Sell, 2.0, 100.0);
        p.mark(90.0);
        assert!((p.unrealized_pnl - 20.0).abs() < 1e-12);
        assert!((p.notional() - 180.0).abs() < 1e-12);
    }

    #[test]
    fn order_fill_progression() {
        let intent = OrderIntent {
            strategy_id: None,
            owner: Owner::user("u"),
            symbol: "ETH".into(),
            side: Side::Buy,
            size: 2.0,
            price: OrderPrice::Limit(10.0),
            idempotency_key: "k".into(),
            post_only: false,
            reduce_only: false,
        };
        let mut o = Order {
            order_id: 1,
            intent,
            status: OrderStatus::Open,
            filled_size: 0.0,
            avg_price: 0.0,
            created_us: 0,
            updated_us: 0,
        };
        o.apply_fill(1.0, 10.0, 1);
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert!((o.remaining() - 1.0).abs() < 1e-12);
        o.apply_fill(1.0, 12.0, 2);
        assert_eq!(o.status, OrderStatus::Filled);
        assert!((o.avg_price - 11.0).abs() < 1e-12);
        assert_eq!(o.remaining(), 0.0);
    }
}
