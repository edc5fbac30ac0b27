//! Maker rebate: keep a post-only bid and ask around the mid and collect the
//! exchange's negative maker fee.
//!
//! Quotes are replaced when the mid drifts more than `requote_bps` from the
//! quoted mid, or after either side fills. Once |inventory| reaches
//! `max_inventory` only the side that reduces it is quoted.
//!
//! A replaced quote can still fill before its cancel lands, so cancelled
//! quotes stay tracked as retiring and their fills still count.

use std::collections::VecDeque;

use hx_core::error::HxResult;
use hx_core::types::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Action, OrderDraft, StepResult, positive, require};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerRebateParams {
    pub symbol: String,
    /// Half-spread from the mid, in basis points.
    pub spread_bps: f64,
    /// Mid drift that triggers a requote, in basis points.
    pub requote_bps: f64,
    pub order_size: f64,
    /// Absolute inventory cap, in base units.
    pub max_inventory: f64,
}

impl MakerRebateParams {
    pub(crate) fn validate(&self) -> HxResult<()> {
        require(positive(self.spread_bps) && self.spread_bps < 10_000.0, "spread_bps must be in (0, 10000)")?;
        require(positive(self.requote_bps), "requote_bps must be positive")?;
        require(positive(self.order_size), "order_size must be positive")?;
        require(positive(self.max_inventory), "max_inventory must be positive")
    }
}

/// Cancelled quotes remembered for late fills.
const RETIRING_CAP: usize = 64;

#[derive(Debug, Clone)]
struct Quote {
    key: String,
    size: f64,
    filled: f64,
}

pub struct MakerRebateStrategy {
    params: MakerRebateParams,
    quoted_mid: Option<f64>,
    bid: Option<Quote>,
    ask: Option<Quote>,
    retiring: VecDeque<Quote>,
    inventory: f64,
    rebates: f64,
}

impl MakerRebateStrategy {
    pub fn new(params: MakerRebateParams) -> Self {
        Self {
            params,
            quoted_mid: None,
            bid: None,
            ask: None,
            retiring: VecDeque::new(),
            inventory: 0.0,
            rebates: 0.0,
        }
    }

    pub fn inventory(&self) -> f64 {
        self.inventory
    }

    /// Rebates earned so far (quote units).
    pub fn rebates(&self) -> f64 {
        self.rebates
    }

    pub fn on_tick(&mut self, event: &MarketEvent) -> StepResult {
        if event.symbol != self.params.symbol {
            return Ok(Vec::new());
        }
        let mid = event.price;
        let stale = match self.quoted_mid {
            None => true,
            Some(q) => ((mid - q).abs() / q) * 10_000.0 > self.params.requote_bps,
        };
        if !stale {
            return Ok(Vec::new());
        }

        let mut actions = Vec::with_capacity(4);
        for quote in [self.bid.take(), self.ask.take()].into_iter().flatten() {
            actions.push(Action::Cancel { key: quote.key.clone() });
            self.retire(quote);
        }

        let half = self.params.spread_bps / 10_000.0;
        let size = self.params.order_size;
        let cap = self.params.max_inventory;
        if self.inventory < cap {
            let d = OrderDraft::post_only(&self.params.symbol, Side::Buy, size, mid * (1.0 - half));
            self.bid = Some(Quote { key: d.key.clone(), size, filled: 0.0 });
            actions.push(Action::Place(d));
        }
        if self.inventory > -cap {
            let d = OrderDraft::post_only(&self.params.symbol, Side::Sell, size, mid * (1.0 + half));
            self.ask = Some(Quote { key: d.key.clone(), size, filled: 0.0 });
            actions.push(Action::Place(d));
        }
        self.quoted_mid = Some(mid);
        debug!("[maker] {} quoted around {mid} (inventory {})", self.params.symbol, self.inventory);
        Ok(actions)
    }

    fn retire(&mut self, quote: Quote) {
        if self.retiring.len() == RETIRING_CAP {
            if let Some(old) = self.retiring.pop_front() {
                debug!("[maker] forgetting retired quote {}", old.key);
            }
        }
        self.retiring.push_back(quote);
    }

    pub fn on_fill(&mut self, fill: &Fill) -> StepResult {
        let key = fill.idempotency_key.as_str();
        if self.bid.as_ref().is_some_and(|q| q.key == key) {
            Self::fill_slot(&mut self.bid, fill.size);
        } else if self.ask.as_ref().is_some_and(|q| q.key == key) {
            Self::fill_slot(&mut self.ask, fill.size);
        } else if let Some(i) = self.retiring.iter().position(|q| q.key == key) {
            self.retiring[i].filled += fill.size;
            if self.retiring[i].filled + SIZE_EPS >= self.retiring[i].size {
                self.retiring.remove(i);
            }
            debug!("[maker] late fill {} on retired quote {key}", fill.size);
        } else {
            return Ok(Vec::new());
        }
        self.inventory += fill.side.sign() * fill.size;
        if fill.fee < 0.0 {
            self.rebates -= fill.fee;
        }
        // Requote both sides on the next tick.
        self.quoted_mid = None;
        Ok(Vec::new())
    }

    fn fill_slot(slot: &mut Option<Quote>, size: f64) {
        if let Some(q) = slot.as_mut() {
            q.filled += size;
            if q.filled + SIZE_EPS >= q.size {
                *slot = None;
            }
        }
    }

    pub fn on_order_failed(&mut self, key: &str) {
        self.retiring.retain(|q| q.key != key);
        if self.bid.as_ref().is_some_and(|q| q.key == key) {
            self.bid = None;
        }
        if self.ask.as_ref().is_some_and(|q| q.key == key) {
            self.ask = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(max_inventory: f64) -> MakerRebateStrategy {
        MakerRebateStrategy::new(MakerRebateParams {
            symbol: "ETH".into(),
            spread_bps: 10.0,
            requote_bps: 20.0,
            order_size: 1.0,
            max_inventory,
        })
    }

    fn tick(price: f64) -> MarketEvent {
        MarketEvent { symbol: "ETH".into(), price, timestamp_us: 1, kind: TickType::BookUpdate, epoch: 1 }
    }

    fn places(actions: &[Action]) -> Vec<&OrderDraft> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Place(d) => Some(d),
                Action::Cancel { .. } => None,
            })
            .collect()
    }

    fn cancels(actions: &[Action]) -> usize {
        actions.iter().filter(|a| matches!(a, Action::Cancel { .. })).count()
    }

    fn fill(d: &OrderDraft, fee: f64) -> Fill {
        Fill {
            fill_id: "f".into(),
            order_id: 1,
            idempotency_key: d.key.clone(),
            owner: Owner::user("u"),
            strategy_id: None,
            symbol: "ETH".into(),
            side: d.side,
            size: d.size,
            price: d.price.limit().unwrap_or(0.0),
            fee,
            timestamp_us: 2,
        }
    }

    #[test]
    fn quotes_both_sides_and_requotes_on_drift() {
        let mut s = strategy(5.0);
        let a = s.on_tick(&tick(1000.0)).unwrap();
        let p = places(&a);
        assert_eq!(p.len(), 2);
        let bid = p.iter().find(|d| d.side == Side::Buy).unwrap();
        let ask = p.iter().find(|d| d.side == Side::Sell).unwrap();
        assert!((bid.price.limit().unwrap() - 999.0).abs() < 1e-9);
        assert!((ask.price.limit().unwrap() - 1001.0).abs() < 1e-9);
        assert!(bid.post_only && ask.post_only);

        // 10 bps drift: inside the 20 bps band.
        assert!(s.on_tick(&tick(1001.0)).unwrap().is_empty());
        // 30 bps drift: cancel both, quote again.
        let a = s.on_tick(&tick(1003.0)).unwrap();
        assert_eq!(cancels(&a), 2);
        assert_eq!(places(&a).len(), 2);
    }

    #[test]
    fn inventory_cap_quotes_reducing_side_only() {
        let mut s = strategy(1.0);
        let a = s.on_tick(&tick(100.0)).unwrap();
        let bid = (*places(&a).iter().find(|d| d.side == Side::Buy).unwrap()).clone();
        s.on_fill(&fill(&bid, -0.01)).unwrap();
        assert!((s.inventory() - 1.0).abs() < 1e-12);
        assert!((s.rebates() - 0.01).abs() < 1e-12);

        let a = s.on_tick(&tick(100.0)).unwrap();
        // Only the resting ask is cancelled; the filled bid is gone already.
        assert_eq!(cancels(&a), 1);
        let p = places(&a);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].side, Side::Sell);
    }

    #[test]
    fn taker_fees_are_not_rebates() {
        let mut s = strategy(5.0);
        let a = s.on_tick(&tick(100.0)).unwrap();
        let ask = (*places(&a).iter().find(|d| d.side == Side::Sell).unwrap()).clone();
        s.on_fill(&fill(&ask, 0.02)).unwrap();
        assert_eq!(s.rebates(), 0.0);
        assert!((s.inventory() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn fill_on_a_replaced_quote_still_moves_inventory() {
        let mut s = strategy(5.0);
        let a = s.on_tick(&tick(100.0)).unwrap();
        let old_bid = (*places(&a).iter().find(|d| d.side == Side::Buy).unwrap()).clone();
        // 100 bps drift replaces both quotes.
        let a = s.on_tick(&tick(101.0)).unwrap();
        assert_eq!(cancels(&a), 2);

        // The old bid filled before its cancel landed.
        s.on_fill(&fill(&old_bid, -0.01)).unwrap();
        assert!((s.inventory() - 1.0).abs() < 1e-12);
        assert!((s.rebates() - 0.01).abs() < 1e-12);

        // Fully filled: it is no longer tracked.
        s.on_fill(&fill(&old_bid, -0.01)).unwrap();
        assert!((s.inventory() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn failed_retired_quote_is_forgotten() {
        let mut s = strategy(5.0);
        let a = s.on_tick(&tick(100.0)).unwrap();
        let old_ask = (*places(&a).iter().find(|d| d.side == Side::Sell).unwrap()).clone();
        s.on_tick(&tick(101.0)).unwrap();
        s.on_order_failed(&old_ask.key);
        s.on_fill(&fill(&old_ask, 0.0)).unwrap();
        assert_eq!(s.inventory(), 0.0);
    }
}
