//! Grid: a ladder of post-only orders around the first observed mid.
//!
//! A filled buy at level price `p` re-arms a sell at `p·(1+spacing)`; a
//! filled sell re-arms a buy at `p·(1−spacing)`. Partial fills re-arm the
//! filled size, so the grid's total resting size stays constant.

use ahash::AHashMap;
use hx_core::error::HxResult;
use hx_core::types::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Action, OrderDraft, StepResult, positive, require};

const MAX_LEVELS: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    pub symbol: String,
    /// Orders on each side of the mid.
    pub levels: u32,
    /// Distance between levels as a fraction of price (0.002 = 0.2%).
    pub spacing_pct: f64,
    pub size_per_level: f64,
}

impl GridParams {
    pub(crate) fn validate(&self) -> HxResult<()> {
        require((1..=MAX_LEVELS).contains(&self.levels), format!("levels must be 1..={MAX_LEVELS}"))?;
        require(
            positive(self.spacing_pct) && self.spacing_pct * (self.levels as f64) < 1.0,
            "spacing_pct * levels must be in (0, 1)",
        )?;
        require(positive(self.size_per_level), "size_per_level must be positive")
    }
}

#[derive(Debug, Clone, PartialEq)]
struct GridOrder {
    side: Side,
    price: f64,
    size: f64,
    filled: f64,
}

pub struct GridStrategy {
    params: GridParams,
    center: Option<f64>,
    resting: AHashMap<String, GridOrder>,
}

impl GridStrategy {
    pub fn new(params: GridParams) -> Self {
        Self { params, center: None, resting: AHashMap::new() }
    }

    pub fn center(&self) -> Option<f64> {
        self.center
    }

    pub fn resting_orders(&self) -> usize {
        self.resting.len()
    }

    fn place(&mut self, side: Side, price: f64, size: f64) -> Action {
        let draft = OrderDraft::post_only(&self.params.symbol, side, size, price);
        self.resting.insert(draft.key.clone(), GridOrder { side, price, size, filled: 0.0 });
        Action::Place(draft)
    }

    pub fn on_tick(&mut self, event: &MarketEvent) -> StepResult {
        if event.symbol != self.params.symbol || self.center.is_some() {
            return Ok(Vec::new());
        }
        let mid = event.price;
        self.center = Some(mid);
        let (n, step, size) = (self.params.levels, self.params.spacing_pct, self.params.size_per_level);
        let mut actions = Vec::with_capacity(2 * n as usize);
        for i in 1..=n {
            let offset = step * i as f64;
            actions.push(self.place(Side::Buy, mid * (1.0 - offset), size));
            actions.push(self.place(Side::Sell, mid * (1.0 + offset), size));
        }
        debug!("[grid] {} armed {} levels around {mid}", self.params.symbol, n);
        Ok(actions)
    }

    pub fn on_fill(&mut self, fill: &Fill) -> StepResult {
        let Some(order) = self.resting.get_mut(&fill.idempotency_key) else {
            return Ok(Vec::new());
        };
        order.filled += fill.size;
        let (side, level) = (order.side, order.price);
        if order.filled + SIZE_EPS >= order.size {
            self.resting.remove(&fill.idempotency_key);
        }

        let step = self.params.spacing_pct;
        let (next_side, next_price) = match side {
            Side::Buy => (Side::Sell, level * (1.0 + step)),
            Side::Sell => (Side::Buy, level * (1.0 - step)),
        };
        if next_price <= 0.0 {
            return Err(format!("re-arm price {next_price} for level {level} is not positive"));
        }
        Ok(vec![self.place(next_side, next_price, fill.size)])
    }

    pub fn on_order_failed(&mut self, key: &str) {
        self.resting.remove(key);
    }
}
