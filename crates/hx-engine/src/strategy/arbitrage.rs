//! Basis arbitrage between two related symbols.
//!
//! basis_bps = (p_sym − p_hedge) / p_hedge · 1e4
//!
//! Flat and basis > `entry_bps`: sell sym, buy hedge. Flat and basis <
//! −`entry_bps`: buy sym, sell hedge. Positioned and |basis| < `exit_bps`:
//! close both legs reduce-only. Nothing new is sent while any leg is
//! outstanding.

use ahash::AHashMap;
use hx_core::error::HxResult;
use hx_core::types::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Action, OrderDraft, StepResult, positive, require};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageParams {
    pub symbol: String,
    pub hedge_symbol: String,
    pub entry_bps: f64,
    pub exit_bps: f64,
    /// Size of each leg, in base units.
    pub size: f64,
}

impl ArbitrageParams {
    pub(crate) fn validate(&self) -> HxResult<()> {
        require(self.symbol != self.hedge_symbol, "symbol and hedge_symbol must differ")?;
        require(positive(self.entry_bps), "entry_bps must be positive")?;
        require(
            self.exit_bps.is_finite() && self.exit_bps >= 0.0 && self.exit_bps < self.entry_bps,
            "exit_bps must be in [0, entry_bps)",
        )?;
        require(positive(self.size), "size must be positive")
    }
}

pub struct ArbitrageStrategy {
    params: ArbitrageParams,
    price: Option<f64>,
    hedge_price: Option<f64>,
    net: f64,
    hedge_net: f64,
    /// Outstanding legs: key -> unfilled size.
    legs: AHashMap<String, f64>,
}

impl ArbitrageStrategy {
    pub fn new(params: ArbitrageParams) -> Self {
        Self { params, price: None, hedge_price: None, net: 0.0, hedge_net: 0.0, legs: AHashMap::new() }
    }

    /// Net size held in (symbol, hedge_symbol).
    pub fn legs(&self) -> (f64, f64) {
        (self.net, self.hedge_net)
    }

    pub fn basis_bps(&self) -> Option<f64> {
        match (self.price, self.hedge_price) {
            (Some(p), Some(h)) if h > 0.0 => Some((p - h) / h * 10_000.0),
            _ => None,
        }
    }

    fn is_flat(&self) -> bool {
        self.net.abs() <= SIZE_EPS && self.hedge_net.abs() <= SIZE_EPS
    }

    fn send(&mut self, draft: OrderDraft, out: &mut Vec<Action>) {
        self.legs.insert(draft.key.clone(), draft.size);
        out.push(Action::Place(draft));
    }

    pub fn on_tick(&mut self, event: &MarketEvent) -> StepResult {
        if event.symbol == self.params.symbol {
            self.price = Some(event.price);
        } else if event.symbol == self.params.hedge_symbol {
            self.hedge_price = Some(event.price);
        } else {
            return Ok(Vec::new());
        }
        let Some(basis) = self.basis_bps() else {
            return Ok(Vec::new());
        };
        if !self.legs.is_empty() {
            return Ok(Vec::new());
        }

        let p = &self.params;
        let (sym, hedge, size) = (p.symbol.clone(), p.hedge_symbol.clone(), p.size);
        let (entry, exit) = (p.entry_bps, p.exit_bps);
        let mut out = Vec::with_capacity(2);
        if self.is_flat() {
            let sym_side = if basis > entry {
                Side::Sell
            } else if basis < -entry {
                Side::Buy
            } else {
                return Ok(out);
            };
            info!("[arb] {sym}/{hedge} basis {basis:.1}bps: entering {sym_side} {sym}");
            self.send(OrderDraft::market(&sym, sym_side, size), &mut out);
            self.send(OrderDraft::market(&hedge, sym_side.opposite(), size), &mut out);
        } else if basis.abs() < exit {
            info!("[arb] {sym}/{hedge} basis {basis:.1}bps: closing");
            let (net, hedge_net) = (self.net, self.hedge_net);
            if net.abs() > SIZE_EPS {
                self.send(OrderDraft::market(&sym, Side::closing(net), net.abs()).reduce_only(), &mut out);
            }
            if hedge_net.abs() > SIZE_EPS {
                let d = OrderDraft::market(&hedge, Side::closing(hedge_net), hedge_net.abs()).reduce_only();
                self.send(d, &mut out);
            }
        }
        Ok(out)
    }

    pub fn on_fill(&mut self, fill: &Fill) -> StepResult {
        let Some(remaining) = self.legs.get_mut(&fill.idempotency_key) else {
            return Ok(Vec::new());
        };
        *remaining -= fill.size;
        if *remaining <= SIZE_EPS {
            self.legs.remove(&fill.idempotency_key);
        }
        let signed = fill.side.sign() * fill.size;
        if fill.symbol == self.params.symbol {
            self.net += signed;
        } else if fill.symbol == self.params.hedge_symbol {
            self.hedge_net += signed;
        } else {
            return Err(format!("fill {} for unrelated symbol {}", fill.fill_id, fill.symbol));
        }
        Ok(Vec::new())
    }

    pub fn on_order_failed(&mut self, key: &str) {
        self.legs.remove(key);
    }
}
