//! Staking: accumulate a target size in market slices, then hold and accrue
//! yield on the staked notional.

use hx_core::error::HxResult;
use hx_core::types::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Action, OrderDraft, StepResult, positive, require};

const YEAR_US: f64 = 365.0 * 86_400.0 * 1_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingParams {
    pub symbol: String,
    pub target_size: f64,
    pub slice_size: f64,
    /// Only buy while the price is at or below this.
    #[serde(default)]
    pub max_entry_price: Option<f64>,
    /// Annual yield as a fraction (0.05 = 5%).
    pub apr: f64,
}

impl StakingParams {
    pub(crate) fn validate(&self) -> HxResult<()> {
        require(positive(self.target_size), "target_size must be positive")?;
        require(
            positive(self.slice_size) && self.slice_size <= self.target_size,
            "slice_size must be in (0, target_size]",
        )?;
        require(self.max_entry_price.is_none_or(positive), "max_entry_price must be positive")?;
        require(self.apr.is_finite() && self.apr >= 0.0, "apr must be >= 0")
    }
}

pub struct StakingStrategy {
    params: StakingParams,
    staked: f64,
    /// Outstanding slice: key and size still unfilled.
    pending: Option<(String, f64)>,
    accrued_yield: f64,
    last_accrual: Option<(u64, f64)>,
}

impl StakingStrategy {
    pub fn new(params: StakingParams) -> Self {
        Self { params, staked: 0.0, pending: None, accrued_yield: 0.0, last_accrual: None }
    }

    pub fn staked(&self) -> f64 {
        self.staked
    }

    pub fn accrued_yield(&self) -> f64 {
        self.accrued_yield
    }

    pub fn is_complete(&self) -> bool {
        self.staked + SIZE_EPS >= self.params.target_size
    }

    pub fn on_tick(&mut self, event: &MarketEvent) -> StepResult {
        if event.symbol != self.params.symbol {
            return Ok(Vec::new());
        }
        if let Some((ts, price)) = self.last_accrual {
            let dt = event.timestamp_us.saturating_sub(ts) as f64;
            self.accrued_yield += self.staked * price * self.params.apr * dt / YEAR_US;
        }
        self.last_accrual = Some((event.timestamp_us, event.price));

        if self.pending.is_some() || self.is_complete() {
            return Ok(Vec::new());
        }
        if self.params.max_entry_price.is_some_and(|cap| event.price > cap) {
            return Ok(Vec::new());
        }
        let size = self.params.slice_size.min(self.params.target_size - self.staked);
        let draft = OrderDraft::market(&self.params.symbol, Side::Buy, size);
        self.pending = Some((draft.key.clone(), size));
        debug!("[staking] {} slice {size} at ~{}", self.params.symbol, event.price);
        Ok(vec![Action::Place(draft)])
    }

    pub fn on_fill(&mut self, fill: &Fill) -> StepResult {
        let Some((key, remaining)) = self.pending.as_mut() else {
            return Ok(Vec::new());
        };
        if *key != fill.idempotency_key {
            return Ok(Vec::new());
        }
        *remaining -= fill.size;
        if *remaining <= SIZE_EPS {
            self.pending = None;
        }
        self.staked += fill.size;
        if self.is_complete() {
            info!("[staking] {} target {} reached", self.params.symbol, self.params.target_size);
        }
        Ok(Vec::new())
    }

    pub fn on_order_failed(&mut self, key: &str) {
        if self.pending.as_ref().is_some_and(|(k, _)| k == key) {
            self.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(cap: Option<f64>) -> StakingStrategy {
        StakingStrategy::new(StakingParams {
            symbol: "SOL".into(),
            target_size: 2.5,
            slice_size: 1.0,
            max_entry_price: cap,
            apr: 0.10,
        })
    }

    fn tick(price: f64, ts: u64) -> MarketEvent {
        MarketEvent { symbol: "SOL".into(), price, timestamp_us: ts, kind: TickType::Trade, epoch: 1 }
    }

    fn fill_all(s: &mut StakingStrategy, actions: Vec<Action>) {
        for a in actions {
            if let Action::Place(d) = a {
                let f = Fill {
                    fill_id: d.key.clone(),
                    order_id: 1,
                    idempotency_key: d.key.clone(),
                    owner: Owner::user("u"),
                    strategy_id: None,
                    symbol: d.symbol.clone(),
                    side: d.side,
                    size: d.size,
                    price: 10.0,
                    fee: 0.0,
                    timestamp_us: 1,
                };
                s.on_fill(&f).unwrap();
            }
        }
    }

    #[test]
    fn accumulates_in_slices_one_at_a_time() {
        let mut s = strategy(None);
        let a = s.on_tick(&tick(10.0, 1)).unwrap();
        assert_eq!(a.len(), 1);
        // Slice outstanding: nothing new.
        assert!(s.on_tick(&tick(10.0, 2)).unwrap().is_empty());
        fill_all(&mut s, a);
        let a = s.on_tick(&tick(10.0, 3)).unwrap();
        fill_all(&mut s, a);
        let a = s.on_tick(&tick(10.0, 4)).unwrap();
        match &a[0] {
            Action::Place(d) => assert!((d.size - 0.5).abs() < 1e-12),
            other => panic!("unexpected {other:?}"),
        }
        fill_all(&mut s, a);
        assert!(s.is_complete());
        assert!(s.on_tick(&tick(10.0, 5)).unwrap().is_empty());
    }

    #[test]
    fn price_cap_pauses_buying() {
        let mut s = strategy(Some(9.0));
        assert!(s.on_tick(&tick(10.0, 1)).unwrap().is_empty());
        assert_eq!(s.on_tick(&tick(8.5, 2)).unwrap().len(), 1);
    }

    #[test]
    fn failed_slice_is_retried() {
        let mut s = strategy(None);
        let a = s.on_tick(&tick(10.0, 1)).unwrap();
        let Action::Place(d) = &a[0] else { panic!("expected place") };
        s.on_order_failed(&d.key);
        assert_eq!(s.on_tick(&tick(10.0, 2)).unwrap().len(), 1);
    }

    #[test]
    fn yield_accrues_on_staked_notional() {
        let mut s = strategy(None);
        let a = s.on_tick(&tick(10.0, 0)).unwrap();
        fill_all(&mut s, a);
        // 1.0 staked at 10.0, 10% APR, for one year.
        s.on_tick(&tick(10.0, YEAR_US as u64)).unwrap();
        assert!((s.accrued_yield() - 1.0).abs() < 1e-9);
    }
}
