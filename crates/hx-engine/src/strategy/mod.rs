//! Strategy kinds.
//!
//! A strategy is a pure state machine: it receives market events and fills
//! and answers with [`Action`]s. It never talks to the exchange itself; the
//! scheduler turns actions into risk-checked gateway calls and reports back
//! through [`Strategy::on_order_failed`] when a placement did not go through.
//!
//! The set of kinds is closed: [`StrategyParams`] is a tagged enum
//! (`{"kind": "grid", ...}`) and [`Strategy`] dispatches over the matching
//! state types.

pub mod arbitrage;
pub mod grid;
pub mod maker_rebate;
pub mod staking;

use hx_core::error::{HxError, HxResult};
use hx_core::types::*;
use serde::{Deserialize, Serialize};

pub use arbitrage::{ArbitrageParams, ArbitrageStrategy};
pub use grid::{GridParams, GridStrategy};
pub use maker_rebate::{MakerRebateParams, MakerRebateStrategy};
pub use staking::{StakingParams, StakingStrategy};

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// An order a strategy wants placed. The key is generated by the strategy so
/// it can recognise its own fills.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub key: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: OrderPrice,
    pub post_only: bool,
    pub reduce_only: bool,
}

impl OrderDraft {
    pub fn post_only(symbol: &str, side: Side, size: f64, price: f64) -> Self {
        Self {
            key: new_key(),
            symbol: symbol.to_string(),
            side,
            size,
            price: OrderPrice::Limit(price),
            post_only: true,
            reduce_only: false,
        }
    }

    pub fn market(symbol: &str, side: Side, size: f64) -> Self {
        Self {
            key: new_key(),
            symbol: symbol.to_string(),
            side,
            size,
            price: OrderPrice::Market,
            post_only: false,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn into_intent(self, owner: Owner, strategy_id: StrategyId) -> OrderIntent {
        OrderIntent {
            strategy_id: Some(strategy_id),
            owner,
            symbol: self.symbol,
            side: self.side,
            size: self.size,
            price: self.price,
            idempotency_key: self.key,
            post_only: self.post_only,
            reduce_only: self.reduce_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Place(OrderDraft),
    /// Cancel the order placed under this key (ignored if it never landed).
    Cancel { key: String },
}

/// A strategy step: actions, or the reason the strategy cannot continue.
pub type StepResult = Result<Vec<Action>, String>;

/// Fresh idempotency key.
pub fn new_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyParams {
    Grid(GridParams),
    MakerRebate(MakerRebateParams),
    Staking(StakingParams),
    Arbitrage(ArbitrageParams),
}

impl StrategyParams {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Grid(_) => StrategyKind::Grid,
            Self::MakerRebate(_) => StrategyKind::MakerRebate,
            Self::Staking(_) => StrategyKind::Staking,
            Self::Arbitrage(_) => StrategyKind::Arbitrage,
        }
    }

    /// The symbol identifying the instance, used for uniqueness.
    pub fn symbol(&self) -> &str {
        match self {
            Self::Grid(p) => &p.symbol,
            Self::MakerRebate(p) => &p.symbol,
            Self::Staking(p) => &p.symbol,
            Self::Arbitrage(p) => &p.symbol,
        }
    }

    /// Every symbol whose ticks the instance needs.
    pub fn symbols(&self) -> Vec<String> {
        match self {
            Self::Arbitrage(p) => vec![p.symbol.clone(), p.hedge_symbol.clone()],
            other => vec![other.symbol().to_string()],
        }
    }

    /// Upper-case symbols and check ranges.
    pub fn validated(mut self) -> HxResult<Self> {
        match &mut self {
            Self::Grid(p) => {
                p.symbol = canonical(&p.symbol)?;
                p.validate()?;
            }
            Self::MakerRebate(p) => {
                p.symbol = canonical(&p.symbol)?;
                p.validate()?;
            }
            Self::Staking(p) => {
                p.symbol = canonical(&p.symbol)?;
                p.validate()?;
            }
            Self::Arbitrage(p) => {
                p.symbol = canonical(&p.symbol)?;
                p.hedge_symbol = canonical(&p.hedge_symbol)?;
                p.validate()?;
            }
        }
        Ok(self)
    }
}

fn canonical(symbol: &str) -> HxResult<String> {
    let s = symbol.trim().to_ascii_uppercase();
    if s.is_empty() {
        return Err(HxError::Validation("empty symbol".into()));
    }
    Ok(s)
}

pub(crate) fn require(ok: bool, msg: impl Into<String>) -> HxResult<()> {
    if ok { Ok(()) } else { Err(HxError::Validation(msg.into())) }
}

pub(crate) fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub enum Strategy {
    Grid(GridStrategy),
    MakerRebate(MakerRebateStrategy),
    Staking(StakingStrategy),
    Arbitrage(ArbitrageStrategy),
}

impl Strategy {
    /// Fresh state for validated parameters.
    pub fn new(params: &StrategyParams) -> Self {
        match params {
            StrategyParams::Grid(p) => Self::Grid(GridStrategy::new(p.clone())),
            StrategyParams::MakerRebate(p) => Self::MakerRebate(MakerRebateStrategy::new(p.clone())),
            StrategyParams::Staking(p) => Self::Staking(StakingStrategy::new(p.clone())),
            StrategyParams::Arbitrage(p) => Self::Arbitrage(ArbitrageStrategy::new(p.clone())),
        }
    }

    pub fn on_tick(&mut self, event: &MarketEvent) -> StepResult {
        match self {
            Self::Grid(s) => s.on_tick(event),
            Self::MakerRebate(s) => s.on_tick(event),
            Self::Staking(s) => s.on_tick(event),
            Self::Arbitrage(s) => s.on_tick(event),
        }
    }

    pub fn on_fill(&mut self, fill: &Fill) -> StepResult {
        match self {
            Self::Grid(s) => s.on_fill(fill),
            Self::MakerRebate(s) => s.on_fill(fill),
            Self::Staking(s) => s.on_fill(fill),
            Self::Arbitrage(s) => s.on_fill(fill),
        }
    }

    /// The order placed under `key` was refused or never landed.
    pub fn on_order_failed(&mut self, key: &str) {
        match self {
            Self::Grid(s) => s.on_order_failed(key),
            Self::MakerRebate(s) => s.on_order_failed(key),
            Self::Staking(s) => s.on_order_failed(key),
            Self::Arbitrage(s) => s.on_order_failed(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_tagged_by_kind() {
        let json = r#"{"kind":"grid","symbol":" btc ","levels":3,"spacing_pct":0.01,"size_per_level":0.1}"#;
        let p: StrategyParams = serde_json::from_str(json).unwrap();
        let p = p.validated().unwrap();
        assert_eq!(p.kind(), StrategyKind::Grid);
        assert_eq!(p.symbol(), "BTC");

        let json = r#"{"kind":"arbitrage","symbol":"btc-perp","hedge_symbol":"btc","entry_bps":20,"exit_bps":5,"size":1}"#;
        let p: StrategyParams = serde_json::from_str(json).unwrap();
        assert_eq!(p.validated().unwrap().symbols(), vec!["BTC-PERP".to_string(), "BTC".to_string()]);
    }

    #[test]
    fn invalid_params_rejected() {
        let json = r#"{"kind":"grid","symbol":"BTC","levels":0,"spacing_pct":0.01,"size_per_level":0.1}"#;
        let p: StrategyParams = serde_json::from_str(json).unwrap();
        assert!(matches!(p.validated(), Err(HxError::Validation(_))));
        let json = r#"{"kind":"staking","symbol":"","target_size":1,"slice_size":0.1,"apr":0.05}"#;
        let p: StrategyParams = serde_json::from_str(json).unwrap();
        assert!(p.validated().is_err());
    }

    #[test]
    fn draft_becomes_intent() {
        let d = OrderDraft::market("ETH", Side::Sell, 2.0).reduce_only();
        let key = d.key.clone();
        let i = d.into_intent(Owner::vault("v"), StrategyId(7));
        assert_eq!(i.idempotency_key, key);
        assert_eq!(i.strategy_id, Some(StrategyId(7)));
        assert!(i.reduce_only && !i.post_only);
    }
}
