//! Pre-trade risk checks and stop-loss generation.
//!
//! [`RiskManager::authorize`] runs under the owner's position-book lock and,
//! on `Allow`, reserves the intent's exposure in the same critical section.
//! Checks, first failure wins:
//!
//! 1. worst-case notional in the intent's symbol ≤ `max_position_notional`
//! 2. worst-case total notional / equity ≤ `max_leverage`
//! 3. today's realized + unrealized loss ≤ `max_daily_loss`
//!
//! "Worst case" assumes every reserved order of the owner fills in full, so
//! concurrent intents cannot jointly breach a limit. Reduce-only intents skip
//! the checks and reserve nothing.

use std::sync::{Arc, Mutex, RwLock};

use ahash::{AHashMap, AHashSet};
use hx_core::config::RiskDefaults;
use hx_core::error::{DenyReason, HxError, HxResult};
use hx_core::time_util::now_us;
use hx_core::types::*;
use tracing::{debug, info, warn};

use crate::positions::{OwnerBook, PositionBook};

/// Outcome of a pre-trade check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Pure check of `intent` against `book` and `limit`, valuing the intent at
/// `price`.
pub fn evaluate(
    book: &OwnerBook,
    limit: &RiskLimit,
    intent: &OrderIntent,
    price: f64,
    now_us: u64,
) -> Decision {
    if intent.reduce_only {
        return Decision::Allow;
    }
    let (symbol_notional, total) =
        book.projected_exposure(&intent.symbol, intent.side, intent.size, price);
    if symbol_notional > limit.max_position_notional {
        return Decision::Deny(DenyReason::PositionNotional {
            projected: symbol_notional,
            limit: limit.max_position_notional,
        });
    }
    let equity = book.equity();
    if equity <= 0.0 {
        return Decision::Deny(DenyReason::NoEquity);
    }
    let leverage = total / equity;
    if leverage > limit.max_leverage {
        return Decision::Deny(DenyReason::Leverage { projected: leverage, limit: limit.max_leverage });
    }
    let loss = book.daily_loss(now_us);
    if loss > limit.max_daily_loss {
        return Decision::Deny(DenyReason::DailyLoss { loss, limit: limit.max_daily_loss });
    }
    Decision::Allow
}

pub struct RiskManager {
    positions: Arc<PositionBook>,
    defaults: RiskDefaults,
    default_max_leverage: f64,
    limits: RwLock<AHashMap<Owner, RiskLimit>>,
    /// Positions with a stop-loss close outstanding.
    stops: Mutex<AHashSet<(Owner, String)>>,
}

impl RiskManager {
    pub fn new(positions: Arc<PositionBook>, defaults: RiskDefaults, default_max_leverage: f64) -> Self {
        Self {
            positions,
            defaults,
            default_max_leverage,
            limits: RwLock::new(AHashMap::new()),
            stops: Mutex::new(AHashSet::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Limits
    // -----------------------------------------------------------------------

    /// The owner's limit, or the configured defaults.
    pub fn limit_for(&self, owner: &Owner) -> RiskLimit {
        let limits = self.limits.read().unwrap_or_else(|e| e.into_inner());
        limits.get(owner).cloned().unwrap_or_else(|| RiskLimit {
            owner: owner.clone(),
            max_leverage: self.default_max_leverage,
            max_position_notional: self.defaults.max_position_notional,
            stop_loss_threshold: self.defaults.stop_loss_threshold,
            max_daily_loss: self.defaults.max_daily_loss,
        })
    }

    pub fn set_limit(&self, limit: RiskLimit) -> HxResult<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(limit.max_leverage)
            || !positive(limit.max_position_notional)
            || !positive(limit.max_daily_loss)
        {
            return Err(HxError::Validation(format!("risk limit for {} must be positive", limit.owner)));
        }
        if !(0.0..1.0).contains(&limit.stop_loss_threshold) {
            return Err(HxError::Validation(format!(
                "stop_loss_threshold {} not in [0, 1)",
                limit.stop_loss_threshold
            )));
        }
        info!(
            "[risk] {} limits: leverage {}x, notional {}, daily loss {}, stop {}",
            limit.owner,
            limit.max_leverage,
            limit.max_position_notional,
            limit.max_daily_loss,
            limit.stop_loss_threshold
        );
        let mut limits = self.limits.write().unwrap_or_else(|e| e.into_inner());
        limits.insert(limit.owner.clone(), limit);
        Ok(())
    }

    /// Explicitly configured limits, by owner.
    pub fn limits(&self) -> Vec<RiskLimit> {
        let limits = self.limits.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<RiskLimit> = limits.values().cloned().collect();
        out.sort_by(|a, b| a.owner.cmp(&b.owner));
        out
    }

    // -----------------------------------------------------------------------
    // Authorization
    // -----------------------------------------------------------------------

    /// Check `intent` and, if allowed, reserve its exposure.
    ///
    /// Market intents are valued at the latest mark, else at the position's
    /// reference price; without either they are rejected as invalid.
    pub async fn authorize(&self, intent: &OrderIntent) -> HxResult<Decision> {
        let limit = self.limit_for(&intent.owner);
        let book = self.positions.owner_book(&intent.owner);
        let mut book = book.lock().await;

        let price = match intent.price {
            OrderPrice::Limit(p) => p,
            OrderPrice::Market => self
                .positions
                .mark_price(&intent.symbol)
                .or_else(|| book.position(&intent.symbol).map(|p| p.reference_price()))
                .filter(|p| *p > 0.0)
                .ok_or_else(|| {
                    HxError::Validation(format!("no reference price for {}", intent.symbol))
                })?,
        };

        let decision = evaluate(&book, &limit, intent, price, now_us());
        match &decision {
            Decision::Allow if !intent.reduce_only => {
                book.reserve(&intent.idempotency_key, &intent.symbol, intent.side, intent.size, price);
            }
            Decision::Allow => {}
            Decision::Deny(reason) => {
                warn!("[risk] denied {intent}: {reason}");
            }
        }
        Ok(decision)
    }

    /// Drop the reservation of an order that will not fill further.
    pub async fn release(&self, owner: &Owner, key: &str) {
        let book = self.positions.owner_book(owner);
        if book.lock().await.release(key).is_some() {
            debug!("[risk] released reservation {key}");
        }
    }

    /// [`release`](Self::release) when only the key is known.
    pub async fn release_key(&self, key: &str) {
        for owner in self.positions.owners() {
            let book = self.positions.owner_book(&owner);
            if book.lock().await.release(key).is_some() {
                debug!("[risk] released reservation {key} of {owner}");
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stop-loss
    // -----------------------------------------------------------------------

    /// Given the open positions in `symbol` after a mark, return one
    /// reduce-only market close per position whose unrealized loss reached
    /// its threshold. A position is closed at most once until it goes flat,
    /// recovers or its close fails.
    pub fn stop_loss_intents(&self, symbol: &str, open: &[Position]) -> Vec<OrderIntent> {
        let mut stops = self.stops.lock().unwrap_or_else(|e| e.into_inner());
        stops.retain(|(owner, s)| {
            s != symbol || open.iter().any(|p| &p.owner == owner && p.symbol == symbol)
        });

        let mut out = Vec::new();
        for p in open.iter().filter(|p| p.symbol == symbol && !p.is_flat()) {
            let threshold = self.limit_for(&p.owner).stop_loss_threshold;
            let entry_notional = p.net_size.abs() * p.entry_price;
            let key = (p.owner.clone(), p.symbol.clone());
            if threshold <= 0.0 || entry_notional <= 0.0 {
                continue;
            }
            let loss = -p.unrealized_pnl;
            if loss < threshold * entry_notional {
                stops.remove(&key);
                continue;
            }
            if !stops.insert(key) {
                continue;
            }
            warn!(
                "[risk] stop-loss {} {}: loss {:.2} >= {:.2} of entry {:.2}",
                p.owner, p.symbol, loss, threshold, entry_notional
            );
            out.push(OrderIntent {
                strategy_id: None,
                owner: p.owner.clone(),
                symbol: p.symbol.clone(),
                side: Side::closing(p.net_size),
                size: p.net_size.abs(),
                price: OrderPrice::Market,
                idempotency_key: format!("sl-{}", uuid::Uuid::new_v4()),
                post_only: false,
                reduce_only: true,
            });
        }
        out
    }

    /// Re-arm the stop for a position whose close did not go through.
    pub fn clear_stop(&self, owner: &Owner, symbol: &str) {
        let mut stops = self.stops.lock().unwrap_or_else(|e| e.into_inner());
        stops.remove(&(owner.clone(), symbol.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<PositionBook>, RiskManager) {
        let positions = Arc::new(PositionBook::new());
        let rm = RiskManager::new(Arc::clone(&positions), RiskDefaults::default(), 3.0);
        (positions, rm)
    }

    fn intent(key: &str, side: Side, size: f64, price: f64) -> OrderIntent {
        OrderIntent {
            strategy_id: None,
            owner: Owner::user("u"),
            symbol: "BTC".into(),
            side,
            size,
            price: OrderPrice::Limit(price),
            idempotency_key: key.into(),
            post_only: false,
            reduce_only: false,
        }
    }

    fn fill(side: Side, size: f64, price: f64) -> Fill {
        Fill {
            fill_id: "f".into(),
            order_id: 1,
            idempotency_key: "seed".into(),
            owner: Owner::user("u"),
            strategy_id: None,
            symbol: "BTC".into(),
            side,
            size,
            price,
            fee: 0.0,
            timestamp_us: now_us(),
        }
    }

    #[tokio::test]
    async fn leverage_boundary() {
        let (positions, rm) = manager();
        let owner = Owner::user("u");
        positions.apply_fill(&fill(Side::Buy, 2.9, 100.0)).await;
        positions.set_cash_equity(&owner, 100.0).await;

        // 290 + 20 = 310 on equity 100 => 3.1x
        let d = rm.authorize(&intent("a", Side::Buy, 0.2, 100.0)).await.unwrap();
        assert!(matches!(d, Decision::Deny(DenyReason::Leverage { .. })));
        // 290 + 5 = 295 => 2.95x
        let d = rm.authorize(&intent("b", Side::Buy, 0.05, 100.0)).await.unwrap();
        assert_eq!(d, Decision::Allow);
    }

    #[tokio::test]
    async fn reservations_prevent_joint_breach() {
        let (positions, rm) = manager();
        positions.set_cash_equity(&Owner::user("u"), 100.0).await;
        // Each alone is 2x; together 4x.
        assert!(rm.authorize(&intent("a", Side::Buy, 2.0, 100.0)).await.unwrap().is_allow());
        let d = rm.authorize(&intent("b", Side::Buy, 2.0, 100.0)).await.unwrap();
        assert!(matches!(d, Decision::Deny(DenyReason::Leverage { .. })));

        rm.release(&Owner::user("u"), "a").await;
        assert!(rm.authorize(&intent("b", Side::Buy, 2.0, 100.0)).await.unwrap().is_allow());
    }

    #[tokio::test]
    async fn first_failing_check_wins() {
        let (positions, rm) = manager();
        let owner = Owner::user("u");
        rm.set_limit(RiskLimit {
            owner: owner.clone(),
            max_leverage: 1.0,
            max_position_notional: 150.0,
            stop_loss_threshold: 0.0,
            max_daily_loss: 10.0,
        })
        .unwrap();
        positions.set_cash_equity(&owner, 100.0).await;
        // Breaches both notional and leverage; notional is reported.
        let d = rm.authorize(&intent("a", Side::Buy, 2.0, 100.0)).await.unwrap();
        assert!(matches!(d, Decision::Deny(DenyReason::PositionNotional { .. })));

        positions.set_cash_equity(&owner, 0.0).await;
        let d = rm.authorize(&intent("b", Side::Buy, 0.1, 100.0)).await.unwrap();
        assert_eq!(d, Decision::Deny(DenyReason::NoEquity));
    }

    #[tokio::test]
    async fn daily_loss_blocks_new_exposure_but_not_reduce_only() {
        let (positions, rm) = manager();
        let owner = Owner::user("u");
        positions.set_cash_equity(&owner, 10_000.0).await;
        positions.apply_fill(&fill(Side::Buy, 10.0, 100.0)).await;
        positions.mark_symbol("BTC", 85.0).await;
        // Unrealized -150 with the default daily limit of 1000 is fine.
        assert!(rm.authorize(&intent("a", Side::Buy, 0.1, 85.0)).await.unwrap().is_allow());

        rm.set_limit(RiskLimit { max_daily_loss: 100.0, ..rm.limit_for(&owner) }).unwrap();
        let d = rm.authorize(&intent("b", Side::Buy, 0.1, 85.0)).await.unwrap();
        assert!(matches!(d, Decision::Deny(DenyReason::DailyLoss { .. })));

        let mut close = intent("c", Side::Sell, 10.0, 85.0);
        close.reduce_only = true;
        assert!(rm.authorize(&close).await.unwrap().is_allow());
    }

    #[tokio::test]
    async fn market_intent_without_price_is_invalid() {
        let (_, rm) = manager();
        let mut i = intent("m", Side::Buy, 1.0, 1.0);
        i.price = OrderPrice::Market;
        assert!(matches!(rm.authorize(&i).await, Err(HxError::Validation(_))));
    }

    #[test]
    fn invalid_limits_rejected() {
        let (_, rm) = manager();
        let mut l = rm.limit_for(&Owner::user("u"));
        l.max_leverage = 0.0;
        assert!(rm.set_limit(l.clone()).is_err());
        l.max_leverage = 2.0;
        l.stop_loss_threshold = 1.5;
        assert!(rm.set_limit(l).is_err());
    }

    #[tokio::test]
    async fn stop_loss_fires_once_per_position() {
        let (positions, rm) = manager();
        positions.apply_fill(&fill(Side::Buy, 2.0, 100.0)).await;

        // Default threshold 10% of entry notional 200 = 20.
        let open = positions.mark_symbol("BTC", 95.0).await;
        assert!(rm.stop_loss_intents("BTC", &open).is_empty());

        let open = positions.mark_symbol("BTC", 89.0).await;
        let closes = rm.stop_loss_intents("BTC", &open);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].side, Side::Sell);
        assert!((closes[0].size - 2.0).abs() < 1e-12);
        assert!(closes[0].reduce_only);
        assert_eq!(closes[0].price, OrderPrice::Market);

        let open = positions.mark_symbol("BTC", 88.0).await;
        assert!(rm.stop_loss_intents("BTC", &open).is_empty());

        rm.clear_stop(&Owner::user("u"), "BTC");
        assert_eq!(rm.stop_loss_intents("BTC", &open).len(), 1);
    }
}
