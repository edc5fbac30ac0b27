//! Order router: kill switch, risk authorization, then gateway.
//!
//! Every order the engine sends (strategy actions and stop-loss closes) goes
//! through [`OrderRouter::place`]. The risk reservation made by `authorize`
//! lives exactly as long as the order can still fill: it is released when
//! the submission certainly failed or the order reached a terminal state,
//! and kept when the outcome is unknown until reconciliation decides.

use std::sync::Arc;

use hx_core::error::{HxError, HxResult};
use hx_core::kill_switch::KillSwitch;
use hx_core::types::*;
use hx_core::time_util::now_us;
use hx_td::gateway::{validate_intent, validate_modify};
use hx_td::{CancelOutcome, OrderGateway};
use tracing::{debug, warn};

use crate::positions::PositionBook;
use crate::risk::{evaluate, Decision, RiskManager};

pub struct OrderRouter {
    gateway: Arc<OrderGateway>,
    risk: Arc<RiskManager>,
    positions: Arc<PositionBook>,
    kill: Arc<KillSwitch>,
}

impl OrderRouter {
    pub fn new(
        gateway: Arc<OrderGateway>,
        risk: Arc<RiskManager>,
        positions: Arc<PositionBook>,
        kill: Arc<KillSwitch>,
    ) -> Self {
        Self { gateway, risk, positions, kill }
    }

    pub fn gateway(&self) -> &Arc<OrderGateway> {
        &self.gateway
    }

    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    pub async fn place(&self, intent: OrderIntent) -> HxResult<Order> {
        if let Some(scope) = self.kill.halted_scope(&intent.owner) {
            return Err(HxError::Halted(scope));
        }
        validate_intent(&intent)?;
        if let Decision::Deny(reason) = self.risk.authorize(&intent).await? {
            return Err(HxError::RiskDenied(reason));
        }

        let owner = intent.owner.clone();
        let key = intent.idempotency_key.clone();
        match self.gateway.submit(intent).await {
            Ok(order) => {
                if order.status.is_terminal() {
                    self.risk.release(&owner, &key).await;
                }
                Ok(order)
            }
            Err(e) => {
                if e.definitely_not_placed() {
                    self.risk.release(&owner, &key).await;
                } else {
                    warn!("[router] {key}: {e}; reservation kept until reconciled");
                }
                Err(e)
            }
        }
    }

    /// Send a stop-loss close. A close that certainly failed re-arms the
    /// stop so the next mark retries it.
    pub async fn place_stop_loss(&self, intent: OrderIntent) -> HxResult<Order> {
        let (owner, symbol) = (intent.owner.clone(), intent.symbol.clone());
        let result = self.place(intent).await;
        if let Err(e) = &result {
            warn!("[router] stop-loss close {owner} {symbol} failed: {e}");
            if e.definitely_not_placed() && !matches!(e, HxError::Halted(_)) {
                self.risk.clear_stop(&owner, &symbol);
            }
        }
        result
    }

    pub async fn cancel(&self, order_id: OrderId) -> HxResult<bool> {
        let cancelled = self.gateway.cancel(order_id).await?;
        self.release_if_terminal(order_id).await;
        Ok(cancelled)
    }

    /// Cancel the order placed under `key`. `Ok(false)` if none was placed.
    pub async fn cancel_by_key(&self, key: &str) -> HxResult<bool> {
        match self.gateway.order_by_key(key) {
            Some(order) => self.cancel(order.order_id).await,
            None => {
                debug!("[router] cancel {key}: no order under this key");
                Ok(false)
            }
        }
    }

    /// Amend a live order. The amended order is risk-checked in place of the
    /// old one under the owner's book lock; on a deny the old reservation
    /// stands and the exchange is never asked.
    pub async fn modify(
        &self,
        order_id: OrderId,
        new_price: Option<f64>,
        new_size: Option<f64>,
    ) -> HxResult<Order> {
        validate_modify(new_price, new_size)?;
        let current = self
            .gateway
            .order(order_id)
            .ok_or_else(|| HxError::NotFound(format!("order {order_id}")))?;
        if let Some(scope) = self.kill.halted_scope(current.owner()) {
            return Err(HxError::Halted(scope));
        }
        if current.status.is_terminal() {
            return Err(HxError::Validation(format!("order {order_id} is not live")));
        }

        let mut amended = current.intent.clone();
        if let Some(p) = new_price {
            amended.price = OrderPrice::Limit(p);
        }
        // Risk sees the size still to fill, not the new total.
        amended.size = match new_size {
            Some(total) => (total - current.filled_size).max(0.0),
            None => current.remaining(),
        };
        let price = amended
            .price
            .limit()
            .or_else(|| self.positions.mark_price(&amended.symbol))
            .unwrap_or(0.0);

        let limit = self.risk.limit_for(current.owner());
        let book = self.positions.owner_book(current.owner());
        let previous = {
            let mut book = book.lock().await;
            let previous = book.release(current.key());
            if let Decision::Deny(reason) = evaluate(&book, &limit, &amended, price, now_us()) {
                if let Some(r) = &previous {
                    book.reserve(current.key(), &r.symbol, r.side, r.remaining, r.price);
                }
                warn!("[router] modify {order_id} denied: {reason}");
                return Err(HxError::RiskDenied(reason));
            }
            if !amended.reduce_only && amended.size > SIZE_EPS {
                book.reserve(current.key(), &amended.symbol, amended.side, amended.size, price);
            }
            previous
        };

        match self.gateway.modify(order_id, new_price, new_size).await {
            Ok(order) => {
                if order.status.is_terminal() {
                    self.risk.release(order.owner(), order.key()).await;
                }
                Ok(order)
            }
            Err(e) => {
                let mut book = book.lock().await;
                book.release(current.key());
                if let Some(r) = previous {
                    book.reserve(current.key(), &r.symbol, r.side, r.remaining, r.price);
                }
                Err(e)
            }
        }
    }

    /// Cancel every live order in `scope` and release their reservations.
    pub async fn cancel_all(&self, scope: &StopScope) -> Vec<CancelOutcome> {
        let outcomes = self.gateway.cancel_all(scope).await;
        for o in &outcomes {
            self.release_if_terminal(o.order_id).await;
        }
        outcomes
    }

    /// Cancel the live orders placed by one strategy instance.
    pub async fn cancel_strategy_orders(&self, id: StrategyId) -> Vec<CancelOutcome> {
        let live: Vec<Order> = self
            .gateway
            .all_orders()
            .into_iter()
            .filter(|o| o.intent.strategy_id == Some(id) && o.status.is_live())
            .collect();
        let mut out = Vec::with_capacity(live.len());
        for order in live {
            let result = self.cancel(order.order_id).await.map_err(|e| e.to_string());
            if let Err(e) = &result {
                warn!("[router] cancel {} of {id} failed: {e}", order.order_id);
            }
            out.push(CancelOutcome {
                order_id: order.order_id,
                owner: order.owner().clone(),
                idempotency_key: order.key().to_string(),
                result,
            });
        }
        out
    }

    /// Fold a deduplicated fill into the order book and the owner's position.
    /// Returns the realized P&L net of fee.
    pub async fn apply_fill(&self, fill: &Fill) -> f64 {
        let order = self.gateway.apply_fill(fill);
        let realized = self.positions.apply_fill(fill).await;
        if order.is_some_and(|o| o.status.is_terminal()) {
            self.risk.release(&fill.owner, &fill.idempotency_key).await;
        }
        realized
    }

    /// Settle reservations for orders whose state changed outside a router
    /// call (status syncs, cancel-on-ack during a halt).
    pub async fn on_order_update(&self, order: &Order) {
        if order.status.is_terminal() {
            self.risk.release(order.owner(), order.key()).await;
        }
    }

    /// Resolve keys parked after ambiguous submissions. Returns the intents
    /// that turned out never to have produced an order; their reservations
    /// are released.
    pub async fn reconcile_unknown(&self) -> Vec<OrderIntent> {
        let mut dead = Vec::new();
        for key in self.gateway.unknown_keys(&StopScope::Global) {
            // Read before reconciling: a key that never landed is forgotten.
            let intent = self.gateway.intent_for_key(&key);
            match self.gateway.reconcile(&key).await {
                Ok(Some(order)) => self.on_order_update(&order).await,
                Ok(None) | Err(HxError::ExchangeRejected(_)) => {
                    match &intent {
                        Some(i) => self.risk.release(&i.owner, &key).await,
                        None => self.risk.release_key(&key).await,
                    }
                    dead.extend(intent);
                }
                Err(e) => debug!("[router] {key} still unresolved: {e}"),
            }
        }
        dead
    }

    async fn release_if_terminal(&self, order_id: OrderId) {
        if let Some(order) = self.gateway.order(order_id) {
            self.on_order_update(&order).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_core::config::{GatewayConfig, RiskDefaults};
    use hx_core::error::DenyReason;
    use hx_td::paper::{Fault, PaperExchange};
    use hx_td::{AgentRegistry, AgentWallet, ExchangeContext, GatewayEventReceiver};

    struct Rig {
        ex: Arc<PaperExchange>,
        router: OrderRouter,
        positions: Arc<PositionBook>,
        kill: Arc<KillSwitch>,
        _rx: GatewayEventReceiver,
    }

    fn rig() -> Rig {
        let ex = Arc::new(PaperExchange::new());
        let agents = Arc::new(AgentRegistry::new());
        agents.register(AgentWallet::from_ed25519_seed(Owner::user("u"), &[3u8; 32]));
        let kill = Arc::new(KillSwitch::new());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cfg = GatewayConfig { max_attempts: 2, base_backoff_ms: 1, max_backoff_ms: 2, ..Default::default() };
        let gateway = Arc::new(OrderGateway::new(
            ex.clone(),
            ExchangeContext::new(Network::Testnet, agents),
            kill.clone(),
            &cfg,
            tx,
        ));
        let positions = Arc::new(PositionBook::new());
        let risk = Arc::new(RiskManager::new(positions.clone(), RiskDefaults::default(), 3.0));
        let router = OrderRouter::new(gateway, risk, positions.clone(), kill.clone());
        Rig { ex, router, positions, kill, _rx: rx }
    }

    fn limit(key: &str, size: f64, price: f64) -> OrderIntent {
        OrderIntent {
            strategy_id: Some(StrategyId(7)),
            owner: Owner::user("u"),
            symbol: "BTC".into(),
            side: Side::Buy,
            size,
            price: OrderPrice::Limit(price),
            idempotency_key: key.into(),
            post_only: true,
            reduce_only: false,
        }
    }

    async fn reservations(r: &Rig) -> usize {
        r.positions.owner_book(&Owner::user("u")).lock().await.reservation_count()
    }

    #[tokio::test]
    async fn resting_order_keeps_reservation_until_cancelled() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;

        let order = r.router.place(limit("a", 10.0, 90.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(reservations(&r).await, 1);

        // 900 reserved + 2700 would be 3.6x.
        let err = r.router.place(limit("b", 30.0, 90.0)).await.unwrap_err();
        assert!(matches!(err, HxError::RiskDenied(DenyReason::Leverage { .. })));
        assert_eq!(r.ex.order_count(), 1);

        assert!(r.router.cancel_by_key("a").await.unwrap());
        assert_eq!(reservations(&r).await, 0);
        assert!(!r.router.cancel_by_key("missing").await.unwrap());
    }

    #[tokio::test]
    async fn rejection_releases_but_unknown_outcome_keeps_reservation() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;

        r.ex.script([Fault::Reject("margin".into())]);
        assert!(matches!(r.router.place(limit("r", 1.0, 90.0)).await, Err(HxError::ExchangeRejected(_))));
        assert_eq!(reservations(&r).await, 0);

        r.ex.script([Fault::TimeoutBeforePlace, Fault::TimeoutAfterPlace]);
        let err = r.router.place(limit("u1", 1.0, 90.0)).await.unwrap_err();
        assert!(matches!(err, HxError::SubmissionUnknown { .. }));
        assert_eq!(reservations(&r).await, 1);

        // The order did land: reconciliation adopts it and it keeps its reservation.
        assert!(r.router.reconcile_unknown().await.is_empty());
        assert!(r.router.gateway().unknown_keys(&StopScope::Global).is_empty());
        assert_eq!(reservations(&r).await, 1);
        assert_eq!(r.ex.order_count(), 1);
    }

    #[tokio::test]
    async fn never_landed_submission_is_reported_dead() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;
        r.ex.script([Fault::TimeoutBeforePlace, Fault::ServerError]);
        let err = r.router.place(limit("lost", 1.0, 90.0)).await.unwrap_err();
        assert!(matches!(err, HxError::SubmissionUnknown { .. }));
        assert_eq!(reservations(&r).await, 1);

        let dead = r.router.reconcile_unknown().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].idempotency_key, "lost");
        assert_eq!(dead[0].strategy_id, Some(StrategyId(7)));
        assert_eq!(reservations(&r).await, 0);
        assert_eq!(r.ex.order_count(), 0);
    }

    #[tokio::test]
    async fn halted_owner_is_refused_before_risk() {
        let r = rig();
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;
        r.kill.halt(&StopScope::Owner(Owner::user("u")));
        assert!(matches!(r.router.place(limit("h", 1.0, 90.0)).await, Err(HxError::Halted(_))));
        assert_eq!(reservations(&r).await, 0);
        assert_eq!(r.ex.place_calls(), 0);
    }

    #[tokio::test]
    async fn filled_market_order_updates_position_and_releases() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.mark_symbol("BTC", 100.0).await;
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;
        let mut intent = limit("m", 2.0, 0.0);
        intent.price = OrderPrice::Market;
        intent.post_only = false;
        let order = r.router.place(intent).await.unwrap();
        // Fill progress arrives through the fill stream; exposure stays reserved until then.
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(reservations(&r).await, 1);

        let fill = Fill {
            fill_id: "f1".into(),
            order_id: order.order_id,
            idempotency_key: "m".into(),
            owner: Owner::user("u"),
            strategy_id: Some(StrategyId(7)),
            symbol: "BTC".into(),
            side: Side::Buy,
            size: 2.0,
            price: 100.0,
            fee: 0.0,
            timestamp_us: 1,
        };
        r.router.apply_fill(&fill).await;
        assert_eq!(reservations(&r).await, 0);
        let pos = r.positions.position(&Owner::user("u"), "BTC").await.unwrap();
        assert!((pos.net_size - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn strategy_sweep_only_touches_that_strategy() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.set_cash_equity(&Owner::user("u"), 10_000.0).await;
        r.router.place(limit("s7", 1.0, 90.0)).await.unwrap();
        let mut other = limit("s8", 1.0, 80.0);
        other.strategy_id = Some(StrategyId(8));
        r.router.place(other).await.unwrap();

        let outcomes = r.router.cancel_strategy_orders(StrategyId(7)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].idempotency_key, "s7");
        assert_eq!(r.ex.live_orders(&Owner::user("u")), 1);
        assert_eq!(reservations(&r).await, 1);
    }

    #[tokio::test]
    async fn modify_moves_the_reservation() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;
        let order = r.router.place(limit("mod", 10.0, 90.0)).await.unwrap();
        r.router.modify(order.order_id, Some(80.0), Some(5.0)).await.unwrap();
        let book = r.positions.owner_book(&Owner::user("u"));
        let book = book.lock().await;
        let res = book.reservation("mod").unwrap();
        assert!((res.remaining - 5.0).abs() < 1e-12);
        assert!((res.price - 80.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn modify_that_breaches_leverage_is_denied_and_keeps_old_reservation() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;
        let order = r.router.place(limit("big", 10.0, 90.0)).await.unwrap();

        // 100 x 90 is 9x on 1000 equity.
        let err = r.router.modify(order.order_id, None, Some(100.0)).await.unwrap_err();
        assert!(matches!(err, HxError::RiskDenied(DenyReason::Leverage { .. })));
        let live = r.router.gateway().order(order.order_id).unwrap();
        assert!((live.intent.size - 10.0).abs() < 1e-12);
        {
            let book = r.positions.owner_book(&Owner::user("u"));
            let book = book.lock().await;
            let res = book.reservation("big").unwrap();
            assert!((res.remaining - 10.0).abs() < 1e-12);
            assert!((res.price - 90.0).abs() < 1e-12);
        }

        // Repricing alone can breach too: 10 x 400 is 4x.
        let err = r.router.modify(order.order_id, Some(400.0), None).await.unwrap_err();
        assert!(matches!(err, HxError::RiskDenied(DenyReason::Leverage { .. })));
        assert_eq!(reservations(&r).await, 1);
    }

    #[tokio::test]
    async fn failed_modify_restores_the_old_reservation() {
        let r = rig();
        r.ex.push_price("BTC", 100.0);
        r.positions.set_cash_equity(&Owner::user("u"), 1_000.0).await;
        let order = r.router.place(limit("rej", 10.0, 90.0)).await.unwrap();
        // Fills on the exchange before the fill reaches us: the amend is refused.
        r.ex.push_price("BTC", 85.0);
        let err = r.router.modify(order.order_id, Some(80.0), Some(5.0)).await.unwrap_err();
        assert!(matches!(err, HxError::ExchangeRejected(_)));
        let book = r.positions.owner_book(&Owner::user("u"));
        let book = book.lock().await;
        let res = book.reservation("rej").unwrap();
        assert!((res.remaining - 10.0).abs() < 1e-12);
        assert!((res.price - 90.0).abs() < 1e-12);
    }
}
