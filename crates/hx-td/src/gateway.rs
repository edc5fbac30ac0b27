//! Order execution gateway.
//!
//! Sits between the risk-checked order flow and an [`ExchangeClient`]. It owns
//! the local order book, the idempotency-key store and the in-flight
//! submission counters used by emergency stops.
//!
//! # Submission
//!
//! ```text
//! validate ─► kill switch ─► claim key ─► sign ─► place ──ok──► adopt ack
//!                               │                   │
//!                               │            transient error
//!                               │                   ▼
//!                               │      backoff (halt preempts) ─► query by key
//!                               │                   │              (if ambiguous)
//!                               ▼                   ▼
//!                   Unknown key: query first    exhausted: SubmissionUnknown,
//!                                               key parked for reconciliation
//! ```
//!
//! The same idempotency key never yields a second order: a resubmission of a
//! placed key returns the existing order, a parked key is reconciled through
//! `query_order_status` before anything is placed, and the exchange itself
//! deduplicates on `client_key`.
//!
//! No lock is held across an exchange call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHashMap;
use futures_util::StreamExt;
use hx_core::config::GatewayConfig;
use hx_core::dedup::TtlStore;
use hx_core::error::{HxError, HxResult};
use hx_core::exchange::{ExchangeClient, ExchangeError, OrderAck, OrderRequest};
use hx_core::kill_switch::KillSwitch;
use hx_core::time_util::now_us;
use hx_core::types::*;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentAction, ExchangeContext};
use crate::config::{RetryPolicy, idempotency_ttl_us};
use crate::event::{GatewayEvent, GatewayEventSender};

const MAX_STREAM_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Idempotency keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum KeyState {
    /// A submission holding this key is running.
    InFlight,
    Placed(OrderId),
    /// Retries exhausted after an ambiguous failure; must be reconciled.
    Unknown,
    Rejected(String),
}

#[derive(Debug, Clone)]
struct KeyEntry {
    intent: OrderIntent,
    state: KeyState,
}

enum Claim {
    Fresh,
    Existing(Order),
    Reconcile,
}

// ---------------------------------------------------------------------------
// Local order book
// ---------------------------------------------------------------------------

/// Orders by id. Live orders stay until they turn terminal; terminal ones
/// are kept up to `history_cap`, oldest dropped first.
struct OrderBook {
    orders: AHashMap<OrderId, Order>,
    /// Terminal order ids, in the order they turned terminal.
    history: VecDeque<OrderId>,
    history_cap: usize,
    /// Fills that arrived before their order was acknowledged, by key.
    early_fills: TtlStore<String, Vec<(f64, f64, u64)>>,
}

impl OrderBook {
    fn new(cfg: &GatewayConfig) -> Self {
        Self {
            orders: AHashMap::new(),
            history: VecDeque::new(),
            history_cap: cfg.order_history_capacity.max(1),
            early_fills: TtlStore::new(cfg.idempotency_capacity, idempotency_ttl_us(cfg)),
        }
    }

    fn insert(&mut self, order: Order) {
        let id = order.order_id;
        let terminal = order.status.is_terminal();
        let was_terminal = self.orders.insert(id, order).is_some_and(|o| o.status.is_terminal());
        if terminal && !was_terminal {
            self.retire(id);
        }
    }

    /// Mutate one order in place and return the updated copy.
    fn update(&mut self, id: OrderId, f: impl FnOnce(&mut Order)) -> Option<Order> {
        let o = self.orders.get_mut(&id)?;
        let was_terminal = o.status.is_terminal();
        f(o);
        let updated = o.clone();
        if updated.status.is_terminal() && !was_terminal {
            self.retire(id);
        }
        Some(updated)
    }

    fn retire(&mut self, id: OrderId) {
        self.history.push_back(id);
        while self.history.len() > self.history_cap {
            if let Some(old) = self.history.pop_front() {
                self.orders.remove(&old);
            }
        }
    }

    /// Hold a fill for an order not acknowledged yet.
    fn hold_early(&mut self, fill: &Fill, now: u64) {
        let mut held = self.early_fills.remove(&fill.idempotency_key).unwrap_or_default();
        held.push((fill.size, fill.price, fill.timestamp_us));
        self.early_fills.insert(fill.idempotency_key.clone(), held, now);
    }
}

/// Cancel result for one order of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub order_id: OrderId,
    pub owner: Owner,
    pub idempotency_key: String,
    /// `Ok(true)` cancelled, `Ok(false)` no longer live, `Err` failed.
    pub result: Result<bool, String>,
}

/// Gateway counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub submitted: AtomicU64,
    pub retries: AtomicU64,
    pub adopted: AtomicU64,
    pub unknown: AtomicU64,
    pub rejected: AtomicU64,
    pub cancelled: AtomicU64,
}

pub struct OrderGateway {
    client: Arc<dyn ExchangeClient>,
    ctx: ExchangeContext,
    kill: Arc<KillSwitch>,
    policy: RetryPolicy,
    drain_timeout: Duration,
    key_ttl_us: u64,
    keys: Mutex<TtlStore<String, KeyEntry>>,
    book: Mutex<OrderBook>,
    inflight: Mutex<AHashMap<Owner, usize>>,
    drained: Notify,
    events: GatewayEventSender,
    stats: GatewayStats,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reject malformed intents before anything else happens.
pub fn validate_intent(intent: &OrderIntent) -> HxResult<()> {
    let bad = |msg: String| Err(HxError::Validation(msg));
    if intent.idempotency_key.is_empty() {
        return bad("empty idempotency key".into());
    }
    if intent.symbol.trim().is_empty() {
        return bad("empty symbol".into());
    }
    if !intent.size.is_finite() || intent.size <= 0.0 {
        return bad(format!("invalid size {}", intent.size));
    }
    match intent.price {
        OrderPrice::Limit(p) if !p.is_finite() || p <= 0.0 => bad(format!("invalid price {p}")),
        OrderPrice::Market if intent.post_only => bad("post-only market order".into()),
        _ => Ok(()),
    }
}

/// Shape checks for an amendment; `new_size` is the new total order size.
pub fn validate_modify(new_price: Option<f64>, new_size: Option<f64>) -> HxResult<()> {
    if new_price.is_none() && new_size.is_none() {
        return Err(HxError::Validation("modify needs a new price or size".into()));
    }
    for v in new_price.iter().chain(new_size.iter()) {
        if !v.is_finite() || *v <= 0.0 {
            return Err(HxError::Validation(format!("invalid modify value {v}")));
        }
    }
    Ok(())
}

struct InflightGuard<'a> {
    gw: &'a OrderGateway,
    owner: Owner,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = lock(&self.gw.inflight);
        if let Some(n) = inflight.get_mut(&self.owner) {
            *n -= 1;
            if *n == 0 {
                inflight.remove(&self.owner);
            }
        }
        drop(inflight);
        self.gw.drained.notify_waiters();
    }
}

impl OrderGateway {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        ctx: ExchangeContext,
        kill: Arc<KillSwitch>,
        cfg: &GatewayConfig,
        events: GatewayEventSender,
    ) -> Self {
        info!(
            "[gateway] {} network, {} attempts, backoff {}..{}ms",
            ctx.network, cfg.max_attempts, cfg.base_backoff_ms, cfg.max_backoff_ms
        );
        Self {
            client,
            ctx,
            kill,
            policy: RetryPolicy::from_config(cfg),
            drain_timeout: Duration::from_millis(cfg.inflight_drain_timeout_ms),
            key_ttl_us: idempotency_ttl_us(cfg),
            keys: Mutex::new(TtlStore::new(cfg.idempotency_capacity, idempotency_ttl_us(cfg))),
            book: Mutex::new(OrderBook::new(cfg)),
            inflight: Mutex::new(AHashMap::new()),
            drained: Notify::new(),
            events,
            stats: GatewayStats::default(),
        }
    }

    pub fn context(&self) -> &ExchangeContext {
        &self.ctx
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Default bound for [`wait_for_drain`](Self::wait_for_drain).
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Submit an intent. Idempotent on `intent.idempotency_key`.
    pub async fn submit(&self, intent: OrderIntent) -> HxResult<Order> {
        validate_intent(&intent)?;
        // Counted before the halt check so a drain that saw zero also sees the halt.
        let _guard = self.track(&intent.owner);
        if let Some(scope) = self.kill.halted_scope(&intent.owner) {
            return Err(HxError::Halted(scope));
        }

        let claim = self.claim_key(&intent)?;
        match claim {
            Claim::Existing(order) => {
                debug!("[gateway] {} already placed as {}", intent.idempotency_key, order.order_id);
                return Ok(order);
            }
            Claim::Fresh => {}
            Claim::Reconcile => {
                let key = &intent.idempotency_key;
                match self.client.query_order_status(&intent.owner, key).await {
                    Ok(Some(ack)) => {
                        info!("[gateway] {key} reconciled to existing order {}", ack.order_id);
                        self.stats.adopted.fetch_add(1, Ordering::Relaxed);
                        return self.adopt_checked(&intent, &ack).await;
                    }
                    Ok(None) => debug!("[gateway] {key} unknown to exchange, placing"),
                    Err(e) => {
                        warn!("[gateway] {key} reconciliation failed: {e}");
                        self.set_key(&intent, KeyState::Unknown);
                        return Err(HxError::SubmissionUnknown { key: key.clone() });
                    }
                }
            }
        }

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.place_with_retries(&intent).await
    }

    fn claim_key(&self, intent: &OrderIntent) -> HxResult<Claim> {
        let key = &intent.idempotency_key;
        let now = now_us();
        let mut keys = lock(&self.keys);
        let state = keys.get(key, now).map(|e| e.state.clone());
        match state {
            Some(KeyState::InFlight) => {
                Err(HxError::Validation(format!("submission {key} already in flight")))
            }
            Some(KeyState::Rejected(reason)) => Err(HxError::ExchangeRejected(reason)),
            Some(KeyState::Placed(id)) => {
                let existing = lock(&self.book).orders.get(&id).cloned();
                match existing {
                    Some(order) => Ok(Claim::Existing(order)),
                    None => {
                        keys.insert(key.clone(), in_flight(intent), now);
                        Ok(Claim::Reconcile)
                    }
                }
            }
            Some(KeyState::Unknown) => {
                keys.insert(key.clone(), in_flight(intent), now);
                Ok(Claim::Reconcile)
            }
            None => {
                keys.insert(key.clone(), in_flight(intent), now);
                Ok(Claim::Fresh)
            }
        }
    }

    async fn place_with_retries(&self, intent: &OrderIntent) -> HxResult<Order> {
        let owner = &intent.owner;
        let key = &intent.idempotency_key;
        let mut req = OrderRequest {
            client_key: key.clone(),
            owner: owner.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            size: intent.size,
            price: intent.price,
            post_only: intent.post_only,
            reduce_only: intent.reduce_only,
            agent_key: String::new(),
            signature: String::new(),
        };
        if let Err(e) = self.ctx.agents.sign_order(&mut req) {
            self.forget_key(key);
            return Err(e);
        }

        let max = self.policy.max_attempts;
        let mut ambiguous = false;
        let mut last_err: Option<ExchangeError> = None;

        for attempt in 1..=max {
            if let Some(scope) = self.kill.halted_scope(owner) {
                return self.abort_halted(intent, ambiguous, scope).await;
            }
            if ambiguous {
                // The previous attempt may have landed; adopt rather than re-place.
                if let Ok(Some(ack)) = self.client.query_order_status(owner, key).await {
                    info!("[gateway] {key} found after ambiguous failure, adopting {}", ack.order_id);
                    self.stats.adopted.fetch_add(1, Ordering::Relaxed);
                    return self.adopt_checked(intent, &ack).await;
                }
            }

            match self.client.place_order(&req).await {
                Ok(ack) => return self.adopt_checked(intent, &ack).await,
                Err(e) if e.is_transient() => {
                    ambiguous |= e.is_ambiguous();
                    warn!("[gateway] {key} attempt {attempt}/{max} failed: {e}");
                    last_err = Some(e);
                    if attempt < max {
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        self.kill.sleep_unless_halted(owner, self.policy.delay(attempt)).await;
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!("[gateway] {key} rejected: {reason}");
                    self.set_key(intent, KeyState::Rejected(reason.clone()));
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(HxError::ExchangeRejected(reason));
                }
            }
        }

        if ambiguous {
            error!("[gateway] {key} outcome unknown after {max} attempts, parked for reconciliation");
            self.set_key(intent, KeyState::Unknown);
            self.stats.unknown.fetch_add(1, Ordering::Relaxed);
            Err(HxError::SubmissionUnknown { key: key.clone() })
        } else {
            self.forget_key(key);
            let msg = last_err.map(|e| e.to_string()).unwrap_or_default();
            Err(HxError::TransientNetwork(msg))
        }
    }

    /// A halt arrived between attempts. An ambiguous earlier attempt may have
    /// left an order behind; adopt (and thereby cancel) it if it exists.
    async fn abort_halted(
        &self,
        intent: &OrderIntent,
        ambiguous: bool,
        scope: StopScope,
    ) -> HxResult<Order> {
        let key = &intent.idempotency_key;
        if !ambiguous {
            self.forget_key(key);
            return Err(HxError::Halted(scope));
        }
        match self.client.query_order_status(&intent.owner, key).await {
            Ok(Some(ack)) => {
                self.adopt_checked(intent, &ack).await?;
            }
            Ok(None) => self.forget_key(key),
            Err(e) => {
                warn!("[gateway] {key} halted with unresolved submission: {e}");
                self.set_key(intent, KeyState::Unknown);
            }
        }
        Err(HxError::Halted(scope))
    }

    /// Record an acknowledgement. Rejected acks become errors; live orders
    /// acknowledged while their owner is halted are cancelled at once.
    async fn adopt_checked(&self, intent: &OrderIntent, ack: &OrderAck) -> HxResult<Order> {
        let order = self.adopt(intent, ack);
        if order.status == OrderStatus::Rejected {
            let reason = format!("order {} rejected by exchange", order.order_id);
            self.set_key(intent, KeyState::Rejected(reason.clone()));
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(HxError::ExchangeRejected(reason));
        }
        if let Some(scope) = self.kill.halted_scope(&intent.owner) {
            if order.status.is_live() {
                warn!("[gateway] order {} acknowledged while halted, cancelling", order.order_id);
                if let Err(e) = self.cancel(order.order_id).await {
                    error!("[gateway] cancel of {} after halt failed: {e}", order.order_id);
                }
            }
            return Err(HxError::Halted(scope));
        }
        Ok(order)
    }

    fn adopt(&self, intent: &OrderIntent, ack: &OrderAck) -> Order {
        let now = now_us();
        let status = match ack.status {
            OrderStatus::Rejected => OrderStatus::Rejected,
            OrderStatus::Cancelled => OrderStatus::Cancelled,
            // Fill progress is driven by the fill stream.
            _ => OrderStatus::Open,
        };
        let mut keys = lock(&self.keys);
        let mut book = lock(&self.book);
        if let Some(existing) = book.orders.get(&ack.order_id) {
            return existing.clone();
        }
        let mut order = Order {
            order_id: ack.order_id,
            intent: intent.clone(),
            status,
            filled_size: 0.0,
            avg_price: 0.0,
            created_us: now,
            updated_us: now,
        };
        if let Some(early) = book.early_fills.remove(&intent.idempotency_key) {
            for (size, price, ts) in early {
                order.apply_fill(size, price, ts);
            }
        }
        book.insert(order.clone());
        drop(book);
        keys.insert(
            intent.idempotency_key.clone(),
            KeyEntry { intent: intent.clone(), state: KeyState::Placed(order.order_id) },
            now,
        );
        drop(keys);

        info!("[gateway] {} -> order {} {:?}", intent, order.order_id, order.status);
        let _ = self.events.send(GatewayEvent::OrderUpdate(order.clone()));
        order
    }

    fn set_key(&self, intent: &OrderIntent, state: KeyState) {
        let mut keys = lock(&self.keys);
        keys.insert(
            intent.idempotency_key.clone(),
            KeyEntry { intent: intent.clone(), state },
            now_us(),
        );
    }

    fn forget_key(&self, key: &str) {
        lock(&self.keys).remove(&key.to_string());
    }

    fn track(&self, owner: &Owner) -> InflightGuard<'_> {
        *lock(&self.inflight).entry(owner.clone()).or_insert(0) += 1;
        InflightGuard { gw: self, owner: owner.clone() }
    }

    // -----------------------------------------------------------------------
    // Cancel / modify
    // -----------------------------------------------------------------------

    /// Cancel an order. `Ok(false)` if it was no longer live. Cancels are
    /// allowed while halted.
    pub async fn cancel(&self, order_id: OrderId) -> HxResult<bool> {
        let order = self
            .order(order_id)
            .ok_or_else(|| HxError::NotFound(format!("order {order_id}")))?;
        if order.status.is_terminal() {
            return Ok(false);
        }
        let owner = order.owner().clone();
        self.authorize_agent(&owner, AgentAction::CancelOrder)?;

        let max = self.policy.max_attempts;
        for attempt in 1..=max {
            match self.client.cancel_order(&owner, order_id).await {
                Ok(true) => {
                    self.set_status(order_id, OrderStatus::Cancelled);
                    self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    return Ok(true);
                }
                Ok(false) => {
                    self.sync_status(&order).await;
                    return Ok(false);
                }
                Err(ExchangeError::UnknownOrder) => {
                    warn!("[gateway] cancel {order_id}: unknown to exchange, marking cancelled");
                    self.set_status(order_id, OrderStatus::Cancelled);
                    return Ok(false);
                }
                Err(e) if e.is_transient() && attempt < max => {
                    warn!("[gateway] cancel {order_id} attempt {attempt}/{max} failed: {e}");
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
                Err(e) if e.is_transient() => return Err(HxError::TransientNetwork(e.to_string())),
                Err(e) => return Err(HxError::ExchangeRejected(e.to_string())),
            }
        }
        Err(HxError::TransientNetwork(format!("cancel {order_id} exhausted retries")))
    }

    /// Amend the price and/or size of a live order.
    pub async fn modify(
        &self,
        order_id: OrderId,
        new_price: Option<f64>,
        new_size: Option<f64>,
    ) -> HxResult<Order> {
        validate_modify(new_price, new_size)?;
        let order = self
            .order(order_id)
            .ok_or_else(|| HxError::NotFound(format!("order {order_id}")))?;
        if let Some(scope) = self.kill.halted_scope(order.owner()) {
            return Err(HxError::Halted(scope));
        }
        if order.status.is_terminal() {
            return Err(HxError::Validation(format!("order {order_id} is not live")));
        }
        let owner = order.owner().clone();
        self.authorize_agent(&owner, AgentAction::ModifyOrder)?;

        let max = self.policy.max_attempts;
        let mut attempt = 0;
        let ack = loop {
            attempt += 1;
            match self.client.modify_order(&owner, order_id, new_price, new_size).await {
                Ok(ack) => break ack,
                Err(e) if e.is_transient() && attempt < max => {
                    warn!("[gateway] modify {order_id} attempt {attempt}/{max} failed: {e}");
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
                Err(e) if e.is_transient() => return Err(HxError::TransientNetwork(e.to_string())),
                Err(e) => return Err(HxError::ExchangeRejected(e.to_string())),
            }
        };

        let updated = lock(&self.book)
            .update(order_id, |o| {
                if let Some(p) = new_price {
                    o.intent.price = OrderPrice::Limit(p);
                }
                if let Some(s) = new_size {
                    o.intent.size = s;
                }
                if matches!(ack.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
                    o.status = ack.status;
                }
                o.updated_us = now_us();
            })
            .ok_or_else(|| HxError::NotFound(format!("order {order_id}")))?;
        debug!("[gateway] modified order {order_id}");
        let _ = self.events.send(GatewayEvent::OrderUpdate(updated.clone()));
        Ok(updated)
    }

    fn authorize_agent(&self, owner: &Owner, action: AgentAction) -> HxResult<()> {
        let agent = self.ctx.agents.get(owner)?;
        if !agent.scope().permits(action) {
            return Err(HxError::Agent(format!("agent for {owner} may not {action:?}")));
        }
        Ok(())
    }

    fn set_status(&self, order_id: OrderId, status: OrderStatus) {
        let updated = lock(&self.book).update(order_id, |o| {
            o.status = status;
            o.updated_us = now_us();
        });
        if let Some(o) = updated {
            let _ = self.events.send(GatewayEvent::OrderUpdate(o));
        }
    }

    /// Pull the exchange's view of an order and copy a terminal status.
    async fn sync_status(&self, order: &Order) {
        match self.client.query_order_status(order.owner(), order.key()).await {
            Ok(Some(ack)) if ack.status.is_terminal() => self.set_status(order.order_id, ack.status),
            Ok(Some(_)) => {}
            Ok(None) => self.set_status(order.order_id, OrderStatus::Cancelled),
            Err(e) => warn!("[gateway] status sync for {} failed: {e}", order.order_id),
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation / recovery
    // -----------------------------------------------------------------------

    /// Resolve a key against the exchange. Returns the order if one exists.
    pub async fn reconcile(&self, key: &str) -> HxResult<Option<Order>> {
        let entry = lock(&self.keys)
            .get(&key.to_string(), now_us())
            .cloned()
            .ok_or_else(|| HxError::NotFound(format!("idempotency key {key}")))?;
        match entry.state {
            KeyState::Placed(id) => Ok(self.order(id)),
            KeyState::Rejected(_) => Ok(None),
            KeyState::InFlight => {
                Err(HxError::Validation(format!("submission {key} still in flight")))
            }
            KeyState::Unknown => {
                let intent = entry.intent;
                match self.client.query_order_status(&intent.owner, key).await {
                    Ok(Some(ack)) => {
                        self.stats.adopted.fetch_add(1, Ordering::Relaxed);
                        info!("[gateway] {key} reconciled to order {}", ack.order_id);
                        match self.adopt_checked(&intent, &ack).await {
                            Ok(order) => Ok(Some(order)),
                            Err(HxError::Halted(_)) => Ok(self.order(ack.order_id)),
                            Err(e) => Err(e),
                        }
                    }
                    Ok(None) => {
                        let mut keys = lock(&self.keys);
                        let still_unknown = keys
                            .get(&key.to_string(), now_us())
                            .is_some_and(|e| e.state == KeyState::Unknown);
                        if still_unknown {
                            keys.remove(&key.to_string());
                        }
                        info!("[gateway] {key} never reached the exchange, key released");
                        Ok(None)
                    }
                    Err(e) => Err(HxError::TransientNetwork(e.to_string())),
                }
            }
        }
    }

    /// Keys parked after ambiguous failures, optionally limited to a scope.
    pub fn unknown_keys(&self, scope: &StopScope) -> Vec<String> {
        let keys = lock(&self.keys);
        keys.iter(now_us())
            .filter(|(_, e)| e.state == KeyState::Unknown && scope.matches(&e.intent.owner))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Rehydrate orders from a snapshot and reconcile the non-terminal ones.
    /// Terminal orders are restored as history. Returns the number of orders
    /// still live afterwards.
    pub async fn recover(&self, mut orders: Vec<Order>) -> usize {
        orders.sort_by_key(|o| o.order_id);
        let now = now_us();
        {
            let mut keys = lock(&self.keys);
            let mut book = lock(&self.book);
            for order in &orders {
                keys.insert(
                    order.key().to_string(),
                    KeyEntry { intent: order.intent.clone(), state: KeyState::Placed(order.order_id) },
                    now,
                );
                book.insert(order.clone());
            }
        }
        let mut live = 0;
        for order in orders.iter().filter(|o| o.status.is_live()) {
            self.sync_status(order).await;
            if self.order(order.order_id).is_some_and(|o| o.status.is_live()) {
                live += 1;
            }
        }
        info!("[gateway] recovered {} orders, {live} live", orders.len());
        live
    }

    // -----------------------------------------------------------------------
    // Emergency stop support
    // -----------------------------------------------------------------------

    pub fn inflight(&self, scope: &StopScope) -> usize {
        let inflight = lock(&self.inflight);
        inflight.iter().filter(|(o, _)| scope.matches(o)).map(|(_, n)| *n).sum()
    }

    /// Wait until no submission for `scope` is running. Returns `false` on
    /// timeout.
    pub async fn wait_for_drain(&self, scope: &StopScope, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight(scope) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inflight(scope) == 0;
            }
        }
    }

    /// Cancel every live order in `scope`, reporting each outcome. Parked
    /// keys are reconciled first so orders from ambiguous submissions are
    /// swept too.
    pub async fn cancel_all(&self, scope: &StopScope) -> Vec<CancelOutcome> {
        for key in self.unknown_keys(scope) {
            if let Err(e) = self.reconcile(&key).await {
                warn!("[gateway] reconcile {key} before sweep failed: {e}");
            }
        }
        let targets: Vec<Order> = {
            let book = lock(&self.book);
            book.orders
                .values()
                .filter(|o| o.status.is_live() && scope.matches(o.owner()))
                .cloned()
                .collect()
        };
        let cancels = targets.iter().map(|o| async move {
            let result = self.cancel(o.order_id).await.map_err(|e| e.to_string());
            CancelOutcome {
                order_id: o.order_id,
                owner: o.owner().clone(),
                idempotency_key: o.key().to_string(),
                result,
            }
        });
        let outcomes = futures_util::future::join_all(cancels).await;
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!("[gateway] sweep {scope}: {} orders, {failed} failed", outcomes.len());
        outcomes
    }

    // -----------------------------------------------------------------------
    // Snapshots / fills
    // -----------------------------------------------------------------------

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        lock(&self.book).orders.get(&order_id).cloned()
    }

    pub fn order_by_key(&self, key: &str) -> Option<Order> {
        let state = lock(&self.keys).get(&key.to_string(), now_us()).map(|e| e.state.clone());
        match state {
            Some(KeyState::Placed(id)) => self.order(id),
            _ => None,
        }
    }

    /// The intent that claimed `key`, placed or not.
    pub fn intent_for_key(&self, key: &str) -> Option<OrderIntent> {
        lock(&self.keys).get(&key.to_string(), now_us()).map(|e| e.intent.clone())
    }

    /// All orders of `owner`, oldest first.
    pub fn orders(&self, owner: &Owner) -> Vec<Order> {
        let book = lock(&self.book);
        let mut out: Vec<Order> =
            book.orders.values().filter(|o| o.owner() == owner).cloned().collect();
        out.sort_by_key(|o| o.order_id);
        out
    }

    pub fn open_orders(&self, owner: &Owner) -> Vec<Order> {
        let mut out = self.orders(owner);
        out.retain(|o| o.status.is_live());
        out
    }

    pub fn all_orders(&self) -> Vec<Order> {
        let book = lock(&self.book);
        let mut out: Vec<Order> = book.orders.values().cloned().collect();
        out.sort_by_key(|o| o.order_id);
        out
    }

    /// Fold a (deduplicated) fill into its order. Fills for orders not yet
    /// acknowledged are held until the acknowledgement arrives.
    pub fn apply_fill(&self, fill: &Fill) -> Option<Order> {
        let updated = {
            let mut book = lock(&self.book);
            let updated =
                book.update(fill.order_id, |o| o.apply_fill(fill.size, fill.price, fill.timestamp_us));
            if updated.is_none() {
                book.hold_early(fill, now_us());
            }
            updated
        };
        if let Some(o) = &updated {
            let _ = self.events.send(GatewayEvent::OrderUpdate(o.clone()));
        }
        updated
    }

    /// Subscribe to the exchange fill stream and forward fills as
    /// [`GatewayEvent::Fill`]. The subscription is made before returning so
    /// no fill of a later order is missed; the spawned task resubscribes with
    /// backoff if the stream drops.
    pub async fn start_fill_pump(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> HxResult<JoinHandle<()>> {
        let first = self
            .client
            .fills()
            .await
            .map_err(|e| HxError::TransientNetwork(format!("fill stream: {e}")))?;
        let gw = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let base = gw.policy.base.max(Duration::from_millis(10));
            let mut backoff = base;
            let mut stream = Some(first);
            loop {
                let mut s = match stream.take() {
                    Some(s) => s,
                    None => match gw.client.fills().await {
                        Ok(s) => {
                            info!("[gateway] fill stream reconnected");
                            backoff = base;
                            s
                        }
                        Err(e) => {
                            error!("[gateway] fill stream subscribe failed: {e}");
                            let _ = gw.events.send(GatewayEvent::Error {
                                owner: None,
                                message: format!("fill stream: {e}"),
                            });
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown.changed() => return,
                            }
                            backoff = (backoff * 2).min(MAX_STREAM_BACKOFF);
                            continue;
                        }
                    },
                };
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        item = s.next() => match item {
                            Some(mut fill) => {
                                if fill.strategy_id.is_none() {
                                    fill.strategy_id = gw
                                        .intent_for_key(&fill.idempotency_key)
                                        .and_then(|i| i.strategy_id);
                                }
                                if gw.events.send(GatewayEvent::Fill(fill)).is_err() {
                                    return;
                                }
                            }
                            None => {
                                warn!("[gateway] fill stream ended");
                                break;
                            }
                        },
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }))
    }

    /// Retention window of idempotency keys.
    pub fn key_ttl(&self) -> Duration {
        Duration::from_micros(self.key_ttl_us)
    }
}

fn in_flight(intent: &OrderIntent) -> KeyEntry {
    KeyEntry { intent: intent.clone(), state: KeyState::InFlight }
}
