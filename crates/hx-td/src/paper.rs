//! In-process paper exchange.
//!
//! Implements [`ExchangeClient`] and [`PriceSource`] against an in-memory
//! order book so the engine can run on testnet without wire plumbing, and so
//! tests can script exchange misbehaviour.
//!
//! # Matching
//!
//! - Market orders fill immediately at the last pushed price (taker fee).
//! - Limit orders rest until [`PaperExchange::push_price`] crosses them, then
//!   fill completely at the limit price (maker fee, negative = rebate).
//! - Post-only orders that would cross on arrival are rejected.
//! - Reduce-only orders that would grow the position are rejected.
//!
//! # Idempotency
//!
//! Placing an order whose `client_key` is already known returns the existing
//! order instead of creating a second one, like a real exchange would.
//!
//! # Fault injection
//!
//! [`PaperExchange::script`] queues [`Fault`]s consumed one per
//! `place_order` call.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use hx_core::exchange::{ExchangeClient, ExchangeError, OrderAck, OrderRequest, PriceSource};
use hx_core::time_util::now_us;
use hx_core::types::*;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

const FILL_CHANNEL_CAPACITY: usize = 65_536;
const PRICE_CHANNEL_CAPACITY: usize = 65_536;

/// A scripted misbehaviour for one `place_order` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The order is placed but the acknowledgement is lost.
    TimeoutAfterPlace,
    /// The request never reaches the matching engine.
    TimeoutBeforePlace,
    /// 5xx before processing.
    ServerError,
    RateLimited,
    Disconnected,
    /// Definitive refusal.
    Reject(String),
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: OrderId,
    client_key: String,
    owner: Owner,
    symbol: String,
    side: Side,
    size: f64,
    filled: f64,
    avg_price: f64,
    price: OrderPrice,
    status: OrderStatus,
}

impl PaperOrder {
    fn ack(&self) -> OrderAck {
        OrderAck {
            order_id: self.order_id,
            client_key: self.client_key.clone(),
            status: self.status,
            filled_size: self.filled,
            avg_price: self.avg_price,
        }
    }
}

struct PaperState {
    next_order_id: OrderId,
    next_fill_id: u64,
    orders: AHashMap<OrderId, PaperOrder>,
    by_key: AHashMap<String, OrderId>,
    prices: AHashMap<String, f64>,
    positions: AHashMap<(Owner, String), f64>,
    equity: AHashMap<Owner, f64>,
    faults: VecDeque<Fault>,
    place_calls: u64,
    subscribe_failures: u32,
    latency: Duration,
    maker_fee_rate: f64,
    taker_fee_rate: f64,
    duplicate_fills: bool,
}

pub struct PaperExchange {
    state: Mutex<PaperState>,
    fills_tx: broadcast::Sender<Fill>,
    prices_tx: broadcast::Sender<RawTick>,
    /// Bumped to end every open price stream (simulated disconnect).
    generation: watch::Sender<u64>,
}

impl PaperExchange {
    pub fn new() -> Self {
        let (fills_tx, _) = broadcast::channel(FILL_CHANNEL_CAPACITY);
        let (prices_tx, _) = broadcast::channel(PRICE_CHANNEL_CAPACITY);
        let (generation, _) = watch::channel(0);
        Self {
            state: Mutex::new(PaperState {
                next_order_id: 1,
                next_fill_id: 1,
                orders: AHashMap::new(),
                by_key: AHashMap::new(),
                prices: AHashMap::new(),
                positions: AHashMap::new(),
                equity: AHashMap::new(),
                faults: VecDeque::new(),
                place_calls: 0,
                subscribe_failures: 0,
                latency: Duration::ZERO,
                maker_fee_rate: -0.0001,
                taker_fee_rate: 0.00035,
                duplicate_fills: false,
            }),
            fills_tx,
            prices_tx,
            generation,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Test / driver controls
    // -----------------------------------------------------------------------

    /// Queue faults for upcoming `place_order` calls.
    pub fn script(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().faults.extend(faults);
    }

    /// Fail the next `n` price subscriptions.
    pub fn fail_subscriptions(&self, n: u32) {
        self.lock().subscribe_failures = n;
    }

    /// End every open price stream.
    pub fn drop_price_streams(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Delay applied to every order call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_equity(&self, owner: &Owner, equity: f64) {
        self.lock().equity.insert(owner.clone(), equity);
    }

    /// Fee rates as fractions of notional (negative maker = rebate).
    pub fn set_fees(&self, maker: f64, taker: f64) {
        let mut st = self.lock();
        st.maker_fee_rate = maker;
        st.taker_fee_rate = taker;
    }

    /// Deliver every fill twice.
    pub fn set_duplicate_fills(&self, on: bool) {
        self.lock().duplicate_fills = on;
    }

    pub fn place_calls(&self) -> u64 {
        self.lock().place_calls
    }

    /// Total orders ever created.
    pub fn order_count(&self) -> usize {
        self.lock().orders.len()
    }

    /// Orders still resting for `owner`.
    pub fn live_orders(&self, owner: &Owner) -> usize {
        self.lock()
            .orders
            .values()
            .filter(|o| &o.owner == owner && o.status.is_live())
            .count()
    }

    pub fn position(&self, owner: &Owner, symbol: &str) -> f64 {
        self.lock()
            .positions
            .get(&(owner.clone(), symbol.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.lock().prices.get(symbol).copied()
    }

    /// Publish a trade price: broadcast it to price streams and match resting
    /// orders against it.
    pub fn push_price(&self, symbol: &str, price: f64) {
        self.push_tick(RawTick::trade(symbol, price, now_us()));
    }

    pub fn push_tick(&self, tick: RawTick) {
        {
            let mut st = self.lock();
            if tick.price.is_finite() && tick.price > 0.0 {
                let symbol = tick.symbol.trim().to_ascii_uppercase();
                st.prices.insert(symbol.clone(), tick.price);
                self.match_resting(&mut st, &symbol, tick.price);
            }
        }
        let _ = self.prices_tx.send(tick);
    }

    // -----------------------------------------------------------------------
    // Matching
    // -----------------------------------------------------------------------

    fn match_resting(&self, st: &mut PaperState, symbol: &str, price: f64) {
        let crossing: Vec<OrderId> = st
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status.is_live())
            .filter(|o| match (o.price, o.side) {
                (OrderPrice::Limit(p), Side::Buy) => price <= p,
                (OrderPrice::Limit(p), Side::Sell) => price >= p,
                (OrderPrice::Market, _) => true,
            })
            .map(|o| o.order_id)
            .collect();
        for id in crossing {
            let (limit, remaining) = match st.orders.get(&id) {
                Some(o) => (o.price.limit().unwrap_or(price), o.size - o.filled),
                None => continue,
            };
            let fee_rate = st.maker_fee_rate;
            self.execute(st, id, remaining, limit, fee_rate);
        }
    }

    fn execute(&self, st: &mut PaperState, id: OrderId, size: f64, price: f64, fee_rate: f64) {
        let fill_id = format!("pf-{}", st.next_fill_id);
        st.next_fill_id += 1;
        let Some(order) = st.orders.get_mut(&id) else {
            return;
        };
        let total = order.filled + size;
        order.avg_price = (order.avg_price * order.filled + price * size) / total;
        order.filled = total;
        order.status = if order.filled + SIZE_EPS >= order.size {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let fill = Fill {
            fill_id,
            order_id: id,
            idempotency_key: order.client_key.clone(),
            owner: order.owner.clone(),
            strategy_id: None,
            symbol: order.symbol.clone(),
            side: order.side,
            size,
            price,
            fee: size * price * fee_rate,
            timestamp_us: now_us(),
        };
        *st.positions.entry((fill.owner.clone(), fill.symbol.clone())).or_insert(0.0) +=
            fill.side.sign() * size;
        debug!("[paper] fill {} {} {} {size}@{price}", fill.fill_id, fill.owner, fill.symbol);
        if st.duplicate_fills {
            let _ = self.fills_tx.send(fill.clone());
        }
        let _ = self.fills_tx.send(fill);
    }

    fn place_locked(&self, st: &mut PaperState, req: &OrderRequest) -> OrderAck {
        if let Some(id) = st.by_key.get(&req.client_key) {
            if let Some(existing) = st.orders.get(id) {
                return existing.ack();
            }
        }

        let id = st.next_order_id;
        st.next_order_id += 1;
        let last = st.prices.get(&req.symbol).copied();
        let net = st.positions.get(&(req.owner.clone(), req.symbol.clone())).copied().unwrap_or(0.0);

        let reject = if req.reduce_only
            && (net.abs() <= SIZE_EPS || net.signum() == req.side.sign())
        {
            Some("reduce-only order would increase position")
        } else {
            match (req.price, last) {
                (OrderPrice::Market, None) => Some("no reference price for market order"),
                (OrderPrice::Limit(p), Some(px)) if req.post_only => {
                    let crosses = match req.side {
                        Side::Buy => p >= px,
                        Side::Sell => p <= px,
                    };
                    crosses.then_some("post-only order would cross")
                }
                _ => None,
            }
        };

        let order = PaperOrder {
            order_id: id,
            client_key: req.client_key.clone(),
            owner: req.owner.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            size: req.size,
            filled: 0.0,
            avg_price: 0.0,
            price: req.price,
            status: if reject.is_some() { OrderStatus::Rejected } else { OrderStatus::Open },
        };
        st.orders.insert(id, order);
        st.by_key.insert(req.client_key.clone(), id);

        if let Some(reason) = reject {
            debug!("[paper] reject {}: {reason}", req.client_key);
        } else if let Some(px) = last {
            let immediate = match (req.price, req.side) {
                (OrderPrice::Market, _) => Some((px, st.taker_fee_rate)),
                (OrderPrice::Limit(p), Side::Buy) if px <= p => Some((px, st.taker_fee_rate)),
                (OrderPrice::Limit(p), Side::Sell) if px >= p => Some((px, st.taker_fee_rate)),
                _ => None,
            };
            if let Some((fill_px, fee_rate)) = immediate {
                let mut size = req.size;
                if req.reduce_only {
                    size = size.min(net.abs());
                }
                self.execute(st, id, size, fill_px, fee_rate);
                if let Some(o) = st.orders.get_mut(&id) {
                    if o.status == OrderStatus::PartiallyFilled && req.price == OrderPrice::Market {
                        // Unfillable remainder of a market order is dropped.
                        o.status = OrderStatus::Cancelled;
                    }
                }
            }
        }

        st.orders.get(&id).map(PaperOrder::ack).unwrap_or(OrderAck {
            order_id: id,
            client_key: req.client_key.clone(),
            status: OrderStatus::Rejected,
            filled_size: 0.0,
            avg_price: 0.0,
        })
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.simulate_latency().await;
        let mut st = self.lock();
        st.place_calls += 1;
        if req.signature.is_empty() || req.agent_key.is_empty() {
            return Err(ExchangeError::Rejected("unsigned request".into()));
        }
        match st.faults.pop_front() {
            None => Ok(self.place_locked(&mut st, req)),
            Some(Fault::TimeoutAfterPlace) => {
                self.place_locked(&mut st, req);
                Err(ExchangeError::Timeout)
            }
            Some(Fault::TimeoutBeforePlace) => Err(ExchangeError::Timeout),
            Some(Fault::ServerError) => {
                Err(ExchangeError::Server { status: 503, message: "unavailable".into() })
            }
            Some(Fault::RateLimited) => Err(ExchangeError::RateLimited),
            Some(Fault::Disconnected) => Err(ExchangeError::Disconnected("connection refused".into())),
            Some(Fault::Reject(reason)) => Err(ExchangeError::Rejected(reason)),
        }
    }

    async fn cancel_order(&self, owner: &Owner, order_id: OrderId) -> Result<bool, ExchangeError> {
        self.simulate_latency().await;
        let mut st = self.lock();
        let order = st.orders.get_mut(&order_id).ok_or(ExchangeError::UnknownOrder)?;
        if &order.owner != owner {
            return Err(ExchangeError::UnknownOrder);
        }
        if !order.status.is_live() {
            return Ok(false);
        }
        order.status = OrderStatus::Cancelled;
        Ok(true)
    }

    async fn modify_order(
        &self,
        owner: &Owner,
        order_id: OrderId,
        new_price: Option<f64>,
        new_size: Option<f64>,
    ) -> Result<OrderAck, ExchangeError> {
        self.simulate_latency().await;
        let mut st = self.lock();
        let order = st.orders.get_mut(&order_id).ok_or(ExchangeError::UnknownOrder)?;
        if &order.owner != owner {
            return Err(ExchangeError::UnknownOrder);
        }
        if !order.status.is_live() {
            return Err(ExchangeError::Rejected("order is not live".into()));
        }
        if let Some(size) = new_size {
            if size + SIZE_EPS < order.filled {
                return Err(ExchangeError::Rejected("size below filled quantity".into()));
            }
            order.size = size;
        }
        if let Some(price) = new_price {
            if order.price == OrderPrice::Market {
                return Err(ExchangeError::Rejected("cannot reprice a market order".into()));
            }
            order.price = OrderPrice::Limit(price);
        }
        let ack = order.ack();
        let symbol = order.symbol.clone();
        if let Some(px) = st.prices.get(&symbol).copied() {
            self.match_resting(&mut st, &symbol, px);
            return Ok(st.orders.get(&order_id).map(PaperOrder::ack).unwrap_or(ack));
        }
        Ok(ack)
    }

    async fn query_order_status(
        &self,
        owner: &Owner,
        client_key: &str,
    ) -> Result<Option<OrderAck>, ExchangeError> {
        self.simulate_latency().await;
        let st = self.lock();
        Ok(st
            .by_key
            .get(client_key)
            .and_then(|id| st.orders.get(id))
            .filter(|o| &o.owner == owner)
            .map(PaperOrder::ack))
    }

    async fn get_account_state(&self, owner: &Owner) -> Result<AccountState, ExchangeError> {
        let st = self.lock();
        let margin_used = st
            .orders
            .values()
            .filter(|o| &o.owner == owner && o.status.is_live())
            .map(|o| (o.size - o.filled) * o.price.limit().unwrap_or(0.0))
            .sum();
        Ok(AccountState {
            owner: owner.clone(),
            equity: st.equity.get(owner).copied().unwrap_or(0.0),
            margin_used,
        })
    }

    async fn fills(&self) -> Result<BoxStream<'static, Fill>, ExchangeError> {
        let rx = self.fills_tx.subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(fill) => return Some((fill, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[paper] fill stream lagged, {n} fills skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl PriceSource for PaperExchange {
    async fn subscribe_prices(
        &self,
        symbols: &[String],
    ) -> Result<BoxStream<'static, RawTick>, ExchangeError> {
        {
            let mut st = self.lock();
            if st.subscribe_failures > 0 {
                st.subscribe_failures -= 1;
                return Err(ExchangeError::Disconnected("price feed unavailable".into()));
            }
        }
        let wanted: AHashSet<String> = symbols.iter().map(|s| s.to_ascii_uppercase()).collect();
        let rx = self.prices_tx.subscribe();
        let mut gen_rx = self.generation.subscribe();
        gen_rx.borrow_and_update();

        let stream = futures_util::stream::unfold(
            (rx, gen_rx, wanted),
            |(mut rx, mut gen_rx, wanted)| async move {
                loop {
                    tokio::select! {
                        _ = gen_rx.changed() => return None,
                        r = rx.recv() => match r {
                            Ok(tick) => {
                                if wanted.contains(&tick.symbol.trim().to_ascii_uppercase()) {
                                    return Some((tick, (rx, gen_rx, wanted)));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("[paper] price stream lagged, {n} ticks skipped");
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(key: &str, side: Side, size: f64, price: OrderPrice) -> OrderRequest {
        OrderRequest {
            client_key: key.into(),
            owner: Owner::user("u"),
            symbol: "BTC".into(),
            side,
            size,
            price,
            post_only: false,
            reduce_only: false,
            agent_key: "agent".into(),
            signature: "sig".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_order() {
        let ex = PaperExchange::new();
        let a = ex.place_order(&req("k", Side::Buy, 1.0, OrderPrice::Limit(10.0))).await.unwrap();
        let b = ex.place_order(&req("k", Side::Buy, 1.0, OrderPrice::Limit(10.0))).await.unwrap();
        assert_eq!(a.order_id, b.order_id);
        assert_eq!(ex.order_count(), 1);
    }

    #[tokio::test]
    async fn resting_order_fills_when_crossed() {
        let ex = PaperExchange::new();
        let mut fills = ex.fills().await.unwrap();
        ex.push_price("BTC", 100.0);
        let ack = ex.place_order(&req("k", Side::Buy, 2.0, OrderPrice::Limit(95.0))).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Open);

        ex.push_price("BTC", 96.0);
        assert_eq!(ex.live_orders(&Owner::user("u")), 1);
        ex.push_price("BTC", 94.0);
        let fill = fills.next().await.unwrap();
        assert_eq!(fill.size, 2.0);
        assert_eq!(fill.price, 95.0);
        assert!(fill.fee < 0.0, "maker rebate");
        assert_eq!(ex.position(&Owner::user("u"), "BTC"), 2.0);
    }

    #[tokio::test]
    async fn market_and_post_only_rules() {
        let ex = PaperExchange::new();
        let no_px = ex.place_order(&req("m0", Side::Buy, 1.0, OrderPrice::Market)).await.unwrap();
        assert_eq!(no_px.status, OrderStatus::Rejected);

        ex.push_price("BTC", 100.0);
        let mkt = ex.place_order(&req("m1", Side::Buy, 1.0, OrderPrice::Market)).await.unwrap();
        assert_eq!(mkt.status, OrderStatus::Filled);

        let mut po = req("p", Side::Buy, 1.0, OrderPrice::Limit(101.0));
        po.post_only = true;
        let ack = ex.place_order(&po).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Rejected);

        let mut ro = req("r", Side::Buy, 1.0, OrderPrice::Market);
        ro.reduce_only = true;
        let ack = ex.place_order(&ro).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn scripted_faults_apply_in_order() {
        let ex = PaperExchange::new();
        ex.script([Fault::TimeoutAfterPlace, Fault::RateLimited]);
        let r = req("k", Side::Buy, 1.0, OrderPrice::Limit(1.0));
        assert_eq!(ex.place_order(&r).await, Err(ExchangeError::Timeout));
        assert_eq!(ex.order_count(), 1, "placed despite the timeout");
        assert_eq!(ex.place_order(&r).await, Err(ExchangeError::RateLimited));
        let ack = ex.place_order(&r).await.unwrap();
        assert_eq!(ack.order_id, 1);
        assert_eq!(ex.place_calls(), 3);
    }

    #[tokio::test]
    async fn price_stream_filters_and_disconnects() {
        let ex = PaperExchange::new();
        ex.fail_subscriptions(1);
        assert!(ex.subscribe_prices(&["BTC".into()]).await.is_err());
        let mut s = ex.subscribe_prices(&["BTC".into()]).await.unwrap();
        ex.push_price("ETH", 1.0);
        ex.push_price("BTC", 2.0);
        assert_eq!(s.next().await.unwrap().price, 2.0);
        ex.drop_price_streams();
        assert!(s.next().await.is_none());
    }
}
