//! Shared rig for engine scenarios: a paper exchange, registered agents and
//! a fast-ticking config.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hx_core::config::AppConfig;
use hx_core::types::Owner;
use hx_engine::{Engine, EngineContext, StateStore};
use hx_td::{AgentRegistry, AgentWallet, PaperExchange};

pub fn agents(owners: &[Owner]) -> Arc<AgentRegistry> {
    let reg = AgentRegistry::new();
    for (i, owner) in owners.iter().enumerate() {
        reg.register(AgentWallet::from_ed25519_seed(owner.clone(), &[i as u8 + 11; 32]));
    }
    Arc::new(reg)
}

/// BTC and ETH subscribed, housekeeping every 50ms, no epoch timer, tight
/// retry backoff.
pub fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.tick_interval_ms = 50;
    cfg.vault.distribution_interval_ms = 0;
    cfg.gateway.base_backoff_ms = 1;
    cfg.gateway.max_backoff_ms = 5;
    cfg.feed.reconnect_backoff_ms = 5;
    cfg.feed.symbols = vec!["BTC".into(), "ETH".into()];
    cfg
}

pub struct Rig {
    pub paper: Arc<PaperExchange>,
    pub engine: Engine,
}

pub async fn start(cfg: AppConfig, owners: &[Owner]) -> Rig {
    let paper = Arc::new(PaperExchange::new());
    start_on(cfg, paper, owners, None).await
}

pub async fn start_on(
    cfg: AppConfig,
    paper: Arc<PaperExchange>,
    owners: &[Owner],
    store: Option<Arc<dyn StateStore>>,
) -> Rig {
    for owner in owners {
        if owner.vault_id().is_none() {
            paper.set_equity(owner, 100_000.0);
        }
    }
    let mut ctx = EngineContext::single(cfg, Arc::clone(&paper), agents(owners));
    if let Some(store) = store {
        ctx = ctx.with_store(store);
    }
    let engine = Engine::start(ctx).await.expect("engine starts");
    Rig { paper, engine }
}

/// Poll `cond` every 10ms for up to 5s.
pub async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Keep publishing `price` until the engine has marked `symbol` with it.
/// Prices published before the feed subscribed are lost, so a single push
/// is not enough right after start.
pub async fn publish_until_marked(rig: &Rig, symbol: &str, price: f64) {
    let marked = eventually(|| async move {
        rig.paper.push_price(symbol, price);
        rig.engine.mark_price(symbol) == Some(price)
    })
    .await;
    assert!(marked, "{symbol} never marked at {price}");
}

/// Small deterministic generator for randomized checks.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in [lo, hi).
    pub fn range(&mut self, lo: f64, hi: f64) -> f64 {
        let unit = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        lo + unit * (hi - lo)
    }

    pub fn chance(&mut self, p: f64) -> bool {
        self.range(0.0, 1.0) < p
    }
}
