//! Engine facade: wires the components together and runs the background
//! loops.
//!
//! # Architecture
//!
//! ```text
//! PriceSource ─► MarketDataFeed ─mpsc─► dispatcher ─┬─► PositionBook::mark_symbol ─► stop-loss ─► OrderRouter
//!                                                   └─► Scheduler::dispatch_tick ─► actors ─────► OrderRouter
//! ExchangeClient::fills ─► fill pump ─► event loop ─► Scheduler::route_fill ─► positions, vault accrual, actor
//! housekeeping (tick_interval_ms): account refresh, reconciliation, withdrawal settlement, snapshot
//! distribution (vault.distribution_interval_ms): accrued vault P&L paid out pro-rata
//! ```
//!
//! The command surface (`start_strategy`, `emergency_stop`, `deposit`, ...)
//! is the set of methods on [`Engine`]. Every background task holds the
//! shared `Core`, never the engine itself, so dropping the engine after
//! [`Engine::shutdown`] releases everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use hx_core::config::AppConfig;
use hx_core::error::{HxError, HxResult};
use hx_core::exchange::{ExchangeClient, PriceSource};
use hx_core::kill_switch::KillSwitch;
use hx_core::time_util::now_us;
use hx_core::types::*;
use hx_md::MarketDataFeed;
use hx_td::{AgentRegistry, CancelOutcome, ExchangeContext, GatewayEvent, GatewayEventReceiver, OrderGateway};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::persistence::{EngineSnapshot, MemoryStore, SNAPSHOT_VERSION, StateStore};
use crate::positions::PositionBook;
use crate::risk::RiskManager;
use crate::router::OrderRouter;
use crate::scheduler::{Scheduler, StrategyInstance};
use crate::strategy::StrategyParams;
use crate::vault::{Distribution, VaultLedger, VaultSummary, WithdrawalTicket};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything the engine needs from the outside world.
pub struct EngineContext {
    pub cfg: AppConfig,
    pub client: Arc<dyn ExchangeClient>,
    pub prices: Arc<dyn PriceSource>,
    pub agents: Arc<AgentRegistry>,
    pub store: Arc<dyn StateStore>,
}

impl EngineContext {
    /// Orders and prices from one venue that implements both traits, state
    /// kept in memory.
    pub fn single<X>(cfg: AppConfig, venue: Arc<X>, agents: Arc<AgentRegistry>) -> Self
    where
        X: ExchangeClient + PriceSource + 'static,
    {
        Self {
            cfg,
            client: Arc::clone(&venue) as Arc<dyn ExchangeClient>,
            prices: venue as Arc<dyn PriceSource>,
            agents,
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }
}

/// Result of an emergency stop.
#[derive(Debug, Clone)]
pub struct EmergencyStopReport {
    pub scope: StopScope,
    /// In-flight submissions finished before the cancel sweep.
    pub drained: bool,
    /// One entry per order the sweep tried to cancel.
    pub cancels: Vec<CancelOutcome>,
    pub stopped: Vec<StrategyId>,
}

impl EmergencyStopReport {
    pub fn failed_cancels(&self) -> impl Iterator<Item = &CancelOutcome> {
        self.cancels.iter().filter(|c| c.result.is_err())
    }
}

// ---------------------------------------------------------------------------
// Core (shared with background tasks)
// ---------------------------------------------------------------------------

struct Core {
    cfg: AppConfig,
    client: Arc<dyn ExchangeClient>,
    agents: Arc<AgentRegistry>,
    store: Arc<dyn StateStore>,
    kill: Arc<KillSwitch>,
    positions: Arc<PositionBook>,
    risk: Arc<RiskManager>,
    router: Arc<OrderRouter>,
    scheduler: Arc<Scheduler>,
    vaults: Arc<VaultLedger>,
}

impl Core {
    /// Rehydrate ledger, limits, books and orders. Returns the strategy
    /// records, which are resumed once the fill pump runs.
    async fn restore(&self, snapshot: EngineSnapshot) -> anyhow::Result<Vec<StrategyInstance>> {
        info!(
            "[engine] restoring snapshot from {}us: {} vaults, {} owners, {} orders, {} strategies",
            snapshot.saved_at_us,
            snapshot.vaults.len(),
            snapshot.positions.len(),
            snapshot.orders.len(),
            snapshot.strategies.len()
        );
        self.vaults.restore(snapshot.vaults);
        for limit in snapshot.risk_limits {
            let owner = limit.owner.clone();
            self.risk
                .set_limit(limit)
                .with_context(|| format!("invalid persisted risk limit for {owner}"))?;
        }
        self.positions.restore(snapshot.positions).await;
        let live = self.router.gateway().recover(snapshot.orders).await;
        info!("[engine] {live} orders still live after reconciliation");
        Ok(snapshot.strategies)
    }

    async fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at_us: now_us(),
            vaults: self.vaults.snapshot(),
            risk_limits: self.risk.limits(),
            positions: self.positions.snapshot().await,
            // Live orders plus the gateway's bounded terminal history.
            orders: self.router.gateway().all_orders(),
            strategies: self.scheduler.instances(),
        }
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.snapshot().await;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .context("snapshot task failed")?
    }

    /// Vault books trade on the ledger's capital plus accrued P&L.
    async fn sync_vault_equity(&self, vault: &str) {
        if let Some(equity) = self.vaults.trading_equity(vault) {
            self.positions.set_cash_equity(&Owner::vault(vault), equity).await;
        }
    }

    async fn refresh_accounts(&self) {
        for owner in self.agents.owners() {
            let state = match self.client.get_account_state(&owner).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("[engine] account refresh for {owner} failed: {e}");
                    continue;
                }
            };
            match owner.vault_id() {
                Some(vault) => {
                    if self.vaults.contains(vault) {
                        if let Err(e) = self.vaults.set_encumbered(vault, state.margin_used) {
                            warn!("[engine] {owner}: {e}");
                        }
                    }
                }
                None => self.positions.set_account_equity(&owner, state.equity).await,
            }
        }
        for vault in self.vaults.vault_ids() {
            self.sync_vault_equity(&vault).await;
        }
    }

    async fn on_market_event(&self, event: &MarketEvent) {
        let open = self.positions.mark_symbol(&event.symbol, event.price).await;
        for intent in self.risk.stop_loss_intents(&event.symbol, &open) {
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                let what = format!("{} {}", intent.owner, intent.symbol);
                if let Err(e) = router.place_stop_loss(intent).await {
                    warn!("[engine] stop-loss close for {what} failed: {e}");
                }
            });
        }
        self.scheduler.dispatch_tick(event);
    }

    async fn on_fill(&self, fill: Fill) {
        let owner = fill.owner.clone();
        let strategy = fill.strategy_id;
        let Some(realized) = self.scheduler.route_fill(fill).await else {
            return;
        };
        let Some(vault) = owner.vault_id() else {
            return;
        };
        if !self.vaults.contains(vault) {
            return;
        }
        if realized != 0.0 {
            if let Err(e) = self.vaults.accrue_pnl(vault, strategy, realized) {
                warn!("[engine] accrual for {vault} failed: {e}");
            }
        }
        self.sync_vault_equity(vault).await;
    }

    async fn housekeeping(&self) {
        self.refresh_accounts().await;
        for intent in self.router.reconcile_unknown().await {
            self.scheduler.order_failed(&intent);
        }
        let settled = self.vaults.settle_all();
        if !settled.is_empty() {
            let mut vaults: Vec<&str> = settled.iter().map(|t| t.vault_id.as_str()).collect();
            vaults.sort_unstable();
            vaults.dedup();
            for vault in vaults {
                self.sync_vault_equity(vault).await;
            }
        }
        if let Err(e) = self.persist().await {
            error!("[engine] snapshot failed: {e:#}");
        }
    }

    async fn distribute_accrued(&self) -> Vec<Distribution> {
        let done = self.vaults.distribute_all_accrued();
        for d in &done {
            self.sync_vault_equity(&d.vault_id).await;
        }
        done
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn event_loop(core: Arc<Core>, mut events: GatewayEventReceiver, mut shutdown: watch::Receiver<bool>) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        match event {
            GatewayEvent::Fill(fill) => core.on_fill(fill).await,
            GatewayEvent::OrderUpdate(order) => core.router.on_order_update(&order).await,
            GatewayEvent::Error { owner: Some(owner), message } => {
                warn!("[engine] gateway error for {owner}: {message}")
            }
            GatewayEvent::Error { owner: None, message } => warn!("[engine] gateway error: {message}"),
        }
    }
    debug!("[engine] event loop exited");
}

async fn dispatch_loop(
    core: Arc<Core>,
    mut ticks: mpsc::Receiver<MarketEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            ev = ticks.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        core.on_market_event(&event).await;
    }
    debug!("[engine] dispatcher exited");
}

/// Run `core`'s `job` every `period` until shutdown. The first run happens
/// one period after start.
fn spawn_periodic<F, Fut>(
    core: Arc<Core>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Core>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => job(Arc::clone(&core)).await,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    core: Arc<Core>,
    feed: tokio::sync::Mutex<MarketDataFeed>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Build every component, restore the last snapshot, start the
    /// background loops and the configured bootstrap strategies.
    pub async fn start(ctx: EngineContext) -> anyhow::Result<Self> {
        let EngineContext { cfg, client, prices, agents, store } = ctx;
        cfg.validate()?;
        info!(
            "[engine] starting on {}, default leverage {}x, housekeeping every {}ms",
            cfg.network, cfg.default_max_leverage, cfg.tick_interval_ms
        );

        let kill = Arc::new(KillSwitch::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(OrderGateway::new(
            Arc::clone(&client),
            ExchangeContext::new(cfg.network, Arc::clone(&agents)),
            Arc::clone(&kill),
            &cfg.gateway,
            events_tx,
        ));
        let positions = Arc::new(PositionBook::new());
        let risk = Arc::new(RiskManager::new(
            Arc::clone(&positions),
            cfg.risk.clone(),
            cfg.default_max_leverage,
        ));
        let router = Arc::new(OrderRouter::new(
            gateway,
            Arc::clone(&risk),
            Arc::clone(&positions),
            Arc::clone(&kill),
        ));
        let scheduler = Arc::new(Scheduler::new(
            cfg.scheduler.clone(),
            Arc::clone(&router),
            Arc::clone(&kill),
            Arc::clone(&agents),
        ));
        let vaults = Arc::new(VaultLedger::with_config(&cfg.vault));
        let core = Arc::new(Core {
            cfg,
            client,
            agents,
            store,
            kill,
            positions,
            risk,
            router,
            scheduler,
            vaults,
        });

        let store = Arc::clone(&core.store);
        let snapshot = tokio::task::spawn_blocking(move || store.load())
            .await
            .context("snapshot load task failed")?
            .context("failed to load engine snapshot")?;
        let strategies = match snapshot {
            Some(s) => core.restore(s).await?,
            None => Vec::new(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        tasks.push(
            core.router
                .gateway()
                .start_fill_pump(shutdown_rx.clone())
                .await
                .context("failed to subscribe to fills")?,
        );
        tasks.push(tokio::spawn(event_loop(Arc::clone(&core), events_rx, shutdown_rx.clone())));

        core.refresh_accounts().await;
        core.scheduler.restore(strategies).await;

        let mut feed_cfg = core.cfg.feed.clone();
        feed_cfg.symbols.extend(core.scheduler.symbols());
        let mut feed = MarketDataFeed::new(prices, feed_cfg);
        let (md_tx, md_rx) = mpsc::channel(core.cfg.feed.queue_capacity.max(1));
        feed.start(md_tx)?;
        tasks.push(tokio::spawn(dispatch_loop(Arc::clone(&core), md_rx, shutdown_rx.clone())));

        tasks.push(spawn_periodic(
            Arc::clone(&core),
            Duration::from_millis(core.cfg.tick_interval_ms),
            shutdown_rx.clone(),
            |core| async move { core.housekeeping().await },
        ));
        match core.cfg.vault.distribution_interval_ms {
            0 => info!("[engine] epoch distribution disabled"),
            ms => tasks.push(spawn_periodic(
                Arc::clone(&core),
                Duration::from_millis(ms),
                shutdown_rx,
                |core| async move {
                    core.distribute_accrued().await;
                },
            )),
        }

        let engine = Self {
            core,
            feed: tokio::sync::Mutex::new(feed),
            shutdown_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        };
        engine.bootstrap().await?;
        info!("[engine] started");
        Ok(engine)
    }

    async fn bootstrap(&self) -> anyhow::Result<()> {
        for (i, entry) in self.core.cfg.bootstrap.iter().enumerate() {
            let owner: Owner = entry
                .owner
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("bootstrap[{i}]: bad owner"))?;
            let params: StrategyParams = serde_json::from_value(entry.params.clone())
                .with_context(|| format!("bootstrap[{i}]: bad strategy params"))?;
            match self.start_strategy(owner, params).await {
                Ok(inst) => info!("[engine] bootstrap[{i}]: started {}", inst.id),
                Err(HxError::AlreadyRunning(what)) => {
                    info!("[engine] bootstrap[{i}]: {what} already running")
                }
                Err(e) => return Err(e).with_context(|| format!("bootstrap[{i}] failed")),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Strategies
    // -----------------------------------------------------------------------

    pub async fn start_strategy(&self, owner: Owner, params: StrategyParams) -> HxResult<StrategyInstance> {
        let inst = self.core.scheduler.start(owner, params)?;
        self.feed.lock().await.add_symbols(&inst.params.symbols());
        Ok(inst)
    }

    pub async fn stop_strategy(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        self.core.scheduler.stop(id).await
    }

    pub fn pause_strategy(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        self.core.scheduler.pause(id)
    }

    pub fn resume_strategy(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        self.core.scheduler.resume(id)
    }

    pub async fn restart_strategy(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        let inst = self.core.scheduler.restart(id).await?;
        self.feed.lock().await.add_symbols(&inst.params.symbols());
        Ok(inst)
    }

    pub fn get_strategy(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        self.core.scheduler.get(id)
    }

    pub fn list_strategies(&self, owner: Option<&Owner>) -> Vec<StrategyInstance> {
        self.core.scheduler.list(owner)
    }

    // -----------------------------------------------------------------------
    // Vaults
    // -----------------------------------------------------------------------

    pub async fn create_vault(&self, vault: &str, leader: &str, fee_rate: f64) -> HxResult<()> {
        self.core.vaults.create_vault(vault, leader, fee_rate)?;
        self.core.sync_vault_equity(vault).await;
        Ok(())
    }

    /// Returns the depositor's share after the deposit.
    pub async fn deposit(&self, vault: &str, depositor: &str, amount: f64) -> HxResult<f64> {
        let share = self.core.vaults.deposit(vault, depositor, amount)?;
        self.core.sync_vault_equity(vault).await;
        Ok(share)
    }

    pub fn request_withdrawal(&self, vault: &str, depositor: &str, amount: f64) -> HxResult<WithdrawalTicket> {
        self.core.vaults.request_withdrawal(vault, depositor, amount)
    }

    pub async fn settle_withdrawals(&self, vault: &str) -> HxResult<Vec<WithdrawalTicket>> {
        let settled = self.core.vaults.settle_withdrawals(vault)?;
        self.core.sync_vault_equity(vault).await;
        Ok(settled)
    }

    /// Distribute an explicit lump now.
    pub async fn distribute_profit(&self, vault: &str, amount: f64) -> HxResult<Distribution> {
        let d = self.core.vaults.distribute_profit(vault, amount)?;
        self.core.sync_vault_equity(vault).await;
        Ok(d)
    }

    /// Run one distribution epoch immediately.
    pub async fn distribute_accrued(&self) -> Vec<Distribution> {
        self.core.distribute_accrued().await
    }

    pub fn get_vault_summary(&self, vault: &str) -> HxResult<VaultSummary> {
        self.core.vaults.summary(vault)
    }

    // -----------------------------------------------------------------------
    // Risk
    // -----------------------------------------------------------------------

    pub fn set_risk_limit(&self, limit: RiskLimit) -> HxResult<()> {
        self.core.risk.set_limit(limit)
    }

    pub fn risk_limit(&self, owner: &Owner) -> RiskLimit {
        self.core.risk.limit_for(owner)
    }

    /// Halt `scope`, wait for its in-flight submissions, cancel its live
    /// orders and stop its instances. Trading stays halted until
    /// [`resume_trading`](Self::resume_trading).
    pub async fn emergency_stop(&self, scope: StopScope) -> EmergencyStopReport {
        warn!("[engine] emergency stop: {scope}");
        self.core.kill.halt(&scope);
        let gateway = self.core.router.gateway();
        let drained = gateway.wait_for_drain(&scope, gateway.drain_timeout()).await;
        if !drained {
            warn!("[engine] {scope}: in-flight submissions did not drain in time");
        }
        let cancels = self.core.router.cancel_all(&scope).await;
        let stopped = self.core.scheduler.stop_matching(&scope).await;
        let report = EmergencyStopReport { scope, drained, cancels, stopped };
        let failed = report.failed_cancels().count();
        if failed > 0 {
            error!(
                "[engine] emergency stop {}: {failed}/{} cancels failed",
                report.scope,
                report.cancels.len()
            );
        } else {
            info!(
                "[engine] emergency stop {}: {} orders cancelled, {} instances stopped",
                report.scope,
                report.cancels.len(),
                report.stopped.len()
            );
        }
        report
    }

    /// Lift a halt. Stopped instances stay stopped.
    pub fn resume_trading(&self, scope: &StopScope) {
        self.core.kill.resume(scope);
        info!("[engine] trading resumed for {scope}");
    }

    pub fn is_halted(&self, owner: &Owner) -> bool {
        self.core.kill.is_halted(owner)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub async fn get_positions(&self, owner: &Owner) -> Vec<Position> {
        self.core.positions.positions(owner).await
    }

    pub async fn get_equity(&self, owner: &Owner) -> f64 {
        self.core.positions.equity(owner).await
    }

    pub fn get_orders(&self, owner: &Owner) -> Vec<Order> {
        self.core.router.gateway().orders(owner)
    }

    pub fn get_open_orders(&self, owner: &Owner) -> Vec<Order> {
        self.core.router.gateway().open_orders(owner)
    }

    /// Latest price the dispatcher marked `symbol` at.
    pub fn mark_price(&self, symbol: &str) -> Option<f64> {
        self.core.positions.mark_price(symbol)
    }

    pub fn feed_symbols(&self) -> Vec<String> {
        self.feed.try_lock().map(|f| f.symbols()).unwrap_or_default()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.core.scheduler
    }

    pub fn router(&self) -> &OrderRouter {
        &self.core.router
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Pull account state from the exchange now.
    pub async fn refresh_accounts(&self) {
        self.core.refresh_accounts().await;
    }

    /// One housekeeping pass now: refresh, reconcile, settle, snapshot.
    pub async fn housekeeping(&self) {
        self.core.housekeeping().await;
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        self.core.snapshot().await
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        self.core.persist().await
    }

    /// Stop the feed and the background loops, save a final snapshot, then
    /// stop every instance. Resting orders are left on the exchange; they
    /// are reconciled on the next start.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("[engine] shutting down");
        self.shutdown_tx.send_replace(true);
        self.feed.lock().await.stop().await;
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[engine] background task ended abnormally: {e}");
            }
        }
        let saved = self.core.persist().await;
        self.core.scheduler.shutdown().await;
        saved?;
        info!("[engine] stopped");
        Ok(())
    }
}
