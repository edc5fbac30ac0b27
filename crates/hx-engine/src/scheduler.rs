//! Strategy scheduler: one actor task per strategy instance.
//!
//! # Message flow
//!
//! ```text
//! dispatcher ──push (drop-oldest)──► TickMailbox ─┐
//! event loop ──send (waits if full)──► fill mpsc ─┼─► actor ──► OrderRouter
//! operator   ──control (unbounded)──────────────-─┘
//! ```
//!
//! The actor handles one message at a time and awaits every order round trip
//! before taking the next, so a strategy's state is never mutated
//! re-entrantly. Control messages are served first, then fills, then ticks.
//! Fills reach paused instances; ticks do not.
//!
//! Fills are deduplicated on `fill_id` before they touch positions or the
//! strategy, so at-least-once delivery from the exchange is applied once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hx_core::config::SchedulerConfig;
use hx_core::dedup::FillDedup;
use hx_core::error::{HxError, HxResult};
use hx_core::kill_switch::KillSwitch;
use hx_core::time_util::now_us;
use hx_core::types::*;
use hx_td::AgentRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mailbox::TickMailbox;
use crate::router::OrderRouter;
use crate::strategy::{Action, StepResult, Strategy, StrategyParams};

/// How long `stop` waits for an actor to finish its current step.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Public record of a strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyInstance {
    pub id: StrategyId,
    pub owner: Owner,
    pub params: StrategyParams,
    pub status: StrategyStatus,
    /// Reason of the last fault, cleared on restart.
    #[serde(default)]
    pub last_error: Option<String>,
    pub started_us: u64,
    pub updated_us: u64,
}

impl StrategyInstance {
    pub fn kind(&self) -> StrategyKind {
        self.params.kind()
    }

    fn same_slot(&self, owner: &Owner, params: &StrategyParams) -> bool {
        &self.owner == owner
            && self.params.kind() == params.kind()
            && self.params.symbol() == params.symbol()
    }

    fn set_status(&mut self, status: StrategyStatus) {
        self.status = status;
        self.updated_us = now_us();
    }
}

#[derive(Debug)]
enum Control {
    Pause,
    Resume,
    /// An order of this instance turned out never to exist.
    OrderFailed(String),
    Stop,
}

struct Runtime {
    symbols: Vec<String>,
    ticks: Arc<TickMailbox>,
    fills: mpsc::Sender<Fill>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

struct Slot {
    info: Arc<Mutex<StrategyInstance>>,
    runtime: Option<Runtime>,
}

/// Scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub ticks_dispatched: AtomicU64,
    pub fills_routed: AtomicU64,
    pub duplicate_fills: AtomicU64,
    pub faults: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    router: Arc<OrderRouter>,
    kill: Arc<KillSwitch>,
    agents: Arc<AgentRegistry>,
    next_id: AtomicU64,
    slots: Mutex<BTreeMap<StrategyId, Slot>>,
    dedup: Mutex<FillDedup>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        router: Arc<OrderRouter>,
        kill: Arc<KillSwitch>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        let ttl_us = cfg.fill_dedup_ttl_secs.saturating_mul(1_000_000);
        let dedup = FillDedup::new(cfg.fill_dedup_capacity, ttl_us);
        Self {
            cfg,
            router,
            kill,
            agents,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(BTreeMap::new()),
            dedup: Mutex::new(dedup),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a new instance for `owner`.
    pub fn start(&self, owner: Owner, params: StrategyParams) -> HxResult<StrategyInstance> {
        let params = params.validated()?;
        self.check_startable(&owner, &params, None)?;

        let mut slots = lock(&self.slots);
        // Re-checked under the lock so two concurrent starts cannot both pass.
        if let Some(existing) = find_active(&slots, &owner, &params, None) {
            return Err(already_running(existing, &params));
        }
        let id = StrategyId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = now_us();
        let info = Arc::new(Mutex::new(StrategyInstance {
            id,
            owner,
            params,
            status: StrategyStatus::Running,
            last_error: None,
            started_us: now,
            updated_us: now,
        }));
        let runtime = self.spawn(Arc::clone(&info), false);
        let snapshot = lock(&info).clone();
        slots.insert(id, Slot { info, runtime: Some(runtime) });
        info!(
            "[scheduler] started {id} {} {} for {}",
            snapshot.kind(),
            snapshot.params.symbol(),
            snapshot.owner
        );
        Ok(snapshot)
    }

    /// Stop an instance and cancel its live orders.
    pub async fn stop(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        let snapshot = self.halt_instance(id).await?;
        let outcomes = self.router.cancel_strategy_orders(id).await;
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            warn!("[scheduler] stopped {id}: {failed}/{} cancels failed", outcomes.len());
        } else {
            info!("[scheduler] stopped {id}, {} orders cancelled", outcomes.len());
        }
        Ok(snapshot)
    }

    pub fn pause(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        self.transition(id, StrategyStatus::Running, StrategyStatus::Paused, Control::Pause)
    }

    pub fn resume(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        self.transition(id, StrategyStatus::Paused, StrategyStatus::Running, Control::Resume)
    }

    /// Run an instance again from fresh state with its stored parameters.
    /// Live orders of the previous run are cancelled first since the fresh
    /// state does not track them.
    pub async fn restart(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        let (owner, params) = {
            let info = self.info(id)?;
            let info = lock(&info);
            (info.owner.clone(), info.params.clone())
        };
        self.check_startable(&owner, &params, Some(id))?;
        self.halt_instance(id).await?;
        self.router.cancel_strategy_orders(id).await;

        let mut slots = lock(&self.slots);
        if let Some(existing) = find_active(&slots, &owner, &params, Some(id)) {
            return Err(already_running(existing, &params));
        }
        let slot = slots.get_mut(&id).ok_or_else(|| not_found(id))?;
        {
            let mut info = lock(&slot.info);
            info.last_error = None;
            info.started_us = now_us();
            info.set_status(StrategyStatus::Running);
        }
        slot.runtime = Some(self.spawn(Arc::clone(&slot.info), false));
        let snapshot = lock(&slot.info).clone();
        info!("[scheduler] restarted {id}");
        Ok(snapshot)
    }

    /// Stop every instance in `scope` without touching orders. Used by the
    /// emergency stop after its own cancel sweep.
    pub async fn stop_matching(&self, scope: &StopScope) -> Vec<StrategyId> {
        let ids: Vec<StrategyId> = {
            let slots = lock(&self.slots);
            slots
                .iter()
                .filter(|(_, s)| {
                    let info = lock(&s.info);
                    scope.matches(&info.owner) && info.status != StrategyStatus::Stopped
                })
                .map(|(id, _)| *id)
                .collect()
        };
        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            if self.halt_instance(id).await.is_ok() {
                stopped.push(id);
            }
        }
        info!("[scheduler] {scope}: {} instances stopped", stopped.len());
        stopped
    }

    /// Stop every instance. Orders are left to the caller.
    pub async fn shutdown(&self) {
        self.stop_matching(&StopScope::Global).await;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        let info = self.info(id)?;
        let snapshot = lock(&info).clone();
        Ok(snapshot)
    }

    /// Instances of `owner` (all owners if `None`), by id.
    pub fn list(&self, owner: Option<&Owner>) -> Vec<StrategyInstance> {
        let slots = lock(&self.slots);
        slots
            .values()
            .map(|s| lock(&s.info).clone())
            .filter(|i| owner.is_none_or(|o| &i.owner == o))
            .collect()
    }

    /// Every instance record, for persistence.
    pub fn instances(&self) -> Vec<StrategyInstance> {
        self.list(None)
    }

    /// Symbols needed by running or paused instances.
    pub fn symbols(&self) -> Vec<String> {
        let slots = lock(&self.slots);
        let mut out: Vec<String> = slots
            .values()
            .filter_map(|s| s.runtime.as_ref())
            .flat_map(|rt| rt.symbols.iter().cloned())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    // -----------------------------------------------------------------------
    // Message routing
    // -----------------------------------------------------------------------

    /// Queue a tick for every running instance that trades its symbol.
    /// Never waits. Returns the number of mailboxes it was pushed to.
    pub fn dispatch_tick(&self, event: &MarketEvent) -> usize {
        let slots = lock(&self.slots);
        let mut delivered = 0;
        for slot in slots.values() {
            let Some(rt) = slot.runtime.as_ref() else {
                continue;
            };
            if !rt.symbols.contains(&event.symbol) {
                continue;
            }
            if lock(&slot.info).status != StrategyStatus::Running {
                continue;
            }
            rt.ticks.push(event.clone());
            delivered += 1;
        }
        self.stats.ticks_dispatched.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Apply a fill once and deliver it to its instance. Returns the
    /// realized P&L, or `None` for a duplicate.
    ///
    /// When the instance's fill mailbox is full this waits for room: fills
    /// are never dropped.
    pub async fn route_fill(&self, fill: Fill) -> Option<f64> {
        let fresh = lock(&self.dedup).check_and_insert(&fill.fill_id, now_us());
        if !fresh {
            self.stats.duplicate_fills.fetch_add(1, Ordering::Relaxed);
            debug!("[scheduler] duplicate fill {} ignored", fill.fill_id);
            return None;
        }
        let realized = self.router.apply_fill(&fill).await;
        self.stats.fills_routed.fetch_add(1, Ordering::Relaxed);

        let tx = fill.strategy_id.and_then(|id| {
            let slots = lock(&self.slots);
            slots.get(&id).and_then(|s| s.runtime.as_ref()).map(|rt| rt.fills.clone())
        });
        if let Some(tx) = tx {
            let id = fill.strategy_id;
            if tx.send(fill).await.is_err() {
                debug!("[scheduler] {id:?} exited before its fill was delivered");
            }
        }
        Some(realized)
    }

    /// Tell the instance that placed `intent` that it never became an order.
    pub fn order_failed(&self, intent: &OrderIntent) {
        let Some(id) = intent.strategy_id else {
            return;
        };
        let slots = lock(&self.slots);
        if let Some(rt) = slots.get(&id).and_then(|s| s.runtime.as_ref()) {
            let _ = rt.control.send(Control::OrderFailed(intent.idempotency_key.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Load persisted instances. Running and paused ones are started again
    /// from fresh state after their leftover orders are cancelled.
    pub async fn restore(&self, instances: Vec<StrategyInstance>) -> usize {
        let max_id = instances.iter().map(|i| i.id.0).max().unwrap_or(0);
        self.next_id.fetch_max(max_id + 1, Ordering::Relaxed);

        let mut resumed = 0;
        for instance in instances {
            let id = instance.id;
            let status = instance.status;
            if status.is_active() {
                self.router.cancel_strategy_orders(id).await;
            }
            let info = Arc::new(Mutex::new(instance));
            let runtime = status
                .is_active()
                .then(|| self.spawn(Arc::clone(&info), status == StrategyStatus::Paused));
            if runtime.is_some() {
                resumed += 1;
            }
            lock(&self.slots).insert(id, Slot { info, runtime });
        }
        info!("[scheduler] restored instances, {resumed} resumed");
        resumed
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn info(&self, id: StrategyId) -> HxResult<Arc<Mutex<StrategyInstance>>> {
        let slots = lock(&self.slots);
        slots.get(&id).map(|s| Arc::clone(&s.info)).ok_or_else(|| not_found(id))
    }

    fn check_startable(
        &self,
        owner: &Owner,
        params: &StrategyParams,
        except: Option<StrategyId>,
    ) -> HxResult<()> {
        if let Some(scope) = self.kill.halted_scope(owner) {
            return Err(HxError::Halted(scope));
        }
        if !self.agents.contains(owner) {
            return Err(HxError::Agent(format!("no agent registered for {owner}")));
        }
        let slots = lock(&self.slots);
        match find_active(&slots, owner, params, except) {
            Some(existing) => Err(already_running(existing, params)),
            None => Ok(()),
        }
    }

    fn transition(
        &self,
        id: StrategyId,
        from: StrategyStatus,
        to: StrategyStatus,
        msg: Control,
    ) -> HxResult<StrategyInstance> {
        let slots = lock(&self.slots);
        let slot = slots.get(&id).ok_or_else(|| not_found(id))?;
        let mut info = lock(&slot.info);
        if info.status != from {
            return Err(HxError::Validation(format!("{id} is {:?}, expected {from:?}", info.status)));
        }
        if let Some(rt) = slot.runtime.as_ref() {
            let _ = rt.control.send(msg);
        }
        info.set_status(to);
        info!("[scheduler] {id} {from:?} -> {to:?}");
        Ok(info.clone())
    }

    /// End the instance's actor and mark it `Stopped`.
    async fn halt_instance(&self, id: StrategyId) -> HxResult<StrategyInstance> {
        let (info, runtime) = {
            let mut slots = lock(&self.slots);
            let slot = slots.get_mut(&id).ok_or_else(|| not_found(id))?;
            (Arc::clone(&slot.info), slot.runtime.take())
        };
        if let Some(rt) = runtime {
            let _ = rt.control.send(Control::Stop);
            drop(rt.fills);
            let mut task = rt.task;
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("[scheduler] {id} did not stop within {STOP_GRACE:?}, aborting");
                task.abort();
            }
        }
        let mut info = lock(&info);
        info.set_status(StrategyStatus::Stopped);
        Ok(info.clone())
    }

    fn spawn(&self, info: Arc<Mutex<StrategyInstance>>, paused: bool) -> Runtime {
        let (id, owner, params) = {
            let i = lock(&info);
            (i.id, i.owner.clone(), i.params.clone())
        };
        let ticks = Arc::new(TickMailbox::new(self.cfg.tick_mailbox_capacity));
        let (fills_tx, fills_rx) = mpsc::channel(self.cfg.fill_mailbox_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            id,
            owner,
            strategy: Strategy::new(&params),
            info,
            ticks: Arc::clone(&ticks),
            fills: fills_rx,
            control: control_rx,
            router: Arc::clone(&self.router),
            kill: Arc::clone(&self.kill),
            auto_cancel: self.cfg.auto_cancel_on_fault,
            stats: Arc::clone(&self.stats),
            paused,
        };
        Runtime {
            symbols: params.symbols(),
            ticks,
            fills: fills_tx,
            control: control_tx,
            task: tokio::spawn(actor.run()),
        }
    }
}

fn find_active(
    slots: &BTreeMap<StrategyId, Slot>,
    owner: &Owner,
    params: &StrategyParams,
    except: Option<StrategyId>,
) -> Option<StrategyId> {
    slots
        .iter()
        .filter(|(id, _)| Some(**id) != except)
        .find(|(_, s)| {
            let info = lock(&s.info);
            info.status.is_active() && info.same_slot(owner, params)
        })
        .map(|(id, _)| *id)
}

fn already_running(existing: StrategyId, params: &StrategyParams) -> HxError {
    HxError::AlreadyRunning(format!("{} {} as {existing}", params.kind(), params.symbol()))
}

fn not_found(id: StrategyId) -> HxError {
    HxError::NotFound(format!("strategy {id}"))
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    id: StrategyId,
    owner: Owner,
    strategy: Strategy,
    info: Arc<Mutex<StrategyInstance>>,
    ticks: Arc<TickMailbox>,
    fills: mpsc::Receiver<Fill>,
    control: mpsc::UnboundedReceiver<Control>,
    router: Arc<OrderRouter>,
    kill: Arc<KillSwitch>,
    auto_cancel: bool,
    stats: Arc<SchedulerStats>,
    paused: bool,
}

impl Actor {
    async fn run(mut self) {
        debug!("[scheduler] {} actor up", self.id);
        loop {
            let step = tokio::select! {
                biased;
                msg = self.control.recv() => match msg {
                    Some(Control::Pause) => {
                        self.paused = true;
                        continue;
                    }
                    Some(Control::Resume) => {
                        self.paused = false;
                        continue;
                    }
                    Some(Control::OrderFailed(key)) => {
                        self.strategy.on_order_failed(&key);
                        continue;
                    }
                    Some(Control::Stop) | None => break,
                },
                Some(fill) = self.fills.recv() => self.strategy.on_fill(&fill),
                _ = self.ticks.notified() => {
                    let Some(event) = self.ticks.try_pop() else {
                        continue;
                    };
                    if !self.ticks.is_empty() {
                        self.ticks.renotify();
                    }
                    if self.paused || self.kill.is_halted(&self.owner) {
                        continue;
                    }
                    self.strategy.on_tick(&event)
                }
            };
            if let Err(reason) = self.execute(step).await {
                self.fault(reason).await;
                break;
            }
        }
        debug!("[scheduler] {} actor down", self.id);
    }

    /// Send the step's actions in order, awaiting each round trip.
    async fn execute(&mut self, step: StepResult) -> Result<(), String> {
        for action in step? {
            match action {
                Action::Place(draft) => {
                    let key = draft.key.clone();
                    let intent = draft.into_intent(self.owner.clone(), self.id);
                    match self.router.place(intent).await {
                        Ok(order) => {
                            if order.status.is_terminal() && order.filled_size <= SIZE_EPS {
                                self.strategy.on_order_failed(&key);
                            }
                        }
                        Err(HxError::SubmissionUnknown { .. }) => {
                            warn!("[scheduler] {} order {key} outcome unknown, awaiting reconciliation", self.id);
                        }
                        Err(HxError::Halted(_)) => {
                            debug!("[scheduler] {} order {key} refused: halted", self.id);
                        }
                        Err(e) => {
                            warn!("[scheduler] {} order {key} not placed: {e}", self.id);
                            self.strategy.on_order_failed(&key);
                        }
                    }
                }
                Action::Cancel { key } => {
                    if let Err(e) = self.router.cancel_by_key(&key).await {
                        warn!("[scheduler] {} cancel {key} failed: {e}", self.id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn fault(&mut self, reason: String) {
        let err = HxError::StrategyFault { id: self.id, reason: reason.clone() };
        error!("[scheduler] {err}");
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        {
            let mut info = lock(&self.info);
            info.last_error = Some(reason);
            info.set_status(StrategyStatus::Faulted);
        }
        if self.auto_cancel {
            let outcomes = self.router.cancel_strategy_orders(self.id).await;
            info!("[scheduler] {} faulted, {} orders cancelled", self.id, outcomes.len());
        }
    }
}
