//! Vault ledger: pooled capital, depositor shares, withdrawals and profit
//! distribution.
//!
//! Each depositor's claim is kept as an absolute holding; a share is the
//! holding divided by total capital, so shares always sum to one. Deposits
//! and settlements change one holding and therefore rescale everyone's share;
//! profit distribution grows every holding pro-rata and leaves shares
//! unchanged (apart from the leader's performance fee).
//!
//! # Distribution timing
//!
//! Realized P&L of vault-owned strategies accrues into an undistributed
//! bucket ([`VaultLedger::accrue_pnl`]) and is paid out pro-rata by the
//! shares in force at each epoch ([`VaultLedger::distribute_accrued`]).
//! [`VaultLedger::distribute_profit`] distributes an explicit lump at once.
//! Accrued P&L is also kept per strategy instance for attribution.
//!
//! # Admission
//!
//! Deposits below the vault's minimum are refused, and a leader may not
//! request a withdrawal that leaves them under the minimum share while other
//! depositors remain. Both limits are taken from [`VaultConfig`] when the
//! vault is created.
//!
//! # Performance
//!
//! A flow-neutral performance index starts at 1 and compounds with every
//! distribution relative to the capital it was paid on; unrealized accruals
//! are marked on top. Its peak and the largest fall from that peak are the
//! vault's high-water mark and max drawdown.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use hx_core::config::VaultConfig;
use hx_core::error::{HxError, HxResult};
use hx_core::time_util::now_us;
use hx_core::types::{DepositorId, StrategyId, VaultId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Holdings below this are treated as fully withdrawn.
const DUST: f64 = 1e-9;

/// Settled tickets kept per vault by [`VaultLedger::new`].
const SETTLED_HISTORY: usize = 256;

fn unit() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Pending,
    Settled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalTicket {
    pub ticket_id: u64,
    pub vault_id: VaultId,
    pub depositor: DepositorId,
    pub amount: f64,
    /// Amount actually paid; below `amount` only if losses shrank the
    /// depositor's holding after the request.
    pub paid: f64,
    pub status: TicketStatus,
    pub requested_us: u64,
    pub settled_us: Option<u64>,
}

/// Result of one distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub vault_id: VaultId,
    pub amount: f64,
    /// Performance fee credited to the leader.
    pub fee: f64,
    /// Pro-rata credit per depositor (excluding the fee).
    pub credited: BTreeMap<DepositorId, f64>,
}

/// Admission rules of one vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultLimits {
    pub min_deposit: f64,
    /// Fraction of capital the leader keeps while others are invested.
    pub leader_min_share: f64,
}

impl From<&VaultConfig> for VaultLimits {
    fn from(cfg: &VaultConfig) -> Self {
        Self { min_deposit: cfg.min_deposit, leader_min_share: cfg.leader_min_share }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultAccount {
    pub vault_id: VaultId,
    pub leader: DepositorId,
    /// Fraction of positive profit paid to the leader before the split.
    pub fee_rate: f64,
    holdings: BTreeMap<DepositorId, f64>,
    /// Capital locked as margin by open positions.
    pub encumbered: f64,
    /// Realized P&L not yet distributed.
    pub accrued_pnl: f64,
    /// Distributed P&L to date.
    pub realized_pnl: f64,
    pub fees_paid: f64,
    #[serde(default)]
    pub limits: VaultLimits,
    /// Realized P&L accrued per strategy instance, to date.
    #[serde(default)]
    pub strategy_pnl: BTreeMap<StrategyId, f64>,
    /// Performance index over distributed P&L.
    #[serde(default = "unit")]
    nav: f64,
    #[serde(default = "unit")]
    peak_nav: f64,
    #[serde(default)]
    pub max_drawdown: f64,
    /// Highest trading equity seen.
    #[serde(default)]
    pub peak_equity: f64,
    pending: VecDeque<WithdrawalTicket>,
    settled: VecDeque<WithdrawalTicket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositorBalance {
    pub depositor: DepositorId,
    pub share: f64,
    pub holding: f64,
    pub pending: f64,
    /// Holding minus own pending withdrawals.
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultSummary {
    pub vault_id: VaultId,
    pub leader: DepositorId,
    pub fee_rate: f64,
    pub total_capital: f64,
    pub encumbered: f64,
    pub unencumbered: f64,
    pub accrued_pnl: f64,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub min_deposit: f64,
    pub leader_min_share: f64,
    pub strategy_pnl: BTreeMap<StrategyId, f64>,
    /// Performance index including undistributed accruals.
    pub performance: f64,
    pub peak_equity: f64,
    /// Largest fall of the performance index from its peak, as a fraction.
    pub max_drawdown: f64,
    pub depositors: Vec<DepositorBalance>,
    pub pending: Vec<WithdrawalTicket>,
}

// ---------------------------------------------------------------------------
// VaultAccount
// ---------------------------------------------------------------------------

impl VaultAccount {
    pub fn new(vault_id: impl Into<VaultId>, leader: impl Into<DepositorId>, fee_rate: f64) -> Self {
        Self {
            vault_id: vault_id.into(),
            leader: leader.into(),
            fee_rate,
            holdings: BTreeMap::new(),
            encumbered: 0.0,
            accrued_pnl: 0.0,
            realized_pnl: 0.0,
            fees_paid: 0.0,
            limits: VaultLimits::default(),
            strategy_pnl: BTreeMap::new(),
            nav: 1.0,
            peak_nav: 1.0,
            max_drawdown: 0.0,
            peak_equity: 0.0,
            pending: VecDeque::new(),
            settled: VecDeque::new(),
        }
    }

    pub fn with_limits(mut self, limits: VaultLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn total_capital(&self) -> f64 {
        self.holdings.values().sum()
    }

    pub fn holding(&self, depositor: &str) -> f64 {
        self.holdings.get(depositor).copied().unwrap_or(0.0)
    }

    pub fn share(&self, depositor: &str) -> f64 {
        let total = self.total_capital();
        if total <= 0.0 { 0.0 } else { self.holding(depositor) / total }
    }

    pub fn shares(&self) -> BTreeMap<DepositorId, f64> {
        let total = self.total_capital();
        self.holdings
            .iter()
            .map(|(d, h)| (d.clone(), if total > 0.0 { h / total } else { 0.0 }))
            .collect()
    }

    pub fn pending_of(&self, depositor: &str) -> f64 {
        self.pending.iter().filter(|t| t.depositor == depositor).map(|t| t.amount).sum()
    }

    pub fn pending_total(&self) -> f64 {
        self.pending.iter().map(|t| t.amount).sum()
    }

    /// What the depositor may still request.
    pub fn entitled(&self, depositor: &str) -> f64 {
        self.holding(depositor) - self.pending_of(depositor)
    }

    pub fn unencumbered(&self) -> f64 {
        self.total_capital() - self.encumbered
    }

    pub fn pending_tickets(&self) -> impl Iterator<Item = &WithdrawalTicket> {
        self.pending.iter()
    }

    /// Most recent settled tickets, oldest first.
    pub fn settled_tickets(&self) -> impl Iterator<Item = &WithdrawalTicket> {
        self.settled.iter()
    }

    /// Capital plus undistributed accruals.
    pub fn trading_equity(&self) -> f64 {
        self.total_capital() + self.accrued_pnl
    }

    /// Performance index with undistributed accruals marked in.
    pub fn performance(&self) -> f64 {
        let total = self.total_capital();
        if total > 0.0 { self.nav * (1.0 + self.accrued_pnl / total) } else { self.nav }
    }

    fn mark_performance(&mut self) {
        self.peak_equity = self.peak_equity.max(self.trading_equity());
        let nav = self.performance();
        if nav > self.peak_nav {
            self.peak_nav = nav;
        } else if self.peak_nav > 0.0 {
            self.max_drawdown = self.max_drawdown.max(1.0 - nav / self.peak_nav);
        }
    }

    fn deposit(&mut self, depositor: &str, amount: f64) -> HxResult<f64> {
        if amount + DUST < self.limits.min_deposit {
            return Err(HxError::Validation(format!(
                "deposit {amount:.2} into {} is below the minimum {:.2}",
                self.vault_id, self.limits.min_deposit
            )));
        }
        *self.holdings.entry(depositor.to_string()).or_insert(0.0) += amount;
        self.peak_equity = self.peak_equity.max(self.trading_equity());
        Ok(self.share(depositor))
    }

    fn accrue(&mut self, strategy: Option<StrategyId>, amount: f64) {
        self.accrued_pnl += amount;
        if let Some(id) = strategy {
            *self.strategy_pnl.entry(id).or_insert(0.0) += amount;
        }
        self.mark_performance();
    }

    /// Refuse a leader withdrawal that leaves the leader under the minimum
    /// share while other depositors still have capital in.
    fn check_leader_share(&self, depositor: &str, amount: f64) -> HxResult<()> {
        let min = self.limits.leader_min_share;
        if depositor != self.leader || min <= 0.0 {
            return Ok(());
        }
        let leader_after = self.entitled(depositor) - amount;
        let others = (self.total_capital() - self.pending_total()) - self.entitled(depositor);
        if others <= DUST {
            return Ok(());
        }
        let share_after = leader_after.max(0.0) / (leader_after.max(0.0) + others);
        if share_after + DUST < min {
            return Err(HxError::Vault(format!(
                "leader {depositor} of {} would hold {:.2}% after withdrawing {amount:.2}, minimum is {:.2}%",
                self.vault_id,
                share_after * 100.0,
                min * 100.0
            )));
        }
        Ok(())
    }

    fn request_withdrawal(
        &mut self,
        depositor: &str,
        amount: f64,
        ticket_id: u64,
        now: u64,
    ) -> HxResult<WithdrawalTicket> {
        let entitled = self.entitled(depositor);
        if amount > entitled + DUST {
            return Err(HxError::Vault(format!(
                "{depositor} requested {amount:.2} from {} but is entitled to {entitled:.2}",
                self.vault_id
            )));
        }
        self.check_leader_share(depositor, amount)?;
        let ticket = WithdrawalTicket {
            ticket_id,
            vault_id: self.vault_id.clone(),
            depositor: depositor.to_string(),
            amount,
            paid: 0.0,
            status: TicketStatus::Pending,
            requested_us: now,
            settled_us: None,
        };
        self.pending.push_back(ticket.clone());
        Ok(ticket)
    }

    /// Settle pending tickets in request order while unencumbered capital
    /// covers the next one.
    fn settle(&mut self, now: u64, keep: usize) -> Vec<WithdrawalTicket> {
        let mut out = Vec::new();
        while let Some(front) = self.pending.front() {
            let pay = front.amount.min(self.holding(&front.depositor)).max(0.0);
            if pay > self.unencumbered() + DUST {
                break;
            }
            let Some(mut ticket) = self.pending.pop_front() else { break };
            if let Some(h) = self.holdings.get_mut(&ticket.depositor) {
                *h -= pay;
                if *h <= DUST {
                    self.holdings.remove(&ticket.depositor);
                }
            }
            if pay + DUST < ticket.amount {
                warn!(
                    "[vault] ticket {} of {} paid {pay:.2} of {:.2} after losses",
                    ticket.ticket_id, ticket.depositor, ticket.amount
                );
            }
            ticket.paid = pay;
            ticket.status = TicketStatus::Settled;
            ticket.settled_us = Some(now);
            self.settled.push_back(ticket.clone());
            while self.settled.len() > keep {
                self.settled.pop_front();
            }
            out.push(ticket);
        }
        out
    }

    fn distribute(&mut self, amount: f64) -> HxResult<Distribution> {
        let total = self.total_capital();
        if total <= 0.0 {
            return Err(HxError::Vault(format!("{} has no capital to distribute to", self.vault_id)));
        }
        if total + amount < 0.0 {
            return Err(HxError::Vault(format!(
                "{} loss {amount:.2} exceeds capital {total:.2}",
                self.vault_id
            )));
        }
        let fee = if amount > 0.0 { amount * self.fee_rate } else { 0.0 };
        let rest = amount - fee;
        let shares = self.shares();
        let mut credited = BTreeMap::new();
        for (depositor, share) in shares {
            let credit = share * rest;
            *self.holdings.entry(depositor.clone()).or_insert(0.0) += credit;
            credited.insert(depositor, credit);
        }
        if fee > 0.0 {
            *self.holdings.entry(self.leader.clone()).or_insert(0.0) += fee;
            self.fees_paid += fee;
        }
        self.realized_pnl += amount;
        self.nav *= 1.0 + amount / total;
        self.mark_performance();
        Ok(Distribution { vault_id: self.vault_id.clone(), amount, fee, credited })
    }

    pub fn summary(&self) -> VaultSummary {
        let total = self.total_capital();
        let depositors = self
            .holdings
            .iter()
            .map(|(d, h)| {
                let pending = self.pending_of(d);
                DepositorBalance {
                    depositor: d.clone(),
                    share: if total > 0.0 { h / total } else { 0.0 },
                    holding: *h,
                    pending,
                    balance: h - pending,
                }
            })
            .collect();
        VaultSummary {
            vault_id: self.vault_id.clone(),
            leader: self.leader.clone(),
            fee_rate: self.fee_rate,
            total_capital: total,
            encumbered: self.encumbered,
            unencumbered: total - self.encumbered,
            accrued_pnl: self.accrued_pnl,
            realized_pnl: self.realized_pnl,
            fees_paid: self.fees_paid,
            min_deposit: self.limits.min_deposit,
            leader_min_share: self.limits.leader_min_share,
            strategy_pnl: self.strategy_pnl.clone(),
            performance: self.performance(),
            peak_equity: self.peak_equity,
            max_drawdown: self.max_drawdown,
            depositors,
            pending: self.pending.iter().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// VaultLedger
// ---------------------------------------------------------------------------

pub struct VaultLedger {
    vaults: Mutex<BTreeMap<VaultId, VaultAccount>>,
    next_ticket: AtomicU64,
    /// Limits given to vaults created from now on.
    limits: VaultLimits,
    settled_history: usize,
}

fn positive(what: &str, amount: f64) -> HxResult<()> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(HxError::Validation(format!("{what} must be positive, got {amount}")))
    }
}

impl VaultLedger {
    /// A ledger without admission limits.
    pub fn new() -> Self {
        Self {
            vaults: Mutex::new(BTreeMap::new()),
            next_ticket: AtomicU64::new(1),
            limits: VaultLimits::default(),
            settled_history: SETTLED_HISTORY,
        }
    }

    pub fn with_config(cfg: &VaultConfig) -> Self {
        Self {
            limits: VaultLimits::from(cfg),
            settled_history: cfg.settled_history.max(1),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<VaultId, VaultAccount>> {
        self.vaults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_vault<T>(
        &self,
        vault: &str,
        f: impl FnOnce(&mut VaultAccount) -> HxResult<T>,
    ) -> HxResult<T> {
        let mut vaults = self.lock();
        let acct = vaults
            .get_mut(vault)
            .ok_or_else(|| HxError::NotFound(format!("vault {vault}")))?;
        f(acct)
    }

    pub fn create_vault(&self, vault: &str, leader: &str, fee_rate: f64) -> HxResult<()> {
        if !(0.0..1.0).contains(&fee_rate) {
            return Err(HxError::Validation(format!("fee_rate {fee_rate} not in [0, 1)")));
        }
        let mut vaults = self.lock();
        if vaults.contains_key(vault) {
            return Err(HxError::AlreadyRunning(format!("vault {vault}")));
        }
        vaults.insert(vault.to_string(), VaultAccount::new(vault, leader, fee_rate).with_limits(self.limits));
        info!("[vault] created {vault} (leader {leader}, fee {fee_rate})");
        Ok(())
    }

    pub fn contains(&self, vault: &str) -> bool {
        self.lock().contains_key(vault)
    }

    pub fn vault_ids(&self) -> Vec<VaultId> {
        self.lock().keys().cloned().collect()
    }

    /// Deposit into `vault`, creating it (led by the depositor, no fee) if
    /// it does not exist. Returns the depositor's new share.
    pub fn deposit(&self, vault: &str, depositor: &str, amount: f64) -> HxResult<f64> {
        positive("deposit", amount)?;
        let mut vaults = self.lock();
        let created = !vaults.contains_key(vault);
        let acct = vaults
            .entry(vault.to_string())
            .or_insert_with(|| VaultAccount::new(vault, depositor, 0.0).with_limits(self.limits));
        let share = match acct.deposit(depositor, amount) {
            Ok(share) => share,
            Err(e) => {
                if created {
                    vaults.remove(vault);
                }
                return Err(e);
            }
        };
        if created {
            info!("[vault] created {vault} on first deposit (leader {depositor})");
        }
        info!(
            "[vault] {vault}: {depositor} deposited {amount:.2}, share {share:.6}, total {:.2}",
            acct.total_capital()
        );
        Ok(share)
    }

    pub fn request_withdrawal(&self, vault: &str, depositor: &str, amount: f64) -> HxResult<WithdrawalTicket> {
        positive("withdrawal", amount)?;
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let ticket = self.with_vault(vault, |a| a.request_withdrawal(depositor, amount, id, now_us()))?;
        info!("[vault] {vault}: ticket {id} {depositor} withdraw {amount:.2} pending");
        Ok(ticket)
    }

    pub fn settle_withdrawals(&self, vault: &str) -> HxResult<Vec<WithdrawalTicket>> {
        let keep = self.settled_history;
        let settled = self.with_vault(vault, |a| Ok(a.settle(now_us(), keep)))?;
        for t in &settled {
            info!("[vault] {vault}: ticket {} settled, paid {:.2} to {}", t.ticket_id, t.paid, t.depositor);
        }
        Ok(settled)
    }

    /// Settle every vault; returns all tickets settled.
    pub fn settle_all(&self) -> Vec<WithdrawalTicket> {
        let ids = self.vault_ids();
        ids.iter().filter_map(|v| self.settle_withdrawals(v).ok()).flatten().collect()
    }

    /// Distribute `amount` now, pro-rata by current shares.
    pub fn distribute_profit(&self, vault: &str, amount: f64) -> HxResult<Distribution> {
        if !amount.is_finite() {
            return Err(HxError::Validation(format!("invalid profit {amount}")));
        }
        let d = self.with_vault(vault, |a| a.distribute(amount))?;
        info!("[vault] {vault}: distributed {amount:.2} (fee {:.2})", d.fee);
        Ok(d)
    }

    /// Add realized P&L of a vault-owned strategy to the undistributed bucket,
    /// attributed to `strategy` when known.
    pub fn accrue_pnl(&self, vault: &str, strategy: Option<StrategyId>, amount: f64) -> HxResult<()> {
        if !amount.is_finite() {
            return Err(HxError::Validation(format!("invalid accrual {amount}")));
        }
        self.with_vault(vault, |a| {
            a.accrue(strategy, amount);
            Ok(())
        })?;
        debug!("[vault] {vault}: accrued {amount:.4} from {strategy:?}");
        Ok(())
    }

    /// Distribute the accrued bucket. `None` if nothing was accrued.
    pub fn distribute_accrued(&self, vault: &str) -> HxResult<Option<Distribution>> {
        let d = self.with_vault(vault, |a| {
            if a.accrued_pnl.abs() <= DUST {
                return Ok(None);
            }
            let amount = a.accrued_pnl;
            let d = a.distribute(amount)?;
            a.accrued_pnl = 0.0;
            Ok(Some(d))
        })?;
        if let Some(d) = &d {
            info!("[vault] {vault}: epoch distribution {:.2} (fee {:.2})", d.amount, d.fee);
        }
        Ok(d)
    }

    /// One distribution epoch across every vault.
    pub fn distribute_all_accrued(&self) -> Vec<Distribution> {
        let mut out = Vec::new();
        for vault in self.vault_ids() {
            match self.distribute_accrued(&vault) {
                Ok(Some(d)) => out.push(d),
                Ok(None) => {}
                Err(e) => warn!("[vault] {vault}: epoch distribution failed: {e}"),
            }
        }
        out
    }

    pub fn set_encumbered(&self, vault: &str, amount: f64) -> HxResult<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(HxError::Validation(format!("invalid encumbered amount {amount}")));
        }
        self.with_vault(vault, |a| {
            a.encumbered = amount;
            Ok(())
        })
    }

    /// Capital backing the vault's trading: pooled capital plus accrued P&L.
    pub fn trading_equity(&self, vault: &str) -> Option<f64> {
        self.lock().get(vault).map(VaultAccount::trading_equity)
    }

    pub fn summary(&self, vault: &str) -> HxResult<VaultSummary> {
        self.with_vault(vault, |a| Ok(a.summary()))
    }

    pub fn account(&self, vault: &str) -> Option<VaultAccount> {
        self.lock().get(vault).cloned()
    }

    pub fn snapshot(&self) -> Vec<VaultAccount> {
        self.lock().values().cloned().collect()
    }

    pub fn restore(&self, accounts: Vec<VaultAccount>) {
        let mut vaults = self.lock();
        let mut max_ticket = 0;
        for a in accounts {
            let ids = a.pending.iter().chain(a.settled.iter()).map(|t| t.ticket_id);
            max_ticket = ids.fold(max_ticket, u64::max);
            vaults.insert(a.vault_id.clone(), a);
        }
        self.next_ticket.fetch_max(max_ticket + 1, Ordering::Relaxed);
        info!("[vault] restored {} vaults", vaults.len());
    }
}

impl Default for VaultLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn deposits_rescale_shares() {
        let l = VaultLedger::new();
        l.create_vault("v", "lead", 0.0).unwrap();
        assert!(close(l.deposit("v", "a", 100.0).unwrap(), 1.0));
        assert!(close(l.deposit("v", "b", 300.0).unwrap(), 0.75));
        let a = l.account("v").unwrap();
        assert!(close(a.share("a"), 0.25));
        assert!(close(a.total_capital(), 400.0));
    }

    #[test]
    fn pro_rata_profit() {
        let l = VaultLedger::new();
        l.create_vault("v", "lead", 0.0).unwrap();
        l.deposit("v", "a", 100.0).unwrap();
        l.deposit("v", "b", 300.0).unwrap();
        let d = l.distribute_profit("v", 40.0).unwrap();
        assert!(close(d.credited["a"], 10.0));
        assert!(close(d.credited["b"], 30.0));
        let a = l.account("v").unwrap();
        assert!(close(a.holding("a"), 110.0));
        assert!(close(a.share("a"), 0.25));
        assert!(close(a.realized_pnl, 40.0));
    }

    #[test]
    fn leader_fee_comes_first() {
        let l = VaultLedger::new();
        l.create_vault("v", "lead", 0.1).unwrap();
        l.deposit("v", "a", 100.0).unwrap();
        l.deposit("v", "b", 300.0).unwrap();
        let d = l.distribute_profit("v", 40.0).unwrap();
        assert!(close(d.fee, 4.0));
        assert!(close(d.credited["a"], 9.0));
        assert!(close(d.credited["b"], 27.0));
        assert!(close(l.account("v").unwrap().holding("lead"), 4.0));
        // Losses carry no fee.
        let d = l.distribute_profit("v", -44.0).unwrap();
        assert_eq!(d.fee, 0.0);
        assert!(close(l.account("v").unwrap().total_capital(), 396.0));
    }

    #[test]
    fn withdrawal_over_entitlement_rejected() {
        let l = VaultLedger::new();
        l.deposit("v", "a", 100.0).unwrap();
        l.request_withdrawal("v", "a", 60.0).unwrap();
        let err = l.request_withdrawal("v", "a", 50.0).unwrap_err();
        assert!(matches!(err, HxError::Vault(_)));
        l.request_withdrawal("v", "a", 40.0).unwrap();
        assert!(matches!(l.request_withdrawal("v", "b", 1.0), Err(HxError::Vault(_))));
        assert!(matches!(l.request_withdrawal("nope", "a", 1.0), Err(HxError::NotFound(_))));
        assert!(matches!(l.deposit("v", "a", -1.0), Err(HxError::Validation(_))));
    }

    #[test]
    fn settlement_is_fifo_and_bounded_by_unencumbered() {
        let l = VaultLedger::new();
        l.deposit("v", "a", 100.0).unwrap();
        l.deposit("v", "b", 100.0).unwrap();
        l.set_encumbered("v", 150.0).unwrap();
        let t1 = l.request_withdrawal("v", "a", 40.0).unwrap();
        let t2 = l.request_withdrawal("v", "b", 30.0).unwrap();

        // 50 unencumbered: t1 (40) settles, t2 (30) has to wait.
        let settled = l.settle_withdrawals("v").unwrap();
        assert_eq!(settled.iter().map(|t| t.ticket_id).collect::<Vec<_>>(), vec![t1.ticket_id]);
        let s = l.summary("v").unwrap();
        assert!(close(s.total_capital, 160.0));
        assert_eq!(s.pending.len(), 1);
        let balances: f64 = s.depositors.iter().map(|d| d.balance).sum();
        assert!(close(balances, s.total_capital - 30.0));

        l.set_encumbered("v", 0.0).unwrap();
        let settled = l.settle_withdrawals("v").unwrap();
        assert_eq!(settled[0].ticket_id, t2.ticket_id);
        let a = l.account("v").unwrap();
        assert!(close(a.holding("a"), 60.0));
        assert!(close(a.holding("b"), 70.0));
        let sum: f64 = a.shares().values().sum();
        assert!(close(sum, 1.0));
    }

    #[test]
    fn full_exit_removes_depositor() {
        let l = VaultLedger::new();
        l.deposit("v", "a", 50.0).unwrap();
        l.deposit("v", "b", 50.0).unwrap();
        l.request_withdrawal("v", "a", 50.0).unwrap();
        l.settle_withdrawals("v").unwrap();
        let a = l.account("v").unwrap();
        assert!(a.shares().get("a").is_none());
        assert!(close(a.share("b"), 1.0));
    }

    #[test]
    fn accrued_epochs_follow_share_changes() {
        let l = VaultLedger::new();
        l.deposit("v", "a", 100.0).unwrap();
        l.accrue_pnl("v", None, 20.0).unwrap();
        l.distribute_accrued("v").unwrap();
        l.deposit("v", "b", 120.0).unwrap();
        l.accrue_pnl("v", None, 20.0).unwrap();
        l.distribute_accrued("v").unwrap();
        assert!(l.distribute_accrued("v").unwrap().is_none());
        let a = l.account("v").unwrap();
        assert!(close(a.holding("a"), 130.0));
        assert!(close(a.holding("b"), 130.0));
        assert_eq!(a.accrued_pnl, 0.0);
    }

    #[test]
    fn restore_continues_ticket_ids() {
        let l = VaultLedger::new();
        l.deposit("v", "a", 10.0).unwrap();
        l.request_withdrawal("v", "a", 1.0).unwrap();
        let t = l.request_withdrawal("v", "a", 1.0).unwrap();
        let fresh = VaultLedger::new();
        fresh.restore(l.snapshot());
        let next = fresh.request_withdrawal("v", "a", 1.0).unwrap();
        assert!(next.ticket_id > t.ticket_id);
        assert_eq!(fresh.summary("v").unwrap().pending.len(), 3);
    }

    fn limited() -> VaultLedger {
        let cfg = VaultConfig { min_deposit: 50.0, leader_min_share: 0.05, settled_history: 2, ..Default::default() };
        VaultLedger::with_config(&cfg)
    }

    #[test]
    fn small_deposits_are_refused() {
        let l = limited();
        assert!(matches!(l.deposit("v", "lead", 10.0), Err(HxError::Validation(_))));
        assert!(!l.contains("v"), "a refused first deposit creates nothing");
        l.deposit("v", "lead", 50.0).unwrap();
        assert!(matches!(l.deposit("v", "a", 49.0), Err(HxError::Validation(_))));
        assert!(close(l.summary("v").unwrap().min_deposit, 50.0));
    }

    #[test]
    fn leader_keeps_minimum_share_while_others_are_in() {
        let l = limited();
        l.deposit("v", "lead", 100.0).unwrap();
        l.deposit("v", "a", 900.0).unwrap();
        // 100 -> 40 of 940 is 4.3%.
        assert!(matches!(l.request_withdrawal("v", "lead", 60.0), Err(HxError::Vault(_))));
        // 100 -> 50 of 950 is 5.3%.
        l.request_withdrawal("v", "lead", 50.0).unwrap();
        // Followers are not bound by it.
        l.request_withdrawal("v", "a", 900.0).unwrap();
        // With everyone else leaving the leader may exit fully.
        l.request_withdrawal("v", "lead", 50.0).unwrap();
    }

    #[test]
    fn strategy_pnl_is_attributed() {
        let l = VaultLedger::new();
        l.deposit("v", "a", 100.0).unwrap();
        l.accrue_pnl("v", Some(StrategyId(1)), 12.0).unwrap();
        l.accrue_pnl("v", Some(StrategyId(2)), -2.0).unwrap();
        l.accrue_pnl("v", Some(StrategyId(1)), 3.0).unwrap();
        l.accrue_pnl("v", None, 1.0).unwrap();
        l.distribute_accrued("v").unwrap();
        let s = l.summary("v").unwrap();
        assert!(close(s.strategy_pnl[&StrategyId(1)], 15.0));
        assert!(close(s.strategy_pnl[&StrategyId(2)], -2.0));
        assert!(close(s.realized_pnl, 14.0));
        assert!(matches!(l.accrue_pnl("v", None, f64::NAN), Err(HxError::Validation(_))));
    }

    #[test]
    fn drawdown_ignores_flows_and_tracks_losses() {
        let l = VaultLedger::new();
        l.deposit("v", "a", 100.0).unwrap();
        l.distribute_profit("v", 20.0).unwrap();
        // Index 1.2; a big withdrawal is not a drawdown.
        l.request_withdrawal("v", "a", 60.0).unwrap();
        l.settle_withdrawals("v").unwrap();
        assert_eq!(l.summary("v").unwrap().max_drawdown, 0.0);

        // Lose 30 of 60: index 1.2 -> 0.6.
        l.distribute_profit("v", -30.0).unwrap();
        let s = l.summary("v").unwrap();
        assert!(close(s.performance, 0.6));
        assert!(close(s.max_drawdown, 0.5));
        assert!(close(s.peak_equity, 120.0));

        // Recovery does not erase the worst drawdown.
        l.distribute_profit("v", 30.0).unwrap();
        assert!(close(l.summary("v").unwrap().max_drawdown, 0.5));
    }

    #[test]
    fn settled_tickets_are_trimmed() {
        let l = limited();
        l.deposit("v", "a", 100.0).unwrap();
        for _ in 0..3 {
            l.request_withdrawal("v", "a", 1.0).unwrap();
        }
        let t = l.request_withdrawal("v", "a", 1.0).unwrap();
        l.settle_withdrawals("v").unwrap();
        let a = l.account("v").unwrap();
        let kept: Vec<u64> = a.settled_tickets().map(|t| t.ticket_id).collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.last(), Some(&t.ticket_id));

        let fresh = VaultLedger::new();
        fresh.restore(l.snapshot());
        assert!(fresh.request_withdrawal("v", "a", 1.0).unwrap().ticket_id > t.ticket_id);
    }
}
