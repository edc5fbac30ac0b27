mod common;

use common::{XorShift, config, eventually, publish_until_marked, start};
use hx_core::types::*;
use hx_engine::strategy::StakingParams;
use hx_engine::{StrategyParams, VaultLedger, VaultSummary};

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

fn share_sum(s: &VaultSummary) -> f64 {
    s.depositors.iter().map(|d| d.share).sum()
}

fn holding(s: &VaultSummary, depositor: &str) -> f64 {
    s.depositors.iter().find(|d| d.depositor == depositor).map_or(0.0, |d| d.holding)
}

#[test]
fn shares_sum_to_one_after_random_flows() {
    let mut rng = XorShift::new(0xfee_d00d);
    let ledger = VaultLedger::new();
    ledger.create_vault("pool", "lead", 0.1).unwrap();
    let names = ["a", "b", "c", "d", "e"];
    for step in 0..500 {
        let who = names[(rng.next_u64() % names.len() as u64) as usize];
        match rng.next_u64() % 4 {
            0 | 1 => {
                ledger.deposit("pool", who, rng.range(1.0, 500.0)).unwrap();
            }
            2 => {
                let entitled = ledger
                    .summary("pool")
                    .unwrap()
                    .depositors
                    .iter()
                    .find(|d| d.depositor == who)
                    .map_or(0.0, |d| d.balance);
                if entitled > 1.0 {
                    ledger.request_withdrawal("pool", who, rng.range(0.5, entitled)).unwrap();
                }
                ledger.settle_withdrawals("pool").unwrap();
            }
            _ => {
                let total = ledger.summary("pool").unwrap().total_capital;
                if total > 0.0 {
                    ledger.distribute_profit("pool", rng.range(-0.2, 0.3) * total).unwrap();
                }
            }
        }
        let s = ledger.summary("pool").unwrap();
        if s.total_capital > 0.0 {
            assert!(close(share_sum(&s), 1.0), "step {step}: shares sum to {}", share_sum(&s));
        }
    }
}

#[test]
fn profit_of_40_splits_10_30() {
    let ledger = VaultLedger::new();
    ledger.deposit("v", "A", 100.0).unwrap();
    ledger.deposit("v", "B", 300.0).unwrap();
    let d = ledger.distribute_profit("v", 40.0).unwrap();
    assert!(close(d.credited["A"], 10.0));
    assert!(close(d.credited["B"], 30.0));
    let s = ledger.summary("v").unwrap();
    assert!(close(holding(&s, "A"), 110.0));
    assert!(close(holding(&s, "B"), 330.0));
}

// ---------------------------------------------------------------------------
// Engine level: realized P&L of a vault strategy
// ---------------------------------------------------------------------------

/// The vault buys 1 BTC at 100 through a staking slice, then the price drops
/// to 90 and the stop-loss closes it: about -10 realized, plus taker fees.
async fn realize_vault_loss(rig: &common::Rig) -> StrategyId {
    let vault = Owner::vault("alpha");
    rig.engine.create_vault("alpha", "lead", 0.0).await.unwrap();
    rig.engine.deposit("alpha", "A", 100.0).await.unwrap();
    rig.engine.deposit("alpha", "B", 300.0).await.unwrap();
    let mut limit = rig.engine.risk_limit(&vault);
    limit.stop_loss_threshold = 0.05;
    rig.engine.set_risk_limit(limit).unwrap();

    publish_until_marked(rig, "BTC", 100.0).await;
    let params = StrategyParams::Staking(StakingParams {
        symbol: "BTC".into(),
        target_size: 1.0,
        slice_size: 1.0,
        max_entry_price: None,
        apr: 0.0,
    });
    let inst = rig.engine.start_strategy(vault.clone(), params).await.unwrap();
    let (e, v) = (&rig.engine, &vault);
    let bought = eventually(|| async move {
        rig.paper.push_price("BTC", 100.0);
        e.get_positions(v).await.iter().any(|p| close(p.net_size, 1.0))
    })
    .await;
    assert!(bought, "staking slice never filled");
    rig.engine.stop_strategy(inst.id).await.unwrap();

    let closed = eventually(|| async move {
        rig.paper.push_price("BTC", 90.0);
        e.get_positions(v).await.is_empty()
    })
    .await;
    assert!(closed, "stop-loss never closed the position");
    inst.id
}

#[tokio::test]
async fn epoch_timer_distributes_accrued_pnl() {
    let mut cfg = config();
    cfg.vault.distribution_interval_ms = 50;
    let rig = start(cfg, &[Owner::vault("alpha")]).await;
    realize_vault_loss(&rig).await;

    let e = &rig.engine;
    let distributed = eventually(|| async move {
        let s = e.get_vault_summary("alpha").unwrap();
        s.accrued_pnl.abs() < 1e-9 && s.realized_pnl < -10.0
    })
    .await;
    assert!(distributed, "epoch never paid out the loss");

    let s = rig.engine.get_vault_summary("alpha").unwrap();
    assert!(s.realized_pnl > -10.2, "realized {}", s.realized_pnl);
    assert!(close(s.total_capital, 400.0 + s.realized_pnl));
    // Pro-rata: shares unchanged.
    assert!(close(holding(&s, "A") / s.total_capital, 0.25));
    assert!(close(holding(&s, "B") / s.total_capital, 0.75));
    // The book trades on the ledger's capital.
    assert!(close(rig.engine.get_equity(&Owner::vault("alpha")).await, s.total_capital));
    rig.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn without_epochs_pnl_waits_for_explicit_distribution() {
    let rig = start(config(), &[Owner::vault("alpha")]).await;
    let staking = realize_vault_loss(&rig).await;

    let e = &rig.engine;
    let accrued = eventually(|| async move { e.get_vault_summary("alpha").unwrap().accrued_pnl < -10.0 }).await;
    assert!(accrued);
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let s = rig.engine.get_vault_summary("alpha").unwrap();
    assert!(close(s.total_capital, 400.0), "capital moved without a distribution");
    let accrued = s.accrued_pnl;
    // The entry fill is the strategy's; the stop-loss close is not.
    assert!(s.strategy_pnl.contains_key(&staking));
    assert!(s.strategy_pnl.values().sum::<f64>() > accrued);
    // Marked accruals count toward drawdown before any distribution.
    assert!(s.max_drawdown > 0.02, "drawdown {}", s.max_drawdown);
    assert!((400.0..401.0).contains(&s.peak_equity), "peak {}", s.peak_equity);

    // A lump goes out by current shares and leaves the bucket alone.
    let d = rig.engine.distribute_profit("alpha", 40.0).await.unwrap();
    assert!(close(d.credited["A"], 10.0) && close(d.credited["B"], 30.0));
    assert!(close(rig.engine.get_vault_summary("alpha").unwrap().accrued_pnl, accrued));

    // An explicit epoch drains it.
    let epochs = rig.engine.distribute_accrued().await;
    assert_eq!(epochs.len(), 1);
    assert!(close(epochs[0].amount, accrued));
    let s = rig.engine.get_vault_summary("alpha").unwrap();
    assert!(close(s.total_capital, 440.0 + accrued));
    assert!(close(share_sum(&s), 1.0));
    rig.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn withdrawals_settle_in_housekeeping() {
    let rig = start(config(), &[Owner::vault("alpha")]).await;
    rig.engine.deposit("alpha", "A", 100.0).await.unwrap();
    rig.engine.deposit("alpha", "B", 300.0).await.unwrap();
    assert!(rig.engine.request_withdrawal("alpha", "A", 150.0).is_err());
    // Default vault config: deposits under 50 are refused.
    assert!(rig.engine.deposit("alpha", "C", 10.0).await.is_err());
    let ticket = rig.engine.request_withdrawal("alpha", "A", 60.0).unwrap();

    let e = &rig.engine;
    let settled = eventually(|| async move { e.get_vault_summary("alpha").unwrap().pending.is_empty() }).await;
    assert!(settled, "ticket {} never settled", ticket.ticket_id);
    let s = rig.engine.get_vault_summary("alpha").unwrap();
    assert!(close(s.total_capital, 340.0));
    assert!(close(holding(&s, "A"), 40.0));
    assert!(close(rig.engine.get_equity(&Owner::vault("alpha")).await, 340.0));
    rig.engine.shutdown().await.unwrap();
}
