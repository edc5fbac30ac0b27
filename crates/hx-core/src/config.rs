//! Configuration parsing for the engine.
//!
//! Settings come from a single JSON file. Every section is optional and
//! falls back to the defaults below, so a minimal config is `{}`.
//!
//! # Example config
//!
//! ```json
//! {
//!   "network": "testnet",
//!   "default_max_leverage": 3.0,
//!   "tick_interval_ms": 500,
//!   "feed": { "symbols": ["BTC", "ETH"] },
//!   "agents": [{ "owner": "user:alice", "ed25519_key_path": "/keys/alice.pem" }],
//!   "bootstrap": [{ "owner": "user:alice",
//!                   "params": { "kind": "grid", "symbol": "BTC", "levels": 5,
//!                               "spacing_pct": 0.002, "size_per_level": 0.01 } }]
//! }
//! ```

use anyhow::Context;
use serde::Deserialize;

use crate::error::HxError;
use crate::types::Network;

/// Top-level application config.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Exchange network to trade on.
    #[serde(default)]
    pub network: Network,

    /// Max leverage applied to owners without an explicit risk limit.
    #[serde(default = "default_max_leverage")]
    pub default_max_leverage: f64,

    /// Housekeeping cadence: account refresh, reconciliation, withdrawal
    /// settlement.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default)]
    pub risk: RiskDefaults,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where the engine snapshot is persisted. `None` keeps state in memory.
    #[serde(default)]
    pub state_path: Option<String>,

    /// Agent wallets to register at startup.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Strategies started right after boot.
    #[serde(default)]
    pub bootstrap: Vec<BootstrapStrategy>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            default_max_leverage: default_max_leverage(),
            tick_interval_ms: default_tick_interval_ms(),
            risk: RiskDefaults::default(),
            gateway: GatewayConfig::default(),
            scheduler: SchedulerConfig::default(),
            feed: FeedConfig::default(),
            vault: VaultConfig::default(),
            logging: LoggingConfig::default(),
            state_path: None,
            agents: Vec::new(),
            bootstrap: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), HxError> {
        let bad = |msg: &str| Err(HxError::Config(msg.to_string()));
        if !(self.default_max_leverage.is_finite() && self.default_max_leverage > 0.0) {
            return bad("default_max_leverage must be a positive number");
        }
        if self.tick_interval_ms == 0 {
            return bad("tick_interval_ms must be > 0");
        }
        if self.gateway.max_attempts == 0 {
            return bad("gateway.max_attempts must be >= 1");
        }
        if self.gateway.idempotency_capacity == 0 || self.scheduler.fill_dedup_capacity == 0 {
            return bad("dedup capacities must be >= 1");
        }
        if self.gateway.order_history_capacity == 0 {
            return bad("gateway.order_history_capacity must be >= 1");
        }
        if self.scheduler.tick_mailbox_capacity == 0 || self.scheduler.fill_mailbox_capacity == 0 {
            return bad("mailbox capacities must be >= 1");
        }
        if self.risk.max_position_notional <= 0.0 || self.risk.max_daily_loss <= 0.0 {
            return bad("risk defaults must be positive");
        }
        if !(0.0..1.0).contains(&self.risk.stop_loss_threshold) {
            return bad("risk.stop_loss_threshold must be in [0, 1)");
        }
        if !(self.vault.min_deposit.is_finite() && self.vault.min_deposit >= 0.0) {
            return bad("vault.min_deposit must be >= 0");
        }
        if !(0.0..1.0).contains(&self.vault.leader_min_share) {
            return bad("vault.leader_min_share must be in [0, 1)");
        }
        Ok(())
    }
}

/// Limits applied to owners without an explicit [`RiskLimit`](crate::types::RiskLimit).
#[derive(Debug, Clone, Deserialize)]
pub struct RiskDefaults {
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: f64,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    /// 0 disables stop-loss.
    #[serde(default = "default_stop_loss_threshold")]
    pub stop_loss_threshold: f64,
}

impl Default for RiskDefaults {
    fn default() -> Self {
        Self {
            max_position_notional: default_max_position_notional(),
            max_daily_loss: default_max_daily_loss(),
            stop_loss_threshold: default_stop_loss_threshold(),
        }
    }
}

/// Order execution gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Retention window for idempotency keys.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,
    /// How long an emergency stop waits for in-flight submissions.
    #[serde(default = "default_inflight_drain_timeout_ms")]
    pub inflight_drain_timeout_ms: u64,
    /// Terminal orders kept for queries and snapshots; the oldest go first.
    #[serde(default = "default_order_history_capacity")]
    pub order_history_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            idempotency_capacity: default_idempotency_capacity(),
            inflight_drain_timeout_ms: default_inflight_drain_timeout_ms(),
            order_history_capacity: default_order_history_capacity(),
        }
    }
}

/// Strategy scheduler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Per-instance tick mailbox (drop-oldest when full).
    #[serde(default = "default_tick_mailbox_capacity")]
    pub tick_mailbox_capacity: usize,
    /// Per-instance fill mailbox (producer waits when full).
    #[serde(default = "default_fill_mailbox_capacity")]
    pub fill_mailbox_capacity: usize,
    #[serde(default = "default_fill_dedup_capacity")]
    pub fill_dedup_capacity: usize,
    #[serde(default = "default_fill_dedup_ttl_secs")]
    pub fill_dedup_ttl_secs: u64,
    /// Cancel a faulted instance's open orders automatically.
    #[serde(default)]
    pub auto_cancel_on_fault: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_mailbox_capacity: default_tick_mailbox_capacity(),
            fill_mailbox_capacity: default_fill_mailbox_capacity(),
            fill_dedup_capacity: default_fill_dedup_capacity(),
            fill_dedup_ttl_secs: default_fill_dedup_ttl_secs(),
            auto_cancel_on_fault: false,
        }
    }
}

/// Market data feed settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Symbols to subscribe. Symbols used by started strategies are added.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Ingest -> normalizer channel capacity.
    #[serde(default = "default_feed_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_max_reconnect_backoff_ms")]
    pub max_reconnect_backoff_ms: u64,
    /// CPU core for the normalizer thread.
    #[serde(default)]
    pub cpu_core: Option<i32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            queue_capacity: default_feed_queue_capacity(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            max_reconnect_backoff_ms: default_max_reconnect_backoff_ms(),
            cpu_core: None,
        }
    }
}

/// Vault ledger settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// Period of the accrued-P&L distribution epoch. 0 disables the timer;
    /// profits are then only distributed by explicit calls.
    #[serde(default = "default_distribution_interval_ms")]
    pub distribution_interval_ms: u64,
    /// Smallest accepted deposit, in quote units.
    #[serde(default = "default_min_deposit")]
    pub min_deposit: f64,
    /// Share of capital a leader must keep while other depositors remain.
    #[serde(default = "default_leader_min_share")]
    pub leader_min_share: f64,
    /// Settled withdrawal tickets kept per vault.
    #[serde(default = "default_settled_history")]
    pub settled_history: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            distribution_interval_ms: default_distribution_interval_ms(),
            min_deposit: default_min_deposit(),
            leader_min_share: default_leader_min_share(),
            settled_history: default_settled_history(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log file prefix.
    pub module_name: Option<String>,
    /// Directory for daily-rotating log files.
    pub log_dir: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

/// An agent wallet to register at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// `user:<id>` or `vault:<id>`.
    pub owner: String,
    /// PEM-encoded Ed25519 private key (PKCS#8).
    #[serde(default)]
    pub ed25519_key_path: Option<String>,
    /// Name of an environment variable holding an HMAC secret.
    #[serde(default)]
    pub hmac_secret_env: Option<String>,
}

/// A strategy to start at boot. `params` is the tagged strategy parameter
/// object understood by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapStrategy {
    pub owner: String,
    pub params: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Defaults (used by serde)
// ---------------------------------------------------------------------------

fn default_max_leverage() -> f64 {
    10.0
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_max_position_notional() -> f64 {
    50_000.0
}

fn default_max_daily_loss() -> f64 {
    1_000.0
}

fn default_stop_loss_threshold() -> f64 {
    0.10
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_idempotency_ttl_secs() -> u64 {
    3_600
}

fn default_idempotency_capacity() -> usize {
    100_000
}

fn default_inflight_drain_timeout_ms() -> u64 {
    2_000
}

fn default_order_history_capacity() -> usize {
    10_000
}

fn default_tick_mailbox_capacity() -> usize {
    256
}

fn default_fill_mailbox_capacity() -> usize {
    1_024
}

fn default_fill_dedup_capacity() -> usize {
    100_000
}

fn default_fill_dedup_ttl_secs() -> u64 {
    3_600
}

fn default_feed_queue_capacity() -> usize {
    8_192
}

fn default_reconnect_backoff_ms() -> u64 {
    100
}

fn default_max_reconnect_backoff_ms() -> u64 {
    30_000
}

fn default_distribution_interval_ms() -> u64 {
    3_600_000 // hourly epochs
}

fn default_min_deposit() -> f64 {
    50.0
}

fn default_leader_min_share() -> f64 {
    0.05
}

fn default_settled_history() -> usize {
    256
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&content).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.network, Network::Testnet);
        assert_eq!(cfg.default_max_leverage, 10.0);
        assert_eq!(cfg.gateway.max_attempts, 4);
        assert!(!cfg.scheduler.auto_cancel_on_fault);
        cfg.validate().unwrap();
    }

    #[test]
    fn top_level_fields_parse() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"network":"mainnet","default_max_leverage":3,"tick_interval_ms":250,
                "bootstrap":[{"owner":"user:a","params":{"kind":"staking"}}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.network, Network::Mainnet);
        assert_eq!(cfg.default_max_leverage, 3.0);
        assert_eq!(cfg.tick_interval_ms, 250);
        assert_eq!(cfg.bootstrap.len(), 1);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.default_max_leverage = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.tick_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.risk.stop_loss_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.vault.leader_min_share = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.gateway.order_history_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn vault_limits_default_and_parse() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.vault.min_deposit, 50.0);
        assert_eq!(cfg.vault.leader_min_share, 0.05);
        let cfg: AppConfig =
            serde_json::from_str(r#"{"vault":{"min_deposit":10,"leader_min_share":0.1}}"#).unwrap();
        assert_eq!(cfg.vault.min_deposit, 10.0);
        assert_eq!(cfg.vault.leader_min_share, 0.1);
        assert_eq!(cfg.vault.settled_history, 256);
    }
}
