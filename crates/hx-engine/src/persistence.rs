//! Durable engine state.
//!
//! The engine periodically writes an [`EngineSnapshot`] through a
//! [`StateStore`]: vault accounts, explicit risk limits, owner books, the
//! gateway's live orders plus its bounded terminal history, and the strategy
//! instance records. On startup the snapshot is restored and every
//! non-terminal order is reconciled against the exchange before trading
//! resumes; terminal orders come back as history only.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use hx_core::types::{Order, RiskLimit};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::positions::OwnerSnapshot;
use crate::scheduler::StrategyInstance;
use crate::vault::VaultAccount;

/// Bumped on incompatible layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at_us: u64,
    #[serde(default)]
    pub vaults: Vec<VaultAccount>,
    #[serde(default)]
    pub risk_limits: Vec<RiskLimit>,
    #[serde(default)]
    pub positions: Vec<OwnerSnapshot>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub strategies: Vec<StrategyInstance>,
}

/// Where snapshots live. Calls are short blocking I/O.
pub trait StateStore: Send + Sync {
    /// The last saved snapshot, `None` if nothing was saved yet.
    fn load(&self) -> anyhow::Result<Option<EngineSnapshot>>;

    fn save(&self, snapshot: &EngineSnapshot) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// Snapshot as one JSON file, replaced atomically (temp file + rename).
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> anyhow::Result<Option<EngineSnapshot>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("[store] no snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let snapshot: EngineSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot {}", self.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "snapshot {} has version {}, expected {SNAPSHOT_VERSION}",
                self.path.display(),
                snapshot.version
            );
        }
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &EngineSnapshot) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let tmp = self.temp_path();
        let json = serde_json::to_vec_pretty(snapshot).context("failed to encode snapshot")?;
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move snapshot into {}", self.path.display()))?;
        debug!("[store] saved snapshot to {}", self.path.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

/// Keeps the last snapshot in memory. Used when no `state_path` is set.
#[derive(Default)]
pub struct MemoryStore {
    last: Mutex<Option<EngineSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> anyhow::Result<Option<EngineSnapshot>> {
        Ok(self.last.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, snapshot: &EngineSnapshot) -> anyhow::Result<()> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }
}
