//! Identifiers: owners, strategy instances and exchange orders.

use serde::{Deserialize, Serialize};

/// Exchange-assigned order identifier.
pub type OrderId = u64;

/// Vault identifier.
pub type VaultId = String;

/// Depositor identifier inside a vault (usually a user id).
pub type DepositorId = String;

/// Who a strategy, position or order belongs to.
///
/// Every user trades through their own agent wallet; vaults trade pooled
/// capital through the vault leader's agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Owner {
    User(String),
    Vault(VaultId),
}

impl Owner {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn vault(id: impl Into<String>) -> Self {
        Self::Vault(id.into())
    }

    /// The vault id if this owner is a vault.
    pub fn vault_id(&self) -> Option<&str> {
        match self {
            Self::Vault(v) => Some(v),
            Self::User(_) => None,
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Vault(id) => write!(f, "vault:{id}"),
        }
    }
}

impl std::str::FromStr for Owner {
    type Err = String;

    /// Parses `user:<id>` or `vault:<id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(Self::User(id.to_string())),
            Some(("vault", id)) if !id.is_empty() => Ok(Self::Vault(id.to_string())),
            _ => Err(format!("invalid owner '{s}', expected user:<id> or vault:<id>")),
        }
    }
}

/// Scheduler-assigned strategy instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(pub u64);

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Target of an emergency stop / resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopScope {
    Owner(Owner),
    Global,
}

impl StopScope {
    pub fn matches(&self, owner: &Owner) -> bool {
        match self {
            Self::Global => true,
            Self::Owner(o) => o == owner,
        }
    }
}

impl std::fmt::Display for StopScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner(o) => write!(f, "{o}"),
            Self::Global => write!(f, "global"),
        }
    }
}
