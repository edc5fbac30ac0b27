//! Agent wallets and request signing.
//!
//! Every owner trades through a delegated agent key. An agent may place,
//! cancel and amend orders but can never move funds: withdrawal and transfer
//! actions are refused before anything is signed.
//!
//! Two key types are supported:
//!
//! 1. **Ed25519**: loaded from a PKCS#8 PEM file or a raw 32-byte seed. The
//!    signature is Base64-encoded; the agent id is the hex public key.
//! 2. **HMAC-SHA256**: a shared secret. The signature is lowercase hex; the
//!    agent id is derived from a SHA-256 digest of the secret.
//!
//! Private material never leaves this module: there is no accessor for it and
//! the `Debug` output is redacted.

use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use anyhow::Context;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use hmac::{Hmac, Mac};
use hx_core::config::AgentConfig;
use hx_core::error::{HxError, HxResult};
use hx_core::exchange::OrderRequest;
use hx_core::types::{Network, OrderPrice, Owner};
use sha2::{Digest, Sha256};
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

/// What an agent is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentScope {
    TradeOnly,
}

/// Actions an agent may be asked to sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    PlaceOrder,
    CancelOrder,
    ModifyOrder,
    Withdraw,
    Transfer,
}

impl AgentScope {
    pub fn permits(self, action: AgentAction) -> bool {
        match self {
            Self::TradeOnly => matches!(
                action,
                AgentAction::PlaceOrder | AgentAction::CancelOrder | AgentAction::ModifyOrder
            ),
        }
    }
}

enum AgentKey {
    Ed25519(SigningKey),
    Hmac(Vec<u8>),
}

/// A trade-only signing key bound to one owner.
pub struct AgentWallet {
    owner: Owner,
    key: AgentKey,
    public_key: String,
    scope: AgentScope,
}

impl AgentWallet {
    /// Load an Ed25519 agent from a PKCS#8 PEM string.
    pub fn from_ed25519_pem(owner: Owner, pem: &str) -> HxResult<Self> {
        use ed25519_dalek::pkcs8::DecodePrivateKey;

        let key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| HxError::Agent(format!("invalid Ed25519 PEM for {owner}: {e}")))?;
        Ok(Self::from_signing_key(owner, key))
    }

    pub fn from_ed25519_seed(owner: Owner, seed: &[u8; 32]) -> Self {
        Self::from_signing_key(owner, SigningKey::from_bytes(seed))
    }

    fn from_signing_key(owner: Owner, key: SigningKey) -> Self {
        let public_key = hex::encode(key.verifying_key().to_bytes());
        Self { owner, key: AgentKey::Ed25519(key), public_key, scope: AgentScope::TradeOnly }
    }

    pub fn from_hmac_secret(owner: Owner, secret: &[u8]) -> HxResult<Self> {
        if secret.is_empty() {
            return Err(HxError::Agent(format!("empty HMAC secret for {owner}")));
        }
        let digest = Sha256::digest(secret);
        let public_key = hex::encode(&digest[..20]);
        Ok(Self {
            owner,
            key: AgentKey::Hmac(secret.to_vec()),
            public_key,
            scope: AgentScope::TradeOnly,
        })
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Public identifier of the agent (hex).
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn scope(&self) -> AgentScope {
        self.scope
    }

    /// Sign `payload` for `action`. Fails for actions outside the scope.
    pub fn sign(&self, action: AgentAction, payload: &str) -> HxResult<String> {
        if !self.scope.permits(action) {
            return Err(HxError::Agent(format!(
                "agent for {} is trade-only, refusing {action:?}",
                self.owner
            )));
        }
        match &self.key {
            AgentKey::Ed25519(key) => {
                let sig = key.sign(payload.as_bytes());
                Ok(base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()))
            }
            AgentKey::Hmac(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret)
                    .map_err(|e| HxError::Agent(format!("hmac key: {e}")))?;
                mac.update(payload.as_bytes());
                Ok(hex::encode(mac.finalize().into_bytes()))
            }
        }
    }
}

impl std::fmt::Debug for AgentWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.key {
            AgentKey::Ed25519(_) => "ed25519",
            AgentKey::Hmac(_) => "hmac",
        };
        f.debug_struct("AgentWallet")
            .field("owner", &self.owner)
            .field("kind", &kind)
            .field("public_key", &self.public_key)
            .field("scope", &self.scope)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Canonical byte string signed for an order placement.
pub fn order_payload(req: &OrderRequest) -> String {
    let price = match req.price {
        OrderPrice::Limit(p) => format!("{p}"),
        OrderPrice::Market => "MKT".to_string(),
    };
    format!(
        "place|{}|{}|{}|{}|{}|{}|{}|{}",
        req.client_key, req.owner, req.symbol, req.side, req.size, price, req.post_only,
        req.reduce_only
    )
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Owner -> agent lookup shared by the gateway.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<AHashMap<Owner, Arc<AgentWallet>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from config entries. Key files and secret env vars are
    /// read here.
    pub fn from_config(entries: &[AgentConfig]) -> anyhow::Result<Self> {
        let registry = Self::new();
        for entry in entries {
            let owner: Owner = entry.owner.parse().map_err(anyhow::Error::msg)?;
            let wallet = if let Some(path) = &entry.ed25519_key_path {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read agent key {path}"))?;
                AgentWallet::from_ed25519_pem(owner, &pem)?
            } else if let Some(var) = &entry.hmac_secret_env {
                let secret = std::env::var(var)
                    .with_context(|| format!("agent secret env var {var} not set"))?;
                AgentWallet::from_hmac_secret(owner, secret.as_bytes())?
            } else {
                anyhow::bail!("agent {} has neither ed25519_key_path nor hmac_secret_env", entry.owner);
            };
            registry.register(wallet);
        }
        Ok(registry)
    }

    /// Register (or replace) the agent of its owner.
    pub fn register(&self, wallet: AgentWallet) -> Arc<AgentWallet> {
        let wallet = Arc::new(wallet);
        info!("[agent] registered {} agent {}", wallet.owner, wallet.public_key);
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.insert(wallet.owner.clone(), Arc::clone(&wallet));
        wallet
    }

    pub fn get(&self, owner: &Owner) -> HxResult<Arc<AgentWallet>> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents
            .get(owner)
            .cloned()
            .ok_or_else(|| HxError::Agent(format!("no agent registered for {owner}")))
    }

    pub fn contains(&self, owner: &Owner) -> bool {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.contains_key(owner)
    }

    pub fn remove(&self, owner: &Owner) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.remove(owner).is_some()
    }

    pub fn owners(&self) -> Vec<Owner> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut owners: Vec<Owner> = agents.keys().cloned().collect();
        owners.sort();
        owners
    }

    /// Fill in `agent_key` and `signature` of a placement request.
    pub fn sign_order(&self, req: &mut OrderRequest) -> HxResult<()> {
        let agent = self.get(&req.owner)?;
        req.agent_key = agent.public_key().to_string();
        req.signature = agent.sign(AgentAction::PlaceOrder, &order_payload(req))?;
        Ok(())
    }
}

/// Everything the gateway needs to talk to one exchange network on behalf of
/// its owners.
#[derive(Clone)]
pub struct ExchangeContext {
    pub network: Network,
    pub agents: Arc<AgentRegistry>,
}

impl ExchangeContext {
    pub fn new(network: Network, agents: Arc<AgentRegistry>) -> Self {
        Self { network, agents }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};
    use hx_core::types::Side;

    fn request(owner: Owner) -> OrderRequest {
        OrderRequest {
            client_key: "k-1".into(),
            owner,
            symbol: "BTC".into(),
            side: Side::Buy,
            size: 0.5,
            price: OrderPrice::Limit(100.0),
            post_only: true,
            reduce_only: false,
            agent_key: String::new(),
            signature: String::new(),
        }
    }

    #[test]
    fn ed25519_signature_verifies() {
        let owner = Owner::user("alice");
        let wallet = AgentWallet::from_ed25519_seed(owner.clone(), &[7u8; 32]);
        let registry = AgentRegistry::new();
        registry.register(wallet);

        let mut req = request(owner);
        registry.sign_order(&mut req).unwrap();

        let vk = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        assert_eq!(req.agent_key, hex::encode(vk.to_bytes()));
        let raw = base64::engine::general_purpose::STANDARD.decode(&req.signature).unwrap();
        let sig = Signature::from_slice(&raw).unwrap();
        assert!(vk.verify(order_payload(&req).as_bytes(), &sig).is_ok());
    }

    #[test]
    fn pem_round_trip() {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;

        let key = SigningKey::from_bytes(&[3u8; 32]);
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let wallet = AgentWallet::from_ed25519_pem(Owner::vault("v"), &pem).unwrap();
        assert_eq!(wallet.public_key(), hex::encode(key.verifying_key().to_bytes()));
        assert!(AgentWallet::from_ed25519_pem(Owner::vault("v"), "not a pem").is_err());
    }

    #[test]
    fn hmac_signature_is_hex() {
        let wallet = AgentWallet::from_hmac_secret(Owner::user("bob"), b"secret").unwrap();
        let sig = wallet.sign(AgentAction::CancelOrder, "cancel|1").unwrap();
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, wallet.sign(AgentAction::CancelOrder, "cancel|1").unwrap());
        assert!(AgentWallet::from_hmac_secret(Owner::user("bob"), b"").is_err());
    }

    #[test]
    fn trade_only_scope_refuses_withdrawals() {
        let wallet = AgentWallet::from_ed25519_seed(Owner::user("carol"), &[1u8; 32]);
        assert_eq!(wallet.scope(), AgentScope::TradeOnly);
        assert!(matches!(wallet.sign(AgentAction::Withdraw, "w"), Err(HxError::Agent(_))));
        assert!(matches!(wallet.sign(AgentAction::Transfer, "t"), Err(HxError::Agent(_))));
        assert!(wallet.sign(AgentAction::ModifyOrder, "m").is_ok());
    }

    #[test]
    fn debug_output_is_redacted() {
        let wallet = AgentWallet::from_hmac_secret(Owner::user("dave"), b"hunter2").unwrap();
        let dbg = format!("{wallet:?}");
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn missing_agent_is_an_error() {
        let registry = AgentRegistry::new();
        let mut req = request(Owner::user("nobody"));
        assert!(matches!(registry.sign_order(&mut req), Err(HxError::Agent(_))));
    }
}
