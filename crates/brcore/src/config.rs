use serde::{Deserialize, Serialize};

/// Explicit construction-time options, per §9's "module-wide state: none"
/// design note: every component that needs configuration receives it here,
/// never through ambient globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub network: Network,
    pub server: String,
    #[serde(default)]
    pub app_dir: Option<String>,
    pub ratchet_window: u32,
    pub outbox_backoff: BackoffConfig,
    pub keepalive_interval_ms: u64,
    pub paid_policy: PaidPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Simnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 250,
            cap_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaidPolicy {
    AutoAccept,
    Confirm,
    Reject,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            server: "127.0.0.1:443".to_string(),
            app_dir: None,
            ratchet_window: 1000,
            outbox_backoff: BackoffConfig::default(),
            keepalive_interval_ms: 30_000,
            paid_policy: PaidPolicy::Confirm,
        }
    }
}

use crate::vault::Vault;

const CONFIG_KEY: &str = "brcore.client_config";

pub fn load_config(vault: &Vault) -> anyhow::Result<ClientConfig> {
    if let Some(bytes) = vault.get(CONFIG_KEY)? {
        Ok(serde_json::from_slice(&bytes)?)
    } else {
        Ok(ClientConfig::default())
    }
}

pub fn save_config(vault: &mut Vault, config: &ClientConfig) -> anyhow::Result<()> {
    let data = serde_json::to_vec(config)?;
    vault.set(CONFIG_KEY, &data)?;
    Ok(())
}
