//! Configuration management for bridge transfers
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Per-chain values that are missing are not fatal here: a transfer touching
//! such a chain fails with a configuration error and leaves a `failed` record.

use crate::chain::Chain;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreConfig,
    pub audit: AuditConfig,
    pub transfer: TransferConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub deployment: Option<DeploymentConfig>,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_max_receipt_errors")]
    pub max_receipt_errors: u32,
    /// Polls a node may report the transaction as unknown before giving up
    #[serde(default = "default_max_unknown_polls")]
    pub max_unknown_polls: u32,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

impl TransferConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub private_key: Option<String>,
}

impl WalletConfig {
    /// Signing key, if one was provided
    pub fn private_key(&self) -> Option<&str> {
        non_empty(self.private_key.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub bridge_address: String,
    /// Relay network selector; a string because selectors exceed TOML's i64 range
    #[serde(default)]
    pub relay_selector: String,
}

impl ChainConfig {
    pub fn rpc_url(&self) -> Option<&str> {
        non_empty(Some(&self.rpc_url))
    }

    pub fn bridge_address(&self) -> Option<&str> {
        non_empty(Some(&self.bridge_address))
    }

    pub fn relay_selector(&self) -> Option<&str> {
        non_empty(Some(&self.relay_selector))
    }
}

/// One chain entry of a `deployment.json` file
#[derive(Debug, Clone, Deserialize)]
struct DeploymentEntry {
    #[serde(rename = "bridgeContractAddress")]
    bridge_contract_address: Option<String>,
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_confirmation_blocks() -> u64 {
    1
}

fn default_max_receipt_errors() -> u32 {
    5
}

fn default_max_unknown_polls() -> u32 {
    150
}

fn default_gas_limit() -> u64 {
    1_000_000
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Settings {
    /// Load settings from an explicit path, `BRIDGE_TRANSFER_CONFIG`, or the default file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("BRIDGE_TRANSFER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let mut settings = Self::from_toml_str(&config_str)?;
        settings.apply_deployment_file()?;
        Ok(settings)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(input: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.transfer.confirmation_timeout_secs == 0 {
            anyhow::bail!("transfer.confirmation_timeout_secs must be greater than zero");
        }
        if self.transfer.poll_interval_ms == 0 {
            anyhow::bail!("transfer.poll_interval_ms must be greater than zero");
        }

        for (name, chain) in &self.chains {
            Chain::from_str(name).map_err(|e| anyhow::anyhow!("[chains.{}]: {}", name, e))?;

            if chain.rpc_url().is_none() {
                tracing::warn!("Chain {} has no RPC URL - transfers from it will fail", name);
            }
            if chain.relay_selector().is_none() {
                tracing::warn!("Chain {} has no relay selector - transfers to it will fail", name);
            }
        }

        if self.wallet.private_key().is_none() {
            tracing::warn!("No signing key configured - transfers will fail");
        }

        Ok(())
    }

    /// Fill bridge addresses missing from `[chains.*]` from the deployment file
    fn apply_deployment_file(&mut self) -> Result<()> {
        let Some(deployment) = &self.deployment else {
            return Ok(());
        };

        if !deployment.path.exists() {
            tracing::warn!(
                "Deployment file {:?} not found - using per-chain bridge addresses only",
                deployment.path
            );
            return Ok(());
        }

        let raw = std::fs::read_to_string(&deployment.path)
            .with_context(|| format!("Failed to read deployment file: {:?}", deployment.path))?;
        let entries: HashMap<String, DeploymentEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse deployment file: {:?}", deployment.path))?;

        for (name, chain) in self.chains.iter_mut() {
            if chain.bridge_address().is_some() {
                continue;
            }
            let Ok(parsed) = Chain::from_str(name) else {
                continue;
            };
            if let Some(address) = entries
                .get(parsed.deployment_key())
                .and_then(|e| e.bridge_contract_address.clone())
            {
                chain.bridge_address = address;
            }
        }

        Ok(())
    }

    /// Get chain config for a supported chain
    pub fn chain(&self, chain: Chain) -> Option<&ChainConfig> {
        self.chains.get(chain.as_str())
    }
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [store]
        path = "data/transfers.db"

        [audit]
        log_path = "logs/transfers.log"

        [transfer]
        confirmation_timeout_secs = 600
        poll_interval_ms = 2000

        [wallet]
        private_key = "${BRIDGE_TEST_UNSET_KEY}"

        [chains.avalanche-fuji]
        chain_id = 43113
        rpc_url = "https://fuji.example"
        relay_selector = "14767482510784806043"

        [chains.arbitrum-sepolia]
        chain_id = 421614
        relay_selector = "3478487238524512106"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("BRIDGE_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${BRIDGE_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_unset_vars_become_missing_values() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert!(settings.wallet.private_key().is_none());

        let fuji = settings.chain(Chain::AvalancheFuji).unwrap();
        assert_eq!(fuji.rpc_url(), Some("https://fuji.example"));
        assert_eq!(fuji.bridge_address(), None);
        assert_eq!(settings.transfer.gas_limit, 1_000_000);
        assert!(settings.transfer.max_unknown_polls > settings.transfer.max_receipt_errors);
        assert_eq!(settings.transfer.confirmation_timeout(), Duration::from_secs(600));

        let arbitrum = settings.chain(Chain::ArbitrumSepolia).unwrap();
        assert_eq!(arbitrum.rpc_url(), None);
        assert_eq!(arbitrum.relay_selector(), Some("3478487238524512106"));
    }

    #[test]
    fn test_unknown_chain_is_rejected() {
        let input = SAMPLE.replace("[chains.arbitrum-sepolia]", "[chains.moonbase]");
        assert!(Settings::from_toml_str(&input).is_err());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let input = SAMPLE.replace(
            "confirmation_timeout_secs = 600",
            "confirmation_timeout_secs = 0",
        );
        assert!(Settings::from_toml_str(&input).is_err());
    }

    #[test]
    fn test_deployment_file_fills_missing_bridge_addresses() {
        let mut deployment = tempfile::NamedTempFile::new().unwrap();
        write!(
            deployment,
            r#"{{
                "avalancheFuji": {{ "bridgeContractAddress": "0x1111111111111111111111111111111111111111" }},
                "arbitrumSepolia": {{ "bridgeContractAddress": "0x2222222222222222222222222222222222222222" }}
            }}"#
        )
        .unwrap();

        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        settings.chains.get_mut("arbitrum-sepolia").unwrap().bridge_address =
            "0x3333333333333333333333333333333333333333".to_string();
        settings.deployment = Some(DeploymentConfig {
            path: deployment.path().to_path_buf(),
        });
        settings.apply_deployment_file().unwrap();

        assert_eq!(
            settings.chain(Chain::AvalancheFuji).unwrap().bridge_address(),
            Some("0x1111111111111111111111111111111111111111")
        );
        assert_eq!(
            settings.chain(Chain::ArbitrumSepolia).unwrap().bridge_address(),
            Some("0x3333333333333333333333333333333333333333")
        );
    }

    #[test]
    fn test_bundled_default_config_parses() {
        let raw = include_str!("../config/default.toml");
        let settings = Settings::from_toml_str(raw).unwrap();
        for chain in Chain::ALL {
            let config = settings.chain(chain).unwrap();
            assert!(config.relay_selector().unwrap().parse::<u64>().is_ok());
        }
    }
}
