//! Chain module - supported ledgers and the ledger submission seam
//!
//! This module provides:
//! - The set of supported source/destination chains
//! - The `LedgerClient` capability consumed by the orchestrator
//! - An ethers-based EVM implementation with receipt polling

pub mod finality;
pub mod provider;

pub use finality::ConfirmationWatcher;
pub use provider::EvmLedgerClient;

use crate::coordination::TransferRecord;
use crate::error::LedgerResult;

use async_trait::async_trait;
use ethers::types::Log;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledgers a transfer can start from or land on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Chain {
    AvalancheFuji,
    ArbitrumSepolia,
    EthereumSepolia,
    BaseSepolia,
}

impl Chain {
    pub const ALL: [Chain; 4] = [
        Chain::AvalancheFuji,
        Chain::ArbitrumSepolia,
        Chain::EthereumSepolia,
        Chain::BaseSepolia,
    ];

    /// Name used in config tables and persisted rows
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::AvalancheFuji => "avalanche-fuji",
            Chain::ArbitrumSepolia => "arbitrum-sepolia",
            Chain::EthereumSepolia => "ethereum-sepolia",
            Chain::BaseSepolia => "base-sepolia",
        }
    }

    /// Key used for this chain in a `deployment.json` file
    pub fn deployment_key(&self) -> &'static str {
        match self {
            Chain::AvalancheFuji => "avalancheFuji",
            Chain::ArbitrumSepolia => "arbitrumSepolia",
            Chain::EthereumSepolia => "ethereumSepolia",
            Chain::BaseSepolia => "baseSepolia",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Chain::ALL
            .into_iter()
            .find(|chain| chain.as_str() == s)
            .ok_or_else(|| format!("unsupported chain '{}'", s))
    }
}

/// Parameters of one cross-chain send
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub source_chain: Chain,
    pub destination_chain: Chain,
    pub receiver: String,
    pub asset_id: String,
}

impl From<&TransferRecord> for SubmitRequest {
    fn from(record: &TransferRecord) -> Self {
        Self {
            source_chain: record.source_chain,
            destination_chain: record.destination_chain,
            receiver: record.receiver.clone(),
            asset_id: record.asset_id.clone(),
        }
    }
}

/// Returned as soon as the source ledger accepted the transaction
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionHandle {
    pub source_chain: Chain,
    pub tx_hash: String,
    pub sender: String,
}

/// Inclusion proof of a submitted transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub logs: Vec<Log>,
}

/// Capability that moves assets on a source ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fail fast when endpoint, credential, bridge address or relay selector is missing
    fn ensure_configured(&self, source: Chain, destination: Chain) -> LedgerResult<()>;

    /// Broadcast the cross-chain send
    async fn submit(&self, request: &SubmitRequest) -> LedgerResult<SubmissionHandle>;

    /// Wait until the submission is included on the source ledger
    async fn await_confirmation(&self, handle: &SubmissionHandle) -> LedgerResult<Receipt>;

    /// Best-effort decode of the relay message id
    fn extract_relay_message_id(&self, receipt: &Receipt) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_names_parse_back() {
        for chain in Chain::ALL {
            assert_eq!(chain.as_str().parse::<Chain>().unwrap(), chain);
        }
        assert!("solana".parse::<Chain>().is_err());
    }

    #[test]
    fn test_chain_serde_matches_config_names() {
        let json = serde_json::to_string(&Chain::AvalancheFuji).unwrap();
        assert_eq!(json, "\"avalanche-fuji\"");
    }
}
