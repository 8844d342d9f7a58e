//! Transfer lifecycle events and relay log parsing
//!
//! `TransferEvent` is what the audit log mirrors for every state change.
//! `RelayLogParser` recovers the relay message id from the bridge's
//! `NFTSent` event in a confirmation receipt.

use crate::chain::Chain;
use crate::coordination::FailureReason;

use ethers::types::{Log, H256};
use uuid::Uuid;

/// Every step of a transfer that the audit log records
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Request failed validation; no record exists
    Rejected { reason: String },

    /// Record could not be created
    NotRecorded { transfer_id: Uuid, detail: String },

    /// Record created
    Initiated {
        transfer_id: Uuid,
        asset_id: String,
        source_chain: Chain,
        destination_chain: Chain,
        receiver: String,
    },

    /// Source ledger accepted the send
    Submitted {
        transfer_id: Uuid,
        sender: String,
        tx_hash: String,
    },

    /// Send included on the source ledger
    Confirmed {
        transfer_id: Uuid,
        tx_hash: String,
        block_number: Option<u64>,
    },

    /// Receipt carried no decodable relay message id
    RelayMessageMissing { transfer_id: Uuid, tx_hash: String },

    /// Terminal success
    Completed {
        transfer_id: Uuid,
        relay_message_id: Option<String>,
    },

    /// Terminal failure
    Failed {
        transfer_id: Uuid,
        reason: FailureReason,
        detail: String,
        source_tx_hash: Option<String>,
        outcome_ambiguous: bool,
    },
}

impl TransferEvent {
    /// Get event name for structured logs
    pub fn name(&self) -> &'static str {
        match self {
            TransferEvent::Rejected { .. } => "transfer_rejected",
            TransferEvent::NotRecorded { .. } => "transfer_not_recorded",
            TransferEvent::Initiated { .. } => "transfer_initiated",
            TransferEvent::Submitted { .. } => "transfer_submitted",
            TransferEvent::Confirmed { .. } => "transfer_confirmed",
            TransferEvent::RelayMessageMissing { .. } => "relay_message_missing",
            TransferEvent::Completed { .. } => "transfer_completed",
            TransferEvent::Failed { .. } => "transfer_failed",
        }
    }

    pub fn transfer_id(&self) -> Option<Uuid> {
        match self {
            TransferEvent::Rejected { .. } => None,
            TransferEvent::NotRecorded { transfer_id, .. }
            | TransferEvent::Initiated { transfer_id, .. }
            | TransferEvent::Submitted { transfer_id, .. }
            | TransferEvent::Confirmed { transfer_id, .. }
            | TransferEvent::RelayMessageMissing { transfer_id, .. }
            | TransferEvent::Completed { transfer_id, .. }
            | TransferEvent::Failed { transfer_id, .. } => Some(*transfer_id),
        }
    }

    /// Events that should be logged at warn level or above
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            TransferEvent::Rejected { .. }
                | TransferEvent::NotRecorded { .. }
                | TransferEvent::RelayMessageMissing { .. }
                | TransferEvent::Failed { .. }
        )
    }

    /// Human-readable audit line (without timestamp)
    pub fn message(&self) -> String {
        match self {
            TransferEvent::Rejected { reason } => {
                format!("Rejected transfer request: {}", reason)
            }
            TransferEvent::NotRecorded {
                transfer_id,
                detail,
            } => format!(
                "ERROR: Transfer {} could not be recorded: {}; nothing was sent to the ledger",
                transfer_id, detail
            ),
            TransferEvent::Initiated {
                transfer_id,
                asset_id,
                source_chain,
                destination_chain,
                receiver,
            } => format!(
                "Transfer {}: initiating transfer of asset {} from {} to {} for receiver {}",
                transfer_id, asset_id, source_chain, destination_chain, receiver
            ),
            TransferEvent::Submitted {
                transfer_id,
                sender,
                tx_hash,
            } => format!(
                "Transfer {}: transaction submitted by {}. Hash: {}",
                transfer_id, sender, tx_hash
            ),
            TransferEvent::Confirmed {
                transfer_id,
                tx_hash,
                block_number,
            } => match block_number {
                Some(block) => format!(
                    "Transfer {}: transaction {} confirmed in block {}",
                    transfer_id, tx_hash, block
                ),
                None => format!("Transfer {}: transaction {} confirmed", transfer_id, tx_hash),
            },
            TransferEvent::RelayMessageMissing {
                transfer_id,
                tx_hash,
            } => format!(
                "Transfer {}: could not find NFTSent event in receipt of {}; completing without relay message id",
                transfer_id, tx_hash
            ),
            TransferEvent::Completed {
                transfer_id,
                relay_message_id,
            } => format!(
                "Transfer {}: completed. MessageId: {}",
                transfer_id,
                relay_message_id.as_deref().unwrap_or("<none>")
            ),
            TransferEvent::Failed {
                transfer_id,
                reason,
                detail,
                source_tx_hash,
                outcome_ambiguous,
            } => {
                let tx = source_tx_hash
                    .as_deref()
                    .map(|h| format!(" (source tx {})", h))
                    .unwrap_or_default();
                let outcome = if *outcome_ambiguous {
                    "ledger outcome UNKNOWN - the transfer may still have happened on-chain"
                } else {
                    "ledger effect did not occur"
                };
                format!(
                    "ERROR: Transfer {} failed [{}]{}: {}; {}",
                    transfer_id, reason, tx, detail, outcome
                )
            }
        }
    }
}

/// Solidity signature of the bridge's send event
pub const NFT_SENT_SIGNATURE: &str = "NFTSent(bytes32,uint64,address,uint256)";

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref NFT_SENT: H256 = H256::from(crate::tx::keccak(super::NFT_SENT_SIGNATURE));
    }
}

/// Extracts relay metadata from bridge logs
pub struct RelayLogParser;

impl RelayLogParser {
    /// Message id of the first `NFTSent` log; the id is the first indexed topic
    pub fn message_id(logs: &[Log]) -> Option<String> {
        logs.iter()
            .find(|log| log.topics.first() == Some(&*topics::NFT_SENT))
            .and_then(|log| log.topics.get(1))
            .map(|id: &H256| format!("0x{}", hex::encode(id.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nft_sent_log(message_id: H256) -> Log {
        Log {
            topics: vec![*topics::NFT_SENT, message_id, H256::from_low_u64_be(3478487238524512106)],
            ..Default::default()
        }
    }

    #[test]
    fn test_message_id_from_nft_sent_log() {
        let id = H256::repeat_byte(0xab);
        let logs = vec![
            Log {
                topics: vec![H256::repeat_byte(0x01)],
                ..Default::default()
            },
            nft_sent_log(id),
        ];
        assert_eq!(
            RelayLogParser::message_id(&logs),
            Some(format!("0x{}", "ab".repeat(32)))
        );
    }

    #[test]
    fn test_missing_event_yields_none() {
        let logs = vec![Log {
            topics: vec![H256::repeat_byte(0x01), H256::repeat_byte(0x02)],
            ..Default::default()
        }];
        assert_eq!(RelayLogParser::message_id(&logs), None);
        assert_eq!(RelayLogParser::message_id(&[]), None);
    }

    #[test]
    fn test_failed_message_distinguishes_ambiguity() {
        let transfer_id = Uuid::new_v4();
        let ambiguous = TransferEvent::Failed {
            transfer_id,
            reason: FailureReason::Timeout,
            detail: "timed out".to_string(),
            source_tx_hash: Some("0xHASH".to_string()),
            outcome_ambiguous: true,
        };
        assert!(ambiguous.message().contains("UNKNOWN"));
        assert!(ambiguous.message().contains("0xHASH"));

        let definitive = TransferEvent::Failed {
            transfer_id,
            reason: FailureReason::InsufficientFunds,
            detail: "insufficient funds".to_string(),
            source_tx_hash: None,
            outcome_ambiguous: false,
        };
        assert!(definitive.message().contains("did not occur"));
        assert!(definitive.is_problem());
    }
}
