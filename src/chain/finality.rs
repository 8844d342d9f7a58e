//! Receipt polling until a submitted transaction is included
//!
//! Inclusion is reported once the receipt is at least `confirmation_blocks`
//! deep. A node that repeatedly fails to answer, or that stops knowing the
//! transaction for a long stretch of polls, yields `ReceiptUnavailable`. The
//! overall deadline is owned by the caller.

use super::Chain;
use crate::error::{LedgerError, LedgerResult};

use ethers::prelude::*;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Polls one chain for the receipt of a transaction
pub struct ConfirmationWatcher {
    chain: Chain,
    provider: Provider<Http>,
    confirmation_blocks: u64,
    poll_interval: Duration,
    max_rpc_errors: u32,
    max_unknown_polls: u32,
}

impl ConfirmationWatcher {
    pub fn new(
        chain: Chain,
        provider: Provider<Http>,
        confirmation_blocks: u64,
        poll_interval: Duration,
        max_rpc_errors: u32,
        max_unknown_polls: u32,
    ) -> Self {
        Self {
            chain,
            provider,
            confirmation_blocks,
            poll_interval,
            max_rpc_errors,
            max_unknown_polls,
        }
    }

    /// Wait for the transaction to be included with enough confirmations
    pub async fn wait(&self, tx_hash: H256) -> LedgerResult<TransactionReceipt> {
        let mut budget = PollBudget::new(self.max_rpc_errors, self.max_unknown_polls);

        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    budget.answered();
                    budget.known();
                    if receipt.status == Some(U64::zero()) {
                        return Err(LedgerError::ContractReverted(format!(
                            "transaction {:?} reverted on {}",
                            tx_hash, self.chain
                        )));
                    }

                    match self.confirmations(&receipt).await {
                        Ok(confirmations) if confirmations >= self.confirmation_blocks => {
                            info!(
                                "Transaction {:?} included on {} ({} confirmations)",
                                tx_hash, self.chain, confirmations
                            );
                            return Ok(receipt);
                        }
                        Ok(confirmations) => {
                            debug!(
                                "Transaction {:?} has {} / {} confirmations on {}",
                                tx_hash, confirmations, self.confirmation_blocks, self.chain
                            );
                        }
                        Err(e) => {
                            budget.rpc_error();
                            warn!("Failed to read block height on {}: {}", self.chain, e);
                        }
                    }
                }
                Ok(None) => {
                    budget.answered();
                    match self.provider.get_transaction(tx_hash).await {
                        Ok(Some(_)) => {
                            budget.known();
                            debug!("Transaction {:?} pending on {}", tx_hash, self.chain);
                        }
                        Ok(None) => {
                            budget.unknown();
                            warn!(
                                "Transaction {:?} unknown to {} node ({}/{})",
                                tx_hash, self.chain, budget.unknown_polls, budget.max_unknown_polls
                            );
                        }
                        Err(e) => {
                            budget.rpc_error();
                            warn!("Failed to look up transaction on {}: {}", self.chain, e);
                        }
                    }
                }
                Err(e) => {
                    budget.rpc_error();
                    warn!(
                        "Failed to fetch receipt from {} ({}/{}): {}",
                        self.chain, budget.rpc_errors, budget.max_rpc_errors, e
                    );
                }
            }

            if let Some(reason) = budget.exhausted() {
                return Err(LedgerError::ReceiptUnavailable {
                    tx_hash: format!("{:?}", tx_hash),
                    message: format!("{} node: {}", self.chain, reason),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn confirmations(&self, receipt: &TransactionReceipt) -> Result<u64, ProviderError> {
        let Some(mined) = receipt.block_number else {
            return Ok(0);
        };
        if self.confirmation_blocks <= 1 {
            return Ok(1);
        }
        let head = self.provider.get_block_number().await?;
        Ok(confirmations_at(mined.as_u64(), head.as_u64()))
    }
}

/// Consecutive-miss counters of one wait
#[derive(Debug)]
struct PollBudget {
    rpc_errors: u32,
    unknown_polls: u32,
    max_rpc_errors: u32,
    max_unknown_polls: u32,
}

impl PollBudget {
    fn new(max_rpc_errors: u32, max_unknown_polls: u32) -> Self {
        Self {
            rpc_errors: 0,
            unknown_polls: 0,
            max_rpc_errors: max_rpc_errors.max(1),
            max_unknown_polls: max_unknown_polls.max(1),
        }
    }

    /// The node answered a receipt query
    fn answered(&mut self) {
        self.rpc_errors = 0;
    }

    /// The node still knows the transaction
    fn known(&mut self) {
        self.unknown_polls = 0;
    }

    fn unknown(&mut self) {
        self.unknown_polls += 1;
    }

    fn rpc_error(&mut self) {
        self.rpc_errors += 1;
    }

    fn exhausted(&self) -> Option<String> {
        if self.unknown_polls >= self.max_unknown_polls {
            Some(format!(
                "transaction unknown for {} consecutive polls",
                self.unknown_polls
            ))
        } else if self.rpc_errors >= self.max_rpc_errors {
            Some(format!("failed {} consecutive polls", self.rpc_errors))
        } else {
            None
        }
    }
}

/// Confirmations of a block at height `mined` when the chain head is `head`
fn confirmations_at(mined: u64, head: u64) -> u64 {
    if head < mined {
        0
    } else {
        head - mined + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmations_count_the_inclusion_block() {
        assert_eq!(confirmations_at(100, 100), 1);
        assert_eq!(confirmations_at(100, 111), 12);
        assert_eq!(confirmations_at(100, 99), 0);
    }

    #[test]
    fn test_briefly_unknown_transaction_is_tolerated() {
        let mut budget = PollBudget::new(5, 150);
        for _ in 0..10 {
            budget.answered();
            budget.unknown();
        }
        assert!(budget.exhausted().is_none());

        budget.known();
        assert_eq!(budget.unknown_polls, 0);

        for _ in 0..150 {
            budget.unknown();
        }
        assert!(budget.exhausted().unwrap().contains("unknown"));
    }

    #[test]
    fn test_consecutive_rpc_errors_exhaust_budget() {
        let mut budget = PollBudget::new(5, 150);
        for _ in 0..4 {
            budget.rpc_error();
        }
        assert!(budget.exhausted().is_none());
        budget.answered();
        for _ in 0..5 {
            budget.rpc_error();
        }
        assert!(budget.exhausted().unwrap().contains("5 consecutive"));
    }

    #[tokio::test]
    async fn test_unreachable_node_reports_receipt_unavailable() {
        let provider = Provider::<Http>::try_from("http://127.0.0.1:9").unwrap();
        let watcher = ConfirmationWatcher::new(
            Chain::AvalancheFuji,
            provider,
            1,
            Duration::from_millis(1),
            2,
            100,
        );

        let err = watcher.wait(H256::repeat_byte(0x11)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ReceiptUnavailable { .. }));
        assert!(err.outcome_ambiguous());
    }
}
