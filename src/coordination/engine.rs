//! Transfer orchestrator driving one transfer through its lifecycle

use super::{FailureReason, TransferRecord, TransferRequest, TransferUpdate};
use crate::audit::AuditLog;
use crate::chain::{LedgerClient, SubmitRequest};
use crate::error::{LedgerError, StoreError, TransferError, TransferResult};
use crate::events::TransferEvent;
use crate::state::TransferStore;

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Runs transfers against a ledger, persisting every step
pub struct TransferOrchestrator {
    /// Durable record store
    store: Arc<TransferStore>,
    /// Source ledger access
    ledger: Arc<dyn LedgerClient>,
    /// Audit sink
    audit: Arc<AuditLog>,
    /// Deadline for inclusion of a submitted transaction
    confirmation_timeout: Duration,
}

impl TransferOrchestrator {
    pub fn new(
        store: Arc<TransferStore>,
        ledger: Arc<dyn LedgerClient>,
        audit: Arc<AuditLog>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            audit,
            confirmation_timeout,
        }
    }

    /// Run a transfer to a terminal state
    #[cfg(test)]
    pub async fn execute(&self, request: TransferRequest) -> TransferResult<TransferRecord> {
        self.execute_until(request, std::future::pending()).await
    }

    /// Run a transfer, aborting if `cancel` completes before the send was accepted
    pub async fn execute_until<C>(
        &self,
        request: TransferRequest,
        cancel: C,
    ) -> TransferResult<TransferRecord>
    where
        C: Future<Output = ()>,
    {
        if let Err(e) = request.validate() {
            self.audit
                .record(&TransferEvent::Rejected {
                    reason: e.to_string(),
                })
                .await;
            return Err(e.into());
        }

        let record = TransferRecord::initiated(&request, Utc::now());
        let transfer_id = record.transfer_id;
        if let Err(e) = self.store.create(&record).await {
            error!("Transfer {}: could not create record: {}", transfer_id, e);
            self.audit
                .record(&TransferEvent::NotRecorded {
                    transfer_id,
                    detail: e.to_string(),
                })
                .await;
            return Err(e.into());
        }
        self.audit
            .record(&TransferEvent::Initiated {
                transfer_id,
                asset_id: record.asset_id.clone(),
                source_chain: record.source_chain,
                destination_chain: record.destination_chain,
                receiver: record.receiver.clone(),
            })
            .await;

        // Set once the send may have reached the ledger
        let submitting = AtomicBool::new(false);
        let submit = async {
            self.ledger
                .ensure_configured(record.source_chain, record.destination_chain)?;
            submitting.store(true, Ordering::SeqCst);
            self.ledger.submit(&SubmitRequest::from(&record)).await
        };

        tokio::pin!(cancel);
        let handle = tokio::select! {
            biased;

            _ = &mut cancel => {
                let in_flight = submitting.load(Ordering::SeqCst);
                info!("Transfer {} cancelled (submit in flight: {})", transfer_id, in_flight);
                self.mark_failed(
                    transfer_id,
                    FailureReason::Cancelled,
                    "cancelled before the ledger accepted the send".to_string(),
                    in_flight,
                    None,
                )
                .await;
                return Err(TransferError::Cancelled { transfer_id });
            }

            result = submit => match result {
                Ok(handle) => handle,
                Err(e) => return self.abort(transfer_id, e, None).await,
            },
        };

        let submitted = TransferUpdate::submitted(&handle.sender, &handle.tx_hash);
        if let Err(e) = self.store.update(transfer_id, submitted).await {
            return self.abort_store(transfer_id, e, Some(&handle.tx_hash)).await;
        }
        self.audit
            .record(&TransferEvent::Submitted {
                transfer_id,
                sender: handle.sender.clone(),
                tx_hash: handle.tx_hash.clone(),
            })
            .await;

        debug!(
            "Transfer {}: waiting up to {:?} for {}",
            transfer_id, self.confirmation_timeout, handle.tx_hash
        );
        let confirmation = self.ledger.await_confirmation(&handle);
        let receipt = match timeout(self.confirmation_timeout, confirmation).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => return self.abort(transfer_id, e, Some(&handle.tx_hash)).await,
            Err(_) => {
                let e = LedgerError::Timeout {
                    tx_hash: handle.tx_hash.clone(),
                    waited: self.confirmation_timeout,
                };
                return self.abort(transfer_id, e, Some(&handle.tx_hash)).await;
            }
        };
        self.audit
            .record(&TransferEvent::Confirmed {
                transfer_id,
                tx_hash: handle.tx_hash.clone(),
                block_number: receipt.block_number,
            })
            .await;

        let relay_message_id = self.ledger.extract_relay_message_id(&receipt);
        if relay_message_id.is_none() {
            self.audit
                .record(&TransferEvent::RelayMessageMissing {
                    transfer_id,
                    tx_hash: handle.tx_hash.clone(),
                })
                .await;
        }

        let completed = match self
            .store
            .update(transfer_id, TransferUpdate::completed(relay_message_id))
            .await
        {
            Ok(record) => record,
            Err(e) => return self.abort_store(transfer_id, e, Some(&handle.tx_hash)).await,
        };
        self.audit
            .record(&TransferEvent::Completed {
                transfer_id,
                relay_message_id: completed.relay_message_id.clone(),
            })
            .await;

        Ok(completed)
    }

    /// Record a ledger failure and surface it
    async fn abort(
        &self,
        transfer_id: Uuid,
        e: LedgerError,
        tx_hash: Option<&str>,
    ) -> TransferResult<TransferRecord> {
        self.mark_failed(
            transfer_id,
            e.failure_reason(),
            e.to_string(),
            e.outcome_ambiguous(),
            tx_hash,
        )
        .await;
        Err(TransferError::Ledger {
            transfer_id,
            source: e,
        })
    }

    /// Record a store failure after the record exists and surface it
    async fn abort_store(
        &self,
        transfer_id: Uuid,
        e: StoreError,
        tx_hash: Option<&str>,
    ) -> TransferResult<TransferRecord> {
        error!("Transfer {}: store write failed: {}", transfer_id, e);
        self.mark_failed(
            transfer_id,
            FailureReason::Store,
            e.to_string(),
            tx_hash.is_some(),
            tx_hash,
        )
        .await;
        Err(e.into())
    }

    async fn mark_failed(
        &self,
        transfer_id: Uuid,
        reason: FailureReason,
        detail: String,
        outcome_ambiguous: bool,
        tx_hash: Option<&str>,
    ) {
        let source_tx_hash = match self
            .store
            .update(transfer_id, TransferUpdate::failed(reason))
            .await
        {
            Ok(record) => record.source_tx_hash,
            Err(e) => {
                error!("Transfer {}: could not persist failure: {}", transfer_id, e);
                tx_hash.map(str::to_string)
            }
        };

        self.audit
            .record(&TransferEvent::Failed {
                transfer_id,
                reason,
                detail,
                source_tx_hash,
                outcome_ambiguous,
            })
            .await;
    }
}
