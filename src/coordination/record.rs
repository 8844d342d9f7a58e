//! Transfer records and the rules for mutating them

use crate::chain::Chain;
use crate::error::ValidationError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of a transfer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 4] = [
        TransferStatus::Initiated,
        TransferStatus::InProgress,
        TransferStatus::Completed,
        TransferStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Initiated => "initiated",
            TransferStatus::InProgress => "in-progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// Whether a write may move a record from `self` to `next`.
    ///
    /// Rewriting the current non-terminal status is allowed so that updates
    /// can be replayed.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Initiated, Initiated)
                | (Initiated, InProgress)
                | (Initiated, Failed)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown transfer status '{}'", s))
    }
}

/// Why a transfer ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Configuration,
    InvalidParameters,
    Network,
    InsufficientFunds,
    ContractReverted,
    Timeout,
    ReceiptUnavailable,
    Cancelled,
    Store,
}

impl FailureReason {
    const ALL: [FailureReason; 9] = [
        FailureReason::Configuration,
        FailureReason::InvalidParameters,
        FailureReason::Network,
        FailureReason::InsufficientFunds,
        FailureReason::ContractReverted,
        FailureReason::Timeout,
        FailureReason::ReceiptUnavailable,
        FailureReason::Cancelled,
        FailureReason::Store,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Configuration => "configuration",
            FailureReason::InvalidParameters => "invalid_parameters",
            FailureReason::Network => "network",
            FailureReason::InsufficientFunds => "insufficient_funds",
            FailureReason::ContractReverted => "contract_reverted",
            FailureReason::Timeout => "timeout",
            FailureReason::ReceiptUnavailable => "receipt_unavailable",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Store => "store",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| format!("unknown failure reason '{}'", s))
    }
}

/// A client's request to move an asset between chains
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub asset_id: String,
    pub source_chain: Chain,
    pub destination_chain: Chain,
    pub receiver: String,
}

impl TransferRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.asset_id.trim().is_empty() {
            return Err(ValidationError::MissingField("assetId"));
        }
        if self.receiver.trim().is_empty() {
            return Err(ValidationError::MissingField("receiver"));
        }
        if self.source_chain == self.destination_chain {
            return Err(ValidationError::SameChain {
                chain: self.source_chain,
            });
        }
        Ok(())
    }
}

/// The persisted state of one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub transfer_id: Uuid,
    pub asset_id: String,
    pub source_chain: Chain,
    pub destination_chain: Chain,
    pub receiver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Fresh `initiated` record for a validated request
    pub fn initiated(request: &TransferRequest, now: DateTime<Utc>) -> Self {
        Self {
            transfer_id: Uuid::new_v4(),
            asset_id: request.asset_id.trim().to_string(),
            source_chain: request.source_chain,
            destination_chain: request.destination_chain,
            receiver: request.receiver.trim().to_string(),
            sender: None,
            status: TransferStatus::Initiated,
            source_tx_hash: None,
            relay_message_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the field/status invariants of a record
    pub fn check_shape(&self) -> Result<(), &'static str> {
        if self.source_chain == self.destination_chain {
            return Err("source and destination chains are equal");
        }
        match self.status {
            TransferStatus::Initiated if self.source_tx_hash.is_some() => {
                Err("initiated record cannot carry a source tx hash")
            }
            TransferStatus::InProgress | TransferStatus::Completed
                if self.source_tx_hash.is_none() =>
            {
                Err("submitted record requires a source tx hash")
            }
            status if status != TransferStatus::Completed && self.relay_message_id.is_some() => {
                Err("relay message id is only recorded on completion")
            }
            status if status != TransferStatus::Failed && self.failure_reason.is_some() => {
                Err("failure reason is only recorded on failure")
            }
            _ => Ok(()),
        }
    }

    /// Merge an update into this record.
    ///
    /// Returns the record unchanged when a terminal record receives a replay
    /// of values it already holds.
    pub fn apply(
        &self,
        update: &TransferUpdate,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord, TransitionError> {
        let next_status = update.status.unwrap_or(self.status);
        let reject = |reason: &str| TransitionError {
            from: self.status,
            to: next_status,
            reason: reason.to_string(),
        };

        if self.status.is_terminal() {
            if update.is_replay_of(self) {
                return Ok(self.clone());
            }
            return Err(reject("record is already terminal"));
        }

        if !self.status.can_transition_to(next_status) {
            return Err(reject("status may not move backwards"));
        }

        // The hash arrives only with the write that records the submission
        if self.source_tx_hash.is_none()
            && update.source_tx_hash.is_some()
            && next_status != TransferStatus::InProgress
        {
            return Err(reject("source tx hash is only recorded on submission"));
        }

        let mut next = self.clone();
        next.status = next_status;
        set_once(&mut next.sender, &update.sender).map_err(|_| reject("sender is immutable"))?;
        set_once(&mut next.source_tx_hash, &update.source_tx_hash)
            .map_err(|_| reject("source tx hash is immutable"))?;
        set_once(&mut next.relay_message_id, &update.relay_message_id)
            .map_err(|_| reject("relay message id is immutable"))?;
        set_once(&mut next.failure_reason, &update.failure_reason)
            .map_err(|_| reject("failure reason is immutable"))?;
        next.updated_at = now;

        next.check_shape().map_err(reject)?;
        Ok(next)
    }
}

fn set_once<T: Clone + PartialEq>(slot: &mut Option<T>, value: &Option<T>) -> Result<(), ()> {
    match (slot.as_ref(), value) {
        (_, None) => Ok(()),
        (None, Some(v)) => {
            *slot = Some(v.clone());
            Ok(())
        }
        (Some(current), Some(v)) if current == v => Ok(()),
        (Some(_), Some(_)) => Err(()),
    }
}

/// Partial set of fields written by one orchestrator step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferUpdate {
    pub status: Option<TransferStatus>,
    pub sender: Option<String>,
    pub source_tx_hash: Option<String>,
    pub relay_message_id: Option<String>,
    pub failure_reason: Option<FailureReason>,
}

impl TransferUpdate {
    pub fn submitted(sender: impl Into<String>, source_tx_hash: impl Into<String>) -> Self {
        Self {
            status: Some(TransferStatus::InProgress),
            sender: Some(sender.into()),
            source_tx_hash: Some(source_tx_hash.into()),
            ..Default::default()
        }
    }

    pub fn completed(relay_message_id: Option<String>) -> Self {
        Self {
            status: Some(TransferStatus::Completed),
            relay_message_id,
            ..Default::default()
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            status: Some(TransferStatus::Failed),
            failure_reason: Some(reason),
            ..Default::default()
        }
    }

    fn is_replay_of(&self, record: &TransferRecord) -> bool {
        fn same<T: PartialEq>(given: &Option<T>, current: &Option<T>) -> bool {
            given.is_none() || given == current
        }

        self.status.map_or(true, |s| s == record.status)
            && same(&self.sender, &record.sender)
            && same(&self.source_tx_hash, &record.source_tx_hash)
            && same(&self.relay_message_id, &record.relay_message_id)
            && same(&self.failure_reason, &record.failure_reason)
    }
}

/// A write that would break the record lifecycle
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot move from {from} to {to}: {reason}")]
pub struct TransitionError {
    pub from: TransferStatus,
    pub to: TransferStatus,
    pub reason: String,
}
