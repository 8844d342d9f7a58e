//! Transfer coordination
//!
//! The orchestrator:
//! 1. Validates a request and creates an `initiated` record
//! 2. Submits the send through a `LedgerClient`
//! 3. Waits for inclusion under a deadline
//! 4. Finishes the record as `completed` or `failed`, auditing every step

pub mod engine;
pub mod record;

pub use engine::TransferOrchestrator;
pub use record::{
    FailureReason, TransferRecord, TransferRequest, TransferStatus, TransferUpdate,
    TransitionError,
};
