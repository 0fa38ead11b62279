use otx_core::TransactionNumber;
use thiserror::Error;

use crate::ledger::NumberPurpose;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A delivery is already in progress")]
    Busy,
    #[error("No transaction number available for {purpose}")]
    NumberExhausted { purpose: NumberPurpose },
    #[error("Transaction number {number} is not above the highest seen ({highest})")]
    Replay {
        number: TransactionNumber,
        highest: TransactionNumber,
    },
    #[error("Session is shutting down")]
    ShuttingDown,
    #[error("Persistence error: {0}")]
    Persistence(anyhow::Error),
}
