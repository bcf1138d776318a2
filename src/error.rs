use crate::transaction::{AbortReason, TransactionId};
use thiserror::Error;

pub type PlumeDBResult<T, E = PlumeDBError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum PlumeDBError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

impl PlumeDBError {
    /// The abort reason, if this error is a transaction abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            PlumeDBError::TransactionAbort { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
