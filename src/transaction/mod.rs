mod lock_manager;
mod transaction;

pub use lock_manager::{AbortReason, LockManager, LockMode};
pub use transaction::{
    IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
    INVALID_TRANSACTION_ID,
};
