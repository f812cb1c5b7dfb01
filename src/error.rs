use thiserror::Error;

use crate::transaction::TransactionId;

pub type PlumeResult<T, E = PlumeError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum PlumeError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

/// Reasons the lock manager terminates a transaction. Each maps to one of
/// the precondition or unlock violations in the locking protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    TableUnlockedBeforeUnlockingRows,
    AttemptedUnlockButNoLockHeld,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under read-uncommitted"
            }
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "requested mode is not a valid upgrade",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock requested without a table lock",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked before unlocking its rows"
            }
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock target is not held",
        };
        write!(f, "{}", msg)
    }
}
