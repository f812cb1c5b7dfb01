pub mod deadlock;
pub mod lock_manager;
pub mod transaction;

pub use lock_manager::{LockManager, LockMode};
pub use transaction::{IsolationLevel, Transaction, TransactionState};

pub type TransactionId = u64;
pub const INVALID_TRANSACTION_ID: TransactionId = 0;

/// Catalog identity of a table.
pub type TableOid = u32;
