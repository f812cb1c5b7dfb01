use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::storage::page::RecordId;
use crate::transaction::lock_manager::LockMode;
use crate::transaction::{TableOid, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking state. All acquisitions happen while Growing; the
/// first release moves the transaction to Shrinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Default)]
struct LockSets {
    shared_table: HashSet<TableOid>,
    exclusive_table: HashSet<TableOid>,
    intention_shared_table: HashSet<TableOid>,
    intention_exclusive_table: HashSet<TableOid>,
    shared_intention_exclusive_table: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

/// Transaction handle. The owning thread drives it; the deadlock detector
/// only ever reads the id and flips the state to Aborted, so state and
/// lock sets sit behind their own mutexes.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            TransactionState::Committed | TransactionState::Aborted
        )
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_table.insert(oid),
            LockMode::Exclusive => sets.exclusive_table.insert(oid),
            LockMode::IntentionShared => sets.intention_shared_table.insert(oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_table.insert(oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_table.insert(oid)
            }
        };
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_table.remove(&oid),
            LockMode::Exclusive => sets.exclusive_table.remove(&oid),
            LockMode::IntentionShared => sets.intention_shared_table.remove(&oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_table.remove(&oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_table.remove(&oid)
            }
        };
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_rows.entry(oid).or_default().insert(rid),
            LockMode::Exclusive => sets.exclusive_rows.entry(oid).or_default().insert(rid),
            _ => unreachable!("intention locks never reach row lock sets"),
        };
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("intention locks never reach row lock sets"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    pub fn holds_table_lock(&self, oid: TableOid, mode: LockMode) -> bool {
        let sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_table.contains(&oid),
            LockMode::Exclusive => sets.exclusive_table.contains(&oid),
            LockMode::IntentionShared => sets.intention_shared_table.contains(&oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_table.contains(&oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_table.contains(&oid)
            }
        }
    }

    /// Whether any row of `oid` is still locked; tables cannot unlock
    /// before their rows.
    pub fn has_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows
            .get(&oid)
            .map(|rows| !rows.is_empty())
            .unwrap_or(false)
            || sets
                .exclusive_rows
                .get(&oid)
                .map(|rows| !rows.is_empty())
                .unwrap_or(false)
    }

    pub fn shared_table_locks(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().shared_table.clone()
    }

    pub fn exclusive_table_locks(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().exclusive_table.clone()
    }

    pub fn intention_shared_table_locks(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().intention_shared_table.clone()
    }

    pub fn intention_exclusive_table_locks(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().intention_exclusive_table.clone()
    }

    pub fn shared_intention_exclusive_table_locks(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().shared_intention_exclusive_table.clone()
    }

    pub fn shared_row_locks(&self) -> HashMap<TableOid, HashSet<RecordId>> {
        self.lock_sets.lock().shared_rows.clone()
    }

    pub fn exclusive_row_locks(&self) -> HashMap<TableOid, HashSet<RecordId>> {
        self.lock_sets.lock().exclusive_rows.clone()
    }

    /// Everything currently held, rows listed before tables so a cleanup
    /// pass can release in a legal order.
    pub fn held_locks(&self) -> (Vec<(LockMode, TableOid, RecordId)>, Vec<(LockMode, TableOid)>) {
        let sets = self.lock_sets.lock();
        let mut rows = Vec::new();
        for (oid, rids) in sets.shared_rows.iter() {
            for rid in rids {
                rows.push((LockMode::Shared, *oid, *rid));
            }
        }
        for (oid, rids) in sets.exclusive_rows.iter() {
            for rid in rids {
                rows.push((LockMode::Exclusive, *oid, *rid));
            }
        }
        let mut tables = Vec::new();
        for oid in sets.shared_table.iter() {
            tables.push((LockMode::Shared, *oid));
        }
        for oid in sets.exclusive_table.iter() {
            tables.push((LockMode::Exclusive, *oid));
        }
        for oid in sets.intention_shared_table.iter() {
            tables.push((LockMode::IntentionShared, *oid));
        }
        for oid in sets.intention_exclusive_table.iter() {
            tables.push((LockMode::IntentionExclusive, *oid));
        }
        for oid in sets.shared_intention_exclusive_table.iter() {
            tables.push((LockMode::SharedIntentionExclusive, *oid));
        }
        (rows, tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_state_transitions() {
        let txn = Transaction::new(7, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 7);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert!(!txn.is_terminal());

        txn.set_state(TransactionState::Shrinking);
        assert_eq!(txn.state(), TransactionState::Shrinking);

        txn.set_state(TransactionState::Aborted);
        assert!(txn.is_terminal());
    }

    #[test]
    fn test_transaction_lock_set_bookkeeping() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);

        txn.insert_table_lock(LockMode::IntentionExclusive, 3);
        assert!(txn.holds_table_lock(3, LockMode::IntentionExclusive));
        assert!(!txn.holds_table_lock(3, LockMode::Exclusive));

        let rid = RecordId::new(1, 1);
        txn.insert_row_lock(LockMode::Exclusive, 3, rid);
        assert!(txn.has_row_locks_on(3));
        assert!(!txn.has_row_locks_on(4));

        txn.remove_row_lock(LockMode::Exclusive, 3, rid);
        assert!(!txn.has_row_locks_on(3));

        txn.remove_table_lock(LockMode::IntentionExclusive, 3);
        assert!(!txn.holds_table_lock(3, LockMode::IntentionExclusive));
    }
}
