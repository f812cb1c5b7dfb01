use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::LockManagerConfig;
use crate::error::{AbortReason, PlumeError, PlumeResult};
use crate::storage::page::RecordId;
use crate::transaction::deadlock::WaitsForGraph;
use crate::transaction::transaction::{IsolationLevel, Transaction, TransactionState};
use crate::transaction::{TableOid, TransactionId, INVALID_TRANSACTION_ID};

/// Lock strength. Intention modes announce finer-grained row locks and
/// are meaningful only on tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        )
    }

    /// The multi-granularity compatibility matrix. Symmetric.
    pub fn compatible(a: LockMode, b: LockMode) -> bool {
        match (a, b) {
            (LockMode::IntentionShared, other) | (other, LockMode::IntentionShared) => {
                other != LockMode::Exclusive
            }
            (LockMode::IntentionExclusive, LockMode::IntentionExclusive) => true,
            (LockMode::Shared, LockMode::Shared) => true,
            _ => false,
        }
    }

    /// Permitted upgrades: IS -> {S, X, IX, SIX}, S -> {X, SIX},
    /// IX -> {X, SIX}, SIX -> {X}. Everything else (downgrades included)
    /// is rejected.
    pub fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
        match held {
            LockMode::IntentionShared => matches!(
                requested,
                LockMode::Shared
                    | LockMode::Exclusive
                    | LockMode::IntentionExclusive
                    | LockMode::SharedIntentionExclusive
            ),
            LockMode::Shared | LockMode::IntentionExclusive => matches!(
                requested,
                LockMode::Exclusive | LockMode::SharedIntentionExclusive
            ),
            LockMode::SharedIntentionExclusive => matches!(requested, LockMode::Exclusive),
            LockMode::Exclusive => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub txn_id: TransactionId,
    pub mode: LockMode,
    pub oid: TableOid,
    pub rid: Option<RecordId>,
    pub granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// At most one transaction may be upgrading on an object at a time.
    upgrading: TransactionId,
}

/// One queue per lockable object. Granted and waiting requests share the
/// deque; waiters sleep on the condvar and are woken by releases, grants
/// of compatible modes, and the deadlock detector.
#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// Process-wide two-phase-locking manager: hierarchical table/row locks,
/// five modes, upgrade with queue-jump, FIFO-with-compatibility grants,
/// and a background deadlock detector that aborts the youngest member of
/// any wait-for cycle.
#[derive(Debug)]
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
    transactions: Mutex<HashMap<TransactionId, Weak<Transaction>>>,
    config: LockManagerConfig,
    detector_running: Arc<AtomicBool>,
    detector_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            config,
            detector_running: Arc::new(AtomicBool::new(false)),
            detector_thread: Mutex::new(None),
        }
    }

    /// Acquire a table-level lock. `Ok(true)` on grant, `Ok(false)` when
    /// the wait was broken by an abort (deadlock victim), `Err` when a
    /// precondition violation aborted the transaction.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> PlumeResult<bool> {
        self.register(txn);
        self.check_preconditions(txn, mode, None)?;

        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();

        if let Some(position) = state
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id())
        {
            let held_mode = state.requests[position].mode;
            if held_mode == mode {
                return Ok(true);
            }
            if state.upgrading != INVALID_TRANSACTION_ID {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !LockMode::can_upgrade(held_mode, mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }

            // Upgrade: release the held lock and re-queue just ahead of
            // the first waiter, so no window opens where nothing is held
            // and no later arrival can overtake the upgrade.
            state.requests.remove(position);
            txn.remove_table_lock(held_mode, oid);
            let insert_at = state
                .requests
                .iter()
                .position(|request| !request.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                insert_at,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    oid,
                    rid: None,
                    granted: false,
                },
            );
            state.upgrading = txn.id();
            return self.wait_for_grant(txn, &queue, state, mode, oid, None);
        }

        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            oid,
            rid: None,
            granted: false,
        });
        self.wait_for_grant(txn, &queue, state, mode, oid, None)
    }

    /// Release a table-level lock. Aborts the transaction if rows of the
    /// table are still locked or the lock is not held.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> PlumeResult<bool> {
        let queue = {
            let map = self.table_lock_map.lock();
            map.get(&oid).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        if txn.has_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mut state = queue.state.lock();
        let Some(position) = state
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id() && request.granted)
        else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = state.requests.remove(position).expect("position is valid");
        queue.cv.notify_all();
        drop(state);

        self.transition_on_unlock(txn, request.mode);
        txn.remove_table_lock(request.mode, oid);
        trace!("txn {} unlocked table {}", txn.id(), oid);
        Ok(true)
    }

    /// Acquire a row-level lock. Requires a suitable table-level lock to
    /// already be held.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> PlumeResult<bool> {
        self.register(txn);
        self.check_preconditions(txn, mode, Some(oid))?;

        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();

        if let Some(position) = state
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id())
        {
            let held_mode = state.requests[position].mode;
            if held_mode == mode {
                return Ok(true);
            }
            if state.upgrading != INVALID_TRANSACTION_ID {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !LockMode::can_upgrade(held_mode, mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }

            state.requests.remove(position);
            txn.remove_row_lock(held_mode, oid, rid);
            let insert_at = state
                .requests
                .iter()
                .position(|request| !request.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                insert_at,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    oid,
                    rid: Some(rid),
                    granted: false,
                },
            );
            state.upgrading = txn.id();
            return self.wait_for_grant(txn, &queue, state, mode, oid, Some(rid));
        }

        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            oid,
            rid: Some(rid),
            granted: false,
        });
        self.wait_for_grant(txn, &queue, state, mode, oid, Some(rid))
    }

    /// Release a row-level lock.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
    ) -> PlumeResult<bool> {
        let queue = {
            let map = self.row_lock_map.lock();
            map.get(&rid).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut state = queue.state.lock();
        let Some(position) = state
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id() && request.granted)
        else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = state.requests.remove(position).expect("position is valid");
        queue.cv.notify_all();
        drop(state);

        self.transition_on_unlock(txn, request.mode);
        txn.remove_row_lock(request.mode, oid, rid);
        trace!("txn {} unlocked row {} of table {}", txn.id(), rid, oid);
        Ok(true)
    }

    /// Force-release everything a terminal transaction still holds, rows
    /// before tables, with no 2PL state transitions. The rollback path's
    /// cleanup hook.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = txn.held_locks();
        for (mode, oid, rid) in rows {
            let queue = {
                let map = self.row_lock_map.lock();
                map.get(&rid).cloned()
            };
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                state
                    .requests
                    .retain(|request| request.txn_id != txn.id());
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TRANSACTION_ID;
                }
                queue.cv.notify_all();
            }
            txn.remove_row_lock(mode, oid, rid);
        }
        for (mode, oid) in tables {
            let queue = {
                let map = self.table_lock_map.lock();
                map.get(&oid).cloned()
            };
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                state
                    .requests
                    .retain(|request| request.txn_id != txn.id());
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TRANSACTION_ID;
                }
                queue.cv.notify_all();
            }
            txn.remove_table_lock(mode, oid);
        }
    }

    /// Spawns the background detector. Idempotent.
    pub fn start_deadlock_detection(self: &Arc<Self>) {
        let mut slot = self.detector_thread.lock();
        if slot.is_some() {
            return;
        }
        self.detector_running.store(true, Ordering::SeqCst);
        let manager = Arc::downgrade(self);
        let running = self.detector_running.clone();
        let interval = self.config.cycle_detection_interval;
        let handle = thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.detect_and_break();
                }
            })
            .expect("Failed to spawn deadlock detector thread");
        *slot = Some(handle);
    }

    pub fn stop_deadlock_detection(&self) {
        self.detector_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// One detection round: build the wait-for graph from every queue,
    /// then break cycles by aborting the youngest participant until no
    /// cycle remains. Returns the victims, oldest round first.
    pub fn detect_and_break(&self) -> Vec<TransactionId> {
        let mut graph = WaitsForGraph::default();
        let mut waiting_on: HashMap<TransactionId, Vec<Arc<LockRequestQueue>>> = HashMap::new();

        // Snapshot the queues with both map latches held, then release
        // them before walking queue contents.
        let queues: Vec<Arc<LockRequestQueue>> = {
            let table_map = self.table_lock_map.lock();
            let row_map = self.row_lock_map.lock();
            table_map
                .values()
                .cloned()
                .chain(row_map.values().cloned())
                .collect()
        };

        for queue in &queues {
            let state = queue.state.lock();
            let granted: Vec<TransactionId> = state
                .requests
                .iter()
                .filter(|request| request.granted)
                .map(|request| request.txn_id)
                .collect();
            for request in state.requests.iter().filter(|request| !request.granted) {
                waiting_on
                    .entry(request.txn_id)
                    .or_default()
                    .push(queue.clone());
                for &holder in &granted {
                    graph.add_edge(request.txn_id, holder);
                }
            }
        }

        let mut victims = Vec::new();
        while let Some(victim) = graph.find_victim() {
            warn!("deadlock detected, aborting youngest txn {}", victim);
            if let Some(txn) = self
                .transactions
                .lock()
                .get(&victim)
                .and_then(Weak::upgrade)
            {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove_txn(victim);
            // Wake the victim wherever it is blocked; it removes its own
            // request on the way out.
            if let Some(queues) = waiting_on.get(&victim) {
                for queue in queues {
                    let _state = queue.state.lock();
                    queue.cv.notify_all();
                }
            }
            victims.push(victim);
        }
        victims
    }

    fn register(&self, txn: &Arc<Transaction>) {
        self.transactions
            .lock()
            .insert(txn.id(), Arc::downgrade(txn));
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        map.entry(oid).or_default().clone()
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        map.entry(rid).or_default().clone()
    }

    /// Step-one checks: terminal state, row/intention sanity, and the
    /// per-isolation-level acquisition rules. `row_of_table` is the table
    /// whose row is being locked, `None` for table locks.
    fn check_preconditions(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        row_of_table: Option<TableOid>,
    ) -> PlumeResult<()> {
        if txn.is_terminal() {
            return Err(PlumeError::Internal(format!(
                "txn {} is already committed or aborted",
                txn.id()
            )));
        }

        if row_of_table.is_some() && mode.is_intention() {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }

        let state = txn.state();
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(
                    mode,
                    LockMode::Shared
                        | LockMode::IntentionShared
                        | LockMode::SharedIntentionExclusive
                ) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }

        if let Some(oid) = row_of_table {
            let table_ok = match mode {
                LockMode::Exclusive => {
                    txn.holds_table_lock(oid, LockMode::Exclusive)
                        || txn.holds_table_lock(oid, LockMode::IntentionExclusive)
                        || txn.holds_table_lock(oid, LockMode::SharedIntentionExclusive)
                }
                LockMode::Shared => {
                    txn.holds_table_lock(oid, LockMode::Exclusive)
                        || txn.holds_table_lock(oid, LockMode::IntentionExclusive)
                        || txn.holds_table_lock(oid, LockMode::SharedIntentionExclusive)
                        || txn.holds_table_lock(oid, LockMode::Shared)
                        || txn.holds_table_lock(oid, LockMode::IntentionShared)
                }
                _ => unreachable!("intention modes were rejected above"),
            };
            if !table_ok {
                return Err(self.abort(txn, AbortReason::TableLockNotPresent));
            }
        }

        Ok(())
    }

    /// Blocks until the queued request can be granted or the transaction
    /// is aborted mid-wait.
    fn wait_for_grant(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        mut state: MutexGuard<'_, QueueState>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<RecordId>,
    ) -> PlumeResult<bool> {
        loop {
            if Self::grantable(&state, txn.id()) {
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TRANSACTION_ID;
                }
                if let Some(request) = state
                    .requests
                    .iter_mut()
                    .find(|request| request.txn_id == txn.id())
                {
                    request.granted = true;
                }
                match rid {
                    None => txn.insert_table_lock(mode, oid),
                    Some(rid) => txn.insert_row_lock(mode, oid, rid),
                }
                // Anything compatible may be grantable alongside us.
                if mode != LockMode::Exclusive {
                    queue.cv.notify_all();
                }
                trace!(
                    "txn {} granted {:?} on table {} row {:?}",
                    txn.id(),
                    mode,
                    oid,
                    rid
                );
                return Ok(true);
            }

            queue.cv.wait(&mut state);

            if txn.state() == TransactionState::Aborted {
                // Aborted mid-wait (deadlock victim); withdraw and let the
                // queue move on.
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TRANSACTION_ID;
                }
                state
                    .requests
                    .retain(|request| request.txn_id != txn.id());
                queue.cv.notify_all();
                trace!("txn {} wait broken by abort", txn.id());
                return Ok(false);
            }
        }
    }

    /// Grant rule: no foreign upgrade pending, compatible with every
    /// granted request, and compatible with every waiter queued ahead.
    /// Compatible waiters are granted together; FIFO order applies only
    /// between incompatible requests.
    fn grantable(state: &QueueState, txn_id: TransactionId) -> bool {
        if state.upgrading != INVALID_TRANSACTION_ID && state.upgrading != txn_id {
            return false;
        }
        let Some(position) = state
            .requests
            .iter()
            .position(|request| request.txn_id == txn_id)
        else {
            return false;
        };
        let mode = state.requests[position].mode;

        for (index, request) in state.requests.iter().enumerate() {
            if request.txn_id == txn_id {
                continue;
            }
            if request.granted {
                if !LockMode::compatible(request.mode, mode) {
                    return false;
                }
            } else if index < position && !LockMode::compatible(request.mode, mode) {
                return false;
            }
        }
        true
    }

    fn transition_on_unlock(&self, txn: &Arc<Transaction>, released: LockMode) {
        if txn.is_terminal() {
            return;
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(released, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                released == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> PlumeError {
        txn.set_state(TransactionState::Aborted);
        warn!("txn {} aborted: {}", txn.id(), reason);
        PlumeError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.detector_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
