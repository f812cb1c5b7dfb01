//! End-to-end flows an executor would drive: table locks before row
//! locks, row locks held across index access, writers blocking readers,
//! and deadlock victims rolling back cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use plumedb::buffer::BufferPoolManager;
use plumedb::config::{BufferPoolConfig, LockManagerConfig};
use plumedb::index::{BPlusTree, TreeIndexIterator};
use plumedb::storage::disk_manager::DiskManager;
use plumedb::storage::disk_scheduler::DiskScheduler;
use plumedb::storage::page::RecordId;
use plumedb::transaction::{IsolationLevel, LockManager, LockMode, Transaction, TransactionState};

const TABLE: u32 = 1;

fn key(i: i64) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn rid(i: i64) -> RecordId {
    RecordId::new(i as u32, i as u32)
}

fn build_fixture() -> (TempDir, Arc<BPlusTree>, Arc<LockManager>) {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
    let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let buffer_pool = Arc::new(BufferPoolManager::new_with_config(
        BufferPoolConfig {
            buffer_pool_size: 512,
            lru_k_k: 2,
        },
        disk_scheduler,
    ));
    let tree = Arc::new(BPlusTree::new("orders_pk", buffer_pool, 8, 8).unwrap());
    let lock_manager = Arc::new(LockManager::new(LockManagerConfig::default()));
    (temp_dir, tree, lock_manager)
}

/// Insert path: IX on the table, X on each row, index maintenance while
/// the row lock is held.
fn insert_rows(
    tree: &Arc<BPlusTree>,
    lock_manager: &Arc<LockManager>,
    txn: &Arc<Transaction>,
    range: std::ops::Range<i64>,
) {
    assert!(lock_manager
        .lock_table(txn, LockMode::IntentionExclusive, TABLE)
        .unwrap());
    for i in range {
        assert!(lock_manager
            .lock_row(txn, LockMode::Exclusive, TABLE, rid(i))
            .unwrap());
        assert!(tree.insert(&key(i), rid(i)).unwrap());
    }
}

fn commit(lock_manager: &Arc<LockManager>, txn: &Arc<Transaction>) {
    txn.set_state(TransactionState::Committed);
    lock_manager.release_all_locks(txn);
}

#[test]
fn test_writers_then_reader_scan() {
    let (_temp_dir, tree, lock_manager) = build_fixture();

    let mut handles = vec![];
    for writer_index in 0..4i64 {
        let tree = tree.clone();
        let lock_manager = lock_manager.clone();
        handles.push(thread::spawn(move || {
            let txn = Arc::new(Transaction::new(
                (writer_index + 1) as u64,
                IsolationLevel::RepeatableRead,
            ));
            insert_rows(
                &tree,
                &lock_manager,
                &txn,
                writer_index * 100..(writer_index + 1) * 100,
            );
            commit(&lock_manager, &txn);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Reader: IS on the table, S per row while probing the index.
    let reader = Arc::new(Transaction::new(9, IsolationLevel::RepeatableRead));
    assert!(lock_manager
        .lock_table(&reader, LockMode::IntentionShared, TABLE)
        .unwrap());
    for i in [0, 99, 250, 399] {
        assert!(lock_manager
            .lock_row(&reader, LockMode::Shared, TABLE, rid(i))
            .unwrap());
        assert_eq!(tree.get_value(&key(i)).unwrap(), Some(rid(i)));
    }

    // Full scan sees all 400 rows in order.
    let mut iterator = TreeIndexIterator::begin(tree.clone()).unwrap();
    let mut count = 0i64;
    while let Some((k, _)) = iterator.next().unwrap() {
        assert_eq!(k, key(count));
        count += 1;
    }
    assert_eq!(count, 400);
    drop(iterator);

    commit(&lock_manager, &reader);
    tree.check_integrity().unwrap();
    assert!(tree.buffer_pool.check_all_unpinned());
}

#[test]
fn test_row_writer_blocks_row_reader() {
    let (_temp_dir, tree, lock_manager) = build_fixture();

    let writer = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    insert_rows(&tree, &lock_manager, &writer, 0..10);

    let read_done = Arc::new(AtomicBool::new(false));
    let reader_handle = {
        let tree = tree.clone();
        let lock_manager = lock_manager.clone();
        let read_done = read_done.clone();
        thread::spawn(move || {
            let reader = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));
            assert!(lock_manager
                .lock_table(&reader, LockMode::IntentionShared, TABLE)
                .unwrap());
            // Blocks until the writer commits.
            assert!(lock_manager
                .lock_row(&reader, LockMode::Shared, TABLE, rid(5))
                .unwrap());
            assert_eq!(tree.get_value(&key(5)).unwrap(), Some(rid(5)));
            read_done.store(true, Ordering::SeqCst);
            commit(&lock_manager, &reader);
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!read_done.load(Ordering::SeqCst));

    commit(&lock_manager, &writer);
    reader_handle.join().unwrap();
    assert!(read_done.load(Ordering::SeqCst));
}

#[test]
fn test_deadlocked_writers_one_survives() {
    let (_temp_dir, tree, lock_manager) = build_fixture();
    lock_manager.start_deadlock_detection();

    let seed = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    insert_rows(&tree, &lock_manager, &seed, 0..2);
    commit(&lock_manager, &seed);

    let txn_a = Arc::new(Transaction::new(10, IsolationLevel::RepeatableRead));
    let txn_b = Arc::new(Transaction::new(20, IsolationLevel::RepeatableRead));
    assert!(lock_manager
        .lock_table(&txn_a, LockMode::IntentionExclusive, TABLE)
        .unwrap());
    assert!(lock_manager
        .lock_table(&txn_b, LockMode::IntentionExclusive, TABLE)
        .unwrap());
    assert!(lock_manager
        .lock_row(&txn_a, LockMode::Exclusive, TABLE, rid(0))
        .unwrap());
    assert!(lock_manager
        .lock_row(&txn_b, LockMode::Exclusive, TABLE, rid(1))
        .unwrap());

    // Cross over: A wants B's row and vice versa.
    let a_handle = {
        let lock_manager = lock_manager.clone();
        let txn_a = txn_a.clone();
        thread::spawn(move || {
            lock_manager
                .lock_row(&txn_a, LockMode::Exclusive, TABLE, rid(1))
                .unwrap()
        })
    };
    let b_handle = {
        let lock_manager = lock_manager.clone();
        let txn_b = txn_b.clone();
        thread::spawn(move || {
            lock_manager
                .lock_row(&txn_b, LockMode::Exclusive, TABLE, rid(0))
                .unwrap()
        })
    };

    // The younger transaction (B) is the victim; it must come back with a
    // failed wait. A can only finish once B's locks are rolled back.
    let b_won = b_handle.join().unwrap();
    assert!(!b_won);
    assert_eq!(txn_b.state(), TransactionState::Aborted);
    lock_manager.release_all_locks(&txn_b);

    let a_won = a_handle.join().unwrap();
    assert!(a_won);

    // The survivor can finish its update and commit.
    tree.remove(&key(1)).unwrap();
    assert!(tree.insert(&key(1), rid(101)).unwrap());
    commit(&lock_manager, &txn_a);

    assert_eq!(tree.get_value(&key(1)).unwrap(), Some(rid(101)));
    lock_manager.stop_deadlock_detection();
}
