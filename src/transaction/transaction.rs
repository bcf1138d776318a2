use crate::storage::page::RecordId;
use crate::transaction::LockMode;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};

pub type TransactionId = u64;
pub type TableOid = u32;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Everything the lock manager tracks per transaction: one set per table
/// lock mode, plus S/X row sets keyed by table oid.
#[derive(Debug, Default)]
pub struct LockSets {
    pub shared_tables: HashSet<TableOid>,
    pub exclusive_tables: HashSet<TableOid>,
    pub intention_shared_tables: HashSet<TableOid>,
    pub intention_exclusive_tables: HashSet<TableOid>,
    pub shared_intention_exclusive_tables: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

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

    pub(crate) fn lock_sets(&self) -> MutexGuard<'_, LockSets> {
        self.lock_sets.lock()
    }

    /// True while any row of `oid` is still locked by this transaction.
    pub fn holds_rows_in(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || sets
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }

    pub fn holds_table_lock(&self, oid: TableOid, mode: LockMode) -> bool {
        let sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_tables.contains(&oid),
            LockMode::Exclusive => sets.exclusive_tables.contains(&oid),
            LockMode::IntentionShared => sets.intention_shared_tables.contains(&oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_tables.contains(&oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_tables.contains(&oid)
            }
        }
    }

    pub fn holds_row_lock(&self, oid: TableOid, rid: RecordId, mode: LockMode) -> bool {
        let sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &sets.shared_rows,
            LockMode::Exclusive => &sets.exclusive_rows,
            _ => return false,
        };
        rows.get(&oid).is_some_and(|set| set.contains(&rid))
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_tables.insert(oid),
            LockMode::Exclusive => sets.exclusive_tables.insert(oid),
            LockMode::IntentionShared => sets.intention_shared_tables.insert(oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_tables.insert(oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_tables.insert(oid)
            }
        };
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_tables.remove(&oid),
            LockMode::Exclusive => sets.exclusive_tables.remove(&oid),
            LockMode::IntentionShared => sets.intention_shared_tables.remove(&oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_tables.remove(&oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_tables.remove(&oid)
            }
        };
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("rows only take S or X locks"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => return,
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }
}
