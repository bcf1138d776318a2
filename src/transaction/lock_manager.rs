use crate::config::LockManagerConfig;
use crate::error::{PlumeDBError, PlumeDBResult};
use crate::storage::page::RecordId;
use crate::transaction::{
    IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
};
use dashmap::DashMap;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// Why the lock manager aborted a transaction. Raised synchronously; the
/// caller is responsible for rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("lock requested while in the shrinking phase")]
    LockOnShrinking,
    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,
    #[error("requested mode is not a legal upgrade of the held lock")]
    IncompatibleUpgrade,
    #[error("shared lock requested under read uncommitted")]
    LockSharedOnReadUncommitted,
    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,
    #[error("row lock requested without a suitable table lock")]
    TableLockNotPresent,
    #[error("table unlocked while its row locks were still held")]
    TableUnlockedBeforeUnlockingRows,
    #[error("unlock of a lock that is not held")]
    AttemptedUnlockButNoLockHeld,
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    oid: TableOid,
    rid: Option<RecordId>,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    // FIFO; granted requests may sit anywhere in it
    requests: Vec<LockRequest>,
    // at most one transaction may be upgrading per resource
    upgrading: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

/// Hierarchical two-level lock manager: table locks keyed by oid, row
/// locks keyed by rid, five modes, FIFO grants with upgrade priority, and
/// a background deadlock detector that aborts the youngest transaction of
/// each cycle.
///
/// Queues are shared through `Arc` so the short-lived map latches never
/// invalidate a queue a waiter is blocked on.
#[derive(Debug)]
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
    // every transaction that ever touched a queue, for victim lookup
    transactions: DashMap<TransactionId, Arc<Transaction>>,
    waits_for: Mutex<HashMap<TransactionId, Vec<TransactionId>>>,
    config: LockManagerConfig,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::new_with_config(LockManagerConfig::default())
    }

    pub fn new_with_config(config: LockManagerConfig) -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            transactions: DashMap::new(),
            waits_for: Mutex::new(HashMap::new()),
            config,
        }
    }

    // ---------------------------------------------------------------
    // table locks
    // ---------------------------------------------------------------

    /// Acquire a table lock, blocking until grantable. Returns Ok(false)
    /// when the wait was cut short because the deadlock detector aborted
    /// this transaction.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> PlumeDBResult<bool> {
        self.check_table_admission(txn, mode)?;
        self.transactions.insert(txn.id(), txn.clone());

        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();

        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(held, mode) {
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            state.requests.remove(pos);
            txn.remove_table_lock(held, oid);
            state.upgrading = Some(txn.id());
            trace!("txn {} upgrading table {} to {:?}", txn.id(), oid, mode);
        }

        state.requests.push(LockRequest {
            txn_id: txn.id(),
            mode,
            oid,
            rid: None,
            granted: false,
        });

        loop {
            if Self::try_grant(&mut state, txn, mode, oid, None) {
                trace!("txn {} granted {:?} on table {}", txn.id(), mode, oid);
                return Ok(true);
            }
            queue.condvar.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                Self::remove_waiting_request(&mut state, txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.condvar.notify_all();
                return Ok(false);
            }
        }
    }

    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> PlumeDBResult<bool> {
        if txn.holds_rows_in(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        let queue = self.table_lock_map.lock().get(&oid).cloned();
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut state = queue.state.lock();
        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = state.requests.remove(pos);
        self.apply_unlock_transition(txn, request.mode);
        txn.remove_table_lock(request.mode, oid);
        queue.condvar.notify_all();
        Ok(true)
    }

    // ---------------------------------------------------------------
    // row locks
    // ---------------------------------------------------------------

    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> PlumeDBResult<bool> {
        if matches!(
            mode,
            LockMode::IntentionShared
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        ) {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_row_admission(txn, mode)?;

        // the table must already be locked in a mode covering this request:
        // S rows ride on any table lock, X rows need IX/X/SIX
        let table_covered = {
            let queue = self.table_queue(oid);
            let state = queue.state.lock();
            state.requests.iter().any(|r| {
                r.txn_id == txn.id()
                    && r.granted
                    && (mode == LockMode::Shared
                        || matches!(
                            r.mode,
                            LockMode::IntentionExclusive
                                | LockMode::Exclusive
                                | LockMode::SharedIntentionExclusive
                        ))
            })
        };
        if !table_covered {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }
        self.transactions.insert(txn.id(), txn.clone());

        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();

        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(held, mode) {
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            state.requests.remove(pos);
            txn.remove_row_lock(held, oid, rid);
            state.upgrading = Some(txn.id());
        }

        state.requests.push(LockRequest {
            txn_id: txn.id(),
            mode,
            oid,
            rid: Some(rid),
            granted: false,
        });

        loop {
            if Self::try_grant(&mut state, txn, mode, oid, Some(rid)) {
                trace!("txn {} granted {:?} on row {}", txn.id(), mode, rid);
                return Ok(true);
            }
            queue.condvar.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                Self::remove_waiting_request(&mut state, txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.condvar.notify_all();
                return Ok(false);
            }
        }
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
    ) -> PlumeDBResult<bool> {
        let queue = self.row_lock_map.lock().get(&rid).cloned();
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut state = queue.state.lock();
        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = state.requests.remove(pos);
        self.apply_unlock_transition(txn, request.mode);
        txn.remove_row_lock(request.mode, oid, rid);
        queue.condvar.notify_all();
        Ok(true)
    }

    // ---------------------------------------------------------------
    // grant policy
    // ---------------------------------------------------------------

    /// A request is grantable when its mode is compatible with every
    /// granted request and with every earlier waiter. While an upgrade is
    /// pending, only the upgrader is considered.
    fn try_grant(
        state: &mut QueueState,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<RecordId>,
    ) -> bool {
        let txn_id = txn.id();
        for request in state.requests.iter().filter(|r| r.granted) {
            if request.txn_id != txn_id && !modes_compatible(request.mode, mode) {
                return false;
            }
        }

        if let Some(upgrader) = state.upgrading {
            if upgrader != txn_id {
                return false;
            }
            state.upgrading = None;
            Self::grant(state, txn, mode, oid, rid);
            return true;
        }

        // FIFO fairness: earlier incompatible waiters keep their place
        for request in state.requests.iter() {
            if request.txn_id == txn_id {
                break;
            }
            if !request.granted && !modes_compatible(request.mode, mode) {
                return false;
            }
        }
        Self::grant(state, txn, mode, oid, rid);
        true
    }

    fn grant(
        state: &mut QueueState,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<RecordId>,
    ) {
        if let Some(request) = state
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn.id() && !r.granted)
        {
            request.granted = true;
        }
        match rid {
            Some(rid) => txn.add_row_lock(mode, oid, rid),
            None => txn.add_table_lock(mode, oid),
        }
    }

    fn remove_waiting_request(state: &mut QueueState, txn_id: TransactionId) {
        state
            .requests
            .retain(|r| !(r.txn_id == txn_id && !r.granted));
    }

    // ---------------------------------------------------------------
    // admission rules
    // ---------------------------------------------------------------

    fn check_table_admission(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> PlumeDBResult<()> {
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, LockMode::IntentionShared | LockMode::Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if !matches!(mode, LockMode::IntentionExclusive | LockMode::Exclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn check_row_admission(&self, txn: &Arc<Transaction>, mode: LockMode) -> PlumeDBResult<()> {
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking && mode != LockMode::Shared {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if mode != LockMode::Exclusive {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Growing -> Shrinking on the unlocks strict 2PL cares about: any
    /// S/X release under repeatable read, X releases otherwise.
    fn apply_unlock_transition(&self, txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> PlumeDBError {
        txn.set_state(TransactionState::Aborted);
        warn!("txn {} aborted: {}", txn.id(), reason);
        PlumeDBError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        map.entry(oid).or_default().clone()
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        map.entry(rid).or_default().clone()
    }

    // ---------------------------------------------------------------
    // deadlock detection
    // ---------------------------------------------------------------

    /// Spawn the background detector. It stops once the manager is
    /// dropped.
    pub fn start_deadlock_detection(self: &Arc<Self>) {
        let manager: Weak<LockManager> = Arc::downgrade(self);
        let interval = self.config.cycle_detection_interval;
        thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.run_deadlock_detection();
            })
            .expect("failed to spawn deadlock detector");
    }

    /// One detection tick: rebuild the wait-for graph from every queue,
    /// then abort the youngest member of each cycle until none remain.
    pub fn run_deadlock_detection(&self) {
        let mut waits_for = self.waits_for.lock();
        waits_for.clear();

        let queues: Vec<Arc<LockRequestQueue>> = {
            let tables = self.table_lock_map.lock();
            let rows = self.row_lock_map.lock();
            tables.values().cloned().chain(rows.values().cloned()).collect()
        };
        for queue in &queues {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if waiter.txn_id != holder.txn_id
                        && !modes_compatible(holder.mode, waiter.mode)
                    {
                        add_edge(&mut waits_for, waiter.txn_id, holder.txn_id);
                    }
                }
            }
        }

        while let Some(victim) = find_victim(&waits_for) {
            warn!("deadlock detected, aborting txn {}", victim);
            if let Some(txn) = self.transactions.get(&victim).map(|t| t.value().clone()) {
                txn.set_state(TransactionState::Aborted);
                self.release_all_locks(&txn);
            }
            remove_transaction(&mut waits_for, victim);
            self.notify_all_queues();
        }
    }

    /// Edge list of the last computed wait-for graph.
    pub fn wait_for_edges(&self) -> Vec<(TransactionId, TransactionId)> {
        let waits_for = self.waits_for.lock();
        let mut edges: Vec<(TransactionId, TransactionId)> = waits_for
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (*from, *to)))
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Drop every lock the victim holds: rows first, then tables. Its
    /// waiting request, if any, is removed by the victim thread itself on
    /// wake-up.
    fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = {
            let sets = txn.lock_sets();
            let rows: Vec<(TableOid, RecordId)> = sets
                .shared_rows
                .iter()
                .chain(sets.exclusive_rows.iter())
                .flat_map(|(oid, rids)| rids.iter().map(move |rid| (*oid, *rid)))
                .collect();
            let tables: Vec<TableOid> = sets
                .shared_tables
                .iter()
                .chain(sets.exclusive_tables.iter())
                .chain(sets.intention_shared_tables.iter())
                .chain(sets.intention_exclusive_tables.iter())
                .chain(sets.shared_intention_exclusive_tables.iter())
                .copied()
                .collect();
            (rows, tables)
        };
        for (oid, rid) in rows {
            self.force_unlock_row(txn, oid, rid);
        }
        for oid in tables {
            self.force_unlock_table(txn, oid);
        }
    }

    fn force_unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) {
        let queue = self.table_lock_map.lock().get(&oid).cloned();
        let Some(queue) = queue else { return };
        let mut state = queue.state.lock();
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let request = state.requests.remove(pos);
            txn.remove_table_lock(request.mode, oid);
            queue.condvar.notify_all();
        }
    }

    fn force_unlock_row(&self, txn: &Arc<Transaction>, oid: TableOid, rid: RecordId) {
        let queue = self.row_lock_map.lock().get(&rid).cloned();
        let Some(queue) = queue else { return };
        let mut state = queue.state.lock();
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let request = state.requests.remove(pos);
            txn.remove_row_lock(request.mode, oid, rid);
            queue.condvar.notify_all();
        }
    }

    fn notify_all_queues(&self) {
        for queue in self.table_lock_map.lock().values() {
            queue.condvar.notify_all();
        }
        for queue in self.row_lock_map.lock().values() {
            queue.condvar.notify_all();
        }
    }
}

/// Compatibility matrix: can `requested` be granted alongside `held`?
fn modes_compatible(held: LockMode, requested: LockMode) -> bool {
    match requested {
        LockMode::IntentionShared => held != LockMode::Exclusive,
        LockMode::IntentionExclusive => matches!(
            held,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ),
        LockMode::Shared => matches!(held, LockMode::IntentionShared | LockMode::Shared),
        LockMode::SharedIntentionExclusive => held == LockMode::IntentionShared,
        LockMode::Exclusive => false,
    }
}

/// Upgrade matrix: IS -> {S, X, IX, SIX}; S -> {X, SIX}; IX -> {X, SIX};
/// SIX -> {X}; X -> nothing.
fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
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
        LockMode::SharedIntentionExclusive => requested == LockMode::Exclusive,
        LockMode::Exclusive => false,
    }
}

fn add_edge(
    waits_for: &mut HashMap<TransactionId, Vec<TransactionId>>,
    from: TransactionId,
    to: TransactionId,
) {
    let edges = waits_for.entry(from).or_default();
    // adjacency lists stay sorted for deterministic traversal
    if let Err(pos) = edges.binary_search(&to) {
        edges.insert(pos, to);
    }
}

/// Remove the victim's node and every edge pointing at it.
fn remove_transaction(
    waits_for: &mut HashMap<TransactionId, Vec<TransactionId>>,
    victim: TransactionId,
) {
    waits_for.remove(&victim);
    for edges in waits_for.values_mut() {
        edges.retain(|t| *t != victim);
    }
}

/// DFS from each transaction in descending id order; on a cycle, the
/// youngest (largest id) member is the victim.
fn find_victim(waits_for: &HashMap<TransactionId, Vec<TransactionId>>) -> Option<TransactionId> {
    let mut starts: Vec<TransactionId> = waits_for.keys().copied().collect();
    starts.sort_unstable_by(|a, b| b.cmp(a));
    for start in starts {
        let mut path = vec![start];
        if let Some(victim) = dfs(waits_for, &mut path) {
            return Some(victim);
        }
    }
    None
}

fn dfs(
    waits_for: &HashMap<TransactionId, Vec<TransactionId>>,
    path: &mut Vec<TransactionId>,
) -> Option<TransactionId> {
    let node = *path.last().unwrap();
    for &next in waits_for.get(&node)? {
        if let Some(pos) = path.iter().position(|&t| t == next) {
            return path[pos..].iter().copied().max();
        }
        path.push(next);
        if let Some(victim) = dfs(waits_for, path) {
            return Some(victim);
        }
        path.pop();
    }
    None
}
