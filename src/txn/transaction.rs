//! Transaction object and its state machine
//!
//! ```text
//! IN_PROGRESS -> PREPARED -> COMMITTED | ABORTED
//! IN_PROGRESS -> CONFLICTED -> ABORTED
//! IN_PROGRESS -> IN_READ_VIEW -> COMMITTED | ABORTED   (read-only victims)
//! ```

use super::engine::Engine;
use super::region::Region;
use super::statement::{TxnStmt, TXN_SUB_STMT_MAX};
use super::trigger::{TriggerList, TxnEvent};
use crate::types::ReplicationGroup;
use crate::TxnError;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

pub type TxnId = i64;
pub type SavepointId = u64;

/// Completion signatures: an LSN (>= 0) on commit, one of these on abort.
pub const TXN_SIGNATURE_NOP: i64 = 0;
pub const TXN_SIGNATURE_UNKNOWN: i64 = -1;
pub const TXN_SIGNATURE_ROLLBACK: i64 = -2;
pub const TXN_SIGNATURE_WRITE_ERROR: i64 = -3;
pub const TXN_SIGNATURE_QUORUM_TIMEOUT: i64 = -4;
pub const TXN_SIGNATURE_SYNC_ROLLBACK: i64 = -5;

/// Error a failed commit reports for its signature.
pub fn signature_error(signature: i64) -> TxnError {
    match signature {
        TXN_SIGNATURE_WRITE_ERROR => TxnError::WalIo,
        TXN_SIGNATURE_QUORUM_TIMEOUT => TxnError::SyncQuorumTimeout,
        TXN_SIGNATURE_SYNC_ROLLBACK => TxnError::SyncRollback,
        TXN_SIGNATURE_ROLLBACK => TxnError::TransactionConflict,
        _ => TxnError::WalIo,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    InProgress,
    Prepared,
    Committed,
    Aborted,
    Conflicted,
    /// Read-only transaction that lost a conflict; may still commit but
    /// may not write.
    InReadView,
}

impl TxnStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Savepoint {
    pub(crate) id: SavepointId,
    pub(crate) name: Option<String>,
    pub(crate) in_sub_stmt: usize,
    /// Number of statements when the savepoint was taken.
    pub(crate) stmt_mark: usize,
    pub(crate) fk_deferred_count: i64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TxnFlags {
    pub(crate) can_yield: bool,
    pub(crate) aborted_by_yield: bool,
    /// Sitting in the limbo.
    pub(crate) wait_sync: bool,
    /// Needs quorum acks (touched a sync space).
    pub(crate) wait_ack: bool,
    pub(crate) force_async: bool,
    /// Completion has run.
    pub(crate) done: bool,
    /// A task is blocked in commit and will free the transaction.
    pub(crate) has_waiter: bool,
    /// Journal entry submitted and not completed yet.
    pub(crate) write_pending: bool,
}

impl Default for TxnFlags {
    fn default() -> Self {
        Self {
            can_yield: true,
            aborted_by_yield: false,
            wait_sync: false,
            wait_ack: false,
            force_async: false,
            done: false,
            has_waiter: false,
            write_pending: false,
        }
    }
}

pub struct Txn {
    pub(crate) id: TxnId,
    pub(crate) psn: i64,
    pub(crate) status: TxnStatus,
    pub(crate) signature: i64,
    pub(crate) stmts: Vec<TxnStmt>,
    pub(crate) n_new_rows: usize,
    pub(crate) n_local_rows: usize,
    pub(crate) n_applier_rows: usize,
    pub(crate) in_sub_stmt: usize,
    /// Statement count at the start of each nesting level.
    pub(crate) sub_stmt_begin: [usize; TXN_SUB_STMT_MAX + 1],
    pub(crate) savepoints: Vec<Savepoint>,
    next_savepoint: SavepointId,
    pub(crate) on_commit: TriggerList,
    pub(crate) on_rollback: TriggerList,
    pub(crate) engine: Option<Arc<dyn Engine>>,
    engine_tx: Option<Box<dyn Any + Send>>,
    pub(crate) fk_deferred_count: i64,
    pub(crate) flags: TxnFlags,
    pub(crate) start_tm: Option<Instant>,
    pub(crate) region: Region,
}

impl Txn {
    pub fn new(region_limit: usize) -> Self {
        Self {
            id: 0,
            psn: 0,
            status: TxnStatus::InProgress,
            signature: TXN_SIGNATURE_UNKNOWN,
            stmts: Vec::new(),
            n_new_rows: 0,
            n_local_rows: 0,
            n_applier_rows: 0,
            in_sub_stmt: 0,
            sub_stmt_begin: [0; TXN_SUB_STMT_MAX + 1],
            savepoints: Vec::new(),
            next_savepoint: 0,
            on_commit: TriggerList::default(),
            on_rollback: TriggerList::default(),
            engine: None,
            engine_tx: None,
            fk_deferred_count: 0,
            flags: TxnFlags::default(),
            start_tm: None,
            region: Region::new(region_limit),
        }
    }

    /// Bring a recycled object back to its initial state under a new id.
    pub(crate) fn reset(&mut self, id: TxnId, region_limit: usize) {
        self.id = id;
        self.psn = 0;
        self.status = TxnStatus::InProgress;
        self.signature = TXN_SIGNATURE_UNKNOWN;
        self.stmts.clear();
        self.n_new_rows = 0;
        self.n_local_rows = 0;
        self.n_applier_rows = 0;
        self.in_sub_stmt = 0;
        self.sub_stmt_begin = [0; TXN_SUB_STMT_MAX + 1];
        self.savepoints.clear();
        self.next_savepoint = 0;
        self.on_commit.clear();
        self.on_rollback.clear();
        self.engine = None;
        self.engine_tx = None;
        self.fk_deferred_count = 0;
        self.flags = TxnFlags::default();
        self.start_tm = None;
        self.region.reset(region_limit);
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn psn(&self) -> i64 {
        self.psn
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn signature(&self) -> i64 {
        self.signature
    }

    pub fn can_yield(&self) -> bool {
        self.flags.can_yield
    }

    pub fn set_can_yield(&mut self, can_yield: bool) {
        self.flags.can_yield = can_yield;
    }

    pub fn statement_count(&self) -> usize {
        self.stmts.len()
    }

    pub fn n_new_rows(&self) -> usize {
        self.n_new_rows
    }

    pub fn n_local_rows(&self) -> usize {
        self.n_local_rows
    }

    pub fn n_applier_rows(&self) -> usize {
        self.n_applier_rows
    }

    /// Engine-private state attached by engine hooks.
    pub fn engine_tx(&mut self) -> &mut Option<Box<dyn Any + Send>> {
        &mut self.engine_tx
    }

    pub(crate) fn event(&self) -> TxnEvent {
        TxnEvent {
            txn_id: self.id,
            psn: self.psn,
            signature: self.signature,
            status: self.status,
        }
    }

    /// No rows to write: the commit can skip the journal.
    pub(crate) fn is_nop(&self) -> bool {
        self.n_new_rows + self.n_applier_rows == 0
    }

    pub(crate) fn has_writes(&self) -> bool {
        self.stmts
            .iter()
            .any(|s| s.row.is_some() || s.add_story.is_some() || s.del_story.is_some())
    }

    pub(crate) fn count_row(&mut self, stmt_idx: usize, group: ReplicationGroup) {
        let Some(applier) = self.stmts[stmt_idx].row_is_applier() else { return };
        if applier {
            self.n_applier_rows += 1;
        } else {
            self.n_new_rows += 1;
            if group == ReplicationGroup::Local {
                self.n_local_rows += 1;
            }
        }
    }

    pub(crate) fn uncount_row(&mut self, stmt: &TxnStmt) {
        let Some(row) = stmt.row.as_ref() else { return };
        if row.header.replica_id != 0 {
            self.n_applier_rows -= 1;
        } else {
            self.n_new_rows -= 1;
            if row.header.group_id == ReplicationGroup::Local {
                self.n_local_rows -= 1;
            }
        }
    }

    /// Cut every statement after `mark`; savepoints past the cut go too.
    pub(crate) fn cut_stmts(&mut self, mark: usize) -> Vec<TxnStmt> {
        self.savepoints.retain(|sp| sp.stmt_mark <= mark);
        if mark >= self.stmts.len() {
            return Vec::new();
        }
        self.stmts.split_off(mark)
    }

    pub(crate) fn add_savepoint(&mut self, name: Option<&str>) -> SavepointId {
        if let Some(name) = name {
            self.savepoints.retain(|sp| sp.name.as_deref() != Some(name));
        }
        self.next_savepoint += 1;
        self.savepoints.push(Savepoint {
            id: self.next_savepoint,
            name: name.map(str::to_string),
            in_sub_stmt: self.in_sub_stmt,
            stmt_mark: self.stmts.len(),
            fk_deferred_count: self.fk_deferred_count,
        });
        self.next_savepoint
    }

    pub(crate) fn savepoint_position(&self, id: SavepointId) -> Option<usize> {
        self.savepoints.iter().position(|sp| sp.id == id)
    }

    pub(crate) fn savepoint_by_name(&self, name: &str) -> Option<SavepointId> {
        self.savepoints
            .iter()
            .rev()
            .find(|sp| sp.name.as_deref() == Some(name))
            .map(|sp| sp.id)
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("psn", &self.psn)
            .field("status", &self.status)
            .field("signature", &self.signature)
            .field("stmts", &self.stmts.len())
            .field("in_sub_stmt", &self.in_sub_stmt)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_everything() {
        let mut txn = Txn::new(1024);
        txn.reset(5, 2048);
        txn.stmts.push(TxnStmt::new(0));
        txn.add_savepoint(Some("a"));
        txn.set_can_yield(false);
        txn.region.reserve(100, "test").unwrap();

        txn.reset(6, 2048);
        assert_eq!(txn.id(), 6);
        assert_eq!(txn.statement_count(), 0);
        assert!(txn.savepoints.is_empty());
        assert!(txn.can_yield());
        assert_eq!(txn.region.used(), 0);
        assert_eq!(txn.status(), TxnStatus::InProgress);
    }

    #[test]
    fn test_savepoint_name_replaces_older() {
        let mut txn = Txn::new(1024);
        let first = txn.add_savepoint(Some("sp"));
        txn.stmts.push(TxnStmt::new(0));
        let second = txn.add_savepoint(Some("sp"));
        assert_ne!(first, second);
        assert_eq!(txn.savepoints.len(), 1);
        assert_eq!(txn.savepoint_by_name("sp"), Some(second));
        assert!(txn.savepoint_position(first).is_none());
    }

    #[test]
    fn test_cut_drops_later_savepoints() {
        let mut txn = Txn::new(1024);
        txn.add_savepoint(None);
        txn.stmts.push(TxnStmt::new(0));
        txn.stmts.push(TxnStmt::new(0));
        let late = txn.add_savepoint(None);
        let cut = txn.cut_stmts(1);
        assert_eq!(cut.len(), 1);
        assert_eq!(txn.statement_count(), 1);
        assert!(txn.savepoint_position(late).is_none());
        assert_eq!(txn.savepoints.len(), 1);
    }

    #[test]
    fn test_signature_errors() {
        assert_eq!(signature_error(TXN_SIGNATURE_WRITE_ERROR), TxnError::WalIo);
        assert_eq!(signature_error(TXN_SIGNATURE_QUORUM_TIMEOUT), TxnError::SyncQuorumTimeout);
        assert_eq!(signature_error(TXN_SIGNATURE_SYNC_ROLLBACK), TxnError::SyncRollback);
    }
}
