//! Transaction Coordinator
//!
//! Owns every transaction, the version store, the conflict graph and the
//! limbo behind one mutex; holding it plays the part of the single
//! scheduling thread. Tasks block on the condition variable while their
//! commit waits for the journal or for quorum, and the journal completes
//! entries through callbacks that take the same lock.

use super::conflict::{EdgeGraph, EDGE_SIZE};
use super::engine::{same_engine, Engine, MemtxEngine};
use super::journal::{
    Journal, JournalEntry, LogRow, MemoryJournal, RowType, JOURNAL_WRITE_FAILED,
};
use super::limbo::Limbo;
use super::region::RegionSlot;
use super::statement::{Request, TxnStmt, TXN_SUB_STMT_MAX};
use super::transaction::*;
use super::trigger::{ReplaceEvent, ReplaceTrigger, TriggerId, TxnTrigger};
use super::version_store::{Spaces, StmtRef, StoryId, VersionStore, VersionStoreStats};
use crate::config::TxnConfig;
use crate::types::{DupMode, Key, Space, SpaceDef, SpaceId, StorageKind, Tuple, TupleRef};
use crate::{Result, TxnError};
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Recycled transaction objects kept around.
const TXN_CACHE_MAX: usize = 64;

/// Minimum spacing of "too long WAL write" warnings.
const TOO_LONG_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxManagerStats {
    pub active: usize,
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub conflicted: u64,
    pub nop_commits: u64,
    pub too_long_writes: u64,
    pub conflict_edges: usize,
    pub limbo_len: usize,
    pub confirmed_lsn: i64,
    pub version_store: VersionStoreStats,
}

#[derive(Debug, Default)]
struct Counters {
    started: u64,
    committed: u64,
    rolled_back: u64,
    conflicted: u64,
    nop_commits: u64,
    too_long_writes: u64,
}

/// Lets one message through per interval and counts the rest.
#[derive(Debug)]
struct RateLimit {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimit {
    fn new(interval: Duration) -> Self {
        Self { interval, last: None, suppressed: 0 }
    }

    /// Some(suppressed since the last emitted message) if allowed now.
    fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

pub(crate) struct TxState {
    config: TxnConfig,
    txns: AHashMap<TxnId, Txn>,
    txn_cache: Vec<Txn>,
    next_txn_id: TxnId,
    last_psn: i64,
    spaces: Spaces,
    store: VersionStore,
    conflicts: EdgeGraph<TxnId, TxnId>,
    limbo: Limbo,
    /// CONFIRM / ROLLBACK rows to write once the lock is released.
    outbox: Vec<(RowType, u32, i64)>,
    too_long_warn: RateLimit,
    counters: Counters,
}

fn fatal_trigger(kind: &str, txn: TxnId, err: &TxnError) -> ! {
    tracing::error!(txn, error = %err, "{kind} trigger failed");
    panic!("{kind} trigger failed for transaction {txn}: {err}");
}

impl TxState {
    fn new(config: TxnConfig) -> Self {
        Self {
            store: VersionStore::new(config.max_stories),
            config,
            txns: AHashMap::new(),
            txn_cache: Vec::new(),
            next_txn_id: 0,
            last_psn: 0,
            spaces: Spaces::new(),
            conflicts: EdgeGraph::new("conflict edge"),
            limbo: Limbo::new(),
            outbox: Vec::new(),
            too_long_warn: RateLimit::new(TOO_LONG_WARN_INTERVAL),
            counters: Counters::default(),
        }
    }

    fn txn(&self, id: TxnId) -> Result<&Txn> {
        self.txns.get(&id).ok_or(TxnError::NoTransaction)
    }

    fn txn_mut(&mut self, id: TxnId) -> Result<&mut Txn> {
        self.txns.get_mut(&id).ok_or(TxnError::NoTransaction)
    }

    fn space(&self, id: SpaceId) -> Result<&Space> {
        self.spaces.get(&id).ok_or(TxnError::NoSuchSpace(id))
    }

    // ---- lifecycle -------------------------------------------------------

    fn begin(&mut self) -> Result<TxnId> {
        self.txns
            .try_reserve(1)
            .map_err(|_| TxnError::oom(std::mem::size_of::<Txn>(), "txn"))?;
        let limit = self.config.txn_region_limit;
        let mut txn = self.txn_cache.pop().unwrap_or_else(|| Txn::new(limit));
        self.next_txn_id += 1;
        let id = self.next_txn_id;
        txn.reset(id, limit);
        self.txns.insert(id, txn);
        self.counters.started += 1;
        tracing::debug!(txn = id, "begin");
        Ok(id)
    }

    fn begin_in_engine(&mut self, id: TxnId, engine: &Arc<dyn Engine>) -> Result<()> {
        if engine.bypass_tx() {
            return Ok(());
        }
        let txn = self.txn_mut(id)?;
        match &txn.engine {
            Some(current) if !same_engine(current, engine) => Err(TxnError::CrossEngineTransaction),
            Some(_) => Ok(()),
            None => {
                engine.begin(txn)?;
                txn.engine = Some(engine.clone());
                Ok(())
            }
        }
    }

    fn begin_stmt(&mut self, id: TxnId, space: Option<SpaceId>) -> Result<()> {
        let target = match space {
            Some(sid) => {
                let sp = self.space(sid)?;
                Some((sp.engine().clone(), sp.def().is_sync))
            }
            None => None,
        };
        let txn = self.txn_mut(id)?;
        if txn.flags.aborted_by_yield {
            return Err(TxnError::TransactionYield);
        }
        if txn.in_sub_stmt > TXN_SUB_STMT_MAX {
            return Err(TxnError::SubStatementMax);
        }
        match txn.status {
            TxnStatus::InProgress => {}
            TxnStatus::InReadView if space.is_none() => {}
            TxnStatus::Conflicted | TxnStatus::InReadView => return Err(TxnError::TransactionConflict),
            _ => return Err(TxnError::InvalidRequest("transaction is already finishing".into())),
        }
        let size = std::mem::size_of::<TxnStmt>();
        txn.region.reserve(size, "txn_stmt")?;
        if txn.stmts.try_reserve(1).is_err() {
            txn.region.release(size);
            return Err(TxnError::oom(size, "txn_stmt"));
        }
        let idx = txn.stmts.len();
        txn.sub_stmt_begin[txn.in_sub_stmt] = idx;
        txn.in_sub_stmt += 1;
        let mut stmt = TxnStmt::new(size);
        stmt.is_sync = target.as_ref().map_or(false, |t| t.1);
        txn.stmts.push(stmt);

        if let Some((engine, _)) = target {
            let started = self.begin_in_engine(id, &engine).and_then(|_| {
                let txn = self.txn_mut(id)?;
                engine.begin_statement(txn)
            });
            if let Err(e) = started {
                self.rollback_stmt(id);
                return Err(e);
            }
            self.txn_mut(id)?.stmts[idx].space = space;
        }
        Ok(())
    }

    fn current_stmt(&self, id: TxnId) -> Result<usize> {
        let txn = self.txn(id)?;
        if txn.flags.aborted_by_yield {
            return Err(TxnError::TransactionYield);
        }
        match txn.in_sub_stmt {
            0 => Err(TxnError::InvalidRequest("no statement in progress".into())),
            n if txn.sub_stmt_begin[n - 1] >= txn.stmts.len() => {
                Err(TxnError::InvalidRequest("statement was already rolled back".into()))
            }
            n => Ok(txn.sub_stmt_begin[n - 1]),
        }
    }

    fn execute_dml(&mut self, id: TxnId, req: &Request) -> Result<Option<TupleRef>> {
        let Some(sid) = req.space else { return Ok(None) };
        let storage = self.space(sid)?.engine().storage();
        let idx = self.current_stmt(id)?;
        let missing = |what: &str| TxnError::InvalidRequest(format!("{:?} without a {what}", req.kind));
        match (req.kind, storage) {
            (RowType::Insert | RowType::Replace, StorageKind::Memory) => {
                let tuple = req.tuple.clone().ok_or_else(|| missing("tuple"))?;
                self.replace_memtx(id, idx, sid, tuple, req.mode)
            }
            (RowType::Delete, StorageKind::Memory) => {
                let key = req.key.as_ref().ok_or_else(|| missing("key"))?;
                self.delete_memtx(id, idx, sid, key)
            }
            (RowType::Insert | RowType::Replace, StorageKind::Discard) => {
                let tuple = req.tuple.clone().ok_or_else(|| missing("tuple"))?;
                self.txn_mut(id)?.stmts[idx].new_tuple = Some(Arc::new(tuple));
                Ok(None)
            }
            (RowType::Delete | RowType::Nop, _) => Ok(None),
            (RowType::Confirm | RowType::Rollback, _) => Err(TxnError::InvalidRequest(
                "synchro rows are not data statements".into(),
            )),
        }
    }

    fn replace_memtx(
        &mut self,
        id: TxnId,
        idx: usize,
        sid: SpaceId,
        tuple: Tuple,
        mode: DupMode,
    ) -> Result<Option<TupleRef>> {
        let sref = StmtRef { txn: id, stmt: idx };
        let new = Arc::new(tuple);
        let (story, outcome) = {
            let space = self.spaces.get_mut(&sid).ok_or(TxnError::NoSuchSpace(sid))?;
            let story = self.store.create_story(new.clone(), sid, Some(sref), space.index_count())?;
            match self.store.link_insert(space, story, sref, mode) {
                Ok(outcome) => (story, outcome),
                Err(e) => {
                    self.store.delete_story(story);
                    return Err(e);
                }
            }
        };
        let stmt = &mut self.txn_mut(id)?.stmts[idx];
        stmt.add_story = Some(story);
        stmt.del_story = outcome.deleted;
        stmt.old_tuple = outcome.old.clone();
        stmt.new_tuple = Some(new);
        for wreaker in outcome.wreakers {
            self.cause_conflict(wreaker, id)?;
        }
        Ok(outcome.old)
    }

    fn delete_memtx(&mut self, id: TxnId, idx: usize, sid: SpaceId, key: &Key) -> Result<Option<TupleRef>> {
        let Some(head) = self.space(sid)?.index_get(0, key).cloned() else {
            return Ok(None);
        };
        let Some(visible) = self.store.clarify(&head, 0, Some(id), true).visible else {
            return Ok(None);
        };
        let space = self.spaces.get(&sid).ok_or(TxnError::NoSuchSpace(sid))?;
        let story = self.store.link_delete(space, &visible, StmtRef { txn: id, stmt: idx })?;
        let stmt = &mut self.txn_mut(id)?.stmts[idx];
        stmt.del_story = Some(story);
        stmt.old_tuple = Some(visible.clone());
        Ok(Some(visible))
    }

    fn commit_stmt(&mut self, id: TxnId, req: &Request) -> Result<()> {
        let idx = self.current_stmt(id)?;
        let sid = self.txn(id)?.stmts[idx].space;
        let (group, temporary, storage) = match sid.and_then(|s| self.spaces.get(&s)) {
            Some(space) => (space.def().group, space.def().temporary, space.engine().storage()),
            None => (Default::default(), false, StorageKind::Memory),
        };
        // Deleting a key that is not there changes nothing to replicate.
        let nothing_deleted = req.kind == RowType::Delete
            && storage == StorageKind::Memory
            && self.txn(id)?.stmts[idx].old_tuple.is_none();
        if !temporary && !nothing_deleted {
            let added = req.to_row(id, group).and_then(|row| {
                let txn = self.txn_mut(id)?;
                let size = row.encoded_len();
                txn.region.reserve(size, "xrow")?;
                txn.stmts[idx].region_size += size;
                txn.stmts[idx].row = Some(row);
                txn.count_row(idx, group);
                Ok(())
            });
            if let Err(e) = added {
                self.rollback_stmt(id);
                return Err(e);
            }
        }
        if let Some(sid) = sid {
            if let Err(e) = self.run_replace_triggers(id, idx, sid, req.kind) {
                self.rollback_stmt(id);
                return Err(e);
            }
        }
        self.txn_mut(id)?.in_sub_stmt -= 1;
        Ok(())
    }

    fn run_replace_triggers(&mut self, id: TxnId, idx: usize, sid: SpaceId, kind: RowType) -> Result<()> {
        let TxState { txns, spaces, .. } = self;
        let space = spaces.get_mut(&sid).ok_or(TxnError::NoSuchSpace(sid))?;
        if space.on_replace.is_empty() || !space.run_triggers {
            return Ok(());
        }
        let txn = txns.get_mut(&id).ok_or(TxnError::NoTransaction)?;
        let TxnStmt { old_tuple, new_tuple, on_commit, on_rollback, .. } = &mut txn.stmts[idx];
        if old_tuple.is_none() && new_tuple.is_none() {
            return Ok(());
        }
        for trigger in space.on_replace.iter_mut() {
            let mut event = ReplaceEvent {
                txn_id: id,
                space_id: sid,
                row_type: kind,
                old: old_tuple.as_ref(),
                new: new_tuple.as_ref(),
                on_commit: &mut *on_commit,
                on_rollback: &mut *on_rollback,
            };
            trigger(&mut event).map_err(|e| match e {
                TxnError::Trigger(_) => e,
                other => TxnError::Trigger(other.to_string()),
            })?;
        }
        Ok(())
    }

    fn rollback_stmt(&mut self, id: TxnId) {
        let Some(txn) = self.txns.get_mut(&id) else { return };
        if txn.in_sub_stmt == 0 {
            return;
        }
        txn.in_sub_stmt -= 1;
        let mark = txn.sub_stmt_begin[txn.in_sub_stmt];
        self.rollback_to_mark(id, mark);
    }

    /// Undo every statement after `mark`, newest first.
    fn rollback_to_mark(&mut self, id: TxnId, mark: usize) {
        let Some(mut txn) = self.txns.remove(&id) else { return };
        let mut cut = txn.cut_stmts(mark);
        while let Some(mut stmt) = cut.pop() {
            let idx = mark + cut.len();
            self.undo_stmt(&mut txn, idx, &mut stmt);
        }
        self.txns.insert(id, txn);
    }

    /// Undo one statement already detached from `txn`.
    fn undo_stmt(&mut self, txn: &mut Txn, idx: usize, stmt: &mut TxnStmt) {
        let id = txn.id;
        let sref = StmtRef { txn: id, stmt: idx };
        let mut retry = Vec::new();
        if let Some(del) = stmt.del_story.take() {
            self.store.unlink_delete(del, sref);
            retry.push(del);
        }
        if let Some(add) = stmt.add_story.take() {
            if let Some(space) = stmt.space.and_then(|s| self.spaces.get_mut(&s)) {
                let out = self.store.unlink_insert(space, add, id);
                for victim in out.victims {
                    self.mark_conflicted(victim);
                }
                for d in out.detached {
                    self.detach_delete(d, add);
                }
                retry.extend(out.retry);
            }
        }
        self.store.collect(&mut self.spaces, retry);

        txn.uncount_row(stmt);
        txn.region.release(stmt.region_size);
        if let (Some(engine), Some(_)) = (txn.engine.clone(), stmt.space) {
            engine.rollback_statement(txn, stmt);
        }
        if !stmt.on_rollback.is_empty() {
            let event = txn.event();
            if let Err(e) = stmt.on_rollback.run_reverse(&event) {
                fatal_trigger("rollback", id, &e);
            }
        }
    }

    /// Forget that statement `d` deletes a story that no longer exists.
    fn detach_delete(&mut self, d: StmtRef, story: StoryId) {
        if let Some(stmt) = self.txns.get_mut(&d.txn).and_then(|t| t.stmts.get_mut(d.stmt)) {
            if stmt.del_story == Some(story) {
                stmt.del_story = None;
            }
        }
    }

    fn cause_conflict(&mut self, wreaker: TxnId, victim: TxnId) -> Result<()> {
        if wreaker == victim {
            return Ok(());
        }
        if self.conflicts.contains(wreaker, victim) {
            self.conflicts.insert(wreaker, victim)?;
            return Ok(());
        }
        let txn = self.txns.get_mut(&victim).ok_or(TxnError::NoTransaction)?;
        txn.region.reserve(EDGE_SIZE, "conflict edge")?;
        if let Err(e) = self.conflicts.insert(wreaker, victim) {
            txn.region.release(EDGE_SIZE);
            return Err(e);
        }
        Ok(())
    }

    fn mark_conflicted(&mut self, victim: TxnId) {
        let Some(txn) = self.txns.get_mut(&victim) else { return };
        if txn.status != TxnStatus::InProgress {
            return;
        }
        txn.status = if txn.has_writes() {
            TxnStatus::Conflicted
        } else {
            TxnStatus::InReadView
        };
        self.counters.conflicted += 1;
        tracing::debug!(txn = victim, status = ?txn.status, "transaction lost a conflict");
    }

    // ---- reads -----------------------------------------------------------

    fn read(
        &mut self,
        reader: Option<TxnId>,
        sid: SpaceId,
        index: usize,
        head: TupleRef,
        prepared_ok: bool,
    ) -> Result<Option<TupleRef>> {
        let clarified = self.store.clarify(&head, index, reader, prepared_ok);
        if let (Some(r), Some(visible), false) = (reader, clarified.visible.as_ref(), clarified.own_change) {
            self.track_read(r, sid, visible)?;
        }
        Ok(clarified.visible)
    }

    fn track_read(&mut self, reader: TxnId, sid: SpaceId, tuple: &TupleRef) -> Result<()> {
        let space = self.spaces.get(&sid).ok_or(TxnError::NoSuchSpace(sid))?;
        let story = self.store.adopt(space, tuple)?;
        let cost = self.store.tracker_cost(reader, story);
        let txn = self.txns.get_mut(&reader).ok_or(TxnError::NoTransaction)?;
        if let Err(e) = txn.region.reserve(cost, "read tracker") {
            self.store.collect(&mut self.spaces, vec![story]);
            return Err(e);
        }
        if let Err(e) = self.store.track_read(reader, story) {
            txn.region.release(cost);
            self.store.collect(&mut self.spaces, vec![story]);
            return Err(e);
        }
        Ok(())
    }

    fn get(&mut self, reader: Option<TxnId>, sid: SpaceId, index: usize, key: &Key) -> Result<Option<TupleRef>> {
        let space = self.space(sid)?;
        if index >= space.index_count() {
            return Err(TxnError::InvalidRequest(format!("space {sid} has no index {index}")));
        }
        let Some(head) = space.index_get(index, key).cloned() else {
            return Ok(None);
        };
        self.read(reader, sid, index, head, reader.is_some())
    }

    fn select(&mut self, reader: Option<TxnId>, sid: SpaceId, index: usize) -> Result<Vec<TupleRef>> {
        let space = self.space(sid)?;
        if index >= space.index_count() {
            return Err(TxnError::InvalidRequest(format!("space {sid} has no index {index}")));
        }
        let heads: Vec<TupleRef> = space.index_iter(index).cloned().collect();
        let mut out = Vec::with_capacity(heads.len());
        for head in heads {
            if let Some(visible) = self.read(reader, sid, index, head, reader.is_some())? {
                out.push(visible);
            }
        }
        Ok(out)
    }

    // ---- commit path -----------------------------------------------------

    fn prepare(&mut self, id: TxnId) -> Result<()> {
        let psn = self.last_psn + 1;
        let txn = self.txn_mut(id)?;
        if txn.flags.aborted_by_yield {
            return Err(TxnError::TransactionYield);
        }
        if txn.fk_deferred_count != 0 {
            return Err(TxnError::ForeignKeyConstraint);
        }
        match txn.status {
            TxnStatus::InProgress | TxnStatus::InReadView => {}
            TxnStatus::Conflicted => return Err(TxnError::TransactionConflict),
            _ => return Err(TxnError::InvalidRequest("transaction is already finishing".into())),
        }
        if let Some(engine) = txn.engine.clone() {
            engine.prepare(txn)?;
        }

        let stories: Vec<(Option<StoryId>, Option<StoryId>)> = txn
            .stmts
            .iter()
            .filter(|s| s.add_story.is_some() || s.del_story.is_some())
            .map(|s| (s.add_story, s.del_story))
            .collect();
        let mut victims = Vec::new();
        for (add, del) in stories {
            victims.extend(self.store.prepare_stmt(add, del, id, psn));
        }
        victims.extend(self.conflicts.remove_from(id));
        for victim in victims {
            if victim != id {
                self.mark_conflicted(victim);
            }
        }

        self.last_psn = psn;
        let txn = self.txn_mut(id)?;
        txn.psn = psn;
        txn.status = TxnStatus::Prepared;
        txn.flags.can_yield = true;
        txn.start_tm = Some(Instant::now());
        tracing::debug!(txn = id, psn, "prepared");
        Ok(())
    }

    fn journal_entry_new(&mut self, id: TxnId) -> Result<JournalEntry> {
        let txn = self.txn_mut(id)?;
        let n_rows = txn.n_new_rows + txn.n_applier_rows;
        txn.region
            .reserve(n_rows * std::mem::size_of::<LogRow>(), "journal entry")?;
        let mut rows = Vec::new();
        rows.try_reserve_exact(n_rows)
            .map_err(|_| TxnError::oom(n_rows * std::mem::size_of::<LogRow>(), "journal entry"))?;
        // Applier rows go first so a replica acks what it applied in order.
        for applier in [true, false] {
            for stmt in txn.stmts.iter() {
                if stmt.row_is_applier() == Some(applier) {
                    rows.extend(stmt.row.clone());
                }
            }
        }
        Ok(JournalEntry::new(rows))
    }

    /// Hand statement triggers over to the transaction, in statement order.
    fn splice_stmt_triggers(&mut self, id: TxnId) -> Result<()> {
        let txn = self.txn_mut(id)?;
        for stmt in txn.stmts.iter_mut() {
            if stmt.has_triggers() {
                txn.on_commit.append(&mut stmt.on_commit);
                txn.on_rollback.append(&mut stmt.on_rollback);
            }
        }
        Ok(())
    }

    fn enter_limbo(&mut self, id: TxnId) -> Result<()> {
        let own = self.config.instance_id;
        let txn = self.txns.get_mut(&id).ok_or(TxnError::NoTransaction)?;
        if txn.flags.force_async {
            return Ok(());
        }
        let wait_ack = txn.stmts.iter().any(|s| s.is_sync);
        if !wait_ack && self.limbo.is_empty() {
            return Ok(());
        }
        let origin = txn
            .stmts
            .iter()
            .filter_map(|s| s.row.as_ref())
            .map(|r| r.header.replica_id)
            .find(|&r| r != 0)
            .unwrap_or(own);
        self.limbo.append(origin, id, wait_ack)?;
        txn.flags.wait_sync = true;
        txn.flags.wait_ack = wait_ack;
        Ok(())
    }

    /// Prepare and build the journal entry. None means the commit finished
    /// without touching the journal.
    fn commit_prepare(&mut self, id: TxnId, has_waiter: bool) -> Result<Option<JournalEntry>> {
        self.txn_mut(id)?.flags.has_waiter = has_waiter;
        self.prepare(id)?;
        self.splice_stmt_triggers(id)?;
        if self.txn(id)?.is_nop() {
            self.txn_mut(id)?.signature = TXN_SIGNATURE_NOP;
            self.counters.nop_commits += 1;
            self.complete(id);
            return Ok(None);
        }
        self.enter_limbo(id)?;
        let entry = match self.journal_entry_new(id) {
            Ok(entry) => entry,
            Err(e) => {
                self.limbo.remove(id);
                self.txn_mut(id)?.flags.wait_sync = false;
                return Err(e);
            }
        };
        self.txn_mut(id)?.flags.write_pending = true;
        Ok(Some(entry))
    }

    /// Finish a transaction whose outcome is in `signature`.
    fn complete(&mut self, id: TxnId) {
        let Some(mut txn) = self.txns.remove(&id) else { return };
        if txn.signature < 0 {
            txn.status = TxnStatus::Aborted;
            let mut stmts = std::mem::take(&mut txn.stmts);
            while let Some(mut stmt) = stmts.pop() {
                let idx = stmts.len();
                self.undo_stmt(&mut txn, idx, &mut stmt);
            }
            if let Some(engine) = txn.engine.clone() {
                engine.rollback(&mut txn);
            }
            let event = txn.event();
            if let Err(e) = txn.on_rollback.run_reverse(&event) {
                fatal_trigger("rollback", id, &e);
            }
            self.counters.rolled_back += 1;
            tracing::debug!(txn = id, signature = txn.signature, "rolled back");
        } else {
            txn.status = TxnStatus::Committed;
            let mut retry = Vec::new();
            for (idx, stmt) in txn.stmts.iter_mut().enumerate() {
                let (add, del) = (stmt.add_story.take(), stmt.del_story.take());
                if add.is_some() || del.is_some() {
                    self.store.commit_stmt(add, del, StmtRef { txn: id, stmt: idx });
                    retry.extend(add);
                    retry.extend(del);
                }
            }
            self.store.collect(&mut self.spaces, retry);
            if let Some(engine) = txn.engine.clone() {
                engine.commit(&mut txn);
            }
            let event = txn.event();
            if let Err(e) = txn.on_commit.run(&event) {
                fatal_trigger("commit", id, &e);
            }
            self.check_too_long(&txn);
            self.counters.committed += 1;
            tracing::debug!(txn = id, signature = txn.signature, psn = txn.psn, "committed");
        }
        txn.flags.done = true;
        if txn.flags.has_waiter || txn.flags.write_pending {
            self.txns.insert(id, txn);
        } else {
            self.free(txn);
        }
    }

    fn check_too_long(&mut self, txn: &Txn) {
        let Some(start) = txn.start_tm else { return };
        let elapsed = start.elapsed();
        if elapsed <= self.config.too_long_threshold() {
            return;
        }
        self.counters.too_long_writes += 1;
        if let Some(suppressed) = self.too_long_warn.check() {
            let rows = (txn.n_new_rows + txn.n_applier_rows) as i64;
            tracing::warn!(
                txn = txn.id,
                rows,
                first_lsn = txn.signature - rows + 1,
                elapsed_ms = elapsed.as_millis() as u64,
                suppressed,
                "too long WAL write"
            );
        }
    }

    fn free(&mut self, mut txn: Txn) {
        let id = txn.id;
        let pinned = self.store.release_reader(id);
        self.store.collect(&mut self.spaces, pinned);
        self.conflicts.remove_from(id);
        self.conflicts.remove_to(id);
        if self.txn_cache.len() < TXN_CACHE_MAX {
            txn.reset(0, self.config.txn_region_limit);
            self.txn_cache.push(txn);
        }
    }

    fn free_by_id(&mut self, id: TxnId) {
        if let Some(txn) = self.txns.remove(&id) {
            self.free(txn);
        }
    }

    /// Roll back a transaction that is not waiting on the journal.
    fn rollback(&mut self, id: TxnId) {
        let Some(txn) = self.txns.get_mut(&id) else { return };
        debug_assert!(!txn.flags.write_pending);
        txn.flags.has_waiter = false;
        txn.in_sub_stmt = 0;
        txn.signature = TXN_SIGNATURE_ROLLBACK;
        if txn.flags.wait_sync {
            txn.flags.wait_sync = false;
            self.limbo.remove(id);
        }
        self.complete(id);
    }

    /// The committing task takes its result and frees the transaction.
    fn finish_waiter(&mut self, id: TxnId) -> Result<()> {
        let mut txn = self.txns.remove(&id).ok_or(TxnError::NoTransaction)?;
        txn.flags.has_waiter = false;
        let signature = txn.signature;
        if txn.flags.write_pending {
            self.txns.insert(id, txn);
        } else {
            self.free(txn);
        }
        if signature >= 0 {
            Ok(())
        } else {
            Err(signature_error(signature))
        }
    }

    fn abort_in_limbo(&mut self, id: TxnId, signature: i64) {
        let Some(txn) = self.txns.get_mut(&id) else { return };
        txn.flags.wait_sync = false;
        txn.flags.wait_ack = false;
        if txn.flags.done {
            return;
        }
        txn.signature = signature;
        self.complete(id);
    }

    /// Journal completion for a transaction's entry.
    fn on_txn_written(&mut self, id: TxnId, res: i64) {
        let own = self.config.instance_id;
        let Some(txn) = self.txns.get_mut(&id) else { return };
        txn.flags.write_pending = false;
        if txn.flags.done {
            // Already rolled back by a limbo cascade.
            if !txn.flags.has_waiter {
                self.free_by_id(id);
            }
            return;
        }
        if res < 0 {
            tracing::error!(txn = id, "failed to write transaction to the journal");
            if txn.flags.wait_sync {
                for t in self.limbo.rollback_through(id) {
                    let signature = if t == id {
                        TXN_SIGNATURE_WRITE_ERROR
                    } else {
                        TXN_SIGNATURE_SYNC_ROLLBACK
                    };
                    self.abort_in_limbo(t, signature);
                }
            } else {
                txn.signature = TXN_SIGNATURE_WRITE_ERROR;
                self.complete(id);
            }
            return;
        }
        txn.signature = res;
        if !txn.flags.wait_sync {
            self.complete(id);
            return;
        }
        self.limbo.assign_lsn(id, res);
        if self.limbo.pop_ready_head(id) {
            self.abort_wait_flags(id);
            self.complete(id);
            return;
        }
        if self.limbo.owner() == own {
            self.ack(own, res);
        }
    }

    fn abort_wait_flags(&mut self, id: TxnId) {
        if let Some(txn) = self.txns.get_mut(&id) {
            txn.flags.wait_sync = false;
            txn.flags.wait_ack = false;
        }
    }

    // ---- limbo -----------------------------------------------------------

    fn ack(&mut self, replica_id: u32, lsn: i64) {
        if self.limbo.owner() != self.config.instance_id {
            tracing::debug!(replica_id, lsn, owner = self.limbo.owner(), "ack for a limbo we do not own");
            return;
        }
        if let Some(up_to) = self.limbo.ack(replica_id, lsn, self.config.synchro_quorum) {
            tracing::debug!(lsn = up_to, "quorum reached");
            self.outbox.push((RowType::Confirm, self.limbo.owner(), up_to));
        }
    }

    fn apply_confirm(&mut self, lsn: i64) {
        for t in self.limbo.confirm_up_to(lsn) {
            let Some(txn) = self.txns.get_mut(&t) else { continue };
            txn.flags.wait_sync = false;
            txn.flags.wait_ack = false;
            if !txn.flags.write_pending && !txn.flags.done {
                self.complete(t);
            }
        }
    }

    fn apply_rollback(&mut self, lsn: i64) {
        for t in self.limbo.rollback_after(lsn) {
            self.abort_in_limbo(t, TXN_SIGNATURE_SYNC_ROLLBACK);
        }
    }

    /// Quorum wait for `id` ran out. Flags it and everything queued after it
    /// and returns the ROLLBACK row to write; the entries are rolled back
    /// once that row is written.
    fn limbo_timeout(&mut self, id: TxnId) -> Option<(u32, i64)> {
        let lsn = self.limbo.entry(id)?.lsn;
        let cascaded = self.limbo.mark_rollback(id);
        tracing::warn!(txn = id, lsn, cascaded, "quorum collection timed out");
        Some((self.limbo.owner(), lsn - 1))
    }

    /// Quorum is there but no CONFIRM is in flight (the last one failed to
    /// write). Returns the CONFIRM row to write.
    fn limbo_reconfirm(&mut self) -> Option<(u32, i64)> {
        let lsn = self.limbo.reconfirm(self.config.synchro_quorum)?;
        tracing::info!(lsn, "writing CONFIRM again");
        Some((self.limbo.owner(), lsn))
    }

    fn waiting_for_quorum(&self, id: TxnId) -> bool {
        self.limbo.owner() == self.config.instance_id
            && self
                .limbo
                .entry(id)
                .map_or(false, |e| e.wait_ack && e.lsn >= 0 && !e.is_commit && !e.is_rollback)
    }

    fn on_synchro_written(&mut self, kind: RowType, lsn: i64, res: i64) {
        match (kind, res >= 0) {
            (RowType::Confirm, true) => self.apply_confirm(lsn),
            (RowType::Rollback, true) => {
                for t in self.limbo.rollback_after(lsn) {
                    self.abort_in_limbo(t, TXN_SIGNATURE_QUORUM_TIMEOUT);
                }
            }
            (RowType::Confirm, false) => {
                tracing::error!(lsn, "failed to write CONFIRM");
                self.limbo.unconfirm(lsn);
            }
            (RowType::Rollback, false) => {
                tracing::error!(lsn, "failed to write ROLLBACK");
                self.limbo.clear_rollback();
            }
            _ => {}
        }
    }

    // ---- savepoints ------------------------------------------------------

    fn rollback_to_savepoint(&mut self, id: TxnId, sp: SavepointId) -> Result<()> {
        let txn = self.txn(id)?;
        let pos = txn.savepoint_position(sp).ok_or(TxnError::NoSuchSavepoint)?;
        let savepoint = txn.savepoints[pos].clone();
        if savepoint.in_sub_stmt != txn.in_sub_stmt || savepoint.stmt_mark > txn.stmts.len() {
            return Err(TxnError::NoSuchSavepoint);
        }
        self.rollback_to_mark(id, savepoint.stmt_mark);
        let txn = self.txn_mut(id)?;
        if let Some(pos) = txn.savepoint_position(sp) {
            txn.savepoints.truncate(pos + 1);
        }
        txn.fk_deferred_count = savepoint.fk_deferred_count;
        Ok(())
    }

    fn on_yield(&mut self, id: TxnId) {
        let Some(txn) = self.txns.get_mut(&id) else { return };
        if txn.flags.can_yield || txn.flags.aborted_by_yield || txn.status != TxnStatus::InProgress {
            return;
        }
        txn.flags.aborted_by_yield = true;
        // Open statements are gone along with everything else.
        txn.in_sub_stmt = 0;
        txn.sub_stmt_begin = [0; TXN_SUB_STMT_MAX + 1];
        tracing::warn!(txn = id, "transaction rolled back by a yield");
        self.rollback_to_mark(id, 0);
    }

    fn stats(&self) -> TxManagerStats {
        TxManagerStats {
            active: self.txns.len(),
            started: self.counters.started,
            committed: self.counters.committed,
            rolled_back: self.counters.rolled_back,
            conflicted: self.counters.conflicted,
            nop_commits: self.counters.nop_commits,
            too_long_writes: self.counters.too_long_writes,
            conflict_edges: self.conflicts.len(),
            limbo_len: self.limbo.len(),
            confirmed_lsn: self.limbo.confirmed_lsn(),
            version_store: self.store.stats(),
        }
    }
}

struct Shared {
    state: Mutex<TxState>,
    cond: Condvar,
    journal: Arc<dyn Journal>,
    memtx: Arc<MemtxEngine>,
}

impl Shared {
    /// Release the lock, wake waiters, then write queued synchro rows.
    fn finish(self: &Arc<Self>, mut st: MutexGuard<'_, TxState>) {
        let rows = std::mem::take(&mut st.outbox);
        drop(st);
        self.cond.notify_all();
        for (kind, owner, lsn) in rows {
            self.write_synchro(kind, owner, lsn);
        }
    }

    fn with<R>(self: &Arc<Self>, f: impl FnOnce(&mut TxState) -> R) -> R {
        let mut st = self.state.lock();
        let r = f(&mut *st);
        self.finish(st);
        r
    }

    fn write_synchro(self: &Arc<Self>, kind: RowType, owner: u32, lsn: i64) {
        let row = match LogRow::synchro(kind, owner, lsn) {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(error = %e, ?kind, "failed to encode synchro row");
                return;
            }
        };
        let weak: Weak<Shared> = Arc::downgrade(self);
        let on_complete = Box::new(move |entry: JournalEntry| {
            if let Some(shared) = weak.upgrade() {
                shared.with(|st| st.on_synchro_written(kind, lsn, entry.res));
            }
        });
        if let Err(e) = self.journal.submit(JournalEntry::new(vec![row]), on_complete) {
            tracing::error!(error = %e, ?kind, lsn, "failed to submit synchro row");
            self.with(|st| st.on_synchro_written(kind, lsn, JOURNAL_WRITE_FAILED));
        }
    }

    fn submit(self: &Arc<Self>, id: TxnId, entry: JournalEntry) -> Result<()> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let on_complete = Box::new(move |entry: JournalEntry| {
            if let Some(shared) = weak.upgrade() {
                shared.with(|st| st.on_txn_written(id, entry.res));
            }
        });
        if let Err(e) = self.journal.submit(entry, on_complete) {
            tracing::warn!(txn = id, error = %e, "journal rejected the entry");
            self.with(|st| st.on_txn_written(id, JOURNAL_WRITE_FAILED));
            return Err(e);
        }
        Ok(())
    }

    fn commit(self: &Arc<Self>, id: TxnId) -> Result<()> {
        let mut st = self.state.lock();
        if st.txn(id)?.in_sub_stmt > 0 {
            return Err(TxnError::CommitInSubStatement);
        }
        let entry = match st.commit_prepare(id, true) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                let result = st.finish_waiter(id);
                self.finish(st);
                return result;
            }
            Err(e) => {
                st.rollback(id);
                self.finish(st);
                return Err(e);
            }
        };
        drop(st);
        // A rejected submission is reported through the signature below.
        let _ = self.submit(id, entry);

        let mut st = self.state.lock();
        let timeout = st.config.synchro_timeout();
        let mut deadline = None;
        loop {
            match st.txns.get(&id) {
                Some(txn) if !txn.flags.done => {}
                _ => break,
            }
            if !st.waiting_for_quorum(id) {
                deadline = None;
                self.cond.wait(&mut st);
                continue;
            }
            let at = *deadline.get_or_insert_with(|| Instant::now() + timeout);
            if !self.cond.wait_until(&mut st, at).timed_out() || !st.waiting_for_quorum(id) {
                continue;
            }
            deadline = None;
            let quorum = st.config.synchro_quorum;
            let row = if st.limbo.check_complete(id, quorum) {
                st.limbo_reconfirm().map(|(owner, lsn)| (RowType::Confirm, owner, lsn))
            } else {
                st.limbo_timeout(id).map(|(owner, lsn)| (RowType::Rollback, owner, lsn))
            };
            if let Some((kind, owner, lsn)) = row {
                MutexGuard::unlocked(&mut st, || self.write_synchro(kind, owner, lsn));
            }
        }
        let result = st.finish_waiter(id);
        self.finish(st);
        result
    }

    fn commit_async(self: &Arc<Self>, id: TxnId) -> Result<()> {
        let mut st = self.state.lock();
        if st.txn(id)?.in_sub_stmt > 0 {
            return Err(TxnError::CommitInSubStatement);
        }
        let entry = match st.commit_prepare(id, false) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.finish(st);
                return Ok(());
            }
            Err(e) => {
                st.rollback(id);
                self.finish(st);
                return Err(e);
            }
        };
        drop(st);
        self.submit(id, entry)
    }

    fn wait_confirm(self: &Arc<Self>) -> Result<()> {
        const PENDING: u8 = 0;
        const COMMITTED: u8 = 1;
        const ROLLED_BACK: u8 = 2;

        let outcome = Arc::new(AtomicU8::new(PENDING));
        let mut st = self.state.lock();
        let Some(last) = st.limbo.last_txn() else { return Ok(()) };
        let timeout = st.config.synchro_timeout();
        let txn = st.txn_mut(last)?;
        let on_commit = {
            let outcome = outcome.clone();
            txn.on_commit.add(Box::new(move |_| {
                outcome.store(COMMITTED, Ordering::Release);
                Ok(())
            }))
        };
        let on_rollback = {
            let outcome = outcome.clone();
            txn.on_rollback.add(Box::new(move |_| {
                outcome.store(ROLLED_BACK, Ordering::Release);
                Ok(())
            }))
        };
        let deadline = Instant::now() + timeout;
        loop {
            match outcome.load(Ordering::Acquire) {
                COMMITTED => break Ok(()),
                ROLLED_BACK => break Err(TxnError::SyncRollback),
                _ => {}
            }
            if self.cond.wait_until(&mut st, deadline).timed_out()
                && outcome.load(Ordering::Acquire) == PENDING
            {
                if let Some(txn) = st.txns.get_mut(&last) {
                    txn.on_commit.remove(on_commit);
                    txn.on_rollback.remove(on_rollback);
                }
                break Err(TxnError::SyncQuorumTimeout);
            }
        }
    }
}

thread_local! {
    /// Transaction bound to the current task, per manager.
    static CURRENT_TXN: RefCell<Vec<(usize, TxnId)>> = const { RefCell::new(Vec::new()) };
}

fn current_txn(manager: usize) -> Option<TxnId> {
    CURRENT_TXN.with(|c| c.borrow().iter().find(|(m, _)| *m == manager).map(|(_, id)| *id))
}

fn set_current_txn(manager: usize, txn: Option<TxnId>) {
    CURRENT_TXN.with(|c| {
        let mut c = c.borrow_mut();
        c.retain(|(m, _)| *m != manager);
        if let Some(id) = txn {
            c.push((manager, id));
        }
    });
}

/// Transaction manager handle. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TxManager {
    shared: Arc<Shared>,
}

impl TxManager {
    pub fn new(config: TxnConfig, journal: Arc<dyn Journal>) -> Result<Self> {
        config.validate()?;
        let memtx = Arc::new(MemtxEngine::new(config.memtx_use_mvcc_engine));
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TxState::new(config)),
                cond: Condvar::new(),
                journal,
                memtx,
            }),
        })
    }

    /// Manager over an in-memory journal stamped with our instance id.
    pub fn with_memory_journal(config: TxnConfig) -> Result<(Self, Arc<MemoryJournal>)> {
        let journal = Arc::new(MemoryJournal::new(config.instance_id));
        let manager = Self::new(config, journal.clone())?;
        Ok((manager, journal))
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    pub fn config(&self) -> TxnConfig {
        self.shared.state.lock().config.clone()
    }

    /// The memtx engine configured for this manager.
    pub fn memtx(&self) -> Arc<MemtxEngine> {
        self.shared.memtx.clone()
    }

    pub fn create_space(&self, def: SpaceDef) -> Result<SpaceId> {
        let mut st = self.shared.state.lock();
        if st.spaces.contains_key(&def.id) {
            return Err(TxnError::SpaceExists(def.id));
        }
        let id = def.id;
        let space = Space::new(def)?;
        st.spaces.insert(id, space);
        Ok(id)
    }

    pub fn on_replace(&self, space: SpaceId, trigger: ReplaceTrigger) -> Result<()> {
        let mut st = self.shared.state.lock();
        let space = st.spaces.get_mut(&space).ok_or(TxnError::NoSuchSpace(space))?;
        space.on_replace.push(trigger);
        Ok(())
    }

    pub fn set_run_triggers(&self, space: SpaceId, run: bool) -> Result<()> {
        let mut st = self.shared.state.lock();
        let space = st.spaces.get_mut(&space).ok_or(TxnError::NoSuchSpace(space))?;
        space.run_triggers = run;
        Ok(())
    }

    /// Start a transaction bound to the calling thread.
    pub fn begin(&self) -> Result<Transaction> {
        if current_txn(self.key()).is_some() {
            return Err(TxnError::ActiveTransaction);
        }
        let id = self.shared.state.lock().begin()?;
        set_current_txn(self.key(), Some(id));
        Ok(Transaction {
            manager: self.clone(),
            id,
            finished: false,
            _task: PhantomData,
        })
    }

    /// Id of the calling thread's transaction, -1 when there is none.
    pub fn current_txn_id(&self) -> TxnId {
        current_txn(self.key()).unwrap_or(-1)
    }

    pub fn in_txn(&self) -> bool {
        current_txn(self.key()).is_some()
    }

    /// Run one request in its own transaction.
    pub fn execute(&self, request: &Request) -> Result<Option<TupleRef>> {
        let mut txn = self.begin()?;
        let result = txn.execute(request)?;
        txn.commit()?;
        Ok(result)
    }

    /// Committed state only, without read tracking.
    pub fn get(&self, space: SpaceId, index: usize, key: &Key) -> Result<Option<TupleRef>> {
        self.shared.with(|st| st.get(None, space, index, key))
    }

    pub fn select(&self, space: SpaceId, index: usize) -> Result<Vec<TupleRef>> {
        self.shared.with(|st| st.select(None, space, index))
    }

    /// Acknowledgement from `replica_id` of everything up to `lsn`.
    pub fn limbo_ack(&self, replica_id: u32, lsn: i64) {
        self.shared.with(|st| st.ack(replica_id, lsn));
    }

    /// Wait until the newest limbo entry is resolved.
    pub fn limbo_wait_confirm(&self) -> Result<()> {
        self.shared.wait_confirm()
    }

    /// Apply a CONFIRM or ROLLBACK row received from the limbo owner.
    pub fn apply_synchro_row(&self, row: &LogRow) -> Result<()> {
        row.verify()?;
        let (_, lsn) = row
            .synchro_body()
            .ok_or_else(|| TxnError::InvalidRequest("not a synchro row".into()))?;
        match row.header.kind {
            RowType::Confirm => self.shared.with(|st| st.apply_confirm(lsn)),
            RowType::Rollback => self.shared.with(|st| st.apply_rollback(lsn)),
            kind => {
                return Err(TxnError::InvalidRequest(format!("{kind:?} is not a synchro row")))
            }
        }
        Ok(())
    }

    /// Sweep up to `budget` version-store slots; returns stories freed.
    pub fn collect_garbage(&self, budget: usize) -> usize {
        self.shared.with(|st| st.store.gc_step(&mut st.spaces, budget))
    }

    pub fn is_dirty(&self, tuple: &TupleRef) -> bool {
        self.shared.state.lock().store.is_dirty(tuple)
    }

    pub fn stats(&self) -> TxManagerStats {
        self.shared.state.lock().stats()
    }
}

/// A transaction owned by the thread that began it.
///
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    manager: TxManager,
    id: TxnId,
    finished: bool,
    _task: PhantomData<*const ()>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.finished
    }

    pub fn status(&self) -> Option<TxnStatus> {
        self.manager.shared.state.lock().txns.get(&self.id).map(Txn::status)
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.manager.shared
    }

    fn with<R>(&self, f: impl FnOnce(&mut TxState, TxnId) -> Result<R>) -> Result<R> {
        if self.finished {
            return Err(TxnError::NoTransaction);
        }
        let id = self.id;
        self.shared().with(|st| f(st, id))
    }

    fn finish_handle(&mut self) {
        self.finished = true;
        set_current_txn(self.manager.key(), None);
    }

    pub fn begin_statement(&mut self, space: Option<SpaceId>) -> Result<()> {
        self.with(|st, id| st.begin_stmt(id, space))
    }

    pub fn commit_statement(&mut self, request: &Request) -> Result<()> {
        self.with(|st, id| st.commit_stmt(id, request))
    }

    pub fn rollback_statement(&mut self) -> Result<()> {
        self.with(|st, id| {
            st.rollback_stmt(id);
            Ok(())
        })
    }

    /// Run the data change of the current statement.
    pub fn execute_in_statement(&mut self, request: &Request) -> Result<Option<TupleRef>> {
        self.with(|st, id| st.execute_dml(id, request))
    }

    /// Begin, execute and commit one statement.
    pub fn execute(&mut self, request: &Request) -> Result<Option<TupleRef>> {
        self.with(|st, id| {
            st.begin_stmt(id, request.space)?;
            let result = match st.execute_dml(id, request) {
                Ok(result) => result,
                Err(e) => {
                    st.rollback_stmt(id);
                    return Err(e);
                }
            };
            st.commit_stmt(id, request)?;
            Ok(result)
        })
    }

    pub fn insert(&mut self, space: SpaceId, tuple: Tuple) -> Result<Option<TupleRef>> {
        self.execute(&Request::insert(space, tuple))
    }

    pub fn replace(&mut self, space: SpaceId, tuple: Tuple) -> Result<Option<TupleRef>> {
        self.execute(&Request::replace(space, tuple))
    }

    pub fn delete(&mut self, space: SpaceId, key: Key) -> Result<Option<TupleRef>> {
        self.execute(&Request::delete(space, key))
    }

    pub fn get(&mut self, space: SpaceId, index: usize, key: &Key) -> Result<Option<TupleRef>> {
        self.with(|st, id| st.get(Some(id), space, index, key))
    }

    pub fn select(&mut self, space: SpaceId, index: usize) -> Result<Vec<TupleRef>> {
        self.with(|st, id| st.select(Some(id), space, index))
    }

    pub fn savepoint(&mut self, name: Option<&str>) -> Result<SavepointId> {
        self.with(|st, id| {
            let txn = st.txn_mut(id)?;
            let size = std::mem::size_of::<Savepoint>() + name.map_or(0, str::len);
            txn.region.reserve(size, "savepoint")?;
            Ok(txn.add_savepoint(name))
        })
    }

    pub fn savepoint_by_name(&self, name: &str) -> Result<Option<SavepointId>> {
        self.with(|st, id| Ok(st.txn(id)?.savepoint_by_name(name)))
    }

    pub fn rollback_to_savepoint(&mut self, savepoint: SavepointId) -> Result<()> {
        self.with(|st, id| st.rollback_to_savepoint(id, savepoint))
    }

    /// Forget `savepoint` and every savepoint taken after it.
    pub fn release_savepoint(&mut self, savepoint: SavepointId) -> Result<()> {
        self.with(|st, id| {
            let txn = st.txn_mut(id)?;
            let pos = txn.savepoint_position(savepoint).ok_or(TxnError::NoSuchSavepoint)?;
            txn.savepoints.truncate(pos);
            Ok(())
        })
    }

    /// Scratch buffer living as long as the transaction.
    pub fn alloc(&mut self, size: usize) -> Result<RegionSlot> {
        self.with(|st, id| st.txn_mut(id)?.region.alloc(size))
    }

    pub fn region_write(&mut self, slot: RegionSlot, offset: usize, data: &[u8]) -> Result<()> {
        self.with(|st, id| {
            let buf = st
                .txn_mut(id)?
                .region
                .get_mut(slot)
                .ok_or_else(|| TxnError::InvalidRequest("unknown region slot".into()))?;
            let end = offset
                .checked_add(data.len())
                .filter(|&end| end <= buf.len())
                .ok_or_else(|| TxnError::InvalidRequest("write past the end of a region slot".into()))?;
            buf[offset..end].copy_from_slice(data);
            Ok(())
        })
    }

    pub fn region_read(&self, slot: RegionSlot) -> Result<Vec<u8>> {
        self.with(|st, id| {
            st.txn(id)?
                .region
                .get(slot)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| TxnError::InvalidRequest("unknown region slot".into()))
        })
    }

    pub fn region_used(&self) -> Result<usize> {
        self.with(|st, id| Ok(st.txn(id)?.region.used()))
    }

    pub fn on_commit(&mut self, trigger: TxnTrigger) -> Result<TriggerId> {
        self.with(|st, id| Ok(st.txn_mut(id)?.on_commit.add(trigger)))
    }

    pub fn on_rollback(&mut self, trigger: TxnTrigger) -> Result<TriggerId> {
        self.with(|st, id| Ok(st.txn_mut(id)?.on_rollback.add(trigger)))
    }

    pub fn remove_trigger(&mut self, trigger: TriggerId) -> Result<bool> {
        self.with(|st, id| {
            let txn = st.txn_mut(id)?;
            Ok(txn.on_commit.remove(trigger) || txn.on_rollback.remove(trigger))
        })
    }

    /// Adjust the count of unresolved deferred foreign key violations.
    pub fn add_deferred_fk(&mut self, delta: i64) -> Result<()> {
        self.with(|st, id| {
            st.txn_mut(id)?.fk_deferred_count += delta;
            Ok(())
        })
    }

    /// Skip the limbo even if synchronous transactions are pending.
    pub fn set_force_async(&mut self, force: bool) -> Result<()> {
        self.with(|st, id| {
            st.txn_mut(id)?.flags.force_async = force;
            Ok(())
        })
    }

    /// The calling task is about to suspend.
    pub fn on_yield(&mut self) -> Result<()> {
        self.with(|st, id| {
            st.on_yield(id);
            Ok(())
        })
    }

    pub fn can_yield(&self) -> Result<bool> {
        self.with(|st, id| Ok(st.txn(id)?.can_yield()))
    }

    /// Reject operations that must run as the only statement.
    pub fn check_single_statement(&self, what: &str) -> Result<()> {
        self.with(|st, id| {
            if st.txn(id)?.stmts.is_empty() {
                Ok(())
            } else {
                Err(TxnError::MultiStatementTransaction(what.to_string()))
            }
        })
    }

    /// Mixes rows of local and replicated origin.
    pub fn is_distributed(&self) -> Result<bool> {
        self.with(|st, id| {
            let txn = st.txn(id)?;
            Ok(txn.n_applier_rows > 0 && txn.n_new_rows > txn.n_local_rows)
        })
    }

    /// (new, local, applier) row counts.
    pub fn row_counts(&self) -> Result<(usize, usize, usize)> {
        self.with(|st, id| {
            let txn = st.txn(id)?;
            Ok((txn.n_new_rows, txn.n_local_rows, txn.n_applier_rows))
        })
    }

    pub fn statement_count(&self) -> Result<usize> {
        self.with(|st, id| Ok(st.txn(id)?.statement_count()))
    }

    /// Commit and wait for durability (and quorum, when required).
    pub fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Err(TxnError::NoTransaction);
        }
        let result = self.shared().commit(self.id);
        if !matches!(result, Err(TxnError::CommitInSubStatement)) {
            self.finish_handle();
        }
        result
    }

    /// Commit without waiting for the journal.
    pub fn commit_async(&mut self) -> Result<()> {
        if self.finished {
            return Err(TxnError::NoTransaction);
        }
        let result = self.shared().commit_async(self.id);
        if !matches!(result, Err(TxnError::CommitInSubStatement)) {
            self.finish_handle();
        }
        result
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.with(|st, id| {
            if st.txn(id)?.in_sub_stmt > 0 {
                return Err(TxnError::RollbackInSubStatement);
            }
            st.rollback(id);
            Ok(())
        })?;
        self.finish_handle();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let id = self.id;
        self.shared().with(|st| st.rollback(id));
        self.finish_handle();
    }
}
