//! Journal interface and an in-memory journal
//!
//! A transaction becomes durable by submitting one [`JournalEntry`] holding
//! all of its rows. The journal completes entries strictly in submission
//! order and reports the outcome through the entry's `res`: the LSN of the
//! last row on success, negative on failure.
//!
//! ## Checksum Protection
//! - Every row carries a CRC32 over its bincode-encoded header and body
//! - [`MemoryJournal::rows`] re-verifies them when read back

use crate::types::{Key, ReplicationGroup, Tuple};
use crate::{Result, TxnError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Generic journal failure result.
pub const JOURNAL_WRITE_FAILED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowType {
    Insert,
    Replace,
    Delete,
    Nop,
    /// Synchronous transactions up to `lsn` are committed.
    Confirm,
    /// Synchronous transactions starting from `lsn` are rolled back.
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowHeader {
    pub kind: RowType,
    /// 0 for rows produced locally and not yet written; the origin instance
    /// otherwise.
    pub replica_id: u32,
    /// Assigned by the journal for local rows, kept for applier rows.
    pub lsn: i64,
    pub group_id: ReplicationGroup,
    /// Id of the transaction that produced the row.
    pub txn_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowBody {
    Tuple(Tuple),
    Key(Key),
    Synchro { replica_id: u32, lsn: i64 },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub header: RowHeader,
    pub body: RowBody,
    pub checksum: u32,
}

impl LogRow {
    pub fn new(header: RowHeader, body: RowBody) -> Result<Self> {
        let checksum = Self::compute_checksum(&header, &body)?;
        Ok(Self { header, body, checksum })
    }

    /// CONFIRM or ROLLBACK row. `replica_id` names the limbo owner, `lsn` the
    /// boundary.
    pub fn synchro(kind: RowType, replica_id: u32, lsn: i64) -> Result<Self> {
        debug_assert!(matches!(kind, RowType::Confirm | RowType::Rollback));
        let header = RowHeader {
            kind,
            replica_id: 0,
            lsn: 0,
            group_id: ReplicationGroup::Default,
            txn_id: 0,
        };
        Self::new(header, RowBody::Synchro { replica_id, lsn })
    }

    fn compute_checksum(header: &RowHeader, body: &RowBody) -> Result<u32> {
        let bytes = bincode::serialize(&(header, body))?;
        Ok(crc32fast::hash(&bytes))
    }

    /// Re-seal after the journal stamps header fields.
    fn reseal(&mut self) -> Result<()> {
        self.checksum = Self::compute_checksum(&self.header, &self.body)?;
        Ok(())
    }

    pub fn verify(&self) -> Result<()> {
        if Self::compute_checksum(&self.header, &self.body)? != self.checksum {
            return Err(TxnError::Serialization(format!(
                "checksum mismatch in row lsn {}",
                self.header.lsn
            )));
        }
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |n| n as usize)
    }

    /// (owner, lsn) of a CONFIRM / ROLLBACK row.
    pub fn synchro_body(&self) -> Option<(u32, i64)> {
        match self.body {
            RowBody::Synchro { replica_id, lsn } => Some((replica_id, lsn)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub rows: Vec<LogRow>,
    pub approx_len: usize,
    pub res: i64,
}

impl JournalEntry {
    pub fn new(rows: Vec<LogRow>) -> Self {
        let approx_len = rows.iter().map(LogRow::encoded_len).sum();
        Self { rows, approx_len, res: JOURNAL_WRITE_FAILED }
    }
}

/// Called exactly once per accepted entry, possibly on another thread and
/// possibly from inside `submit`.
pub type JournalCallback = Box<dyn FnOnce(JournalEntry) + Send>;

pub trait Journal: Send + Sync {
    /// Queue `entry`. An error means the entry was not accepted and the
    /// callback will never run.
    fn submit(&self, entry: JournalEntry, on_complete: JournalCallback) -> Result<()>;
}

/// Journal stats
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalStats {
    pub entries_written: u64,
    pub entries_failed: u64,
    pub rows_written: u64,
    pub bytes_written: u64,
}

struct JournalState {
    instance_id: u32,
    queue: VecDeque<(JournalEntry, JournalCallback)>,
    draining: bool,
    paused: bool,
    reject: bool,
    fail_next: usize,
    next_lsn: i64,
    written: Vec<LogRow>,
    stats: JournalStats,
}

impl JournalState {
    fn write(&mut self, entry: &mut JournalEntry) {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            entry.res = JOURNAL_WRITE_FAILED;
            self.stats.entries_failed += 1;
            return;
        }
        let mut res = 0;
        for row in entry.rows.iter_mut() {
            if row.header.replica_id == 0 {
                row.header.replica_id = self.instance_id;
                row.header.lsn = self.next_lsn;
                self.next_lsn += 1;
                if let Err(e) = row.reseal() {
                    tracing::error!(error = %e, "failed to seal journal row");
                    entry.res = JOURNAL_WRITE_FAILED;
                    self.stats.entries_failed += 1;
                    return;
                }
            }
            res = res.max(row.header.lsn);
        }
        self.written.extend(entry.rows.iter().cloned());
        self.stats.entries_written += 1;
        self.stats.rows_written += entry.rows.len() as u64;
        self.stats.bytes_written += entry.approx_len as u64;
        entry.res = res;
    }
}

/// Journal keeping rows in memory.
///
/// The first submitter becomes the writer and drains the queue in FIFO
/// order, running callbacks outside the lock; submissions made meanwhile
/// (including from callbacks) are picked up by the same drain. Pausing
/// holds entries in the queue, which is how tests keep writes in flight.
pub struct MemoryJournal {
    inner: Mutex<JournalState>,
}

impl MemoryJournal {
    pub fn new(instance_id: u32) -> Self {
        Self {
            inner: Mutex::new(JournalState {
                instance_id,
                queue: VecDeque::new(),
                draining: false,
                paused: false,
                reject: false,
                fail_next: 0,
                next_lsn: 1,
                written: Vec::new(),
                stats: JournalStats::default(),
            }),
        }
    }

    fn drain(&self) {
        loop {
            let (entry, on_complete) = {
                let mut st = self.inner.lock();
                if st.paused {
                    st.draining = false;
                    return;
                }
                match st.queue.pop_front() {
                    Some((mut entry, cb)) => {
                        st.write(&mut entry);
                        (entry, cb)
                    }
                    None => {
                        st.draining = false;
                        return;
                    }
                }
            };
            on_complete(entry);
        }
    }

    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    /// Resume writing and drain whatever queued up on this thread.
    pub fn resume(&self) {
        {
            let mut st = self.inner.lock();
            st.paused = false;
            if st.draining {
                return;
            }
            st.draining = true;
        }
        self.drain();
    }

    /// Fail the next `n` writes with a negative result.
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }

    /// Refuse submissions outright.
    pub fn reject_submissions(&self, reject: bool) {
        self.inner.lock().reject = reject;
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Next LSN this journal will hand out.
    pub fn next_lsn(&self) -> i64 {
        self.inner.lock().next_lsn
    }

    /// All rows written so far, checksums verified.
    pub fn rows(&self) -> Result<Vec<LogRow>> {
        let st = self.inner.lock();
        for row in &st.written {
            row.verify()?;
        }
        Ok(st.written.clone())
    }

    pub fn rows_of(&self, kind: RowType) -> Vec<LogRow> {
        self.inner
            .lock()
            .written
            .iter()
            .filter(|r| r.header.kind == kind)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> JournalStats {
        self.inner.lock().stats.clone()
    }
}

impl Journal for MemoryJournal {
    fn submit(&self, entry: JournalEntry, on_complete: JournalCallback) -> Result<()> {
        {
            let mut st = self.inner.lock();
            if st.reject {
                return Err(TxnError::WalIo);
            }
            st.queue.push_back((entry, on_complete));
            if st.draining || st.paused {
                return Ok(());
            }
            st.draining = true;
        }
        self.drain();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;
    use std::sync::Arc;

    fn insert_row(txn_id: i64) -> LogRow {
        let header = RowHeader {
            kind: RowType::Insert,
            replica_id: 0,
            lsn: 0,
            group_id: ReplicationGroup::Default,
            txn_id,
        };
        LogRow::new(header, RowBody::Tuple(tuple![txn_id])).unwrap()
    }

    fn collect_into(out: &Arc<Mutex<Vec<i64>>>) -> JournalCallback {
        let out = out.clone();
        Box::new(move |entry| out.lock().push(entry.res))
    }

    #[test]
    fn test_lsn_assignment() {
        let journal = MemoryJournal::new(1);
        let results = Arc::new(Mutex::new(Vec::new()));
        journal
            .submit(JournalEntry::new(vec![insert_row(1), insert_row(1)]), collect_into(&results))
            .unwrap();
        journal
            .submit(JournalEntry::new(vec![insert_row(2)]), collect_into(&results))
            .unwrap();
        assert_eq!(*results.lock(), vec![2, 3]);

        let rows = journal.rows().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.header.replica_id == 1));
        assert_eq!(journal.next_lsn(), 4);
    }

    #[test]
    fn test_pause_keeps_fifo_order() {
        let journal = MemoryJournal::new(1);
        let results = Arc::new(Mutex::new(Vec::new()));
        journal.pause();
        for i in 0..3 {
            journal
                .submit(JournalEntry::new(vec![insert_row(i)]), collect_into(&results))
                .unwrap();
        }
        assert_eq!(journal.pending(), 3);
        assert!(results.lock().is_empty());
        journal.resume();
        assert_eq!(*results.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_failure_injection() {
        let journal = MemoryJournal::new(1);
        let results = Arc::new(Mutex::new(Vec::new()));
        journal.fail_next(1);
        journal
            .submit(JournalEntry::new(vec![insert_row(1)]), collect_into(&results))
            .unwrap();
        journal
            .submit(JournalEntry::new(vec![insert_row(2)]), collect_into(&results))
            .unwrap();
        assert_eq!(*results.lock(), vec![JOURNAL_WRITE_FAILED, 1]);
        assert_eq!(journal.stats().entries_failed, 1);

        journal.reject_submissions(true);
        let err = journal
            .submit(JournalEntry::new(vec![insert_row(3)]), collect_into(&results))
            .unwrap_err();
        assert_eq!(err, TxnError::WalIo);
    }

    #[test]
    fn test_reentrant_submit_from_callback() {
        let journal = Arc::new(MemoryJournal::new(1));
        let results = Arc::new(Mutex::new(Vec::new()));
        let inner_journal = journal.clone();
        let inner_results = results.clone();
        journal
            .submit(
                JournalEntry::new(vec![insert_row(1)]),
                Box::new(move |entry| {
                    inner_results.lock().push(entry.res);
                    let row = LogRow::synchro(RowType::Confirm, 1, entry.res).unwrap();
                    let out = inner_results.clone();
                    inner_journal
                        .submit(JournalEntry::new(vec![row]), Box::new(move |e| out.lock().push(e.res)))
                        .unwrap();
                }),
            )
            .unwrap();
        assert_eq!(*results.lock(), vec![1, 2]);
        assert_eq!(journal.rows_of(RowType::Confirm)[0].synchro_body(), Some((1, 1)));
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut row = insert_row(1);
        row.verify().unwrap();
        row.header.lsn = 42;
        assert!(row.verify().is_err());
    }
}
