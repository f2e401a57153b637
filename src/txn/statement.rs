//! Statements and data-change requests

use super::journal::{LogRow, RowBody, RowHeader, RowType};
use super::trigger::TriggerList;
use super::version_store::StoryId;
use crate::types::{DupMode, Key, ReplicationGroup, SpaceId, Tuple, TupleRef};
use crate::{Result, TxnError};

/// Nesting limit for statements started from triggers.
pub const TXN_SUB_STMT_MAX: usize = 3;

/// A data-change request as it arrives from a client or the applier.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RowType,
    pub space: Option<SpaceId>,
    pub mode: DupMode,
    pub tuple: Option<Tuple>,
    pub key: Option<Key>,
    /// Set for rows replicated from another instance.
    pub origin: Option<(u32, i64)>,
}

impl Request {
    /// Insert; fails on a duplicate key.
    pub fn insert(space: SpaceId, tuple: Tuple) -> Self {
        Self::write(RowType::Insert, space, DupMode::Insert, tuple)
    }

    /// Insert or overwrite.
    pub fn replace(space: SpaceId, tuple: Tuple) -> Self {
        Self::write(RowType::Replace, space, DupMode::ReplaceOrInsert, tuple)
    }

    /// Overwrite; fails when the key is absent.
    pub fn update(space: SpaceId, tuple: Tuple) -> Self {
        Self::write(RowType::Replace, space, DupMode::Replace, tuple)
    }

    fn write(kind: RowType, space: SpaceId, mode: DupMode, tuple: Tuple) -> Self {
        Self { kind, space: Some(space), mode, tuple: Some(tuple), key: None, origin: None }
    }

    pub fn delete(space: SpaceId, key: Key) -> Self {
        Self {
            kind: RowType::Delete,
            space: Some(space),
            mode: DupMode::Replace,
            tuple: None,
            key: Some(key),
            origin: None,
        }
    }

    /// Empty statement. Still produces a log row.
    pub fn nop() -> Self {
        Self {
            kind: RowType::Nop,
            space: None,
            mode: DupMode::Insert,
            tuple: None,
            key: None,
            origin: None,
        }
    }

    /// Mark the request as replicated from `replica_id` at `lsn`.
    pub fn from_replica(mut self, replica_id: u32, lsn: i64) -> Self {
        self.origin = Some((replica_id, lsn));
        self
    }

    pub(crate) fn to_row(&self, txn_id: i64, group_id: ReplicationGroup) -> Result<LogRow> {
        let body = match self.kind {
            RowType::Insert | RowType::Replace => RowBody::Tuple(
                self.tuple
                    .clone()
                    .ok_or_else(|| TxnError::InvalidRequest("write without a tuple".into()))?,
            ),
            RowType::Delete => RowBody::Key(
                self.key
                    .clone()
                    .ok_or_else(|| TxnError::InvalidRequest("delete without a key".into()))?,
            ),
            RowType::Nop => RowBody::Empty,
            RowType::Confirm | RowType::Rollback => {
                return Err(TxnError::InvalidRequest(
                    "synchro rows are not data statements".into(),
                ))
            }
        };
        let (replica_id, lsn) = self.origin.unwrap_or((0, 0));
        LogRow::new(RowHeader { kind: self.kind, replica_id, lsn, group_id, txn_id }, body)
    }
}

/// One statement of a transaction.
#[derive(Debug, Default)]
pub struct TxnStmt {
    pub(crate) space: Option<SpaceId>,
    pub(crate) is_sync: bool,
    pub(crate) old_tuple: Option<TupleRef>,
    pub(crate) new_tuple: Option<TupleRef>,
    /// Story created by this statement's insert.
    pub(crate) add_story: Option<StoryId>,
    /// Story this statement deletes (or replaces).
    pub(crate) del_story: Option<StoryId>,
    pub(crate) row: Option<LogRow>,
    pub(crate) on_commit: TriggerList,
    pub(crate) on_rollback: TriggerList,
    pub(crate) region_size: usize,
}

impl TxnStmt {
    pub(crate) fn new(region_size: usize) -> Self {
        Self { region_size, ..Default::default() }
    }

    pub fn space(&self) -> Option<SpaceId> {
        self.space
    }

    pub fn old_tuple(&self) -> Option<&TupleRef> {
        self.old_tuple.as_ref()
    }

    pub fn new_tuple(&self) -> Option<&TupleRef> {
        self.new_tuple.as_ref()
    }

    pub fn row(&self) -> Option<&LogRow> {
        self.row.as_ref()
    }

    pub fn has_triggers(&self) -> bool {
        !self.on_commit.is_empty() || !self.on_rollback.is_empty()
    }

    /// Row origin class: `None` when no row, `Some(true)` for applier rows.
    pub(crate) fn row_is_applier(&self) -> Option<bool> {
        self.row.as_ref().map(|r| r.header.replica_id != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn test_request_rows() {
        let row = Request::insert(1, tuple![1i64]).to_row(7, ReplicationGroup::Default).unwrap();
        assert_eq!(row.header.kind, RowType::Insert);
        assert_eq!(row.header.replica_id, 0);
        assert_eq!(row.header.txn_id, 7);
        row.verify().unwrap();

        let row = Request::delete(1, tuple![1i64])
            .from_replica(2, 40)
            .to_row(7, ReplicationGroup::Local)
            .unwrap();
        assert_eq!((row.header.replica_id, row.header.lsn), (2, 40));
        assert_eq!(row.body, RowBody::Key(tuple![1i64]));

        let nop = Request::nop().to_row(1, ReplicationGroup::Default).unwrap();
        assert_eq!(nop.body, RowBody::Empty);
    }

    #[test]
    fn test_malformed_request() {
        let mut req = Request::insert(1, tuple![1i64]);
        req.tuple = None;
        assert!(matches!(
            req.to_row(1, ReplicationGroup::Default),
            Err(TxnError::InvalidRequest(_))
        ));
    }
}
