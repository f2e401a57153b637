//! Commit / rollback / on_replace trigger plumbing

use super::transaction::{TxnId, TxnStatus};
use crate::txn::journal::RowType;
use crate::types::{SpaceId, TupleRef};
use crate::Result;

pub type TriggerId = u64;

/// What a commit or rollback trigger sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnEvent {
    pub txn_id: TxnId,
    pub psn: i64,
    pub signature: i64,
    pub status: TxnStatus,
}

pub type TxnTrigger = Box<dyn FnMut(&TxnEvent) -> Result<()> + Send>;

/// Space trigger run when a statement commits (statement level, not
/// transaction level). An error rolls the statement back.
pub type ReplaceTrigger = Box<dyn FnMut(&mut ReplaceEvent<'_>) -> Result<()> + Send>;

pub struct ReplaceEvent<'a> {
    pub txn_id: TxnId,
    pub space_id: SpaceId,
    pub row_type: RowType,
    pub old: Option<&'a TupleRef>,
    pub new: Option<&'a TupleRef>,
    pub(crate) on_commit: &'a mut TriggerList,
    pub(crate) on_rollback: &'a mut TriggerList,
}

impl ReplaceEvent<'_> {
    /// Run `f` when the transaction owning this statement commits.
    pub fn on_commit(&mut self, f: TxnTrigger) {
        self.on_commit.add(f);
    }

    /// Run `f` if this statement is rolled back, alone or with its transaction.
    pub fn on_rollback(&mut self, f: TxnTrigger) {
        self.on_rollback.add(f);
    }
}

#[derive(Default)]
pub struct TriggerList {
    items: Vec<(TriggerId, TxnTrigger)>,
    next_id: TriggerId,
}

impl TriggerList {
    pub fn add(&mut self, trigger: TxnTrigger) -> TriggerId {
        self.next_id += 1;
        self.items.push((self.next_id, trigger));
        self.next_id
    }

    pub fn remove(&mut self, id: TriggerId) -> bool {
        match self.items.iter().position(|(tid, _)| *tid == id) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Move all of `other` to the end of this list, keeping their order.
    pub fn append(&mut self, other: &mut TriggerList) {
        for (_, trigger) in other.items.drain(..) {
            self.add(trigger);
        }
    }

    /// Run in registration order, stopping at the first failure.
    pub fn run(&mut self, event: &TxnEvent) -> Result<()> {
        for (_, trigger) in self.items.iter_mut() {
            trigger(event)?;
        }
        Ok(())
    }

    /// Run newest first, stopping at the first failure.
    pub fn run_reverse(&mut self, event: &TxnEvent) -> Result<()> {
        for (_, trigger) in self.items.iter_mut().rev() {
            trigger(event)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TriggerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerList").field("len", &self.items.len()).finish()
    }
}
