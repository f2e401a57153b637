//! Synchronous replication queue ("limbo")
//!
//! Transactions that need quorum acknowledgement (and asynchronous ones
//! committed while such transactions are pending) queue here in commit
//! order. An entry leaves the queue from the head when a CONFIRM covers it,
//! or from the tail on ROLLBACK. This module is the bookkeeping only; the
//! coordinator decides what completing a transaction means.

use super::transaction::TxnId;
use crate::{Result, TxnError};
use ahash::AHashMap;
use std::collections::VecDeque;

/// Entry not written to the journal yet.
pub const LSN_UNASSIGNED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimboEntry {
    pub txn: TxnId,
    pub lsn: i64,
    pub ack_count: usize,
    /// Needs quorum; false for asynchronous transactions riding along.
    pub wait_ack: bool,
    pub is_commit: bool,
    pub is_rollback: bool,
}

/// Highest LSN acknowledged per replica.
#[derive(Debug, Clone, Default)]
pub struct VClock {
    components: AHashMap<u32, i64>,
}

impl VClock {
    pub fn get(&self, replica_id: u32) -> i64 {
        self.components.get(&replica_id).copied().unwrap_or(0)
    }

    pub fn follow(&mut self, replica_id: u32, lsn: i64) {
        let slot = self.components.entry(replica_id).or_insert(0);
        if lsn > *slot {
            *slot = lsn;
        }
    }

    /// Replicas that have seen `lsn`.
    pub fn count_at_least(&self, lsn: i64) -> usize {
        self.components.values().filter(|&&v| v >= lsn).count()
    }
}

#[derive(Debug, Default)]
pub struct Limbo {
    queue: VecDeque<LimboEntry>,
    /// Instance whose transactions currently occupy the queue; 0 = none yet.
    owner: u32,
    vclock: VClock,
    confirmed_lsn: i64,
}

impl Limbo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn confirmed_lsn(&self) -> i64 {
        self.confirmed_lsn
    }

    pub fn vclock(&self) -> &VClock {
        &self.vclock
    }

    pub fn entries(&self) -> impl Iterator<Item = &LimboEntry> {
        self.queue.iter()
    }

    pub fn entry(&self, txn: TxnId) -> Option<&LimboEntry> {
        self.queue.iter().find(|e| e.txn == txn)
    }

    pub fn last_txn(&self) -> Option<TxnId> {
        self.queue.back().map(|e| e.txn)
    }

    /// Queue a transaction originating from instance `origin`. Only one
    /// instance may have entries queued at a time.
    pub fn append(&mut self, origin: u32, txn: TxnId, wait_ack: bool) -> Result<()> {
        if !self.queue.is_empty() && self.owner != origin {
            return Err(TxnError::UncommittedForeignSyncTxns(self.owner));
        }
        self.queue
            .try_reserve(1)
            .map_err(|_| TxnError::oom(std::mem::size_of::<LimboEntry>(), "txn limbo entry"))?;
        self.owner = origin;
        self.queue.push_back(LimboEntry {
            txn,
            lsn: LSN_UNASSIGNED,
            ack_count: 0,
            wait_ack,
            is_commit: false,
            is_rollback: false,
        });
        Ok(())
    }

    /// Drop an entry whose journal write never started.
    pub fn remove(&mut self, txn: TxnId) -> bool {
        match self.queue.iter().position(|e| e.txn == txn) {
            Some(pos) => {
                debug_assert_eq!(pos + 1, self.queue.len(), "only the newest entry can be removed");
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Acks that arrived before the LSN was known count immediately.
    pub fn assign_lsn(&mut self, txn: TxnId, lsn: i64) {
        if let Some(e) = self.queue.iter_mut().find(|e| e.txn == txn) {
            e.lsn = lsn;
            if e.wait_ack {
                e.ack_count = self.vclock.count_at_least(lsn);
            }
        }
    }

    /// Record that `replica_id` has everything up to `lsn`. Returns the LSN
    /// to CONFIRM if some entries reached quorum with this ack. An entry is
    /// reported at most once.
    pub fn ack(&mut self, replica_id: u32, lsn: i64, quorum: usize) -> Option<i64> {
        if self.queue.is_empty() {
            return None;
        }
        let prev = self.vclock.get(replica_id);
        if lsn <= prev {
            return None;
        }
        self.vclock.follow(replica_id, lsn);

        let mut last_quorum = None;
        let mut blocked = false;
        for e in self.queue.iter_mut() {
            if e.lsn == LSN_UNASSIGNED || e.lsn > lsn {
                break;
            }
            if e.wait_ack && !e.is_commit && e.lsn > prev {
                e.ack_count += 1;
            }
            // A ROLLBACK is being written for this entry and all after it.
            if e.is_rollback {
                break;
            }
            if e.is_commit || blocked {
                continue;
            }
            // Commits happen in queue order.
            if e.wait_ack && e.ack_count < quorum {
                blocked = true;
                continue;
            }
            e.is_commit = true;
            last_quorum = Some(e.lsn);
        }
        last_quorum
    }

    /// Recompute an entry's ack count from the vector clock.
    pub fn check_complete(&mut self, txn: TxnId, quorum: usize) -> bool {
        let Some(e) = self.queue.iter_mut().find(|e| e.txn == txn) else {
            return false;
        };
        if e.is_commit {
            return true;
        }
        if e.lsn == LSN_UNASSIGNED {
            return false;
        }
        e.ack_count = e.ack_count.max(self.vclock.count_at_least(e.lsn));
        e.ack_count >= quorum
    }

    /// Clear the commit mark of entries a failed CONFIRM was meant to cover.
    pub fn unconfirm(&mut self, lsn: i64) {
        for e in self.queue.iter_mut() {
            if e.lsn == LSN_UNASSIGNED || e.lsn > lsn {
                break;
            }
            e.is_commit = false;
        }
    }

    /// Mark for commit every entry that has quorum but no CONFIRM in flight,
    /// in queue order. Returns the LSN a new CONFIRM must cover.
    pub fn reconfirm(&mut self, quorum: usize) -> Option<i64> {
        let vclock = &self.vclock;
        let mut last = None;
        for e in self.queue.iter_mut() {
            if e.lsn == LSN_UNASSIGNED || e.is_rollback {
                break;
            }
            if e.is_commit {
                continue;
            }
            if e.wait_ack {
                e.ack_count = e.ack_count.max(vclock.count_at_least(e.lsn));
                if e.ack_count < quorum {
                    break;
                }
            }
            e.is_commit = true;
            last = Some(e.lsn);
        }
        last
    }

    /// Flag `txn` and every newer entry as being rolled back; acks no longer
    /// confirm them. Returns how many entries were flagged.
    pub fn mark_rollback(&mut self, txn: TxnId) -> usize {
        let Some(pos) = self.queue.iter().position(|e| e.txn == txn) else {
            return 0;
        };
        for e in self.queue.iter_mut().skip(pos) {
            e.is_rollback = true;
        }
        self.queue.len() - pos
    }

    /// The ROLLBACK write failed: the flagged entries wait for acks again.
    pub fn clear_rollback(&mut self) {
        for e in self.queue.iter_mut() {
            e.is_rollback = false;
        }
    }

    /// Dequeue everything a CONFIRM for `lsn` covers: sync entries up to
    /// `lsn` and asynchronous entries not behind a later sync one.
    pub fn confirm_up_to(&mut self, lsn: i64) -> Vec<TxnId> {
        let mut confirmed = Vec::new();
        while let Some(e) = self.queue.front() {
            if e.wait_ack && (e.lsn == LSN_UNASSIGNED || e.lsn > lsn) {
                break;
            }
            if let Some(e) = self.queue.pop_front() {
                confirmed.push(e.txn);
            }
        }
        self.confirmed_lsn = self.confirmed_lsn.max(lsn);
        confirmed
    }

    /// Dequeue from the tail every entry newer than `lsn`, unwritten entries
    /// included. Newest first.
    pub fn rollback_after(&mut self, lsn: i64) -> Vec<TxnId> {
        let mut rolled = Vec::new();
        while let Some(e) = self.queue.back() {
            if e.lsn != LSN_UNASSIGNED && e.lsn <= lsn {
                break;
            }
            if let Some(e) = self.queue.pop_back() {
                rolled.push(e.txn);
            }
        }
        rolled
    }

    /// Dequeue from the tail up to and including `txn`. Newest first.
    pub fn rollback_through(&mut self, txn: TxnId) -> Vec<TxnId> {
        if self.entry(txn).is_none() {
            return Vec::new();
        }
        let mut rolled = Vec::new();
        while let Some(mut e) = self.queue.pop_back() {
            e.is_rollback = true;
            rolled.push(e.txn);
            if e.txn == txn {
                break;
            }
        }
        rolled
    }

    /// Pop the head if it is `txn` and needs no acks (an asynchronous entry
    /// with nothing pending in front of it).
    pub fn pop_ready_head(&mut self, txn: TxnId) -> bool {
        match self.queue.front() {
            Some(e) if e.txn == txn && !e.wait_ack => {
                self.queue.pop_front();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limbo_with(entries: &[(TxnId, i64, bool)]) -> Limbo {
        let mut limbo = Limbo::new();
        for &(txn, lsn, wait_ack) in entries {
            limbo.append(1, txn, wait_ack).unwrap();
            limbo.assign_lsn(txn, lsn);
        }
        limbo
    }

    #[test]
    fn test_foreign_owner_rejected() {
        let mut limbo = Limbo::new();
        limbo.append(1, 10, true).unwrap();
        let err = limbo.append(2, 11, true).unwrap_err();
        assert_eq!(err, TxnError::UncommittedForeignSyncTxns(1));
        limbo.rollback_through(10);
        limbo.append(2, 11, true).unwrap();
        assert_eq!(limbo.owner(), 2);
    }

    #[test]
    fn test_quorum_confirms_once() {
        let mut limbo = limbo_with(&[(10, 5, true)]);
        assert_eq!(limbo.ack(1, 5, 3), None);
        assert_eq!(limbo.ack(2, 5, 3), None);
        assert_eq!(limbo.ack(3, 5, 3), Some(5));
        assert_eq!(limbo.ack(4, 5, 3), None);
        assert_eq!(limbo.confirm_up_to(5), vec![10]);
        assert!(limbo.is_empty());
        assert_eq!(limbo.confirmed_lsn(), 5);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let mut limbo = limbo_with(&[(10, 5, true)]);
        limbo.ack(2, 5, 3);
        limbo.ack(2, 4, 3);
        limbo.ack(2, 5, 3);
        assert_eq!(limbo.entry(10).unwrap().ack_count, 1);
    }

    #[test]
    fn test_async_rides_along() {
        let mut limbo = limbo_with(&[(10, 5, true), (11, 6, false), (12, 7, true)]);
        assert_eq!(limbo.ack(1, 7, 2), None);
        // Replica 2 has only 6: entry 10 and its follower 11 commit.
        assert_eq!(limbo.ack(2, 6, 2), Some(6));
        assert_eq!(limbo.confirm_up_to(6), vec![10, 11]);
        assert_eq!(limbo.len(), 1);
        assert_eq!(limbo.ack(2, 7, 2), Some(7));
    }

    #[test]
    fn test_unwritten_entries_block_confirm() {
        let mut limbo = limbo_with(&[(10, 5, true)]);
        limbo.append(1, 11, true).unwrap();
        limbo.ack(1, 5, 2);
        assert_eq!(limbo.ack(2, 9, 2), Some(5));
        assert_eq!(limbo.confirm_up_to(5), vec![10]);
        assert_eq!(limbo.last_txn(), Some(11));
    }

    #[test]
    fn test_ack_before_lsn_assigned() {
        let mut limbo = Limbo::new();
        limbo.append(1, 10, true).unwrap();
        assert_eq!(limbo.ack(2, 5, 2), None);
        limbo.assign_lsn(10, 5);
        assert_eq!(limbo.entry(10).unwrap().ack_count, 1);
        assert_eq!(limbo.ack(1, 5, 2), Some(5));
    }

    #[test]
    fn test_rollback_from_tail() {
        let mut limbo = limbo_with(&[(10, 5, true), (11, 6, true), (12, 7, true)]);
        limbo.append(1, 13, false).unwrap();
        assert_eq!(limbo.rollback_after(5), vec![13, 12, 11]);
        assert_eq!(limbo.len(), 1);

        let mut limbo = limbo_with(&[(10, 5, true), (11, 6, true), (12, 7, true)]);
        assert_eq!(limbo.rollback_through(11), vec![12, 11]);
        assert_eq!(limbo.last_txn(), Some(10));
        assert!(limbo.rollback_through(99).is_empty());
    }

    #[test]
    fn test_check_complete_uses_vclock() {
        let mut limbo = limbo_with(&[(10, 5, true)]);
        limbo.vclock.follow(1, 5);
        limbo.vclock.follow(2, 8);
        limbo.vclock.follow(3, 4);
        assert!(limbo.check_complete(10, 2));
        assert!(!limbo.check_complete(10, 3));
    }

    #[test]
    fn test_reconfirm_after_failed_confirm() {
        let mut limbo = limbo_with(&[(10, 5, true), (11, 6, true)]);
        limbo.ack(1, 6, 2);
        assert_eq!(limbo.ack(2, 5, 2), Some(5));
        // A CONFIRM is in flight.
        assert_eq!(limbo.reconfirm(2), None);
        limbo.unconfirm(5);
        assert_eq!(limbo.reconfirm(2), Some(5));
        assert_eq!(limbo.reconfirm(2), None);
        assert_eq!(limbo.confirm_up_to(5), vec![10]);
    }

    #[test]
    fn test_rollback_in_progress_blocks_confirm() {
        let mut limbo = limbo_with(&[(10, 5, true), (11, 6, true)]);
        assert_eq!(limbo.mark_rollback(11), 1);
        assert_eq!(limbo.mark_rollback(99), 0);
        assert_eq!(limbo.ack(1, 6, 1), Some(5));
        assert!(!limbo.entry(11).unwrap().is_commit);
        assert_eq!(limbo.reconfirm(1), None);

        limbo.clear_rollback();
        assert_eq!(limbo.reconfirm(1), Some(6));
    }

    #[test]
    fn test_pop_ready_head() {
        let mut limbo = limbo_with(&[(10, 5, false), (11, 6, false)]);
        assert!(!limbo.pop_ready_head(11));
        assert!(limbo.pop_ready_head(10));
        assert!(limbo.pop_ready_head(11));
    }

    proptest! {
        /// Whatever order replicas acknowledge in, every entry is confirmed
        /// exactly once and confirmations only move forward.
        #[test]
        fn prop_each_entry_confirmed_once(
            steps in proptest::collection::vec((2u32..5, 1i64..=6), 1..40),
        ) {
            let quorum = 3;
            let mut limbo = limbo_with(&[
                (10, 1, true), (11, 2, true), (12, 3, false),
                (13, 4, true), (14, 5, true), (15, 6, true),
            ]);
            for lsn in 1..=6 {
                limbo.ack(1, lsn, quorum);
            }
            let mut confirmed = Vec::new();
            let mut last = 0;
            let mut acked: AHashMap<u32, i64> = AHashMap::new();
            for (replica, lsn) in steps.into_iter().chain((2u32..5).map(|r| (r, 6))) {
                let top = acked.entry(replica).or_insert(0);
                *top = (*top).max(lsn);
                if let Some(up_to) = limbo.ack(replica, lsn, quorum) {
                    prop_assert!(up_to > last);
                    last = up_to;
                    confirmed.extend(limbo.confirm_up_to(up_to));
                }
                // A sync entry is committed iff quorum - 1 replicas have it.
                for e in limbo.entries() {
                    let have = acked.values().filter(|&&v| v >= e.lsn).count() + 1;
                    if e.wait_ack && have < quorum {
                        prop_assert!(!e.is_commit);
                    }
                }
            }
            prop_assert_eq!(confirmed, vec![10, 11, 12, 13, 14, 15]);
            prop_assert!(limbo.is_empty());
        }
    }
}
