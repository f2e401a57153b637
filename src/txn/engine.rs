//! Storage engine hooks
//!
//! A transaction is bound to at most one engine. Engines that do not take
//! part in transactions (`bypass_tx`) can be mixed with any other.

use super::statement::TxnStmt;
use super::transaction::Txn;
use crate::types::StorageKind;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn storage(&self) -> StorageKind {
        StorageKind::Memory
    }

    /// Engine does not participate in transactions at all.
    fn bypass_tx(&self) -> bool {
        false
    }

    fn begin(&self, _txn: &mut Txn) -> Result<()> {
        Ok(())
    }

    fn begin_statement(&self, _txn: &mut Txn) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _txn: &mut Txn) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _txn: &mut Txn) {}

    /// Undo one statement; it has already been cut from the transaction.
    fn rollback_statement(&self, _txn: &mut Txn, _stmt: &mut TxnStmt) {}

    fn rollback(&self, _txn: &mut Txn) {}
}

/// Identity comparison for engine handles.
pub fn same_engine(a: &Arc<dyn Engine>, b: &Arc<dyn Engine>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Memtx engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemtxStats {
    pub begun: u64,
    pub prepared: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub statements_rolled_back: u64,
}

/// In-memory engine backed by the version store.
#[derive(Debug, Default)]
pub struct MemtxEngine {
    use_mvcc: bool,
    begun: AtomicU64,
    prepared: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    statements_rolled_back: AtomicU64,
}

impl MemtxEngine {
    /// Without MVCC a memtx transaction must not yield.
    pub fn new(use_mvcc: bool) -> Self {
        Self { use_mvcc, ..Default::default() }
    }

    pub fn use_mvcc(&self) -> bool {
        self.use_mvcc
    }

    pub fn stats(&self) -> MemtxStats {
        MemtxStats {
            begun: self.begun.load(Ordering::Relaxed),
            prepared: self.prepared.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            statements_rolled_back: self.statements_rolled_back.load(Ordering::Relaxed),
        }
    }
}

impl Engine for MemtxEngine {
    fn name(&self) -> &str {
        "memtx"
    }

    fn begin(&self, txn: &mut Txn) -> Result<()> {
        self.begun.fetch_add(1, Ordering::Relaxed);
        if !self.use_mvcc {
            txn.set_can_yield(false);
        }
        Ok(())
    }

    fn prepare(&self, _txn: &mut Txn) -> Result<()> {
        self.prepared.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn commit(&self, _txn: &mut Txn) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    fn rollback_statement(&self, _txn: &mut Txn, _stmt: &mut TxnStmt) {
        self.statements_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    fn rollback(&self, _txn: &mut Txn) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }
}

/// Engine that stores nothing and only produces log rows.
#[derive(Debug, Default)]
pub struct BlackholeEngine;

impl Engine for BlackholeEngine {
    fn name(&self) -> &str {
        "blackhole"
    }

    fn storage(&self) -> StorageKind {
        StorageKind::Discard
    }

    fn bypass_tx(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_engine_is_identity() {
        let a: Arc<dyn Engine> = Arc::new(MemtxEngine::new(true));
        let b: Arc<dyn Engine> = Arc::new(MemtxEngine::new(true));
        assert!(same_engine(&a, &a.clone()));
        assert!(!same_engine(&a, &b));
    }

    #[test]
    fn test_memtx_without_mvcc_forbids_yield() {
        let engine = MemtxEngine::new(false);
        let mut txn = Txn::new(1024);
        assert!(txn.can_yield());
        engine.begin(&mut txn).unwrap();
        assert!(!txn.can_yield());
        assert_eq!(engine.stats().begun, 1);
    }

    #[test]
    fn test_blackhole_bypasses() {
        let engine = BlackholeEngine;
        assert!(engine.bypass_tx());
        assert_eq!(engine.storage(), StorageKind::Discard);
    }
}
