//! Transaction layer implementation

pub mod conflict;
pub mod coordinator;
pub mod engine;
pub mod journal;
pub mod limbo;
pub mod region;
pub mod statement;
pub mod transaction;
pub mod trigger;
pub mod version_store;

pub use coordinator::{TxManager, TxManagerStats, Transaction};
pub use engine::{BlackholeEngine, Engine, MemtxEngine, MemtxStats};
pub use journal::{Journal, JournalEntry, JournalStats, LogRow, MemoryJournal, RowBody, RowHeader, RowType};
pub use limbo::{Limbo, LimboEntry, VClock};
pub use region::RegionSlot;
pub use statement::{Request, TxnStmt, TXN_SUB_STMT_MAX};
pub use transaction::{SavepointId, Txn, TxnId, TxnStatus};
pub use trigger::{ReplaceEvent, ReplaceTrigger, TriggerId, TxnEvent, TxnTrigger};
pub use version_store::{VersionStore, VersionStoreStats};
