//! MoteTx Transaction Manager
//!
//! In-memory transaction core for a replicated database server.
//!
//! ## Features
//! - Multi-statement transactions with savepoints and nested statements
//! - MVCC story chains: isolation, read tracking, conflict detection
//! - Group-committed journal writes with commit/rollback triggers
//! - Synchronous replication queue (limbo) with quorum CONFIRM/ROLLBACK
//!
//! ## Layout
//! - `types`: values, tuples, spaces and their indexes
//! - `txn`: transactions, version store, journal, limbo, coordinator
//! - `config`: tunables, loadable from JSON

pub mod config;
pub mod txn;
pub mod types;

mod error;

pub use config::TxnConfig;
pub use error::{ErrorKind, Result, TxnError};

pub use txn::{Request, Transaction, TxManager, TxManagerStats, TxnStatus};
pub use types::{SpaceDef, SpaceId, Tuple, TupleRef, Value};
