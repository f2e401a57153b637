//! Error types for the MoteTx transaction manager

use crate::types::SpaceId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TxnError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TxnError {
    #[error("Failed to allocate {size} bytes for {what}")]
    OutOfMemory { size: usize, what: &'static str },

    #[error("Transaction has been aborted by conflict")]
    TransactionConflict,

    #[error("Duplicate key exists in unique index '{index}' in space '{space}'")]
    DuplicateKey { index: String, space: String },

    #[error("Tuple doesn't exist in index '{index}' in space '{space}'")]
    TupleNotFound { index: String, space: String },

    #[error("Can not commit transaction: deferred foreign keys violations are not resolved")]
    ForeignKeyConstraint,

    #[error("A multi-statement transaction can not use multiple storage engines")]
    CrossEngineTransaction,

    #[error("Failed to execute nested statement: nesting limit reached")]
    SubStatementMax,

    #[error("Can not perform {0} in a multi-statement transaction")]
    MultiStatementTransaction(String),

    #[error("Transaction has been aborted by a fiber yield")]
    TransactionYield,

    #[error("No active transaction")]
    NoTransaction,

    #[error("Operation is not permitted when there is an active transaction")]
    ActiveTransaction,

    #[error("Can not commit transaction in a nested statement")]
    CommitInSubStatement,

    #[error("Rollback called in a nested statement")]
    RollbackInSubStatement,

    #[error("Can not rollback to savepoint: the savepoint does not exist")]
    NoSuchSavepoint,

    #[error("Space '{0}' does not exist")]
    NoSuchSpace(SpaceId),

    #[error("Space '{0}' already exists")]
    SpaceExists(SpaceId),

    #[error("Failed to write to disk")]
    WalIo,

    #[error("Quorum collection for a synchronous transaction is timed out")]
    SyncQuorumTimeout,

    #[error("A rollback for a synchronous transaction is received")]
    SyncRollback,

    #[error("Found uncommitted sync transactions from other instance with id {0}")]
    UncommittedForeignSyncTxns(u32),

    #[error("Trigger failed: {0}")]
    Trigger(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse error taxonomy callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    Conflict,
    ConstraintViolation,
    ReplicationTimeout,
    ReplicationRollback,
    IoFailure,
    Client,
}

impl TxnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TxnError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            TxnError::TransactionConflict => ErrorKind::Conflict,
            TxnError::DuplicateKey { .. }
            | TxnError::TupleNotFound { .. }
            | TxnError::ForeignKeyConstraint => ErrorKind::ConstraintViolation,
            TxnError::SyncQuorumTimeout => ErrorKind::ReplicationTimeout,
            TxnError::SyncRollback | TxnError::UncommittedForeignSyncTxns(_) => {
                ErrorKind::ReplicationRollback
            }
            TxnError::WalIo => ErrorKind::IoFailure,
            _ => ErrorKind::Client,
        }
    }

    pub(crate) fn oom(size: usize, what: &'static str) -> Self {
        TxnError::OutOfMemory { size, what }
    }
}

impl From<bincode::Error> for TxnError {
    fn from(err: bincode::Error) -> Self {
        TxnError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TxnError {
    fn from(err: serde_json::Error) -> Self {
        TxnError::Serialization(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for TxnError {
    fn from(_: std::collections::TryReserveError) -> Self {
        TxnError::oom(0, "collection growth")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_taxonomy() {
        assert_eq!(TxnError::TransactionConflict.kind(), ErrorKind::Conflict);
        assert_eq!(TxnError::oom(16, "txn_stmt").kind(), ErrorKind::OutOfMemory);
        assert_eq!(TxnError::WalIo.kind(), ErrorKind::IoFailure);
        assert_eq!(TxnError::SyncQuorumTimeout.kind(), ErrorKind::ReplicationTimeout);
        assert_eq!(TxnError::SyncRollback.kind(), ErrorKind::ReplicationRollback);
        assert_eq!(TxnError::NoSuchSavepoint.kind(), ErrorKind::Client);
        assert_eq!(
            TxnError::DuplicateKey { index: "pk".into(), space: "s".into() }.kind(),
            ErrorKind::ConstraintViolation
        );
    }

    #[test]
    fn test_messages() {
        let err = TxnError::oom(128, "region");
        assert_eq!(err.to_string(), "Failed to allocate 128 bytes for region");
        let err = TxnError::MultiStatementTransaction("DDL".into());
        assert_eq!(err.to_string(), "Can not perform DDL in a multi-statement transaction");
    }
}
