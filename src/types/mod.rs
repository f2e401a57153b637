//! Tuple and key types shared by the storage and transaction layers

mod space;

pub use space::{
    replace_check_dup, DupMode, IndexDef, ReplicationGroup, Space, SpaceDef, StorageKind,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Field value. Variants of different types order by variant position, so
/// any two values compare and keys are totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Immutable record stored in a space.
pub type Tuple = Vec<Value>;

/// Tuples are shared between indexes, the version store and statements.
/// Identity (the pointer) matters: the version store keys on it.
pub type TupleRef = Arc<Tuple>;

/// Index key: the tuple fields named by the index parts, in part order.
pub type Key = Vec<Value>;

pub type SpaceId = u32;

/// Build a tuple from anything convertible to values.
#[macro_export]
macro_rules! tuple {
    ($($v:expr),* $(,)?) => {
        vec![$($crate::types::Value::from($v)),*]
    };
}
