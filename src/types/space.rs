//! Space definitions and in-memory index storage

use super::{Key, SpaceId, Tuple, TupleRef, Value};
use crate::txn::engine::Engine;
use crate::txn::trigger::ReplaceTrigger;
use crate::{Result, TxnError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Replication group of the rows a space produces. Local rows are written
/// to the journal but never replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicationGroup {
    #[default]
    Default,
    Local,
}

/// Where an engine keeps its tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Indexes plus the version store.
    Memory,
    /// Nothing is stored; statements only produce log rows.
    Discard,
}

/// How a write treats an existing tuple with the same primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupMode {
    /// Fail if a visible tuple exists.
    Insert,
    /// Fail if no visible tuple exists.
    Replace,
    /// Overwrite whatever is visible.
    ReplaceOrInsert,
}

/// Unique tree index over the listed tuple fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub parts: Vec<usize>,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, parts: Vec<usize>) -> Self {
        Self { name: name.into(), parts }
    }
}

#[derive(Clone)]
pub struct SpaceDef {
    pub id: SpaceId,
    pub name: String,
    pub engine: Arc<dyn Engine>,
    /// Index 0 is the primary key.
    pub indexes: Vec<IndexDef>,
    pub group: ReplicationGroup,
    /// Temporary spaces produce no log rows.
    pub temporary: bool,
    /// Writes to a sync space wait for the replication quorum.
    pub is_sync: bool,
}

impl SpaceDef {
    /// Space with a primary key on field 0.
    pub fn new(id: SpaceId, name: impl Into<String>, engine: Arc<dyn Engine>) -> Self {
        Self {
            id,
            name: name.into(),
            engine,
            indexes: vec![IndexDef::new("pk", vec![0])],
            group: ReplicationGroup::Default,
            temporary: false,
            is_sync: false,
        }
    }

    pub fn with_index(mut self, name: impl Into<String>, parts: Vec<usize>) -> Self {
        self.indexes.push(IndexDef::new(name, parts));
        self
    }

    pub fn local(mut self) -> Self {
        self.group = ReplicationGroup::Local;
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn sync(mut self) -> Self {
        self.is_sync = true;
        self
    }
}

impl fmt::Debug for SpaceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine.name())
            .field("indexes", &self.indexes)
            .field("group", &self.group)
            .field("temporary", &self.temporary)
            .field("is_sync", &self.is_sync)
            .finish()
    }
}

/// A space: its definition, one ordered map per index and the on_replace
/// triggers. Index maps hold the newest version of every key, the version
/// store keeps the older ones.
pub struct Space {
    def: SpaceDef,
    indexes: Vec<BTreeMap<Key, TupleRef>>,
    pub(crate) on_replace: Vec<ReplaceTrigger>,
    pub(crate) run_triggers: bool,
}

impl Space {
    pub(crate) fn new(def: SpaceDef) -> Result<Self> {
        if def.indexes.is_empty() {
            return Err(TxnError::InvalidRequest(format!(
                "space '{}' has no primary index",
                def.name
            )));
        }
        let indexes = def.indexes.iter().map(|_| BTreeMap::new()).collect();
        Ok(Self {
            def,
            indexes,
            on_replace: Vec::new(),
            run_triggers: true,
        })
    }

    pub fn id(&self) -> SpaceId {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &SpaceDef {
        &self.def
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.def.engine
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn index_name(&self, index: usize) -> &str {
        self.def.indexes.get(index).map_or("?", |d| d.name.as_str())
    }

    /// Extract the key of `index` from a tuple. Missing fields read as Null.
    pub fn key(&self, index: usize, tuple: &Tuple) -> Key {
        self.def.indexes[index]
            .parts
            .iter()
            .map(|&field| tuple.get(field).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Newest version stored under `key`, visible or not.
    pub fn index_get(&self, index: usize, key: &Key) -> Option<&TupleRef> {
        self.indexes.get(index).and_then(|map| map.get(key))
    }

    pub fn index_len(&self, index: usize) -> usize {
        self.indexes.get(index).map_or(0, BTreeMap::len)
    }

    pub fn index_iter(&self, index: usize) -> impl Iterator<Item = &TupleRef> {
        self.indexes.get(index).into_iter().flat_map(|map| map.values())
    }

    pub(crate) fn index_insert(&mut self, index: usize, key: Key, tuple: TupleRef) {
        self.indexes[index].insert(key, tuple);
    }

    /// Remove `key` only if it still maps to this exact tuple.
    pub(crate) fn index_remove_if(&mut self, index: usize, key: &Key, tuple: &TupleRef) -> bool {
        let map = &mut self.indexes[index];
        match map.get(key) {
            Some(head) if Arc::ptr_eq(head, tuple) => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    /// True if `tuple` is the newest version in `index`.
    pub(crate) fn is_head(&self, index: usize, tuple: &TupleRef) -> bool {
        let key = self.key(index, tuple);
        self.index_get(index, &key).map_or(false, |head| Arc::ptr_eq(head, tuple))
    }
}

/// Decide whether a write may replace `dup`, the tuple currently visible
/// under the new tuple's key, given the tuple `old` the write is known to
/// replace (None for the primary index).
pub fn replace_check_dup(
    old: Option<&TupleRef>,
    dup: Option<&TupleRef>,
    mode: DupMode,
    space: &Space,
    index: usize,
) -> Result<()> {
    match dup {
        None if mode == DupMode::Replace => Err(TxnError::TupleNotFound {
            index: space.index_name(index).to_string(),
            space: space.name().to_string(),
        }),
        None => Ok(()),
        Some(dup) => {
            let same = old.map_or(false, |old| Arc::ptr_eq(old, dup));
            if !same && (old.is_some() || mode == DupMode::Insert) {
                return Err(TxnError::DuplicateKey {
                    index: space.index_name(index).to_string(),
                    space: space.name().to_string(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;
    use crate::txn::engine::MemtxEngine;

    fn test_space() -> Space {
        let engine = Arc::new(MemtxEngine::new(true));
        Space::new(SpaceDef::new(1, "test", engine).with_index("sk", vec![1])).unwrap()
    }

    #[test]
    fn test_key_extraction() {
        let space = test_space();
        let t: Tuple = tuple![7i64, "seven"];
        assert_eq!(space.key(0, &t), vec![Value::Integer(7)]);
        assert_eq!(space.key(1, &t), vec![Value::Text("seven".into())]);
        let short: Tuple = tuple![7i64];
        assert_eq!(space.key(1, &short), vec![Value::Null]);
    }

    #[test]
    fn test_remove_if_checks_identity() {
        let mut space = test_space();
        let a: TupleRef = Arc::new(tuple![1i64, "a"]);
        let a_copy: TupleRef = Arc::new(tuple![1i64, "a"]);
        let key = space.key(0, &a);
        space.index_insert(0, key.clone(), a.clone());
        assert!(!space.index_remove_if(0, &key, &a_copy));
        assert!(space.is_head(0, &a));
        assert!(space.index_remove_if(0, &key, &a));
        assert_eq!(space.index_len(0), 0);
    }

    #[test]
    fn test_replace_check_dup() {
        let space = test_space();
        let a: TupleRef = Arc::new(tuple![1i64, "a"]);
        let b: TupleRef = Arc::new(tuple![1i64, "b"]);

        assert!(replace_check_dup(None, None, DupMode::Insert, &space, 0).is_ok());
        assert!(matches!(
            replace_check_dup(None, Some(&a), DupMode::Insert, &space, 0),
            Err(TxnError::DuplicateKey { .. })
        ));
        assert!(replace_check_dup(None, Some(&a), DupMode::ReplaceOrInsert, &space, 0).is_ok());
        assert!(matches!(
            replace_check_dup(None, None, DupMode::Replace, &space, 0),
            Err(TxnError::TupleNotFound { .. })
        ));
        // Secondary index: the duplicate must be the tuple being replaced.
        assert!(replace_check_dup(Some(&a), Some(&a), DupMode::Insert, &space, 1).is_ok());
        assert!(replace_check_dup(Some(&a), Some(&b), DupMode::Insert, &space, 1).is_err());
    }
}
