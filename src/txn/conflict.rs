//! Bipartite edge graph for conflict edges and read trackers
//!
//! An edge sits in two adjacency lists at once (its source's outgoing list
//! and its target's incoming list) and remembers its position in both, so
//! removal is a swap_remove on each side. Lookup of a specific pair walks the
//! two lists newest-first in lockstep and is bounded by the shorter one.

use crate::{Result, TxnError};
use ahash::AHashMap;
use std::hash::Hash;

pub type EdgeId = usize;

/// Bytes charged to a transaction region per edge.
pub const EDGE_SIZE: usize = 4 * std::mem::size_of::<usize>();

#[derive(Debug)]
struct Edge<A, B> {
    from: A,
    to: B,
    out_pos: usize,
    in_pos: usize,
}

#[derive(Debug)]
pub struct EdgeGraph<A, B> {
    what: &'static str,
    edges: Vec<Option<Edge<A, B>>>,
    free: Vec<EdgeId>,
    outgoing: AHashMap<A, Vec<EdgeId>>,
    incoming: AHashMap<B, Vec<EdgeId>>,
    len: usize,
}

impl<A: Copy + Eq + Hash, B: Copy + Eq + Hash> EdgeGraph<A, B> {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            edges: Vec::new(),
            free: Vec::new(),
            outgoing: AHashMap::new(),
            incoming: AHashMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_pair(&self, id: EdgeId, from: A, to: B) -> bool {
        matches!(self.edges.get(id), Some(Some(e)) if e.from == from && e.to == to)
    }

    fn find(&self, from: A, to: B) -> Option<EdgeId> {
        let out = self.outgoing.get(&from)?;
        let inc = self.incoming.get(&to)?;
        let mut out_iter = out.iter().rev();
        let mut in_iter = inc.iter().rev();
        loop {
            let a = out_iter.next();
            let b = in_iter.next();
            for &id in a.into_iter().chain(b) {
                if self.is_pair(id, from, to) {
                    return Some(id);
                }
            }
            // The edge is in both lists, so an exhausted list means it is absent.
            if a.is_none() || b.is_none() {
                return None;
            }
        }
    }

    pub fn contains(&self, from: A, to: B) -> bool {
        self.find(from, to).is_some()
    }

    /// Add `from -> to`. Returns false if the edge already existed, in which
    /// case it becomes the most recent entry of both lists. Nothing changes
    /// on allocation failure.
    pub fn insert(&mut self, from: A, to: B) -> Result<bool> {
        if let Some(id) = self.find(from, to) {
            self.touch(id);
            return Ok(false);
        }
        let what = self.what;
        let oom = move |_: std::collections::TryReserveError| TxnError::oom(EDGE_SIZE, what);
        if self.free.is_empty() {
            self.edges.try_reserve(1).map_err(oom)?;
        }
        self.outgoing.try_reserve(1).map_err(oom)?;
        self.incoming.try_reserve(1).map_err(oom)?;
        if let Some(list) = self.outgoing.get_mut(&from) {
            list.try_reserve(1).map_err(oom)?;
        }
        if let Some(list) = self.incoming.get_mut(&to) {
            list.try_reserve(1).map_err(oom)?;
        }

        let out = self.outgoing.entry(from).or_default();
        let inc = self.incoming.entry(to).or_default();
        let edge = Edge { from, to, out_pos: out.len(), in_pos: inc.len() };
        let id = match self.free.pop() {
            Some(id) => {
                self.edges[id] = Some(edge);
                id
            }
            None => {
                self.edges.push(Some(edge));
                self.edges.len() - 1
            }
        };
        out.push(id);
        inc.push(id);
        self.len += 1;
        Ok(true)
    }

    /// Swap the edge to the end of both of its lists.
    fn touch(&mut self, id: EdgeId) {
        let Some(Some(edge)) = self.edges.get(id) else { return };
        let (from, to, out_pos, in_pos) = (edge.from, edge.to, edge.out_pos, edge.in_pos);
        if let Some(list) = self.outgoing.get_mut(&from) {
            let last = list.len() - 1;
            if out_pos != last {
                let moved = list[last];
                list.swap(out_pos, last);
                if let Some(Some(m)) = self.edges.get_mut(moved) {
                    m.out_pos = out_pos;
                }
                if let Some(Some(e)) = self.edges.get_mut(id) {
                    e.out_pos = last;
                }
            }
        }
        if let Some(list) = self.incoming.get_mut(&to) {
            let last = list.len() - 1;
            if in_pos != last {
                let moved = list[last];
                list.swap(in_pos, last);
                if let Some(Some(m)) = self.edges.get_mut(moved) {
                    m.in_pos = in_pos;
                }
                if let Some(Some(e)) = self.edges.get_mut(id) {
                    e.in_pos = last;
                }
            }
        }
    }

    fn unlink(&mut self, id: EdgeId) -> Option<(A, B)> {
        let edge = self.edges.get_mut(id)?.take()?;
        if let Some(list) = self.outgoing.get_mut(&edge.from) {
            list.swap_remove(edge.out_pos);
            if let Some(&moved) = list.get(edge.out_pos) {
                if let Some(Some(m)) = self.edges.get_mut(moved) {
                    m.out_pos = edge.out_pos;
                }
            }
            if list.is_empty() {
                self.outgoing.remove(&edge.from);
            }
        }
        if let Some(list) = self.incoming.get_mut(&edge.to) {
            list.swap_remove(edge.in_pos);
            if let Some(&moved) = list.get(edge.in_pos) {
                if let Some(Some(m)) = self.edges.get_mut(moved) {
                    m.in_pos = edge.in_pos;
                }
            }
            if list.is_empty() {
                self.incoming.remove(&edge.to);
            }
        }
        self.free.push(id);
        self.len -= 1;
        Some((edge.from, edge.to))
    }

    pub fn remove(&mut self, from: A, to: B) -> bool {
        match self.find(from, to) {
            Some(id) => self.unlink(id).is_some(),
            None => false,
        }
    }

    /// Drop every edge leaving `from`, returning their targets.
    pub fn remove_from(&mut self, from: A) -> Vec<B> {
        let ids = self.outgoing.get(&from).cloned().unwrap_or_default();
        ids.into_iter().filter_map(|id| self.unlink(id)).map(|(_, to)| to).collect()
    }

    /// Drop every edge entering `to`, returning their sources.
    pub fn remove_to(&mut self, to: B) -> Vec<A> {
        let ids = self.incoming.get(&to).cloned().unwrap_or_default();
        ids.into_iter().filter_map(|id| self.unlink(id)).map(|(from, _)| from).collect()
    }

    pub fn targets(&self, from: A) -> Vec<B> {
        self.outgoing
            .get(&from)
            .map(|ids| ids.iter().filter_map(|&id| self.edges[id].as_ref().map(|e| e.to)).collect())
            .unwrap_or_default()
    }

    pub fn sources(&self, to: B) -> Vec<A> {
        self.incoming
            .get(&to)
            .map(|ids| ids.iter().filter_map(|&id| self.edges[id].as_ref().map(|e| e.from)).collect())
            .unwrap_or_default()
    }

    pub fn has_sources(&self, to: B) -> bool {
        self.incoming.contains_key(&to)
    }

    #[cfg(test)]
    fn check_positions(&self) {
        let mut seen = 0;
        for (from, list) in &self.outgoing {
            for (pos, &id) in list.iter().enumerate() {
                let e = self.edges[id].as_ref().unwrap();
                assert!(e.from == *from && e.out_pos == pos);
                seen += 1;
            }
        }
        for (to, list) in &self.incoming {
            for (pos, &id) in list.iter().enumerate() {
                let e = self.edges[id].as_ref().unwrap();
                assert!(e.to == *to && e.in_pos == pos);
            }
        }
        assert_eq!(seen, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_insert_is_idempotent() {
        let mut graph: EdgeGraph<u32, u32> = EdgeGraph::new("conflict edge");
        assert!(graph.insert(1, 2).unwrap());
        assert!(!graph.insert(1, 2).unwrap());
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(1, 2));
        assert!(!graph.contains(2, 1));
    }

    #[test]
    fn test_reinsert_moves_to_front() {
        let mut graph: EdgeGraph<u32, u32> = EdgeGraph::new("conflict edge");
        graph.insert(1, 10).unwrap();
        graph.insert(1, 11).unwrap();
        graph.insert(1, 12).unwrap();
        graph.insert(1, 10).unwrap();
        assert_eq!(graph.targets(1).last(), Some(&10));
        graph.check_positions();
    }

    #[test]
    fn test_remove_endpoints() {
        let mut graph: EdgeGraph<u32, u32> = EdgeGraph::new("read tracker");
        graph.insert(1, 10).unwrap();
        graph.insert(2, 10).unwrap();
        graph.insert(2, 11).unwrap();

        let mut readers = graph.remove_to(10);
        readers.sort();
        assert_eq!(readers, vec![1, 2]);
        assert!(!graph.has_sources(10));
        assert_eq!(graph.targets(2), vec![11]);
        assert_eq!(graph.remove_from(2), vec![11]);
        assert!(graph.is_empty());
        graph.check_positions();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, u8),
        Remove(u8, u8),
        RemoveFrom(u8),
        RemoveTo(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..6, 0u8..6).prop_map(|(a, b)| Op::Insert(a, b)),
            2 => (0u8..6, 0u8..6).prop_map(|(a, b)| Op::Remove(a, b)),
            1 => (0u8..6).prop_map(Op::RemoveFrom),
            1 => (0u8..6).prop_map(Op::RemoveTo),
        ]
    }

    proptest! {
        #[test]
        fn prop_graph_matches_set_model(ops in proptest::collection::vec(op(), 1..200)) {
            let mut graph: EdgeGraph<u8, u8> = EdgeGraph::new("conflict edge");
            let mut model: HashSet<(u8, u8)> = HashSet::new();
            for op in ops {
                match op {
                    Op::Insert(a, b) => {
                        let fresh = graph.insert(a, b).unwrap();
                        prop_assert_eq!(fresh, model.insert((a, b)));
                    }
                    Op::Remove(a, b) => {
                        prop_assert_eq!(graph.remove(a, b), model.remove(&(a, b)));
                    }
                    Op::RemoveFrom(a) => {
                        let mut got = graph.remove_from(a);
                        let mut want: Vec<u8> = model.iter().filter(|e| e.0 == a).map(|e| e.1).collect();
                        model.retain(|e| e.0 != a);
                        got.sort();
                        want.sort();
                        prop_assert_eq!(got, want);
                    }
                    Op::RemoveTo(b) => {
                        let mut got = graph.remove_to(b);
                        let mut want: Vec<u8> = model.iter().filter(|e| e.1 == b).map(|e| e.0).collect();
                        model.retain(|e| e.1 != b);
                        got.sort();
                        want.sort();
                        prop_assert_eq!(got, want);
                    }
                }
                prop_assert_eq!(graph.len(), model.len());
            }
            graph.check_positions();
            for a in 0u8..6 {
                for b in 0u8..6 {
                    prop_assert_eq!(graph.contains(a, b), model.contains(&(a, b)));
                }
            }
        }
    }
}
