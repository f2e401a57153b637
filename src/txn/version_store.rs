//! Tuple Version Store
//!
//! Every tuple touched by an unfinished transaction gets a *story*: who
//! inserted it, who deletes it, and per index a link to the next newer and
//! next older story for the same key. The index maps only ever hold the
//! newest version of a key; older versions are reached through the chain.
//!
//! A tuple with a story is "dirty". Stories are keyed by tuple identity
//! (the `Arc` pointer) in a side table, so tuples themselves stay immutable.
//!
//! Visibility rules, evaluated walking from the newest version down:
//! - a version deleted by the reader itself is invisible
//! - a version whose delete is prepared (or committed) is invisible
//! - a committed insert, a prepared insert, or the reader's own insert is visible
//! - anything else belongs to another in-progress transaction: skip it

use super::conflict::{EdgeGraph, EDGE_SIZE};
use super::transaction::TxnId;
use crate::types::{replace_check_dup, DupMode, Space, SpaceId, TupleRef};
use crate::{Result, TxnError};
use ahash::AHashMap;
use std::sync::Arc;

pub type StoryId = usize;

pub(crate) type Spaces = AHashMap<SpaceId, Space>;

/// Statement `stmt` (position in its transaction) of transaction `txn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtRef {
    pub txn: TxnId,
    pub stmt: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum Older {
    Story(StoryId),
    /// Bottom of the chain: a clean older tuple, or nothing.
    Tuple(Option<TupleRef>),
}

impl Default for Older {
    fn default() -> Self {
        Older::Tuple(None)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoryLink {
    pub(crate) newer: Option<StoryId>,
    pub(crate) older: Older,
}

#[derive(Debug)]
pub struct Story {
    pub(crate) tuple: TupleRef,
    pub(crate) space: SpaceId,
    /// Inserting statement; None once the insert is committed.
    pub(crate) add_stmt: Option<StmtRef>,
    pub(crate) add_psn: i64,
    /// Statements that delete or replace this version. Several in-progress
    /// transactions may, the first to prepare wins.
    pub(crate) del_stmts: Vec<StmtRef>,
    pub(crate) del_psn: i64,
    /// Transaction whose prepared delete is pending; None once committed.
    pub(crate) del_owner: Option<TxnId>,
    pub(crate) link: Box<[StoryLink]>,
}

impl Story {
    pub fn tuple(&self) -> &TupleRef {
        &self.tuple
    }

    pub fn is_add_committed(&self) -> bool {
        self.add_stmt.is_none()
    }

    pub fn is_del_committed(&self) -> bool {
        self.del_psn != 0 && self.del_owner.is_none()
    }
}

fn tuple_key(tuple: &TupleRef) -> usize {
    Arc::as_ptr(tuple) as usize
}

fn story_size(index_count: usize) -> usize {
    std::mem::size_of::<Story>() + index_count * std::mem::size_of::<StoryLink>()
}

/// Result of linking a new version.
#[derive(Debug)]
pub(crate) struct LinkOutcome {
    /// Version the write replaces, as seen by the writer.
    pub(crate) old: Option<TupleRef>,
    /// Story of `old`; the writing statement is now one of its deleters.
    pub(crate) deleted: Option<StoryId>,
    /// In-progress writers whose versions were skipped. If any of them
    /// prepares first, the writer loses.
    pub(crate) wreakers: Vec<TxnId>,
}

/// Fallout of removing a version that others may have built on.
#[derive(Debug, Default)]
pub(crate) struct UnlinkOutcome {
    pub(crate) victims: Vec<TxnId>,
    /// Other statements that were deleting the removed version.
    pub(crate) detached: Vec<StmtRef>,
    pub(crate) retry: Vec<StoryId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clarified {
    pub visible: Option<TupleRef>,
    /// The reader itself produced the visible state.
    pub own_change: bool,
}

/// Version store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionStoreStats {
    pub stories: usize,
    pub read_trackers: usize,
    pub pooled_links: usize,
    pub created: u64,
    pub collected: u64,
}

pub struct VersionStore {
    stories: Vec<Option<Story>>,
    free_slots: Vec<StoryId>,
    /// Recycled link arrays, by index count.
    pools: Vec<Vec<Box<[StoryLink]>>>,
    history: AHashMap<usize, StoryId>,
    readers: EdgeGraph<TxnId, StoryId>,
    max_stories: usize,
    live: usize,
    gc_cursor: usize,
    created: u64,
    collected: u64,
}

impl VersionStore {
    /// `max_stories` caps live stories; 0 means no cap.
    pub fn new(max_stories: usize) -> Self {
        Self {
            stories: Vec::new(),
            free_slots: Vec::new(),
            pools: Vec::new(),
            history: AHashMap::new(),
            readers: EdgeGraph::new("read tracker"),
            max_stories,
            live: 0,
            gc_cursor: 0,
            created: 0,
            collected: 0,
        }
    }

    pub fn is_dirty(&self, tuple: &TupleRef) -> bool {
        self.history.contains_key(&tuple_key(tuple))
    }

    pub fn story_of(&self, tuple: &TupleRef) -> Option<StoryId> {
        self.history.get(&tuple_key(tuple)).copied()
    }

    pub fn get(&self, id: StoryId) -> Option<&Story> {
        self.stories.get(id).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn stats(&self) -> VersionStoreStats {
        VersionStoreStats {
            stories: self.live,
            read_trackers: self.readers.len(),
            pooled_links: self.pools.iter().map(Vec::len).sum(),
            created: self.created,
            collected: self.collected,
        }
    }

    fn story(&self, id: StoryId) -> &Story {
        match self.stories.get(id) {
            Some(Some(story)) => story,
            _ => panic!("story {id} is not live"),
        }
    }

    fn story_mut(&mut self, id: StoryId) -> &mut Story {
        match self.stories.get_mut(id) {
            Some(Some(story)) => story,
            _ => panic!("story {id} is not live"),
        }
    }

    /// Allocate a story for a tuple that has none. Fails without side
    /// effects when the store is full.
    pub(crate) fn create_story(
        &mut self,
        tuple: TupleRef,
        space: SpaceId,
        add_stmt: Option<StmtRef>,
        index_count: usize,
    ) -> Result<StoryId> {
        let size = story_size(index_count);
        if self.max_stories != 0 && self.live >= self.max_stories {
            return Err(TxnError::oom(size, "tx story"));
        }
        debug_assert!(!self.is_dirty(&tuple));
        self.history.try_reserve(1).map_err(|_| TxnError::oom(size, "tx story"))?;
        if self.free_slots.is_empty() {
            self.stories.try_reserve(1).map_err(|_| TxnError::oom(size, "tx story"))?;
        }

        let link = self
            .pools
            .get_mut(index_count)
            .and_then(Vec::pop)
            .unwrap_or_else(|| vec![StoryLink::default(); index_count].into_boxed_slice());
        let key = tuple_key(&tuple);
        let story = Story {
            tuple,
            space,
            add_stmt,
            add_psn: 0,
            del_stmts: Vec::new(),
            del_psn: 0,
            del_owner: None,
            link,
        };
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.stories[id] = Some(story);
                id
            }
            None => {
                self.stories.push(Some(story));
                self.stories.len() - 1
            }
        };
        self.history.insert(key, id);
        self.live += 1;
        self.created += 1;
        Ok(id)
    }

    pub(crate) fn delete_story(&mut self, id: StoryId) {
        let Some(mut story) = self.stories.get_mut(id).and_then(Option::take) else {
            return;
        };
        self.readers.remove_to(id);
        let key = tuple_key(&story.tuple);
        if self.history.get(&key) == Some(&id) {
            self.history.remove(&key);
        }
        for link in story.link.iter_mut() {
            *link = StoryLink::default();
        }
        let n = story.link.len();
        if self.pools.len() <= n {
            self.pools.resize_with(n + 1, Vec::new);
        }
        self.pools[n].push(story.link);
        self.free_slots.push(id);
        self.live -= 1;
        self.collected += 1;
    }

    /// Story for `tuple`, creating one if the tuple is clean. A new story is
    /// spliced into any chain that still refers to the tuple directly.
    pub(crate) fn adopt(&mut self, space: &Space, tuple: &TupleRef) -> Result<StoryId> {
        if let Some(id) = self.story_of(tuple) {
            return Ok(id);
        }
        let n = space.index_count();
        let id = self.create_story(tuple.clone(), space.id(), None, n)?;
        for i in 0..n {
            let key = space.key(i, tuple);
            let Some(head) = space.index_get(i, &key) else { continue };
            if Arc::ptr_eq(head, tuple) {
                continue;
            }
            let Some(mut node) = self.story_of(head) else { continue };
            loop {
                let next = match &self.story(node).link[i].older {
                    Older::Story(older) => Some(*older),
                    Older::Tuple(Some(bottom)) if Arc::ptr_eq(bottom, tuple) => None,
                    Older::Tuple(_) => break,
                };
                match next {
                    Some(older) => node = older,
                    None => {
                        self.story_mut(node).link[i].older = Older::Story(id);
                        self.story_mut(id).link[i].newer = Some(node);
                        break;
                    }
                }
            }
        }
        Ok(id)
    }

    /// Writer's view of index `i` below `story`.
    fn visible_for_writer(
        &self,
        story: StoryId,
        i: usize,
        me: TxnId,
        wreakers: &mut Vec<TxnId>,
    ) -> Option<TupleRef> {
        let mut node = story;
        loop {
            let older = match &self.story(node).link[i].older {
                Older::Tuple(bottom) => return bottom.clone(),
                Older::Story(older) => *older,
            };
            let s = self.story(older);
            if s.del_psn != 0 || s.del_stmts.iter().any(|d| d.txn == me) {
                return None;
            }
            match s.add_stmt {
                Some(add) if s.add_psn == 0 && add.txn != me => {
                    wreakers.push(add.txn);
                    node = older;
                }
                _ => return Some(s.tuple.clone()),
            }
        }
    }

    /// Undo step 1 of `link_insert` for a story that never became head.
    fn unlink_partial(&mut self, story: StoryId) {
        let n = self.story(story).link.len();
        for i in 0..n {
            let link = std::mem::take(&mut self.story_mut(story).link[i]);
            if let Older::Story(older) = link.older {
                self.story_mut(older).link[i].newer = None;
            }
        }
    }

    /// Make the freshly created `story` the newest version in every index of
    /// `space`, after checking uniqueness against what the writer can see.
    /// On error nothing is left linked; the caller still owns the story.
    pub(crate) fn link_insert(
        &mut self,
        space: &mut Space,
        story: StoryId,
        stmt: StmtRef,
        mode: DupMode,
    ) -> Result<LinkOutcome> {
        let tuple = self.story(story).tuple.clone();
        let n = space.index_count();
        let keys: Vec<_> = (0..n).map(|i| space.key(i, &tuple)).collect();

        for (i, key) in keys.iter().enumerate() {
            let older = match space.index_get(i, key).cloned() {
                Some(head) => match self.story_of(&head) {
                    Some(head_story) => {
                        let slot = &mut self.story_mut(head_story).link[i];
                        assert!(slot.newer.is_none(), "index head story {head_story} has a newer version");
                        slot.newer = Some(story);
                        Older::Story(head_story)
                    }
                    None => Older::Tuple(Some(head)),
                },
                None => Older::Tuple(None),
            };
            self.story_mut(story).link[i].older = older;
        }

        let mut wreakers = Vec::new();
        let mut old: Option<TupleRef> = None;
        for i in 0..n {
            let visible = self.visible_for_writer(story, i, stmt.txn, &mut wreakers);
            let checked = if i == 0 {
                replace_check_dup(None, visible.as_ref(), mode, space, 0)
            } else {
                replace_check_dup(old.as_ref(), visible.as_ref(), DupMode::Insert, space, i)
            };
            if let Err(e) = checked {
                self.unlink_partial(story);
                return Err(e);
            }
            if i == 0 {
                old = visible;
            }
        }

        let deleted = match &old {
            Some(old_tuple) => {
                let del = match self.adopt(space, old_tuple) {
                    Ok(del) => del,
                    Err(e) => {
                        self.unlink_partial(story);
                        return Err(e);
                    }
                };
                for i in 0..n {
                    let direct = matches!(
                        &self.story(story).link[i].older,
                        Older::Tuple(Some(t)) if Arc::ptr_eq(t, old_tuple)
                    );
                    if direct {
                        self.story_mut(story).link[i].older = Older::Story(del);
                        self.story_mut(del).link[i].newer = Some(story);
                    }
                }
                self.story_mut(del).del_stmts.push(stmt);
                Some(del)
            }
            None => None,
        };

        for (i, key) in keys.into_iter().enumerate() {
            space.index_insert(i, key, tuple.clone());
        }
        wreakers.sort_unstable();
        wreakers.dedup();
        Ok(LinkOutcome { old, deleted, wreakers })
    }

    /// Register `stmt` as a deleter of the visible `tuple`.
    pub(crate) fn link_delete(
        &mut self,
        space: &Space,
        tuple: &TupleRef,
        stmt: StmtRef,
    ) -> Result<StoryId> {
        let story = self.adopt(space, tuple)?;
        self.story_mut(story).del_stmts.push(stmt);
        Ok(story)
    }

    /// Remove `stmt` from the deleters of `story`. A prepared delete by the
    /// same transaction is withdrawn.
    pub(crate) fn unlink_delete(&mut self, story: StoryId, stmt: StmtRef) {
        let Some(Some(s)) = self.stories.get_mut(story) else { return };
        s.del_stmts.retain(|d| *d != stmt);
        if s.del_owner == Some(stmt.txn) {
            s.del_psn = 0;
            s.del_owner = None;
        }
    }

    /// Take back an insert: restore whatever it covered in each index and
    /// free the story. Transactions that deleted or read this version lose.
    pub(crate) fn unlink_insert(&mut self, space: &mut Space, story: StoryId, me: TxnId) -> UnlinkOutcome {
        let mut out = UnlinkOutcome::default();
        let tuple = self.story(story).tuple.clone();
        let n = self.story(story).link.len();
        for i in 0..n {
            let link = std::mem::take(&mut self.story_mut(story).link[i]);
            match link.newer {
                None => {
                    if space.is_head(i, &tuple) {
                        let key = space.key(i, &tuple);
                        match &link.older {
                            Older::Story(older) => {
                                let older_tuple = self.story(*older).tuple.clone();
                                space.index_insert(i, key, older_tuple);
                            }
                            Older::Tuple(Some(bottom)) => space.index_insert(i, key, bottom.clone()),
                            Older::Tuple(None) => {
                                space.index_remove_if(i, &key, &tuple);
                            }
                        }
                    }
                    if let Older::Story(older) = link.older {
                        self.story_mut(older).link[i].newer = None;
                        out.retry.push(older);
                    }
                }
                Some(newer) => {
                    if let Older::Story(older) = &link.older {
                        self.story_mut(*older).link[i].newer = Some(newer);
                    }
                    self.story_mut(newer).link[i].older = link.older;
                    out.retry.push(newer);
                }
            }
        }

        let s = self.story_mut(story);
        s.add_stmt = None;
        for del in std::mem::take(&mut s.del_stmts) {
            if del.txn != me {
                out.victims.push(del.txn);
                out.detached.push(del);
            }
        }
        out.victims
            .extend(self.readers.remove_to(story).into_iter().filter(|r| *r != me));
        out.victims.sort_unstable();
        out.victims.dedup();
        self.delete_story(story);
        out.retry.retain(|r| *r != story);
        out
    }

    /// Read-path visibility for the version chain headed by `head` in index
    /// `i`. `reader` is None for reads outside a transaction.
    pub fn clarify(&self, head: &TupleRef, i: usize, reader: Option<TxnId>, prepared_ok: bool) -> Clarified {
        let Some(mut node) = self.story_of(head) else {
            return Clarified { visible: Some(head.clone()), own_change: false };
        };
        loop {
            let s = self.story(node);
            if let Some(r) = reader {
                if s.del_stmts.iter().any(|d| d.txn == r) {
                    return Clarified { visible: None, own_change: true };
                }
            }
            if s.del_psn != 0 && (s.del_owner.is_none() || prepared_ok) {
                return Clarified { visible: None, own_change: false };
            }
            match s.add_stmt {
                None => return Clarified { visible: Some(s.tuple.clone()), own_change: false },
                Some(add) if Some(add.txn) == reader => {
                    return Clarified { visible: Some(s.tuple.clone()), own_change: true }
                }
                Some(_) if s.add_psn != 0 && prepared_ok => {
                    return Clarified { visible: Some(s.tuple.clone()), own_change: false }
                }
                Some(_) => {}
            }
            match &s.link[i].older {
                Older::Story(older) => node = *older,
                Older::Tuple(bottom) => return Clarified { visible: bottom.clone(), own_change: false },
            }
        }
    }

    /// Bytes a new read tracker costs, or 0 if `reader` already tracks `story`.
    pub(crate) fn tracker_cost(&self, reader: TxnId, story: StoryId) -> usize {
        if self.readers.contains(reader, story) {
            0
        } else {
            EDGE_SIZE
        }
    }

    pub(crate) fn track_read(&mut self, reader: TxnId, story: StoryId) -> Result<bool> {
        self.readers.insert(reader, story)
    }

    /// Drop all trackers of a finished reader; returns the stories they pinned.
    pub(crate) fn release_reader(&mut self, reader: TxnId) -> Vec<StoryId> {
        self.readers.remove_from(reader)
    }

    fn pending_owner(&self, id: StoryId, me: TxnId) -> Option<TxnId> {
        let s = self.story(id);
        match s.add_stmt {
            Some(add) if add.txn != me && s.add_psn == 0 => Some(add.txn),
            _ => None,
        }
    }

    /// Stamp a statement's stories with `psn` and collect the transactions
    /// that must now lose: in-progress writers elsewhere in the touched
    /// chains, competing deleters and readers of the deleted version.
    pub(crate) fn prepare_stmt(
        &mut self,
        add: Option<StoryId>,
        del: Option<StoryId>,
        me: TxnId,
        psn: i64,
    ) -> Vec<TxnId> {
        let mut victims = Vec::new();
        if let Some(add) = add {
            self.story_mut(add).add_psn = psn;
            let n = self.story(add).link.len();
            for i in 0..n {
                let mut up = self.story(add).link[i].newer;
                while let Some(id) = up {
                    victims.extend(self.pending_owner(id, me));
                    up = self.story(id).link[i].newer;
                }
                let mut down = match self.story(add).link[i].older {
                    Older::Story(id) => Some(id),
                    Older::Tuple(_) => None,
                };
                while let Some(id) = down {
                    victims.extend(self.pending_owner(id, me));
                    down = match self.story(id).link[i].older {
                        Older::Story(next) => Some(next),
                        Older::Tuple(_) => None,
                    };
                }
            }
        }
        if let Some(del) = del {
            let s = self.story_mut(del);
            debug_assert!(s.del_owner.is_none() || s.del_owner == Some(me));
            s.del_psn = psn;
            s.del_owner = Some(me);
            victims.extend(s.del_stmts.iter().map(|d| d.txn).filter(|t| *t != me));
            victims.extend(self.readers.sources(del).into_iter().filter(|r| *r != me));
        }
        victims.sort_unstable();
        victims.dedup();
        victims
    }

    /// Make a statement's effects permanent.
    pub(crate) fn commit_stmt(&mut self, add: Option<StoryId>, del: Option<StoryId>, stmt: StmtRef) {
        if let Some(add) = add {
            self.story_mut(add).add_stmt = None;
        }
        if let Some(del) = del {
            let s = self.story_mut(del);
            debug_assert!(s.del_psn != 0, "delete committed without prepare");
            s.del_stmts.retain(|d| *d != stmt);
            s.del_owner = None;
        }
    }

    /// Try to free the given stories and whatever becomes free as a result.
    /// Returns how many were freed.
    pub(crate) fn collect(&mut self, spaces: &mut Spaces, mut work: Vec<StoryId>) -> usize {
        let mut freed = 0;
        while let Some(id) = work.pop() {
            if self.try_collect(spaces, id, &mut work) {
                freed += 1;
            }
        }
        freed
    }

    fn try_collect(&mut self, spaces: &mut Spaces, id: StoryId, work: &mut Vec<StoryId>) -> bool {
        let Some(Some(s)) = self.stories.get(id) else { return false };
        if s.add_stmt.is_some() || !s.del_stmts.is_empty() || self.readers.has_sources(id) {
            return false;
        }
        let deleted = s.is_del_committed();
        if !deleted
            && s
                .link
                .iter()
                .any(|l| l.newer.is_some() || matches!(l.older, Older::Story(_)))
        {
            return false;
        }
        if s.del_owner.is_some() {
            return false;
        }

        if deleted {
            let tuple = s.tuple.clone();
            let links: Vec<StoryLink> = self.story_mut(id).link.iter_mut().map(std::mem::take).collect();
            let mut space = spaces.get_mut(&self.story(id).space);
            for (i, link) in links.into_iter().enumerate() {
                match link.newer {
                    None => {
                        if let Some(space) = space.as_deref_mut() {
                            let key = space.key(i, &tuple);
                            space.index_remove_if(i, &key, &tuple);
                        }
                    }
                    Some(newer) => {
                        self.story_mut(newer).link[i].older = Older::Tuple(None);
                        work.push(newer);
                    }
                }
                if let Older::Story(older) = link.older {
                    self.story_mut(older).link[i].newer = None;
                    work.push(older);
                }
            }
        }
        tracing::trace!(story = id, deleted, "collected story");
        self.delete_story(id);
        true
    }

    /// Incremental sweep over up to `budget` slots.
    pub(crate) fn gc_step(&mut self, spaces: &mut Spaces, budget: usize) -> usize {
        let total = self.stories.len();
        let mut freed = 0;
        for _ in 0..budget.min(total) {
            let id = self.gc_cursor % total;
            self.gc_cursor = (id + 1) % total;
            if self.stories[id].is_some() {
                freed += self.collect(spaces, vec![id]);
            }
        }
        freed
    }
}
