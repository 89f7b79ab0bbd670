//! B+-tree core implementation.
//!
//! This module provides the main BTree struct with operations for:
//! - search/contains: point lookups
//! - insert: insertion with proactive splitting on the descent path
//! - remove: deletion with borrow/merge rebalancing
//!
//! The tree knows nothing about disk. It traverses children by page id
//! through the buffer manager, which owns every loaded node. Parent
//! links do not exist; each operation carries a descent stack of
//! `(page id, child position)` pairs instead.

use crate::buffer::{BufferManager, BufferManagerImpl};
use crate::error::{IndexError, Result};
use crate::node::Node;
use crate::tree::IteratorRegistry;
use crate::types::{PageId, TreeConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A paged B+-tree over 64-bit keys and values
pub struct BTree {
    /// Buffer manager for node access
    pool: Arc<BufferManagerImpl>,
    cfg: TreeConfig,
    /// Root page id; the one value the enclosing storage persists
    root: PageId,
    /// Bumped by every mutating entry point; iterators validate against it
    mod_count: Arc<AtomicU64>,
    /// Open cursors, closed as a group when the transaction ends
    registry: Arc<IteratorRegistry>,
}

impl BTree {
    /// Create a tree over the given buffer manager, loading the root
    /// recorded at the last commit or materializing an empty one.
    pub fn new(pool: Arc<BufferManagerImpl>, cfg: TreeConfig) -> Result<Self> {
        cfg.validate()?;
        let mut tree = Self {
            pool,
            cfg,
            root: PageId::INVALID,
            mod_count: Arc::new(AtomicU64::new(0)),
            registry: Arc::new(IteratorRegistry::new()),
        };
        tree.reload_root()?;
        Ok(tree)
    }

    /// Current root page id
    pub fn root_page(&self) -> PageId {
        self.root
    }

    pub fn config(&self) -> TreeConfig {
        self.cfg
    }

    /// Number of mutations applied to this tree
    pub fn modification_count(&self) -> u64 {
        self.mod_count.load(Ordering::SeqCst)
    }

    pub(crate) fn pool(&self) -> &Arc<BufferManagerImpl> {
        &self.pool
    }

    pub(crate) fn mod_counter(&self) -> &Arc<AtomicU64> {
        &self.mod_count
    }

    /// Registry of open cursors, for the session to close on commit
    pub fn registry(&self) -> &Arc<IteratorRegistry> {
        &self.registry
    }

    fn bump_mods(&self) {
        self.mod_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Height of the tree (1 for a lone root leaf)
    pub fn height(&self) -> Result<usize> {
        let mut height = 1;
        let mut cur = self.root;
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            if node.is_leaf() {
                return Ok(height);
            }
            let child = node.child(0);
            drop(node);
            drop(guard);
            height += 1;
            cur = child;
        }
    }

    // ===== Lookups =====

    /// Look up the value stored for `key` (unique trees only)
    pub fn search(&self, key: i64) -> Result<i64> {
        if !self.cfg.unique {
            return Err(IndexError::invariant(
                "search by key alone requires a unique tree",
            ));
        }
        let leaf = self.find_leaf(key, 0)?;
        let guard = self.pool.read(leaf)?;
        let node = guard.node();
        match node.binary_search(key, 0) {
            Ok(pos) => Ok(node.value(pos)),
            Err(_) => Err(IndexError::KeyNotFound),
        }
    }

    /// Whether the entry exists. Unique trees compare the key alone.
    pub fn contains(&self, key: i64, value: i64) -> Result<bool> {
        let leaf = self.find_leaf(key, value)?;
        let guard = self.pool.read(leaf)?;
        let x = Ok(guard.node().binary_search(key, value).is_ok());
        x
    }

    fn find_leaf(&self, key: i64, value: i64) -> Result<PageId> {
        let mut cur = self.root;
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            if node.is_leaf() {
                return Ok(cur);
            }
            let child = node.child(node.find_child_pos(key, value));
            drop(node);
            drop(guard);
            cur = child;
        }
    }

    // ===== Insertion =====

    /// Insert an entry, overwriting the value of an existing key in
    /// unique mode.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<bool> {
        self.put(key, value, false)
    }

    /// Insert only if no matching entry exists; returns false (and
    /// leaves the tree untouched) when one does.
    pub fn insert_if_absent(&mut self, key: i64, value: i64) -> Result<bool> {
        self.put(key, value, true)
    }

    fn put(&mut self, key: i64, value: i64, only_if_absent: bool) -> Result<bool> {
        self.bump_mods();

        // Proactive split keeps every node on the descent path non-full,
        // so insertion never has to recurse back up. A key that widens
        // the shared prefix can leave a fresh half still too full, hence
        // the re-check after each split.
        loop {
            let root_full = {
                let guard = self.pool.read(self.root)?;
                let x = guard.node().would_overflow_after_insert(key);
                x
            };
            if !root_full {
                break;
            }
            self.split_root(key)?;
        }

        let mut path = Vec::new();
        let mut cur = self.root;
        loop {
            let mut child_id = {
                let guard = self.pool.read(cur)?;
                let node = guard.node();
                if node.is_leaf() {
                    break;
                }
                node.child(node.find_child_pos(key, value))
            };

            loop {
                let child_full = {
                    let guard = self.pool.read(child_id)?;
                    let x = guard.node().would_overflow_after_insert(key);
                    x
                };
                if !child_full {
                    break;
                }
                self.split_child(cur, child_id, key)?;
                // Re-pick the direction against the promoted separator
                child_id = {
                    let guard = self.pool.read(cur)?;
                    let node = guard.node();
                    node.child(node.find_child_pos(key, value))
                };
            }

            path.push(cur);
            cur = child_id;
        }

        let inserted = {
            let guard = self.pool.read_mut(cur)?;
            let mut node = guard.node_mut();
            node.put(key, value, only_if_absent)?
        };
        // Ancestors must be rewritten at commit: copy-on-write renames
        // the mutated leaf underneath them
        for id in path {
            self.pool.mark_dirty(id)?;
        }
        Ok(inserted)
    }

    fn split_child(&mut self, parent_id: PageId, child_id: PageId, key: i64) -> Result<()> {
        let (sibling, sep_key, sep_value) = {
            let guard = self.pool.read_mut(child_id)?;
            let mut child = guard.node_mut();
            let at = child.compute_split_index(key)?;
            if child.is_leaf() {
                child.split_leaf(at)
            } else {
                child.split_inner(at)
            }
        };
        let sibling_id = self.pool.save(sibling)?;
        let guard = self.pool.read_mut(parent_id)?;
        let mut parent = guard.node_mut();
        parent.insert_separator(sep_key, sep_value, sibling_id)
    }

    fn split_root(&mut self, key: i64) -> Result<()> {
        let old_root = self.root;
        let (sibling, sep_key, sep_value) = {
            let guard = self.pool.read_mut(old_root)?;
            let mut node = guard.node_mut();
            let at = node.compute_split_index(key)?;
            node.set_root(false);
            if node.is_leaf() {
                node.split_leaf(at)
            } else {
                node.split_inner(at)
            }
        };
        let sibling_id = self.pool.save(sibling)?;
        let new_root = Node::new_inner(self.cfg, true, sep_key, sep_value, old_root, sibling_id);
        self.root = self.pool.save(new_root)?;
        Ok(())
    }

    // ===== Deletion =====

    /// Remove an entry and return its value. Unique trees locate the
    /// victim by key alone; non-unique trees need the exact pair.
    pub fn remove(&mut self, key: i64, value: i64) -> Result<i64> {
        self.bump_mods();

        let mut stack: Vec<(PageId, usize)> = Vec::new();
        let mut cur = self.root;
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            if node.is_leaf() {
                if node.binary_search(key, value).is_err() {
                    return Err(IndexError::KeyNotFound);
                }
                break;
            }
            let pos = node.find_child_pos(key, value);
            let child = node.child(pos);
            drop(node);
            drop(guard);
            stack.push((cur, pos));
            cur = child;
        }

        let old_value = {
            let guard = self.pool.read_mut(cur)?;
            let mut node = guard.node_mut();
            node.remove_entry(key, value)?
        };
        for &(id, _) in &stack {
            self.pool.mark_dirty(id)?;
        }

        self.rebalance(stack, cur)?;
        self.repair_separator(key, value)?;
        self.split_overfull_on_path(key, value)?;
        Ok(old_value)
    }

    /// Separator refreshes can widen a node's shared prefix and push a
    /// full node past the page budget. Every refresh happens on the
    /// descent path of the removed entry, so one top-down sweep splits
    /// whatever no longer fits.
    fn split_overfull_on_path(&mut self, key: i64, value: i64) -> Result<()> {
        loop {
            let mut parent: Option<PageId> = None;
            let mut cur = self.root;
            let overfull = loop {
                let guard = self.pool.read(cur)?;
                let node = guard.node();
                if node.overflows() {
                    break Some((parent, cur));
                }
                if node.is_leaf() {
                    break None;
                }
                let child = node.child(node.find_child_pos(key, value));
                drop(node);
                drop(guard);
                parent = Some(cur);
                cur = child;
            };
            match overfull {
                None => return Ok(()),
                Some((None, _)) => self.split_root(key)?,
                Some((Some(parent_id), child_id)) => self.split_child(parent_id, child_id, key)?,
            }
        }
    }

    fn rebalance(&mut self, mut stack: Vec<(PageId, usize)>, mut cur: PageId) -> Result<()> {
        loop {
            let underfull = {
                let guard = self.pool.read(cur)?;
                let x = guard.node().is_underfull();
                x
            };
            if !underfull {
                return Ok(());
            }
            match stack.pop() {
                Some((parent_id, pos)) => {
                    self.rebalance_at(parent_id, pos)?;
                    cur = parent_id;
                }
                None => return self.shrink_root(),
            }
        }
    }

    /// Fix the underfull child at `pos`: borrow from the left sibling
    /// while it can spare entries, then the right, then merge with a
    /// sibling the child fits into one node with.
    fn rebalance_at(&mut self, parent_id: PageId, pos: usize) -> Result<()> {
        let (node_id, left_id, right_id) = {
            let guard = self.pool.read(parent_id)?;
            let parent = guard.node();
            (
                parent.child(pos),
                (pos > 0).then(|| parent.child(pos - 1)),
                (pos < parent.num_keys()).then(|| parent.child(pos + 1)),
            )
        };

        if let Some(left) = left_id {
            if self.node_has_extra(left)? {
                self.borrow_from_left(parent_id, pos, left, node_id)?;
            }
        }
        if self.node_is_underfull(node_id)? {
            if let Some(right) = right_id {
                if self.node_has_extra(right)? {
                    self.borrow_from_right(parent_id, pos, right, node_id)?;
                }
            }
        }
        if self.node_is_underfull(node_id)? {
            if let Some(left) = left_id {
                if self.fits_together(left, node_id)? {
                    return self.merge_into_left(parent_id, pos, left, node_id);
                }
            }
            if let Some(right) = right_id {
                if self.fits_together(node_id, right)? {
                    return self.merge_into_left(parent_id, pos + 1, node_id, right);
                }
            }
        }
        Ok(())
    }

    fn borrow_from_left(
        &mut self,
        parent_id: PageId,
        pos: usize,
        left_id: PageId,
        node_id: PageId,
    ) -> Result<()> {
        let is_leaf = {
            let guard = self.pool.read(node_id)?;
            let x = guard.node().is_leaf();
            x
        };
        while self.node_is_underfull(node_id)? && self.node_has_extra(left_id)? {
            if is_leaf {
                let (key, value) = {
                    let guard = self.pool.read_mut(left_id)?;
                    let mut left = guard.node_mut();
                    left.pop_back_entry()
                };
                let guard = self.pool.read_mut(node_id)?;
                guard.node_mut().push_front_entry(key, value);
            } else {
                // Rotate through the parent: the old separator descends,
                // the donor's last key takes its place
                let (sep_key, sep_value) = {
                    let guard = self.pool.read(parent_id)?;
                    let parent = guard.node();
                    (parent.key(pos - 1), parent.value(pos - 1))
                };
                let (donor_key, donor_value, donor_child) = {
                    let guard = self.pool.read_mut(left_id)?;
                    let x = guard.node_mut().pop_back_separator();
                    x
                };
                {
                    let guard = self.pool.read_mut(node_id)?;
                    guard.node_mut().push_front_separator(sep_key, sep_value, donor_child);
                }
                let guard = self.pool.read_mut(parent_id)?;
                guard.node_mut().set_separator(pos - 1, donor_key, donor_value);
            }
        }
        if is_leaf {
            // The boundary separator tracks the receiver's new minimum
            let min = {
                let guard = self.pool.read(node_id)?;
                let x = guard.node().min_entry();
                x
            };
            if let Some((min_key, min_value)) = min {
                let guard = self.pool.read_mut(parent_id)?;
                guard.node_mut().set_separator(pos - 1, min_key, min_value);
            }
        }
        Ok(())
    }

    fn borrow_from_right(
        &mut self,
        parent_id: PageId,
        pos: usize,
        right_id: PageId,
        node_id: PageId,
    ) -> Result<()> {
        let is_leaf = {
            let guard = self.pool.read(node_id)?;
            let x = guard.node().is_leaf();
            x
        };
        while self.node_is_underfull(node_id)? && self.node_has_extra(right_id)? {
            if is_leaf {
                let (key, value) = {
                    let guard = self.pool.read_mut(right_id)?;
                    let mut right = guard.node_mut();
                    right.pop_front_entry()
                };
                let guard = self.pool.read_mut(node_id)?;
                guard.node_mut().push_back_entry(key, value);
            } else {
                let (sep_key, sep_value) = {
                    let guard = self.pool.read(parent_id)?;
                    let parent = guard.node();
                    (parent.key(pos), parent.value(pos))
                };
                let (donor_key, donor_value, donor_child) = {
                    let guard = self.pool.read_mut(right_id)?;
                    let x = guard.node_mut().pop_front_separator();
                    x
                };
                {
                    let guard = self.pool.read_mut(node_id)?;
                    guard.node_mut().push_back_separator(sep_key, sep_value, donor_child);
                }
                let guard = self.pool.read_mut(parent_id)?;
                guard.node_mut().set_separator(pos, donor_key, donor_value);
            }
        }
        if is_leaf {
            let min = {
                let guard = self.pool.read(right_id)?;
                let x = guard.node().min_entry();
                x
            };
            if let Some((min_key, min_value)) = min {
                let guard = self.pool.read_mut(parent_id)?;
                guard.node_mut().set_separator(pos, min_key, min_value);
            }
        }
        Ok(())
    }

    /// Merge the child at `right_pos` into its left sibling, dropping
    /// the separator between them. Leaves discard the separator; inner
    /// nodes absorb it.
    fn merge_into_left(
        &mut self,
        parent_id: PageId,
        right_pos: usize,
        left_id: PageId,
        right_id: PageId,
    ) -> Result<()> {
        let (sep_key, sep_value, removed) = {
            let guard = self.pool.read_mut(parent_id)?;
            let mut parent = guard.node_mut();
            parent.remove_separator(right_pos - 1)
        };
        debug_assert_eq!(removed, right_id);

        let right = {
            let guard = self.pool.read(right_id)?;
            let x = guard.node().clone();
            x
        };
        {
            let guard = self.pool.read_mut(left_id)?;
            guard.node_mut().absorb_right(right, sep_key, sep_value);
        }
        self.pool.delete(right_id)
    }

    /// A root left with zero keys and one child is replaced by that
    /// child; the old root page is freed.
    fn shrink_root(&mut self) -> Result<()> {
        loop {
            let collapse = {
                let guard = self.pool.read(self.root)?;
                let node = guard.node();
                (!node.is_leaf() && node.num_keys() == 0).then(|| node.child(0))
            };
            let Some(child) = collapse else {
                return Ok(());
            };
            {
                let guard = self.pool.read_mut(child)?;
                guard.node_mut().set_root(true);
            }
            self.pool.delete(self.root)?;
            self.root = child;
        }
    }

    /// After a delete, the one ancestor separator that referenced the
    /// removed entry as its subtree minimum is refreshed from the leaf
    /// level. Descending by the removed entry still works because a
    /// stale separator equals it exactly.
    fn repair_separator(&self, key: i64, value: i64) -> Result<()> {
        let mut anchor: Option<(PageId, usize)> = None;
        let mut cur = self.root;
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            if node.is_leaf() {
                break;
            }
            let pos = node.find_child_pos(key, value);
            if pos > 0 {
                anchor = Some((cur, pos));
            }
            let child = node.child(pos);
            drop(node);
            drop(guard);
            cur = child;
        }

        let Some((anchor_id, pos)) = anchor else {
            return Ok(());
        };
        let subtree = {
            let guard = self.pool.read(anchor_id)?;
            let x = guard.node().child(pos);
            x
        };
        let Some((min_key, min_value)) = self.subtree_min(subtree)? else {
            return Ok(());
        };
        let stale = {
            let guard = self.pool.read(anchor_id)?;
            let node = guard.node();
            if self.cfg.unique {
                node.key(pos - 1) != min_key
            } else {
                (node.key(pos - 1), node.value(pos - 1)) != (min_key, min_value)
            }
        };
        if stale {
            let guard = self.pool.read_mut(anchor_id)?;
            guard.node_mut().set_separator(pos - 1, min_key, min_value);
        }
        Ok(())
    }

    /// Smallest entry in the subtree rooted at `id`
    fn subtree_min(&self, mut cur: PageId) -> Result<Option<(i64, i64)>> {
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            if node.is_leaf() {
                return Ok(node.min_entry());
            }
            let child = node.child(0);
            drop(node);
            drop(guard);
            cur = child;
        }
    }

    fn node_is_underfull(&self, id: PageId) -> Result<bool> {
        let guard = self.pool.read(id)?;
        let x = Ok(guard.node().is_underfull());
        x
    }

    fn node_has_extra(&self, id: PageId) -> Result<bool> {
        let guard = self.pool.read(id)?;
        let x = Ok(guard.node().has_extra_keys());
        x
    }

    fn fits_together(&self, left: PageId, right: PageId) -> Result<bool> {
        let left_guard = self.pool.read(left)?;
        let left_node = left_guard.node();
        let right_guard = self.pool.read(right)?;
        let right_node = right_guard.node();
        Ok(left_node.fits_into_one_node_with(&right_node))
    }

    // ===== Iterators =====

    /// Ascending iterator over the whole tree
    pub fn iter(&self) -> Result<crate::tree::LeafIterator> {
        crate::tree::LeafIterator::new(self, false, None, None)
    }

    /// Ascending iterator over keys in the inclusive range `[start, end]`
    pub fn range(&self, start: Option<i64>, end: Option<i64>) -> Result<crate::tree::LeafIterator> {
        crate::tree::LeafIterator::new(
            self,
            false,
            start.map(|key| (key, i64::MIN)),
            end.map(|key| (key, i64::MAX)),
        )
    }

    /// Ascending iterator from an exact (key, value) lower bound
    /// (non-unique trees)
    pub fn range_from(&self, key: i64, value: i64) -> Result<crate::tree::LeafIterator> {
        crate::tree::LeafIterator::new(self, false, Some((key, value)), None)
    }

    /// Descending iterator over the whole tree
    pub fn descending_iter(&self) -> Result<crate::tree::LeafIterator> {
        crate::tree::LeafIterator::new(self, true, None, None)
    }

    /// Descending iterator over keys in the inclusive range `[start, end]`
    pub fn descending_range(
        &self,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<crate::tree::LeafIterator> {
        crate::tree::LeafIterator::new(
            self,
            true,
            start.map(|key| (key, i64::MIN)),
            end.map(|key| (key, i64::MAX)),
        )
    }

    // ===== Commit support =====

    /// Copy-on-write flush of every dirty node under the root; the
    /// returned id is what the enclosing storage persists.
    pub fn write_root(&mut self) -> Result<PageId> {
        let new_root = self.pool.write(self.root)?;
        self.root = new_root;
        Ok(new_root)
    }

    /// Point the tree at the root recorded by the channel (open and
    /// rollback path), materializing an empty root leaf for a fresh
    /// database.
    pub fn reload_root(&mut self) -> Result<()> {
        let stored = self.pool.root_page();
        self.root = if stored.is_valid() && stored != PageId::HEADER {
            stored
        } else {
            self.pool.save(Node::new_leaf(self.cfg, true))?
        };
        Ok(())
    }

    /// Trace a lookup through the tree, one line per visited page
    pub fn debug_search(&self, key: i64) -> Result<Vec<String>> {
        let mut trace = Vec::new();
        trace.push(format!("Searching for key {key}"));
        trace.push(format!("Root page: {}", self.root));

        let mut cur = self.root;
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            trace.push(format!(
                "  Page {}: leaf={}, keys={}, size={}B",
                cur,
                node.is_leaf(),
                node.num_keys(),
                node.current_size()
            ));
            if node.is_leaf() {
                match node.binary_search(key, 0) {
                    Ok(pos) => trace.push(format!("  FOUND at slot {pos}, value {}", node.value(pos))),
                    Err(_) => trace.push("  NOT FOUND in leaf".to_string()),
                }
                return Ok(trace);
            }
            let pos = node.find_child_pos(key, 0);
            let child = node.child(pos);
            trace.push(format!("  -> descending to child {child} (slot {pos})"));
            drop(node);
            drop(guard);
            cur = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileChannel;
    use rand::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::{tempdir, TempDir};

    fn create_tree(cfg: TreeConfig) -> Result<(BTree, TempDir)> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");
        let channel = Arc::new(FileChannel::open(&path, cfg, false)?);
        let pool = Arc::new(BufferManagerImpl::new(channel, cfg, 64));
        let tree = BTree::new(pool, cfg)?;
        Ok((tree, dir))
    }

    fn load(tree: &BTree, id: PageId) -> Node {
        let guard = tree.pool.read(id).unwrap();
        let node = guard.node().clone();
        node
    }

    /// In-order entries of the whole tree
    fn collect(tree: &BTree) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        collect_subtree(tree, tree.root, &mut out);
        out
    }

    fn collect_subtree(tree: &BTree, id: PageId, out: &mut Vec<(i64, i64)>) {
        let node = load(tree, id);
        if node.is_leaf() {
            for i in 0..node.num_keys() {
                out.push((node.key(i), node.value(i)));
            }
        } else {
            for i in 0..=node.num_keys() {
                collect_subtree(tree, node.child(i), out);
            }
        }
    }

    /// Structural invariants: sortedness, page budget, child counts and
    /// separator placement. Returns the subtree's (min, max) span.
    fn check_invariants(tree: &BTree) {
        let root = load(tree, tree.root);
        assert!(root.is_root());
        check_node(tree, &root);
        if !root.is_leaf() {
            assert!(root.num_keys() >= 1, "inner root must have two children");
        }
    }

    fn check_node(tree: &BTree, node: &Node) -> (Option<(i64, i64)>, Option<(i64, i64)>) {
        assert!(
            node.current_size() <= tree.cfg.page_size,
            "node over page budget: {} > {}",
            node.current_size(),
            tree.cfg.page_size
        );
        for i in 1..node.num_keys() {
            let prev = (node.key(i - 1), node.value(i - 1));
            let cur = (node.key(i), node.value(i));
            if tree.cfg.unique {
                assert!(prev.0 < cur.0, "keys not strictly sorted");
            } else {
                assert!(prev < cur, "(key, value) pairs not strictly sorted");
            }
        }

        if node.is_leaf() {
            return (node.min_entry(), node.max_entry());
        }

        assert_eq!(node.num_children(), node.num_keys() + 1);
        let spans: Vec<(Option<(i64, i64)>, Option<(i64, i64)>)> = (0..=node.num_keys())
            .map(|i| {
                let child = load(tree, node.child(i));
                assert!(!child.is_root());
                check_node(tree, &child)
            })
            .collect();

        for i in 1..=node.num_keys() {
            let sep = (node.key(i - 1), node.value(i - 1));
            let min = spans[i].0.expect("non-root subtree holds at least one entry");
            if tree.cfg.unique {
                assert_eq!(sep.0, min.0, "separator must equal the right subtree minimum");
            } else {
                assert_eq!(sep, min, "separator must equal the right subtree minimum");
            }
            if let Some(prev_max) = spans[i - 1].1 {
                if tree.cfg.unique {
                    assert!(prev_max.0 < sep.0, "left subtree reaches past the separator");
                } else {
                    assert!(prev_max < sep, "left subtree reaches past the separator");
                }
            }
        }
        (
            spans.first().and_then(|span| span.0),
            spans.last().and_then(|span| span.1),
        )
    }

    #[test]
    fn test_empty_tree() -> Result<()> {
        let (tree, _dir) = create_tree(TreeConfig::new(128, true, 8))?;
        assert!(matches!(tree.search(1), Err(IndexError::KeyNotFound)));
        assert!(!tree.contains(1, 0)?);
        assert_eq!(tree.height()?, 1);
        Ok(())
    }

    #[test]
    fn test_single_page_inserts_and_search() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(128, true, 8))?;

        for key in [5i64, 2, 8, 1, 9, 3] {
            assert!(tree.insert(key, key * 10)?);
        }
        assert_eq!(
            collect(&tree),
            vec![(1, 10), (2, 20), (3, 30), (5, 50), (8, 80), (9, 90)]
        );
        assert_eq!(tree.search(5)?, 50);
        assert!(matches!(tree.search(6), Err(IndexError::KeyNotFound)));
        check_invariants(&tree);
        Ok(())
    }

    #[test]
    fn test_overwrite_and_insert_if_absent() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(128, true, 8))?;

        tree.insert(1, 10)?;
        assert!(tree.insert(1, 11)?);
        assert_eq!(tree.search(1)?, 11);

        assert!(!tree.insert_if_absent(1, 12)?);
        assert_eq!(tree.search(1)?, 11);
        Ok(())
    }

    #[test]
    fn test_insert_if_absent_leaves_pages_byte_identical() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(128, true, 8))?;
        for key in 1..30 {
            tree.insert(key, key * 2)?;
        }

        let before = snapshot_pages(&tree);
        assert!(!tree.insert_if_absent(15, 999)?);
        assert_eq!(snapshot_pages(&tree), before);
        Ok(())
    }

    fn snapshot_pages(tree: &BTree) -> Vec<(PageId, Vec<u8>)> {
        let mut out = Vec::new();
        snapshot_subtree(tree, tree.root, &mut out);
        out
    }

    fn snapshot_subtree(tree: &BTree, id: PageId, out: &mut Vec<(PageId, Vec<u8>)>) {
        let node = load(tree, id);
        let mut buf = vec![0u8; tree.cfg.page_size];
        node.write_page(&mut buf).unwrap();
        out.push((id, buf));
        if !node.is_leaf() {
            for i in 0..=node.num_keys() {
                snapshot_subtree(tree, node.child(i), out);
            }
        }
    }

    #[test]
    fn test_sequential_inserts_split_and_stay_sorted() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(128, true, 8))?;

        for key in 1..=100i64 {
            tree.insert(key, key * 10)?;
        }
        assert!(tree.height()? >= 2);
        let root = load(&tree, tree.root);
        assert!(!root.is_leaf());

        assert_eq!(tree.remove(50, 500)?, 500);
        assert!(matches!(tree.search(50), Err(IndexError::KeyNotFound)));

        let entries = collect(&tree);
        assert_eq!(entries.len(), 99);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        check_invariants(&tree);
        Ok(())
    }

    #[test]
    fn test_non_unique_duplicate_keys() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(128, false, 8))?;

        tree.insert(10, 1)?;
        tree.insert(10, 2)?;
        tree.insert(10, 3)?;
        tree.insert(20, 1)?;

        assert_eq!(tree.remove(10, 2)?, 2);
        assert_eq!(collect(&tree), vec![(10, 1), (10, 3), (20, 1)]);
        assert!(tree.contains(10, 3)?);
        assert!(!tree.contains(10, 2)?);
        check_invariants(&tree);
        Ok(())
    }

    #[test]
    fn test_first_root_split_promotes_middle() -> Result<()> {
        // The page budget admits seven keys; the eighth forces a split
        let (mut tree, _dir) = create_tree(TreeConfig::new(72, true, 8))?;

        for key in 1..=8i64 {
            tree.insert(key, key * 10)?;
        }

        let root = load(&tree, tree.root);
        assert!(!root.is_leaf());
        assert_eq!(root.num_keys(), 1);
        assert_eq!(root.key(0), 5);

        let left = load(&tree, root.child(0));
        let right = load(&tree, root.child(1));
        assert_eq!(left.keys, vec![1, 2, 3, 4]);
        assert_eq!(right.keys, vec![5, 6, 7, 8]);
        check_invariants(&tree);
        Ok(())
    }

    #[test]
    fn test_delete_everything_collapses_to_empty_root_leaf() -> Result<()> {
        for unique in [true, false] {
            let (mut tree, _dir) = create_tree(TreeConfig::new(128, unique, 8))?;
            let mut rng = StdRng::seed_from_u64(11);

            let mut entries: Vec<(i64, i64)> = (0..200).map(|i| (i % 50, i)).collect();
            entries.shuffle(&mut rng);
            let mut inserted = Vec::new();
            for &(k, v) in &entries {
                if tree.insert_if_absent(k, v)? {
                    inserted.push((k, v));
                }
            }
            check_invariants(&tree);

            inserted.shuffle(&mut rng);
            for &(k, v) in &inserted {
                tree.remove(k, v)?;
            }

            let root = load(&tree, tree.root);
            assert!(root.is_leaf());
            assert_eq!(root.num_keys(), 0);
            assert_eq!(tree.height()?, 1);
        }
        Ok(())
    }

    #[test]
    fn test_randomized_against_model_unique() -> Result<()> {
        for page_size in [128usize, 512, 4096] {
            let (mut tree, _dir) = create_tree(TreeConfig::new(page_size, true, 8))?;
            let mut model: BTreeMap<i64, i64> = BTreeMap::new();
            let mut rng = StdRng::seed_from_u64(page_size as u64);

            for round in 0..400 {
                let key = rng.gen_range(-100..100);
                if rng.gen_bool(0.6) {
                    let value = rng.gen_range(-1000..1000);
                    tree.insert(key, value)?;
                    model.insert(key, value);
                } else {
                    match tree.remove(key, model.get(&key).copied().unwrap_or(0)) {
                        Ok(value) => {
                            assert_eq!(model.remove(&key), Some(value));
                        }
                        Err(IndexError::KeyNotFound) => {
                            assert!(!model.contains_key(&key));
                        }
                        Err(other) => return Err(other),
                    }
                }
                if round % 25 == 0 {
                    check_invariants(&tree);
                }
            }

            check_invariants(&tree);
            let expected: Vec<(i64, i64)> = model.iter().map(|(&k, &v)| (k, v)).collect();
            assert_eq!(collect(&tree), expected);
            for (&k, &v) in &model {
                assert_eq!(tree.search(k)?, v);
            }
        }
        Ok(())
    }

    #[test]
    fn test_randomized_against_model_non_unique() -> Result<()> {
        for page_size in [128usize, 512] {
            let (mut tree, _dir) = create_tree(TreeConfig::new(page_size, false, 8))?;
            let mut model: BTreeSet<(i64, i64)> = BTreeSet::new();
            let mut rng = StdRng::seed_from_u64(page_size as u64 + 1);

            for round in 0..400 {
                let key = rng.gen_range(0..40);
                let value = rng.gen_range(0..20);
                if rng.gen_bool(0.6) {
                    tree.insert(key, value)?;
                    model.insert((key, value));
                } else {
                    match tree.remove(key, value) {
                        Ok(removed) => {
                            assert_eq!(removed, value);
                            assert!(model.remove(&(key, value)));
                        }
                        Err(IndexError::KeyNotFound) => {
                            assert!(!model.contains(&(key, value)));
                        }
                        Err(other) => return Err(other),
                    }
                }
                if round % 25 == 0 {
                    check_invariants(&tree);
                }
            }

            check_invariants(&tree);
            let expected: Vec<(i64, i64)> = model.iter().copied().collect();
            assert_eq!(collect(&tree), expected);
        }
        Ok(())
    }

    #[test]
    fn test_negative_keys() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(128, true, 8))?;

        for key in -50..50i64 {
            tree.insert(key, key)?;
        }
        check_invariants(&tree);

        let entries = collect(&tree);
        assert_eq!(entries.first(), Some(&(-50, -50)));
        assert_eq!(entries.last(), Some(&(49, 49)));
        assert_eq!(tree.search(-17)?, -17);
        Ok(())
    }

    #[test]
    fn test_modification_count_bumps_on_every_mutation() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(128, true, 8))?;
        let m0 = tree.modification_count();

        tree.insert(1, 1)?;
        assert_eq!(tree.modification_count(), m0 + 1);

        // A failed remove still counts as a mutation attempt
        assert!(tree.remove(9, 0).is_err());
        assert_eq!(tree.modification_count(), m0 + 2);
        Ok(())
    }

    #[test]
    fn test_debug_search_traces_the_path() -> Result<()> {
        let (mut tree, _dir) = create_tree(TreeConfig::new(72, true, 8))?;
        for key in 1..=20i64 {
            tree.insert(key, key)?;
        }

        let trace = tree.debug_search(13)?;
        assert!(trace.iter().any(|line| line.contains("FOUND")));
        let trace = tree.debug_search(99)?;
        assert!(trace.iter().any(|line| line.contains("NOT FOUND")));
        Ok(())
    }

    #[test]
    fn test_search_requires_unique_mode() -> Result<()> {
        let (tree, _dir) = create_tree(TreeConfig::new(128, false, 8))?;
        assert!(matches!(tree.search(1), Err(IndexError::InvariantViolation(_))));
        Ok(())
    }
}
