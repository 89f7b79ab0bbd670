//! Transaction-aware leaf iterators.
//!
//! A cursor holds nothing but page ids: a descent stack of
//! `(page id, child position)` pairs plus a position inside the current
//! leaf, so it never pins nodes and re-reads leaves through the buffer
//! manager on every step (an evicted leaf is simply loaded again).
//!
//! Every step validates the `(transaction id, modification count)` pair
//! captured at construction: the snapshot the cursor was opened against
//! must still be current, otherwise the caller gets
//! `IteratorInvalidatedByCommit` or `ConcurrentModification` instead of
//! stale data.

use crate::buffer::{BufferManager, BufferManagerImpl};
use crate::error::{IndexError, Result};
use crate::tree::registry::IterHandle;
use crate::tree::BTree;
use crate::types::PageId;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A directional cursor over leaf entries, bounded on both sides
pub struct LeafIterator {
    pool: Arc<BufferManagerImpl>,
    mods: Arc<AtomicU64>,
    handle: Arc<IterHandle>,
    unique: bool,
    descending: bool,
    /// Inclusive lower bound; unique mode compares keys alone
    start: (i64, i64),
    /// Inclusive upper bound
    end: (i64, i64),
    tx_id: u64,
    expected_mods: u64,
    /// Ancestors of the current leaf with the child slot taken in each
    stack: Vec<(PageId, usize)>,
    leaf: PageId,
    pos: usize,
    finished: bool,
}

impl LeafIterator {
    pub(crate) fn new(
        tree: &BTree,
        descending: bool,
        start: Option<(i64, i64)>,
        end: Option<(i64, i64)>,
    ) -> Result<Self> {
        let mut iter = Self {
            pool: Arc::clone(tree.pool()),
            mods: Arc::clone(tree.mod_counter()),
            handle: tree.registry().register(),
            unique: tree.config().unique,
            descending,
            start: start.unwrap_or((i64::MIN, i64::MIN)),
            end: end.unwrap_or((i64::MAX, i64::MAX)),
            tx_id: tree.pool().transaction_id(),
            expected_mods: tree.modification_count(),
            stack: Vec::new(),
            leaf: PageId::INVALID,
            pos: 0,
            finished: false,
        };
        iter.seek(tree.root_page())?;
        Ok(iter)
    }

    /// Whether another entry within the bounds is available
    pub fn has_next(&mut self) -> Result<bool> {
        self.check_valid()?;
        if self.finished {
            return Ok(false);
        }
        let entry = self.current()?;
        if self.past_bound(entry) {
            self.finished = true;
            return Ok(false);
        }
        Ok(true)
    }

    /// Yield the next entry, or `None` when the range is exhausted
    pub fn next_entry(&mut self) -> Result<Option<(i64, i64)>> {
        self.check_valid()?;
        if self.finished {
            return Ok(None);
        }

        let entry = self.current()?;
        if self.past_bound(entry) {
            self.finished = true;
            return Ok(None);
        }

        let leaf_len = {
            let guard = self.pool.read(self.leaf)?;
            let x = guard.node().num_keys();
            x
        };
        if self.descending {
            if self.pos > 0 {
                self.pos -= 1;
            } else {
                self.step_leaf()?;
            }
        } else if self.pos + 1 < leaf_len {
            self.pos += 1;
        } else {
            self.step_leaf()?;
        }
        Ok(Some(entry))
    }

    /// Release the cursor. Safe to call more than once; any later use
    /// reports invalidation.
    pub fn close(&mut self) {
        self.handle.close();
        self.stack.clear();
        self.leaf = PageId::INVALID;
        self.finished = true;
    }

    fn current(&self) -> Result<(i64, i64)> {
        let guard = self.pool.read(self.leaf)?;
        let node = guard.node();
        Ok((node.key(self.pos), node.value(self.pos)))
    }

    fn check_valid(&self) -> Result<()> {
        if self.handle.is_closed() || self.tx_id != self.pool.transaction_id() {
            return Err(IndexError::IteratorInvalidatedByCommit);
        }
        if self.expected_mods != self.mods.load(Ordering::SeqCst) {
            return Err(IndexError::ConcurrentModification);
        }
        Ok(())
    }

    fn cmp_bound(&self, entry: (i64, i64), bound: (i64, i64)) -> CmpOrdering {
        if self.unique {
            entry.0.cmp(&bound.0)
        } else {
            entry.cmp(&bound)
        }
    }

    fn past_bound(&self, entry: (i64, i64)) -> bool {
        if self.descending {
            self.cmp_bound(entry, self.start) == CmpOrdering::Less
        } else {
            self.cmp_bound(entry, self.end) == CmpOrdering::Greater
        }
    }

    /// Position on the first in-range entry, descending along the bound
    fn seek(&mut self, root: PageId) -> Result<()> {
        let bound = if self.descending { self.end } else { self.start };
        let mut cur = root;
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            if node.is_leaf() {
                let found = match node.binary_search(bound.0, bound.1) {
                    Ok(pos) => Some(pos),
                    Err(pos) if self.descending => pos.checked_sub(1),
                    Err(pos) if pos < node.num_keys() => Some(pos),
                    Err(_) => None,
                };
                drop(node);
                drop(guard);
                match found {
                    Some(pos) => {
                        self.leaf = cur;
                        self.pos = pos;
                    }
                    // The bound cuts this leaf off entirely; continue in
                    // the neighbor (an empty leaf is the empty root)
                    None => {
                        self.leaf = cur;
                        self.step_leaf()?;
                    }
                }
                return Ok(());
            }
            let pos = node.find_child_pos(bound.0, bound.1);
            let child = node.child(pos);
            drop(node);
            drop(guard);
            self.stack.push((cur, pos));
            cur = child;
        }
    }

    /// Move to the adjacent leaf in iteration direction, popping and
    /// re-descending along the ancestor stack
    fn step_leaf(&mut self) -> Result<()> {
        while let Some((ancestor, pos)) = self.stack.pop() {
            let next = {
                let guard = self.pool.read(ancestor)?;
                let node = guard.node();
                if self.descending {
                    pos.checked_sub(1).map(|p| (p, node.child(p)))
                } else if pos < node.num_keys() {
                    Some((pos + 1, node.child(pos + 1)))
                } else {
                    None
                }
            };
            if let Some((new_pos, child)) = next {
                self.stack.push((ancestor, new_pos));
                return self.descend_edge(child);
            }
        }
        self.finished = true;
        Ok(())
    }

    /// Descend to the nearest leaf edge: leftmost when ascending,
    /// rightmost when descending
    fn descend_edge(&mut self, start: PageId) -> Result<()> {
        let mut cur = start;
        loop {
            let guard = self.pool.read(cur)?;
            let node = guard.node();
            if node.is_leaf() {
                if node.num_keys() == 0 {
                    self.finished = true;
                } else {
                    self.leaf = cur;
                    self.pos = if self.descending { node.num_keys() - 1 } else { 0 };
                }
                return Ok(());
            }
            let pos = if self.descending { node.num_keys() } else { 0 };
            let child = node.child(pos);
            drop(node);
            drop(guard);
            self.stack.push((cur, pos));
            cur = child;
        }
    }
}

impl Iterator for LeafIterator {
    type Item = Result<(i64, i64)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
